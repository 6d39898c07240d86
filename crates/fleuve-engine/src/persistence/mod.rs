//! Persistence layer: the event store contract and its implementations

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{
    AppendOutcome, AppendRequest, EventStore, Snapshot, StoreError, SyncDbWork, SyncTxn,
};
