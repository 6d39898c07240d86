//! Workflow definitions: typed traits, events, state, subscriptions
//!
//! A workflow type is a set of pure functions (`decide`, `evolve`) over
//! user-defined payloads. The engine stores payloads as opaque JSON with a
//! type-tag discriminator; [`registry::TypedHandler`] bridges the typed and
//! erased worlds.

pub mod definition;
pub mod event;
pub mod registry;
pub mod state;
pub mod subscription;

pub use definition::{DecideContext, Decision, Rejection, TypeTag, UpcastError, Workflow};
pub use event::{
    CommandEnvelope, DelayFire, DelayRequest, EventMetadata, EventRecord, NewEvent, SystemEvent,
    WorkflowId,
};
pub use registry::{
    DecideError, DecidedBatch, HandlerRegistry, RegistryError, TypedHandler, WorkflowHandler,
};
pub use state::{EvolveError, InstanceState, Lifecycle};
pub use subscription::{Subscription, WILDCARD};
