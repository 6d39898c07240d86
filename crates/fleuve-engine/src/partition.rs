//! Partitioning of workflow ids across runner processes
//!
//! The hash is MD5 over the workflow id's raw octets, taking the first 8
//! digest bytes big-endian modulo the partition count. This choice is pinned
//! forever: it decides which reader owns which workflow, so changing it (or
//! the byte encoding) silently re-homes every workflow in a deployment.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::persistence::{EventStore, StoreError};
use crate::workflow::WorkflowId;

/// Stable hash of a workflow id into `0..total`.
pub fn partition(workflow_id: &WorkflowId, total: u32) -> u32 {
    debug_assert!(total > 0);
    let digest = md5::compute(workflow_id.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.0[..8]);
    (u64::from_be_bytes(prefix) % u64::from(total)) as u32
}

/// One partition out of a fixed total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    pub index: u32,
    pub total: u32,
}

impl Partition {
    pub fn new(index: u32, total: u32) -> Self {
        debug_assert!(index < total);
        Self { index, total }
    }

    /// The trivial single-partition layout.
    pub fn solo() -> Self {
        Self { index: 0, total: 1 }
    }

    /// All partitions of a layout, in index order.
    pub fn all(total: u32) -> Vec<Partition> {
        (0..total).map(|index| Partition { index, total }).collect()
    }

    /// Whether this partition homes the given workflow.
    pub fn contains(&self, workflow_id: &WorkflowId) -> bool {
        partition(workflow_id, self.total) == self.index
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.of.{}", self.index, self.total)
    }
}

/// Canonical durable name for a reader group's partition member.
///
/// Runner readers use the workflow type as the group; the activity executor
/// uses `{workflow_type}.actions`.
pub fn reader_name(group: &str, index: u32, total: u32) -> String {
    format!("{group}.{index}.of.{total}")
}

/// Outcome of one offset migration, for operator logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub group: String,
    pub old_total: u32,
    pub new_total: u32,
    /// New reader name → initial offset written.
    pub offsets: Vec<(String, i64)>,
    /// Old reader names whose offset rows were deleted.
    pub deleted: Vec<String>,
}

/// Migrate one reader group's offsets from `old_total` to `new_total`
/// partitions.
///
/// Callers must have stopped every runner of the group first, so all offsets
/// are final. Scale-up starts every index beyond the old range at the
/// minimum old offset (nothing can be skipped); scale-down raises each
/// surviving index to at least the maximum offset among removed readers
/// (re-processing instead of loss). Either direction renames every reader,
/// since the total is part of the name.
#[instrument(skip(store))]
pub async fn rebalance(
    store: &Arc<dyn EventStore>,
    group: &str,
    old_total: u32,
    new_total: u32,
) -> Result<RebalanceReport, StoreError> {
    let mut old_offsets: HashMap<u32, i64> = HashMap::new();
    for index in 0..old_total {
        let name = reader_name(group, index, old_total);
        if let Some(offset) = store.load_offset(&name).await? {
            old_offsets.insert(index, offset);
        }
    }

    let min_old = old_offsets.values().copied().min().unwrap_or(0);
    let removed_max = (new_total..old_total)
        .filter_map(|index| old_offsets.get(&index).copied())
        .max();

    if let Some(removed_max) = removed_max {
        let spread = removed_max - old_offsets.values().copied().min().unwrap_or(removed_max);
        if spread > 0 {
            warn!(
                group,
                spread, "scale-down re-processes events within the offset spread"
            );
        }
    }

    let mut offsets = Vec::with_capacity(new_total as usize);
    for index in 0..new_total {
        let carried = old_offsets.get(&index).copied();
        let offset = match (carried, removed_max) {
            // Surviving index on scale-down: never fall behind a removed
            // reader that may have owned workflows now homed here.
            (Some(own), Some(removed)) => own.max(removed),
            (Some(own), None) => own,
            // Fresh index on scale-up: start where the slowest old reader
            // was, so nothing is skipped.
            (None, _) => min_old,
        };

        let name = reader_name(group, index, new_total);
        let previous = store.load_offset(&name).await?;
        store.commit_offset(&name, previous, offset).await?;
        offsets.push((name, offset));
    }

    // Old and new names only collide when the total is unchanged, in which
    // case the rebalance is a no-op rename-wise and nothing gets deleted.
    let mut deleted = Vec::new();
    if old_total != new_total {
        for index in 0..old_total {
            let name = reader_name(group, index, old_total);
            store.delete_offset(&name).await?;
            deleted.push(name);
        }
    }

    info!(group, old_total, new_total, "rebalanced reader offsets");

    Ok(RebalanceReport {
        group: group.to_string(),
        old_total,
        new_total,
        offsets,
        deleted,
    })
}
