//! In-process communication fabric.
//!
//! Stands in for the mesh interconnect: every node owns a staging buffer
//! that remote peers write into at block offsets, plus a bank of
//! monotonic semaphores addressable by `(node, slot, step ordinal)`.
//! Slots are per-ordinal so that signals from different peers in
//! neighboring steps can never be confused — a pipeline-skewed peer two
//! steps ahead increments a different counter, not a shared one.
//!
//! Writes complete synchronously, so the write barrier is a no-op kept
//! for the transport contract; a fabric backed by real hardware would
//! fence there.

use std::sync::Mutex;
use std::time::Duration;

use crate::error::{MeshredError, Result};
use crate::sync::Counter;
use crate::types::NodeId;

/// Semaphore kinds in each node's bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemSlot {
    /// Incremented by a remote sender announcing a pending transfer.
    Request,
    /// Incremented by the remote receiver once it reserved buffer space.
    Ready,
    /// Incremented by the remote sender after each completed segment.
    Progress,
}

struct Endpoint {
    staging: Mutex<Vec<u8>>,
    request: Vec<Counter>,
    ready: Vec<Counter>,
    progress: Vec<Counter>,
}

impl Endpoint {
    fn sem(&self, slot: SemSlot, ordinal: usize) -> &Counter {
        match slot {
            SemSlot::Request => &self.request[ordinal],
            SemSlot::Ready => &self.ready[ordinal],
            SemSlot::Progress => &self.progress[ordinal],
        }
    }
}

/// The shared fabric connecting all nodes of one collective.
pub struct MemFabric {
    endpoints: Vec<Endpoint>,
}

impl MemFabric {
    /// Create a fabric for `nodes` endpoints with `staging_bytes` of
    /// inbound staging each and semaphore banks covering `ordinals` step
    /// ordinals.
    pub fn new(nodes: u32, staging_bytes: usize, ordinals: usize) -> Self {
        let bank = |n: usize| (0..n).map(|_| Counter::new()).collect::<Vec<_>>();
        let endpoints = (0..nodes)
            .map(|_| Endpoint {
                staging: Mutex::new(vec![0u8; staging_bytes]),
                request: bank(ordinals),
                ready: bank(ordinals),
                progress: bank(ordinals),
            })
            .collect();
        Self { endpoints }
    }

    /// Remote write into `dst`'s staging buffer at `offset`.
    pub fn write(&self, dst: NodeId, offset: usize, data: &[u8]) -> Result<()> {
        let mut staging = self.endpoints[dst as usize]
            .staging
            .lock()
            .map_err(|_| MeshredError::LockPoisoned("staging"))?;
        let end = offset + data.len();
        if end > staging.len() {
            return Err(MeshredError::BufferSizeMismatch {
                expected: staging.len(),
                actual: end,
            });
        }
        staging[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Completion fence for preceding writes.
    pub fn write_barrier(&self) {}

    /// Increment a semaphore on `node`.
    pub fn signal(&self, node: NodeId, slot: SemSlot, ordinal: usize) {
        self.endpoints[node as usize].sem(slot, ordinal).increment();
    }

    /// Wait for a semaphore on `node` to reach `target`. Returns false on
    /// timeout.
    pub async fn wait(
        &self,
        node: NodeId,
        slot: SemSlot,
        ordinal: usize,
        target: u64,
        timeout: Duration,
    ) -> bool {
        self.endpoints[node as usize]
            .sem(slot, ordinal)
            .wait_at_least(target, timeout)
            .await
    }

    /// Copy a range out of `node`'s own staging buffer.
    pub fn read_staging(&self, node: NodeId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let staging = self.endpoints[node as usize]
            .staging
            .lock()
            .map_err(|_| MeshredError::LockPoisoned("staging"))?;
        let end = offset + len;
        if end > staging.len() {
            return Err(MeshredError::BufferSizeMismatch {
                expected: staging.len(),
                actual: end,
            });
        }
        Ok(staging[offset..end].to_vec())
    }
}
