use crate::types::{DataType, NodeId};

pub type Result<T> = std::result::Result<T, MeshredError>;

#[derive(Debug, thiserror::Error)]
pub enum MeshredError {
    #[error("side length {side} is not a power of two")]
    InvalidSideLength { side: u32 },

    #[error("mesh of {nodes} nodes exceeds the {max}-block mask width")]
    MeshTooLarge { nodes: u32, max: u32 },

    #[error("block size must be at least one element")]
    EmptyBlock,

    #[error("{segments} sync segments do not evenly divide {blocks} blocks")]
    InvalidSegmentCount { segments: u32, blocks: u32 },

    #[error("expected {expected} input vectors, got {actual}")]
    InputCountMismatch { expected: usize, actual: usize },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType {
        dtype: DataType,
        op: &'static str,
    },

    #[error("node {node} timed out after {timeout_ms}ms waiting for {what} at step {step}")]
    HandshakeTimeout {
        node: NodeId,
        step: u32,
        what: &'static str,
        timeout_ms: u64,
    },

    #[error("node {node} pipeline endpoint closed: {endpoint}")]
    PipelineClosed {
        node: NodeId,
        endpoint: &'static str,
    },

    #[error("pipeline task panicked: {0}")]
    TaskPanicked(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl MeshredError {
    /// Create a `HandshakeTimeout` from the wait site's context.
    pub(crate) fn timeout(
        node: NodeId,
        step: u32,
        what: &'static str,
        timeout: std::time::Duration,
    ) -> Self {
        Self::HandshakeTimeout {
            node,
            step,
            what,
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}
