//! Collective shape and tuning parameters.
//!
//! Shape fields (torus size, block size, algorithm, variant) describe the
//! collective being run; tuning fields have sensible defaults and can be
//! overridden via environment variables (prefixed `MESHRED_`).

use std::time::Duration;

use crate::error::{MeshredError, Result};
use crate::reduce;
use crate::schedule::BlockSet;
use crate::types::{AlgorithmKind, DataType, ReduceOp, Variant};

/// Full configuration for one AllReduce collective.
#[derive(Debug, Clone)]
pub struct AllReduceConfig {
    /// Torus side length L; the mesh has L×L nodes. Must be a power of two.
    pub side_length: u32,

    /// Elements per data block. The vector carries one block per node.
    pub block_elems: usize,

    /// Element type of the data vectors.
    pub dtype: DataType,

    /// Reduction applied across nodes.
    pub op: ReduceOp,

    /// Partner-selection schedule.
    pub algorithm: AlgorithmKind,

    /// Latency- or bandwidth-optimal execution.
    pub variant: Variant,

    /// Number of contiguous spans each step's transfer is divided into.
    /// Reduction of span k overlaps the transfer of span k+1; a value of 1
    /// is correct but fully serializes transfer then reduction.
    pub num_sync_segments: u32,

    /// Bound on every semaphore and queue wait. A wait that exceeds this
    /// aborts the whole collective; there are no partial results.
    pub handshake_timeout: Duration,
}

impl Default for AllReduceConfig {
    fn default() -> Self {
        Self {
            side_length: 2,
            block_elems: 32,
            dtype: DataType::F32,
            op: ReduceOp::Sum,
            algorithm: AlgorithmKind::RecursiveDoubling,
            variant: Variant::LatencyOptimal,
            num_sync_segments: 1,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl AllReduceConfig {
    /// Apply tuning overrides from environment variables, falling back to
    /// the current values.
    ///
    /// Recognized variables:
    /// - `MESHRED_NUM_SYNC_SEGMENTS`
    /// - `MESHRED_HANDSHAKE_TIMEOUT_SECS`
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("MESHRED_NUM_SYNC_SEGMENTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.num_sync_segments = n;
            }
        }
        if let Ok(v) = std::env::var("MESHRED_HANDSHAKE_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                self.handshake_timeout = Duration::from_secs(s);
            }
        }
        self
    }

    /// Total number of nodes N = L².
    pub const fn total_nodes(&self) -> u32 {
        self.side_length * self.side_length
    }

    /// Total number of data blocks (one per node).
    pub const fn total_blocks(&self) -> u32 {
        self.total_nodes()
    }

    /// Communication steps per phase: log2(N). Only meaningful after
    /// [`validate`](Self::validate) confirmed N is a power of two.
    pub const fn algo_steps(&self) -> u32 {
        self.total_nodes().trailing_zeros()
    }

    /// Elements in one node's data vector.
    pub const fn vector_elems(&self) -> usize {
        self.total_blocks() as usize * self.block_elems
    }

    /// Bytes in one block.
    pub const fn block_bytes(&self) -> usize {
        self.block_elems * self.dtype.size_in_bytes()
    }

    /// Bytes in one node's data vector.
    pub const fn vector_bytes(&self) -> usize {
        self.vector_elems() * self.dtype.size_in_bytes()
    }

    /// Check the configuration invariants. All violations here are fatal
    /// setup errors; nothing is recoverable at run time.
    pub fn validate(&self) -> Result<()> {
        if self.side_length == 0 || !self.side_length.is_power_of_two() {
            return Err(MeshredError::InvalidSideLength {
                side: self.side_length,
            });
        }
        let nodes = self.total_nodes();
        if nodes > BlockSet::CAPACITY {
            return Err(MeshredError::MeshTooLarge {
                nodes,
                max: BlockSet::CAPACITY,
            });
        }
        if self.block_elems == 0 {
            return Err(MeshredError::EmptyBlock);
        }
        let blocks = self.total_blocks();
        if self.num_sync_segments == 0
            || self.num_sync_segments > blocks
            || blocks % self.num_sync_segments != 0
        {
            return Err(MeshredError::InvalidSegmentCount {
                segments: self.num_sync_segments,
                blocks,
            });
        }
        if !reduce::supports(self.dtype) {
            return Err(MeshredError::UnsupportedDType {
                dtype: self.dtype,
                op: "reduce",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AllReduceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_side() {
        let cfg = AllReduceConfig {
            side_length: 3,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(MeshredError::InvalidSideLength { side: 3 })
        ));
    }

    #[test]
    fn test_rejects_zero_side() {
        let cfg = AllReduceConfig {
            side_length: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_mesh() {
        let cfg = AllReduceConfig {
            side_length: 16,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(MeshredError::MeshTooLarge { nodes: 256, max: 64 })
        ));
    }

    #[test]
    fn test_rejects_indivisible_segments() {
        let cfg = AllReduceConfig {
            side_length: 2,
            num_sync_segments: 3,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(MeshredError::InvalidSegmentCount {
                segments: 3,
                blocks: 4
            })
        ));
    }

    #[test]
    fn test_rejects_unreducible_dtype() {
        let cfg = AllReduceConfig {
            dtype: DataType::BF16,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(MeshredError::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn test_derived_sizes() {
        let cfg = AllReduceConfig {
            side_length: 4,
            block_elems: 8,
            dtype: DataType::F32,
            ..Default::default()
        };
        assert_eq!(cfg.total_nodes(), 16);
        assert_eq!(cfg.algo_steps(), 4);
        assert_eq!(cfg.vector_elems(), 128);
        assert_eq!(cfg.block_bytes(), 32);
        assert_eq!(cfg.vector_bytes(), 512);
    }

    #[test]
    fn test_single_node_mesh_valid() {
        let cfg = AllReduceConfig {
            side_length: 1,
            num_sync_segments: 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.algo_steps(), 0);
    }
}
