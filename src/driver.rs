//! Collective driver: validates configuration, precomputes every node's
//! schedule, runs the per-node pipelines to completion, and hands back
//! the reduced vectors.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::AllReduceConfig;
use crate::error::{MeshredError, Result};
use crate::fabric::MemFabric;
use crate::pipeline::{compute_role, transport_role, NodeCtx};
use crate::schedule::NodeSchedule;
use crate::sync::segment_queue;
use crate::topology::Torus;
use crate::types::{NodeId, Role};

/// A fully planned AllReduce collective.
///
/// Construction validates the configuration and derives the immutable
/// per-node step plans; [`run`](Self::run) executes them. The same
/// instance can run any number of times — the plans never change.
pub struct AllReduce {
    cfg: Arc<AllReduceConfig>,
    torus: Torus,
    schedules: Vec<Arc<NodeSchedule>>,
}

impl AllReduce {
    pub fn new(cfg: AllReduceConfig) -> Result<Self> {
        cfg.validate()?;
        let torus = Torus::new(cfg.side_length);
        let schedules = (0..torus.total_nodes())
            .map(|node| {
                Arc::new(NodeSchedule::build(
                    torus,
                    cfg.algorithm,
                    cfg.variant,
                    node,
                    cfg.num_sync_segments,
                ))
            })
            .collect();
        Ok(Self {
            cfg: Arc::new(cfg),
            torus,
            schedules,
        })
    }

    pub fn config(&self) -> &AllReduceConfig {
        &self.cfg
    }

    /// The precomputed plan list for one node.
    pub fn schedule(&self, node: NodeId) -> &NodeSchedule {
        &self.schedules[node as usize]
    }

    /// Run the collective. `inputs[i]` is node i's full input vector,
    /// encoded per the configured dtype; the returned vector i is node
    /// i's copy of the global reduction.
    ///
    /// Spawns three tasks per node (two transport roles plus compute)
    /// against a shared in-process fabric and joins them all. Any
    /// configuration or liveness fault aborts the whole collective; a
    /// partially reduced vector is never returned.
    pub async fn run(&self, inputs: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let nodes = self.torus.total_nodes() as usize;
        if inputs.len() != nodes {
            return Err(MeshredError::InputCountMismatch {
                expected: nodes,
                actual: inputs.len(),
            });
        }
        let vector_bytes = self.cfg.vector_bytes();
        for buf in &inputs {
            if buf.len() != vector_bytes {
                return Err(MeshredError::BufferSizeMismatch {
                    expected: vector_bytes,
                    actual: buf.len(),
                });
            }
        }
        // A single node already holds the reduction of its own input.
        if nodes == 1 {
            return Ok(inputs);
        }

        tracing::debug!(
            nodes,
            algorithm = %self.cfg.algorithm,
            variant = %self.cfg.variant,
            segments = self.cfg.num_sync_segments,
            "starting collective"
        );

        let ordinals = self.schedules[0].plans.len();
        let fabric = Arc::new(MemFabric::new(
            self.torus.total_nodes(),
            vector_bytes,
            ordinals,
        ));

        let mut transport_handles = Vec::with_capacity(2 * nodes);
        let mut compute_handles = Vec::with_capacity(nodes);
        for (node, input) in inputs.into_iter().enumerate() {
            let ctx = NodeCtx {
                node: node as NodeId,
                schedule: Arc::clone(&self.schedules[node]),
                fabric: Arc::clone(&fabric),
                cfg: Arc::clone(&self.cfg),
            };
            let (primary_tx, primary_rx) = mpsc::channel(1);
            let (secondary_tx, secondary_rx) = mpsc::channel(1);
            let (seg_tx, seg_rx) = segment_queue(self.cfg.num_sync_segments as usize);

            transport_handles.push(tokio::spawn(transport_role(
                ctx.clone(),
                Role::Primary,
                primary_rx,
                seg_tx.clone(),
            )));
            transport_handles.push(tokio::spawn(transport_role(
                ctx.clone(),
                Role::Secondary,
                secondary_rx,
                seg_tx,
            )));
            compute_handles.push(tokio::spawn(compute_role(
                ctx,
                input,
                primary_tx,
                secondary_tx,
                seg_rx,
            )));
        }

        // Join everything before surfacing any error: every wait in the
        // pipeline is bounded, so a fault on one node unwinds the rest
        // within the handshake timeout instead of leaking tasks.
        let transports = futures::future::join_all(transport_handles).await;
        let computes = futures::future::join_all(compute_handles).await;

        for joined in transports {
            joined.map_err(|e| MeshredError::TaskPanicked(e.to_string()))??;
        }
        let mut outputs = Vec::with_capacity(nodes);
        for joined in computes {
            outputs.push(joined.map_err(|e| MeshredError::TaskPanicked(e.to_string()))??);
        }

        tracing::debug!(nodes, "collective complete");
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlgorithmKind, Variant};

    #[test]
    fn test_new_rejects_bad_config() {
        let cfg = AllReduceConfig {
            side_length: 3,
            ..Default::default()
        };
        assert!(AllReduce::new(cfg).is_err());
    }

    #[test]
    fn test_schedules_cover_all_nodes() {
        let cfg = AllReduceConfig {
            side_length: 4,
            algorithm: AlgorithmKind::Swing,
            variant: Variant::BandwidthOptimal,
            num_sync_segments: 4,
            ..Default::default()
        };
        let ar = AllReduce::new(cfg).unwrap();
        for node in 0..16 {
            let sched = ar.schedule(node);
            assert_eq!(sched.node, node);
            assert_eq!(sched.plans.len(), 8);
        }
    }

    #[tokio::test]
    async fn test_run_rejects_wrong_input_count() {
        let ar = AllReduce::new(AllReduceConfig::default()).unwrap();
        let err = ar.run(vec![vec![0u8; 512]; 3]).await.unwrap_err();
        assert!(matches!(err, MeshredError::InputCountMismatch { .. }));
    }

    #[tokio::test]
    async fn test_run_rejects_wrong_vector_size() {
        let ar = AllReduce::new(AllReduceConfig::default()).unwrap();
        let err = ar.run(vec![vec![0u8; 7]; 4]).await.unwrap_err();
        assert!(matches!(err, MeshredError::BufferSizeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_single_node_passthrough() {
        let cfg = AllReduceConfig {
            side_length: 1,
            block_elems: 4,
            ..Default::default()
        };
        let ar = AllReduce::new(cfg).unwrap();
        let input = crate::reduce::encode_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        let out = ar.run(vec![input.clone()]).await.unwrap();
        assert_eq!(out, vec![input]);
    }
}
