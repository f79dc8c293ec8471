//! Per-node pipeline: two duplex transport roles and a compute role.
//!
//! All three are long-lived tasks iterating the same precomputed plan
//! list. At each step the plan names one role the active sender; the
//! other becomes a passive receiver that watches for arriving segments
//! and feeds them to compute. Data moves only through the fabric's
//! staging buffers and the bounded segment queue; the accumulator is
//! owned by compute alone.
//!
//! Semaphore thresholds are derived, never tuned: every plan ordinal has
//! its own semaphore slots, so the rendezvous waits target count 1 and
//! segment progress waits target `seg + 1`. Counters stay monotonic for
//! the whole collective; nothing is ever reset mid-run.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::AllReduceConfig;
use crate::error::{MeshredError, Result};
use crate::fabric::{MemFabric, SemSlot};
use crate::reduce::reduce_slice;
use crate::schedule::{NodeSchedule, Phase};
use crate::sync::{QueueError, SegmentConsumer, SegmentProducer};
use crate::types::{NodeId, Role};

/// Snapshot of the accumulator handed to the step's active sender.
///
/// Producing it is the intra-node rendezvous: compute emits the snapshot
/// only once the previous step is fully drained, so the sender can never
/// transmit half-reduced data.
#[derive(Debug)]
pub(crate) struct StepPayload {
    pub data: Vec<u8>,
}

/// One received sync-span, forwarded from the passive receiver to
/// compute. Pushed even when no blocks landed in the span, keeping the
/// per-step segment count fixed.
#[derive(Debug)]
pub(crate) struct SegmentMsg {
    /// `(first block, bytes)` per coalesced run.
    pub runs: Vec<(u32, Vec<u8>)>,
}

/// Everything a role task needs about its node, shared by all three.
#[derive(Clone)]
pub(crate) struct NodeCtx {
    pub node: NodeId,
    pub schedule: Arc<NodeSchedule>,
    pub fabric: Arc<MemFabric>,
    pub cfg: Arc<AllReduceConfig>,
}

/// One transport role. Active sender on the steps whose plan names it,
/// passive receiver on the others.
pub(crate) async fn transport_role(
    ctx: NodeCtx,
    role: Role,
    mut payloads: mpsc::Receiver<StepPayload>,
    segments_out: SegmentProducer<SegmentMsg>,
) -> Result<()> {
    let block_bytes = ctx.cfg.block_bytes();
    let timeout = ctx.cfg.handshake_timeout;

    for (ordinal, plan) in ctx.schedule.plans.iter().enumerate() {
        if plan.sender == role {
            // Active sender. The payload arrives only once compute has
            // drained the previous step.
            let payload = payloads.recv().await.ok_or(MeshredError::PipelineClosed {
                node: ctx.node,
                endpoint: "step payload",
            })?;

            // Two-phase rendezvous: announce, then wait for the peer's
            // receiver to grant write credit.
            ctx.fabric.signal(plan.peer, SemSlot::Request, ordinal);
            if !ctx
                .fabric
                .wait(ctx.node, SemSlot::Ready, ordinal, 1, timeout)
                .await
            {
                tracing::warn!(
                    node = ctx.node,
                    step = plan.step,
                    peer = plan.peer,
                    "rendezvous stalled; aborting collective"
                );
                return Err(MeshredError::timeout(ctx.node, plan.step, "peer ready", timeout));
            }

            for seg in &plan.segments {
                for run in &seg.send_runs {
                    let off = run.start as usize * block_bytes;
                    let len = run.len as usize * block_bytes;
                    ctx.fabric.write(plan.peer, off, &payload.data[off..off + len])?;
                }
                ctx.fabric.write_barrier();
                ctx.fabric.signal(plan.peer, SemSlot::Progress, ordinal);
            }
            tracing::trace!(
                node = ctx.node,
                step = plan.step,
                peer = plan.peer,
                role = %role,
                "transmit complete"
            );
        } else {
            // Passive receiver: acknowledge the peer's request, reserve a
            // full step of queue capacity, and only then grant credit.
            if !ctx
                .fabric
                .wait(ctx.node, SemSlot::Request, ordinal, 1, timeout)
                .await
            {
                return Err(MeshredError::timeout(ctx.node, plan.step, "peer request", timeout));
            }
            let mut permits = segments_out
                .reserve(plan.segments.len(), timeout)
                .await
                .map_err(|e| queue_error(&ctx, plan.step, "segment queue reserve", e))?;
            ctx.fabric.signal(plan.peer, SemSlot::Ready, ordinal);

            for (seg_idx, seg) in plan.segments.iter().enumerate() {
                let target = seg_idx as u64 + 1;
                if !ctx
                    .fabric
                    .wait(ctx.node, SemSlot::Progress, ordinal, target, timeout)
                    .await
                {
                    return Err(MeshredError::timeout(
                        ctx.node,
                        plan.step,
                        "segment progress",
                        timeout,
                    ));
                }
                let mut runs = Vec::with_capacity(seg.recv_runs.len());
                for run in &seg.recv_runs {
                    let off = run.start as usize * block_bytes;
                    let len = run.len as usize * block_bytes;
                    runs.push((run.start, ctx.fabric.read_staging(ctx.node, off, len)?));
                }
                let permit = permits.next().ok_or(MeshredError::PipelineClosed {
                    node: ctx.node,
                    endpoint: "segment queue permit",
                })?;
                permit.send(SegmentMsg { runs });
            }
        }
    }
    Ok(())
}

/// The compute role. Owns the accumulator for the whole collective:
/// hands the active sender its per-step snapshot, then drains and applies
/// segments as they arrive, overlapping reduction with the transfer of
/// later segments.
pub(crate) async fn compute_role(
    ctx: NodeCtx,
    mut accumulator: Vec<u8>,
    primary_payloads: mpsc::Sender<StepPayload>,
    secondary_payloads: mpsc::Sender<StepPayload>,
    mut segments_in: SegmentConsumer<SegmentMsg>,
) -> Result<Vec<u8>> {
    let elem_bytes = ctx.cfg.dtype.size_in_bytes();
    let timeout = ctx.cfg.handshake_timeout;

    for plan in &ctx.schedule.plans {
        let payload_tx = match plan.sender {
            Role::Primary => &primary_payloads,
            Role::Secondary => &secondary_payloads,
        };
        payload_tx
            .send(StepPayload {
                data: accumulator.clone(),
            })
            .await
            .map_err(|_| MeshredError::PipelineClosed {
                node: ctx.node,
                endpoint: "step payload",
            })?;

        for _ in 0..plan.segments.len() {
            let msg = segments_in
                .pop(timeout)
                .await
                .map_err(|e| queue_error(&ctx, plan.step, "segment queue", e))?;
            for (start, bytes) in msg.runs {
                let off = start as usize * ctx.cfg.block_bytes();
                let dst = &mut accumulator[off..off + bytes.len()];
                match plan.phase {
                    Phase::ReduceScatter => {
                        reduce_slice(dst, &bytes, bytes.len() / elem_bytes, ctx.cfg.dtype, ctx.cfg.op)?;
                    }
                    // Allgather segments arrive fully reduced; pure copy.
                    Phase::AllGather => dst.copy_from_slice(&bytes),
                }
            }
        }
        tracing::debug!(
            node = ctx.node,
            step = plan.step,
            phase = ?plan.phase,
            "step drained"
        );
    }
    Ok(accumulator)
}

fn queue_error(ctx: &NodeCtx, step: u32, what: &'static str, e: QueueError) -> MeshredError {
    match e {
        QueueError::TimedOut => MeshredError::timeout(ctx.node, step, what, ctx.cfg.handshake_timeout),
        QueueError::Closed => MeshredError::PipelineClosed {
            node: ctx.node,
            endpoint: what,
        },
    }
}
