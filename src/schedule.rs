//! Precomputed per-node step plans: partners, block masks, and coalesced
//! transfer runs.
//!
//! Everything here is derived once at collective setup from pure
//! functions of the configuration and held immutable for the run. The
//! bandwidth-optimal masks mark, for each step, every block whose final
//! destination still requires it to pass through the current transfer;
//! they are obtained by unrolling the partner chain over all remaining
//! steps.

use std::ops::Range;

use crate::topology::{partner_and_direction, PeerLink, Torus};
use crate::types::{AlgorithmKind, NodeId, Role, Variant};

/// A set of data blocks, one bit per block.
///
/// The backing word bounds the mesh at 64 nodes; a wider mesh needs a
/// wider bitset and is rejected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockSet(u64);

impl BlockSet {
    /// Maximum number of blocks representable.
    pub const CAPACITY: u32 = u64::BITS;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// The set of all blocks `0..n`.
    pub const fn full(n: u32) -> Self {
        if n >= Self::CAPACITY {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    pub const fn of(block: u32) -> Self {
        Self(1u64 << block)
    }

    pub fn insert(&mut self, block: u32) {
        debug_assert!(block < Self::CAPACITY);
        self.0 |= 1 << block;
    }

    pub const fn contains(self, block: u32) -> bool {
        block < Self::CAPACITY && (self.0 >> block) & 1 == 1
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bit representation, low bit = block 0.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Coalesce the set bits inside `span` into maximal contiguous runs.
    /// A run ends at the first clear bit or at the span boundary,
    /// whichever comes first.
    pub fn runs_within(self, span: Range<u32>) -> Vec<BlockRun> {
        let mut runs = Vec::new();
        let mut block = span.start;
        while block < span.end {
            if !self.contains(block) {
                block += 1;
                continue;
            }
            let start = block;
            while block < span.end && self.contains(block) {
                block += 1;
            }
            runs.push(BlockRun {
                start,
                len: block - start,
            });
        }
        runs
    }
}

impl std::fmt::Display for BlockSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A maximal contiguous range of blocks moved as one transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRun {
    pub start: u32,
    pub len: u32,
}

/// Which phase of the collective a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Exchange + reduce. Bandwidth-optimal: each node converges on sole
    /// ownership of its own block. Latency-optimal: every step carries the
    /// full vector and this is the only phase.
    ReduceScatter,
    /// Reverse-order redistribution of fully reduced blocks; pure data
    /// movement, no reduction.
    AllGather,
}

/// One sync-span of a step's transfer, with its coalesced runs
/// precomputed for both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    /// Block range covered by this span.
    pub span: Range<u32>,
    /// Runs this node writes to the peer when it is the active sender.
    pub send_runs: Vec<BlockRun>,
    /// Runs this node copies out of staging when it is the receiver.
    pub recv_runs: Vec<BlockRun>,
}

/// A node's complete communication assignment for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    pub phase: Phase,
    /// Algorithm step index within the phase (allgather counts down).
    pub step: u32,
    pub peer: NodeId,
    /// Transport role that transmits for this node this step.
    pub sender: Role,
    pub send_blocks: BlockSet,
    pub recv_blocks: BlockSet,
    pub segments: Vec<SegmentPlan>,
}

/// The full plan list one node executes, reduce-scatter steps first,
/// then (bandwidth-optimal only) the allgather steps in reverse order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSchedule {
    pub node: NodeId,
    pub plans: Vec<StepPlan>,
}

/// The set of nodes reachable from `node` through the partner chains of
/// steps `step..S`: its partner at each remaining step, plus everything
/// reachable from that partner one step later.
pub fn reachable_set(torus: Torus, kind: AlgorithmKind, node: NodeId, step: u32) -> BlockSet {
    let mut acc = BlockSet::empty();
    collect_reachable(torus, kind, node, step, &mut acc);
    acc
}

fn collect_reachable(
    torus: Torus,
    kind: AlgorithmKind,
    node: NodeId,
    step: u32,
    acc: &mut BlockSet,
) {
    for s in step..torus.algo_steps() {
        let peer = partner_and_direction(torus, node, s, kind).peer;
        acc.insert(peer);
        collect_reachable(torus, kind, peer, s + 1, acc);
    }
}

/// Blocks `node` must transmit at reduce-scatter step `step`: the blocks
/// whose eventual owner sits on the peer's side of the exchange.
pub fn send_mask(torus: Torus, kind: AlgorithmKind, node: NodeId, step: u32) -> BlockSet {
    let peer = partner_and_direction(torus, node, step, kind).peer;
    BlockSet::of(peer).union(reachable_set(torus, kind, peer, step + 1))
}

/// Blocks `node` receives and reduces at reduce-scatter step `step`.
/// Dual of [`send_mask`]: `send_mask(node, s) == recv_mask(peer, s)`.
pub fn recv_mask(torus: Torus, kind: AlgorithmKind, node: NodeId, step: u32) -> BlockSet {
    BlockSet::of(node).union(reachable_set(torus, kind, node, step + 1))
}

impl NodeSchedule {
    /// Build the complete, immutable plan list for one node.
    pub fn build(
        torus: Torus,
        kind: AlgorithmKind,
        variant: Variant,
        node: NodeId,
        num_segments: u32,
    ) -> Self {
        let steps = torus.algo_steps();
        let total = torus.total_nodes();
        let mut plans = Vec::with_capacity(match variant {
            Variant::LatencyOptimal => steps as usize,
            Variant::BandwidthOptimal => 2 * steps as usize,
        });

        for s in 0..steps {
            let link = partner_and_direction(torus, node, s, kind);
            let (send, recv) = match variant {
                Variant::LatencyOptimal => (BlockSet::full(total), BlockSet::full(total)),
                Variant::BandwidthOptimal => (
                    send_mask(torus, kind, node, s),
                    recv_mask(torus, kind, node, s),
                ),
            };
            plans.push(make_plan(Phase::ReduceScatter, s, link, send, recv, total, num_segments));
        }

        if variant == Variant::BandwidthOptimal {
            // The allgather traverses the same pairs in reverse order. At
            // step s a node holds exactly the blocks the reduce-scatter
            // recv mask named, so it forwards those and acquires the
            // peer's set.
            for s in (0..steps).rev() {
                let link = partner_and_direction(torus, node, s, kind);
                let send = recv_mask(torus, kind, node, s);
                let recv = recv_mask(torus, kind, link.peer, s);
                plans.push(make_plan(Phase::AllGather, s, link, send, recv, total, num_segments));
            }
        }

        Self { node, plans }
    }
}

fn make_plan(
    phase: Phase,
    step: u32,
    link: PeerLink,
    send_blocks: BlockSet,
    recv_blocks: BlockSet,
    total_blocks: u32,
    num_segments: u32,
) -> StepPlan {
    debug_assert!(num_segments >= 1 && total_blocks % num_segments == 0);
    let stride = total_blocks / num_segments;
    let segments = (0..num_segments)
        .map(|i| {
            let span = i * stride..(i + 1) * stride;
            SegmentPlan {
                send_runs: send_blocks.runs_within(span.clone()),
                recv_runs: recv_blocks.runs_within(span.clone()),
                span,
            }
        })
        .collect();
    StepPlan {
        phase,
        step,
        peer: link.peer,
        sender: if link.sends_forward {
            Role::Primary
        } else {
            Role::Secondary
        },
        send_blocks,
        recv_blocks,
        segments,
    }
}
