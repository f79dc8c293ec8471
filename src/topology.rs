//! Partner and direction derivation for the two torus schedules.
//!
//! Every node derives the same global schedule locally from pure
//! functions of `(node, step)` — no communication is involved, and the
//! results are memoizable. Steps alternate between the horizontal and
//! vertical torus axes; the two schedules differ in how far along the
//! active axis the partner sits and how that distance evolves.

use crate::types::{AlgorithmKind, NodeId};

/// An L×L torus. Row/column arithmetic wraps at the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Torus {
    side: u32,
}

impl Torus {
    /// Create a torus with the given side length. Callers are expected to
    /// have validated the side (power of two, within mask width) via
    /// [`AllReduceConfig::validate`](crate::config::AllReduceConfig::validate).
    pub fn new(side: u32) -> Self {
        debug_assert!(side >= 1 && side.is_power_of_two());
        Self { side }
    }

    pub const fn side(&self) -> u32 {
        self.side
    }

    pub const fn total_nodes(&self) -> u32 {
        self.side * self.side
    }

    /// Communication steps per phase: log2(N).
    pub const fn algo_steps(&self) -> u32 {
        self.total_nodes().trailing_zeros()
    }

    pub const fn row(&self, node: NodeId) -> u32 {
        node / self.side
    }

    pub const fn col(&self, node: NodeId) -> u32 {
        node % self.side
    }

    pub const fn node_at(&self, row: u32, col: u32) -> NodeId {
        row * self.side + col
    }
}

/// A node's communication assignment for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLink {
    /// The partner exchanged with this step.
    pub peer: NodeId,
    /// True when this node's signed move along the active axis points
    /// east/south. Exactly one end of each pair has this set, and it
    /// selects which of the node's two transport roles transmits.
    pub sends_forward: bool,
}

/// Resolve the communication partner and duplex direction for `node` at
/// `step` under the given schedule.
///
/// Symmetric by construction: the partner's link at the same step points
/// back at `node` with the complementary direction bit.
pub fn partner_and_direction(
    torus: Torus,
    node: NodeId,
    step: u32,
    kind: AlgorithmKind,
) -> PeerLink {
    debug_assert!(node < torus.total_nodes());
    debug_assert!(step < torus.algo_steps());
    match kind {
        AlgorithmKind::RecursiveDoubling => recdub_link(torus, node, step),
        AlgorithmKind::Swing => swing_link(torus, node, step),
    }
}

/// Recursive doubling on the 2D torus: the pass distance along the active
/// axis doubles only after a full horizontal+vertical pair of steps, and
/// the lower half of each distance group sends forward.
fn recdub_link(torus: Torus, node: NodeId, step: u32) -> PeerLink {
    let horizontal = step % 2 == 0;
    let depth = 1u32 << (step / 2);
    let row = torus.row(node);
    let col = torus.col(node);
    let pos = if horizontal { col } else { row };

    let forward = pos % (2 * depth) < depth;
    let peer_pos = if forward { pos + depth } else { pos - depth };

    let peer = if horizontal {
        torus.node_at(row, peer_pos)
    } else {
        torus.node_at(peer_pos, col)
    };
    PeerLink {
        peer,
        sends_forward: forward,
    }
}

/// Straight-line swing distance for axis-step `k`: 1, -1, 3, -5, 11, …
/// (alternating sign, magnitude roughly doubling).
fn swing_distance(k: u32) -> i64 {
    (1 - (-2i64).pow(k + 1)) / 3
}

/// Swing on the 2D torus: axes alternate every step, the distance follows
/// [`swing_distance`] of the pair index, and the sign flips with the
/// node's parity along the active axis. Positions wrap modulo the side.
fn swing_link(torus: Torus, node: NodeId, step: u32) -> PeerLink {
    let horizontal = step % 2 == 0;
    let k = step / 2;
    let dist = swing_distance(k);

    let row = torus.row(node);
    let col = torus.col(node);
    let pos = if horizontal { col } else { row };
    let offset = if pos % 2 == 0 { dist } else { -dist };

    let side = torus.side() as i64;
    let peer_pos = (pos as i64 + offset).rem_euclid(side) as u32;

    let peer = if horizontal {
        torus.node_at(row, peer_pos)
    } else {
        torus.node_at(peer_pos, col)
    };
    PeerLink {
        peer,
        sends_forward: offset > 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_links(side: u32, kind: AlgorithmKind) -> Vec<(NodeId, u32, PeerLink)> {
        let torus = Torus::new(side);
        let mut out = Vec::new();
        for node in 0..torus.total_nodes() {
            for step in 0..torus.algo_steps() {
                out.push((node, step, partner_and_direction(torus, node, step, kind)));
            }
        }
        out
    }

    #[test]
    fn test_partner_symmetric_both_kinds() {
        for kind in [AlgorithmKind::RecursiveDoubling, AlgorithmKind::Swing] {
            for side in [2, 4, 8] {
                let torus = Torus::new(side);
                for (node, step, link) in all_links(side, kind) {
                    let back = partner_and_direction(torus, link.peer, step, kind);
                    assert_eq!(
                        back.peer, node,
                        "{kind} L={side}: partner of partner of {node} at step {step}"
                    );
                    assert_ne!(
                        back.sends_forward, link.sends_forward,
                        "{kind} L={side}: pair ({node},{}) shares a direction at step {step}",
                        link.peer
                    );
                }
            }
        }
    }

    #[test]
    fn test_partner_never_self() {
        for kind in [AlgorithmKind::RecursiveDoubling, AlgorithmKind::Swing] {
            for (node, step, link) in all_links(8, kind) {
                assert_ne!(link.peer, node, "{kind}: self-link at ({node},{step})");
            }
        }
    }

    #[test]
    fn test_recdub_2x2_table() {
        let torus = Torus::new(2);
        let k = AlgorithmKind::RecursiveDoubling;
        // Step 0 is horizontal at depth 1, step 1 vertical at depth 1.
        assert_eq!(
            partner_and_direction(torus, 0, 0, k),
            PeerLink { peer: 1, sends_forward: true }
        );
        assert_eq!(
            partner_and_direction(torus, 1, 0, k),
            PeerLink { peer: 0, sends_forward: false }
        );
        assert_eq!(
            partner_and_direction(torus, 0, 1, k),
            PeerLink { peer: 2, sends_forward: true }
        );
        assert_eq!(
            partner_and_direction(torus, 3, 1, k),
            PeerLink { peer: 1, sends_forward: false }
        );
    }

    #[test]
    fn test_recdub_depth_doubles_per_axis_pair() {
        let torus = Torus::new(4);
        let k = AlgorithmKind::RecursiveDoubling;
        // Node 0: steps 0,1 exchange at distance 1; steps 2,3 at distance 2.
        assert_eq!(partner_and_direction(torus, 0, 0, k).peer, 1);
        assert_eq!(partner_and_direction(torus, 0, 1, k).peer, 4);
        assert_eq!(partner_and_direction(torus, 0, 2, k).peer, 2);
        assert_eq!(partner_and_direction(torus, 0, 3, k).peer, 8);
    }

    #[test]
    fn test_swing_distance_sequence() {
        assert_eq!(swing_distance(0), 1);
        assert_eq!(swing_distance(1), -1);
        assert_eq!(swing_distance(2), 3);
        assert_eq!(swing_distance(3), -5);
        assert_eq!(swing_distance(4), 11);
    }

    #[test]
    fn test_swing_4x4_first_steps() {
        let torus = Torus::new(4);
        let k = AlgorithmKind::Swing;
        // Node 0 (row 0, col 0): step 0 goes east to col 1, step 1 south
        // to row 1, step 2 (distance -1) wraps west to col 3.
        assert_eq!(partner_and_direction(torus, 0, 0, k).peer, 1);
        assert_eq!(partner_and_direction(torus, 0, 1, k).peer, 4);
        assert_eq!(partner_and_direction(torus, 0, 2, k).peer, 3);
        assert_eq!(partner_and_direction(torus, 0, 3, k).peer, 12);
        // Node 5 (row 1, col 1, both odd): signs flip on both axes.
        assert_eq!(partner_and_direction(torus, 5, 0, k).peer, 4);
        assert_eq!(partner_and_direction(torus, 5, 1, k).peer, 1);
        assert_eq!(partner_and_direction(torus, 5, 2, k).peer, 6);
        assert_eq!(partner_and_direction(torus, 5, 3, k).peer, 9);
    }

    #[test]
    fn test_swing_direction_parity_pattern() {
        // On an 8x8 torus the six direction bits per node collapse to four
        // patterns keyed by (col parity, row parity).
        let torus = Torus::new(8);
        let expected = |col_even: bool, row_even: bool| -> u32 {
            match (col_even, row_even) {
                (true, true) => 0b110011,
                (false, true) => 0b100110,
                (true, false) => 0b011001,
                (false, false) => 0b001100,
            }
        };
        for node in 0..torus.total_nodes() {
            let mut bits = 0u32;
            for step in 0..torus.algo_steps() {
                let link = partner_and_direction(torus, node, step, AlgorithmKind::Swing);
                if link.sends_forward {
                    bits |= 1 << step;
                }
            }
            let col_even = torus.col(node) % 2 == 0;
            let row_even = torus.row(node) % 2 == 0;
            assert_eq!(
                bits,
                expected(col_even, row_even),
                "direction bits for node {node}"
            );
        }
    }

    #[test]
    fn test_schedule_is_deterministic() {
        for kind in [AlgorithmKind::RecursiveDoubling, AlgorithmKind::Swing] {
            assert_eq!(all_links(4, kind), all_links(4, kind));
        }
    }
}
