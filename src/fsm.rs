//! Finite-state machines over bytes, with rule-reference edges.
//!
//! Two representations:
//! - [`Fsm`]: mutable, built on the intrusive [`graph::Graph`]; used during
//!   construction and for the algebra in [`ops`].
//! - [`CompactFsm`] / [`DfaTable`]: immutable query forms. `CompactFsm`
//!   stores per-state edge lists sorted by range start in CSR layout;
//!   `DfaTable` adds a dense `state × 256` byte table for the matcher hot
//!   path.
//!
//! An [`Automaton`] pairs either form with a start state and accept set.

pub(crate) mod build;
pub(crate) mod graph;
pub(crate) mod ops;

use serde::{Deserialize, Serialize};

use crate::grammar::RuleId;
use graph::Graph;

/// Default cap on states produced by determinization and intersection.
pub const DEFAULT_STATE_BUDGET: usize = 1_000_000;

/// No-transition sentinel in [`DfaTable::byte_table`].
pub(crate) const NO_DFA_STATE: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(pub u32);

/// Edge label of the mutable automaton graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FsmLabel {
    Epsilon,
    /// Inclusive byte range.
    Char { min: u8, max: u8 },
    /// Reference to a grammar rule; consumed by the pushdown matcher, an
    /// opaque symbol for the FSM algebra.
    Rule(u32),
}

/// A resolved edge of a compact automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEdge {
    CharRange { min: u8, max: u8, target: StateId },
    RuleRef { rule: RuleId, target: StateId },
    Epsilon { target: StateId },
}

impl FsmEdge {
    fn from_label(label: FsmLabel, target: StateId) -> Self {
        match label {
            FsmLabel::Epsilon => FsmEdge::Epsilon { target },
            FsmLabel::Char { min, max } => FsmEdge::CharRange { min, max, target },
            FsmLabel::Rule(rule) => FsmEdge::RuleRef {
                rule: RuleId(rule),
                target,
            },
        }
    }

    /// Sort key: char edges first (by range start), then rule edges, then
    /// epsilons, so the binary-search transition only scans a prefix.
    fn sort_key(&self) -> (u8, u32, u32) {
        match self {
            FsmEdge::CharRange { min, .. } => (0, *min as u32, 0),
            FsmEdge::RuleRef { rule, .. } => (1, rule.0, 0),
            FsmEdge::Epsilon { .. } => (2, 0, 0),
        }
    }
}

// ─── Mutable FSM ─────────────────────────────────────────────────────

/// Mutable FSM: a labeled multigraph of states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fsm {
    pub(crate) graph: Graph<FsmLabel>,
}

impl Fsm {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
        }
    }

    pub fn num_states(&self) -> usize {
        self.graph.num_nodes()
    }

    pub fn add_state(&mut self) -> StateId {
        StateId(self.graph.add_node())
    }

    pub fn add_edge(&mut self, from: StateId, to: StateId, min: u8, max: u8) {
        debug_assert!(min <= max);
        self.graph.add_edge(from.0, to.0, FsmLabel::Char { min, max });
    }

    pub fn add_epsilon(&mut self, from: StateId, to: StateId) {
        self.graph.add_edge(from.0, to.0, FsmLabel::Epsilon);
    }

    pub fn add_rule_edge(&mut self, from: StateId, to: StateId, rule: RuleId) {
        self.graph.add_edge(from.0, to.0, FsmLabel::Rule(rule.0));
    }

    pub(crate) fn edges_from(&self, state: StateId) -> impl Iterator<Item = (FsmLabel, StateId)> + '_ {
        self.graph
            .out_edges(state.0)
            .map(|(label, dst)| (label, StateId(dst)))
    }

    /// Copy every state and edge of `other` into `self`; returns the state
    /// id offset applied to `other`'s states.
    pub(crate) fn absorb(&mut self, other: &Fsm) -> u32 {
        let offset = self.num_states() as u32;
        for _ in 0..other.num_states() {
            self.add_state();
        }
        for node in 0..other.num_states() as u32 {
            let edges: Vec<(FsmLabel, u32)> = other.graph.out_edges(node).collect();
            for &(label, dst) in edges.iter().rev() {
                self.graph.add_edge(node + offset, dst + offset, label);
            }
        }
        offset
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Automaton wrapper ───────────────────────────────────────────────

/// An FSM plus start state and accept set. `F` is the storage form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automaton<F> {
    pub fsm: F,
    pub start: StateId,
    /// `ends[s]` is true iff state `s` accepts.
    pub ends: Vec<bool>,
}

impl<F> Automaton<F> {
    pub fn is_end(&self, state: StateId) -> bool {
        self.ends.get(state.0 as usize).copied().unwrap_or(false)
    }
}

impl Automaton<Fsm> {
    /// Fresh automaton with a single non-accepting start state.
    pub fn with_start() -> Self {
        let mut fsm = Fsm::new();
        let start = fsm.add_state();
        Automaton {
            fsm,
            start,
            ends: vec![false],
        }
    }

    pub fn add_state(&mut self) -> StateId {
        let id = self.fsm.add_state();
        self.ends.push(false);
        id
    }

    pub fn set_end(&mut self, state: StateId, end: bool) {
        self.ends[state.0 as usize] = end;
    }

    /// Structural audit: the underlying graph chains are consistent and
    /// start/accept states are in range.
    pub fn well_formed(&self) -> bool {
        self.fsm.graph.well_formed()
            && (self.start.0 as usize) < self.fsm.num_states().max(1)
            && self.ends.len() == self.fsm.num_states()
    }
}

// ─── Compact forms ───────────────────────────────────────────────────

/// Threshold below which transition lookup scans linearly instead of
/// binary-searching.
const LINEAR_SCAN_MAX_EDGES: usize = 16;

/// Read-optimized FSM: per-state edge lists in CSR layout, char edges
/// first and sorted by range start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactFsm {
    edges: Vec<FsmEdge>,
    offsets: Vec<u32>,
}

impl CompactFsm {
    fn from_edges(per_state: Vec<Vec<FsmEdge>>) -> Self {
        let mut flat = Vec::new();
        let mut offsets = Vec::with_capacity(per_state.len() + 1);
        for mut edges in per_state {
            offsets.push(flat.len() as u32);
            edges.sort_by_key(|e| e.sort_key());
            flat.extend(edges);
        }
        offsets.push(flat.len() as u32);
        CompactFsm {
            edges: flat,
            offsets,
        }
    }

    pub fn num_states(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn edges(&self, state: StateId) -> &[FsmEdge] {
        let lo = self.offsets[state.0 as usize] as usize;
        let hi = self.offsets[state.0 as usize + 1] as usize;
        &self.edges[lo..hi]
    }

    /// Byte transition. Linear scan for small edge lists, binary search on
    /// the sorted char-edge prefix otherwise.
    pub fn transition(&self, from: StateId, byte: u8) -> Option<StateId> {
        let edges = self.edges(from);
        let char_count = edges
            .iter()
            .take_while(|e| matches!(e, FsmEdge::CharRange { .. }))
            .count();
        let chars = &edges[..char_count];
        if chars.len() <= LINEAR_SCAN_MAX_EDGES {
            for e in chars {
                if let FsmEdge::CharRange { min, max, target } = e {
                    if *min > byte {
                        return None;
                    }
                    if *max >= byte {
                        return Some(*target);
                    }
                }
            }
            None
        } else {
            let idx = chars.partition_point(|e| match e {
                FsmEdge::CharRange { min, .. } => *min <= byte,
                _ => unreachable!("char prefix only"),
            });
            if idx == 0 {
                return None;
            }
            match chars[idx - 1] {
                FsmEdge::CharRange { max, target, .. } if max >= byte => Some(target),
                _ => None,
            }
        }
    }

}

/// Determinized per-rule machine with a dense byte transition table.
#[derive(Debug, Clone)]
pub struct DfaTable {
    compact: CompactFsm,
    byte_table: Vec<u16>,
}

impl DfaTable {
    pub fn num_states(&self) -> usize {
        self.compact.num_states()
    }

    pub fn edges(&self, state: StateId) -> &[FsmEdge] {
        self.compact.edges(state)
    }

    #[inline(always)]
    pub fn next_state(&self, from: StateId, byte: u8) -> Option<StateId> {
        let next = self.byte_table[from.0 as usize * 256 + byte as usize];
        (next != NO_DFA_STATE).then(|| StateId(next as u32))
    }

    /// Raw dense table: `byte_table[state * 256 + byte]`, `0xFFFF` when no
    /// transition exists.
    pub fn byte_table(&self) -> &[u16] {
        &self.byte_table
    }

    pub fn compact(&self) -> &CompactFsm {
        &self.compact
    }
}

impl Automaton<Fsm> {
    /// Compact a (deterministic, epsilon-free) automaton into the
    /// table-driven query form.
    pub fn to_compact(&self) -> Automaton<DfaTable> {
        let n = self.fsm.num_states();
        assert!(
            n <= NO_DFA_STATE as usize,
            "DFA has {n} states; the dense table indexes with u16"
        );
        let mut per_state: Vec<Vec<FsmEdge>> = vec![Vec::new(); n];
        for s in 0..n as u32 {
            let mut edges: Vec<FsmEdge> = self
                .fsm
                .edges_from(StateId(s))
                .map(|(label, target)| {
                    debug_assert!(
                        !matches!(label, FsmLabel::Epsilon),
                        "epsilon edge survived determinization"
                    );
                    FsmEdge::from_label(label, target)
                })
                .collect();
            edges.reverse(); // graph iteration is LIFO; restore insertion order
            per_state[s as usize] = edges;
        }
        let compact = CompactFsm::from_edges(per_state);

        let mut byte_table = vec![NO_DFA_STATE; n * 256];
        for s in 0..n {
            for e in compact.edges(StateId(s as u32)) {
                if let FsmEdge::CharRange { min, max, target } = e {
                    for b in *min..=*max {
                        byte_table[s * 256 + b as usize] = target.0 as u16;
                    }
                }
            }
        }

        Automaton {
            fsm: DfaTable {
                compact,
                byte_table,
            },
            start: self.start,
            ends: self.ends.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_state() -> Automaton<Fsm> {
        let mut a = Automaton::with_start();
        let end = a.add_state();
        a.fsm.add_edge(a.start, end, b'a', b'z');
        a.set_end(end, true);
        a
    }

    #[test]
    fn test_compact_transition() {
        let dfa = two_state().to_compact();
        assert_eq!(dfa.fsm.next_state(StateId(0), b'm'), Some(StateId(1)));
        assert_eq!(dfa.fsm.next_state(StateId(0), b'0'), None);
        assert_eq!(dfa.fsm.compact().transition(StateId(0), b'm'), Some(StateId(1)));
        assert!(dfa.is_end(StateId(1)));
        assert!(!dfa.is_end(StateId(0)));
    }

    #[test]
    fn test_compact_binary_search_path() {
        // More than 16 disjoint single-byte edges forces the binary search.
        let mut a = Automaton::with_start();
        for i in 0..24u8 {
            let s = a.add_state();
            let byte = b'a' + 2 * i; // leave gaps
            a.fsm.add_edge(a.start, s, byte, byte);
            a.set_end(s, true);
        }
        let compact = a.to_compact().fsm.compact().clone();
        assert_eq!(compact.transition(StateId(0), b'a'), Some(StateId(1)));
        assert_eq!(compact.transition(StateId(0), b'a' + 46), Some(StateId(24)));
        assert_eq!(compact.transition(StateId(0), b'b'), None);
        assert_eq!(compact.transition(StateId(0), 0), None);
    }

    #[test]
    fn test_byte_table_sentinel() {
        let dfa = two_state().to_compact();
        let bt = dfa.fsm.byte_table();
        assert_eq!(bt.len(), 2 * 256);
        assert_eq!(bt[b'a' as usize], 1);
        assert_eq!(bt[b'A' as usize], NO_DFA_STATE);
    }

    #[test]
    fn test_edges_preserve_insertion_order_per_kind() {
        let mut a = Automaton::with_start();
        let s1 = a.add_state();
        let s2 = a.add_state();
        a.fsm.add_edge(a.start, s1, b'x', b'x');
        a.fsm.add_rule_edge(a.start, s2, RuleId(3));
        let dfa = a.to_compact();
        let edges = dfa.fsm.edges(StateId(0));
        assert!(matches!(edges[0], FsmEdge::CharRange { .. }));
        assert!(matches!(edges[1], FsmEdge::RuleRef { rule: RuleId(3), .. }));
    }

    #[test]
    fn test_fsm_serde_round_trip() {
        let a = two_state();
        let json = serde_json::to_string(&a.fsm).unwrap();
        assert!(json.contains("adj_heads"));
        let back: Fsm = serde_json::from_str(&json).unwrap();
        assert_eq!(a.fsm, back);
    }
}
