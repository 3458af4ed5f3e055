//! FSM algebra: closure, advance, determinization, minimization,
//! complement, products, and the epsilon/equivalence simplifiers.
//!
//! Determinization and intersection are budgeted: when the constructed
//! machine would exceed the state cap they bail out with
//! [`Error::BudgetExceeded`] instead of diverging.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Error, Result};
use crate::grammar::RuleId;

use super::{Automaton, Fsm, FsmLabel, StateId};

impl Automaton<Fsm> {
    // ─── Traversal ───────────────────────────────────────────────────

    /// Extend `states` with everything reachable over epsilon edges and
    /// sort it into canonical order. Subset construction deduplicates the
    /// resulting sets, which memoizes closures per state-set.
    pub(crate) fn epsilon_closure(&self, states: &mut Vec<StateId>) {
        let mut seen: FxHashSet<StateId> = states.iter().copied().collect();
        let mut i = 0;
        while i < states.len() {
            let s = states[i];
            i += 1;
            for (label, dst) in self.fsm.edges_from(s) {
                if matches!(label, FsmLabel::Epsilon) && seen.insert(dst) {
                    states.push(dst);
                }
            }
        }
        states.sort_unstable();
    }

    /// Closure of the byte successors of a closed state set. Empty result
    /// means no transition.
    pub(crate) fn advance_byte(&self, from: &[StateId], byte: u8) -> Vec<StateId> {
        let mut next = Vec::new();
        for &s in from {
            for (label, dst) in self.fsm.edges_from(s) {
                if let FsmLabel::Char { min, max } = label {
                    if min <= byte && byte <= max {
                        next.push(dst);
                    }
                }
            }
        }
        next.sort_unstable();
        next.dedup();
        self.epsilon_closure(&mut next);
        next
    }

    /// Symmetric overload consuming a rule symbol on rule-reference edges.
    pub(crate) fn advance_rule(&self, from: &[StateId], rule: RuleId) -> Vec<StateId> {
        let mut next = Vec::new();
        for &s in from {
            for (label, dst) in self.fsm.edges_from(s) {
                if label == FsmLabel::Rule(rule.0) {
                    next.push(dst);
                }
            }
        }
        next.sort_unstable();
        next.dedup();
        self.epsilon_closure(&mut next);
        next
    }

    /// NFA simulation over a byte string.
    pub fn accepts(&self, input: &[u8]) -> bool {
        let mut states = vec![self.start];
        self.epsilon_closure(&mut states);
        for &byte in input {
            states = self.advance_byte(&states, byte);
            if states.is_empty() {
                return false;
            }
        }
        states.iter().any(|&s| self.is_end(s))
    }

    // ─── Combinators ─────────────────────────────────────────────────

    /// Union of several automata: fresh start with epsilon edges into each.
    pub fn union(parts: &[Automaton<Fsm>]) -> Automaton<Fsm> {
        let mut out = Automaton::with_start();
        for part in parts {
            let offset = out.fsm.absorb(&part.fsm);
            out.ends.extend(part.ends.iter().copied());
            out.fsm
                .add_epsilon(out.start, StateId(part.start.0 + offset));
        }
        out
    }

    /// Concatenation in order: epsilon edges from each part's accepts to
    /// the next part's start.
    pub fn concat(parts: &[Automaton<Fsm>]) -> Automaton<Fsm> {
        debug_assert!(!parts.is_empty());
        let mut out = Automaton::with_start();
        let mut prev_ends: Vec<StateId> = vec![out.start];
        for part in parts {
            let offset = out.fsm.absorb(&part.fsm);
            out.ends.extend(std::iter::repeat(false).take(part.ends.len()));
            for &e in &prev_ends {
                out.fsm.add_epsilon(e, StateId(part.start.0 + offset));
            }
            prev_ends = part
                .ends
                .iter()
                .enumerate()
                .filter(|(_, &end)| end)
                .map(|(i, _)| StateId(i as u32 + offset))
                .collect();
        }
        for &e in &prev_ends {
            out.ends[e.0 as usize] = true;
        }
        out
    }

    /// Kleene star: a fresh accepting start that loops around the body.
    pub fn star(&self) -> Automaton<Fsm> {
        let mut out = Automaton::with_start();
        let offset = out.fsm.absorb(&self.fsm);
        out.ends.extend(std::iter::repeat(false).take(self.ends.len()));
        out.fsm
            .add_epsilon(out.start, StateId(self.start.0 + offset));
        for (i, &end) in self.ends.iter().enumerate() {
            if end {
                out.fsm.add_epsilon(StateId(i as u32 + offset), out.start);
            }
        }
        out.ends[out.start.0 as usize] = true;
        out
    }

    /// One or more repetitions: accepts loop back to the start.
    pub fn plus(&self) -> Automaton<Fsm> {
        let mut out = self.clone();
        for (i, &end) in self.ends.iter().enumerate() {
            if end {
                out.fsm.add_epsilon(StateId(i as u32), self.start);
            }
        }
        out
    }

    /// Zero or one: a fresh accepting start in front of the body.
    pub fn optional(&self) -> Automaton<Fsm> {
        let mut out = Automaton::with_start();
        let offset = out.fsm.absorb(&self.fsm);
        out.ends.extend(self.ends.iter().copied());
        out.fsm
            .add_epsilon(out.start, StateId(self.start.0 + offset));
        out.ends[out.start.0 as usize] = true;
        out
    }

    // ─── Determinization ─────────────────────────────────────────────

    /// Subset construction with the default state budget.
    pub fn to_dfa(&self) -> Result<Automaton<Fsm>> {
        self.to_dfa_budgeted(super::DEFAULT_STATE_BUDGET)
    }

    /// Subset construction. Equivalent state sets are canonicalized by
    /// sorted ids; at most `budget` DFA states are produced.
    pub fn to_dfa_budgeted(&self, budget: usize) -> Result<Automaton<Fsm>> {
        let mut dfa = Fsm::new();
        let mut ends = Vec::new();
        let mut set_ids: FxHashMap<Vec<StateId>, StateId> = FxHashMap::default();
        let mut queue: VecDeque<Vec<StateId>> = VecDeque::new();

        let mut start_set = vec![self.start];
        self.epsilon_closure(&mut start_set);

        let start = dfa.add_state();
        ends.push(start_set.iter().any(|&s| self.is_end(s)));
        set_ids.insert(start_set.clone(), start);
        queue.push_back(start_set);

        while let Some(set) = queue.pop_front() {
            let sid = set_ids[&set];

            // Split the byte alphabet at every edge boundary of this set;
            // within one interval every edge either covers it fully or not
            // at all.
            let mut boundaries: Vec<u16> = Vec::new();
            let mut rules: Vec<u32> = Vec::new();
            for &s in &set {
                for (label, _) in self.fsm.edges_from(s) {
                    match label {
                        FsmLabel::Char { min, max } => {
                            boundaries.push(min as u16);
                            boundaries.push(max as u16 + 1);
                        }
                        FsmLabel::Rule(rule) => rules.push(rule),
                        FsmLabel::Epsilon => {}
                    }
                }
            }
            boundaries.sort_unstable();
            boundaries.dedup();
            rules.sort_unstable();
            rules.dedup();

            let mut pending: Option<(u8, u8, StateId)> = None;
            for win in boundaries.windows(2) {
                let (lo, hi) = (win[0], win[1] - 1);
                let target_set = self.advance_byte(&set, lo as u8);
                if target_set.is_empty() {
                    continue;
                }
                let target = intern_set(
                    target_set,
                    self,
                    &mut dfa,
                    &mut ends,
                    &mut set_ids,
                    &mut queue,
                    budget,
                )?;
                // Merge contiguous intervals that share a target.
                match pending {
                    Some((plo, phi, pt)) if pt == target && phi as u16 + 1 == lo => {
                        pending = Some((plo, hi as u8, pt));
                    }
                    Some((plo, phi, pt)) => {
                        dfa.add_edge(sid, pt, plo, phi);
                        pending = Some((lo as u8, hi as u8, target));
                    }
                    None => pending = Some((lo as u8, hi as u8, target)),
                }
            }
            if let Some((plo, phi, pt)) = pending {
                dfa.add_edge(sid, pt, plo, phi);
            }

            for rule in rules {
                let target_set = self.advance_rule(&set, RuleId(rule));
                if target_set.is_empty() {
                    continue;
                }
                let target = intern_set(
                    target_set,
                    self,
                    &mut dfa,
                    &mut ends,
                    &mut set_ids,
                    &mut queue,
                    budget,
                )?;
                dfa.add_rule_edge(sid, target, RuleId(rule));
            }
        }

        Ok(Automaton {
            fsm: dfa,
            start,
            ends,
        })
    }

    // ─── Minimization ────────────────────────────────────────────────

    /// Partition-refinement DFA minimization. Input must be deterministic
    /// and epsilon-free.
    pub fn minimize_dfa(&self) -> Automaton<Fsm> {
        let n = self.fsm.num_states();
        if n == 0 {
            return self.clone();
        }

        // Global symbol alphabet: one representative byte per interval cut
        // at every edge boundary, plus every rule id.
        let mut boundaries: Vec<u16> = Vec::new();
        let mut rules: Vec<u32> = Vec::new();
        for s in 0..n as u32 {
            for (label, _) in self.fsm.edges_from(StateId(s)) {
                match label {
                    FsmLabel::Char { min, max } => {
                        boundaries.push(min as u16);
                        boundaries.push(max as u16 + 1);
                    }
                    FsmLabel::Rule(rule) => rules.push(rule),
                    FsmLabel::Epsilon => {
                        debug_assert!(false, "minimize_dfa over an automaton with epsilons");
                    }
                }
            }
        }
        boundaries.sort_unstable();
        boundaries.dedup();
        rules.sort_unstable();
        rules.dedup();
        let symbols: Vec<FsmLabel> = boundaries
            .windows(2)
            .map(|w| FsmLabel::Char {
                min: w[0] as u8,
                max: w[0] as u8,
            })
            .chain(rules.iter().map(|&r| FsmLabel::Rule(r)))
            .collect();

        // Initial partition: accepting vs not. Refine until stable.
        let mut class_of: Vec<u32> = (0..n)
            .map(|s| if self.ends[s] { 1 } else { 0 })
            .collect();
        let mut num_classes = 2;
        loop {
            let mut signature_ids: FxHashMap<(u32, Vec<Option<u32>>), u32> =
                FxHashMap::default();
            let mut next_class = vec![0u32; n];
            for s in 0..n {
                let sig: Vec<Option<u32>> = symbols
                    .iter()
                    .map(|&sym| {
                        self.symbol_target(StateId(s as u32), sym)
                            .map(|t| class_of[t.0 as usize])
                    })
                    .collect();
                let key = (class_of[s], sig);
                let next_id = signature_ids.len() as u32;
                let id = *signature_ids.entry(key).or_insert(next_id);
                next_class[s] = id;
            }
            let new_count = signature_ids.len();
            class_of = next_class;
            if new_count == num_classes {
                break;
            }
            num_classes = new_count;
        }

        // Rebuild one state per class from a representative.
        let mut out = Fsm::new();
        let mut ends = vec![false; num_classes];
        let mut representative: Vec<Option<u32>> = vec![None; num_classes];
        for s in 0..n {
            let c = class_of[s] as usize;
            if representative[c].is_none() {
                representative[c] = Some(s as u32);
            }
            if self.ends[s] {
                ends[c] = true;
            }
        }
        for _ in 0..num_classes {
            out.add_state();
        }
        for (c, rep) in representative.iter().enumerate() {
            let rep = rep.expect("every class has a member");
            let edges: Vec<(FsmLabel, StateId)> = self.fsm.edges_from(StateId(rep)).collect();
            for &(label, target) in edges.iter().rev() {
                out.graph.add_edge(
                    c as u32,
                    class_of[target.0 as usize],
                    label,
                );
            }
        }

        let merged = Automaton {
            fsm: out,
            start: StateId(class_of[self.start.0 as usize]),
            ends,
        };
        merged.prune_unreachable()
    }

    /// Deterministic transition on one symbol (for minimization).
    fn symbol_target(&self, state: StateId, symbol: FsmLabel) -> Option<StateId> {
        for (label, dst) in self.fsm.edges_from(state) {
            match (label, symbol) {
                (FsmLabel::Char { min, max }, FsmLabel::Char { min: b, .. }) => {
                    if min <= b && b <= max {
                        return Some(dst);
                    }
                }
                (FsmLabel::Rule(r), FsmLabel::Rule(want)) if r == want => {
                    return Some(dst);
                }
                _ => {}
            }
        }
        None
    }

    /// Drop states unreachable from the start, keeping edge order.
    pub fn prune_unreachable(&self) -> Automaton<Fsm> {
        let (graph, starts, node_map) = self.fsm.graph.simplify(&[self.start.0]);
        let mut ends = vec![false; graph.num_nodes()];
        for (old, &new) in node_map.iter().enumerate() {
            if new != u32::MAX && self.ends[old] {
                ends[new as usize] = true;
            }
        }
        Automaton {
            fsm: Fsm { graph },
            start: StateId(starts[0]),
            ends,
        }
    }

    // ─── Complement and product ──────────────────────────────────────

    /// Complement over the byte alphabet: determinize, minimize, complete
    /// with a sink, and flip acceptance. Fails on automata with
    /// rule-reference edges.
    pub fn not(&self, budget: usize) -> Result<Automaton<Fsm>> {
        let mut dfa = self.to_dfa_budgeted(budget)?.minimize_dfa();
        if dfa.has_rule_edges() {
            return Err(Error::validation(
                "cannot complement an automaton with rule-reference edges",
            ));
        }

        let sink = dfa.add_state();
        let n = dfa.fsm.num_states();
        for s in 0..n as u32 {
            let mut covered: Vec<(u8, u8)> = dfa
                .fsm
                .edges_from(StateId(s))
                .filter_map(|(label, _)| match label {
                    FsmLabel::Char { min, max } => Some((min, max)),
                    _ => None,
                })
                .collect();
            if s == sink.0 {
                covered.clear();
            }
            covered.sort_unstable();
            let mut next = 0u16;
            for (min, max) in covered {
                if (min as u16) > next {
                    dfa.fsm.add_edge(StateId(s), sink, next as u8, min - 1);
                }
                next = max as u16 + 1;
            }
            if next <= 255 {
                dfa.fsm.add_edge(StateId(s), sink, next as u8, 255);
            }
        }
        for end in dfa.ends.iter_mut() {
            *end = !*end;
        }
        Ok(dfa)
    }

    /// Budgeted product automaton accepting the intersection of both
    /// languages. Fails on rule-reference edges.
    pub fn intersect(a: &Automaton<Fsm>, b: &Automaton<Fsm>, budget: usize) -> Result<Automaton<Fsm>> {
        let da = a.to_dfa_budgeted(budget)?;
        let db = b.to_dfa_budgeted(budget)?;
        if da.has_rule_edges() || db.has_rule_edges() {
            return Err(Error::validation(
                "cannot intersect automata with rule-reference edges",
            ));
        }

        let mut out = Fsm::new();
        let mut ends = Vec::new();
        let mut pair_ids: FxHashMap<(StateId, StateId), StateId> = FxHashMap::default();
        let mut queue: VecDeque<(StateId, StateId)> = VecDeque::new();

        let start = out.add_state();
        ends.push(da.is_end(da.start) && db.is_end(db.start));
        pair_ids.insert((da.start, db.start), start);
        queue.push_back((da.start, db.start));

        while let Some((sa, sb)) = queue.pop_front() {
            let sid = pair_ids[&(sa, sb)];
            let mut boundaries: Vec<u16> = Vec::new();
            for (label, _) in da.fsm.edges_from(sa).chain(db.fsm.edges_from(sb)) {
                if let FsmLabel::Char { min, max } = label {
                    boundaries.push(min as u16);
                    boundaries.push(max as u16 + 1);
                }
            }
            boundaries.sort_unstable();
            boundaries.dedup();

            for win in boundaries.windows(2) {
                let (lo, hi) = (win[0] as u8, (win[1] - 1) as u8);
                let ta = da.symbol_target(sa, FsmLabel::Char { min: lo, max: lo });
                let tb = db.symbol_target(sb, FsmLabel::Char { min: lo, max: lo });
                let (Some(ta), Some(tb)) = (ta, tb) else {
                    continue;
                };
                let target = match pair_ids.get(&(ta, tb)) {
                    Some(&t) => t,
                    None => {
                        if pair_ids.len() >= budget {
                            return Err(Error::BudgetExceeded { budget });
                        }
                        let t = out.add_state();
                        ends.push(da.is_end(ta) && db.is_end(tb));
                        pair_ids.insert((ta, tb), t);
                        queue.push_back((ta, tb));
                        t
                    }
                };
                out.add_edge(sid, target, lo, hi);
            }
        }

        Ok(Automaton {
            fsm: out,
            start,
            ends,
        })
    }

    fn has_rule_edges(&self) -> bool {
        (0..self.fsm.num_states() as u32).any(|s| {
            self.fsm
                .edges_from(StateId(s))
                .any(|(label, _)| matches!(label, FsmLabel::Rule(_)))
        })
    }

    // ─── Structural simplifiers ──────────────────────────────────────

    /// Merge across epsilon edges `a → b` when `b` has no other in-edges,
    /// or `a` has no other out-edges (and merging cannot change
    /// acceptance).
    pub fn simplify_epsilon(&mut self) {
        let mut budget = self.fsm.graph.edges.len() * 2 + 8;
        while budget > 0 {
            budget -= 1;
            let Some((edge_id, a, b)) = self.find_mergeable_epsilon() else {
                break;
            };
            self.fsm.graph.remove_edge(edge_id);
            if self.fsm.graph.in_degree(b.0) == 0 {
                // b is only reachable through a: fold b into a.
                self.fsm.graph.coalesce(a.0, b.0);
                if self.is_end(b) {
                    self.ends[a.0 as usize] = true;
                }
                if self.start == b {
                    self.start = a;
                }
            } else {
                // a's only exit was the epsilon: fold a into b.
                self.fsm.graph.coalesce(b.0, a.0);
                if self.start == a {
                    self.start = b;
                }
            }
        }
    }

    fn find_mergeable_epsilon(&self) -> Option<(u32, StateId, StateId)> {
        for s in 0..self.fsm.num_states() as u32 {
            let mut edge_id = self.fsm.graph.adj_heads[s as usize].0;
            while edge_id >= 0 {
                let e = &self.fsm.graph.edges[edge_id as usize];
                let next = e.next_out;
                if e.label == FsmLabel::Epsilon && e.src != e.dst {
                    let a = StateId(e.src as u32);
                    let b = StateId(e.dst as u32);
                    let b_sole_in = self.fsm.graph.in_degree(b.0) == 1 && b != self.start;
                    let a_sole_out = self.fsm.graph.out_degree(a.0) == 1
                        && (!self.is_end(a) || self.is_end(b))
                        && b != self.start;
                    if b_sole_in || a_sole_out {
                        return Some((edge_id as u32, a, b));
                    }
                }
                edge_id = next;
            }
        }
        None
    }

    /// Merge sibling targets reached only by identically labeled edges
    /// from the same source.
    pub fn simplify_equivalent_states(&mut self) {
        let mut budget = self.fsm.num_states() + 8;
        while budget > 0 {
            budget -= 1;
            let Some((keep, drop)) = self.find_equivalent_pair() else {
                break;
            };
            self.fsm.graph.coalesce(keep.0, drop.0);
            if self.is_end(drop) {
                self.ends[keep.0 as usize] = true;
            }
            self.ends[drop.0 as usize] = false;
        }
    }

    fn find_equivalent_pair(&self) -> Option<(StateId, StateId)> {
        for s in 0..self.fsm.num_states() as u32 {
            let edges: Vec<(FsmLabel, StateId)> = self.fsm.edges_from(StateId(s)).collect();
            for i in 0..edges.len() {
                for j in (i + 1)..edges.len() {
                    let (la, ta) = edges[i];
                    let (lb, tb) = edges[j];
                    if la == lb
                        && ta != tb
                        && ta != self.start
                        && tb != self.start
                        && self.fsm.graph.in_degree(ta.0) == 1
                        && self.fsm.graph.in_degree(tb.0) == 1
                    {
                        return Some((ta, tb));
                    }
                }
            }
        }
        None
    }
}

/// Look up or create the DFA state for a canonical NFA state set.
fn intern_set(
    set: Vec<StateId>,
    nfa: &Automaton<Fsm>,
    dfa: &mut Fsm,
    ends: &mut Vec<bool>,
    set_ids: &mut FxHashMap<Vec<StateId>, StateId>,
    queue: &mut VecDeque<Vec<StateId>>,
    budget: usize,
) -> Result<StateId> {
    if let Some(&id) = set_ids.get(&set) {
        return Ok(id);
    }
    if set_ids.len() >= budget {
        return Err(Error::BudgetExceeded { budget });
    }
    let id = dfa.add_state();
    ends.push(set.iter().any(|&s| nfa.is_end(s)));
    set_ids.insert(set.clone(), id);
    queue.push_back(set);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `(ab|ac)` as a hand-built NFA.
    fn ab_or_ac() -> Automaton<Fsm> {
        let mut a = Automaton::with_start();
        let s1 = a.add_state();
        let s2 = a.add_state();
        let e1 = a.add_state();
        let e2 = a.add_state();
        a.fsm.add_edge(a.start, s1, b'a', b'a');
        a.fsm.add_edge(a.start, s2, b'a', b'a');
        a.fsm.add_edge(s1, e1, b'b', b'b');
        a.fsm.add_edge(s2, e2, b'c', b'c');
        a.set_end(e1, true);
        a.set_end(e2, true);
        a
    }

    fn literal(s: &[u8]) -> Automaton<Fsm> {
        let mut a = Automaton::with_start();
        let mut cur = a.start;
        for &b in s {
            let next = a.add_state();
            a.fsm.add_edge(cur, next, b, b);
            cur = next;
        }
        a.set_end(cur, true);
        a
    }

    #[test]
    fn test_accepts_nfa() {
        let a = ab_or_ac();
        assert!(a.accepts(b"ab"));
        assert!(a.accepts(b"ac"));
        assert!(!a.accepts(b"a"));
        assert!(!a.accepts(b"abc"));
        assert!(!a.accepts(b""));
    }

    #[test]
    fn test_to_dfa_equivalence() {
        let a = ab_or_ac();
        let dfa = a.to_dfa().unwrap();
        assert!(dfa.well_formed());
        for input in [&b"ab"[..], b"ac", b"a", b"b", b"abab", b""] {
            assert_eq!(a.accepts(input), dfa.accepts(input), "input {input:?}");
        }
    }

    #[test]
    fn test_to_dfa_budget() {
        let a = ab_or_ac();
        let err = a.to_dfa_budgeted(2).unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { budget: 2 }));
    }

    #[test]
    fn test_minimize_never_grows() {
        let a = ab_or_ac();
        let dfa = a.to_dfa().unwrap();
        let min = dfa.minimize_dfa();
        assert!(min.fsm.num_states() <= dfa.fsm.num_states());
        for input in [&b"ab"[..], b"ac", b"a", b"ax", b""] {
            assert_eq!(dfa.accepts(input), min.accepts(input), "input {input:?}");
        }
        // ab|ac minimizes to start → a → {b,c} → end: 3 live states.
        assert_eq!(min.fsm.num_states(), 3);
    }

    #[test]
    fn test_union_concat() {
        let ab = literal(b"ab");
        let cd = literal(b"cd");
        let u = Automaton::union(&[ab.clone(), cd.clone()]);
        assert!(u.accepts(b"ab"));
        assert!(u.accepts(b"cd"));
        assert!(!u.accepts(b"abcd"));
        let c = Automaton::concat(&[ab, cd]);
        assert!(c.accepts(b"abcd"));
        assert!(!c.accepts(b"ab"));
    }

    #[test]
    fn test_star_plus_optional() {
        let ab = literal(b"ab");
        let star = ab.star();
        assert!(star.accepts(b""));
        assert!(star.accepts(b"ab"));
        assert!(star.accepts(b"ababab"));
        assert!(!star.accepts(b"aba"));
        let plus = ab.plus();
        assert!(!plus.accepts(b""));
        assert!(plus.accepts(b"abab"));
        let opt = ab.optional();
        assert!(opt.accepts(b""));
        assert!(opt.accepts(b"ab"));
        assert!(!opt.accepts(b"abab"));
    }

    #[test]
    fn test_not_involution() {
        let ab = literal(b"ab");
        let not = ab.not(1000).unwrap();
        assert!(!not.accepts(b"ab"));
        assert!(not.accepts(b""));
        assert!(not.accepts(b"a"));
        assert!(not.accepts(b"abx"));
        let not_not = not.not(1000).unwrap();
        for input in [&b"ab"[..], b"", b"a", b"abx", b"zzz"] {
            assert_eq!(ab.accepts(input), not_not.accepts(input), "input {input:?}");
        }
    }

    #[test]
    fn test_intersect_semantics() {
        // star against a fixed literal
        let star = literal(b"ab").star();
        let lit = literal(b"abab");
        let inter = Automaton::intersect(&star, &lit, 1000).unwrap();
        assert!(inter.accepts(b"abab"));
        assert!(!inter.accepts(b"ab"));
        assert!(!inter.accepts(b""));
        for input in [&b"ab"[..], b"abab", b"", b"ababab", b"x"] {
            assert_eq!(
                inter.accepts(input),
                star.accepts(input) && lit.accepts(input),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn test_intersect_budget() {
        let star = literal(b"ab").star();
        let lit = literal(b"abababab");
        let err = Automaton::intersect(&star, &lit, 3).unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { .. }));
    }

    #[test]
    fn test_simplify_epsilon_preserves_language() {
        let mut c = Automaton::concat(&[literal(b"ab"), literal(b"cd")]);
        let states_before = c.fsm.num_states();
        c.simplify_epsilon();
        let c = c.prune_unreachable();
        assert!(c.fsm.num_states() < states_before);
        assert!(c.well_formed());
        assert!(c.accepts(b"abcd"));
        assert!(!c.accepts(b"ab"));
        assert!(!c.accepts(b"abcde"));
    }

    #[test]
    fn test_simplify_equivalent_states() {
        let mut a = ab_or_ac();
        // s1 and s2 are both reached only by 'a' edges from the start.
        a.simplify_equivalent_states();
        let a = a.prune_unreachable();
        assert!(a.accepts(b"ab"));
        assert!(a.accepts(b"ac"));
        assert!(!a.accepts(b"ad"));
        assert!(a.fsm.num_states() < 5);
    }

    #[test]
    fn test_advance_rule_symbol() {
        let mut a = Automaton::with_start();
        let s1 = a.add_state();
        a.fsm.add_rule_edge(a.start, s1, RuleId(4));
        a.set_end(s1, true);
        let mut set = vec![a.start];
        a.epsilon_closure(&mut set);
        let next = a.advance_rule(&set, RuleId(4));
        assert_eq!(next, vec![s1]);
        assert!(a.advance_rule(&set, RuleId(5)).is_empty());
    }
}
