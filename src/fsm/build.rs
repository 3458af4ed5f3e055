//! FSM construction from grammar rules, and the pattern trie.
//!
//! Character classes are specified over Unicode codepoints but the
//! automata run over bytes: each codepoint range is expanded into UTF-8
//! byte-sequence transitions, split per encoded length so that only valid
//! UTF-8 (no overlong forms, no surrogates) is ever accepted. A token
//! carrying invalid UTF-8 can therefore never match a character class.

use crate::error::{Error, Result};
use crate::grammar::{Expr, ExprId, Grammar, RuleId};

use super::{Automaton, Fsm, StateId};

const MAX_CODEPOINT: u32 = 0x10FFFF;
const SURROGATE_LO: u32 = 0xD800;
const SURROGATE_HI: u32 = 0xDFFF;

// ─── Rule NFAs ───────────────────────────────────────────────────────

/// Build one NFA per rule of a normalized grammar. Rule references stay
/// symbolic (rule-labeled edges); the pushdown matcher resolves them.
pub(crate) fn build_rule_fsms(grammar: &Grammar) -> Vec<Automaton<Fsm>> {
    (0..grammar.num_rules())
        .map(|i| build_rule_nfa(grammar, RuleId(i as u32)))
        .collect()
}

fn build_rule_nfa(grammar: &Grammar, rule: RuleId) -> Automaton<Fsm> {
    let mut aut = Automaton::with_start();
    let body = grammar.rule(rule).body;
    let alts: Vec<ExprId> = match grammar.expr(body) {
        Expr::Choices(alts) => alts.clone(),
        _ => vec![body],
    };
    for alt in alts {
        match grammar.expr(alt) {
            Expr::EmptyString => {
                let start = aut.start;
                aut.set_end(start, true);
            }
            Expr::Sequence(elems) => {
                let elems = elems.clone();
                let mut cur = aut.start;
                for elem in elems {
                    cur = add_element(grammar, &mut aut, cur, elem);
                }
                aut.set_end(cur, true);
            }
            _ => {
                let start = aut.start;
                let cur = add_element(grammar, &mut aut, start, alt);
                aut.set_end(cur, true);
            }
        }
    }
    aut.simplify_epsilon();
    aut
}

/// Append one sequence element after `cur`; returns the element's exit
/// state.
fn add_element(
    grammar: &Grammar,
    aut: &mut Automaton<Fsm>,
    cur: StateId,
    elem: ExprId,
) -> StateId {
    match grammar.expr(elem) {
        Expr::EmptyString => cur,
        Expr::ByteString(bytes) => {
            let bytes = bytes.clone();
            let mut cur = cur;
            for b in bytes {
                let next = aut.add_state();
                aut.fsm.add_edge(cur, next, b, b);
                cur = next;
            }
            cur
        }
        Expr::CharacterClass { negated, ranges } => {
            let ranges = codepoint_ranges(*negated, ranges);
            let next = aut.add_state();
            add_class_transitions(aut, cur, next, &ranges);
            next
        }
        Expr::CharacterClassStar { negated, ranges } => {
            let ranges = codepoint_ranges(*negated, ranges);
            add_class_transitions(aut, cur, cur, &ranges);
            cur
        }
        Expr::RuleRef(rule) => {
            let rule = *rule;
            let next = aut.add_state();
            aut.fsm.add_rule_edge(cur, next, rule);
            next
        }
        Expr::Repeat { rule, min, max } => {
            let (rule, min, max) = (*rule, *min, *max);
            let mut cur = cur;
            for _ in 0..min {
                let next = aut.add_state();
                aut.fsm.add_rule_edge(cur, next, rule);
                cur = next;
            }
            match max {
                None => {
                    aut.fsm.add_rule_edge(cur, cur, rule);
                    cur
                }
                Some(max) => {
                    for _ in min..max {
                        let next = aut.add_state();
                        aut.fsm.add_rule_edge(cur, next, rule);
                        aut.fsm.add_epsilon(cur, next);
                        cur = next;
                    }
                    cur
                }
            }
        }
        Expr::Sequence(elems) => {
            // Normalization flattens nested sequences; tolerate them for
            // hand-built grammars.
            let elems = elems.clone();
            let mut cur = cur;
            for e in elems {
                cur = add_element(grammar, aut, cur, e);
            }
            cur
        }
        Expr::Choices(alts) => {
            let alts = alts.clone();
            let exit = aut.add_state();
            for alt in alts {
                let end = add_element(grammar, aut, cur, alt);
                aut.fsm.add_epsilon(end, exit);
            }
            exit
        }
    }
}

// ─── Codepoint range handling ────────────────────────────────────────

/// Canonicalize class ranges: clamp, sort, merge, apply negation, and
/// strip the surrogate gap.
pub(crate) fn codepoint_ranges(negated: bool, ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut sorted: Vec<(u32, u32)> = ranges
        .iter()
        .filter(|&&(lo, hi)| lo <= hi && lo <= MAX_CODEPOINT)
        .map(|&(lo, hi)| (lo, hi.min(MAX_CODEPOINT)))
        .collect();
    sorted.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::new();
    for (lo, hi) in sorted {
        match merged.last_mut() {
            Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }

    let positive = if negated {
        let mut complement = Vec::new();
        let mut next = 0u32;
        for (lo, hi) in merged {
            if lo > next {
                complement.push((next, lo - 1));
            }
            next = hi.saturating_add(1);
        }
        if next <= MAX_CODEPOINT {
            complement.push((next, MAX_CODEPOINT));
        }
        complement
    } else {
        merged
    };

    // Split around the surrogate gap; those codepoints have no UTF-8 form.
    let mut out = Vec::with_capacity(positive.len() + 1);
    for (lo, hi) in positive {
        if hi < SURROGATE_LO || lo > SURROGATE_HI {
            out.push((lo, hi));
        } else {
            if lo < SURROGATE_LO {
                out.push((lo, SURROGATE_LO - 1));
            }
            if hi > SURROGATE_HI {
                out.push((SURROGATE_HI + 1, hi));
            }
        }
    }
    out
}

/// Add transitions from `from` to `to` accepting exactly the UTF-8
/// encodings of the given codepoint ranges. Multi-byte encodings go
/// through fresh intermediate states; `from == to` builds an in-place
/// loop.
pub(crate) fn add_class_transitions(
    aut: &mut Automaton<Fsm>,
    from: StateId,
    to: StateId,
    ranges: &[(u32, u32)],
) {
    let mut chains: Vec<Vec<(u8, u8)>> = Vec::new();
    for &(lo, hi) in ranges {
        utf8_chains(lo, hi, &mut chains);
    }
    for chain in chains {
        debug_assert!(!chain.is_empty());
        let mut cur = from;
        for (i, &(min, max)) in chain.iter().enumerate() {
            let next = if i + 1 == chain.len() {
                to
            } else {
                aut.add_state()
            };
            aut.fsm.add_edge(cur, next, min, max);
            cur = next;
        }
    }
}

/// UTF-8 encoding-length bands.
const LENGTH_BANDS: [(u32, u32); 4] = [
    (0x0, 0x7F),
    (0x80, 0x7FF),
    (0x800, 0xFFFF),
    (0x10000, MAX_CODEPOINT),
];

/// Decompose the codepoint range `[lo, hi]` into byte-range chains, one
/// per maximal set of encodings sharing a structure. The caller
/// guarantees the range avoids the surrogate gap.
fn utf8_chains(lo: u32, hi: u32, out: &mut Vec<Vec<(u8, u8)>>) {
    for &(band_lo, band_hi) in &LENGTH_BANDS {
        let lo = lo.max(band_lo);
        let hi = hi.min(band_hi);
        if lo > hi {
            continue;
        }
        let start = encode_utf8(lo);
        let end = encode_utf8(hi);
        debug_assert_eq!(start.len(), end.len());
        same_length_chains(&start, &end, out);
    }
}

fn encode_utf8(cp: u32) -> Vec<u8> {
    let c = char::from_u32(cp).expect("surrogates are stripped before encoding");
    let mut buf = [0u8; 4];
    c.encode_utf8(&mut buf).as_bytes().to_vec()
}

/// Split `[start, end]` (equal-length byte encodings) into chains of
/// per-position byte ranges that cover exactly the encodings in between.
fn same_length_chains(start: &[u8], end: &[u8], out: &mut Vec<Vec<(u8, u8)>>) {
    let n = start.len();
    debug_assert_eq!(n, end.len());
    if n == 1 {
        out.push(vec![(start[0], end[0])]);
        return;
    }
    if start[0] == end[0] {
        let mut sub = Vec::new();
        same_length_chains(&start[1..], &end[1..], &mut sub);
        for mut chain in sub {
            chain.insert(0, (start[0], start[0]));
            out.push(chain);
        }
        return;
    }

    // Lower boundary: start[0] with start's tail up to maximal
    // continuations.
    let mut mid_lo = start[0];
    if start[1..].iter().any(|&b| b != 0x80) {
        let max_tail = vec![0xBFu8; n - 1];
        let mut sub = Vec::new();
        same_length_chains(&start[1..], &max_tail, &mut sub);
        for mut chain in sub {
            chain.insert(0, (start[0], start[0]));
            out.push(chain);
        }
        mid_lo = start[0] + 1;
    }

    // Upper boundary: end[0] with minimal continuations up to end's tail.
    let mut mid_hi = end[0];
    if end[1..].iter().any(|&b| b != 0xBF) {
        let min_tail = vec![0x80u8; n - 1];
        let mut sub = Vec::new();
        same_length_chains(&min_tail, &end[1..], &mut sub);
        for mut chain in sub {
            chain.insert(0, (end[0], end[0]));
            out.push(chain);
        }
        mid_hi = end[0] - 1;
    }

    // Middle: full continuation freedom.
    if mid_lo <= mid_hi {
        let mut chain = vec![(mid_lo, mid_hi)];
        chain.extend(std::iter::repeat((0x80u8, 0xBFu8)).take(n - 1));
        out.push(chain);
    }
}

// ─── Pattern trie ────────────────────────────────────────────────────

/// Aho-Corasick-style trie over codepoints with failure links. Drives the
/// structural-tag dispatch rules: states are trigger/terminator prefixes,
/// and the matching states (a pattern completed, directly or through a
/// failure link) are exactly the states free text must avoid.
#[derive(Debug)]
pub(crate) struct PatternTrie {
    children: Vec<Vec<(char, u32)>>,
    fail: Vec<u32>,
    /// A pattern ends at this state (possibly via the failure chain).
    matching: Vec<bool>,
}

impl PatternTrie {
    /// Build from literal patterns. Empty patterns are always rejected;
    /// with `reject_overlaps`, a pattern that is a prefix of another (so
    /// one match would swallow the other) is also rejected.
    pub(crate) fn build(patterns: &[&str], reject_overlaps: bool) -> Result<Self> {
        let mut children: Vec<Vec<(char, u32)>> = vec![Vec::new()];
        let mut terminal: Vec<bool> = vec![false];

        for pattern in patterns {
            if pattern.is_empty() {
                return Err(Error::validation("empty pattern in trie"));
            }
            let mut node = 0u32;
            for c in pattern.chars() {
                if reject_overlaps && terminal[node as usize] {
                    return Err(Error::validation(format!(
                        "pattern \"{pattern}\" extends another pattern"
                    )));
                }
                node = match children[node as usize].iter().find(|(ch, _)| *ch == c) {
                    Some(&(_, next)) => next,
                    None => {
                        let next = children.len() as u32;
                        children.push(Vec::new());
                        terminal.push(false);
                        children[node as usize].push((c, next));
                        next
                    }
                };
            }
            if reject_overlaps && (terminal[node as usize] || !children[node as usize].is_empty())
            {
                return Err(Error::validation(format!(
                    "pattern \"{pattern}\" overlaps another pattern"
                )));
            }
            terminal[node as usize] = true;
        }

        // BFS failure links.
        let n = children.len();
        let mut fail = vec![0u32; n];
        let mut matching = terminal.clone();
        let mut queue: std::collections::VecDeque<u32> = std::collections::VecDeque::new();
        for &(_, child) in &children[0] {
            queue.push_back(child);
        }
        while let Some(node) = queue.pop_front() {
            let node_fail = fail[node as usize];
            let kids: Vec<(char, u32)> = children[node as usize].clone();
            for (c, child) in kids {
                fail[child as usize] = Self::walk(&children, &fail, node_fail, c);
                if matching[fail[child as usize] as usize] {
                    matching[child as usize] = true;
                }
                queue.push_back(child);
            }
        }

        Ok(Self {
            children,
            fail,
            matching,
        })
    }

    fn walk(children: &[Vec<(char, u32)>], fail: &[u32], mut state: u32, c: char) -> u32 {
        loop {
            if let Some(&(_, next)) = children[state as usize].iter().find(|(ch, _)| *ch == c) {
                return next;
            }
            if state == 0 {
                return 0;
            }
            state = fail[state as usize];
        }
    }

    pub(crate) fn num_nodes(&self) -> usize {
        self.children.len()
    }

    /// Transition with failure-link fallback.
    pub(crate) fn goto(&self, state: u32, c: char) -> u32 {
        Self::walk(&self.children, &self.fail, state, c)
    }

    /// True when reaching this state completes some pattern.
    pub(crate) fn is_matching(&self, state: u32) -> bool {
        self.matching[state as usize]
    }

    /// Every character appearing in any pattern.
    pub(crate) fn alphabet(&self) -> Vec<char> {
        let mut chars: Vec<char> = self
            .children
            .iter()
            .flat_map(|kids| kids.iter().map(|(c, _)| *c))
            .collect();
        chars.sort_unstable();
        chars.dedup();
        chars
    }
}
