//! Pushdown parser over per-rule DFAs.
//!
//! Matcher state is a multiset of 8-byte threads
//! (`rule_id`, `dfa_state`, `return_level`). The DFA encodes every
//! intra-rule transition, so predict/complete work only happens at rule
//! boundaries: a rule-reference edge predicts the child rule and records
//! a return entry `(expected_rule, parent_after_advance)` at the current
//! level; an accepting state completes and advances every recorded
//! parent.
//!
//! Levels (one per consumed byte) live in flat arenas with offset tables;
//! rollback truncates levels. Two accelerations from the production
//! lineage are kept: steady-state detection (a run of structurally
//! identical levels is collapsed into a counter or a delta-copy) and
//! completion-chain short-circuiting for self-referencing rules.

use std::cell::Cell;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::{FxHashSet, FxHasher};

use crate::compiled_grammar::CompiledGrammar;
use crate::fsm::{FsmEdge, StateId};
use crate::grammar::RuleId;

pub(super) const NO_PARENT: u32 = u32::MAX;

/// One parse thread: a position inside one rule's DFA plus the level at
/// which the rule was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(super) struct Thread {
    pub(super) rule_id: u16,
    pub(super) dfa_state: u16,
    /// Level where this rule was predicted; `NO_PARENT` for the root.
    pub(super) return_level: u32,
}

impl Hash for Thread {
    #[inline(always)]
    fn hash<H: Hasher>(&self, state: &mut H) {
        let bits = (self.rule_id as u64)
            | ((self.dfa_state as u64) << 16)
            | ((self.return_level as u64) << 32);
        bits.hash(state);
    }
}

/// Dedup set that stays a linear scan while small and upgrades to a hash
/// set past a threshold.
pub(super) struct SmallDedup<T: Eq + Hash + Copy> {
    vec: Vec<T>,
    set: Option<FxHashSet<T>>,
}

const SMALL_DEDUP_THRESHOLD: usize = 12;

impl<T: Eq + Hash + Copy> SmallDedup<T> {
    pub(super) fn new() -> Self {
        Self {
            vec: Vec::new(),
            set: None,
        }
    }

    pub(super) fn clear(&mut self) {
        self.vec.clear();
        if let Some(set) = &mut self.set {
            set.clear();
        }
    }

    fn insert(&mut self, item: T) -> bool {
        if let Some(set) = &mut self.set {
            if set.insert(item) {
                self.vec.push(item);
                return true;
            }
            return false;
        }
        if self.vec.contains(&item) {
            return false;
        }
        self.vec.push(item);
        if self.vec.len() >= SMALL_DEDUP_THRESHOLD {
            let mut set = FxHashSet::default();
            set.extend(self.vec.iter().copied());
            self.set = Some(set);
        }
        true
    }
}

impl<T: Eq + Hash + Copy> Default for SmallDedup<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Steady state ────────────────────────────────────────────────────

enum SteadyStep {
    InRange,
    OutOfRange,
    Inactive,
}

/// Collapses runs of structurally identical levels. In lazy mode (all
/// return-level deltas zero, e.g. inside `[^"]*` string content) only a
/// counter advances; in delta mode levels are copied with uniform +1
/// adjustments.
struct Steady {
    active: bool,
    ranges: Vec<(u8, u8)>,
    completed: bool,
    lazy: bool,
    count: usize,
    thread_deltas: Vec<i32>,
    return_deltas: Vec<i32>,
}

impl Steady {
    fn new() -> Self {
        Self {
            active: false,
            ranges: Vec::new(),
            completed: false,
            lazy: false,
            count: 0,
            thread_deltas: Vec::new(),
            return_deltas: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.lazy = false;
        self.count = 0;
        self.thread_deltas.clear();
        self.return_deltas.clear();
    }

    fn step(&self, byte: u8) -> SteadyStep {
        if !self.active {
            return SteadyStep::Inactive;
        }
        if self.ranges.iter().any(|&(lo, hi)| lo <= byte && byte <= hi) {
            SteadyStep::InRange
        } else {
            SteadyStep::OutOfRange
        }
    }
}

// ─── Stack parser ────────────────────────────────────────────────────

pub(super) struct StackParser {
    compiled: Arc<CompiledGrammar>,
    /// Live threads of every level, flattened.
    thread_arena: Vec<Thread>,
    thread_offsets: Vec<usize>,
    /// Return entries `(expected_rule, parent_after_advance)` per level.
    return_arena: Vec<(u16, Thread)>,
    return_offsets: Vec<usize>,
    /// Per level: can the root rule terminate here.
    completed: Vec<bool>,
    // Scratch, reused across advances.
    buf_queue: Vec<Thread>,
    buf_visited: SmallDedup<Thread>,
    buf_scan: Vec<Thread>,
    buf_returns: Vec<(u16, Thread)>,
    steady: Steady,
    /// `(rule, dfa_state, terminal_level, last_walk_start)` cache for the
    /// completion-chain walk; hit only on consecutive advances.
    chain_terminal: Cell<Option<(u16, u16, usize, usize)>>,
}

impl StackParser {
    pub(super) fn new(compiled: Arc<CompiledGrammar>) -> Self {
        let mut parser = Self {
            compiled,
            thread_arena: Vec::with_capacity(128),
            thread_offsets: Vec::with_capacity(32),
            return_arena: Vec::with_capacity(64),
            return_offsets: Vec::with_capacity(32),
            completed: Vec::with_capacity(32),
            buf_queue: Vec::new(),
            buf_visited: SmallDedup::new(),
            buf_scan: Vec::new(),
            buf_returns: Vec::new(),
            steady: Steady::new(),
            chain_terminal: Cell::new(None),
        };
        parser.seed_root();
        parser
    }

    /// Expand the root rule into level 0.
    fn seed_root(&mut self) {
        self.thread_arena.clear();
        self.thread_offsets.clear();
        self.return_arena.clear();
        self.return_offsets.clear();
        self.completed.clear();

        let mut queue = std::mem::take(&mut self.buf_queue);
        let mut visited = std::mem::take(&mut self.buf_visited);
        let mut scan = std::mem::take(&mut self.buf_scan);
        let mut returns = std::mem::take(&mut self.buf_returns);
        queue.clear();
        visited.clear();
        scan.clear();
        returns.clear();

        let root = self.compiled.grammar.root_rule();
        self.push_rule_start(root, NO_PARENT, &mut queue, &mut visited);

        let mut can_stop = false;
        self.run_queue(&mut queue, &mut visited, &mut scan, &mut returns, &mut can_stop, &[]);

        self.thread_offsets.push(self.thread_arena.len());
        self.thread_arena.extend_from_slice(&scan);
        self.return_offsets.push(self.return_arena.len());
        self.return_arena.extend_from_slice(&returns);
        self.completed.push(can_stop);

        queue.clear();
        visited.clear();
        scan.clear();
        returns.clear();
        self.buf_queue = queue;
        self.buf_visited = visited;
        self.buf_scan = scan;
        self.buf_returns = returns;
    }

    /// Consume one byte. False (state unchanged) when no thread survives.
    pub(super) fn advance(&mut self, byte: u8) -> bool {
        match self.steady.step(byte) {
            SteadyStep::InRange => {
                if self.steady.lazy {
                    self.steady.count += 1;
                } else {
                    self.advance_steady_delta();
                }
                return true;
            }
            SteadyStep::OutOfRange => {
                if self.steady.lazy {
                    self.flush_steady();
                }
                self.steady.active = false;
            }
            SteadyStep::Inactive => {}
        }

        let level_start = match self.thread_offsets.last() {
            Some(&s) => s,
            None => return false,
        };
        let level_end = self.thread_arena.len();

        let mut queue = std::mem::take(&mut self.buf_queue);
        let mut visited = std::mem::take(&mut self.buf_visited);
        let mut scan = std::mem::take(&mut self.buf_scan);
        let mut returns = std::mem::take(&mut self.buf_returns);
        queue.clear();
        visited.clear();
        scan.clear();
        returns.clear();

        self.scan_threads(
            &self.thread_arena[level_start..level_end],
            byte,
            &mut queue,
            &mut visited,
            &mut scan,
        );

        if queue.is_empty() && scan.is_empty() {
            self.buf_queue = queue;
            self.buf_visited = visited;
            self.buf_scan = scan;
            self.buf_returns = returns;
            return false;
        }

        let mut can_stop = false;
        if !queue.is_empty() {
            self.run_queue(&mut queue, &mut visited, &mut scan, &mut returns, &mut can_stop, &[]);
        }

        self.thread_offsets.push(self.thread_arena.len());
        self.thread_arena.extend_from_slice(&scan);
        self.return_offsets.push(self.return_arena.len());
        self.return_arena.extend_from_slice(&returns);
        self.completed.push(can_stop);

        queue.clear();
        visited.clear();
        scan.clear();
        returns.clear();
        self.buf_queue = queue;
        self.buf_visited = visited;
        self.buf_scan = scan;
        self.buf_returns = returns;

        self.detect_steady_state(byte);
        true
    }

    /// Consume a byte slice; on failure, undo any partial progress.
    pub(super) fn advance_bytes(&mut self, bytes: &[u8]) -> bool {
        let start = self.position();
        for &b in bytes {
            if !self.advance(b) {
                self.pop_levels(self.position() - start);
                return false;
            }
        }
        true
    }

    /// Copy the previous level with uniform return-level deltas applied.
    fn advance_steady_delta(&mut self) {
        let prev_start = *self.thread_offsets.last().unwrap();
        let count = self.thread_arena.len() - prev_start;
        self.thread_offsets.push(self.thread_arena.len());
        for i in 0..count {
            let mut t = self.thread_arena[prev_start + i];
            if t.return_level != NO_PARENT {
                t.return_level =
                    (t.return_level as i64 + self.steady.thread_deltas[i] as i64) as u32;
            }
            self.thread_arena.push(t);
        }
        let prev_rstart = *self.return_offsets.last().unwrap();
        let rcount = self.return_arena.len() - prev_rstart;
        self.return_offsets.push(self.return_arena.len());
        for i in 0..rcount {
            let (expected, mut parent) = self.return_arena[prev_rstart + i];
            if parent.return_level != NO_PARENT {
                parent.return_level =
                    (parent.return_level as i64 + self.steady.return_deltas[i] as i64) as u32;
            }
            self.return_arena.push((expected, parent));
        }
        self.completed.push(self.steady.completed);
        if let Some((rid, dfa, terminal, last)) = self.chain_terminal.get() {
            self.chain_terminal.set(Some((rid, dfa, terminal, last + 1)));
        }
    }

    /// Scan phase: step every thread's DFA by one byte. Threads whose
    /// successor only has char edges skip the queue entirely.
    fn scan_threads(
        &self,
        threads: &[Thread],
        byte: u8,
        queue: &mut Vec<Thread>,
        visited: &mut SmallDedup<Thread>,
        scan: &mut Vec<Thread>,
    ) {
        for &t in threads {
            let dfa = &self.compiled.rule_dfas[t.rule_id as usize];
            let Some(next_state) = dfa.fsm.next_state(StateId(t.dfa_state as u32), byte) else {
                continue;
            };
            let next = Thread {
                rule_id: t.rule_id,
                dfa_state: next_state.0 as u16,
                return_level: t.return_level,
            };
            let flags = self.compiled.action(next.rule_id, next.dfa_state).flags;
            if flags.has_char_edges() && !flags.has_rule_ref() && !flags.is_accepting() {
                if visited.insert(next) {
                    scan.push(next);
                }
            } else if visited.insert(next) {
                queue.push(next);
            }
        }
    }

    /// Predict/complete to a fixed point.
    ///
    /// Rules that complete at the current level are tracked so that a
    /// nullable rule re-predicted later in the queue (deduplicated by
    /// `visited`) still advances its new parent.
    fn run_queue(
        &self,
        queue: &mut Vec<Thread>,
        visited: &mut SmallDedup<Thread>,
        scan: &mut Vec<Thread>,
        returns: &mut Vec<(u16, Thread)>,
        can_stop: &mut bool,
        extra_returns: &[(u16, Thread)],
    ) {
        let current_level = self.thread_offsets.len() as u32;
        let mut completed_here = [0u16; 8];
        let mut completed_count = 0usize;

        let mut idx = 0;
        while idx < queue.len() {
            let thread = queue[idx];
            idx += 1;

            let action = self.compiled.action(thread.rule_id, thread.dfa_state);

            // Predict.
            for &(child_rule, target) in &action.rule_refs {
                let parent_after = Thread {
                    rule_id: thread.rule_id,
                    dfa_state: target,
                    return_level: thread.return_level,
                };
                returns.push((child_rule, parent_after));

                // If the parent completes the instant the child returns,
                // pre-register the grandparents as waiting on the child
                // too, so completion skips the pass-through hop.
                let parent_action =
                    self.compiled.action(parent_after.rule_id, parent_after.dfa_state);
                if parent_action.flags.is_pass_through()
                    && parent_after.return_level != NO_PARENT
                {
                    let level = parent_after.return_level as usize;
                    if level < self.return_offsets.len() {
                        let lo = self.return_offsets[level];
                        let hi = self
                            .return_offsets
                            .get(level + 1)
                            .copied()
                            .unwrap_or(self.return_arena.len());
                        for i in lo..hi {
                            let (expected, grandparent) = self.return_arena[i];
                            if expected == parent_after.rule_id {
                                returns.push((child_rule, grandparent));
                            }
                        }
                    }
                }

                if !self.push_rule_start(
                    RuleId(child_rule as u32),
                    current_level,
                    queue,
                    visited,
                ) {
                    // Already expanded this level; if it has completed,
                    // advance this parent immediately.
                    if completed_here[..completed_count].contains(&child_rule)
                        && visited.insert(parent_after)
                    {
                        queue.push(parent_after);
                    }
                }
            }

            // Complete.
            if action.flags.is_accepting() {
                if thread.return_level == current_level
                    && !completed_here[..completed_count].contains(&thread.rule_id)
                    && completed_count < completed_here.len()
                {
                    completed_here[completed_count] = thread.rule_id;
                    completed_count += 1;
                }
                self.complete(&thread, queue, visited, returns, can_stop, extra_returns);
            }

            if action.flags.has_char_edges() {
                scan.push(thread);
            }
        }
    }

    fn complete(
        &self,
        thread: &Thread,
        queue: &mut Vec<Thread>,
        visited: &mut SmallDedup<Thread>,
        returns: &mut Vec<(u16, Thread)>,
        can_stop: &mut bool,
        extra_returns: &[(u16, Thread)],
    ) {
        if thread.return_level == NO_PARENT {
            *can_stop = true;
            return;
        }

        let entry_level = thread.return_level as usize;
        let rule_id = thread.rule_id;

        if entry_level < self.return_offsets.len() {
            let lo = self.return_offsets[entry_level];
            let hi = self
                .return_offsets
                .get(entry_level + 1)
                .copied()
                .unwrap_or(self.return_arena.len());
            for i in lo..hi {
                let (expected, parent_after) = self.return_arena[i];
                if expected != rule_id {
                    continue;
                }
                // A self-referencing pass-through parent cascades ghost
                // completions through every earlier level; walk the chain
                // to its terminal instead of enqueueing each hop.
                if self.compiled.has_self_ref_chains
                    && parent_after.rule_id == thread.rule_id
                    && parent_after.return_level != NO_PARENT
                    && (parent_after.return_level as usize) < entry_level
                    && self
                        .compiled
                        .action(parent_after.rule_id, parent_after.dfa_state)
                        .flags
                        .is_pass_through()
                {
                    self.follow_chain(
                        parent_after.rule_id,
                        parent_after.dfa_state,
                        parent_after.return_level as usize,
                        queue,
                        visited,
                    );
                    continue;
                }
                if visited.insert(parent_after) {
                    queue.push(parent_after);
                }
            }
        }

        // Returns recorded in this same advance (level still being built).
        if entry_level == self.thread_offsets.len() {
            for i in 0..returns.len() {
                let (expected, parent_after) = returns[i];
                if expected == rule_id && visited.insert(parent_after) {
                    queue.push(parent_after);
                }
            }
            for &(expected, parent_after) in extra_returns {
                if expected == rule_id && visited.insert(parent_after) {
                    queue.push(parent_after);
                }
            }
        }
    }

    /// Walk a self-referencing completion chain down to the level where a
    /// different parent waits, caching the terminal for consecutive
    /// advances.
    fn follow_chain(
        &self,
        chain_rule: u16,
        chain_state: u16,
        start_level: usize,
        queue: &mut Vec<Thread>,
        visited: &mut SmallDedup<Thread>,
    ) {
        if let Some((rid, dfa, terminal, last_start)) = self.chain_terminal.get() {
            if rid == chain_rule
                && dfa == chain_state
                && start_level == last_start + 1
                && terminal < self.return_offsets.len()
            {
                self.drain_terminal_returns(chain_rule, terminal, queue, visited);
                self.chain_terminal
                    .set(Some((rid, dfa, terminal, start_level)));
                return;
            }
        }

        let mut level = start_level;
        loop {
            if level >= self.return_offsets.len() {
                break;
            }
            let lo = self.return_offsets[level];
            let hi = self
                .return_offsets
                .get(level + 1)
                .copied()
                .unwrap_or(self.return_arena.len());

            let mut next_level = None;
            for i in lo..hi {
                let (expected, parent) = self.return_arena[i];
                if expected != chain_rule {
                    continue;
                }
                if parent.rule_id == chain_rule
                    && parent.dfa_state == chain_state
                    && parent.return_level != NO_PARENT
                    && (parent.return_level as usize) < level
                {
                    next_level = Some(parent.return_level as usize);
                } else if visited.insert(parent) {
                    queue.push(parent);
                }
            }
            match next_level {
                Some(n) => level = n,
                None => {
                    self.chain_terminal
                        .set(Some((chain_rule, chain_state, level, start_level)));
                    break;
                }
            }
        }
    }

    fn drain_terminal_returns(
        &self,
        chain_rule: u16,
        terminal_level: usize,
        queue: &mut Vec<Thread>,
        visited: &mut SmallDedup<Thread>,
    ) {
        let lo = self.return_offsets[terminal_level];
        let hi = self
            .return_offsets
            .get(terminal_level + 1)
            .copied()
            .unwrap_or(self.return_arena.len());
        for i in lo..hi {
            let (expected, parent) = self.return_arena[i];
            if expected == chain_rule && visited.insert(parent) {
                queue.push(parent);
            }
        }
    }

    /// Queue a rule's DFA start state; false if deduplicated.
    fn push_rule_start(
        &self,
        rule: RuleId,
        return_level: u32,
        queue: &mut Vec<Thread>,
        visited: &mut SmallDedup<Thread>,
    ) -> bool {
        let dfa = &self.compiled.rule_dfas[rule.0 as usize];
        let thread = Thread {
            rule_id: rule.0 as u16,
            dfa_state: dfa.start.0 as u16,
            return_level,
        };
        if visited.insert(thread) {
            queue.push(thread);
            true
        } else {
            false
        }
    }

    /// Advance without committing: used by the bitmask trie walk. The
    /// surviving threads/returns land in `scan_buf`/`returns_buf`.
    pub(super) fn probe_advance(
        &self,
        threads: &[Thread],
        extra_returns: &[(u16, Thread)],
        byte: u8,
        queue_buf: &mut Vec<Thread>,
        visited_buf: &mut SmallDedup<Thread>,
        scan_buf: &mut Vec<Thread>,
        returns_buf: &mut Vec<(u16, Thread)>,
    ) -> bool {
        queue_buf.clear();
        visited_buf.clear();
        scan_buf.clear();
        returns_buf.clear();

        self.scan_threads(threads, byte, queue_buf, visited_buf, scan_buf);
        if queue_buf.is_empty() && scan_buf.is_empty() {
            return false;
        }
        let mut can_stop = false;
        if !queue_buf.is_empty() {
            self.run_queue(
                queue_buf,
                visited_buf,
                scan_buf,
                returns_buf,
                &mut can_stop,
                extra_returns,
            );
        }
        true
    }

    pub(super) fn is_completed(&self) -> bool {
        if self.steady.count > 0 {
            return self.steady.completed;
        }
        self.completed.last().copied().unwrap_or(false)
    }

    /// Hash of the live state for the bitmask cache.
    pub(super) fn state_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for t in self.current_threads() {
            t.hash(&mut hasher);
        }
        for &(rid, ref t) in self.current_returns() {
            rid.hash(&mut hasher);
            t.hash(&mut hasher);
        }
        self.is_completed().hash(&mut hasher);
        hasher.finish()
    }

    pub(super) fn current_threads(&self) -> &[Thread] {
        match self.thread_offsets.last() {
            Some(&lo) => &self.thread_arena[lo..],
            None => &[],
        }
    }

    pub(super) fn current_returns(&self) -> &[(u16, Thread)] {
        match self.return_offsets.last() {
            Some(&lo) => &self.return_arena[lo..],
            None => &[],
        }
    }

    /// Bytes consumed so far.
    pub(super) fn position(&self) -> usize {
        self.thread_offsets.len().saturating_sub(1) + self.steady.count
    }

    /// Drop the last `count` byte positions.
    pub(super) fn pop_levels(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        if self.steady.count > 0 {
            let from_lazy = count.min(self.steady.count);
            self.steady.count -= from_lazy;
            if from_lazy == count {
                return;
            }
            self.steady.active = false;
            self.pop_committed(count - from_lazy);
            return;
        }
        self.steady.active = false;
        self.pop_committed(count);
    }

    fn pop_committed(&mut self, count: usize) {
        for _ in 0..count {
            if self.thread_offsets.len() > 1 {
                let lo = self.thread_offsets.pop().unwrap();
                self.thread_arena.truncate(lo);
                let rlo = self.return_offsets.pop().unwrap();
                self.return_arena.truncate(rlo);
                self.completed.pop();
            }
        }
        self.chain_terminal.set(None);
    }

    pub(super) fn reset(&mut self) {
        self.steady.reset();
        self.chain_terminal.set(None);
        self.seed_root();
    }

    /// Commit the lazy steady run as one identical level. Zero deltas
    /// mean the level contents are exactly the previous level's.
    fn flush_steady(&mut self) {
        if self.steady.count == 0 {
            return;
        }
        let prev = *self.thread_offsets.last().unwrap();
        let new_start = self.thread_arena.len();
        self.thread_arena.extend_from_within(prev..);
        self.thread_offsets.push(new_start);

        let rprev = *self.return_offsets.last().unwrap();
        let new_rstart = self.return_arena.len();
        self.return_arena.extend_from_within(rprev..);
        self.return_offsets.push(new_rstart);

        self.completed.push(self.steady.completed);
        self.steady.count = 0;
    }

    /// Compare the two newest levels structurally; enter steady mode when
    /// they match and the deltas are uniform in {0, 1}.
    fn detect_steady_state(&mut self, byte: u8) {
        if self.thread_offsets.len() < 2 {
            return;
        }
        let n = self.thread_offsets.len();
        let prev = &self.thread_arena[self.thread_offsets[n - 2]..self.thread_offsets[n - 1]];
        let curr = &self.thread_arena[self.thread_offsets[n - 1]..];
        if prev.len() != curr.len() {
            return;
        }
        let same_shape = prev
            .iter()
            .zip(curr)
            .all(|(a, b)| a.rule_id == b.rule_id && a.dfa_state == b.dfa_state);
        if !same_shape {
            return;
        }

        let rprev = &self.return_arena[self.return_offsets[n - 2]..self.return_offsets[n - 1]];
        let rcurr = &self.return_arena[self.return_offsets[n - 1]..];
        if rprev.len() != rcurr.len() {
            return;
        }
        let returns_same = rprev.iter().zip(rcurr).all(|(a, b)| {
            a.0 == b.0 && a.1.rule_id == b.1.rule_id && a.1.dfa_state == b.1.dfa_state
        });
        if !returns_same {
            return;
        }

        let thread_deltas: Vec<i32> = prev
            .iter()
            .zip(curr)
            .map(|(p, c)| {
                if p.return_level == NO_PARENT {
                    0
                } else {
                    c.return_level as i32 - p.return_level as i32
                }
            })
            .collect();
        if thread_deltas.iter().any(|&d| !(0..=1).contains(&d)) {
            return;
        }
        let return_deltas: Vec<i32> = rprev
            .iter()
            .zip(rcurr)
            .map(|(p, c)| {
                if p.1.return_level == NO_PARENT {
                    0
                } else {
                    c.1.return_level as i32 - p.1.return_level as i32
                }
            })
            .collect();
        if return_deltas.iter().any(|&d| !(0..=1).contains(&d)) {
            return;
        }

        let all_zero =
            thread_deltas.iter().all(|&d| d == 0) && return_deltas.iter().all(|&d| d == 0);

        if let Some(ranges) = self.steady_ranges(curr, byte) {
            self.steady.ranges = ranges;
            self.steady.completed = *self.completed.last().unwrap();
            self.steady.lazy = all_zero;
            self.steady.thread_deltas = thread_deltas;
            self.steady.return_deltas = return_deltas;
            self.steady.active = true;
        }
    }

    /// Byte ranges that keep the level shape: for every thread that
    /// advanced directly on `byte`, the ranges leading to the same DFA
    /// target. Threads re-created by predict each advance don't
    /// constrain the result.
    fn steady_ranges(&self, threads: &[Thread], byte: u8) -> Option<Vec<(u8, u8)>> {
        let mut agreed: Option<Vec<(u8, u8)>> = None;
        let mut any_direct = false;

        for t in threads {
            let dfa = &self.compiled.rule_dfas[t.rule_id as usize];
            let Some(target) = dfa.fsm.next_state(StateId(t.dfa_state as u32), byte) else {
                continue;
            };
            any_direct = true;
            let ranges: Vec<(u8, u8)> = dfa
                .fsm
                .edges(StateId(t.dfa_state as u32))
                .iter()
                .filter_map(|e| match e {
                    FsmEdge::CharRange { min, max, target: tgt } if *tgt == target => {
                        Some((*min, *max))
                    }
                    _ => None,
                })
                .collect();
            match &agreed {
                None => agreed = Some(ranges),
                Some(prev) if *prev == ranges => {}
                _ => return None,
            }
        }

        if any_direct {
            agreed
        } else {
            None
        }
    }
}

impl Clone for StackParser {
    fn clone(&self) -> Self {
        let mut cloned = Self {
            compiled: Arc::clone(&self.compiled),
            thread_arena: self.thread_arena.clone(),
            thread_offsets: self.thread_offsets.clone(),
            return_arena: self.return_arena.clone(),
            return_offsets: self.return_offsets.clone(),
            completed: self.completed.clone(),
            buf_queue: Vec::new(),
            buf_visited: SmallDedup::new(),
            buf_scan: Vec::new(),
            buf_returns: Vec::new(),
            steady: Steady::new(),
            chain_terminal: Cell::new(None),
        };
        // Materialize any lazy steady bytes so the clone starts clean.
        if self.steady.count > 0 {
            let prev = *cloned.thread_offsets.last().unwrap();
            let new_start = cloned.thread_arena.len();
            cloned.thread_arena.extend_from_within(prev..);
            cloned.thread_offsets.push(new_start);
            let rprev = *cloned.return_offsets.last().unwrap();
            let new_rstart = cloned.return_arena.len();
            cloned.return_arena.extend_from_within(rprev..);
            cloned.return_offsets.push(new_rstart);
            cloned.completed.push(self.steady.completed);
        }
        cloned
    }
}
