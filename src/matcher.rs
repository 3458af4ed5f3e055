//! Token-level matcher: accept tokens, fill next-token bitmasks, roll
//! back, jump forward.
//!
//! A matcher owns mutable per-request state over a shared
//! [`CompiledGrammar`]. All operations are pure state transitions; a
//! rejected token leaves the matcher exactly as it was.

mod single_dfa;
mod stack_parser;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::bitmask::{self, set_bit};
use crate::compiled_grammar::CompiledGrammar;
use crate::error::{Error, Result};
use crate::fsm::{FsmEdge, StateId};
use crate::grammar::Grammar;
use crate::tokenizer::TokenizerInfo;

use single_dfa::SingleDfaEngine;
use stack_parser::{SmallDedup, StackParser, Thread};

enum Engine {
    /// Root rule compiled to one DFA: raw byte-table stepping.
    SingleDfa(SingleDfaEngine),
    /// General pushdown over per-rule DFAs.
    Stack(StackParser),
}

/// Grammar-constrained token matcher.
pub struct GrammarMatcher {
    engine: Engine,
    compiled: Arc<CompiledGrammar>,
    tokenizer: Arc<TokenizerInfo>,
    stop_token_ids: Vec<u32>,
    /// Byte length of each accepted token, newest last; bounds rollback.
    token_length_history: VecDeque<usize>,
    terminated: bool,
    max_rollback_tokens: usize,
    scratch: WalkScratch,
}

/// Reusable buffers for the bitmask trie walk.
struct WalkScratch {
    level_threads: Vec<Thread>,
    level_thread_offsets: Vec<usize>,
    level_returns: Vec<(u16, Thread)>,
    level_return_offsets: Vec<usize>,
    active_prefix: Vec<u8>,
    queue: Vec<Thread>,
    visited: SmallDedup<Thread>,
    scan: Vec<Thread>,
    returns: Vec<(u16, Thread)>,
    dfa_stack: Vec<u16>,
    dfa_prefix: Vec<u8>,
}

impl WalkScratch {
    fn new() -> Self {
        Self {
            level_threads: Vec::new(),
            level_thread_offsets: Vec::new(),
            level_returns: Vec::new(),
            level_return_offsets: Vec::new(),
            active_prefix: Vec::new(),
            queue: Vec::new(),
            visited: SmallDedup::new(),
            scan: Vec::new(),
            returns: Vec::new(),
            dfa_stack: Vec::new(),
            dfa_prefix: Vec::new(),
        }
    }
}

impl GrammarMatcher {
    /// Create a matcher over a compiled grammar. `stop_token_ids`
    /// overrides the tokenizer's designated stop tokens when given.
    pub fn new(
        compiled: Arc<CompiledGrammar>,
        tokenizer: Arc<TokenizerInfo>,
        stop_token_ids: Option<Vec<u32>>,
        max_rollback_tokens: usize,
    ) -> Self {
        debug_assert_eq!(compiled.vocab_size(), tokenizer.vocab_size());
        let stop_token_ids =
            stop_token_ids.unwrap_or_else(|| tokenizer.stop_token_ids().to_vec());

        let parser = StackParser::new(compiled.clone());
        let engine = if compiled.is_single_dfa
            && parser.current_threads().len() == 1
            && parser.current_returns().is_empty()
        {
            let rule_idx = compiled.grammar.root_rule().0 as usize;
            let initial = parser.current_threads()[0].dfa_state;
            Engine::SingleDfa(SingleDfaEngine::new(rule_idx, initial))
        } else {
            Engine::Stack(parser)
        };

        Self {
            engine,
            compiled,
            tokenizer,
            stop_token_ids,
            token_length_history: VecDeque::new(),
            terminated: false,
            max_rollback_tokens,
            scratch: WalkScratch::new(),
        }
    }

    /// Compile `grammar` and build a matcher in one step.
    pub fn from_grammar(
        grammar: &Grammar,
        tokenizer: Arc<TokenizerInfo>,
        stop_token_ids: Option<Vec<u32>>,
        max_rollback_tokens: usize,
    ) -> Result<Self> {
        let compiled = Arc::new(CompiledGrammar::compile(grammar, &tokenizer)?);
        Ok(Self::new(
            compiled,
            tokenizer,
            stop_token_ids,
            max_rollback_tokens,
        ))
    }

    /// Consume one token. `Ok(false)` means the grammar rejects it and
    /// the matcher is unchanged. Stop tokens are accepted only when the
    /// grammar (and the root lookahead) can terminate here; accepting one
    /// terminates the matcher.
    pub fn accept_token(&mut self, token_id: u32) -> Result<bool> {
        if self.terminated {
            return Err(Error::matcher(
                "accept_token on a terminated matcher; call reset or rollback",
            ));
        }
        if token_id as usize >= self.tokenizer.vocab_size() {
            return Err(Error::matcher(format!(
                "token id {token_id} out of range for vocabulary of {}",
                self.tokenizer.vocab_size()
            )));
        }

        if self.stop_token_ids.contains(&token_id) {
            if self.can_terminate() {
                self.terminated = true;
                return Ok(true);
            }
            return Ok(false);
        }

        if self.tokenizer.special_token_ids().contains(&token_id) {
            return Ok(false);
        }

        let bytes = match self.tokenizer.token_bytes(token_id) {
            Some(b) if !b.is_empty() => b.to_vec(),
            _ => return Ok(false),
        };

        let ok = match &mut self.engine {
            Engine::SingleDfa(e) => e.advance_bytes(&self.compiled, &bytes),
            Engine::Stack(p) => p.advance_bytes(&bytes),
        };
        if !ok {
            return Ok(false);
        }
        self.record_token(bytes.len());
        Ok(true)
    }

    /// Consume a raw string (debugging and tests). False on rejection,
    /// with the matcher unchanged.
    pub fn accept_string(&mut self, s: &str) -> bool {
        if self.terminated || s.is_empty() {
            return false;
        }
        let ok = match &mut self.engine {
            Engine::SingleDfa(e) => e.advance_bytes(&self.compiled, s.as_bytes()),
            Engine::Stack(p) => p.advance_bytes(s.as_bytes()),
        };
        if ok {
            self.record_token(s.len());
        }
        ok
    }

    fn record_token(&mut self, len: usize) {
        self.token_length_history.push_back(len);
        while self.token_length_history.len() > self.max_rollback_tokens {
            self.token_length_history.pop_front();
            if let Engine::SingleDfa(e) = &mut self.engine {
                e.history.pop_front();
            }
        }
    }

    /// Fill `mask` with the tokens that may come next. Returns `true`
    /// when the mask constrains sampling; `false` when every vocabulary
    /// token is permitted (the caller may skip applying it, e.g. inside a
    /// structural-tag free-text region).
    ///
    /// On a terminated matcher the mask holds exactly the stop tokens.
    pub fn fill_next_token_bitmask(&mut self, mask: &mut [u32]) -> bool {
        let vocab_size = self.tokenizer.vocab_size();
        debug_assert!(mask.len() >= bitmask::bitmask_size(vocab_size));
        bitmask::fill_none(mask);

        if self.terminated {
            for &stop in &self.stop_token_ids {
                if (stop as usize) < vocab_size {
                    set_bit(mask, stop as usize);
                }
            }
            return true;
        }

        if self.can_terminate() {
            for &stop in &self.stop_token_ids {
                if (stop as usize) < vocab_size {
                    set_bit(mask, stop as usize);
                }
            }
        }

        if let Engine::SingleDfa(e) = &self.engine {
            e.fill_bitmask(
                &self.compiled,
                &self.tokenizer,
                mask,
                &mut self.scratch.dfa_stack,
                &mut self.scratch.dfa_prefix,
            );
        } else {
            self.fill_bitmask_stack(mask);
        }

        !bitmask::is_all_set(mask, vocab_size)
    }

    fn fill_bitmask_stack(&mut self, mask: &mut [u32]) {
        let parser = match &self.engine {
            Engine::Stack(p) => p,
            Engine::SingleDfa(_) => unreachable!(),
        };

        let state_key = parser.state_hash();
        if self.compiled.cached_bitmask(state_key, mask) {
            return;
        }

        // Fast path: OR the precomputed accept masks of each distinct
        // (rule, dfa_state) pair among the live threads.
        let threads = parser.current_threads();
        let mut seen = [(0u32, 0u32); 16];
        let mut seen_count = 0usize;
        let mut walk_needed = false;
        for t in threads {
            let key = (t.rule_id as u32, t.dfa_state as u32);
            if seen[..seen_count].contains(&key) {
                continue;
            }
            if seen_count < seen.len() {
                seen[seen_count] = key;
                seen_count += 1;
            }
            if let Some(token_mask) = self.compiled.token_masks.get(&key) {
                for (j, &word) in token_mask.accepted.iter().enumerate() {
                    if j < mask.len() {
                        mask[j] |= word;
                    }
                }
                if !token_mask.uncertain.is_empty() {
                    walk_needed = true;
                }
            }
        }

        if walk_needed {
            self.fill_bitmask_trie_walk(mask);
        }
        self.compiled.store_bitmask(state_key, mask);
    }

    /// Resolve uncertain tokens with a shared-prefix walk over the sorted
    /// vocabulary: levels of probed parser state are kept per prefix byte
    /// so sibling tokens reuse the common prefix's work.
    fn fill_bitmask_trie_walk(&mut self, mask: &mut [u32]) {
        let parser = match &self.engine {
            Engine::Stack(p) => p,
            Engine::SingleDfa(_) => unreachable!(),
        };
        let sorted = self.tokenizer.sorted_vocab();
        let trie_end = self.tokenizer.trie_subtree_end();

        let s = &mut self.scratch;
        s.level_threads.clear();
        s.level_thread_offsets.clear();
        s.level_returns.clear();
        s.level_return_offsets.clear();
        s.active_prefix.clear();

        s.level_thread_offsets.push(0);
        s.level_threads.extend_from_slice(parser.current_threads());
        s.level_return_offsets.push(0);
        s.level_returns.extend_from_slice(parser.current_returns());

        let mut i = 0;
        while i < sorted.len() {
            let (token_id, ref bytes) = sorted[i];
            if bitmask::get_bit(mask, token_id as usize) {
                i += 1;
                continue;
            }

            let s = &mut self.scratch;
            let common = common_prefix_len(bytes, &s.active_prefix);
            if common < s.active_prefix.len() {
                let keep = common + 1;
                if keep < s.level_thread_offsets.len() {
                    let t_end = s.level_thread_offsets[keep];
                    s.level_threads.truncate(t_end);
                    s.level_thread_offsets.truncate(keep);
                    let r_end = s.level_return_offsets[keep];
                    s.level_returns.truncate(r_end);
                    s.level_return_offsets.truncate(keep);
                }
                s.active_prefix.truncate(common);
            }

            let mut dead = false;
            for &byte in &bytes[common..] {
                let s = &mut self.scratch;
                let t_start = *s.level_thread_offsets.last().unwrap();
                let r_start = *s.level_return_offsets.last().unwrap();
                // Split scratch between the probe inputs and its buffers.
                let threads = &s.level_threads[t_start..];
                let returns = &s.level_returns[r_start..];
                if parser.probe_advance(
                    threads,
                    returns,
                    byte,
                    &mut s.queue,
                    &mut s.visited,
                    &mut s.scan,
                    &mut s.returns,
                ) {
                    s.level_thread_offsets.push(s.level_threads.len());
                    let (arena, probed) = (&mut s.level_threads, &s.scan);
                    arena.extend_from_slice(probed);
                    s.level_return_offsets.push(s.level_returns.len());
                    let (rarena, rprobed) = (&mut s.level_returns, &s.returns);
                    rarena.extend_from_slice(rprobed);
                    s.active_prefix.push(byte);
                } else {
                    if s.active_prefix.is_empty() {
                        i = trie_end[i];
                    } else {
                        i += 1;
                    }
                    dead = true;
                    break;
                }
            }

            if !dead {
                set_bit(mask, token_id as usize);
                i += 1;
            }
        }
    }

    /// Undo the last `num_tokens` accepted tokens. Errors when the
    /// request exceeds the rollback window or the recorded history.
    /// Rolling back out of a terminated state reactivates the matcher.
    pub fn rollback(&mut self, num_tokens: usize) -> Result<()> {
        if num_tokens > self.max_rollback_tokens {
            return Err(Error::matcher(format!(
                "rollback of {num_tokens} tokens exceeds the window of {}",
                self.max_rollback_tokens
            )));
        }
        // Accepting the stop token consumes no bytes; leaving the
        // terminated state is the first "token" undone.
        let undo_termination = self.terminated && num_tokens > 0;
        let remaining = num_tokens - usize::from(undo_termination);
        if remaining > self.token_length_history.len() {
            return Err(Error::matcher(format!(
                "rollback of {num_tokens} tokens but only {} recorded",
                self.token_length_history.len() + usize::from(self.terminated)
            )));
        }
        if undo_termination {
            self.terminated = false;
        }

        match &mut self.engine {
            Engine::SingleDfa(e) => {
                let undone = e.rollback(remaining);
                debug_assert_eq!(undone, remaining);
                for _ in 0..undone {
                    self.token_length_history.pop_back();
                }
            }
            Engine::Stack(p) => {
                for _ in 0..remaining {
                    let len = self
                        .token_length_history
                        .pop_back()
                        .expect("checked against history length");
                    p.pop_levels(len);
                }
            }
        }
        Ok(())
    }

    /// The longest continuation every surviving thread is forced to emit.
    /// Read-only: matcher state is unchanged.
    pub fn find_jump_forward_string(&mut self) -> String {
        if self.terminated {
            return String::new();
        }
        match &mut self.engine {
            Engine::SingleDfa(e) => e.find_jump_forward(&self.compiled),
            Engine::Stack(parser) => {
                if parser.is_completed() {
                    return String::new();
                }
                let start_pos = parser.position();
                let mut forced = Vec::new();

                loop {
                    if parser.is_completed() {
                        break;
                    }
                    let threads = parser.current_threads().to_vec();
                    if threads.is_empty() {
                        break;
                    }

                    let mut agreed: Option<u8> = None;
                    let mut conflict = false;
                    for t in &threads {
                        let flags = self.compiled.action(t.rule_id, t.dfa_state).flags;
                        // Rule boundaries and accept points branch.
                        if flags.has_rule_ref() || flags.is_accepting() {
                            conflict = true;
                            break;
                        }
                        let dfa = &self.compiled.rule_dfas[t.rule_id as usize];
                        let byte = sole_next_byte(dfa.fsm.edges(StateId(t.dfa_state as u32)));
                        match (byte, agreed) {
                            (None, _) => {
                                conflict = true;
                                break;
                            }
                            (Some(b), None) => agreed = Some(b),
                            (Some(b), Some(prev)) if b == prev => {}
                            _ => {
                                conflict = true;
                                break;
                            }
                        }
                    }
                    if conflict {
                        break;
                    }
                    let Some(byte) = agreed else { break };
                    if !parser.advance(byte) {
                        break;
                    }
                    forced.push(byte);
                }

                let advanced = parser.position() - start_pos;
                parser.pop_levels(advanced);
                String::from_utf8_lossy(&forced).into_owned()
            }
        }
    }

    /// True iff the last accepted token was a stop token.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether a stop token would be accepted right now.
    pub fn can_terminate(&self) -> bool {
        if !self.compiled.lookahead_allows_stop {
            return false;
        }
        match &self.engine {
            Engine::SingleDfa(e) => e.is_completed(&self.compiled),
            Engine::Stack(p) => p.is_completed(),
        }
    }

    /// Return to the initial state.
    pub fn reset(&mut self) {
        match &mut self.engine {
            Engine::SingleDfa(e) => e.reset(&self.compiled),
            Engine::Stack(p) => p.reset(),
        }
        self.token_length_history.clear();
        self.terminated = false;
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// When a DFA state's char edges all force the same single byte, return
/// it.
fn sole_next_byte(edges: &[FsmEdge]) -> Option<u8> {
    let mut forced = None;
    for e in edges {
        if let FsmEdge::CharRange { min, max, .. } = e {
            if min != max {
                return None;
            }
            match forced {
                None => forced = Some(*min),
                Some(b) if b == *min => {}
                _ => return None,
            }
        }
    }
    forced
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmask::{bitmask_size, get_bit};

    fn matcher(ebnf: &str, vocab: &[&str]) -> GrammarMatcher {
        let g = Grammar::from_ebnf(ebnf, "root").unwrap();
        let tok = Arc::new(TokenizerInfo::from_raw(vocab, vec![]));
        GrammarMatcher::from_grammar(&g, tok, None, 16).unwrap()
    }

    fn matcher_with_stop(ebnf: &str, vocab: &[&str], stop: Vec<u32>) -> GrammarMatcher {
        let g = Grammar::from_ebnf(ebnf, "root").unwrap();
        let tok = Arc::new(TokenizerInfo::from_raw(vocab, stop.clone()));
        GrammarMatcher::from_grammar(&g, tok, Some(stop), 16).unwrap()
    }

    #[test]
    fn test_accept_string_simple() {
        let mut m = matcher(r#"root ::= "hello""#, &["hello"]);
        assert!(m.accept_string("hello"));
        assert!(m.can_terminate());
    }

    #[test]
    fn test_reject_leaves_state_unchanged() {
        let mut m = matcher(r#"root ::= "hello""#, &["hello"]);
        assert!(!m.accept_string("help"));
        assert!(m.accept_string("hello"));
        assert!(m.can_terminate());
    }

    #[test]
    fn test_choices_and_multi_rule() {
        let mut m = matcher(
            "root ::= greeting \" \" name\ngreeting ::= \"hi\" | \"hello\"\nname ::= \"ana\" | \"bo\"",
            &["x"],
        );
        assert!(m.accept_string("hi ana"));
        assert!(m.can_terminate());
        m.reset();
        assert!(m.accept_string("hello bo"));
        assert!(m.can_terminate());
        m.reset();
        assert!(!m.accept_string("hello cat"));
    }

    #[test]
    fn test_accept_token_sequence() {
        let mut m = matcher(r#"root ::= "hello world""#, &["hello", " ", "world"]);
        assert_eq!(m.accept_token(0).unwrap(), true);
        assert_eq!(m.accept_token(1).unwrap(), true);
        assert_eq!(m.accept_token(2).unwrap(), true);
        assert!(m.can_terminate());
    }

    #[test]
    fn test_token_id_out_of_range() {
        let mut m = matcher(r#"root ::= "x""#, &["x"]);
        assert!(matches!(m.accept_token(9), Err(Error::Matcher(_))));
    }

    #[test]
    fn test_bitmask_prefix_filtering() {
        let mut m = matcher(r#"root ::= "abc""#, &["a", "ab", "abc", "b", "bc", "c"]);
        let mut mask = vec![0u32; bitmask_size(6)];
        assert!(m.fill_next_token_bitmask(&mut mask));
        assert!(get_bit(&mask, 0));
        assert!(get_bit(&mask, 1));
        assert!(get_bit(&mask, 2));
        assert!(!get_bit(&mask, 3));
        assert!(!get_bit(&mask, 4));
        assert!(!get_bit(&mask, 5));

        assert!(m.accept_token(0).unwrap());
        assert!(m.fill_next_token_bitmask(&mut mask));
        assert!(!get_bit(&mask, 0));
        assert!(get_bit(&mask, 3)); // "b"
        assert!(get_bit(&mask, 4)); // "bc"
        assert!(!get_bit(&mask, 5));
    }

    #[test]
    fn test_bitmask_stop_tokens() {
        let mut m = matcher_with_stop(
            r#"root ::= "a" | "ab""#,
            &["a", "ab", "b", "<eos>"],
            vec![3],
        );
        let mut mask = vec![0u32; bitmask_size(4)];
        m.fill_next_token_bitmask(&mut mask);
        assert!(get_bit(&mask, 0));
        assert!(get_bit(&mask, 1));
        assert!(!get_bit(&mask, 2));
        assert!(!get_bit(&mask, 3)); // cannot stop yet

        assert!(m.accept_token(0).unwrap());
        m.fill_next_token_bitmask(&mut mask);
        assert!(!get_bit(&mask, 0));
        assert!(get_bit(&mask, 2)); // "b" completes the "ab" branch
        assert!(get_bit(&mask, 3)); // may stop after "a"
    }

    #[test]
    fn test_stop_token_terminates() {
        let mut m = matcher_with_stop(r#"root ::= "hi""#, &["hi", "<eos>"], vec![1]);
        assert_eq!(m.accept_token(1).unwrap(), false); // not complete yet
        assert!(m.accept_token(0).unwrap());
        assert!(m.accept_token(1).unwrap());
        assert!(m.is_terminated());
        assert!(matches!(m.accept_token(0), Err(Error::Matcher(_))));

        let mut mask = vec![0u32; bitmask_size(2)];
        assert!(m.fill_next_token_bitmask(&mut mask));
        assert!(!get_bit(&mask, 0));
        assert!(get_bit(&mask, 1));
    }

    #[test]
    fn test_rollback_and_replay() {
        let mut m = matcher(r#"root ::= "abcd""#, &["a", "b", "c", "d"]);
        assert!(m.accept_token(0).unwrap());
        assert!(m.accept_token(1).unwrap());
        assert!(m.accept_token(2).unwrap());
        m.rollback(2).unwrap();
        assert!(m.accept_token(1).unwrap());
        assert!(m.accept_token(2).unwrap());
        assert!(m.accept_token(3).unwrap());
        assert!(m.can_terminate());
    }

    #[test]
    fn test_rollback_bitmask_identical() {
        let mut m = matcher(r#"root ::= [0-9]{3}"#, &["0", "1", "2", "x"]);
        let mut before = vec![0u32; bitmask_size(4)];
        assert!(m.accept_token(0).unwrap());
        m.fill_next_token_bitmask(&mut before);

        assert!(m.accept_token(1).unwrap());
        m.rollback(1).unwrap();
        let mut after = vec![0u32; bitmask_size(4)];
        m.fill_next_token_bitmask(&mut after);
        assert_eq!(before, after);

        assert!(m.accept_token(1).unwrap());
        assert!(m.accept_token(2).unwrap());
        assert!(m.can_terminate());
    }

    #[test]
    fn test_rollback_out_of_range() {
        let mut m = matcher(r#"root ::= "ab""#, &["a", "b"]);
        assert!(m.accept_token(0).unwrap());
        assert!(matches!(m.rollback(2), Err(Error::Matcher(_))));
        assert!(matches!(m.rollback(100), Err(Error::Matcher(_))));
        m.rollback(1).unwrap();
        assert!(m.accept_token(0).unwrap());
    }

    #[test]
    fn test_rollback_past_termination_reactivates() {
        let mut m = matcher_with_stop(r#"root ::= "a""#, &["a", "<eos>"], vec![1]);
        assert!(m.accept_token(0).unwrap());
        assert!(m.accept_token(1).unwrap());
        assert!(m.is_terminated());
        m.rollback(1).unwrap();
        assert!(!m.is_terminated());
        assert!(m.accept_token(1).unwrap());
        assert!(m.is_terminated());
    }

    #[test]
    fn test_jump_forward() {
        let mut m = matcher(r#"root ::= "hello""#, &["hello"]);
        assert_eq!(m.find_jump_forward_string(), "hello");

        let mut m = matcher(r#"root ::= "pre" ("a" | "b")"#, &["pre"]);
        assert_eq!(m.find_jump_forward_string(), "pre");
        // State unchanged by the walk.
        assert!(m.accept_string("prea"));
        assert!(m.can_terminate());

        let mut m = matcher(r#"root ::= "ab" "cd""#, &["ab", "cd"]);
        assert!(m.accept_string("ab"));
        assert_eq!(m.find_jump_forward_string(), "cd");
    }

    #[test]
    fn test_quantifiers_via_matcher() {
        let mut m = matcher(r#"root ::= "a"*"#, &["a"]);
        assert!(m.can_terminate());
        assert!(m.accept_string("aaa"));
        assert!(m.can_terminate());

        let mut m = matcher(r#"root ::= "a"+"#, &["a"]);
        assert!(!m.can_terminate());
        assert!(m.accept_string("a"));
        assert!(m.can_terminate());

        let mut m = matcher(r#"root ::= "a"?"#, &["a"]);
        assert!(m.can_terminate());
        assert!(m.accept_string("a"));
        assert!(m.can_terminate());
        assert!(!m.accept_string("a"));
    }

    #[test]
    fn test_class_star_and_unicode() {
        let mut m = matcher(r#"root ::= [a-z]*"#, &["a"]);
        assert!(m.can_terminate());
        assert!(m.accept_string("abcxyz"));
        assert!(m.can_terminate());

        let mut m = matcher(r#"root ::= [一-鿿]+"#, &["a"]);
        assert!(m.accept_string("\u{4e00}\u{9fff}"));
        assert!(m.can_terminate());
        m.reset();
        assert!(!m.accept_string("a"));
    }

    #[test]
    fn test_lookahead_blocks_stop() {
        // Lookahead requires a following "!", which never arrives: the
        // stop token must stay rejected.
        let mut m = matcher_with_stop(r#"root ::= "a" (= "!")"#, &["a", "<eos>"], vec![1]);
        assert!(m.accept_token(0).unwrap());
        assert!(!m.can_terminate());
        assert_eq!(m.accept_token(1).unwrap(), false);

        // A nullable lookahead admits the stop token.
        let mut m =
            matcher_with_stop(r#"root ::= "a" (= "!"?)"#, &["a", "<eos>"], vec![1]);
        assert!(m.accept_token(0).unwrap());
        assert!(m.accept_token(1).unwrap());
    }

    #[test]
    fn test_steady_state_long_string_content() {
        let mut m = matcher(r#"root ::= "\"" [^"\\]* "\"""#, &["a"]);
        assert!(m.accept_string("\""));
        assert!(m.accept_string(&"x".repeat(300)));
        assert!(m.accept_string("\""));
        assert!(m.can_terminate());
    }

    #[test]
    fn test_steady_state_rollback() {
        let mut m = matcher(r#"root ::= "\"" [^"\\]* "\"""#, &["a"]);
        assert!(m.accept_string("\""));
        assert!(m.accept_string("ABCDE"));
        m.rollback(1).unwrap();
        assert!(m.accept_string("XYZ\""));
        assert!(m.can_terminate());
    }

    #[test]
    fn test_recursive_json_grammar() {
        let g = Grammar::builtin_json();
        let tok = Arc::new(TokenizerInfo::from_raw(&["x"], vec![]));
        let mut m = GrammarMatcher::from_grammar(g, tok, None, 16).unwrap();
        assert!(m.accept_string(r#"{"library": "tokengate", "versions": [1, 2.5, null]}"#));
        assert!(m.can_terminate());
        m.reset();
        assert!(!m.accept_string("{\"a\": }"));
    }

    #[test]
    fn test_wildcard_region_reports_mask_skip() {
        // Any codepoint forever: the mask constrains nothing.
        let g = Grammar::from_ebnf("root ::= [^\u{0}]*", "root").unwrap();
        let tok = Arc::new(TokenizerInfo::from_raw(&["ab", "cd", "<eos>"], vec![2]));
        let mut m = GrammarMatcher::from_grammar(&g, tok, None, 16).unwrap();
        let mut mask = vec![0u32; bitmask_size(3)];
        assert!(!m.fill_next_token_bitmask(&mut mask));
        assert!(get_bit(&mask, 0));
        assert!(get_bit(&mask, 1));
        assert!(get_bit(&mask, 2));
    }
}
