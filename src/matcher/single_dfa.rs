//! Fast path for grammars whose root rule compiles to a single DFA with
//! no rule references: raw byte-table stepping, no pushdown.

use std::collections::VecDeque;

use crate::bitmask::{self, set_bit};
use crate::compiled_grammar::CompiledGrammar;
use crate::fsm::{StateId, NO_DFA_STATE};
use crate::tokenizer::TokenizerInfo;

pub(super) struct SingleDfaEngine {
    pub(super) rule_idx: usize,
    pub(super) state: u16,
    /// Pre-advance states of accepted tokens, for rollback.
    pub(super) history: VecDeque<u16>,
}

impl SingleDfaEngine {
    pub(super) fn new(rule_idx: usize, initial_state: u16) -> Self {
        Self {
            rule_idx,
            state: initial_state,
            history: VecDeque::new(),
        }
    }

    /// Step through all bytes; on a dead end the state is untouched.
    pub(super) fn advance_bytes(&mut self, compiled: &CompiledGrammar, bytes: &[u8]) -> bool {
        let table = compiled.rule_dfas[self.rule_idx].fsm.byte_table();
        let mut state = self.state as usize;
        for &byte in bytes {
            let next = table[state * 256 + byte as usize];
            if next == NO_DFA_STATE {
                return false;
            }
            state = next as usize;
        }
        self.history.push_back(self.state);
        self.state = state as u16;
        true
    }

    pub(super) fn is_completed(&self, compiled: &CompiledGrammar) -> bool {
        compiled.rule_dfas[self.rule_idx].is_end(StateId(self.state as u32))
    }

    pub(super) fn state_hash(&self) -> u64 {
        self.state as u64
    }

    /// Pop up to `count` accepted tokens; returns how many were undone.
    pub(super) fn rollback(&mut self, count: usize) -> usize {
        let n = count.min(self.history.len());
        for _ in 0..n {
            self.state = self.history.pop_back().unwrap();
        }
        n
    }

    pub(super) fn reset(&mut self, compiled: &CompiledGrammar) {
        self.state = compiled.rule_dfas[self.rule_idx].start.0 as u16;
        self.history.clear();
    }

    /// Longest forced byte sequence from the current state.
    pub(super) fn find_jump_forward(&self, compiled: &CompiledGrammar) -> String {
        let dfa = &compiled.rule_dfas[self.rule_idx];
        let table = dfa.fsm.byte_table();
        let mut state = self.state;
        let mut forced = Vec::new();
        loop {
            if dfa.is_end(StateId(state as u32)) {
                break;
            }
            let Some(byte) = super::sole_next_byte(dfa.fsm.edges(StateId(state as u32))) else {
                break;
            };
            let next = table[state as usize * 256 + byte as usize];
            if next == NO_DFA_STATE {
                break;
            }
            forced.push(byte);
            state = next;
        }
        String::from_utf8(forced).unwrap_or_default()
    }

    /// Precomputed mask plus a byte-table trie walk for the uncertain
    /// tokens.
    pub(super) fn fill_bitmask(
        &self,
        compiled: &CompiledGrammar,
        tokenizer: &TokenizerInfo,
        mask: &mut [u32],
        stack: &mut Vec<u16>,
        active_prefix: &mut Vec<u8>,
    ) {
        let key = self.state_hash();
        if compiled.cached_bitmask(key, mask) {
            return;
        }

        let dfa_key = (self.rule_idx as u32, self.state as u32);
        let mut walk_needed = false;
        if let Some(token_mask) = compiled.token_masks.get(&dfa_key) {
            for (j, &word) in token_mask.accepted.iter().enumerate() {
                if j < mask.len() {
                    mask[j] |= word;
                }
            }
            walk_needed = !token_mask.uncertain.is_empty();
        }

        if walk_needed {
            self.trie_walk(compiled, tokenizer, mask, stack, active_prefix);
        }

        compiled.store_bitmask(key, mask);
    }

    fn trie_walk(
        &self,
        compiled: &CompiledGrammar,
        tokenizer: &TokenizerInfo,
        mask: &mut [u32],
        stack: &mut Vec<u16>,
        active_prefix: &mut Vec<u8>,
    ) {
        let sorted = tokenizer.sorted_vocab();
        let trie_end = tokenizer.trie_subtree_end();
        let table = compiled.rule_dfas[self.rule_idx].fsm.byte_table();

        stack.clear();
        stack.push(self.state);
        active_prefix.clear();

        let mut i = 0;
        while i < sorted.len() {
            let (token_id, ref bytes) = sorted[i];
            if bitmask::get_bit(mask, token_id as usize) {
                i += 1;
                continue;
            }

            let common = super::common_prefix_len(bytes, active_prefix);
            if common < active_prefix.len() {
                stack.truncate(common + 1);
                active_prefix.truncate(common);
            }

            let mut dead = false;
            for &byte in &bytes[common..] {
                let state = *stack.last().unwrap() as usize;
                let next = table[state * 256 + byte as usize];
                if next == NO_DFA_STATE {
                    if active_prefix.is_empty() {
                        i = trie_end[i];
                    } else {
                        i += 1;
                    }
                    dead = true;
                    break;
                }
                stack.push(next);
                active_prefix.push(byte);
            }

            if !dead {
                set_bit(mask, token_id as usize);
                i += 1;
            }
        }
    }
}
