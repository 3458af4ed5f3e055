//! Grammar compilation: normalized AST → per-rule DFAs → precomputed
//! per-token acceptance traces.
//!
//! A [`CompiledGrammar`] is immutable and shared across matcher instances
//! behind an `Arc`. For every `(rule, dfa_state)` pair it tabulates, per
//! vocabulary token, whether the token is definitely accepted (all bytes
//! consumed inside the rule), definitely rejected, or uncertain (crosses a
//! rule boundary and needs the pushdown at runtime). The bitmask fill
//! then ORs precomputed accept masks and only walks the trie for the
//! uncertain remainder.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use rustc_hash::{FxHashMap, FxHasher};

use crate::bitmask;
use crate::error::Result;
use crate::fsm::build::build_rule_fsms;
use crate::fsm::{Automaton, DfaTable, FsmEdge, StateId, DEFAULT_STATE_BUDGET};
use crate::grammar::normalize::normalize;
use crate::grammar::Grammar;
use crate::tokenizer::TokenizerInfo;

/// Knobs for grammar compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Cap on DFA states per rule; determinization past this returns
    /// [`crate::Error::BudgetExceeded`].
    pub state_budget: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            state_budget: DEFAULT_STATE_BUDGET,
        }
    }
}

/// Packed per-state flags, precomputed so the matcher's advance loop
/// branches on one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateFlags(u8);

impl StateFlags {
    const CHAR_EDGES: u8 = 1;
    const RULE_REF: u8 = 2;
    const ACCEPTING: u8 = 4;
    /// Accepting with no outgoing work: completes the instant a child
    /// rule returns.
    const PASS_THROUGH: u8 = 8;

    #[inline(always)]
    pub(crate) fn has_char_edges(self) -> bool {
        self.0 & Self::CHAR_EDGES != 0
    }
    #[inline(always)]
    pub(crate) fn has_rule_ref(self) -> bool {
        self.0 & Self::RULE_REF != 0
    }
    #[inline(always)]
    pub(crate) fn is_accepting(self) -> bool {
        self.0 & Self::ACCEPTING != 0
    }
    #[inline(always)]
    pub(crate) fn is_pass_through(self) -> bool {
        self.0 & Self::PASS_THROUGH != 0
    }
}

/// Precomputed behavior of one `(rule, dfa_state)` pair.
#[derive(Debug, Clone)]
pub(crate) struct StateAction {
    pub(crate) flags: StateFlags,
    /// Rule-reference edges as `(predicted_rule, parent_target_state)`.
    pub(crate) rule_refs: Vec<(u16, u16)>,
}

/// Per-token acceptance trace for one `(rule, dfa_state)` pair.
#[derive(Debug)]
pub(crate) struct TokenMask {
    /// Tokens consumed entirely by char transitions of this rule's DFA.
    pub(crate) accepted: Vec<u32>,
    /// Tokens that might still be viable but cross a rule boundary;
    /// resolved by the runtime trie walk.
    pub(crate) uncertain: Vec<u32>,
}

enum TokenFate {
    Accepted,
    Rejected,
    Uncertain,
}

/// Immutable compiled form: normalized grammar, per-rule DFAs, state
/// actions, token masks, and a runtime bitmask cache.
#[derive(Debug)]
pub struct CompiledGrammar {
    pub(crate) grammar: Arc<Grammar>,
    pub(crate) rule_dfas: Vec<Automaton<DfaTable>>,
    state_actions: Vec<StateAction>,
    state_action_offsets: Vec<u32>,
    /// Some rule's DFA loops back into itself through a pass-through
    /// state; the matcher then needs completion-chain short-circuiting.
    pub(crate) has_self_ref_chains: bool,
    /// The root DFA never leaves itself; the matcher can skip the
    /// pushdown entirely.
    pub(crate) is_single_dfa: bool,
    pub(crate) token_masks: FxHashMap<(u32, u32), TokenMask>,
    /// Whether the root rule's lookahead assertion (if any) admits the
    /// empty continuation; gates stop-token acceptance.
    pub(crate) lookahead_allows_stop: bool,
    vocab_size: usize,
    bitmask_cache: RwLock<FxHashMap<u64, Vec<u32>>>,
}

impl CompiledGrammar {
    /// Compile a grammar against a vocabulary with default options.
    pub fn compile(grammar: &Grammar, tokenizer: &TokenizerInfo) -> Result<Self> {
        Self::compile_with_options(grammar, tokenizer, &CompileOptions::default())
    }

    pub fn compile_with_options(
        grammar: &Grammar,
        tokenizer: &TokenizerInfo,
        options: &CompileOptions,
    ) -> Result<Self> {
        let normalized = Arc::new(normalize(grammar));
        tracing::debug!(
            rules = normalized.num_rules(),
            exprs = normalized.num_exprs(),
            "compiling grammar"
        );

        let nfas = build_rule_fsms(&normalized);
        let mut rule_dfas = Vec::with_capacity(nfas.len());
        for nfa in &nfas {
            let dfa = nfa.to_dfa_budgeted(options.state_budget)?.minimize_dfa();
            rule_dfas.push(dfa.to_compact());
        }

        let (state_actions, state_action_offsets, has_self_ref_chains) =
            tabulate_state_actions(&rule_dfas);

        let token_masks = tabulate_token_masks(
            &rule_dfas,
            tokenizer,
            &state_actions,
            &state_action_offsets,
        );

        let is_single_dfa = {
            let root = normalized.root_rule().0 as usize;
            let lo = state_action_offsets[root] as usize;
            let hi = state_action_offsets
                .get(root + 1)
                .copied()
                .unwrap_or(state_actions.len() as u32) as usize;
            state_actions[lo..hi].iter().all(|a| !a.flags.has_rule_ref())
        };

        let lookahead_allows_stop = match normalized.root().lookahead {
            Some(la) => normalized.expr_nullable(la),
            None => true,
        };

        tracing::debug!(
            dfa_states = rule_dfas.iter().map(|d| d.fsm.num_states()).sum::<usize>(),
            single_dfa = is_single_dfa,
            "grammar compiled"
        );

        Ok(CompiledGrammar {
            grammar: normalized,
            rule_dfas,
            state_actions,
            state_action_offsets,
            has_self_ref_chains,
            is_single_dfa,
            token_masks,
            lookahead_allows_stop,
            vocab_size: tokenizer.vocab_size(),
            bitmask_cache: RwLock::new(FxHashMap::default()),
        })
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    #[inline(always)]
    pub(crate) fn action(&self, rule_id: u16, dfa_state: u16) -> &StateAction {
        &self.state_actions
            [self.state_action_offsets[rule_id as usize] as usize + dfa_state as usize]
    }

    /// Copy a cached bitmask into `out`; true on hit. Masks are cached at
    /// the caller's width, so a differently sized buffer (batched
    /// allocation) simply misses.
    pub(crate) fn cached_bitmask(&self, key: u64, out: &mut [u32]) -> bool {
        let cache = self.bitmask_cache.read().unwrap_or_else(|e| e.into_inner());
        match cache.get(&key) {
            Some(mask) if mask.len() == out.len() => {
                out.copy_from_slice(mask);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn store_bitmask(&self, key: u64, mask: &[u32]) {
        let mut cache = self.bitmask_cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(key, mask.to_vec());
    }
}

// ─── State actions ───────────────────────────────────────────────────

fn tabulate_state_actions(
    rule_dfas: &[Automaton<DfaTable>],
) -> (Vec<StateAction>, Vec<u32>, bool) {
    assert!(
        rule_dfas.len() <= u16::MAX as usize,
        "too many rules ({}) for u16 stack states",
        rule_dfas.len()
    );

    let mut actions = Vec::new();
    let mut offsets = Vec::with_capacity(rule_dfas.len());
    let mut has_self_ref_chains = false;

    for (rule_idx, dfa) in rule_dfas.iter().enumerate() {
        offsets.push(actions.len() as u32);
        for si in 0..dfa.fsm.num_states() {
            let edges = dfa.fsm.edges(StateId(si as u32));
            let has_char = edges.iter().any(|e| matches!(e, FsmEdge::CharRange { .. }));
            let has_rule = edges.iter().any(|e| matches!(e, FsmEdge::RuleRef { .. }));
            let accepting = dfa.is_end(StateId(si as u32));
            let pass_through = accepting && !has_char && !has_rule;

            let mut flags = 0u8;
            if has_char {
                flags |= StateFlags::CHAR_EDGES;
            }
            if has_rule {
                flags |= StateFlags::RULE_REF;
            }
            if accepting {
                flags |= StateFlags::ACCEPTING;
            }
            if pass_through {
                flags |= StateFlags::PASS_THROUGH;
            }

            let mut rule_refs = Vec::new();
            for e in edges {
                if let FsmEdge::RuleRef { rule, target } = e {
                    rule_refs.push((rule.0 as u16, target.0 as u16));
                    if rule.0 as usize == rule_idx && pass_through {
                        has_self_ref_chains = true;
                    }
                }
            }

            actions.push(StateAction {
                flags: StateFlags(flags),
                rule_refs,
            });
        }
    }

    (actions, offsets, has_self_ref_chains)
}

// ─── Token mask tabulation ───────────────────────────────────────────

/// Simulate one token's bytes through a rule DFA.
///
/// Once an accepting state has been crossed the rule could have ended
/// there with the remaining bytes going to the parent, so a later dead
/// end downgrades to `Uncertain` rather than `Rejected`; likewise a dead
/// end at a state with rule-reference edges.
fn classify_token(
    dfa: &Automaton<DfaTable>,
    start: StateId,
    token: &[u8],
    actions: &[StateAction],
    actions_offset: usize,
) -> TokenFate {
    let mut cur = start;
    let mut crossed_end = dfa.is_end(cur);
    for &byte in token {
        match dfa.fsm.next_state(cur, byte) {
            Some(next) => {
                cur = next;
                if dfa.is_end(cur) {
                    crossed_end = true;
                }
            }
            None => {
                if crossed_end {
                    return TokenFate::Uncertain;
                }
                if actions[actions_offset + cur.0 as usize].flags.has_rule_ref() {
                    return TokenFate::Uncertain;
                }
                return TokenFate::Rejected;
            }
        }
    }
    TokenFate::Accepted
}

/// Structural fingerprint of a DFA; identical fingerprints yield
/// identical token masks, so repeated sub-grammars (schema string/char
/// rules) share one tabulation.
fn dfa_fingerprint(dfa: &Automaton<DfaTable>) -> u64 {
    let mut hasher = FxHasher::default();
    dfa.start.0.hash(&mut hasher);
    dfa.ends.hash(&mut hasher);
    dfa.fsm.byte_table().hash(&mut hasher);
    for si in 0..dfa.fsm.num_states() {
        for e in dfa.fsm.edges(StateId(si as u32)) {
            if let FsmEdge::RuleRef { rule, target } = e {
                rule.0.hash(&mut hasher);
                target.0.hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

fn tabulate_token_masks(
    rule_dfas: &[Automaton<DfaTable>],
    tokenizer: &TokenizerInfo,
    state_actions: &[StateAction],
    state_action_offsets: &[u32],
) -> FxHashMap<(u32, u32), TokenMask> {
    let vocab_size = tokenizer.vocab_size();
    let words = bitmask::bitmask_size(vocab_size);
    let sorted = tokenizer.sorted_vocab();
    let trie_end = tokenizer.trie_subtree_end();

    let mut masks: FxHashMap<(u32, u32), TokenMask> = FxHashMap::default();
    let mut by_fingerprint: FxHashMap<u64, usize> = FxHashMap::default();

    for (rule_idx, dfa) in rule_dfas.iter().enumerate() {
        let fp = dfa_fingerprint(dfa);
        if let Some(&src_rule) = by_fingerprint.get(&fp) {
            for state_idx in 0..dfa.fsm.num_states() {
                let src = &masks[&(src_rule as u32, state_idx as u32)];
                let copy = TokenMask {
                    accepted: src.accepted.clone(),
                    uncertain: src.uncertain.clone(),
                };
                masks.insert((rule_idx as u32, state_idx as u32), copy);
            }
            continue;
        }

        let offset = state_action_offsets[rule_idx] as usize;
        for state_idx in 0..dfa.fsm.num_states() {
            let state = StateId(state_idx as u32);
            let flags = state_actions[offset + state_idx].flags;
            let only_rule_refs = flags.has_rule_ref() && !flags.has_char_edges();

            let mut accepted = vec![0u32; words];
            let mut uncertain = Vec::new();

            let mut i = 0;
            while i < sorted.len() {
                let (token_id, ref bytes) = sorted[i];
                if only_rule_refs {
                    uncertain.push(token_id);
                    i += 1;
                    continue;
                }
                match classify_token(dfa, state, bytes, state_actions, offset) {
                    TokenFate::Accepted => {
                        bitmask::set_bit(&mut accepted, token_id as usize);
                        i += 1;
                    }
                    TokenFate::Rejected => {
                        // When the very first byte dies, every token in
                        // this prefix subtree dies with it.
                        if dfa.fsm.next_state(state, bytes[0]).is_none()
                            && !flags.has_rule_ref()
                        {
                            i = trie_end[i];
                        } else {
                            i += 1;
                        }
                    }
                    TokenFate::Uncertain => {
                        uncertain.push(token_id);
                        i += 1;
                    }
                }
            }

            masks.insert(
                (rule_idx as u32, state_idx as u32),
                TokenMask {
                    accepted,
                    uncertain,
                },
            );
        }
        by_fingerprint.insert(fp, rule_idx);
    }

    masks
}
