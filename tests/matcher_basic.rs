//! Matcher operations: bitmask soundness/completeness, rollback,
//! jump-forward, termination.

use std::sync::Arc;

use tokengate::bitmask::{self, bitmask_size, get_bit};
use tokengate::{Grammar, GrammarMatcher, TokenizerInfo};

fn make_matcher(ebnf: &str, vocab: &[&str], stop: Vec<u32>) -> GrammarMatcher {
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    let tok = Arc::new(TokenizerInfo::from_raw(vocab, stop));
    GrammarMatcher::from_grammar(&grammar, tok, None, 32).unwrap()
}

/// The two bitmask invariants: a set bit means `accept_token` succeeds, a
/// clear bit means it fails (and leaves the state untouched).
fn check_mask_matches_acceptance(m: &mut GrammarMatcher, vocab_size: usize) {
    let mut mask = vec![0u32; bitmask_size(vocab_size)];
    m.fill_next_token_bitmask(&mut mask);
    for token_id in 0..vocab_size as u32 {
        let allowed = get_bit(&mask, token_id as usize);
        let accepted = m.accept_token(token_id).unwrap();
        assert_eq!(
            allowed, accepted,
            "mask bit and acceptance disagree for token {token_id}"
        );
        if accepted {
            m.rollback(1).unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Bitmask invariants across states
// ---------------------------------------------------------------------------

#[test]
fn test_mask_invariants_literal_grammar() {
    let mut m = make_matcher(
        r#"root ::= "abc" | "abd" | "xyz""#,
        &["a", "b", "c", "d", "ab", "abc", "xy", "z", "q", "<eos>"],
        vec![9],
    );
    check_mask_matches_acceptance(&mut m, 10);
    assert!(m.accept_token(4).unwrap()); // "ab"
    check_mask_matches_acceptance(&mut m, 10);
    assert!(m.accept_token(2).unwrap()); // "c"
    check_mask_matches_acceptance(&mut m, 10);
}

#[test]
fn test_mask_invariants_multi_rule_grammar() {
    let ebnf = r#"
root ::= pair ("," pair)*
pair ::= key "=" value
key ::= [a-z]+
value ::= [0-9]+
"#;
    let mut m = make_matcher(
        ebnf,
        &["a", "k", "ey", "=", "1", "23", ",", "x=", "9,", "<eos>"],
        vec![9],
    );
    check_mask_matches_acceptance(&mut m, 10);
    assert!(m.accept_token(1).unwrap()); // "k"
    check_mask_matches_acceptance(&mut m, 10);
    assert!(m.accept_token(2).unwrap()); // "ey"
    assert!(m.accept_token(3).unwrap()); // "="
    check_mask_matches_acceptance(&mut m, 10);
    assert!(m.accept_token(4).unwrap()); // "1"
    check_mask_matches_acceptance(&mut m, 10);
}

#[test]
fn test_mask_invariants_json_like() {
    let ebnf = r#"
root ::= "{" (entry ("," entry)*)? "}"
entry ::= str ":" num
str ::= "\"" [a-z]* "\""
num ::= [0-9]+
"#;
    let vocab = [
        "{", "}", "\"", "a", "ab", "\":", ":", "1", "12", ",", "\"b\"", "x", "<eos>",
    ];
    let mut m = make_matcher(ebnf, &vocab, vec![12]);
    check_mask_matches_acceptance(&mut m, vocab.len());
    assert!(m.accept_token(0).unwrap()); // {
    check_mask_matches_acceptance(&mut m, vocab.len());
    assert!(m.accept_token(10).unwrap()); // "b"
    check_mask_matches_acceptance(&mut m, vocab.len());
    assert!(m.accept_token(6).unwrap()); // :
    assert!(m.accept_token(7).unwrap()); // 1
    check_mask_matches_acceptance(&mut m, vocab.len());
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[test]
fn test_rollback_restores_mask_exactly() {
    // Three digits; accept two, roll one back, and the mask must equal
    // the one-digit mask.
    let mut m = make_matcher("root ::= [0-9]{3}", &["0", "5", "9", "x", "<eos>"], vec![4]);

    assert!(m.accept_token(0).unwrap());
    let mut after_one = vec![0u32; 1];
    m.fill_next_token_bitmask(&mut after_one);

    assert!(m.accept_token(1).unwrap());
    m.rollback(1).unwrap();
    let mut rolled = vec![0u32; 1];
    m.fill_next_token_bitmask(&mut rolled);
    assert_eq!(after_one, rolled);

    // Continue to completion.
    assert!(m.accept_token(1).unwrap());
    assert!(m.accept_token(2).unwrap());
    assert!(m.can_terminate());
    assert!(m.accept_token(4).unwrap());
    assert!(m.is_terminated());
}

#[test]
fn test_rollback_window_enforced() {
    let grammar = Grammar::from_ebnf("root ::= [a-z]*", "root").unwrap();
    let tok = Arc::new(TokenizerInfo::from_raw(&["a"], vec![]));
    let mut m = GrammarMatcher::from_grammar(&grammar, tok, None, 2).unwrap();
    for _ in 0..5 {
        assert!(m.accept_token(0).unwrap());
    }
    assert!(m.rollback(3).is_err());
    m.rollback(2).unwrap();
    assert!(m.accept_token(0).unwrap());
}

#[test]
fn test_rollback_across_rule_boundaries() {
    let ebnf = r#"
root ::= part part
part ::= "ab" | "cd"
"#;
    let mut m = make_matcher(ebnf, &["ab", "cd", "a", "b"], vec![]);
    assert!(m.accept_token(0).unwrap());
    assert!(m.accept_token(1).unwrap());
    assert!(m.can_terminate());
    m.rollback(2).unwrap();
    assert!(m.accept_token(1).unwrap());
    assert!(m.accept_token(0).unwrap());
    assert!(m.can_terminate());
}

// ---------------------------------------------------------------------------
// Jump-forward
// ---------------------------------------------------------------------------

#[test]
fn test_jump_forward_forced_prefix() {
    let mut m = make_matcher(r#"root ::= "SELECT " ("a" | "b") " FROM t""#, &["x"], vec![]);
    assert_eq!(m.find_jump_forward_string(), "SELECT ");
    assert!(m.accept_string("SELECT a"));
    assert_eq!(m.find_jump_forward_string(), " FROM t");
}

#[test]
fn test_jump_forward_empty_on_branch() {
    let mut m = make_matcher(r#"root ::= "x" | "y""#, &["x"], vec![]);
    assert_eq!(m.find_jump_forward_string(), "");
}

#[test]
fn test_jump_forward_is_read_only() {
    let mut m = make_matcher(r#"root ::= "abc""#, &["a", "abc"], vec![]);
    let first = m.find_jump_forward_string();
    let second = m.find_jump_forward_string();
    assert_eq!(first, "abc");
    assert_eq!(first, second);
    assert!(m.accept_token(1).unwrap());
    assert!(m.can_terminate());
}

#[test]
fn test_jump_forward_agrees_with_mask() {
    // Every byte of the jump-forward string must be the unique next byte.
    let mut m = make_matcher(
        r#"root ::= "prefix" [0-9]"#,
        &["p", "r", "e", "f", "i", "x", "0"],
        vec![],
    );
    let jump = m.find_jump_forward_string();
    assert_eq!(jump, "prefix");
    for byte_token in ["p", "r", "e", "f", "i", "x"] {
        let mut mask = vec![0u32; 1];
        m.fill_next_token_bitmask(&mut mask);
        // Exactly one single-byte token is permitted at each step.
        assert_eq!(bitmask::count_set(&mask), 1);
        let id = ["p", "r", "e", "f", "i", "x", "0"]
            .iter()
            .position(|t| *t == byte_token)
            .unwrap() as u32;
        assert!(m.accept_token(id).unwrap());
    }
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

#[test]
fn test_stop_token_only_at_completion() {
    let mut m = make_matcher(r#"root ::= "ab""#, &["a", "b", "<eos>"], vec![2]);
    assert!(!m.accept_token(2).unwrap());
    assert!(m.accept_token(0).unwrap());
    assert!(!m.accept_token(2).unwrap());
    assert!(m.accept_token(1).unwrap());
    assert!(m.accept_token(2).unwrap());
    assert!(m.is_terminated());
}

#[test]
fn test_terminated_mask_is_stop_only() {
    let mut m = make_matcher(r#"root ::= "a""#, &["a", "b", "<eos>"], vec![2]);
    assert!(m.accept_token(0).unwrap());
    assert!(m.accept_token(2).unwrap());
    let mut mask = vec![0u32; 1];
    assert!(m.fill_next_token_bitmask(&mut mask));
    assert!(!get_bit(&mask, 0));
    assert!(!get_bit(&mask, 1));
    assert!(get_bit(&mask, 2));
}

#[test]
fn test_reset_restores_initial_state() {
    let mut m = make_matcher(r#"root ::= "ab""#, &["a", "b", "<eos>"], vec![2]);
    let mut initial = vec![0u32; 1];
    m.fill_next_token_bitmask(&mut initial);

    assert!(m.accept_token(0).unwrap());
    assert!(m.accept_token(1).unwrap());
    assert!(m.accept_token(2).unwrap());
    m.reset();
    assert!(!m.is_terminated());

    let mut again = vec![0u32; 1];
    m.fill_next_token_bitmask(&mut again);
    assert_eq!(initial, again);
    assert!(m.accept_token(0).unwrap());
}

#[test]
fn test_end_to_end_generation_loop() {
    // Simulated decode loop: always pick the lowest permitted token.
    let mut m = make_matcher(
        r#"root ::= "ok" [0-9]{2}"#,
        &["ok", "3", "7", "<eos>"],
        vec![3],
    );
    let mut picked = Vec::new();
    for _ in 0..16 {
        let mut mask = vec![0u32; 1];
        m.fill_next_token_bitmask(&mut mask);
        let next = (0..4u32).find(|&t| get_bit(&mask, t as usize)).unwrap();
        assert!(m.accept_token(next).unwrap());
        picked.push(next);
        if m.is_terminated() {
            break;
        }
    }
    assert_eq!(picked, vec![0, 1, 1, 3]);
    assert!(m.is_terminated());
}
