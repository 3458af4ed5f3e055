//! Regex-built grammars under the matcher.

use std::sync::Arc;

use tokengate::bitmask::{bitmask_size, get_bit};
use tokengate::{regex_to_grammar, GrammarMatcher, TokenizerInfo};

fn regex_matcher(pattern: &str, vocab: &[&str], stop: Vec<u32>) -> GrammarMatcher {
    let g = regex_to_grammar(pattern).unwrap();
    let tok = Arc::new(TokenizerInfo::from_raw(vocab, stop));
    GrammarMatcher::from_grammar(&g, tok, None, 16).unwrap()
}

fn regex_accepts(pattern: &str, input: &str) -> bool {
    let mut m = regex_matcher(pattern, &["dummy"], vec![]);
    if input.is_empty() {
        return m.can_terminate();
    }
    m.accept_string(input) && m.can_terminate()
}

// ---------------------------------------------------------------------------
// The optional-atom scenario: ab?c
// ---------------------------------------------------------------------------

#[test]
fn test_optional_atom_masks() {
    let vocab = ["a", "b", "c", "<eos>"];
    let mut m = regex_matcher("ab?c", &vocab, vec![3]);

    assert!(m.accept_token(0).unwrap()); // "a"
    let mut mask = vec![0u32; bitmask_size(4)];
    m.fill_next_token_bitmask(&mut mask);
    assert!(!get_bit(&mask, 0));
    assert!(get_bit(&mask, 1)); // "b" possible
    assert!(get_bit(&mask, 2)); // "c" possible
    assert!(!get_bit(&mask, 3)); // cannot stop yet

    assert!(m.accept_token(1).unwrap()); // "ab"
    m.fill_next_token_bitmask(&mut mask);
    assert!(!get_bit(&mask, 1));
    assert!(get_bit(&mask, 2)); // only "c" remains
    assert!(!get_bit(&mask, 3));

    assert!(m.accept_token(2).unwrap()); // "abc"
    m.fill_next_token_bitmask(&mut mask);
    assert!(!get_bit(&mask, 0));
    assert!(!get_bit(&mask, 1));
    assert!(!get_bit(&mask, 2));
    assert!(get_bit(&mask, 3)); // stop is the only continuation

    assert!(m.accept_token(3).unwrap());
    assert!(m.is_terminated());
}

#[test]
fn test_optional_atom_short_path() {
    let mut m = regex_matcher("ab?c", &["a", "b", "c", "<eos>"], vec![3]);
    assert!(m.accept_token(0).unwrap());
    assert!(m.accept_token(2).unwrap()); // "ac"
    assert!(m.accept_token(3).unwrap()); // stop
    assert!(m.is_terminated());
}

// ---------------------------------------------------------------------------
// Language checks
// ---------------------------------------------------------------------------

#[test]
fn test_classes_and_families() {
    assert!(regex_accepts(r"\d{3}-\d{4}", "555-0199"));
    assert!(!regex_accepts(r"\d{3}-\d{4}", "55-0199"));
    assert!(regex_accepts(r"\w+", "snake_case_42"));
    assert!(!regex_accepts(r"\w+", "with space"));
    assert!(regex_accepts(r"\s*", "  \t\n"));
    assert!(regex_accepts(r"[^aeiou]+", "xyz"));
    assert!(!regex_accepts(r"[^aeiou]+", "xyza"));
}

#[test]
fn test_alternation_and_groups() {
    assert!(regex_accepts("(cat|dog)+", "catdogcat"));
    assert!(!regex_accepts("(cat|dog)+", "catdo"));
    assert!(regex_accepts("(?:left|right)-(?:up|down)", "left-down"));
}

#[test]
fn test_bounded_repetition() {
    assert!(regex_accepts("x{2,3}", "xx"));
    assert!(regex_accepts("x{2,3}", "xxx"));
    assert!(!regex_accepts("x{2,3}", "x"));
    assert!(!regex_accepts("x{2,3}", "xxxx"));
    assert!(regex_accepts("x{2,}", "xxxxxx"));
}

#[test]
fn test_dot_matches_any_char() {
    assert!(regex_accepts("a.c", "abc"));
    assert!(regex_accepts("a.c", "a\u{4e2d}c"));
    assert!(!regex_accepts("a.c", "ac"));
}

#[test]
fn test_anchors_are_ignored() {
    assert!(regex_accepts("^hello$", "hello"));
}

#[test]
fn test_email_like_pattern() {
    let pattern = r"[a-z]+@[a-z]+\.(com|org)";
    assert!(regex_accepts(pattern, "user@site.com"));
    assert!(regex_accepts(pattern, "a@b.org"));
    assert!(!regex_accepts(pattern, "user@site.net"));
    assert!(!regex_accepts(pattern, "user@site"));
}

#[test]
fn test_uuid_pattern_generation() {
    let pattern = "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";
    assert!(regex_accepts(pattern, "123e4567-e89b-12d3-a456-426614174000"));
    assert!(!regex_accepts(pattern, "123e4567e89b12d3a456426614174000"));

    // The hyphens are forced: jump-forward from a boundary emits one.
    let mut m = regex_matcher(pattern, &["0", "-", "dummy"], vec![]);
    assert!(m.accept_string("123e4567"));
    assert_eq!(m.find_jump_forward_string(), "-");
}

#[test]
fn test_jump_forward_through_literal_tail() {
    let mut m = regex_matcher("(yes|no), final answer", &["dummy"], vec![]);
    assert!(m.accept_string("yes"));
    assert_eq!(m.find_jump_forward_string(), ", final answer");
}

#[test]
fn test_unsupported_regexes_error() {
    assert!(regex_to_grammar("(?=look)").is_err());
    assert!(regex_to_grammar(r"back\1").is_err());
    assert!(regex_to_grammar(r"\p{Greek}").is_err());
    assert!(regex_to_grammar(r"word\b").is_err());
}
