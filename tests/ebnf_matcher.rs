//! Matching EBNF-defined languages byte-by-byte and token-by-token.

use std::sync::Arc;

use tokengate::{Grammar, GrammarMatcher, TokenizerInfo};

fn accepts(ebnf: &str, input: &str) -> bool {
    let grammar = match Grammar::from_ebnf(ebnf, "root") {
        Ok(g) => g,
        Err(_) => return false,
    };
    let tok = Arc::new(TokenizerInfo::from_raw(&["dummy"], vec![]));
    let mut m = GrammarMatcher::from_grammar(&grammar, tok, None, 16).unwrap();
    if input.is_empty() {
        return m.can_terminate();
    }
    m.accept_string(input) && m.can_terminate()
}

fn make_matcher(ebnf: &str, vocab: &[&str]) -> GrammarMatcher {
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    let tok = Arc::new(TokenizerInfo::from_raw(vocab, vec![]));
    GrammarMatcher::from_grammar(&grammar, tok, None, 16).unwrap()
}

// ---------------------------------------------------------------------------
// Plus/char-class scenario: root ::= "a"+ "b"
// ---------------------------------------------------------------------------

#[test]
fn test_plus_then_literal() {
    assert!(accepts(r#"root ::= "a"+ "b""#, "aaab"));
    assert!(accepts(r#"root ::= "a"+ "b""#, "ab"));
    assert!(!accepts(r#"root ::= "a"+ "b""#, "b"));
    assert!(!accepts(r#"root ::= "a"+ "b""#, "aab c"));
}

#[test]
fn test_failed_byte_leaves_mask_unchanged() {
    // Accepting "aab" then failing on "c" must leave the matcher exactly
    // where it was before the failed call.
    let mut m = make_matcher(r#"root ::= "a"+ "b""#, &["a", "b", "c", "aab"]);
    assert!(m.accept_string("aab"));

    let mut before = vec![0u32; 1];
    m.fill_next_token_bitmask(&mut before);

    assert!(!m.accept_string("c"));

    let mut after = vec![0u32; 1];
    m.fill_next_token_bitmask(&mut after);
    assert_eq!(before, after);
    assert!(m.can_terminate());
}

// ---------------------------------------------------------------------------
// Language coverage
// ---------------------------------------------------------------------------

#[test]
fn test_char_classes() {
    assert!(accepts("root ::= [a-z]+", "hello"));
    assert!(!accepts("root ::= [a-z]+", "Hello"));
    assert!(accepts("root ::= [^0-9]+", "no digits!"));
    assert!(!accepts("root ::= [^0-9]+", "has 1 digit"));
}

#[test]
fn test_repetition_ranges() {
    let g = r#"root ::= [0-9]{2,4}"#;
    assert!(!accepts(g, "1"));
    assert!(accepts(g, "12"));
    assert!(accepts(g, "1234"));
    assert!(!accepts(g, "12345"));
}

#[test]
fn test_nullable_rules() {
    assert!(accepts(r#"root ::= "a"?"#, ""));
    assert!(accepts(r#"root ::= "a"? "b"?"#, ""));
    assert!(accepts(r#"root ::= "a"? "b"?"#, "ab"));
    assert!(accepts(r#"root ::= "a"? "b"?"#, "b"));
    assert!(!accepts(r#"root ::= "a"? "b"?"#, "ba"));
}

#[test]
fn test_recursive_rules() {
    let balanced = r#"
root ::= expr
expr ::= "(" expr ")" | ""
"#;
    assert!(accepts(balanced, ""));
    assert!(accepts(balanced, "()"));
    assert!(accepts(balanced, "((()))"));
    assert!(!accepts(balanced, "(()"));
    assert!(!accepts(balanced, ")("));
}

#[test]
fn test_mutual_recursion() {
    let g = r#"
root ::= a
a ::= "x" b | "x"
b ::= "y" a
"#;
    assert!(accepts(g, "x"));
    assert!(accepts(g, "xyx"));
    assert!(accepts(g, "xyxyx"));
    assert!(!accepts(g, "xy"));
}

#[test]
fn test_unicode_classes_by_encoded_length() {
    assert!(accepts(r"root ::= [à-ÿ]+", "àéÿ"));
    assert!(!accepts(r"root ::= [à-ÿ]+", "a"));
    assert!(accepts(r"root ::= [一-鿿]+", "中文"));
    assert!(accepts(r"root ::= [\U0001f600-\U0001f64f]", "😀"));
    assert!(!accepts(r"root ::= [\U0001f600-\U0001f64f]", "😀😀"));
}

#[test]
fn test_negated_class_rejects_invalid_utf8_tokens() {
    // A vocabulary entry holding a lone continuation byte can never match
    // a codepoint class.
    let grammar = Grammar::from_ebnf("root ::= [^x]+", "root").unwrap();
    let encoded: Vec<String> = vec!["ok".into(), "<0x80>".into()];
    let tok = Arc::new(
        TokenizerInfo::new(&encoded, tokengate::VocabType::ByteFallback, None, vec![]).unwrap(),
    );
    let mut m = GrammarMatcher::from_grammar(&grammar, tok, None, 8).unwrap();
    assert!(m.accept_token(0).unwrap());
    assert!(!m.accept_token(1).unwrap());
}

#[test]
fn test_full_json_grammar_inputs() {
    let g = Grammar::builtin_json();
    let tok = Arc::new(TokenizerInfo::from_raw(&["dummy"], vec![]));
    for input in [
        r#"{"name": "test", "version": [1, 2, 3]}"#,
        r#"[{"nested": {"deep": {"deeper": null}}}]"#,
        r#""just a string""#,
        "-12.5e+3",
        "true",
        r#"{"escaped": "line\nbreak é"}"#,
    ] {
        let mut m = GrammarMatcher::from_grammar(g, tok.clone(), None, 8).unwrap();
        assert!(m.accept_string(input), "should accept {input}");
        assert!(m.can_terminate(), "should terminate after {input}");
    }
    for input in [
        r#"{"trailing": 1,}"#,
        r#"{'single': 1}"#,
        "01",
        r#"{"unclosed": "#,
    ] {
        let mut m = GrammarMatcher::from_grammar(g, tok.clone(), None, 8).unwrap();
        let ok = m.accept_string(input) && m.can_terminate();
        assert!(!ok, "should reject {input}");
    }
}

#[test]
fn test_long_string_content_with_escapes() {
    let g = r#"
root ::= "\"" char* "\""
char ::= [^"\\] | "\\" ["\\nrt]
"#;
    let long = format!("\"{}\\n{}\"", "x".repeat(500), "y".repeat(500));
    assert!(accepts(g, &long));
    assert!(!accepts(g, "\"bad\\escape\""));
}

#[test]
fn test_token_level_spellout() {
    let mut m = make_matcher(
        r#"root ::= "cat" | "car" | "dog""#,
        &["c", "a", "t", "r", "d", "o", "g", "ca"],
    );
    assert!(m.accept_token(7).unwrap()); // "ca"
    assert!(m.accept_token(3).unwrap()); // "r"
    assert!(m.can_terminate());

    m.reset();
    assert!(m.accept_token(4).unwrap()); // "d"
    assert!(!m.accept_token(1).unwrap()); // "a" does not follow "d"
    assert!(m.accept_token(5).unwrap()); // "o"
    assert!(m.accept_token(6).unwrap()); // "g"
    assert!(m.can_terminate());
}
