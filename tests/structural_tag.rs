//! Structural tags end to end: triggered tool calls, separator lists,
//! wildcard regions.

use std::sync::Arc;

use tokengate::bitmask::{bitmask_size, get_bit};
use tokengate::{structural_tag_to_grammar, GrammarMatcher, TokenizerInfo};

fn tag_matcher(tag_json: &str, vocab: &[&str], stop: Vec<u32>) -> GrammarMatcher {
    let g = structural_tag_to_grammar(tag_json).unwrap();
    let tok = Arc::new(TokenizerInfo::from_raw(vocab, stop));
    GrammarMatcher::from_grammar(&g, tok, None, 16).unwrap()
}

fn tag_accepts(tag_json: &str, input: &str) -> bool {
    let mut m = tag_matcher(tag_json, &["dummy"], vec![]);
    if input.is_empty() {
        return m.can_terminate();
    }
    m.accept_string(input) && m.can_terminate()
}

const GET_WEATHER: &str = r#"{
    "type": "structural_tag",
    "format": {
        "type": "triggered_tags",
        "triggers": ["<function="],
        "tags": [{
            "type": "tag",
            "begin": "<function=get_weather>",
            "content": {
                "type": "json_schema",
                "json_schema": {
                    "type": "object",
                    "properties": {"location": {"type": "string"}},
                    "required": ["location"],
                    "additionalProperties": false
                }
            },
            "end": "</function>"
        }],
        "at_least_one": true
    }
}"#;

// ---------------------------------------------------------------------------
// The tool-calling scenario
// ---------------------------------------------------------------------------

#[test]
fn test_weather_call_accepts_step_by_step() {
    let vocab = [
        "I will call ",
        "<function=",
        "get_weather>",
        "{\"location\"",
        ":",
        " \"SF\"}",
        "</function>",
        "<eos>",
    ];
    let mut m = tag_matcher(GET_WEATHER, &vocab, vec![7]);
    for id in 0..7u32 {
        assert!(
            m.accept_token(id).unwrap(),
            "token {id} ({:?}) must be accepted",
            vocab[id as usize]
        );
    }
    assert!(m.can_terminate());
    assert!(m.accept_token(7).unwrap());
    assert!(m.is_terminated());
}

#[test]
fn test_weather_call_wrong_end_literal_rejected_at_final_gt() {
    let mut m = tag_matcher(GET_WEATHER, &["dummy"], vec![]);
    assert!(m.accept_string(r#"I will call <function=get_weather>{"location": "SF"}</func"#));
    // "</func" is still a viable prefix of "</function>", but closing it
    // now with ">" cannot recover.
    assert!(!m.accept_string(">"));
    // The honest continuation still works.
    assert!(m.accept_string("tion>"));
    assert!(m.can_terminate());
}

#[test]
fn test_weather_call_requires_one_invocation() {
    let mut m = tag_matcher(GET_WEATHER, &["dummy"], vec![]);
    assert!(m.accept_string("thinking about it"));
    assert!(!m.can_terminate());
    assert!(m.accept_string(r#" <function=get_weather>{"location": "NY"}</function>"#));
    assert!(m.can_terminate());
}

#[test]
fn test_no_trigger_region_reports_skippable_mask() {
    let tag = r#"{
        "type": "structural_tag",
        "format": {"type": "wildcard_text"}
    }"#;
    let vocab = ["hello", " wor", "ld", "<eos>"];
    let mut m = tag_matcher(tag, &vocab, vec![3]);
    let mut mask = vec![0u32; bitmask_size(4)];
    // Pure free text: every token (including stop) is permitted, so the
    // caller may skip applying the mask.
    assert!(!m.fill_next_token_bitmask(&mut mask));
    for id in 0..4 {
        assert!(get_bit(&mask, id));
    }
    assert!(m.accept_token(0).unwrap());
    assert!(m.accept_token(3).unwrap());
    assert!(m.is_terminated());
}

#[test]
fn test_trigger_region_masks_constrain_inside_tag() {
    let vocab = ["<function=", "get_weather>", "get_time>", "x", "<eos>"];
    let mut m = tag_matcher(GET_WEATHER, &vocab, vec![4]);
    assert!(m.accept_token(0).unwrap()); // trigger fired
    let mut mask = vec![0u32; bitmask_size(5)];
    assert!(m.fill_next_token_bitmask(&mut mask));
    assert!(get_bit(&mask, 1)); // the declared function
    assert!(!get_bit(&mask, 2)); // an undeclared function
    assert!(!get_bit(&mask, 4)); // cannot stop mid-tag
}

// ---------------------------------------------------------------------------
// Other format shapes
// ---------------------------------------------------------------------------

#[test]
fn test_literal_schema_sequence() {
    let tag = r#"{
        "type": "structural_tag",
        "format": {"type": "sequence", "elements": [
            {"type": "literal", "text": "Answer: "},
            {"type": "json_schema", "json_schema": {"type": "boolean"}}
        ]}
    }"#;
    assert!(tag_accepts(tag, "Answer: true"));
    assert!(tag_accepts(tag, "Answer: false"));
    assert!(!tag_accepts(tag, "Answer: maybe"));
    assert!(!tag_accepts(tag, "true"));
}

#[test]
fn test_reasoning_block_with_wildcard() {
    let tag = r#"{
        "type": "structural_tag",
        "format": {"type": "sequence", "elements": [
            {"type": "tag", "begin": "<think>", "content": {"type": "wildcard_text"}, "end": "</think>"},
            {"type": "json_schema", "json_schema": {"type": "integer"}}
        ]}
    }"#;
    assert!(tag_accepts(tag, "<think>2+2 is four</think>4"));
    assert!(tag_accepts(tag, "<think></think>0"));
    assert!(!tag_accepts(tag, "<think>forgot to close 4"));
}

#[test]
fn test_separator_list_of_calls() {
    let tag = r#"{
        "type": "structural_tag",
        "format": {
            "type": "tags_with_separator",
            "tags": [{
                "type": "tag",
                "begin": "f(",
                "content": {"type": "json_schema", "json_schema": {"type": "integer"}},
                "end": ")"
            }],
            "separator": ";",
            "at_least_one": true,
            "stop_after_first": false
        }
    }"#;
    assert!(tag_accepts(tag, "f(1)"));
    assert!(tag_accepts(tag, "f(1);f(2);f(3)"));
    assert!(!tag_accepts(tag, "f(1);"));
    assert!(!tag_accepts(tag, "f(1),f(2)"));
    assert!(!tag_accepts(tag, ""));
}

#[test]
fn test_stop_after_first_forbids_trailing_text() {
    let tag = GET_WEATHER.replace(
        "\"at_least_one\": true",
        "\"at_least_one\": true, \"stop_after_first\": true",
    );
    let mut m = tag_matcher(&tag, &["dummy"], vec![]);
    assert!(m.accept_string(r#"ok <function=get_weather>{"location": "SF"}</function>"#));
    assert!(m.can_terminate());
    assert!(!m.accept_string(" and"));
}

#[test]
fn test_multiple_rounds_of_calls() {
    let mut m = tag_matcher(GET_WEATHER, &["dummy"], vec![]);
    let round = r#"<function=get_weather>{"location": "A"}</function>"#;
    assert!(m.accept_string(&format!("first {round} second {round} done")));
    assert!(m.can_terminate());
}

#[test]
fn test_validation_errors() {
    // Prefix-colliding triggers.
    let bad = r#"{
        "type": "structural_tag",
        "format": {
            "type": "triggered_tags",
            "triggers": ["<a", "<ab"],
            "tags": [{"type": "tag", "begin": "<ab>", "content": {"type": "wildcard_text"}, "end": "</ab>"}]
        }
    }"#;
    assert!(structural_tag_to_grammar(bad).is_err());

    // A tag whose begin extends no trigger.
    let bad = r#"{
        "type": "structural_tag",
        "format": {
            "type": "triggered_tags",
            "triggers": ["<call>"],
            "tags": [{"type": "tag", "begin": "<other>", "content": {"type": "wildcard_text"}, "end": "</other>"}]
        }
    }"#;
    assert!(structural_tag_to_grammar(bad).is_err());
}
