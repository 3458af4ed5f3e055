//! Grammar wire format.
//!
//! Grammars serialize to a JSON object with a rule table and the
//! expression arena flattened into a CSR blob (one `[tag, payload…]` slice
//! per expression):
//!
//! ```json
//! { "rules": [ { "name": "root", "body_expr_id": 0, "lookahead_assertion_id": -1 } ],
//!   "grammar_expr_data": { "data": [ ... ], "offsets": [ ... ] } }
//! ```
//!
//! Deserialization is the strict inverse: unknown fields, bad tags, and
//! out-of-range ids are rejected. The root rule is resolved by name, the
//! same way [`Grammar::from_ebnf`] resolves it.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{Expr, ExprId, Grammar, Rule, RuleId};

const TAG_BYTE_STRING: i32 = 0;
const TAG_CHARACTER_CLASS: i32 = 1;
const TAG_CHARACTER_CLASS_STAR: i32 = 2;
const TAG_EMPTY_STRING: i32 = 3;
const TAG_RULE_REF: i32 = 4;
const TAG_SEQUENCE: i32 = 5;
const TAG_CHOICES: i32 = 6;
const TAG_REPEAT: i32 = 7;

const UNBOUNDED: i32 = -1;

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct GrammarWire {
    rules: Vec<RuleWire>,
    grammar_expr_data: CsrWire,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleWire {
    name: String,
    body_expr_id: i64,
    /// `-1` when the rule carries no lookahead assertion.
    lookahead_assertion_id: i64,
}

/// CSR layout: `data[offsets[i]..offsets[i+1]]` is expression `i`.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CsrWire {
    data: Vec<i32>,
    offsets: Vec<u32>,
}

impl Grammar {
    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> String {
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(self.exprs.len() + 1);
        for expr in &self.exprs {
            offsets.push(data.len() as u32);
            encode_expr(expr, &mut data);
        }
        offsets.push(data.len() as u32);

        let wire = GrammarWire {
            rules: self
                .rules
                .iter()
                .map(|r| RuleWire {
                    name: r.name.clone(),
                    body_expr_id: r.body.0 as i64,
                    lookahead_assertion_id: r
                        .lookahead
                        .map_or(-1, |la| la.0 as i64),
                })
                .collect(),
            grammar_expr_data: CsrWire { data, offsets },
        };
        serde_json::to_string(&wire).expect("grammar wire form is always serializable")
    }

    /// Deserialize from the JSON wire format, resolving the root rule by
    /// name.
    pub fn from_json(json: &str, root_rule_name: &str) -> Result<Grammar> {
        let wire: GrammarWire = serde_json::from_str(json)
            .map_err(|e| Error::serialization(format!("malformed grammar blob: {e}")))?;

        let num_rules = wire.rules.len();
        if num_rules == 0 {
            return Err(Error::serialization("grammar has no rules"));
        }
        let csr = &wire.grammar_expr_data;
        if csr.offsets.is_empty() {
            return Err(Error::serialization("grammar_expr_data.offsets is empty"));
        }
        if *csr.offsets.last().unwrap() as usize != csr.data.len() {
            return Err(Error::serialization(
                "grammar_expr_data offsets do not cover the data buffer",
            ));
        }
        let num_exprs = csr.offsets.len() - 1;

        let mut exprs = Vec::with_capacity(num_exprs);
        for i in 0..num_exprs {
            let lo = csr.offsets[i] as usize;
            let hi = csr.offsets[i + 1] as usize;
            if lo > hi || hi > csr.data.len() {
                return Err(Error::serialization(format!(
                    "expression {i} has invalid offsets {lo}..{hi}"
                )));
            }
            exprs.push(decode_expr(i, &csr.data[lo..hi], num_exprs, num_rules)?);
        }

        let mut rules = Vec::with_capacity(num_rules);
        for r in &wire.rules {
            let body = check_expr_id(r.body_expr_id, num_exprs, &r.name, "body")?;
            let lookahead = if r.lookahead_assertion_id == -1 {
                None
            } else {
                Some(check_expr_id(
                    r.lookahead_assertion_id,
                    num_exprs,
                    &r.name,
                    "lookahead",
                )?)
            };
            rules.push(Rule {
                name: r.name.clone(),
                body,
                lookahead,
            });
        }

        let root_rule = rules
            .iter()
            .position(|r| r.name == root_rule_name)
            .map(|i| RuleId(i as u32))
            .ok_or_else(|| {
                Error::serialization(format!(
                    "root rule \"{root_rule_name}\" not present in serialized grammar"
                ))
            })?;

        Ok(Grammar {
            rules,
            exprs,
            root_rule,
        })
    }
}

fn check_expr_id(id: i64, num_exprs: usize, rule: &str, what: &str) -> Result<ExprId> {
    if id < 0 || id as usize >= num_exprs {
        return Err(Error::serialization(format!(
            "rule \"{rule}\" has out-of-range {what} expression id {id}"
        )));
    }
    Ok(ExprId(id as u32))
}

fn encode_expr(expr: &Expr, out: &mut Vec<i32>) {
    match expr {
        Expr::ByteString(bytes) => {
            out.push(TAG_BYTE_STRING);
            out.extend(bytes.iter().map(|&b| b as i32));
        }
        Expr::CharacterClass { negated, ranges } => {
            out.push(TAG_CHARACTER_CLASS);
            out.push(*negated as i32);
            for &(lo, hi) in ranges {
                out.push(lo as i32);
                out.push(hi as i32);
            }
        }
        Expr::CharacterClassStar { negated, ranges } => {
            out.push(TAG_CHARACTER_CLASS_STAR);
            out.push(*negated as i32);
            for &(lo, hi) in ranges {
                out.push(lo as i32);
                out.push(hi as i32);
            }
        }
        Expr::EmptyString => out.push(TAG_EMPTY_STRING),
        Expr::RuleRef(rule) => {
            out.push(TAG_RULE_REF);
            out.push(rule.0 as i32);
        }
        Expr::Sequence(elems) => {
            out.push(TAG_SEQUENCE);
            out.extend(elems.iter().map(|e| e.0 as i32));
        }
        Expr::Choices(alts) => {
            out.push(TAG_CHOICES);
            out.extend(alts.iter().map(|e| e.0 as i32));
        }
        Expr::Repeat { rule, min, max } => {
            out.push(TAG_REPEAT);
            out.push(rule.0 as i32);
            out.push(*min as i32);
            out.push(max.map_or(UNBOUNDED, |m| m as i32));
        }
    }
}

fn decode_expr(index: usize, slice: &[i32], num_exprs: usize, num_rules: usize) -> Result<Expr> {
    let bad = |msg: String| Error::serialization(format!("expression {index}: {msg}"));
    let (&tag, payload) = slice
        .split_first()
        .ok_or_else(|| bad("empty expression slice".into()))?;
    match tag {
        TAG_BYTE_STRING => {
            if payload.is_empty() {
                return Err(bad("byte string must be nonempty".into()));
            }
            let bytes = payload
                .iter()
                .map(|&v| {
                    u8::try_from(v).map_err(|_| bad(format!("byte value {v} out of range")))
                })
                .collect::<Result<Vec<u8>>>()?;
            Ok(Expr::ByteString(bytes))
        }
        TAG_CHARACTER_CLASS | TAG_CHARACTER_CLASS_STAR => {
            let (&negated, rest) = payload
                .split_first()
                .ok_or_else(|| bad("character class missing negation flag".into()))?;
            if rest.len() % 2 != 0 {
                return Err(bad("character class ranges must be pairs".into()));
            }
            let mut ranges = Vec::with_capacity(rest.len() / 2);
            for pair in rest.chunks_exact(2) {
                let (lo, hi) = (pair[0], pair[1]);
                if lo < 0 || hi < lo {
                    return Err(bad(format!("invalid codepoint range {lo}..{hi}")));
                }
                ranges.push((lo as u32, hi as u32));
            }
            let negated = negated != 0;
            if tag == TAG_CHARACTER_CLASS {
                Ok(Expr::CharacterClass { negated, ranges })
            } else {
                Ok(Expr::CharacterClassStar { negated, ranges })
            }
        }
        TAG_EMPTY_STRING => {
            if !payload.is_empty() {
                return Err(bad("empty string carries no payload".into()));
            }
            Ok(Expr::EmptyString)
        }
        TAG_RULE_REF => {
            let &[rule] = payload else {
                return Err(bad("rule reference needs exactly one id".into()));
            };
            if rule < 0 || rule as usize >= num_rules {
                return Err(bad(format!("rule reference {rule} out of range")));
            }
            Ok(Expr::RuleRef(RuleId(rule as u32)))
        }
        TAG_SEQUENCE | TAG_CHOICES => {
            let mut ids = Vec::with_capacity(payload.len());
            for &v in payload {
                if v < 0 || v as usize >= num_exprs {
                    return Err(bad(format!("child expression id {v} out of range")));
                }
                ids.push(ExprId(v as u32));
            }
            if tag == TAG_SEQUENCE {
                Ok(Expr::Sequence(ids))
            } else {
                Ok(Expr::Choices(ids))
            }
        }
        TAG_REPEAT => {
            let &[rule, min, max] = payload else {
                return Err(bad("repeat needs rule, min, max".into()));
            };
            if rule < 0 || rule as usize >= num_rules {
                return Err(bad(format!("repeat rule id {rule} out of range")));
            }
            if min < 0 || (max != UNBOUNDED && max < min) {
                return Err(bad(format!("invalid repeat bounds {min}..{max}")));
            }
            Ok(Expr::Repeat {
                rule: RuleId(rule as u32),
                min: min as u32,
                max: (max != UNBOUNDED).then_some(max as u32),
            })
        }
        other => Err(bad(format!("unknown expression tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_structurally_equal(a: &Grammar, b: &Grammar) {
        assert_eq!(a.num_rules(), b.num_rules());
        assert_eq!(a.num_exprs(), b.num_exprs());
        assert_eq!(a.root_rule(), b.root_rule());
        for (ra, rb) in a.rules().iter().zip(b.rules()) {
            assert_eq!(ra.name, rb.name);
            assert_eq!(ra.body, rb.body);
            assert_eq!(ra.lookahead, rb.lookahead);
        }
        for i in 0..a.num_exprs() {
            assert_eq!(a.expr(ExprId(i as u32)), b.expr(ExprId(i as u32)));
        }
    }

    #[test]
    fn test_round_trip_simple() {
        let g = Grammar::from_ebnf("root ::= \"ab\" [0-9]* | \"\"", "root").unwrap();
        let back = Grammar::from_json(&g.to_json(), "root").unwrap();
        assert_structurally_equal(&g, &back);
    }

    #[test]
    fn test_round_trip_all_variants() {
        let src = r#"
root ::= item{2,5} tail [^x-z]* (= "!")
item ::= [a-f] | "literal" | ""
tail ::= item*
"#;
        let g = Grammar::from_ebnf(src, "root").unwrap();
        let back = Grammar::from_json(&g.to_json(), "root").unwrap();
        assert_structurally_equal(&g, &back);
        assert_eq!(g.to_string(), back.to_string());
    }

    #[test]
    fn test_lookahead_id_is_minus_one_when_absent() {
        let g = Grammar::from_ebnf("root ::= \"a\"", "root").unwrap();
        let json = g.to_json();
        assert!(json.contains("\"lookahead_assertion_id\":-1"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let g = Grammar::from_ebnf("root ::= \"a\"", "root").unwrap();
        let json = g.to_json().replacen('{', "{\"extra\":1,", 1);
        let err = Grammar::from_json(&json, "root").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_malformed_blobs_rejected() {
        assert!(Grammar::from_json("not json", "root").is_err());
        // Unknown tag.
        let json = r#"{"rules":[{"name":"root","body_expr_id":0,"lookahead_assertion_id":-1}],
            "grammar_expr_data":{"data":[99],"offsets":[0,1]}}"#;
        assert!(Grammar::from_json(json, "root").is_err());
        // Out-of-range rule ref.
        let json = r#"{"rules":[{"name":"root","body_expr_id":0,"lookahead_assertion_id":-1}],
            "grammar_expr_data":{"data":[4,7],"offsets":[0,2]}}"#;
        assert!(Grammar::from_json(json, "root").is_err());
        // Missing root name.
        let g = Grammar::from_ebnf("root ::= \"a\"", "root").unwrap();
        assert!(Grammar::from_json(&g.to_json(), "start").is_err());
    }

    #[test]
    fn test_builtin_json_round_trips() {
        let g = Grammar::builtin_json();
        let back = Grammar::from_json(&g.to_json(), "root").unwrap();
        assert_structurally_equal(g, &back);
    }
}
