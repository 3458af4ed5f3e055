//! Grammar canonicalization.
//!
//! After this pass every rule body is `Choices(alternatives)` where each
//! alternative is a `Sequence` of leaf elements (byte string, character
//! class, class-star, rule reference, repeat), except an empty
//! alternative, which is a bare `EmptyString` hoisted to the first
//! position so nullability is observable from the shape alone.
//!
//! Along the way: one-element sequences/choices collapse into the element,
//! a non-negated class covering a single codepoint becomes a byte string,
//! nested sequences flatten, nested choices inside a sequence are extracted
//! into auxiliary `<parent>_choice` rules, and choices inside choices are
//! spliced inline.

use super::builder::GrammarBuilder;
use super::{Expr, ExprId, Grammar, RuleId};

/// One normalized alternative of a rule body.
enum Alt {
    Empty,
    Elems(Vec<ExprId>),
}

pub(crate) fn normalize(grammar: &Grammar) -> Grammar {
    let mut ctx = Normalizer {
        grammar,
        builder: GrammarBuilder::new(),
        cur_rule: String::new(),
        choice_counter: 0,
    };

    // Original rules keep their ids; auxiliary rules append after.
    for rule in grammar.rules() {
        ctx.builder.add_rule(&rule.name);
    }
    for (i, rule) in grammar.rules().iter().enumerate() {
        ctx.cur_rule.clone_from(&rule.name);
        ctx.choice_counter = 0;
        let body = ctx.normalize_body(rule.body);
        ctx.builder.set_rule_body(RuleId(i as u32), body);
        if let Some(la) = rule.lookahead {
            let elems = ctx.flatten_sequence(la);
            let seq = ctx.builder.add_sequence(elems);
            ctx.builder.set_rule_lookahead(RuleId(i as u32), seq);
        }
    }

    let root_name = grammar.root().name.clone();
    ctx.builder
        .build(&root_name)
        .expect("normalization preserves rules")
}

struct Normalizer<'a> {
    grammar: &'a Grammar,
    builder: GrammarBuilder,
    cur_rule: String,
    choice_counter: usize,
}

impl Normalizer<'_> {
    /// Normalize a rule body into canonical `Choices(Sequence…)` shape.
    fn normalize_body(&mut self, expr: ExprId) -> ExprId {
        let mut alts = Vec::new();
        self.flatten_choices(expr, &mut alts);

        let has_empty = alts.iter().any(|a| matches!(a, Alt::Empty));
        let mut out = Vec::new();
        if has_empty {
            out.push(self.builder.add_empty_string());
        }
        for alt in alts {
            if let Alt::Elems(elems) = alt {
                out.push(self.builder.add_sequence(elems));
            }
        }
        if out.is_empty() {
            // Body was pure empty string.
            out.push(self.builder.add_empty_string());
        }
        self.builder.add_choices(out)
    }

    /// Collect alternatives, splicing nested choices inline.
    fn flatten_choices(&mut self, expr: ExprId, out: &mut Vec<Alt>) {
        match self.grammar.expr(expr) {
            Expr::Choices(inner) => {
                for &alt in inner {
                    self.flatten_choices(alt, out);
                }
            }
            _ => {
                let elems = self.flatten_sequence(expr);
                if elems.is_empty() {
                    out.push(Alt::Empty);
                } else {
                    out.push(Alt::Elems(elems));
                }
            }
        }
    }

    /// Flatten an expression into a list of leaf sequence elements.
    fn flatten_sequence(&mut self, expr: ExprId) -> Vec<ExprId> {
        let mut elems = Vec::new();
        self.flatten_sequence_into(expr, &mut elems);
        elems
    }

    fn flatten_sequence_into(&mut self, expr: ExprId, out: &mut Vec<ExprId>) {
        match self.grammar.expr(expr) {
            Expr::EmptyString => {}
            Expr::Sequence(inner) => {
                for &e in inner {
                    self.flatten_sequence_into(e, out);
                }
            }
            Expr::Choices(alts) if alts.len() == 1 => {
                // One-alternative choice collapses into the alternative.
                self.flatten_sequence_into(alts[0], out);
            }
            Expr::Choices(_) => {
                let aux = self.extract_choice_rule(expr);
                out.push(self.builder.add_rule_ref(aux));
            }
            Expr::ByteString(bytes) => {
                let bytes = bytes.clone();
                out.push(self.builder.add_byte_string(&bytes));
            }
            Expr::CharacterClass { negated, ranges } => {
                // Single-codepoint positive class is just a literal.
                if !negated && ranges.len() == 1 && ranges[0].0 == ranges[0].1 {
                    if let Some(c) = char::from_u32(ranges[0].0) {
                        let mut buf = [0u8; 4];
                        let bytes = c.encode_utf8(&mut buf).as_bytes().to_vec();
                        out.push(self.builder.add_byte_string(&bytes));
                        return;
                    }
                }
                let (negated, ranges) = (*negated, ranges.clone());
                out.push(self.builder.add_character_class(negated, ranges));
            }
            Expr::CharacterClassStar { negated, ranges } => {
                let (negated, ranges) = (*negated, ranges.clone());
                out.push(self.builder.add_character_class_star(negated, ranges));
            }
            Expr::RuleRef(rule) => {
                let rule = *rule;
                out.push(self.builder.add_rule_ref(rule));
            }
            Expr::Repeat { rule, min, max } => {
                let (rule, min, max) = (*rule, *min, *max);
                out.push(self.builder.add_repeat(rule, min, max));
            }
        }
    }

    /// Extract a nested choice expression into its own rule and normalize
    /// it recursively.
    fn extract_choice_rule(&mut self, expr: ExprId) -> RuleId {
        self.choice_counter += 1;
        let name = if self.choice_counter == 1 {
            format!("{}_choice", self.cur_rule)
        } else {
            format!("{}_choice_{}", self.cur_rule, self.choice_counter)
        };
        let aux = self.builder.add_rule(&name);
        let body = self.normalize_body(expr);
        self.builder.set_rule_body(aux, body);
        aux
    }
}
