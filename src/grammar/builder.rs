//! Programmatic grammar construction.

use crate::error::{Error, Result};

use super::{Expr, ExprId, Grammar, Rule, RuleId};

const UNSET_BODY: ExprId = ExprId(u32::MAX);

/// Incremental builder over the rule list and expression arena.
///
/// Rules may be declared before their bodies exist, which is how forward
/// references resolve in the two-pass EBNF parser.
pub struct GrammarBuilder {
    rules: Vec<Rule>,
    exprs: Vec<Expr>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            exprs: Vec::new(),
        }
    }

    /// Declare a rule with no body yet; fill it later with
    /// [`set_rule_body`](Self::set_rule_body).
    pub fn add_rule(&mut self, name: &str) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(Rule {
            name: name.to_string(),
            body: UNSET_BODY,
            lookahead: None,
        });
        id
    }

    pub fn set_rule_body(&mut self, rule: RuleId, body: ExprId) {
        self.rules[rule.0 as usize].body = body;
    }

    pub fn set_rule_lookahead(&mut self, rule: RuleId, expr: ExprId) {
        self.rules[rule.0 as usize].lookahead = Some(expr);
    }

    pub fn add_expr(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    pub fn add_empty_string(&mut self) -> ExprId {
        self.add_expr(Expr::EmptyString)
    }

    pub fn add_byte_string(&mut self, bytes: &[u8]) -> ExprId {
        self.add_expr(Expr::ByteString(bytes.to_vec()))
    }

    pub fn add_character_class(&mut self, negated: bool, ranges: Vec<(u32, u32)>) -> ExprId {
        self.add_expr(Expr::CharacterClass { negated, ranges })
    }

    pub fn add_character_class_star(&mut self, negated: bool, ranges: Vec<(u32, u32)>) -> ExprId {
        self.add_expr(Expr::CharacterClassStar { negated, ranges })
    }

    pub fn add_rule_ref(&mut self, rule: RuleId) -> ExprId {
        self.add_expr(Expr::RuleRef(rule))
    }

    pub fn add_sequence(&mut self, elems: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Sequence(elems))
    }

    pub fn add_choices(&mut self, alts: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Choices(alts))
    }

    pub fn add_repeat(&mut self, rule: RuleId, min: u32, max: Option<u32>) -> ExprId {
        self.add_expr(Expr::Repeat { rule, min, max })
    }

    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        self.rules
            .iter()
            .position(|r| r.name == name)
            .map(|i| RuleId(i as u32))
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Read back an expression added earlier (the parser inspects operands
    /// when lowering quantifiers).
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    /// Copy every rule and expression of `other` into this builder,
    /// prefixing the imported rule names with `prefix`. Returns the new id
    /// of `other`'s root rule. Used to embed one compiled grammar (e.g. a
    /// JSON-schema grammar) inside another (a structural tag).
    pub fn import(&mut self, other: &Grammar, prefix: &str) -> RuleId {
        let rule_base = self.rules.len() as u32;
        for rule in other.rules() {
            self.add_rule(&format!("{prefix}_{}", rule.name));
        }
        let mut expr_map = vec![ExprId(u32::MAX); other.num_exprs()];
        for i in 0..other.num_exprs() {
            let old = ExprId(i as u32);
            let remapped = match other.expr(old) {
                Expr::EmptyString => Expr::EmptyString,
                Expr::ByteString(b) => Expr::ByteString(b.clone()),
                Expr::CharacterClass { negated, ranges } => Expr::CharacterClass {
                    negated: *negated,
                    ranges: ranges.clone(),
                },
                Expr::CharacterClassStar { negated, ranges } => Expr::CharacterClassStar {
                    negated: *negated,
                    ranges: ranges.clone(),
                },
                Expr::RuleRef(r) => Expr::RuleRef(RuleId(r.0 + rule_base)),
                Expr::Sequence(elems) => Expr::Sequence(
                    elems.iter().map(|e| expr_map[e.0 as usize]).collect(),
                ),
                Expr::Choices(alts) => Expr::Choices(
                    alts.iter().map(|e| expr_map[e.0 as usize]).collect(),
                ),
                Expr::Repeat { rule, min, max } => Expr::Repeat {
                    rule: RuleId(rule.0 + rule_base),
                    min: *min,
                    max: *max,
                },
            };
            expr_map[i] = self.add_expr(remapped);
        }
        for (i, rule) in other.rules().iter().enumerate() {
            let new_id = RuleId(rule_base + i as u32);
            self.set_rule_body(new_id, expr_map[rule.body.0 as usize]);
            if let Some(la) = rule.lookahead {
                self.set_rule_lookahead(new_id, expr_map[la.0 as usize]);
            }
        }
        RuleId(other.root_rule().0 + rule_base)
    }

    /// Finish, resolving the root rule by name. Fails if the root is
    /// missing or any declared rule was never given a body.
    pub fn build(self, root_rule_name: &str) -> Result<Grammar> {
        let root_rule = self
            .rules
            .iter()
            .position(|r| r.name == root_rule_name)
            .map(|i| RuleId(i as u32))
            .ok_or_else(|| {
                Error::validation(format!("root rule \"{root_rule_name}\" not found"))
            })?;
        for rule in &self.rules {
            if rule.body == UNSET_BODY {
                return Err(Error::validation(format!(
                    "rule \"{}\" has no body",
                    rule.name
                )));
            }
        }
        Ok(Grammar {
            rules: self.rules,
            exprs: self.exprs,
            root_rule,
        })
    }
}

impl Default for GrammarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple() {
        let mut b = GrammarBuilder::new();
        let root = b.add_rule("root");
        let lit = b.add_byte_string(b"hello");
        b.set_rule_body(root, lit);
        let g = b.build("root").unwrap();
        assert_eq!(g.num_rules(), 1);
        assert_eq!(g.root().name, "root");
        assert!(matches!(g.expr(g.root().body), Expr::ByteString(bytes) if bytes == b"hello"));
    }

    #[test]
    fn test_missing_root_and_body() {
        let mut b = GrammarBuilder::new();
        let r = b.add_rule("main");
        let e = b.add_empty_string();
        b.set_rule_body(r, e);
        assert!(b.build("root").is_err());

        let mut b = GrammarBuilder::new();
        b.add_rule("root");
        assert!(b.build("root").is_err());
    }

    #[test]
    fn test_find_rule() {
        let mut b = GrammarBuilder::new();
        b.add_rule("root");
        b.add_rule("digit");
        assert_eq!(b.find_rule("digit"), Some(RuleId(1)));
        assert_eq!(b.find_rule("nope"), None);
    }

    #[test]
    fn test_import_remaps_rules_and_exprs() {
        let inner = crate::grammar::Grammar::from_ebnf(
            "root ::= \"x\" digit\ndigit ::= [0-9]",
            "root",
        )
        .unwrap();

        let mut b = GrammarBuilder::new();
        let outer_root = b.add_rule("root");
        let imported_root = b.import(&inner, "inner");
        let head = b.add_byte_string(b">");
        let inner_ref = b.add_rule_ref(imported_root);
        let seq = b.add_sequence(vec![head, inner_ref]);
        b.set_rule_body(outer_root, seq);
        let g = b.build("root").unwrap();

        assert_eq!(g.num_rules(), 1 + inner.num_rules());
        assert!(g.rules().iter().any(|r| r.name == "inner_root"));
        assert!(g.rules().iter().any(|r| r.name == "inner_digit"));
        // The printed grammar must reference the prefixed names.
        assert!(g.to_string().contains("inner_digit"));
    }
}
