//! Grammar AST.
//!
//! A grammar is an ordered list of rules plus a flat expression arena;
//! expressions reference each other (and rules) by index. The arena form
//! is immutable once built and shared across matchers behind an `Arc`.

pub mod builder;
pub mod ebnf;
pub(crate) mod normalize;
pub mod serialize;

use std::fmt;
use std::sync::LazyLock;

/// Index into a grammar's rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(pub u32);

/// Index into a grammar's expression arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

/// A named production. `lookahead` is an optional assertion expression that
/// must match the input following the rule for its completion to count.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub body: ExprId,
    pub lookahead: Option<ExprId>,
}

/// One node of the expression arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// The empty string.
    EmptyString,
    /// A literal byte sequence. UTF-8 text is stored as its raw bytes.
    ByteString(Vec<u8>),
    /// A set of inclusive Unicode codepoint ranges, e.g. `[a-z0-9]`.
    /// With `negated`, matches any codepoint outside the ranges.
    CharacterClass {
        negated: bool,
        ranges: Vec<(u32, u32)>,
    },
    /// `[…]*` as a single node, so the matcher loops in place instead of
    /// recursing through an auxiliary rule per character.
    CharacterClassStar {
        negated: bool,
        ranges: Vec<(u32, u32)>,
    },
    /// Reference to another rule.
    RuleRef(RuleId),
    /// Concatenation.
    Sequence(Vec<ExprId>),
    /// Alternation.
    Choices(Vec<ExprId>),
    /// Bounded repetition of a rule; `max: None` is unbounded.
    Repeat {
        rule: RuleId,
        min: u32,
        max: Option<u32>,
    },
}

/// An immutable grammar. Construct through [`builder::GrammarBuilder`],
/// [`Grammar::from_ebnf`], or the schema/regex/structural-tag front ends.
#[derive(Debug, Clone)]
pub struct Grammar {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
    pub(crate) root_rule: RuleId,
}

impl Grammar {
    pub fn root_rule(&self) -> RuleId {
        self.root_rule
    }

    pub fn root(&self) -> &Rule {
        self.rule(self.root_rule)
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0 as usize]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Whether an expression can derive the empty string. Rule recursion is
    /// treated as non-nullable on re-entry, which is exact for grammars
    /// without trivially-left-recursive empty cycles.
    pub(crate) fn expr_nullable(&self, id: ExprId) -> bool {
        let mut visiting = vec![false; self.rules.len()];
        self.expr_nullable_rec(id, &mut visiting)
    }

    /// Rule-level nullability (body of the given rule).
    pub fn rule_nullable(&self, id: RuleId) -> bool {
        let mut visiting = vec![false; self.rules.len()];
        self.rule_nullable_rec(id, &mut visiting)
    }

    fn rule_nullable_rec(&self, id: RuleId, visiting: &mut Vec<bool>) -> bool {
        if visiting[id.0 as usize] {
            return false;
        }
        visiting[id.0 as usize] = true;
        let result = self.expr_nullable_rec(self.rule(id).body, visiting);
        visiting[id.0 as usize] = false;
        result
    }

    fn expr_nullable_rec(&self, id: ExprId, visiting: &mut Vec<bool>) -> bool {
        match self.expr(id) {
            Expr::EmptyString => true,
            Expr::ByteString(bytes) => bytes.is_empty(),
            Expr::CharacterClass { .. } => false,
            Expr::CharacterClassStar { .. } => true,
            Expr::RuleRef(rule) => self.rule_nullable_rec(*rule, visiting),
            Expr::Sequence(elems) => elems
                .iter()
                .all(|&e| self.expr_nullable_rec(e, visiting)),
            Expr::Choices(alts) => alts
                .iter()
                .any(|&e| self.expr_nullable_rec(e, visiting)),
            Expr::Repeat { rule, min, .. } => {
                *min == 0 || self.rule_nullable_rec(*rule, visiting)
            }
        }
    }

    /// The built-in grammar accepting any JSON document, parsed once per
    /// process.
    pub fn builtin_json() -> &'static Grammar {
        static BUILTIN: LazyLock<Grammar> = LazyLock::new(|| {
            Grammar::from_ebnf(BUILTIN_JSON_EBNF, "root")
                .expect("built-in JSON grammar must parse")
        });
        &BUILTIN
    }
}

pub(crate) const BUILTIN_JSON_EBNF: &str = r#"
root ::= value
value ::= object | array | string | number | "true" | "false" | "null"
object ::= "{" ws (pair ("," ws pair)*)? ws "}"
pair ::= ws string ws ":" ws value
array ::= "[" ws (value ("," ws value)*)? ws "]"
string ::= "\"" char* "\""
char ::= [^"\\] | "\\" escape
escape ::= "\"" | "\\" | "/" | "b" | "f" | "n" | "r" | "t" | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]
number ::= integer fraction? exponent?
integer ::= "-"? ("0" | [1-9] [0-9]*)
fraction ::= "." [0-9]+
exponent ::= [eE] [+-]? [0-9]+
ws ::= [ \t\n\r]*
"#;

// ─── Printer ─────────────────────────────────────────────────────────

/// Printing depth cap; hand-built expression trees may nest arbitrarily.
const MAX_PRINT_DEPTH: usize = 256;

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} ::= ", rule.name)?;
            self.fmt_expr(f, rule.body, 0)?;
            if let Some(la) = rule.lookahead {
                write!(f, " (= ")?;
                self.fmt_expr(f, la, 0)?;
                write!(f, ")")?;
            }
        }
        Ok(())
    }
}

impl Grammar {
    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, id: ExprId, depth: usize) -> fmt::Result {
        if depth > MAX_PRINT_DEPTH {
            return write!(f, "…");
        }
        match self.expr(id) {
            Expr::EmptyString => write!(f, "\"\""),
            Expr::ByteString(bytes) => {
                write!(f, "\"")?;
                for &b in bytes {
                    fmt_string_byte(f, b)?;
                }
                write!(f, "\"")
            }
            Expr::CharacterClass { negated, ranges } => {
                fmt_char_class(f, *negated, ranges)
            }
            Expr::CharacterClassStar { negated, ranges } => {
                fmt_char_class(f, *negated, ranges)?;
                write!(f, "*")
            }
            Expr::RuleRef(rule) => write!(f, "{}", self.rule(*rule).name),
            Expr::Sequence(elems) => {
                write!(f, "(")?;
                for (i, &e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    self.fmt_expr(f, e, depth + 1)?;
                }
                write!(f, ")")
            }
            Expr::Choices(alts) => {
                write!(f, "(")?;
                for (i, &e) in alts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    self.fmt_expr(f, e, depth + 1)?;
                }
                write!(f, ")")
            }
            Expr::Repeat { rule, min, max } => {
                let name = &self.rule(*rule).name;
                match max {
                    Some(max) => write!(f, "{name}{{{min},{max}}}"),
                    None => write!(f, "{name}{{{min},}}"),
                }
            }
        }
    }
}

fn fmt_string_byte(f: &mut fmt::Formatter<'_>, b: u8) -> fmt::Result {
    match b {
        b'\\' => write!(f, "\\\\"),
        b'"' => write!(f, "\\\""),
        b'\n' => write!(f, "\\n"),
        b'\r' => write!(f, "\\r"),
        b'\t' => write!(f, "\\t"),
        0x20..=0x7e => write!(f, "{}", b as char),
        _ => write!(f, "\\x{b:02x}"),
    }
}

fn fmt_char_class(f: &mut fmt::Formatter<'_>, negated: bool, ranges: &[(u32, u32)]) -> fmt::Result {
    write!(f, "[")?;
    if negated {
        write!(f, "^")?;
    }
    for &(lo, hi) in ranges {
        fmt_class_point(f, lo)?;
        if lo != hi {
            write!(f, "-")?;
            fmt_class_point(f, hi)?;
        }
    }
    write!(f, "]")
}

fn fmt_class_point(f: &mut fmt::Formatter<'_>, cp: u32) -> fmt::Result {
    match cp {
        0x5c => write!(f, "\\\\"),
        0x5d => write!(f, "\\]"),
        0x5e => write!(f, "\\^"),
        0x2d => write!(f, "\\-"),
        0x09 => write!(f, "\\t"),
        0x0a => write!(f, "\\n"),
        0x0d => write!(f, "\\r"),
        0x20..=0x7e => write!(f, "{}", cp as u8 as char),
        cp if cp <= 0xffff => write!(f, "\\u{cp:04x}"),
        cp => write!(f, "\\U{cp:08x}"),
    }
}
