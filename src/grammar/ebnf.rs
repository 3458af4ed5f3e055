//! EBNF front end.
//!
//! Two passes over the token stream: the first registers every `name ::=`
//! head so forward references resolve; the second parses rule bodies.
//! Productions use `::=`, `|` for alternation, juxtaposition for
//! concatenation, `"…"` byte strings, `[…]` character classes, `? * +`
//! and `{lo,hi}` quantifiers, `(…)` grouping, `#` comments, and a trailing
//! `(= …)` lookahead assertion (one sequence) per rule.

use crate::error::{Error, Result};

use super::builder::GrammarBuilder;
use super::{Expr, ExprId, Grammar, RuleId};

// ─── Escape decoding ─────────────────────────────────────────────────

fn hex_value(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u32),
        b'a'..=b'f' => Some((c - b'a' + 10) as u32),
        b'A'..=b'F' => Some((c - b'A' + 10) as u32),
        _ => None,
    }
}

/// Decode one escape sequence starting at the backslash. Returns the
/// codepoint and the number of input bytes consumed.
fn decode_escape(data: &[u8], extra: &[u8]) -> std::result::Result<(u32, usize), String> {
    if data.len() < 2 || data[0] != b'\\' {
        return Err("expected escape sequence".into());
    }
    if extra.contains(&data[1]) {
        return Ok((data[1] as u32, 2));
    }
    match data[1] {
        b'\'' => Ok((0x27, 2)),
        b'"' => Ok((0x22, 2)),
        b'?' => Ok((0x3f, 2)),
        b'\\' => Ok((0x5c, 2)),
        b'a' => Ok((0x07, 2)),
        b'b' => Ok((0x08, 2)),
        b'f' => Ok((0x0c, 2)),
        b'n' => Ok((0x0a, 2)),
        b'r' => Ok((0x0d, 2)),
        b't' => Ok((0x09, 2)),
        b'v' => Ok((0x0b, 2)),
        b'0' => Ok((0x00, 2)),
        b'e' => Ok((0x1b, 2)),
        b'x' => {
            let mut cp = 0u32;
            let mut len = 0;
            while 2 + len < data.len() && len < 8 {
                match hex_value(data[2 + len]) {
                    Some(d) => {
                        cp = cp * 16 + d;
                        len += 1;
                    }
                    None => break,
                }
            }
            if len == 0 {
                return Err("\\x escape needs at least one hex digit".into());
            }
            Ok((cp, 2 + len))
        }
        b'u' => decode_fixed_hex(data, 4),
        b'U' => decode_fixed_hex(data, 8),
        other => Err(format!("invalid escape sequence: \\{}", other as char)),
    }
}

fn decode_fixed_hex(data: &[u8], digits: usize) -> std::result::Result<(u32, usize), String> {
    if data.len() < 2 + digits {
        return Err(format!("\\{} escape needs {digits} hex digits", data[1] as char));
    }
    let mut cp = 0u32;
    for i in 0..digits {
        let d = hex_value(data[2 + i])
            .ok_or_else(|| format!("invalid hex digit in \\{} escape", data[1] as char))?;
        cp = cp * 16 + d;
    }
    Ok((cp, 2 + digits))
}

/// Decode the next UTF-8 character or escape. Returns codepoint and bytes
/// consumed.
fn decode_char_or_escape(data: &[u8], extra: &[u8]) -> std::result::Result<(u32, usize), String> {
    if data.is_empty() {
        return Err("unexpected end of input".into());
    }
    if data[0] == b'\\' {
        return decode_escape(data, extra);
    }
    let len = match data[0] {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => return Err("invalid UTF-8 in grammar text".into()),
    };
    if data.len() < len {
        return Err("truncated UTF-8 sequence in grammar text".into());
    }
    match std::str::from_utf8(&data[..len]).ok().and_then(|s| s.chars().next()) {
        Some(c) => Ok((c as u32, len)),
        None => Err("invalid UTF-8 in grammar text".into()),
    }
}

// ─── Lexer ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    /// Identifier immediately followed (after spaces) by `::=`.
    RuleName(String),
    Ident(String),
    Str(Vec<u32>),
    ClassStart { negated: bool },
    ClassChar(u32),
    ClassDash,
    ClassEnd,
    Assign,
    LParen,
    RParen,
    LookaheadStart,
    LBrace,
    RBrace,
    Pipe,
    Star,
    Plus,
    Question,
    Comma,
    Int(i64),
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    tok: Tok,
    line: usize,
    col: usize,
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, delta: usize) -> Option<u8> {
        self.input.get(self.pos + delta).copied()
    }

    fn bump(&mut self) {
        if let Some(b) = self.peek() {
            if b == b'\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += 1;
        }
    }

    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.bump();
        }
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        Error::parse_at(self.line, self.col, msg)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\n' | b'\r') => self.bump(),
                Some(b'#') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn is_name_byte(c: u8, first: bool) -> bool {
        c == b'_' || c == b'-' || c == b'.' || c.is_ascii_alphabetic()
            || (!first && c.is_ascii_digit())
    }

    fn lex_name(&mut self) -> String {
        let start = self.pos;
        let mut first = true;
        while let Some(c) = self.peek() {
            if Self::is_name_byte(c, first) {
                self.bump();
                first = false;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn lex_string(&mut self) -> Result<Vec<u32>> {
        self.bump(); // opening quote
        let mut codepoints = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => {
                    return Err(self.err("unterminated string literal"));
                }
                Some(b'"') => break,
                _ => {
                    let rest = &self.input[self.pos..];
                    let (cp, len) =
                        decode_char_or_escape(rest, &[]).map_err(|m| self.err(m))?;
                    if char::from_u32(cp).is_none() {
                        return Err(self.err(format!("invalid codepoint U+{cp:04X}")));
                    }
                    self.bump_n(len);
                    codepoints.push(cp);
                }
            }
        }
        self.bump(); // closing quote
        Ok(codepoints)
    }

    /// Lex the whole `[…]` class into tokens.
    fn lex_char_class(&mut self, out: &mut Vec<Spanned>) -> Result<()> {
        let (line, col) = (self.line, self.col);
        self.bump(); // [
        let negated = if self.peek() == Some(b'^') {
            self.bump();
            true
        } else {
            false
        };
        out.push(Spanned {
            tok: Tok::ClassStart { negated },
            line,
            col,
        });

        // Inside classes, regex metacharacters may be escaped verbatim.
        const CLASS_EXTRA: &[u8] = b"^$.*+?()[]{}|/-";

        loop {
            let (line, col) = (self.line, self.col);
            match self.peek() {
                None => return Err(self.err("unterminated character class")),
                Some(b'\n') | Some(b'\r') => {
                    return Err(self.err("character class cannot contain a newline"));
                }
                Some(b']') => {
                    out.push(Spanned {
                        tok: Tok::ClassEnd,
                        line,
                        col,
                    });
                    self.bump();
                    return Ok(());
                }
                Some(b'-') => {
                    out.push(Spanned {
                        tok: Tok::ClassDash,
                        line,
                        col,
                    });
                    self.bump();
                }
                _ => {
                    let rest = &self.input[self.pos..];
                    let (cp, len) =
                        decode_char_or_escape(rest, CLASS_EXTRA).map_err(|m| self.err(m))?;
                    self.bump_n(len);
                    out.push(Spanned {
                        tok: Tok::ClassChar(cp),
                        line,
                        col,
                    });
                }
            }
        }
    }

    fn lex_int(&mut self) -> Result<i64> {
        let mut value: i64 = 0;
        let mut any = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                any = true;
                value = value * 10 + (c - b'0') as i64;
                if value > 1_000_000_000 {
                    return Err(self.err("repetition bound too large"));
                }
                self.bump();
            } else {
                break;
            }
        }
        if !any {
            return Err(self.err("expected integer"));
        }
        Ok(value)
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            let (line, col) = (self.line, self.col);
            let tok = match self.peek() {
                None => {
                    out.push(Spanned {
                        tok: Tok::Eof,
                        line,
                        col,
                    });
                    break;
                }
                Some(b'(') => {
                    if self.peek_at(1) == Some(b'=') {
                        self.bump_n(2);
                        Tok::LookaheadStart
                    } else {
                        self.bump();
                        Tok::LParen
                    }
                }
                Some(b')') => {
                    self.bump();
                    Tok::RParen
                }
                Some(b'{') => {
                    self.bump();
                    Tok::LBrace
                }
                Some(b'}') => {
                    self.bump();
                    Tok::RBrace
                }
                Some(b'|') => {
                    self.bump();
                    Tok::Pipe
                }
                Some(b'*') => {
                    self.bump();
                    Tok::Star
                }
                Some(b'+') => {
                    self.bump();
                    Tok::Plus
                }
                Some(b'?') => {
                    self.bump();
                    Tok::Question
                }
                Some(b',') => {
                    self.bump();
                    Tok::Comma
                }
                Some(b':') => {
                    if self.peek_at(1) == Some(b':') && self.peek_at(2) == Some(b'=') {
                        self.bump_n(3);
                        Tok::Assign
                    } else {
                        return Err(self.err("unexpected ':'"));
                    }
                }
                Some(b'"') => Tok::Str(self.lex_string()?),
                Some(b'[') => {
                    self.lex_char_class(&mut out)?;
                    continue;
                }
                Some(c) if Self::is_name_byte(c, true) => Tok::Ident(self.lex_name()),
                Some(c) if c.is_ascii_digit() => Tok::Int(self.lex_int()?),
                Some(c) => {
                    return Err(self.err(format!("unexpected character '{}'", c as char)));
                }
            };
            out.push(Spanned { tok, line, col });
        }
        promote_rule_names(&mut out)?;
        Ok(out)
    }
}

/// Rewrite `Ident` tokens directly preceding `::=` into `RuleName`. A rule
/// head must be the first token on its line.
fn promote_rule_names(tokens: &mut [Spanned]) -> Result<()> {
    for i in 0..tokens.len() {
        if tokens[i].tok != Tok::Assign {
            continue;
        }
        if i == 0 {
            return Err(Error::parse_at(
                tokens[i].line,
                tokens[i].col,
                "::= with no preceding rule name",
            ));
        }
        let name = match &tokens[i - 1].tok {
            Tok::Ident(name) => name.clone(),
            _ => {
                return Err(Error::parse_at(
                    tokens[i - 1].line,
                    tokens[i - 1].col,
                    "::= must be preceded by an identifier",
                ));
            }
        };
        if i >= 2 && tokens[i - 2].line == tokens[i - 1].line {
            return Err(Error::parse_at(
                tokens[i - 1].line,
                tokens[i - 1].col,
                "rule name must start its line",
            ));
        }
        tokens[i - 1].tok = Tok::RuleName(name);
    }
    Ok(())
}

// ─── Parser ──────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    builder: GrammarBuilder,
    cur_rule_name: String,
    aux_counter: usize,
    /// Nesting level of `(`/`(=` groups; newlines only terminate a
    /// sequence at depth zero.
    paren_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            builder: GrammarBuilder::new(),
            cur_rule_name: String::new(),
            aux_counter: 0,
            paren_depth: 0,
        }
    }

    fn peek(&self) -> &Spanned {
        &self.tokens[self.pos]
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    /// Line of the most recently consumed token.
    fn prev_line(&self) -> usize {
        self.tokens[self.pos.saturating_sub(1)].line
    }

    fn error(&self, msg: impl Into<String>) -> Error {
        let t = self.peek();
        Error::parse_at(t.line, t.col, msg)
    }

    fn aux_rule_name(&mut self) -> String {
        self.aux_counter += 1;
        format!("{}_{}", self.cur_rule_name, self.aux_counter)
    }

    /// Pass 1: register every rule head so bodies can forward-reference.
    fn register_rule_names(&mut self, root: &str) -> Result<()> {
        for t in &self.tokens {
            if let Tok::RuleName(name) = &t.tok {
                if self.builder.find_rule(name).is_some() {
                    return Err(Error::parse_at(
                        t.line,
                        t.col,
                        format!("rule \"{name}\" defined multiple times"),
                    ));
                }
                self.builder.add_rule(name);
            }
        }
        if self.builder.find_rule(root).is_none() {
            return Err(Error::parse(format!("root rule \"{root}\" not found")));
        }
        Ok(())
    }

    fn parse_char_class(&mut self) -> Result<ExprId> {
        let negated = match self.peek().tok {
            Tok::ClassStart { negated } => {
                self.bump();
                negated
            }
            _ => return Err(self.error("expected character class")),
        };
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        loop {
            let lo = match self.peek().tok {
                Tok::ClassEnd => {
                    self.bump();
                    break;
                }
                Tok::ClassChar(cp) => {
                    self.bump();
                    cp
                }
                Tok::ClassDash => {
                    self.bump();
                    b'-' as u32
                }
                _ => return Err(self.error("unexpected token in character class")),
            };
            // A dash between two chars forms a range; a trailing dash is a
            // literal '-'.
            let followed_by_range = self.peek().tok == Tok::ClassDash
                && matches!(
                    self.tokens.get(self.pos + 1).map(|t| &t.tok),
                    Some(Tok::ClassChar(_)) | Some(Tok::ClassDash)
                );
            if followed_by_range {
                self.bump(); // dash
                let hi = match self.peek().tok {
                    Tok::ClassChar(cp) => cp,
                    Tok::ClassDash => b'-' as u32,
                    _ => unreachable!("guarded by followed_by_range"),
                };
                self.bump();
                if lo > hi {
                    return Err(self.error("character class range has lower bound above upper"));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        Ok(self.builder.add_character_class(negated, ranges))
    }

    fn parse_string(&mut self) -> Result<ExprId> {
        let codepoints = match &self.peek().tok {
            Tok::Str(cps) => cps.clone(),
            _ => return Err(self.error("expected string literal")),
        };
        self.bump();
        if codepoints.is_empty() {
            return Ok(self.builder.add_empty_string());
        }
        let mut bytes = Vec::new();
        for cp in codepoints {
            let c = char::from_u32(cp)
                .ok_or_else(|| self.error(format!("invalid codepoint U+{cp:04X}")))?;
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
        Ok(self.builder.add_byte_string(&bytes))
    }

    fn parse_rule_ref(&mut self) -> Result<ExprId> {
        let name = match &self.peek().tok {
            Tok::Ident(name) => name.clone(),
            _ => return Err(self.error("expected identifier")),
        };
        match self.builder.find_rule(&name) {
            Some(rule) => {
                self.bump();
                Ok(self.builder.add_rule_ref(rule))
            }
            None => Err(self.error(format!("rule \"{name}\" is not defined"))),
        }
    }

    fn parse_element(&mut self) -> Result<ExprId> {
        match &self.peek().tok {
            Tok::LParen => {
                self.bump();
                self.paren_depth += 1;
                if self.peek().tok == Tok::RParen {
                    self.bump();
                    self.paren_depth -= 1;
                    return Ok(self.builder.add_empty_string());
                }
                let expr = self.parse_choices()?;
                if self.peek().tok != Tok::RParen {
                    return Err(self.error("expected ')'"));
                }
                self.bump();
                self.paren_depth -= 1;
                Ok(expr)
            }
            Tok::ClassStart { .. } => self.parse_char_class(),
            Tok::Str(_) => self.parse_string(),
            Tok::Ident(_) => self.parse_rule_ref(),
            other => Err(self.error(format!("expected grammar element, found {other:?}"))),
        }
    }

    fn parse_repeat_bounds(&mut self) -> Result<(u32, Option<u32>)> {
        self.bump(); // {
        let lo = match self.peek().tok {
            Tok::Int(n) => {
                self.bump();
                n
            }
            _ => return Err(self.error("expected integer after '{'")),
        };
        match self.peek().tok {
            Tok::RBrace => {
                self.bump();
                Ok((lo as u32, Some(lo as u32)))
            }
            Tok::Comma => {
                self.bump();
                match self.peek().tok {
                    Tok::RBrace => {
                        self.bump();
                        Ok((lo as u32, None))
                    }
                    Tok::Int(hi) => {
                        self.bump();
                        if hi < lo {
                            return Err(
                                self.error("repetition range has lower bound above upper")
                            );
                        }
                        if self.peek().tok != Tok::RBrace {
                            return Err(self.error("expected '}'"));
                        }
                        self.bump();
                        Ok((lo as u32, Some(hi as u32)))
                    }
                    _ => Err(self.error("expected integer or '}'")),
                }
            }
            _ => Err(self.error("expected ',' or '}' in repetition range")),
        }
    }

    /// If the operand is already a rule reference, repeat that rule;
    /// otherwise wrap it into a fresh auxiliary rule.
    fn rule_for_operand(&mut self, expr: ExprId) -> RuleId {
        if let Expr::RuleRef(rule) = self.builder.expr(expr) {
            return *rule;
        }
        let name = self.aux_rule_name();
        let aux = self.builder.add_rule(&name);
        self.builder.set_rule_body(aux, expr);
        aux
    }

    fn apply_quantifier(&mut self, expr: ExprId, min: u32, max: Option<u32>) -> ExprId {
        // `[…]*` compiles to the in-place star node instead of a Repeat.
        if min == 0 && max.is_none() {
            if let Expr::CharacterClass { negated, ranges } = self.builder.expr(expr) {
                let (negated, ranges) = (*negated, ranges.clone());
                return self.builder.add_character_class_star(negated, ranges);
            }
        }
        let rule = self.rule_for_operand(expr);
        self.builder.add_repeat(rule, min, max)
    }

    fn parse_quantified_element(&mut self) -> Result<ExprId> {
        let expr = self.parse_element()?;
        match self.peek().tok {
            Tok::Star => {
                self.bump();
                Ok(self.apply_quantifier(expr, 0, None))
            }
            Tok::Plus => {
                self.bump();
                Ok(self.apply_quantifier(expr, 1, None))
            }
            Tok::Question => {
                self.bump();
                Ok(self.apply_quantifier(expr, 0, Some(1)))
            }
            Tok::LBrace => {
                let (lo, hi) = self.parse_repeat_bounds()?;
                Ok(self.apply_quantifier(expr, lo, hi))
            }
            _ => Ok(expr),
        }
    }

    fn parse_sequence(&mut self) -> Result<ExprId> {
        let mut elems = Vec::new();
        loop {
            elems.push(self.parse_quantified_element()?);
            match self.peek().tok {
                Tok::Pipe
                | Tok::RParen
                | Tok::LookaheadStart
                | Tok::RuleName(_)
                | Tok::Eof => break,
                _ => {}
            }
            // A newline ends the sequence unless inside a group.
            if self.paren_depth == 0 && self.peek().line > self.prev_line() {
                break;
            }
        }
        Ok(self.builder.add_sequence(elems))
    }

    fn parse_choices(&mut self) -> Result<ExprId> {
        let mut alts = vec![self.parse_sequence()?];
        while self.peek().tok == Tok::Pipe {
            self.bump();
            alts.push(self.parse_sequence()?);
        }
        Ok(self.builder.add_choices(alts))
    }

    fn parse_rule(&mut self) -> Result<()> {
        let name = match &self.peek().tok {
            Tok::RuleName(name) => name.clone(),
            _ => return Err(self.error("expected rule definition")),
        };
        self.cur_rule_name.clone_from(&name);
        self.aux_counter = 0;
        self.bump();
        if self.peek().tok != Tok::Assign {
            return Err(self.error("expected ::="));
        }
        self.bump();

        let body = self.parse_choices()?;
        let rule = self
            .builder
            .find_rule(&name)
            .expect("registered in pass 1");
        self.builder.set_rule_body(rule, body);

        if self.peek().tok == Tok::LookaheadStart {
            self.bump();
            self.paren_depth += 1;
            let la = self.parse_sequence()?;
            if self.peek().tok != Tok::RParen {
                return Err(self.error("expected ')' to close lookahead assertion"));
            }
            self.bump();
            self.paren_depth -= 1;
            self.builder.set_rule_lookahead(rule, la);
        }
        Ok(())
    }

    fn parse(mut self, root: &str) -> Result<Grammar> {
        self.register_rule_names(root)?;
        while self.peek().tok != Tok::Eof {
            self.parse_rule()?;
        }
        self.builder.build(root)
    }
}

impl Grammar {
    /// Parse an EBNF grammar, using `root_rule_name` as the root.
    pub fn from_ebnf(source: &str, root_rule_name: &str) -> Result<Grammar> {
        let tokens = Lexer::new(source).tokenize()?;
        Parser::new(tokens).parse(root_rule_name)
    }
}
