//! JSON Schema front end.
//!
//! Translates a schema document into an EBNF grammar accepting exactly
//! the JSON values that conform structurally, honoring a dump style:
//! fixed separators on one line, pretty-printed with an indent width, or
//! whitespace-flexible. Unsupported schema constructs degrade to the
//! permissive any-JSON sub-grammar with a warning rather than failing.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::regex::regex_to_ebnf;

/// Output style and strictness options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JsonSchemaOptions {
    /// Accept any JSON whitespace between tokens. Overrides `indent` and
    /// `separators`.
    pub any_whitespace: bool,
    /// Pretty-print with this many spaces per nesting level.
    pub indent: Option<usize>,
    /// `(item_separator, key_value_separator)`. Defaults follow the
    /// standard dump convention: `(", ", ": ")` on one line, `(",", ": ")`
    /// when indenting.
    pub separators: Option<(String, String)>,
    /// Reject properties and array items the schema does not declare.
    pub strict_mode: bool,
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        Self {
            any_whitespace: true,
            indent: None,
            separators: None,
            strict_mode: true,
        }
    }
}

/// Compile a JSON Schema document into a grammar rooted at `root`.
pub fn json_schema_to_grammar(schema: &str, options: &JsonSchemaOptions) -> Result<Grammar> {
    let value: Value = serde_json::from_str(schema)
        .map_err(|e| Error::parse(format!("invalid schema JSON: {e}")))?;
    let ebnf = json_schema_to_ebnf(&value, options)?;
    Grammar::from_ebnf(&ebnf, "root")
}

/// Translate a parsed schema into EBNF text.
pub fn json_schema_to_ebnf(schema: &Value, options: &JsonSchemaOptions) -> Result<String> {
    let mut tr = SchemaTranslator::new(options.clone());
    let root_expr = tr.visit(schema, "root", 0)?;
    tr.rules.push(("root".to_string(), root_expr));
    Ok(tr.into_ebnf())
}

struct SchemaTranslator {
    options: JsonSchemaOptions,
    rules: Vec<(String, String)>,
    /// Expression cache keyed by (schema text, depth); depth matters only
    /// under `indent`.
    cache: HashMap<(String, usize), String>,
    counter: usize,
    item_sep: String,
    kv_sep: String,
}

impl SchemaTranslator {
    fn new(options: JsonSchemaOptions) -> Self {
        let (item_sep, kv_sep) = match (&options.separators, options.indent) {
            _ if options.any_whitespace => (",".to_string(), ":".to_string()),
            (Some((item, kv)), _) => (item.clone(), kv.clone()),
            (None, Some(_)) => (",".to_string(), ": ".to_string()),
            (None, None) => (", ".to_string(), ": ".to_string()),
        };
        Self {
            options,
            rules: Vec::new(),
            cache: HashMap::new(),
            counter: 0,
            item_sep,
            kv_sep,
        }
    }

    fn into_ebnf(self) -> String {
        let mut out = String::new();
        for (name, body) in &self.rules {
            out.push_str(name);
            out.push_str(" ::= ");
            out.push_str(body);
            out.push('\n');
        }
        if self.options.any_whitespace {
            out.push_str("ws ::= [ \\t\\n\\r]*\n");
        }
        out
    }

    fn fresh_name(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_{}", prefix, self.counter)
    }

    fn add_rule(&mut self, name: &str, body: &str) {
        self.rules.push((name.to_string(), body.to_string()));
    }

    // ── Dump-style pieces ────────────────────────────────────────────

    /// Expression emitted right after `{` / `[`, before the first member.
    fn open_pad(&self, depth: usize) -> String {
        if self.options.any_whitespace {
            "ws".to_string()
        } else if let Some(n) = self.options.indent {
            ebnf_literal(&format!("\n{}", " ".repeat(n * (depth + 1))))
        } else {
            String::new()
        }
    }

    /// Expression between members (separator plus padding).
    fn member_sep(&self, depth: usize) -> String {
        let sep = ebnf_literal(&self.item_sep);
        if self.options.any_whitespace {
            format!("ws {sep} ws")
        } else if let Some(n) = self.options.indent {
            format!(
                "{sep} {}",
                ebnf_literal(&format!("\n{}", " ".repeat(n * (depth + 1))))
            )
        } else {
            sep
        }
    }

    /// Expression before the closing `}` / `]`.
    fn close_pad(&self, depth: usize) -> String {
        if self.options.any_whitespace {
            "ws".to_string()
        } else if let Some(n) = self.options.indent {
            ebnf_literal(&format!("\n{}", " ".repeat(n * depth)))
        } else {
            String::new()
        }
    }

    /// Key/value separator inside an object member.
    fn pair_sep(&self) -> String {
        let sep = ebnf_literal(&self.kv_sep);
        if self.options.any_whitespace {
            format!("ws {sep} ws")
        } else {
            sep
        }
    }

    fn seq(parts: &[String]) -> String {
        let filtered: Vec<&str> = parts
            .iter()
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .collect();
        filtered.join(" ")
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn visit(&mut self, schema: &Value, hint: &str, depth: usize) -> Result<String> {
        if let Some(allow) = schema.as_bool() {
            if allow {
                return self.any_json(hint, depth);
            }
            return Err(Error::validation("false schema accepts no values"));
        }
        let Some(obj) = schema.as_object() else {
            return Err(Error::validation("schema must be an object or boolean"));
        };

        let cache_depth = if self.options.indent.is_some() { depth } else { 0 };
        let cache_key = (schema.to_string(), cache_depth);
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached.clone());
        }

        // Definitions become named rules up front so $refs resolve.
        if let Some(defs) = obj
            .get("$defs")
            .or_else(|| obj.get("definitions"))
            .and_then(|v| v.as_object())
        {
            for (name, def) in defs {
                let rule_name = format!("def_{}", sanitize_name(name));
                if !self.rules.iter().any(|(n, _)| n == &rule_name) {
                    // Reserve the slot first so recursive refs resolve.
                    self.add_rule(&rule_name, "\"\"");
                    let body = self.visit(def, &rule_name.clone(), depth)?;
                    if let Some(slot) =
                        self.rules.iter_mut().find(|(n, _)| n == &rule_name)
                    {
                        slot.1 = body;
                    }
                }
            }
        }

        let expr = self.visit_known(schema, obj, hint, depth)?;
        self.cache.insert(cache_key, expr.clone());
        Ok(expr)
    }

    fn visit_known(
        &mut self,
        schema: &Value,
        obj: &serde_json::Map<String, Value>,
        hint: &str,
        depth: usize,
    ) -> Result<String> {
        if let Some(reference) = obj.get("$ref").and_then(|v| v.as_str()) {
            let name = reference
                .strip_prefix("#/$defs/")
                .or_else(|| reference.strip_prefix("#/definitions/"))
                .ok_or_else(|| {
                    Error::validation(format!("unsupported $ref target: {reference}"))
                })?;
            return Ok(format!("def_{}", sanitize_name(name)));
        }
        if let Some(constant) = obj.get("const") {
            return Ok(json_literal(constant));
        }
        if let Some(variants) = obj.get("enum") {
            let arr = variants
                .as_array()
                .ok_or_else(|| Error::validation("enum must be an array"))?;
            if arr.is_empty() {
                return Err(Error::validation("enum must not be empty"));
            }
            let alts: Vec<String> = arr.iter().map(json_literal).collect();
            return Ok(format!("({})", alts.join(" | ")));
        }
        if let Some(any_of) = obj.get("anyOf").or_else(|| obj.get("oneOf")) {
            let arr = any_of
                .as_array()
                .ok_or_else(|| Error::validation("anyOf must be an array"))?;
            let mut alts = Vec::new();
            for (i, sub) in arr.iter().enumerate() {
                alts.push(self.visit(sub, &format!("{hint}_{i}"), depth)?);
            }
            return Ok(format!("({})", alts.join(" | ")));
        }
        if let Some(all_of) = obj.get("allOf").and_then(|v| v.as_array()) {
            if all_of.len() == 1 {
                return self.visit(&all_of[0], hint, depth);
            }
            tracing::warn!("allOf with multiple schemas degrades to any JSON");
            return self.any_json(hint, depth);
        }

        match obj.get("type") {
            Some(Value::String(ty)) => self.visit_typed(obj, ty, hint, depth),
            Some(Value::Array(types)) => {
                let mut alts = Vec::new();
                for ty in types {
                    let ty = ty
                        .as_str()
                        .ok_or_else(|| Error::validation("type array must hold strings"))?;
                    alts.push(self.visit_typed(obj, ty, hint, depth)?);
                }
                Ok(format!("({})", alts.join(" | ")))
            }
            None => {
                // Infer from the present keywords.
                if obj.contains_key("properties")
                    || obj.contains_key("required")
                    || obj.contains_key("additionalProperties")
                    || obj.contains_key("minProperties")
                    || obj.contains_key("maxProperties")
                {
                    self.visit_typed(obj, "object", hint, depth)
                } else if obj.contains_key("items")
                    || obj.contains_key("prefixItems")
                    || obj.contains_key("minItems")
                    || obj.contains_key("maxItems")
                {
                    self.visit_typed(obj, "array", hint, depth)
                } else if obj.contains_key("pattern")
                    || obj.contains_key("format")
                    || obj.contains_key("minLength")
                    || obj.contains_key("maxLength")
                {
                    self.visit_typed(obj, "string", hint, depth)
                } else if obj.contains_key("minimum") || obj.contains_key("maximum") {
                    self.visit_typed(obj, "number", hint, depth)
                } else {
                    self.any_json(hint, depth)
                }
            }
            Some(other) => Err(Error::validation(format!(
                "unexpected \"type\" value: {other}"
            ))),
        }
    }

    fn visit_typed(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        ty: &str,
        hint: &str,
        depth: usize,
    ) -> Result<String> {
        match ty {
            "null" => Ok("\"null\"".to_string()),
            "boolean" => Ok("(\"true\" | \"false\")".to_string()),
            "string" => self.visit_string(obj),
            "integer" => self.visit_integer(obj),
            "number" => self.visit_number(obj),
            "array" => self.visit_array(obj, hint, depth),
            "object" => self.visit_object(obj, hint, depth),
            other => {
                tracing::warn!(ty = other, "unknown schema type degrades to any JSON");
                self.any_json(hint, depth)
            }
        }
    }

    // ── Scalars ──────────────────────────────────────────────────────

    fn visit_string(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        if let Some(format) = obj.get("format").and_then(|v| v.as_str()) {
            if let Some(pattern) = format_regex(format) {
                return self.quoted_regex_body(&pattern, "string_format");
            }
            tracing::warn!(format, "unknown string format ignored");
        }
        if let Some(pattern) = obj.get("pattern").and_then(|v| v.as_str()) {
            return self.quoted_regex_body(pattern, "string_pattern");
        }

        let min_len = obj.get("minLength").and_then(|v| v.as_u64()).unwrap_or(0);
        let max_len = obj.get("maxLength").and_then(|v| v.as_u64());

        let char_name = self.fresh_name("json_char");
        self.add_rule(&char_name, JSON_CHAR_BODY);
        let reps = repetition_suffix(min_len as usize, max_len.map(|m| m as usize));
        Ok(format!("\"\\\"\" {char_name}{reps} \"\\\"\""))
    }

    /// Compile a regex into an auxiliary rule and wrap it in quotes.
    fn quoted_regex_body(&mut self, pattern: &str, prefix: &str) -> Result<String> {
        let ebnf = regex_to_ebnf(pattern)?;
        let body = ebnf.strip_prefix("root ::= ").unwrap_or(&ebnf).trim();
        let name = self.fresh_name(prefix);
        self.add_rule(&name, body);
        Ok(format!("\"\\\"\" {name} \"\\\"\""))
    }

    fn visit_integer(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        let min = obj
            .get("minimum")
            .and_then(|v| v.as_i64())
            .or_else(|| obj.get("exclusiveMinimum").and_then(|v| v.as_i64()).map(|v| v + 1));
        let max = obj
            .get("maximum")
            .and_then(|v| v.as_i64())
            .or_else(|| obj.get("exclusiveMaximum").and_then(|v| v.as_i64()).map(|v| v - 1));

        match (min, max) {
            (None, None) => Ok(UNBOUNDED_INTEGER.to_string()),
            (Some(lo), Some(hi)) if lo > hi => Err(Error::validation(format!(
                "integer minimum {lo} exceeds maximum {hi}"
            ))),
            _ => {
                let pattern = integer_range_regex(min, max);
                let ebnf = regex_to_ebnf(&pattern)?;
                Ok(ebnf.strip_prefix("root ::= ").unwrap_or(&ebnf).trim().to_string())
            }
        }
    }

    fn visit_number(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        let bounded = ["minimum", "maximum", "exclusiveMinimum", "exclusiveMaximum"]
            .iter()
            .any(|k| obj.contains_key(*k));
        if !bounded {
            return Ok(UNBOUNDED_NUMBER.to_string());
        }
        // Bounded reals constrain the integral part only; the fraction
        // stays free.
        tracing::warn!("number bounds apply to the integral part only");
        let int_part = self.visit_integer(obj)?;
        Ok(format!("{int_part} (\".\" [0-9]+)?"))
    }

    // ── Arrays ───────────────────────────────────────────────────────

    fn visit_array(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        hint: &str,
        depth: usize,
    ) -> Result<String> {
        let open = self.open_pad(depth);
        let sep = self.member_sep(depth);
        let close = self.close_pad(depth);

        let prefix_items = obj.get("prefixItems").and_then(|v| v.as_array());
        let min_items = obj.get("minItems").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let max_items = obj.get("maxItems").and_then(|v| v.as_u64()).map(|m| m as usize);

        let mut fixed: Vec<String> = Vec::new();
        if let Some(items) = prefix_items {
            for (i, sub) in items.iter().enumerate() {
                fixed.push(self.visit(sub, &format!("{hint}_item_{i}"), depth + 1)?);
            }
        }

        let tail_item = match obj.get("items") {
            Some(Value::Bool(false)) => None,
            Some(items) => Some(self.visit(items, &format!("{hint}_items"), depth + 1)?),
            None if self.options.strict_mode => None,
            None => Some(self.any_json(hint, depth + 1)?),
        };

        if max_items == Some(0) {
            return Ok(self.empty_brackets("[", "]"));
        }
        if fixed.is_empty() {
            let Some(item) = tail_item else {
                return Ok(self.empty_brackets("[", "]"));
            };
            // Homogeneous list with count bounds.
            let more = self.fresh_name(&format!("{hint}_more"));
            self.add_rule(&more, &Self::seq(&[sep, item.clone()]));
            let (rest_min, rest_max) = (
                min_items.saturating_sub(1),
                max_items.map(|m| m.saturating_sub(1)),
            );
            let rest = format!("{more}{}", repetition_suffix(rest_min, rest_max));
            let filled = Self::seq(&[
                "\"[\"".to_string(),
                open,
                item,
                rest,
                close,
                "\"]\"".to_string(),
            ]);
            if min_items == 0 {
                let empty = self.empty_brackets("[", "]");
                return Ok(format!("({empty} | {filled})"));
            }
            return Ok(filled);
        }

        // Tuple-shaped: fixed prefix, then optionally more items.
        if min_items > fixed.len() && tail_item.is_none() {
            return Err(Error::validation(format!(
                "minItems {min_items} exceeds the {} declared prefix items",
                fixed.len()
            )));
        }
        let mut parts = vec!["\"[\"".to_string(), open];
        for (i, item) in fixed.iter().enumerate() {
            if i > 0 {
                parts.push(sep.clone());
            }
            parts.push(item.clone());
        }
        if let Some(item) = tail_item {
            let more = self.fresh_name(&format!("{hint}_more"));
            self.add_rule(&more, &Self::seq(&[sep, item]));
            let extra_min = min_items.saturating_sub(fixed.len());
            let extra_max = max_items.map(|m| m.saturating_sub(fixed.len()));
            if extra_max != Some(0) {
                parts.push(format!("{more}{}", repetition_suffix(extra_min, extra_max)));
            }
        }
        parts.push(close);
        parts.push("\"]\"".to_string());
        Ok(Self::seq(&parts))
    }

    // ── Objects ──────────────────────────────────────────────────────

    fn visit_object(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        hint: &str,
        depth: usize,
    ) -> Result<String> {
        let open = self.open_pad(depth);
        let sep = self.member_sep(depth);
        let close = self.close_pad(depth);
        let kv = self.pair_sep();

        let required: Vec<&str> = obj
            .get("required")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        let additional = match obj.get("additionalProperties") {
            Some(Value::Bool(false)) => None,
            // Strictness only constrains what the schema left unsaid.
            None if self.options.strict_mode => None,
            Some(Value::Bool(true)) | None => {
                Some(self.any_property_value(hint, depth)?)
            }
            Some(schema) => Some(self.visit(schema, &format!("{hint}_extra"), depth + 1)?),
        };

        // (pair_expr, required) in declaration order.
        let properties = obj.get("properties").and_then(|v| v.as_object());
        for &name in &required {
            if !properties.is_some_and(|p| p.contains_key(name)) {
                return Err(Error::validation(format!(
                    "required property \"{name}\" is not declared in properties"
                )));
            }
        }
        let mut members: Vec<(String, bool)> = Vec::new();
        if let Some(props) = properties {
            for (key, sub) in props {
                let value =
                    self.visit(sub, &format!("{hint}_{}", sanitize_name(key)), depth + 1)?;
                let pair = Self::seq(&[
                    format!("\"\\\"{}\\\"\"", escape_ebnf_text(key)),
                    kv.clone(),
                    value,
                ]);
                members.push((pair, required.contains(&key.as_str())));
            }
        }

        let extra_pair = additional.map(|value| {
            let key = self.fresh_name(&format!("{hint}_key"));
            self.add_rule(&key, JSON_STRING_BODY);
            Self::seq(&[key, kv.clone(), value])
        });

        if members.is_empty() {
            let Some(extra) = extra_pair else {
                return Ok(self.empty_brackets("{", "}"));
            };
            // Free-form object, optionally count-bounded.
            let min_p = obj.get("minProperties").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let max_p = obj.get("maxProperties").and_then(|v| v.as_u64()).map(|m| m as usize);
            if max_p == Some(0) {
                return Ok(self.empty_brackets("{", "}"));
            }
            let more = self.fresh_name(&format!("{hint}_more"));
            self.add_rule(&more, &Self::seq(&[sep, extra.clone()]));
            let rest = format!(
                "{more}{}",
                repetition_suffix(min_p.saturating_sub(1), max_p.map(|m| m - 1))
            );
            let filled = Self::seq(&[
                "\"{\"".to_string(),
                open,
                extra,
                rest,
                close,
                "\"}\"".to_string(),
            ]);
            if min_p == 0 {
                let empty = self.empty_brackets("{", "}");
                return Ok(format!("({empty} | {filled})"));
            }
            return Ok(filled);
        }

        // Tail after a known leading member: every later member needs the
        // separator in front, optional ones wrapped in `(…)?`, trailing
        // additional pairs repeated freely.
        let extra_tail = match &extra_pair {
            Some(extra) => {
                let more = self.fresh_name(&format!("{hint}_more"));
                self.add_rule(&more, &Self::seq(&[sep.clone(), extra.clone()]));
                format!("{more}*")
            }
            None => String::new(),
        };
        let tail_from = |start: usize| -> String {
            let mut tail = extra_tail.clone();
            for (pair, is_required) in members[start..].iter().rev() {
                let step = Self::seq(&[sep.clone(), pair.clone()]);
                tail = if *is_required {
                    Self::seq(&[step, tail])
                } else if tail.is_empty() {
                    format!("({step})?")
                } else {
                    Self::seq(&[format!("({step})?"), tail])
                };
            }
            tail
        };

        // Alternatives by which member appears first: every optional
        // member up to and including the first required one may lead;
        // skipping all members is possible only when none is required.
        let mut alts: Vec<String> = Vec::new();
        for (i, (pair, is_required)) in members.iter().enumerate() {
            alts.push(Self::seq(&[pair.clone(), tail_from(i + 1)]));
            if *is_required {
                break;
            }
        }
        let has_required = members.iter().any(|(_, r)| *r);
        if !has_required {
            if let Some(extra) = &extra_pair {
                // No required member: additional pairs alone may fill the
                // object.
                alts.push(Self::seq(&[extra.clone(), extra_tail.clone()]));
            }
        }
        let body_choice = if alts.len() == 1 {
            alts.pop().unwrap()
        } else {
            format!("({})", alts.join(" | "))
        };
        let filled = Self::seq(&[
            "\"{\"".to_string(),
            open,
            body_choice,
            close,
            "\"}\"".to_string(),
        ]);
        if has_required {
            Ok(filled)
        } else {
            let empty = self.empty_brackets("{", "}");
            Ok(format!("({empty} | {filled})"))
        }
    }

    /// `{}` / `[]`, with interior whitespace when flexible.
    fn empty_brackets(&self, open: &str, close: &str) -> String {
        if self.options.any_whitespace {
            format!("\"{open}\" ws \"{close}\"")
        } else {
            format!("\"{open}\" \"{close}\"")
        }
    }

    /// Value grammar for additional properties with no declared schema.
    fn any_property_value(&mut self, hint: &str, depth: usize) -> Result<String> {
        self.any_json(hint, depth + 1)
    }

    /// The permissive any-JSON sub-grammar, emitted once per hint.
    fn any_json(&mut self, hint: &str, depth: usize) -> Result<String> {
        // Under indenting the nesting depth changes the text, so the rule
        // can only be shared per depth.
        let name = if self.options.indent.is_some() {
            format!("{}_any_d{}", sanitize_name(hint), depth)
        } else {
            format!("{}_any", sanitize_name(hint))
        };
        if self.rules.iter().any(|(n, _)| n == &name) {
            return Ok(name.clone());
        }

        let string_rule = format!("{name}_string");
        let number_rule = format!("{name}_number");
        self.add_rule(&string_rule, JSON_STRING_BODY);
        self.add_rule(&number_rule, UNBOUNDED_NUMBER);

        let open = self.open_pad(depth);
        let sep = self.member_sep(depth);
        let close = self.close_pad(depth);
        let kv = self.pair_sep();

        let pair = Self::seq(&[string_rule.clone(), kv, name.clone()]);
        let obj_more = format!("{name}_member_more");
        self.add_rule(&obj_more, &Self::seq(&[sep.clone(), pair.clone()]));
        let obj_filled = Self::seq(&[
            "\"{\"".to_string(),
            open.clone(),
            pair,
            format!("{obj_more}*"),
            close.clone(),
            "\"}\"".to_string(),
        ]);
        let arr_more = format!("{name}_elem_more");
        self.add_rule(&arr_more, &Self::seq(&[sep, name.clone()]));
        let arr_filled = Self::seq(&[
            "\"[\"".to_string(),
            open,
            name.clone(),
            format!("{arr_more}*"),
            close,
            "\"]\"".to_string(),
        ]);

        let body = format!(
            "({} | {} | {} | {} | {} | {} | \"true\" | \"false\" | \"null\")",
            self.empty_brackets("{", "}"),
            obj_filled,
            self.empty_brackets("[", "]"),
            arr_filled,
            string_rule,
            number_rule,
        );
        self.add_rule(&name, &body);
        Ok(name)
    }
}

// ── Shared grammar text ──────────────────────────────────────────────

const JSON_CHAR_BODY: &str = "[^\"\\\\] | \"\\\\\" (\"\\\"\" | \"\\\\\" | \"/\" | \"b\" | \"f\" | \"n\" | \"r\" | \"t\" | \"u\" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])";

const JSON_STRING_BODY: &str = "\"\\\"\" ([^\"\\\\] | \"\\\\\" (\"\\\"\" | \"\\\\\" | \"/\" | \"b\" | \"f\" | \"n\" | \"r\" | \"t\" | \"u\" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]))* \"\\\"\"";

const UNBOUNDED_INTEGER: &str = "\"-\"? (\"0\" | [1-9] [0-9]*)";

const UNBOUNDED_NUMBER: &str =
    "\"-\"? (\"0\" | [1-9] [0-9]*) (\".\" [0-9]+)? ([eE] [+-]? [0-9]+)?";

// ── Literals and helpers ─────────────────────────────────────────────

/// Quote arbitrary text as a single EBNF string literal.
fn ebnf_literal(text: &str) -> String {
    format!("\"{}\"", escape_ebnf_text(text))
}

fn escape_ebnf_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// A JSON value rendered as the literal text the model must emit.
fn json_literal(value: &Value) -> String {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    ebnf_literal(&text)
}

fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, 'r');
    }
    out
}

/// EBNF repetition suffix for `{min, max}` counts; empty means exactly
/// zero repetitions allowed; callers special-case that.
fn repetition_suffix(min: usize, max: Option<usize>) -> String {
    match (min, max) {
        (0, None) => "*".to_string(),
        (0, Some(0)) => "{0}".to_string(),
        (1, None) => "+".to_string(),
        (0, Some(1)) => "?".to_string(),
        (min, None) => format!("{{{min},}}"),
        (min, Some(max)) if min == max => format!("{{{min}}}"),
        (min, Some(max)) => format!("{{{min},{max}}}"),
    }
}

// ── Integer range regexes ────────────────────────────────────────────

/// Regex matching exactly the integers in `[min, max]` (either bound may
/// be open), built digit by digit.
fn integer_range_regex(min: Option<i64>, max: Option<i64>) -> String {
    match (min, max) {
        (None, None) => "-?(?:0|[1-9][0-9]*)".to_string(),
        (Some(lo), Some(hi)) if lo == hi => format!("{lo}"),
        (Some(lo), Some(hi)) => {
            if lo >= 0 {
                positive_range(lo as u64, hi as u64)
            } else if hi < 0 {
                format!("-{}", positive_range(hi.unsigned_abs(), lo.unsigned_abs()))
            } else {
                let neg = positive_range(1, lo.unsigned_abs());
                let pos = positive_range(0, hi as u64);
                format!("(?:-{neg}|{pos})")
            }
        }
        (Some(lo), None) => {
            if lo > 0 {
                positive_unbounded(lo as u64)
            } else if lo == 0 {
                "(?:0|[1-9][0-9]*)".to_string()
            } else {
                let neg = positive_range(1, lo.unsigned_abs());
                format!("(?:-{neg}|0|[1-9][0-9]*)")
            }
        }
        (None, Some(hi)) => {
            if hi < 0 {
                format!("-{}", positive_unbounded(hi.unsigned_abs()))
            } else {
                let pos = positive_range(0, hi as u64);
                format!("(?:-[1-9][0-9]*|{pos})")
            }
        }
    }
}

fn positive_range(min: u64, max: u64) -> String {
    debug_assert!(min <= max);
    if min == max {
        return format!("{min}");
    }
    let min_s = min.to_string();
    let max_s = max.to_string();
    if min_s.len() == max_s.len() {
        return digits_range(min_s.as_bytes(), max_s.as_bytes());
    }

    let mut parts = Vec::new();
    // Finish out the shortest digit count.
    let shortest_max = 10u64.pow(min_s.len() as u32) - 1;
    parts.push(positive_range(min, shortest_max));
    // Whole intermediate digit counts.
    for digits in (min_s.len() + 1)..max_s.len() {
        parts.push(format!("[1-9][0-9]{{{}}}", digits - 1));
    }
    // The longest digit count up to max.
    let longest_min = 10u64.pow((max_s.len() - 1) as u32);
    parts.push(positive_range(longest_min, max));
    format!("(?:{})", parts.join("|"))
}

fn positive_unbounded(min: u64) -> String {
    if min <= 1 {
        return if min == 0 {
            "(?:0|[1-9][0-9]*)".to_string()
        } else {
            "[1-9][0-9]*".to_string()
        };
    }
    let min_s = min.to_string();
    let same_len_max = 10u64.pow(min_s.len() as u32) - 1;
    format!(
        "(?:{}|[1-9][0-9]{{{},}})",
        positive_range(min, same_len_max),
        min_s.len()
    )
}

/// Same-length decimal range, recursing on the leading digit.
fn digits_range(min: &[u8], max: &[u8]) -> String {
    debug_assert_eq!(min.len(), max.len());
    let n = min.len();
    if n == 1 {
        return digit_span(min[0] - b'0', max[0] - b'0');
    }
    if min[0] == max[0] {
        return format!("{}{}", min[0] as char, digits_range(&min[1..], &max[1..]));
    }

    let mut parts = Vec::new();
    let all_nines = vec![b'9'; n - 1];
    let all_zeros = vec![b'0'; n - 1];
    // min[0] with min's tail up to all nines.
    parts.push(format!(
        "{}{}",
        min[0] as char,
        digits_range(&min[1..], &all_nines)
    ));
    // Full middle span.
    if min[0] + 1 < max[0] {
        let span = digit_span(min[0] - b'0' + 1, max[0] - b'0' - 1);
        parts.push(format!("{span}[0-9]{{{}}}", n - 1));
    }
    // max[0] with all zeros up to max's tail.
    parts.push(format!(
        "{}{}",
        max[0] as char,
        digits_range(&all_zeros, &max[1..])
    ));
    format!("(?:{})", parts.join("|"))
}

fn digit_span(lo: u8, hi: u8) -> String {
    match hi - lo {
        0 => format!("{lo}"),
        1 => format!("[{lo}{hi}]"),
        _ => format!("[{lo}-{hi}]"),
    }
}

/// Known string formats as regexes (RFC 3339 and friends, simplified the
/// way validators commonly do).
fn format_regex(format: &str) -> Option<String> {
    match format {
        "date" => Some(r"\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01])".to_string()),
        "time" => Some(
            r"([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d+)?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)"
                .to_string(),
        ),
        "date-time" => Some(
            r"\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01])T([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d+)?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)"
                .to_string(),
        ),
        "email" => Some(
            r"[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*"
                .to_string(),
        ),
        "uuid" => Some(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}"
                .to_string(),
        ),
        "ipv4" => Some(
            r"((25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(25[0-5]|2[0-4]\d|[01]?\d\d?)".to_string(),
        ),
        "hostname" => Some(
            r"[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*"
                .to_string(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compact() -> JsonSchemaOptions {
        JsonSchemaOptions {
            any_whitespace: false,
            indent: None,
            separators: Some((",".into(), ":".into())),
            strict_mode: true,
        }
    }

    fn accepts(schema: &str, options: &JsonSchemaOptions, text: &str) -> bool {
        use crate::matcher::GrammarMatcher;
        use crate::tokenizer::TokenizerInfo;
        use std::sync::Arc;
        let g = json_schema_to_grammar(schema, options).unwrap();
        let tok = Arc::new(TokenizerInfo::from_raw(&["x"], vec![]));
        let mut m = GrammarMatcher::from_grammar(&g, tok, None, 8).unwrap();
        m.accept_string(text) && m.can_terminate()
    }

    #[test]
    fn test_scalar_types() {
        let opts = compact();
        assert!(accepts(r#"{"type":"boolean"}"#, &opts, "true"));
        assert!(accepts(r#"{"type":"null"}"#, &opts, "null"));
        assert!(accepts(r#"{"type":"integer"}"#, &opts, "-42"));
        assert!(!accepts(r#"{"type":"integer"}"#, &opts, "04"));
        assert!(accepts(r#"{"type":"number"}"#, &opts, "3.25e-2"));
        assert!(accepts(r#"{"type":"string"}"#, &opts, r#""hi there""#));
        assert!(!accepts(r#"{"type":"string"}"#, &opts, "hi"));
    }

    #[test]
    fn test_object_required_only() {
        let opts = compact();
        let schema = r#"{"type":"object","properties":{"x":{"type":"integer"}},"required":["x"],"additionalProperties":false}"#;
        assert!(accepts(schema, &opts, r#"{"x":1}"#));
        assert!(!accepts(schema, &opts, r#"{}"#));
        assert!(!accepts(schema, &opts, r#"{"x":1,"y":2}"#));
    }

    #[test]
    fn test_object_optional_member_combinations() {
        let opts = compact();
        let schema = r#"{"type":"object","properties":{"a":{"type":"integer"},"b":{"type":"integer"},"c":{"type":"integer"}},"required":["b"],"additionalProperties":false}"#;
        assert!(accepts(schema, &opts, r#"{"a":1,"b":2,"c":3}"#));
        assert!(accepts(schema, &opts, r#"{"b":2}"#));
        assert!(accepts(schema, &opts, r#"{"a":1,"b":2}"#));
        assert!(accepts(schema, &opts, r#"{"b":2,"c":3}"#));
        assert!(!accepts(schema, &opts, r#"{"a":1,"c":3}"#));
        assert!(!accepts(schema, &opts, r#"{"a":1,"b":2,}"#));
    }

    #[test]
    fn test_object_all_optional_allows_empty() {
        let opts = compact();
        let schema = r#"{"type":"object","properties":{"a":{"type":"integer"},"b":{"type":"boolean"}},"additionalProperties":false}"#;
        assert!(accepts(schema, &opts, r#"{}"#));
        assert!(accepts(schema, &opts, r#"{"a":7}"#));
        assert!(accepts(schema, &opts, r#"{"b":true}"#));
        assert!(accepts(schema, &opts, r#"{"a":7,"b":false}"#));
        assert!(!accepts(schema, &opts, r#"{"b":true,"a":7}"#));
    }

    #[test]
    fn test_array_bounds() {
        let opts = compact();
        let schema = r#"{"type":"array","items":{"type":"integer"},"minItems":1,"maxItems":3}"#;
        assert!(!accepts(schema, &opts, "[]"));
        assert!(accepts(schema, &opts, "[1]"));
        assert!(accepts(schema, &opts, "[1,2,3]"));
        assert!(!accepts(schema, &opts, "[1,2,3,4]"));
    }

    #[test]
    fn test_prefix_items() {
        let opts = compact();
        let schema = r#"{"type":"array","prefixItems":[{"type":"integer"},{"type":"boolean"}],"items":false}"#;
        assert!(accepts(schema, &opts, "[1,true]"));
        assert!(!accepts(schema, &opts, "[1]"));
        assert!(!accepts(schema, &opts, "[1,true,2]"));
    }

    #[test]
    fn test_enum_and_const() {
        let opts = compact();
        let schema = r#"{"enum":["red","green",7]}"#;
        assert!(accepts(schema, &opts, r#""red""#));
        assert!(accepts(schema, &opts, "7"));
        assert!(!accepts(schema, &opts, r#""blue""#));
        let schema = r#"{"const":{"k":true}}"#;
        assert!(accepts(schema, &opts, r#"{"k":true}"#));
    }

    #[test]
    fn test_integer_ranges() {
        let opts = compact();
        let schema = r#"{"type":"integer","minimum":5,"maximum":123}"#;
        for ok in ["5", "9", "10", "99", "100", "123"] {
            assert!(accepts(schema, &opts, ok), "{ok} should be accepted");
        }
        for bad in ["4", "124", "999", "-5", "05"] {
            assert!(!accepts(schema, &opts, bad), "{bad} should be rejected");
        }
        let schema = r#"{"type":"integer","minimum":-12,"maximum":7}"#;
        for ok in ["-12", "-1", "0", "7"] {
            assert!(accepts(schema, &opts, ok), "{ok} should be accepted");
        }
        for bad in ["-13", "8", "-0"] {
            assert!(!accepts(schema, &opts, bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_string_constraints() {
        let opts = compact();
        let schema = r#"{"type":"string","minLength":2,"maxLength":3}"#;
        assert!(!accepts(schema, &opts, r#""a""#));
        assert!(accepts(schema, &opts, r#""ab""#));
        assert!(accepts(schema, &opts, r#""abc""#));
        assert!(!accepts(schema, &opts, r#""abcd""#));
        let schema = r#"{"type":"string","pattern":"[a-c]+"}"#;
        assert!(accepts(schema, &opts, r#""abcba""#));
        assert!(!accepts(schema, &opts, r#""abd""#));
    }

    #[test]
    fn test_string_format() {
        let opts = compact();
        let schema = r#"{"type":"string","format":"uuid"}"#;
        assert!(accepts(
            schema,
            &opts,
            r#""123e4567-e89b-12d3-a456-426614174000""#
        ));
        assert!(!accepts(schema, &opts, r#""not-a-uuid""#));
    }

    #[test]
    fn test_refs_and_defs() {
        let opts = compact();
        let schema = r##"{"$defs":{"count":{"type":"integer"}},"type":"object","properties":{"n":{"$ref":"#/$defs/count"}},"required":["n"],"additionalProperties":false}"##;
        assert!(accepts(schema, &opts, r#"{"n":12}"#));
        assert!(!accepts(schema, &opts, r#"{"n":"12"}"#));
    }

    #[test]
    fn test_any_of() {
        let opts = compact();
        let schema = r#"{"anyOf":[{"type":"integer"},{"type":"boolean"}]}"#;
        assert!(accepts(schema, &opts, "4"));
        assert!(accepts(schema, &opts, "false"));
        assert!(!accepts(schema, &opts, r#""4""#));
    }

    #[test]
    fn test_any_whitespace_mode() {
        let opts = JsonSchemaOptions::default();
        let schema = r#"{"type":"object","properties":{"x":{"type":"integer"}},"required":["x"]}"#;
        assert!(accepts(schema, &opts, "{\"x\":1}"));
        assert!(accepts(schema, &opts, "{ \"x\" : 1 }"));
        assert!(accepts(schema, &opts, "{\n  \"x\"\t:\n1\n}"));
    }

    #[test]
    fn test_indent_mode_matches_pretty_dump() {
        let opts = JsonSchemaOptions {
            any_whitespace: false,
            indent: Some(2),
            separators: None,
            strict_mode: true,
        };
        let schema = r#"{"type":"object","properties":{"a":{"type":"integer"},"b":{"type":"array","items":{"type":"integer"}}},"required":["a","b"],"additionalProperties":false}"#;
        let pretty = "{\n  \"a\": 1,\n  \"b\": [\n    2,\n    3\n  ]\n}";
        assert!(accepts(schema, &opts, pretty));
        assert!(!accepts(schema, &opts, r#"{"a":1,"b":[2,3]}"#));
    }

    #[test]
    fn test_default_separators_single_line() {
        let opts = JsonSchemaOptions {
            any_whitespace: false,
            indent: None,
            separators: None,
            strict_mode: true,
        };
        let schema = r#"{"type":"object","properties":{"a":{"type":"integer"},"b":{"type":"integer"}},"required":["a","b"],"additionalProperties":false}"#;
        assert!(accepts(schema, &opts, r#"{"a": 1, "b": 2}"#));
        assert!(!accepts(schema, &opts, r#"{"a":1,"b":2}"#));
    }

    #[test]
    fn test_non_strict_allows_extra_properties() {
        let mut opts = compact();
        opts.strict_mode = false;
        let schema = r#"{"type":"object","properties":{"x":{"type":"integer"}},"required":["x"]}"#;
        assert!(accepts(schema, &opts, r#"{"x":1}"#));
        assert!(accepts(schema, &opts, r#"{"x":1,"extra":[null,{}]}"#));
    }

    #[test]
    fn test_schema_errors() {
        let opts = compact();
        assert!(json_schema_to_grammar("not json", &opts).is_err());
        assert!(json_schema_to_grammar("false", &opts).is_err());
        assert!(json_schema_to_grammar(
            r#"{"type":"integer","minimum":9,"maximum":3}"#,
            &opts
        )
        .is_err());
        assert!(json_schema_to_grammar(r#"{"enum":[]}"#, &opts).is_err());
    }

    #[test]
    fn test_integer_range_regex_shapes() {
        assert_eq!(integer_range_regex(None, None), "-?(?:0|[1-9][0-9]*)");
        assert_eq!(integer_range_regex(Some(7), Some(7)), "7");
        assert_eq!(integer_range_regex(Some(0), Some(9)), "[0-9]");
        let r = integer_range_regex(Some(-3), Some(12));
        assert!(r.contains("-"));
    }
}
