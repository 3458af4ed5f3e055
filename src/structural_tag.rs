//! Structural tags: composition of literal anchors, schema-typed bodies,
//! and wildcard text used to constrain tool-call syntax.
//!
//! Three stages:
//! 1. **Parse** the nested discriminated-union JSON into an arena IR
//!    (children referenced by index, no owning pointers). A node's type
//!    is explicit (`"type"`) or inferred by trial, `tag` first.
//! 2. **Analyze** top-down: stamp each node with `begin_deprived` /
//!    `end_deprived` (the bracketing literal is consumed elsewhere) and
//!    `detected_end_string` (the literal anchor that terminates a
//!    wildcard region).
//! 3. **Compile** to a grammar: trigger dispatch and wildcard exclusion
//!    rules come from the pattern trie; schema bodies embed compiled
//!    JSON-schema grammars.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::fsm::build::PatternTrie;
use crate::grammar::builder::GrammarBuilder;
use crate::grammar::{ExprId, Grammar, RuleId};
use crate::json_schema::{json_schema_to_ebnf, JsonSchemaOptions};

const MAX_FORMAT_DEPTH: usize = 64;

/// Index of a format node in its [`StructuralTag`] arena.
pub type FormatId = usize;

/// One node of the structural-tag format tree.
#[derive(Debug, Clone)]
pub enum Format {
    /// Fixed text.
    Literal { text: String },
    /// A JSON-schema-typed body.
    JsonSchema { schema: Value },
    /// Free text (bounded by the detected end anchor, when any).
    WildcardText,
    /// Ordered composition.
    Sequence { elements: Vec<FormatId> },
    /// `begin` literal, inner content, `end` literal.
    Tag {
        begin: String,
        content: FormatId,
        end: String,
    },
    /// Free text interleaved with tags, each fired by a trigger literal.
    TriggeredTags {
        triggers: Vec<String>,
        tags: Vec<FormatId>,
        at_least_one: bool,
        stop_after_first: bool,
    },
    /// A homogeneous tag list joined by a separator.
    TagsWithSeparator {
        tags: Vec<FormatId>,
        separator: String,
        at_least_one: bool,
        stop_after_first: bool,
    },
}

/// Analyzer output per node.
#[derive(Debug, Clone, Default)]
struct NodeInfo {
    /// The begin literal (or a prefix of it) is consumed by an outer
    /// trigger dispatch.
    begin_deprived: bool,
    /// How many bytes of `begin` the outer dispatch consumes.
    begin_consumed: usize,
    /// The end literal is consumed by the inner wildcard.
    end_deprived: bool,
    /// The outer literal anchor that terminates this context.
    detected_end_string: Option<String>,
}

/// Parsed structural tag: a format arena plus per-node analysis.
#[derive(Debug)]
pub struct StructuralTag {
    nodes: Vec<Format>,
    info: Vec<NodeInfo>,
    root: FormatId,
}

/// Parse and compile in one step.
pub fn structural_tag_to_grammar(json: &str) -> Result<Grammar> {
    StructuralTag::from_json(json)?.to_grammar()
}

impl StructuralTag {
    /// Parse the top-level `{"type": "structural_tag", "format": …}`
    /// document.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| Error::parse(format!("invalid structural tag JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| Error::parse("structural tag must be a JSON object"))?;
        match obj.get("type").and_then(|v| v.as_str()) {
            Some("structural_tag") => {}
            Some(other) => {
                return Err(Error::parse(format!(
                    "expected type \"structural_tag\", found \"{other}\""
                )));
            }
            None => return Err(Error::parse("missing \"type\": \"structural_tag\"")),
        }
        let format = obj
            .get("format")
            .ok_or_else(|| Error::parse("missing \"format\" field"))?;

        let mut parser = IrParser { nodes: Vec::new() };
        let root = parser.parse_node(format, "format", 0)?;
        let mut tag = StructuralTag {
            info: vec![NodeInfo::default(); parser.nodes.len()],
            nodes: parser.nodes,
            root,
        };
        tag.analyze(tag.root, None)?;
        Ok(tag)
    }

    pub fn format(&self, id: FormatId) -> &Format {
        &self.nodes[id]
    }

    pub fn root(&self) -> FormatId {
        self.root
    }

    /// Compile into a grammar rooted at `root`.
    pub fn to_grammar(&self) -> Result<Grammar> {
        let mut compiler = TagCompiler {
            tag: self,
            builder: GrammarBuilder::new(),
            counter: 0,
        };
        let root_rule = compiler.builder.add_rule("root");
        let body = compiler.compile_node(self.root)?;
        compiler.builder.set_rule_body(root_rule, body);
        compiler.builder.build("root")
    }

    // ── Analysis ─────────────────────────────────────────────────────

    /// Walk top-down carrying the current terminating anchor.
    fn analyze(&mut self, id: FormatId, inherited_end: Option<String>) -> Result<()> {
        self.info[id].detected_end_string = inherited_end.clone();
        match self.nodes[id].clone() {
            Format::Literal { .. } | Format::JsonSchema { .. } | Format::WildcardText => Ok(()),
            Format::Sequence { elements } => {
                for (i, &elem) in elements.iter().enumerate() {
                    let next_anchor = match elements.get(i + 1) {
                        Some(&next) => self.leading_literal(next),
                        None => inherited_end.clone(),
                    };
                    self.analyze(elem, next_anchor)?;
                }
                Ok(())
            }
            Format::Tag { content, end, .. } => {
                self.analyze(content, Some(end.clone()))?;
                // A wildcard body swallows the end anchor itself.
                if matches!(self.nodes[content], Format::WildcardText) {
                    self.info[content].end_deprived = false;
                    self.info[id].end_deprived = true;
                }
                Ok(())
            }
            Format::TriggeredTags { triggers, tags, .. } => {
                for &tag_id in &tags {
                    let Format::Tag { begin, .. } = &self.nodes[tag_id] else {
                        return Err(Error::validation(
                            "triggered_tags entries must be tag formats",
                        ));
                    };
                    let trigger = triggers
                        .iter()
                        .find(|t| begin.starts_with(t.as_str()))
                        .ok_or_else(|| {
                            Error::validation(format!(
                                "tag begin \"{begin}\" extends none of the triggers"
                            ))
                        })?;
                    self.info[tag_id].begin_deprived = true;
                    self.info[tag_id].begin_consumed = trigger.len();
                    self.analyze(tag_id, inherited_end.clone())?;
                }
                Ok(())
            }
            Format::TagsWithSeparator { tags, .. } => {
                for &tag_id in &tags {
                    if !matches!(self.nodes[tag_id], Format::Tag { .. }) {
                        return Err(Error::validation(
                            "tags_with_separator entries must be tag formats",
                        ));
                    }
                    self.analyze(tag_id, inherited_end.clone())?;
                }
                Ok(())
            }
        }
    }

    /// The fixed text a format is guaranteed to start with, if any.
    fn leading_literal(&self, id: FormatId) -> Option<String> {
        match &self.nodes[id] {
            Format::Literal { text } if !text.is_empty() => Some(text.clone()),
            Format::Tag { begin, .. } if !begin.is_empty() => Some(begin.clone()),
            Format::Sequence { elements } => {
                elements.first().and_then(|&e| self.leading_literal(e))
            }
            _ => None,
        }
    }
}

// ─── IR parsing ──────────────────────────────────────────────────────

struct IrParser {
    nodes: Vec<Format>,
}

impl IrParser {
    fn parse_node(&mut self, value: &Value, path: &str, depth: usize) -> Result<FormatId> {
        if depth > MAX_FORMAT_DEPTH {
            return Err(Error::parse(format!(
                "format nesting exceeds {MAX_FORMAT_DEPTH} levels at {path}"
            )));
        }
        let obj = value
            .as_object()
            .ok_or_else(|| Error::parse(format!("format at {path} must be an object")))?;

        let ty = match obj.get("type").and_then(|v| v.as_str()) {
            Some(ty) => ty.to_string(),
            None => infer_type(obj)
                .ok_or_else(|| {
                    Error::parse(format!("cannot infer the format type at {path}"))
                })?
                .to_string(),
        };

        let node = match ty.as_str() {
            "literal" => Format::Literal {
                text: require_str(obj, "text", path)?,
            },
            "json_schema" => Format::JsonSchema {
                schema: obj
                    .get("json_schema")
                    .cloned()
                    .ok_or_else(|| {
                        Error::parse(format!("missing \"json_schema\" at {path}"))
                    })?,
            },
            "wildcard_text" => Format::WildcardText,
            "sequence" => {
                let elements = require_array(obj, "elements", path)?;
                let ids = elements
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        self.parse_node(v, &format!("{path}.elements[{i}]"), depth + 1)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Format::Sequence { elements: ids }
            }
            "tag" => {
                let begin = require_str(obj, "begin", path)?;
                let end = require_str(obj, "end", path)?;
                let content_val = obj
                    .get("content")
                    .ok_or_else(|| Error::parse(format!("missing \"content\" at {path}")))?;
                let content =
                    self.parse_node(content_val, &format!("{path}.content"), depth + 1)?;
                Format::Tag {
                    begin,
                    content,
                    end,
                }
            }
            "triggered_tags" => {
                let triggers = require_array(obj, "triggers", path)?
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            Error::parse(format!("triggers at {path} must be strings"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let tags = self.parse_tag_list(obj, path, depth)?;
                Format::TriggeredTags {
                    triggers,
                    tags,
                    at_least_one: flag(obj, "at_least_one"),
                    stop_after_first: flag(obj, "stop_after_first"),
                }
            }
            "tags_with_separator" => {
                let tags = self.parse_tag_list(obj, path, depth)?;
                Format::TagsWithSeparator {
                    tags,
                    separator: require_str(obj, "separator", path)?,
                    at_least_one: flag(obj, "at_least_one"),
                    stop_after_first: flag(obj, "stop_after_first"),
                }
            }
            other => {
                return Err(Error::parse(format!(
                    "unknown format type \"{other}\" at {path}"
                )));
            }
        };
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }

    fn parse_tag_list(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
        depth: usize,
    ) -> Result<Vec<FormatId>> {
        require_array(obj, "tags", path)?
            .iter()
            .enumerate()
            .map(|(i, v)| self.parse_node(v, &format!("{path}.tags[{i}]"), depth + 1))
            .collect()
    }
}

/// Inference by trial, `tag` taking priority.
fn infer_type(obj: &serde_json::Map<String, Value>) -> Option<&'static str> {
    if obj.contains_key("begin") && obj.contains_key("end") {
        Some("tag")
    } else if obj.contains_key("triggers") {
        Some("triggered_tags")
    } else if obj.contains_key("separator") && obj.contains_key("tags") {
        Some("tags_with_separator")
    } else if obj.contains_key("elements") {
        Some("sequence")
    } else if obj.contains_key("json_schema") {
        Some("json_schema")
    } else if obj.contains_key("text") {
        Some("literal")
    } else if obj.is_empty() {
        Some("wildcard_text")
    } else {
        None
    }
}

fn require_str(obj: &serde_json::Map<String, Value>, key: &str, path: &str) -> Result<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::parse(format!("missing string field \"{key}\" at {path}")))
}

fn require_array<'a>(
    obj: &'a serde_json::Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a Vec<Value>> {
    obj.get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::parse(format!("missing array field \"{key}\" at {path}")))
}

fn flag(obj: &serde_json::Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

// ─── Compilation ─────────────────────────────────────────────────────

struct TagCompiler<'a> {
    tag: &'a StructuralTag,
    builder: GrammarBuilder,
    counter: usize,
}

impl TagCompiler<'_> {
    fn fresh(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_{}", prefix, self.counter)
    }

    fn compile_node(&mut self, id: FormatId) -> Result<ExprId> {
        match self.tag.format(id).clone() {
            Format::Literal { text } => Ok(self.literal(&text)),
            Format::JsonSchema { schema } => {
                let expr = self.embed_schema(&schema)?;
                Ok(expr)
            }
            Format::WildcardText => {
                let end = self.tag.info[id].detected_end_string.clone();
                match end {
                    Some(end) if !end.is_empty() => {
                        let consumes_end = self
                            .tag
                            .info
                            .iter()
                            .zip(&self.tag.nodes)
                            .any(|(info, node)| {
                                info.end_deprived
                                    && matches!(node, Format::Tag { content, .. } if *content == id)
                            });
                        let text = self.free_text_rule(&[end.as_str()])?;
                        let text_ref = self.builder.add_rule_ref(text);
                        if consumes_end {
                            let end_lit = self.literal(&end);
                            Ok(self.builder.add_sequence(vec![text_ref, end_lit]))
                        } else {
                            Ok(text_ref)
                        }
                    }
                    _ => {
                        let text = self.any_text_rule();
                        Ok(self.builder.add_rule_ref(text))
                    }
                }
            }
            Format::Sequence { elements } => {
                let exprs = elements
                    .iter()
                    .map(|&e| self.compile_node(e))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.builder.add_sequence(exprs))
            }
            Format::Tag {
                begin,
                content,
                end,
            } => {
                let info = self.tag.info[id].clone();
                let mut parts = Vec::new();
                let effective_begin = if info.begin_deprived {
                    &begin[info.begin_consumed.min(begin.len())..]
                } else {
                    begin.as_str()
                };
                if !effective_begin.is_empty() {
                    parts.push(self.literal(effective_begin));
                }
                parts.push(self.compile_node(content)?);
                if !info.end_deprived && !end.is_empty() {
                    parts.push(self.literal(&end));
                }
                Ok(self.builder.add_sequence(parts))
            }
            Format::TriggeredTags {
                triggers,
                tags,
                at_least_one,
                stop_after_first,
            } => self.compile_triggered(&triggers, &tags, at_least_one, stop_after_first),
            Format::TagsWithSeparator {
                tags,
                separator,
                at_least_one,
                stop_after_first,
            } => self.compile_separated(&tags, &separator, at_least_one, stop_after_first),
        }
    }

    fn literal(&mut self, text: &str) -> ExprId {
        if text.is_empty() {
            self.builder.add_empty_string()
        } else {
            self.builder.add_byte_string(text.as_bytes())
        }
    }

    /// Compile a schema body through the JSON-schema front end and embed
    /// its grammar under a prefixed namespace.
    fn embed_schema(&mut self, schema: &Value) -> Result<ExprId> {
        let ebnf = json_schema_to_ebnf(schema, &JsonSchemaOptions::default())?;
        let grammar = Grammar::from_ebnf(&ebnf, "root")?;
        let prefix = self.fresh("schema");
        let root = self.builder.import(&grammar, &prefix);
        Ok(self.builder.add_rule_ref(root))
    }

    fn compile_triggered(
        &mut self,
        triggers: &[String],
        tags: &[FormatId],
        at_least_one: bool,
        stop_after_first: bool,
    ) -> Result<ExprId> {
        if triggers.is_empty() || tags.is_empty() {
            return Err(Error::validation(
                "triggered_tags needs at least one trigger and one tag",
            ));
        }
        let trigger_strs: Vec<&str> = triggers.iter().map(String::as_str).collect();
        // Prefix-colliding triggers would make dispatch ambiguous; the
        // overlap-rejecting trie build is exactly that check.
        PatternTrie::build(&trigger_strs, true).map_err(|_| {
            Error::validation("triggers must be non-empty and pairwise prefix-free")
        })?;

        // Free text: anything that does not contain a trigger.
        let text_rule = self.free_text_rule(&trigger_strs)?;

        // Dispatch: trigger literal, then one of its tags (begin already
        // stripped of the trigger by the analyzer).
        let mut dispatch_alts = Vec::new();
        for trigger in triggers {
            let mut arms = Vec::new();
            for &tag_id in tags {
                let Format::Tag { begin, .. } = self.tag.format(tag_id) else {
                    unreachable!("validated during analysis");
                };
                if begin.starts_with(trigger.as_str())
                    && self.tag.info[tag_id].begin_consumed == trigger.len()
                {
                    arms.push(self.compile_node(tag_id)?);
                }
            }
            if arms.is_empty() {
                continue;
            }
            let trigger_lit = self.literal(trigger);
            let arm_choice = if arms.len() == 1 {
                arms.pop().unwrap()
            } else {
                self.builder.add_choices(arms)
            };
            dispatch_alts.push(
                self.builder.add_sequence(vec![trigger_lit, arm_choice]),
            );
        }
        if dispatch_alts.is_empty() {
            return Err(Error::validation("no trigger matches any tag"));
        }
        let dispatch_name = self.fresh("dispatch");
        let dispatch_rule = self.builder.add_rule(&dispatch_name);
        let dispatch_body = self.builder.add_choices(dispatch_alts);
        self.builder.set_rule_body(dispatch_rule, dispatch_body);

        let text_ref = self.builder.add_rule_ref(text_rule);
        let expr = match (at_least_one, stop_after_first) {
            (_, true) => {
                // text dispatch, optionally skippable entirely.
                let dispatch_ref = self.builder.add_rule_ref(dispatch_rule);
                let one = self.builder.add_sequence(vec![text_ref, dispatch_ref]);
                if at_least_one {
                    one
                } else {
                    let opt = self.builder.add_repeat(dispatch_rule, 0, Some(1));
                    self.builder.add_sequence(vec![text_ref, opt])
                }
            }
            (alo, false) => {
                // text (dispatch text)*, or + when one tag is required.
                let round_name = self.fresh("round");
                let round_rule = self.builder.add_rule(&round_name);
                let dispatch_ref = self.builder.add_rule_ref(dispatch_rule);
                let inner_text_ref = self.builder.add_rule_ref(text_rule);
                let round_body = self
                    .builder
                    .add_sequence(vec![dispatch_ref, inner_text_ref]);
                self.builder.set_rule_body(round_rule, round_body);
                let min = if alo { 1 } else { 0 };
                let rounds = self.builder.add_repeat(round_rule, min, None);
                self.builder.add_sequence(vec![text_ref, rounds])
            }
        };
        Ok(expr)
    }

    fn compile_separated(
        &mut self,
        tags: &[FormatId],
        separator: &str,
        at_least_one: bool,
        stop_after_first: bool,
    ) -> Result<ExprId> {
        if tags.is_empty() {
            return Err(Error::validation("tags_with_separator needs at least one tag"));
        }
        if separator.is_empty() {
            return Err(Error::validation("separator must not be empty"));
        }
        let arms = tags
            .iter()
            .map(|&t| self.compile_node(t))
            .collect::<Result<Vec<_>>>()?;

        let tag_name = self.fresh("tag");
        let tag_rule = self.builder.add_rule(&tag_name);
        let tag_body = self.builder.add_choices(arms);
        self.builder.set_rule_body(tag_rule, tag_body);
        let tag_ref = self.builder.add_rule_ref(tag_rule);

        if stop_after_first {
            return Ok(if at_least_one {
                tag_ref
            } else {
                let empty = self.builder.add_empty_string();
                self.builder.add_choices(vec![empty, tag_ref])
            });
        }

        let more_name = self.fresh("more");
        let more_rule = self.builder.add_rule(&more_name);
        let sep_lit = self.literal(separator);
        let inner_tag_ref = self.builder.add_rule_ref(tag_rule);
        let more_body = self.builder.add_sequence(vec![sep_lit, inner_tag_ref]);
        self.builder.set_rule_body(more_rule, more_body);
        let rest = self.builder.add_repeat(more_rule, 0, None);
        let list = self.builder.add_sequence(vec![tag_ref, rest]);
        if at_least_one {
            Ok(list)
        } else {
            let empty = self.builder.add_empty_string();
            Ok(self.builder.add_choices(vec![empty, list]))
        }
    }

    /// Rule accepting any text (all codepoints, any length).
    fn any_text_rule(&mut self) -> RuleId {
        let name = self.fresh("freetext");
        let rule = self.builder.add_rule(&name);
        let body = self.builder.add_character_class_star(true, Vec::new());
        self.builder.set_rule_body(rule, body);
        rule
    }

    /// Rules accepting exactly the strings that contain none of
    /// `patterns`, generated from the pattern trie: one nullable rule per
    /// live trie state, transitions grouped into character classes, all
    /// other characters falling back to the trie root.
    fn free_text_rule(&mut self, patterns: &[&str]) -> Result<RuleId> {
        let trie = PatternTrie::build(patterns, false)?;
        let prefix = self.fresh("text");
        let alphabet = trie.alphabet();

        // One rule per non-matching state.
        let mut state_rules: Vec<Option<RuleId>> = vec![None; trie.num_nodes()];
        for state in 0..trie.num_nodes() as u32 {
            if !trie.is_matching(state) {
                let name = format!("{prefix}_s{state}");
                state_rules[state as usize] = Some(self.builder.add_rule(&name));
            }
        }

        for state in 0..trie.num_nodes() as u32 {
            let Some(rule) = state_rules[state as usize] else {
                continue;
            };
            let mut alts = vec![self.builder.add_empty_string()];

            // Group the interesting characters by target state.
            let mut by_target: Vec<(u32, Vec<u32>)> = Vec::new();
            for &c in &alphabet {
                let target = trie.goto(state, c);
                if trie.is_matching(target) {
                    continue; // would complete a pattern
                }
                match by_target.iter_mut().find(|(t, _)| *t == target) {
                    Some((_, chars)) => chars.push(c as u32),
                    None => by_target.push((target, vec![c as u32])),
                }
            }
            for (target, chars) in by_target {
                let class = self.builder.add_character_class(false, to_ranges(&chars));
                let next = self
                    .builder
                    .add_rule_ref(state_rules[target as usize].expect("live target"));
                alts.push(self.builder.add_sequence(vec![class, next]));
            }

            // Everything outside the trigger alphabet resets to the root.
            let other_ranges: Vec<(u32, u32)> =
                alphabet.iter().map(|&c| (c as u32, c as u32)).collect();
            let other = self.builder.add_character_class(true, other_ranges);
            let root_ref = self
                .builder
                .add_rule_ref(state_rules[0].expect("trie root never matches"));
            alts.push(self.builder.add_sequence(vec![other, root_ref]));

            let body = self.builder.add_choices(alts);
            self.builder.set_rule_body(rule, body);
        }

        Ok(state_rules[0].expect("trie root never matches"))
    }
}

/// Sorted codepoints → merged inclusive ranges.
fn to_ranges(chars: &[u32]) -> Vec<(u32, u32)> {
    let mut sorted = chars.to_vec();
    sorted.sort_unstable();
    let mut out: Vec<(u32, u32)> = Vec::new();
    for c in sorted {
        match out.last_mut() {
            Some(last) if c == last.1 + 1 => last.1 = c,
            Some(last) if c <= last.1 => {}
            _ => out.push((c, c)),
        }
    }
    out
}
