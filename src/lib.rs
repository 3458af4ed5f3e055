//! Grammar-constrained decoding for language models.
//!
//! `tokengate` compiles a formal language (an EBNF grammar, a JSON
//! schema, a regular expression, or a structural tag) against a
//! tokenizer vocabulary, and drives a per-request matcher that computes,
//! for every decoding step, the bitmask of tokens that can legally come
//! next. Rollback, termination detection, and jump-forward prediction
//! are part of the matcher surface.
//!
//! # Flow
//!
//! 1. Normalize the vocabulary into a [`TokenizerInfo`].
//! 2. Compile a grammar (directly, or through the memoizing
//!    [`GrammarCompiler`]) into a shared [`CompiledGrammar`].
//! 3. Per request, create a [`GrammarMatcher`] and loop:
//!    `fill_next_token_bitmask` → apply to logits → sample →
//!    `accept_token`.
//!
//! ```
//! use std::sync::Arc;
//! use tokengate::{bitmask, Grammar, GrammarMatcher, TokenizerInfo};
//!
//! let grammar = Grammar::from_ebnf(r#"root ::= "yes" | "no""#, "root").unwrap();
//! let tokenizer = Arc::new(TokenizerInfo::from_raw(&["yes", "no", "maybe"], vec![]));
//! let mut matcher = GrammarMatcher::from_grammar(&grammar, tokenizer, None, 16).unwrap();
//!
//! let mut mask = vec![0u32; bitmask::bitmask_size(3)];
//! assert!(matcher.fill_next_token_bitmask(&mut mask));
//! assert!(bitmask::get_bit(&mask, 0));  // "yes"
//! assert!(bitmask::get_bit(&mask, 1));  // "no"
//! assert!(!bitmask::get_bit(&mask, 2)); // "maybe"
//!
//! assert!(matcher.accept_token(0).unwrap());
//! assert!(matcher.can_terminate());
//! ```
//!
//! [`CompiledGrammar`] values are immutable and shared across matchers;
//! matchers are single-threaded and independent of each other.

pub mod bitmask;
pub mod cache;
pub mod compiled_grammar;
pub mod error;
pub mod fsm;
pub mod grammar;
pub mod json_schema;
pub mod matcher;
pub mod regex;
pub mod structural_tag;
pub mod tokenizer;

pub use cache::{CompilerConfig, GrammarCompiler};
pub use compiled_grammar::{CompileOptions, CompiledGrammar};
pub use error::{Error, Result};
pub use grammar::Grammar;
pub use json_schema::{json_schema_to_grammar, JsonSchemaOptions};
pub use matcher::GrammarMatcher;
pub use regex::{regex_to_ebnf, regex_to_grammar};
pub use structural_tag::{structural_tag_to_grammar, Format, StructuralTag};
pub use tokenizer::{TokenizerInfo, VocabType};
