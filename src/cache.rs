//! Compiler cache: one instance per vocabulary, memoizing compiled
//! grammars by source.
//!
//! Keys combine the source kind, the source text, and its option set; the
//! vocabulary half of the key is the cache instance itself. Each key owns
//! a slot whose lock is held for the duration of its first compile, so
//! concurrent requests for the same missing key wait and share the
//! result, so at most one compile ever runs per key. A failed compile
//! leaves no entry behind. Entries are never invalidated implicitly;
//! `clear` drops everything.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use rustc_hash::FxBuildHasher;

use crate::compiled_grammar::{CompileOptions, CompiledGrammar};
use crate::error::Result;
use crate::grammar::Grammar;
use crate::json_schema::{json_schema_to_grammar, JsonSchemaOptions};
use crate::regex::regex_to_grammar;
use crate::structural_tag::structural_tag_to_grammar;
use crate::tokenizer::TokenizerInfo;

/// Cache-wide knobs.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub compile: CompileOptions,
    /// Upper bound on compilations running at once across keys.
    pub max_concurrent_compiles: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            compile: CompileOptions::default(),
            max_concurrent_compiles: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    BuiltinJson,
    Ebnf { source: String, root: String },
    JsonSchema { schema: String, options: JsonSchemaOptions },
    Regex { pattern: String },
    StructuralTag { source: String },
}

struct Slot {
    ready: Mutex<Option<Arc<CompiledGrammar>>>,
}

/// Bounded admission for concurrent compiles.
struct CompileGate {
    running: Mutex<usize>,
    freed: Condvar,
    limit: usize,
}

impl CompileGate {
    fn acquire(&self) -> GatePass<'_> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        while *running >= self.limit {
            running = self.freed.wait(running).unwrap_or_else(|e| e.into_inner());
        }
        *running += 1;
        GatePass { gate: self }
    }
}

struct GatePass<'a> {
    gate: &'a CompileGate,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut running = self
            .gate
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *running -= 1;
        self.gate.freed.notify_one();
    }
}

/// Per-vocabulary grammar compiler with an in-memory cache.
pub struct GrammarCompiler {
    tokenizer: Arc<TokenizerInfo>,
    config: CompilerConfig,
    slots: Mutex<HashMap<CacheKey, Arc<Slot>, FxBuildHasher>>,
    gate: CompileGate,
}

impl GrammarCompiler {
    pub fn new(tokenizer: Arc<TokenizerInfo>) -> Self {
        Self::with_config(tokenizer, CompilerConfig::default())
    }

    pub fn with_config(tokenizer: Arc<TokenizerInfo>, config: CompilerConfig) -> Self {
        let limit = config.max_concurrent_compiles.max(1);
        Self {
            tokenizer,
            config,
            slots: Mutex::new(HashMap::default()),
            gate: CompileGate {
                running: Mutex::new(0),
                freed: Condvar::new(),
                limit,
            },
        }
    }

    pub fn tokenizer(&self) -> &Arc<TokenizerInfo> {
        &self.tokenizer
    }

    /// The built-in any-JSON grammar, compiled for this vocabulary.
    pub fn compile_builtin_json(&self) -> Result<Arc<CompiledGrammar>> {
        self.get_or_compile(CacheKey::BuiltinJson, || Ok(Grammar::builtin_json().clone()))
    }

    pub fn compile_ebnf(&self, source: &str, root: &str) -> Result<Arc<CompiledGrammar>> {
        let key = CacheKey::Ebnf {
            source: source.to_string(),
            root: root.to_string(),
        };
        self.get_or_compile(key, || Grammar::from_ebnf(source, root))
    }

    pub fn compile_json_schema(
        &self,
        schema: &str,
        options: &JsonSchemaOptions,
    ) -> Result<Arc<CompiledGrammar>> {
        let key = CacheKey::JsonSchema {
            schema: schema.to_string(),
            options: options.clone(),
        };
        self.get_or_compile(key, || json_schema_to_grammar(schema, options))
    }

    pub fn compile_regex(&self, pattern: &str) -> Result<Arc<CompiledGrammar>> {
        let key = CacheKey::Regex {
            pattern: pattern.to_string(),
        };
        self.get_or_compile(key, || regex_to_grammar(pattern))
    }

    pub fn compile_structural_tag(&self, source: &str) -> Result<Arc<CompiledGrammar>> {
        let key = CacheKey::StructuralTag {
            source: source.to_string(),
        };
        self.get_or_compile(key, || structural_tag_to_grammar(source))
    }

    /// Number of cached grammars.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn get_or_compile(
        &self,
        key: CacheKey,
        make_grammar: impl FnOnce() -> Result<Grammar>,
    ) -> Result<Arc<CompiledGrammar>> {
        // Short global lock: find or create the slot.
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        ready: Mutex::new(None),
                    })
                })
                .clone()
        };

        // Per-key lock, held across the compile: latecomers block here
        // and then read the published result.
        let mut ready = slot.ready.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(compiled) = ready.as_ref() {
            tracing::debug!("grammar cache hit");
            return Ok(compiled.clone());
        }

        let _pass = self.gate.acquire();
        let result = make_grammar().and_then(|grammar| {
            CompiledGrammar::compile_with_options(
                &grammar,
                &self.tokenizer,
                &self.config.compile,
            )
        });

        match result {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                *ready = Some(compiled.clone());
                Ok(compiled)
            }
            Err(e) => {
                // No partial entries: drop the slot unless someone else
                // published meanwhile (they cannot have, we hold the slot
                // lock; the map may still hold a fresh slot
                // from a clear/recreate race).
                drop(ready);
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(current) = slots.get(&key) {
                    if Arc::ptr_eq(current, &slot) {
                        slots.remove(&key);
                    }
                }
                Err(e)
            }
        }
    }
}
