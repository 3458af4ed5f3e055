//! Normalized tokenizer vocabulary.
//!
//! [`TokenizerInfo`] is the matcher's view of an LLM vocabulary: an ordered
//! table where entry *i* is the exact byte sequence token *i* emits, plus
//! the designated stop-token ids. Raw tokenizer encodings (SentencePiece
//! byte-fallback, GPT-2 byte-level) are normalized here so downstream
//! matching is pure byte comparison: a token that decodes to invalid UTF-8
//! stays invalid UTF-8 and can never alias a Unicode character class.
//!
//! It also precomputes the lexicographically sorted vocabulary and per-entry
//! trie subtree bounds that the bitmask trie walk relies on.

use crate::error::{Error, Result};

/// How raw token strings map to emitted bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabType {
    /// Tokens are used as-is.
    Raw,
    /// SentencePiece style: `<0xAB>` is the single byte 0xAB, `▁` (U+2581)
    /// is a space.
    ByteFallback,
    /// GPT-2 byte-level BPE: each char maps back through the
    /// bytes-to-unicode table.
    ByteLevel,
}

/// Normalized vocabulary table consumed by matchers and the compiler.
#[derive(Debug, Clone)]
pub struct TokenizerInfo {
    /// `decoded[i]` is the byte sequence token `i` emits.
    decoded: Vec<Vec<u8>>,
    /// Vocabulary sorted lexicographically by decoded bytes:
    /// `(token_id, bytes)`. Empty (special) tokens are excluded.
    sorted_vocab: Vec<(u32, Vec<u8>)>,
    /// For `sorted_vocab[i]`, index of the first later entry that does NOT
    /// start with `sorted_vocab[i]`'s bytes. Lets the trie walk skip the
    /// whole subtree when a prefix dies.
    trie_subtree_end: Vec<usize>,
    /// Total vocabulary size; may exceed `decoded.len()` (padding ids).
    vocab_size: usize,
    vocab_type: VocabType,
    /// Token ids that decode to no bytes (control/special tokens).
    special_token_ids: Vec<u32>,
    /// Token ids that signal end of generation.
    stop_token_ids: Vec<u32>,
}

impl TokenizerInfo {
    /// Build a normalized table from an encoded vocabulary.
    ///
    /// `vocab_size` may extend past `encoded_vocab.len()`; the extra ids
    /// are treated as special. `stop_token_ids` designates end-of-output
    /// tokens (they need not decode to bytes).
    pub fn new(
        encoded_vocab: &[String],
        vocab_type: VocabType,
        vocab_size: Option<usize>,
        stop_token_ids: Vec<u32>,
    ) -> Result<Self> {
        let vocab_size = vocab_size.unwrap_or(encoded_vocab.len());
        if vocab_size < encoded_vocab.len() {
            return Err(Error::validation(format!(
                "vocab_size ({vocab_size}) is smaller than the encoded vocabulary ({})",
                encoded_vocab.len()
            )));
        }
        for &id in &stop_token_ids {
            if id as usize >= vocab_size {
                return Err(Error::validation(format!(
                    "stop token id {id} is out of range for vocab_size {vocab_size}"
                )));
            }
        }

        let decoded: Vec<Vec<u8>> = encoded_vocab
            .iter()
            .map(|tok| decode_token(tok, vocab_type))
            .collect::<Result<_>>()?;

        let mut sorted_vocab = Vec::with_capacity(decoded.len());
        let mut special_token_ids = Vec::new();
        for (id, bytes) in decoded.iter().enumerate() {
            if bytes.is_empty() {
                special_token_ids.push(id as u32);
            } else {
                sorted_vocab.push((id as u32, bytes.clone()));
            }
        }
        sorted_vocab.sort_by(|a, b| a.1.cmp(&b.1));
        let trie_subtree_end = trie_subtree_bounds(&sorted_vocab);

        Ok(Self {
            decoded,
            sorted_vocab,
            trie_subtree_end,
            vocab_size,
            vocab_type,
            special_token_ids,
            stop_token_ids,
        })
    }

    /// Convenience constructor for raw byte vocabularies (mostly tests).
    pub fn from_raw(vocab: &[&str], stop_token_ids: Vec<u32>) -> Self {
        let encoded: Vec<String> = vocab.iter().map(|s| s.to_string()).collect();
        Self::new(&encoded, VocabType::Raw, None, stop_token_ids)
            .expect("raw vocabulary is always decodable")
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn vocab_type(&self) -> VocabType {
        self.vocab_type
    }

    /// Byte sequence for a token id; `None` past the decoded table.
    pub fn token_bytes(&self, token_id: u32) -> Option<&[u8]> {
        self.decoded.get(token_id as usize).map(|v| v.as_slice())
    }

    pub fn sorted_vocab(&self) -> &[(u32, Vec<u8>)] {
        &self.sorted_vocab
    }

    pub fn trie_subtree_end(&self) -> &[usize] {
        &self.trie_subtree_end
    }

    pub fn special_token_ids(&self) -> &[u32] {
        &self.special_token_ids
    }

    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop_token_ids
    }

    /// Content-derived fingerprint, used as the vocabulary half of compiler
    /// cache keys.
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = rustc_hash::FxHasher::default();
        self.vocab_size.hash(&mut hasher);
        for bytes in &self.decoded {
            bytes.hash(&mut hasher);
        }
        self.stop_token_ids.hash(&mut hasher);
        hasher.finish()
    }
}

fn decode_token(encoded: &str, vocab_type: VocabType) -> Result<Vec<u8>> {
    match vocab_type {
        VocabType::Raw => Ok(encoded.as_bytes().to_vec()),
        VocabType::ByteFallback => decode_byte_fallback(encoded),
        VocabType::ByteLevel => Ok(decode_byte_level(encoded)),
    }
}

/// `<0xAB>` → the raw byte 0xAB; `▁` (U+2581) → space.
fn decode_byte_fallback(encoded: &str) -> Result<Vec<u8>> {
    if encoded.len() == 6 && encoded.starts_with("<0x") && encoded.ends_with('>') {
        let byte = u8::from_str_radix(&encoded[3..5], 16).map_err(|_| {
            Error::validation(format!("invalid byte-fallback token: {encoded}"))
        })?;
        return Ok(vec![byte]);
    }
    Ok(encoded.replace('\u{2581}', " ").into_bytes())
}

/// Inverse of GPT-2's bytes-to-unicode mapping. Codepoints outside the
/// table are passed through as UTF-8.
fn decode_byte_level(encoded: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len());
    for c in encoded.chars() {
        match byte_level_char_to_byte(c as u32) {
            Some(b) => out.push(b),
            None => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out
}

fn byte_level_char_to_byte(cp: u32) -> Option<u8> {
    // Printable bytes map to themselves; the rest were shifted to 256+.
    match cp {
        0x21..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF => Some(cp as u8),
        0x100..=0x1FF => {
            let offset = (cp - 0x100) as usize;
            let mut idx = 0usize;
            for b in 0u16..=255 {
                let identity = matches!(b, 0x21..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF);
                if !identity {
                    if idx == offset {
                        return Some(b as u8);
                    }
                    idx += 1;
                }
            }
            None
        }
        _ => None,
    }
}

/// For each sorted entry, the index of the first entry that is not in its
/// prefix subtree.
fn trie_subtree_bounds(sorted_vocab: &[(u32, Vec<u8>)]) -> Vec<usize> {
    let n = sorted_vocab.len();
    let mut bounds = vec![n; n];
    let mut stack: Vec<usize> = Vec::new();
    for i in 0..n {
        let bytes = &sorted_vocab[i].1;
        while let Some(&top) = stack.last() {
            if bytes.starts_with(&sorted_vocab[top].1) {
                break;
            }
            bounds[top] = i;
            stack.pop();
        }
        stack.push(i);
    }
    bounds
}
