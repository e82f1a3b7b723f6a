//! Byte-level BPE tokenizer, loaded from a `vocab.json` containing a
//! `vocab` (token string → id) map, an ordered `merges` list, and a
//! `special_tokens` (symbolic name → id) section.
//!
//! Encoding first maps each input byte through a fixed byte→printable
//! alphabet (so arbitrary bytes, including ones that aren't valid UTF-8 on
//! their own, round-trip through a JSON-safe vocabulary the way GPT-2/
//! tiktoken-style byte-level BPE does), then repeatedly applies the
//! highest-priority merge over adjacent symbols until none apply.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{QwenAsrError, Result};

#[derive(Deserialize)]
struct VocabFile {
    vocab: HashMap<String, u32>,
    merges: Vec<String>,
    special_tokens: HashMap<String, u32>,
}

/// The 256-entry byte ↔ printable-unicode alphabet used by byte-level BPE,
/// identical in spirit to GPT-2's: bytes that are already printable ASCII
/// map to themselves, everything else maps into a private block of
/// codepoints so every byte has a distinct, mergeable symbol.
fn byte_alphabet() -> (Vec<char>, HashMap<char, u8>) {
    let mut bs: Vec<u32> = Vec::new();
    bs.extend(b'!' as u32..=b'~' as u32);
    bs.extend(0xA1u32..=0xACu32);
    bs.extend(0xAEu32..=0xFFu32);

    let mut byte_to_char = vec![0u32; 256];
    let mut cs = bs.clone();
    let mut n = 0u32;
    for b in 0..256u32 {
        if bs.contains(&b) {
            byte_to_char[b as usize] = b;
        } else {
            cs.push(256 + n);
            byte_to_char[b as usize] = 256 + n;
            n += 1;
        }
    }

    let encode: Vec<char> = byte_to_char
        .iter()
        .map(|&c| char::from_u32(c).expect("byte alphabet codepoints are always valid"))
        .collect();
    let decode: HashMap<char, u8> = encode
        .iter()
        .enumerate()
        .map(|(b, &c)| (c, b as u8))
        .collect();
    (encode, decode)
}

pub struct SpecialTokens {
    pub bos: u32,
    pub eos: u32,
    pub system: u32,
    pub user: u32,
    pub assistant: u32,
    /// language tag name (e.g. "English") -> token id
    pub languages: HashMap<String, u32>,
}

pub struct Vocabulary {
    token_to_id: HashMap<String, u32>,
    id_to_bytes: Vec<Vec<u8>>,
    merge_rank: HashMap<(String, String), usize>,
    byte_encode: Vec<char>,
    byte_decode: HashMap<char, u8>,
    pub special: SpecialTokens,
}

fn required_special(map: &HashMap<String, u32>, name: &str) -> Result<u32> {
    map.get(name)
        .copied()
        .ok_or_else(|| QwenAsrError::InvalidArgument(format!("vocab.json missing special token `{name}`")))
}

impl Vocabulary {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| QwenAsrError::FileNotFound(path.display().to_string()))?;
        let file: VocabFile = serde_json::from_str(&text)
            .map_err(|e| QwenAsrError::HeaderParseError(format!("vocab.json: {e}")))?;
        Self::from_parts(file)
    }

    fn from_parts(file: VocabFile) -> Result<Self> {
        let (byte_encode, byte_decode) = byte_alphabet();

        let mut id_to_str: Vec<Option<&str>> = vec![None; file.vocab.len()];
        for (tok, &id) in &file.vocab {
            let idx = id as usize;
            if idx >= id_to_str.len() {
                id_to_str.resize(idx + 1, None);
            }
            id_to_str[idx] = Some(tok.as_str());
        }

        let id_to_bytes: Vec<Vec<u8>> = id_to_str
            .iter()
            .map(|entry| match entry {
                Some(tok) => tok.chars().map(|c| *byte_decode.get(&c).unwrap_or(&b'?')).collect(),
                None => Vec::new(),
            })
            .collect();

        let mut merge_rank = HashMap::new();
        for (rank, line) in file.merges.iter().enumerate() {
            if let Some((a, b)) = line.split_once(' ') {
                merge_rank.insert((a.to_string(), b.to_string()), rank);
            }
        }

        let languages: HashMap<String, u32> = file
            .special_tokens
            .iter()
            .filter(|(k, _)| k.starts_with("lang_"))
            .map(|(k, &v)| (k.trim_start_matches("lang_").to_string(), v))
            .collect();

        let special = SpecialTokens {
            bos: required_special(&file.special_tokens, "bos")?,
            eos: required_special(&file.special_tokens, "eos")?,
            system: required_special(&file.special_tokens, "system")?,
            user: required_special(&file.special_tokens, "user")?,
            assistant: required_special(&file.special_tokens, "assistant")?,
            languages,
        };

        Ok(Vocabulary {
            token_to_id: file.vocab,
            id_to_bytes,
            merge_rank,
            byte_encode,
            byte_decode,
            special,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_bytes.len()
    }

    /// Comma-separated language tags exposed by the tokenizer's
    /// `special_tokens` section (read, never hardcoded, per spec.md's
    /// Open Questions).
    pub fn supported_languages_csv(&self) -> String {
        let mut names: Vec<&str> = self.special.languages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.join(",")
    }

    pub fn language_token(&self, name: &str) -> Option<u32> {
        self.special.languages.get(name).copied()
    }

    /// Encodes UTF-8 text into token ids via byte-level BPE.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        for word_bytes in split_words(text) {
            let mut symbols: Vec<String> = word_bytes
                .iter()
                .map(|&b| self.byte_encode[b as usize].to_string())
                .collect();

            loop {
                let mut best: Option<(usize, usize)> = None; // (rank, pair index)
                for i in 0..symbols.len().saturating_sub(1) {
                    let key = (symbols[i].clone(), symbols[i + 1].clone());
                    if let Some(&rank) = self.merge_rank.get(&key) {
                        if best.map_or(true, |(r, _)| rank < r) {
                            best = Some((rank, i));
                        }
                    }
                }
                match best {
                    Some((_, i)) => {
                        let merged = format!("{}{}", symbols[i], symbols[i + 1]);
                        symbols.splice(i..=i + 1, [merged]);
                    }
                    None => break,
                }
            }

            for sym in symbols {
                if let Some(&id) = self.token_to_id.get(&sym) {
                    ids.push(id);
                } else {
                    // Fall back to per-byte-char tokens if the symbol never
                    // got merged into a vocab entry (shouldn't happen with
                    // a complete merge table, but keeps encode total).
                    for c in sym.chars() {
                        if let Some(&id) = self.token_to_id.get(&c.to_string()) {
                            ids.push(id);
                        }
                    }
                }
            }
        }
        ids
    }

    /// Decodes token ids back into UTF-8, passing invalid byte sequences
    /// through one byte at a time rather than collapsing them into U+FFFD
    /// replacement characters. This matters when `decode` is called on a
    /// partial, still-growing id list during incremental generation: the
    /// trailing bytes of a not-yet-complete multi-byte codepoint are
    /// invalid UTF-8 on their own, and lossy replacement would permanently
    /// destroy them instead of letting the next token complete the
    /// sequence.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            if let Some(tok_bytes) = self.id_to_bytes.get(id as usize) {
                bytes.extend_from_slice(tok_bytes);
            }
        }
        bytes_to_string_passthrough(&bytes)
    }

    pub fn is_special(&self, id: u32) -> bool {
        id == self.special.bos
            || id == self.special.eos
            || id == self.special.system
            || id == self.special.user
            || id == self.special.assistant
            || self.special.languages.values().any(|&v| v == id)
    }
}

/// Decodes `bytes` as UTF-8, passing any invalid byte through as its own
/// Latin-1 codepoint (every byte value 0..=255 is a valid Unicode scalar
/// value on its own) instead of substituting U+FFFD. Valid runs decode
/// normally; this only changes behavior at the invalid boundary.
fn bytes_to_string_passthrough(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                break;
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                out.push_str(std::str::from_utf8(&rest[..valid_up_to]).unwrap());
                out.push(rest[valid_up_to] as char);
                rest = &rest[valid_up_to + 1..];
            }
        }
    }
    out
}

/// Splits on whitespace boundaries, keeping the whitespace attached to the
/// following word the way GPT-2-style byte-level BPE pre-tokenizers do
/// (a leading space is itself byte-encoded and participates in merges).
fn split_words(text: &str) -> Vec<Vec<u8>> {
    let mut words = Vec::new();
    let mut current = Vec::new();
    for ch in text.chars() {
        if ch.is_whitespace() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        let mut buf = [0u8; 4];
        current.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tiny_vocab() -> Vocabulary {
        // A minimal byte-level vocab: every single byte is its own token,
        // plus a couple of merges and the required special tokens.
        let (encode, _decode) = byte_alphabet();
        let mut vocab = HashMap::new();
        for c in &encode {
            vocab.insert(c.to_string(), vocab.len() as u32);
        }
        let next = vocab.len() as u32;
        let mut special = HashMap::new();
        special.insert("bos".to_string(), next);
        special.insert("eos".to_string(), next + 1);
        special.insert("system".to_string(), next + 2);
        special.insert("user".to_string(), next + 3);
        special.insert("assistant".to_string(), next + 4);
        special.insert("lang_English".to_string(), next + 5);
        special.insert("lang_French".to_string(), next + 6);
        for (k, v) in &special {
            vocab.insert(format!("<|{}|>", k.replace("lang_", "lang_")), *v);
        }

        let file = VocabFile {
            vocab,
            merges: Vec::new(),
            special_tokens: special,
        };
        Vocabulary::from_parts(file).unwrap()
    }

    #[test]
    fn round_trip_ascii() {
        let v = tiny_vocab();
        for s in ["hello world", "ASR test 123", ""] {
            let ids = v.encode(s);
            assert_eq!(v.decode(&ids), s);
        }
    }

    #[test]
    fn round_trip_unicode_and_emoji() {
        let v = tiny_vocab();
        for s in ["你好世界", "emoji 🎙️ test", "café"] {
            let ids = v.encode(s);
            assert_eq!(v.decode(&ids), s);
        }
    }

    #[test]
    fn invalid_utf8_passes_through_instead_of_replacement_char() {
        // 0xC3 alone is the first byte of a two-byte sequence with no
        // continuation byte: invalid on its own, but shouldn't vanish.
        let s = bytes_to_string_passthrough(&[b'h', b'i', 0xC3]);
        assert_eq!(s, "hi\u{C3}");
        assert!(!s.contains('\u{FFFD}'));
    }

    #[test]
    fn supported_languages_lists_lang_tokens() {
        let v = tiny_vocab();
        let csv = v.supported_languages_csv();
        let mut langs: Vec<&str> = csv.split(',').collect();
        langs.sort_unstable();
        assert_eq!(langs, vec!["English", "French"]);
    }
}
