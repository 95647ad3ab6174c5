use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::Result;
use crate::vocab::{SpecialTokens, Vocab};

pub(crate) const PRETOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

/// On-disk layout of `tokenizer.json`. Merges are stored as pairs in rank
/// order because JSON maps cannot have tuple keys.
#[derive(Serialize, Deserialize)]
struct TokenizerFile {
    vocab: HashMap<String, u32>,
    merges: Vec<(String, String)>,
    special: SpecialTokens,
}

#[derive(Clone)]
pub struct BPE {
    pub vocab: Vocab,
    pub merges: HashMap<(String, String), u32>,
    pub special: SpecialTokens,
    regex: Regex,
}

// Custom Debug impl to skip regex
impl std::fmt::Debug for BPE {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPE")
            .field("vocab_size", &self.vocab.len())
            .field("merges_count", &self.merges.len())
            .field("special", &self.special)
            .finish()
    }
}

impl BPE {
    /// Builds a tokenizer; the vocabulary must already contain the special tokens.
    pub fn new(vocab: Vocab, merges: HashMap<(String, String), u32>) -> Result<Self> {
        let special = SpecialTokens::from_vocab(&vocab)?;
        Ok(Self {
            vocab,
            merges,
            special,
            regex: Regex::new(PRETOKENIZE_PATTERN)?,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn pad_id(&self) -> u32 {
        self.special.pad
    }

    pub fn eos_id(&self) -> u32 {
        self.special.eos
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();

        while word.len() > 1 {
            let best = word
                .windows(2)
                .filter_map(|pair| {
                    self.merges
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, pair[0].clone(), pair[1].clone()))
                })
                .min_by_key(|(rank, _, _)| *rank);

            let Some((_, first, second)) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }

        word
    }

    /// Encodes text without appending EOS.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        for mat in self.regex.find_iter(text) {
            for token in self.bpe(mat.as_str()) {
                if let Some(id) = self.vocab.get_id(&token) {
                    ids.push(id);
                    continue;
                }
                // Byte fallback, then <unk>.
                for byte in token.bytes() {
                    let byte_token = format!("<0x{:02X}>", byte);
                    ids.push(self.vocab.get_id(&byte_token).unwrap_or(self.special.unk));
                }
            }
        }
        ids
    }

    /// Encodes text, truncates to `max_tokens - 1` ids and terminates with EOS,
    /// so the result never exceeds `max_tokens` (and always holds the EOS).
    pub fn encode_with_max_tokens(&self, text: &str, max_tokens: usize) -> Vec<u32> {
        let mut ids = self.encode(text);
        ids.truncate(max_tokens.saturating_sub(1));
        ids.push(self.special.eos);
        ids
    }

    /// Decodes ids back to text, skipping special tokens and reassembling
    /// byte-fallback tokens.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            if self.special.contains(id) {
                continue;
            }
            let Some(token) = self.vocab.get_token(id) else {
                continue;
            };
            match parse_byte_token(token) {
                Some(byte) => bytes.push(byte),
                None => bytes.extend_from_slice(token.as_bytes()),
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut ranked: Vec<(&(String, String), &u32)> = self.merges.iter().collect();
        ranked.sort_by_key(|&(_, rank)| *rank);

        let file = TokenizerFile {
            vocab: self.vocab.token_to_id.clone(),
            merges: ranked.into_iter().map(|(pair, _)| pair.clone()).collect(),
            special: self.special,
        };
        let writer = std::io::BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &file)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: TokenizerFile = serde_json::from_reader(reader)?;

        let mut vocab = Vocab::new();
        for (token, id) in file.vocab {
            vocab.insert(token, id);
        }
        let merges = file
            .merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank as u32))
            .collect();

        Ok(Self {
            vocab,
            merges,
            special: file.special,
            regex: Regex::new(PRETOKENIZE_PATTERN)?,
        })
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }
}

fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    u8::from_str_radix(hex, 16).ok()
}
