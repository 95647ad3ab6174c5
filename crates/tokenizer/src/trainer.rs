use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::bpe::{BPE, PRETOKENIZE_PATTERN};
use crate::error::{Result, TokenizerError};
use crate::vocab::Vocab;

/// Learns BPE merges from a corpus. The resulting vocabulary always starts
/// with the seq2seq special tokens, then single characters, then 256 byte
/// fallback tokens, then merged tokens in merge order.
pub struct Trainer {
    vocab_size: usize,
    min_frequency: u32,
}

impl Trainer {
    pub fn new(vocab_size: usize, min_frequency: u32) -> Self {
        Self {
            vocab_size,
            min_frequency,
        }
    }

    pub fn train<P: AsRef<Path>>(&self, files: &[P]) -> Result<BPE> {
        let mut lines = Vec::new();
        for path in files {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                lines.push(line?);
            }
        }
        self.train_from_texts(&lines)
    }

    pub fn train_from_texts<S: AsRef<str>>(&self, texts: &[S]) -> Result<BPE> {
        let regex = Regex::new(PRETOKENIZE_PATTERN)?;

        let mut word_counts: HashMap<String, u32> = HashMap::new();
        for text in texts {
            for mat in regex.find_iter(text.as_ref()) {
                *word_counts.entry(mat.as_str().to_string()).or_insert(0) += 1;
            }
        }
        if word_counts.is_empty() {
            return Err(TokenizerError::EmptyCorpus);
        }
        log::info!("training BPE on {} unique words", word_counts.len());

        let mut split_words: HashMap<String, Vec<String>> = word_counts
            .keys()
            .map(|word| (word.clone(), word.chars().map(|c| c.to_string()).collect()))
            .collect();

        let mut vocab = Vocab::with_special_tokens();

        // Sorted so that two trainings over the same corpus produce the same ids.
        let base_chars: BTreeSet<&String> = split_words.values().flatten().collect();
        for ch in base_chars {
            vocab.push(ch.clone());
        }
        for byte in 0..=255u8 {
            vocab.push(format!("<0x{:02X}>", byte));
        }
        log::debug!("initial vocab size: {}", vocab.len());

        let mut merges: HashMap<(String, String), u32> = HashMap::new();

        while vocab.len() < self.vocab_size {
            let mut pair_counts: HashMap<(String, String), u32> = HashMap::new();
            for (word, count) in &word_counts {
                let Some(tokens) = split_words.get(word) else {
                    continue;
                };
                for pair in tokens.windows(2) {
                    *pair_counts
                        .entry((pair[0].clone(), pair[1].clone()))
                        .or_insert(0) += count;
                }
            }

            // Highest count wins; ties broken lexicographically for determinism.
            let best = pair_counts
                .into_iter()
                .filter(|(_, count)| *count >= self.min_frequency)
                .max_by(|(pa, ca), (pb, cb)| ca.cmp(cb).then_with(|| pb.cmp(pa)));

            let Some(((first, second), _)) = best else {
                log::debug!("no more pairs to merge, stopping at {} tokens", vocab.len());
                break;
            };

            let merged = format!("{}{}", first, second);
            vocab.push(merged.clone());
            merges.insert((first.clone(), second.clone()), merges.len() as u32);

            for tokens in split_words.values_mut() {
                let mut updated = Vec::with_capacity(tokens.len());
                let mut i = 0;
                while i < tokens.len() {
                    if i + 1 < tokens.len() && tokens[i] == first && tokens[i + 1] == second {
                        updated.push(merged.clone());
                        i += 2;
                    } else {
                        updated.push(tokens[i].clone());
                        i += 1;
                    }
                }
                *tokens = updated;
            }
        }

        log::info!("BPE training finished: {} tokens, {} merges", vocab.len(), merges.len());
        BPE::new(vocab, merges)
    }
}
