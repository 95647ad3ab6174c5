use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, TokenizerError};

pub const PAD_TOKEN: &str = "<pad>";
pub const EOS_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";

/// Ids of the tokens a seq2seq model treats specially. The default layout
/// matches T5 checkpoints: pad = 0, eos = 1, unk = 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub pad: u32,
    pub eos: u32,
    pub unk: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self { pad: 0, eos: 1, unk: 2 }
    }
}

impl SpecialTokens {
    pub fn names() -> [&'static str; 3] {
        [PAD_TOKEN, EOS_TOKEN, UNK_TOKEN]
    }

    pub fn contains(&self, id: u32) -> bool {
        id == self.pad || id == self.eos || id == self.unk
    }

    /// Resolves the special ids from a vocabulary that already holds them.
    pub fn from_vocab(vocab: &Vocab) -> Result<Self> {
        let lookup = |name: &str| {
            vocab
                .get_id(name)
                .ok_or_else(|| TokenizerError::MissingSpecialToken(name.to_string()))
        };
        Ok(Self {
            pad: lookup(PAD_TOKEN)?,
            eos: lookup(EOS_TOKEN)?,
            unk: lookup(UNK_TOKEN)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocab {
    pub token_to_id: HashMap<String, u32>,
    pub id_to_token: HashMap<u32, String>,
}

impl Vocab {
    pub fn new() -> Self {
        Self {
            token_to_id: HashMap::new(),
            id_to_token: HashMap::new(),
        }
    }

    /// A vocabulary seeded with the seq2seq special tokens at their default ids.
    pub fn with_special_tokens() -> Self {
        let mut vocab = Self::new();
        for (id, name) in SpecialTokens::names().iter().enumerate() {
            vocab.insert(name.to_string(), id as u32);
        }
        vocab
    }

    pub fn insert(&mut self, token: String, id: u32) {
        self.token_to_id.insert(token.clone(), id);
        self.id_to_token.insert(id, token);
    }

    /// Appends `token` with the next free id unless it is already present.
    pub fn push(&mut self, token: String) -> u32 {
        if let Some(id) = self.get_id(&token) {
            return id;
        }
        let id = self.len() as u32;
        self.insert(token, id);
        id
    }

    pub fn get_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn get_token(&self, id: u32) -> Option<&String> {
        self.id_to_token.get(&id)
    }

    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}
