use std::{
    collections::{BTreeMap, HashMap},
    io::Read,
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::corpus::open_text;

pub const EOS: usize = 0;
pub const UNK: usize = 1;
pub const UNK_TOKEN: &str = "UNK";

/// Token to index mapping, `0` reserved for end-of-sentence and `1` for unknown tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vocab {
    token_to_id: HashMap<String, usize>,
    id_to_token: BTreeMap<usize, String>,
}

impl Vocab {
    pub fn from_map(token_to_id: HashMap<String, usize>) -> Self {
        let id_to_token = token_to_id
            .iter()
            .map(|(token, id)| (*id, token.clone()))
            .collect();
        Self {
            token_to_id,
            id_to_token,
        }
    }

    #[instrument(level = "debug")]
    pub fn load_json<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<Self> {
        let mut json = String::new();
        open_text(&path)?
            .read_to_string(&mut json)
            .with_context(|| format!("failed to read vocabulary {path:?}"))?;
        let map: HashMap<String, usize> =
            serde_json::from_str(&json).with_context(|| format!("invalid vocabulary {path:?}"))?;
        debug!(len = map.len(), "loaded vocabulary");
        Ok(Self::from_map(map))
    }

    /// Drops every entry whose index is `n_words` or above.
    pub fn prune(&mut self, n_words: usize) {
        self.token_to_id.retain(|_, id| *id < n_words);
        self.id_to_token.retain(|id, _| *id < n_words);
    }

    pub fn lookup(&self, token: &str) -> usize {
        self.token_to_id.get(token).copied().unwrap_or(UNK)
    }

    pub fn token(&self, id: usize) -> Option<&str> {
        self.id_to_token.get(&id).map(|x| x.as_str())
    }

    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }

    /// Renders indices back to text, stopping at the first `eos`.
    pub fn seqs_to_words(&self, seq: &[usize]) -> String {
        seq.iter()
            .take_while(|&&id| id != EOS)
            .map(|&id| self.token(id).unwrap_or(UNK_TOKEN))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn new_vocab() -> Vocab {
        let map = [("eos", 0), ("UNK", 1), ("the", 2), ("cat", 3), ("sat", 4)]
            .into_iter()
            .map(|(token, id)| (token.to_string(), id))
            .collect();
        Vocab::from_map(map)
    }

    #[test]
    fn unknown_tokens_map_to_unk() {
        let vocab = new_vocab();
        assert_eq!(vocab.lookup("cat"), 3);
        assert_eq!(vocab.lookup("dog"), UNK);
    }

    #[test]
    fn prune_removes_high_indices() {
        let mut vocab = new_vocab();
        vocab.prune(4);
        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.lookup("sat"), UNK);
        assert_eq!(vocab.token(4), None);
    }

    #[test]
    fn seqs_to_words_stops_at_eos() {
        let vocab = new_vocab();
        assert_eq!(vocab.seqs_to_words(&[2, 3, 99, 4, 0, 3]), "the cat UNK sat");
        assert_eq!(vocab.seqs_to_words(&[0, 2]), "");
    }

    #[test]
    fn vocab_loads_from_json_file() {
        let path = std::env::temp_dir().join("plane_vocab_loads_from_json_file.json");
        std::fs::write(&path, r#"{"eos": 0, "UNK": 1, "hello": 2}"#).unwrap();

        let vocab = Vocab::load_json(&path).unwrap();
        assert_eq!(vocab.lookup("hello"), 2);
        assert_eq!(vocab.len(), 3);
        std::fs::remove_file(&path).ok();
    }
}
