use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::ml::{rnn::RecurrentKind, NodeValue};

/// Model hyper-parameters shared by layer construction, dropout and data loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub dim_word: usize,
    pub dim: usize,
    pub factors: usize,
    pub dim_per_factor: Option<Vec<usize>>,
    pub n_words_src: usize,
    pub n_words: usize,
    pub enc_depth: usize,
    pub dec_depth: usize,
    pub enc_recurrence_transition_depth: usize,
    pub dec_base_recurrence_transition_depth: usize,
    pub dec_high_recurrence_transition_depth: usize,
    pub layer_normalisation: bool,
    pub weight_normalisation: bool,
    pub use_dropout: bool,
    pub dropout_embedding: NodeValue,
    pub dropout_hidden: NodeValue,
    pub dropout_source: NodeValue,
    pub dropout_target: NodeValue,
    pub model_version: f64,
    pub encoder: RecurrentKind,
    pub decoder: RecurrentKind,
    pub maxlen: usize,
    pub batch_size: usize,
    pub maxibatch_size: usize,
    pub sort_by_length: bool,
    pub shuffle_each_epoch: bool,
    pub skip_empty: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            dim_word: 512,
            dim: 1000,
            factors: 1,
            dim_per_factor: None,
            n_words_src: 90_000,
            n_words: 90_000,
            enc_depth: 1,
            dec_depth: 1,
            enc_recurrence_transition_depth: 1,
            dec_base_recurrence_transition_depth: 2,
            dec_high_recurrence_transition_depth: 1,
            layer_normalisation: false,
            weight_normalisation: false,
            use_dropout: false,
            dropout_embedding: 0.2,
            dropout_hidden: 0.2,
            dropout_source: 0.0,
            dropout_target: 0.0,
            model_version: 0.1,
            encoder: RecurrentKind::Gru,
            decoder: RecurrentKind::Gru,
            maxlen: 100,
            batch_size: 80,
            maxibatch_size: 20,
            sort_by_length: true,
            shuffle_each_epoch: true,
            skip_empty: false,
        }
    }
}

impl ModelOptions {
    pub fn use_factor(&self) -> bool {
        self.factors > 1
    }

    /// Embedding width of each source factor, defaulting to one factor of `dim_word`.
    pub fn factor_dims(&self) -> Vec<usize> {
        match &self.dim_per_factor {
            Some(dims) => dims.clone(),
            None => vec![self.dim_word],
        }
    }

    pub fn validate(&self) -> Result<()> {
        let factor_dims = self.factor_dims();
        if factor_dims.len() != self.factors {
            return Err(anyhow!(
                "dim_per_factor lists {} widths but factors = {}",
                factor_dims.len(),
                self.factors
            ));
        }
        if factor_dims.iter().sum::<usize>() != self.dim_word {
            return Err(anyhow!(
                "dim_per_factor {factor_dims:?} must sum to dim_word = {}",
                self.dim_word
            ));
        }
        if self.dim == 0 || self.dim_word == 0 || self.n_words == 0 || self.n_words_src == 0 {
            return Err(anyhow!("model dimensions and vocabulary sizes must be non-zero"));
        }
        if self.enc_depth == 0 || self.dec_depth == 0 {
            return Err(anyhow!("encoder and decoder depth must be at least 1"));
        }
        if self.enc_recurrence_transition_depth == 0
            || self.dec_base_recurrence_transition_depth == 0
            || self.dec_high_recurrence_transition_depth == 0
        {
            return Err(anyhow!("recurrence transition depths must be at least 1"));
        }
        let rates = [
            self.dropout_embedding,
            self.dropout_hidden,
            self.dropout_source,
            self.dropout_target,
        ];
        if rates.iter().any(|p| !(0.0..1.0).contains(p)) {
            return Err(anyhow!("dropout rates must lie in [0, 1), got {rates:?}"));
        }
        Ok(())
    }

    #[instrument(level = "info")]
    pub fn load_json<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read model options from {path:?}"))?;
        let options: Self = serde_json::from_str(&json).context("invalid model options")?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = ModelOptions::default();
        options.validate().unwrap();
        assert!(!options.use_factor());
        assert_eq!(options.factor_dims(), vec![512]);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = r#"{ "dim": 8, "dim_word": 6, "factors": 2, "dim_per_factor": [4, 2], "decoder": "Lstm" }"#;
        let options: ModelOptions = serde_json::from_str(json).unwrap();

        options.validate().unwrap();
        assert_eq!(options.dim, 8);
        assert_eq!(options.decoder, RecurrentKind::Lstm);
        assert_eq!(options.batch_size, 80);
        assert!(options.use_factor());
    }

    #[test]
    fn mismatched_factor_dims_are_rejected() {
        let options = ModelOptions {
            factors: 2,
            dim_per_factor: Some(vec![100, 100]),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = ModelOptions {
            dropout_hidden: 1.0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn options_load_from_file() {
        let path = std::env::temp_dir().join("plane_options_load_from_file.json");
        let options = ModelOptions {
            dim: 16,
            layer_normalisation: true,
            ..Default::default()
        };
        std::fs::write(&path, options.to_json().unwrap()).unwrap();

        let loaded = ModelOptions::load_json(&path).unwrap();
        assert_eq!(loaded, options);
        std::fs::remove_file(&path).ok();
    }
}
