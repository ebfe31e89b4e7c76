use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ml::{options::ModelOptions, Linear, NodeValue, RngStrategy, RNG};

/// Where the `1 / keep` rescaling of dropout happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropoutScaling {
    /// Training masks are scaled by `1 / keep`, inference uses ones.
    Inverted,
    /// Training masks are raw 0/1 draws, inference multiplies by `keep`.
    Legacy,
}

impl DropoutScaling {
    pub fn from_model_version(model_version: f64) -> Self {
        if model_version < 0.1 {
            DropoutScaling::Legacy
        } else {
            DropoutScaling::Inverted
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropoutMode {
    Training,
    Sampling,
}

/// Produces the masks of one forward pass; each mask is reused at every time step.
#[derive(Debug, Clone)]
pub struct DropoutMaskProvider {
    enabled: bool,
    mode: DropoutMode,
    scaling: DropoutScaling,
    rng: RngStrategy,
}

impl DropoutMaskProvider {
    pub fn new(mode: DropoutMode, scaling: DropoutScaling, rng: RngStrategy) -> Self {
        Self {
            enabled: true,
            mode,
            scaling,
            rng: rng.upgrade(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            mode: DropoutMode::Sampling,
            scaling: DropoutScaling::Inverted,
            rng: RngStrategy::default(),
        }
    }

    pub fn from_options(options: &ModelOptions, mode: DropoutMode, rng: RngStrategy) -> Self {
        if !options.use_dropout {
            return Self::disabled();
        }
        let scaling = DropoutScaling::from_model_version(options.model_version);
        debug!(?mode, ?scaling, "configured dropout");
        Self::new(mode, scaling, rng)
    }

    pub fn mode(&self) -> DropoutMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `count` independent `[rows, cols]` masks for dropout probability `p`.
    pub fn masks(&self, rows: usize, cols: usize, p: NodeValue, count: usize) -> Result<Vec<Linear>> {
        (0..count).map(|_| self.mask(rows, cols, p)).collect()
    }

    pub fn mask(&self, rows: usize, cols: usize, p: NodeValue) -> Result<Linear> {
        if !(0.0..1.0).contains(&p) {
            return Err(anyhow!("dropout probability must lie in [0, 1), got {p}"));
        }
        if !self.enabled || p == 0.0 {
            return Ok(Linear::with_value(rows, cols, 1.0));
        }
        let keep = 1.0 - p;

        match (self.mode, self.scaling) {
            (DropoutMode::Sampling, DropoutScaling::Inverted) => {
                Ok(Linear::with_value(rows, cols, 1.0))
            }
            (DropoutMode::Sampling, DropoutScaling::Legacy) => {
                Ok(Linear::with_value(rows, cols, keep))
            }
            (DropoutMode::Training, scaling) => {
                let scale = match scaling {
                    DropoutScaling::Inverted => 1.0 / keep,
                    DropoutScaling::Legacy => 1.0,
                };
                let draws = (0..rows * cols).map(|_| self.rng.bernoulli(keep) * scale);
                Linear::from_iter(cols, draws)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn zero_probability_and_disabled_give_ones() {
        let rng = RngStrategy::testable(1234);
        let training = DropoutMaskProvider::new(DropoutMode::Training, DropoutScaling::Inverted, rng);
        let disabled = DropoutMaskProvider::disabled();

        for provider in [&training, &disabled] {
            for (rows, cols, count) in [(1, 1, 1), (3, 5, 2), (4, 2, 6)] {
                let p = if provider.is_enabled() { 0.0 } else { 0.5 };
                let masks = provider.masks(rows, cols, p, count).unwrap();
                assert_eq!(masks.len(), count);
                for mask in masks {
                    assert_eq!(mask, Linear::with_value(rows, cols, 1.0));
                }
            }
        }
    }

    #[test]
    fn inverted_training_masks_are_rescaled() {
        let rng = RngStrategy::testable(1234);
        let provider = DropoutMaskProvider::new(DropoutMode::Training, DropoutScaling::Inverted, rng);

        let mask = provider.mask(50, 40, 0.2).unwrap();
        assert!(mask
            .values()
            .iter()
            .all(|&x| x == 0.0 || (x - 1.25).abs() < 1e-9));
        let kept = mask.values().iter().filter(|&&x| x > 0.0).count() as NodeValue;
        let ratio = kept / 2000.0;
        assert!((ratio - 0.8).abs() < 0.05, "kept ratio {ratio}");
    }

    #[test]
    fn legacy_sampling_scales_by_keep() {
        let rng = RngStrategy::testable(1234);
        let sampling = DropoutMaskProvider::new(DropoutMode::Sampling, DropoutScaling::Legacy, rng.clone());
        assert_eq!(sampling.mask(2, 3, 0.25).unwrap(), Linear::with_value(2, 3, 0.75));

        let training = DropoutMaskProvider::new(DropoutMode::Training, DropoutScaling::Legacy, rng);
        let mask = training.mask(10, 10, 0.5).unwrap();
        assert!(mask.values().iter().all(|&x| x == 0.0 || x == 1.0));
    }

    #[test]
    fn scaling_follows_model_version() {
        assert_eq!(DropoutScaling::from_model_version(0.0), DropoutScaling::Legacy);
        assert_eq!(DropoutScaling::from_model_version(0.1), DropoutScaling::Inverted);

        let options = ModelOptions::default();
        let provider = DropoutMaskProvider::from_options(&options, DropoutMode::Training, RngStrategy::testable(1));
        assert!(!provider.is_enabled());
    }

    #[test]
    fn invalid_probability_is_rejected() {
        let provider = DropoutMaskProvider::disabled();
        assert!(provider.mask(1, 1, 1.0).is_err());
        assert!(provider.mask(1, 1, -0.1).is_err());
    }
}
