use serde::{Deserialize, Serialize};

pub use layer::{LayerInitStrategy, LayerValues, NodeValue};

use super::linear::Linear;

pub mod layer;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NetworkActivationMode {
    Linear,
    SoftMax,
    Sigmoid,
    Tanh,
    RelU,
}

impl std::fmt::Display for NetworkActivationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(&self).map_err(|_| std::fmt::Error::default())?;
        let json = json.trim_matches('"');
        write!(f, "{}", json)
    }
}

impl NetworkActivationMode {
    /// Applies the activation element-wise, or row-wise for `SoftMax`.
    pub fn apply(&self, output: &Linear) -> Linear {
        match self {
            NetworkActivationMode::Linear => output.clone(),
            NetworkActivationMode::SoftMax => output.iter().softmax(),
            NetworkActivationMode::Sigmoid => output.iter().map(Self::sigmoid).collect(),
            NetworkActivationMode::Tanh => output.iter().map(|x| x.tanh()).collect(),
            NetworkActivationMode::RelU => output.iter().map(|x| x.max(0.0)).collect(),
        }
    }

    pub fn sigmoid(x: NodeValue) -> NodeValue {
        1.0 / (1.0 + (-x).exp())
    }
}

impl Default for NetworkActivationMode {
    fn default() -> Self {
        Self::Tanh
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn softmax_rows_sum_to_one() {
        let logits = Linear::from_iter(3, [1.0, 2.0, 3.0, -1.0, 0.0, 1.0].into_iter()).unwrap();
        let probs = NetworkActivationMode::SoftMax.apply(&logits);

        for row in probs.rows_iter() {
            let sum: NodeValue = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!(probs.get(0, 2) > probs.get(0, 1));
    }

    #[test]
    fn activations_can_be_displayed() {
        assert_eq!(NetworkActivationMode::Tanh.to_string(), "Tanh");
        assert_eq!(NetworkActivationMode::RelU.to_string(), "RelU");
    }

    #[test]
    fn sigmoid_is_centered() {
        let input = Linear::from_iter(2, [0.0, 100.0].into_iter()).unwrap();
        let output = NetworkActivationMode::Sigmoid.apply(&input);

        assert_eq!(output.get(0, 0), 0.5);
        assert!((output.get(0, 1) - 1.0).abs() < 1e-9);
    }
}
