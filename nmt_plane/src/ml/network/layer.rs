use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::ml::{RngStrategy, RNG};

#[cfg(not(feature = "short_floats"))]
pub type NodeValue = f64;

#[cfg(feature = "short_floats")]
pub type NodeValue = f32;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerValues(Vec<NodeValue>);

impl<T> From<T> for LayerValues
where
    T: AsRef<[NodeValue]>,
{
    fn from(value: T) -> Self {
        Self(value.as_ref().to_vec())
    }
}

impl FromIterator<NodeValue> for LayerValues {
    fn from_iter<T: IntoIterator<Item = NodeValue>>(iter: T) -> Self {
        LayerValues(iter.into_iter().collect())
    }
}

impl Deref for LayerValues {
    type Target = Vec<NodeValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LayerValues {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl LayerValues {
    pub fn new(inner: Vec<NodeValue>) -> Self {
        Self(inner)
    }

    pub fn ave(&self) -> NodeValue {
        if !self.is_empty() {
            self.iter().sum::<NodeValue>() / self.len() as NodeValue
        } else {
            0.0
        }
    }
}

/// Element-wise fill rules for freshly allocated parameter tensors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerInitStrategy {
    Constant(NodeValue),
    Normal { scale: NodeValue },
}

impl LayerInitStrategy {
    /// Scale of the gaussian used for non-orthogonal weight matrices.
    pub const NORM_WEIGHT_SCALE: NodeValue = 0.01;

    pub fn apply<'a>(&self, values: impl Iterator<Item = &'a mut NodeValue>, rng: &RngStrategy) {
        match self {
            LayerInitStrategy::Constant(constant) => {
                for value in values {
                    *value = *constant;
                }
            }
            LayerInitStrategy::Normal { scale } => {
                for value in values {
                    *value = rng.rand_normal() * scale;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_init_constant_fills_all_values() {
        let rng = RngStrategy::testable(1234);
        let mut values = vec![0.0; 6];
        LayerInitStrategy::Constant(1.0).apply(values.iter_mut(), &rng);

        assert!(values.iter().all(|&x| x == 1.0));
    }

    #[test]
    fn layer_init_normal_respects_scale() {
        let rng = RngStrategy::testable(1234);
        let mut values = vec![0.0; 1000];
        LayerInitStrategy::Normal { scale: 0.01 }.apply(values.iter_mut(), &rng);

        let values = LayerValues::new(values);
        let max_abs = values.iter().fold(0.0 as NodeValue, |acc, x| acc.max(x.abs()));
        assert!(max_abs < 0.1, "scaled gaussian too wide: {max_abs}");
        assert!(values.ave().abs() < 0.005);
    }
}
