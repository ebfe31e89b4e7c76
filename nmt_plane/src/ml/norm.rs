use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{Linear, NodeValue, Sequence};

pub const NORM_EPSILON: NodeValue = 1e-5;

/// Learned shift and scale applied after standardizing each feature row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNormalization {
    shift: Linear,
    scale: Linear,
}

impl LayerNormalization {
    pub fn new(shift: Linear, scale: Linear) -> Result<Self> {
        if shift.count() != 1 || shift.shape() != scale.shape() {
            return Err(anyhow!(
                "layer norm expects matching row vectors, got shift={:?} scale={:?}",
                shift.shape(),
                scale.shape()
            ));
        }
        Ok(Self { shift, scale })
    }

    pub fn identity(width: usize) -> Self {
        Self {
            shift: Linear::with_value(1, width, 0.0),
            scale: Linear::with_value(1, width, 1.0),
        }
    }

    pub fn width(&self) -> usize {
        self.shift.stride()
    }

    pub fn forward(&self, input: &Linear) -> Result<Linear> {
        let stride = input.stride();
        if stride != self.width() {
            return Err(anyhow!(
                "layer norm of width {} can not normalize features of width {stride}",
                self.width()
            ));
        }
        let count = input.count();
        let mean = input.iter().flatten_mean();
        let variance = input.iter().flatten_variance(mean.iter());

        // norm(x) = (x - mean(x)) / sqrt(var(x) + eps)
        let std_dev = variance.iter().add_scalar(NORM_EPSILON).sqrt().collect();
        let normalised_input = input
            .iter()
            .sub(mean.iter().grow(stride))
            .div(std_dev.iter().grow(stride), None)
            .collect();

        // layer_norm(x) = norm(x) * scale + shift
        let norm_scaled_shifted = normalised_input
            .iter()
            .dot_product(self.scale.iter().stack(count))
            .add(self.shift.iter().stack(count))
            .collect();

        Ok(norm_scaled_shifted)
    }

    /// Normalizes each time step independently along the feature axis.
    pub fn forward_sequence(&self, input: &Sequence) -> Result<Sequence> {
        input.map_steps(|step| self.forward(step))
    }
}

/// Applies `ln` when present, passing the input through otherwise.
pub fn maybe_layer_norm(ln: Option<&LayerNormalization>, input: Linear) -> Result<Linear> {
    match ln {
        Some(ln) => ln.forward(&input),
        None => Ok(input),
    }
}

/// Rescales each output column `j` of `weights` to have L2 norm `scale[j]`.
pub fn weight_norm(weights: &Linear, scale: &Linear) -> Result<Linear> {
    if scale.shape() != (1, weights.stride()) {
        return Err(anyhow!(
            "weight norm scale of shape {:?} does not match weights of shape {:?}",
            scale.shape(),
            weights.shape()
        ));
    }
    let column_norms = weights
        .iter()
        .powi_scalar(2)
        .collect()
        .transpose()
        .iter()
        .flatten_sum()
        .iter()
        .add_scalar(NORM_EPSILON)
        .sqrt()
        .collect()
        .transpose();

    let count = weights.count();
    Ok(weights
        .iter()
        .dot_product(scale.iter().stack(count))
        .div(column_norms.iter().stack(count), None)
        .collect())
}
