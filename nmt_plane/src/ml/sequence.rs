use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{Linear, NodeValue};

/// Time-major rank-3 tensor `(time, batch, feature)`, stored as one `[batch, feature]`
/// matrix per time step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    steps: Vec<Linear>,
}

impl Sequence {
    pub fn new(steps: Vec<Linear>) -> Result<Self> {
        let first = steps.first().context("sequence must have at least one step")?;
        let shape = first.shape();
        if let Some((idx, step)) = steps.iter().enumerate().find(|(_, x)| x.shape() != shape) {
            return Err(anyhow!(
                "mismatched shape at step {idx}: expected={shape:?}, actual={:?}",
                step.shape()
            ));
        }
        Ok(Self { steps })
    }

    pub fn zeros(len: usize, batch_size: usize, feature_dim: usize) -> Self {
        Self {
            steps: (0..len).map(|_| Linear::new(batch_size, feature_dim)).collect(),
        }
    }

    /// Builds a sequence from a flat buffer and an explicit shape, which must be rank 3.
    pub fn from_shape(shape: &[usize], values: Vec<NodeValue>) -> Result<Self> {
        let &[len, batch_size, feature_dim] = shape else {
            return Err(anyhow!(
                "context must be 3-d (positions, batch, features), got rank {}",
                shape.len()
            ));
        };
        if values.len() != len * batch_size * feature_dim {
            return Err(anyhow!(
                "buffer of {} values does not match shape {shape:?}",
                values.len()
            ));
        }
        if len == 0 || batch_size == 0 || feature_dim == 0 {
            return Err(anyhow!("sequence shape {shape:?} has an empty axis"));
        }
        let steps = values
            .chunks_exact(batch_size * feature_dim)
            .map(|chunk| Linear::from_iter(feature_dim, chunk.iter().copied()))
            .collect::<Result<Vec<_>>>()?;

        Self::new(steps)
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.len(), self.batch_size(), self.feature_dim()]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.steps.first().map(|x| x.count()).unwrap_or_default()
    }

    pub fn feature_dim(&self) -> usize {
        self.steps.first().map(|x| x.stride()).unwrap_or_default()
    }

    pub fn step(&self, t: usize) -> &Linear {
        &self.steps[t]
    }

    pub fn steps(&self) -> &[Linear] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<Linear> {
        self.steps
    }

    pub fn map_steps<F: Fn(&Linear) -> Result<Linear>>(&self, func: F) -> Result<Self> {
        let steps = self.steps.iter().map(func).collect::<Result<Vec<_>>>()?;
        Self::new(steps)
    }

    /// `x·W + b` applied independently at every time step.
    pub fn project(&self, weights: &Linear, bias: Option<&Linear>) -> Result<Self> {
        if self.feature_dim() != weights.count() {
            return Err(anyhow!(
                "can not project features of dim {} with weights of shape {:?}",
                self.feature_dim(),
                weights.shape()
            ));
        }
        self.map_steps(|step| {
            let projected = step.matrix_product(weights);
            match bias {
                Some(bias) => Ok(projected
                    .iter()
                    .add(bias.iter().stack(projected.count()))
                    .collect()),
                None => Ok(projected),
            }
        })
    }

    pub fn reversed(&self) -> Self {
        Self {
            steps: self.steps.iter().rev().cloned().collect(),
        }
    }

    pub fn concat_features(&self, rhs: &Sequence) -> Result<Self> {
        if self.len() != rhs.len() || self.batch_size() != rhs.batch_size() {
            return Err(anyhow!(
                "can not concat sequences of shape {:?} and {:?}",
                self.shape(),
                rhs.shape()
            ));
        }
        let steps = self
            .steps
            .iter()
            .zip(&rhs.steps)
            .map(|(lhs, rhs)| lhs.concat(rhs).collect())
            .collect();
        Self::new(steps)
    }

    pub fn slice_features(&self, start: usize, width: usize) -> Self {
        Self {
            steps: self
                .steps
                .iter()
                .map(|step| step.slice_columns(start, width))
                .collect(),
        }
    }

    /// Multiplies every step by the same `[batch, feature]` dropout mask.
    pub fn mask_features(&self, mask: &Linear) -> Result<Self> {
        if mask.shape() != (self.batch_size(), self.feature_dim()) {
            return Err(anyhow!(
                "dropout mask of shape {:?} does not match steps of {:?}",
                mask.shape(),
                (self.batch_size(), self.feature_dim())
            ));
        }
        self.map_steps(|step| Ok(step.iter().dot_product(mask.iter()).collect()))
    }

    pub fn add(&self, rhs: &Sequence) -> Result<Self> {
        if self.shape() != rhs.shape() {
            return Err(anyhow!(
                "can not add sequences of shape {:?} and {:?}",
                self.shape(),
                rhs.shape()
            ));
        }
        let steps = self
            .steps
            .iter()
            .zip(&rhs.steps)
            .map(|(lhs, rhs)| lhs.iter().add(rhs.iter()).collect())
            .collect();
        Self::new(steps)
    }

    /// Mean over time of the valid positions, `mask` being `[time, batch]`.
    pub fn masked_mean(&self, mask: &Linear) -> Result<Linear> {
        if mask.shape() != (self.len(), self.batch_size()) {
            return Err(anyhow!(
                "mask of shape {:?} does not match sequence {:?}",
                mask.shape(),
                self.shape()
            ));
        }
        let mut sum = Linear::new(self.batch_size(), self.feature_dim());
        for (t, step) in self.steps.iter().enumerate() {
            let step_mask = Linear::from_iter(1, mask.row(t).iter().copied())?;
            let masked = step
                .iter()
                .dot_product(step_mask.iter().grow(self.feature_dim()))
                .collect();
            sum = sum.iter().add(masked.iter()).collect();
        }
        let counts = mask.transpose().iter().flatten_sum();
        Ok(sum
            .iter()
            .div(counts.iter().grow(self.feature_dim()), None)
            .collect())
    }

    /// Shifts the sequence one step later in time, inserting zeros at the start.
    pub fn shifted_right(&self) -> Self {
        let mut steps = Vec::with_capacity(self.len());
        steps.push(Linear::new(self.batch_size(), self.feature_dim()));
        steps.extend(self.steps.iter().take(self.len().saturating_sub(1)).cloned());
        Self { steps }
    }
}
