use anyhow::{anyhow, Result};

use crate::ml::{
    norm::{maybe_layer_norm, LayerNormalization},
    params::{ParamScope, Projection},
    Linear, NetworkActivationMode, Sequence,
};

use super::{RecurrentKind, RecurrentState};

/// Where a sub-step's own bias enters the pre-activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BiasPlacement {
    /// Inputs are supplied externally, the sub-step carries no bias.
    Absent,
    /// `LN(h·U + b)`
    BeforeNorm,
    /// `LN(h·U) + b`
    AfterNorm,
}

/// Weights of one gated sub-step `h_prev -> h` of a GRU or LSTM.
#[derive(Debug, Clone)]
pub(crate) struct Transition {
    kind: RecurrentKind,
    gates: Linear,
    gates_ln: Option<LayerNormalization>,
    candidate: Linear,
    candidate_ln: Option<LayerNormalization>,
    bias: Option<(Linear, Linear)>,
    placement: BiasPlacement,
}

impl Transition {
    pub fn load(
        scope: &ParamScope,
        kind: RecurrentKind,
        dim: usize,
        gates: Projection,
        candidate: Projection,
        placement: BiasPlacement,
    ) -> Result<Self> {
        let bias = match placement {
            BiasPlacement::Absent => None,
            _ => Some((scope.bias(gates)?, scope.bias(candidate)?)),
        };
        let transition = Self {
            kind,
            gates: scope.weight(gates)?,
            gates_ln: scope.layer_norm(gates)?,
            candidate: scope.weight(candidate)?,
            candidate_ln: scope.layer_norm(candidate)?,
            bias,
            placement,
        };
        let gate_width = kind.gate_count() * dim;
        if transition.gates.shape() != (dim, gate_width)
            || transition.candidate.shape() != (dim, dim)
        {
            return Err(anyhow!(
                "transition {gates:?} expects [{dim}, {gate_width}] and [{dim}, {dim}] weights, got {:?} and {:?}",
                transition.gates.shape(),
                transition.candidate.shape()
            ));
        }
        Ok(transition)
    }

    fn pre_activation(
        &self,
        hidden: &Linear,
        dropout: &Linear,
        weights: &Linear,
        ln: Option<&LayerNormalization>,
        bias: Option<&Linear>,
        input: Option<&Linear>,
    ) -> Result<Linear> {
        let projected = hadamard(hidden, dropout).matrix_product(weights);
        let mut preact = match (self.placement, bias) {
            (BiasPlacement::BeforeNorm, Some(bias)) => {
                maybe_layer_norm(ln, add_row(&projected, bias))?
            }
            (BiasPlacement::AfterNorm, Some(bias)) => {
                add_row(&maybe_layer_norm(ln, projected)?, bias)
            }
            _ => maybe_layer_norm(ln, projected)?,
        };
        if let Some(input) = input {
            preact = add(&preact, input)?;
        }
        Ok(preact)
    }

    /// One sub-step; `inputs` are the already normalized external pre-activations.
    pub fn step(
        &self,
        prev: &RecurrentState,
        inputs: (Option<&Linear>, Option<&Linear>),
        dropout: (&Linear, &Linear),
        step_mask: Option<&Linear>,
    ) -> Result<RecurrentState> {
        let (gate_bias, candidate_bias) = match &self.bias {
            Some((gates, candidate)) => (Some(gates), Some(candidate)),
            None => (None, None),
        };
        let h = &prev.hidden;

        let preact = self.pre_activation(
            h,
            dropout.0,
            &self.gates,
            self.gates_ln.as_ref(),
            gate_bias,
            inputs.0,
        )?;
        let gates = NetworkActivationMode::Sigmoid.apply(&preact).split(self.kind.gate_count());

        let next = match self.kind {
            RecurrentKind::Gru => {
                let (reset, update) = (&gates[0], &gates[1]);
                let recurrent = self.pre_activation(
                    h,
                    dropout.1,
                    &self.candidate,
                    self.candidate_ln.as_ref(),
                    candidate_bias.filter(|_| self.placement == BiasPlacement::BeforeNorm),
                    None,
                )?;
                // the reset gate only scales the recurrent contribution
                let mut preactx = hadamard(&recurrent, reset);
                if let (BiasPlacement::AfterNorm, Some(bias)) = (self.placement, candidate_bias) {
                    preactx = add_row(&preactx, bias);
                }
                if let Some(input) = inputs.1 {
                    preactx = add(&preactx, input)?;
                }
                let candidate = NetworkActivationMode::Tanh.apply(&preactx);

                // h = u * h_prev + (1 - u) * h~
                let hidden = update
                    .iter()
                    .dot_product(h.iter())
                    .add(
                        update
                            .iter()
                            .multiply_scalar(-1.0)
                            .add_scalar(1.0)
                            .dot_product(candidate.iter()),
                    )
                    .collect();
                RecurrentState { hidden, cell: None }
            }
            RecurrentKind::Lstm => {
                let (input_gate, forget_gate, output_gate) = (&gates[0], &gates[1], &gates[2]);
                let prev_cell = prev
                    .cell
                    .as_ref()
                    .ok_or_else(|| anyhow!("lstm transition requires a previous cell state"))?;
                let preactx = self.pre_activation(
                    h,
                    dropout.1,
                    &self.candidate,
                    self.candidate_ln.as_ref(),
                    candidate_bias,
                    inputs.1,
                )?;
                let candidate = NetworkActivationMode::Tanh.apply(&preactx);

                let cell: Linear = forget_gate
                    .iter()
                    .dot_product(prev_cell.iter())
                    .add(input_gate.iter().dot_product(candidate.iter()))
                    .collect();
                let hidden = output_gate
                    .iter()
                    .dot_product(cell.iter().map(|x| x.tanh()))
                    .collect();
                RecurrentState {
                    hidden,
                    cell: Some(cell),
                }
            }
        };

        match step_mask {
            Some(mask) => apply_step_mask(next, prev, mask),
            None => Ok(next),
        }
    }
}

/// Input-to-hidden projections `x·W + b` and `x·Wx + bx`, evaluated ahead of the scan.
#[derive(Debug, Clone)]
pub(crate) struct InputProjection {
    gates: Linear,
    gates_bias: Linear,
    gates_ln: Option<LayerNormalization>,
    candidate: Linear,
    candidate_bias: Linear,
    candidate_ln: Option<LayerNormalization>,
    gates_dropout: Linear,
    candidate_dropout: Linear,
}

impl InputProjection {
    pub fn load(scope: &ParamScope, gates_dropout: Linear, candidate_dropout: Linear) -> Result<Self> {
        Ok(Self {
            gates: scope.weight(Projection::InputGates)?,
            gates_bias: scope.bias(Projection::InputGates)?,
            gates_ln: scope.layer_norm(Projection::InputGates)?,
            candidate: scope.weight(Projection::InputCandidate)?,
            candidate_bias: scope.bias(Projection::InputCandidate)?,
            candidate_ln: scope.layer_norm(Projection::InputCandidate)?,
            gates_dropout,
            candidate_dropout,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.gates.count()
    }

    pub fn project(&self, input: &Sequence) -> Result<(Sequence, Sequence)> {
        if input.feature_dim() != self.input_dim() {
            return Err(anyhow!(
                "layer expects inputs of dim {}, got shape {:?}",
                self.input_dim(),
                input.shape()
            ));
        }
        if input.batch_size() != self.gates_dropout.count() {
            return Err(anyhow!(
                "layer prepared for batch of {}, got shape {:?}",
                self.gates_dropout.count(),
                input.shape()
            ));
        }
        let gates = input
            .mask_features(&self.gates_dropout)?
            .project(&self.gates, Some(&self.gates_bias))?;
        let candidate = input
            .mask_features(&self.candidate_dropout)?
            .project(&self.candidate, Some(&self.candidate_bias))?;

        let gates = match &self.gates_ln {
            Some(ln) => ln.forward_sequence(&gates)?,
            None => gates,
        };
        let candidate = match &self.candidate_ln {
            Some(ln) => ln.forward_sequence(&candidate)?,
            None => candidate,
        };
        Ok((gates, candidate))
    }
}

/// Keeps `prev` wherever the `[batch, 1]` mask is zero.
pub(crate) fn apply_step_mask(
    next: RecurrentState,
    prev: &RecurrentState,
    mask: &Linear,
) -> Result<RecurrentState> {
    let hidden = blend(&next.hidden, &prev.hidden, mask)?;
    let cell = match (&next.cell, &prev.cell) {
        (Some(next), Some(prev)) => Some(blend(next, prev, mask)?),
        (None, None) => None,
        _ => return Err(anyhow!("mismatched recurrent state kinds")),
    };
    Ok(RecurrentState { hidden, cell })
}

fn blend(next: &Linear, prev: &Linear, mask: &Linear) -> Result<Linear> {
    if mask.shape() != (next.count(), 1) {
        return Err(anyhow!(
            "step mask of shape {:?} does not match batch of {}",
            mask.shape(),
            next.count()
        ));
    }
    let values = next
        .rows_iter()
        .zip(prev.rows_iter())
        .zip(mask.values())
        .flat_map(|((next, prev), &m)| {
            next.iter().zip(prev).map(move |(x, p)| match m {
                m if m == 0.0 => *p,
                m if m == 1.0 => *x,
                m => m * x + (1.0 - m) * p,
            })
        });
    Linear::from_iter(next.stride(), values)
}

/// Column `t` of a `[time, batch]` mask as a `[batch, 1]` matrix.
pub(crate) fn step_mask(mask: Option<&Linear>, t: usize) -> Result<Option<Linear>> {
    mask.map(|mask| Linear::from_iter(1, mask.row(t).iter().copied()))
        .transpose()
}

pub(crate) fn hadamard(lhs: &Linear, rhs: &Linear) -> Linear {
    lhs.iter().dot_product(rhs.iter()).collect()
}

pub(crate) fn add(lhs: &Linear, rhs: &Linear) -> Result<Linear> {
    if lhs.shape() != rhs.shape() {
        return Err(anyhow!(
            "can not add matrices of shape {:?} and {:?}",
            lhs.shape(),
            rhs.shape()
        ));
    }
    Ok(lhs.iter().add(rhs.iter()).collect())
}

pub(crate) fn add_row(lhs: &Linear, row: &Linear) -> Linear {
    lhs.iter().add(row.iter().stack(lhs.count())).collect()
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn step_mask_keeps_previous_rows_exactly() {
        let prev = RecurrentState {
            hidden: "0.1 0.2
                     0.3 0.4"
                .parse()
                .unwrap(),
            cell: Some(Linear::with_value(2, 2, 7.0)),
        };
        let next = RecurrentState {
            hidden: Linear::with_value(2, 2, 9.0),
            cell: Some(Linear::with_value(2, 2, -1.0)),
        };
        let mask: Linear = "1
                            0"
        .parse()
        .unwrap();

        let masked = apply_step_mask(next, &prev, &mask).unwrap();
        assert_eq!(masked.hidden.row(0), &[9.0, 9.0]);
        assert_eq!(masked.hidden.row(1), prev.hidden.row(1));
        assert_eq!(masked.cell.as_ref().unwrap().row(1), &[7.0, 7.0]);
    }

    #[test]
    fn step_mask_column_reads_batch_entries() {
        let mask: Linear = "1 1 1
                            1 0 1"
            .parse()
            .unwrap();
        let column = step_mask(Some(&mask), 1).unwrap().unwrap();
        assert_eq!(column.shape(), (3, 1));
        assert_eq!(column.values(), &[1.0, 0.0, 1.0]);
        assert!(step_mask(None, 0).unwrap().is_none());
    }
}
