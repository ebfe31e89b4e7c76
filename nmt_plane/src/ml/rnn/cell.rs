use anyhow::{anyhow, Result};
use tracing::instrument;

use crate::ml::{
    dropout::DropoutMaskProvider,
    init::ParamInitializer,
    params::{ParameterSet, Projection},
    Linear, RngStrategy, Sequence,
};

use super::{
    scan::{scan, scan_one, Step},
    transition::{step_mask, BiasPlacement, InputProjection, Transition},
    DropoutRates, LayerConfig, LayerKind, RecurrentKind, RecurrentState,
};

/// Plain GRU/LSTM layer with optional deep transitions between time steps.
#[derive(Debug, Clone)]
pub struct RecurrentLayer {
    config: LayerConfig,
    kind: RecurrentKind,
}

/// Weights and dropout masks of one forward pass.
#[derive(Debug, Clone)]
pub struct PreparedRecurrent {
    kind: RecurrentKind,
    dim: usize,
    input: InputProjection,
    transitions: Vec<Transition>,
    rec_dropout: Vec<Linear>,
}

impl RecurrentLayer {
    pub fn new(config: LayerConfig) -> Result<Self> {
        match config.kind() {
            LayerKind::Recurrent(kind) => Ok(Self { config, kind }),
            other => Err(anyhow!("can not build recurrent layer from {other:?} config")),
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn kind(&self) -> RecurrentKind {
        self.kind
    }

    pub fn init_params(&self, params: &mut ParameterSet, rng: &RngStrategy) -> Result<()> {
        let config = &self.config;
        let (nin, dim) = (config.input_dim(), config.hidden_dim());
        let gates = self.kind.gate_count();
        let mut init = ParamInitializer::new(params, config.id(), rng)
            .with_normalisation(config.layer_norm(), config.weight_norm());

        init.weight_blocks(Projection::InputGates, nin, dim, gates, config.ortho())?;
        init.bias(Projection::InputGates, gates * dim)?;
        init.weight(Projection::InputCandidate, nin, dim, config.ortho())?;
        init.bias(Projection::InputCandidate, dim)?;
        init.layer_norm(Projection::InputGates, gates * dim)?;
        init.layer_norm(Projection::InputCandidate, dim)?;

        for depth in 0..config.transition_depth() {
            let (gate_proj, candidate_proj) = (
                Projection::RecurrentGates { depth },
                Projection::RecurrentCandidate { depth },
            );
            init.weight_blocks(gate_proj, dim, dim, gates, true)?;
            init.weight(candidate_proj, dim, dim, true)?;
            init.layer_norm(gate_proj, gates * dim)?;
            init.layer_norm(candidate_proj, dim)?;
            if depth > 0 {
                init.bias(gate_proj, gates * dim)?;
                init.bias(candidate_proj, dim)?;
            }
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(layer = %self.config.id()))]
    pub fn prepare(
        &self,
        params: &ParameterSet,
        batch_size: usize,
        dropout: &DropoutMaskProvider,
        rates: DropoutRates,
    ) -> Result<PreparedRecurrent> {
        let config = &self.config;
        let (nin, dim) = (config.input_dim(), config.hidden_dim());
        let scope = params
            .scope(config.id())
            .with_normalisation(config.layer_norm(), config.weight_norm());

        let mut below = dropout.masks(batch_size, nin, rates.below, 2)?.into_iter();
        let rec_dropout = dropout.masks(batch_size, dim, rates.rec, 2 * config.transition_depth())?;
        let input = match (below.next(), below.next()) {
            (Some(gates_dropout), Some(candidate_dropout)) => {
                InputProjection::load(&scope, gates_dropout, candidate_dropout)?
            }
            _ => return Err(anyhow!("missing input dropout masks")),
        };

        let transitions = (0..config.transition_depth())
            .map(|depth| {
                let placement = if depth == 0 {
                    BiasPlacement::Absent
                } else {
                    BiasPlacement::AfterNorm
                };
                Transition::load(
                    &scope,
                    self.kind,
                    dim,
                    Projection::RecurrentGates { depth },
                    Projection::RecurrentCandidate { depth },
                    placement,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PreparedRecurrent {
            kind: self.kind,
            dim,
            input,
            transitions,
            rec_dropout,
        })
    }

    /// Runs the layer over `input`, returning the packed state at every step.
    pub fn forward(
        &self,
        prepared: &PreparedRecurrent,
        input: &Sequence,
        mask: Option<&Linear>,
        init: Option<&Linear>,
    ) -> Result<Sequence> {
        let batch_size = input.batch_size();
        if let Some(mask) = mask {
            if mask.shape() != (input.len(), batch_size) {
                return Err(anyhow!(
                    "mask of shape {:?} does not match input {:?}",
                    mask.shape(),
                    input.shape()
                ));
            }
        }
        let init = match init {
            Some(packed) => RecurrentState::unpack(self.kind, packed, prepared.dim)?,
            None => RecurrentState::zeros(self.kind, batch_size, prepared.dim),
        };

        let (gates, candidate) = prepared.input.project(input)?;
        let steps = RecurrentSteps {
            prepared,
            gates,
            candidate,
            mask,
        };
        let output = scan(&steps, init)?;
        Sequence::new(output.outputs)
    }

    /// Advances one time step from the packed state `prev`.
    pub fn forward_one(
        &self,
        prepared: &PreparedRecurrent,
        input: &Linear,
        prev: Option<&Linear>,
    ) -> Result<Linear> {
        let prev = prev
            .map(|packed| RecurrentState::unpack(prepared.kind, packed, prepared.dim))
            .transpose()?;
        let (gates, candidate) = prepared.input.project(&Sequence::new(vec![input.clone()])?)?;
        let steps = RecurrentSteps {
            prepared,
            gates,
            candidate,
            mask: None,
        };
        let (_, output) = scan_one(&steps, 0, prev.as_ref())?;
        Ok(output)
    }
}

struct RecurrentSteps<'a> {
    prepared: &'a PreparedRecurrent,
    gates: Sequence,
    candidate: Sequence,
    mask: Option<&'a Linear>,
}

impl<'a> Step for RecurrentSteps<'a> {
    type State = RecurrentState;
    type Output = Linear;

    fn len(&self) -> usize {
        self.gates.len()
    }

    fn step(&self, t: usize, state: &RecurrentState) -> Result<(RecurrentState, Linear)> {
        let m = step_mask(self.mask, t)?;
        let rec = &self.prepared.rec_dropout;
        let mut next = state.clone();

        for (depth, transition) in self.prepared.transitions.iter().enumerate() {
            let inputs = if depth == 0 {
                (Some(self.gates.step(t)), Some(self.candidate.step(t)))
            } else {
                (None, None)
            };
            next = transition.step(
                &next,
                inputs,
                (&rec[2 * depth], &rec[2 * depth + 1]),
                m.as_ref(),
            )?;
        }
        let packed = next.packed();
        Ok((next, packed))
    }
}
