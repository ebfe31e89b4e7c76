use anyhow::{anyhow, Result};
use tracing::instrument;

use crate::ml::{
    dropout::DropoutMaskProvider,
    init::ParamInitializer,
    norm::{maybe_layer_norm, LayerNormalization},
    params::{ParamScope, ParameterSet, Projection},
    Linear, RngStrategy, Sequence,
};

use super::{
    attention::{Attention, ProjectedContext},
    scan::{scan, scan_one, Step},
    transition::{hadamard, step_mask, BiasPlacement, InputProjection, Transition},
    DropoutRates, LayerConfig, LayerKind, RecurrentKind, RecurrentState,
};

/// Encoder annotations attended by a conditional layer, `mask` being `[src_len, batch]`.
#[derive(Debug, Clone, Copy)]
pub struct ContextInput<'a> {
    pub context: &'a Sequence,
    pub mask: Option<&'a Linear>,
}

/// Recurrent decoder layer attending over one encoder context.
#[derive(Debug, Clone)]
pub struct ConditionalLayer {
    config: LayerConfig,
    kind: RecurrentKind,
}

/// Recurrent decoder layer attending over two encoder contexts.
///
/// Only the first context vector feeds the deep transition and is returned per step.
#[derive(Debug, Clone)]
pub struct DoubleConditionalLayer {
    config: LayerConfig,
    kind: RecurrentKind,
}

#[derive(Debug, Clone)]
pub struct ConditionalStep {
    pub state: Linear,
    pub context: Linear,
    pub attention: Linear,
    pub attention2: Option<Linear>,
}

#[derive(Debug, Clone)]
pub struct ConditionalOutput {
    pub states: Sequence,
    pub contexts: Sequence,
    pub attention: Sequence,
    pub attention2: Option<Sequence>,
}

#[derive(Debug, Clone)]
struct PreparedSource {
    attention: Attention,
    context: Sequence,
    mask: Option<Linear>,
    projected: ProjectedContext,
    score_dropout: Linear,
}

#[derive(Debug, Clone)]
struct ContextProjection {
    gates: Linear,
    gates_ln: Option<LayerNormalization>,
    candidate: Linear,
    candidate_ln: Option<LayerNormalization>,
    gates_dropout: Linear,
    candidate_dropout: Linear,
}

/// Weights, projected contexts and dropout masks of one forward pass.
#[derive(Debug, Clone)]
pub struct PreparedConditional {
    kind: RecurrentKind,
    dim: usize,
    input: InputProjection,
    first: Transition,
    deep: Vec<Transition>,
    context_projection: Option<ContextProjection>,
    sources: Vec<PreparedSource>,
    rec_dropout: Vec<Linear>,
}

impl ConditionalLayer {
    pub fn new(config: LayerConfig) -> Result<Self> {
        match config.kind() {
            LayerKind::Conditional(kind) => Ok(Self { config, kind }),
            other => Err(anyhow!("can not build conditional layer from {other:?} config")),
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn init_params(&self, params: &mut ParameterSet, rng: &RngStrategy) -> Result<()> {
        init_conditional(&self.config, self.kind, &[None], params, rng)
    }

    #[instrument(level = "debug", skip_all, fields(layer = %self.config.id()))]
    pub fn prepare(
        &self,
        params: &ParameterSet,
        context: ContextInput,
        dropout: &DropoutMaskProvider,
        rates: DropoutRates,
    ) -> Result<PreparedConditional> {
        prepare_conditional(&self.config, self.kind, params, &[(None, context)], dropout, rates)
    }

    pub fn forward(
        &self,
        prepared: &PreparedConditional,
        input: &Sequence,
        mask: Option<&Linear>,
        init: Option<&Linear>,
    ) -> Result<ConditionalOutput> {
        prepared.forward(input, mask, init)
    }

    pub fn forward_one(
        &self,
        prepared: &PreparedConditional,
        input: &Linear,
        prev: Option<&Linear>,
    ) -> Result<ConditionalStep> {
        prepared.forward_one(input, prev)
    }
}

impl DoubleConditionalLayer {
    pub fn new(config: LayerConfig) -> Result<Self> {
        match config.kind() {
            LayerKind::DoubleConditional(kind) => Ok(Self { config, kind }),
            other => Err(anyhow!("can not build dual conditional layer from {other:?} config")),
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn init_params(&self, params: &mut ParameterSet, rng: &RngStrategy) -> Result<()> {
        init_conditional(&self.config, self.kind, &[Some(1), Some(2)], params, rng)
    }

    #[instrument(level = "debug", skip_all, fields(layer = %self.config.id()))]
    pub fn prepare(
        &self,
        params: &ParameterSet,
        contexts: [ContextInput; 2],
        dropout: &DropoutMaskProvider,
        rates: DropoutRates,
    ) -> Result<PreparedConditional> {
        let [first, second] = contexts;
        prepare_conditional(
            &self.config,
            self.kind,
            params,
            &[(Some(1), first), (Some(2), second)],
            dropout,
            rates,
        )
    }

    pub fn forward(
        &self,
        prepared: &PreparedConditional,
        input: &Sequence,
        mask: Option<&Linear>,
        init: Option<&Linear>,
    ) -> Result<ConditionalOutput> {
        prepared.forward(input, mask, init)
    }

    pub fn forward_one(
        &self,
        prepared: &PreparedConditional,
        input: &Linear,
        prev: Option<&Linear>,
    ) -> Result<ConditionalStep> {
        prepared.forward_one(input, prev)
    }
}

fn context_dim(config: &LayerConfig) -> Result<usize> {
    config
        .context_dim()
        .ok_or_else(|| anyhow!("conditional layer '{}' has no context dimension", config.id()))
}

fn init_conditional(
    config: &LayerConfig,
    kind: RecurrentKind,
    sources: &[Option<u8>],
    params: &mut ParameterSet,
    rng: &RngStrategy,
) -> Result<()> {
    let (nin, dim, dimctx) = (config.input_dim(), config.hidden_dim(), context_dim(config)?);
    let gates = kind.gate_count();
    let mut init = ParamInitializer::new(params, config.id(), rng)
        .with_normalisation(config.layer_norm(), config.weight_norm());

    init.weight_blocks(Projection::InputGates, nin, dim, gates, config.ortho())?;
    init.bias(Projection::InputGates, gates * dim)?;
    init.weight(Projection::InputCandidate, nin, dim, config.ortho())?;
    init.bias(Projection::InputCandidate, dim)?;
    init.layer_norm(Projection::InputGates, gates * dim)?;
    init.layer_norm(Projection::InputCandidate, dim)?;

    let (gate_proj, candidate_proj) = (
        Projection::RecurrentGates { depth: 0 },
        Projection::RecurrentCandidate { depth: 0 },
    );
    init.weight_blocks(gate_proj, dim, dim, gates, true)?;
    init.weight(candidate_proj, dim, dim, true)?;
    init.layer_norm(gate_proj, gates * dim)?;
    init.layer_norm(candidate_proj, dim)?;

    let with_score_bias = sources.len() == 1;
    for source in sources {
        Attention::init_params(&mut init, *source, dim, dimctx, with_score_bias)?;
    }

    if config.transition_depth() > 1 {
        init.weight(Projection::ContextGates, dimctx, gates * dim, config.ortho())?;
        init.weight(Projection::ContextCandidate, dimctx, dim, config.ortho())?;
        init.layer_norm(Projection::ContextGates, gates * dim)?;
        init.layer_norm(Projection::ContextCandidate, dim)?;
    }
    for level in 0..config.transition_depth() - 1 {
        let (gate_proj, candidate_proj) = (
            Projection::TransitionGates { level },
            Projection::TransitionCandidate { level },
        );
        init.weight_blocks(gate_proj, dim, dim, gates, true)?;
        init.bias(gate_proj, gates * dim)?;
        init.weight(candidate_proj, dim, dim, true)?;
        init.bias(candidate_proj, dim)?;
        init.layer_norm(gate_proj, gates * dim)?;
        init.layer_norm(candidate_proj, dim)?;
    }
    Ok(())
}

fn prepare_conditional(
    config: &LayerConfig,
    kind: RecurrentKind,
    params: &ParameterSet,
    sources: &[(Option<u8>, ContextInput)],
    dropout: &DropoutMaskProvider,
    rates: DropoutRates,
) -> Result<PreparedConditional> {
    let (nin, dim, dimctx) = (config.input_dim(), config.hidden_dim(), context_dim(config)?);
    let batch_size = match sources.first() {
        Some((_, input)) => input.context.batch_size(),
        None => return Err(anyhow!("conditional layer needs at least one context")),
    };
    let scope = params
        .scope(config.id())
        .with_normalisation(config.layer_norm(), config.weight_norm());

    let mut below = dropout.masks(batch_size, nin, rates.below, 2)?;
    let gates_dropout = below.pop().ok_or_else(|| anyhow!("missing input dropout"))?;
    let candidate_dropout = below.pop().ok_or_else(|| anyhow!("missing input dropout"))?;
    let input = InputProjection::load(&scope, gates_dropout, candidate_dropout)?;

    let depth = config.transition_depth();
    let rec_dropout = dropout.masks(batch_size, dim, rates.rec, 2 + sources.len() + 2 * (depth - 1))?;

    let first = Transition::load(
        &scope,
        kind,
        dim,
        Projection::RecurrentGates { depth: 0 },
        Projection::RecurrentCandidate { depth: 0 },
        BiasPlacement::Absent,
    )?;

    let sources = sources
        .iter()
        .map(|(source, input)| prepare_source(&scope, *source, input, batch_size, dimctx, dropout, rates))
        .collect::<Result<Vec<_>>>()?;

    let context_projection = if depth > 1 {
        let mut masks = dropout.masks(batch_size, dimctx, rates.ctx, 2)?;
        let candidate_dropout = masks.pop().ok_or_else(|| anyhow!("missing context dropout"))?;
        let gates_dropout = masks.pop().ok_or_else(|| anyhow!("missing context dropout"))?;
        Some(ContextProjection {
            gates: scope.weight(Projection::ContextGates)?,
            gates_ln: scope.layer_norm(Projection::ContextGates)?,
            candidate: scope.weight(Projection::ContextCandidate)?,
            candidate_ln: scope.layer_norm(Projection::ContextCandidate)?,
            gates_dropout,
            candidate_dropout,
        })
    } else {
        None
    };

    let deep = (0..depth - 1)
        .map(|level| {
            Transition::load(
                &scope,
                kind,
                dim,
                Projection::TransitionGates { level },
                Projection::TransitionCandidate { level },
                BiasPlacement::BeforeNorm,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PreparedConditional {
        kind,
        dim,
        input,
        first,
        deep,
        context_projection,
        sources,
        rec_dropout,
    })
}

fn prepare_source(
    scope: &ParamScope,
    source: Option<u8>,
    input: &ContextInput,
    batch_size: usize,
    dimctx: usize,
    dropout: &DropoutMaskProvider,
    rates: DropoutRates,
) -> Result<PreparedSource> {
    let context = input.context;
    if context.batch_size() != batch_size || context.feature_dim() != dimctx {
        return Err(anyhow!(
            "context {} of shape {:?} does not match batch of {batch_size} with dim {dimctx}",
            source.unwrap_or(1),
            context.shape()
        ));
    }
    if let Some(mask) = input.mask {
        if mask.shape() != (context.len(), batch_size) {
            return Err(anyhow!(
                "context mask of shape {:?} does not match context {:?}",
                mask.shape(),
                context.shape()
            ));
        }
    }

    let mut masks = dropout.masks(batch_size, dimctx, rates.ctx, 2)?;
    let score_dropout = masks.pop().ok_or_else(|| anyhow!("missing context dropout"))?;
    let context_dropout = masks.pop().ok_or_else(|| anyhow!("missing context dropout"))?;

    let attention = Attention::load(scope, source, source.is_none())?;
    let projected = attention.project_context(context, &context_dropout)?;
    Ok(PreparedSource {
        attention,
        context: context.clone(),
        mask: input.mask.cloned(),
        projected,
        score_dropout,
    })
}

impl PreparedConditional {
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn kind(&self) -> RecurrentKind {
        self.kind
    }

    pub fn batch_size(&self) -> usize {
        self.rec_dropout.first().map(|x| x.count()).unwrap_or_default()
    }

    /// Runs the decoder over `input`, `mask` being `[time, batch]`.
    pub fn forward(
        &self,
        input: &Sequence,
        mask: Option<&Linear>,
        init: Option<&Linear>,
    ) -> Result<ConditionalOutput> {
        if input.batch_size() != self.batch_size() {
            return Err(anyhow!(
                "layer prepared for batch of {}, got input {:?}",
                self.batch_size(),
                input.shape()
            ));
        }
        if let Some(mask) = mask {
            if mask.shape() != (input.len(), input.batch_size()) {
                return Err(anyhow!(
                    "mask of shape {:?} does not match input {:?}",
                    mask.shape(),
                    input.shape()
                ));
            }
        }
        let init = match init {
            Some(packed) => RecurrentState::unpack(self.kind, packed, self.dim)?,
            None => RecurrentState::zeros(self.kind, input.batch_size(), self.dim),
        };

        let (gates, candidate) = self.input.project(input)?;
        let steps = ConditionalSteps {
            prepared: self,
            gates,
            candidate,
            mask,
        };
        let output = scan(&steps, init)?;

        let mut states = Vec::with_capacity(output.outputs.len());
        let mut contexts = Vec::with_capacity(output.outputs.len());
        let mut attention = Vec::with_capacity(output.outputs.len());
        let mut attention2 = Vec::with_capacity(output.outputs.len());
        for step in output.outputs {
            states.push(step.state);
            contexts.push(step.context);
            attention.push(step.attention);
            attention2.extend(step.attention2);
        }

        Ok(ConditionalOutput {
            states: Sequence::new(states)?,
            contexts: Sequence::new(contexts)?,
            attention: Sequence::new(attention)?,
            attention2: if attention2.is_empty() {
                None
            } else {
                Some(Sequence::new(attention2)?)
            },
        })
    }

    /// Advances one step from the packed state `prev`, which must be given.
    pub fn forward_one(&self, input: &Linear, prev: Option<&Linear>) -> Result<ConditionalStep> {
        let prev = prev
            .map(|packed| RecurrentState::unpack(self.kind, packed, self.dim))
            .transpose()?;
        let (gates, candidate) = self.input.project(&Sequence::new(vec![input.clone()])?)?;
        let steps = ConditionalSteps {
            prepared: self,
            gates,
            candidate,
            mask: None,
        };
        let (_, output) = scan_one(&steps, 0, prev.as_ref())?;
        Ok(output)
    }
}

struct ConditionalSteps<'a> {
    prepared: &'a PreparedConditional,
    gates: Sequence,
    candidate: Sequence,
    mask: Option<&'a Linear>,
}

impl<'a> Step for ConditionalSteps<'a> {
    type State = RecurrentState;
    type Output = ConditionalStep;

    fn len(&self) -> usize {
        self.gates.len()
    }

    fn step(&self, t: usize, state: &RecurrentState) -> Result<(RecurrentState, ConditionalStep)> {
        let prepared = self.prepared;
        let rec = &prepared.rec_dropout;
        let m = step_mask(self.mask, t)?;

        let mut next = prepared.first.step(
            state,
            (Some(self.gates.step(t)), Some(self.candidate.step(t))),
            (&rec[0], &rec[1]),
            m.as_ref(),
        )?;

        let mut attended = prepared
            .sources
            .iter()
            .enumerate()
            .map(|(k, source)| {
                source.attention.attend(
                    &source.projected,
                    &source.context,
                    source.mask.as_ref(),
                    &next.hidden,
                    (&rec[2 + k], &source.score_dropout),
                )
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter();
        let (context, attention) = attended
            .next()
            .ok_or_else(|| anyhow!("conditional layer has no attention"))?;
        let attention2 = attended.next().map(|(_, alpha)| alpha);

        let offset = 2 + prepared.sources.len();
        for (level, transition) in prepared.deep.iter().enumerate() {
            let inputs = match (&prepared.context_projection, level) {
                (Some(projection), 0) => {
                    let gates = maybe_layer_norm(
                        projection.gates_ln.as_ref(),
                        hadamard(&context, &projection.gates_dropout).matrix_product(&projection.gates),
                    )?;
                    let candidate = maybe_layer_norm(
                        projection.candidate_ln.as_ref(),
                        hadamard(&context, &projection.candidate_dropout)
                            .matrix_product(&projection.candidate),
                    )?;
                    Some((gates, candidate))
                }
                _ => None,
            };
            let inputs = match &inputs {
                Some((gates, candidate)) => (Some(gates), Some(candidate)),
                None => (None, None),
            };
            next = transition.step(
                &next,
                inputs,
                (&rec[offset + 2 * level], &rec[offset + 2 * level + 1]),
                m.as_ref(),
            )?;
        }

        let output = ConditionalStep {
            state: next.packed(),
            context,
            attention,
            attention2,
        };
        Ok((next, output))
    }
}
