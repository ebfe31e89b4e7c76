use anyhow::{anyhow, Result};
use tracing::{debug, info, instrument};

use crate::ml::{
    data::{PreparedBatch, TokenGrid},
    dropout::DropoutMaskProvider,
    options::ModelOptions,
    params::{LayerId, ParameterSet},
    rnn::{
        cell::{PreparedRecurrent, RecurrentLayer},
        cond::{ConditionalLayer, ContextInput, DoubleConditionalLayer, PreparedConditional},
        embedding::EmbeddingLayer,
        feedforward::FeedForwardLayer,
        DropoutRates, Layer, LayerConfig, LayerKind, RecurrentKind, RecurrentState,
    },
    Linear, NetworkActivationMode, NodeValue, RngStrategy, Sequence,
};

/// Token grids (one per factor) and `[time, batch]` mask of one side of a batch.
#[derive(Debug, Clone, Copy)]
pub struct SideInput<'a> {
    pub ids: &'a [TokenGrid],
    pub mask: &'a Linear,
}

impl<'a> SideInput<'a> {
    pub fn new(ids: &'a [TokenGrid], mask: &'a Linear) -> Self {
        Self { ids, mask }
    }

    fn check(&self) -> Result<(usize, usize)> {
        let grid = self
            .ids
            .first()
            .ok_or_else(|| anyhow!("input has no token grids"))?;
        if self.mask.shape() != (grid.len(), grid.batch_size()) {
            return Err(anyhow!(
                "mask of shape {:?} does not match tokens of shape {:?}",
                self.mask.shape(),
                (grid.len(), grid.batch_size())
            ));
        }
        Ok((grid.len(), grid.batch_size()))
    }
}

/// Packed state of every decoder layer, the conditional layer first.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderState {
    pub layers: Vec<Linear>,
}

/// Projected source contexts, weights and dropout masks of one decoding run.
#[derive(Debug, Clone)]
pub struct PreparedDecoder {
    conditional: PreparedConditional,
    high: Vec<PreparedRecurrent>,
    output_dropout: OutputDropout,
    target_word: Linear,
}

impl PreparedDecoder {
    pub fn batch_size(&self) -> usize {
        self.conditional.batch_size()
    }
}

#[derive(Debug, Clone)]
pub struct DecodeStep {
    /// `[batch, n_words]` next word distribution.
    pub probs: Linear,
    pub state: DecoderState,
    pub attention: Linear,
    pub attention2: Option<Linear>,
}

#[derive(Debug, Clone)]
struct OutputDropout {
    hidden: Linear,
    embedding: Linear,
    context: Linear,
    logit: Linear,
}

fn recurrent_stack(
    options: &ModelOptions,
    kind: RecurrentKind,
    id: &LayerId,
    levels: std::ops::RangeInclusive<usize>,
    input_dim: usize,
    transition_depth: usize,
) -> Result<Vec<RecurrentLayer>> {
    let first = *levels.start();
    levels
        .map(|level| {
            let config = LayerConfig::new_builder(LayerKind::Recurrent(kind), id.level(level))
                .with_input_dim(if level == first { input_dim } else { options.dim })
                .with_hidden_dim(options.dim)
                .with_transition_depth(transition_depth)
                .with_layer_norm(options.layer_normalisation)
                .with_weight_norm(options.weight_normalisation)
                .build()?;
            RecurrentLayer::new(config)
        })
        .collect()
}

/// Runs stacked recurrent layers, adding each layer's input to its hidden output
/// from level `residual_from` on.
fn run_stack(
    layers: &[RecurrentLayer],
    params: &ParameterSet,
    input: &Sequence,
    mask: &Linear,
    dropout: &DropoutMaskProvider,
    rates: DropoutRates,
    residual_from: usize,
) -> Result<Sequence> {
    let mut current = input.clone();
    for (level, layer) in layers.iter().enumerate() {
        let rates = if level == 0 {
            rates
        } else {
            DropoutRates::new(rates.rec, rates.rec, rates.ctx)
        };
        let prepared = layer.prepare(params, current.batch_size(), dropout, rates)?;
        let states = layer.forward(&prepared, &current, Some(mask), None)?;
        let hidden = states.slice_features(0, layer.config().hidden_dim());
        current = if level >= residual_from {
            hidden.add(&current)?
        } else {
            hidden
        };
    }
    Ok(current)
}

fn scale_rows(x: &Linear, scale: &[NodeValue]) -> Result<Linear> {
    let scale = Linear::from_iter(1, scale.iter().copied())?;
    if scale.count() != x.count() {
        return Err(anyhow!(
            "can not scale {} rows with {} factors",
            x.count(),
            scale.count()
        ));
    }
    Ok(x.iter().dot_product(scale.iter().grow(x.stride())).collect())
}

/// Drops whole words, `mask` being `[time, batch]`.
fn word_dropout(emb: &Sequence, mask: &Linear) -> Result<Sequence> {
    let steps = emb
        .steps()
        .iter()
        .enumerate()
        .map(|(t, step)| scale_rows(step, mask.row(t)))
        .collect::<Result<Vec<_>>>()?;
    Sequence::new(steps)
}

fn reverse_rows(mask: &Linear) -> Result<Linear> {
    Linear::from_iter(
        mask.stride(),
        (0..mask.count())
            .rev()
            .flat_map(|t| mask.row(t).iter().copied()),
    )
}

fn initial_packed(kind: RecurrentKind, hidden: Linear) -> Linear {
    match kind {
        RecurrentKind::Gru => hidden,
        RecurrentKind::Lstm => {
            let cell = Linear::with_dimensions(&hidden);
            RecurrentState {
                hidden,
                cell: Some(cell),
            }
            .packed()
        }
    }
}

/// Forward and backward recurrent stacks whose hidden states are concatenated.
#[derive(Debug, Clone)]
struct BiEncoder {
    dim: usize,
    forward: Vec<RecurrentLayer>,
    backward: Vec<RecurrentLayer>,
}

impl BiEncoder {
    fn new(options: &ModelOptions, prefix: &str, input_dim: usize) -> Result<Self> {
        let stack = |name: String| {
            recurrent_stack(
                options,
                options.encoder,
                &LayerId::new(name),
                1..=options.enc_depth,
                input_dim,
                options.enc_recurrence_transition_depth,
            )
        };
        Ok(Self {
            dim: options.dim,
            forward: stack(prefix.to_string())?,
            backward: stack(format!("{prefix}_r"))?,
        })
    }

    fn context_dim(&self) -> usize {
        2 * self.dim
    }

    fn layers(&self) -> impl Iterator<Item = Layer> + '_ {
        self.forward
            .iter()
            .chain(&self.backward)
            .cloned()
            .map(Layer::Recurrent)
    }

    fn encode(
        &self,
        params: &ParameterSet,
        emb: &Sequence,
        mask: &Linear,
        dropout: &DropoutMaskProvider,
        rates: DropoutRates,
    ) -> Result<Sequence> {
        let forward = run_stack(&self.forward, params, emb, mask, dropout, rates, 1)?;
        let backward = run_stack(
            &self.backward,
            params,
            &emb.reversed(),
            &reverse_rows(mask)?,
            dropout,
            rates,
            1,
        )?;
        forward.concat_features(&backward.reversed())
    }
}

/// Embedded source words feeding a bidirectional encoder.
#[derive(Debug, Clone)]
struct SourceSide {
    embedding: EmbeddingLayer,
    encoder: BiEncoder,
    word_dropout: NodeValue,
}

impl SourceSide {
    fn new(options: &ModelOptions, embedding: LayerId, encoder: &str) -> Result<Self> {
        let config = LayerConfig::new_builder(LayerKind::Embedding, embedding)
            .with_input_dim(options.n_words_src)
            .with_factor_dims(options.factor_dims())
            .build()?;
        Ok(Self {
            embedding: EmbeddingLayer::new(config)?,
            encoder: BiEncoder::new(options, encoder, options.dim_word)?,
            word_dropout: options.dropout_source,
        })
    }

    fn layers(&self) -> impl Iterator<Item = Layer> + '_ {
        std::iter::once(Layer::Embedding(self.embedding.clone())).chain(self.encoder.layers())
    }

    /// Context `[src_len, batch, 2·dim]` and its masked mean over time.
    fn encode(
        &self,
        params: &ParameterSet,
        source: SideInput,
        dropout: &DropoutMaskProvider,
        rates: DropoutRates,
    ) -> Result<(Sequence, Linear)> {
        let (len, batch_size) = source.check()?;
        let emb = self.embedding.forward(params, source.ids)?;
        let emb = word_dropout(&emb, &dropout.mask(len, batch_size, self.word_dropout)?)?;
        let context = self.encoder.encode(params, &emb, source.mask, dropout, rates)?;
        let mean = context.masked_mean(source.mask)?;
        Ok((context, mean))
    }
}

/// Target embedding, stacked decoder layers above the conditional one, and the deep output.
#[derive(Debug, Clone)]
struct TargetSide {
    options: ModelOptions,
    context_dim: usize,
    embedding: EmbeddingLayer,
    high: Vec<RecurrentLayer>,
    logit_lstm: FeedForwardLayer,
    logit_prev: FeedForwardLayer,
    logit_ctx: FeedForwardLayer,
    logit: FeedForwardLayer,
}

impl TargetSide {
    fn new(options: &ModelOptions, context_dim: usize) -> Result<Self> {
        let embedding = LayerConfig::new_builder(LayerKind::Embedding, LayerId::new("dec"))
            .with_input_dim(options.n_words)
            .with_hidden_dim(options.dim_word)
            .build()?;
        let high = recurrent_stack(
            options,
            options.decoder,
            &LayerId::new("decoder"),
            2..=options.dec_depth,
            options.dim,
            options.dec_high_recurrence_transition_depth,
        )?;
        let dense = |name: &str, input_dim: usize| {
            LayerConfig::new_builder(LayerKind::FeedForward, LayerId::new(name))
                .with_input_dim(input_dim)
                .with_hidden_dim(options.dim_word)
                .with_activation(NetworkActivationMode::Linear)
                .with_layer_norm(options.layer_normalisation)
                .with_weight_norm(options.weight_normalisation)
                .with_ortho(false)
        };
        let logit = LayerConfig::new_builder(LayerKind::FeedForward, LayerId::new("ff_logit"))
            .with_input_dim(options.dim_word)
            .with_hidden_dim(options.n_words)
            .followed_by_softmax()
            .with_ortho(false)
            .build()?;

        Ok(Self {
            options: options.clone(),
            context_dim,
            embedding: EmbeddingLayer::new(embedding)?,
            high,
            logit_lstm: FeedForwardLayer::new(dense("ff_logit_lstm", options.dim).build()?)?,
            logit_prev: FeedForwardLayer::new(dense("ff_logit_prev", options.dim_word).build()?)?,
            logit_ctx: FeedForwardLayer::new(dense("ff_logit_ctx", context_dim).build()?)?,
            logit: FeedForwardLayer::new(logit)?,
        })
    }

    fn layers(&self) -> impl Iterator<Item = Layer> + '_ {
        std::iter::once(Layer::Embedding(self.embedding.clone()))
            .chain(self.high.iter().cloned().map(Layer::Recurrent))
            .chain(
                [
                    &self.logit_lstm,
                    &self.logit_prev,
                    &self.logit_ctx,
                    &self.logit,
                ]
                .into_iter()
                .cloned()
                .map(Layer::FeedForward),
            )
    }

    fn high_rates(&self) -> DropoutRates {
        let hidden = self.options.dropout_hidden;
        DropoutRates::new(hidden, hidden, hidden)
    }

    fn output_dropout(&self, batch_size: usize, dropout: &DropoutMaskProvider) -> Result<OutputDropout> {
        let options = &self.options;
        Ok(OutputDropout {
            hidden: dropout.mask(batch_size, options.dim, options.dropout_hidden)?,
            embedding: dropout.mask(batch_size, options.dim_word, options.dropout_embedding)?,
            context: dropout.mask(batch_size, self.context_dim, options.dropout_hidden)?,
            logit: dropout.mask(batch_size, options.dim_word, options.dropout_hidden)?,
        })
    }

    /// `softmax(ff_logit(tanh(ff_logit_lstm(h) + ff_logit_prev(y_prev) + ff_logit_ctx(ctx))))`.
    fn probabilities(
        &self,
        params: &ParameterSet,
        hidden: &Linear,
        prev_emb: &Linear,
        context: &Linear,
        masks: &OutputDropout,
    ) -> Result<Linear> {
        let logit_lstm = self.logit_lstm.forward(params, hidden, Some(&masks.hidden))?;
        let logit_prev = self.logit_prev.forward(params, prev_emb, Some(&masks.embedding))?;
        let logit_ctx = self.logit_ctx.forward(params, context, Some(&masks.context))?;
        let logit: Linear = logit_lstm
            .iter()
            .add(logit_prev.iter())
            .add(logit_ctx.iter())
            .collect();
        let logit = NetworkActivationMode::Tanh.apply(&logit);
        let logit = self.logit.forward(params, &logit, Some(&masks.logit))?;
        Ok(NetworkActivationMode::SoftMax.apply(&logit))
    }

    fn prepare_high(
        &self,
        params: &ParameterSet,
        batch_size: usize,
        dropout: &DropoutMaskProvider,
    ) -> Result<Vec<PreparedRecurrent>> {
        self.high
            .iter()
            .map(|layer| layer.prepare(params, batch_size, dropout, self.high_rates()))
            .collect()
    }

    /// Per-sentence negative log-likelihood of `target` with the reference target fed as decoder input.
    fn cost(
        &self,
        params: &ParameterSet,
        conditional: &PreparedConditional,
        target: SideInput,
        init: &Linear,
        dropout: &DropoutMaskProvider,
    ) -> Result<Vec<NodeValue>> {
        let (len, batch_size) = target.check()?;
        let grid = &target.ids[0];
        let emb = self.embedding.forward(params, std::slice::from_ref(grid))?;
        let word_mask = dropout.mask(len, batch_size, self.options.dropout_target)?;
        let emb = word_dropout(&emb, &word_mask)?.shifted_right();

        let output = conditional.forward(&emb, Some(target.mask), Some(init))?;
        let hidden = output.states.slice_features(0, self.options.dim);
        let hidden = run_stack(
            &self.high,
            params,
            &hidden,
            target.mask,
            dropout,
            self.high_rates(),
            0,
        )?;

        let masks = self.output_dropout(batch_size, dropout)?;
        let mut cost = vec![0.0; batch_size];
        for t in 0..len {
            let probs = self.probabilities(
                params,
                hidden.step(t),
                emb.step(t),
                output.contexts.step(t),
                &masks,
            )?;
            for (sample, cost) in cost.iter_mut().enumerate() {
                let weight = target.mask.get(t, sample);
                if weight != 0.0 {
                    let p = probs.get(sample, grid.get(t, sample));
                    *cost -= p.max(NodeValue::MIN_POSITIVE).ln() * weight;
                }
            }
        }
        Ok(cost)
    }

    fn prepare_decoder(
        &self,
        params: &ParameterSet,
        conditional: PreparedConditional,
        init: Linear,
        dropout: &DropoutMaskProvider,
    ) -> Result<(PreparedDecoder, DecoderState)> {
        let batch_size = conditional.batch_size();
        let mut layers = vec![init];
        layers.extend(
            self.high
                .iter()
                .map(|layer| RecurrentState::zeros(layer.kind(), batch_size, self.options.dim).packed()),
        );
        let decoder = PreparedDecoder {
            high: self.prepare_high(params, batch_size, dropout)?,
            output_dropout: self.output_dropout(batch_size, dropout)?,
            target_word: dropout.mask(batch_size, 1, self.options.dropout_target)?,
            conditional,
        };
        Ok((decoder, DecoderState { layers }))
    }

    fn decode_step(
        &self,
        params: &ParameterSet,
        decoder: &PreparedDecoder,
        prev_words: Option<&[usize]>,
        state: &DecoderState,
    ) -> Result<DecodeStep> {
        let batch_size = decoder.batch_size();
        if state.layers.len() != 1 + decoder.high.len() {
            return Err(anyhow!(
                "decoder state has {} layers, expected {}",
                state.layers.len(),
                1 + decoder.high.len()
            ));
        }
        let emb = match prev_words {
            Some(words) => {
                if words.len() != batch_size {
                    return Err(anyhow!(
                        "got {} previous words for a batch of {batch_size}",
                        words.len()
                    ));
                }
                let grid = TokenGrid::from_rows(&[words.to_vec()])?;
                let emb = self.embedding.forward(params, &[grid])?;
                scale_rows(emb.step(0), decoder.target_word.values())?
            }
            None => Linear::new(batch_size, self.options.dim_word),
        };

        let step = decoder.conditional.forward_one(&emb, Some(&state.layers[0]))?;
        let mut hidden = step.state.slice_columns(0, self.options.dim);
        let mut layers = vec![step.state.clone()];
        for ((layer, prepared), prev) in self.high.iter().zip(&decoder.high).zip(&state.layers[1..]) {
            let packed = layer.forward_one(prepared, &hidden, Some(prev))?;
            hidden = packed
                .slice_columns(0, self.options.dim)
                .iter()
                .add(hidden.iter())
                .collect();
            layers.push(packed);
        }

        let probs = self.probabilities(params, &hidden, &emb, &step.context, &decoder.output_dropout)?;
        Ok(DecodeStep {
            probs,
            state: DecoderState { layers },
            attention: step.attention,
            attention2: step.attention2,
        })
    }
}

fn decoder_config(options: &ModelOptions, kind: LayerKind, context_dim: usize) -> Result<LayerConfig> {
    LayerConfig::new_builder(kind, LayerId::new("decoder"))
        .with_input_dim(options.dim_word)
        .with_hidden_dim(options.dim)
        .with_context_dim(context_dim)
        .with_transition_depth(options.dec_base_recurrence_transition_depth)
        .with_layer_norm(options.layer_normalisation)
        .with_weight_norm(options.weight_normalisation)
        .build()
}

fn state_config(options: &ModelOptions, input_dim: usize) -> Result<FeedForwardLayer> {
    let config = LayerConfig::new_builder(LayerKind::FeedForward, LayerId::new("ff_state"))
        .with_input_dim(input_dim)
        .with_hidden_dim(options.dim)
        .with_activation(NetworkActivationMode::Tanh)
        .with_layer_norm(options.layer_normalisation)
        .with_weight_norm(options.weight_normalisation)
        .with_ortho(false)
        .build()?;
    FeedForwardLayer::new(config)
}

fn init_layers(layers: impl Iterator<Item = Layer>, rng: &RngStrategy) -> Result<ParameterSet> {
    let mut params = ParameterSet::new();
    for layer in layers {
        debug!(layer = %layer.config().id(), kind = ?layer.config().kind(), "initializing layer");
        layer.init_params(&mut params, rng)?;
    }
    info!(
        tensors = params.len(),
        scalars = params.scalar_count(),
        "initialized model parameters"
    );
    Ok(params)
}

/// Attentional encoder-decoder: bidirectional encoder, conditional decoder and deep output.
#[derive(Debug, Clone)]
pub struct Seq2Seq {
    options: ModelOptions,
    source: SourceSide,
    ff_state: FeedForwardLayer,
    decoder: ConditionalLayer,
    target: TargetSide,
}

impl Seq2Seq {
    pub fn new(options: ModelOptions) -> Result<Self> {
        options.validate()?;
        let source = SourceSide::new(&options, LayerId::root(), "encoder")?;
        let context_dim = source.encoder.context_dim();
        let decoder = ConditionalLayer::new(decoder_config(
            &options,
            LayerKind::Conditional(options.decoder),
            context_dim,
        )?)?;

        Ok(Self {
            ff_state: state_config(&options, context_dim)?,
            target: TargetSide::new(&options, context_dim)?,
            source,
            decoder,
            options,
        })
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn layers(&self) -> Vec<Layer> {
        self.source
            .layers()
            .chain([
                Layer::FeedForward(self.ff_state.clone()),
                Layer::Conditional(self.decoder.clone()),
            ])
            .chain(self.target.layers())
            .collect()
    }

    #[instrument(level = "info", skip_all)]
    pub fn init_params(&self, rng: &RngStrategy) -> Result<ParameterSet> {
        init_layers(self.layers().into_iter(), rng)
    }

    fn encode(
        &self,
        params: &ParameterSet,
        source: SideInput,
        dropout: &DropoutMaskProvider,
    ) -> Result<(PreparedConditional, Linear)> {
        let rates = DropoutRates::from_options(&self.options);
        let (context, mean) = self.source.encode(params, source, dropout, rates)?;
        let state_dropout =
            dropout.mask(mean.count(), mean.stride(), self.options.dropout_hidden)?;
        let init = self.ff_state.forward(params, &mean, Some(&state_dropout))?;
        let init = initial_packed(self.options.decoder, init);

        let conditional = self.decoder.prepare(
            params,
            ContextInput {
                context: &context,
                mask: Some(source.mask),
            },
            dropout,
            rates,
        )?;
        Ok((conditional, init))
    }

    /// Per-sentence negative log-likelihood of a padded batch.
    #[instrument(level = "debug", skip_all, fields(batch_size = batch.batch_size()))]
    pub fn cost(
        &self,
        params: &ParameterSet,
        batch: &PreparedBatch,
        dropout: &DropoutMaskProvider,
    ) -> Result<Vec<NodeValue>> {
        let source = SideInput::new(&batch.x, &batch.x_mask);
        let target = SideInput::new(std::slice::from_ref(&batch.y), &batch.y_mask);
        let (conditional, init) = self.encode(params, source, dropout)?;
        self.target.cost(params, &conditional, target, &init, dropout)
    }

    /// Encodes `source` once for step-wise decoding.
    pub fn init_decoder(
        &self,
        params: &ParameterSet,
        source: SideInput,
        dropout: &DropoutMaskProvider,
    ) -> Result<(PreparedDecoder, DecoderState)> {
        let (conditional, init) = self.encode(params, source, dropout)?;
        self.target.prepare_decoder(params, conditional, init, dropout)
    }

    /// Next word distribution given the previous words, `None` at the first step.
    pub fn decode_step(
        &self,
        params: &ParameterSet,
        decoder: &PreparedDecoder,
        prev_words: Option<&[usize]>,
        state: &DecoderState,
    ) -> Result<DecodeStep> {
        self.target.decode_step(params, decoder, prev_words, state)
    }
}

/// Encoder-decoder reading two sources through a dual-attention decoder.
///
/// Both encoder contexts initialize the decoder; the deep output reads the first context only.
#[derive(Debug, Clone)]
pub struct DualSourceSeq2Seq {
    options: ModelOptions,
    source1: SourceSide,
    source2: SourceSide,
    ff_state: FeedForwardLayer,
    decoder: DoubleConditionalLayer,
    target: TargetSide,
}

impl DualSourceSeq2Seq {
    pub fn new(options: ModelOptions) -> Result<Self> {
        options.validate()?;
        let source1 = SourceSide::new(&options, LayerId::root(), "encoder")?;
        let source2 = SourceSide::new(&options, LayerId::new("src2"), "encoder2")?;
        let context_dim = source1.encoder.context_dim();
        let decoder = DoubleConditionalLayer::new(decoder_config(
            &options,
            LayerKind::DoubleConditional(options.decoder),
            context_dim,
        )?)?;

        Ok(Self {
            ff_state: state_config(&options, 2 * context_dim)?,
            target: TargetSide::new(&options, context_dim)?,
            source1,
            source2,
            decoder,
            options,
        })
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn layers(&self) -> Vec<Layer> {
        self.source1
            .layers()
            .chain(self.source2.layers())
            .chain([
                Layer::FeedForward(self.ff_state.clone()),
                Layer::DoubleConditional(self.decoder.clone()),
            ])
            .chain(self.target.layers())
            .collect()
    }

    #[instrument(level = "info", skip_all)]
    pub fn init_params(&self, rng: &RngStrategy) -> Result<ParameterSet> {
        init_layers(self.layers().into_iter(), rng)
    }

    fn encode(
        &self,
        params: &ParameterSet,
        sources: [SideInput; 2],
        dropout: &DropoutMaskProvider,
    ) -> Result<(PreparedConditional, Linear)> {
        let rates = DropoutRates::from_options(&self.options);
        let [source1, source2] = sources;
        let (context1, mean1) = self.source1.encode(params, source1, dropout, rates)?;
        let (context2, mean2) = self.source2.encode(params, source2, dropout, rates)?;

        let mean: Linear = mean1.concat(&mean2).collect();
        let state_dropout =
            dropout.mask(mean.count(), mean.stride(), self.options.dropout_hidden)?;
        let init = self.ff_state.forward(params, &mean, Some(&state_dropout))?;
        let init = initial_packed(self.options.decoder, init);

        let conditional = self.decoder.prepare(
            params,
            [
                ContextInput {
                    context: &context1,
                    mask: Some(source1.mask),
                },
                ContextInput {
                    context: &context2,
                    mask: Some(source2.mask),
                },
            ],
            dropout,
            rates,
        )?;
        Ok((conditional, init))
    }

    /// Per-sentence negative log-likelihood, both sources sharing the target batch.
    #[instrument(level = "debug", skip_all)]
    pub fn cost(
        &self,
        params: &ParameterSet,
        sources: [SideInput; 2],
        target: SideInput,
        dropout: &DropoutMaskProvider,
    ) -> Result<Vec<NodeValue>> {
        let (conditional, init) = self.encode(params, sources, dropout)?;
        self.target.cost(params, &conditional, target, &init, dropout)
    }

    pub fn init_decoder(
        &self,
        params: &ParameterSet,
        sources: [SideInput; 2],
        dropout: &DropoutMaskProvider,
    ) -> Result<(PreparedDecoder, DecoderState)> {
        let (conditional, init) = self.encode(params, sources, dropout)?;
        self.target.prepare_decoder(params, conditional, init, dropout)
    }

    pub fn decode_step(
        &self,
        params: &ParameterSet,
        decoder: &PreparedDecoder,
        prev_words: Option<&[usize]>,
        state: &DecoderState,
    ) -> Result<DecodeStep> {
        self.target.decode_step(params, decoder, prev_words, state)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::ml::{
        data::prepare_data,
        dropout::{DropoutMode, DropoutScaling},
    };

    use super::*;

    fn small_options() -> ModelOptions {
        ModelOptions {
            dim_word: 4,
            dim: 5,
            n_words_src: 7,
            n_words: 6,
            ..Default::default()
        }
    }

    fn new_batch(source: Vec<Vec<usize>>, target: Vec<Vec<usize>>) -> PreparedBatch {
        let source: Vec<Vec<Vec<usize>>> = source
            .into_iter()
            .map(|x| x.into_iter().map(|id| vec![id]).collect())
            .collect();
        prepare_data(&source, &target, 1, None).unwrap().unwrap()
    }

    #[test]
    fn parameters_use_flat_layer_names() {
        let rng = RngStrategy::testable(1234);
        let model = Seq2Seq::new(ModelOptions {
            enc_depth: 2,
            dec_depth: 2,
            ..small_options()
        })
        .unwrap();
        let params = model.init_params(&rng).unwrap();
        let flat = params.to_flat().unwrap();

        for name in [
            "Wemb",
            "Wemb_dec",
            "encoder_W",
            "encoder_r_Ux",
            "encoder_2_U",
            "encoder_r_2_W",
            "ff_state_W",
            "decoder_W_comb_att",
            "decoder_U_att",
            "decoder_c_tt",
            "decoder_Wc",
            "decoder_U_nl",
            "decoder_2_U",
            "ff_logit_lstm_W",
            "ff_logit_prev_W",
            "ff_logit_ctx_W",
            "ff_logit_W",
        ] {
            assert!(flat.contains_key(name), "missing {name}");
        }
        assert_eq!(flat["Wemb"].shape(), (7, 4));
        assert_eq!(flat["ff_state_W"].shape(), (10, 5));
        assert_eq!(flat["decoder_Wc_att"].shape(), (10, 10));
        assert_eq!(flat["ff_logit_W"].shape(), (4, 6));
    }

    #[test]
    fn cost_is_positive_per_sentence() {
        let rng = RngStrategy::testable(1234);
        let model = Seq2Seq::new(small_options()).unwrap();
        let params = model.init_params(&rng).unwrap();
        let batch = new_batch(vec![vec![2, 3, 4], vec![5]], vec![vec![2, 3], vec![4, 5, 2]]);

        let cost = model
            .cost(&params, &batch, &DropoutMaskProvider::disabled())
            .unwrap();
        assert_eq!(cost.len(), 2);
        assert!(cost.iter().all(|x| x.is_finite() && *x > 0.0));
    }

    #[test]
    fn padding_does_not_change_sentence_cost() {
        let rng = RngStrategy::testable(1234);
        let model = Seq2Seq::new(ModelOptions {
            encoder: RecurrentKind::Lstm,
            decoder: RecurrentKind::Lstm,
            ..small_options()
        })
        .unwrap();
        let params = model.init_params(&rng).unwrap();
        let dropout = DropoutMaskProvider::disabled();

        let alone = new_batch(vec![vec![2, 3]], vec![vec![4]]);
        let padded = new_batch(vec![vec![2, 3], vec![6, 5, 4, 3]], vec![vec![4], vec![1, 2, 3]]);

        let alone = model.cost(&params, &alone, &dropout).unwrap();
        let padded = model.cost(&params, &padded, &dropout).unwrap();
        assert!((alone[0] - padded[0]).abs() < 1e-6);
    }

    #[test]
    fn decode_steps_match_reference_fed_cost() {
        let rng = RngStrategy::testable(1234);
        let model = Seq2Seq::new(ModelOptions {
            dec_depth: 2,
            ..small_options()
        })
        .unwrap();
        let params = model.init_params(&rng).unwrap();
        let dropout = DropoutMaskProvider::disabled();
        let batch = new_batch(vec![vec![2, 3, 4]], vec![vec![3, 5]]);

        let cost = model.cost(&params, &batch, &dropout).unwrap();

        let source = SideInput::new(&batch.x, &batch.x_mask);
        let (decoder, mut state) = model.init_decoder(&params, source, &dropout).unwrap();
        assert_eq!(state.layers.len(), 2);

        let mut stepped = 0.0;
        let mut prev: Option<Vec<usize>> = None;
        for t in 0..batch.y.len() {
            let step = model
                .decode_step(&params, &decoder, prev.as_deref(), &state)
                .unwrap();
            assert_eq!(step.probs.shape(), (1, 6));
            let total: NodeValue = step.probs.values().iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert!((step.attention.values().iter().sum::<NodeValue>() - 1.0).abs() < 1e-9);

            let word = batch.y.get(t, 0);
            stepped -= step.probs.get(0, word).ln();
            prev = Some(vec![word]);
            state = step.state;
        }
        assert!((stepped - cost[0]).abs() < 1e-6);
    }

    #[test]
    fn training_dropout_changes_cost() {
        let rng = RngStrategy::testable(1234);
        let model = Seq2Seq::new(ModelOptions {
            use_dropout: true,
            dropout_source: 0.3,
            dropout_target: 0.3,
            ..small_options()
        })
        .unwrap();
        let params = model.init_params(&rng).unwrap();
        let batch = new_batch(vec![vec![2, 3, 4, 5, 6]], vec![vec![2, 3, 4, 5]]);

        let sampling = DropoutMaskProvider::new(
            DropoutMode::Sampling,
            DropoutScaling::Inverted,
            RngStrategy::testable(1),
        );
        let training = DropoutMaskProvider::new(
            DropoutMode::Training,
            DropoutScaling::Inverted,
            RngStrategy::testable(1),
        );
        let disabled = model
            .cost(&params, &batch, &DropoutMaskProvider::disabled())
            .unwrap();
        let sampled = model.cost(&params, &batch, &sampling).unwrap();
        let trained = model.cost(&params, &batch, &training).unwrap();

        assert!((disabled[0] - sampled[0]).abs() < 1e-9);
        assert_ne!(disabled[0], trained[0]);
    }

    #[test]
    fn dual_source_model_attends_both_sources() {
        let rng = RngStrategy::testable(1234);
        let model = DualSourceSeq2Seq::new(small_options()).unwrap();
        let params = model.init_params(&rng).unwrap();
        let flat = params.to_flat().unwrap();
        assert!(flat.contains_key("Wemb_src2"));
        assert!(flat.contains_key("encoder2_r_W"));
        assert!(flat.contains_key("decoder_U1_att"));
        assert!(flat.contains_key("decoder_Wc2_att"));
        assert!(!flat.contains_key("decoder_c_tt"));
        assert_eq!(flat["ff_state_W"].shape(), (20, 5));

        let first = new_batch(vec![vec![2, 3], vec![4]], vec![vec![2], vec![3, 4]]);
        let second = new_batch(vec![vec![5], vec![6, 5, 4]], vec![vec![2], vec![3, 4]]);
        let dropout = DropoutMaskProvider::disabled();
        let sources = [
            SideInput::new(&first.x, &first.x_mask),
            SideInput::new(&second.x, &second.x_mask),
        ];

        let cost = model
            .cost(
                &params,
                sources,
                SideInput::new(std::slice::from_ref(&first.y), &first.y_mask),
                &dropout,
            )
            .unwrap();
        assert!(cost.iter().all(|x| x.is_finite() && *x > 0.0));

        let (decoder, state) = model.init_decoder(&params, sources, &dropout).unwrap();
        let step = model.decode_step(&params, &decoder, None, &state).unwrap();
        let attention2 = step.attention2.unwrap();
        assert_eq!(step.attention.shape(), (2, 3));
        assert_eq!(attention2.shape(), (2, 4));
        assert_eq!(attention2.get(0, 2), 0.0);
    }

    #[test]
    fn mismatched_masks_are_rejected() {
        let rng = RngStrategy::testable(1234);
        let model = Seq2Seq::new(small_options()).unwrap();
        let params = model.init_params(&rng).unwrap();
        let mut batch = new_batch(vec![vec![2, 3]], vec![vec![4]]);
        batch.x_mask = Linear::with_value(2, 1, 1.0);

        assert!(model
            .cost(&params, &batch, &DropoutMaskProvider::disabled())
            .is_err());
    }
}
