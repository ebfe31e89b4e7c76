use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{
    options::ModelOptions,
    params::{LayerId, ParameterSet},
    Linear, NetworkActivationMode, NodeValue, RngStrategy,
};

pub use builder::LayerConfigBuilder;

use self::{
    cell::RecurrentLayer,
    cond::{ConditionalLayer, DoubleConditionalLayer},
    embedding::EmbeddingLayer,
    feedforward::FeedForwardLayer,
};

pub mod attention;
pub mod cell;
pub mod cond;
pub mod embedding;
pub mod feedforward;
pub mod scan;
mod transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrentKind {
    Gru,
    Lstm,
}

impl RecurrentKind {
    /// Sigmoid gates per unit: reset/update for GRU, input/forget/output for LSTM.
    pub fn gate_count(&self) -> usize {
        match self {
            RecurrentKind::Gru => 2,
            RecurrentKind::Lstm => 3,
        }
    }

    /// Width of the packed state, LSTM carrying `[hidden, cell]`.
    pub fn state_width(&self, dim: usize) -> usize {
        match self {
            RecurrentKind::Gru => dim,
            RecurrentKind::Lstm => 2 * dim,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    FeedForward,
    Embedding,
    Recurrent(RecurrentKind),
    Conditional(RecurrentKind),
    DoubleConditional(RecurrentKind),
}

impl LayerKind {
    pub fn recurrent_kind(&self) -> Option<RecurrentKind> {
        match self {
            LayerKind::Recurrent(kind)
            | LayerKind::Conditional(kind)
            | LayerKind::DoubleConditional(kind) => Some(*kind),
            LayerKind::FeedForward | LayerKind::Embedding => None,
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            LayerKind::Conditional(_) | LayerKind::DoubleConditional(_)
        )
    }
}

/// Immutable shape and normalization settings of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    kind: LayerKind,
    id: LayerId,
    input_dim: usize,
    hidden_dim: usize,
    context_dim: Option<usize>,
    transition_depth: usize,
    layer_norm: bool,
    weight_norm: bool,
    activation: NetworkActivationMode,
    factor_dims: Vec<usize>,
    ortho: bool,
}

impl LayerConfig {
    pub fn new_builder(kind: LayerKind, id: LayerId) -> LayerConfigBuilder {
        LayerConfigBuilder::new(kind, id)
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn id(&self) -> &LayerId {
        &self.id
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn context_dim(&self) -> Option<usize> {
        self.context_dim
    }

    pub fn transition_depth(&self) -> usize {
        self.transition_depth
    }

    pub fn layer_norm(&self) -> bool {
        self.layer_norm
    }

    pub fn weight_norm(&self) -> bool {
        self.weight_norm
    }

    pub fn activation(&self) -> NetworkActivationMode {
        self.activation
    }

    pub fn factor_dims(&self) -> &[usize] {
        &self.factor_dims
    }

    pub fn ortho(&self) -> bool {
        self.ortho
    }

    /// Width of the per-step output: packed state for recurrent kinds.
    pub fn output_dim(&self) -> usize {
        match self.kind.recurrent_kind() {
            Some(kind) => kind.state_width(self.hidden_dim),
            None => self.hidden_dim,
        }
    }
}

/// Closed set of layer implementations, dispatching parameter initialization per kind.
#[derive(Debug, Clone)]
pub enum Layer {
    FeedForward(FeedForwardLayer),
    Embedding(EmbeddingLayer),
    Recurrent(RecurrentLayer),
    Conditional(ConditionalLayer),
    DoubleConditional(DoubleConditionalLayer),
}

impl Layer {
    pub fn from_config(config: LayerConfig) -> Result<Self> {
        Ok(match config.kind() {
            LayerKind::FeedForward => Layer::FeedForward(FeedForwardLayer::new(config)?),
            LayerKind::Embedding => Layer::Embedding(EmbeddingLayer::new(config)?),
            LayerKind::Recurrent(_) => Layer::Recurrent(RecurrentLayer::new(config)?),
            LayerKind::Conditional(_) => Layer::Conditional(ConditionalLayer::new(config)?),
            LayerKind::DoubleConditional(_) => {
                Layer::DoubleConditional(DoubleConditionalLayer::new(config)?)
            }
        })
    }

    pub fn config(&self) -> &LayerConfig {
        match self {
            Layer::FeedForward(layer) => layer.config(),
            Layer::Embedding(layer) => layer.config(),
            Layer::Recurrent(layer) => layer.config(),
            Layer::Conditional(layer) => layer.config(),
            Layer::DoubleConditional(layer) => layer.config(),
        }
    }

    pub fn init_params(&self, params: &mut ParameterSet, rng: &RngStrategy) -> Result<()> {
        match self {
            Layer::FeedForward(layer) => layer.init_params(params, rng),
            Layer::Embedding(layer) => layer.init_params(params, rng),
            Layer::Recurrent(layer) => layer.init_params(params, rng),
            Layer::Conditional(layer) => layer.init_params(params, rng),
            Layer::DoubleConditional(layer) => layer.init_params(params, rng),
        }
    }
}

/// Hidden state of a recurrent layer, LSTM layers also carrying a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    pub hidden: Linear,
    pub cell: Option<Linear>,
}

impl RecurrentState {
    pub fn zeros(kind: RecurrentKind, batch_size: usize, dim: usize) -> Self {
        Self {
            hidden: Linear::new(batch_size, dim),
            cell: match kind {
                RecurrentKind::Gru => None,
                RecurrentKind::Lstm => Some(Linear::new(batch_size, dim)),
            },
        }
    }

    pub fn packed(&self) -> Linear {
        match &self.cell {
            Some(cell) => self.hidden.concat(cell).collect(),
            None => self.hidden.clone(),
        }
    }

    pub fn unpack(kind: RecurrentKind, packed: &Linear, dim: usize) -> Result<Self> {
        if packed.stride() != kind.state_width(dim) {
            return Err(anyhow!(
                "{kind:?} state of dim {dim} can not be read from shape {:?}",
                packed.shape()
            ));
        }
        Ok(match kind {
            RecurrentKind::Gru => Self {
                hidden: packed.clone(),
                cell: None,
            },
            RecurrentKind::Lstm => Self {
                hidden: packed.slice_columns(0, dim),
                cell: Some(packed.slice_columns(dim, dim)),
            },
        })
    }

    pub fn batch_size(&self) -> usize {
        self.hidden.count()
    }
}

/// Dropout probabilities for the input, recurrent and context projections of a layer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DropoutRates {
    pub below: NodeValue,
    pub rec: NodeValue,
    pub ctx: NodeValue,
}

impl DropoutRates {
    pub fn new(below: NodeValue, rec: NodeValue, ctx: NodeValue) -> Self {
        Self { below, rec, ctx }
    }

    pub fn from_options(options: &ModelOptions) -> Self {
        Self::new(
            options.dropout_embedding,
            options.dropout_hidden,
            options.dropout_hidden,
        )
    }
}

mod builder {
    use anyhow::{anyhow, Result};

    use crate::ml::{params::LayerId, NetworkActivationMode};

    use super::{LayerConfig, LayerKind};

    pub struct LayerConfigBuilder {
        kind: LayerKind,
        id: LayerId,
        input_dim: Option<usize>,
        hidden_dim: Option<usize>,
        context_dim: Option<usize>,
        default_dim: Option<usize>,
        transition_depth: Option<usize>,
        layer_norm: bool,
        weight_norm: bool,
        activation: NetworkActivationMode,
        factor_dims: Option<Vec<usize>>,
        followed_by_softmax: bool,
        ortho: bool,
    }

    impl LayerConfigBuilder {
        pub fn new(kind: LayerKind, id: LayerId) -> Self {
            Self {
                kind,
                id,
                input_dim: None,
                hidden_dim: None,
                context_dim: None,
                default_dim: None,
                transition_depth: None,
                layer_norm: false,
                weight_norm: false,
                activation: NetworkActivationMode::Tanh,
                factor_dims: None,
                followed_by_softmax: false,
                ortho: true,
            }
        }

        pub fn build(self) -> Result<LayerConfig> {
            let id = self.id;
            let input_dim = self
                .input_dim
                .or(self.default_dim)
                .ok_or_else(|| anyhow!("layer '{id}' is missing an input dimension"))?;

            let factor_dims = match (self.kind, self.factor_dims) {
                (LayerKind::Embedding, Some(dims)) => dims,
                (LayerKind::Embedding, None) => vec![self
                    .hidden_dim
                    .or(self.default_dim)
                    .ok_or_else(|| anyhow!("embedding '{id}' is missing a dimension"))?],
                (_, _) => vec![],
            };
            let hidden_dim = match self.kind {
                LayerKind::Embedding => factor_dims.iter().sum(),
                _ => self
                    .hidden_dim
                    .or(self.default_dim)
                    .ok_or_else(|| anyhow!("layer '{id}' is missing a hidden dimension"))?,
            };
            if input_dim == 0 || hidden_dim == 0 || factor_dims.contains(&0) {
                return Err(anyhow!(
                    "layer '{id}' has an empty dimension: input={input_dim}, hidden={hidden_dim}"
                ));
            }

            let context_dim = if self.kind.is_conditional() {
                Some(self.context_dim.unwrap_or(hidden_dim))
            } else {
                None
            };
            let transition_depth = match self.kind {
                LayerKind::Recurrent(_) => self.transition_depth.unwrap_or(1),
                LayerKind::Conditional(_) | LayerKind::DoubleConditional(_) => {
                    self.transition_depth.unwrap_or(2)
                }
                LayerKind::FeedForward | LayerKind::Embedding => 1,
            };
            if transition_depth == 0 {
                return Err(anyhow!("layer '{id}' must have a transition depth of at least 1"));
            }

            // normalising the logits of a softmax output only rescales them
            let normalise = !(self.followed_by_softmax && self.kind == LayerKind::FeedForward);
            let activation = if self.followed_by_softmax {
                NetworkActivationMode::Linear
            } else {
                self.activation
            };

            Ok(LayerConfig {
                kind: self.kind,
                id,
                input_dim,
                hidden_dim,
                context_dim,
                transition_depth,
                layer_norm: self.layer_norm && normalise,
                weight_norm: self.weight_norm && normalise,
                activation,
                factor_dims,
                ortho: self.ortho,
            })
        }

        pub fn with_input_dim(mut self, input_dim: usize) -> Self {
            self.input_dim = Some(input_dim);
            self
        }

        pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
            self.hidden_dim = Some(hidden_dim);
            self
        }

        pub fn with_context_dim(mut self, context_dim: usize) -> Self {
            self.context_dim = Some(context_dim);
            self
        }

        /// Fallback for input and hidden dims not given explicitly.
        pub fn with_default_dim(mut self, dim: usize) -> Self {
            self.default_dim = Some(dim);
            self
        }

        pub fn with_transition_depth(mut self, depth: usize) -> Self {
            self.transition_depth = Some(depth);
            self
        }

        pub fn with_layer_norm(mut self, layer_norm: bool) -> Self {
            self.layer_norm = layer_norm;
            self
        }

        pub fn with_weight_norm(mut self, weight_norm: bool) -> Self {
            self.weight_norm = weight_norm;
            self
        }

        pub fn with_activation(mut self, activation: NetworkActivationMode) -> Self {
            self.activation = activation;
            self
        }

        pub fn with_factor_dims(mut self, factor_dims: Vec<usize>) -> Self {
            self.factor_dims = Some(factor_dims);
            self
        }

        pub fn followed_by_softmax(mut self) -> Self {
            self.followed_by_softmax = true;
            self
        }

        pub fn with_ortho(mut self, ortho: bool) -> Self {
            self.ortho = ortho;
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn builder_resolves_dimensions_and_depth() {
        let config = LayerConfig::new_builder(
            LayerKind::Conditional(RecurrentKind::Lstm),
            LayerId::new("decoder"),
        )
        .with_default_dim(8)
        .with_context_dim(16)
        .build()
        .unwrap();

        assert_eq!(config.input_dim(), 8);
        assert_eq!(config.hidden_dim(), 8);
        assert_eq!(config.context_dim(), Some(16));
        assert_eq!(config.transition_depth(), 2);
        assert_eq!(config.output_dim(), 16);
    }

    #[test]
    fn builder_rejects_missing_dimensions() {
        let result = LayerConfig::new_builder(
            LayerKind::Recurrent(RecurrentKind::Gru),
            LayerId::new("encoder"),
        )
        .with_hidden_dim(4)
        .build();
        assert!(result.is_err());

        let result = LayerConfig::new_builder(
            LayerKind::Recurrent(RecurrentKind::Gru),
            LayerId::new("encoder"),
        )
        .with_default_dim(4)
        .with_transition_depth(0)
        .build();
        assert!(result.is_err());
    }

    #[test]
    fn softmax_output_layers_skip_normalisation() {
        let config = LayerConfig::new_builder(LayerKind::FeedForward, LayerId::new("ff_logit"))
            .with_input_dim(4)
            .with_hidden_dim(10)
            .with_layer_norm(true)
            .with_weight_norm(true)
            .followed_by_softmax()
            .build()
            .unwrap();

        assert!(!config.layer_norm());
        assert!(!config.weight_norm());
        assert_eq!(config.activation(), NetworkActivationMode::Linear);
    }

    #[test]
    fn lstm_state_packs_hidden_and_cell() {
        let state = RecurrentState {
            hidden: Linear::with_value(2, 3, 1.0),
            cell: Some(Linear::with_value(2, 3, 2.0)),
        };
        let packed = state.packed();
        assert_eq!(packed.shape(), (2, 6));

        let unpacked = RecurrentState::unpack(RecurrentKind::Lstm, &packed, 3).unwrap();
        assert_eq!(unpacked, state);
        assert!(RecurrentState::unpack(RecurrentKind::Gru, &packed, 3).is_err());
    }
}
