use anyhow::{anyhow, Result};

use crate::ml::{
    init::ParamInitializer,
    norm::maybe_layer_norm,
    params::{ParameterSet, Projection},
    Linear, RngStrategy, Sequence,
};

use super::{
    transition::{add_row, hadamard},
    LayerConfig, LayerKind,
};

/// `activ(LN(x·W + b))`, applied row-wise or at every step of a sequence.
#[derive(Debug, Clone)]
pub struct FeedForwardLayer {
    config: LayerConfig,
}

impl FeedForwardLayer {
    pub fn new(config: LayerConfig) -> Result<Self> {
        match config.kind() {
            LayerKind::FeedForward => Ok(Self { config }),
            other => Err(anyhow!("can not build feed forward layer from {other:?} config")),
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn init_params(&self, params: &mut ParameterSet, rng: &RngStrategy) -> Result<()> {
        let config = &self.config;
        let mut init = ParamInitializer::new(params, config.id(), rng)
            .with_normalisation(config.layer_norm(), config.weight_norm());

        init.weight(
            Projection::Dense,
            config.input_dim(),
            config.hidden_dim(),
            config.ortho(),
        )?;
        init.bias(Projection::Dense, config.hidden_dim())?;
        init.layer_norm(Projection::Dense, config.hidden_dim())
    }

    /// `dropout` is an optional `[batch, input_dim]` mask applied to the input.
    pub fn forward(
        &self,
        params: &ParameterSet,
        input: &Linear,
        dropout: Option<&Linear>,
    ) -> Result<Linear> {
        let config = &self.config;
        if input.stride() != config.input_dim() {
            return Err(anyhow!(
                "layer '{}' expects inputs of dim {}, got shape {:?}",
                config.id(),
                config.input_dim(),
                input.shape()
            ));
        }
        let scope = params
            .scope(config.id())
            .with_normalisation(config.layer_norm(), config.weight_norm());
        let weights = scope.weight(Projection::Dense)?;
        let bias = scope.bias(Projection::Dense)?;
        let ln = scope.layer_norm(Projection::Dense)?;

        let input = match dropout {
            Some(mask) => {
                if mask.shape() != input.shape() {
                    return Err(anyhow!(
                        "dropout mask of shape {:?} does not match input {:?}",
                        mask.shape(),
                        input.shape()
                    ));
                }
                hadamard(input, mask)
            }
            None => input.clone(),
        };
        let preact = add_row(&input.matrix_product(&weights), &bias);
        let preact = maybe_layer_norm(ln.as_ref(), preact)?;
        Ok(config.activation().apply(&preact))
    }

    /// Applies the layer at every time step, sharing one dropout mask across time.
    pub fn forward_sequence(
        &self,
        params: &ParameterSet,
        input: &Sequence,
        dropout: Option<&Linear>,
    ) -> Result<Sequence> {
        input.map_steps(|step| self.forward(params, step, dropout))
    }
}
