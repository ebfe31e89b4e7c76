use anyhow::{anyhow, Result};

use crate::ml::{
    data::TokenGrid,
    init::ParamInitializer,
    params::{ParamRole, ParameterSet},
    Linear, RngStrategy, Sequence,
};

use super::{LayerConfig, LayerKind};

/// Lookup tables, one per input factor, over a shared vocabulary size.
#[derive(Debug, Clone)]
pub struct EmbeddingLayer {
    config: LayerConfig,
}

impl EmbeddingLayer {
    pub fn new(config: LayerConfig) -> Result<Self> {
        match config.kind() {
            LayerKind::Embedding => Ok(Self { config }),
            other => Err(anyhow!("can not build embedding layer from {other:?} config")),
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn n_words(&self) -> usize {
        self.config.input_dim()
    }

    pub fn init_params(&self, params: &mut ParameterSet, rng: &RngStrategy) -> Result<()> {
        let mut init = ParamInitializer::new(params, self.config.id(), rng);
        for (factor, &dim) in self.config.factor_dims().iter().enumerate() {
            init.embedding(factor, self.n_words(), dim)?;
        }
        Ok(())
    }

    /// Embeds `[time, batch]` index grids, one per factor, concatenating the factor
    /// embeddings along the feature axis.
    pub fn forward(&self, params: &ParameterSet, ids: &[TokenGrid]) -> Result<Sequence> {
        let factor_dims = self.config.factor_dims();
        if ids.len() != factor_dims.len() {
            return Err(anyhow!(
                "embedding '{}' expects {} factors, got {}",
                self.config.id(),
                factor_dims.len(),
                ids.len()
            ));
        }
        let first = &ids[0];
        if ids
            .iter()
            .any(|x| x.len() != first.len() || x.batch_size() != first.batch_size())
        {
            return Err(anyhow!("factor grids of '{}' differ in shape", self.config.id()));
        }
        let n_words = self.n_words();
        if let Some(id) = ids
            .iter()
            .flat_map(|grid| (0..grid.len()).flat_map(move |t| grid.row(t).iter().copied()))
            .find(|&id| id >= n_words)
        {
            return Err(anyhow!(
                "token index {id} out of range for embedding '{}' of {n_words} words",
                self.config.id()
            ));
        }

        let scope = params.scope(self.config.id());
        let tables = (0..factor_dims.len())
            .map(|factor| scope.get(ParamRole::Embedding { factor }))
            .collect::<Result<Vec<&Linear>>>()?;

        let tables = &tables;
        let steps = (0..first.len())
            .map(|t| {
                let values = (0..first.batch_size()).flat_map(move |sample| {
                    tables
                        .iter()
                        .zip(ids)
                        .flat_map(move |(table, grid)| table.row(grid.get(t, sample)).iter().copied())
                });
                Linear::from_iter(self.config.hidden_dim(), values)
            })
            .collect::<Result<Vec<_>>>()?;
        Sequence::new(steps)
    }
}
