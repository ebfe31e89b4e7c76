use anyhow::{anyhow, Result};
use tracing::trace;

use crate::ml::{
    params::{LayerId, ParamKey, ParamRole, ParameterSet, Projection},
    LayerInitStrategy, Linear, NodeValue, RngStrategy, RNG,
};

/// Square matrix with orthonormal columns, from Gram-Schmidt over a gaussian draw.
pub fn ortho_weight(ndim: usize, rng: &RngStrategy) -> Linear {
    let mut columns: Vec<Vec<NodeValue>> = Vec::with_capacity(ndim);

    while columns.len() < ndim {
        let mut candidate: Vec<NodeValue> = (0..ndim).map(|_| rng.rand_normal()).collect();
        for basis in &columns {
            let projection: NodeValue = candidate.iter().zip(basis).map(|(x, y)| x * y).sum();
            candidate
                .iter_mut()
                .zip(basis)
                .for_each(|(x, y)| *x -= projection * y);
        }
        let norm = candidate.iter().map(|x| x * x).sum::<NodeValue>().sqrt();
        // degenerate draws are discarded and redrawn
        if norm > 1e-6 {
            candidate.iter_mut().for_each(|x| *x /= norm);
            columns.push(candidate);
        }
    }

    let mut weights = Linear::new(ndim, ndim);
    for (col_idx, column) in columns.iter().enumerate() {
        for (row_idx, value) in column.iter().enumerate() {
            weights.set(row_idx, col_idx, *value);
        }
    }
    weights
}

/// Orthogonal when square and `ortho` is set, otherwise a gaussian scaled by 0.01.
pub fn norm_weight(nin: usize, nout: usize, ortho: bool, rng: &RngStrategy) -> Linear {
    if ortho && nin == nout {
        return ortho_weight(nin, rng);
    }
    let mut weights = Linear::new(nin, nout);
    let strategy = LayerInitStrategy::Normal {
        scale: LayerInitStrategy::NORM_WEIGHT_SCALE,
    };
    weights.initialize_as_layer(&strategy, rng);
    weights
}

/// Inserts freshly initialized tensors for one layer into a [`ParameterSet`].
pub struct ParamInitializer<'a> {
    params: &'a mut ParameterSet,
    layer: LayerId,
    layer_norm: bool,
    weight_norm: bool,
    rng: &'a RngStrategy,
}

impl<'a> ParamInitializer<'a> {
    pub fn new(params: &'a mut ParameterSet, layer: &LayerId, rng: &'a RngStrategy) -> Self {
        Self {
            params,
            layer: layer.clone(),
            layer_norm: false,
            weight_norm: false,
            rng,
        }
    }

    pub fn with_normalisation(mut self, layer_norm: bool, weight_norm: bool) -> Self {
        self.layer_norm = layer_norm;
        self.weight_norm = weight_norm;
        self
    }

    fn insert(&mut self, role: ParamRole, value: Linear) -> Result<()> {
        let key = ParamKey::new(&self.layer, role);
        trace!(name = %key, shape = ?value.shape(), "initialized parameter");
        self.params.insert(key, value)
    }

    /// Horizontal concatenation of `blocks` sub-matrices of shape `[nin, nout]`.
    pub fn weight_blocks(
        &mut self,
        projection: Projection,
        nin: usize,
        nout: usize,
        blocks: usize,
        ortho: bool,
    ) -> Result<()> {
        if nin == 0 || nout == 0 || blocks == 0 {
            return Err(anyhow!(
                "can not initialize {}_{projection:?} with shape [{nin}, {blocks}x{nout}]",
                self.layer
            ));
        }
        let parts: Vec<Linear> = (0..blocks)
            .map(|_| norm_weight(nin, nout, ortho, self.rng))
            .collect();
        let weights = Linear::concat_all(&parts.iter().collect::<Vec<_>>())?;
        self.insert(ParamRole::Weight(projection), weights)?;

        if self.weight_norm {
            let scale = Linear::with_value(1, nout * blocks, 1.0);
            self.insert(ParamRole::WeightNormScale(projection), scale)?;
        }
        Ok(())
    }

    pub fn weight(&mut self, projection: Projection, nin: usize, nout: usize, ortho: bool) -> Result<()> {
        self.weight_blocks(projection, nin, nout, 1, ortho)
    }

    pub fn bias(&mut self, projection: Projection, width: usize) -> Result<()> {
        self.insert(ParamRole::Bias(projection), Linear::new(1, width))
    }

    pub fn layer_norm(&mut self, projection: Projection, width: usize) -> Result<()> {
        if !self.layer_norm {
            return Ok(());
        }
        self.insert(
            ParamRole::LayerNormShift(projection),
            Linear::with_value(1, width, 0.0),
        )?;
        self.insert(
            ParamRole::LayerNormScale(projection),
            Linear::with_value(1, width, 1.0),
        )
    }

    pub fn embedding(&mut self, factor: usize, n_words: usize, dim: usize) -> Result<()> {
        if n_words == 0 || dim == 0 {
            return Err(anyhow!(
                "can not initialize embedding factor {factor} of {} with shape [{n_words}, {dim}]",
                self.layer
            ));
        }
        let table = norm_weight(n_words, dim, true, self.rng);
        self.insert(ParamRole::Embedding { factor }, table)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn ortho_weight_is_orthonormal() {
        let rng = RngStrategy::testable(1234);
        let q = ortho_weight(5, &rng);
        let product = q.transpose().matrix_product(&q);

        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((product.get(i, j) - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn norm_weight_is_small_when_rectangular() {
        let rng = RngStrategy::testable(1234);
        let w = norm_weight(4, 7, true, &rng);

        assert_eq!(w.shape(), (4, 7));
        assert!(w.values().iter().all(|x| x.abs() < 0.1));
    }

    #[test]
    fn gate_blocks_are_concatenated_with_scales() {
        let rng = RngStrategy::testable(1234);
        let mut params = ParameterSet::new();
        let layer = LayerId::new("gru");
        let mut init = ParamInitializer::new(&mut params, &layer, &rng).with_normalisation(true, true);

        init.weight_blocks(Projection::RecurrentGates { depth: 0 }, 3, 3, 2, true)
            .unwrap();
        init.bias(Projection::InputGates, 6).unwrap();
        init.layer_norm(Projection::RecurrentGates { depth: 0 }, 6).unwrap();

        let scope = params.scope(&layer);
        let u = scope
            .get(ParamRole::Weight(Projection::RecurrentGates { depth: 0 }))
            .unwrap();
        assert_eq!(u.shape(), (3, 6));
        let wns = scope
            .get(ParamRole::WeightNormScale(Projection::RecurrentGates { depth: 0 }))
            .unwrap();
        assert_eq!(wns, &Linear::with_value(1, 6, 1.0));
        let lns = scope
            .get(ParamRole::LayerNormScale(Projection::RecurrentGates { depth: 0 }))
            .unwrap();
        assert_eq!(lns, &Linear::with_value(1, 6, 1.0));
        assert_eq!(params.len(), 5);
    }

    #[test]
    fn unresolved_dimensions_are_configuration_errors() {
        let rng = RngStrategy::testable(1234);
        let mut params = ParameterSet::new();
        let layer = LayerId::new("ff");
        let mut init = ParamInitializer::new(&mut params, &layer, &rng);

        assert!(init.weight(Projection::Dense, 0, 4, false).is_err());
        assert!(init.embedding(0, 10, 0).is_err());
    }
}
