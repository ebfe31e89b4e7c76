use anyhow::{anyhow, Result};

use crate::ml::{
    init::ParamInitializer,
    norm::{maybe_layer_norm, LayerNormalization},
    params::{ParamScope, Projection},
    Linear, NodeValue, Sequence,
};

use super::transition::{add_row, hadamard};

/// Additive attention over one encoder context, `source` tagging the dual-context copies.
#[derive(Debug, Clone)]
pub struct Attention {
    state_weights: Linear,
    state_ln: Option<LayerNormalization>,
    context_weights: Linear,
    context_bias: Linear,
    context_ln: Option<LayerNormalization>,
    score_weights: Linear,
    score_bias: Option<Linear>,
}

/// Context pre-projection `LN(context·Wc_att + b_att)`, computed once per forward pass.
#[derive(Debug, Clone)]
pub struct ProjectedContext {
    projected: Sequence,
}

impl Attention {
    pub fn init_params(
        init: &mut ParamInitializer,
        source: Option<u8>,
        dim: usize,
        context_dim: usize,
        with_score_bias: bool,
    ) -> Result<()> {
        let state = Projection::AttentionState { source };
        let context = Projection::AttentionContext { source };
        let score = Projection::AttentionScore { source };

        init.weight(state, dim, context_dim, true)?;
        init.layer_norm(state, context_dim)?;
        init.weight(context, context_dim, context_dim, true)?;
        init.bias(context, context_dim)?;
        init.layer_norm(context, context_dim)?;
        init.weight(score, context_dim, 1, true)?;
        if with_score_bias {
            init.bias(score, 1)?;
        }
        Ok(())
    }

    pub fn load(scope: &ParamScope, source: Option<u8>, with_score_bias: bool) -> Result<Self> {
        let state = Projection::AttentionState { source };
        let context = Projection::AttentionContext { source };
        let score = Projection::AttentionScore { source };

        Ok(Self {
            state_weights: scope.weight(state)?,
            state_ln: scope.layer_norm(state)?,
            context_weights: scope.weight(context)?,
            context_bias: scope.bias(context)?,
            context_ln: scope.layer_norm(context)?,
            score_weights: scope.weight(score)?,
            score_bias: if with_score_bias {
                Some(scope.bias(score)?)
            } else {
                None
            },
        })
    }

    pub fn context_dim(&self) -> usize {
        self.context_weights.count()
    }

    pub fn project_context(&self, context: &Sequence, dropout: &Linear) -> Result<ProjectedContext> {
        if context.feature_dim() != self.context_dim() {
            return Err(anyhow!(
                "attention expects context of dim {}, got shape {:?}",
                self.context_dim(),
                context.shape()
            ));
        }
        let projected = context
            .mask_features(dropout)?
            .project(&self.context_weights, Some(&self.context_bias))?;
        let projected = match &self.context_ln {
            Some(ln) => ln.forward_sequence(&projected)?,
            None => projected,
        };
        Ok(ProjectedContext { projected })
    }

    /// Returns the context vector `[batch, ctx_dim]` and weights `[batch, src_len]`.
    ///
    /// `context_mask` is `[src_len, batch]`; masked positions receive exactly zero weight.
    pub fn attend(
        &self,
        projected: &ProjectedContext,
        context: &Sequence,
        context_mask: Option<&Linear>,
        hidden: &Linear,
        dropouts: (&Linear, &Linear),
    ) -> Result<(Linear, Linear)> {
        let (state_dropout, score_dropout) = dropouts;
        let src_len = context.len();
        let batch_size = hidden.count();
        if context.batch_size() != batch_size {
            return Err(anyhow!(
                "context of shape {:?} does not match batch of {batch_size}",
                context.shape()
            ));
        }

        let pstate = maybe_layer_norm(
            self.state_ln.as_ref(),
            hadamard(hidden, state_dropout).matrix_product(&self.state_weights),
        )?;

        let mut scores = Linear::new(batch_size, src_len);
        for (j, pctx) in projected.projected.steps().iter().enumerate() {
            let energy = pctx.iter().add(pstate.iter()).map(|x| x.tanh()).collect();
            let mut score = hadamard(&energy, score_dropout).matrix_product(&self.score_weights);
            if let Some(bias) = &self.score_bias {
                score = add_row(&score, bias);
            }
            for (b, value) in score.values().iter().enumerate() {
                scores.set(b, j, *value);
            }
        }

        let alpha = masked_softmax(&scores, context_mask)?;

        let context_dim = context.feature_dim();
        let mut weighted = Linear::new(batch_size, context_dim);
        for (j, step) in context.steps().iter().enumerate() {
            let weights = Linear::from_iter(1, (0..batch_size).map(|b| alpha.get(b, j)))?;
            weighted = weighted
                .iter()
                .add(step.iter().dot_product(weights.iter().grow(context_dim)))
                .collect();
        }
        Ok((weighted, alpha))
    }
}

impl ProjectedContext {
    pub fn len(&self) -> usize {
        self.projected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projected.is_empty()
    }
}

/// Row-wise `exp(x - max) * m / Σ exp(x - max) * m` over `[batch, src_len]` scores.
pub fn masked_softmax(scores: &Linear, context_mask: Option<&Linear>) -> Result<Linear> {
    let (batch_size, src_len) = scores.shape();
    if let Some(mask) = context_mask {
        if mask.shape() != (src_len, batch_size) {
            return Err(anyhow!(
                "context mask of shape {:?} does not match scores {:?}",
                mask.shape(),
                scores.shape()
            ));
        }
    }

    let mut alpha = Linear::new(batch_size, src_len);
    for (b, row) in scores.rows_iter().enumerate() {
        let max = row
            .iter()
            .copied()
            .fold(NodeValue::NEG_INFINITY, NodeValue::max);
        let exps: Vec<NodeValue> = row
            .iter()
            .enumerate()
            .map(|(j, x)| {
                let m = context_mask.map(|mask| mask.get(j, b)).unwrap_or(1.0);
                (x - max).exp() * m
            })
            .collect();
        let sum = exps.iter().sum::<NodeValue>();
        let sum = if sum != 0.0 { sum } else { 1e-8 };
        for (j, x) in exps.into_iter().enumerate() {
            alpha.set(b, j, x / sum);
        }
    }
    Ok(alpha)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::ml::{
        params::{LayerId, ParameterSet},
        LayerInitStrategy, RngStrategy,
    };

    use super::*;

    #[test]
    fn masked_softmax_zeroes_padding() {
        let scores: Linear = "1 2 3
                              0.5 -1 4"
            .parse()
            .unwrap();
        let mask: Linear = "1 1
                            1 1
                            1 0"
        .parse()
        .unwrap();

        let alpha = masked_softmax(&scores, Some(&mask)).unwrap();
        assert_eq!(alpha.get(1, 2), 0.0);
        for row in alpha.rows_iter() {
            assert!((row.iter().sum::<NodeValue>() - 1.0).abs() < 1e-9);
        }
        assert!(alpha.get(0, 2) > alpha.get(0, 1));
    }

    #[test]
    fn fully_masked_rows_stay_finite() {
        let scores = Linear::with_value(1, 2, 1.0);
        let mask = Linear::new(2, 1);

        let alpha = masked_softmax(&scores, Some(&mask)).unwrap();
        assert_eq!(alpha.values(), &[0.0, 0.0]);
    }

    #[test]
    fn attention_weights_context_positions() {
        let rng = RngStrategy::testable(1234);
        let layer = LayerId::new("decoder");
        let mut params = ParameterSet::new();
        let mut init = ParamInitializer::new(&mut params, &layer, &rng).with_normalisation(true, false);
        Attention::init_params(&mut init, None, 3, 4, true).unwrap();

        let scope = params.scope(&layer).with_normalisation(true, false);
        let attention = Attention::load(&scope, None, true).unwrap();

        let mut values = Linear::new(5 * 2, 4);
        values.initialize_as_layer(&LayerInitStrategy::Normal { scale: 1.0 }, &rng);
        let context = Sequence::from_shape(&[5, 2, 4], values.values().to_vec()).unwrap();
        let mask: Linear = "1 1
                            1 1
                            1 1
                            0 1
                            0 1"
        .parse()
        .unwrap();
        let ones = (Linear::with_value(2, 3, 1.0), Linear::with_value(2, 4, 1.0));

        let projected = attention
            .project_context(&context, &Linear::with_value(2, 4, 1.0))
            .unwrap();
        let hidden = Linear::with_value(2, 3, 0.5);
        let (ctx, alpha) = attention
            .attend(&projected, &context, Some(&mask), &hidden, (&ones.0, &ones.1))
            .unwrap();

        assert_eq!(ctx.shape(), (2, 4));
        assert_eq!(alpha.shape(), (2, 5));
        assert_eq!(alpha.get(0, 3), 0.0);
        assert_eq!(alpha.get(0, 4), 0.0);
        let expected: NodeValue = (0..5)
            .map(|j| alpha.get(1, j) * context.step(j).get(1, 2))
            .sum();
        assert!((ctx.get(1, 2) - expected).abs() < 1e-9);
    }
}
