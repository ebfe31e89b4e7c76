use anyhow::{anyhow, Result};

use crate::ml::Linear;

use super::vocab::EOS;

/// Time-major `[time, batch]` grid of token indices.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrid {
    len: usize,
    batch_size: usize,
    ids: Vec<usize>,
}

impl TokenGrid {
    /// Grid filled with `eos`.
    pub fn new(len: usize, batch_size: usize) -> Self {
        Self {
            len,
            batch_size,
            ids: vec![EOS; len * batch_size],
        }
    }

    pub fn from_rows(rows: &[Vec<usize>]) -> Result<Self> {
        let batch_size = rows.first().map(|x| x.len()).unwrap_or_default();
        if rows.iter().any(|x| x.len() != batch_size) {
            return Err(anyhow!("token grid rows must all have {batch_size} entries"));
        }
        Ok(Self {
            len: rows.len(),
            batch_size,
            ids: rows.concat(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn get(&self, t: usize, sample: usize) -> usize {
        self.ids[t * self.batch_size + sample]
    }

    pub fn set(&mut self, t: usize, sample: usize, id: usize) {
        self.ids[t * self.batch_size + sample] = id;
    }

    /// Token indices of every sample at step `t`.
    pub fn row(&self, t: usize) -> &[usize] {
        let start = t * self.batch_size;
        &self.ids[start..start + self.batch_size]
    }
}

/// Padded, time-major model input for one minibatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    /// One grid per source factor.
    pub x: Vec<TokenGrid>,
    pub x_mask: Linear,
    pub y: TokenGrid,
    pub y_mask: Linear,
}

impl PreparedBatch {
    pub fn batch_size(&self) -> usize {
        self.y.batch_size()
    }
}

/// Pads a minibatch to `[longest + 1, batch]` grids ending in `eos`, with masks
/// covering every real token plus the final `eos`.
///
/// With `maxlen`, pairs where either side has `maxlen` or more tokens are dropped.
/// Returns `None` when no pair remains.
pub fn prepare_data(
    source: &[Vec<Vec<usize>>],
    target: &[Vec<usize>],
    n_factors: usize,
    maxlen: Option<usize>,
) -> Result<Option<PreparedBatch>> {
    if source.len() != target.len() {
        return Err(anyhow!(
            "got {} source sentences for {} target sentences",
            source.len(),
            target.len()
        ));
    }
    let pairs: Vec<(&Vec<Vec<usize>>, &Vec<usize>)> = source
        .iter()
        .zip(target)
        .filter(|(x, y)| maxlen.map_or(true, |maxlen| x.len() < maxlen && y.len() < maxlen))
        .collect();
    if pairs.is_empty() {
        return Ok(None);
    }

    let batch_size = pairs.len();
    let x_len = pairs.iter().map(|(x, _)| x.len()).max().unwrap_or_default() + 1;
    let y_len = pairs.iter().map(|(_, y)| y.len()).max().unwrap_or_default() + 1;

    let mut x = vec![TokenGrid::new(x_len, batch_size); n_factors];
    let mut x_mask = Linear::new(x_len, batch_size);
    let mut y = TokenGrid::new(y_len, batch_size);
    let mut y_mask = Linear::new(y_len, batch_size);

    for (sample, (source, target)) in pairs.into_iter().enumerate() {
        for (t, factors) in source.iter().enumerate() {
            if factors.len() != n_factors {
                return Err(anyhow!(
                    "expected {n_factors} factors per source token, got {}",
                    factors.len()
                ));
            }
            for (grid, &id) in x.iter_mut().zip(factors) {
                grid.set(t, sample, id);
            }
        }
        for t in 0..=source.len() {
            x_mask.set(t, sample, 1.0);
        }
        for (t, &id) in target.iter().enumerate() {
            y.set(t, sample, id);
        }
        for t in 0..=target.len() {
            y_mask.set(t, sample, 1.0);
        }
    }

    Ok(Some(PreparedBatch {
        x,
        x_mask,
        y,
        y_mask,
    }))
}
