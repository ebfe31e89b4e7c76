use std::iter;

use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ml::{LayerInitStrategy, LayerValues, NodeValue, RngStrategy};

use self::iter_ext::KnownSizeIterator;

/// Row-major matrix of `count` rows by `stride` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    inner: LayerValues,
    stride: usize,
    count: usize,
}

impl Linear {
    pub fn new(count: usize, stride: usize) -> Self {
        Self::with_value(count, stride, 0.0)
    }

    pub fn with_dimensions(other: &Self) -> Self {
        Self::with_value(other.count, other.stride, 0.0)
    }

    pub fn with_value(count: usize, stride: usize, value: NodeValue) -> Self {
        let size = count * stride;
        Self {
            inner: LayerValues::new(vec![value; size]),
            stride,
            count,
        }
    }

    pub fn from_iter<I: Iterator<Item = NodeValue>>(stride: usize, values: I) -> Result<Self> {
        if stride == 0 {
            return Err(anyhow!("can not create linear with zero stride"));
        }
        let inner: LayerValues = values.collect();
        let count = inner.len() / stride;

        if inner.len() != stride * count {
            Err(anyhow!("mismatched values length/stride"))?;
        }

        Ok(Self {
            inner,
            stride,
            count,
        })
    }

    /// Builds a `[1, len]` row vector.
    pub fn from_row(values: &[NodeValue]) -> Result<Self> {
        Linear::from_iter(values.len(), values.iter().copied())
    }

    pub fn zero(&mut self) {
        self.inner.iter_mut().for_each(|x| *x = 0.0);
    }

    pub fn initialize_as_layer(&mut self, strategy: &LayerInitStrategy, rng: &RngStrategy) {
        strategy.apply(self.inner.iter_mut(), rng);
    }

    pub fn iter<'a>(&'a self) -> LinearIter<'a, impl Iterator<Item = NodeValue> + 'a> {
        LinearIter {
            inner: self.inner.iter().copied(),
            stride: self.stride,
            count: self.count,
            parent: Some(self),
        }
    }

    pub fn iter_transpose<'a>(&'a self) -> LinearIter<'a, impl Iterator<Item = NodeValue> + 'a> {
        let stride = self.stride;
        let count = self.count;

        let x = (0..self.inner.len()).map(move |idx| {
            let (x, y) = (idx % count, idx / count);
            let (i, j) = (y, x); // transpose dims
            let inner_idx = i + j * stride;
            self.inner[inner_idx]
        });
        LinearIter {
            inner: x,
            stride: count,
            count: stride,
            parent: None,
        }
    }

    pub fn transpose(&self) -> Linear {
        self.iter_transpose().collect()
    }

    /// Joins columns of `self` and `rhs` row by row.
    pub fn concat<'a>(&'a self, rhs: &'a Linear) -> BoxedLinearIter<'a> {
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        let self_items = self.inner.chunks_exact(self.stride.max(1));
        let rhs_items = rhs.inner.chunks_exact(rhs.stride.max(1));
        BoxedLinearIter {
            inner: Box::new(
                self_items
                    .zip(rhs_items)
                    .flat_map(|(lhs, rhs)| lhs.iter().chain(rhs).copied())
                    .collect_vec()
                    .into_iter(),
            ),
            stride: self.stride + rhs.stride,
            count: self.count,
            parent: None,
        }
    }

    pub fn concat_all(parts: &[&Linear]) -> Result<Linear> {
        let first = parts.first().context("no blocks provided to concat")?;
        let count = first.count;
        if let Some(part) = parts.iter().find(|x| x.count != count) {
            return Err(anyhow!(
                "mismatched count dimension: expected={count}, actual={}",
                part.count
            ));
        }
        let stride = parts.iter().map(|x| x.stride).sum();
        let mut inner = Vec::with_capacity(stride * count);
        for row_idx in 0..count {
            for part in parts {
                inner.extend_from_slice(part.row(row_idx));
            }
        }
        Ok(Linear {
            inner: LayerValues::new(inner),
            stride,
            count,
        })
    }

    /// Copies columns `[start, start + width)` into a new matrix.
    pub fn slice_columns(&self, start: usize, width: usize) -> Linear {
        assert!(start + width <= self.stride, "column slice out of range");
        Linear {
            inner: self
                .rows_iter()
                .flat_map(|row| row[start..start + width].iter())
                .copied()
                .collect(),
            stride: width,
            count: self.count,
        }
    }

    /// Splits the columns into `n` equal blocks (gate slicing).
    pub fn split(&self, n: usize) -> Vec<Self> {
        assert_eq!(self.stride % n, 0, "mismatched dimensions");
        let stride = self.stride / n;
        (0..n)
            .map(|i| self.slice_columns(i * stride, stride))
            .collect()
    }

    pub fn matrix_product(&self, rhs: &Linear) -> Linear {
        assert_eq!(self.stride, rhs.count, "mismatched dimensions");
        let (n, k) = (rhs.stride, self.stride);
        let mut c = vec![0.0; self.count * n];

        if n > 0 && k > 0 {
            for (c_row, a_row) in c.chunks_exact_mut(n).zip(self.inner.chunks_exact(k)) {
                for (&a, b_row) in a_row.iter().zip(rhs.inner.chunks_exact(n)) {
                    for (c, &b) in c_row.iter_mut().zip(b_row.iter()) {
                        *c = a.mul_add(b, *c);
                    }
                }
            }
        }

        Linear {
            inner: LayerValues::new(c),
            stride: n,
            count: self.count,
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.count, self.stride)
    }

    pub fn is_finite(&self) -> bool {
        self.inner.iter().all(|x| x.is_finite())
    }

    pub fn values(&self) -> &[NodeValue] {
        &self.inner
    }

    pub fn rows_iter(&self) -> impl Iterator<Item = &[NodeValue]> {
        self.inner.chunks_exact(self.stride.max(1)).take(self.count)
    }

    pub fn row(&self, row_idx: usize) -> &[NodeValue] {
        let start = row_idx * self.stride;
        &self.inner[start..start + self.stride]
    }

    pub fn get(&self, row_idx: usize, col_idx: usize) -> NodeValue {
        self.inner[row_idx * self.stride + col_idx]
    }

    pub fn set(&mut self, row_idx: usize, col_idx: usize, value: NodeValue) {
        self.inner[row_idx * self.stride + col_idx] = value;
    }
}

impl std::fmt::Display for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.rows_iter()
            .fold(&mut f.debug_list(), |list, row| list.entry(&row))
            .finish()
    }
}

impl std::str::FromStr for Linear {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lines = s
            .lines()
            .filter_map(|x| Some(x.trim()).filter(|x| !x.is_empty()))
            .collect_vec();

        let count = lines.len();
        if count == 0 {
            return Err(anyhow!("no rows found"));
        }
        let elements: Result<Vec<NodeValue>, _> = lines
            .into_iter()
            .flat_map(|line| line.split_whitespace().map(|x| x.parse::<NodeValue>()))
            .collect();

        let elements = elements.context("invalid numerical found")?;
        let stride = elements.len() / count;

        if stride * count == elements.len() {
            Linear::from_iter(stride, elements.into_iter())
        } else {
            Err(anyhow!("mismatch row length found"))
        }
    }
}

impl Default for Linear {
    fn default() -> Self {
        Self {
            inner: LayerValues::new(vec![0.0]),
            stride: 1,
            count: 1,
        }
    }
}

pub type BoxedLinearIter<'a> = LinearIter<'a, Box<dyn Iterator<Item = NodeValue> + 'a>>;

#[must_use = "linear iterators are lazy and do nothing unless consumed"]
pub struct LinearIter<'a, I> {
    inner: I,
    stride: usize,
    count: usize,
    parent: Option<&'a Linear>,
}

impl<'a, I> LinearIter<'a, I>
where
    I: Iterator<Item = NodeValue> + 'a,
{
    /// returns underlying data stride dimension size (or 'width')
    pub fn stride(&self) -> usize {
        self.stride
    }
    /// returns underlying data count dimension size (or 'height')
    pub fn count(&self) -> usize {
        self.count
    }
    /// point-wise multiplication
    pub fn dot_product(
        self,
        other: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, other.stride, "mismatched stride dimension");
        assert_eq!(self.count, other.count, "mismatched count dimension");
        LinearIter {
            inner: self.inner.zip(other.inner).map(|(x, y)| x * y),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise division
    pub fn div(
        self,
        rhs: LinearIter<'a, impl Iterator<Item = NodeValue>>,
        epsilon: Option<NodeValue>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        let e = epsilon.unwrap_or(0.0);
        LinearIter {
            inner: self.inner.zip(rhs.inner).map(move |(x, y)| x / (y + e)),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise addition
    pub fn add(
        self,
        other: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, other.stride, "mismatched stride dimension");
        assert_eq!(self.count, other.count, "mismatched count dimension");
        LinearIter {
            inner: self.inner.zip(other.inner).map(|(x, y)| x + y),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise addition by scalar constant
    pub fn add_scalar(self, rhs: NodeValue) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x + rhs),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise subtraction
    pub fn sub(
        self,
        rhs: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        LinearIter {
            inner: self.inner.zip(rhs.inner).map(|(x, y)| x - y),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise multiplication by scalar constant
    pub fn multiply_scalar(
        self,
        rhs: NodeValue,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x * rhs),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise raise to the power of scalar integer constant
    pub fn powi_scalar(self, n: i32) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x.powi(n)),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise square root value computation
    pub fn sqrt(self) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x.sqrt()),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise arbitrary function
    pub fn map<F: Fn(NodeValue) -> NodeValue + 'a>(
        self,
        func: F,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(func),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// extends stride dimension by copying duplicating column values
    /// Note: stride dimension must be equal to 1
    pub fn grow(self, stride: usize) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, 1, "can only grow when stride dimension = 1");
        assert_ne!(stride, 0, "invalid stride dimension");
        LinearIter {
            inner: self.inner.flat_map(move |x| iter::repeat(x).take(stride)),
            stride,
            count: self.count,
            parent: None,
        }
    }
    /// extends count dimension by copying duplicating row values
    /// Note: count dimension must be equal to 1
    pub fn stack(self, count: usize) -> BoxedLinearIter<'a> {
        assert_eq!(self.count, 1, "can only stack when count dimension = 1");
        LinearIter {
            inner: match self.parent {
                Some(parent) => Box::new(
                    parent
                        .inner
                        .iter()
                        .copied()
                        .cycle()
                        .take(self.stride * count),
                ),
                None => Box::new(
                    self.inner
                        .collect_vec()
                        .into_iter()
                        .cycle()
                        .take(self.stride * count),
                ),
            },

            stride: self.stride,
            count,
            parent: None,
        }
    }
    /// row-wise softmax, fully masked rows fall back to a tiny denominator
    pub fn softmax(self) -> Linear {
        let inner_vec = self.inner.collect_vec();
        let mut exp_counts = inner_vec
            .chunks_exact(self.stride.max(1))
            .flat_map(|chunk| {
                let max = chunk
                    .iter()
                    .max_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal))
                    .cloned()
                    .unwrap_or_default();
                chunk.iter().map(move |&x| {
                    if x != NodeValue::NEG_INFINITY {
                        (x - max).exp()
                    } else {
                        0.0
                    }
                })
            })
            .collect_vec();
        let inner = {
            exp_counts
                .chunks_exact_mut(self.stride.max(1))
                .for_each(|chunk| {
                    let sum = chunk.iter().sum::<NodeValue>();
                    let sum = if sum != 0.0 { sum } else { 1e-8 };
                    chunk.iter_mut().for_each(|x| *x /= sum);
                });
            exp_counts.into()
        };
        Linear {
            inner,
            stride: self.stride,
            count: self.count,
        }
    }
    pub fn flatten_sum(self) -> Linear {
        Linear {
            inner: self
                .inner
                .chunks(self.stride)
                .into_iter()
                .map(|x| x.sum::<NodeValue>())
                .collect(),
            stride: 1,
            count: self.count,
        }
    }
    pub fn flatten_mean(self) -> Linear {
        let stride = self.stride as NodeValue;
        Linear {
            inner: self
                .inner
                .chunks(self.stride)
                .into_iter()
                .map(|x| x.sum::<NodeValue>() / stride)
                .collect(),
            stride: 1,
            count: self.count,
        }
    }
    /// population variance of each row around the supplied `[count, 1]` mean
    pub fn flatten_variance(self, mean: LinearIter<'a, impl Iterator<Item = NodeValue>>) -> Linear {
        assert_eq!(self.count, mean.count, "mismatched count dimension");
        assert_eq!(mean.stride, 1, "invalid mean stride dimension");
        let stride = self.stride as NodeValue;
        Linear {
            inner: self
                .inner
                .chunks(self.stride)
                .into_iter()
                .zip(mean.inner)
                .map(|(x, mean)| x.map(|x| (x - mean).powi(2)).sum::<NodeValue>() / stride)
                .collect(),
            stride: 1,
            count: self.count,
        }
    }
    pub fn collect(self) -> Linear {
        Linear {
            inner: self.inner.with_size(self.stride * self.count).collect(),
            stride: self.stride,
            count: self.count,
        }
    }
}

mod iter_ext {
    use crate::ml::NodeValue;

    pub trait KnownSizeIterator: Iterator<Item = NodeValue> {
        fn with_size(self, size: usize) -> KnownSizedIter<Self>
        where
            Self: Sized,
        {
            KnownSizedIter { inner: self, size }
        }
    }

    pub struct KnownSizedIter<I> {
        size: usize,
        inner: I,
    }

    impl<I: Iterator<Item = NodeValue>> Iterator for KnownSizedIter<I> {
        type Item = NodeValue;

        fn next(&mut self) -> Option<Self::Item> {
            self.inner.next()
        }

        fn size_hint(&self) -> (usize, Option<usize>) {
            (self.size, Some(self.size))
        }
    }

    impl<I: Iterator<Item = NodeValue>> ExactSizeIterator for KnownSizedIter<I> {
        fn len(&self) -> usize {
            self.size
        }
    }

    impl<I: Iterator<Item = NodeValue>> KnownSizeIterator for I {}
}
