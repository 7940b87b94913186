//! Distance functions consumed by the graph.
//!
//! The graph never computes a distance itself; it calls a [`VectorMetric`]
//! strategy chosen once when the index is created and recorded in the
//! metapage. Kernels are plain scalar loops the compiler can vectorize.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Pluggable distance function with optional normalization.
pub trait VectorMetric: Send + Sync + fmt::Debug {
    /// Smaller is closer.
    fn distance(&self, a: &[f32], b: &[f32]) -> f64;

    /// Prepare a vector for indexing or querying.
    ///
    /// Returns `None` when normalization is undefined (for example a zero
    /// vector under cosine distance); such rows are not indexed.
    fn normalize(&self, vector: Vec<f32>) -> Option<Vec<f32>> {
        Some(vector)
    }

    fn kind(&self) -> MetricKind;
}

/// Built-in metrics, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    #[default]
    L2,
    InnerProduct,
    Cosine,
    L1,
}

impl MetricKind {
    /// Instantiate the strategy object for this metric.
    pub fn metric(self) -> Arc<dyn VectorMetric> {
        match self {
            Self::L2 => Arc::new(L2),
            Self::InnerProduct => Arc::new(InnerProduct),
            Self::Cosine => Arc::new(Cosine),
            Self::L1 => Arc::new(L1),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::L2 => "l2",
            Self::InnerProduct => "inner_product",
            Self::Cosine => "cosine",
            Self::L1 => "l1",
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::L2 => 1,
            Self::InnerProduct => 2,
            Self::Cosine => 3,
            Self::L1 => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::L2),
            2 => Some(Self::InnerProduct),
            3 => Some(Self::Cosine),
            4 => Some(Self::L1),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2;

impl VectorMetric for L2 {
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        let sum: f32 = a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum();
        f64::from(sum).sqrt()
    }

    fn kind(&self) -> MetricKind {
        MetricKind::L2
    }
}

/// Negative inner product, so that larger products sort first.
#[derive(Debug, Clone, Copy, Default)]
pub struct InnerProduct;

impl VectorMetric for InnerProduct {
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        -f64::from(dot(a, b))
    }

    fn kind(&self) -> MetricKind {
        MetricKind::InnerProduct
    }
}

/// Cosine distance over unit vectors.
///
/// Vectors are normalized on the way in, so the distance reduces to
/// `1 - a·b`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl VectorMetric for Cosine {
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        1.0 - f64::from(dot(a, b))
    }

    fn normalize(&self, mut vector: Vec<f32>) -> Option<Vec<f32>> {
        let norm = dot(&vector, &vector).sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        vector.iter_mut().for_each(|x| *x /= norm);
        Some(vector)
    }

    fn kind(&self) -> MetricKind {
        MetricKind::Cosine
    }
}

/// Manhattan distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1;

impl VectorMetric for L1 {
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum();
        f64::from(sum)
    }

    fn kind(&self) -> MetricKind {
        MetricKind::L1
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Bit-level equality, used to collapse identical vectors.
#[inline]
pub(crate) fn bit_identical(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}
