//! N-dimensional axis-aligned bounding envelopes.

use serde::{Deserialize, Serialize};

use crate::errors::{IndexError, IndexResult};

/// An n-dimensional axis-aligned bounding envelope.
///
/// An `Envelope` is defined by its minimum and maximum corner coordinates.
/// The dimension is fixed at construction and every coordinate pair satisfies
/// `min[i] <= max[i]`. Degenerate (point) envelopes with `min == max` are
/// valid and commonly used for point data.
///
/// # Examples
///
/// ```
/// use disk_rtree::Envelope;
///
/// let env = Envelope::new(vec![0.0, 0.0], vec![10.0, 5.0]).unwrap();
/// assert_eq!(env.dimension(), 2);
/// assert_eq!(env.area(), 50.0);
///
/// let point = Envelope::point(&[3.0, 3.0]).unwrap();
/// assert!(env.contains(&point));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl Envelope {
    /// Creates an envelope from minimum and maximum corner coordinates.
    ///
    /// Fails if the corners have different lengths, any coordinate is NaN,
    /// or `min[i] > max[i]` for some axis.
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> IndexResult<Envelope> {
        if min.is_empty() || min.len() != max.len() {
            return Err(IndexError::argument(format!(
                "envelope corners must be non-empty and of equal dimension (got {} and {})",
                min.len(),
                max.len()
            )));
        }
        for i in 0..min.len() {
            if min[i].is_nan() || max[i].is_nan() {
                return Err(IndexError::argument("envelope coordinates must not be NaN"));
            }
            if min[i] > max[i] {
                return Err(IndexError::argument(format!(
                    "envelope min {} exceeds max {} on axis {}",
                    min[i], max[i], i
                )));
            }
        }
        Ok(Envelope { min, max })
    }

    /// Creates a degenerate point envelope.
    pub fn point(coords: &[f64]) -> IndexResult<Envelope> {
        Envelope::new(coords.to_vec(), coords.to_vec())
    }

    /// Creates the empty envelope of the given dimension: the identity for
    /// [`expand`](Envelope::expand), containing nothing.
    pub fn empty(dimension: usize) -> Envelope {
        Envelope {
            min: vec![f64::INFINITY; dimension],
            max: vec![f64::NEG_INFINITY; dimension],
        }
    }

    /// Trusted constructor for coordinates decoded from a node record.
    pub(crate) fn from_raw(min: Vec<f64>, max: Vec<f64>) -> Envelope {
        Envelope { min, max }
    }

    pub fn dimension(&self) -> usize {
        self.min.len()
    }

    pub fn min(&self) -> &[f64] {
        &self.min
    }

    pub fn max(&self) -> &[f64] {
        &self.max
    }

    /// True when this envelope contains no points (see [`Envelope::empty`]).
    pub fn is_empty(&self) -> bool {
        self.min.iter().zip(&self.max).any(|(lo, hi)| lo > hi)
    }

    /// The n-dimensional volume (area in 2-D) of this envelope.
    pub fn area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// The center point of this envelope.
    pub fn center(&self) -> Vec<f64> {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    /// True when the two envelopes share at least one point.
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min
            .iter()
            .zip(&self.max)
            .zip(other.min.iter().zip(&other.max))
            .all(|((lo, hi), (olo, ohi))| lo <= ohi && olo <= hi)
    }

    /// True when `other` lies entirely inside this envelope.
    pub fn contains(&self, other: &Envelope) -> bool {
        self.min
            .iter()
            .zip(&self.max)
            .zip(other.min.iter().zip(&other.max))
            .all(|((lo, hi), (olo, ohi))| lo <= olo && ohi <= hi)
    }

    /// The smallest envelope covering both inputs.
    pub fn union(&self, other: &Envelope) -> Envelope {
        let mut merged = self.clone();
        merged.expand(other);
        merged
    }

    /// Grows this envelope in place to cover `other`.
    pub fn expand(&mut self, other: &Envelope) {
        for i in 0..self.min.len() {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    /// Area increase required for this envelope to cover `other`.
    pub fn enlargement(&self, other: &Envelope) -> f64 {
        self.union(other).area() - self.area()
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope({:?} - {:?})", self.min, self.max)
    }
}
