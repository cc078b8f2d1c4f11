//! In-memory store of embedded items.
//!
//! Items keep their content, the original high-dimensional vector and, once
//! a reduction has run, the reduced coordinates. Items are kept in insertion
//! order; that order is the row order handed to the t-SNE engine and the
//! order in which reduced coordinates are attached back.
//!
//! Nearest-neighbor search ranks items by cosine similarity over the
//! original vectors, never the reduced ones.

use crate::{Configuration, Embedding, Tsne, TsneError};
use ndarray::ArrayView2;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Identifier assigned to an item when it is added.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc_{}", self.0)
    }
}

/// A stored item.
#[derive(Clone, Debug)]
pub struct Item {
    id: ItemId,
    content: String,
    vector: Vec<f64>,
    magnitude: f64,
    reduced: Option<Vec<f64>>,
}

impl Item {
    /// The item's identifier.
    pub fn id(&self) -> ItemId {
        self.id
    }

    /// The text the vector was generated from.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// The original embedding vector.
    pub fn vector(&self) -> &[f64] {
        &self.vector
    }

    /// Reduced coordinates from the last reduction, if any.
    pub fn reduced(&self) -> Option<&[f64]> {
        self.reduced.as_deref()
    }
}

/// One search result.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit<'a> {
    /// Matching item
    pub id: ItemId,

    /// Cosine similarity to the query, in `[-1, 1]`
    pub score: f64,

    /// Payload of the matching item: the content it was added with
    pub payload: &'a str,
}

/// Ordered collection of embedded items.
#[derive(Clone, Debug, Default)]
pub struct VectorStore {
    items: Vec<Item>,
    next_id: u64,
}

impl VectorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item and returns its id.
    ///
    /// Content that is already stored is not added again; the existing id is
    /// returned and the stored vector is kept.
    ///
    /// # Errors
    /// * `StoreError::DimensionMismatch` if `vector`'s length differs from
    ///   the vectors already stored
    /// * `StoreError::NonFiniteVector` if `vector` has a NaN or infinite
    ///   component
    pub fn add<S>(&mut self, content: S, vector: Vec<f64>) -> Result<ItemId, StoreError>
    where
        S: Into<String>,
    {
        let content = content.into();
        if let Some(existing) = self.items.iter().find(|item| item.content == content) {
            return Ok(existing.id);
        }

        if let Some(expected) = self.dimension() {
            if vector.len() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }
        check_finite(&vector)?;

        let id = ItemId(self.next_id);
        self.next_id += 1;
        self.items.push(Item {
            id,
            content,
            magnitude: magnitude(&vector),
            vector,
            reduced: None,
        });

        Ok(id)
    }

    /// Looks up an item by id.
    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.items.iter().find(|item| item.id == id)
    }

    /// All items in insertion order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Original vectors in insertion order.
    pub fn all_vectors(&self) -> Vec<&[f64]> {
        self.items.iter().map(|item| item.vector.as_slice()).collect()
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Dimension of the stored vectors, if any are stored.
    pub fn dimension(&self) -> Option<usize> {
        self.items.first().map(|item| item.vector.len())
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Sets the reduced coordinates of the item at `index`.
    ///
    /// # Errors
    /// * `StoreError::IndexOutOfRange` if there is no item at `index`
    pub fn set_reduced(&mut self, index: usize, coordinates: Vec<f64>) -> Result<(), StoreError> {
        let len = self.items.len();
        let item = self
            .items
            .get_mut(index)
            .ok_or(StoreError::IndexOutOfRange { index, len })?;
        item.reduced = Some(coordinates);
        Ok(())
    }

    /// Attaches row `i` of `coordinates` to the `i`-th item.
    ///
    /// # Errors
    /// * `StoreError::CoordinateCount` if the row count differs from the
    ///   number of items
    pub fn attach_reduced(&mut self, coordinates: ArrayView2<f64>) -> Result<(), StoreError> {
        if coordinates.nrows() != self.items.len() {
            return Err(StoreError::CoordinateCount {
                expected: self.items.len(),
                actual: coordinates.nrows(),
            });
        }

        for (item, row) in self.items.iter_mut().zip(coordinates.rows()) {
            item.reduced = Some(row.to_vec());
        }
        Ok(())
    }

    /// Reduces every stored vector with t-SNE and attaches the resulting
    /// coordinates to the items.
    ///
    /// # Errors
    /// * Any error of [`Tsne::initialize`] or [`Tsne::run`]
    pub fn reduce(&mut self, config: Configuration) -> Result<Embedding, TsneError> {
        let tsne = Tsne::new(config);
        tsne.initialize(&self.all_vectors())?;
        let embedding = tsne.run()?;

        self.attach_reduced(embedding.coordinates.view())?;
        debug!("Attached reduced coordinates to {} items", self.items.len());

        Ok(embedding)
    }

    /// Finds the `k` items most similar to `query`.
    ///
    /// Results are sorted by descending cosine similarity; ties keep
    /// insertion order. Returns `min(k, len)` hits.
    ///
    /// # Errors
    /// * `StoreError::DimensionMismatch` if `query`'s length differs from the
    ///   stored vectors
    /// * `StoreError::NonFiniteVector` if `query` has a NaN or infinite
    ///   component
    pub fn search(&self, query: &[f64], k: usize) -> Result<Vec<SearchHit<'_>>, StoreError> {
        if let Some(expected) = self.dimension() {
            if query.len() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }
        check_finite(query)?;

        let query_magnitude = magnitude(query);
        let mut hits: Vec<SearchHit<'_>> = self
            .items
            .iter()
            .map(|item| SearchHit {
                id: item.id,
                score: cosine_with_magnitudes(query, query_magnitude, &item.vector, item.magnitude),
                payload: &item.content,
            })
            .collect();

        // Stable sort, so equal scores stay in insertion order. Stored and
        // query vectors are finite, so scores are never NaN; `-0.0` and `0.0`
        // compare equal.
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(k);

        Ok(hits)
    }

    /// Cosine similarity between the items at positions `a` and `b`.
    pub fn similarity(&self, a: usize, b: usize) -> Option<f64> {
        let a = self.items.get(a)?;
        let b = self.items.get(b)?;
        Some(cosine_with_magnitudes(
            &a.vector,
            a.magnitude,
            &b.vector,
            b.magnitude,
        ))
    }
}

/// Computes cosine similarity between two vectors.
///
/// Returns a value in `[-1, 1]` for finite inputs; a zero-magnitude vector on
/// either side gives `0`. Components of any finite magnitude are supported.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    cosine_with_magnitudes(a, magnitude(a), b, magnitude(b))
}

fn cosine_with_magnitudes(a: &[f64], a_magnitude: f64, b: &[f64], b_magnitude: f64) -> f64 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    if a_magnitude == 0.0 || b_magnitude == 0.0 {
        return 0.0;
    }

    // Each factor is normalized on its own so that neither the dot product
    // nor the product of magnitudes can overflow or underflow.
    let dot: f64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x / a_magnitude) * (y / b_magnitude))
        .sum();
    dot.clamp(-1.0, 1.0)
}

/// Euclidean norm, scaled by the largest component so that very large or
/// very small vectors keep a finite, non-zero norm.
fn magnitude(v: &[f64]) -> f64 {
    let scale = v.iter().fold(0.0_f64, |max, x| max.max(x.abs()));
    if scale == 0.0 {
        return 0.0;
    }

    scale * v.iter().map(|x| (x / scale).powi(2)).sum::<f64>().sqrt()
}

fn check_finite(vector: &[f64]) -> Result<(), StoreError> {
    match vector.iter().position(|x| !x.is_finite()) {
        Some(position) => Err(StoreError::NonFiniteVector { position }),
        None => Ok(()),
    }
}

/// Errors raised by the vector store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// A vector's length differs from the stored vectors
    #[error("Vector has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        /// Dimension of the stored vectors
        expected: usize,
        /// Dimension of the offending vector
        actual: usize,
    },

    /// Reduced coordinates do not match the number of items
    #[error("Got reduced coordinates for {actual} items, expected {expected}")]
    CoordinateCount {
        /// Number of stored items
        expected: usize,
        /// Number of coordinate rows provided
        actual: usize,
    },

    /// A vector has a NaN or infinite component
    #[error("Vector component {position} is not finite")]
    NonFiniteVector {
        /// Position of the first non-finite component
        position: usize,
    },

    /// No item at the given position
    #[error("Index {index} is out of range for {len} items")]
    IndexOutOfRange {
        /// Requested position
        index: usize,
        /// Number of stored items
        len: usize,
    },
}
