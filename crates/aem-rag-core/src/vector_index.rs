//! Flat (brute-force) vector index.
//!
//! Vectors are stored back to back in one `Vec<f32>`; the i-th vector is the
//! i-th entry added, which keeps it positionally aligned with the metadata
//! list the indexer appends in the same order. Search is exhaustive cosine
//! similarity.
//!
//! # File format
//!
//! ```text
//! "AEMV" | version: u32 LE | dims: u32 LE | count: u64 LE | count × dims f32 LE
//! ```

use anyhow::{bail, Result};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

const MAGIC: &[u8; 4] = b"AEMV";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// A search hit: position in the index and its similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub score: f32,
}

/// Append-only collection of fixed-dimension vectors.
#[derive(Debug, Clone, Default)]
pub struct FlatIndex {
    /// `0` until the first vectors are added.
    dims: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Create an empty index. Pass `0` to take the dimension from the first add.
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append vectors in order.
    ///
    /// Either every vector is appended or none is: a batch containing a
    /// vector of the wrong dimension is rejected as a whole.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        let Some(first) = vectors.first() else {
            return Ok(());
        };
        let dims = if self.dims == 0 { first.len() } else { self.dims };
        if dims == 0 {
            bail!("cannot add zero-dimension vectors");
        }
        if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
            bail!(
                "vector {} has {} dimensions, index expects {}",
                i,
                v.len(),
                dims
            );
        }

        self.dims = dims;
        self.data.reserve(vectors.len() * dims);
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    /// The vector stored at `position`.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        if position >= self.len() {
            return None;
        }
        let start = position * self.dims;
        Some(&self.data[start..start + self.dims])
    }

    /// Keep only the first `len` vectors.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len * self.dims);
    }

    /// Top-`k` positions by cosine similarity, best first.
    ///
    /// Ties keep insertion order. A query of the wrong dimension matches
    /// nothing.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        if k == 0 || self.is_empty() || query.len() != self.dims {
            return Vec::new();
        }

        let mut hits: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dims)
            .enumerate()
            .map(|(position, v)| Neighbor {
                position,
                score: cosine_similarity(query, v),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });
        hits.truncate(k);
        hits
    }

    /// Serialize to the file format described in the module docs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&vec_to_blob(&self.data));
        bytes
    }

    /// Parse the file format described in the module docs.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            bail!("not a vector index file (bad header)");
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            bail!(
                "unsupported vector index version {} (expected {})",
                version,
                FORMAT_VERSION
            );
        }
        let dims = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[12..20]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let body = &bytes[HEADER_LEN..];
        let expected = count
            .checked_mul(dims)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| anyhow::anyhow!("vector index header overflows"))?;
        if body.len() != expected {
            bail!(
                "vector index is truncated: header says {} × {} floats, found {} bytes",
                count,
                dims,
                body.len()
            );
        }

        Ok(Self {
            dims,
            data: blob_to_vec(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlatIndex {
        let mut index = FlatIndex::new(0);
        index
            .add(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]])
            .unwrap();
        index
    }

    #[test]
    fn first_add_fixes_dimension() {
        let index = sample();
        assert_eq!(index.dims(), 2);
        assert_eq!(index.len(), 3);
        assert_eq!(index.vector(1), Some(&[0.0, 1.0][..]));
        assert_eq!(index.vector(3), None);
    }

    #[test]
    fn mismatched_batch_is_rejected_whole() {
        let mut index = sample();
        let err = index.add(&[vec![1.0, 1.0], vec![1.0, 1.0, 1.0]]);
        assert!(err.is_err());
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn search_ranks_by_similarity() {
        let index = sample();
        let hits = index.search(&[1.0, 0.1], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].position, 0);
        assert_eq!(hits[1].position, 2);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn search_with_wrong_dimension_is_empty() {
        assert!(sample().search(&[1.0, 0.0, 0.0], 5).is_empty());
        assert!(FlatIndex::new(0).search(&[1.0], 5).is_empty());
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut index = FlatIndex::new(2);
        index.add(&[vec![1.0, 0.0], vec![1.0, 0.0]]).unwrap();
        let hits = index.search(&[1.0, 0.0], 2);
        assert_eq!(hits[0].position, 0);
        assert_eq!(hits[1].position, 1);
    }

    #[test]
    fn truncate_drops_tail() {
        let mut index = sample();
        index.truncate(1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.vector(0), Some(&[1.0, 0.0][..]));
    }

    #[test]
    fn bytes_survive_a_reload() {
        let index = sample();
        let restored = FlatIndex::from_bytes(&index.to_bytes()).unwrap();
        assert_eq!(restored.dims(), 2);
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.vector(2), index.vector(2));
    }

    #[test]
    fn short_body_is_an_error() {
        let mut bytes = sample().to_bytes();
        bytes.truncate(bytes.len() - 4);
        assert!(FlatIndex::from_bytes(&bytes).is_err());
        assert!(FlatIndex::from_bytes(b"nope").is_err());
    }
}
