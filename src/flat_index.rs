//! Flat (brute-force) vector index with an id map, and its file format.
//!
//! Both the per-key in-memory shard and the persisted shard files use
//! this structure. Search is exhaustive squared-L2, ascending; ties
//! break on the lower id.
//!
//! Binary file layout (little-endian):
//! - 4 bytes magic `SDXF`
//! - 2 bytes format version (u16)
//! - 4 bytes vector dimension (u32)
//! - 8 bytes vector count (u64)
//! - count * 8 bytes ids (i64)
//! - count * dimension * 4 bytes vector data (f32, row-major)

use std::{collections::HashSet, path::Path};

use crate::error::{Error, Result};

const MAGIC: [u8; 4] = *b"SDXF";
const FORMAT_VERSION: u16 = 1;
const HEADER_SIZE: usize = 18;

#[derive(Debug, Clone, Default)]
pub struct FlatIndex {
    dim: usize,
    ids: Vec<i64>,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ids: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    /// Append vectors under the given ids. `vectors` is row-major and
    /// must hold exactly `ids.len() * dim` values.
    pub fn add(&mut self, ids: &[i64], vectors: &[f32]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if self.dim == 0 || vectors.len() != ids.len() * self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                got: vectors.len() / ids.len(),
            });
        }
        self.ids.extend_from_slice(ids);
        self.data.extend_from_slice(vectors);
        Ok(())
    }

    /// Remove every row whose id is in `remove`. Returns the number of
    /// rows dropped.
    pub fn remove_ids(&mut self, remove: &[i64]) -> usize {
        if remove.is_empty() || self.ids.is_empty() {
            return 0;
        }
        let remove: HashSet<i64> = remove.iter().copied().collect();

        let mut ids = Vec::with_capacity(self.ids.len());
        let mut data = Vec::with_capacity(self.data.len());
        for (row, &id) in self.ids.iter().enumerate() {
            if remove.contains(&id) {
                continue;
            }
            ids.push(id);
            data.extend_from_slice(
                &self.data[row * self.dim..(row + 1) * self.dim],
            );
        }

        let removed = self.ids.len() - ids.len();
        self.ids = ids;
        self.data = data;
        removed
    }

    /// Exhaustive top-K search by squared L2 distance, ascending.
    ///
    /// Returns an empty result when the query dimension does not match.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<(i64, f32)> {
        if query.len() != self.dim || top_k == 0 {
            return Vec::new();
        }

        let mut hits: Vec<(i64, f32)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(row, &id)| {
                let start = row * self.dim;
                let vector = &self.data[start..start + self.dim];
                let dist = vector
                    .iter()
                    .zip(query)
                    .map(|(a, b)| {
                        let d = a - b;
                        d * d
                    })
                    .sum::<f32>();
                (id, dist)
            })
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits.truncate(top_k);
        hits
    }

    /// Serialize the index to `path`, replacing any existing file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut bytes = Vec::with_capacity(
            HEADER_SIZE + self.ids.len() * 8 + self.data.len() * 4,
        );
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dim as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.ids.len() as u64).to_le_bytes());
        bytes.extend_from_slice(bytemuck::cast_slice(&self.ids));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.data));
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load an index previously written with [`FlatIndex::write_to`].
    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let corrupt = || Error::CorruptIndexFile(path.to_path_buf());

        if bytes.len() < HEADER_SIZE || bytes[0..4] != MAGIC {
            return Err(corrupt());
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(corrupt());
        }
        let dim = u32::from_le_bytes(bytes[6..10].try_into().unwrap()) as usize;
        let count =
            u64::from_le_bytes(bytes[10..18].try_into().unwrap()) as usize;

        let ids_end = HEADER_SIZE + count * 8;
        let expected = ids_end + count * dim * 4;
        if bytes.len() != expected {
            return Err(corrupt());
        }

        let ids: Vec<i64> =
            bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..ids_end]);
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[ids_end..]);

        Ok(Self { dim, ids, data })
    }
}
