//! On-disk vector shards for one collection key.
//!
//! Every dump of the in-memory shard produces a new file
//! `flat_<n>.faiss` under the key's directory; searches run over all of
//! them and deletions rewrite only the files that held the removed ids.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    flat_index::FlatIndex,
    metadata_db::{MetadataDb, MetadataRow},
};

/// Shard file names look like `flat_3.faiss`.
pub const FLAT_INDEX_PREFIX: &str = "flat_";
pub const FLAT_INDEX_SUFFIX: &str = ".faiss";

/// The persisted shards of one key, rooted at its index directory.
#[derive(Debug, Clone)]
pub struct DiskShards {
    dir: PathBuf,
}

impl DiskShards {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All shard files in dump order (by sequence number).
    pub fn shard_files(&self) -> Result<Vec<PathBuf>> {
        let mut numbered = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(seq) = shard_sequence(&name.to_string_lossy()) else {
                continue;
            };
            numbered.push((seq, entry.path()));
        }
        numbered.sort_by_key(|(seq, _)| *seq);
        Ok(numbered.into_iter().map(|(_, path)| path).collect())
    }

    pub fn has_shards(&self) -> bool {
        self.shard_files().map(|files| !files.is_empty()).unwrap_or(false)
    }

    /// Name for the next dump: one past the highest existing sequence.
    fn next_shard_name(&self) -> Result<String> {
        let last = self
            .shard_files()?
            .iter()
            .filter_map(|path| {
                shard_sequence(&path.file_name()?.to_string_lossy())
            })
            .max()
            .unwrap_or(0);
        Ok(format!("{FLAT_INDEX_PREFIX}{}{FLAT_INDEX_SUFFIX}", last + 1))
    }

    /// Persist a dumped batch. Writes the shard file first, then commits
    /// the metadata and segment rows in one transaction; if the commit
    /// fails the file is removed again so nothing points at orphan rows.
    ///
    /// Returns the shard file name.
    pub fn dump(
        &self,
        shard: &FlatIndex,
        rows: &[MetadataRow],
        db: &MetadataDb,
    ) -> Result<String> {
        if shard.is_empty() {
            return Err(Error::Config(
                "refusing to persist an empty shard".into(),
            ));
        }

        let name = self.next_shard_name()?;
        let path = self.dir.join(&name);
        info!("saving vector shard to {}", path.display());
        shard.write_to(&path)?;

        if let Err(e) = db.insert_dump(rows, &name) {
            warn!(
                "metadata commit failed, removing {}: {e}",
                path.display()
            );
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        Ok(name)
    }

    /// Brute-force search across every persisted shard. Results are
    /// unioned keeping the smallest distance per id, ascending, at most
    /// `top_k` of them.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(i64, f32)>> {
        let mut best: HashMap<i64, f32> = HashMap::new();
        for path in self.shard_files()? {
            let shard = FlatIndex::read_from(&path)?;
            for (id, dist) in shard.search(query, top_k) {
                best.entry(id)
                    .and_modify(|d| {
                        if dist < *d {
                            *d = dist;
                        }
                    })
                    .or_insert(dist);
            }
        }

        let mut hits: Vec<(i64, f32)> = best.into_iter().collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Remove ids from their shard files. `by_shard` maps each file name
    /// to the ids it holds; every touched shard is rewritten in place.
    pub fn remove_ids(
        &self,
        by_shard: &HashMap<String, Vec<i64>>,
    ) -> Result<()> {
        for (name, ids) in by_shard {
            let path = self.dir.join(name);
            if !path.is_file() {
                warn!("shard {} is missing, skipping", path.display());
                continue;
            }
            let mut shard = FlatIndex::read_from(&path)?;
            if shard.remove_ids(ids) > 0 {
                shard.write_to(&path)?;
            }
        }
        Ok(())
    }
}

/// Parse the sequence number out of a `flat_<n>.faiss` file name.
fn shard_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(FLAT_INDEX_PREFIX)?
        .strip_suffix(FLAT_INDEX_SUFFIX)?
        .parse()
        .ok()
}
