use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Root of all on-disk state. Every collection key `K` owns a shard
/// directory `embedding/<K>/` and a metadata database `embedding/<K>.db`
/// next to it.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The SEMDEX_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/semdex/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("SEMDEX_DATA_DIR") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("semdex")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        let embedding = root.join("embedding");
        std::fs::create_dir_all(&embedding)
            .map_err(|_| Error::DataDir(embedding.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/embedding`, the parent of every per-key index.
    pub fn embedding_root(&self) -> PathBuf {
        self.root.join("embedding")
    }

    /// `<root>/embedding/<key>/`, created on demand. Shard files live here.
    pub fn key_dir(&self, key: &str) -> Result<PathBuf> {
        let path = self.embedding_root().join(key);
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }

    /// `<root>/embedding/<key>.db`. Not created here; opening the store does.
    pub fn metadata_db(&self, key: &str) -> PathBuf {
        self.embedding_root().join(format!("{key}.db"))
    }

    /// `<root>/embedding/<key>/Docs`, the target of copy-indexing.
    /// Not created here; the copy operation does.
    pub fn docs_dir(&self, key: &str) -> PathBuf {
        self.embedding_root().join(key).join("Docs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.embedding_root(), tmp.path().join("embedding"));
        assert_eq!(
            dir.metadata_db("k1"),
            tmp.path().join("embedding").join("k1.db")
        );
        assert!(dir.embedding_root().is_dir());
    }

    #[test]
    fn key_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let key_dir = dir.key_dir("k1").unwrap();

        assert!(key_dir.is_dir());
        assert_eq!(key_dir, tmp.path().join("embedding").join("k1"));
    }

    #[test]
    fn docs_dir_is_not_created_eagerly() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        let docs = dir.docs_dir("k1");
        assert_eq!(docs, tmp.path().join("embedding").join("k1").join("Docs"));
        assert!(!docs.exists());
    }
}
