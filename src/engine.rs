//! The engine: the operation surface the host application drives.
//!
//! One [`Engine`] owns every collection key's state (metadata store,
//! disk shards, in-memory tier) plus the shared embedder, parser, and
//! stop flag. Batch operations mirror the host protocol: they return a
//! plain `bool` and report progress through an optional status channel;
//! per-item failures are logged and skipped, batch-level failures abort.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
};

use tracing::{info, warn};

use crate::{
    data_dir::DataDir,
    embedder::Embedder,
    error::{Error, Result},
    metadata_db::MetadataDb,
    pipeline::{DocumentParser, KeyIndex, KeyState, Pipeline, PlainTextParser},
    search,
    vector_index::DiskShards,
};

/// Outcome reported on the status channel around every batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Creating,
    Success,
    Failed,
}

/// A status transition for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub key: String,
    pub status: IndexStatus,
}

enum BatchMode {
    Insert,
    InsertCopy,
    Update,
}

pub struct Engine {
    data_dir: DataDir,
    pipeline: Pipeline,
    embedder: Arc<dyn Embedder>,
    keys: Mutex<HashMap<String, Arc<KeyIndex>>>,
    stop: Arc<AtomicBool>,
    status: Mutex<Option<Sender<StatusEvent>>>,
}

impl Engine {
    pub fn new(data_dir: DataDir, embedder: Arc<dyn Embedder>) -> Self {
        Self::with_parser(data_dir, embedder, Arc::new(PlainTextParser))
    }

    pub fn with_parser(
        data_dir: DataDir,
        embedder: Arc<dyn Embedder>,
        parser: Arc<dyn DocumentParser>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let pipeline =
            Pipeline::new(parser, embedder.clone(), stop.clone());
        Self {
            data_dir,
            pipeline,
            embedder,
            keys: Mutex::new(HashMap::new()),
            stop,
            status: Mutex::new(None),
        }
    }

    /// Install a channel receiving [`StatusEvent`]s for batch operations.
    pub fn set_status_sender(&self, sender: Sender<StatusEvent>) {
        *self.status.lock().unwrap() = Some(sender);
    }

    /// Index documents under `key`. Returns `true` when at least one
    /// document was indexed and no batch-level error occurred.
    pub fn create_index(&self, files: &[PathBuf], key: &str) -> bool {
        self.run_batch(files, key, BatchMode::Insert)
    }

    /// Like [`Engine::create_index`], but each file is first copied into
    /// the key's managed `Docs/` directory and indexed under the copy.
    pub fn create_index_copy(&self, files: &[PathBuf], key: &str) -> bool {
        self.run_batch(files, key, BatchMode::InsertCopy)
    }

    /// Re-index documents (delete then insert, atomic per path).
    pub fn update_index(&self, files: &[PathBuf], key: &str) -> bool {
        self.run_batch(files, key, BatchMode::Update)
    }

    /// Remove documents from the index.
    pub fn delete_index(&self, files: &[PathBuf], key: &str) -> bool {
        let result = self
            .key_index(key)
            .and_then(|index| self.pipeline.delete(&index, files));
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("delete under key {key} failed: {e}");
                false
            }
        }
    }

    /// Top-K semantic query; returns the result document as JSON.
    pub fn vector_search(
        &self,
        query: &str,
        key: &str,
        top_k: usize,
    ) -> Result<String> {
        let index = self.key_index(key)?;
        let results = search::vector_search(
            &index,
            self.embedder.as_ref(),
            query,
            top_k,
        )?;
        results.to_json()
    }

    /// Whether the key has any live indexed content, in memory or on
    /// disk. File presence alone does not count: opening a key creates
    /// its database, and deletes can leave emptied shard files behind.
    pub fn index_exists(&self, key: &str) -> bool {
        {
            let keys = self.keys.lock().unwrap();
            if let Some(index) = keys.get(key) {
                if !index.state.lock().unwrap().cache.is_empty() {
                    return true;
                }
                return index.db.live_count().map(|n| n > 0).unwrap_or(false);
            }
        }
        // Key never opened in this process: consult its database if one
        // was ever created, without creating it here.
        let db_path = self.data_dir.metadata_db(key);
        if !db_path.is_file() {
            return false;
        }
        MetadataDb::open(&db_path)
            .and_then(|db| db.live_count())
            .map(|n| n > 0)
            .unwrap_or(false)
    }

    /// Every indexed source path for the key (persisted and cached),
    /// sorted and deduplicated.
    pub fn list_sources(&self, key: &str) -> Result<Vec<String>> {
        let index = self.key_index(key)?;
        let mut sources = index.db.list_sources()?;
        {
            let state = index.state.lock().unwrap();
            sources.extend(
                state.cache.values().map(|(source, _)| source.clone()),
            );
        }
        sources.sort();
        sources.dedup();
        Ok(sources)
    }

    /// Drop metadata rows for deleted records. Returns how many were
    /// purged.
    pub fn purge(&self, key: &str) -> Result<usize> {
        let index = self.key_index(key)?;
        index.db.purge_tombstoned()
    }

    /// Number of records for `key` still waiting in the memory tier.
    pub fn pending(&self, key: &str) -> usize {
        let keys = self.keys.lock().unwrap();
        keys.get(key)
            .map(|index| index.state.lock().unwrap().shard_len())
            .unwrap_or(0)
    }

    /// Request cancellation: every in-flight operation aborts at its
    /// next checkpoint and returns [`Error::Stopped`].
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Flush every non-empty memshard to disk. Runs on teardown so no
    /// indexed record is lost with the process.
    pub fn shutdown(&self) {
        let keys: Vec<Arc<KeyIndex>> =
            self.keys.lock().unwrap().values().cloned().collect();
        for index in keys {
            match self.pipeline.dump(&index) {
                Ok(true) => {
                    info!("flushed memshard for key {}", index.key);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("teardown dump failed for key {}: {e}", index.key);
                }
            }
        }
    }

    fn run_batch(
        &self,
        files: &[PathBuf],
        key: &str,
        mode: BatchMode,
    ) -> bool {
        self.notify(key, IndexStatus::Creating);
        match self.try_batch(files, key, mode) {
            Ok(indexed) if indexed > 0 => {
                self.notify(key, IndexStatus::Success);
                true
            }
            Ok(_) => {
                warn!("no documents were indexed under key {key}");
                self.notify(key, IndexStatus::Failed);
                false
            }
            Err(e) => {
                warn!("indexing under key {key} failed: {e}");
                self.notify(key, IndexStatus::Failed);
                false
            }
        }
    }

    fn try_batch(
        &self,
        files: &[PathBuf],
        key: &str,
        mode: BatchMode,
    ) -> Result<usize> {
        let index = self.key_index(key)?;

        if let BatchMode::Update = mode {
            return self.pipeline.update(&index, files);
        }

        let mut indexed = 0;
        for file in files {
            let outcome = match mode {
                BatchMode::Insert => {
                    self.pipeline.index_document(&index, file)
                }
                BatchMode::InsertCopy => {
                    self.pipeline.index_document_copy(&index, file)
                }
                BatchMode::Update => unreachable!(),
            };
            match outcome {
                Ok(_) => indexed += 1,
                Err(e) if is_recoverable(&e) => {
                    warn!("skipping {}: {e}", file.display());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(indexed)
    }

    /// Get or open the per-key resources.
    fn key_index(&self, key: &str) -> Result<Arc<KeyIndex>> {
        if key.is_empty() {
            return Err(Error::Config(
                "collection key must not be empty".into(),
            ));
        }

        let mut keys = self.keys.lock().unwrap();
        if let Some(index) = keys.get(key) {
            return Ok(index.clone());
        }

        let dir = self.data_dir.key_dir(key)?;
        let db = MetadataDb::open(&self.data_dir.metadata_db(key))?;
        let index = Arc::new(KeyIndex {
            key: key.to_string(),
            state: Mutex::new(KeyState::default()),
            db,
            shards: DiskShards::new(dir),
            docs_dir: self.data_dir.docs_dir(key),
        });
        keys.insert(key.to_string(), index.clone());
        Ok(index)
    }

    fn notify(&self, key: &str, status: IndexStatus) {
        if let Some(sender) = self.status.lock().unwrap().as_ref() {
            let _ = sender.send(StatusEvent {
                key: key.to_string(),
                status,
            });
        }
    }
}

/// Per-item errors: the offending document is skipped and the batch
/// continues.
fn is_recoverable(error: &Error) -> bool {
    matches!(
        error,
        Error::FileNotFound(_)
            | Error::DuplicateSource(_)
            | Error::UnparsableContent(_)
            | Error::EmptyAfterChunking(_)
    )
}
