//! Ingest pipeline: parse, chunk, embed, allocate ids, cache.
//!
//! Each collection key owns a [`KeyIndex`]: the metadata store, the
//! persisted shards, and the in-memory tier (the chunk cache and the
//! memshard) behind a single mutex. Records accumulate in memory and
//! are promoted to disk once the memshard crosses [`DUMP_THRESHOLD`].
//!
//! All fallible work (parsing, chunking, embedding) happens before any
//! state is touched; the cache mutation is one critical section at the
//! end of the call, so a stopped or failed ingest leaves the key
//! exactly as it was.

use std::{
    collections::HashMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, info, warn};

use crate::{
    chunking,
    embedder::Embedder,
    error::{Error, Result},
    flat_index::FlatIndex,
    metadata_db::{MetadataDb, MetadataRow},
    vector_index::DiskShards,
};

/// Number of memshard vectors that triggers a dump to disk.
pub const DUMP_THRESHOLD: usize = 2;

/// Turns a document file into plain UTF-8 text. The real parser is an
/// external collaborator; [`PlainTextParser`] covers text-shaped files.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<String>;
}

pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn parse(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path)?;
        String::from_utf8(bytes)
            .map_err(|_| Error::UnparsableContent(path.to_path_buf()))
    }
}

/// The in-memory tier of one key: id-to-(source, content) cache plus
/// the memshard, guarded together.
#[derive(Default)]
pub struct KeyState {
    pub cache: HashMap<i64, (String, String)>,
    pub shard: Option<FlatIndex>,
}

impl KeyState {
    pub fn has_source(&self, source: &str) -> bool {
        self.cache.values().any(|(s, _)| s == source)
    }

    pub fn shard_len(&self) -> usize {
        self.shard.as_ref().map(FlatIndex::len).unwrap_or(0)
    }
}

/// Everything one collection key owns.
pub struct KeyIndex {
    pub key: String,
    pub state: Mutex<KeyState>,
    pub db: MetadataDb,
    pub shards: DiskShards,
    pub docs_dir: PathBuf,
}

/// The ingest orchestrator, shared across keys.
pub struct Pipeline {
    parser: Arc<dyn DocumentParser>,
    embedder: Arc<dyn Embedder>,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        parser: Arc<dyn DocumentParser>,
        embedder: Arc<dyn Embedder>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            parser,
            embedder,
            stop,
        }
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop.load(Ordering::Relaxed) {
            Err(Error::Stopped)
        } else {
            Ok(())
        }
    }

    /// Index one document under the key. Duplicate sources, missing
    /// files, unparsable content, and chunk-less documents are
    /// rejected; on success the chunks land in the cache and the
    /// memshard, and a dump runs if the threshold was crossed.
    ///
    /// Returns the number of chunks indexed.
    pub fn index_document(
        &self,
        index: &KeyIndex,
        path: &Path,
    ) -> Result<usize> {
        self.check_stop()?;
        let path = existing(path)?;
        let source = path_string(&path);
        self.reject_duplicate(index, &source, &path)?;

        let chunks = self.chunk_document(&path)?;
        let vectors = self.embedder.embed_documents(&chunks)?;
        self.check_stop()?;

        let count = self.commit(index, &source, chunks, vectors)?;
        debug!("indexed {count} chunks from {source}");
        self.dump_if_needed(index)?;
        Ok(count)
    }

    /// Copy the document into the key's managed `Docs/` directory
    /// (read-only, mode 444) and index the copy. A failed copy or
    /// chmod leaves every tier untouched.
    pub fn index_document_copy(
        &self,
        index: &KeyIndex,
        path: &Path,
    ) -> Result<usize> {
        self.check_stop()?;
        let path = existing(path)?;
        let name = path
            .file_name()
            .ok_or_else(|| Error::CopyFailed(path.clone()))?
            .to_owned();
        let copy_path = index.docs_dir.join(&name);
        let source = path_string(&copy_path);
        self.reject_duplicate(index, &source, &copy_path)?;

        let chunks = self.chunk_document(&path)?;
        let vectors = self.embedder.embed_documents(&chunks)?;
        self.check_stop()?;

        fs::create_dir_all(&index.docs_dir)
            .map_err(|_| Error::CopyFailed(path.clone()))?;
        fs::copy(&path, &copy_path)
            .map_err(|_| Error::CopyFailed(path.clone()))?;
        if fs::set_permissions(&copy_path, fs::Permissions::from_mode(0o444))
            .is_err()
        {
            let _ = fs::remove_file(&copy_path);
            return Err(Error::ChmodFailed(copy_path));
        }

        let count = self.commit(index, &source, chunks, vectors)?;
        info!("indexed copy {source}");
        self.dump_if_needed(index)?;
        Ok(count)
    }

    /// Delete-then-reinsert each path. The embedding for the new
    /// version happens before the old one is removed, so a failure
    /// leaves the path in its original state. Returns how many paths
    /// were updated; failures are logged and skipped.
    pub fn update(&self, index: &KeyIndex, paths: &[PathBuf]) -> Result<usize> {
        let mut updated = 0;
        for path in paths {
            self.check_stop()?;
            match self.update_one(index, path) {
                Ok(()) => updated += 1,
                Err(e) => warn!("skipping update of {}: {e}", path.display()),
            }
        }
        Ok(updated)
    }

    fn update_one(&self, index: &KeyIndex, path: &Path) -> Result<()> {
        let path = existing(path)?;
        let source = path_string(&path);

        let chunks = self.chunk_document(&path)?;
        let vectors = self.embedder.embed_documents(&chunks)?;
        self.check_stop()?;

        self.delete(index, std::slice::from_ref(&path))?;
        self.commit(index, &source, chunks, vectors)?;
        self.dump_if_needed(index)?;
        Ok(())
    }

    /// Remove every record whose source is one of `paths`: from the
    /// cache, the memshard, the persisted shard files, and (via
    /// tombstones) the metadata. Copies under `Docs/` are deleted from
    /// disk as well. Returns the number of records removed.
    pub fn delete(&self, index: &KeyIndex, paths: &[PathBuf]) -> Result<usize> {
        self.check_stop()?;
        // Match both the verbatim and the canonical spelling of each
        // path; ingest stores the canonical form for regular files and
        // the constructed form for managed copies.
        let mut sources: Vec<String> = Vec::with_capacity(paths.len());
        for path in paths {
            let verbatim = path_string(path);
            let canonical = path_string(&canonical_or_verbatim(path));
            if canonical != verbatim {
                sources.push(canonical);
            }
            sources.push(verbatim);
        }

        // Persisted tier first: rewrite the shard files, then tombstone.
        let ids = index.db.ids_for_sources(&sources)?;
        if !ids.is_empty() {
            let by_shard = index.db.shards_for_ids(&ids)?;
            index.shards.remove_ids(&by_shard)?;
            index.db.tombstone(&ids)?;
        }

        // In-memory tier.
        let mut removed = ids.len();
        {
            let mut guard = index.state.lock().unwrap();
            let state = &mut *guard;
            let cached: Vec<i64> = state
                .cache
                .iter()
                .filter(|(_, (source, _))| sources.contains(source))
                .map(|(&id, _)| id)
                .collect();
            for id in &cached {
                state.cache.remove(id);
            }
            if let Some(shard) = state.shard.as_mut() {
                shard.remove_ids(&cached);
                if shard.is_empty() {
                    state.shard = None;
                }
            }
            removed += cached.len();
        }

        // Managed copies lose their file too.
        for source in &sources {
            let path = Path::new(source);
            if path.starts_with(&index.docs_dir) && path.is_file() {
                if let Err(e) = fs::remove_file(path) {
                    warn!("could not remove copied doc {source}: {e}");
                }
            }
        }

        if removed > 0 {
            info!("deleted {removed} records under key {}", index.key);
        }
        Ok(removed)
    }

    /// Promote the memshard to a new persisted shard once it holds at
    /// least [`DUMP_THRESHOLD`] vectors.
    pub fn dump_if_needed(&self, index: &KeyIndex) -> Result<bool> {
        self.dump_at(index, DUMP_THRESHOLD)
    }

    /// Unconditional dump of a non-empty memshard; used on teardown.
    pub fn dump(&self, index: &KeyIndex) -> Result<bool> {
        self.dump_at(index, 1)
    }

    /// The dump protocol: snapshot the memshard and its cache rows
    /// under the mutex, release it for the file write and the metadata
    /// transaction, then re-take it to clear exactly the dumped ids.
    fn dump_at(&self, index: &KeyIndex, threshold: usize) -> Result<bool> {
        let (snapshot, rows) = {
            let state = index.state.lock().unwrap();
            let Some(shard) = state.shard.as_ref() else {
                return Ok(false);
            };
            if shard.len() < threshold {
                return Ok(false);
            }
            let rows: Vec<MetadataRow> = shard
                .ids()
                .iter()
                .filter_map(|&id| {
                    let (source, content) = state.cache.get(&id)?;
                    Some(MetadataRow {
                        id,
                        source: source.clone(),
                        content: content.clone(),
                    })
                })
                .collect();
            (shard.clone(), rows)
        };

        let name = index.shards.dump(&snapshot, &rows, &index.db)?;
        info!(
            "dumped {} vectors for key {} into {name}",
            snapshot.len(),
            index.key
        );

        let mut guard = index.state.lock().unwrap();
        let state = &mut *guard;
        for id in snapshot.ids() {
            state.cache.remove(id);
        }
        if let Some(shard) = state.shard.as_mut() {
            shard.remove_ids(snapshot.ids());
            if shard.is_empty() {
                state.shard = None;
            }
        }
        Ok(true)
    }

    fn reject_duplicate(
        &self,
        index: &KeyIndex,
        source: &str,
        path: &Path,
    ) -> Result<()> {
        if index.db.is_duplicate(source)? {
            return Err(Error::DuplicateSource(path.to_path_buf()));
        }
        if index.state.lock().unwrap().has_source(source) {
            return Err(Error::DuplicateSource(path.to_path_buf()));
        }
        Ok(())
    }

    fn chunk_document(&self, path: &Path) -> Result<Vec<String>> {
        let text = self.parser.parse(path)?;
        let mut chunks = chunking::split_text(&text);

        // Long basenames are worth finding on their own.
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if stem.len() > chunking::BASENAME_INDEX_BYTES
            && let Some(name) = path.file_name()
        {
            chunks.insert(0, name.to_string_lossy().into_owned());
        }

        if chunks.is_empty() {
            return Err(Error::EmptyAfterChunking(path.to_path_buf()));
        }
        if chunks.len() > chunking::MAX_CHUNKS_PER_DOC {
            debug!(
                "keeping the first {} of {} chunks from {}",
                chunking::MAX_CHUNKS_PER_DOC,
                chunks.len(),
                path.display()
            );
            chunks.truncate(chunking::MAX_CHUNKS_PER_DOC);
        }
        Ok(chunks)
    }

    /// The single critical section of an ingest: allocate contiguous
    /// ids and insert every chunk into the cache and the memshard.
    fn commit(
        &self,
        index: &KeyIndex,
        source: &str,
        chunks: Vec<String>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<usize> {
        if vectors.len() != chunks.len() {
            return Err(Error::ModelBatchMismatch {
                expected: chunks.len(),
                got: vectors.len(),
            });
        }
        let dim = vectors.first().map(Vec::len).unwrap_or(0);
        if dim == 0 {
            return Err(Error::ModelProtocolError(
                "embedding vectors are empty".into(),
            ));
        }

        let mut guard = index.state.lock().unwrap();
        let state = &mut *guard;
        // Re-check both tiers under the lock: a racing ingest of the
        // same source may have committed, and even been dumped past the
        // cache, since the pre-flight check.
        if state.has_source(source) || index.db.is_duplicate(source)? {
            return Err(Error::DuplicateSource(PathBuf::from(source)));
        }

        let shard = state.shard.get_or_insert_with(|| FlatIndex::new(dim));
        if shard.dim() != dim {
            return Err(Error::DimensionMismatch {
                expected: shard.dim(),
                got: dim,
            });
        }

        let watermark = index.db.max_id()?;
        let mut next =
            state.cache.len() as i64 + watermark.map_or(0, |max| max + 1);

        let mut ids = Vec::with_capacity(chunks.len());
        let mut flat = Vec::with_capacity(chunks.len() * dim);
        let mut entries = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            if chunk.is_empty() {
                continue;
            }
            if vector.len() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    got: vector.len(),
                });
            }
            ids.push(next);
            flat.extend_from_slice(&vector);
            entries.push((next, chunk));
            next += 1;
        }
        if ids.is_empty() {
            return Err(Error::EmptyAfterChunking(PathBuf::from(source)));
        }

        shard.add(&ids, &flat)?;
        for (id, chunk) in entries {
            state.cache.insert(id, (source.to_string(), chunk));
        }
        Ok(ids.len())
    }
}

/// Canonicalize a path that must exist.
fn existing(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|_| Error::FileNotFound(path.to_path_buf()))
}

/// Canonical form when the file still exists, the verbatim path when it
/// is already gone (deletes may outlive the file).
fn canonical_or_verbatim(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;

    fn setup() -> (tempfile::TempDir, Pipeline, KeyIndex) {
        let tmp = tempfile::tempdir().unwrap();
        let key_dir = tmp.path().join("embedding").join("k1");
        fs::create_dir_all(&key_dir).unwrap();

        let pipeline = Pipeline::new(
            Arc::new(PlainTextParser),
            Arc::new(HashEmbedder::new(8)),
            Arc::new(AtomicBool::new(false)),
        );
        let index = KeyIndex {
            key: "k1".to_string(),
            state: Mutex::new(KeyState::default()),
            db: MetadataDb::open(&tmp.path().join("embedding").join("k1.db"))
                .unwrap(),
            shards: DiskShards::new(key_dir.clone()),
            docs_dir: key_dir.join("Docs"),
        };
        (tmp, pipeline, index)
    }

    fn write_doc(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_file_is_rejected() {
        let (tmp, pipeline, index) = setup();
        let err = pipeline
            .index_document(&index, &tmp.path().join("ghost.txt"))
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn binary_content_is_unparsable() {
        let (tmp, pipeline, index) = setup();
        let path = tmp.path().join("blob.bin");
        fs::write(&path, [0xff, 0xfe, 0x00, 0x80]).unwrap();

        let err = pipeline.index_document(&index, &path).unwrap_err();
        assert!(matches!(err, Error::UnparsableContent(_)));
    }

    #[test]
    fn duplicate_in_cache_is_rejected() {
        let (tmp, pipeline, index) = setup();
        // One short chunk stays below the dump threshold.
        let path = write_doc(tmp.path(), "a.txt", "just one chunk here");

        pipeline.index_document(&index, &path).unwrap();
        let err = pipeline.index_document(&index, &path).unwrap_err();
        assert!(matches!(err, Error::DuplicateSource(_)));
    }

    #[test]
    fn duplicate_in_store_is_rejected() {
        let (tmp, pipeline, index) = setup();
        // Two chunks cross the threshold, so the doc is persisted.
        let path = write_doc(
            tmp.path(),
            "a.txt",
            "first sentence long enough. second sentence long enough.",
        );

        pipeline.index_document(&index, &path).unwrap();
        assert_eq!(index.state.lock().unwrap().shard_len(), 0);

        let err = pipeline.index_document(&index, &path).unwrap_err();
        assert!(matches!(err, Error::DuplicateSource(_)));
    }

    #[test]
    fn ids_are_contiguous_and_cached() {
        let (tmp, pipeline, index) = setup();
        let path = write_doc(tmp.path(), "one.txt", "a single short chunk");

        let count = pipeline.index_document(&index, &path).unwrap();
        assert_eq!(count, 1);

        let state = index.state.lock().unwrap();
        assert_eq!(state.cache.len(), 1);
        let (source, content) = &state.cache[&0];
        assert!(source.ends_with("one.txt"));
        assert_eq!(content, "a single short chunk");
        assert_eq!(state.shard_len(), 1);
    }

    #[test]
    fn allocation_resumes_past_persisted_ids() {
        let (tmp, pipeline, index) = setup();

        // Persist ids 0 and 1.
        let a = write_doc(
            tmp.path(),
            "a.txt",
            "first sentence long enough. second sentence long enough.",
        );
        pipeline.index_document(&index, &a).unwrap();
        assert_eq!(index.db.max_id().unwrap(), Some(1));

        // The next doc starts at id 2.
        let b = write_doc(tmp.path(), "b.txt", "one more little chunk");
        pipeline.index_document(&index, &b).unwrap();
        let state = index.state.lock().unwrap();
        assert!(state.cache.contains_key(&2));
    }

    #[test]
    fn threshold_dump_clears_the_memory_tier() {
        let (tmp, pipeline, index) = setup();
        let a = write_doc(tmp.path(), "a.txt", "only chunk of doc one");
        let b = write_doc(tmp.path(), "b.txt", "only chunk of doc two");

        pipeline.index_document(&index, &a).unwrap();
        {
            let state = index.state.lock().unwrap();
            assert_eq!(state.shard_len(), 1);
            assert!(!index.shards.has_shards());
        }

        pipeline.index_document(&index, &b).unwrap();
        let state = index.state.lock().unwrap();
        assert_eq!(state.shard_len(), 0);
        assert!(state.cache.is_empty());
        assert!(index.shards.dir().join("flat_1.faiss").is_file());
        assert_eq!(index.db.live_count().unwrap(), 2);
    }

    #[test]
    fn memshard_ids_always_resolve_in_cache() {
        let (tmp, pipeline, index) = setup();
        let path = write_doc(tmp.path(), "a.txt", "one short cached chunk");
        pipeline.index_document(&index, &path).unwrap();

        let state = index.state.lock().unwrap();
        if let Some(shard) = state.shard.as_ref() {
            for id in shard.ids() {
                let (source, content) = &state.cache[id];
                assert!(!source.is_empty());
                assert!(!content.is_empty());
            }
        }
    }

    #[test]
    fn long_basename_becomes_a_chunk() {
        let (tmp, pipeline, index) = setup();
        let path = write_doc(
            tmp.path(),
            "quarterly-report-2024-final.txt",
            "tiny body",
        );

        // Name chunk + body chunk cross the threshold and get dumped;
        // the name is the first chunk, so it owns the first id.
        pipeline.index_document(&index, &path).unwrap();
        let (_, content) = index.db.fetch(0).unwrap().unwrap();
        assert_eq!(content, "quarterly-report-2024-final.txt");
        let (_, body) = index.db.fetch(1).unwrap().unwrap();
        assert_eq!(body, "tiny body");
    }

    #[test]
    fn delete_covers_both_tiers() {
        let (tmp, pipeline, index) = setup();

        // Doc a is persisted (two chunks), doc b stays cached.
        let a = write_doc(
            tmp.path(),
            "a.txt",
            "first sentence long enough. second sentence long enough.",
        );
        let b = write_doc(tmp.path(), "b.txt", "cached single chunk");
        pipeline.index_document(&index, &a).unwrap();
        pipeline.index_document(&index, &b).unwrap();

        let removed = pipeline
            .delete(&index, &[a.clone(), b.clone()])
            .unwrap();
        assert_eq!(removed, 3);

        assert_eq!(index.db.live_count().unwrap(), 0);
        let state = index.state.lock().unwrap();
        assert!(state.cache.is_empty());
        assert_eq!(state.shard_len(), 0);
    }

    #[test]
    fn update_replaces_content() {
        let (tmp, pipeline, index) = setup();
        let path = write_doc(tmp.path(), "a.txt", "the original content here");
        pipeline.index_document(&index, &path).unwrap();

        fs::write(&path, "entirely different words now").unwrap();
        let updated = pipeline.update(&index, &[path.clone()]).unwrap();
        assert_eq!(updated, 1);

        let state = index.state.lock().unwrap();
        let contents: Vec<&str> = state
            .cache
            .values()
            .map(|(_, content)| content.as_str())
            .collect();
        assert_eq!(contents, vec!["entirely different words now"]);
    }

    #[test]
    fn copy_indexes_under_docs_path() {
        let (tmp, pipeline, index) = setup();
        let path = write_doc(tmp.path(), "a.txt", "content worth copying");

        pipeline.index_document_copy(&index, &path).unwrap();

        let copy = index.docs_dir.join("a.txt");
        assert!(copy.is_file());
        let mode = fs::metadata(&copy).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);

        let state = index.state.lock().unwrap();
        let (source, _) = state.cache.values().next().unwrap();
        assert_eq!(source, &copy.to_string_lossy().into_owned());
    }

    #[test]
    fn delete_removes_managed_copy() {
        let (tmp, pipeline, index) = setup();
        let path = write_doc(tmp.path(), "a.txt", "content worth copying");
        pipeline.index_document_copy(&index, &path).unwrap();

        let copy = index.docs_dir.join("a.txt");
        // Writable again so the unlink is allowed everywhere.
        fs::set_permissions(&copy, fs::Permissions::from_mode(0o644)).unwrap();
        pipeline.delete(&index, &[copy.clone()]).unwrap();
        assert!(!copy.exists());
    }

    #[test]
    fn commit_catches_a_source_persisted_mid_flight() {
        // An embedder that ingests the same document through a second
        // pipeline while the first call is still waiting on its
        // vectors. The racing copy is dumped to disk, so the outer
        // commit only sees it through the metadata store.
        struct RacingEmbedder {
            inner: HashEmbedder,
            racer: Pipeline,
            index: Arc<KeyIndex>,
            path: PathBuf,
            fired: AtomicBool,
        }

        impl Embedder for RacingEmbedder {
            fn embed_documents(
                &self,
                texts: &[String],
            ) -> Result<Vec<Vec<f32>>> {
                if !self.fired.swap(true, Ordering::SeqCst) {
                    self.racer.index_document(&self.index, &self.path).unwrap();
                }
                self.inner.embed_documents(texts)
            }

            fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
                self.inner.embed_query(query)
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let key_dir = tmp.path().join("embedding").join("k1");
        fs::create_dir_all(&key_dir).unwrap();
        let index = Arc::new(KeyIndex {
            key: "k1".to_string(),
            state: Mutex::new(KeyState::default()),
            db: MetadataDb::open(&tmp.path().join("embedding").join("k1.db"))
                .unwrap(),
            shards: DiskShards::new(key_dir.clone()),
            docs_dir: key_dir.join("Docs"),
        });

        // Two chunks, so the racing ingest crosses the dump threshold
        // and clears the cache behind the outer call's back.
        let path = write_doc(
            tmp.path(),
            "a.txt",
            "first sentence long enough. second sentence long enough.",
        );

        let racer = Pipeline::new(
            Arc::new(PlainTextParser),
            Arc::new(HashEmbedder::new(8)),
            Arc::new(AtomicBool::new(false)),
        );
        let pipeline = Pipeline::new(
            Arc::new(PlainTextParser),
            Arc::new(RacingEmbedder {
                inner: HashEmbedder::new(8),
                racer,
                index: index.clone(),
                path: path.clone(),
                fired: AtomicBool::new(false),
            }),
            Arc::new(AtomicBool::new(false)),
        );

        let err = pipeline.index_document(&index, &path).unwrap_err();
        assert!(matches!(err, Error::DuplicateSource(_)));

        // Exactly one copy of the document survived.
        assert_eq!(index.db.live_count().unwrap(), 2);
        assert!(index.state.lock().unwrap().cache.is_empty());
    }

    #[test]
    fn stop_aborts_before_any_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let key_dir = tmp.path().join("embedding").join("k1");
        fs::create_dir_all(&key_dir).unwrap();

        let stop = Arc::new(AtomicBool::new(true));
        let pipeline = Pipeline::new(
            Arc::new(PlainTextParser),
            Arc::new(HashEmbedder::new(8)),
            stop,
        );
        let index = KeyIndex {
            key: "k1".to_string(),
            state: Mutex::new(KeyState::default()),
            db: MetadataDb::open(&tmp.path().join("embedding").join("k1.db"))
                .unwrap(),
            shards: DiskShards::new(key_dir.clone()),
            docs_dir: key_dir.join("Docs"),
        };

        let path = write_doc(tmp.path(), "a.txt", "some chunkable content");
        let err = pipeline.index_document(&index, &path).unwrap_err();
        assert!(matches!(err, Error::Stopped));
        assert!(index.state.lock().unwrap().cache.is_empty());
    }
}
