//! semdex -- a local semantic document index.
//!
//! semdex ingests document files, splits them into size-bounded chunks,
//! embeds the chunks through an external model service, and answers
//! top-K semantic queries. Every index is scoped by an opaque
//! *collection key*; keys never see each other's data.
//!
//! # Architecture
//!
//! Ingest runs through a fixed pipeline:
//!
//! 1. **Chunking** ([`chunking`]) -- the document text is normalized
//!    and cut into chunks of bounded character length.
//! 2. **Embedding** ([`embedder`]) -- chunks are vectorized in batches
//!    through the model service's `/embeddings` endpoint.
//! 3. **Caching** ([`pipeline`]) -- each chunk gets a monotonically
//!    increasing id and lands in the key's in-memory tier: the chunk
//!    cache plus a flat vector index (the *memshard*).
//! 4. **Dumping** ([`vector_index`]) -- once the memshard crosses a
//!    threshold it is persisted as a `flat_<n>.faiss` shard file, with
//!    matching rows in the key's SQLite metadata store
//!    ([`metadata_db`]).
//!
//! Queries ([`search`]) embed the query text, run brute-force search
//! over the memshard and every persisted shard, and merge the two
//! distance-ordered streams into a JSON result document.
//!
//! # Storage
//!
//! All state lives under `<data_dir>/embedding/` ([`DataDir`]):
//!
//! ```text
//! embedding/
//!   <key>/
//!     flat_1.faiss, flat_2.faiss, ...   # vector shards
//!     Docs/<basename>                   # read-only copies
//!   <key>.db                            # metadata + segments tables
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use semdex::{DataDir, EmbedderConfig, Engine, RemoteEmbedder};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = EmbedderConfig::new("http://127.0.0.1:8000");
//! let embedder = Arc::new(RemoteEmbedder::new(&config).unwrap());
//! let engine = Engine::new(data_dir, embedder);
//!
//! engine.create_index(&["notes/rust.md".into()], "notes");
//! let json = engine.vector_search("borrow checker", "notes", 5).unwrap();
//! println!("{json}");
//! engine.shutdown();
//! ```
//!
//! For host applications that drive the index from several places, an
//! [`IndexWorker`] owns the engine on a dedicated thread and serves the
//! same operations over a bounded request queue.

pub mod chunking;
pub mod data_dir;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod flat_index;
pub mod metadata_db;
pub mod pipeline;
pub mod search;
pub mod vector_index;
pub mod worker;

pub use data_dir::DataDir;
pub use embedder::{Embedder, EmbedderConfig, HashEmbedder, RemoteEmbedder};
pub use engine::{Engine, IndexStatus, StatusEvent};
pub use error::{Error, Result};
pub use flat_index::FlatIndex;
pub use metadata_db::{MetadataDb, MetadataRow};
pub use pipeline::{DocumentParser, PlainTextParser};
pub use search::{SEARCH_RESULT_VERSION, SYSTEM_ASSISTANT_KEY};
pub use worker::IndexWorker;
