use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("embedding request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("result encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("document already indexed: {0}")]
    DuplicateSource(PathBuf),

    #[error("document is not parsable as text: {0}")]
    UnparsableContent(PathBuf),

    #[error("document produced no chunks: {0}")]
    EmptyAfterChunking(PathBuf),

    #[error("embedding model is not reachable at {0}")]
    ModelUnavailable(String),

    #[error("malformed embedding response: {0}")]
    ModelProtocolError(String),

    #[error("embedding batch returned {got} vectors for {expected} inputs")]
    ModelBatchMismatch { expected: usize, got: usize },

    #[error("could not copy {0} into the managed docs directory")]
    CopyFailed(PathBuf),

    #[error("could not mark {0} read-only")]
    ChmodFailed(PathBuf),

    #[error("corrupt index file: {0}")]
    CorruptIndexFile(PathBuf),

    #[error("vector dimension {got} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("operation stopped")]
    Stopped,

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}
