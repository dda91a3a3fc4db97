//! Embedding providers.
//!
//! [`Embedder`] is the seam between the index and the model: the ingest
//! pipeline embeds chunk batches through it and the query path embeds
//! single queries. [`RemoteEmbedder`] talks to the external model
//! service over blocking HTTP; [`HashEmbedder`] is a deterministic
//! stand-in for tests and offline development.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Number of texts sent per embedding request.
pub const EMBED_BATCH: usize = 15;

/// Instruction prepended to queries before embedding (the retrieval
/// prompt the model family was trained with, preserved verbatim).
pub const QUERY_INSTRUCTION: &str = "为这个句子生成表示以用于检索相关文章:";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub trait Embedder: Send + Sync {
    /// Embed a batch of document chunks. The i-th output vector
    /// corresponds to the i-th input text; partial failure of any
    /// sub-batch fails the whole call.
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single retrieval query.
    fn embed_query(&self, query: &str) -> Result<Vec<f32>>;
}

/// Connection settings for the external model service.
#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    /// Base URL of the service, e.g. `http://127.0.0.1:8000`.
    pub endpoint: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl EmbedderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Client for the model service's `POST /embeddings` endpoint.
///
/// Each call owns its own connection and blocks the calling worker;
/// no state is shared across calls.
pub struct RemoteEmbedder {
    endpoint: String,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbedderConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// TCP-connect probe standing in for the model launcher's own
    /// liveness check.
    fn ensure_running(&self) -> Result<()> {
        let unavailable = || Error::ModelUnavailable(self.endpoint.clone());

        let url =
            reqwest::Url::parse(&self.endpoint).map_err(|_| unavailable())?;
        let host = url.host_str().ok_or_else(unavailable)?;
        let port = url.port_or_known_default().ok_or_else(unavailable)?;

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| unavailable())?
            .next()
            .ok_or_else(unavailable)?;
        TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|_| unavailable())?;
        Ok(())
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .json(&serde_json::json!({ "input": texts }))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ModelProtocolError(format!(
                "embedding endpoint returned {status}"
            )));
        }

        let body: EmbedResponse = response
            .json()
            .map_err(|e| Error::ModelProtocolError(e.to_string()))?;

        if body.data.len() != texts.len() {
            return Err(Error::ModelBatchMismatch {
                expected: texts.len(),
                got: body.data.len(),
            });
        }

        Ok(body.data.into_iter().map(|item| item.embedding).collect())
    }
}

impl Embedder for RemoteEmbedder {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_running()?;

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH) {
            debug!("embedding batch of {} texts", batch.len());
            vectors.extend(self.embed_batch(batch)?);
        }
        Ok(vectors)
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.ensure_running()?;
        let prompt = format!("{QUERY_INSTRUCTION}{query}");
        let mut vectors = self.embed_batch(std::slice::from_ref(&prompt))?;
        vectors.pop().ok_or_else(|| {
            Error::ModelProtocolError("empty embedding response".into())
        })
    }
}

/// Deterministic embedder: hashes the text into a fixed-dimension unit
/// vector. Identical texts embed identically; the output carries no
/// semantic signal.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut state = {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            hasher.finish() | 1
        };

        let mut vector = Vec::with_capacity(self.dim);
        for _ in 0..self.dim {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            vector.push((state as f32 / u64::MAX as f32) - 0.5);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashEmbedder {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        Ok(self.embed_one(&format!("{QUERY_INSTRUCTION}{query}")))
    }
}
