//! Query path: embed the query, search both tiers, merge, resolve.
//!
//! Cache hits resolve through the in-memory chunk cache, disk hits
//! through the metadata store; a disk id without a live metadata row is
//! dropped. The two distance-ordered streams are merged ascending with
//! ties going to the cache. The system key skips the cache entirely and
//! returns persisted hits only.

use serde::Serialize;

use crate::{
    embedder::Embedder,
    error::Result,
    pipeline::KeyIndex,
};

/// Version tag carried by every search result document.
pub const SEARCH_RESULT_VERSION: i64 = 1;

/// Collection key reserved for the system assistant.
pub const SYSTEM_ASSISTANT_KEY: &str = "system-assistant";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub source: String,
    pub content: String,
    pub distance: f32,
}

#[derive(Debug, Serialize)]
pub struct SearchResults {
    pub version: i64,
    pub result: Vec<SearchHit>,
}

impl SearchResults {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Run a top-K query against one key.
pub fn vector_search(
    index: &KeyIndex,
    embedder: &dyn Embedder,
    query: &str,
    top_k: usize,
) -> Result<SearchResults> {
    let query_vector = embedder.embed_query(query)?;

    // Search the memshard and resolve its hits under one lock so the
    // view stays consistent.
    let cache_hits: Vec<SearchHit> = {
        let state = index.state.lock().unwrap();
        let hits = state
            .shard
            .as_ref()
            .map(|shard| shard.search(&query_vector, top_k))
            .unwrap_or_default();
        hits.into_iter()
            .filter_map(|(id, distance)| {
                let (source, content) = state.cache.get(&id)?;
                Some(SearchHit {
                    source: source.clone(),
                    content: content.clone(),
                    distance,
                })
            })
            .collect()
    };

    let disk_hits = index.shards.search(&query_vector, top_k)?;

    let result = if index.key == SYSTEM_ASSISTANT_KEY {
        resolve_disk(index, &disk_hits, top_k)?
    } else {
        merge(index, cache_hits, &disk_hits, top_k)?
    };

    Ok(SearchResults {
        version: SEARCH_RESULT_VERSION,
        result,
    })
}

/// Persisted hits only, for the system key.
fn resolve_disk(
    index: &KeyIndex,
    disk_hits: &[(i64, f32)],
    top_k: usize,
) -> Result<Vec<SearchHit>> {
    let mut result = Vec::new();
    for &(id, distance) in disk_hits {
        if result.len() == top_k {
            break;
        }
        if let Some((source, content)) = index.db.fetch(id)? {
            result.push(SearchHit {
                source,
                content,
                distance,
            });
        }
    }
    Ok(result)
}

/// Two-way merge of the ascending cache and disk streams. Ties resolve
/// in favor of the cache; disk ids with no live metadata row are
/// dropped.
fn merge(
    index: &KeyIndex,
    cache_hits: Vec<SearchHit>,
    disk_hits: &[(i64, f32)],
    top_k: usize,
) -> Result<Vec<SearchHit>> {
    let mut result = Vec::with_capacity(top_k.min(
        cache_hits.len() + disk_hits.len(),
    ));
    let mut cache = cache_hits.into_iter().peekable();
    let mut disk = disk_hits.iter().peekable();

    while result.len() < top_k {
        match (cache.peek(), disk.peek()) {
            (Some(hit), Some(&&(id, distance))) => {
                if hit.distance <= distance {
                    result.push(cache.next().unwrap());
                } else {
                    disk.next();
                    if let Some((source, content)) = index.db.fetch(id)? {
                        result.push(SearchHit {
                            source,
                            content,
                            distance,
                        });
                    }
                }
            }
            (Some(_), None) => result.push(cache.next().unwrap()),
            (None, Some(&&(id, distance))) => {
                disk.next();
                if let Some((source, content)) = index.db.fetch(id)? {
                    result.push(SearchHit {
                        source,
                        content,
                        distance,
                    });
                }
            }
            (None, None) => break,
        }
    }

    Ok(result)
}
