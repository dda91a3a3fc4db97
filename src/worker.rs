//! A long-lived worker thread serving typed index requests.
//!
//! The worker owns the [`Engine`] and drains a bounded queue; callers
//! hand over a named operation together with a one-shot reply channel
//! and block on the answer. Cancellation is out-of-band: `stop()` flips
//! the engine's flag and the in-flight operation aborts at its next
//! checkpoint. Dropping the worker shuts the thread down and flushes
//! every memshard.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        mpsc::{self, Receiver, SyncSender},
    },
    thread,
};

use tracing::info;

use crate::{
    engine::Engine,
    error::{Error, Result},
};

/// Pending requests the queue will hold before senders block.
const QUEUE_CAPACITY: usize = 32;

enum Request {
    CreateIndex {
        files: Vec<PathBuf>,
        key: String,
        copy: bool,
        reply: mpsc::Sender<bool>,
    },
    UpdateIndex {
        files: Vec<PathBuf>,
        key: String,
        reply: mpsc::Sender<bool>,
    },
    DeleteIndex {
        files: Vec<PathBuf>,
        key: String,
        reply: mpsc::Sender<bool>,
    },
    VectorSearch {
        query: String,
        key: String,
        top_k: usize,
        reply: mpsc::Sender<Result<String>>,
    },
    IndexExists {
        key: String,
        reply: mpsc::Sender<bool>,
    },
    ListSources {
        key: String,
        reply: mpsc::Sender<Result<Vec<String>>>,
    },
    Shutdown,
}

pub struct IndexWorker {
    requests: SyncSender<Request>,
    engine: Arc<Engine>,
    handle: Option<thread::JoinHandle<()>>,
}

impl IndexWorker {
    /// Move the engine onto its own thread and start serving requests.
    pub fn spawn(engine: Engine) -> Self {
        let engine = Arc::new(engine);
        let (requests, receiver) = mpsc::sync_channel(QUEUE_CAPACITY);

        let served = engine.clone();
        let handle = thread::spawn(move || serve(served, receiver));

        Self {
            requests,
            engine,
            handle: Some(handle),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn create_index(&self, files: Vec<PathBuf>, key: &str) -> bool {
        self.ask_bool(|reply| Request::CreateIndex {
            files,
            key: key.to_string(),
            copy: false,
            reply,
        })
    }

    pub fn create_index_copy(&self, files: Vec<PathBuf>, key: &str) -> bool {
        self.ask_bool(|reply| Request::CreateIndex {
            files,
            key: key.to_string(),
            copy: true,
            reply,
        })
    }

    pub fn update_index(&self, files: Vec<PathBuf>, key: &str) -> bool {
        self.ask_bool(|reply| Request::UpdateIndex {
            files,
            key: key.to_string(),
            reply,
        })
    }

    pub fn delete_index(&self, files: Vec<PathBuf>, key: &str) -> bool {
        self.ask_bool(|reply| Request::DeleteIndex {
            files,
            key: key.to_string(),
            reply,
        })
    }

    pub fn vector_search(
        &self,
        query: &str,
        key: &str,
        top_k: usize,
    ) -> Result<String> {
        let (reply, answer) = mpsc::channel();
        self.requests
            .send(Request::VectorSearch {
                query: query.to_string(),
                key: key.to_string(),
                top_k,
                reply,
            })
            .map_err(|_| worker_gone())?;
        answer.recv().map_err(|_| worker_gone())?
    }

    pub fn index_exists(&self, key: &str) -> bool {
        self.ask_bool(|reply| Request::IndexExists {
            key: key.to_string(),
            reply,
        })
    }

    pub fn list_sources(&self, key: &str) -> Result<Vec<String>> {
        let (reply, answer) = mpsc::channel();
        self.requests
            .send(Request::ListSources {
                key: key.to_string(),
                reply,
            })
            .map_err(|_| worker_gone())?;
        answer.recv().map_err(|_| worker_gone())?
    }

    /// Abort the in-flight operation at its next checkpoint.
    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Drain, flush, and join the worker thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.requests.send(Request::Shutdown);
            let _ = handle.join();
        }
    }

    fn ask_bool(
        &self,
        request: impl FnOnce(mpsc::Sender<bool>) -> Request,
    ) -> bool {
        let (reply, answer) = mpsc::channel();
        if self.requests.send(request(reply)).is_err() {
            return false;
        }
        answer.recv().unwrap_or(false)
    }
}

impl Drop for IndexWorker {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn worker_gone() -> Error {
    Error::Config("index worker is no longer running".into())
}

fn serve(engine: Arc<Engine>, requests: Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        match request {
            Request::CreateIndex {
                files,
                key,
                copy,
                reply,
            } => {
                let ok = if copy {
                    engine.create_index_copy(&files, &key)
                } else {
                    engine.create_index(&files, &key)
                };
                let _ = reply.send(ok);
            }
            Request::UpdateIndex { files, key, reply } => {
                let _ = reply.send(engine.update_index(&files, &key));
            }
            Request::DeleteIndex { files, key, reply } => {
                let _ = reply.send(engine.delete_index(&files, &key));
            }
            Request::VectorSearch {
                query,
                key,
                top_k,
                reply,
            } => {
                let _ =
                    reply.send(engine.vector_search(&query, &key, top_k));
            }
            Request::IndexExists { key, reply } => {
                let _ = reply.send(engine.index_exists(&key));
            }
            Request::ListSources { key, reply } => {
                let _ = reply.send(engine.list_sources(&key));
            }
            Request::Shutdown => break,
        }
    }
    engine.shutdown();
    info!("index worker has quit");
}
