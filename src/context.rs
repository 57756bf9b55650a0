//! Shared execution context: the composition root wiring a store, an optional
//! search engine, and the indexer update queue together.
//!
//! One `Context` is built at startup and cloned into whatever needs it;
//! drivers are assigned exactly once, at construction.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::search::SearchEngine;
use crate::store::Store;
use crate::types::Entity;

#[derive(Clone)]
pub struct Context {
    /// Length of generated child ids; 62^n namespace. Must be non-zero before
    /// any `Update::execute`.
    pub num_chars_unique: usize,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) search: Option<Arc<dyn SearchEngine>>,
    pub(crate) updates: Option<mpsc::Sender<Entity>>,
    pub(crate) workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Context {
    pub fn new(store: Arc<dyn Store>, num_chars_unique: usize) -> Context {
        Context {
            num_chars_unique,
            store,
            search: None,
            updates: None,
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attach a search engine. Required for indexing; queries against the
    /// store alone work without one.
    pub fn with_search(mut self, engine: Arc<dyn SearchEngine>) -> Context {
        self.search = Some(engine);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn search(&self) -> Option<&Arc<dyn SearchEngine>> {
        self.search.as_ref()
    }

    /// True once `run_indexer` has installed the update queue.
    pub fn has_indexer(&self) -> bool {
        self.updates.is_some()
    }

    /// Push an entity onto the indexer queue. Blocks when the queue is full;
    /// that backpressure is what bounds memory between the write path and the
    /// worker pool. A no-op (with a warning) when no indexer is running.
    pub async fn add_to_queue(&self, entity: Entity) {
        match &self.updates {
            Some(tx) => {
                if tx.send(entity).await.is_err() {
                    warn!("indexer queue closed, dropping update");
                }
            }
            None => warn!("no indexer running, dropping update"),
        }
    }

    /// Clone handed to indexer workers: same drivers, but no updates sender,
    /// so shutdown can observe the channel closing.
    pub(crate) fn worker_clone(&self) -> Context {
        Context {
            num_chars_unique: self.num_chars_unique,
            store: self.store.clone(),
            search: self.search.clone(),
            updates: None,
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}
