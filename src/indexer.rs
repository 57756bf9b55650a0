//! Incremental indexing pipeline: a bounded queue of touched entities, a
//! pool of workers that regenerate search docs, and a full-scan rebuild
//! server.
//!
//! Indexing is best-effort. Worker errors are logged per item and never stop
//! the pipeline; the store stays authoritative and the periodic full scan is
//! the recovery mechanism for anything the real-time path missed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::Result;
use crate::types::{Doc, Entity};

/// Queue capacity installed by [`Context::run_indexer`]. Producers block once
/// this many entities are pending.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

const SCAN_CHUNK: usize = 1000;

/// Per-kind hooks driving document regeneration.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Called when an entity was touched by a commit. Returns every entity
    /// whose document must be regenerated: usually the entity itself, plus
    /// any upstream aggregates that embed it.
    fn on_update(&self, entity: &Entity) -> Vec<Entity>;

    /// Recompute the current document for an entity, typically by querying
    /// the store.
    async fn regenerate(&self, entity: &Entity, ctx: &Context) -> Result<Doc>;
}

/// Kind -> indexer map. Registration is single-assignment per kind.
#[derive(Default)]
pub struct Registry {
    indexers: DashMap<String, Arc<dyn Indexer>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register the indexer handling one entity kind.
    ///
    /// # Panics
    /// Panics when the kind already has an indexer; re-registration is a
    /// caller bug.
    pub fn register(&self, kind: impl Into<String>, indexer: Arc<dyn Indexer>) {
        use dashmap::mapref::entry::Entry;

        let kind = kind.into();
        match self.indexers.entry(kind) {
            Entry::Occupied(held) => {
                panic!(
                    "another indexer is already handling entity kind {}",
                    held.key()
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(indexer);
            }
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Indexer>> {
        self.indexers.get(kind).map(|r| r.value().clone())
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut list: Vec<String> = self.indexers.iter().map(|r| r.key().clone()).collect();
        list.sort();
        list
    }

    pub fn len(&self) -> usize {
        self.indexers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexers.is_empty()
    }
}

async fn process_queue(
    queue: Arc<Mutex<mpsc::Receiver<Entity>>>,
    registry: Arc<Registry>,
    ctx: Context,
) {
    loop {
        let entity = { queue.lock().await.recv().await };
        let Some(entity) = entity else { break };

        let Some(indexer) = registry.get(&entity.kind) else {
            continue;
        };
        for dirty in indexer.on_update(&entity) {
            let Some(regen) = registry.get(&dirty.kind) else {
                continue;
            };
            let doc = match regen.regenerate(&dirty, &ctx).await {
                Ok(doc) => doc,
                Err(err) => {
                    error!(error = %err, kind = %dirty.kind, id = %dirty.id, "while regenerating doc");
                    continue;
                }
            };
            debug!(kind = %doc.kind, id = %doc.id, "regenerated doc");
            let Some(engine) = ctx.search() else {
                continue;
            };
            if let Err(err) = engine.update(doc).await {
                error!(error = %err, "while updating doc in search engine");
            }
        }
    }
    info!("finished processing queue");
}

impl Context {
    /// Install the bounded update queue and start `num_workers` indexing
    /// workers. Entities enqueued by `Update::execute` (or the rebuild
    /// server) flow through the registry from here on.
    ///
    /// # Panics
    /// Panics on a zero worker count.
    pub fn run_indexer(&mut self, registry: Arc<Registry>, num_workers: usize) {
        self.run_indexer_with_capacity(registry, num_workers, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn run_indexer_with_capacity(
        &mut self,
        registry: Arc<Registry>,
        num_workers: usize,
        capacity: usize,
    ) {
        assert!(num_workers > 0, "invalid number of indexer workers");

        let (tx, rx) = mpsc::channel(capacity);
        self.updates = Some(tx);
        let queue = Arc::new(Mutex::new(rx));

        // Workers get a context without the updates sender; otherwise the
        // channel could never close.
        let worker_ctx = self.worker_clone();
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        for _ in 0..num_workers {
            workers.push(tokio::spawn(process_queue(
                queue.clone(),
                registry.clone(),
                worker_ctx.clone(),
            )));
        }
    }

    /// Close the update queue and join all workers. Shutdown only; every
    /// other live clone of this context (e.g. a rebuild server) must be
    /// dropped first, since each holds a sender keeping the queue open.
    pub async fn wait_for_indexer(&mut self) {
        debug!("waiting for indexer to finish");
        self.updates = None;
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().expect("worker list lock poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "indexer worker failed");
            }
        }
    }
}

/// Long-running full-scan rebuild loop. Pages over every entity in the store
/// and feeds them through the same indexer queue, guaranteeing eventual
/// consistency against missed `on_update` fan-outs.
pub struct Server {
    ctx: Context,
    chunk: usize,
}

impl Server {
    pub fn new(ctx: Context) -> Server {
        if !ctx.has_indexer() {
            warn!("rebuild server created without an indexer queue; scans will drop entities");
        }
        Server {
            ctx,
            chunk: SCAN_CHUNK,
        }
    }

    /// One pass over the whole store. Returns the number of entities pushed
    /// onto the queue.
    pub async fn loop_once(&self) -> Result<u64> {
        let Some(tx) = self.ctx.updates.as_ref() else {
            return Ok(0);
        };

        let mut from = String::new();
        let mut total = 0u64;
        loop {
            let (found, last) = self.ctx.store().iterate(&from, self.chunk, tx).await?;
            if found == 0 {
                info!(total, "reached end of cycle");
                return Ok(total);
            }
            debug!(num_processed = found, "iteration chunk done");
            total += found as u64;
            match last {
                Some(entity) => from = entity.id,
                None => return Ok(total),
            }
        }
    }

    /// Cycle over the store forever, sleeping `wait` between passes. Runs
    /// until the owning task is dropped.
    pub async fn infinite_loop(&self, wait: Duration) {
        loop {
            if let Err(err) = self.loop_once().await {
                error!(error = %err, "while iterating store");
            }
            debug!("sleeping");
            tokio::time::sleep(wait).await;
        }
    }

    /// Shut down cleanly, releasing this server's handle on the update
    /// queue.
    pub fn finish(self) {}
}
