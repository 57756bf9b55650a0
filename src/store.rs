//! Storage driver contract and the in-memory reference driver.
//!
//! A store persists instructions and never mutates them: `commit` appends a
//! batch atomically, `get_entity` replays everything written for one subject,
//! and `iterate` pages over distinct entities for the full-scan rebuild loop.
//! The persistent redb driver lives in `storage.rs`.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{Entity, Instruction, PARENT_PREDICATE};

/// Contract every storage backend must satisfy.
///
/// `commit` must expose all-or-nothing visibility for the batch; out-of-order
/// partial visibility breaks read semantics. Instantiation is driver-specific
/// (each driver exposes its own constructor taking endpoint/path/etc.).
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist all instructions in the batch atomically.
    async fn commit(&self, batch: &[Instruction]) -> Result<()>;

    /// True iff no instruction with this subject id exists yet. Used to probe
    /// candidate ids during child allocation.
    async fn is_new(&self, subject: &str) -> bool;

    /// All instructions recorded for the subject, in any order.
    async fn get_entity(&self, subject: &str) -> Result<Vec<Instruction>>;

    /// Stream up to `num` distinct entities with ids lexicographically after
    /// `from` onto `tx`. Returns the count actually sent and the last entity
    /// seen, for cursor resumption. A count of zero signals end-of-table.
    async fn iterate(
        &self,
        from: &str,
        num: usize,
        tx: &mpsc::Sender<Entity>,
    ) -> Result<(usize, Option<Entity>)>;
}

/// Resolve the `_parent_` back-edge for an entity. Returns
/// [`Error::NoParent`] if the entity has no recorded parent.
pub async fn parent(store: &Arc<dyn Store>, id: &str) -> Result<String> {
    let its = store.get_entity(id).await?;
    for it in &its {
        if it.predicate == PARENT_PREDICATE {
            return Ok(it.object_id.clone());
        }
    }
    Err(Error::NoParent(id.to_string()))
}

/// In-memory store keyed by subject id. Iteration order over subjects is
/// lexicographic, which `iterate` relies on for cursoring. Intended for tests
/// and embedded use.
#[derive(Default)]
pub struct MemStore {
    subjects: RwLock<BTreeMap<String, Vec<Instruction>>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn commit(&self, batch: &[Instruction]) -> Result<()> {
        let mut subjects = self.subjects.write().expect("memstore lock poisoned");
        for it in batch {
            subjects
                .entry(it.subject_id.clone())
                .or_default()
                .push(it.clone());
        }
        debug!(num = batch.len(), "instructions committed");
        Ok(())
    }

    async fn is_new(&self, subject: &str) -> bool {
        let subjects = self.subjects.read().expect("memstore lock poisoned");
        !subjects.contains_key(subject)
    }

    async fn get_entity(&self, subject: &str) -> Result<Vec<Instruction>> {
        let subjects = self.subjects.read().expect("memstore lock poisoned");
        Ok(subjects.get(subject).cloned().unwrap_or_default())
    }

    async fn iterate(
        &self,
        from: &str,
        num: usize,
        tx: &mpsc::Sender<Entity>,
    ) -> Result<(usize, Option<Entity>)> {
        // Snapshot the page before sending so the lock is not held across
        // channel backpressure.
        let page: Vec<Entity> = {
            let subjects = self.subjects.read().expect("memstore lock poisoned");
            subjects
                .iter()
                .filter(|(id, _)| id.as_str() > from)
                .take(num)
                .filter_map(|(id, its)| {
                    its.first()
                        .map(|it| Entity::new(it.subject_type.clone(), id.clone()))
                })
                .collect()
        };

        let mut last = None;
        let mut count = 0;
        for entity in page {
            last = Some(entity.clone());
            if tx.send(entity).await.is_err() {
                // Receiver dropped; report what went through.
                break;
            }
            count += 1;
        }
        Ok((count, last))
    }
}
