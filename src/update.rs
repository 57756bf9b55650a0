//! Write path: a caller-built tree of pending edits flattened into one
//! atomically committed instruction batch.
//!
//! An [`Update`] handle points at one node of a shared tree. Handles stay
//! valid while the tree is being built; `execute` may be called on any of
//! them and always commits from the root. The tree is transient: once
//! executed it is discarded.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::{now_nanos, unique_string, Entity, Instruction, DELETE_PREDICATE};

const MAX_ID_ATTEMPTS: usize = 30;

#[derive(Clone)]
struct Node {
    kind: String,
    id: String,
    source: String,
    nano_ts: i64,
    edges: BTreeMap<String, JsonValue>,
    children: Vec<usize>,
    parent: Option<usize>,
}

struct Tree {
    nodes: Vec<Node>,
    // First value that failed JSON encoding; surfaced by execute.
    first_err: Option<Error>,
}

/// Handle to one pending entity in an update tree.
#[derive(Clone)]
pub struct Update {
    tree: Arc<Mutex<Tree>>,
    idx: usize,
}

impl Update {
    /// Handle to an existing entity. Kind and id must be non-empty by
    /// execute time.
    pub fn get(kind: impl Into<String>, id: impl Into<String>) -> Update {
        let root = Node {
            kind: kind.into(),
            id: id.into(),
            source: String::new(),
            nano_ts: now_nanos(),
            edges: BTreeMap::new(),
            children: Vec::new(),
            parent: None,
        };
        Update {
            tree: Arc::new(Mutex::new(Tree {
                nodes: vec![root],
                first_err: None,
            })),
            idx: 0,
        }
    }

    /// Set the author of the update, generally the userid of the modifier.
    /// Children added after this call inherit it.
    pub fn set_source(&self, source: impl Into<String>) -> Update {
        self.with_tree(|tree| tree.nodes[self.idx].source = source.into());
        self.clone()
    }

    /// Append a new pending child entity of the given kind and return its
    /// handle. The child id is assigned at execute time; a child has exactly
    /// one parent, by construction.
    pub fn add_child(&self, kind: impl Into<String>) -> Update {
        let mut tree = self.tree.lock().expect("update tree lock poisoned");
        let parent = &tree.nodes[self.idx];
        let child = Node {
            kind: kind.into(),
            id: String::new(),
            source: parent.source.clone(),
            nano_ts: parent.nano_ts,
            edges: BTreeMap::new(),
            children: Vec::new(),
            parent: Some(self.idx),
        };
        tree.nodes.push(child);
        let child_idx = tree.nodes.len() - 1;
        tree.nodes[self.idx].children.push(child_idx);
        Update {
            tree: self.tree.clone(),
            idx: child_idx,
        }
    }

    /// Upsert one property on this entity. Repeated sets of the same property
    /// within one build overwrite in memory; only the last value is emitted.
    /// No stored data is overwritten, the new value is appended as a fresh
    /// version at commit time.
    pub fn set<T: Serialize>(&self, property: impl Into<String>, value: T) -> Update {
        let property = property.into();
        match serde_json::to_value(value) {
            Ok(val) => self.with_tree(|tree| {
                tree.nodes[self.idx].edges.insert(property, val);
            }),
            Err(err) => self.with_tree(|tree| {
                if tree.first_err.is_none() {
                    tree.first_err = Some(err.into());
                }
            }),
        }
        self.clone()
    }

    /// Mark this entity as deleted. Equivalent to `set("_delete_", true)`;
    /// queries reaching the entity afterwards return an empty subtree, while
    /// its instruction history stays in the store.
    pub fn mark_deleted(&self) -> Update {
        self.set(DELETE_PREDICATE, true)
    }

    /// Override the commit timestamp (nanoseconds) for the whole tree. Only
    /// valid on the root node; calls on children are ignored with a warning.
    pub fn set_commit_ts(&self, ts_nano: i64) -> Update {
        self.with_tree(|tree| {
            if tree.nodes[self.idx].parent.is_some() {
                warn!("set_commit_ts called on a child node, ignoring");
                return;
            }
            let mut pending = vec![self.idx];
            while let Some(idx) = pending.pop() {
                tree.nodes[idx].nano_ts = ts_nano;
                pending.extend(tree.nodes[idx].children.iter().copied());
            }
        });
        self.clone()
    }

    /// Entity id of this node. Empty for pending children until `execute`
    /// assigns one.
    pub fn id(&self) -> String {
        self.with_tree(|tree| tree.nodes[self.idx].id.clone())
    }

    pub fn kind(&self) -> String {
        self.with_tree(|tree| tree.nodes[self.idx].kind.clone())
    }

    /// Flatten the tree from its root into an instruction batch, allocate
    /// collision-free child ids, commit the batch atomically through the
    /// store, and enqueue each distinct touched entity for reindexing.
    ///
    /// The first error encountered aborts the whole execute; there is no
    /// retry and no partial recovery.
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        if ctx.num_chars_unique == 0 {
            return Err(Error::InvalidNumCharsUnique);
        }

        // Snapshot under the lock; allocation below probes the store and must
        // not hold it.
        let (mut nodes, root) = {
            let mut tree = self.tree.lock().expect("update tree lock poisoned");
            if let Some(err) = tree.first_err.take() {
                return Err(err);
            }
            let mut root = self.idx;
            while let Some(parent) = tree.nodes[root].parent {
                root = parent;
            }
            (tree.nodes.clone(), root)
        };

        if nodes[root].id.is_empty() || nodes[root].kind.is_empty() {
            return Err(Error::EmptyId);
        }

        let mut flattener = Flattener {
            ctx,
            allocated: HashSet::new(),
            batch: Vec::new(),
        };
        flattener.flatten(&mut nodes, root).await?;
        let batch = flattener.batch;

        if batch.is_empty() {
            return Err(Error::EmptyBatch);
        }
        ctx.store().commit(&batch).await?;
        debug!(num = batch.len(), "batch committed");

        // Publish allocated child ids back to the live handles.
        {
            let mut tree = self.tree.lock().expect("update tree lock poisoned");
            for (node, snapshot) in tree.nodes.iter_mut().zip(nodes.iter()) {
                node.id = snapshot.id.clone();
            }
        }

        if ctx.has_indexer() {
            let mut seen = HashSet::new();
            for it in &batch {
                let entity = Entity::new(it.subject_type.clone(), it.subject_id.clone());
                if seen.insert(entity.clone()) {
                    ctx.add_to_queue(entity).await;
                }
            }
        }
        Ok(())
    }

    fn with_tree<R>(&self, f: impl FnOnce(&mut Tree) -> R) -> R {
        let mut tree = self.tree.lock().expect("update tree lock poisoned");
        f(&mut tree)
    }
}

struct Flattener<'c> {
    ctx: &'c Context,
    allocated: HashSet<String>,
    batch: Vec<Instruction>,
}

impl Flattener<'_> {
    fn flatten<'a>(&'a mut self, nodes: &'a mut Vec<Node>, idx: usize) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let node = nodes[idx].clone();

            if !node.edges.is_empty() && node.source.is_empty() {
                return Err(Error::NoSource {
                    kind: node.kind.clone(),
                    id: node.id.clone(),
                });
            }
            for (pred, val) in &node.edges {
                self.batch.push(Instruction {
                    subject_id: node.id.clone(),
                    subject_type: node.kind.clone(),
                    predicate: pred.clone(),
                    object: serde_json::to_vec(val)?,
                    object_id: String::new(),
                    nano_ts: node.nano_ts,
                    source: node.source.clone(),
                });
            }

            if node.children.is_empty() {
                return Ok(());
            }
            if node.source.is_empty() {
                return Err(Error::NoSource {
                    kind: node.kind.clone(),
                    id: node.id.clone(),
                });
            }

            for child_idx in node.children {
                if !nodes[child_idx].id.is_empty() {
                    return Err(Error::NonEmptyChildId {
                        id: nodes[child_idx].id.clone(),
                    });
                }
                let id = self.allocate_id().await?;
                nodes[child_idx].id = id.clone();
                let child_kind = nodes[child_idx].kind.clone();

                // Forward edge parent -> child, paired with the back-edge at
                // the same timestamp.
                self.batch.push(Instruction {
                    subject_id: node.id.clone(),
                    subject_type: node.kind.clone(),
                    predicate: child_kind.clone(),
                    object: Vec::new(),
                    object_id: id.clone(),
                    nano_ts: node.nano_ts,
                    source: node.source.clone(),
                });
                self.batch.push(Instruction {
                    subject_id: id,
                    subject_type: child_kind,
                    predicate: crate::types::PARENT_PREDICATE.into(),
                    object: Vec::new(),
                    object_id: node.id.clone(),
                    nano_ts: node.nano_ts,
                    source: node.source.clone(),
                });

                self.flatten(nodes, child_idx).await?;
            }
            Ok(())
        })
    }

    async fn allocate_id(&mut self) -> Result<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = unique_string(self.ctx.num_chars_unique);
            if self.allocated.contains(&candidate) {
                continue;
            }
            debug!(id = %candidate, "checking availability of new id");
            if self.ctx.store().is_new(&candidate).await {
                self.allocated.insert(candidate.clone());
                return Ok(candidate);
            }
        }
        Err(Error::IdExhausted(MAX_ID_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, Store};
    use crate::types::PARENT_PREDICATE;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn ctx() -> Context {
        Context::new(Arc::new(MemStore::new()), 10)
    }

    #[tokio::test]
    async fn execute_requires_source() {
        let c = ctx();
        let err = Update::get("User", "u1")
            .set("name", "alice")
            .execute(&c)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSource { .. }));
    }

    #[tokio::test]
    async fn execute_requires_instructions() {
        let c = ctx();
        let err = Update::get("User", "u1")
            .set_source("u1")
            .execute(&c)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyBatch));
    }

    #[tokio::test]
    async fn execute_requires_num_chars_unique() {
        let c = Context::new(Arc::new(MemStore::new()), 0);
        let err = Update::get("User", "u1")
            .set_source("u1")
            .set("name", "alice")
            .execute(&c)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidNumCharsUnique));
    }

    #[tokio::test]
    async fn children_get_ids_and_back_edges() {
        let c = ctx();
        let user = Update::get("User", "u1");
        user.set_source("u1").set("name", "alice");
        let post = user.add_child("Post");
        post.set("url", "g");

        user.execute(&c).await.unwrap();

        let post_id = post.id();
        assert_eq!(post_id.len(), 10);

        let user_its = c.store().get_entity("u1").await.unwrap();
        let forward = user_its
            .iter()
            .find(|it| it.predicate == "Post")
            .expect("forward edge");
        assert_eq!(forward.object_id, post_id);

        let post_its = c.store().get_entity(&post_id).await.unwrap();
        let back = post_its
            .iter()
            .find(|it| it.predicate == PARENT_PREDICATE)
            .expect("back edge");
        assert_eq!(back.object_id, "u1");
        assert_eq!(back.nano_ts, forward.nano_ts);

        // One shared timestamp and a non-empty source across the batch.
        for it in user_its.iter().chain(post_its.iter()) {
            assert_eq!(it.nano_ts, forward.nano_ts);
            assert_eq!(it.source, "u1");
        }
    }

    #[tokio::test]
    async fn repeated_set_emits_last_value_only() {
        let c = ctx();
        Update::get("Ticker", "GOOG")
            .set_source("nasdaq")
            .set("price", 660)
            .set("price", 661)
            .execute(&c)
            .await
            .unwrap();

        let its = c.store().get_entity("GOOG").await.unwrap();
        let prices: Vec<_> = its.iter().filter(|it| it.predicate == "price").collect();
        assert_eq!(prices.len(), 1);
        let val: serde_json::Value = serde_json::from_slice(&prices[0].object).unwrap();
        assert_eq!(val, serde_json::json!(661));
    }

    #[tokio::test]
    async fn set_commit_ts_applies_to_root_only() {
        let c = ctx();
        let root = Update::get("User", "u1").set_source("u1");
        root.set("name", "alice");
        let child = root.add_child("Post");
        child.set("url", "g");

        // Ignored on the child, applied from the root downwards.
        child.set_commit_ts(1);
        root.set_commit_ts(42);
        root.execute(&c).await.unwrap();

        for it in c.store().get_entity("u1").await.unwrap() {
            assert_eq!(it.nano_ts, 42);
        }
        for it in c.store().get_entity(&child.id()).await.unwrap() {
            assert_eq!(it.nano_ts, 42);
        }
    }

    #[tokio::test]
    async fn execute_from_child_handle_commits_whole_tree() {
        let c = ctx();
        let root = Update::get("User", "u1").set_source("u1");
        root.set("name", "alice");
        let post = root.add_child("Post");
        post.set("url", "g");

        post.execute(&c).await.unwrap();
        assert!(!c.store().is_new("u1").await);
        assert!(!c.store().is_new(&post.id()).await);
    }

    #[tokio::test]
    async fn one_queue_entry_per_distinct_subject() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut c = ctx();
        c.updates = Some(tx);

        let user = Update::get("User", "u1");
        user.set_source("u1").set("a", 1).set("b", 2);
        let post = user.add_child("Post");
        post.set("url", "g").set("body", "b");
        user.execute(&c).await.unwrap();
        drop(c);

        let mut seen = Vec::new();
        while let Some(e) = rx.recv().await {
            seen.push(e);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Entity::new("User", "u1"));
        assert_eq!(seen[1].kind, "Post");
    }
}
