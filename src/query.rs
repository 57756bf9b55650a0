//! Read path: concurrent traversal of the entity graph from a root id
//! outward, merging the flat instruction log into a nested result tree.
//!
//! A [`Query`] handle points at one node of a shared query tree, mirroring
//! the update builder. `run` snapshots the tree into an immutable plan and
//! spawns one task per edge per node; siblings at every level are fetched
//! concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value as JsonValue};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{now_nanos, sort_by_ts, DELETE_PREDICATE, PARENT_PREDICATE};

/// One value a predicate held at some point in time.
#[derive(Debug, Clone)]
pub struct Version {
    pub value: JsonValue,
    pub source: String,
    pub nano_ts: i64,
}

/// Time-ordered history of a single predicate on one entity, oldest first.
#[derive(Debug, Clone, Default)]
pub struct Versions {
    versions: Vec<Version>,
}

impl Versions {
    fn push(&mut self, version: Version) {
        if let Some(last) = self.versions.last() {
            // The caller feeds versions in sorted order; a regression here
            // means the traversal itself is broken.
            assert!(
                last.nano_ts <= version.nano_ts,
                "appending an out-of-order version to a sorted list"
            );
        }
        self.versions.push(version);
    }

    pub fn latest(&self) -> Option<&Version> {
        self.versions.last()
    }

    pub fn oldest(&self) -> Option<&Version> {
        self.versions.first()
    }

    pub fn count(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Version> {
        self.versions.iter()
    }
}

/// One node of the reconstructed entity tree. An empty id marks a node that
/// was hidden (deleted, filtered) or absent; such nodes are never attached
/// as children.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub id: String,
    pub kind: String,
    pub columns: BTreeMap<String, Versions>,
    pub children: Vec<QueryResult>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() || self.kind.is_empty()
    }

    /// Remove a predicate from the result, e.g. to strip internal columns
    /// before projection.
    pub fn drop_column(&mut self, predicate: &str) {
        self.columns.remove(predicate);
    }

    /// Lossy projection to a flat JSON object: per predicate only the latest
    /// value survives, `modifier`/`creator` carry the most and least recent
    /// author across all predicates, and children are grouped into one list
    /// per kind.
    pub fn to_map(&self) -> JsonValue {
        let mut data = Map::new();
        data.insert("id".into(), json!(self.id));
        data.insert("kind".into(), json!(self.kind));

        let mut ts_latest = 0i64;
        let mut ts_oldest = now_nanos();
        for (pred, versions) in &self.columns {
            let (latest, oldest) = match (versions.latest(), versions.oldest()) {
                (Some(l), Some(o)) => (l, o),
                _ => continue,
            };
            data.insert(pred.clone(), latest.value.clone());
            if latest.nano_ts > ts_latest {
                ts_latest = latest.nano_ts;
                data.insert("modifier".into(), json!(latest.source));
            }
            if oldest.nano_ts < ts_oldest {
                ts_oldest = oldest.nano_ts;
                data.insert("creator".into(), json!(oldest.source));
            }
        }
        data.insert("creation_ms".into(), json!(ts_oldest / 1_000_000));
        data.insert("modification_ms".into(), json!(ts_latest / 1_000_000));

        let mut by_kind: BTreeMap<String, Vec<JsonValue>> = BTreeMap::new();
        for child in &self.children {
            by_kind
                .entry(child.kind.clone())
                .or_default()
                .push(child.to_map());
        }
        for (kind, list) in by_kind {
            data.insert(kind, JsonValue::Array(list));
        }

        JsonValue::Object(data)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_map())?)
    }
}

struct QNode {
    // Collected child-kind; empty on the root node.
    kind: String,
    id: String,
    filter_out: HashSet<String>,
    max_depth: usize,
    children: Vec<usize>,
    parent: Option<usize>,
}

struct QTree {
    nodes: Vec<QNode>,
}

/// Handle to one node of a query tree.
#[derive(Clone)]
pub struct Query {
    tree: Arc<Mutex<QTree>>,
    idx: usize,
}

impl Query {
    /// Root query, bound to an entity id.
    pub fn new(id: impl Into<String>) -> Query {
        let root = QNode {
            kind: String::new(),
            id: id.into(),
            filter_out: HashSet::new(),
            max_depth: 0,
            children: Vec::new(),
            parent: None,
        };
        Query {
            tree: Arc::new(Mutex::new(QTree { nodes: vec![root] })),
            idx: 0,
        }
    }

    /// Maximum recursion depth for children not named via `collect`.
    /// Defaults to zero: no anonymous edges are followed.
    pub fn upto_depth(&self, level: usize) -> Query {
        self.with_tree(|tree| tree.nodes[self.idx].max_depth = level);
        self.clone()
    }

    /// Declare that children of this kind must be fetched recursively into
    /// the result, and return the handle for that child query. Calling it
    /// twice with the same kind returns the existing handle, so further
    /// chaining attaches there. A collected subtree carries its own depth
    /// budget, independent of its parent's.
    pub fn collect(&self, kind: impl Into<String>) -> Query {
        let kind = kind.into();
        let mut tree = self.tree.lock().expect("query tree lock poisoned");
        let existing = tree.nodes[self.idx]
            .children
            .iter()
            .copied()
            .find(|&i| tree.nodes[i].kind == kind);
        let idx = match existing {
            Some(i) => i,
            None => {
                tree.nodes.push(QNode {
                    kind,
                    id: String::new(),
                    filter_out: HashSet::new(),
                    max_depth: 0,
                    children: Vec::new(),
                    parent: Some(self.idx),
                });
                let i = tree.nodes.len() - 1;
                tree.nodes[self.idx].children.push(i);
                i
            }
        };
        Query {
            tree: self.tree.clone(),
            idx,
        }
    }

    /// Exclude any entity carrying this predicate (regardless of value) from
    /// this branch of the result.
    pub fn filter_out(&self, property: impl Into<String>) -> Query {
        let property = property.into();
        self.with_tree(|tree| {
            tree.nodes[self.idx].filter_out.insert(property);
        });
        self.clone()
    }

    /// Execute the query from its root and block until the whole traversal
    /// has finished. Failed subtrees are logged and omitted; only root-level
    /// failures surface as errors.
    pub async fn run(&self, ctx: &Context) -> Result<QueryResult> {
        let (plan, root, id, max) = {
            let tree = self.tree.lock().expect("query tree lock poisoned");
            let mut root = self.idx;
            while let Some(parent) = tree.nodes[root].parent {
                root = parent;
            }
            let nodes = tree
                .nodes
                .iter()
                .map(|n| PlanNode {
                    filter_out: n.filter_out.clone(),
                    max_depth: n.max_depth,
                    follow: n
                        .children
                        .iter()
                        .map(|&i| (tree.nodes[i].kind.clone(), i))
                        .collect(),
                })
                .collect();
            (
                Arc::new(Plan { nodes }),
                root,
                tree.nodes[root].id.clone(),
                tree.nodes[root].max_depth,
            )
        };
        if id.is_empty() {
            return Err(Error::EmptyId);
        }
        do_run(ctx.store().clone(), plan, Some(root), id, 0, max).await
    }

    fn with_tree<R>(&self, f: impl FnOnce(&mut QTree) -> R) -> R {
        let mut tree = self.tree.lock().expect("query tree lock poisoned");
        f(&mut tree)
    }
}

struct PlanNode {
    filter_out: HashSet<String>,
    max_depth: usize,
    // Collected child-kind -> plan node index.
    follow: HashMap<String, usize>,
}

struct Plan {
    nodes: Vec<PlanNode>,
}

/// One traversal task. `node` is the plan node driving filters and collected
/// kinds; anonymous children run without one. `level`/`max` bound how many
/// anonymous hops remain on this branch.
fn do_run(
    store: Arc<dyn Store>,
    plan: Arc<Plan>,
    node: Option<usize>,
    id: String,
    level: usize,
    max: usize,
) -> BoxFuture<'static, Result<QueryResult>> {
    Box::pin(async move {
        let mut its = store.get_entity(&id).await?;
        if its.is_empty() {
            return Ok(QueryResult::default());
        }
        sort_by_ts(&mut its);

        let empty_filter = HashSet::new();
        let empty_follow = HashMap::new();
        let (filter_out, follow) = match node {
            Some(i) => (&plan.nodes[i].filter_out, &plan.nodes[i].follow),
            None => (&empty_filter, &empty_follow),
        };

        let mut result = QueryResult {
            id: its[0].subject_id.clone(),
            kind: its[0].subject_type.clone(),
            ..Default::default()
        };
        let mut tasks: Vec<JoinHandle<Result<QueryResult>>> = Vec::new();

        for it in &its {
            if it.predicate == DELETE_PREDICATE {
                debug!(id = %result.id, kind = %result.kind, "discarding due to delete bit");
                return Ok(QueryResult::default());
            }
            if it.predicate == PARENT_PREDICATE {
                // Never follow the edge back to the parent.
                continue;
            }
            if filter_out.contains(&it.predicate) {
                debug!(id = %result.id, predicate = %it.predicate, "discarding due to predicate filter");
                return Ok(QueryResult::default());
            }

            if !it.is_edge() {
                let value: JsonValue = serde_json::from_slice(&it.object)?;
                result.columns.entry(it.predicate.clone()).or_default().push(Version {
                    value,
                    source: it.source.clone(),
                    nano_ts: it.nano_ts,
                });
                continue;
            }

            if let Some(&child) = follow.get(&it.predicate) {
                // A collected child uses its own depth budget, reset to zero
                // at the subtree root. Collection is authoritative for its
                // kind; the anonymous branch below never sees these edges.
                let child_max = plan.nodes[child].max_depth;
                tasks.push(tokio::spawn(do_run(
                    store.clone(),
                    plan.clone(),
                    Some(child),
                    it.object_id.clone(),
                    0,
                    child_max,
                )));
                continue;
            }

            if level < max {
                tasks.push(tokio::spawn(do_run(
                    store.clone(),
                    plan.clone(),
                    None,
                    it.object_id.clone(),
                    level + 1,
                    max,
                )));
            }
        }

        for task in tasks {
            match task.await {
                Ok(Ok(child)) => {
                    if !child.is_empty() {
                        result.children.push(child);
                    }
                }
                Ok(Err(err)) => error!(error = %err, "while running child query"),
                Err(err) => error!(error = %err, "child query task failed"),
            }
        }
        Ok(result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::update::Update;

    fn ctx() -> Context {
        Context::new(Arc::new(MemStore::new()), 10)
    }

    #[tokio::test]
    async fn missing_entity_yields_empty_result() {
        let c = ctx();
        let result = Query::new("nope").run(&c).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn empty_id_is_an_error() {
        let c = ctx();
        assert!(matches!(
            Query::new("").run(&c).await,
            Err(Error::EmptyId)
        ));
    }

    #[tokio::test]
    async fn versions_accumulate_in_ts_order() {
        let c = ctx();
        for (i, price) in (660..670).enumerate() {
            Update::get("Ticker", "GOOG")
                .set_source("nasdaq")
                .set("price", price)
                .set_commit_ts(i as i64 + 1)
                .execute(&c)
                .await
                .unwrap();
        }

        let result = Query::new("GOOG").run(&c).await.unwrap();
        let versions = result.columns.get("price").expect("price column");
        assert_eq!(versions.count(), 10);
        assert_eq!(versions.latest().unwrap().value, json!(669));
        assert_eq!(versions.oldest().unwrap().value, json!(660));

        let data = result.to_map();
        assert_eq!(data["price"], json!(669));
        assert_eq!(data["modifier"], json!("nasdaq"));
        assert_eq!(data["creator"], json!("nasdaq"));
    }

    #[tokio::test]
    async fn collected_children_are_attached() {
        let c = ctx();
        let user = Update::get("User", "u1").set_source("u1");
        user.set("name", "alice");
        let post = user.add_child("Post");
        post.set("url", "g").set("body", "b");
        user.execute(&c).await.unwrap();

        let q = Query::new("u1");
        q.collect("Post");
        let result = q.run(&c).await.unwrap();
        assert_eq!(result.children.len(), 1);
        assert_eq!(result.children[0].kind, "Post");
        assert_eq!(
            result.children[0].columns["url"].latest().unwrap().value,
            json!("g")
        );
    }

    #[tokio::test]
    async fn depth_zero_skips_anonymous_edges() {
        let c = ctx();
        let user = Update::get("User", "u1").set_source("u1");
        user.set("name", "alice");
        user.add_child("Post").set("url", "g");
        user.execute(&c).await.unwrap();

        let result = Query::new("u1").run(&c).await.unwrap();
        assert!(result.children.is_empty());

        let result = Query::new("u1").upto_depth(1).run(&c).await.unwrap();
        assert_eq!(result.children.len(), 1);
    }

    #[tokio::test]
    async fn collected_depth_budget_is_independent_of_parent() {
        let c = ctx();
        let user = Update::get("User", "u1").set_source("u1");
        user.set("name", "alice");
        let post = user.add_child("Post");
        post.set("url", "g");
        post.add_child("Comment").set("body", "first");
        user.execute(&c).await.unwrap();

        // Parent depth is zero, yet the collected Post subtree follows its
        // own budget and reaches the comment.
        let q = Query::new("u1");
        q.collect("Post").upto_depth(1);
        let result = q.run(&c).await.unwrap();
        assert_eq!(result.children.len(), 1);
        assert_eq!(result.children[0].children.len(), 1);
        assert_eq!(result.children[0].children[0].kind, "Comment");
    }

    #[tokio::test]
    async fn filter_out_hides_predicate_bearers() {
        let c = ctx();
        let post = Update::get("Post", "p1").set_source("u1");
        post.set("title", "t");
        post.add_child("Comment").set("body", "ok");
        post.add_child("Comment").set("body", "bad").set("censored", true);
        post.execute(&c).await.unwrap();

        let q = Query::new("p1");
        q.collect("Comment").filter_out("censored");
        let result = q.run(&c).await.unwrap();
        assert_eq!(result.children.len(), 1);
        assert_eq!(
            result.children[0].columns["body"].latest().unwrap().value,
            json!("ok")
        );
    }

    #[tokio::test]
    async fn deleted_entities_are_hidden_but_retained() {
        let c = ctx();
        let post = Update::get("Post", "p1").set_source("u1");
        post.set("title", "t");
        let like = post.add_child("Like");
        like.set("thumbs_up", true);
        post.execute(&c).await.unwrap();

        let like_id = like.id();
        Update::get("Like", &like_id)
            .set_source("u1")
            .mark_deleted()
            .execute(&c)
            .await
            .unwrap();

        let result = Query::new("p1").upto_depth(10).run(&c).await.unwrap();
        assert!(result.children.is_empty());

        // History survives the soft delete.
        let its = c.store().get_entity(&like_id).await.unwrap();
        assert!(its.iter().any(|it| it.predicate == DELETE_PREDICATE));
        assert!(its.iter().any(|it| it.predicate == "thumbs_up"));
    }

    #[tokio::test]
    async fn parent_back_edge_is_not_traversed() {
        let c = ctx();
        let user = Update::get("User", "u1").set_source("u1");
        user.set("name", "alice");
        let post = user.add_child("Post");
        post.set("url", "g");
        user.execute(&c).await.unwrap();

        let result = Query::new(post.id()).upto_depth(10).run(&c).await.unwrap();
        assert_eq!(result.kind, "Post");
        assert!(result.children.is_empty());
    }

    #[tokio::test]
    async fn projection_groups_children_by_kind() {
        let c = ctx();
        let user = Update::get("User", "u1").set_source("u1");
        user.set("name", "alice");
        user.add_child("Post").set("url", "a");
        user.add_child("Post").set("url", "b");
        user.add_child("Like").set("thumbs_up", true);
        user.execute(&c).await.unwrap();

        let data = Query::new("u1").upto_depth(1).run(&c).await.unwrap().to_map();
        assert_eq!(data["kind"], json!("User"));
        assert_eq!(data["Post"].as_array().unwrap().len(), 2);
        assert_eq!(data["Like"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drop_column_removes_predicate() {
        let c = ctx();
        Update::get("User", "u1")
            .set_source("u1")
            .set("name", "alice")
            .set("secret", "s")
            .execute(&c)
            .await
            .unwrap();

        let mut result = Query::new("u1").run(&c).await.unwrap();
        result.drop_column("secret");
        assert!(result.columns.get("secret").is_none());
        assert!(result.columns.get("name").is_some());
    }

    #[tokio::test]
    async fn rerunning_a_query_is_idempotent() {
        let c = ctx();
        let user = Update::get("User", "u1").set_source("u1");
        user.set("name", "alice");
        user.add_child("Post").set("url", "a");
        user.add_child("Post").set("url", "b");
        user.execute(&c).await.unwrap();

        let q = Query::new("u1").upto_depth(2);
        let a = q.run(&c).await.unwrap();
        let b = q.run(&c).await.unwrap();
        assert_eq!(a.columns.len(), b.columns.len());
        assert_eq!(a.children.len(), b.children.len());
    }
}
