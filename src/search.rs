//! Search engine contract plus the programmatic query builder shared by all
//! engine drivers.
//!
//! Engines receive regenerated [`Doc`]s from the indexing pipeline and must
//! enforce external versioning: a doc that is not strictly newer than the one
//! already held for its `(kind, id)` is rejected, which protects against
//! out-of-order delivery from the worker pool. The persistent tantivy driver
//! lives in `tantivy_search.rs`.

use std::cmp::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{DriverError, Error, Result};
use crate::types::Doc;

/// Contract every search backend must satisfy.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Store a regenerated document, replacing the previous version. Returns
    /// [`Error::VersionConflict`] when `doc.nano_ts` is not strictly newer
    /// than the version currently held.
    async fn update(&self, doc: Doc) -> Result<()>;

    /// Execute a built query and return matching docs.
    async fn run(&self, query: &SearchQuery) -> Result<Vec<Doc>>;

    /// Start a query against one entity kind.
    fn new_query(&self, kind: &str) -> SearchQuery {
        SearchQuery::new(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Clause {
    Exact { field: String, value: JsonValue },
    Regex { field: String, pattern: String },
}

/// Conjunction or disjunction of match clauses. Exactly one filter lives on
/// a query; the combinator is fixed when the filter is created.
#[derive(Debug, Clone)]
pub struct Filter {
    combinator: Combinator,
    clauses: Vec<Clause>,
}

impl Filter {
    /// Require the field to hold exactly this value.
    pub fn add_exact(&mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> &mut Filter {
        self.clauses.push(Clause::Exact {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Require the field to hold a string matching the pattern.
    pub fn add_regex(&mut self, field: impl Into<String>, pattern: impl Into<String>) -> &mut Filter {
        self.clauses.push(Clause::Regex {
            field: field.into(),
            pattern: pattern.into(),
        });
        self
    }

    pub(crate) fn matches(&self, doc: &Doc) -> Result<bool> {
        if self.clauses.is_empty() {
            return Ok(true);
        }
        let mut any = false;
        for clause in &self.clauses {
            let hit = match clause {
                Clause::Exact { field, value } => field_value(doc, field) == Some(value),
                Clause::Regex { field, pattern } => {
                    let re = Regex::new(pattern)
                        .map_err(|e| Error::Driver(Box::new(e) as DriverError))?;
                    match field_value(doc, field) {
                        Some(JsonValue::String(s)) => re.is_match(s),
                        _ => false,
                    }
                }
            };
            match self.combinator {
                Combinator::And if !hit => return Ok(false),
                Combinator::Or if hit => any = true,
                _ => {}
            }
        }
        Ok(self.combinator == Combinator::And || any)
    }
}

/// Builder for one search request: a kind, at most one filter, an optional
/// order and an optional limit.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub kind: String,
    filter: Option<Filter>,
    order: Option<String>,
    limit: Option<usize>,
}

impl SearchQuery {
    pub fn new(kind: impl Into<String>) -> SearchQuery {
        SearchQuery {
            kind: kind.into(),
            filter: None,
            order: None,
            limit: None,
        }
    }

    /// Attach a conjunctive filter, replacing any previous one.
    pub fn new_and_filter(&mut self) -> &mut Filter {
        self.filter = Some(Filter {
            combinator: Combinator::And,
            clauses: Vec::new(),
        });
        self.filter.as_mut().expect("filter just set")
    }

    /// Attach a disjunctive filter, replacing any previous one.
    pub fn new_or_filter(&mut self) -> &mut Filter {
        self.filter = Some(Filter {
            combinator: Combinator::Or,
            clauses: Vec::new(),
        });
        self.filter.as_mut().expect("filter just set")
    }

    /// Order results by a field, ascending; prefix with `-` for descending.
    /// Docs missing the field are dropped from the result.
    pub fn order(&mut self, field: impl Into<String>) -> &mut SearchQuery {
        self.order = Some(field.into());
        self
    }

    pub fn limit(&mut self, num: usize) -> &mut SearchQuery {
        self.limit = Some(num);
        self
    }
}

/// Strip the optional `data.` prefix and look the field up in the doc
/// payload.
fn field_value<'a>(doc: &'a Doc, field: &str) -> Option<&'a JsonValue> {
    let field = if field.len() > 5 && field[..5].eq_ignore_ascii_case("data.") {
        &field[5..]
    } else {
        field
    };
    doc.data.as_object().and_then(|m| m.get(field))
}

fn compare_values(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Evaluate filter, order, and limit over a set of candidate docs. Engine
/// drivers delegate here so clause semantics stay identical across backends.
pub(crate) fn apply(query: &SearchQuery, docs: Vec<Doc>) -> Result<Vec<Doc>> {
    let mut matched = Vec::with_capacity(docs.len());
    for doc in docs {
        let keep = match &query.filter {
            Some(filter) => filter.matches(&doc)?,
            None => true,
        };
        if keep {
            matched.push(doc);
        }
    }

    if let Some(order) = &query.order {
        let (field, reverse) = match order.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (order.as_str(), false),
        };
        matched.retain(|doc| field_value(doc, field).is_some());
        matched.sort_by(|a, b| {
            let ord = compare_values(
                field_value(a, field).expect("retained above"),
                field_value(b, field).expect("retained above"),
            );
            if reverse {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    if let Some(limit) = query.limit {
        matched.truncate(limit);
    }
    Ok(matched)
}

/// In-memory search engine keyed by `kind:id`. Intended for tests and
/// embedded use; everything is evaluated in-process.
#[derive(Default)]
pub struct MemSearch {
    docs: DashMap<String, Doc>,
}

impl MemSearch {
    pub fn new() -> MemSearch {
        MemSearch::default()
    }

    /// Every doc currently held, in no particular order.
    pub fn all(&self) -> Vec<Doc> {
        self.docs.iter().map(|r| r.value().clone()).collect()
    }

    fn key(doc: &Doc) -> String {
        format!("{}:{}", doc.kind, doc.id)
    }
}

#[async_trait]
impl SearchEngine for MemSearch {
    async fn update(&self, doc: Doc) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.docs.entry(MemSearch::key(&doc)) {
            Entry::Occupied(mut held) => {
                if held.get().nano_ts >= doc.nano_ts {
                    return Err(Error::VersionConflict {
                        kind: doc.kind,
                        id: doc.id,
                    });
                }
                held.insert(doc);
            }
            Entry::Vacant(slot) => {
                slot.insert(doc);
            }
        }
        Ok(())
    }

    async fn run(&self, query: &SearchQuery) -> Result<Vec<Doc>> {
        let candidates: Vec<Doc> = self
            .docs
            .iter()
            .filter(|r| r.value().kind == query.kind)
            .map(|r| r.value().clone())
            .collect();
        debug!(kind = %query.kind, candidates = candidates.len(), "running search");
        apply(query, candidates)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::types::{now_nanos, unique_string};
    use serde_json::json;

    pub const GALAXIES: [&str; 9] = [
        "sombrero galaxy",
        "messier 64",
        "2masx",
        "whirlpool galaxy",
        "ngc 123",
        "supernova",
        "galaxy ngc 1512",
        "ngc 3370",
        "m81",
    ];

    pub async fn add_galaxies(engine: &dyn SearchEngine) {
        for (pos, name) in GALAXIES.iter().enumerate() {
            let doc = Doc {
                id: unique_string(5),
                kind: "Galaxy".into(),
                nano_ts: now_nanos(),
                data: json!({"name": name, "pos": pos as i64}),
            };
            engine.update(doc).await.expect("galaxy doc rejected");
        }
    }
}
