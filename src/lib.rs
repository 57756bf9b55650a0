//! Graph-shaped, append-only entity store with an incremental
//! search-indexing pipeline.
//!
//! Every write is recorded as an immutable [`Instruction`]; entity state is
//! reconstructed on read by replaying the instruction log. Updates are built
//! as trees and committed atomically, queries traverse the graph
//! concurrently, and a background worker pool keeps a pluggable search
//! engine eventually consistent with the store.

pub mod context;
pub mod error;
pub mod indexer;
pub mod query;
pub mod search;
pub mod storage;
pub mod store;
pub mod tantivy_search;
pub mod types;
pub mod update;

pub use context::Context;
pub use error::{Error, Result, Status};
pub use indexer::{Indexer, Registry, Server};
pub use query::{Query, QueryResult, Version, Versions};
pub use search::{Filter, MemSearch, SearchEngine, SearchQuery};
pub use storage::RedbStore;
pub use store::{MemStore, Store};
pub use tantivy_search::TantivySearch;
pub use types::{Doc, Entity, Instruction};
pub use update::Update;
