//! Persistent search engine driver backed by a tantivy index.
//!
//! Each doc is one tantivy document: term-indexed `key` (`kind:id`) and
//! `kind` fields for lookups, plus the serialized doc as a stored payload.
//! External versioning is enforced before every write by consulting the
//! payload currently held under the key; filter clause evaluation and
//! ordering are shared with the in-memory engine, so how matching maps onto
//! the index is a driver detail.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tantivy::collector::DocSetCollector;
use tantivy::query::TermQuery;
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, STORED, STRING};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::search::{apply, SearchEngine, SearchQuery};
use crate::types::Doc;

const WRITER_HEAP_BYTES: usize = 50_000_000;

fn driver_err(err: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Driver(Box::new(err))
}

pub struct TantivySearch {
    writer: Arc<RwLock<IndexWriter>>,
    reader: IndexReader,
    key_field: Field,
    kind_field: Field,
    payload_field: Field,
}

impl TantivySearch {
    /// Open or create an index under `index_dir`.
    pub fn open(index_dir: &Path) -> Result<TantivySearch> {
        if !index_dir.exists() {
            std::fs::create_dir_all(index_dir).map_err(driver_err)?;
        }

        let mut schema_builder = Schema::builder();
        let key_field = schema_builder.add_text_field("key", STRING | STORED);
        let kind_field = schema_builder.add_text_field("kind", STRING | STORED);
        let payload_field = schema_builder.add_text_field("payload", STORED);
        let schema = schema_builder.build();

        // Open the on-disk index when one exists, otherwise create it with
        // the current schema.
        let index = if index_dir.read_dir().map_err(driver_err)?.next().is_some() {
            Index::open_in_dir(index_dir).map_err(driver_err)?
        } else {
            Index::create_in_dir(index_dir, schema).map_err(driver_err)?
        };

        let writer = index.writer(WRITER_HEAP_BYTES).map_err(driver_err)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(driver_err)?;

        Ok(TantivySearch {
            writer: Arc::new(RwLock::new(writer)),
            reader,
            key_field,
            kind_field,
            payload_field,
        })
    }

    fn hydrate(&self, stored: &TantivyDocument) -> Option<Doc> {
        let payload = stored.get_first(self.payload_field).and_then(|v| v.as_str())?;
        serde_json::from_str::<Doc>(payload).ok()
    }

    /// Highest version currently held under the key, if any.
    fn held_version(&self, key: &str) -> Result<Option<i64>> {
        self.reader.reload().map_err(driver_err)?;
        let searcher = self.reader.searcher();
        let term_query = TermQuery::new(
            Term::from_field_text(self.key_field, key),
            IndexRecordOption::Basic,
        );
        let addresses = searcher
            .search(&term_query, &DocSetCollector)
            .map_err(driver_err)?;

        let mut held = None;
        for address in addresses {
            let stored: TantivyDocument = searcher.doc(address).map_err(driver_err)?;
            if let Some(doc) = self.hydrate(&stored) {
                held = Some(held.map_or(doc.nano_ts, |v: i64| v.max(doc.nano_ts)));
            }
        }
        Ok(held)
    }
}

#[async_trait]
impl SearchEngine for TantivySearch {
    async fn update(&self, doc: Doc) -> Result<()> {
        // Hold the writer for the whole check-delete-add-commit sequence so
        // concurrent updates to one key cannot interleave.
        let mut writer = self.writer.write().await;

        let key = format!("{}:{}", doc.kind, doc.id);
        if let Some(held) = self.held_version(&key)? {
            if held >= doc.nano_ts {
                return Err(Error::VersionConflict {
                    kind: doc.kind,
                    id: doc.id,
                });
            }
        }

        writer.delete_term(Term::from_field_text(self.key_field, &key));
        let payload = serde_json::to_string(&doc)?;
        writer
            .add_document(doc!(
                self.key_field => key,
                self.kind_field => doc.kind.clone(),
                self.payload_field => payload,
            ))
            .map_err(driver_err)?;
        writer.commit().map_err(driver_err)?;
        debug!(kind = %doc.kind, id = %doc.id, "doc updated");
        Ok(())
    }

    async fn run(&self, query: &SearchQuery) -> Result<Vec<Doc>> {
        self.reader.reload().map_err(driver_err)?;
        let searcher = self.reader.searcher();

        let term_query = TermQuery::new(
            Term::from_field_text(self.kind_field, &query.kind),
            IndexRecordOption::Basic,
        );
        let addresses = searcher
            .search(&term_query, &DocSetCollector)
            .map_err(driver_err)?;

        let mut candidates = Vec::with_capacity(addresses.len());
        for address in addresses {
            let stored: TantivyDocument = searcher.doc(address).map_err(driver_err)?;
            if let Some(doc) = self.hydrate(&stored) {
                candidates.push(doc);
            }
        }
        apply(query, candidates)
    }
}
