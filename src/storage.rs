//! Persistent storage driver backed by the redb K/V store.
//!
//! Instructions are stored under a composite `(subject_id, seq)` key, where
//! `seq` comes from a monotonically increasing counter in the meta table.
//! Range scans over the key space therefore replay one entity's history in
//! commit order, and a full-table walk visits subjects lexicographically,
//! which `iterate` relies on for cursoring. Records are the portable binary
//! instruction encoding.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Entity, Instruction};

const INSTRUCTIONS_TABLE: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("instructions");
/// Meta table for counters; currently only the last assigned sequence.
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const LAST_SEQ_KEY: &str = "last_seq";

fn driver_err(err: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Driver(Box::new(err))
}

pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Create or open a database under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<RedbStore> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(driver_err)?;
        let db = Database::create(data_dir.join("data.redb")).map_err(driver_err)?;

        // Make sure both tables exist before the first read transaction.
        let txn = db.begin_write().map_err(driver_err)?;
        {
            let _ = txn.open_table(INSTRUCTIONS_TABLE).map_err(driver_err)?;
            let _ = txn.open_table(META_TABLE).map_err(driver_err)?;
        }
        txn.commit().map_err(driver_err)?;

        Ok(RedbStore { db: Arc::new(db) })
    }
}

#[async_trait]
impl Store for RedbStore {
    async fn commit(&self, batch: &[Instruction]) -> Result<()> {
        // One write transaction for the whole batch, including the sequence
        // counter update: all-or-nothing visibility.
        let txn = self.db.begin_write().map_err(driver_err)?;
        {
            let mut meta = txn.open_table(META_TABLE).map_err(driver_err)?;
            let mut seq = meta
                .get(LAST_SEQ_KEY)
                .map_err(driver_err)?
                .map(|g| g.value())
                .unwrap_or(0);

            let mut table = txn.open_table(INSTRUCTIONS_TABLE).map_err(driver_err)?;
            for it in batch {
                seq += 1;
                let buf = it.encode()?;
                table
                    .insert((it.subject_id.as_str(), seq), buf.as_slice())
                    .map_err(driver_err)?;
            }
            meta.insert(LAST_SEQ_KEY, seq).map_err(driver_err)?;
        }
        txn.commit().map_err(driver_err)?;
        debug!(num = batch.len(), "instructions committed");
        Ok(())
    }

    async fn is_new(&self, subject: &str) -> bool {
        let found = || -> Result<bool> {
            let txn = self.db.begin_read().map_err(driver_err)?;
            let table = txn.open_table(INSTRUCTIONS_TABLE).map_err(driver_err)?;
            let mut range = table
                .range((subject, 0u64)..=(subject, u64::MAX))
                .map_err(driver_err)?;
            Ok(range.next().is_some())
        };
        match found() {
            Ok(present) => !present,
            Err(err) => {
                tracing::error!(error = %err, subject, "while probing id, treating as taken");
                false
            }
        }
    }

    async fn get_entity(&self, subject: &str) -> Result<Vec<Instruction>> {
        let txn = self.db.begin_read().map_err(driver_err)?;
        let table = txn.open_table(INSTRUCTIONS_TABLE).map_err(driver_err)?;

        let mut result = Vec::new();
        for item in table
            .range((subject, 0u64)..=(subject, u64::MAX))
            .map_err(driver_err)?
        {
            let (_key, value) = item.map_err(driver_err)?;
            result.push(Instruction::decode(value.value())?);
        }
        Ok(result)
    }

    async fn iterate(
        &self,
        from: &str,
        num: usize,
        tx: &mpsc::Sender<Entity>,
    ) -> Result<(usize, Option<Entity>)> {
        // Collect the page under the read transaction, send after dropping
        // it so channel backpressure never pins the database.
        let page: Vec<Entity> = {
            let txn = self.db.begin_read().map_err(driver_err)?;
            let table = txn.open_table(INSTRUCTIONS_TABLE).map_err(driver_err)?;

            let mut page = Vec::with_capacity(num);
            let mut current: Option<String> = None;
            for item in table
                .range((from, u64::MAX)..)
                .map_err(driver_err)?
            {
                let (key, value) = item.map_err(driver_err)?;
                let (subject, _seq) = key.value();
                if current.as_deref() == Some(subject) {
                    continue;
                }
                if page.len() == num {
                    break;
                }
                current = Some(subject.to_string());
                let it = Instruction::decode(value.value())?;
                page.push(Entity::new(it.subject_type, subject.to_string()));
            }
            page
        };

        let mut count = 0;
        let mut last = None;
        for entity in page {
            last = Some(entity.clone());
            if tx.send(entity).await.is_err() {
                break;
            }
            count += 1;
        }
        Ok((count, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_nanos;
    use tempfile::TempDir;

    fn instruction(subject: &str, kind: &str, pred: &str, ts: i64) -> Instruction {
        Instruction {
            subject_id: subject.into(),
            subject_type: kind.into(),
            predicate: pred.into(),
            object: serde_json::to_vec(&serde_json::json!(true)).unwrap(),
            object_id: String::new(),
            nano_ts: ts,
            source: "tester".into(),
        }
    }

    #[tokio::test]
    async fn commit_and_replay_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path()).await.unwrap();

        let ts = now_nanos();
        let batch = vec![
            instruction("e1", "Thing", "a", ts),
            instruction("e1", "Thing", "b", ts),
            instruction("e2", "Other", "c", ts),
        ];
        store.commit(&batch).await.unwrap();

        let its = store.get_entity("e1").await.unwrap();
        assert_eq!(its.len(), 2);
        assert_eq!(its[0].subject_type, "Thing");
        assert!(!store.is_new("e1").await);
        assert!(store.is_new("e3").await);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RedbStore::open(dir.path()).await.unwrap();
            store
                .commit(&[instruction("e1", "Thing", "a", now_nanos())])
                .await
                .unwrap();
        }

        let store = RedbStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get_entity("e1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn iterate_pages_distinct_subjects() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path()).await.unwrap();

        let ts = now_nanos();
        for id in ["a1", "a2", "a3"] {
            // Several instructions per subject; iterate must still yield one
            // entity each.
            store
                .commit(&[
                    instruction(id, "Thing", "x", ts),
                    instruction(id, "Thing", "y", ts),
                ])
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        let (count, last) = store.iterate("", 2, &tx).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(last.as_ref().unwrap().id, "a2");
        assert_eq!(rx.recv().await.unwrap().id, "a1");
        assert_eq!(rx.recv().await.unwrap().id, "a2");

        let (count, last) = store.iterate("a2", 16, &tx).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(last.unwrap().id, "a3");

        let (count, _) = store.iterate("a3", 16, &tx).await.unwrap();
        assert_eq!(count, 0);
    }
}
