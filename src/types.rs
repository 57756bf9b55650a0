//! Core record types shared by the store, query, and indexing subsystems.
//!
//! An [`Instruction`] is the single unit of persistence: an immutable,
//! timestamped subject-predicate-object triple. Entity state is never stored
//! directly; it is the replay of all instructions sharing a subject id.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;

/// Predicate of the back-edge written from a child to its parent at creation.
/// Never traversed forward by the query engine.
pub const PARENT_PREDICATE: &str = "_parent_";

/// Predicate of the soft-delete marker. An entity carrying it is hidden from
/// queries; its instructions remain in the store.
pub const DELETE_PREDICATE: &str = "_delete_";

/// One immutable write record. Exactly one of `object` / `object_id` is
/// populated: a non-empty `object` holds a JSON-encoded property value, a
/// non-empty `object_id` makes the instruction an edge to another entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub subject_id: String,
    pub subject_type: String,
    pub predicate: String,
    pub object: Vec<u8>,
    pub object_id: String,
    pub nano_ts: i64,
    pub source: String,
}

impl Instruction {
    /// True iff this instruction encodes a parent->child relationship rather
    /// than a property value.
    pub fn is_edge(&self) -> bool {
        !self.object_id.is_empty()
    }

    /// Portable binary form: field-by-field encoding in declaration order.
    /// Used by persistent drivers as the on-disk record format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Instruction> {
        Ok(bincode::deserialize(buf)?)
    }
}

/// Sort instructions by timestamp, oldest first. The sort is stable, so
/// records sharing a timestamp keep their store order.
pub fn sort_by_ts(its: &mut [Instruction]) {
    its.sort_by_key(|it| it.nano_ts);
}

/// A logical entity reference. The entity itself has no physical row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub id: String,
}

impl Entity {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Entity {
        Entity {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// The payload pushed to a search engine for one entity. `nano_ts` acts as
/// the external version: engines must drop docs that are not strictly newer
/// than what they already hold for `(kind, id)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Doc {
    pub id: String,
    pub kind: String,
    pub nano_ts: i64,
    pub data: JsonValue,
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random base-62 string of the given length. With length n there are 62^n
/// possible ids; collision handling is the caller's job.
pub fn unique_string(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Current wall clock in nanoseconds. Every instruction in one commit batch
/// shares a single value taken at build time.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_string_length_and_alphabet() {
        let id = unique_string(10);
        assert_eq!(id.len(), 10);
        assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));
    }

    #[test]
    fn instruction_codec_round_trip() {
        let it = Instruction {
            subject_id: "sid".into(),
            subject_type: "stype".into(),
            predicate: "name".into(),
            object: serde_json::to_vec(&serde_json::json!("value")).unwrap(),
            object_id: String::new(),
            nano_ts: 42,
            source: "author".into(),
        };

        let buf = it.encode().unwrap();
        let decoded = Instruction::decode(&buf).unwrap();
        assert_eq!(decoded, it);
    }

    #[test]
    fn sort_orders_by_nano_ts() {
        let mut its: Vec<Instruction> = (0..10)
            .map(|t| Instruction {
                nano_ts: 100 - t,
                ..Default::default()
            })
            .collect();
        sort_by_ts(&mut its);
        assert_eq!(its[0].nano_ts, 91);
        assert_eq!(its[9].nano_ts, 100);
    }

    #[test]
    fn edge_detection() {
        let mut it = Instruction::default();
        assert!(!it.is_edge());
        it.object_id = "child".into();
        assert!(it.is_edge());
    }
}
