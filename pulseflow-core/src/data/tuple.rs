//! Tuple Identity
//!
//! Every record that enters the graph is wrapped in a [`Tuple`] and given a
//! [`TupleId`]. The id is what operators key their state on: two tuples with
//! identical fields are still different tuples if their ids differ, and a
//! field mutation does not change a tuple's id.
//!
//! # Ownership
//!
//! A `Tuple` is a shared handle. Cloning it clones the handle, not the record,
//! so a tuple can sit in several pulses and operator states at once. Field
//! values live behind a lock so that a changeset can apply a modification
//! that every holder of the handle observes.
//!
//! # Minting
//!
//! [`ingest`] is the only place ids are minted. Ids come from a process-wide
//! counter and are never reused.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Field map of a record.
pub type Record = serde_json::Map<String, Json>;

/// Counter for minting tuple ids. Starts at 1 so that 0 never shows up in logs
/// as a plausible id.
static NEXT_TUPLE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an ingested tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleId(u64);

impl TupleId {
    fn mint() -> Self {
        Self(NEXT_TUPLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

struct TupleCell {
    id: OnceLock<TupleId>,
    fields: RwLock<Record>,
}

/// A data record flowing through the graph.
#[derive(Clone)]
pub struct Tuple(Arc<TupleCell>);

impl Tuple {
    /// Wrap a record. The tuple has no identity until it is ingested.
    pub fn new(record: Record) -> Self {
        Self(Arc::new(TupleCell {
            id: OnceLock::new(),
            fields: RwLock::new(record),
        }))
    }

    /// The tuple's identity, or `None` if it was never ingested.
    pub fn id(&self) -> Option<TupleId> {
        self.0.id.get().copied()
    }

    /// Read a single field.
    pub fn get(&self, field: &str) -> Option<Json> {
        self.0.fields.read().get(field).cloned()
    }

    /// Read a numeric field.
    pub fn number(&self, field: &str) -> Option<f64> {
        self.0.fields.read().get(field).and_then(Json::as_f64)
    }

    /// Write a single field, returning whether the stored value changed.
    pub fn set(&self, field: &str, value: Json) -> bool {
        let mut fields = self.0.fields.write();
        if fields.get(field) == Some(&value) {
            return false;
        }
        fields.insert(field.to_string(), value);
        true
    }

    /// Borrow the whole record.
    pub fn fields(&self) -> RwLockReadGuard<'_, Record> {
        self.0.fields.read()
    }

    /// Snapshot the record.
    pub fn to_record(&self) -> Record {
        self.0.fields.read().clone()
    }

    /// Whether both handles point at the same tuple.
    pub fn same(&self, other: &Tuple) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Tuple {}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tuple")
            .field("id", &self.id())
            .field("fields", &*self.fields())
            .finish()
    }
}

impl From<Record> for Tuple {
    fn from(record: Record) -> Self {
        Self::new(record)
    }
}

impl From<Json> for Tuple {
    /// Objects become records as-is; anything else is wrapped as `{"data": value}`.
    fn from(value: Json) -> Self {
        match value {
            Json::Object(record) => Self::new(record),
            other => {
                let mut record = Record::new();
                record.insert("data".to_string(), other);
                Self::new(record)
            }
        }
    }
}

/// Assign an identity to `record` if it has none, and return the tuple.
///
/// Ingesting the same tuple handle twice returns the same identity both times.
pub fn ingest(record: impl Into<Tuple>) -> Tuple {
    let tuple = record.into();
    tuple.0.id.get_or_init(TupleId::mint);
    tuple
}

/// The identity of `tuple`, or `None` when unset.
pub fn tupleid(tuple: &Tuple) -> Option<TupleId> {
    tuple.id()
}

/// Copy `tuple`'s fields into a fresh, ingested tuple with a new identity.
pub fn derive(tuple: &Tuple) -> Tuple {
    ingest(tuple.to_record())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Json) -> Record {
        match value {
            Json::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn new_tuple_has_no_identity() {
        let t = Tuple::new(record(json!({"a": 1})));
        assert_eq!(tupleid(&t), None);
    }

    #[test]
    fn ingest_assigns_distinct_ids() {
        let a = ingest(record(json!({"a": 1})));
        let b = ingest(record(json!({"a": 1})));
        assert!(a.id().is_some());
        assert!(b.id().is_some());
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
    }

    #[test]
    fn ingest_is_stable_for_the_same_handle() {
        let a = ingest(record(json!({"a": 1})));
        let first = a.id();
        let again = ingest(a.clone());
        assert_eq!(again.id(), first);
        assert!(again.same(&a));
    }

    #[test]
    fn scalars_are_wrapped() {
        let t = ingest(json!(5));
        assert_eq!(t.get("data"), Some(json!(5)));
    }

    #[test]
    fn set_reports_change() {
        let t = ingest(json!({"x": 1}));
        assert!(!t.set("x", json!(1)));
        assert!(t.set("x", json!(2)));
        assert_eq!(t.number("x"), Some(2.0));
    }

    #[test]
    fn mutation_is_visible_through_every_handle() {
        let t = ingest(json!({"x": 1}));
        let alias = t.clone();
        t.set("x", json!(9));
        assert_eq!(alias.get("x"), Some(json!(9)));
        assert_eq!(alias.id(), t.id());
    }

    #[test]
    fn derive_copies_fields_under_new_identity() {
        let t = ingest(json!({"x": 1}));
        let d = derive(&t);
        assert_ne!(d.id(), t.id());
        assert_eq!(d.get("x"), Some(json!(1)));
        d.set("x", json!(2));
        assert_eq!(t.get("x"), Some(json!(1)));
    }
}
