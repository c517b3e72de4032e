//! Data Model
//!
//! Records, their identities, operator values and changesets.

mod changeset;
mod tuple;
mod value;

pub use changeset::{Changeset, Compute, Predicate};
pub use tuple::{derive, ingest, tupleid, Record, Tuple, TupleId};
pub use value::Value;
