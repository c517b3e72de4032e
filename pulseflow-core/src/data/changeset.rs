//! Changesets
//!
//! A [`Changeset`] collects insert, remove and modify declarations between
//! rounds. When the round that consumes it reaches the target operator, the
//! changeset is resolved against that operator's current tuples and turned
//! into exactly one [`Pulse`].
//!
//! # Resolution Rules
//!
//! - Inserted records are ingested when they are declared, so the caller can
//!   hold on to their identities.
//! - A tuple that is both removed and inserted in the same changeset produces
//!   neither an add nor a removal. Inserting a tuple that is already present
//!   is ignored.
//! - Removals only apply to tuples that are currently present.
//! - Modifications only apply to tuples that are present and not removed.
//!   Each modified tuple is reported once, however many fields changed, and
//!   an assignment that leaves the stored value as it was reports nothing.
//! - Inserting the same tuple twice yields one add.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use super::tuple::{ingest, Tuple, TupleId};
use crate::pulse::Pulse;

/// Selects tuples by content.
pub type Predicate = Arc<dyn Fn(&Tuple) -> bool + Send + Sync>;

/// Computes a new field value from a tuple.
pub type Compute = Arc<dyn Fn(&Tuple) -> Json + Send + Sync>;

#[derive(Clone)]
enum Selection {
    Tuples(Vec<Tuple>),
    Matching(Predicate),
}

#[derive(Clone)]
enum Assignment {
    Constant(Json),
    Computed(Compute),
}

impl Assignment {
    /// Returns whether the stored value changed.
    fn apply(&self, tuple: &Tuple, field: &str) -> bool {
        let value = match self {
            Assignment::Constant(v) => v.clone(),
            Assignment::Computed(f) => f(tuple),
        };
        tuple.set(field, value)
    }
}

#[derive(Clone)]
struct Modification {
    selection: Selection,
    field: String,
    assignment: Assignment,
}

/// A batch of external changes for one operator.
#[derive(Clone, Default)]
pub struct Changeset {
    add: Vec<Tuple>,
    rem: Vec<Tuple>,
    rem_where: Vec<Predicate>,
    modifications: Vec<Modification>,
    reflow: bool,
    clean: Option<bool>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert records. Each is ingested immediately.
    pub fn insert<T: Into<Tuple>>(mut self, records: impl IntoIterator<Item = T>) -> Self {
        self.add.extend(records.into_iter().map(|r| ingest(r)));
        self
    }

    /// Insert records, returning the ingested tuples alongside the changeset.
    pub fn insert_tracked<T: Into<Tuple>>(
        self,
        records: impl IntoIterator<Item = T>,
    ) -> (Self, Vec<Tuple>) {
        let tuples: Vec<Tuple> = records.into_iter().map(|r| ingest(r)).collect();
        let this = self.insert(tuples.iter().cloned());
        (this, tuples)
    }

    /// Remove specific tuples.
    pub fn remove(mut self, tuples: impl IntoIterator<Item = Tuple>) -> Self {
        self.rem.extend(tuples);
        self
    }

    /// Remove every current tuple matching `predicate`.
    pub fn remove_where(mut self, predicate: impl Fn(&Tuple) -> bool + Send + Sync + 'static) -> Self {
        self.rem_where.push(Arc::new(predicate));
        self
    }

    /// Set `field` to `value` on specific tuples.
    pub fn modify(
        mut self,
        tuples: impl IntoIterator<Item = Tuple>,
        field: &str,
        value: impl Into<Json>,
    ) -> Self {
        self.modifications.push(Modification {
            selection: Selection::Tuples(tuples.into_iter().collect()),
            field: field.to_string(),
            assignment: Assignment::Constant(value.into()),
        });
        self
    }

    /// Set `field` on specific tuples to a value computed from each tuple.
    pub fn modify_with(
        mut self,
        tuples: impl IntoIterator<Item = Tuple>,
        field: &str,
        compute: impl Fn(&Tuple) -> Json + Send + Sync + 'static,
    ) -> Self {
        self.modifications.push(Modification {
            selection: Selection::Tuples(tuples.into_iter().collect()),
            field: field.to_string(),
            assignment: Assignment::Computed(Arc::new(compute)),
        });
        self
    }

    /// Set `field` to `value` on every current tuple matching `predicate`.
    pub fn modify_where(
        mut self,
        predicate: impl Fn(&Tuple) -> bool + Send + Sync + 'static,
        field: &str,
        value: impl Into<Json>,
    ) -> Self {
        self.modifications.push(Modification {
            selection: Selection::Matching(Arc::new(predicate)),
            field: field.to_string(),
            assignment: Assignment::Constant(value.into()),
        });
        self
    }

    /// Report every surviving tuple as modified.
    pub fn reflow(mut self) -> Self {
        self.reflow = true;
        self
    }

    /// Override whether the resulting pulse requests garbage collection.
    ///
    /// By default it does exactly when something is removed.
    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = Some(clean);
        self
    }

    /// Append `other`'s declarations after this changeset's.
    pub fn merge(&mut self, other: Changeset) {
        self.add.extend(other.add);
        self.rem.extend(other.rem);
        self.rem_where.extend(other.rem_where);
        self.modifications.extend(other.modifications);
        self.reflow |= other.reflow;
        if other.clean.is_some() {
            self.clean = other.clean;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.rem.is_empty()
            && self.rem_where.is_empty()
            && self.modifications.is_empty()
            && !self.reflow
    }

    /// Resolve against `current` and write the result into `pulse`.
    ///
    /// `pulse` is expected to be fresh; its source is set to `current`.
    pub fn apply(self, mut pulse: Pulse, current: &[Tuple]) -> Pulse {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Status {
            Present,
            Removed,
            /// Inserted by this changeset.
            Added,
            /// Inserted and removed by this changeset without ever being present.
            Cancelled,
        }

        let mut status: HashMap<TupleId, Status> = current
            .iter()
            .filter_map(Tuple::id)
            .map(|id| (id, Status::Present))
            .collect();

        for t in &self.rem {
            if let Some(id) = t.id() {
                status.insert(id, Status::Removed);
            }
        }
        for predicate in &self.rem_where {
            for t in current {
                if let Some(id) = t.id() {
                    if predicate(t) {
                        status.insert(id, Status::Removed);
                    }
                }
            }
        }

        let existing: HashSet<TupleId> = current.iter().filter_map(Tuple::id).collect();
        for t in self.add {
            let t = ingest(t);
            let Some(id) = t.id() else { continue };
            match status.get(&id).copied() {
                // Removed and re-inserted: no event either way.
                Some(Status::Removed) if existing.contains(&id) => {
                    status.insert(id, Status::Present);
                }
                Some(Status::Removed) => {
                    status.insert(id, Status::Cancelled);
                }
                // Already present, already added, or cancelled.
                Some(_) => {}
                None => {
                    status.insert(id, Status::Added);
                    pulse.push_add(t);
                }
            }
        }

        let alive = |t: &Tuple, status: &HashMap<TupleId, Status>| {
            t.id().and_then(|id| status.get(&id)) == Some(&Status::Present)
        };

        let removed: Vec<Tuple> = current
            .iter()
            .filter(|t| t.id().and_then(|id| status.get(&id)) == Some(&Status::Removed))
            .cloned()
            .collect();
        let any_removed = !removed.is_empty() || !self.rem.is_empty() || !self.rem_where.is_empty();
        pulse.extend_rem(removed);

        let record = |touched: &mut IndexMap<TupleId, Tuple>,
                      pulse: &mut Pulse,
                      t: &Tuple,
                      field: &str| {
            if let Some(id) = t.id() {
                touched.entry(id).or_insert_with(|| t.clone());
            }
            pulse.modifies(field);
        };
        let mut touched: IndexMap<TupleId, Tuple> = IndexMap::new();
        for m in &self.modifications {
            match &m.selection {
                Selection::Tuples(tuples) => {
                    for t in tuples.iter().filter(|t| alive(*t, &status)) {
                        if m.assignment.apply(t, &m.field) {
                            record(&mut touched, &mut pulse, t, &m.field);
                        }
                    }
                }
                Selection::Matching(predicate) => {
                    for t in current.iter().filter(|t| alive(*t, &status) && predicate(*t)) {
                        if m.assignment.apply(t, &m.field) {
                            record(&mut touched, &mut pulse, t, &m.field);
                        }
                    }
                }
            }
        }

        if self.reflow {
            pulse.extend_mod(current.iter().filter(|t| alive(*t, &status)).cloned());
            pulse.modifies_all();
        } else {
            pulse.extend_mod(touched.into_values());
        }

        pulse.set_clean(self.clean.unwrap_or(any_removed));
        pulse.set_prior_source(current.to_vec());
        pulse
    }
}

impl fmt::Debug for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changeset")
            .field("insert", &self.add.len())
            .field("remove", &self.rem.len())
            .field("remove_where", &self.rem_where.len())
            .field("modify", &self.modifications.len())
            .field("reflow", &self.reflow)
            .finish()
    }
}
