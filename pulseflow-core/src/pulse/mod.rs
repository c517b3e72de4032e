//! Pulses
//!
//! A [`Pulse`] describes what changed during one propagation round: which
//! tuples were added, removed or modified, which fields were touched, and
//! (when known) the full set of tuples the change applies to.
//!
//! # Sharing
//!
//! One pulse is routinely consumed by several downstream operators, so a
//! consumer only ever receives `&Pulse`. To emit something different it must
//! derive its own pulse with [`Pulse::fork`] or `clone()`. The tuple sequences
//! are reference counted: forking is cheap, and the first write to a derived
//! pulse copies only the sequence being written.
//!
//! # Visitation Order
//!
//! [`Pulse::visit`] walks removals first, then additions, modifications and
//! finally the source set. Index-like consumers rely on this to drop stale
//! entries before inserting new ones.

mod flags;

pub use flags::Flags;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::data::{Tuple, TupleId};

/// Logical clock value of a propagation round.
pub type Stamp = u64;

/// Set of fields a pulse reports as modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fields {
    Named(BTreeSet<String>),
    /// Every field may have changed.
    All,
}

impl Default for Fields {
    fn default() -> Self {
        Fields::Named(BTreeSet::new())
    }
}

impl Fields {
    pub fn is_empty(&self) -> bool {
        matches!(self, Fields::Named(names) if names.is_empty())
    }

    pub fn contains(&self, field: &str) -> bool {
        match self {
            Fields::All => true,
            Fields::Named(names) => names.contains(field),
        }
    }

    fn insert(&mut self, field: &str) {
        if let Fields::Named(names) = self {
            names.insert(field.to_string());
        }
    }
}

fn ids(tuples: &[Tuple]) -> HashSet<TupleId> {
    tuples.iter().filter_map(Tuple::id).collect()
}

fn contains(set: &HashSet<TupleId>, tuple: &Tuple) -> bool {
    tuple.id().is_some_and(|id| set.contains(&id))
}

/// A delta scoped to one propagation round.
#[derive(Clone)]
pub struct Pulse {
    stamp: Stamp,
    add: Arc<Vec<Tuple>>,
    rem: Arc<Vec<Tuple>>,
    mods: Arc<Vec<Tuple>>,
    fields: Fields,
    source: Option<Arc<Vec<Tuple>>>,
    /// `source` already reflects `add` and `rem`.
    materialized: bool,
    clean: bool,
}

impl Pulse {
    /// An empty pulse for round `stamp`.
    pub fn new(stamp: Stamp) -> Self {
        Self {
            stamp,
            add: Arc::default(),
            rem: Arc::default(),
            mods: Arc::default(),
            fields: Fields::default(),
            source: None,
            materialized: false,
            clean: false,
        }
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    pub(crate) fn set_stamp(&mut self, stamp: Stamp) {
        self.stamp = stamp;
    }

    pub fn add(&self) -> &[Tuple] {
        &self.add
    }

    pub fn rem(&self) -> &[Tuple] {
        &self.rem
    }

    pub fn mods(&self) -> &[Tuple] {
        &self.mods
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// The full tuple set this pulse applies to, when known.
    pub fn source(&self) -> Option<&[Tuple]> {
        self.source.as_deref().map(Vec::as_slice)
    }

    /// Whether [`source`](Self::source) already includes this pulse's adds and excludes its removals.
    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    /// Whether the producer asked downstream state to be garbage collected.
    pub fn wants_clean(&self) -> bool {
        self.clean
    }

    /// Whether any of the selected sequences is non-empty.
    pub fn changed(&self, flags: Flags) -> bool {
        (flags.contains(Flags::ADD) && !self.add.is_empty())
            || (flags.contains(Flags::REM) && !self.rem.is_empty())
            || (flags.contains(Flags::MOD) && !self.mods.is_empty())
    }

    /// A pulse with no adds, removals, modifications or touched fields.
    pub fn is_noop(&self) -> bool {
        !self.changed(Flags::ALL) && self.fields.is_empty()
    }

    /// Whether `field` was reported as modified.
    pub fn modified(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    /// Whether any of `fields` was reported as modified.
    pub fn modified_any<S: AsRef<str>>(&self, fields: &[S]) -> bool {
        fields.iter().any(|f| self.fields.contains(f.as_ref()))
    }

    // ------------------------------------------------------------------
    // Derivation
    // ------------------------------------------------------------------

    /// Derive a pulse with the same stamp, carrying over only what `flags` selects.
    ///
    /// `ADD`, `REM` and `MOD` select the tuple sequences. The source reference
    /// and the modified-field set are carried unless `NO_SOURCE` or
    /// `NO_FIELDS` is given.
    pub fn fork(&self, flags: Flags) -> Pulse {
        let pick = |flag: Flags, seq: &Arc<Vec<Tuple>>| {
            if flags.contains(flag) {
                Arc::clone(seq)
            } else {
                Arc::default()
            }
        };
        let keep_source = !flags.contains(Flags::NO_SOURCE);
        Pulse {
            stamp: self.stamp,
            add: pick(Flags::ADD, &self.add),
            rem: pick(Flags::REM, &self.rem),
            mods: pick(Flags::MOD, &self.mods),
            fields: if flags.contains(Flags::NO_FIELDS) {
                Fields::default()
            } else {
                self.fields.clone()
            },
            source: if keep_source { self.source.clone() } else { None },
            materialized: keep_source && self.materialized,
            clean: self.clean,
        }
    }

    /// The tuple set left once this pulse's adds and removals are applied,
    /// with no change sequences or modified fields attached.
    pub fn source_only(&self) -> Pulse {
        let settled = if self.changed(Flags::ADD_REM) {
            self.materialize(Flags::ADD_REM)
        } else {
            self.clone()
        };
        settled.fork(Flags::NO_FIELDS)
    }

    /// Bring the source set up to date with the selected adds (`ADD`) and
    /// removals (`REM`).
    ///
    /// A pulse without a source is materialized from an empty set.
    pub fn materialize(&self, flags: Flags) -> Pulse {
        let mut out = self.clone();
        if self.materialized || !flags.intersects(Flags::ADD_REM) {
            return out;
        }

        let removed = if flags.contains(Flags::REM) {
            ids(&self.rem)
        } else {
            HashSet::new()
        };
        let mut tuples: Vec<Tuple> = self
            .source()
            .unwrap_or_default()
            .iter()
            .filter(|t| !contains(&removed, t))
            .cloned()
            .collect();

        if flags.contains(Flags::ADD) {
            let mut present = ids(&tuples);
            for t in self.add.iter() {
                if contains(&removed, t) {
                    continue;
                }
                match t.id() {
                    Some(id) if !present.insert(id) => {}
                    _ => tuples.push(t.clone()),
                }
            }
        }

        out.source = Some(Arc::new(tuples));
        out.materialized = flags.contains(Flags::ADD_REM);
        out
    }

    /// Re-emit every source tuple that is not added or removed as a modification.
    pub fn reflow(&self) -> Pulse {
        let mut out = self.fork(Flags::ALL);
        let Some(source) = self.source() else {
            return out;
        };
        let mut skip = ids(&self.add);
        skip.extend(ids(&self.rem));
        skip.extend(ids(&self.mods));
        let extra: Vec<Tuple> = source
            .iter()
            .filter(|t| !contains(&skip, t))
            .cloned()
            .collect();
        Arc::make_mut(&mut out.mods).extend(extra);
        out
    }

    /// Keep only the tuples in the selected sequences that satisfy `predicate`.
    pub fn filter(&self, flags: Flags, mut predicate: impl FnMut(&Tuple) -> bool) -> Pulse {
        let mut out = self.clone();
        let mut keep = |seq: &mut Arc<Vec<Tuple>>| {
            let kept: Vec<Tuple> = seq.iter().filter(|t| predicate(*t)).cloned().collect();
            *seq = Arc::new(kept);
        };
        if flags.contains(Flags::ADD) {
            keep(&mut out.add);
        }
        if flags.contains(Flags::REM) {
            keep(&mut out.rem);
        }
        if flags.contains(Flags::MOD) {
            keep(&mut out.mods);
        }
        out
    }

    /// Treat the whole materialized source as newly added.
    ///
    /// Used by consumers that must rebuild their state from scratch.
    pub fn add_all(&self) -> Pulse {
        let materialized = self.materialize(Flags::ADD_REM);
        let mut out = materialized.fork(Flags::NONE);
        out.add = materialized.source.clone().unwrap_or_default();
        out
    }

    // ------------------------------------------------------------------
    // Visitation
    // ------------------------------------------------------------------

    /// Apply `visitor` to the selected tuples.
    ///
    /// Order is fixed: `REM`, `ADD`, `MOD`, then `REFLOW` (untouched source
    /// tuples), then `SOURCE`. When both `ADD` and `REM` are selected, a tuple
    /// present in both is skipped in both, so a net-zero change is never
    /// observed.
    pub fn visit(&self, flags: Flags, mut visitor: impl FnMut(&Tuple)) -> &Self {
        let cancelled: HashSet<TupleId> = if flags.contains(Flags::ADD_REM)
            && !self.add.is_empty()
            && !self.rem.is_empty()
        {
            let added = ids(&self.add);
            ids(&self.rem)
                .into_iter()
                .filter(|id| added.contains(id))
                .collect()
        } else {
            HashSet::new()
        };

        if flags.contains(Flags::REM) {
            self.rem
                .iter()
                .filter(|t| !contains(&cancelled, t))
                .for_each(&mut visitor);
        }
        if flags.contains(Flags::ADD) {
            self.add
                .iter()
                .filter(|t| !contains(&cancelled, t))
                .for_each(&mut visitor);
        }
        if flags.contains(Flags::MOD) {
            self.mods.iter().for_each(&mut visitor);
        }
        if flags.contains(Flags::REFLOW) {
            if let Some(source) = self.source() {
                let mut skip = ids(&self.add);
                skip.extend(ids(&self.rem));
                skip.extend(ids(&self.mods));
                source
                    .iter()
                    .filter(|t| !contains(&skip, t))
                    .for_each(&mut visitor);
            }
        }
        if flags.contains(Flags::SOURCE) {
            if let Some(source) = self.source() {
                source.iter().for_each(&mut visitor);
            }
        }
        self
    }

    // ------------------------------------------------------------------
    // Building (owned pulses only)
    // ------------------------------------------------------------------

    pub fn push_add(&mut self, tuple: Tuple) -> &mut Self {
        Arc::make_mut(&mut self.add).push(tuple);
        self.materialized = false;
        self
    }

    pub fn push_rem(&mut self, tuple: Tuple) -> &mut Self {
        Arc::make_mut(&mut self.rem).push(tuple);
        self.materialized = false;
        self
    }

    pub fn push_mod(&mut self, tuple: Tuple) -> &mut Self {
        Arc::make_mut(&mut self.mods).push(tuple);
        self
    }

    pub fn extend_add(&mut self, tuples: impl IntoIterator<Item = Tuple>) -> &mut Self {
        Arc::make_mut(&mut self.add).extend(tuples);
        self.materialized = false;
        self
    }

    pub fn extend_rem(&mut self, tuples: impl IntoIterator<Item = Tuple>) -> &mut Self {
        Arc::make_mut(&mut self.rem).extend(tuples);
        self.materialized = false;
        self
    }

    pub fn extend_mod(&mut self, tuples: impl IntoIterator<Item = Tuple>) -> &mut Self {
        Arc::make_mut(&mut self.mods).extend(tuples);
        self
    }

    /// Record that `field` changed.
    pub fn modifies(&mut self, field: &str) -> &mut Self {
        self.fields.insert(field);
        self
    }

    /// Record that any field may have changed.
    pub fn modifies_all(&mut self) -> &mut Self {
        self.fields = Fields::All;
        self
    }

    /// Set the source to an up-to-date tuple set.
    pub fn set_source(&mut self, tuples: Vec<Tuple>) -> &mut Self {
        self.source = Some(Arc::new(tuples));
        self.materialized = true;
        self
    }

    /// Set the source to the tuple set the changes apply to.
    pub(crate) fn set_prior_source(&mut self, tuples: Vec<Tuple>) {
        self.source = Some(Arc::new(tuples));
        self.materialized = false;
    }

    /// Ask downstream consumers to drop state for removed tuples.
    pub fn set_clean(&mut self, clean: bool) -> &mut Self {
        self.clean = clean;
        self
    }
}

impl fmt::Debug for Pulse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pulse")
            .field("stamp", &self.stamp)
            .field("add", &self.add.len())
            .field("rem", &self.rem.len())
            .field("mod", &self.mods.len())
            .field("fields", &self.fields)
            .field("source", &self.source.as_ref().map(|s| s.len()))
            .field("materialized", &self.materialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ingest;
    use serde_json::json;

    fn tuples(n: usize) -> Vec<Tuple> {
        (0..n).map(|i| ingest(json!({ "i": i }))).collect()
    }

    fn id(t: &Tuple) -> TupleId {
        t.id().unwrap()
    }

    #[test]
    fn new_pulse_is_noop() {
        let p = Pulse::new(1);
        assert!(p.is_noop());
        assert!(!p.changed(Flags::ALL));
    }

    #[test]
    fn fields_alone_are_not_noop() {
        let mut p = Pulse::new(1);
        p.modifies("x");
        assert!(!p.is_noop());
        assert!(p.modified("x"));
        assert!(!p.modified("y"));
        assert!(p.modified_any(&["y", "x"]));
    }

    #[test]
    fn fork_selects_sequences() {
        let t = tuples(3);
        let mut p = Pulse::new(4);
        p.push_add(t[0].clone()).push_rem(t[1].clone()).push_mod(t[2].clone());
        p.modifies("i");
        p.set_source(t.clone());

        let adds = p.fork(Flags::ADD);
        assert_eq!(adds.stamp(), 4);
        assert_eq!(adds.add().len(), 1);
        assert!(adds.rem().is_empty());
        assert!(adds.mods().is_empty());
        assert!(adds.modified("i"));
        assert_eq!(adds.source().map(<[Tuple]>::len), Some(3));

        let bare = p.fork(Flags::MOD | Flags::NO_SOURCE | Flags::NO_FIELDS);
        assert_eq!(bare.mods().len(), 1);
        assert!(bare.source().is_none());
        assert!(bare.fields().is_empty());
    }

    #[test]
    fn clone_writes_do_not_leak_into_original() {
        let t = tuples(2);
        let mut original = Pulse::new(1);
        original.push_add(t[0].clone());

        let mut copy = original.clone();
        copy.push_add(t[1].clone());

        assert_eq!(original.add().len(), 1);
        assert_eq!(copy.add().len(), 2);
    }

    #[test]
    fn materialize_applies_adds_and_removals() {
        let t = tuples(4);
        let mut p = Pulse::new(1);
        p.set_prior_source(vec![t[0].clone(), t[1].clone()]);
        p.push_rem(t[0].clone()).push_add(t[2].clone()).push_add(t[3].clone());

        let m = p.materialize(Flags::ADD_REM);
        let got: Vec<TupleId> = m.source().unwrap().iter().map(id).collect();
        assert_eq!(got, vec![id(&t[1]), id(&t[2]), id(&t[3])]);
        assert!(m.is_materialized());
        // The original is untouched.
        assert_eq!(p.source().unwrap().len(), 2);
        // Materializing twice is stable.
        assert_eq!(m.materialize(Flags::ADD_REM).source().unwrap().len(), 3);
    }

    #[test]
    fn source_only_keeps_the_resulting_set() {
        let t = tuples(3);
        let mut p = Pulse::new(1);
        p.set_prior_source(vec![t[0].clone(), t[1].clone()]);
        p.push_rem(t[0].clone()).push_add(t[2].clone()).push_mod(t[1].clone());
        p.modifies("v");

        let rest = p.source_only();
        assert!(rest.is_noop());
        assert!(!rest.modified("v"));
        assert!(rest.is_materialized());
        let got: Vec<TupleId> = rest.source().unwrap().iter().map(id).collect();
        assert_eq!(got, vec![id(&t[1]), id(&t[2])]);
    }

    #[test]
    fn materialize_without_source_starts_empty() {
        let t = tuples(2);
        let mut p = Pulse::new(1);
        p.extend_add(t.clone());
        let m = p.materialize(Flags::ALL);
        assert_eq!(m.source().unwrap().len(), 2);
    }

    #[test]
    fn visit_order_is_rem_add_mod_source() {
        let t = tuples(4);
        let mut p = Pulse::new(1);
        p.push_add(t[0].clone()).push_rem(t[1].clone()).push_mod(t[2].clone());
        p.set_source(vec![t[3].clone()]);

        let mut seen = Vec::new();
        p.visit(Flags::ALL | Flags::SOURCE, |t| seen.push(id(t)));
        assert_eq!(seen, vec![id(&t[1]), id(&t[0]), id(&t[2]), id(&t[3])]);
    }

    #[test]
    fn visit_all_hides_net_zero_tuples() {
        let t = tuples(2);
        let mut p = Pulse::new(1);
        p.push_add(t[0].clone()).push_add(t[1].clone()).push_rem(t[0].clone());

        let mut seen = Vec::new();
        p.visit(Flags::ALL, |t| seen.push(id(t)));
        assert_eq!(seen, vec![id(&t[1])]);

        // Selecting only removals still reports the raw sequence.
        let mut rem_only = Vec::new();
        p.visit(Flags::REM, |t| rem_only.push(id(t)));
        assert_eq!(rem_only, vec![id(&t[0])]);
    }

    #[test]
    fn reflow_covers_untouched_source() {
        let t = tuples(3);
        let mut p = Pulse::new(1);
        p.set_source(t.clone());
        p.push_mod(t[0].clone());

        let mut untouched = Vec::new();
        p.visit(Flags::REFLOW, |t| untouched.push(id(t)));
        assert_eq!(untouched, vec![id(&t[1]), id(&t[2])]);

        let r = p.reflow();
        assert_eq!(r.mods().len(), 3);
        assert_eq!(p.mods().len(), 1);
    }

    #[test]
    fn filter_applies_to_selected_sequences() {
        let t = tuples(4);
        let mut p = Pulse::new(1);
        p.extend_add(t.clone()).push_mod(t[1].clone());
        let even = p.filter(Flags::ADD, |t| t.number("i").unwrap_or(0.0) as i64 % 2 == 0);
        assert_eq!(even.add().len(), 2);
        assert_eq!(even.mods().len(), 1);
    }

    #[test]
    fn add_all_readds_materialized_source() {
        let t = tuples(3);
        let mut p = Pulse::new(2);
        p.set_prior_source(vec![t[0].clone(), t[1].clone()]);
        p.push_rem(t[1].clone()).push_add(t[2].clone());

        let all = p.add_all();
        let got: Vec<TupleId> = all.add().iter().map(id).collect();
        assert_eq!(got, vec![id(&t[0]), id(&t[2])]);
        assert!(all.rem().is_empty());
        assert_eq!(all.stamp(), 2);
    }
}
