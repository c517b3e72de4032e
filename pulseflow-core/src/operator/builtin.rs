//! Built-in Operators
//!
//! A handful of general-purpose operators that every graph ends up needing.
//! Each is a small state machine over the incoming pulse:
//!
//! - [`Collect`] keeps the current tuple set and publishes it as the source.
//! - [`Relay`] forwards its pulse unchanged.
//! - [`Count`] tracks the number of live tuples incrementally.
//! - [`FieldWatch`] counts rounds in which a named field was modified.
//! - [`Filter`] passes tuples matching a predicate, turning modifications
//!   into adds or removals as tuples cross the predicate boundary.

use std::collections::HashSet;
use std::sync::Arc;

use super::{Definition, Evaluation, Metadata, Operator, Output, ParamDef, Parameters, Registry};
use crate::data::{Tuple, TupleId};
use crate::pulse::{Flags, Pulse};

/// Register every built-in kind that can be created without arguments.
pub fn register_builtins(registry: &mut Registry) {
    // Kinds are distinct, so registration cannot collide on an empty registry.
    let results = [
        registry.register(Collect::new),
        registry.register(Relay::new),
        registry.register(Count::new),
        registry.register(FieldWatch::new),
    ];
    for result in results {
        if let Err(err) = result {
            tracing::warn!(error = %err, "skipped built-in operator kind");
        }
    }
}

fn ids(tuples: &[Tuple]) -> HashSet<TupleId> {
    tuples.iter().filter_map(Tuple::id).collect()
}

/// Materializes the stream into a tuple set.
///
/// The value is the current tuple list. The output pulse carries the input's
/// changes with the collected set as its source.
#[derive(Debug)]
pub struct Collect {
    definition: Definition,
    data: Vec<Tuple>,
    present: HashSet<TupleId>,
}

impl Collect {
    pub fn new() -> Self {
        Self {
            definition: Definition::transform("collect").with_metadata(Metadata {
                source: true,
                changes: true,
                ..Metadata::default()
            }),
            data: Vec::new(),
            present: HashSet::new(),
        }
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.data
    }
}

impl Default for Collect {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for Collect {
    fn definition(&self) -> &Definition {
        &self.definition
    }

    fn evaluate(&mut self, _params: &Parameters, pulse: &Pulse) -> Evaluation {
        let mut changed = false;

        if !pulse.rem().is_empty() {
            let removed = ids(pulse.rem());
            let before = self.data.len();
            self.data
                .retain(|t| t.id().map_or(true, |id| !removed.contains(&id)));
            self.present.retain(|id| !removed.contains(id));
            changed |= self.data.len() != before;
        }

        for tuple in pulse.add() {
            match tuple.id() {
                Some(id) if !self.present.insert(id) => {}
                _ => {
                    self.data.push(tuple.clone());
                    changed = true;
                }
            }
        }

        let mut out = pulse.fork(Flags::ALL);
        out.set_source(self.data.clone());
        let output = Output::pulse(out);
        Evaluation::ok(if changed {
            output.with_value(self.data.clone())
        } else {
            output
        })
    }
}

/// Forwards its input pulse.
///
/// Useful as a named junction: several operators can take their pulse from
/// one relay and be re-pointed together.
#[derive(Debug)]
pub struct Relay {
    definition: Definition,
}

impl Relay {
    pub fn new() -> Self {
        Self {
            definition: Definition::transform("relay"),
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for Relay {
    fn definition(&self) -> &Definition {
        &self.definition
    }

    fn evaluate(&mut self, _params: &Parameters, pulse: &Pulse) -> Evaluation {
        Evaluation::ok(Output::pulse(pulse.fork(Flags::ALL)))
    }
}

/// Number of live tuples, maintained from adds and removals.
#[derive(Debug)]
pub struct Count {
    definition: Definition,
    count: i64,
}

impl Count {
    pub fn new() -> Self {
        Self {
            definition: Definition::operator("count"),
            count: 0,
        }
    }
}

impl Default for Count {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for Count {
    fn definition(&self) -> &Definition {
        &self.definition
    }

    fn evaluate(&mut self, _params: &Parameters, pulse: &Pulse) -> Evaluation {
        // Net-zero pairs cancel arithmetically.
        self.count += pulse.add().len() as i64 - pulse.rem().len() as i64;
        Evaluation::ok(Output::value(self.count))
    }
}

/// Counts the rounds in which the watched field was modified.
///
/// Stays silent (no new value) in rounds that did not touch the field, so
/// dependents only run when the field really changed.
#[derive(Debug)]
pub struct FieldWatch {
    definition: Definition,
    hits: u64,
}

impl FieldWatch {
    pub fn new() -> Self {
        Self {
            definition: Definition::operator("field_watch")
                .with_param(ParamDef::new("field").literal().required()),
            hits: 0,
        }
    }
}

impl Default for FieldWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for FieldWatch {
    fn definition(&self) -> &Definition {
        &self.definition
    }

    fn evaluate(&mut self, params: &Parameters, pulse: &Pulse) -> Evaluation {
        let field = match params.text("field") {
            Ok(field) => field,
            Err(err) => return Evaluation::err(err),
        };
        if !pulse.modified(field) {
            return Evaluation::ok(Output::unchanged());
        }
        self.hits += 1;
        Evaluation::ok(Output::value(self.hits as f64))
    }
}

/// Passes tuples that satisfy a predicate.
///
/// Not registered by name: the predicate is a closure supplied at
/// construction.
pub struct Filter {
    definition: Definition,
    predicate: Arc<dyn Fn(&Tuple) -> bool + Send + Sync>,
    passing: HashSet<TupleId>,
}

impl Filter {
    pub fn new(predicate: impl Fn(&Tuple) -> bool + Send + Sync + 'static) -> Self {
        Self {
            definition: Definition::transform("filter").with_metadata(Metadata {
                changes: true,
                ..Metadata::default()
            }),
            predicate: Arc::new(predicate),
            passing: HashSet::new(),
        }
    }

    fn was_passing(&self, tuple: &Tuple) -> bool {
        tuple.id().is_some_and(|id| self.passing.contains(&id))
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("passing", &self.passing.len())
            .finish()
    }
}

impl Operator for Filter {
    fn definition(&self) -> &Definition {
        &self.definition
    }

    fn evaluate(&mut self, _params: &Parameters, pulse: &Pulse) -> Evaluation {
        let mut out = pulse.fork(Flags::NO_SOURCE);

        for tuple in pulse.rem() {
            if self.was_passing(tuple) {
                if let Some(id) = tuple.id() {
                    self.passing.remove(&id);
                }
                out.push_rem(tuple.clone());
            }
        }

        for tuple in pulse.add() {
            if (self.predicate)(tuple) {
                if let Some(id) = tuple.id() {
                    self.passing.insert(id);
                }
                out.push_add(tuple.clone());
            }
        }

        for tuple in pulse.mods() {
            let before = self.was_passing(tuple);
            let now = (self.predicate)(tuple);
            match (before, now) {
                (true, true) => {
                    out.push_mod(tuple.clone());
                }
                (true, false) => {
                    if let Some(id) = tuple.id() {
                        self.passing.remove(&id);
                    }
                    out.push_rem(tuple.clone());
                }
                (false, true) => {
                    if let Some(id) = tuple.id() {
                        self.passing.insert(id);
                    }
                    out.push_add(tuple.clone());
                }
                (false, false) => {}
            }
        }

        Evaluation::ok(Output::pulse(out))
    }
}
