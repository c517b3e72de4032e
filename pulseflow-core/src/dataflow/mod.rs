//! Dataflow
//!
//! [`Dataflow`] owns an operator graph and drives propagation rounds over it.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──touch/update/pulse──▶ Pending ──run──▶ Running ──▶ Idle
//!                                                 │   ▲
//!                                     deferred    ▼   │ settled
//!                                             AwaitingAsync
//! ```
//!
//! External code never mutates operator state directly. It requests
//! changes through the dataflow (or a [`Requester`] handle) and asks for a
//! run. Each completed round advances the clock by exactly one; a run with
//! nothing dirty starts no round at all.
//!
//! # Example
//!
//! ```rust
//! use pulseflow_core::data::Value;
//! use pulseflow_core::dataflow::Dataflow;
//! use pulseflow_core::operator::{func, Params};
//!
//! let mut df = Dataflow::new();
//! let x = df.add_value(2.0);
//! let square = df
//!     .add(
//!         func::value("square", |p| Ok(Value::from(p.number("x")?.powi(2)))),
//!         Params::new().reference("x", x),
//!     )
//!     .unwrap();
//!
//! df.run().unwrap();
//! assert_eq!(df.value(square), Some(&Value::Number(4.0)));
//!
//! df.update(x, 3.0).unwrap();
//! df.run().unwrap();
//! assert_eq!(df.value(square), Some(&Value::Number(9.0)));
//! ```

mod scheduler;

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tokio::sync::mpsc;
use tracing::{debug, debug_span, warn};

use crate::config::DataflowConfig;
use crate::data::{Changeset, Value};
use crate::error::{ConfigError, DataflowError, EvalError, EvalFailure};
use crate::graph::{Node, OpId, OperatorGraph, Rank};
use crate::operator::{Operator, Output, Params, Registry};
use crate::pulse::Stamp;

use scheduler::{Hooks, Round};

/// Receives every evaluation failure, including those of deferred results
/// that settle after the call that started the round has returned.
pub type ErrorSink = Arc<dyn Fn(&EvalFailure) + Send + Sync>;

/// Coarse scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing dirty, no round open.
    Idle,
    /// Changes requested, no round open yet.
    Pending,
    /// A round is open with operators ready to evaluate.
    Running,
    /// A round is open and everything left waits on deferred results.
    AwaitingAsync,
}

/// Summary of a completed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundReport {
    /// Clock value after the round. Unchanged if no round ran.
    pub stamp: Stamp,
    /// Operator evaluations performed in the round.
    pub evaluated: usize,
}

/// Outcome of a synchronous [`Dataflow::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed(RoundReport),
    /// The round is still open, waiting on deferred results. Call `run`
    /// again or `run_async` to resume it.
    Suspended { stamp: Stamp, pending: Vec<OpId> },
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

pub(crate) enum Request {
    Touch(OpId),
    Update(OpId, Value),
    Pulse(OpId, Changeset),
}

/// Cloneable handle for requesting changes from other tasks.
///
/// Requests are applied the next time the dataflow looks at its inbox: at
/// the start of a run and between evaluations of an open round.
#[derive(Clone)]
pub struct Requester {
    tx: mpsc::UnboundedSender<Request>,
}

impl Requester {
    /// Returns `false` if the dataflow is gone.
    pub fn touch(&self, op: OpId) -> bool {
        self.tx.send(Request::Touch(op)).is_ok()
    }

    pub fn update(&self, op: OpId, value: impl Into<Value>) -> bool {
        self.tx.send(Request::Update(op, value.into())).is_ok()
    }

    pub fn pulse(&self, op: OpId, changeset: Changeset) -> bool {
        self.tx.send(Request::Pulse(op, changeset)).is_ok()
    }
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

enum Event {
    Settled(OpId, Result<Output, EvalError>),
    Request(Request),
    Closed,
}

/// An operator graph and the scheduler that drives it.
pub struct Dataflow {
    config: DataflowConfig,
    registry: Arc<Registry>,
    graph: OperatorGraph,
    clock: Stamp,
    dirty: IndexSet<OpId>,
    changesets: IndexMap<OpId, Changeset>,
    round: Option<Round>,
    on_error: Option<ErrorSink>,
    requests: mpsc::UnboundedSender<Request>,
    inbox: mpsc::UnboundedReceiver<Request>,
}

impl Dataflow {
    /// A dataflow with default settings and the built-in operator kinds.
    pub fn new() -> Self {
        Self::with_config(DataflowConfig::default())
    }

    pub fn with_config(config: DataflowConfig) -> Self {
        let (requests, inbox) = mpsc::unbounded_channel();
        Self {
            config,
            registry: Arc::new(Registry::with_builtins()),
            graph: OperatorGraph::new(),
            clock: 0,
            dirty: IndexSet::new(),
            changesets: IndexMap::new(),
            round: None,
            on_error: None,
            requests,
            inbox,
        }
    }

    /// Use `registry` to resolve kinds in [`Dataflow::add_kind`].
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &DataflowConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn graph(&self) -> &OperatorGraph {
        &self.graph
    }

    // ------------------------------------------------------------------
    // Graph construction
    // ------------------------------------------------------------------

    /// Register an operator. It is evaluated in the next round.
    pub fn add<O: Operator + 'static>(&mut self, op: O, params: Params) -> Result<OpId, ConfigError> {
        self.add_boxed(Box::new(op), params)
    }

    pub fn add_boxed(&mut self, op: Box<dyn Operator>, params: Params) -> Result<OpId, ConfigError> {
        let kind = op.definition().kind().to_string();
        let id = self
            .graph
            .insert(Node::new(kind.as_str(), Some(op), params, Value::Null))?;
        debug!(op = %id, kind = %kind, rank = %self.graph.rank(id).unwrap_or_default(), "added operator");
        self.mark(id);
        Ok(id)
    }

    /// Instantiate a registered kind.
    pub fn add_kind(&mut self, kind: &str, params: Params) -> Result<OpId, ConfigError> {
        let op = self.registry.create(kind)?;
        self.add_boxed(op, params)
    }

    /// Register a value-only operator. Set it later with [`Dataflow::update`].
    pub fn add_value(&mut self, value: impl Into<Value>) -> OpId {
        let id = self
            .graph
            .attach(Node::new("value", None, Params::new(), value.into()));
        debug!(op = %id, "added value operator");
        self.mark(id);
        id
    }

    /// Add an edge that is not implied by parameters.
    pub fn connect(&mut self, source: OpId, target: OpId) -> Result<(), ConfigError> {
        self.graph.connect(source, target)
    }

    pub fn disconnect(&mut self, source: OpId, target: OpId) -> bool {
        self.graph.disconnect(source, target)
    }

    /// Detach and drop an operator.
    ///
    /// Parameters of other operators that still refer to it resolve to
    /// `Null` from now on.
    pub fn remove(&mut self, op: OpId) -> Result<(), ConfigError> {
        self.graph
            .remove(op)
            .ok_or(ConfigError::UnknownOperator(op))?;
        self.dirty.shift_remove(&op);
        self.changesets.shift_remove(&op);
        if let Some(round) = self.round.as_mut() {
            round.forget(&self.graph, op);
        }
        debug!(op = %op, "removed operator");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Change requests
    // ------------------------------------------------------------------

    /// Mark an operator dirty.
    pub fn touch(&mut self, op: OpId) -> Result<(), ConfigError> {
        self.require(op)?;
        self.mark(op);
        Ok(())
    }

    /// Set an operator's value and touch it.
    ///
    /// Returns whether the value changed. Setting an equal value is a no-op.
    pub fn update(&mut self, op: OpId, value: impl Into<Value>) -> Result<bool, ConfigError> {
        let value = value.into();
        let node = self
            .graph
            .node_mut(op)
            .ok_or(ConfigError::UnknownOperator(op))?;
        if node.value == value {
            return Ok(false);
        }
        node.value = value;
        node.pending_value = true;
        self.mark(op);
        Ok(true)
    }

    /// Queue a changeset for `op`, applied when `op` is next evaluated.
    ///
    /// The changeset is applied against `op`'s current value when that value
    /// is a tuple list (as for a `collect` operator), otherwise against an
    /// empty set.
    pub fn pulse(&mut self, op: OpId, changeset: Changeset) -> Result<(), ConfigError> {
        self.require(op)?;
        match self.changesets.get_mut(&op) {
            Some(pending) => pending.merge(changeset),
            None => {
                self.changesets.insert(op, changeset);
            }
        }
        self.mark(op);
        Ok(())
    }

    /// An empty changeset builder.
    pub fn changeset(&self) -> Changeset {
        Changeset::new()
    }

    /// A handle other tasks can use to request changes.
    pub fn requester(&self) -> Requester {
        Requester {
            tx: self.requests.clone(),
        }
    }

    /// Register the error channel. Replaces any previous sink.
    pub fn on_error(&mut self, sink: impl Fn(&EvalFailure) + Send + Sync + 'static) {
        self.on_error = Some(Arc::new(sink));
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn value(&self, op: OpId) -> Option<&Value> {
        self.graph.node(op).map(Node::value)
    }

    /// Whether the operator changed in the most recent round.
    pub fn modified(&self, op: OpId) -> bool {
        self.graph
            .node(op)
            .is_some_and(|node| self.clock > 0 && node.modified_at == self.clock)
    }

    pub fn rank(&self, op: OpId) -> Option<Rank> {
        self.graph.rank(op)
    }

    /// Lifetime evaluation count.
    pub fn evaluations(&self, op: OpId) -> Option<u64> {
        self.graph.node(op).map(|node| node.evaluations)
    }

    /// Stamp of the last completed round.
    pub fn clock(&self) -> Stamp {
        self.clock
    }

    pub fn state(&self) -> RunState {
        match &self.round {
            Some(round) if round.has_work() => RunState::Running,
            Some(_) => RunState::AwaitingAsync,
            None if !self.dirty.is_empty() || !self.changesets.is_empty() => RunState::Pending,
            None => RunState::Idle,
        }
    }

    /// Whether every edge goes from a lower to a higher rank.
    pub fn check_ranks(&self) -> bool {
        self.graph.rank_violations().is_empty()
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Drive the current round as far as it can go without waiting.
    ///
    /// Deferred results that are already available are folded in. If the
    /// round still waits on others, it stays open and `Suspended` is
    /// returned; failures of those results reach the error channel when the
    /// round is resumed.
    pub fn run(&mut self) -> Result<RunStatus, DataflowError> {
        if self.round.is_none() {
            self.drain_inbox();
            if !self.begin() {
                return Ok(RunStatus::Completed(self.idle_report()));
            }
        }

        loop {
            self.drain_inbox();
            if self.step()? {
                continue;
            }
            let Some(round) = self.round.as_mut() else {
                return Ok(RunStatus::Completed(self.idle_report()));
            };
            if round.is_settled() {
                return self.finish().map(RunStatus::Completed);
            }
            match round.poll_settled() {
                Some((op, result)) => self.settle(op, result),
                None => {
                    let status = RunStatus::Suspended {
                        stamp: round.stamp(),
                        pending: round.pending_ops(),
                    };
                    round.span().in_scope(|| debug!("round suspended on deferred results"));
                    return Ok(status);
                }
            }
        }
    }

    /// Drive the current round to completion, awaiting deferred results.
    ///
    /// Requests sent through a [`Requester`] while waiting fold into the
    /// open round. Dropping the future leaves the round open for a later
    /// `run` or `run_async`.
    pub async fn run_async(&mut self) -> Result<RoundReport, DataflowError> {
        if self.round.is_none() {
            self.drain_inbox();
            if !self.begin() {
                return Ok(self.idle_report());
            }
        }

        loop {
            self.drain_inbox();
            if self.step()? {
                continue;
            }
            let Some(round) = self.round.as_mut() else {
                return Ok(self.idle_report());
            };
            if round.is_settled() {
                return self.finish();
            }

            let event = tokio::select! {
                Some((op, result)) = round.next_settled() => Event::Settled(op, result),
                Some(request) = self.inbox.recv() => Event::Request(request),
                else => Event::Closed,
            };
            match event {
                Event::Settled(op, result) => self.settle(op, result),
                Event::Request(request) => self.apply(request),
                Event::Closed => {}
            }
        }
    }

    fn idle_report(&self) -> RoundReport {
        RoundReport {
            stamp: self.clock,
            evaluated: 0,
        }
    }

    fn require(&self, op: OpId) -> Result<(), ConfigError> {
        if self.graph.contains(op) {
            Ok(())
        } else {
            Err(ConfigError::UnknownOperator(op))
        }
    }

    /// Schedule `op` in the open round, or for the next one.
    fn mark(&mut self, op: OpId) {
        match self.round.as_mut() {
            Some(round) => round.enqueue(&mut self.graph, op, true),
            None => {
                self.dirty.insert(op);
            }
        }
    }

    fn apply(&mut self, request: Request) {
        let result = match request {
            Request::Touch(op) => self.touch(op),
            Request::Update(op, value) => self.update(op, value).map(|_| ()),
            Request::Pulse(op, changeset) => self.pulse(op, changeset),
        };
        if let Err(err) = result {
            warn!(error = %err, "dropped change request");
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(request) = self.inbox.try_recv() {
            self.apply(request);
        }
    }

    /// Open a round if anything is dirty.
    fn begin(&mut self) -> bool {
        if self.dirty.is_empty() && self.changesets.is_empty() {
            return false;
        }
        let stamp = self.clock + 1;
        let span = debug_span!("round", dataflow = %self.config.name, stamp);
        let mut round = Round::new(stamp, span);

        let ids: Vec<OpId> = self
            .dirty
            .drain(..)
            .chain(self.changesets.keys().copied())
            .collect();
        for id in ids {
            round.enqueue(&mut self.graph, id, false);
        }
        round.span().in_scope(|| debug!("round started"));
        self.round = Some(round);
        true
    }

    fn step(&mut self) -> Result<bool, DataflowError> {
        let Some(round) = self.round.as_mut() else {
            return Ok(false);
        };
        let hooks = Hooks {
            config: &self.config,
            on_error: self.on_error.as_ref(),
        };
        let result = round.step(&mut self.graph, &mut self.changesets, &hooks);
        if result.is_err() {
            if let Some(round) = self.round.take() {
                self.clock = round.stamp();
                round.close(&mut self.graph);
            }
        }
        result
    }

    fn settle(&mut self, op: OpId, result: Result<Output, EvalError>) {
        if let Some(round) = self.round.as_mut() {
            let hooks = Hooks {
                config: &self.config,
                on_error: self.on_error.as_ref(),
            };
            round.settle(&mut self.graph, &hooks, op, result);
        }
    }

    fn finish(&mut self) -> Result<RoundReport, DataflowError> {
        let Some(round) = self.round.take() else {
            return Ok(self.idle_report());
        };
        self.clock = round.stamp();
        let (report, failures) = round.close(&mut self.graph);
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(DataflowError::RoundFailed {
                stamp: report.stamp,
                failures,
            })
        }
    }
}

impl Default for Dataflow {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dataflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataflow")
            .field("name", &self.config.name)
            .field("operators", &self.graph.len())
            .field("clock", &self.clock)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::func;

    #[test]
    fn run_with_nothing_dirty_is_a_no_op() {
        let mut df = Dataflow::new();
        let status = df.run().unwrap();
        assert_eq!(
            status,
            RunStatus::Completed(RoundReport {
                stamp: 0,
                evaluated: 0
            })
        );
        assert_eq!(df.clock(), 0);
        assert_eq!(df.state(), RunState::Idle);
    }

    #[test]
    fn state_reflects_pending_changes() {
        let mut df = Dataflow::new();
        df.add_value(1.0);
        assert_eq!(df.state(), RunState::Pending);
        df.run().unwrap();
        assert_eq!(df.state(), RunState::Idle);
        assert_eq!(df.clock(), 1);
    }

    #[test]
    fn update_with_equal_value_is_ignored() {
        let mut df = Dataflow::new();
        let x = df.add_value(1.0);
        df.run().unwrap();
        assert!(!df.update(x, 1.0).unwrap());
        assert_eq!(df.state(), RunState::Idle);
        assert!(df.update(x, 2.0).unwrap());
        assert_eq!(df.state(), RunState::Pending);
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let mut df = Dataflow::new();
        let ghost = OpId::from(42);
        assert_eq!(df.touch(ghost), Err(ConfigError::UnknownOperator(ghost)));
        assert_eq!(df.remove(ghost), Err(ConfigError::UnknownOperator(ghost)));
        assert!(df.pulse(ghost, Changeset::new()).is_err());
        assert!(matches!(
            df.add_kind("nope", Params::new()),
            Err(ConfigError::UnknownKind(_))
        ));
    }

    #[test]
    fn requests_fold_into_next_run() {
        let mut df = Dataflow::new();
        let x = df.add_value(1.0);
        let double = df
            .add(
                func::value("double", |p| Ok(Value::from(p.number("x")? * 2.0))),
                Params::new().reference("x", x),
            )
            .unwrap();
        df.run().unwrap();

        let requester = df.requester();
        assert!(requester.update(x, 5.0));
        df.run().unwrap();
        assert_eq!(df.value(double), Some(&Value::Number(10.0)));
    }

    #[test]
    fn evaluation_limit_closes_round() {
        let config = DataflowConfig {
            max_evaluations_per_round: 1,
            ..DataflowConfig::default()
        };
        let mut df = Dataflow::with_config(config);
        let a = df.add_value(1.0);
        df.add_value(2.0);
        let err = df.run().unwrap_err();
        assert_eq!(err, DataflowError::EvaluationLimit { stamp: 1, limit: 1 });
        assert_eq!(df.clock(), 1);
        assert_eq!(df.state(), RunState::Idle);

        // Nothing is stuck as queued.
        df.touch(a).unwrap();
        assert!(df.run().unwrap().is_completed());
    }
}
