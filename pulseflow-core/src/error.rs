//! Error Types
//!
//! The engine distinguishes three failure families:
//!
//! - [`ConfigError`]: the graph was wired incorrectly. Raised synchronously by
//!   the call that added the offending operator or edge.
//! - [`EvalError`]: an operator's recompute step failed. Contained to the
//!   subgraph below that operator and reported as an [`EvalFailure`].
//! - [`DataflowError`]: what a run hands back to the caller that requested it.

use std::time::Duration;

use thiserror::Error;

use crate::graph::{OpId, Rank};
use crate::pulse::Stamp;

/// Graph construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Adding an edge would make an operator reachable from itself.
    #[error("cycle detected: edge {from} -> {to} closes a loop through {through}")]
    Cycle { from: OpId, to: OpId, through: OpId },

    /// A required parameter was not supplied and has no default.
    #[error("operator `{kind}` is missing required parameter `{name}`")]
    MissingParameter { kind: String, name: String },

    /// A parameter name that the operator's schema does not declare.
    #[error("operator `{kind}` has no parameter named `{name}`")]
    UnknownParameter { kind: String, name: String },

    /// A parameter was supplied in the wrong shape (literal vs operator, scalar vs array).
    #[error("parameter `{name}` of operator `{kind}`: {reason}")]
    ParameterKind {
        kind: String,
        name: String,
        reason: String,
    },

    /// An operator id that is not (or no longer) part of the graph.
    #[error("unknown operator {0}")]
    UnknownOperator(OpId),

    /// No operator kind registered under this name.
    #[error("unknown operator kind `{0}`")]
    UnknownKind(String),

    /// An operator kind was registered twice.
    #[error("operator kind `{0}` is already registered")]
    DuplicateKind(String),

    /// The configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure returned by an operator's recompute step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("{0}")]
    Failed(String),

    #[error("parameter `{name}`: {reason}")]
    Parameter { name: String, reason: String },

    #[error("deferred evaluation timed out after {0:?}")]
    Timeout(Duration),

    #[error("deferred evaluation was cancelled")]
    Cancelled,
}

impl EvalError {
    /// Shorthand for [`EvalError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub(crate) fn parameter(name: &str, reason: impl Into<String>) -> Self {
        Self::Parameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Structured context for one failed evaluation.
///
/// This is what the error channel receives, both for synchronous failures and
/// for deferred results that resolve to an error after `run` has returned.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("operator {op} (`{kind}`, rank {rank}) failed in round {stamp}: {error}")]
pub struct EvalFailure {
    pub op: OpId,
    pub kind: String,
    pub rank: Rank,
    pub stamp: Stamp,
    #[source]
    pub error: EvalError,
}

/// Errors surfaced by a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataflowError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The round completed, but at least one operator failed.
    #[error("round {stamp} completed with {} failed operator(s)", failures.len())]
    RoundFailed {
        stamp: Stamp,
        failures: Vec<EvalFailure>,
    },

    /// The round exceeded the configured evaluation budget and was closed early.
    #[error("round {stamp} exceeded {limit} evaluations")]
    EvaluationLimit { stamp: Stamp, limit: usize },
}

impl DataflowError {
    /// Failures recorded for the round, if this is a round failure.
    pub fn failures(&self) -> &[EvalFailure] {
        match self {
            Self::RoundFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}
