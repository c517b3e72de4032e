//! Operators
//!
//! An operator is a computation node: it declares a parameter schema and an
//! evaluate step. The engine calls `evaluate` with the operator's resolved
//! parameters and the pulse for the current round, and decides from the
//! returned [`Output`] whether anything downstream has to run.
//!
//! # Operators and Transforms
//!
//! Every operator receives a pulse, but only transforms are pulse-aware:
//!
//! - A plain operator produces a value. If the value did not change, its
//!   dependents are not scheduled.
//! - A transform produces a pulse. Returning no pulse forwards the incoming
//!   one unchanged; returning [`Output::stop`] ends propagation.
//!
//! # Deferred Results
//!
//! An evaluate step may return [`Evaluation::Deferred`] with a future. The
//! scheduler keeps running everything that does not depend on the operator
//! and resumes the operator's subgraph once the future resolves.

mod params;
mod registry;

pub mod builtin;
pub mod func;

pub use params::{Param, ParamDef, ParamKind, Params, Parameters};
pub use registry::{Factory, Registry};

use std::fmt;
use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::data::Value;
use crate::error::EvalError;
use crate::pulse::Pulse;

/// Hints about the pulses an operator emits.
///
/// The engine itself does not act on these; collaborators such as a chart
/// parser use them to decide where tuples originate and what may be cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Introduces new tuple identities.
    pub generates: bool,
    /// Writes fields on existing tuples.
    pub modifies: bool,
    /// Adds or removes tuples without minting new ones.
    pub changes: bool,
    /// Materializes a tuple source.
    pub source: bool,
    /// Emits a hierarchy rather than a flat tuple set.
    pub treesource: bool,
}

/// Static description of an operator kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    kind: String,
    transform: bool,
    params: Vec<ParamDef>,
    metadata: Metadata,
}

impl Definition {
    /// A value-producing operator.
    pub fn operator(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            transform: false,
            params: Vec::new(),
            metadata: Metadata::default(),
        }
    }

    /// A pulse-producing transform.
    pub fn transform(kind: impl Into<String>) -> Self {
        Self {
            transform: true,
            ..Self::operator(kind)
        }
    }

    pub fn with_param(mut self, param: ParamDef) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_transform(&self) -> bool {
        self.transform
    }

    pub fn params(&self) -> &[ParamDef] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamDef> {
        self.params.iter().find(|p| p.name() == name)
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata
    }
}

/// What an evaluate step produced.
#[derive(Debug, Clone, Default)]
pub struct Output {
    value: Option<Value>,
    pulse: Option<Pulse>,
    stop: bool,
}

impl Output {
    /// Nothing new. A transform forwards its input pulse.
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// A new operator value.
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// A new output pulse.
    pub fn pulse(pulse: Pulse) -> Self {
        Self {
            pulse: Some(pulse),
            ..Self::default()
        }
    }

    /// Do not schedule dependents because of this evaluation.
    pub fn stop() -> Self {
        Self {
            stop: true,
            ..Self::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_pulse(mut self, pulse: Pulse) -> Self {
        self.pulse = Some(pulse);
        self
    }

    pub fn is_stop(&self) -> bool {
        self.stop
    }

    pub(crate) fn into_parts(self) -> (Option<Value>, Option<Pulse>, bool) {
        (self.value, self.pulse, self.stop)
    }
}

/// Result of calling [`Operator::evaluate`].
pub enum Evaluation {
    Ready(Result<Output, EvalError>),
    Deferred(BoxFuture<'static, Result<Output, EvalError>>),
}

impl Evaluation {
    pub fn ok(output: Output) -> Self {
        Self::Ready(Ok(output))
    }

    pub fn err(error: EvalError) -> Self {
        Self::Ready(Err(error))
    }

    /// Resolve later.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Output, EvalError>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

impl From<Result<Output, EvalError>> for Evaluation {
    fn from(result: Result<Output, EvalError>) -> Self {
        Self::Ready(result)
    }
}

impl fmt::Debug for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// The capability every operator kind implements.
pub trait Operator: Send {
    /// Schema and metadata. Must not change over the operator's lifetime.
    fn definition(&self) -> &Definition;

    /// Recompute from resolved parameters and the round's pulse.
    ///
    /// The pulse may be shared with other consumers; derive a new one with
    /// `fork` or `clone` to emit something different.
    fn evaluate(&mut self, params: &Parameters, pulse: &Pulse) -> Evaluation;
}
