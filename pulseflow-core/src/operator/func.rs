//! Closure-backed Operators
//!
//! Most operators in tests and small integrations are a single function.
//! [`FnOperator`] wraps one, with helpers for the three common shapes:
//!
//! - [`value`]: compute a value from parameters.
//! - [`transform`]: derive an output pulse from the input pulse.
//! - [`deferred`]: return a future that resolves to an [`Output`].

use std::future::Future;
use std::time::Duration;

use super::{Definition, Evaluation, Operator, Output, ParamDef, Parameters};
use crate::data::Value;
use crate::error::EvalError;
use crate::pulse::Pulse;

type Update = Box<dyn FnMut(&Parameters, &Pulse) -> Evaluation + Send>;

/// An operator whose evaluate step is a closure.
pub struct FnOperator {
    definition: Definition,
    update: Update,
}

impl FnOperator {
    pub fn new<F>(definition: Definition, update: F) -> Self
    where
        F: FnMut(&Parameters, &Pulse) -> Evaluation + Send + 'static,
    {
        Self {
            definition,
            update: Box::new(update),
        }
    }

    /// Declare a parameter. Without any, every parameter name is accepted.
    pub fn param(mut self, param: ParamDef) -> Self {
        self.definition = self.definition.with_param(param);
        self
    }
}

impl Operator for FnOperator {
    fn definition(&self) -> &Definition {
        &self.definition
    }

    fn evaluate(&mut self, params: &Parameters, pulse: &Pulse) -> Evaluation {
        (self.update)(params, pulse)
    }
}

impl std::fmt::Debug for FnOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnOperator")
            .field("kind", &self.definition.kind())
            .finish()
    }
}

/// A value operator.
pub fn value<F>(kind: &str, mut compute: F) -> FnOperator
where
    F: FnMut(&Parameters) -> Result<Value, EvalError> + Send + 'static,
{
    FnOperator::new(Definition::operator(kind), move |params, _| {
        compute(params).map(|v| Output::value(v)).into()
    })
}

/// A transform.
pub fn transform<F>(kind: &str, mut apply: F) -> FnOperator
where
    F: FnMut(&Parameters, &Pulse) -> Result<Output, EvalError> + Send + 'static,
{
    FnOperator::new(Definition::transform(kind), move |params, pulse| {
        apply(params, pulse).into()
    })
}

/// An operator that always resolves asynchronously.
///
/// The closure runs synchronously and must capture whatever it needs from
/// the parameters and pulse into the returned future.
pub fn deferred<F, Fut>(kind: &str, mut start: F) -> FnOperator
where
    F: FnMut(&Parameters, &Pulse) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Output, EvalError>> + Send + 'static,
{
    FnOperator::new(Definition::operator(kind), move |params, pulse| {
        Evaluation::deferred(start(params, pulse))
    })
}

/// Resolve to [`EvalError::Timeout`] if `future` takes longer than `limit`.
///
/// The engine has no notion of timeouts. A deferred operator that needs one
/// wraps its own future with this.
pub async fn with_timeout<F>(limit: Duration, future: F) -> Result<Output, EvalError>
where
    F: Future<Output = Result<Output, EvalError>>,
{
    tokio::time::timeout(limit, future)
        .await
        .unwrap_or(Err(EvalError::Timeout(limit)))
}
