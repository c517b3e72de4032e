//! Operator Parameters
//!
//! Parameters exist in two forms:
//!
//! - [`Params`] is what a caller supplies when registering an operator. Each
//!   entry is a literal, a reference to another operator, or an array of
//!   either. References become graph edges.
//! - [`Parameters`] is what the operator sees when it evaluates: every
//!   reference resolved to the referenced operator's current value, plus a
//!   flag per parameter saying whether that value changed in this round.
//!
//! [`ParamDef`] declares one entry of an operator's schema. Registration
//! validates supplied [`Params`] against the schema and fills in defaults.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::data::{Tuple, Value};
use crate::error::{ConfigError, EvalError};
use crate::graph::OpId;

/// Whether a parameter takes a literal, an operator reference, or either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Literal,
    Operator,
    Any,
}

/// Declaration of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    name: String,
    kind: ParamKind,
    required: bool,
    array: bool,
    default: Option<Value>,
}

impl ParamDef {
    /// An optional parameter accepting literals or references.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Any,
            required: false,
            array: false,
            default: None,
        }
    }

    /// Only accept literal values.
    pub fn literal(mut self) -> Self {
        self.kind = ParamKind::Literal;
        self
    }

    /// Only accept operator references.
    pub fn operator(mut self) -> Self {
        self.kind = ParamKind::Operator;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Expect an array of values.
    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    /// Value used when the parameter is not supplied.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_array(&self) -> bool {
        self.array
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }
}

/// One supplied parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Literal(Value),
    Ref(OpId),
    Array(Vec<Param>),
}

impl Param {
    fn has_ref(&self) -> bool {
        match self {
            Param::Literal(_) => false,
            Param::Ref(_) => true,
            Param::Array(items) => items.iter().any(Param::has_ref),
        }
    }

    fn has_literal(&self) -> bool {
        match self {
            Param::Literal(_) => true,
            Param::Ref(_) => false,
            Param::Array(items) => items.iter().any(Param::has_literal),
        }
    }

    fn collect_refs(&self, out: &mut Vec<OpId>) {
        match self {
            Param::Literal(_) => {}
            Param::Ref(id) => out.push(*id),
            Param::Array(items) => items.iter().for_each(|p| p.collect_refs(out)),
        }
    }
}

impl From<OpId> for Param {
    fn from(id: OpId) -> Self {
        Param::Ref(id)
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Param::Literal(value)
    }
}

/// Parameters supplied when registering an operator.
///
/// ```rust
/// use pulseflow_core::operator::Params;
/// # use pulseflow_core::graph::OpId;
/// # let upstream = OpId::from(0);
///
/// let params = Params::new()
///     .literal("field", "price")
///     .reference("threshold", upstream)
///     .pulse(upstream);
/// assert_eq!(params.pulse_source(), Some(upstream));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: IndexMap<String, Param>,
    pulse: Option<OpId>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, param: impl Into<Param>) -> Self {
        self.entries.insert(name.into(), param.into());
        self
    }

    pub fn literal(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, Param::Literal(value.into()))
    }

    pub fn reference(self, name: impl Into<String>, op: OpId) -> Self {
        self.set(name, Param::Ref(op))
    }

    pub fn array(self, name: impl Into<String>, items: Vec<Param>) -> Self {
        self.set(name, Param::Array(items))
    }

    /// Consume `op`'s output pulse.
    pub fn pulse(mut self, op: OpId) -> Self {
        self.pulse = Some(op);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.entries.get(name)
    }

    pub fn pulse_source(&self) -> Option<OpId> {
        self.pulse
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every operator this parameter set depends on, pulse source included.
    pub(crate) fn dependencies(&self) -> Vec<OpId> {
        let mut out = Vec::new();
        for param in self.entries.values() {
            param.collect_refs(&mut out);
        }
        out.extend(self.pulse);
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Check against `schema` and fill in defaults.
    ///
    /// An empty schema accepts any parameter names.
    pub(crate) fn validate(
        &mut self,
        kind: &str,
        schema: &[ParamDef],
        exists: impl Fn(OpId) -> bool,
    ) -> Result<(), ConfigError> {
        let mismatch = |name: &str, reason: &str| ConfigError::ParameterKind {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        };

        for id in self.dependencies() {
            if !exists(id) {
                return Err(ConfigError::UnknownOperator(id));
            }
        }

        if schema.is_empty() {
            return Ok(());
        }

        for name in self.entries.keys() {
            if !schema.iter().any(|def| def.name() == name) {
                return Err(ConfigError::UnknownParameter {
                    kind: kind.to_string(),
                    name: name.clone(),
                });
            }
        }

        for def in schema {
            match self.entries.get(def.name()) {
                Some(param) => {
                    match def.kind() {
                        ParamKind::Literal if param.has_ref() => {
                            return Err(mismatch(def.name(), "expected a literal, got an operator reference"));
                        }
                        ParamKind::Operator if param.has_literal() => {
                            return Err(mismatch(def.name(), "expected an operator reference, got a literal"));
                        }
                        _ => {}
                    }
                    let is_array = matches!(param, Param::Array(_));
                    if def.is_array() && !is_array {
                        return Err(mismatch(def.name(), "expected an array"));
                    }
                    if !def.is_array() && is_array {
                        return Err(mismatch(def.name(), "did not expect an array"));
                    }
                }
                None => match def.default() {
                    Some(value) => {
                        self.entries
                            .insert(def.name().to_string(), Param::Literal(value.clone()));
                    }
                    None if def.is_required() => {
                        return Err(ConfigError::MissingParameter {
                            kind: kind.to_string(),
                            name: def.name().to_string(),
                        });
                    }
                    None => {}
                },
            }
        }
        Ok(())
    }
}

/// Resolved parameter values handed to an operator's evaluate step.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    values: IndexMap<String, Value>,
    modified: HashSet<String>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unmodified value. Handy for driving an operator outside a graph.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub(crate) fn insert(&mut self, name: &str, value: Value, modified: bool) {
        if modified {
            self.modified.insert(name.to_string());
        }
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// The value of a parameter that must be present.
    pub fn value(&self, name: &str) -> Result<&Value, EvalError> {
        self.values
            .get(name)
            .ok_or_else(|| EvalError::parameter(name, "missing"))
    }

    pub fn number(&self, name: &str) -> Result<f64, EvalError> {
        self.value(name)?
            .as_f64()
            .ok_or_else(|| EvalError::parameter(name, "expected a number"))
    }

    pub fn text(&self, name: &str) -> Result<&str, EvalError> {
        self.value(name)?
            .as_str()
            .ok_or_else(|| EvalError::parameter(name, "expected text"))
    }

    pub fn boolean(&self, name: &str) -> Result<bool, EvalError> {
        self.value(name)?
            .as_bool()
            .ok_or_else(|| EvalError::parameter(name, "expected a boolean"))
    }

    pub fn tuples(&self, name: &str) -> Result<&[Tuple], EvalError> {
        self.value(name)?
            .as_tuples()
            .ok_or_else(|| EvalError::parameter(name, "expected tuples"))
    }

    /// Whether the parameter's upstream operator changed in this round.
    pub fn modified(&self, name: &str) -> bool {
        self.modified.contains(name)
    }

    pub fn any_modified(&self) -> bool {
        !self.modified.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
