//! Pulseflow Core
//!
//! This crate provides an incremental dataflow engine. Operators form a
//! graph; a batch of changes (a pulse) flows through it in rank order and
//! each operator recomputes only what the pulse touched.
//!
//! It implements:
//!
//! - Tuple identity and changeset ingestion
//! - Pulses with fork, materialize and ordered visitation
//! - An operator graph with rank maintenance and cycle detection
//! - A scheduler with per-round single evaluation, deferred (async)
//!   evaluation, and failure containment
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `data`: tuples, operator values and changesets
//! - `pulse`: the per-round delta and its derivations
//! - `operator`: the operator capability, parameter schemas and the registry
//! - `graph`: the operator arena, edges and ranks
//! - `dataflow`: the run-loop
//!
//! # Example
//!
//! ```rust
//! use pulseflow_core::data::Changeset;
//! use pulseflow_core::data::Value;
//! use pulseflow_core::dataflow::Dataflow;
//! use pulseflow_core::operator::Params;
//! use serde_json::json;
//!
//! let mut df = Dataflow::new();
//! let data = df.add_kind("collect", Params::new()).unwrap();
//! let count = df.add_kind("count", Params::new().pulse(data)).unwrap();
//!
//! df.pulse(data, Changeset::new().insert([json!({"a": 1}), json!({"a": 2})]))
//!     .unwrap();
//! df.run().unwrap();
//! assert_eq!(df.value(count), Some(&Value::Number(2.0)));
//! ```

pub mod config;
pub mod data;
pub mod dataflow;
pub mod error;
pub mod graph;
pub mod operator;
pub mod pulse;

pub use config::DataflowConfig;
pub use dataflow::{Dataflow, Requester, RoundReport, RunState, RunStatus};
pub use error::{ConfigError, DataflowError, EvalError, EvalFailure};
pub use graph::{OpId, Rank};
pub use pulse::{Flags, Pulse};
