//! Dataflow Configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables for a [`Dataflow`](crate::dataflow::Dataflow) instance.
///
/// All fields have defaults, so a partial JSON document is enough:
///
/// ```rust
/// use pulseflow_core::config::DataflowConfig;
///
/// let config = DataflowConfig::from_json(r#"{ "name": "charts" }"#).unwrap();
/// assert_eq!(config.name, "charts");
/// assert!(config.trace_evaluations);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataflowConfig {
    /// Label attached to every round span.
    pub name: String,

    /// Upper bound on evaluations inside a single round, counting re-runs.
    pub max_evaluations_per_round: usize,

    /// Emit one `trace!` event per operator evaluation.
    pub trace_evaluations: bool,
}

impl Default for DataflowConfig {
    fn default() -> Self {
        Self {
            name: "dataflow".to_string(),
            max_evaluations_per_round: 1_000_000,
            trace_evaluations: true,
        }
    }
}

impl DataflowConfig {
    /// Parse a configuration from JSON, filling in defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = DataflowConfig::from_json("{}").unwrap();
        assert_eq!(config, DataflowConfig::default());
    }

    #[test]
    fn partial_document_overrides() {
        let config =
            DataflowConfig::from_json(r#"{"max_evaluations_per_round": 10, "trace_evaluations": false}"#)
                .unwrap();
        assert_eq!(config.max_evaluations_per_round, 10);
        assert!(!config.trace_evaluations);
        assert_eq!(config.name, "dataflow");
    }

    #[test]
    fn malformed_document_is_rejected() {
        let err = DataflowConfig::from_json("{ nope").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));
    }
}
