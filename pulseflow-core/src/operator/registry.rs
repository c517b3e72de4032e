//! Operator Registry
//!
//! Collaborator modules contribute operator kinds by registering a factory
//! under a name. A registry is an ordinary value: build it at startup, fill
//! it, and hand it to each [`Dataflow`](crate::dataflow::Dataflow) that
//! should be able to instantiate those kinds by name.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use super::{Definition, Operator};
use crate::error::ConfigError;

/// Creates a fresh operator instance.
pub type Factory = Arc<dyn Fn() -> Box<dyn Operator> + Send + Sync>;

struct Entry {
    definition: Definition,
    factory: Factory,
}

/// Named operator kinds.
#[derive(Default)]
pub struct Registry {
    kinds: IndexMap<String, Entry>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a kind. The name is taken from the instance's definition.
    pub fn register<F, O>(&mut self, factory: F) -> Result<(), ConfigError>
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: Operator + 'static,
    {
        let definition = factory().definition().clone();
        let kind = definition.kind().to_string();
        if self.kinds.contains_key(&kind) {
            return Err(ConfigError::DuplicateKind(kind));
        }
        debug!(kind = %kind, "registered operator kind");
        self.kinds.insert(
            kind,
            Entry {
                definition,
                factory: Arc::new(move || Box::new(factory()) as Box<dyn Operator>),
            },
        );
        Ok(())
    }

    /// Instantiate a registered kind.
    pub fn create(&self, kind: &str) -> Result<Box<dyn Operator>, ConfigError> {
        self.kinds
            .get(kind)
            .map(|entry| (entry.factory)())
            .ok_or_else(|| ConfigError::UnknownKind(kind.to_string()))
    }

    /// The definition of a registered kind.
    pub fn definition(&self, kind: &str) -> Option<&Definition> {
        self.kinds.get(kind).map(|entry| &entry.definition)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Registered kind names, in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .finish()
    }
}
