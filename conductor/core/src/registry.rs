//! Trigger Registry - Named Signals Shared Across the Graph
//!
//! Flows are wired together by name: one part of the graph registers a
//! signal with [`TriggerRegistry::create_trigger`] and any other part looks
//! it up with [`TriggerRegistry::from_trigger`]. Every lookup of the same
//! name observes the same emissions.
//!
//! The registry is an explicit object passed to whoever builds the graph,
//! so tests construct their own isolated instance.
//!
//! # Thread Safety
//!
//! Entries live behind `Arc<RwLock<>>`. Registration happens while the graph
//! is built; lookups and inbound emissions dominate afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::signal::Signal;

/// Payload carried by every trigger
pub type Payload = serde_json::Value;

/// Errors from trigger registration and lookup
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A trigger with this name already exists
    #[error("Trigger '{0}' is already registered")]
    DuplicateTrigger(String),

    /// No trigger with this name has been registered
    #[error("Trigger '{0}' has not been registered")]
    UnknownTrigger(String),
}

/// Name to signal mapping shared by the whole launcher
#[derive(Clone, Default)]
pub struct TriggerRegistry {
    triggers: Arc<RwLock<HashMap<String, Signal<Payload>>>>,
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("triggers", &self.names())
            .finish()
    }
}

impl TriggerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `signal` under `name` and hand it back
    ///
    /// A name can only be registered once.
    pub fn create_trigger(
        &self,
        name: impl Into<String>,
        signal: Signal<Payload>,
    ) -> Result<Signal<Payload>, RegistryError> {
        let name = name.into();
        let mut triggers = self.triggers.write();
        if triggers.contains_key(&name) {
            tracing::error!(trigger = %name, "Trigger registered twice");
            return Err(RegistryError::DuplicateTrigger(name));
        }
        tracing::debug!(trigger = %name, "Trigger registered");
        triggers.insert(name, signal.clone());
        Ok(signal)
    }

    /// Register a fresh plain signal under `name`
    pub fn create_source(&self, name: impl Into<String>) -> Result<Signal<Payload>, RegistryError> {
        self.create_trigger(name, Signal::new())
    }

    /// Look up a registered trigger
    pub fn from_trigger(&self, name: &str) -> Result<Signal<Payload>, RegistryError> {
        self.triggers.read().get(name).cloned().ok_or_else(|| {
            tracing::error!(trigger = %name, "Lookup of unregistered trigger");
            RegistryError::UnknownTrigger(name.to_string())
        })
    }

    /// Emit `payload` on a registered trigger
    ///
    /// Returns the number of subscribers that received it.
    pub fn emit(&self, name: &str, payload: Payload) -> Result<usize, RegistryError> {
        let signal = self.from_trigger(name)?;
        Ok(signal.emit(payload))
    }

    /// Whether `name` is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.triggers.read().contains_key(name)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.triggers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered triggers
    #[must_use]
    pub fn len(&self) -> usize {
        self.triggers.read().len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triggers.read().is_empty()
    }
}
