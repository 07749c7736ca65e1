//! Opaque capability specs.
//!
//! A [`SpecConfig`] names a pluggable capability (an engine, a storage
//! source, a publisher) by kind and carries its parameters as an opaque JSON
//! map. The core never interprets the params; it only routes them to the
//! matching provider on a compute node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// An opaque `{kind, params}` capability spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecConfig {
    /// The capability kind, matched against a provider registry.
    pub kind: String,
    /// Opaque parameters for the provider.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl SpecConfig {
    /// Creates a spec of the given kind with no params.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a param to the spec.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns the param for `key`, if present.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    /// Returns true if the spec names no kind and carries no params.
    ///
    /// Empty specs stand in for "no publisher" and similar optional
    /// capabilities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() && self.params.is_empty()
    }

    /// Returns true if the spec is of the given kind, ignoring case.
    #[must_use]
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.eq_ignore_ascii_case(kind.trim())
    }

    /// Validates that the spec names a kind.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the kind is blank.
    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(Error::validation("missing spec kind"));
        }
        Ok(())
    }

    /// Validates the spec, accepting the empty spec.
    ///
    /// Useful for optional capabilities such as publishers.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the spec has params but no kind.
    pub fn validate_allow_empty(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        self.validate()
    }
}
