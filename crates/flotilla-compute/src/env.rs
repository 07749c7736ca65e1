//! Environment resolution under an allow-list policy.
//!
//! Tasks carry the environment they want; the node decides what they may
//! have. Names are checked against the node's allow-list (exact names or
//! `PREFIX_*` patterns) and the reserved orchestrator prefix is always
//! refused so user tasks cannot impersonate node configuration.

use std::collections::HashMap;

use flotilla_core::error::{Error, Result};
use flotilla_core::job::Task;

/// Prefix reserved for node and orchestrator configuration.
const RESERVED_PREFIX: &str = "FLOTILLA_";

/// Resolves a task's environment map under the node's policy.
#[derive(Debug, Clone, Default)]
pub struct EnvResolver {
    /// Allowed names; entries ending in `*` match as prefixes. Empty means
    /// everything outside the reserved prefix is allowed.
    allowed: Vec<String>,
}

impl EnvResolver {
    /// Creates a resolver that allows everything outside the reserved
    /// prefix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the resolver to the given names and `PREFIX_*` patterns.
    #[must_use]
    pub fn with_allowed(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Resolves the task's environment.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first variable outside the
    /// policy.
    pub fn resolve(&self, task: &Task) -> Result<HashMap<String, String>> {
        let mut env = HashMap::with_capacity(task.env.len());
        for (name, value) in &task.env {
            if !self.is_allowed(name) {
                return Err(Error::validation(format!(
                    "environment variable '{name}' is not permitted by the node's policy"
                )));
            }
            env.insert(name.clone(), value.clone());
        }
        Ok(env)
    }

    fn is_allowed(&self, name: &str) -> bool {
        if name.to_ascii_uppercase().starts_with(RESERVED_PREFIX) {
            return false;
        }
        if self.allowed.is_empty() {
            return true;
        }
        self.allowed.iter().any(|pattern| {
            pattern
                .strip_suffix('*')
                .map_or(pattern == name, |prefix| name.starts_with(prefix))
        })
    }
}
