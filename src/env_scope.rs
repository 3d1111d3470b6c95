//! Process-wide environment scoping for one unit.
//!
//! [`EnvScope`] is the only place that writes process environment variables.
//! It records what each variable held before injection so [`EnvScope::revert`]
//! can restore it. Thread-backed units share the parent's environment and are
//! never allowed to touch it.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::Backend;
use crate::error::EnvScopeError;

pub struct EnvScope {
    backend: Backend,
    /// Prior value (or absence) of every variable this scope has written.
    snapshot: Vec<(String, Option<String>)>,
}

impl EnvScope {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            snapshot: Vec::new(),
        }
    }

    /// Injects `vars` into the process environment.
    ///
    /// Under the thread backend this only warns. Variables written before an
    /// invalid entry is hit stay recorded and are undone by `revert`.
    pub fn apply(&mut self, vars: &BTreeMap<String, String>) -> Result<(), EnvScopeError> {
        if vars.is_empty() {
            return Ok(());
        }
        if self.backend.shares_environment() {
            warn!(
                backend = %self.backend,
                count = vars.len(),
                "environment variables should not be set when runtime=\"thread\"; ignoring them"
            );
            return Ok(());
        }

        for (key, value) in vars {
            validate(key, value)?;
            let prior = std::env::var(key).ok();
            self.snapshot.push((key.clone(), prior));
            std::env::set_var(key, value);
            debug!(key = %key, "Injected environment variable");
        }
        Ok(())
    }

    /// Restores every variable written by `apply`. Safe to call repeatedly.
    pub fn revert(&mut self) {
        if self.backend.shares_environment() {
            return;
        }
        // Newest first, so a key written twice ends at its original value.
        while let Some((key, prior)) = self.snapshot.pop() {
            match prior {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
            debug!(key = %key, "Reverted environment variable");
        }
    }

    pub fn injected(&self) -> usize {
        self.snapshot.len()
    }
}

fn validate(key: &str, value: &str) -> Result<(), EnvScopeError> {
    if key.is_empty() || key.contains('=') || key.contains('\0') {
        return Err(EnvScopeError::InvalidName {
            name: key.to_string(),
        });
    }
    if value.contains('\0') {
        return Err(EnvScopeError::InvalidValue {
            name: key.to_string(),
        });
    }
    Ok(())
}
