//! Value-set membership seam for `memberOf()` path criteria.
//!
//! Membership resolution is an external collaborator. The engine only needs
//! a synchronous yes/no/unavailable answer; when the service is unavailable
//! the path evaluator records a diagnostic and the atom evaluates to false.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValueSetError {
    #[error("Value-set service unavailable")]
    Unavailable,

    #[error("Unknown value set: {0}")]
    UnknownValueSet(String),
}

/// Resolves code membership in canonical value sets.
pub trait ValueSetService: Send + Sync {
    fn contains(&self, value_set_url: &str, code: &str) -> Result<bool, ValueSetError>;
}

/// Default service: always unavailable.
#[derive(Debug, Default)]
pub struct UnavailableValueSetService;

impl ValueSetService for UnavailableValueSetService {
    fn contains(&self, _value_set_url: &str, _code: &str) -> Result<bool, ValueSetError> {
        Err(ValueSetError::Unavailable)
    }
}

/// Static in-memory service, useful for tests and small deployments.
#[derive(Debug, Default)]
pub struct StaticValueSetService {
    sets: HashMap<String, HashSet<String>>,
}

impl StaticValueSetService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(
        mut self,
        url: impl Into<String>,
        codes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.sets
            .insert(url.into(), codes.into_iter().map(Into::into).collect());
        self
    }
}

impl ValueSetService for StaticValueSetService {
    fn contains(&self, value_set_url: &str, code: &str) -> Result<bool, ValueSetError> {
        self.sets
            .get(value_set_url)
            .map(|codes| codes.contains(code))
            .ok_or_else(|| ValueSetError::UnknownValueSet(value_set_url.to_string()))
    }
}
