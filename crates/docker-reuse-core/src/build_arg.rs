use std::fmt::{Display, Formatter};

use thiserror::Error;

/// A build parameter with a concrete value, in `NAME=VALUE` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArg {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("build argument '{name}' has no value and the environment variable is not set")]
    Missing { name: String },
    #[error("build argument '{spec}' has an empty name")]
    EmptyName { spec: String },
}

impl BuildArg {
    /// Parses `NAME=VALUE`, or looks up a bare `NAME` in the process environment.
    pub fn resolve(spec: &str) -> Result<Self, ParameterError> {
        Self::resolve_with(spec, |name| std::env::var(name).ok())
    }

    /// Like [`BuildArg::resolve`], reading bare names through `lookup`.
    pub fn resolve_with<F>(spec: &str, lookup: F) -> Result<Self, ParameterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (name, value) = match spec.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (spec, None),
        };

        if name.is_empty() {
            return Err(ParameterError::EmptyName {
                spec: spec.to_string(),
            });
        }

        let value = match value {
            Some(value) => value,
            None => lookup(name).ok_or_else(|| ParameterError::Missing {
                name: name.to_string(),
            })?,
        };

        Ok(Self {
            name: name.to_string(),
            value,
        })
    }

    /// The line this parameter contributes to the fingerprint.
    pub fn fingerprint_line(&self) -> String {
        format!("{}={}\n", self.name, self.value)
    }
}

impl Display for BuildArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Resolves every spec in command-line order, failing on the first missing value.
pub fn resolve_all<S: AsRef<str>>(specs: &[S]) -> Result<Vec<BuildArg>, ParameterError> {
    specs.iter().map(|s| BuildArg::resolve(s.as_ref())).collect()
}
