//! Provider and model identifiers.
//!
//! A model is addressed externally as a single string that may carry a
//! provider prefix (`prefix:name`). The [`Router`](crate::provider) is the
//! only place that parses this form; everywhere else in the core, a model
//! is already resolved to a [`ModelId`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque tag identifying a registered provider (e.g. `"daemon"`, `"local"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<T: Into<String>> From<T> for ProviderId {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// `(provider, name)` pair uniquely identifying a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    pub provider: ProviderId,
    pub name: String,
}

impl ModelId {
    pub fn new(provider: impl Into<ProviderId>, name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_display_is_prefixed() {
        let id = ModelId::new("daemon", "mistral:7b");
        assert_eq!(id.to_string(), "daemon:mistral:7b");
    }

    #[test]
    fn provider_id_from_str() {
        let id: ProviderId = "daemon".into();
        assert_eq!(id.as_str(), "daemon");
    }
}
