//! Engine configuration.
//!
//! The engine has no file or CLI surface of its own; hosts embed the
//! configuration as JSON next to their other settings and hand the text to
//! [`EngineConfig::from_json_str`]. Unknown keys are rejected so typos fail
//! fast rather than silently falling back to defaults.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::InterposeError;

/// Default for [`EngineConfig::debug`].
#[must_use]
pub const fn default_debug() -> bool {
    false
}

/// Default for [`EngineConfig::properties_configurable`].
#[must_use]
pub const fn default_properties_configurable() -> bool {
    true
}

/// Runtime switches for the interception engine.
///
/// # Example
///
/// ```
/// use interpose::EngineConfig;
///
/// let config = EngineConfig::from_json_str(r#"{ "debug": true }"#).expect("valid config");
/// assert!(config.debug);
/// assert!(config.properties_configurable);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Disables diagnostic rate limiting and logs accessor installation.
    pub debug: bool,
    /// Installs accessors as configurable so they can later be removed and
    /// the original value restored.
    pub properties_configurable: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug: default_debug(),
            properties_configurable: default_properties_configurable(),
        }
    }
}

impl EngineConfig {
    /// Parses configuration from JSON text. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`InterposeError::Config`] when the text is not valid JSON, has
    /// the wrong shape, or names an unknown key.
    pub fn from_json_str(text: &str) -> Result<Self, InterposeError> {
        serde_json::from_str(text).map_err(|source| InterposeError::Config {
            source: Arc::new(source),
        })
    }
}
