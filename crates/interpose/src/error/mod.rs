//! Domain errors raised by interception operations.
//!
//! All errors use a `thiserror`-derived enum with structured context so
//! plugins can match on the failure and degrade gracefully instead of
//! aborting their initialisation. Configuration parse errors are wrapped in
//! `Arc` to keep the enum cheap to clone into diagnostics.

use std::sync::Arc;

use thiserror::Error;

use crate::registry::PluginDirectory;

/// Errors arising from registration, dispatch, and host object operations.
#[derive(Debug, Clone, Error)]
pub enum InterposeError {
    /// The owner is unknown, inactive, or is the engine itself.
    #[error("'{owner}' is not a valid plugin: {reason}")]
    InvalidOwner {
        /// Owner identity supplied by the caller.
        owner: String,
        /// Why the owner was rejected.
        reason: String,
    },

    /// A caller-supplied argument was malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected argument.
        message: String,
    },

    /// A dotted target path could not be resolved against the root scope.
    #[error("target '{target}' could not be resolved: {message}")]
    UnresolvedTarget {
        /// Dotted path that was resolved.
        target: String,
        /// Which segment failed and why.
        message: String,
    },

    /// The owner already has a registration on the target.
    #[error("'{owner}' has already registered an interceptor for '{target}'")]
    DuplicateRegistration {
        /// Owner that registered twice.
        owner: String,
        /// Target that was registered.
        target: String,
    },

    /// A second override was registered on a target that already has one.
    #[error(
        "failed to wrap '{target}' for '{owner}' with kind OVERRIDE: \
         '{conflicting_owner}' has already registered an OVERRIDE interceptor for the same method"
    )]
    AlreadyOverridden {
        /// Owner whose registration was refused.
        owner: String,
        /// Target that was registered.
        target: String,
        /// Owner holding the existing override.
        conflicting_owner: String,
    },

    /// No registration exists for the owner on the target.
    #[error("cannot unregister '{target}' by '{owner}': no such interceptor has been registered")]
    NotFound {
        /// Owner that was looked up.
        owner: String,
        /// Target that was looked up.
        target: String,
    },

    /// No interception chain exists for the target.
    #[error("no interception chain exists for '{target}'")]
    ChainNotFound {
        /// Target that was looked up.
        target: String,
    },

    /// The host has frozen the property, so its accessor cannot change.
    #[error("'{target}' cannot be wrapped or restored: the property is not configurable")]
    NotConfigurable {
        /// Property or target name.
        target: String,
    },

    /// The value found at the target is not a method.
    #[error("'{target}' is not callable")]
    NotCallable {
        /// Property or target name.
        target: String,
    },

    /// A method body failed.
    #[error("call failed: {message}")]
    Call {
        /// Failure description supplied by the method.
        message: String,
    },

    /// Engine configuration could not be parsed.
    #[error("failed to parse engine configuration: {source}")]
    Config {
        /// Underlying JSON error.
        #[source]
        source: Arc<serde_json::Error>,
    },
}

impl InterposeError {
    /// Convenience constructor for failures raised inside method bodies.
    #[must_use]
    pub fn call(message: impl Into<String>) -> Self {
        Self::Call {
            message: message.into(),
        }
    }

    /// Returns the display name of the owner holding the conflicting override.
    ///
    /// Only [`InterposeError::AlreadyOverridden`] carries a conflicting owner;
    /// every other variant, and owners unknown to `plugins`, yield `None`.
    #[must_use]
    pub fn conflicting_owner_title(&self, plugins: &dyn PluginDirectory) -> Option<String> {
        match self {
            Self::AlreadyOverridden {
                conflicting_owner, ..
            } => plugins
                .lookup(conflicting_owner)
                .map(|info| info.display_name),
            _ => None,
        }
    }
}
