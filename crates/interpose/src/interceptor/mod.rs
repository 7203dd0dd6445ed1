//! Interceptor kinds, callbacks, and the chain continuation.
//!
//! An [`Interceptor`] is one plugin's contribution to one target method.
//! Chained interceptors receive a [`Next`] continuation representing the rest
//! of the chain; terminal (override) interceptors receive only the original
//! arguments and end the walk. The two contracts are separate variants so an
//! override can never be handed a continuation by accident.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::chain::{CallState, DispatchChain};
use crate::error::InterposeError;
use crate::host::{Method, ObjectRef, Value};

/// How an interceptor treats the rest of the chain.
///
/// Kinds are walked in ascending weight: every `Passthrough` runs before any
/// `Mixed`, and the single `Override` (if any) runs last.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    EnumString,
    Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum InterceptorKind {
    /// Always calls the continuation. Violations are corrected automatically.
    Passthrough,
    /// May or may not call the continuation.
    #[default]
    Mixed,
    /// Never calls the continuation; at most one per target.
    Override,
}

impl InterceptorKind {
    /// Every kind, in dispatch order.
    pub const ALL: [Self; 3] = [Self::Passthrough, Self::Mixed, Self::Override];

    /// Sort weight; lower weights run earlier in the chain.
    #[must_use]
    pub const fn weight(self) -> u8 {
        match self {
            Self::Passthrough => 1,
            Self::Mixed => 2,
            Self::Override => 3,
        }
    }
}

/// Callback contract for interceptors that receive a continuation.
pub type ChainedFn = dyn Fn(&Next<'_>, &ObjectRef, &[Value]) -> Result<Value, InterposeError>;

/// Callback contract for terminal interceptors.
pub type OverrideFn = dyn Fn(&ObjectRef, &[Value]) -> Result<Value, InterposeError>;

/// A plugin-supplied interceptor.
///
/// # Example
///
/// ```
/// use interpose::{Interceptor, InterceptorKind};
/// use serde_json::json;
///
/// let logging = Interceptor::passthrough(|next, _receiver, args| next.call(args));
/// let replacement = Interceptor::overriding(|_receiver, _args| Ok(json!(0)));
/// assert_eq!(logging.kind(), InterceptorKind::Passthrough);
/// assert_eq!(replacement.kind(), InterceptorKind::Override);
/// ```
#[derive(Clone)]
pub enum Interceptor {
    /// Receives the continuation as its first argument.
    ///
    /// `kind` must be [`InterceptorKind::Passthrough`] or
    /// [`InterceptorKind::Mixed`]; registration rejects anything else.
    Chained {
        /// Chaining contract the callback promises to honour.
        kind: InterceptorKind,
        /// The interceptor body.
        callback: Rc<ChainedFn>,
    },
    /// Replaces the rest of the chain.
    Terminal(Rc<OverrideFn>),
}

impl Interceptor {
    /// Builds an interceptor that promises to always call the continuation.
    pub fn passthrough(
        callback: impl Fn(&Next<'_>, &ObjectRef, &[Value]) -> Result<Value, InterposeError> + 'static,
    ) -> Self {
        Self::Chained {
            kind: InterceptorKind::Passthrough,
            callback: Rc::new(callback),
        }
    }

    /// Builds an interceptor that may short-circuit the chain.
    pub fn mixed(
        callback: impl Fn(&Next<'_>, &ObjectRef, &[Value]) -> Result<Value, InterposeError> + 'static,
    ) -> Self {
        Self::Chained {
            kind: InterceptorKind::Mixed,
            callback: Rc::new(callback),
        }
    }

    /// Builds a terminal interceptor that replaces the method outright.
    pub fn overriding(
        callback: impl Fn(&ObjectRef, &[Value]) -> Result<Value, InterposeError> + 'static,
    ) -> Self {
        Self::Terminal(Rc::new(callback))
    }

    /// The kind this interceptor is registered as.
    #[must_use]
    pub const fn kind(&self) -> InterceptorKind {
        match self {
            Self::Chained { kind, .. } => *kind,
            Self::Terminal(_) => InterceptorKind::Override,
        }
    }

    /// Checks that the variant and the declared kind agree.
    pub(crate) fn validate(&self) -> Result<(), InterposeError> {
        match self {
            Self::Chained {
                kind: InterceptorKind::Override,
                ..
            } => Err(InterposeError::InvalidArgument {
                message: String::from(
                    "an OVERRIDE interceptor must be terminal and cannot take a continuation",
                ),
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

enum Continuation<'a> {
    Chain {
        chain: &'a Rc<DispatchChain>,
        state: &'a CallState,
    },
    Direct(Option<&'a Method>),
}

/// The rest of the chain, handed to chained interceptors.
///
/// Calling it marks the interceptor as having chained and resumes the walk
/// at the following registration with the same receiver.
pub struct Next<'a> {
    receiver: &'a ObjectRef,
    target: &'a str,
    continuation: Continuation<'a>,
}

impl<'a> Next<'a> {
    pub(crate) const fn chained(
        chain: &'a Rc<DispatchChain>,
        receiver: &'a ObjectRef,
        target: &'a str,
        state: &'a CallState,
    ) -> Self {
        Self {
            receiver,
            target,
            continuation: Continuation::Chain { chain, state },
        }
    }

    /// Builds a continuation that calls `method` directly.
    ///
    /// Used by callers outside the engine (such as a fallback shim) that
    /// patch a method without a dispatch chain. A missing method makes the
    /// continuation fail with [`InterposeError::NotCallable`].
    #[must_use]
    pub const fn direct(method: Option<&'a Method>, receiver: &'a ObjectRef, target: &'a str) -> Self {
        Self {
            receiver,
            target,
            continuation: Continuation::Direct(method),
        }
    }

    /// Resumes the chain with `args`.
    ///
    /// # Errors
    ///
    /// Propagates any error raised further down the chain or by the original
    /// method.
    pub fn call(&self, args: &[Value]) -> Result<Value, InterposeError> {
        match &self.continuation {
            Continuation::Chain { chain, state } => chain.walk(Some(*state), self.receiver, args),
            Continuation::Direct(Some(method)) => method.call(self.receiver, args),
            Continuation::Direct(None) => Err(InterposeError::NotCallable {
                target: self.target.to_owned(),
            }),
        }
    }

    /// The receiver the chain is being dispatched for.
    #[must_use]
    pub const fn receiver(&self) -> &ObjectRef {
        self.receiver
    }
}
