//! Cooperative method interception for plugin hosts.
//!
//! The `interpose` crate lets several independent plugins wrap the same named
//! method on a shared object graph without knowing about each other. Each
//! plugin registers an [`Interceptor`] against a dotted target path; the
//! engine keeps one dispatch chain per intercepted method, walks the
//! interceptors in priority order on every call, and threads a [`Next`]
//! continuation through them so each can call on to the rest of the chain.
//!
//! # Interceptor kinds
//!
//! - [`InterceptorKind::Passthrough`] interceptors promise to always call the
//!   continuation and run first. One that breaks the promise is unregistered
//!   on the spot and the call is completed as if it had never existed.
//! - [`InterceptorKind::Mixed`] interceptors (the default) may short-circuit.
//!   Doing so while later interceptors exist is reported once as a possible
//!   conflict.
//! - [`InterceptorKind::Override`] interceptors replace the method outright,
//!   run last, and only one may exist per target; a second attempt fails with
//!   [`InterposeError::AlreadyOverridden`].
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//!
//! use interpose::{
//!     EngineConfig, Interceptor, Member, ObjectRef, Registry, StaticPluginDirectory,
//! };
//! use serde_json::json;
//!
//! let root = ObjectRef::new();
//! let token = ObjectRef::new();
//! let prototype = ObjectRef::new();
//! prototype.define_method("size", |_this, _args| Ok(json!(1))).expect("define");
//! token.define("prototype", Member::Object(prototype.clone())).expect("define");
//! root.define("Token", Member::Object(token)).expect("define");
//!
//! let plugins = Rc::new(StaticPluginDirectory::new());
//! plugins.add("scaler");
//! let registry = Registry::new(root, plugins, EngineConfig::default());
//! registry
//!     .register(
//!         "scaler",
//!         "Token.prototype.size",
//!         Interceptor::passthrough(|next, _this, args| {
//!             let size = next.call(args)?.as_i64().unwrap_or_default();
//!             Ok(json!(size * 10))
//!         }),
//!     )
//!     .expect("registration succeeds");
//!
//! let instance = ObjectRef::with_prototype(&prototype);
//! assert_eq!(instance.call("size", &[]).expect("call"), json!(10));
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod host;
pub mod interceptor;
pub mod registry;

mod chain;

#[cfg(test)]
mod tests;

pub use self::config::EngineConfig;
pub use self::error::InterposeError;
pub use self::hooks::{LOADED_EVENT, LifecycleHooks};
pub use self::host::{Member, Method, ObjectRef, Value, resolve_path};
pub use self::interceptor::{Interceptor, InterceptorKind, Next};
pub use self::registry::{
    ChainInfo, ENGINE_ID, PluginDirectory, PluginInfo, Registry, StaticPluginDirectory, VERSION,
};
