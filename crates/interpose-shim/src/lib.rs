//! Fallback registration path for plugins that cannot rely on the engine.
//!
//! A plugin that only wraps a handful of methods can depend on this crate
//! instead of the full engine. When the host reports the engine plugin
//! ([`ENGINE_ID`]) as active, registrations are forwarded to the engine's
//! [`Registry`], or queued on [`LOADED_EVENT`] until the engine announces
//! itself. Otherwise the target is monkey-patched directly: no ordering, no
//! conflict detection, and no way to unregister.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use interpose::interceptor::ChainedFn;
use interpose::{
    ENGINE_ID, Interceptor, InterceptorKind, InterposeError, LOADED_EVENT, LifecycleHooks, Member,
    Method, Next, ObjectRef, PluginDirectory, Registry, Value, resolve_path,
};
use tracing::{debug, info, warn};

/// Tracing target for shim diagnostics.
const SHIM_TARGET: &str = "interpose::shim";

/// Advisory shown when plugins fall back to naive patching.
pub const ENGINE_MISSING_NOTICE: &str = "One or more plugins depend on the 'interpose' engine. \
     Because it is not active, they will use a less reliable fallback implementation.";

/// Registration front-end that works with or without the engine.
pub struct Shim {
    root: ObjectRef,
    plugins: Rc<dyn PluginDirectory>,
    hooks: Rc<LifecycleHooks>,
    engine: Rc<RefCell<Option<Registry>>>,
    notice_given: Cell<bool>,
}

impl fmt::Debug for Shim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shim")
            .field("engine_attached", &self.engine.borrow().is_some())
            .field("notice_given", &self.notice_given.get())
            .finish_non_exhaustive()
    }
}

impl Shim {
    /// Creates a shim that picks up the engine when it announces itself on
    /// `hooks`.
    #[must_use]
    pub fn new(root: ObjectRef, plugins: Rc<dyn PluginDirectory>, hooks: Rc<LifecycleHooks>) -> Self {
        let engine = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&engine);
        hooks.once(LOADED_EVENT, move |registry| {
            *slot.borrow_mut() = Some(registry.clone());
        });
        Self {
            root,
            plugins,
            hooks,
            engine,
            notice_given: Cell::new(false),
        }
    }

    /// Attaches an engine that loaded before this shim was created.
    pub fn attach(&self, registry: &Registry) {
        *self.engine.borrow_mut() = Some(registry.clone());
    }

    /// The engine registry, once one has been attached or announced.
    #[must_use]
    pub fn engine(&self) -> Option<Registry> {
        self.engine.borrow().clone()
    }

    /// Always `true`.
    #[must_use]
    pub const fn is_shim(&self) -> bool {
        true
    }

    /// Whether the host reports the engine plugin as active.
    #[must_use]
    pub fn module_active(&self) -> bool {
        self.plugins
            .lookup(ENGINE_ID)
            .is_some_and(|info| info.active)
    }

    /// Returns the advisory text when the engine is inactive, logging it the
    /// first time.
    #[must_use]
    pub fn engine_missing_notice(&self) -> Option<&'static str> {
        if self.module_active() {
            return None;
        }
        if !self.notice_given.replace(true) {
            warn!(target: SHIM_TARGET, "{ENGINE_MISSING_NOTICE}");
        }
        Some(ENGINE_MISSING_NOTICE)
    }

    /// Wraps the method at `target` with a callback that may call on.
    ///
    /// With the engine active the callback is registered as a
    /// [`InterceptorKind::Mixed`] interceptor, immediately or once the engine
    /// loads. Without it, the current member at `target` is replaced by a
    /// method that hands the callback a continuation to the replaced member.
    ///
    /// # Errors
    ///
    /// Propagates engine registration errors, or fails with
    /// [`InterposeError::UnresolvedTarget`] or
    /// [`InterposeError::NotConfigurable`] when patching directly.
    pub fn register(
        &self,
        owner: &str,
        target: &str,
        callback: impl Fn(&Next<'_>, &ObjectRef, &[Value]) -> Result<Value, InterposeError> + 'static,
    ) -> Result<(), InterposeError> {
        let callback: Rc<ChainedFn> = Rc::new(callback);
        if self.engine_missing_notice().is_some() {
            return self.patch(owner, target, callback);
        }

        if let Some(registry) = self.engine() {
            return registry.register(owner, target, mixed(callback));
        }

        let deferred_owner = owner.to_owned();
        let deferred_target = target.to_owned();
        self.hooks.once(LOADED_EVENT, move |registry| {
            if let Err(err) = registry.register(&deferred_owner, &deferred_target, mixed(callback)) {
                warn!(
                    target: SHIM_TARGET,
                    owner = %deferred_owner,
                    target_name = %deferred_target,
                    error = %err,
                    "deferred registration failed"
                );
            }
        });
        debug!(
            target: SHIM_TARGET,
            owner,
            target_name = target,
            "engine not loaded yet; registration deferred"
        );
        Ok(())
    }

    fn patch(&self, owner: &str, target: &str, callback: Rc<ChainedFn>) -> Result<(), InterposeError> {
        let (object, property) = resolve_path(&self.root, target)?;
        let original = object.get(&property).and_then(|member| match member {
            Member::Method(method) => Some(method),
            _ => None,
        });
        let name = target.to_owned();
        let replacement = Method::new(move |receiver, args| {
            let next = Next::direct(original.as_ref(), receiver, &name);
            callback(&next, receiver, args)
        });
        object.set(&property, Member::Method(replacement))?;

        info!(
            target: SHIM_TARGET,
            owner,
            target_name = target,
            "patched '{target}' for '{owner}' without the engine"
        );
        Ok(())
    }
}

fn mixed(callback: Rc<ChainedFn>) -> Interceptor {
    Interceptor::Chained {
        kind: InterceptorKind::Mixed,
        callback,
    }
}
