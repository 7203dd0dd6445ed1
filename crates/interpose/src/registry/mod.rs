//! Process-wide directory of dispatch chains and the public registration API.
//!
//! The [`Registry`] maps target names to their dispatch chains, validates
//! owners against the host's [`PluginDirectory`], and delegates to the chain
//! for ordering, conflict detection, and accessor management. It is a cheap
//! cloneable handle: every clone shares the same chains, so the host creates
//! one registry and passes it to each plugin explicitly.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{info, warn};

use crate::chain::DispatchChain;
use crate::config::EngineConfig;
use crate::error::InterposeError;
use crate::hooks::{LOADED_EVENT, LifecycleHooks};
use crate::host::{ObjectRef, resolve_path};
use crate::interceptor::{Interceptor, InterceptorKind};

/// Identity of the engine itself; it may not register interceptors.
pub const ENGINE_ID: &str = "interpose";

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tracing target for registry operations.
const REGISTRY_TARGET: &str = "interpose::registry";

/// What the host knows about a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    /// Whether the plugin is currently enabled.
    pub active: bool,
    /// Human-facing name used in conflict messages.
    pub display_name: String,
}

impl PluginInfo {
    /// Creates plugin information.
    #[must_use]
    pub fn new(active: bool, display_name: impl Into<String>) -> Self {
        Self {
            active,
            display_name: display_name.into(),
        }
    }
}

/// Host-side directory of installed plugins.
///
/// The registry consults it to reject registrations from unknown or disabled
/// owners.
pub trait PluginDirectory {
    /// Looks up an owner, returning `None` when the host does not know it.
    fn lookup(&self, owner: &str) -> Option<PluginInfo>;
}

/// In-memory [`PluginDirectory`] whose contents can change after the
/// registry has been built.
///
/// # Example
///
/// ```
/// use interpose::{PluginDirectory, StaticPluginDirectory};
///
/// let plugins = StaticPluginDirectory::new();
/// plugins.add("tokens");
/// assert!(plugins.lookup("tokens").is_some_and(|info| info.active));
/// plugins.deactivate("tokens");
/// assert!(plugins.lookup("tokens").is_some_and(|info| !info.active));
/// ```
#[derive(Debug, Default)]
pub struct StaticPluginDirectory {
    plugins: RefCell<HashMap<String, PluginInfo>>,
}

impl StaticPluginDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an active plugin whose display name is its identity.
    pub fn add(&self, owner: &str) {
        self.insert(owner, PluginInfo::new(true, owner));
    }

    /// Adds or replaces a plugin entry.
    pub fn insert(&self, owner: &str, info: PluginInfo) {
        self.plugins.borrow_mut().insert(owner.to_owned(), info);
    }

    /// Marks a plugin inactive. Returns `false` when the plugin is unknown.
    pub fn deactivate(&self, owner: &str) -> bool {
        self.plugins
            .borrow_mut()
            .get_mut(owner)
            .map(|info| info.active = false)
            .is_some()
    }
}

impl PluginDirectory for StaticPluginDirectory {
    fn lookup(&self, owner: &str) -> Option<PluginInfo> {
        self.plugins.borrow().get(owner).cloned()
    }
}

/// Read-only snapshot of one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainInfo {
    /// Every name the chain has been reached through; the first is the
    /// display name.
    pub names: Vec<String>,
    /// Owners in dispatch order.
    pub owners: Vec<String>,
    /// Kinds in dispatch order.
    pub kinds: Vec<InterceptorKind>,
    /// Owners that have already been warned about a possible conflict.
    pub warned_owners: Vec<String>,
    /// Whether the accessor is present on the object.
    pub installed: bool,
}

impl ChainInfo {
    fn of(chain: &DispatchChain) -> Self {
        Self {
            names: chain.names(),
            owners: chain.owners(),
            kinds: chain.kinds(),
            warned_owners: chain.warned_owners(),
            installed: chain.is_installed(),
        }
    }
}

/// Shared state behind every [`Registry`] handle.
pub(crate) struct RegistryState {
    root: ObjectRef,
    plugins: Rc<dyn PluginDirectory>,
    chains: RefCell<Vec<Rc<DispatchChain>>>,
    debug: Cell<bool>,
    properties_configurable: bool,
}

impl RegistryState {
    pub(crate) fn debug(&self) -> bool {
        self.debug.get()
    }

    pub(crate) const fn properties_configurable(&self) -> bool {
        self.properties_configurable
    }

    pub(crate) fn track(&self, chain: &Rc<DispatchChain>) {
        let mut chains = self.chains.borrow_mut();
        if !chains.iter().any(|known| Rc::ptr_eq(known, chain)) {
            chains.push(Rc::clone(chain));
        }
    }

    fn untrack(&self, chain: &Rc<DispatchChain>) {
        self.chains
            .borrow_mut()
            .retain(|known| !Rc::ptr_eq(known, chain));
    }

    fn find(&self, target: &str) -> Option<Rc<DispatchChain>> {
        self.chains
            .borrow()
            .iter()
            .find(|chain| chain.answers_to(target))
            .cloned()
    }

    /// Removes `owner` from `chain` without validating the owner, forgetting
    /// the chain once it has been uninstalled.
    pub(crate) fn evict(&self, chain: &Rc<DispatchChain>, owner: &str) -> Result<(), InterposeError> {
        if chain.unregister(owner)? {
            self.untrack(chain);
        }
        info!(
            target: REGISTRY_TARGET,
            owner,
            target_name = %chain.display_name(),
            "unregistered interceptor"
        );
        Ok(())
    }
}

/// Handle to the chain registry.
///
/// # Example
///
/// ```
/// use std::rc::Rc;
///
/// use interpose::{
///     EngineConfig, Interceptor, Member, ObjectRef, Registry, StaticPluginDirectory,
/// };
/// use serde_json::json;
///
/// let root = ObjectRef::new();
/// let counter = ObjectRef::new();
/// counter.define_method("value", |_this, _args| Ok(json!(1))).expect("define");
/// root.define("Counter", Member::Object(counter.clone())).expect("define");
///
/// let plugins = Rc::new(StaticPluginDirectory::new());
/// plugins.add("doubler");
/// let registry = Registry::new(root, plugins, EngineConfig::default());
///
/// registry
///     .register(
///         "doubler",
///         "Counter.value",
///         Interceptor::mixed(|next, _this, args| {
///             let value = next.call(args)?.as_i64().unwrap_or_default();
///             Ok(json!(value * 2))
///         }),
///     )
///     .expect("registration succeeds");
/// assert_eq!(counter.call("value", &[]).expect("call"), json!(2));
///
/// registry.unregister("doubler", "Counter.value", true).expect("unregister");
/// assert_eq!(counter.call("value", &[]).expect("call"), json!(1));
/// ```
#[derive(Clone)]
pub struct Registry {
    state: Rc<RegistryState>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("chains", &self.state.chains.borrow().len())
            .field("debug", &self.state.debug.get())
            .field(
                "properties_configurable",
                &self.state.properties_configurable,
            )
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Creates a registry resolving targets against `root`.
    #[must_use]
    pub fn new(root: ObjectRef, plugins: Rc<dyn PluginDirectory>, config: EngineConfig) -> Self {
        Self {
            state: Rc::new(RegistryState {
                root,
                plugins,
                chains: RefCell::new(Vec::new()),
                debug: Cell::new(config.debug),
                properties_configurable: config.properties_configurable,
            }),
        }
    }

    /// Creates a registry and announces it on [`LOADED_EVENT`] so listeners
    /// queued before the engine existed can replay against it.
    #[must_use]
    pub fn initialise(
        root: ObjectRef,
        plugins: Rc<dyn PluginDirectory>,
        config: EngineConfig,
        hooks: &LifecycleHooks,
    ) -> Self {
        let registry = Self::new(root, plugins, config);
        info!(target: REGISTRY_TARGET, version = VERSION, "interpose {VERSION} loaded");
        hooks.call_all(LOADED_EVENT, &registry);
        registry
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Library version string.
    #[must_use]
    pub const fn version(&self) -> &'static str {
        VERSION
    }

    /// Every interceptor kind, in dispatch order.
    #[must_use]
    pub const fn kinds(&self) -> [InterceptorKind; 3] {
        InterceptorKind::ALL
    }

    /// Whether unregistering can restore original values.
    #[must_use]
    pub fn properties_configurable(&self) -> bool {
        self.state.properties_configurable
    }

    /// Whether diagnostic rate limiting is disabled.
    #[must_use]
    pub fn debug(&self) -> bool {
        self.state.debug.get()
    }

    /// Toggles debug diagnostics.
    pub fn set_debug(&self, enabled: bool) {
        self.state.debug.set(enabled);
    }

    /// Always `false`: this is the full engine, not the fallback shim.
    #[must_use]
    pub const fn is_shim(&self) -> bool {
        false
    }

    /// Always `true`: a live registry means the engine is active.
    #[must_use]
    pub const fn module_active(&self) -> bool {
        true
    }

    /// The plugin directory owners are validated against.
    #[must_use]
    pub fn plugins(&self) -> Rc<dyn PluginDirectory> {
        Rc::clone(&self.state.plugins)
    }

    /// Snapshot of the chain reachable through `target`.
    #[must_use]
    pub fn chain(&self, target: &str) -> Option<ChainInfo> {
        self.state.find(target).map(|chain| ChainInfo::of(&chain))
    }

    /// Number of live chains.
    #[must_use]
    pub fn chain_count(&self) -> usize {
        self.state.chains.borrow().len()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    fn validate_owner(&self, owner: &str) -> Result<(), InterposeError> {
        let invalid = |reason: &str| InterposeError::InvalidOwner {
            owner: owner.to_owned(),
            reason: reason.to_owned(),
        };
        if owner == ENGINE_ID {
            return Err(invalid("the engine cannot register interceptors"));
        }
        match self.state.plugins.lookup(owner) {
            None => Err(invalid("unknown plugin")),
            Some(info) if !info.active => Err(invalid("plugin is not active")),
            Some(_) => Ok(()),
        }
    }

    /// Registers `interceptor` for `owner` on the method at `target`.
    ///
    /// `target` is a dotted path from the root scope, for example
    /// `"Token.prototype.draw"`. The chain is created and its accessor
    /// installed on first use.
    ///
    /// # Errors
    ///
    /// - [`InterposeError::InvalidOwner`] for unknown, inactive, or reserved
    ///   owners.
    /// - [`InterposeError::InvalidArgument`] for a chained interceptor that
    ///   claims the override kind.
    /// - [`InterposeError::UnresolvedTarget`] when the path does not resolve.
    /// - [`InterposeError::DuplicateRegistration`] when `owner` already has an
    ///   interceptor on the target.
    /// - [`InterposeError::AlreadyOverridden`] for a second override.
    /// - [`InterposeError::NotConfigurable`] when the property is frozen.
    pub fn register(
        &self,
        owner: &str,
        target: &str,
        interceptor: Interceptor,
    ) -> Result<(), InterposeError> {
        self.validate_owner(owner)?;
        interceptor.validate()?;
        let kind = interceptor.kind();

        let (object, property) = resolve_path(&self.state.root, target)?;
        let chain = DispatchChain::attach(&object, &property, target, Rc::downgrade(&self.state))?;
        chain.register(owner, target, interceptor)?;
        self.state.track(&chain);

        info!(
            target: REGISTRY_TARGET,
            owner,
            target_name = target,
            %kind,
            "registered interceptor for '{target}' by '{owner}' with kind {kind}"
        );
        Ok(())
    }

    /// Removes `owner`'s interceptor from `target`.
    ///
    /// When the chain becomes empty the accessor is removed and the original
    /// value written back, unless accessors were installed non-configurable.
    ///
    /// # Errors
    ///
    /// Returns [`InterposeError::InvalidOwner`] for invalid owners,
    /// [`InterposeError::NotFound`] when nothing matches and
    /// `fail_if_missing` is set, or [`InterposeError::NotConfigurable`] when
    /// the original cannot be restored.
    pub fn unregister(
        &self,
        owner: &str,
        target: &str,
        fail_if_missing: bool,
    ) -> Result<(), InterposeError> {
        self.validate_owner(owner)?;
        let missing = || {
            if fail_if_missing {
                Err(InterposeError::NotFound {
                    owner: owner.to_owned(),
                    target: target.to_owned(),
                })
            } else {
                Ok(())
            }
        };

        let Some(chain) = self.state.find(target) else {
            return missing();
        };
        if !chain.has_owner(owner) {
            return missing();
        }
        self.state.evict(&chain, owner)
    }

    /// Removes every interceptor registered by `owner`, across all chains.
    ///
    /// A chain that cannot be restored keeps the owner's registration; the
    /// remaining chains are still cleared.
    ///
    /// # Errors
    ///
    /// Returns [`InterposeError::InvalidOwner`] for invalid owners, or the
    /// first failure to restore an emptied chain.
    pub fn clear_module(&self, owner: &str) -> Result<(), InterposeError> {
        self.validate_owner(owner)?;
        let chains: Vec<Rc<DispatchChain>> = self.state.chains.borrow().clone();
        let mut first_error = None;
        for chain in chains.iter().filter(|chain| chain.has_owner(owner)) {
            if let Err(err) = self.state.evict(chain, owner) {
                warn!(
                    target: REGISTRY_TARGET,
                    owner,
                    target_name = %chain.display_name(),
                    error = %err,
                    "failed to clear interceptor"
                );
                first_error.get_or_insert(err);
            }
        }
        info!(target: REGISTRY_TARGET, owner, "cleared all interceptors by '{owner}'");
        first_error.map_or(Ok(()), Err)
    }

    /// Forcibly empties and uninstalls the chain for `target`, regardless of
    /// owner. Intended for administration and tests.
    ///
    /// # Errors
    ///
    /// Returns [`InterposeError::ChainNotFound`] when no chain answers to
    /// `target`, or [`InterposeError::NotConfigurable`] when the accessor
    /// cannot be removed.
    pub fn clear(&self, target: &str) -> Result<(), InterposeError> {
        let chain = self
            .state
            .find(target)
            .ok_or_else(|| InterposeError::ChainNotFound {
                target: target.to_owned(),
            })?;
        let removed = chain.clear()?;
        self.state.untrack(&chain);
        info!(
            target: REGISTRY_TARGET,
            target_name = target,
            removed,
            "cleared all interceptors for '{target}'"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests;
