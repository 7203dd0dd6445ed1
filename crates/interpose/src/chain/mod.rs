//! Per-method dispatch chains.
//!
//! A [`DispatchChain`] owns every registration contributed to one intercepted
//! property, the accessor installed in that property's slot, and the value
//! that was there before interception began. Each external call walks the
//! registrations by position rather than over a snapshot, so registrations
//! added or removed while a call is in flight (including the automatic
//! removal of a misbehaving passthrough) are observed by the steps that run
//! after the change.
//!
//! The walk order for a receiver is: the registrations of the chain the call
//! entered, then the registrations of each chain installed further up the
//! prototype ancestry (nearest first), then the most-derived original
//! implementation.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, error, info, warn};

use crate::error::InterposeError;
use crate::host::{Member, Method, ObjectRef, OwnSlot, Value, WeakObjectRef};
use crate::interceptor::{Interceptor, InterceptorKind, Next};
use crate::registry::RegistryState;

/// Tracing target for chain dispatch and accessor management.
pub(crate) const CHAIN_TARGET: &str = "interpose::chain";

/// Per-call cursor threaded through one continuation.
pub(crate) struct CallState {
    index: Cell<usize>,
    called: Cell<bool>,
}

impl CallState {
    const fn starting_at(index: usize) -> Self {
        Self {
            index: Cell::new(index),
            called: Cell::new(false),
        }
    }
}

struct Registration {
    id: u64,
    owner: String,
    target: String,
    interceptor: Interceptor,
    conflict_warned: Cell<bool>,
}

impl Registration {
    const fn kind(&self) -> InterceptorKind {
        self.interceptor.kind()
    }
}

/// Owned copy of the fields a walk step needs, taken so no borrow of the
/// registration list is held while plugin code runs.
struct Step {
    id: u64,
    owner: String,
    target: String,
    interceptor: Interceptor,
}

#[derive(Clone)]
enum HandlerTarget {
    Chain(Weak<DispatchChain>),
    Direct(Option<Member>),
    Lookup,
    /// Calls made on `receiver` (or its descendants) go straight to
    /// `previous`; every other receiver falls through to `otherwise`.
    Spliced {
        receiver: WeakObjectRef,
        previous: Option<Member>,
        otherwise: Box<HandlerTarget>,
    },
}

/// Redirectable cell behind every thunk handed out by an accessor read.
struct Handler {
    property: String,
    target: RefCell<HandlerTarget>,
}

impl Handler {
    fn redirect(&self, target: HandlerTarget) {
        *self.target.borrow_mut() = target;
    }

    fn invoke(&self, receiver: &ObjectRef, args: &[Value]) -> Result<Value, InterposeError> {
        let target = self.target.borrow().clone();
        self.dispatch(target, receiver, args)
    }

    fn dispatch(
        &self,
        target: HandlerTarget,
        receiver: &ObjectRef,
        args: &[Value],
    ) -> Result<Value, InterposeError> {
        match target {
            HandlerTarget::Chain(chain) => match chain.upgrade() {
                Some(chain) => chain.walk(None, receiver, args),
                None => receiver.call(&self.property, args),
            },
            HandlerTarget::Direct(previous) => self.call_member(previous, receiver, args),
            HandlerTarget::Lookup => receiver.call(&self.property, args),
            HandlerTarget::Spliced {
                receiver: spliced,
                previous,
                otherwise,
            } => {
                let covered = spliced
                    .upgrade()
                    .is_some_and(|object| receiver.inherits_from(&object));
                if covered {
                    self.call_member(previous, receiver, args)
                } else {
                    self.dispatch(*otherwise, receiver, args)
                }
            }
        }
    }

    fn call_member(
        &self,
        member: Option<Member>,
        receiver: &ObjectRef,
        args: &[Value],
    ) -> Result<Value, InterposeError> {
        match member {
            Some(Member::Method(method)) => method.call(receiver, args),
            _ => Err(InterposeError::NotCallable {
                target: self.property.clone(),
            }),
        }
    }
}

struct Bound {
    handler: Rc<Handler>,
    thunk: Method,
}

impl Bound {
    fn new(chain: Weak<DispatchChain>, property: &str) -> Self {
        let handler = Rc::new(Handler {
            property: property.to_owned(),
            target: RefCell::new(HandlerTarget::Chain(chain)),
        });
        let invoked = Rc::clone(&handler);
        let thunk = Method::new(move |receiver, args| invoked.invoke(receiver, args));
        Self { handler, thunk }
    }
}

/// Ordered interceptors for one intercepted property.
pub(crate) struct DispatchChain {
    object: WeakObjectRef,
    property: String,
    names: RefCell<Vec<String>>,
    original: RefCell<Option<Member>>,
    registrations: RefCell<Vec<Registration>>,
    installed: Cell<bool>,
    bound: RefCell<Bound>,
    warned_manual_wrap: Cell<bool>,
    next_id: Cell<u64>,
    registry: Weak<RegistryState>,
}

impl DispatchChain {
    /// Returns the chain already installed at `object.property`, or builds an
    /// uninstalled chain capturing the property's current own value.
    pub(crate) fn attach(
        object: &ObjectRef,
        property: &str,
        name: &str,
        registry: Weak<RegistryState>,
    ) -> Result<Rc<Self>, InterposeError> {
        let original = match object.own_slot(property) {
            Some(OwnSlot::Accessor(chain)) => {
                chain.add_name(name);
                return Ok(chain);
            }
            Some(OwnSlot::Data {
                configurable: false,
                ..
            }) => {
                return Err(InterposeError::NotConfigurable {
                    target: name.to_owned(),
                });
            }
            Some(OwnSlot::Data { member, .. }) => Some(member),
            None => None,
        };

        let chain = Rc::new_cyclic(|weak| Self {
            object: object.downgrade(),
            property: property.to_owned(),
            names: RefCell::new(Vec::new()),
            original: RefCell::new(original),
            registrations: RefCell::new(Vec::new()),
            installed: Cell::new(false),
            bound: RefCell::new(Bound::new(weak.clone(), property)),
            warned_manual_wrap: Cell::new(false),
            next_id: Cell::new(0),
            registry,
        });
        chain.add_name(name);
        chain.add_name(property);
        Ok(chain)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub(crate) fn display_name(&self) -> String {
        self.names
            .borrow()
            .first()
            .cloned()
            .unwrap_or_else(|| self.property.clone())
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.names.borrow().clone()
    }

    pub(crate) fn answers_to(&self, name: &str) -> bool {
        self.names.borrow().iter().any(|known| known == name)
    }

    pub(crate) fn len(&self) -> usize {
        self.registrations.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.registrations.borrow().is_empty()
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.installed.get()
    }

    pub(crate) fn owners(&self) -> Vec<String> {
        self.registrations
            .borrow()
            .iter()
            .map(|registration| registration.owner.clone())
            .collect()
    }

    pub(crate) fn kinds(&self) -> Vec<InterceptorKind> {
        self.registrations
            .borrow()
            .iter()
            .map(Registration::kind)
            .collect()
    }

    pub(crate) fn warned_owners(&self) -> Vec<String> {
        self.registrations
            .borrow()
            .iter()
            .filter(|registration| registration.conflict_warned.get())
            .map(|registration| registration.owner.clone())
            .collect()
    }

    pub(crate) fn has_owner(&self, owner: &str) -> bool {
        self.registrations
            .borrow()
            .iter()
            .any(|registration| registration.owner == owner)
    }

    pub(crate) fn original(&self) -> Option<Member> {
        self.original.borrow().clone()
    }

    /// The dispatch thunk currently handed out by accessor reads.
    pub(crate) fn thunk(&self) -> Method {
        self.bound.borrow().thunk.clone()
    }

    fn add_name(&self, name: &str) {
        let mut names = self.names.borrow_mut();
        if !names.iter().any(|known| known == name) {
            names.push(name.to_owned());
        }
    }

    fn debug(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.debug())
    }

    fn configurable_accessors(&self) -> bool {
        self.registry
            .upgrade()
            .is_none_or(|registry| registry.properties_configurable())
    }

    fn object(&self) -> Result<ObjectRef, InterposeError> {
        self.object
            .upgrade()
            .ok_or_else(|| InterposeError::UnresolvedTarget {
                target: self.display_name(),
                message: String::from("the object holding the method no longer exists"),
            })
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Adds a registration and installs the accessor if needed.
    pub(crate) fn register(
        self: &Rc<Self>,
        owner: &str,
        target: &str,
        interceptor: Interceptor,
    ) -> Result<(), InterposeError> {
        {
            let registrations = self.registrations.borrow();
            if registrations.iter().any(|existing| existing.owner == owner) {
                return Err(InterposeError::DuplicateRegistration {
                    owner: owner.to_owned(),
                    target: target.to_owned(),
                });
            }
            if interceptor.kind() == InterceptorKind::Override {
                if let Some(existing) = registrations
                    .iter()
                    .find(|existing| existing.kind() == InterceptorKind::Override)
                {
                    return Err(InterposeError::AlreadyOverridden {
                        owner: owner.to_owned(),
                        target: target.to_owned(),
                        conflicting_owner: existing.owner.clone(),
                    });
                }
            }
        }

        self.add_name(target);
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        {
            let mut registrations = self.registrations.borrow_mut();
            // Newest first among equal weights; the sort is stable.
            registrations.insert(
                0,
                Registration {
                    id,
                    owner: owner.to_owned(),
                    target: target.to_owned(),
                    interceptor,
                    conflict_warned: Cell::new(false),
                },
            );
            registrations.sort_by_key(|registration| registration.kind().weight());
        }

        if let Err(err) = self.install() {
            self.registrations
                .borrow_mut()
                .retain(|registration| registration.id != id);
            return Err(err);
        }
        Ok(())
    }

    /// Removes the owner's registration. Returns `true` when the chain became
    /// empty and was uninstalled, restoring the original value.
    pub(crate) fn unregister(self: &Rc<Self>, owner: &str) -> Result<bool, InterposeError> {
        let position = self
            .registrations
            .borrow()
            .iter()
            .position(|registration| registration.owner == owner)
            .ok_or_else(|| InterposeError::NotFound {
                owner: owner.to_owned(),
                target: self.display_name(),
            })?;
        let removed = self.registrations.borrow_mut().remove(position);

        if !self.is_empty() || !self.configurable_accessors() {
            return Ok(false);
        }
        if let Err(err) = self.uninstall() {
            self.registrations.borrow_mut().insert(position, removed);
            return Err(err);
        }
        Ok(true)
    }

    /// Drops every registration and uninstalls the accessor. Returns the
    /// number of registrations removed.
    pub(crate) fn clear(self: &Rc<Self>) -> Result<usize, InterposeError> {
        self.uninstall()?;
        let removed = self.registrations.take().len();
        Ok(removed)
    }

    /// Installs the accessor on the chain's object.
    pub(crate) fn install(self: &Rc<Self>) -> Result<(), InterposeError> {
        if self.installed.get() {
            return Ok(());
        }
        let object = self.object()?;
        object.install_accessor(&self.property, Rc::clone(self), self.configurable_accessors())?;
        self.installed.set(true);

        if self.debug() {
            info!(target: CHAIN_TARGET, target_name = %self.display_name(), "wrapped method");
        } else {
            debug!(target: CHAIN_TARGET, target_name = %self.display_name(), "wrapped method");
        }
        Ok(())
    }

    /// Removes the accessor and writes the original value back.
    ///
    /// Thunks obtained while the chain was installed keep working: they fall
    /// back to reading the property afresh on their receiver.
    fn uninstall(self: &Rc<Self>) -> Result<(), InterposeError> {
        if !self.installed.get() {
            return Ok(());
        }
        if let Some(object) = self.object.upgrade() {
            object.remove_accessor(&self.property, self.original())?;
        }
        self.retire_handler(HandlerTarget::Lookup);
        self.installed.set(false);

        if self.debug() {
            info!(target: CHAIN_TARGET, target_name = %self.display_name(), "unwrapped method");
        } else {
            debug!(target: CHAIN_TARGET, target_name = %self.display_name(), "unwrapped method");
        }
        Ok(())
    }

    /// Points the current handler at `target` and starts a fresh one bound
    /// to this chain.
    fn retire_handler(self: &Rc<Self>, target: HandlerTarget) {
        let fresh = Bound::new(Rc::downgrade(self), &self.property);
        let retired = self.bound.replace(fresh);
        retired.handler.redirect(target);
    }

    /// Like [`Self::retire_handler`], but only calls made on `receiver` are
    /// diverted to `previous`; the rest keep their current target.
    fn splice_handler(self: &Rc<Self>, receiver: &ObjectRef, previous: Option<Member>) {
        let fresh = Bound::new(Rc::downgrade(self), &self.property);
        let retired = self.bound.replace(fresh);
        let otherwise = retired.handler.target.borrow().clone();
        retired.handler.redirect(HandlerTarget::Spliced {
            receiver: receiver.downgrade(),
            previous,
            otherwise: Box::new(otherwise),
        });
    }

    // -----------------------------------------------------------------------
    // Manual reassignment
    // -----------------------------------------------------------------------

    /// Handles a write through the accessor.
    ///
    /// Writing on the chain's own object replaces the original; writing on a
    /// descendant splices a new chain onto that descendant whose original is
    /// the written member, so the registrations here still wrap it.
    pub(crate) fn assign(
        self: &Rc<Self>,
        member: Member,
        receiver: &ObjectRef,
    ) -> Result<(), InterposeError> {
        let object = self.object()?;
        if *receiver != object {
            let name = format!("instanceof {}", self.display_name());
            let previous = self.base_method(receiver).ok().map(Member::Method);
            let local = Self::attach(receiver, &self.property, &name, self.registry.clone())?;
            local.install()?;
            local.replace_original(member, true);
            // Thunks read from here before the write keep reaching, for this
            // receiver, the implementation it resolved to at that point.
            self.splice_handler(receiver, previous);
            if let Some(registry) = self.registry.upgrade() {
                registry.track(&local);
            }
            return Ok(());
        }

        self.replace_original(member, false);
        Ok(())
    }

    fn replace_original(self: &Rc<Self>, member: Member, reuse_handler: bool) {
        if !reuse_handler {
            // Thunks captured before the write keep calling what they wrapped.
            let previous = self.original();
            self.retire_handler(HandlerTarget::Direct(previous));
        }
        *self.original.borrow_mut() = Some(member);

        let already_warned = self.warned_manual_wrap.replace(true);
        if self.debug() || !already_warned {
            warn!(
                target: CHAIN_TARGET,
                target_name = %self.display_name(),
                "detected manual wrapping of '{}', which could cause compatibility issues \
                 with plugins that bypass the registry",
                self.display_name()
            );
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn step_at(&self, index: usize) -> Option<Step> {
        self.registrations
            .borrow()
            .get(index)
            .map(|registration| Step {
                id: registration.id,
                owner: registration.owner.clone(),
                target: registration.target.clone(),
                interceptor: registration.interceptor.clone(),
            })
    }

    /// Walks the chain from the cursor in `state` (or from the start).
    pub(crate) fn walk(
        self: &Rc<Self>,
        state: Option<&CallState>,
        receiver: &ObjectRef,
        args: &[Value],
    ) -> Result<Value, InterposeError> {
        let index = state.map_or(0, |current| {
            current.called.set(true);
            current.index.get()
        });

        let Some(step) = self.step_at(index) else {
            return self.finish(receiver, args);
        };

        let (kind, callback) = match &step.interceptor {
            Interceptor::Terminal(callback) => return callback(receiver, args),
            Interceptor::Chained { kind, callback } => (*kind, Rc::clone(callback)),
        };

        let next_state = CallState::starting_at(index + 1);
        let next = Next::chained(self, receiver, &step.target, &next_state);
        let result = callback(&next, receiver, args)?;
        if next_state.called.get() {
            return Ok(result);
        }

        if kind == InterceptorKind::Passthrough {
            self.report_violation(&step);
            self.evict(&step);
            // The offender is gone; resume at its old position so this call
            // still produces what the remaining chain would have. This holds
            // for the last registration too: its caller gets the original's
            // result, not the value the offender returned.
            next_state.index.set(index);
            return next.call(args);
        }

        if next_state.index.get() < self.len() {
            self.report_conflict(&step);
        }
        Ok(result)
    }

    /// Runs once the registrations are exhausted.
    fn finish(self: &Rc<Self>, receiver: &ObjectRef, args: &[Value]) -> Result<Value, InterposeError> {
        if let Some(parent) = self.parent_chain() {
            return parent.walk(None, receiver, args);
        }
        self.base_method(receiver)?.call(receiver, args)
    }

    /// Nearest chain for the same property installed on the prototype
    /// ancestry of this chain's object.
    fn parent_chain(&self) -> Option<Rc<Self>> {
        let object = self.object.upgrade()?;
        let mut cursor = object.prototype();
        while let Some(current) = cursor {
            if let Some(chain) = current.accessor_chain(&self.property) {
                return Some(chain);
            }
            cursor = current.prototype();
        }
        None
    }

    /// Most-derived original implementation visible from `receiver`.
    fn base_method(&self, receiver: &ObjectRef) -> Result<Method, InterposeError> {
        let mut cursor = Some(receiver.clone());
        while let Some(current) = cursor {
            match current.own_slot(&self.property) {
                Some(OwnSlot::Accessor(chain)) => {
                    if let Some(Member::Method(method)) = chain.original() {
                        return Ok(method);
                    }
                }
                Some(OwnSlot::Data {
                    member: Member::Method(method),
                    ..
                }) => return Ok(method),
                _ => {}
            }
            cursor = current.prototype();
        }

        match self.original() {
            Some(Member::Method(method)) => Ok(method),
            _ => Err(InterposeError::NotCallable {
                target: self.display_name(),
            }),
        }
    }

    fn report_violation(&self, step: &Step) {
        error!(
            target: CHAIN_TARGET,
            owner = %step.owner,
            target_name = %step.target,
            "the interceptor for '{}' registered by '{}' with kind PASSTHROUGH did not chain \
             the call to the next interceptor; it will be unregistered",
            step.target,
            step.owner
        );
    }

    /// Removes a misbehaving registration, going through the registry when
    /// one is still alive so an emptied chain is forgotten.
    fn evict(self: &Rc<Self>, step: &Step) {
        let outcome = match self.registry.upgrade() {
            Some(registry) => registry.evict(self, &step.owner),
            None => self.unregister(&step.owner).map(|_| ()),
        };
        if let Err(err) = outcome {
            error!(
                target: CHAIN_TARGET,
                owner = %step.owner,
                target_name = %step.target,
                error = %err,
                "failed to unregister misbehaving interceptor"
            );
        }
    }

    fn report_conflict(&self, step: &Step) {
        let registrations = self.registrations.borrow();
        let Some(position) = registrations
            .iter()
            .position(|registration| registration.id == step.id)
        else {
            return;
        };
        let Some(registration) = registrations.get(position) else {
            return;
        };
        let already_warned = registration.conflict_warned.replace(true);
        if already_warned && !self.debug() {
            return;
        }

        let affected: Vec<&str> = registrations
            .iter()
            .skip(position + 1)
            .filter(|later| later.kind() != InterceptorKind::Passthrough && later.owner != step.owner)
            .map(|later| later.owner.as_str())
            .collect();
        warn!(
            target: CHAIN_TARGET,
            owner = %step.owner,
            target_name = %step.target,
            affected = ?affected,
            "possible conflict detected between '{}' and [{}]; the former did not chain the \
             interceptor for '{}'",
            step.owner,
            affected.join(", "),
            step.target
        );
    }
}
