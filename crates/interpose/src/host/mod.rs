//! Host object model and property interception primitive.
//!
//! Plugins intercept named methods on a shared graph of [`ObjectRef`]s. Each
//! object holds named property slots and an optional prototype it delegates
//! reads to. A slot is either plain data or an *accessor* installed by a
//! dispatch chain: reading an accessor yields a thunk bound to the chain and
//! writing through it lets the chain observe manual reassignment.
//!
//! Everything here is single-threaded (`Rc` and `RefCell`); calls into a
//! method may re-enter the object graph freely because no borrow is held
//! while user code runs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::chain::DispatchChain;
use crate::error::InterposeError;

/// Dynamic value passed to and returned from methods.
pub type Value = serde_json::Value;

type MethodFn = dyn Fn(&ObjectRef, &[Value]) -> Result<Value, InterposeError>;

/// A shareable callable stored in an object property.
///
/// The receiver is the object the method was invoked on, which may be a
/// descendant of the object that holds the property.
#[derive(Clone)]
pub struct Method(Rc<MethodFn>);

impl Method {
    /// Wraps a closure as a method.
    pub fn new(
        body: impl Fn(&ObjectRef, &[Value]) -> Result<Value, InterposeError> + 'static,
    ) -> Self {
        Self(Rc::new(body))
    }

    /// Invokes the method with `receiver` bound as the call target.
    ///
    /// # Errors
    ///
    /// Propagates any error raised by the method body.
    pub fn call(&self, receiver: &ObjectRef, args: &[Value]) -> Result<Value, InterposeError> {
        (self.0)(receiver, args)
    }

    /// Returns `true` when both handles refer to the same callable.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Method(..)")
    }
}

/// The contents of a property.
#[derive(Debug, Clone)]
pub enum Member {
    /// A callable.
    Method(Method),
    /// A nested object, used to reach methods by dotted path.
    Object(ObjectRef),
    /// Plain data.
    Data(Value),
}

impl Member {
    /// Returns the method when this member is callable.
    #[must_use]
    pub const fn as_method(&self) -> Option<&Method> {
        match self {
            Self::Method(method) => Some(method),
            _ => None,
        }
    }

    /// Returns the object when this member is a nested object.
    #[must_use]
    pub const fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }
}

enum Slot {
    Data {
        member: Member,
        configurable: bool,
    },
    Accessor {
        chain: Rc<DispatchChain>,
        configurable: bool,
    },
}

/// An own property as seen by the interception machinery.
pub(crate) enum OwnSlot {
    Data { member: Member, configurable: bool },
    Accessor(Rc<DispatchChain>),
}

struct ObjectData {
    prototype: Option<ObjectRef>,
    slots: RefCell<HashMap<String, Slot>>,
}

/// Reference-counted handle to a host object.
///
/// Equality is identity: two handles are equal when they point at the same
/// object.
#[derive(Clone)]
pub struct ObjectRef(Rc<ObjectData>);

/// Non-owning handle to a host object.
#[derive(Clone)]
pub(crate) struct WeakObjectRef(Weak<ObjectData>);

impl WeakObjectRef {
    pub(crate) fn upgrade(&self) -> Option<ObjectRef> {
        self.0.upgrade().map(ObjectRef)
    }
}

impl Default for ObjectRef {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ObjectRef {}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.own_property_names();
        names.sort();
        f.debug_struct("ObjectRef")
            .field("properties", &names)
            .field("has_prototype", &self.0.prototype.is_some())
            .finish()
    }
}

impl ObjectRef {
    /// Creates an object without a prototype.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an object that delegates reads to `prototype`.
    #[must_use]
    pub fn with_prototype(prototype: &Self) -> Self {
        Self::build(Some(prototype.clone()))
    }

    fn build(prototype: Option<Self>) -> Self {
        Self(Rc::new(ObjectData {
            prototype,
            slots: RefCell::new(HashMap::new()),
        }))
    }

    /// Returns the prototype this object delegates to.
    #[must_use]
    pub fn prototype(&self) -> Option<Self> {
        self.0.prototype.clone()
    }

    /// Defines or replaces an own data property.
    ///
    /// This is a reconfiguration: it bypasses any installed accessor.
    ///
    /// # Errors
    ///
    /// Returns [`InterposeError::NotConfigurable`] when the own property has
    /// been frozen.
    pub fn define(&self, name: &str, member: Member) -> Result<(), InterposeError> {
        let mut slots = self.0.slots.borrow_mut();
        if let Some(existing) = slots.get(name) {
            if !slot_configurable(existing) {
                return Err(not_configurable(name));
            }
        }
        slots.insert(
            name.to_owned(),
            Slot::Data {
                member,
                configurable: true,
            },
        );
        Ok(())
    }

    /// Convenience wrapper defining a method property.
    ///
    /// # Errors
    ///
    /// See [`ObjectRef::define`].
    pub fn define_method(
        &self,
        name: &str,
        body: impl Fn(&Self, &[Value]) -> Result<Value, InterposeError> + 'static,
    ) -> Result<(), InterposeError> {
        self.define(name, Member::Method(Method::new(body)))
    }

    /// Marks an own property non-configurable. Returns `false` when the
    /// object has no such own property.
    pub fn freeze(&self, name: &str) -> bool {
        match self.0.slots.borrow_mut().get_mut(name) {
            Some(Slot::Data { configurable, .. } | Slot::Accessor { configurable, .. }) => {
                *configurable = false;
                true
            }
            None => false,
        }
    }

    /// Returns `true` when the object itself holds the property.
    #[must_use]
    pub fn has_own(&self, name: &str) -> bool {
        self.0.slots.borrow().contains_key(name)
    }

    /// Reads a property, delegating to the prototype when the object does not
    /// hold it. An intercepted property yields the chain's dispatch thunk.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Member> {
        let mut cursor = Some(self.clone());
        while let Some(current) = cursor {
            match current.own_slot(name) {
                Some(OwnSlot::Data { member, .. }) => return Some(member),
                Some(OwnSlot::Accessor(chain)) => return Some(Member::Method(chain.thunk())),
                None => cursor = current.prototype(),
            }
        }
        None
    }

    /// Writes a property.
    ///
    /// When the nearest slot on the prototype chain is an installed accessor
    /// the write is routed to that chain with `self` as the receiver, which
    /// is how manual reassignment of an intercepted method is detected.
    ///
    /// # Errors
    ///
    /// Returns [`InterposeError::NotConfigurable`] when the own property has
    /// been frozen, or any error raised while splicing an accessor.
    pub fn set(&self, name: &str, member: Member) -> Result<(), InterposeError> {
        let mut cursor = Some(self.clone());
        while let Some(current) = cursor {
            match current.own_slot(name) {
                Some(OwnSlot::Accessor(chain)) => return chain.assign(member, self),
                Some(OwnSlot::Data { .. }) => break,
                None => cursor = current.prototype(),
            }
        }
        self.define(name, member)
    }

    /// Reads a property and invokes it with `self` as the receiver.
    ///
    /// # Errors
    ///
    /// Returns [`InterposeError::NotCallable`] when the property is missing
    /// or not a method, otherwise propagates the method's result.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, InterposeError> {
        match self.get(name) {
            Some(Member::Method(method)) => method.call(self, args),
            _ => Err(InterposeError::NotCallable {
                target: name.to_owned(),
            }),
        }
    }

    /// Returns `true` when `self` is `other` or delegates to it.
    #[must_use]
    pub fn inherits_from(&self, other: &Self) -> bool {
        let mut cursor = Some(self.clone());
        while let Some(current) = cursor {
            if current == *other {
                return true;
            }
            cursor = current.prototype();
        }
        false
    }

    fn own_property_names(&self) -> Vec<String> {
        self.0.slots.borrow().keys().cloned().collect()
    }

    pub(crate) fn downgrade(&self) -> WeakObjectRef {
        WeakObjectRef(Rc::downgrade(&self.0))
    }

    pub(crate) fn own_slot(&self, name: &str) -> Option<OwnSlot> {
        self.0.slots.borrow().get(name).map(|slot| match slot {
            Slot::Data {
                member,
                configurable,
            } => OwnSlot::Data {
                member: member.clone(),
                configurable: *configurable,
            },
            Slot::Accessor { chain, .. } => OwnSlot::Accessor(Rc::clone(chain)),
        })
    }

    /// Returns the chain installed directly on this object for `name`.
    pub(crate) fn accessor_chain(&self, name: &str) -> Option<Rc<DispatchChain>> {
        match self.own_slot(name) {
            Some(OwnSlot::Accessor(chain)) => Some(chain),
            _ => None,
        }
    }

    pub(crate) fn install_accessor(
        &self,
        name: &str,
        chain: Rc<DispatchChain>,
        configurable: bool,
    ) -> Result<(), InterposeError> {
        let mut slots = self.0.slots.borrow_mut();
        if let Some(existing) = slots.get(name) {
            if !slot_configurable(existing) {
                return Err(not_configurable(name));
            }
        }
        slots.insert(
            name.to_owned(),
            Slot::Accessor {
                chain,
                configurable,
            },
        );
        Ok(())
    }

    /// Removes an installed accessor and writes `restore` back in its place.
    pub(crate) fn remove_accessor(
        &self,
        name: &str,
        restore: Option<Member>,
    ) -> Result<(), InterposeError> {
        let mut slots = self.0.slots.borrow_mut();
        match slots.get(name) {
            Some(Slot::Accessor {
                configurable: false,
                ..
            }) => return Err(not_configurable(name)),
            Some(Slot::Accessor { .. }) => {
                slots.remove(name);
            }
            _ => {}
        }
        if let Some(member) = restore {
            slots.insert(
                name.to_owned(),
                Slot::Data {
                    member,
                    configurable: true,
                },
            );
        }
        Ok(())
    }
}

const fn slot_configurable(slot: &Slot) -> bool {
    match slot {
        Slot::Data { configurable, .. } | Slot::Accessor { configurable, .. } => *configurable,
    }
}

fn not_configurable(name: &str) -> InterposeError {
    InterposeError::NotConfigurable {
        target: name.to_owned(),
    }
}

/// Resolves a dotted target path such as `"Token.prototype.draw"` against
/// `root`, returning the object that holds the final segment and the
/// property name.
///
/// Every segment but the last must read (with prototype delegation) as a
/// nested object. The final property need not exist yet.
///
/// # Errors
///
/// Returns [`InterposeError::UnresolvedTarget`] for an empty segment or when
/// an intermediate segment is missing or not an object.
///
/// # Example
///
/// ```
/// use interpose::{Member, ObjectRef, resolve_path};
///
/// let root = ObjectRef::new();
/// let token = ObjectRef::new();
/// let prototype = ObjectRef::new();
/// token.define("prototype", Member::Object(prototype.clone())).expect("define");
/// root.define("Token", Member::Object(token)).expect("define");
///
/// let (object, property) = resolve_path(&root, "Token.prototype.draw").expect("resolves");
/// assert_eq!(object, prototype);
/// assert_eq!(property, "draw");
/// ```
pub fn resolve_path(root: &ObjectRef, target: &str) -> Result<(ObjectRef, String), InterposeError> {
    let unresolved = |message: String| InterposeError::UnresolvedTarget {
        target: target.to_owned(),
        message,
    };

    let mut segments: Vec<&str> = target.split('.').collect();
    if segments.iter().any(|segment| segment.trim().is_empty()) {
        return Err(unresolved(String::from("path contains an empty segment")));
    }
    let property = segments
        .pop()
        .ok_or_else(|| unresolved(String::from("path is empty")))?;

    let mut object = root.clone();
    for segment in segments {
        object = match object.get(segment) {
            Some(Member::Object(next)) => next,
            Some(_) => return Err(unresolved(format!("'{segment}' is not an object"))),
            None => return Err(unresolved(format!("'{segment}' does not exist"))),
        };
    }
    Ok((object, property.to_owned()))
}
