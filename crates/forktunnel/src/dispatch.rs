//! The dispatcher capability contract and the dispatcher registry.
//!
//! The tunnel does not implement an event dispatcher; it only requires this
//! contract from the host: attach a listener under a name and priority,
//! detach it again, dispatch by name. [`EventBus`] is a reference
//! implementation used by the tests and demos, and serviceable for hosts
//! that do not bring their own.
//!
//! The tunnel is single-threaded by design, so dispatchers are shared as
//! `Rc` handles and listeners as `Rc` closures; removal matches by callback
//! identity.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::bridge::protocol::DispatcherIndex;
use crate::error::{Error, Result};

/// A listener callback: receives the event and the name it was raised under.
/// The first error aborts the remaining listeners and propagates to the
/// raiser; wrap application failures with [`Error::listener`].
pub type Listener<E> = Rc<dyn Fn(&E, &str) -> Result<()>>;

/// Shared handle under which dispatchers are registered with the tunnel.
pub type DispatcherHandle<E> = Rc<dyn Dispatcher<E>>;

/// The capability the tunnel requires from an event dispatcher.
pub trait Dispatcher<E> {
    /// Attach `listener` under `event_name`. Higher priorities run first.
    fn add_listener(&self, event_name: &str, listener: Listener<E>, priority: i32);

    /// Detach the listener previously attached under `event_name`, matched
    /// by callback identity. Returns whether anything was removed.
    fn remove_listener(&self, event_name: &str, listener: &Listener<E>) -> bool;

    /// Synchronously invoke the listeners attached under `event_name`.
    fn dispatch(&self, event_name: &str, event: &E) -> Result<()>;
}

/// An event name of interest, with the priority the tunnel's relay hook is
/// attached at.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub name: String,
    pub priority: i32,
}

impl Subscription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl From<&str> for Subscription {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Subscription {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<(&str, i32)> for Subscription {
    fn from((name, priority): (&str, i32)) -> Self {
        Self::new(name).with_priority(priority)
    }
}

/// Ordered, stable-indexed list of registered dispatchers.
///
/// The index assigned at registration is the only dispatcher identifier that
/// ever goes on the wire; it stays valid for the tunnel's lifetime. Entries
/// are references, not owners — dispatcher lifetime is the host's business.
pub(crate) struct DispatcherRegistry<E> {
    entries: Vec<DispatcherHandle<E>>,
}

impl<E> DispatcherRegistry<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, dispatcher: DispatcherHandle<E>) -> Result<DispatcherIndex> {
        let index = u16::try_from(self.entries.len()).map_err(|_| Error::RegistryFull)?;
        self.entries.push(dispatcher);
        Ok(DispatcherIndex::new(index))
    }

    pub(crate) fn get(&self, index: DispatcherIndex) -> Option<DispatcherHandle<E>> {
        self.entries.get(index.as_usize()).cloned()
    }
}

struct BusEntry<E> {
    priority: i32,
    seq: u64,
    listener: Listener<E>,
}

/// Reference dispatcher: priority-ordered listeners, stable order among
/// equal priorities (registration order).
///
/// `dispatch` runs over a snapshot, so listeners may attach or detach
/// listeners — including themselves — while a dispatch is in flight.
pub struct EventBus<E> {
    listeners: RefCell<HashMap<String, Vec<BusEntry<E>>>>,
    seq: Cell<u64>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: RefCell::new(HashMap::new()),
            seq: Cell::new(0),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Dispatcher<E> for EventBus<E> {
    fn add_listener(&self, event_name: &str, listener: Listener<E>, priority: i32) {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        let mut listeners = self.listeners.borrow_mut();
        let entries = listeners.entry(event_name.to_string()).or_default();
        entries.push(BusEntry {
            priority,
            seq,
            listener,
        });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    fn remove_listener(&self, event_name: &str, listener: &Listener<E>) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let Some(entries) = listeners.get_mut(event_name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| !Rc::ptr_eq(&entry.listener, listener));
        before != entries.len()
    }

    fn dispatch(&self, event_name: &str, event: &E) -> Result<()> {
        let snapshot: Vec<Listener<E>> = match self.listeners.borrow().get(event_name) {
            Some(entries) => entries.iter().map(|e| e.listener.clone()).collect(),
            None => return Ok(()),
        };
        for listener in snapshot {
            listener(event, event_name)?;
        }
        Ok(())
    }
}
