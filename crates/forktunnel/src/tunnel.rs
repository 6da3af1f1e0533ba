//! The tunnel orchestrator.
//!
//! Lifecycle: `Unsplit → Split(Parent | Child) → Closed`. Dispatchers are
//! registered while unsplit; the host then forks and calls [`Tunnel::split`]
//! on both sides. From that point any registered event raised on either side
//! is captured by the relay hook, framed, written to the bridge, and
//! advertised to the peer; a drain on the peer reads, decodes, and
//! redispatches it locally with the relay hook detached for the duration, so
//! a relayed event never bounces back across the channel.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::Encoder;
use uuid::Uuid;

use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::{DispatcherIndex, Envelope};
use crate::bridge::transport::BridgeChannel;
use crate::dispatch::{Dispatcher, DispatcherHandle, DispatcherRegistry, Listener, Subscription};
use crate::error::{Error, Result};
use crate::event::{EventCodec, JsonEventCodec};
use crate::identity::{ProcessIdentity, Role};
use crate::kernel::Kernel;
use crate::notify::NotificationChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unsplit,
    Split,
    Closed,
}

/// Tunnel construction knobs. The defaults suit the common case: origin is
/// the calling process, the rendezvous lives under the temp dir, and the
/// token is freshly generated (the fork carries it to the other side).
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    /// Base directory for the rendezvous sockets.
    pub rendezvous_dir: Option<PathBuf>,
    /// Rendezvous token; override when the two sides cannot inherit one.
    pub token: Option<String>,
    /// Identity recorded as the origin (the pre-split process).
    pub origin: Option<ProcessIdentity>,
}

/// Attached relay hook for one registered dispatcher: the callback itself
/// plus the names and priorities it was attached under, so the loopback
/// guard can detach and reattach it faithfully.
struct HookSet<E> {
    listener: Listener<E>,
    events: Vec<(String, i32)>,
}

struct Inner<E, C> {
    origin: Cell<ProcessIdentity>,
    state: Cell<Lifecycle>,
    /// Mutual-exclusion flag: relay operations are non-reentrant.
    busy: Cell<bool>,
    bridge: RefCell<Option<BridgeChannel>>,
    kernel: RefCell<Option<Kernel>>,
    registry: RefCell<DispatcherRegistry<E>>,
    hooks: RefCell<Vec<HookSet<E>>>,
    notify: NotificationChannel,
    codec: C,
}

struct BusyReset<'a>(&'a Cell<bool>);

impl Drop for BusyReset<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// A cross-process event tunnel.
///
/// Cloning yields another handle to the same tunnel, which is how listeners
/// or reactors get their own reference.
pub struct Tunnel<E, C = JsonEventCodec> {
    inner: Rc<Inner<E, C>>,
}

impl<E, C> Clone for Tunnel<E, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E> Tunnel<E, JsonEventCodec>
where
    E: Serialize + DeserializeOwned + 'static,
{
    /// Tunnel with the JSON payload codec and default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(TunnelConfig::default())
    }

    pub fn with_config(config: TunnelConfig) -> Result<Self> {
        Self::with_codec(config, JsonEventCodec)
    }
}

impl<E, C> Tunnel<E, C>
where
    E: 'static,
    C: EventCodec<E> + 'static,
{
    /// Tunnel with a custom payload codec.
    pub fn with_codec(config: TunnelConfig, codec: C) -> Result<Self> {
        let origin = config.origin.unwrap_or_else(ProcessIdentity::current);
        let token = config
            .token
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let base = config.rendezvous_dir.unwrap_or_else(std::env::temp_dir);
        let dir = base.join(format!("forktunnel-{token}"));

        let bridge = BridgeChannel::create()?;
        let notify = NotificationChannel::new(dir, origin)?;
        tracing::debug!(origin = %origin, token = %token, "Created tunnel");
        Ok(Self::assemble(origin, bridge, notify, codec))
    }

    fn assemble(
        origin: ProcessIdentity,
        bridge: BridgeChannel,
        notify: NotificationChannel,
        codec: C,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                origin: Cell::new(origin),
                state: Cell::new(Lifecycle::Unsplit),
                busy: Cell::new(false),
                bridge: RefCell::new(Some(bridge)),
                kernel: RefCell::new(None),
                registry: RefCell::new(DispatcherRegistry::new()),
                hooks: RefCell::new(Vec::new()),
                notify,
                codec,
            }),
        }
    }

    /// Attach the relay hook to `dispatcher` for each event of interest and
    /// append the dispatcher to the registry. Legal only before the split;
    /// registration order across calls is the wire identity of the
    /// dispatcher, so both sides must register identically — which they do
    /// for free when registration happens before the fork.
    pub fn register_listener(
        &self,
        dispatcher: &DispatcherHandle<E>,
        events: impl IntoIterator<Item = impl Into<Subscription>>,
    ) -> Result<DispatcherIndex> {
        let inner = &self.inner;
        if inner.state.get() != Lifecycle::Unsplit {
            return Err(Error::AlreadyStarted);
        }
        let index = inner.registry.borrow_mut().push(Rc::clone(dispatcher))?;

        let weak = Rc::downgrade(inner);
        let hook: Listener<E> = Rc::new(move |event, name| match weak.upgrade() {
            Some(inner) => inner.relay_out(event, name, index),
            None => Ok(()),
        });

        let mut attached = Vec::new();
        for subscription in events {
            let subscription = subscription.into();
            dispatcher.add_listener(&subscription.name, hook.clone(), subscription.priority);
            attached.push((subscription.name, subscription.priority));
        }
        let count = attached.len();
        inner.hooks.borrow_mut().push(HookSet {
            listener: hook,
            events: attached,
        });
        tracing::debug!(index = %index, events = count, "Registered dispatcher");
        Ok(index)
    }

    /// Pick this side's role. Call immediately after the fork, on both
    /// sides. The child binds its own rendezvous address and announces
    /// itself to the parent (the handshake); the parent learns the child's
    /// identity from that first record.
    pub fn split(&self) -> Result<Role> {
        self.split_as(ProcessIdentity::current())
    }

    /// Explicit-identity form of [`split`](Self::split).
    pub fn split_as(&self, current: ProcessIdentity) -> Result<Role> {
        self.inner.split_as(current)
    }

    /// Rebind the recorded origin identity. For hosts that re-parent (e.g.
    /// daemonize) between tunnel construction and the real split. Legal only
    /// before the split.
    pub fn reset_origin(&self) -> Result<()> {
        self.reset_origin_as(ProcessIdentity::current())
    }

    pub fn reset_origin_as(&self, identity: ProcessIdentity) -> Result<()> {
        let inner = &self.inner;
        if inner.state.get() != Lifecycle::Unsplit {
            return Err(Error::AlreadyStarted);
        }
        inner.notify.rebind(identity, true)?;
        inner.origin.set(identity);
        tracing::debug!(origin = %identity, "Origin identity rebound");
        Ok(())
    }

    /// The outbound hook. Attached hooks call this with their registry
    /// index; hosts relaying by hand may call it directly. Dropped silently
    /// while the opponent identity is unknown.
    pub fn on_event(&self, event: &E, event_name: &str, dispatcher: DispatcherIndex) -> Result<()> {
        self.inner.relay_out(event, event_name, dispatcher)
    }

    /// Process queued notifications: record a handshake, or read and
    /// redispatch one envelope per record. Non-blocking. Returns the number
    /// of events dispatched locally.
    pub fn drain(&self) -> Result<usize> {
        self.inner.drain()
    }

    /// Park until the peer advertises data or `timeout` elapses, then
    /// drain. `None` parks indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<usize> {
        if self.inner.state.get() != Lifecycle::Split {
            return Ok(0);
        }
        if self.inner.notify.wait_readable(timeout)? {
            self.inner.drain()
        } else {
            Ok(0)
        }
    }

    /// Consume the wake flag set by the notification signal. For hosts that
    /// check between units of their own work instead of parking.
    pub fn notified(&self) -> bool {
        self.inner.notify.take_wake()
    }

    /// Descriptor of the rendezvous socket, for hosts that integrate the
    /// drain into their own reactor. Valid once this side has split (the
    /// child rebinds at split time).
    pub fn notification_fd(&self) -> RawFd {
        self.inner.notify.as_raw_fd()
    }

    /// This side's role, once split.
    pub fn role(&self) -> Option<Role> {
        self.inner.kernel.borrow().as_ref().map(Kernel::role)
    }

    /// The peer's identity, once known.
    pub fn opponent(&self) -> Option<ProcessIdentity> {
        self.inner.kernel.borrow().as_ref().and_then(Kernel::opponent)
    }

    /// The recorded origin identity.
    pub fn origin(&self) -> ProcessIdentity {
        self.inner.origin.get()
    }

    /// Tear down this side: the owned endpoint is closed and further relay
    /// operations become silent no-ops.
    pub fn close(&self) {
        self.inner.state.set(Lifecycle::Closed);
        *self.inner.kernel.borrow_mut() = None;
        *self.inner.bridge.borrow_mut() = None;
        tracing::debug!("Tunnel closed");
    }

    #[cfg(test)]
    fn linked(
        dir: &std::path::Path,
        codec_a: C,
        codec_b: C,
        origin: ProcessIdentity,
        secondary: ProcessIdentity,
    ) -> Result<(Self, Self)> {
        let bridge_a = BridgeChannel::create()?;
        let bridge_b = bridge_a
            .try_clone()
            .map_err(|source| Error::ChannelCreation { source })?;
        let notify_a = NotificationChannel::new(dir.to_path_buf(), origin)?;
        let notify_b = NotificationChannel::new(dir.to_path_buf(), secondary)?;
        Ok((
            Self::assemble(origin, bridge_a, notify_a, codec_a),
            Self::assemble(origin, bridge_b, notify_b, codec_b),
        ))
    }
}

impl<E, C> Inner<E, C>
where
    E: 'static,
    C: EventCodec<E>,
{
    fn split_as(&self, current: ProcessIdentity) -> Result<Role> {
        if self.state.get() != Lifecycle::Unsplit {
            return Err(Error::AlreadyStarted);
        }
        let Some(bridge) = self.bridge.borrow_mut().take() else {
            return Err(Error::AlreadyStarted);
        };
        let origin = self.origin.get();
        let role = Role::select(current, origin);
        let kernel = match role {
            Role::Parent => Kernel::parent(bridge.retain(Role::Parent)),
            Role::Child => {
                // The inherited copy of the origin's rendezvous address goes
                // back to the parent; bind our own before announcing it.
                self.notify.rebind(current, false)?;
                Kernel::child(bridge.retain(Role::Child), origin)
            }
        };
        *self.kernel.borrow_mut() = Some(kernel);
        self.state.set(Lifecycle::Split);
        if role == Role::Child {
            self.notify.notify(origin);
        }
        tracing::debug!(role = ?role, origin = %origin, current = %current, "Tunnel split");
        Ok(role)
    }

    fn relay_out(&self, event: &E, name: &str, index: DispatcherIndex) -> Result<()> {
        let opponent = {
            let kernel = self.kernel.borrow();
            match kernel.as_ref() {
                None => {
                    tracing::trace!(event = name, "Tunnel not split; dropping event");
                    return Ok(());
                }
                Some(kernel) => match kernel.opponent() {
                    None => {
                        tracing::trace!(event = name, "Opponent not yet known; dropping event");
                        return Ok(());
                    }
                    Some(opponent) => opponent,
                },
            }
        };

        if self.registry.borrow().get(index).is_none() {
            return Err(Error::UnregisteredDispatcher {
                index: index.as_u16(),
            });
        }

        let payload = self
            .codec
            .encode(name, event)
            .map_err(|source| Error::EventEncode {
                name: name.to_string(),
                source,
            })?;
        let envelope = Envelope::new(name, payload, index);
        let mut frame = BytesMut::new();
        EnvelopeCodec::new()
            .encode(envelope, &mut frame)
            .map_err(|source| Error::WriteFailure { source })?;

        {
            let kernel = self.kernel.borrow();
            let Some(kernel) = kernel.as_ref() else {
                return Ok(());
            };
            kernel.send_frame(&frame)?;
        }
        self.notify.notify(opponent);
        tracing::trace!(event = name, dispatcher = %index, bytes = frame.len(), "Relayed event");
        Ok(())
    }

    fn drain(&self) -> Result<usize> {
        if self.state.get() != Lifecycle::Split {
            return Ok(0);
        }
        if self.busy.replace(true) {
            tracing::trace!("Relay busy; leaving records queued");
            return Ok(0);
        }
        let _reset = BusyReset(&self.busy);

        self.notify.take_wake();
        let records = self.notify.drain_records();
        let mut dispatched = 0;
        for sender in records {
            let opponent = self.kernel.borrow().as_ref().and_then(Kernel::opponent);
            match opponent {
                None => {
                    if let Some(kernel) = self.kernel.borrow().as_ref() {
                        kernel.set_opponent(sender);
                    }
                    tracing::debug!(opponent = %sender, "Handshake received");
                }
                Some(_) => {
                    let envelope = {
                        let kernel = self.kernel.borrow();
                        let Some(kernel) = kernel.as_ref() else { break };
                        kernel.recv_envelope()?
                    };
                    match envelope {
                        Some(envelope) => {
                            if self.dispatch_inbound(envelope)? {
                                dispatched += 1;
                            }
                        }
                        None => tracing::trace!("Record with no pending data"),
                    }
                }
            }
        }
        Ok(dispatched)
    }

    fn dispatch_inbound(&self, envelope: Envelope) -> Result<bool> {
        let index = envelope.dispatcher;
        let Some(dispatcher) = self.registry.borrow().get(index) else {
            return Err(Error::UnregisteredDispatcher {
                index: index.as_u16(),
            });
        };
        let Some(event) = self.codec.decode(&envelope.event_name, &envelope.payload) else {
            tracing::debug!(event = %envelope.event_name, "Discarding unrecognizable event");
            return Ok(false);
        };

        let hook = {
            let hooks = self.hooks.borrow();
            hooks.get(index.as_usize()).and_then(|set| {
                set.events
                    .iter()
                    .find(|(name, _)| name == &envelope.event_name)
                    .map(|(_, priority)| (set.listener.clone(), *priority))
            })
        };

        let name = envelope.event_name.as_str();
        let result = match hook {
            Some((listener, priority)) => {
                // Loopback guard: detach our hook so the redispatch cannot
                // be captured and sent back across the channel. Reattached
                // even when a listener fails; the failure then propagates.
                dispatcher.remove_listener(name, &listener);
                let result = dispatcher.dispatch(name, &event);
                dispatcher.add_listener(name, listener, priority);
                result
            }
            None => dispatcher.dispatch(name, &event),
        };
        tracing::trace!(event = name, dispatcher = %index, "Redispatched inbound event");
        result.map(|()| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EventBus;
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
    use serde::Deserialize;
    use std::time::Duration;

    // Above PID_MAX_LIMIT on Linux: the signal nudge always misses, which
    // the delivery contract tolerates; the explicit drains below do the work.
    const SECONDARY: ProcessIdentity = ProcessIdentity::from_raw(0x7fff_0002);

    const SHORT: Option<Duration> = Some(Duration::from_millis(200));

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "event", rename_all = "snake_case")]
    enum TestEvent {
        Ping { n: u32 },
        Pong { n: u32 },
        Mystery { n: u32 },
    }

    /// Writing into a socket whose peer end is gone must surface as an I/O
    /// error, not kill the test run.
    fn ignore_sigpipe() {
        let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGPIPE, &action) }.unwrap();
    }

    fn recorder(seen: &Rc<RefCell<Vec<TestEvent>>>) -> Listener<TestEvent> {
        let seen = Rc::clone(seen);
        Rc::new(move |event: &TestEvent, _name: &str| {
            seen.borrow_mut().push(event.clone());
            Ok(())
        })
    }

    struct Pair<C: EventCodec<TestEvent> + 'static> {
        parent: Tunnel<TestEvent, C>,
        child: Tunnel<TestEvent, C>,
        parent_bus: Rc<EventBus<TestEvent>>,
        child_bus: Rc<EventBus<TestEvent>>,
        parent_seen: Rc<RefCell<Vec<TestEvent>>>,
        child_seen: Rc<RefCell<Vec<TestEvent>>>,
        _dir: tempfile::TempDir,
    }

    /// Two tunnels in one process, wired the way a fork would leave them:
    /// duplicated bridge descriptors, a shared rendezvous, an identical
    /// registry on each side.
    fn build_pair<C: EventCodec<TestEvent> + Clone + 'static>(
        codec: C,
        events: &[&str],
    ) -> Pair<C> {
        let dir = tempfile::tempdir().unwrap();
        let origin = ProcessIdentity::current();
        let (parent, child) = Tunnel::linked(
            &dir.path().join("rv"),
            codec.clone(),
            codec,
            origin,
            SECONDARY,
        )
        .unwrap();

        let parent_seen = Rc::new(RefCell::new(Vec::new()));
        let child_seen = Rc::new(RefCell::new(Vec::new()));

        let parent_bus = Rc::new(EventBus::new());
        let child_bus = Rc::new(EventBus::new());

        // Same registration order on both sides, as a fork would guarantee.
        let parent_handle: DispatcherHandle<TestEvent> = parent_bus.clone();
        let child_handle: DispatcherHandle<TestEvent> = child_bus.clone();
        for name in events {
            parent_bus.add_listener(name, recorder(&parent_seen), 0);
            child_bus.add_listener(name, recorder(&child_seen), 0);
        }
        parent
            .register_listener(&parent_handle, events.iter().copied())
            .unwrap();
        child
            .register_listener(&child_handle, events.iter().copied())
            .unwrap();

        Pair {
            parent,
            child,
            parent_bus,
            child_bus,
            parent_seen,
            child_seen,
            _dir: dir,
        }
    }

    fn split_pair<C: EventCodec<TestEvent> + 'static>(pair: &Pair<C>) {
        assert_eq!(
            pair.parent.split_as(ProcessIdentity::current()).unwrap(),
            Role::Parent
        );
        assert_eq!(pair.child.split_as(SECONDARY).unwrap(), Role::Child);
        // Consume the child's handshake.
        assert_eq!(pair.parent.drain().unwrap(), 0);
        assert_eq!(pair.parent.opponent(), Some(SECONDARY));
    }

    #[test]
    fn ping_crosses_to_the_parent_exactly_once() {
        let pair = build_pair(JsonEventCodec, &["ping"]);
        split_pair(&pair);

        pair.child_bus
            .dispatch("ping", &TestEvent::Ping { n: 1 })
            .unwrap();

        assert_eq!(pair.parent.wait(SHORT).unwrap(), 1);
        assert_eq!(*pair.parent_seen.borrow(), vec![TestEvent::Ping { n: 1 }]);
        // The child saw its own dispatch once and never again.
        assert_eq!(*pair.child_seen.borrow(), vec![TestEvent::Ping { n: 1 }]);

        // Nothing bounces back.
        assert_eq!(pair.child.wait(Some(Duration::from_millis(20))).unwrap(), 0);
        assert_eq!(pair.child_seen.borrow().len(), 1);
        assert_eq!(pair.parent_seen.borrow().len(), 1);
    }

    #[test]
    fn parent_relays_to_the_child_after_the_handshake() {
        let pair = build_pair(JsonEventCodec, &["ping", "pong"]);
        split_pair(&pair);

        pair.parent_bus
            .dispatch("pong", &TestEvent::Pong { n: 9 })
            .unwrap();

        assert_eq!(pair.child.wait(SHORT).unwrap(), 1);
        assert_eq!(*pair.child_seen.borrow(), vec![TestEvent::Pong { n: 9 }]);
    }

    #[test]
    fn events_before_the_handshake_are_dropped_silently() {
        let pair = build_pair(JsonEventCodec, &["ping"]);
        assert_eq!(
            pair.parent.split_as(ProcessIdentity::current()).unwrap(),
            Role::Parent
        );
        assert_eq!(pair.child.split_as(SECONDARY).unwrap(), Role::Child);

        // The parent has not drained the handshake: no opponent, no relay,
        // no error.
        pair.parent_bus
            .dispatch("ping", &TestEvent::Ping { n: 1 })
            .unwrap();

        assert_eq!(pair.child.wait(Some(Duration::from_millis(20))).unwrap(), 0);
        assert!(pair.child_seen.borrow().is_empty());
    }

    #[test]
    fn register_after_split_fails() {
        let pair = build_pair(JsonEventCodec, &["ping"]);
        split_pair(&pair);

        let late: DispatcherHandle<TestEvent> = Rc::new(EventBus::new());
        let err = pair.parent.register_listener(&late, ["late"]).unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
    }

    #[test]
    fn second_split_fails() {
        let pair = build_pair(JsonEventCodec, &["ping"]);
        split_pair(&pair);

        let err = pair
            .parent
            .split_as(ProcessIdentity::current())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
    }

    #[test]
    fn registration_order_is_the_wire_identity() {
        let dir = tempfile::tempdir().unwrap();
        let origin = ProcessIdentity::current();
        let (parent, child) = Tunnel::linked(
            &dir.path().join("rv"),
            JsonEventCodec,
            JsonEventCodec,
            origin,
            SECONDARY,
        )
        .unwrap();

        let first_seen = Rc::new(RefCell::new(Vec::new()));
        let second_seen = Rc::new(RefCell::new(Vec::new()));

        // Two dispatchers per side, registered across separate calls in the
        // same order, as both sides of a fork would have them.
        let parent_first: Rc<EventBus<TestEvent>> = Rc::new(EventBus::new());
        let parent_second: Rc<EventBus<TestEvent>> = Rc::new(EventBus::new());
        parent_first.add_listener("ping", recorder(&first_seen), 0);
        parent_second.add_listener("pong", recorder(&second_seen), 0);
        let child_first: Rc<EventBus<TestEvent>> = Rc::new(EventBus::new());
        let child_second: Rc<EventBus<TestEvent>> = Rc::new(EventBus::new());

        for (tunnel, first, second) in [
            (&parent, &parent_first, &parent_second),
            (&child, &child_first, &child_second),
        ] {
            let first_handle: DispatcherHandle<TestEvent> = first.clone();
            let second_handle: DispatcherHandle<TestEvent> = second.clone();
            assert_eq!(
                tunnel.register_listener(&first_handle, ["ping"]).unwrap(),
                DispatcherIndex::new(0)
            );
            assert_eq!(
                tunnel.register_listener(&second_handle, ["pong"]).unwrap(),
                DispatcherIndex::new(1)
            );
        }

        parent.split_as(origin).unwrap();
        child.split_as(SECONDARY).unwrap();
        parent.drain().unwrap();

        child_second
            .dispatch("pong", &TestEvent::Pong { n: 2 })
            .unwrap();
        child_first
            .dispatch("ping", &TestEvent::Ping { n: 1 })
            .unwrap();

        assert_eq!(parent.wait(SHORT).unwrap(), 2);
        assert_eq!(*first_seen.borrow(), vec![TestEvent::Ping { n: 1 }]);
        assert_eq!(*second_seen.borrow(), vec![TestEvent::Pong { n: 2 }]);
    }

    #[test]
    fn unregistered_dispatcher_index_errors() {
        let pair = build_pair(JsonEventCodec, &["ping"]);
        split_pair(&pair);

        let err = pair
            .parent
            .on_event(&TestEvent::Ping { n: 1 }, "ping", DispatcherIndex::new(9))
            .unwrap_err();
        assert!(matches!(err, Error::UnregisteredDispatcher { index: 9 }));
    }

    #[test]
    fn write_failure_when_the_peer_end_is_gone() {
        ignore_sigpipe();
        let pair = build_pair(JsonEventCodec, &["ping"]);
        split_pair(&pair);

        let Pair {
            parent,
            child,
            parent_bus,
            ..
        } = pair;
        drop(child);

        let err = parent_bus
            .dispatch("ping", &TestEvent::Ping { n: 1 })
            .unwrap_err();
        assert!(matches!(err, Error::WriteFailure { .. }));
        drop(parent);
    }

    #[test]
    fn unknown_event_names_are_discarded_without_dispatch() {
        #[derive(Clone)]
        struct NamedCodec {
            allow: &'static [&'static str],
        }
        impl EventCodec<TestEvent> for NamedCodec {
            fn encode(
                &self,
                name: &str,
                event: &TestEvent,
            ) -> std::result::Result<bytes::Bytes, crate::error::BoxError> {
                JsonEventCodec.encode(name, event)
            }
            fn decode(&self, name: &str, payload: &[u8]) -> Option<TestEvent> {
                if self.allow.contains(&name) {
                    JsonEventCodec.decode(name, payload)
                } else {
                    None
                }
            }
        }

        // Both sides relay "mystery", but the receiving schema only knows
        // "ping" — the envelope crosses and is dropped on arrival.
        let pair = build_pair(NamedCodec { allow: &["ping"] }, &["ping", "mystery"]);
        split_pair(&pair);

        pair.child_bus
            .dispatch("mystery", &TestEvent::Mystery { n: 3 })
            .unwrap();

        assert_eq!(pair.parent.wait(SHORT).unwrap(), 0);
        assert!(pair.parent_seen.borrow().is_empty());
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        let pair = build_pair(JsonEventCodec, &["ping"]);
        split_pair(&pair);

        // A torn frame on the wire: the peer advertised a write that never
        // completed. Drive the internals directly to fabricate it.
        let origin = ProcessIdentity::current();
        pair.child
            .inner
            .kernel
            .borrow()
            .as_ref()
            .unwrap()
            .send_frame(&[0x00, 0x04, b'p'])
            .unwrap();
        pair.child.inner.notify.notify(origin);

        let err = pair.parent.drain().unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope));
    }

    #[test]
    fn close_makes_the_relay_a_silent_no_op() {
        let pair = build_pair(JsonEventCodec, &["ping"]);
        split_pair(&pair);

        pair.parent.close();
        pair.parent_bus
            .dispatch("ping", &TestEvent::Ping { n: 1 })
            .unwrap();
        assert_eq!(pair.parent.drain().unwrap(), 0);
        assert_eq!(pair.child.wait(Some(Duration::from_millis(20))).unwrap(), 0);
    }

    #[test]
    fn reset_origin_moves_the_parent_side() {
        let dir = tempfile::tempdir().unwrap();
        let rebound = ProcessIdentity::from_raw(0x7fff_0003);
        let tunnel: Tunnel<TestEvent> = Tunnel::with_config(TunnelConfig {
            rendezvous_dir: Some(dir.path().to_path_buf()),
            ..TunnelConfig::default()
        })
        .unwrap();

        tunnel.reset_origin_as(rebound).unwrap();
        assert_eq!(tunnel.origin(), rebound);
        assert_eq!(tunnel.split_as(rebound).unwrap(), Role::Parent);

        let err = tunnel.reset_origin_as(rebound).unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
    }

    #[test]
    fn drain_inside_a_listener_is_a_no_op() {
        let pair = build_pair(JsonEventCodec, &["ping"]);
        split_pair(&pair);

        let reentered = Rc::new(Cell::new(None));
        let parent_handle = pair.parent.clone();
        let flag = Rc::clone(&reentered);
        pair.parent_bus.add_listener(
            "ping",
            Rc::new(move |_: &TestEvent, _: &str| {
                flag.set(Some(parent_handle.drain().unwrap()));
                Ok(())
            }),
            100,
        );

        pair.child_bus
            .dispatch("ping", &TestEvent::Ping { n: 1 })
            .unwrap();
        assert_eq!(pair.parent.wait(SHORT).unwrap(), 1);
        // The nested drain found the relay busy and processed nothing.
        assert_eq!(reentered.get(), Some(0));
    }
}
