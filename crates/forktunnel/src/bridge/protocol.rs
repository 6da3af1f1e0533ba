//! Wire types for the bridge.

use std::fmt;

use bytes::Bytes;

/// Stable handle for a dispatcher registered with the tunnel.
///
/// Assigned in registration order and identical on both sides of the split
/// (the registry is established before the split, so both processes inherit
/// the same copy). This index is the only dispatcher identifier that ever
/// goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatcherIndex(u16);

impl DispatcherIndex {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for DispatcherIndex {
    fn from(index: u16) -> Self {
        Self(index)
    }
}

impl fmt::Display for DispatcherIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The framed unit transmitted across the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Name the event was raised under.
    pub event_name: String,
    /// Opaque serialized form of the application event.
    pub payload: Bytes,
    /// Which registered dispatcher the event belongs to.
    pub dispatcher: DispatcherIndex,
}

impl Envelope {
    pub fn new(event_name: impl Into<String>, payload: Bytes, dispatcher: DispatcherIndex) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
            dispatcher,
        }
    }
}
