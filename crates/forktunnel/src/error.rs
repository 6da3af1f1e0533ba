//! Error taxonomy for the tunnel.
//!
//! "No data available" is not an error anywhere in this crate: it is the
//! normal outcome of a notification-driven drain that found nothing to do.
//! Everything below is a genuine fault and propagates to the host unmodified;
//! the tunnel performs no retries and no backoff.

use std::io;

use thiserror::Error;

/// Boxed error for payload-codec and listener failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// The duplex socket pair could not be allocated. Fatal to tunnel
    /// construction; carries the platform error text.
    #[error("could not create a new socket pair: {source}")]
    ChannelCreation {
        #[source]
        source: io::Error,
    },

    /// The notification rendezvous socket could not be set up.
    #[error("could not set up the notification rendezvous: {source}")]
    Rendezvous {
        #[source]
        source: io::Error,
    },

    /// Registration or split was attempted after the tunnel already split.
    #[error("tunnel is already started")]
    AlreadyStarted,

    /// An event was relayed for a dispatcher index this tunnel never
    /// registered. Integration error, not recoverable.
    #[error("dispatcher index {index} is not registered with this tunnel")]
    UnregisteredDispatcher { index: u16 },

    /// More dispatchers than the wire index can address.
    #[error("dispatcher registry is full")]
    RegistryFull,

    /// The payload codec failed to serialize an outbound event.
    #[error("could not encode event '{name}': {source}")]
    EventEncode {
        name: String,
        #[source]
        source: BoxError,
    },

    /// A genuine I/O fault while writing to the owned bridge endpoint.
    #[error("could not write event to the bridge: {source}")]
    WriteFailure {
        #[source]
        source: io::Error,
    },

    /// A genuine I/O fault while reading from the owned bridge endpoint.
    #[error("could not read from the bridge: {source}")]
    StreamRead {
        #[source]
        source: io::Error,
    },

    /// A partially received envelope cannot be completed: the peer signalled
    /// a write but the stream holds less than one whole frame. The two sides
    /// are desynchronized.
    #[error("incomplete envelope on the bridge: stream desynchronized")]
    MalformedEnvelope,

    /// An application listener failed during local redispatch.
    #[error("listener failed: {source}")]
    Listener {
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Wrap an application error for returning from a listener.
    pub fn listener(source: impl Into<BoxError>) -> Self {
        Self::Listener {
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
