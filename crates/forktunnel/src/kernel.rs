//! Role-specific owner of the retained bridge endpoint.
//!
//! After the split exactly one kernel exists per process. It holds the one
//! endpoint that side is allowed to touch, the inbound read buffer, and the
//! opponent identity slot. The parent starts with the opponent unknown and
//! learns it from the child's handshake; the child knows it from birth — it
//! is the recorded origin identity.

use std::cell::{Cell, RefCell};

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::Envelope;
use crate::bridge::transport::Endpoint;
use crate::error::{Error, Result};
use crate::identity::{ProcessIdentity, Role};

pub(crate) struct Kernel {
    role: Role,
    endpoint: RefCell<Endpoint>,
    read_buf: RefCell<BytesMut>,
    opponent: Cell<Option<ProcessIdentity>>,
}

impl Kernel {
    pub(crate) fn parent(endpoint: Endpoint) -> Self {
        Self {
            role: Role::Parent,
            endpoint: RefCell::new(endpoint),
            read_buf: RefCell::new(BytesMut::new()),
            opponent: Cell::new(None),
        }
    }

    pub(crate) fn child(endpoint: Endpoint, origin: ProcessIdentity) -> Self {
        Self {
            role: Role::Child,
            endpoint: RefCell::new(endpoint),
            read_buf: RefCell::new(BytesMut::new()),
            opponent: Cell::new(Some(origin)),
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn opponent(&self) -> Option<ProcessIdentity> {
        self.opponent.get()
    }

    pub(crate) fn set_opponent(&self, identity: ProcessIdentity) {
        self.opponent.set(Some(identity));
    }

    /// Write one encoded frame in full.
    pub(crate) fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.endpoint
            .borrow_mut()
            .send_all(frame)
            .map_err(|source| Error::WriteFailure { source })
    }

    /// Read one envelope if one is pending.
    ///
    /// A write always completes before the peer is notified, so by the time
    /// the record that triggered this read was queued, its envelope was whole
    /// on the stream. An empty buffer is the benign "nothing to process this
    /// cycle"; a partial frame that cannot complete means the two sides are
    /// desynchronized.
    pub(crate) fn recv_envelope(&self) -> Result<Option<Envelope>> {
        let mut buf = self.read_buf.borrow_mut();
        self.endpoint
            .borrow_mut()
            .fill(&mut buf)
            .map_err(|source| Error::StreamRead { source })?;

        match EnvelopeCodec::new().decode(&mut buf) {
            Ok(Some(envelope)) => Ok(Some(envelope)),
            Ok(None) if buf.is_empty() => Ok(None),
            Ok(None) => Err(Error::MalformedEnvelope),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Err(Error::MalformedEnvelope),
            Err(source) => Err(Error::StreamRead { source }),
        }
    }
}
