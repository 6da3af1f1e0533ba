//! The duplex socket pair under the tunnel.
//!
//! The pair is created atomically before the split; after the split each side
//! retains exactly one endpoint and closes the other immediately, so no
//! endpoint is ever touched by the side that does not own it.
//!
//! Endpoints are non-blocking. Writes are completed in full before the peer
//! is notified (`send_all` parks on writability when the socket buffer is
//! momentarily full); reads never park — a drain takes whatever is already
//! buffered and stops.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::BytesMut;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::{Error, Result};
use crate::identity::Role;

const READ_CHUNK: usize = 4096;

/// Wait for readiness on a descriptor. Returns `false` on timeout.
pub(crate) fn poll_fd(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    timeout: Option<Duration>,
) -> io::Result<bool> {
    let timeout = match timeout {
        None => PollTimeout::NONE,
        Some(duration) => {
            let millis = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    };
    let mut fds = [PollFd::new(fd, events)];
    loop {
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }
}

/// One end of the bridge.
pub struct Endpoint {
    stream: UnixStream,
}

impl Endpoint {
    fn from_stream(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }

    #[cfg(test)]
    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }

    /// Write the whole buffer, parking on writability as needed. A completed
    /// write is the precondition for notifying the peer.
    pub(crate) fn send_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    poll_fd(self.stream.as_fd(), PollFlags::POLLOUT, None)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Append everything currently readable to `buf` without parking.
    /// End-of-stream is not a fault: the drain simply stops with whatever
    /// arrived.
    pub(crate) fn fill(&mut self, buf: &mut BytesMut) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

/// The connected pair, alive only between creation and the split.
pub struct BridgeChannel {
    parent_end: Endpoint,
    child_end: Endpoint,
}

impl BridgeChannel {
    /// Atomically allocate the connected pair. Failure is fatal to tunnel
    /// construction; there is no retry.
    pub fn create() -> Result<Self> {
        let (parent, child) =
            UnixStream::pair().map_err(|source| Error::ChannelCreation { source })?;
        let parent_end =
            Endpoint::from_stream(parent).map_err(|source| Error::ChannelCreation { source })?;
        let child_end =
            Endpoint::from_stream(child).map_err(|source| Error::ChannelCreation { source })?;
        tracing::debug!("Created bridge socket pair");
        Ok(Self {
            parent_end,
            child_end,
        })
    }

    /// Keep the endpoint belonging to `role`; the other is closed here.
    pub fn retain(self, role: Role) -> Endpoint {
        match role {
            Role::Parent => self.parent_end,
            Role::Child => self.child_end,
        }
    }

    #[cfg(test)]
    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            parent_end: self.parent_end.try_clone()?,
            child_end: self.child_end.try_clone()?,
        })
    }
}
