//! Cross-process "you have data" signalling.
//!
//! Each tunnel derives a rendezvous directory from its token; every process
//! binds a Unix datagram socket there, named after its own identity, so both
//! sides can address each other with no coordination beyond the token. A
//! notification is a small record carrying the sender's identity, sent to the
//! target's socket, followed by a best-effort `SIGURG` nudge.
//!
//! The signal handler only sets a process-global atomic flag — draining the
//! queue always happens from the host's normal control flow (an explicit
//! drain, a poll on the socket, or a reactor watching the descriptor).
//! `SIGURG` is used because its default disposition is "ignore": a nudge that
//! races handler installation cannot kill the peer.
//!
//! Delivery is lossy by contract: a failed enqueue or nudge is logged and
//! swallowed, and the data it advertised stays unconsumed until the next
//! drain or teardown.

use std::cell::{Cell, RefCell};
use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::poll::PollFlags;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};

use crate::bridge::transport::poll_fd;
use crate::error::{Error, Result};
use crate::identity::ProcessIdentity;

/// One record per notification: the sender's identity, big-endian.
const RECORD_BYTES: usize = 4;

static WAKE_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_wake(_signal: nix::libc::c_int) {
    WAKE_PENDING.store(true, Ordering::Relaxed);
}

fn install_wake_handler() -> io::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_wake),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // Safety: the handler only stores to an atomic flag, which is
    // async-signal-safe; no other state is touched from signal context.
    unsafe { sigaction(Signal::SIGURG, &action) }
        .map(drop)
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
}

/// The rendezvous socket owned by one process.
///
/// Bound to the origin identity at construction — before the split — so the
/// child's handshake can never race the parent's arming. The child rebinds to
/// its own identity at split time and its inherited copy of the origin socket
/// is dropped.
pub(crate) struct NotificationChannel {
    dir: PathBuf,
    socket: RefCell<UnixDatagram>,
    owner: Cell<ProcessIdentity>,
    owns_dir: Cell<bool>,
}

impl NotificationChannel {
    pub(crate) fn new(dir: PathBuf, owner: ProcessIdentity) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|source| Error::Rendezvous { source })?;
        let socket = Self::bind(&dir, owner)?;
        install_wake_handler().map_err(|source| Error::Rendezvous { source })?;
        tracing::debug!(dir = %dir.display(), owner = %owner, "Bound rendezvous socket");
        Ok(Self {
            dir,
            socket: RefCell::new(socket),
            owner: Cell::new(owner),
            owns_dir: Cell::new(true),
        })
    }

    fn bind(dir: &Path, owner: ProcessIdentity) -> Result<UnixDatagram> {
        let socket = UnixDatagram::bind(Self::address(dir, owner))
            .map_err(|source| Error::Rendezvous { source })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| Error::Rendezvous { source })?;
        Ok(socket)
    }

    fn address(dir: &Path, identity: ProcessIdentity) -> PathBuf {
        dir.join(format!("{}.sock", identity.as_raw()))
    }

    /// Rebind the socket to a new owner identity. `unlink_old` removes the
    /// previous socket file and must be false when another process (the
    /// parent, after a split) still answers at the old address.
    pub(crate) fn rebind(&self, new_owner: ProcessIdentity, unlink_old: bool) -> Result<()> {
        let old_owner = self.owner.get();
        if new_owner == old_owner {
            return Ok(());
        }
        if unlink_old {
            let _ = fs::remove_file(Self::address(&self.dir, old_owner));
        } else {
            // The old address stays with the other side; so does the
            // directory cleanup duty.
            self.owns_dir.set(false);
        }
        let socket = Self::bind(&self.dir, new_owner)?;
        self.socket.replace(socket);
        self.owner.set(new_owner);
        tracing::debug!(owner = %new_owner, "Rebound rendezvous socket");
        Ok(())
    }

    /// Enqueue a record for `target` and nudge it. Best-effort on both
    /// counts: a wake that cannot be delivered leaves the data unconsumed,
    /// which the delivery contract allows.
    pub(crate) fn notify(&self, target: ProcessIdentity) {
        let record = self.owner.get().as_raw().to_be_bytes();
        let address = Self::address(&self.dir, target);
        if let Err(error) = self.socket.borrow().send_to(&record, &address) {
            tracing::warn!(peer = %target, %error, "Could not enqueue notification");
            return;
        }
        if let Err(errno) = kill(target.to_pid(), Signal::SIGURG) {
            tracing::debug!(peer = %target, %errno, "Could not nudge peer");
        }
    }

    /// Drain all queued records without parking. Each record is the identity
    /// of a sender that has (or, for a handshake, will have) data for us.
    pub(crate) fn drain_records(&self) -> Vec<ProcessIdentity> {
        let socket = self.socket.borrow();
        let mut records = Vec::new();
        let mut buf = [0u8; RECORD_BYTES * 2];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((RECORD_BYTES, _)) => {
                    let raw = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    records.push(ProcessIdentity::from_raw(raw));
                }
                Ok((n, _)) => {
                    tracing::warn!(bytes = n, "Skipping malformed notification record");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    tracing::warn!(%error, "Notification drain stopped on socket fault");
                    break;
                }
            }
        }
        records
    }

    /// Consume the wake flag set by the signal handler. Wakes coalesce: one
    /// flag may stand for any number of queued records.
    pub(crate) fn take_wake(&self) -> bool {
        WAKE_PENDING.swap(false, Ordering::Relaxed)
    }

    /// Park until a record is queued or the timeout elapses.
    pub(crate) fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        let socket = self.socket.borrow();
        poll_fd(socket.as_fd(), PollFlags::POLLIN, timeout)
            .map_err(|source| Error::Rendezvous { source })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.socket.borrow().as_raw_fd()
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        let _ = fs::remove_file(Self::address(&self.dir, self.owner.get()));
        if self.owns_dir.get() {
            tracing::debug!(dir = %self.dir.display(), "Cleaning up rendezvous directory");
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}
