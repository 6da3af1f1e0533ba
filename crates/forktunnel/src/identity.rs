//! Process identities and post-split roles.
//!
//! Identities are always passed explicitly — the relay never reads the
//! ambient pid behind the host's back. [`ProcessIdentity::current`] is the
//! one sanctioned way to sample it, used by the convenience entry points.

use std::fmt;

use nix::unistd::Pid;

/// Opaque, comparable token identifying a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessIdentity(i32);

impl ProcessIdentity {
    /// Identity of the calling process.
    pub fn current() -> Self {
        Self(std::process::id() as i32)
    }

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }

    pub(crate) fn to_pid(self) -> Pid {
        Pid::from_raw(self.0)
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of the two symmetric behaviors a process runs after the split.
///
/// Computed exactly once, immediately after the split, and final thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The process whose identity matches the recorded origin identity.
    Parent,
    /// The process created by the split.
    Child,
}

impl Role {
    /// `Parent` iff the current identity matches the recorded origin.
    pub fn select(current: ProcessIdentity, origin: ProcessIdentity) -> Self {
        if current == origin {
            Role::Parent
        } else {
            Role::Child
        }
    }
}
