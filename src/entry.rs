//! Decoded stream records.
//!
//! An [`Entry`] describes one filesystem object that should be added to (or removed from) the
//! destination tree.  The object type is decided once, by the decoder, and carried as an
//! [`EntryKind`] so that dispatch is a plain `match`.

use std::{fmt, path::PathBuf};

use rustix::fs::Dev;

/// Whether the record adds an object or removes one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Add,
    Remove,
}

impl Operation {
    /// The sign used for this operation in the protocol and in verbose output.
    pub fn sign(self) -> char {
        match self {
            Operation::Add => '+',
            Operation::Remove => '-',
        }
    }
}

/// The kind of object an entry describes, along with any kind-specific payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    Directory,
    /// The target is stored verbatim.
    Symlink(PathBuf),
    /// Contains the target of the link.  As decoded this is relative to the destination root; it
    /// is made absolute when the link gets deferred.
    Hardlink(PathBuf),
    BlockDevice(Dev),
    CharDevice(Dev),
    Fifo,
    Socket,
}

impl EntryKind {
    /// Only plain regular files carry content blocks in the stream.
    pub fn has_content(&self) -> bool {
        matches!(self, EntryKind::RegularFile)
    }
}

/// Ownership, permissions and modification time of an entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    /// Permission bits only (`0o7777`); the file type lives in [`EntryKind`].
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_mtim_sec: i64,
}

/// One decoded record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub op: Operation,
    /// Absolute destination path.  `None` means the record's content must be consumed but
    /// nothing gets created or removed.
    pub path: Option<PathBuf>,
    pub kind: EntryKind,
    pub stat: Stat,
}

impl Entry {
    pub fn new(op: Operation, path: impl Into<PathBuf>, kind: EntryKind, stat: Stat) -> Self {
        Entry {
            op,
            path: Some(path.into()),
            kind,
            stat,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let path = match self.path {
            Some(ref path) => path.display(),
            None => return write!(fmt, "{} <unnamed>", self.op.sign()),
        };
        match self.kind {
            EntryKind::Symlink(ref target) | EntryKind::Hardlink(ref target) => {
                write!(fmt, "{} {} -> {}", self.op.sign(), path, target.display())
            }
            _ => write!(fmt, "{} {}", self.op.sign(), path),
        }
    }
}
