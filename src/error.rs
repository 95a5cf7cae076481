//! Error types for restore operations.
//!
//! Every filesystem operation in this crate returns a [`Result<T>`], an alias for
//! `Result<T, RestoreError>`.  The variants follow how a failure is treated by the restore loop:
//!
//! - [`PermissionDenied`] and [`NotPermitted`]: the operation was already retried once with
//!   raised permissions and still failed.  Fatal for the entry only.
//! - [`Os`]: any other system error.  Fatal for the entry only.
//! - [`StreamDesync`]: reading or writing file content failed midway, so the position in the
//!   input stream can no longer be trusted.  Fatal for the whole run.
//! - [`Protocol`]: the decoder could not make sense of the input.  Fatal for the whole run.
//! - [`Cancelled`]: the run was stopped from outside.
//!
//! [`PermissionDenied`]: RestoreError::PermissionDenied
//! [`NotPermitted`]: RestoreError::NotPermitted
//! [`Os`]: RestoreError::Os
//! [`StreamDesync`]: RestoreError::StreamDesync
//! [`Protocol`]: RestoreError::Protocol
//! [`Cancelled`]: RestoreError::Cancelled

use std::path::{Path, PathBuf};

use rustix::io::Errno;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Result type alias for restore operations.
pub type Result<T> = std::result::Result<T, RestoreError>;

#[derive(Debug, Error)]
pub enum RestoreError {
    /// `EACCES`, still reported after retrying with a writable parent directory.
    #[error("failed to {op} `{}`: {source}", path.display())]
    PermissionDenied {
        op: &'static str,
        path: PathBuf,
        source: Errno,
    },

    /// `EPERM`, still reported after retrying with a writable file.
    #[error("failed to {op} `{}`: {source}", path.display())]
    NotPermitted {
        op: &'static str,
        path: PathBuf,
        source: Errno,
    },

    /// Any other system error.
    #[error("failed to {op} `{}`: {source}", path.display())]
    Os {
        op: &'static str,
        path: PathBuf,
        source: Errno,
    },

    /// A content block could not be read or written in full.
    #[error("content stream out of sync at `{}`: {source}", display_opt(path))]
    StreamDesync {
        path: Option<PathBuf>,
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The run was asked to stop between two entries.
    #[error("restore cancelled")]
    Cancelled,
}

fn display_opt(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "<unnamed>".to_string(),
    }
}

impl RestoreError {
    /// Classify a system error raised by `op` on `path`.
    pub fn os(op: &'static str, path: &Path, errno: Errno) -> Self {
        let path = path.to_path_buf();
        match errno {
            Errno::ACCESS => RestoreError::PermissionDenied {
                op,
                path,
                source: errno,
            },
            Errno::PERM => RestoreError::NotPermitted {
                op,
                path,
                source: errno,
            },
            _ => RestoreError::Os {
                op,
                path,
                source: errno,
            },
        }
    }

    pub(crate) fn desync(path: Option<&Path>, source: std::io::Error) -> Self {
        RestoreError::StreamDesync {
            path: path.map(Path::to_path_buf),
            source,
        }
    }

    /// Whether the run has to stop because the input can no longer be parsed reliably.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RestoreError::StreamDesync { .. } | RestoreError::Protocol(_) | RestoreError::Cancelled
        )
    }

    /// The underlying system error, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            RestoreError::PermissionDenied { source, .. }
            | RestoreError::NotPermitted { source, .. }
            | RestoreError::Os { source, .. } => Some(*source),
            RestoreError::StreamDesync { .. }
            | RestoreError::Protocol(_)
            | RestoreError::Cancelled => None,
        }
    }
}
