//! Rebuild a filesystem tree from a sequential stream of entry records.
//!
//! The stream is decoded by [`protocol::Decoder`] into [`entry::Entry`] values, which a
//! [`restore::RestoreSession`] applies to a destination directory one at a time.  Hardlinks are
//! collected while the stream is read and created once it has ended.

pub mod entry;
pub mod error;
pub mod escalate;
pub mod materialize;
pub mod protocol;
pub mod remove;
pub mod restore;

mod util;


pub use error::{RestoreError, Result};
pub use restore::{RestoreOptions, RestoreSession, RunSummary};
