//! Temporary permission escalation on directories.
//!
//! Restoring into a tree that contains read-only directories means that creating or removing an
//! entry can fail with `EACCES` on its parent.  In that case the parent is made writable (and
//! searchable) for its owner, the operation is retried once, and the parent's original mode is put
//! back.  The raised mode is only ever visible for the duration of the retried operation.
//!
//! [`WritableDir`] is the scoped form: it escalates on construction and restores on drop, so
//! restoration happens on every exit path.  Failing to escalate or to restore is logged as a
//! warning and otherwise ignored; the retried operation then reports its own error.

use std::path::Path;

use log::{debug, warn};
use rustix::{
    fs::{chmodat, statat, AtFlags, Mode, CWD},
    io::Errno,
};

use crate::{
    error::{RestoreError, Result},
    util::parent_dir,
};

/// The mode a directory had before it was escalated.
#[derive(Debug)]
#[must_use = "an escalated directory must be restored"]
pub struct PermissionToken {
    mode: Mode,
}

/// Make `dir` writable and searchable for its owner, returning its previous mode.
pub fn escalate(dir: &Path) -> Result<PermissionToken> {
    let st = statat(CWD, dir, AtFlags::empty())
        .map_err(|errno| RestoreError::os("stat directory", dir, errno))?;
    let mode = Mode::from_raw_mode(st.st_mode & 0o7777);

    chmodat(CWD, dir, mode | Mode::WUSR | Mode::XUSR, AtFlags::empty())
        .map_err(|errno| RestoreError::os("make directory writable", dir, errno))?;

    debug!("escalated {dir:?} from {:o}", mode.bits());
    Ok(PermissionToken { mode })
}

/// Put back the mode captured by [`escalate`].
pub fn restore(dir: &Path, token: PermissionToken) -> Result<()> {
    chmodat(CWD, dir, token.mode, AtFlags::empty())
        .map_err(|errno| RestoreError::os("restore permissions of", dir, errno))
}

/// A directory that has been made writable for as long as this value lives.
#[derive(Debug)]
pub struct WritableDir<'a> {
    path: &'a Path,
    token: Option<PermissionToken>,
}

impl<'a> WritableDir<'a> {
    pub fn acquire(path: &'a Path) -> Self {
        let token = match escalate(path) {
            Ok(token) => Some(token),
            Err(err) => {
                warn!("{err}");
                None
            }
        };
        WritableDir { path, token }
    }
}

impl Drop for WritableDir<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(err) = restore(self.path, token) {
                warn!("{err}");
            }
        }
    }
}

/// Run `op` once while the parent directory of `path` is writable.
pub fn with_writable_parent<T>(
    path: &Path,
    op: impl FnOnce() -> rustix::io::Result<T>,
) -> rustix::io::Result<T> {
    let _parent = WritableDir::acquire(parent_dir(path));
    op()
}

/// Run `op`, and if it fails with `EACCES`, run it once more with the parent directory of `path`
/// made writable.
pub fn retry_with_writable_parent<T>(
    path: &Path,
    mut op: impl FnMut() -> rustix::io::Result<T>,
) -> rustix::io::Result<T> {
    match op() {
        Err(Errno::ACCESS) => with_writable_parent(path, op),
        result => result,
    }
}
