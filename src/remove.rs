//! Recursive removal of whatever currently occupies a path.
//!
//! This is used both for `Remove` records and to clear the way before an object gets created.
//! Removing something that isn't there is a success.  Directories that turn out to be non-empty
//! are emptied first.  Permission problems on the parent directory are handled by retrying once
//! with the parent made writable (see [`crate::escalate`]).

use std::{
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rustix::{
    fs::{chmodat, openat, statat, unlinkat, AtFlags, Dir, FileType, Mode, OFlags, RawMode, CWD},
    io::Errno,
};

use crate::{
    error::{RestoreError, Result},
    escalate::with_writable_parent,
};

fn rmdir(path: &Path) -> rustix::io::Result<()> {
    unlinkat(CWD, path, AtFlags::REMOVEDIR)
}

fn unlink(path: &Path) -> rustix::io::Result<()> {
    unlinkat(CWD, path, AtFlags::empty())
}

/// Remove `path`, including everything below it if it's a directory.
///
/// Succeeds without doing anything if `path` can't be looked up.
pub fn remove(path: &Path) -> Result<()> {
    let st = match statat(CWD, path, AtFlags::SYMLINK_NOFOLLOW) {
        Ok(st) => st,
        Err(Errno::NOENT) => return Ok(()),
        Err(errno) => {
            debug!("not removing {path:?}: {errno}");
            return Ok(());
        }
    };

    if FileType::from_raw_mode(st.st_mode) == FileType::Directory {
        remove_directory(path)
    } else {
        remove_file(path, st.st_mode)
    }
}

fn remove_directory(path: &Path) -> Result<()> {
    let fail = |errno| RestoreError::os("remove directory", path, errno);

    match rmdir(path) {
        Ok(()) => Ok(()),
        Err(Errno::NOTEMPTY | Errno::EXIST) => {
            remove_children(path)?;
            match rmdir(path) {
                Err(Errno::ACCESS) => with_writable_parent(path, || rmdir(path)).map_err(fail),
                result => result.map_err(fail),
            }
        }
        Err(Errno::ACCESS) => match with_writable_parent(path, || rmdir(path)) {
            Err(Errno::NOTEMPTY | Errno::EXIST) => {
                // Empty it with the parent back to its original mode, then escalate again for
                // the directory itself.
                remove_children(path)?;
                with_writable_parent(path, || rmdir(path)).map_err(fail)
            }
            result => result.map_err(fail),
        },
        Err(errno) => Err(fail(errno)),
    }
}

fn read_children(path: &Path) -> Result<Vec<PathBuf>> {
    let fail = |errno| RestoreError::os("read directory", path, errno);

    let fd = openat(
        CWD,
        path,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(fail)?;

    let mut children = vec![];
    for item in Dir::read_from(&fd).map_err(fail)? {
        let entry = item.map_err(fail)?;
        let name = OsStr::from_bytes(entry.file_name().to_bytes());

        if name == "." || name == ".." {
            continue;
        }

        children.push(path.join(name));
    }

    Ok(children)
}

/// Remove every child of `path`.  All children are attempted; the first failure is returned.
fn remove_children(path: &Path) -> Result<()> {
    debug!("descending into {path:?}");

    let mut first_error = None;
    for child in read_children(path)? {
        if let Err(err) = remove(&child) {
            first_error.get_or_insert(err);
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn remove_file(path: &Path, st_mode: RawMode) -> Result<()> {
    let fail = |errno| RestoreError::os("remove", path, errno);

    match unlink(path) {
        Ok(()) => Ok(()),
        Err(Errno::ACCESS) => with_writable_parent(path, || unlink(path)).map_err(fail),
        Err(Errno::PERM) => remove_protected_file(path, st_mode),
        Err(errno) => Err(fail(errno)),
    }
}

/// Retry an unlink that failed with `EPERM` after giving the owner write access to the file.
fn remove_protected_file(path: &Path, st_mode: RawMode) -> Result<()> {
    let fail = |errno| RestoreError::os("remove", path, errno);

    // chmod() would follow the link
    if FileType::from_raw_mode(st_mode) == FileType::Symlink {
        return Err(fail(Errno::PERM));
    }

    let mode = Mode::from_raw_mode(st_mode & 0o7777);
    if let Err(errno) = chmodat(CWD, path, mode | Mode::WUSR, AtFlags::empty()) {
        debug!("can't make {path:?} writable: {errno}");
        return Err(fail(Errno::PERM));
    }

    unlink(path).map_err(|errno| {
        if let Err(err) = chmodat(CWD, path, mode, AtFlags::empty()) {
            warn!("failed to restore permissions of {path:?}: {err}");
        }
        fail(errno)
    })
}
