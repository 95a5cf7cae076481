//! Creating filesystem objects from entries.
//!
//! Each function here creates one kind of object.  Anything already present at the destination
//! is removed first, and a creation that fails with `EACCES` is retried once with the parent
//! directory temporarily made writable.  In dry-run mode nothing is touched, but regular files
//! still have their content consumed from the input.

use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use log::trace;
use rustix::{
    fd::AsFd,
    fs::{
        chmodat, chownat, fchmod, fchown, futimens, linkat, mkdirat, mknodat, openat, statat,
        symlinkat, utimensat, AtFlags, Dev, FileType, Mode, OFlags, Timespec, Timestamps, CWD,
    },
    process::{Gid, Uid},
};

use crate::{
    entry::Stat,
    error::{RestoreError, Result},
    escalate::retry_with_writable_parent,
    protocol::{read_block_header, BLOCK_SIZE},
    remove::remove,
};

/// Settings that apply to every object created during a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct Context {
    /// Consume the input but don't modify the filesystem.
    pub dry_run: bool,
    /// Ownership is only restored when running as root.
    pub privileged: bool,
}

fn owner(stat: &Stat) -> (Option<Uid>, Option<Gid>) {
    (
        Some(Uid::from_raw(stat.st_uid)),
        Some(Gid::from_raw(stat.st_gid)),
    )
}

fn mode(stat: &Stat) -> Mode {
    Mode::from_raw_mode(stat.st_mode & 0o7777)
}

// atime isn't carried in the stream; it gets the mtime as well
fn timestamps(stat: &Stat) -> Timestamps {
    let mtime = Timespec {
        tv_sec: stat.st_mtim_sec,
        tv_nsec: 0,
    };
    Timestamps {
        last_access: mtime,
        last_modification: mtime,
    }
}

/// Restore ownership (when privileged), mode and mtime of an object, by path.
fn apply_metadata(ctx: &Context, path: &Path, stat: &Stat) -> Result<()> {
    if ctx.privileged {
        let (uid, gid) = owner(stat);
        chownat(CWD, path, uid, gid, AtFlags::SYMLINK_NOFOLLOW)
            .map_err(|errno| RestoreError::os("change ownership of", path, errno))?;
    }

    chmodat(CWD, path, mode(stat), AtFlags::empty())
        .map_err(|errno| RestoreError::os("change mode of", path, errno))?;

    utimensat(CWD, path, &timestamps(stat), AtFlags::SYMLINK_NOFOLLOW)
        .map_err(|errno| RestoreError::os("set mtime of", path, errno))
}

fn open_output(ctx: &Context, path: &Path, stat: &Stat) -> Result<File> {
    remove(path)?;

    let fd = retry_with_writable_parent(path, || {
        openat(
            CWD,
            path,
            OFlags::WRONLY | OFlags::CREATE | OFlags::TRUNC | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            mode(stat),
        )
    })
    .map_err(|errno| RestoreError::os("open file", path, errno))?;

    if ctx.privileged {
        let (uid, gid) = owner(stat);
        fchown(&fd, uid, gid)
            .map_err(|errno| RestoreError::os("change ownership of", path, errno))?;
    }
    fchmod(&fd, mode(stat)).map_err(|errno| RestoreError::os("change mode of", path, errno))?;

    Ok(File::from(fd))
}

/// Copy content blocks from `content` to `output` until the terminating block.  Without an
/// output the blocks are read and dropped.
fn copy_blocks(
    content: &mut impl Read,
    mut output: Option<&mut File>,
    path: Option<&Path>,
) -> Result<u64> {
    let desync = |err| RestoreError::desync(path, err);

    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut total = 0;
    loop {
        let size = read_block_header(content).map_err(desync)?;
        if size == 0 {
            return Ok(total);
        }

        let block = &mut buffer[..size];
        content.read_exact(block).map_err(desync)?;
        if let Some(ref mut file) = output {
            file.write_all(block).map_err(desync)?;
        }
        total += size as u64;
    }
}

/// Create a regular file at `path` from the content blocks at the front of `content`.
///
/// The content is always consumed up to and including its terminating block.  It is discarded
/// when `path` is `None` or in dry-run mode.  A failure to read or write a block leaves any
/// partially written file in place and is reported as [`RestoreError::StreamDesync`].
pub fn create_regular(
    ctx: &Context,
    content: &mut impl Read,
    path: Option<&Path>,
    stat: &Stat,
) -> Result<()> {
    let path = match path {
        Some(path) if !ctx.dry_run => path,
        path => {
            copy_blocks(content, None, path)?;
            return Ok(());
        }
    };

    let mut file = match open_output(ctx, path, stat) {
        Ok(file) => file,
        Err(err) => {
            copy_blocks(content, None, Some(path))?;
            return Err(err);
        }
    };

    let size = copy_blocks(content, Some(&mut file), Some(path))?;
    trace!("wrote {size} bytes to {path:?}");

    // writing may have cleared setuid/setgid
    fchmod(file.as_fd(), mode(stat))
        .map_err(|errno| RestoreError::os("change mode of", path, errno))?;
    futimens(file.as_fd(), &timestamps(stat))
        .map_err(|errno| RestoreError::os("set mtime of", path, errno))
}

/// Create the directory at `path`, or only update its metadata if it already exists.
pub fn create_dir(ctx: &Context, path: &Path, stat: &Stat) -> Result<()> {
    if ctx.dry_run {
        return Ok(());
    }

    match statat(CWD, path, AtFlags::SYMLINK_NOFOLLOW) {
        Ok(st) if FileType::from_raw_mode(st.st_mode) == FileType::Directory => {
            return apply_metadata(ctx, path, stat);
        }
        Ok(_) => remove(path)?,
        Err(_) => {}
    }

    retry_with_writable_parent(path, || mkdirat(CWD, path, mode(stat)))
        .map_err(|errno| RestoreError::os("create directory", path, errno))?;

    apply_metadata(ctx, path, stat)
}

/// Create a device node, FIFO or socket at `path`.  `rdev` is only used for devices.
pub fn create_node(
    ctx: &Context,
    path: &Path,
    file_type: FileType,
    rdev: Dev,
    stat: &Stat,
) -> Result<()> {
    if ctx.dry_run {
        return Ok(());
    }

    let op = match file_type {
        FileType::BlockDevice | FileType::CharacterDevice => "make device",
        FileType::Fifo => "make fifo",
        _ => "make socket",
    };

    remove(path)?;
    retry_with_writable_parent(path, || mknodat(CWD, path, file_type, mode(stat), rdev))
        .map_err(|errno| RestoreError::os(op, path, errno))?;

    apply_metadata(ctx, path, stat)
}

/// Create a symlink at `path` pointing to `target`.
///
/// Symlinks get their ownership restored (when privileged) but neither mode nor mtime.
pub fn create_symlink(ctx: &Context, path: &Path, target: &Path, stat: &Stat) -> Result<()> {
    if ctx.dry_run {
        return Ok(());
    }

    remove(path)?;
    retry_with_writable_parent(path, || symlinkat(target, CWD, path))
        .map_err(|errno| RestoreError::os("create symlink", path, errno))?;

    if ctx.privileged {
        let (uid, gid) = owner(stat);
        chownat(CWD, path, uid, gid, AtFlags::SYMLINK_NOFOLLOW)
            .map_err(|errno| RestoreError::os("change ownership of", path, errno))?;
    }

    Ok(())
}

/// Place a root-relative hardlink target under `root`.
pub fn hardlink_target(root: &Path, target: &Path) -> PathBuf {
    root.join(target.strip_prefix("/").unwrap_or(target))
}

/// Create a hardlink at `path` to the existing file `target`.
pub fn create_hardlink(path: &Path, target: &Path) -> Result<()> {
    retry_with_writable_parent(path, || {
        linkat(CWD, target, CWD, path, AtFlags::empty())
    })
    .map_err(|errno| RestoreError::os("create hardlink", path, errno))
}
