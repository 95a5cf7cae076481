//! Applying a stream of entries to the destination tree.
//!
//! A [`RestoreSession`] holds everything that lives for the duration of one run: the destination
//! root, the options, and the hardlinks whose creation has been put off until the end of the
//! stream.  [`RestoreSession::apply`] handles one entry, [`RestoreSession::resolve_hardlinks`]
//! creates the deferred hardlinks, and [`RestoreSession::run`] drives both from a [`Decoder`].
//!
//! Entries are processed strictly one after the other.  Later entries depend on earlier ones (a
//! file needs its directory, a hardlink needs its target) and regular files share the input
//! stream with the records that follow them.

use std::{
    io::{self, BufRead, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, error, warn};
use rustix::fs::FileType;

use crate::{
    entry::{Entry, EntryKind, Operation, Stat},
    error::{RestoreError, Result},
    materialize::{
        create_dir, create_hardlink, create_node, create_regular, create_symlink,
        hardlink_target, Context,
    },
    protocol::Decoder,
    remove::remove,
};

/// Options for a restore run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreOptions {
    /// Read the whole stream but leave the filesystem alone.
    pub dry_run: bool,
    /// 0: quiet, 1: print each path, 2: also print the operation, uid and gid.
    pub verbosity: u8,
}

/// Counts collected by [`RestoreSession::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Records read from the stream.
    pub entries: usize,
    /// Entries (including deferred hardlinks) that could not be applied.
    pub failures: usize,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures == 0
    }
}

#[derive(Debug)]
pub struct RestoreSession {
    root: PathBuf,
    options: RestoreOptions,
    ctx: Context,
    hardlinks: Vec<Entry>,
    cancel: Option<Arc<AtomicBool>>,
}

impl RestoreSession {
    pub fn new(root: impl Into<PathBuf>, options: RestoreOptions) -> Self {
        RestoreSession {
            root: root.into(),
            options,
            ctx: Context {
                dry_run: options.dry_run,
                privileged: rustix::process::geteuid().is_root(),
            },
            hardlinks: vec![],
            cancel: None,
        }
    }

    /// Stop the run before the next entry once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &RestoreOptions {
        &self.options
    }

    /// Hardlinks waiting for [`Self::resolve_hardlinks`], in stream order.
    pub fn deferred_hardlinks(&self) -> &[Entry] {
        &self.hardlinks
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Apply one entry.
    ///
    /// `content` must be positioned right after the entry's record; for regular files the content
    /// blocks are consumed from it, even if nothing gets written.
    pub fn apply(&mut self, entry: Entry, content: &mut impl Read) -> Result<()> {
        let Entry {
            op,
            path,
            kind,
            stat,
        } = entry;

        if op == Operation::Remove {
            return match path {
                Some(ref path) if !self.ctx.dry_run => remove(path),
                _ => Ok(()),
            };
        }

        let Some(path) = path else {
            if kind.has_content() {
                return create_regular(&self.ctx, content, None, &stat);
            }
            return Ok(());
        };

        match kind {
            EntryKind::RegularFile => create_regular(&self.ctx, content, Some(&path), &stat),
            EntryKind::Directory => create_dir(&self.ctx, &path, &stat),
            EntryKind::Symlink(target) => create_symlink(&self.ctx, &path, &target, &stat),
            EntryKind::Hardlink(target) => self.defer_hardlink(path, &target, stat),
            EntryKind::BlockDevice(rdev) => {
                create_node(&self.ctx, &path, FileType::BlockDevice, rdev, &stat)
            }
            EntryKind::CharDevice(rdev) => {
                create_node(&self.ctx, &path, FileType::CharacterDevice, rdev, &stat)
            }
            EntryKind::Fifo => create_node(&self.ctx, &path, FileType::Fifo, 0, &stat),
            EntryKind::Socket => create_node(&self.ctx, &path, FileType::Socket, 0, &stat),
        }
    }

    fn defer_hardlink(&mut self, path: PathBuf, target: &Path, stat: Stat) -> Result<()> {
        if self.ctx.dry_run {
            return Ok(());
        }

        remove(&path)?;

        let target = hardlink_target(&self.root, target);
        debug!("deferring hardlink {path:?} -> {target:?}");
        self.hardlinks.push(Entry {
            op: Operation::Add,
            path: Some(path),
            kind: EntryKind::Hardlink(target),
            stat,
        });
        Ok(())
    }

    /// Create all deferred hardlinks, in the order they were seen.
    ///
    /// Every link is attempted; the ones that failed are returned together.  The list of deferred
    /// hardlinks is empty afterwards.
    pub fn resolve_hardlinks(&mut self) -> std::result::Result<(), Vec<RestoreError>> {
        let deferred = std::mem::take(&mut self.hardlinks);
        if self.ctx.dry_run {
            return Ok(());
        }

        let mut failures = vec![];
        for entry in deferred {
            if let (Some(path), EntryKind::Hardlink(target)) = (&entry.path, &entry.kind) {
                if let Err(err) = create_hardlink(path, target) {
                    failures.push(err);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }

    fn report(&self, entry: &Entry, progress: &mut impl Write) -> io::Result<()> {
        let Some(ref path) = entry.path else {
            return Ok(());
        };

        match self.options.verbosity {
            0 => Ok(()),
            1 => writeln!(progress, "{}", path.display()),
            _ => writeln!(
                progress,
                "{} {} {} {}",
                entry.op.sign(),
                entry.stat.st_uid,
                entry.stat.st_gid,
                path.display()
            ),
        }
    }

    /// Apply every entry from `decoder`, then resolve the deferred hardlinks.
    ///
    /// Failures of single entries are logged and counted, and the run continues.  Errors that
    /// leave the input in an unknown state (and cancellation) end the run immediately.
    pub fn run<R: BufRead>(
        &mut self,
        decoder: &mut Decoder<R>,
        progress: &mut impl Write,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        loop {
            if self.cancelled() {
                return Err(RestoreError::Cancelled);
            }

            let Some(entry) = decoder.next_entry()? else {
                break;
            };
            summary.entries += 1;

            if let Err(err) = self.report(&entry, progress) {
                warn!("failed to write progress: {err}");
            }

            if let Err(err) = self.apply(entry, decoder.content()) {
                if err.is_fatal() {
                    return Err(err);
                }
                error!("{err}");
                summary.failures += 1;
            }
        }

        if let Err(failures) = self.resolve_hardlinks() {
            for err in &failures {
                error!("{err}");
            }
            summary.failures += failures.len();
        }

        Ok(summary)
    }
}
