//! Decoding of the record stream.
//!
//! A stream is a sequence of records.  Each record starts with a one-line ASCII header, followed
//! by the raw bytes of the path and of the link target:
//!
//! ```text
//! <op><type> <mode> <uid> <gid> <mtime> <major>,<minor> <pathlen> <targetlen>\n<path><target>
//! ```
//!
//! `op` is `+` or `-`; `type` is one of `-dlhbcps` (regular file, directory, symlink, hardlink,
//! block device, character device, FIFO, socket).  `mode` is octal, everything else decimal.
//!
//! Records that add a regular file are followed by the file content, cut into blocks:
//!
//! ```text
//! 01BLOCK<5 decimal digits>\n<that many bytes>
//! ```
//!
//! A block header with a length of zero terminates the content.  The decoder never reads content
//! itself: the consumer pulls it from [`Decoder::content`] with [`read_block_header`] before asking
//! for the next record.

use std::{
    ffi::OsStr,
    io::{self, BufRead, Read},
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

use rustix::fs::makedev;
use thiserror::Error;

use crate::entry::{Entry, EntryKind, Operation, Stat};

/// The largest content block that may appear in a stream.
pub const BLOCK_SIZE: usize = 8192;

/// The longest path or link target accepted in a record.
pub const PATH_MAX: usize = 4096;

const BLOCK_MAGIC: &[u8] = b"01BLOCK";
const BLOCK_HEADER_LEN: usize = BLOCK_MAGIC.len() + 5 + 1;
const HEADER_MAX: u64 = 256;

/// Errors that can occur while decoding record headers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected EOF while reading {0}")]
    UnexpectedEof(&'static str),

    #[error("malformed record header: {0:?}")]
    InvalidHeader(String),

    #[error("unknown entry type {0:?}")]
    UnknownType(char),

    #[error("{what} exceeds limit: {len} bytes > {limit} bytes")]
    TooLong {
        what: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("path {0:?} leaves the destination")]
    UnsafePath(PathBuf),
}

type Result<T> = std::result::Result<T, ProtocolError>;

fn invalid_block(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Read the header of the next content block and return the length of the block that follows.
///
/// A return value of zero marks the end of the file's content.  Any failure here means the
/// stream position is lost, so all errors are reported as [`io::Error`].
pub fn read_block_header(reader: &mut impl Read) -> io::Result<usize> {
    let mut header = [0u8; BLOCK_HEADER_LEN];
    reader.read_exact(&mut header)?;

    let (magic, rest) = header.split_at(BLOCK_MAGIC.len());
    if magic != BLOCK_MAGIC || rest[5] != b'\n' {
        return Err(invalid_block(format!(
            "malformed content block header: {:?}",
            String::from_utf8_lossy(&header)
        )));
    }

    let size = std::str::from_utf8(&rest[..5])
        .ok()
        .filter(|digits| digits.bytes().all(|c| c.is_ascii_digit()))
        .and_then(|digits| digits.parse::<usize>().ok())
        .ok_or_else(|| {
            invalid_block(format!(
                "malformed content block length: {:?}",
                String::from_utf8_lossy(&rest[..5])
            ))
        })?;

    if size > BLOCK_SIZE {
        return Err(invalid_block(format!(
            "content block exceeds limit: {size} bytes > {BLOCK_SIZE} bytes"
        )));
    }

    Ok(size)
}

/// Remove the first `strip` normal components from `path`.
///
/// Returns `None` if nothing is left.  `..` components are refused.
fn strip_components(path: &Path, strip: usize) -> Result<Option<PathBuf>> {
    let mut rest = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => rest.push(name),
            Component::ParentDir => return Err(ProtocolError::UnsafePath(path.to_path_buf())),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }

    let stripped: PathBuf = rest.components().skip(strip).collect();
    if stripped.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(stripped))
    }
}

struct Header<'a> {
    op: Operation,
    ty: char,
    stat: Stat,
    major: u32,
    minor: u32,
    pathlen: usize,
    targetlen: usize,
    line: &'a str,
}

impl<'a> Header<'a> {
    fn parse(line: &'a str) -> Result<Self> {
        let invalid = || ProtocolError::InvalidHeader(line.to_string());

        let fields: Vec<&str> = line.split(' ').collect();
        let [optype, mode, uid, gid, mtime, dev, pathlen, targetlen] = fields[..] else {
            return Err(invalid());
        };

        let mut optype = optype.chars();
        let op = match optype.next() {
            Some('+') => Operation::Add,
            Some('-') => Operation::Remove,
            _ => return Err(invalid()),
        };
        let ty = optype.next().ok_or_else(invalid)?;
        if optype.next().is_some() {
            return Err(invalid());
        }

        let (major, minor) = dev.split_once(',').ok_or_else(invalid)?;

        Ok(Header {
            op,
            ty,
            stat: Stat {
                st_mode: u32::from_str_radix(mode, 8).map_err(|_| invalid())? & 0o7777,
                st_uid: uid.parse().map_err(|_| invalid())?,
                st_gid: gid.parse().map_err(|_| invalid())?,
                st_mtim_sec: mtime.parse().map_err(|_| invalid())?,
            },
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
            pathlen: pathlen.parse().map_err(|_| invalid())?,
            targetlen: targetlen.parse().map_err(|_| invalid())?,
            line,
        })
    }
}

/// Pulls [`Entry`] values out of a record stream.
///
/// Paths in the stream are absolute.  The decoder strips a configurable number of leading
/// components and places the remainder under the destination root.
#[derive(Debug)]
pub struct Decoder<R> {
    reader: R,
    root: PathBuf,
    strip: usize,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(reader: R, root: impl Into<PathBuf>) -> Self {
        Decoder {
            reader,
            root: root.into(),
            strip: 0,
        }
    }

    /// Drop this many leading components from every path (and hardlink target).
    pub fn strip(mut self, strip: usize) -> Self {
        self.strip = strip;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The underlying stream, positioned right after the last record header.  For regular files
    /// this is where the content blocks start.
    pub fn content(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn read_name(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>> {
        if len > PATH_MAX {
            return Err(ProtocolError::TooLong {
                what,
                len,
                limit: PATH_MAX,
            });
        }

        let mut name = vec![0u8; len];
        self.reader.read_exact(&mut name).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::UnexpectedEof(what),
            _ => ProtocolError::Io(err),
        })?;
        Ok(name)
    }

    /// Read the next record header.  Returns `None` on a clean end of stream.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        let mut line = vec![];
        (&mut self.reader)
            .take(HEADER_MAX)
            .read_until(b'\n', &mut line)?;

        if line.is_empty() {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            if line.len() as u64 == HEADER_MAX {
                return Err(ProtocolError::TooLong {
                    what: "record header",
                    len: line.len(),
                    limit: HEADER_MAX as usize,
                });
            }
            return Err(ProtocolError::UnexpectedEof("record header"));
        }
        line.pop();

        let line = std::str::from_utf8(&line)
            .map_err(|_| ProtocolError::InvalidHeader(String::from_utf8_lossy(&line).into()))?;
        let header = Header::parse(line)?;

        let path = self.read_name(header.pathlen, "path")?;
        let target = self.read_name(header.targetlen, "link target")?;

        let mut path = match strip_components(Path::new(OsStr::from_bytes(&path)), self.strip)? {
            Some(rest) => Some(self.root.join(rest)),
            // without stripping, `/` is the destination itself
            None if self.strip == 0 && !path.is_empty() => Some(self.root.clone()),
            None => None,
        };

        let target = PathBuf::from(OsStr::from_bytes(&target));
        let kind = match header.ty {
            '-' => EntryKind::RegularFile,
            'd' => EntryKind::Directory,
            'l' => EntryKind::Symlink(target),
            'h' => match strip_components(&target, self.strip)? {
                Some(target) => EntryKind::Hardlink(target),
                None => {
                    // nothing left to link to; removals don't need a target
                    if header.op == Operation::Add {
                        path = None;
                    }
                    EntryKind::Hardlink(PathBuf::new())
                }
            },
            'b' => EntryKind::BlockDevice(makedev(header.major, header.minor)),
            'c' => EntryKind::CharDevice(makedev(header.major, header.minor)),
            'p' => EntryKind::Fifo,
            's' => EntryKind::Socket,
            other => return Err(ProtocolError::UnknownType(other)),
        };

        if matches!(kind, EntryKind::Symlink(_) | EntryKind::Hardlink(_))
            && header.op == Operation::Add
            && header.targetlen == 0
        {
            return Err(ProtocolError::InvalidHeader(format!(
                "link without a target: {}",
                header.line
            )));
        }

        Ok(Some(Entry {
            op: header.op,
            path,
            kind,
            stat: header.stat,
        }))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::StreamBuilder;

    fn stat(mode: u32) -> Stat {
        Stat {
            st_mode: mode,
            st_uid: 1000,
            st_gid: 100,
            st_mtim_sec: 1_700_000_000,
        }
    }

    #[test]
    fn test_decode_records() {
        let stream = StreamBuilder::new()
            .record(Operation::Add, "/", &EntryKind::Directory, stat(0o755))
            .file("/etc/motd", stat(0o644), b"hello")
            .record(
                Operation::Add,
                "/etc/link",
                &EntryKind::Symlink("motd".into()),
                stat(0o777),
            )
            .record(
                Operation::Add,
                "/etc/hard",
                &EntryKind::Hardlink("/etc/motd".into()),
                stat(0o644),
            )
            .record(
                Operation::Add,
                "/dev/null",
                &EntryKind::CharDevice(makedev(1, 3)),
                stat(0o666),
            )
            .record(Operation::Remove, "/etc/old", &EntryKind::RegularFile, stat(0))
            .build();

        let mut decoder = Decoder::new(&stream[..], "/restore");

        let root = decoder.next_entry().unwrap().unwrap();
        assert_eq!(root.path.as_deref(), Some(Path::new("/restore")));
        assert_eq!(root.kind, EntryKind::Directory);

        let motd = decoder.next_entry().unwrap().unwrap();
        assert_eq!(
            motd,
            Entry::new(
                Operation::Add,
                "/restore/etc/motd",
                EntryKind::RegularFile,
                stat(0o644)
            )
        );
        assert_eq!(read_block_header(decoder.content()).unwrap(), 5);
        let mut buf = [0u8; 5];
        decoder.content().read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(read_block_header(decoder.content()).unwrap(), 0);

        let link = decoder.next_entry().unwrap().unwrap();
        assert_eq!(link.path.as_deref(), Some(Path::new("/restore/etc/link")));
        assert_eq!(link.kind, EntryKind::Symlink("motd".into()));

        let hard = decoder.next_entry().unwrap().unwrap();
        assert_eq!(hard.kind, EntryKind::Hardlink("etc/motd".into()));

        let null = decoder.next_entry().unwrap().unwrap();
        assert_eq!(null.kind, EntryKind::CharDevice(makedev(1, 3)));
        assert_eq!(null.stat.st_mode, 0o666);

        let old = decoder.next_entry().unwrap().unwrap();
        assert_eq!(old.op, Operation::Remove);
        assert_eq!(old.path.as_deref(), Some(Path::new("/restore/etc/old")));

        assert!(decoder.next_entry().unwrap().is_none());
        assert!(decoder.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_strip() {
        let stream = StreamBuilder::new()
            .record(Operation::Add, "/home", &EntryKind::Directory, stat(0o755))
            .record(Operation::Add, "/home/user/file", &EntryKind::Fifo, stat(0o600))
            .record(
                Operation::Add,
                "/home/user/hard",
                &EntryKind::Hardlink("/home/user/file".into()),
                stat(0o600),
            )
            .record(
                Operation::Add,
                "/home/user/hard2",
                &EntryKind::Hardlink("/home".into()),
                stat(0o600),
            )
            .build();

        let mut decoder = Decoder::new(&stream[..], "/restore").strip(1);

        assert_eq!(decoder.next_entry().unwrap().unwrap().path, None);
        assert_eq!(
            decoder.next_entry().unwrap().unwrap().path.as_deref(),
            Some(Path::new("/restore/user/file"))
        );
        assert_eq!(
            decoder.next_entry().unwrap().unwrap().kind,
            EntryKind::Hardlink("user/file".into())
        );
        // the link target is stripped away completely
        assert_eq!(decoder.next_entry().unwrap().unwrap().path, None);
    }

    #[test]
    fn test_remove_hardlink_without_target() {
        let stream = b"-h 644 0 0 0 0,0 4 0\n/foo";
        let entry = Decoder::new(&stream[..], "/restore")
            .next_entry()
            .unwrap()
            .unwrap();
        assert_eq!(
            entry,
            Entry::new(
                Operation::Remove,
                "/restore/foo",
                EntryKind::Hardlink(PathBuf::new()),
                Stat {
                    st_mode: 0o644,
                    ..Stat::default()
                }
            )
        );
    }

    #[test]
    fn test_unnamed_record() {
        let stream = StreamBuilder::new()
            .record(Operation::Add, "", &EntryKind::RegularFile, stat(0o644))
            .build();
        let entry = Decoder::new(&stream[..], "/restore")
            .next_entry()
            .unwrap()
            .unwrap();
        assert_eq!(entry.path, None);
    }

    #[test]
    fn test_reject_parent_components() {
        let stream = StreamBuilder::new()
            .record(
                Operation::Add,
                "/a/../../etc/passwd",
                &EntryKind::RegularFile,
                stat(0o644),
            )
            .build();
        let err = Decoder::new(&stream[..], "/restore")
            .next_entry()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsafePath(_)));
    }

    #[test]
    fn test_malformed_headers() {
        fn decode(input: &[u8]) -> ProtocolError {
            Decoder::new(input, "/restore").next_entry().unwrap_err()
        }

        assert!(matches!(
            decode(b"+- 644 0 0 0 0,0 3\nabc"),
            ProtocolError::InvalidHeader(_)
        ));
        assert!(matches!(
            decode(b"*- 644 0 0 0 0,0 0 0\n"),
            ProtocolError::InvalidHeader(_)
        ));
        assert!(matches!(
            decode(b"+x 644 0 0 0 0,0 0 0\n"),
            ProtocolError::UnknownType('x')
        ));
        assert!(matches!(
            decode(b"+- 648 0 0 0 0,0 0 0\n"),
            ProtocolError::InvalidHeader(_)
        ));
        assert!(matches!(
            decode(b"+- 644 0 0 0 0,0 10 0\nshort"),
            ProtocolError::UnexpectedEof("path")
        ));
        assert!(matches!(
            decode(b"+- 644 0 0 0 0,0 99999 0\n"),
            ProtocolError::TooLong { what: "path", .. }
        ));
        assert!(matches!(
            decode(b"+- 644 0 0 0"),
            ProtocolError::UnexpectedEof("record header")
        ));
        assert!(matches!(
            decode(b"+l 777 0 0 0 0,0 2 0\n/x"),
            ProtocolError::InvalidHeader(_)
        ));
        assert!(matches!(
            decode(&[b'x'; 300]),
            ProtocolError::TooLong { what: "record header", .. }
        ));
        assert!(matches!(
            decode(&[b'x'; 256]),
            ProtocolError::TooLong { what: "record header", .. }
        ));
        // short of the limit, a missing newline is a truncated stream
        assert!(matches!(
            decode(&[b'x'; 255]),
            ProtocolError::UnexpectedEof("record header")
        ));
    }

    #[test]
    fn test_block_headers() {
        let mut input = b"01BLOCK08192\n" as &[u8];
        assert_eq!(read_block_header(&mut input).unwrap(), 8192);

        let mut input = b"01BLOCK00000\n" as &[u8];
        assert_eq!(read_block_header(&mut input).unwrap(), 0);

        for bad in [
            &b"01BLOCK08193\n"[..],
            b"02BLOCK00001\n",
            b"01BLOCK0000x\n",
            b"01BLOCK-0001\n",
            b"01BLOCK00001 ",
        ] {
            let mut input = bad;
            assert_eq!(
                read_block_header(&mut input).unwrap_err().kind(),
                io::ErrorKind::InvalidData,
                "{:?}",
                String::from_utf8_lossy(bad)
            );
        }

        let mut input = b"01BLO" as &[u8];
        assert_eq!(
            read_block_header(&mut input).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
