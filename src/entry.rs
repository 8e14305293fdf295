use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::codec::RawHeader;
use crate::error::{Error, Result};

/// File-type bits of a mode word
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Permission bits of a mode word (including setuid/setgid/sticky)
pub const S_IMODE: u32 = 0o7777;

/// The kind of file an entry describes, derived from its mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
}

impl FileKind {
    /// Classify a mode word. Socket and unknown type bits yield `None`.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(FileKind::Regular),
            S_IFDIR => Some(FileKind::Directory),
            S_IFLNK => Some(FileKind::Symlink),
            S_IFIFO => Some(FileKind::Fifo),
            S_IFCHR => Some(FileKind::CharDevice),
            S_IFBLK => Some(FileKind::BlockDevice),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Regular => S_IFREG,
            FileKind::Directory => S_IFDIR,
            FileKind::Symlink => S_IFLNK,
            FileKind::Fifo => S_IFIFO,
            FileKind::CharDevice => S_IFCHR,
            FileKind::BlockDevice => S_IFBLK,
        }
    }
}

/// Text encoding applied to pathnames the container stores as raw bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// One byte per character (ISO-8859-1); the legacy zip fallback
    Latin1,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Latin1 => "latin-1",
        }
    }

    /// Decode a stored pathname. Invalid UTF-8 is replaced rather than
    /// rejected; the returned flag reports whether that happened.
    pub(crate) fn decode(self, bytes: &[u8]) -> (String, bool) {
        match self {
            Encoding::Utf8 => match String::from_utf8_lossy(bytes) {
                Cow::Borrowed(s) => (s.to_string(), false),
                Cow::Owned(s) => (s, true),
            },
            Encoding::Latin1 => (bytes.iter().map(|&b| b as char).collect(), false),
        }
    }

    pub(crate) fn encode(self, pathname: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(pathname.as_bytes().to_vec()),
            Encoding::Latin1 => pathname
                .chars()
                .map(|c| u8::try_from(u32::from(c)).ok())
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| Error::Encoding {
                    pathname: pathname.to_string(),
                    encoding: self.name(),
                }),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata for one archive member.
///
/// Entries are plain values: they hold no codec resources and stay valid
/// after the session that produced them is closed. The header position is
/// the exception; it only has meaning for the session instance (and byte
/// source) it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub pathname: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// File-type bits plus permission bits
    pub mode: u32,
    pub encoding: Encoding,
    header_position: Option<u64>,
}

impl Entry {
    /// A regular file entry, mode 0644, modified now
    pub fn new(pathname: impl Into<String>) -> Self {
        Entry {
            pathname: pathname.into(),
            size: 0,
            mtime: Utc::now(),
            mode: S_IFREG | 0o644,
            encoding: Encoding::default(),
            header_position: None,
        }
    }

    /// A directory entry, mode 0755, modified now
    pub fn directory(pathname: impl Into<String>) -> Self {
        Entry {
            mode: S_IFDIR | 0o755,
            ..Entry::new(pathname)
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_mtime(mut self, mtime: DateTime<Utc>) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Build an entry from a file-system object. The pathname is `path` as given.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;

        let mtime = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Entry {
            pathname: path.to_string_lossy().to_string(),
            size: if metadata.is_file() { metadata.len() } else { 0 },
            mtime,
            mode: mode_of(&metadata),
            encoding: Encoding::default(),
            header_position: None,
        })
    }

    /// Build an entry from a header the codec just read.
    /// `lossy` is set when the pathname was not valid in the chosen encoding.
    pub(crate) fn from_raw(raw: &RawHeader, encoding: Encoding) -> (Self, bool) {
        let decode_with = if raw.pathname_is_utf8 {
            Encoding::Utf8
        } else {
            encoding
        };
        let (pathname, lossy) = decode_with.decode(&raw.pathname);

        let entry = Entry {
            pathname,
            size: raw.size,
            mtime: DateTime::from_timestamp(raw.mtime, 0).unwrap_or_default(),
            mode: (raw.file_type & S_IFMT) | (raw.perm & S_IMODE),
            encoding,
            header_position: Some(raw.position),
        };
        (entry, lossy)
    }

    /// Convert to the codec's header representation for writing
    pub(crate) fn to_raw(&self) -> Result<RawHeader> {
        Ok(RawHeader {
            pathname: self.encoding.encode(&self.pathname)?,
            pathname_is_utf8: self.encoding == Encoding::Utf8,
            file_type: self.mode & S_IFMT,
            perm: self.mode & S_IMODE,
            size: self.size,
            mtime: self.mtime.timestamp(),
            position: 0,
        })
    }

    /// Codec-assigned position of this entry's header, if it was read from an archive
    pub fn header_position(&self) -> Option<u64> {
        self.header_position
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    pub fn permissions(&self) -> u32 {
        self.mode & S_IMODE
    }

    pub fn is_file(&self) -> bool {
        self.kind() == Some(FileKind::Regular)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == Some(FileKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == Some(FileKind::Symlink)
    }

    pub fn is_fifo(&self) -> bool {
        self.kind() == Some(FileKind::Fifo)
    }

    pub fn is_char_device(&self) -> bool {
        self.kind() == Some(FileKind::CharDevice)
    }

    pub fn is_block_device(&self) -> bool {
        self.kind() == Some(FileKind::BlockDevice)
    }
}

impl From<&str> for Entry {
    fn from(pathname: &str) -> Self {
        Entry::new(pathname)
    }
}

impl From<String> for Entry {
    fn from(pathname: String) -> Self {
        Entry::new(pathname)
    }
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        S_IFDIR | 0o755
    } else if file_type.is_symlink() {
        S_IFLNK | 0o777
    } else if metadata.permissions().readonly() {
        S_IFREG | 0o444
    } else {
        S_IFREG | 0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pathname: &[u8], file_type: u32) -> RawHeader {
        RawHeader {
            pathname: pathname.to_vec(),
            pathname_is_utf8: false,
            file_type,
            perm: 0o640,
            size: 12,
            mtime: 1_700_000_000,
            position: 1024,
        }
    }

    #[test]
    fn test_kind_queries_are_exclusive() {
        let kinds = [S_IFREG, S_IFDIR, S_IFLNK, S_IFIFO, S_IFCHR, S_IFBLK];
        for bits in kinds {
            let entry = Entry::new("x").with_mode(bits | 0o644);
            let answers = [
                entry.is_file(),
                entry.is_dir(),
                entry.is_symlink(),
                entry.is_fifo(),
                entry.is_char_device(),
                entry.is_block_device(),
            ];
            assert_eq!(answers.iter().filter(|b| **b).count(), 1, "mode {bits:o}");
        }

        let socket = Entry::new("s").with_mode(S_IFSOCK | 0o755);
        assert_eq!(socket.kind(), None);
        assert!(!socket.is_file() && !socket.is_dir());
    }

    #[test]
    fn test_from_raw() {
        let (entry, lossy) = Entry::from_raw(&raw(b"dir/file.txt", S_IFREG), Encoding::Utf8);
        assert!(!lossy);
        assert_eq!(entry.pathname, "dir/file.txt");
        assert_eq!(entry.size, 12);
        assert_eq!(entry.mode, S_IFREG | 0o640);
        assert_eq!(entry.mtime.timestamp(), 1_700_000_000);
        assert_eq!(entry.header_position(), Some(1024));
    }

    #[test]
    fn test_from_raw_latin1_and_lossy_utf8() {
        let (entry, lossy) = Entry::from_raw(&raw(b"caf\xe9", S_IFREG), Encoding::Latin1);
        assert!(!lossy);
        assert_eq!(entry.pathname, "café");

        let (_, lossy) = Entry::from_raw(&raw(b"caf\xe9", S_IFREG), Encoding::Utf8);
        assert!(lossy);
    }

    #[test]
    fn test_to_raw() {
        let entry = Entry::directory("docs/").with_mtime(DateTime::from_timestamp(86400, 0).unwrap());
        let raw = entry.to_raw().unwrap();
        assert_eq!(raw.pathname, b"docs/");
        assert_eq!(raw.file_type, S_IFDIR);
        assert_eq!(raw.perm, 0o755);
        assert_eq!(raw.mtime, 86400);
    }

    #[test]
    fn test_latin1_rejects_wide_chars() {
        let entry = Entry::new("日本.txt").with_encoding(Encoding::Latin1);
        let err = entry.to_raw().unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, b"hello").unwrap();

        let entry = Entry::from_path(&file).unwrap();
        assert!(entry.is_file());
        assert_eq!(entry.size, 5);
        assert!(entry.header_position().is_none());

        let entry = Entry::from_path(dir.path()).unwrap();
        assert!(entry.is_dir());
        assert_eq!(entry.size, 0);
    }
}
