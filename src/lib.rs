//! Streaming, format-agnostic archive sessions.
//!
//! An [`Archive`] reads or writes one container (tar in its ustar, pax and
//! GNU flavors, zip, ar, newc cpio), optionally wrapped in gzip or bzip2.
//! Reading is a forward cursor over entries; [`SeekableArchive`] layers
//! random access by pathname on top of it, reopening the source when it has
//! to move backward.
//!
//! ```no_run
//! use arcsession::{Archive, ArchiveOptions, Format};
//!
//! let mut out = Archive::open("notes.tar.gz", ArchiveOptions::write(Format::Tar))?;
//! out.write("a.txt", b"abcd")?;
//! out.write_directory("docs")?;
//! out.close()?;
//!
//! let mut archive = arcsession::SeekableArchive::open("notes.tar.gz", ArchiveOptions::read())?;
//! assert_eq!(&archive.read("a.txt")?[..], b"abcd");
//! # Ok::<(), arcsession::Error>(())
//! ```

pub mod archive;
pub mod cache;
mod codec;
pub mod config;
pub mod detect;
pub mod entry;
pub mod error;
pub mod format;
pub mod source;

pub use archive::{
    Archive, Entries, EntryReadStream, EntryWriteStream, Member, SeekableArchive, SessionState,
};
pub use cache::EntryCache;
pub use config::{ArchiveOptions, BLOCK_SIZE, Mode};
pub use detect::{is_archive, is_archive_path};
pub use entry::{
    Encoding, Entry, FileKind, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG,
    S_IFSOCK, S_IMODE,
};
pub use error::{Error, ErrorKind, Result};
pub use format::{Filter, Format, guess_format, is_archive_name, is_archive_name_in};
pub use source::{ReadSeek, SyncWrite};
