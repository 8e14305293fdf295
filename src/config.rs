use std::fmt;

use crate::entry::Encoding;
use crate::format::{Filter, Format};

/// Suggested block size handed to the codec when opening for read.
/// The codec may adjust it; anything below one tar block is raised to 512.
pub const BLOCK_SIZE: usize = 10240;

/// Smallest read buffer the codecs will accept.
pub(crate) const MIN_BLOCK_SIZE: usize = 512;

/// How a session is opened against its byte source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    /// Reserved. Opening a session in this mode is rejected.
    Append,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Read => "read",
            Mode::Write => "write",
            Mode::Append => "append",
        })
    }
}

/// Open-time configuration for an [`Archive`](crate::Archive).
///
/// `format` and `filter` left as `None` are inferred from the file name when
/// the session is opened from a path. In read mode anything still unresolved
/// falls back to probing every known format/filter; write mode requires a
/// format.
///
/// ```
/// use arcsession::{ArchiveOptions, Filter, Format};
///
/// let opts = ArchiveOptions::write(Format::Tar).filter(Filter::Gzip);
/// assert_eq!(opts.format, Some(Format::Tar));
/// ```
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub mode: Mode,
    pub format: Option<Format>,
    pub filter: Option<Filter>,
    /// Text encoding used for pathnames that the container does not tag itself
    pub encoding: Encoding,
    pub block_size: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            mode: Mode::Read,
            format: None,
            filter: None,
            encoding: Encoding::default(),
            block_size: BLOCK_SIZE,
        }
    }
}

impl ArchiveOptions {
    /// Read mode, format and filter probed or inferred
    pub fn read() -> Self {
        Self::default()
    }

    /// Write mode with an explicit container format
    pub fn write(format: Format) -> Self {
        ArchiveOptions {
            mode: Mode::Write,
            format: Some(format),
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Block size after the codec's lower bound is applied
    pub(crate) fn effective_block_size(&self) -> usize {
        self.block_size.max(MIN_BLOCK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ArchiveOptions::default();
        assert_eq!(opts.mode, Mode::Read);
        assert!(opts.format.is_none());
        assert!(opts.filter.is_none());
        assert_eq!(opts.block_size, BLOCK_SIZE);
    }

    #[test]
    fn test_block_size_floor() {
        assert_eq!(ArchiveOptions::read().block_size(16).effective_block_size(), 512);
        assert_eq!(
            ArchiveOptions::read().block_size(65536).effective_block_size(),
            65536
        );
    }

    #[test]
    fn test_write_sets_mode_and_format() {
        let opts = ArchiveOptions::write(Format::Zip).filter(Filter::Bzip2);
        assert_eq!(opts.mode, Mode::Write);
        assert_eq!(opts.format, Some(Format::Zip));
        assert_eq!(opts.filter, Some(Filter::Bzip2));
    }
}
