use std::fmt;
use std::str::FromStr;

use crate::codec::{self, ReadEnable, WriteEnable};
use crate::error::Error;

/// Container formats known to the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// POSIX ustar
    Tar,
    /// POSIX pax (ustar plus extended header records)
    Pax,
    /// GNU tar
    Gnu,
    Zip,
    Rar,
    SevenZip,
    Ar,
    Cab,
    Cpio,
    Iso,
    Lha,
    Xar,
}

/// Compression layer wrapped around the container stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Gzip,
    Bzip2,
    Uncompressed,
}

/// One row of the capability registry: the tag plus the functions that
/// configure a read handle or a write handle for it. `None` marks a direction
/// the codec layer does not support.
struct FormatSupport {
    format: Format,
    tag: &'static str,
    read: Option<ReadEnable>,
    write: Option<WriteEnable>,
}

struct FilterSupport {
    filter: Filter,
    tag: &'static str,
    read: ReadEnable,
    write: WriteEnable,
}

const FORMATS: [FormatSupport; 12] = [
    FormatSupport {
        format: Format::Tar,
        tag: "tar",
        read: Some(codec::read_support_format_tar as ReadEnable),
        write: Some(codec::write_set_format_ustar as WriteEnable),
    },
    FormatSupport {
        format: Format::Pax,
        tag: "pax",
        read: Some(codec::read_support_format_tar as ReadEnable),
        write: Some(codec::write_set_format_pax as WriteEnable),
    },
    FormatSupport {
        format: Format::Gnu,
        tag: "gnu",
        read: Some(codec::read_support_format_tar as ReadEnable),
        write: Some(codec::write_set_format_gnutar as WriteEnable),
    },
    FormatSupport {
        format: Format::Zip,
        tag: "zip",
        read: Some(codec::read_support_format_zip as ReadEnable),
        write: Some(codec::write_set_format_zip as WriteEnable),
    },
    FormatSupport {
        format: Format::Rar,
        tag: "rar",
        read: None,
        write: None,
    },
    FormatSupport {
        format: Format::SevenZip,
        tag: "7zip",
        read: None,
        write: None,
    },
    FormatSupport {
        format: Format::Ar,
        tag: "ar",
        read: Some(codec::read_support_format_ar as ReadEnable),
        write: None,
    },
    FormatSupport {
        format: Format::Cab,
        tag: "cab",
        read: None,
        write: None,
    },
    FormatSupport {
        format: Format::Cpio,
        tag: "cpio",
        read: Some(codec::read_support_format_cpio as ReadEnable),
        write: Some(codec::write_set_format_cpio_newc as WriteEnable),
    },
    FormatSupport {
        format: Format::Iso,
        tag: "iso",
        read: None,
        write: None,
    },
    FormatSupport {
        format: Format::Lha,
        tag: "lha",
        read: None,
        write: None,
    },
    FormatSupport {
        format: Format::Xar,
        tag: "xar",
        read: None,
        write: None,
    },
];

const FILTERS: [FilterSupport; 3] = [
    FilterSupport {
        filter: Filter::Gzip,
        tag: "gz",
        read: codec::read_support_filter_gzip as ReadEnable,
        write: codec::write_add_filter_gzip as WriteEnable,
    },
    FilterSupport {
        filter: Filter::Bzip2,
        tag: "bz2",
        read: codec::read_support_filter_bzip2 as ReadEnable,
        write: codec::write_add_filter_bzip2 as WriteEnable,
    },
    FilterSupport {
        filter: Filter::Uncompressed,
        tag: "none",
        read: codec::read_support_filter_none as ReadEnable,
        write: codec::write_add_filter_none as WriteEnable,
    },
];

/// File extensions mapped to formats, for quick detection
const FORMAT_EXTENSIONS: [(&str, Format); 11] = [
    ("tar", Format::Tar),
    ("zip", Format::Zip),
    ("rar", Format::Rar),
    ("7z", Format::SevenZip),
    ("ar", Format::Ar),
    ("cab", Format::Cab),
    ("rpm", Format::Cpio),
    ("cpio", Format::Cpio),
    ("iso", Format::Iso),
    ("lha", Format::Lha),
    ("xar", Format::Xar),
];

const FILTER_EXTENSIONS: [(&str, Filter); 2] = [("gz", Filter::Gzip), ("bz2", Filter::Bzip2)];

/// Single suffixes that stand for a tar stream plus a filter
const COMBINED_EXTENSIONS: [(&str, Filter); 3] = [
    ("tgz", Filter::Gzip),
    ("tbz2", Filter::Bzip2),
    ("tbz", Filter::Bzip2),
];

impl Format {
    pub const ALL: [Format; 12] = [
        Format::Tar,
        Format::Pax,
        Format::Gnu,
        Format::Zip,
        Format::Rar,
        Format::SevenZip,
        Format::Ar,
        Format::Cab,
        Format::Cpio,
        Format::Iso,
        Format::Lha,
        Format::Xar,
    ];

    fn support(self) -> &'static FormatSupport {
        // The table is indexed in the same order as `ALL`.
        &FORMATS[self as usize]
    }

    pub fn tag(self) -> &'static str {
        self.support().tag
    }

    pub(crate) fn read_support(self) -> Option<ReadEnable> {
        self.support().read
    }

    pub(crate) fn write_support(self) -> Option<WriteEnable> {
        self.support().write
    }

    pub fn can_read(self) -> bool {
        self.read_support().is_some()
    }

    pub fn can_write(self) -> bool {
        self.write_support().is_some()
    }
}

impl Filter {
    pub const ALL: [Filter; 3] = [Filter::Gzip, Filter::Bzip2, Filter::Uncompressed];

    fn support(self) -> &'static FilterSupport {
        &FILTERS[self as usize]
    }

    pub fn tag(self) -> &'static str {
        self.support().tag
    }

    pub(crate) fn read_support(self) -> ReadEnable {
        self.support().read
    }

    pub(crate) fn write_support(self) -> WriteEnable {
        self.support().write
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FORMATS
            .iter()
            .find(|row| row.tag == s)
            .map(|row| row.format)
            .ok_or_else(|| Error::UnknownTag(s.to_string()))
    }
}

impl FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FILTERS
            .iter()
            .find(|row| row.tag == s)
            .map(|row| row.filter)
            .ok_or_else(|| Error::UnknownTag(s.to_string()))
    }
}

/// Split `name` at its last extension, ignoring leading dots of the final
/// path component (so `.gz` alone has no extension).
fn split_extension(name: &str) -> (&str, Option<&str>) {
    let file_start = name.rfind(['/', '\\']).map_or(0, |i| i + 1);
    let file = &name[file_start..];
    let leading_dots = file.len() - file.trim_start_matches('.').len();

    match file[leading_dots..].rfind('.') {
        Some(i) => {
            let dot = file_start + leading_dots + i;
            (&name[..dot], Some(&name[dot + 1..]))
        }
        None => (name, None),
    }
}

/// Infer format and filter from a file name.
///
/// At most one filter suffix is consumed (`.tar.gz` -> filter `gz`, format
/// `tar`), then one format suffix. Matching ignores ASCII case.
pub fn guess_format(name: &str) -> (Option<Format>, Option<Filter>) {
    let lower = name.to_ascii_lowercase();
    let (rest, ext) = split_extension(&lower);
    let Some(ext) = ext else {
        return (None, None);
    };

    if let Some((_, filter)) = COMBINED_EXTENSIONS.iter().find(|(e, _)| *e == ext) {
        return (Some(Format::Tar), Some(*filter));
    }

    let (filter, ext) = match FILTER_EXTENSIONS.iter().find(|(e, _)| *e == ext) {
        Some((_, filter)) => (Some(*filter), split_extension(rest).1),
        None => (None, Some(ext)),
    };

    let format = ext.and_then(|ext| {
        FORMAT_EXTENSIONS
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, format)| *format)
    });

    (format, filter)
}

/// Quick, I/O-free check of whether `name` looks like an archive.
///
/// Returns the most likely format, or `None` if the name carries no archive
/// extension.
pub fn is_archive_name(name: &str) -> Option<Format> {
    guess_format(name).0
}

/// Like [`is_archive_name`], but only formats listed in `formats` are accepted.
pub fn is_archive_name_in(name: &str, formats: &[Format]) -> Option<Format> {
    is_archive_name(name).filter(|format| formats.contains(format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_matches_all() {
        for (i, format) in Format::ALL.iter().enumerate() {
            assert_eq!(FORMATS[i].format, *format);
        }
        for (i, filter) in Filter::ALL.iter().enumerate() {
            assert_eq!(FILTERS[i].filter, *filter);
        }
    }

    #[test]
    fn test_is_archive_name() {
        assert_eq!(is_archive_name("foo"), None);
        assert_eq!(is_archive_name("foo.txt"), None);
        assert_eq!(is_archive_name("foo.txt.gz"), None);
        assert_eq!(is_archive_name("foo.tar.gz"), Some(Format::Tar));
        assert_eq!(is_archive_name("foo.tar.bz2"), Some(Format::Tar));
        assert_eq!(is_archive_name("foo.zip"), Some(Format::Zip));
        assert_eq!(is_archive_name("foo.rar"), Some(Format::Rar));
        assert_eq!(is_archive_name("foo.iso"), Some(Format::Iso));
        assert_eq!(is_archive_name("foo.rpm"), Some(Format::Cpio));
        assert_eq!(is_archive_name("x.tar.gz"), Some(Format::Tar));
        assert_eq!(is_archive_name("x.txt"), None);
    }

    #[test]
    fn test_is_archive_name_is_pure() {
        let first = is_archive_name("/no/such/dir/backup.TAR.GZ");
        let second = is_archive_name("/no/such/dir/backup.TAR.GZ");
        assert_eq!(first, Some(Format::Tar));
        assert_eq!(first, second);
    }

    #[test]
    fn test_is_archive_name_in() {
        assert_eq!(is_archive_name_in("a.zip", &[Format::Zip]), Some(Format::Zip));
        assert_eq!(is_archive_name_in("a.zip", &[Format::Tar]), None);
    }

    #[test]
    fn test_guess_format_filters() {
        assert_eq!(
            guess_format("a.tar.gz"),
            (Some(Format::Tar), Some(Filter::Gzip))
        );
        assert_eq!(
            guess_format("a.cpio.bz2"),
            (Some(Format::Cpio), Some(Filter::Bzip2))
        );
        assert_eq!(guess_format("a.gz"), (None, Some(Filter::Gzip)));
        assert_eq!(
            guess_format("release.tgz"),
            (Some(Format::Tar), Some(Filter::Gzip))
        );
        assert_eq!(guess_format("a.zip.gz.bz2"), (None, Some(Filter::Bzip2)));
    }

    #[test]
    fn test_split_extension_hidden_files() {
        assert_eq!(split_extension(".gz"), (".gz", None));
        assert_eq!(split_extension("dir.d/archive"), ("dir.d/archive", None));
        assert_eq!(split_extension("a.b/c.tar"), ("a.b/c", Some("tar")));
    }

    #[test]
    fn test_tags_round_trip() {
        for format in Format::ALL {
            assert_eq!(format.tag().parse::<Format>().unwrap(), format);
        }
        for filter in Filter::ALL {
            assert_eq!(filter.tag().parse::<Filter>().unwrap(), filter);
        }
        assert!("tarball".parse::<Format>().is_err());
    }

    #[test]
    fn test_capabilities() {
        assert!(Format::Tar.can_read() && Format::Tar.can_write());
        assert!(Format::Ar.can_read() && !Format::Ar.can_write());
        assert!(!Format::Rar.can_read() && !Format::Rar.can_write());
    }
}
