use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use crate::codec::{self, ReadConfig};
use crate::config::BLOCK_SIZE;
use crate::format::{Filter, Format};

/// Enable the listed formats and filters; empty slices mean "all of them".
/// An explicitly listed format without a reader yields `None`.
fn probe_config(formats: &[Format], filters: &[Filter]) -> Option<ReadConfig> {
    let mut config = ReadConfig::default();
    if formats.is_empty() {
        Format::ALL
            .iter()
            .filter_map(|format| format.read_support())
            .for_each(|enable| enable(&mut config));
    } else {
        for format in formats {
            let Some(enable) = format.read_support() else {
                log::debug!("no reader for {format}; not probing");
                return None;
            };
            enable(&mut config);
        }
    }
    if !config.has_formats() {
        return None;
    }

    let filters: &[Filter] = if filters.is_empty() { &Filter::ALL } else { filters };
    for filter in filters {
        (filter.read_support())(&mut config);
    }
    Some(config)
}

/// Check whether `source` opens as an archive of one of `formats`, wrapped
/// in one of `filters`. Listing a format that has no reader makes the whole
/// check `false`. Every failure, including I/O errors, is reported as
/// `false`; the source is dropped before returning.
pub fn is_archive<R: Read + Seek>(source: R, formats: &[Format], filters: &[Filter]) -> bool {
    let Some(config) = probe_config(formats, filters) else {
        return false;
    };
    match codec::open_reader(Box::new(source), &config, BLOCK_SIZE) {
        Ok(handle) => {
            drop(handle.close());
            true
        }
        Err(e) => {
            log::debug!("not an archive: {e}");
            false
        }
    }
}

/// [`is_archive`] for a file-system path
pub fn is_archive_path(path: impl AsRef<Path>, formats: &[Format], filters: &[Filter]) -> bool {
    match File::open(path.as_ref()) {
        Ok(file) => is_archive(file, formats, filters),
        Err(e) => {
            log::debug!("cannot open {}: {e}", path.as_ref().display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use crate::config::ArchiveOptions;
    use std::io::Cursor;

    fn archive_bytes(options: ArchiveOptions) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut archive = Archive::writer(&mut out, options).unwrap();
            archive.write("hello.txt", b"hello").unwrap();
            archive.close().unwrap();
        }
        out
    }

    #[test]
    fn test_detects_any_format() {
        let zip = archive_bytes(ArchiveOptions::write(Format::Zip));
        assert!(is_archive(Cursor::new(zip), &[], &[]));

        let tgz = archive_bytes(ArchiveOptions::write(Format::Tar).filter(Filter::Gzip));
        assert!(is_archive(Cursor::new(tgz), &[], &[]));
    }

    #[test]
    fn test_format_restriction() {
        let zip = archive_bytes(ArchiveOptions::write(Format::Zip));
        assert!(!is_archive(Cursor::new(zip.clone()), &[Format::Tar], &[]));
        assert!(is_archive(Cursor::new(zip), &[Format::Zip, Format::Tar], &[]));
    }

    #[test]
    fn test_unreadable_format_in_list() {
        let zip = archive_bytes(ArchiveOptions::write(Format::Zip));
        assert!(!is_archive(Cursor::new(zip.clone()), &[Format::Rar, Format::Zip], &[]));
        assert!(!is_archive(Cursor::new(zip), &[Format::Zip, Format::SevenZip], &[]));
    }

    #[test]
    fn test_filter_restriction() {
        let tbz = archive_bytes(ArchiveOptions::write(Format::Tar).filter(Filter::Bzip2));
        assert!(!is_archive(Cursor::new(tbz.clone()), &[], &[Filter::Gzip]));
        assert!(is_archive(Cursor::new(tbz), &[], &[Filter::Bzip2]));
    }

    #[test]
    fn test_non_archives() {
        assert!(!is_archive(Cursor::new(Vec::new()), &[], &[]));
        assert!(!is_archive(Cursor::new(b"plain text".to_vec()), &[], &[]));
        assert!(!is_archive(Cursor::new(Vec::new()), &[Format::Rar], &[]));
        assert!(!is_archive_path("/nonexistent/archive.tar", &[], &[]));
    }
}
