//! Container codecs behind the session layer.
//!
//! A read handle is configured by calling the enable functions of the
//! capability registry on a [`ReadConfig`], then opened over a byte source:
//! the filter is sniffed from the first bytes, and the enabled formats bid on
//! a prefix of the decoded stream. A write handle is configured the same way
//! with exactly one format and at most one filter.

pub(crate) mod ar;
pub(crate) mod cpio;
pub(crate) mod filter;
pub(crate) mod tar;
pub(crate) mod zip;

use std::io::BufReader;

use crate::error::{Error, Result};
use crate::source::{ReadSeek, SyncWrite, read_full};

use self::filter::{Decoder, Encoder, Peeked};

/// Header fields as a codec reads or writes them, before pathname decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawHeader {
    pub pathname: Vec<u8>,
    /// The container itself marks the pathname as UTF-8
    pub pathname_is_utf8: bool,
    pub file_type: u32,
    pub perm: u32,
    pub size: u64,
    pub mtime: i64,
    /// Codec-assigned position of the header: a byte offset in the decoded
    /// stream for streaming formats, the central-directory index for zip
    pub position: u64,
}

/// Read side of an open codec handle
pub(crate) trait ReadHandle<'a> {
    /// Advance to the next header. Unread body bytes of the current entry are skipped.
    fn next_header(&mut self) -> Result<Option<RawHeader>>;

    /// Read body bytes of the current entry; 0 once the body is exhausted.
    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Non-fatal conditions noticed since the last call
    fn take_warnings(&mut self) -> Vec<String>;

    /// Release codec state and hand back the byte source
    fn close(self: Box<Self>) -> Box<dyn ReadSeek + 'a>;
}

/// Write side of an open codec handle
pub(crate) trait WriteHandle<'a> {
    /// Start a new entry. An unfinished previous entry is finished first.
    fn write_header(&mut self, header: &RawHeader) -> Result<()>;

    fn write_body(&mut self, data: &[u8]) -> Result<()>;

    /// Pad out the current entry
    fn finish_entry(&mut self) -> Result<()>;

    fn take_warnings(&mut self) -> Vec<String>;

    /// Write the container trailer and the filter trailer, then hand back the sink
    fn close(self: Box<Self>) -> Result<Box<dyn SyncWrite + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadFormat {
    Tar,
    Zip,
    Ar,
    Cpio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadFilter {
    Gzip,
    Bzip2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteFormat {
    Ustar,
    Pax,
    Gnu,
    Zip,
    CpioNewc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum WriteFilter {
    #[default]
    None,
    Gzip,
    Bzip2,
}

/// Formats and filters a read handle will accept
#[derive(Debug, Clone, Default)]
pub(crate) struct ReadConfig {
    formats: Vec<ReadFormat>,
    filters: Vec<ReadFilter>,
}

impl ReadConfig {
    fn enable_format(&mut self, format: ReadFormat) {
        if !self.formats.contains(&format) {
            self.formats.push(format);
        }
    }

    fn enable_filter(&mut self, filter: ReadFilter) {
        if !self.filters.contains(&filter) {
            self.filters.push(filter);
        }
    }

    pub(crate) fn has_formats(&self) -> bool {
        !self.formats.is_empty()
    }
}

/// The single format and filter a write handle produces
#[derive(Debug, Clone, Default)]
pub(crate) struct WriteConfig {
    format: Option<WriteFormat>,
    filter: WriteFilter,
}

pub(crate) type ReadEnable = fn(&mut ReadConfig);
pub(crate) type WriteEnable = fn(&mut WriteConfig);

pub(crate) fn read_support_format_tar(config: &mut ReadConfig) {
    config.enable_format(ReadFormat::Tar);
}

pub(crate) fn read_support_format_zip(config: &mut ReadConfig) {
    config.enable_format(ReadFormat::Zip);
}

pub(crate) fn read_support_format_ar(config: &mut ReadConfig) {
    config.enable_format(ReadFormat::Ar);
}

pub(crate) fn read_support_format_cpio(config: &mut ReadConfig) {
    config.enable_format(ReadFormat::Cpio);
}

pub(crate) fn read_support_filter_gzip(config: &mut ReadConfig) {
    config.enable_filter(ReadFilter::Gzip);
}

pub(crate) fn read_support_filter_bzip2(config: &mut ReadConfig) {
    config.enable_filter(ReadFilter::Bzip2);
}

/// Uncompressed input is always accepted; nothing to enable.
pub(crate) fn read_support_filter_none(_config: &mut ReadConfig) {}

pub(crate) fn write_set_format_ustar(config: &mut WriteConfig) {
    config.format = Some(WriteFormat::Ustar);
}

pub(crate) fn write_set_format_pax(config: &mut WriteConfig) {
    config.format = Some(WriteFormat::Pax);
}

pub(crate) fn write_set_format_gnutar(config: &mut WriteConfig) {
    config.format = Some(WriteFormat::Gnu);
}

pub(crate) fn write_set_format_zip(config: &mut WriteConfig) {
    config.format = Some(WriteFormat::Zip);
}

pub(crate) fn write_set_format_cpio_newc(config: &mut WriteConfig) {
    config.format = Some(WriteFormat::CpioNewc);
}

pub(crate) fn write_add_filter_gzip(config: &mut WriteConfig) {
    config.filter = WriteFilter::Gzip;
}

pub(crate) fn write_add_filter_bzip2(config: &mut WriteConfig) {
    config.filter = WriteFilter::Bzip2;
}

pub(crate) fn write_add_filter_none(config: &mut WriteConfig) {
    config.filter = WriteFilter::None;
}

/// Bytes of decoded stream each format gets to look at when bidding
pub(crate) const BID_BYTES: usize = 512;

/// Order in which enabled formats bid: exact magic first, then tar,
/// which is only recognized by its header checksum.
const BID_ORDER: [ReadFormat; 4] = [
    ReadFormat::Zip,
    ReadFormat::Ar,
    ReadFormat::Cpio,
    ReadFormat::Tar,
];

/// Pick the enabled format that recognizes `prefix`
pub(crate) fn bid(prefix: &[u8], config: &ReadConfig) -> Option<ReadFormat> {
    BID_ORDER
        .into_iter()
        .filter(|format| config.formats.contains(format))
        .find(|format| match format {
            ReadFormat::Zip => zip::bid(prefix),
            ReadFormat::Ar => ar::bid(prefix),
            ReadFormat::Cpio => cpio::bid(prefix),
            ReadFormat::Tar => tar::bid(prefix),
        })
}

/// Signatures of containers that are recognized but have no reader here
const FOREIGN_MAGIC: [(&[u8], &str); 6] = [
    (b"Rar!\x1a\x07", "RAR"),
    (b"7z\xbc\xaf\x27\x1c", "7-Zip"),
    (b"MSCF\0\0\0\0", "CAB"),
    (b"xar!", "XAR"),
    (b"070707", "old-style cpio"),
    (b"\xc7\x71", "binary cpio"),
];

fn foreign_format(prefix: &[u8]) -> Option<&'static str> {
    if prefix.len() > 5 && &prefix[2..5] == b"-lh" {
        return Some("LHA");
    }
    FOREIGN_MAGIC
        .iter()
        .find(|(magic, _)| prefix.starts_with(magic))
        .map(|(_, name)| *name)
}

/// Open `source` for reading with the formats and filters of `config`.
///
/// The filter is sniffed first; the first [`BID_BYTES`] of the decoded
/// stream are then offered to each enabled format. The chosen codec sees the
/// stream from its first byte.
pub(crate) fn open_reader<'a>(
    source: Box<dyn ReadSeek + 'a>,
    config: &ReadConfig,
    block_size: usize,
) -> Result<Box<dyn ReadHandle<'a> + 'a>> {
    let mut input = BufReader::with_capacity(block_size, source);
    let filter = filter::sniff(&mut input, &config.filters)?;
    let mut decoder = Decoder::new(input, filter);

    let mut prefix = vec![0u8; BID_BYTES];
    let n = read_full(&mut decoder, &mut prefix)
        .map_err(|e| Error::fatal("open", format!("Failed to decode archive stream: {e}")))?;
    prefix.truncate(n);

    let Some(format) = bid(&prefix, config) else {
        let message = match foreign_format(&prefix) {
            Some(name) => format!("{name} archives are recognized but cannot be read"),
            None if prefix.is_empty() => "Empty input is not an archive".to_string(),
            None => "Unrecognized archive format".to_string(),
        };
        return Err(Error::fatal("open", message));
    };

    log::debug!("opened {format:?} reader (filter {filter:?})");

    Ok(match format {
        ReadFormat::Tar => Box::new(tar::TarReader::new(Peeked::new(prefix, decoder))),
        ReadFormat::Ar => Box::new(ar::ArReader::new(Peeked::new(prefix, decoder))?),
        ReadFormat::Cpio => Box::new(cpio::CpioReader::new(Peeked::new(prefix, decoder))),
        ReadFormat::Zip => Box::new(zip::ZipReader::open(prefix, decoder)?),
    })
}

/// Open `sink` for writing with the format and filter of `config`.
pub(crate) fn open_writer<'a>(
    sink: Box<dyn SyncWrite + 'a>,
    config: &WriteConfig,
) -> Result<Box<dyn WriteHandle<'a> + 'a>> {
    let format = config.format.ok_or(Error::FormatRequired)?;
    let encoder = Encoder::new(sink, config.filter);

    log::debug!("opened {format:?} writer (filter {:?})", config.filter);

    Ok(match format {
        WriteFormat::Ustar => Box::new(tar::TarWriter::new(encoder, tar::TarFlavor::Ustar)),
        WriteFormat::Pax => Box::new(tar::TarWriter::new(encoder, tar::TarFlavor::Pax)),
        WriteFormat::Gnu => Box::new(tar::TarWriter::new(encoder, tar::TarFlavor::Gnu)),
        WriteFormat::Zip => Box::new(zip::ZipWriter::new(encoder)),
        WriteFormat::CpioNewc => Box::new(cpio::CpioWriter::new(encoder)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn all_formats() -> ReadConfig {
        let mut config = ReadConfig::default();
        for enable in [
            read_support_format_tar,
            read_support_format_zip,
            read_support_format_ar,
            read_support_format_cpio,
            read_support_filter_gzip,
            read_support_filter_bzip2,
        ] {
            enable(&mut config);
        }
        config
    }

    #[test]
    fn test_enable_is_idempotent() {
        let mut config = ReadConfig::default();
        read_support_format_tar(&mut config);
        read_support_format_tar(&mut config);
        assert_eq!(config.formats, vec![ReadFormat::Tar]);
        assert!(config.has_formats());
    }

    #[test]
    fn test_bid_magic() {
        let config = all_formats();
        assert_eq!(bid(b"PK\x03\x04rest", &config), Some(ReadFormat::Zip));
        assert_eq!(bid(b"!<arch>\n", &config), Some(ReadFormat::Ar));
        assert_eq!(bid(b"070701000000", &config), Some(ReadFormat::Cpio));
        assert_eq!(bid(&[0u8; 512], &config), Some(ReadFormat::Tar));
        assert_eq!(bid(b"hello world", &config), None);
    }

    #[test]
    fn test_bid_skips_disabled_formats() {
        let mut config = ReadConfig::default();
        read_support_format_tar(&mut config);
        assert_eq!(bid(b"PK\x03\x04rest", &config), None);
    }

    #[test]
    fn test_foreign_magic_is_reported() {
        let source = Box::new(Cursor::new(b"Rar!\x1a\x07\x00more bytes".to_vec()));
        let err = open_reader(source, &all_formats(), 512).err().unwrap();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("RAR"), "{err}");
    }

    #[test]
    fn test_unrecognized_input() {
        let source = Box::new(Cursor::new(b"just some text".to_vec()));
        let err = open_reader(source, &all_formats(), 512).err().unwrap();
        assert!(err.to_string().contains("Unrecognized archive format"));
    }

    #[test]
    fn test_writer_requires_format() {
        let sink = Box::new(crate::source::Unsynced(Vec::new()));
        let err = open_writer(sink, &WriteConfig::default()).err().unwrap();
        assert!(matches!(err, Error::FormatRequired));
    }
}
