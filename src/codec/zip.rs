use std::io::{Cursor, Read, SeekFrom, Write};

use ::zip::CompressionMethod;
use ::zip::result::ZipError;
use ::zip::write::SimpleFileOptions;
use chrono::{Datelike, NaiveDate, Timelike};
use flate2::Crc;
use flate2::read::DeflateDecoder;

use super::filter::{Decoder, Encoder, Input};
use super::{RawHeader, ReadHandle, WriteHandle};
use crate::entry::{S_IFDIR, S_IFMT, S_IFREG, S_IMODE};
use crate::error::{Error, Result};
use crate::source::{ReadSeek, SyncWrite};

/// Maximum size to read for the End of Central Directory search (64KB should be enough)
const EOCD_SEARCH_SIZE: u64 = 65536;

/// Minimum size for EOCD (4 bytes signature + 18 bytes data)
const MIN_EOCD_SIZE: usize = 22;

/// Central Directory File Header minimum size (fixed portion)
const CDFH_MIN_SIZE: usize = 46;

/// Local File Header minimum size (fixed portion)
const LOCAL_HEADER_MIN_SIZE: usize = 30;

/// ZIP compression methods
const COMPRESSION_STORED: u16 = 0;
const COMPRESSION_DEFLATE: u16 = 8;

/// Bodies are decompressed into memory; refuse anything larger (1GB)
const MAX_DECOMPRESSED_SIZE: u64 = 1024 * 1024 * 1024;

/// Maximum compression ratio allowed (1000:1) to detect zip bombs
const MAX_COMPRESSION_RATIO: u64 = 1000;

const LOCAL_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];

/// "Version made by" host systems whose external attributes carry a unix mode
const HOST_UNIX: u8 = 3;
const HOST_OSX: u8 = 19;

/// Does `prefix` start with a local file header, or is it an empty archive?
pub(crate) fn bid(prefix: &[u8]) -> bool {
    prefix.starts_with(&LOCAL_SIGNATURE) || prefix.starts_with(&EOCD_SIGNATURE)
}

/// Information extracted from the End of Central Directory record
#[derive(Debug)]
struct EocdInfo {
    central_dir_offset: u64,
    central_dir_size: u64,
}

/// One central directory file header
#[derive(Debug, Clone)]
struct CentralRecord {
    name: Vec<u8>,
    utf8: bool,
    host: u8,
    method: u16,
    dos_time: u16,
    dos_date: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    external_attrs: u32,
    local_header_offset: u64,
}

impl CentralRecord {
    fn file_type_and_perm(&self) -> (u32, u32) {
        let named_dir = self.name.ends_with(b"/");
        let unix_mode = self.external_attrs >> 16;
        if matches!(self.host, HOST_UNIX | HOST_OSX) && unix_mode != 0 {
            let file_type = match unix_mode & S_IFMT {
                0 if named_dir => S_IFDIR,
                0 => S_IFREG,
                bits => bits,
            };
            return (file_type, unix_mode & S_IMODE);
        }
        // MS-DOS directory attribute
        if named_dir || self.external_attrs & 0x10 != 0 {
            (S_IFDIR, 0o755)
        } else {
            (S_IFREG, 0o644)
        }
    }
}

fn fatal(message: impl Into<String>) -> Error {
    Error::fatal("open", message)
}

/// Find the End of Central Directory record in the buffer.
/// Returns information about the central directory location.
fn find_eocd(data: &[u8]) -> Result<EocdInfo> {
    // Search backwards from the end for the EOCD signature
    for i in (0..=data.len().saturating_sub(MIN_EOCD_SIZE)).rev() {
        if data[i..].starts_with(&EOCD_SIGNATURE) {
            let eocd = &data[i..];

            if eocd.len() < MIN_EOCD_SIZE {
                continue;
            }

            // Disk number (offset 4) and disk with CD start (offset 6)
            let disk_number = u16::from_le_bytes([eocd[4], eocd[5]]);
            let disk_with_cd = u16::from_le_bytes([eocd[6], eocd[7]]);

            if disk_number != 0 || disk_with_cd != 0 {
                return Err(fatal(format!(
                    "Multi-disk ZIP archives are not supported (disk {disk_number}, CD disk {disk_with_cd})"
                )));
            }

            let central_dir_size_raw = u32::from_le_bytes([eocd[12], eocd[13], eocd[14], eocd[15]]);
            let central_dir_offset_raw =
                u32::from_le_bytes([eocd[16], eocd[17], eocd[18], eocd[19]]);

            // ZIP64 uses 0xFFFFFFFF as a placeholder
            if central_dir_size_raw == u32::MAX || central_dir_offset_raw == u32::MAX {
                return Err(fatal(
                    "ZIP64 archives are not supported (central directory fields use ZIP64 placeholder values)",
                ));
            }

            return Ok(EocdInfo {
                central_dir_offset: u64::from(central_dir_offset_raw),
                central_dir_size: u64::from(central_dir_size_raw),
            });
        }
    }

    Err(fatal("Could not find End of Central Directory record"))
}

fn le16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Parse central directory file headers, in directory order.
/// Records are 46 fixed bytes (sizes at 20/24, name length at 28, external
/// attributes at 38, local header offset at 42) followed by name, extra
/// field and comment.
fn parse_central_directory(data: &[u8], archive_size: u64) -> Result<Vec<CentralRecord>> {
    const CDFH_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x01, 0x02];

    let mut records = Vec::new();
    let mut pos = 0;

    while pos + CDFH_MIN_SIZE <= data.len() {
        if !data[pos..].starts_with(&CDFH_SIGNATURE) {
            break;
        }

        let general_purpose_flag = le16(data, pos + 8);
        let compressed_size_raw = le32(data, pos + 20);
        let uncompressed_size_raw = le32(data, pos + 24);
        let local_header_offset_raw = le32(data, pos + 42);

        // Check for ZIP64 placeholder values
        if compressed_size_raw == u32::MAX
            || uncompressed_size_raw == u32::MAX
            || local_header_offset_raw == u32::MAX
        {
            return Err(fatal(
                "ZIP64 entries are not supported (entry uses ZIP64 placeholder values)",
            ));
        }

        let local_header_offset = u64::from(local_header_offset_raw);
        if local_header_offset >= archive_size {
            return Err(fatal(format!(
                "Invalid local header offset {local_header_offset} for archive size {archive_size}"
            )));
        }

        let filename_len = le16(data, pos + 28) as usize;
        let extra_len = le16(data, pos + 30) as usize;
        let comment_len = le16(data, pos + 32) as usize;

        let total_entry_size = CDFH_MIN_SIZE
            .checked_add(filename_len)
            .and_then(|v| v.checked_add(extra_len))
            .and_then(|v| v.checked_add(comment_len))
            .ok_or_else(|| fatal(format!("Central directory entry size overflow at position {pos}")))?;

        let end = pos
            .checked_add(total_entry_size)
            .ok_or_else(|| fatal(format!("Central directory entry position overflow at position {pos}")))?;

        if end > data.len() {
            return Err(fatal(format!(
                "Truncated central directory entry at position {pos}"
            )));
        }

        records.push(CentralRecord {
            name: data[pos + CDFH_MIN_SIZE..pos + CDFH_MIN_SIZE + filename_len].to_vec(),
            utf8: general_purpose_flag & (1 << 11) != 0,
            host: data[pos + 5],
            method: le16(data, pos + 10),
            dos_time: le16(data, pos + 12),
            dos_date: le16(data, pos + 14),
            crc32: le32(data, pos + 16),
            compressed_size: u64::from(compressed_size_raw),
            uncompressed_size: u64::from(uncompressed_size_raw),
            external_attrs: le32(data, pos + 38),
            local_header_offset,
        });

        pos += total_entry_size;
    }

    Ok(records)
}

/// MS-DOS date and time, taken as UTC
fn dos_to_unix(date: u16, time: u16) -> i64 {
    let year = 1980 + i32::from(date >> 9);
    let month = u32::from((date >> 5) & 0x0f);
    let day = u32::from(date & 0x1f);
    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3f);
    let second = u32::from(time & 0x1f) * 2;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map_or(0, |t| t.and_utc().timestamp())
}

fn unix_to_dos(mtime: i64) -> ::zip::DateTime {
    chrono::DateTime::from_timestamp(mtime, 0)
        .and_then(|t| {
            let year = u16::try_from(t.year()).ok()?;
            ::zip::DateTime::from_date_and_time(
                year,
                t.month() as u8,
                t.day() as u8,
                t.hour() as u8,
                t.minute() as u8,
                t.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

/// Where the reader gets its random access from
enum ZipInput<'a> {
    /// Unfiltered source, seeked directly
    Direct(Input<'a>),
    /// Decompressed stream spooled into memory
    Spooled {
        data: Cursor<Vec<u8>>,
        decoder: Decoder<'a>,
    },
}

impl ZipInput<'_> {
    fn reader(&mut self) -> &mut dyn ReadSeek {
        match self {
            ZipInput::Direct(input) => input,
            ZipInput::Spooled { data, .. } => data,
        }
    }
}

/// Zip reader driven by the central directory; bodies are decompressed on first read
pub(crate) struct ZipReader<'a> {
    input: ZipInput<'a>,
    records: Vec<CentralRecord>,
    next: usize,
    current: Option<usize>,
    body: Option<Cursor<Vec<u8>>>,
    warnings: Vec<String>,
}

impl<'a> ZipReader<'a> {
    /// `prefix` holds the bytes already pulled from `decoder` during bidding
    pub(crate) fn open(prefix: Vec<u8>, decoder: Decoder<'a>) -> Result<Self> {
        let mut input = match decoder {
            Decoder::Plain(input) => ZipInput::Direct(input),
            mut other => {
                let mut data = prefix;
                other.read_to_end(&mut data).map_err(|e| fatal(format!("Failed to decode archive stream: {e}")))?;
                ZipInput::Spooled {
                    data: Cursor::new(data),
                    decoder: other,
                }
            }
        };

        let reader = input.reader();
        let size = reader.seek(SeekFrom::End(0))?;
        if size < MIN_EOCD_SIZE as u64 {
            return Err(fatal("File too small to be a valid ZIP archive"));
        }

        // Step 1: Read the end of the file to locate the End of Central Directory (EOCD)
        let tail_size = EOCD_SEARCH_SIZE.min(size);
        let mut tail = vec![0u8; tail_size as usize];
        reader.seek(SeekFrom::Start(size - tail_size))?;
        reader.read_exact(&mut tail)?;

        // Step 2: Parse the EOCD to find the central directory location
        let eocd = find_eocd(&tail)?;

        let cd_end = eocd
            .central_dir_offset
            .checked_add(eocd.central_dir_size)
            .ok_or_else(|| fatal("Central directory bounds overflow"))?;
        if cd_end > size {
            return Err(fatal(format!(
                "Central directory extends beyond file bounds (offset {} + size {} > file size {})",
                eocd.central_dir_offset, eocd.central_dir_size, size
            )));
        }

        // Step 3: Read and parse the central directory
        let mut central_dir = vec![0u8; eocd.central_dir_size as usize];
        reader.seek(SeekFrom::Start(eocd.central_dir_offset))?;
        reader.read_exact(&mut central_dir)?;
        let records = parse_central_directory(&central_dir, size)?;

        Ok(ZipReader {
            input,
            records,
            next: 0,
            current: None,
            body: None,
            warnings: Vec::new(),
        })
    }

    /// Locate, read and decompress the body of record `index`
    fn load_body(&mut self, index: usize) -> Result<Vec<u8>> {
        let record = &self.records[index];
        let name = String::from_utf8_lossy(&record.name).to_string();
        let fail = |message: String| Error::fatal("read data", message);

        if record.uncompressed_size > MAX_DECOMPRESSED_SIZE {
            return Err(fail(format!(
                "File too large to extract safely: {} bytes exceeds {} byte limit",
                record.uncompressed_size, MAX_DECOMPRESSED_SIZE
            )));
        }
        if record.compressed_size > 0
            && record.uncompressed_size / record.compressed_size > MAX_COMPRESSION_RATIO
        {
            return Err(fail(format!(
                "Suspicious compression ratio detected ({:.0}:1). File may be a zip bomb.",
                record.uncompressed_size as f64 / record.compressed_size as f64
            )));
        }
        if record.compressed_size == 0 {
            return Ok(Vec::new());
        }

        let reader = self.input.reader();
        let mut local_header = [0u8; LOCAL_HEADER_MIN_SIZE];
        reader.seek(SeekFrom::Start(record.local_header_offset))?;
        reader
            .read_exact(&mut local_header)
            .map_err(|_| fail(format!("Truncated local file header for {name}")))?;
        if !local_header.starts_with(&LOCAL_SIGNATURE) {
            return Err(fail(format!("Invalid local file header signature for {name}")));
        }

        let filename_len = i64::from(le16(&local_header, 26));
        let extra_len = i64::from(le16(&local_header, 28));
        reader.seek(SeekFrom::Current(filename_len + extra_len))?;

        // sizes come from the central directory; let the buffers grow with real bytes
        let mut compressed = Vec::new();
        reader
            .take(record.compressed_size)
            .read_to_end(&mut compressed)?;
        if compressed.len() as u64 != record.compressed_size {
            return Err(fail(format!("Compressed data of {name} is truncated")));
        }

        let decompressed = match record.method {
            COMPRESSION_STORED => compressed,
            COMPRESSION_DEFLATE => {
                let mut out = Vec::new();
                DeflateDecoder::new(&compressed[..])
                    .take(MAX_DECOMPRESSED_SIZE)
                    .read_to_end(&mut out)
                    .map_err(|e| fail(format!("Failed to decompress {name}: {e}")))?;
                out
            }
            other => {
                return Err(fail(format!(
                    "Unsupported compression method {other} for {name}. Only stored (0) and deflate (8) are supported."
                )));
            }
        };

        if decompressed.len() as u64 != record.uncompressed_size {
            return Err(fail(format!(
                "Decompressed size mismatch for {name}: expected {} bytes, got {} bytes",
                record.uncompressed_size,
                decompressed.len()
            )));
        }

        let mut crc = Crc::new();
        crc.update(&decompressed);
        if crc.sum() != record.crc32 {
            return Err(fail(format!(
                "CRC-32 checksum mismatch for {name}: expected {:#010x}, got {:#010x}",
                record.crc32,
                crc.sum()
            )));
        }

        Ok(decompressed)
    }
}

impl<'a> ReadHandle<'a> for ZipReader<'a> {
    fn next_header(&mut self) -> Result<Option<RawHeader>> {
        self.body = None;
        let Some(record) = self.records.get(self.next) else {
            self.current = None;
            return Ok(None);
        };
        let index = self.next;
        self.next += 1;
        self.current = Some(index);

        let (file_type, perm) = record.file_type_and_perm();
        Ok(Some(RawHeader {
            pathname: record.name.clone(),
            pathname_is_utf8: record.utf8,
            file_type,
            perm,
            size: record.uncompressed_size,
            mtime: dos_to_unix(record.dos_date, record.dos_time),
            position: index as u64,
        }))
    }

    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(index) = self.current else {
            return Ok(0);
        };
        if self.body.is_none() {
            let data = self.load_body(index)?;
            self.body = Some(Cursor::new(data));
        }
        match self.body.as_mut() {
            Some(body) => Ok(body.read(buf)?),
            None => Ok(0),
        }
    }

    fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn close(self: Box<Self>) -> Box<dyn ReadSeek + 'a> {
        match self.input {
            ZipInput::Direct(input) => input.into_inner(),
            ZipInput::Spooled { decoder, .. } => decoder.into_source(),
        }
    }
}

fn zip_error(operation: &'static str, e: ZipError) -> Error {
    Error::fatal(operation, e.to_string())
}

/// Zip writer: the archive is assembled in memory by the `zip` crate and
/// copied through the filter stack when the session closes.
pub(crate) struct ZipWriter<'a> {
    zip: ::zip::ZipWriter<Cursor<Vec<u8>>>,
    out: Encoder<'a>,
    entry_size: u64,
    remaining: u64,
    warnings: Vec<String>,
}

impl<'a> ZipWriter<'a> {
    pub(crate) fn new(out: Encoder<'a>) -> Self {
        ZipWriter {
            zip: ::zip::ZipWriter::new(Cursor::new(Vec::new())),
            out,
            entry_size: 0,
            remaining: 0,
            warnings: Vec::new(),
        }
    }
}

impl<'a> WriteHandle<'a> for ZipWriter<'a> {
    fn write_header(&mut self, raw: &RawHeader) -> Result<()> {
        self.finish_entry()?;

        // the zip crate takes names as text; non-UTF-8 bytes were produced by
        // a single-byte encoding and map back one char per byte
        let name = match String::from_utf8(raw.pathname.clone()) {
            Ok(name) => name,
            Err(e) => e.into_bytes().iter().map(|&b| b as char).collect(),
        };

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(unix_to_dos(raw.mtime))
            .unix_permissions(raw.perm)
            .large_file(raw.size >= u64::from(u32::MAX));

        match raw.file_type & S_IFMT {
            S_IFDIR => {
                self.zip
                    .add_directory(name, options)
                    .map_err(|e| zip_error("write header", e))?;
                self.entry_size = 0;
                self.remaining = 0;
                return Ok(());
            }
            S_IFREG | 0 => {}
            other => {
                self.warnings.push(format!(
                    "zip cannot represent file type {other:o} of {name}; stored as a regular file"
                ));
            }
        }

        self.zip
            .start_file(name, options)
            .map_err(|e| zip_error("write header", e))?;
        self.entry_size = raw.size;
        self.remaining = raw.size;
        Ok(())
    }

    fn write_body(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        if len > self.remaining {
            return Err(Error::fatal(
                "write data",
                format!("entry body exceeds declared size of {} bytes", self.entry_size),
            ));
        }
        self.zip.write_all(data)?;
        self.remaining -= len;
        Ok(())
    }

    fn finish_entry(&mut self) -> Result<()> {
        if self.remaining > 0 {
            self.warnings.push(format!(
                "entry body is {} bytes short of its declared size",
                self.remaining
            ));
            self.remaining = 0;
        }
        Ok(())
    }

    fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn close(mut self: Box<Self>) -> Result<Box<dyn SyncWrite + 'a>> {
        self.finish_entry()?;
        let this = *self;
        let archive = this.zip.finish().map_err(|e| zip_error("close", e))?;
        let mut out = this.out;
        out.write_all(archive.get_ref())?;
        Ok(out.finish()?)
    }
}
