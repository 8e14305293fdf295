use std::io::{Read, Write};

use ::tar::{EntryType, Header};

use super::filter::{Encoder, Peeked};
use super::{RawHeader, ReadHandle, WriteHandle};
use crate::entry::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG};
use crate::error::{Error, Result};
use crate::source::{Counted, CountedWrite, ReadSeek, SyncWrite, read_full, skip_exact};

const TAR_BLOCK: usize = 512;

/// Tar output is padded to whole records of this size
const RECORD_SIZE: u64 = 10240;

/// Upper bound for GNU long-name and pax extension bodies
const MAX_EXTENSION_SIZE: u64 = 1 << 20;

const USTAR_MAGIC: &[u8] = b"ustar\0";

/// Parse a null-terminated C string from a tar header field
fn parse_cstr(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Parse an octal number from a tar header field
fn parse_octal_u64(field: &[u8]) -> Option<u64> {
    let s = String::from_utf8_lossy(parse_cstr(field)).trim().to_string();
    if s.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(&s, 8).ok()
}

/// Octal, or the GNU base-256 encoding when the high bit of the first byte is set
fn parse_numeric(field: &[u8]) -> Option<u64> {
    match field.first() {
        Some(&first) if first & 0x80 != 0 => {
            let mut value = u64::from(first & 0x7f);
            for &b in &field[1..] {
                value = value.checked_mul(256)?.checked_add(u64::from(b))?;
            }
            Some(value)
        }
        _ => parse_octal_u64(field),
    }
}

/// Round up to next 512-byte boundary
fn round_up_512(n: u64) -> u64 {
    n.div_ceil(512) * 512
}

fn checksum_ok(block: &[u8; TAR_BLOCK]) -> bool {
    let Some(stored) = parse_octal_u64(&block[148..156]) else {
        return false;
    };
    let unsigned: u64 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { 32 } else { u64::from(b) })
        .sum();
    // Some historic writers summed signed bytes
    let signed: i64 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { 32 } else { i64::from(b as i8) })
        .sum();
    stored == unsigned || i64::try_from(stored).is_ok_and(|s| s == signed)
}

/// Does `prefix` start with a tar header? An all-zero first block is an empty archive.
pub(crate) fn bid(prefix: &[u8]) -> bool {
    let Some(block) = prefix.get(..TAR_BLOCK) else {
        return false;
    };
    let Ok(block) = <&[u8; TAR_BLOCK]>::try_from(block) else {
        return false;
    };
    block.iter().all(|&b| b == 0) || checksum_ok(block)
}

/// Header fields carried by pax `x` records
#[derive(Debug, Default)]
struct PaxOverrides {
    path: Option<Vec<u8>>,
    size: Option<u64>,
    mtime: Option<i64>,
}

impl PaxOverrides {
    /// Apply records of the form `"<len> <key>=<value>\n"`
    fn apply(&mut self, mut body: &[u8]) -> Result<()> {
        while !body.is_empty() && body[0] != 0 {
            let space = body
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| Error::fatal("read header", "Malformed pax extended header"))?;
            let len: usize = std::str::from_utf8(&body[..space])
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&len| len > space + 1 && len <= body.len())
                .ok_or_else(|| Error::fatal("read header", "Malformed pax extended header"))?;

            let record = &body[space + 1..len - 1];
            if let Some(eq) = record.iter().position(|&b| b == b'=') {
                let (key, value) = (&record[..eq], &record[eq + 1..]);
                let text = String::from_utf8_lossy(value);
                match key {
                    b"path" => self.path = Some(value.to_vec()),
                    b"size" => self.size = text.parse().ok(),
                    b"mtime" => {
                        // fractional seconds are dropped
                        let whole = text.split('.').next().unwrap_or_default();
                        self.mtime = whole.parse().ok();
                    }
                    _ => {}
                }
            }
            body = &body[len..];
        }
        Ok(())
    }
}

/// Map a typeflag to file-type bits; `None` for flags this reader does not know
fn file_type_of(typeflag: u8, name: &[u8]) -> Option<u32> {
    match typeflag {
        // old tar marks directories with a trailing slash only
        b'0' | 0 if name.ends_with(b"/") => Some(S_IFDIR),
        b'0' | 0 | b'1' | b'7' => Some(S_IFREG),
        b'2' => Some(S_IFLNK),
        b'3' => Some(S_IFCHR),
        b'4' => Some(S_IFBLK),
        b'5' => Some(S_IFDIR),
        b'6' => Some(S_IFIFO),
        _ => None,
    }
}

/// Streaming tar reader: ustar, pax and GNU headers over any decoded stream
pub(crate) struct TarReader<'a> {
    input: Counted<Peeked<'a>>,
    remaining: u64,
    padding: u64,
    warnings: Vec<String>,
    done: bool,
}

impl<'a> TarReader<'a> {
    pub(crate) fn new(input: Peeked<'a>) -> Self {
        TarReader {
            input: Counted::new(input),
            remaining: 0,
            padding: 0,
            warnings: Vec::new(),
            done: false,
        }
    }

    fn skip_rest_of_entry(&mut self) -> Result<()> {
        skip_exact(&mut self.input, self.remaining + self.padding).map_err(|e| {
            Error::fatal("read header", format!("EOF while skipping tar payload: {e}"))
        })?;
        self.remaining = 0;
        self.padding = 0;
        Ok(())
    }

    /// Read the next block; `false` on a clean end of input
    fn read_block(&mut self, block: &mut [u8; TAR_BLOCK]) -> Result<bool> {
        match read_full(&mut self.input, block)? {
            0 => Ok(false),
            TAR_BLOCK => Ok(true),
            _ => Err(Error::fatal("read header", "Truncated tar archive")),
        }
    }

    fn read_extension(&mut self, size: u64) -> Result<Vec<u8>> {
        if size > MAX_EXTENSION_SIZE {
            return Err(Error::fatal(
                "read header",
                format!("Extension header too large ({size} bytes)"),
            ));
        }
        let mut body = vec![0u8; size as usize];
        self.input
            .read_exact(&mut body)
            .map_err(|_| Error::fatal("read header", "Truncated tar extension header"))?;
        skip_exact(&mut self.input, round_up_512(size) - size)?;
        Ok(body)
    }
}

impl<'a> ReadHandle<'a> for TarReader<'a> {
    fn next_header(&mut self) -> Result<Option<RawHeader>> {
        if self.done {
            return Ok(None);
        }
        self.skip_rest_of_entry()?;

        let mut block = [0u8; TAR_BLOCK];
        let mut zero_blocks = 0u8;
        let mut long_name: Option<Vec<u8>> = None;
        let mut pax = PaxOverrides::default();
        let mut position: Option<u64> = None;

        loop {
            let offset = self.input.offset();
            if !self.read_block(&mut block)? {
                if position.is_some() {
                    return Err(Error::fatal(
                        "read header",
                        "Truncated tar archive: extension header without an entry",
                    ));
                }
                if zero_blocks == 0 {
                    self.warnings
                        .push("tar archive has no end-of-archive marker".to_string());
                }
                self.done = true;
                return Ok(None);
            }

            // Check for end-of-archive marker (two consecutive zero blocks)
            if block.iter().all(|&b| b == 0) {
                zero_blocks += 1;
                if zero_blocks >= 2 {
                    self.done = true;
                    return Ok(None);
                }
                continue;
            }
            if zero_blocks > 0 {
                self.warnings.push(format!("ignoring isolated zero block before offset {offset}"));
                zero_blocks = 0;
            }

            if !checksum_ok(&block) {
                return Err(Error::fatal(
                    "read header",
                    format!("Damaged tar archive (header checksum mismatch at offset {offset})"),
                ));
            }

            let size = parse_numeric(&block[124..136])
                .ok_or_else(|| Error::fatal("read header", "bad size field in tar header"))?;
            let typeflag = block[156];

            match typeflag {
                b'L' => {
                    position.get_or_insert(offset);
                    let body = self.read_extension(size)?;
                    long_name = Some(parse_cstr(&body).to_vec());
                    continue;
                }
                b'x' => {
                    position.get_or_insert(offset);
                    let body = self.read_extension(size)?;
                    pax.apply(&body)?;
                    continue;
                }
                // link targets and global records are not carried
                b'K' | b'g' => {
                    self.read_extension(size)?;
                    continue;
                }
                _ => {}
            }

            let name = parse_cstr(&block[0..100]);
            let prefix = parse_cstr(&block[345..500]);
            let stored_path = if &block[257..263] == USTAR_MAGIC && !prefix.is_empty() {
                [prefix, b"/", name].concat()
            } else {
                name.to_vec()
            };
            let pathname = pax.path.take().or(long_name.take()).unwrap_or(stored_path);

            let file_type = file_type_of(typeflag, &pathname).unwrap_or_else(|| {
                self.warnings.push(format!(
                    "unknown tar entry type {:?} for {}; reading it as a regular file",
                    typeflag as char,
                    String::from_utf8_lossy(&pathname)
                ));
                S_IFREG
            });

            let size = pax.size.unwrap_or(size);
            let mtime = pax.mtime.unwrap_or_else(|| {
                parse_numeric(&block[136..148]).map_or(0, |m| m as i64)
            });
            let perm = parse_octal_u64(&block[100..108]).unwrap_or(0) as u32 & 0o7777;

            self.remaining = size;
            self.padding = round_up_512(size) - size;

            return Ok(Some(RawHeader {
                pathname,
                pathname_is_utf8: false,
                file_type,
                perm,
                size,
                mtime,
                position: position.unwrap_or(offset),
            }));
        }
    }

    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = std::cmp::min(buf.len() as u64, self.remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        let n = self.input.read(&mut buf[..want])?;
        if n == 0 {
            return Err(Error::fatal("read data", "Truncated tar archive"));
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn close(self: Box<Self>) -> Box<dyn ReadSeek + 'a> {
        self.input.into_inner().into_source()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TarFlavor {
    Ustar,
    Pax,
    Gnu,
}

/// Where a pathname ended up in a header
enum NamePlacement {
    Fits,
    /// Too long for the header fields; needs an extension record
    Overflow,
}

/// Tar writer built on `tar::Header` for field encoding
pub(crate) struct TarWriter<'a> {
    out: CountedWrite<Encoder<'a>>,
    flavor: TarFlavor,
    in_entry: bool,
    entry_size: u64,
    remaining: u64,
    warnings: Vec<String>,
}

impl<'a> TarWriter<'a> {
    pub(crate) fn new(out: Encoder<'a>, flavor: TarFlavor) -> Self {
        TarWriter {
            out: CountedWrite::new(out),
            flavor,
            in_entry: false,
            entry_size: 0,
            remaining: 0,
            warnings: Vec::new(),
        }
    }

    fn new_header(&self) -> Header {
        match self.flavor {
            TarFlavor::Gnu => Header::new_gnu(),
            TarFlavor::Ustar | TarFlavor::Pax => Header::new_ustar(),
        }
    }

    /// Put `path` into the name field, splitting into ustar prefix/name when that fits
    fn place_name(&self, header: &mut Header, path: &[u8]) -> NamePlacement {
        if path.len() <= 100 {
            header.as_old_mut().name[..path.len()].copy_from_slice(path);
            return NamePlacement::Fits;
        }
        if self.flavor != TarFlavor::Gnu {
            let split = path
                .iter()
                .enumerate()
                .filter(|&(i, &b)| b == b'/' && i <= 155 && path.len() - i - 1 <= 100 && i + 1 < path.len())
                .map(|(i, _)| i)
                .next();
            if let (Some(i), Some(ustar)) = (split, header.as_ustar_mut()) {
                ustar.prefix[..i].copy_from_slice(&path[..i]);
                ustar.name[..path.len() - i - 1].copy_from_slice(&path[i + 1..]);
                return NamePlacement::Fits;
            }
        }
        NamePlacement::Overflow
    }

    fn pad_zeros(&mut self, n: u64) -> Result<()> {
        std::io::copy(&mut std::io::repeat(0).take(n), &mut self.out)?;
        Ok(())
    }

    /// Write an extension header (`L` or `x`) and its padded body
    fn write_extension(&mut self, name: &[u8], kind: EntryType, body: &[u8]) -> Result<()> {
        let mut header = self.new_header();
        let len = name.len().min(100);
        header.as_old_mut().name[..len].copy_from_slice(&name[..len]);
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(kind);
        header.set_cksum();
        self.out.write_all(header.as_bytes())?;
        self.out.write_all(body)?;
        let len = body.len() as u64;
        self.pad_zeros(round_up_512(len) - len)
    }
}

/// One pax record: `"<len> <key>=<value>\n"`, where `len` counts itself
fn pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    let base = key.len() + value.len() + 3;
    let mut len = base + base.to_string().len();
    if base + len.to_string().len() != len {
        len = base + len.to_string().len();
    }
    let mut record = format!("{len} {key}=").into_bytes();
    record.extend_from_slice(value);
    record.push(b'\n');
    record
}

fn entry_type_of(file_type: u32) -> Option<EntryType> {
    match file_type & S_IFMT {
        S_IFREG | 0 => Some(EntryType::Regular),
        S_IFDIR => Some(EntryType::Directory),
        S_IFLNK => Some(EntryType::Symlink),
        S_IFCHR => Some(EntryType::Char),
        S_IFBLK => Some(EntryType::Block),
        S_IFIFO => Some(EntryType::Fifo),
        _ => None,
    }
}

impl<'a> WriteHandle<'a> for TarWriter<'a> {
    fn write_header(&mut self, raw: &RawHeader) -> Result<()> {
        self.finish_entry()?;

        let entry_type = entry_type_of(raw.file_type).ok_or_else(|| {
            Error::fatal(
                "write header",
                format!(
                    "tar cannot store {} (unsupported file type {:o})",
                    String::from_utf8_lossy(&raw.pathname),
                    raw.file_type
                ),
            )
        })?;
        let size = if entry_type == EntryType::Regular { raw.size } else { 0 };

        let mut header = self.new_header();
        header.set_size(size);
        header.set_mode(raw.perm);
        header.set_mtime(raw.mtime.max(0) as u64);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(entry_type);

        let overflow = matches!(self.place_name(&mut header, &raw.pathname), NamePlacement::Overflow);
        let needs_pax = self.flavor == TarFlavor::Pax && (overflow || !raw.pathname.is_ascii());

        if needs_pax {
            let body = pax_record("path", &raw.pathname);
            self.write_extension(b"././@PaxHeader", EntryType::XHeader, &body)?;
        } else if overflow && self.flavor == TarFlavor::Gnu {
            let mut body = raw.pathname.clone();
            body.push(0);
            self.write_extension(b"././@LongLink", EntryType::GNULongName, &body)?;
        } else if overflow {
            return Err(Error::fatal(
                "write header",
                format!(
                    "Pathname too long for ustar format: {}",
                    String::from_utf8_lossy(&raw.pathname)
                ),
            ));
        }

        if overflow {
            let name = &raw.pathname[..100];
            header.as_old_mut().name.copy_from_slice(name);
        }

        header.set_cksum();
        self.out.write_all(header.as_bytes())?;

        self.in_entry = true;
        self.entry_size = size;
        self.remaining = size;
        Ok(())
    }

    fn write_body(&mut self, data: &[u8]) -> Result<()> {
        if !self.in_entry {
            return Err(Error::fatal("write data", "no entry header has been written"));
        }
        let len = data.len() as u64;
        if len > self.remaining {
            return Err(Error::fatal(
                "write data",
                format!(
                    "entry body exceeds declared size of {} bytes",
                    self.entry_size
                ),
            ));
        }
        self.out.write_all(data)?;
        self.remaining -= len;
        Ok(())
    }

    fn finish_entry(&mut self) -> Result<()> {
        if !self.in_entry {
            return Ok(());
        }
        if self.remaining > 0 {
            self.warnings.push(format!(
                "entry body is {} bytes short of its declared size; zero-filled",
                self.remaining
            ));
            self.pad_zeros(self.remaining)?;
            self.remaining = 0;
        }
        self.pad_zeros(round_up_512(self.entry_size) - self.entry_size)?;
        self.in_entry = false;
        Ok(())
    }

    fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn close(mut self: Box<Self>) -> Result<Box<dyn SyncWrite + 'a>> {
        self.finish_entry()?;
        self.pad_zeros(2 * TAR_BLOCK as u64)?;
        let written = self.out.written();
        let padding = written.div_ceil(RECORD_SIZE) * RECORD_SIZE - written;
        self.pad_zeros(padding)?;
        Ok(self.out.into_inner().finish()?)
    }
}
