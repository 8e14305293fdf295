use std::io::Read;

use super::filter::Peeked;
use super::{RawHeader, ReadHandle};
use crate::entry::S_IFREG;
use crate::error::{Error, Result};
use crate::source::{Counted, ReadSeek, read_full, skip_exact};

const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const MEMBER_HEADER: usize = 60;
const MEMBER_END: &[u8; 2] = b"`\n";

/// Long member names, or the name table itself, never exceed this
const MAX_NAME_TABLE: u64 = 1 << 20;

pub(crate) fn bid(prefix: &[u8]) -> bool {
    prefix.starts_with(AR_MAGIC)
}

fn field_str(field: &[u8]) -> String {
    String::from_utf8_lossy(field).trim_end().to_string()
}

fn parse_decimal(field: &[u8]) -> Option<u64> {
    let s = field_str(field);
    if s.is_empty() {
        return Some(0);
    }
    s.parse().ok()
}

fn parse_octal(field: &[u8]) -> Option<u32> {
    let s = field_str(field);
    if s.is_empty() {
        return Some(0);
    }
    u32::from_str_radix(&s, 8).ok()
}

/// Unix `ar` reader covering the GNU/SysV and BSD member-name conventions
pub(crate) struct ArReader<'a> {
    input: Counted<Peeked<'a>>,
    remaining: u64,
    padding: u64,
    /// GNU `//` member holding names longer than 15 bytes
    long_names: Option<Vec<u8>>,
    done: bool,
}

impl<'a> ArReader<'a> {
    pub(crate) fn new(input: Peeked<'a>) -> Result<Self> {
        let mut input = Counted::new(input);
        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .map_err(|_| Error::fatal("open", "Truncated ar archive"))?;
        Ok(ArReader {
            input,
            remaining: 0,
            padding: 0,
            long_names: None,
            done: false,
        })
    }

    fn skip_rest_of_entry(&mut self) -> Result<()> {
        skip_exact(&mut self.input, self.remaining + self.padding)
            .map_err(|e| Error::fatal("read header", format!("EOF while skipping ar member: {e}")))?;
        self.remaining = 0;
        self.padding = 0;
        Ok(())
    }

    fn read_member(&mut self, size: u64) -> Result<Vec<u8>> {
        if size > MAX_NAME_TABLE {
            return Err(Error::fatal("read header", "ar name table too large"));
        }
        let mut body = vec![0u8; size as usize];
        self.input
            .read_exact(&mut body)
            .map_err(|_| Error::fatal("read header", "Truncated ar archive"))?;
        Ok(body)
    }

    /// Resolve a GNU `/N` reference into the long-name table
    fn long_name(&self, offset: usize) -> Result<Vec<u8>> {
        let table = self
            .long_names
            .as_deref()
            .ok_or_else(|| Error::fatal("read header", "ar long name used without a name table"))?;
        let rest = table
            .get(offset..)
            .ok_or_else(|| Error::fatal("read header", "ar long name offset out of range"))?;
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(rest.len());
        let name = &rest[..end];
        Ok(name.strip_suffix(b"/").unwrap_or(name).to_vec())
    }
}

impl<'a> ReadHandle<'a> for ArReader<'a> {
    fn next_header(&mut self) -> Result<Option<RawHeader>> {
        if self.done {
            return Ok(None);
        }
        self.skip_rest_of_entry()?;

        loop {
            let offset = self.input.offset();
            let mut header = [0u8; MEMBER_HEADER];
            match read_full(&mut self.input, &mut header)? {
                0 => {
                    self.done = true;
                    return Ok(None);
                }
                MEMBER_HEADER => {}
                _ => return Err(Error::fatal("read header", "Truncated ar archive")),
            }
            if &header[58..60] != MEMBER_END {
                return Err(Error::fatal(
                    "read header",
                    format!("Invalid ar member header at offset {offset}"),
                ));
            }

            let bad = |field: &str| Error::fatal("read header", format!("bad {field} field in ar header"));
            let size = parse_decimal(&header[48..58]).ok_or_else(|| bad("size"))?;
            let mtime = parse_decimal(&header[16..28]).ok_or_else(|| bad("mtime"))?;
            let mode = parse_octal(&header[40..48]).ok_or_else(|| bad("mode"))?;
            let padding = size % 2;

            let raw_name = field_str(&header[0..16]);
            let (pathname, body_size) = match raw_name.as_str() {
                // symbol tables
                "/" | "/SYM64/" | "__.SYMDEF" | "__.SYMDEF SORTED" => {
                    skip_exact(&mut self.input, size + padding)?;
                    continue;
                }
                "//" => {
                    self.long_names = Some(self.read_member(size)?);
                    skip_exact(&mut self.input, padding)?;
                    continue;
                }
                name if name.starts_with("#1/") => {
                    let name_len: u64 = name[3..].parse().map_err(|_| bad("name"))?;
                    if name_len > size {
                        return Err(bad("name"));
                    }
                    let mut name = self.read_member(name_len)?;
                    if let Some(end) = name.iter().position(|&b| b == 0) {
                        name.truncate(end);
                    }
                    (name, size - name_len)
                }
                name if name.len() > 1 && name.starts_with('/') => {
                    let index: usize = name[1..].parse().map_err(|_| bad("name"))?;
                    (self.long_name(index)?, size)
                }
                name => (name.strip_suffix('/').unwrap_or(name).as_bytes().to_vec(), size),
            };

            self.remaining = body_size;
            self.padding = padding;

            return Ok(Some(RawHeader {
                pathname,
                pathname_is_utf8: false,
                file_type: S_IFREG,
                perm: mode & 0o7777,
                size: body_size,
                mtime: mtime as i64,
                position: offset,
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
            return Err(Error::fatal("read data", "Truncated ar archive"));
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    fn take_warnings(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn close(self: Box<Self>) -> Box<dyn ReadSeek + 'a> {
        self.input.into_inner().into_source()
    }
}
