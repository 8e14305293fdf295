use std::io::{Read, Write};

use super::filter::{Encoder, Peeked};
use super::{RawHeader, ReadHandle, WriteHandle};
use crate::entry::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, S_IMODE};
use crate::error::{Error, Result};
use crate::source::{Counted, CountedWrite, ReadSeek, SyncWrite, read_full, skip_exact};

const NEWC_MAGIC: &[u8; 6] = b"070701";
const NEWC_CRC_MAGIC: &[u8; 6] = b"070702";
const HEADER_LEN: usize = 110;
const TRAILER: &[u8] = b"TRAILER!!!";

/// Output is padded to a multiple of this after the trailer
const BLOCK: u64 = 512;

/// Longest pathname accepted when reading
const MAX_NAME: u64 = 4096;

pub(crate) fn bid(prefix: &[u8]) -> bool {
    prefix.starts_with(NEWC_MAGIC) || prefix.starts_with(NEWC_CRC_MAGIC)
}

fn pad4(n: u64) -> u64 {
    (4 - n % 4) % 4
}

/// One 8-digit hex field of a newc header
fn hex_field(header: &[u8; HEADER_LEN], index: usize) -> Result<u64> {
    let start = 6 + index * 8;
    std::str::from_utf8(&header[start..start + 8])
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| Error::fatal("read header", "Corrupted cpio header"))
}

// field indexes after the magic
const F_MODE: usize = 1;
const F_MTIME: usize = 5;
const F_FILESIZE: usize = 6;
const F_NAMESIZE: usize = 11;

/// SVR4 "newc" cpio reader
pub(crate) struct CpioReader<'a> {
    input: Counted<Peeked<'a>>,
    remaining: u64,
    padding: u64,
    warnings: Vec<String>,
    done: bool,
}

impl<'a> CpioReader<'a> {
    pub(crate) fn new(input: Peeked<'a>) -> Self {
        CpioReader {
            input: Counted::new(input),
            remaining: 0,
            padding: 0,
            warnings: Vec::new(),
            done: false,
        }
    }
}

impl<'a> ReadHandle<'a> for CpioReader<'a> {
    fn next_header(&mut self) -> Result<Option<RawHeader>> {
        if self.done {
            return Ok(None);
        }
        skip_exact(&mut self.input, self.remaining + self.padding)
            .map_err(|e| Error::fatal("read header", format!("EOF while skipping cpio data: {e}")))?;
        self.remaining = 0;
        self.padding = 0;

        let offset = self.input.offset();
        let mut header = [0u8; HEADER_LEN];
        match read_full(&mut self.input, &mut header)? {
            0 => {
                self.warnings
                    .push("cpio archive has no TRAILER!!! entry".to_string());
                self.done = true;
                return Ok(None);
            }
            HEADER_LEN => {}
            _ => return Err(Error::fatal("read header", "Truncated cpio archive")),
        }
        if !bid(&header) {
            return Err(Error::fatal(
                "read header",
                format!("Bad cpio header magic at offset {offset}"),
            ));
        }

        let mode = hex_field(&header, F_MODE)? as u32;
        let mtime = hex_field(&header, F_MTIME)? as i64;
        let size = hex_field(&header, F_FILESIZE)?;
        let namesize = hex_field(&header, F_NAMESIZE)?;
        if namesize == 0 || namesize > MAX_NAME {
            return Err(Error::fatal("read header", "Bad cpio pathname length"));
        }

        let mut name = vec![0u8; namesize as usize];
        self.input
            .read_exact(&mut name)
            .map_err(|_| Error::fatal("read header", "Truncated cpio archive"))?;
        skip_exact(&mut self.input, pad4(HEADER_LEN as u64 + namesize))?;
        if let Some(end) = name.iter().position(|&b| b == 0) {
            name.truncate(end);
        }

        if name == TRAILER {
            self.done = true;
            return Ok(None);
        }

        self.remaining = size;
        self.padding = pad4(size);

        let file_type = match mode & S_IFMT {
            0 => S_IFREG,
            bits => bits,
        };

        Ok(Some(RawHeader {
            pathname: name,
            pathname_is_utf8: false,
            file_type,
            perm: mode & S_IMODE,
            size,
            mtime,
            position: offset,
        }))
    }

    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = std::cmp::min(buf.len() as u64, self.remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        let n = self.input.read(&mut buf[..want])?;
        if n == 0 {
            return Err(Error::fatal("read data", "Truncated cpio archive"));
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

/// SVR4 "newc" cpio writer
pub(crate) struct CpioWriter<'a> {
    out: CountedWrite<Encoder<'a>>,
    next_ino: u64,
    in_entry: bool,
    entry_size: u64,
    remaining: u64,
    warnings: Vec<String>,
}

impl<'a> CpioWriter<'a> {
    pub(crate) fn new(out: Encoder<'a>) -> Self {
        CpioWriter {
            out: CountedWrite::new(out),
            next_ino: 1,
            in_entry: false,
            entry_size: 0,
            remaining: 0,
            warnings: Vec::new(),
        }
    }

    fn pad_zeros(&mut self, n: u64) -> Result<()> {
        std::io::copy(&mut std::io::repeat(0).take(n), &mut self.out)?;
        Ok(())
    }

    fn write_record(&mut self, ino: u64, mode: u32, nlink: u64, mtime: u64, size: u64, name: &[u8]) -> Result<()> {
        let namesize = name.len() as u64 + 1;
        if size > u64::from(u32::MAX) {
            return Err(Error::fatal("write header", "cpio entries are limited to 4 GiB"));
        }
        let header = format!(
            "070701{ino:08X}{mode:08X}{uid:08X}{gid:08X}{nlink:08X}{mtime:08X}{size:08X}{z:08X}{z:08X}{z:08X}{z:08X}{namesize:08X}{z:08X}",
            uid = 0,
            gid = 0,
            z = 0,
        );
        self.out.write_all(header.as_bytes())?;
        self.out.write_all(name)?;
        self.out.write_all(&[0])?;
        self.pad_zeros(pad4(HEADER_LEN as u64 + namesize))
    }
}

impl<'a> WriteHandle<'a> for CpioWriter<'a> {
    fn write_header(&mut self, raw: &RawHeader) -> Result<()> {
        self.finish_entry()?;

        let file_type = match raw.file_type & S_IFMT {
            0 => S_IFREG,
            bits => bits,
        };
        // regular files and symlinks (whose body is the target) carry data
        let size = if matches!(file_type, S_IFREG | S_IFLNK) { raw.size } else { 0 };
        let nlink = if file_type == S_IFDIR { 2 } else { 1 };
        let ino = self.next_ino;
        self.next_ino += 1;

        self.write_record(
            ino,
            file_type | (raw.perm & S_IMODE),
            nlink,
            raw.mtime.clamp(0, i64::from(u32::MAX)) as u64,
            size,
            &raw.pathname,
        )?;

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
                format!("entry body exceeds declared size of {} bytes", self.entry_size),
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
        self.pad_zeros(pad4(self.entry_size))?;
        self.in_entry = false;
        Ok(())
    }

    fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn close(mut self: Box<Self>) -> Result<Box<dyn SyncWrite + 'a>> {
        self.finish_entry()?;
        self.write_record(0, 0, 1, 0, 0, TRAILER)?;
        let written = self.out.written();
        self.pad_zeros(written.div_ceil(BLOCK) * BLOCK - written)?;
        Ok(self.out.into_inner().finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WriteFilter;
    use crate::codec::filter::Decoder;
    use crate::source::Unsynced;
    use std::cell::RefCell;
    use std::io::{BufReader, Cursor};
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn raw(path: &str, file_type: u32, size: u64) -> RawHeader {
        RawHeader {
            pathname: path.as_bytes().to_vec(),
            pathname_is_utf8: true,
            file_type,
            perm: 0o755,
            size,
            mtime: 1_600_000_000,
            position: 0,
        }
    }

    fn reader(bytes: Vec<u8>) -> CpioReader<'static> {
        let input = BufReader::new(Box::new(Cursor::new(bytes)) as Box<dyn ReadSeek>);
        CpioReader::new(Peeked::new(Vec::new(), Decoder::new(input, None)))
    }

    #[test]
    fn test_write_then_read() {
        let buf = SharedBuf::default();
        let mut writer = Box::new(CpioWriter::new(Encoder::new(
            Box::new(Unsynced(buf.clone())),
            WriteFilter::None,
        )));
        writer.write_header(&raw("bin", S_IFDIR, 0)).unwrap();
        writer.write_header(&raw("bin/tool", S_IFREG, 5)).unwrap();
        writer.write_body(b"12345").unwrap();
        writer.close().unwrap();

        let bytes = buf.0.borrow().clone();
        assert_eq!(bytes.len() % 512, 0);
        assert!(bid(&bytes));

        let mut r = reader(bytes);
        let dir = r.next_header().unwrap().unwrap();
        assert_eq!(dir.pathname, b"bin");
        assert_eq!(dir.file_type, S_IFDIR);
        assert_eq!(dir.position, 0);

        let file = r.next_header().unwrap().unwrap();
        assert_eq!(file.pathname, b"bin/tool");
        assert_eq!(file.perm, 0o755);
        assert_eq!(file.mtime, 1_600_000_000);
        // 110-byte header + "bin\0" padded to 116
        assert_eq!(file.position, 116);
        let mut out = [0u8; 8];
        assert_eq!(r.read_body(&mut out).unwrap(), 5);
        assert_eq!(&out[..5], b"12345");

        assert!(r.next_header().unwrap().is_none());
        assert!(r.take_warnings().is_empty());
    }

    #[test]
    fn test_hex_field() {
        let mut header = [b'0'; HEADER_LEN];
        header[..6].copy_from_slice(NEWC_MAGIC);
        header[6 + F_MODE * 8..6 + F_MODE * 8 + 8].copy_from_slice(b"000081A4");
        assert_eq!(hex_field(&header, F_MODE).unwrap(), 0o100644);
        header[6 + F_FILESIZE * 8] = b'z';
        assert!(hex_field(&header, F_FILESIZE).is_err());
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let err = reader(vec![b'x'; HEADER_LEN]).next_header().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_trailer_warns() {
        let mut r = reader(Vec::new());
        assert!(r.next_header().unwrap().is_none());
        assert_eq!(r.take_warnings().len(), 1);
    }
}
