//! Byte sources and sinks a session can be bound to.
//!
//! A session opened from a path owns its `File` and closes it at teardown.
//! A session handed a reader or writer owns only what it was given: passing
//! `&mut File` or `Cursor<&mut Vec<u8>>` leaves the underlying object with
//! the caller after the session is done.

use std::fs::File;
use std::io::{self, Read, Seek, Write};

/// Anything the read path can pull bytes from and rewind
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// A write target that can be made durable at teardown.
///
/// `sync` runs after the final flush when the session closes. Files fsync;
/// every other sink only flushes.
pub trait SyncWrite: Write {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SyncWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Adapter giving a plain writer the (no-op) durability hook
pub(crate) struct Unsynced<W>(pub W);

impl<W: Write> Write for Unsynced<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> SyncWrite for Unsynced<W> {}

/// Read until `buf` is full or the source is exhausted; returns bytes read
pub(crate) fn read_full<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Skip exactly `n` bytes from a reader.
///
/// Read-and-discard rather than seek: filtered streams (gzip, bzip2) cannot
/// seek, and this behaves the same for every container.
pub(crate) fn skip_exact<R: Read + ?Sized>(r: &mut R, mut n: u64) -> io::Result<()> {
    let mut buf = [0u8; 8 * 1024];
    while n > 0 {
        let want = std::cmp::min(n, buf.len() as u64) as usize;
        r.read_exact(&mut buf[..want])?;
        n -= want as u64;
    }
    Ok(())
}

/// Reader that counts the bytes it has handed out, used for header positions
pub(crate) struct Counted<R> {
    inner: R,
    offset: u64,
}

impl<R> Counted<R> {
    pub(crate) fn new(inner: R) -> Self {
        Counted { inner, offset: 0 }
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for Counted<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Writer that counts the bytes written through it, used for record padding
pub(crate) struct CountedWrite<W> {
    inner: W,
    written: u64,
}

impl<W> CountedWrite<W> {
    pub(crate) fn new(inner: W) -> Self {
        CountedWrite { inner, written: 0 }
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountedWrite<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
