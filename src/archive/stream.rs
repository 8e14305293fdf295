use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use bytes::Bytes;

use super::session::Session;
use crate::entry::Entry;
use crate::error::{Error, Result};

/// Forward-only view over the body of the entry an archive is positioned on.
///
/// The stream holds the archive's only stream slot until it is closed or
/// dropped. Closing the archive in the meantime is deferred: the stream keeps
/// working, and the archive is torn down when the stream closes.
pub struct EntryReadStream<'a> {
    session: Rc<RefCell<Session<'a>>>,
    ticket: u64,
    entry: Entry,
    position: u64,
    closed: bool,
}

impl<'a> EntryReadStream<'a> {
    pub(crate) fn new(session: Rc<RefCell<Session<'a>>>, ticket: u64, entry: Entry) -> Self {
        EntryReadStream {
            session,
            ticket,
            entry,
            position: 0,
            closed: false,
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Declared size of the entry body
    pub fn size(&self) -> u64 {
        self.entry.size
    }

    /// Bytes read so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read at most `max` bytes. An empty result means the body is exhausted.
    pub fn read_bytes(&mut self, max: usize) -> Result<Bytes> {
        if self.closed {
            return Err(Error::StreamClosed);
        }
        let bytes = self.session.borrow_mut().stream_read(self.ticket, max)?;
        self.position += bytes.len() as u64;
        Ok(bytes)
    }

    /// Read the rest of the body
    pub fn read_all(&mut self) -> Result<Bytes> {
        let remaining = self.entry.size.saturating_sub(self.position);
        self.read_bytes(usize::try_from(remaining).unwrap_or(usize::MAX))
    }

    /// Release the stream slot. Runs a deferred archive close, if one is pending.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.borrow_mut().release_stream(self.ticket)
    }
}

impl Read for EntryReadStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.read_bytes(buf.len())?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

impl Drop for EntryReadStream<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("error closing entry read stream for {}: {e}", self.entry.pathname);
        }
    }
}

/// Writable view used to stream one entry body into a write-mode archive.
///
/// When the size is known up front the header is written as the stream
/// opens and bytes pass straight through. Otherwise the body is buffered
/// and the header, carrying the buffered size, is written on close.
pub struct EntryWriteStream<'a> {
    session: Rc<RefCell<Session<'a>>>,
    ticket: u64,
    entry: Entry,
    buffer: Option<Vec<u8>>,
    written: u64,
    closed: bool,
}

impl<'a> EntryWriteStream<'a> {
    /// `entry.size` is trusted unless `buffered` is set
    pub(crate) fn new(
        session: Rc<RefCell<Session<'a>>>,
        ticket: u64,
        entry: Entry,
        buffered: bool,
    ) -> Result<Self> {
        if !buffered {
            let mut guard = session.borrow_mut();
            if let Err(e) = guard.stream_header(ticket, &entry) {
                guard.release_stream(ticket)?;
                return Err(e);
            }
        }
        Ok(EntryWriteStream {
            session,
            ticket,
            entry,
            buffer: buffered.then(Vec::new),
            written: 0,
            closed: false,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Bytes accepted so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_buffered(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::StreamClosed);
        }
        match self.buffer.as_mut() {
            Some(buffer) => buffer.extend_from_slice(data),
            None => self.session.borrow_mut().stream_write(self.ticket, data)?,
        }
        self.written += data.len() as u64;
        Ok(())
    }

    /// Finish the entry and release the stream slot. A buffered stream writes
    /// its header and body here. Runs a deferred archive close, if one is pending.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut session = self.session.borrow_mut();
        let finished = match self.buffer.take() {
            Some(buffer) => {
                self.entry.size = buffer.len() as u64;
                session
                    .stream_header(self.ticket, &self.entry)
                    .and_then(|_| session.stream_write(self.ticket, &buffer))
                    .and_then(|_| session.stream_finish(self.ticket))
            }
            None => session.stream_finish(self.ticket),
        };
        let released = session.release_stream(self.ticket);
        finished.and(released)
    }
}

impl Write for EntryWriteStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EntryWriteStream<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("error closing entry write stream for {}: {e}", self.entry.pathname);
        }
    }
}
