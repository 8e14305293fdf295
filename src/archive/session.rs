//! Session state shared between an [`Archive`](super::Archive) and the one
//! entry stream it may have handed out.
//!
//! ```text
//!            close() with a stream open
//!   Open ──────────────────────────────▶ CloseRequested
//!    │                                        │
//!    │ close() with no stream                 │ stream closes
//!    ▼                                        ▼
//! Closed ◀────────────────────────────────────┘
//! ```
//!
//! Teardown runs exactly once, on whichever transition reaches `Closed`.

use std::io::{Seek, SeekFrom, Write};

use bytes::{Bytes, BytesMut};

use crate::codec::{self, ReadConfig, ReadHandle, WriteHandle};
use crate::config::Mode;
use crate::entry::{Encoding, Entry};
use crate::error::{Error, Result};
use crate::format::{Filter, Format};

/// Upper bound on a single body read from the codec
const READ_CHUNK: usize = 64 * 1024;

/// Lifecycle state of an archive session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// `close()` was called while an entry stream was open; teardown runs
    /// when that stream closes.
    CloseRequested,
    Closed,
}

pub(crate) enum Handle<'a> {
    Read(Box<dyn ReadHandle<'a> + 'a>),
    Write(Box<dyn WriteHandle<'a> + 'a>),
}

/// Where the forward cursor stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cursor {
    /// No header read since open or reopen
    Start,
    At { position: u64, consumed: bool },
    /// End of container reached
    End,
}

/// The entry the read cursor is positioned on
struct Current {
    entry: Entry,
    remaining: u64,
    consumed: bool,
}

pub(crate) struct Session<'a> {
    mode: Mode,
    format: Option<Format>,
    filter: Option<Filter>,
    encoding: Encoding,
    block_size: usize,
    read_config: ReadConfig,
    /// Source offset the read handle was opened at; reopen rewinds here
    origin: u64,
    handle: Option<Handle<'a>>,
    state: SessionState,
    /// Ticket of the live entry stream, if any
    stream: Option<u64>,
    next_ticket: u64,
    /// Text of the fatal error that left the session only good for closing
    failure: Option<String>,
    current: Option<Current>,
    at_end: bool,
    /// Header written by a direct write call and not yet finished
    entry_open: bool,
    warnings: Vec<String>,
}

pub(crate) struct SessionParams {
    pub mode: Mode,
    pub format: Option<Format>,
    pub filter: Option<Filter>,
    pub encoding: Encoding,
    pub block_size: usize,
    pub read_config: ReadConfig,
    pub origin: u64,
}

impl<'a> Session<'a> {
    pub(crate) fn new(params: SessionParams, handle: Handle<'a>) -> Self {
        log::debug!(
            "archive session open ({} mode, format {:?}, filter {:?})",
            params.mode,
            params.format,
            params.filter
        );
        Session {
            mode: params.mode,
            format: params.format,
            filter: params.filter,
            encoding: params.encoding,
            block_size: params.block_size,
            read_config: params.read_config,
            origin: params.origin,
            handle: Some(handle),
            state: SessionState::Open,
            stream: None,
            next_ticket: 0,
            failure: None,
            current: None,
            at_end: false,
            entry_open: false,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn format(&self) -> Option<Format> {
        self.format
    }

    pub(crate) fn filter(&self) -> Option<Filter> {
        self.filter
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub(crate) fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub(crate) fn cursor(&self) -> Cursor {
        match &self.current {
            Some(current) => Cursor::At {
                position: current.entry.header_position().unwrap_or_default(),
                consumed: current.consumed,
            },
            None if self.at_end => Cursor::End,
            None => Cursor::Start,
        }
    }

    pub(crate) fn current_entry(&self) -> Option<&Entry> {
        self.current.as_ref().map(|c| &c.entry)
    }

    fn check_usable(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(Error::SessionClosed);
        }
        if let Some(message) = &self.failure {
            return Err(Error::SessionFailed(message.clone()));
        }
        Ok(())
    }

    /// Guard for calls made on the archive itself rather than through a stream
    pub(crate) fn check_direct(&self, mode: Mode) -> Result<()> {
        if self.state != SessionState::Open {
            return Err(Error::SessionClosed);
        }
        self.check_usable()?;
        if self.mode != mode {
            return Err(Error::WrongMode {
                expected: mode,
                actual: self.mode,
            });
        }
        if self.stream.is_some() {
            return Err(Error::StreamOpen);
        }
        Ok(())
    }

    /// Guard for calls made through the stream holding `ticket`. A deferred
    /// close does not affect the stream.
    fn check_stream(&self, ticket: u64) -> Result<()> {
        self.check_usable()?;
        if self.stream != Some(ticket) {
            return Err(Error::StreamClosed);
        }
        Ok(())
    }

    /// Move codec warnings into the session queue, logging each once
    fn drain_warnings(&mut self) {
        let drained = match self.handle.as_mut() {
            Some(Handle::Read(h)) => h.take_warnings(),
            Some(Handle::Write(h)) => h.take_warnings(),
            None => Vec::new(),
        };
        for warning in drained {
            log::warn!("{warning}");
            self.warnings.push(warning);
        }
    }

    pub(crate) fn warn(&mut self, warning: String) {
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Record a codec failure; afterwards only close (or reopen) is accepted
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        self.drain_warnings();
        if let Err(e) = &result {
            if matches!(e, Error::Fatal { .. } | Error::Io(_)) {
                log::debug!("archive session failed: {e}");
                self.failure = Some(e.to_string());
            }
        }
        result
    }

    fn reader(&mut self) -> Result<&mut Box<dyn ReadHandle<'a> + 'a>> {
        match self.handle.as_mut() {
            Some(Handle::Read(h)) => Ok(h),
            _ => Err(Error::WrongMode {
                expected: Mode::Read,
                actual: self.mode,
            }),
        }
    }

    fn writer(&mut self) -> Result<&mut Box<dyn WriteHandle<'a> + 'a>> {
        match self.handle.as_mut() {
            Some(Handle::Write(h)) => Ok(h),
            _ => Err(Error::WrongMode {
                expected: Mode::Write,
                actual: self.mode,
            }),
        }
    }

    // ---- read path ----

    pub(crate) fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.check_direct(Mode::Read)?;
        if self.at_end {
            return Ok(None);
        }
        self.current = None;

        let result = self.reader()?.next_header();
        let Some(raw) = self.record(result)? else {
            self.at_end = true;
            return Ok(None);
        };

        let (entry, lossy) = Entry::from_raw(&raw, self.encoding);
        if lossy {
            self.warn(format!(
                "pathname {:?} is not valid {}; undecodable bytes replaced",
                entry.pathname, self.encoding
            ));
        }
        log::trace!("entry {} at {}", entry.pathname, raw.position);
        self.current = Some(Current {
            remaining: entry.size,
            entry: entry.clone(),
            consumed: false,
        });
        Ok(Some(entry))
    }

    /// Read up to `max` bytes of the current entry, never past its declared size
    fn read_body(&mut self, max: usize) -> Result<Bytes> {
        let Some(current) = self.current.as_mut() else {
            return Err(Error::NoCurrentEntry);
        };
        let want = std::cmp::min(max as u64, current.remaining) as usize;
        current.consumed = true;
        if want == 0 {
            return Ok(Bytes::new());
        }

        // the declared size is untrusted; grow only as bytes arrive
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; want.min(READ_CHUNK)];
        let result = loop {
            let ask = (want - buf.len()).min(chunk.len());
            if ask == 0 {
                break Ok(());
            }
            match self.reader().and_then(|h| h.read_body(&mut chunk[..ask])) {
                Ok(0) => break Ok(()),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => break Err(e),
            }
        };
        self.record(result)?;

        let filled = buf.len();
        if let Some(current) = self.current.as_mut() {
            current.remaining -= filled as u64;
            // a short body means the codec knew better than the header
            if filled < want {
                current.remaining = 0;
            }
        }
        Ok(buf.freeze())
    }

    pub(crate) fn read(&mut self, max: usize) -> Result<Bytes> {
        self.check_direct(Mode::Read)?;
        self.read_body(max)
    }

    pub(crate) fn read_all(&mut self) -> Result<Bytes> {
        self.check_direct(Mode::Read)?;
        let remaining = self.current.as_ref().map_or(0, |c| c.remaining);
        self.read_body(usize::try_from(remaining).unwrap_or(usize::MAX))
    }

    pub(crate) fn stream_read(&mut self, ticket: u64, max: usize) -> Result<Bytes> {
        self.check_stream(ticket)?;
        self.read_body(max)
    }

    /// Throw away the codec handle and open a fresh one from the start of the source
    pub(crate) fn reopen(&mut self) -> Result<()> {
        if self.state != SessionState::Open {
            return Err(Error::SessionClosed);
        }
        if self.stream.is_some() {
            return Err(Error::StreamOpen);
        }
        let Some(Handle::Read(handle)) = self.handle.take() else {
            return Err(Error::WrongMode {
                expected: Mode::Read,
                actual: self.mode,
            });
        };

        self.current = None;
        self.at_end = false;
        self.failure = None;

        let mut source = handle.close();
        let reopened = source
            .seek(SeekFrom::Start(self.origin))
            .map_err(Error::from)
            .and_then(|_| codec::open_reader(source, &self.read_config, self.block_size));
        match reopened {
            Ok(handle) => {
                log::debug!("archive session reopened from offset {}", self.origin);
                self.handle = Some(Handle::Read(handle));
                Ok(())
            }
            Err(e) => {
                self.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    // ---- write path ----

    fn header(&mut self, entry: &Entry) -> Result<()> {
        let raw = entry.to_raw()?;
        let result = self.writer()?.write_header(&raw);
        self.record(result)
    }

    fn body(&mut self, data: &[u8]) -> Result<()> {
        let result = self.writer()?.write_body(data);
        self.record(result)
    }

    fn finish(&mut self) -> Result<()> {
        let result = self.writer()?.finish_entry();
        self.record(result)
    }

    /// Write a complete entry: header, body, finish
    pub(crate) fn write_entry(&mut self, entry: &Entry, data: &[u8]) -> Result<()> {
        self.check_direct(Mode::Write)?;
        self.header(entry)?;
        self.entry_open = true;
        self.body(data)?;
        self.entry_open = false;
        self.finish()
    }

    /// Two-phase write for callers that stream a body themselves
    pub(crate) fn write_header(&mut self, entry: &Entry) -> Result<()> {
        self.check_direct(Mode::Write)?;
        self.header(entry)?;
        self.entry_open = true;
        Ok(())
    }

    pub(crate) fn write_body(&mut self, data: &[u8]) -> Result<()> {
        self.check_direct(Mode::Write)?;
        if !self.entry_open {
            return Err(Error::NoCurrentEntry);
        }
        self.body(data)
    }

    pub(crate) fn finish_entry(&mut self) -> Result<()> {
        self.check_direct(Mode::Write)?;
        if !self.entry_open {
            return Err(Error::NoCurrentEntry);
        }
        self.entry_open = false;
        self.finish()
    }

    pub(crate) fn stream_header(&mut self, ticket: u64, entry: &Entry) -> Result<()> {
        self.check_stream(ticket)?;
        self.header(entry)
    }

    pub(crate) fn stream_write(&mut self, ticket: u64, data: &[u8]) -> Result<()> {
        self.check_stream(ticket)?;
        self.body(data)
    }

    pub(crate) fn stream_finish(&mut self, ticket: u64) -> Result<()> {
        self.check_stream(ticket)?;
        self.finish()
    }

    // ---- stream slot and close ----

    /// Hand out the single stream slot
    pub(crate) fn acquire_stream(&mut self, mode: Mode) -> Result<u64> {
        self.check_direct(mode)?;
        if mode == Mode::Read && self.current.is_none() {
            return Err(Error::NoCurrentEntry);
        }
        if mode == Mode::Write && self.entry_open {
            self.entry_open = false;
            self.finish()?;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.stream = Some(ticket);
        Ok(ticket)
    }

    /// Free the stream slot; runs the deferred teardown if a close was requested
    pub(crate) fn release_stream(&mut self, ticket: u64) -> Result<()> {
        if self.stream != Some(ticket) {
            return Ok(());
        }
        self.stream = None;
        if self.state == SessionState::CloseRequested {
            log::debug!("entry stream closed; running deferred archive close");
            self.teardown()
        } else {
            Ok(())
        }
    }

    /// Direct close request
    pub(crate) fn request_close(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => Ok(()),
            SessionState::CloseRequested => Ok(()),
            SessionState::Open if self.stream.is_some() => {
                log::debug!("archive close deferred until the open entry stream closes");
                self.state = SessionState::CloseRequested;
                Ok(())
            }
            SessionState::Open => self.teardown(),
        }
    }

    /// Release the codec handle and the byte source. Idempotent.
    fn teardown(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.current = None;

        let result = match self.handle.take() {
            Some(Handle::Read(handle)) => {
                drop(handle.close());
                Ok(())
            }
            Some(Handle::Write(mut handle)) => {
                let finished = if self.entry_open {
                    self.entry_open = false;
                    handle.finish_entry()
                } else {
                    Ok(())
                };
                for warning in handle.take_warnings() {
                    log::warn!("{warning}");
                    self.warnings.push(warning);
                }
                finished.and_then(|_| {
                    let mut sink = handle.close()?;
                    sink.flush()?;
                    sink.sync()?;
                    Ok(())
                })
            }
            None => Ok(()),
        };
        log::debug!("archive session closed");
        result
    }
}
