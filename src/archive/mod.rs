mod seekable;
mod session;
mod stream;

pub use seekable::{Member, SeekableArchive};
pub use session::SessionState;
pub use stream::{EntryReadStream, EntryWriteStream};

use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::rc::Rc;

use bytes::Bytes;

use crate::codec::{self, ReadConfig, WriteConfig};
use crate::config::{ArchiveOptions, Mode};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::format::{Filter, Format, guess_format};
use crate::source::{ReadSeek, SyncWrite, Unsynced};
use session::{Cursor, Handle, Session, SessionParams};

/// Chunk size for copying bodies between archives and files
const COPY_CHUNK: usize = 64 * 1024;

/// A read or write session over one archive.
///
/// Reading is forward-only: [`next_entry`](Archive::next_entry) advances to
/// the next header, and the body of the current entry can be read directly
/// or through an [`EntryReadStream`]. Writing appends entries in call order.
///
/// At most one entry stream exists per archive. While it is open the archive
/// rejects direct calls with [`Error::StreamOpen`], and
/// [`close`](Archive::close) is deferred until the stream closes.
///
/// ```no_run
/// use arcsession::{Archive, ArchiveOptions};
///
/// let mut archive = Archive::open("backup.tar.gz", ArchiveOptions::read())?;
/// while let Some(entry) = archive.next_entry()? {
///     println!("{} ({} bytes)", entry.pathname, entry.size);
/// }
/// archive.close()?;
/// # Ok::<(), arcsession::Error>(())
/// ```
pub struct Archive<'a> {
    session: Rc<RefCell<Session<'a>>>,
}

impl Archive<'static> {
    /// Open a file-system path. Format and filter not given in `options`
    /// are inferred from the file name.
    pub fn open(path: impl AsRef<Path>, options: ArchiveOptions) -> Result<Self> {
        let path = path.as_ref();
        let (guessed_format, guessed_filter) = guess_format(&path.to_string_lossy());
        let format = options.format.or(guessed_format);
        let filter = options.filter.or(guessed_filter);

        match options.mode {
            Mode::Append => Err(Error::AppendUnsupported),
            Mode::Read => {
                let config = read_config(format, filter)?;
                log::debug!("opening {} for reading", path.display());
                let file = File::open(path)?;
                Archive::start_read(Box::new(file), &options, format, filter, config)
            }
            Mode::Write => {
                let config = write_config(format, filter)?;
                log::debug!("creating {}", path.display());
                let file = File::create(path)?;
                Archive::start_write(Box::new(file), &options, format, filter, config)
            }
        }
    }
}

impl<'a> Archive<'a> {
    /// Read from any seekable byte source. Nothing is inferred: format and
    /// filter left unset are probed.
    pub fn reader<R: Read + Seek + 'a>(source: R, options: ArchiveOptions) -> Result<Self> {
        match options.mode {
            Mode::Read => {}
            Mode::Append => return Err(Error::AppendUnsupported),
            Mode::Write => {
                return Err(Error::WrongMode {
                    expected: Mode::Read,
                    actual: Mode::Write,
                });
            }
        }
        let config = read_config(options.format, options.filter)?;
        Archive::start_read(Box::new(source), &options, options.format, options.filter, config)
    }

    /// Write to any byte sink. `options.format` is required.
    pub fn writer<W: Write + 'a>(sink: W, options: ArchiveOptions) -> Result<Self> {
        match options.mode {
            Mode::Write => {}
            Mode::Append => return Err(Error::AppendUnsupported),
            Mode::Read => {
                return Err(Error::WrongMode {
                    expected: Mode::Write,
                    actual: Mode::Read,
                });
            }
        }
        let config = write_config(options.format, options.filter)?;
        Archive::start_write(
            Box::new(Unsynced(sink)),
            &options,
            options.format,
            options.filter,
            config,
        )
    }

    fn start_read(
        mut source: Box<dyn ReadSeek + 'a>,
        options: &ArchiveOptions,
        format: Option<Format>,
        filter: Option<Filter>,
        read_config: ReadConfig,
    ) -> Result<Self> {
        let origin = source.stream_position()?;
        let block_size = options.effective_block_size();
        let handle = codec::open_reader(source, &read_config, block_size)?;
        let params = SessionParams {
            mode: Mode::Read,
            format,
            filter,
            encoding: options.encoding,
            block_size,
            read_config,
            origin,
        };
        Ok(Archive::from_session(Session::new(params, Handle::Read(handle))))
    }

    fn start_write(
        sink: Box<dyn SyncWrite + 'a>,
        options: &ArchiveOptions,
        format: Option<Format>,
        filter: Option<Filter>,
        write_config: WriteConfig,
    ) -> Result<Self> {
        let handle = codec::open_writer(sink, &write_config)?;
        let params = SessionParams {
            mode: Mode::Write,
            format,
            filter,
            encoding: options.encoding,
            block_size: options.effective_block_size(),
            read_config: ReadConfig::default(),
            origin: 0,
        };
        Ok(Archive::from_session(Session::new(params, Handle::Write(handle))))
    }

    fn from_session(session: Session<'a>) -> Self {
        Archive {
            session: Rc::new(RefCell::new(session)),
        }
    }

    pub fn mode(&self) -> Mode {
        self.session.borrow().mode()
    }

    /// Format the session was opened with, if one was given or inferred
    pub fn format(&self) -> Option<Format> {
        self.session.borrow().format()
    }

    pub fn filter(&self) -> Option<Filter> {
        self.session.borrow().filter()
    }

    pub fn state(&self) -> SessionState {
        self.session.borrow().state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn has_open_stream(&self) -> bool {
        self.session.borrow().has_stream()
    }

    // ---- reading ----

    /// Advance to the next header. Any unread body of the current entry is
    /// skipped. Returns `None` at the end of the container.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.session.borrow_mut().next_entry()
    }

    /// Iterate over the remaining entries
    pub fn entries(&mut self) -> Entries<'_, 'a> {
        Entries {
            archive: self,
            done: false,
        }
    }

    /// Iterate over the pathnames of the remaining entries
    pub fn paths(&mut self) -> impl Iterator<Item = Result<String>> + '_ {
        self.entries().map(|entry| entry.map(|e| e.pathname))
    }

    /// The entry the read cursor is positioned on
    pub fn current(&self) -> Option<Entry> {
        self.session.borrow().current_entry().cloned()
    }

    pub fn header_position(&self) -> Option<u64> {
        self.session
            .borrow()
            .current_entry()
            .and_then(Entry::header_position)
    }

    /// Read up to `max` bytes of the current entry's body. Returns an empty
    /// buffer once the declared size has been delivered.
    pub fn read(&mut self, max: usize) -> Result<Bytes> {
        self.session.borrow_mut().read(max)
    }

    /// Read the rest of the current entry's body
    pub fn read_all(&mut self) -> Result<Bytes> {
        self.session.borrow_mut().read_all()
    }

    /// Copy the rest of the current entry's body to `path`, creating parent
    /// directories as needed. Returns the number of bytes written.
    pub fn read_to_path(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        self.session.borrow().check_direct(Mode::Read)?;
        if self.session.borrow().current_entry().is_none() {
            return Err(Error::NoCurrentEntry);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        let mut copied = 0u64;
        loop {
            let chunk = self.read(COPY_CHUNK)?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk)?;
            copied += chunk.len() as u64;
        }
        file.flush()?;
        log::debug!("extracted {copied} bytes to {}", path.display());
        Ok(copied)
    }

    /// Open a stream over the current entry's body
    pub fn read_stream(&mut self) -> Result<EntryReadStream<'a>> {
        let mut session = self.session.borrow_mut();
        let ticket = session.acquire_stream(Mode::Read)?;
        let entry = session
            .current_entry()
            .cloned()
            .ok_or(Error::NoCurrentEntry)?;
        drop(session);
        Ok(EntryReadStream::new(Rc::clone(&self.session), ticket, entry))
    }

    // ---- writing ----

    /// Write one complete entry. Unless it is a directory, the entry's size
    /// is taken from `data`.
    pub fn write(&mut self, entry: impl Into<Entry>, data: &[u8]) -> Result<()> {
        let mut entry = entry.into();
        if !entry.is_dir() {
            entry.size = data.len() as u64;
        }
        self.session.borrow_mut().write_entry(&entry, data)
    }

    /// Add a file-system object. `pathname` overrides the name stored in
    /// the archive, which defaults to `path` as given.
    pub fn write_path(&mut self, path: impl AsRef<Path>, pathname: Option<&str>) -> Result<()> {
        let path = path.as_ref();
        let mut entry = Entry::from_path(path)?;
        if let Some(pathname) = pathname {
            entry.pathname = pathname.to_string();
        }
        if !entry.is_file() {
            return self.session.borrow_mut().write_entry(&entry, &[]);
        }

        let mut file = File::open(path)?;
        self.write_header(&entry)?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write_data(&buf[..n])?;
        }
        self.finish_entry()
    }

    /// Add an empty directory entry, mode 0755, modified now
    pub fn write_directory(&mut self, pathname: &str) -> Result<()> {
        self.write(Entry::directory(pathname), &[])
    }

    /// Start a new entry; follow with [`write_data`](Archive::write_data)
    /// and [`finish_entry`](Archive::finish_entry). `entry.size` must be the
    /// exact body length.
    pub fn write_header(&mut self, entry: &Entry) -> Result<()> {
        self.session.borrow_mut().write_header(entry)
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.session.borrow_mut().write_body(data)
    }

    pub fn finish_entry(&mut self) -> Result<()> {
        self.session.borrow_mut().finish_entry()
    }

    /// Open a stream for one entry body. With `size` given the header goes
    /// out immediately; without it the body is buffered until the stream
    /// closes so the header can carry the real size.
    pub fn write_stream(
        &mut self,
        entry: impl Into<Entry>,
        size: Option<u64>,
    ) -> Result<EntryWriteStream<'a>> {
        let mut entry = entry.into();
        if let Some(size) = size {
            entry.size = size;
        }
        let ticket = self.session.borrow_mut().acquire_stream(Mode::Write)?;
        EntryWriteStream::new(Rc::clone(&self.session), ticket, entry, size.is_none())
    }

    // ---- lifecycle ----

    /// Close the archive. With an entry stream open the close is deferred
    /// until that stream closes. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.session.borrow_mut().request_close()
    }

    /// Warnings raised by the codec so far
    pub fn warnings(&self) -> Vec<String> {
        self.session.borrow().warnings().to_vec()
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        self.session.borrow_mut().take_warnings()
    }

    pub(crate) fn reopen(&mut self) -> Result<()> {
        self.session.borrow_mut().reopen()
    }

    pub(crate) fn cursor(&self) -> Cursor {
        self.session.borrow().cursor()
    }
}

impl Drop for Archive<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("error closing archive: {e}");
        }
    }
}

/// Iterator returned by [`Archive::entries`]. Stops after the first error.
pub struct Entries<'s, 'a> {
    archive: &'s mut Archive<'a>,
    done: bool,
}

impl Iterator for Entries<'_, '_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.archive.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Enable the requested format and filter, or everything readable when
/// either is unset
fn read_config(format: Option<Format>, filter: Option<Filter>) -> Result<ReadConfig> {
    let mut config = ReadConfig::default();
    match format {
        Some(format) => {
            let enable = format.read_support().ok_or_else(|| Error::UnsupportedFormat {
                format: format.to_string(),
                mode: Mode::Read,
            })?;
            enable(&mut config);
        }
        None => Format::ALL
            .iter()
            .filter_map(|format| format.read_support())
            .for_each(|enable| enable(&mut config)),
    }
    match filter {
        Some(filter) => (filter.read_support())(&mut config),
        None => Filter::ALL
            .iter()
            .for_each(|filter| (filter.read_support())(&mut config)),
    }
    Ok(config)
}

fn write_config(format: Option<Format>, filter: Option<Filter>) -> Result<WriteConfig> {
    let format = format.ok_or(Error::FormatRequired)?;
    let enable = format.write_support().ok_or_else(|| Error::UnsupportedFormat {
        format: format.to_string(),
        mode: Mode::Write,
    })?;
    let mut config = WriteConfig::default();
    enable(&mut config);
    if let Some(filter) = filter {
        (filter.write_support())(&mut config);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as IoCursor;

    fn tar_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut archive = Archive::writer(&mut out, ArchiveOptions::write(Format::Tar)).unwrap();
            for (name, data) in entries {
                archive.write(*name, data.as_bytes()).unwrap();
            }
            archive.close().unwrap();
        }
        out
    }

    #[test]
    fn test_write_then_read() {
        let bytes = tar_bytes(&[("a.txt", "abcd"), ("b.txt", "")]);
        let mut archive = Archive::reader(IoCursor::new(bytes), ArchiveOptions::read()).unwrap();

        let a = archive.next_entry().unwrap().unwrap();
        assert_eq!(a.pathname, "a.txt");
        assert_eq!(a.size, 4);
        assert_eq!(&archive.read_all().unwrap()[..], b"abcd");

        let b = archive.next_entry().unwrap().unwrap();
        assert_eq!(b.pathname, "b.txt");
        assert!(archive.read_all().unwrap().is_empty());
        assert!(archive.next_entry().unwrap().is_none());
        archive.close().unwrap();
        assert!(archive.is_closed());
    }

    #[test]
    fn test_read_never_passes_declared_size() {
        let bytes = tar_bytes(&[("a.txt", "abcd")]);
        let mut archive = Archive::reader(IoCursor::new(bytes), ArchiveOptions::read()).unwrap();
        archive.next_entry().unwrap();
        assert_eq!(&archive.read(3).unwrap()[..], b"abc");
        assert_eq!(&archive.read(100).unwrap()[..], b"d");
        assert!(archive.read(100).unwrap().is_empty());
    }

    #[test]
    fn test_read_without_entry() {
        let bytes = tar_bytes(&[("a.txt", "abcd")]);
        let mut archive = Archive::reader(IoCursor::new(bytes), ArchiveOptions::read()).unwrap();
        assert!(matches!(archive.read(10), Err(Error::NoCurrentEntry)));
        assert!(matches!(archive.read_stream(), Err(Error::NoCurrentEntry)));
    }

    #[test]
    fn test_mode_mismatch() {
        let bytes = tar_bytes(&[("a.txt", "abcd")]);
        let mut archive = Archive::reader(IoCursor::new(bytes), ArchiveOptions::read()).unwrap();
        let err = archive.write("x", b"y").unwrap_err();
        assert!(matches!(err, Error::WrongMode { expected: Mode::Write, .. }));

        let err = Archive::reader(IoCursor::new(Vec::new()), ArchiveOptions::write(Format::Tar))
            .err()
            .unwrap();
        assert!(err.is_usage());
    }

    #[test]
    fn test_append_rejected() {
        let err = Archive::reader(
            IoCursor::new(Vec::new()),
            ArchiveOptions::read().mode(Mode::Append),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::AppendUnsupported));
    }

    #[test]
    fn test_writer_requires_format() {
        let mut out = Vec::new();
        let err = Archive::writer(&mut out, ArchiveOptions::read().mode(Mode::Write))
            .err()
            .unwrap();
        assert!(matches!(err, Error::FormatRequired));

        let err = Archive::writer(&mut out, ArchiveOptions::write(Format::Rar))
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn test_direct_calls_blocked_while_stream_open() {
        let bytes = tar_bytes(&[("a.txt", "abcd"), ("b.txt", "xy")]);
        let mut archive = Archive::reader(IoCursor::new(bytes), ArchiveOptions::read()).unwrap();
        archive.next_entry().unwrap();

        let mut stream = archive.read_stream().unwrap();
        assert!(archive.has_open_stream());
        assert!(matches!(archive.next_entry(), Err(Error::StreamOpen)));
        assert!(matches!(archive.read_stream(), Err(Error::StreamOpen)));

        assert_eq!(&stream.read_all().unwrap()[..], b"abcd");
        stream.close().unwrap();
        assert!(!archive.has_open_stream());
        assert_eq!(archive.next_entry().unwrap().unwrap().pathname, "b.txt");
    }

    #[test]
    fn test_deferred_close() {
        let bytes = tar_bytes(&[("a.txt", "abcd")]);
        let mut archive = Archive::reader(IoCursor::new(bytes), ArchiveOptions::read()).unwrap();
        archive.next_entry().unwrap();
        let mut stream = archive.read_stream().unwrap();

        archive.close().unwrap();
        assert_eq!(archive.state(), SessionState::CloseRequested);
        assert_eq!(&stream.read_bytes(2).unwrap()[..], b"ab");

        drop(stream);
        assert_eq!(archive.state(), SessionState::Closed);
        assert!(matches!(archive.next_entry(), Err(Error::SessionClosed)));
        archive.close().unwrap();
    }

    #[test]
    fn test_entries_and_paths() {
        let bytes = tar_bytes(&[("one", "1"), ("two", "22"), ("three", "333")]);
        let mut archive = Archive::reader(IoCursor::new(bytes), ArchiveOptions::read()).unwrap();
        let paths: Vec<String> = archive.paths().collect::<Result<_>>().unwrap();
        assert_eq!(paths, ["one", "two", "three"]);
        assert!(archive.entries().next().is_none());
    }

    #[test]
    fn test_two_phase_write() {
        let mut out = Vec::new();
        {
            let mut archive = Archive::writer(&mut out, ArchiveOptions::write(Format::Tar)).unwrap();
            let entry = Entry::new("chunks.txt").with_size(6);
            archive.write_header(&entry).unwrap();
            archive.write_data(b"abc").unwrap();
            archive.write_data(b"def").unwrap();
            archive.finish_entry().unwrap();
            assert!(matches!(archive.write_data(b"x"), Err(Error::NoCurrentEntry)));
            archive.close().unwrap();
        }

        let mut archive = Archive::reader(IoCursor::new(out), ArchiveOptions::read()).unwrap();
        archive.next_entry().unwrap();
        assert_eq!(&archive.read_all().unwrap()[..], b"abcdef");
    }

    #[test]
    fn test_buffered_write_stream() {
        let mut out = Vec::new();
        {
            let mut archive = Archive::writer(&mut out, ArchiveOptions::write(Format::Zip)).unwrap();
            let mut stream = archive.write_stream("streamed.txt", None).unwrap();
            assert!(stream.is_buffered());
            stream.write_all(b"hello ").unwrap();
            stream.write_all(b"world").unwrap();
            stream.close().unwrap();
            archive.close().unwrap();
        }

        let mut archive = Archive::reader(IoCursor::new(out), ArchiveOptions::read()).unwrap();
        let entry = archive.next_entry().unwrap().unwrap();
        assert_eq!(entry.size, 11);
        assert_eq!(&archive.read_all().unwrap()[..], b"hello world");
    }

    #[test]
    fn test_unrecognized_input() {
        let err = Archive::reader(IoCursor::new(b"just some text".to_vec()), ArchiveOptions::read())
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
