//! Session lifecycle tests: entry streams, deferred close, random access and
//! the error classes callers are expected to branch on.
//!
//! Run with: cargo test --test session_lifecycle

use std::io::{Cursor, Read, Write};

use anyhow::Result;

use arcsession::{
    Archive, ArchiveOptions, Error, ErrorKind, Filter, Format, Mode, SeekableArchive, SessionState,
};

/// The two-entry archive most tests start from: `a.txt` = "abcd", `b.txt` empty
fn small_tar(filter: Filter) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut archive = Archive::writer(&mut out, ArchiveOptions::write(Format::Tar).filter(filter))?;
        archive.write("a.txt", b"abcd")?;
        archive.write("b.txt", b"")?;
        archive.close()?;
    }
    Ok(out)
}

#[test]
fn test_small_archive_by_name() -> Result<()> {
    let bytes = small_tar(Filter::Gzip)?;
    let mut archive = SeekableArchive::reader(Cursor::new(bytes), ArchiveOptions::read())?;

    let names: Vec<String> = archive.entries()?.into_iter().map(|e| e.pathname).collect();
    assert_eq!(names, ["a.txt", "b.txt"]);

    assert_eq!(&archive.read("a.txt")?[..], b"abcd");
    assert!(archive.read("b.txt")?.is_empty());

    let err = archive.get_entry("missing").unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.kind(), ErrorKind::NotFound);
    archive.close()?;
    Ok(())
}

#[test]
fn test_read_stream_outlives_close() -> Result<()> {
    let bytes = small_tar(Filter::Bzip2)?;
    let mut archive = Archive::reader(Cursor::new(bytes), ArchiveOptions::read())?;
    archive.next_entry()?;
    let mut stream = archive.read_stream()?;

    archive.close()?;
    assert_eq!(archive.state(), SessionState::CloseRequested);
    // a second close is still a no-op
    archive.close()?;

    let mut body = String::new();
    stream.read_to_string(&mut body)?;
    assert_eq!(body, "abcd");
    assert_eq!(stream.position(), 4);

    stream.close()?;
    assert_eq!(archive.state(), SessionState::Closed);
    assert!(matches!(archive.read(1), Err(Error::SessionClosed)));
    assert!(matches!(stream.read_bytes(1), Err(Error::StreamClosed)));
    Ok(())
}

#[test]
fn test_write_stream_outlives_close() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("deferred.zip");

    let mut archive = Archive::open(&path, ArchiveOptions::write(Format::Zip))?;
    let mut stream = archive.write_stream("late.txt", Some(9))?;
    archive.close()?;
    assert!(!archive.is_closed());
    assert!(matches!(archive.write("other", b"x"), Err(Error::SessionClosed)));

    stream.write_all(b"late body")?;
    drop(stream);
    assert!(archive.is_closed());

    let mut archive = SeekableArchive::open(&path, ArchiveOptions::read())?;
    assert_eq!(&archive.read("late.txt")?[..], b"late body");
    Ok(())
}

#[test]
fn test_stream_slot_is_exclusive() -> Result<()> {
    let mut out = Vec::new();
    let mut archive = Archive::writer(&mut out, ArchiveOptions::write(Format::Cpio))?;
    let mut first = archive.write_stream("first", None)?;
    assert!(matches!(archive.write_stream("second", None), Err(Error::StreamOpen)));
    assert!(matches!(archive.write("direct", b"x"), Err(Error::StreamOpen)));

    first.write_all(b"one")?;
    first.close()?;
    drop(first);
    archive.write("direct", b"x")?;
    archive.close()?;
    drop(archive);

    let mut archive = Archive::reader(Cursor::new(out), ArchiveOptions::read())?;
    let first = archive.next_entry()?.expect("first");
    assert_eq!(first.size, 3);
    assert_eq!(&archive.read_all()?[..], b"one");
    assert_eq!(archive.next_entry()?.expect("direct").pathname, "direct");
    Ok(())
}

#[test]
fn test_seekable_reopen_counts() -> Result<()> {
    let mut out = Vec::new();
    {
        let mut archive = Archive::writer(&mut out, ArchiveOptions::write(Format::Pax))?;
        for name in ["one", "two", "three", "four"] {
            archive.write(name, name.as_bytes())?;
        }
        archive.close()?;
    }
    let mut archive = SeekableArchive::reader(Cursor::new(out), ArchiveOptions::read())?;

    for name in ["one", "three", "four"] {
        assert_eq!(&archive.read(name)?[..], name.as_bytes());
    }
    assert_eq!(archive.reopen_count(), 0);

    assert_eq!(&archive.read("two")?[..], b"two");
    assert_eq!(archive.reopen_count(), 1);

    let order: Vec<&str> = archive.cached().iter().map(|e| e.pathname.as_str()).collect();
    assert_eq!(order, ["one", "two", "three", "four"]);

    let mut stream = archive.read_stream("three")?;
    let mut body = Vec::new();
    stream.read_to_end(&mut body)?;
    assert_eq!(body, b"three");
    Ok(())
}

#[test]
fn test_read_past_declared_size() -> Result<()> {
    let bytes = small_tar(Filter::Uncompressed)?;
    let mut archive = Archive::reader(Cursor::new(bytes), ArchiveOptions::read())?;
    archive.next_entry()?;
    assert_eq!(&archive.read(1024)?[..], b"abcd");
    assert!(archive.read(1024)?.is_empty());
    assert!(archive.read(1024)?.is_empty());
    Ok(())
}

#[test]
fn test_write_without_format_touches_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("no_extension");
    let err = Archive::open(&path, ArchiveOptions::read().mode(Mode::Write))
        .err()
        .expect("format is required");
    assert!(matches!(err, Error::FormatRequired));
    assert!(err.is_usage());
    assert!(!path.exists());

    let err = Archive::open(&path, ArchiveOptions::read().mode(Mode::Append))
        .err()
        .expect("append is rejected");
    assert!(matches!(err, Error::AppendUnsupported));
    Ok(())
}

#[test]
fn test_unreadable_formats_are_reported() -> Result<()> {
    let err = Archive::reader(
        Cursor::new(b"Rar!\x1a\x07\x00 rest of a rar archive".to_vec()),
        ArchiveOptions::read(),
    )
    .err()
    .expect("rar has no reader");
    assert!(err.is_fatal());
    assert!(err.to_string().contains("RAR"));

    let err = Archive::reader(Cursor::new(Vec::new()), ArchiveOptions::read().format(Format::SevenZip))
        .err()
        .expect("7z has no reader");
    assert!(matches!(err, Error::UnsupportedFormat { mode: Mode::Read, .. }));
    Ok(())
}

#[test]
fn test_truncated_archive_fails_session() -> Result<()> {
    let mut bytes = small_tar(Filter::Uncompressed)?;
    // keep the first header and half of a body block
    bytes.truncate(512 + 2);
    let mut archive = Archive::reader(Cursor::new(bytes), ArchiveOptions::read())?;
    archive.next_entry()?;
    let err = archive.read_all().unwrap_err();
    assert!(err.is_fatal() || err.kind() == ErrorKind::Io);

    assert!(matches!(archive.next_entry(), Err(Error::SessionFailed(_))));
    archive.close()?;
    Ok(())
}

#[test]
fn test_huge_declared_size_is_an_error() -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path("huge.bin")?;
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(1 << 60);
    header.set_cksum();
    let mut bytes = header.as_bytes().to_vec();
    bytes.extend_from_slice(&[b'x'; 512]);

    let mut archive = Archive::reader(Cursor::new(bytes), ArchiveOptions::read())?;
    let entry = archive.next_entry()?.expect("huge.bin");
    assert_eq!(entry.size, 1 << 60);

    let err = archive.read_all().unwrap_err();
    assert!(err.is_fatal() || err.kind() == ErrorKind::Io);
    archive.close()?;
    Ok(())
}

#[test]
fn test_read_warnings_reach_caller() -> Result<()> {
    let mut bytes = small_tar(Filter::Uncompressed)?;
    // a.txt header and body, b.txt header; no end-of-archive blocks
    bytes.truncate(3 * 512);

    let mut archive = Archive::reader(Cursor::new(bytes), ArchiveOptions::read())?;
    assert_eq!(archive.next_entry()?.expect("a.txt").pathname, "a.txt");
    assert_eq!(&archive.read_all()?[..], b"abcd");
    assert_eq!(archive.next_entry()?.expect("b.txt").pathname, "b.txt");
    assert!(archive.next_entry()?.is_none());

    assert_eq!(archive.warnings().len(), 1);
    assert_eq!(archive.take_warnings().len(), 1);
    assert!(archive.warnings().is_empty());
    archive.close()?;
    Ok(())
}

#[test]
fn test_write_warnings_reach_caller() -> Result<()> {
    let mut out = Vec::new();
    {
        let mut archive = Archive::writer(&mut out, ArchiveOptions::write(Format::Tar))?;
        archive.write_header(&arcsession::Entry::new("short.txt").with_size(5))?;
        archive.write_data(b"ab")?;
        archive.finish_entry()?;
        assert_eq!(archive.warnings().len(), 1);

        archive.write("after.txt", b"ok")?;
        archive.close()?;
    }

    let mut archive = Archive::reader(Cursor::new(out), ArchiveOptions::read())?;
    let short = archive.next_entry()?.expect("short.txt");
    assert_eq!(short.size, 5);
    assert_eq!(&archive.read_all()?[..], b"ab\0\0\0");
    assert_eq!(archive.next_entry()?.expect("after.txt").pathname, "after.txt");
    assert_eq!(&archive.read_all()?[..], b"ok");
    Ok(())
}
