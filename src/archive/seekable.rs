use std::io::{Read, Seek};
use std::path::Path;

use bytes::Bytes;

use super::session::Cursor;
use super::{Archive, EntryReadStream};
use crate::cache::EntryCache;
use crate::config::{ArchiveOptions, Mode};
use crate::entry::Entry;
use crate::error::{Error, Result};

/// Names an archive member either by pathname or by an entry obtained earlier
#[derive(Debug, Clone, Copy)]
pub enum Member<'m> {
    Name(&'m str),
    Entry(&'m Entry),
}

impl<'m> From<&'m str> for Member<'m> {
    fn from(name: &'m str) -> Self {
        Member::Name(name)
    }
}

impl<'m> From<&'m String> for Member<'m> {
    fn from(name: &'m String) -> Self {
        Member::Name(name)
    }
}

impl<'m> From<&'m Entry> for Member<'m> {
    fn from(entry: &'m Entry) -> Self {
        Member::Entry(entry)
    }
}

/// Random access by pathname on top of a forward-only read session.
///
/// Every entry passed on the way is cached. Moving forward only advances the
/// underlying cursor; moving backward reopens the archive from its start and
/// replays headers up to the target. The cache survives reopens, so it
/// always lists entries in archive order.
pub struct SeekableArchive<'a> {
    archive: Archive<'a>,
    cache: EntryCache,
    /// Every entry has been seen
    exhausted: bool,
    reopens: usize,
}

impl SeekableArchive<'static> {
    pub fn open(path: impl AsRef<Path>, options: ArchiveOptions) -> Result<Self> {
        if options.mode != Mode::Read {
            return Err(Error::WrongMode {
                expected: Mode::Read,
                actual: options.mode,
            });
        }
        SeekableArchive::new(Archive::open(path, options)?)
    }
}

impl<'a> SeekableArchive<'a> {
    pub fn reader<R: Read + Seek + 'a>(source: R, options: ArchiveOptions) -> Result<Self> {
        SeekableArchive::new(Archive::reader(source, options)?)
    }

    /// Wrap a read session that has not been advanced yet
    pub fn new(archive: Archive<'a>) -> Result<Self> {
        if archive.mode() != Mode::Read {
            return Err(Error::WrongMode {
                expected: Mode::Read,
                actual: archive.mode(),
            });
        }
        Ok(SeekableArchive {
            archive,
            cache: EntryCache::new(),
            exhausted: false,
            reopens: 0,
        })
    }

    /// How many times the archive was reopened to move backward
    pub fn reopen_count(&self) -> usize {
        self.reopens
    }

    /// Entries seen so far, in archive order
    pub fn cached(&self) -> &[Entry] {
        self.cache.entries()
    }

    /// Look up an entry by pathname, reading further into the archive if it
    /// has not been seen yet. Does not move the cursor back.
    pub fn get_entry(&mut self, pathname: &str) -> Result<Entry> {
        if let Some(entry) = self.cache.get(pathname) {
            return Ok(entry.clone());
        }
        while let Some(entry) = self.advance()? {
            if entry.pathname == pathname {
                return Ok(entry);
            }
        }
        Err(Error::NotFound(pathname.to_string()))
    }

    /// All entries of the archive, reading to the end if necessary
    pub fn entries(&mut self) -> Result<Vec<Entry>> {
        while self.advance()?.is_some() {}
        Ok(self.cache.entries().to_vec())
    }

    /// Read the next entry past the last cached one
    fn advance(&mut self) -> Result<Option<Entry>> {
        if self.exhausted {
            return Ok(None);
        }
        if let Some(last) = self.cache.last().cloned() {
            let at_last = matches!(
                self.archive.cursor(),
                Cursor::At { position, .. } if Some(position) == last.header_position()
            );
            if !at_last {
                self.seek(&last)?;
            }
        }
        self.next_cached()
    }

    fn next_cached(&mut self) -> Result<Option<Entry>> {
        match self.archive.next_entry()? {
            Some(entry) => {
                self.cache.insert(entry.clone());
                Ok(Some(entry))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Position the read cursor on `entry`, whose body has not been read yet
    pub fn seek(&mut self, entry: &Entry) -> Result<()> {
        let target = entry
            .header_position()
            .ok_or_else(|| Error::NoHeaderPosition(entry.pathname.clone()))?;

        let rewind = match self.archive.cursor() {
            Cursor::At { position, consumed } if position == target => {
                if !consumed {
                    return Ok(());
                }
                true
            }
            Cursor::At { position, .. } => position > target,
            Cursor::End => true,
            Cursor::Start => false,
        };
        if rewind {
            log::debug!("reopening archive to seek back to {}", entry.pathname);
            self.archive.reopen()?;
            self.reopens += 1;
        }

        loop {
            let Some(found) = self.next_cached()? else {
                return Err(Error::NotFound(entry.pathname.clone()));
            };
            match found.header_position() {
                Some(position) if position == target => return Ok(()),
                Some(position) if position > target => {
                    return Err(Error::NotFound(entry.pathname.clone()));
                }
                _ => {}
            }
        }
    }

    fn locate(&mut self, member: Member<'_>) -> Result<Entry> {
        let entry = match member {
            Member::Entry(entry) if entry.header_position().is_some() => entry.clone(),
            Member::Entry(entry) => self.get_entry(&entry.pathname)?,
            Member::Name(name) => self.get_entry(name)?,
        };
        self.seek(&entry)?;
        Ok(entry)
    }

    /// Read the whole body of a member
    pub fn read<'m>(&mut self, member: impl Into<Member<'m>>) -> Result<Bytes> {
        self.locate(member.into())?;
        self.archive.read_all()
    }

    /// Extract a member to `path`. Returns the number of bytes written.
    pub fn read_to_path<'m>(
        &mut self,
        member: impl Into<Member<'m>>,
        path: impl AsRef<Path>,
    ) -> Result<u64> {
        self.locate(member.into())?;
        self.archive.read_to_path(path)
    }

    /// Open a stream over a member's body
    pub fn read_stream<'m>(&mut self, member: impl Into<Member<'m>>) -> Result<EntryReadStream<'a>> {
        self.locate(member.into())?;
        self.archive.read_stream()
    }

    pub fn archive(&self) -> &Archive<'a> {
        &self.archive
    }

    pub fn warnings(&self) -> Vec<String> {
        self.archive.warnings()
    }

    pub fn close(&mut self) -> Result<()> {
        self.archive.close()
    }
}
