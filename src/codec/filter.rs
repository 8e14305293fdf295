use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use super::{ReadFilter, WriteFilter};
use crate::source::{ReadSeek, SyncWrite, read_full};

/// Raw byte source as seen by the read stack, buffered at the session's block size
pub(crate) type Input<'a> = io::BufReader<Box<dyn ReadSeek + 'a>>;

/// Buffered sink under the write stack
pub(crate) type Output<'a> = BufWriter<Box<dyn SyncWrite + 'a>>;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";

/// Look at the first bytes of `input` and pick the filter to apply.
///
/// Only filters in `enabled` are considered; anything else is read as
/// uncompressed, which is always available. The source is rewound to where
/// it started.
pub(crate) fn sniff(input: &mut Input<'_>, enabled: &[ReadFilter]) -> io::Result<Option<ReadFilter>> {
    let start = input.stream_position()?;
    let mut magic = [0u8; 3];
    let n = read_full(input, &mut magic)?;
    input.seek(SeekFrom::Start(start))?;

    let magic = &magic[..n];
    let detected = if magic.starts_with(&GZIP_MAGIC) {
        Some(ReadFilter::Gzip)
    } else if magic.starts_with(&BZIP2_MAGIC) {
        Some(ReadFilter::Bzip2)
    } else {
        None
    };

    Ok(detected.filter(|f| enabled.contains(f)))
}

/// Decompressing view of the byte source
pub(crate) enum Decoder<'a> {
    Plain(Input<'a>),
    Gzip(MultiGzDecoder<Input<'a>>),
    Bzip2(BzDecoder<Input<'a>>),
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(input: Input<'a>, filter: Option<ReadFilter>) -> Self {
        match filter {
            None => Decoder::Plain(input),
            Some(ReadFilter::Gzip) => Decoder::Gzip(MultiGzDecoder::new(input)),
            Some(ReadFilter::Bzip2) => Decoder::Bzip2(BzDecoder::new(input)),
        }
    }

    /// Unwind the stack and hand back the caller's source
    pub(crate) fn into_source(self) -> Box<dyn ReadSeek + 'a> {
        let input = match self {
            Decoder::Plain(input) => input,
            Decoder::Gzip(d) => d.into_inner(),
            Decoder::Bzip2(d) => d.into_inner(),
        };
        input.into_inner()
    }
}

impl Read for Decoder<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::Plain(r) => r.read(buf),
            Decoder::Gzip(r) => r.read(buf),
            Decoder::Bzip2(r) => r.read(buf),
        }
    }
}

/// Decoded stream with the bytes consumed during format bidding put back in front
pub(crate) struct Peeked<'a> {
    prefix: Cursor<Vec<u8>>,
    decoder: Decoder<'a>,
}

impl<'a> Peeked<'a> {
    pub(crate) fn new(prefix: Vec<u8>, decoder: Decoder<'a>) -> Self {
        Peeked {
            prefix: Cursor::new(prefix),
            decoder,
        }
    }

    pub(crate) fn into_source(self) -> Box<dyn ReadSeek + 'a> {
        self.decoder.into_source()
    }
}

impl Read for Peeked<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if (self.prefix.position() as usize) < self.prefix.get_ref().len() {
            return self.prefix.read(buf);
        }
        self.decoder.read(buf)
    }
}

/// Compressing view of the sink
pub(crate) enum Encoder<'a> {
    Plain(Output<'a>),
    Gzip(GzEncoder<Output<'a>>),
    Bzip2(BzEncoder<Output<'a>>),
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(sink: Box<dyn SyncWrite + 'a>, filter: WriteFilter) -> Self {
        let output = BufWriter::new(sink);
        match filter {
            WriteFilter::None => Encoder::Plain(output),
            WriteFilter::Gzip => Encoder::Gzip(GzEncoder::new(output, Compression::default())),
            WriteFilter::Bzip2 => {
                Encoder::Bzip2(BzEncoder::new(output, bzip2::Compression::default()))
            }
        }
    }

    /// Write the filter trailer and hand back the caller's sink
    pub(crate) fn finish(self) -> io::Result<Box<dyn SyncWrite + 'a>> {
        let output = match self {
            Encoder::Plain(output) => output,
            Encoder::Gzip(e) => e.finish()?,
            Encoder::Bzip2(e) => e.finish()?,
        };
        output.into_inner().map_err(|e| e.into_error())
    }
}

impl Write for Encoder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Gzip(w) => w.write(buf),
            Encoder::Bzip2(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Gzip(w) => w.flush(),
            Encoder::Bzip2(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Unsynced;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn input(bytes: Vec<u8>) -> Input<'static> {
        io::BufReader::new(Box::new(Cursor::new(bytes)) as Box<dyn ReadSeek>)
    }

    /// Sink that keeps its bytes reachable after the encoder is dropped
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn encode(filter: WriteFilter, data: &[u8]) -> Vec<u8> {
        let buf = SharedBuf::default();
        let mut encoder = Encoder::new(Box::new(Unsynced(buf.clone())), filter);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap();
        let bytes = buf.0.borrow().clone();
        bytes
    }

    #[test]
    fn test_sniff_rewinds_and_respects_enabled() {
        let gz = encode(WriteFilter::Gzip, b"payload");
        let mut src = input(gz.clone());
        let all = [ReadFilter::Gzip, ReadFilter::Bzip2];
        assert_eq!(sniff(&mut src, &all).unwrap(), Some(ReadFilter::Gzip));
        assert_eq!(src.stream_position().unwrap(), 0);

        let mut src = input(gz);
        assert_eq!(sniff(&mut src, &[ReadFilter::Bzip2]).unwrap(), None);

        let mut src = input(b"plain".to_vec());
        assert_eq!(sniff(&mut src, &all).unwrap(), None);
    }

    #[test]
    fn test_decoder_round_trip() {
        for (wf, rf) in [
            (WriteFilter::Gzip, ReadFilter::Gzip),
            (WriteFilter::Bzip2, ReadFilter::Bzip2),
        ] {
            let encoded = encode(wf, b"hello filter");
            let mut decoder = Decoder::new(input(encoded), Some(rf));
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).unwrap();
            assert_eq!(out, b"hello filter");
        }
    }

    #[test]
    fn test_peeked_replays_prefix() {
        let decoder = Decoder::new(input(b"world".to_vec()), None);
        let mut peeked = Peeked::new(b"hello ".to_vec(), decoder);
        let mut out = String::new();
        peeked.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }
}
