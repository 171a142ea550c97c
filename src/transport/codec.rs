//! Record codec for line-framed channels.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum record length so a
//! peer that never sends a newline cannot make us allocate without bound.
//! Every channel kind carries the same unit of delivery: one `\n`-terminated
//! UTF-8 record (a trailing `\r` is stripped).
//!
//! [`RecordAssembler`] drives the codec over arbitrary chunks, which is how
//! WebSocket frames that split or merge records are reassembled.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum record length accepted on the inbound side: 16 MiB.
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Newline-delimited record codec with a fixed [`MAX_RECORD_BYTES`] limit.
///
/// Inbound records longer than the limit return
/// [`AppError::Transport`]`("record too long: …")`. The codec discards the
/// offending bytes and resynchronises on the next newline, so callers may
/// log the error and keep decoding.
#[derive(Debug)]
pub struct RecordCodec(LinesCodec);

impl RecordCodec {
    /// Create a new codec with the default [`MAX_RECORD_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_RECORD_BYTES))
    }

    /// Create a codec with a custom limit.
    #[must_use]
    pub fn with_max_length(max: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max))
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RecordCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for RecordCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

/// Reassembles complete records from chunks that ignore record boundaries.
///
/// A chunk may hold part of a record, several records, or both; any trailing
/// partial record is retained until the chunk that completes it arrives.
#[derive(Debug, Default)]
pub struct RecordAssembler {
    codec: RecordCodec,
    buffer: BytesMut,
}

impl RecordAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every record it completes, in order.
    ///
    /// Over-long records are reported in the second vector and skipped.
    pub fn push(&mut self, chunk: &[u8]) -> (Vec<String>, Vec<AppError>) {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();
        let mut errors = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(err) => errors.push(err),
            }
        }
        (records, errors)
    }

    /// Flush the final unterminated record at end of stream, if any.
    pub fn finish(&mut self) -> Option<String> {
        match self.codec.decode_eof(&mut self.buffer) {
            Ok(record) => record.filter(|r| !r.is_empty()),
            Err(_) => None,
        }
    }

    /// Bytes held back waiting for a record terminator.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Terminate `record` with `\n` unless it already is.
#[must_use]
pub fn frame_record(record: &str) -> Bytes {
    if record.ends_with('\n') {
        Bytes::copy_from_slice(record.as_bytes())
    } else {
        let mut framed = String::with_capacity(record.len() + 1);
        framed.push_str(record);
        framed.push('\n');
        Bytes::from(framed)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Transport("record too long: exceeded maximum record length".into())
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
