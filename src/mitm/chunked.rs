//! Chunked transfer-coding decoder
//!
//! Tracks a `Transfer-Encoding: chunked` body as it streams past so the
//! relay knows where it ends. Bytes are not transformed; the relay forwards
//! them unchanged and only needs the end offset.
//!
//! One decoder follows one body. State survives across `feed` calls, so
//! size lines, chunk data, CRLFs and trailer lines may be split anywhere.

use super::error::{MitmError, Result};
use super::http_parser::{latin1, HeaderFields};
use bytes::BytesMut;
use std::collections::BTreeMap;

/// Longest accepted chunk-size line, extensions included
pub const MAX_CHUNK_SIZE_LINE: usize = 4 * 1024;

/// Largest accepted trailer section
pub const MAX_TRAILER_BYTES: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderMode {
    ReadingChunkSizeLine,
    ReadingChunkData,
    SkippingChunkTrailingCrlf,
    ReadingTrailerFields,
    Done,
}

/// Chunk extensions: `name[=value]`
pub type ChunkExtensions = BTreeMap<String, Option<String>>;

#[derive(Debug)]
pub struct ChunkedDecoder {
    mode: DecoderMode,
    /// Partial line (or partial CRLF) carried over from earlier windows
    line: BytesMut,
    /// Bytes left in the current chunk
    remaining: u64,
    trailer_bytes: usize,
    trailers: HeaderFields,
    extensions: ChunkExtensions,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            mode: DecoderMode::ReadingChunkSizeLine,
            line: BytesMut::new(),
            remaining: 0,
            trailer_bytes: 0,
            trailers: HeaderFields::new(),
            extensions: ChunkExtensions::new(),
        }
    }

    /// Consume the next window of the body
    ///
    /// Returns the offset in `window` just past the blank line that ends the
    /// body, or `None` when the end has not been reached yet. Once done, every
    /// further call consumes nothing and returns `Some(0)`.
    pub fn feed(&mut self, window: &[u8]) -> Result<Option<usize>> {
        let mut pos = 0;

        loop {
            match self.mode {
                DecoderMode::Done => return Ok(Some(pos)),

                DecoderMode::ReadingChunkData => {
                    let available = (window.len() - pos) as u64;
                    if available == 0 {
                        return Ok(None);
                    }
                    let take = available.min(self.remaining);
                    // take <= available, which came from a usize
                    pos += take as usize;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.mode = DecoderMode::SkippingChunkTrailingCrlf;
                    }
                }

                DecoderMode::SkippingChunkTrailingCrlf => {
                    let wanted = CRLF.len() - self.line.len();
                    let take = wanted.min(window.len() - pos);
                    self.line.extend_from_slice(&window[pos..pos + take]);
                    pos += take;

                    if self.line.len() < CRLF.len() {
                        return Ok(None);
                    }
                    if &self.line[..] != CRLF {
                        return Err(MitmError::protocol("chunk data not followed by CRLF"));
                    }
                    self.line.clear();
                    self.mode = DecoderMode::ReadingChunkSizeLine;
                }

                DecoderMode::ReadingChunkSizeLine => {
                    let Some(line) = self.next_line(window, &mut pos, MAX_CHUNK_SIZE_LINE)? else {
                        return Ok(None);
                    };
                    self.chunk_size_line(&line)?;
                }

                DecoderMode::ReadingTrailerFields => {
                    let limit = MAX_TRAILER_BYTES.saturating_sub(self.trailer_bytes);
                    let Some(line) = self.next_line(window, &mut pos, limit)? else {
                        return Ok(None);
                    };
                    self.trailer_bytes += line.len() + CRLF.len();
                    self.trailer_line(&line)?;
                }
            }
        }
    }

    pub fn mode(&self) -> DecoderMode {
        self.mode
    }

    pub fn is_done(&self) -> bool {
        self.mode == DecoderMode::Done
    }

    /// Trailer fields received after the last chunk
    pub fn trailers(&self) -> &HeaderFields {
        &self.trailers
    }

    /// Extensions of the most recent chunk-size line
    pub fn extensions(&self) -> &ChunkExtensions {
        &self.extensions
    }

    /// Take bytes up to the next CRLF, joining the carried-over partial line
    ///
    /// The returned line excludes the CRLF.
    fn next_line(&mut self, window: &[u8], pos: &mut usize, limit: usize) -> Result<Option<BytesMut>> {
        while *pos < window.len() {
            let rest = &window[*pos..];
            let (piece, found) = match rest.iter().position(|&b| b == b'\n') {
                Some(lf) => (&rest[..=lf], true),
                None => (rest, false),
            };
            self.line.extend_from_slice(piece);
            *pos += piece.len();

            if self.line.len() > limit + CRLF.len() {
                return Err(MitmError::protocol(format!(
                    "chunked framing line exceeds {} bytes",
                    limit
                )));
            }

            if found && self.line.ends_with(CRLF) {
                let mut line = self.line.split();
                line.truncate(line.len() - CRLF.len());
                return Ok(Some(line));
            }
        }

        Ok(None)
    }

    fn chunk_size_line(&mut self, line: &[u8]) -> Result<()> {
        let text = latin1(line);
        let (size_text, extensions) = match text.split_once(';') {
            Some((size, extensions)) => (size, Some(extensions)),
            None => (text.as_str(), None),
        };

        let size_text = size_text.trim();
        if size_text.is_empty() || !size_text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MitmError::protocol(format!(
                "invalid chunk size: {:?}",
                size_text
            )));
        }
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| MitmError::protocol(format!("chunk size out of range: {}", size_text)))?;

        self.extensions = extensions.map(parse_extensions).unwrap_or_default();

        if size == 0 {
            self.mode = DecoderMode::ReadingTrailerFields;
        } else {
            self.remaining = size;
            self.mode = DecoderMode::ReadingChunkData;
        }
        Ok(())
    }

    fn trailer_line(&mut self, line: &[u8]) -> Result<()> {
        if line.is_empty() {
            self.mode = DecoderMode::Done;
            return Ok(());
        }

        let text = latin1(line);
        match text.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                self.trailers.append(name.trim(), value.trim());
                Ok(())
            }
            _ => Err(MitmError::protocol(format!(
                "malformed trailer line: {:?}",
                text
            ))),
        }
    }
}

fn parse_extensions(text: &str) -> ChunkExtensions {
    text.split(';')
        .filter_map(|token| {
            let (name, value) = match token.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().to_string())),
                None => (token.trim(), None),
            };
            (!name.is_empty()).then(|| (name.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"4\r\nWiki\r\n0\r\n\r\n";

    #[test]
    fn test_single_window() {
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(decoder.feed(SIMPLE).unwrap(), Some(SIMPLE.len()));
        assert!(decoder.is_done());
    }

    #[test]
    fn test_end_offset_excludes_following_bytes() {
        let mut input = SIMPLE.to_vec();
        input.extend_from_slice(b"HTTP/1.1 200 OK\r\n");

        let mut decoder = ChunkedDecoder::new();
        assert_eq!(decoder.feed(&input).unwrap(), Some(SIMPLE.len()));
    }

    #[test]
    fn test_every_split_point() {
        let input: &[u8] = b"5;name=val\r\nhello\r\n1a\r\nabcdefghijklmnopqrstuvwxyz\r\n0\r\nX-Sum: 1\r\n\r\n";

        for split in 0..input.len() {
            let mut decoder = ChunkedDecoder::new();
            assert_eq!(decoder.feed(&input[..split]).unwrap(), None, "split at {}", split);
            assert_eq!(
                decoder.feed(&input[split..]).unwrap(),
                Some(input.len() - split),
                "split at {}",
                split
            );
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let mut decoder = ChunkedDecoder::new();
        let (last, rest) = SIMPLE.split_last().unwrap();
        for byte in rest {
            assert_eq!(decoder.feed(std::slice::from_ref(byte)).unwrap(), None);
        }
        assert_eq!(decoder.feed(std::slice::from_ref(last)).unwrap(), Some(1));
    }

    #[test]
    fn test_extension_ignored_for_framing() {
        let input = b"4;ext=1;flag\r\nWiki\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(decoder.feed(input).unwrap(), Some(input.len()));
    }

    #[test]
    fn test_extensions_parsed() {
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(decoder.feed(b"4; ext = 1 ;flag\r\n").unwrap(), None);
        assert_eq!(decoder.extensions().get("ext"), Some(&Some("1".to_string())));
        assert_eq!(decoder.extensions().get("flag"), Some(&None));
        assert_eq!(decoder.mode(), DecoderMode::ReadingChunkData);
    }

    #[test]
    fn test_invalid_size() {
        let mut decoder = ChunkedDecoder::new();
        let err = decoder.feed(b"zz\r\n").unwrap_err();
        assert!(matches!(err, MitmError::Protocol(_)));

        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.feed(b"\r\n").is_err());

        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.feed(b"ffffffffffffffffff\r\n").is_err());
    }

    #[test]
    fn test_uppercase_hex_and_padding() {
        let mut input = b"A \r\n".to_vec();
        input.extend_from_slice(&[b'x'; 10]);
        input.extend_from_slice(b"\r\n0\r\n\r\n");

        let mut decoder = ChunkedDecoder::new();
        assert_eq!(decoder.feed(&input).unwrap(), Some(input.len()));
    }

    #[test]
    fn test_missing_crlf_after_data() {
        let mut decoder = ChunkedDecoder::new();
        let err = decoder.feed(b"4\r\nWikiXX0\r\n\r\n").unwrap_err();
        assert!(matches!(err, MitmError::Protocol(_)));
    }

    #[test]
    fn test_trailers_collected() {
        let input = b"0\r\nExpires: never\r\nX-Check: abc\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(decoder.feed(input).unwrap(), Some(input.len()));

        let trailers: Vec<_> = decoder.trailers().iter().collect();
        assert_eq!(trailers, vec![("Expires", "never"), ("X-Check", "abc")]);
    }

    #[test]
    fn test_malformed_trailer() {
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.feed(b"0\r\nno colon here\r\n\r\n").is_err());
    }

    #[test]
    fn test_feed_after_done() {
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.feed(SIMPLE).unwrap().is_some());
        assert_eq!(decoder.feed(b"more").unwrap(), Some(0));
        assert_eq!(decoder.feed(b"").unwrap(), Some(0));
    }

    #[test]
    fn test_oversized_size_line() {
        let mut decoder = ChunkedDecoder::new();
        let mut line = b"1;".to_vec();
        line.extend(std::iter::repeat(b'a').take(MAX_CHUNK_SIZE_LINE + 8));
        assert!(decoder.feed(&line).is_err());
    }

    #[test]
    fn test_empty_window_needs_more() {
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(decoder.feed(b"").unwrap(), None);
    }
}
