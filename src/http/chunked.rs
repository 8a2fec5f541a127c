//! Chunked transfer encoding support.
//!
//! This module provides encoding and decoding for HTTP chunked transfer
//! encoding. The decoder is incremental so response bodies can be consumed
//! as they arrive from the socket.

use crate::error::{Error, Result};

/// The terminating zero-sized chunk.
pub const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Largest accepted chunk size line, counting hex digits and extensions.
const MAX_SIZE_LINE: usize = 1024;

/// Encode one body chunk as `SIZE_HEX CRLF DATA CRLF`.
///
/// Empty input returns an empty encoding so that a zero-length chunk never
/// terminates the stream early; callers emit [`FINAL_CHUNK`] explicitly.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// Incremental chunked transfer decoder.
///
/// The phase enum carries the bytes still owed by the current chunk, so
/// the decoder holds no counters of its own.
pub struct ChunkedDecoder {
    phase: Phase,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Expecting a `SIZE_HEX[;ext]\r\n` line
    SizeLine,
    /// Inside chunk data with this many payload bytes left
    Data { left: usize },
    /// Expecting the CRLF that closes a chunk's data
    DataCrlf,
    /// Past the zero chunk, skipping trailer lines until the blank one
    Trailers,
    Done,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            phase: Phase::SizeLine,
        }
    }

    /// Decode as much as possible from `input` into `output`.
    ///
    /// Returns `(bytes_consumed, bytes_decoded, is_complete)`. The caller
    /// keeps unconsumed input for the next call.
    pub fn decode(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize, bool)> {
        let mut pos = 0;
        let mut out = 0;

        loop {
            let rest = &input[pos..];
            match self.phase {
                Phase::SizeLine => {
                    let Some(line_end) = find_crlf(rest) else {
                        if rest.len() > MAX_SIZE_LINE {
                            return Err(Error::InvalidResponse(
                                "chunk size line too long".to_string(),
                            ));
                        }
                        break;
                    };
                    let size = parse_size_line(&rest[..line_end])?;
                    pos += line_end + 2;
                    self.phase = if size == 0 {
                        Phase::Trailers
                    } else {
                        Phase::Data { left: size }
                    };
                }

                Phase::Data { left } => {
                    let room = output.len() - out;
                    let take = left.min(rest.len()).min(room);
                    if take == 0 {
                        // Out of input or output space
                        break;
                    }
                    output[out..out + take].copy_from_slice(&rest[..take]);
                    pos += take;
                    out += take;
                    self.phase = if take == left {
                        Phase::DataCrlf
                    } else {
                        Phase::Data { left: left - take }
                    };
                }

                Phase::DataCrlf => {
                    if rest.len() < 2 {
                        break;
                    }
                    if !rest.starts_with(b"\r\n") {
                        return Err(Error::InvalidResponse(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    pos += 2;
                    self.phase = Phase::SizeLine;
                }

                Phase::Trailers => {
                    if rest.starts_with(b"\r\n") {
                        pos += 2;
                        self.phase = Phase::Done;
                        continue;
                    }
                    // A trailer header line, consumed and discarded
                    match find_crlf(rest) {
                        Some(line_end) if line_end > 0 => pos += line_end + 2,
                        _ => break,
                    }
                }

                Phase::Done => break,
            }
        }

        Ok((pos, out, self.is_complete()))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }
}

/// Parse the hex size from a chunk size line, ignoring any extensions.
fn parse_size_line(line: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::InvalidResponse("non-ASCII chunk size line".to_string()))?;
    let digits = match text.split_once(';') {
        Some((before, _ext)) => before,
        None => text,
    };
    usize::from_str_radix(digits.trim(), 16)
        .map_err(|_| Error::InvalidResponse(format!("invalid chunk size: {}", text.trim())))
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decode a complete chunked body held in memory.
pub fn decode_chunked_body(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ChunkedDecoder::new();
    let mut output = Vec::new();
    let mut input_pos = 0;

    while input_pos < input.len() {
        let mut temp = vec![0u8; 8192];
        let (consumed, decoded, complete) = decoder.decode(&input[input_pos..], &mut temp)?;

        output.extend_from_slice(&temp[..decoded]);
        input_pos += consumed;

        if complete {
            break;
        }
        if consumed == 0 && decoded == 0 {
            break;
        }
    }

    if !decoder.is_complete() {
        return Err(Error::InvalidResponse("truncated chunked body".to_string()));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single_chunk() {
        assert_eq!(encode_chunk(b"Hello"), b"5\r\nHello\r\n");
    }

    #[test]
    fn test_encode_empty_chunk_is_skipped() {
        assert_eq!(encode_chunk(b""), b"");
    }

    #[test]
    fn test_encode_hex_sizes() {
        let data = vec![0u8; 255];
        let encoded = encode_chunk(&data);
        assert!(encoded.starts_with(b"ff\r\n"));
    }

    #[test]
    fn test_decode_single_chunk() {
        let input = b"5\r\nHello\r\n0\r\n\r\n";
        assert_eq!(decode_chunked_body(input).unwrap(), b"Hello");
    }

    #[test]
    fn test_decode_multiple_chunks() {
        let input = b"5\r\nHello\r\n5\r\nWorld\r\n0\r\n\r\n";
        assert_eq!(decode_chunked_body(input).unwrap(), b"HelloWorld");
    }

    #[test]
    fn test_decode_with_extension() {
        let input = b"5;extension=value\r\nHello\r\n0\r\n\r\n";
        assert_eq!(decode_chunked_body(input).unwrap(), b"Hello");
    }

    #[test]
    fn test_decode_with_trailers() {
        let input = b"2\r\nok\r\n0\r\nX-Trailer: 1\r\nX-Other: 2\r\n\r\n";
        assert_eq!(decode_chunked_body(input).unwrap(), b"ok");
    }

    #[test]
    fn test_decode_rejects_garbage_size() {
        let input = b"zz\r\nHello\r\n0\r\n\r\n";
        assert!(matches!(
            decode_chunked_body(input),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_chunk_crlf() {
        let input = b"5\r\nHelloXX0\r\n\r\n";
        assert!(decode_chunked_body(input).is_err());
    }

    #[test]
    fn test_decode_truncated() {
        let input = b"5\r\nHel";
        assert!(decode_chunked_body(input).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let mut wire = Vec::new();
        for chunk in data.chunks(7) {
            wire.extend_from_slice(&encode_chunk(chunk));
        }
        wire.extend_from_slice(FINAL_CHUNK);

        assert_eq!(decode_chunked_body(&wire).unwrap(), data);
    }

    #[test]
    fn test_decoder_incremental() {
        let input = b"5\r\nHello\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut output = vec![0u8; 64];
        let mut decoded_total = 0;
        let mut consumed_total = 0;

        for &step in &[3usize, 4, 3, 2, 5] {
            if consumed_total >= input.len() {
                break;
            }
            let end = (consumed_total + step).min(input.len());
            let (consumed, decoded, complete) = decoder
                .decode(&input[consumed_total..end], &mut output[decoded_total..])
                .unwrap();
            consumed_total += consumed;
            decoded_total += decoded;
            if complete {
                break;
            }
        }

        assert_eq!(&output[..decoded_total], b"Hello");
        assert!(decoder.is_complete());
    }
}
