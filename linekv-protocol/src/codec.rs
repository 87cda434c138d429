//! Encoder and incremental decoder for the line-framed wire format.
//!
//! On the wire a frame is a sequence of parts, each `<decimal-len>\n<bytes>\n`,
//! closed by one blank line. Length lines tolerate a trailing `\r`. When
//! request compression is on, the frame is the three-part envelope
//! `"3"` / `"zip"` / `base64(gzip(inner parts))`, where the inner byte
//! stream uses the same part framing but no blank-line terminator.

use crate::arg::Arg;
use crate::error::ProtocolError;
use crate::ZIP_TOKEN;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Encodes argument vectors into wire frames.
pub struct Encoder;

impl Encoder {
    /// Encodes `args` into a transmit-ready frame.
    pub fn encode(args: &[Arg], compressed: bool) -> Result<BytesMut, ProtocolError> {
        if compressed {
            Self::encode_compressed(args)
        } else {
            let mut buf = BytesMut::with_capacity(64).writer();
            for arg in args {
                write_arg(&mut buf, arg)?;
            }
            buf.write_all(b"\n")?;
            Ok(buf.into_inner())
        }
    }

    // Envelope: parts "3" and "zip", then the gzipped inner frame as one
    // base64 part. The inner stream carries no blank-line terminator; the
    // gzip boundary marks its end.
    fn encode_compressed(args: &[Arg]) -> Result<BytesMut, ProtocolError> {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        for arg in args {
            write_arg(&mut gz, arg)?;
        }
        let packed = BASE64.encode(gz.finish()?);

        let mut buf = BytesMut::with_capacity(packed.len() + 16).writer();
        write_part(&mut buf, b"3")?;
        write_part(&mut buf, ZIP_TOKEN.as_bytes())?;
        write_part(&mut buf, packed.as_bytes())?;
        buf.write_all(b"\n")?;
        Ok(buf.into_inner())
    }
}

fn write_part<W: Write>(w: &mut W, part: &[u8]) -> Result<(), ProtocolError> {
    write!(w, "{}\n", part.len())?;
    w.write_all(part)?;
    w.write_all(b"\n")?;
    Ok(())
}

fn write_arg<W: Write>(w: &mut W, arg: &Arg) -> Result<(), ProtocolError> {
    match arg {
        Arg::Str(s) => write_part(w, s.as_bytes()),
        Arg::Bytes(b) => write_part(w, b),
        Arg::List(items) => {
            for item in items {
                write_part(w, item.as_bytes())?;
            }
            Ok(())
        }
        Arg::Int(v) => write_part(w, v.to_string().as_bytes()),
        Arg::Float(v) => {
            if !v.is_finite() {
                return Err(ProtocolError::Encode(format!("non-finite float {v}")));
            }
            write_part(w, format!("{v:.6}").as_bytes())
        }
        Arg::Bool(v) => write_part(w, if *v { b"1" } else { b"0" }),
        Arg::Null => write_part(w, b""),
    }
}

/// Incremental frame parser.
///
/// Feed bytes with [`extend`](Decoder::extend) as they arrive and call
/// [`decode_frame`](Decoder::decode_frame) after each read. Partial input
/// never emits a frame and never consumes from the buffer, so the parser
/// is restartable across any split of the byte stream.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends received bytes to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Attempts to decode the next frame.
    ///
    /// Returns `Ok(Some(parts))` for a complete frame, `Ok(None)` when more
    /// bytes are needed, or an error on malformed framing. Compressed
    /// frames are inflated before being returned.
    pub fn decode_frame(&mut self) -> Result<Option<Vec<String>>, ProtocolError> {
        let mut offset = 0;
        let mut parts: Vec<String> = Vec::new();
        loop {
            let rest = &self.buffer[offset..];
            let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let mut line = &rest[..nl];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let after_line = offset + nl + 1;

            if line.is_empty() {
                // A blank line before any part is noise; after parts it
                // terminates the frame.
                if parts.is_empty() {
                    offset = after_line;
                    continue;
                }
                self.buffer.advance(after_line);
                return inflate_if_compressed(parts).map(Some);
            }

            let size = parse_len(line)?;
            if self.buffer.len() < after_line + size + 1 {
                return Ok(None);
            }
            let payload = &self.buffer[after_line..after_line + size];
            parts.push(
                String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?,
            );
            offset = after_line + size + 1;
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_len(line: &[u8]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
    match text.parse::<i64>() {
        Ok(v) if v >= 0 => Ok(v as usize),
        _ => Err(ProtocolError::Length(text.to_string())),
    }
}

// Two compressed shapes exist: responses lead with "zip", while an encoded
// request carries the full "3"/"zip"/payload envelope. Recognizing both
// keeps encode-then-parse closed under compression.
fn inflate_if_compressed(parts: Vec<String>) -> Result<Vec<String>, ProtocolError> {
    match parts.first().map(String::as_str) {
        Some(ZIP_TOKEN) => {
            let payload = parts.get(1).ok_or(ProtocolError::MissingPayload)?;
            inflate(payload)
        }
        Some("3") if parts.len() == 3 && parts[1] == ZIP_TOKEN => inflate(&parts[2]),
        _ => Ok(parts),
    }
}

fn inflate(payload: &str) -> Result<Vec<String>, ProtocolError> {
    let raw = BASE64.decode(payload)?;
    let mut inner = Vec::new();
    GzDecoder::new(raw.as_slice()).read_to_end(&mut inner)?;
    parse_inner(&inner)
}

// Inner parser: identical part framing, terminated by the end of the
// gzip stream instead of a blank line.
fn parse_inner(data: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let mut parts = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            return Err(ProtocolError::Truncated);
        };
        let mut line = &rest[..nl];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        offset += nl + 1;
        if line.is_empty() {
            continue;
        }
        let size = parse_len(line)?;
        if data.len() < offset + size {
            return Err(ProtocolError::Truncated);
        }
        let payload = &data[offset..offset + size];
        parts.push(String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?);
        offset += size + 1;
    }
    Ok(parts)
}
