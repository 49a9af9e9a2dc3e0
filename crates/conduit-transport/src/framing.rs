//! Framing codec for JSON-RPC over a byte stream.
//!
//! Two wire formats are in use by MCP clients:
//!
//! - `Content-Length: <N>\r\n\r\n<N bytes of JSON>` (LSP style)
//! - one JSON value per `\n`-terminated line (NDJSON)
//!
//! Clients never announce which one they speak, so the decoder infers the
//! format from the first bytes it sees and keeps it for the rest of the
//! stream. The encoder mirrors whatever the decoder detected.

use bytes::{Buf, BytesMut};
use conduit_types::{FramingError, JsonRpcMessage};

const CONTENT_LENGTH_TOKEN: &str = "Content-Length:";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// The framing convention of one stream.
///
/// Starts as `Undetected` and transitions exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    #[default]
    Undetected,
    ContentLength,
    Newline,
}

/// A parsed Content-Length header whose body has not fully arrived.
#[derive(Debug, Clone, Copy)]
struct PendingBody {
    body_start: usize,
    length: usize,
}

/// Incremental decoder that turns raw bytes into JSON-RPC messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    mode: FramingMode,
    pending: Option<PendingBody>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The detected framing mode (or `Undetected` if no decision yet).
    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Number of bytes received but not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered bytes. The detected mode is kept.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending = None;
    }

    /// Feed a chunk of bytes and return every message completed by it, in
    /// stream order. Malformed frames come back as `Err` entries and do not
    /// stop decoding of the frames after them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<JsonRpcMessage, FramingError>> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        if self.mode == FramingMode::Undetected {
            match detect_mode(&self.buffer) {
                Some(mode) => {
                    tracing::debug!(?mode, "Detected framing mode");
                    self.mode = mode;
                }
                None => return out,
            }
        }

        match self.mode {
            FramingMode::ContentLength => self.drain_content_length(&mut out),
            FramingMode::Newline => self.drain_lines(&mut out),
            FramingMode::Undetected => {}
        }

        out
    }

    fn drain_content_length(&mut self, out: &mut Vec<Result<JsonRpcMessage, FramingError>>) {
        loop {
            let pending = match self.pending.take() {
                Some(pending) => pending,
                None => match self.next_header() {
                    Some(Ok(pending)) => pending,
                    Some(Err(e)) => {
                        out.push(Err(e));
                        continue;
                    }
                    None => break,
                },
            };

            // `next_header` guarantees this sum does not overflow.
            if self.buffer.len() < pending.body_start + pending.length {
                self.pending = Some(pending);
                break;
            }

            self.buffer.advance(pending.body_start);
            let body = self.buffer.split_to(pending.length);
            out.push(decode_message(&body));
        }
    }

    /// Parse the next header block. Blank blocks are skipped and bad ones
    /// are consumed and reported. `None` means more bytes are needed.
    fn next_header(&mut self) -> Option<Result<PendingBody, FramingError>> {
        loop {
            let (header_end, delimiter_len) = find_header_end(&self.buffer)?;
            let body_start = header_end + delimiter_len;
            let header = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();

            if header.trim().trim_start_matches('\u{feff}').is_empty() {
                // Stray blank lines between frames.
                self.buffer.advance(body_start);
                continue;
            }

            let length = parse_content_length(&header)
                .filter(|length| body_start.checked_add(*length).is_some());
            let Some(length) = length else {
                self.buffer.advance(body_start);
                return Some(Err(FramingError::MissingContentLength {
                    header: header.trim().to_string(),
                }));
            };
            return Some(Ok(PendingBody { body_start, length }));
        }
    }

    fn drain_lines(&mut self, out: &mut Vec<Result<JsonRpcMessage, FramingError>>) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let text = &line[..pos];
            let text = text.strip_prefix(UTF8_BOM).unwrap_or(text).trim_ascii();
            if text.is_empty() {
                continue;
            }
            out.push(decode_message(text));
        }
    }
}

/// Encode a message for the wire in the given mode.
///
/// `Undetected` encodes as `ContentLength`, the more common client convention.
pub fn encode(mode: FramingMode, message: &JsonRpcMessage) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(message)?;
    match mode {
        FramingMode::Newline => {
            let mut frame = body;
            frame.push(b'\n');
            Ok(frame)
        }
        FramingMode::ContentLength | FramingMode::Undetected => {
            let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
            frame.extend_from_slice(&body);
            Ok(frame)
        }
    }
}

/// Decide the framing mode from the first buffered bytes, or `None` if more
/// bytes are needed.
fn detect_mode(buffer: &[u8]) -> Option<FramingMode> {
    let text = String::from_utf8_lossy(buffer);
    let text = text.trim_start_matches('\u{feff}').trim_start();

    if text.starts_with(CONTENT_LENGTH_TOKEN) {
        return Some(FramingMode::ContentLength);
    }

    let newline = text.find('\n')?;
    let first_line = text[..newline].trim_end_matches('\r').trim();
    if first_line.starts_with('{') || first_line.starts_with('[') {
        Some(FramingMode::Newline)
    } else {
        // Unknown header line; assume the richer framing.
        Some(FramingMode::ContentLength)
    }
}

/// Locate the end of the header block. Returns the header length and the
/// length of the delimiter that ended it (`\r\n\r\n` or the lenient `\n\n`).
///
/// Single pass: every delimiter ends in `\n` followed by `\n` or `\r\n`.
fn find_header_end(buffer: &[u8]) -> Option<(usize, usize)> {
    buffer
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'\n')
        .find_map(|(i, _)| {
            let rest = &buffer[i + 1..];
            if rest.starts_with(b"\n") {
                Some((i, 2))
            } else if rest.starts_with(b"\r\n") && i > 0 && buffer[i - 1] == b'\r' {
                Some((i - 1, 4))
            } else {
                None
            }
        })
}

fn parse_content_length(header: &str) -> Option<usize> {
    header.lines().find_map(|line| {
        let line = line.trim().trim_start_matches('\u{feff}');
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-length") {
            return None;
        }
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        value.parse().ok()
    })
}

fn decode_message(bytes: &[u8]) -> Result<JsonRpcMessage, FramingError> {
    serde_json::from_slice(bytes).map_err(|e| FramingError::InvalidJson {
        text: String::from_utf8_lossy(bytes).into_owned(),
        reason: e.to_string(),
    })
}
