//! Incremental decoder for `data: {json}` framed model streams.
//!
//! Bytes arrive in arbitrary chunks. Complete lines are decoded as soon as
//! their newline is seen; a trailing partial line (possibly ending inside a
//! multi-byte UTF-8 sequence) waits in the buffer for the next chunk. Lines
//! that cannot be decoded are logged and skipped.

use crate::error::{ChatError, DecodeWarning};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// Prefix marking an event line.
pub const DATA_PREFIX: &str = "data: ";

/// End-of-stream marker some upstreams send; skipped like any non-JSON line.
const DONE_MARKER: &str = "[DONE]";

/// Stream of content deltas for one turn.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// Stateful line splitter. One instance per response; not restartable.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    skipped: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of bytes and returns the deltas of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // Bytes already buffered hold no newline; only the new chunk is scanned.
        let mut scan_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut deltas = Vec::new();
        while let Some(offset) = self.pending[scan_from..].iter().position(|b| *b == b'\n') {
            let newline_pos = scan_from + offset;
            let line: Vec<u8> = self.pending.drain(..=newline_pos).collect();
            if let Some(delta) = self.process_line(&line[..line.len() - 1]) {
                deltas.push(delta);
            }
            scan_from = 0;
        }
        deltas
    }

    /// Processes whatever is left in the buffer once the byte stream has ended.
    pub fn finish(&mut self) -> Vec<String> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.pending);
        self.process_line(&line).into_iter().collect()
    }

    /// Number of lines skipped because they could not be decoded.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<String> {
        let line = match std::str::from_utf8(raw) {
            Ok(s) => s,
            Err(e) => {
                self.warn(DecodeWarning {
                    line: String::from_utf8_lossy(raw).into_owned(),
                    reason: format!("invalid UTF-8: {}", e),
                });
                return None;
            }
        };
        match decode_line(line) {
            Ok(delta) => delta,
            Err(warning) => {
                self.warn(warning);
                None
            }
        }
    }

    fn warn(&mut self, warning: DecodeWarning) {
        self.skipped += 1;
        log::warn!("{}", warning);
    }
}

/// Decodes a single line. `Ok(None)` means the line carries no delta;
/// `Err` means it looked like an event but its payload was unusable.
pub fn decode_line(line: &str) -> Result<Option<String>, DecodeWarning> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == DONE_MARKER {
        log::debug!("Stream sent {}, skipping.", DONE_MARKER);
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(payload).map_err(|e| DecodeWarning {
        line: line.to_string(),
        reason: e.to_string(),
    })?;

    // Plain `{ "content": ... }` events, or OpenAI-style chunks.
    let content = value
        .get("content")
        .and_then(|c| c.as_str())
        .or_else(|| value["choices"][0]["delta"]["content"].as_str());

    Ok(content.filter(|c| !c.is_empty()).map(str::to_string))
}

/// Turns a byte stream into a lazy stream of content deltas.
///
/// A read error from the byte stream is forwarded and ends the sequence;
/// malformed lines never do.
pub fn decode_stream<S>(byte_stream: S) -> DeltaStream
where
    S: Stream<Item = Result<Bytes, ChatError>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut decoder = StreamDecoder::new();
        let mut byte_stream = Box::pin(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for delta in decoder.push(&bytes) {
                        yield Ok(delta);
                    }
                }
                Err(ChatError::Cancelled) => {
                    log::info!("Model stream cancelled after {} skipped line(s).", decoder.skipped());
                    yield Err(ChatError::Cancelled);
                    return;
                }
                Err(e) => {
                    log::error!("Error reading model stream: {}", e);
                    yield Err(e);
                    return;
                }
            }
        }

        for delta in decoder.finish() {
            yield Ok(delta);
        }
        if decoder.skipped() > 0 {
            log::info!("Model stream ended; {} line(s) skipped.", decoder.skipped());
        }
    })
}
