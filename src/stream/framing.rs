//! Incremental re-framing of the subscription body.
//!
//! Chunks arrive at arbitrary byte boundaries. [`FrameDecoder`] decodes them
//! as UTF-8 text (carrying incomplete sequences over to the next chunk),
//! accumulates the text and cuts a frame at every blank line (`\n\n`).
//! Frames that start with the `data:` marker carry one JSON notification.

use thiserror::Error;

use crate::stream::proto::NotificationMessage;

/// Marker that prefixes frames carrying a notification payload.
pub const DATA_MARKER: &str = "data:";
/// Separator between frames.
pub const FRAME_DELIMITER: &str = "\n\n";
/// Most bytes held back waiting for a delimiter before the stream is
/// considered broken.
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Error decoding the payload of a `data:` frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed notification json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no frame delimiter within {limit} bytes")]
    Oversized { limit: usize },
}

/// Stateful chunk-to-frame decoder owned by one read loop.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: String,
    partial: Vec<u8>,
    max_pending: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that gives up once `max_pending` bytes sit undelimited.
    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            buffer: String::new(),
            partial: Vec::new(),
            max_pending,
        }
    }

    /// Appends a chunk and returns every frame completed by it, in order.
    ///
    /// Returned frames do not include the trailing delimiter. Fails with
    /// [`FrameError::Oversized`] when the unterminated tail outgrows the
    /// limit; the decoder should then be discarded with its connection.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, FrameError> {
        self.decode_text(chunk);

        let mut frames = Vec::new();
        while let Some(position) = self.buffer.find(FRAME_DELIMITER) {
            frames.push(self.buffer[..position].to_string());
            self.buffer.drain(..position + FRAME_DELIMITER.len());
        }

        if self.buffered_len() > self.max_pending {
            return Err(FrameError::Oversized {
                limit: self.max_pending,
            });
        }
        Ok(frames)
    }

    fn buffered_len(&self) -> usize {
        self.buffer.len() + self.partial.len()
    }

    fn decode_text(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.partial);
        bytes.extend_from_slice(chunk);

        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    self.buffer.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        // Sequence cut by the chunk boundary.
                        None => {
                            self.partial = after.to_vec();
                            return;
                        }
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                    }
                }
            }
        }
    }
}

/// Returns the payload of a `data:` frame, or `None` for any other frame.
pub fn data_payload(frame: &str) -> Option<&str> {
    let rest = frame.strip_prefix(DATA_MARKER)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Decodes a frame into a notification.
///
/// `None` means the frame is not a data frame and should be dropped.
pub fn decode_frame(frame: &str) -> Option<Result<NotificationMessage, FrameError>> {
    let payload = data_payload(frame)?;
    Some(NotificationMessage::from_text(payload).map_err(FrameError::from))
}
