//! Bounded, encoding-aware accumulation of process output
//!
//! A [`StreamHandler`] is created for exactly one stream of one execution.
//! Raw chunks pass through a persistent decoder, so a multi-byte sequence that
//! is split across two reads still decodes to the right character. Overflow
//! and disposal are terminal: after either, the handler holds nothing and
//! rejects every further write.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default limit for a single stream
pub const DEFAULT_MAX_BUFFER: usize = 10 * 1024 * 1024;

/// Text encoding used to decode output bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// UTF-8; invalid sequences become U+FFFD
    #[default]
    Utf8,
    /// ISO-8859-1, every byte maps to one char
    Latin1,
}

/// Failures reported by a stream handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Accumulated output would have exceeded the configured limit
    #[error("output exceeded the {limit} byte buffer limit")]
    BufferExceeded {
        /// The configured limit in bytes
        limit: usize,
    },
    /// The handler was disposed
    #[error("stream has been disposed")]
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Overflowed,
    Disposed,
}

/// Streaming decoder that carries incomplete sequences across chunks
#[derive(Debug, Default)]
struct Decoder {
    encoding: Encoding,
    pending: Vec<u8>,
}

impl Decoder {
    fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
        }
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        match self.encoding {
            Encoding::Latin1 => chunk.iter().map(|&b| b as char).collect(),
            Encoding::Utf8 => {
                let mut bytes = std::mem::take(&mut self.pending);
                bytes.extend_from_slice(chunk);

                let mut out = String::with_capacity(bytes.len());
                let mut input = bytes.as_slice();
                loop {
                    match std::str::from_utf8(input) {
                        Ok(text) => {
                            out.push_str(text);
                            break;
                        }
                        Err(e) => {
                            let (valid, rest) = input.split_at(e.valid_up_to());
                            out.push_str(&String::from_utf8_lossy(valid));
                            match e.error_len() {
                                Some(len) => {
                                    out.push(char::REPLACEMENT_CHARACTER);
                                    input = &rest[len..];
                                }
                                None => {
                                    // incomplete sequence at the end, wait for more bytes
                                    self.pending = rest.to_vec();
                                    break;
                                }
                            }
                        }
                    }
                }
                out
            }
        }
    }

    fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
    }
}

type DataObserver = Box<dyn FnMut(&str) + Send>;
type ErrorObserver = Box<dyn FnMut(&StreamError) + Send>;

/// Accumulator for one output stream of one execution
pub struct StreamHandler {
    state: State,
    max_buffer: usize,
    buffer: Vec<u8>,
    content: String,
    decoder: Decoder,
    on_data: Option<DataObserver>,
    on_error: Option<ErrorObserver>,
}

impl StreamHandler {
    /// Create a handler that holds at most `max_buffer` bytes
    pub fn new(max_buffer: usize, encoding: Encoding) -> Self {
        Self {
            state: State::Open,
            max_buffer,
            buffer: Vec::new(),
            content: String::new(),
            decoder: Decoder::new(encoding),
            on_data: None,
            on_error: None,
        }
    }

    /// Observe every decoded chunk as it is written
    pub fn on_data(mut self, observer: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_data = Some(Box::new(observer));
        self
    }

    /// Observe the error that fails the stream
    pub fn on_error(mut self, observer: impl FnMut(&StreamError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(observer));
        self
    }

    /// Append a raw chunk, returning its decoded text
    pub fn write(&mut self, chunk: &[u8]) -> Result<String, StreamError> {
        match self.state {
            State::Disposed => return Err(StreamError::Disposed),
            State::Overflowed => {
                return Err(StreamError::BufferExceeded {
                    limit: self.max_buffer,
                });
            }
            State::Open => {}
        }

        if self.buffer.len() + chunk.len() > self.max_buffer {
            let err = StreamError::BufferExceeded {
                limit: self.max_buffer,
            };
            self.clear();
            self.state = State::Overflowed;
            if let Some(observer) = self.on_error.as_mut() {
                observer(&err);
            }
            return Err(err);
        }

        self.buffer.extend_from_slice(chunk);
        let text = self.decoder.decode(chunk);
        self.emit(&text);
        Ok(text)
    }

    /// Flush an incomplete trailing sequence at end of stream
    pub fn flush(&mut self) -> Result<String, StreamError> {
        match self.state {
            State::Disposed => Err(StreamError::Disposed),
            State::Overflowed => Err(StreamError::BufferExceeded {
                limit: self.max_buffer,
            }),
            State::Open => {
                let text = self.decoder.finish();
                self.emit(&text);
                Ok(text)
            }
        }
    }

    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.content.push_str(text);
        if let Some(observer) = self.on_data.as_mut() {
            observer(text);
        }
    }

    /// Decoded content accumulated so far
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Raw bytes accumulated so far
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of raw bytes held
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if no bytes are held
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns true once the buffer limit was exceeded
    pub fn is_overflowed(&self) -> bool {
        self.state == State::Overflowed
    }

    /// Returns true once the handler was disposed
    pub fn is_disposed(&self) -> bool {
        self.state == State::Disposed
    }

    /// Drop the current segment but keep accepting writes
    ///
    /// Has no effect once the handler is overflowed or disposed.
    pub fn reset(&mut self) {
        if self.state == State::Open {
            self.clear();
        }
    }

    /// Move the decoded content out, leaving the handler empty
    pub fn take_content(&mut self) -> String {
        self.buffer.clear();
        std::mem::take(&mut self.content)
    }

    /// Release everything; all later writes fail with [`StreamError::Disposed`]
    pub fn dispose(&mut self) {
        if self.state == State::Disposed {
            return;
        }
        self.clear();
        self.state = State::Disposed;
        self.on_data = None;
        self.on_error = None;
    }

    fn clear(&mut self) {
        self.buffer = Vec::new();
        self.content = String::new();
        self.decoder.reset();
    }
}

impl fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandler")
            .field("state", &self.state)
            .field("max_buffer", &self.max_buffer)
            .field("len", &self.buffer.len())
            .finish()
    }
}
