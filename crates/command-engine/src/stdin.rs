//! Stdin sources and forwarding into a child process
//!
//! Stdin is written on its own future, concurrently with output draining, so
//! a command that interleaves reading and writing never deadlocks against a
//! full pipe. Writes await the pipe, which is the backpressure signal.

use futures::io::{AsyncRead, AsyncWriteExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// Input fed to a command's stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stdin {
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// A byte stream, consumed by the first execution that uses it
    #[serde(skip)]
    Stream(StdinStream),
}

impl Stdin {
    /// Wrap an async reader as a stdin source
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Stdin::Stream(StdinStream::new(reader))
    }

    /// Returns true if this source can be replayed for a retry
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Stdin::Stream(_))
    }

    /// Resolve into something that can be written, taking the stream if any
    pub(crate) fn open(&self) -> Result<StdinSource> {
        match self {
            Stdin::Text(text) => Ok(StdinSource::Bytes(text.clone().into_bytes())),
            Stdin::Bytes(bytes) => Ok(StdinSource::Bytes(bytes.clone())),
            Stdin::Stream(stream) => stream.take().map(StdinSource::Reader).ok_or_else(|| {
                Error::configuration("stdin stream was already consumed by an earlier execution")
            }),
        }
    }
}

impl From<&str> for Stdin {
    fn from(text: &str) -> Self {
        Stdin::Text(text.to_string())
    }
}

impl From<String> for Stdin {
    fn from(text: String) -> Self {
        Stdin::Text(text)
    }
}

impl From<Vec<u8>> for Stdin {
    fn from(bytes: Vec<u8>) -> Self {
        Stdin::Bytes(bytes)
    }
}

/// Shared, take-once handle to an async reader
#[derive(Clone)]
pub struct StdinStream {
    reader: Arc<Mutex<Option<Reader>>>,
}

impl StdinStream {
    /// Create a new stream handle
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
        }
    }

    /// Returns true once an execution has taken the reader
    pub fn is_consumed(&self) -> bool {
        self.reader.lock().map(|r| r.is_none()).unwrap_or(true)
    }

    fn take(&self) -> Option<Reader> {
        self.reader.lock().ok().and_then(|mut r| r.take())
    }
}

impl fmt::Debug for StdinStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdinStream")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Stdin resolved for one execution
pub(crate) enum StdinSource {
    Bytes(Vec<u8>),
    Reader(Reader),
}

/// Write the whole source to `pipe` and close it
///
/// A process that exits without reading all of its input is not an error.
pub(crate) async fn forward<W>(mut pipe: W, source: StdinSource) -> io::Result<()>
where
    W: futures::io::AsyncWrite + Unpin,
{
    let written = match source {
        StdinSource::Bytes(bytes) => pipe.write_all(&bytes).await,
        StdinSource::Reader(mut reader) => futures::io::copy(&mut reader, &mut pipe).await.map(|_| ()),
    };
    let closed = pipe.close().await;

    match written.and(closed) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_is_taken_once() {
        let stdin = Stdin::stream(futures::io::Cursor::new(b"data".to_vec()));
        assert!(!stdin.is_replayable());
        assert!(stdin.open().is_ok());

        let err = stdin.clone().open().err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_deserialize_untagged() {
        let text: Stdin = serde_json::from_str("\"hello\"").unwrap();
        assert!(matches!(text, Stdin::Text(ref t) if t == "hello"));

        let bytes: Stdin = serde_json::from_str("[1, 2, 255]").unwrap();
        assert!(matches!(bytes, Stdin::Bytes(ref b) if b == &[1, 2, 255]));
    }

    #[smol_potat::test]
    async fn test_forward_copies_reader() {
        let mut sink = futures::io::Cursor::new(Vec::new());
        let source = Stdin::stream(futures::io::Cursor::new(b"line 1\nline 2\n".to_vec()))
            .open()
            .unwrap();
        forward(&mut sink, source).await.unwrap();
        assert_eq!(sink.into_inner(), b"line 1\nline 2\n");
    }
}
