//! Buffering adapter between a network fetch and a blocking decoder
//!
//! The fetch task appends chunks as they arrive; the decoder reads through
//! [`std::io::Read`] on a blocking thread. Finishing or failing the writer
//! ends the reader with EOF or an error respectively.

use std::io::{self, Read};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

enum Chunk {
    Data(Bytes),
    Failed(String),
}

/// Create a connected writer/reader pair
#[must_use]
pub fn stream_buffer() -> (StreamWriter, StreamReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamWriter { tx },
        StreamReader {
            rx,
            current: Bytes::new(),
            finished: false,
        },
    )
}

/// Producer half, owned by the fetch task
pub struct StreamWriter {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl StreamWriter {
    /// Append bytes; returns false once the reader is gone
    pub fn append(&self, bytes: Bytes) -> bool {
        if bytes.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(Chunk::Data(bytes)).is_ok()
    }

    /// Signal a clean end of stream
    pub fn finish(self) {
        drop(self);
    }

    /// End the stream with an error
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Chunk::Failed(reason.into()));
    }

    /// Whether the reader has been dropped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, read from a blocking thread
///
/// `read` blocks the calling thread and must not run on an async worker.
pub struct StreamReader {
    rx: mpsc::UnboundedReceiver<Chunk>,
    current: Bytes,
    finished: bool,
}

impl StreamReader {
    /// Stop accepting data; pending and future appends are discarded
    pub fn close(&mut self) {
        self.rx.close();
        self.current = Bytes::new();
        self.finished = true;
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while !self.current.has_remaining() {
            if self.finished {
                return Ok(0);
            }
            match self.rx.blocking_recv() {
                Some(Chunk::Data(bytes)) => self.current = bytes,
                Some(Chunk::Failed(reason)) => {
                    self.finished = true;
                    return Err(io::Error::other(reason));
                }
                None => {
                    self.finished = true;
                    return Ok(0);
                }
            }
        }

        let n = buf.len().min(self.current.remaining());
        self.current.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}
