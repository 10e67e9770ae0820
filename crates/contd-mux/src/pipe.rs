//! A single-producer/single-consumer byte pipe bridging a mux's inbound
//! dispatch with the consumer-facing `AsyncRead` side of a Receiver or
//! Stream. Unlike the blocking-channel original, reads suspend on `.await`
//! rather than parking an OS thread.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
#[error("pipe is closed")]
pub struct Closed;

enum Chunk {
    Data(Bytes),
    Eof,
}

#[derive(Clone)]
pub struct PipeWriter {
    tx: mpsc::UnboundedSender<Chunk>,
    closed: Arc<AtomicBool>,
}

pub struct PipeReader {
    rx: mpsc::UnboundedReceiver<Chunk>,
    front: BytesMut,
    eof: bool,
}

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PipeWriter {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        },
        PipeReader {
            rx,
            front: BytesMut::new(),
            eof: false,
        },
    )
}

impl PipeWriter {
    /// Fails with `Closed` once `close()` has been called or the reader was
    /// dropped. Never blocks: this just enqueues onto an unbounded channel,
    /// which is what lets a mux fan a packet out to many receivers without
    /// one slow consumer holding up the others.
    pub fn write(&self, data: Bytes) -> Result<(), Closed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Closed);
        }
        self.tx.send(Chunk::Data(data)).map_err(|_| Closed)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Chunk::Eof);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl PipeReader {
    /// Marks the pipe as ended from the reader's side: further reads return
    /// EOF immediately regardless of whether the writer ever called `close`.
    pub fn shutdown(&mut self) {
        self.eof = true;
        self.front.clear();
        self.rx.close();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        loop {
            if !self.front.is_empty() {
                let n = std::cmp::min(self.front.len(), buf.remaining());
                buf.put_slice(&self.front[..n]);
                self.front.advance(n);
                return Poll::Ready(Ok(()));
            }

            if self.eof {
                return Poll::Ready(Ok(()));
            }

            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Chunk::Data(bytes))) => {
                    self.front = BytesMut::from(&bytes[..]);
                    continue;
                }
                Poll::Ready(Some(Chunk::Eof)) | Poll::Ready(None) => {
                    self.eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    #[tokio::test]
    async fn reads_back_what_was_written() {
        let (writer, mut reader) = pipe();
        writer.write(Bytes::from_static(b"hello")).unwrap();
        writer.close();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let (writer, _reader) = pipe();
        writer.close();
        assert!(writer.write(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (writer, _reader) = pipe();
        writer.close();
        writer.close();
    }

    #[tokio::test]
    async fn dropping_reader_fails_subsequent_writes() {
        let (writer, reader) = pipe();
        drop(reader);
        assert!(writer.write(Bytes::from_static(b"x")).is_err());
    }
}
