//! Receiver, Sender, and Stream: the three stream-facing endpoints a client
//! hands out. They share one capability towards a mux's inbound loop: feed
//! it bytes, let it be closed. Implemented as a tagged handle rather than a
//! trait object, since the set of variants is closed.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use contd_proto::{Packet, StreamId};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::client::MultiplexClient;
use crate::error::MuxError;
use crate::pipe::{PipeReader, PipeWriter};

#[derive(Clone)]
pub(crate) enum StreamerHandle {
    Receiver(PipeWriter),
    Stream(PipeWriter),
}

impl StreamerHandle {
    fn pipe(&self) -> &PipeWriter {
        match self {
            StreamerHandle::Receiver(p) | StreamerHandle::Stream(p) => p,
        }
    }

    pub(crate) fn feed(&self, data: Bytes) -> bool {
        self.pipe().write(data).is_ok()
    }

    pub(crate) fn close(&self) {
        self.pipe().close();
    }
}

/// Read-only endpoint: bytes arriving on `id` from any mux's inbound loop,
/// fanned out to every receiver registered under that id. Dropping or
/// closing it removes it from the client's routing table.
pub struct Receiver {
    id: StreamId,
    client: MultiplexClient,
    reader: PipeReader,
    uid: u64,
    closed: bool,
}

impl Receiver {
    pub(crate) fn new_with_uid(id: StreamId, client: MultiplexClient, reader: PipeReader, uid: u64) -> Self {
        Self {
            id,
            client,
            reader,
            uid,
            closed: false,
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reader.shutdown();
        self.client.remove_receiver_uid(&self.id, self.uid);
    }
}

impl AsyncRead for Receiver {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.reader).poll_read(cx, buf)
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fan-out write-only endpoint: every write reaches every mux currently
/// owned by the client, recomputed per write rather than fixed at creation,
/// because the daemon doesn't know a container's eventual attachers up front.
#[derive(Clone)]
pub struct Sender {
    id: StreamId,
    client: MultiplexClient,
    uid: u64,
    closed: Arc<AtomicBool>,
}

impl Sender {
    pub(crate) fn new_with_uid(id: StreamId, client: MultiplexClient, uid: u64, closed: Arc<AtomicBool>) -> Self {
        Self { id, client, uid, closed }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Returns `Closed` once this sender has been closed; a slow or gone
    /// individual mux is not surfaced here — that mux simply stops getting
    /// the data and is torn down independently.
    pub fn write(&self, data: Bytes) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Closed);
        }
        self.client.broadcast(&self.id, data);
        Ok(())
    }

    /// Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.client.close_sender_uid(self.uid);
        }
    }
}

/// Full-duplex endpoint owned by exactly one mux: reads drain the pipe fed
/// by that mux's inbound loop, writes go out over that same mux only.
pub struct Stream {
    id: StreamId,
    client: MultiplexClient,
    reader: PipeReader,
    outbound_tx: mpsc::UnboundedSender<Packet>,
    uid: u64,
    closed: bool,
}

impl Stream {
    pub(crate) fn new_with_uid(
        id: StreamId,
        client: MultiplexClient,
        reader: PipeReader,
        outbound_tx: mpsc::UnboundedSender<Packet>,
        uid: u64,
    ) -> Self {
        Self {
            id,
            client,
            reader,
            outbound_tx,
            uid,
            closed: false,
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn write(&self, data: Bytes) -> Result<(), MuxError> {
        self.outbound_tx
            .send(Packet::new(self.id.as_str(), data))
            .map_err(|_| MuxError::Closed)
    }

    /// Closes the read side only (readers observe EOF); the owning mux's
    /// transport is left alone. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reader.shutdown();
        self.client.remove_receiver_uid(&self.id, self.uid);
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.reader).poll_read(cx, buf)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}
