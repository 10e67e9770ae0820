//! One instance per physical transport connection: reads incoming frames
//! and fans payloads out to every local receiver subscribed to their
//! stream-id, and serializes outbound frames from every sender of this
//! client. Grounded in `jmux-proxy`'s scheduler/sender task split, with the
//! SSH-style channel open/close handshake and flow-control window dropped:
//! this wire format carries neither, just a bare id and payload.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use contd_proto::{Packet, PacketCodec, StreamId, MAX_PAYLOAD_LEN};
use contd_task::ChildTask;
use futures_util::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{Instrument as _, Span};

use crate::client::MultiplexClient;
use crate::error::MuxError;
use crate::pipe::pipe;
use crate::stream::{Stream, StreamerHandle};

static NEXT_MUX_ID: AtomicU64 = AtomicU64::new(0);

pub type MuxId = u64;

/// What the client keeps in its `muxes` map: just enough to route a
/// broadcast write or force a shutdown, never the mux's full state. Neither
/// this struct nor the reader/writer tasks it names hold an `Arc` back to
/// the other, so there's no reference cycle between a `Mux` and its client.
pub(crate) struct MuxHandle {
    pub(crate) outbound_tx: mpsc::UnboundedSender<Packet>,
    pub(crate) shutdown: Arc<Notify>,
}

/// A multiplexed transport connection. Dropping it tears it down the same
/// way an explicit `close()` would.
pub struct Mux {
    id: MuxId,
    client: MultiplexClient,
    outbound_tx: mpsc::UnboundedSender<Packet>,
    shutdown: Arc<Notify>,
    owned_streams: Arc<Mutex<HashSet<(StreamId, u64)>>>,
    _reader_task: ChildTask<()>,
    _writer_task: ChildTask<()>,
}

impl Mux {
    pub(crate) fn spawn<R, W>(client: MultiplexClient, reader: R, writer: W, on_close: Option<Box<dyn FnOnce() + Send>>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_MUX_ID.fetch_add(1, Ordering::Relaxed);
        let owned_streams = Arc::new(Mutex::new(HashSet::new()));
        let shutdown = Arc::new(Notify::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Packet>();

        let span = info_span!("mux", mux_id = id);

        client.register_mux(
            id,
            MuxHandle {
                outbound_tx: outbound_tx.clone(),
                shutdown: Arc::clone(&shutdown),
            },
        );

        let writer_task = ChildTask::spawn(
            WriterTask {
                sink: FramedWrite::new(writer, PacketCodec::default()),
                outbound_rx,
            }
            .run()
            .instrument(span.clone()),
        );

        let reader_task = ChildTask::spawn(
            ReaderTask {
                id,
                client: client.clone(),
                source: FramedRead::new(reader, PacketCodec::default()),
                owned_streams: Arc::clone(&owned_streams),
                shutdown: Arc::clone(&shutdown),
                on_close,
            }
            .run()
            .instrument(span),
        );

        Self {
            id,
            client,
            outbound_tx,
            shutdown,
            owned_streams,
            _reader_task: reader_task,
            _writer_task: writer_task,
        }
    }

    pub fn id(&self) -> MuxId {
        self.id
    }

    /// Creates a stream addressed by `id`, owned by this mux: closing the
    /// mux tears it down, and writes on it go out over this mux's transport
    /// only (never broadcast, unlike a plain `Sender`).
    pub fn new_stream(&self, id: StreamId) -> Stream {
        let (writer, reader) = pipe();
        let uid = self.client.allocate_uid();
        self.client.register_receiver(id.clone(), uid, StreamerHandle::Stream(writer));
        self.owned_streams.lock().insert((id.clone(), uid));
        Stream::new_with_uid(id, self.client.clone(), reader, self.outbound_tx.clone(), uid)
    }

    /// Queues a write that goes out exclusively over this mux's transport.
    pub fn write(&self, id: &StreamId, data: Bytes) -> Result<(), MuxError> {
        self.outbound_tx
            .send(Packet::new(id.as_str(), data))
            .map_err(|_| MuxError::Closed)
    }

    /// Idempotent: removes this mux from the client, closes every stream it
    /// owns, and stops its reader/writer tasks.
    pub fn close(&self) {
        self.shutdown.notify_waiters();
        if self.client.unregister_mux(self.id).is_some() {
            for (id, uid) in self.owned_streams.lock().drain() {
                self.client.remove_receiver_uid(&id, uid);
            }
        }
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.close();
    }
}

struct WriterTask<W> {
    sink: FramedWrite<W, PacketCodec>,
    outbound_rx: mpsc::UnboundedReceiver<Packet>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> WriterTask<W> {
    #[instrument(name = "writer", skip_all)]
    async fn run(mut self) {
        while let Some(packet) = self.outbound_rx.recv().await {
            if let Err(error) = self.write_chunked(packet).await {
                debug!(%error, "mux writer stopping after transport error");
                break;
            }
        }
    }

    /// Splits payloads larger than the maximum transport frame into
    /// multiple same-id packets; the single task draining `outbound_rx`
    /// already serializes writes, so chunks from two different senders can
    /// never interleave mid-payload.
    async fn write_chunked(&mut self, packet: Packet) -> Result<(), contd_proto::FrameError> {
        if packet.data.len() <= MAX_PAYLOAD_LEN {
            return self.write_one(packet).await;
        }

        let Packet { id, data } = packet;
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MAX_PAYLOAD_LEN).min(data.len());
            self.write_one(Packet::new(id.clone(), data.slice(offset..end))).await?;
            offset = end;
        }
        Ok(())
    }

    async fn write_one(&mut self, packet: Packet) -> Result<(), contd_proto::FrameError> {
        self.sink.feed(packet).await?;
        self.sink.flush().await
    }
}

struct ReaderTask<R> {
    id: MuxId,
    client: MultiplexClient,
    source: FramedRead<R, PacketCodec>,
    owned_streams: Arc<Mutex<HashSet<(StreamId, u64)>>>,
    shutdown: Arc<Notify>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl<R: AsyncRead + Unpin + Send + 'static> ReaderTask<R> {
    #[instrument(name = "reader", skip_all)]
    async fn run(mut self) {
        const MAX_CONSECUTIVE_MALFORMED_FRAMES: u8 = 3;
        let mut consecutive_malformed = 0u8;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("mux closed by owner");
                    break;
                }
                frame = self.source.next() => {
                    match frame {
                        None => {
                            debug!("transport closed by peer");
                            break;
                        }
                        Some(Ok(packet)) => {
                            consecutive_malformed = 0;
                            self.client.fan_out(&StreamId::from(packet.id), packet.data);
                        }
                        Some(Err(error)) => {
                            consecutive_malformed += 1;
                            warn!(%error, consecutive_malformed, "malformed frame, skipping");
                            if consecutive_malformed >= MAX_CONSECUTIVE_MALFORMED_FRAMES {
                                warn!("closing mux after repeated malformed frames");
                                break;
                            }
                        }
                    }
                }
            }
        }

        if self.client.unregister_mux(self.id).is_some() {
            for (id, uid) in self.owned_streams.lock().drain() {
                self.client.remove_receiver_uid(&id, uid);
            }
        }

        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}
