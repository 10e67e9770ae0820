use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use contd_proto::StreamId;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::mux::{Mux, MuxHandle, MuxId};
use crate::pipe::pipe;
use crate::stream::{Receiver, Sender, StreamerHandle};

static NEXT_UID: AtomicU64 = AtomicU64::new(0);

fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

struct State {
    muxes: RwLock<HashMap<MuxId, MuxHandle>>,
    receivers: RwLock<HashMap<StreamId, HashMap<u64, StreamerHandle>>>,
    senders: RwLock<HashMap<u64, Arc<AtomicBool>>>,
}

/// Owns the set of transports (muxes) and the routing table mapping a
/// stream-id to the receivers subscribed to it. Cloning shares the
/// underlying state — it's a handle, not a new client, matching the way
/// `jmux-proxy`'s scheduler task is itself only ever reached through
/// cheaply-cloned channel endpoints rather than passed around by value.
#[derive(Clone)]
pub struct MultiplexClient {
    state: Arc<State>,
}

impl Default for MultiplexClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiplexClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                muxes: RwLock::new(HashMap::new()),
                receivers: RwLock::new(HashMap::new()),
                senders: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Wraps a bidirectional byte transport, starts its inbound reader and
    /// outbound writer tasks, and returns a handle to it.
    pub fn new_mux<R, W>(&self, reader: R, writer: W) -> Mux
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Mux::spawn(self.clone(), reader, writer, None)
    }

    /// Like [`Self::new_mux`], but runs `on_close` once the mux's reader
    /// task stops for any reason — peer disconnect, a transport error, or
    /// the returned [`Mux`] being dropped/explicitly closed. Lets a caller
    /// that tracks per-client state (e.g. the side-transport's connection
    /// and per-container streamer maps) clean it up without polling.
    pub fn new_mux_with_on_close<R, W>(&self, reader: R, writer: W, on_close: impl FnOnce() + Send + 'static) -> Mux
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Mux::spawn(self.clone(), reader, writer, Some(Box::new(on_close)))
    }

    /// Creates a Receiver, registering it in the routing table under `id`.
    pub fn new_receiver(&self, id: StreamId) -> Receiver {
        let (writer, reader) = pipe();
        let uid = next_uid();
        self.state
            .receivers
            .write()
            .entry(id.clone())
            .or_default()
            .insert(uid, StreamerHandle::Receiver(writer));
        Receiver::new_with_uid(id, self.clone(), reader, uid)
    }

    /// Creates a Sender broadcasting to every mux currently owned by this
    /// client; the broadcast set is recomputed on every write, not fixed now.
    pub fn new_sender(&self, id: StreamId) -> Sender {
        let uid = next_uid();
        let closed = Arc::new(AtomicBool::new(false));
        self.state.senders.write().insert(uid, Arc::clone(&closed));
        Sender::new_with_uid(id, self.clone(), uid, closed)
    }

    /// Closes every mux, every receiver, every sender owned by this client.
    pub fn close(&self) {
        for mux in self.state.muxes.write().drain() {
            mux.1.shutdown.notify_waiters();
        }
        for handles in self.state.receivers.write().drain() {
            for handle in handles.1.into_values() {
                handle.close();
            }
        }
        for closed in self.state.senders.write().drain() {
            closed.1.store(true, Ordering::Release);
        }
    }

    pub(crate) fn register_receiver(&self, id: StreamId, uid: u64, handle: StreamerHandle) {
        self.state.receivers.write().entry(id).or_default().insert(uid, handle);
    }

    pub(crate) fn remove_receiver_uid(&self, id: &StreamId, uid: u64) {
        let mut receivers = self.state.receivers.write();
        if let Some(handles) = receivers.get_mut(id) {
            handles.remove(&uid);
            if handles.is_empty() {
                receivers.remove(id);
            }
        }
    }

    pub(crate) fn allocate_uid(&self) -> u64 {
        next_uid()
    }

    pub(crate) fn close_sender_uid(&self, uid: u64) {
        if let Some(closed) = self.state.senders.write().remove(&uid) {
            closed.store(true, Ordering::Release);
        }
    }

    /// Fans `data` out to every receiver registered under `id`, in the
    /// current snapshot of the routing table. A failed write (pipe closed)
    /// drops that one receiver without affecting the others in this batch.
    pub(crate) fn fan_out(&self, id: &StreamId, data: Bytes) {
        let dead: Vec<u64> = {
            let receivers = self.state.receivers.read();
            let Some(handles) = receivers.get(id) else {
                return;
            };
            handles
                .iter()
                .filter_map(|(uid, handle)| if handle.feed(data.clone()) { None } else { Some(*uid) })
                .collect()
        };

        if !dead.is_empty() {
            self.remove_receiver_uids(id, &dead);
        }
    }

    fn remove_receiver_uids(&self, id: &StreamId, uids: &[u64]) {
        let mut receivers = self.state.receivers.write();
        if let Some(handles) = receivers.get_mut(id) {
            for uid in uids {
                handles.remove(uid);
            }
            if handles.is_empty() {
                receivers.remove(id);
            }
        }
    }

    /// Sends `data` to every mux currently registered with this client.
    pub(crate) fn broadcast(&self, id: &StreamId, data: Bytes) {
        let muxes: Vec<_> = self.state.muxes.read().values().map(|m| m.outbound_tx.clone()).collect();
        for outbound_tx in muxes {
            let _ = outbound_tx.send(contd_proto::Packet::new(id.as_str(), data.clone()));
        }
    }

    pub(crate) fn register_mux(&self, id: MuxId, handle: MuxHandle) {
        self.state.muxes.write().insert(id, handle);
    }

    pub(crate) fn unregister_mux(&self, id: MuxId) -> Option<MuxHandle> {
        self.state.muxes.write().remove(&id)
    }
}
