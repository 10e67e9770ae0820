//! The daemon's three shared mutable maps (§5): container registry, event
//! registry, connection registry, each guarded by its own
//! `parking_lot::RwLock`. Grounded in `original_source/daemon/server.go`'s
//! `server` struct (`currentlyRunning`, `events`, `connections`), redesigned
//! per SPEC_FULL §9 as fields of an explicit component rather than
//! package-level globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use contd_mux::Mux;
use contd_proto::{ClientId, ContainerId, Event};
use nix::unistd::Pid;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Everything the registry needs to know about one running container
/// for `Ps` and for tearing it down on `Kill`. The container's own
/// `ContainerProcess` stays owned by its `Run` background task (so that
/// task alone can consume it into `wait()`); the registry only needs the
/// pid to deliver `SIGKILL` and the `killed` flag so that task can tell
/// whether `Kill` already emitted the terminal event by the time `wait()`
/// returns (SPEC_FULL §9 Open Question d: a kill-induced exit emits only
/// `Killed`, never a trailing `Done`).
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub cmd: String,
    pub pid: Pid,
    pub killed: Arc<AtomicBool>,
    pub streamers: RwLock<HashMap<ClientId, StreamConnection>>,
}

/// One client currently attached to a container's stdio via
/// `RequestStream`. Holds no transport of its own — [`ConnectionRegistry`]
/// is the sole owner of the client's `Mux`; this is only a weak,
/// bookkeeping reference so a disconnecting client can be scrubbed out of
/// every container's `streamers` map without that map owning anything that
/// needs tearing down itself.
pub struct StreamConnection {
    pub client_id: ClientId,
}

/// The container registry: `currently_running` in the original. Holds one
/// entry per container between `Started` and removal (I1).
#[derive(Default)]
pub struct ContainerRegistry {
    containers: RwLock<HashMap<ContainerId, ContainerRecord>>,
}

impl ContainerRegistry {
    pub fn insert(&self, record: ContainerRecord) {
        self.containers.write().insert(record.id, record);
    }

    pub fn remove(&self, id: ContainerId) -> Option<ContainerRecord> {
        self.containers.write().remove(&id)
    }

    pub fn get_pid(&self, id: ContainerId) -> Option<Pid> {
        self.containers.read().get(&id).map(|record| record.pid)
    }

    pub fn contains(&self, id: ContainerId) -> bool {
        self.containers.read().contains_key(&id)
    }

    /// Marks `id` as killed. Returns `false` (and does nothing else) if the
    /// container is unknown or was already marked, so a repeated `Kill`
    /// call or a race against the background task's own cleanup can't
    /// double-emit `Killed`.
    pub fn mark_killed(&self, id: ContainerId) -> Option<Arc<AtomicBool>> {
        self.containers.read().get(&id).map(|record| {
            record.killed.store(true, Ordering::SeqCst);
            Arc::clone(&record.killed)
        })
    }

    /// Whether `Kill` already fired for `id`, checked by the `Run`
    /// background task right after `wait()` returns to decide whether the
    /// exit is a kill (already reported) or a natural `Done`/`Failed`.
    pub fn was_killed(killed: &Arc<AtomicBool>) -> bool {
        killed.load(Ordering::SeqCst)
    }

    /// Snapshot for `Ps`: `{id, name, cmd, pid}`.
    pub fn snapshot(&self) -> Vec<(ContainerId, String, String, i32)> {
        self.containers
            .read()
            .values()
            .map(|record| (record.id, record.name.clone(), record.cmd.clone(), record.pid.as_raw()))
            .collect()
    }

    /// Records `client_id` as attached to `container_id`'s stdio, from
    /// `RequestStream` binding it. A no-op if the container is unknown (it
    /// may have exited between the CLI's `Run` and this call).
    pub fn register_streamer(&self, container_id: ContainerId, client_id: ClientId) {
        if let Some(record) = self.containers.read().get(&container_id) {
            record.streamers.write().insert(client_id, StreamConnection { client_id });
        }
    }

    /// Removes `client_id` from every container's streamers map (P5):
    /// called when that client's side-transport connection closes,
    /// regardless of which container(s) it was attached to.
    pub fn remove_streamer_everywhere(&self, client_id: ClientId) {
        for record in self.containers.read().values() {
            record.streamers.write().remove(&client_id);
        }
    }

    /// Whether `client_id` is currently recorded as attached to
    /// `container_id`'s stdio. Exposed for tests exercising P5.
    pub fn has_streamer(&self, container_id: ContainerId, client_id: ClientId) -> bool {
        self.containers
            .read()
            .get(&container_id)
            .is_some_and(|record| record.streamers.read().contains_key(&client_id))
    }
}

/// The event registry: `events` in the original. One bounded channel per
/// container, created in `Run`'s background task (which keeps the
/// `Sender` half to emit `Created`/`Started`/`Done`/`Killed`/`Failed`);
/// the `Receiver` half sits here until the `Events` RPC claims it. A
/// single channel only ever has one active subscriber (§5 — no
/// multi-subscriber fan-out required), so claiming is a one-shot take.
#[derive(Default)]
pub struct EventRegistry {
    senders: RwLock<HashMap<ContainerId, mpsc::Sender<Event>>>,
    pending_receivers: RwLock<HashMap<ContainerId, mpsc::Receiver<Event>>>,
}

/// Bound chosen so a burst of lifecycle events (at most 3 per container)
/// never has to apply the 100 ms backpressure timeout in the common case.
const EVENT_CHANNEL_CAPACITY: usize = 8;

/// A slow or absent subscriber causes `send` to time out rather than block
/// the producing task indefinitely (§5).
const EVENT_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

impl EventRegistry {
    /// Creates the channel for `id`. Returns the `Sender` half for the
    /// caller (the `Run` background task) to emit events with.
    pub fn create(&self, id: ContainerId) -> mpsc::Sender<Event> {
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.senders.write().insert(id, sender.clone());
        self.pending_receivers.write().insert(id, receiver);
        sender
    }

    /// Emits `event` for `id`. Times out after 100 ms if the channel is
    /// full (a slow subscriber drops the event instead of stalling the
    /// producer); silently does nothing if the channel was already closed.
    pub async fn send(&self, id: ContainerId, event: Event) {
        let Some(sender) = self.senders.read().get(&id).cloned() else {
            return;
        };
        if tokio::time::timeout(EVENT_SEND_TIMEOUT, sender.send(event)).await.is_err() {
            warn!(%id, "event dropped: subscriber too slow or absent");
        }
    }

    /// Claims the `Receiver` half for `id`, retrying with bounded
    /// exponential backoff (up to ~1s) to cover the race where `Events`
    /// is called before `Run`'s background task has created the channel
    /// yet (§4.10). Returns `None` if no channel ever appears, or if it
    /// was already claimed by an earlier `Events` call.
    pub async fn claim_receiver(&self, id: ContainerId) -> Option<mpsc::Receiver<Event>> {
        use backoff::backoff::Backoff as _;

        let mut backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(std::time::Duration::from_millis(5))
            .with_max_interval(std::time::Duration::from_millis(200))
            .with_max_elapsed_time(Some(std::time::Duration::from_millis(1000)))
            .build();

        loop {
            if let Some(receiver) = self.pending_receivers.write().remove(&id) {
                return Some(receiver);
            }
            let delay = backoff.next_backoff()?;
            tokio::time::sleep(delay).await;
        }
    }

    pub fn close(&self, id: ContainerId) {
        self.senders.write().remove(&id);
        self.pending_receivers.write().remove(&id);
    }
}

/// The connection registry: `connections` in the original. One mux per
/// connected client, keyed by client-id, registered when the client dials
/// the side transport and sends its id.
#[derive(Default)]
pub struct ConnectionRegistry {
    muxes: RwLock<HashMap<ClientId, Mux>>,
}

impl ConnectionRegistry {
    pub fn insert(&self, id: ClientId, mux: Mux) {
        self.muxes.write().insert(id, mux);
    }

    pub fn remove(&self, id: ClientId) {
        self.muxes.write().remove(&id);
    }

    /// Runs `f` with a reference to the mux registered under `id`, if any.
    pub fn with_mux<R>(&self, id: ClientId, f: impl FnOnce(&Mux) -> R) -> Option<R> {
        self.muxes.read().get(&id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: ContainerId) -> ContainerRecord {
        ContainerRecord {
            id,
            name: "echo".to_owned(),
            cmd: "echo hi".to_owned(),
            pid: Pid::from_raw(1234),
            killed: Arc::new(AtomicBool::new(false)),
            streamers: RwLock::new(HashMap::new()),
        }
    }

    #[test]
    fn container_registry_tracks_insert_and_remove() {
        let registry = ContainerRegistry::default();
        let id = ContainerId::new();

        assert!(!registry.contains(id));
        registry.insert(record(id));
        assert!(registry.contains(id));
        assert_eq!(registry.get_pid(id), Some(Pid::from_raw(1234)));

        let removed = registry.remove(id);
        assert!(removed.is_some());
        assert!(!registry.contains(id));
    }

    #[test]
    fn mark_killed_is_visible_through_the_same_flag_returned_to_the_run_task() {
        let registry = ContainerRegistry::default();
        let id = ContainerId::new();
        registry.insert(record(id));

        let flag = registry.mark_killed(id).expect("container is registered");
        assert!(ContainerRegistry::was_killed(&flag));
    }

    #[test]
    fn mark_killed_on_an_unknown_container_is_a_noop() {
        let registry = ContainerRegistry::default();
        assert!(registry.mark_killed(ContainerId::new()).is_none());
    }

    #[test]
    fn register_streamer_is_visible_through_has_streamer() {
        let registry = ContainerRegistry::default();
        let id = ContainerId::new();
        let client = ClientId::new();
        registry.insert(record(id));

        assert!(!registry.has_streamer(id, client));
        registry.register_streamer(id, client);
        assert!(registry.has_streamer(id, client));
    }

    #[test]
    fn register_streamer_on_an_unknown_container_is_a_noop() {
        let registry = ContainerRegistry::default();
        let client = ClientId::new();
        registry.register_streamer(ContainerId::new(), client);
    }

    #[test]
    fn remove_streamer_everywhere_clears_every_container_the_client_was_attached_to() {
        let registry = ContainerRegistry::default();
        let first = ContainerId::new();
        let second = ContainerId::new();
        let client = ClientId::new();
        registry.insert(record(first));
        registry.insert(record(second));
        registry.register_streamer(first, client);
        registry.register_streamer(second, client);

        registry.remove_streamer_everywhere(client);

        assert!(!registry.has_streamer(first, client));
        assert!(!registry.has_streamer(second, client));
    }

    #[tokio::test]
    async fn events_claim_receiver_sees_what_create_sent() {
        let registry = EventRegistry::default();
        let id = ContainerId::new();

        let sender = registry.create(id);
        sender.send(Event::Created).await.unwrap();

        let mut receiver = registry.claim_receiver(id).await.expect("channel was created");
        assert!(matches!(receiver.recv().await, Some(Event::Created)));
    }

    #[tokio::test]
    async fn events_claim_receiver_on_an_unknown_container_times_out_to_none() {
        let registry = EventRegistry::default();
        assert!(registry.claim_receiver(ContainerId::new()).await.is_none());
    }
}
