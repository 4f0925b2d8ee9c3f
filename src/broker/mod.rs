//! Fan-out broker: the device→session registry and its coordinator.
//!
//! A single coordinator thread owns the registry. Registration,
//! unregistration and fan-out arrive as messages on dedicated queues, so
//! every registry mutation and every dispatch decision has one well-defined
//! serial order and sessions never lock shared state.

mod exchanges;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use uuid::Uuid;

use crate::store::{ChannelId, PendingStore};

pub use exchanges::{AckAction, Exchange, Prepared, channel_filter, filter_by_level};

/// Process-unique identity of one device connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_simple().fmt(f)
    }
}

/// Session state owned by its session loop. Only `exchange_rx`'s sender
/// side is touched by the broker.
pub struct Session {
    pub id: SessionId,
    pub device_id: String,
    pub model: String,
    pub image_channel: String,
    pub levels: BTreeMap<ChannelId, i64>,
    pub exchange_rx: Receiver<Exchange>,
    pub kill_rx: Receiver<()>,
}

/// The broker-side face of a session: just enough to route exchanges and to
/// supersede it. Identity is the session id, not the field values.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub device_id: String,
    exchange_tx: Sender<Exchange>,
    kill_tx: Sender<()>,
}

impl Session {
    /// Builds the loop-owned session and its broker-side handle. The
    /// exchange queue is bounded at `queue_size`; the kill signal holds at
    /// most one pending supersession.
    pub fn new(
        id: SessionId,
        device_id: String,
        model: String,
        image_channel: String,
        levels: BTreeMap<ChannelId, i64>,
        queue_size: usize,
    ) -> (Session, SessionHandle) {
        let (exchange_tx, exchange_rx) = bounded(queue_size);
        let (kill_tx, kill_rx) = bounded(1);
        let session = Session {
            id,
            device_id: device_id.clone(),
            model,
            image_channel,
            levels,
            exchange_rx,
            kill_rx,
        };
        let handle = SessionHandle {
            id,
            device_id,
            exchange_tx,
            kill_tx,
        };
        (session, handle)
    }

    /// Tag selecting this device's slice of the multiplexed system channel,
    /// e.g. `"img1/m1"`. Empty (no filtering) for devices that did not
    /// announce an image channel.
    pub fn system_tag(&self) -> String {
        if self.image_channel.is_empty() {
            String::new()
        } else {
            format!("{}/{}", self.image_channel, self.model)
        }
    }
}

/// The fan-out surface the HTTP API depends on.
pub trait BrokerSending: Send + Sync {
    /// Wakes every session for new appends on `chan`.
    fn broadcast(&self, chan: &ChannelId);
    /// Wakes the session of the device owning the unicast channel, if any.
    fn unicast(&self, chan: &ChannelId);
}

#[derive(Clone, Copy, Debug)]
pub struct BrokerConfig {
    /// Bound on a unicast enqueue towards a slow session; the notification
    /// stays in the store either way.
    pub unicast_enqueue_timeout: Duration,
}

/// Cloneable sender side of the broker.
#[derive(Clone)]
pub struct BrokerHandle {
    register_tx: Sender<SessionHandle>,
    unregister_tx: Sender<SessionHandle>,
    broadcast_tx: Sender<ChannelId>,
    unicast_tx: Sender<ChannelId>,
    stop_rx: Receiver<()>,
    session_count: Arc<AtomicUsize>,
}

impl BrokerHandle {
    /// Hands a new session to the coordinator. Blocks only for the enqueue;
    /// installation, supersession of a prior session for the same device and
    /// catch-up seeding all happen on the coordinator.
    pub fn register(&self, handle: SessionHandle) {
        let _ = self.register_tx.send(handle);
    }

    /// Removes a session. Ignored unless the registered session for the
    /// device is this very one, so a superseded loop cannot evict its
    /// successor on the way out.
    pub fn unregister(&self, handle: SessionHandle) {
        let _ = self.unregister_tx.send(handle);
    }

    /// Resolves once the broker shuts down; session loops select on it.
    pub fn stop_signal(&self) -> Receiver<()> {
        self.stop_rx.clone()
    }

    /// Number of currently registered sessions.
    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Acquire)
    }
}

impl BrokerSending for BrokerHandle {
    fn broadcast(&self, chan: &ChannelId) {
        let _ = self.broadcast_tx.send(chan.clone());
    }

    fn unicast(&self, chan: &ChannelId) {
        let _ = self.unicast_tx.send(chan.clone());
    }
}

/// Owner of the coordinator thread.
pub struct Broker {
    handle: BrokerHandle,
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Broker {
    pub fn start(store: Arc<dyn PendingStore>, config: BrokerConfig) -> Broker {
        let (register_tx, register_rx) = unbounded();
        let (unregister_tx, unregister_rx) = unbounded();
        let (broadcast_tx, broadcast_rx) = unbounded();
        let (unicast_tx, unicast_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let session_count = Arc::new(AtomicUsize::new(0));

        let coordinator = Coordinator {
            store,
            config,
            by_device: BTreeMap::new(),
            session_count: Arc::clone(&session_count),
        };
        let queues = CoordinatorQueues {
            register_rx,
            unregister_rx,
            broadcast_rx,
            unicast_rx,
            stop_rx: stop_rx.clone(),
        };
        let join = std::thread::Builder::new()
            .name("broker".to_string())
            .spawn(move || coordinator.run(queues))
            .expect("spawn broker coordinator");

        Broker {
            handle: BrokerHandle {
                register_tx,
                unregister_tx,
                broadcast_tx,
                unicast_tx,
                stop_rx,
                session_count,
            },
            stop_tx: Some(stop_tx),
            join: Some(join),
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Drops the stop signal (waking every session loop) and joins the
    /// coordinator.
    pub fn shutdown(mut self) {
        self.stop_tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop_tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct CoordinatorQueues {
    register_rx: Receiver<SessionHandle>,
    unregister_rx: Receiver<SessionHandle>,
    broadcast_rx: Receiver<ChannelId>,
    unicast_rx: Receiver<ChannelId>,
    stop_rx: Receiver<()>,
}

struct Coordinator {
    store: Arc<dyn PendingStore>,
    config: BrokerConfig,
    by_device: BTreeMap<String, SessionHandle>,
    session_count: Arc<AtomicUsize>,
}

impl Coordinator {
    fn run(mut self, queues: CoordinatorQueues) {
        loop {
            crossbeam::select! {
                recv(queues.register_rx) -> msg => match msg {
                    Ok(handle) => self.register(handle),
                    Err(_) => break,
                },
                recv(queues.unregister_rx) -> msg => match msg {
                    Ok(handle) => self.unregister(handle),
                    Err(_) => break,
                },
                recv(queues.broadcast_rx) -> msg => match msg {
                    Ok(chan) => self.broadcast(&chan),
                    Err(_) => break,
                },
                recv(queues.unicast_rx) -> msg => match msg {
                    Ok(chan) => self.unicast(chan),
                    Err(_) => break,
                },
                recv(queues.stop_rx) -> _ => break,
            }
        }
        tracing::debug!("broker coordinator stopped");
    }

    fn register(&mut self, handle: SessionHandle) {
        let session = handle.id;
        let device = handle.device_id.clone();
        if let Some(prev) = self.by_device.insert(device.clone(), handle.clone()) {
            let _ = prev.kill_tx.try_send(());
            tracing::debug!(session = %prev.id, %device, "session superseded by new registration");
        }
        self.publish_count();

        // Seed catch-up: system-channel state first, then any mail that
        // piled up while the device was offline, whichever user id keys
        // its mailbox.
        let _ = handle.exchange_tx.try_send(Exchange::ConnBroadcast);
        match self.store.pending_channels_for_device(&handle.device_id) {
            Ok(mailboxes) => {
                for mailbox in mailboxes {
                    if let Err(err) = handle
                        .exchange_tx
                        .send_timeout(Exchange::Unicast(mailbox), self.config.unicast_enqueue_timeout)
                    {
                        tracing::info!(%session, %device, "mailbox catch-up enqueue failed: {err}");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%session, %device, "mailbox catch-up skipped: {err}");
            }
        }
        tracing::debug!(%session, %device, "session registered");
    }

    fn unregister(&mut self, handle: SessionHandle) {
        let registered = self
            .by_device
            .get(&handle.device_id)
            .is_some_and(|current| current.id == handle.id);
        if registered {
            self.by_device.remove(&handle.device_id);
            self.publish_count();
            tracing::debug!(session = %handle.id, device = %handle.device_id, "session unregistered");
        }
    }

    fn broadcast(&self, chan: &ChannelId) {
        for handle in self.by_device.values() {
            match handle.exchange_tx.try_send(Exchange::Broadcast(chan.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // The wake-up is redundant: the store holds the payload
                    // and the level filter recovers it on the next exchange.
                    tracing::debug!(session = %handle.id, %chan, "session queue full, dropping broadcast wake-up");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    fn unicast(&self, chan: ChannelId) {
        let Some((_, device)) = chan.unicast_parts() else {
            tracing::warn!(%chan, "unicast signal for non-unicast channel");
            return;
        };
        let Some(handle) = self.by_device.get(device) else {
            // Offline device: the store keeps the notification and
            // registration-time catch-up replays it.
            return;
        };
        let exchange = Exchange::Unicast(chan.clone());
        if let Err(err) = handle
            .exchange_tx
            .send_timeout(exchange, self.config.unicast_enqueue_timeout)
        {
            tracing::info!(session = %handle.id, %chan, "unicast enqueue failed: {err}");
        }
    }

    fn publish_count(&self) {
        self.session_count
            .store(self.by_device.len(), Ordering::Release);
    }
}
