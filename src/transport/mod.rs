//! Network abstraction used by the coordinator.
//!
//! A transport keeps one ordered link per remote peer. Control messages are
//! handed to that link by [`Transport::send`] and come out of the remote
//! transport's inbound queue as [`InboundMessage`]s. Data frames of an
//! accepted drop travel on the same link, but the receiving transport routes
//! them straight to the [`DataReceiver`] registered for the drop instead of
//! the coordinator queue.

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, probe};

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use arkdrop_entities::{DropId, PeerId};
use arkdropx_common::{DataFrame, DropMessage};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::TransportError;

/// A control message received from `from`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: PeerId,
    pub message: DropMessage,
}

pub trait Transport: Send + Sync + 'static {
    fn local_peer_id(&self) -> &PeerId;

    /// Hands `message` to the ordered link towards `peer`, dialing one of
    /// `addresses` if there is no link yet. Success means the message was
    /// queued, not that the peer processed it.
    fn send(
        &self,
        peer: &PeerId,
        addresses: &[String],
        message: DropMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Sender side: the channel data frames of `id` are written to.
    fn open_data_channel(
        &self,
        peer: &PeerId,
        addresses: &[String],
        id: DropId,
    ) -> impl Future<Output = Result<DataSender, TransportError>> + Send;

    /// Receiver side: starts routing data frames of `id` coming from `peer`
    /// to the returned receiver. Must be called before the peer is told to
    /// start sending.
    fn accept_data_channel(
        &self,
        peer: &PeerId,
        id: DropId,
    ) -> Result<DataReceiver, TransportError>;

    /// Stops routing data frames of `id`. Frames arriving afterwards are
    /// dropped.
    fn close_data_channel(&self, peer: &PeerId, id: DropId);
}

/// Writing end of a data channel.
#[derive(Clone, Debug)]
pub struct DataSender {
    id: DropId,
    link: mpsc::Sender<DropMessage>,
}

impl DataSender {
    pub(crate) fn new(id: DropId, link: mpsc::Sender<DropMessage>) -> Self {
        Self { id, link }
    }

    pub fn id(&self) -> DropId {
        self.id
    }

    pub async fn send(&self, frame: DataFrame) -> Result<(), TransportError> {
        self.link
            .send(frame.into_message(self.id))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Reading end of a data channel. Yields `None` once the channel is closed.
#[derive(Debug)]
pub struct DataReceiver {
    id: DropId,
    frames: mpsc::Receiver<DataFrame>,
}

impl DataReceiver {
    pub fn id(&self) -> DropId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<DataFrame> {
        self.frames.recv().await
    }
}

/// Outbound links keyed by peer.
#[derive(Clone, Default)]
pub(crate) struct LinkTable {
    links: Arc<Mutex<HashMap<PeerId, mpsc::Sender<DropMessage>>>>,
}

impl LinkTable {
    pub(crate) fn get(&self, peer: &PeerId) -> Option<mpsc::Sender<DropMessage>> {
        self.lock()
            .get(peer)
            .filter(|link| !link.is_closed())
            .cloned()
    }

    pub(crate) fn insert(&self, peer: PeerId, link: mpsc::Sender<DropMessage>) {
        self.lock().insert(peer, link);
    }

    /// Like `insert`, but keeps an existing open link.
    pub(crate) fn insert_if_absent(
        &self,
        peer: PeerId,
        link: mpsc::Sender<DropMessage>,
    ) -> bool {
        let mut links = self.lock();
        match links.get(&peer) {
            Some(existing) if !existing.is_closed() => false,
            _ => {
                links.insert(peer, link);
                true
            }
        }
    }

    /// Removes `link` if it is still the one registered for `peer`.
    pub(crate) fn remove(&self, peer: &PeerId, link: &mpsc::Sender<DropMessage>) {
        let mut links = self.lock();
        if links.get(peer).is_some_and(|l| l.same_channel(link)) {
            links.remove(peer);
        }
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, mpsc::Sender<DropMessage>>> {
        self.links.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct Route {
    peer: PeerId,
    frames: mpsc::Sender<DataFrame>,
}

/// Splits what arrives on the links into coordinator-bound control messages
/// and per-drop data frames.
#[derive(Clone)]
pub(crate) struct Demux {
    inbound: mpsc::Sender<InboundMessage>,
    routes: Arc<Mutex<HashMap<DropId, Route>>>,
    capacity: usize,
}

impl Demux {
    pub(crate) fn new(
        capacity: usize,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound, rx) = mpsc::channel(capacity);
        let demux = Self {
            inbound,
            routes: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        };
        (demux, rx)
    }

    pub(crate) fn register(
        &self,
        peer: &PeerId,
        id: DropId,
    ) -> Result<DataReceiver, TransportError> {
        let (frames, rx) = mpsc::channel(self.capacity);
        let mut routes = self.routes();
        if routes.contains_key(&id) {
            return Err(TransportError::Io(format!(
                "data channel for {id} already open"
            )));
        }
        routes.insert(
            id,
            Route {
                peer: peer.clone(),
                frames,
            },
        );
        Ok(DataReceiver { id, frames: rx })
    }

    pub(crate) fn unregister(&self, peer: &PeerId, id: DropId) {
        let mut routes = self.routes();
        if routes.get(&id).is_some_and(|r| &r.peer == peer) {
            routes.remove(&id);
        }
    }

    /// Delivers one message that arrived from `from`.
    ///
    /// Returns `false` once the local coordinator is gone.
    pub(crate) async fn dispatch(&self, from: PeerId, message: DropMessage) -> bool {
        let (id, frame) = match DataFrame::split(message) {
            Ok(data) => data,
            Err(DropMessage::Hello { .. }) => {
                trace!(peer = %from, "ignoring repeated Hello");
                return true;
            }
            Err(message) => {
                trace!(peer = %from, kind = message.kind(), "inbound message");
                return self
                    .inbound
                    .send(InboundMessage { from, message })
                    .await
                    .is_ok();
            }
        };

        let frames = self
            .routes()
            .get(&id)
            .filter(|route| route.peer == from)
            .map(|route| route.frames.clone());
        match frames {
            Some(frames) => {
                if frames.send(frame).await.is_err() {
                    debug!(%id, peer = %from, "data channel closed, frame dropped");
                }
            }
            None => debug!(%id, peer = %from, "no data channel, frame dropped"),
        }
        true
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<DropId, Route>> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_messages_go_to_the_inbound_queue() {
        let (demux, mut inbound) = Demux::new(4);
        let id = DropId::new();
        assert!(demux.dispatch("bob".into(), DropMessage::Cancel { id }).await);

        let received = inbound.recv().await.unwrap();
        assert_eq!(received.from, PeerId::from("bob"));
        assert_eq!(received.message, DropMessage::Cancel { id });
    }

    #[tokio::test]
    async fn data_frames_go_to_the_registered_channel_only_from_its_peer() {
        let (demux, mut inbound) = Demux::new(4);
        let id = DropId::new();
        let mut channel = demux.register(&"bob".into(), id).unwrap();

        let chunk = DropMessage::Chunk {
            id,
            file_index: 0,
            data: vec![1, 2],
        };
        demux.dispatch("mallory".into(), chunk.clone()).await;
        demux.dispatch("bob".into(), chunk).await;

        assert_eq!(
            channel.recv().await,
            Some(DataFrame::Chunk {
                file_index: 0,
                data: vec![1, 2]
            })
        );
        assert!(inbound.try_recv().is_err());

        demux.unregister(&"bob".into(), id);
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test]
    async fn a_drop_has_at_most_one_data_channel() {
        let (demux, _inbound) = Demux::new(4);
        let id = DropId::new();
        let _channel = demux.register(&"bob".into(), id).unwrap();
        assert!(demux.register(&"bob".into(), id).is_err());
    }

    #[tokio::test]
    async fn link_table_forgets_closed_links() {
        let table = LinkTable::default();
        let (tx, rx) = mpsc::channel(1);
        table.insert("bob".into(), tx.clone());
        assert!(table.get(&"bob".into()).is_some());

        drop(rx);
        assert!(table.get(&"bob".into()).is_none());

        let (fresh, _fresh_rx) = mpsc::channel(1);
        assert!(table.insert_if_absent("bob".into(), fresh.clone()));
        table.remove(&"bob".into(), &tx);
        assert!(table.get(&"bob".into()).is_some());
        table.remove(&"bob".into(), &fresh);
        assert!(table.get(&"bob".into()).is_none());
    }
}
