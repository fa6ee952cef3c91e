use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use arkdrop_entities::{DropId, PeerId};
use arkdropx_common::DropMessage;
use tokio::sync::mpsc;
use tracing::debug;

use super::{DataReceiver, DataSender, Demux, InboundMessage, LinkTable, Transport};
use crate::error::TransportError;

struct Node {
    demux: Demux,
    reachable: bool,
}

/// An in-process network of [`MemoryTransport`]s.
///
/// Peers are addressed by their id; the `addresses` given to a transport
/// are ignored. Any node can be marked unreachable to simulate a peer that
/// vanished: dialing it fails and messages already on the way are dropped.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<PeerId, Node>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a node and returns its transport plus the queue its
    /// coordinator consumes.
    pub fn join(
        &self,
        peer_id: impl Into<PeerId>,
        capacity: usize,
    ) -> (MemoryTransport, mpsc::Receiver<InboundMessage>) {
        let peer_id = peer_id.into();
        let (demux, inbound) = Demux::new(capacity);
        self.nodes().insert(
            peer_id.clone(),
            Node {
                demux: demux.clone(),
                reachable: true,
            },
        );
        let transport = MemoryTransport {
            peer_id,
            network: self.clone(),
            demux,
            links: LinkTable::default(),
            capacity,
        };
        (transport, inbound)
    }

    pub fn set_reachable(&self, peer_id: &PeerId, reachable: bool) {
        if let Some(node) = self.nodes().get_mut(peer_id) {
            node.reachable = reachable;
        }
    }

    pub fn leave(&self, peer_id: &PeerId) {
        self.nodes().remove(peer_id);
    }

    fn reachable_demux(&self, peer_id: &PeerId) -> Option<Demux> {
        self.nodes()
            .get(peer_id)
            .filter(|node| node.reachable)
            .map(|node| node.demux.clone())
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<PeerId, Node>> {
        self.nodes.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct MemoryTransport {
    peer_id: PeerId,
    network: MemoryNetwork,
    demux: Demux,
    links: LinkTable,
    capacity: usize,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn link(
        &self,
        peer: &PeerId,
    ) -> Result<mpsc::Sender<DropMessage>, TransportError> {
        if self.network.reachable_demux(peer).is_none() {
            return Err(TransportError::Unreachable(peer.to_string()));
        }
        if let Some(link) = self.links.get(peer) {
            return Ok(link);
        }

        let (tx, mut rx) = mpsc::channel::<DropMessage>(self.capacity);
        let network = self.network.clone();
        let from = self.peer_id.clone();
        let to = peer.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(remote) = network.reachable_demux(&to) else {
                    debug!(peer = %to, "link lost");
                    break;
                };
                if !remote.dispatch(from.clone(), message).await {
                    break;
                }
            }
        });
        self.links.insert(peer.clone(), tx.clone());
        debug!(peer = %peer, "link opened");
        Ok(tx)
    }
}

impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn send(
        &self,
        peer: &PeerId,
        _addresses: &[String],
        message: DropMessage,
    ) -> Result<(), TransportError> {
        let link = self.link(peer)?;
        if link.send(message).await.is_err() {
            self.links.remove(peer, &link);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn open_data_channel(
        &self,
        peer: &PeerId,
        _addresses: &[String],
        id: DropId,
    ) -> Result<DataSender, TransportError> {
        Ok(DataSender::new(id, self.link(peer)?))
    }

    fn accept_data_channel(
        &self,
        peer: &PeerId,
        id: DropId,
    ) -> Result<DataReceiver, TransportError> {
        self.demux.register(peer, id)
    }

    fn close_data_channel(&self, peer: &PeerId, id: DropId) {
        self.demux.unregister(peer, id);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.links.clear();
        self.network.leave(&self.peer_id);
    }
}
