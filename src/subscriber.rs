use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use arkdrop_entities::{DropId, FailureReason, PeerMetadata};
use tracing::trace;

use crate::request::{DropRequest, DropRole, DropState};

/// Observer of a coordinator.
///
/// All notifications are delivered from the coordinator task, in the order
/// the changes happened, so implementations must return quickly and must
/// not call back into the coordinator synchronously.
pub trait DropSubscriber: Send + Sync {
    fn get_id(&self) -> String;
    fn notify_state(&self, event: DropStateEvent);
    fn notify_progress(&self, event: DropProgressEvent);
    fn notify_peers(&self, _event: PeersChangedEvent) {}
}

#[derive(Clone, Debug)]
pub struct DropStateEvent {
    pub id: DropId,
    pub role: DropRole,
    /// `None` when the request was just created or mirrored.
    pub previous: Option<DropState>,
    pub state: DropState,
    pub failure: Option<FailureReason>,
    pub request: DropRequest,
}

#[derive(Clone, Debug)]
pub struct DropProgressEvent {
    pub id: DropId,
    pub role: DropRole,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

#[derive(Clone, Debug)]
pub struct PeersChangedEvent {
    pub peers: Vec<PeerMetadata>,
}

#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    inner: Arc<RwLock<HashMap<String, Arc<dyn DropSubscriber>>>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&self, subscriber: Arc<dyn DropSubscriber>) {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(subscriber.get_id(), subscriber);
    }

    pub(crate) fn unsubscribe(&self, id: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id)
            .is_some()
    }

    fn each(&self, f: impl Fn(&Arc<dyn DropSubscriber>)) {
        let subscribers: Vec<Arc<dyn DropSubscriber>> = self
            .inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        subscribers.iter().for_each(f);
    }

    pub(crate) fn state(&self, previous: Option<DropState>, request: &DropRequest) {
        trace!(id = %request.id, ?previous, state = ?request.state, "notify state");
        self.each(|s| {
            s.notify_state(DropStateEvent {
                id: request.id,
                role: request.role,
                previous,
                state: request.state,
                failure: request.failure.clone(),
                request: request.clone(),
            })
        });
    }

    pub(crate) fn progress(&self, request: &DropRequest) {
        self.each(|s| {
            s.notify_progress(DropProgressEvent {
                id: request.id,
                role: request.role,
                bytes_transferred: request.bytes_transferred,
                total_bytes: request.total_bytes(),
            })
        });
    }

    pub(crate) fn peers(&self, peers: &[PeerMetadata]) {
        self.each(|s| {
            s.notify_peers(PeersChangedEvent {
                peers: peers.to_vec(),
            })
        });
    }
}
