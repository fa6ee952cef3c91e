//! The process-wide drop service.
//!
//! A single task owns the peer registry, every drop state machine and the
//! timeout scheduler. Public calls, inbound transport messages, timer events
//! and transfer reports all reach it as [`Command`]s on one queue and are
//! processed strictly one after another. Queries are answered from a
//! snapshot the task refreshes after every change, without entering the
//! queue.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use arkdrop_entities::{
    DropId, FailureReason, FileManifest, PeerId, PeerMetadata, checked_manifest_size,
};
use arkdropx_common::DropMessage;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::{
    config::DropConfig,
    error::{DropError, Result, TransportError},
    files::FileStore,
    machine::{CancelOutcome, DropMachine, Transition},
    registry::PeerRegistry,
    request::{Decision, DropRequest, DropRole, DropState},
    scheduler::{TimeoutScheduler, TimerHandle},
    session::{self, Reporter, SessionOutcome, SessionReport, SessionSettings},
    subscriber::{DropSubscriber, Subscribers},
    transport::{InboundMessage, Transport},
};

pub(crate) enum Command {
    UpsertPeer {
        metadata: PeerMetadata,
        reply: oneshot::Sender<()>,
    },
    RemovePeer {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<PeerMetadata>>,
    },
    EvictStalePeers {
        max_age: Duration,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Initiate {
        receiver: PeerId,
        manifest: FileManifest,
        reply: oneshot::Sender<Result<DropId>>,
    },
    Respond {
        id: DropId,
        decision: Decision,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        id: DropId,
        reply: oneshot::Sender<Result<()>>,
    },
    Inbound(InboundMessage),
    Timer(TimerEvent),
    Session(SessionReport),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl From<SessionReport> for Command {
    fn from(report: SessionReport) -> Self {
        Command::Session(report)
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum TimerEvent {
    Expire { id: DropId, handle: TimerHandle },
    Stall { id: DropId, handle: TimerHandle },
    Evict { id: DropId, handle: TimerHandle },
}

#[derive(Default)]
struct Snapshot {
    requests: HashMap<DropId, DropRequest>,
    peers: Vec<PeerMetadata>,
}

pub struct Coordinator;

impl Coordinator {
    /// Starts the coordinator task for the node behind `transport`.
    ///
    /// `inbound` is the queue the transport delivers control messages on.
    /// The task stops on [`CoordinatorHandle::shutdown`] or when the last
    /// handle is dropped; either way every unfinished drop is cancelled.
    pub fn start<T: Transport>(
        config: DropConfig,
        transport: T,
        mut inbound: mpsc::Receiver<InboundMessage>,
        store: Arc<dyn FileStore>,
    ) -> Result<CoordinatorHandle> {
        config.validate()?;
        let local = transport.local_peer_id().clone();
        let (commands, queue) = mpsc::channel(config.channel_capacity * 4);
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));
        let subscribers = Subscribers::default();
        let stop = CancellationToken::new();

        let forward = commands.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if forward.send(Command::Inbound(message)).await.is_err() {
                    break;
                }
            }
        });

        let actor = Actor {
            local: local.clone(),
            transport,
            store,
            registry: PeerRegistry::new(),
            machines: HashMap::new(),
            retired: HashMap::new(),
            subscribers: subscribers.clone(),
            scheduler: TimeoutScheduler::new(commands.clone()),
            commands: commands.clone(),
            snapshot: snapshot.clone(),
            peers_dirty: false,
            config,
        };
        tokio::spawn(actor.run(queue, stop.clone()));

        Ok(CoordinatorHandle {
            local_peer_id: local,
            commands,
            snapshot,
            subscribers,
            _stop: Arc::new(stop.drop_guard()),
        })
    }
}

/// Cloneable entry point to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    snapshot: Arc<RwLock<Snapshot>>,
    subscribers: Subscribers,
    _stop: Arc<DropGuard>,
}

impl CoordinatorHandle {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Offers `manifest` to `receiver`.
    ///
    /// Fails with `EmptyManifest` or `UnknownPeer` without creating
    /// anything. Otherwise the returned drop is already `Pending`, or
    /// `Failed` if the request could not be handed to the transport.
    pub async fn initiate_drop(
        &self,
        receiver: PeerId,
        manifest: FileManifest,
    ) -> Result<DropId> {
        self.request(|reply| Command::Initiate {
            receiver,
            manifest,
            reply,
        })
        .await?
    }

    /// Accepts or declines a pending drop. Only the receiver can accept;
    /// either side can decline.
    pub async fn respond_to_drop(&self, id: DropId, decision: Decision) -> Result<()> {
        self.request(|reply| Command::Respond {
            id,
            decision,
            reply,
        })
        .await?
    }

    /// Cancels a drop. Repeated calls, and calls on a drop that is already
    /// `Cancelled`, succeed. A running transfer stops at its next chunk
    /// boundary, after which the drop becomes `Cancelled`.
    pub async fn cancel_drop(&self, id: DropId) -> Result<()> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    pub fn subscribe(&self, subscriber: Arc<dyn DropSubscriber>) {
        self.subscribers.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.subscribers.unsubscribe(subscriber_id)
    }

    /// Every drop still held by the coordinator, oldest first.
    pub fn list(&self) -> Vec<DropRequest> {
        let mut requests: Vec<DropRequest> =
            self.read().requests.values().cloned().collect();
        requests.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        });
        requests
    }

    pub fn get(&self, id: DropId) -> Option<DropRequest> {
        self.read().requests.get(&id).cloned()
    }

    /// Registry snapshot, most recently seen first.
    pub fn peers(&self) -> Vec<PeerMetadata> {
        self.read().peers.clone()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerMetadata> {
        self.read()
            .peers
            .iter()
            .find(|p| &p.peer_id == peer_id)
            .cloned()
    }

    pub async fn upsert_peer(&self, metadata: PeerMetadata) -> Result<()> {
        self.request(|reply| Command::UpsertPeer { metadata, reply })
            .await
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> Result<Option<PeerMetadata>> {
        let peer_id = peer_id.clone();
        self.request(|reply| Command::RemovePeer { peer_id, reply })
            .await
    }

    pub async fn evict_stale_peers(&self, max_age: Duration) -> Result<Vec<PeerId>> {
        self.request(|reply| Command::EvictStalePeers { max_age, reply })
            .await
    }

    /// Cancels every unfinished drop and stops the coordinator.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| DropError::Shutdown)?;
        response.await.map_err(|_| DropError::Shutdown)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|p| p.into_inner())
    }
}

struct Actor<T> {
    local: PeerId,
    config: DropConfig,
    transport: T,
    store: Arc<dyn FileStore>,
    registry: PeerRegistry,
    machines: HashMap<DropId, DropMachine>,
    /// Final state of every evicted drop. Kept for the lifetime of the
    /// process so a retired id is never accepted again.
    retired: HashMap<DropId, DropState>,
    subscribers: Subscribers,
    scheduler: TimeoutScheduler<Command>,
    commands: mpsc::Sender<Command>,
    snapshot: Arc<RwLock<Snapshot>>,
    peers_dirty: bool,
}

impl<T: Transport> Actor<T> {
    async fn run(mut self, mut queue: mpsc::Receiver<Command>, stop: CancellationToken) {
        info!(peer = %self.local, "coordinator started");
        let mut shutdown_reply = None;
        'outer: loop {
            let command = tokio::select! {
                _ = stop.cancelled() => break,
                command = queue.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            // One tick: the command that woke us plus everything already
            // queued. Registry notifications are flushed once per tick.
            let mut next = Some(command);
            while let Some(command) = next.take() {
                if let Command::Shutdown { reply } = command {
                    shutdown_reply = Some(reply);
                    break 'outer;
                }
                self.handle(command).await;
                next = queue.try_recv().ok();
            }
            self.flush_peers();
        }

        self.shutdown().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        info!(peer = %self.local, "coordinator stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::UpsertPeer { metadata, reply } => {
                let peer = metadata.peer_id.clone();
                if self.registry.upsert(metadata) {
                    debug!(%peer, "peer changed");
                }
                self.peers_dirty = true;
                self.publish_peers();
                let _ = reply.send(());
            }
            Command::RemovePeer { peer_id, reply } => {
                let removed = self.registry.remove(&peer_id);
                if removed.is_some() {
                    debug!(peer = %peer_id, "peer removed");
                    self.peers_dirty = true;
                    self.publish_peers();
                }
                let _ = reply.send(removed);
            }
            Command::EvictStalePeers { max_age, reply } => {
                let evicted = self.registry.evict_stale(max_age);
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "stale peers evicted");
                    self.peers_dirty = true;
                    self.publish_peers();
                }
                let _ = reply.send(evicted);
            }
            Command::Initiate {
                receiver,
                manifest,
                reply,
            } => {
                let result = self.initiate(receiver, manifest).await;
                let _ = reply.send(result);
            }
            Command::Respond {
                id,
                decision,
                reply,
            } => {
                let result = self.respond(id, decision).await;
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => {
                let result = self.cancel(id).await;
                let _ = reply.send(result);
            }
            Command::Inbound(inbound) => self.on_inbound(inbound).await,
            Command::Timer(event) => self.on_timer(event).await,
            Command::Session(report) => self.on_session(report).await,
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    async fn initiate(&mut self, receiver: PeerId, manifest: FileManifest) -> Result<DropId> {
        if manifest.is_empty() {
            return Err(DropError::EmptyManifest);
        }
        if !self.registry.contains(&receiver) {
            return Err(DropError::UnknownPeer(receiver));
        }

        let id = DropId::new();
        info!(%id, peer = %receiver, files = manifest.len(), "initiating drop");
        let request = DropRequest::outgoing(
            id,
            self.local.clone(),
            receiver.clone(),
            manifest.clone(),
        );
        self.insert(DropMachine::new(request));

        let message = DropMessage::RequestDrop {
            id,
            manifest,
            sender_peer_id: self.local.clone(),
        };
        match self.send(&receiver, message).await {
            Ok(()) => {
                if self.apply(id, |m| m.transition(DropState::Pending)).is_ok() {
                    self.arm_expiry(id);
                }
            }
            Err(e) => {
                warn!(%id, peer = %receiver, "request not delivered: {e}");
                self.fail(id, FailureReason::TransportUnavailable);
            }
        }
        Ok(id)
    }

    async fn respond(&mut self, id: DropId, decision: Decision) -> Result<()> {
        let machine = self.machines.get(&id).ok_or(DropError::NotFound(id))?;
        // Either side may decline a pending drop; only the receiver accepts.
        let allowed = match decision {
            Decision::Decline => true,
            Decision::Accept { .. } => machine.role() == DropRole::Receiver,
        };
        if !allowed || machine.state() != DropState::Pending {
            return Err(DropError::InvalidState {
                id,
                state: machine.state(),
                action: "respond to",
            });
        }
        let peer = machine.request().counterpart().clone();

        match decision {
            Decision::Decline => {
                self.apply(id, |m| m.transition(DropState::Declined))?;
                self.send_best_effort(&peer, DropMessage::Decline { id }).await;
            }
            Decision::Accept { destination } => {
                self.apply(id, |m| m.accept(Some(destination)))?;
                self.start_receiving(id, peer).await;
            }
        }
        Ok(())
    }

    async fn start_receiving(&mut self, id: DropId, peer: PeerId) {
        let channel = match self.transport.accept_data_channel(&peer, id) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(%id, "cannot open data channel: {e}");
                self.fail(id, e.failure_reason());
                self.send_fail(id, &peer, e.failure_reason()).await;
                return;
            }
        };

        let Some(destination) = self
            .machines
            .get(&id)
            .and_then(|m| m.request().destination_path.clone())
        else {
            return;
        };
        let ack = DropMessage::Accept {
            id,
            destination_ack: destination.display().to_string(),
        };
        if let Err(e) = self.send(&peer, ack).await {
            warn!(%id, peer = %peer, "acceptance not delivered: {e}");
            self.fail(id, e.failure_reason());
            return;
        }

        let Some((token, manifest)) = self.start_transfer(id) else {
            return;
        };
        tokio::spawn(session::receive_files(
            SessionSettings::from(&self.config),
            token,
            self.store.clone(),
            destination,
            manifest,
            channel,
            Reporter::new(id, self.commands.clone()),
        ));
    }

    async fn start_sending(&mut self, id: DropId, peer: PeerId) {
        let addresses = self.addresses(&peer);
        let opened = tokio::time::timeout(
            self.config.send_timeout(),
            self.transport.open_data_channel(&peer, &addresses, id),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                warn!(%id, peer = %peer, "cannot open data channel: {e}");
                self.fail(id, e.failure_reason());
                self.send_fail(id, &peer, e.failure_reason()).await;
                return;
            }
        };

        let Some((token, manifest)) = self.start_transfer(id) else {
            return;
        };
        tokio::spawn(session::send_files(
            SessionSettings::from(&self.config),
            token,
            self.store.clone(),
            manifest,
            channel,
            Reporter::new(id, self.commands.clone()),
        ));
    }

    /// `Accepted → InProgress`; returns what the transfer task needs.
    fn start_transfer(
        &mut self,
        id: DropId,
    ) -> Option<(CancellationToken, FileManifest)> {
        let machine = self.machines.get_mut(&id)?;
        let (transition, session) = machine.start_transfer().ok()?;
        let token = session.token();
        let manifest = machine.request().file_manifest.clone();
        self.after_transition(id, transition);
        Some((token, manifest))
    }

    async fn cancel(&mut self, id: DropId) -> Result<()> {
        let Some(machine) = self.machines.get_mut(&id) else {
            return match self.retired.get(&id) {
                Some(DropState::Cancelled) => Ok(()),
                Some(state) => Err(DropError::InvalidState {
                    id,
                    state: *state,
                    action: "cancel",
                }),
                None => Err(DropError::NotFound(id)),
            };
        };
        let peer = machine.request().counterpart().clone();
        match machine.cancel()? {
            CancelOutcome::Cancelled(transition) => {
                self.after_transition(id, transition);
                self.send_best_effort(&peer, DropMessage::Cancel { id }).await;
            }
            CancelOutcome::Deferred => {
                info!(%id, "stopping transfer");
                self.send_best_effort(&peer, DropMessage::Cancel { id }).await;
            }
            CancelOutcome::AlreadyRequested | CancelOutcome::AlreadyCancelled => {}
        }
        Ok(())
    }

    async fn on_inbound(&mut self, inbound: InboundMessage) {
        let InboundMessage { from, message } = inbound;
        if let DropMessage::RequestDrop {
            id,
            manifest,
            sender_peer_id,
        } = message
        {
            self.on_request(from, id, manifest, sender_peer_id);
            return;
        }

        let Some(id) = message.drop_id() else {
            return;
        };
        let Some(machine) = self.machines.get_mut(&id) else {
            debug!(%id, peer = %from, kind = message.kind(), "message for unknown drop dropped");
            return;
        };
        if machine.request().counterpart() != &from {
            warn!(%id, peer = %from, kind = message.kind(), "message from a stranger dropped");
            return;
        }
        let role = machine.role();
        let state = machine.state();

        match message {
            DropMessage::Accept {
                destination_ack, ..
            } => match (role, state) {
                (DropRole::Sender, DropState::Pending) => {
                    info!(%id, peer = %from, destination = %destination_ack, "drop accepted");
                    if self.apply(id, |m| m.accept(None)).is_ok() {
                        self.start_sending(id, from).await;
                    }
                }
                (DropRole::Sender, state) if state.is_terminal() => {
                    info!(%id, ?state, "late acceptance dropped");
                    self.send_best_effort(&from, DropMessage::Cancel { id }).await;
                }
                _ => debug!(%id, ?state, "acceptance ignored"),
            },
            DropMessage::Decline { .. } => {
                if state == DropState::Pending {
                    let _ = self.apply(id, |m| m.transition(DropState::Declined));
                } else {
                    debug!(%id, ?state, "decline ignored");
                }
            }
            DropMessage::Cancel { .. } => match machine.cancel() {
                Ok(CancelOutcome::Cancelled(transition)) => {
                    info!(%id, peer = %from, "cancelled by peer");
                    self.after_transition(id, transition);
                }
                Ok(_) => {}
                Err(_) => debug!(%id, ?state, "cancel ignored"),
            },
            DropMessage::Progress {
                bytes_transferred, ..
            } => {
                if role != DropRole::Sender {
                    return;
                }
                if machine.acknowledge_progress(bytes_transferred).is_some() {
                    let request = machine.request().clone();
                    self.publish(&request);
                    self.subscribers.progress(&request);
                    self.rearm_stall(id);
                }
            }
            DropMessage::Complete { .. } => {
                if role == DropRole::Sender && state == DropState::InProgress {
                    let _ = self.apply(id, |m| m.transition(DropState::Completed));
                } else {
                    debug!(%id, ?state, "completion ignored");
                }
            }
            DropMessage::Fail { reason, .. } => {
                if state.is_terminal() {
                    debug!(%id, ?state, "failure ignored");
                } else {
                    warn!(%id, peer = %from, "peer failed the drop: {reason}");
                    self.fail(id, reason);
                }
            }
            other => debug!(%id, kind = other.kind(), "unexpected control message"),
        }
    }

    fn on_request(
        &mut self,
        from: PeerId,
        id: DropId,
        manifest: FileManifest,
        sender_peer_id: PeerId,
    ) {
        if sender_peer_id != from {
            warn!(%id, peer = %from, claimed = %sender_peer_id, "request on behalf of another peer dropped");
            return;
        }
        if self.machines.contains_key(&id) || self.retired.contains_key(&id) {
            debug!(%id, peer = %from, "duplicate request ignored");
            return;
        }
        if manifest.is_empty() {
            warn!(%id, peer = %from, "request without files dropped");
            return;
        }
        if checked_manifest_size(&manifest).is_none() {
            warn!(%id, peer = %from, "request larger than u64::MAX bytes dropped");
            return;
        }

        info!(%id, peer = %from, files = manifest.len(), "incoming drop");
        let request = DropRequest::incoming(id, from, self.local.clone(), manifest);
        self.insert(DropMachine::new(request));
        self.arm_expiry(id);
    }

    async fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Expire { id, handle } => {
                let Some(machine) = self.machines.get_mut(&id) else {
                    return;
                };
                if !machine.expiry_is_current(handle) {
                    debug!(%id, %handle, "stale expiry ignored");
                    return;
                }
                machine.timers_mut().expiry = None;
                let _ = self.apply(id, |m| m.transition(DropState::Expired));
            }
            TimerEvent::Stall { id, handle } => {
                let Some(machine) = self.machines.get_mut(&id) else {
                    return;
                };
                if machine.state() != DropState::InProgress
                    || machine.timers().stall != Some(handle)
                {
                    return;
                }
                machine.timers_mut().stall = None;
                let peer = machine.request().counterpart().clone();
                let reason = FailureReason::NetworkError(
                    "the receiver never confirmed the transfer".to_string(),
                );
                self.fail(id, reason.clone());
                self.send_fail(id, &peer, reason).await;
            }
            TimerEvent::Evict { id, handle } => {
                let evict = self.machines.get(&id).is_some_and(|m| {
                    m.is_terminal() && m.timers().eviction == Some(handle)
                });
                if !evict {
                    return;
                }
                if let Some(machine) = self.machines.remove(&id) {
                    debug!(%id, state = ?machine.state(), "drop evicted");
                    self.retired.insert(id, machine.state());
                    self.write().requests.remove(&id);
                }
            }
        }
    }

    async fn on_session(&mut self, report: SessionReport) {
        match report {
            SessionReport::Progress {
                id,
                file_index,
                file_bytes,
            } => {
                let Some(machine) = self.machines.get_mut(&id) else {
                    return;
                };
                let Some(total) = machine.record_progress(file_index, file_bytes)
                else {
                    return;
                };
                let request = machine.request().clone();
                self.publish(&request);
                self.subscribers.progress(&request);
                if request.role == DropRole::Receiver {
                    let progress = DropMessage::Progress {
                        id,
                        bytes_transferred: total,
                    };
                    self.send_best_effort(&request.sender_peer_id, progress)
                        .await;
                }
            }
            SessionReport::Finished { id, outcome } => {
                let Some(machine) = self.machines.get_mut(&id) else {
                    return;
                };
                let cancel_requested = machine
                    .session()
                    .is_some_and(|s| s.cancel_requested());
                if let Some(session) = machine.session_mut() {
                    session.mark_finished();
                }
                if machine.is_terminal() {
                    debug!(%id, ?outcome, "late session report ignored");
                    return;
                }
                let peer = machine.request().counterpart().clone();

                match outcome {
                    SessionOutcome::Streamed if cancel_requested => {
                        let _ = self.apply(id, |m| m.transition(DropState::Cancelled));
                    }
                    SessionOutcome::Streamed => self.arm_stall(id),
                    SessionOutcome::Completed { files } => {
                        info!(%id, files = files.len(), "drop received");
                        if self
                            .apply(id, |m| m.transition(DropState::Completed))
                            .is_ok()
                        {
                            self.send_best_effort(&peer, DropMessage::Complete { id })
                                .await;
                        }
                    }
                    SessionOutcome::Cancelled => {
                        let _ = self.apply(id, |m| m.transition(DropState::Cancelled));
                    }
                    SessionOutcome::Failed(reason) => {
                        warn!(%id, "transfer failed: {reason}");
                        self.fail(id, reason.clone());
                        self.send_fail(id, &peer, reason).await;
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let unfinished: Vec<DropId> = self
            .machines
            .values()
            .filter(|m| !m.is_terminal())
            .map(|m| m.id())
            .collect();
        for id in unfinished {
            let Ok(transition) = self.apply(id, |m| m.transition(DropState::Cancelled))
            else {
                continue;
            };
            debug!(%id, from = ?transition.previous, "cancelled on shutdown");
            if let Some(peer) = self.machines.get(&id).map(|m| m.request().counterpart().clone()) {
                self.send_best_effort(&peer, DropMessage::Cancel { id }).await;
            }
        }
        self.scheduler.cancel_all();
    }

    fn insert(&mut self, machine: DropMachine) {
        let request = machine.request().clone();
        self.machines.insert(request.id, machine);
        self.publish(&request);
        self.subscribers.state(None, &request);
    }

    fn apply<F>(&mut self, id: DropId, change: F) -> Result<Transition>
    where
        F: FnOnce(&mut DropMachine) -> Result<Transition>,
    {
        let machine = self.machines.get_mut(&id).ok_or(DropError::NotFound(id))?;
        let transition = change(machine)?;
        self.after_transition(id, transition);
        Ok(transition)
    }

    fn fail(&mut self, id: DropId, reason: FailureReason) {
        if let Err(e) = self.apply(id, |m| m.fail(reason)) {
            debug!(%id, "failure not recorded: {e}");
        }
    }

    /// Side effects of a state change: timers, data channel, snapshot and
    /// subscribers.
    fn after_transition(&mut self, id: DropId, transition: Transition) {
        let Some(machine) = self.machines.get_mut(&id) else {
            return;
        };
        if transition.previous == DropState::Pending {
            if let Some(handle) = machine.timers_mut().expiry.take() {
                self.scheduler.cancel(handle);
            }
        }
        if transition.state.is_terminal() {
            if let Some(handle) = machine.timers_mut().stall.take() {
                self.scheduler.cancel(handle);
            }
            if machine.role() == DropRole::Receiver
                && matches!(
                    transition.previous,
                    DropState::Accepted | DropState::InProgress
                )
            {
                self.transport
                    .close_data_channel(machine.request().counterpart(), id);
            }
            let handle = self
                .scheduler
                .schedule_with(self.config.terminal_grace(), move |handle| {
                    Command::Timer(TimerEvent::Evict { id, handle })
                });
            machine.timers_mut().eviction = Some(handle);
            info!(%id, state = ?transition.state, "{}", machine.request().status_message());
        } else {
            debug!(%id, from = ?transition.previous, to = ?transition.state, "transition");
        }

        let request = machine.request().clone();
        self.publish(&request);
        self.subscribers.state(Some(transition.previous), &request);
    }

    fn arm_expiry(&mut self, id: DropId) {
        let handle = self
            .scheduler
            .schedule_with(self.config.pending_timeout(), move |handle| {
                Command::Timer(TimerEvent::Expire { id, handle })
            });
        if let Some(machine) = self.machines.get_mut(&id) {
            machine.timers_mut().expiry = Some(handle);
        }
    }

    fn arm_stall(&mut self, id: DropId) {
        let handle = self
            .scheduler
            .schedule_with(self.config.transfer_idle_timeout(), move |handle| {
                Command::Timer(TimerEvent::Stall { id, handle })
            });
        if let Some(machine) = self.machines.get_mut(&id) {
            if let Some(previous) = machine.timers_mut().stall.replace(handle) {
                self.scheduler.cancel(previous);
            }
        }
    }

    fn rearm_stall(&mut self, id: DropId) {
        let armed = self
            .machines
            .get(&id)
            .is_some_and(|m| m.timers().stall.is_some());
        if armed {
            self.arm_stall(id);
        }
    }

    fn addresses(&self, peer: &PeerId) -> Vec<String> {
        self.registry
            .get(peer)
            .map(|p| p.addresses)
            .unwrap_or_default()
    }

    async fn send(
        &self,
        peer: &PeerId,
        message: DropMessage,
    ) -> std::result::Result<(), TransportError> {
        let addresses = self.addresses(peer);
        tokio::time::timeout(
            self.config.send_timeout(),
            self.transport.send(peer, &addresses, message),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout))
    }

    /// Sends a message whose loss only matters to the peer.
    async fn send_best_effort(&self, peer: &PeerId, message: DropMessage) {
        let kind = message.kind();
        if let Err(e) = self.send(peer, message).await {
            debug!(peer = %peer, kind, "not delivered: {e}");
        }
    }

    async fn send_fail(&self, id: DropId, peer: &PeerId, reason: FailureReason) {
        self.send_best_effort(peer, DropMessage::Fail { id, reason })
            .await;
    }

    fn publish(&self, request: &DropRequest) {
        self.write().requests.insert(request.id, request.clone());
    }

    fn publish_peers(&self) {
        self.write().peers = self.registry.list();
    }

    fn flush_peers(&mut self) {
        if std::mem::take(&mut self.peers_dirty) {
            self.subscribers.peers(&self.registry.list());
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(|p| p.into_inner())
    }
}
