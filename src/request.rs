use std::path::PathBuf;

use arkdrop_entities::{
    DropId, FailureReason, FileManifest, PeerId, manifest_size,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a drop request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropState {
    Created,
    Pending,
    Accepted,
    InProgress,
    Declined,
    Expired,
    Cancelled,
    Completed,
    Failed,
}

impl DropState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DropState::Declined
                | DropState::Expired
                | DropState::Cancelled
                | DropState::Completed
                | DropState::Failed
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: DropState) -> bool {
        use DropState::*;
        matches!(
            (self, next),
            (Created, Pending | Failed | Cancelled)
                | (Pending, Accepted | Declined | Expired | Cancelled)
                | (Accepted, InProgress | Cancelled | Failed)
                | (InProgress, Completed | Failed | Cancelled)
        )
    }
}

/// Which end of the drop this coordinator is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropRole {
    Sender,
    Receiver,
}

/// The receiving user's answer to a pending request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Accept { destination: PathBuf },
    Decline,
}

/// A drop as one coordinator sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropRequest {
    pub id: DropId,
    pub role: DropRole,
    pub sender_peer_id: PeerId,
    pub receiver_peer_id: PeerId,
    pub file_manifest: FileManifest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: DropState,
    /// Set once on the receiver when the user accepts.
    pub destination_path: Option<PathBuf>,
    pub failure: Option<FailureReason>,
    pub bytes_transferred: u64,
}

impl DropRequest {
    pub fn outgoing(
        id: DropId,
        sender_peer_id: PeerId,
        receiver_peer_id: PeerId,
        file_manifest: FileManifest,
    ) -> Self {
        Self::new(
            id,
            DropRole::Sender,
            sender_peer_id,
            receiver_peer_id,
            file_manifest,
            DropState::Created,
        )
    }

    pub fn incoming(
        id: DropId,
        sender_peer_id: PeerId,
        receiver_peer_id: PeerId,
        file_manifest: FileManifest,
    ) -> Self {
        Self::new(
            id,
            DropRole::Receiver,
            sender_peer_id,
            receiver_peer_id,
            file_manifest,
            DropState::Pending,
        )
    }

    fn new(
        id: DropId,
        role: DropRole,
        sender_peer_id: PeerId,
        receiver_peer_id: PeerId,
        file_manifest: FileManifest,
        state: DropState,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            role,
            sender_peer_id,
            receiver_peer_id,
            file_manifest,
            created_at: now,
            updated_at: now,
            state,
            destination_path: None,
            failure: None,
            bytes_transferred: 0,
        }
    }

    /// The other end of the drop.
    pub fn counterpart(&self) -> &PeerId {
        match self.role {
            DropRole::Sender => &self.receiver_peer_id,
            DropRole::Receiver => &self.sender_peer_id,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        manifest_size(&self.file_manifest)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Human-readable outcome, for terminal and in-flight states alike.
    pub fn status_message(&self) -> String {
        match self.state {
            DropState::Created => "Preparing request".to_string(),
            DropState::Pending => match self.role {
                DropRole::Sender => "Waiting for the receiver".to_string(),
                DropRole::Receiver => "Waiting for your answer".to_string(),
            },
            DropState::Accepted => "Accepted, connecting".to_string(),
            DropState::InProgress => format!(
                "Transferring {} of {} bytes",
                self.bytes_transferred,
                self.total_bytes()
            ),
            DropState::Declined => "The drop was declined".to_string(),
            DropState::Expired => "Nobody answered in time".to_string(),
            DropState::Cancelled => "The drop was cancelled".to_string(),
            DropState::Completed => {
                format!("Transferred {} files", self.file_manifest.len())
            }
            DropState::Failed => match &self.failure {
                Some(reason) => format!("Transfer failed: {reason}"),
                None => "Transfer failed".to_string(),
            },
        }
    }
}
