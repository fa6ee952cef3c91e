//! Messages exchanged between two drop coordinators.
//!
//! Control messages (`RequestDrop` .. `Fail`) are routed to the coordinator
//! and drive the state machines on both sides. Data messages (`Chunk`,
//! `FileEnd`) belong to the data channel of an accepted drop and are
//! demultiplexed by the transport straight to the transfer session.
//!
//! Every message is safe to receive more than once: the receiving state
//! machine ignores anything that does not match its current state.

use arkdrop_entities::{DropId, FailureReason, FileManifest, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropMessage {
    /// First frame on every connection; identifies the dialing node.
    Hello {
        peer_id: PeerId,
        display_name: String,
    },
    /// Sender → receiver: a new drop offer.
    RequestDrop {
        id: DropId,
        manifest: FileManifest,
        sender_peer_id: PeerId,
    },
    /// Receiver → sender: the user accepted. `destination_ack` is a
    /// display-only hint of where the files will land.
    Accept { id: DropId, destination_ack: String },
    /// Either direction while the request is pending.
    Decline { id: DropId },
    /// Either direction, any non-terminal state.
    Cancel { id: DropId },
    /// Receiver → sender: bytes written so far.
    Progress { id: DropId, bytes_transferred: u64 },
    /// Receiver → sender: every file arrived and verified.
    Complete { id: DropId },
    /// Either direction: the transfer failed for `reason`.
    Fail { id: DropId, reason: FailureReason },
    /// Sender → receiver, data channel: the next slice of file `file_index`.
    Chunk {
        id: DropId,
        file_index: u32,
        data: Vec<u8>,
    },
    /// Sender → receiver, data channel: file `file_index` is complete.
    /// `checksum` is the CRC-32 of the whole file.
    FileEnd {
        id: DropId,
        file_index: u32,
        checksum: u32,
    },
}

impl DropMessage {
    /// The drop this message refers to, `None` for connection-level messages.
    pub fn drop_id(&self) -> Option<DropId> {
        match self {
            DropMessage::Hello { .. } => None,
            DropMessage::RequestDrop { id, .. }
            | DropMessage::Accept { id, .. }
            | DropMessage::Decline { id }
            | DropMessage::Cancel { id }
            | DropMessage::Progress { id, .. }
            | DropMessage::Complete { id }
            | DropMessage::Fail { id, .. }
            | DropMessage::Chunk { id, .. }
            | DropMessage::FileEnd { id, .. } => Some(*id),
        }
    }

    /// True for frames that travel on a data channel.
    pub fn is_data(&self) -> bool {
        matches!(self, DropMessage::Chunk { .. } | DropMessage::FileEnd { .. })
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DropMessage::Hello { .. } => "Hello",
            DropMessage::RequestDrop { .. } => "RequestDrop",
            DropMessage::Accept { .. } => "Accept",
            DropMessage::Decline { .. } => "Decline",
            DropMessage::Cancel { .. } => "Cancel",
            DropMessage::Progress { .. } => "Progress",
            DropMessage::Complete { .. } => "Complete",
            DropMessage::Fail { .. } => "Fail",
            DropMessage::Chunk { .. } => "Chunk",
            DropMessage::FileEnd { .. } => "FileEnd",
        }
    }
}

/// Payload of a data-channel frame, after the transport stripped the
/// routing fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataFrame {
    Chunk { file_index: u32, data: Vec<u8> },
    FileEnd { file_index: u32, checksum: u32 },
}

impl DataFrame {
    /// Splits a data message into its drop id and payload. Control messages
    /// are handed back unchanged.
    pub fn split(
        message: DropMessage,
    ) -> Result<(DropId, DataFrame), DropMessage> {
        match message {
            DropMessage::Chunk {
                id,
                file_index,
                data,
            } => Ok((id, DataFrame::Chunk { file_index, data })),
            DropMessage::FileEnd {
                id,
                file_index,
                checksum,
            } => Ok((
                id,
                DataFrame::FileEnd {
                    file_index,
                    checksum,
                },
            )),
            other => Err(other),
        }
    }

    pub fn into_message(self, id: DropId) -> DropMessage {
        match self {
            DataFrame::Chunk { file_index, data } => DropMessage::Chunk {
                id,
                file_index,
                data,
            },
            DataFrame::FileEnd {
                file_index,
                checksum,
            } => DropMessage::FileEnd {
                id,
                file_index,
                checksum,
            },
        }
    }
}
