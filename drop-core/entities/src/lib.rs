//! Data model shared by the ARK Drop crates.
//!
//! This crate provides:
//! - `PeerId` / `PeerMetadata`: identity and reachability of a node as seen
//!   by the peer registry.
//! - `DropId`: the identifier a sender assigns to one drop request.
//! - `ManifestEntry` / `FileManifest`: the files offered in a drop.
//! - `FailureReason`: why a drop failed, shared by both sides.
//! - `Data`: a thread-safe, chunked byte source the sender streams from.
//!
//! Example:
//! ```rust
//! use arkdrop_entities::{BytesData, Data, ManifestEntry, PeerId};
//!
//! let peer = PeerId::from("bob");
//! let entry = ManifestEntry::new("/home/alice/notes.txt", "notes.txt", 5);
//! let data = BytesData::new(b"hello".to_vec());
//!
//! assert_eq!(peer.as_str(), "bob");
//! assert_eq!(entry.size, data.len());
//! assert_eq!(data.read_chunk(2).unwrap(), b"he".to_vec());
//! ```

mod data;
mod failure;
mod file;
mod peer;

pub use data::{BytesData, Data};
pub use failure::FailureReason;
pub use file::{
    FileManifest, ManifestEntry, checked_manifest_size, manifest_size,
};
pub use peer::{DropId, PeerId, PeerMetadata};
