//! Peer-to-peer file drops.
//!
//! A [`Coordinator`] runs one drop service per node. It keeps the registry
//! of reachable peers fed by discovery, negotiates drops with other nodes
//! over a [`Transport`] and moves the bytes of accepted drops through a
//! [`FileStore`].
//!
//! Every drop walks the same lifecycle on both ends:
//!
//! ```text
//! Created → Pending → Accepted → InProgress → Completed
//!              │          │           ├──────→ Failed
//!              │          │           └──────→ Cancelled
//!              ├→ Declined, Expired, Cancelled
//! ```
//!
//! Example, two nodes on an in-process network:
//! ```rust
//! use std::sync::Arc;
//!
//! use arkdrop_core::{
//!     Coordinator, DropConfig, MemoryFileStore, MemoryNetwork,
//!     DropState,
//! };
//! use arkdrop_entities::{ManifestEntry, PeerId, PeerMetadata};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> arkdrop_core::Result<()> {
//! let network = MemoryNetwork::new();
//! let (alice_net, alice_in) = network.join("alice", 64);
//! let (bob_net, bob_in) = network.join("bob", 64);
//!
//! let files = MemoryFileStore::new();
//! files.add_source("notes", b"hello".to_vec());
//!
//! let alice = Coordinator::start(
//!     DropConfig::default(), alice_net, alice_in, Arc::new(files.clone()),
//! )?;
//! let bob = Coordinator::start(
//!     DropConfig::default(), bob_net, bob_in, Arc::new(files),
//! )?;
//!
//! alice
//!     .upsert_peer(PeerMetadata::new(PeerId::from("bob"), "Bob", vec![]))
//!     .await?;
//! let id = alice
//!     .initiate_drop(
//!         PeerId::from("bob"),
//!         vec![ManifestEntry::new("notes", "notes.txt", 5)],
//!     )
//!     .await?;
//! assert_eq!(alice.get(id).map(|r| r.state), Some(DropState::Pending));
//! # bob.shutdown().await?;
//! # alice.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod files;
pub mod machine;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod subscriber;
pub mod transport;

pub use config::DropConfig;
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::{DropError, Result, TransportError};
pub use files::{FileStore, FileWriter, FsFileStore, MemoryFileStore};
pub use registry::PeerRegistry;
pub use request::{Decision, DropRequest, DropRole, DropState};
pub use scheduler::{TimeoutScheduler, TimerHandle};
pub use subscriber::{
    DropProgressEvent, DropStateEvent, DropSubscriber, PeersChangedEvent,
};
pub use transport::{
    DataReceiver, DataSender, InboundMessage, MemoryNetwork, MemoryTransport,
    TcpTransport, Transport,
};
