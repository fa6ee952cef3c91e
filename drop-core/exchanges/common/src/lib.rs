//! Wire format shared by every ARK Drop transport.
//!
//! - [`message`]: the logical messages two coordinators exchange, including
//!   the data-channel frames of an accepted drop.
//! - [`frame`]: length-prefixed bincode framing used by stream transports.

pub mod frame;
pub mod message;

pub use frame::{FrameError, MAX_FRAME_LEN, read_frame, write_frame};
pub use message::{DataFrame, DropMessage};
