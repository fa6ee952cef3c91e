//! Byte-source abstraction used by the sending side of a drop.
//!
//! A `Data` implementor stands for one file of a manifest, already opened by
//! the file store collaborator. The transfer session pulls it chunk by chunk
//! and checks the total against the size announced in the manifest.
//!
//! Concurrency notes:
//! - All methods take `&self` and the trait is `Send + Sync`, so implementors
//!   must synchronize their read cursor internally.
//! - Reads are consuming: each successful call advances the cursor.

use std::io;

/// A thread-safe, sequential source of bytes.
///
/// Contract:
/// - `len()` returns the total length in bytes and does not change over the
///   lifetime of the object.
/// - `read_chunk(size)` returns up to `size` bytes from the current position,
///   fewer when fewer remain, and an empty `Vec` at end-of-stream.
/// - IO failures are reported as `Err` and leave the cursor where it was.
pub trait Data: Send + Sync {
    /// Total length of the data in bytes.
    fn len(&self) -> u64;

    /// Checks if the data is empty (length is 0).
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `size` bytes from the current position.
    fn read_chunk(&self, size: u64) -> io::Result<Vec<u8>>;
}

/// `Data` backed by an in-memory buffer.
///
/// Used for small payloads and by the in-memory file store in tests.
pub struct BytesData {
    buf: Vec<u8>,
    pos: std::sync::Mutex<usize>,
}

impl BytesData {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: bytes.into(),
            pos: std::sync::Mutex::new(0),
        }
    }
}

impl Data for BytesData {
    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn read_chunk(&self, size: u64) -> io::Result<Vec<u8>> {
        let mut pos = self
            .pos
            .lock()
            .map_err(|_| io::Error::other("read cursor poisoned"))?;
        if *pos >= self.buf.len() {
            return Ok(Vec::new());
        }
        let end = (*pos).saturating_add(size as usize).min(self.buf.len());
        let chunk = self.buf[*pos..end].to_vec();
        *pos = end;
        Ok(chunk)
    }
}
