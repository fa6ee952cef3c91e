use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{DropError, Result};

/// Tunables of a drop coordinator.
///
/// Every field has a default, so a TOML file only needs to list what it
/// overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropConfig {
    /// How long a request may stay `Pending` before it expires.
    pub pending_timeout_ms: u64,
    /// How long a terminal request stays queryable before eviction.
    pub terminal_grace_ms: u64,
    /// Upper bound on handing one control message to the transport.
    pub send_timeout_ms: u64,
    /// A transfer that sees no data for this long fails.
    pub transfer_idle_timeout_ms: u64,
    pub chunk_size: u64,
    /// Capacity of the coordinator queue and of each data channel.
    pub channel_capacity: usize,
    pub verify_checksums: bool,
}
impl Default for DropConfig {
    fn default() -> Self {
        Self {
            pending_timeout_ms: 60_000,
            terminal_grace_ms: 10_000,
            send_timeout_ms: 10_000,
            transfer_idle_timeout_ms: 30_000,
            chunk_size: 65536,    // 64KB chunks
            channel_capacity: 64, // 4MB in flight per drop
            verify_checksums: true,
        }
    }
}
impl DropConfig {
    pub fn balanced() -> Self {
        Self::default()
    }

    pub fn high_performance() -> Self {
        Self {
            chunk_size: 1048576,   // 1MB chunks
            channel_capacity: 128, // 128MB in flight per drop
            verify_checksums: false,
            ..Self::default()
        }
    }

    pub fn low_bandwidth() -> Self {
        Self {
            send_timeout_ms: 30_000,
            transfer_idle_timeout_ms: 120_000,
            chunk_size: 16384, // 16KB chunks
            channel_capacity: 16,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        return Ok(config);
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DropError::Config(format!("{}: {}", path.display(), e))
        })?;
        return Self::from_toml_str(&content);
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(DropError::Config("chunk_size must be positive".into()));
        }
        // A chunk must fit in one frame together with its routing fields.
        if self.chunk_size as usize + 1024 > arkdropx_common::MAX_FRAME_LEN {
            return Err(DropError::Config(format!(
                "chunk_size {} exceeds the frame limit",
                self.chunk_size
            )));
        }
        if self.channel_capacity == 0 {
            return Err(DropError::Config(
                "channel_capacity must be positive".into(),
            ));
        }
        return Ok(());
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_millis(self.terminal_grace_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn transfer_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_idle_timeout_ms)
    }
}
