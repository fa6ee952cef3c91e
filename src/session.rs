//! The byte-moving half of an `InProgress` drop.
//!
//! A [`TransferSession`] is the bookkeeping a state machine keeps while its
//! transfer runs: a cancellation token and progress counters. The transfer
//! itself runs in a spawned task ([`send_files`] or [`receive_files`]) that
//! talks back to the coordinator only through a [`Reporter`].
//!
//! Cancellation is cooperative: the token is checked before every chunk and
//! raced against every wait, so a cancelled transfer stops at the next chunk
//! boundary. A receiver that stops for any reason other than success aborts
//! the file it was writing, which removes the partial data.

use std::{path::PathBuf, sync::Arc, time::Duration};

use arkdrop_entities::{Data, DropId, FailureReason, ManifestEntry};
use arkdropx_common::DataFrame;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::DropConfig,
    files::{FileStore, FileWriter},
    transport::{DataReceiver, DataSender},
};

/// How a transfer task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Sender: every chunk was handed to the transport. The drop completes
    /// when the receiver confirms.
    Streamed,
    /// Receiver: every file arrived, was verified and committed.
    Completed { files: Vec<PathBuf> },
    Cancelled,
    Failed(FailureReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionReport {
    Progress {
        id: DropId,
        file_index: usize,
        file_bytes: u64,
    },
    Finished {
        id: DropId,
        outcome: SessionOutcome,
    },
}

/// A transfer task's line back to whoever owns the drop.
pub struct Reporter<C> {
    id: DropId,
    sink: mpsc::Sender<C>,
}

impl<C: From<SessionReport> + Send> Reporter<C> {
    pub fn new(id: DropId, sink: mpsc::Sender<C>) -> Self {
        Self { id, sink }
    }

    async fn progress(&self, file_index: usize, file_bytes: u64) {
        let report = SessionReport::Progress {
            id: self.id,
            file_index,
            file_bytes,
        };
        let _ = self.sink.send(report.into()).await;
    }

    async fn finish(self, outcome: SessionOutcome) {
        let report = SessionReport::Finished {
            id: self.id,
            outcome,
        };
        if self.sink.send(report.into()).await.is_err() {
            debug!(id = %self.id, "owner gone before the session finished");
        }
    }
}

/// Per-drop transfer bookkeeping, owned by the drop's state machine.
#[derive(Debug)]
pub struct TransferSession {
    token: CancellationToken,
    file_bytes: Vec<u64>,
    acknowledged: u64,
    running: bool,
    cancel_requested: bool,
}

impl TransferSession {
    pub fn new(files: usize) -> Self {
        Self {
            token: CancellationToken::new(),
            file_bytes: vec![0; files],
            acknowledged: 0,
            running: true,
            cancel_requested: false,
        }
    }

    /// Token handed to the transfer task.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Records that file `file_index` has `file_bytes` bytes so far and
    /// returns the overall total.
    pub fn record(&mut self, file_index: usize, file_bytes: u64) -> u64 {
        if let Some(slot) = self.file_bytes.get_mut(file_index) {
            *slot = (*slot).max(file_bytes);
        }
        self.total()
    }

    /// Records a total confirmed by the remote side. Never moves backwards.
    pub fn acknowledge(&mut self, total: u64) -> u64 {
        self.acknowledged = self.acknowledged.max(total);
        self.acknowledged
    }

    pub fn total(&self) -> u64 {
        self.file_bytes
            .iter()
            .fold(0u64, |total, bytes| total.saturating_add(*bytes))
            .max(self.acknowledged)
    }

    pub fn file_bytes(&self) -> &[u64] {
        &self.file_bytes
    }

    /// Whether the transfer task is still running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn mark_finished(&mut self) {
        self.running = false;
    }

    /// Asks the transfer task to stop. Returns `false` if that was already
    /// asked.
    pub fn request_cancel(&mut self) -> bool {
        self.token.cancel();
        !std::mem::replace(&mut self.cancel_requested, true)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Stops the task without recording a user cancellation.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub chunk_size: u64,
    pub idle_timeout: Duration,
    pub verify_checksums: bool,
}

impl From<&DropConfig> for SessionSettings {
    fn from(config: &DropConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            idle_timeout: config.transfer_idle_timeout(),
            verify_checksums: config.verify_checksums,
        }
    }
}

/// Streams every file of `manifest` into `channel`, in order.
pub async fn send_files<C: From<SessionReport> + Send>(
    settings: SessionSettings,
    token: CancellationToken,
    store: Arc<dyn FileStore>,
    manifest: Vec<ManifestEntry>,
    channel: DataSender,
    reporter: Reporter<C>,
) {
    let id = channel.id();
    let outcome =
        match stream_files(&settings, &token, store.as_ref(), &manifest, &channel)
            .await
        {
            Ok(()) => {
                info!(%id, files = manifest.len(), "all files streamed");
                SessionOutcome::Streamed
            }
            Err(outcome) => outcome,
        };
    reporter.finish(outcome).await;
}

async fn stream_files(
    settings: &SessionSettings,
    token: &CancellationToken,
    store: &dyn FileStore,
    manifest: &[ManifestEntry],
    channel: &DataSender,
) -> Result<(), SessionOutcome> {
    for (index, entry) in manifest.iter().enumerate() {
        let data = store.open(entry).map_err(|e| {
            warn!(file = %entry.name, "cannot open source: {e}");
            SessionOutcome::Failed(FailureReason::IoError(e.to_string()))
        })?;
        stream_file(settings, token, index, entry, data.as_ref(), channel)
            .await?;
    }
    Ok(())
}

async fn stream_file(
    settings: &SessionSettings,
    token: &CancellationToken,
    index: usize,
    entry: &ManifestEntry,
    data: &dyn Data,
    channel: &DataSender,
) -> Result<(), SessionOutcome> {
    let file_index = index as u32;
    let mut hasher = crc32fast::Hasher::new();
    let mut sent = 0u64;

    loop {
        if token.is_cancelled() {
            return Err(SessionOutcome::Cancelled);
        }
        let chunk = data.read_chunk(settings.chunk_size).map_err(|e| {
            SessionOutcome::Failed(FailureReason::IoError(e.to_string()))
        })?;
        if chunk.is_empty() {
            break;
        }
        sent += chunk.len() as u64;
        if sent > entry.size {
            return Err(size_changed(entry));
        }
        hasher.update(&chunk);
        deliver(
            settings,
            token,
            channel,
            DataFrame::Chunk {
                file_index,
                data: chunk,
            },
        )
        .await?;
    }

    if sent != entry.size {
        return Err(size_changed(entry));
    }
    let checksum = hasher.finalize();
    debug!(file = %entry.name, bytes = sent, checksum, "file streamed");
    deliver(
        settings,
        token,
        channel,
        DataFrame::FileEnd {
            file_index,
            checksum,
        },
    )
    .await
}

async fn deliver(
    settings: &SessionSettings,
    token: &CancellationToken,
    channel: &DataSender,
    frame: DataFrame,
) -> Result<(), SessionOutcome> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SessionOutcome::Cancelled),
        sent = timeout(settings.idle_timeout, channel.send(frame)) => match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionOutcome::Failed(e.failure_reason())),
            Err(_) => Err(SessionOutcome::Failed(FailureReason::NetworkError(
                "the receiver stopped reading".to_string(),
            ))),
        },
    }
}

fn size_changed(entry: &ManifestEntry) -> SessionOutcome {
    SessionOutcome::Failed(FailureReason::IoError(format!(
        "{} no longer has the announced size of {} bytes",
        entry.name, entry.size
    )))
}

/// Receives every file of `manifest` from `channel` into `destination`.
pub async fn receive_files<C: From<SessionReport> + Send>(
    settings: SessionSettings,
    token: CancellationToken,
    store: Arc<dyn FileStore>,
    destination: PathBuf,
    manifest: Vec<ManifestEntry>,
    mut channel: DataReceiver,
    reporter: Reporter<C>,
) {
    let id = channel.id();
    let mut files = Vec::with_capacity(manifest.len());
    let mut outcome = None;
    for (index, entry) in manifest.iter().enumerate() {
        let writer = match store.create(&destination, entry) {
            Ok(writer) => writer,
            Err(e) => {
                warn!(%id, file = %entry.name, "cannot create file: {e}");
                outcome = Some(SessionOutcome::Failed(FailureReason::IoError(
                    e.to_string(),
                )));
                break;
            }
        };
        match receive_file(
            &settings,
            &token,
            index,
            entry,
            writer,
            &mut channel,
            &reporter,
        )
        .await
        {
            Ok(path) => files.push(path),
            Err(stopped) => {
                outcome = Some(stopped);
                break;
            }
        }
    }

    let outcome = outcome.unwrap_or_else(|| {
        info!(%id, files = files.len(), "all files received");
        SessionOutcome::Completed { files }
    });
    reporter.finish(outcome).await;
}

async fn receive_file<C: From<SessionReport> + Send>(
    settings: &SessionSettings,
    token: &CancellationToken,
    index: usize,
    entry: &ManifestEntry,
    mut writer: Box<dyn FileWriter>,
    channel: &mut DataReceiver,
    reporter: &Reporter<C>,
) -> Result<PathBuf, SessionOutcome> {
    let mut hasher = crc32fast::Hasher::new();
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => {
                writer.abort();
                return Err(SessionOutcome::Cancelled);
            }
            frame = timeout(settings.idle_timeout, channel.recv()) => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                writer.abort();
                return Err(network_failure("the data channel closed"));
            }
            Err(_) => {
                writer.abort();
                return Err(network_failure("the sender stopped sending"));
            }
        };

        match frame {
            DataFrame::Chunk { file_index, data } => {
                if file_index as usize != index {
                    writer.abort();
                    return Err(network_failure("chunk for an unexpected file"));
                }
                if writer.written().saturating_add(data.len() as u64) > entry.size {
                    writer.abort();
                    return Err(network_failure(&format!(
                        "{} is larger than announced",
                        entry.name
                    )));
                }
                if let Err(e) = writer.write_chunk(&data) {
                    writer.abort();
                    return Err(SessionOutcome::Failed(FailureReason::IoError(
                        e.to_string(),
                    )));
                }
                hasher.update(&data);
                reporter.progress(index, writer.written()).await;
            }
            DataFrame::FileEnd {
                file_index,
                checksum,
            } => {
                if file_index as usize != index {
                    writer.abort();
                    return Err(network_failure("end of an unexpected file"));
                }
                let written = writer.written();
                if written != entry.size {
                    writer.abort();
                    return Err(network_failure(&format!(
                        "{} is {written} bytes, expected {}",
                        entry.name, entry.size
                    )));
                }
                if settings.verify_checksums && hasher.finalize() != checksum {
                    writer.abort();
                    return Err(network_failure(&format!(
                        "checksum mismatch for {}",
                        entry.name
                    )));
                }
                if entry.size == 0 {
                    reporter.progress(index, 0).await;
                }
                return writer.commit().map_err(|e| {
                    SessionOutcome::Failed(FailureReason::IoError(e.to_string()))
                });
            }
        }
    }
}

fn network_failure(message: &str) -> SessionOutcome {
    SessionOutcome::Failed(FailureReason::NetworkError(message.to_string()))
}
