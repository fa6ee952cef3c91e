use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use arkdrop_core::{
    Coordinator, DropState, FsFileStore, TcpTransport, transport::probe,
};
use arkdrop_entities::{FileManifest, ManifestEntry, PeerMetadata, manifest_size};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{config::CliConfig, progress::TransferProgress};

/// Offers `paths` to the node listening on `addr` and waits for the drop to
/// finish. Directories are sent with their structure below the directory
/// itself.
///
/// Errors:
/// - If a path is missing or the list holds no files.
/// - If the receiver cannot be reached.
/// - If the drop ends in any state other than `Completed`.
pub async fn run_send(
    addr: String,
    paths: Vec<PathBuf>,
    name: Option<String>,
) -> Result<()> {
    let manifest = collect_manifest(&paths)?;
    let mut config = CliConfig::load()?;
    let local_id = config.peer_id()?;
    let display_name = name.unwrap_or_else(|| config.display_name());

    let (receiver_id, receiver_name) = probe(&addr)
        .await
        .with_context(|| format!("Failed to reach a receiver at {addr}"))?;
    info!(peer = %receiver_id, name = %receiver_name, "receiver found");

    let (transport, inbound) = TcpTransport::bind(
        local_id,
        display_name,
        "0.0.0.0:0",
        config.drop.channel_capacity,
    )
    .await
    .context("Failed to open a local endpoint")?;
    let coordinator = Coordinator::start(
        config.drop.clone(),
        transport,
        inbound,
        Arc::new(FsFileStore::new()),
    )?;

    let (progress, mut events) = TransferProgress::new("arkdrop-send");
    let progress = Arc::new(progress);
    coordinator.subscribe(progress.clone());

    coordinator
        .upsert_peer(PeerMetadata::new(
            receiver_id.clone(),
            receiver_name.clone(),
            vec![addr],
        ))
        .await?;
    let id = coordinator
        .initiate_drop(receiver_id, manifest.clone())
        .await?;
    progress.println(format!(
        "Offering {} file(s), {} bytes, to {receiver_name}. Waiting for an answer...",
        manifest.len(),
        manifest_size(&manifest),
    ));

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                progress.println("Cancelling file transfer...");
                coordinator.cancel_drop(id).await?;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("The drop service stopped unexpectedly");
                };
                if event.id != id {
                    continue;
                }
                debug!(%id, state = ?event.state, "drop state");
                if event.state.is_terminal() {
                    break event.request;
                }
            }
        }
    };
    coordinator.shutdown().await?;

    match outcome.state {
        DropState::Completed => {
            println!("All files sent successfully!");
            Ok(())
        }
        _ => Err(anyhow!(outcome.status_message())),
    }
}

/// Turns files and directories into manifest entries, in argument order.
pub fn collect_manifest(paths: &[PathBuf]) -> Result<FileManifest> {
    let mut manifest = FileManifest::new();
    for path in paths {
        if !path.exists() {
            bail!("File does not exist: {}", path.display());
        }
        if path.is_dir() {
            let root = path.parent().unwrap_or(Path::new(""));
            let mut files: Vec<PathBuf> = WalkDir::new(path)
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect();
            files.sort();
            for file in files {
                let relative = pathdiff::diff_paths(&file, root)
                    .ok_or_else(|| anyhow!("Invalid file name: {}", file.display()))?;
                manifest.push(entry(&file, &relative)?);
            }
        } else {
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("Invalid file name: {}", path.display()))?;
            manifest.push(entry(path, Path::new(name))?);
        }
    }

    if manifest.is_empty() {
        bail!("Cannot send an empty list of files");
    }
    Ok(manifest)
}

fn entry(path: &Path, name: &Path) -> Result<ManifestEntry> {
    let size = path
        .metadata()
        .with_context(|| format!("Failed to read {}", path.display()))?
        .len();
    let name = name
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Ok(ManifestEntry::new(path.to_string_lossy(), name, size))
}
