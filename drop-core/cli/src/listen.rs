use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use arkdrop_core::{
    Coordinator, CoordinatorHandle, Decision, DropRole, DropState,
    DropStateEvent, FsFileStore, TcpTransport,
};
use arkdrop_entities::manifest_size;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tracing::{info, warn};

use crate::{config::CliConfig, progress::TransferProgress};

pub const DEFAULT_PORT: u16 = 4242;

#[derive(Clone, Debug)]
pub struct ListenOptions {
    pub port: u16,
    pub name: Option<String>,
    pub dir: Option<PathBuf>,
    pub auto_accept: bool,
}

/// Waits for incoming drops until Ctrl+C, asking before accepting each one
/// unless `auto_accept` is set.
pub async fn run_listen(options: ListenOptions) -> Result<()> {
    let mut config = CliConfig::load()?;
    let local_id = config.peer_id()?;
    let name = options.name.clone().unwrap_or_else(|| config.display_name());
    let dir = options.dir.clone().unwrap_or_else(|| config.receive_dir());
    fs::create_dir_all(&dir).with_context(|| {
        format!("Failed to create output directory: {}", dir.display())
    })?;

    let (transport, inbound) = TcpTransport::bind(
        local_id.clone(),
        name.clone(),
        ("0.0.0.0", options.port),
        config.drop.channel_capacity,
    )
    .await
    .with_context(|| format!("Failed to listen on port {}", options.port))?;
    let addr = transport.local_addr();
    let coordinator = Coordinator::start(
        config.drop.clone(),
        transport,
        inbound,
        Arc::new(FsFileStore::new()),
    )?;

    let (progress, mut events) = TransferProgress::new("arkdrop-listen");
    let progress = Arc::new(progress);
    coordinator.subscribe(progress.clone());

    println!("Listening on {addr} as {name} ({local_id})");
    println!("Files will be saved to: {}", dir.display());
    info!(%addr, peer = %local_id, "listening");

    let mut stdin = BufReader::new(tokio::io::stdin());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                on_event(&coordinator, &progress, &options, &dir, &mut stdin, event).await;
            }
        }
    }

    println!("Shutting down...");
    coordinator.shutdown().await?;
    Ok(())
}

async fn on_event(
    coordinator: &CoordinatorHandle,
    progress: &TransferProgress,
    options: &ListenOptions,
    dir: &Path,
    stdin: &mut BufReader<Stdin>,
    event: DropStateEvent,
) {
    if event.role != DropRole::Receiver {
        return;
    }
    let request = &event.request;
    match event.state {
        DropState::Pending => {
            progress.println(format!(
                "Incoming drop from {}: {} file(s), {} bytes",
                request.sender_peer_id,
                request.file_manifest.len(),
                manifest_size(&request.file_manifest),
            ));
            for entry in &request.file_manifest {
                progress.println(format!("  {} ({} bytes)", entry.name, entry.size));
            }

            let accept = options.auto_accept || ask(stdin).await;
            let decision = if accept {
                Decision::Accept {
                    destination: dir.to_path_buf(),
                }
            } else {
                Decision::Decline
            };
            if let Err(e) = coordinator.respond_to_drop(event.id, decision).await {
                warn!(id = %event.id, "could not answer: {e}");
            }
        }
        DropState::Completed => {
            progress.println(format!(
                "Received {} file(s) into {}",
                request.file_manifest.len(),
                dir.display()
            ));
        }
        state if state.is_terminal() => {
            progress.println(request.status_message());
        }
        _ => {}
    }
}

async fn ask(stdin: &mut BufReader<Stdin>) -> bool {
    loop {
        print!("Accept? [y/n] > ");
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let mut line = String::new();
        match stdin.read_line(&mut line).await {
            Ok(0) | Err(_) => return false,
            Ok(_) => {}
        }
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" | "accept" => return true,
            "n" | "no" | "decline" => return false,
            _ => println!("Please answer 'y' or 'n'."),
        }
    }
}
