use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use arkdrop_core::{
    DropProgressEvent, DropRole, DropState, DropStateEvent, DropSubscriber,
};
use arkdrop_entities::DropId;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

/// Draws one progress bar per transfer and forwards state changes to the
/// command driving the coordinator.
pub struct TransferProgress {
    id: String,
    mp: MultiProgress,
    bars: Mutex<HashMap<DropId, ProgressBar>>,
    events: mpsc::UnboundedSender<DropStateEvent>,
}

impl TransferProgress {
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<DropStateEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let progress = Self {
            id: id.into(),
            mp: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            events,
        };
        (progress, rx)
    }

    pub fn println(&self, line: impl AsRef<str>) {
        let _ = self.mp.println(line);
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<DropId, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl DropSubscriber for TransferProgress {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn notify_state(&self, event: DropStateEvent) {
        match event.state {
            DropState::InProgress => {
                let pb = self.mp.add(ProgressBar::new(event.request.total_bytes()));
                pb.set_style(Self::bar_style());
                pb.set_message(match event.role {
                    DropRole::Sender => "Sending",
                    DropRole::Receiver => "Receiving",
                });
                self.bars().insert(event.id, pb);
            }
            state if state.is_terminal() => {
                let message = event.request.status_message();
                match self.bars().remove(&event.id) {
                    Some(pb) if state == DropState::Completed => {
                        pb.finish_with_message(format!("[DONE] {message}"))
                    }
                    Some(pb) => pb.abandon_with_message(message),
                    None => {}
                }
            }
            _ => {}
        }
        let _ = self.events.send(event);
    }

    fn notify_progress(&self, event: DropProgressEvent) {
        if let Some(pb) = self.bars().get(&event.id) {
            pb.set_length(event.total_bytes);
            pb.set_position(event.bytes_transferred);
        }
    }
}
