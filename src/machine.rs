//! One state machine per drop request.
//!
//! The machine owns the request record and everything that only lives as
//! long as the request does: the armed timers and the transfer session. It
//! enforces the lifecycle; deciding *when* to move and talking to the
//! network is the coordinator's job.

use std::path::PathBuf;

use arkdrop_entities::{DropId, FailureReason};
use chrono::Utc;

use crate::{
    error::{DropError, Result},
    request::{DropRequest, DropRole, DropState},
    scheduler::TimerHandle,
    session::TransferSession,
};

/// A state change that was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub previous: DropState,
    pub state: DropState,
}

/// What [`DropMachine::cancel`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request is now `Cancelled`.
    Cancelled(Transition),
    /// A transfer is running; it was asked to stop and the request becomes
    /// `Cancelled` when it does.
    Deferred,
    /// A previous call already asked the running transfer to stop.
    AlreadyRequested,
    /// The request was already `Cancelled`.
    AlreadyCancelled,
}

/// Timers a machine can have armed.
#[derive(Debug, Default)]
pub struct Timers {
    pub expiry: Option<TimerHandle>,
    pub stall: Option<TimerHandle>,
    pub eviction: Option<TimerHandle>,
}

#[derive(Debug)]
pub struct DropMachine {
    request: DropRequest,
    timers: Timers,
    session: Option<TransferSession>,
}

impl DropMachine {
    pub fn new(request: DropRequest) -> Self {
        Self {
            request,
            timers: Timers::default(),
            session: None,
        }
    }

    pub fn id(&self) -> DropId {
        self.request.id
    }

    pub fn request(&self) -> &DropRequest {
        &self.request
    }

    pub fn state(&self) -> DropState {
        self.request.state
    }

    pub fn role(&self) -> DropRole {
        self.request.role
    }

    pub fn is_terminal(&self) -> bool {
        self.request.is_terminal()
    }

    /// Moves to `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: DropState) -> Result<Transition> {
        let previous = self.request.state;
        if !previous.can_transition_to(next) {
            return Err(self.invalid(action_for(next)));
        }
        self.request.state = next;
        self.request.updated_at = Utc::now();
        if next.is_terminal() {
            if let Some(session) = &mut self.session {
                session.stop();
                session.mark_finished();
            }
        }
        Ok(Transition { previous, state: next })
    }

    /// `Pending → Accepted`. The receiver records where files go; the
    /// sender passes `None`.
    pub fn accept(&mut self, destination: Option<PathBuf>) -> Result<Transition> {
        if self.request.state != DropState::Pending {
            return Err(self.invalid("accept"));
        }
        let transition = self.transition(DropState::Accepted)?;
        if self.request.destination_path.is_none() {
            self.request.destination_path = destination;
        }
        Ok(transition)
    }

    /// Moves to `Failed`, recording why.
    pub fn fail(&mut self, reason: FailureReason) -> Result<Transition> {
        let transition = self.transition(DropState::Failed)?;
        self.request.failure = Some(reason);
        Ok(transition)
    }

    /// User or peer cancellation. Safe to call repeatedly.
    pub fn cancel(&mut self) -> Result<CancelOutcome> {
        match self.request.state {
            DropState::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            state if state.is_terminal() => Err(self.invalid("cancel")),
            DropState::InProgress => {
                let Some(session) =
                    self.session.as_mut().filter(|s| s.is_running())
                else {
                    return self.cancel_now();
                };
                if session.request_cancel() {
                    Ok(CancelOutcome::Deferred)
                } else {
                    Ok(CancelOutcome::AlreadyRequested)
                }
            }
            _ => self.cancel_now(),
        }
    }

    fn cancel_now(&mut self) -> Result<CancelOutcome> {
        let transition = self.transition(DropState::Cancelled)?;
        self.request.failure = None;
        Ok(CancelOutcome::Cancelled(transition))
    }

    /// `Accepted → InProgress`, creating the transfer session.
    pub fn start_transfer(&mut self) -> Result<(Transition, &TransferSession)> {
        if self.request.state != DropState::Accepted {
            return Err(self.invalid("start the transfer"));
        }
        let transition = self.transition(DropState::InProgress)?;
        let session = self
            .session
            .insert(TransferSession::new(self.request.file_manifest.len()));
        Ok((transition, &*session))
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut TransferSession> {
        self.session.as_mut()
    }

    /// Applies local progress of file `file_index`. Returns the new total if
    /// the request is still transferring.
    pub fn record_progress(&mut self, file_index: usize, file_bytes: u64) -> Option<u64> {
        if self.request.state != DropState::InProgress {
            return None;
        }
        let total = self.session.as_mut()?.record(file_index, file_bytes);
        self.set_bytes(total)
    }

    /// Applies a total confirmed by the peer.
    pub fn acknowledge_progress(&mut self, total: u64) -> Option<u64> {
        if self.request.state != DropState::InProgress {
            return None;
        }
        let total = self.session.as_mut()?.acknowledge(total);
        self.set_bytes(total)
    }

    fn set_bytes(&mut self, total: u64) -> Option<u64> {
        if total == self.request.bytes_transferred {
            return None;
        }
        self.request.bytes_transferred = total;
        self.request.updated_at = Utc::now();
        Some(total)
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut Timers {
        &mut self.timers
    }

    /// Whether `handle` is the expiry timer currently armed while pending.
    pub fn expiry_is_current(&self, handle: TimerHandle) -> bool {
        self.request.state == DropState::Pending
            && self.timers.expiry == Some(handle)
    }

    fn invalid(&self, action: &'static str) -> DropError {
        DropError::InvalidState {
            id: self.request.id,
            state: self.request.state,
            action,
        }
    }
}

fn action_for(next: DropState) -> &'static str {
    match next {
        DropState::Created => "create",
        DropState::Pending => "send the request",
        DropState::Accepted => "accept",
        DropState::InProgress => "start the transfer",
        DropState::Declined => "decline",
        DropState::Expired => "expire",
        DropState::Cancelled => "cancel",
        DropState::Completed => "complete",
        DropState::Failed => "fail",
    }
}
