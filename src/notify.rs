//! One-way status events emitted by the enrollment and authentication
//! sessions for whatever UI is listening.

use crate::core::auth::FailureReason;
use crate::storage::IdentityId;
use std::fmt;
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    AuthStarted { max_attempts: u32 },
    NoFace { attempt: u32, max_attempts: u32 },
    Unrecognized { attempt: u32, max_attempts: u32 },
    AuthSucceeded { name: String },
    AuthFailed { reason: FailureReason },
    EnrollStarted { name: String, target: usize },
    EnrollProgress { captured: usize, target: usize },
    Training { samples: usize },
    EnrollDone { id: IdentityId, name: String },
    EnrollFailed { error: String },
    Cancelled,
    /// An identity was removed and nobody has retrained since.
    ModelStale,
}

impl Status {
    /// Whether this event ends a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::AuthSucceeded { .. }
                | Status::AuthFailed { .. }
                | Status::EnrollDone { .. }
                | Status::EnrollFailed { .. }
                | Status::Cancelled
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::AuthStarted { max_attempts } => {
                write!(f, "Look at the camera... ({} attempts)", max_attempts)
            }
            Status::NoFace { attempt, max_attempts } => {
                write!(f, "No face detected. Attempt {}/{}", attempt, max_attempts)
            }
            Status::Unrecognized { attempt, max_attempts } => {
                write!(f, "Unrecognized face. Attempt {}/{}", attempt, max_attempts)
            }
            Status::AuthSucceeded { name } => write!(f, "Welcome, {}! Access granted.", name),
            Status::AuthFailed { reason } => match reason {
                FailureReason::NoRegisteredUsers => {
                    write!(f, "No registered users found. Please register a new user first.")
                }
                FailureReason::ModelNotTrained => {
                    write!(f, "Face model has not been trained. Run retrain or enroll a user.")
                }
                FailureReason::AttemptsExhausted => write!(f, "Authentication failed. Access denied."),
            },
            Status::EnrollStarted { name, target } => {
                write!(f, "Registering {}: look at the camera ({} samples)", name, target)
            }
            Status::EnrollProgress { captured, target } => {
                write!(f, "Captured {}/{} samples", captured, target)
            }
            Status::Training { samples } => write!(f, "Training face model on {} samples...", samples),
            Status::EnrollDone { id, name } => write!(f, "Registered {} with id {}", name, id),
            Status::EnrollFailed { error } => write!(f, "Registration failed: {}", error),
            Status::Cancelled => write!(f, "Cancelled"),
            Status::ModelStale => write!(f, "Face model is out of date; run retrain"),
        }
    }
}

/// Receives status events. Implementations must not block for long; they are
/// called from the session loop.
pub trait Notifier: Send {
    fn notify(&self, status: &Status);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, status: &Status) {
        match status {
            Status::AuthFailed { .. } | Status::EnrollFailed { .. } | Status::ModelStale => {
                tracing::warn!("{}", status)
            }
            _ => tracing::info!("{}", status),
        }
    }
}

/// Forwards events to another thread. A dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: Sender<Status>,
}

impl ChannelNotifier {
    pub fn new(tx: Sender<Status>) -> Self {
        Self { tx }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, status: &Status) {
        if self.tx.send(status.clone()).is_err() {
            tracing::debug!("Status receiver gone, dropping {:?}", status);
        }
    }
}

impl<N: Notifier + Sync + ?Sized> Notifier for &N {
    fn notify(&self, status: &Status) {
        (**self).notify(status)
    }
}
