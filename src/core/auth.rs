//! Authentication session state machine.
//!
//! `start` moves an idle session into searching (or straight to a failure when
//! nobody is registered or no model exists). Each `tick` then consumes one
//! frame as one attempt until a registered face matches under the threshold
//! or the attempt budget runs out. Every terminal state except cancellation
//! writes exactly one audit entry.

use crate::audit::{AuditEntry, AuditSink};
use crate::common::FaceGateError;
use crate::core::classifier::FaceClassifier;
use crate::core::detector::FaceBox;
use crate::core::FacePipeline;
use crate::notify::{Notifier, Status};
use crate::storage::IdentityId;
use image::GrayImage;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuthSettings {
    pub max_attempts: u32,
    /// A match is accepted only when its distance is strictly below this.
    pub confidence_threshold: f64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            confidence_threshold: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    AttemptsExhausted,
    ModelNotTrained,
    NoRegisteredUsers,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::AttemptsExhausted => "attempts exhausted",
            FailureReason::ModelNotTrained => "model not trained",
            FailureReason::NoRegisteredUsers => "no registered users",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attempts exhausted" => Ok(FailureReason::AttemptsExhausted),
            "model not trained" => Ok(FailureReason::ModelNotTrained),
            "no registered users" => Ok(FailureReason::NoRegisteredUsers),
            other => Err(format!("unknown failure reason: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthSuccess {
    pub identity_id: IdentityId,
    pub name: String,
    pub distance: f64,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Idle,
    Searching,
    Succeeded(AuthSuccess),
    Failed(FailureReason),
    Cancelled,
}

impl AuthState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthState::Succeeded(_) | AuthState::Failed(_) | AuthState::Cancelled)
    }
}

/// What happened on one attempt. Kept in memory for the session only.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub frame_index: u64,
    pub detected: bool,
    /// Identity of the closest candidate, valid or not.
    pub predicted_identity: Option<IdentityId>,
    /// Distance of that candidate; `None` when nothing could be classified.
    pub score: Option<f64>,
    pub accepted: bool,
    pub face: Option<FaceBox>,
}

struct Candidate {
    identity_id: IdentityId,
    distance: f64,
    face: FaceBox,
    valid: bool,
}

pub struct AuthSession<'a> {
    settings: AuthSettings,
    pipeline: FacePipeline<'a>,
    classifier: &'a FaceClassifier,
    identities: BTreeMap<IdentityId, String>,
    audit: &'a dyn AuditSink,
    notifier: &'a dyn Notifier,
    state: AuthState,
    attempts: u32,
    frame_index: u64,
    records: Vec<AttemptRecord>,
}

impl<'a> AuthSession<'a> {
    /// `identities` is the registered set; predictions for any other id are rejected.
    pub fn new(
        settings: AuthSettings,
        pipeline: FacePipeline<'a>,
        classifier: &'a FaceClassifier,
        identities: BTreeMap<IdentityId, String>,
        audit: &'a dyn AuditSink,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            settings,
            pipeline,
            classifier,
            identities,
            audit,
            notifier,
            state: AuthState::Idle,
            attempts: 0,
            frame_index: 0,
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn start(&mut self) -> &AuthState {
        if self.state != AuthState::Idle {
            return &self.state;
        }

        if self.identities.is_empty() {
            tracing::info!("No registered users, skipping authentication");
            self.fail(FailureReason::NoRegisteredUsers);
        } else if !self.classifier.is_trained() {
            tracing::warn!("Face model is not trained, skipping authentication");
            self.fail(FailureReason::ModelNotTrained);
        } else {
            tracing::debug!(
                "Authentication started: {} identities, {} attempts, threshold {}",
                self.identities.len(),
                self.settings.max_attempts,
                self.settings.confidence_threshold
            );
            self.state = AuthState::Searching;
            self.notifier.notify(&Status::AuthStarted {
                max_attempts: self.settings.max_attempts,
            });
        }
        &self.state
    }

    /// Runs one attempt on `frame`. `None` means the source had no frame this
    /// tick, which costs nothing.
    pub fn tick(&mut self, frame: Option<&GrayImage>) -> &AuthState {
        if self.state != AuthState::Searching {
            return &self.state;
        }
        let Some(frame) = frame else {
            tracing::debug!("No frame available, attempt not counted");
            return &self.state;
        };

        self.frame_index += 1;
        self.attempts += 1;
        let attempt = self.attempts;

        let (faces, candidates) = self.classify(frame);
        let best = best_valid(&candidates);
        let closest = candidates
            .iter()
            .min_by(|a, b| a.distance.total_cmp(&b.distance));

        self.records.push(AttemptRecord {
            frame_index: self.frame_index,
            detected: faces > 0,
            predicted_identity: best.or(closest).map(|c| c.identity_id),
            score: best.or(closest).map(|c| c.distance),
            accepted: best.is_some(),
            face: best.or(closest).map(|c| c.face),
        });

        if let Some(best) = best {
            let name = self.identities.get(&best.identity_id).cloned().unwrap_or_default();
            tracing::info!(
                "Attempt {}: accepted identity {} ({}) at distance {:.2}",
                attempt,
                best.identity_id,
                name,
                best.distance
            );
            let success = AuthSuccess {
                identity_id: best.identity_id,
                name,
                distance: best.distance,
                attempt,
            };
            self.succeed(success);
            return &self.state;
        }

        let progress = if faces == 0 {
            tracing::debug!("Attempt {}: no face", attempt);
            Status::NoFace { attempt, max_attempts: self.settings.max_attempts }
        } else {
            tracing::debug!(
                "Attempt {}: {} face(s), none accepted (closest {:?})",
                attempt,
                faces,
                closest.map(|c| (c.identity_id, c.distance))
            );
            Status::Unrecognized { attempt, max_attempts: self.settings.max_attempts }
        };
        self.notifier.notify(&progress);

        if self.attempts >= self.settings.max_attempts {
            tracing::info!("Authentication failed after {} attempts", self.attempts);
            self.fail(FailureReason::AttemptsExhausted);
        }
        &self.state
    }

    /// Stops the session without an audit entry. No-op once terminal.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!("Authentication cancelled after {} attempts", self.attempts);
        self.state = AuthState::Cancelled;
        self.notifier.notify(&Status::Cancelled);
    }

    /// Number of detected faces and the candidates that could be classified.
    fn classify(&self, frame: &GrayImage) -> (usize, Vec<Candidate>) {
        let extracted = self.pipeline.extract(frame);
        let faces = extracted.len();
        let mut candidates = Vec::with_capacity(faces);
        for (face, sample) in extracted {
            let prediction = sample.and_then(|s| self.classifier.predict(&s));
            match prediction {
                Ok(p) => candidates.push(Candidate {
                    identity_id: p.identity_id,
                    distance: p.distance,
                    face,
                    valid: p.distance < self.settings.confidence_threshold
                        && self.identities.contains_key(&p.identity_id),
                }),
                Err(FaceGateError::NotTrained) => {
                    tracing::warn!("Model disappeared mid-session, candidate ignored");
                }
                Err(e) => tracing::warn!("Candidate at {:?} discarded: {}", face, e),
            }
        }
        (faces, candidates)
    }

    fn succeed(&mut self, success: AuthSuccess) {
        self.record(AuditEntry::auth_success(&success.name));
        self.notifier.notify(&Status::AuthSucceeded { name: success.name.clone() });
        self.state = AuthState::Succeeded(success);
    }

    fn fail(&mut self, reason: FailureReason) {
        self.record(AuditEntry::auth_failure(reason));
        self.notifier.notify(&Status::AuthFailed { reason });
        self.state = AuthState::Failed(reason);
    }

    fn record(&self, entry: AuditEntry) {
        // The decision stands even if it cannot be logged.
        if let Err(e) = self.audit.record(&entry) {
            tracing::error!("Failed to write audit entry '{}': {}", entry, e);
        }
    }
}

/// Valid candidate with the lowest distance; the earliest wins ties.
fn best_valid(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().filter(|c| c.valid).fold(None, |best: Option<&Candidate>, c| match best {
        Some(b) if b.distance <= c.distance => Some(b),
        _ => Some(c),
    })
}
