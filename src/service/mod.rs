//! Process-local owner of the identity store and the trained model.
//!
//! Authentication sessions share a read lock for their whole duration;
//! enrollment and every operator mutation take the write lock, so a session
//! never sees a model that is being rewritten.

use crate::audit::{AuditEntry, AuditSink, FileAuditLog};
use crate::camera::FrameSource;
use crate::common::{CancelToken, Config, DevMode, FaceGateError, Result};
use crate::core::{
    AttemptRecord, AuthSession, AuthState, EnrollState, EnrollmentSession, FaceClassifier, FaceDetector,
    FacePipeline, HaarCascadeDetector, SampleNormalizer,
};
use crate::notify::{Notifier, Status};
use crate::storage::{DeletedIdentity, Identity, IdentityId, IdentityStore};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Pause after the frame source comes back empty.
const FRAME_RETRY_DELAY: Duration = Duration::from_millis(5);

pub struct GateState {
    pub store: IdentityStore,
    pub classifier: FaceClassifier,
}

#[derive(Debug, Clone)]
pub struct AuthReport {
    pub state: AuthState,
    pub attempts: u32,
    pub records: Vec<AttemptRecord>,
}

#[derive(Debug, Clone)]
pub struct EnrollReport {
    pub state: EnrollState,
    pub captured: usize,
}

#[derive(Clone)]
pub struct FaceGate {
    state: Arc<RwLock<GateState>>,
    detector: Arc<dyn FaceDetector>,
    normalizer: SampleNormalizer,
    audit: Arc<dyn AuditSink>,
    config: Arc<Config>,
}

impl FaceGate {
    /// Opens the store under `data_dir` and loads the model if one exists.
    pub fn new(
        config: Config,
        data_dir: &Path,
        detector: Arc<dyn FaceDetector>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        let store = IdentityStore::open(data_dir, config.sample_size(), config.enrollment.id_policy)?;
        let mut classifier = FaceClassifier::new(config.lbph_params());
        classifier.load(&store.model_path())?;

        if store.is_model_stale() {
            tracing::warn!("Face model is stale: identities were deleted since the last retrain");
        }

        let (width, height) = config.sample_size();
        Ok(Self {
            state: Arc::new(RwLock::new(GateState { store, classifier })),
            detector,
            normalizer: SampleNormalizer::new(width, height),
            audit,
            config: Arc::new(config),
        })
    }

    /// Wires up the Haar detector and the file audit log from `config`.
    pub fn open(config: Config, dev_mode: &DevMode) -> Result<Self> {
        let detector = HaarCascadeDetector::load(&config.detector.cascade_path, config.detector_params())?;
        let audit = FileAuditLog::new(dev_mode.audit_log_path(&config));
        let data_dir = dev_mode.data_dir(&config);
        tracing::debug!("Data directory: {}", data_dir.display());
        Self::new(config, &data_dir, Arc::new(detector), Arc::new(audit))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identities(&self) -> Result<Vec<Identity>> {
        Ok(self.read()?.store.identities().cloned().collect())
    }

    pub fn is_model_stale(&self) -> Result<bool> {
        Ok(self.read()?.store.is_model_stale())
    }

    pub fn is_trained(&self) -> Result<bool> {
        Ok(self.read()?.classifier.is_trained())
    }

    /// Runs one authentication session against `source` until it succeeds,
    /// fails, or `cancel` fires.
    ///
    /// Too many consecutive empty grabs abort with a `Camera` error and no
    /// audit entry.
    pub fn authenticate(
        &self,
        source: &mut dyn FrameSource,
        notifier: &dyn Notifier,
        cancel: &CancelToken,
    ) -> Result<AuthReport> {
        let state = self.read()?;
        if state.store.is_model_stale() {
            notifier.notify(&Status::ModelStale);
        }

        let pipeline = FacePipeline::new(self.detector.as_ref(), &self.normalizer);
        let mut session = AuthSession::new(
            self.config.auth_settings(),
            pipeline,
            &state.classifier,
            state.store.list_identities(),
            self.audit.as_ref(),
            notifier,
        );

        if !session.start().is_terminal() {
            let interval = self.config.attempt_interval();
            let max_failures = self.config.auth.max_consecutive_frame_failures;
            let mut failures = 0;
            let mut last_attempt: Option<Instant> = None;

            loop {
                if cancel.is_cancelled() {
                    session.cancel();
                    break;
                }

                let Some(frame) = source.grab()? else {
                    failures += 1;
                    if failures >= max_failures {
                        tracing::error!("No frame from the camera after {} tries", failures);
                        return Err(FaceGateError::Camera(format!(
                            "No frame from the camera after {} tries",
                            failures
                        )));
                    }
                    thread::sleep(FRAME_RETRY_DELAY);
                    continue;
                };
                failures = 0;

                // Frames between attempts only keep the stream drained.
                if last_attempt.map_or(false, |t| t.elapsed() < interval) {
                    continue;
                }
                last_attempt = Some(Instant::now());

                if session.tick(Some(&frame)).is_terminal() {
                    break;
                }
            }
        }

        Ok(AuthReport {
            state: session.state().clone(),
            attempts: session.attempts(),
            records: session.records().to_vec(),
        })
    }

    /// Captures and registers `name`, retraining the model over the whole corpus.
    pub fn enroll(
        &self,
        name: &str,
        source: &mut dyn FrameSource,
        notifier: &dyn Notifier,
        cancel: &CancelToken,
    ) -> Result<EnrollReport> {
        let mut guard = self.write()?;
        let state = &mut *guard;

        let pipeline = FacePipeline::new(self.detector.as_ref(), &self.normalizer);
        let mut session = EnrollmentSession::new(
            self.config.enroll_settings(),
            name,
            pipeline,
            &mut state.store,
            &mut state.classifier,
            self.audit.as_ref(),
            notifier,
        );
        session.start()?;

        let interval = self.config.capture_interval();
        let mut last_capture: Option<Instant> = None;

        while !session.state().is_terminal() {
            if cancel.is_cancelled() {
                session.cancel();
                break;
            }

            let Some(frame) = source.grab()? else {
                thread::sleep(FRAME_RETRY_DELAY);
                continue;
            };
            if last_capture.map_or(false, |t| t.elapsed() < interval) {
                continue;
            }
            last_capture = Some(Instant::now());

            session.tick(Some(&frame))?;
        }

        Ok(EnrollReport {
            state: session.state().clone(),
            captured: session.captured(),
        })
    }

    /// Removes the identity and its samples. The model is left stale until `retrain`.
    pub fn delete_identity(&self, id: IdentityId) -> Result<DeletedIdentity> {
        let deleted = self.write()?.store.delete_identity(id)?;
        if let Err(e) = self.audit.record(&AuditEntry::deleted(&deleted.identity.display_name)) {
            tracing::error!("Failed to write deletion audit entry: {}", e);
        }
        Ok(deleted)
    }

    pub fn rename_identity(&self, id: IdentityId, name: &str) -> Result<()> {
        self.write()?.store.rename_identity(id, name)
    }

    /// Rebuilds the model from every stored sample and returns how many were used.
    ///
    /// With no identities left the model is removed instead.
    pub fn retrain(&self) -> Result<usize> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        let model_path = state.store.model_path();

        // Fails on any unusable sample, so no registered identity is left out.
        let corpus = state.store.corpus()?;
        if corpus.is_empty() {
            if model_path.exists() {
                fs::remove_file(&model_path).map_err(|e| {
                    FaceGateError::Persistence(format!("Failed to remove {}: {}", model_path.display(), e))
                })?;
            }
            state.classifier = FaceClassifier::new(self.config.lbph_params());
            state.store.mark_model_fresh()?;
            tracing::info!("No identities left, model removed");
            return Ok(0);
        }

        let mut fresh = FaceClassifier::new(self.config.lbph_params());
        fresh.train(&corpus)?;
        fresh.save(&model_path)?;
        state.classifier = fresh;
        state.store.mark_model_fresh()?;

        tracing::info!("Retrained model on {} samples", corpus.len());
        Ok(corpus.len())
    }

    /// Re-reads metadata and model from disk, e.g. after another process changed them.
    pub fn reload(&self) -> Result<()> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        state.store.reload()?;
        let model_path = state.store.model_path();
        state.classifier.load(&model_path)?;
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GateState>> {
        self.state
            .read()
            .map_err(|_| FaceGateError::Other(anyhow::anyhow!("Face gate state lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, GateState>> {
        self.state
            .write()
            .map_err(|_| FaceGateError::Other(anyhow::anyhow!("Face gate state lock poisoned")))
    }
}
