//! Enrollment session state machine.
//!
//! Captures exactly `target_sample_count` face samples, then retrains the
//! classifier over the whole corpus and commits the new model. A session that
//! fails, is cancelled or is dropped mid-capture removes the identity it
//! created.

use crate::audit::{AuditEntry, AuditSink};
use crate::common::{FaceGateError, Result};
use crate::core::classifier::FaceClassifier;
use crate::core::normalizer::Sample;
use crate::core::FacePipeline;
use crate::notify::{Notifier, Status};
use crate::storage::identity_store::validate_name;
use crate::storage::{write_atomic, IdentityId, IdentityStore};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fs;

/// When the identity record is written during enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityCreation {
    /// Created at `start`; samples stream straight to disk.
    #[default]
    BeforeCapture,
    /// Samples are held in memory and the identity is created once capture completes.
    AfterCapture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollSettings {
    pub target_sample_count: usize,
    pub identity_creation: IdentityCreation,
}

impl Default for EnrollSettings {
    fn default() -> Self {
        Self {
            target_sample_count: 30,
            identity_creation: IdentityCreation::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollState {
    Idle,
    Capturing,
    Training,
    Done(IdentityId),
    Cancelled,
    Failed,
}

impl EnrollState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnrollState::Done(_) | EnrollState::Cancelled | EnrollState::Failed)
    }
}

pub struct EnrollmentSession<'a> {
    settings: EnrollSettings,
    name: String,
    pipeline: FacePipeline<'a>,
    store: &'a mut IdentityStore,
    classifier: &'a mut FaceClassifier,
    audit: &'a dyn AuditSink,
    notifier: &'a dyn Notifier,
    state: EnrollState,
    identity: Option<IdentityId>,
    buffered: Vec<Sample>,
    captured: usize,
    /// Set once the new model is on disk and could not be put back.
    model_replaced: bool,
}

impl<'a> EnrollmentSession<'a> {
    pub fn new(
        settings: EnrollSettings,
        name: &str,
        pipeline: FacePipeline<'a>,
        store: &'a mut IdentityStore,
        classifier: &'a mut FaceClassifier,
        audit: &'a dyn AuditSink,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            settings,
            name: name.trim().to_string(),
            pipeline,
            store,
            classifier,
            audit,
            notifier,
            state: EnrollState::Idle,
            identity: None,
            buffered: Vec::new(),
            captured: 0,
            model_replaced: false,
        }
    }

    pub fn state(&self) -> &EnrollState {
        &self.state
    }

    pub fn captured(&self) -> usize {
        self.captured
    }

    /// Id of the identity being enrolled, once it exists in the store.
    pub fn identity_id(&self) -> Option<IdentityId> {
        self.identity
    }

    pub fn start(&mut self) -> Result<&EnrollState> {
        if self.state != EnrollState::Idle {
            return Ok(&self.state);
        }
        if self.settings.target_sample_count == 0 {
            return Err(FaceGateError::Config("target_sample_count must be at least 1".into()));
        }
        validate_name(&self.name)?;

        if self.settings.identity_creation == IdentityCreation::BeforeCapture {
            self.identity = Some(self.store.create_identity(&self.name)?);
        }

        tracing::info!(
            "Enrolling {} ({} samples, identity {:?})",
            self.name,
            self.settings.target_sample_count,
            self.settings.identity_creation
        );
        self.state = EnrollState::Capturing;
        self.notifier.notify(&Status::EnrollStarted {
            name: self.name.clone(),
            target: self.settings.target_sample_count,
        });
        Ok(&self.state)
    }

    /// Takes every face in `frame` as a sample until the target is reached,
    /// then trains and commits. `None` frames are skipped without progress.
    pub fn tick(&mut self, frame: Option<&GrayImage>) -> Result<&EnrollState> {
        if self.state != EnrollState::Capturing {
            return Ok(&self.state);
        }
        let Some(frame) = frame else {
            return Ok(&self.state);
        };

        if let Err(e) = self.capture(frame) {
            self.abort(&e);
            return Err(e);
        }

        if self.captured >= self.settings.target_sample_count {
            if let Err(e) = self.commit() {
                self.abort(&e);
                return Err(e);
            }
        }
        Ok(&self.state)
    }

    /// Abandons the enrollment and removes anything it wrote. No-op once terminal.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!("Enrollment of {} cancelled at {} samples", self.name, self.captured);
        self.rollback();
        self.state = EnrollState::Cancelled;
        self.notifier.notify(&Status::Cancelled);
    }

    fn capture(&mut self, frame: &GrayImage) -> Result<()> {
        let before = self.captured;

        for (face, sample) in self.pipeline.extract(frame) {
            if self.captured >= self.settings.target_sample_count {
                tracing::debug!("Target reached, dropping surplus face at {:?}", face);
                continue;
            }
            let sample = match sample {
                Ok(sample) => sample,
                Err(e) => {
                    tracing::warn!("Skipping face at {:?}: {}", face, e);
                    continue;
                }
            };

            match self.identity {
                Some(id) if self.settings.identity_creation == IdentityCreation::BeforeCapture => {
                    self.store.append_sample(id, &sample)?;
                }
                _ => self.buffered.push(sample),
            }
            self.captured += 1;
        }

        if self.captured > before {
            tracing::debug!("Captured {}/{}", self.captured, self.settings.target_sample_count);
            self.notifier.notify(&Status::EnrollProgress {
                captured: self.captured,
                target: self.settings.target_sample_count,
            });
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.state = EnrollState::Training;

        let id = match self.identity {
            Some(id) => id,
            None => {
                let id = self.store.create_identity(&self.name)?;
                self.identity = Some(id);
                for sample in std::mem::take(&mut self.buffered) {
                    self.store.append_sample(id, &sample)?;
                }
                id
            }
        };

        let corpus = self.store.corpus()?;
        self.notifier.notify(&Status::Training { samples: corpus.len() });
        tracing::info!("Training over {} samples from {} identities", corpus.len(), self.store.len());

        let mut fresh = FaceClassifier::new(self.classifier.params());
        fresh.train(&corpus)?;

        let model_path = self.store.model_path();
        let previous = if model_path.exists() { Some(fs::read(&model_path)?) } else { None };
        fresh.save(&model_path)?;

        if let Err(e) = self.store.mark_model_fresh() {
            self.restore_model(&model_path, previous);
            return Err(e);
        }

        *self.classifier = fresh;
        self.state = EnrollState::Done(id);

        if let Err(e) = self.audit.record(&AuditEntry::enrolled(&self.name)) {
            tracing::error!("Failed to write enrollment audit entry: {}", e);
        }
        self.notifier.notify(&Status::EnrollDone { id, name: self.name.clone() });
        tracing::info!("Enrolled {} as identity {}", self.name, id);
        Ok(())
    }

    fn restore_model(&mut self, path: &std::path::Path, previous: Option<Vec<u8>>) {
        let restored = match previous {
            Some(bytes) => write_atomic(path, &bytes),
            None => fs::remove_file(path).map_err(FaceGateError::from),
        };
        if let Err(e) = restored {
            tracing::error!("Could not restore previous model at {}: {}", path.display(), e);
            self.model_replaced = true;
        }
    }

    fn abort(&mut self, error: &FaceGateError) {
        tracing::error!("Enrollment of {} failed: {}", self.name, error);
        self.rollback();
        self.state = EnrollState::Failed;
        self.notifier.notify(&Status::EnrollFailed { error: error.to_string() });
    }

    fn rollback(&mut self) {
        self.buffered.clear();
        if let Some(id) = self.identity.take() {
            if let Err(e) = self.store.discard_identity(id, self.model_replaced) {
                tracing::error!("Failed to roll back identity {}: {}", id, e);
            }
        }
    }
}

impl Drop for EnrollmentSession<'_> {
    fn drop(&mut self) {
        if !self.state.is_terminal() && self.identity.is_some() {
            tracing::warn!("Enrollment of {} abandoned, rolling back", self.name);
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditKind;
    use crate::core::classifier::LbphParams;
    use crate::core::detector::{FaceBox, FaceDetector};
    use crate::core::normalizer::SampleNormalizer;
    use crate::storage::IdPolicy;
    use image::{imageops, Luma};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const SIDE: u32 = 40;

    /// One box per `SIDE` wide column that is not all black.
    struct ColumnDetector;

    impl FaceDetector for ColumnDetector {
        fn detect(&self, frame: &GrayImage) -> Vec<FaceBox> {
            (0..frame.width() / SIDE)
                .map(|col| FaceBox::new(col * SIDE, 0, SIDE, SIDE))
                .filter(|b| {
                    (b.x..b.right()).any(|x| (0..SIDE).any(|y| frame.get_pixel(x, y)[0] != 0))
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct MemoryAudit(Mutex<Vec<AuditEntry>>);

    impl AuditSink for MemoryAudit {
        fn record(&self, entry: &AuditEntry) -> Result<()> {
            self.0.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Status>>);

    impl Notifier for Recorder {
        fn notify(&self, status: &Status) {
            self.0.lock().unwrap().push(status.clone());
        }
    }

    fn face(seed: u8) -> GrayImage {
        GrayImage::from_fn(SIDE, SIDE, |x, y| {
            Luma([((x * 13 + y * 7) as u8).wrapping_mul(seed | 1).max(1)])
        })
    }

    /// A frame holding `faces` non-black columns.
    fn frame(faces: u32) -> GrayImage {
        let mut frame = GrayImage::new(SIDE * faces.max(1), SIDE);
        for col in 0..faces {
            imageops::replace(&mut frame, &face(col as u8 + 3), (col * SIDE) as i64, 0);
        }
        frame
    }

    struct Fixture {
        _dir: TempDir,
        store: IdentityStore,
        classifier: FaceClassifier,
        normalizer: SampleNormalizer,
        audit: MemoryAudit,
        notes: Recorder,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = IdentityStore::open(dir.path(), (SIDE, SIDE), IdPolicy::MaxPlusOne).unwrap();
            Self {
                _dir: dir,
                store,
                classifier: FaceClassifier::new(LbphParams { grid_x: 4, grid_y: 4, ..LbphParams::default() }),
                normalizer: SampleNormalizer::new(SIDE, SIDE),
                audit: MemoryAudit::default(),
                notes: Recorder::default(),
            }
        }

        fn enroll(&mut self, name: &str, target: usize, creation: IdentityCreation, frames: &[GrayImage]) -> Result<EnrollState> {
            let settings = EnrollSettings { target_sample_count: target, identity_creation: creation };
            let mut session = EnrollmentSession::new(
                settings,
                name,
                FacePipeline::new(&ColumnDetector, &self.normalizer),
                &mut self.store,
                &mut self.classifier,
                &self.audit,
                &self.notes,
            );
            session.start()?;
            for frame in frames {
                session.tick(Some(frame))?;
            }
            Ok(session.state().clone())
        }
    }

    #[test]
    fn captures_exactly_the_target_across_mixed_frames() {
        let mut fx = Fixture::new();
        let frames = [frame(0), frame(1), frame(2), frame(0), frame(2)];

        let state = fx.enroll("Alice", 5, IdentityCreation::BeforeCapture, &frames).unwrap();
        assert_eq!(state, EnrollState::Done(1));
        assert_eq!(fx.store.sample_count(1).unwrap(), 5);
        assert_eq!(fx.classifier.sample_count(), 5);
        assert!(fx.store.model_path().exists());

        let audit = fx.audit.0.lock().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, AuditKind::Enrolled);
        assert_eq!(audit[0].subject_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn surplus_faces_in_the_last_frame_are_dropped() {
        let mut fx = Fixture::new();
        let frames = [frame(2), frame(2), frame(2)];

        let state = fx.enroll("Bob", 3, IdentityCreation::BeforeCapture, &frames).unwrap();
        assert_eq!(state, EnrollState::Done(1));
        assert_eq!(fx.store.sample_count(1).unwrap(), 3);
    }

    #[test]
    fn missing_frames_make_no_progress() {
        let mut fx = Fixture::new();
        let settings = EnrollSettings { target_sample_count: 2, ..EnrollSettings::default() };
        let mut session = EnrollmentSession::new(
            settings,
            "Carol",
            FacePipeline::new(&ColumnDetector, &fx.normalizer),
            &mut fx.store,
            &mut fx.classifier,
            &fx.audit,
            &fx.notes,
        );
        session.start().unwrap();
        for _ in 0..10 {
            session.tick(None).unwrap();
        }
        assert_eq!(session.captured(), 0);
        assert_eq!(session.state(), &EnrollState::Capturing);
    }

    #[test]
    fn after_capture_creates_identity_only_at_the_end() {
        let mut fx = Fixture::new();
        let settings = EnrollSettings { target_sample_count: 2, identity_creation: IdentityCreation::AfterCapture };
        let mut session = EnrollmentSession::new(
            settings,
            "Dana",
            FacePipeline::new(&ColumnDetector, &fx.normalizer),
            &mut fx.store,
            &mut fx.classifier,
            &fx.audit,
            &fx.notes,
        );
        session.start().unwrap();
        session.tick(Some(&frame(1))).unwrap();
        assert_eq!(session.identity_id(), None);

        assert_eq!(session.tick(Some(&frame(1))).unwrap(), &EnrollState::Done(1));
        drop(session);
        assert_eq!(fx.store.list_identities()[&1], "Dana");
        assert_eq!(fx.store.sample_count(1).unwrap(), 2);
    }

    #[test]
    fn retrains_over_the_whole_corpus() {
        let mut fx = Fixture::new();
        fx.enroll("Alice", 2, IdentityCreation::BeforeCapture, &[frame(2)]).unwrap();
        fx.enroll("Bob", 3, IdentityCreation::AfterCapture, &[frame(3)]).unwrap();

        assert_eq!(fx.classifier.sample_count(), 5);
        assert!(fx.classifier.knows(1) && fx.classifier.knows(2));
        assert!(!fx.store.is_model_stale());
    }

    #[test]
    fn cancel_rolls_back_the_identity() {
        let mut fx = Fixture::new();
        let settings = EnrollSettings { target_sample_count: 10, ..EnrollSettings::default() };
        let mut session = EnrollmentSession::new(
            settings,
            "Eve",
            FacePipeline::new(&ColumnDetector, &fx.normalizer),
            &mut fx.store,
            &mut fx.classifier,
            &fx.audit,
            &fx.notes,
        );
        session.start().unwrap();
        session.tick(Some(&frame(2))).unwrap();
        session.cancel();
        assert_eq!(session.state(), &EnrollState::Cancelled);
        drop(session);

        assert!(fx.store.is_empty());
        assert!(!fx.store.is_model_stale());
        assert!(!fx.store.data_dir().join("users").join("1").exists());
        assert!(fx.audit.0.lock().unwrap().is_empty());
        assert_eq!(fx.notes.0.lock().unwrap().last(), Some(&Status::Cancelled));
    }

    #[test]
    fn dropping_mid_capture_rolls_back() {
        let mut fx = Fixture::new();
        {
            let settings = EnrollSettings { target_sample_count: 10, ..EnrollSettings::default() };
            let mut session = EnrollmentSession::new(
                settings,
                "Frank",
                FacePipeline::new(&ColumnDetector, &fx.normalizer),
                &mut fx.store,
                &mut fx.classifier,
                &fx.audit,
                &fx.notes,
            );
            session.start().unwrap();
            session.tick(Some(&frame(1))).unwrap();
        }
        assert!(fx.store.is_empty());
    }

    #[test]
    fn failed_model_save_leaves_prior_state() {
        let mut fx = Fixture::new();
        fx.enroll("Alice", 2, IdentityCreation::BeforeCapture, &[frame(2)]).unwrap();
        let before = fs::read(fx.store.model_path()).unwrap();

        // Block the temp file used for the atomic replace.
        let blocker = fx.store.data_dir().join("face_model.bin.tmp");
        fs::create_dir_all(blocker.join("child")).unwrap();

        let err = fx.enroll("Bob", 2, IdentityCreation::BeforeCapture, &[frame(2)]).unwrap_err();
        assert!(matches!(err, FaceGateError::Persistence(_)));

        assert_eq!(fx.store.list_identities().len(), 1);
        assert_eq!(fx.classifier.sample_count(), 2);
        assert_eq!(fs::read(fx.store.model_path()).unwrap(), before);
        assert!(matches!(
            fx.notes.0.lock().unwrap().last(),
            Some(Status::EnrollFailed { .. })
        ));
    }

    #[test]
    fn rejects_blank_names() {
        let mut fx = Fixture::new();
        let err = fx.enroll("   ", 1, IdentityCreation::AfterCapture, &[]).unwrap_err();
        assert!(matches!(err, FaceGateError::InvalidName(_)));
        assert!(fx.store.is_empty());
    }
}
