pub mod auth;
pub mod classifier;
pub mod detector;
pub mod enroll;
pub mod normalizer;

pub use auth::{AttemptRecord, AuthSession, AuthSettings, AuthState, AuthSuccess, FailureReason};
pub use classifier::{FaceClassifier, LbphParams, Prediction};
pub use detector::{DetectorParams, FaceBox, FaceDetector, HaarCascade, HaarCascadeDetector};
pub use enroll::{EnrollSettings, EnrollState, EnrollmentSession, IdentityCreation};
pub use normalizer::{Sample, SampleNormalizer};

use crate::common::Result;
use image::GrayImage;

/// Detector and normalizer together: frame in, canonical face samples out.
#[derive(Clone, Copy)]
pub struct FacePipeline<'a> {
    pub detector: &'a dyn FaceDetector,
    pub normalizer: &'a SampleNormalizer,
}

impl<'a> FacePipeline<'a> {
    pub fn new(detector: &'a dyn FaceDetector, normalizer: &'a SampleNormalizer) -> Self {
        Self { detector, normalizer }
    }

    /// Every detected box paired with its normalized sample, in detector order.
    pub fn extract(&self, frame: &GrayImage) -> Vec<(FaceBox, Result<Sample>)> {
        self.detector
            .detect(frame)
            .into_iter()
            .map(|face| (face, self.normalizer.normalize(frame, &face)))
            .collect()
    }
}
