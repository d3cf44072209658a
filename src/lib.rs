pub mod audit;
pub mod camera;
pub mod cli;
pub mod common;
pub mod core;
pub mod notify;
pub mod service;
pub mod storage;

pub use audit::{AuditEntry, AuditKind, AuditSink, FileAuditLog};
pub use camera::{FrameSource, V4l2Camera};
pub use common::{CancelToken, Config, DevMode, FaceGateError, Result};
pub use core::{
    AuthState, FaceBox, FaceClassifier, FaceDetector, FailureReason, HaarCascadeDetector, Sample,
    SampleNormalizer,
};
pub use notify::{Notifier, Status};
pub use service::{AuthReport, EnrollReport, FaceGate};
pub use storage::{IdPolicy, Identity, IdentityId, IdentityStore};
