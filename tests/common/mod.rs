#![allow(dead_code)]

use facegate::audit::FileAuditLog;
use facegate::camera::FrameSource;
use facegate::core::{FaceBox, FaceDetector};
use facegate::{Config, FaceGate, Result};
use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

pub const SIDE: u32 = 64;

/// Whole frame is one face unless it is entirely black.
pub struct WholeFrameDetector;

impl FaceDetector for WholeFrameDetector {
    fn detect(&self, frame: &GrayImage) -> Vec<FaceBox> {
        if frame.pixels().all(|p| p[0] == 0) {
            Vec::new()
        } else {
            vec![FaceBox::new(0, 0, frame.width(), frame.height())]
        }
    }
}

/// Replays frames in order; once exhausted every grab comes back empty.
pub struct ScriptedSource {
    pub frames: VecDeque<Option<GrayImage>>,
    pub delay: Duration,
    pub grabs: usize,
}

impl ScriptedSource {
    pub fn new(frames: impl IntoIterator<Item = GrayImage>) -> Self {
        Self {
            frames: frames.into_iter().map(Some).collect(),
            delay: Duration::ZERO,
            grabs: 0,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ScriptedSource {
    fn grab(&mut self) -> Result<Option<GrayImage>> {
        self.grabs += 1;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(self.frames.pop_front().flatten())
    }
}

/// Deterministic texture standing in for one person's face.
pub fn face(seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    GrayImage::from_fn(SIDE, SIDE, |_, _| Luma([rng.gen_range(16..=255)]))
}

pub fn frames_of(seed: u64, count: usize) -> Vec<GrayImage> {
    (0..count).map(|_| face(seed)).collect()
}

pub fn blank() -> GrayImage {
    GrayImage::new(SIDE, SIDE)
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.normalizer.sample_width = SIDE;
    config.normalizer.sample_height = SIDE;
    config.auth.attempt_interval_ms = 0;
    config.auth.max_consecutive_frame_failures = 5;
    config.enrollment.capture_interval_ms = 0;
    config.enrollment.target_sample_count = 10;
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub gate: FaceGate,
    pub audit: Arc<FileAuditLog>,
}

pub fn open_gate(config: Config) -> Harness {
    let dir = TempDir::new().unwrap();
    let (gate, audit) = open_in(config, dir.path());
    Harness { dir, gate, audit }
}

pub fn open_in(config: Config, data_dir: &Path) -> (FaceGate, Arc<FileAuditLog>) {
    let audit = Arc::new(FileAuditLog::new(data_dir.join("auth_log.txt")));
    let gate = FaceGate::new(config, data_dir, Arc::new(WholeFrameDetector), audit.clone()).unwrap();
    (gate, audit)
}
