use crate::common::{FaceGateError, Result};
use crate::core::detector::FaceBox;
use image::{imageops, imageops::FilterType, GrayImage};

/// A face crop at the canonical resolution used for training and inference.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    image: GrayImage,
}

impl Sample {
    /// Wraps an already-canonical image, rejecting any other size.
    pub fn from_image(image: GrayImage, size: (u32, u32)) -> Result<Self> {
        if image.dimensions() != size {
            return Err(FaceGateError::InvalidSample(format!(
                "Expected {}x{} sample, got {}x{}",
                size.0, size.1, image.width(), image.height()
            )));
        }
        Ok(Self { image })
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Crops a detected region and stretches it to the canonical size.
///
/// Aspect ratio is not preserved, so off-axis faces come out distorted.
#[derive(Debug, Clone, Copy)]
pub struct SampleNormalizer {
    width: u32,
    height: u32,
}

impl SampleNormalizer {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn normalize(&self, frame: &GrayImage, face: &FaceBox) -> Result<Sample> {
        let (frame_w, frame_h) = frame.dimensions();
        let x = face.x.min(frame_w);
        let y = face.y.min(frame_h);
        let width = face.right().min(frame_w) - x;
        let height = face.bottom().min(frame_h) - y;

        if width == 0 || height == 0 {
            return Err(FaceGateError::InvalidSample(format!(
                "Face box {:?} lies outside the {}x{} frame", face, frame_w, frame_h
            )));
        }

        let crop = imageops::crop_imm(frame, x, y, width, height).to_image();
        let resized = imageops::resize(&crop, self.width, self.height, FilterType::Triangle);

        Ok(Sample { image: resized })
    }
}
