pub mod v4l2;

pub use v4l2::{detect_ir_camera, list_all_cameras, CameraInfo, V4l2Camera, AUTO_DETECT_INDEX};

use crate::common::Result;
use image::GrayImage;

/// Pull-based frame provider.
///
/// `Ok(None)` means no frame was available this time; callers skip the tick
/// rather than treating it as an error.
pub trait FrameSource {
    fn grab(&mut self) -> Result<Option<GrayImage>>;
}

impl<F: FrameSource + ?Sized> FrameSource for &mut F {
    fn grab(&mut self) -> Result<Option<GrayImage>> {
        (**self).grab()
    }
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn grab(&mut self) -> Result<Option<GrayImage>> {
        (**self).grab()
    }
}
