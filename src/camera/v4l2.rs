use super::FrameSource;
use crate::common::config::CameraConfig;
use crate::common::{FaceGateError, Result};
use image::{GrayImage, ImageBuffer, Luma};
use std::fs;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// `device_index` value that asks for the first grayscale (IR) device.
pub const AUTO_DETECT_INDEX: u32 = 999;

const STREAM_BUFFERS: u32 = 4;

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub features: Vec<String>,
    pub likely_ir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Grey,
    Yuyv,
    Mjpg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"GREY" | b"Y8  " => Some(PixelFormat::Grey),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpg),
            _ => None,
        }
    }
}

/// A V4L2 capture device streaming through mmap buffers.
pub struct V4l2Camera {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    format: PixelFormat,
    index: u32,
    _device: Device,
}

impl V4l2Camera {
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let index = if config.device_index == AUTO_DETECT_INDEX {
            detect_ir_camera()?
        } else {
            config.device_index
        };

        let device = Device::new(index as usize)
            .map_err(|e| FaceGateError::Camera(format!("Failed to open camera {}: {}", index, e)))?;

        let caps = device
            .query_caps()
            .map_err(|e| FaceGateError::Camera(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            // Some IR devices only advertise metadata capture but stream fine.
            tracing::warn!("Device {} may not support standard video capture", index);
        }

        let mut fmt = device
            .format()
            .map_err(|e| FaceGateError::Camera(format!("Failed to get format: {}", e)))?;
        tracing::debug!("Current format: {}x{} {}", fmt.width, fmt.height, fmt.fourcc);

        fmt.width = config.width;
        fmt.height = config.height;
        if PixelFormat::from_fourcc(fmt.fourcc) != Some(PixelFormat::Grey) {
            fmt.fourcc = FourCC::new(b"MJPG");
        }
        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set {}x{} {}: {}; using device defaults", fmt.width, fmt.height, fmt.fourcc, e);
        }

        let actual = device
            .format()
            .map_err(|e| FaceGateError::Camera(format!("Failed to get final format: {}", e)))?;
        let format = PixelFormat::from_fourcc(actual.fourcc).ok_or_else(|| {
            FaceGateError::Camera(format!("Unsupported pixel format {}", actual.fourcc))
        })?;
        if actual.width != config.width || actual.height != config.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                actual.width,
                actual.height,
                config.width,
                config.height
            );
        }

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| FaceGateError::Camera(format!("Failed to create stream: {}", e)))?;

        // IR emitters need a few frames before the image settles.
        for i in 0..config.warmup_frames {
            stream
                .next()
                .map_err(|e| FaceGateError::Camera(format!("Failed to capture warmup frame {}: {}", i, e)))?;
            std::thread::sleep(Duration::from_millis(config.warmup_delay_ms));
        }

        tracing::info!(
            "Camera /dev/video{} ready: {} {}x{} {:?}",
            index,
            caps.card,
            actual.width,
            actual.height,
            format
        );

        Ok(Self {
            stream,
            width: actual.width,
            height: actual.height,
            format,
            index,
            _device: device,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

fn decode(format: PixelFormat, width: u32, height: u32, data: &[u8]) -> Result<GrayImage> {
    match format {
        PixelFormat::Grey => {
            let len = (width * height) as usize;
            let pixels = data.get(..len).ok_or_else(|| short_frame(data.len(), len))?;
            ImageBuffer::<Luma<u8>, _>::from_raw(width, height, pixels.to_vec())
                .ok_or_else(|| FaceGateError::Camera("Failed to create grayscale image buffer".into()))
        }
        PixelFormat::Yuyv => {
            // Y0 U Y1 V: every even byte is luma.
            let len = (width * height * 2) as usize;
            let packed = data.get(..len).ok_or_else(|| short_frame(data.len(), len))?;
            let luma: Vec<u8> = packed.iter().step_by(2).copied().collect();
            ImageBuffer::<Luma<u8>, _>::from_raw(width, height, luma)
                .ok_or_else(|| FaceGateError::Camera("Failed to create luma image buffer".into()))
        }
        PixelFormat::Mjpg => Ok(image::load_from_memory(data)?.to_luma8()),
    }
}

impl FrameSource for V4l2Camera {
    fn grab(&mut self) -> Result<Option<GrayImage>> {
        let (format, width, height) = (self.format, self.width, self.height);
        let frame = match self.stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                let data = if used > 0 { &buf[..used] } else { buf };
                decode(format, width, height, data)
            }
            Err(e) => {
                tracing::warn!("Frame capture failed: {}", e);
                return Ok(None);
            }
        };

        match frame {
            Ok(image) => Ok(Some(image)),
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                Ok(None)
            }
        }
    }
}

fn short_frame(got: usize, expected: usize) -> FaceGateError {
    FaceGateError::Camera(format!("Short frame: {} bytes, expected {}", got, expected))
}

/// Every `/dev/video*` device that can be opened, by ascending index.
pub fn list_all_cameras() -> Result<Vec<CameraInfo>> {
    let mut cameras = Vec::new();

    for index in video_indices()? {
        let Ok(device) = Device::new(index as usize) else { continue };
        let Ok(caps) = device.query_caps() else { continue };

        let mut features = Vec::new();
        let mut likely_ir = false;

        if caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            features.push("VIDEO_CAPTURE".to_string());
        } else if caps.capabilities.contains(v4l::capability::Flags::META_CAPTURE) {
            features.push("METADATA_CAPTURE (may work for IR)".to_string());
        }

        for fmt in device.enum_formats().unwrap_or_default() {
            let fourcc = fmt.fourcc.str().unwrap_or("UNKNOWN");
            match fourcc {
                "GREY" | "Y8" | "Y16" => {
                    features.push(format!("Grayscale ({})", fourcc));
                    likely_ir = true;
                }
                "MJPG" | "YUYV" => features.push(format!("Color ({})", fourcc)),
                _ => {}
            }
        }

        if caps.card.contains("IR") || caps.card.contains("Infrared") {
            likely_ir = true;
        }

        cameras.push(CameraInfo {
            index,
            name: caps.card.clone(),
            features,
            likely_ir,
        });
    }

    Ok(cameras)
}

/// Picks the first capture device offering a grayscale format, falling back to 0.
pub fn detect_ir_camera() -> Result<u32> {
    let cameras = list_all_cameras()?;
    let grayscale = cameras.iter().find(|c| {
        c.features.iter().any(|f| f == "VIDEO_CAPTURE")
            && c.features.iter().any(|f| f.starts_with("Grayscale"))
    });
    let named_ir = cameras.iter().find(|c| c.likely_ir && c.features.iter().any(|f| f == "VIDEO_CAPTURE"));

    match grayscale.or(named_ir) {
        Some(camera) => {
            tracing::info!("Selected camera /dev/video{} ({})", camera.index, camera.name);
            Ok(camera.index)
        }
        None => {
            tracing::warn!("No IR camera detected, falling back to /dev/video0");
            Ok(0)
        }
    }
}

fn video_indices() -> Result<Vec<u32>> {
    let mut indices = Vec::new();
    for entry in fs::read_dir("/dev")? {
        let name = entry?.file_name();
        if let Some(index) = name
            .to_str()
            .and_then(|n| n.strip_prefix("video"))
            .and_then(|n| n.parse().ok())
        {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_keeps_luma_bytes() {
        let data = [10, 128, 20, 128, 30, 128, 40, 128];
        let image = decode(PixelFormat::Yuyv, 2, 2, &data).unwrap();
        assert_eq!(image.into_raw(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn short_grey_frames_are_rejected() {
        assert!(decode(PixelFormat::Grey, 4, 4, &[0; 15]).is_err());
        assert!(decode(PixelFormat::Grey, 4, 4, &[0; 20]).is_ok());
    }

    #[test]
    fn recognises_supported_fourccs() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
    }
}
