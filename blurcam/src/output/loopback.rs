use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use v4l::video::Output;
use v4l::{Device, FourCC};

use super::{PixelFormat, SinkBackend, SinkSpec, VirtualCameraSink};
use crate::error::SinkError;
use crate::frame::Frame;

const DEFAULT_DEVICE: &str = "/dev/video10";

/// Opens v4l2loopback devices, falling back to a default node
#[derive(Debug, Clone)]
pub struct V4l2LoopbackBackend {
    default_device: PathBuf,
}

impl Default for V4l2LoopbackBackend {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE)
    }
}

impl V4l2LoopbackBackend {
    pub fn new(default_device: impl Into<PathBuf>) -> Self {
        Self {
            default_device: default_device.into(),
        }
    }
}

impl SinkBackend for V4l2LoopbackBackend {
    fn open(&self, spec: &SinkSpec) -> Result<Box<dyn VirtualCameraSink>, SinkError> {
        let mut candidates: Vec<PathBuf> = Vec::with_capacity(2);
        if let Some(name) = &spec.preferred_name {
            candidates.push(PathBuf::from(name));
        }
        if !candidates.contains(&self.default_device) {
            candidates.push(self.default_device.clone());
        }

        let mut failures = Vec::new();
        for path in &candidates {
            match V4L2Output::new(path, spec) {
                Ok(output) => return Ok(Box::new(output)),
                Err(e) => {
                    tracing::warn!("Virtual camera {} unavailable: {}", path.display(), e);
                    failures.push(format!("{}: {}", path.display(), e));
                }
            }
        }
        Err(SinkError::Unavailable(failures.join("; ")))
    }
}

pub struct V4L2Output {
    path: PathBuf,
    // Keeps the negotiated format alive alongside the write handle
    _device: Device,
    file: File,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    frame_interval: Duration,
    next_deadline: Option<Instant>,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, spec: &SinkSpec) -> Result<Self, SinkError> {
        let path = device_path.as_ref();
        let device_name = path.display().to_string();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{}@{} {:?})",
            device_name,
            spec.width,
            spec.height,
            spec.fps,
            spec.pixel_format
        );

        let configure_err = |reason: String| SinkError::Configure {
            device: device_name.clone(),
            reason,
        };

        let device = Device::with_path(path).map_err(|e| configure_err(e.to_string()))?;
        let requested = v4l::Format::new(spec.width, spec.height, fourcc(spec.pixel_format));
        let actual = Output::set_format(&device, &requested).map_err(|e| configure_err(e.to_string()))?;
        if actual.width != spec.width || actual.height != spec.height || actual.fourcc != requested.fourcc {
            return Err(configure_err(format!(
                "device accepted {}x{} {} instead",
                actual.width, actual.height, actual.fourcc
            )));
        }

        let file = File::options()
            .write(true)
            .open(path)
            .map_err(|e| configure_err(e.to_string()))?;

        tracing::info!("v4l2loopback device {} opened", device_name);

        Ok(Self {
            path: path.to_path_buf(),
            _device: device,
            file,
            width: spec.width,
            height: spec.height,
            pixel_format: spec.pixel_format,
            frame_interval: Duration::from_secs(1) / spec.fps.max(1),
            next_deadline: None,
        })
    }

    /// Sleep until the next frame slot; resync instead of bursting after a stall
    fn pace(&mut self) {
        let now = Instant::now();
        match self.next_deadline {
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.next_deadline = Some(deadline + self.frame_interval);
            }
            _ => self.next_deadline = Some(now + self.frame_interval),
        }
    }
}

impl VirtualCameraSink for V4L2Output {
    fn send(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let (actual_width, actual_height) = frame.dimensions();
        if (actual_width, actual_height) != (self.width, self.height) {
            return Err(SinkError::FrameSize {
                width: self.width,
                height: self.height,
                actual_width,
                actual_height,
            });
        }

        self.pace();
        match self.pixel_format {
            PixelFormat::Bgr24 => self.file.write_all(frame.as_bytes()),
            PixelFormat::Yuyv => self.file.write_all(&bgr_to_yuyv(frame)),
        }
        .map_err(SinkError::Write)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) {
        if let Err(e) = self.file.flush() {
            tracing::debug!("Flushing {} on close failed: {}", self.path.display(), e);
        }
        tracing::info!("v4l2loopback device {} closed", self.path.display());
    }
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Yuyv => FourCC::new(b"YUYV"),
    }
}

/// Pack a BGR frame as YUV 4:2:2, chroma averaged over each pixel pair
fn bgr_to_yuyv(frame: &Frame) -> Vec<u8> {
    let (width, height) = frame.dimensions();
    let mut yuyv = Vec::with_capacity((width.div_ceil(2) * 4 * height) as usize);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let first = frame.pixel(x, y);
            let second = if x + 1 < width { frame.pixel(x + 1, y) } else { first };

            let (y1, u1, v1) = bgr_to_yuv(first);
            let (y2, u2, v2) = bgr_to_yuv(second);
            let u = ((u1 as u16 + u2 as u16) / 2) as u8;
            let v = ((v1 as u16 + v2 as u16) / 2) as u8;

            yuyv.extend_from_slice(&[y1, u, y2, v]);
        }
    }

    yuyv
}

fn bgr_to_yuv([b, g, r]: [u8; 3]) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;

    let y = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
    let u = ((-0.147 * r - 0.289 * g + 0.436 * b) + 128.0).clamp(0.0, 255.0) as u8;
    let v = ((0.615 * r - 0.515 * g - 0.100 * b) + 128.0).clamp(0.0, 255.0) as u8;

    (y, u, v)
}
