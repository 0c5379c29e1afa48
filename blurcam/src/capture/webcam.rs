use super::{CameraBackend, CameraMode, CameraSource};
use crate::error::CameraError;
use crate::frame::Frame;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;

/// Physical webcams through nokhwa
#[derive(Debug, Default, Clone, Copy)]
pub struct WebcamBackend;

impl CameraBackend for WebcamBackend {
    fn open(&self, index: u32) -> Result<Box<dyn CameraSource>, CameraError> {
        tracing::info!("Opening webcam {}", index);

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        let camera = Camera::new(CameraIndex::Index(index), requested).map_err(|e| {
            CameraError::Open {
                index,
                reason: e.to_string(),
            }
        })?;

        tracing::info!("Webcam opened: {}", camera.info().human_name());

        Ok(Box::new(WebcamCapture {
            index,
            camera: Some(camera),
        }))
    }
}

pub struct WebcamCapture {
    index: u32,
    camera: Option<Camera>,
}

impl CameraSource for WebcamCapture {
    fn configure(&mut self, width: u32, height: u32, fps: u32) -> Result<CameraMode, CameraError> {
        let configure_error = |reason: String| CameraError::Configure {
            width,
            height,
            fps,
            reason,
        };

        // Reopen with the closest format the device offers to the request.
        self.close();
        let format = CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, fps);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));
        let mut camera = Camera::new(CameraIndex::Index(self.index), requested)
            .map_err(|e| configure_error(e.to_string()))?;

        camera
            .open_stream()
            .map_err(|e| configure_error(format!("failed to open camera stream: {e}")))?;

        let resolution = camera.resolution();
        let actual = CameraMode {
            width: resolution.width(),
            height: resolution.height(),
            fps: camera.frame_rate(),
        };
        self.camera = Some(camera);

        Ok(actual)
    }

    fn read(&mut self) -> Option<Frame> {
        let camera = self.camera.as_mut()?;

        let frame = match camera.frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Failed to capture frame: {}", e);
                return None;
            }
        };

        match frame.decode_image::<RgbFormat>() {
            Ok(decoded) => Some(Frame::from_rgb_image(&decoded)),
            Err(e) => {
                tracing::debug!("Failed to decode frame: {}", e);
                None
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop_stream() {
                tracing::debug!("Failed to stop camera stream: {}", e);
            }
            tracing::info!("Webcam {} released", self.index);
        }
    }
}
