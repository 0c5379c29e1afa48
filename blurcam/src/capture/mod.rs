mod webcam;

pub use webcam::WebcamBackend;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::buffer::FrameBuffer;
use crate::error::CameraError;
use crate::frame::Frame;

/// Resolution and frame rate, as requested or as negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CameraMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl std::fmt::Display for CameraMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)
    }
}

/// An opened camera device
///
/// Lives entirely on the capture thread, so it doesn't need to be `Send`.
pub trait CameraSource {
    /// Request a mode. Returns the mode the device actually delivers,
    /// which may differ from the request.
    fn configure(&mut self, width: u32, height: u32, fps: u32) -> Result<CameraMode, CameraError>;

    /// Block until the next frame. `None` is a transient miss.
    fn read(&mut self) -> Option<Frame>;

    fn close(&mut self);
}

/// Opens camera devices by index
pub trait CameraBackend: Send + Sync {
    fn open(&self, index: u32) -> Result<Box<dyn CameraSource>, CameraError>;
}

/// Written only by the capture thread
#[derive(Debug, Default)]
pub struct CaptureCounters {
    captured: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureCounters {
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Frames evicted from the capture queue before processing saw them
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Pause after a missed read so a dead device doesn't spin a core
const READ_MISS_BACKOFF: Duration = Duration::from_millis(1);

/// Camera capture running on its own thread
pub struct CaptureStage {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    mode: CameraMode,
}

impl CaptureStage {
    /// Open camera `index`, request `requested`, and start capturing into `queue`
    ///
    /// The device is opened on the capture thread; this call waits until it
    /// reports the negotiated mode (or fails).
    pub fn initialize(
        backend: Arc<dyn CameraBackend>,
        index: u32,
        requested: CameraMode,
        queue: Arc<FrameBuffer<Frame>>,
        counters: Arc<CaptureCounters>,
    ) -> Result<Self, CameraError> {
        tracing::info!("Initializing camera {} at {}", index, requested);

        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<CameraMode, CameraError>>(1);

        let running_clone = running.clone();
        let thread_handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                let mut source = match open_and_configure(backend.as_ref(), index, requested) {
                    Ok((source, mode)) => {
                        let _ = ready_tx.send(Ok(mode));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                run(source.as_mut(), &queue, &running_clone, &counters);
                source.close();
                tracing::info!("Camera capture thread stopped");
            })
            .map_err(CameraError::Spawn)?;

        let mode = match ready_rx.recv() {
            Ok(Ok(mode)) => mode,
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread_handle.join();
                return Err(CameraError::Disconnected);
            }
        };

        if mode != requested {
            tracing::warn!("Camera delivers {} instead of requested {}", mode, requested);
        }
        tracing::info!("Camera initialized at {}", mode);

        Ok(Self {
            running,
            thread_handle: Some(thread_handle),
            mode,
        })
    }

    /// The mode the camera actually delivers
    pub fn mode(&self) -> CameraMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Stop capturing and wait for the device to be released. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Camera capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureStage {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_and_configure(
    backend: &dyn CameraBackend,
    index: u32,
    requested: CameraMode,
) -> Result<(Box<dyn CameraSource>, CameraMode), CameraError> {
    let mut source = backend.open(index)?;
    match source.configure(requested.width, requested.height, requested.fps) {
        Ok(mode) => Ok((source, mode)),
        Err(e) => {
            source.close();
            Err(e)
        }
    }
}

/// Capture loop: read, push latest, repeat until stopped
fn run(
    source: &mut dyn CameraSource,
    queue: &FrameBuffer<Frame>,
    running: &AtomicBool,
    counters: &CaptureCounters,
) {
    tracing::info!("Camera capture thread started");

    while running.load(Ordering::Acquire) {
        match source.read() {
            Some(frame) => {
                counters.captured.fetch_add(1, Ordering::Relaxed);
                if queue.push_latest(frame).is_some() {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => std::thread::sleep(READ_MISS_BACKOFF),
        }
    }
}
