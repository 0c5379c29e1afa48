mod loopback;

pub use loopback::{V4L2Output, V4l2LoopbackBackend};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::FrameBuffer;
use crate::error::SinkError;
use crate::frame::Frame;
use crate::performance::PerformanceMonitor;

/// How long the consumer waits on an empty queue before rechecking the stop flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pixel layout written to the virtual camera device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgr24,
    Yuyv,
}

/// What the pipeline asks of a virtual camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: PixelFormat,
    /// Device to try first; backends fall back to their default
    pub preferred_name: Option<String>,
}

/// Trait for output destinations
pub trait VirtualCameraSink: Send {
    /// Write a frame, blocking to hold the sink's frame rate.
    /// Frames must already be at `resolution()`.
    fn send(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// Get the expected output resolution
    fn resolution(&self) -> (u32, u32);

    fn close(&mut self);
}

/// Creates virtual camera sinks
pub trait SinkBackend: Send + Sync {
    fn open(&self, spec: &SinkSpec) -> Result<Box<dyn VirtualCameraSink>, SinkError>;
}

/// Written only by the output path
#[derive(Debug, Default)]
pub struct OutputCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl OutputCounters {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames evicted from the output queue or rejected by the sink
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer side of the output stage
#[derive(Clone)]
pub struct OutputQueue {
    queue: Arc<FrameBuffer<Frame>>,
    width: u32,
    height: u32,
    counters: Arc<OutputCounters>,
}

impl OutputQueue {
    pub fn new(
        queue: Arc<FrameBuffer<Frame>>,
        resolution: (u32, u32),
        counters: Arc<OutputCounters>,
    ) -> Self {
        Self {
            queue,
            width: resolution.0,
            height: resolution.1,
            counters,
        }
    }

    /// Resize to the sink resolution and enqueue, evicting the oldest frame if full
    ///
    /// Returns false when an older frame had to be dropped to make room.
    pub fn send(&self, frame: Frame) -> bool {
        let frame = if frame.dimensions() != (self.width, self.height) {
            frame.resized(self.width, self.height)
        } else {
            frame
        };
        if self.queue.push_latest(frame).is_some() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

/// Virtual camera writer running on its own thread
pub struct OutputStage {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl OutputStage {
    /// Take ownership of `sink` and start draining `queue` into it
    pub fn start(
        mut sink: Box<dyn VirtualCameraSink>,
        queue: Arc<FrameBuffer<Frame>>,
        counters: Arc<OutputCounters>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Result<Self, SinkError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let thread_handle = std::thread::Builder::new()
            .name("virtual-camera".to_string())
            .spawn(move || {
                run(sink.as_mut(), &queue, &running_clone, &counters, &monitor);
                sink.close();
                tracing::info!("Virtual camera thread stopped");
            })
            .map_err(SinkError::Spawn)?;

        Ok(Self {
            running,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Stop the consumer and wait for the sink to be closed. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Virtual camera thread panicked");
            }
        }
    }
}

impl Drop for OutputStage {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    sink: &mut dyn VirtualCameraSink,
    queue: &FrameBuffer<Frame>,
    running: &AtomicBool,
    counters: &OutputCounters,
    monitor: &PerformanceMonitor,
) {
    tracing::info!("Virtual camera thread started");

    while running.load(Ordering::Acquire) {
        let Some(frame) = queue.pop_timeout(POLL_INTERVAL) else {
            continue;
        };
        match sink.send(&frame) {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                monitor.record_delivery(frame.timestamp);
            }
            Err(e) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to send frame to virtual camera: {}", e);
            }
        }
    }
}
