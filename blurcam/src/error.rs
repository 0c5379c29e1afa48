use thiserror::Error;

/// Failures opening or configuring the physical camera
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("failed to open camera {index}: {reason}")]
    Open { index: u32, reason: String },

    #[error("camera rejected mode {width}x{height}@{fps}: {reason}")]
    Configure {
        width: u32,
        height: u32,
        fps: u32,
        reason: String,
    },

    #[error("camera thread exited before reporting its mode")]
    Disconnected,

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failures opening or writing to the virtual camera sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no virtual camera device available: {0}")]
    Unavailable(String),

    #[error("failed to configure virtual camera {device}: {reason}")]
    Configure { device: String, reason: String },

    #[error("failed to write frame: {0}")]
    Write(#[source] std::io::Error),

    #[error("frame is {actual_width}x{actual_height}, sink expects {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("failed to spawn output thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Reasons `PipelineCoordinator::start` refuses to start.
///
/// The `Display` output is the single human-readable reason shown to users.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("camera: {0}")]
    Camera(#[from] CameraError),

    #[error("segmentation model: {0:#}")]
    Model(anyhow::Error),

    #[error("virtual camera: {0}")]
    Sink(#[from] SinkError),

    #[error("failed to spawn processing thread: {0}")]
    Spawn(#[source] std::io::Error),
}
