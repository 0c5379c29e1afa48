pub mod buffer;
pub mod capture;
pub mod compositor;
pub mod config;
pub mod error;
pub mod filters;
pub mod frame;
pub mod output;
pub mod performance;
pub mod pipeline;
pub mod refine;
pub mod segmentation;

pub use buffer::FrameBuffer;
pub use capture::{CameraBackend, CameraMode, CameraSource, CaptureStage, WebcamBackend};
pub use compositor::{BlurPlan, Compositor};
pub use config::{BlurAlgorithm, EffectSettings, LiveSettings, PipelineConfig};
pub use error::{CameraError, SinkError, StartError};
pub use frame::{Frame, Mask};
pub use output::{
    OutputQueue, OutputStage, PixelFormat, SinkBackend, SinkSpec, V4l2LoopbackBackend,
    VirtualCameraSink,
};
pub use performance::{
    PerformanceGrade, PerformanceMonitor, PerformanceStats, SystemMetrics, SystemSampler,
};
pub use pipeline::{PipelineCoordinator, PipelineState, PipelineStats, ProcessingStage};
pub use refine::MaskRefiner;
pub use segmentation::{
    Matte, ModelFactory, ModelMode, OnnxModelFactory, SegmentationModel, SegmentationStage,
};
