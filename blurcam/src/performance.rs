use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

const HISTORY: usize = 100;
const FPS_WINDOW: Duration = Duration::from_secs(1);
pub const SYSTEM_METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// One observation fed into the monitor
#[derive(Debug, Clone, Copy)]
pub struct PerformanceSample {
    pub timestamp: Instant,
    pub processing_duration: Option<Duration>,
    /// A frame left the pipeline
    pub fps_tick: bool,
    /// Capture-to-output time of the frame that left
    pub latency: Option<Duration>,
}

/// Host-wide CPU and memory load
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Samples host load no more often than its interval
///
/// CPU usage is a delta between refreshes, so the first reading is 0.
pub struct SystemSampler {
    system: System,
    interval: Duration,
    last_sample: Option<Instant>,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new(SYSTEM_METRICS_INTERVAL)
    }
}

impl SystemSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            system: System::new(),
            interval,
            last_sample: None,
        }
    }

    /// Refresh and return fresh metrics once `interval` has passed since the last reading
    pub fn poll(&mut self, now: Instant) -> Option<SystemMetrics> {
        if self
            .last_sample
            .is_some_and(|last| now.saturating_duration_since(last) < self.interval)
        {
            return None;
        }
        self.last_sample = Some(now);

        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64 * 100.0
        };
        Some(SystemMetrics {
            cpu_percent: self.system.global_cpu_usage() as f64,
            memory_percent,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub current_fps: f64,
    pub average_fps: f64,
    pub min_fps: f64,
    pub max_fps: f64,
    pub current_processing_ms: f64,
    pub average_processing_ms: f64,
    pub min_processing_ms: f64,
    pub max_processing_ms: f64,
    pub current_latency_ms: f64,
    pub average_latency_ms: f64,
    pub system: SystemMetrics,
}

/// Qualitative summary of `PerformanceStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PerformanceGrade {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl PerformanceGrade {
    pub fn from_stats(stats: &PerformanceStats) -> Self {
        let fps = stats.current_fps;
        let ms = stats.current_processing_ms;
        if fps >= 25.0 && ms <= 40.0 {
            PerformanceGrade::Excellent
        } else if fps >= 20.0 && ms <= 60.0 {
            PerformanceGrade::Good
        } else if fps >= 15.0 && ms <= 80.0 {
            PerformanceGrade::Acceptable
        } else {
            PerformanceGrade::Poor
        }
    }
}

impl std::fmt::Display for PerformanceGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PerformanceGrade::Excellent => "excellent",
            PerformanceGrade::Good => "good",
            PerformanceGrade::Acceptable => "acceptable",
            PerformanceGrade::Poor => "poor",
        };
        f.write_str(label)
    }
}

struct MonitorState {
    window_start: Instant,
    window_frames: u32,
    current_fps: f64,
    fps_history: VecDeque<f64>,
    current_processing: Duration,
    processing_times: VecDeque<Duration>,
    current_latency: Duration,
    latencies: VecDeque<Duration>,
    system: SystemMetrics,
}

impl MonitorState {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            window_frames: 0,
            current_fps: 0.0,
            fps_history: VecDeque::with_capacity(HISTORY),
            current_processing: Duration::ZERO,
            processing_times: VecDeque::with_capacity(HISTORY),
            current_latency: Duration::ZERO,
            latencies: VecDeque::with_capacity(HISTORY),
            system: SystemMetrics::default(),
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T) {
    if queue.len() == HISTORY {
        queue.pop_front();
    }
    queue.push_back(value);
}

pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState::new(Instant::now())),
        }
    }

    /// Forget all history and start a fresh FPS window
    pub fn reset(&self) {
        *self.state.lock() = MonitorState::new(Instant::now());
    }

    pub fn record(&self, sample: PerformanceSample) {
        let mut state = self.state.lock();
        if let Some(duration) = sample.processing_duration {
            state.current_processing = duration;
            push_bounded(&mut state.processing_times, duration);
        }
        if let Some(latency) = sample.latency {
            state.current_latency = latency;
            push_bounded(&mut state.latencies, latency);
        }
        if sample.fps_tick {
            state.window_frames += 1;
            let elapsed = sample.timestamp.saturating_duration_since(state.window_start);
            if elapsed >= FPS_WINDOW {
                let fps = state.window_frames as f64 / elapsed.as_secs_f64();
                state.current_fps = fps;
                push_bounded(&mut state.fps_history, fps);
                state.window_frames = 0;
                state.window_start = sample.timestamp;
            }
        }
    }

    /// Count one delivered frame captured at `captured_at`
    pub fn record_delivery(&self, captured_at: Instant) {
        let now = Instant::now();
        self.record(PerformanceSample {
            timestamp: now,
            processing_duration: None,
            fps_tick: true,
            latency: Some(now.saturating_duration_since(captured_at)),
        });
    }

    pub fn record_processing_time(&self, duration: Duration) {
        self.record(PerformanceSample {
            timestamp: Instant::now(),
            processing_duration: Some(duration),
            fps_tick: false,
            latency: None,
        });
    }

    pub fn record_system_metrics(&self, metrics: SystemMetrics) {
        self.state.lock().system = metrics;
    }

    pub fn stats(&self) -> PerformanceStats {
        let state = self.state.lock();
        let ms = |d: &Duration| d.as_secs_f64() * 1000.0;

        let fps = &state.fps_history;
        let times = &state.processing_times;
        PerformanceStats {
            current_fps: state.current_fps,
            average_fps: mean(fps.iter().copied()),
            min_fps: fps.iter().copied().reduce(f64::min).unwrap_or(0.0),
            max_fps: fps.iter().copied().reduce(f64::max).unwrap_or(0.0),
            current_processing_ms: ms(&state.current_processing),
            average_processing_ms: mean(times.iter().map(ms)),
            min_processing_ms: times.iter().map(ms).reduce(f64::min).unwrap_or(0.0),
            max_processing_ms: times.iter().map(ms).reduce(f64::max).unwrap_or(0.0),
            current_latency_ms: ms(&state.current_latency),
            average_latency_ms: mean(state.latencies.iter().map(ms)),
            system: state.system,
        }
    }

    pub fn grade(&self) -> PerformanceGrade {
        PerformanceGrade::from_stats(&self.stats())
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(fps: f64, ms: f64) -> PerformanceStats {
        PerformanceStats {
            current_fps: fps,
            current_processing_ms: ms,
            ..Default::default()
        }
    }

    #[test]
    fn grade_bands() {
        assert_eq!(PerformanceGrade::from_stats(&stats(30.0, 20.0)), PerformanceGrade::Excellent);
        assert_eq!(PerformanceGrade::from_stats(&stats(30.0, 50.0)), PerformanceGrade::Good);
        assert_eq!(PerformanceGrade::from_stats(&stats(16.0, 70.0)), PerformanceGrade::Acceptable);
        assert_eq!(PerformanceGrade::from_stats(&stats(10.0, 10.0)), PerformanceGrade::Poor);
        assert_eq!(PerformanceGrade::from_stats(&stats(30.0, 90.0)), PerformanceGrade::Poor);
    }

    #[test]
    fn empty_monitor_reports_zeros() {
        let monitor = PerformanceMonitor::new();
        assert_eq!(monitor.stats(), PerformanceStats::default());
        assert_eq!(monitor.grade(), PerformanceGrade::Poor);
    }

    #[test]
    fn processing_times_are_aggregated() {
        let monitor = PerformanceMonitor::new();
        for ms in [10, 20, 30] {
            monitor.record_processing_time(Duration::from_millis(ms));
        }
        let stats = monitor.stats();
        assert!((stats.current_processing_ms - 30.0).abs() < 1e-9);
        assert!((stats.average_processing_ms - 20.0).abs() < 1e-9);
        assert!((stats.min_processing_ms - 10.0).abs() < 1e-9);
        assert!((stats.max_processing_ms - 30.0).abs() < 1e-9);
    }

    #[test]
    fn fps_is_computed_per_window() {
        let monitor = PerformanceMonitor::new();
        let start = monitor.state.lock().window_start;
        for i in 1..=30u64 {
            monitor.record(PerformanceSample {
                timestamp: start + Duration::from_millis(i * 1000 / 30),
                processing_duration: None,
                fps_tick: true,
                latency: None,
            });
        }
        let stats = monitor.stats();
        assert!((stats.current_fps - 30.0).abs() < 1e-6);
        assert!((stats.average_fps - 30.0).abs() < 1e-6);
    }

    #[test]
    fn delivery_latency_is_measured_from_capture() {
        let monitor = PerformanceMonitor::new();
        let captured_at = Instant::now() - Duration::from_millis(40);
        monitor.record_delivery(captured_at);
        let stats = monitor.stats();
        assert!(stats.current_latency_ms >= 40.0);
        assert!((stats.average_latency_ms - stats.current_latency_ms).abs() < 1e-9);
    }

    #[test]
    fn system_metrics_are_reported() {
        let monitor = PerformanceMonitor::new();
        let metrics = SystemMetrics {
            cpu_percent: 37.5,
            memory_percent: 61.0,
        };
        monitor.record_system_metrics(metrics);
        assert_eq!(monitor.stats().system, metrics);
        monitor.reset();
        assert_eq!(monitor.stats().system, SystemMetrics::default());
    }

    #[test]
    fn sampler_respects_interval() {
        let mut sampler = SystemSampler::new(Duration::from_secs(5));
        let start = Instant::now();

        let first = sampler.poll(start).unwrap();
        assert!((0.0..=100.0).contains(&first.memory_percent));
        assert!(first.cpu_percent >= 0.0);

        assert!(sampler.poll(start + Duration::from_secs(1)).is_none());
        assert!(sampler.poll(start + Duration::from_secs(5)).is_some());
    }

    #[test]
    fn history_is_bounded() {
        let monitor = PerformanceMonitor::new();
        for _ in 0..(HISTORY * 2) {
            monitor.record_processing_time(Duration::from_millis(1));
        }
        assert_eq!(monitor.state.lock().processing_times.len(), HISTORY);
    }
}
