//! Memory Monitor
//!
//! Samples OS memory telemetry on a fixed interval and reports pressure to
//! the cache, which answers with an eviction sweep.
//!
//! # Platform Support
//!
//! - **Linux**: parses `/proc/meminfo`
//! - **Other platforms**: no telemetry; the state stays Normal with an
//!   unknown load

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::params::CacheParams;
use crate::error::{Error, Result};

/// Tri-state memory signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AvailableMemoryState {
    /// No pressure
    #[default]
    Normal,
    /// Load at or above the critical percentage; the OS is likely paging
    Swapping,
    /// Available memory below the low-memory threshold
    Low,
}

/// Raw OS memory figures, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
}

impl MemorySample {
    /// Percentage of physical memory in use
    pub fn load_percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        ((used.saturating_mul(100)) / self.total_bytes).min(100) as u8
    }

    /// Swap space in use
    pub fn swap_used_bytes(&self) -> u64 {
        self.swap_total_bytes.saturating_sub(self.swap_free_bytes)
    }
}

/// Memory state as last seen by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryStatus {
    pub state: AvailableMemoryState,
    /// Memory load percentage; None when telemetry is unavailable
    pub load_percent: Option<u8>,
    pub available_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl MemoryStatus {
    /// Classify a sample against the cache thresholds
    pub fn classify(sample: Option<MemorySample>, params: &CacheParams) -> Self {
        let Some(sample) = sample else {
            return Self {
                sampled_at: Some(Utc::now()),
                ..Default::default()
            };
        };

        let load = sample.load_percent();
        let state = if sample.available_bytes < params.low_memory_bytes() {
            AvailableMemoryState::Low
        } else if load >= params.critical_memory_load_percent {
            AvailableMemoryState::Swapping
        } else {
            AvailableMemoryState::Normal
        };

        Self {
            state,
            load_percent: Some(load),
            available_bytes: Some(sample.available_bytes),
            total_bytes: Some(sample.total_bytes),
            sampled_at: Some(Utc::now()),
        }
    }

    /// Whether an eviction sweep should run
    #[inline]
    pub fn under_pressure(&self) -> bool {
        self.state != AvailableMemoryState::Normal
    }
}

/// Source of memory telemetry
pub trait MemorySampler: Send + Sync {
    /// Current figures, or None if unavailable
    fn sample(&self) -> Option<MemorySample>;
}

/// Reads the operating system's memory figures
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemorySampler;

impl MemorySampler for SystemMemorySampler {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> Option<MemorySample> {
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(content) => parse_meminfo(&content),
            Err(e) => {
                warn!("Failed to read /proc/meminfo: {}", e);
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> Option<MemorySample> {
        None
    }
}

/// Parse `/proc/meminfo` content
///
/// Format: `MemTotal:       16384000 kB`
pub fn parse_meminfo(content: &str) -> Option<MemorySample> {
    let mut total = None;
    let mut available = None;
    let mut free = 0u64;
    let mut buffers = 0u64;
    let mut cached = 0u64;
    let mut swap_total = 0u64;
    let mut swap_free = 0u64;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        let bytes = kb.saturating_mul(1024);

        match name {
            "MemTotal:" => total = Some(bytes),
            "MemAvailable:" => available = Some(bytes),
            "MemFree:" => free = bytes,
            "Buffers:" => buffers = bytes,
            "Cached:" => cached = bytes,
            "SwapTotal:" => swap_total = bytes,
            "SwapFree:" => swap_free = bytes,
            _ => {}
        }
    }

    // Kernels before 3.14 have no MemAvailable
    let total = total?;
    let available = available.unwrap_or(free + buffers + cached).min(total);

    Some(MemorySample {
        total_bytes: total,
        available_bytes: available,
        swap_total_bytes: swap_total,
        swap_free_bytes: swap_free,
    })
}

/// Receiver of monitor ticks
pub trait PressureHandler: Send + Sync {
    /// Current thresholds and interval
    fn params(&self) -> CacheParams;

    /// Called when a sample shows pressure
    fn on_pressure(&self, status: &MemoryStatus);
}

/// Background thread polling memory telemetry
pub struct MemoryMonitor {
    latest: Arc<RwLock<MemoryStatus>>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryMonitor {
    /// Start polling. The thread exits when stopped or when the handler is
    /// dropped.
    pub fn spawn(
        sampler: Arc<dyn MemorySampler>,
        handler: Weak<dyn PressureHandler>,
        latest: Arc<RwLock<MemoryStatus>>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let thread_latest = Arc::clone(&latest);

        let handle = std::thread::Builder::new()
            .name("tiercache-memory-monitor".into())
            .spawn(move || loop {
                let Some(handler) = handler.upgrade() else {
                    debug!("Cache dropped, memory monitor exiting");
                    break;
                };

                let params = handler.params();
                let status = MemoryStatus::classify(sampler.sample(), &params);
                *thread_latest.write() = status;

                if status.under_pressure() {
                    info!(
                        state = ?status.state,
                        load_percent = ?status.load_percent,
                        available_bytes = ?status.available_bytes,
                        "Memory pressure detected, running eviction sweep"
                    );
                    handler.on_pressure(&status);
                }

                let interval = params.check_memory_interval().max(Duration::from_millis(1));
                drop(handler);

                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(Error::MonitorSpawn)?;

        Ok(Self {
            latest,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Last status recorded by the thread
    pub fn latest(&self) -> MemoryStatus {
        *self.latest.read()
    }

    /// Whether the polling thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            // The last Arc of the cache may be released on this very thread
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Memory monitor thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("running", &self.is_running())
            .field("latest", &self.latest())
            .finish()
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const MB: u64 = 1024 * 1024;

    fn sample(total_mb: u64, available_mb: u64) -> MemorySample {
        MemorySample {
            total_bytes: total_mb * MB,
            available_bytes: available_mb * MB,
            swap_total_bytes: 0,
            swap_free_bytes: 0,
        }
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16384000 kB\n\
                       MemFree:         1000000 kB\n\
                       MemAvailable:    8192000 kB\n\
                       SwapTotal:       2048000 kB\n\
                       SwapFree:        1024000 kB\n";
        let sample = parse_meminfo(content).unwrap();
        assert_eq!(sample.total_bytes, 16_384_000 * 1024);
        assert_eq!(sample.available_bytes, 8_192_000 * 1024);
        assert_eq!(sample.swap_used_bytes(), 1_024_000 * 1024);
        assert_eq!(sample.load_percent(), 50);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let content = "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 50 kB\n";
        let sample = parse_meminfo(content).unwrap();
        assert_eq!(sample.available_bytes, 200 * 1024);
        assert_eq!(sample.load_percent(), 80);
    }

    #[test]
    fn test_parse_meminfo_garbage() {
        assert!(parse_meminfo("").is_none());
        assert!(parse_meminfo("nonsense here\n").is_none());
    }

    #[test]
    fn test_classify_states() {
        let params = CacheParams {
            low_memory_size_mb: 100,
            critical_memory_load_percent: 90,
            ..Default::default()
        };

        let normal = MemoryStatus::classify(Some(sample(1000, 500)), &params);
        assert_eq!(normal.state, AvailableMemoryState::Normal);
        assert_eq!(normal.load_percent, Some(50));
        assert!(!normal.under_pressure());

        let swapping = MemoryStatus::classify(Some(sample(10_000, 500)), &params);
        assert_eq!(swapping.state, AvailableMemoryState::Swapping);

        let low = MemoryStatus::classify(Some(sample(1000, 50)), &params);
        assert_eq!(low.state, AvailableMemoryState::Low);
        assert!(low.under_pressure());
    }

    #[test]
    fn test_classify_unknown() {
        let status = MemoryStatus::classify(None, &CacheParams::default());
        assert_eq!(status.state, AvailableMemoryState::Normal);
        assert_eq!(status.load_percent, None);
    }

    #[test]
    fn test_system_sampler_does_not_panic() {
        let sample = SystemMemorySampler.sample();
        if let Some(sample) = sample {
            assert!(sample.total_bytes > 0);
            assert!(sample.load_percent() <= 100);
        }
    }

    struct FixedSampler(MemorySample);

    impl MemorySampler for FixedSampler {
        fn sample(&self) -> Option<MemorySample> {
            Some(self.0)
        }
    }

    struct CountingHandler {
        params: CacheParams,
        pressure_calls: AtomicUsize,
    }

    impl PressureHandler for CountingHandler {
        fn params(&self) -> CacheParams {
            self.params.clone()
        }

        fn on_pressure(&self, _status: &MemoryStatus) {
            self.pressure_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_monitor_reports_pressure_and_stops() {
        let handler = Arc::new(CountingHandler {
            params: CacheParams {
                low_memory_size_mb: 100,
                check_memory_interval_ms: 5,
                ..Default::default()
            },
            pressure_calls: AtomicUsize::new(0),
        });
        let weak: Weak<dyn PressureHandler> = Arc::downgrade(&handler) as Weak<dyn PressureHandler>;

        let mut monitor = MemoryMonitor::spawn(
            Arc::new(FixedSampler(sample(1000, 10))),
            weak,
            Arc::new(RwLock::new(MemoryStatus::default())),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.pressure_calls.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(handler.pressure_calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(monitor.latest().state, AvailableMemoryState::Low);

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_monitor_exits_when_handler_dropped() {
        let handler = Arc::new(CountingHandler {
            params: CacheParams {
                check_memory_interval_ms: 5,
                ..Default::default()
            },
            pressure_calls: AtomicUsize::new(0),
        });
        let weak: Weak<dyn PressureHandler> = Arc::downgrade(&handler) as Weak<dyn PressureHandler>;
        let monitor = MemoryMonitor::spawn(
            Arc::new(FixedSampler(sample(1000, 900))),
            weak,
            Arc::new(RwLock::new(MemoryStatus::default())),
        )
        .unwrap();

        drop(handler);
        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!monitor.is_running());
    }
}
