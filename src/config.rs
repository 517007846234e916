use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Result, WatchError};

/// Default heartbeat interval `T`.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Number of heartbeat intervals of silence tolerated before a peer is
/// declared dead. Misses of 2x and 3x are common under load, so this is
/// deliberately high.
pub const DEFAULT_CRASH_DETECTION_CYCLES: u32 = 12;

/// Extra patience added on top of `T * cycles`, matters most for small `T`.
pub const DEFAULT_PADDING_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Identifier of the local node, stable across restarts on one machine.
    pub host_id: String,
    pub heartbeat_interval_ms: u64,
    pub crash_detection_cycles: u32,
    pub padding_ms: u64,
    /// How early a heartbeat may land relative to the previous stamp before
    /// it is reported as suspicious.
    pub jitter_tolerance_ms: u64,
    /// Diagnostics switch. When false the crash detector cycle does nothing.
    pub crash_detection_enabled: bool,
    /// Cadence of the crash detector. `None` follows the heartbeat interval.
    pub detector_interval_ms: Option<u64>,
    pub zombie_check_interval_ms: u64,
    /// Pause between the two zombie samples.
    pub zombie_sample_gap_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            host_id: "localhost".to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            crash_detection_cycles: DEFAULT_CRASH_DETECTION_CYCLES,
            padding_ms: DEFAULT_PADDING_MS,
            jitter_tolerance_ms: 100,
            crash_detection_enabled: true,
            detector_interval_ms: None,
            zombie_check_interval_ms: 60_000,
            zombie_sample_gap_ms: 1_000,
            lock_timeout_ms: 5_000,
        }
    }
}

impl WatchConfig {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_crash_detection_cycles(mut self, cycles: u32) -> Self {
        self.crash_detection_cycles = cycles;
        self
    }

    pub fn with_padding_ms(mut self, padding_ms: u64) -> Self {
        self.padding_ms = padding_ms;
        self
    }

    pub fn with_detector_interval_ms(mut self, interval_ms: u64) -> Self {
        self.detector_interval_ms = Some(interval_ms);
        self
    }

    pub fn with_zombie_check_interval_ms(mut self, interval_ms: u64) -> Self {
        self.zombie_check_interval_ms = interval_ms;
        self
    }

    pub fn with_zombie_sample_gap_ms(mut self, gap_ms: u64) -> Self {
        self.zombie_sample_gap_ms = gap_ms;
        self
    }

    pub fn with_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    pub fn with_crash_detection(mut self, enabled: bool) -> Self {
        self.crash_detection_enabled = enabled;
        self
    }

    /// Reject settings that would make a worker spin or flag every peer.
    pub fn validate(&self) -> Result<()> {
        if self.host_id.trim().is_empty() {
            return Err(WatchError::Config("host_id must not be empty".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(WatchError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.crash_detection_cycles == 0 {
            return Err(WatchError::Config(
                "crash_detection_cycles must be positive".to_string(),
            ));
        }
        if self.detector_interval_ms == Some(0) || self.zombie_check_interval_ms == 0 {
            return Err(WatchError::Config(
                "detector intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn detector_interval(&self) -> Duration {
        Duration::from_millis(
            self.detector_interval_ms
                .unwrap_or(self.heartbeat_interval_ms),
        )
    }

    pub fn zombie_check_interval(&self) -> Duration {
        Duration::from_millis(self.zombie_check_interval_ms)
    }

    pub fn zombie_sample_gap(&self) -> Duration {
        Duration::from_millis(self.zombie_sample_gap_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Silence after which a peer is considered crashed:
    /// `T * crash_detection_cycles + padding`.
    pub fn staleness_threshold(&self) -> Duration {
        self.late_threshold(self.crash_detection_cycles)
    }

    /// Silence after which a peer is merely reported as having missed a beat.
    pub fn missed_heartbeat_threshold(&self) -> Duration {
        self.late_threshold(1)
    }

    fn late_threshold(&self, cycles: u32) -> Duration {
        let interval_ms = self.heartbeat_interval_ms.saturating_mul(cycles as u64);
        Duration::from_millis(interval_ms.saturating_add(self.padding_ms))
    }
}

/// Shared, live-reloadable configuration.
///
/// Workers read the current value at the start of every cycle and wake from
/// their sleep when it changes.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<WatchConfig>>,
}

impl ConfigHandle {
    pub fn new(config: WatchConfig) -> Self {
        let (tx, _rx) = watch::channel(config);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> WatchConfig {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchConfig> {
        self.tx.subscribe()
    }

    /// Replace the configuration after validating it.
    pub fn update(&self, config: WatchConfig) -> Result<()> {
        config.validate()?;
        self.tx.send_replace(config);
        Ok(())
    }

    /// Apply an in-place change to the configuration.
    pub fn modify(&self, f: impl FnOnce(&mut WatchConfig)) -> Result<()> {
        let mut config = self.current();
        f(&mut config);
        self.update(config)
    }
}
