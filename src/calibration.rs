//! Clock Calibration Module
//!
//! At boot the wall clock may not be set yet (no battery-backed RTC, NTP not
//! synced). The calibrator polls the clock until it crosses a sanity threshold
//! and only then records the process start time, corrected for the time spent
//! polling. If the clock never crosses the threshold the start time stays
//! unset and uptime is reported as unknown.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::config::CalibrationConfig;

/// 2021-01-01T00:00:00Z in epoch milliseconds
pub const DEFAULT_THRESHOLD_MS: i64 = 1_609_459_200_000;

/// Source of wall-clock time in epoch milliseconds
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        // A clock before the epoch reads as 0, which is below any threshold
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A manually driven clock that counts how often it is read
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
    reads: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now_ms)),
            reads: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Number of times `now_ms` has been called
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.now.load(Ordering::SeqCst)
    }
}

/// Write-once process start timestamp shared between the calibrator and the bridge
#[derive(Debug, Default, Clone)]
pub struct StartedAt(Arc<OnceLock<i64>>);

impl StartedAt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start time in epoch milliseconds, if calibration succeeded
    pub fn get(&self) -> Option<i64> {
        self.0.get().copied()
    }

    /// Record the start time. Returns false if it was already set.
    pub fn set(&self, epoch_ms: i64) -> bool {
        self.0.set(epoch_ms).is_ok()
    }

    /// Milliseconds since start, or `None` while unset
    pub fn uptime(&self, now_ms: i64) -> Option<i64> {
        self.get().map(|started| now_ms - started)
    }
}

/// Terminal result of a calibration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// The clock crossed the threshold and the start time was recorded
    Accepted {
        started_at: i64,
        attempts: u32,
        offset_ms: i64,
    },
    /// The attempt budget ran out before the clock was trusted
    Exhausted { attempts: u32 },
}

/// Derives a trustworthy process start time from a possibly unsynchronized clock
pub struct ClockCalibrator {
    name: String,
    config: CalibrationConfig,
    clock: SharedClock,
    started_at: StartedAt,
    attempts: u32,
    elapsed_offset_ms: i64,
    outcome: Option<CalibrationOutcome>,
}

impl ClockCalibrator {
    pub fn new(
        name: impl Into<String>,
        config: CalibrationConfig,
        clock: SharedClock,
        started_at: StartedAt,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            started_at,
            attempts: 0,
            elapsed_offset_ms: 0,
            outcome: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn outcome(&self) -> Option<CalibrationOutcome> {
        self.outcome
    }

    /// Perform one poll step.
    ///
    /// Returns the terminal outcome once reached. After that, further calls
    /// return the same outcome without touching the clock.
    pub fn poll(&mut self) -> Option<CalibrationOutcome> {
        if self.outcome.is_some() {
            return self.outcome;
        }

        self.attempts += 1;
        self.elapsed_offset_ms += self.config.interval.as_millis() as i64;

        let now = self.clock.now_ms();
        if now > self.config.threshold_ms {
            let offset_ms = if self.config.offset_correction {
                self.elapsed_offset_ms
            } else {
                0
            };
            let started_at = now - offset_ms;
            self.started_at.set(started_at);

            info!(
                "Bridge '{}': Clock calibrated after {} attempt(s), started at {}",
                self.name, self.attempts, started_at
            );
            self.outcome = Some(CalibrationOutcome::Accepted {
                started_at,
                attempts: self.attempts,
                offset_ms,
            });
        } else if self.attempts >= self.config.max_attempts {
            warn!(
                "Bridge '{}': Clock not trusted after {} attempts, uptime will be unknown",
                self.name, self.attempts
            );
            self.outcome = Some(CalibrationOutcome::Exhausted {
                attempts: self.attempts,
            });
        } else {
            debug!(
                "Bridge '{}': Clock reads {} (threshold {}), attempt {}/{}",
                self.name, now, self.config.threshold_ms, self.attempts, self.config.max_attempts
            );
        }

        self.outcome
    }

    /// Poll on a fixed interval until a terminal outcome.
    ///
    /// The first poll happens one interval after start. The interval is
    /// dropped when this returns, so no poll follows the outcome.
    pub async fn run(mut self) -> CalibrationOutcome {
        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            ticker.tick().await;
            if let Some(outcome) = self.poll() {
                return outcome;
            }
        }
    }

    /// Run on a background task
    pub fn spawn(self) -> JoinHandle<CalibrationOutcome> {
        tokio::spawn(self.run())
    }
}
