//! CPU-adaptive rate control.
//!
//! Three cooperating pieces, kept separate so each is testable on its own:
//!
//! - [`CpuMonitor`] reads system and per-process CPU usage from procfs.
//! - [`AutoSkip`] turns CPU readings into a skip ratio with asymmetric
//!   hysteresis: it backs off fast when CPU runs hot and re-engages slowly,
//!   so the ratio never oscillates around the target.
//! - [`ClientActivity`] gates frame processing on the live client count and
//!   ramps duty up in phases after an idle camera gets its first client,
//!   avoiding the step-function CPU spike of a cold encoder.
//!
//! [`SourceRate`] and [`OutputPacer`] handle the capture-side timing: detect
//! the device's true delivery rate, and pace outputs to the target without
//! drift.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateSettings;

/// Seconds of history in the smoothing window (one reading per tick).
const HISTORY_SIZE: usize = 8;
/// Increase skip when instant CPU exceeds target by this much.
const HIGH_THRESHOLD: u32 = 8;
/// Decrease skip only when smoothed CPU is this far below target.
const LOW_THRESHOLD: u32 = 20;
/// Overage beyond which the response jumps multiple steps.
const EMERGENCY_THRESHOLD: u32 = 25;
/// Wait after an increase before any decrease is considered.
const COOLDOWN: Duration = Duration::from_secs(3);
/// Consecutive low smoothed readings required before a decrease.
const STABLE_COUNT: u32 = 6;

// ---------------------------------------------------------------------------
// Shared skip ratio handle
// ---------------------------------------------------------------------------

/// Skip ratio shared between the controller thread and capture drivers.
#[derive(Clone)]
pub struct RateHandle {
    skip: Arc<AtomicU32>,
}

impl RateHandle {
    pub fn new(initial: u32) -> Self {
        Self {
            skip: Arc::new(AtomicU32::new(initial.max(1))),
        }
    }

    pub fn skip_ratio(&self) -> u32 {
        self.skip.load(Ordering::Relaxed).max(1)
    }

    pub fn set_skip_ratio(&self, ratio: u32) {
        self.skip.store(ratio.max(1), Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// CPU accounting (procfs)
// ---------------------------------------------------------------------------

/// Reads system-wide and per-process CPU usage as deltas between calls.
///
/// The procfs root is injectable so tests can run against fixture files.
pub struct CpuMonitor {
    root: PathBuf,
    prev_total: u64,
    prev_idle: u64,
    total_pct: u32,
    procs: HashMap<u32, ProcSample>,
}

#[derive(Default, Clone, Copy)]
struct ProcSample {
    prev_jiffies: u64,
    prev_total: u64,
    pct: u32,
}

impl CpuMonitor {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut mon = Self {
            root: root.into(),
            prev_total: 0,
            prev_idle: 0,
            total_pct: 0,
            procs: HashMap::new(),
        };
        // Prime the deltas so the first update() yields a real reading.
        let _ = mon.update();
        mon
    }

    /// Refresh the system-wide reading. Returns the usage percentage.
    pub fn update(&mut self) -> Option<u32> {
        let (total, idle) = self.read_stat()?;
        if self.prev_total > 0 && total > self.prev_total {
            let total_diff = total - self.prev_total;
            let idle_diff = idle.saturating_sub(self.prev_idle);
            self.total_pct = (100 * total_diff.saturating_sub(idle_diff) / total_diff) as u32;
        }
        self.prev_total = total;
        self.prev_idle = idle;
        Some(self.total_pct)
    }

    pub fn total_pct(&self) -> u32 {
        self.total_pct
    }

    /// CPU percentage attributable to `pid` since the previous call for the
    /// same pid. Returns None when the process cannot be read.
    pub fn process_pct(&mut self, pid: u32) -> Option<u32> {
        let jiffies = self.read_pid_stat(pid)?;
        let entry = self.procs.entry(pid).or_default();
        let total_delta = self.prev_total.saturating_sub(entry.prev_total);
        if entry.prev_total > 0 && total_delta > 0 {
            let proc_delta = jiffies.saturating_sub(entry.prev_jiffies);
            entry.pct = (100 * proc_delta / total_delta) as u32;
        }
        entry.prev_jiffies = jiffies;
        entry.prev_total = self.prev_total;
        Some(entry.pct)
    }

    /// Drop accounting state for processes that no longer exist.
    pub fn forget(&mut self, pid: u32) {
        self.procs.remove(&pid);
    }

    fn read_stat(&self) -> Option<(u64, u64)> {
        let raw = std::fs::read_to_string(self.root.join("stat")).ok()?;
        let line = raw.lines().next()?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        // user nice system idle iowait irq softirq steal
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().take(8).sum();
        Some((total, idle))
    }

    fn read_pid_stat(&self, pid: u32) -> Option<u64> {
        let raw = std::fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        // Skip past the comm field, which may itself contain spaces.
        let rest = raw.rsplit_once(')')?.1;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // Fields after comm/state: ... utime is index 11, stime 12.
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }
}

impl Default for CpuMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Auto-skip state machine
// ---------------------------------------------------------------------------

/// Adjusts the skip ratio from periodic CPU readings.
pub struct AutoSkip {
    settings: RateSettings,
    skip: u32,
    history: [u32; HISTORY_SIZE],
    history_idx: usize,
    history_count: usize,
    stable_low: u32,
    last_increase: Option<Instant>,
}

impl AutoSkip {
    pub fn new(settings: RateSettings) -> Self {
        let skip = settings.skip_ratio.clamp(settings.min_skip, settings.max_skip);
        Self {
            settings,
            skip,
            history: [0; HISTORY_SIZE],
            history_idx: 0,
            history_count: 0,
            stable_low: 0,
            last_increase: None,
        }
    }

    pub fn skip_ratio(&self) -> u32 {
        self.skip
    }

    /// Adopt new settings without losing smoothing state.
    pub fn reconfigure(&mut self, settings: RateSettings) {
        self.skip = self.skip.clamp(settings.min_skip, settings.max_skip);
        self.settings = settings;
    }

    /// Feed one CPU reading; returns the (possibly unchanged) skip ratio.
    pub fn tick(&mut self, cpu_pct: u32, now: Instant) -> u32 {
        self.push_history(cpu_pct);
        let target = self.settings.target_cpu;
        let old = self.skip;

        if cpu_pct > target + HIGH_THRESHOLD {
            // Instant reading, proportional response: protect the printer
            // before smoothing can catch up.
            let overage = cpu_pct - target;
            let steps = if overage > EMERGENCY_THRESHOLD + 15 {
                4
            } else if overage > EMERGENCY_THRESHOLD {
                3
            } else if overage > HIGH_THRESHOLD + 7 {
                2
            } else {
                1
            };
            self.skip = (self.skip + steps).min(self.settings.max_skip);
            self.last_increase = Some(now);
            self.stable_low = 0;
        } else {
            match self.smoothed() {
                Some(avg) if avg + LOW_THRESHOLD < target => self.stable_low += 1,
                _ => self.stable_low = 0,
            }
            let cooled = self
                .last_increase
                .map(|at| now.duration_since(at) >= COOLDOWN)
                .unwrap_or(true);
            if cooled && self.stable_low >= STABLE_COUNT && self.skip > self.settings.min_skip {
                self.skip -= 1;
                self.stable_low = 0;
            }
        }

        if self.skip != old {
            log::info!(
                "auto-skip: cpu={}% (avg={}%, target={}%), skip {} -> {}",
                cpu_pct,
                self.smoothed().unwrap_or(cpu_pct),
                target,
                old,
                self.skip
            );
        }
        self.skip
    }

    fn push_history(&mut self, cpu: u32) {
        self.history[self.history_idx] = cpu;
        self.history_idx = (self.history_idx + 1) % HISTORY_SIZE;
        if self.history_count < HISTORY_SIZE {
            self.history_count += 1;
        }
    }

    fn smoothed(&self) -> Option<u32> {
        if self.history_count < 3 {
            return None;
        }
        let sum: u32 = self.history[..self.history_count].iter().sum();
        Some(sum / self.history_count as u32)
    }
}

// ---------------------------------------------------------------------------
// Client idle/ramp-up gate
// ---------------------------------------------------------------------------

/// Per-camera idle detection and post-connect warm-up.
///
/// Ramp phases after the first client connects: 25%, 50%, 75%, then full
/// duty, advancing once per second.
pub struct ClientActivity {
    prev_clients: usize,
    connected_at: Option<Instant>,
    phase: u8,
    frame_counter: u32,
}

impl ClientActivity {
    pub fn new() -> Self {
        Self {
            prev_clients: 0,
            connected_at: None,
            phase: 3,
            frame_counter: 0,
        }
    }

    /// Decide whether to process a frame given the live client count.
    /// Returns false while idle (zero clients) and during skipped ramp slots.
    pub fn should_process(&mut self, total_clients: usize, now: Instant) -> bool {
        if total_clients > 0 && self.prev_clients == 0 {
            self.connected_at = Some(now);
            self.phase = 0;
            self.frame_counter = 0;
            log::info!("client connected, starting ramp-up");
        } else if total_clients == 0 && self.prev_clients > 0 {
            self.connected_at = None;
            self.phase = 0;
            log::info!("all clients disconnected, going idle");
        }
        self.prev_clients = total_clients;

        if total_clients == 0 {
            return false;
        }

        if let Some(at) = self.connected_at {
            let elapsed = now.duration_since(at).as_secs().min(3) as u8;
            if elapsed != self.phase {
                self.phase = elapsed;
                self.frame_counter = 0;
            }
        }

        self.frame_counter += 1;
        match self.phase {
            0 => self.frame_counter % 4 == 1,
            1 => self.frame_counter % 2 == 1,
            2 => self.frame_counter % 4 != 0,
            _ => true,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.prev_clients == 0
    }
}

impl Default for ClientActivity {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Source rate detection
// ---------------------------------------------------------------------------

/// Frames observed before the detected rate is considered final.
const DETECT_FRAMES: u32 = 30;

/// Learns the device's true delivery interval from arrival times.
///
/// Devices that cannot keep up with the target must never be throttled
/// further, so rate limiting only engages once the detected rate clearly
/// exceeds the target.
pub struct SourceRate {
    last_arrival_us: u64,
    interval_ema_us: u64,
    frames: u32,
    detected_fps: Option<u32>,
}

impl SourceRate {
    pub fn new() -> Self {
        Self {
            last_arrival_us: 0,
            interval_ema_us: 0,
            frames: 0,
            detected_fps: None,
        }
    }

    /// Record a frame arrival (timestamp in microseconds).
    pub fn observe(&mut self, now_us: u64) {
        if self.detected_fps.is_some() {
            return;
        }
        self.frames += 1;
        if self.last_arrival_us > 0 {
            let interval = now_us.saturating_sub(self.last_arrival_us);
            self.interval_ema_us = if self.interval_ema_us == 0 {
                interval
            } else {
                (self.interval_ema_us * 3 + interval) / 4
            };
            if self.frames >= DETECT_FRAMES && self.interval_ema_us > 0 {
                let fps = (1_000_000 / self.interval_ema_us) as u32;
                self.detected_fps = Some(fps);
                log::info!(
                    "camera rate detected: {} fps (interval {} us)",
                    fps,
                    self.interval_ema_us
                );
            }
        }
        self.last_arrival_us = now_us;
    }

    pub fn detected_fps(&self) -> Option<u32> {
        self.detected_fps
    }

    /// True once detection has finished and the source clearly outpaces the
    /// target rate.
    pub fn limit_needed(&self, target_fps: u32) -> bool {
        matches!(self.detected_fps, Some(fps) if fps > target_fps + 2)
    }
}

impl Default for SourceRate {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Output pacing
// ---------------------------------------------------------------------------

/// Time-based output pacing toward a target frame rate.
///
/// The next-output deadline advances by the target interval rather than to
/// "now", so late frames catch up instead of accumulating drift. After a
/// stall of more than two intervals the schedule resets to avoid a burst.
pub struct OutputPacer {
    target_interval_us: u64,
    last_output_us: u64,
}

impl OutputPacer {
    pub fn new(target_fps: u32) -> Self {
        Self {
            target_interval_us: 1_000_000 / target_fps.max(1) as u64,
            last_output_us: 0,
        }
    }

    pub fn set_target_fps(&mut self, target_fps: u32) {
        self.target_interval_us = 1_000_000 / target_fps.max(1) as u64;
    }

    /// Whether a frame arriving at `now_us` should be emitted.
    pub fn should_output(&mut self, now_us: u64) -> bool {
        if self.last_output_us == 0 {
            self.last_output_us = now_us;
            return true;
        }
        if now_us >= self.last_output_us + self.target_interval_us {
            self.last_output_us += self.target_interval_us;
            if now_us > self.last_output_us + self.target_interval_us * 2 {
                self.last_output_us = now_us;
            }
            return true;
        }
        false
    }

    /// Microseconds until the next scheduled output, for pre-read sleeping.
    pub fn until_next_us(&self, now_us: u64) -> u64 {
        let next = self.last_output_us + self.target_interval_us;
        next.saturating_sub(now_us)
    }
}
