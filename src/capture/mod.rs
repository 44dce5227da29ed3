//! Capture-and-encode pipeline.
//!
//! One `CaptureDriver` owns one camera end to end: it negotiates the capture
//! format, pulls frames, routes them through the encoder paths the camera
//! needs, and publishes results into the frame slots. The driver runs as a
//! dedicated thread; everything it shares with the rest of the process goes
//! through the slots, the client counters, and a couple of atomic flags.
//!
//! The single most important behavior under the CPU budget: when no client
//! is connected to any stream kind (and no timelapse session needs frames),
//! the loop sleeps a fixed quantum without touching the device at all.

pub mod device;
pub mod venc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::frame::{CameraSlots, StreamKind};
use crate::rate::{ClientActivity, OutputPacer, RateHandle, SourceRate};
use crate::shutdown::Shutdown;
use crate::stream::ClientCounts;

use device::{CaptureDevice, CaptureFormat, CapturedFrame, DeviceConfig, Negotiated};
use venc::{EncoderHub, H264Lease, PixelData};

/// Sleep quantum while idle (no clients, no timelapse).
const IDLE_QUANTUM: Duration = Duration::from_millis(100);
/// Device reopen attempts before the camera is disabled.
const MAX_REOPEN_ATTEMPTS: u32 = 3;
/// Minimum plausible size for a compressed frame; shorter ones are torn.
const MIN_JPEG_BYTES: usize = 1024;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Externally visible camera health, owned by the driver and read by the
/// orchestrator and the control surface.
pub struct CameraHealth {
    disabled: AtomicBool,
}

impl CameraHealth {
    pub fn new() -> Self {
        Self {
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn mark_disabled(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }
}

impl Default for CameraHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver configuration, already resolved from the config store.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub device: DeviceConfig,
    /// Target output rate; the device may deliver faster.
    pub target_fps: u32,
    pub jpeg_quality: u32,
    /// Primary camera only: feed the hardware H.264 channel.
    pub h264_enabled: bool,
}

pub struct CaptureDriver {
    config: DriverConfig,
    device: Option<CaptureDevice>,
    negotiated: Option<Negotiated>,
    hub: EncoderHub,
    slots: Arc<CameraSlots>,
    counts: Arc<ClientCounts>,
    rate: RateHandle,
    health: Arc<CameraHealth>,
    shutdown: Shutdown,
    /// Pub/sub stopCapture pauses streaming without dropping clients.
    paused: Arc<AtomicBool>,
    /// Timelapse sessions keep the pipeline awake with zero clients.
    wake: Arc<AtomicBool>,

    activity: ClientActivity,
    source_rate: SourceRate,
    pacer: OutputPacer,
    h264_lease: Option<H264Lease>,
    h264_counter: u64,
    reopen_attempts: u32,
}

impl CaptureDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DriverConfig,
        hub: EncoderHub,
        slots: Arc<CameraSlots>,
        counts: Arc<ClientCounts>,
        rate: RateHandle,
        health: Arc<CameraHealth>,
        shutdown: Shutdown,
        paused: Arc<AtomicBool>,
        wake: Arc<AtomicBool>,
    ) -> Self {
        let pacer = OutputPacer::new(config.target_fps);
        Self {
            config,
            device: None,
            negotiated: None,
            hub,
            slots,
            counts,
            rate,
            health,
            shutdown,
            paused,
            wake,
            activity: ClientActivity::new(),
            source_rate: SourceRate::new(),
            pacer,
            h264_lease: None,
            h264_counter: 0,
            reopen_attempts: 0,
        }
    }

    /// Open the device and negotiate. The returned values may differ from
    /// the request; the driver adopts them.
    pub fn configure(&mut self) -> Result<Negotiated> {
        let (device, negotiated) = CaptureDevice::open(&self.config.device)?;
        self.device = Some(device);
        self.negotiated = Some(negotiated);
        self.reopen_attempts = 0;
        Ok(negotiated)
    }

    pub fn frames_read(&self) -> u64 {
        self.device.as_ref().map(|d| d.frames_read()).unwrap_or(0)
    }

    /// Blocking capture loop; returns when shutdown triggers or the camera
    /// is disabled after repeated device failures.
    pub fn run(&mut self) {
        log::info!("capture: loop starting for {}", self.config.device.path);
        while self.shutdown.is_running() && !self.health.is_disabled() {
            if let Err(err) = self.run_once() {
                log::warn!("capture: iteration failed: {}", err);
                self.handle_device_failure();
            }
        }
        self.h264_lease = None;
        log::info!("capture: loop stopped for {}", self.config.device.path);
    }

    /// One loop iteration; extracted so the idle invariant and routing are
    /// testable without a thread.
    pub fn run_once(&mut self) -> Result<()> {
        let streaming = !self.paused.load(Ordering::SeqCst);
        let clients = if streaming { self.counts.total() } else { 0 };
        let awake = clients > 0 || self.wake.load(Ordering::SeqCst);

        if !awake {
            // Idle: no device read, no decode, near-zero CPU. The activity
            // tracker still sees the zero so the next client gets a ramp-up.
            self.activity.should_process(0, Instant::now());
            self.release_h264_if_unused(0);
            self.shutdown.sleep(IDLE_QUANTUM);
            return Ok(());
        }

        if self.device.is_none() {
            self.configure()?;
        }

        // Pre-read throttle: only once we know the device outpaces the
        // target; a slow device is never throttled further.
        if self.source_rate.limit_needed(self.config.target_fps) {
            let wait_us = self.pacer.until_next_us(crate::frame::now_us());
            if wait_us > 0 {
                self.shutdown.sleep(Duration::from_micros(wait_us));
            }
        }

        let frame = match self.device.as_mut() {
            Some(device) => device.read_frame()?,
            None => return Ok(()),
        };
        self.reopen_attempts = 0;
        self.source_rate.observe(frame.timestamp_us);

        if !self.validate(&frame) {
            return Ok(());
        }

        // Warm-up ramp: a cold encoder reaches full duty in phases.
        let process = self.activity.should_process(clients.max(1), Instant::now());
        if !process {
            return Ok(());
        }
        if !self.pacer.should_output(frame.timestamp_us) {
            return Ok(());
        }

        self.route(&frame)
    }

    /// Route one validated frame through the encode paths it needs.
    fn route(&mut self, frame: &CapturedFrame) -> Result<()> {
        let format = self
            .negotiated
            .map(|n| n.format)
            .unwrap_or(self.config.device.format);

        let jpeg: Vec<u8> = match format {
            CaptureFormat::Mjpeg => frame.data.clone(),
            CaptureFormat::Yuyv => {
                let negotiated = self.negotiated.as_ref();
                let (width, height) = negotiated
                    .map(|n| (n.width, n.height))
                    .unwrap_or((self.config.device.width, self.config.device.height));
                self.hub.jpeg_encode(
                    &PixelData::Yuyv {
                        data: &frame.data,
                        width,
                        height,
                    },
                    self.config.jpeg_quality,
                )?
            }
        };
        self.slots.jpeg.publish(&jpeg, frame.timestamp_us, true);

        if self.config.h264_enabled {
            self.encode_h264(frame, format)?;
        }
        Ok(())
    }

    fn encode_h264(&mut self, frame: &CapturedFrame, format: CaptureFormat) -> Result<()> {
        let h264_clients = self.counts.count(StreamKind::H264);
        self.release_h264_if_unused(h264_clients);
        if h264_clients == 0 {
            return Ok(());
        }

        // H.264 encode is the expensive path; the skip ratio sheds it first.
        self.h264_counter += 1;
        if self.h264_counter % self.rate.skip_ratio() as u64 != 0 {
            return Ok(());
        }

        if self.h264_lease.is_none() {
            match self.hub.acquire_h264("capture") {
                Ok(lease) => self.h264_lease = Some(lease),
                Err(Error::ResourceConflict(_)) => {
                    // Timelapse assembly holds the channel; resume later.
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        let pixels = match format {
            CaptureFormat::Mjpeg => PixelData::Jpeg(&frame.data),
            CaptureFormat::Yuyv => {
                let (width, height) = self
                    .negotiated
                    .map(|n| (n.width, n.height))
                    .unwrap_or((self.config.device.width, self.config.device.height));
                PixelData::Yuyv {
                    data: &frame.data,
                    width,
                    height,
                }
            }
        };
        if let Some(lease) = &self.h264_lease {
            let unit = lease.encode(&pixels)?;
            self.slots
                .h264
                .publish(&unit.data, frame.timestamp_us, unit.keyframe);
        }
        Ok(())
    }

    fn release_h264_if_unused(&mut self, h264_clients: usize) {
        if h264_clients == 0 && self.h264_lease.is_some() {
            self.h264_lease = None;
        }
    }

    /// Compressed frames must start with the JPEG SOI marker and carry a
    /// plausible amount of data; corrupt frames are dropped, never published.
    fn validate(&self, frame: &CapturedFrame) -> bool {
        let format = self
            .negotiated
            .map(|n| n.format)
            .unwrap_or(self.config.device.format);
        if format != CaptureFormat::Mjpeg {
            return !frame.data.is_empty();
        }
        if frame.data.len() < MIN_JPEG_BYTES || frame.data[..2] != JPEG_SOI {
            log::warn!(
                "capture: dropping corrupt frame ({} bytes) from {}",
                frame.data.len(),
                self.config.device.path
            );
            return false;
        }
        true
    }

    fn handle_device_failure(&mut self) {
        self.device = None;
        self.reopen_attempts += 1;
        if self.reopen_attempts > MAX_REOPEN_ATTEMPTS {
            log::error!(
                "capture: {} failed {} times, disabling camera",
                self.config.device.path,
                self.reopen_attempts
            );
            self.health.mark_disabled();
            return;
        }
        log::warn!(
            "capture: reopening {} (attempt {}/{})",
            self.config.device.path,
            self.reopen_attempts,
            MAX_REOPEN_ATTEMPTS
        );
        self.shutdown.sleep(Duration::from_secs(1));
    }
}
