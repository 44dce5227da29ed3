//! Service configuration.
//!
//! The configuration lives in a single JSON document read at startup and on
//! explicit reload. Components never keep a `&AppConfig` across iterations:
//! they take a cheap `Arc` snapshot from the [`ConfigStore`] each time they
//! need settings, and subscribe to the store when they cache derived values.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};

pub const DEFAULT_STREAMING_PORT: u16 = 8080;
pub const DEFAULT_FLV_PORT: u16 = 18088;
pub const DEFAULT_RPC_ADDR: &str = "127.0.0.1:18086";
pub const DEFAULT_MOONRAKER_HOST: &str = "127.0.0.1";
pub const DEFAULT_MOONRAKER_PORT: u16 = 7125;
pub const DEFAULT_MQTT_PORT: u16 = 9883;

fn default_true() -> bool {
    true
}

/// Capture and encode settings for the primary camera.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Capture device path; empty means "use discovery".
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Target output frame rate; the device may deliver faster or slower.
    pub target_fps: u32,
    /// Preferred capture format: "auto", "mjpeg", or "yuyv".
    pub format: String,
    /// JPEG quality for hardware encode in raw-capture mode (1-99).
    pub jpeg_quality: u32,
    pub h264_enabled: bool,
    /// H.264 encode bitrate in kbps.
    pub bitrate: u32,
    /// H.264 output resolution as "WxH"; empty means capture resolution.
    pub h264_resolution: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: String::new(),
            width: 1280,
            height: 720,
            target_fps: 10,
            format: "auto".to_string(),
            jpeg_quality: 85,
            h264_enabled: true,
            bitrate: 512,
            h264_resolution: String::new(),
        }
    }
}

/// CPU-adaptive rate control settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateSettings {
    pub auto_skip: bool,
    /// Process 1 of N captured frames on the H.264 path.
    pub skip_ratio: u32,
    /// Target total CPU percentage the service may consume up to.
    pub target_cpu: u32,
    pub min_skip: u32,
    pub max_skip: u32,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            auto_skip: true,
            skip_ratio: 2,
            target_cpu: 60,
            min_skip: 1,
            max_skip: 10,
        }
    }
}

/// Camera discovery and multi-camera settings.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CameraSettings {
    /// USB topology port of the built-in camera, e.g. "1.3". Used to pick
    /// the primary camera; empty means "first discovered".
    pub internal_usb_port: String,
    /// Enabled flag per camera unique id, persisted across restarts.
    pub enabled: HashMap<String, bool>,
    /// Frame rate for secondary (MJPEG-only) cameras.
    pub secondary_fps: u32,
}

/// Pub/sub camera-control connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    /// Device model identifier used in topic construction.
    pub model_id: String,
    /// Device identifier used in topic construction.
    pub device_id: String,
    /// Leading topic segment; the full topics are
    /// `{prefix}/{scope}/printer/{model}/{device}/video`.
    pub topic_prefix: String,
    /// PEM CA certificate for the broker TLS connection; empty disables TLS.
    pub ca_cert_path: String,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: "127.0.0.1".to_string(),
            broker_port: DEFAULT_MQTT_PORT,
            username: String::new(),
            password: String::new(),
            model_id: String::new(),
            device_id: String::new(),
            topic_prefix: "printer-cloud/v1".to_string(),
            ca_cert_path: String::new(),
        }
    }
}

/// Timelapse recording settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelapseSettings {
    pub enabled: bool,
    /// "layer" captures on layer changes, "hyperlapse" on a fixed interval.
    pub mode: String,
    /// Interval in seconds for hyperlapse mode.
    pub hyperlapse_interval: u32,
    /// "internal" or "usb".
    pub storage: String,
    pub output_dir: String,
    pub usb_path: String,
    pub temp_dir: String,
    pub output_fps: u32,
    pub variable_fps: bool,
    /// Target video length in seconds when variable_fps is on.
    pub target_length: u32,
    pub variable_fps_min: u32,
    pub variable_fps_max: u32,
    pub crf: u32,
    /// Hold the final frame for this many extra frames.
    pub duplicate_last_frame: u32,
    /// Delay in seconds before each triggered capture.
    pub stream_delay: f32,
    /// Delay in seconds before the final frame on completion.
    pub end_delay: f32,
    pub flip_x: bool,
    pub flip_y: bool,
    /// Keep partial output when a print is cancelled.
    #[serde(default = "default_true")]
    pub keep_partial: bool,
}

impl Default for TimelapseSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: "layer".to_string(),
            hyperlapse_interval: 30,
            storage: "internal".to_string(),
            output_dir: "/var/lib/printcam/timelapse".to_string(),
            usb_path: "/mnt/udisk/timelapse".to_string(),
            temp_dir: "/tmp/printcam_frames".to_string(),
            output_fps: 30,
            variable_fps: false,
            target_length: 10,
            variable_fps_min: 5,
            variable_fps_max: 60,
            crf: 23,
            duplicate_last_frame: 0,
            stream_delay: 0.0,
            end_delay: 0.0,
            flip_x: false,
            flip_y: false,
            keep_partial: true,
        }
    }
}

/// Top-level service configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub streaming_port: u16,
    pub flv_port: u16,
    pub rpc_addr: String,
    pub moonraker_host: String,
    pub moonraker_port: u16,
    pub capture: CaptureSettings,
    pub rate: RateSettings,
    pub cameras: CameraSettings,
    pub control: ControlSettings,
    pub timelapse: TimelapseSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            streaming_port: DEFAULT_STREAMING_PORT,
            flv_port: DEFAULT_FLV_PORT,
            rpc_addr: DEFAULT_RPC_ADDR.to_string(),
            moonraker_host: DEFAULT_MOONRAKER_HOST.to_string(),
            moonraker_port: DEFAULT_MOONRAKER_PORT,
            capture: CaptureSettings::default(),
            rate: RateSettings::default(),
            cameras: CameraSettings::default(),
            control: ControlSettings::default(),
            timelapse: TimelapseSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let mut cfg: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("write config file {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.capture.target_fps == 0 {
            return Err(anyhow!("capture.target_fps must be at least 1"));
        }
        if !(1..=99).contains(&self.capture.jpeg_quality) {
            return Err(anyhow!("capture.jpeg_quality must be 1-99"));
        }
        if self.rate.min_skip == 0 || self.rate.max_skip < self.rate.min_skip {
            return Err(anyhow!("rate.min_skip/max_skip out of order"));
        }
        if !(20..=90).contains(&self.rate.target_cpu) {
            return Err(anyhow!("rate.target_cpu must be 20-90"));
        }
        self.rate.skip_ratio = self
            .rate
            .skip_ratio
            .clamp(self.rate.min_skip, self.rate.max_skip);
        match self.timelapse.mode.as_str() {
            "layer" | "hyperlapse" => {}
            other => return Err(anyhow!("timelapse.mode '{}' unknown", other)),
        }
        if self.timelapse.crf > 51 {
            return Err(anyhow!("timelapse.crf must be 0-51"));
        }
        Ok(())
    }

    /// Output directory for finished timelapse videos, honoring the
    /// storage selection.
    pub fn timelapse_output_dir(&self) -> PathBuf {
        if self.timelapse.storage == "usb" && !self.timelapse.usb_path.is_empty() {
            PathBuf::from(&self.timelapse.usb_path)
        } else {
            PathBuf::from(&self.timelapse.output_dir)
        }
    }
}

/// Shared configuration store with live-reload notification.
///
/// Reads take an `Arc` snapshot; writes replace the snapshot and notify
/// every subscriber so components re-derive cached values without a restart.
pub struct ConfigStore {
    current: RwLock<Arc<AppConfig>>,
    watchers: Mutex<Vec<Sender<()>>>,
    path: Mutex<Option<PathBuf>>,
}

impl ConfigStore {
    pub fn new(cfg: AppConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(cfg)),
            watchers: Mutex::new(Vec::new()),
            path: Mutex::new(None),
        }
    }

    /// Load from `path` and remember it for subsequent saves/reloads.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let cfg = if path.exists() {
            AppConfig::load(path)?
        } else {
            log::info!("config file {} missing, using defaults", path.display());
            AppConfig::default()
        };
        let store = Self::new(cfg);
        *store.path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn snapshot(&self) -> Arc<AppConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the configuration and notify all subscribers.
    pub fn replace(&self, cfg: AppConfig) {
        {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            *current = Arc::new(cfg);
        }
        self.notify();
    }

    /// Re-read the config file, if one was given, and notify subscribers.
    pub fn reload(&self) -> anyhow::Result<()> {
        let path = self
            .path
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow!("config store has no backing file"))?;
        let cfg = AppConfig::load(&path)?;
        self.replace(cfg);
        Ok(())
    }

    /// Apply `mutate` to a copy of the current config, persist it when a
    /// backing file exists, and notify subscribers.
    pub fn update<F: FnOnce(&mut AppConfig)>(&self, mutate: F) -> anyhow::Result<()> {
        let mut cfg = (*self.snapshot()).clone();
        mutate(&mut cfg);
        if let Some(path) = self.path.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            cfg.save(path)?;
        }
        self.replace(cfg);
        Ok(())
    }

    /// Subscribe to change notifications. Each replace/update sends one unit
    /// message; dropped receivers are pruned on the next notify.
    pub fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn notify(&self) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|tx| tx.send(()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("printcam.json");

        let mut cfg = AppConfig::default();
        cfg.capture.target_fps = 15;
        cfg.timelapse.mode = "hyperlapse".to_string();
        cfg.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.capture.target_fps, 15);
        assert_eq!(loaded.timelapse.mode, "hyperlapse");
    }

    #[test]
    fn partial_document_fills_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"capture": {"target_fps": 5}}"#).unwrap();
        assert_eq!(cfg.capture.target_fps, 5);
        assert_eq!(cfg.streaming_port, DEFAULT_STREAMING_PORT);
        assert!(cfg.timelapse.keep_partial);
    }

    #[test]
    fn invalid_mode_rejected() {
        let mut cfg = AppConfig::default();
        cfg.timelapse.mode = "freerun".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn update_notifies_subscribers() {
        let store = ConfigStore::new(AppConfig::default());
        let rx = store.subscribe();
        store
            .update(|cfg| cfg.rate.target_cpu = 50)
            .unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(store.snapshot().rate.target_cpu, 50);
    }

    #[test]
    fn usb_storage_selects_usb_path() {
        let mut cfg = AppConfig::default();
        cfg.timelapse.storage = "usb".to_string();
        assert_eq!(
            cfg.timelapse_output_dir(),
            PathBuf::from("/mnt/udisk/timelapse")
        );
        cfg.timelapse.storage = "internal".to_string();
        assert_eq!(
            cfg.timelapse_output_dir(),
            PathBuf::from("/var/lib/printcam/timelapse")
        );
    }
}
