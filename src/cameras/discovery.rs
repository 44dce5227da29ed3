//! USB camera discovery.
//!
//! Cameras are identified by their persistent USB topology entries under
//! `/dev/v4l/by-path`, never by the volatile `/dev/videoN` number, which is
//! not stable across reconnects. The by-id entry (when present) provides the
//! unique id that keys per-camera settings in the config store.
//!
//! The directory-listing and device-probe layers are injectable so the
//! ordering and assignment logic is testable without hardware.

use std::path::{Path, PathBuf};

pub const MAX_CAMERAS: usize = 4;

const BY_PATH_DIR: &str = "/dev/v4l/by-path";
const BY_ID_DIR: &str = "/dev/v4l/by-id";

/// Stable identity and negotiated capabilities of one discovered camera.
#[derive(Clone, Debug)]
pub struct CameraDescriptor {
    /// Persistent unique id (by-id entry, falling back to the by-path name).
    pub unique_id: String,
    /// Human-readable device name.
    pub name: String,
    /// Resolved capture device node, e.g. "/dev/video0".
    pub device: PathBuf,
    /// USB topology port, e.g. "1.3".
    pub usb_port: String,
    /// Assigned ordinal, 1 = primary.
    pub ordinal: u8,
    /// MJPEG streaming port for this camera.
    pub streaming_port: u16,
    pub is_primary: bool,
    pub has_mjpeg: bool,
    pub has_yuyv: bool,
    pub width: u32,
    pub height: u32,
    pub max_fps: u32,
    pub enabled: bool,
}

/// Probed device capabilities.
#[derive(Clone, Debug)]
pub struct ProbeInfo {
    pub name: String,
    pub has_mjpeg: bool,
    pub has_yuyv: bool,
    pub width: u32,
    pub height: u32,
    pub max_fps: u32,
}

/// Source of raw device listings; the production impl reads sysfs/devfs.
pub trait DeviceEnumerator {
    /// (entry name, resolved device node) pairs from the by-path directory.
    fn by_path_entries(&self) -> Vec<(String, PathBuf)>;
    /// (entry name, resolved device node) pairs from the by-id directory.
    fn by_id_entries(&self) -> Vec<(String, PathBuf)>;
    /// Probe a device node for name/formats/resolution.
    fn probe(&self, device: &Path) -> Option<ProbeInfo>;
}

/// Enumerator over the real /dev/v4l tree.
pub struct SystemEnumerator;

impl DeviceEnumerator for SystemEnumerator {
    fn by_path_entries(&self) -> Vec<(String, PathBuf)> {
        read_link_dir(Path::new(BY_PATH_DIR))
    }

    fn by_id_entries(&self) -> Vec<(String, PathBuf)> {
        read_link_dir(Path::new(BY_ID_DIR))
    }

    #[cfg(feature = "capture-v4l2")]
    fn probe(&self, device: &Path) -> Option<ProbeInfo> {
        use v4l::video::Capture;

        let dev = v4l::Device::with_path(device).ok()?;
        let caps = dev.query_caps().ok()?;

        let mut has_mjpeg = false;
        let mut has_yuyv = false;
        if let Ok(formats) = dev.enum_formats() {
            for format in formats {
                match &format.fourcc.repr {
                    b"MJPG" => has_mjpeg = true,
                    b"YUYV" => has_yuyv = true,
                    _ => {}
                }
            }
        }

        let fourcc = if has_mjpeg {
            v4l::FourCC::new(b"MJPG")
        } else {
            v4l::FourCC::new(b"YUYV")
        };
        let mut width = 0;
        let mut height = 0;
        if let Ok(sizes) = dev.enum_framesizes(fourcc) {
            for size in sizes {
                for discrete in size.size.to_discrete() {
                    if discrete.width * discrete.height > width * height {
                        width = discrete.width;
                        height = discrete.height;
                    }
                }
            }
        }

        let mut max_fps = 0;
        if width > 0 {
            if let Ok(intervals) = dev.enum_frameintervals(fourcc, width, height) {
                for interval in intervals {
                    if let v4l::frameinterval::FrameIntervalEnum::Discrete(frac) =
                        interval.interval
                    {
                        if frac.numerator > 0 {
                            max_fps = max_fps.max(frac.denominator / frac.numerator);
                        }
                    }
                }
            }
        }

        Some(ProbeInfo {
            name: caps.card,
            has_mjpeg,
            has_yuyv,
            width,
            height,
            max_fps,
        })
    }

    #[cfg(not(feature = "capture-v4l2"))]
    fn probe(&self, _device: &Path) -> Option<ProbeInfo> {
        Some(ProbeInfo {
            name: "USB Camera".to_string(),
            has_mjpeg: true,
            has_yuyv: false,
            width: 1280,
            height: 720,
            max_fps: 30,
        })
    }
}

fn read_link_dir(dir: &Path) -> Vec<(String, PathBuf)> {
    let mut entries = Vec::new();
    let Ok(dir_entries) = std::fs::read_dir(dir) else {
        return entries;
    };
    for entry in dir_entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(resolved) = std::fs::canonicalize(entry.path()) {
            entries.push((name, resolved));
        }
    }
    entries
}

/// Parse the USB port out of a by-path entry name:
/// "platform-xhci_0-usb-0:1.3:1.0-video-index0" -> "1.3".
pub fn parse_usb_port(entry_name: &str) -> Option<String> {
    let after = if let Some(pos) = entry_name.find("usb-0:") {
        &entry_name[pos + 6..]
    } else {
        let pos = entry_name.find("usb-")?;
        let rest = &entry_name[pos + 4..];
        let colon = rest.find(':')?;
        &rest[colon + 1..]
    };
    let port: String = after
        .chars()
        .take_while(|&c| c != ':' && c != '-')
        .collect();
    if port.is_empty() {
        None
    } else {
        Some(port)
    }
}

/// Match a detected port against the configured internal-camera port:
/// exact, or dotted-suffix ("1-1.3" matches "1.3").
pub fn usb_port_matches(detected: &str, internal: &str) -> bool {
    if detected.is_empty() || internal.is_empty() {
        return false;
    }
    if detected == internal {
        return true;
    }
    detected
        .strip_suffix(internal)
        .map(|rest| rest.ends_with('.'))
        .unwrap_or(false)
}

/// Streaming port for a camera ordinal: the primary keeps the base port,
/// secondaries get base + ordinal.
pub fn port_for_ordinal(base_port: u16, ordinal: u8) -> u16 {
    if ordinal <= 1 {
        base_port
    } else {
        base_port + ordinal as u16
    }
}

/// Enumerate attached cameras, resolve stable identities, order the primary
/// first, and assign ordinals and ports.
pub fn discover(
    enumerator: &dyn DeviceEnumerator,
    internal_usb_port: &str,
    base_port: u16,
) -> Vec<CameraDescriptor> {
    let by_id = enumerator.by_id_entries();
    let mut cameras: Vec<CameraDescriptor> = Vec::new();

    for (entry_name, device) in enumerator.by_path_entries() {
        if cameras.len() >= MAX_CAMERAS {
            break;
        }
        // Only the first video interface of each USB camera; ISP and
        // metadata nodes also appear here.
        if !entry_name.contains("video-index0") || !entry_name.contains("usb") {
            continue;
        }
        if !device.to_string_lossy().starts_with("/dev/video") {
            continue;
        }

        let Some(probe) = enumerator.probe(&device) else {
            log::warn!("discovery: cannot probe {}", device.display());
            continue;
        };

        let unique_id = by_id
            .iter()
            .find(|(name, resolved)| name.contains("-video-index0") && *resolved == device)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| entry_name.clone());

        let usb_port = parse_usb_port(&entry_name).unwrap_or_default();
        let is_primary = usb_port_matches(&usb_port, internal_usb_port);

        cameras.push(CameraDescriptor {
            unique_id,
            name: probe.name,
            device,
            usb_port,
            ordinal: 0,
            streaming_port: 0,
            is_primary,
            has_mjpeg: probe.has_mjpeg,
            has_yuyv: probe.has_yuyv,
            width: probe.width,
            height: probe.height,
            max_fps: probe.max_fps,
            enabled: false,
        });
    }

    // Primary first, then stable by device path.
    cameras.sort_by(|a, b| {
        b.is_primary
            .cmp(&a.is_primary)
            .then_with(|| a.device.cmp(&b.device))
    });
    // No configured internal port, or no match: first discovered is primary.
    if !cameras.is_empty() && !cameras.iter().any(|c| c.is_primary) {
        cameras[0].is_primary = true;
    }

    for (index, camera) in cameras.iter_mut().enumerate() {
        camera.ordinal = (index + 1) as u8;
        camera.streaming_port = port_for_ordinal(base_port, camera.ordinal);
        camera.enabled = camera.is_primary;
    }

    if cameras.is_empty() {
        log::warn!("discovery: no cameras found");
    } else {
        for camera in &cameras {
            log::info!(
                "discovery: CAM#{}: {} ({}) {}x{}@{}fps usb={}{}{}",
                camera.ordinal,
                camera.device.display(),
                camera.name,
                camera.width,
                camera.height,
                camera.max_fps,
                camera.usb_port,
                if camera.is_primary { " [primary]" } else { "" },
                if camera.has_mjpeg { " mjpeg" } else { "" },
            );
        }
    }
    cameras
}
