//! Capture device backends.
//!
//! `CaptureDevice` owns one video-capture device end to end. Real hardware
//! goes through V4L2 (behind the `capture-v4l2` feature); `stub://` paths get
//! a synthetic source that produces valid-looking frames at a configured
//! rate, which is what the test suite runs against.

use crate::error::{Error, Result};

/// Negotiated or requested capture pixel format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Compressed JPEG frames straight from the camera.
    Mjpeg,
    /// Raw packed YUV 4:2:2; requires the hardware JPEG encode path.
    Yuyv,
}

impl CaptureFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureFormat::Mjpeg => "mjpeg",
            CaptureFormat::Yuyv => "yuyv",
        }
    }
}

/// Requested device configuration.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Device path, e.g. "/dev/video0", or "stub://name" for synthetic.
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: CaptureFormat,
}

/// What the device actually agreed to deliver.
#[derive(Clone, Copy, Debug)]
pub struct Negotiated {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: CaptureFormat,
}

/// One captured frame in the device's native format.
pub struct CapturedFrame {
    pub data: Vec<u8>,
    /// Arrival timestamp, microseconds since the epoch.
    pub timestamp_us: u64,
}

pub struct CaptureDevice {
    backend: Backend,
}

enum Backend {
    Synthetic(SyntheticDevice),
    #[cfg(feature = "capture-v4l2")]
    V4l2(V4l2Device),
}

impl CaptureDevice {
    /// Open the device and negotiate format/resolution/rate. Returns the
    /// actual values, which may differ from the request.
    pub fn open(config: &DeviceConfig) -> Result<(Self, Negotiated)> {
        if config.path.starts_with("stub://") {
            let device = SyntheticDevice::new(config.clone());
            let negotiated = device.negotiated();
            return Ok((
                Self {
                    backend: Backend::Synthetic(device),
                },
                negotiated,
            ));
        }

        #[cfg(feature = "capture-v4l2")]
        {
            let (device, negotiated) = V4l2Device::open(config)?;
            return Ok((
                Self {
                    backend: Backend::V4l2(device),
                },
                negotiated,
            ));
        }

        #[cfg(not(feature = "capture-v4l2"))]
        Err(Error::Device(format!(
            "cannot open {}: built without capture-v4l2",
            config.path
        )))
    }

    /// Blocking read of the next frame, bounded by the driver timeout.
    pub fn read_frame(&mut self) -> Result<CapturedFrame> {
        match &mut self.backend {
            Backend::Synthetic(device) => device.read_frame(),
            #[cfg(feature = "capture-v4l2")]
            Backend::V4l2(device) => device.read_frame(),
        }
    }

    /// Total frames delivered since open. The idle invariant is asserted
    /// against this counter in tests.
    pub fn frames_read(&self) -> u64 {
        match &self.backend {
            Backend::Synthetic(device) => device.frames_read,
            #[cfg(feature = "capture-v4l2")]
            Backend::V4l2(device) => device.frames_read,
        }
    }
}

// ---------------------------------------------------------------------------
// Synthetic device (stub://)
// ---------------------------------------------------------------------------

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Synthetic frame padding so frames pass the minimum-size validation.
const SYNTHETIC_JPEG_BYTES: usize = 4096;

struct SyntheticDevice {
    config: DeviceConfig,
    frames_read: u64,
    scene: u8,
}

impl SyntheticDevice {
    fn new(config: DeviceConfig) -> Self {
        log::info!("capture: opened {} (synthetic)", config.path);
        Self {
            config,
            frames_read: 0,
            scene: 0,
        }
    }

    fn negotiated(&self) -> Negotiated {
        Negotiated {
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            format: self.config.format,
        }
    }

    fn read_frame(&mut self) -> Result<CapturedFrame> {
        // Pace like a real device would.
        let interval_ms = 1000 / self.config.fps.max(1) as u64;
        std::thread::sleep(std::time::Duration::from_millis(interval_ms.min(100)));

        self.frames_read += 1;
        if self.frames_read % 50 == 0 {
            self.scene = self.scene.wrapping_add(1);
        }

        let data = match self.config.format {
            CaptureFormat::Mjpeg => self.synthetic_jpeg(),
            CaptureFormat::Yuyv => self.synthetic_yuyv(),
        };
        Ok(CapturedFrame {
            data,
            timestamp_us: crate::frame::now_us(),
        })
    }

    fn synthetic_jpeg(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SYNTHETIC_JPEG_BYTES);
        data.extend_from_slice(&JPEG_SOI);
        while data.len() < SYNTHETIC_JPEG_BYTES - 2 {
            let i = data.len() as u64;
            data.push(((i + self.frames_read + self.scene as u64) % 251) as u8);
        }
        data.extend_from_slice(&JPEG_EOI);
        data
    }

    fn synthetic_yuyv(&self) -> Vec<u8> {
        let len = (self.config.width * self.config.height * 2) as usize;
        let mut data = vec![0u8; len];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = ((i as u64 + self.frames_read + self.scene as u64) % 256) as u8;
        }
        data
    }
}

// ---------------------------------------------------------------------------
// V4L2 device
// ---------------------------------------------------------------------------

#[cfg(feature = "capture-v4l2")]
struct V4l2Device {
    state: V4l2State,
    frames_read: u64,
}

#[cfg(feature = "capture-v4l2")]
#[ouroboros::self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "capture-v4l2")]
impl V4l2Device {
    fn open(config: &DeviceConfig) -> Result<(Self, Negotiated)> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let fourcc = match config.format {
            CaptureFormat::Mjpeg => v4l::FourCC::new(b"MJPG"),
            CaptureFormat::Yuyv => v4l::FourCC::new(b"YUYV"),
        };

        let device = v4l::Device::with_path(&config.path)
            .map_err(|e| Error::Device(format!("open {}: {}", config.path, e)))?;

        let mut format = device
            .format()
            .map_err(|e| Error::Device(format!("query format on {}: {}", config.path, e)))?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = fourcc;

        let actual = device
            .set_format(&format)
            .map_err(|e| Error::Device(format!("set format on {}: {}", config.path, e)))?;
        if actual.fourcc != fourcc {
            return Err(Error::Device(format!(
                "{} rejected {} capture",
                config.path,
                config.format.as_str()
            )));
        }

        let mut actual_fps = config.fps;
        if config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.fps);
            match device.set_params(&params) {
                Ok(params) => {
                    let interval = params.interval;
                    if interval.numerator > 0 {
                        actual_fps = interval.denominator / interval.numerator;
                    }
                }
                Err(e) => {
                    log::warn!("capture: set fps on {} failed: {}", config.path, e);
                }
            }
        }

        let negotiated = Negotiated {
            width: actual.width,
            height: actual.height,
            fps: actual_fps,
            format: config.format,
        };

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
            },
        }
        .try_build()
        .map_err(|e| Error::Device(format!("create capture stream: {}", e)))?;

        log::info!(
            "capture: opened {} ({}x{} {} @ {} fps)",
            config.path,
            negotiated.width,
            negotiated.height,
            negotiated.format.as_str(),
            negotiated.fps
        );
        Ok((
            Self {
                state,
                frames_read: 0,
            },
            negotiated,
        ))
    }

    fn read_frame(&mut self) -> Result<CapturedFrame> {
        use v4l::io::traits::CaptureStream;

        let data = self
            .state
            .with_stream_mut(|stream| stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|e| Error::Device(format!("capture read: {}", e)))?;
        self.frames_read += 1;
        Ok(CapturedFrame {
            data,
            timestamp_us: crate::frame::now_us(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(format: CaptureFormat) -> DeviceConfig {
        DeviceConfig {
            path: "stub://test".to_string(),
            width: 64,
            height: 48,
            fps: 100,
            format,
        }
    }

    #[test]
    fn synthetic_mjpeg_frames_look_like_jpeg() {
        let (mut device, negotiated) =
            CaptureDevice::open(&stub_config(CaptureFormat::Mjpeg)).unwrap();
        assert_eq!(negotiated.width, 64);

        let frame = device.read_frame().unwrap();
        assert_eq!(&frame.data[..2], &JPEG_SOI);
        assert_eq!(&frame.data[frame.data.len() - 2..], &JPEG_EOI);
        assert!(frame.data.len() >= 1024);
        assert_eq!(device.frames_read(), 1);
    }

    #[test]
    fn synthetic_yuyv_frames_have_raw_size() {
        let (mut device, _) = CaptureDevice::open(&stub_config(CaptureFormat::Yuyv)).unwrap();
        let frame = device.read_frame().unwrap();
        assert_eq!(frame.data.len(), 64 * 48 * 2);
    }
}
