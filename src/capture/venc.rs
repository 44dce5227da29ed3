//! Hardware encoder abstraction.
//!
//! The SoC encoder block is used strictly as a black box behind
//! [`VideoEncoder`]: JPEG encode, H.264 encode, and offline assembly of a
//! frame sequence into a video file. What matters is the observable
//! contract, not the vendor call sequence.
//!
//! The H.264 channel is a singleton resource. Both users, the primary
//! camera's live encode and the timelapse assembly path, must go through
//! [`EncoderHub::acquire_h264`]; the later requester fails fast with
//! `ResourceConflict` instead of queueing behind the hardware.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// A captured frame in the format the encoder consumes.
pub enum PixelData<'a> {
    /// Compressed JPEG bytes (decode is the encoder's concern).
    Jpeg(&'a [u8]),
    /// Packed YUV 4:2:2.
    Yuyv {
        data: &'a [u8],
        width: u32,
        height: u32,
    },
}

/// One encoded H.264 access unit.
pub struct H264Unit {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// Offline assembly request for the timelapse hardware path.
pub struct AssembleRequest {
    /// Directory holding `frame_%04d.jpg` inputs.
    pub frames_dir: PathBuf,
    pub frame_count: u32,
    pub fps: u32,
    pub crf: u32,
    pub flip_x: bool,
    pub flip_y: bool,
    pub output: PathBuf,
}

/// Narrow interface over the hardware encoder block.
pub trait VideoEncoder: Send {
    /// Encode a frame to JPEG (used for raw-capture cameras).
    fn jpeg_encode(&mut self, frame: &PixelData<'_>, quality: u32) -> Result<Vec<u8>>;

    /// Encode a frame to one H.264 access unit.
    fn h264_encode(&mut self, frame: &PixelData<'_>) -> Result<H264Unit>;

    /// Assemble a captured frame sequence into a video file.
    fn assemble(&mut self, request: &AssembleRequest) -> Result<()>;
}

struct HubShared {
    encoder: Mutex<Box<dyn VideoEncoder>>,
    h264_owner: Mutex<Option<&'static str>>,
}

/// Shared access point for the encoder block.
#[derive(Clone)]
pub struct EncoderHub {
    shared: Arc<HubShared>,
}

impl EncoderHub {
    pub fn new(encoder: Box<dyn VideoEncoder>) -> Self {
        Self {
            shared: Arc::new(HubShared {
                encoder: Mutex::new(encoder),
                h264_owner: Mutex::new(None),
            }),
        }
    }

    /// JPEG channel: available to any caller, serialized internally.
    pub fn jpeg_encode(&self, frame: &PixelData<'_>, quality: u32) -> Result<Vec<u8>> {
        let mut encoder = self
            .shared
            .encoder
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        encoder.jpeg_encode(frame, quality)
    }

    /// Claim the H.264 channel. Fails fast when another owner holds it.
    pub fn acquire_h264(&self, owner: &'static str) -> Result<H264Lease> {
        let mut current = self
            .shared
            .h264_owner
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(holder) = *current {
            log::warn!("h264 channel requested by {} but held by {}", owner, holder);
            return Err(Error::ResourceConflict("h264 channel in use"));
        }
        *current = Some(owner);
        Ok(H264Lease {
            shared: self.shared.clone(),
        })
    }
}

/// Exclusive lease on the H.264 channel; released on drop.
pub struct H264Lease {
    shared: Arc<HubShared>,
}

impl H264Lease {
    pub fn encode(&self, frame: &PixelData<'_>) -> Result<H264Unit> {
        let mut encoder = self
            .shared
            .encoder
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        encoder.h264_encode(frame)
    }

    pub fn assemble(&self, request: &AssembleRequest) -> Result<()> {
        let mut encoder = self
            .shared
            .encoder
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        encoder.assemble(request)
    }
}

impl Drop for H264Lease {
    fn drop(&mut self) {
        let mut owner = self
            .shared
            .h264_owner
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *owner = None;
    }
}

// ---------------------------------------------------------------------------
// Stub encoder
// ---------------------------------------------------------------------------

/// Software stand-in for the hardware block, used in tests and on hosts
/// without the SoC encoder. JPEG passthrough for compressed input, tagged
/// synthetic output otherwise; periodic keyframes on the H.264 channel.
pub struct StubEncoder {
    h264_frames: u64,
    gop: u64,
    /// When set, `assemble` reports hardware failure so callers exercise
    /// the software fallback.
    pub fail_assembly: bool,
}

impl StubEncoder {
    pub fn new() -> Self {
        Self {
            h264_frames: 0,
            gop: 30,
            fail_assembly: false,
        }
    }
}

impl Default for StubEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for StubEncoder {
    fn jpeg_encode(&mut self, frame: &PixelData<'_>, _quality: u32) -> Result<Vec<u8>> {
        match frame {
            PixelData::Jpeg(data) => Ok(data.to_vec()),
            PixelData::Yuyv { data, .. } => {
                let mut out = Vec::with_capacity(data.len().min(4096) + 4);
                out.extend_from_slice(&[0xFF, 0xD8]);
                out.extend(data.iter().take(4090).copied());
                out.extend_from_slice(&[0xFF, 0xD9]);
                Ok(out)
            }
        }
    }

    fn h264_encode(&mut self, frame: &PixelData<'_>) -> Result<H264Unit> {
        let payload = match frame {
            PixelData::Jpeg(data) => *data,
            PixelData::Yuyv { data, .. } => *data,
        };
        let keyframe = self.h264_frames % self.gop == 0;
        self.h264_frames += 1;
        let mut data = vec![0x00, 0x00, 0x00, 0x01, if keyframe { 0x65 } else { 0x41 }];
        data.extend(payload.iter().take(2048).copied());
        Ok(H264Unit { data, keyframe })
    }

    fn assemble(&mut self, request: &AssembleRequest) -> Result<()> {
        if self.fail_assembly {
            return Err(Error::Encode("stub assembly disabled".to_string()));
        }
        let mut out: Vec<u8> = Vec::new();
        out.extend_from_slice(b"PCAMV1\0\0");
        out.extend_from_slice(&request.fps.to_le_bytes());
        out.extend_from_slice(&request.frame_count.to_le_bytes());
        for index in 0..request.frame_count {
            let frame_path = request
                .frames_dir
                .join(format!("frame_{:04}.jpg", index));
            let data = std::fs::read(&frame_path).map_err(|e| {
                Error::Encode(format!("read {}: {}", frame_path.display(), e))
            })?;
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&data);
        }
        std::fs::write(&request.output, out)
            .map_err(|e| Error::Encode(format!("write {}: {}", request.output.display(), e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_channel_is_exclusive() {
        let hub = EncoderHub::new(Box::new(StubEncoder::new()));
        let lease = hub.acquire_h264("stream").unwrap();

        match hub.acquire_h264("timelapse") {
            Err(Error::ResourceConflict(_)) => {}
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }

        drop(lease);
        assert!(hub.acquire_h264("timelapse").is_ok());
    }

    #[test]
    fn jpeg_channel_does_not_need_the_lease() {
        let hub = EncoderHub::new(Box::new(StubEncoder::new()));
        let _lease = hub.acquire_h264("stream").unwrap();
        let jpeg = hub
            .jpeg_encode(&PixelData::Jpeg(&[0xFF, 0xD8, 0x01, 0xFF, 0xD9]), 85)
            .unwrap();
        assert_eq!(jpeg[0], 0xFF);
    }

    #[test]
    fn stub_emits_periodic_keyframes() {
        let mut enc = StubEncoder::new();
        let frame = PixelData::Jpeg(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let first = enc.h264_encode(&frame).unwrap();
        assert!(first.keyframe);
        let second = enc.h264_encode(&frame).unwrap();
        assert!(!second.keyframe);
    }
}
