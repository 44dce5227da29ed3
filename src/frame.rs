//! Latest-frame slots shared between capture and the stream servers.
//!
//! Each camera owns one `FrameSlot` per stream kind (JPEG snapshot/MJPEG,
//! H.264). A slot holds only the most recent encoded frame: writes overwrite
//! in place, readers copy out under a short-held lock and can wait on a
//! condition variable for a newer sequence number.
//!
//! Invariant: a reader observes either the complete frame at sequence S or
//! the prior complete frame at S-1, never a partial write. The writer copies
//! into the back buffer and only then swaps the read index, all under the
//! slot lock; the lock is never held across device or socket I/O.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Which encoded stream a slot (or a client) refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// JPEG frames: snapshot endpoint and MJPEG multipart stream.
    Jpeg,
    /// H.264 access units for the FLV stream.
    H264,
}

/// One encoded frame copied out of a slot.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub data: Vec<u8>,
    pub sequence: u64,
    /// Capture timestamp, microseconds since the epoch.
    pub timestamp_us: u64,
    pub is_keyframe: bool,
}

struct Buffers {
    frames: [FrameData; 2],
    read_idx: usize,
    /// Total frames ever published; doubles as the current sequence number.
    frame_count: u64,
}

#[derive(Default)]
struct FrameData {
    data: Vec<u8>,
    len: usize,
    timestamp_us: u64,
    sequence: u64,
    is_keyframe: bool,
}

/// Double-buffered holder of the most recent frame for one stream kind.
pub struct FrameSlot {
    state: Mutex<Buffers>,
    cond: Condvar,
}

pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Buffers {
                frames: [FrameData::default(), FrameData::default()],
                read_idx: 0,
                frame_count: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Publish a frame. The write buffer grows in place if the frame is
    /// larger than anything seen so far.
    pub fn publish(&self, data: &[u8], timestamp_us: u64, is_keyframe: bool) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let write_idx = (state.read_idx + 1) % 2;
        state.frame_count += 1;
        let sequence = state.frame_count;

        let frame = &mut state.frames[write_idx];
        if frame.data.len() < data.len() {
            frame.data.resize(data.len(), 0);
        }
        frame.data[..data.len()].copy_from_slice(data);
        frame.len = data.len();
        frame.timestamp_us = if timestamp_us != 0 {
            timestamp_us
        } else {
            now_us()
        };
        frame.sequence = sequence;
        frame.is_keyframe = is_keyframe;

        // Swap only after the copy completed: readers never see a torn frame.
        state.read_idx = write_idx;
        self.cond.notify_all();
    }

    /// Copy out the current frame, or None if nothing was published yet.
    pub fn latest(&self) -> Option<Frame> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let frame = &state.frames[state.read_idx];
        if frame.len == 0 {
            return None;
        }
        Some(Frame {
            data: frame.data[..frame.len].to_vec(),
            sequence: frame.sequence,
            timestamp_us: frame.timestamp_us,
            is_keyframe: frame.is_keyframe,
        })
    }

    /// Current sequence number (0 if nothing published).
    pub fn sequence(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.frame_count
    }

    /// Block until a frame newer than `last_sequence` is available, then
    /// copy it out. Returns None on timeout.
    pub fn wait_newer(&self, last_sequence: u64, timeout: Duration) -> Option<Frame> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.frame_count <= last_sequence {
            let (next, result) = self
                .cond
                .wait_timeout(state, timeout)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
            if result.timed_out() && state.frame_count <= last_sequence {
                return None;
            }
        }
        let frame = &state.frames[state.read_idx];
        Some(Frame {
            data: frame.data[..frame.len].to_vec(),
            sequence: frame.sequence,
            timestamp_us: frame.timestamp_us,
            is_keyframe: frame.is_keyframe,
        })
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// The full slot set one camera publishes into.
pub struct CameraSlots {
    pub jpeg: FrameSlot,
    pub h264: FrameSlot,
}

impl CameraSlots {
    pub fn new() -> Self {
        Self {
            jpeg: FrameSlot::new(),
            h264: FrameSlot::new(),
        }
    }
}

impl Default for CameraSlots {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn latest_returns_most_recent_publish() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());

        slot.publish(b"first", 0, false);
        slot.publish(b"second", 0, false);

        let frame = slot.latest().unwrap();
        assert_eq!(frame.data, b"second");
        assert_eq!(frame.sequence, 2);
    }

    #[test]
    fn shrinking_frame_does_not_leak_old_bytes() {
        let slot = FrameSlot::new();
        slot.publish(b"a-long-first-frame", 0, false);
        slot.publish(b"ab", 0, false);
        // Two publishes land in alternating buffers; publish twice more so
        // the short frame overwrites the long one's buffer.
        slot.publish(b"cd", 0, false);
        let frame = slot.latest().unwrap();
        assert_eq!(frame.data, b"cd");
    }

    #[test]
    fn wait_newer_times_out_without_publisher() {
        let slot = FrameSlot::new();
        assert!(slot.wait_newer(0, Duration::from_millis(10)).is_none());
    }

    #[test]
    fn wait_newer_wakes_on_publish() {
        let slot = Arc::new(FrameSlot::new());
        let writer = slot.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.publish(b"frame", 0, true);
        });

        let frame = slot.wait_newer(0, Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(frame.data, b"frame");
        assert!(frame.is_keyframe);
    }

    #[test]
    fn sequences_increase_monotonically() {
        let slot = FrameSlot::new();
        for i in 1..=10u64 {
            slot.publish(format!("frame{}", i).as_bytes(), 0, false);
            assert_eq!(slot.sequence(), i);
            assert_eq!(slot.latest().unwrap().sequence, i);
        }
    }
}
