//! FLV wrapping for the H.264 stream.
//!
//! Wraps Annex-B H.264 access units into a progressive FLV byte stream:
//! file header, an onMetaData script tag, one AVC sequence-header tag once
//! SPS/PPS have been seen, then one video tag per access unit with NALUs
//! converted to length-prefixed form.

/// Annex-B NAL unit types we care about.
const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

const TAG_TYPE_VIDEO: u8 = 9;
const TAG_TYPE_SCRIPT: u8 = 18;

pub struct FlvMuxer {
    width: u32,
    height: u32,
    fps: u32,
    frame_duration_ms: u32,
    timestamp_ms: u32,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    sequence_header_sent: bool,
}

impl FlvMuxer {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            width,
            height,
            fps,
            frame_duration_ms: 1000 / fps,
            timestamp_ms: 0,
            sps: None,
            pps: None,
            sequence_header_sent: false,
        }
    }

    /// FLV file header plus PreviousTagSize0 (13 bytes, video only).
    pub fn file_header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        out.extend_from_slice(b"FLV");
        out.push(1); // version
        out.push(0x01); // video only
        out.extend_from_slice(&9u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out
    }

    /// onMetaData script tag describing the stream.
    pub fn metadata_tag(&self) -> Vec<u8> {
        let mut amf = Vec::with_capacity(128);
        amf.push(0x02); // AMF0 string
        amf.extend_from_slice(&(10u16).to_be_bytes());
        amf.extend_from_slice(b"onMetaData");

        amf.push(0x08); // ECMA array
        amf.extend_from_slice(&5u32.to_be_bytes());
        amf_number(&mut amf, "width", self.width as f64);
        amf_number(&mut amf, "height", self.height as f64);
        amf_number(&mut amf, "framerate", self.fps as f64);
        amf_number(&mut amf, "videocodecid", 7.0); // AVC
        amf_number(&mut amf, "duration", 0.0); // live
        amf.extend_from_slice(&[0x00, 0x00, 0x09]); // end of object

        make_tag(TAG_TYPE_SCRIPT, &amf, 0)
    }

    /// Wrap one access unit. Returns zero or more complete FLV tags; empty
    /// until the first frame carrying SPS/PPS has been seen.
    pub fn mux(&mut self, access_unit: &[u8]) -> Vec<u8> {
        let mut keyframe = false;
        let mut nalus: Vec<u8> = Vec::with_capacity(access_unit.len() + 16);

        for nal in split_nal_units(access_unit) {
            let nal_type = nal[0] & 0x1F;
            match nal_type {
                NAL_SPS => self.sps = Some(nal.to_vec()),
                NAL_PPS => self.pps = Some(nal.to_vec()),
                _ => {
                    if nal_type == NAL_IDR {
                        keyframe = true;
                    }
                    nalus.extend_from_slice(&(nal.len() as u32).to_be_bytes());
                    nalus.extend_from_slice(nal);
                }
            }
        }

        let mut out = Vec::new();
        if !self.sequence_header_sent {
            if let Some(config) = self.decoder_config() {
                let mut data = Vec::with_capacity(config.len() + 5);
                data.push(0x17); // keyframe + AVC
                data.push(0x00); // sequence header
                data.extend_from_slice(&[0, 0, 0]); // composition time
                data.extend_from_slice(&config);
                out.extend_from_slice(&make_tag(TAG_TYPE_VIDEO, &data, 0));
                self.sequence_header_sent = true;
            }
        }

        if !nalus.is_empty() && self.sequence_header_sent {
            let mut data = Vec::with_capacity(nalus.len() + 5);
            data.push(if keyframe { 0x17 } else { 0x27 });
            data.push(0x01); // AVC NALU
            data.extend_from_slice(&[0, 0, 0]);
            data.extend_from_slice(&nalus);
            out.extend_from_slice(&make_tag(TAG_TYPE_VIDEO, &data, self.timestamp_ms));
            self.timestamp_ms = self.timestamp_ms.wrapping_add(self.frame_duration_ms);
        }
        out
    }

    /// AVCDecoderConfigurationRecord from the cached SPS/PPS.
    fn decoder_config(&self) -> Option<Vec<u8>> {
        let sps = self.sps.as_ref().filter(|s| s.len() >= 4)?;
        let pps = self.pps.as_ref().filter(|p| !p.is_empty())?;

        let mut out = Vec::with_capacity(11 + sps.len() + pps.len());
        out.push(0x01); // configurationVersion
        out.push(sps[1]); // AVCProfileIndication
        out.push(sps[2]); // profile_compatibility
        out.push(sps[3]); // AVCLevelIndication
        out.push(0xFF); // reserved + 4-byte NALU lengths
        out.push(0xE1); // one SPS
        out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        out.extend_from_slice(sps);
        out.push(0x01); // one PPS
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(pps);
        Some(out)
    }
}

fn amf_number(out: &mut Vec<u8>, name: &str, value: f64) {
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(0x00); // number type
    out.extend_from_slice(&value.to_be_bytes());
}

fn make_tag(tag_type: u8, data: &[u8], timestamp_ms: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(11 + data.len() + 4);
    out.push(tag_type);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes()[1..]); // 24-bit size
    out.extend_from_slice(&(timestamp_ms & 0xFF_FFFF).to_be_bytes()[1..]);
    out.push((timestamp_ms >> 24) as u8);
    out.extend_from_slice(&[0, 0, 0]); // stream id
    out.extend_from_slice(data);
    out.extend_from_slice(&((11 + data.len()) as u32).to_be_bytes());
    out
}

/// Split an Annex-B buffer into NAL unit payloads (start codes stripped).
fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut starts: Vec<usize> = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push(i + 3);
                i += 3;
                continue;
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push(i + 4);
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    for (idx, &start) in starts.iter().enumerate() {
        let end = if idx + 1 < starts.len() {
            // Back off over the next start code (3 or 4 bytes).
            let next = starts[idx + 1];
            if next >= 4 && data[next - 4..next] == [0, 0, 0, 1] {
                next - 4
            } else {
                next - 3
            }
        } else {
            data.len()
        };
        if start < end {
            units.push(&data[start..end]);
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        out
    }

    #[test]
    fn header_is_video_only_flv1() {
        let mux = FlvMuxer::new(1280, 720, 10);
        let header = mux.file_header();
        assert_eq!(&header[..3], b"FLV");
        assert_eq!(header[3], 1);
        assert_eq!(header[4], 0x01);
        assert_eq!(header.len(), 13);
    }

    #[test]
    fn split_handles_both_start_code_lengths() {
        let mut data = vec![0, 0, 1, 0x67, 0xAA];
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xBB]);
        let units = split_nal_units(&data);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], &[0x67, 0xAA]);
        assert_eq!(units[1], &[0x68, 0xBB]);
    }

    #[test]
    fn sequence_header_precedes_first_frame() {
        let mut mux = FlvMuxer::new(640, 480, 10);

        // Access unit with SPS, PPS and an IDR slice.
        let au = annexb(&[
            &[0x67, 0x42, 0x00, 0x1F],
            &[0x68, 0xCE, 0x38, 0x80],
            &[0x65, 0x88, 0x84, 0x00],
        ]);
        let tags = mux.mux(&au);
        assert!(!tags.is_empty());
        // First tag is video (sequence header), keyframe + AVC, packet type 0.
        assert_eq!(tags[0], TAG_TYPE_VIDEO);
        assert_eq!(tags[11], 0x17);
        assert_eq!(tags[12], 0x00);
    }

    #[test]
    fn no_output_before_sps_pps() {
        let mut mux = FlvMuxer::new(640, 480, 10);
        let au = annexb(&[&[0x41, 0x9A, 0x00]]); // inter frame only
        assert!(mux.mux(&au).is_empty());
    }

    #[test]
    fn inter_frames_marked_as_such() {
        let mut mux = FlvMuxer::new(640, 480, 10);
        let idr = annexb(&[
            &[0x67, 0x42, 0x00, 0x1F],
            &[0x68, 0xCE, 0x38, 0x80],
            &[0x65, 0x88],
        ]);
        mux.mux(&idr);

        let inter = annexb(&[&[0x41, 0x9A]]);
        let tags = mux.mux(&inter);
        assert_eq!(tags[11], 0x27);
    }
}
