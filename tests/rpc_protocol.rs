//! Request/reply protocol behavior against a simulated peer, including the
//! close-without-reply-is-success compatibility contract.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use printcam::capture::venc::{EncoderHub, StubEncoder};
use printcam::clients::rpc::{RpcClient, ETX};
use printcam::clients::ClientStatus;
use printcam::config::{AppConfig, ConfigStore};
use printcam::frame::CameraSlots;
use printcam::timelapse::TimelapseEngine;
use printcam::Shutdown;

struct Peer {
    stream: TcpStream,
}

impl Peer {
    fn send(&mut self, json: &str) {
        let mut frame = json.as_bytes().to_vec();
        frame.push(ETX);
        self.stream.write_all(&frame).unwrap();
    }

    /// Read until one ETX-terminated reply arrives.
    fn read_reply(&mut self) -> serde_json::Value {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "timed out waiting for reply");
            let n = self.stream.read(&mut buf).unwrap();
            assert!(n > 0, "peer connection closed while waiting for reply");
            data.extend_from_slice(&buf[..n]);
            if let Some(pos) = data.iter().position(|&b| b == ETX) {
                return serde_json::from_slice(&data[..pos]).unwrap();
            }
        }
    }
}

fn video_request(id: u64, method: &str, filepath: Option<&str>) -> String {
    let request = match filepath {
        Some(path) => serde_json::json!({
            "id": id, "method": method, "params": { "filepath": path }
        }),
        None => serde_json::json!({ "id": id, "method": method }),
    };
    serde_json::json!({
        "method": "process_status_update",
        "params": { "status": { "video_stream_request": request } }
    })
    .to_string()
}

#[test]
fn begin_capture_and_close_without_reply_counts_as_success() {
    let dir = tempfile::tempdir().unwrap();

    // Fake control-service peer.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut cfg = AppConfig::default();
    cfg.rpc_addr = addr.to_string();
    cfg.timelapse.output_dir = dir.path().join("out").to_string_lossy().into_owned();
    cfg.timelapse.temp_dir = dir.path().join("frames").to_string_lossy().into_owned();
    let config = Arc::new(ConfigStore::new(cfg));

    let slots = Arc::new(CameraSlots::new());
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend(std::iter::repeat(0x42).take(1500));
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    slots.jpeg.publish(&jpeg, 0, true);

    let engine = Arc::new(TimelapseEngine::new(
        slots,
        EncoderHub::new(Box::new(StubEncoder::new())),
        Arc::new(AtomicBool::new(false)),
    ));

    let shutdown = Shutdown::new();
    let status = Arc::new(ClientStatus::new());
    let client = RpcClient::new(engine.clone(), config, status, shutdown.clone());
    let client_thread = std::thread::spawn(move || client.run());

    let (stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut peer = Peer { stream };

    // begin
    peer.send(&video_request(
        1,
        "openDelayCamera",
        Some("/gcodes/benchy.gcode"),
    ));
    let reply = peer.read_reply();
    assert_eq!(reply["method"], "Video/VideoStreamReply");
    let inner = reply.pointer("/params/status/video_stream_reply").unwrap();
    assert_eq!(inner["id"], 1);
    assert_eq!(inner["method"], "openDelayCamera");
    assert!(inner.get("error").is_none());

    // capture x5; every request is replied to.
    for id in 2..=6 {
        peer.send(&video_request(id, "startLanCapture", None));
        let reply = peer.read_reply();
        let inner = reply.pointer("/params/status/video_stream_reply").unwrap();
        assert_eq!(inner["id"], id);
    }

    // Close the connection without any further message: by protocol
    // contract this is success, not failure.
    drop(peer);

    // The session survives the disconnect and is eligible for finalize.
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.frame_count() < 5 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(engine.frame_count(), 5);
    assert!(engine.is_active());

    let output = engine.finalize().unwrap().expect("finalize must produce output");
    assert_eq!(output.frame_count, 5);
    assert!(output.video.exists());

    shutdown.trigger();
    client_thread.join().unwrap();
}

#[test]
fn led_and_stop_requests_are_acknowledged() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut cfg = AppConfig::default();
    cfg.rpc_addr = addr.to_string();
    let config = Arc::new(ConfigStore::new(cfg));

    let engine = Arc::new(TimelapseEngine::new(
        Arc::new(CameraSlots::new()),
        EncoderHub::new(Box::new(StubEncoder::new())),
        Arc::new(AtomicBool::new(false)),
    ));

    let shutdown = Shutdown::new();
    let status = Arc::new(ClientStatus::new());
    let client = RpcClient::new(engine.clone(), config, status, shutdown.clone());
    let client_thread = std::thread::spawn(move || client.run());

    let (stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut peer = Peer { stream };

    for (id, method) in [(10, "SetLed"), (11, "stopLanCapture")] {
        peer.send(&video_request(id, method, None));
        let reply = peer.read_reply();
        let inner = reply.pointer("/params/status/video_stream_reply").unwrap();
        assert_eq!(inner["id"], id);
        assert!(inner.get("result").is_some());
    }
    // Neither request may start a session.
    assert!(!engine.is_active());

    shutdown.trigger();
    client_thread.join().unwrap();
}
