//! MJPEG multipart stream and single-shot snapshot endpoints.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::frame::{CameraSlots, StreamKind};
use crate::shutdown::Shutdown;
use crate::stream::{ClientCounts, SessionGuard};

use super::http;

pub const BOUNDARY: &str = "mjpegstream";

/// How long a streaming client waits for a newer frame before re-checking
/// shutdown. The capture side may legitimately be slower than this.
const FRAME_WAIT: Duration = Duration::from_millis(500);

/// Snapshot waits span camera wake-up plus warm-up ramp.
const SNAPSHOT_WAIT: Duration = Duration::from_secs(5);

/// Serve `multipart/x-mixed-replace` JPEG parts until the client goes away.
pub fn serve_stream(
    mut stream: TcpStream,
    slots: Arc<CameraSlots>,
    counts: Arc<ClientCounts>,
    shutdown: Shutdown,
) -> Result<()> {
    let _session = SessionGuard::connect(counts, StreamKind::Jpeg);
    // A stalled client must tie up only its own thread, never forever.
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;
    http::write_stream_head(
        &mut stream,
        &format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
    )?;

    let mut last_sequence = 0u64;
    while shutdown.is_running() {
        let frame = match slots.jpeg.wait_newer(last_sequence, FRAME_WAIT) {
            Some(frame) => frame,
            None => continue,
        };
        last_sequence = frame.sequence;

        let part_head = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            BOUNDARY,
            frame.data.len()
        );
        // A failed write means the client disconnected; the session guard
        // drops the counter on the way out.
        stream.write_all(part_head.as_bytes())?;
        stream.write_all(&frame.data)?;
        stream.write_all(b"\r\n")?;
    }
    Ok(())
}

/// Serve one JPEG. Registers as a client first so an idle camera wakes up
/// and produces a fresh frame for us.
pub fn serve_snapshot(
    mut stream: TcpStream,
    slots: Arc<CameraSlots>,
    counts: Arc<ClientCounts>,
) -> Result<()> {
    let _session = SessionGuard::connect(counts, StreamKind::Jpeg);

    let current = slots.jpeg.sequence();
    let frame = slots
        .jpeg
        .wait_newer(current, SNAPSHOT_WAIT)
        .or_else(|| slots.jpeg.latest());

    match frame {
        Some(frame) => http::write_response(&mut stream, 200, "image/jpeg", &frame.data),
        None => http::write_response(&mut stream, 503, "text/plain", b"no frame available"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn slots_with_frame() -> Arc<CameraSlots> {
        let slots = Arc::new(CameraSlots::new());
        slots.jpeg.publish(&[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9], 0, true);
        slots
    }

    #[test]
    fn snapshot_serves_a_fresh_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let slots = slots_with_frame();
        let counts = Arc::new(ClientCounts::new());

        // The snapshot handler waits for a frame newer than what it found;
        // a publisher delivers one shortly after.
        let publisher_slots = slots.clone();
        let publisher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            publisher_slots
                .jpeg
                .publish(&[0xFF, 0xD8, 0x99, 0xFF, 0xD9], 0, true);
        });

        let server_counts = counts.clone();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_snapshot(stream, slots, server_counts).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        handle.join().unwrap();
        publisher.join().unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("image/jpeg"));
        assert_eq!(counts.total(), 0, "session must be released");
    }

    #[test]
    fn stream_emits_multipart_parts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let slots = slots_with_frame();
        let counts = Arc::new(ClientCounts::new());
        let shutdown = Shutdown::new();

        let server_slots = slots.clone();
        let server_shutdown = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Client disconnect ends the loop with a write error; fine.
            let _ = serve_stream(stream, server_slots, counts, server_shutdown);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        slots.jpeg.publish(&[0xFF, 0xD8, 0x42, 0xFF, 0xD9], 0, true);

        let mut buf = vec![0u8; 2048];
        let n = client.read(&mut buf).unwrap();
        let head = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(head.contains("multipart/x-mixed-replace"));

        drop(client);
        shutdown.trigger();
        handle.join().unwrap();
    }
}
