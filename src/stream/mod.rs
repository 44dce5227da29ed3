//! Stream servers: MJPEG multipart, single-shot snapshot, and FLV-wrapped
//! H.264, each on its fixed port.
//!
//! The accept loops are non-blocking with a short poll sleep so shutdown is
//! prompt (the same discipline as every other thread here). Each accepted
//! client gets its own thread; the per-kind live client counts are the sole
//! signal the capture driver uses to decide between idle and active.

pub mod flv;
pub mod http;
pub mod mjpeg;

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::frame::{CameraSlots, StreamKind};
use crate::shutdown::Shutdown;

/// Upper bound on concurrent streaming clients per server.
const MAX_CLIENTS: usize = 24;
/// Poll interval for the non-blocking accept loops.
const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// FLV streaming frame wait, mirroring the MJPEG side.
const FRAME_WAIT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Client accounting
// ---------------------------------------------------------------------------

/// Live client counters per stream kind.
pub struct ClientCounts {
    jpeg: AtomicUsize,
    h264: AtomicUsize,
}

impl ClientCounts {
    pub fn new() -> Self {
        Self {
            jpeg: AtomicUsize::new(0),
            h264: AtomicUsize::new(0),
        }
    }

    pub fn connect(&self, kind: StreamKind) {
        self.counter(kind).fetch_add(1, Ordering::SeqCst);
    }

    pub fn disconnect(&self, kind: StreamKind) {
        let counter = self.counter(kind);
        let mut current = counter.load(Ordering::SeqCst);
        while current > 0 {
            match counter.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn count(&self, kind: StreamKind) -> usize {
        self.counter(kind).load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.count(StreamKind::Jpeg) + self.count(StreamKind::H264)
    }

    fn counter(&self, kind: StreamKind) -> &AtomicUsize {
        match kind {
            StreamKind::Jpeg => &self.jpeg,
            StreamKind::H264 => &self.h264,
        }
    }
}

impl Default for ClientCounts {
    fn default() -> Self {
        Self::new()
    }
}

/// One connected streaming consumer; created on accept, destroyed on
/// disconnect or write failure.
pub struct SessionGuard {
    counts: Arc<ClientCounts>,
    kind: StreamKind,
}

impl SessionGuard {
    pub fn connect(counts: Arc<ClientCounts>, kind: StreamKind) -> Self {
        counts.connect(kind);
        Self { counts, kind }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counts.disconnect(self.kind);
    }
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

/// Stream resolution/rate advertised in the FLV metadata.
#[derive(Clone, Copy, Debug)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Spawn the MJPEG/snapshot server on `port`. Returns the bound port.
pub fn spawn_mjpeg_server(
    port: u16,
    slots: Arc<CameraSlots>,
    counts: Arc<ClientCounts>,
    shutdown: Shutdown,
) -> Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    let bound = listener.local_addr()?.port();
    listener.set_nonblocking(true)?;
    log::info!("mjpeg server listening on :{}", bound);

    std::thread::Builder::new()
        .name(format!("mjpeg-{}", bound))
        .spawn(move || accept_loop(listener, shutdown, move |stream, shutdown| {
            handle_mjpeg_client(stream, slots.clone(), counts.clone(), shutdown)
        }))
        .map_err(crate::error::Error::Io)?;
    Ok(bound)
}

/// Spawn the FLV server on `port`. Returns the bound port.
pub fn spawn_flv_server(
    port: u16,
    slots: Arc<CameraSlots>,
    counts: Arc<ClientCounts>,
    info: StreamInfo,
    shutdown: Shutdown,
) -> Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    let bound = listener.local_addr()?.port();
    listener.set_nonblocking(true)?;
    log::info!("flv server listening on :{}", bound);

    std::thread::Builder::new()
        .name(format!("flv-{}", bound))
        .spawn(move || accept_loop(listener, shutdown, move |stream, shutdown| {
            handle_flv_client(stream, slots.clone(), counts.clone(), info, shutdown)
        }))
        .map_err(crate::error::Error::Io)?;
    Ok(bound)
}

fn accept_loop<F>(listener: TcpListener, shutdown: Shutdown, handler: F)
where
    F: Fn(TcpStream, Shutdown) + Send + Clone + 'static,
{
    while shutdown.is_running() {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("stream client connected: {}", peer);
                let handler = handler.clone();
                let client_shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name("stream-client".to_string())
                    .spawn(move || handler(stream, client_shutdown));
                if let Err(err) = spawned {
                    log::warn!("stream: spawn client thread failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                shutdown.sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::warn!("stream accept failed: {}", err);
                shutdown.sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_mjpeg_client(
    mut stream: TcpStream,
    slots: Arc<CameraSlots>,
    counts: Arc<ClientCounts>,
    shutdown: Shutdown,
) {
    let request = match http::read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            log::debug!("mjpeg: bad request: {}", err);
            return;
        }
    };
    if request.method != "GET" {
        let _ = http::write_response(&mut stream, 405, "text/plain", b"method not allowed");
        return;
    }
    if counts.total() >= MAX_CLIENTS {
        let _ = http::write_response(&mut stream, 503, "text/plain", b"too many clients");
        return;
    }

    let result = match request.path.as_str() {
        "/stream" => mjpeg::serve_stream(stream, slots, counts, shutdown),
        "/snapshot" => mjpeg::serve_snapshot(stream, slots, counts),
        _ => {
            let _ = http::write_response(&mut stream, 404, "text/plain", b"not found");
            return;
        }
    };
    if let Err(err) = result {
        log::debug!("mjpeg client gone: {}", err);
    }
}

fn handle_flv_client(
    mut stream: TcpStream,
    slots: Arc<CameraSlots>,
    counts: Arc<ClientCounts>,
    info: StreamInfo,
    shutdown: Shutdown,
) {
    let request = match http::read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            log::debug!("flv: bad request: {}", err);
            return;
        }
    };
    if request.method != "GET" || request.path != "/flv" {
        let _ = http::write_response(&mut stream, 404, "text/plain", b"not found");
        return;
    }
    if counts.count(StreamKind::H264) >= MAX_CLIENTS {
        let _ = http::write_response(&mut stream, 503, "text/plain", b"too many clients");
        return;
    }

    if let Err(err) = serve_flv(stream, slots, counts, info, shutdown) {
        log::debug!("flv client gone: {}", err);
    }
}

fn serve_flv(
    mut stream: TcpStream,
    slots: Arc<CameraSlots>,
    counts: Arc<ClientCounts>,
    info: StreamInfo,
    shutdown: Shutdown,
) -> Result<()> {
    use std::io::Write;

    let _session = SessionGuard::connect(counts, StreamKind::H264);
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;
    http::write_stream_head(&mut stream, "video/x-flv")?;

    let mut muxer = flv::FlvMuxer::new(info.width, info.height, info.fps);
    stream.write_all(&muxer.file_header())?;
    stream.write_all(&muxer.metadata_tag())?;

    let mut last_sequence = 0u64;
    let mut waiting_for_keyframe = true;
    while shutdown.is_running() {
        let frame = match slots.h264.wait_newer(last_sequence, FRAME_WAIT) {
            Some(frame) => frame,
            None => continue,
        };
        last_sequence = frame.sequence;

        // Start each client on a keyframe so the decoder has a clean entry.
        if waiting_for_keyframe {
            if !frame.is_keyframe {
                continue;
            }
            waiting_for_keyframe = false;
        }

        let tags = muxer.mux(&frame.data);
        if !tags.is_empty() {
            stream.write_all(&tags)?;
        }
    }
    Ok(())
}
