//! Request/reply control protocol client (legacy timelapse path).
//!
//! Connects out to the printer's control service, which streams
//! `process_status_update` notifications carrying `video_stream_request`
//! entries. Messages are single JSON objects each terminated by the ETX
//! control byte. Every request must be replied to, because the remote peer
//! blocks on the reply, and only an explicit error object signals failure.
//!
//! Compatibility shim: the peer closing the connection without an explicit
//! result is treated as success. The fixed remote peer does not always send
//! one, so a disconnect after a request is normal completion here, even
//! though it is indistinguishable from some transient network failures.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::clients::{ClientStatus, ConnectionState};
use crate::config::ConfigStore;
use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::timelapse::{SessionParams, TimelapseEngine};

/// Message terminator: a single ETX control byte.
pub const ETX: u8 = 0x03;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// Read timeout doubling as the loop tick for shutdown checks.
const READ_TICK: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Inbound messages larger than this are discarded as garbage.
const MAX_MESSAGE_BYTES: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Message handling (socket-free, unit-testable)
// ---------------------------------------------------------------------------

/// Dispatches decoded messages against the timelapse engine.
pub struct RpcResponder {
    engine: Arc<TimelapseEngine>,
    config: Arc<ConfigStore>,
}

impl RpcResponder {
    pub fn new(engine: Arc<TimelapseEngine>, config: Arc<ConfigStore>) -> Self {
        Self { engine, config }
    }

    /// Handle one inbound JSON message; returns reply frames to send.
    pub fn handle_message(&self, text: &str) -> Vec<Vec<u8>> {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(_) => return Vec::new(),
        };
        if message.get("method").and_then(Value::as_str) != Some("process_status_update") {
            return Vec::new();
        }
        let Some(status) = message.pointer("/params/status") else {
            return Vec::new();
        };

        let mut replies = Vec::new();
        if let Some(request) = status.get("video_stream_request") {
            if let Some(reply) = self.handle_video_request(request) {
                replies.push(reply);
            }
        }

        // Passively observed job state drives legacy finalize/cancel.
        self.check_print_state(status);
        replies
    }

    fn handle_video_request(&self, request: &Value) -> Option<Vec<u8>> {
        let id = request.get("id").and_then(Value::as_i64)?;
        let method = request.get("method").and_then(Value::as_str)?;

        match method {
            "openDelayCamera" => {
                let filepath = request
                    .pointer("/params/filepath")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let cfg = self.config.snapshot();
                let result = self.engine.begin_legacy(
                    filepath,
                    &cfg.timelapse_output_dir(),
                    std::path::Path::new(&cfg.timelapse.temp_dir),
                    SessionParams::from_settings(&cfg.timelapse),
                );
                if let Err(err) = result {
                    // The peer treats any reply as completion; a failed
                    // start is logged, not escalated.
                    log::warn!("rpc: legacy timelapse start failed: {}", err);
                }
                Some(build_reply(id, method, None))
            }
            "startLanCapture" => {
                let reply = build_reply(id, method, None);
                if !self.engine.is_custom_mode() && self.engine.is_active() {
                    if let Err(err) = self.engine.capture_frame() {
                        log::warn!("rpc: frame capture failed: {}", err);
                    }
                }
                Some(reply)
            }
            "stopLanCapture" => Some(build_reply(id, method, None)),
            // Lighting is handled by the firmware; acknowledge and move on.
            "SetLed" => Some(build_reply(id, method, None)),
            other => {
                log::debug!("rpc: ignoring unknown method {}", other);
                Some(build_reply(id, other, None))
            }
        }
    }

    fn check_print_state(&self, status: &Value) {
        if self.engine.is_custom_mode() || !self.engine.is_active() {
            return;
        }
        let Some(state) = status.pointer("/print_stats/state").and_then(Value::as_str) else {
            return;
        };
        match state {
            "complete" => {
                log::info!("rpc: print completed, finalizing timelapse");
                if let Err(err) = self.engine.finalize() {
                    log::warn!("rpc: finalize failed: {}", err);
                }
            }
            "cancelled" | "error" => {
                log::info!("rpc: print {}, cancelling timelapse", state);
                self.engine.cancel();
            }
            _ => {}
        }
    }
}

/// Encode one reply frame. A reply carries `result` or `error`, never both.
pub fn build_reply(request_id: i64, method: &str, error: Option<&str>) -> Vec<u8> {
    let inner = match error {
        None => json!({ "id": request_id, "method": method, "result": {} }),
        Some(message) => json!({
            "id": request_id,
            "method": method,
            "error": { "message": message },
        }),
    };
    let reply = json!({
        "id": 0,
        "method": "Video/VideoStreamReply",
        "params": {
            "eventtime": 0,
            "status": { "video_stream_reply": inner },
        },
    });
    let mut frame = reply.to_string().into_bytes();
    frame.push(ETX);
    frame
}

/// Accumulates stream bytes and yields complete ETX-delimited messages.
pub struct EtxDecoder {
    buffer: Vec<u8>,
}

impl EtxDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == ETX) {
            let frame: Vec<u8> = self.buffer.drain(..=pos).collect();
            let body = &frame[..frame.len() - 1];
            if !body.is_empty() {
                match std::str::from_utf8(body) {
                    Ok(text) => messages.push(text.to_string()),
                    Err(_) => log::warn!("rpc: dropping non-UTF8 frame"),
                }
            }
        }
        if self.buffer.len() > MAX_MESSAGE_BYTES {
            log::warn!("rpc: oversized unterminated message, dropping buffer");
            self.buffer.clear();
        }
        messages
    }
}

impl Default for EtxDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

pub struct RpcClient {
    responder: RpcResponder,
    config: Arc<ConfigStore>,
    status: Arc<ClientStatus>,
    shutdown: Shutdown,
}

impl RpcClient {
    pub fn new(
        engine: Arc<TimelapseEngine>,
        config: Arc<ConfigStore>,
        status: Arc<ClientStatus>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            responder: RpcResponder::new(engine, config.clone()),
            config,
            status,
            shutdown,
        }
    }

    pub fn run(&self) {
        while self.shutdown.is_running() {
            let addr = self.config.snapshot().rpc_addr.clone();
            self.status.set(ConnectionState::Connecting);
            match self.connect(&addr) {
                Ok(stream) => {
                    log::info!("rpc: connected to {}", addr);
                    self.status.set(ConnectionState::Connected);
                    if let Err(err) = self.serve(stream) {
                        log::warn!("rpc: connection ended: {}", err);
                    }
                }
                Err(err) => {
                    log::debug!("rpc: connect to {} failed: {}", addr, err);
                }
            }
            if !self.shutdown.is_running() {
                break;
            }
            self.status.enter_backoff(RECONNECT_DELAY);
            self.shutdown.sleep(RECONNECT_DELAY);
        }
        self.status.set(ConnectionState::Disconnected);
        log::info!("rpc: stopped");
    }

    fn connect(&self, addr: &str) -> Result<TcpStream> {
        let sockaddr = addr
            .parse()
            .map_err(|e| crate::error::Error::Protocol(format!("bad rpc addr {}: {}", addr, e)))?;
        let stream = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(READ_TICK))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn serve(&self, mut stream: TcpStream) -> Result<()> {
        let mut decoder = EtxDecoder::new();
        let mut buf = [0u8; 4096];

        while self.shutdown.is_running() {
            let n = match stream.read(&mut buf) {
                Ok(0) => {
                    // Peer closed without an explicit reply: success by
                    // protocol contract.
                    log::info!("rpc: connection closed by peer");
                    return Ok(());
                }
                Ok(n) => n,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            for message in decoder.feed(&buf[..n]) {
                for reply in self.responder.handle_message(&message) {
                    stream.write_all(&reply)?;
                }
            }
        }
        Ok(())
    }
}
