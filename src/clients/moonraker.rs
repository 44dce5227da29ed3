//! Print-status subscription client.
//!
//! Speaks JSON-RPC 2.0 over a text-frame WebSocket to the local
//! print-orchestration service, subscribes to print state and layer
//! progress, and drives the timelapse engine directly: begin on the
//! transition to printing, capture per layer change (or on a fixed interval
//! in hyperlapse mode), finalize on completion, and keep partial results on
//! cancellation.
//!
//! Notifications carry partial-state deltas, so every field is merged into
//! locally cached last-known state rather than treated as a snapshot. While
//! connected, the client holds the engine in custom mode, which makes this
//! path authoritative over the legacy RPC triggers.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Value};
use tungstenite::{Message, WebSocket};

use crate::clients::{ClientStatus, ConnectionState};
use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use crate::timelapse::{CaptureMode, SessionParams, TimelapseEngine};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout doubling as the loop tick for shutdown checks.
const READ_TICK: Duration = Duration::from_secs(1);

/// JSON-RPC subscription for print state and layer progress.
pub fn subscribe_request(id: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "printer.objects.subscribe",
        "id": id,
        "params": {
            "objects": {
                "print_stats": null,
                "virtual_sdcard": ["current_layer", "total_layer"],
            }
        }
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Status tracking (socket-free, unit-testable)
// ---------------------------------------------------------------------------

/// Merges status deltas and fires timelapse transitions.
pub struct PrintTracker {
    engine: Arc<TimelapseEngine>,
    config: Arc<ConfigStore>,
    shutdown: Shutdown,

    print_state: String,
    filename: String,
    current_layer: i64,
    first_layer_captured: bool,
    hyperlapse: Option<HyperlapseHandle>,
}

impl PrintTracker {
    pub fn new(
        engine: Arc<TimelapseEngine>,
        config: Arc<ConfigStore>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            engine,
            config,
            shutdown,
            print_state: "standby".to_string(),
            filename: String::new(),
            current_layer: 0,
            first_layer_captured: false,
            hyperlapse: None,
        }
    }

    /// Handle one inbound JSON text frame.
    pub fn process_message(&mut self, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(_) => return,
        };

        if message.get("method").and_then(Value::as_str) == Some("notify_status_update") {
            if let Some(first) = message.pointer("/params/0") {
                let first = first.clone();
                self.handle_status(&first);
            }
        } else if let Some(status) = message.pointer("/result/status") {
            // Subscription response carries the initial full state.
            let status = status.clone();
            self.handle_status(&status);
        }
    }

    /// Merge one status delta and act on transitions.
    pub fn handle_status(&mut self, status: &Value) {
        if let Some(stats) = status.get("print_stats") {
            if let Some(name) = stats.get("filename").and_then(Value::as_str) {
                if !name.is_empty() {
                    self.filename = name.to_string();
                }
            }
            if let Some(state) = stats.get("state").and_then(Value::as_str) {
                let was_printing = self.print_state == "printing";
                let is_printing = state == "printing";

                if !was_printing && is_printing {
                    self.on_print_start();
                } else if was_printing && state == "complete" {
                    self.on_print_complete();
                } else if was_printing && (state == "cancelled" || state == "error") {
                    self.on_print_cancel(state);
                }
                self.print_state = state.to_string();
            }
        }

        if let Some(layer) = extract_layer(status) {
            if self.print_state == "printing" {
                let previous = self.current_layer;
                if layer >= 1 && !self.first_layer_captured {
                    self.on_first_layer();
                }
                if layer != previous && layer >= 2 {
                    self.on_layer_change(layer);
                }
                self.current_layer = layer;
            }
        }
    }

    fn timelapse_enabled(&self) -> bool {
        self.config.snapshot().timelapse.enabled
    }

    fn on_print_start(&mut self) {
        if !self.timelapse_enabled() {
            return;
        }
        log::info!(
            "moonraker: print started: {}",
            if self.filename.is_empty() {
                "(unknown)"
            } else {
                &self.filename
            }
        );
        self.first_layer_captured = false;
        self.current_layer = 0;

        let cfg = self.config.snapshot();
        let params = SessionParams::from_settings(&cfg.timelapse);
        let name = match crate::timelapse::naming::job_name_from_path(&self.filename) {
            Ok(name) => name,
            Err(err) => {
                log::warn!("moonraker: rejecting job name: {}", err);
                return;
            }
        };

        // A stale session from a previous print must not block this one.
        if self.engine.is_active() {
            self.engine.cancel();
        }
        match self.engine.begin(
            &name,
            &cfg.timelapse_output_dir(),
            std::path::Path::new(&cfg.timelapse.temp_dir),
            params,
        ) {
            Ok(()) => log::info!("moonraker: timelapse session started for {}", name),
            Err(err) => log::warn!("moonraker: timelapse start failed: {}", err),
        }
    }

    fn on_first_layer(&mut self) {
        if !self.engine.is_active() {
            return;
        }
        self.first_layer_captured = true;
        log::debug!("moonraker: first layer, capturing frame");
        self.capture_with_delay();

        let cfg = self.config.snapshot();
        let params = SessionParams::from_settings(&cfg.timelapse);
        if params.mode == CaptureMode::Hyperlapse {
            self.start_hyperlapse(params.interval_secs);
        }
    }

    fn on_layer_change(&mut self, layer: i64) {
        if !self.engine.is_active() {
            return;
        }
        let cfg = self.config.snapshot();
        if cfg.timelapse.mode == "layer" {
            log::debug!("moonraker: layer {}, capturing frame", layer);
            self.capture_with_delay();
        }
    }

    fn on_print_complete(&mut self) {
        if !self.engine.is_active() {
            return;
        }
        log::info!(
            "moonraker: print complete ({} frames)",
            self.engine.frame_count()
        );
        self.stop_hyperlapse();

        let end_delay = self.config.snapshot().timelapse.end_delay;
        if end_delay > 0.0 {
            self.shutdown
                .sleep(Duration::from_secs_f32(end_delay.min(30.0)));
        }
        if let Err(err) = self.engine.finalize() {
            log::warn!("moonraker: finalize failed: {}", err);
        }
    }

    fn on_print_cancel(&mut self, reason: &str) {
        if !self.engine.is_active() {
            return;
        }
        let frames = self.engine.frame_count();
        log::info!("moonraker: print {} ({} frames)", reason, frames);
        self.stop_hyperlapse();

        // Partial timelapse is more useful than none: assemble what exists.
        if frames > 0 {
            if let Err(err) = self.engine.finalize() {
                log::warn!("moonraker: partial finalize failed: {}", err);
            }
        } else {
            self.engine.cancel();
        }
    }

    fn capture_with_delay(&self) {
        let delay = self.config.snapshot().timelapse.stream_delay;
        if delay > 0.0 {
            self.shutdown.sleep(Duration::from_secs_f32(delay.min(10.0)));
        }
        if let Err(err) = self.engine.capture_frame() {
            log::warn!("moonraker: frame capture failed: {}", err);
        }
    }

    fn start_hyperlapse(&mut self, interval_secs: u32) {
        if self.hyperlapse.is_some() {
            return;
        }
        let running = Arc::new(AtomicBool::new(true));
        let engine = self.engine.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        let thread_running = running.clone();

        let join = std::thread::Builder::new()
            .name("hyperlapse".to_string())
            .spawn(move || {
                log::debug!("hyperlapse: capturing every {}s", interval_secs);
                'outer: while thread_running.load(Ordering::SeqCst) && engine.is_active() {
                    // Sleep in one-second steps so stop requests are prompt.
                    for _ in 0..interval_secs.max(1) {
                        if !thread_running.load(Ordering::SeqCst)
                            || !engine.is_active()
                            || !shutdown.sleep(Duration::from_secs(1))
                        {
                            break 'outer;
                        }
                    }
                    let delay = config.snapshot().timelapse.stream_delay;
                    if delay > 0.0 {
                        shutdown.sleep(Duration::from_secs_f32(delay.min(10.0)));
                    }
                    if let Err(err) = engine.capture_frame() {
                        log::warn!("hyperlapse: frame capture failed: {}", err);
                    }
                }
            });

        match join {
            Ok(join) => {
                self.hyperlapse = Some(HyperlapseHandle {
                    running,
                    join: Some(join),
                });
            }
            Err(err) => log::warn!("moonraker: hyperlapse thread spawn failed: {}", err),
        }
    }

    pub fn stop_hyperlapse(&mut self) {
        if let Some(mut handle) = self.hyperlapse.take() {
            handle.running.store(false, Ordering::SeqCst);
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
            log::debug!("hyperlapse: stopped");
        }
    }
}

struct HyperlapseHandle {
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// Layer progress from a status delta: the sdcard object takes priority,
/// the print-stats info block is the fallback.
fn extract_layer(status: &Value) -> Option<i64> {
    status
        .pointer("/virtual_sdcard/current_layer")
        .and_then(Value::as_i64)
        .or_else(|| {
            status
                .pointer("/print_stats/info/current_layer")
                .and_then(Value::as_i64)
        })
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

pub struct MoonrakerClient {
    engine: Arc<TimelapseEngine>,
    config: Arc<ConfigStore>,
    status: Arc<ClientStatus>,
    shutdown: Shutdown,
}

impl MoonrakerClient {
    pub fn new(
        engine: Arc<TimelapseEngine>,
        config: Arc<ConfigStore>,
        status: Arc<ClientStatus>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            engine,
            config,
            status,
            shutdown,
        }
    }

    pub fn run(&self) {
        let mut request_id = 0u64;
        while self.shutdown.is_running() {
            self.status.set(ConnectionState::Connecting);
            match self.connect() {
                Ok(mut socket) => {
                    self.status.set(ConnectionState::Connected);
                    // This path is authoritative while connected.
                    self.engine.set_custom_mode(true);

                    request_id += 1;
                    let mut tracker = PrintTracker::new(
                        self.engine.clone(),
                        self.config.clone(),
                        self.shutdown.clone(),
                    );
                    if let Err(err) = self.session(&mut socket, &mut tracker, request_id) {
                        log::warn!("moonraker: connection lost: {}", err);
                    }
                    tracker.stop_hyperlapse();
                    // The session survives the socket; only custom mode is
                    // released, and only when nothing is recording.
                    self.engine.release_custom_mode_if_idle();
                }
                Err(err) => {
                    log::debug!("moonraker: connect failed: {}", err);
                }
            }
            if !self.shutdown.is_running() {
                break;
            }
            self.status.enter_backoff(RECONNECT_DELAY);
            self.shutdown.sleep(RECONNECT_DELAY);
        }
        self.status.set(ConnectionState::Disconnected);
        log::info!("moonraker: stopped");
    }

    fn connect(&self) -> Result<WebSocket<TcpStream>> {
        let cfg = self.config.snapshot();
        let addr = format!("{}:{}", cfg.moonraker_host, cfg.moonraker_port);
        let sockaddr = addr
            .parse()
            .map_err(|e| Error::Protocol(format!("bad moonraker addr {}: {}", addr, e)))?;
        let stream = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;

        let url = format!("ws://{}/websocket", addr);
        let (socket, _response) = tungstenite::client::client(url, stream)
            .map_err(|e| Error::Protocol(format!("websocket handshake: {}", e)))?;
        // The read timeout is the receive-loop tick; set it after the
        // handshake so the upgrade itself is not chopped up.
        socket.get_ref().set_read_timeout(Some(READ_TICK))?;

        log::info!("moonraker: connected to {}", addr);
        Ok(socket)
    }

    fn session(
        &self,
        socket: &mut WebSocket<TcpStream>,
        tracker: &mut PrintTracker,
        request_id: u64,
    ) -> Result<()> {
        socket
            .send(Message::Text(subscribe_request(request_id)))
            .map_err(|e| Error::Protocol(format!("subscribe send: {}", e)))?;

        while self.shutdown.is_running() {
            match socket.read() {
                Ok(Message::Text(text)) => tracker.process_message(&text),
                Ok(Message::Ping(_)) => {
                    // tungstenite queues the pong; flush pushes it out now.
                    let _ = socket.flush();
                }
                Ok(Message::Close(_)) => {
                    return Err(Error::Protocol("server closed the connection".to_string()));
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(err))
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    return Err(Error::Protocol(format!("websocket read: {}", err)));
                }
            }
        }
        Ok(())
    }
}
