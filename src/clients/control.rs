//! Pub/sub camera-control client.
//!
//! Subscribes to the per-device video topics on the local TLS broker and
//! handles start/stop-capture commands from the printer firmware, publishing
//! acknowledgement reports back. Delivery is at-least-once, so commands are
//! deduplicated by message id. A spurious stop report that we did not send
//! is countered with a fresh start report so the cloud side never believes
//! the stream died.
//!
//! Every topic and report goes through a fixed-capacity builder that refuses
//! to write past its limit and returns a protocol error instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rumqttc::{Client, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::Deserialize;

use crate::clients::{ClientStatus, ConnectionState};
use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;

/// Broker reconnect delay.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Protocol-level keepalive; the broker drops idle connections without it.
const KEEPALIVE: Duration = Duration::from_secs(60);

/// Fixed capacities for encoded topics and report payloads.
pub const TOPIC_CAPACITY: usize = 256;
pub const PAYLOAD_CAPACITY: usize = 512;

/// Remembered message ids for duplicate suppression.
const MAX_MSGIDS: usize = 64;
const MSGID_RETENTION: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Bounded encoding
// ---------------------------------------------------------------------------

/// Build a string into a fixed capacity, failing instead of overflowing.
pub struct BoundedBuf {
    out: String,
    capacity: usize,
}

impl BoundedBuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            out: String::new(),
            capacity,
        }
    }

    pub fn push(&mut self, part: &str) -> Result<()> {
        if self.out.len() + part.len() > self.capacity {
            return Err(Error::Protocol(format!(
                "encoded message exceeds {} byte capacity",
                self.capacity
            )));
        }
        self.out.push_str(part);
        Ok(())
    }

    pub fn finish(self) -> String {
        self.out
    }
}

/// Topic scopes commands arrive on.
pub const COMMAND_SCOPES: [&str; 2] = ["web", "slicer"];

/// `{prefix}/{scope}/printer/{model}/{device}/video`
pub fn command_topic(prefix: &str, scope: &str, model: &str, device: &str) -> Result<String> {
    let mut buf = BoundedBuf::new(TOPIC_CAPACITY);
    for part in [prefix, "/", scope, "/printer/", model, "/", device, "/video"] {
        buf.push(part)?;
    }
    Ok(buf.finish())
}

/// `{prefix}/printer/public/{model}/{device}/video/report`
pub fn report_topic(prefix: &str, model: &str, device: &str) -> Result<String> {
    let mut buf = BoundedBuf::new(TOPIC_CAPACITY);
    for part in [prefix, "/printer/public/", model, "/", device, "/video/report"] {
        buf.push(part)?;
    }
    Ok(buf.finish())
}

/// Inbound command payload: small JSON object with a
/// type/action/timestamp/msgid/data shape.
#[derive(Debug, Deserialize)]
pub struct VideoCommand {
    #[serde(default, rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(default)]
    pub msgid: String,
}

/// Encode an acknowledgement report within the payload capacity.
pub fn report_payload(action: &str, state: &str, msgid: &str) -> Result<String> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let json = serde_json::json!({
        "type": "video",
        "action": action,
        "timestamp": timestamp,
        "msgid": msgid,
        "state": state,
        "code": 200,
        "msg": "",
        "data": null,
    })
    .to_string();

    let mut buf = BoundedBuf::new(PAYLOAD_CAPACITY);
    buf.push(&json)?;
    Ok(buf.finish())
}

fn fresh_msgid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{:08x}{:08x}", rng.gen::<u32>(), rng.gen::<u32>())
}

// ---------------------------------------------------------------------------
// Command handling (socket-free, unit-testable)
// ---------------------------------------------------------------------------

struct HandledMsgIds {
    ids: Vec<String>,
    last_cleanup: Instant,
}

impl HandledMsgIds {
    fn new() -> Self {
        Self {
            ids: Vec::new(),
            last_cleanup: Instant::now(),
        }
    }

    /// Record `msgid`; true if it was already seen recently.
    fn seen(&mut self, msgid: &str) -> bool {
        if msgid.is_empty() {
            return false;
        }
        if self.last_cleanup.elapsed() > MSGID_RETENTION {
            self.ids.clear();
            self.last_cleanup = Instant::now();
        }
        if self.ids.iter().any(|id| id == msgid) {
            return true;
        }
        if self.ids.len() < MAX_MSGIDS {
            self.ids.push(msgid.to_string());
        }
        false
    }
}

/// An outbound report: (topic, payload).
pub type OutboundReport = (String, String);

/// Dispatch logic for inbound publishes, independent of any socket.
pub struct ControlLogic {
    report_topic: String,
    paused: Arc<AtomicBool>,
    handled: Mutex<HandledMsgIds>,
}

impl ControlLogic {
    pub fn new(report_topic: String, paused: Arc<AtomicBool>) -> Self {
        Self {
            report_topic,
            paused,
            handled: Mutex::new(HandledMsgIds::new()),
        }
    }

    /// Handle one inbound publish; returns the reports to send back.
    pub fn handle_publish(&self, topic: &str, payload: &[u8]) -> Vec<OutboundReport> {
        if topic.ends_with("/video/report") {
            return self.handle_report(payload);
        }
        if !topic.ends_with("/video") {
            return Vec::new();
        }

        let command: VideoCommand = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(err) => {
                log::warn!("control: unparseable command: {}", err);
                return Vec::new();
            }
        };

        match command.action.as_str() {
            "startCapture" | "stopCapture" => {}
            _ => return Vec::new(),
        }

        // At-least-once delivery: duplicates are acknowledged exactly once.
        if self
            .handled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen(&command.msgid)
        {
            return Vec::new();
        }

        let stopping = command.action == "stopCapture";
        self.paused.store(stopping, Ordering::SeqCst);
        log::info!(
            "control: {} (streaming {})",
            command.action,
            if stopping { "paused" } else { "resumed" }
        );

        let state = if stopping { "pushStopped" } else { "initSuccess" };
        match report_payload(&command.action, state, &fresh_msgid()) {
            Ok(payload) => vec![(self.report_topic.clone(), payload)],
            Err(err) => {
                log::warn!("control: report encoding failed: {}", err);
                Vec::new()
            }
        }
    }

    /// Reports we observe on our own report topic: a stopCapture we never
    /// issued means something else is pausing the stream; counter it.
    fn handle_report(&self, payload: &[u8]) -> Vec<OutboundReport> {
        let command: VideoCommand = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(_) => return Vec::new(),
        };
        if command.action != "stopCapture" {
            return Vec::new();
        }
        if self
            .handled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen(&command.msgid)
        {
            return Vec::new();
        }
        log::warn!("control: spurious stopCapture report detected, countering");
        match report_payload("startCapture", "initSuccess", &fresh_msgid()) {
            Ok(payload) => vec![(self.report_topic.clone(), payload)],
            Err(err) => {
                log::warn!("control: counter report encoding failed: {}", err);
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Broker connection loop
// ---------------------------------------------------------------------------

pub struct ControlClient {
    config: Arc<ConfigStore>,
    paused: Arc<AtomicBool>,
    status: Arc<ClientStatus>,
    shutdown: Shutdown,
}

impl ControlClient {
    pub fn new(
        config: Arc<ConfigStore>,
        paused: Arc<AtomicBool>,
        status: Arc<ClientStatus>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            paused,
            status,
            shutdown,
        }
    }

    /// Blocking connect/dispatch loop with reconnect on any failure.
    pub fn run(&self) {
        while self.shutdown.is_running() {
            if let Err(err) = self.session() {
                log::warn!("control: session ended: {}", err);
            }
            if !self.shutdown.is_running() {
                break;
            }
            self.status.enter_backoff(RECONNECT_DELAY);
            self.shutdown.sleep(RECONNECT_DELAY);
        }
        self.status.set(ConnectionState::Disconnected);
        log::info!("control: stopped");
    }

    fn session(&self) -> Result<()> {
        let cfg = self.config.snapshot();
        let control = &cfg.control;
        if control.model_id.is_empty() || control.device_id.is_empty() {
            return Err(Error::Protocol(
                "control client needs model_id and device_id".to_string(),
            ));
        }

        self.status.set(ConnectionState::Connecting);

        let client_id = format!("printcam_{:08x}", rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, &control.broker_host, control.broker_port);
        options.set_keep_alive(KEEPALIVE);
        options.set_clean_session(true);
        if !control.username.is_empty() {
            options.set_credentials(&control.username, &control.password);
        }
        if !control.ca_cert_path.is_empty() {
            let ca = std::fs::read(&control.ca_cert_path)?;
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        } else {
            log::warn!("control: no CA certificate configured, connecting without TLS");
        }

        let report_topic =
            report_topic(&control.topic_prefix, &control.model_id, &control.device_id)?;
        let logic = ControlLogic::new(report_topic.clone(), self.paused.clone());

        let (client, mut connection) = Client::new(options, 10);
        for scope in COMMAND_SCOPES {
            let topic = command_topic(
                &control.topic_prefix,
                scope,
                &control.model_id,
                &control.device_id,
            )?;
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .map_err(|e| Error::Protocol(format!("subscribe {}: {}", topic, e)))?;
        }
        client
            .subscribe(report_topic.as_str(), QoS::AtLeastOnce)
            .map_err(|e| Error::Protocol(format!("subscribe {}: {}", report_topic, e)))?;

        log::info!(
            "control: subscribed for model={} device={}...",
            control.model_id,
            &control.device_id[..control.device_id.len().min(8)]
        );

        for event in connection.iter() {
            if !self.shutdown.is_running() {
                break;
            }
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.status.set(ConnectionState::Connected);
                    log::info!("control: connected to broker");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    for (topic, payload) in
                        logic.handle_publish(&publish.topic, &publish.payload)
                    {
                        if let Err(err) = client.publish(
                            topic.as_str(),
                            QoS::AtMostOnce,
                            false,
                            payload.as_bytes(),
                        ) {
                            log::warn!("control: report publish failed: {}", err);
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    return Err(Error::Protocol(format!("broker connection lost: {}", err)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logic() -> (ControlLogic, Arc<AtomicBool>) {
        let paused = Arc::new(AtomicBool::new(false));
        let logic = ControlLogic::new("prefix/video/report".to_string(), paused.clone());
        (logic, paused)
    }

    #[test]
    fn topics_are_parameterized() {
        let topic = command_topic("cloud/v1", "web", "M5", "dev123").unwrap();
        assert_eq!(topic, "cloud/v1/web/printer/M5/dev123/video");
        let report = report_topic("cloud/v1", "M5", "dev123").unwrap();
        assert_eq!(report, "cloud/v1/printer/public/M5/dev123/video/report");
    }

    #[test]
    fn oversized_topic_is_refused_not_truncated() {
        let device = "x".repeat(TOPIC_CAPACITY);
        match command_topic("p", "web", "model", &device) {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn report_round_trips_within_capacity() {
        let payload = report_payload("startCapture", "initSuccess", "abc123").unwrap();
        assert!(payload.len() <= PAYLOAD_CAPACITY);
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["type"], "video");
        assert_eq!(parsed["action"], "startCapture");
        assert_eq!(parsed["state"], "initSuccess");
        assert_eq!(parsed["code"], 200);
        assert!(parsed["data"].is_null());
    }

    #[test]
    fn stop_capture_pauses_and_acknowledges() {
        let (logic, paused) = logic();
        let payload = br#"{"type":"video","action":"stopCapture","msgid":"m1"}"#;
        let out = logic.handle_publish("cloud/v1/web/printer/M5/d/video", payload);
        assert_eq!(out.len(), 1);
        assert!(paused.load(Ordering::SeqCst));

        let report: serde_json::Value = serde_json::from_str(&out[0].1).unwrap();
        assert_eq!(report["state"], "pushStopped");
    }

    #[test]
    fn duplicate_msgid_is_idempotent() {
        let (logic, paused) = logic();
        let payload = br#"{"type":"video","action":"startCapture","msgid":"dup"}"#;
        let first = logic.handle_publish("t/video", payload);
        let second = logic.handle_publish("t/video", payload);
        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "duplicate delivery must be a no-op");
        assert!(!paused.load(Ordering::SeqCst));
    }

    #[test]
    fn spurious_stop_report_is_countered() {
        let (logic, _paused) = logic();
        let payload = br#"{"type":"video","action":"stopCapture","msgid":"other"}"#;
        let out = logic.handle_publish("cloud/v1/printer/public/M5/d/video/report", payload);
        assert_eq!(out.len(), 1);
        let report: serde_json::Value = serde_json::from_str(&out[0].1).unwrap();
        assert_eq!(report["action"], "startCapture");
        assert_eq!(report["state"], "initSuccess");
    }

    #[test]
    fn unknown_actions_are_ignored() {
        let (logic, paused) = logic();
        let payload = br#"{"type":"video","action":"zoom","msgid":"z"}"#;
        assert!(logic.handle_publish("t/video", payload).is_empty());
        assert!(!paused.load(Ordering::SeqCst));
    }
}
