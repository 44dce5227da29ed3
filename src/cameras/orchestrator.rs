//! Secondary-camera supervision.
//!
//! The primary camera runs in-process with the full feature set. Every
//! additional camera runs as an independent encoder instance in a child
//! process, restricted to JPEG/MJPEG output so it never contends for the
//! single hardware H.264 channel. The orchestrator owns those children:
//! spawn, liveness check, restart with backoff, and auto-disable when a
//! camera keeps dying.

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ConfigStore;
use crate::error::Result;
use crate::shutdown::Shutdown;

use super::discovery::CameraDescriptor;

/// Restart budget: more than this many exits inside the window disables
/// the camera instead of retrying forever.
const MAX_RESTARTS_PER_WINDOW: u32 = 5;
const RESTART_WINDOW: Duration = Duration::from_secs(60);
/// Exponential restart delay cap.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(4);
/// Liveness poll interval.
const CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// Grace period between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// One supervised child encoder process.
pub struct ChildCamera {
    pub descriptor: CameraDescriptor,
    child: Option<Child>,
    restart_count: u32,
    window_start: Instant,
    enabled: bool,
}

impl ChildCamera {
    pub fn new(descriptor: CameraDescriptor) -> Self {
        let enabled = descriptor.enabled;
        Self {
            descriptor,
            child: None,
            restart_count: 0,
            window_start: Instant::now(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawn the child with the given command. No-op when already running.
    pub fn start(&mut self, command: &mut Command) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            // Child logs inherit our stderr.
            .spawn()?;
        log::info!(
            "orchestrator: CAM#{} started (pid {})",
            self.descriptor.ordinal,
            child.id()
        );
        self.child = Some(child);
        self.enabled = true;
        Ok(())
    }

    /// Stop the child: graceful signal first, hard kill after the grace
    /// period.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        log::info!(
            "orchestrator: stopping CAM#{} (pid {})",
            self.descriptor.ordinal,
            child.id()
        );

        terminate_gracefully(&mut child);

        let deadline = Instant::now() + STOP_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                _ => break,
            }
        }
        log::warn!("orchestrator: force killing CAM#{}", self.descriptor.ordinal);
        let _ = child.kill();
        let _ = child.wait();
    }

    /// Check liveness; if the child exited, decide between restart (with
    /// backoff) and auto-disable. Returns the restart delay when a restart
    /// is due.
    fn reap(&mut self) -> ChildEvent {
        let Some(child) = self.child.as_mut() else {
            return ChildEvent::NotRunning;
        };
        match child.try_wait() {
            Ok(None) => ChildEvent::Alive,
            Ok(Some(status)) => {
                log::warn!(
                    "orchestrator: CAM#{} exited with {}",
                    self.descriptor.ordinal,
                    status
                );
                self.child = None;

                if self.window_start.elapsed() >= RESTART_WINDOW {
                    self.restart_count = 0;
                    self.window_start = Instant::now();
                }
                if self.restart_count >= MAX_RESTARTS_PER_WINDOW {
                    log::error!(
                        "orchestrator: CAM#{} exceeded restart limit, disabling",
                        self.descriptor.ordinal
                    );
                    self.enabled = false;
                    return ChildEvent::Disabled;
                }

                let delay = Duration::from_secs(1 << self.restart_count.min(2));
                self.restart_count += 1;
                ChildEvent::RestartAfter(delay.min(MAX_RESTART_DELAY))
            }
            Err(_) => {
                self.child = None;
                ChildEvent::NotRunning
            }
        }
    }
}

enum ChildEvent {
    Alive,
    NotRunning,
    Disabled,
    RestartAfter(Duration),
}

#[cfg(target_os = "linux")]
fn terminate_gracefully(child: &mut Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(target_os = "linux"))]
fn terminate_gracefully(child: &mut Child) {
    let _ = child.kill();
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Arc<ConfigStore>,
    shutdown: Shutdown,
    /// The encoder binary to spawn; normally our own executable.
    binary: std::path::PathBuf,
    children: Vec<ChildCamera>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ConfigStore>,
        shutdown: Shutdown,
        binary: std::path::PathBuf,
        secondaries: Vec<CameraDescriptor>,
    ) -> Self {
        let children = secondaries.into_iter().map(ChildCamera::new).collect();
        Self {
            config,
            shutdown,
            binary,
            children,
        }
    }

    /// Secondary instances run with H.264 and the protocol clients off:
    /// JPEG/MJPEG only, their own port, their own device.
    fn secondary_command(&self, descriptor: &CameraDescriptor) -> Command {
        let cfg = self.config.snapshot();
        let fps = if cfg.cameras.secondary_fps > 0 {
            cfg.cameras.secondary_fps
        } else {
            10
        };
        let mut command = Command::new(&self.binary);
        command
            .arg("--secondary")
            .arg("--device")
            .arg(&descriptor.device)
            .arg("--streaming-port")
            .arg(descriptor.streaming_port.to_string())
            .arg("--width")
            .arg("640")
            .arg("--height")
            .arg("480")
            .arg("--fps")
            .arg(fps.to_string())
            .arg("--jpeg-quality")
            .arg(cfg.capture.jpeg_quality.to_string());
        command
    }

    /// Start every enabled secondary.
    pub fn start_enabled(&mut self) {
        let enabled_map = self.config.snapshot().cameras.enabled.clone();
        for index in 0..self.children.len() {
            let descriptor = self.children[index].descriptor.clone();
            let enabled = enabled_map
                .get(&descriptor.unique_id)
                .copied()
                .unwrap_or(descriptor.enabled);
            if enabled {
                let mut command = self.secondary_command(&descriptor);
                if let Err(err) = self.children[index].start(&mut command) {
                    log::warn!(
                        "orchestrator: CAM#{} spawn failed: {}",
                        descriptor.ordinal,
                        err
                    );
                }
            }
        }
    }

    /// Enable a camera by unique id, persisting the flag.
    pub fn enable(&mut self, unique_id: &str) -> Result<()> {
        self.set_enabled(unique_id, true)
    }

    /// Disable a camera by unique id, stopping it and persisting the flag.
    pub fn disable(&mut self, unique_id: &str) -> Result<()> {
        self.set_enabled(unique_id, false)
    }

    fn set_enabled(&mut self, unique_id: &str, enabled: bool) -> Result<()> {
        for index in 0..self.children.len() {
            if self.children[index].descriptor.unique_id != unique_id {
                continue;
            }
            if enabled {
                let descriptor = self.children[index].descriptor.clone();
                let mut command = self.secondary_command(&descriptor);
                self.children[index].start(&mut command)?;
            } else {
                self.children[index].stop();
                self.children[index].enabled = false;
            }
        }
        let id = unique_id.to_string();
        if let Err(err) = self
            .config
            .update(move |cfg| {
                cfg.cameras.enabled.insert(id, enabled);
            })
        {
            log::warn!("orchestrator: persisting enable flag failed: {}", err);
        }
        Ok(())
    }

    /// Supervision loop: poll liveness, restart with backoff, auto-disable
    /// repeat offenders, and persist the disable so it survives restarts.
    pub fn run(&mut self) {
        self.start_enabled();
        while self.shutdown.is_running() {
            self.check_children();
            self.shutdown.sleep(CHECK_INTERVAL);
        }
        self.stop_all();
    }

    /// One supervision pass; public so tests can drive it directly.
    pub fn check_children(&mut self) {
        for index in 0..self.children.len() {
            if !self.children[index].is_enabled() {
                continue;
            }
            match self.children[index].reap() {
                ChildEvent::Alive | ChildEvent::NotRunning => {}
                ChildEvent::Disabled => {
                    let unique_id = self.children[index].descriptor.unique_id.clone();
                    let id = unique_id.clone();
                    if let Err(err) = self.config.update(move |cfg| {
                        cfg.cameras.enabled.insert(id, false);
                    }) {
                        log::warn!("orchestrator: persisting auto-disable failed: {}", err);
                    }
                }
                ChildEvent::RestartAfter(delay) => {
                    log::info!(
                        "orchestrator: restarting CAM#{} in {:?}",
                        self.children[index].descriptor.ordinal,
                        delay
                    );
                    if !self.shutdown.sleep(delay) {
                        return;
                    }
                    let descriptor = self.children[index].descriptor.clone();
                    let mut command = self.secondary_command(&descriptor);
                    if let Err(err) = self.children[index].start(&mut command) {
                        log::warn!(
                            "orchestrator: CAM#{} restart failed: {}",
                            descriptor.ordinal,
                            err
                        );
                    }
                }
            }
        }
    }

    pub fn stop_all(&mut self) {
        for child in &mut self.children {
            child.stop();
        }
    }

    /// (ordinal, enabled, running) triples for the status surface.
    pub fn statuses(&mut self) -> Vec<(u8, bool, bool)> {
        let mut out = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            let running = child.is_running();
            out.push((child.descriptor.ordinal, child.is_enabled(), running));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn descriptor() -> CameraDescriptor {
        CameraDescriptor {
            unique_id: "usb-test-video-index0".to_string(),
            name: "Test".to_string(),
            device: PathBuf::from("/dev/video1"),
            usb_port: "1.1".to_string(),
            ordinal: 2,
            streaming_port: 8082,
            is_primary: false,
            has_mjpeg: true,
            has_yuyv: false,
            width: 640,
            height: 480,
            max_fps: 30,
            enabled: true,
        }
    }

    #[test]
    fn start_and_stop_child() {
        let mut child = ChildCamera::new(descriptor());
        assert!(!child.is_running());

        let mut command = Command::new("sleep");
        command.arg("30");
        child.start(&mut command).unwrap();
        assert!(child.is_running());

        child.stop();
        assert!(!child.is_running());
    }

    #[test]
    fn dead_child_requests_restart_with_growing_backoff() {
        let mut child = ChildCamera::new(descriptor());

        let mut delays = Vec::new();
        for _ in 0..3 {
            let mut command = Command::new("true"); // exits immediately
            child.start(&mut command).unwrap();
            // Wait for the child to exit.
            std::thread::sleep(Duration::from_millis(50));
            match child.reap() {
                ChildEvent::RestartAfter(delay) => delays.push(delay),
                _ => panic!("expected restart request"),
            }
        }
        assert_eq!(delays[0], Duration::from_secs(1));
        assert!(delays[1] >= delays[0]);
        assert!(delays[2] <= MAX_RESTART_DELAY);
    }

    #[test]
    fn repeated_deaths_disable_the_camera() {
        let mut child = ChildCamera::new(descriptor());
        let mut disabled = false;

        for _ in 0..(MAX_RESTARTS_PER_WINDOW + 1) {
            let mut command = Command::new("true");
            child.start(&mut command).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            match child.reap() {
                ChildEvent::RestartAfter(_) => {}
                ChildEvent::Disabled => {
                    disabled = true;
                    break;
                }
                _ => panic!("unexpected child event"),
            }
        }
        assert!(disabled, "camera must auto-disable after repeated failures");
        assert!(!child.is_enabled());
    }
}
