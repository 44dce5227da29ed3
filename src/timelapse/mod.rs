//! Timelapse recording engine.
//!
//! State machine: Idle -> Active -> Finalizing -> Idle, with
//! Active -> Cancelling -> Idle on abort. Frames accumulate as individual
//! JPEG files in a private temp directory and are assembled into one video
//! plus one thumbnail on finalize.
//!
//! The engine is mutated concurrently by two protocol clients (the legacy
//! RPC path and the print-status path), so every state transition happens
//! under one internal lock. The print-status path owns "custom mode": while
//! it is set, legacy triggers are acknowledged but ignored.

pub mod assemble;
pub mod naming;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::capture::venc::{AssembleRequest, EncoderHub};
use crate::config::TimelapseSettings;
use crate::error::{Error, Result};
use crate::frame::CameraSlots;

/// How long a triggered capture waits for the pipeline to produce a frame
/// after waking an idle camera.
const CAPTURE_WAIT: Duration = Duration::from_secs(2);

/// Capture strategy for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    /// Capture on every layer change.
    Layer,
    /// Capture on a fixed wall-clock interval.
    Hyperlapse,
}

/// Output-shaping parameters fixed at session start.
#[derive(Clone, Debug)]
pub struct SessionParams {
    pub mode: CaptureMode,
    pub interval_secs: u32,
    pub output_fps: u32,
    pub variable_fps: bool,
    pub target_length: u32,
    pub fps_min: u32,
    pub fps_max: u32,
    pub crf: u32,
    pub duplicate_last_frame: u32,
    pub flip_x: bool,
    pub flip_y: bool,
    pub keep_partial: bool,
}

impl SessionParams {
    pub fn from_settings(settings: &TimelapseSettings) -> Self {
        Self {
            mode: if settings.mode == "hyperlapse" {
                CaptureMode::Hyperlapse
            } else {
                CaptureMode::Layer
            },
            interval_secs: settings.hyperlapse_interval.max(1),
            output_fps: settings.output_fps.clamp(1, 120),
            variable_fps: settings.variable_fps,
            target_length: settings.target_length.max(1),
            fps_min: settings.variable_fps_min.max(1),
            fps_max: settings.variable_fps_max.max(1),
            crf: settings.crf.min(51),
            duplicate_last_frame: settings.duplicate_last_frame.min(60),
            flip_x: settings.flip_x,
            flip_y: settings.flip_y,
            keep_partial: settings.keep_partial,
        }
    }
}

struct Session {
    job_name: String,
    sequence: u32,
    frame_count: u32,
    temp_dir: PathBuf,
    output_dir: PathBuf,
    params: SessionParams,
}

enum EngineState {
    Idle,
    Active(Session),
    Finalizing,
}

/// Result of a completed finalize.
#[derive(Debug)]
pub struct TimelapseOutput {
    pub video: PathBuf,
    pub thumbnail: PathBuf,
    pub frame_count: u32,
}

pub struct TimelapseEngine {
    state: Mutex<EngineState>,
    custom_mode: AtomicBool,
    slots: Arc<CameraSlots>,
    hub: EncoderHub,
    /// Keeps the capture pipeline awake while a session runs.
    wake: Arc<AtomicBool>,
}

impl TimelapseEngine {
    pub fn new(slots: Arc<CameraSlots>, hub: EncoderHub, wake: Arc<AtomicBool>) -> Self {
        Self {
            state: Mutex::new(EngineState::Idle),
            custom_mode: AtomicBool::new(false),
            slots,
            hub,
            wake,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            EngineState::Active(_)
        )
    }

    pub fn frame_count(&self) -> u32 {
        match &*self.state.lock().unwrap_or_else(|e| e.into_inner()) {
            EngineState::Active(session) => session.frame_count,
            _ => 0,
        }
    }

    pub fn set_custom_mode(&self, enabled: bool) {
        self.custom_mode.store(enabled, Ordering::SeqCst);
        log::info!(
            "timelapse: custom mode {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_custom_mode(&self) -> bool {
        self.custom_mode.load(Ordering::SeqCst)
    }

    /// Release custom mode unless a session is still running. Used when the
    /// print-status connection drops: the session must survive the socket.
    pub fn release_custom_mode_if_idle(&self) {
        if !self.is_active() && self.is_custom_mode() {
            self.set_custom_mode(false);
        }
    }

    /// Start a session. Fails with `AlreadyActive` when one exists and with
    /// `Validation` (creating no state at all) for a bad job name.
    pub fn begin(
        &self,
        job_name: &str,
        output_dir: &Path,
        temp_base: &Path,
        params: SessionParams,
    ) -> Result<()> {
        naming::sanitize_job_name(job_name)?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            EngineState::Idle => {}
            _ => return Err(Error::AlreadyActive),
        }

        let sequence = naming::next_sequence(output_dir, job_name);
        let temp_dir = temp_base.with_file_name(format!(
            "{}_{}",
            temp_base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "timelapse_frames".to_string()),
            std::process::id()
        ));
        std::fs::create_dir_all(&temp_dir)?;
        if let Err(err) = std::fs::create_dir_all(output_dir) {
            let _ = std::fs::remove_dir_all(&temp_dir);
            return Err(err.into());
        }

        log::info!(
            "timelapse: started {} (seq {:02}), frames -> {}, output -> {}",
            job_name,
            sequence,
            temp_dir.display(),
            output_dir.display()
        );
        *state = EngineState::Active(Session {
            job_name: job_name.to_string(),
            sequence,
            frame_count: 0,
            temp_dir,
            output_dir: output_dir.to_path_buf(),
            params,
        });
        self.wake.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Legacy RPC entry point, driven by a job-file path. Ignored (but
    /// reported as success) while custom mode is active; an existing legacy
    /// session is cancelled and replaced.
    pub fn begin_legacy(
        &self,
        job_filepath: &str,
        output_dir: &Path,
        temp_base: &Path,
        params: SessionParams,
    ) -> Result<()> {
        if self.is_custom_mode() {
            log::info!("timelapse: ignoring legacy start, custom mode active");
            return Ok(());
        }
        let name = naming::job_name_from_path(job_filepath)?;
        if self.is_active() {
            log::info!("timelapse: cancelling existing session for new legacy start");
            self.cancel();
        }
        self.begin(&name, output_dir, temp_base, params)
    }

    /// Persist the current JPEG frame as the next indexed capture.
    /// No-op success when Idle; a triggered capture on an active session is
    /// never silently dropped.
    pub fn capture_frame(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let session = match &mut *state {
            EngineState::Active(session) => session,
            _ => return Ok(()),
        };

        let frame = match self.slots.jpeg.latest() {
            Some(frame) => frame,
            None => self
                .slots
                .jpeg
                .wait_newer(0, CAPTURE_WAIT)
                .ok_or_else(|| Error::Device("no frame data available".to_string()))?,
        };

        let path = session.temp_dir.join(naming::frame_name(session.frame_count));
        std::fs::write(&path, &frame.data)?;
        session.frame_count += 1;
        log::debug!(
            "timelapse: captured frame {} ({} bytes)",
            session.frame_count,
            frame.data.len()
        );
        Ok(())
    }

    /// Assemble and emit the output. Zero captured frames discard the
    /// session as a no-op; assembly failure drops the session with an error
    /// and leaves no output file behind.
    pub fn finalize(&self) -> Result<Option<TimelapseOutput>> {
        let session = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, EngineState::Finalizing) {
                EngineState::Active(session) => session,
                other => {
                    *state = other;
                    log::info!("timelapse: finalize with no active session");
                    return Ok(None);
                }
            }
        };

        let result = self.finish(session);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = EngineState::Idle;
        self.wake.store(false, Ordering::SeqCst);
        result
    }

    /// Abort the session. Partial results are assembled when the session
    /// was configured to keep them and any frames exist.
    pub fn cancel(&self) {
        let session = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, EngineState::Finalizing) {
                EngineState::Active(session) => session,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        log::info!(
            "timelapse: cancelling {} ({} frames)",
            session.job_name,
            session.frame_count
        );
        if session.params.keep_partial && session.frame_count > 0 {
            if let Err(err) = self.finish(session) {
                log::warn!("timelapse: partial assembly failed: {}", err);
            }
        } else {
            purge_temp(&session.temp_dir);
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = EngineState::Idle;
        self.wake.store(false, Ordering::SeqCst);
    }

    fn finish(&self, mut session: Session) -> Result<Option<TimelapseOutput>> {
        if session.frame_count == 0 {
            log::info!("timelapse: no frames captured, discarding session");
            purge_temp(&session.temp_dir);
            return Ok(None);
        }

        self.duplicate_last_frame(&mut session);

        let fps = output_fps(&session);
        let video = session
            .output_dir
            .join(naming::video_name(&session.job_name, session.sequence));
        let thumbnail = session.output_dir.join(naming::thumbnail_name(
            &session.job_name,
            session.sequence,
            session.frame_count,
        ));

        log::info!(
            "timelapse: finalizing {} frames at {} fps -> {}",
            session.frame_count,
            fps,
            video.display()
        );

        let request = AssembleRequest {
            frames_dir: session.temp_dir.clone(),
            frame_count: session.frame_count,
            fps,
            crf: session.params.crf,
            flip_x: session.params.flip_x,
            flip_y: session.params.flip_y,
            output: video.clone(),
        };

        if let Err(err) = self.assemble(&request) {
            // Drop the session cleanly: no temp frames, no stray output.
            let _ = std::fs::remove_file(&video);
            purge_temp(&session.temp_dir);
            log::error!("timelapse: assembly failed, session dropped: {}", err);
            return Err(err);
        }

        let last_frame = session
            .temp_dir
            .join(naming::frame_name(session.frame_count - 1));
        if let Err(err) = std::fs::copy(&last_frame, &thumbnail) {
            log::warn!("timelapse: thumbnail copy failed: {}", err);
        }

        purge_temp(&session.temp_dir);
        log::info!("timelapse: created {}", video.display());
        Ok(Some(TimelapseOutput {
            video,
            thumbnail,
            frame_count: session.frame_count,
        }))
    }

    /// Hardware assembly when the H.264 channel is free, otherwise the
    /// external-encoder fallback.
    fn assemble(&self, request: &AssembleRequest) -> Result<()> {
        match self.hub.acquire_h264("timelapse") {
            Ok(lease) => match lease.assemble(request) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!("timelapse: hardware assembly failed: {}", err);
                }
            },
            Err(Error::ResourceConflict(_)) => {
                log::info!("timelapse: h264 channel busy, using software assembly");
            }
            Err(err) => {
                log::warn!("timelapse: h264 channel unavailable: {}", err);
            }
        }
        assemble::assemble_software(request, assemble::ASSEMBLY_BUDGET)
    }

    fn duplicate_last_frame(&self, session: &mut Session) {
        let extra = session.params.duplicate_last_frame;
        if extra == 0 || session.frame_count == 0 {
            return;
        }
        let last = session
            .temp_dir
            .join(naming::frame_name(session.frame_count - 1));
        for i in 0..extra {
            let dup = session
                .temp_dir
                .join(naming::frame_name(session.frame_count + i));
            if let Err(err) = std::fs::copy(&last, &dup) {
                log::warn!("timelapse: duplicate frame copy failed: {}", err);
                return;
            }
        }
        session.frame_count += extra;
        log::info!(
            "timelapse: duplicated last frame {} times ({} total)",
            extra,
            session.frame_count
        );
    }
}

fn output_fps(session: &Session) -> u32 {
    if !session.params.variable_fps {
        return session.params.output_fps;
    }
    let fps = session.frame_count / session.params.target_length.max(1);
    fps.clamp(session.params.fps_min, session.params.fps_max)
}

fn purge_temp(temp_dir: &Path) {
    if let Err(err) = std::fs::remove_dir_all(temp_dir) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("timelapse: temp cleanup failed for {}: {}", temp_dir.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::venc::StubEncoder;

    fn engine() -> (TimelapseEngine, Arc<CameraSlots>, tempfile::TempDir) {
        let slots = Arc::new(CameraSlots::new());
        let hub = EncoderHub::new(Box::new(StubEncoder::new()));
        let wake = Arc::new(AtomicBool::new(false));
        let dir = tempfile::tempdir().unwrap();
        (TimelapseEngine::new(slots.clone(), hub, wake), slots, dir)
    }

    fn params() -> SessionParams {
        SessionParams::from_settings(&TimelapseSettings::default())
    }

    #[test]
    fn variable_fps_is_clamped() {
        let mut settings = TimelapseSettings::default();
        settings.variable_fps = true;
        settings.target_length = 10;
        settings.variable_fps_min = 5;
        settings.variable_fps_max = 60;

        let session = Session {
            job_name: "x".to_string(),
            sequence: 1,
            frame_count: 1200,
            temp_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            params: SessionParams::from_settings(&settings),
        };
        // 1200 frames / 10 s = 120 fps, clamped to 60.
        assert_eq!(output_fps(&session), 60);
    }

    #[test]
    fn begin_twice_is_already_active() {
        let (engine, _slots, dir) = engine();
        let out = dir.path().join("out");
        let tmp = dir.path().join("frames");
        engine.begin("job", &out, &tmp, params()).unwrap();
        match engine.begin("job", &out, &tmp, params()) {
            Err(Error::AlreadyActive) => {}
            other => panic!("expected AlreadyActive, got {:?}", other),
        }
        engine.cancel();
    }

    #[test]
    fn capture_when_idle_is_noop_success() {
        let (engine, _slots, _dir) = engine();
        engine.capture_frame().unwrap();
        assert_eq!(engine.frame_count(), 0);
    }

    #[test]
    fn wake_flag_tracks_session_lifetime() {
        let (engine, slots, dir) = engine();
        let wake = engine.wake.clone();
        slots.jpeg.publish(&[0xFF, 0xD8, 0x01, 0xFF, 0xD9], 0, true);

        assert!(!wake.load(Ordering::SeqCst));
        engine
            .begin("job", &dir.path().join("out"), &dir.path().join("t"), params())
            .unwrap();
        assert!(wake.load(Ordering::SeqCst));
        engine.capture_frame().unwrap();
        engine.finalize().unwrap();
        assert!(!wake.load(Ordering::SeqCst));
    }
}
