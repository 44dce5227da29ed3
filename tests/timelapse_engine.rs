//! Timelapse engine behavior: deterministic outputs, the zero-frame no-op,
//! the job-name validation boundary, and custom-mode precedence.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use printcam::capture::venc::{EncoderHub, StubEncoder};
use printcam::config::TimelapseSettings;
use printcam::frame::CameraSlots;
use printcam::timelapse::{SessionParams, TimelapseEngine};
use printcam::Error;

struct Fixture {
    engine: TimelapseEngine,
    out_dir: PathBuf,
    temp_base: PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    fixture_with_encoder(StubEncoder::new())
}

fn fixture_with_encoder(encoder: StubEncoder) -> Fixture {
    let slots = Arc::new(CameraSlots::new());
    // A frame must exist for capture_frame to persist.
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend(std::iter::repeat(0xAB).take(2000));
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    slots.jpeg.publish(&jpeg, 0, true);

    let hub = EncoderHub::new(Box::new(encoder));
    let wake = Arc::new(AtomicBool::new(false));
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().join("output");
    let temp_base = dir.path().join("work").join("frames");
    std::fs::create_dir_all(dir.path().join("work")).unwrap();

    Fixture {
        engine: TimelapseEngine::new(slots, hub, wake),
        out_dir,
        temp_base,
        _dir: dir,
    }
}

fn params() -> SessionParams {
    SessionParams::from_settings(&TimelapseSettings::default())
}

fn mp4_files(dir: &PathBuf) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(".mp4"))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[test]
fn finalize_produces_exactly_one_video_and_one_thumbnail() {
    let fx = fixture();
    fx.engine
        .begin("benchy", &fx.out_dir, &fx.temp_base, params())
        .unwrap();
    for _ in 0..3 {
        fx.engine.capture_frame().unwrap();
    }
    let output = fx.engine.finalize().unwrap().expect("output expected");

    assert_eq!(output.frame_count, 3);
    assert_eq!(output.video, fx.out_dir.join("benchy_01.mp4"));
    assert_eq!(output.thumbnail, fx.out_dir.join("benchy_01_3.jpg"));
    assert!(output.video.exists());
    assert!(output.thumbnail.exists());
    assert_eq!(mp4_files(&fx.out_dir).len(), 1);
    assert!(!fx.engine.is_active());
}

#[test]
fn repeated_jobs_get_distinct_sequence_numbers() {
    let fx = fixture();
    for expected in ["benchy_01.mp4", "benchy_02.mp4"] {
        fx.engine
            .begin("benchy", &fx.out_dir, &fx.temp_base, params())
            .unwrap();
        fx.engine.capture_frame().unwrap();
        let output = fx.engine.finalize().unwrap().unwrap();
        assert_eq!(output.video.file_name().unwrap().to_str().unwrap(), expected);
    }
    assert_eq!(mp4_files(&fx.out_dir).len(), 2);
}

#[test]
fn finalize_with_zero_frames_discards_quietly() {
    let fx = fixture();
    fx.engine
        .begin("empty", &fx.out_dir, &fx.temp_base, params())
        .unwrap();
    let output = fx.engine.finalize().unwrap();

    assert!(output.is_none());
    assert!(mp4_files(&fx.out_dir).is_empty());
    assert!(!fx.engine.is_active());
    // Back to Idle: a new session can begin.
    fx.engine
        .begin("empty", &fx.out_dir, &fx.temp_base, params())
        .unwrap();
    fx.engine.cancel();
}

#[test]
fn traversal_job_names_are_rejected_without_side_effects() {
    let fx = fixture();
    for bad in ["../escape", "a/b", "a\\b", "dots..name", "job;rm"] {
        match fx.engine.begin(bad, &fx.out_dir, &fx.temp_base, params()) {
            Err(Error::Validation(_)) => {}
            other => panic!("{:?} accepted for {:?}", other, bad),
        }
        assert!(!fx.engine.is_active());
    }
    // No temp or output state may exist after rejected begins.
    assert!(!fx.out_dir.exists());
    let work_dir = fx.temp_base.parent().unwrap();
    assert_eq!(std::fs::read_dir(work_dir).unwrap().count(), 0);
}

#[test]
fn legacy_trigger_is_ignored_while_custom_mode_owns_the_session() {
    let fx = fixture();
    fx.engine.set_custom_mode(true);
    fx.engine
        .begin("status_driven", &fx.out_dir, &fx.temp_base, params())
        .unwrap();
    fx.engine.capture_frame().unwrap();

    // Acknowledged but ignored: no new session, no mutation.
    fx.engine
        .begin_legacy(
            "/gcodes/rpc_driven.gcode",
            &fx.out_dir,
            &fx.temp_base,
            params(),
        )
        .unwrap();
    assert_eq!(fx.engine.frame_count(), 1);

    fx.engine.capture_frame().unwrap();
    let output = fx.engine.finalize().unwrap().unwrap();
    assert_eq!(output.video, fx.out_dir.join("status_driven_01.mp4"));
    assert_eq!(mp4_files(&fx.out_dir), vec!["status_driven_01.mp4"]);
}

#[test]
fn legacy_trigger_replaces_a_legacy_session() {
    let fx = fixture();
    fx.engine
        .begin_legacy("/gcodes/first.gcode", &fx.out_dir, &fx.temp_base, params())
        .unwrap();
    fx.engine.capture_frame().unwrap();

    // Without custom mode the new legacy start supersedes the old session.
    fx.engine
        .begin_legacy("/gcodes/second.gcode", &fx.out_dir, &fx.temp_base, params())
        .unwrap();
    assert_eq!(fx.engine.frame_count(), 0);
    fx.engine.capture_frame().unwrap();
    let output = fx.engine.finalize().unwrap().unwrap();
    assert!(output
        .video
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("second_"));
}

#[test]
fn failed_assembly_drops_the_session_and_leaves_no_output() {
    let mut encoder = StubEncoder::new();
    encoder.fail_assembly = true;
    let fx = fixture_with_encoder(encoder);

    fx.engine
        .begin("doomed", &fx.out_dir, &fx.temp_base, params())
        .unwrap();
    fx.engine.capture_frame().unwrap();

    // Hardware path is forced to fail; the software fallback cannot encode
    // the synthetic frames either, so the session must be dropped cleanly.
    match fx.engine.finalize() {
        Err(Error::Encode(_)) => {}
        other => panic!("expected encode failure, got {:?}", other),
    }
    assert!(mp4_files(&fx.out_dir).is_empty());
    assert!(!fx.engine.is_active());
    let work_dir = fx.temp_base.parent().unwrap();
    assert_eq!(
        std::fs::read_dir(work_dir).unwrap().count(),
        0,
        "temp frames must be purged"
    );
}

#[test]
fn duplicate_last_frame_extends_the_sequence() {
    let mut settings = TimelapseSettings::default();
    settings.duplicate_last_frame = 4;
    let fx = fixture();
    fx.engine
        .begin(
            "held",
            &fx.out_dir,
            &fx.temp_base,
            SessionParams::from_settings(&settings),
        )
        .unwrap();
    fx.engine.capture_frame().unwrap();
    fx.engine.capture_frame().unwrap();

    let output = fx.engine.finalize().unwrap().unwrap();
    assert_eq!(output.frame_count, 6);
    assert_eq!(output.thumbnail, fx.out_dir.join("held_01_6.jpg"));
}
