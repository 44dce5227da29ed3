//! Print-status feed behavior: a simulated subscription feed drives the
//! timelapse engine through a full print, a cancellation, and an interval
//! (hyperlapse) session.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use printcam::capture::venc::{EncoderHub, StubEncoder};
use printcam::clients::moonraker::PrintTracker;
use printcam::config::{AppConfig, ConfigStore};
use printcam::frame::CameraSlots;
use printcam::timelapse::TimelapseEngine;
use printcam::Shutdown;

struct Fixture {
    tracker: PrintTracker,
    engine: Arc<TimelapseEngine>,
    out_dir: PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture(mode: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().join("out");

    let mut cfg = AppConfig::default();
    cfg.timelapse.mode = mode.to_string();
    cfg.timelapse.hyperlapse_interval = 1;
    cfg.timelapse.output_dir = out_dir.to_string_lossy().into_owned();
    cfg.timelapse.temp_dir = dir.path().join("frames").to_string_lossy().into_owned();
    let config = Arc::new(ConfigStore::new(cfg));

    let slots = Arc::new(CameraSlots::new());
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend(std::iter::repeat(0x33).take(1500));
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    slots.jpeg.publish(&jpeg, 0, true);

    let engine = Arc::new(TimelapseEngine::new(
        slots,
        EncoderHub::new(Box::new(StubEncoder::new())),
        Arc::new(AtomicBool::new(false)),
    ));
    // The subscription client owns the engine while connected.
    engine.set_custom_mode(true);

    let tracker = PrintTracker::new(engine.clone(), config, Shutdown::new());
    Fixture {
        tracker,
        engine,
        out_dir,
        _dir: dir,
    }
}

fn status_update(status: serde_json::Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "notify_status_update",
        "params": [status, 123.45],
    })
    .to_string()
}

fn mp4_files(dir: &PathBuf) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(".mp4"))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn layer_feed_captures_once_per_layer_and_finalizes_once() {
    let mut fx = fixture("layer");

    fx.tracker.process_message(&status_update(serde_json::json!({
        "print_stats": { "state": "printing", "filename": "/gcodes/benchy.gcode" }
    })));
    assert!(fx.engine.is_active());
    assert_eq!(fx.engine.frame_count(), 0);

    fx.tracker.process_message(&status_update(serde_json::json!({
        "virtual_sdcard": { "current_layer": 1, "total_layer": 2 }
    })));
    assert_eq!(fx.engine.frame_count(), 1);

    fx.tracker.process_message(&status_update(serde_json::json!({
        "virtual_sdcard": { "current_layer": 2, "total_layer": 2 }
    })));
    assert_eq!(fx.engine.frame_count(), 2);

    fx.tracker.process_message(&status_update(serde_json::json!({
        "print_stats": { "state": "complete" }
    })));

    // Exactly 2 captures and exactly one finalize.
    assert!(!fx.engine.is_active());
    assert_eq!(mp4_files(&fx.out_dir), vec!["benchy_01.mp4".to_string()]);
    assert!(fx.out_dir.join("benchy_01_2.jpg").exists());
}

#[test]
fn duplicate_layer_notifications_do_not_duplicate_captures() {
    let mut fx = fixture("layer");

    fx.tracker.process_message(&status_update(serde_json::json!({
        "print_stats": { "state": "printing", "filename": "cube.gcode" }
    })));
    for _ in 0..3 {
        fx.tracker.process_message(&status_update(serde_json::json!({
            "virtual_sdcard": { "current_layer": 1 }
        })));
    }
    assert_eq!(fx.engine.frame_count(), 1, "layer 1 captures exactly once");

    for _ in 0..3 {
        fx.tracker.process_message(&status_update(serde_json::json!({
            "virtual_sdcard": { "current_layer": 2 }
        })));
    }
    assert_eq!(fx.engine.frame_count(), 2, "unchanged layer is not a change");
}

#[test]
fn cancelled_print_still_assembles_partial_frames() {
    let mut fx = fixture("layer");

    fx.tracker.process_message(&status_update(serde_json::json!({
        "print_stats": { "state": "printing", "filename": "aborted.gcode" }
    })));
    fx.tracker.process_message(&status_update(serde_json::json!({
        "virtual_sdcard": { "current_layer": 1 }
    })));
    assert_eq!(fx.engine.frame_count(), 1);

    fx.tracker.process_message(&status_update(serde_json::json!({
        "print_stats": { "state": "cancelled" }
    })));

    // Partial timelapse is more useful than none.
    assert!(!fx.engine.is_active());
    assert_eq!(mp4_files(&fx.out_dir), vec!["aborted_01.mp4".to_string()]);
}

#[test]
fn cancelled_print_with_no_frames_produces_nothing() {
    let mut fx = fixture("layer");

    fx.tracker.process_message(&status_update(serde_json::json!({
        "print_stats": { "state": "printing", "filename": "instant.gcode" }
    })));
    fx.tracker.process_message(&status_update(serde_json::json!({
        "print_stats": { "state": "cancelled" }
    })));

    assert!(!fx.engine.is_active());
    assert!(mp4_files(&fx.out_dir).is_empty());
}

#[test]
fn subscription_response_initial_state_is_processed() {
    let mut fx = fixture("layer");

    // The subscribe call's result carries the initial full state.
    let response = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "status": {
                "print_stats": { "state": "printing", "filename": "late_join.gcode" }
            }
        }
    })
    .to_string();
    fx.tracker.process_message(&response);
    assert!(fx.engine.is_active(), "late join must start a session");
    fx.engine.cancel();
}

#[test]
fn hyperlapse_mode_captures_on_interval_not_layers() {
    let mut fx = fixture("hyperlapse");

    fx.tracker.process_message(&status_update(serde_json::json!({
        "print_stats": { "state": "printing", "filename": "tall.gcode" }
    })));
    fx.tracker.process_message(&status_update(serde_json::json!({
        "virtual_sdcard": { "current_layer": 1 }
    })));
    // First layer always captures and arms the interval timer.
    assert_eq!(fx.engine.frame_count(), 1);

    // Further layer changes do not capture in hyperlapse mode.
    fx.tracker.process_message(&status_update(serde_json::json!({
        "virtual_sdcard": { "current_layer": 2 }
    })));
    assert_eq!(fx.engine.frame_count(), 1);

    // The one-second interval timer fires at least once.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while fx.engine.frame_count() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    assert!(fx.engine.frame_count() >= 2, "interval capture must fire");

    fx.tracker.process_message(&status_update(serde_json::json!({
        "print_stats": { "state": "complete" }
    })));
    assert!(!fx.engine.is_active());
    assert_eq!(mp4_files(&fx.out_dir).len(), 1);
}
