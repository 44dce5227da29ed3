//! Software assembly fallback via the external encoder.
//!
//! The hardware path (through the encoder hub) is tried first by the engine;
//! this module shells out to ffmpeg when the hardware path is unavailable or
//! failed. The child gets a bounded wall-clock budget: exceeding it kills
//! the process and reports an encode failure rather than leaving a session
//! half-finalized.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::capture::venc::AssembleRequest;
use crate::error::{Error, Result};

/// Wall-clock budget for one external encoder invocation.
pub const ASSEMBLY_BUDGET: Duration = Duration::from_secs(120);

const FFMPEG_BIN: &str = "ffmpeg";

/// Assemble with the external encoder: x264 first, then the cheaper mpeg4
/// codec as a second attempt (the x264 encode can OOM on small devices).
pub fn assemble_software(request: &AssembleRequest, budget: Duration) -> Result<()> {
    match run_ffmpeg(request, Codec::X264, budget) {
        Ok(()) => Ok(()),
        Err(err) => {
            log::warn!("timelapse: x264 assembly failed ({}), trying mpeg4", err);
            run_ffmpeg(request, Codec::Mpeg4, budget)
        }
    }
}

enum Codec {
    X264,
    Mpeg4,
}

fn run_ffmpeg(request: &AssembleRequest, codec: Codec, budget: Duration) -> Result<()> {
    let pattern = request.frames_dir.join("frame_%04d.jpg");
    let mut cmd = Command::new(FFMPEG_BIN);
    cmd.arg("-y")
        .arg("-framerate")
        .arg(request.fps.to_string())
        .arg("-i")
        .arg(&pattern);

    if let Some(filter) = flip_filter(request.flip_x, request.flip_y) {
        cmd.arg("-vf").arg(filter);
    }

    match codec {
        Codec::X264 => {
            cmd.arg("-c:v")
                .arg("libx264")
                .arg("-preset")
                .arg("ultrafast")
                .arg("-tune")
                .arg("zerolatency")
                .arg("-x264-params")
                .arg("keyint=30:min-keyint=10:scenecut=0:bframes=0:ref=1:rc-lookahead=0:threads=1")
                .arg("-crf")
                .arg(request.crf.to_string())
                .arg("-pix_fmt")
                .arg("yuv420p");
        }
        Codec::Mpeg4 => {
            cmd.arg("-c:v").arg("mpeg4").arg("-q:v").arg("5");
        }
    }

    cmd.arg(&request.output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let child = cmd
        .spawn()
        .map_err(|e| Error::Encode(format!("spawn {}: {}", FFMPEG_BIN, e)))?;
    wait_with_budget(child, budget, &request.output)
}

fn flip_filter(flip_x: bool, flip_y: bool) -> Option<&'static str> {
    match (flip_x, flip_y) {
        (true, true) => Some("hflip,vflip"),
        (true, false) => Some("hflip"),
        (false, true) => Some("vflip"),
        (false, false) => None,
    }
}

fn wait_with_budget(mut child: Child, budget: Duration, output: &Path) -> Result<()> {
    let deadline = Instant::now() + budget;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    return Ok(());
                }
                return Err(Error::Encode(format!(
                    "external encoder exited with {} for {}",
                    status,
                    output.display()
                )));
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Encode(format!(
                        "external encoder exceeded {}s budget for {}",
                        budget.as_secs(),
                        output.display()
                    )));
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(err) => {
                let _ = child.kill();
                return Err(Error::Encode(format!("wait for external encoder: {}", err)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_filters_cover_all_combinations() {
        assert_eq!(flip_filter(false, false), None);
        assert_eq!(flip_filter(true, false), Some("hflip"));
        assert_eq!(flip_filter(false, true), Some("vflip"));
        assert_eq!(flip_filter(true, true), Some("hflip,vflip"));
    }

    #[test]
    fn budget_kills_runaway_child() {
        // A child that never exits on its own.
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let started = Instant::now();
        let result = wait_with_budget(child, Duration::from_millis(300), Path::new("out.mp4"));
        assert!(matches!(result, Err(Error::Encode(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
