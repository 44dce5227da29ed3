//! printcamd - the camera service daemon.
//!
//! Primary mode owns the full pipeline: discovery, the in-process capture
//! driver for the primary camera, stream servers, the three protocol
//! clients, the timelapse engine, the rate controller, and supervision of
//! one child instance per secondary camera.
//!
//! Secondary mode (`--secondary`) is what those children run: one capture
//! driver and one MJPEG server for one camera, nothing else.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use printcam::cameras::{discover, Orchestrator, SystemEnumerator};
use printcam::capture::device::{CaptureFormat, DeviceConfig};
use printcam::capture::venc::{EncoderHub, StubEncoder};
use printcam::capture::{CameraHealth, CaptureDriver, DriverConfig};
use printcam::clients::control::ControlClient;
use printcam::clients::moonraker::MoonrakerClient;
use printcam::clients::rpc::RpcClient;
use printcam::clients::ClientStatus;
use printcam::config::ConfigStore;
use printcam::frame::CameraSlots;
use printcam::rate::{AutoSkip, CpuMonitor, RateHandle};
use printcam::stream::{spawn_flv_server, spawn_mjpeg_server, ClientCounts, StreamInfo};
use printcam::timelapse::TimelapseEngine;
use printcam::Shutdown;

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera streaming and timelapse service")]
struct Args {
    /// Path to the JSON configuration document.
    #[arg(long, env = "PRINTCAM_CONFIG", default_value = "/etc/printcam.json")]
    config: PathBuf,

    /// Run as a secondary encoder instance (spawned by the primary).
    #[arg(long)]
    secondary: bool,

    /// Capture device path override.
    #[arg(long)]
    device: Option<String>,

    /// MJPEG streaming port override.
    #[arg(long)]
    streaming_port: Option<u16>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    #[arg(long)]
    jpeg_quality: Option<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let shutdown = Shutdown::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        handler_shutdown.trigger();
    })
    .context("install signal handler")?;

    if args.secondary {
        run_secondary(args, shutdown)
    } else {
        run_primary(args, shutdown)
    }
}

/// Pick the encoder backend. The SoC integration implements `VideoEncoder`
/// against the vendor block; the software stand-in keeps every other
/// platform (and the test suite) serviceable.
fn encoder_hub() -> EncoderHub {
    EncoderHub::new(Box::new(StubEncoder::new()))
}

fn run_primary(args: Args, shutdown: Shutdown) -> Result<()> {
    log::info!("printcamd {} starting", env!("CARGO_PKG_VERSION"));
    let config = Arc::new(ConfigStore::open(&args.config)?);
    let cfg = config.snapshot();

    // Camera discovery: primary first, ordinals and ports assigned.
    let cameras = discover(
        &SystemEnumerator,
        &cfg.cameras.internal_usb_port,
        cfg.streaming_port,
    );
    let primary = cameras.iter().find(|c| c.is_primary).cloned();
    let secondaries: Vec<_> = cameras.into_iter().filter(|c| !c.is_primary).collect();

    let hub = encoder_hub();
    let slots = Arc::new(CameraSlots::new());
    let counts = Arc::new(ClientCounts::new());
    let rate = RateHandle::new(cfg.rate.skip_ratio);
    let paused = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(AtomicBool::new(false));
    let health = Arc::new(CameraHealth::new());

    // Resolve the primary capture device: explicit config wins, then
    // discovery, then the conventional first node.
    let device_path = if let Some(device) = &args.device {
        device.clone()
    } else if !cfg.capture.device.is_empty() {
        cfg.capture.device.clone()
    } else if let Some(primary) = &primary {
        primary.device.to_string_lossy().into_owned()
    } else {
        "/dev/video0".to_string()
    };
    let format = match cfg.capture.format.as_str() {
        "yuyv" => CaptureFormat::Yuyv,
        "mjpeg" => CaptureFormat::Mjpeg,
        _ => match &primary {
            Some(p) if !p.has_mjpeg && p.has_yuyv => CaptureFormat::Yuyv,
            _ => CaptureFormat::Mjpeg,
        },
    };

    let driver_config = DriverConfig {
        device: DeviceConfig {
            path: device_path,
            width: cfg.capture.width,
            height: cfg.capture.height,
            fps: cfg.capture.target_fps,
            format,
        },
        target_fps: cfg.capture.target_fps,
        jpeg_quality: cfg.capture.jpeg_quality,
        h264_enabled: cfg.capture.h264_enabled,
    };

    // Stream servers.
    spawn_mjpeg_server(
        cfg.streaming_port,
        slots.clone(),
        counts.clone(),
        shutdown.clone(),
    )?;
    if cfg.capture.h264_enabled {
        spawn_flv_server(
            cfg.flv_port,
            slots.clone(),
            counts.clone(),
            StreamInfo {
                width: cfg.capture.width,
                height: cfg.capture.height,
                fps: cfg.capture.target_fps,
            },
            shutdown.clone(),
        )?;
    }

    // Timelapse engine, shared by the RPC and print-status clients.
    let engine = Arc::new(TimelapseEngine::new(
        slots.clone(),
        hub.clone(),
        wake.clone(),
    ));

    let mut threads = Vec::new();

    // Capture driver for the primary camera.
    {
        let mut driver = CaptureDriver::new(
            driver_config,
            hub.clone(),
            slots.clone(),
            counts.clone(),
            rate.clone(),
            health.clone(),
            shutdown.clone(),
            paused.clone(),
            wake.clone(),
        );
        threads.push(
            std::thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || driver.run())?,
        );
    }

    // Rate controller: ~1s tick, re-reads settings on config change.
    {
        let config = config.clone();
        let rate = rate.clone();
        let shutdown = shutdown.clone();
        threads.push(
            std::thread::Builder::new()
                .name("rate-controller".to_string())
                .spawn(move || {
                    let changes = config.subscribe();
                    let mut monitor = CpuMonitor::new();
                    let mut auto = AutoSkip::new(config.snapshot().rate.clone());
                    while shutdown.sleep(Duration::from_secs(1)) {
                        if changes.try_recv().is_ok() {
                            auto.reconfigure(config.snapshot().rate.clone());
                        }
                        let settings = config.snapshot();
                        if !settings.rate.auto_skip {
                            rate.set_skip_ratio(settings.rate.skip_ratio);
                            continue;
                        }
                        if let Some(cpu) = monitor.update() {
                            rate.set_skip_ratio(auto.tick(cpu, std::time::Instant::now()));
                            if let Some(own) = monitor.process_pct(std::process::id()) {
                                log::debug!("cpu: system={}% self={}%", cpu, own);
                            }
                        }
                    }
                })?,
        );
    }

    // Protocol clients.
    let rpc_status = Arc::new(ClientStatus::new());
    {
        let client = RpcClient::new(
            engine.clone(),
            config.clone(),
            rpc_status.clone(),
            shutdown.clone(),
        );
        threads.push(
            std::thread::Builder::new()
                .name("rpc-client".to_string())
                .spawn(move || client.run())?,
        );
    }

    let moonraker_status = Arc::new(ClientStatus::new());
    if cfg.timelapse.enabled {
        let client = MoonrakerClient::new(
            engine.clone(),
            config.clone(),
            moonraker_status.clone(),
            shutdown.clone(),
        );
        threads.push(
            std::thread::Builder::new()
                .name("moonraker-client".to_string())
                .spawn(move || client.run())?,
        );
    }

    let control_status = Arc::new(ClientStatus::new());
    if cfg.control.enabled {
        let client = ControlClient::new(
            config.clone(),
            paused.clone(),
            control_status.clone(),
            shutdown.clone(),
        );
        threads.push(
            std::thread::Builder::new()
                .name("control-client".to_string())
                .spawn(move || client.run())?,
        );
    }

    // Secondary-camera supervision.
    if !secondaries.is_empty() {
        let binary = std::env::current_exe().context("resolve own binary path")?;
        let mut orchestrator =
            Orchestrator::new(config.clone(), shutdown.clone(), binary, secondaries);
        threads.push(
            std::thread::Builder::new()
                .name("orchestrator".to_string())
                .spawn(move || orchestrator.run())?,
        );
    }

    log::info!("printcamd running");
    for thread in threads {
        let _ = thread.join();
    }
    log::info!("printcamd stopped");
    Ok(())
}

/// Secondary instance: one camera, MJPEG only, no protocol clients, no
/// H.264 - it must never touch the shared hardware channel.
fn run_secondary(args: Args, shutdown: Shutdown) -> Result<()> {
    let device = args
        .device
        .context("--secondary requires --device")?;
    let port = args
        .streaming_port
        .context("--secondary requires --streaming-port")?;

    log::info!("secondary encoder starting for {} on :{}", device, port);

    let slots = Arc::new(CameraSlots::new());
    let counts = Arc::new(ClientCounts::new());
    let driver_config = DriverConfig {
        device: DeviceConfig {
            path: device,
            width: args.width.unwrap_or(640),
            height: args.height.unwrap_or(480),
            fps: args.fps.unwrap_or(10),
            format: CaptureFormat::Mjpeg,
        },
        target_fps: args.fps.unwrap_or(10),
        jpeg_quality: args.jpeg_quality.unwrap_or(85),
        h264_enabled: false,
    };

    spawn_mjpeg_server(port, slots.clone(), counts.clone(), shutdown.clone())?;

    let mut driver = CaptureDriver::new(
        driver_config,
        encoder_hub(),
        slots,
        counts,
        RateHandle::new(1),
        Arc::new(CameraHealth::new()),
        shutdown,
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicBool::new(false)),
    );
    driver.run();
    Ok(())
}
