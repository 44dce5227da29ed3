//! printcam - on-device camera service for 3D printers.
//!
//! A threaded media server for a single-core embedded Linux device that
//! must never starve the printer it rides on:
//!
//! - Capture from 1-4 USB cameras, the primary in-process and each
//!   secondary as a supervised child encoder instance.
//! - Encode through the hardware JPEG/H.264 block behind a narrow trait,
//!   with the H.264 channel arbitrated as a singleton resource.
//! - Serve MJPEG multipart, single-shot snapshot, and FLV-wrapped H.264
//!   streams; live client counts are the capture pipeline's idle signal.
//! - Speak three printer-side protocols on independent reconnecting
//!   threads: pub/sub camera control, ETX-delimited request/reply RPC, and
//!   a WebSocket print-status subscription.
//! - Record timelapses autonomously from print-progress events.
//!
//! # Module Structure
//!
//! - `capture`: device backends, encoder abstraction, the capture loop
//! - `frame`: latest-frame slots shared by capture and the servers
//! - `stream`: MJPEG/snapshot/FLV servers and client accounting
//! - `cameras`: discovery and secondary-process supervision
//! - `clients`: the three protocol clients
//! - `timelapse`: the recording state machine and assembly
//! - `rate`: CPU accounting and the adaptive skip controller
//! - `config`: the JSON config document and live-reload store

pub mod cameras;
pub mod capture;
pub mod clients;
pub mod config;
pub mod error;
pub mod frame;
pub mod rate;
pub mod shutdown;
pub mod stream;
pub mod timelapse;

pub use config::{AppConfig, ConfigStore};
pub use error::{Error, Result};
pub use frame::{CameraSlots, Frame, FrameSlot, StreamKind};
pub use shutdown::Shutdown;
pub use timelapse::{SessionParams, TimelapseEngine};
