//! Camera discovery and multi-camera lifecycle.

pub mod discovery;
pub mod orchestrator;

pub use discovery::{discover, CameraDescriptor, DeviceEnumerator, SystemEnumerator};
pub use orchestrator::{ChildCamera, Orchestrator};
