//! Buffer pools and capture pipeline coordination for camera devices.
//!
//! This library sits between an imaging device able to write into shared
//! memory and a higher-level media framework. It is organized in layers:
//!
//! * The `memory` module allocates fixed-size frame buffers from contiguous
//!   (device-mapped) or anonymous memory, and tracks which party owns each
//!   of them at any time. Buffers are handed around as `FrameBuffer`s which
//!   return to their pool when dropped.
//!
//! * The `queue` module provides the blocking `FrameQueue` stages use to
//!   hand buffers to each other.
//!
//! * The `device` module defines the `ImagingDevice` trait the pipeline
//!   drives, and a `SimulatedDevice` implementing it in software.
//!
//! * The `pipeline` module runs one thread per stage (frame dispatch,
//!   preview, recording, still capture, JPEG collection, autofocus and
//!   device services) and enforces the capture state machine, delivering
//!   frames and notifications through the `callbacks` module.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use camhal::config::PipelineConfig;
//! # use camhal::device::sim::SimulatedDevice;
//! # use camhal::pipeline::CapturePipeline;
//! let device = Arc::new(SimulatedDevice::default());
//! let pipeline = CapturePipeline::open(device, PipelineConfig::new()).unwrap();
//! pipeline.start_preview().unwrap();
//! pipeline.take_picture().unwrap();
//! ```
pub mod callbacks;
pub mod config;
pub mod device;
pub mod memory;
pub mod params;
pub mod pipeline;
pub mod queue;

pub use callbacks::{CameraCallbacks, MsgType};
pub use config::PipelineConfig;
pub use pipeline::{CameraError, CapturePipeline, CaptureState, ErrorKind};
