//! Interface to the imaging device driven by the pipeline.
//!
//! The device is the producer of the pipeline: buffers registered with it
//! come back, filled, as `DeviceEvent`s posted through the `EventSink` it
//! was attached to. Events may be posted from any thread, including from
//! within a call the pipeline made into the device, so implementations must
//! not hold their own locks while posting.
pub mod sim;

use crate::memory::FrameBuffer;
use crate::params::{BufferParameters, HfrRate};

pub use crate::memory::BufferRole;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use enumn::N;
use thiserror::Error;

/// The streams a device produces continuously.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
#[repr(u32)]
pub enum StreamKind {
    Preview = 0,
    Video = 1,
    /// Full resolution frames captured alongside the preview in zero
    /// shutter lag mode.
    Zsl = 2,
}

impl StreamKind {
    /// Role of the buffers this stream is produced into.
    pub fn role(self) -> BufferRole {
        match self {
            StreamKind::Preview => BufferRole::Preview,
            StreamKind::Video => BufferRole::Record,
            StreamKind::Zsl => BufferRole::Zsl,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Preview => f.write_str("preview"),
            StreamKind::Video => f.write_str("video"),
            StreamKind::Zsl => f.write_str("zsl"),
        }
    }
}

/// A buffer filled by the device, with its capture information.
#[derive(Debug)]
pub struct Frame {
    pub buffer: FrameBuffer,
    pub kind: StreamKind,
    pub timestamp: Duration,
    pub sequence: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Full-resolution still capture, preview delivery paused.
    Normal,
    /// Capture of a frame of the video stream while recording.
    Live,
}

/// Buffers handed to the device for a still capture.
#[derive(Debug)]
pub struct SnapshotRequest {
    pub kind: SnapshotKind,
    pub main: FrameBuffer,
    pub postview: Option<FrameBuffer>,
}

/// A still capture completed by the device.
pub type RawPicture = SnapshotRequest;

/// Buffers handed to the device's encoder. The encoded bytes are written
/// into `output`, whose `bytes_used` is set to the encoded size.
#[derive(Debug)]
pub struct EncodeRequest {
    pub main: FrameBuffer,
    pub thumbnail: Option<FrameBuffer>,
    pub output: FrameBuffer,
    pub quality: u8,
}

/// Completion of an `EncodeRequest`, giving the buffers back.
#[derive(Debug)]
pub struct EncodeDone {
    pub request: EncodeRequest,
    pub success: bool,
}

/// Device-side settings that are not part of the buffer geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceParm {
    Histogram(bool),
    FaceDetection(bool),
    HighFrameRate(Option<HfrRate>),
}

/// Asynchronous notifications from the device.
#[derive(Debug)]
pub enum DeviceEvent {
    /// A preview or video buffer has been filled.
    Frame(Frame),
    /// The sensor exposure of a still capture has completed.
    Shutter,
    /// The buffers of a still capture have been filled.
    RawPicture(RawPicture),
    /// A chunk of `usize` bytes of the JPEG in progress has been written.
    JpegFragment(usize),
    EncodeDone(EncodeDone),
    /// Autofocus completed, successfully or not.
    FocusDone(bool),
    /// A histogram of the current frame.
    Statistics(Vec<u32>),
    /// Face detection results, in the device's binary format.
    Metadata(Vec<u8>),
    /// No frame was produced within the device's watchdog period.
    FrameTimeout,
    /// The device cannot continue.
    Fatal(String),
}

pub trait EventCallback: Fn(DeviceEvent) + Send + Sync + 'static {}
impl<F> EventCallback for F where F: Fn(DeviceEvent) + Send + Sync + 'static {}

/// Where a device posts its events.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(DeviceEvent) + Send + Sync>);

impl EventSink {
    pub fn new<F: EventCallback>(callback: F) -> Self {
        Self(Arc::new(callback))
    }

    pub fn post(&self, event: DeviceEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device is not attached to a pipeline")]
    NotAttached,
    #[error("no {0} buffers registered")]
    NoBuffers(BufferRole),
    #[error("device rejected the operation: {0}")]
    Rejected(String),
    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("device error: {0}")]
    Errno(#[from] nix::Error),
}

/// Operations the pipeline needs from the imaging device.
pub trait ImagingDevice: Send + Sync {
    /// Install the sink events are posted to. Called once, when the pipeline
    /// is opened.
    fn attach(&self, sink: EventSink) -> Result<(), DeviceError>;

    /// Apply the sizes and formats of all streams.
    fn set_dimensions(&self, params: &BufferParameters) -> Result<(), DeviceError>;

    fn configure(&self, parm: DeviceParm) -> Result<(), DeviceError>;

    /// Give `buffers` to the device, which will fill them for the streams of
    /// `role`. If registration fails the buffers are simply dropped.
    fn register_buffers(&self, role: BufferRole, buffers: Vec<FrameBuffer>)
        -> Result<(), DeviceError>;

    /// Take back every buffer of `role` the device still holds.
    fn unregister_buffers(&self, role: BufferRole) -> Vec<FrameBuffer>;

    fn start_stream(&self, kind: StreamKind) -> Result<(), DeviceError>;

    fn stop_stream(&self, kind: StreamKind) -> Result<(), DeviceError>;

    /// Give a consumed frame back to the device so it can be filled again.
    fn release_frame(&self, frame: Frame);

    /// Start a still capture. Completion is signalled by `Shutter` and
    /// `RawPicture` events.
    fn start_snapshot(&self, request: SnapshotRequest) -> Result<(), DeviceError>;

    /// Abort the still capture in progress, if any. Buffers it held are
    /// dropped.
    fn cancel_snapshot(&self);

    /// Encode a still capture. Completion is signalled by `JpegFragment`
    /// events followed by one `EncodeDone`.
    fn encode(&self, request: EncodeRequest) -> Result<(), DeviceError>;

    /// Start an autofocus sweep, completed by a `FocusDone` event.
    fn start_autofocus(&self) -> Result<(), DeviceError>;

    fn abort_autofocus(&self);
}
