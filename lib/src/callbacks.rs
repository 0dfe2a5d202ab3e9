//! Consumer-facing callbacks and the message mask gating them.
use crate::device::Frame;
use crate::memory::{BufferView, FrameBuffer};

use std::fmt;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, Weak,
};
use std::time::Duration;

use bitflags::bitflags;
use log::trace;

bitflags! {
    /// Kinds of messages delivered to the consumer. Only the kinds enabled
    /// in the pipeline's mask are delivered.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MsgType: u32 {
        const ERROR = 0x001;
        const SHUTTER = 0x002;
        const FOCUS = 0x004;
        /// Reserved for zoom controllers driving the device directly. The
        /// pipeline never emits it, but keeps it in the mask.
        const ZOOM = 0x008;
        const PREVIEW_FRAME = 0x010;
        const VIDEO_FRAME = 0x020;
        const POSTVIEW_FRAME = 0x040;
        const RAW_IMAGE = 0x080;
        const COMPRESSED_IMAGE = 0x100;
        const RAW_IMAGE_NOTIFY = 0x200;
        const PREVIEW_METADATA = 0x400;
        const STATS_DATA = 0x800;
    }
}

/// `ext1` of an `ERROR` notification for recoverable errors.
pub const ERROR_UNKNOWN: i32 = 1;
/// `ext1` of the `ERROR` notification sent when the device died. No other
/// message follows it.
pub const ERROR_SERVER_DIED: i32 = 100;

/// `ext2` of `ERROR` notifications, detailing what went wrong.
pub const ERROR_DETAIL_FRAME_TIMEOUT: i32 = 1;
pub const ERROR_DETAIL_ENCODE: i32 = 2;
pub const ERROR_DETAIL_SNAPSHOT: i32 = 3;
pub const ERROR_DETAIL_FATAL: i32 = 4;

/// Receiver of pipeline messages. All methods are called from pipeline
/// stage threads, never with a pipeline lock held.
///
/// Calling state-changing pipeline operations from within a callback is
/// supported, but teardown operations called from a callback wait for the
/// other stages to exit and should be kept to a minimum.
pub trait CameraCallbacks: Send + Sync {
    /// A notification without payload (`SHUTTER`, `FOCUS`, `ERROR`, ...).
    fn notify(&self, _msg: MsgType, _ext1: i32, _ext2: i32) {}

    /// A message carrying data that is only valid during the call.
    fn data(&self, _msg: MsgType, _data: &[u8]) {}

    /// A video frame. The buffer stays out of the device until `frame` is
    /// released or dropped.
    fn data_timestamp(&self, _msg: MsgType, _frame: RecordingFrame, _timestamp: Duration) {}
}

/// Destination of frames given back by the consumer.
pub(crate) trait FrameReturn: Send + Sync {
    fn return_frame(&self, frame: Frame);
}

/// A video frame lent to the consumer.
pub struct RecordingFrame {
    // Always Some, except while dropping.
    frame: Option<Frame>,
    home: Weak<dyn FrameReturn>,
}

impl RecordingFrame {
    pub(crate) fn new(frame: Frame, home: Weak<dyn FrameReturn>) -> Self {
        Self {
            frame: Some(frame),
            home,
        }
    }

    fn frame(&self) -> &Frame {
        // Only taken in drop().
        self.frame.as_ref().unwrap()
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.frame().buffer
    }

    pub fn index(&self) -> usize {
        self.frame().buffer.index()
    }

    pub fn sequence(&self) -> u64 {
        self.frame().sequence
    }

    pub fn timestamp(&self) -> Duration {
        self.frame().timestamp
    }

    /// Content of the frame, or `None` if its recording session has ended.
    pub fn data(&self) -> Option<BufferView<'_>> {
        self.frame().buffer.map()
    }
}

impl fmt::Debug for RecordingFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingFrame")
            .field("frame", &self.frame)
            .finish()
    }
}

impl Drop for RecordingFrame {
    /// Give the frame back to the pipeline if it still exists, otherwise the
    /// buffer just returns to its pool.
    fn drop(&mut self) {
        if let (Some(frame), Some(home)) = (self.frame.take(), self.home.upgrade()) {
            home.return_frame(frame);
        }
    }
}

/// Renders preview frames on a display.
pub trait Overlay: Send + Sync {
    fn render(&self, buffer: &FrameBuffer) -> anyhow::Result<()>;
}

/// Single point through which every message reaches the consumer.
pub(crate) struct MessageDispatcher {
    enabled: AtomicU32,
    callbacks: Mutex<Option<Arc<dyn CameraCallbacks>>>,
}

impl MessageDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            enabled: AtomicU32::new(0),
            callbacks: Mutex::new(None),
        }
    }

    pub(crate) fn set_callbacks(&self, callbacks: Option<Arc<dyn CameraCallbacks>>) {
        *self.callbacks.lock().unwrap() = callbacks;
    }

    pub(crate) fn enable(&self, msg: MsgType) {
        self.enabled.fetch_or(msg.bits(), Ordering::SeqCst);
    }

    pub(crate) fn disable(&self, msg: MsgType) {
        self.enabled.fetch_and(!msg.bits(), Ordering::SeqCst);
    }

    pub(crate) fn enabled(&self, msg: MsgType) -> bool {
        MsgType::from_bits_truncate(self.enabled.load(Ordering::SeqCst)).intersects(msg)
    }

    /// The callbacks to deliver `msg` to, if it is enabled. The callback lock
    /// is released before returning so no lock is held during delivery.
    fn target(&self, msg: MsgType) -> Option<Arc<dyn CameraCallbacks>> {
        if !self.enabled(msg) {
            trace!("{:?} masked, not delivered", msg);
            return None;
        }
        self.callbacks.lock().unwrap().clone()
    }

    pub(crate) fn notify(&self, msg: MsgType, ext1: i32, ext2: i32) -> bool {
        match self.target(msg) {
            Some(callbacks) => {
                callbacks.notify(msg, ext1, ext2);
                true
            }
            None => false,
        }
    }

    pub(crate) fn data(&self, msg: MsgType, data: &[u8]) -> bool {
        match self.target(msg) {
            Some(callbacks) => {
                callbacks.data(msg, data);
                true
            }
            None => false,
        }
    }

    /// Deliver a video frame. If the message is masked, the frame is dropped
    /// and thus returns to the device right away.
    pub(crate) fn data_timestamp(&self, msg: MsgType, frame: RecordingFrame) -> bool {
        match self.target(msg) {
            Some(callbacks) => {
                let timestamp = frame.timestamp();
                callbacks.data_timestamp(msg, frame, timestamp);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StreamKind;
    use crate::memory::{AnonymousBufferPool, BufferPool, BufferRole, PoolRequest};

    #[derive(Default)]
    struct Recorder {
        notifications: Mutex<Vec<(MsgType, i32, i32)>>,
        data: Mutex<Vec<(MsgType, Vec<u8>)>>,
    }

    impl CameraCallbacks for Recorder {
        fn notify(&self, msg: MsgType, ext1: i32, ext2: i32) {
            self.notifications.lock().unwrap().push((msg, ext1, ext2));
        }

        fn data(&self, msg: MsgType, data: &[u8]) {
            self.data.lock().unwrap().push((msg, data.to_vec()));
        }
    }

    #[derive(Default)]
    struct Collector(Mutex<Vec<Frame>>);

    impl FrameReturn for Collector {
        fn return_frame(&self, frame: Frame) {
            self.0.lock().unwrap().push(frame);
        }
    }

    #[test]
    fn test_mask_gates_delivery() {
        let dispatcher = MessageDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.set_callbacks(Some(recorder.clone()));

        assert!(!dispatcher.notify(MsgType::SHUTTER, 0, 0));
        dispatcher.enable(MsgType::SHUTTER | MsgType::FOCUS);
        assert!(dispatcher.enabled(MsgType::FOCUS));
        assert!(dispatcher.notify(MsgType::SHUTTER, 0, 0));
        assert!(dispatcher.notify(MsgType::FOCUS, 1, 0));

        dispatcher.disable(MsgType::FOCUS);
        assert!(!dispatcher.notify(MsgType::FOCUS, 1, 0));
        assert!(!dispatcher.data(MsgType::PREVIEW_FRAME, &[1, 2, 3]));

        assert_eq!(
            *recorder.notifications.lock().unwrap(),
            vec![(MsgType::SHUTTER, 0, 0), (MsgType::FOCUS, 1, 0)]
        );
        assert!(recorder.data.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_callbacks_installed() {
        let dispatcher = MessageDispatcher::new();
        dispatcher.enable(MsgType::all());
        assert!(!dispatcher.data(MsgType::PREVIEW_FRAME, &[0]));
    }

    #[test]
    fn test_recording_frame_goes_home_on_drop() {
        let pool = AnonymousBufferPool::create(BufferRole::Record, PoolRequest::new("record", 64, 2));
        let collector: Arc<Collector> = Arc::new(Collector::default());
        let home: Arc<dyn FrameReturn> = collector.clone();

        let frame = Frame {
            buffer: pool.acquire().unwrap(),
            kind: StreamKind::Video,
            timestamp: Duration::from_millis(33),
            sequence: 7,
        };
        let recording = RecordingFrame::new(frame, Arc::downgrade(&home));
        assert_eq!(recording.sequence(), 7);
        assert_eq!(recording.timestamp(), Duration::from_millis(33));
        assert_eq!(recording.data().unwrap().len(), 64);

        let dispatcher = MessageDispatcher::new();
        // Masked: the frame is dropped and returned immediately.
        assert!(!dispatcher.data_timestamp(MsgType::VIDEO_FRAME, recording));
        assert_eq!(collector.0.lock().unwrap().len(), 1);

        // Once the pipeline is gone, the buffer simply goes back to its pool.
        let frame = collector.0.lock().unwrap().pop().unwrap();
        let recording = RecordingFrame::new(frame, Arc::downgrade(&home));
        drop(home);
        drop(collector);
        drop(recording);
        assert_eq!(pool.stats().num_free, 2);
    }
}
