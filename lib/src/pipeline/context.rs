//! State shared by the pipeline and all of its stages.
use super::focus::FocusSignal;
use crate::callbacks::{FrameReturn, MessageDispatcher, Overlay};
use crate::config::PipelineConfig;
use crate::device::{
    DeviceEvent, EncodeDone, Frame, ImagingDevice, RawPicture, SnapshotKind, StreamKind,
};
use crate::memory::{FrameBuffer, Owner, PoolId};
use crate::queue::FrameQueue;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use log::{debug, error, trace, warn};

/// Input of the snapshot stage.
#[derive(Debug)]
pub(crate) enum StillEvent {
    Shutter,
    Raw(RawPicture),
}

/// Input of the jpeg stage.
#[derive(Debug)]
pub(crate) enum JpegEvent {
    Fragment(usize),
    Done(EncodeDone),
}

/// Input of the service stage.
#[derive(Debug)]
pub(crate) enum ServiceEvent {
    Statistics(Vec<u32>),
    Metadata(Vec<u8>),
    FrameTimeout,
    Fatal(String),
}

pub(crate) struct Queues {
    /// Frames coming from the device, in production order.
    pub busy: FrameQueue<Frame>,
    pub preview: FrameQueue<Frame>,
    pub hfr: FrameQueue<Frame>,
    pub record: FrameQueue<Frame>,
    pub still: FrameQueue<StillEvent>,
    pub jpeg: FrameQueue<JpegEvent>,
    pub service: FrameQueue<ServiceEvent>,
}

impl Queues {
    fn new(capacity: usize) -> Self {
        Self {
            busy: FrameQueue::new("busy", capacity),
            preview: FrameQueue::new("preview", capacity),
            hfr: FrameQueue::new("hfr", capacity),
            record: FrameQueue::new("record", capacity),
            still: FrameQueue::new("still", capacity),
            jpeg: FrameQueue::new("jpeg", capacity),
            service: FrameQueue::new("service", capacity),
        }
    }
}

/// Counters of the events observed by the pipeline since it was opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub frames_returned: u64,
    pub stale_frames: u64,
    pub preview_forwarded: u64,
    pub preview_delivered: u64,
    pub preview_dropped: u64,
    pub record_forwarded: u64,
    pub record_delivered: u64,
    pub record_dropped: u64,
    pub pictures_taken: u64,
    pub encode_failures: u64,
    pub frame_timeouts: u64,
    pub fatal_errors: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub frames_received: AtomicU64,
    pub frames_returned: AtomicU64,
    pub stale_frames: AtomicU64,
    pub preview_forwarded: AtomicU64,
    pub preview_delivered: AtomicU64,
    pub preview_dropped: AtomicU64,
    pub record_forwarded: AtomicU64,
    pub record_delivered: AtomicU64,
    pub record_dropped: AtomicU64,
    pub pictures_taken: AtomicU64,
    pub encode_failures: AtomicU64,
    pub frame_timeouts: AtomicU64,
    pub fatal_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            frames_received: get(&self.frames_received),
            frames_returned: get(&self.frames_returned),
            stale_frames: get(&self.stale_frames),
            preview_forwarded: get(&self.preview_forwarded),
            preview_delivered: get(&self.preview_delivered),
            preview_dropped: get(&self.preview_dropped),
            record_forwarded: get(&self.record_forwarded),
            record_delivered: get(&self.record_delivered),
            record_dropped: get(&self.record_dropped),
            pictures_taken: get(&self.pictures_taken),
            encode_failures: get(&self.encode_failures),
            frame_timeouts: get(&self.frame_timeouts),
            fatal_errors: get(&self.fatal_errors),
        }
    }
}

/// Progress of the live snapshot, i.e. a still taken while recording.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LiveSnapshotState {
    /// The last live snapshot completed (or none was ever taken).
    #[default]
    Done,
    InProgress,
    /// The last live snapshot was cancelled or failed.
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StillPhase {
    Idle,
    Capturing(SnapshotKind),
    Cancelling(SnapshotKind),
}

/// Still capture sub-state, behind the still lock.
pub(crate) struct StillState {
    pub phase: StillPhase,
    pub live: LiveSnapshotState,
}

pub(crate) struct PipelineContext {
    pub device: Arc<dyn ImagingDevice>,
    pub messages: MessageDispatcher,
    pub queues: Queues,
    pub counters: Counters,
    pub still: Mutex<StillState>,
    pub focus: FocusSignal,
    pub overlay: Mutex<Option<Arc<dyn Overlay>>>,
    pub fps_logging: bool,
    /// Raw id of the pool currently registered for each stream, 0 if none.
    active_preview: AtomicU64,
    active_record: AtomicU64,
    active_zsl: AtomicU64,
    /// Most recent frame of the zero shutter lag ring.
    zsl_latest: Mutex<Option<Frame>>,
    /// Copy of the last preview frame, taken when preview delivery pauses.
    /// `bytes_used` is 0 until the copy is made.
    last_preview: Mutex<Option<FrameBuffer>>,
    recording: AtomicBool,
    preview_paused: AtomicBool,
    hfr: AtomicBool,
    histogram: AtomicBool,
    face_detection: AtomicBool,
    fatal_reported: AtomicBool,
}

impl PipelineContext {
    pub(crate) fn new(device: Arc<dyn ImagingDevice>, config: &PipelineConfig) -> Self {
        Self {
            device,
            messages: MessageDispatcher::new(),
            queues: Queues::new(config.capacity()),
            counters: Default::default(),
            still: Mutex::new(StillState {
                phase: StillPhase::Idle,
                live: LiveSnapshotState::Done,
            }),
            focus: FocusSignal::new(),
            overlay: Mutex::new(None),
            fps_logging: config.fps_logging(),
            active_preview: AtomicU64::new(0),
            active_record: AtomicU64::new(0),
            active_zsl: AtomicU64::new(0),
            zsl_latest: Mutex::new(None),
            last_preview: Mutex::new(None),
            recording: AtomicBool::new(false),
            preview_paused: AtomicBool::new(false),
            hfr: AtomicBool::new(false),
            histogram: AtomicBool::new(false),
            face_detection: AtomicBool::new(false),
            fatal_reported: AtomicBool::new(false),
        }
    }

    fn active_pool(&self, kind: StreamKind) -> &AtomicU64 {
        match kind {
            StreamKind::Preview => &self.active_preview,
            StreamKind::Video => &self.active_record,
            StreamKind::Zsl => &self.active_zsl,
        }
    }

    pub(crate) fn set_active(&self, kind: StreamKind, pool: Option<PoolId>) {
        let id = pool.map_or(0, |id| id.as_u64());
        self.active_pool(kind).store(id, Ordering::SeqCst);
    }

    /// Whether `frame` belongs to the pool currently registered for its
    /// stream. Frames of previous sessions must never be delivered.
    pub(crate) fn is_active(&self, frame: &Frame) -> bool {
        frame.buffer.is_alive()
            && self.active_pool(frame.kind).load(Ordering::SeqCst) == frame.buffer.pool_id().as_u64()
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub(crate) fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::SeqCst);
    }

    pub(crate) fn preview_paused(&self) -> bool {
        self.preview_paused.load(Ordering::SeqCst)
    }

    pub(crate) fn pause_preview(&self, paused: bool) {
        self.preview_paused.store(paused, Ordering::SeqCst);
        if !paused {
            if let Some(last) = self.last_preview.lock().unwrap().as_mut() {
                last.set_bytes_used(0);
            }
        }
    }

    /// Install (or remove) the buffer the last preview frame is copied into.
    pub(crate) fn set_last_preview(&self, buffer: Option<FrameBuffer>) {
        *self.last_preview.lock().unwrap() = buffer;
    }

    /// Copy `frame` as the last preview frame and show it, unless a frame was
    /// already kept since preview delivery paused.
    pub(crate) fn keep_last_preview(&self, frame: &FrameBuffer) {
        let Some(mut last) = self.last_preview.lock().unwrap().take() else {
            return;
        };
        if last.bytes_used() == 0 {
            let bytes = frame
                .map()
                .map(|data| data[..frame.bytes_used().min(data.len())].to_vec())
                .unwrap_or_default();
            let len = match last.map_mut() {
                Some(mut data) => {
                    let len = bytes.len().min(data.len());
                    data[..len].copy_from_slice(&bytes[..len]);
                    len
                }
                None => 0,
            };
            last.set_bytes_used(len);
            trace!("Kept preview frame {} ({} bytes)", frame.index(), len);
            self.render(&last);
        }

        let mut slot = self.last_preview.lock().unwrap();
        if slot.is_none() {
            *slot = Some(last);
        }
    }

    /// Contents of the last kept preview frame, if any.
    pub(crate) fn last_preview_frame(&self) -> Option<Vec<u8>> {
        let last = self.last_preview.lock().unwrap();
        let last = last.as_ref()?;
        if last.bytes_used() == 0 {
            return None;
        }
        let data = last.map()?;
        Some(data[..last.bytes_used().min(data.len())].to_vec())
    }

    /// Keep `frame` as the most recent zero shutter lag frame. The frame it
    /// replaces goes back to the device.
    pub(crate) fn hold_zsl(&self, mut frame: Frame) {
        frame.buffer.hand_off(Owner::Consumer("zsl"));
        let previous = self.zsl_latest.lock().unwrap().replace(frame);
        if let Some(previous) = previous {
            self.return_to_device(previous);
        }
    }

    pub(crate) fn take_zsl(&self) -> Option<Frame> {
        self.zsl_latest.lock().unwrap().take()
    }

    /// Drop the held zero shutter lag frame without giving it back.
    pub(crate) fn clear_zsl(&self) {
        drop(self.take_zsl());
    }

    /// Give a buffer of the zero shutter lag ring used for a picture back to
    /// the device. Other buffers are simply dropped.
    pub(crate) fn recycle(&self, buffer: FrameBuffer) {
        if buffer.pool_id().as_u64() != self.active_zsl.load(Ordering::SeqCst) {
            return;
        }
        self.return_to_device(Frame {
            buffer,
            kind: StreamKind::Zsl,
            timestamp: Default::default(),
            sequence: 0,
        });
    }

    pub(crate) fn hfr_active(&self) -> bool {
        self.hfr.load(Ordering::SeqCst)
    }

    pub(crate) fn set_hfr(&self, active: bool) {
        self.hfr.store(active, Ordering::SeqCst);
    }

    pub(crate) fn histogram(&self) -> bool {
        self.histogram.load(Ordering::SeqCst)
    }

    pub(crate) fn set_histogram(&self, enabled: bool) {
        self.histogram.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn face_detection(&self) -> bool {
        self.face_detection.load(Ordering::SeqCst)
    }

    pub(crate) fn set_face_detection(&self, enabled: bool) {
        self.face_detection.store(enabled, Ordering::SeqCst);
    }

    /// Returns true only the first time it is called since the last
    /// `clear_fatal`.
    pub(crate) fn report_fatal(&self) -> bool {
        !self.fatal_reported.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_fatal(&self) {
        self.fatal_reported.store(false, Ordering::SeqCst);
    }

    pub(crate) fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Entry point of every event posted by the device.
    pub(crate) fn route(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Frame(mut frame) => {
                Counters::bump(&self.counters.frames_received);
                if !self.is_active(&frame) {
                    Counters::bump(&self.counters.stale_frames);
                    debug!(
                        "Dropping stale {} frame {} from pool {}",
                        frame.kind,
                        frame.sequence,
                        frame.buffer.pool_id()
                    );
                    return;
                }
                frame.buffer.hand_off(Owner::Queue);
                trace!("Routing {} frame {}", frame.kind, frame.sequence);
                if let Err(frame) = self.queues.busy.add(frame) {
                    trace!("Frame dispatch not running, returning frame {}", frame.sequence);
                    self.return_to_device(frame);
                }
            }
            DeviceEvent::Shutter => {
                if self.queues.still.add(StillEvent::Shutter).is_err() {
                    debug!("Shutter without still capture in progress");
                }
            }
            DeviceEvent::RawPicture(mut raw) => {
                raw.main.hand_off(Owner::Queue);
                if let Some(postview) = raw.postview.as_mut() {
                    postview.hand_off(Owner::Queue);
                }
                if self.queues.still.add(StillEvent::Raw(raw)).is_err() {
                    debug!("Raw picture without still capture in progress, dropping it");
                }
            }
            DeviceEvent::JpegFragment(size) => {
                if self.queues.jpeg.add(JpegEvent::Fragment(size)).is_err() {
                    debug!("JPEG fragment without encode in progress");
                }
            }
            DeviceEvent::EncodeDone(done) => {
                if self.queues.jpeg.add(JpegEvent::Done(done)).is_err() {
                    debug!("Encode completion without encode in progress, dropping it");
                }
            }
            DeviceEvent::FocusDone(success) => self.focus.complete(success),
            // Gated when produced; the service stage checks again for
            // results queued before the feature was turned off.
            DeviceEvent::Statistics(histogram) => {
                if self.histogram() {
                    self.post_service(ServiceEvent::Statistics(histogram))
                } else {
                    trace!("Histogram disabled, dropping statistics");
                }
            }
            DeviceEvent::Metadata(metadata) => {
                if self.face_detection() {
                    self.post_service(ServiceEvent::Metadata(metadata))
                } else {
                    trace!("Face detection disabled, dropping metadata");
                }
            }
            DeviceEvent::FrameTimeout => self.post_service(ServiceEvent::FrameTimeout),
            DeviceEvent::Fatal(reason) => self.post_service(ServiceEvent::Fatal(reason)),
        }
    }

    fn post_service(&self, event: ServiceEvent) {
        if let Err(event) = self.queues.service.add(event) {
            match event {
                ServiceEvent::Fatal(reason) => {
                    error!("Fatal device error after release: {}", reason)
                }
                event => warn!("Service queue unavailable, dropping {:?}", event),
            }
        }
    }

    /// Give a consumed frame back to the device, unless its pool is no longer
    /// registered, in which case it just returns to that pool.
    pub(crate) fn return_to_device(&self, mut frame: Frame) {
        if !self.is_active(&frame) {
            Counters::bump(&self.counters.stale_frames);
            trace!("Not returning stale {} frame {}", frame.kind, frame.sequence);
            return;
        }

        frame.buffer.hand_off(Owner::Device);
        Counters::bump(&self.counters.frames_returned);
        trace!("Returning {} frame {} to device", frame.kind, frame.sequence);
        self.device.release_frame(frame);
    }

    /// Hand `buffer` to the overlay, if one is installed.
    pub(crate) fn render(&self, buffer: &FrameBuffer) {
        let overlay = self.overlay.lock().unwrap().clone();
        if let Some(overlay) = overlay {
            if let Err(e) = overlay.render(buffer) {
                warn!("Overlay failed to render buffer {}: {:#}", buffer.index(), e);
            }
        }
    }

    /// Leave the still capture state. Called by the jpeg stage when it exits.
    pub(crate) fn finish_still(&self, kind: SnapshotKind, success: bool) {
        let mut still = self.still.lock().unwrap();
        still.phase = StillPhase::Idle;
        if kind == SnapshotKind::Live {
            still.live = if success {
                LiveSnapshotState::Done
            } else {
                LiveSnapshotState::Stopped
            };
        }
        drop(still);

        if kind == SnapshotKind::Normal {
            self.pause_preview(false);
        }
        debug!("Still capture finished (success: {})", success);
    }
}

impl FrameReturn for PipelineContext {
    fn return_frame(&self, frame: Frame) {
        trace!("Consumer released {} frame {}", frame.kind, frame.sequence);
        self.return_to_device(frame);
    }
}
