//! The capture pipeline: owns the buffer pools, runs the stages consuming
//! device events and enforces the capture state machine.
//!
//! A `CapturePipeline` is in one of the states of `CaptureState`. Every
//! transition is performed under a single state lock, while frames and
//! device events flow through stage threads connected by `FrameQueue`s:
//!
//! ```text
//!                       +-> preview (or hfr) -> PREVIEW_FRAME
//! device -> dispatch ---+
//!                       +-> record -> VIDEO_FRAME
//!        -> snapshot -> jpeg -> COMPRESSED_IMAGE
//!        -> autofocus -> FOCUS
//!        -> service -> STATS_DATA, PREVIEW_METADATA, ERROR
//! ```
mod context;
mod focus;
mod service;
mod stage;
mod still;
mod streaming;

pub use context::{LiveSnapshotState, PipelineStats};
pub use service::{HISTOGRAM_BINS, METADATA_BUFFER_SIZE, STATS_BUFFER_SIZE};
pub use stage::StageError;

use context::{PipelineContext, StillEvent, StillPhase};
use focus::{autofocus_loop, AUTOFOCUS};
use service::{service_loop, AnalysisPools, SERVICE};
use stage::StageWorker;
use still::{jpeg_loop, snapshot_loop, StillJob, JPEG, JPEG_QUALITY, SNAPSHOT};
use streaming::{
    dispatch_loop, hfr_loop, preview_loop, record_loop, DISPATCH, HFR, PREVIEW, RECORD,
};

use crate::callbacks::{CameraCallbacks, MsgType, Overlay, RecordingFrame};
use crate::config::PipelineConfig;
use crate::device::{
    DeviceError, DeviceParm, EventSink, ImagingDevice, SnapshotKind, SnapshotRequest, StreamKind,
};
use crate::memory::{
    AnonymousBufferPool, BufferPool, BufferRole, ContiguousBufferPool, FrameBuffer, Owner,
    PoolError, PoolRequest,
};
use crate::params::{BufferParameters, FrameGeometry, ParameterError};

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, Weak,
};

use log::{debug, error, info, trace, warn};
use thiserror::Error;

/// Top-level capture mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    PreviewRunning,
    RecordingRunning,
    SnapshotInProgress,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureState::Idle => f.write_str("idle"),
            CaptureState::PreviewRunning => f.write_str("previewing"),
            CaptureState::RecordingRunning => f.write_str("recording"),
            CaptureState::SnapshotInProgress => f.write_str("taking a picture"),
        }
    }
}

/// The capture state with its overlapping sub-states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub autofocus: bool,
    pub live_snapshot: LiveSnapshotState,
}

/// Commands accepted by `CapturePipeline::send_command`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    StartHistogram,
    StopHistogram,
    StartFaceDetection,
    StopFaceDetection,
}

/// Broad classes of failures, telling the caller how to react.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Memory could not be obtained. The state did not change.
    Resource,
    /// The operation is not valid in the current state. Nothing happened.
    State,
    /// The device refused the operation.
    Device,
    /// The pipeline is in an unknown state and should be released.
    Fatal,
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: CaptureState,
    },
    #[error("the pipeline has been released")]
    Released,
    #[error("invalid parameters: {0}")]
    Parameters(#[from] ParameterError),
    #[error("buffer allocation failed: {0}")]
    Resource(#[from] PoolError),
    #[error("no free {0} buffer")]
    BufferBusy(BufferRole),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Stage(#[from] StageError),
}

impl CameraError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CameraError::InvalidState { .. }
            | CameraError::Released
            | CameraError::Parameters(_) => ErrorKind::State,
            CameraError::Resource(_)
            | CameraError::BufferBusy(_)
            | CameraError::Stage(StageError::Spawn { .. }) => ErrorKind::Resource,
            CameraError::Device(_) => ErrorKind::Device,
            CameraError::Stage(_) => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("cannot attach to device: {0}")]
    Device(#[from] DeviceError),
    #[error("cannot allocate analysis buffers: {0}")]
    Resource(#[from] PoolError),
    #[error(transparent)]
    Stage(#[from] StageError),
}

struct PreviewSession {
    preview_pool: ContiguousBufferPool,
    raw_pool: ContiguousBufferPool,
    /// Ring of full resolution frames, in zero shutter lag mode.
    zsl_pool: Option<ContiguousBufferPool>,
    last_preview_pool: AnonymousBufferPool,
    dispatch: StageWorker,
    /// Preview or HFR stage.
    consumer: StageWorker,
}

struct RecordSession {
    pool: ContiguousBufferPool,
    worker: StageWorker,
}

/// Resources of the current capture state. Only accessed with the state
/// lock held.
#[derive(Default)]
struct Session {
    preview: Option<PreviewSession>,
    recording: Option<RecordSession>,
    /// Snapshot and jpeg stages of the last still capture, possibly already
    /// finished.
    still: Vec<StageWorker>,
    autofocus: Option<StageWorker>,
}

/// Where the picture of a still capture comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StillSource {
    /// Captured by the device on request.
    Device,
    /// Already captured, taken from the zero shutter lag ring.
    Ring,
}

struct Shared {
    ctx: Arc<PipelineContext>,
    config: PipelineConfig,
    /// The state lock. Taken before any other pipeline lock.
    session: Mutex<Session>,
    params: Mutex<BufferParameters>,
    analysis: Arc<AnalysisPools>,
    service: Mutex<Option<StageWorker>>,
    released: AtomicBool,
}

fn hand_to_device(buffers: Vec<FrameBuffer>) -> Vec<FrameBuffer> {
    buffers
        .into_iter()
        .map(|mut buffer| {
            buffer.hand_off(Owner::Device);
            buffer
        })
        .collect()
}

impl Shared {
    fn lock_session(&self) -> Result<MutexGuard<'_, Session>, CameraError> {
        let session = self.session.lock().unwrap();
        if self.released.load(Ordering::SeqCst) {
            return Err(CameraError::Released);
        }
        Ok(session)
    }

    fn state(&self, session: &Session) -> CaptureState {
        if session.preview.is_none() {
            return CaptureState::Idle;
        }
        if self.ctx.still.lock().unwrap().phase != StillPhase::Idle {
            return CaptureState::SnapshotInProgress;
        }
        if session.recording.is_some() {
            CaptureState::RecordingRunning
        } else {
            CaptureState::PreviewRunning
        }
    }

    fn join(&self, worker: StageWorker) {
        let name = worker.name();
        if let Err(e) = worker.join(self.config.stage_join_timeout()) {
            error!("Cannot stop {} stage: {}", name, e);
        }
    }

    fn contiguous_pool(
        &self,
        role: BufferRole,
        name: &str,
        geometry: FrameGeometry,
        count: usize,
    ) -> Result<ContiguousBufferPool, PoolError> {
        let request = PoolRequest::new(name, geometry.frame_size, count)
            .alignment(self.config.buffer_alignment())
            .plane_offsets(geometry.cbcr_offset, geometry.y_offset);
        ContiguousBufferPool::create(self.config.source(), role, request).check()
    }

    fn start_preview_session(
        &self,
        params: &BufferParameters,
    ) -> Result<PreviewSession, CameraError> {
        let ctx = &self.ctx;
        let preview_pool = self.contiguous_pool(
            BufferRole::Preview,
            "preview",
            params.preview_geometry(),
            self.config.num_preview_buffers(),
        )?;
        let raw_pool =
            self.contiguous_pool(BufferRole::Snapshot, "raw", params.picture_geometry(), 1)?;
        let zsl_pool = if params.zsl {
            Some(self.contiguous_pool(
                BufferRole::Zsl,
                "zsl",
                params.picture_geometry(),
                self.config.num_zsl_buffers(),
            )?)
        } else {
            None
        };
        let last_preview_pool = AnonymousBufferPool::create(
            BufferRole::LastPreview,
            PoolRequest::new("last preview", params.preview_geometry().frame_size, 1),
        )
        .check()?;

        ctx.clear_fatal();
        ctx.pause_preview(false);
        ctx.set_hfr(params.hfr.is_some());
        ctx.queues.busy.init();
        match params.hfr {
            Some(_) => ctx.queues.hfr.init(),
            None => ctx.queues.preview.init(),
        }
        ctx.set_active(StreamKind::Preview, preview_pool.id());
        if let Some(zsl_pool) = zsl_pool.as_ref() {
            ctx.set_active(StreamKind::Zsl, zsl_pool.id());
        }
        ctx.set_last_preview(last_preview_pool.acquire());

        let dispatch_ctx = Arc::clone(ctx);
        let dispatch = match StageWorker::spawn(DISPATCH, move |control| {
            dispatch_loop(dispatch_ctx, control)
        }) {
            Ok(worker) => worker,
            Err(e) => {
                self.abort_preview(Vec::new());
                return Err(e.into());
            }
        };

        let consumer_ctx = Arc::clone(ctx);
        let consumer = match params.hfr {
            Some(rate) => {
                let decimation = rate.preview_decimation();
                StageWorker::spawn(HFR, move |control| {
                    hfr_loop(consumer_ctx, control, decimation)
                })
            }
            None => StageWorker::spawn(PREVIEW, move |control| preview_loop(consumer_ctx, control)),
        };
        let consumer = match consumer {
            Ok(worker) => worker,
            Err(e) => {
                self.abort_preview(vec![dispatch]);
                return Err(e.into());
            }
        };

        let streaming = ctx
            .device
            .set_dimensions(params)
            .and_then(|()| {
                ctx.device
                    .register_buffers(BufferRole::Preview, hand_to_device(preview_pool.acquire_all()))
            })
            .and_then(|()| ctx.device.start_stream(StreamKind::Preview))
            .and_then(|()| match zsl_pool.as_ref() {
                Some(zsl_pool) => ctx
                    .device
                    .register_buffers(BufferRole::Zsl, hand_to_device(zsl_pool.acquire_all()))
                    .and_then(|()| ctx.device.start_stream(StreamKind::Zsl)),
                None => Ok(()),
            });
        if let Err(e) = streaming {
            self.abort_preview(vec![consumer, dispatch]);
            return Err(e.into());
        }

        Ok(PreviewSession {
            preview_pool,
            raw_pool,
            zsl_pool,
            last_preview_pool,
            dispatch,
            consumer,
        })
    }

    /// Undo a partially started preview session.
    fn abort_preview(&self, workers: Vec<StageWorker>) {
        let ctx = &self.ctx;
        for worker in &workers {
            worker.disarm();
        }
        for kind in [StreamKind::Zsl, StreamKind::Preview] {
            if let Err(e) = ctx.device.stop_stream(kind) {
                debug!("Cannot stop {} stream: {}", kind, e);
            }
        }
        ctx.queues.preview.deinit();
        ctx.queues.hfr.deinit();
        ctx.queues.busy.deinit();
        for worker in workers {
            self.join(worker);
        }
        ctx.set_active(StreamKind::Preview, None);
        ctx.set_active(StreamKind::Zsl, None);
        drop(ctx.device.unregister_buffers(BufferRole::Preview));
        drop(ctx.device.unregister_buffers(BufferRole::Zsl));
        self.flush_stream_queues();
        ctx.clear_zsl();
        ctx.set_last_preview(None);
        ctx.set_hfr(false);
    }

    fn flush_stream_queues(&self) {
        let queues = &self.ctx.queues;
        drop(queues.busy.flush());
        drop(queues.preview.flush());
        drop(queues.hfr.flush());
    }

    /// Full teardown to idle. Does nothing if not previewing.
    fn stop_preview_locked(&self, session: &mut Session) {
        let Some(preview) = session.preview.take() else {
            return;
        };
        debug!("Tearing down preview session");
        let ctx = &self.ctx;

        self.stop_autofocus_locked(session);
        self.stop_still(std::mem::take(&mut session.still));
        self.stop_recording_locked(session);

        preview.consumer.disarm();
        ctx.queues.preview.deinit();
        ctx.queues.hfr.deinit();
        self.join(preview.consumer);

        if preview.zsl_pool.is_some() {
            if let Err(e) = ctx.device.stop_stream(StreamKind::Zsl) {
                warn!("Cannot stop zsl stream: {}", e);
            }
        }
        if let Err(e) = ctx.device.stop_stream(StreamKind::Preview) {
            warn!("Cannot stop preview stream: {}", e);
        }
        preview.dispatch.disarm();
        ctx.queues.busy.deinit();
        self.join(preview.dispatch);

        ctx.set_active(StreamKind::Preview, None);
        ctx.set_active(StreamKind::Zsl, None);
        self.flush_stream_queues();
        ctx.clear_zsl();
        drop(ctx.device.unregister_buffers(BufferRole::Preview));
        if preview.zsl_pool.is_some() {
            drop(ctx.device.unregister_buffers(BufferRole::Zsl));
        }
        ctx.pause_preview(false);
        ctx.set_last_preview(None);
        ctx.set_hfr(false);
        drop(preview.preview_pool);
        drop(preview.raw_pool);
        drop(preview.zsl_pool);
        drop(preview.last_preview_pool);
        info!("Preview stopped");
    }

    fn start_recording_session(
        &self,
        params: &BufferParameters,
    ) -> Result<RecordSession, CameraError> {
        let ctx = &self.ctx;
        let pool = self.contiguous_pool(
            BufferRole::Record,
            "record",
            params.video_geometry(),
            self.config.num_record_buffers(),
        )?;

        ctx.queues.record.init();
        ctx.set_active(StreamKind::Video, pool.id());
        ctx.set_recording(true);

        let record_ctx = Arc::clone(ctx);
        let worker = match StageWorker::spawn(RECORD, move |control| {
            record_loop(record_ctx, control)
        }) {
            Ok(worker) => worker,
            Err(e) => {
                self.abort_recording(None);
                return Err(e.into());
            }
        };

        let streaming = ctx
            .device
            .register_buffers(BufferRole::Record, hand_to_device(pool.acquire_all()))
            .and_then(|()| ctx.device.start_stream(StreamKind::Video));
        if let Err(e) = streaming {
            self.abort_recording(Some(worker));
            return Err(e.into());
        }

        Ok(RecordSession { pool, worker })
    }

    fn abort_recording(&self, worker: Option<StageWorker>) {
        let ctx = &self.ctx;
        ctx.set_recording(false);
        if let Some(worker) = worker.as_ref() {
            worker.disarm();
        }
        if let Err(e) = ctx.device.stop_stream(StreamKind::Video) {
            debug!("Cannot stop video stream: {}", e);
        }
        ctx.queues.record.deinit();
        if let Some(worker) = worker {
            self.join(worker);
        }
        ctx.set_active(StreamKind::Video, None);
        drop(ctx.queues.record.flush());
        drop(ctx.device.unregister_buffers(BufferRole::Record));
    }

    fn stop_recording_locked(&self, session: &mut Session) {
        let Some(recording) = session.recording.take() else {
            return;
        };
        let ctx = &self.ctx;

        let live = matches!(
            ctx.still.lock().unwrap().phase,
            StillPhase::Capturing(SnapshotKind::Live) | StillPhase::Cancelling(SnapshotKind::Live)
        );
        if live {
            debug!("Cancelling live snapshot");
            self.stop_still(std::mem::take(&mut session.still));
        }

        ctx.set_recording(false);
        recording.worker.disarm();
        ctx.queues.record.deinit();
        self.join(recording.worker);

        if let Err(e) = ctx.device.stop_stream(StreamKind::Video) {
            warn!("Cannot stop video stream: {}", e);
        }
        ctx.set_active(StreamKind::Video, None);
        drop(ctx.queues.record.flush());
        drop(ctx.device.unregister_buffers(BufferRole::Record));
        drop(recording.pool);
        info!("Recording stopped");
    }

    /// Arm the still stages and hand the capture buffers to the device, or
    /// the already captured picture to the snapshot stage.
    fn start_still(
        &self,
        session: &mut Session,
        mut request: SnapshotRequest,
        output: FrameBuffer,
        job: StillJob,
        source: StillSource,
    ) -> Result<(), CameraError> {
        let ctx = &self.ctx;
        let kind = request.kind;

        ctx.queues.still.init();
        ctx.queues.jpeg.init();
        {
            let mut still = ctx.still.lock().unwrap();
            still.phase = StillPhase::Capturing(kind);
            if kind == SnapshotKind::Live {
                still.live = LiveSnapshotState::InProgress;
            }
        }
        if kind == SnapshotKind::Normal && source == StillSource::Device {
            ctx.pause_preview(true);
        }

        let jpeg_ctx = Arc::clone(ctx);
        let jpeg = match StageWorker::spawn(JPEG, move |control| jpeg_loop(jpeg_ctx, control, job)) {
            Ok(worker) => worker,
            Err(e) => {
                self.stop_still(Vec::new());
                return Err(e.into());
            }
        };
        let snapshot_ctx = Arc::clone(ctx);
        let snapshot = match StageWorker::spawn(SNAPSHOT, move |control| {
            snapshot_loop(snapshot_ctx, control, output, JPEG_QUALITY)
        }) {
            Ok(worker) => worker,
            Err(e) => {
                self.stop_still(vec![jpeg]);
                return Err(e.into());
            }
        };

        match source {
            StillSource::Device => {
                request.main.hand_off(Owner::Device);
                if let Some(postview) = request.postview.as_mut() {
                    postview.hand_off(Owner::Device);
                }
                if let Err(e) = ctx.device.start_snapshot(request) {
                    error!("Cannot start still capture: {}", e);
                    self.stop_still(vec![snapshot, jpeg]);
                    return Err(e.into());
                }
            }
            StillSource::Ring => {
                request.main.hand_off(Owner::Queue);
                let posted = ctx.queues.still.add(StillEvent::Shutter).is_ok()
                    && ctx.queues.still.add(StillEvent::Raw(request)).is_ok();
                if !posted {
                    error!("Cannot queue zero shutter lag picture");
                    self.stop_still(vec![snapshot, jpeg]);
                    return Err(CameraError::BufferBusy(BufferRole::Zsl));
                }
            }
        }

        session.still = vec![snapshot, jpeg];
        Ok(())
    }

    /// Stop the still capture in progress without waiting for its stages.
    fn interrupt_still(&self, workers: &[StageWorker]) {
        let ctx = &self.ctx;
        {
            let mut still = ctx.still.lock().unwrap();
            if let StillPhase::Capturing(kind) = still.phase {
                still.phase = StillPhase::Cancelling(kind);
                if kind == SnapshotKind::Live {
                    still.live = LiveSnapshotState::Stopped;
                }
            }
        }
        for worker in workers {
            worker.disarm();
        }
        ctx.device.cancel_snapshot();
        ctx.queues.still.deinit();
        ctx.queues.jpeg.deinit();
    }

    fn stop_still(&self, workers: Vec<StageWorker>) {
        let ctx = &self.ctx;
        let capturing = ctx.still.lock().unwrap().phase != StillPhase::Idle;
        if capturing {
            self.interrupt_still(&workers);
        }
        for worker in workers {
            self.join(worker);
        }
        drop(ctx.queues.still.flush());
        drop(ctx.queues.jpeg.flush());

        // Normally done by the jpeg stage on exit, unless it never ran.
        let phase = ctx.still.lock().unwrap().phase;
        if let StillPhase::Capturing(kind) | StillPhase::Cancelling(kind) = phase {
            ctx.finish_still(kind, false);
        }
    }

    fn stop_autofocus_locked(&self, session: &mut Session) {
        let Some(worker) = session.autofocus.take() else {
            return;
        };
        worker.disarm();
        if self.ctx.focus.cancel() {
            self.ctx.device.abort_autofocus();
        }
        self.join(worker);
    }

    /// Bring the pipeline back to idle after the device died.
    fn teardown(&self) {
        let mut session = self.session.lock().unwrap();
        if session.preview.is_some() {
            warn!("Forcing pipeline teardown");
        }
        self.stop_preview_locked(&mut session);
    }
}

/// Camera pipeline driving an `ImagingDevice`.
///
/// All methods can be called from any thread, including from within the
/// callbacks invoked by the pipeline. Dropping the pipeline releases it.
pub struct CapturePipeline {
    shared: Arc<Shared>,
}

impl CapturePipeline {
    /// Attach to `device` and start the stages that run for the whole life of
    /// the pipeline.
    pub fn open(device: Arc<dyn ImagingDevice>, config: PipelineConfig) -> Result<Self, OpenError> {
        let ctx = Arc::new(PipelineContext::new(device, &config));

        let weak_ctx = Arc::downgrade(&ctx);
        ctx.device.attach(EventSink::new(move |event| match weak_ctx.upgrade() {
            Some(ctx) => ctx.route(event),
            None => trace!("Device event after release: {:?}", event),
        }))?;

        let params = BufferParameters::default();
        ctx.device.set_dimensions(&params)?;
        let analysis = Arc::new(AnalysisPools::create(&config)?);

        let shared = Arc::new(Shared {
            ctx: Arc::clone(&ctx),
            config,
            session: Default::default(),
            params: Mutex::new(params),
            analysis: Arc::clone(&analysis),
            service: Mutex::new(None),
            released: AtomicBool::new(false),
        });

        ctx.queues.service.init();
        let weak_shared: Weak<Shared> = Arc::downgrade(&shared);
        let service = StageWorker::spawn(SERVICE, move |control| {
            service_loop(ctx, control, analysis, || {
                if let Some(shared) = weak_shared.upgrade() {
                    shared.teardown();
                }
            })
        })?;
        *shared.service.lock().unwrap() = Some(service);

        info!("Pipeline opened");
        Ok(Self { shared })
    }

    pub fn set_callbacks(&self, callbacks: Option<Arc<dyn CameraCallbacks>>) {
        self.shared.ctx.messages.set_callbacks(callbacks);
    }

    pub fn enable_msg_type(&self, msg: MsgType) {
        self.shared.ctx.messages.enable(msg);
    }

    pub fn disable_msg_type(&self, msg: MsgType) {
        self.shared.ctx.messages.disable(msg);
    }

    /// Whether any of the messages of `msg` is enabled.
    pub fn msg_type_enabled(&self, msg: MsgType) -> bool {
        self.shared.ctx.messages.enabled(msg)
    }

    /// Replace the parameter set.
    ///
    /// The whole set is validated before anything is applied. Changing the
    /// preview geometry or the high frame rate mode is rejected while
    /// previewing, changing the video size is rejected while recording.
    /// Picture and thumbnail sizes take effect at the next still capture,
    /// except in zero shutter lag mode where they shape the ring and cannot
    /// change while previewing.
    pub fn set_parameters(&self, new: BufferParameters) -> Result<(), CameraError> {
        new.validate()?;

        let session = self.shared.lock_session()?;
        let mut params = self.shared.params.lock().unwrap();
        let changes = new.changes_from(&params);
        let state = self.shared.state(&session);

        let ring = params.zsl && changes.still;
        if session.preview.is_some() && (changes.preview || changes.hfr || ring) {
            return Err(CameraError::InvalidState {
                op: "change the preview size, format or frame rate",
                state,
            });
        }
        if session.recording.is_some() && changes.video {
            return Err(CameraError::InvalidState {
                op: "change the video size",
                state,
            });
        }
        if !changes.any() {
            return Ok(());
        }

        let device = &self.shared.ctx.device;
        device.set_dimensions(&new)?;
        let mut updates = Vec::new();
        if changes.hfr {
            updates.push((
                DeviceParm::HighFrameRate(new.hfr),
                DeviceParm::HighFrameRate(params.hfr),
            ));
        }
        if new.histogram != params.histogram {
            updates.push((
                DeviceParm::Histogram(new.histogram),
                DeviceParm::Histogram(params.histogram),
            ));
        }
        if new.face_detection != params.face_detection {
            updates.push((
                DeviceParm::FaceDetection(new.face_detection),
                DeviceParm::FaceDetection(params.face_detection),
            ));
        }
        for (applied, (parm, _)) in updates.iter().enumerate() {
            if let Err(e) = device.configure(*parm) {
                warn!("Device refused {:?}, restoring previous parameters", parm);
                for (_, previous) in updates[..applied].iter().rev() {
                    if let Err(e) = device.configure(*previous) {
                        error!("Failed to restore {:?}: {}", previous, e);
                    }
                }
                if let Err(e) = device.set_dimensions(&params) {
                    error!("Failed to restore previous dimensions: {}", e);
                }
                return Err(e.into());
            }
        }
        self.shared.ctx.set_histogram(new.histogram);
        self.shared.ctx.set_face_detection(new.face_detection);

        debug!("Parameters updated: {:?}", changes);
        *params = new;
        Ok(())
    }

    pub fn parameters(&self) -> BufferParameters {
        self.shared.params.lock().unwrap().clone()
    }

    /// Start streaming preview frames. Does nothing if already previewing.
    pub fn start_preview(&self) -> Result<(), CameraError> {
        let mut session = self.shared.lock_session()?;
        if session.preview.is_some() {
            debug!("Preview already running");
            return Ok(());
        }

        let params = self.shared.params.lock().unwrap().clone();
        let preview = self.shared.start_preview_session(&params)?;
        session.preview = Some(preview);
        info!(
            "Preview started ({} {:?}{})",
            params.preview_size,
            params.preview_format,
            params
                .hfr
                .map(|rate| format!(", {} fps", rate.fps()))
                .unwrap_or_default()
        );
        Ok(())
    }

    /// Stop every activity and go back to idle. Does nothing if idle.
    pub fn stop_preview(&self) -> Result<(), CameraError> {
        let mut session = self.shared.lock_session()?;
        self.shared.stop_preview_locked(&mut session);
        Ok(())
    }

    pub fn preview_enabled(&self) -> bool {
        self.shared.session.lock().unwrap().preview.is_some()
    }

    pub fn start_recording(&self) -> Result<(), CameraError> {
        let mut session = self.shared.lock_session()?;
        match self.shared.state(&session) {
            CaptureState::PreviewRunning => (),
            CaptureState::RecordingRunning => return Ok(()),
            state => {
                return Err(CameraError::InvalidState {
                    op: "start recording",
                    state,
                })
            }
        }

        let params = self.shared.params.lock().unwrap().clone();
        let recording = self.shared.start_recording_session(&params)?;
        session.recording = Some(recording);
        info!("Recording started ({})", params.video_size);
        Ok(())
    }

    /// Stop recording, cancelling a live snapshot in progress. Does nothing
    /// if not recording.
    pub fn stop_recording(&self) -> Result<(), CameraError> {
        let mut session = self.shared.lock_session()?;
        self.shared.stop_recording_locked(&mut session);
        Ok(())
    }

    pub fn recording_enabled(&self) -> bool {
        self.shared.session.lock().unwrap().recording.is_some()
    }

    /// Give a video frame back. Equivalent to dropping it.
    pub fn release_recording_frame(&self, frame: RecordingFrame) {
        trace!("Releasing recording frame {}", frame.sequence());
        drop(frame);
    }

    /// Capture a full resolution picture. Preview delivery pauses until the
    /// picture is encoded, showing the last preview frame meanwhile. In zero
    /// shutter lag mode the most recent ring frame is encoded instead and
    /// preview goes on.
    pub fn take_picture(&self) -> Result<(), CameraError> {
        let mut session = self.shared.lock_session()?;
        let state = self.shared.state(&session);
        if state != CaptureState::PreviewRunning {
            return Err(CameraError::InvalidState {
                op: "take a picture",
                state,
            });
        }
        for worker in std::mem::take(&mut session.still) {
            self.shared.join(worker);
        }

        let params = self.shared.params.lock().unwrap().clone();
        let zsl = session
            .preview
            .as_ref()
            .map_or(false, |preview| preview.zsl_pool.is_some());
        if zsl {
            return self.take_zsl_picture(&mut session, &params);
        }
        let picture = params.picture_geometry();
        let thumbnail = params.thumbnail_geometry();

        let main = {
            let Some(preview) = session.preview.as_mut() else {
                return Err(CameraError::InvalidState {
                    op: "take a picture",
                    state,
                });
            };
            let stale = preview.raw_pool.request().buffer_size != picture.frame_size;
            let main = if stale { None } else { preview.raw_pool.acquire() };
            match main {
                Some(main) => main,
                None => {
                    debug!("Recreating raw picture pool for {}", params.picture_size);
                    preview.raw_pool =
                        self.shared
                            .contiguous_pool(BufferRole::Snapshot, "raw", picture, 1)?;
                    preview
                        .raw_pool
                        .acquire()
                        .ok_or(CameraError::BufferBusy(BufferRole::Snapshot))?
                }
            }
        };

        let postview_pool =
            self.shared
                .contiguous_pool(BufferRole::Thumbnail, "postview", thumbnail, 1)?;
        let jpeg_pool = AnonymousBufferPool::create(
            BufferRole::Jpeg,
            PoolRequest::new("jpeg", params.jpeg_max_size(params.picture_size), 1),
        )
        .check()?;
        let postview = postview_pool.acquire();
        let output = jpeg_pool
            .acquire()
            .ok_or(CameraError::BufferBusy(BufferRole::Jpeg))?;

        let request = SnapshotRequest {
            kind: SnapshotKind::Normal,
            main,
            postview,
        };
        let job = StillJob {
            kind: SnapshotKind::Normal,
            pools: vec![Box::new(postview_pool), Box::new(jpeg_pool)],
        };
        self.shared
            .start_still(&mut session, request, output, job, StillSource::Device)?;
        info!("Taking picture ({})", params.picture_size);
        Ok(())
    }

    /// Encode the most recent frame of the zero shutter lag ring. Preview
    /// delivery goes on during the capture.
    fn take_zsl_picture(
        &self,
        session: &mut Session,
        params: &BufferParameters,
    ) -> Result<(), CameraError> {
        let ctx = &self.shared.ctx;

        // Buffers of cancelled or failed captures went back to the pool.
        if let Some(zsl_pool) = session.preview.as_ref().and_then(|p| p.zsl_pool.as_ref()) {
            let lost = zsl_pool.acquire_all();
            if !lost.is_empty() {
                debug!("Giving {} zsl buffers back to the device", lost.len());
                ctx.device
                    .register_buffers(BufferRole::Zsl, hand_to_device(lost))?;
            }
        }

        let main = ctx
            .take_zsl()
            .ok_or(CameraError::BufferBusy(BufferRole::Zsl))?
            .buffer;
        let jpeg_pool = AnonymousBufferPool::create(
            BufferRole::Jpeg,
            PoolRequest::new("jpeg", params.jpeg_max_size(params.picture_size), 1),
        )
        .check()?;
        let output = jpeg_pool
            .acquire()
            .ok_or(CameraError::BufferBusy(BufferRole::Jpeg))?;

        let request = SnapshotRequest {
            kind: SnapshotKind::Normal,
            main,
            postview: None,
        };
        let job = StillJob {
            kind: SnapshotKind::Normal,
            pools: vec![Box::new(jpeg_pool)],
        };
        self.shared
            .start_still(session, request, output, job, StillSource::Ring)?;
        info!("Taking zero shutter lag picture ({})", params.picture_size);
        Ok(())
    }

    /// Capture a frame of the video stream while recording.
    pub fn take_live_snapshot(&self) -> Result<(), CameraError> {
        let mut session = self.shared.lock_session()?;
        let state = self.shared.state(&session);
        if state != CaptureState::RecordingRunning {
            return Err(CameraError::InvalidState {
                op: "take a live snapshot",
                state,
            });
        }
        for worker in std::mem::take(&mut session.still) {
            self.shared.join(worker);
        }

        let params = self.shared.params.lock().unwrap().clone();
        let live_pool = self.shared.contiguous_pool(
            BufferRole::LiveSnapshot,
            "live snapshot",
            params.video_geometry(),
            1,
        )?;
        let jpeg_pool = AnonymousBufferPool::create(
            BufferRole::Jpeg,
            PoolRequest::new("live jpeg", params.jpeg_max_size(params.video_size), 1),
        )
        .check()?;
        let main = live_pool
            .acquire()
            .ok_or(CameraError::BufferBusy(BufferRole::LiveSnapshot))?;
        let output = jpeg_pool
            .acquire()
            .ok_or(CameraError::BufferBusy(BufferRole::Jpeg))?;

        let request = SnapshotRequest {
            kind: SnapshotKind::Live,
            main,
            postview: None,
        };
        let job = StillJob {
            kind: SnapshotKind::Live,
            pools: vec![Box::new(live_pool), Box::new(jpeg_pool)],
        };
        self.shared
            .start_still(&mut session, request, output, job, StillSource::Device)?;
        info!("Taking live snapshot ({})", params.video_size);
        Ok(())
    }

    /// Abandon the still capture in progress, if any. Returns immediately,
    /// no image will be delivered.
    pub fn cancel_picture(&self) -> Result<(), CameraError> {
        let session = self.shared.lock_session()?;
        if self.shared.ctx.still.lock().unwrap().phase == StillPhase::Idle {
            return Ok(());
        }
        debug!("Cancelling still capture");
        self.shared.interrupt_still(&session.still);
        Ok(())
    }

    /// Start an autofocus sweep. A `FOCUS` message reports its outcome.
    pub fn auto_focus(&self) -> Result<(), CameraError> {
        let mut session = self.shared.lock_session()?;
        let state = self.shared.state(&session);
        if state == CaptureState::Idle {
            return Err(CameraError::InvalidState {
                op: "autofocus",
                state,
            });
        }

        let ctx = &self.shared.ctx;
        if !ctx.focus.arm() {
            debug!("Autofocus already in progress");
            return Ok(());
        }
        if let Some(previous) = session.autofocus.take() {
            self.shared.join(previous);
        }

        let focus_ctx = Arc::clone(ctx);
        match StageWorker::spawn(AUTOFOCUS, move |control| autofocus_loop(focus_ctx, control)) {
            Ok(worker) => {
                session.autofocus = Some(worker);
                Ok(())
            }
            Err(e) => {
                ctx.focus.cancel();
                Err(e.into())
            }
        }
    }

    /// Abandon the autofocus in progress, which reports failure.
    pub fn cancel_auto_focus(&self) -> Result<(), CameraError> {
        // Does not take the session lock: a teardown in progress may hold it.
        if self.shared.released.load(Ordering::SeqCst) {
            return Err(CameraError::Released);
        }
        let ctx = &self.shared.ctx;
        if ctx.focus.cancel() {
            debug!("Cancelling autofocus");
            ctx.device.abort_autofocus();
        }
        Ok(())
    }

    pub fn send_command(&self, command: Command) -> Result<(), CameraError> {
        let _session = self.shared.lock_session()?;
        let mut params = self.shared.params.lock().unwrap();
        let ctx = &self.shared.ctx;

        match command {
            Command::StartHistogram | Command::StopHistogram => {
                let enabled = command == Command::StartHistogram;
                ctx.device.configure(DeviceParm::Histogram(enabled))?;
                ctx.set_histogram(enabled);
                params.histogram = enabled;
            }
            Command::StartFaceDetection | Command::StopFaceDetection => {
                let enabled = command == Command::StartFaceDetection;
                ctx.device.configure(DeviceParm::FaceDetection(enabled))?;
                ctx.set_face_detection(enabled);
                params.face_detection = enabled;
            }
        }
        debug!("Command {:?} applied", command);
        Ok(())
    }

    /// Install the display preview frames are rendered to.
    pub fn set_overlay(&self, overlay: Option<Arc<dyn Overlay>>) {
        *self.shared.ctx.overlay.lock().unwrap() = overlay;
    }

    pub fn use_overlay(&self) -> bool {
        self.shared.ctx.overlay.lock().unwrap().is_some()
    }

    pub fn state(&self) -> CaptureState {
        let session = self.shared.session.lock().unwrap();
        self.shared.state(&session)
    }

    pub fn status(&self) -> CaptureStatus {
        let session = self.shared.session.lock().unwrap();
        let state = self.shared.state(&session);
        let live_snapshot = self.shared.ctx.still.lock().unwrap().live;
        CaptureStatus {
            state,
            autofocus: self.shared.ctx.focus.is_active(),
            live_snapshot,
        }
    }

    /// The preview frame kept on display while the last picture was taken,
    /// if preview delivery has been paused since preview started.
    pub fn last_preview_frame(&self) -> Option<Vec<u8>> {
        self.shared.ctx.last_preview_frame()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.ctx.stats()
    }

    /// Write the state of the pipeline and of all its pools into `out`.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let session = self.shared.session.lock().unwrap();
        let state = self.shared.state(&session);
        writeln!(out, "capture pipeline: {}", state)?;
        writeln!(out, "parameters: {:?}", *self.shared.params.lock().unwrap())?;
        writeln!(out, "{:?}", self.shared.ctx.stats())?;

        if let Some(preview) = session.preview.as_ref() {
            preview.preview_pool.dump(out)?;
            preview.raw_pool.dump(out)?;
            if let Some(zsl_pool) = preview.zsl_pool.as_ref() {
                zsl_pool.dump(out)?;
            }
            preview.last_preview_pool.dump(out)?;
        }
        if let Some(recording) = session.recording.as_ref() {
            recording.pool.dump(out)?;
        }
        self.shared.analysis.dump(out)
    }

    /// Stop everything, including the stages running for the whole life of
    /// the pipeline. Every other operation fails afterwards.
    pub fn release(&self) {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut session = self.shared.session.lock().unwrap();
            self.shared.stop_preview_locked(&mut session);
            if let Some(worker) = session.autofocus.take() {
                self.shared.join(worker);
            }
        }

        let ctx = &self.shared.ctx;
        let service = self.shared.service.lock().unwrap().take();
        if let Some(service) = service {
            service.disarm();
            ctx.queues.service.deinit();
            self.shared.join(service);
        }
        drop(ctx.queues.service.flush());
        info!("Pipeline released");
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{
        ERROR_DETAIL_ENCODE, ERROR_DETAIL_FATAL, ERROR_SERVER_DIED, ERROR_UNKNOWN,
    };
    use crate::device::sim::{FocusBehavior, SimConfig, SimFault, SimulatedDevice};
    use crate::device::DeviceEvent;
    use crate::memory::ContiguousSource;
    use crate::params::{HfrRate, Size};

    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Recorder {
        notifications: Mutex<Vec<(MsgType, i32, i32)>>,
        data: Mutex<Vec<(MsgType, Vec<u8>)>>,
        preview_frames: AtomicUsize,
        video_frames: Mutex<Vec<RecordingFrame>>,
    }

    impl Recorder {
        fn notified(&self, msg: MsgType, ext1: i32, ext2: i32) -> usize {
            self.notifications
                .lock()
                .unwrap()
                .iter()
                .filter(|n| **n == (msg, ext1, ext2))
                .count()
        }

        fn images(&self, msg: MsgType) -> Vec<Vec<u8>> {
            self.data
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| *m == msg)
                .map(|(_, data)| data.clone())
                .collect()
        }
    }

    impl CameraCallbacks for Recorder {
        fn notify(&self, msg: MsgType, ext1: i32, ext2: i32) {
            self.notifications.lock().unwrap().push((msg, ext1, ext2));
        }

        fn data(&self, msg: MsgType, data: &[u8]) {
            // Preview frames are only counted, they are big and numerous.
            if msg == MsgType::PREVIEW_FRAME {
                self.preview_frames.fetch_add(1, Ordering::SeqCst);
            } else {
                self.data.lock().unwrap().push((msg, data.to_vec()));
            }
        }

        fn data_timestamp(&self, _msg: MsgType, frame: RecordingFrame, _timestamp: Duration) {
            self.video_frames.lock().unwrap().push(frame);
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < TIMEOUT {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn open_with(
        sim: SimConfig,
        config: PipelineConfig,
    ) -> (Arc<SimulatedDevice>, CapturePipeline, Arc<Recorder>) {
        let device = Arc::new(SimulatedDevice::new(sim));
        let pipeline = CapturePipeline::open(device.clone(), config).unwrap();
        let recorder = Arc::new(Recorder::default());
        pipeline.set_callbacks(Some(recorder.clone()));
        (device, pipeline, recorder)
    }

    fn open() -> (Arc<SimulatedDevice>, CapturePipeline, Arc<Recorder>) {
        open_with(SimConfig::new(), PipelineConfig::new())
    }

    fn small_pictures(pipeline: &CapturePipeline) {
        pipeline
            .set_parameters(BufferParameters {
                picture_size: Size::new(640, 480),
                thumbnail_size: Size::new(160, 120),
                ..pipeline.parameters()
            })
            .unwrap();
    }

    #[test]
    fn test_recording_needs_preview() {
        let (device, pipeline, _) = open();
        assert_eq!(pipeline.state(), CaptureState::Idle);

        let err = pipeline.start_recording().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(!device.is_streaming(StreamKind::Video));

        pipeline.start_preview().unwrap();
        pipeline.start_recording().unwrap();
        assert_eq!(pipeline.state(), CaptureState::RecordingRunning);
        assert!(pipeline.recording_enabled());
        assert!(device.is_streaming(StreamKind::Video));
        assert_eq!(device.free_buffers(BufferRole::Record), 9);

        pipeline.stop_recording().unwrap();
        assert_eq!(pipeline.state(), CaptureState::PreviewRunning);
        assert!(!device.is_registered(BufferRole::Record));
        pipeline.stop_recording().unwrap();
    }

    #[test]
    fn test_stop_preview_twice() {
        let (device, pipeline, _) = open();
        pipeline.start_preview().unwrap();
        pipeline.start_preview().unwrap();
        assert!(pipeline.preview_enabled());
        assert!(device.is_streaming(StreamKind::Preview));

        pipeline.stop_preview().unwrap();
        assert_eq!(pipeline.state(), CaptureState::Idle);
        assert!(!device.is_streaming(StreamKind::Preview));
        assert!(!device.is_registered(BufferRole::Preview));

        pipeline.stop_preview().unwrap();
        assert_eq!(pipeline.state(), CaptureState::Idle);
    }

    #[test]
    fn test_preview_frames_flow_back() {
        let (device, pipeline, recorder) =
            open_with(SimConfig::new(), PipelineConfig::new().preview_buffers(4));
        pipeline.enable_msg_type(MsgType::PREVIEW_FRAME);
        pipeline.start_preview().unwrap();
        assert_eq!(device.free_buffers(BufferRole::Preview), 4);

        assert_eq!(device.signal_frames(StreamKind::Preview, 10, TIMEOUT), 10);
        assert!(wait_for(|| device.released_frames(StreamKind::Preview) == 10));

        let stats = pipeline.stats();
        assert_eq!(stats.frames_received, 10);
        assert_eq!(stats.preview_forwarded, 10);
        assert_eq!(stats.preview_delivered, 10);
        assert_eq!(stats.frames_returned, 10);
        assert_eq!(recorder.preview_frames.load(Ordering::SeqCst), 10);
        assert!(wait_for(|| device.free_buffers(BufferRole::Preview) == 4));

        pipeline.stop_preview().unwrap();
        assert_eq!(device.released_frames(StreamKind::Preview), 10);
    }

    #[test]
    fn test_masked_preview_frames() {
        let (device, pipeline, recorder) = open();
        pipeline.start_preview().unwrap();

        assert_eq!(device.signal_frames(StreamKind::Preview, 5, TIMEOUT), 5);
        assert!(wait_for(|| device.released_frames(StreamKind::Preview) == 5));
        assert_eq!(recorder.preview_frames.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.stats().preview_forwarded, 5);
        assert_eq!(pipeline.stats().preview_delivered, 0);
        assert!(!pipeline.msg_type_enabled(MsgType::PREVIEW_FRAME));
    }

    #[test]
    fn test_hfr_decimation() {
        let (device, pipeline, recorder) = open();
        pipeline
            .set_parameters(BufferParameters {
                preview_size: Size::new(800, 480),
                hfr: Some(HfrRate::Fps120),
                ..Default::default()
            })
            .unwrap();
        assert!(device
            .configured()
            .contains(&DeviceParm::HighFrameRate(Some(HfrRate::Fps120))));

        pipeline.enable_msg_type(MsgType::PREVIEW_FRAME);
        pipeline.start_preview().unwrap();
        assert_eq!(device.signal_frames(StreamKind::Preview, 8, TIMEOUT), 8);
        assert!(wait_for(|| device.released_frames(StreamKind::Preview) == 8));
        assert_eq!(recorder.preview_frames.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_take_picture() {
        let (device, pipeline, recorder) = open();
        small_pictures(&pipeline);
        pipeline.enable_msg_type(
            MsgType::SHUTTER | MsgType::RAW_IMAGE_NOTIFY | MsgType::COMPRESSED_IMAGE,
        );

        let err = pipeline.take_picture().unwrap_err();
        assert!(matches!(
            err,
            CameraError::InvalidState {
                state: CaptureState::Idle,
                ..
            }
        ));

        pipeline.start_preview().unwrap();
        pipeline.take_picture().unwrap();
        assert!(wait_for(|| recorder.images(MsgType::COMPRESSED_IMAGE).len() == 1));
        assert!(wait_for(|| pipeline.state() == CaptureState::PreviewRunning));

        let jpeg = &recorder.images(MsgType::COMPRESSED_IMAGE)[0];
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xff, 0xd9]);
        assert_eq!(recorder.notified(MsgType::SHUTTER, 0, 0), 1);
        assert_eq!(recorder.notified(MsgType::RAW_IMAGE_NOTIFY, 0, 0), 1);
        assert_eq!(pipeline.stats().pictures_taken, 1);
        assert!(device.is_streaming(StreamKind::Preview));

        // A second picture reuses the raw pool.
        pipeline.take_picture().unwrap();
        assert!(wait_for(|| recorder.images(MsgType::COMPRESSED_IMAGE).len() == 2));
        assert!(wait_for(|| pipeline.stats().pictures_taken == 2));
    }

    #[test]
    fn test_picture_size_change_recreates_raw_pool() {
        let (_, pipeline, recorder) = open();
        pipeline.enable_msg_type(MsgType::COMPRESSED_IMAGE);
        pipeline.start_preview().unwrap();

        let mut dump = String::new();
        pipeline.dump(&mut dump).unwrap();
        assert!(!dump.contains(&format!("1 x {} bytes", 320 * 240 * 3 / 2)));

        pipeline
            .set_parameters(BufferParameters {
                picture_size: Size::new(320, 240),
                ..pipeline.parameters()
            })
            .unwrap();
        pipeline.take_picture().unwrap();
        assert!(wait_for(|| recorder.images(MsgType::COMPRESSED_IMAGE).len() == 1));

        let mut dump = String::new();
        pipeline.dump(&mut dump).unwrap();
        assert!(dump.contains(&format!("1 x {} bytes", 320 * 240 * 3 / 2)));
    }

    #[test]
    fn test_encode_failure() {
        let (device, pipeline, recorder) = open();
        small_pictures(&pipeline);
        pipeline.enable_msg_type(MsgType::ERROR | MsgType::COMPRESSED_IMAGE);
        pipeline.start_preview().unwrap();

        device.set_fault(SimFault::Encode, true);
        pipeline.take_picture().unwrap();
        assert!(wait_for(
            || recorder.notified(MsgType::ERROR, ERROR_UNKNOWN, ERROR_DETAIL_ENCODE) == 1
        ));
        assert!(wait_for(|| pipeline.state() == CaptureState::PreviewRunning));
        assert!(recorder.images(MsgType::COMPRESSED_IMAGE).is_empty());
        assert_eq!(pipeline.stats().encode_failures, 1);

        device.set_fault(SimFault::Encode, false);
        pipeline.take_picture().unwrap();
        assert!(wait_for(|| recorder.images(MsgType::COMPRESSED_IMAGE).len() == 1));
    }

    #[test]
    fn test_snapshot_failure_leaves_preview_running() {
        let (device, pipeline, _) = open();
        small_pictures(&pipeline);
        pipeline.start_preview().unwrap();

        device.set_fault(SimFault::Snapshot, true);
        let err = pipeline.take_picture().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(pipeline.state(), CaptureState::PreviewRunning);
    }

    #[test]
    fn test_cancel_picture() {
        let (_, pipeline, recorder) = open();
        small_pictures(&pipeline);
        pipeline.enable_msg_type(MsgType::COMPRESSED_IMAGE);
        pipeline.cancel_picture().unwrap();

        pipeline.start_preview().unwrap();
        pipeline.take_picture().unwrap();
        pipeline.cancel_picture().unwrap();
        assert!(wait_for(|| pipeline.state() == CaptureState::PreviewRunning));
        assert!(recorder.images(MsgType::COMPRESSED_IMAGE).len() <= 1);

        // The pipeline is ready for the next capture.
        let before = recorder.images(MsgType::COMPRESSED_IMAGE).len();
        pipeline.take_picture().unwrap();
        assert!(wait_for(
            || recorder.images(MsgType::COMPRESSED_IMAGE).len() == before + 1
        ));
    }

    #[test]
    fn test_recording_frames_lent_to_consumer() {
        let (device, pipeline, recorder) = open();
        pipeline.enable_msg_type(MsgType::VIDEO_FRAME);
        pipeline.start_preview().unwrap();
        pipeline.start_recording().unwrap();

        assert_eq!(device.signal_frames(StreamKind::Video, 3, TIMEOUT), 3);
        assert!(wait_for(|| recorder.video_frames.lock().unwrap().len() == 3));
        assert_eq!(device.released_frames(StreamKind::Video), 0);
        assert_eq!(pipeline.stats().record_delivered, 3);

        let frames: Vec<RecordingFrame> = recorder.video_frames.lock().unwrap().drain(..).collect();
        for frame in frames {
            assert!(frame.data().is_some());
            pipeline.release_recording_frame(frame);
        }
        assert_eq!(device.released_frames(StreamKind::Video), 3);
    }

    #[test]
    fn test_live_snapshot() {
        let (_, pipeline, recorder) = open();
        pipeline.enable_msg_type(MsgType::COMPRESSED_IMAGE);
        pipeline.start_preview().unwrap();

        let err = pipeline.take_live_snapshot().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        pipeline.start_recording().unwrap();
        pipeline.take_live_snapshot().unwrap();
        assert!(wait_for(|| recorder.images(MsgType::COMPRESSED_IMAGE).len() == 1));
        assert!(wait_for(|| pipeline.state() == CaptureState::RecordingRunning));
        assert_eq!(pipeline.status().live_snapshot, LiveSnapshotState::Done);

        // A regular picture needs recording to stop first.
        let err = pipeline.take_picture().unwrap_err();
        assert!(matches!(
            err,
            CameraError::InvalidState {
                state: CaptureState::RecordingRunning,
                ..
            }
        ));
    }

    #[test]
    fn test_pool_failure_leaves_idle() {
        let config = PipelineConfig::new()
            .contiguous_source(ContiguousSource::DeviceNode("/nonexistent/camhal-pmem".into()));
        let (device, pipeline, _) = open_with(SimConfig::new(), config);

        let err = pipeline.start_preview().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(pipeline.state(), CaptureState::Idle);
        assert!(!device.is_registered(BufferRole::Preview));
        assert!(!device.is_streaming(StreamKind::Preview));
    }

    #[test]
    fn test_device_failure_unwinds_preview() {
        let (device, pipeline, _) = open();
        device.set_fault(SimFault::StartStream, true);

        let err = pipeline.start_preview().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(pipeline.state(), CaptureState::Idle);
        assert!(!device.is_registered(BufferRole::Preview));

        device.set_fault(SimFault::StartStream, false);
        pipeline.start_preview().unwrap();
        assert_eq!(pipeline.state(), CaptureState::PreviewRunning);
    }

    #[test]
    fn test_zsl_picture_from_ring() {
        let (device, pipeline, recorder) =
            open_with(SimConfig::new(), PipelineConfig::new().zsl_buffers(3));
        let zsl_params = BufferParameters {
            picture_size: Size::new(640, 480),
            thumbnail_size: Size::new(160, 120),
            zsl: true,
            ..pipeline.parameters()
        };
        pipeline.set_parameters(zsl_params.clone()).unwrap();
        pipeline.enable_msg_type(MsgType::SHUTTER | MsgType::COMPRESSED_IMAGE);
        pipeline.start_preview().unwrap();
        assert!(device.is_streaming(StreamKind::Zsl));
        assert_eq!(device.free_buffers(BufferRole::Zsl), 3);

        // Nothing captured yet.
        assert!(matches!(
            pipeline.take_picture(),
            Err(CameraError::BufferBusy(BufferRole::Zsl))
        ));
        assert_eq!(pipeline.state(), CaptureState::PreviewRunning);

        // The ring shapes the picture, its size is fixed while previewing.
        let err = pipeline
            .set_parameters(BufferParameters {
                picture_size: Size::new(1024, 768),
                ..zsl_params
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        // Only the newest frame is held, the others go back to the device.
        assert_eq!(device.signal_frames(StreamKind::Zsl, 3, TIMEOUT), 3);
        assert!(wait_for(|| device.released_frames(StreamKind::Zsl) == 2));

        // The picture is already there: the device is not asked for one.
        device.set_fault(SimFault::Snapshot, true);
        pipeline.take_picture().unwrap();
        assert!(wait_for(|| recorder.images(MsgType::COMPRESSED_IMAGE).len() == 1));
        assert!(wait_for(|| pipeline.state() == CaptureState::PreviewRunning));
        assert_eq!(recorder.notified(MsgType::SHUTTER, 0, 0), 1);
        assert_eq!(pipeline.stats().pictures_taken, 1);
        let jpeg = &recorder.images(MsgType::COMPRESSED_IMAGE)[0];
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);

        // The encoded ring buffer is filled again.
        assert!(wait_for(|| device.free_buffers(BufferRole::Zsl) == 3));

        pipeline.stop_preview().unwrap();
        assert!(!device.is_streaming(StreamKind::Zsl));
        assert!(!device.is_registered(BufferRole::Zsl));
    }

    #[test]
    fn test_registration_failure_unwinds_preview() {
        let (device, pipeline, _) = open();
        device.set_fault(SimFault::RegisterBuffers, true);

        let err = pipeline.start_preview().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(pipeline.state(), CaptureState::Idle);
        assert!(!device.is_registered(BufferRole::Preview));
        assert!(!device.is_streaming(StreamKind::Preview));

        let mut dump = String::new();
        pipeline.dump(&mut dump).unwrap();
        assert!(!dump.contains("pool preview"));
        assert!(!dump.contains("pool raw"));

        device.set_fault(SimFault::RegisterBuffers, false);
        pipeline.start_preview().unwrap();
        assert!(device.is_registered(BufferRole::Preview));
    }

    #[test]
    fn test_refused_parameters_leave_device_unchanged() {
        let (device, pipeline, _) = open();
        let before = pipeline.parameters();
        device.set_fault(SimFault::Configure, true);

        let err = pipeline
            .set_parameters(BufferParameters {
                preview_size: Size::new(800, 480),
                hfr: Some(HfrRate::Fps60),
                histogram: true,
                ..before.clone()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(pipeline.parameters(), before);
        assert_eq!(device.dimensions(), before);
        assert!(device.configured().is_empty());

        device.set_fault(SimFault::Configure, false);
        pipeline
            .set_parameters(BufferParameters {
                histogram: true,
                ..before.clone()
            })
            .unwrap();
        assert_eq!(device.dimensions(), pipeline.parameters());
    }

    #[test]
    fn test_refused_autofocus_reports_failure() {
        let (device, pipeline, recorder) = open();
        pipeline.enable_msg_type(MsgType::FOCUS);
        pipeline.start_preview().unwrap();
        device.set_fault(SimFault::Autofocus, true);

        pipeline.auto_focus().unwrap();
        assert!(wait_for(|| recorder.notified(MsgType::FOCUS, 0, 0) == 1));
        assert!(wait_for(|| !pipeline.status().autofocus));
        assert_eq!(recorder.notified(MsgType::FOCUS, 1, 0), 0);
        assert!(!device.is_focusing());
    }

    #[test]
    fn test_fatal_error_reported_once() {
        let (device, pipeline, recorder) = open();
        pipeline.enable_msg_type(MsgType::ERROR);
        pipeline.start_preview().unwrap();
        pipeline.start_recording().unwrap();

        device.inject(DeviceEvent::Fatal("sensor disconnected".into()));
        device.inject(DeviceEvent::Fatal("sensor disconnected".into()));
        assert!(wait_for(|| {
            recorder.notified(MsgType::ERROR, ERROR_SERVER_DIED, ERROR_DETAIL_FATAL) == 1
        }));
        assert!(wait_for(|| pipeline.stats().fatal_errors == 2));
        assert_eq!(pipeline.state(), CaptureState::Idle);
        assert_eq!(
            recorder.notified(MsgType::ERROR, ERROR_SERVER_DIED, ERROR_DETAIL_FATAL),
            1
        );
        assert!(!device.is_streaming(StreamKind::Preview));
        assert!(!device.is_streaming(StreamKind::Video));
        assert!(!device.is_registered(BufferRole::Record));
    }

    #[test]
    fn test_autofocus() {
        let (_, pipeline, recorder) = open_with(
            SimConfig::new().focus(FocusBehavior::Immediate(true)),
            PipelineConfig::new(),
        );
        pipeline.enable_msg_type(MsgType::FOCUS);

        let err = pipeline.auto_focus().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        pipeline.start_preview().unwrap();
        pipeline.auto_focus().unwrap();
        assert!(wait_for(|| recorder.notified(MsgType::FOCUS, 1, 0) == 1));
        assert!(wait_for(|| !pipeline.status().autofocus));
    }

    #[test]
    fn test_cancelled_autofocus_reports_failure() {
        let (device, pipeline, recorder) = open_with(
            SimConfig::new().focus(FocusBehavior::Manual),
            PipelineConfig::new(),
        );
        pipeline.enable_msg_type(MsgType::FOCUS);
        pipeline.start_preview().unwrap();

        pipeline.auto_focus().unwrap();
        assert!(wait_for(|| device.is_focusing()));
        assert!(pipeline.status().autofocus);

        pipeline.cancel_auto_focus().unwrap();
        assert!(wait_for(|| recorder.notified(MsgType::FOCUS, 0, 0) == 1));
        assert!(wait_for(|| !pipeline.status().autofocus));
        assert_eq!(recorder.notified(MsgType::FOCUS, 1, 0), 0);

        // Teardown cancels silently.
        pipeline.auto_focus().unwrap();
        assert!(wait_for(|| device.is_focusing()));
        pipeline.stop_preview().unwrap();
        assert_eq!(recorder.notified(MsgType::FOCUS, 0, 0), 1);
        assert!(!pipeline.status().autofocus);
    }

    #[test]
    fn test_parameter_rules() {
        let (device, pipeline, _) = open();

        let invalid = BufferParameters {
            preview_size: Size::new(641, 480),
            ..Default::default()
        };
        let err = pipeline.set_parameters(invalid).unwrap_err();
        assert!(matches!(err, CameraError::Parameters(_)));
        assert_eq!(pipeline.parameters(), BufferParameters::default());

        pipeline.start_preview().unwrap();
        let bigger_preview = BufferParameters {
            preview_size: Size::new(1280, 720),
            ..Default::default()
        };
        let err = pipeline.set_parameters(bigger_preview.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        let bigger_picture = BufferParameters {
            picture_size: Size::new(1024, 768),
            ..Default::default()
        };
        pipeline.set_parameters(bigger_picture.clone()).unwrap();
        assert_eq!(device.dimensions(), bigger_picture);

        pipeline.start_recording().unwrap();
        let bigger_video = BufferParameters {
            video_size: Size::new(1280, 720),
            ..bigger_picture
        };
        let err = pipeline.set_parameters(bigger_video.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        pipeline.stop_preview().unwrap();
        pipeline.set_parameters(bigger_video).unwrap();
        pipeline.set_parameters(bigger_preview).unwrap();
        assert_eq!(device.dimensions().preview_size, Size::new(1280, 720));
    }

    #[test]
    fn test_histogram_command() {
        let (device, pipeline, recorder) = open();
        pipeline.enable_msg_type(MsgType::STATS_DATA);

        device.inject(DeviceEvent::Statistics(vec![3; HISTOGRAM_BINS]));
        pipeline.send_command(Command::StartHistogram).unwrap();
        assert!(pipeline.parameters().histogram);
        assert!(device.configured().contains(&DeviceParm::Histogram(true)));

        device.inject(DeviceEvent::Statistics(vec![3; HISTOGRAM_BINS]));
        assert!(wait_for(|| recorder.images(MsgType::STATS_DATA).len() == 1));
        assert_eq!(recorder.images(MsgType::STATS_DATA)[0].len(), STATS_BUFFER_SIZE);

        pipeline.send_command(Command::StopHistogram).unwrap();
        assert!(!pipeline.parameters().histogram);
        device.inject(DeviceEvent::Statistics(vec![3; HISTOGRAM_BINS]));

        // Drain the service stage before counting.
        pipeline.enable_msg_type(MsgType::ERROR);
        device.inject(DeviceEvent::FrameTimeout);
        assert!(wait_for(|| pipeline.stats().frame_timeouts == 1));
        assert_eq!(recorder.images(MsgType::STATS_DATA).len(), 1);
    }

    #[test]
    fn test_frame_timeout_is_transient() {
        let (device, pipeline, recorder) = open();
        pipeline.enable_msg_type(MsgType::ERROR);
        pipeline.start_preview().unwrap();

        device.inject(DeviceEvent::FrameTimeout);
        assert!(wait_for(|| pipeline.stats().frame_timeouts == 1));
        assert!(wait_for(|| recorder.notified(
            MsgType::ERROR,
            ERROR_UNKNOWN,
            crate::callbacks::ERROR_DETAIL_FRAME_TIMEOUT
        ) == 1));
        assert_eq!(pipeline.state(), CaptureState::PreviewRunning);
    }

    #[test]
    fn test_overlay_renders_preview() {
        struct CountingOverlay(AtomicUsize);

        impl Overlay for CountingOverlay {
            fn render(&self, _buffer: &FrameBuffer) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let (device, pipeline, _) = open();
        let overlay = Arc::new(CountingOverlay(AtomicUsize::new(0)));
        assert!(!pipeline.use_overlay());
        pipeline.set_overlay(Some(overlay.clone()));
        assert!(pipeline.use_overlay());

        pipeline.start_preview().unwrap();
        assert_eq!(device.signal_frames(StreamKind::Preview, 3, TIMEOUT), 3);
        assert!(wait_for(|| overlay.0.load(Ordering::SeqCst) == 3));
    }

    #[test]
    fn test_stale_frames_after_restart() {
        let (device, pipeline, _) = open();
        pipeline.start_preview().unwrap();
        let stale = device.unregister_buffers(BufferRole::Preview);
        assert_eq!(stale.len(), 4);
        pipeline.stop_preview().unwrap();
        pipeline.start_preview().unwrap();

        for buffer in stale {
            device.inject(DeviceEvent::Frame(crate::device::Frame {
                buffer,
                kind: StreamKind::Preview,
                timestamp: Duration::ZERO,
                sequence: 0,
            }));
        }
        assert_eq!(pipeline.stats().stale_frames, 4);
        assert_eq!(device.released_frames(StreamKind::Preview), 0);
    }

    #[test]
    fn test_release() {
        let (device, pipeline, _) = open();
        pipeline.start_preview().unwrap();
        pipeline.start_recording().unwrap();

        pipeline.release();
        assert!(!device.is_streaming(StreamKind::Preview));
        assert!(matches!(pipeline.start_preview(), Err(CameraError::Released)));
        assert!(matches!(pipeline.cancel_auto_focus(), Err(CameraError::Released)));
        pipeline.release();
        drop(pipeline);

        // Events posted after release go nowhere.
        device.inject(DeviceEvent::Shutter);
    }
}
