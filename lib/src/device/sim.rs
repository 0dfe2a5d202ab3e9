//! A software imaging device.
//!
//! `SimulatedDevice` implements `ImagingDevice` without hardware. Nothing
//! happens on its own: frames are produced when `signal_frames` is called
//! (or by a `SensorThread`), focus completes immediately or when
//! `complete_focus` is called, and faults are injected explicitly. This
//! makes pipeline behavior reproducible in tests.
use super::{
    DeviceError, DeviceEvent, DeviceParm, EncodeDone, EncodeRequest, EventSink, Frame,
    ImagingDevice, SnapshotKind, SnapshotRequest, StreamKind,
};
use crate::memory::{BufferRole, FrameBuffer};
use crate::params::{BufferParameters, FrameGeometry};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerateFrameError {
    #[error("provided buffer is too small")]
    BufferTooSmall,
}

/// Fills YUV 4:2:0 frames with a moving pattern.
pub struct FrameGenerator {
    geometry: FrameGeometry,
    step: u32,
}

impl FrameGenerator {
    pub fn new(geometry: FrameGeometry) -> Self {
        FrameGenerator { geometry, step: 0 }
    }

    /// Start the pattern at `step` instead of 0.
    pub fn starting_at(geometry: FrameGeometry, step: u32) -> Self {
        FrameGenerator { geometry, step }
    }

    pub fn frame_size(&self) -> usize {
        self.geometry.frame_size
    }

    pub fn next_frame<S: AsMut<[u8]>>(&mut self, frame: &mut S) -> Result<(), GenerateFrameError> {
        let frame = frame.as_mut();

        if frame.len() < self.frame_size() {
            return Err(GenerateFrameError::BufferTooSmall);
        }

        self.gen_pattern(frame);
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    fn gen_pattern(&self, frame: &mut [u8]) {
        let width = self.geometry.size.width as usize;
        let luma_end = self.geometry.cbcr_offset;
        let (luma, chroma) = frame[..self.frame_size()].split_at_mut(luma_end);

        luma.chunks_mut(width.max(1))
            .enumerate()
            .for_each(|(y, line)| {
                line.iter_mut().enumerate().for_each(|(x, pixel)| {
                    *pixel = self.step.wrapping_add((x ^ y) as u32).to_le_bytes()[0];
                });
            });
        chroma.fill(128);
    }
}

/// Ways the simulated device completes autofocus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FocusBehavior {
    /// Report the given result as soon as autofocus starts.
    Immediate(bool),
    /// Wait for `SimulatedDevice::complete_focus`.
    Manual,
}

/// Operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimFault {
    Configure,
    RegisterBuffers,
    StartStream,
    Snapshot,
    /// Encoding is accepted but completes unsuccessfully.
    Encode,
    Autofocus,
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    focus: FocusBehavior,
    fragment_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            focus: FocusBehavior::Immediate(true),
            fragment_size: 16 * 1024,
        }
    }
}

impl SimConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn focus(self, focus: FocusBehavior) -> Self {
        SimConfig { focus, ..self }
    }

    /// Size of the chunks the encoder reports progress in.
    pub fn fragment_size(self, fragment_size: usize) -> Self {
        SimConfig {
            fragment_size: fragment_size.max(1),
            ..self
        }
    }
}

#[derive(Default)]
struct SimState {
    sink: Option<EventSink>,
    params: BufferParameters,
    parms: Vec<DeviceParm>,
    free: BTreeMap<BufferRole, VecDeque<FrameBuffer>>,
    streaming: BTreeSet<StreamKind>,
    sequence: u64,
    focusing: bool,
    faults: BTreeSet<SimFault>,
}

pub struct SimulatedDevice {
    config: SimConfig,
    state: Mutex<SimState>,
    buffer_available: Condvar,
    released_preview: AtomicU64,
    released_video: AtomicU64,
    released_zsl: AtomicU64,
    epoch: Instant,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimulatedDevice {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Default::default(),
            buffer_available: Condvar::new(),
            released_preview: AtomicU64::new(0),
            released_video: AtomicU64::new(0),
            released_zsl: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn sink(&self) -> Option<EventSink> {
        self.state.lock().unwrap().sink.clone()
    }

    fn fault(&self, fault: SimFault) -> bool {
        self.state.lock().unwrap().faults.contains(&fault)
    }

    /// Make `fault` happen (or stop happening) on the next operations.
    pub fn set_fault(&self, fault: SimFault, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        if enabled {
            state.faults.insert(fault);
        } else {
            state.faults.remove(&fault);
        }
    }

    /// Fill `count` buffers of the `kind` stream and post them. Each frame
    /// waits up to `timeout` for a free buffer while the stream is running.
    /// Returns the number of frames actually produced.
    pub fn signal_frames(&self, kind: StreamKind, count: usize, timeout: Duration) -> usize {
        let role = kind.role();
        let mut produced = 0;

        while produced < count {
            let (sink, mut buffer, sequence, geometry) = {
                let state = self.state.lock().unwrap();
                let (mut state, _) = self
                    .buffer_available
                    .wait_timeout_while(state, timeout, |s| {
                        !s.streaming.contains(&kind)
                            || s.free.get(&role).map_or(true, |f| f.is_empty())
                    })
                    .unwrap();
                if !state.streaming.contains(&kind) {
                    break;
                }
                let Some(sink) = state.sink.clone() else {
                    break;
                };
                let Some(buffer) = state.free.get_mut(&role).and_then(|f| f.pop_front()) else {
                    break;
                };
                state.sequence += 1;
                let geometry = match kind {
                    StreamKind::Preview => state.params.preview_geometry(),
                    StreamKind::Video => state.params.video_geometry(),
                    StreamKind::Zsl => state.params.picture_geometry(),
                };
                (sink, buffer, state.sequence, geometry)
            };

            fill(&mut buffer, geometry, sequence as u32);
            trace!("Producing {} frame {} in buffer {}", kind, sequence, buffer.index());
            sink.post(DeviceEvent::Frame(Frame {
                buffer,
                kind,
                timestamp: self.epoch.elapsed(),
                sequence,
            }));
            produced += 1;
        }

        produced
    }

    /// Complete a pending autofocus. Returns whether one was pending.
    pub fn complete_focus(&self, success: bool) -> bool {
        let sink = {
            let mut state = self.state.lock().unwrap();
            if !state.focusing {
                return false;
            }
            state.focusing = false;
            state.sink.clone()
        };

        if let Some(sink) = sink {
            sink.post(DeviceEvent::FocusDone(success));
        }
        true
    }

    /// Post an arbitrary event, e.g. statistics or an error.
    pub fn inject(&self, event: DeviceEvent) {
        if let Some(sink) = self.sink() {
            sink.post(event);
        }
    }

    /// Number of frames of `kind` given back through `release_frame`.
    pub fn released_frames(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Preview => self.released_preview.load(Ordering::SeqCst),
            StreamKind::Video => self.released_video.load(Ordering::SeqCst),
            StreamKind::Zsl => self.released_zsl.load(Ordering::SeqCst),
        }
    }

    /// Number of buffers of `role` the device currently holds.
    pub fn free_buffers(&self, role: BufferRole) -> usize {
        self.state
            .lock()
            .unwrap()
            .free
            .get(&role)
            .map_or(0, |f| f.len())
    }

    pub fn is_registered(&self, role: BufferRole) -> bool {
        self.state.lock().unwrap().free.contains_key(&role)
    }

    pub fn is_streaming(&self, kind: StreamKind) -> bool {
        self.state.lock().unwrap().streaming.contains(&kind)
    }

    pub fn is_focusing(&self) -> bool {
        self.state.lock().unwrap().focusing
    }

    /// Last dimensions applied by the pipeline.
    pub fn dimensions(&self) -> BufferParameters {
        self.state.lock().unwrap().params.clone()
    }

    /// Every `configure` call received so far.
    pub fn configured(&self) -> Vec<DeviceParm> {
        self.state.lock().unwrap().parms.clone()
    }

    /// Produce frames of `kind` every `interval` from a background thread.
    pub fn run_sensor(self: &Arc<Self>, kind: StreamKind, interval: Duration) -> SensorThread {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let device = Arc::clone(self);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("sim {} sensor", kind))
                .spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        device.signal_frames(kind, 1, interval);
                        thread::sleep(interval);
                    }
                })
        };

        match handle {
            Ok(handle) => SensorThread {
                stop,
                handle: Some(handle),
            },
            Err(e) => {
                warn!("Cannot start simulated sensor: {}", e);
                SensorThread { stop, handle: None }
            }
        }
    }
}

fn fill(buffer: &mut FrameBuffer, geometry: FrameGeometry, step: u32) {
    let mut generator = FrameGenerator::starting_at(geometry, step);
    let written = match buffer.map_mut() {
        Some(mut data) => match generator.next_frame(&mut data) {
            Ok(()) => generator.frame_size(),
            Err(e) => {
                warn!("Cannot fill buffer {}: {}", buffer.index(), e);
                0
            }
        },
        None => 0,
    };
    buffer.set_bytes_used(written);
}

impl ImagingDevice for SimulatedDevice {
    fn attach(&self, sink: EventSink) -> Result<(), DeviceError> {
        self.state.lock().unwrap().sink = Some(sink);
        Ok(())
    }

    fn set_dimensions(&self, params: &BufferParameters) -> Result<(), DeviceError> {
        self.state.lock().unwrap().params = params.clone();
        Ok(())
    }

    fn configure(&self, parm: DeviceParm) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.faults.contains(&SimFault::Configure) {
            return Err(DeviceError::Rejected(format!("cannot configure {:?}", parm)));
        }
        debug!("Simulated device configured with {:?}", parm);
        state.parms.push(parm);
        Ok(())
    }

    fn register_buffers(
        &self,
        role: BufferRole,
        buffers: Vec<FrameBuffer>,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.faults.contains(&SimFault::RegisterBuffers) {
            return Err(DeviceError::Rejected(format!("cannot register {} buffers", role)));
        }

        debug!("Registering {} {} buffers", buffers.len(), role);
        state.free.entry(role).or_default().extend(buffers);
        self.buffer_available.notify_all();
        Ok(())
    }

    fn unregister_buffers(&self, role: BufferRole) -> Vec<FrameBuffer> {
        let buffers: Vec<FrameBuffer> = self
            .state
            .lock()
            .unwrap()
            .free
            .remove(&role)
            .map(Vec::from)
            .unwrap_or_default();
        debug!("Unregistered {} {} buffers", buffers.len(), role);
        buffers
    }

    fn start_stream(&self, kind: StreamKind) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.sink.is_none() {
            return Err(DeviceError::NotAttached);
        }
        if state.faults.contains(&SimFault::StartStream) {
            return Err(DeviceError::Rejected(format!("cannot start {} stream", kind)));
        }
        if !state.free.contains_key(&kind.role()) {
            return Err(DeviceError::NoBuffers(kind.role()));
        }

        state.streaming.insert(kind);
        self.buffer_available.notify_all();
        Ok(())
    }

    fn stop_stream(&self, kind: StreamKind) -> Result<(), DeviceError> {
        self.state.lock().unwrap().streaming.remove(&kind);
        self.buffer_available.notify_all();
        Ok(())
    }

    fn release_frame(&self, frame: Frame) {
        match frame.kind {
            StreamKind::Preview => self.released_preview.fetch_add(1, Ordering::SeqCst),
            StreamKind::Video => self.released_video.fetch_add(1, Ordering::SeqCst),
            StreamKind::Zsl => self.released_zsl.fetch_add(1, Ordering::SeqCst),
        };

        let mut state = self.state.lock().unwrap();
        if let Some(free) = state.free.get_mut(&frame.kind.role()) {
            free.push_back(frame.buffer);
            self.buffer_available.notify_all();
        }
    }

    fn start_snapshot(&self, mut request: SnapshotRequest) -> Result<(), DeviceError> {
        let (sink, params) = {
            let state = self.state.lock().unwrap();
            if state.faults.contains(&SimFault::Snapshot) {
                return Err(DeviceError::Rejected("cannot take picture".into()));
            }
            let sink = state.sink.clone().ok_or(DeviceError::NotAttached)?;
            (sink, state.params.clone())
        };

        sink.post(DeviceEvent::Shutter);

        let main_geometry = match request.kind {
            SnapshotKind::Normal => params.picture_geometry(),
            SnapshotKind::Live => params.video_geometry(),
        };
        fill(&mut request.main, main_geometry, 0);
        if let Some(postview) = request.postview.as_mut() {
            fill(postview, params.thumbnail_geometry(), 0);
        }
        sink.post(DeviceEvent::RawPicture(request));
        Ok(())
    }

    fn cancel_snapshot(&self) {
        // Still captures complete synchronously, there is never one to abort.
        debug!("Simulated snapshot cancelled");
    }

    fn encode(&self, mut request: EncodeRequest) -> Result<(), DeviceError> {
        let sink = self.sink().ok_or(DeviceError::NotAttached)?;
        let success = !self.fault(SimFault::Encode) && fake_jpeg(&mut request);

        if success {
            let size = request.output.bytes_used();
            let mut sent = 0;
            while sent < size {
                let fragment = (size - sent).min(self.config.fragment_size);
                sink.post(DeviceEvent::JpegFragment(fragment));
                sent += fragment;
            }
        } else {
            request.output.set_bytes_used(0);
        }

        sink.post(DeviceEvent::EncodeDone(EncodeDone { request, success }));
        Ok(())
    }

    fn start_autofocus(&self) -> Result<(), DeviceError> {
        let sink = {
            let mut state = self.state.lock().unwrap();
            if state.faults.contains(&SimFault::Autofocus) {
                return Err(DeviceError::Rejected("cannot start autofocus".into()));
            }
            match self.config.focus {
                FocusBehavior::Immediate(_) => state.sink.clone(),
                FocusBehavior::Manual => {
                    state.focusing = true;
                    None
                }
            }
        };

        if let (Some(sink), FocusBehavior::Immediate(result)) = (sink, self.config.focus) {
            sink.post(DeviceEvent::FocusDone(result));
        }
        Ok(())
    }

    fn abort_autofocus(&self) {
        self.complete_focus(false);
    }
}

/// Write a minimal JPEG-looking stream into the output buffer: SOI, a
/// subsampling of the main image, EOI.
fn fake_jpeg(request: &mut EncodeRequest) -> bool {
    const STRIDE: usize = 64;

    let main = match request.main.map() {
        Some(main) => main,
        None => return false,
    };
    let payload = &main[..request.main.bytes_used()];
    let body_len = payload.len() / STRIDE;

    let Some(mut output) = request.output.map_mut() else {
        return false;
    };
    if output.len() < body_len + 4 {
        return false;
    }

    output[..2].copy_from_slice(&[0xff, 0xd8]);
    for (dst, src) in output[2..2 + body_len]
        .iter_mut()
        .zip(payload.iter().step_by(STRIDE))
    {
        // 0xff would start a marker.
        *dst = (*src).min(0xfe);
    }
    output[2 + body_len..4 + body_len].copy_from_slice(&[0xff, 0xd9]);
    drop(output);
    drop(main);

    request.output.set_bytes_used(body_len + 4);
    true
}

/// Background producer started by `SimulatedDevice::run_sensor`. Stops when
/// dropped.
pub struct SensorThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SensorThread {
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Simulated sensor thread panicked");
            }
        }
    }
}

impl Drop for SensorThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        AnonymousBufferPool, BufferPool, ContiguousBufferPool, ContiguousSource, PoolRequest,
    };
    use crate::params::{PixelFormat, Size};

    fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<DeviceEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = Arc::clone(&events);
            EventSink::new(move |e| events.lock().unwrap().push(e))
        };
        (sink, events)
    }

    fn preview_pool(count: usize) -> ContiguousBufferPool {
        let geometry = BufferParameters::default().preview_geometry();
        ContiguousBufferPool::create(
            &ContiguousSource::Memfd,
            BufferRole::Preview,
            PoolRequest::new("preview", geometry.frame_size, count),
        )
    }

    #[test]
    fn test_frame_generator() {
        let geometry = FrameGeometry::new(Size::new(16, 8), PixelFormat::Nv21);
        let mut generator = FrameGenerator::new(geometry);
        let mut small = vec![0u8; 10];
        assert!(matches!(
            generator.next_frame(&mut small),
            Err(GenerateFrameError::BufferTooSmall)
        ));

        let mut frame = vec![0u8; geometry.frame_size];
        generator.next_frame(&mut frame).unwrap();
        assert_eq!(frame[0], 0);
        assert_eq!(frame[1], 1);
        assert!(frame[geometry.cbcr_offset..].iter().all(|b| *b == 128));
        generator.next_frame(&mut frame).unwrap();
        assert_eq!(frame[0], 1);
    }

    #[test]
    fn test_signal_frames_needs_free_buffers() {
        let device = SimulatedDevice::default();
        let (sink, events) = collecting_sink();
        device.attach(sink).unwrap();

        let pool = preview_pool(2);
        device
            .register_buffers(BufferRole::Preview, pool.acquire_all())
            .unwrap();
        // Not streaming yet.
        assert_eq!(
            device.signal_frames(StreamKind::Preview, 1, Duration::from_millis(10)),
            0
        );

        device.start_stream(StreamKind::Preview).unwrap();
        assert_eq!(
            device.signal_frames(StreamKind::Preview, 3, Duration::from_millis(10)),
            2
        );
        assert_eq!(device.free_buffers(BufferRole::Preview), 0);

        let mut events = std::mem::take(&mut *events.lock().unwrap());
        assert_eq!(events.len(), 2);
        let Some(DeviceEvent::Frame(frame)) = events.pop() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.sequence, 2);
        assert_eq!(frame.buffer.bytes_used(), 460_800);

        device.release_frame(frame);
        assert_eq!(device.released_frames(StreamKind::Preview), 1);
        assert_eq!(device.free_buffers(BufferRole::Preview), 1);

        device.stop_stream(StreamKind::Preview).unwrap();
        drop(events);
        assert_eq!(device.unregister_buffers(BufferRole::Preview).len(), 1);
        assert!(!device.is_registered(BufferRole::Preview));
    }

    #[test]
    fn test_start_stream_errors() {
        let device = SimulatedDevice::default();
        assert!(matches!(
            device.start_stream(StreamKind::Preview),
            Err(DeviceError::NotAttached)
        ));

        let (sink, _events) = collecting_sink();
        device.attach(sink).unwrap();
        assert!(matches!(
            device.start_stream(StreamKind::Video),
            Err(DeviceError::NoBuffers(BufferRole::Record))
        ));

        let pool = preview_pool(1);
        device
            .register_buffers(BufferRole::Preview, pool.acquire_all())
            .unwrap();
        device.set_fault(SimFault::StartStream, true);
        assert!(device.start_stream(StreamKind::Preview).is_err());
        device.set_fault(SimFault::StartStream, false);
        assert!(device.start_stream(StreamKind::Preview).is_ok());
    }

    #[test]
    fn test_snapshot_and_encode() {
        let device = SimulatedDevice::new(SimConfig::new().fragment_size(1000));
        let (sink, log) = collecting_sink();
        device.attach(sink).unwrap();
        let params = BufferParameters {
            picture_size: Size::new(320, 240),
            thumbnail_size: Size::new(160, 120),
            ..Default::default()
        };
        device.set_dimensions(&params).unwrap();

        let main_pool = AnonymousBufferPool::create(
            BufferRole::Snapshot,
            PoolRequest::new("raw", params.picture_geometry().frame_size, 1),
        );
        let jpeg_pool = AnonymousBufferPool::create(
            BufferRole::Jpeg,
            PoolRequest::new("jpeg", params.jpeg_max_size(params.picture_size), 1),
        );

        device
            .start_snapshot(SnapshotRequest {
                kind: SnapshotKind::Normal,
                main: main_pool.acquire().unwrap(),
                postview: None,
            })
            .unwrap();

        let mut events = std::mem::take(&mut *log.lock().unwrap());
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DeviceEvent::Shutter));
        let Some(DeviceEvent::RawPicture(raw)) = events.pop() else {
            panic!("expected a raw picture");
        };
        assert_eq!(raw.main.bytes_used(), 320 * 240 * 3 / 2);

        device
            .encode(EncodeRequest {
                main: raw.main,
                thumbnail: None,
                output: jpeg_pool.acquire().unwrap(),
                quality: 85,
            })
            .unwrap();

        let mut events = std::mem::take(&mut *log.lock().unwrap());
        // 320x240 NV21 is 115200 bytes, subsampled into 1800 bytes plus
        // markers: two fragments of at most 1000 bytes.
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], DeviceEvent::JpegFragment(1000)));
        assert!(matches!(events[1], DeviceEvent::JpegFragment(804)));
        let Some(DeviceEvent::EncodeDone(done)) = events.pop() else {
            panic!("expected encode completion");
        };
        assert!(done.success);
        let output = done.request.output.map().unwrap();
        assert_eq!(done.request.output.bytes_used(), 1804);
        assert_eq!(&output[..2], &[0xff, 0xd8]);
        assert_eq!(&output[1802..1804], &[0xff, 0xd9]);
    }

    #[test]
    fn test_encode_fault() {
        let device = SimulatedDevice::default();
        let (sink, log) = collecting_sink();
        device.attach(sink).unwrap();
        device.set_fault(SimFault::Encode, true);

        let pool = AnonymousBufferPool::create(BufferRole::Jpeg, PoolRequest::new("jpeg", 4096, 2));
        device
            .encode(EncodeRequest {
                main: pool.acquire().unwrap(),
                thumbnail: None,
                output: pool.acquire().unwrap(),
                quality: 85,
            })
            .unwrap();

        let events = std::mem::take(&mut *log.lock().unwrap());
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            DeviceEvent::EncodeDone(EncodeDone { success: false, .. })
        ));
    }

    #[test]
    fn test_focus() {
        let (sink, log) = collecting_sink();
        let immediate = SimulatedDevice::new(SimConfig::new().focus(FocusBehavior::Immediate(false)));
        immediate.attach(sink.clone()).unwrap();
        immediate.start_autofocus().unwrap();
        assert!(matches!(
            log.lock().unwrap().pop(),
            Some(DeviceEvent::FocusDone(false))
        ));

        let manual = SimulatedDevice::new(SimConfig::new().focus(FocusBehavior::Manual));
        manual.attach(sink).unwrap();
        assert!(!manual.complete_focus(true));
        manual.start_autofocus().unwrap();
        assert!(manual.is_focusing());
        assert!(log.lock().unwrap().is_empty());
        assert!(manual.complete_focus(true));
        assert!(matches!(
            log.lock().unwrap().pop(),
            Some(DeviceEvent::FocusDone(true))
        ));

        manual.start_autofocus().unwrap();
        manual.abort_autofocus();
        assert!(matches!(
            log.lock().unwrap().pop(),
            Some(DeviceEvent::FocusDone(false))
        ));
        assert!(!manual.is_focusing());
    }

    #[test]
    fn test_sensor_thread() {
        let device = Arc::new(SimulatedDevice::default());
        let (sink, log) = collecting_sink();
        device.attach(sink).unwrap();
        let pool = preview_pool(2);
        device
            .register_buffers(BufferRole::Preview, pool.acquire_all())
            .unwrap();
        device.start_stream(StreamKind::Preview).unwrap();

        let sensor = device.run_sensor(StreamKind::Preview, Duration::from_millis(1));
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        sensor.stop();
        // Nobody gave the two buffers back, so no more than two frames.
        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
