//! Module for creating and controlling capture pipelines.
//!
//! Pipelines are created using [`camhal_pipeline_open`] on top of a device
//! created with [`camhal_device_new`](crate::device::camhal_device_new), and
//! remain active until being given to [`camhal_pipeline_destroy`].
//!
//! Pipelines communicate with the client through the callbacks of
//! [`camhal_callbacks`]. Callbacks are invoked from the pipeline's stage
//! threads, and only for the message types enabled with
//! [`camhal_pipeline_enable_msg_type`].
//!
//! Functions returning a `c_int` return 0 on success, or a negative errno
//! value: `-EBUSY` when the operation is not allowed in the current state,
//! `-EINVAL` for invalid parameters, `-ENOMEM` when buffers could not be
//! allocated, `-EIO` when the device refused the operation and `-ENODEV`
//! once the pipeline cannot be used anymore.
#![allow(non_camel_case_types)]

use crate::device::camhal_device;
use crate::{camhal_parameters, error_code};

use camhal::callbacks::{CameraCallbacks, MsgType, RecordingFrame};
use camhal::config::PipelineConfig;
use camhal::device::ImagingDevice;
use camhal::memory::ContiguousSource;
use camhal::params::BufferParameters;
use camhal::pipeline::{CapturePipeline, CaptureState, Command};
use log::{error, info, warn};
use nix::errno::Errno;
use std::{
    ffi::CStr,
    fmt::Write,
    os::raw::{c_char, c_int, c_void},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

pub const CAMHAL_MSG_ERROR: u32 = 0x001;
pub const CAMHAL_MSG_SHUTTER: u32 = 0x002;
pub const CAMHAL_MSG_FOCUS: u32 = 0x004;
pub const CAMHAL_MSG_ZOOM: u32 = 0x008;
pub const CAMHAL_MSG_PREVIEW_FRAME: u32 = 0x010;
pub const CAMHAL_MSG_VIDEO_FRAME: u32 = 0x020;
pub const CAMHAL_MSG_POSTVIEW_FRAME: u32 = 0x040;
pub const CAMHAL_MSG_RAW_IMAGE: u32 = 0x080;
pub const CAMHAL_MSG_COMPRESSED_IMAGE: u32 = 0x100;
pub const CAMHAL_MSG_RAW_IMAGE_NOTIFY: u32 = 0x200;
pub const CAMHAL_MSG_PREVIEW_METADATA: u32 = 0x400;
pub const CAMHAL_MSG_STATS_DATA: u32 = 0x800;
pub const CAMHAL_MSG_ALL: u32 = 0xfff;

/// `ext1` of `CAMHAL_MSG_ERROR` notifications.
pub const CAMHAL_ERROR_UNKNOWN: i32 = 1;
pub const CAMHAL_ERROR_SERVER_DIED: i32 = 100;

/// Callback invoked for notifications without payload.
///
/// Parameters are the `cb_data` of [`camhal_callbacks`], the message type
/// and two message-specific values.
pub type camhal_notify_cb = extern "C" fn(*mut c_void, u32, i32, i32);

/// Callback invoked for messages carrying data. The data is only valid
/// during the call.
pub type camhal_data_cb = extern "C" fn(*mut c_void, u32, *const u8, usize);

/// Callback invoked for video frames, with their capture timestamp in
/// nanoseconds. The frame belongs to the client, which must give it back
/// with [`camhal_pipeline_release_recording_frame`] once done with it. The
/// device cannot reuse the buffer until then.
pub type camhal_data_timestamp_cb = extern "C" fn(*mut c_void, u32, *mut camhal_recording_frame, u64);

/// Callbacks of a pipeline's client. Any callback can be NULL, in which case
/// the corresponding messages are dropped.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct camhal_callbacks {
    pub notify: Option<camhal_notify_cb>,
    pub data: Option<camhal_data_cb>,
    pub data_timestamp: Option<camhal_data_timestamp_cb>,
    /// Passed as first parameter of every callback.
    pub cb_data: *mut c_void,
}

struct CCallbacks(camhal_callbacks);

// The client is required to accept callbacks from any thread.
unsafe impl Send for CCallbacks {}
unsafe impl Sync for CCallbacks {}

impl CameraCallbacks for CCallbacks {
    fn notify(&self, msg: MsgType, ext1: i32, ext2: i32) {
        if let Some(notify) = self.0.notify {
            notify(self.0.cb_data, msg.bits(), ext1, ext2);
        }
    }

    fn data(&self, msg: MsgType, data: &[u8]) {
        if let Some(data_cb) = self.0.data {
            data_cb(self.0.cb_data, msg.bits(), data.as_ptr(), data.len());
        }
    }

    fn data_timestamp(&self, msg: MsgType, frame: RecordingFrame, timestamp: Duration) {
        match self.0.data_timestamp {
            Some(data_timestamp) => {
                let frame = Box::into_raw(Box::new(camhal_recording_frame { frame }));
                data_timestamp(self.0.cb_data, msg.bits(), frame, timestamp.as_nanos() as u64);
            }
            // Dropping the frame gives it back to the device.
            None => drop(frame),
        }
    }
}

/// A video frame lent to the client.
pub struct camhal_recording_frame {
    frame: RecordingFrame,
}

/// Description of a video frame.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct camhal_frame_info {
    pub index: u32,
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub bytes_used: usize,
    /// File descriptor of the memory region containing the frame, or -1 if
    /// the recording session the frame belongs to has ended.
    pub fd: c_int,
    pub offset: usize,
    pub len: usize,
}

/// Static configuration of a pipeline. Zero values select the defaults.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct camhal_config {
    pub preview_buffers: u32,
    pub record_buffers: u32,
    /// Size of the ring of full resolution frames in zero shutter lag mode.
    pub zsl_buffers: u32,
    pub stats_buffers: u32,
    pub alignment: usize,
    /// Path to a device node providing contiguous memory, e.g.
    /// "/dev/pmem_adsp". If NULL, an anonymous memory region is used.
    pub pmem_path: *const c_char,
    /// Log the frame rate of preview and recording once per second.
    pub debug_fps: bool,
}

/// A capture pipeline instance.
pub struct camhal_pipeline {
    pipeline: CapturePipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum camhal_capture_state {
    Idle,
    PreviewRunning,
    RecordingRunning,
    SnapshotInProgress,
}

impl From<CaptureState> for camhal_capture_state {
    fn from(state: CaptureState) -> Self {
        match state {
            CaptureState::Idle => camhal_capture_state::Idle,
            CaptureState::PreviewRunning => camhal_capture_state::PreviewRunning,
            CaptureState::RecordingRunning => camhal_capture_state::RecordingRunning,
            CaptureState::SnapshotInProgress => camhal_capture_state::SnapshotInProgress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum camhal_command {
    StartHistogram,
    StopHistogram,
    StartFaceDetection,
    StopFaceDetection,
}

impl From<camhal_command> for Command {
    fn from(command: camhal_command) -> Self {
        match command {
            camhal_command::StartHistogram => Command::StartHistogram,
            camhal_command::StopHistogram => Command::StopHistogram,
            camhal_command::StartFaceDetection => Command::StartFaceDetection,
            camhal_command::StopFaceDetection => Command::StopFaceDetection,
        }
    }
}

unsafe fn pipeline_config(config: &camhal_config) -> PipelineConfig {
    let mut res = PipelineConfig::new();
    if config.preview_buffers > 0 {
        res = res.preview_buffers(config.preview_buffers as usize);
    }
    if config.record_buffers > 0 {
        res = res.record_buffers(config.record_buffers as usize);
    }
    if config.zsl_buffers > 0 {
        res = res.zsl_buffers(config.zsl_buffers as usize);
    }
    if config.stats_buffers > 0 {
        res = res.stats_buffers(config.stats_buffers as usize);
    }
    if config.alignment > 0 {
        res = res.alignment(config.alignment);
    }
    if !config.pmem_path.is_null() {
        let path = CStr::from_ptr(config.pmem_path).to_string_lossy();
        res = res.contiguous_source(ContiguousSource::DeviceNode(PathBuf::from(path.as_ref())));
    }
    if config.debug_fps {
        res = res.debug_fps();
    }
    res
}

fn c_callbacks(callbacks: *const camhal_callbacks) -> Option<Arc<dyn CameraCallbacks>> {
    // Safe as long as the caller respects the documented contract.
    let callbacks = unsafe { callbacks.as_ref() }?;
    Some(Arc::new(CCallbacks(*callbacks)))
}

/// Create a new pipeline driving `device`.
///
/// * `device` is the device to drive. The pipeline keeps its own reference,
///   so the client can call
///   [`camhal_device_destroy`](crate::device::camhal_device_destroy) on it
///   right after this call.
/// * `config` is the static configuration of the pipeline. If NULL, the
///   default configuration is used.
/// * `callbacks` are the callbacks to invoke. They are copied, and can be
///   NULL if the client does not want to be called back yet.
///
/// All message types are initially disabled. Returns NULL if the pipeline
/// could not be created.
///
/// # Safety
///
/// `device` must be a valid pointer returned by `camhal_device_new`. `config`
/// and `callbacks` must be NULL or point to valid structures, and the
/// `pmem_path` of `config` must be NULL or a valid zero-terminated string.
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_open(
    device: *const camhal_device,
    config: *const camhal_config,
    callbacks: *const camhal_callbacks,
) -> *mut camhal_pipeline {
    if device.is_null() {
        error!("Trying to open a pipeline over a NULL device");
        return std::ptr::null_mut();
    }
    Arc::increment_strong_count(device);
    let device: Arc<dyn ImagingDevice> = Arc::from_raw(device);

    let config = match config.as_ref() {
        Some(config) => pipeline_config(config),
        None => PipelineConfig::new(),
    };

    let pipeline = match CapturePipeline::open(device, config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Cannot open pipeline: {}", e);
            return std::ptr::null_mut();
        }
    };
    pipeline.set_callbacks(c_callbacks(callbacks));

    let pipeline = Box::new(camhal_pipeline { pipeline });
    info!("Pipeline {:p}: opened", pipeline.as_ref());
    Box::into_raw(pipeline)
}

/// Stop and destroy a pipeline.
///
/// Every activity is stopped, and it is guaranteed that none of the callbacks
/// will be called after this function has returned. Recording frames still
/// held by the client remain valid handles, but their data is not
/// accessible anymore and they must still be released.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`],
/// and must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_destroy(pipeline: *mut camhal_pipeline) {
    info!("Pipeline {:p}: destroying", pipeline);

    if pipeline.is_null() {
        warn!("Trying to destroy a NULL pipeline");
        return;
    }

    let pipeline = Box::from_raw(pipeline);
    pipeline.pipeline.release();
    drop(pipeline);
}

/// Replace the callbacks of `pipeline`. NULL removes them.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`],
/// and `callbacks` must be NULL or a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_set_callbacks(
    pipeline: *const camhal_pipeline,
    callbacks: *const camhal_callbacks,
) {
    (*pipeline).pipeline.set_callbacks(c_callbacks(callbacks));
}

/// Enable delivery of the messages of `msg_type`, a mask of `CAMHAL_MSG_*`
/// values.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_enable_msg_type(
    pipeline: *const camhal_pipeline,
    msg_type: u32,
) {
    (*pipeline)
        .pipeline
        .enable_msg_type(MsgType::from_bits_truncate(msg_type));
}

/// Disable delivery of the messages of `msg_type`.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_disable_msg_type(
    pipeline: *const camhal_pipeline,
    msg_type: u32,
) {
    (*pipeline)
        .pipeline
        .disable_msg_type(MsgType::from_bits_truncate(msg_type));
}

/// Returns whether any of the messages of `msg_type` is enabled.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_msg_type_enabled(
    pipeline: *const camhal_pipeline,
    msg_type: u32,
) -> bool {
    (*pipeline)
        .pipeline
        .msg_type_enabled(MsgType::from_bits_truncate(msg_type))
}

/// Replace the parameters of the pipeline. The parameters are validated as
/// a whole, and nothing is changed if they are rejected.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`],
/// and `params` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_set_parameters(
    pipeline: *const camhal_pipeline,
    params: *const camhal_parameters,
) -> c_int {
    let params = match BufferParameters::try_from(&*params) {
        Ok(params) => params,
        Err(errno) => return -(errno as c_int),
    };
    error_code((*pipeline).pipeline.set_parameters(params))
}

/// Write the current parameters of the pipeline into `params`.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`],
/// and `params` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_get_parameters(
    pipeline: *const camhal_pipeline,
    params: *mut camhal_parameters,
) {
    *params = camhal_parameters::from(&(*pipeline).pipeline.parameters());
}

/// Start streaming preview frames. Does nothing if preview is already
/// running.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_start_preview(pipeline: *const camhal_pipeline) -> c_int {
    error_code((*pipeline).pipeline.start_preview())
}

/// Stop every activity of the pipeline. Does nothing if it is idle.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_stop_preview(pipeline: *const camhal_pipeline) -> c_int {
    error_code((*pipeline).pipeline.stop_preview())
}

/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_preview_enabled(pipeline: *const camhal_pipeline) -> bool {
    (*pipeline).pipeline.preview_enabled()
}

/// Start recording. Preview must be running.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_start_recording(
    pipeline: *const camhal_pipeline,
) -> c_int {
    error_code((*pipeline).pipeline.start_recording())
}

/// Stop recording, cancelling any live snapshot in progress.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_stop_recording(pipeline: *const camhal_pipeline) -> c_int {
    error_code((*pipeline).pipeline.stop_recording())
}

/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_recording_enabled(
    pipeline: *const camhal_pipeline,
) -> bool {
    (*pipeline).pipeline.recording_enabled()
}

/// Give a video frame received through the `data_timestamp` callback back to
/// the pipeline. This function takes ownership of `frame`, which must not be
/// used after this call.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`],
/// and `frame` a frame received from the `data_timestamp` callback.
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_release_recording_frame(
    pipeline: *const camhal_pipeline,
    frame: *mut camhal_recording_frame,
) {
    if frame.is_null() {
        warn!("Trying to release a NULL recording frame");
        return;
    }
    let frame = Box::from_raw(frame);
    (*pipeline).pipeline.release_recording_frame(frame.frame);
}

/// Write the description of `frame` into `info`.
///
/// # Safety
///
/// `frame` must be a frame received from the `data_timestamp` callback and
/// not released yet, and `info` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn camhal_recording_frame_get_info(
    frame: *const camhal_recording_frame,
    info: *mut camhal_frame_info,
) {
    let frame = &(*frame).frame;
    let buffer = frame.buffer();
    let descriptor = buffer.descriptor();

    *info = camhal_frame_info {
        index: frame.index() as u32,
        sequence: frame.sequence(),
        timestamp_ns: frame.timestamp().as_nanos() as u64,
        bytes_used: buffer.bytes_used(),
        fd: descriptor.map(|d| d.fd).unwrap_or(-1),
        offset: descriptor.map(|d| d.offset).unwrap_or(0),
        len: buffer.len(),
    };
}

/// Copy the content of `frame` into `dst`, which can hold `len` bytes.
///
/// Returns the number of bytes copied, or -ENODEV if the recording session
/// of the frame has ended.
///
/// # Safety
///
/// `frame` must be a frame received from the `data_timestamp` callback and
/// not released yet, and `dst` must point to at least `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn camhal_recording_frame_copy(
    frame: *const camhal_recording_frame,
    dst: *mut u8,
    len: usize,
) -> isize {
    let frame = &(*frame).frame;
    let Some(data) = frame.data() else {
        return -(Errno::ENODEV as isize);
    };
    let count = frame.buffer().bytes_used().min(data.len()).min(len);
    if count > 0 {
        std::ptr::copy_nonoverlapping(data.as_ptr(), dst, count);
    }
    count as isize
}

/// Capture a full resolution picture. Preview must be running and not
/// recording. The picture is delivered as a `CAMHAL_MSG_COMPRESSED_IMAGE`
/// message.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_take_picture(pipeline: *const camhal_pipeline) -> c_int {
    error_code((*pipeline).pipeline.take_picture())
}

/// Capture a frame of the video stream. Recording must be running.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_take_live_snapshot(
    pipeline: *const camhal_pipeline,
) -> c_int {
    error_code((*pipeline).pipeline.take_live_snapshot())
}

/// Abandon the picture in progress. Returns immediately.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_cancel_picture(pipeline: *const camhal_pipeline) -> c_int {
    error_code((*pipeline).pipeline.cancel_picture())
}

/// Start an autofocus sweep, whose outcome is reported by a
/// `CAMHAL_MSG_FOCUS` notification.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_auto_focus(pipeline: *const camhal_pipeline) -> c_int {
    error_code((*pipeline).pipeline.auto_focus())
}

/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_cancel_auto_focus(
    pipeline: *const camhal_pipeline,
) -> c_int {
    error_code((*pipeline).pipeline.cancel_auto_focus())
}

/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_send_command(
    pipeline: *const camhal_pipeline,
    command: camhal_command,
) -> c_int {
    error_code((*pipeline).pipeline.send_command(command.into()))
}

/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`].
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_get_state(
    pipeline: *const camhal_pipeline,
) -> camhal_capture_state {
    (*pipeline).pipeline.state().into()
}

/// Write a description of the pipeline and its buffers into `buf`, which
/// can hold `len` bytes. The description is truncated if needed, and always
/// zero-terminated if `len` is not 0.
///
/// Returns the length of the full description, not including the
/// terminating zero.
///
/// # Safety
///
/// `pipeline` must be a valid pointer returned by [`camhal_pipeline_open`],
/// and `buf` must point to at least `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn camhal_pipeline_dump(
    pipeline: *const camhal_pipeline,
    buf: *mut c_char,
    len: usize,
) -> usize {
    let mut dump = String::new();
    if let Err(e) = (*pipeline).pipeline.dump(&mut dump) {
        error!("Cannot dump pipeline: {}", e);
    }
    if writeln!(dump).is_err() {
        return 0;
    }

    if len > 0 && !buf.is_null() {
        let count = dump.len().min(len - 1);
        std::ptr::copy_nonoverlapping(dump.as_ptr() as *const c_char, buf, count);
        *buf.add(count) = 0;
    }
    dump.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        camhal_device_destroy, camhal_device_new, camhal_device_post_encode_done,
        camhal_device_post_frame, camhal_device_post_jpeg_fragment,
        camhal_device_post_raw_picture, camhal_device_post_shutter, camhal_stream,
        tests::{TestDevice, TEST_OPS},
    };
    use crate::camhal_buffer_role;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Received {
        notifications: Mutex<Vec<(u32, i32, i32)>>,
        data: Mutex<Vec<(u32, Vec<u8>)>>,
    }

    extern "C" fn notify(cb_data: *mut c_void, msg: u32, ext1: i32, ext2: i32) {
        let received = unsafe { &*(cb_data as *const Received) };
        received.notifications.lock().unwrap().push((msg, ext1, ext2));
    }

    extern "C" fn data(cb_data: *mut c_void, msg: u32, data: *const u8, len: usize) {
        let received = unsafe { &*(cb_data as *const Received) };
        let data = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
        received.data.lock().unwrap().push((msg, data));
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_msg_constants() {
        assert_eq!(CAMHAL_MSG_ERROR, MsgType::ERROR.bits());
        assert_eq!(CAMHAL_MSG_PREVIEW_FRAME, MsgType::PREVIEW_FRAME.bits());
        assert_eq!(CAMHAL_MSG_COMPRESSED_IMAGE, MsgType::COMPRESSED_IMAGE.bits());
        assert_eq!(CAMHAL_MSG_STATS_DATA, MsgType::STATS_DATA.bits());
        assert_eq!(CAMHAL_MSG_ALL, MsgType::all().bits());
        assert_eq!(CAMHAL_ERROR_UNKNOWN, camhal::callbacks::ERROR_UNKNOWN);
        assert_eq!(CAMHAL_ERROR_SERVER_DIED, camhal::callbacks::ERROR_SERVER_DIED);
    }

    #[test]
    fn test_preview_and_picture() {
        let test = TestDevice::default();
        let received = Received::default();
        let callbacks = camhal_callbacks {
            notify: Some(notify),
            data: Some(data),
            data_timestamp: None,
            cb_data: &received as *const Received as *mut c_void,
        };

        unsafe {
            let device = camhal_device_new(&TEST_OPS, &test as *const TestDevice as *mut c_void);
            let pipeline = camhal_pipeline_open(device, std::ptr::null(), &callbacks);
            assert!(!pipeline.is_null());
            // The pipeline holds its own reference.
            camhal_device_destroy(device);

            camhal_pipeline_enable_msg_type(pipeline, CAMHAL_MSG_ALL);
            assert!(camhal_pipeline_msg_type_enabled(pipeline, CAMHAL_MSG_SHUTTER));
            assert_eq!(
                camhal_pipeline_start_recording(pipeline),
                -(Errno::EBUSY as c_int)
            );

            assert_eq!(camhal_pipeline_start_preview(pipeline), 0);
            assert_eq!(
                camhal_pipeline_get_state(pipeline),
                camhal_capture_state::PreviewRunning
            );
            let preview_buffers = test
                .registered
                .lock()
                .unwrap()
                .iter()
                .filter(|b| b.role == camhal_buffer_role::Preview)
                .count();
            assert_eq!(preview_buffers, 4);

            assert_eq!(
                camhal_device_post_frame(device, camhal_stream::Preview, 2, 100, 0),
                0
            );
            assert!(wait_for(|| !test.queued.lock().unwrap().is_empty()));
            assert_eq!(
                *test.queued.lock().unwrap(),
                vec![(camhal_stream::Preview, 2)]
            );
            assert!(received
                .data
                .lock()
                .unwrap()
                .iter()
                .any(|(msg, data)| *msg == CAMHAL_MSG_PREVIEW_FRAME && data.len() == 100));

            assert_eq!(camhal_pipeline_take_picture(pipeline), 0);
            assert_eq!(
                camhal_pipeline_get_state(pipeline),
                camhal_capture_state::SnapshotInProgress
            );
            assert_eq!(camhal_device_post_shutter(device), 0);
            assert_eq!(camhal_device_post_raw_picture(device, 1024, 256), 0);
            assert!(wait_for(|| !test.encodes.lock().unwrap().is_empty()));

            let jpeg = [0xffu8, 0xd8, 0xff, 0xd9];
            assert_eq!(
                camhal_device_post_jpeg_fragment(device, jpeg.as_ptr(), jpeg.len()),
                0
            );
            assert_eq!(camhal_device_post_encode_done(device, true), 0);
            assert!(wait_for(|| {
                received
                    .data
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|(msg, _)| *msg == CAMHAL_MSG_COMPRESSED_IMAGE)
            }));
            assert!(wait_for(|| {
                camhal_pipeline_get_state(pipeline) == camhal_capture_state::PreviewRunning
            }));

            let compressed: Vec<Vec<u8>> = received
                .data
                .lock()
                .unwrap()
                .iter()
                .filter(|(msg, _)| *msg == CAMHAL_MSG_COMPRESSED_IMAGE)
                .map(|(_, data)| data.clone())
                .collect();
            assert_eq!(compressed, vec![jpeg.to_vec()]);
            assert!(received
                .notifications
                .lock()
                .unwrap()
                .contains(&(CAMHAL_MSG_SHUTTER, 0, 0)));

            let mut dump = [0 as c_char; 16];
            let full_len = camhal_pipeline_dump(pipeline, dump.as_mut_ptr(), dump.len());
            assert!(full_len > dump.len());
            assert_eq!(dump[15], 0);

            camhal_pipeline_destroy(pipeline);
        }
    }

    #[test]
    fn test_invalid_parameters() {
        let test = TestDevice::default();
        unsafe {
            let device = camhal_device_new(&TEST_OPS, &test as *const TestDevice as *mut c_void);
            let pipeline = camhal_pipeline_open(device, std::ptr::null(), std::ptr::null());
            camhal_device_destroy(device);

            let mut params = std::mem::MaybeUninit::<camhal_parameters>::uninit();
            camhal_pipeline_get_parameters(pipeline, params.as_mut_ptr());
            let mut params = params.assume_init();
            assert_eq!(params.preview_size.width, 640);

            params.hfr_fps = 30;
            assert_eq!(
                camhal_pipeline_set_parameters(pipeline, &params),
                -(Errno::EINVAL as c_int)
            );
            params.hfr_fps = 0;
            params.picture_size.width = 3;
            assert_eq!(
                camhal_pipeline_set_parameters(pipeline, &params),
                -(Errno::EINVAL as c_int)
            );
            params.picture_size.width = 1024;
            assert_eq!(camhal_pipeline_set_parameters(pipeline, &params), 0);

            camhal_pipeline_destroy(pipeline);
        }
    }
}
