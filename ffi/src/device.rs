//! Imaging devices implemented in C.
//!
//! A C device is created from a [`camhal_device_ops`] table using
//! [`camhal_device_new`] and given to the pipeline with
//! [`camhal_pipeline_open`](crate::camera::camhal_pipeline_open). The pipeline
//! then calls the functions of the table to drive the device, and the device
//! reports completed work using the `camhal_device_post_*` functions, which
//! can be called from any thread, including from within a function of the
//! table.
//!
//! Buffers are addressed by their role and index. When buffers are
//! registered, the device receives a [`camhal_buffer`] describing where each
//! of them lives in memory; it can then fill any buffer it holds and return
//! it with [`camhal_device_post_frame`]. Frames consumed by the pipeline come
//! back through the `queue_buffer` function of the table.
#![allow(non_camel_case_types)]

use crate::{camhal_buffer_role, camhal_parameters};

use camhal::device::{
    DeviceError, DeviceEvent, DeviceParm, EncodeDone, EncodeRequest, EventSink, Frame,
    ImagingDevice, SnapshotKind, SnapshotRequest, StreamKind,
};
use camhal::memory::{BufferRole, FrameBuffer};
use camhal::params::{BufferParameters, HfrRate};
use log::{debug, error, trace, warn};
use nix::errno::Errno;
use std::{
    collections::BTreeMap,
    ffi::CStr,
    os::raw::{c_char, c_int, c_void},
    sync::{Arc, Mutex},
    time::Duration,
};

/// One of the streams produced continuously by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum camhal_stream {
    Preview,
    Video,
    /// Full resolution frames of the zero shutter lag mode.
    Zsl,
}

impl From<StreamKind> for camhal_stream {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Preview => camhal_stream::Preview,
            StreamKind::Video => camhal_stream::Video,
            StreamKind::Zsl => camhal_stream::Zsl,
        }
    }
}

impl From<camhal_stream> for StreamKind {
    fn from(stream: camhal_stream) -> Self {
        match stream {
            camhal_stream::Preview => StreamKind::Preview,
            camhal_stream::Video => StreamKind::Video,
            camhal_stream::Zsl => StreamKind::Zsl,
        }
    }
}

/// Device settings passed to the `configure` function of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum camhal_device_parm {
    /// `value` is 1 to enable histogram statistics, 0 to disable them.
    Histogram,
    /// `value` is 1 to enable face detection, 0 to disable it.
    FaceDetection,
    /// `value` is the frame rate of the high frame rate mode, or 0 to leave
    /// it.
    HighFrameRate,
}

/// Location of a buffer given to the device.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct camhal_buffer {
    pub role: camhal_buffer_role,
    pub index: u32,
    /// File descriptor of the memory region containing the buffer, or -1 if
    /// the buffer is not in device-accessible memory.
    pub fd: c_int,
    /// Offset of the buffer inside the region of `fd`.
    pub offset: usize,
    pub len: usize,
    /// Offsets of the chroma and luma planes from the start of the buffer.
    pub cbcr_offset: usize,
    pub y_offset: usize,
}

impl camhal_buffer {
    fn new(role: BufferRole, buffer: &FrameBuffer) -> Self {
        let mut desc = camhal_buffer {
            role: role.into(),
            index: buffer.index() as u32,
            fd: -1,
            offset: 0,
            len: buffer.len(),
            cbcr_offset: 0,
            y_offset: 0,
        };
        if let Some(d) = buffer.descriptor() {
            desc.fd = d.fd;
            desc.offset = d.offset;
            desc.cbcr_offset = d.cbcr_offset;
            desc.y_offset = d.y_offset;
        }
        desc
    }
}

/// Functions implementing a C imaging device. Every function receives the
/// `cb_data` given to [`camhal_device_new`] as first argument. Functions
/// returning a `c_int` return 0 on success, or a negative errno value.
///
/// None of these functions is called with a lock of the library held, so
/// they can post events synchronously.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct camhal_device_ops {
    /// Apply the sizes and formats of all streams.
    pub set_dimensions: extern "C" fn(*mut c_void, *const camhal_parameters) -> c_int,
    pub configure: extern "C" fn(*mut c_void, camhal_device_parm, u32) -> c_int,
    /// Take a buffer the device may fill. The buffer is held by the device
    /// until posted back.
    pub register_buffer: extern "C" fn(*mut c_void, *const camhal_buffer) -> c_int,
    /// Forget every buffer of a role. Buffers of that role must not be
    /// accessed after this returns.
    pub unregister_buffers: extern "C" fn(*mut c_void, camhal_buffer_role),
    pub start_stream: extern "C" fn(*mut c_void, camhal_stream) -> c_int,
    pub stop_stream: extern "C" fn(*mut c_void, camhal_stream) -> c_int,
    /// Give back the buffer of the given index after its frame has been
    /// consumed.
    pub queue_buffer: extern "C" fn(*mut c_void, camhal_stream, u32),
    /// Start a still capture into `main` and `postview` (which can be NULL).
    /// Live snapshots capture a frame of the video stream. Completion is
    /// reported with [`camhal_device_post_shutter`] and
    /// [`camhal_device_post_raw_picture`].
    pub start_snapshot: extern "C" fn(
        *mut c_void,
        bool, /* live */
        *const camhal_buffer,
        *const camhal_buffer,
    ) -> c_int,
    pub cancel_snapshot: extern "C" fn(*mut c_void),
    /// Encode the picture of `main`, with `thumbnail` (which can be NULL)
    /// embedded, at the given quality. The encoded bytes, at most `max_size`
    /// of them, are given with [`camhal_device_post_jpeg_fragment`], then
    /// [`camhal_device_post_encode_done`] is called.
    pub encode: extern "C" fn(
        *mut c_void,
        *const camhal_buffer,
        *const camhal_buffer,
        usize, /* max_size */
        u8,    /* quality */
    ) -> c_int,
    /// Start an autofocus sweep, completed by [`camhal_device_post_focus_done`].
    pub start_autofocus: extern "C" fn(*mut c_void) -> c_int,
    pub abort_autofocus: extern "C" fn(*mut c_void),
}

// A void pointer that can be sent across threads. The C device is required to
// accept calls from any thread.
struct SendablePtr<T>(*mut T);
unsafe impl<T> Send for SendablePtr<T> {}
unsafe impl<T> Sync for SendablePtr<T> {}

#[derive(Default)]
struct DeviceState {
    sink: Option<EventSink>,
    // Buffers currently held by the device, by role and index.
    buffers: BTreeMap<(BufferRole, usize), FrameBuffer>,
    sequences: BTreeMap<StreamKind, u64>,
    snapshot: Option<SnapshotRequest>,
    // The request being encoded, and how many bytes were written so far.
    encode: Option<(EncodeRequest, usize)>,
}

/// An imaging device implemented in C.
pub struct camhal_device {
    ops: camhal_device_ops,
    cb_data: SendablePtr<c_void>,
    state: Mutex<DeviceState>,
}

fn check(ret: c_int) -> Result<(), DeviceError> {
    if ret < 0 {
        Err(DeviceError::Errno(Errno::from_raw(-ret)))
    } else {
        Ok(())
    }
}

fn desc_ptr(desc: &Option<camhal_buffer>) -> *const camhal_buffer {
    desc.as_ref()
        .map(|d| d as *const _)
        .unwrap_or(std::ptr::null())
}

impl camhal_device {
    fn cb_data(&self) -> *mut c_void {
        self.cb_data.0
    }

    /// Send `event` to the pipeline, without holding our lock.
    fn post(&self, event: DeviceEvent) -> c_int {
        let sink = self.state.lock().unwrap().sink.clone();
        match sink {
            Some(sink) => {
                sink.post(event);
                0
            }
            None => {
                warn!("Device event {:?} posted before the device was attached", event);
                -(Errno::ENOTCONN as c_int)
            }
        }
    }

    fn post_frame(
        &self,
        stream: camhal_stream,
        index: usize,
        bytes_used: usize,
        timestamp: Duration,
    ) -> c_int {
        let kind = StreamKind::from(stream);
        let frame = {
            let mut state = self.state.lock().unwrap();
            let Some(mut buffer) = state.buffers.remove(&(kind.role(), index)) else {
                error!("Device posted {} buffer {} it does not hold", kind, index);
                return -(Errno::ENOENT as c_int);
            };
            buffer.set_bytes_used(bytes_used.min(buffer.len()));
            let sequence = state.sequences.entry(kind).or_default();
            let frame = Frame {
                buffer,
                kind,
                timestamp,
                sequence: *sequence,
            };
            *sequence += 1;
            frame
        };

        trace!("Device posted {} frame {}", kind, frame.sequence);
        self.post(DeviceEvent::Frame(frame))
    }

    fn post_raw_picture(&self, main_bytes_used: usize, postview_bytes_used: usize) -> c_int {
        let Some(mut picture) = self.state.lock().unwrap().snapshot.take() else {
            error!("Device posted a raw picture without a snapshot in progress");
            return -(Errno::EINVAL as c_int);
        };

        picture.main.set_bytes_used(main_bytes_used.min(picture.main.len()));
        if let Some(postview) = picture.postview.as_mut() {
            postview.set_bytes_used(postview_bytes_used.min(postview.len()));
        }
        self.post(DeviceEvent::RawPicture(picture))
    }

    fn post_jpeg_fragment(&self, data: &[u8]) -> c_int {
        {
            let mut state = self.state.lock().unwrap();
            let Some((request, written)) = state.encode.as_mut() else {
                error!("Device posted a JPEG fragment without an encode in progress");
                return -(Errno::EINVAL as c_int);
            };

            let end = *written + data.len();
            if end > request.output.len() {
                error!(
                    "JPEG fragment of {} bytes overflows the {} bytes output buffer",
                    data.len(),
                    request.output.len()
                );
                return -(Errno::ENOSPC as c_int);
            }
            match request.output.map_mut() {
                Some(mut output) => output[*written..end].copy_from_slice(data),
                None => return -(Errno::ENODEV as c_int),
            }
            *written = end;
        }

        self.post(DeviceEvent::JpegFragment(data.len()))
    }

    fn post_encode_done(&self, success: bool) -> c_int {
        let Some((mut request, written)) = self.state.lock().unwrap().encode.take() else {
            error!("Device completed an encode that was not in progress");
            return -(Errno::EINVAL as c_int);
        };

        request.output.set_bytes_used(written);
        debug!("Encode done ({} bytes, success: {})", written, success);
        self.post(DeviceEvent::EncodeDone(EncodeDone { request, success }))
    }
}

impl ImagingDevice for camhal_device {
    fn attach(&self, sink: EventSink) -> Result<(), DeviceError> {
        self.state.lock().unwrap().sink = Some(sink);
        Ok(())
    }

    fn set_dimensions(&self, params: &BufferParameters) -> Result<(), DeviceError> {
        let params = camhal_parameters::from(params);
        check((self.ops.set_dimensions)(self.cb_data(), &params))
    }

    fn configure(&self, parm: DeviceParm) -> Result<(), DeviceError> {
        let (parm, value) = match parm {
            DeviceParm::Histogram(enabled) => (camhal_device_parm::Histogram, enabled as u32),
            DeviceParm::FaceDetection(enabled) => {
                (camhal_device_parm::FaceDetection, enabled as u32)
            }
            DeviceParm::HighFrameRate(rate) => (
                camhal_device_parm::HighFrameRate,
                rate.map(HfrRate::fps).unwrap_or(0),
            ),
        };
        check((self.ops.configure)(self.cb_data(), parm, value))
    }

    fn register_buffers(
        &self,
        role: BufferRole,
        buffers: Vec<FrameBuffer>,
    ) -> Result<(), DeviceError> {
        if buffers.is_empty() {
            return Err(DeviceError::NoBuffers(role));
        }

        let descs: Vec<camhal_buffer> = buffers
            .iter()
            .map(|buffer| camhal_buffer::new(role, buffer))
            .collect();
        {
            let mut state = self.state.lock().unwrap();
            for buffer in buffers {
                state.buffers.insert((role, buffer.index()), buffer);
            }
        }

        for desc in &descs {
            let res = check((self.ops.register_buffer)(self.cb_data(), desc));
            if let Err(e) = res {
                error!("Device refused {} buffer {}: {}", role, desc.index, e);
                (self.ops.unregister_buffers)(self.cb_data(), role.into());
                self.state
                    .lock()
                    .unwrap()
                    .buffers
                    .retain(|(r, _), _| *r != role);
                return Err(e);
            }
        }

        debug!("Registered {} {} buffers", descs.len(), role);
        Ok(())
    }

    fn unregister_buffers(&self, role: BufferRole) -> Vec<FrameBuffer> {
        (self.ops.unregister_buffers)(self.cb_data(), role.into());

        let mut state = self.state.lock().unwrap();
        let indices: Vec<(BufferRole, usize)> = state
            .buffers
            .keys()
            .filter(|(r, _)| *r == role)
            .copied()
            .collect();
        indices
            .into_iter()
            .filter_map(|key| state.buffers.remove(&key))
            .collect()
    }

    fn start_stream(&self, kind: StreamKind) -> Result<(), DeviceError> {
        check((self.ops.start_stream)(self.cb_data(), kind.into()))
    }

    fn stop_stream(&self, kind: StreamKind) -> Result<(), DeviceError> {
        check((self.ops.stop_stream)(self.cb_data(), kind.into()))
    }

    fn release_frame(&self, frame: Frame) {
        let index = frame.buffer.index();
        self.state
            .lock()
            .unwrap()
            .buffers
            .insert((frame.kind.role(), index), frame.buffer);
        (self.ops.queue_buffer)(self.cb_data(), frame.kind.into(), index as u32);
    }

    fn start_snapshot(&self, request: SnapshotRequest) -> Result<(), DeviceError> {
        let main_role = match request.kind {
            SnapshotKind::Normal => BufferRole::Snapshot,
            SnapshotKind::Live => BufferRole::LiveSnapshot,
        };
        let live = request.kind == SnapshotKind::Live;
        let main = camhal_buffer::new(main_role, &request.main);
        let postview = request
            .postview
            .as_ref()
            .map(|b| camhal_buffer::new(BufferRole::Thumbnail, b));

        self.state.lock().unwrap().snapshot = Some(request);
        let res = check((self.ops.start_snapshot)(
            self.cb_data(),
            live,
            &main,
            desc_ptr(&postview),
        ));
        if res.is_err() {
            drop(self.state.lock().unwrap().snapshot.take());
        }
        res
    }

    fn cancel_snapshot(&self) {
        (self.ops.cancel_snapshot)(self.cb_data());
        let mut state = self.state.lock().unwrap();
        drop(state.snapshot.take());
        drop(state.encode.take());
    }

    fn encode(&self, request: EncodeRequest) -> Result<(), DeviceError> {
        let main = camhal_buffer::new(BufferRole::Snapshot, &request.main);
        let thumbnail = request
            .thumbnail
            .as_ref()
            .map(|b| camhal_buffer::new(BufferRole::Thumbnail, b));
        let max_size = request.output.len();
        let quality = request.quality;

        self.state.lock().unwrap().encode = Some((request, 0));
        let res = check((self.ops.encode)(
            self.cb_data(),
            &main,
            desc_ptr(&thumbnail),
            max_size,
            quality,
        ));
        if res.is_err() {
            drop(self.state.lock().unwrap().encode.take());
        }
        res
    }

    fn start_autofocus(&self) -> Result<(), DeviceError> {
        check((self.ops.start_autofocus)(self.cb_data()))
    }

    fn abort_autofocus(&self) {
        (self.ops.abort_autofocus)(self.cb_data())
    }
}

/// Create a new C device.
///
/// * `ops` is the table of functions implementing the device. It is copied,
///   so it does not need to outlive this call.
/// * `cb_data` is passed as the first argument of every function of `ops`.
///
/// The returned device must be released with [`camhal_device_destroy`]. It
/// can be given to any number of pipelines, which keep it alive for as long
/// as they need it.
///
/// # Safety
///
/// `ops` must be a valid pointer to a fully populated function table.
#[no_mangle]
pub unsafe extern "C" fn camhal_device_new(
    ops: *const camhal_device_ops,
    cb_data: *mut c_void,
) -> *const camhal_device {
    let Some(ops) = ops.as_ref() else {
        error!("camhal_device_new called with a NULL ops table");
        return std::ptr::null();
    };

    let device = camhal_device {
        ops: *ops,
        cb_data: SendablePtr(cb_data),
        state: Default::default(),
    };
    Arc::into_raw(Arc::new(device))
}

/// Release the reference to `device` obtained with [`camhal_device_new`].
///
/// # Safety
///
/// `device` must be a pointer returned by [`camhal_device_new`] and must not
/// be used after this call.
#[no_mangle]
pub unsafe extern "C" fn camhal_device_destroy(device: *const camhal_device) {
    if device.is_null() {
        warn!("Trying to destroy a NULL device");
        return;
    }
    drop(Arc::from_raw(device));
}

/// Report that the buffer of `index` of `stream` has been filled with
/// `bytes_used` bytes, captured at `timestamp_ns`.
///
/// The device must not access the buffer anymore until it is given back
/// through `queue_buffer`.
///
/// Returns 0 on success, -ENOENT if the device does not hold that buffer.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`].
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_frame(
    device: *const camhal_device,
    stream: camhal_stream,
    index: u32,
    bytes_used: usize,
    timestamp_ns: u64,
) -> c_int {
    let device = &*device;
    device.post_frame(
        stream,
        index as usize,
        bytes_used,
        Duration::from_nanos(timestamp_ns),
    )
}

/// Report the end of the sensor exposure of the still capture in progress.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`].
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_shutter(device: *const camhal_device) -> c_int {
    (*device).post(DeviceEvent::Shutter)
}

/// Report that the buffers of the still capture in progress have been
/// filled. They must not be accessed by the device afterwards.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`].
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_raw_picture(
    device: *const camhal_device,
    main_bytes_used: usize,
    postview_bytes_used: usize,
) -> c_int {
    (*device).post_raw_picture(main_bytes_used, postview_bytes_used)
}

/// Give the next `len` bytes of the JPEG being encoded.
///
/// Returns -ENOSPC if the encoded picture would exceed the `max_size` given
/// to `encode`, in which case the fragment is ignored.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`], and
/// `data` must point to at least `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_jpeg_fragment(
    device: *const camhal_device,
    data: *const u8,
    len: usize,
) -> c_int {
    if data.is_null() && len > 0 {
        return -(Errno::EINVAL as c_int);
    }
    let data = match len {
        0 => &[][..],
        len => std::slice::from_raw_parts(data, len),
    };
    (*device).post_jpeg_fragment(data)
}

/// Complete the encode in progress.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`].
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_encode_done(
    device: *const camhal_device,
    success: bool,
) -> c_int {
    (*device).post_encode_done(success)
}

/// Complete the autofocus sweep in progress.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`].
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_focus_done(
    device: *const camhal_device,
    success: bool,
) -> c_int {
    (*device).post(DeviceEvent::FocusDone(success))
}

/// Give the histogram of the current frame, made of `num_bins` values.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`], and
/// `bins` must point to at least `num_bins` values.
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_statistics(
    device: *const camhal_device,
    bins: *const u32,
    num_bins: usize,
) -> c_int {
    if bins.is_null() {
        return -(Errno::EINVAL as c_int);
    }
    let bins = std::slice::from_raw_parts(bins, num_bins).to_vec();
    (*device).post(DeviceEvent::Statistics(bins))
}

/// Give face detection results, in the device's binary format.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`], and
/// `data` must point to at least `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_metadata(
    device: *const camhal_device,
    data: *const u8,
    len: usize,
) -> c_int {
    if data.is_null() {
        return -(Errno::EINVAL as c_int);
    }
    let data = std::slice::from_raw_parts(data, len).to_vec();
    (*device).post(DeviceEvent::Metadata(data))
}

/// Report that no frame was produced within the device's watchdog period.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`].
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_frame_timeout(device: *const camhal_device) -> c_int {
    (*device).post(DeviceEvent::FrameTimeout)
}

/// Report that the device cannot continue. Every pipeline using the device
/// stops its sessions and reports the error to its client.
///
/// # Safety
///
/// `device` must be a valid pointer returned by [`camhal_device_new`].
/// `reason` can be NULL, or must be a valid zero-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn camhal_device_post_fatal_error(
    device: *const camhal_device,
    reason: *const c_char,
) -> c_int {
    let reason = match reason.is_null() {
        true => String::from("unknown error"),
        false => CStr::from_ptr(reason).to_string_lossy().into_owned(),
    };
    (*device).post(DeviceEvent::Fatal(reason))
}
