//! C FFI of the camhal crate.
//!
//! This crate provides a C API over the capture pipeline. It has two halves:
//!
//! * [`device`] lets a C program implement the imaging device: the pipeline
//!   calls into it through a table of function pointers, and it reports
//!   completed work through the `camhal_device_post_*` functions.
//! * [`camera`] exposes the pipeline itself: its lifecycle, every state
//!   operation and the message mask, with C consumer callbacks.

pub mod camera;
pub mod device;

use camhal::memory::BufferRole;
use camhal::params::{BufferParameters, HfrRate, PixelFormat, Size};
use camhal::{CameraError, ErrorKind};
use nix::errno::Errno;
use std::os::raw::c_int;

static INIT: std::sync::Once = std::sync::Once::new();

/// Initialize the camhal library. This only sets up the proper hooks for
/// logging, so although it is not a hard requirement to call this function,
/// failure to do so will result in no logs being printed.
#[no_mangle]
pub extern "C" fn camhal_init() {
    INIT.call_once(|| {
        #[cfg(feature = "env_logger")]
        env_logger::builder().format_timestamp(None).init();

        #[cfg(feature = "android")]
        android_logger::init_once(
            android_logger::Config::default().with_min_level(log::Level::Trace),
        );
    });
}

/// Width and height of a stream.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct camhal_size {
    pub width: u32,
    pub height: u32,
}

impl From<Size> for camhal_size {
    fn from(size: Size) -> Self {
        camhal_size {
            width: size.width,
            height: size.height,
        }
    }
}

impl From<camhal_size> for Size {
    fn from(size: camhal_size) -> Self {
        Size::new(size.width, size.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum camhal_pixel_format {
    Nv21,
    Nv12,
    Yv12,
}

impl From<PixelFormat> for camhal_pixel_format {
    fn from(format: PixelFormat) -> Self {
        match format {
            PixelFormat::Nv21 => camhal_pixel_format::Nv21,
            PixelFormat::Nv12 => camhal_pixel_format::Nv12,
            PixelFormat::Yv12 => camhal_pixel_format::Yv12,
        }
    }
}

impl From<camhal_pixel_format> for PixelFormat {
    fn from(format: camhal_pixel_format) -> Self {
        match format {
            camhal_pixel_format::Nv21 => PixelFormat::Nv21,
            camhal_pixel_format::Nv12 => PixelFormat::Nv12,
            camhal_pixel_format::Yv12 => PixelFormat::Yv12,
        }
    }
}

/// The parameters shaping the buffers of the pipeline.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct camhal_parameters {
    pub preview_size: camhal_size,
    pub preview_format: camhal_pixel_format,
    pub video_size: camhal_size,
    pub picture_size: camhal_size,
    pub thumbnail_size: camhal_size,
    /// Frame rate of the high frame rate mode (60, 90 or 120), or 0 to
    /// disable it.
    pub hfr_fps: u32,
    pub histogram: bool,
    pub face_detection: bool,
    /// Stream full resolution frames alongside the preview and take
    /// pictures from the most recent one.
    pub zsl: bool,
}

impl From<&BufferParameters> for camhal_parameters {
    fn from(params: &BufferParameters) -> Self {
        camhal_parameters {
            preview_size: params.preview_size.into(),
            preview_format: params.preview_format.into(),
            video_size: params.video_size.into(),
            picture_size: params.picture_size.into(),
            thumbnail_size: params.thumbnail_size.into(),
            hfr_fps: params.hfr.map(HfrRate::fps).unwrap_or(0),
            histogram: params.histogram,
            face_detection: params.face_detection,
            zsl: params.zsl,
        }
    }
}

impl TryFrom<&camhal_parameters> for BufferParameters {
    type Error = Errno;

    fn try_from(params: &camhal_parameters) -> Result<Self, Self::Error> {
        let hfr = match params.hfr_fps {
            0 => None,
            fps => Some(HfrRate::n(fps).ok_or(Errno::EINVAL)?),
        };

        Ok(BufferParameters {
            preview_size: params.preview_size.into(),
            preview_format: params.preview_format.into(),
            video_size: params.video_size.into(),
            picture_size: params.picture_size.into(),
            thumbnail_size: params.thumbnail_size.into(),
            hfr,
            histogram: params.histogram,
            face_detection: params.face_detection,
            zsl: params.zsl,
        })
    }
}

/// Role of a buffer, as used to address buffers together with their index.
/// The values match those of the library's `BufferRole`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum camhal_buffer_role {
    Preview = 0,
    Record = 1,
    Snapshot = 2,
    Thumbnail = 3,
    LiveSnapshot = 4,
    Jpeg = 5,
    Statistics = 6,
    Metadata = 7,
    Zsl = 8,
    LastPreview = 9,
}

impl From<BufferRole> for camhal_buffer_role {
    fn from(role: BufferRole) -> Self {
        match role {
            BufferRole::Preview => camhal_buffer_role::Preview,
            BufferRole::Record => camhal_buffer_role::Record,
            BufferRole::Snapshot => camhal_buffer_role::Snapshot,
            BufferRole::Thumbnail => camhal_buffer_role::Thumbnail,
            BufferRole::LiveSnapshot => camhal_buffer_role::LiveSnapshot,
            BufferRole::Jpeg => camhal_buffer_role::Jpeg,
            BufferRole::Statistics => camhal_buffer_role::Statistics,
            BufferRole::Metadata => camhal_buffer_role::Metadata,
            BufferRole::Zsl => camhal_buffer_role::Zsl,
            BufferRole::LastPreview => camhal_buffer_role::LastPreview,
        }
    }
}

/// Convert the result of a pipeline operation into 0 or a negative errno
/// value.
fn error_code(res: Result<(), CameraError>) -> c_int {
    let e = match res {
        Ok(()) => return 0,
        Err(e) => e,
    };

    log::warn!("Operation failed: {}", e);
    let errno = match (&e, e.kind()) {
        (CameraError::Released, _) => Errno::ENODEV,
        (CameraError::Parameters(_), _) => Errno::EINVAL,
        (CameraError::BufferBusy(_), _) => Errno::EBUSY,
        (_, ErrorKind::State) => Errno::EBUSY,
        (_, ErrorKind::Resource) => Errno::ENOMEM,
        (_, ErrorKind::Device) => Errno::EIO,
        (_, ErrorKind::Fatal) => Errno::ENODEV,
    };
    -(errno as c_int)
}
