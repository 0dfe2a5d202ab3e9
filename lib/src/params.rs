//! Buffer-relevant capture parameters and the frame geometries derived from
//! them.
use std::fmt;

use enumn::N;
use thiserror::Error;

/// Largest width or height accepted for any stream.
pub const MAX_DIMENSION: u32 = 8192;
/// Largest preview size usable in high frame rate mode.
pub const HFR_MAX_PREVIEW: Size = Size::new(800, 480);
/// Room reserved in JPEG buffers for headers and EXIF data.
pub const JPEG_HEADER_RESERVE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn fits_in(&self, other: &Size) -> bool {
        self.width <= other.width && self.height <= other.height
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// YUV 4:2:0 layouts the pipeline knows how to size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Y plane followed by interleaved CrCb.
    #[default]
    Nv21,
    /// Y plane followed by interleaved CbCr.
    Nv12,
    /// Y, V and U planes with 16-byte aligned strides.
    Yv12,
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Nv21 => f.write_str("NV21"),
            PixelFormat::Nv12 => f.write_str("NV12"),
            PixelFormat::Yv12 => f.write_str("YV12"),
        }
    }
}

/// Supported high frame rate modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum HfrRate {
    Fps60 = 60,
    Fps90 = 90,
    Fps120 = 120,
}

impl HfrRate {
    pub fn fps(self) -> u32 {
        self as u32
    }

    /// Only one frame out of this many is shown in preview, keeping the
    /// display at 30 frames per second.
    pub fn preview_decimation(self) -> u32 {
        self.fps() / 30
    }
}

/// Memory layout of one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub size: Size,
    pub format: PixelFormat,
    pub frame_size: usize,
    pub y_offset: usize,
    pub cbcr_offset: usize,
}

fn align16(v: usize) -> usize {
    (v + 15) & !15
}

impl FrameGeometry {
    pub fn new(size: Size, format: PixelFormat) -> Self {
        let width = size.width as usize;
        let height = size.height as usize;

        let (frame_size, cbcr_offset) = match format {
            PixelFormat::Nv21 | PixelFormat::Nv12 => (width * height * 3 / 2, width * height),
            PixelFormat::Yv12 => {
                let y_stride = align16(width);
                let c_stride = align16(width / 2);
                let y_size = y_stride * height;
                (y_size + c_stride * height, y_size)
            }
        };

        Self {
            size,
            format,
            frame_size,
            y_offset: 0,
            cbcr_offset,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("{what} size {size} is invalid (must be even, non-zero and at most {})", MAX_DIMENSION)]
    InvalidSize { what: &'static str, size: Size },
    #[error("high frame rate mode requires a preview of at most {}, got {0}", HFR_MAX_PREVIEW)]
    HfrPreviewTooLarge(Size),
    #[error("zero shutter lag cannot be combined with high frame rate mode")]
    ZslWithHfr,
}

/// The parameters that shape the buffers of the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferParameters {
    pub preview_size: Size,
    pub preview_format: PixelFormat,
    pub video_size: Size,
    pub picture_size: Size,
    pub thumbnail_size: Size,
    pub hfr: Option<HfrRate>,
    pub histogram: bool,
    pub face_detection: bool,
    /// Zero shutter lag: full resolution frames stream alongside the
    /// preview, and pictures are taken from the most recent one.
    pub zsl: bool,
}

impl Default for BufferParameters {
    fn default() -> Self {
        Self {
            preview_size: Size::new(640, 480),
            preview_format: PixelFormat::Nv21,
            video_size: Size::new(640, 480),
            picture_size: Size::new(2048, 1536),
            thumbnail_size: Size::new(512, 384),
            hfr: None,
            histogram: false,
            face_detection: false,
            zsl: false,
        }
    }
}

/// Groups of parameters that changed between two parameter sets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParameterChanges {
    pub preview: bool,
    pub video: bool,
    pub still: bool,
    pub hfr: bool,
    pub analysis: bool,
}

impl ParameterChanges {
    pub fn any(&self) -> bool {
        self.preview || self.video || self.still || self.hfr || self.analysis
    }
}

impl BufferParameters {
    pub fn validate(&self) -> Result<(), ParameterError> {
        let sizes = [
            ("preview", self.preview_size),
            ("video", self.video_size),
            ("picture", self.picture_size),
            ("thumbnail", self.thumbnail_size),
        ];
        for (what, size) in sizes {
            let valid = size.width > 0
                && size.height > 0
                && size.width % 2 == 0
                && size.height % 2 == 0
                && size.fits_in(&Size::new(MAX_DIMENSION, MAX_DIMENSION));
            if !valid {
                return Err(ParameterError::InvalidSize { what, size });
            }
        }

        if self.hfr.is_some() && !self.preview_size.fits_in(&HFR_MAX_PREVIEW) {
            return Err(ParameterError::HfrPreviewTooLarge(self.preview_size));
        }

        if self.zsl && self.hfr.is_some() {
            return Err(ParameterError::ZslWithHfr);
        }

        Ok(())
    }

    pub fn changes_from(&self, previous: &BufferParameters) -> ParameterChanges {
        ParameterChanges {
            preview: self.preview_size != previous.preview_size
                || self.preview_format != previous.preview_format
                || self.zsl != previous.zsl,
            video: self.video_size != previous.video_size,
            still: self.picture_size != previous.picture_size
                || self.thumbnail_size != previous.thumbnail_size,
            hfr: self.hfr != previous.hfr,
            analysis: self.histogram != previous.histogram
                || self.face_detection != previous.face_detection,
        }
    }

    pub fn preview_geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.preview_size, self.preview_format)
    }

    pub fn video_geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.video_size, self.preview_format)
    }

    pub fn picture_geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.picture_size, PixelFormat::Nv21)
    }

    pub fn thumbnail_geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.thumbnail_size, PixelFormat::Nv21)
    }

    /// Worst-case size of a JPEG encoded from a frame of `main` size with an
    /// embedded thumbnail.
    pub fn jpeg_max_size(&self, main: Size) -> usize {
        FrameGeometry::new(main, PixelFormat::Nv21).frame_size
            + self.thumbnail_geometry().frame_size
            + JPEG_HEADER_RESERVE
    }
}
