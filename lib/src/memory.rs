//! Frame buffer pools.
//!
//! A pool maps a single backing region once and partitions it into
//! `buffer_count` fixed-size slots, each rounded up to the pool's alignment.
//! Two backends are supported:
//!
//! * `ContiguousBufferPool` maps a region the imaging device can write into
//!   directly (a physically-contiguous device node, or an anonymous memfd
//!   region that can be handed to the device through its file descriptor).
//!   It also carries the chroma and luma plane offsets the device needs.
//! * `AnonymousBufferPool` maps process-shared anonymous memory for data that
//!   only the CPU touches: encoded JPEG bytes, statistics, metadata blobs.
//!
//! Slots are handed out as `FrameBuffer` handles. A handle is not clonable,
//! so at any time exactly one party owns a given slot: the pool itself (the
//! slot is free), the device, a `FrameQueue` or a consumer stage. Dropping a
//! handle returns its slot to the pool it came from, provided the pool still
//! exists. Handles outliving their pool become inert: their data cannot be
//! accessed anymore.
//!
//! Pools never change size. When the geometry of a stream changes, the pool
//! serving it is destroyed and a new one is created.
mod anonymous;
mod buffer;
mod contiguous;
mod mapping;

pub use anonymous::*;
pub use buffer::*;
pub use contiguous::*;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use enumn::N;
use thiserror::Error;

/// Default alignment of the slots of a pool.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Round `value` up to the next multiple of `alignment`. An alignment of 0 or
/// 1 leaves the value untouched.
pub fn align_up(value: usize, alignment: usize) -> Option<usize> {
    if alignment <= 1 {
        return Some(value);
    }

    value
        .checked_add(alignment - 1)
        .map(|v| v / alignment * alignment)
}

/// What the buffers of a pool are used for. The numeric values are stable and
/// used to address pools through the C interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
#[repr(u32)]
pub enum BufferRole {
    Preview = 0,
    Record = 1,
    Snapshot = 2,
    Thumbnail = 3,
    LiveSnapshot = 4,
    Jpeg = 5,
    Statistics = 6,
    Metadata = 7,
    /// Ring of full resolution frames of the zero shutter lag mode.
    Zsl = 8,
    /// Copy of the last preview frame, shown while a picture is taken.
    LastPreview = 9,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BufferRole::Preview => "preview",
            BufferRole::Record => "record",
            BufferRole::Snapshot => "snapshot",
            BufferRole::Thumbnail => "thumbnail",
            BufferRole::LiveSnapshot => "live snapshot",
            BufferRole::Jpeg => "jpeg",
            BufferRole::Statistics => "statistics",
            BufferRole::Metadata => "metadata",
            BufferRole::Zsl => "zsl",
            BufferRole::LastPreview => "last preview",
        };
        f.write_str(s)
    }
}

/// Unique identifier of a pool instance. Two pools created one after the
/// other for the same role never share an identifier, which lets the
/// pipeline recognize buffers belonging to a previous session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(u64);

impl PoolId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        PoolId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything needed to lay out a pool. Built with a consuming builder:
///
/// ```
/// # use camhal::memory::PoolRequest;
/// let request = PoolRequest::new("preview", 460_800, 4)
///     .frame_size(460_800)
///     .plane_offsets(307_200, 0);
/// assert_eq!(request.buffer_count, 4);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolRequest {
    pub name: String,
    pub buffer_size: usize,
    pub buffer_count: usize,
    pub frame_size: usize,
    pub alignment: usize,
    pub cbcr_offset: usize,
    pub y_offset: usize,
}

impl PoolRequest {
    pub fn new<S: Into<String>>(name: S, buffer_size: usize, buffer_count: usize) -> Self {
        Self {
            name: name.into(),
            buffer_size,
            buffer_count,
            frame_size: buffer_size,
            alignment: DEFAULT_ALIGNMENT,
            cbcr_offset: 0,
            y_offset: 0,
        }
    }

    pub fn frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Offsets of the chroma and luma planes inside each buffer.
    pub fn plane_offsets(mut self, cbcr_offset: usize, y_offset: usize) -> Self {
        self.cbcr_offset = cbcr_offset;
        self.y_offset = y_offset;
        self
    }

    /// Validate the request and compute the final layout of the pool.
    pub fn layout(&self) -> Result<PoolLayout, PoolError> {
        if self.buffer_size == 0 || self.buffer_count == 0 {
            return Err(PoolError::EmptyPool(self.name.clone()));
        }
        if self.frame_size > self.buffer_size {
            return Err(PoolError::FrameTooLarge {
                name: self.name.clone(),
                frame_size: self.frame_size,
                buffer_size: self.buffer_size,
            });
        }

        let overflow = || PoolError::Overflow(self.name.clone());
        let aligned_buffer_size = align_up(self.buffer_size, self.alignment).ok_or_else(overflow)?;
        let total_size = aligned_buffer_size
            .checked_mul(self.buffer_count)
            .ok_or_else(overflow)?;

        Ok(PoolLayout {
            name: self.name.clone(),
            buffer_size: self.buffer_size,
            aligned_buffer_size,
            buffer_count: self.buffer_count,
            frame_size: self.frame_size,
            total_size,
        })
    }
}

/// Final layout of a pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolLayout {
    pub name: String,
    pub buffer_size: usize,
    pub aligned_buffer_size: usize,
    pub buffer_count: usize,
    pub frame_size: usize,
    pub total_size: usize,
}

impl PoolLayout {
    /// Offset of slot `index` from the start of the mapped region.
    pub fn slot_offset(&self, index: usize) -> usize {
        index * self.aligned_buffer_size
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool {0}: zero-sized buffers or no buffers requested")]
    EmptyPool(String),
    #[error("pool {name}: frame size {frame_size} exceeds buffer size {buffer_size}")]
    FrameTooLarge {
        name: String,
        frame_size: usize,
        buffer_size: usize,
    },
    #[error("pool {0}: requested size overflows")]
    Overflow(String),
    #[error("pool {name}: cannot open {}: {source}", path.display())]
    Open {
        name: String,
        path: PathBuf,
        source: io::Error,
    },
    #[error("pool {name}: cannot create memory region: {source}")]
    CreateRegion { name: String, source: nix::Error },
    #[error("pool {name}: cannot size memory region: {source}")]
    SizeRegion { name: String, source: io::Error },
    #[error("pool {name}: region of {available} bytes cannot hold {required} bytes")]
    RegionTooSmall {
        name: String,
        available: u64,
        required: usize,
    },
    #[error("pool {name}: mapping failed: {source}")]
    Map { name: String, source: nix::Error },
}

/// Which kind of memory backs a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolBackend {
    Contiguous,
    Anonymous,
}

impl fmt::Display for PoolBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolBackend::Contiguous => f.write_str("contiguous"),
            PoolBackend::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// Operations common to every pool backend.
pub trait BufferPool: Send + Sync {
    /// Layout requested for this pool. Available even if the pool failed to
    /// initialize.
    fn request(&self) -> &PoolRequest;

    fn backend(&self) -> PoolBackend;

    /// Whether the backing region has been mapped and partitioned. A pool
    /// that failed to initialize stays uninitialized for its whole life and
    /// never hands out buffers.
    fn initialized(&self) -> bool;

    /// Identifier of this pool instance, if it is initialized.
    fn id(&self) -> Option<PoolId>;

    /// Take a free slot out of the pool.
    fn acquire(&self) -> Option<FrameBuffer>;

    /// Take every free slot out of the pool, in index order.
    fn acquire_all(&self) -> Vec<FrameBuffer> {
        let mut buffers: Vec<FrameBuffer> = std::iter::from_fn(|| self.acquire()).collect();
        buffers.sort_by_key(|b| b.index());
        buffers
    }

    /// Current state of slot `index`.
    fn slot_state(&self, index: usize) -> Option<SlotState>;

    fn stats(&self) -> PoolStats;

    /// Write a human-readable description of the pool into `out`.
    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}
