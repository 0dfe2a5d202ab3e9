use super::mapping::Mapping;
use super::{PoolId, PoolLayout};

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, Weak,
};

use log::trace;

/// Party currently holding a slot that is out of its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    /// Taken out of the pool, not handed to anyone yet.
    Pipeline,
    /// Registered with or being filled by the imaging device.
    Device,
    /// Waiting in a frame queue.
    Queue,
    /// Being processed by the named consumer stage.
    Consumer(&'static str),
    /// Delivered to the client of the pipeline.
    Client,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Pipeline => f.write_str("pipeline"),
            Owner::Device => f.write_str("device"),
            Owner::Queue => f.write_str("queue"),
            Owner::Consumer(name) => write!(f, "consumer {}", name),
            Owner::Client => f.write_str("client"),
        }
    }
}

/// State of a slot as recorded by its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// The slot is in the pool and can be acquired.
    Free,
    /// A `FrameBuffer` for this slot exists and is held by `Owner`.
    Owned(Owner),
}

/// Counts of slots per state, kept up-to-date as handles move around.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub num_free: usize,
    pub num_with_device: usize,
    pub num_queued: usize,
    pub num_with_consumers: usize,
}

#[derive(Default)]
struct SlotCounters {
    num_free: AtomicUsize,
    num_with_device: AtomicUsize,
    num_queued: AtomicUsize,
    num_with_consumers: AtomicUsize,
}

impl SlotCounters {
    fn counter(&self, state: &SlotState) -> &AtomicUsize {
        match state {
            SlotState::Free => &self.num_free,
            SlotState::Owned(Owner::Device) => &self.num_with_device,
            SlotState::Owned(Owner::Queue) => &self.num_queued,
            SlotState::Owned(_) => &self.num_with_consumers,
        }
    }
}

/// Plane layout information of buffers the device writes into.
#[derive(Debug)]
pub(crate) struct PlaneInfo {
    pub(crate) fd: OwnedFd,
    pub(crate) cbcr_offset: usize,
    pub(crate) y_offset: usize,
}

/// State shared between a pool and the handles of its slots.
pub(crate) struct PoolCore {
    id: PoolId,
    layout: PoolLayout,
    mapping: Mapping,
    planes: Option<PlaneInfo>,
    slots: Vec<Mutex<SlotState>>,
    free: Mutex<VecDeque<usize>>,
    counters: SlotCounters,
}

impl PoolCore {
    pub(crate) fn new(layout: PoolLayout, mapping: Mapping, planes: Option<PlaneInfo>) -> Self {
        Self {
            id: PoolId::next(),
            layout,
            mapping,
            planes,
            slots: Vec::new(),
            free: Mutex::new(VecDeque::new()),
            counters: Default::default(),
        }
    }

    /// Partition the mapping into slots. Does nothing if this has already
    /// been done.
    pub(crate) fn partition(&mut self) {
        if !self.slots.is_empty() {
            return;
        }

        let count = self.layout.buffer_count;
        self.slots = (0..count).map(|_| Mutex::new(SlotState::Free)).collect();
        *self.free.get_mut().unwrap() = (0..count).collect();
        self.counters.num_free.store(count, Ordering::Relaxed);
    }

    pub(crate) fn id(&self) -> PoolId {
        self.id
    }

    pub(crate) fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    pub(crate) fn planes(&self) -> Option<&PlaneInfo> {
        self.planes.as_ref()
    }

    pub(crate) fn mapped_len(&self) -> usize {
        self.mapping.len()
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> Option<FrameBuffer> {
        let index = self.free.lock().unwrap().pop_front()?;
        self.update_state(index, SlotState::Owned(Owner::Pipeline));

        Some(FrameBuffer {
            pool: Arc::downgrade(self),
            pool_id: self.id,
            index,
            offset: self.layout.slot_offset(index),
            len: self.layout.buffer_size,
            bytes_used: self.layout.frame_size,
            handoffs: 0,
        })
    }

    pub(crate) fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|s| *s.lock().unwrap())
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            num_free: self.counters.num_free.load(Ordering::Relaxed),
            num_with_device: self.counters.num_with_device.load(Ordering::Relaxed),
            num_queued: self.counters.num_queued.load(Ordering::Relaxed),
            num_with_consumers: self.counters.num_with_consumers.load(Ordering::Relaxed),
        }
    }

    /// Change the state of slot `index`, keeping the counters in sync.
    fn update_state(&self, index: usize, new_state: SlotState) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        let mut state = slot.lock().unwrap();
        self.counters.counter(&state).fetch_sub(1, Ordering::Relaxed);
        *state = new_state;
        self.counters.counter(&state).fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, index: usize) {
        self.update_state(index, SlotState::Free);
        self.free.lock().unwrap().push_back(index);
    }

    pub(crate) fn dump_slots(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for (index, slot) in self.slots.iter().enumerate() {
            match *slot.lock().unwrap() {
                SlotState::Free => writeln!(out, "  slot {}: free", index)?,
                SlotState::Owned(owner) => writeln!(out, "  slot {}: held by {}", index, owner)?,
            }
        }
        Ok(())
    }
}

/// Handle to one slot of a pool.
///
/// There is only ever one handle per slot. Moving the handle moves the
/// ownership of the slot: `hand_off` records each transfer in the pool so
/// the current owner of every slot can be inspected. Dropping the handle
/// gives the slot back to its pool.
pub struct FrameBuffer {
    pool: Weak<PoolCore>,
    pool_id: PoolId,
    index: usize,
    offset: usize,
    len: usize,
    bytes_used: usize,
    handoffs: u32,
}

impl FrameBuffer {
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Offset of this buffer from the start of the pool's region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Usable size of the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bytes of valid data, as set by the producer.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn set_bytes_used(&mut self, bytes_used: usize) {
        self.bytes_used = bytes_used.min(self.len);
    }

    /// Number of times this buffer changed hands since it left the pool.
    pub fn handoffs(&self) -> u32 {
        self.handoffs
    }

    /// Whether the pool this buffer belongs to still exists.
    pub fn is_alive(&self) -> bool {
        self.pool.strong_count() > 0
    }

    /// Current owner as recorded by the pool, if the pool is still alive.
    pub fn owner(&self) -> Option<Owner> {
        let pool = self.pool.upgrade()?;
        match pool.slot_state(self.index)? {
            SlotState::Owned(owner) => Some(owner),
            SlotState::Free => None,
        }
    }

    /// Record that this buffer is now held by `owner`.
    pub fn hand_off(&mut self, owner: Owner) {
        self.handoffs = self.handoffs.wrapping_add(1);
        if let Some(pool) = self.pool.upgrade() {
            trace!(
                "pool {} buffer {}: handed to {} ({})",
                self.pool_id,
                self.index,
                owner,
                self.handoffs
            );
            pool.update_state(self.index, SlotState::Owned(owner));
        }
    }

    /// Description of the buffer for DMA setup, for buffers of contiguous
    /// pools that are still alive.
    pub fn descriptor(&self) -> Option<BufferDescriptor> {
        let pool = self.pool.upgrade()?;
        let planes = pool.planes()?;

        Some(BufferDescriptor {
            fd: planes.fd.as_raw_fd(),
            offset: self.offset,
            len: self.len,
            cbcr_offset: planes.cbcr_offset,
            y_offset: planes.y_offset,
        })
    }

    /// Read access to the content of the buffer. Returns `None` if the pool
    /// has been destroyed.
    pub fn map(&self) -> Option<BufferView<'_>> {
        let pool = self.pool.upgrade()?;
        Some(BufferView {
            pool,
            offset: self.offset,
            len: self.len,
            _buffer: PhantomData,
        })
    }

    /// Write access to the content of the buffer. Returns `None` if the pool
    /// has been destroyed.
    pub fn map_mut(&mut self) -> Option<BufferViewMut<'_>> {
        let pool = self.pool.upgrade()?;
        Some(BufferViewMut {
            pool,
            offset: self.offset,
            len: self.len,
            _buffer: PhantomData,
        })
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("pool", &self.pool_id)
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("bytes_used", &self.bytes_used)
            .field("handoffs", &self.handoffs)
            .finish()
    }
}

impl Drop for FrameBuffer {
    /// Return the slot to the pool if it still exists.
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.index);
        }
    }
}

/// Location of a buffer inside a contiguous region, as needed by the device
/// to program its DMA engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub fd: RawFd,
    pub offset: usize,
    pub len: usize,
    pub cbcr_offset: usize,
    pub y_offset: usize,
}

/// Read-only view of a buffer's memory. Keeps the mapping alive for as long
/// as it exists.
pub struct BufferView<'a> {
    pool: Arc<PoolCore>,
    offset: usize,
    len: usize,
    _buffer: PhantomData<&'a FrameBuffer>,
}

impl Deref for BufferView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safe because the range is the buffer's slot, and the view borrows
        // the only handle to that slot.
        unsafe { self.pool.mapping.slice(self.offset, self.len) }
    }
}

impl AsRef<[u8]> for BufferView<'_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

/// Writable view of a buffer's memory.
pub struct BufferViewMut<'a> {
    pool: Arc<PoolCore>,
    offset: usize,
    len: usize,
    _buffer: PhantomData<&'a mut FrameBuffer>,
}

impl Deref for BufferViewMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safe because the range is the buffer's slot, and the view mutably
        // borrows the only handle to that slot.
        unsafe { self.pool.mapping.slice(self.offset, self.len) }
    }
}

impl DerefMut for BufferViewMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safe for the same reason as above.
        unsafe { self.pool.mapping.slice_mut(self.offset, self.len) }
    }
}

impl AsMut<[u8]> for BufferViewMut<'_> {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}
