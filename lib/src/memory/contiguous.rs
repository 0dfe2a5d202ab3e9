use super::buffer::{PlaneInfo, PoolCore};
use super::mapping::Mapping;
use super::{
    BufferPool, BufferRole, FrameBuffer, PoolBackend, PoolError, PoolId, PoolRequest, PoolStats,
    SlotState,
};

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

/// Where the memory of a contiguous pool comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ContiguousSource {
    /// An anonymous memfd region, shareable with the device through its file
    /// descriptor.
    #[default]
    Memfd,
    /// A device node exposing physically contiguous memory (e.g.
    /// `/dev/pmem_adsp`). Regular files are also accepted and grown to the
    /// required size.
    DeviceNode(PathBuf),
}

/// The whole region backing a contiguous pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalRegion {
    pub fd: RawFd,
    pub offset: usize,
    pub len: usize,
}

/// Pool of buffers the device writes into directly.
pub struct ContiguousBufferPool {
    role: BufferRole,
    request: PoolRequest,
    core: Result<Arc<PoolCore>, PoolError>,
}

impl ContiguousBufferPool {
    /// Create and map a pool. Failure is not reported here: the pool simply
    /// remains uninitialized, which `initialized()` and `check()` reveal.
    pub fn create(source: &ContiguousSource, role: BufferRole, request: PoolRequest) -> Self {
        let core = Self::map(source, &request).map(|mut core| {
            core.partition();
            Arc::new(core)
        });

        match &core {
            Ok(core) => debug!(
                "Created {} pool {} ({}): {} x {} bytes",
                role,
                request.name,
                core.id(),
                request.buffer_count,
                core.layout().aligned_buffer_size
            ),
            Err(e) => error!("Cannot create {} pool: {}", role, e),
        }

        Self {
            role,
            request,
            core,
        }
    }

    fn map(source: &ContiguousSource, request: &PoolRequest) -> Result<PoolCore, PoolError> {
        let layout = request.layout()?;
        let name = || request.name.clone();

        let file = match source {
            ContiguousSource::Memfd => {
                let memfd_name =
                    CString::new(format!("camhal-{}", request.name.replace('\0', "")))
                        .unwrap_or_default();
                let fd = memfd_create(&memfd_name, MemFdCreateFlag::MFD_CLOEXEC).map_err(
                    |source| PoolError::CreateRegion {
                        name: name(),
                        source,
                    },
                )?;
                let file = File::from(fd);
                file.set_len(layout.total_size as u64)
                    .map_err(|source| PoolError::SizeRegion {
                        name: name(),
                        source,
                    })?;
                file
            }
            ContiguousSource::DeviceNode(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|source| PoolError::Open {
                        name: name(),
                        path: path.clone(),
                        source,
                    })?;
                let metadata = file.metadata().map_err(|source| PoolError::Open {
                    name: name(),
                    path: path.clone(),
                    source,
                })?;
                // Device nodes report a size of 0 and are trusted to be large
                // enough. Regular files are grown if needed.
                if metadata.is_file() && metadata.len() < layout.total_size as u64 {
                    file.set_len(layout.total_size as u64)
                        .map_err(|source| PoolError::SizeRegion {
                            name: name(),
                            source,
                        })?;
                }
                file
            }
        };

        let len = NonZeroUsize::new(layout.total_size).ok_or_else(|| PoolError::EmptyPool(name()))?;
        let mapping = Mapping::shared(&file, len).map_err(|source| PoolError::Map {
            name: name(),
            source,
        })?;

        let planes = PlaneInfo {
            fd: OwnedFd::from(file),
            cbcr_offset: request.cbcr_offset,
            y_offset: request.y_offset,
        };

        Ok(PoolCore::new(layout, mapping, Some(planes)))
    }

    /// Finish partitioning the region into slots. Pools are returned fully
    /// partitioned by `create`, so this only matters for pools built by
    /// other means and is a no-op when called again.
    pub fn complete_initialization(&mut self) {
        if let Ok(core) = &mut self.core {
            if let Some(core) = Arc::get_mut(core) {
                core.partition();
            }
        }
    }

    /// Turn an uninitialized pool into the error that prevented its
    /// initialization.
    pub fn check(self) -> Result<Self, PoolError> {
        match self.core {
            Ok(core) => Ok(Self {
                role: self.role,
                request: self.request,
                core: Ok(core),
            }),
            Err(e) => Err(e),
        }
    }

    /// The error that prevented initialization, if any.
    pub fn init_error(&self) -> Option<&PoolError> {
        self.core.as_ref().err()
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn cbcr_offset(&self) -> usize {
        self.request.cbcr_offset
    }

    pub fn y_offset(&self) -> usize {
        self.request.y_offset
    }

    /// Descriptor of the whole backing region, used to register it with the
    /// device.
    pub fn region(&self) -> Option<PhysicalRegion> {
        let core = self.core.as_ref().ok()?;
        let planes = core.planes()?;

        Some(PhysicalRegion {
            fd: planes.fd.as_raw_fd(),
            offset: 0,
            len: core.mapped_len(),
        })
    }
}

impl BufferPool for ContiguousBufferPool {
    fn request(&self) -> &PoolRequest {
        &self.request
    }

    fn backend(&self) -> PoolBackend {
        PoolBackend::Contiguous
    }

    fn initialized(&self) -> bool {
        self.core.is_ok()
    }

    fn id(&self) -> Option<PoolId> {
        self.core.as_ref().ok().map(|c| c.id())
    }

    fn acquire(&self) -> Option<FrameBuffer> {
        self.core.as_ref().ok()?.acquire()
    }

    fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.core.as_ref().ok()?.slot_state(index)
    }

    fn stats(&self) -> PoolStats {
        self.core
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or_default()
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let core = match &self.core {
            Ok(core) => core,
            Err(e) => {
                return writeln!(
                    out,
                    "{} pool {}: uninitialized ({})",
                    self.role, self.request.name, e
                )
            }
        };
        let layout = core.layout();

        writeln!(
            out,
            "{} pool {} {} (contiguous): {} x {} bytes (aligned {}), frame {} bytes",
            self.role,
            self.request.name,
            core.id(),
            layout.buffer_count,
            layout.buffer_size,
            layout.aligned_buffer_size,
            layout.frame_size
        )?;
        if let Some(region) = self.region() {
            writeln!(
                out,
                "  region fd {} len {}, cbcr offset {}, y offset {}",
                region.fd, region.len, self.request.cbcr_offset, self.request.y_offset
            )?;
        }
        core.dump_slots(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Owner;

    #[test]
    fn test_memfd_pool() {
        let request = PoolRequest::new("preview", 460_800, 4)
            .frame_size(460_800)
            .plane_offsets(307_200, 0);
        let pool =
            ContiguousBufferPool::create(&ContiguousSource::Memfd, BufferRole::Preview, request);
        assert!(pool.initialized());
        assert_eq!(pool.cbcr_offset(), 307_200);

        let region = pool.region().unwrap();
        assert_eq!(region.len, 462_848 * 4);

        let buffers = pool.acquire_all();
        assert_eq!(buffers.len(), 4);
        assert!(pool.acquire().is_none());

        // Every buffer is a distinct, non-overlapping region large enough
        // for one frame.
        for (i, buffer) in buffers.iter().enumerate() {
            assert_eq!(buffer.index(), i);
            assert!(buffer.len() >= 460_800);
            let desc = buffer.descriptor().unwrap();
            assert_eq!(desc.fd, region.fd);
            assert_eq!(desc.cbcr_offset, 307_200);
            assert!(desc.offset + desc.len <= region.len);
            for other in buffers.iter().skip(i + 1) {
                let other = other.descriptor().unwrap();
                assert!(
                    desc.offset + desc.len <= other.offset || other.offset + other.len <= desc.offset
                );
            }
        }
    }

    #[test]
    fn test_buffers_do_not_alias() {
        let pool = ContiguousBufferPool::create(
            &ContiguousSource::Memfd,
            BufferRole::Record,
            PoolRequest::new("record", 1000, 3).alignment(32),
        );
        let mut buffers = pool.acquire_all();
        for (i, buffer) in buffers.iter_mut().enumerate() {
            buffer.map_mut().unwrap().fill(i as u8 + 1);
        }
        for (i, buffer) in buffers.iter().enumerate() {
            assert!(buffer.map().unwrap().iter().all(|b| *b == i as u8 + 1));
        }
    }

    #[test]
    fn test_device_node_pool() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let source = ContiguousSource::DeviceNode(file.path().to_path_buf());
        let mut pool = ContiguousBufferPool::create(
            &source,
            BufferRole::Snapshot,
            PoolRequest::new("raw", 8192, 1),
        );
        assert!(pool.initialized());
        // The backing file has been grown to hold the whole pool.
        assert_eq!(file.as_file().metadata().unwrap().len(), 8192);

        pool.complete_initialization();
        pool.complete_initialization();
        assert_eq!(pool.stats().num_free, 1);
    }

    #[test]
    fn test_failed_pool_stays_uninitialized() {
        let source = ContiguousSource::DeviceNode("/nonexistent/pmem_adsp".into());
        let mut pool = ContiguousBufferPool::create(
            &source,
            BufferRole::Preview,
            PoolRequest::new("preview", 4096, 4),
        );
        assert!(!pool.initialized());
        pool.complete_initialization();
        assert!(!pool.initialized());
        assert!(pool.acquire().is_none());
        assert!(pool.acquire_all().is_empty());
        assert!(pool.region().is_none());
        assert!(matches!(pool.init_error(), Some(PoolError::Open { .. })));
        assert!(matches!(pool.check(), Err(PoolError::Open { .. })));

        let pool = ContiguousBufferPool::create(
            &ContiguousSource::Memfd,
            BufferRole::Preview,
            PoolRequest::new("preview", 0, 4),
        );
        assert!(matches!(pool.check(), Err(PoolError::EmptyPool(_))));
    }

    #[test]
    fn test_destroying_pool_orphans_buffers() {
        let pool = ContiguousBufferPool::create(
            &ContiguousSource::Memfd,
            BufferRole::Preview,
            PoolRequest::new("preview", 4096, 2),
        );
        let mut buffer = pool.acquire().unwrap();
        buffer.hand_off(Owner::Device);
        assert_eq!(pool.slot_state(0), Some(SlotState::Owned(Owner::Device)));

        drop(pool);
        assert!(buffer.map().is_none());
        assert!(buffer.descriptor().is_none());
    }

    #[test]
    fn test_dump() {
        let pool = ContiguousBufferPool::create(
            &ContiguousSource::Memfd,
            BufferRole::Preview,
            PoolRequest::new("preview", 4096, 2).plane_offsets(2048, 0),
        );
        let _buffer = pool.acquire();
        let mut out = String::new();
        pool.dump(&mut out).unwrap();
        assert!(out.contains("preview pool preview"));
        assert!(out.contains("cbcr offset 2048"));
        assert!(out.contains("slot 0: held by pipeline"));
        assert!(out.contains("slot 1: free"));
    }
}
