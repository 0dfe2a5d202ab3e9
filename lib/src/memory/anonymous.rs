use super::buffer::PoolCore;
use super::mapping::Mapping;
use super::{
    BufferPool, BufferRole, FrameBuffer, PoolBackend, PoolError, PoolId, PoolRequest, PoolStats,
    SlotState,
};

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use log::{debug, error};

/// Pool of process-shared anonymous memory, for data only the CPU touches.
pub struct AnonymousBufferPool {
    role: BufferRole,
    request: PoolRequest,
    core: Result<Arc<PoolCore>, PoolError>,
}

impl AnonymousBufferPool {
    /// Create and map a pool. As with contiguous pools, a failure leaves the
    /// pool permanently uninitialized.
    pub fn create(role: BufferRole, request: PoolRequest) -> Self {
        let core = Self::map(&request).map(|mut core| {
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

    fn map(request: &PoolRequest) -> Result<PoolCore, PoolError> {
        let layout = request.layout()?;
        let len = NonZeroUsize::new(layout.total_size)
            .ok_or_else(|| PoolError::EmptyPool(request.name.clone()))?;
        let mapping = Mapping::anonymous(len).map_err(|source| PoolError::Map {
            name: request.name.clone(),
            source,
        })?;

        Ok(PoolCore::new(layout, mapping, None))
    }

    pub fn complete_initialization(&mut self) {
        if let Ok(core) = &mut self.core {
            if let Some(core) = Arc::get_mut(core) {
                core.partition();
            }
        }
    }

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

    pub fn role(&self) -> BufferRole {
        self.role
    }
}

impl BufferPool for AnonymousBufferPool {
    fn request(&self) -> &PoolRequest {
        &self.request
    }

    fn backend(&self) -> PoolBackend {
        PoolBackend::Anonymous
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
        match &self.core {
            Ok(core) => {
                let layout = core.layout();
                writeln!(
                    out,
                    "{} pool {} {} (anonymous): {} x {} bytes (aligned {})",
                    self.role,
                    self.request.name,
                    core.id(),
                    layout.buffer_count,
                    layout.buffer_size,
                    layout.aligned_buffer_size
                )?;
                core.dump_slots(out)
            }
            Err(e) => writeln!(
                out,
                "{} pool {}: uninitialized ({})",
                self.role, self.request.name, e
            ),
        }
    }
}
