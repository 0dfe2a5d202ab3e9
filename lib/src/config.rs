use crate::memory::{ContiguousSource, DEFAULT_ALIGNMENT};

use std::time::Duration;

/// Static configuration of a `CapturePipeline`.
///
/// ```
/// # use camhal::config::PipelineConfig;
/// let config = PipelineConfig::new().preview_buffers(6).debug_fps();
/// assert_eq!(config.num_preview_buffers(), 6);
/// ```
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    preview_buffers: usize,
    record_buffers: usize,
    zsl_buffers: usize,
    stats_buffers: usize,
    alignment: usize,
    contiguous_source: ContiguousSource,
    queue_capacity: usize,
    join_timeout: Duration,
    debug_fps: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preview_buffers: 4,
            record_buffers: 9,
            zsl_buffers: 4,
            stats_buffers: 3,
            alignment: DEFAULT_ALIGNMENT,
            contiguous_source: ContiguousSource::Memfd,
            queue_capacity: 32,
            join_timeout: Duration::from_secs(5),
            debug_fps: false,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn preview_buffers(self, count: usize) -> Self {
        PipelineConfig {
            preview_buffers: count,
            ..self
        }
    }

    pub fn record_buffers(self, count: usize) -> Self {
        PipelineConfig {
            record_buffers: count,
            ..self
        }
    }

    /// Size of the ring of full resolution frames in zero shutter lag mode.
    pub fn zsl_buffers(self, count: usize) -> Self {
        PipelineConfig {
            zsl_buffers: count,
            ..self
        }
    }

    pub fn stats_buffers(self, count: usize) -> Self {
        PipelineConfig {
            stats_buffers: count,
            ..self
        }
    }

    pub fn alignment(self, alignment: usize) -> Self {
        PipelineConfig { alignment, ..self }
    }

    /// Where contiguous pools take their memory from.
    pub fn contiguous_source(self, contiguous_source: ContiguousSource) -> Self {
        PipelineConfig {
            contiguous_source,
            ..self
        }
    }

    /// Maximum number of items waiting in any queue between two stages.
    pub fn queue_capacity(self, queue_capacity: usize) -> Self {
        PipelineConfig {
            queue_capacity,
            ..self
        }
    }

    /// How long teardown waits for each stage to exit before giving up on it.
    pub fn join_timeout(self, join_timeout: Duration) -> Self {
        PipelineConfig {
            join_timeout,
            ..self
        }
    }

    /// Log the frame rate of the preview and record stages once per second.
    pub fn debug_fps(self) -> Self {
        PipelineConfig {
            debug_fps: true,
            ..self
        }
    }

    pub fn num_preview_buffers(&self) -> usize {
        self.preview_buffers
    }

    pub fn num_record_buffers(&self) -> usize {
        self.record_buffers
    }

    pub fn num_zsl_buffers(&self) -> usize {
        self.zsl_buffers
    }

    pub fn num_stats_buffers(&self) -> usize {
        self.stats_buffers
    }

    pub fn buffer_alignment(&self) -> usize {
        self.alignment
    }

    pub fn source(&self) -> &ContiguousSource {
        &self.contiguous_source
    }

    pub fn capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn stage_join_timeout(&self) -> Duration {
        self.join_timeout
    }

    pub fn fps_logging(&self) -> bool {
        self.debug_fps
    }
}
