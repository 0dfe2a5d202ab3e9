use super::context::{Counters, PipelineContext, ServiceEvent};
use super::stage::StageControl;
use crate::callbacks::{
    MsgType, ERROR_DETAIL_FATAL, ERROR_DETAIL_FRAME_TIMEOUT, ERROR_SERVER_DIED, ERROR_UNKNOWN,
};
use crate::config::PipelineConfig;
use crate::memory::{
    AnonymousBufferPool, BufferPool, BufferRole, FrameBuffer, PoolError, PoolRequest,
};

use std::fmt;
use std::sync::Arc;

use log::{debug, error, trace, warn};

pub(crate) const SERVICE: &str = "service";

pub const HISTOGRAM_BINS: usize = 256;
/// Size of a statistics buffer: the bins, preceded by the highest bin value.
pub const STATS_BUFFER_SIZE: usize = (HISTOGRAM_BINS + 1) * std::mem::size_of::<u32>();
pub const METADATA_BUFFER_SIZE: usize = 4096;

/// Pools used by the service stage for the whole life of the pipeline.
pub(crate) struct AnalysisPools {
    stats: AnonymousBufferPool,
    metadata: AnonymousBufferPool,
}

impl AnalysisPools {
    pub(crate) fn create(config: &PipelineConfig) -> Result<Self, PoolError> {
        Ok(Self {
            stats: AnonymousBufferPool::create(
                BufferRole::Statistics,
                PoolRequest::new("statistics", STATS_BUFFER_SIZE, config.num_stats_buffers()),
            )
            .check()?,
            metadata: AnonymousBufferPool::create(
                BufferRole::Metadata,
                PoolRequest::new("metadata", METADATA_BUFFER_SIZE, 1),
            )
            .check()?,
        })
    }

    pub(crate) fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.stats.dump(out)?;
        self.metadata.dump(out)
    }
}

/// Copy `bytes` at the start of `buffer` and deliver them as `msg`.
fn deliver_copy(ctx: &PipelineContext, msg: MsgType, mut buffer: FrameBuffer, bytes: &[u8]) {
    let len = bytes.len().min(buffer.len());
    if len < bytes.len() {
        warn!("{:?} payload of {} bytes truncated to {}", msg, bytes.len(), len);
    }

    match buffer.map_mut() {
        Some(mut data) => data[..len].copy_from_slice(&bytes[..len]),
        None => return,
    }
    buffer.set_bytes_used(len);

    if let Some(data) = buffer.map() {
        ctx.messages.data(msg, &data[..len]);
    }
}

fn handle_statistics(ctx: &PipelineContext, pools: &AnalysisPools, histogram: Vec<u32>) {
    if !ctx.histogram() {
        trace!("Histogram disabled, dropping statistics");
        return;
    }
    let Some(buffer) = pools.stats.acquire() else {
        warn!("No free statistics buffer, dropping histogram");
        return;
    };

    let max = histogram.iter().copied().max().unwrap_or(0);
    let bytes: Vec<u8> = std::iter::once(max)
        .chain(histogram.into_iter().take(HISTOGRAM_BINS))
        .flat_map(u32::to_ne_bytes)
        .collect();
    deliver_copy(ctx, MsgType::STATS_DATA, buffer, &bytes);
}

fn handle_metadata(ctx: &PipelineContext, pools: &AnalysisPools, metadata: Vec<u8>) {
    if !ctx.face_detection() {
        trace!("Face detection disabled, dropping metadata");
        return;
    }
    let Some(buffer) = pools.metadata.acquire() else {
        warn!("Metadata buffer busy, dropping face detection results");
        return;
    };
    deliver_copy(ctx, MsgType::PREVIEW_METADATA, buffer, &metadata);
}

/// Handle the asynchronous device events that are not part of a stream.
/// `teardown` stops every session and brings the pipeline back to idle.
pub(crate) fn service_loop<F>(
    ctx: Arc<PipelineContext>,
    control: StageControl,
    pools: Arc<AnalysisPools>,
    teardown: F,
) where
    F: Fn(),
{
    while let Some(event) = ctx.queues.service.get() {
        if !control.is_armed() {
            break;
        }

        match event {
            ServiceEvent::Statistics(histogram) => handle_statistics(&ctx, &pools, histogram),
            ServiceEvent::Metadata(metadata) => handle_metadata(&ctx, &pools, metadata),
            ServiceEvent::FrameTimeout => {
                warn!("Device frame timeout");
                Counters::bump(&ctx.counters.frame_timeouts);
                ctx.messages.notify(MsgType::ERROR, ERROR_UNKNOWN, ERROR_DETAIL_FRAME_TIMEOUT);
            }
            ServiceEvent::Fatal(reason) => {
                error!("Fatal device error: {}", reason);
                Counters::bump(&ctx.counters.fatal_errors);
                teardown();
                if ctx.report_fatal() {
                    ctx.messages.notify(MsgType::ERROR, ERROR_SERVER_DIED, ERROR_DETAIL_FATAL);
                } else {
                    debug!("Fatal error already reported");
                }
            }
        }
    }
}
