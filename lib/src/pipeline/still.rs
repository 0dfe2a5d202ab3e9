//! Still capture stages: the snapshot stage receives the raw picture and
//! submits it for encoding, the jpeg stage collects the encoded image.
use super::context::{Counters, JpegEvent, PipelineContext, StillEvent};
use super::stage::StageControl;
use crate::callbacks::{MsgType, ERROR_DETAIL_ENCODE, ERROR_DETAIL_SNAPSHOT, ERROR_UNKNOWN};
use crate::device::{EncodeDone, EncodeRequest, RawPicture, SnapshotKind};
use crate::memory::{BufferPool, FrameBuffer, Owner};

use std::sync::Arc;

use log::{debug, error, info, trace, warn};

pub(crate) const SNAPSHOT: &str = "snapshot";
pub(crate) const JPEG: &str = "jpeg";

/// Default JPEG quality requested from the encoder.
pub(crate) const JPEG_QUALITY: u8 = 85;

/// Pools created for a single still capture. They live as long as the jpeg
/// stage of that capture.
pub(crate) struct StillJob {
    pub kind: SnapshotKind,
    pub pools: Vec<Box<dyn BufferPool>>,
}

fn deliver_raw(ctx: &PipelineContext, raw: &RawPicture) {
    if raw.kind == SnapshotKind::Live {
        return;
    }

    if let Some(postview) = raw.postview.as_ref() {
        if let Some(data) = postview.map() {
            let len = postview.bytes_used().min(data.len());
            ctx.messages.data(MsgType::POSTVIEW_FRAME, &data[..len]);
        }
    }

    if ctx.messages.enabled(MsgType::RAW_IMAGE) {
        if let Some(data) = raw.main.map() {
            let len = raw.main.bytes_used().min(data.len());
            ctx.messages.data(MsgType::RAW_IMAGE, &data[..len]);
        }
    } else {
        ctx.messages.notify(MsgType::RAW_IMAGE_NOTIFY, 0, 0);
    }
}

pub(crate) fn snapshot_loop(
    ctx: Arc<PipelineContext>,
    control: StageControl,
    output: FrameBuffer,
    quality: u8,
) {
    let mut output = Some(output);

    while let Some(event) = ctx.queues.still.get() {
        if !control.is_armed() {
            break;
        }

        match event {
            StillEvent::Shutter => {
                trace!("Shutter");
                ctx.messages.notify(MsgType::SHUTTER, 0, 0);
            }
            StillEvent::Raw(raw) => {
                deliver_raw(&ctx, &raw);
                let Some(output) = output.take() else {
                    warn!("Second raw picture for a single capture, dropping it");
                    continue;
                };
                submit_encode(&ctx, raw, output, quality);
                break;
            }
        }
    }
}

fn submit_encode(ctx: &PipelineContext, raw: RawPicture, mut output: FrameBuffer, quality: u8) {
    let RawPicture {
        mut main,
        postview: mut thumbnail,
        ..
    } = raw;
    main.hand_off(Owner::Device);
    if let Some(thumbnail) = thumbnail.as_mut() {
        thumbnail.hand_off(Owner::Device);
    }
    output.hand_off(Owner::Device);

    let request = EncodeRequest {
        main,
        thumbnail,
        output,
        quality,
    };
    if let Err(e) = ctx.device.encode(request) {
        error!("Cannot submit picture for encoding: {}", e);
        Counters::bump(&ctx.counters.encode_failures);
        ctx.messages.notify(MsgType::ERROR, ERROR_UNKNOWN, ERROR_DETAIL_SNAPSHOT);
        // Nothing will complete, let the jpeg stage end the capture.
        ctx.queues.jpeg.deinit();
    }
}

pub(crate) fn jpeg_loop(ctx: Arc<PipelineContext>, control: StageControl, job: StillJob) {
    let mut fragments = 0usize;
    let mut completion: Option<EncodeDone> = None;

    while let Some(event) = ctx.queues.jpeg.get() {
        if !control.is_armed() {
            break;
        }

        match event {
            JpegEvent::Fragment(size) => {
                fragments += size;
                trace!("JPEG fragment of {} bytes ({} so far)", size, fragments);
            }
            JpegEvent::Done(done) => {
                completion = Some(done);
                break;
            }
        }
    }

    // The capture is over whatever happened: close its inputs before
    // leaving the still state so a new capture starts from clean queues.
    ctx.queues.still.deinit();
    ctx.queues.jpeg.deinit();
    drop(ctx.queues.still.flush());
    drop(ctx.queues.jpeg.flush());

    let image = match completion {
        Some(EncodeDone { request, success }) => {
            let EncodeRequest { main, output, .. } = request;
            ctx.recycle(main);
            if success && output.bytes_used() == fragments {
                output
            } else {
                warn!(
                    "Encoding failed (success: {}, {} of {} bytes received)",
                    success,
                    fragments,
                    output.bytes_used()
                );
                Counters::bump(&ctx.counters.encode_failures);
                ctx.finish_still(job.kind, false);
                ctx.messages.notify(MsgType::ERROR, ERROR_UNKNOWN, ERROR_DETAIL_ENCODE);
                return;
            }
        }
        None => {
            debug!("Still capture cancelled");
            ctx.finish_still(job.kind, false);
            return;
        }
    };

    ctx.finish_still(job.kind, true);
    Counters::bump(&ctx.counters.pictures_taken);
    info!("Picture taken ({} bytes)", image.bytes_used());
    if let Some(data) = image.map() {
        ctx.messages.data(MsgType::COMPRESSED_IMAGE, &data[..image.bytes_used()]);
    }
    debug!("Releasing {} still capture pools", job.pools.len());
}
