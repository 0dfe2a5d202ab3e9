//! Stages consuming the continuous preview and video streams.
use super::context::{Counters, PipelineContext};
use super::stage::{FpsCounter, StageControl};
use crate::callbacks::{FrameReturn, MsgType, RecordingFrame};
use crate::device::{Frame, StreamKind};
use crate::memory::Owner;

use std::sync::{Arc, Weak};

use log::{trace, warn};

pub(crate) const DISPATCH: &str = "frame-dispatch";
pub(crate) const PREVIEW: &str = "preview";
pub(crate) const HFR: &str = "hfr";
pub(crate) const RECORD: &str = "record";

/// Forward device frames to the stage consuming their stream.
pub(crate) fn dispatch_loop(ctx: Arc<PipelineContext>, control: StageControl) {
    while let Some(mut frame) = ctx.queues.busy.get() {
        frame.buffer.hand_off(Owner::Consumer(DISPATCH));
        if !control.is_armed() {
            ctx.return_to_device(frame);
            break;
        }

        match frame.kind {
            StreamKind::Preview => forward_preview(&ctx, frame),
            StreamKind::Video => forward_video(&ctx, frame),
            StreamKind::Zsl => ctx.hold_zsl(frame),
        }
    }
}

fn forward_preview(ctx: &PipelineContext, mut frame: Frame) {
    let queue = if ctx.hfr_active() {
        &ctx.queues.hfr
    } else {
        &ctx.queues.preview
    };

    frame.buffer.hand_off(Owner::Queue);
    match queue.add(frame) {
        Ok(()) => Counters::bump(&ctx.counters.preview_forwarded),
        Err(frame) => {
            trace!("No preview consumer for frame {}", frame.sequence);
            Counters::bump(&ctx.counters.preview_dropped);
            ctx.return_to_device(frame);
        }
    }
}

fn forward_video(ctx: &PipelineContext, mut frame: Frame) {
    frame.buffer.hand_off(Owner::Queue);
    match ctx.queues.record.add(frame) {
        Ok(()) => Counters::bump(&ctx.counters.record_forwarded),
        Err(frame) => {
            if ctx.is_recording() {
                warn!("Dropping record frame {}", frame.sequence);
                Counters::bump(&ctx.counters.record_dropped);
            }
            ctx.return_to_device(frame);
        }
    }
}

fn deliver_preview(ctx: &PipelineContext, frame: &Frame) {
    if ctx.preview_paused() {
        trace!("Preview paused, not delivering frame {}", frame.sequence);
        ctx.keep_last_preview(&frame.buffer);
        return;
    }

    ctx.render(&frame.buffer);
    if let Some(data) = frame.buffer.map() {
        let len = frame.buffer.bytes_used().min(data.len());
        if ctx.messages.data(MsgType::PREVIEW_FRAME, &data[..len]) {
            Counters::bump(&ctx.counters.preview_delivered);
        }
    }
}

pub(crate) fn preview_loop(ctx: Arc<PipelineContext>, control: StageControl) {
    let mut fps = FpsCounter::new(PREVIEW, ctx.fps_logging);

    while let Some(mut frame) = ctx.queues.preview.get() {
        frame.buffer.hand_off(Owner::Consumer(PREVIEW));
        if !control.is_armed() {
            ctx.return_to_device(frame);
            break;
        }

        deliver_preview(&ctx, &frame);
        fps.tick();
        ctx.return_to_device(frame);
    }
}

/// Preview consumer of the high frame rate mode. Only one frame out of
/// `decimation` reaches the consumer, all of them go back to the device.
pub(crate) fn hfr_loop(ctx: Arc<PipelineContext>, control: StageControl, decimation: u32) {
    let decimation = u64::from(decimation.max(1));
    let mut fps = FpsCounter::new(HFR, ctx.fps_logging);
    let mut received = 0u64;

    while let Some(mut frame) = ctx.queues.hfr.get() {
        frame.buffer.hand_off(Owner::Consumer(HFR));
        if !control.is_armed() {
            ctx.return_to_device(frame);
            break;
        }

        if received % decimation == 0 {
            deliver_preview(&ctx, &frame);
        }
        received += 1;
        fps.tick();
        ctx.return_to_device(frame);
    }
}

/// Lend video frames to the consumer. They come back to the device when the
/// consumer drops its `RecordingFrame`.
pub(crate) fn record_loop(ctx: Arc<PipelineContext>, control: StageControl) {
    let mut fps = FpsCounter::new(RECORD, ctx.fps_logging);
    let home: Weak<dyn FrameReturn> = {
        let weak: Weak<PipelineContext> = Arc::downgrade(&ctx);
        weak
    };

    while let Some(mut frame) = ctx.queues.record.get() {
        frame.buffer.hand_off(Owner::Consumer(RECORD));
        if !control.is_armed() {
            ctx.return_to_device(frame);
            break;
        }
        fps.tick();

        if !ctx.messages.enabled(MsgType::VIDEO_FRAME) {
            ctx.return_to_device(frame);
            continue;
        }

        frame.buffer.hand_off(Owner::Client);
        let recording = RecordingFrame::new(frame, home.clone());
        if ctx.messages.data_timestamp(MsgType::VIDEO_FRAME, recording) {
            Counters::bump(&ctx.counters.record_delivered);
        }
    }
}
