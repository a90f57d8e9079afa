//! Detection loop that turns raw frames into annotated frames.

use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use anyhow::{Result, anyhow};
use ml_core::DetectionEngine;
use tracing::{debug, info, warn};

use crate::{
    annotation::draw_detections,
    config::PollIntervals,
    detection::DetectionBox,
    frames::{AnnotatedFrame, Frame, FrameSlot},
    worker::{Worker, pause},
};

pub struct Annotator {
    slot: FrameSlot<AnnotatedFrame>,
    worker: Worker,
}

impl Annotator {
    /// Spawn the annotation loop reading from `raw`.
    pub fn start(
        engine: Arc<dyn DetectionEngine>,
        raw: FrameSlot<Frame>,
        jpeg_quality: u8,
        intervals: PollIntervals,
    ) -> io::Result<Self> {
        let slot = FrameSlot::new();
        let loop_slot = slot.clone();
        let worker = Worker::spawn("annotate", move |running| {
            annotation_loop(running, engine, raw, loop_slot, jpeg_quality, intervals)
        })?;
        Ok(Self { slot, worker })
    }

    pub fn latest_annotated(&self) -> Option<AnnotatedFrame> {
        self.slot.latest()
    }

    pub fn slot(&self) -> FrameSlot<AnnotatedFrame> {
        self.slot.clone()
    }

    pub fn stop(&self) {
        self.worker.stop();
    }
}

fn annotation_loop(
    running: Arc<AtomicBool>,
    engine: Arc<dyn DetectionEngine>,
    raw: FrameSlot<Frame>,
    annotated: FrameSlot<AnnotatedFrame>,
    jpeg_quality: u8,
    intervals: PollIntervals,
) {
    let span = tracing::info_span!("annotate.loop", engine = engine.name());
    let _enter = span.enter();

    let mut last_sequence = None;
    let mut published: u64 = 0;
    while running.load(Ordering::Relaxed) {
        let frame = match raw.latest() {
            Some(frame) if Some(frame.sequence) != last_sequence => frame,
            _ => {
                pause(&running, intervals.annotate_idle);
                continue;
            }
        };
        last_sequence = Some(frame.sequence);

        match annotate(engine.as_ref(), &frame, jpeg_quality) {
            Ok(result) => {
                debug!(
                    sequence = frame.sequence,
                    detections = result.detections.len(),
                    "frame annotated"
                );
                annotated.publish(result);
                published += 1;
                metrics::counter!("gateway_frames_annotated_total").increment(1);
            }
            Err(err) => {
                metrics::counter!("gateway_detection_errors_total").increment(1);
                warn!(sequence = frame.sequence, "annotation failed: {err:#}");
            }
        }
    }
    info!("annotation loop stopped after {published} frames");
}

fn annotate(engine: &dyn DetectionEngine, frame: &Frame, jpeg_quality: u8) -> Result<AnnotatedFrame> {
    let started = Instant::now();
    let detections = panic::catch_unwind(AssertUnwindSafe(|| engine.detect(&frame.image)))
        .map_err(|payload| anyhow!("detection engine panicked: {}", panic_message(&*payload)))??;
    metrics::histogram!("gateway_detection_seconds").record(started.elapsed().as_secs_f64());

    let boxes: Vec<DetectionBox> = detections
        .into_iter()
        .map(|det| DetectionBox::from_detection(det, frame.width(), frame.height()))
        .collect();

    let mut image = frame.image.as_ref().clone();
    draw_detections(&mut image, &boxes);
    let annotated = Frame::encode(image, frame.sequence, frame.timestamp_ms, jpeg_quality)?;
    Ok(AnnotatedFrame {
        frame: annotated,
        detections: boxes.into(),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "unknown panic"
    }
}
