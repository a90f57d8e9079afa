//! Camera capture loop feeding the raw frame slot.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Result, anyhow};
use image::RgbImage;
use tracing::{debug, info, warn};
use video_ingest::{Camera, CameraSource, RawFrame};

use crate::{
    config::PollIntervals,
    frames::{Frame, FrameSlot},
    worker::{Worker, pause},
};

/// Owns the capture thread and the raw frame slot it publishes into.
pub struct FrameSource {
    slot: FrameSlot<Frame>,
    ready: Arc<AtomicBool>,
    worker: Worker,
}

impl FrameSource {
    /// Spawn the capture loop. A camera that cannot be opened is not an error:
    /// the loop keeps retrying and `is_ready` stays `false` until it succeeds.
    pub fn start(
        source: Arc<dyn CameraSource>,
        jpeg_quality: u8,
        intervals: PollIntervals,
    ) -> io::Result<Self> {
        let slot = FrameSlot::new();
        let ready = Arc::new(AtomicBool::new(false));
        let loop_slot = slot.clone();
        let loop_ready = ready.clone();
        let worker = Worker::spawn("capture", move |running| {
            capture_loop(running, source, loop_slot, loop_ready, jpeg_quality, intervals)
        })?;
        Ok(Self {
            slot,
            ready,
            worker,
        })
    }

    /// Most recent raw frame, `None` until the first successful capture.
    pub fn latest_raw(&self) -> Option<Frame> {
        self.slot.latest()
    }

    pub fn slot(&self) -> FrameSlot<Frame> {
        self.slot.clone()
    }

    /// Whether a camera is currently open.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub(crate) fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Stop the loop and release the camera. Safe to call repeatedly.
    pub fn stop(&self) {
        self.worker.stop();
        self.ready.store(false, Ordering::Relaxed);
    }
}

fn capture_loop(
    running: Arc<AtomicBool>,
    source: Arc<dyn CameraSource>,
    slot: FrameSlot<Frame>,
    ready: Arc<AtomicBool>,
    jpeg_quality: u8,
    intervals: PollIntervals,
) {
    let span = tracing::info_span!("capture.loop", device = %source.describe());
    let _enter = span.enter();

    let mut camera: Option<Box<dyn Camera>> = None;
    let mut open_failures: u32 = 0;
    let mut grab_failures: u32 = 0;
    let mut sequence: u64 = 0;

    while running.load(Ordering::Relaxed) {
        if camera.is_none() {
            match source.open() {
                Ok(opened) => {
                    info!("camera opened");
                    camera = Some(opened);
                    open_failures = 0;
                    grab_failures = 0;
                    ready.store(true, Ordering::Relaxed);
                }
                Err(err) => {
                    if open_failures == 0 {
                        warn!("camera unavailable, retrying: {err}");
                    } else {
                        debug!("camera still unavailable: {err}");
                    }
                    open_failures = open_failures.saturating_add(1);
                    pause(&running, intervals.camera_reopen);
                    continue;
                }
            }
        }
        let Some(cam) = camera.as_mut() else {
            continue;
        };

        let grabbed = cam
            .grab()
            .map_err(anyhow::Error::from)
            .and_then(|raw| encode_raw(raw, sequence + 1, jpeg_quality));
        match grabbed {
            Ok(frame) => {
                sequence += 1;
                grab_failures = 0;
                slot.publish(frame);
                metrics::counter!("gateway_frames_captured_total").increment(1);
            }
            Err(err) => {
                metrics::counter!("gateway_capture_errors_total").increment(1);
                grab_failures += 1;
                if grab_failures == 1 {
                    warn!("frame capture failed: {err:#}");
                } else {
                    debug!("frame capture failed ({grab_failures} in a row): {err:#}");
                }
                if grab_failures >= intervals.max_grab_failures {
                    warn!("releasing camera after {grab_failures} consecutive failures");
                    camera = None;
                    ready.store(false, Ordering::Relaxed);
                    pause(&running, intervals.camera_reopen);
                } else {
                    pause(&running, intervals.capture_retry);
                }
            }
        }
    }

    drop(camera);
    ready.store(false, Ordering::Relaxed);
    info!("capture loop stopped after {sequence} frames");
}

fn encode_raw(raw: RawFrame, sequence: u64, jpeg_quality: u8) -> Result<Frame> {
    let (width, height, timestamp_ms) = (raw.width, raw.height, raw.timestamp_ms);
    let rgb = raw.into_rgb()?;
    let image = RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow!("frame buffer does not match {width}x{height}"))?;
    Frame::encode(image, sequence, timestamp_ms, jpeg_quality)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        thread,
        time::{Duration, Instant},
    };

    use video_ingest::{CaptureError, FrameFormat};

    use super::*;

    struct CountingSource {
        opens: Arc<AtomicUsize>,
        fail_opens: usize,
    }

    struct SolidCamera;

    impl Camera for SolidCamera {
        fn grab(&mut self) -> Result<RawFrame, CaptureError> {
            thread::sleep(Duration::from_millis(2));
            Ok(RawFrame {
                data: vec![0, 0, 255].repeat(8 * 4),
                width: 8,
                height: 4,
                timestamp_ms: 7,
                format: FrameFormat::Bgr8,
            })
        }
    }

    impl CameraSource for CountingSource {
        fn open(&self) -> Result<Box<dyn Camera>, CaptureError> {
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_opens {
                return Err(CaptureError::Open {
                    device: "test".into(),
                });
            }
            Ok(Box::new(SolidCamera))
        }

        fn describe(&self) -> String {
            "test".into()
        }
    }

    fn fast_intervals() -> PollIntervals {
        PollIntervals {
            camera_reopen: Duration::from_millis(20),
            ..PollIntervals::default()
        }
    }

    fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(value) = probe() {
                return Some(value);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn publishes_frames_once_the_camera_opens() {
        let opens = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(CountingSource {
            opens: opens.clone(),
            fail_opens: 2,
        });
        let capture = FrameSource::start(source, 80, fast_intervals()).unwrap();

        let frame = wait_for(|| capture.latest_raw()).expect("no frame captured");
        assert!(capture.is_ready());
        assert!(opens.load(Ordering::SeqCst) >= 3);
        assert_eq!((frame.width(), frame.height()), (8, 4));
        assert_eq!(frame.timestamp_ms, 7);
        assert_eq!(frame.image.get_pixel(0, 0).0, [255, 0, 0]);

        capture.stop();
        capture.stop();
        assert!(!capture.is_ready());
    }

    /// Opens succeed `good_opens` times; every handle fails to grab.
    struct BrokenSource {
        opens: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        good_opens: usize,
    }

    struct BrokenCamera(Arc<AtomicUsize>);

    impl Camera for BrokenCamera {
        fn grab(&mut self) -> Result<RawFrame, CaptureError> {
            Err(CaptureError::EmptyFrame {
                device: "broken".into(),
            })
        }
    }

    impl Drop for BrokenCamera {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CameraSource for BrokenSource {
        fn open(&self) -> Result<Box<dyn Camera>, CaptureError> {
            if self.opens.fetch_add(1, Ordering::SeqCst) >= self.good_opens {
                return Err(CaptureError::Open {
                    device: "broken".into(),
                });
            }
            Ok(Box::new(BrokenCamera(self.releases.clone())))
        }

        fn describe(&self) -> String {
            "broken".into()
        }
    }

    #[test]
    fn repeated_grab_failures_release_and_reopen_the_camera() {
        let opens = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(BrokenSource {
            opens: opens.clone(),
            releases: releases.clone(),
            good_opens: 2,
        });
        let intervals = PollIntervals {
            capture_retry: Duration::from_millis(1),
            camera_reopen: Duration::from_millis(10),
            max_grab_failures: 3,
            ..PollIntervals::default()
        };
        let capture = FrameSource::start(source, 80, intervals).unwrap();

        assert!(wait_for(|| (opens.load(Ordering::SeqCst) >= 3).then_some(())).is_some());
        assert_eq!(releases.load(Ordering::SeqCst), 2);
        assert!(!capture.is_ready());
        assert!(capture.latest_raw().is_none());

        capture.stop();
        assert_eq!(releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_camera_never_publishes() {
        let source = Arc::new(CountingSource {
            opens: Arc::new(AtomicUsize::new(0)),
            fail_opens: usize::MAX,
        });
        let capture = FrameSource::start(source, 80, fast_intervals()).unwrap();
        thread::sleep(Duration::from_millis(80));
        assert!(capture.latest_raw().is_none());
        assert!(!capture.is_ready());
        capture.stop();
    }
}
