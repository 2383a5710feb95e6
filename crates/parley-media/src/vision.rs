//! Vision mode: periodic camera frame sampling.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::config::VisionConfig;

/// A raw RGB8 still.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A compressed still, ready to be submitted as input.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub media_type: String,
    pub width: u32,
    pub height: u32,
    /// 1-based tick number within the sampler's lifetime.
    pub sequence: u64,
}

/// Encode an RGB frame as JPEG. `quality` is clamped to 1..=100.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> anyhow::Result<Bytes> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "frame buffer of {} bytes does not match {}x{}",
                frame.rgb.len(),
                frame.width,
                frame.height
            )
        })?;
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    DynamicImage::ImageRgb8(image).write_with_encoder(encoder)?;
    Ok(Bytes::from(buf))
}

/// A live camera stream.
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    /// Capture the current frame.
    async fn grab(&self) -> anyhow::Result<Frame>;

    /// Stop the stream's tracks. Called exactly once, on sampler stop.
    fn release(&self);
}

/// Consumer of sampled frames (the turn orchestrator).
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn submit_frame(&self, frame: EncodedFrame) -> anyhow::Result<()>;
}

/// Reads a still image from disk on every grab, e.g. a file a webcam tool
/// keeps overwriting.
pub struct SnapshotFileSource {
    path: PathBuf,
}

impl SnapshotFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FrameSource for SnapshotFileSource {
    async fn grab(&self) -> anyhow::Result<Frame> {
        let data = tokio::fs::read(&self.path).await?;
        let rgb = image::load_from_memory(&data)?.to_rgb8();
        Ok(Frame {
            width: rgb.width(),
            height: rgb.height(),
            rgb: rgb.into_raw(),
        })
    }

    fn release(&self) {
        debug!(path = %self.path.display(), "Snapshot source released");
    }
}

struct Running {
    cancel: CancellationToken,
    source: Arc<dyn FrameSource>,
}

/// Samples a [`FrameSource`] on a fixed period and hands JPEG frames to a
/// [`FrameSink`]. At most one sampling loop runs per sampler.
pub struct VisionSampler {
    sink: Arc<dyn FrameSink>,
    period: Duration,
    quality: u8,
    running: Mutex<Option<Running>>,
    sequence: Arc<AtomicU64>,
}

impl VisionSampler {
    pub fn new(sink: Arc<dyn FrameSink>, period: Duration, quality: u8) -> Self {
        Self {
            sink,
            period,
            quality,
            running: Mutex::new(None),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(sink: Arc<dyn FrameSink>, config: &VisionConfig) -> Self {
        Self::new(
            sink,
            Duration::from_millis(config.interval_ms),
            config.jpeg_quality,
        )
    }

    /// Begin sampling `source`. A running loop is stopped first.
    pub fn start(&self, source: Arc<dyn FrameSource>) {
        self.stop();

        let cancel = CancellationToken::new();
        {
            let mut running = self.lock();
            *running = Some(Running {
                cancel: cancel.clone(),
                source: source.clone(),
            });
        }
        info!(period_ms = self.period.as_millis() as u64, "Vision sampling started");

        let sink = self.sink.clone();
        let period = self.period;
        let quality = self.quality;
        let sequence = self.sequence.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sample_once(source.as_ref(), sink.as_ref(), quality, &sequence) => {}
                }
            }
            debug!("Vision sampling loop exited");
        });
    }

    /// Cancel the tick timer and release the source. Safe to call when stopped.
    pub fn stop(&self) {
        let previous = self.lock().take();
        if let Some(running) = previous {
            running.cancel.cancel();
            running.source.release();
            info!("Vision sampling stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for VisionSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sample_once(
    source: &dyn FrameSource,
    sink: &dyn FrameSink,
    quality: u8,
    sequence: &AtomicU64,
) {
    let frame = match source.grab().await {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Error capturing frame");
            return;
        }
    };
    if frame.is_empty() {
        debug!("Camera not ready, skipping frame");
        return;
    }
    let data = match encode_jpeg(&frame, quality) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Error encoding frame");
            return;
        }
    };
    let sequence = sequence.fetch_add(1, Ordering::SeqCst) + 1;
    let encoded = EncodedFrame {
        data,
        media_type: "image/jpeg".into(),
        width: frame.width,
        height: frame.height,
        sequence,
    };
    if let Err(e) = sink.submit_frame(encoded).await {
        warn!(sequence, error = %e, "Error submitting frame");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct TestSource {
        grabs: AtomicUsize,
        releases: AtomicUsize,
        /// Grabs that return a zero-sized frame.
        empty_on: Vec<usize>,
    }

    impl TestSource {
        fn new(empty_on: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                grabs: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
                empty_on,
            })
        }
    }

    #[async_trait]
    impl FrameSource for TestSource {
        async fn grab(&self) -> anyhow::Result<Frame> {
            let n = self.grabs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.empty_on.contains(&n) {
                return Ok(Frame {
                    width: 0,
                    height: 0,
                    rgb: Vec::new(),
                });
            }
            Ok(Frame {
                width: 4,
                height: 2,
                rgb: vec![128; 4 * 2 * 3],
            })
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct TestSink {
        frames: Mutex<Vec<u64>>,
        fail_first: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FrameSink for TestSink {
        async fn submit_frame(&self, frame: EncodedFrame) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                anyhow::bail!("responder unavailable");
            }
            assert_eq!(frame.media_type, "image/jpeg");
            self.frames.lock().unwrap().push(frame.sequence);
            Ok(())
        }
    }

    fn sampler(sink: Arc<TestSink>) -> VisionSampler {
        VisionSampler::new(sink, Duration::from_millis(3000), 80)
    }

    #[test]
    fn test_encode_jpeg() {
        let frame = Frame {
            width: 8,
            height: 8,
            rgb: vec![200; 8 * 8 * 3],
        };
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let bad = Frame {
            width: 8,
            height: 8,
            rgb: vec![0; 10],
        };
        assert!(encode_jpeg(&bad, 80).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_period() {
        let sink = Arc::new(TestSink::default());
        let sampler = sampler(sink.clone());
        let source = TestSource::new(vec![]);

        sampler.start(source.clone());
        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(source.grabs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*sink.frames.lock().unwrap(), vec![1]);

        tokio::time::sleep(Duration::from_millis(6000)).await;
        assert_eq!(*sink.frames.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_submission_does_not_stop_ticks() {
        let sink = Arc::new(TestSink {
            fail_first: true,
            ..TestSink::default()
        });
        let sampler = sampler(sink.clone());
        sampler.start(TestSource::new(vec![]));

        tokio::time::sleep(Duration::from_millis(6100)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*sink.frames.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_dimension_frames_are_skipped() {
        let sink = Arc::new(TestSink::default());
        let sampler = sampler(sink.clone());
        sampler.start(TestSource::new(vec![1]));

        tokio::time::sleep(Duration::from_millis(6100)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*sink.frames.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_duplicate_timers() {
        let sink = Arc::new(TestSink::default());
        let sampler = sampler(sink.clone());
        let first = TestSource::new(vec![]);
        let second = TestSource::new(vec![]);

        sampler.start(first.clone());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        sampler.start(second.clone());
        assert_eq!(first.releases.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(9100)).await;
        assert_eq!(first.grabs.load(Ordering::SeqCst), 0);
        assert_eq!(second.grabs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_and_releases() {
        let sink = Arc::new(TestSink::default());
        let sampler = sampler(sink.clone());
        let source = TestSource::new(vec![]);

        sampler.start(source.clone());
        tokio::time::sleep(Duration::from_millis(3100)).await;
        sampler.stop();
        assert!(!sampler.is_running());
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.grabs.load(Ordering::SeqCst), 1);

        sampler.stop();
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_snapshot_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.png");
        RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();

        let frame = SnapshotFileSource::new(&path).grab().await.unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert_eq!(&frame.rgb[..3], &[10, 20, 30]);

        assert!(SnapshotFileSource::new(dir.path().join("missing.png")).grab().await.is_err());
    }
}
