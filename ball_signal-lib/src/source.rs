use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::{Result, SignalError};
use crate::frame::{self, BACKGROUND, Frame};
use crate::producer::FrameProducer;

/// A frame stamped for the outbound track.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub frame: Frame,
    /// Presentation timestamp in units of `time_base`.
    pub pts: u64,
    /// `(numerator, denominator)` seconds per pts tick.
    pub time_base: (u32, u32),
}

/// Pull adapter the media pipeline calls whenever it wants the next frame.
///
/// Timestamps come from wall-clock time since construction rather than a
/// frame counter, so they stay aligned with real time when the pipeline
/// pulls faster or slower than the producer ticks. The rate follows the
/// producer, including changes made with `FrameProducer::set_fps`.
pub struct FrameSource {
    label: String,
    producer: Option<Arc<FrameProducer>>,
    width: u32,
    height: u32,
    radius: f64,
    fps: u32,
    started: Instant,
}

impl FrameSource {
    pub fn new(label: impl Into<String>, producer: Arc<FrameProducer>) -> Self {
        let config = producer.config().clone();
        Self {
            label: label.into(),
            producer: Some(producer),
            width: config.width,
            height: config.height,
            radius: config.radius,
            fps: config.fps,
            started: Instant::now(),
        }
    }

    /// A source with no producer behind it; every pull yields the fallback
    /// frame.
    pub fn detached(label: impl Into<String>, width: u32, height: u32, radius: f64, fps: u32) -> Self {
        Self {
            label: label.into(),
            producer: None,
            width,
            height,
            radius,
            fps: fps.max(1),
            started: Instant::now(),
        }
    }

    /// Current frame rate: the producer's if there is one.
    pub fn fps(&self) -> u32 {
        match &self.producer {
            Some(producer) => producer.fps().max(1),
            None => self.fps,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps() as f64)
    }

    pub fn pts_at(&self, now: Instant) -> u64 {
        self.pts_with(now, self.fps())
    }

    fn pts_with(&self, now: Instant, fps: u32) -> u64 {
        let elapsed = now.saturating_duration_since(self.started);
        (elapsed.as_nanos() * fps as u128 / 1_000_000_000) as u64
    }

    /// Next frame for the track. Never fails: internal errors degrade to a
    /// plain background frame so the pipeline keeps flowing.
    pub fn recv(&self) -> VideoFrame {
        let frame = match &self.producer {
            Some(producer) if producer.is_running() => producer.get_frame(),
            _ => frame::fallback_frame(self.width, self.height, self.radius),
        };
        self.stamp(frame)
    }

    fn stamp(&self, frame: Frame) -> VideoFrame {
        let fps = self.fps();
        let pts = self.pts_with(Instant::now(), fps);
        let frame = match self.check(frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] frame source error, sending blank frame: {}", self.label, e);
                Frame::solid(self.width.max(1), self.height.max(1), BACKGROUND)
            }
        };
        trace!("[{}] frame pts={} {}x{}", self.label, pts, frame.width, frame.height);
        VideoFrame { frame, pts, time_base: (1, fps) }
    }

    fn check(&self, frame: Frame) -> Result<Frame> {
        frame.validate()?;
        if frame.width != self.width || frame.height != self.height {
            return Err(SignalError::Frame(format!(
                "producer emitted {}x{}, track expects {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }
        Ok(frame)
    }
}
