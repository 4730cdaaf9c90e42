//! Bouncing-ball frame generator running on its own OS thread.
//!
//! The worker renders one frame per tick into a bounded crossbeam channel.
//! When the channel reaches `drop_threshold` the oldest frame is evicted
//! before the new one goes in, so a slow consumer never stalls the worker
//! and memory stays bounded.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::{Result, SignalError};
use crate::frame::{self, BACKGROUND, BALL_COLOR, Frame, Rgb};

const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq)]
pub struct ProducerConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub radius: f64,
    pub velocity: (f64, f64),
    pub buffer_capacity: usize,
    pub drop_threshold: usize,
    pub background: Rgb,
    pub ball_color: Rgb,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            radius: 25.0,
            velocity: (2.0, 1.0),
            buffer_capacity: 30,
            drop_threshold: 24,
            background: BACKGROUND,
            ball_color: BALL_COLOR,
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(SignalError::InvalidConfig(format!(
                "resolution {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(SignalError::InvalidConfig("fps must be at least 1".into()));
        }
        if !(self.radius > 0.0) || self.radius * 2.0 > self.width.min(self.height) as f64 {
            return Err(SignalError::InvalidConfig(format!(
                "radius {} does not fit a {}x{} frame",
                self.radius, self.width, self.height
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(SignalError::InvalidConfig("buffer capacity must be non-zero".into()));
        }
        if self.drop_threshold == 0 || self.drop_threshold > self.buffer_capacity {
            return Err(SignalError::InvalidConfig(format!(
                "drop threshold {} must be within 1..={}",
                self.drop_threshold, self.buffer_capacity
            )));
        }
        Ok(())
    }
}

/// Kinematic state of the ball. Written only by the worker thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BallState {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub radius: f64,
}

impl BallState {
    /// Move one step, reflect off any edge the ball touches, then clamp so
    /// extreme velocities can never carry it off screen.
    pub fn advance(&mut self, width: f64, height: f64) {
        self.x += self.vx;
        self.y += self.vy;

        if self.x - self.radius <= 0.0 || self.x + self.radius >= width {
            self.vx = -self.vx;
        }
        if self.y - self.radius <= 0.0 || self.y + self.radius >= height {
            self.vy = -self.vy;
        }

        self.x = self.x.clamp(self.radius, width - self.radius);
        self.y = self.y.clamp(self.radius, height - self.radius);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProducerStats {
    pub fps: u32,
    pub buffer_depth: usize,
    pub position: (f64, f64),
    pub velocity: (f64, f64),
    pub radius: f64,
    pub resolution: (u32, u32),
    pub running: bool,
    pub frames_generated: u64,
}

struct Worker {
    shutdown: Sender<()>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

pub struct FrameProducer {
    label: String,
    config: ProducerConfig,
    fps: Arc<AtomicU32>,
    ball: Arc<Mutex<BallState>>,
    running: Arc<AtomicBool>,
    frame_count: Arc<AtomicU64>,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    worker: Mutex<Option<Worker>>,
}

impl FrameProducer {
    pub fn new(label: impl Into<String>, config: ProducerConfig) -> Result<Self> {
        config.validate()?;
        let label = label.into();
        let (tx, rx) = crossbeam_channel::bounded(config.buffer_capacity);
        let ball = BallState {
            x: (config.width / 2) as f64,
            y: (config.height / 2) as f64,
            vx: config.velocity.0,
            vy: config.velocity.1,
            radius: config.radius,
        };
        debug!(
            "[{}] frame producer initialized: {}x{} @ {} fps",
            label, config.width, config.height, config.fps
        );
        Ok(Self {
            label,
            fps: Arc::new(AtomicU32::new(config.fps)),
            ball: Arc::new(Mutex::new(ball)),
            running: Arc::new(AtomicBool::new(false)),
            frame_count: Arc::new(AtomicU64::new(0)),
            tx,
            rx,
            worker: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // A previous worker that missed its join deadline is detached here.
        worker.take();

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let ctx = self.tick_context();

        let handle = thread::Builder::new()
            .name(format!("{}-frames", self.label))
            .spawn(move || {
                ctx.run(shutdown_rx);
                let _ = done_tx.send(());
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                SignalError::Frame(format!("failed to spawn producer thread: {}", e))
            })?;

        *worker = Some(Worker { shutdown: shutdown_tx, done: done_rx, handle });
        info!("[{}] frame producer started at {} fps", self.label, self.fps.load(Ordering::SeqCst));
        Ok(())
    }

    /// Stop the worker and wait up to one second for it to exit.
    /// Calling this on a stopped producer does nothing.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(worker) = worker else {
            return;
        };

        let _ = worker.shutdown.try_send(());
        match worker.done.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    error!("[{}] frame producer thread panicked", self.label);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "[{}] frame producer did not stop within {:?}, detaching",
                    self.label, JOIN_TIMEOUT
                );
            }
        }
        info!("[{}] frame producer stopped", self.label);
    }

    pub fn set_fps(&self, fps: u32) -> Result<()> {
        if fps == 0 {
            return Err(SignalError::InvalidConfig("fps must be at least 1".into()));
        }
        self.fps.store(fps, Ordering::SeqCst);
        info!("[{}] frame rate changed to {} fps", self.label, fps);
        Ok(())
    }

    pub fn fps(&self) -> u32 {
        self.fps.load(Ordering::SeqCst)
    }

    /// Oldest buffered frame, or the centered fallback frame when the
    /// buffer is empty. Never blocks.
    pub fn get_frame(&self) -> Frame {
        match self.rx.try_recv() {
            Ok(frame) => frame,
            Err(_) => self.fallback_frame(),
        }
    }

    pub fn fallback_frame(&self) -> Frame {
        frame::render_ball(
            self.config.width,
            self.config.height,
            (self.config.width / 2) as f64,
            (self.config.height / 2) as f64,
            self.config.radius,
            self.config.background,
            self.config.ball_color,
        )
    }

    /// Current ground-truth ball center.
    pub fn position(&self) -> (f64, f64) {
        let ball = self.ball();
        (ball.x, ball.y)
    }

    pub fn ball(&self) -> BallState {
        *self.ball.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> ProducerStats {
        let ball = self.ball();
        ProducerStats {
            fps: self.fps(),
            buffer_depth: self.rx.len(),
            position: (ball.x, ball.y),
            velocity: (ball.vx, ball.vy),
            radius: ball.radius,
            resolution: (self.config.width, self.config.height),
            running: self.is_running(),
            frames_generated: self.frames_generated(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_ball(&self, state: BallState) {
        *self.ball.lock().unwrap() = state;
    }

    #[cfg(test)]
    pub(crate) fn tick_once(&self) {
        self.tick_context().tick();
    }

    fn tick_context(&self) -> TickContext {
        TickContext {
            label: self.label.clone(),
            width: self.config.width,
            height: self.config.height,
            background: self.config.background,
            ball_color: self.config.ball_color,
            drop_threshold: self.config.drop_threshold,
            fps: Arc::clone(&self.fps),
            ball: Arc::clone(&self.ball),
            running: Arc::clone(&self.running),
            frame_count: Arc::clone(&self.frame_count),
            tx: self.tx.clone(),
            evict: self.rx.clone(),
        }
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the worker thread touches.
struct TickContext {
    label: String,
    width: u32,
    height: u32,
    background: Rgb,
    ball_color: Rgb,
    drop_threshold: usize,
    fps: Arc<AtomicU32>,
    ball: Arc<Mutex<BallState>>,
    running: Arc<AtomicBool>,
    frame_count: Arc<AtomicU64>,
    tx: Sender<Frame>,
    evict: Receiver<Frame>,
}

impl TickContext {
    fn run(self, shutdown: Receiver<()>) {
        debug!("[{}] frame producer thread started", self.label);

        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.tick();

            let frame_time = Duration::from_secs_f64(1.0 / self.fps.load(Ordering::SeqCst).max(1) as f64);
            let wait = frame_time.saturating_sub(started.elapsed());
            match shutdown.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("[{}] frame producer thread stopped", self.label);
    }

    fn tick(&self) {
        let ball = {
            let mut ball = self.ball.lock().unwrap_or_else(|p| p.into_inner());
            ball.advance(self.width as f64, self.height as f64);
            *ball
        };

        let frame = frame::render_ball(
            self.width,
            self.height,
            ball.x,
            ball.y,
            ball.radius,
            self.background,
            self.ball_color,
        );
        self.frame_count.fetch_add(1, Ordering::SeqCst);

        if self.tx.len() >= self.drop_threshold {
            match self.evict.try_recv() {
                Ok(_) | Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return,
            }
        }
        // Only fails if a concurrent consumer raced us to a full channel;
        // dropping the newest frame then is fine.
        let _ = self.tx.try_send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(width: u32, height: u32, fps: u32) -> ProducerConfig {
        ProducerConfig { width, height, fps, radius: 5.0, ..ProducerConfig::default() }
    }

    #[test]
    fn start_then_stop_clears_running() {
        let producer = FrameProducer::new("test", small(320, 240, 5)).unwrap();
        producer.start().unwrap();
        assert!(producer.is_running());
        producer.stop();
        assert!(!producer.is_running());
        producer.stop();
        assert!(!producer.is_running());
    }

    #[test]
    fn start_is_idempotent() {
        let producer = FrameProducer::new("test", small(64, 48, 50)).unwrap();
        producer.start().unwrap();
        producer.start().unwrap();
        assert!(producer.is_running());
        producer.stop();
    }

    #[test]
    fn frame_shape_before_any_tick() {
        let producer = FrameProducer::new("test", small(100, 80, 2)).unwrap();
        let frame = producer.get_frame();
        assert_eq!(frame.shape(), (80, 100, 3));
        assert_eq!(producer.frames_generated(), 0);
    }

    #[test]
    fn fallback_frame_draws_centered_ball() {
        let producer = FrameProducer::new("test", small(100, 80, 2)).unwrap();
        let frame = producer.get_frame();
        assert_eq!(frame.pixel(50, 40), Some(BALL_COLOR));
        assert_eq!(frame.pixel(0, 0), Some(BACKGROUND));
    }

    #[test]
    fn stats_report_configuration() {
        let producer = FrameProducer::new("test", small(50, 50, 1)).unwrap();
        producer.start().unwrap();
        let stats = producer.get_stats();
        assert_eq!(stats.fps, 1);
        assert_eq!(stats.resolution, (50, 50));
        assert_eq!(stats.radius, 5.0);
        assert!(stats.running);
        producer.stop();
        assert!(!producer.get_stats().running);
    }

    #[test]
    fn bounce_off_left_edge() {
        let producer = FrameProducer::new("test", ProducerConfig::default()).unwrap();
        producer.set_ball(BallState { x: 25.0, y: 240.0, vx: -2.0, vy: 0.0, radius: 25.0 });
        producer.tick_once();
        let ball = producer.ball();
        assert!(ball.vx >= 0.0, "vx = {}", ball.vx);
        assert!(ball.x >= ball.radius, "x = {}", ball.x);
    }

    #[test]
    fn extreme_velocity_is_clamped_on_screen() {
        let mut ball = BallState { x: 320.0, y: 240.0, vx: 5000.0, vy: -5000.0, radius: 25.0 };
        ball.advance(640.0, 480.0);
        assert_eq!(ball.x, 615.0);
        assert_eq!(ball.y, 25.0);
        assert!(ball.vx < 0.0);
        assert!(ball.vy > 0.0);
    }

    #[test]
    fn buffer_evicts_oldest_at_threshold() {
        let config = ProducerConfig { buffer_capacity: 10, drop_threshold: 8, ..small(40, 40, 30) };
        let producer = FrameProducer::new("test", config).unwrap();
        for _ in 0..20 {
            producer.tick_once();
        }
        let stats = producer.get_stats();
        assert_eq!(stats.frames_generated, 20);
        assert_eq!(stats.buffer_depth, 8);
    }

    #[test]
    fn frames_are_consumed_oldest_first() {
        let producer = FrameProducer::new("test", small(40, 40, 30)).unwrap();
        producer.tick_once();
        producer.tick_once();
        let first = producer.get_frame();
        let second = producer.get_frame();
        assert!(first.generated_at <= second.generated_at);
        assert_eq!(producer.get_stats().buffer_depth, 0);
    }

    #[test]
    fn running_producer_fills_buffer() {
        let producer = FrameProducer::new("test", small(40, 40, 200)).unwrap();
        producer.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        producer.stop();
        assert!(producer.frames_generated() > 0);
    }

    #[test]
    fn set_fps_rejects_zero() {
        let producer = FrameProducer::new("test", small(40, 40, 30)).unwrap();
        assert!(producer.set_fps(0).is_err());
        producer.set_fps(60).unwrap();
        assert_eq!(producer.get_stats().fps, 60);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(FrameProducer::new("t", small(0, 10, 30)).is_err());
        assert!(FrameProducer::new("t", small(40, 40, 0)).is_err());
        assert!(FrameProducer::new("t", ProducerConfig { radius: 30.0, ..small(40, 40, 30) }).is_err());
        assert!(
            FrameProducer::new("t", ProducerConfig { drop_threshold: 31, ..ProducerConfig::default() })
                .is_err()
        );
    }
}
