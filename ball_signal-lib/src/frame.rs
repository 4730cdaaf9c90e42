use chrono::{DateTime, Utc};

use crate::error::{Result, SignalError};

pub type Rgb = [u8; 3];

pub const BACKGROUND: Rgb = [50, 50, 50];
pub const BALL_COLOR: Rgb = [0, 255, 0];

/// A packed RGB24 image, row-major, `height × width × 3`.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub generated_at: DateTime<Utc>,
}

impl Frame {
    pub fn solid(width: u32, height: u32, color: Rgb) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&color);
        }
        Self { width, height, data, generated_at: Utc::now() }
    }

    /// `(rows, columns, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height as usize, self.width as usize, 3)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Check the buffer actually holds `width × height × 3` bytes.
    pub fn validate(&self) -> Result<()> {
        let (h, w, c) = self.shape();
        let expected = h * w * c;
        if self.width == 0 || self.height == 0 || self.data.len() != expected {
            return Err(SignalError::Frame(format!(
                "{}x{} frame carries {} bytes, expected {}",
                self.width,
                self.height,
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }

    /// Paint a filled disc; pixels outside the image are clipped.
    pub fn fill_circle(&mut self, cx: f64, cy: f64, radius: f64, color: Rgb) {
        if self.width == 0 || self.height == 0 {
            return;
        }
        let x0 = (cx - radius).floor().max(0.0) as u32;
        let y0 = (cy - radius).floor().max(0.0) as u32;
        let x1 = ((cx + radius).ceil().max(0.0) as u32).min(self.width - 1);
        let y1 = ((cy + radius).ceil().max(0.0) as u32).min(self.height - 1);
        let r2 = radius * radius;

        for y in y0..=y1 {
            let dy = y as f64 - cy;
            for x in x0..=x1 {
                let dx = x as f64 - cx;
                if dx * dx + dy * dy <= r2 {
                    let idx = (y as usize * self.width as usize + x as usize) * 3;
                    self.data[idx..idx + 3].copy_from_slice(&color);
                }
            }
        }
    }
}

/// Background canvas with the ball drawn at `(x, y)`.
pub fn render_ball(width: u32, height: u32, x: f64, y: f64, radius: f64, background: Rgb, ball: Rgb) -> Frame {
    let mut frame = Frame::solid(width, height, background);
    frame.fill_circle(x, y, radius, ball);
    frame
}

/// Static frame with the ball centered, used whenever no generated frame
/// is available.
pub fn fallback_frame(width: u32, height: u32, radius: f64) -> Frame {
    render_ball(
        width,
        height,
        (width / 2) as f64,
        (height / 2) as f64,
        radius,
        BACKGROUND,
        BALL_COLOR,
    )
}
