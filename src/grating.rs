use crate::config::StimulusConfig;
use crate::session::{DisplayState, SessionState, SharedSession};
use anyhow::{anyhow, Result};
use tiny_skia::{Color, ColorU8, Pixmap, PremultipliedColorU8};

pub const GRAY_LEVEL: f32 = 0.5;

/// Floored fractional part, always in `[0, 1)` including for negative inputs
pub fn frac(x: f64) -> f64 {
    let f = x - x.floor();
    // tiny negative inputs round up to exactly 1.0
    if f >= 1.0 {
        0.0
    } else {
        f
    }
}

/// Square-wave grating evaluated on surface coordinates normalized to `[-1, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GratingPattern {
    stripe_count: u32,
    contrast: f64,
    cos: f64,
    sin: f64,
}

impl GratingPattern {
    pub fn new(config: &StimulusConfig) -> Self {
        let config = config.clone().normalized();
        let orientation = config.orientation_rad();
        Self {
            stripe_count: config.stripe_count,
            contrast: config.contrast,
            cos: orientation.cos(),
            sin: orientation.sin(),
        }
    }

    pub fn stripe_index(&self, x: f64, y: f64, phase: f64) -> u32 {
        let rotated = x * self.cos + y * self.sin;
        let u = (rotated + 1.0) / 2.0;
        let stripe = (frac(u + phase) * self.stripe_count as f64).floor() as u32;
        stripe.min(self.stripe_count - 1)
    }

    /// Even stripes take the bright level
    pub fn is_bright(&self, x: f64, y: f64, phase: f64) -> bool {
        self.stripe_index(x, y, phase) % 2 == 0
    }

    pub fn bright(&self) -> f32 {
        (0.5 + self.contrast / 2.0) as f32
    }

    pub fn dark(&self) -> f32 {
        (0.5 - self.contrast / 2.0) as f32
    }

    /// Luminance in `[0, 1]` for one surface coordinate
    pub fn luminance(&self, display: DisplayState, x: f64, y: f64, phase: f64) -> f32 {
        match display {
            DisplayState::Gray => GRAY_LEVEL,
            DisplayState::Black => 0.0,
            DisplayState::Grating if self.is_bright(x, y, phase) => self.bright(),
            DisplayState::Grating => self.dark(),
        }
    }
}

fn level_u8(luminance: f32) -> u8 {
    (luminance.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn gray_pixel(luminance: f32) -> PremultipliedColorU8 {
    let v = level_u8(luminance);
    ColorU8::from_rgba(v, v, v, 255).premultiply()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// Frame rasterised from this state
    Drawn(SessionState),
    /// Session is terminating, the host should close
    Stop,
}

/// Rasterises the session state into a full-frame canvas once per display tick
pub struct GratingRenderer {
    pattern: GratingPattern,
    drift_speed: f64,
    canvas: Pixmap,
}

impl GratingRenderer {
    pub fn new(width: u32, height: u32, config: &StimulusConfig) -> Result<Self> {
        Ok(Self {
            pattern: GratingPattern::new(config),
            drift_speed: config.drift_speed,
            canvas: Self::canvas_of(width, height)?,
        })
    }

    fn canvas_of(width: u32, height: u32) -> Result<Pixmap> {
        Pixmap::new(width, height)
            .ok_or_else(|| anyhow!("Failed to create {width}×{height} canvas"))
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.canvas = Self::canvas_of(width, height)?;
        Ok(())
    }

    pub fn canvas(&self) -> &Pixmap {
        &self.canvas
    }

    /// One display tick: stop if terminating, otherwise advance the drift and draw.
    ///
    /// The session lock is only taken to advance and to snapshot, never while drawing.
    pub fn tick(&mut self, session: &SharedSession, elapsed_seconds: f64) -> FrameOutcome {
        if session.should_terminate() {
            return FrameOutcome::Stop;
        }
        session.advance_phase(elapsed_seconds, self.drift_speed);
        let state = session.snapshot();
        self.draw(&state);
        FrameOutcome::Drawn(state)
    }

    pub fn draw(&mut self, state: &SessionState) {
        match state.display {
            DisplayState::Gray => self.fill(GRAY_LEVEL),
            DisplayState::Black => self.fill(0.0),
            DisplayState::Grating => self.draw_grating(state.phase),
        }
    }

    fn fill(&mut self, luminance: f32) {
        let v = level_u8(luminance);
        self.canvas.fill(Color::from_rgba8(v, v, v, 255));
    }

    fn draw_grating(&mut self, phase: f64) {
        let width = self.canvas.width() as usize;
        let height = self.canvas.height() as f64;
        let bright = gray_pixel(self.pattern.bright());
        let dark = gray_pixel(self.pattern.dark());
        let pattern = self.pattern;

        // pixel centres mapped to [-1, 1], y pointing up
        let sx = 2.0 / width as f64;
        let sy = 2.0 / height;
        for (row, pixels) in self.canvas.pixels_mut().chunks_exact_mut(width).enumerate() {
            let y = 1.0 - (row as f64 + 0.5) * sy;
            for (col, px) in pixels.iter_mut().enumerate() {
                let x = (col as f64 + 0.5) * sx - 1.0;
                *px = if pattern.is_bright(x, y, phase) {
                    bright
                } else {
                    dark
                };
            }
        }
    }

    /// Copies the canvas into an RGBA8 frame buffer of the same size
    pub fn present(&self, frame: &mut [u8]) {
        let data = self.canvas.data();
        let len = data.len().min(frame.len());
        frame[..len].copy_from_slice(&data[..len]);
    }
}
