use crate::config::{RigConfig, StartCommand, StimulusConfig};
use crate::grating::{FrameOutcome, GratingRenderer};
use crate::link::{LinkError, SerialLink, SerialWriter};
use crate::session::{SharedSession, Token};
use crate::timer::FrameClock;
use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use pixels::{Pixels, SurfaceTexture};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    error::EventLoopError,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowId},
};

/// Serial side of an interactive session
struct SessionLink {
    writer: SerialWriter,
    listener: Option<JoinHandle<Result<(), LinkError>>>,
    start: StartCommand,
}

pub struct App {
    window: Option<Arc<Window>>,
    pixels: Option<Pixels<'static>>,
    renderer: Option<GratingRenderer>,
    session: SharedSession,
    link: Option<SessionLink>,
    /// Preview closes itself after this long
    preview_duration: Option<Duration>,
    clock: FrameClock,
    stimulus: StimulusConfig,
    monitor_index: usize,
    current_size: Option<PhysicalSize<u32>>,
    refresh_rate: Option<f64>,
}

impl App {
    fn with_session(config: &RigConfig, session: SharedSession) -> Self {
        Self {
            window: None,
            pixels: None,
            renderer: None,
            session,
            link: None,
            preview_duration: None,
            clock: FrameClock::new(),
            stimulus: config.stimulus.clone().normalized(),
            monitor_index: config.display.monitor_index,
            current_size: None,
            refresh_rate: None,
        }
    }

    /// Opens the serial link and starts listening. A link that cannot be opened is fatal.
    pub fn interactive(config: &RigConfig) -> Result<Self> {
        let (writer, listener) = SerialLink::open(&config.link)?;
        let session = SharedSession::new();
        let handle = listener
            .spawn(session.clone())
            .context("Failed to spawn link listener")?;

        let mut app = Self::with_session(config, session);
        app.link = Some(SessionLink {
            writer,
            listener: Some(handle),
            start: config.start.clone(),
        });
        info!("✓ Press SPACE to start a trial, ESC to exit");
        info!("✓ Command: {}", config.start);
        Ok(app)
    }

    /// Drifting grating with no controller attached, closed after `duration`
    pub fn preview(config: &RigConfig, duration: Duration) -> Self {
        let session = SharedSession::new();
        session.on_event(Token::GratingOn);

        let mut app = Self::with_session(config, session);
        app.preview_duration = Some(duration);
        info!("Previewing grating for {:.1} s", duration.as_secs_f64());
        app
    }

    pub fn run(self) -> Result<()> {
        self.run_on(EventLoop::new())
    }

    fn run_on(mut self, event_loop: Result<EventLoop<()>, EventLoopError>) -> Result<()> {
        let event_loop = match event_loop {
            Ok(event_loop) => event_loop,
            Err(e) => {
                self.shutdown();
                return Err(e).context("Failed to create event loop");
            }
        };
        info!("Platform: {}", std::env::consts::OS);
        info!("Architecture: {}", std::env::consts::ARCH);

        let result = event_loop.run_app(&mut self);
        self.shutdown();
        result.map_err(Into::into)
    }

    fn create_window_and_surface(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        info!("Detected monitors:");
        for (i, monitor) in event_loop.available_monitors().enumerate() {
            let size = monitor.size();
            info!(
                "  [{i}] {}  {}×{}",
                monitor.name().unwrap_or_default(),
                size.width,
                size.height
            );
        }

        let monitor = event_loop
            .available_monitors()
            .nth(self.monitor_index)
            .or_else(|| event_loop.primary_monitor())
            .or_else(|| event_loop.available_monitors().next())
            .ok_or_else(|| anyhow!("No monitor available"))?;

        self.refresh_rate = monitor
            .refresh_rate_millihertz()
            .map(|rate| rate as f64 / 1000.0);

        let window_attributes = Window::default_attributes()
            .with_title("Serial-Controlled Grating [SPACE = Start Trial]")
            .with_fullscreen(Some(Fullscreen::Borderless(Some(monitor))))
            .with_resizable(false);

        let window = Arc::new(event_loop.create_window(window_attributes)?);
        let physical_size = window.inner_size();
        self.current_size = Some(physical_size);

        info!("Display Configuration:");
        info!(
            "  Physical size: {}×{}",
            physical_size.width, physical_size.height
        );
        info!("  Scale factor: {:.2}", window.scale_factor());
        if let Some(refresh_rate) = self.refresh_rate {
            info!("  Refresh rate: {:.1} Hz", refresh_rate);
        }

        let surface_texture =
            SurfaceTexture::new(physical_size.width, physical_size.height, window.clone());
        self.pixels = Some(Pixels::new(
            physical_size.width,
            physical_size.height,
            surface_texture,
        )?);
        self.renderer = Some(GratingRenderer::new(
            physical_size.width,
            physical_size.height,
            &self.stimulus,
        )?);

        // elapsed time and preview duration count from the first frame
        self.clock = FrameClock::new();

        window.set_cursor_visible(false);
        window.request_redraw();
        self.window = Some(window);

        Ok(())
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(duration) = self.preview_duration {
            if self.clock.elapsed() >= duration && !self.session.should_terminate() {
                info!("Preview finished");
                self.session.on_local_cancel();
            }
        }

        let elapsed = self.clock.tick();
        let (Some(renderer), Some(pixels)) = (&mut self.renderer, &mut self.pixels) else {
            return;
        };

        match renderer.tick(&self.session, elapsed) {
            FrameOutcome::Stop => {
                event_loop.exit();
                return;
            }
            FrameOutcome::Drawn(_) => {
                renderer.present(pixels.frame_mut());
                if let Err(e) = pixels.render() {
                    error!("Render error: {e}");
                }
            }
        }

        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn handle_input(&mut self, key: PhysicalKey) {
        let PhysicalKey::Code(keycode) = key else {
            return;
        };
        match keycode {
            KeyCode::Space => self.request_trial_start(),
            KeyCode::Escape => {
                info!("Cancelled by operator");
                self.session.on_local_cancel();
            }
            _ => {}
        }
    }

    fn request_trial_start(&mut self) {
        let Some(link) = &mut self.link else {
            debug!("No controller attached, SPACE ignored");
            return;
        };
        let start = &link.start;
        let writer = &mut link.writer;
        match self
            .session
            .on_trial_start_requested(|| writer.send_start(start))
        {
            Ok(true) => info!("Trial started"),
            Ok(false) => {}
            Err(e) => warn!("⚠️ {e}, press SPACE to retry"),
        }
    }

    fn handle_resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width == 0 || new_size.height == 0 {
            return;
        }
        self.current_size = Some(new_size);
        if let Some(pixels) = &mut self.pixels {
            if let Err(e) = pixels.resize_surface(new_size.width, new_size.height) {
                error!("Failed to resize surface: {e}");
            }
            if let Err(e) = pixels.resize_buffer(new_size.width, new_size.height) {
                error!("Failed to resize buffer: {e}");
            }
        }
        if let Some(renderer) = &mut self.renderer {
            if let Err(e) = renderer.resize(new_size.width, new_size.height) {
                error!("Failed to resize canvas: {e}");
            }
        }
        info!("Display resized to: {}×{}", new_size.width, new_size.height);
    }

    /// Tears the session down once the event loop has returned
    fn shutdown(&mut self) {
        self.session.on_local_cancel();

        if let Some(mut link) = self.link.take() {
            link.writer.close();
            if let Some(handle) = link.listener.take() {
                match handle.join() {
                    Ok(Ok(())) => debug!("Link listener joined"),
                    Ok(Err(e)) => error!("Session ended by link failure: {e}"),
                    Err(_) => error!("Link listener panicked"),
                }
            }
        }

        let stats = self.clock.stats();
        if stats.frames > 0 {
            info!(
                "Frame timing: {} frames, {:.3} ms/frame, {:.1} Hz, jitter {:.3} ms, range {:.3}–{:.3} ms",
                stats.frames,
                stats.average_frame_time_ns / 1e6,
                stats.effective_fps,
                stats.jitter_ns / 1e6,
                stats.min_frame_time_ns / 1e6,
                stats.max_frame_time_ns / 1e6,
            );
        }
        info!("Session closed");
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.create_window_and_surface(event_loop) {
                error!("Failed to create window and surface: {e}");
                self.session.on_local_cancel();
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                self.session.on_local_cancel();
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            WindowEvent::KeyboardInput { event, .. } if event.state.is_pressed() && !event.repeat => {
                self.handle_input(event.physical_key);
            }
            WindowEvent::Resized(size) => self.handle_resize(size),
            WindowEvent::ScaleFactorChanged { .. } => {
                if let Some(window) = &self.window {
                    let size = window.inner_size();
                    self.handle_resize(size);
                }
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.set_cursor_visible(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_event_loop_still_cancels_the_session() {
        let app = App::preview(&RigConfig::default(), Duration::from_secs(1));
        let session = app.session.clone();

        assert!(app.run_on(Err(EventLoopError::RecreationAttempt)).is_err());
        assert!(session.should_terminate());
    }
}
