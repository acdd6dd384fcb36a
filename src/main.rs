// =============================================================================
// QUAD RENDERER - A rotating textured quad on raw Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, input, FPS title)                       │
// │    └── FrameLoop (update -> acquire -> submit -> present)       │
// │          └── Renderer                                           │
// │                ├── Instance / Surface / Device                  │
// │                ├── Buffers, Texture, Descriptors (upload once)  │
// │                └── Swapchain targets (rebuilt on resize)        │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Recompute the uniform buffer from elapsed time
// 2. Acquire swapchain image
// 3. Submit the pre-recorded command buffer for that image
// 4. Present rendered image to screen
// 5. Rebuild the swapchain if it went stale along the way
//
// =============================================================================

mod backend;
mod config;
mod frame;
mod hot_reload;
mod renderer;
mod scene;

use anyhow::Result;
use config::Config;
use frame::{FrameLoop, FrameOutcome, RunFlag};
use renderer::Renderer;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

const CONFIG_PATH: &str = "config.toml";

fn main() -> ExitCode {
    // Load configuration from config.toml
    let (config, source) = Config::load(CONFIG_PATH);

    init_logging(&config);
    source.log();
    log::info!("Starting quad renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<()> {
    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging, optionally redirected into a fresh log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    let mut file_error = None;
    if config.debug.log_to_file {
        let opened = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file);

        match opened {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Quad Renderer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }

    builder.init();

    if let Some(e) = file_error {
        log::warn!("Could not open {}: {}. Logging to stderr.", config.debug.log_file, e);
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    /// Owns the run flag the shell clears on close or quit
    frame_loop: FrameLoop,

    // Dropped before the window it renders into
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    quit_key: KeyCode,
    fullscreen_key: KeyCode,

    /// First fatal error; reported once the event loop has returned
    error: Option<anyhow::Error>,

    fps: FpsCounter,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            is_fullscreen: config.window.fullscreen,
            quit_key: config.controls.quit(),
            fullscreen_key: config.controls.fullscreen(),
            config,
            frame_loop: FrameLoop::new(RunFlag::new()),
            renderer: None,
            window: None,
            error: None,
            fps: FpsCounter::new(Instant::now()),
        }
    }

    /// Record a fatal error and shut the loop down
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.frame_loop.running().stop();
        event_loop.exit();
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows rebuilds the swapchain
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some(sample) = self.fps.frame(Instant::now()) else {
            return;
        };

        if let Some(ref window) = self.window {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}]",
                self.config.window.title, sample.fps, sample.frame_ms, mode
            ));
        }
        log::debug!("{} frames presented in total", self.frame_loop.frames());
    }
}

/// Frame rate averaged over roughly one-second windows
struct FpsCounter {
    frames: u32,
    window_start: Instant,
    last_frame: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FpsSample {
    fps: f32,
    /// Duration of the frame that closed the window
    frame_ms: f32,
}

impl FpsCounter {
    const WINDOW: Duration = Duration::from_secs(1);

    fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            last_frame: now,
        }
    }

    /// Count a frame finished at `now`; yields a sample when a window closes
    fn frame(&mut self, now: Instant) -> Option<FpsSample> {
        let frame_ms = now.duration_since(self.last_frame).as_secs_f32() * 1000.0;
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.duration_since(self.window_start);
        if elapsed < Self::WINDOW {
            return None;
        }

        let sample = FpsSample {
            fps: self.frames as f32 / elapsed.as_secs_f32(),
            frame_ms,
        };
        self.frames = 0;
        self.window_start = now;
        Some(sample)
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match Renderer::new(window.clone(), &self.config) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.window = Some(window);
            }
            Err(e) => self.fail(event_loop, e.context("Failed to initialize Vulkan")),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.frame_loop.running().stop();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Err(e) = renderer.on_resize(size.width, size.height) {
                        self.fail(event_loop, e);
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };
                match self.frame_loop.tick(renderer) {
                    Ok(FrameOutcome::Presented | FrameOutcome::Recreated) => self.update_fps(),
                    Ok(FrameOutcome::Skipped | FrameOutcome::Abandoned) => {}
                    Err(e) => self.fail(event_loop, e),
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        if key == self.quit_key {
                            log::info!("{:?} pressed, exiting...", key);
                            self.frame_loop.running().stop();
                            event_loop.exit();
                        } else if key == self.fullscreen_key {
                            self.toggle_fullscreen();
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// We use this to request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if !self.frame_loop.running().is_running() {
            event_loop.exit();
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        // Renderer waits for the GPU and releases everything in reverse order
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
