// Minimal Vulkan engine bootstrap
//
// The interesting work lives in engine.rs; this file only wires the window
// event loop to it. Per iteration: poll window events, decide via the loop
// policy whether to draw, idle or quit, and act on it.

mod backend;
mod config;
mod engine;

use anyhow::Result;
use config::Config;
use engine::{DrawError, Engine, LoopPolicy, Tick};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::load();
    log::info!("Starting renderer");
    log::info!("Window: {}x{}", config.window.width, config.window.height);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // A fatal draw error exits the loop; surface it as the process result
    match app.fatal_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct App {
    config: Config,
    window: Option<Window>,
    engine: Option<Engine>,
    policy: LoopPolicy,
    fatal_error: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            engine: None,
            policy: LoopPolicy::new(),
            fatal_error: None,
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        match self.policy.next() {
            Tick::Quit => {
                event_loop.exit();
            }
            Tick::Idle(backoff) => {
                std::thread::sleep(backoff);
            }
            Tick::Draw => {
                let Some(engine) = self.engine.as_mut() else {
                    return;
                };
                match engine.draw() {
                    Ok(()) => {}
                    Err(DrawError::Swapchain(e)) => {
                        // Out-of-date / timeout: skip this frame, keep going
                        log::warn!("Skipping frame: {}", e);
                    }
                    Err(DrawError::Fatal(e)) => {
                        log::error!("Fatal render error: {:?}", e);
                        self.fatal_error = Some(e);
                        event_loop.exit();
                    }
                }
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => window,
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match Engine::new(&self.config, &window) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.window = Some(window);
            }
            Err(e) => {
                log::error!("Failed to initialize engine: {:?}", e);
                self.fatal_error = Some(e);
                event_loop.exit();
            }
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
                if let Some(ref engine) = self.engine {
                    log::info!("Rendered {} frames", engine.frame_number());
                }
                self.policy.request_quit();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                // Zero-sized means minimized: stop drawing until restored
                let minimized = size.width == 0 || size.height == 0;
                if minimized != self.policy.is_minimized() {
                    log::debug!(
                        "Window {} ({}x{})",
                        if minimized { "minimized" } else { "restored" },
                        size.width,
                        size.height
                    );
                }
                self.policy.set_minimized(minimized);
            }

            WindowEvent::RedrawRequested => {
                self.redraw(event_loop);
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting...");
                        self.policy.request_quit();
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
