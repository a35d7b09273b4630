// =============================================================================
// CLEAR WINDOW DEMO
// =============================================================================
//
// Opens a window and clears every back buffer to a colour that slowly cycles.
//
// FRAME FLOW:
// 1. Wait for the previous frame's fence
// 2. Acquire a back buffer (signals image_available)
// 3. Record Present -> CopyDest, clear, CopyDest -> Present
// 4. Submit waiting on image_available, signalling render_finished
// 5. Present waiting on render_finished
//
// Run with: cargo run --example clear_window
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rhi::{
    Aspect, CommandList, CommandListStorage, CommandQueue, Device, Fence, ImageViewType, ResourceState, RhiConfig,
    SubmitSync, SurfaceTarget, SwapChain,
};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes, WindowId},
};

const TITLE: &str = "rhi - clear window";
const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> Result<()> {
    init_logging();
    let config = RhiConfig::load();
    log::info!("Backend: {}", config.device.backend.name());

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}

// =============================================================================
// RENDERER
// =============================================================================

/// Everything tied to one window size. Rebuilt from scratch on resize.
struct Renderer {
    fence: Fence,
    list: CommandList,
    storage: CommandListStorage,
    queue: CommandQueue,
    swapchain: SwapChain,
    device: Device,
}

impl Renderer {
    fn new(config: &RhiConfig, window: &Window) -> Result<Self> {
        let size = window.inner_size();
        let target = SurfaceTarget::from_window(window)?;
        let (device, swapchain, queue) =
            Device::create_device_swapchain_and_graphic_presentable_queue(config, target, size.width, size.height)?;
        let storage = device.create_command_list_storage()?;
        let list = device.create_command_list(&storage)?;
        // Signalled so the first frame does not block
        let fence = device.create_fence(true)?;
        log::info!(
            "Renderer ready: {} back buffers {:?} {}x{}",
            swapchain.image_count(),
            swapchain.format(),
            size.width,
            size.height
        );
        Ok(Self { fence, list, storage, queue, swapchain, device })
    }

    fn render_frame(&mut self, color: [f32; 4]) -> Result<()> {
        let device = &self.device;

        // Step 1: One frame in flight
        if !device.wait_for_fence(&self.fence, Duration::from_secs(1))? {
            anyhow::bail!("Previous frame did not finish within a second");
        }
        device.reset_fence(&self.fence)?;

        // Step 2: Back buffer
        let index = device.get_next_backbuffer_id(&self.swapchain)?;
        let image = self.swapchain.image(index).context("Acquired back buffer out of range")?;
        let view = device.create_image_view(image, self.swapchain.format(), 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;

        // Step 3: Record
        let list = &mut self.list;
        device.start_command_list_recording(list, &self.storage)?;
        list.transition_all_subresources(image, ResourceState::Present, ResourceState::CopyDest)?;
        list.clear_color(&view, color)?;
        list.transition_all_subresources(image, ResourceState::CopyDest, ResourceState::Present)?;
        device.make_command_list_executable(list)?;

        // Step 4: Submit and present
        device.submit_executable_command_list_with(
            &self.queue,
            list,
            SubmitSync {
                wait: &[self.swapchain.image_available()],
                signal: &[self.swapchain.render_finished()],
                fence: Some(&self.fence),
            },
        )?;
        device.present(&self.queue, &self.swapchain, index)?;

        // The view is referenced by the submitted clear
        device.wait_for_fence(&self.fence, Duration::from_secs(1))?;
        device.destroy_image_view(view);
        Ok(())
    }

    fn destroy(self) -> Result<()> {
        let Renderer { fence, list, storage, queue: _, swapchain, device } = self;
        device.wait_idle()?;
        device.destroy_fence(fence);
        device.destroy_command_list(list)?;
        device.destroy_command_list_storage(storage)?;
        device.destroy_swapchain(swapchain)?;
        Ok(())
    }
}

// =============================================================================
// APPLICATION
// =============================================================================

struct App {
    config: RhiConfig,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    needs_resize: bool,
    is_minimized: bool,
    started: Instant,
}

impl App {
    fn new(config: RhiConfig) -> Self {
        Self {
            config,
            window: None,
            renderer: None,
            needs_resize: false,
            is_minimized: false,
            started: Instant::now(),
        }
    }

    fn rebuild_renderer(&mut self) -> Result<()> {
        if let Some(renderer) = self.renderer.take() {
            renderer.destroy()?;
        }
        if let Some(window) = self.window.clone() {
            self.renderer = Some(Renderer::new(&self.config, &window)?);
        }
        self.needs_resize = false;
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        if self.is_minimized {
            return Ok(());
        }
        if self.needs_resize {
            self.rebuild_renderer()?;
        }
        let t = self.started.elapsed().as_secs_f32();
        let color = [0.5 + 0.5 * t.sin(), 0.5 + 0.5 * (t * 0.7).sin(), 0.5 + 0.5 * (t * 1.3).sin(), 1.0];
        match self.renderer.as_mut() {
            Some(renderer) => renderer.render_frame(color),
            None => Ok(()),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attributes = WindowAttributes::default()
            .with_title(TITLE)
            .with_inner_size(winit::dpi::PhysicalSize::new(WIDTH, HEIGHT));
        let window = match event_loop.create_window(attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };
        self.window = Some(window);

        if let Err(e) = self.rebuild_renderer() {
            log::error!("Failed to initialize the renderer: {:?}", e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.is_minimized = size.width == 0 || size.height == 0;
                if !self.is_minimized {
                    self.needs_resize = true;
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render() {
                    log::error!("Render error: {:?}", e);
                    // Out-of-date swap chains surface as errors; rebuild next frame
                    self.needs_resize = true;
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
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

impl Drop for App {
    fn drop(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            if let Err(e) = renderer.destroy() {
                log::error!("Cleanup failed: {:?}", e);
            }
        }
        log::info!("Cleanup complete");
    }
}
