// Frame orchestrator
//
// Drives the per-frame cycle: wait for the slot's fence, drain its deletion
// queue, acquire a swapchain image, record the background pass, submit, and
// present. One control thread owns the whole loop; the GPU is a separate
// execution domain reached only through the sync primitives, so no locks are
// involved anywhere on this path.

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec4;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use winit::window::Window;

use crate::backend::deletion::{dispose, DeletionQueue};
use crate::backend::image::{copy_image_to_image, transition_image, AllocatedImage, ImageState};
use crate::backend::pipeline::{dispatch_counts, BackgroundPipeline, BackgroundPushConstants};
use crate::backend::swapchain::{Swapchain, SwapchainError};
use crate::backend::{FrameRing, VulkanDevice};
use crate::config::Config;

/// Bounded wait for image acquisition (1 second).
pub const ACQUIRE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Sleep increment while the window is minimized. A deliberate backoff, not
/// busy-polling.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Draw failure, split by what the caller can do about it.
#[derive(Debug, Error)]
pub enum DrawError {
    /// Timeout / out-of-date from acquisition or present. A surrounding
    /// recreate path could recover; this core only reports it.
    #[error("swapchain: {0}")]
    Swapchain(SwapchainError),
    /// Broken command stream, failed submission, failed primitive. Not
    /// locally recoverable; the process should go down.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// What the render loop should do on this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Record and present a frame.
    Draw,
    /// Window is not visible; sleep for the given increment instead.
    Idle(Duration),
    /// Shut down.
    Quit,
}

/// Pure pacing policy for the cooperative event/draw loop. Event polling is
/// interleaved with drawing on the same thread and never blocks on GPU
/// state; this struct only turns the polled flags into a decision.
#[derive(Debug, Default)]
pub struct LoopPolicy {
    minimized: bool,
    quit: bool,
}

impl LoopPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_minimized(&mut self, minimized: bool) {
        self.minimized = minimized;
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn request_quit(&mut self) {
        self.quit = true;
    }

    pub fn next(&self) -> Tick {
        if self.quit {
            Tick::Quit
        } else if self.minimized {
            Tick::Idle(IDLE_BACKOFF)
        } else {
            Tick::Draw
        }
    }
}

/// The engine context: every Vulkan handle the frame loop touches, owned
/// explicitly (no globals). The engine owns the swapchain, the swapchain
/// owns its image views, each frame slot owns its command buffer.
pub struct Engine {
    device: Arc<VulkanDevice>,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    swapchain: Option<Swapchain>,
    draw_image: AllocatedImage,
    background: BackgroundPipeline,
    background_colors: BackgroundPushConstants,
    frames: FrameRing,
    /// Resources living as long as the engine; drained after the per-slot
    /// queues at shutdown.
    global_deletion: DeletionQueue,
    cleaned_up: bool,
}

impl Engine {
    pub fn new(config: &Config, window: &Window) -> Result<Self> {
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let device = VulkanDevice::new(&config.window.title, enable_validation, display_handle)?;

        let (surface_loader, surface) = device.create_surface(display_handle, window_handle)?;

        // Verify the selected queue family can present to this surface
        let surface_support = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )?
        };
        if !surface_support {
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            &surface_loader,
            size.width,
            size.height,
        )
        .context("Failed to create swapchain")?;

        let mut global_deletion = DeletionQueue::new();

        // Offscreen draw target, sized to the swapchain; it lives as long as
        // the engine, so teardown goes through the global queue
        let mut draw_image = AllocatedImage::new_draw_target(
            &device,
            swapchain.extent.width,
            swapchain.extent.height,
        )?;
        draw_image.register_teardown(&mut global_deletion);

        let background = BackgroundPipeline::load(&device, draw_image.view, &config.graphics.shader)?;
        background.register_teardown(&mut global_deletion);

        let background_colors = BackgroundPushConstants {
            top_color: Vec4::from_array(config.graphics.background_top_color),
            bottom_color: Vec4::from_array(config.graphics.background_bottom_color),
        };

        let frames = FrameRing::new(&device, config.graphics.frames_in_flight)?;

        log::info!("Engine initialized");

        Ok(Self {
            device,
            surface_loader,
            surface,
            swapchain: Some(swapchain),
            draw_image,
            background,
            background_colors,
            frames,
            global_deletion,
            cleaned_up: false,
        })
    }

    pub fn frame_number(&self) -> u64 {
        self.frames.frame_number()
    }

    /// Record, submit and present one frame out of the current slot.
    ///
    /// Per slot the order is fixed: wait fence -> drain slot queue ->
    /// acquire -> reset fence -> record -> submit -> present.
    pub fn draw(&mut self) -> Result<(), DrawError> {
        let device = self.device.device.clone();
        let swapchain = self
            .swapchain
            .as_ref()
            .context("Swapchain not initialized")?;

        let allocator = self.device.allocator();
        let slot = self.frames.current_slot_mut();

        // The slot's command buffer was last used N frames ago; its fence
        // gates reuse. A timeout here is fatal (hung GPU).
        slot.sync.wait_render_fence(&device)?;

        // Safe point: nothing from this slot's previous frame is still
        // executing, so its deferred resources can go
        slot.deletion_queue.drain(|r| dispose(&device, allocator, r));

        // Acquire before resetting the fence: if acquisition fails
        // recoverably, the slot must still be reusable next tick
        let (image_index, _suboptimal) = match swapchain
            .acquire_next_image(ACQUIRE_TIMEOUT_NS, slot.sync.image_acquired)
        {
            Ok(pair) => pair,
            Err(e @ (SwapchainError::Timeout | SwapchainError::OutOfDate)) => {
                return Err(DrawError::Swapchain(e));
            }
            Err(e) => {
                return Err(DrawError::Fatal(
                    anyhow::Error::new(e).context("Image acquisition failed"),
                ));
            }
        };

        slot.sync.reset_render_fence(&device)?;

        let cmd = slot.command_buffer;
        let image_acquired = slot.sync.image_acquired;
        let render_complete = slot.sync.render_complete;
        let render_fence = slot.sync.render_fence;
        let swapchain_image = swapchain.images[image_index as usize];

        // One-shot recording
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;
        }

        // Draw target: Undefined -> GeneralWrite, background pass writes it
        transition_image(
            &device,
            cmd,
            self.draw_image.image,
            ImageState::Undefined,
            ImageState::GeneralWrite,
        );

        self.record_background_pass(&device, cmd);

        // Draw target becomes the blit source, swapchain image the
        // destination
        transition_image(
            &device,
            cmd,
            self.draw_image.image,
            ImageState::GeneralWrite,
            ImageState::TransferSrc,
        );
        transition_image(
            &device,
            cmd,
            swapchain_image,
            ImageState::Undefined,
            ImageState::TransferDst,
        );

        copy_image_to_image(
            &device,
            cmd,
            self.draw_image.image,
            swapchain_image,
            self.draw_image.extent,
            swapchain.extent,
        );

        transition_image(
            &device,
            cmd,
            swapchain_image,
            ImageState::TransferDst,
            ImageState::Present,
        );

        unsafe {
            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }

        // Submit: wait for the image at color-output, signal render_complete
        // for present and the fence for slot reuse
        let wait_semaphores = [image_acquired];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [render_complete];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    render_fence,
                )
                .context("Queue submission failed")?;
        }

        let present_result =
            swapchain.present(self.device.graphics_queue, image_index, &[render_complete]);

        // Work for this frame is submitted either way, so the counter moves
        // on and the next tick lands in the next slot
        self.frames.advance();

        match present_result {
            Ok(suboptimal) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal; recreation is up to the caller");
                }
                Ok(())
            }
            Err(e @ SwapchainError::OutOfDate) => Err(DrawError::Swapchain(e)),
            Err(e) => Err(DrawError::Fatal(
                anyhow::Error::new(e).context("Presentation failed"),
            )),
        }
    }

    /// Bind the compute pipeline + descriptor set and dispatch enough 16x16
    /// workgroups to cover the draw target.
    fn record_background_pass(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.background.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.background.layout,
                0,
                &[self.background.descriptor_set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.background.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&self.background_colors),
            );

            let (groups_x, groups_y) = dispatch_counts(self.draw_image.extent);
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);
        }
    }

    /// Tear everything down in dependency order. Idempotent; also runs from
    /// Drop. Failures are logged, never propagated - shutdown must finish.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        log::info!("Cleaning up engine resources...");

        // Full sync barrier first: nothing below may be destroyed while the
        // GPU still references it
        if let Err(e) = self.device.wait_idle() {
            log::warn!("device_wait_idle failed during shutdown: {}", e);
        }

        let device = self.device.device.clone();
        let allocator = self.device.allocator();

        // 1. Per-slot queues, then the slots' pools and sync objects
        for slot in self.frames.slots_mut() {
            slot.deletion_queue.drain(|r| dispose(&device, allocator, r));
            slot.destroy(&device);
        }

        // 2. Global queue (draw target, background pipeline, ...)
        self.global_deletion.drain(|r| dispose(&device, allocator, r));

        // 3. Swapchain: views, then the swapchain handle
        self.swapchain = None;

        // 4. Surface; device and instance go last when the Arc drops
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }

        log::info!("Cleanup complete");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::frame::slot_for;

    /// Stand-in for the GPU side of the loop: records what a draw tick
    /// would acquire, submit and present.
    #[derive(Default)]
    struct MockGpu {
        frame_number: u64,
        slots_used: Vec<usize>,
        acquired: Vec<u32>,
        submits: u32,
        presents: u32,
    }

    impl MockGpu {
        const SLOT_COUNT: usize = 2;
        const IMAGE_COUNT: u32 = 3;

        fn draw(&mut self) {
            self.slots_used
                .push(slot_for(self.frame_number, Self::SLOT_COUNT));
            self.acquired.push((self.frame_number % Self::IMAGE_COUNT as u64) as u32);
            self.submits += 1;
            self.presents += 1;
            self.frame_number += 1;
        }
    }

    #[test]
    fn steady_state_runs_four_cycles_across_both_slots() {
        let policy = LoopPolicy::new();
        let mut gpu = MockGpu::default();

        for _ in 0..4 {
            match policy.next() {
                Tick::Draw => gpu.draw(),
                other => panic!("expected a draw tick, got {:?}", other),
            }
        }

        assert_eq!(gpu.slots_used, vec![0, 1, 0, 1]);
        assert_eq!(gpu.acquired.len(), 4);
        assert_eq!(gpu.submits, 4);
        assert_eq!(gpu.presents, 4);
        assert_eq!(gpu.frame_number, 4);
    }

    #[test]
    fn minimized_window_idles_instead_of_drawing() {
        let mut policy = LoopPolicy::new();
        let mut gpu = MockGpu::default();

        policy.set_minimized(true);
        for _ in 0..3 {
            match policy.next() {
                Tick::Idle(backoff) => assert_eq!(backoff, IDLE_BACKOFF),
                other => panic!("expected idle while minimized, got {:?}", other),
            }
        }
        assert_eq!(gpu.frame_number, 0);

        // Restore: draws resume immediately
        policy.set_minimized(false);
        assert_eq!(policy.next(), Tick::Draw);
        gpu.draw();
        assert_eq!(gpu.frame_number, 1);
    }

    /// A slot's command buffer must never be re-recorded while its render
    /// fence is unsignaled. Simulates a GPU that only retires work when the
    /// CPU blocks on the fence.
    #[test]
    fn slot_is_never_rerecorded_before_its_fence_signals() {
        const SLOT_COUNT: usize = 2;

        // Fences start signaled so frame 0 and 1 proceed without blocking
        let mut fence_signaled = [true; SLOT_COUNT];
        let mut in_flight: std::collections::VecDeque<usize> = Default::default();
        let mut blocking_waits = 0;

        for frame in 0..6u64 {
            let slot = slot_for(frame, SLOT_COUNT);

            // Wait phase: a still-unsignaled fence forces a block until the
            // slow GPU retires the oldest outstanding frame
            if !fence_signaled[slot] {
                blocking_waits += 1;
                let retired = in_flight.pop_front().expect("unsignaled fence with no work");
                fence_signaled[retired] = true;
            }
            assert!(fence_signaled[slot], "recording against an unsignaled fence");

            // Reset, record, submit; the fence stays unsignaled until the
            // GPU gets to this frame
            fence_signaled[slot] = false;
            in_flight.push_back(slot);
        }

        // Both initially-signaled slots pass for free; every later frame
        // had to wait for the GPU
        assert_eq!(blocking_waits, 4);
        assert_eq!(in_flight.len(), SLOT_COUNT);
    }

    #[test]
    fn quit_wins_over_everything() {
        let mut policy = LoopPolicy::new();
        policy.set_minimized(true);
        policy.request_quit();
        assert_eq!(policy.next(), Tick::Quit);
    }

    /// Shutdown must drain per-slot queues before the global queue, release
    /// within each queue in reverse registration order, and never touch a
    /// resource twice.
    #[test]
    fn shutdown_releases_queues_in_order_without_reuse() {
        use crate::backend::deletion::DeletionQueue;

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        enum MockResource {
            SlotScratch { slot: usize, id: u32 },
            GlobalImage,
            GlobalView,
        }

        let mut slot_queues = vec![DeletionQueue::new(), DeletionQueue::new()];
        for (slot, queue) in slot_queues.iter_mut().enumerate() {
            queue.register(MockResource::SlotScratch { slot, id: 0 });
            queue.register(MockResource::SlotScratch { slot, id: 1 });
        }

        let mut global_queue = DeletionQueue::new();
        // Image registered before its view, so the view must die first
        global_queue.register(MockResource::GlobalImage);
        global_queue.register(MockResource::GlobalView);

        let mut released = Vec::new();
        for queue in &mut slot_queues {
            queue.drain(|r| released.push(r));
        }
        global_queue.drain(|r| released.push(r));

        assert_eq!(
            released,
            vec![
                MockResource::SlotScratch { slot: 0, id: 1 },
                MockResource::SlotScratch { slot: 0, id: 0 },
                MockResource::SlotScratch { slot: 1, id: 1 },
                MockResource::SlotScratch { slot: 1, id: 0 },
                MockResource::GlobalView,
                MockResource::GlobalImage,
            ]
        );

        // No use-after-destroy: every release is unique
        let unique: std::collections::HashSet<_> = released.iter().collect();
        assert_eq!(unique.len(), released.len());

        // And nothing is left behind
        assert!(slot_queues.iter().all(|q| q.is_empty()));
        assert!(global_queue.is_empty());
    }
}
