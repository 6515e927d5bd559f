// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// Critical for correct and efficient multi-frame rendering

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Bounded wait for a slot's render fence. A full second without a signal
/// means the GPU is hung; there is no partial recovery from that.
pub const FENCE_WAIT_TIMEOUT_NS: u64 = 1_000_000_000;

/// Frame synchronization - one set per frame in flight.
///
/// Per slot, per frame the order is fixed:
/// wait fence -> reset fence -> record -> submit -> present.
/// Resetting a fence that is still awaited, or re-recording before the wait
/// completes, is a programming error, not a recoverable condition.
pub struct FrameSync {
    /// Signaled by swapchain acquisition when the image is writable;
    /// submission waits on it at the color-output stage.
    pub image_acquired: vk::Semaphore,
    /// Signaled when submitted GPU work finishes; presentation waits on it.
    pub render_complete: vk::Semaphore,
    /// CPU-observable completion signal gating reuse of the slot's
    /// command buffer.
    pub render_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so frame 0 does not block on a render that never
        // happened.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_acquired: device.device.create_semaphore(&semaphore_info, None)?,
                render_complete: device.device.create_semaphore(&semaphore_info, None)?,
                render_fence: device.device.create_fence(&fence_info, None)?,
            })
        }
    }

    /// Block until the slot's previous submission has retired.
    pub fn wait_render_fence(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device
                .wait_for_fences(&[self.render_fence], true, FENCE_WAIT_TIMEOUT_NS)
                .context("Render fence wait timed out - GPU appears hung")?;
        }
        Ok(())
    }

    /// Reset the fence before recording new work. Only valid after
    /// `wait_render_fence` has returned.
    pub fn reset_render_fence(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device
                .reset_fences(&[self.render_fence])
                .context("Failed to reset render fence")?;
        }
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_acquired, None);
            device.destroy_semaphore(self.render_complete, None);
            device.destroy_fence(self.render_fence, None);
        }
    }
}
