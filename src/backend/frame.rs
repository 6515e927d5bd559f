// Frame slots - per-in-flight-frame command recording state
//
// One slot per frame that may be in flight at once. While the GPU executes
// frame K out of slot 0, the CPU records frame K+1 into slot 1. Each slot
// exclusively owns its command pool, command buffer, sync objects and a local
// deletion queue for resources scoped to "this frame's work, N frames ago".

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::deletion::DeletionQueue;
use super::sync::FrameSync;
use super::VulkanDevice;

/// Default number of frames in flight (double buffering).
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// The slot a given frame number lands in. This is the only place the
/// modulus lives; slot count is configuration, not a scattered literal.
pub fn slot_for(frame_number: u64, slot_count: usize) -> usize {
    debug_assert!(slot_count > 0);
    (frame_number % slot_count as u64) as usize
}

/// Command-recording and sync state for one in-flight frame.
pub struct FrameSlot {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,
    /// Drained once the slot's render fence signals: no GPU work from this
    /// slot's previous frame can still read anything registered here.
    pub deletion_queue: DeletionQueue,
}

impl FrameSlot {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        // Own pool per slot so resetting one frame's commands never touches
        // another frame still executing.
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create frame command pool")?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe {
            device
                .device
                .allocate_command_buffers(&alloc_info)
                .context("Failed to allocate frame command buffer")?[0]
        };

        let sync = FrameSync::new(device)?;

        Ok(Self {
            command_pool,
            command_buffer,
            sync,
            deletion_queue: DeletionQueue::new(),
        })
    }

    /// Destroy the slot's pool and sync objects. The deletion queue must be
    /// drained by the caller first (it needs the allocator).
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            // Destroying the pool frees its command buffer too
            device.destroy_command_pool(self.command_pool, None);
        }
        self.sync.destroy(device);
    }
}

/// Ring of frame slots plus the global frame counter.
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    frame_number: u64,
}

impl FrameRing {
    pub fn new(device: &Arc<VulkanDevice>, slot_count: usize) -> Result<Self> {
        let slots = (0..slot_count)
            .map(|_| FrameSlot::new(device))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Created {} frame slots", slot_count);

        Ok(Self {
            slots,
            frame_number: 0,
        })
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn current_slot_mut(&mut self) -> &mut FrameSlot {
        let index = slot_for(self.frame_number, self.slots.len());
        &mut self.slots[index]
    }

    /// Advance the counter after a successful present.
    pub fn advance(&mut self) {
        self.frame_number += 1;
    }

    pub fn slots_mut(&mut self) -> &mut [FrameSlot] {
        &mut self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_for_is_frame_mod_slot_count() {
        for frame in 0..64u64 {
            assert_eq!(slot_for(frame, 2), (frame % 2) as usize);
            assert_eq!(slot_for(frame, 3), (frame % 3) as usize);
        }
    }

    #[test]
    fn consecutive_frames_cover_every_slot_exactly_once() {
        for slot_count in 1..=4usize {
            for start in 0..8u64 {
                let mut seen = vec![0u32; slot_count];
                for frame in start..start + slot_count as u64 {
                    seen[slot_for(frame, slot_count)] += 1;
                }
                assert!(seen.iter().all(|&count| count == 1));
            }
        }
    }
}
