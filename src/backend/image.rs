// Image resources and layout transitions
//
// GPU images must be moved through explicit layout states before each usage;
// touching an image in the wrong layout is undefined behavior on the device.
// This module owns the engine's offscreen draw target and the barrier
// plumbing that keeps every image in a legal layout.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::deletion::{DeletionQueue, DisposableResource};
use super::VulkanDevice;

/// Format of the offscreen draw target. Higher precision than the swapchain
/// so the background pass has headroom; the blit converts on copy.
pub const DRAW_IMAGE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// The layout states engine images move through.
///
/// Draw target per frame: Undefined -> GeneralWrite -> TransferSrc.
/// Swapchain image per frame: Undefined -> TransferDst -> Present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Contents are garbage; only valid as a transition source.
    Undefined,
    /// General layout for compute shader storage writes.
    GeneralWrite,
    /// Source of a transfer (blit/copy) operation.
    TransferSrc,
    /// Destination of a transfer operation.
    TransferDst,
    /// Ready for presentation to the surface.
    Present,
}

impl ImageState {
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ImageState::Undefined => vk::ImageLayout::UNDEFINED,
            ImageState::GeneralWrite => vk::ImageLayout::GENERAL,
            ImageState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Access mask and pipeline stage when this state is the barrier source.
    fn src_masks(self) -> (vk::AccessFlags, vk::PipelineStageFlags) {
        match self {
            // Nothing to wait for: previous contents are discarded
            ImageState::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
            ImageState::GeneralWrite => (
                vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
            ImageState::TransferSrc => (
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::TRANSFER,
            ),
            ImageState::TransferDst => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            ImageState::Present => (
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            ),
        }
    }

    /// Access mask and pipeline stage when this state is the barrier
    /// destination.
    fn dst_masks(self) -> (vk::AccessFlags, vk::PipelineStageFlags) {
        match self {
            // An image is never transitioned *into* Undefined
            ImageState::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
            ImageState::GeneralWrite => (
                vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
            ImageState::TransferSrc => (
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::TRANSFER,
            ),
            ImageState::TransferDst => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            // Presentation engine access is implicit
            ImageState::Present => (
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            ),
        }
    }
}

/// Barrier parameters for a layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_masks(from: ImageState, to: ImageState) -> TransitionMasks {
    debug_assert!(to != ImageState::Undefined, "cannot transition into Undefined");
    let (src_access, src_stage) = from.src_masks();
    let (dst_access, dst_stage) = to.dst_masks();
    TransitionMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Record a layout transition barrier into the command buffer.
pub fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    from: ImageState,
    to: ImageState,
) {
    let masks = transition_masks(from, to);

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(from.layout())
        .new_layout(to.layout())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Blit one color image into another, format and extent aware.
///
/// Both images must already be in TransferSrc / TransferDst layout.
pub fn copy_image_to_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    src_extent: vk::Extent2D,
    dst_extent: vk::Extent2D,
) {
    let subresource = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };

    let blit = vk::ImageBlit::builder()
        .src_subresource(subresource)
        .src_offsets([
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: src_extent.width as i32,
                y: src_extent.height as i32,
                z: 1,
            },
        ])
        .dst_subresource(subresource)
        .dst_offsets([
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: dst_extent.width as i32,
                y: dst_extent.height as i32,
                z: 1,
            },
        ])
        .build();

    unsafe {
        device.cmd_blit_image(
            cmd,
            src,
            ImageState::TransferSrc.layout(),
            dst,
            ImageState::TransferDst.layout(),
            &[blit],
            vk::Filter::LINEAR,
        );
    }
}

/// An image plus its view and backing allocation.
pub struct AllocatedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Taken when ownership moves into a deletion queue.
    allocation: Option<Allocation>,
}

impl AllocatedImage {
    /// Create the engine's offscreen draw target: GPU-only memory, sized to
    /// the swapchain, usable as storage image, blit source/destination and
    /// color attachment.
    pub fn new_draw_target(device: &Arc<VulkanDevice>, width: u32, height: u32) -> Result<Self> {
        let extent = vk::Extent2D { width, height };

        let usage = vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::COLOR_ATTACHMENT;

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DRAW_IMAGE_FORMAT)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device
                .device
                .create_image(&image_info, None)
                .context("Failed to create draw target image")?
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "draw target",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::DedicatedImage(image),
            })
            .context("Failed to allocate draw target memory")?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind draw target memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DRAW_IMAGE_FORMAT)
            .subresource_range(color_subresource_range());

        let view = unsafe {
            device
                .device
                .create_image_view(&view_info, None)
                .context("Failed to create draw target view")?
        };

        log::info!("Created draw target {}x{} ({:?})", width, height, DRAW_IMAGE_FORMAT);

        Ok(Self {
            image,
            view,
            extent,
            allocation: Some(allocation),
        })
    }

    /// Hand teardown over to a deletion queue. The image is registered before
    /// its view, so the drain releases the view first.
    pub fn register_teardown(&mut self, queue: &mut DeletionQueue) {
        if let Some(allocation) = self.allocation.take() {
            queue.register(DisposableResource::Image {
                image: self.image,
                allocation,
            });
            queue.register(DisposableResource::ImageView(self.view));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_map_to_the_expected_vulkan_layouts() {
        assert_eq!(ImageState::Undefined.layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(ImageState::GeneralWrite.layout(), vk::ImageLayout::GENERAL);
        assert_eq!(
            ImageState::TransferSrc.layout(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            ImageState::TransferDst.layout(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(ImageState::Present.layout(), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn draw_target_sequence_produces_legal_barriers() {
        // Undefined -> GeneralWrite: nothing waited on, compute blocked
        let masks = transition_masks(ImageState::Undefined, ImageState::GeneralWrite);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masks.src_access, vk::AccessFlags::empty());
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::COMPUTE_SHADER);

        // GeneralWrite -> TransferSrc: compute write visible before the blit reads
        let masks = transition_masks(ImageState::GeneralWrite, ImageState::TransferSrc);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(masks.src_access, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_READ);
    }

    #[test]
    fn swapchain_sequence_produces_legal_barriers() {
        // Undefined -> TransferDst: blit write blocked on nothing
        let masks = transition_masks(ImageState::Undefined, ImageState::TransferDst);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        // TransferDst -> Present: blit write flushed before presentation
        let masks = transition_masks(ImageState::TransferDst, ImageState::Present);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(masks.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert_eq!(masks.dst_access, vk::AccessFlags::empty());
    }
}
