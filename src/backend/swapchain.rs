// Swapchain - Window presentation
//
// Manages the chain of presentable images. Format and extent are fixed at
// creation; the only supported "resize" is the clean recreation boundary
// (drop, then build a new one) since the draw target and views must be
// rebuilt alongside it anyway.

use ash::vk;
use std::sync::Arc;
use thiserror::Error;

use super::VulkanDevice;

/// Fixed presentable format: 8-bit RGBA in the sRGB-nonlinear color space.
pub const SWAPCHAIN_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;
pub const SWAPCHAIN_COLOR_SPACE: vk::ColorSpaceKHR = vk::ColorSpaceKHR::SRGB_NONLINEAR;

/// Frame-paced presentation: FIFO is vsync-locked and the one mode Vulkan
/// guarantees everywhere, but we still verify the surface reports it.
pub const PRESENT_MODE: vk::PresentModeKHR = vk::PresentModeKHR::FIFO;

#[derive(Debug, Error)]
pub enum SwapchainError {
    /// The surface/device pair cannot present our fixed format or mode.
    #[error("surface cannot present {format:?} with {mode:?}")]
    DeviceCapability {
        format: vk::Format,
        mode: vk::PresentModeKHR,
    },
    /// No image became writable within the bounded wait. Recoverable in
    /// principle by a surrounding recreate path.
    #[error("no swapchain image became available within the timeout")]
    Timeout,
    /// The swapchain no longer matches the surface (e.g. after a resize).
    /// Recoverable in principle by recreating the swapchain.
    #[error("swapchain is out of date with the surface")]
    OutOfDate,
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::extensions::khr::Surface,
        width: u32,
        height: u32,
    ) -> Result<Self, SwapchainError> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface_caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, surface)
        }?;

        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }?;

        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, surface)
        }?;

        // The format and present mode are policy, not preference: if the
        // surface cannot do them, that is a capability error, not a fallback.
        let format_supported = formats
            .iter()
            .any(|f| f.format == SWAPCHAIN_FORMAT && f.color_space == SWAPCHAIN_COLOR_SPACE);
        let mode_supported = present_modes.contains(&PRESENT_MODE);

        if !format_supported || !mode_supported {
            return Err(SwapchainError::DeviceCapability {
                format: SWAPCHAIN_FORMAT,
                mode: PRESENT_MODE,
            });
        }

        // Choose extent
        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        // TRANSFER_DST so the draw target can be blitted into the image
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(SWAPCHAIN_FORMAT)
            .image_color_space(SWAPCHAIN_COLOR_SPACE)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(PRESENT_MODE)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }?;

        log::info!("Created swapchain with {} images", images.len());

        // One view per image, same order, same lifetime
        let image_views = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(SWAPCHAIN_FORMAT)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe { device.device.create_image_view(&create_info, None) }
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug_assert_eq!(images.len(), image_views.len());

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views,
            extent,
            device,
        })
    }

    /// Acquire the next presentable image. `semaphore` is signaled once the
    /// image is actually writable; the calling thread may block up to
    /// `timeout_ns`. Returns the image index and a suboptimal flag.
    pub fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), SwapchainError> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(SwapchainError::Timeout),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(SwapchainError::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present a rendered image, waiting on the given semaphores.
    /// Returns true if the swapchain is suboptimal for the surface.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool, SwapchainError> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(SwapchainError::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Views die before the swapchain that owns their images. The engine
        // only drops this after confirming the device is idle.
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
