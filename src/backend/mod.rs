// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod deletion;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod image;
pub mod pipeline;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use frame::FrameRing;
