// Deferred resource teardown
//
// GPU work from up to N frames ago may still read a resource when the CPU is
// done with it, so nothing is freed inline. Subsystems register a tagged
// handle on a deletion queue instead; the owner drains the queue at a point
// where the GPU is provably finished with everything in it (after the slot's
// render fence, or after device_wait_idle at shutdown).

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;

/// A GPU resource whose release has been deferred.
///
/// Tagged handles instead of boxed closures: every pending release stays
/// inspectable and carries no hidden captured state.
pub enum DisposableResource {
    ImageView(vk::ImageView),
    Image {
        image: vk::Image,
        allocation: Allocation,
    },
    Buffer {
        buffer: vk::Buffer,
        allocation: Allocation,
    },
    Sampler(vk::Sampler),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
    ShaderModule(vk::ShaderModule),
}

/// Ordered registry of deferred cleanup actions.
///
/// Resource acquisition is a nested sequence (image, then view, then binding),
/// so release must run in reverse registration order: the most recently
/// acquired resource dies first, which respects the dependency chain without
/// tracking it explicitly.
pub struct DeletionQueue<R = DisposableResource> {
    pending: Vec<R>,
}

impl<R> DeletionQueue<R> {
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Append a resource for deferred release.
    pub fn register(&mut self, resource: R) {
        self.pending.push(resource);
    }

    /// Release everything in reverse registration order, leaving the queue
    /// empty. Draining an empty queue is a no-op. The release callback must
    /// not fail; cleanup has to run to completion.
    pub fn drain(&mut self, mut release: impl FnMut(R)) {
        while let Some(resource) = self.pending.pop() {
            release(resource);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<R> Default for DeletionQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Destroy a single deferred resource.
///
/// Failures are logged and swallowed: escalating out of a teardown path would
/// leave the rest of the queue undrained.
///
/// # Safety contract
/// The caller must guarantee no GPU work still references the handle.
pub fn dispose(device: &ash::Device, allocator: &Mutex<Allocator>, resource: DisposableResource) {
    unsafe {
        match resource {
            DisposableResource::ImageView(view) => device.destroy_image_view(view, None),
            DisposableResource::Image { image, allocation } => {
                device.destroy_image(image, None);
                if let Err(e) = allocator.lock().free(allocation) {
                    log::warn!("Failed to free image memory: {}", e);
                }
            }
            DisposableResource::Buffer { buffer, allocation } => {
                device.destroy_buffer(buffer, None);
                if let Err(e) = allocator.lock().free(allocation) {
                    log::warn!("Failed to free buffer memory: {}", e);
                }
            }
            DisposableResource::Sampler(sampler) => device.destroy_sampler(sampler, None),
            DisposableResource::DescriptorPool(pool) => device.destroy_descriptor_pool(pool, None),
            DisposableResource::DescriptorSetLayout(layout) => {
                device.destroy_descriptor_set_layout(layout, None)
            }
            DisposableResource::PipelineLayout(layout) => {
                device.destroy_pipeline_layout(layout, None)
            }
            DisposableResource::Pipeline(pipeline) => device.destroy_pipeline(pipeline, None),
            DisposableResource::ShaderModule(module) => device.destroy_shader_module(module, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_reverse_registration_order() {
        let mut queue = DeletionQueue::new();
        queue.register("A");
        queue.register("B");
        queue.register("C");

        let mut released = Vec::new();
        queue.drain(|r| released.push(r));

        assert_eq!(released, vec!["C", "B", "A"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_on_empty_queue_is_a_noop() {
        let mut queue: DeletionQueue<&str> = DeletionQueue::new();
        let mut released = Vec::new();
        queue.drain(|r| released.push(r));
        assert!(released.is_empty());

        // Draining twice changes nothing
        queue.drain(|r| released.push(r));
        assert!(released.is_empty());
    }

    #[test]
    fn queue_is_reusable_after_drain() {
        let mut queue = DeletionQueue::new();
        queue.register(1);
        queue.drain(|_| {});

        queue.register(2);
        queue.register(3);
        let mut released = Vec::new();
        queue.drain(|r| released.push(r));
        assert_eq!(released, vec![3, 2]);
    }
}
