// Descriptor set layout and allocation helpers
//
// The background pass needs exactly one storage-image binding, but the
// builder/allocator pair keeps layout construction declarative for whatever
// comes next.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Collects bindings, then builds a descriptor set layout in one call.
#[derive(Default)]
pub struct DescriptorLayoutBuilder {
    bindings: Vec<(u32, vk::DescriptorType)>,
}

impl DescriptorLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(mut self, binding: u32, ty: vk::DescriptorType) -> Self {
        self.bindings.push((binding, ty));
        self
    }

    /// Build the layout. Stage flags apply to every binding; per-binding
    /// stages are not supported here.
    pub fn build(
        self,
        device: &VulkanDevice,
        stages: vk::ShaderStageFlags,
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = self
            .bindings
            .iter()
            .map(|&(binding, ty)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(stages)
                    .build()
            })
            .collect();

        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        unsafe {
            device
                .device
                .create_descriptor_set_layout(&info, None)
                .context("Failed to create descriptor set layout")
        }
    }
}

/// How many descriptors of a type to reserve per set in a pool.
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

/// A fixed-size descriptor pool and its allocation entry point.
pub struct DescriptorAllocator {
    pub pool: vk::DescriptorPool,
}

impl DescriptorAllocator {
    pub fn new(
        device: &VulkanDevice,
        max_sets: u32,
        ratios: &[PoolSizeRatio],
    ) -> Result<Self> {
        let pool_sizes: Vec<_> = ratios
            .iter()
            .map(|ratio| vk::DescriptorPoolSize {
                ty: ratio.ty,
                descriptor_count: (ratio.ratio * max_sets as f32) as u32,
            })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe {
            device
                .device
                .create_descriptor_pool(&pool_info, None)
                .context("Failed to create descriptor pool")?
        };

        Ok(Self { pool })
    }

    pub fn allocate(
        &self,
        device: &VulkanDevice,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe {
            device
                .device
                .allocate_descriptor_sets(&alloc_info)
                .context("Failed to allocate descriptor set")?
        };

        Ok(sets[0])
    }
}
