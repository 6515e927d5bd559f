// Background compute pipeline
//
// Loads the SPIR-V shader, builds the storage-image descriptor set pointing
// at the draw target, and assembles the compute pipeline. The orchestrator
// treats the result as opaque: it only binds and dispatches.

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec4;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use super::deletion::{DeletionQueue, DisposableResource};
use super::descriptor::{DescriptorAllocator, DescriptorLayoutBuilder, PoolSizeRatio};
use super::VulkanDevice;

/// Workgroup edge length of the background shader. Must match
/// `local_size_x/y` in shaders/gradient.comp.
pub const WORKGROUP_SIZE: u32 = 16;

/// Workgroup counts covering the full draw extent.
pub fn dispatch_counts(extent: vk::Extent2D) -> (u32, u32) {
    (
        extent.width.div_ceil(WORKGROUP_SIZE),
        extent.height.div_ceil(WORKGROUP_SIZE),
    )
}

/// Push constants consumed by the background shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BackgroundPushConstants {
    pub top_color: Vec4,
    pub bottom_color: Vec4,
}

/// Load SPIR-V shader bytes and create a shader module
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // SPIR-V is a stream of 4-byte words; read_spv handles alignment
    let words = ash::util::read_spv(&mut Cursor::new(code))
        .context("Shader binary is not valid SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Pick the one shader binary out of a candidate list.
///
/// Zero matches and multiple matches are both hard errors: silently taking
/// the first (or last) file of a directory scan hides a misconfigured
/// shader directory.
pub fn select_unique_shader(mut candidates: Vec<PathBuf>) -> Result<PathBuf> {
    candidates.sort();
    match candidates.len() {
        0 => anyhow::bail!("No .spv shader binary found"),
        1 => Ok(candidates.remove(0)),
        _ => anyhow::bail!(
            "Ambiguous shader selection, found {} candidates: {}",
            candidates.len(),
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Resolve the configured shader path: either a .spv file directly, or a
/// directory that must contain exactly one.
pub fn resolve_shader_path(configured: &Path) -> Result<PathBuf> {
    if configured.is_file() {
        return Ok(configured.to_path_buf());
    }

    let candidates = std::fs::read_dir(configured)
        .with_context(|| format!("Cannot read shader directory {:?}", configured))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "spv"))
        .collect();

    select_unique_shader(candidates)
        .with_context(|| format!("While scanning shader directory {:?}", configured))
}

/// The ready-to-bind background pass: compute pipeline plus the descriptor
/// set binding the draw target as a storage image.
pub struct BackgroundPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    descriptor_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
}

impl BackgroundPipeline {
    pub fn load(
        device: &VulkanDevice,
        draw_image_view: vk::ImageView,
        shader_path: &Path,
    ) -> Result<Self> {
        let spv_path = resolve_shader_path(shader_path)?;
        log::info!("Loading background shader from {:?}", spv_path);

        let code = std::fs::read(&spv_path)
            .with_context(|| format!("Failed to read shader binary {:?}", spv_path))?;
        let shader_module = create_shader_module(device, &code)?;

        // Binding 0: the draw target as a storage image
        let descriptor_layout = DescriptorLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::STORAGE_IMAGE)
            .build(device, vk::ShaderStageFlags::COMPUTE)?;

        let allocator = DescriptorAllocator::new(
            device,
            10,
            &[PoolSizeRatio {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                ratio: 1.0,
            }],
        )?;

        let descriptor_set = allocator.allocate(device, descriptor_layout)?;

        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: draw_image_view,
            image_layout: vk::ImageLayout::GENERAL,
        }];

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(descriptor_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&image_info)
            .build();

        unsafe {
            device.device.update_descriptor_sets(&[write], &[]);
        }

        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<BackgroundPushConstants>() as u32)
            .build();

        let set_layouts = [descriptor_layout];
        let push_constant_ranges = [push_constant_range];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = unsafe {
            device
                .device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")?
        };

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main")
            .build();

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create background compute pipeline")?
        };

        // The module is baked into the pipeline; no reason to keep it
        unsafe {
            device.device.destroy_shader_module(shader_module, None);
        }

        Ok(Self {
            pipeline: pipelines[0],
            layout,
            descriptor_set,
            descriptor_layout,
            descriptor_pool: allocator.pool,
        })
    }

    /// Hand every owned handle to a deletion queue; dependents are
    /// registered last so they are released first.
    pub fn register_teardown(&self, queue: &mut DeletionQueue) {
        queue.register(DisposableResource::DescriptorSetLayout(self.descriptor_layout));
        queue.register(DisposableResource::DescriptorPool(self.descriptor_pool));
        queue.register(DisposableResource::PipelineLayout(self.layout));
        queue.register(DisposableResource::Pipeline(self.pipeline));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_counts_cover_the_full_extent() {
        // Exact multiples
        let (x, y) = dispatch_counts(vk::Extent2D {
            width: 1280,
            height: 720,
        });
        assert_eq!((x, y), (80, 45));

        // Non-multiples round up so edge texels are still covered
        let (x, y) = dispatch_counts(vk::Extent2D {
            width: 1281,
            height: 721,
        });
        assert_eq!((x, y), (81, 46));

        let (x, y) = dispatch_counts(vk::Extent2D {
            width: 1,
            height: 1,
        });
        assert_eq!((x, y), (1, 1));
    }

    #[test]
    fn shader_selection_requires_exactly_one_candidate() {
        assert!(select_unique_shader(vec![]).is_err());

        let picked = select_unique_shader(vec![PathBuf::from("shaders/gradient.comp.spv")]);
        assert_eq!(picked.unwrap(), PathBuf::from("shaders/gradient.comp.spv"));

        let err = select_unique_shader(vec![
            PathBuf::from("a.spv"),
            PathBuf::from("b.spv"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("Ambiguous"));
    }

    #[test]
    fn push_constants_fit_vulkan_guaranteed_minimum() {
        // maxPushConstantsSize is at least 128 bytes on all implementations
        assert!(std::mem::size_of::<BackgroundPushConstants>() <= 128);
        assert_eq!(std::mem::size_of::<BackgroundPushConstants>(), 32);
    }
}
