// Descriptor layout, pool and the single set the quad uses
//
// binding 0: uniform buffer with the MVP matrices (vertex stage)
// binding 1: combined image sampler for the texture (fragment stage)

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::DeviceBuffer;
use super::texture::Texture;
use super::VulkanDevice;

pub const UNIFORM_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;

pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding; 2] {
    [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(SAMPLER_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ]
}

/// Pool sizes covering exactly one set of `layout_bindings`
pub fn pool_sizes() -> Vec<vk::DescriptorPoolSize> {
    layout_bindings()
        .iter()
        .map(|binding| vk::DescriptorPoolSize {
            ty: binding.descriptor_type,
            descriptor_count: binding.descriptor_count,
        })
        .collect()
}

pub struct DescriptorSetLayout {
    pub layout: vk::DescriptorSetLayout,
    device: Arc<VulkanDevice>,
}

impl DescriptorSetLayout {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let bindings = layout_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        Ok(Self {
            layout,
            device: device.clone(),
        })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Pool plus the one set allocated from it; the set goes away with the pool
pub struct Descriptors {
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    device: Arc<VulkanDevice>,
}

impl Descriptors {
    pub fn new(
        device: &Arc<VulkanDevice>,
        layout: &DescriptorSetLayout,
        uniform: &DeviceBuffer,
        texture: &Texture,
    ) -> Result<Self> {
        let sizes = pool_sizes();
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(1);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        // Drop owns the pool from here on
        let mut descriptors = Self {
            pool,
            set: vk::DescriptorSet::null(),
            device: device.clone(),
        };

        let set_layouts = [layout.layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);

        let sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?;
        descriptors.set = sets[0];

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: uniform.buffer,
            offset: 0,
            range: uniform.size,
        }];
        let image_info = [vk::DescriptorImageInfo {
            sampler: texture.sampler,
            image_view: texture.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];

        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(descriptors.set)
                .dst_binding(UNIFORM_BINDING)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(descriptors.set)
                .dst_binding(SAMPLER_BINDING)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info)
                .build(),
        ];

        unsafe { device.device.update_descriptor_sets(&writes, &[]) };

        Ok(descriptors)
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_is_vertex_only_and_sampler_is_fragment_only() {
        let [uniform, sampler] = layout_bindings();

        assert_eq!(uniform.binding, 0);
        assert_eq!(uniform.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(uniform.stage_flags, vk::ShaderStageFlags::VERTEX);

        assert_eq!(sampler.binding, 1);
        assert_eq!(sampler.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sampler.stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn pool_is_sized_for_one_descriptor_of_each_kind() {
        let sizes = pool_sizes();

        assert_eq!(sizes.len(), 2);
        for kind in [vk::DescriptorType::UNIFORM_BUFFER, vk::DescriptorType::COMBINED_IMAGE_SAMPLER] {
            let total: u32 = sizes
                .iter()
                .filter(|size| size.ty == kind)
                .map(|size| size.descriptor_count)
                .sum();
            assert_eq!(total, 1, "{:?}", kind);
        }
    }
}
