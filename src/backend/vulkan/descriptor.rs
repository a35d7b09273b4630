// Descriptor set layouts, pools, sets and samplers

use anyhow::{Context, Result};
use ash::vk;

use super::device::VulkanDevice;
use super::{conv, BACKEND};
use crate::descriptor::{DescriptorCapacity, DescriptorSetDescription, DescriptorSlot};
use crate::error::{exhausted, unsupported};
use crate::resource::SamplerType;

/// A resolved descriptor ready to be written into a set.
#[derive(Debug, Clone, Copy)]
pub(super) enum VkDescriptor {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    TexelBuffer(vk::BufferView),
}

pub(super) fn create_set_layout(device: &VulkanDevice, desc: &DescriptorSetDescription) -> Result<vk::DescriptorSetLayout> {
    let stages = conv::shader_stages(desc.stages);
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
        .ranges
        .iter()
        .map(|range| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(range.binding)
                .descriptor_type(conv::descriptor_type(range.kind))
                .descriptor_count(range.count)
                .stage_flags(stages)
                .build()
        })
        .collect();

    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

    unsafe { device.device.create_descriptor_set_layout(&create_info, None) }
        .context("Failed to create descriptor set layout")
}

pub(super) fn create_pipeline_layout(device: &VulkanDevice, sets: &[vk::DescriptorSetLayout]) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(sets);

    unsafe { device.device.create_pipeline_layout(&layout_info, None) }
        .context("Failed to create pipeline layout")
}

/// Pool sized for `max_sets` sets drawing on `capacities` descriptors.
pub(super) fn create_pool(device: &VulkanDevice, max_sets: u32, capacities: &[DescriptorCapacity]) -> Result<vk::DescriptorPool> {
    let pool_sizes: Vec<vk::DescriptorPoolSize> = capacities
        .iter()
        .filter(|capacity| capacity.count > 0)
        .map(|capacity| vk::DescriptorPoolSize {
            ty: conv::descriptor_type(capacity.kind),
            descriptor_count: capacity.count,
        })
        .collect();

    let create_info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(max_sets.max(1))
        .pool_sizes(&pool_sizes);

    match unsafe { device.device.create_descriptor_pool(&create_info, None) } {
        Ok(pool) => Ok(pool),
        Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
            exhausted!("descriptor pool for {} sets", max_sets)
        }
        Err(err) => Err(err).context("Failed to create descriptor pool"),
    }
}

pub(super) fn allocate_sets(
    device: &VulkanDevice,
    pool: vk::DescriptorPool,
    layouts: &[vk::DescriptorSetLayout],
) -> Result<Vec<vk::DescriptorSet>> {
    let allocate_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(layouts);

    match unsafe { device.device.allocate_descriptor_sets(&allocate_info) } {
        Ok(sets) => Ok(sets),
        Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
            exhausted!("descriptor pool cannot hold {} more sets", layouts.len())
        }
        Err(err) => Err(err).context("Failed to allocate descriptor sets"),
    }
}

/// Write every `(slot, descriptor)` pair into `set` in one update call.
pub(super) fn write_set(device: &VulkanDevice, set: vk::DescriptorSet, writes: &[(DescriptorSlot, VkDescriptor)]) {
    // Each write points at its descriptor inside `writes`
    let descriptor_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .map(|(slot, info)| {
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(slot.binding)
                .dst_array_element(slot.array_element)
                .descriptor_type(conv::descriptor_type(slot.kind));
            match info {
                VkDescriptor::Buffer(buffer) => write.buffer_info(std::slice::from_ref(buffer)).build(),
                VkDescriptor::Image(image) => write.image_info(std::slice::from_ref(image)).build(),
                VkDescriptor::TexelBuffer(view) => write.texel_buffer_view(std::slice::from_ref(view)).build(),
            }
        })
        .collect();

    unsafe { device.device.update_descriptor_sets(&descriptor_writes, &[]) };
}

/// Anisotropy level for `sampler_type`, if it filters anisotropically at all.
fn max_anisotropy(sampler_type: SamplerType, supported: bool, limit: f32) -> Result<Option<f32>> {
    match sampler_type {
        SamplerType::Anisotropic if !supported => {
            unsupported!(BACKEND, "anisotropic sampling without the samplerAnisotropy feature")
        }
        SamplerType::Anisotropic => Ok(Some(limit.min(16.0))),
        _ => Ok(None),
    }
}

pub(super) fn create_sampler(device: &VulkanDevice, sampler_type: SamplerType) -> Result<vk::Sampler> {
    let anisotropy =
        max_anisotropy(sampler_type, device.anisotropy, device.properties.limits.max_sampler_anisotropy)?;
    let (filter, mipmap_mode, max_lod) = conv::sampler_filtering(sampler_type);

    let create_info = vk::SamplerCreateInfo::builder()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(mipmap_mode)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(anisotropy.is_some())
        .max_anisotropy(anisotropy.unwrap_or(1.0))
        .min_lod(0.0)
        .max_lod(max_lod)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

    unsafe { device.device.create_sampler(&create_info, None) }
        .context("Failed to create sampler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anisotropic_samplers_need_the_device_feature() {
        let err = max_anisotropy(SamplerType::Anisotropic, false, 16.0).unwrap_err();
        assert!(crate::error::classify(&err).is_some_and(|e| e.is_unsupported()));
        assert_eq!(max_anisotropy(SamplerType::Anisotropic, true, 32.0).unwrap(), Some(16.0));
        assert_eq!(max_anisotropy(SamplerType::Anisotropic, true, 8.0).unwrap(), Some(8.0));
        assert_eq!(max_anisotropy(SamplerType::Trilinear, false, 16.0).unwrap(), None);
    }
}
