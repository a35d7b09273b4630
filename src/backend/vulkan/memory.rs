// Buffer and image memory
//
// Every resource gets its own vkAllocateMemory block, bound at offset 0.
// Host-visible pools are coherent so a mapping never needs explicit flushes.

use anyhow::{Context, Result};
use ash::vk;

use super::device::VulkanDevice;
use super::{conv, BACKEND};
use crate::error::{exhausted, unsupported};
use crate::resource::{BufferDesc, ImageDesc, ImageUsage, MemoryPool};

/// Memory property flags wanted for `pool`, best first.
fn pool_properties(pool: MemoryPool) -> &'static [vk::MemoryPropertyFlags] {
    const DEVICE_LOCAL: &[vk::MemoryPropertyFlags] = &[vk::MemoryPropertyFlags::DEVICE_LOCAL];
    const UPLOAD: &[vk::MemoryPropertyFlags] = &[vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    )];
    const READBACK: &[vk::MemoryPropertyFlags] = &[
        vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
                | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw()
                | vk::MemoryPropertyFlags::HOST_CACHED.as_raw(),
        ),
        vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
        ),
    ];
    match pool {
        MemoryPool::DeviceLocal => DEVICE_LOCAL,
        MemoryPool::HostWritable => UPLOAD,
        MemoryPool::HostReadable => READBACK,
    }
}

/// Find a suitable memory type index
fn find_memory_type(
    device: &VulkanDevice,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let mem_properties = &device.memory_properties;

    (0..mem_properties.memory_type_count).find(|&i| {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = mem_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);
        has_type && has_properties
    })
}

fn allocate(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    pool: MemoryPool,
) -> Result<vk::DeviceMemory> {
    let Some(memory_type_index) = pool_properties(pool)
        .iter()
        .find_map(|&properties| find_memory_type(device, requirements.memory_type_bits, properties))
    else {
        unsupported!(BACKEND, "no memory type for the {:?} pool", pool);
    };

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    match unsafe { device.device.allocate_memory(&alloc_info, None) } {
        Ok(memory) => Ok(memory),
        Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
            exhausted!("{} bytes of {:?} memory", requirements.size, pool)
        }
        Err(err) => Err(err).context("Failed to allocate memory"),
    }
}

/// Helper to create a GPU buffer with its own memory block
pub(super) fn create_buffer(device: &VulkanDevice, desc: &BufferDesc) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    // Create buffer
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(desc.size)
        .usage(conv::buffer_usage(desc.usage))
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .context("Failed to create buffer")?;

    // Get memory requirements
    let mem_requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    // Allocate memory and bind it to the buffer
    let bound = allocate(device, mem_requirements, desc.memory_pool).and_then(|memory| {
        match unsafe { device.device.bind_buffer_memory(buffer, memory, 0) } {
            Ok(()) => Ok(memory),
            Err(err) => {
                unsafe { device.device.free_memory(memory, None) };
                Err(err).context("Failed to bind buffer memory")
            }
        }
    });

    match bound {
        Ok(memory) => Ok((buffer, memory)),
        Err(err) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            Err(err)
        }
    }
}

/// Create an optimally tiled image in device-local memory
pub(super) fn create_image(device: &VulkanDevice, desc: &ImageDesc) -> Result<(vk::Image, vk::DeviceMemory)> {
    let format = conv::format(desc.format);
    let usage = conv::image_usage(desc.usage);
    let flags = if desc.usage.contains(ImageUsage::CUBE_COMPATIBLE) {
        vk::ImageCreateFlags::CUBE_COMPATIBLE
    } else {
        vk::ImageCreateFlags::empty()
    };

    // Reject format/usage pairs the GPU cannot do before creating anything
    let supported = unsafe {
        device.instance.get_physical_device_image_format_properties(
            device.physical_device,
            format,
            vk::ImageType::TYPE_2D,
            vk::ImageTiling::OPTIMAL,
            usage,
            flags,
        )
    };
    match supported {
        Ok(limits) => {
            if desc.width > limits.max_extent.width
                || desc.height > limits.max_extent.height
                || desc.mip_count > limits.max_mip_levels
                || desc.layer_count > limits.max_array_layers
            {
                unsupported!(
                    BACKEND,
                    "{}x{} {:?} with {} mips and {} layers",
                    desc.width,
                    desc.height,
                    desc.format,
                    desc.mip_count,
                    desc.layer_count
                );
            }
        }
        Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => {
            unsupported!(BACKEND, "{:?} images with usage {:?}", desc.format, desc.usage)
        }
        Err(err) => return Err(err).context("Failed to query image format support"),
    }

    let image_info = vk::ImageCreateInfo::builder()
        .flags(flags)
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
        .mip_levels(desc.mip_count)
        .array_layers(desc.layer_count)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { device.device.create_image(&image_info, None) }
        .context("Failed to create image")?;

    let mem_requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let bound = allocate(device, mem_requirements, MemoryPool::DeviceLocal).and_then(|memory| {
        match unsafe { device.device.bind_image_memory(image, memory, 0) } {
            Ok(()) => Ok(memory),
            Err(err) => {
                unsafe { device.device.free_memory(memory, None) };
                Err(err).context("Failed to bind image memory")
            }
        }
    });

    match bound {
        Ok(memory) => Ok((image, memory)),
        Err(err) => {
            unsafe { device.device.destroy_image(image, None) };
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_pools_are_coherent() {
        for pool in [MemoryPool::HostWritable, MemoryPool::HostReadable] {
            for flags in pool_properties(pool) {
                assert!(flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT));
            }
        }
        assert_eq!(pool_properties(MemoryPool::DeviceLocal), &[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
    }
}
