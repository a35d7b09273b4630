// Shader module loading
//
// Vulkan consumes SPIR-V words; blobs are checked for length and magic before
// they reach the driver.

use anyhow::{Context, Result};
use ash::vk;

use super::device::VulkanDevice;
use crate::error::violation;
use crate::pipeline::ShaderBinary;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Create a shader module from a SPIR-V blob
pub(super) fn create_shader_module(device: &VulkanDevice, shader: &ShaderBinary) -> Result<vk::ShaderModule> {
    let Some(words) = shader.words() else {
        violation!("SPIR-V blob of {} bytes is not a whole number of words", shader.bytes().len());
    };
    if words.first() != Some(&SPIRV_MAGIC) {
        violation!("shader blob does not start with the SPIR-V magic number");
    }

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}
