// Render passes, framebuffers and pipeline state objects
//
// Graphics pipelines keep viewport and scissor dynamic; command lists set
// them explicitly before drawing.

use anyhow::{Context, Result};
use ash::vk;

use super::device::VulkanDevice;
use super::{conv, shader, BACKEND};
use crate::error::unsupported;
use crate::pipeline::{ComputePipelineDescription, GraphicsPipelineDescription};
use crate::render_pass::RenderPassDescription;
use crate::resource::ResourceState;

/// Create a render pass from an attachment list and subpass graph
pub(super) fn create_render_pass(device: &VulkanDevice, desc: &RenderPassDescription) -> Result<vk::RenderPass> {
    let attachments: Vec<vk::AttachmentDescription> = desc
        .attachments
        .iter()
        .map(|attachment| {
            vk::AttachmentDescription::builder()
                .format(conv::format(attachment.format))
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(conv::load_op(attachment.load_op))
                .store_op(conv::store_op(attachment.store_op))
                .stencil_load_op(conv::load_op(attachment.stencil_load_op))
                .stencil_store_op(conv::store_op(attachment.stencil_store_op))
                .initial_layout(conv::old_layout(attachment.initial_state, attachment.format))
                .final_layout(conv::layout(attachment.final_state, attachment.format))
                .build()
        })
        .collect();

    let reference = |index: u32, state: ResourceState| {
        let format = desc.attachments[index as usize].format;
        vk::AttachmentReference::builder()
            .attachment(index)
            .layout(conv::layout(state, format))
            .build()
    };

    // References must outlive the subpass descriptions pointing at them
    let references: Vec<(Vec<vk::AttachmentReference>, Vec<vk::AttachmentReference>, Option<vk::AttachmentReference>)> =
        desc.subpasses
            .iter()
            .map(|subpass| {
                let color = subpass.color.iter().map(|&i| reference(i, ResourceState::RenderTarget)).collect();
                let input = subpass
                    .input
                    .iter()
                    .map(|&i| {
                        let layout = conv::input_attachment_layout(desc.attachments[i as usize].format);
                        vk::AttachmentReference::builder().attachment(i).layout(layout).build()
                    })
                    .collect();
                let depth = subpass.depth_stencil.map(|i| reference(i, ResourceState::DepthWrite));
                (color, input, depth)
            })
            .collect();

    let subpasses: Vec<vk::SubpassDescription> = references
        .iter()
        .map(|(color, input, depth)| {
            let mut subpass = vk::SubpassDescription::builder()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(color)
                .input_attachments(input);
            if let Some(depth) = depth {
                subpass = subpass.depth_stencil_attachment(depth);
            }
            subpass.build()
        })
        .collect();

    let dependencies: Vec<vk::SubpassDependency> = desc
        .dependencies
        .iter()
        .map(|dependency| {
            vk::SubpassDependency::builder()
                .src_subpass(conv::subpass_index(dependency.src_subpass))
                .dst_subpass(conv::subpass_index(dependency.dst_subpass))
                .src_stage_mask(conv::pipeline_stages(dependency.src_stages))
                .dst_stage_mask(conv::pipeline_stages(dependency.dst_stages))
                .src_access_mask(conv::access_flags(dependency.src_access))
                .dst_access_mask(conv::access_flags(dependency.dst_access))
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build()
        })
        .collect();

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .context("Failed to create render pass")
}

/// Create a framebuffer binding one view per attachment
pub(super) fn create_framebuffer(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    views: &[vk::ImageView],
    width: u32,
    height: u32,
) -> Result<vk::Framebuffer> {
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(views)
        .width(width)
        .height(height)
        .layers(1);

    unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
        .context("Failed to create framebuffer")
}

/// Create a graphics pipeline for one subpass of `render_pass`
pub(super) fn create_graphics_pipeline(
    device: &VulkanDevice,
    desc: &GraphicsPipelineDescription,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    subpass: u32,
) -> Result<vk::Pipeline> {
    // Attachments are always single-sampled
    if desc.multisample.sample_count != 1 {
        unsupported!(BACKEND, "{}x multisampled pipelines", desc.multisample.sample_count);
    }

    // Shader stages
    let vert_shader = shader::create_shader_module(device, &desc.vertex_shader)?;
    let frag_shader = match shader::create_shader_module(device, &desc.fragment_shader) {
        Ok(module) => module,
        Err(err) => {
            unsafe { device.device.destroy_shader_module(vert_shader, None) };
            return Err(err);
        }
    };

    let entry_point = c"main";

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader)
        .name(entry_point)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader)
        .name(entry_point)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    // Vertex input
    let bindings: Vec<vk::VertexInputBindingDescription> = desc
        .vertex_bindings
        .iter()
        .map(|binding| {
            vk::VertexInputBindingDescription::builder()
                .binding(binding.binding)
                .stride(binding.stride)
                .input_rate(if binding.per_instance {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                })
                .build()
        })
        .collect();
    let attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_attributes
        .iter()
        .map(|attribute| {
            vk::VertexInputAttributeDescription::builder()
                .binding(attribute.binding)
                .location(attribute.location)
                .format(conv::format(attribute.format))
                .offset(attribute.offset)
                .build()
        })
        .collect();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    // Input assembly
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(conv::topology(desc.topology))
        .primitive_restart_enable(false);

    // Viewport and scissor are set by the command list
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Rasterization
    let raster = &desc.rasterizer;
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(conv::polygon_mode(raster.fill))
        .line_width(1.0)
        .cull_mode(conv::cull_mode(raster.cull))
        .front_face(conv::front_face(raster.front_face))
        .depth_bias_enable(raster.has_depth_bias())
        .depth_bias_constant_factor(raster.depth_bias_constant)
        .depth_bias_slope_factor(raster.depth_bias_slope)
        .depth_bias_clamp(raster.depth_bias_clamp);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .alpha_to_coverage_enable(desc.multisample.alpha_to_coverage);

    // Depth testing
    let ds = &desc.depth_stencil;
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(ds.depth_test)
        .depth_write_enable(ds.depth_write)
        .depth_compare_op(conv::compare_op(ds.compare_op))
        .depth_bounds_test_enable(false)
        .stencil_test_enable(ds.stencil_test)
        .front(conv::stencil_state(&ds.front))
        .back(conv::stencil_state(&ds.back));

    // Color blending
    let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .color_blend
        .iter()
        .map(|blend| {
            vk::PipelineColorBlendAttachmentState::builder()
                .blend_enable(blend.enable)
                .src_color_blend_factor(conv::blend_factor(blend.src_color))
                .dst_color_blend_factor(conv::blend_factor(blend.dst_color))
                .color_blend_op(conv::blend_op(blend.color_op))
                .src_alpha_blend_factor(conv::blend_factor(blend.src_alpha))
                .dst_alpha_blend_factor(conv::blend_factor(blend.dst_alpha))
                .alpha_blend_op(conv::blend_op(blend.alpha_op))
                .color_write_mask(conv::color_write_mask(blend.write_mask))
                .build()
        })
        .collect();
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    // Create pipeline
    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(subpass)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    // Modules are only needed while the pipeline is compiled
    unsafe {
        device.device.destroy_shader_module(vert_shader, None);
        device.device.destroy_shader_module(frag_shader, None);
    }

    let pipelines = pipelines
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?;
    pipelines.into_iter().next().context("Driver returned no graphics pipeline")
}

/// Create a compute pipeline
pub(super) fn create_compute_pipeline(
    device: &VulkanDevice,
    desc: &ComputePipelineDescription,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    let module = shader::create_shader_module(device, &desc.shader)?;

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
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
    };
    unsafe { device.device.destroy_shader_module(module, None) };

    let pipelines = pipelines
        .map_err(|(_, e)| e)
        .context("Failed to create compute pipeline")?;
    pipelines.into_iter().next().context("Driver returned no compute pipeline")
}
