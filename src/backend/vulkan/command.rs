// Command buffer recording
//
// A finished `Command` list is replayed into a primary command buffer in one
// go. Runs of consecutive barriers are flushed as a single pipeline barrier.

use anyhow::{Context, Result};
use ash::vk;

use super::{conv, Registry};
use crate::command::Command;
use crate::keys::ImageKey;
use crate::resource::{Aspect, ClearValue, Subresource};

fn subresource_range(aspect: Aspect, subresource: Subresource) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: conv::aspect(aspect),
        base_mip_level: subresource.mip,
        level_count: 1,
        base_array_layer: subresource.layer,
        layer_count: 1,
    }
}

fn subresource_layers(aspect: Aspect, subresource: Subresource) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: conv::aspect(aspect),
        mip_level: subresource.mip,
        base_array_layer: subresource.layer,
        layer_count: 1,
    }
}

/// Image barriers waiting to be flushed, with their merged stage masks.
#[derive(Default)]
struct PendingBarriers {
    barriers: Vec<vk::ImageMemoryBarrier>,
    src_stages: vk::PipelineStageFlags,
    dst_stages: vk::PipelineStageFlags,
}

impl PendingBarriers {
    fn flush(&mut self, device: &ash::Device, buffer: vk::CommandBuffer) {
        if self.barriers.is_empty() {
            return;
        }
        unsafe {
            device.cmd_pipeline_barrier(
                buffer,
                self.src_stages,
                self.dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &self.barriers,
            );
        }
        *self = Self::default();
    }
}

/// Record `commands` into `buffer`, which must be in the initial state.
pub(super) fn record(
    device: &ash::Device,
    registry: &Registry,
    buffer: vk::CommandBuffer,
    commands: &[Command],
) -> Result<()> {
    let image = |key: ImageKey| {
        registry
            .images
            .get(key)
            .map(|entry| entry.image)
            .context("command list references a destroyed image")
    };
    let buffer_handle = |key| {
        registry
            .buffers
            .get(key)
            .map(|entry| entry.buffer)
            .context("command list references a destroyed buffer")
    };

    let begin_info = vk::CommandBufferBeginInfo::builder();
    unsafe { device.begin_command_buffer(buffer, &begin_info) }
        .context("Failed to begin command buffer")?;

    let mut pending = PendingBarriers::default();

    for command in commands {
        if !matches!(command, Command::Barrier { .. }) {
            pending.flush(device, buffer);
        }

        match command {
            Command::Barrier { image: key, subresource, aspect, before, after } => {
                let entry = registry.images.get(*key).context("barrier on a destroyed image")?;
                let format = entry.desc.format;
                let (src_stages, src_access) = conv::state_scope(*before);
                let (dst_stages, dst_access) = conv::state_scope(*after);
                pending.barriers.push(
                    vk::ImageMemoryBarrier::builder()
                        .image(entry.image)
                        .old_layout(conv::old_layout(*before, format))
                        .new_layout(conv::layout(*after, format))
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .subresource_range(subresource_range(*aspect, *subresource))
                        .build(),
                );
                pending.src_stages |= src_stages;
                pending.dst_stages |= dst_stages;
            }
            Command::SetViewport(viewport) => {
                let viewport = vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                };
                unsafe { device.cmd_set_viewport(buffer, 0, &[viewport]) };
            }
            Command::SetScissor(rect) => {
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D { x: rect.x, y: rect.y },
                    extent: vk::Extent2D { width: rect.width, height: rect.height },
                };
                unsafe { device.cmd_set_scissor(buffer, 0, &[scissor]) };
            }
            Command::BindPipeline { bind_point, pipeline } => {
                let pipeline = registry.pipelines.get(*pipeline).context("binding a destroyed pipeline")?;
                unsafe { device.cmd_bind_pipeline(buffer, conv::bind_point(*bind_point), *pipeline) };
            }
            Command::BindDescriptorSet { bind_point, layout, index, set } => {
                let layout = registry.pipeline_layouts.get(*layout).context("binding through a destroyed layout")?;
                let set = registry.sets.get(*set).context("binding a released descriptor set")?;
                unsafe {
                    device.cmd_bind_descriptor_sets(buffer, conv::bind_point(*bind_point), *layout, *index, &[*set], &[])
                };
            }
            Command::BindIndexBuffer { buffer: key, offset, index_type } => {
                let index_buffer = buffer_handle(*key)?;
                unsafe { device.cmd_bind_index_buffer(buffer, index_buffer, *offset, conv::index_type(*index_type)) };
            }
            Command::BindVertexBuffers { first_binding, buffers } => {
                let handles = buffers
                    .iter()
                    .map(|(key, _)| buffer_handle(*key))
                    .collect::<Result<Vec<_>>>()?;
                let offsets: Vec<u64> = buffers.iter().map(|(_, offset)| *offset).collect();
                unsafe { device.cmd_bind_vertex_buffers(buffer, *first_binding, &handles, &offsets) };
            }
            Command::Draw { vertex_count, instance_count, first_vertex, first_instance } => unsafe {
                device.cmd_draw(buffer, *vertex_count, *instance_count, *first_vertex, *first_instance)
            },
            Command::DrawIndexed { index_count, instance_count, first_index, vertex_offset, first_instance } => unsafe {
                device.cmd_draw_indexed(
                    buffer,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                )
            },
            Command::Dispatch { x, y, z } => unsafe { device.cmd_dispatch(buffer, *x, *y, *z) },
            Command::BeginRenderPass { render_pass, framebuffer, width, height, attachments } => {
                let render_pass = registry.render_passes.get(*render_pass).context("beginning a destroyed render pass")?;
                let framebuffer = registry.framebuffers.get(*framebuffer).context("beginning a destroyed framebuffer")?;
                let clear_values: Vec<vk::ClearValue> = attachments
                    .iter()
                    .map(|attachment| match &attachment.clear_value {
                        Some(value) => conv::clear_value(attachment.format, value),
                        None => vk::ClearValue::default(),
                    })
                    .collect();
                let begin_info = vk::RenderPassBeginInfo::builder()
                    .render_pass(*render_pass)
                    .framebuffer(*framebuffer)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: vk::Extent2D { width: *width, height: *height },
                    })
                    .clear_values(&clear_values);
                unsafe { device.cmd_begin_render_pass(buffer, &begin_info, vk::SubpassContents::INLINE) };
            }
            Command::NextSubpass => unsafe { device.cmd_next_subpass(buffer, vk::SubpassContents::INLINE) },
            Command::EndRenderPass => unsafe { device.cmd_end_render_pass(buffer) },
            Command::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                let region = vk::BufferCopy { src_offset: *src_offset, dst_offset: *dst_offset, size: *size };
                unsafe { device.cmd_copy_buffer(buffer, buffer_handle(*src)?, buffer_handle(*dst)?, &[region]) };
            }
            Command::CopyBufferToImage {
                buffer: src,
                buffer_offset,
                image: dst,
                format,
                subresource,
                aspect,
                extent,
                state,
            } => {
                let region = vk::BufferImageCopy {
                    buffer_offset: *buffer_offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: subresource_layers(*aspect, *subresource),
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D { width: extent.0, height: extent.1, depth: 1 },
                };
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        buffer,
                        buffer_handle(*src)?,
                        image(*dst)?,
                        conv::layout(*state, *format),
                        &[region],
                    )
                };
            }
            Command::CopyImageToBuffer {
                image: src,
                format,
                subresource,
                aspect,
                extent,
                state,
                buffer: dst,
                buffer_offset,
            } => {
                let region = vk::BufferImageCopy {
                    buffer_offset: *buffer_offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: subresource_layers(*aspect, *subresource),
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D { width: extent.0, height: extent.1, depth: 1 },
                };
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        buffer,
                        image(*src)?,
                        conv::layout(*state, *format),
                        buffer_handle(*dst)?,
                        &[region],
                    )
                };
            }
            Command::ClearImage { image: key, format, aspect, subresources, value } => {
                let target = image(*key)?;
                let ranges: Vec<vk::ImageSubresourceRange> =
                    subresources.iter().map(|s| subresource_range(*aspect, *s)).collect();
                let layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
                match *value {
                    ClearValue::Color(color) => unsafe {
                        device.cmd_clear_color_image(buffer, target, layout, &conv::clear_color(*format, color), &ranges)
                    },
                    ClearValue::DepthStencil { depth, stencil } => {
                        let value = vk::ClearDepthStencilValue { depth, stencil: stencil as u32 };
                        unsafe { device.cmd_clear_depth_stencil_image(buffer, target, layout, &value, &ranges) }
                    }
                }
            }
            Command::FillBuffer { buffer: key, offset, size, value } => unsafe {
                device.cmd_fill_buffer(buffer, buffer_handle(*key)?, *offset, *size, *value)
            },
        }
    }
    pending.flush(device, buffer);

    unsafe { device.end_command_buffer(buffer) }.context("Failed to end command buffer")
}
