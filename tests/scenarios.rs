// End-to-end rendering flows on the software backend

mod common;

use anyhow::Result;
use glam::{Mat4, Vec3, Vec4};
use rhi::{
    Aspect, BindingKind, BufferUsage, ClearValue, DescriptorCapacity, DescriptorSetDescription, DrawKind,
    GraphicsPipelineDescription, ImageViewType, LoadOp, MemoryPool, RenderPassDescription, ResourceState, ScissorRect,
    ShaderBinary, ShaderStages, Subresource, Viewport, BUFFER_DESCRIPTOR_ALIGNMENT,
};

use common::*;

#[test]
fn render_pass_clear_reads_back_red() -> Result<()> {
    const SIZE: u32 = 256;
    let device = software_device();
    let image = color_target(&device, SIZE, SIZE);
    let view = device.create_image_view(&image, FORMAT, 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;
    let render_pass = device.create_render_pass(&RenderPassDescription::single_color_pass(
        FORMAT,
        LoadOp::Clear,
        ResourceState::RenderTarget,
    ))?;
    let framebuffer = device.create_framebuffer(&render_pass, &[&view], SIZE, SIZE)?;
    let readback = readback_buffer(&device, (SIZE * SIZE * 4) as u64);

    let (_storage, queue, mut list) = recording_list(&device);
    list.set_pipeline_barrier(
        &image,
        ResourceState::Undefined,
        ResourceState::RenderTarget,
        Subresource::new(0, 0),
        Aspect::Color,
    )?;
    list.begin_renderpass_with_clear_values(&render_pass, &framebuffer, &[ClearValue::Color([1.0, 0.0, 0.0, 1.0])])?;
    list.end_renderpass()?;
    list.set_pipeline_barrier(
        &image,
        ResourceState::RenderTarget,
        ResourceState::ReadGeneric,
        Subresource::new(0, 0),
        Aspect::Color,
    )?;
    list.copy_image_subresource_to_buffer(&image, Subresource::new(0, 0), Aspect::Color, &readback, 0)?;
    submit_and_wait(&device, &queue, &mut list)?;

    let mapped = device.map_buffer(&readback)?;
    assert_eq!(mapped.len(), (SIZE * SIZE * 4) as usize);
    assert!(
        mapped.chunks_exact(4).all(|texel| texel == [255, 0, 0, 255]),
        "every texel should be opaque red"
    );
    device.unmap_buffer(mapped);
    Ok(())
}

#[test]
fn draws_observe_their_own_descriptor_sets() -> Result<()> {
    let device = software_device();
    let image = color_target(&device, 64, 64);
    let view = device.create_image_view(&image, FORMAT, 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;
    let render_pass = device.create_render_pass(&RenderPassDescription::single_color_pass(
        FORMAT,
        LoadOp::Clear,
        ResourceState::RenderTarget,
    ))?;
    let framebuffer = device.create_framebuffer(&render_pass, &[&view], 64, 64)?;

    let set_description =
        DescriptorSetDescription::new(ShaderStages::ALL_GRAPHICS).with(BindingKind::ConstantBuffer, 0, 1);
    let set_layout = device.create_descriptor_set_layout(&set_description)?;
    let pipeline_layout = device.create_pipeline_layout(&[&set_layout])?;
    let pipeline = device.create_graphic_pso(
        &GraphicsPipelineDescription::new(ShaderBinary::from_bytes(vec![1; 4]), ShaderBinary::from_bytes(vec![2; 4])),
        &render_pass,
        &pipeline_layout,
        0,
    )?;

    // Two transforms, one per constant buffer
    let transforms = [
        Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
        Mat4::from_scale(Vec3::splat(4.0)) * Mat4::from_translation(Vec3::new(-5.0, 0.0, 0.0)),
    ];
    let size = std::mem::size_of::<Mat4>() as u64;
    let mut buffers = Vec::new();
    for transform in &transforms {
        let buffer = device.create_buffer(BUFFER_DESCRIPTOR_ALIGNMENT, MemoryPool::HostWritable, BufferUsage::UNIFORM)?;
        let mut mapped = device.map_buffer(&buffer)?;
        mapped.write_at(0, &[*transform])?;
        device.unmap_buffer(mapped);
        buffers.push(buffer);
    }

    let storage = device.create_descriptor_storage(2, &[DescriptorCapacity::new(BindingKind::ConstantBuffer, 2)])?;
    let sets = device.allocate_descriptor_sets(&storage, 0, &[&set_layout, &set_layout])?;
    for (set, buffer) in sets.iter().zip(&buffers) {
        device.set_constant_buffer_view(set, 0, buffer, 0, size)?;
    }

    let (_lists, queue, mut list) = recording_list(&device);
    list.set_pipeline_barrier(
        &image,
        ResourceState::Undefined,
        ResourceState::RenderTarget,
        Subresource::new(0, 0),
        Aspect::Color,
    )?;
    list.begin_renderpass(&render_pass, &framebuffer)?;
    list.set_graphic_pipeline_layout(&pipeline_layout)?;
    list.set_graphic_pipeline(&pipeline)?;
    list.set_viewport(Viewport::full(64, 64))?;
    list.set_scissor(ScissorRect::full(64, 64))?;
    list.bind_graphic_descriptor(0, &sets[0])?;
    list.draw_non_indexed(3, 1, 0, 0)?;
    list.bind_graphic_descriptor(0, &sets[1])?;
    list.draw_non_indexed(6, 2, 0, 0)?;
    list.end_renderpass()?;
    submit_and_wait(&device, &queue, &mut list)?;

    let capture = device.take_draw_capture().expect("software backend captures draws");
    let draws: Vec<_> = capture.draws().collect();
    assert_eq!(draws.len(), 2);
    assert_eq!(
        draws[1].kind,
        DrawKind::Draw { vertex_count: 6, instance_count: 2, first_vertex: 0, first_instance: 0 }
    );
    for (draw, transform) in draws.iter().zip(&transforms) {
        assert_eq!(draw.subpass, Some(0));
        let bytes = draw.set(0).and_then(|set| set.buffer_at(0)).expect("constant buffer captured");
        let seen: Mat4 = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(seen, *transform);
    }
    // The sets alias nothing: each draw sees a different translation column
    let columns: Vec<Vec4> = draws
        .iter()
        .map(|draw| {
            let bytes = draw.set(0).and_then(|set| set.buffer_at(0)).unwrap_or_default();
            bytemuck::pod_read_unaligned::<Mat4>(bytes).w_axis
        })
        .collect();
    assert_ne!(columns[0], columns[1]);
    Ok(())
}

#[test]
fn lists_on_one_queue_run_in_submission_order() -> Result<()> {
    const LISTS: u32 = 16;
    const REGION: u64 = 64;
    let device = software_device();
    let storage = device.create_command_list_storage()?;
    let queue = device.create_graphic_command_queue()?;
    let target = device.create_buffer(
        REGION * LISTS as u64,
        MemoryPool::HostReadable,
        BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
    )?;

    let mut lists = Vec::new();
    for counter in 0..LISTS {
        let mut list = device.create_command_list(&storage)?;
        device.start_command_list_recording(&mut list, &storage)?;
        list.fill_buffer(&target, counter as u64 * REGION, REGION, counter + 1)?;
        // Each list also stamps the shared first word, so only in-order execution leaves the last counter there
        if counter > 0 {
            list.fill_buffer(&target, 0, 4, counter + 1)?;
        }
        device.make_command_list_executable(&mut list)?;
        lists.push(list);
    }
    for list in &mut lists {
        device.submit_executable_command_list(&queue, list)?;
    }
    device.wait_for_command_queue_idle(&queue)?;

    let mapped = device.map_buffer(&target)?;
    let words: Vec<u32> = mapped.read_as();
    device.unmap_buffer(mapped);

    assert_eq!(words[0], LISTS, "the last submitted list writes last");
    for counter in 0..LISTS {
        let start = (counter as u64 * REGION / 4) as usize;
        let region = &words[start + 1..start + (REGION / 4) as usize];
        assert!(region.iter().all(|&w| w == counter + 1), "region {} holds {:?}", counter, region);
    }
    for list in lists {
        device.destroy_command_list(list)?;
    }
    device.destroy_command_list_storage(storage)?;
    Ok(())
}

#[test]
fn upload_then_clear_mip_chain() -> Result<()> {
    let device = software_device();
    let image = device.create_image(
        FORMAT,
        8,
        8,
        2,
        1,
        rhi::ImageUsage::SAMPLED | rhi::ImageUsage::TRANSFER_DST | rhi::ImageUsage::TRANSFER_SRC,
        None,
    )?;
    let upload = device.create_buffer(8 * 8 * 4, MemoryPool::HostWritable, BufferUsage::TRANSFER_SRC)?;
    let mut mapped = device.map_buffer(&upload)?;
    let texels: Vec<u8> = (0..8 * 8 * 4).map(|i| i as u8).collect();
    mapped.write_at(0, &texels)?;
    device.unmap_buffer(mapped);
    let readback = readback_buffer(&device, 8 * 8 * 4 + 4 * 4 * 4);
    let mip1 = device.create_image_view(&image, FORMAT, 1, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;

    let (_storage, queue, mut list) = recording_list(&device);
    list.transition_all_subresources(&image, ResourceState::Undefined, ResourceState::CopyDest)?;
    list.copy_buffer_to_image_subresource(&image, Subresource::new(0, 0), Aspect::Color, &upload, 0)?;
    list.clear_color(&mip1, [0.0, 0.0, 1.0, 1.0])?;
    list.transition_all_subresources(&image, ResourceState::CopyDest, ResourceState::CopySource)?;
    list.copy_image_subresource_to_buffer(&image, Subresource::new(0, 0), Aspect::Color, &readback, 0)?;
    list.copy_image_subresource_to_buffer(&image, Subresource::new(1, 0), Aspect::Color, &readback, 8 * 8 * 4)?;
    submit_and_wait(&device, &queue, &mut list)?;

    let mapped = device.map_buffer(&readback)?;
    assert_eq!(&mapped[..texels.len()], texels.as_slice());
    assert!(mapped[texels.len()..].chunks_exact(4).all(|t| t == [0, 0, 255, 255]));
    device.unmap_buffer(mapped);
    Ok(())
}
