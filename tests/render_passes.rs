// Multi-subpass render passes and input attachments

mod common;

use anyhow::Result;
use rhi::{
    Aspect, AttachmentDescription, BindingKind, ClearValue, DescriptorCapacity, DescriptorSetDescription,
    GraphicsPipelineDescription, ImageUsage, ImageViewType, RenderPassDescription, ResourceState, ScissorRect,
    ShaderBinary, ShaderStages, Subresource, SubpassDependency, SubpassDescription, Viewport,
};

use common::*;

const SIZE: u32 = 32;

fn two_subpass_description() -> RenderPassDescription {
    RenderPassDescription::new()
        .attachment(AttachmentDescription::color(FORMAT))
        .attachment(AttachmentDescription::color(FORMAT).with_states(ResourceState::Undefined, ResourceState::CopySource))
        .subpass(SubpassDescription::new().color(0))
        .subpass(SubpassDescription::new().input(0).color(1))
}

fn shaders() -> GraphicsPipelineDescription {
    GraphicsPipelineDescription::new(ShaderBinary::from_bytes(vec![1; 4]), ShaderBinary::from_bytes(vec![2; 4]))
}

#[test]
fn input_reads_need_an_ordering_dependency() {
    let device = software_device();

    let missing = two_subpass_description();
    assert!(is_violation(&device.create_render_pass(&missing).unwrap_err()));

    // Subpass 0 cannot read what only subpass 1 writes
    let reversed = RenderPassDescription::new()
        .attachment(AttachmentDescription::color(FORMAT))
        .attachment(AttachmentDescription::color(FORMAT))
        .subpass(SubpassDescription::new().input(1).color(0))
        .subpass(SubpassDescription::new().color(1))
        .dependency(SubpassDependency::color_to_input(1, 0));
    assert!(is_violation(&device.create_render_pass(&reversed).unwrap_err()));

    let feedback = RenderPassDescription::new()
        .attachment(AttachmentDescription::color(FORMAT))
        .subpass(SubpassDescription::new().color(0).input(0));
    assert!(is_violation(&device.create_render_pass(&feedback).unwrap_err()));

    let out_of_range = RenderPassDescription::new()
        .attachment(AttachmentDescription::color(FORMAT))
        .subpass(SubpassDescription::new().color(1));
    assert!(is_violation(&device.create_render_pass(&out_of_range).unwrap_err()));

    let ordered = two_subpass_description().dependency(SubpassDependency::color_to_input(0, 1));
    assert!(device.create_render_pass(&ordered).is_ok());
}

#[test]
fn framebuffer_checks_input_attachment_usage() -> Result<()> {
    let device = software_device();
    let render_pass =
        device.create_render_pass(&two_subpass_description().dependency(SubpassDependency::color_to_input(0, 1)))?;
    let plain = color_target(&device, SIZE, SIZE);
    let target = color_target(&device, SIZE, SIZE);
    let plain_view = device.create_image_view(&plain, FORMAT, 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;
    let target_view = device.create_image_view(&target, FORMAT, 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;

    let err = device.create_framebuffer(&render_pass, &[&plain_view, &target_view], SIZE, SIZE).unwrap_err();
    assert!(is_violation(&err));
    let err = device.create_framebuffer(&render_pass, &[&target_view], SIZE, SIZE).unwrap_err();
    assert!(is_violation(&err));
    Ok(())
}

#[test]
fn second_subpass_reads_the_first_one() -> Result<()> {
    let device = software_device();
    let render_pass =
        device.create_render_pass(&two_subpass_description().dependency(SubpassDependency::color_to_input(0, 1)))?;
    assert_eq!(render_pass.subpass_count(), 2);

    let gbuffer = device.create_image(
        FORMAT,
        SIZE,
        SIZE,
        1,
        1,
        ImageUsage::RENDER_TARGET | ImageUsage::INPUT_ATTACHMENT,
        None,
    )?;
    let target = color_target(&device, SIZE, SIZE);
    let gbuffer_view = device.create_image_view(&gbuffer, FORMAT, 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;
    let target_view = device.create_image_view(&target, FORMAT, 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;
    let framebuffer = device.create_framebuffer(&render_pass, &[&gbuffer_view, &target_view], SIZE, SIZE)?;

    let empty_layout = device.create_pipeline_layout(&[])?;
    let geometry = device.create_graphic_pso(&shaders(), &render_pass, &empty_layout, 0)?;

    let input_set =
        DescriptorSetDescription::new(ShaderStages::FRAGMENT).with(BindingKind::InputAttachment, 0, 1);
    let input_layout = device.create_descriptor_set_layout(&input_set)?;
    let lighting_layout = device.create_pipeline_layout(&[&input_layout])?;
    let lighting = device.create_graphic_pso(&shaders(), &render_pass, &lighting_layout, 1)?;

    let storage = device.create_descriptor_storage(1, &[DescriptorCapacity::new(BindingKind::InputAttachment, 1)])?;
    let set = device.allocate_descriptor_set(&storage, 0, &input_layout)?;
    device.set_input_attachment(&set, 0, &gbuffer_view)?;

    let readback = readback_buffer(&device, (SIZE * SIZE * 4) as u64);
    let (_lists, queue, mut list) = recording_list(&device);
    list.begin_renderpass_with_clear_values(
        &render_pass,
        &framebuffer,
        &[ClearValue::Color([0.0, 0.0, 0.0, 0.0]), ClearValue::Color([0.0, 1.0, 0.0, 1.0])],
    )?;
    list.set_viewport(Viewport::full(SIZE, SIZE))?;
    list.set_scissor(ScissorRect::full(SIZE, SIZE))?;
    list.set_graphic_pipeline_layout(&empty_layout)?;
    list.set_graphic_pipeline(&geometry)?;
    list.draw_non_indexed(3, 1, 0, 0)?;
    assert!(is_violation(&list.end_renderpass().unwrap_err()), "subpass 1 still pending");

    list.next_subpass()?;
    assert!(is_violation(&list.draw_non_indexed(3, 1, 0, 0).unwrap_err()), "pipeline targets subpass 0");
    list.set_graphic_pipeline_layout(&lighting_layout)?;
    list.set_graphic_pipeline(&lighting)?;
    list.bind_graphic_descriptor(0, &set)?;
    list.draw_non_indexed(3, 1, 0, 0)?;
    assert!(is_violation(&list.next_subpass().unwrap_err()));
    list.end_renderpass()?;
    list.copy_image_subresource_to_buffer(&target, Subresource::new(0, 0), Aspect::Color, &readback, 0)?;
    submit_and_wait(&device, &queue, &mut list)?;

    let capture = device.take_draw_capture().expect("draws captured");
    let subpasses: Vec<_> = capture.draws().map(|d| d.subpass).collect();
    assert_eq!(subpasses, vec![Some(0), Some(1)]);

    let mapped = device.map_buffer(&readback)?;
    assert!(mapped.chunks_exact(4).all(|t| t == [0, 255, 0, 255]));
    device.unmap_buffer(mapped);
    Ok(())
}

#[test]
fn load_clear_stays_inside_the_render_area() -> Result<()> {
    let device = software_device();
    let render_pass = device.create_render_pass(
        &RenderPassDescription::new()
            .attachment(
                AttachmentDescription::color(FORMAT).with_states(ResourceState::RenderTarget, ResourceState::CopySource),
            )
            .subpass(SubpassDescription::new().color(0)),
    )?;
    let target = color_target(&device, 2 * SIZE, 2 * SIZE);
    let view = device.create_image_view(&target, FORMAT, 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;
    // The framebuffer covers only the top-left quarter of the view
    let framebuffer = device.create_framebuffer(&render_pass, &[&view], SIZE, SIZE)?;

    let readback = readback_buffer(&device, u64::from(4 * SIZE * SIZE * 4));
    let (_lists, queue, mut list) = recording_list(&device);
    list.transition_all_subresources(&target, ResourceState::Undefined, ResourceState::CopyDest)?;
    list.clear_color(&view, [0.0, 0.0, 1.0, 1.0])?;
    list.transition_all_subresources(&target, ResourceState::CopyDest, ResourceState::RenderTarget)?;
    list.begin_renderpass_with_clear_values(&render_pass, &framebuffer, &[ClearValue::Color([1.0, 0.0, 0.0, 1.0])])?;
    list.end_renderpass()?;
    list.copy_image_subresource_to_buffer(&target, Subresource::new(0, 0), Aspect::Color, &readback, 0)?;
    submit_and_wait(&device, &queue, &mut list)?;

    let mapped = device.map_buffer(&readback)?;
    let texels: Vec<&[u8]> = mapped.chunks_exact(4).collect();
    let at = |x: u32, y: u32| texels[(y * 2 * SIZE + x) as usize];
    assert_eq!(at(0, 0), [255, 0, 0, 255]);
    assert_eq!(at(SIZE - 1, SIZE - 1), [255, 0, 0, 255]);
    assert_eq!(at(SIZE, 0), [0, 0, 255, 255]);
    assert_eq!(at(2 * SIZE - 1, 2 * SIZE - 1), [0, 0, 255, 255]);
    device.unmap_buffer(mapped);
    Ok(())
}
