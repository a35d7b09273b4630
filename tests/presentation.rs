// Headless swapchain frames

mod common;

use anyhow::Result;
use rhi::{Aspect, Device, ImageViewType, ResourceState, SubmitSync, SurfaceTarget};

use common::*;

#[test]
fn frames_cycle_through_the_back_buffers() -> Result<()> {
    let mut config = software_config();
    config.swapchain.image_count = 3;
    let (device, swapchain, queue) = Device::create_device_swapchain_and_graphic_presentable_queue(
        &config,
        SurfaceTarget::Headless { format: FORMAT },
        64,
        48,
    )?;
    assert!(queue.is_presentable());
    assert_eq!(swapchain.image_count(), 3);
    assert_eq!(swapchain.extent(), (64, 48));
    assert_eq!(swapchain.format(), FORMAT);

    let storage = device.create_command_list_storage()?;
    let mut list = device.create_command_list(&storage)?;
    let fence = device.create_fence(false)?;
    let readback = readback_buffer(&device, 64 * 48 * 4);

    let mut seen = Vec::new();
    for frame in 0..4u8 {
        let index = device.get_next_backbuffer_id(&swapchain)?;
        seen.push(index);
        let image = swapchain.image(index).expect("acquired index is in range");
        let view = device.create_image_view(image, FORMAT, 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;

        device.start_command_list_recording(&mut list, &storage)?;
        list.transition_all_subresources(image, ResourceState::Present, ResourceState::CopyDest)?;
        list.clear_color(&view, [f32::from(frame) / 4.0, 0.0, 1.0, 1.0])?;
        list.transition_all_subresources(image, ResourceState::CopyDest, ResourceState::CopySource)?;
        list.copy_image_subresource_to_buffer(image, rhi::Subresource::new(0, 0), Aspect::Color, &readback, 0)?;
        list.transition_all_subresources(image, ResourceState::CopySource, ResourceState::Present)?;
        device.make_command_list_executable(&mut list)?;
        device.submit_executable_command_list_with(
            &queue,
            &mut list,
            SubmitSync {
                wait: &[swapchain.image_available()],
                signal: &[swapchain.render_finished()],
                fence: Some(&fence),
            },
        )?;
        device.present(&queue, &swapchain, index)?;

        assert!(device.wait_for_fence(&fence, std::time::Duration::from_secs(5))?);
        device.reset_fence(&fence)?;
        let mapped = device.map_buffer(&readback)?;
        let expected = [(f32::from(frame) / 4.0 * 255.0).round() as u8, 0, 255, 255];
        assert!(mapped.chunks_exact(4).all(|t| t == expected), "frame {} colour", frame);
        device.unmap_buffer(mapped);
    }
    assert_eq!(seen, vec![0, 1, 2, 0]);

    device.destroy_fence(fence);
    device.destroy_command_list(list)?;
    device.destroy_command_list_storage(storage)?;
    device.destroy_swapchain(swapchain)?;
    Ok(())
}

#[test]
fn presentation_rules() -> Result<()> {
    let (device, swapchain, queue) = Device::create_device_swapchain_and_graphic_presentable_queue(
        &software_config(),
        SurfaceTarget::Headless { format: FORMAT },
        16,
        16,
    )?;
    let other_queue = device.create_graphic_command_queue()?;
    assert!(!other_queue.is_presentable());

    // Two back buffers: a third acquire without presenting hits one still held
    let first = device.get_next_backbuffer_id(&swapchain)?;
    let second = device.get_next_backbuffer_id(&swapchain)?;
    assert_ne!(first, second);
    assert!(is_violation(&device.get_next_backbuffer_id(&swapchain).unwrap_err()));

    assert!(is_violation(&device.present(&other_queue, &swapchain, first).unwrap_err()));
    assert!(is_violation(&device.present(&queue, &swapchain, 7).unwrap_err()));
    device.present(&queue, &swapchain, first)?;
    assert!(is_violation(&device.present(&queue, &swapchain, first).unwrap_err()), "not acquired");

    // A back buffer left outside Present cannot be handed to the screen
    let image = swapchain.image(second).expect("in range");
    let (storage, _, mut list) = recording_list(&device);
    list.transition_all_subresources(image, ResourceState::Present, ResourceState::CopyDest)?;
    submit_and_wait(&device, &queue, &mut list)?;
    assert!(is_violation(&device.present(&queue, &swapchain, second).unwrap_err()));

    device.start_command_list_recording(&mut list, &storage)?;
    list.transition_all_subresources(image, ResourceState::CopyDest, ResourceState::Present)?;
    submit_and_wait(&device, &queue, &mut list)?;
    device.present(&queue, &swapchain, second)?;

    device.destroy_command_list(list)?;
    device.destroy_command_list_storage(storage)?;
    device.destroy_swapchain(swapchain)?;
    Ok(())
}

#[test]
fn headless_swapchain_rejects_depth_formats() {
    let result = Device::create_device_swapchain_and_graphic_presentable_queue(
        &software_config(),
        SurfaceTarget::Headless { format: rhi::Format::D32Float },
        16,
        16,
    );
    let err = result.err().expect("depth back buffers are unsupported");
    assert!(rhi::classify(&err).is_some_and(|e| e.is_unsupported()));
}
