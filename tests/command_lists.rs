// Command list lifecycle, mapping rules and submission-time validation

mod common;

use anyhow::Result;
use rhi::{
    Aspect, BufferUsage, ClearValue, CommandListState, Format, ImageUsage, ImageViewType, MemoryPool, ResourceState,
    Subresource,
};

use common::*;

#[test]
fn list_walks_through_its_states() -> Result<()> {
    let device = software_device();
    let storage = device.create_command_list_storage()?;
    let queue = device.create_graphic_command_queue()?;
    let buffer = device.create_buffer(256, MemoryPool::DeviceLocal, BufferUsage::TRANSFER_DST)?;

    let mut list = device.create_command_list(&storage)?;
    assert_eq!(list.state(), CommandListState::Initial);
    assert!(is_violation(&list.fill_buffer(&buffer, 0, 4, 7).unwrap_err()));
    assert!(is_violation(&device.make_command_list_executable(&mut list).unwrap_err()));

    device.start_command_list_recording(&mut list, &storage)?;
    assert_eq!(list.state(), CommandListState::Recording);
    assert!(is_violation(&device.start_command_list_recording(&mut list, &storage).unwrap_err()));
    assert!(is_violation(&device.submit_executable_command_list(&queue, &mut list).unwrap_err()));
    list.fill_buffer(&buffer, 0, 256, 7)?;
    assert_eq!(list.command_count(), 1);

    device.make_command_list_executable(&mut list)?;
    assert_eq!(list.state(), CommandListState::Executable);
    device.submit_executable_command_list(&queue, &mut list)?;
    device.wait_for_command_queue_idle(&queue)?;

    // Completed work makes the list executable again, so it can be resubmitted
    device.submit_executable_command_list(&queue, &mut list)?;
    device.wait_for_command_queue_idle(&queue)?;

    device.reset_command_list(&mut list)?;
    assert_eq!(list.state(), CommandListState::Initial);
    assert_eq!(list.command_count(), 0);

    device.destroy_command_list(list)?;
    device.destroy_command_list_storage(storage)?;
    Ok(())
}

#[test]
fn storage_refuses_more_lists_than_configured() -> Result<()> {
    let mut config = software_config();
    config.limits.max_command_lists_per_storage = 2;
    let device = rhi::Device::new(&config)?;
    let storage = device.create_command_list_storage()?;
    let first = device.create_command_list(&storage)?;
    let second = device.create_command_list(&storage)?;
    assert_eq!(storage.list_count(), 2);
    assert!(is_allocation(&device.create_command_list(&storage).unwrap_err()));

    // Storage cannot go while lists from it are alive
    device.destroy_command_list(first)?;
    assert_eq!(storage.list_count(), 1);
    let third = device.create_command_list(&storage)?;
    device.destroy_command_list(second)?;
    device.destroy_command_list(third)?;
    device.destroy_command_list_storage(storage)?;
    Ok(())
}

#[test]
fn dropped_lists_release_their_storage_slot() -> Result<()> {
    let mut config = software_config();
    config.limits.max_command_lists_per_storage = 1;
    let device = rhi::Device::new(&config)?;
    let storage = device.create_command_list_storage()?;

    let list = device.create_command_list(&storage)?;
    assert!(is_allocation(&device.create_command_list(&storage).unwrap_err()));
    drop(list);
    assert_eq!(storage.list_count(), 0);

    let list = device.create_command_list(&storage)?;
    device.destroy_command_list(list)?;
    assert_eq!(storage.list_count(), 0, "destroy releases the slot exactly once");
    device.destroy_command_list_storage(storage)?;
    Ok(())
}

#[test]
fn storage_reset_invalidates_recorded_lists() -> Result<()> {
    let device = software_device();
    let buffer = device.create_buffer(64, MemoryPool::DeviceLocal, BufferUsage::TRANSFER_DST)?;
    let (storage, queue, mut list) = recording_list(&device);
    list.fill_buffer(&buffer, 0, 64, 1)?;
    device.make_command_list_executable(&mut list)?;

    device.reset_command_list_storage(&storage)?;
    let err = device.submit_executable_command_list(&queue, &mut list).unwrap_err();
    assert!(is_violation(&err));

    // Re-recording after the reset is fine
    device.start_command_list_recording(&mut list, &storage)?;
    list.fill_buffer(&buffer, 0, 64, 2)?;
    submit_and_wait(&device, &queue, &mut list)?;
    Ok(())
}

#[test]
fn mapping_rules() -> Result<()> {
    let device = software_device();
    let gpu_only = device.create_buffer(64, MemoryPool::DeviceLocal, BufferUsage::TRANSFER_DST)?;
    assert!(is_violation(&device.map_buffer(&gpu_only).err().expect("device-local map must fail")));

    let upload = device.create_buffer(64, MemoryPool::HostWritable, BufferUsage::TRANSFER_SRC)?;
    let mut mapped = device.map_buffer(&upload)?;
    assert!(is_violation(&device.map_buffer(&upload).err().expect("second map must fail")));
    mapped.write_at(16, &[0xdead_beef_u32])?;
    assert!(is_violation(&mapped.write_at(62, &[0_u32]).unwrap_err()));
    // An offset whose end wraps around is reported, not a panic
    assert!(is_violation(&mapped.write_at(usize::MAX - 1, &[0_u32]).unwrap_err()));
    device.unmap_buffer(mapped);

    // Host writes survive the unmap
    let mapped = device.map_buffer(&upload)?;
    assert_eq!(mapped.read_as::<u32>()[4], 0xdead_beef);
    Ok(())
}

#[test]
fn mapped_buffers_block_submission() -> Result<()> {
    let device = software_device();
    let readback = readback_buffer(&device, 64);
    let (_storage, queue, mut list) = recording_list(&device);
    list.fill_buffer(&readback, 0, 64, 0x0101_0101)?;
    device.make_command_list_executable(&mut list)?;

    let mapped = device.map_buffer(&readback)?;
    assert!(is_violation(&device.submit_executable_command_list(&queue, &mut list).unwrap_err()));
    device.unmap_buffer(mapped);

    device.submit_executable_command_list(&queue, &mut list)?;
    device.wait_for_command_queue_idle(&queue)?;
    let mapped = device.map_buffer(&readback)?;
    assert!(mapped.iter().all(|&b| b == 1));
    Ok(())
}

#[test]
fn ledger_rejects_a_clear_in_the_wrong_state() -> Result<()> {
    let device = software_device();
    let image = color_target(&device, 16, 16);
    let view = device.create_image_view(&image, FORMAT, 0, 1, 0, 1, ImageViewType::D2, Aspect::Color)?;

    // Nothing in the list moves the image out of Undefined, so recording
    // accepts the clear and the submission-time replay catches it.
    let (storage, queue, mut list) = recording_list(&device);
    list.clear_color(&view, [1.0, 1.0, 1.0, 1.0])?;
    device.make_command_list_executable(&mut list)?;
    assert!(is_violation(&device.submit_executable_command_list(&queue, &mut list).unwrap_err()));
    assert_eq!(list.state(), CommandListState::Executable);

    device.start_command_list_recording(&mut list, &storage)?;
    list.set_pipeline_barrier(
        &image,
        ResourceState::Undefined,
        ResourceState::CopyDest,
        Subresource::new(0, 0),
        Aspect::Color,
    )?;
    list.clear_color(&view, [1.0, 1.0, 1.0, 1.0])?;
    submit_and_wait(&device, &queue, &mut list)?;

    // The ledger now holds CopyDest, so a barrier claiming another state fails
    device.start_command_list_recording(&mut list, &storage)?;
    list.set_pipeline_barrier(
        &image,
        ResourceState::RenderTarget,
        ResourceState::CopySource,
        Subresource::new(0, 0),
        Aspect::Color,
    )?;
    device.make_command_list_executable(&mut list)?;
    assert!(is_violation(&device.submit_executable_command_list(&queue, &mut list).unwrap_err()));
    Ok(())
}

#[test]
fn recording_checks_barriers_and_copies() -> Result<()> {
    let device = software_device();
    let image = color_target(&device, 16, 16);
    let readback = readback_buffer(&device, 16 * 16 * 4);
    let (_storage, _queue, mut list) = recording_list(&device);

    let whole = Subresource::new(0, 0);
    assert!(is_violation(
        &list
            .set_pipeline_barrier(&image, ResourceState::Undefined, ResourceState::Undefined, whole, Aspect::Color)
            .unwrap_err()
    ));
    assert!(is_violation(
        &list
            .set_pipeline_barrier(&image, ResourceState::Undefined, ResourceState::CopyDest, Subresource::new(1, 0), Aspect::Color)
            .unwrap_err()
    ));
    assert!(is_violation(
        &list
            .set_pipeline_barrier(&image, ResourceState::Undefined, ResourceState::CopyDest, whole, Aspect::Depth)
            .unwrap_err()
    ));
    // Without SAMPLED, STORAGE or DEPTH_STENCIL usage these states are unreachable
    assert!(is_violation(
        &list
            .set_pipeline_barrier(&image, ResourceState::Undefined, ResourceState::UnorderedAccess, whole, Aspect::Color)
            .unwrap_err()
    ));

    list.set_pipeline_barrier(&image, ResourceState::Undefined, ResourceState::CopyDest, whole, Aspect::Color)?;
    // The list itself knows the image sits in CopyDest now
    assert!(is_violation(&list.copy_image_subresource_to_buffer(&image, whole, Aspect::Color, &readback, 0).unwrap_err()));
    assert!(is_violation(
        &list
            .set_pipeline_barrier(&image, ResourceState::RenderTarget, ResourceState::CopySource, whole, Aspect::Color)
            .unwrap_err()
    ));
    list.set_pipeline_barrier(&image, ResourceState::CopyDest, ResourceState::CopySource, whole, Aspect::Color)?;
    assert!(is_violation(&list.copy_image_subresource_to_buffer(&image, whole, Aspect::Color, &readback, 2).unwrap_err()));
    list.copy_image_subresource_to_buffer(&image, whole, Aspect::Color, &readback, 0)?;
    Ok(())
}

#[test]
fn depth_read_back_needs_copy_source() -> Result<()> {
    let device = software_device();
    let depth = device.create_image(
        Format::D32Float,
        16,
        16,
        1,
        1,
        ImageUsage::DEPTH_STENCIL | ImageUsage::SAMPLED | ImageUsage::TRANSFER_SRC,
        Some(ClearValue::DepthStencil { depth: 1.0, stencil: 0 }),
    )?;
    let color = color_target(&device, 16, 16);
    let readback = readback_buffer(&device, 16 * 16 * 4);
    let whole = Subresource::new(0, 0);

    // A colour image may be copied out of ReadGeneric, a depth image may not
    let (storage, queue, mut list) = recording_list(&device);
    list.set_pipeline_barrier(&color, ResourceState::Undefined, ResourceState::ReadGeneric, whole, Aspect::Color)?;
    list.copy_image_subresource_to_buffer(&color, whole, Aspect::Color, &readback, 0)?;
    list.set_pipeline_barrier(&depth, ResourceState::Undefined, ResourceState::ReadGeneric, whole, Aspect::Depth)?;
    assert!(is_violation(&list.copy_image_subresource_to_buffer(&depth, whole, Aspect::Depth, &readback, 0).unwrap_err()));
    submit_and_wait(&device, &queue, &mut list)?;

    // Untracked by the list, so only the submission-time replay sees the state
    device.start_command_list_recording(&mut list, &storage)?;
    list.copy_image_subresource_to_buffer(&depth, whole, Aspect::Depth, &readback, 0)?;
    device.make_command_list_executable(&mut list)?;
    assert!(is_violation(&device.submit_executable_command_list(&queue, &mut list).unwrap_err()));

    device.start_command_list_recording(&mut list, &storage)?;
    list.set_pipeline_barrier(&depth, ResourceState::ReadGeneric, ResourceState::CopySource, whole, Aspect::Depth)?;
    list.copy_image_subresource_to_buffer(&depth, whole, Aspect::Depth, &readback, 0)?;
    submit_and_wait(&device, &queue, &mut list)?;
    Ok(())
}
