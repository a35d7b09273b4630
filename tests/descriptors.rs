// Descriptor storage accounting, writes and binding rules

mod common;

use anyhow::Result;
use rhi::{
    BindingKind, BufferUsage, ComputePipelineDescription, DescriptorCapacity, DescriptorSetDescription,
    DescriptorValue, DrawKind, MemoryPool, SamplerType, ShaderBinary, ShaderStages, BUFFER_DESCRIPTOR_ALIGNMENT,
};

use common::*;

fn storage_buffer_set() -> DescriptorSetDescription {
    DescriptorSetDescription::new(ShaderStages::COMPUTE).with(BindingKind::StorageBuffer, 0, 1)
}

#[test]
fn storage_runs_out_of_sets_and_descriptors() -> Result<()> {
    let device = software_device();
    let layout = device.create_descriptor_set_layout(
        &DescriptorSetDescription::new(ShaderStages::FRAGMENT)
            .with(BindingKind::SampledImage, 0, 2)
            .with(BindingKind::Sampler, 2, 1),
    )?;
    let storage = device.create_descriptor_storage(
        3,
        &[DescriptorCapacity::new(BindingKind::SampledImage, 4), DescriptorCapacity::new(BindingKind::Sampler, 3)],
    )?;

    let first = device.allocate_descriptor_set(&storage, 0, &layout)?;
    assert_eq!(first.slot_count(), 3);
    assert_eq!(storage.next_free_index(), 3);
    let second = device.allocate_descriptor_set(&storage, storage.next_free_index(), &layout)?;
    assert_eq!(second.starting_index(), 3);
    assert_eq!(storage.remaining(BindingKind::SampledImage), 0);

    // Sampled images are used up even though one more set would fit
    let err = device.allocate_descriptor_set(&storage, storage.next_free_index(), &layout).unwrap_err();
    assert!(is_allocation(&err));
    assert_eq!(storage.allocated_sets(), 2);
    Ok(())
}

#[test]
fn batch_allocation_is_all_or_nothing() -> Result<()> {
    let device = software_device();
    let layout = device.create_descriptor_set_layout(&storage_buffer_set())?;
    let storage = device.create_descriptor_storage(2, &[DescriptorCapacity::new(BindingKind::StorageBuffer, 8)])?;

    let err = device.allocate_descriptor_sets(&storage, 0, &[&layout, &layout, &layout]).unwrap_err();
    assert!(is_allocation(&err));
    assert_eq!(storage.allocated_sets(), 0);

    let sets = device.allocate_descriptor_sets(&storage, 0, &[&layout, &layout])?;
    assert_eq!(sets.iter().map(|s| s.starting_index()).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(storage.remaining(BindingKind::StorageBuffer), 6);
    Ok(())
}

#[test]
fn overlapping_ranges_are_rejected() -> Result<()> {
    let device = software_device();
    let layout = device.create_descriptor_set_layout(&storage_buffer_set())?;
    let storage = device.create_descriptor_storage(8, &[DescriptorCapacity::new(BindingKind::StorageBuffer, 4)])?;

    device.allocate_descriptor_sets(&storage, 0, &[&layout, &layout])?;
    assert!(is_violation(&device.allocate_descriptor_set(&storage, 1, &layout).unwrap_err()));
    assert!(is_violation(&device.allocate_descriptor_set(&storage, 4, &layout).unwrap_err()), "past the end");

    // A gap is fine as long as nothing overlaps
    let late = device.allocate_descriptor_set(&storage, 3, &layout)?;
    assert_eq!(late.starting_index(), 3);
    assert_eq!(storage.next_free_index(), 4);
    assert_eq!(storage.allocated_sets(), 3);
    Ok(())
}

#[test]
fn writes_are_checked_against_the_layout() -> Result<()> {
    let device = software_device();
    let layout = device.create_descriptor_set_layout(
        &DescriptorSetDescription::new(ShaderStages::ALL)
            .with(BindingKind::ConstantBuffer, 0, 1)
            .with(BindingKind::Sampler, 1, 1),
    )?;
    let storage = device.create_descriptor_storage(
        1,
        &[DescriptorCapacity::new(BindingKind::ConstantBuffer, 1), DescriptorCapacity::new(BindingKind::Sampler, 1)],
    )?;
    let set = device.allocate_descriptor_set(&storage, 0, &layout)?;
    let uniform = device.create_buffer(2 * BUFFER_DESCRIPTOR_ALIGNMENT, MemoryPool::HostWritable, BufferUsage::UNIFORM)?;
    let vertex = device.create_buffer(256, MemoryPool::DeviceLocal, BufferUsage::VERTEX)?;
    let sampler = device.create_sampler(SamplerType::Trilinear)?;

    // Wrong kind for the slot, unknown slot, missing usage, misaligned offset, overrun
    assert!(is_violation(&device.set_sampler(&set, 0, &sampler).unwrap_err()));
    assert!(is_violation(&device.set_sampler(&set, 2, &sampler).unwrap_err()));
    assert!(is_violation(&device.set_constant_buffer_view(&set, 0, &vertex, 0, 64).unwrap_err()));
    assert!(is_violation(&device.set_constant_buffer_view(&set, 0, &uniform, 16, 64).unwrap_err()));
    assert!(is_violation(
        &device.set_constant_buffer_view(&set, 0, &uniform, BUFFER_DESCRIPTOR_ALIGNMENT, 512).unwrap_err()
    ));
    assert_eq!(set.unpopulated_slots(), vec![0, 1]);

    device.update_descriptor_set(
        &set,
        &[
            (0, DescriptorValue::ConstantBuffer { buffer: &uniform, offset: BUFFER_DESCRIPTOR_ALIGNMENT, size: 64 }),
            (1, DescriptorValue::Sampler(&sampler)),
        ],
    )?;
    assert!(set.is_fully_populated());
    Ok(())
}

#[test]
fn binds_need_a_matching_fully_written_set() -> Result<()> {
    let device = software_device();
    let layout = device.create_descriptor_set_layout(&storage_buffer_set())?;
    let other = device.create_descriptor_set_layout(
        &DescriptorSetDescription::new(ShaderStages::COMPUTE).with(BindingKind::ConstantBuffer, 0, 1),
    )?;
    let pipeline_layout = device.create_pipeline_layout(&[&layout])?;
    let storage = device.create_descriptor_storage(
        2,
        &[DescriptorCapacity::new(BindingKind::StorageBuffer, 1), DescriptorCapacity::new(BindingKind::ConstantBuffer, 1)],
    )?;
    let empty = device.allocate_descriptor_set(&storage, 0, &layout)?;
    let mismatched = device.allocate_descriptor_set(&storage, 1, &other)?;

    let (_lists, _queue, mut list) = recording_list(&device);
    assert!(is_violation(&list.bind_compute_descriptor(0, &empty).unwrap_err()), "no layout yet");
    list.set_compute_pipeline_layout(&pipeline_layout)?;
    assert!(is_violation(&list.bind_compute_descriptor(0, &empty).unwrap_err()), "unpopulated slot");
    assert!(is_violation(&list.bind_compute_descriptor(0, &mismatched).unwrap_err()), "shape mismatch");
    assert!(is_violation(&list.bind_compute_descriptor(1, &empty).unwrap_err()), "index past the layout");
    Ok(())
}

#[test]
fn dispatch_captures_storage_buffers_and_reset_kills_sets() -> Result<()> {
    let device = software_device();
    let layout = device.create_descriptor_set_layout(&storage_buffer_set())?;
    let pipeline_layout = device.create_pipeline_layout(&[&layout])?;
    let pipeline = device.create_compute_pso(
        &ComputePipelineDescription::new(ShaderBinary::from_words(&[0x0723_0203, 0, 0, 0, 0])),
        &pipeline_layout,
    )?;
    let data = device.create_buffer(
        BUFFER_DESCRIPTOR_ALIGNMENT,
        MemoryPool::HostWritable,
        BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
    )?;
    let mut mapped = device.map_buffer(&data)?;
    mapped.write_at(0, &[1.5_f32, 2.5, 3.5, 4.5])?;
    device.unmap_buffer(mapped);

    let mut storage = device.create_descriptor_storage(1, &[DescriptorCapacity::new(BindingKind::StorageBuffer, 1)])?;
    let (lists, queue, mut list) = recording_list(&device);
    {
        let set = device.allocate_descriptor_set(&storage, 0, &layout)?;
        device.set_uav_buffer_view(&set, 0, &data, 0, 16)?;

        list.set_compute_pipeline_layout(&pipeline_layout)?;
        assert!(is_violation(&list.dispatch(1, 1, 1).unwrap_err()), "no pipeline bound");
        list.set_compute_pipeline(&pipeline)?;
        assert!(is_violation(&list.dispatch(1, 1, 1).unwrap_err()), "set 0 not bound");
        list.bind_compute_descriptor(0, &set)?;
        assert!(is_violation(&list.dispatch(0, 1, 1).unwrap_err()));
        list.dispatch(4, 2, 1)?;
        submit_and_wait(&device, &queue, &mut list)?;
    }

    let capture = device.take_draw_capture().expect("software backend captures dispatches");
    let dispatch = capture.dispatches().next().expect("one dispatch");
    assert_eq!(dispatch.kind, DrawKind::Dispatch { x: 4, y: 2, z: 1 });
    assert_eq!(dispatch.subpass, None);
    let bytes = dispatch.set(0).and_then(|s| s.buffer_at(0)).expect("storage buffer captured");
    assert_eq!(bytemuck::cast_slice::<u8, f32>(bytes), &[1.5, 2.5, 3.5, 4.5]);
    assert!(device.take_draw_capture().is_some_and(|c| c.is_empty()));

    // The list still binds the set, which the reset releases
    device.reset_descriptor_storage(&mut storage)?;
    assert_eq!(storage.allocated_sets(), 0);
    assert!(is_violation(&device.submit_executable_command_list(&queue, &mut list).unwrap_err()));

    device.start_command_list_recording(&mut list, &lists)?;
    list.fill_buffer(&data, 0, 16, 0)?;
    submit_and_wait(&device, &queue, &mut list)?;
    Ok(())
}
