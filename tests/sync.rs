// Fences and semaphores

mod common;

use std::time::Duration;

use anyhow::Result;
use rhi::{BufferUsage, CommandListState, MemoryPool, SubmitSync};

use common::*;

#[test]
fn fence_follows_its_submission() -> Result<()> {
    let device = software_device();
    let signaled = device.create_fence(true)?;
    assert!(device.is_fence_signaled(&signaled)?);
    assert!(device.wait_for_fence(&signaled, Duration::ZERO)?);
    device.reset_fence(&signaled)?;
    assert!(!device.is_fence_signaled(&signaled)?);
    assert!(!device.wait_for_fence(&signaled, Duration::from_millis(10))?, "nothing will signal it");

    let buffer = device.create_buffer(1024, MemoryPool::DeviceLocal, BufferUsage::TRANSFER_DST)?;
    let (_storage, queue, mut list) = recording_list(&device);
    list.fill_buffer(&buffer, 0, 1024, 0xffff_ffff)?;
    device.make_command_list_executable(&mut list)?;
    device.submit_executable_command_list_with(&queue, &mut list, SubmitSync { fence: Some(&signaled), ..Default::default() })?;
    assert!(device.wait_for_fence(&signaled, Duration::from_secs(5))?);
    assert!(device.is_fence_signaled(&signaled)?);

    device.destroy_fence(signaled);
    Ok(())
}

#[test]
fn semaphores_pair_one_signal_with_one_wait() -> Result<()> {
    let device = software_device();
    let semaphore = device.create_semaphore()?;
    let buffer = device.create_buffer(64, MemoryPool::DeviceLocal, BufferUsage::TRANSFER_DST)?;
    let (_storage, queue, mut list) = recording_list(&device);
    list.fill_buffer(&buffer, 0, 64, 3)?;
    device.make_command_list_executable(&mut list)?;

    let wait = SubmitSync { wait: &[&semaphore], ..Default::default() };
    let signal = SubmitSync { signal: &[&semaphore], ..Default::default() };

    // Waiting on a semaphore nobody signalled can never complete
    assert!(is_violation(&device.submit_executable_command_list_with(&queue, &mut list, wait).unwrap_err()));
    assert_eq!(list.state(), CommandListState::Executable);

    device.submit_executable_command_list_with(&queue, &mut list, signal)?;
    device.wait_for_command_queue_idle(&queue)?;
    assert!(is_violation(&device.submit_executable_command_list_with(&queue, &mut list, signal).unwrap_err()));

    device.submit_executable_command_list_with(&queue, &mut list, wait)?;
    device.wait_for_command_queue_idle(&queue)?;
    // The wait consumed the signal
    assert!(is_violation(&device.submit_executable_command_list_with(&queue, &mut list, wait).unwrap_err()));

    device.destroy_semaphore(semaphore);
    Ok(())
}

#[test]
fn queues_drain_independently() -> Result<()> {
    let device = software_device();
    let storage = device.create_command_list_storage()?;
    let first = device.create_graphic_command_queue()?;
    let second = device.create_graphic_command_queue()?;
    let buffer = device.create_buffer(4096, MemoryPool::HostReadable, BufferUsage::TRANSFER_DST)?;

    let mut lists = Vec::new();
    for (i, queue) in [&first, &second].into_iter().enumerate() {
        let mut list = device.create_command_list(&storage)?;
        device.start_command_list_recording(&mut list, &storage)?;
        list.fill_buffer(&buffer, i as u64 * 2048, 2048, i as u32 + 1)?;
        device.make_command_list_executable(&mut list)?;
        device.submit_executable_command_list(queue, &mut list)?;
        lists.push(list);
    }
    device.wait_idle()?;

    let mapped = device.map_buffer(&buffer)?;
    let words: Vec<u32> = mapped.read_as();
    assert!(words[..512].iter().all(|&w| w == 1));
    assert!(words[512..].iter().all(|&w| w == 2));
    device.unmap_buffer(mapped);

    // Finished lists can be recorded again
    for list in &mut lists {
        device.start_command_list_recording(list, &storage)?;
    }
    Ok(())
}

#[test]
fn semaphore_wait_orders_work_across_queues() -> Result<()> {
    const SIZE: u64 = 16 << 20;
    let device = software_device();
    let storage = device.create_command_list_storage()?;
    let producer = device.create_graphic_command_queue()?;
    let consumer = device.create_graphic_command_queue()?;
    let semaphore = device.create_semaphore()?;
    let scratch = device.create_buffer(SIZE, MemoryPool::DeviceLocal, BufferUsage::TRANSFER_DST)?;
    let src = device.create_buffer(256, MemoryPool::DeviceLocal, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST)?;
    let dst = readback_buffer(&device, 256);

    // Keep the producer busy so its final fill lands well after submission
    let mut produce = device.create_command_list(&storage)?;
    device.start_command_list_recording(&mut produce, &storage)?;
    for round in 0..8 {
        produce.fill_buffer(&scratch, 0, SIZE, round)?;
    }
    produce.fill_buffer(&src, 0, 256, 7)?;
    device.make_command_list_executable(&mut produce)?;
    device.submit_executable_command_list_with(&producer, &mut produce, SubmitSync { signal: &[&semaphore], ..Default::default() })?;

    let mut consume = device.create_command_list(&storage)?;
    device.start_command_list_recording(&mut consume, &storage)?;
    consume.copy_buffer(&src, 0, &dst, 0, 256)?;
    device.make_command_list_executable(&mut consume)?;
    device.submit_executable_command_list_with(&consumer, &mut consume, SubmitSync { wait: &[&semaphore], ..Default::default() })?;

    // Only the consumer is drained; the semaphore alone orders the copy
    device.wait_for_command_queue_idle(&consumer)?;
    let mapped = device.map_buffer(&dst)?;
    let words: Vec<u32> = mapped.read_as();
    assert!(words.iter().all(|&w| w == 7));
    device.unmap_buffer(mapped);

    device.wait_idle()?;
    device.destroy_semaphore(semaphore);
    Ok(())
}
