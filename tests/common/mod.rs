// Shared setup for the integration tests. Everything runs on the software
// backend so the suite needs no GPU.

#![allow(dead_code)]

use rhi::{
    classify, BackendKind, Buffer, BufferUsage, ClearValue, CommandList, CommandListStorage, CommandQueue, Device,
    Format, Image, ImageUsage, MemoryPool, RhiConfig,
};

pub const FORMAT: Format = Format::R8G8B8A8Unorm;

pub fn software_config() -> RhiConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = RhiConfig::with_backend(BackendKind::Software);
    config.debug.state_validation = true;
    config.debug.capture_draws = true;
    config
}

pub fn software_device() -> Device {
    Device::new(&software_config()).expect("software device")
}

pub fn is_violation(err: &anyhow::Error) -> bool {
    classify(err).is_some_and(|e| e.is_contract_violation())
}

pub fn is_allocation(err: &anyhow::Error) -> bool {
    classify(err).is_some_and(|e| e.is_allocation())
}

/// Colour target that can be rendered to, cleared and read back.
pub fn color_target(device: &Device, width: u32, height: u32) -> Image {
    device
        .create_image(
            FORMAT,
            width,
            height,
            1,
            1,
            ImageUsage::RENDER_TARGET | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
            Some(ClearValue::Color([0.0, 0.0, 0.0, 1.0])),
        )
        .expect("color target")
}

pub fn readback_buffer(device: &Device, size: u64) -> Buffer {
    device
        .create_buffer(size, MemoryPool::HostReadable, BufferUsage::TRANSFER_DST)
        .expect("readback buffer")
}

/// Storage, queue and a list already in the recording state.
pub fn recording_list(device: &Device) -> (CommandListStorage, CommandQueue, CommandList) {
    let storage = device.create_command_list_storage().expect("storage");
    let queue = device.create_graphic_command_queue().expect("queue");
    let mut list = device.create_command_list(&storage).expect("list");
    device.start_command_list_recording(&mut list, &storage).expect("recording");
    (storage, queue, list)
}

/// Make `list` executable, submit it and wait for the queue to drain.
pub fn submit_and_wait(device: &Device, queue: &CommandQueue, list: &mut CommandList) -> anyhow::Result<()> {
    device.make_command_list_executable(list)?;
    device.submit_executable_command_list(queue, list)?;
    device.wait_for_command_queue_idle(queue)
}
