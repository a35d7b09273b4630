// Vulkan backend - the native explicit device, through ash
//
// Native objects live in one slot-map registry behind a mutex, which also
// provides the external synchronisation Vulkan demands for pools and the
// queue. Every logical queue submits to the one graphics queue and keeps its
// own serial timeline fed by per-submission fences.

mod command;
mod conv;
mod descriptor;
mod device;
mod memory;
mod pipeline;
mod shader;
mod swapchain;
mod sync;

use std::ptr::NonNull;

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use slotmap::SlotMap;

use self::descriptor::VkDescriptor;
use self::device::VulkanDevice;
use self::sync::{FencePool, Timeline};
use super::{Backend, ImageViewDesc, MappedBytes, SetAllocation, SwapchainParts};
use crate::capture::DrawCapture;
use crate::command::Command;
use crate::config::{BackendKind, RhiConfig};
use crate::descriptor::{DescriptorCapacity, DescriptorSetDescription, ResolvedWrite, WriteValue};
use crate::error::{unsupported, violation};
use crate::format::Format;
use crate::keys::*;
use crate::pipeline::{ComputePipelineDescription, GraphicsPipelineDescription};
use crate::queue::ResolvedSync;
use crate::render_pass::RenderPassDescription;
use crate::resource::{BufferDesc, ClearValue, ImageDesc, SamplerType};
use crate::swapchain::SurfaceTarget;

const BACKEND: &str = "vulkan";

struct BufferEntry {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    desc: BufferDesc,
}

struct ImageEntry {
    image: vk::Image,
    /// `None` for back buffers, which the swapchain owns.
    memory: Option<vk::DeviceMemory>,
    desc: ImageDesc,
}

struct ImageViewEntry {
    view: vk::ImageView,
    format: Format,
}

struct StorageEntry {
    pool: vk::DescriptorPool,
    sets: Vec<DescriptorSetKey>,
}

struct CommandStorageEntry {
    pool: vk::CommandPool,
    lists: Vec<CommandListKey>,
}

struct SemaphoreEntry {
    semaphore: vk::Semaphore,
    /// Whether a signal is queued that no wait consumed yet.
    pending: bool,
}

struct SwapchainEntry {
    swapchain: vk::SwapchainKHR,
    images: Vec<ImageKey>,
}

#[derive(Default)]
struct Registry {
    buffers: SlotMap<BufferKey, BufferEntry>,
    images: SlotMap<ImageKey, ImageEntry>,
    image_views: SlotMap<ImageViewKey, ImageViewEntry>,
    buffer_views: SlotMap<BufferViewKey, vk::BufferView>,
    samplers: SlotMap<SamplerKey, vk::Sampler>,
    set_layouts: SlotMap<SetLayoutKey, vk::DescriptorSetLayout>,
    pipeline_layouts: SlotMap<PipelineLayoutKey, vk::PipelineLayout>,
    storages: SlotMap<DescriptorStorageKey, StorageEntry>,
    sets: SlotMap<DescriptorSetKey, vk::DescriptorSet>,
    render_passes: SlotMap<RenderPassKey, vk::RenderPass>,
    framebuffers: SlotMap<FramebufferKey, vk::Framebuffer>,
    pipelines: SlotMap<PipelineKey, vk::Pipeline>,
    command_storages: SlotMap<CommandStorageKey, CommandStorageEntry>,
    command_lists: SlotMap<CommandListKey, vk::CommandBuffer>,
    queues: SlotMap<QueueKey, Timeline>,
    fences: SlotMap<FenceKey, vk::Fence>,
    semaphores: SlotMap<SemaphoreKey, SemaphoreEntry>,
    swapchains: SlotMap<SwapChainKey, SwapchainEntry>,
    fence_pool: FencePool,
}

impl Registry {
    fn resolve(&self, write: &ResolvedWrite) -> Result<VkDescriptor> {
        Ok(match write.value {
            WriteValue::Buffer { key, offset, size } => {
                let entry = self.buffers.get(key).context("descriptor write names a destroyed buffer")?;
                VkDescriptor::Buffer(vk::DescriptorBufferInfo { buffer: entry.buffer, offset, range: size })
            }
            WriteValue::Image { key } => {
                let view = self.image_views.get(key).context("descriptor write names a destroyed image view")?;
                VkDescriptor::Image(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view.view,
                    image_layout: conv::descriptor_layout(write.slot.kind, view.format),
                })
            }
            WriteValue::Sampler { key } => VkDescriptor::Image(vk::DescriptorImageInfo {
                sampler: *self.samplers.get(key).context("descriptor write names a destroyed sampler")?,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            }),
            WriteValue::TexelBuffer { key, .. } => VkDescriptor::TexelBuffer(
                *self.buffer_views.get(key).context("descriptor write names a destroyed buffer view")?,
            ),
        })
    }

    /// Semaphores to wait on; each must carry a signal nothing consumed yet.
    fn waits(&self, keys: &[SemaphoreKey]) -> Result<Vec<vk::Semaphore>> {
        keys.iter()
            .map(|&key| match self.semaphores.get(key) {
                Some(entry) if entry.pending => Ok(entry.semaphore),
                Some(_) => violation!("submission waits on a semaphore no earlier work signals"),
                None => violation!("submission waits on a destroyed semaphore"),
            })
            .collect()
    }

    fn signals(&self, keys: &[SemaphoreKey]) -> Result<Vec<vk::Semaphore>> {
        keys.iter()
            .map(|&key| match self.semaphores.get(key) {
                Some(entry) if entry.pending => violation!("semaphore signalled twice without a wait in between"),
                Some(entry) => Ok(entry.semaphore),
                None => violation!("submission signals a destroyed semaphore"),
            })
            .collect()
    }

    fn set_pending(&mut self, keys: &[SemaphoreKey], pending: bool) {
        for &key in keys {
            if let Some(entry) = self.semaphores.get_mut(key) {
                entry.pending = pending;
            }
        }
    }
}

pub(crate) struct VulkanBackend {
    registry: Mutex<Registry>,
    device: VulkanDevice,
}

impl VulkanBackend {
    pub(crate) fn new(config: &RhiConfig, target: Option<&SurfaceTarget>) -> Result<Self> {
        let window = match target {
            Some(SurfaceTarget::Window { display, window }) => Some((*display, *window)),
            Some(SurfaceTarget::Headless { .. }) => {
                unsupported!(BACKEND, "headless swapchains; use the software backend")
            }
            None => None,
        };
        let device = VulkanDevice::new(&config.device.app_name, config.validation_layers_enabled(), window)?;
        Ok(Self { registry: Mutex::new(Registry::default()), device })
    }

    fn raw(&self) -> &ash::Device {
        &self.device.device
    }
}

impl Backend for VulkanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferKey> {
        let (buffer, memory) = memory::create_buffer(&self.device, desc)?;
        let key = self.registry.lock().buffers.insert(BufferEntry { buffer, memory, desc: *desc });
        log::debug!("vulkan: buffer of {} bytes in {:?}", desc.size, desc.memory_pool);
        Ok(key)
    }

    fn destroy_buffer(&self, key: BufferKey) {
        if let Some(entry) = self.registry.lock().buffers.remove(key) {
            unsafe {
                self.raw().destroy_buffer(entry.buffer, None);
                self.raw().free_memory(entry.memory, None);
            }
        }
    }

    fn map_buffer(&self, key: BufferKey) -> Result<MappedBytes> {
        let registry = self.registry.lock();
        let entry = registry.buffers.get(key).context("mapping a destroyed buffer")?;
        let ptr = unsafe { self.raw().map_memory(entry.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .context("Failed to map buffer memory")?;
        let ptr = NonNull::new(ptr.cast::<u8>()).context("driver returned a null mapping")?;
        Ok(MappedBytes::Raw { ptr, len: entry.desc.size as usize })
    }

    fn unmap_buffer(&self, key: BufferKey, _bytes: MappedBytes) {
        match self.registry.lock().buffers.get(key) {
            Some(entry) => unsafe { self.raw().unmap_memory(entry.memory) },
            None => log::warn!("vulkan: unmapping a buffer that no longer exists"),
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageKey> {
        let (image, memory) = memory::create_image(&self.device, desc)?;
        let key = self.registry.lock().images.insert(ImageEntry { image, memory: Some(memory), desc: *desc });
        log::debug!(
            "vulkan: image {}x{} {:?} ({} mips, {} layers)",
            desc.width,
            desc.height,
            desc.format,
            desc.mip_count,
            desc.layer_count
        );
        Ok(key)
    }

    fn destroy_image(&self, key: ImageKey) {
        let Some(entry) = self.registry.lock().images.remove(key) else {
            return;
        };
        if let Some(memory) = entry.memory {
            unsafe {
                self.raw().destroy_image(entry.image, None);
                self.raw().free_memory(memory, None);
            }
        }
    }

    fn create_image_view(&self, image: ImageKey, desc: &ImageViewDesc) -> Result<ImageViewKey> {
        let mut registry = self.registry.lock();
        let image = registry.images.get(image).context("viewing a destroyed image")?.image;

        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(conv::view_type(desc.view_type))
            .format(conv::format(desc.format))
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: conv::aspect(desc.aspect),
                base_mip_level: desc.range.base_mip,
                level_count: desc.range.mip_count,
                base_array_layer: desc.range.base_layer,
                layer_count: desc.range.layer_count,
            });

        let view = unsafe { self.raw().create_image_view(&create_info, None) }
            .context("Failed to create image view")?;
        Ok(registry.image_views.insert(ImageViewEntry { view, format: desc.format }))
    }

    fn destroy_image_view(&self, key: ImageViewKey) {
        if let Some(entry) = self.registry.lock().image_views.remove(key) {
            unsafe { self.raw().destroy_image_view(entry.view, None) };
        }
    }

    fn create_buffer_view(&self, buffer: BufferKey, format: Format, offset: u64, size: u64) -> Result<BufferViewKey> {
        let mut registry = self.registry.lock();
        let buffer = registry.buffers.get(buffer).context("viewing a destroyed buffer")?.buffer;

        let create_info = vk::BufferViewCreateInfo::builder()
            .buffer(buffer)
            .format(conv::format(format))
            .offset(offset)
            .range(size);

        let view = unsafe { self.raw().create_buffer_view(&create_info, None) }
            .context("Failed to create buffer view")?;
        Ok(registry.buffer_views.insert(view))
    }

    fn destroy_buffer_view(&self, key: BufferViewKey) {
        if let Some(view) = self.registry.lock().buffer_views.remove(key) {
            unsafe { self.raw().destroy_buffer_view(view, None) };
        }
    }

    fn create_sampler(&self, sampler_type: SamplerType) -> Result<SamplerKey> {
        let sampler = descriptor::create_sampler(&self.device, sampler_type)?;
        Ok(self.registry.lock().samplers.insert(sampler))
    }

    fn destroy_sampler(&self, key: SamplerKey) {
        if let Some(sampler) = self.registry.lock().samplers.remove(key) {
            unsafe { self.raw().destroy_sampler(sampler, None) };
        }
    }

    fn create_set_layout(&self, desc: &DescriptorSetDescription) -> Result<SetLayoutKey> {
        let layout = descriptor::create_set_layout(&self.device, desc)?;
        Ok(self.registry.lock().set_layouts.insert(layout))
    }

    fn destroy_set_layout(&self, key: SetLayoutKey) {
        if let Some(layout) = self.registry.lock().set_layouts.remove(key) {
            unsafe { self.raw().destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn create_pipeline_layout(&self, sets: &[SetLayoutKey]) -> Result<PipelineLayoutKey> {
        let mut registry = self.registry.lock();
        let layouts = sets
            .iter()
            .map(|&key| registry.set_layouts.get(key).copied().context("pipeline layout names a destroyed set layout"))
            .collect::<Result<Vec<_>>>()?;
        let layout = descriptor::create_pipeline_layout(&self.device, &layouts)?;
        Ok(registry.pipeline_layouts.insert(layout))
    }

    fn destroy_pipeline_layout(&self, key: PipelineLayoutKey) {
        if let Some(layout) = self.registry.lock().pipeline_layouts.remove(key) {
            unsafe { self.raw().destroy_pipeline_layout(layout, None) };
        }
    }

    fn create_descriptor_storage(&self, max_sets: u32, capacities: &[DescriptorCapacity]) -> Result<DescriptorStorageKey> {
        let pool = descriptor::create_pool(&self.device, max_sets, capacities)?;
        log::debug!("vulkan: descriptor pool for {} sets", max_sets);
        Ok(self.registry.lock().storages.insert(StorageEntry { pool, sets: Vec::new() }))
    }

    fn reset_descriptor_storage(&self, key: DescriptorStorageKey) -> Result<()> {
        let mut registry = self.registry.lock();
        let Some(storage) = registry.storages.get_mut(key) else {
            violation!("resetting a destroyed descriptor storage");
        };
        unsafe { self.raw().reset_descriptor_pool(storage.pool, vk::DescriptorPoolResetFlags::empty()) }
            .context("Failed to reset descriptor pool")?;
        let sets = std::mem::take(&mut storage.sets);
        for set in sets {
            registry.sets.remove(set);
        }
        Ok(())
    }

    fn destroy_descriptor_storage(&self, key: DescriptorStorageKey) {
        let mut registry = self.registry.lock();
        if let Some(storage) = registry.storages.remove(key) {
            // Sets go with their pool
            unsafe { self.raw().destroy_descriptor_pool(storage.pool, None) };
            for set in storage.sets {
                registry.sets.remove(set);
            }
        }
    }

    fn allocate_descriptor_sets(&self, storage: DescriptorStorageKey, sets: &[SetAllocation]) -> Result<Vec<DescriptorSetKey>> {
        let mut registry = self.registry.lock();
        let Some(pool) = registry.storages.get(storage).map(|entry| entry.pool) else {
            violation!("allocating from a destroyed descriptor storage");
        };
        let layouts = sets
            .iter()
            .map(|allocation| match registry.set_layouts.get(allocation.layout) {
                Some(layout) => Ok(*layout),
                None => violation!("allocating a set for a destroyed layout"),
            })
            .collect::<Result<Vec<_>>>()?;

        let native = descriptor::allocate_sets(&self.device, pool, &layouts)?;
        let keys: Vec<_> = native.into_iter().map(|set| registry.sets.insert(set)).collect();
        if let Some(entry) = registry.storages.get_mut(storage) {
            entry.sets.extend(&keys);
        }
        Ok(keys)
    }

    fn write_descriptors(&self, set: DescriptorSetKey, writes: &[ResolvedWrite]) -> Result<()> {
        let registry = self.registry.lock();
        let Some(&native) = registry.sets.get(set) else {
            violation!("writing into a released descriptor set");
        };
        let resolved = writes
            .iter()
            .map(|write| Ok((write.slot, registry.resolve(write)?)))
            .collect::<Result<Vec<_>>>()?;
        descriptor::write_set(&self.device, native, &resolved);
        Ok(())
    }

    fn create_render_pass(&self, desc: &RenderPassDescription) -> Result<RenderPassKey> {
        let render_pass = pipeline::create_render_pass(&self.device, desc)?;
        Ok(self.registry.lock().render_passes.insert(render_pass))
    }

    fn destroy_render_pass(&self, key: RenderPassKey) {
        if let Some(render_pass) = self.registry.lock().render_passes.remove(key) {
            unsafe { self.raw().destroy_render_pass(render_pass, None) };
        }
    }

    fn create_framebuffer(&self, render_pass: RenderPassKey, views: &[ImageViewKey], width: u32, height: u32) -> Result<FramebufferKey> {
        let mut registry = self.registry.lock();
        let Some(&render_pass) = registry.render_passes.get(render_pass) else {
            violation!("framebuffer for a destroyed render pass");
        };
        let views = views
            .iter()
            .map(|&key| registry.image_views.get(key).map(|entry| entry.view).context("framebuffer names a destroyed view"))
            .collect::<Result<Vec<_>>>()?;
        let framebuffer = pipeline::create_framebuffer(&self.device, render_pass, &views, width, height)?;
        Ok(registry.framebuffers.insert(framebuffer))
    }

    fn destroy_framebuffer(&self, key: FramebufferKey) {
        if let Some(framebuffer) = self.registry.lock().framebuffers.remove(key) {
            unsafe { self.raw().destroy_framebuffer(framebuffer, None) };
        }
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescription,
        render_pass: RenderPassKey,
        layout: PipelineLayoutKey,
        subpass: u32,
    ) -> Result<PipelineKey> {
        let (render_pass, layout) = {
            let registry = self.registry.lock();
            match (registry.render_passes.get(render_pass), registry.pipeline_layouts.get(layout)) {
                (Some(&render_pass), Some(&layout)) => (render_pass, layout),
                _ => violation!("graphics pipeline built against a destroyed render pass or layout"),
            }
        };
        // Compilation can be slow, so it runs outside the registry lock
        let pipeline = pipeline::create_graphics_pipeline(&self.device, desc, render_pass, layout, subpass)?;
        Ok(self.registry.lock().pipelines.insert(pipeline))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDescription, layout: PipelineLayoutKey) -> Result<PipelineKey> {
        let Some(layout) = self.registry.lock().pipeline_layouts.get(layout).copied() else {
            violation!("compute pipeline built against a destroyed layout");
        };
        let pipeline = pipeline::create_compute_pipeline(&self.device, desc, layout)?;
        Ok(self.registry.lock().pipelines.insert(pipeline))
    }

    fn destroy_pipeline(&self, key: PipelineKey) {
        if let Some(pipeline) = self.registry.lock().pipelines.remove(key) {
            unsafe { self.raw().destroy_pipeline(pipeline, None) };
        }
    }

    fn create_command_storage(&self) -> Result<CommandStorageKey> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.device.graphics_queue_family);
        let pool = unsafe { self.raw().create_command_pool(&create_info, None) }
            .context("Failed to create command pool")?;
        Ok(self.registry.lock().command_storages.insert(CommandStorageEntry { pool, lists: Vec::new() }))
    }

    fn reset_command_storage(&self, key: CommandStorageKey) -> Result<()> {
        let registry = self.registry.lock();
        let Some(storage) = registry.command_storages.get(key) else {
            violation!("resetting a destroyed command list storage");
        };
        unsafe { self.raw().reset_command_pool(storage.pool, vk::CommandPoolResetFlags::empty()) }
            .context("Failed to reset command pool")
    }

    fn destroy_command_storage(&self, key: CommandStorageKey) {
        let mut registry = self.registry.lock();
        if let Some(storage) = registry.command_storages.remove(key) {
            // Buffers go with their pool
            unsafe { self.raw().destroy_command_pool(storage.pool, None) };
            for list in storage.lists {
                registry.command_lists.remove(list);
            }
        }
    }

    fn create_command_list(&self, storage: CommandStorageKey) -> Result<CommandListKey> {
        let mut registry = self.registry.lock();
        let Some(pool) = registry.command_storages.get(storage).map(|entry| entry.pool) else {
            violation!("allocating from a destroyed command list storage");
        };
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.raw().allocate_command_buffers(&allocate_info) }
            .context("Failed to allocate command buffer")?;
        let buffer = buffers.into_iter().next().context("Driver returned no command buffer")?;

        let key = registry.command_lists.insert(buffer);
        if let Some(entry) = registry.command_storages.get_mut(storage) {
            entry.lists.push(key);
        }
        Ok(key)
    }

    fn destroy_command_list(&self, storage: CommandStorageKey, key: CommandListKey) {
        let mut registry = self.registry.lock();
        let Some(buffer) = registry.command_lists.remove(key) else {
            return;
        };
        if let Some(entry) = registry.command_storages.get_mut(storage) {
            entry.lists.retain(|&list| list != key);
            unsafe { self.raw().free_command_buffers(entry.pool, &[buffer]) };
        }
    }

    fn reset_command_list(&self, key: CommandListKey) -> Result<()> {
        let registry = self.registry.lock();
        let Some(&buffer) = registry.command_lists.get(key) else {
            violation!("resetting a destroyed command list");
        };
        unsafe { self.raw().reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty()) }
            .context("Failed to reset command buffer")
    }

    fn translate_command_list(&self, _storage: CommandStorageKey, key: CommandListKey, commands: &[Command]) -> Result<()> {
        let registry = self.registry.lock();
        let Some(&buffer) = registry.command_lists.get(key) else {
            violation!("translating a destroyed command list");
        };
        if let Err(err) = command::record(self.raw(), &registry, buffer, commands) {
            // Leave the buffer initial rather than half recorded
            unsafe {
                let _ = self.raw().reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty());
            }
            return Err(err);
        }
        log::debug!("vulkan: recorded {} commands", commands.len());
        Ok(())
    }

    fn create_queue(&self) -> Result<QueueKey> {
        let key = self.registry.lock().queues.insert(Timeline::default());
        log::info!("Vulkan queue created on family {}", self.device.graphics_queue_family);
        Ok(key)
    }

    fn submit(&self, queue: QueueKey, list: CommandListKey, sync: &ResolvedSync) -> Result<u64> {
        let mut guard = self.registry.lock();
        let registry = &mut *guard;
        if !registry.queues.contains_key(queue) {
            violation!("submitting to a destroyed queue");
        }
        let Some(&command_buffer) = registry.command_lists.get(list) else {
            violation!("submitting a destroyed command list");
        };
        let user_fence = match sync.fence {
            Some(key) => Some(*registry.fences.get(key).context("submitting with a destroyed fence")?),
            None => None,
        };
        let waits = registry.waits(&sync.wait)?;
        let signals = registry.signals(&sync.signal)?;

        // Step 1: Submit the list with a timeline fence
        let fence = registry.fence_pool.acquire(self.raw())?;
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signals)
            .build();

        if let Err(err) = unsafe { self.raw().queue_submit(self.device.graphics_queue, &[submit_info], fence) } {
            registry.fence_pool.release(fence);
            return Err(err).context("Failed to submit command list");
        }
        registry.set_pending(&sync.wait, false);
        registry.set_pending(&sync.signal, true);

        let serial = match registry.queues.get_mut(queue) {
            Some(timeline) => timeline.push(fence),
            None => violation!("submitting to a destroyed queue"),
        };

        // Step 2: An empty batch signals the caller's fence once everything before it is done
        if let Some(user_fence) = user_fence {
            unsafe { self.raw().queue_submit(self.device.graphics_queue, &[], user_fence) }
                .context("Failed to signal submission fence")?;
        }
        Ok(serial)
    }

    fn is_complete(&self, queue: QueueKey, serial: u64) -> Result<bool> {
        let mut guard = self.registry.lock();
        let registry = &mut *guard;
        let Some(timeline) = registry.queues.get_mut(queue) else {
            violation!("polling a destroyed queue");
        };
        Ok(timeline.poll(&self.device.device, &mut registry.fence_pool)? >= serial)
    }

    fn wait_queue_idle(&self, queue: QueueKey) -> Result<()> {
        // Held across the wait so no fence is recycled underneath us
        let mut guard = self.registry.lock();
        let registry = &mut *guard;
        let Some(timeline) = registry.queues.get_mut(queue) else {
            violation!("waiting on a destroyed queue");
        };
        let fences = timeline.pending_fences();
        if !fences.is_empty() {
            unsafe { self.device.device.wait_for_fences(&fences, true, u64::MAX) }
                .context("Failed waiting for queue")?;
        }
        timeline.poll(&self.device.device, &mut registry.fence_pool)?;
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceKey> {
        let fence = sync::create_fence(self.raw(), signaled)?;
        Ok(self.registry.lock().fences.insert(fence))
    }

    fn wait_for_fence(&self, key: FenceKey, timeout_ns: u64) -> Result<bool> {
        let fence = *self.registry.lock().fences.get(key).context("fence was destroyed")?;
        match unsafe { self.raw().wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err).context("Failed waiting for fence"),
        }
    }

    fn is_fence_signaled(&self, key: FenceKey) -> Result<bool> {
        let fence = *self.registry.lock().fences.get(key).context("fence was destroyed")?;
        unsafe { self.raw().get_fence_status(fence) }.context("Failed to query fence")
    }

    fn reset_fence(&self, key: FenceKey) -> Result<()> {
        let fence = *self.registry.lock().fences.get(key).context("fence was destroyed")?;
        unsafe { self.raw().reset_fences(&[fence]) }.context("Failed to reset fence")
    }

    fn destroy_fence(&self, key: FenceKey) {
        if let Some(fence) = self.registry.lock().fences.remove(key) {
            unsafe { self.raw().destroy_fence(fence, None) };
        }
    }

    fn create_semaphore(&self) -> Result<SemaphoreKey> {
        let semaphore = sync::create_semaphore(self.raw())?;
        Ok(self.registry.lock().semaphores.insert(SemaphoreEntry { semaphore, pending: false }))
    }

    fn destroy_semaphore(&self, key: SemaphoreKey) {
        if let Some(entry) = self.registry.lock().semaphores.remove(key) {
            unsafe { self.raw().destroy_semaphore(entry.semaphore, None) };
        }
    }

    fn create_swapchain(&self, target: &SurfaceTarget, width: u32, height: u32, config: &RhiConfig) -> Result<SwapchainParts> {
        if let SurfaceTarget::Headless { .. } = target {
            unsupported!(BACKEND, "headless swapchains; use the software backend");
        }
        let native = swapchain::create(&self.device, width, height, config)?;

        let desc = ImageDesc {
            format: native.format,
            width: native.extent.width,
            height: native.extent.height,
            mip_count: 1,
            layer_count: 1,
            usage: native.usage,
            clear_value: Some(ClearValue::Color([0.0, 0.0, 0.0, 1.0])),
        };
        let mut registry = self.registry.lock();
        let images: Vec<(ImageKey, ImageDesc)> = native
            .images
            .iter()
            .map(|&image| (registry.images.insert(ImageEntry { image, memory: None, desc }), desc))
            .collect();
        let key = registry.swapchains.insert(SwapchainEntry {
            swapchain: native.swapchain,
            images: images.iter().map(|(key, _)| *key).collect(),
        });
        Ok(SwapchainParts {
            key,
            images,
            format: native.format,
            extent: (native.extent.width, native.extent.height),
        })
    }

    fn acquire_next_image(&self, swapchain: SwapChainKey, signal: SemaphoreKey) -> Result<u32> {
        let mut registry = self.registry.lock();
        let Some(loader) = &self.device.swapchain_loader else {
            violation!("acquiring on a device without presentation");
        };
        let Some(native) = registry.swapchains.get(swapchain).map(|entry| entry.swapchain) else {
            violation!("acquiring from a destroyed swapchain");
        };
        let semaphore = match registry.semaphores.get(signal) {
            Some(entry) if entry.pending => {
                violation!("image-available semaphore still holds an unconsumed signal; wait on it in a submission")
            }
            Some(entry) => entry.semaphore,
            None => violation!("acquiring with a destroyed semaphore"),
        };
        let index = swapchain::acquire_next_image(loader, native, semaphore)?;
        registry.set_pending(&[signal], true);
        Ok(index)
    }

    fn present(&self, queue: QueueKey, swapchain: SwapChainKey, index: u32, wait: SemaphoreKey) -> Result<()> {
        let mut registry = self.registry.lock();
        let Some(loader) = &self.device.swapchain_loader else {
            violation!("presenting on a device without presentation");
        };
        if !registry.queues.contains_key(queue) {
            violation!("presenting on a destroyed queue");
        }
        let Some(native) = registry.swapchains.get(swapchain).map(|entry| entry.swapchain) else {
            violation!("presenting a destroyed swapchain");
        };
        // Only wait when the last submission actually signalled render-finished
        let waits = match registry.semaphores.get(wait) {
            Some(entry) if entry.pending => vec![entry.semaphore],
            Some(_) => Vec::new(),
            None => violation!("presenting with a destroyed semaphore"),
        };
        swapchain::present(loader, self.device.graphics_queue, native, index, &waits)?;
        registry.set_pending(&[wait], false);
        Ok(())
    }

    fn destroy_swapchain(&self, key: SwapChainKey) {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.swapchains.remove(key) else {
            return;
        };
        // Presentation may still read the back buffers
        if let Err(err) = self.device.wait_idle() {
            log::error!("vulkan: wait before destroying swapchain failed: {:#}", err);
        }
        for image in entry.images {
            registry.images.remove(image);
        }
        if let Some(loader) = &self.device.swapchain_loader {
            unsafe { loader.destroy_swapchain(entry.swapchain, None) };
        }
    }

    fn take_draw_capture(&self) -> Option<DrawCapture> {
        None
    }

    fn wait_idle(&self) -> Result<()> {
        let mut guard = self.registry.lock();
        let registry = &mut *guard;
        self.device.wait_idle()?;
        for timeline in registry.queues.values_mut() {
            timeline.poll(&self.device.device, &mut registry.fence_pool)?;
        }
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();

        // Whatever the caller leaked goes before the device itself
        let registry = self.registry.get_mut();
        let device = &self.device.device;
        unsafe {
            for (_, framebuffer) in registry.framebuffers.drain() {
                device.destroy_framebuffer(framebuffer, None);
            }
            for (_, pipeline) in registry.pipelines.drain() {
                device.destroy_pipeline(pipeline, None);
            }
            for (_, layout) in registry.pipeline_layouts.drain() {
                device.destroy_pipeline_layout(layout, None);
            }
            for (_, render_pass) in registry.render_passes.drain() {
                device.destroy_render_pass(render_pass, None);
            }
            for (_, storage) in registry.storages.drain() {
                device.destroy_descriptor_pool(storage.pool, None);
            }
            for (_, layout) in registry.set_layouts.drain() {
                device.destroy_descriptor_set_layout(layout, None);
            }
            for (_, sampler) in registry.samplers.drain() {
                device.destroy_sampler(sampler, None);
            }
            for (_, entry) in registry.image_views.drain() {
                device.destroy_image_view(entry.view, None);
            }
            for (_, view) in registry.buffer_views.drain() {
                device.destroy_buffer_view(view, None);
            }
            for (_, entry) in registry.images.drain() {
                if let Some(memory) = entry.memory {
                    device.destroy_image(entry.image, None);
                    device.free_memory(memory, None);
                }
            }
            for (_, entry) in registry.buffers.drain() {
                device.destroy_buffer(entry.buffer, None);
                device.free_memory(entry.memory, None);
            }
            for (_, storage) in registry.command_storages.drain() {
                device.destroy_command_pool(storage.pool, None);
            }
            for (_, fence) in registry.fences.drain() {
                device.destroy_fence(fence, None);
            }
            for (_, entry) in registry.semaphores.drain() {
                device.destroy_semaphore(entry.semaphore, None);
            }
            if let Some(loader) = &self.device.swapchain_loader {
                for (_, entry) in registry.swapchains.drain() {
                    loader.destroy_swapchain(entry.swapchain, None);
                }
            }
        }
        for (_, mut timeline) in registry.queues.drain() {
            timeline.destroy(device);
        }
        registry.fence_pool.destroy(device);
    }
}
