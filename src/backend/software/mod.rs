// Software backend - the immediate, explicit-barrier device run on the CPU
//
// Objects live in one slot-map registry behind a mutex. Descriptor storages
// are host-visible heaps written eagerly. Each queue owns a worker thread
// that executes translated lists in submission order.

mod execute;
mod memory;
mod queue;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use slotmap::SlotMap;

use self::execute::{translate, Op};
use self::memory::{BufferMemory, ImageMemory};
use self::queue::{FenceState, QueueWorker, TimelinePoint};
use super::{Backend, ImageViewDesc, MappedBytes, SetAllocation, SwapchainParts};
use crate::capture::{DrawCall, DrawCapture};
use crate::command::Command;
use crate::config::{BackendKind, RhiConfig};
use crate::descriptor::{DescriptorCapacity, DescriptorSetDescription, DescriptorSlot, ResolvedWrite, WriteValue};
use crate::error::{unsupported, violation};
use crate::format::Format;
use crate::keys::*;
use crate::pipeline::{ComputePipelineDescription, GraphicsPipelineDescription};
use crate::queue::ResolvedSync;
use crate::render_pass::RenderPassDescription;
use crate::resource::{BufferDesc, ClearValue, ImageDesc, ImageUsage, ImageViewRange, MemoryPool, SamplerType};
use crate::swapchain::SurfaceTarget;

const BACKEND: &str = "software";

/// What a heap slot holds once written.
#[derive(Debug, Clone)]
pub(crate) enum Descriptor {
    Buffer {
        memory: Arc<BufferMemory>,
        offset: u64,
        size: u64,
    },
    Image {
        image: Arc<ImageMemory>,
        range: ImageViewRange,
    },
    Sampler(SamplerType),
    TexelBuffer {
        memory: Arc<BufferMemory>,
        offset: u64,
        size: u64,
    },
}

#[derive(Debug)]
struct ImageViewEntry {
    image: Arc<ImageMemory>,
    range: ImageViewRange,
}

#[derive(Debug)]
struct BufferViewEntry {
    memory: Arc<BufferMemory>,
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct StorageEntry {
    heap: Arc<Mutex<Vec<Option<Descriptor>>>>,
    sets: Vec<DescriptorSetKey>,
}

#[derive(Debug)]
pub(crate) struct SetEntry {
    pub heap: Arc<Mutex<Vec<Option<Descriptor>>>>,
    pub starting_index: u32,
    pub slots: Arc<Vec<DescriptorSlot>>,
}

#[derive(Debug)]
struct SwapchainEntry {
    images: Vec<ImageKey>,
    next: u32,
}

/// Every live object of the software device.
#[derive(Default)]
pub(crate) struct Registry {
    pub buffers: SlotMap<BufferKey, Arc<BufferMemory>>,
    pub images: SlotMap<ImageKey, Arc<ImageMemory>>,
    image_views: SlotMap<ImageViewKey, ImageViewEntry>,
    buffer_views: SlotMap<BufferViewKey, BufferViewEntry>,
    samplers: SlotMap<SamplerKey, SamplerType>,
    set_layouts: SlotMap<SetLayoutKey, DescriptorSetDescription>,
    pipeline_layouts: SlotMap<PipelineLayoutKey, Vec<SetLayoutKey>>,
    storages: SlotMap<DescriptorStorageKey, StorageEntry>,
    pub sets: SlotMap<DescriptorSetKey, SetEntry>,
    render_passes: SlotMap<RenderPassKey, RenderPassDescription>,
    framebuffers: SlotMap<FramebufferKey, Vec<ImageViewKey>>,
    pipelines: SlotMap<PipelineKey, PipelineLayoutKey>,
    command_storages: SlotMap<CommandStorageKey, Vec<CommandListKey>>,
    command_lists: SlotMap<CommandListKey, Option<Arc<Vec<Op>>>>,
    fences: SlotMap<FenceKey, Arc<FenceState>>,
    /// The signal pending on each semaphore, if any.
    semaphores: SlotMap<SemaphoreKey, Option<PendingSignal>>,
    swapchains: SlotMap<SwapChainKey, SwapchainEntry>,
}

/// Who signals a semaphore. Queue signals land when that submission finishes;
/// swapchain acquisition signals immediately.
#[derive(Debug, Clone)]
enum PendingSignal {
    Host,
    Queue(TimelinePoint),
}

impl Registry {
    fn resolve(&self, value: &WriteValue) -> Result<Descriptor> {
        Ok(match *value {
            WriteValue::Buffer { key, offset, size } => Descriptor::Buffer {
                memory: self.buffers.get(key).cloned().context("descriptor write names a destroyed buffer")?,
                offset,
                size,
            },
            WriteValue::Image { key } => {
                let view = self.image_views.get(key).context("descriptor write names a destroyed image view")?;
                Descriptor::Image { image: view.image.clone(), range: view.range }
            }
            WriteValue::Sampler { key } => {
                Descriptor::Sampler(*self.samplers.get(key).context("descriptor write names a destroyed sampler")?)
            }
            WriteValue::TexelBuffer { key, .. } => {
                let view = self.buffer_views.get(key).context("descriptor write names a destroyed buffer view")?;
                Descriptor::TexelBuffer { memory: view.memory.clone(), offset: view.offset, size: view.size }
            }
        })
    }

    /// Consume one pending signal per wait and return the queue points the
    /// waiter has to reach first. A wait with nothing pending could never be
    /// satisfied.
    fn consume_waits(&mut self, waits: &[SemaphoreKey]) -> Result<Vec<TimelinePoint>> {
        for &key in waits {
            match self.semaphores.get(key) {
                Some(Some(_)) => {}
                Some(None) => violation!("submission waits on a semaphore no earlier work signals"),
                None => violation!("submission waits on a destroyed semaphore"),
            }
        }
        let mut points = Vec::new();
        for &key in waits {
            if let Some(Some(PendingSignal::Queue(point))) = self.semaphores.get_mut(key).map(Option::take) {
                points.push(point);
            }
        }
        Ok(points)
    }

    /// A semaphore the same submission waits on is free to signal again.
    fn check_signals(&self, signals: &[SemaphoreKey], waits: &[SemaphoreKey]) -> Result<()> {
        for &key in signals {
            match self.semaphores.get(key) {
                Some(Some(_)) if !waits.contains(&key) => violation!("semaphore signalled twice without a wait in between"),
                Some(_) => {}
                None => violation!("submission signals a destroyed semaphore"),
            }
        }
        Ok(())
    }

    fn signal(&mut self, signals: &[SemaphoreKey], point: &TimelinePoint) {
        for &key in signals {
            if let Some(pending) = self.semaphores.get_mut(key) {
                *pending = Some(PendingSignal::Queue(point.clone()));
            }
        }
    }
}

pub(crate) struct SoftwareBackend {
    registry: Mutex<Registry>,
    queues: Mutex<SlotMap<QueueKey, Arc<QueueWorker>>>,
    capture: Option<Arc<Mutex<Vec<DrawCall>>>>,
    swapchain_images: u32,
}

impl SoftwareBackend {
    pub(crate) fn new(config: &RhiConfig, target: Option<&SurfaceTarget>) -> Result<Self> {
        if let Some(SurfaceTarget::Window { .. }) = target {
            unsupported!(BACKEND, "window surfaces; use SurfaceTarget::Headless");
        }
        log::info!("Software device created (draw capture: {})", config.debug.capture_draws);
        Ok(Self {
            registry: Mutex::new(Registry::default()),
            queues: Mutex::new(SlotMap::with_key()),
            capture: config.debug.capture_draws.then(|| Arc::new(Mutex::new(Vec::new()))),
            swapchain_images: config.swapchain.image_count.max(2),
        })
    }

    fn queue(&self, key: QueueKey) -> Result<Arc<QueueWorker>> {
        self.queues.lock().get(key).cloned().context("queue was destroyed")
    }

    fn fence(&self, key: FenceKey) -> Result<Arc<FenceState>> {
        self.registry.lock().fences.get(key).cloned().context("fence was destroyed")
    }
}

impl Backend for SoftwareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferKey> {
        let memory = Arc::new(BufferMemory::new(*desc)?);
        let key = self.registry.lock().buffers.insert(memory);
        log::debug!("software: buffer of {} bytes in {:?}", desc.size, desc.memory_pool);
        Ok(key)
    }

    fn destroy_buffer(&self, key: BufferKey) {
        self.registry.lock().buffers.remove(key);
    }

    fn map_buffer(&self, key: BufferKey) -> Result<MappedBytes> {
        let memory = self.registry.lock().buffers.get(key).cloned().context("mapping a destroyed buffer")?;
        Ok(MappedBytes::Owned(memory.begin_map()?))
    }

    fn unmap_buffer(&self, key: BufferKey, bytes: MappedBytes) {
        let Some(memory) = self.registry.lock().buffers.get(key).cloned() else {
            log::warn!("software: unmapping a buffer that no longer exists");
            return;
        };
        let write_back = memory.desc.memory_pool == MemoryPool::HostWritable;
        memory.end_map(bytes.as_slice(), write_back);
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageKey> {
        let memory = Arc::new(ImageMemory::new(*desc)?);
        let key = self.registry.lock().images.insert(memory);
        log::debug!(
            "software: image {}x{} {:?} ({} mips, {} layers)",
            desc.width,
            desc.height,
            desc.format,
            desc.mip_count,
            desc.layer_count
        );
        Ok(key)
    }

    fn destroy_image(&self, key: ImageKey) {
        self.registry.lock().images.remove(key);
    }

    fn create_image_view(&self, image: ImageKey, desc: &ImageViewDesc) -> Result<ImageViewKey> {
        let mut registry = self.registry.lock();
        let image = registry.images.get(image).cloned().context("viewing a destroyed image")?;
        Ok(registry.image_views.insert(ImageViewEntry { image, range: desc.range }))
    }

    fn destroy_image_view(&self, key: ImageViewKey) {
        self.registry.lock().image_views.remove(key);
    }

    fn create_buffer_view(&self, buffer: BufferKey, _format: Format, offset: u64, size: u64) -> Result<BufferViewKey> {
        let mut registry = self.registry.lock();
        let memory = registry.buffers.get(buffer).cloned().context("viewing a destroyed buffer")?;
        Ok(registry.buffer_views.insert(BufferViewEntry { memory, offset, size }))
    }

    fn destroy_buffer_view(&self, key: BufferViewKey) {
        self.registry.lock().buffer_views.remove(key);
    }

    fn create_sampler(&self, sampler_type: SamplerType) -> Result<SamplerKey> {
        Ok(self.registry.lock().samplers.insert(sampler_type))
    }

    fn destroy_sampler(&self, key: SamplerKey) {
        self.registry.lock().samplers.remove(key);
    }

    fn create_set_layout(&self, desc: &DescriptorSetDescription) -> Result<SetLayoutKey> {
        Ok(self.registry.lock().set_layouts.insert(desc.clone()))
    }

    fn destroy_set_layout(&self, key: SetLayoutKey) {
        self.registry.lock().set_layouts.remove(key);
    }

    fn create_pipeline_layout(&self, sets: &[SetLayoutKey]) -> Result<PipelineLayoutKey> {
        Ok(self.registry.lock().pipeline_layouts.insert(sets.to_vec()))
    }

    fn destroy_pipeline_layout(&self, key: PipelineLayoutKey) {
        self.registry.lock().pipeline_layouts.remove(key);
    }

    fn create_descriptor_storage(&self, max_sets: u32, capacities: &[DescriptorCapacity]) -> Result<DescriptorStorageKey> {
        let total: u64 = capacities.iter().map(|c| c.count as u64).sum();
        let heap = vec![None; total as usize];
        log::debug!("software: descriptor heap of {} descriptors for {} sets", total, max_sets);
        Ok(self.registry.lock().storages.insert(StorageEntry {
            heap: Arc::new(Mutex::new(heap)),
            sets: Vec::new(),
        }))
    }

    fn reset_descriptor_storage(&self, key: DescriptorStorageKey) -> Result<()> {
        let mut registry = self.registry.lock();
        let Some(storage) = registry.storages.get_mut(key) else {
            violation!("resetting a destroyed descriptor storage");
        };
        let sets = std::mem::take(&mut storage.sets);
        storage.heap.lock().iter_mut().for_each(|slot| *slot = None);
        for set in sets {
            registry.sets.remove(set);
        }
        Ok(())
    }

    fn destroy_descriptor_storage(&self, key: DescriptorStorageKey) {
        let mut registry = self.registry.lock();
        if let Some(storage) = registry.storages.remove(key) {
            for set in storage.sets {
                registry.sets.remove(set);
            }
        }
    }

    fn allocate_descriptor_sets(&self, storage: DescriptorStorageKey, sets: &[SetAllocation]) -> Result<Vec<DescriptorSetKey>> {
        let mut registry = self.registry.lock();
        let heap = match registry.storages.get(storage) {
            Some(entry) => entry.heap.clone(),
            None => violation!("allocating from a destroyed descriptor storage"),
        };
        let heap_len = heap.lock().len() as u64;

        let mut entries = Vec::with_capacity(sets.len());
        for allocation in sets {
            let Some(description) = registry.set_layouts.get(allocation.layout) else {
                violation!("allocating a set for a destroyed layout");
            };
            if allocation.starting_index as u64 + allocation.slot_count as u64 > heap_len {
                violation!("set at index {} does not fit a heap of {}", allocation.starting_index, heap_len);
            }
            entries.push(SetEntry {
                heap: heap.clone(),
                starting_index: allocation.starting_index,
                slots: Arc::new(description.slots()),
            });
        }

        let keys: Vec<_> = entries.into_iter().map(|entry| registry.sets.insert(entry)).collect();
        if let Some(entry) = registry.storages.get_mut(storage) {
            entry.sets.extend(&keys);
        }
        Ok(keys)
    }

    fn write_descriptors(&self, set: DescriptorSetKey, writes: &[ResolvedWrite]) -> Result<()> {
        let registry = self.registry.lock();
        let Some(entry) = registry.sets.get(set) else {
            violation!("writing into a released descriptor set");
        };
        let resolved = writes
            .iter()
            .map(|w| Ok((entry.starting_index as usize + w.slot_index as usize, registry.resolve(&w.value)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut heap = entry.heap.lock();
        for (index, descriptor) in resolved {
            match heap.get_mut(index) {
                Some(slot) => *slot = Some(descriptor),
                None => violation!("descriptor index {} is outside the heap", index),
            }
        }
        Ok(())
    }

    fn create_render_pass(&self, desc: &RenderPassDescription) -> Result<RenderPassKey> {
        Ok(self.registry.lock().render_passes.insert(desc.clone()))
    }

    fn destroy_render_pass(&self, key: RenderPassKey) {
        self.registry.lock().render_passes.remove(key);
    }

    fn create_framebuffer(&self, render_pass: RenderPassKey, views: &[ImageViewKey], _width: u32, _height: u32) -> Result<FramebufferKey> {
        let mut registry = self.registry.lock();
        if !registry.render_passes.contains_key(render_pass) {
            violation!("framebuffer for a destroyed render pass");
        }
        Ok(registry.framebuffers.insert(views.to_vec()))
    }

    fn destroy_framebuffer(&self, key: FramebufferKey) {
        self.registry.lock().framebuffers.remove(key);
    }

    fn create_graphics_pipeline(
        &self,
        _desc: &GraphicsPipelineDescription,
        render_pass: RenderPassKey,
        layout: PipelineLayoutKey,
        _subpass: u32,
    ) -> Result<PipelineKey> {
        let mut registry = self.registry.lock();
        if !registry.render_passes.contains_key(render_pass) || !registry.pipeline_layouts.contains_key(layout) {
            violation!("graphics pipeline built against a destroyed render pass or layout");
        }
        Ok(registry.pipelines.insert(layout))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDescription, layout: PipelineLayoutKey) -> Result<PipelineKey> {
        if desc.shader.is_empty() {
            violation!("compute pipeline needs a non-empty shader");
        }
        let mut registry = self.registry.lock();
        if !registry.pipeline_layouts.contains_key(layout) {
            violation!("compute pipeline built against a destroyed layout");
        }
        Ok(registry.pipelines.insert(layout))
    }

    fn destroy_pipeline(&self, key: PipelineKey) {
        self.registry.lock().pipelines.remove(key);
    }

    fn create_command_storage(&self) -> Result<CommandStorageKey> {
        Ok(self.registry.lock().command_storages.insert(Vec::new()))
    }

    fn reset_command_storage(&self, key: CommandStorageKey) -> Result<()> {
        let mut registry = self.registry.lock();
        let Some(lists) = registry.command_storages.get(key).cloned() else {
            violation!("resetting a destroyed command list storage");
        };
        for list in lists {
            if let Some(ops) = registry.command_lists.get_mut(list) {
                *ops = None;
            }
        }
        Ok(())
    }

    fn destroy_command_storage(&self, key: CommandStorageKey) {
        let mut registry = self.registry.lock();
        if let Some(lists) = registry.command_storages.remove(key) {
            for list in lists {
                registry.command_lists.remove(list);
            }
        }
    }

    fn create_command_list(&self, storage: CommandStorageKey) -> Result<CommandListKey> {
        let mut registry = self.registry.lock();
        if !registry.command_storages.contains_key(storage) {
            violation!("allocating from a destroyed command list storage");
        }
        let key = registry.command_lists.insert(None);
        if let Some(lists) = registry.command_storages.get_mut(storage) {
            lists.push(key);
        }
        Ok(key)
    }

    fn destroy_command_list(&self, storage: CommandStorageKey, key: CommandListKey) {
        let mut registry = self.registry.lock();
        registry.command_lists.remove(key);
        if let Some(lists) = registry.command_storages.get_mut(storage) {
            lists.retain(|&list| list != key);
        }
    }

    fn reset_command_list(&self, key: CommandListKey) -> Result<()> {
        match self.registry.lock().command_lists.get_mut(key) {
            Some(ops) => {
                *ops = None;
                Ok(())
            }
            None => violation!("resetting a destroyed command list"),
        }
    }

    fn translate_command_list(&self, _storage: CommandStorageKey, key: CommandListKey, commands: &[Command]) -> Result<()> {
        let mut registry = self.registry.lock();
        let ops = translate(&registry, commands)?;
        log::debug!("software: translated {} commands into {} ops", commands.len(), ops.len());
        match registry.command_lists.get_mut(key) {
            Some(slot) => {
                *slot = Some(Arc::new(ops));
                Ok(())
            }
            None => violation!("translating a destroyed command list"),
        }
    }

    fn create_queue(&self) -> Result<QueueKey> {
        let mut queues = self.queues.lock();
        let name = format!("rhi-software-queue-{}", queues.len());
        let worker = Arc::new(QueueWorker::spawn(name, self.capture.clone())?);
        log::info!("Software queue created");
        Ok(queues.insert(worker))
    }

    fn submit(&self, queue: QueueKey, list: CommandListKey, sync: &ResolvedSync) -> Result<u64> {
        let worker = self.queue(queue)?;
        // Held across the hand-off so signals and waits pair in submission order
        let mut registry = self.registry.lock();
        let Some(Some(ops)) = registry.command_lists.get(list).cloned() else {
            violation!("submitting a command list that was never made executable");
        };
        let fence = match sync.fence {
            Some(key) => Some(registry.fences.get(key).cloned().context("submitting with a destroyed fence")?),
            None => None,
        };
        registry.check_signals(&sync.signal, &sync.wait)?;
        let waits = registry.consume_waits(&sync.wait)?;
        let serial = worker.submit(ops, fence, waits)?;
        registry.signal(&sync.signal, &worker.point(serial));
        Ok(serial)
    }

    fn is_complete(&self, queue: QueueKey, serial: u64) -> Result<bool> {
        Ok(self.queue(queue)?.completed() >= serial)
    }

    fn wait_queue_idle(&self, queue: QueueKey) -> Result<()> {
        self.queue(queue)?.wait_idle()
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceKey> {
        Ok(self.registry.lock().fences.insert(Arc::new(FenceState::new(signaled))))
    }

    fn wait_for_fence(&self, key: FenceKey, timeout_ns: u64) -> Result<bool> {
        Ok(self.fence(key)?.wait(Duration::from_nanos(timeout_ns)))
    }

    fn is_fence_signaled(&self, key: FenceKey) -> Result<bool> {
        Ok(self.fence(key)?.is_signaled())
    }

    fn reset_fence(&self, key: FenceKey) -> Result<()> {
        self.fence(key)?.reset();
        Ok(())
    }

    fn destroy_fence(&self, key: FenceKey) {
        self.registry.lock().fences.remove(key);
    }

    fn create_semaphore(&self) -> Result<SemaphoreKey> {
        Ok(self.registry.lock().semaphores.insert(None))
    }

    fn destroy_semaphore(&self, key: SemaphoreKey) {
        self.registry.lock().semaphores.remove(key);
    }

    fn create_swapchain(&self, target: &SurfaceTarget, width: u32, height: u32, _config: &RhiConfig) -> Result<SwapchainParts> {
        let format = match target {
            SurfaceTarget::Headless { format } => *format,
            SurfaceTarget::Window { .. } => unsupported!(BACKEND, "window surfaces; use SurfaceTarget::Headless"),
        };
        if format.is_depth() || format.is_compressed() {
            unsupported!(BACKEND, "{:?} back buffers", format);
        }

        let desc = ImageDesc {
            format,
            width,
            height,
            mip_count: 1,
            layer_count: 1,
            usage: ImageUsage::RENDER_TARGET | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
            clear_value: Some(ClearValue::Color([0.0, 0.0, 0.0, 1.0])),
        };
        let mut images = Vec::with_capacity(self.swapchain_images as usize);
        for _ in 0..self.swapchain_images {
            images.push((self.create_image(&desc)?, desc));
        }
        let key = self.registry.lock().swapchains.insert(SwapchainEntry {
            images: images.iter().map(|(key, _)| *key).collect(),
            next: 0,
        });
        log::info!("Headless swapchain created: {} images {}x{} {:?}", images.len(), width, height, format);
        Ok(SwapchainParts { key, images, format, extent: (width, height) })
    }

    fn acquire_next_image(&self, swapchain: SwapChainKey, signal: SemaphoreKey) -> Result<u32> {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.swapchains.get_mut(swapchain) else {
            violation!("acquiring from a destroyed swapchain");
        };
        let index = entry.next;
        entry.next = (entry.next + 1) % entry.images.len() as u32;
        // Acquisition is immediate; an unconsumed earlier signal just stays set.
        match registry.semaphores.get_mut(signal) {
            Some(pending) => {
                pending.get_or_insert(PendingSignal::Host);
            }
            None => violation!("acquiring with a destroyed semaphore"),
        }
        Ok(index)
    }

    fn present(&self, _queue: QueueKey, swapchain: SwapChainKey, _index: u32, wait: SemaphoreKey) -> Result<()> {
        let mut registry = self.registry.lock();
        if !registry.swapchains.contains_key(swapchain) {
            violation!("presenting a destroyed swapchain");
        }
        // Nothing reaches a screen; only the semaphore bookkeeping matters.
        if registry.semaphores.get(wait).is_some_and(Option::is_some) {
            registry.consume_waits(&[wait])?;
        }
        Ok(())
    }

    fn destroy_swapchain(&self, key: SwapChainKey) {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.swapchains.remove(key) {
            for image in entry.images {
                registry.images.remove(image);
            }
        }
    }

    fn take_draw_capture(&self) -> Option<DrawCapture> {
        let capture = self.capture.as_ref()?;
        Some(DrawCapture { calls: std::mem::take(&mut *capture.lock()) })
    }

    fn wait_idle(&self) -> Result<()> {
        let queues: Vec<_> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.wait_idle()?;
        }
        Ok(())
    }
}
