// =============================================================================
// DEVICE - The one entry point callers talk to
// =============================================================================
//
// Every public operation lands here. The device checks the caller's side of
// the contract on backend-agnostic data, then matches on its backend once
// and forwards the call.
//
// SUBMISSION FLOW:
// 1. Host checks (list state, storage generation, live sets, mappings)
// 2. Replay against the resource-state ledger (when state validation is on)
// 3. Backend submit
// 4. Ledger commit and bookkeeping on the list
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::backend::{with_backend, Backend, BackendImpl, ImageViewDesc, MappedBytes, SetAllocation};
use crate::capture::DrawCapture;
use crate::command::{CommandList, CommandListState, CommandListStorage, Recording, StorageShared, Ticket};
use crate::config::{BackendKind, RhiConfig};
use crate::descriptor::{
    AllocatedDescriptorSet, DescriptorCapacity, DescriptorSetDescription, DescriptorSetLayout, DescriptorStorage,
    DescriptorValue, ResolvedWrite, StorageBook, WriteValue,
};
use crate::error::{exhausted, violation};
use crate::format::Format;
use crate::keys::{BufferKey, DescriptorSetKey, DescriptorStorageKey};
use crate::pipeline::{
    ComputePipelineDescription, ComputePipelineState, GraphicsPipelineDescription, PipelineLayout, PipelineState,
};
use crate::queue::{CommandQueue, Fence, ResolvedSync, Semaphore, SubmitSync};
use crate::render_pass::{Framebuffer, FramebufferAttachment, RenderPass, RenderPassDescription};
use crate::resource::{
    Aspect, Buffer, BufferDesc, BufferUsage, BufferView, ClearValue, Image, ImageDesc, ImageUsage, ImageView,
    ImageViewRange, ImageViewType, MemoryPool, ResourceState, Sampler, SamplerType,
};
use crate::swapchain::{SurfaceTarget, SwapChain};
use crate::validation::StateLedger;

/// Constant and storage buffer descriptors must start on this boundary.
pub const BUFFER_DESCRIPTOR_ALIGNMENT: u64 = 256;

/// A logical device on one backend.
pub struct Device {
    backend: BackendImpl,
    config: RhiConfig,
    ledger: Option<Mutex<StateLedger>>,
    mapped: Mutex<HashSet<BufferKey>>,
    live_sets: Mutex<HashMap<DescriptorSetKey, DescriptorStorageKey>>,
}

/// Host mapping of a buffer. Unmaps on drop.
pub struct MappedBuffer<'a> {
    device: &'a Device,
    buffer: BufferKey,
    bytes: Option<MappedBytes>,
    _buffer: PhantomData<&'a Buffer>,
}

impl MappedBuffer<'_> {
    /// Copy the mapped bytes out as `T`s; the mapping need not be aligned.
    pub fn read_as<T: bytemuck::Pod>(&self) -> Vec<T> {
        self.chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    /// Write `data` at byte `offset`.
    pub fn write_at<T: bytemuck::Pod>(&mut self, offset: usize, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let len = self.len();
        let end = offset.checked_add(bytes.len());
        let Some(target) = end.and_then(|end| self.get_mut(offset..end)) else {
            violation!("write of {} bytes at {} overruns a {} byte mapping", bytes.len(), offset, len);
        };
        target.copy_from_slice(bytes);
        Ok(())
    }
}

impl Deref for MappedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.bytes.as_ref() {
            Some(bytes) => bytes.as_slice(),
            None => &[],
        }
    }
}

impl DerefMut for MappedBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.bytes.as_mut() {
            Some(bytes) => bytes.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            with_backend!(&self.device.backend, b => b.unmap_buffer(self.buffer, bytes));
        }
        self.device.mapped.lock().remove(&self.buffer);
    }
}

impl Device {
    /// Headless device on the configured backend.
    pub fn new(config: &RhiConfig) -> Result<Self> {
        Self::with_target(config, None)
    }

    fn with_target(config: &RhiConfig, target: Option<&SurfaceTarget>) -> Result<Self> {
        let backend = BackendImpl::new(config, target)
            .with_context(|| format!("Failed to create the {} device", config.device.backend.name()))?;
        log::info!(
            "Device created on the {} backend (state validation: {})",
            config.device.backend.name(),
            config.debug.state_validation
        );
        Ok(Self {
            backend,
            config: config.clone(),
            ledger: config.debug.state_validation.then(|| Mutex::new(StateLedger::default())),
            mapped: Mutex::new(HashSet::new()),
            live_sets: Mutex::new(HashMap::new()),
        })
    }

    /// Device, swap chain and a queue able to present to it, in one go.
    pub fn create_device_swapchain_and_graphic_presentable_queue(
        config: &RhiConfig,
        target: SurfaceTarget,
        width: u32,
        height: u32,
    ) -> Result<(Device, SwapChain, CommandQueue)> {
        if width == 0 || height == 0 {
            violation!("swapchain extent {}x{} is empty", width, height);
        }
        let device = Self::with_target(config, Some(&target))?;

        // Step 1: Native swapchain and its back buffers
        let parts = with_backend!(&device.backend, b => b.create_swapchain(&target, width, height, config))?;

        // Step 2: Back buffers start out presentable
        if let Some(ledger) = &device.ledger {
            let mut ledger = ledger.lock();
            for (key, desc) in &parts.images {
                ledger.register_image(*key, desc, ResourceState::Present);
            }
        }
        let images: Vec<Image> = parts.images.iter().map(|(key, desc)| Image { key: *key, desc: *desc }).collect();

        // Step 3: Acquire/present semaphores and the presentable queue
        let image_available = device.create_semaphore()?;
        let render_finished = device.create_semaphore()?;
        let queue_key = with_backend!(&device.backend, b => b.create_queue())?;

        let swapchain = SwapChain {
            key: parts.key,
            acquired: Mutex::new(vec![false; images.len()]),
            images,
            format: parts.format,
            extent: parts.extent,
            image_available,
            render_finished,
        };
        let queue = CommandQueue { key: queue_key, presentable: true };
        Ok((device, swapchain, queue))
    }

    pub fn backend(&self) -> BackendKind {
        with_backend!(&self.backend, b => b.kind())
    }

    pub fn config(&self) -> &RhiConfig {
        &self.config
    }

    /// Draws and dispatches executed since the last call. `None` on backends
    /// that run real shaders.
    pub fn take_draw_capture(&self) -> Option<DrawCapture> {
        with_backend!(&self.backend, b => b.take_draw_capture())
    }

    /// Block until every queue is idle.
    pub fn wait_idle(&self) -> Result<()> {
        with_backend!(&self.backend, b => b.wait_idle())
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    pub fn create_buffer(&self, size: u64, memory_pool: MemoryPool, usage: BufferUsage) -> Result<Buffer> {
        if size == 0 {
            violation!("buffers cannot be empty");
        }
        let desc = BufferDesc { size, memory_pool, usage };
        let key = with_backend!(&self.backend, b => b.create_buffer(&desc))?;
        Ok(Buffer { key, desc })
    }

    pub fn destroy_buffer(&self, buffer: Buffer) {
        with_backend!(&self.backend, b => b.destroy_buffer(buffer.key));
    }

    /// Map a host-visible buffer. At most one mapping per buffer may be
    /// outstanding, and lists touching a mapped buffer cannot be submitted.
    pub fn map_buffer<'a>(&'a self, buffer: &'a Buffer) -> Result<MappedBuffer<'a>> {
        if !buffer.memory_pool().is_host_visible() {
            violation!("device-local buffers cannot be mapped");
        }
        if !self.mapped.lock().insert(buffer.key) {
            violation!("buffer is already mapped");
        }
        match with_backend!(&self.backend, b => b.map_buffer(buffer.key)) {
            Ok(bytes) => Ok(MappedBuffer { device: self, buffer: buffer.key, bytes: Some(bytes), _buffer: PhantomData }),
            Err(err) => {
                self.mapped.lock().remove(&buffer.key);
                Err(err)
            }
        }
    }

    pub fn unmap_buffer(&self, mapped: MappedBuffer<'_>) {
        drop(mapped);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_image(
        &self,
        format: Format,
        width: u32,
        height: u32,
        mip_count: u32,
        layer_count: u32,
        usage: ImageUsage,
        clear_value: Option<ClearValue>,
    ) -> Result<Image> {
        let desc = ImageDesc { format, width, height, mip_count, layer_count, usage, clear_value };
        validate_image_desc(&desc)?;
        let key = with_backend!(&self.backend, b => b.create_image(&desc))?;
        if let Some(ledger) = &self.ledger {
            ledger.lock().register_image(key, &desc, ResourceState::Undefined);
        }
        Ok(Image { key, desc })
    }

    pub fn destroy_image(&self, image: Image) {
        if let Some(ledger) = &self.ledger {
            ledger.lock().forget_image(image.key);
        }
        with_backend!(&self.backend, b => b.destroy_image(image.key));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_image_view<'a>(
        &self,
        image: &'a Image,
        format: Format,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
        view_type: ImageViewType,
        aspect: Aspect,
    ) -> Result<ImageView<'a>> {
        let desc = image.desc();
        let range = ImageViewRange { base_mip, mip_count, base_layer, layer_count };
        if format != desc.format {
            violation!("view format {:?} differs from image format {:?}", format, desc.format);
        }
        if mip_count == 0 || layer_count == 0 {
            violation!("image views must cover at least one mip and one layer");
        }
        if base_mip as u64 + mip_count as u64 > desc.mip_count as u64
            || base_layer as u64 + layer_count as u64 > desc.layer_count as u64
        {
            violation!(
                "view range mips {}+{} layers {}+{} exceeds an image of {} mips and {} layers",
                base_mip,
                mip_count,
                base_layer,
                layer_count,
                desc.mip_count,
                desc.layer_count
            );
        }
        if !format.supports_aspect(aspect) {
            violation!("aspect {:?} does not exist in format {:?}", aspect, format);
        }
        match view_type {
            ImageViewType::D2 if layer_count != 1 => violation!("2D views cover exactly one layer"),
            ImageViewType::Cube | ImageViewType::CubeArray => {
                if !desc.usage.contains(ImageUsage::CUBE_COMPATIBLE) {
                    violation!("cube views need a CUBE_COMPATIBLE image");
                }
                if layer_count % 6 != 0 || (view_type == ImageViewType::Cube && layer_count != 6) {
                    violation!("{:?} views need 6 layers per cube, got {}", view_type, layer_count);
                }
            }
            _ => {}
        }

        let view_desc = ImageViewDesc { format, range, view_type, aspect };
        let key = with_backend!(&self.backend, b => b.create_image_view(image.key, &view_desc))?;
        Ok(ImageView {
            key,
            image: image.key,
            image_desc: *desc,
            format,
            range,
            view_type,
            aspect,
            _image: PhantomData,
        })
    }

    pub fn destroy_image_view(&self, view: ImageView<'_>) {
        with_backend!(&self.backend, b => b.destroy_image_view(view.key));
    }

    pub fn create_buffer_view<'a>(&self, buffer: &'a Buffer, format: Format, offset: u64, size: u64) -> Result<BufferView<'a>> {
        if !buffer.usage().intersects(BufferUsage::UNIFORM_TEXEL | BufferUsage::STORAGE_TEXEL) {
            violation!("buffer views need UNIFORM_TEXEL or STORAGE_TEXEL usage");
        }
        if format.is_depth() || format.is_compressed() {
            violation!("{:?} is not a texel buffer format", format);
        }
        let block = format.block_size() as u64;
        if size == 0 || size % block != 0 || offset % block != 0 {
            violation!("buffer view {}+{} is empty or not a whole number of {:?} texels", offset, size, format);
        }
        match offset.checked_add(size) {
            Some(end) if end <= buffer.size() => {}
            _ => violation!("buffer view {}+{} exceeds {} bytes", offset, size, buffer.size()),
        }
        let key = with_backend!(&self.backend, b => b.create_buffer_view(buffer.key, format, offset, size))?;
        Ok(BufferView {
            key,
            buffer: buffer.key,
            buffer_usage: buffer.usage(),
            format,
            offset,
            size,
            _buffer: PhantomData,
        })
    }

    pub fn destroy_buffer_view(&self, view: BufferView<'_>) {
        with_backend!(&self.backend, b => b.destroy_buffer_view(view.key));
    }

    pub fn create_sampler(&self, sampler_type: SamplerType) -> Result<Sampler> {
        let key = with_backend!(&self.backend, b => b.create_sampler(sampler_type))?;
        Ok(Sampler { key, sampler_type })
    }

    pub fn destroy_sampler(&self, sampler: Sampler) {
        with_backend!(&self.backend, b => b.destroy_sampler(sampler.key));
    }

    // =========================================================================
    // DESCRIPTORS
    // =========================================================================

    pub fn create_descriptor_set_layout(&self, description: &DescriptorSetDescription) -> Result<DescriptorSetLayout> {
        description.validate()?;
        let key = with_backend!(&self.backend, b => b.create_set_layout(description))?;
        Ok(DescriptorSetLayout { key, description: description.clone(), slots: description.slots() })
    }

    pub fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayout) {
        with_backend!(&self.backend, b => b.destroy_set_layout(layout.key));
    }

    pub fn create_descriptor_storage(&self, max_sets: u32, capacities: &[DescriptorCapacity]) -> Result<DescriptorStorage> {
        if max_sets == 0 {
            violation!("descriptor storage must hold at least one set");
        }
        if capacities.iter().all(|c| c.count == 0) {
            violation!("descriptor storage declares no descriptors");
        }
        let key = with_backend!(&self.backend, b => b.create_descriptor_storage(max_sets, capacities))?;
        Ok(DescriptorStorage {
            key,
            capacities: capacities.to_vec(),
            book: Mutex::new(StorageBook::new(max_sets, capacities)),
        })
    }

    /// Release every set of `storage`. Taking `&mut` proves no set is alive.
    pub fn reset_descriptor_storage(&self, storage: &mut DescriptorStorage) -> Result<()> {
        with_backend!(&self.backend, b => b.reset_descriptor_storage(storage.key))?;
        storage.book.lock().reset();
        self.live_sets.lock().retain(|_, owner| *owner != storage.key);
        Ok(())
    }

    pub fn destroy_descriptor_storage(&self, storage: DescriptorStorage) {
        self.live_sets.lock().retain(|_, owner| *owner != storage.key);
        with_backend!(&self.backend, b => b.destroy_descriptor_storage(storage.key));
    }

    pub fn allocate_descriptor_set<'s>(
        &self,
        storage: &'s DescriptorStorage,
        starting_index: u32,
        layout: &DescriptorSetLayout,
    ) -> Result<AllocatedDescriptorSet<'s>> {
        let mut sets = self.allocate_descriptor_sets(storage, starting_index, &[layout])?;
        sets.pop().context("descriptor allocation returned no set")
    }

    /// Carve consecutive sets starting at `starting_index`. Either every set
    /// is allocated or none is.
    pub fn allocate_descriptor_sets<'s>(
        &self,
        storage: &'s DescriptorStorage,
        starting_index: u32,
        layouts: &[&DescriptorSetLayout],
    ) -> Result<Vec<AllocatedDescriptorSet<'s>>> {
        if layouts.is_empty() {
            violation!("allocate_descriptor_sets with no layout");
        }
        let mut book = storage.book.lock();
        let mut planned = book.clone();
        let starts = planned.reserve(starting_index, layouts)?;

        let allocations: Vec<_> = layouts
            .iter()
            .zip(&starts)
            .map(|(layout, &start)| SetAllocation {
                layout: layout.key,
                starting_index: start,
                slot_count: layout.descriptor_count(),
            })
            .collect();
        let keys = with_backend!(&self.backend, b => b.allocate_descriptor_sets(storage.key, &allocations))?;
        *book = planned;

        let mut live = self.live_sets.lock();
        Ok(layouts
            .iter()
            .zip(starts)
            .zip(keys)
            .map(|((layout, starting_index), key)| {
                live.insert(key, storage.key);
                AllocatedDescriptorSet {
                    key,
                    storage: storage.key,
                    layout: layout.key,
                    description: layout.description.clone(),
                    starting_index,
                    slots: layout.slots.clone(),
                    contents: Mutex::new(vec![None; layout.slots.len()]),
                    _storage: PhantomData,
                }
            })
            .collect())
    }

    /// Write an ordered list of (slot, value) pairs. Every pair is checked
    /// against the set's layout before anything is written.
    pub fn update_descriptor_set(&self, set: &AllocatedDescriptorSet<'_>, writes: &[(u32, DescriptorValue<'_>)]) -> Result<()> {
        let mut resolved = Vec::with_capacity(writes.len());
        for (slot_index, value) in writes {
            let slot = set.slot(*slot_index)?;
            if value.kind() != slot.kind {
                violation!(
                    "slot {} (binding {}) holds {:?} descriptors, got {:?}",
                    slot_index,
                    slot.binding,
                    slot.kind,
                    value.kind()
                );
            }
            resolved.push(ResolvedWrite { slot_index: *slot_index, slot, value: resolve_write(value)? });
        }
        with_backend!(&self.backend, b => b.write_descriptors(set.key, &resolved))?;
        for write in resolved {
            set.record_write(write.slot_index, write.value);
        }
        Ok(())
    }

    pub fn set_constant_buffer_view(&self, set: &AllocatedDescriptorSet<'_>, slot: u32, buffer: &Buffer, offset: u64, size: u64) -> Result<()> {
        self.update_descriptor_set(set, &[(slot, DescriptorValue::ConstantBuffer { buffer, offset, size })])
    }

    pub fn set_image_view(&self, set: &AllocatedDescriptorSet<'_>, slot: u32, view: &ImageView<'_>) -> Result<()> {
        self.update_descriptor_set(set, &[(slot, DescriptorValue::SampledImage(view))])
    }

    pub fn set_input_attachment(&self, set: &AllocatedDescriptorSet<'_>, slot: u32, view: &ImageView<'_>) -> Result<()> {
        self.update_descriptor_set(set, &[(slot, DescriptorValue::InputAttachment(view))])
    }

    pub fn set_uav_buffer_view(&self, set: &AllocatedDescriptorSet<'_>, slot: u32, buffer: &Buffer, offset: u64, size: u64) -> Result<()> {
        self.update_descriptor_set(set, &[(slot, DescriptorValue::StorageBuffer { buffer, offset, size })])
    }

    pub fn set_uav_image_view(&self, set: &AllocatedDescriptorSet<'_>, slot: u32, view: &ImageView<'_>) -> Result<()> {
        self.update_descriptor_set(set, &[(slot, DescriptorValue::StorageImage(view))])
    }

    pub fn set_sampler(&self, set: &AllocatedDescriptorSet<'_>, slot: u32, sampler: &Sampler) -> Result<()> {
        self.update_descriptor_set(set, &[(slot, DescriptorValue::Sampler(sampler))])
    }

    pub fn set_uniform_texel_buffer_view(&self, set: &AllocatedDescriptorSet<'_>, slot: u32, view: &BufferView<'_>) -> Result<()> {
        self.update_descriptor_set(set, &[(slot, DescriptorValue::UniformTexelBuffer(view))])
    }

    // =========================================================================
    // PIPELINES AND RENDER PASSES
    // =========================================================================

    pub fn create_pipeline_layout(&self, sets: &[&DescriptorSetLayout]) -> Result<PipelineLayout> {
        let keys: Vec<_> = sets.iter().map(|s| s.key).collect();
        let key = with_backend!(&self.backend, b => b.create_pipeline_layout(&keys))?;
        Ok(PipelineLayout { key, sets: sets.iter().map(|s| s.description.clone()).collect() })
    }

    pub fn destroy_pipeline_layout(&self, layout: PipelineLayout) {
        with_backend!(&self.backend, b => b.destroy_pipeline_layout(layout.key));
    }

    pub fn create_render_pass(&self, description: &RenderPassDescription) -> Result<RenderPass> {
        description.validate()?;
        let key = with_backend!(&self.backend, b => b.create_render_pass(description))?;
        Ok(RenderPass { key, description: description.clone() })
    }

    pub fn destroy_render_pass(&self, render_pass: RenderPass) {
        with_backend!(&self.backend, b => b.destroy_render_pass(render_pass.key));
    }

    /// Bind one single-mip, single-layer view per attachment of `render_pass`.
    pub fn create_framebuffer<'a>(
        &self,
        render_pass: &RenderPass,
        views: &[&'a ImageView<'a>],
        width: u32,
        height: u32,
    ) -> Result<Framebuffer<'a>> {
        let descs = &render_pass.description.attachments;
        if views.len() != descs.len() {
            violation!("{} views given for a render pass of {} attachments", views.len(), descs.len());
        }
        if width == 0 || height == 0 {
            violation!("framebuffer extent {}x{} is empty", width, height);
        }
        let inputs: HashSet<u32> = render_pass
            .description
            .subpasses
            .iter()
            .flat_map(|s| s.input.iter().copied())
            .collect();

        let mut attachments = Vec::with_capacity(views.len());
        for (index, (view, desc)) in views.iter().zip(descs).enumerate() {
            if view.format != desc.format {
                violation!("attachment {} expects {:?} but the view is {:?}", index, desc.format, view.format);
            }
            if view.range.mip_count != 1 || view.range.layer_count != 1 {
                violation!("attachment {} view must cover a single mip and layer", index);
            }
            let (w, h) = view.extent();
            if w < width || h < height {
                violation!("attachment {} is {}x{}, smaller than the {}x{} framebuffer", index, w, h, width, height);
            }
            let needed = if desc.format.is_depth() { ImageUsage::DEPTH_STENCIL } else { ImageUsage::RENDER_TARGET };
            if !view.image_usage().contains(needed) {
                violation!("attachment {} image lacks {:?} usage", index, needed);
            }
            if inputs.contains(&(index as u32)) && !view.image_usage().contains(ImageUsage::INPUT_ATTACHMENT) {
                violation!("attachment {} is read as an input attachment but lacks INPUT_ATTACHMENT usage", index);
            }
            attachments.push(FramebufferAttachment {
                view: view.key,
                image: view.image,
                format: view.format,
                aspect: view.aspect,
                subresources: view.range.subresources().collect(),
                clear_value: view.image_desc.clear_value,
            });
        }

        let view_keys: Vec<_> = views.iter().map(|v| v.key).collect();
        let key = with_backend!(&self.backend, b => b.create_framebuffer(render_pass.key, &view_keys, width, height))?;
        Ok(Framebuffer { key, render_pass: render_pass.key, width, height, attachments, _views: PhantomData })
    }

    pub fn destroy_framebuffer(&self, framebuffer: Framebuffer<'_>) {
        with_backend!(&self.backend, b => b.destroy_framebuffer(framebuffer.key));
    }

    pub fn create_graphic_pso(
        &self,
        description: &GraphicsPipelineDescription,
        render_pass: &RenderPass,
        layout: &PipelineLayout,
        subpass: u32,
    ) -> Result<PipelineState> {
        description.validate(render_pass, subpass)?;
        let key = with_backend!(&self.backend, b => b.create_graphics_pipeline(description, render_pass.key, layout.key, subpass))?;
        Ok(PipelineState {
            key,
            layout: layout.key,
            render_pass: render_pass.key,
            subpass,
            vertex_bindings: description.vertex_bindings.clone(),
            topology: description.topology,
        })
    }

    pub fn destroy_graphic_pso(&self, pipeline: PipelineState) {
        with_backend!(&self.backend, b => b.destroy_pipeline(pipeline.key));
    }

    pub fn create_compute_pso(&self, description: &ComputePipelineDescription, layout: &PipelineLayout) -> Result<ComputePipelineState> {
        let key = with_backend!(&self.backend, b => b.create_compute_pipeline(description, layout.key))?;
        Ok(ComputePipelineState { key, layout: layout.key })
    }

    pub fn destroy_compute_pso(&self, pipeline: ComputePipelineState) {
        with_backend!(&self.backend, b => b.destroy_pipeline(pipeline.key));
    }

    // =========================================================================
    // COMMAND LISTS
    // =========================================================================

    pub fn create_command_list_storage(&self) -> Result<CommandListStorage> {
        let key = with_backend!(&self.backend, b => b.create_command_storage())?;
        Ok(CommandListStorage {
            key,
            shared: Arc::new(StorageShared::new(self.config.limits.max_command_lists_per_storage)),
        })
    }

    /// Recycle the memory of every list from `storage`. Lists recorded
    /// before the reset must be re-recorded before their next submission.
    pub fn reset_command_list_storage(&self, storage: &CommandListStorage) -> Result<()> {
        self.check_storage_idle(&storage.shared)?;
        with_backend!(&self.backend, b => b.reset_command_storage(storage.key))?;
        storage.shared.tickets.lock().clear();
        storage.shared.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Destroy a storage. Every list allocated from it must be destroyed
    /// first.
    pub fn destroy_command_list_storage(&self, storage: CommandListStorage) -> Result<()> {
        let live = storage.list_count();
        if live != 0 {
            violation!("command list storage destroyed while {} lists from it are alive", live);
        }
        self.check_storage_idle(&storage.shared)?;
        with_backend!(&self.backend, b => b.destroy_command_storage(storage.key));
        Ok(())
    }

    pub fn create_command_list(&self, storage: &CommandListStorage) -> Result<CommandList> {
        let shared = &storage.shared;
        if shared.live_lists.load(Ordering::Acquire) >= shared.max_lists {
            exhausted!("command list storage is limited to {} lists", shared.max_lists);
        }
        let key = with_backend!(&self.backend, b => b.create_command_list(storage.key))?;
        shared.live_lists.fetch_add(1, Ordering::AcqRel);
        Ok(CommandList {
            key,
            storage: storage.key,
            shared: shared.clone(),
            state: CommandListState::Initial,
            ticket: None,
            generation: shared.generation(),
            rec: Recording::default(),
        })
    }

    pub fn destroy_command_list(&self, mut list: CommandList) -> Result<()> {
        self.refresh(&mut list)?;
        if list.state == CommandListState::Submitted {
            violation!("command list destroyed while the GPU still executes it");
        }
        // The slot is released when `list` drops here
        with_backend!(&self.backend, b => b.destroy_command_list(list.storage, list.key));
        Ok(())
    }

    /// `Initial`, `Executable` or completed `Submitted` -> `Recording`.
    pub fn start_command_list_recording(&self, list: &mut CommandList, storage: &CommandListStorage) -> Result<()> {
        if list.storage != storage.key {
            violation!("command list was not allocated from this storage");
        }
        self.refresh(list)?;
        match list.state {
            CommandListState::Recording => violation!("command list is already recording"),
            CommandListState::Submitted => violation!("command list is still executing"),
            CommandListState::Initial | CommandListState::Executable => {}
        }
        with_backend!(&self.backend, b => b.reset_command_list(list.key))?;
        list.rec = Recording::default();
        list.ticket = None;
        list.generation = storage.shared.generation();
        list.state = CommandListState::Recording;
        Ok(())
    }

    /// Close the recording and translate it for the backend.
    pub fn make_command_list_executable(&self, list: &mut CommandList) -> Result<()> {
        if list.state != CommandListState::Recording {
            violation!("make_command_list_executable on a list in state {:?}", list.state);
        }
        if list.rec.in_render_pass() {
            violation!("command list closed with a render pass still open");
        }
        with_backend!(&self.backend, b => b.translate_command_list(list.storage, list.key, &list.rec.commands))?;
        list.state = CommandListState::Executable;
        Ok(())
    }

    /// Back to `Initial`, once the GPU is done with the list.
    pub fn reset_command_list(&self, list: &mut CommandList) -> Result<()> {
        self.refresh(list)?;
        if list.state == CommandListState::Submitted {
            violation!("command list reset while the GPU still executes it");
        }
        with_backend!(&self.backend, b => b.reset_command_list(list.key))?;
        list.rec = Recording::default();
        list.ticket = None;
        list.state = CommandListState::Initial;
        Ok(())
    }

    pub fn submit_executable_command_list(&self, queue: &CommandQueue, list: &mut CommandList) -> Result<()> {
        self.submit_executable_command_list_with(queue, list, SubmitSync::default())
    }

    /// Submit with explicit semaphores and an optional fence.
    pub fn submit_executable_command_list_with(
        &self,
        queue: &CommandQueue,
        list: &mut CommandList,
        sync: SubmitSync<'_>,
    ) -> Result<()> {
        self.refresh(list)?;
        if list.state != CommandListState::Executable {
            violation!("only executable command lists can be submitted, this one is {:?}", list.state);
        }
        if list.generation != list.shared.generation() {
            violation!("command list storage was reset after this list was recorded");
        }
        {
            let live = self.live_sets.lock();
            if list.rec.sets.iter().any(|set| !live.contains_key(set)) {
                violation!("command list binds a descriptor set whose storage was reset or destroyed");
            }
        }
        {
            let mapped = self.mapped.lock();
            if list.rec.buffers.iter().any(|buffer| mapped.contains(buffer)) {
                violation!("command list references a buffer that is currently mapped");
            }
        }

        let sync = ResolvedSync::from(&sync);
        let serial = match &self.ledger {
            Some(ledger) => {
                // Held across the backend call so ledger order is submission order.
                let mut ledger = ledger.lock();
                let overlay = ledger.replay(&list.rec.commands)?;
                let serial = with_backend!(&self.backend, b => b.submit(queue.key, list.key, &sync))?;
                ledger.commit(overlay);
                serial
            }
            None => with_backend!(&self.backend, b => b.submit(queue.key, list.key, &sync))?,
        };

        let ticket = Ticket { queue: queue.key, serial };
        let mut tickets = list.shared.tickets.lock();
        tickets.retain(|t| !self.is_complete(*t).unwrap_or(false));
        tickets.push(ticket);
        list.ticket = Some(ticket);
        list.state = CommandListState::Submitted;
        Ok(())
    }

    pub fn create_graphic_command_queue(&self) -> Result<CommandQueue> {
        let key = with_backend!(&self.backend, b => b.create_queue())?;
        Ok(CommandQueue { key, presentable: false })
    }

    /// Block until everything submitted to `queue` finished.
    pub fn wait_for_command_queue_idle(&self, queue: &CommandQueue) -> Result<()> {
        with_backend!(&self.backend, b => b.wait_queue_idle(queue.key))
    }

    /// A submitted list whose work completed becomes `Executable` again.
    fn refresh(&self, list: &mut CommandList) -> Result<()> {
        if list.state != CommandListState::Submitted {
            return Ok(());
        }
        let Some(ticket) = list.ticket else {
            return Ok(());
        };
        if self.is_complete(ticket)? {
            list.state = CommandListState::Executable;
        }
        Ok(())
    }

    fn is_complete(&self, ticket: Ticket) -> Result<bool> {
        with_backend!(&self.backend, b => b.is_complete(ticket.queue, ticket.serial))
    }

    fn check_storage_idle(&self, shared: &StorageShared) -> Result<()> {
        let tickets = shared.tickets.lock();
        for ticket in tickets.iter() {
            if !self.is_complete(*ticket)? {
                violation!("command list storage still has lists in flight");
            }
        }
        Ok(())
    }

    // =========================================================================
    // SYNCHRONIZATION
    // =========================================================================

    pub fn create_fence(&self, signaled: bool) -> Result<Fence> {
        let key = with_backend!(&self.backend, b => b.create_fence(signaled))?;
        Ok(Fence { key })
    }

    /// Wait up to `timeout`; returns whether the fence was signalled.
    pub fn wait_for_fence(&self, fence: &Fence, timeout: Duration) -> Result<bool> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        with_backend!(&self.backend, b => b.wait_for_fence(fence.key, timeout_ns))
    }

    pub fn is_fence_signaled(&self, fence: &Fence) -> Result<bool> {
        with_backend!(&self.backend, b => b.is_fence_signaled(fence.key))
    }

    pub fn reset_fence(&self, fence: &Fence) -> Result<()> {
        with_backend!(&self.backend, b => b.reset_fence(fence.key))
    }

    pub fn destroy_fence(&self, fence: Fence) {
        with_backend!(&self.backend, b => b.destroy_fence(fence.key));
    }

    pub fn create_semaphore(&self) -> Result<Semaphore> {
        let key = with_backend!(&self.backend, b => b.create_semaphore())?;
        Ok(Semaphore { key })
    }

    pub fn destroy_semaphore(&self, semaphore: Semaphore) {
        with_backend!(&self.backend, b => b.destroy_semaphore(semaphore.key));
    }

    // =========================================================================
    // PRESENTATION
    // =========================================================================

    /// Acquire the next back buffer. Its readiness is signalled on
    /// `swapchain.image_available()`.
    pub fn get_next_backbuffer_id(&self, swapchain: &SwapChain) -> Result<u32> {
        let index =
            with_backend!(&self.backend, b => b.acquire_next_image(swapchain.key, swapchain.image_available.key))?;
        swapchain.mark_acquired(index)?;
        Ok(index)
    }

    /// Present an acquired back buffer, waiting on
    /// `swapchain.render_finished()` if a submission signalled it.
    pub fn present(&self, queue: &CommandQueue, swapchain: &SwapChain, backbuffer_index: u32) -> Result<()> {
        if !queue.presentable {
            violation!("queue was not created for presentation");
        }
        let Some(image) = swapchain.image(backbuffer_index) else {
            violation!("back buffer index {} out of range", backbuffer_index);
        };
        if let Some(ledger) = &self.ledger {
            ledger.lock().check_present(image.key)?;
        }
        swapchain.release(backbuffer_index)?;
        with_backend!(&self.backend, b => b.present(queue.key, swapchain.key, backbuffer_index, swapchain.render_finished.key))
    }

    pub fn destroy_swapchain(&self, swapchain: SwapChain) -> Result<()> {
        self.wait_idle()?;
        if let Some(ledger) = &self.ledger {
            let mut ledger = ledger.lock();
            for image in &swapchain.images {
                ledger.forget_image(image.key);
            }
        }
        with_backend!(&self.backend, b => b.destroy_swapchain(swapchain.key));
        self.destroy_semaphore(swapchain.image_available);
        self.destroy_semaphore(swapchain.render_finished);
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            log::error!("Device dropped with failed work pending: {:#}", err);
        }
        log::info!("Device destroyed");
    }
}

fn validate_image_desc(desc: &ImageDesc) -> Result<()> {
    let format = desc.format;
    if desc.width == 0 || desc.height == 0 || desc.mip_count == 0 || desc.layer_count == 0 {
        violation!(
            "image {}x{} with {} mips and {} layers is empty",
            desc.width,
            desc.height,
            desc.mip_count,
            desc.layer_count
        );
    }
    if desc.usage.is_empty() {
        violation!("images need at least one usage flag");
    }
    let max_mips = ImageDesc::max_mip_count(desc.width, desc.height);
    if desc.mip_count > max_mips {
        violation!("{} mips requested but a {}x{} chain has {}", desc.mip_count, desc.width, desc.height, max_mips);
    }
    if desc.usage.contains(ImageUsage::CUBE_COMPATIBLE) && (desc.layer_count % 6 != 0 || desc.width != desc.height) {
        violation!("cube-compatible images need square faces and a multiple of 6 layers");
    }
    if format.is_compressed() {
        if desc.usage.intersects(ImageUsage::RENDER_TARGET | ImageUsage::DEPTH_STENCIL | ImageUsage::STORAGE) {
            violation!("block-compressed {:?} cannot be an attachment or storage image", format);
        }
        if desc.width % 4 != 0 || desc.height % 4 != 0 {
            violation!("block-compressed images need 4-aligned extents, got {}x{}", desc.width, desc.height);
        }
    }
    if format.is_depth() && desc.usage.intersects(ImageUsage::RENDER_TARGET | ImageUsage::STORAGE) {
        violation!("depth format {:?} cannot be a colour target or storage image", format);
    }
    if !format.is_depth() && desc.usage.contains(ImageUsage::DEPTH_STENCIL) {
        violation!("DEPTH_STENCIL usage needs a depth format, got {:?}", format);
    }
    let attachment = desc.usage.intersects(ImageUsage::RENDER_TARGET | ImageUsage::DEPTH_STENCIL);
    match desc.clear_value {
        None if attachment => violation!("render-target and depth-stencil images need a clear value"),
        Some(value) if value.is_depth_stencil() != format.is_depth() => {
            violation!("clear value kind does not match format {:?}", format)
        }
        _ => Ok(()),
    }
}

fn resolve_write(value: &DescriptorValue<'_>) -> Result<WriteValue> {
    let buffer_write = |buffer: &Buffer, offset: u64, size: u64, usage: BufferUsage| -> Result<WriteValue> {
        if !buffer.usage().contains(usage) {
            violation!("buffer descriptor needs {:?} usage", usage);
        }
        if size == 0 || offset % BUFFER_DESCRIPTOR_ALIGNMENT != 0 {
            violation!(
                "buffer descriptor range {}+{} is empty or not {}-byte aligned",
                offset,
                size,
                BUFFER_DESCRIPTOR_ALIGNMENT
            );
        }
        match offset.checked_add(size) {
            Some(end) if end <= buffer.size() => Ok(WriteValue::Buffer { key: buffer.key, offset, size }),
            _ => violation!("buffer descriptor range {}+{} exceeds {} bytes", offset, size, buffer.size()),
        }
    };
    let image_write = |view: &ImageView<'_>, usage: ImageUsage| -> Result<WriteValue> {
        if !view.image_usage().contains(usage) {
            violation!("image descriptor needs {:?} usage", usage);
        }
        if view.aspect == Aspect::DepthStencil {
            violation!("image descriptors read a single aspect");
        }
        Ok(WriteValue::Image { key: view.key })
    };

    match *value {
        DescriptorValue::ConstantBuffer { buffer, offset, size } => buffer_write(buffer, offset, size, BufferUsage::UNIFORM),
        DescriptorValue::StorageBuffer { buffer, offset, size } => buffer_write(buffer, offset, size, BufferUsage::STORAGE),
        DescriptorValue::SampledImage(view) => image_write(view, ImageUsage::SAMPLED),
        DescriptorValue::InputAttachment(view) => image_write(view, ImageUsage::INPUT_ATTACHMENT),
        DescriptorValue::StorageImage(view) => {
            if view.range.mip_count != 1 {
                violation!("storage image views must cover a single mip");
            }
            image_write(view, ImageUsage::STORAGE)
        }
        DescriptorValue::Sampler(sampler) => Ok(WriteValue::Sampler { key: sampler.key }),
        DescriptorValue::UniformTexelBuffer(view) => {
            if !view.buffer_usage.contains(BufferUsage::UNIFORM_TEXEL) {
                violation!("uniform texel buffer views need UNIFORM_TEXEL usage");
            }
            Ok(WriteValue::TexelBuffer { key: view.key, buffer: view.buffer })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    fn is_violation<T>(result: Result<T>) -> bool {
        match result {
            Err(err) => classify(&err).map_or(false, |e| e.is_contract_violation()),
            Ok(_) => false,
        }
    }

    fn desc(format: Format, usage: ImageUsage, clear_value: Option<ClearValue>) -> ImageDesc {
        ImageDesc { format, width: 64, height: 64, mip_count: 1, layer_count: 1, usage, clear_value }
    }

    #[test]
    fn attachment_images_need_matching_clear_values() {
        let color = Some(ClearValue::Color([0.0; 4]));
        let depth = Some(ClearValue::DepthStencil { depth: 1.0, stencil: 0 });
        validate_image_desc(&desc(Format::R8G8B8A8Unorm, ImageUsage::RENDER_TARGET, color)).unwrap();
        assert!(is_violation(validate_image_desc(&desc(Format::R8G8B8A8Unorm, ImageUsage::RENDER_TARGET, None))));
        assert!(is_violation(validate_image_desc(&desc(Format::R8G8B8A8Unorm, ImageUsage::RENDER_TARGET, depth))));
        validate_image_desc(&desc(Format::D32Float, ImageUsage::DEPTH_STENCIL, depth)).unwrap();
        assert!(is_violation(validate_image_desc(&desc(Format::D32Float, ImageUsage::RENDER_TARGET, depth))));
    }

    #[test]
    fn image_shape_rules() {
        let mut d = desc(Format::R8G8B8A8Unorm, ImageUsage::SAMPLED, None);
        d.mip_count = 8;
        assert!(is_violation(validate_image_desc(&d)));
        d.mip_count = 7;
        validate_image_desc(&d).unwrap();

        let mut cube = desc(Format::R8G8B8A8Unorm, ImageUsage::SAMPLED | ImageUsage::CUBE_COMPATIBLE, None);
        cube.layer_count = 4;
        assert!(is_violation(validate_image_desc(&cube)));
        cube.layer_count = 12;
        validate_image_desc(&cube).unwrap();

        let bc = desc(Format::Bc1Unorm, ImageUsage::SAMPLED | ImageUsage::STORAGE, None);
        assert!(is_violation(validate_image_desc(&bc)));
    }
}
