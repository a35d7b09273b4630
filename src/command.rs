// Command list recording
//
// Recording is backend-agnostic: each call is checked against the list's
// local view of bindings and image states and appended as a `Command`. The
// whole recording is handed to the backend once, when the list is made
// executable.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::descriptor::{AllocatedDescriptorSet, DescriptorSetDescription};
use crate::error::violation;
use crate::format::Format;
use crate::keys::{
    BufferKey, CommandListKey, CommandStorageKey, DescriptorSetKey, FramebufferKey, ImageKey,
    ImageViewKey, PipelineKey, PipelineLayoutKey, QueueKey, RenderPassKey,
};
use crate::pipeline::{ComputePipelineState, PipelineLayout, PipelineState};
use crate::render_pass::{Framebuffer, FramebufferAttachment, LoadOp, RenderPass, StoreOp};
use crate::resource::{
    Aspect, Buffer, BufferUsage, ClearValue, Image, ImageDesc, ImageUsage, ImageView,
    ResourceState, Subresource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandListState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Whole `width` x `height` target with the usual [0, 1] depth range.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> u64 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BindPoint {
    Graphics,
    Compute,
}

/// Where a submission sits in a queue's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket {
    pub queue: QueueKey,
    pub serial: u64,
}

/// One attachment as seen by a recorded render pass.
#[derive(Debug, Clone)]
pub(crate) struct PassAttachment {
    pub image: ImageKey,
    pub view: ImageViewKey,
    pub format: Format,
    pub aspect: Aspect,
    pub subresources: Vec<Subresource>,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub initial_state: ResourceState,
    pub final_state: ResourceState,
    pub clear_value: Option<ClearValue>,
}

#[derive(Debug, Clone)]
pub(crate) enum Command {
    Barrier {
        image: ImageKey,
        subresource: Subresource,
        aspect: Aspect,
        before: ResourceState,
        after: ResourceState,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindPipeline {
        bind_point: BindPoint,
        pipeline: PipelineKey,
    },
    BindDescriptorSet {
        bind_point: BindPoint,
        layout: PipelineLayoutKey,
        index: u32,
        set: DescriptorSetKey,
    },
    BindIndexBuffer {
        buffer: BufferKey,
        offset: u64,
        index_type: IndexType,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(BufferKey, u64)>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    BeginRenderPass {
        render_pass: RenderPassKey,
        framebuffer: FramebufferKey,
        width: u32,
        height: u32,
        attachments: Vec<PassAttachment>,
    },
    NextSubpass,
    EndRenderPass,
    CopyBuffer {
        src: BufferKey,
        src_offset: u64,
        dst: BufferKey,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        buffer: BufferKey,
        buffer_offset: u64,
        image: ImageKey,
        format: Format,
        subresource: Subresource,
        aspect: Aspect,
        extent: (u32, u32),
        state: ResourceState,
    },
    CopyImageToBuffer {
        image: ImageKey,
        format: Format,
        subresource: Subresource,
        aspect: Aspect,
        extent: (u32, u32),
        state: ResourceState,
        buffer: BufferKey,
        buffer_offset: u64,
    },
    ClearImage {
        image: ImageKey,
        format: Format,
        aspect: Aspect,
        subresources: Vec<Subresource>,
        value: ClearValue,
    },
    FillBuffer {
        buffer: BufferKey,
        offset: u64,
        size: u64,
        value: u32,
    },
}

/// Bookkeeping shared by a storage and every list allocated from it.
#[derive(Debug)]
pub(crate) struct StorageShared {
    pub tickets: Mutex<Vec<Ticket>>,
    pub generation: AtomicU64,
    pub live_lists: AtomicU32,
    pub max_lists: u32,
}

impl StorageShared {
    pub(crate) fn new(max_lists: u32) -> Self {
        Self {
            tickets: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            live_lists: AtomicU32::new(0),
            max_lists,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Backing allocator for command lists. Not meant to be shared between
/// threads while lists from it are being recorded.
#[must_use = "command list storages must be released with Device::destroy_command_list_storage"]
#[derive(Debug)]
pub struct CommandListStorage {
    pub(crate) key: CommandStorageKey,
    pub(crate) shared: Arc<StorageShared>,
}

impl CommandListStorage {
    pub fn list_count(&self) -> u32 {
        self.shared.live_lists.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
struct BoundPipeline {
    layout: PipelineLayoutKey,
    render_pass: Option<RenderPassKey>,
    subpass: u32,
    vertex_bindings: Vec<u32>,
}

#[derive(Debug, Clone)]
struct BoundLayout {
    key: PipelineLayoutKey,
    sets: Vec<DescriptorSetDescription>,
}

#[derive(Debug, Clone, Default)]
struct PipelineBinding {
    pipeline: Option<BoundPipeline>,
    layout: Option<BoundLayout>,
    sets: Vec<bool>,
}

impl PipelineBinding {
    fn ready(&self, what: &str) -> Result<()> {
        let Some(pipeline) = &self.pipeline else {
            violation!("{} recorded without a bound pipeline", what);
        };
        let Some(layout) = &self.layout else {
            violation!("{} recorded without a bound pipeline layout", what);
        };
        if pipeline.layout != layout.key {
            violation!("{}: bound pipeline was built against a different pipeline layout", what);
        }
        if let Some(missing) = self.sets.iter().position(|bound| !bound) {
            violation!("{}: descriptor set {} of the pipeline layout is not bound", what, missing);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct OpenPass {
    render_pass: RenderPassKey,
    subpass: u32,
    subpass_count: u32,
    attachments: Vec<PassAttachment>,
    framebuffer: Vec<FramebufferAttachment>,
}

/// Everything a list accumulates between start and make-executable.
#[derive(Debug, Default)]
pub(crate) struct Recording {
    pub commands: Vec<Command>,
    pub buffers: HashSet<BufferKey>,
    pub sets: HashSet<DescriptorSetKey>,
    states: HashMap<(ImageKey, Subresource), ResourceState>,
    graphics: PipelineBinding,
    compute: PipelineBinding,
    pass: Option<OpenPass>,
    index_buffer: bool,
    vertex_buffers: HashSet<u32>,
    viewport: bool,
    scissor: bool,
}

impl Recording {
    pub(crate) fn in_render_pass(&self) -> bool {
        self.pass.is_some()
    }

    /// State the list last left a subresource in, if it touched it.
    fn tracked(&self, image: ImageKey, subresource: Subresource) -> Option<ResourceState> {
        self.states.get(&(image, subresource)).copied()
    }

    /// The state a copy or clear will find the subresource in. Untracked
    /// subresources are assumed to be in `default`; submission-time
    /// validation catches a wrong assumption.
    fn expect_state(
        &self,
        image: ImageKey,
        subresource: Subresource,
        default: ResourceState,
        accept: impl Fn(ResourceState) -> bool,
        what: &str,
    ) -> Result<ResourceState> {
        match self.tracked(image, subresource) {
            Some(state) if accept(state) => Ok(state),
            Some(state) => violation!(
                "{} needs mip {} layer {} in a matching state but it was left in {:?}",
                what,
                subresource.mip,
                subresource.layer,
                state
            ),
            None => Ok(default),
        }
    }
}

/// A sequence of recorded GPU commands.
///
/// Lists move through `Initial -> Recording -> Executable -> Submitted`.
/// Recording calls are only accepted in `Recording`.
#[must_use = "command lists must be released with Device::destroy_command_list"]
#[derive(Debug)]
pub struct CommandList {
    pub(crate) key: CommandListKey,
    pub(crate) storage: CommandStorageKey,
    pub(crate) shared: Arc<StorageShared>,
    pub(crate) state: CommandListState,
    pub(crate) ticket: Option<Ticket>,
    pub(crate) generation: u64,
    pub(crate) rec: Recording,
}

// Dropping a list gives its slot back; the backend object goes with the storage.
impl Drop for CommandList {
    fn drop(&mut self) {
        let _ = self.shared.live_lists.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl CommandList {
    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn command_count(&self) -> usize {
        self.rec.commands.len()
    }

    fn recording(&mut self, what: &str) -> Result<&mut Recording> {
        if self.state != CommandListState::Recording {
            violation!("{} on a command list in state {:?}", what, self.state);
        }
        Ok(&mut self.rec)
    }

    /// Transition one subresource of `image` from `before` to `after`.
    pub fn set_pipeline_barrier(
        &mut self,
        image: &Image,
        before: ResourceState,
        after: ResourceState,
        subresource: Subresource,
        aspect: Aspect,
    ) -> Result<()> {
        let rec = self.recording("set_pipeline_barrier")?;
        let desc = image.desc();
        if let Some(pass) = &rec.pass {
            if pass.framebuffer.iter().any(|a| a.image == image.key && a.subresources.contains(&subresource)) {
                violation!(
                    "barrier targets mip {} layer {} which is attached to the open render pass",
                    subresource.mip,
                    subresource.layer
                );
            }
            violation!("barriers cannot be recorded inside a render pass");
        }
        if !desc.contains(subresource) {
            violation!(
                "barrier on mip {} layer {} of an image with {} mips and {} layers",
                subresource.mip,
                subresource.layer,
                desc.mip_count,
                desc.layer_count
            );
        }
        if !desc.format.supports_aspect(aspect) {
            violation!("aspect {:?} does not exist in format {:?}", aspect, desc.format);
        }
        if after == ResourceState::Undefined {
            violation!("barriers cannot transition into the Undefined state");
        }
        let accepted = after.accepted_image_usage();
        if !accepted.is_empty() && !desc.usage.intersects(accepted) {
            violation!("image usage {:?} does not allow the {:?} state", desc.usage, after);
        }
        if let Some(tracked) = rec.tracked(image.key, subresource) {
            if before != ResourceState::Undefined && tracked != before {
                violation!(
                    "barrier expects mip {} layer {} in {:?} but this list left it in {:?}",
                    subresource.mip,
                    subresource.layer,
                    before,
                    tracked
                );
            }
        }

        rec.states.insert((image.key, subresource), after);
        rec.commands.push(Command::Barrier { image: image.key, subresource, aspect, before, after });
        Ok(())
    }

    /// Barrier every subresource of `image` over its full aspect.
    pub fn transition_all_subresources(
        &mut self,
        image: &Image,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        let aspect = image.format().full_aspect();
        let subresources: Vec<_> = image.desc().subresources().collect();
        for subresource in subresources {
            self.set_pipeline_barrier(image, before, after, subresource, aspect)?;
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        let rec = self.recording("set_viewport")?;
        if viewport.width <= 0.0 || viewport.height <= 0.0 {
            violation!("viewport {}x{} is empty", viewport.width, viewport.height);
        }
        if !(0.0..=1.0).contains(&viewport.min_depth) || !(0.0..=1.0).contains(&viewport.max_depth) {
            violation!("viewport depth range must lie in [0, 1]");
        }
        rec.viewport = true;
        rec.commands.push(Command::SetViewport(viewport));
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: ScissorRect) -> Result<()> {
        let rec = self.recording("set_scissor")?;
        if scissor.x < 0 || scissor.y < 0 {
            violation!("scissor offset ({}, {}) is negative", scissor.x, scissor.y);
        }
        rec.scissor = true;
        rec.commands.push(Command::SetScissor(scissor));
        Ok(())
    }

    pub fn set_graphic_pipeline(&mut self, pipeline: &PipelineState) -> Result<()> {
        let rec = self.recording("set_graphic_pipeline")?;
        rec.graphics.pipeline = Some(BoundPipeline {
            layout: pipeline.layout,
            render_pass: Some(pipeline.render_pass),
            subpass: pipeline.subpass,
            vertex_bindings: pipeline.vertex_bindings.iter().map(|b| b.binding).collect(),
        });
        rec.commands.push(Command::BindPipeline { bind_point: BindPoint::Graphics, pipeline: pipeline.key });
        Ok(())
    }

    pub fn set_compute_pipeline(&mut self, pipeline: &ComputePipelineState) -> Result<()> {
        let rec = self.recording("set_compute_pipeline")?;
        rec.compute.pipeline = Some(BoundPipeline {
            layout: pipeline.layout,
            render_pass: None,
            subpass: 0,
            vertex_bindings: Vec::new(),
        });
        rec.commands.push(Command::BindPipeline { bind_point: BindPoint::Compute, pipeline: pipeline.key });
        Ok(())
    }

    /// Select the layout later descriptor binds refer to. Previously bound
    /// sets are forgotten.
    pub fn set_graphic_pipeline_layout(&mut self, layout: &PipelineLayout) -> Result<()> {
        let rec = self.recording("set_graphic_pipeline_layout")?;
        rec.graphics.layout = Some(BoundLayout { key: layout.key, sets: layout.sets.clone() });
        rec.graphics.sets = vec![false; layout.sets.len()];
        Ok(())
    }

    pub fn set_compute_pipeline_layout(&mut self, layout: &PipelineLayout) -> Result<()> {
        let rec = self.recording("set_compute_pipeline_layout")?;
        rec.compute.layout = Some(BoundLayout { key: layout.key, sets: layout.sets.clone() });
        rec.compute.sets = vec![false; layout.sets.len()];
        Ok(())
    }

    pub fn bind_graphic_descriptor(&mut self, index: u32, set: &AllocatedDescriptorSet<'_>) -> Result<()> {
        self.bind_descriptor(BindPoint::Graphics, index, set)
    }

    pub fn bind_compute_descriptor(&mut self, index: u32, set: &AllocatedDescriptorSet<'_>) -> Result<()> {
        self.bind_descriptor(BindPoint::Compute, index, set)
    }

    fn bind_descriptor(&mut self, bind_point: BindPoint, index: u32, set: &AllocatedDescriptorSet<'_>) -> Result<()> {
        let rec = self.recording("bind_descriptor")?;
        let binding = match bind_point {
            BindPoint::Graphics => &mut rec.graphics,
            BindPoint::Compute => &mut rec.compute,
        };
        let Some(layout) = &binding.layout else {
            violation!("descriptor set bound before a {:?} pipeline layout", bind_point);
        };
        let Some(expected) = layout.sets.get(index as usize) else {
            violation!("set index {} is outside a pipeline layout of {} sets", index, layout.sets.len());
        };
        if *expected != set.description {
            violation!("descriptor set shape does not match set {} of the pipeline layout", index);
        }
        let missing = set.unpopulated_slots();
        if !missing.is_empty() {
            violation!("descriptor set bound at index {} has unpopulated slots {:?}", index, missing);
        }

        let layout_key = layout.key;
        binding.sets[index as usize] = true;
        rec.buffers.extend(set.referenced_buffers());
        rec.sets.insert(set.key);
        rec.commands.push(Command::BindDescriptorSet { bind_point, layout: layout_key, index, set: set.key });
        Ok(())
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, index_type: IndexType) -> Result<()> {
        let rec = self.recording("bind_index_buffer")?;
        if !buffer.usage().contains(BufferUsage::INDEX) {
            violation!("buffer bound as index buffer lacks INDEX usage");
        }
        if offset >= buffer.size() || offset % index_type.size() != 0 {
            violation!("index buffer offset {} is out of range or misaligned", offset);
        }
        rec.index_buffer = true;
        rec.buffers.insert(buffer.key);
        rec.commands.push(Command::BindIndexBuffer { buffer: buffer.key, offset, index_type });
        Ok(())
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(&Buffer, u64)]) -> Result<()> {
        let rec = self.recording("bind_vertex_buffers")?;
        if buffers.is_empty() {
            violation!("bind_vertex_buffers with no buffer");
        }
        for (i, (buffer, offset)) in buffers.iter().enumerate() {
            if !buffer.usage().contains(BufferUsage::VERTEX) {
                violation!("buffer bound at vertex binding {} lacks VERTEX usage", first_binding + i as u32);
            }
            if *offset >= buffer.size() {
                violation!("vertex buffer offset {} is past the end of a {} byte buffer", offset, buffer.size());
            }
        }
        for (i, (buffer, _)) in buffers.iter().enumerate() {
            rec.vertex_buffers.insert(first_binding + i as u32);
            rec.buffers.insert(buffer.key);
        }
        rec.commands.push(Command::BindVertexBuffers {
            first_binding,
            buffers: buffers.iter().map(|(b, o)| (b.key, *o)).collect(),
        });
        Ok(())
    }

    fn check_draw(rec: &Recording, what: &str) -> Result<()> {
        let Some(pass) = &rec.pass else {
            violation!("{} outside a render pass", what);
        };
        rec.graphics.ready(what)?;
        if let Some(pipeline) = &rec.graphics.pipeline {
            if pipeline.render_pass != Some(pass.render_pass) || pipeline.subpass != pass.subpass {
                violation!(
                    "{}: pipeline targets subpass {} of another render pass than the open one (subpass {})",
                    what,
                    pipeline.subpass,
                    pass.subpass
                );
            }
            if let Some(binding) = pipeline.vertex_bindings.iter().find(|b| !rec.vertex_buffers.contains(b)) {
                violation!("{}: no vertex buffer bound at binding {}", what, binding);
            }
        }
        if !rec.viewport || !rec.scissor {
            violation!("{}: viewport and scissor must be set first", what);
        }
        Ok(())
    }

    pub fn draw_non_indexed(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        let rec = self.recording("draw_non_indexed")?;
        Self::check_draw(rec, "draw_non_indexed")?;
        rec.commands.push(Command::Draw { vertex_count, instance_count, first_vertex, first_instance });
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        let rec = self.recording("draw_indexed")?;
        Self::check_draw(rec, "draw_indexed")?;
        if !rec.index_buffer {
            violation!("draw_indexed without a bound index buffer");
        }
        rec.commands.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        let rec = self.recording("dispatch")?;
        if rec.in_render_pass() {
            violation!("dispatch inside a render pass");
        }
        rec.compute.ready("dispatch")?;
        if x == 0 || y == 0 || z == 0 {
            violation!("dispatch of an empty grid {}x{}x{}", x, y, z);
        }
        rec.commands.push(Command::Dispatch { x, y, z });
        Ok(())
    }

    /// Begin `render_pass` on `framebuffer`, clearing with each image's
    /// declared clear value.
    pub fn begin_renderpass(&mut self, render_pass: &RenderPass, framebuffer: &Framebuffer<'_>) -> Result<()> {
        self.begin_renderpass_inner(render_pass, framebuffer, None)
    }

    /// Begin a render pass with explicit per-attachment clear values.
    pub fn begin_renderpass_with_clear_values(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer<'_>,
        clear_values: &[ClearValue],
    ) -> Result<()> {
        self.begin_renderpass_inner(render_pass, framebuffer, Some(clear_values))
    }

    fn begin_renderpass_inner(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer<'_>,
        clear_values: Option<&[ClearValue]>,
    ) -> Result<()> {
        let rec = self.recording("begin_renderpass")?;
        if rec.in_render_pass() {
            violation!("begin_renderpass while another render pass is open");
        }
        if framebuffer.render_pass != render_pass.key {
            violation!("framebuffer was created for a different render pass");
        }
        let descs = &render_pass.description.attachments;
        if let Some(values) = clear_values {
            if values.len() != descs.len() {
                violation!("{} clear values given for {} attachments", values.len(), descs.len());
            }
        }

        let mut attachments = Vec::with_capacity(descs.len());
        for (index, (desc, bound)) in descs.iter().zip(&framebuffer.attachments).enumerate() {
            let clears = desc.load_op == LoadOp::Clear || desc.stencil_load_op == LoadOp::Clear;
            let clear_value = match clear_values {
                Some(values) => Some(values[index]),
                None => bound.clear_value,
            };
            if clears {
                match clear_value {
                    None => violation!("attachment {} is cleared but has no clear value", index),
                    Some(value) if value.is_depth_stencil() != desc.format.is_depth() => {
                        violation!("clear value kind of attachment {} does not match {:?}", index, desc.format)
                    }
                    Some(_) => {}
                }
            }
            for &sub in &bound.subresources {
                if let Some(tracked) = rec.tracked(bound.image, sub) {
                    if desc.initial_state != ResourceState::Undefined && tracked != desc.initial_state {
                        violation!(
                            "attachment {} expects {:?} at pass start but this list left it in {:?}",
                            index,
                            desc.initial_state,
                            tracked
                        );
                    }
                }
            }
            attachments.push(PassAttachment {
                image: bound.image,
                view: bound.view,
                format: bound.format,
                aspect: bound.aspect,
                subresources: bound.subresources.clone(),
                load_op: desc.load_op,
                store_op: desc.store_op,
                stencil_load_op: desc.stencil_load_op,
                initial_state: desc.initial_state,
                final_state: desc.final_state,
                clear_value,
            });
        }

        for (attachment, desc) in attachments.iter().zip(descs) {
            for &sub in &attachment.subresources {
                rec.states.insert((attachment.image, sub), desc.attachment_state());
            }
        }
        rec.pass = Some(OpenPass {
            render_pass: render_pass.key,
            subpass: 0,
            subpass_count: render_pass.subpass_count(),
            attachments: attachments.clone(),
            framebuffer: framebuffer.attachments.clone(),
        });
        rec.commands.push(Command::BeginRenderPass {
            render_pass: render_pass.key,
            framebuffer: framebuffer.key,
            width: framebuffer.width,
            height: framebuffer.height,
            attachments,
        });
        Ok(())
    }

    pub fn next_subpass(&mut self) -> Result<()> {
        let rec = self.recording("next_subpass")?;
        let Some(pass) = &mut rec.pass else {
            violation!("next_subpass outside a render pass");
        };
        if pass.subpass + 1 >= pass.subpass_count {
            violation!("next_subpass past the last of {} subpasses", pass.subpass_count);
        }
        pass.subpass += 1;
        rec.commands.push(Command::NextSubpass);
        Ok(())
    }

    pub fn end_renderpass(&mut self) -> Result<()> {
        let rec = self.recording("end_renderpass")?;
        let Some(pass) = rec.pass.take() else {
            violation!("end_renderpass without an open render pass");
        };
        if pass.subpass + 1 != pass.subpass_count {
            let subpass = pass.subpass;
            rec.pass = Some(pass);
            violation!("end_renderpass in subpass {} before the last subpass", subpass);
        }
        for attachment in &pass.attachments {
            for &sub in &attachment.subresources {
                rec.states.insert((attachment.image, sub), attachment.final_state);
            }
        }
        rec.commands.push(Command::EndRenderPass);
        Ok(())
    }

    pub fn copy_buffer(&mut self, src: &Buffer, src_offset: u64, dst: &Buffer, dst_offset: u64, size: u64) -> Result<()> {
        let rec = self.recording("copy_buffer")?;
        if rec.in_render_pass() {
            violation!("copy_buffer inside a render pass");
        }
        if size == 0 {
            violation!("copy_buffer of zero bytes");
        }
        if !src.usage().contains(BufferUsage::TRANSFER_SRC) || !dst.usage().contains(BufferUsage::TRANSFER_DST) {
            violation!("copy_buffer needs TRANSFER_SRC on the source and TRANSFER_DST on the destination");
        }
        check_range("copy_buffer source", src_offset, size, src.size())?;
        check_range("copy_buffer destination", dst_offset, size, dst.size())?;
        if src.key == dst.key && src_offset < dst_offset + size && dst_offset < src_offset + size {
            violation!("copy_buffer source and destination ranges overlap");
        }
        rec.buffers.insert(src.key);
        rec.buffers.insert(dst.key);
        rec.commands.push(Command::CopyBuffer { src: src.key, src_offset, dst: dst.key, dst_offset, size });
        Ok(())
    }

    /// Upload one tightly packed subresource from `buffer` at `buffer_offset`.
    pub fn copy_buffer_to_image_subresource(
        &mut self,
        image: &Image,
        subresource: Subresource,
        aspect: Aspect,
        buffer: &Buffer,
        buffer_offset: u64,
    ) -> Result<()> {
        let rec = self.recording("copy_buffer_to_image_subresource")?;
        let (extent, size) = check_image_copy(rec, image.desc(), subresource, aspect, buffer_offset)?;
        if !buffer.usage().contains(BufferUsage::TRANSFER_SRC) || !image.usage().contains(ImageUsage::TRANSFER_DST) {
            violation!("upload needs TRANSFER_SRC on the buffer and TRANSFER_DST on the image");
        }
        check_range("image upload source", buffer_offset, size, buffer.size())?;
        let state = rec.expect_state(
            image.key,
            subresource,
            ResourceState::CopyDest,
            |s| s == ResourceState::CopyDest,
            "image upload",
        )?;
        rec.buffers.insert(buffer.key);
        rec.commands.push(Command::CopyBufferToImage {
            buffer: buffer.key,
            buffer_offset,
            image: image.key,
            format: image.format(),
            subresource,
            aspect,
            extent,
            state,
        });
        Ok(())
    }

    /// Read back one subresource into `buffer`, tightly packed.
    pub fn copy_image_subresource_to_buffer(
        &mut self,
        image: &Image,
        subresource: Subresource,
        aspect: Aspect,
        buffer: &Buffer,
        buffer_offset: u64,
    ) -> Result<()> {
        let rec = self.recording("copy_image_subresource_to_buffer")?;
        let (extent, size) = check_image_copy(rec, image.desc(), subresource, aspect, buffer_offset)?;
        if !buffer.usage().contains(BufferUsage::TRANSFER_DST) || !image.usage().contains(ImageUsage::TRANSFER_SRC) {
            violation!("read-back needs TRANSFER_SRC on the image and TRANSFER_DST on the buffer");
        }
        check_range("image read-back destination", buffer_offset, size, buffer.size())?;
        let state = rec.expect_state(
            image.key,
            subresource,
            ResourceState::CopySource,
            |state| state.allows_copy_read(image.format()),
            "image read-back",
        )?;
        rec.buffers.insert(buffer.key);
        rec.commands.push(Command::CopyImageToBuffer {
            image: image.key,
            format: image.format(),
            subresource,
            aspect,
            extent,
            state,
            buffer: buffer.key,
            buffer_offset,
        });
        Ok(())
    }

    /// Clear every subresource of a colour view. The view's subresources must
    /// be in `CopyDest`.
    pub fn clear_color(&mut self, view: &ImageView<'_>, color: [f32; 4]) -> Result<()> {
        self.clear_view(view, ClearValue::Color(color), "clear_color")
    }

    pub fn clear_depth_stencil(&mut self, view: &ImageView<'_>, depth: f32, stencil: u8) -> Result<()> {
        if !(0.0..=1.0).contains(&depth) {
            violation!("depth clear value {} is outside [0, 1]", depth);
        }
        self.clear_view(view, ClearValue::DepthStencil { depth, stencil }, "clear_depth_stencil")
    }

    fn clear_view(&mut self, view: &ImageView<'_>, value: ClearValue, what: &str) -> Result<()> {
        let rec = self.recording(what)?;
        if rec.in_render_pass() {
            violation!("{} inside a render pass", what);
        }
        let format = view.image_desc.format;
        if format.is_compressed() {
            violation!("{} on block-compressed format {:?}", what, format);
        }
        if value.is_depth_stencil() != format.is_depth() {
            violation!("{} does not match the kind of format {:?}", what, format);
        }
        if !view.image_usage().contains(ImageUsage::TRANSFER_DST) {
            violation!("{} needs TRANSFER_DST usage on the image", what);
        }
        let subresources: Vec<_> = view.range.subresources().collect();
        for &sub in &subresources {
            rec.expect_state(view.image, sub, ResourceState::CopyDest, |s| s == ResourceState::CopyDest, what)?;
        }
        rec.commands.push(Command::ClearImage {
            image: view.image,
            format,
            aspect: view.aspect,
            subresources,
            value,
        });
        Ok(())
    }

    /// Fill `size` bytes at `offset` with the repeated 32-bit `value`.
    pub fn fill_buffer(&mut self, buffer: &Buffer, offset: u64, size: u64, value: u32) -> Result<()> {
        let rec = self.recording("fill_buffer")?;
        if rec.in_render_pass() {
            violation!("fill_buffer inside a render pass");
        }
        if size == 0 || offset % 4 != 0 || size % 4 != 0 {
            violation!("fill_buffer range {}+{} must be non-empty and 4-byte aligned", offset, size);
        }
        if !buffer.usage().contains(BufferUsage::TRANSFER_DST) {
            violation!("fill_buffer needs TRANSFER_DST usage");
        }
        check_range("fill_buffer", offset, size, buffer.size())?;
        rec.buffers.insert(buffer.key);
        rec.commands.push(Command::FillBuffer { buffer: buffer.key, offset, size, value });
        Ok(())
    }
}

fn check_range(what: &str, offset: u64, size: u64, total: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= total => Ok(()),
        _ => violation!("{} range {}+{} exceeds {} bytes", what, offset, size, total),
    }
}

/// Shared checks for buffer <-> image copies. Returns the mip extent and the
/// byte size of the packed region.
fn check_image_copy(
    rec: &Recording,
    desc: &ImageDesc,
    subresource: Subresource,
    aspect: Aspect,
    buffer_offset: u64,
) -> Result<((u32, u32), u64)> {
    if rec.in_render_pass() {
        violation!("image copies cannot be recorded inside a render pass");
    }
    if !desc.contains(subresource) {
        violation!("copy addresses mip {} layer {} outside the image", subresource.mip, subresource.layer);
    }
    if !matches!(aspect, Aspect::Color | Aspect::Depth) || !desc.format.supports_aspect(aspect) {
        violation!("copies address the colour or depth aspect only, got {:?} for {:?}", aspect, desc.format);
    }
    let block = desc.format.block_size() as u64;
    if buffer_offset % block != 0 || buffer_offset % 4 != 0 {
        violation!("buffer offset {} must be a multiple of 4 and of the {} byte texel block", buffer_offset, block);
    }
    let extent = desc.mip_extent(subresource.mip);
    Ok((extent, desc.format.region_size(extent.0, extent.1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use crate::keys::ImageKey;
    use crate::resource::{BufferDesc, MemoryPool};
    use slotmap::SlotMap;

    fn recording_list() -> CommandList {
        CommandList {
            key: CommandListKey::default(),
            storage: CommandStorageKey::default(),
            shared: Arc::new(StorageShared::new(4)),
            state: CommandListState::Recording,
            ticket: None,
            generation: 0,
            rec: Recording::default(),
        }
    }

    fn image(usage: ImageUsage) -> Image {
        let mut keys: SlotMap<ImageKey, ()> = SlotMap::with_key();
        Image {
            key: keys.insert(()),
            desc: ImageDesc {
                format: Format::R8G8B8A8Unorm,
                width: 16,
                height: 16,
                mip_count: 2,
                layer_count: 1,
                usage,
                clear_value: None,
            },
        }
    }

    fn buffer(size: u64, usage: BufferUsage) -> Buffer {
        let mut keys: SlotMap<BufferKey, ()> = SlotMap::with_key();
        Buffer { key: keys.insert(()), desc: BufferDesc { size, memory_pool: MemoryPool::HostReadable, usage } }
    }

    fn is_violation(result: Result<()>) -> bool {
        match result {
            Err(err) => classify(&err).map_or(false, |e| e.is_contract_violation()),
            Ok(()) => false,
        }
    }

    #[test]
    fn recording_calls_need_recording_state() {
        let mut list = recording_list();
        list.state = CommandListState::Executable;
        assert!(is_violation(list.set_viewport(Viewport::full(4, 4))));
        list.state = CommandListState::Recording;
        list.set_viewport(Viewport::full(4, 4)).unwrap();
        assert_eq!(list.command_count(), 1);
    }

    #[test]
    fn barrier_before_state_is_checked_per_subresource() {
        let img = image(ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC | ImageUsage::SAMPLED);
        let mut list = recording_list();
        let mip0 = Subresource::new(0, 0);
        let mip1 = Subresource::new(1, 0);
        list.set_pipeline_barrier(&img, ResourceState::Undefined, ResourceState::CopyDest, mip0, Aspect::Color)
            .unwrap();
        // Mip 1 is untouched, so any `before` is accepted at record time.
        list.set_pipeline_barrier(&img, ResourceState::ReadGeneric, ResourceState::CopySource, mip1, Aspect::Color)
            .unwrap();
        assert!(is_violation(list.set_pipeline_barrier(
            &img,
            ResourceState::CopySource,
            ResourceState::ReadGeneric,
            mip0,
            Aspect::Color
        )));
        list.set_pipeline_barrier(&img, ResourceState::CopyDest, ResourceState::ReadGeneric, mip0, Aspect::Color)
            .unwrap();
    }

    #[test]
    fn barrier_target_state_needs_matching_usage() {
        let img = image(ImageUsage::SAMPLED);
        let mut list = recording_list();
        assert!(is_violation(list.set_pipeline_barrier(
            &img,
            ResourceState::Undefined,
            ResourceState::RenderTarget,
            Subresource::new(0, 0),
            Aspect::Color
        )));
        assert!(is_violation(list.set_pipeline_barrier(
            &img,
            ResourceState::Undefined,
            ResourceState::ReadGeneric,
            Subresource::new(0, 0),
            Aspect::Depth
        )));
    }

    #[test]
    fn copies_follow_tracked_state() {
        let img = image(ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC);
        let readback = buffer(16 * 16 * 4, BufferUsage::TRANSFER_DST);
        let mut list = recording_list();
        let sub = Subresource::new(0, 0);
        list.set_pipeline_barrier(&img, ResourceState::Undefined, ResourceState::CopyDest, sub, Aspect::Color)
            .unwrap();
        assert!(is_violation(list.copy_image_subresource_to_buffer(&img, sub, Aspect::Color, &readback, 0)));

        list.set_pipeline_barrier(&img, ResourceState::CopyDest, ResourceState::CopySource, sub, Aspect::Color)
            .unwrap();
        list.copy_image_subresource_to_buffer(&img, sub, Aspect::Color, &readback, 0).unwrap();
        // Mip 1 is 8x8 and fits at the end of the buffer.
        list.copy_image_subresource_to_buffer(&img, Subresource::new(1, 0), Aspect::Color, &readback, 16 * 16 * 4 - 256)
            .unwrap();
        assert!(is_violation(list.copy_image_subresource_to_buffer(&img, sub, Aspect::Color, &readback, 4)));
        assert!(list.rec.buffers.contains(&readback.key));
    }

    #[test]
    fn fill_and_copy_ranges_are_checked() {
        let buf = buffer(64, BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC);
        let mut list = recording_list();
        list.fill_buffer(&buf, 0, 32, 0xdead_beef).unwrap();
        assert!(is_violation(list.fill_buffer(&buf, 2, 8, 0)));
        assert!(is_violation(list.fill_buffer(&buf, 60, 8, 0)));
        list.copy_buffer(&buf, 0, &buf, 32, 32).unwrap();
        assert!(is_violation(list.copy_buffer(&buf, 0, &buf, 16, 32)));
    }

    #[test]
    fn draws_and_dispatches_need_context() {
        let mut list = recording_list();
        assert!(is_violation(list.draw_non_indexed(3, 1, 0, 0)));
        assert!(is_violation(list.dispatch(1, 1, 1)));
        assert!(is_violation(list.end_renderpass()));
        assert!(is_violation(list.next_subpass()));
    }
}
