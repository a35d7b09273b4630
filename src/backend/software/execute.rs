// Translation of recorded commands into CPU operations, and their execution
//
// Translation resolves every key into the memory it names, so an executable
// list keeps its resources alive until it is reset or re-recorded.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use super::memory::{BufferMemory, ImageMemory};
use super::{Descriptor, Registry};
use crate::capture::{CapturedBuffer, CapturedSet, DrawCall, DrawKind};
use crate::command::{BindPoint, Command};
use crate::descriptor::DescriptorSlot;
use crate::error::{unsupported, violation};
use crate::render_pass::LoadOp;

/// A descriptor set as bound: a window into its storage's heap.
#[derive(Debug, Clone)]
pub(super) struct BoundSet {
    pub heap: Arc<Mutex<Vec<Option<Descriptor>>>>,
    pub start: usize,
    pub slots: Arc<Vec<DescriptorSlot>>,
}

#[derive(Debug)]
pub(super) enum Op {
    CopyBuffer {
        src: Arc<BufferMemory>,
        src_offset: u64,
        dst: Arc<BufferMemory>,
        dst_offset: u64,
        size: u64,
    },
    Upload {
        src: Arc<BufferMemory>,
        offset: u64,
        dst: Arc<ImageMemory>,
        subresource: usize,
    },
    Readback {
        src: Arc<ImageMemory>,
        subresource: usize,
        dst: Arc<BufferMemory>,
        offset: u64,
    },
    Clear {
        image: Arc<ImageMemory>,
        subresources: Vec<usize>,
        texel: Vec<u8>,
        /// Render area of a load-op clear; whole subresources otherwise.
        area: Option<(u32, u32)>,
    },
    Fill {
        buffer: Arc<BufferMemory>,
        offset: u64,
        size: u64,
        value: u32,
    },
    BindSet {
        bind_point: BindPoint,
        index: u32,
        set: BoundSet,
    },
    BeginPass,
    NextSubpass,
    EndPass,
    Draw(DrawKind),
}

pub(super) fn translate(registry: &Registry, commands: &[Command]) -> Result<Vec<Op>> {
    let buffer = |key| {
        registry
            .buffers
            .get(key)
            .cloned()
            .context("command list references a destroyed buffer")
    };
    let image = |key| {
        registry
            .images
            .get(key)
            .cloned()
            .context("command list references a destroyed image")
    };

    let mut ops = Vec::with_capacity(commands.len());
    for command in commands {
        match command {
            Command::Barrier { .. }
            | Command::SetViewport(_)
            | Command::SetScissor(_)
            | Command::BindPipeline { .. }
            | Command::BindIndexBuffer { .. }
            | Command::BindVertexBuffers { .. } => {}
            Command::BindDescriptorSet { bind_point, index, set, .. } => {
                let Some(entry) = registry.sets.get(*set) else {
                    violation!("descriptor set bound at index {} was released with its storage", index);
                };
                ops.push(Op::BindSet {
                    bind_point: *bind_point,
                    index: *index,
                    set: BoundSet {
                        heap: entry.heap.clone(),
                        start: entry.starting_index as usize,
                        slots: entry.slots.clone(),
                    },
                });
            }
            Command::Draw { vertex_count, instance_count, first_vertex, first_instance } => {
                ops.push(Op::Draw(DrawKind::Draw {
                    vertex_count: *vertex_count,
                    instance_count: *instance_count,
                    first_vertex: *first_vertex,
                    first_instance: *first_instance,
                }));
            }
            Command::DrawIndexed { index_count, instance_count, first_index, vertex_offset, first_instance } => {
                ops.push(Op::Draw(DrawKind::DrawIndexed {
                    index_count: *index_count,
                    instance_count: *instance_count,
                    first_index: *first_index,
                    vertex_offset: *vertex_offset,
                    first_instance: *first_instance,
                }));
            }
            Command::Dispatch { x, y, z } => ops.push(Op::Draw(DrawKind::Dispatch { x: *x, y: *y, z: *z })),
            Command::BeginRenderPass { width, height, attachments, .. } => {
                ops.push(Op::BeginPass);
                for attachment in attachments {
                    let clears = attachment.load_op == LoadOp::Clear || attachment.stencil_load_op == LoadOp::Clear;
                    let (true, Some(value)) = (clears, attachment.clear_value) else {
                        continue;
                    };
                    let memory = image(attachment.image)?;
                    let Some(texel) = attachment.format.encode_clear(&value) else {
                        unsupported!("software", "clearing {:?} attachments", attachment.format);
                    };
                    let mip_count = memory.desc.mip_count;
                    ops.push(Op::Clear {
                        subresources: attachment.subresources.iter().map(|s| s.index(mip_count) as usize).collect(),
                        image: memory,
                        texel,
                        area: Some((*width, *height)),
                    });
                }
            }
            Command::NextSubpass => ops.push(Op::NextSubpass),
            Command::EndRenderPass => ops.push(Op::EndPass),
            Command::CopyBuffer { src, src_offset, dst, dst_offset, size } => ops.push(Op::CopyBuffer {
                src: buffer(*src)?,
                src_offset: *src_offset,
                dst: buffer(*dst)?,
                dst_offset: *dst_offset,
                size: *size,
            }),
            Command::CopyBufferToImage { buffer: src, buffer_offset, image: dst, subresource, .. } => {
                let dst = image(*dst)?;
                let subresource = subresource.index(dst.desc.mip_count) as usize;
                ops.push(Op::Upload { src: buffer(*src)?, offset: *buffer_offset, dst, subresource });
            }
            Command::CopyImageToBuffer { image: src, subresource, buffer: dst, buffer_offset, .. } => {
                let src = image(*src)?;
                let subresource = subresource.index(src.desc.mip_count) as usize;
                ops.push(Op::Readback { src, subresource, dst: buffer(*dst)?, offset: *buffer_offset });
            }
            Command::ClearImage { image: key, format, subresources, value, .. } => {
                let memory = image(*key)?;
                let Some(texel) = format.encode_clear(value) else {
                    unsupported!("software", "clearing {:?} images", format);
                };
                let mip_count = memory.desc.mip_count;
                ops.push(Op::Clear {
                    image: memory,
                    subresources: subresources.iter().map(|s| s.index(mip_count) as usize).collect(),
                    texel,
                    area: None,
                });
            }
            Command::FillBuffer { buffer: key, offset, size, value } => ops.push(Op::Fill {
                buffer: buffer(*key)?,
                offset: *offset,
                size: *size,
                value: *value,
            }),
        }
    }
    Ok(ops)
}

/// Runs translated lists in order on the queue thread.
pub(super) struct Executor {
    capture: Option<Arc<Mutex<Vec<DrawCall>>>>,
    graphics_sets: BTreeMap<u32, BoundSet>,
    compute_sets: BTreeMap<u32, BoundSet>,
    subpass: Option<u32>,
}

impl Executor {
    pub(super) fn new(capture: Option<Arc<Mutex<Vec<DrawCall>>>>) -> Self {
        Self { capture, graphics_sets: BTreeMap::new(), compute_sets: BTreeMap::new(), subpass: None }
    }

    pub(super) fn run(&mut self, ops: &[Op]) -> Result<()> {
        // Bindings do not survive a list boundary.
        self.graphics_sets.clear();
        self.compute_sets.clear();
        self.subpass = None;

        for op in ops {
            match op {
                Op::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                    if Arc::ptr_eq(src, dst) {
                        let mut bytes = src.bytes.lock();
                        let from = super::memory::byte_range(*src_offset, *size, bytes.len())?;
                        super::memory::byte_range(*dst_offset, *size, bytes.len())?;
                        bytes.copy_within(from, *dst_offset as usize);
                    } else {
                        let data = src.read(*src_offset, *size)?;
                        dst.write(*dst_offset, &data)?;
                    }
                }
                Op::Upload { src, offset, dst, subresource } => {
                    let len = dst
                        .subresources
                        .lock()
                        .get(*subresource)
                        .map(Vec::len)
                        .context("upload into a missing subresource")?;
                    let data = src.read(*offset, len as u64)?;
                    dst.write(*subresource, &data)?;
                }
                Op::Readback { src, subresource, dst, offset } => {
                    let data = src.read(*subresource)?;
                    dst.write(*offset, &data)?;
                }
                Op::Clear { image, subresources, texel, area } => image.fill(subresources, texel, *area)?,
                Op::Fill { buffer, offset, size, value } => {
                    let pattern = value.to_le_bytes();
                    let data: Vec<u8> = pattern.iter().copied().cycle().take(*size as usize).collect();
                    buffer.write(*offset, &data)?;
                }
                Op::BindSet { bind_point, index, set } => {
                    let sets = match bind_point {
                        BindPoint::Graphics => &mut self.graphics_sets,
                        BindPoint::Compute => &mut self.compute_sets,
                    };
                    sets.insert(*index, set.clone());
                }
                Op::BeginPass => self.subpass = Some(0),
                Op::NextSubpass => self.subpass = self.subpass.map(|s| s + 1),
                Op::EndPass => self.subpass = None,
                Op::Draw(kind) => self.capture_call(*kind)?,
            }
        }
        Ok(())
    }

    fn capture_call(&self, kind: DrawKind) -> Result<()> {
        let Some(capture) = &self.capture else {
            return Ok(());
        };
        let (sets, subpass) = match kind {
            DrawKind::Dispatch { .. } => (&self.compute_sets, None),
            _ => (&self.graphics_sets, self.subpass),
        };

        let mut captured = Vec::with_capacity(sets.len());
        for (&index, set) in sets {
            let heap = set.heap.lock();
            let mut buffers = Vec::new();
            for (slot, info) in set.slots.iter().enumerate() {
                if let Some(Descriptor::Buffer { memory, offset, size }) = heap.get(set.start + slot).and_then(Option::as_ref)
                {
                    buffers.push(CapturedBuffer {
                        slot: slot as u32,
                        binding: info.binding,
                        array_element: info.array_element,
                        kind: info.kind,
                        bytes: memory.read(*offset, *size)?,
                    });
                }
            }
            captured.push(CapturedSet { index, buffers });
        }
        capture.lock().push(DrawCall { kind, subpass, sets: captured });
        Ok(())
    }
}
