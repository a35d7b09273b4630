// Render passes and framebuffers
//
// A render pass is a graph of subpasses over a fixed attachment list. Input
// attachments are only legal when the producing subpass is strictly earlier
// and an explicit dependency orders the write before the input read.

use std::marker::PhantomData;

use anyhow::Result;
use bitflags::bitflags;

use crate::error::violation;
use crate::format::Format;
use crate::keys::{FramebufferKey, ImageKey, ImageViewKey, RenderPassKey};
use crate::resource::{Aspect, ClearValue, ImageView, ResourceState, Subresource};

/// Subpass index standing for "outside the render pass" in dependencies.
pub const EXTERNAL_SUBPASS: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const VERTEX_INPUT = 1 << 1;
        const VERTEX_SHADER = 1 << 2;
        const FRAGMENT_SHADER = 1 << 3;
        const EARLY_FRAGMENT_TESTS = 1 << 4;
        const LATE_FRAGMENT_TESTS = 1 << 5;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 6;
        const COMPUTE_SHADER = 1 << 7;
        const TRANSFER = 1 << 8;
        const BOTTOM_OF_PIPE = 1 << 9;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const COLOR_ATTACHMENT_READ = 1 << 0;
        const COLOR_ATTACHMENT_WRITE = 1 << 1;
        const DEPTH_STENCIL_ATTACHMENT_READ = 1 << 2;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 3;
        const INPUT_ATTACHMENT_READ = 1 << 4;
        const SHADER_READ = 1 << 5;
        const SHADER_WRITE = 1 << 6;
        const TRANSFER_READ = 1 << 7;
        const TRANSFER_WRITE = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDescription {
    pub format: Format,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub initial_state: ResourceState,
    pub final_state: ResourceState,
}

impl AttachmentDescription {
    /// Cleared colour target that is kept and left readable by shaders.
    pub fn color(format: Format) -> Self {
        Self {
            format,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
            initial_state: ResourceState::Undefined,
            final_state: ResourceState::ReadGeneric,
        }
    }

    /// Cleared depth target that is discarded after the pass.
    pub fn depth(format: Format) -> Self {
        Self {
            format,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            stencil_load_op: if format.has_stencil() { LoadOp::Clear } else { LoadOp::DontCare },
            stencil_store_op: StoreOp::DontCare,
            initial_state: ResourceState::Undefined,
            final_state: ResourceState::DepthWrite,
        }
    }

    pub fn with_ops(mut self, load_op: LoadOp, store_op: StoreOp) -> Self {
        self.load_op = load_op;
        self.store_op = store_op;
        self
    }

    pub fn with_states(mut self, initial_state: ResourceState, final_state: ResourceState) -> Self {
        self.initial_state = initial_state;
        self.final_state = final_state;
        self
    }

    /// State the attachment sits in while a subpass writes it.
    pub(crate) fn attachment_state(&self) -> ResourceState {
        if self.format.is_depth() {
            ResourceState::DepthWrite
        } else {
            ResourceState::RenderTarget
        }
    }
}

/// Attachment indices used by one subpass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SubpassDescription {
    pub color: Vec<u32>,
    pub input: Vec<u32>,
    pub depth_stencil: Option<u32>,
}

impl SubpassDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color(mut self, attachment: u32) -> Self {
        self.color.push(attachment);
        self
    }

    pub fn input(mut self, attachment: u32) -> Self {
        self.input.push(attachment);
        self
    }

    pub fn depth_stencil(mut self, attachment: u32) -> Self {
        self.depth_stencil = Some(attachment);
        self
    }

    fn writes(&self, attachment: u32) -> bool {
        self.color.contains(&attachment) || self.depth_stencil == Some(attachment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

impl SubpassDependency {
    /// Colour written in `src` and read as an input attachment in `dst`.
    pub fn color_to_input(src: u32, dst: u32) -> Self {
        Self {
            src_subpass: src,
            dst_subpass: dst,
            src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            dst_stages: PipelineStages::FRAGMENT_SHADER,
            src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: AccessFlags::INPUT_ATTACHMENT_READ,
        }
    }

    /// Depth written in `src` and read as an input attachment in `dst`.
    pub fn depth_to_input(src: u32, dst: u32) -> Self {
        Self {
            src_subpass: src,
            dst_subpass: dst,
            src_stages: PipelineStages::EARLY_FRAGMENT_TESTS | PipelineStages::LATE_FRAGMENT_TESTS,
            dst_stages: PipelineStages::FRAGMENT_SHADER,
            src_access: AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access: AccessFlags::INPUT_ATTACHMENT_READ,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderPassDescription {
    pub attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
    pub dependencies: Vec<SubpassDependency>,
}

impl RenderPassDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attachment(mut self, attachment: AttachmentDescription) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn subpass(mut self, subpass: SubpassDescription) -> Self {
        self.subpasses.push(subpass);
        self
    }

    pub fn dependency(mut self, dependency: SubpassDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// One subpass writing one colour attachment.
    ///
    /// A loading pass expects the attachment to already sit in `final_state`.
    pub fn single_color_pass(format: Format, load_op: LoadOp, final_state: ResourceState) -> Self {
        let initial_state = match load_op {
            LoadOp::Load => final_state,
            LoadOp::Clear | LoadOp::DontCare => ResourceState::Undefined,
        };
        Self::new()
            .attachment(
                AttachmentDescription::color(format)
                    .with_ops(load_op, StoreOp::Store)
                    .with_states(initial_state, final_state),
            )
            .subpass(SubpassDescription::new().color(0))
    }

    /// One subpass writing a colour attachment (index 0) and a depth attachment (index 1).
    pub fn color_depth_pass(color: Format, depth: Format, final_state: ResourceState) -> Self {
        Self::new()
            .attachment(AttachmentDescription::color(color).with_states(ResourceState::Undefined, final_state))
            .attachment(AttachmentDescription::depth(depth))
            .subpass(SubpassDescription::new().color(0).depth_stencil(1))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.subpasses.is_empty() {
            violation!("render pass declares no subpass");
        }
        let attachment_count = self.attachments.len() as u32;

        for (index, attachment) in self.attachments.iter().enumerate() {
            if attachment.final_state == ResourceState::Undefined {
                violation!("attachment {} cannot end the render pass in the Undefined state", index);
            }
            if attachment.format.is_compressed() {
                violation!("attachment {} uses block-compressed format {:?}", index, attachment.format);
            }
        }

        for (index, subpass) in self.subpasses.iter().enumerate() {
            for &color in &subpass.color {
                if color >= attachment_count {
                    violation!("subpass {} references colour attachment {} of {}", index, color, attachment_count);
                }
                if self.attachments[color as usize].format.is_depth() {
                    violation!("subpass {} uses depth attachment {} as a colour target", index, color);
                }
            }
            if let Some(depth) = subpass.depth_stencil {
                if depth >= attachment_count {
                    violation!("subpass {} references depth attachment {} of {}", index, depth, attachment_count);
                }
                if !self.attachments[depth as usize].format.is_depth() {
                    violation!("subpass {} uses colour attachment {} as depth target", index, depth);
                }
            }
            for &input in &subpass.input {
                if input >= attachment_count {
                    violation!("subpass {} references input attachment {} of {}", index, input, attachment_count);
                }
                if subpass.writes(input) {
                    violation!("subpass {} reads attachment {} it also writes", index, input);
                }
            }
        }

        let subpass_count = self.subpasses.len() as u32;
        for dependency in &self.dependencies {
            let in_range = |s: u32| s == EXTERNAL_SUBPASS || s < subpass_count;
            if !in_range(dependency.src_subpass) || !in_range(dependency.dst_subpass) {
                violation!(
                    "dependency {} -> {} names a subpass that does not exist",
                    dependency.src_subpass,
                    dependency.dst_subpass
                );
            }
            if dependency.src_subpass == EXTERNAL_SUBPASS && dependency.dst_subpass == EXTERNAL_SUBPASS {
                violation!("dependency cannot be external on both ends");
            }
            if dependency.src_subpass != EXTERNAL_SUBPASS
                && dependency.dst_subpass != EXTERNAL_SUBPASS
                && dependency.src_subpass > dependency.dst_subpass
            {
                violation!(
                    "dependency {} -> {} points backwards",
                    dependency.src_subpass,
                    dependency.dst_subpass
                );
            }
        }

        // Every input read must be ordered after the latest earlier write.
        for (reader, subpass) in self.subpasses.iter().enumerate() {
            let reader = reader as u32;
            for &input in &subpass.input {
                let writer = (0..reader).rev().find(|&s| self.subpasses[s as usize].writes(input));
                let Some(writer) = writer else {
                    violation!(
                        "subpass {} reads attachment {} as input but no earlier subpass writes it",
                        reader,
                        input
                    );
                };
                let ordered = self.dependencies.iter().any(|d| {
                    d.src_subpass == writer
                        && d.dst_subpass == reader
                        && d.dst_access.contains(AccessFlags::INPUT_ATTACHMENT_READ)
                });
                if !ordered {
                    violation!(
                        "subpass {} reads attachment {} written by subpass {} without a dependency {} -> {} covering INPUT_ATTACHMENT_READ",
                        reader,
                        input,
                        writer,
                        writer,
                        reader
                    );
                }
            }
        }
        Ok(())
    }
}

#[must_use = "render passes must be released with Device::destroy_render_pass"]
#[derive(Debug)]
pub struct RenderPass {
    pub(crate) key: RenderPassKey,
    pub(crate) description: RenderPassDescription,
}

impl RenderPass {
    pub fn description(&self) -> &RenderPassDescription {
        &self.description
    }

    pub fn subpass_count(&self) -> u32 {
        self.description.subpasses.len() as u32
    }

    pub fn color_attachment_count(&self, subpass: u32) -> Option<usize> {
        self.description.subpasses.get(subpass as usize).map(|s| s.color.len())
    }
}

/// What a framebuffer knows about each bound view.
#[derive(Debug, Clone)]
pub(crate) struct FramebufferAttachment {
    pub view: ImageViewKey,
    pub image: ImageKey,
    pub format: Format,
    pub aspect: Aspect,
    pub subresources: Vec<Subresource>,
    pub clear_value: Option<ClearValue>,
}

/// Concrete attachment views for a render pass.
#[derive(Debug)]
pub struct Framebuffer<'a> {
    pub(crate) key: FramebufferKey,
    pub(crate) render_pass: RenderPassKey,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) attachments: Vec<FramebufferAttachment>,
    pub(crate) _views: PhantomData<&'a ImageView<'a>>,
}

impl Framebuffer<'_> {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub(crate) fn attaches(&self, image: ImageKey, subresource: Subresource) -> bool {
        self.attachments
            .iter()
            .any(|a| a.image == image && a.subresources.contains(&subresource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    fn gbuffer_then_lighting() -> RenderPassDescription {
        RenderPassDescription::new()
            .attachment(AttachmentDescription::color(Format::R16G16B16A16Float))
            .attachment(AttachmentDescription::depth(Format::D32Float))
            .attachment(AttachmentDescription::color(Format::B8G8R8A8Unorm).with_states(
                ResourceState::Undefined,
                ResourceState::Present,
            ))
            .subpass(SubpassDescription::new().color(0).depth_stencil(1))
            .subpass(SubpassDescription::new().input(0).input(1).color(2))
    }

    #[test]
    fn input_attachment_needs_explicit_edges() {
        let desc = gbuffer_then_lighting();
        let err = desc.validate().unwrap_err();
        assert!(classify(&err).unwrap().is_contract_violation());

        // Colour edge alone is not enough: depth is read too.
        let desc = gbuffer_then_lighting().dependency(SubpassDependency::color_to_input(0, 1));
        assert!(desc.validate().is_err());

        let desc = gbuffer_then_lighting()
            .dependency(SubpassDependency::color_to_input(0, 1))
            .dependency(SubpassDependency::depth_to_input(0, 1));
        desc.validate().unwrap();
    }

    #[test]
    fn edge_must_cover_input_read() {
        let mut edge = SubpassDependency::color_to_input(0, 1);
        edge.dst_access = AccessFlags::SHADER_READ;
        let desc = RenderPassDescription::new()
            .attachment(AttachmentDescription::color(Format::R8G8B8A8Unorm))
            .attachment(AttachmentDescription::color(Format::R8G8B8A8Unorm))
            .subpass(SubpassDescription::new().color(0))
            .subpass(SubpassDescription::new().input(0).color(1))
            .dependency(edge);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn input_without_earlier_writer_is_rejected() {
        let desc = RenderPassDescription::new()
            .attachment(AttachmentDescription::color(Format::R8G8B8A8Unorm))
            .attachment(AttachmentDescription::color(Format::R8G8B8A8Unorm))
            .subpass(SubpassDescription::new().input(0).color(1))
            .subpass(SubpassDescription::new().color(0))
            .dependency(SubpassDependency::color_to_input(1, 0));
        assert!(desc.validate().is_err());
    }

    #[test]
    fn attachment_indices_and_kinds_are_checked() {
        let desc = RenderPassDescription::single_color_pass(
            Format::R8G8B8A8Unorm,
            LoadOp::Clear,
            ResourceState::CopySource,
        );
        desc.validate().unwrap();

        let bad = desc.clone().subpass(SubpassDescription::new().color(3));
        assert!(bad.validate().is_err());

        let depth_as_color = RenderPassDescription::new()
            .attachment(AttachmentDescription::depth(Format::D32Float))
            .subpass(SubpassDescription::new().color(0));
        assert!(depth_as_color.validate().is_err());

        assert!(RenderPassDescription::new().validate().is_err());
    }
}
