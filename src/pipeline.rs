// Pipeline layouts and pipeline state objects
//
// Descriptions are plain values with builder-style setters. Defaults match a
// typical opaque, depth-tested, back-face-culled triangle list.

use anyhow::Result;
use bitflags::bitflags;

use crate::descriptor::DescriptorSetDescription;
use crate::error::violation;
use crate::format::Format;
use crate::keys::{PipelineKey, PipelineLayoutKey, RenderPassKey};
use crate::render_pass::RenderPass;

/// Opaque compiled shader bytes (SPIR-V on Vulkan).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderBinary {
    bytes: Vec<u8>,
}

impl ShaderBinary {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn from_words(words: &[u32]) -> Self {
        Self { bytes: words.iter().flat_map(|w| w.to_le_bytes()).collect() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// SPIR-V words, if the byte length is a whole number of words.
    pub fn words(&self) -> Option<Vec<u32>> {
        if self.bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: Format,
    pub binding: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub fill: PolygonMode,
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub depth_bias_constant: f32,
    pub depth_bias_slope: f32,
    pub depth_bias_clamp: f32,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            fill: PolygonMode::Fill,
            cull: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_bias_constant: 0.0,
            depth_bias_slope: 0.0,
            depth_bias_clamp: 0.0,
        }
    }
}

impl RasterizerState {
    pub fn has_depth_bias(&self) -> bool {
        self.depth_bias_constant != 0.0 || self.depth_bias_slope != 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MultisampleState {
    pub sample_count: u32,
    pub alpha_to_coverage: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self { sample_count: 1, alpha_to_coverage: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilOpState {
    pub fail: StencilOp,
    pub pass: StencilOp,
    pub depth_fail: StencilOp,
    pub compare: CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilOpState {
    fn default() -> Self {
        Self {
            fail: StencilOp::Keep,
            pass: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            compare: CompareOp::Always,
            compare_mask: 0xff,
            write_mask: 0xff,
            reference: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: CompareOp,
    pub stencil_test: bool,
    pub front: StencilOpState,
    pub back: StencilOpState,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare_op: CompareOp::Less,
            stencil_test: false,
            front: StencilOpState::default(),
            back: StencilOpState::default(),
        }
    }
}

impl DepthStencilState {
    pub fn disabled() -> Self {
        Self { depth_test: false, depth_write: false, compare_op: CompareOp::Always, ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const ALL = Self::R.bits() | Self::G.bits() | Self::B.bits() | Self::A.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachment {
    pub enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
    pub write_mask: ColorWriteMask,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            enable: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: ColorWriteMask::ALL,
        }
    }
}

impl ColorBlendAttachment {
    /// Classic "over" blending on straight alpha.
    pub fn alpha_blended() -> Self {
        Self {
            enable: true,
            src_color: BlendFactor::SrcAlpha,
            dst_color: BlendFactor::OneMinusSrcAlpha,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::OneMinusSrcAlpha,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDescription {
    pub vertex_shader: ShaderBinary,
    pub fragment_shader: ShaderBinary,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub rasterizer: RasterizerState,
    pub multisample: MultisampleState,
    pub depth_stencil: DepthStencilState,
    pub topology: PrimitiveTopology,
    pub color_blend: Vec<ColorBlendAttachment>,
}

impl GraphicsPipelineDescription {
    /// Defaults with one opaque colour attachment and no vertex input.
    pub fn new(vertex_shader: ShaderBinary, fragment_shader: ShaderBinary) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            rasterizer: RasterizerState::default(),
            multisample: MultisampleState::default(),
            depth_stencil: DepthStencilState::default(),
            topology: PrimitiveTopology::TriangleList,
            color_blend: vec![ColorBlendAttachment::default()],
        }
    }

    pub fn vertex_binding(mut self, binding: u32, stride: u32, per_instance: bool) -> Self {
        self.vertex_bindings.push(VertexBinding { binding, stride, per_instance });
        self
    }

    pub fn vertex_attribute(mut self, location: u32, format: Format, binding: u32, offset: u32) -> Self {
        self.vertex_attributes.push(VertexAttribute { location, format, binding, offset });
        self
    }

    pub fn rasterizer(mut self, rasterizer: RasterizerState) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn multisample(mut self, multisample: MultisampleState) -> Self {
        self.multisample = multisample;
        self
    }

    pub fn depth_stencil(mut self, depth_stencil: DepthStencilState) -> Self {
        self.depth_stencil = depth_stencil;
        self
    }

    pub fn topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn color_blend(mut self, color_blend: Vec<ColorBlendAttachment>) -> Self {
        self.color_blend = color_blend;
        self
    }

    pub(crate) fn validate(&self, render_pass: &RenderPass, subpass: u32) -> Result<()> {
        if self.vertex_shader.is_empty() || self.fragment_shader.is_empty() {
            violation!("graphics pipeline needs non-empty vertex and fragment shaders");
        }
        let Some(color_count) = render_pass.color_attachment_count(subpass) else {
            violation!(
                "subpass {} does not exist in a render pass of {} subpasses",
                subpass,
                render_pass.subpass_count()
            );
        };
        if self.color_blend.len() != color_count {
            violation!(
                "pipeline declares {} blend attachments but subpass {} writes {} colour attachments",
                self.color_blend.len(),
                subpass,
                color_count
            );
        }
        if !self.multisample.sample_count.is_power_of_two() || self.multisample.sample_count > 64 {
            violation!("sample count {} is not a power of two up to 64", self.multisample.sample_count);
        }
        let mut bindings = std::collections::HashSet::new();
        for binding in &self.vertex_bindings {
            if !bindings.insert(binding.binding) {
                violation!("vertex binding {} is declared twice", binding.binding);
            }
        }
        let mut locations = std::collections::HashSet::new();
        for attribute in &self.vertex_attributes {
            if !bindings.contains(&attribute.binding) {
                violation!(
                    "vertex attribute at location {} references undeclared binding {}",
                    attribute.location,
                    attribute.binding
                );
            }
            if !locations.insert(attribute.location) {
                violation!("vertex location {} is declared twice", attribute.location);
            }
            if attribute.format.is_depth() || attribute.format.is_compressed() {
                violation!("{:?} is not a vertex format", attribute.format);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputePipelineDescription {
    pub shader: ShaderBinary,
}

impl ComputePipelineDescription {
    pub fn new(shader: ShaderBinary) -> Self {
        Self { shader }
    }
}

/// Ordered list of set layouts a pipeline is compiled against.
#[must_use = "pipeline layouts must be released with Device::destroy_pipeline_layout"]
#[derive(Debug)]
pub struct PipelineLayout {
    pub(crate) key: PipelineLayoutKey,
    pub(crate) sets: Vec<DescriptorSetDescription>,
}

impl PipelineLayout {
    pub fn set_count(&self) -> u32 {
        self.sets.len() as u32
    }

    pub fn set_description(&self, index: u32) -> Option<&DescriptorSetDescription> {
        self.sets.get(index as usize)
    }
}

#[must_use = "pipelines must be released with Device::destroy_graphic_pso"]
#[derive(Debug)]
pub struct PipelineState {
    pub(crate) key: PipelineKey,
    pub(crate) layout: PipelineLayoutKey,
    pub(crate) render_pass: RenderPassKey,
    pub(crate) subpass: u32,
    pub(crate) vertex_bindings: Vec<VertexBinding>,
    pub(crate) topology: PrimitiveTopology,
}

impl PipelineState {
    pub fn subpass(&self) -> u32 {
        self.subpass
    }

    pub fn topology(&self) -> PrimitiveTopology {
        self.topology
    }
}

#[must_use = "pipelines must be released with Device::destroy_compute_pso"]
#[derive(Debug)]
pub struct ComputePipelineState {
    pub(crate) key: PipelineKey,
    pub(crate) layout: PipelineLayoutKey,
}
