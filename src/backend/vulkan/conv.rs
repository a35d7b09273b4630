// Conversions from RHI descriptions to Vulkan enums and flags

use ash::vk;

use crate::command::{BindPoint, IndexType};
use crate::config::PresentMode;
use crate::descriptor::{BindingKind, ShaderStages};
use crate::format::Format;
use crate::pipeline::{
    BlendFactor, BlendOp, ColorWriteMask, CompareOp, CullMode, FrontFace, PolygonMode, PrimitiveTopology, StencilOp,
    StencilOpState,
};
use crate::render_pass::{AccessFlags, LoadOp, PipelineStages, StoreOp, EXTERNAL_SUBPASS};
use crate::resource::{Aspect, BufferUsage, ClearValue, ImageUsage, ImageViewType, ResourceState, SamplerType};

pub(super) fn format(format: Format) -> vk::Format {
    match format {
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R16Uint => vk::Format::R16_UINT,
        Format::R32G32Float => vk::Format::R32G32_SFLOAT,
        Format::R32G32B32Float => vk::Format::R32G32B32_SFLOAT,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::Bc1Unorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
        Format::Bc1Srgb => vk::Format::BC1_RGBA_SRGB_BLOCK,
        Format::Bc2Unorm => vk::Format::BC2_UNORM_BLOCK,
        Format::Bc3Unorm => vk::Format::BC3_UNORM_BLOCK,
        Format::Bc4Unorm => vk::Format::BC4_UNORM_BLOCK,
        Format::Bc5Unorm => vk::Format::BC5_UNORM_BLOCK,
    }
}

/// Back-buffer formats we know how to name.
pub(super) fn surface_format(format: vk::Format) -> Option<Format> {
    match format {
        vk::Format::B8G8R8A8_SRGB => Some(Format::B8G8R8A8Srgb),
        vk::Format::B8G8R8A8_UNORM => Some(Format::B8G8R8A8Unorm),
        vk::Format::R8G8B8A8_SRGB => Some(Format::R8G8B8A8Srgb),
        vk::Format::R8G8B8A8_UNORM => Some(Format::R8G8B8A8Unorm),
        _ => None,
    }
}

pub(super) fn aspect(aspect: Aspect) -> vk::ImageAspectFlags {
    match aspect {
        Aspect::Color => vk::ImageAspectFlags::COLOR,
        Aspect::Depth => vk::ImageAspectFlags::DEPTH,
        Aspect::Stencil => vk::ImageAspectFlags::STENCIL,
        Aspect::DepthStencil => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    }
}

pub(super) fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (ours, theirs) in [
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::UNIFORM_TEXEL, vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER),
        (BufferUsage::STORAGE_TEXEL, vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER),
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub(super) fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    for (ours, theirs) in [
        (ImageUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
        (ImageUsage::RENDER_TARGET, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (ImageUsage::DEPTH_STENCIL, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        (ImageUsage::INPUT_ATTACHMENT, vk::ImageUsageFlags::INPUT_ATTACHMENT),
        (ImageUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (ImageUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub(super) fn view_type(view_type: ImageViewType) -> vk::ImageViewType {
    match view_type {
        ImageViewType::D2 => vk::ImageViewType::TYPE_2D,
        ImageViewType::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
        ImageViewType::Cube => vk::ImageViewType::CUBE,
        ImageViewType::CubeArray => vk::ImageViewType::CUBE_ARRAY,
    }
}

/// Layout an image sits in while in `state`.
///
/// `ReadGeneric` maps to GENERAL because it also covers copy reads, which
/// SHADER_READ_ONLY_OPTIMAL does not allow.
pub(super) fn layout(state: ResourceState, format: Format) -> vk::ImageLayout {
    match state {
        ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
        ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::DepthWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ResourceState::DepthRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ResourceState::ReadGeneric if format.is_depth() => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ResourceState::ReadGeneric => vk::ImageLayout::GENERAL,
        ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::UnorderedAccess => vk::ImageLayout::GENERAL,
    }
}

/// Layout to transition *from* when leaving `state`.
///
/// Back buffers come out of the presentation engine in an unspecified layout,
/// so leaving `Present` discards like leaving `Undefined`.
pub(super) fn old_layout(state: ResourceState, format: Format) -> vk::ImageLayout {
    match state {
        ResourceState::Present => vk::ImageLayout::UNDEFINED,
        other => layout(other, format),
    }
}

/// Pipeline stages and memory accesses that touch an image in `state`.
pub(super) fn state_scope(state: ResourceState) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let shaders = vk::PipelineStageFlags::VERTEX_SHADER
        | vk::PipelineStageFlags::FRAGMENT_SHADER
        | vk::PipelineStageFlags::COMPUTE_SHADER;
    match state {
        ResourceState::Undefined => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
        ResourceState::Present => (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()),
        ResourceState::RenderTarget => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthWrite => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthRead => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
        ),
        ResourceState::ReadGeneric => (
            shaders | vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::INPUT_ATTACHMENT_READ | vk::AccessFlags::TRANSFER_READ,
        ),
        ResourceState::CopySource => (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ),
        ResourceState::CopyDest => (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        ResourceState::UnorderedAccess => (shaders, vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE),
    }
}

/// Filter, mip mode and max LOD of each sampler kind. Nearest and bilinear
/// samplers stay on the base level.
pub(super) fn sampler_filtering(sampler_type: SamplerType) -> (vk::Filter, vk::SamplerMipmapMode, f32) {
    match sampler_type {
        SamplerType::Nearest => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST, 0.0),
        SamplerType::Bilinear => (vk::Filter::LINEAR, vk::SamplerMipmapMode::NEAREST, 0.0),
        SamplerType::Trilinear | SamplerType::Anisotropic => {
            (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR, vk::LOD_CLAMP_NONE)
        }
    }
}

pub(super) fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::Sampler => vk::DescriptorType::SAMPLER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        BindingKind::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        BindingKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
    }
}

/// Layout a bound image view is read through for a descriptor of `kind`.
pub(super) fn descriptor_layout(kind: BindingKind, format: Format) -> vk::ImageLayout {
    match kind {
        BindingKind::StorageImage => vk::ImageLayout::GENERAL,
        BindingKind::InputAttachment => input_attachment_layout(format),
        _ => layout(ResourceState::ReadGeneric, format),
    }
}

/// Layout an attachment is read through as a subpass input.
pub(super) fn input_attachment_layout(format: Format) -> vk::ImageLayout {
    if format.is_depth() {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }
}

pub(super) fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub(super) fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub(super) fn store_op(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

pub(super) fn subpass_index(subpass: u32) -> u32 {
    if subpass == EXTERNAL_SUBPASS {
        vk::SUBPASS_EXTERNAL
    } else {
        subpass
    }
}

pub(super) fn pipeline_stages(stages: PipelineStages) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::empty();
    for (ours, theirs) in [
        (PipelineStages::TOP_OF_PIPE, vk::PipelineStageFlags::TOP_OF_PIPE),
        (PipelineStages::VERTEX_INPUT, vk::PipelineStageFlags::VERTEX_INPUT),
        (PipelineStages::VERTEX_SHADER, vk::PipelineStageFlags::VERTEX_SHADER),
        (PipelineStages::FRAGMENT_SHADER, vk::PipelineStageFlags::FRAGMENT_SHADER),
        (PipelineStages::EARLY_FRAGMENT_TESTS, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS),
        (PipelineStages::LATE_FRAGMENT_TESTS, vk::PipelineStageFlags::LATE_FRAGMENT_TESTS),
        (PipelineStages::COLOR_ATTACHMENT_OUTPUT, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
        (PipelineStages::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER),
        (PipelineStages::TRANSFER, vk::PipelineStageFlags::TRANSFER),
        (PipelineStages::BOTTOM_OF_PIPE, vk::PipelineStageFlags::BOTTOM_OF_PIPE),
    ] {
        if stages.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub(super) fn access_flags(access: AccessFlags) -> vk::AccessFlags {
    let mut flags = vk::AccessFlags::empty();
    for (ours, theirs) in [
        (AccessFlags::COLOR_ATTACHMENT_READ, vk::AccessFlags::COLOR_ATTACHMENT_READ),
        (AccessFlags::COLOR_ATTACHMENT_WRITE, vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        (AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ),
        (AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
        (AccessFlags::INPUT_ATTACHMENT_READ, vk::AccessFlags::INPUT_ATTACHMENT_READ),
        (AccessFlags::SHADER_READ, vk::AccessFlags::SHADER_READ),
        (AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_WRITE),
        (AccessFlags::TRANSFER_READ, vk::AccessFlags::TRANSFER_READ),
        (AccessFlags::TRANSFER_WRITE, vk::AccessFlags::TRANSFER_WRITE),
    ] {
        if access.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub(super) fn polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
    }
}

pub(super) fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub(super) fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub(super) fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub(super) fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

fn stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::IncrementClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::DecrementClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::Invert => vk::StencilOp::INVERT,
        StencilOp::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

pub(super) fn stencil_state(state: &StencilOpState) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: stencil_op(state.fail),
        pass_op: stencil_op(state.pass),
        depth_fail_op: stencil_op(state.depth_fail),
        compare_op: compare_op(state.compare),
        compare_mask: state.compare_mask,
        write_mask: state.write_mask,
        reference: state.reference,
    }
}

pub(super) fn blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

pub(super) fn blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

pub(super) fn color_write_mask(mask: ColorWriteMask) -> vk::ColorComponentFlags {
    let mut flags = vk::ColorComponentFlags::empty();
    if mask.contains(ColorWriteMask::R) {
        flags |= vk::ColorComponentFlags::R;
    }
    if mask.contains(ColorWriteMask::G) {
        flags |= vk::ColorComponentFlags::G;
    }
    if mask.contains(ColorWriteMask::B) {
        flags |= vk::ColorComponentFlags::B;
    }
    if mask.contains(ColorWriteMask::A) {
        flags |= vk::ColorComponentFlags::A;
    }
    flags
}

pub(super) fn clear_value(format: Format, value: &ClearValue) -> vk::ClearValue {
    match *value {
        ClearValue::Color(color) => vk::ClearValue { color: clear_color(format, color) },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil: stencil as u32 },
        },
    }
}

/// Integer formats clear through the uint member of the union.
pub(super) fn clear_color(format: Format, color: [f32; 4]) -> vk::ClearColorValue {
    match format {
        Format::R32Uint | Format::R16Uint => vk::ClearColorValue { uint32: color.map(|c| c.max(0.0) as u32) },
        _ => vk::ClearColorValue { float32: color },
    }
}

pub(super) fn index_type(index_type: IndexType) -> vk::IndexType {
    match index_type {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

pub(super) fn bind_point(bind_point: BindPoint) -> vk::PipelineBindPoint {
    match bind_point {
        BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

pub(super) fn present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_is_discarded_when_left() {
        let format = Format::B8G8R8A8Srgb;
        assert_eq!(layout(ResourceState::Present, format), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(old_layout(ResourceState::Present, format), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            old_layout(ResourceState::RenderTarget, format),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn generic_reads_keep_copies_legal() {
        assert_eq!(layout(ResourceState::ReadGeneric, Format::R8G8B8A8Unorm), vk::ImageLayout::GENERAL);
        assert_eq!(
            layout(ResourceState::ReadGeneric, Format::D32Float),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        let (stages, access) = state_scope(ResourceState::ReadGeneric);
        assert!(stages.contains(vk::PipelineStageFlags::TRANSFER));
        assert!(access.contains(vk::AccessFlags::TRANSFER_READ));
    }

    #[test]
    fn usage_flags_translate_bit_by_bit() {
        let flags = image_usage(ImageUsage::RENDER_TARGET | ImageUsage::TRANSFER_SRC);
        assert_eq!(flags, vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC);
        let flags = buffer_usage(BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST);
        assert_eq!(flags, vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST);
        assert_eq!(shader_stages(ShaderStages::ALL), vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::COMPUTE);
    }

    #[test]
    fn integer_targets_clear_through_uint() {
        let value = clear_color(Format::R32Uint, [7.0, 0.0, 0.0, 1.0]);
        assert_eq!(unsafe { value.uint32 }, [7, 0, 0, 1]);
        let value = clear_color(Format::R8G8B8A8Unorm, [1.0, 0.5, 0.0, 1.0]);
        assert_eq!(unsafe { value.float32 }, [1.0, 0.5, 0.0, 1.0]);
    }

    #[test]
    fn only_mipmapped_samplers_reach_past_the_base_level() {
        assert_eq!(sampler_filtering(SamplerType::Nearest), (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST, 0.0));
        assert_eq!(sampler_filtering(SamplerType::Bilinear).2, 0.0);
        assert_eq!(sampler_filtering(SamplerType::Trilinear).2, vk::LOD_CLAMP_NONE);
        let (filter, mipmap_mode, max_lod) = sampler_filtering(SamplerType::Anisotropic);
        assert_eq!((filter, mipmap_mode), (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR));
        assert_eq!(max_lod, vk::LOD_CLAMP_NONE);
    }

    #[test]
    fn external_subpass_maps_to_vulkan_sentinel() {
        assert_eq!(subpass_index(EXTERNAL_SUBPASS), vk::SUBPASS_EXTERNAL);
        assert_eq!(subpass_index(2), 2);
    }
}
