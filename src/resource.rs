// Resource objects - buffers, images, views and samplers
//
// Handles are plain records: the native object lives in the backend registry
// under `key`. Owning handles (Buffer, Image, Sampler) are not Clone and are
// consumed by the matching destroy call, so each one is destroyed exactly
// once. Views borrow the resource they alias and cannot outlive it.

use std::marker::PhantomData;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::format::Format;
use crate::keys::{BufferKey, BufferViewKey, ImageKey, ImageViewKey, SamplerKey};

/// Where a buffer lives and which side of the bus may touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryPool {
    /// GPU only. Cannot be mapped.
    DeviceLocal,
    /// Host writes, GPU reads (upload heap).
    HostWritable,
    /// GPU writes, host reads (readback heap).
    HostReadable,
}

impl MemoryPool {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryPool::DeviceLocal)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const UNIFORM = 1 << 0;
        const STORAGE = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const UNIFORM_TEXEL = 1 << 4;
        const STORAGE_TEXEL = 1 << 5;
        const TRANSFER_SRC = 1 << 6;
        const TRANSFER_DST = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
        const INPUT_ATTACHMENT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
        const CUBE_COMPATIBLE = 1 << 7;
    }
}

/// GPU access mode of one image subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    Undefined,
    Present,
    RenderTarget,
    DepthWrite,
    DepthRead,
    /// Any shader or transfer read.
    ReadGeneric,
    CopySource,
    CopyDest,
    UnorderedAccess,
}

impl ResourceState {
    /// States a copy may read an image of `format` from. Depth images read
    /// through `ReadGeneric` sit in a read-only depth layout copies cannot use.
    pub fn allows_copy_read(self, format: Format) -> bool {
        match self {
            ResourceState::CopySource => true,
            ResourceState::ReadGeneric => !format.is_depth(),
            _ => false,
        }
    }

    /// States that can be written by the GPU.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            ResourceState::RenderTarget
                | ResourceState::DepthWrite
                | ResourceState::CopyDest
                | ResourceState::UnorderedAccess
        )
    }

    /// Image usages of which at least one is needed to enter this state.
    /// Empty means any image may.
    pub fn accepted_image_usage(self) -> ImageUsage {
        match self {
            ResourceState::Undefined | ResourceState::Present => ImageUsage::empty(),
            ResourceState::RenderTarget => ImageUsage::RENDER_TARGET,
            ResourceState::DepthWrite | ResourceState::DepthRead => ImageUsage::DEPTH_STENCIL,
            ResourceState::ReadGeneric => {
                ImageUsage::SAMPLED | ImageUsage::INPUT_ATTACHMENT | ImageUsage::TRANSFER_SRC
            }
            ResourceState::CopySource => ImageUsage::TRANSFER_SRC,
            ResourceState::CopyDest => ImageUsage::TRANSFER_DST,
            ResourceState::UnorderedAccess => ImageUsage::STORAGE,
        }
    }
}

/// One (mip level, array layer) pair of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Subresource {
    pub mip: u32,
    pub layer: u32,
}

impl Subresource {
    pub const fn new(mip: u32, layer: u32) -> Self {
        Self { mip, layer }
    }

    /// Flat index in mip-major order, the way the immediate API numbers them.
    pub fn index(self, mip_count: u32) -> u32 {
        self.mip + self.layer * mip_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aspect {
    Color,
    Depth,
    Stencil,
    DepthStencil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageViewType {
    D2,
    D2Array,
    Cube,
    CubeArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplerType {
    Nearest,
    Bilinear,
    Trilinear,
    Anisotropic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u8 },
}

impl ClearValue {
    pub fn is_depth_stencil(&self) -> bool {
        matches!(self, ClearValue::DepthStencil { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub memory_pool: MemoryPool,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageDesc {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    pub layer_count: u32,
    pub usage: ImageUsage,
    pub clear_value: Option<ClearValue>,
}

impl ImageDesc {
    /// Width and height of `mip`, clamped to one texel.
    pub fn mip_extent(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_count * self.layer_count
    }

    pub fn contains(&self, subresource: Subresource) -> bool {
        subresource.mip < self.mip_count && subresource.layer < self.layer_count
    }

    pub fn subresources(&self) -> impl Iterator<Item = Subresource> + '_ {
        (0..self.layer_count)
            .flat_map(move |layer| (0..self.mip_count).map(move |mip| Subresource { mip, layer }))
    }

    /// Longest mip chain the extent allows.
    pub fn max_mip_count(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }
}

/// Linear GPU-visible memory.
#[must_use = "buffers must be released with Device::destroy_buffer"]
#[derive(Debug)]
pub struct Buffer {
    pub(crate) key: BufferKey,
    pub(crate) desc: BufferDesc,
}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn memory_pool(&self) -> MemoryPool {
        self.desc.memory_pool
    }

    pub fn usage(&self) -> BufferUsage {
        self.desc.usage
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }
}

/// 2D, cube or array texture.
#[must_use = "images must be released with Device::destroy_image"]
#[derive(Debug)]
pub struct Image {
    pub(crate) key: ImageKey,
    pub(crate) desc: ImageDesc,
}

impl Image {
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn format(&self) -> Format {
        self.desc.format
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn mip_count(&self) -> u32 {
        self.desc.mip_count
    }

    pub fn layer_count(&self) -> u32 {
        self.desc.layer_count
    }

    pub fn usage(&self) -> ImageUsage {
        self.desc.usage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ImageViewRange {
    pub fn contains(&self, subresource: Subresource) -> bool {
        (self.base_mip..self.base_mip + self.mip_count).contains(&subresource.mip)
            && (self.base_layer..self.base_layer + self.layer_count).contains(&subresource.layer)
    }

    pub fn subresources(&self) -> impl Iterator<Item = Subresource> + '_ {
        (self.base_layer..self.base_layer + self.layer_count).flat_map(move |layer| {
            (self.base_mip..self.base_mip + self.mip_count).map(move |mip| Subresource { mip, layer })
        })
    }
}

/// Read-only projection of an image into a format, mip/layer range and aspect.
#[derive(Debug)]
pub struct ImageView<'a> {
    pub(crate) key: ImageViewKey,
    pub(crate) image: ImageKey,
    pub(crate) image_desc: ImageDesc,
    pub(crate) format: Format,
    pub(crate) range: ImageViewRange,
    pub(crate) view_type: ImageViewType,
    pub(crate) aspect: Aspect,
    pub(crate) _image: PhantomData<&'a Image>,
}

impl ImageView<'_> {
    pub fn format(&self) -> Format {
        self.format
    }

    pub fn range(&self) -> ImageViewRange {
        self.range
    }

    pub fn view_type(&self) -> ImageViewType {
        self.view_type
    }

    pub fn aspect(&self) -> Aspect {
        self.aspect
    }

    pub fn image_usage(&self) -> ImageUsage {
        self.image_desc.usage
    }

    /// Extent of the base mip covered by the view.
    pub fn extent(&self) -> (u32, u32) {
        self.image_desc.mip_extent(self.range.base_mip)
    }
}

/// Element range of a texel buffer seen through a format.
#[derive(Debug)]
pub struct BufferView<'a> {
    pub(crate) key: BufferViewKey,
    pub(crate) buffer: BufferKey,
    pub(crate) buffer_usage: BufferUsage,
    pub(crate) format: Format,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) _buffer: PhantomData<&'a Buffer>,
}

impl BufferView<'_> {
    pub fn format(&self) -> Format {
        self.format
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn element_count(&self) -> u64 {
        self.size / self.format.block_size() as u64
    }
}

/// Immutable filtering/addressing configuration.
#[must_use = "samplers must be released with Device::destroy_sampler"]
#[derive(Debug)]
pub struct Sampler {
    pub(crate) key: SamplerKey,
    pub(crate) sampler_type: SamplerType,
}

impl Sampler {
    pub fn sampler_type(&self) -> SamplerType {
        self.sampler_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(width: u32, height: u32, mips: u32, layers: u32) -> ImageDesc {
        ImageDesc {
            format: Format::R8G8B8A8Unorm,
            width,
            height,
            mip_count: mips,
            layer_count: layers,
            usage: ImageUsage::SAMPLED,
            clear_value: None,
        }
    }

    #[test]
    fn mip_extent_clamps_to_one() {
        let d = desc(256, 64, 9, 1);
        assert_eq!(d.mip_extent(0), (256, 64));
        assert_eq!(d.mip_extent(3), (32, 8));
        assert_eq!(d.mip_extent(8), (1, 1));
        assert_eq!(ImageDesc::max_mip_count(256, 64), 9);
        assert_eq!(ImageDesc::max_mip_count(1, 1), 1);
    }

    #[test]
    fn subresources_are_enumerated_layer_by_layer() {
        let d = desc(4, 4, 2, 3);
        let all: Vec<_> = d.subresources().collect();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0], Subresource::new(0, 0));
        assert_eq!(all[1], Subresource::new(1, 0));
        assert_eq!(all[2], Subresource::new(0, 1));
        assert_eq!(Subresource::new(1, 2).index(2), 5);
    }

    #[test]
    fn depth_images_copy_only_from_copy_source() {
        assert!(ResourceState::ReadGeneric.allows_copy_read(Format::R8G8B8A8Unorm));
        assert!(!ResourceState::ReadGeneric.allows_copy_read(Format::D32Float));
        assert!(ResourceState::CopySource.allows_copy_read(Format::D24UnormS8Uint));
        assert!(!ResourceState::CopyDest.allows_copy_read(Format::R8G8B8A8Unorm));
    }

    #[test]
    fn view_range_membership() {
        let range = ImageViewRange { base_mip: 1, mip_count: 2, base_layer: 6, layer_count: 6 };
        assert!(range.contains(Subresource::new(2, 11)));
        assert!(!range.contains(Subresource::new(0, 6)));
        assert!(!range.contains(Subresource::new(1, 12)));
        assert_eq!(range.subresources().count(), 12);
    }
}
