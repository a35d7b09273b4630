// Backend module - native implementations behind the Device facade
//
// Each backend owns slot-map registries keyed by the handle keys and
// implements `Backend`. `Device` holds a `BackendImpl` and matches on it once
// per call through `with_backend!`.

use std::ptr::NonNull;

use anyhow::Result;

use crate::capture::DrawCapture;
use crate::command::Command;
use crate::config::{BackendKind, RhiConfig};
use crate::descriptor::{DescriptorCapacity, DescriptorSetDescription, ResolvedWrite};
use crate::format::Format;
use crate::keys::*;
use crate::pipeline::{ComputePipelineDescription, GraphicsPipelineDescription};
use crate::queue::ResolvedSync;
use crate::render_pass::RenderPassDescription;
use crate::resource::{BufferDesc, ImageDesc, ImageViewRange, ImageViewType, Aspect, SamplerType};
use crate::swapchain::SurfaceTarget;

pub(crate) mod software;
#[cfg(feature = "vulkan")]
pub(crate) mod vulkan;

/// Everything a backend needs to build an image view.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageViewDesc {
    pub format: Format,
    pub range: ImageViewRange,
    pub view_type: ImageViewType,
    pub aspect: Aspect,
}

/// One set to carve out of a descriptor storage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SetAllocation {
    pub layout: SetLayoutKey,
    pub starting_index: u32,
    pub slot_count: u32,
}

/// Back buffers registered by a backend for a new swap chain.
#[derive(Debug)]
pub(crate) struct SwapchainParts {
    pub key: SwapChainKey,
    pub images: Vec<(ImageKey, ImageDesc)>,
    pub format: Format,
    pub extent: (u32, u32),
}

/// Host-side view of a mapped buffer.
#[derive(Debug)]
pub(crate) enum MappedBytes {
    /// Staging copy written back on unmap.
    Owned(Vec<u8>),
    /// Pointer into persistently coherent device memory.
    Raw { ptr: NonNull<u8>, len: usize },
}

impl MappedBytes {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            MappedBytes::Owned(bytes) => bytes,
            // Safety: the backend keeps the memory mapped until unmap.
            MappedBytes::Raw { ptr, len } => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) },
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            MappedBytes::Owned(bytes) => bytes,
            // Safety: as above, and the mapping is exclusive.
            MappedBytes::Raw { ptr, len } => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), *len) },
        }
    }
}

/// The native half of every `Device` operation.
///
/// Inputs are validated by the facade before they get here; backends only
/// check what depends on their own capabilities.
pub(crate) trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    // Resources
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferKey>;
    fn destroy_buffer(&self, key: BufferKey);
    fn map_buffer(&self, key: BufferKey) -> Result<MappedBytes>;
    fn unmap_buffer(&self, key: BufferKey, bytes: MappedBytes);
    fn create_image(&self, desc: &ImageDesc) -> Result<ImageKey>;
    fn destroy_image(&self, key: ImageKey);
    fn create_image_view(&self, image: ImageKey, desc: &ImageViewDesc) -> Result<ImageViewKey>;
    fn destroy_image_view(&self, key: ImageViewKey);
    fn create_buffer_view(&self, buffer: BufferKey, format: Format, offset: u64, size: u64) -> Result<BufferViewKey>;
    fn destroy_buffer_view(&self, key: BufferViewKey);
    fn create_sampler(&self, sampler_type: SamplerType) -> Result<SamplerKey>;
    fn destroy_sampler(&self, key: SamplerKey);

    // Descriptors
    fn create_set_layout(&self, desc: &DescriptorSetDescription) -> Result<SetLayoutKey>;
    fn destroy_set_layout(&self, key: SetLayoutKey);
    fn create_pipeline_layout(&self, sets: &[SetLayoutKey]) -> Result<PipelineLayoutKey>;
    fn destroy_pipeline_layout(&self, key: PipelineLayoutKey);
    fn create_descriptor_storage(&self, max_sets: u32, capacities: &[DescriptorCapacity]) -> Result<DescriptorStorageKey>;
    fn reset_descriptor_storage(&self, key: DescriptorStorageKey) -> Result<()>;
    fn destroy_descriptor_storage(&self, key: DescriptorStorageKey);
    fn allocate_descriptor_sets(&self, storage: DescriptorStorageKey, sets: &[SetAllocation]) -> Result<Vec<DescriptorSetKey>>;
    fn write_descriptors(&self, set: DescriptorSetKey, writes: &[ResolvedWrite]) -> Result<()>;

    // Pipelines
    fn create_render_pass(&self, desc: &RenderPassDescription) -> Result<RenderPassKey>;
    fn destroy_render_pass(&self, key: RenderPassKey);
    fn create_framebuffer(&self, render_pass: RenderPassKey, views: &[ImageViewKey], width: u32, height: u32) -> Result<FramebufferKey>;
    fn destroy_framebuffer(&self, key: FramebufferKey);
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescription,
        render_pass: RenderPassKey,
        layout: PipelineLayoutKey,
        subpass: u32,
    ) -> Result<PipelineKey>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDescription, layout: PipelineLayoutKey) -> Result<PipelineKey>;
    fn destroy_pipeline(&self, key: PipelineKey);

    // Commands
    fn create_command_storage(&self) -> Result<CommandStorageKey>;
    fn reset_command_storage(&self, key: CommandStorageKey) -> Result<()>;
    fn destroy_command_storage(&self, key: CommandStorageKey);
    fn create_command_list(&self, storage: CommandStorageKey) -> Result<CommandListKey>;
    fn destroy_command_list(&self, storage: CommandStorageKey, key: CommandListKey);
    fn reset_command_list(&self, key: CommandListKey) -> Result<()>;
    /// Turn a finished recording into something the queue can run.
    fn translate_command_list(&self, storage: CommandStorageKey, key: CommandListKey, commands: &[Command]) -> Result<()>;

    // Queues and sync
    fn create_queue(&self) -> Result<QueueKey>;
    fn submit(&self, queue: QueueKey, list: CommandListKey, sync: &ResolvedSync) -> Result<u64>;
    fn is_complete(&self, queue: QueueKey, serial: u64) -> Result<bool>;
    fn wait_queue_idle(&self, queue: QueueKey) -> Result<()>;
    fn create_fence(&self, signaled: bool) -> Result<FenceKey>;
    fn wait_for_fence(&self, key: FenceKey, timeout_ns: u64) -> Result<bool>;
    fn is_fence_signaled(&self, key: FenceKey) -> Result<bool>;
    fn reset_fence(&self, key: FenceKey) -> Result<()>;
    fn destroy_fence(&self, key: FenceKey);
    fn create_semaphore(&self) -> Result<SemaphoreKey>;
    fn destroy_semaphore(&self, key: SemaphoreKey);

    // Presentation
    fn create_swapchain(&self, target: &SurfaceTarget, width: u32, height: u32, config: &RhiConfig) -> Result<SwapchainParts>;
    fn acquire_next_image(&self, swapchain: SwapChainKey, signal: SemaphoreKey) -> Result<u32>;
    fn present(&self, queue: QueueKey, swapchain: SwapChainKey, index: u32, wait: SemaphoreKey) -> Result<()>;
    fn destroy_swapchain(&self, key: SwapChainKey);

    fn take_draw_capture(&self) -> Option<DrawCapture>;
    fn wait_idle(&self) -> Result<()>;
}

/// The backend a device was created with.
pub(crate) enum BackendImpl {
    #[cfg(feature = "vulkan")]
    Vulkan(vulkan::VulkanBackend),
    Software(software::SoftwareBackend),
}

impl BackendImpl {
    pub(crate) fn new(config: &RhiConfig, target: Option<&SurfaceTarget>) -> Result<Self> {
        match config.device.backend {
            #[cfg(feature = "vulkan")]
            BackendKind::Vulkan => Ok(BackendImpl::Vulkan(vulkan::VulkanBackend::new(config, target)?)),
            #[cfg(not(feature = "vulkan"))]
            BackendKind::Vulkan => crate::error::unsupported!("vulkan", "crate built without the `vulkan` feature"),
            BackendKind::Software => Ok(BackendImpl::Software(software::SoftwareBackend::new(config, target)?)),
        }
    }
}

/// Run `$body` with `$b` bound to the concrete backend.
macro_rules! with_backend {
    ($backend:expr, $b:ident => $body:expr) => {
        match $backend {
            #[cfg(feature = "vulkan")]
            $crate::backend::BackendImpl::Vulkan($b) => $body,
            $crate::backend::BackendImpl::Software($b) => $body,
        }
    };
}

pub(crate) use with_backend;
