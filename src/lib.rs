// =============================================================================
// RHI - Backend-agnostic rendering hardware interface
// =============================================================================
//
// One explicit GPU API over two native backends, chosen once when the device
// is created.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Device (validation, handle bookkeeping)                        │
// │    └── BackendImpl (matched once per call)                      │
// │          ├── Vulkan backend (ash)                               │
// │          └── Software backend (CPU heaps + queue threads)       │
// │  CommandList (backend-agnostic recording)                       │
// │    └── translated once when made executable                     │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Acquire a back buffer
// 2. Record a command list, make it executable
// 3. Submit it, waiting on the acquire semaphore
// 4. Present once the submission signalled render-finished
//
// =============================================================================

mod backend;
mod capture;
mod command;
mod config;
mod descriptor;
mod device;
mod error;
mod format;
mod keys;
mod pipeline;
mod queue;
mod render_pass;
mod resource;
mod swapchain;
mod validation;

pub use capture::{CapturedBuffer, CapturedSet, DrawCall, DrawCapture, DrawKind};
pub use command::{CommandList, CommandListState, CommandListStorage, IndexType, ScissorRect, Viewport};
pub use config::{
    BackendKind, DebugConfig, DeviceConfig, LimitsConfig, PresentMode, RhiConfig, SwapchainConfig,
};
pub use descriptor::{
    AllocatedDescriptorSet, BindingKind, DescriptorCapacity, DescriptorRange, DescriptorSetDescription,
    DescriptorSetLayout, DescriptorSlot, DescriptorStorage, DescriptorValue, ShaderStages,
};
pub use device::{Device, MappedBuffer, BUFFER_DESCRIPTOR_ALIGNMENT};
pub use error::{classify, RhiError};
pub use format::Format;
pub use pipeline::{
    BlendFactor, BlendOp, ColorBlendAttachment, ColorWriteMask, CompareOp, ComputePipelineDescription,
    ComputePipelineState, CullMode, DepthStencilState, FrontFace, GraphicsPipelineDescription,
    MultisampleState, PipelineLayout, PipelineState, PolygonMode, PrimitiveTopology, RasterizerState,
    ShaderBinary, StencilOp, StencilOpState, VertexAttribute, VertexBinding,
};
pub use queue::{CommandQueue, Fence, Semaphore, SubmitSync};
pub use render_pass::{
    AccessFlags, AttachmentDescription, Framebuffer, LoadOp, PipelineStages, RenderPass, RenderPassDescription,
    StoreOp, SubpassDependency, SubpassDescription, EXTERNAL_SUBPASS,
};
pub use resource::{
    Aspect, Buffer, BufferDesc, BufferUsage, BufferView, ClearValue, Image, ImageDesc, ImageUsage, ImageView,
    ImageViewRange, ImageViewType, MemoryPool, ResourceState, Sampler, SamplerType, Subresource,
};
pub use swapchain::{SurfaceTarget, SwapChain};
