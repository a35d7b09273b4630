// Registry keys
//
// Handles returned to callers carry one of these keys. Each backend keeps its
// native objects in slot maps indexed by the same key types, so a handle never
// exposes a backend type.

use slotmap::new_key_type;

new_key_type! {
    pub(crate) struct BufferKey;
    pub(crate) struct ImageKey;
    pub(crate) struct ImageViewKey;
    pub(crate) struct BufferViewKey;
    pub(crate) struct SamplerKey;
    pub(crate) struct SetLayoutKey;
    pub(crate) struct PipelineLayoutKey;
    pub(crate) struct DescriptorStorageKey;
    pub(crate) struct DescriptorSetKey;
    pub(crate) struct RenderPassKey;
    pub(crate) struct FramebufferKey;
    pub(crate) struct PipelineKey;
    pub(crate) struct CommandStorageKey;
    pub(crate) struct CommandListKey;
    pub(crate) struct QueueKey;
    pub(crate) struct FenceKey;
    pub(crate) struct SemaphoreKey;
    pub(crate) struct SwapChainKey;
}
