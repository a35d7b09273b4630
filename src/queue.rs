// Queues and explicit synchronization objects

use crate::keys::{FenceKey, QueueKey, SemaphoreKey};

/// In-order execution queue. Lists submitted to the same queue complete in
/// submission order.
#[derive(Debug)]
pub struct CommandQueue {
    pub(crate) key: QueueKey,
    pub(crate) presentable: bool,
}

impl CommandQueue {
    pub fn is_presentable(&self) -> bool {
        self.presentable
    }
}

/// Host-visible completion signal.
#[must_use = "fences must be released with Device::destroy_fence"]
#[derive(Debug)]
pub struct Fence {
    pub(crate) key: FenceKey,
}

/// GPU-side ordering signal between submissions and presentation.
#[must_use = "semaphores must be released with Device::destroy_semaphore"]
#[derive(Debug)]
pub struct Semaphore {
    pub(crate) key: SemaphoreKey,
}

/// Explicit synchronization attached to one submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubmitSync<'a> {
    pub wait: &'a [&'a Semaphore],
    pub signal: &'a [&'a Semaphore],
    pub fence: Option<&'a Fence>,
}

impl<'a> SubmitSync<'a> {
    pub fn fence(fence: &'a Fence) -> Self {
        Self { fence: Some(fence), ..Self::default() }
    }
}

/// Keys of a `SubmitSync`, as handed to the backends.
#[derive(Debug, Default, Clone)]
pub(crate) struct ResolvedSync {
    pub wait: Vec<SemaphoreKey>,
    pub signal: Vec<SemaphoreKey>,
    pub fence: Option<FenceKey>,
}

impl From<&SubmitSync<'_>> for ResolvedSync {
    fn from(sync: &SubmitSync<'_>) -> Self {
        Self {
            wait: sync.wait.iter().map(|s| s.key).collect(),
            signal: sync.signal.iter().map(|s| s.key).collect(),
            fence: sync.fence.map(|f| f.key),
        }
    }
}
