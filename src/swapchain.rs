// Presentation targets and swap chains
//
// Back buffers are ordinary images owned by the swap chain. They start out in
// the `Present` state and must be handed back in `Present` before presenting.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use crate::error::violation;
use crate::format::Format;
use crate::keys::SwapChainKey;
use crate::queue::Semaphore;
use crate::resource::Image;

/// What a swap chain presents to.
#[derive(Debug, Clone, Copy)]
pub enum SurfaceTarget {
    /// A native window (Vulkan only).
    Window {
        display: RawDisplayHandle,
        window: RawWindowHandle,
    },
    /// An offscreen ring of back buffers (software backend only).
    Headless { format: Format },
}

impl SurfaceTarget {
    pub fn from_window<W: HasWindowHandle + HasDisplayHandle>(window: &W) -> Result<Self> {
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        Ok(SurfaceTarget::Window { display, window })
    }
}

/// Ring of presentable back buffers.
#[derive(Debug)]
pub struct SwapChain {
    pub(crate) key: SwapChainKey,
    pub(crate) images: Vec<Image>,
    pub(crate) format: Format,
    pub(crate) extent: (u32, u32),
    pub(crate) image_available: Semaphore,
    pub(crate) render_finished: Semaphore,
    pub(crate) acquired: Mutex<Vec<bool>>,
}

impl SwapChain {
    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn image(&self, index: u32) -> Option<&Image> {
        self.images.get(index as usize)
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    /// Signalled when the back buffer returned by the last acquire is ready
    /// to be written. Wait on it in the first submission touching that image.
    pub fn image_available(&self) -> &Semaphore {
        &self.image_available
    }

    /// Signal this from the last submission before `present`; presentation
    /// waits on it.
    pub fn render_finished(&self) -> &Semaphore {
        &self.render_finished
    }

    pub(crate) fn mark_acquired(&self, index: u32) -> Result<()> {
        let mut acquired = self.acquired.lock();
        match acquired.get_mut(index as usize) {
            Some(slot) if *slot => violation!("back buffer {} acquired twice without present", index),
            Some(slot) => {
                *slot = true;
                Ok(())
            }
            None => violation!("back buffer index {} out of range", index),
        }
    }

    pub(crate) fn release(&self, index: u32) -> Result<()> {
        let mut acquired = self.acquired.lock();
        match acquired.get_mut(index as usize) {
            Some(slot) if *slot => {
                *slot = false;
                Ok(())
            }
            Some(_) => violation!("back buffer {} presented without being acquired", index),
            None => violation!("back buffer index {} out of range", index),
        }
    }
}
