// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// The back buffers are handed to the registry as ordinary images.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;

use super::device::VulkanDevice;
use super::{conv, BACKEND};
use crate::config::{PresentMode, RhiConfig};
use crate::error::unsupported;
use crate::format::Format;
use crate::resource::ImageUsage;

pub(super) struct NativeSwapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: Format,
    pub usage: ImageUsage,
    pub extent: vk::Extent2D,
}

pub(super) fn create(device: &VulkanDevice, width: u32, height: u32, config: &RhiConfig) -> Result<NativeSwapchain> {
    let (Some((surface_loader, surface)), Some(swapchain_loader)) = (&device.surface, &device.swapchain_loader) else {
        unsupported!(BACKEND, "swapchains on a device created without a window");
    };
    let surface = *surface;

    log::info!("Creating swapchain: {}x{}", width, height);

    // Query surface capabilities
    let surface_caps = unsafe {
        surface_loader.get_physical_device_surface_capabilities(device.physical_device, surface)
    }?;

    // Query supported formats
    let formats = unsafe {
        surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
    }?;

    // Query supported present modes
    let present_modes = unsafe {
        surface_loader.get_physical_device_surface_present_modes(device.physical_device, surface)
    }?;

    // Choose surface format (prefer SRGB), limited to formats we can name
    let (surface_format, format) = formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.iter().find(|f| conv::surface_format(f.format).is_some()))
        .and_then(|f| conv::surface_format(f.format).map(|format| (*f, format)))
        .context("No suitable surface format")?;

    // Choose present mode from the config
    // IMMEDIATE: No vsync, lowest latency, may tear
    // MAILBOX: No vsync, no tearing, triple buffered
    // FIFO: Vsync enabled, guaranteed available
    let wanted = conv::present_mode(config.present_mode());
    let present_mode = if present_modes.contains(&wanted) {
        wanted
    } else {
        log::warn!("Present mode {:?} not supported, falling back to FIFO", config.present_mode());
        conv::present_mode(PresentMode::Fifo)
    };

    log::info!("Present mode: {:?}", present_mode);

    // Choose extent
    let extent = if surface_caps.current_extent.width != u32::MAX {
        surface_caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(surface_caps.min_image_extent.width, surface_caps.max_image_extent.width),
            height: height.clamp(surface_caps.min_image_extent.height, surface_caps.max_image_extent.height),
        }
    };

    // Choose image count
    let mut image_count = config.swapchain.image_count.max(surface_caps.min_image_count);
    if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
        image_count = surface_caps.max_image_count;
    }

    // Copies out of the back buffer only where the surface allows them
    let mut usage = ImageUsage::RENDER_TARGET | ImageUsage::TRANSFER_DST;
    if surface_caps.supported_usage_flags.contains(vk::ImageUsageFlags::TRANSFER_SRC) {
        usage |= ImageUsage::TRANSFER_SRC;
    }

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(conv::image_usage(usage))
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(surface_caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true);

    let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
        .context("Failed to create swapchain")?;

    // Get swapchain images
    let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
        Ok(images) => images,
        Err(err) => {
            unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
            return Err(err).context("Failed to get swapchain images");
        }
    };

    log::info!("Created swapchain with {} images", images.len());

    Ok(NativeSwapchain { swapchain, images, format, usage, extent })
}

/// Acquire next image for rendering
pub(super) fn acquire_next_image(
    loader: &khr::Swapchain,
    swapchain: vk::SwapchainKHR,
    semaphore: vk::Semaphore,
) -> Result<u32> {
    let result = unsafe { loader.acquire_next_image(swapchain, u64::MAX, semaphore, vk::Fence::null()) };

    match result {
        Ok((index, suboptimal)) => {
            if suboptimal {
                log::debug!("Swapchain suboptimal");
            }
            Ok(index)
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            anyhow::bail!("Swapchain out of date")
        }
        Err(e) => Err(e.into()),
    }
}

/// Present rendered image to screen
pub(super) fn present(
    loader: &khr::Swapchain,
    queue: vk::Queue,
    swapchain: vk::SwapchainKHR,
    image_index: u32,
    wait_semaphores: &[vk::Semaphore],
) -> Result<()> {
    let swapchains = [swapchain];
    let image_indices = [image_index];

    let present_info = vk::PresentInfoKHR::builder()
        .wait_semaphores(wait_semaphores)
        .swapchains(&swapchains)
        .image_indices(&image_indices);

    let result = unsafe { loader.queue_present(queue, &present_info) };

    match result {
        Ok(_) => Ok(()),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            log::warn!("Swapchain out of date at present");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
