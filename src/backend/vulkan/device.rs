// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation from raw window handles
// - Physical device selection (prefer discrete GPU that can present)
// - Logical device + queue creation

use std::ffi::{c_char, CStr, CString};

use anyhow::{Context, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::unsupported;
use super::BACKEND;

/// Vulkan instance, device and the one graphics queue everything runs on
pub(super) struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Presentation (only when created for a window)
    pub surface: Option<(khr::Surface, vk::SurfaceKHR)>,
    pub swapchain_loader: Option<khr::Swapchain>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub anisotropy: bool,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `window` - Native window to present to, if any
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
    ) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let display = window.map(|(display, _)| display);
        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Create the window surface before picking a GPU that can present to it
        let surface = match window {
            Some((display, window)) => {
                let loader = khr::Surface::new(&entry, &instance);
                let surface = create_surface(&entry, &instance, display, window)?;
                Some((loader, surface))
            }
            None => None,
        };

        // Step 5: Pick physical device (GPU)
        let (physical_device, graphics_queue_family) =
            Self::pick_physical_device(&instance, surface.as_ref())?;

        // Step 6: Create logical device
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let anisotropy = features.sampler_anisotropy == vk::TRUE;
        let (device, graphics_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            surface.is_some(),
            &features,
        )?;

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let swapchain_loader = surface.as_ref().map(|_| khr::Swapchain::new(&instance, &device));

        Ok(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            graphics_queue,
            graphics_queue_family,
            surface,
            swapchain_loader,
            debug_utils,
            properties,
            memory_properties,
            anisotropy,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: Option<RawDisplayHandle>,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("rhi")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if enable_validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        // Platform-specific surface extensions
        if let Some(display) = display {
            extensions.push(khr::Surface::name().as_ptr());
            extensions.push(surface_extension(display)?.as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface: Option<&(khr::Surface, vk::SurfaceKHR)>,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            // Find a graphics queue family, which must also present when we have a surface
            let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .enumerate()
                .filter(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
                .map(|(i, _)| i as u32)
                .find(|&family| match surface {
                    Some((loader, surface)) => unsafe {
                        loader
                            .get_physical_device_surface_support(device, family, *surface)
                            .unwrap_or(false)
                    },
                    None => true,
                });

            if let Some(graphics_family) = graphics_family {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        presents: bool,
        supported: &vk::PhysicalDeviceFeatures,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        // Required device extensions
        let mut extensions = Vec::new();
        if presents {
            extensions.push(khr::Swapchain::name().as_ptr());
        }

        // Optional features are turned on when the GPU has them
        let features = vk::PhysicalDeviceFeatures::builder()
            .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE)
            .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE)
            .image_cube_array(supported.image_cube_array == vk::TRUE)
            .texture_compression_bc(supported.texture_compression_bc == vk::TRUE);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);
            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance extension that creates surfaces for `display`.
fn surface_extension(display: RawDisplayHandle) -> Result<&'static CStr> {
    Ok(match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => unsupported!(BACKEND, "surfaces on {:?}", other),
    })
}

fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
            let hinstance = window.hinstance.map_or(0, |h| h.get());
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance as vk::HINSTANCE)
                .hwnd(window.hwnd.get() as vk::HWND);
            let loader = khr::Win32Surface::new(entry, instance);
            unsafe { loader.create_win32_surface(&create_info, None) }
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let Some(dpy) = display.display else {
                unsupported!(BACKEND, "Xlib windows without a display connection");
            };
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut _)
                .window(window.window);
            let loader = khr::XlibSurface::new(entry, instance);
            unsafe { loader.create_xlib_surface(&create_info, None) }
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let Some(connection) = display.connection else {
                unsupported!(BACKEND, "XCB windows without a connection");
            };
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr() as *mut _)
                .window(window.window.get());
            let loader = khr::XcbSurface::new(entry, instance);
            unsafe { loader.create_xcb_surface(&create_info, None) }
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut _)
                .surface(window.surface.as_ptr() as *mut _);
            let loader = khr::WaylandSurface::new(entry, instance);
            unsafe { loader.create_wayland_surface(&create_info, None) }
        }
        (display, window) => unsupported!(BACKEND, "window {:?} on display {:?}", window, display),
    };
    surface.context("Failed to create window surface")
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
