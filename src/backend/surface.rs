// Presentation surface bound to the application window

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::VulkanInstance;

pub struct Surface {
    pub surface: vk::SurfaceKHR,
    pub loader: ash::extensions::khr::Surface,
    // Keeps the instance alive until the surface is gone
    _instance: Arc<VulkanInstance>,
}

impl Surface {
    pub fn new(
        instance: Arc<VulkanInstance>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        let loader = ash::extensions::khr::Surface::new(&instance.entry, &instance.instance);

        let surface = unsafe {
            ash_window::create_surface(&instance.entry, &instance.instance, display, window, None)
        }
        .context("Failed to create window surface")?;

        Ok(Arc::new(Self {
            surface,
            loader,
            _instance: instance,
        }))
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.surface)
        }?;
        Ok(supported)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}
