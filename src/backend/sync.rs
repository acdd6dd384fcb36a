// Synchronization primitives
//
// Two binary semaphores order acquire -> submit -> present on the GPU.
// The CPU side is serialized with queue/device idle waits instead of fences.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct FrameSync {
    /// Signalled by acquire, waited on by the draw submission
    pub image_available: vk::Semaphore,
    /// Signalled by the draw submission, waited on by present
    pub render_finished: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        let image_available = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create image-available semaphore")?;

        let render_finished = match unsafe { device.device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.device.destroy_semaphore(image_available, None) };
                return Err(e).context("Failed to create render-finished semaphore");
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            device: device.clone(),
        })
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        // Semaphores may still be pending on the queues
        if let Err(e) = self.device.wait_idle() {
            log::error!("Wait before destroying semaphores failed: {:#}", e);
        }
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
        }
    }
}
