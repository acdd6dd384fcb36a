// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device scan with a pluggable suitability policy
// - Queue family discovery (graphics + present)
// - Logical device + queue creation

use anyhow::{Context, Result};
use ash::vk;
use std::collections::BTreeSet;
use std::ffi::CStr;
use std::sync::Arc;

use super::swapchain::SwapchainSupport;
use super::{RendererError, Surface, VulkanInstance};

/// Device extensions every candidate must expose
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 1] = [c"VK_KHR_swapchain"];

/// First queue family indices offering graphics and presentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan the families once, stopping as soon as both roles are covered.
    ///
    /// `supports_present` is asked about every family visited until the
    /// scan completes.
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> Result<Self>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut indices = Self::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_count == 0 {
                continue;
            }

            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }

            if indices.present.is_none() && supports_present(index)? {
                indices.present = Some(index);
            }

            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    pub fn resolve(&self) -> Result<QueueFamilies, RendererError> {
        Ok(QueueFamilies {
            graphics: self.graphics.ok_or(RendererError::MissingQueueFamily("graphics"))?,
            present: self.present.ok_or(RendererError::MissingQueueFamily("present"))?,
        })
    }
}

/// Resolved queue family pair of the selected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, one queue is created per entry
    pub fn unique(&self) -> Vec<u32> {
        BTreeSet::from([self.graphics, self.present]).into_iter().collect()
    }
}

/// Everything the suitability policy gets to look at for one adapter.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub queue_families: QueueFamilyIndices,
    pub extensions_supported: bool,
    /// Only queried when the swapchain extension is present
    pub swapchain_support: Option<SwapchainSupport>,
}

impl DeviceCandidate {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Device suitability policy
pub trait DeviceSelector {
    fn is_suitable(&self, candidate: &DeviceCandidate) -> bool;
}

/// Discrete GPU with geometry shaders, both queue roles, the swapchain
/// extension and at least one surface format and present mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscreteGpuSelector;

impl DeviceSelector for DiscreteGpuSelector {
    fn is_suitable(&self, candidate: &DeviceCandidate) -> bool {
        let swapchain_adequate = candidate
            .swapchain_support
            .as_ref()
            .is_some_and(SwapchainSupport::is_adequate);

        candidate.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
            && candidate.features.geometry_shader == vk::TRUE
            && candidate.queue_families.is_complete()
            && candidate.extensions_supported
            && swapchain_adequate
    }
}

/// Return the first candidate the selector accepts, along with how many
/// candidates were suitable overall.
pub fn select_first<'a, S>(candidates: &'a [DeviceCandidate], selector: &S) -> (Option<&'a DeviceCandidate>, usize)
where
    S: DeviceSelector + ?Sized,
{
    let mut suitable = candidates.iter().filter(|c| selector.is_suitable(c));
    let first = suitable.next();
    let count = first.map_or(0, |_| 1 + suitable.count());
    (first, count)
}

/// True when every required extension name appears in `available`.
pub fn extensions_supported(available: &[vk::ExtensionProperties], required: &[&CStr]) -> bool {
    let mut missing: BTreeSet<&CStr> = required.iter().copied().collect();
    for extension in available {
        let name = unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) };
        missing.remove(name);
    }
    missing.is_empty()
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub swapchain_loader: ash::extensions::khr::Swapchain,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilies,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub instance: Arc<VulkanInstance>,
}

impl VulkanDevice {
    /// Pick the first adapter `selector` accepts and open a logical device on it
    pub fn new(
        instance: Arc<VulkanInstance>,
        surface: &Surface,
        selector: &dyn DeviceSelector,
        enable_validation: bool,
    ) -> Result<Arc<Self>> {
        let candidates = Self::gather_candidates(&instance.instance, surface)?;
        if candidates.is_empty() {
            return Err(RendererError::NoVulkanDevice.into());
        }

        let (chosen, suitable_count) = select_first(&candidates, selector);
        let chosen = chosen.ok_or(RendererError::NoSuitableDevice)?;
        log::info!("Number of suitable devices found: {}", suitable_count);

        let queue_families = chosen.queue_families.resolve()?;
        let physical_device = chosen.physical_device;

        let device = Self::create_logical_device(
            &instance.instance,
            physical_device,
            queue_families,
            enable_validation,
        )?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        let properties = chosen.properties;
        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        log::info!("Selected GPU: {}", chosen.name());
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::debug!(
            "Queue families: graphics={} present={}",
            queue_families.graphics,
            queue_families.present
        );

        let swapchain_loader = ash::extensions::khr::Swapchain::new(&instance.instance, &device);

        Ok(Arc::new(Self {
            device,
            physical_device,
            swapchain_loader,
            graphics_queue,
            present_queue,
            queue_families,
            properties,
            memory_properties,
            instance,
        }))
    }

    fn gather_candidates(instance: &ash::Instance, surface: &Surface) -> Result<Vec<DeviceCandidate>> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        devices
            .into_iter()
            .map(|physical_device| {
                let properties = unsafe { instance.get_physical_device_properties(physical_device) };
                let features = unsafe { instance.get_physical_device_features(physical_device) };
                let families =
                    unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

                let queue_families = QueueFamilyIndices::find(&families, |index| {
                    surface.supports_present(physical_device, index)
                })?;

                let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }?;
                let extensions_supported = extensions_supported(&available, &REQUIRED_DEVICE_EXTENSIONS);

                let swapchain_support = if extensions_supported {
                    Some(SwapchainSupport::query(surface, physical_device)?)
                } else {
                    None
                };

                Ok(DeviceCandidate {
                    physical_device,
                    properties,
                    features,
                    queue_families,
                    extensions_supported,
                    swapchain_support,
                })
            })
            .collect()
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
        enable_validation: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<_> = REQUIRED_DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();

        // Device layers are deprecated but older loaders still honour them
        let layer_names = if enable_validation {
            vec![super::instance::VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_device(None);
        }
    }
}
