// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// and the policy for rebuilding it when the surface changes.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::{RendererError, Surface, VulkanDevice};

/// Format used when the surface leaves the choice to us
pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// What a surface can do for one physical device
#[derive(Debug, Clone)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(surface: &Surface, physical_device: vk::PhysicalDevice) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, surface.surface)?,
                formats: surface
                    .loader
                    .get_physical_device_surface_formats(physical_device, surface.surface)?,
                present_modes: surface
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, surface.surface)?,
            })
        }
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Pick the surface format.
///
/// A lone `UNDEFINED` entry means the surface takes anything, so the
/// preferred pair is used. Otherwise the preferred pair if listed, else the
/// first reported format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR, RendererError> {
    match formats {
        [] => Err(RendererError::NoSurfaceFormat),
        [only] if only.format == vk::Format::UNDEFINED => Ok(PREFERRED_FORMAT),
        _ => Ok(formats
            .iter()
            .copied()
            .find(|f| f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space)
            .unwrap_or(formats[0])),
    }
}

/// Pick the present mode.
///
/// MAILBOX: No vsync, no tearing, triple buffered
/// IMMEDIATE: No vsync, lowest latency, may tear
/// FIFO: Vsync enabled, guaranteed available
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else if present_modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Pick the image extent.
///
/// A `u32::MAX` current extent means the window decides; then the client
/// size is clamped to the supported range on each axis.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: window.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum when there is one
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        image_count
    }
}

/// Replace the value in `slot` with one built from the current value.
///
/// The old value is handed to `create` and only dropped once the
/// replacement exists, so a swapchain can seed its successor and is torn
/// down after the new one is live. If `create` fails the old value is
/// dropped as well.
pub fn replace_retiring<T, F>(slot: &mut Option<T>, create: F) -> Result<()>
where
    F: FnOnce(Option<&T>) -> Result<T>,
{
    let old = slot.take();
    let new = create(old.as_ref())?;
    drop(old);
    *slot = Some(new);
    Ok(())
}

/// Result of asking for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of queueing an image for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Shown (or dropped) but the swapchain no longer matches the surface
    Stale,
}

/// Map the raw acquire result; anything but success/suboptimal/out-of-date is fatal.
pub fn classify_acquire(result: ash::prelude::VkResult<(u32, bool)>) -> Result<AcquireOutcome, RendererError> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready { image_index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(result) => Err(RendererError::Frame { stage: "acquire", result }),
    }
}

/// Map the raw present result; out-of-date and suboptimal both mean stale.
pub fn classify_present(result: ash::prelude::VkResult<bool>) -> Result<PresentOutcome, RendererError> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
        Err(result) => Err(RendererError::Frame { stage: "present", result }),
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Build a swapchain for `surface`.
    ///
    /// `old` is passed to the driver so it can recycle resources; the caller
    /// still owns it and destroys it afterwards.
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: &Surface,
        window_size: vk::Extent2D,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let support = SwapchainSupport::query(surface, device.physical_device)?;

        let surface_format = choose_surface_format(&support.formats)?;
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, window_size);
        let image_count = choose_image_count(&support.capabilities);

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        let families = device.queue_families;
        let family_indices = [families.graphics, families.present];

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |o| o.swapchain));

        create_info = if families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let swapchain = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swap chain")?;

        let images = match unsafe { device.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { device.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to get swapchain images");
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        // Views are pushed as they are created so Drop cleans up a partial set
        let mut chain = Self {
            swapchain,
            images,
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            present_mode,
            device,
        };

        for i in 0..chain.images.len() {
            let view = create_color_view(&chain.device, chain.images[i], chain.format)?;
            chain.image_views.push(view);
        }

        Ok(chain)
    }

    /// Acquire next image for rendering, waiting as long as it takes
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome, RendererError> {
        let result = unsafe {
            self.device.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        classify_acquire(result)
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome, RendererError> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.device.swapchain_loader.queue_present(queue, &present_info) };

        classify_present(result)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain {:?}", self.swapchain);
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.device.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// 2D color view over a whole single-mip image
pub fn create_color_view(device: &VulkanDevice, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.device.create_image_view(&create_info, None) }.context("Failed to create image view")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn capabilities(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn key(f: vk::SurfaceFormatKHR) -> (vk::Format, vk::ColorSpaceKHR) {
        (f.format, f.color_space)
    }

    #[test]
    fn undefined_placeholder_selects_preferred_pair() {
        let formats = [format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(key(choose_surface_format(&formats).unwrap()), key(PREFERRED_FORMAT));
    }

    #[test]
    fn exact_preferred_pair_wins_over_order() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            PREFERRED_FORMAT,
        ];
        assert_eq!(key(choose_surface_format(&formats).unwrap()), key(PREFERRED_FORMAT));
    }

    #[test]
    fn falls_back_to_first_reported_format() {
        let formats = [
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(key(chosen), key(formats[0]));
        assert!(formats.iter().any(|f| key(*f) == key(chosen)));
    }

    #[test]
    fn undefined_among_others_is_not_the_placeholder() {
        let formats = [
            format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(key(choose_surface_format(&formats).unwrap()), key(formats[0]));
    }

    #[test]
    fn empty_format_list_is_an_error() {
        assert!(matches!(choose_surface_format(&[]), Err(RendererError::NoSurfaceFormat)));
    }

    #[test]
    fn present_mode_preference_order() {
        use ash::vk::PresentModeKHR as M;

        assert_eq!(choose_present_mode(&[M::FIFO, M::IMMEDIATE, M::MAILBOX]), M::MAILBOX);
        assert_eq!(choose_present_mode(&[M::MAILBOX]), M::MAILBOX);
        assert_eq!(choose_present_mode(&[M::FIFO, M::IMMEDIATE]), M::IMMEDIATE);
        assert_eq!(choose_present_mode(&[M::FIFO_RELAXED, M::FIFO]), M::FIFO);
        assert_eq!(choose_present_mode(&[]), M::FIFO);
    }

    #[test]
    fn fixed_current_extent_is_used_verbatim() {
        let caps = capabilities((800, 600), (1, 1), (4096, 4096));
        assert_eq!(choose_extent(&caps, extent(1920, 1080)), extent(800, 600));
    }

    #[test]
    fn unconstrained_extent_clamps_window_size() {
        let caps = capabilities((u32::MAX, u32::MAX), (200, 100), (1000, 800));

        assert_eq!(choose_extent(&caps, extent(640, 480)), extent(640, 480));
        assert_eq!(choose_extent(&caps, extent(50, 2000)), extent(200, 800));
        assert_eq!(choose_extent(&caps, extent(5000, 10)), extent(1000, 100));
    }

    #[test]
    fn unconstrained_extent_stays_within_bounds() {
        let caps = capabilities((u32::MAX, u32::MAX), (16, 32), (256, 128));
        for width in [0, 1, 16, 100, 256, 257, u32::MAX - 1] {
            for height in [0, 31, 32, 64, 128, 1000] {
                let chosen = choose_extent(&caps, extent(width, height));
                assert_eq!(chosen.width, width.clamp(16, 256));
                assert_eq!(chosen.height, height.clamp(32, 128));
            }
        }
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);

        caps.max_image_count = 8;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn acquire_results_are_classified() {
        assert_eq!(
            classify_acquire(Ok((2, false))).unwrap(),
            AcquireOutcome::Ready { image_index: 2, suboptimal: false }
        );
        assert_eq!(
            classify_acquire(Ok((0, true))).unwrap(),
            AcquireOutcome::Ready { image_index: 0, suboptimal: true }
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert!(matches!(
            classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(RendererError::Frame { stage: "acquire", result: vk::Result::ERROR_DEVICE_LOST })
        ));
    }

    #[test]
    fn present_results_are_classified() {
        assert_eq!(classify_present(Ok(false)).unwrap(), PresentOutcome::Presented);
        assert_eq!(classify_present(Ok(true)).unwrap(), PresentOutcome::Stale);
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentOutcome::Stale
        );
        assert!(matches!(
            classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(RendererError::Frame { stage: "present", .. })
        ));
    }

    /// Stand-in for a swapchain that records its lifetime events
    struct Chain {
        id: u32,
        seeded_from: Option<u32>,
        extent: vk::Extent2D,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Drop for Chain {
        fn drop(&mut self) {
            self.log.borrow_mut().push(format!("destroy {}", self.id));
        }
    }

    fn rebuild(slot: &mut Option<Chain>, next_id: u32, log: &Rc<RefCell<Vec<String>>>) {
        replace_retiring(slot, |old| {
            log.borrow_mut().push(format!("create {}", next_id));
            Ok(Chain {
                id: next_id,
                seeded_from: old.map(|o| o.id),
                extent: old.map_or(extent(800, 600), |o| o.extent),
                log: log.clone(),
            })
        })
        .unwrap();
    }

    #[test]
    fn old_chain_is_destroyed_after_replacement_is_live() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut slot = None;

        rebuild(&mut slot, 1, &log);
        rebuild(&mut slot, 2, &log);

        assert_eq!(*log.borrow(), vec!["create 1", "create 2", "destroy 1"]);
        assert_eq!(slot.as_ref().unwrap().seeded_from, Some(1));
    }

    #[test]
    fn back_to_back_recreation_is_idempotent_and_leak_free() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut slot = None;

        rebuild(&mut slot, 1, &log);
        let first_extent = slot.as_ref().unwrap().extent;
        rebuild(&mut slot, 2, &log);
        rebuild(&mut slot, 3, &log);

        let current = slot.as_ref().unwrap();
        assert_eq!(current.id, 3);
        assert_eq!(current.seeded_from, Some(2));
        assert_eq!(current.extent, first_extent);

        // Every intermediate chain was destroyed exactly once
        let destroyed: Vec<_> = log.borrow().iter().filter(|e| e.starts_with("destroy")).cloned().collect();
        assert_eq!(destroyed, vec!["destroy 1", "destroy 2"]);

        drop(slot);
        assert_eq!(log.borrow().last().unwrap(), "destroy 3");
    }

    #[test]
    fn failed_replacement_drops_the_old_value() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut slot = None;
        rebuild(&mut slot, 1, &log);

        let result = replace_retiring(&mut slot, |_| -> Result<Chain> { anyhow::bail!("surface lost") });

        assert!(result.is_err());
        assert!(slot.is_none());
        assert_eq!(log.borrow().last().unwrap(), "destroy 1");
    }
}
