// Texture upload
//
// Pixels go into a linear, host-visible staging image, are copied into an
// optimal-tiled device-local image, and that image ends up shader-readable.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;

use super::buffer::{allocate_memory, STAGING_MEMORY};
use super::commands::CommandPool;
use super::swapchain::create_color_view;
use super::{RendererError, VulkanDevice};

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Decoded RGBA8 pixels
pub struct Pixels {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Pixels {
    pub fn load(path: &Path) -> Result<Self> {
        let decoded = image::open(path).map_err(|source| RendererError::TextureDecode {
            path: path.display().to_string(),
            source,
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        log::debug!("Decoded {:?}: {}x{} RGBA8", path, width, height);

        Ok(Self {
            width,
            height,
            rgba: rgba.into_raw(),
        })
    }
}

/// Access masks and stages of one legal layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Look up the barrier parameters for `old -> new`; other pairs are rejected.
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<TransitionMasks, RendererError> {
    use ash::vk::AccessFlags as A;
    use ash::vk::ImageLayout as L;
    use ash::vk::PipelineStageFlags as S;

    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        (L::PREINITIALIZED, L::TRANSFER_SRC_OPTIMAL) => (A::HOST_WRITE, A::TRANSFER_READ, S::HOST, S::TRANSFER),
        (L::PREINITIALIZED, L::TRANSFER_DST_OPTIMAL) => (A::HOST_WRITE, A::TRANSFER_WRITE, S::HOST, S::TRANSFER),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        _ => return Err(RendererError::UnsupportedTransition { old, new }),
    };

    Ok(TransitionMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

const COLOR_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// Transition `image` between layouts with a one-time barrier.
///
/// The pair is validated before anything is recorded.
pub fn transition_image_layout(
    commands: &CommandPool,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let masks = transition_masks(old, new)?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE)
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .build();

    commands.submit_once(|device, cmd| unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    })
}

/// 2D image with its own memory allocation
pub struct Image {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    device: Arc<VulkanDevice>,
}

impl Image {
    pub fn new(
        device: &Arc<VulkanDevice>,
        width: u32,
        height: u32,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(TEXTURE_FORMAT)
            .tiling(tiling)
            .initial_layout(vk::ImageLayout::PREINITIALIZED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let memory = match allocate_memory(device, requirements, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let created = Self {
            image,
            memory,
            device: device.clone(),
        };

        unsafe { device.device.bind_image_memory(image, memory, 0) }
            .context("Failed to bind image memory")?;

        Ok(created)
    }

    /// Write tightly packed RGBA8 rows into a linear host-visible image,
    /// honouring the driver's row pitch.
    pub fn write_pixels(&self, pixels: &Pixels) -> Result<()> {
        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe { self.device.device.get_image_subresource_layout(self.image, subresource) };

        let row_bytes = pixels.width as usize * 4;
        let row_pitch = layout.row_pitch as usize;
        let mapped_len = layout.size as usize;

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, layout.offset, layout.size, vk::MemoryMapFlags::empty())
                .context("Failed to map staging image")? as *mut u8;
            let mapped = std::slice::from_raw_parts_mut(ptr, mapped_len);
            copy_rows(mapped, row_pitch, &pixels.rgba, row_bytes);
            self.device.device.unmap_memory(self.memory);
        }

        Ok(())
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Copy packed rows of `row_bytes` into a destination spaced `row_pitch` apart
pub fn copy_rows(dst: &mut [u8], row_pitch: usize, src: &[u8], row_bytes: usize) {
    if row_pitch == row_bytes {
        dst[..src.len()].copy_from_slice(src);
        return;
    }
    for (row, chunk) in src.chunks_exact(row_bytes).enumerate() {
        let start = row * row_pitch;
        dst[start..start + row_bytes].copy_from_slice(chunk);
    }
}

/// Sampled texture: device-local image, view and sampler
pub struct Texture {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub image: Image,
    pub width: u32,
    pub height: u32,
}

impl Texture {
    pub fn upload(device: &Arc<VulkanDevice>, commands: &CommandPool, pixels: &Pixels) -> Result<Self> {
        let staging = Image::new(
            device,
            pixels.width,
            pixels.height,
            vk::ImageTiling::LINEAR,
            vk::ImageUsageFlags::TRANSFER_SRC,
            STAGING_MEMORY,
        )?;
        staging.write_pixels(pixels)?;

        let image = Image::new(
            device,
            pixels.width,
            pixels.height,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        transition_image_layout(
            commands,
            staging.image,
            vk::ImageLayout::PREINITIALIZED,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )?;
        transition_image_layout(
            commands,
            image.image,
            vk::ImageLayout::PREINITIALIZED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        copy_image(commands, &staging, &image, pixels.width, pixels.height)?;
        transition_image_layout(
            commands,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        // Staging image is released here, after the queue went idle
        drop(staging);

        let view = create_color_view(device, image.image, TEXTURE_FORMAT)?;
        let sampler = match create_sampler(device) {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe { device.device.destroy_image_view(view, None) };
                return Err(e);
            }
        };

        Ok(Self {
            view,
            sampler,
            image,
            width: pixels.width,
            height: pixels.height,
        })
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let device = &self.image.device.device;
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.view, None);
        }
    }
}

fn copy_image(commands: &CommandPool, src: &Image, dst: &Image, width: u32, height: u32) -> Result<()> {
    let region = vk::ImageCopy {
        src_subresource: COLOR_LAYERS,
        src_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        dst_subresource: COLOR_LAYERS,
        dst_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        extent: vk::Extent3D {
            width,
            height,
            depth: 1,
        },
    };

    commands.submit_once(|device, cmd| unsafe {
        device.cmd_copy_image(
            cmd,
            src.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    })
}

fn create_sampler(device: &VulkanDevice) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(false)
        .max_anisotropy(1.0)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

    unsafe { device.device.create_sampler(&sampler_info, None) }.context("Failed to create texture sampler")
}
