// Typed failure kinds
//
// Everything funnels into anyhow at the call sites; these variants exist so
// the conditions that matter can be told apart with `downcast_ref`.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("validation layer {0} requested, but not available")]
    ValidationLayerMissing(String),

    #[error("failed to find GPUs with Vulkan support")]
    NoVulkanDevice,

    #[error("failed to find a suitable GPU")]
    NoSuitableDevice,

    #[error("device is missing a {0} queue family")]
    MissingQueueFamily(&'static str),

    #[error("surface reports no supported formats")]
    NoSurfaceFormat,

    #[error("no suitable memory type (type filter {type_filter:#034b}, properties {properties:?})")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("unsupported layout transition: {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("{stage} failed: {result}")]
    Frame {
        stage: &'static str,
        #[source]
        result: vk::Result,
    },

    #[error("failed to decode texture {path}")]
    TextureDecode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}
