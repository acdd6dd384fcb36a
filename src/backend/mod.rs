// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash where every handle is owned by a guard type
// that holds its parent alive through an Arc and destroys itself on drop.

pub mod buffer;
pub mod commands;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use device::{DeviceSelector, DiscreteGpuSelector, VulkanDevice};
pub use error::RendererError;
pub use instance::VulkanInstance;
pub use surface::Surface;
pub use swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
