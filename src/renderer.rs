// =============================================================================
// RENDERER - Owns every GPU object needed to draw the textured quad
// =============================================================================
//
// Creation order:
//   instance -> surface -> device -> command pool
//     -> vertex/index/uniform buffers -> texture -> descriptors -> semaphores
//     -> swapchain -> render pass -> pipeline -> framebuffers -> command buffers
//
// Everything from the swapchain onwards depends on the window size and lives
// in `SwapchainTargets`, which is rebuilt as a unit. The rest survives
// recreation.
//
// IMPORTANT: Field order matters for Drop! Fields are declared in reverse
// creation order so the implicit drop tears down children before parents.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::mem::size_of;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use winit::window::Window;

use crate::backend::buffer::{upload_buffer, DeviceBuffer, UniformBuffer};
use crate::backend::commands::{record_draw_commands, CommandBuffers, CommandPool, DrawRecording};
use crate::backend::descriptor::{DescriptorSetLayout, Descriptors};
use crate::backend::pipeline::{Framebuffers, GraphicsPipeline, RenderPass};
use crate::backend::swapchain::replace_retiring;
use crate::backend::sync::FrameSync;
use crate::backend::texture::{Pixels, Texture};
use crate::backend::{
    AcquireOutcome, DiscreteGpuSelector, PresentOutcome, RendererError, Surface, Swapchain, VulkanDevice,
    VulkanInstance,
};
use crate::config::Config;
use crate::frame::FrameTarget;
use crate::hot_reload::ShaderWatcher;
use crate::scene::{UniformBufferObject, QUAD_INDICES, QUAD_VERTICES};

/// Everything that has to be rebuilt when the swapchain changes
struct SwapchainTargets {
    command_buffers: CommandBuffers,
    framebuffers: Framebuffers,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,
    swapchain: Swapchain,
}

pub struct Renderer {
    // ─────────────────────────────────────────────────────────────────────────
    // PER-SWAPCHAIN (None while minimised)
    // ─────────────────────────────────────────────────────────────────────────
    targets: Option<SwapchainTargets>,
    frame_sync: FrameSync,

    // ─────────────────────────────────────────────────────────────────────────
    // SCENE RESOURCES (uploaded once)
    // ─────────────────────────────────────────────────────────────────────────
    descriptors: Descriptors,
    descriptor_set_layout: DescriptorSetLayout,
    _texture: Texture,
    uniform: UniformBuffer,
    index_buffer: DeviceBuffer,
    vertex_buffer: DeviceBuffer,
    command_pool: CommandPool,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN CORE
    // ─────────────────────────────────────────────────────────────────────────
    device: Arc<VulkanDevice>,
    surface: Arc<Surface>,
    _instance: Arc<VulkanInstance>,

    // ─────────────────────────────────────────────────────────────────────────
    // SETTINGS & STATE
    // ─────────────────────────────────────────────────────────────────────────
    vertex_shader: PathBuf,
    fragment_shader: PathBuf,
    clear_color: [f32; 4],
    watcher: Option<ShaderWatcher>,
    minimized: bool,

    // The surface must be gone before the window it points at
    window: Arc<Window>,
}

fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

fn is_zero_area(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

impl Renderer {
    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let enable_validation = config.validation_enabled();
        let display = window.raw_display_handle();

        let instance = VulkanInstance::new(&config.window.title, display, enable_validation)?;
        let surface = Surface::new(instance.clone(), display, window.raw_window_handle())?;
        let device = VulkanDevice::new(instance.clone(), &surface, &DiscreteGpuSelector, enable_validation)?;

        let command_pool = CommandPool::new(&device)?;

        // ─────────────────────────────────────────────────────────────────────
        // Geometry and uniforms, all device-local
        // ─────────────────────────────────────────────────────────────────────
        let vertex_buffer = upload_buffer(
            &device,
            &command_pool,
            bytemuck::cast_slice(&QUAD_VERTICES),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )
        .context("Failed to upload vertex buffer")?;
        let index_buffer = upload_buffer(
            &device,
            &command_pool,
            bytemuck::cast_slice(&QUAD_INDICES),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )
        .context("Failed to upload index buffer")?;
        let uniform = UniformBuffer::new(&device, size_of::<UniformBufferObject>() as vk::DeviceSize)?;

        // ─────────────────────────────────────────────────────────────────────
        // Texture and the descriptor set pointing at it
        // ─────────────────────────────────────────────────────────────────────
        let pixels = Pixels::load(&config.assets.texture)?;
        let texture = Texture::upload(&device, &command_pool, &pixels)?;
        log::info!(
            "Loaded texture {:?} ({}x{})",
            config.assets.texture,
            texture.width,
            texture.height
        );

        let descriptor_set_layout = DescriptorSetLayout::new(&device)?;
        let descriptors = Descriptors::new(&device, &descriptor_set_layout, &uniform.buffer, &texture)?;

        let frame_sync = FrameSync::new(&device)?;

        let watcher = if config.debug.hot_reload {
            let shaders = [config.assets.vertex_shader.as_path(), config.assets.fragment_shader.as_path()];
            match ShaderWatcher::new(&shaders) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot reload disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut renderer = Self {
            targets: None,
            frame_sync,
            descriptors,
            descriptor_set_layout,
            _texture: texture,
            uniform,
            index_buffer,
            vertex_buffer,
            command_pool,
            device,
            surface,
            _instance: instance,
            vertex_shader: config.assets.vertex_shader.clone(),
            fragment_shader: config.assets.fragment_shader.clone(),
            clear_color: config.graphics.clear_color,
            watcher,
            minimized: false,
            window,
        };

        // Don't create a swapchain if the window starts minimised
        let extent = window_extent(&renderer.window);
        renderer.recreate_for(extent)?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    /// Build the swapchain and everything hanging off it.
    ///
    /// `old` is only handed to the driver for resource reuse; the caller
    /// destroys it once this returns.
    fn build_targets(&self, window_size: vk::Extent2D, old: Option<&Swapchain>) -> Result<SwapchainTargets> {
        let swapchain = Swapchain::new(self.device.clone(), &self.surface, window_size, old)?;
        let render_pass = RenderPass::new(&self.device, swapchain.format)?;
        let pipeline = GraphicsPipeline::new(
            &self.device,
            &render_pass,
            swapchain.extent,
            &self.descriptor_set_layout,
            &self.vertex_shader,
            &self.fragment_shader,
        )?;
        let framebuffers = Framebuffers::new(&self.device, &render_pass, &swapchain.image_views, swapchain.extent)?;
        let command_buffers = self.command_pool.allocate(framebuffers.framebuffers.len() as u32)?;

        let targets = SwapchainTargets {
            command_buffers,
            framebuffers,
            pipeline,
            render_pass,
            swapchain,
        };
        self.record(&targets)?;

        log::info!(
            "Created {} pre-recorded command buffers",
            targets.command_buffers.buffers.len()
        );
        Ok(targets)
    }

    // =========================================================================
    // COMMAND RECORDING
    // =========================================================================

    fn record(&self, targets: &SwapchainTargets) -> Result<()> {
        let draw = DrawRecording {
            render_pass: targets.render_pass.render_pass,
            framebuffers: &targets.framebuffers.framebuffers,
            extent: targets.swapchain.extent,
            clear_color: self.clear_color,
            pipeline: targets.pipeline.pipeline,
            pipeline_layout: targets.pipeline.layout,
            vertex_buffer: self.vertex_buffer.buffer,
            index_buffer: self.index_buffer.buffer,
            index_count: QUAD_INDICES.len() as u32,
            descriptor_set: self.descriptors.set,
        };

        record_draw_commands(&self.device.device, &targets.command_buffers.buffers, &draw)
    }

    // =========================================================================
    // SWAPCHAIN RECREATION
    // =========================================================================

    /// Window-size notification from the event loop; recreates right away.
    pub fn on_resize(&mut self, width: u32, height: u32) -> Result<()> {
        log::debug!("Window resized to {}x{}", width, height);
        self.recreate_for(vk::Extent2D { width, height })
    }

    fn recreate_for(&mut self, extent: vk::Extent2D) -> Result<()> {
        if is_zero_area(extent) {
            if !self.minimized {
                log::info!("Window minimised, pausing rendering");
            }
            self.minimized = true;
            return Ok(());
        }

        // Nothing may still be using the resources that are about to go
        self.device.wait_idle()?;

        let mut slot = self.targets.take();
        replace_retiring(&mut slot, |old| self.build_targets(extent, old.map(|t| &t.swapchain)))?;
        self.targets = slot;
        self.minimized = false;

        Ok(())
    }

    // =========================================================================
    // HOT RELOAD
    // =========================================================================

    /// Rebuild the pipeline if the shader binaries changed on disk.
    ///
    /// A broken shader is logged and the current pipeline stays bound.
    pub fn reload_pipeline_if_changed(&mut self) -> Result<()> {
        let changed = self.watcher.as_ref().is_some_and(|w| w.take_changed());
        if !changed {
            return Ok(());
        }
        let Some(mut targets) = self.targets.take() else {
            // The next recreation reads the shaders from disk anyway
            return Ok(());
        };

        log::info!("Shaders changed, rebuilding pipeline");
        let result = self.device.wait_idle().and_then(|()| {
            match GraphicsPipeline::new(
                &self.device,
                &targets.render_pass,
                targets.swapchain.extent,
                &self.descriptor_set_layout,
                &self.vertex_shader,
                &self.fragment_shader,
            ) {
                Ok(pipeline) => {
                    targets.pipeline = pipeline;
                    self.record(&targets)
                }
                Err(e) => {
                    log::error!("Shader reload failed, keeping the previous pipeline: {:#}", e);
                    Ok(())
                }
            }
        });

        self.targets = Some(targets);
        result
    }

    fn targets(&self) -> Result<&SwapchainTargets> {
        self.targets.as_ref().context("Swapchain not initialized")
    }
}

// =============================================================================
// FRAME STAGES
// =============================================================================

impl FrameTarget for Renderer {
    fn can_render(&self) -> bool {
        !self.minimized && self.targets.is_some()
    }

    fn update(&mut self, elapsed: Duration) -> Result<()> {
        self.reload_pipeline_if_changed()?;

        let extent = self.targets()?.swapchain.extent;
        let ubo = UniformBufferObject::at(elapsed.as_secs_f32(), extent);

        // The previous frame may still be reading the uniform buffer
        unsafe { self.device.device.queue_wait_idle(self.device.graphics_queue) }
            .context("Failed to wait for the graphics queue")?;

        self.uniform.update(&self.command_pool, bytemuck::bytes_of(&ubo))
    }

    fn acquire(&mut self) -> Result<AcquireOutcome> {
        let targets = self.targets()?;
        Ok(targets.swapchain.acquire_next_image(self.frame_sync.image_available)?)
    }

    fn submit(&mut self, image_index: u32) -> Result<()> {
        let targets = self.targets()?;
        let cmd = *targets
            .command_buffers
            .buffers
            .get(image_index as usize)
            .with_context(|| format!("No command buffer for image {}", image_index))?;

        let wait_semaphores = [self.frame_sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [self.frame_sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores) // Wait for image to be available
            .wait_dst_stage_mask(&wait_stages) // Which stage waits
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], vk::Fence::null())
        }
        .map_err(|result| RendererError::Frame { stage: "submit", result })?;

        Ok(())
    }

    fn present(&mut self, image_index: u32) -> Result<PresentOutcome> {
        let targets = self.targets()?;
        Ok(targets.swapchain.present(
            self.device.present_queue,
            image_index,
            &[self.frame_sync.render_finished],
        )?)
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        let extent = window_extent(&self.window);
        self.recreate_for(extent)
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before any field is destroyed
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_area_in_either_direction_means_minimised() {
        assert!(is_zero_area(vk::Extent2D { width: 0, height: 600 }));
        assert!(is_zero_area(vk::Extent2D { width: 800, height: 0 }));
        assert!(!is_zero_area(vk::Extent2D { width: 1, height: 1 }));
    }
}
