// Command pools and command buffer recording
//
// One pool on the graphics family serves both the per-image draw buffers
// and the one-time transfer buffers used by uploads.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            // RESET: Allow individual buffer re-recording
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            device: device.clone(),
        })
    }

    pub fn allocate(&self, count: u32) -> Result<CommandBuffers> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        Ok(CommandBuffers {
            buffers,
            pool: self.pool,
            device: self.device.clone(),
        })
    }

    /// Record a throwaway command buffer, submit it to the graphics queue and
    /// block until the queue drains.
    pub fn submit_once<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let command_buffers = self.allocate(1)?;
        let cmd = command_buffers.buffers[0];
        let device = &self.device.device;

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;
            record(device, cmd);
            device.end_command_buffer(cmd)?;

            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers.buffers);
            device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit one-time commands")?;
            device
                .queue_wait_idle(self.device.graphics_queue)
                .context("Failed to wait for one-time commands")?;
        }

        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Primary command buffers returned to their pool on drop
pub struct CommandBuffers {
    pub buffers: Vec<vk::CommandBuffer>,
    pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl Drop for CommandBuffers {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            unsafe {
                self.device.device.free_command_buffers(self.pool, &self.buffers);
            }
        }
    }
}

/// Everything one pre-recorded draw needs
pub struct DrawRecording<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffers: &'a [vk::Framebuffer],
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub descriptor_set: vk::DescriptorSet,
}

/// Record the full draw sequence into one command buffer per framebuffer.
///
/// Buffers may be resubmitted every frame until the pipeline or swapchain
/// changes, after which they must be recorded again.
pub fn record_draw_commands(device: &ash::Device, command_buffers: &[vk::CommandBuffer], draw: &DrawRecording) -> Result<()> {
    if command_buffers.len() != draw.framebuffers.len() {
        anyhow::bail!(
            "{} command buffers for {} framebuffers",
            command_buffers.len(),
            draw.framebuffers.len()
        );
    }

    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: draw.clear_color,
        },
    }];

    for (&cmd, &framebuffer) in command_buffers.iter().zip(draw.framebuffers) {
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(draw.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: draw.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
            device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, draw.index_buffer, 0, vk::IndexType::UINT16);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                draw.pipeline_layout,
                0,
                &[draw.descriptor_set],
                &[],
            );
            device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);

            device.end_command_buffer(cmd).context("Failed to record command buffer")?;
        }
    }

    Ok(())
}
