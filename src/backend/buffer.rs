// Buffer utilities for vertex, index, and uniform buffers
//
// Everything the GPU reads lives in device-local memory and is filled through
// a host-visible staging buffer plus a copy command.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::commands::CommandPool;
use super::{RendererError, VulkanDevice};

/// Memory a staging resource lives in
pub const STAGING_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Find the first memory type allowed by `type_filter` that has all of `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, RendererError> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    (0..count)
        .find(|&i| {
            let has_type = (type_filter & (1 << i)) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties);
            has_type && has_properties
        })
        .ok_or(RendererError::NoSuitableMemoryType {
            type_filter,
            properties,
        })
}

/// Allocate and bind memory for `requirements`
pub fn allocate_memory(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        properties,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    unsafe { device.device.allocate_memory(&alloc_info, None) }.context("Failed to allocate memory")
}

/// Copy `src` to the start of a mapped region
pub fn fill_mapped(mapped: &mut [u8], src: &[u8]) {
    mapped[..src.len()].copy_from_slice(src);
}

/// Map `memory`, copy `bytes` in at offset 0 and unmap again.
pub fn write_memory(device: &VulkanDevice, memory: vk::DeviceMemory, bytes: &[u8]) -> Result<()> {
    let size = bytes.len() as vk::DeviceSize;
    unsafe {
        let ptr = device
            .device
            .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
            .context("Failed to map memory")? as *mut u8;

        fill_mapped(std::slice::from_raw_parts_mut(ptr, bytes.len()), bytes);
        device.device.unmap_memory(memory);
    }
    Ok(())
}

/// Buffer with its own memory allocation
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    device: Arc<VulkanDevice>,
}

impl DeviceBuffer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Cannot create an empty buffer");
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory = match allocate_memory(device, requirements, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        // From here on Drop takes care of both handles
        let created = Self {
            buffer,
            memory,
            size,
            device: device.clone(),
        };

        unsafe { device.device.bind_buffer_memory(buffer, memory, 0) }
            .context("Failed to bind buffer memory")?;

        Ok(created)
    }

    /// Host-visible, host-coherent transfer source holding `bytes`
    pub fn staging(device: &Arc<VulkanDevice>, bytes: &[u8]) -> Result<Self> {
        let staging = Self::new(
            device,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            STAGING_MEMORY,
        )?;
        staging.write(bytes)?;
        Ok(staging)
    }

    /// Overwrite the start of a host-visible buffer
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        check_fits(bytes.len(), self.size)?;
        write_memory(&self.device, self.memory, bytes)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Record and wait for a full copy of `size` bytes from `src` to `dst`.
pub fn copy_buffer(commands: &CommandPool, src: &DeviceBuffer, dst: &DeviceBuffer, size: vk::DeviceSize) -> Result<()> {
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };

    commands.submit_once(|device, cmd| unsafe {
        device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]);
    })
}

/// Upload `bytes` into a new device-local buffer through a temporary staging buffer.
pub fn upload_buffer(
    device: &Arc<VulkanDevice>,
    commands: &CommandPool,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<DeviceBuffer> {
    let staging = DeviceBuffer::staging(device, bytes)?;

    let buffer = DeviceBuffer::new(
        device,
        staging.size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    copy_buffer(commands, &staging, &buffer, staging.size)?;
    log::debug!("Uploaded {} bytes ({:?})", bytes.len(), usage);

    Ok(buffer)
}

/// Device-local uniform buffer, refilled through a fresh staging buffer per update
pub struct UniformBuffer {
    pub buffer: DeviceBuffer,
}

impl UniformBuffer {
    pub fn new(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self> {
        let buffer = DeviceBuffer::new(
            device,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        Ok(Self { buffer })
    }

    /// Stage `bytes`, copy them across and wait; the staging buffer is freed on return.
    pub fn update(&self, commands: &CommandPool, bytes: &[u8]) -> Result<()> {
        check_fits(bytes.len(), self.buffer.size)?;
        let staging = DeviceBuffer::staging(&self.buffer.device, bytes)?;
        copy_buffer(commands, &staging, &self.buffer, staging.size)
    }
}

fn check_fits(len: usize, capacity: vk::DeviceSize) -> Result<()> {
    if len as vk::DeviceSize > capacity {
        anyhow::bail!("{} bytes do not fit a {} byte buffer", len, capacity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Vertex, QUAD_VERTICES};

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn picks_first_type_with_filter_bit_and_properties() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            STAGING_MEMORY,
            STAGING_MEMORY | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        assert_eq!(find_memory_type(&props, 0b111, STAGING_MEMORY).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b100, STAGING_MEMORY).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn property_flags_must_all_be_present() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let err = find_memory_type(&props, 0b11, STAGING_MEMORY).unwrap_err();
        assert!(matches!(err, RendererError::NoSuitableMemoryType { type_filter: 0b11, .. }));
    }

    #[test]
    fn filter_without_satisfying_bit_is_an_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, STAGING_MEMORY]);

        // Only type 0 allowed, but it is not host visible
        let err = find_memory_type(&props, 0b01, STAGING_MEMORY).unwrap_err();
        assert!(matches!(err, RendererError::NoSuitableMemoryType { .. }));

        // No bits at all
        assert!(find_memory_type(&props, 0, vk::MemoryPropertyFlags::empty()).is_err());
    }

    #[test]
    fn bits_beyond_the_reported_count_are_ignored() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert!(find_memory_type(&props, 1 << 5, vk::MemoryPropertyFlags::empty()).is_err());
    }

    #[test]
    fn staging_fill_round_trips_every_prefix_of_the_vertex_data() {
        let bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let vertex_size = std::mem::size_of::<Vertex>();

        for n in (vertex_size..=bytes.len()).step_by(vertex_size) {
            let mut mapped = vec![0xAAu8; bytes.len()];
            fill_mapped(&mut mapped, &bytes[..n]);

            assert_eq!(&mapped[..n], &bytes[..n]);
            assert!(mapped[n..].iter().all(|&b| b == 0xAA));
        }
    }

    #[test]
    fn uniform_sized_writes_fit_and_larger_ones_are_rejected() {
        let size = std::mem::size_of::<crate::scene::UniformBufferObject>();
        assert!(check_fits(size, size as vk::DeviceSize).is_ok());
        assert!(check_fits(size - 4, size as vk::DeviceSize).is_ok());

        let err = check_fits(size + 1, size as vk::DeviceSize).unwrap_err();
        assert!(err.to_string().contains("do not fit"));
    }
}
