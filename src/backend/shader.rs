// Shader module loading
//
// Vulkan consumes SPIR-V as 32-bit words. The binaries are read from disk at
// pipeline-build time and the modules only live until the pipeline exists.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::VulkanDevice;

/// Read a file and re-pack its bytes as aligned SPIR-V words
pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))?;
    spirv_words(&bytes).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Word-align raw shader bytes; the length must be a multiple of four
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))?;
    if words.is_empty() {
        anyhow::bail!("shader binary is empty");
    }
    Ok(words)
}

/// Shader module destroyed when dropped
pub struct ShaderModule<'a> {
    pub module: vk::ShaderModule,
    device: &'a VulkanDevice,
}

impl<'a> ShaderModule<'a> {
    pub fn load(device: &'a VulkanDevice, path: &Path) -> Result<Self> {
        let code = read_spirv(path)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module from {:?}", path))?;

        log::debug!("Loaded shader {:?} ({} words)", path, code.len());
        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.module, None);
        }
    }
}
