// Scene data: the textured quad and its per-frame transform
//
// Everything here is plain data that the backend uploads. The vertex type
// also describes its own layout to the pipeline.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use std::mem::{offset_of, size_of};

/// Interleaved vertex: position, color, texture coordinate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec2,
    pub color: Vec3,
    pub tex_coord: Vec2,
}

impl Vertex {
    pub const fn new(pos: [f32; 2], color: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            pos: Vec2::new(pos[0], pos[1]),
            color: Vec3::new(color[0], color[1], color[2]),
            tex_coord: Vec2::new(tex_coord[0], tex_coord[1]),
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Self, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Self, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 2,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Self, tex_coord) as u32,
            },
        ]
    }
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new([-0.5, -0.5], [1.0, 0.0, 0.0], [1.0, 0.0]),
    Vertex::new([0.5, -0.5], [0.0, 1.0, 0.0], [0.0, 0.0]),
    Vertex::new([0.5, 0.5], [0.0, 0.0, 1.0], [0.0, 1.0]),
    Vertex::new([-0.5, 0.5], [1.0, 1.0, 1.0], [1.0, 1.0]),
];

pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Matrices consumed by the vertex shader at binding 0
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

/// Degrees per second the quad spins around Z
pub const ROTATION_SPEED_DEG: f32 = 90.0;

impl UniformBufferObject {
    /// Transform for `elapsed_secs` after start, rendered into `extent`
    pub fn at(elapsed_secs: f32, extent: vk::Extent2D) -> Self {
        let model = Mat4::from_rotation_z((elapsed_secs * ROTATION_SPEED_DEG).to_radians());
        let view = Mat4::look_at_rh(Vec3::new(2.0, 2.0, 2.0), Vec3::ZERO, Vec3::Z);

        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    const EXTENT: vk::Extent2D = vk::Extent2D { width: 1080, height: 900 };

    #[test]
    fn vertex_layout_matches_the_shader_inputs() {
        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 28);

        let attributes = Vertex::attribute_descriptions();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        let locations: Vec<u32> = attributes.iter().map(|a| a.location).collect();

        assert_eq!(offsets, vec![0, 8, 20]);
        assert_eq!(locations, vec![0, 1, 2]);
        assert_eq!(attributes[1].format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn indices_cover_the_quad_with_two_triangles() {
        assert_eq!(QUAD_INDICES.len() % 3, 0);
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));
        assert_eq!(bytemuck::cast_slice::<u16, u8>(&QUAD_INDICES).len(), 12);
    }

    #[test]
    fn model_starts_at_identity() {
        let ubo = UniformBufferObject::at(0.0, EXTENT);
        assert!(ubo.model.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn one_second_turns_a_quarter() {
        let ubo = UniformBufferObject::at(1.0, EXTENT);
        let turned = ubo.model * Vec4::new(1.0, 0.0, 0.0, 1.0);

        assert_relative_eq!(turned.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(turned.y, 1.0, epsilon = 1e-5);
        assert_relative_eq!(turned.w, 1.0);
    }

    #[test]
    fn projection_is_flipped_and_follows_the_aspect_ratio() {
        let ubo = UniformBufferObject::at(0.0, EXTENT);
        let aspect = EXTENT.width as f32 / EXTENT.height as f32;

        assert!(ubo.proj.y_axis.y < 0.0);
        assert_relative_eq!(ubo.proj.x_axis.x * aspect, -ubo.proj.y_axis.y, epsilon = 1e-5);
    }

    #[test]
    fn zero_height_does_not_produce_nan() {
        let ubo = UniformBufferObject::at(0.5, vk::Extent2D { width: 640, height: 0 });
        assert!(!ubo.proj.is_nan());
    }

    #[test]
    fn uniform_block_is_three_column_major_matrices() {
        let ubo = UniformBufferObject::at(0.0, EXTENT);
        let bytes = bytemuck::bytes_of(&ubo);

        assert_eq!(bytes.len(), 3 * 64);
        assert_eq!(&bytes[64..128], bytemuck::bytes_of(&ubo.view));
    }
}
