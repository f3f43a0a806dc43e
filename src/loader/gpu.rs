//! Records written to the buffers of a [`Model`](crate::Model). Layouts match the std430 rules shaders read
//! them with.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::scene::{AlphaMode, Light, LightKind, Material};

/// One vertex in the vertex buffer.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coord: [f32; 2],
    /// Tangent with the bitangent sign in `w`.
    pub tangent: [f32; 4],
}

/// Same layout as `VkDrawIndexedIndirectCommand`. A zeroed command draws nothing.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirect {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Per draw data, stored at the same slot as its draw command and found through `first_instance`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct MeshInstance {
    /// Column major object to world matrix.
    pub transform: [[f32; 4]; 4],
    pub material: u32,
    pub mesh: u32,
    pub primitive: u32,
    pub _pad: u32,
}

/// A material with its textures resolved to bindless slots.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct GpuMaterial {
    pub base_color_factor: [f32; 4],
    pub emissive_factor: [f32; 3],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub normal_scale: f32,
    pub occlusion_strength: f32,
    pub alpha_cutoff: f32,
    pub base_color_texture: u32,
    pub metallic_roughness_texture: u32,
    pub normal_texture: u32,
    pub occlusion_texture: u32,
    pub emissive_texture: u32,
    /// 0 for opaque, 1 for masked, 2 for blended.
    pub alpha_mode: u32,
    pub double_sided: u32,
    pub _pad: u32,
}

impl GpuMaterial {
    /// Convert a material. `slot` resolves a texture index to the bindless slot it is bound to.
    pub fn new(material: &Material, slot: impl Fn(Option<usize>) -> u32, normal_slot: impl Fn(Option<usize>) -> u32) -> Self {
        Self {
            base_color_factor: material.base_color_factor,
            emissive_factor: material.emissive_factor,
            metallic_factor: material.metallic_factor,
            roughness_factor: material.roughness_factor,
            normal_scale: material.normal_scale,
            occlusion_strength: material.occlusion_strength,
            alpha_cutoff: material.alpha_cutoff,
            base_color_texture: slot(material.base_color_texture),
            metallic_roughness_texture: slot(material.metallic_roughness_texture),
            normal_texture: normal_slot(material.normal_texture),
            occlusion_texture: slot(material.occlusion_texture),
            emissive_texture: slot(material.emissive_texture),
            alpha_mode: match material.alpha_mode {
                AlphaMode::Opaque => 0,
                AlphaMode::Mask => 1,
                AlphaMode::Blend => 2,
            },
            double_sided: material.double_sided as u32,
            _pad: 0,
        }
    }
}

/// Light kinds as stored in [`GpuLight::kind`].
pub const LIGHT_DIRECTIONAL: u32 = 0;
pub const LIGHT_POINT: u32 = 1;
pub const LIGHT_SPOT: u32 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct GpuLight {
    pub color: [f32; 3],
    pub intensity: f32,
    /// Zero means infinite range.
    pub range: f32,
    pub kind: u32,
    pub inner_cone_cos: f32,
    pub outer_cone_cos: f32,
}

impl From<&Light> for GpuLight {
    fn from(light: &Light) -> Self {
        let (kind, inner_cone_cos, outer_cone_cos) = match light.kind {
            LightKind::Directional => (LIGHT_DIRECTIONAL, 1.0, 1.0),
            LightKind::Point => (LIGHT_POINT, -1.0, -1.0),
            LightKind::Spot {
                inner_cone_angle,
                outer_cone_angle,
            } => (LIGHT_SPOT, inner_cone_angle.cos(), outer_cone_angle.cos()),
        };
        Self {
            color: light.color,
            intensity: light.intensity,
            range: light.range.unwrap_or(0.0),
            kind,
            inner_cone_cos,
            outer_cone_cos,
        }
    }
}

/// A light placed in the world.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct LightInstance {
    /// World space position, `w` is 1.
    pub position: [f32; 4],
    /// World space direction the light points in, `w` is 0.
    pub direction: [f32; 4],
    pub light: u32,
    pub _pad: [u32; 3],
}

const_assert_eq!(std::mem::size_of::<Vertex>(), 48);
const_assert_eq!(std::mem::size_of::<DrawIndexedIndirect>(), 20);
const_assert_eq!(std::mem::size_of::<MeshInstance>(), 80);
const_assert_eq!(std::mem::size_of::<GpuMaterial>(), 80);
const_assert_eq!(std::mem::size_of::<GpuLight>(), 32);
const_assert_eq!(std::mem::size_of::<LightInstance>(), 48);
