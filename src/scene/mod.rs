//! In-memory scene graph produced by importers and consumed by the [`Loader`](crate::Loader).
//!
//! A [`Scene`] is a plain description of what should end up on the GPU. Importers such as
//! [`GltfImporter`](gltf::GltfImporter) produce one from a file, but scenes can also be built by hand and passed to
//! [`Loader::load_scene()`](crate::Loader::load_scene).
//!
//! All cross references (node to mesh, primitive to material, material to texture) are indices into the vectors of
//! the owning [`Scene`]. They are validated by [`SceneLayout::new()`](layout::SceneLayout::new) before anything is
//! uploaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use glam::Mat4;

pub mod geometry;
pub mod gltf;
pub mod layout;

/// Index data of a primitive. Widths are kept as they were in the source.
#[derive(Debug, Clone, PartialEq)]
pub enum Indices {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl Indices {
    pub fn len(&self) -> usize {
        match self {
            Indices::U16(indices) => indices.len(),
            Indices::U32(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over all indices, widened to 32 bits.
    pub fn iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            Indices::U16(indices) => Box::new(indices.iter().map(|&i| i as u32)),
            Indices::U32(indices) => Box::new(indices.iter().copied()),
        }
    }
}

/// A triangle list with its vertex attributes. Every attribute has one entry per position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Primitive {
    pub positions: Vec<[f32; 3]>,
    /// Generated from the triangles if missing.
    pub normals: Option<Vec<[f32; 3]>>,
    pub tex_coords: Option<Vec<[f32; 2]>>,
    /// Tangents with the bitangent sign in `w`. Generated from positions and texture coordinates if missing.
    pub tangents: Option<Vec<[f32; 4]>>,
    /// Sequential indices are generated if this is `None`.
    pub indices: Option<Indices>,
    /// Material index. Primitives without one use an implicit default material.
    pub material: Option<usize>,
}

impl Primitive {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.as_ref().map_or(self.positions.len(), Indices::len)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub name: String,
    pub primitives: Vec<Primitive>,
}

/// How the alpha channel of the base color is interpreted.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AlphaMode {
    #[default]
    Opaque,
    /// Fragments with an alpha below the cutoff are discarded.
    Mask,
    Blend,
}

/// A metallic-roughness material. Texture fields are indices into [`Scene::textures`].
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub base_color_factor: [f32; 4],
    pub base_color_texture: Option<usize>,
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub metallic_roughness_texture: Option<usize>,
    pub normal_texture: Option<usize>,
    pub normal_scale: f32,
    pub occlusion_texture: Option<usize>,
    pub occlusion_strength: f32,
    pub emissive_factor: [f32; 3],
    pub emissive_texture: Option<usize>,
    pub alpha_mode: AlphaMode,
    pub alpha_cutoff: f32,
    pub double_sided: bool,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            base_color_factor: [1.0; 4],
            base_color_texture: None,
            metallic_factor: 1.0,
            roughness_factor: 1.0,
            metallic_roughness_texture: None,
            normal_texture: None,
            normal_scale: 1.0,
            occlusion_texture: None,
            occlusion_strength: 1.0,
            emissive_factor: [0.0; 3],
            emissive_texture: None,
            alpha_mode: AlphaMode::Opaque,
            alpha_cutoff: 0.5,
            double_sided: false,
        }
    }
}

impl Material {
    /// All texture references of this material with the channel they are used for.
    pub fn textures(&self) -> impl Iterator<Item = (usize, TextureChannel)> + '_ {
        [
            (self.base_color_texture, TextureChannel::BaseColor),
            (self.metallic_roughness_texture, TextureChannel::MetallicRoughness),
            (self.normal_texture, TextureChannel::Normal),
            (self.occlusion_texture, TextureChannel::Occlusion),
            (self.emissive_texture, TextureChannel::Emissive),
        ]
        .into_iter()
        .filter_map(|(texture, channel)| texture.map(|texture| (texture, channel)))
    }
}

/// The material input a texture is bound to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextureChannel {
    BaseColor,
    MetallicRoughness,
    Normal,
    Occlusion,
    Emissive,
}

impl TextureChannel {
    /// Whether texels of this channel are colors stored in sRGB encoding.
    pub fn is_color(&self) -> bool {
        matches!(self, TextureChannel::BaseColor | TextureChannel::Emissive)
    }
}

/// Where the texels of a texture come from. Encoded data and files are decoded by the worker that uploads them.
#[derive(Debug, Clone, PartialEq)]
pub enum TextureSource {
    /// An encoded image file (PNG or JPEG) in memory.
    Encoded(Arc<[u8]>),
    /// An image file on disk.
    File(PathBuf),
    /// Already decoded, tightly packed RGBA8 texels.
    Rgba8 {
        width: u32,
        height: u32,
        pixels: Arc<[u8]>,
    },
}

/// RGBA8 texels decoded from a [`TextureSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<[u8]>,
}

impl TextureSource {
    /// Decode the source into RGBA8 texels.
    /// # Errors
    /// * Fails if the file cannot be read or the data is not a supported image.
    pub fn decode(&self) -> Result<DecodedImage> {
        let image = match self {
            TextureSource::Rgba8 {
                width,
                height,
                pixels,
            } => {
                anyhow::ensure!(
                    pixels.len() as u64 == *width as u64 * *height as u64 * 4,
                    "texel data of {} bytes does not match a {width}x{height} RGBA8 image",
                    pixels.len()
                );
                return Ok(DecodedImage {
                    width: *width,
                    height: *height,
                    pixels: pixels.clone(),
                });
            }
            TextureSource::Encoded(data) => image::load_from_memory(data)?,
            TextureSource::File(path) => image::open(path)?,
        };
        let rgba = image.to_rgba8();
        Ok(DecodedImage {
            width: rgba.width(),
            height: rgba.height(),
            pixels: rgba.into_raw().into(),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum LightKind {
    Directional,
    Point,
    /// Cone angles in radians.
    Spot {
        inner_cone_angle: f32,
        outer_cone_angle: f32,
    },
}

/// A punctual light. Placed in the scene by nodes that reference it.
#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    pub name: String,
    pub kind: LightKind,
    pub color: [f32; 3],
    pub intensity: f32,
    /// Distance at which the light's influence ends. Infinite if `None`.
    pub range: Option<f32>,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: LightKind::Point,
            color: [1.0; 3],
            intensity: 1.0,
            range: None,
        }
    }
}

/// A node of the scene graph. Its transform is relative to its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub transform: Mat4,
    pub children: Vec<usize>,
    pub mesh: Option<usize>,
    pub light: Option<usize>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            name: String::new(),
            transform: Mat4::IDENTITY,
            children: Vec::new(),
            mesh: None,
            light: None,
        }
    }
}

impl Node {
    /// A node instancing a mesh.
    pub fn with_mesh(mesh: usize, transform: Mat4) -> Self {
        Self {
            transform,
            mesh: Some(mesh),
            ..Default::default()
        }
    }

    /// A node placing a light.
    pub fn with_light(light: usize, transform: Mat4) -> Self {
        Self {
            transform,
            light: Some(light),
            ..Default::default()
        }
    }
}

/// A complete scene. See the [module documentation](self).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub name: String,
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Material>,
    pub textures: Vec<TextureSource>,
    pub lights: Vec<Light>,
    pub nodes: Vec<Node>,
    /// Nodes traversal starts from. If empty, every node that is not a child of another node is a root.
    pub roots: Vec<usize>,
}

/// Options passed to a [`SceneImporter`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ImportOptions {
    /// Factor converting the source's units to meters. Formats that define their units ignore this.
    pub scale: f32,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
        }
    }
}

/// Parses a file into a [`Scene`]. Importers are registered on the loader by file extension, see
/// [`Loader::with_importer()`](crate::Loader::with_importer).
pub trait SceneImporter: Send + Sync {
    /// Import the file at `path`.
    /// # Errors
    /// * Fails if the file cannot be read or is malformed.
    fn import(&self, path: &Path, options: &ImportOptions) -> Result<Scene>;
}
