//! Validation, flattening and buffer layout of a [`Scene`].
//!
//! The loader sizes every buffer of a model from [`Counts`] before any data is uploaded, and every upload task
//! writes to the ranges that [`compute_offsets()`] assigns to it. Both are pure functions of the scene, so the
//! offsets are known before the first worker starts and workers never write to overlapping bytes.
//!
//! # Layout
//! Vertices and indices are laid out mesh by mesh and primitive by primitive. Indices go to one of two index
//! buffers depending on their [`IndexWidth`]. Draw commands are laid out the same way in one draw buffer per index
//! width. Within a mesh, the draws of its first instance come first, each in primitive order, followed by those of
//! the next instance. The per draw [`MeshInstance`](crate::loader::gpu::MeshInstance) record is stored at the same
//! slot as its draw command.

use std::ops::Range;

use anyhow::Result;
use glam::Mat4;

use crate::scene::{Primitive, Scene};
use crate::Error;

/// Width of the indices of a primitive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IndexWidth {
    U16,
    U32,
}

impl IndexWidth {
    /// Width of the index buffer a primitive is uploaded to. Generated indices are 16 bit if they fit.
    pub fn of(primitive: &Primitive) -> Self {
        match &primitive.indices {
            Some(crate::scene::Indices::U16(_)) => IndexWidth::U16,
            Some(crate::scene::Indices::U32(_)) => IndexWidth::U32,
            None if primitive.positions.len() <= u16::MAX as usize + 1 => IndexWidth::U16,
            None => IndexWidth::U32,
        }
    }

    pub fn byte_size(&self) -> u64 {
        match self {
            IndexWidth::U16 => 2,
            IndexWidth::U32 => 4,
        }
    }
}

/// How a texture is referenced by the materials of a scene.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TextureUsage {
    /// Referenced as base color or emissive texture, so texels are sRGB encoded.
    pub color: bool,
    /// Referenced as normal map.
    pub normal: bool,
}

/// A node that instances a mesh, with its world transform.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MeshNode {
    pub node: usize,
    pub mesh: usize,
    pub transform: Mat4,
}

/// A node that places a light, with its world transform.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LightNode {
    pub node: usize,
    pub light: usize,
    pub transform: Mat4,
}

/// The flattened node graph of a validated scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneLayout {
    /// Mesh instances in traversal order.
    pub mesh_nodes: Vec<MeshNode>,
    /// For every mesh, the indices into `mesh_nodes` of its instances.
    pub mesh_instances: Vec<Vec<usize>>,
    pub light_nodes: Vec<LightNode>,
    /// For every texture of the scene, how it is used. `None` for textures no material references.
    pub textures: Vec<Option<TextureUsage>>,
    /// Index of the implicit default material, if any primitive lacks a material.
    pub default_material: Option<usize>,
}

fn invalid(scene: &Scene, reason: String) -> anyhow::Error {
    Error::InvalidScene {
        scene: scene.name.clone(),
        reason,
    }
    .into()
}

impl SceneLayout {
    /// Validate a scene and flatten its node graph.
    /// # Errors
    /// * Fails with [`Error::InvalidScene`] if any reference is out of range, attribute lengths disagree, indices
    ///   exceed the vertex count or the node graph has a cycle.
    pub fn new(scene: &Scene) -> Result<Self> {
        validate_meshes(scene)?;
        let textures = texture_usage(scene)?;
        validate_nodes(scene)?;

        let default_material = scene
            .meshes
            .iter()
            .flat_map(|mesh| &mesh.primitives)
            .any(|primitive| primitive.material.is_none())
            .then_some(scene.materials.len());

        let roots = if scene.roots.is_empty() {
            let mut has_parent = vec![false; scene.nodes.len()];
            for node in &scene.nodes {
                for &child in &node.children {
                    has_parent[child] = true;
                }
            }
            (0..scene.nodes.len()).filter(|&node| !has_parent[node]).collect()
        } else {
            scene.roots.clone()
        };

        let mut mesh_nodes = Vec::new();
        let mut light_nodes = Vec::new();
        let mut mesh_instances = vec![Vec::new(); scene.meshes.len()];
        // Depth first, children in order. Reversed so the first root is visited first.
        let mut stack = roots.iter().rev().map(|&root| (root, Mat4::IDENTITY)).collect::<Vec<_>>();
        while let Some((index, parent)) = stack.pop() {
            let node = &scene.nodes[index];
            let transform = parent * node.transform;
            if let Some(mesh) = node.mesh {
                mesh_instances[mesh].push(mesh_nodes.len());
                mesh_nodes.push(MeshNode {
                    node: index,
                    mesh,
                    transform,
                });
            }
            if let Some(light) = node.light {
                light_nodes.push(LightNode {
                    node: index,
                    light,
                    transform,
                });
            }
            stack.extend(node.children.iter().rev().map(|&child| (child, transform)));
        }

        Ok(Self {
            mesh_nodes,
            mesh_instances,
            light_nodes,
            textures,
            default_material,
        })
    }

    /// Material index used by a primitive.
    pub fn material_of(&self, primitive: &Primitive) -> usize {
        primitive.material.or(self.default_material).unwrap_or_default()
    }
}

fn validate_meshes(scene: &Scene) -> Result<()> {
    let mut total_vertices = 0u64;
    for (m, mesh) in scene.meshes.iter().enumerate() {
        for (p, primitive) in mesh.primitives.iter().enumerate() {
            let count = primitive.positions.len();
            let what = |attribute: &str| format!("mesh {m} primitive {p}: {attribute} count does not match {count} positions");
            if primitive.normals.as_ref().map_or(false, |n| n.len() != count) {
                return Err(invalid(scene, what("normal")));
            }
            if primitive.tex_coords.as_ref().map_or(false, |t| t.len() != count) {
                return Err(invalid(scene, what("texture coordinate")));
            }
            if primitive.tangents.as_ref().map_or(false, |t| t.len() != count) {
                return Err(invalid(scene, what("tangent")));
            }
            if primitive.index_count() % 3 != 0 {
                return Err(invalid(scene, format!("mesh {m} primitive {p} is not a triangle list")));
            }
            if let Some(indices) = &primitive.indices {
                if let Some(index) = indices.iter().find(|&i| i as usize >= count) {
                    return Err(invalid(
                        scene,
                        format!("mesh {m} primitive {p}: index {index} out of range for {count} vertices"),
                    ));
                }
            }
            if let Some(material) = primitive.material {
                if material >= scene.materials.len() {
                    return Err(invalid(scene, format!("mesh {m} primitive {p}: material {material} does not exist")));
                }
            }
            total_vertices += count as u64;
        }
    }
    if total_vertices > i32::MAX as u64 {
        return Err(invalid(scene, format!("{total_vertices} vertices do not fit a single vertex buffer")));
    }
    Ok(())
}

fn texture_usage(scene: &Scene) -> Result<Vec<Option<TextureUsage>>> {
    let mut usage = vec![None; scene.textures.len()];
    for (m, material) in scene.materials.iter().enumerate() {
        for (texture, channel) in material.textures() {
            let Some(entry) = usage.get_mut(texture) else {
                return Err(invalid(scene, format!("material {m}: texture {texture} does not exist")));
            };
            let entry = entry.get_or_insert_with(TextureUsage::default);
            entry.color |= channel.is_color();
            entry.normal |= channel == crate::scene::TextureChannel::Normal;
        }
    }
    Ok(usage)
}

fn validate_nodes(scene: &Scene) -> Result<()> {
    let nodes = scene.nodes.len();
    for (n, node) in scene.nodes.iter().enumerate() {
        if let Some(&child) = node.children.iter().find(|&&child| child >= nodes) {
            return Err(invalid(scene, format!("node {n}: child {child} does not exist")));
        }
        if let Some(mesh) = node.mesh.filter(|&mesh| mesh >= scene.meshes.len()) {
            return Err(invalid(scene, format!("node {n}: mesh {mesh} does not exist")));
        }
        if let Some(light) = node.light.filter(|&light| light >= scene.lights.len()) {
            return Err(invalid(scene, format!("node {n}: light {light} does not exist")));
        }
    }
    if let Some(&root) = scene.roots.iter().find(|&&root| root >= nodes) {
        return Err(invalid(scene, format!("root node {root} does not exist")));
    }

    #[derive(Copy, Clone, PartialEq)]
    enum Mark {
        New,
        Open,
        Done,
    }
    let mut marks = vec![Mark::New; nodes];
    for start in 0..nodes {
        if marks[start] != Mark::New {
            continue;
        }
        // (node, index of the next child to visit)
        let mut stack = vec![(start, 0usize)];
        marks[start] = Mark::Open;
        while let Some((node, next)) = stack.last_mut() {
            match scene.nodes[*node].children.get(*next).copied() {
                Some(child) => {
                    *next += 1;
                    match marks[child] {
                        Mark::Open => {
                            return Err(invalid(scene, format!("node graph has a cycle through node {child}")));
                        }
                        Mark::New => {
                            marks[child] = Mark::Open;
                            stack.push((child, 0));
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[*node] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }
    Ok(())
}

/// Element counts of every buffer of a model. Buffers are allocated with one extra sentinel element, so none of
/// them is ever empty.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Counts {
    pub vertices: u64,
    pub indices16: u64,
    pub indices32: u64,
    /// Number of draw commands (and instance records) using 16 bit indices.
    pub draws16: u64,
    pub draws32: u64,
    /// Materials including the implicit default material.
    pub materials: u64,
    pub lights: u64,
    pub light_instances: u64,
    /// Textures referenced by materials.
    pub textures: u64,
    pub meshes: u64,
    pub mesh_instances: u64,
}

impl Counts {
    /// Count the elements of a validated scene.
    pub fn of(scene: &Scene, layout: &SceneLayout) -> Self {
        let mut counts = Self::of_non_geometry(scene, layout);
        for (mesh, instances) in scene.meshes.iter().zip(&layout.mesh_instances) {
            for primitive in &mesh.primitives {
                counts.vertices += primitive.vertex_count() as u64;
                let indices = primitive.index_count() as u64;
                match IndexWidth::of(primitive) {
                    IndexWidth::U16 => {
                        counts.indices16 += indices;
                        counts.draws16 += instances.len() as u64;
                    }
                    IndexWidth::U32 => {
                        counts.indices32 += indices;
                        counts.draws32 += instances.len() as u64;
                    }
                }
            }
        }
        counts
    }

    /// Number of upload parts a model with these counts completes with: one per mesh (its instances), material,
    /// light and light instance.
    pub fn parts(&self) -> usize {
        (self.meshes + self.materials + self.lights + self.light_instances) as usize
    }
}

/// Where one primitive lives in the buffers of a model. Offsets and counts are in elements.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrimitiveOffsets {
    /// First vertex in the vertex buffer. Indices are relative to it.
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub width: IndexWidth,
    /// First index in the index buffer of `width`.
    pub first_index: u32,
    pub index_count: u32,
    /// Position of this primitive among the primitives of its mesh with the same index width.
    pub rank: u32,
    pub material: u32,
}

/// Offsets of a mesh and its draws.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshOffsets {
    pub primitives: Vec<PrimitiveOffsets>,
    pub first_draw16: u32,
    pub first_draw32: u32,
    /// Number of 16 bit primitives, which is the number of 16 bit draws per instance.
    pub draws16_per_instance: u32,
    pub draws32_per_instance: u32,
    pub instance_count: u32,
}

impl MeshOffsets {
    /// Draw slot of one primitive of one instance, in the draw buffer of the primitive's index width.
    pub fn draw_slot(&self, instance: u32, primitive: &PrimitiveOffsets) -> u32 {
        match primitive.width {
            IndexWidth::U16 => self.first_draw16 + instance * self.draws16_per_instance + primitive.rank,
            IndexWidth::U32 => self.first_draw32 + instance * self.draws32_per_instance + primitive.rank,
        }
    }

    /// All draw slots of this mesh in the draw buffer of `width`.
    pub fn draws(&self, width: IndexWidth) -> Range<u32> {
        let (first, per_instance) = match width {
            IndexWidth::U16 => (self.first_draw16, self.draws16_per_instance),
            IndexWidth::U32 => (self.first_draw32, self.draws32_per_instance),
        };
        first..first + per_instance * self.instance_count
    }
}

/// Offsets of every mesh of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOffsets {
    pub meshes: Vec<MeshOffsets>,
    /// Totals, equal to [`Counts::of()`] for the same scene.
    pub counts: Counts,
}

/// Assign every primitive and draw of a validated scene its range in the model buffers.
/// See the [module documentation](self) for the layout.
pub fn compute_offsets(scene: &Scene, layout: &SceneLayout) -> ModelOffsets {
    let mut vertices = 0u32;
    let (mut indices16, mut indices32) = (0u32, 0u32);
    let (mut draws16, mut draws32) = (0u32, 0u32);

    let meshes = scene
        .meshes
        .iter()
        .zip(&layout.mesh_instances)
        .map(|(mesh, instances)| {
            let (mut rank16, mut rank32) = (0u32, 0u32);
            let primitives = mesh
                .primitives
                .iter()
                .map(|primitive| {
                    let width = IndexWidth::of(primitive);
                    let index_count = primitive.index_count() as u32;
                    let (first_index, rank) = match width {
                        IndexWidth::U16 => {
                            let at = (indices16, rank16);
                            indices16 += index_count;
                            rank16 += 1;
                            at
                        }
                        IndexWidth::U32 => {
                            let at = (indices32, rank32);
                            indices32 += index_count;
                            rank32 += 1;
                            at
                        }
                    };
                    let offsets = PrimitiveOffsets {
                        vertex_offset: vertices,
                        vertex_count: primitive.vertex_count() as u32,
                        width,
                        first_index,
                        index_count,
                        rank,
                        material: layout.material_of(primitive) as u32,
                    };
                    vertices += offsets.vertex_count;
                    offsets
                })
                .collect();

            let instance_count = instances.len() as u32;
            let offsets = MeshOffsets {
                primitives,
                first_draw16: draws16,
                first_draw32: draws32,
                draws16_per_instance: rank16,
                draws32_per_instance: rank32,
                instance_count,
            };
            draws16 += rank16 * instance_count;
            draws32 += rank32 * instance_count;
            offsets
        })
        .collect();

    ModelOffsets {
        meshes,
        counts: Counts {
            vertices: vertices as u64,
            indices16: indices16 as u64,
            indices32: indices32 as u64,
            draws16: draws16 as u64,
            draws32: draws32 as u64,
            ..Counts::of_non_geometry(scene, layout)
        },
    }
}

impl Counts {
    fn of_non_geometry(scene: &Scene, layout: &SceneLayout) -> Self {
        Counts {
            materials: (scene.materials.len() + layout.default_material.is_some() as usize) as u64,
            lights: scene.lights.len() as u64,
            light_instances: layout.light_nodes.len() as u64,
            textures: layout.textures.iter().flatten().count() as u64,
            meshes: scene.meshes.len() as u64,
            mesh_instances: layout.mesh_nodes.len() as u64,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Indices, Material, Mesh, Node};

    fn triangle(indices: Option<Indices>) -> Primitive {
        Primitive {
            positions: vec![[0.0; 3]; 3],
            indices,
            ..Default::default()
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let scene = Scene {
            nodes: vec![
                Node {
                    children: vec![1],
                    ..Default::default()
                },
                Node {
                    children: vec![0],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let err = SceneLayout::new(&scene).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidScene { .. })));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let scene = Scene {
            meshes: vec![Mesh {
                name: String::new(),
                primitives: vec![triangle(Some(Indices::U16(vec![0, 1, 3])))],
            }],
            ..Default::default()
        };
        assert!(SceneLayout::new(&scene).is_err());
    }

    #[test]
    fn default_material_is_appended_when_needed() {
        let mut scene = Scene {
            meshes: vec![Mesh {
                name: String::new(),
                primitives: vec![triangle(None)],
            }],
            materials: vec![Material::default()],
            nodes: vec![Node::with_mesh(0, Mat4::IDENTITY)],
            ..Default::default()
        };
        let layout = SceneLayout::new(&scene).unwrap();
        assert_eq!(layout.default_material, Some(1));
        assert_eq!(Counts::of(&scene, &layout).materials, 2);

        scene.meshes[0].primitives[0].material = Some(0);
        let layout = SceneLayout::new(&scene).unwrap();
        assert_eq!(layout.default_material, None);
        assert_eq!(Counts::of(&scene, &layout).materials, 1);
    }

    #[test]
    fn world_transforms_accumulate() {
        let scene = Scene {
            meshes: vec![Mesh::default()],
            nodes: vec![
                Node {
                    transform: Mat4::from_translation(glam::Vec3::X),
                    children: vec![1],
                    ..Default::default()
                },
                Node::with_mesh(0, Mat4::from_translation(glam::Vec3::Y)),
            ],
            ..Default::default()
        };
        let layout = SceneLayout::new(&scene).unwrap();
        assert_eq!(layout.mesh_nodes.len(), 1);
        assert_eq!(layout.mesh_nodes[0].transform, Mat4::from_translation(glam::Vec3::new(1.0, 1.0, 0.0)));
    }
}
