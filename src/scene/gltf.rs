//! Imports `.gltf` and `.glb` files into a [`Scene`].
//!
//! Buffers may be embedded in a binary chunk, stored as base64 data URIs or live in files next to the document.
//! Images are not decoded here. Embedded images become [`TextureSource::Encoded`] and external ones
//! [`TextureSource::File`], so decoding happens on the loader's worker threads.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::{general_purpose::STANDARD as BASE64, Engine as _};
use glam::Mat4;

use crate::scene::{
    AlphaMode, ImportOptions, Indices, Light, LightKind, Material, Mesh, Node, Primitive, Scene, SceneImporter,
    TextureSource,
};

/// [`SceneImporter`] for glTF 2.0 documents, including the `KHR_lights_punctual` extension.
///
/// glTF is defined in meters, so [`ImportOptions::scale`] is ignored.
#[derive(Debug, Default, Copy, Clone)]
pub struct GltfImporter;

impl GltfImporter {
    pub fn new() -> Self {
        Self
    }
}

fn decode_data_uri(uri: &str) -> Option<Result<Vec<u8>>> {
    let rest = uri.strip_prefix("data:")?;
    Some(match rest.split_once(";base64,") {
        Some((_mime, data)) => BASE64.decode(data).context("invalid base64 in data URI"),
        None => Err(anyhow!("data URI is not base64 encoded")),
    })
}

fn resolve_file(base: &Path, uri: &str) -> PathBuf {
    let uri = uri.strip_prefix("file://").or_else(|| uri.strip_prefix("file:")).unwrap_or(uri);
    base.join(uri)
}

fn load_buffers(document: &::gltf::Document, mut blob: Option<Vec<u8>>, base: &Path) -> Result<Vec<Vec<u8>>> {
    document
        .buffers()
        .map(|buffer| {
            let data = match buffer.source() {
                ::gltf::buffer::Source::Bin => blob.take().ok_or_else(|| anyhow!("missing binary chunk"))?,
                ::gltf::buffer::Source::Uri(uri) => match decode_data_uri(uri) {
                    Some(data) => data?,
                    None => {
                        let path = resolve_file(base, uri);
                        std::fs::read(&path).with_context(|| format!("failed to read buffer {}", path.display()))?
                    }
                },
            };
            if data.len() < buffer.length() {
                bail!("buffer {} holds {} bytes, expected {}", buffer.index(), data.len(), buffer.length());
            }
            Ok(data)
        })
        .collect()
}

fn texture_source(texture: ::gltf::Texture, buffers: &[Vec<u8>], base: &Path) -> Result<TextureSource> {
    match texture.source().source() {
        ::gltf::image::Source::View {
            view, ..
        } => {
            let buffer = &buffers[view.buffer().index()];
            let range = view.offset()..view.offset() + view.length();
            let data = buffer
                .get(range)
                .ok_or_else(|| anyhow!("image view of texture {} is out of bounds", texture.index()))?;
            Ok(TextureSource::Encoded(data.into()))
        }
        ::gltf::image::Source::Uri {
            uri, ..
        } => match decode_data_uri(uri) {
            Some(data) => Ok(TextureSource::Encoded(data?.into())),
            None => Ok(TextureSource::File(resolve_file(base, uri))),
        },
    }
}

fn material(material: ::gltf::Material) -> Material {
    let pbr = material.pbr_metallic_roughness();
    let defaults = Material::default();
    Material {
        name: material.name().unwrap_or_default().to_owned(),
        base_color_factor: pbr.base_color_factor(),
        base_color_texture: pbr.base_color_texture().map(|info| info.texture().index()),
        metallic_factor: pbr.metallic_factor(),
        roughness_factor: pbr.roughness_factor(),
        metallic_roughness_texture: pbr.metallic_roughness_texture().map(|info| info.texture().index()),
        normal_texture: material.normal_texture().map(|info| info.texture().index()),
        normal_scale: material.normal_texture().map_or(defaults.normal_scale, |info| info.scale()),
        occlusion_texture: material.occlusion_texture().map(|info| info.texture().index()),
        occlusion_strength: material
            .occlusion_texture()
            .map_or(defaults.occlusion_strength, |info| info.strength()),
        emissive_factor: material.emissive_factor(),
        emissive_texture: material.emissive_texture().map(|info| info.texture().index()),
        alpha_mode: match material.alpha_mode() {
            ::gltf::material::AlphaMode::Opaque => AlphaMode::Opaque,
            ::gltf::material::AlphaMode::Mask => AlphaMode::Mask,
            ::gltf::material::AlphaMode::Blend => AlphaMode::Blend,
        },
        alpha_cutoff: material.alpha_cutoff().unwrap_or(defaults.alpha_cutoff),
        double_sided: material.double_sided(),
    }
}

fn mesh(mesh: ::gltf::Mesh, buffers: &[Vec<u8>]) -> Mesh {
    let mut primitives = Vec::new();
    for primitive in mesh.primitives() {
        if primitive.mode() != ::gltf::mesh::Mode::Triangles {
            warn!(
                "Skipping primitive {} of mesh {} with mode {:?}",
                primitive.index(),
                mesh.index(),
                primitive.mode()
            );
            continue;
        }
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(Vec::as_slice));
        let Some(positions) = reader.read_positions() else {
            warn!("Skipping primitive {} of mesh {} without positions", primitive.index(), mesh.index());
            continue;
        };
        let indices = reader.read_indices().map(|indices| match indices {
            ::gltf::mesh::util::ReadIndices::U8(indices) => Indices::U16(indices.map(u16::from).collect()),
            ::gltf::mesh::util::ReadIndices::U16(indices) => Indices::U16(indices.collect()),
            ::gltf::mesh::util::ReadIndices::U32(indices) => Indices::U32(indices.collect()),
        });
        primitives.push(Primitive {
            positions: positions.collect(),
            normals: reader.read_normals().map(Iterator::collect),
            tex_coords: reader.read_tex_coords(0).map(|uvs| uvs.into_f32().collect()),
            tangents: reader.read_tangents().map(Iterator::collect),
            indices,
            material: primitive.material().index(),
        });
    }
    Mesh {
        name: mesh.name().unwrap_or_default().to_owned(),
        primitives,
    }
}

fn light(light: ::gltf::khr_lights_punctual::Light) -> Light {
    Light {
        name: light.name().unwrap_or_default().to_owned(),
        kind: match light.kind() {
            ::gltf::khr_lights_punctual::Kind::Directional => LightKind::Directional,
            ::gltf::khr_lights_punctual::Kind::Point => LightKind::Point,
            ::gltf::khr_lights_punctual::Kind::Spot {
                inner_cone_angle,
                outer_cone_angle,
            } => LightKind::Spot {
                inner_cone_angle,
                outer_cone_angle,
            },
        },
        color: light.color(),
        intensity: light.intensity(),
        range: light.range(),
    }
}

fn node(node: ::gltf::Node) -> Node {
    Node {
        name: node.name().unwrap_or_default().to_owned(),
        transform: Mat4::from_cols_array_2d(&node.transform().matrix()),
        children: node.children().map(|child| child.index()).collect(),
        mesh: node.mesh().map(|mesh| mesh.index()),
        light: node.light().map(|light| light.index()),
    }
}

impl SceneImporter for GltfImporter {
    fn import(&self, path: &Path, _options: &ImportOptions) -> Result<Scene> {
        let ::gltf::Gltf {
            document,
            blob,
        } = ::gltf::Gltf::open(path).with_context(|| format!("failed to parse {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let buffers = load_buffers(&document, blob, base)?;

        let textures = document
            .textures()
            .map(|texture| texture_source(texture, &buffers, base))
            .collect::<Result<Vec<_>>>()?;

        let roots = document
            .default_scene()
            .or_else(|| document.scenes().next())
            .map(|scene| scene.nodes().map(|node| node.index()).collect())
            .unwrap_or_default();

        let scene = Scene {
            name: path.display().to_string(),
            meshes: document.meshes().map(|m| mesh(m, &buffers)).collect(),
            materials: document.materials().map(material).collect(),
            textures,
            lights: document.lights().map(|lights| lights.map(light).collect()).unwrap_or_default(),
            nodes: document.nodes().map(node).collect(),
            roots,
        };
        debug!(
            "Imported {}: {} meshes, {} materials, {} textures, {} nodes",
            scene.name,
            scene.meshes.len(),
            scene.materials.len(),
            scene.textures.len(),
            scene.nodes.len()
        );
        Ok(scene)
    }
}
