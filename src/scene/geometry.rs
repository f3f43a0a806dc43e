//! Vertex assembly for primitives, including generation of missing normals and tangents.

use glam::{Vec2, Vec3, Vec4Swizzles};

use crate::loader::gpu::Vertex;
use crate::scene::layout::IndexWidth;
use crate::scene::{Indices, Primitive};

/// Triangle corner indices of a primitive. Non-indexed primitives get sequential indices.
pub fn triangle_indices(primitive: &Primitive) -> Vec<u32> {
    match &primitive.indices {
        Some(indices) => indices.iter().collect(),
        None => (0..primitive.positions.len() as u32).collect(),
    }
}

/// Index data of a primitive encoded at the given width, ready to be copied into an index buffer.
pub fn index_bytes(primitive: &Primitive, width: IndexWidth) -> Vec<u8> {
    match (&primitive.indices, width) {
        (Some(Indices::U16(indices)), IndexWidth::U16) => bytemuck::cast_slice(indices).to_vec(),
        (Some(Indices::U32(indices)), IndexWidth::U32) => bytemuck::cast_slice(indices).to_vec(),
        (_, IndexWidth::U16) => {
            let indices = triangle_indices(primitive).into_iter().map(|i| i as u16).collect::<Vec<_>>();
            bytemuck::cast_slice(&indices).to_vec()
        }
        (_, IndexWidth::U32) => bytemuck::cast_slice(&triangle_indices(primitive)).to_vec(),
    }
}

/// Smooth per-vertex normals, weighted by triangle area.
pub fn generate_normals(positions: &[[f32; 3]], indices: &[u32]) -> Vec<[f32; 3]> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for triangle in indices.chunks_exact(3) {
        let [a, b, c] = [triangle[0], triangle[1], triangle[2]].map(|i| i as usize);
        let (pa, pb, pc) = (Vec3::from(positions[a]), Vec3::from(positions[b]), Vec3::from(positions[c]));
        // Not normalized, so larger triangles contribute more.
        let face = (pb - pa).cross(pc - pa);
        normals[a] += face;
        normals[b] += face;
        normals[c] += face;
    }
    normals
        .into_iter()
        .map(|n| n.try_normalize().unwrap_or(Vec3::Z).to_array())
        .collect()
}

/// Per-vertex tangents from texture coordinate derivatives (Lengyel's method). The bitangent sign ends up in `w`.
pub fn generate_tangents(
    positions: &[[f32; 3]],
    normals: &[[f32; 3]],
    tex_coords: &[[f32; 2]],
    indices: &[u32],
) -> Vec<[f32; 4]> {
    let mut tangents = vec![Vec3::ZERO; positions.len()];
    let mut bitangents = vec![Vec3::ZERO; positions.len()];

    for triangle in indices.chunks_exact(3) {
        let [a, b, c] = [triangle[0], triangle[1], triangle[2]].map(|i| i as usize);
        let e1 = Vec3::from(positions[b]) - Vec3::from(positions[a]);
        let e2 = Vec3::from(positions[c]) - Vec3::from(positions[a]);
        let d1 = Vec2::from(tex_coords[b]) - Vec2::from(tex_coords[a]);
        let d2 = Vec2::from(tex_coords[c]) - Vec2::from(tex_coords[a]);

        let det = d1.x * d2.y - d2.x * d1.y;
        if det.abs() <= f32::EPSILON {
            continue;
        }
        let r = 1.0 / det;
        let tangent = (e1 * d2.y - e2 * d1.y) * r;
        let bitangent = (e2 * d1.x - e1 * d2.x) * r;
        for i in [a, b, c] {
            tangents[i] += tangent;
            bitangents[i] += bitangent;
        }
    }

    (0..positions.len())
        .map(|i| {
            let n = Vec3::from(normals[i]);
            // Gram-Schmidt against the normal.
            let t = (tangents[i] - n * n.dot(tangents[i]))
                .try_normalize()
                .unwrap_or_else(|| n.any_orthonormal_vector());
            let w = if n.cross(t).dot(bitangents[i]) < 0.0 { -1.0 } else { 1.0 };
            t.extend(w).to_array()
        })
        .collect()
}

/// Interleave the attributes of a primitive, generating the ones that are missing.
pub fn build_vertices(primitive: &Primitive) -> Vec<Vertex> {
    let indices = triangle_indices(primitive);
    let normals = match &primitive.normals {
        Some(normals) => normals.clone(),
        None => generate_normals(&primitive.positions, &indices),
    };
    let tex_coords = primitive
        .tex_coords
        .clone()
        .unwrap_or_else(|| vec![[0.0; 2]; primitive.positions.len()]);
    let tangents = match (&primitive.tangents, &primitive.tex_coords) {
        (Some(tangents), _) => tangents.clone(),
        (None, Some(uvs)) => generate_tangents(&primitive.positions, &normals, uvs, &indices),
        (None, None) => normals
            .iter()
            .map(|&n| Vec3::from(n).any_orthonormal_vector().extend(1.0).to_array())
            .collect(),
    };

    primitive
        .positions
        .iter()
        .zip(normals)
        .zip(tex_coords)
        .zip(tangents)
        .map(|(((&position, normal), tex_coord), tangent)| Vertex {
            position,
            normal,
            tex_coord,
            tangent,
        })
        .collect()
}

/// Translation of a transform as a point.
pub fn transform_position(transform: &glam::Mat4) -> [f32; 4] {
    transform.w_axis.xyz().extend(1.0).to_array()
}

/// Direction a transform points the local -Z axis in.
pub fn transform_direction(transform: &glam::Mat4) -> [f32; 4] {
    transform
        .transform_vector3(Vec3::NEG_Z)
        .try_normalize()
        .unwrap_or(Vec3::NEG_Z)
        .extend(0.0)
        .to_array()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> Primitive {
        Primitive {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
            tex_coords: Some(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]),
            indices: Some(Indices::U16(vec![0, 1, 2, 0, 2, 3])),
            ..Default::default()
        }
    }

    #[test]
    fn generated_normals_face_the_winding() {
        let vertices = build_vertices(&quad());
        for vertex in vertices {
            assert_eq!(vertex.normal, [0.0, 0.0, 1.0]);
        }
    }

    #[test]
    fn generated_tangents_follow_u() {
        let vertices = build_vertices(&quad());
        for vertex in vertices {
            let tangent = Vec3::from_slice(&vertex.tangent[..3]);
            assert!((tangent - Vec3::X).length() < 1e-5, "tangent {tangent:?}");
            assert_eq!(vertex.tangent[3], 1.0);
        }
    }

    #[test]
    fn mirrored_uvs_flip_the_bitangent_sign() {
        let mut primitive = quad();
        primitive.tex_coords = Some(vec![[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]);
        let vertices = build_vertices(&primitive);
        assert!(vertices.iter().all(|v| v.tangent[3] == -1.0));
    }

    #[test]
    fn sequential_indices_for_unindexed_primitives() {
        let primitive = Primitive {
            positions: vec![[0.0; 3]; 3],
            ..Default::default()
        };
        assert_eq!(index_bytes(&primitive, IndexWidth::U16), vec![0, 0, 1, 0, 2, 0]);
    }
}
