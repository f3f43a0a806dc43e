use std::collections::HashSet;

use anyhow::Result;
use glam::Mat4;

use deimos::prelude::*;
use deimos::scene::layout::{compute_offsets, IndexWidth, SceneLayout};

mod framework;

use framework::quad;

fn wide_indices() -> Indices {
    Indices::U32(vec![0, 1, 2, 2, 3, 0])
}

/// Three meshes with mixed index widths, mesh 0 instanced three times through a small hierarchy.
fn mixed_scene() -> Scene {
    let meshes = vec![
        Mesh {
            name: String::from("mixed"),
            primitives: vec![quad(None, Some(0)), quad(Some(wide_indices()), Some(1)), quad(None, None)],
        },
        Mesh {
            name: String::from("wide"),
            primitives: vec![quad(Some(wide_indices()), Some(0))],
        },
        Mesh {
            name: String::from("generated"),
            primitives: vec![Primitive {
                positions: vec![[0.0; 3]; 6],
                ..Default::default()
            }],
        },
    ];
    let mut parent = Node::with_mesh(0, Mat4::from_translation(glam::vec3(0.0, 2.0, 0.0)));
    parent.children = vec![1, 2];
    let nodes = vec![
        parent,
        Node::with_mesh(0, Mat4::IDENTITY),
        Node::with_mesh(1, Mat4::IDENTITY),
        Node::with_mesh(0, Mat4::from_scale(glam::Vec3::splat(2.0))),
        Node::with_mesh(2, Mat4::IDENTITY),
    ];
    Scene {
        name: String::from("mixed"),
        meshes,
        materials: vec![Material::default(), Material::default()],
        nodes,
        ..Default::default()
    }
}

#[test]
pub fn offsets_match_counts() -> Result<()> {
    let scene = mixed_scene();
    let layout = SceneLayout::new(&scene)?;
    let counts = Counts::of(&scene, &layout);
    let offsets = compute_offsets(&scene, &layout);
    assert_eq!(offsets.counts, counts);

    assert_eq!(counts.vertices, 4 * 3 + 4 + 6);
    assert_eq!(counts.indices16, 12 + 6);
    assert_eq!(counts.indices32, 12);
    assert_eq!(counts.mesh_instances, 5);
    // Mesh 0 has two 16 bit primitives and three instances, mesh 2 one instance of one primitive.
    assert_eq!(counts.draws16, 2 * 3 + 1);
    assert_eq!(counts.draws32, 3 + 1);
    assert_eq!(counts.materials, 3, "Primitive without material should add the default material.");
    Ok(())
}

#[test]
pub fn ranges_are_disjoint_and_dense() -> Result<()> {
    let scene = mixed_scene();
    let layout = SceneLayout::new(&scene)?;
    let offsets = compute_offsets(&scene, &layout);

    let mut next_vertex = 0;
    let (mut next16, mut next32) = (0, 0);
    for mesh in &offsets.meshes {
        for primitive in &mesh.primitives {
            assert_eq!(primitive.vertex_offset, next_vertex, "Vertex ranges should be packed in order.");
            next_vertex += primitive.vertex_count;
            let next = match primitive.width {
                IndexWidth::U16 => &mut next16,
                IndexWidth::U32 => &mut next32,
            };
            assert_eq!(primitive.first_index, *next, "Index ranges should be packed per width.");
            *next += primitive.index_count;
        }
    }

    for width in [IndexWidth::U16, IndexWidth::U32] {
        let total = match width {
            IndexWidth::U16 => offsets.counts.draws16,
            IndexWidth::U32 => offsets.counts.draws32,
        };
        let mut slots = HashSet::new();
        for mesh in &offsets.meshes {
            let range = mesh.draws(width);
            for instance in 0..mesh.instance_count {
                for primitive in mesh.primitives.iter().filter(|primitive| primitive.width == width) {
                    let slot = mesh.draw_slot(instance, primitive);
                    assert!(range.contains(&slot), "Draw slot should lie inside the range of its mesh.");
                    assert!(slots.insert(slot), "Draw slot {slot} assigned twice.");
                }
            }
        }
        assert_eq!(slots, (0..total as u32).collect::<HashSet<_>>(), "Draw slots should cover the buffer.");
    }
    Ok(())
}

#[test]
pub fn generated_indices_use_narrow_width() -> Result<()> {
    let scene = mixed_scene();
    let layout = SceneLayout::new(&scene)?;
    let offsets = compute_offsets(&scene, &layout);
    let generated = &offsets.meshes[2].primitives[0];
    assert_eq!(generated.width, IndexWidth::U16);
    assert_eq!(generated.index_count, 6);
    Ok(())
}

#[test]
pub fn instances_follow_hierarchy() -> Result<()> {
    let scene = mixed_scene();
    let layout = SceneLayout::new(&scene)?;
    assert_eq!(layout.mesh_instances[0].len(), 3);
    let child = layout
        .mesh_nodes
        .iter()
        .find(|node| node.node == 1)
        .expect("Child node should be instanced.");
    assert_eq!(child.transform, Mat4::from_translation(glam::vec3(0.0, 2.0, 0.0)));
    Ok(())
}

#[test]
pub fn invalid_scenes_are_rejected() {
    let mut scene = mixed_scene();
    scene.meshes[0].primitives[0].material = Some(7);
    let err = SceneLayout::new(&scene).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidScene { .. })));

    let mut scene = mixed_scene();
    scene.meshes[1].primitives[0].indices = Some(Indices::U32(vec![0, 1]));
    assert!(SceneLayout::new(&scene).is_err(), "Index count that is not a triangle list should be rejected.");

    let mut scene = mixed_scene();
    scene.nodes[2].children.push(0);
    assert!(SceneLayout::new(&scene).is_err(), "Cyclic hierarchy should be rejected.");
}
