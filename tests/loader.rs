use std::sync::Arc;
use std::thread;

use anyhow::Result;
use glam::Mat4;

use deimos::backend::headless::{HeadlessDevice, HeadlessSettings, HeadlessStats};
use deimos::loader::gpu::{DrawIndexedIndirect, GpuLight, GpuMaterial, LightInstance, MeshInstance, Vertex};
use deimos::prelude::*;
use deimos::scene::layout::{compute_offsets, IndexWidth, SceneLayout};

mod framework;

use framework::{quad, quads, solid_texture, wait, TIMEOUT};

/// Three meshes (two with 16 bit indices, one with 32 bit indices), two materials referencing five textures and a
/// spot light.
fn test_scene() -> Scene {
    let meshes = vec![
        Mesh {
            name: String::from("narrow"),
            primitives: vec![quad(None, Some(0))],
        },
        Mesh {
            name: String::from("generated"),
            primitives: vec![Primitive {
                positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                material: Some(1),
                ..Default::default()
            }],
        },
        Mesh {
            name: String::from("wide"),
            primitives: vec![quad(Some(Indices::U32(vec![0, 1, 2, 2, 3, 0])), None)],
        },
    ];
    let materials = vec![
        Material {
            base_color_texture: Some(0),
            normal_texture: Some(1),
            ..Default::default()
        },
        Material {
            base_color_texture: Some(2),
            metallic_roughness_texture: Some(3),
            emissive_texture: Some(4),
            ..Default::default()
        },
    ];
    let textures = (0..5).map(|i| solid_texture(4, 4, [i * 40, 0, 0, 255])).collect();
    let mut nodes = framework::scene_of(meshes.clone()).nodes;
    nodes.push(Node::with_light(0, Mat4::from_translation(glam::vec3(0.0, 5.0, 0.0))));
    Scene {
        name: String::from("test"),
        meshes,
        materials,
        textures,
        lights: vec![Light {
            kind: LightKind::Spot {
                inner_cone_angle: 0.2,
                outer_cone_angle: 0.4,
            },
            ..Default::default()
        }],
        nodes,
        roots: Vec::new(),
    }
}

#[test]
pub fn model_streams_completely() -> Result<()> {
    let ctx = framework::make_context()?;
    let scene = test_scene();
    let layout = SceneLayout::new(&scene)?;
    let offsets = compute_offsets(&scene, &layout);

    let model = ctx.loader.load_scene("test", scene.clone())?;
    wait(model.sync_timeout(TIMEOUT))?;
    assert_eq!(model.draw_count16(), 2);
    assert_eq!(model.draw_count32(), 1);
    assert_eq!(*model.counts(), offsets.counts);

    let draws16 = model.buffers().draws16.read_pod::<DrawIndexedIndirect>();
    let draws32 = model.buffers().draws32.read_pod::<DrawIndexedIndirect>();
    let instances16 = model.buffers().instances16.read_pod::<MeshInstance>();
    let vertices = model.buffers().vertices.read_pod::<Vertex>();
    for (m, mesh) in offsets.meshes.iter().enumerate() {
        for (p, primitive) in mesh.primitives.iter().enumerate() {
            let slot = mesh.draw_slot(0, primitive) as usize;
            let draw = match primitive.width {
                IndexWidth::U16 => draws16[slot],
                IndexWidth::U32 => draws32[slot],
            };
            assert_eq!(draw.index_count, primitive.index_count);
            assert_eq!(draw.first_index, primitive.first_index);
            assert_eq!(draw.vertex_offset, primitive.vertex_offset as i32);
            assert_eq!(draw.instance_count, 1);
            assert_eq!(draw.first_instance, slot as u32, "Draw should point at its own instance record.");

            let first = &vertices[primitive.vertex_offset as usize];
            assert_eq!(first.position, scene.meshes[m].primitives[p].positions[0]);
            if primitive.width == IndexWidth::U16 {
                assert_eq!(instances16[slot].mesh, m as u32);
                assert_eq!(instances16[slot].material, primitive.material);
            }
        }
    }

    // 16 bit indices of the generated primitive are sequential.
    let generated = &offsets.meshes[1].primitives[0];
    let indices16 = model.buffers().indices16.read_pod::<u16>();
    let start = generated.first_index as usize;
    assert_eq!(&indices16[start..start + 3], &[0, 1, 2]);

    let light = model.buffers().lights.read_pod::<GpuLight>()[0];
    assert!((light.inner_cone_cos - 0.2f32.cos()).abs() < 1e-6);
    let light_instance = model.buffers().light_instances.read_pod::<LightInstance>()[0];
    assert_eq!(light_instance.position[..3], [0.0, 5.0, 0.0]);
    assert_eq!(light_instance.light, 0);
    Ok(())
}

#[test]
pub fn materials_reference_texture_slots() -> Result<()> {
    let ctx = framework::make_context()?;
    let model = ctx.loader.load_scene("test", test_scene())?;
    wait(model.sync_timeout(TIMEOUT))?;
    let textures = model.textures();
    assert_eq!(textures.len(), 5);
    let slot = |i: usize| textures[i].as_ref().expect("Texture is referenced by a material.").slot();

    let materials = model.buffers().materials.read_pod::<GpuMaterial>();
    assert_eq!(materials[0].base_color_texture, slot(0));
    assert_eq!(materials[0].normal_texture, slot(1));
    assert_eq!(materials[0].metallic_roughness_texture, ctx.loader.white_slot());
    assert_eq!(materials[1].base_color_texture, slot(2));
    assert_eq!(materials[1].metallic_roughness_texture, slot(3));
    assert_eq!(materials[1].emissive_texture, slot(4));
    assert_eq!(materials[1].normal_texture, ctx.loader.flat_normal_slot());
    // The wide mesh has no material, so a default one is appended.
    assert_eq!(model.counts().materials, 3);
    assert_eq!(materials[2].base_color_texture, ctx.loader.white_slot());

    for texture in textures.iter().flatten() {
        wait(texture.sync_timeout(TIMEOUT))?;
        let image = texture.image().expect("Finished texture should have an image.");
        let bound = ctx.bindless.descriptor_set().image_at(texture.slot()).expect("Slot should be bound.");
        assert_eq!(bound.id(), image.id(), "Slot should point at the uploaded image.");
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(image.owner(), QueueType::Graphics);
    }
    assert_eq!(textures[0].as_ref().unwrap().format(), vk::Format::R8G8B8A8_SRGB);
    assert_eq!(textures[1].as_ref().unwrap().format(), vk::Format::R8G8B8A8_UNORM);
    Ok(())
}

#[test]
pub fn model_is_usable_before_streaming() -> Result<()> {
    let ctx = framework::make_context()?;
    let model = ctx.loader.load_scene("test", test_scene())?;
    // Buffers and descriptors exist as soon as the call returns.
    assert_eq!(model.descriptor_set().len(), 10);
    for texture in model.textures().iter().flatten() {
        assert!(
            ctx.bindless.descriptor_set().image_at(texture.slot()).is_some(),
            "Texture slot should be bound to a placeholder right away."
        );
    }
    wait(model.sync_timeout(TIMEOUT))?;
    Ok(())
}

#[test]
pub fn concurrent_loads_converge() -> Result<()> {
    let ctx = framework::make_context_with_settings(HeadlessSettings::default(), |builder| {
        builder
            .workers(3)
            .staging_size(2048)
            .command_buffer_batch_size(2)
            .max_batches_in_flight(1)
            .task_queue_capacity(4)
    })?;
    let loader = &ctx.loader;
    let models = thread::scope(|scope| {
        let handles = (0..4)
            .map(|writer| {
                scope.spawn(move || {
                    (0..4)
                        .map(|i| {
                            let mut scene = quads(8 + i);
                            scene.textures = vec![solid_texture(8, 8, [255; 4])];
                            scene.materials = vec![Material {
                                base_color_texture: Some(0),
                                ..Default::default()
                            }];
                            loop {
                                match loader.load_scene(format!("model {writer}/{i}"), scene.clone()) {
                                    Ok(model) => return model,
                                    Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::QueueFull(_))) => {
                                        thread::yield_now()
                                    }
                                    Err(err) => panic!("load failed: {err:#}"),
                                }
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().flat_map(|handle| handle.join().unwrap()).collect::<Vec<_>>()
    });

    assert_eq!(models.len(), 16);
    for model in &models {
        wait(model.sync_timeout(TIMEOUT))?;
        assert_eq!(model.draw_count16(), model.counts().draws16);
        let draws = model.buffers().draws16.read_pod::<DrawIndexedIndirect>();
        assert!(draws[..model.counts().draws16 as usize].iter().all(|draw| draw.index_count == 6));
    }
    Ok(())
}

#[test]
pub fn staging_smaller_than_mesh_is_chunked() -> Result<()> {
    let ctx = framework::make_context_with_settings(HeadlessSettings::default(), |builder| builder.staging_size(256))?;
    let count = 200u32;
    let positions = (0..count).map(|i| [i as f32, 0.0, 0.0]).collect::<Vec<_>>();
    let indices = (0..count - 2).flat_map(|i| [0, i + 1, i + 2]).collect::<Vec<_>>();
    let scene = framework::scene_of(vec![Mesh {
        name: String::from("fan"),
        primitives: vec![Primitive {
            positions,
            indices: Some(Indices::U32(indices.clone())),
            ..Default::default()
        }],
    }]);
    let model = ctx.loader.load_scene("fan", scene)?;
    wait(model.sync_timeout(TIMEOUT))?;
    let vertices = model.buffers().vertices.read_pod::<Vertex>();
    assert_eq!(vertices[count as usize - 1].position, [(count - 1) as f32, 0.0, 0.0]);
    assert_eq!(&model.buffers().indices32.read_pod::<u32>()[..indices.len()], &indices);
    Ok(())
}

#[test]
pub fn model_without_meshes_is_ready() -> Result<()> {
    let ctx = framework::make_context()?;
    let model = ctx.loader.load_scene("empty", Scene::default())?;
    assert!(model.is_ready());
    assert_eq!(model.outcome(), Some(Ok(())));
    Ok(())
}

#[test]
pub fn wait_async_resolves() -> Result<()> {
    let ctx = framework::make_context()?;
    let model = ctx.loader.load_scene("quads", quads(3))?;
    futures::executor::block_on(model.wait_async())?;
    assert_eq!(model.draw_count16(), 3);
    Ok(())
}

#[test]
pub fn device_failure_fails_model() -> Result<()> {
    let ctx = framework::make_context()?;
    ctx.device.fail_next_submissions(1);
    let model = ctx.loader.load_scene("doomed", quads(2))?;
    let outcome = wait(model.sync_timeout(TIMEOUT));
    assert!(matches!(outcome, Err(AssetError::Upload(_))), "Lost device should fail the model, got {outcome:?}.");

    // The pipeline keeps running for later assets.
    let model = ctx.loader.load_scene("fine", quads(2))?;
    wait(model.sync_timeout(TIMEOUT))?;
    Ok(())
}

#[test]
pub fn loading_requires_running_loader() -> Result<()> {
    let mut ctx = framework::make_context()?;
    ctx.loader.stop();
    assert!(!ctx.loader.is_running());
    let err = ctx.loader.load_scene("late", quads(1)).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotRunning)));

    ctx.loader.start()?;
    let err = ctx.loader.start().unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::AlreadyRunning)));
    let model = ctx.loader.load_scene("again", quads(1))?;
    wait(model.sync_timeout(TIMEOUT))?;
    Ok(())
}

#[test]
pub fn hand_built_zero_settings_are_raised() -> Result<()> {
    framework::init_logging();
    let device = Arc::new(HeadlessDevice::new());
    let set = device.create_bindless_set(16);
    let bindless = Arc::new(BindlessTable::new(device.clone(), set, 16));
    let settings = LoaderSettings {
        workers: 0,
        pending_model_capacity: 0,
        pending_texture_capacity: 0,
        task_queue_capacity: 0,
        command_buffer_batch_size: 0,
        max_batches_in_flight: 0,
        ..Default::default()
    };
    let mut loader = Loader::new(device, bindless, settings)?;
    assert_eq!(loader.settings().pending_model_capacity, 1);
    assert_eq!(loader.settings().workers, 1);
    assert_eq!(loader.command_buffer_batch_size(), 1);

    loader.start()?;
    let model = loader.load_scene("tiny", quads(2))?;
    wait(model.sync_timeout(TIMEOUT))?;
    assert_eq!(model.draw_count16(), 2);
    Ok(())
}

#[test]
pub fn batch_size_changes_at_runtime() -> Result<()> {
    let ctx = framework::make_context_with_settings(HeadlessSettings::default(), |builder| {
        builder.workers(1).command_buffer_batch_size(1)
    })?;
    let stream = |name: &str| -> Result<HeadlessStats> {
        let before = ctx.device.stats();
        let model = ctx.loader.load_scene(name, quads(16))?;
        wait(model.sync_timeout(TIMEOUT))?;
        let after = ctx.device.stats();
        Ok(HeadlessStats {
            transfer_submissions: after.transfer_submissions - before.transfer_submissions,
            secondary_buffers: after.secondary_buffers - before.secondary_buffers,
            ..Default::default()
        })
    };

    let single = stream("one by one")?;
    ctx.loader.set_command_buffer_batch_size(64);
    assert_eq!(ctx.loader.command_buffer_batch_size(), 64);
    let batched = stream("batched")?;

    assert!(
        batched.transfer_submissions < single.transfer_submissions,
        "Larger batches should need fewer submissions ({batched:?} vs {single:?})."
    );
    assert!(
        batched.secondary_buffers > batched.transfer_submissions,
        "Batched submissions should execute several command buffers each ({batched:?})."
    );
    Ok(())
}

#[test]
pub fn model_buffers_are_created_in_one_batch() -> Result<()> {
    let ctx = framework::make_context()?;
    let before = ctx.device.stats().buffer_batches;
    let model = ctx.loader.load_scene("batched buffers", test_scene())?;
    assert_eq!(ctx.device.stats().buffer_batches, before + 1, "All buffers of a model should be cleared at once.");
    wait(model.sync_timeout(TIMEOUT))?;
    Ok(())
}

#[test]
pub fn stop_signals_every_asset() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(HeadlessSettings::default(), |builder| {
        builder.staging_size(512).pending_model_capacity(8)
    })?;
    let models = (0..8).filter_map(|i| ctx.loader.load_scene(format!("model {i}"), quads(32)).ok()).collect::<Vec<_>>();
    ctx.loader.stop();
    for model in &models {
        let outcome = model.outcome().expect("Every asset should be signaled once stop returns.");
        assert!(
            matches!(outcome, Ok(()) | Err(AssetError::Stopped)),
            "Unexpected outcome {outcome:?}"
        );
    }
    Ok(())
}

#[test]
pub fn queue_full_is_reported() -> Result<()> {
    framework::init_logging();
    let device = Arc::new(HeadlessDevice::new());
    let set = device.create_bindless_set(16);
    let bindless = Arc::new(BindlessTable::new(device.clone(), set, 16));
    let settings = LoaderBuilder::new()
        .workers(1)
        .pending_model_capacity(1)
        .task_queue_capacity(1)
        .build();
    let mut loader = Loader::new(device, bindless, settings)?;
    loader.start()?;

    // With a single task slot the coordinator feeds the first model to its worker one task at a time and
    // accepts nothing else meanwhile.
    let results = (0..32).map(|i| loader.load_scene(format!("burst {i}"), quads(64))).collect::<Vec<_>>();
    let rejected = results
        .iter()
        .filter(|result| {
            matches!(
                result.as_ref().err().and_then(|err| err.downcast_ref::<Error>()),
                Some(Error::QueueFull("model"))
            )
        })
        .count();
    assert!(rejected > 0, "A burst of loads should overflow a pending queue of one.");
    for model in results.into_iter().flatten() {
        wait(model.sync_timeout(TIMEOUT))?;
    }
    Ok(())
}

#[test]
pub fn bindless_exhaustion_is_reported() -> Result<()> {
    framework::init_logging();
    let device = Arc::new(HeadlessDevice::new());
    let set = device.create_bindless_set(4);
    let bindless = Arc::new(BindlessTable::new(device.clone(), set, 4));
    let mut loader = Loader::new(device, bindless.clone(), LoaderBuilder::new().workers(1).build())?;
    loader.start()?;
    // Two slots are taken by the placeholders.
    assert_eq!(bindless.available(), 2);
    let err = loader.load_scene("test", test_scene()).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::BindlessExhausted(_))));
    assert_eq!(bindless.available(), 2, "Failed load should not leak slots.");
    Ok(())
}

#[test]
pub fn shared_queue_family_skips_ownership_transfer() -> Result<()> {
    let settings = HeadlessSettings {
        distinct_transfer_queue: false,
    };
    let ctx = framework::make_context_with_settings(settings, |builder| builder.generate_mipmaps(true))?;
    let model = ctx.loader.load_scene("test", test_scene())?;
    wait(model.sync_timeout(TIMEOUT))?;
    for texture in model.textures().iter().flatten() {
        wait(texture.sync_timeout(TIMEOUT))?;
        let image = texture.image().unwrap();
        assert_eq!(image.mip_levels(), 3, "A 4x4 texture should get a full mip chain.");
        assert_eq!(image.mip(2).len(), 4);
    }
    Ok(())
}
