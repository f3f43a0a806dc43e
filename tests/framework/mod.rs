#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use glam::Mat4;

use deimos::backend::headless::{HeadlessDevice, HeadlessSettings};
use deimos::prelude::*;

/// Upper bound for any single asset in the tests. Hitting it means the pipeline is stuck.
pub const TIMEOUT: Duration = Duration::from_secs(20);

pub const BINDLESS_CAPACITY: u32 = 256;

pub struct Context {
    pub loader: Loader<HeadlessDevice>,
    pub bindless: Arc<BindlessTable<HeadlessDevice>>,
    pub device: Arc<HeadlessDevice>,
}

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

/// Creates a started loader on a headless device, for automated tests
pub fn make_context() -> Result<Context> {
    make_context_with_settings(HeadlessSettings::default(), |builder| builder)
}

/// Create a started loader and adjust its settings
pub fn make_context_with_settings<F: FnOnce(LoaderBuilder) -> LoaderBuilder>(
    device_settings: HeadlessSettings,
    callback: F,
) -> Result<Context> {
    init_logging();
    let device = Arc::new(HeadlessDevice::with_settings(device_settings));
    let set = device.create_bindless_set(BINDLESS_CAPACITY);
    let bindless = Arc::new(BindlessTable::new(device.clone(), set, BINDLESS_CAPACITY));
    let builder = LoaderBuilder::new()
        .workers(2)
        .staging_size(64 * 1024)
        .generate_mipmaps(false);
    let mut loader = Loader::new(device.clone(), bindless.clone(), callback(builder).build())?;
    loader.start()?;
    Ok(Context {
        loader,
        bindless,
        device,
    })
}

/// A `width` by `height` texture where every texel has the same color.
pub fn solid_texture(width: u32, height: u32, color: [u8; 4]) -> TextureSource {
    let pixels = color.iter().copied().cycle().take((width * height * 4) as usize).collect::<Vec<_>>();
    TextureSource::Rgba8 {
        width,
        height,
        pixels: pixels.into(),
    }
}

/// A unit quad in the xy plane.
pub fn quad(indices: Option<Indices>, material: Option<usize>) -> Primitive {
    Primitive {
        positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
        tex_coords: Some(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]),
        indices: indices.or_else(|| Some(Indices::U16(vec![0, 1, 2, 0, 2, 3]))),
        material,
        ..Default::default()
    }
}

/// A scene with one node per mesh, each translated along x by its index.
pub fn scene_of(meshes: Vec<Mesh>) -> Scene {
    let nodes = (0..meshes.len())
        .map(|mesh| Node::with_mesh(mesh, Mat4::from_translation(glam::vec3(mesh as f32, 0.0, 0.0))))
        .collect();
    Scene {
        meshes,
        nodes,
        ..Default::default()
    }
}

/// A scene of `count` quads without materials or textures.
pub fn quads(count: usize) -> Scene {
    scene_of(
        (0..count)
            .map(|i| Mesh {
                name: format!("quad {i}"),
                primitives: vec![quad(None, None)],
            })
            .collect(),
    )
}

pub fn wait<T>(outcome: Option<T>) -> T {
    outcome.expect("asset did not finish streaming in time")
}
