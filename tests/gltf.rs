use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use base64::engine::{general_purpose::STANDARD as BASE64, Engine as _};

use deimos::backend::headless::HeadlessDevice;
use deimos::loader::gpu::LightInstance;
use deimos::prelude::*;

mod framework;

use framework::{wait, TIMEOUT};

const DOCUMENT: &str = r#"{
    "asset": { "version": "2.0" },
    "extensionsUsed": ["KHR_lights_punctual"],
    "extensions": {
        "KHR_lights_punctual": {
            "lights": [{ "type": "point", "color": [1.0, 0.5, 0.0], "intensity": 3.0 }]
        }
    },
    "scene": 0,
    "scenes": [{ "nodes": [0] }],
    "nodes": [
        { "mesh": 0, "children": [1] },
        { "translation": [0.0, 2.0, 0.0], "extensions": { "KHR_lights_punctual": { "light": 0 } } }
    ],
    "meshes": [{
        "name": "triangle",
        "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1, "material": 0 }]
    }],
    "materials": [{
        "name": "red",
        "pbrMetallicRoughness": { "baseColorTexture": { "index": 0 }, "metallicFactor": 0.25 }
    }],
    "textures": [{ "source": 0 }],
    "images": [{ "uri": "IMAGE_URI" }],
    "buffers": [{ "byteLength": 42, "uri": "BUFFER_URI" }],
    "bufferViews": [
        { "buffer": 0, "byteOffset": 0, "byteLength": 36, "target": 34962 },
        { "buffer": 0, "byteOffset": 36, "byteLength": 6, "target": 34963 }
    ],
    "accessors": [
        {
            "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
            "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0]
        },
        { "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }
    ]
}"#;

const POSITIONS: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];

fn buffer_data() -> Vec<u8> {
    let mut data = bytemuck::cast_slice::<_, u8>(&POSITIONS[..]).to_vec();
    data.extend(bytemuck::cast_slice::<u16, u8>(&[0, 1, 2]));
    data
}

fn png() -> Result<Vec<u8>> {
    let image = image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 0, 255]));
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// A fresh directory for the files of one test.
fn scratch_dir(test: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("deimos-{test}-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write a document with everything embedded as data URIs.
fn write_embedded(dir: &Path) -> Result<PathBuf> {
    let document = DOCUMENT
        .replace("BUFFER_URI", &format!("data:application/octet-stream;base64,{}", BASE64.encode(buffer_data())))
        .replace("IMAGE_URI", &format!("data:image/png;base64,{}", BASE64.encode(png()?)));
    let path = dir.join("triangle.gltf");
    std::fs::write(&path, document)?;
    Ok(path)
}

#[test]
pub fn embedded_document_is_imported() -> Result<()> {
    framework::init_logging();
    let dir = scratch_dir("embedded")?;
    let path = write_embedded(&dir)?;
    let scene = GltfImporter::new().import(&path, &ImportOptions::default())?;
    std::fs::remove_dir_all(&dir)?;

    assert_eq!(scene.roots, [0]);
    assert_eq!(scene.meshes.len(), 1);
    let primitive = &scene.meshes[0].primitives[0];
    assert_eq!(primitive.positions, POSITIONS);
    assert_eq!(primitive.indices, Some(Indices::U16(vec![0, 1, 2])));
    assert_eq!(primitive.material, Some(0));

    let material = &scene.materials[0];
    assert_eq!(material.name, "red");
    assert_eq!(material.base_color_texture, Some(0));
    assert_eq!(material.metallic_factor, 0.25);
    assert!(matches!(scene.textures[0], TextureSource::Encoded(_)));

    assert_eq!(scene.lights.len(), 1);
    assert_eq!(scene.lights[0].kind, LightKind::Point);
    assert_eq!(scene.lights[0].intensity, 3.0);
    assert_eq!(scene.nodes[0].children, [1]);
    assert_eq!(scene.nodes[1].light, Some(0));
    Ok(())
}

#[test]
pub fn gltf_ignores_unit_scale() -> Result<()> {
    let dir = scratch_dir("scaled")?;
    let path = write_embedded(&dir)?;
    let scene = GltfImporter::new().import(&path, &ImportOptions { scale: 100.0 });
    std::fs::remove_dir_all(&dir)?;
    assert_eq!(scene?.meshes[0].primitives[0].positions, POSITIONS, "glTF positions are already in meters.");
    Ok(())
}

#[test]
pub fn external_files_are_resolved() -> Result<()> {
    framework::init_logging();
    let dir = scratch_dir("external")?;
    std::fs::write(dir.join("triangle.bin"), buffer_data())?;
    let document = DOCUMENT.replace("BUFFER_URI", "triangle.bin").replace("IMAGE_URI", "red.png");
    let path = dir.join("triangle.gltf");
    std::fs::write(&path, document)?;

    let scene = GltfImporter::new().import(&path, &ImportOptions::default());
    std::fs::remove_dir_all(&dir)?;
    let scene = scene?;
    assert_eq!(scene.meshes[0].primitives[0].positions, POSITIONS);
    assert_eq!(scene.textures[0], TextureSource::File(dir.join("red.png")), "Images are decoded later.");
    Ok(())
}

#[test]
pub fn missing_buffer_file_fails_import() -> Result<()> {
    let dir = scratch_dir("missing")?;
    let document = DOCUMENT.replace("BUFFER_URI", "nowhere.bin").replace("IMAGE_URI", "red.png");
    let path = dir.join("triangle.gltf");
    std::fs::write(&path, document)?;
    let result = GltfImporter::new().import(&path, &ImportOptions::default());
    std::fs::remove_dir_all(&dir)?;
    assert!(result.is_err());
    Ok(())
}

#[test]
pub fn loader_streams_gltf_file() -> Result<()> {
    let ctx = framework::make_context()?;
    let dir = scratch_dir("streamed")?;
    let path = write_embedded(&dir)?;
    let model = ctx.loader.load(&path);
    std::fs::remove_dir_all(&dir)?;
    let model = model?;

    wait(model.sync_timeout(TIMEOUT))?;
    assert_eq!(model.name(), path.display().to_string());
    assert_eq!(model.draw_count16(), 1);
    let light = model.buffers().light_instances.read_pod::<LightInstance>()[0];
    assert_eq!(light.position, [0.0, 2.0, 0.0, 1.0]);

    let texture = model.textures()[0].as_ref().unwrap();
    wait(texture.sync_timeout(TIMEOUT))?;
    assert_eq!(&texture.image().unwrap().mip(0)[..4], &[255, 0, 0, 255]);
    Ok(())
}

#[test]
pub fn unknown_extension_is_unsupported() -> Result<()> {
    let ctx = framework::make_context()?;
    let err = ctx.loader.load("scene.obj").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnsupportedFormat(ext)) if ext == "obj"));
    Ok(())
}

struct Quads;

impl SceneImporter for Quads {
    fn import(&self, _path: &Path, options: &ImportOptions) -> Result<Scene> {
        let mut scene = framework::quads(2);
        scene.nodes[1].transform = glam::Mat4::from_scale(glam::Vec3::splat(options.scale));
        Ok(scene)
    }
}

#[test]
pub fn custom_importer_is_used() -> Result<()> {
    framework::init_logging();
    let device = Arc::new(HeadlessDevice::new());
    let set = device.create_bindless_set(8);
    let bindless = Arc::new(BindlessTable::new(device.clone(), set, 8));
    let mut loader = Loader::new(device, bindless, LoaderBuilder::new().workers(1).build())?.with_importer("QUADS", Quads);
    loader.start()?;

    let model = loader.load_with_options("anything.quads", &ImportOptions { scale: 0.01 })?;
    wait(model.sync_timeout(TIMEOUT))?;
    assert_eq!(model.draw_count16(), 2);
    Ok(())
}
