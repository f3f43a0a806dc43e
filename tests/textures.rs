use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use deimos::prelude::*;

mod framework;

use framework::{quads, solid_texture, wait, TIMEOUT};

fn encode_png(width: u32, height: u32, color: [u8; 4]) -> Result<Vec<u8>> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba(color));
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

#[test]
pub fn encoded_texture_is_decoded_and_bound() -> Result<()> {
    let ctx = framework::make_context()?;
    let png = encode_png(3, 2, [10, 20, 30, 255])?;
    let texture = ctx
        .loader
        .load_texture_source("png", TextureSource::Encoded(png.into()), ColorSpace::Linear)?;
    wait(texture.sync_timeout(TIMEOUT))?;

    let image = texture.image().unwrap();
    assert_eq!((image.width(), image.height()), (3, 2));
    assert_eq!(image.format(), vk::Format::R8G8B8A8_UNORM);
    assert_eq!(&image.mip(0)[..4], &[10, 20, 30, 255]);
    let bound = ctx.bindless.descriptor_set().image_at(texture.slot()).unwrap();
    assert_eq!(bound.id(), image.id());
    Ok(())
}

#[test]
pub fn texture_file_is_loaded() -> Result<()> {
    let ctx = framework::make_context()?;
    let path = std::env::temp_dir().join(format!("deimos-texture-{}.png", std::process::id()));
    std::fs::write(&path, encode_png(4, 4, [255, 0, 0, 255])?)?;
    let texture = ctx.loader.load_texture(&path, ColorSpace::Srgb)?;
    let outcome = wait(texture.sync_timeout(TIMEOUT));
    std::fs::remove_file(&path)?;
    outcome?;
    assert_eq!(texture.format(), vk::Format::R8G8B8A8_SRGB);
    Ok(())
}

#[test]
pub fn broken_texture_keeps_placeholder() -> Result<()> {
    let ctx = framework::make_context()?;
    let broken = ctx.loader.load_texture_source(
        "broken",
        TextureSource::Encoded(Arc::from(&b"definitely not a png"[..])),
        ColorSpace::Srgb,
    )?;
    let fine = (0..4)
        .map(|i| ctx.loader.load_texture_source(format!("fine {i}"), solid_texture(2, 2, [i; 4]), ColorSpace::Srgb))
        .collect::<Result<Vec<_>>>()?;

    let outcome = wait(broken.sync_timeout(TIMEOUT));
    assert!(matches!(outcome, Err(AssetError::Decode(_))), "Broken image should fail to decode, got {outcome:?}.");
    assert!(broken.image().is_none());
    for texture in &fine {
        wait(texture.sync_timeout(TIMEOUT))?;
    }

    let set = ctx.bindless.descriptor_set();
    let placeholder = set.image_at(ctx.loader.white_slot()).unwrap();
    assert_eq!(
        set.image_at(broken.slot()).unwrap().id(),
        placeholder.id(),
        "Failed texture should stay bound to the placeholder."
    );
    Ok(())
}

#[test]
pub fn oversized_texture_fails_upload() -> Result<()> {
    let ctx = framework::make_context()?;
    let texture = ctx.loader.load_texture_source("huge", solid_texture(256, 256, [0; 4]), ColorSpace::Srgb)?;
    let outcome = wait(texture.sync_timeout(TIMEOUT));
    assert!(matches!(outcome, Err(AssetError::Upload(_))), "Texture larger than staging should fail, got {outcome:?}.");
    Ok(())
}

#[test]
pub fn broken_model_texture_does_not_fail_model() -> Result<()> {
    let ctx = framework::make_context()?;
    let mut scene = quads(2);
    scene.textures = vec![TextureSource::Encoded(Arc::from(&[0u8, 1, 2, 3][..])), solid_texture(2, 2, [7; 4])];
    scene.materials = vec![Material {
        base_color_texture: Some(0),
        emissive_texture: Some(1),
        ..Default::default()
    }];
    for mesh in &mut scene.meshes {
        mesh.primitives[0].material = Some(0);
    }

    let model = ctx.loader.load_scene("broken", scene)?;
    wait(model.sync_timeout(TIMEOUT))?;
    let textures = model.textures();
    let broken = textures[0].as_ref().unwrap();
    let fine = textures[1].as_ref().unwrap();
    assert!(matches!(wait(broken.sync_timeout(TIMEOUT)), Err(AssetError::Decode(_))));
    wait(fine.sync_timeout(TIMEOUT))?;
    Ok(())
}

#[test]
pub fn dropped_texture_releases_its_slot() -> Result<()> {
    let ctx = framework::make_context()?;
    let before = ctx.bindless.available();
    let texture = ctx.loader.load_texture_source("short lived", solid_texture(2, 2, [1; 4]), ColorSpace::Srgb)?;
    wait(texture.sync_timeout(TIMEOUT))?;
    assert_eq!(ctx.bindless.available(), before - 1);
    drop(texture);
    // The coordinator drops its own reference right after signaling.
    let deadline = Instant::now() + TIMEOUT;
    while ctx.bindless.available() != before && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(ctx.bindless.available(), before);
    Ok(())
}
