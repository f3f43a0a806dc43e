//! Caller-visible handle of a streamed texture.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ash::vk;

use crate::device::bindless::BindlessTable;
use crate::device::Device;
use crate::sync::latch::Latch;
use crate::AssetError;

/// How the texels of a standalone texture are interpreted.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    /// Colors, stored with sRGB encoding.
    #[default]
    Srgb,
    /// Linear data such as normal maps or roughness.
    Linear,
}

impl ColorSpace {
    pub fn format(&self) -> vk::Format {
        match self {
            ColorSpace::Srgb => vk::Format::R8G8B8A8_SRGB,
            ColorSpace::Linear => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

/// A texture that owns one slot in the bindless texture array.
///
/// The slot is reserved and pointed at a placeholder image before the texture is handed out. Once the upload
/// finished, the slot is switched to the real image and the texture becomes ready. If the upload fails, the
/// placeholder stays. The slot is released when the last handle is dropped.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Texture<D: Device> {
    name: String,
    slot: u32,
    format: vk::Format,
    #[derivative(Debug = "ignore")]
    image: OnceLock<D::Image>,
    status: Latch,
    #[derivative(Debug = "ignore")]
    bindless: Arc<BindlessTable<D>>,
}

impl<D: Device> Texture<D> {
    pub(crate) fn new(name: String, slot: u32, format: vk::Format, bindless: Arc<BindlessTable<D>>) -> Self {
        Self {
            name,
            slot,
            format,
            image: OnceLock::new(),
            status: Latch::new(),
            bindless,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of this texture in the bindless texture array.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// The uploaded image. `None` until the texture is ready, and forever if its upload failed.
    pub fn image(&self) -> Option<&D::Image> {
        self.image.get()
    }

    /// Block until the upload of this texture finished or failed.
    pub fn sync(&self) -> Result<(), AssetError> {
        self.status.wait()
    }

    /// Same as [`Texture::sync()`], giving up after `timeout`. Returns `None` on timeout.
    pub fn sync_timeout(&self, timeout: Duration) -> Option<Result<(), AssetError>> {
        self.status.wait_timeout(timeout)
    }

    /// A future that resolves once the upload of this texture finished or failed.
    pub fn wait_async(&self) -> impl Future<Output = Result<(), AssetError>> + '_ {
        self.status.wait_async()
    }

    /// True once the image is uploaded and bound to its slot.
    pub fn is_ready(&self) -> bool {
        matches!(self.status.outcome(), Some(Ok(())))
    }

    /// The outcome of the upload, if it is over.
    pub fn outcome(&self) -> Option<Result<(), AssetError>> {
        self.status.outcome()
    }

    /// Store the finished image. Does nothing if an image was stored already.
    pub(crate) fn set_image(&self, image: D::Image) {
        if self.image.set(image).is_err() {
            warn!("Texture {} received a second image", self.name);
        }
    }

    pub(crate) fn complete(&self) {
        self.status.signal(Ok(()));
    }

    pub(crate) fn fail(&self, error: AssetError) {
        if self.status.signal(Err(error.clone())) {
            warn!("Texture {} failed: {error}", self.name);
        }
    }
}

impl<D: Device> Drop for Texture<D> {
    fn drop(&mut self) {
        self.bindless.release(self.slot);
    }
}
