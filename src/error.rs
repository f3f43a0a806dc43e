//! Exposes the deimos error types

use std::sync::PoisonError;

#[cfg(feature = "vulkan")]
use gpu_allocator::AllocationError;
use thiserror::Error;

/// Error type that deimos can return.
#[derive(Error, Debug)]
pub enum Error {
    /// The loader threads are not running. Call [`Loader::start()`](crate::Loader::start) first.
    #[error("Loader is not running. Call Loader::start() before loading assets.")]
    NotRunning,
    /// [`Loader::start()`](crate::Loader::start) was called on a running loader.
    #[error("Loader is already running.")]
    AlreadyRunning,
    /// A bounded queue is at capacity. The request was rejected and can be retried later.
    #[error("Pending {0} queue is at capacity.")]
    QueueFull(&'static str),
    /// Not enough free slots in the bindless texture table.
    #[error("Bindless table cannot fit {0} more textures.")]
    BindlessExhausted(u32),
    /// The scene failed validation during the parse stage.
    #[error("Invalid scene `{scene}`: {reason}")]
    InvalidScene {
        /// Name of the scene, usually its path.
        scene: String,
        /// What is wrong with it.
        reason: String,
    },
    /// No importer registered for a file extension.
    #[error("No scene importer registered for extension `{0}`")]
    UnsupportedFormat(String),
    /// A single staging region is larger than the staging buffer.
    #[error("Staging request of {requested} bytes exceeds staging capacity of {capacity} bytes")]
    StagingOverflow {
        /// Requested size in bytes.
        requested: u64,
        /// Capacity of the staging buffer.
        capacity: u64,
    },
    /// Generic Vulkan error type.
    #[error("Vulkan error: `{0}`")]
    VkError(ash::vk::Result),
    /// Vulkan allocation error.
    #[cfg(feature = "vulkan")]
    #[error("Vulkan allocation error: `{0}`")]
    AllocationError(AllocationError),
    /// Poisoned mutex
    #[error("Poisoned mutex")]
    PoisonError,
    /// A recorded command is not valid for the resource or queue it was submitted to.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    /// Uncategorized error.
    #[error("Uncategorized error: `{0}`")]
    Uncategorized(&'static str),
}

impl From<ash::vk::Result> for Error {
    fn from(value: ash::vk::Result) -> Self {
        Error::VkError(value)
    }
}

#[cfg(feature = "vulkan")]
impl From<AllocationError> for Error {
    fn from(value: AllocationError) -> Self {
        Error::AllocationError(value)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::PoisonError
    }
}

/// Outcome of a single streamed asset. Stored in the asset's status, so every waiter receives a copy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    /// The source data could not be read or decoded.
    #[error("Failed to decode asset: {0}")]
    Decode(String),
    /// Staging, recording or submission of the upload failed.
    #[error("Failed to upload asset: {0}")]
    Upload(String),
    /// The loader was stopped before the asset finished streaming.
    #[error("Loader stopped before the asset finished streaming")]
    Stopped,
}
