//! Exposes the settings used to create a [`Loader`](crate::Loader).

/// Settings of a [`Loader`](crate::Loader). Create these through [`LoaderBuilder`]. Settings built by hand are
/// passed through [`LoaderSettings::normalized()`] by the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderSettings {
    /// Number of worker threads recording upload commands, in addition to the coordinator thread.
    pub workers: usize,
    /// Size of the staging buffer owned by each worker, in bytes. Every mip 0 of a texture must fit in it.
    pub staging_size: u64,
    /// How many models can wait for the coordinator before [`Loader::load()`](crate::Loader::load) starts
    /// rejecting requests.
    pub pending_model_capacity: usize,
    /// Same as `pending_model_capacity`, for [`Loader::load_texture()`](crate::Loader::load_texture).
    pub pending_texture_capacity: usize,
    /// Capacity of the task queue of each worker.
    pub task_queue_capacity: usize,
    /// Number of recorded command buffers a worker collects before handing them to the coordinator.
    /// Can be changed on a running loader with
    /// [`Loader::set_command_buffer_batch_size()`](crate::Loader::set_command_buffer_batch_size).
    pub command_buffer_batch_size: usize,
    /// Maximum number of batches a single worker may have waiting for execution.
    pub max_batches_in_flight: usize,
    /// Generate the mip chain of every texture on the graphics queue after uploading level 0.
    pub generate_mipmaps: bool,
}

fn default_workers() -> usize {
    let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    parallelism.saturating_sub(1).clamp(1, 8)
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            staging_size: 32 * 1024 * 1024,
            pending_model_capacity: 16,
            pending_texture_capacity: 64,
            task_queue_capacity: 256,
            command_buffer_batch_size: 8,
            max_batches_in_flight: 4,
            generate_mipmaps: true,
        }
    }
}

impl LoaderSettings {
    /// Raise every count and capacity that is zero to one. Zero sized queues and pools cannot make progress.
    pub fn normalized(mut self) -> Self {
        self.workers = self.workers.max(1);
        self.staging_size = self.staging_size.max(1);
        self.pending_model_capacity = self.pending_model_capacity.max(1);
        self.pending_texture_capacity = self.pending_texture_capacity.max(1);
        self.task_queue_capacity = self.task_queue_capacity.max(1);
        self.command_buffer_batch_size = self.command_buffer_batch_size.max(1);
        self.max_batches_in_flight = self.max_batches_in_flight.max(1);
        self
    }
}

/// Convenience builder for [`LoaderSettings`]. Values that are zero are raised to one when built.
///
/// # Example
/// ```
/// # use deimos::prelude::*;
/// let settings = LoaderBuilder::new()
///     .workers(2)
///     .staging_size(4 * 1024 * 1024)
///     .command_buffer_batch_size(4)
///     .generate_mipmaps(false)
///     .build();
/// assert_eq!(settings.workers, 2);
/// ```
#[derive(Debug, Default, Clone)]
pub struct LoaderBuilder {
    inner: LoaderSettings,
}

impl LoaderBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads.
    pub fn workers(mut self, workers: usize) -> Self {
        self.inner.workers = workers;
        self
    }

    /// Sets the size of each worker's staging buffer in bytes.
    pub fn staging_size(mut self, size: u64) -> Self {
        self.inner.staging_size = size;
        self
    }

    pub fn pending_model_capacity(mut self, capacity: usize) -> Self {
        self.inner.pending_model_capacity = capacity;
        self
    }

    pub fn pending_texture_capacity(mut self, capacity: usize) -> Self {
        self.inner.pending_texture_capacity = capacity;
        self
    }

    pub fn task_queue_capacity(mut self, capacity: usize) -> Self {
        self.inner.task_queue_capacity = capacity;
        self
    }

    pub fn command_buffer_batch_size(mut self, size: usize) -> Self {
        self.inner.command_buffer_batch_size = size;
        self
    }

    pub fn max_batches_in_flight(mut self, count: usize) -> Self {
        self.inner.max_batches_in_flight = count;
        self
    }

    /// Enable or disable mipmap generation for uploaded textures.
    pub fn generate_mipmaps(mut self, enabled: bool) -> Self {
        self.inner.generate_mipmaps = enabled;
        self
    }

    /// Build the settings.
    pub fn build(self) -> LoaderSettings {
        self.inner.normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_raises_zero_values() {
        let settings = LoaderBuilder::new().workers(0).command_buffer_batch_size(0).build();
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.command_buffer_batch_size, 1);
    }

    #[test]
    fn normalized_leaves_valid_values_alone() {
        let settings = LoaderSettings::default();
        assert_eq!(settings.clone().normalized(), settings);
        let zeroed = LoaderSettings {
            task_queue_capacity: 0,
            max_batches_in_flight: 0,
            ..settings
        }
        .normalized();
        assert_eq!((zeroed.task_queue_capacity, zeroed.max_batches_in_flight), (1, 1));
    }

    #[test]
    fn default_worker_count_is_bounded() {
        let workers = LoaderSettings::default().workers;
        assert!((1..=8).contains(&workers));
    }
}
