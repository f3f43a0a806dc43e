//! The coordinator thread.
//!
//! The coordinator is the only thread that submits to the GPU, and the only writer of the task queue. Every pass
//! it:
//!
//! 1. Executes all batches the workers finished recording in a single primary command buffer on the transfer
//!    queue and waits for it.
//! 2. Moves uploaded textures to the graphics queue, finalizes them and points their bindless slots at them.
//! 3. Runs the completion handler of every executed task, newest first. Completed meshes enqueue the upload of
//!    their instances, everything else counts towards the completion of its model.
//! 4. Dispatches queued tasks to the workers and, once nothing is queued, accepts the next pending model or
//!    texture.
//!
//! Tasks that do not fit the worker rings stay in a backlog until workers make progress, so the coordinator
//! never blocks on a full ring.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;

use crate::device::{CommandLevel, CommandRecorder, Device, QueueType};
use crate::loader::model::Model;
use crate::loader::pipeline::Pipeline;
use crate::loader::task::{Completion, ModelUpload, PendingModel, PendingTexture, Task};
use crate::loader::texture::Texture;
use crate::scene::layout::{compute_offsets, IndexWidth};
use crate::sync::queue::SingleWriterManyReadersQueue;
use crate::sync::ring_buffer::QueueFull;
use crate::AssetError;

pub(crate) struct Coordinator<D: Device> {
    pipeline: Arc<Pipeline<D>>,
    tasks: SingleWriterManyReadersQueue<Task<D>>,
    workers: Vec<JoinHandle<()>>,
    transfer: D::CommandPool,
    graphics: D::CommandPool,
    backlog: VecDeque<Task<D>>,
    /// Accepted assets that did not complete yet.
    models: Vec<Arc<Model<D>>>,
    textures: Vec<Arc<Texture<D>>>,
    stopping: bool,
    /// Workers whose ring was full when the stop was broadcast.
    undelivered: Vec<usize>,
}

impl<D: Device> Coordinator<D> {
    /// Create the coordinator's command pools. Runs on the thread starting the loader.
    pub fn new(pipeline: Arc<Pipeline<D>>, tasks: SingleWriterManyReadersQueue<Task<D>>) -> Result<Self> {
        let device = &pipeline.shared.device;
        let transfer = device.create_command_pool(QueueType::Transfer)?;
        let graphics = device.create_command_pool(QueueType::Graphics)?;
        Ok(Self {
            pipeline,
            tasks,
            workers: Vec::new(),
            transfer,
            graphics,
            backlog: VecDeque::new(),
            models: Vec::new(),
            textures: Vec::new(),
            stopping: false,
            undelivered: Vec::new(),
        })
    }

    /// Take ownership of a worker thread, to be joined on shutdown.
    pub fn add_worker(&mut self, worker: JoinHandle<()>) {
        self.workers.push(worker);
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        Ok(std::thread::Builder::new()
            .name(String::from("deimos-coordinator"))
            .spawn(move || self.run())?)
    }

    fn run(mut self) {
        info!("Coordinator started with {} workers", self.tasks.readers());
        loop {
            self.pipeline.wake.wait_until(|| self.has_work());
            if !self.stopping && self.pipeline.stop_requested() {
                self.begin_stop();
            }
            self.execute_completed();
            if self.stopping {
                self.deliver_stops();
                if self.pipeline.live_workers() == 0 && self.pipeline.completed.is_empty() {
                    break;
                }
                continue;
            }
            self.dispatch_backlog();
            self.accept_pending();
            self.models.retain(|model| model.outcome().is_none());
            self.textures.retain(|texture| texture.outcome().is_none());
        }
        self.finish();
    }

    fn has_work(&self) -> bool {
        let pipeline = &self.pipeline;
        if !pipeline.completed.is_empty() {
            return true;
        }
        if self.stopping {
            return pipeline.live_workers() == 0 || self.undelivered.iter().any(|&reader| self.tasks.has_space_for(reader));
        }
        if pipeline.stop_requested() {
            return true;
        }
        if !self.backlog.is_empty() {
            return self.tasks.has_space();
        }
        !pipeline.shared.pending_models.is_empty() || !pipeline.shared.pending_textures.is_empty()
    }

    fn execute_completed(&mut self) {
        let batches = self.pipeline.completed.drain();
        if batches.is_empty() {
            return;
        }

        let workers = self.pipeline.links.len();
        let mut batches_of = vec![0usize; workers];
        let mut owners = Vec::new();
        let mut commands = Vec::new();
        let mut completions = Vec::new();
        for batch in batches {
            batches_of[batch.worker] += 1;
            for entry in batch.entries {
                owners.push(batch.worker);
                commands.push(entry.commands);
                completions.extend(entry.done);
            }
        }

        let shared = self.pipeline.shared.clone();
        debug!("Executing {} command buffers for {} tasks", commands.len(), completions.len());
        match shared.device.execute_secondaries(&mut self.transfer, &commands) {
            Ok(()) => self.complete(completions),
            Err(err) => {
                error!("Transfer submission failed: {err:#}");
                let error = AssetError::Upload(format!("{err:#}"));
                for completion in completions.iter().filter(|completion| !completion.failed) {
                    completion.task.fail(error.clone());
                }
            }
        }

        let mut retired = (0..workers).map(|_| Vec::new()).collect::<Vec<_>>();
        for (worker, commands) in owners.into_iter().zip(commands) {
            retired[worker].push(commands);
        }
        for ((link, retired), batches) in self.pipeline.links.iter().zip(retired).zip(batches_of) {
            if batches > 0 {
                link.batches_done(batches, retired);
            }
        }
    }

    fn complete(&mut self, completions: Vec<Completion<D>>) {
        let mut images = Vec::new();
        let mut tasks = Vec::new();
        for completion in completions.into_iter().filter(|completion| !completion.failed) {
            match (completion.image, completion.task.texture()) {
                (Some(image), Some(texture)) => images.push((texture, image)),
                _ => tasks.push(completion.task),
            }
        }
        self.finish_textures(images);
        for task in tasks.into_iter().rev() {
            self.handle(task);
        }
    }

    /// Record the graphics queue side of texture uploads: ownership acquire, mip generation and the transition
    /// for shader reads.
    fn finalize(&mut self, images: &[(Arc<Texture<D>>, D::Image)]) -> Result<()> {
        let shared = &self.pipeline.shared;
        let mut recorder = shared.device.begin_commands(&mut self.graphics, CommandLevel::Primary)?;
        for (_, image) in images {
            if shared.device.needs_ownership_transfer() {
                recorder.acquire_image(image);
            }
            recorder.finalize_image(image, shared.settings.generate_mipmaps);
        }
        shared.device.submit(&mut self.graphics, recorder.finish()?)
    }

    fn finish_textures(&mut self, images: Vec<(Arc<Texture<D>>, D::Image)>) {
        if images.is_empty() {
            return;
        }
        if let Err(err) = self.finalize(&images) {
            error!("Finalizing {} textures failed: {err:#}", images.len());
            let error = AssetError::Upload(format!("{err:#}"));
            for (texture, _) in images {
                texture.fail(error.clone());
            }
            return;
        }

        let textures = images
            .into_iter()
            .map(|(texture, image)| {
                texture.set_image(image);
                texture
            })
            .collect::<Vec<_>>();
        let writes = textures
            .iter()
            .filter_map(|texture| Some((texture.slot(), texture.image()?)))
            .collect::<Vec<_>>();
        match self.pipeline.shared.bindless.write(&writes) {
            Ok(()) => {
                debug!("Finalized {} textures", textures.len());
                textures.iter().for_each(|texture| texture.complete());
            }
            Err(err) => {
                error!("Binding {} textures failed: {err:#}", textures.len());
                let error = AssetError::Upload(format!("{err:#}"));
                textures.iter().for_each(|texture| texture.fail(error.clone()));
            }
        }
    }

    fn handle(&mut self, task: Task<D>) {
        trace!("Completed {task:?}");
        match task {
            Task::Mesh {
                upload,
                mesh,
            } => {
                if self.stopping {
                    upload.model.fail(AssetError::Stopped);
                } else {
                    self.backlog.push_back(Task::Instance {
                        upload,
                        mesh,
                    });
                }
            }
            Task::Instance {
                upload,
                mesh,
            } => {
                let offsets = &upload.offsets.meshes[mesh];
                upload
                    .model
                    .commit_draws(offsets.draws(IndexWidth::U16).len() as u64, offsets.draws(IndexWidth::U32).len() as u64);
                upload.model.part_done();
            }
            Task::Material {
                upload, ..
            }
            | Task::Light {
                upload, ..
            }
            | Task::LightInstance {
                upload, ..
            } => upload.model.part_done(),
            Task::ModelTexture {
                ..
            }
            | Task::Texture {
                ..
            }
            | Task::Stop => {}
        }
    }

    fn dispatch_backlog(&mut self) {
        let mut dispatched = 0;
        while let Some(task) = self.backlog.pop_front() {
            match self.tasks.push(task) {
                Ok(_) => dispatched += 1,
                Err(QueueFull(task)) => {
                    self.backlog.push_front(task);
                    break;
                }
            }
        }
        if dispatched > 0 {
            trace!("Dispatched {dispatched} tasks, {} waiting", self.backlog.len());
            self.pipeline.tasks_available.notify_all();
        }
    }

    /// Accept pending assets one at a time while every task of the previous one fit the worker rings.
    fn accept_pending(&mut self) {
        let pipeline = self.pipeline.clone();
        while self.backlog.is_empty() {
            if let Some(pending) = pipeline.shared.pending_models.pop() {
                self.accept_model(pending);
            } else if let Some(pending) = pipeline.shared.pending_textures.pop() {
                self.accept_texture(pending);
            } else {
                break;
            }
            self.dispatch_backlog();
        }
    }

    fn accept_model(&mut self, pending: PendingModel<D>) {
        let PendingModel {
            scene,
            layout,
            model,
        } = pending;
        let offsets = compute_offsets(&scene, &layout);
        let counts = *model.counts();
        info!(
            "Streaming model {}: {} meshes, {} materials, {} textures, {} lights",
            model.name(),
            counts.meshes,
            counts.materials,
            counts.textures,
            counts.light_instances
        );

        let upload = Arc::new(ModelUpload {
            scene,
            layout,
            offsets,
            model: model.clone(),
        });
        self.backlog.extend((0..counts.meshes as usize).map(|mesh| Task::Mesh {
            upload: upload.clone(),
            mesh,
        }));
        let textures = model.textures().iter().enumerate().filter(|(_, texture)| texture.is_some());
        self.backlog.extend(textures.map(|(texture, _)| Task::ModelTexture {
            upload: upload.clone(),
            texture,
        }));
        self.backlog.extend((0..counts.materials as usize).map(|material| Task::Material {
            upload: upload.clone(),
            material,
        }));
        self.backlog.extend((0..counts.lights as usize).map(|light| Task::Light {
            upload: upload.clone(),
            light,
        }));
        self.backlog.extend((0..counts.light_instances as usize).map(|instance| Task::LightInstance {
            upload: upload.clone(),
            instance,
        }));
        self.models.push(model);
    }

    fn accept_texture(&mut self, pending: PendingTexture<D>) {
        debug!("Streaming texture {}", pending.texture.name());
        self.textures.push(pending.texture.clone());
        self.backlog.push_back(Task::Texture {
            texture: pending.texture,
            source: pending.source,
        });
    }

    fn begin_stop(&mut self) {
        info!("Coordinator stopping, {} tasks not dispatched", self.backlog.len());
        self.stopping = true;
        for task in self.backlog.drain(..) {
            task.fail(AssetError::Stopped);
        }
        self.undelivered = self.tasks.broadcast(|| Task::Stop);
        self.pipeline.tasks_available.notify_all();
    }

    fn deliver_stops(&mut self) {
        if self.undelivered.is_empty() {
            return;
        }
        let tasks = &mut self.tasks;
        self.undelivered.retain(|&reader| tasks.push_to(reader, Task::Stop).is_err());
        self.pipeline.tasks_available.notify_all();
    }

    fn finish(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("A worker thread panicked");
            }
        }
        // Nothing executes anymore, so whatever did not complete by now never will.
        for model in self.models.drain(..) {
            model.fail(AssetError::Stopped);
        }
        for texture in self.textures.drain(..) {
            texture.fail(AssetError::Stopped);
        }
        self.pipeline.shared.fail_pending();
        info!("Coordinator stopped");
    }
}

impl<D: Device> Drop for Coordinator<D> {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        // Only reached if the coordinator thread never ran. No task was dispatched, so the rings have room.
        self.tasks.broadcast(|| Task::Stop);
        self.pipeline.tasks_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
