//! The transfer-learning engine core.
//!
//! Owns the trainable parameter generations, the sample collection and the
//! locking discipline that lets background ingestion, background training and
//! inference share them.

mod classes;
mod lifecycle;
mod resources;

pub use classes::{ClassTable, Prediction};

use std::{
    io::{Read, Write},
    mem,
    num::NonZeroUsize,
    ops::Range,
    sync::Arc,
    thread,
    time::Duration,
};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tokio::{
    runtime::{self, Runtime},
    task::{self, JoinHandle},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    EngineErr, Result,
    model::{ModelLoader, RawModel},
    stages::{BottleneckExtractor, HeadTrainer, InferenceHead, Initializer, OptimizerStage},
};

use self::{
    classes::ranked_predictions,
    lifecycle::{Lifecycle, LifecycleState},
    resources::{TrainingResources, TrainingSample, batch_ranges, zeroed_buffers},
};

/// Invoked synchronously on the training thread once per completed epoch,
/// with the epoch index and the mean loss over that epoch's batches.
pub type LossCallback = Arc<dyn Fn(usize, f32) + Send + Sync>;

/// How long `close` waits for background work to drain before giving up.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// An incremental-learning engine over one loaded transfer-learning model.
///
/// Samples are ingested and the head is trained on a private worker pool
/// while inference keeps running against the currently visible parameter
/// generation. All tensor math is delegated to the model handles; the engine
/// contributes buffer ownership and the lock discipline.
pub struct TransferLearningEngine<H: RawModel> {
    inner: Arc<EngineInner<H>>,
    rt: runtime::Handle,
    runtime: Mutex<Option<Runtime>>,
}

/// The stage adapters retained for the engine's lifetime.
///
/// The initializer is not kept: it runs once during construction and its
/// handle is released immediately afterwards.
struct Stages<H: RawModel> {
    extractor: BottleneckExtractor<H>,
    trainer: HeadTrainer<H>,
    inference: InferenceHead<H>,
    optimizer: OptimizerStage<H>,
}

struct EngineInner<H: RawModel> {
    classes: ClassTable,
    /// `None` once `close` has released the adapters.
    stages: RwLock<Option<Arc<Stages<H>>>>,
    batch_size: usize,
    feature_len: usize,
    /// The externally visible parameter generation. Many readers (inference,
    /// save) or one writer (the per-batch swap, load).
    params: RwLock<Vec<Box<[f32]>>>,
    /// The training lock: sample collection plus every training-owned buffer.
    training: Mutex<TrainingResources>,
    /// Taken by every predict and by `close`, so shutdown can prove no
    /// inference is in flight. Serializes predicts against each other.
    inference: Mutex<()>,
    state: LifecycleState,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl<H: RawModel> TransferLearningEngine<H> {
    /// Loads the five stages, validates every shape relationship between
    /// them, allocates all buffers and runs the initializer.
    ///
    /// # Arguments
    /// * `loader` - Source of the five graph artifacts.
    /// * `class_names` - The fixed class set, in index order.
    ///
    /// # Errors
    /// Any loader failure, duplicate class names, or a shape disagreement
    /// between the stages surfaces here as a configuration error.
    pub fn new<L, I, S>(loader: &L, class_names: I) -> Result<Self>
    where
        L: ModelLoader<Handle = H>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let classes = ClassTable::new(class_names)?;

        let initializer = Initializer::new(loader.load_initializer()?);
        let extractor = BottleneckExtractor::new(loader.load_base()?)?;
        let trainer = HeadTrainer::new(loader.load_trainer()?)?;
        let inference = InferenceHead::new(loader.load_inference()?, trainer.param_sizes())?;
        let optimizer = OptimizerStage::new(loader.load_optimizer()?, trainer.param_sizes())?;

        ensure(
            "initializer parameter tensors",
            initializer.output_sizes().len(),
            trainer.param_sizes().len(),
        )?;
        for (&got, &expected) in initializer.output_sizes().iter().zip(trainer.param_sizes()) {
            ensure("initializer parameter tensor", got, expected)?;
        }
        ensure(
            "feature-extractor bottleneck width",
            extractor.bottleneck_len(),
            trainer.feature_len(),
        )?;
        ensure(
            "inference-head bottleneck width",
            inference.bottleneck_len(),
            trainer.feature_len(),
        )?;
        ensure("head-trainer class count", trainer.class_count(), classes.len())?;
        ensure(
            "inference-head class count",
            inference.class_count(),
            classes.len(),
        )?;

        let mut current = zeroed_buffers(trainer.param_sizes());
        initializer.initialize(&mut current)?;

        let resources = TrainingResources::new(
            trainer.param_sizes(),
            optimizer.state_sizes(),
            trainer.batch_size(),
            trainer.feature_len(),
            classes.len(),
            StdRng::from_os_rng(),
        );

        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .saturating_sub(1)
            .max(1);
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("transfer-learning-worker")
            .enable_time()
            .build()?;

        let batch_size = trainer.batch_size();
        let feature_len = trainer.feature_len();
        let stages = Stages {
            extractor,
            trainer,
            inference,
            optimizer,
        };

        debug!(workers = workers, batch_size = batch_size; "engine constructed");

        Ok(Self {
            rt: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            inner: Arc::new(EngineInner {
                classes,
                stages: RwLock::new(Some(Arc::new(stages))),
                batch_size,
                feature_len,
                params: RwLock::new(current),
                training: Mutex::new(resources),
                inference: Mutex::new(()),
                state: LifecycleState::new(),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// The configured class names, in index order.
    pub fn classes(&self) -> &[String] {
        self.inner.classes.names()
    }

    /// The fixed number of samples per training batch.
    pub fn train_batch_size(&self) -> usize {
        self.inner.batch_size
    }

    /// The element count of one bottleneck vector.
    pub fn bottleneck_len(&self) -> usize {
        self.inner.feature_len
    }

    /// The number of samples currently stored.
    pub fn sample_count(&self) -> usize {
        self.inner.training.lock().samples.len()
    }

    /// Schedules one labeled sample for ingestion.
    ///
    /// The image is copied before this returns; feature extraction and the
    /// append run on the worker pool. The returned handle resolves once the
    /// sample has been appended under the training lock. If the engine starts
    /// closing first, the task drops the sample and resolves `Ok(())`;
    /// cancellation is not an error.
    ///
    /// # Errors
    /// Fails fast on a closed engine, an unknown label or a wrong-sized
    /// image, without scheduling any background work.
    pub fn add_sample(&self, image: &[f32], label: &str) -> Result<JoinHandle<Result<()>>> {
        self.ensure_active()?;
        let class = self
            .inner
            .classes
            .index_of(label)
            .ok_or_else(|| EngineErr::UnknownClass {
                label: label.to_owned(),
            })?;
        let image_len = self.inner.feature_input_len()?;
        if image.len() != image_len {
            return Err(EngineErr::ShapeMismatch {
                what: "image buffer",
                got: image.len(),
                expected: image_len,
            });
        }

        let image: Box<[f32]> = image.into();
        let inner = Arc::clone(&self.inner);
        let task = self.inner.tracker.track_future(async move {
            inner.ingest(image, class)
        });

        Ok(self.rt.spawn(task))
    }

    /// Schedules `epochs` epochs of training over the stored samples.
    ///
    /// The training lock is held for the whole run, so appends wait and a
    /// second trainer cannot start until this one finishes. Each epoch
    /// shuffles the collection, walks it in fixed-size batches (the last
    /// batch is the trailing window when the count is not a multiple of the
    /// batch size) and reports the mean loss through `on_epoch`.
    ///
    /// # Errors
    /// Fails fast on a closed engine or when fewer samples than one batch are
    /// stored, without scheduling any background work.
    pub fn train(
        &self,
        epochs: NonZeroUsize,
        on_epoch: Option<LossCallback>,
    ) -> Result<JoinHandle<Result<()>>> {
        self.ensure_active()?;

        let stored = self.inner.training.lock().samples.len();
        if stored < self.inner.batch_size {
            return Err(EngineErr::InsufficientData {
                got: stored,
                expected: self.inner.batch_size,
            });
        }

        let inner = Arc::clone(&self.inner);
        let task = self.inner.tracker.track_future(async move {
            task::block_in_place(|| inner.run_training(epochs.get(), on_epoch))
        });

        Ok(self.rt.spawn(task))
    }

    /// Classifies one image against the current parameter generation.
    ///
    /// Runs on the caller's thread. Only one inference is in flight at a
    /// time.
    ///
    /// # Returns
    /// `Ok(None)` when the engine is closing or closed; racing shutdown is an
    /// expected, non-exceptional event. Otherwise one prediction per class,
    /// sorted by confidence descending with ties in class-index order.
    pub fn predict(&self, image: &[f32]) -> Result<Option<Vec<Prediction>>> {
        if self.inner.state.snapshot() != Lifecycle::Active {
            return Ok(None);
        }

        let _in_flight = self.inner.inference.lock();
        if self.inner.state.snapshot() != Lifecycle::Active {
            return Ok(None);
        }
        let Some(stages) = self.inner.stages.read().clone() else {
            return Ok(None);
        };

        let bottleneck = stages.extractor.extract(image)?;
        let confidences = {
            let params = self.inner.params.read();
            stages.inference.classify(&bottleneck, &params)?
        };

        Ok(Some(ranked_predictions(&self.inner.classes, &confidences)))
    }

    /// Serializes every parameter buffer, in declared order, as raw
    /// native-endian `f32`s with no framing.
    ///
    /// A snapshot is only meaningful for the exact model and class
    /// configuration that produced it.
    pub fn save_parameters<W: Write>(&self, sink: &mut W) -> Result<()> {
        self.ensure_active()?;

        let params = self.inner.params.read();
        for param in params.iter() {
            sink.write_all(bytemuck::cast_slice(param))?;
        }

        Ok(())
    }

    /// Overwrites every parameter buffer, in declared order, from a snapshot
    /// produced by [`save_parameters`](Self::save_parameters).
    ///
    /// Optimizer state and gradient scratch are left untouched.
    ///
    /// # Errors
    /// An I/O error if the source runs short of the declared sizes; the
    /// visible parameters are untouched in that case.
    pub fn load_parameters<R: Read>(&self, source: &mut R) -> Result<()> {
        self.ensure_active()?;

        // Staged into scratch first, so a short source cannot leave a
        // half-overwritten generation visible.
        let sizes: Vec<usize> = self.inner.params.read().iter().map(|p| p.len()).collect();
        let mut incoming = zeroed_buffers(&sizes);
        for buffer in incoming.iter_mut() {
            source.read_exact(bytemuck::cast_slice_mut(buffer))?;
        }

        let mut params = self.inner.params.write();
        mem::swap(&mut *params, &mut incoming);

        Ok(())
    }

    /// Shuts the engine down.
    ///
    /// Marks the engine terminal immediately, cancels pending background
    /// work, waits up to five seconds for in-flight work to drain, waits out
    /// any in-flight inference and releases the stage adapters.
    ///
    /// Must not be called from inside an async runtime; it blocks on the
    /// drain.
    ///
    /// # Errors
    /// `EngineErr::Closed` if the engine was already closed, or
    /// `EngineErr::ShutdownTimeout` if background work failed to drain — a
    /// fatal environment condition, not a recoverable one.
    pub fn close(&self) -> Result<()> {
        if !self.inner.state.begin_close() {
            return Err(EngineErr::Closed);
        }

        debug!("engine closing");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        let mut drained = Ok(());
        if let Some(runtime) = self.runtime.lock().take() {
            let wait = runtime
                .block_on(async { tokio::time::timeout(SHUTDOWN_TIMEOUT, self.inner.tracker.wait()).await });
            runtime.shutdown_background();

            if wait.is_err() {
                warn!("background tasks did not drain before the shutdown timeout");
                drained = Err(EngineErr::ShutdownTimeout);
            }
        }

        // No inference may be in flight when the handles are released.
        let _in_flight = self.inner.inference.lock();
        *self.inner.stages.write() = None;
        self.inner.state.finish_close();

        drained
    }

    fn ensure_active(&self) -> Result<()> {
        match self.inner.state.snapshot() {
            Lifecycle::Active => Ok(()),
            _ => Err(EngineErr::Closed),
        }
    }
}

impl<H: RawModel> EngineInner<H> {
    /// The adapters, while they are still loaded.
    fn stages(&self) -> Option<Arc<Stages<H>>> {
        self.stages.read().clone()
    }

    fn feature_input_len(&self) -> Result<usize> {
        self.stages()
            .map(|s| s.extractor.image_len())
            .ok_or(EngineErr::Closed)
    }

    /// The background half of `add_sample`: extract, then append under the
    /// training lock. Checked against the shutdown token both before the
    /// extraction and before the append, so a closing engine never gains a
    /// partial sample.
    fn ingest(&self, image: Box<[f32]>, class: usize) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        let Some(stages) = self.stages() else {
            return Ok(());
        };

        // Both the extraction and the wait on the training lock can block
        // past a whole train run; the runtime must know this thread is
        // blocked for the duration.
        task::block_in_place(|| {
            let bottleneck = stages.extractor.extract(&image)?;

            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let mut training = self.training.lock();
            training.samples.push(TrainingSample { bottleneck, class });
            debug!(samples = training.samples.len(); "sample appended");

            Ok(())
        })
    }

    /// The background half of `train`. Holds the training lock for the whole
    /// run; interruption between batches exits the epoch loop cleanly.
    fn run_training(&self, epochs: usize, on_epoch: Option<LossCallback>) -> Result<()> {
        let Some(stages) = self.stages() else {
            return Err(EngineErr::Closed);
        };

        let mut training = self.training.lock();
        let training = &mut *training;

        'epochs: for epoch in 0..epochs {
            training.samples.shuffle(&mut training.rng);

            let mut total_loss = 0.0;
            let mut batches = 0usize;
            for range in batch_ranges(training.samples.len(), self.batch_size) {
                if self.shutdown.is_cancelled() {
                    debug!(epoch = epoch; "training interrupted at batch boundary");
                    break 'epochs;
                }

                total_loss += self.train_batch(&stages, training, range)?;
                batches += 1;
            }

            let mean_loss = total_loss / batches as f32;
            debug!(epoch = epoch, mean_loss = mean_loss; "epoch finished");
            if let Some(on_epoch) = &on_epoch {
                on_epoch(epoch, mean_loss);
            }
        }

        Ok(())
    }

    /// One batch: gradient computation against the current generation,
    /// optimizer step into the staging generation, then the O(1) ownership
    /// swap that publishes it.
    fn train_batch(
        &self,
        stages: &Stages<H>,
        training: &mut TrainingResources,
        range: Range<usize>,
    ) -> Result<f32> {
        let feature_len = self.feature_len;
        let class_count = self.classes.len();

        let TrainingResources {
            samples,
            gradients,
            staging_params,
            opt_state,
            staging_state,
            batch_features,
            batch_labels,
            ..
        } = training;

        for (row, sample) in samples[range].iter().enumerate() {
            batch_features[row * feature_len..][..feature_len].copy_from_slice(&sample.bottleneck);

            let one_hot = &mut batch_labels[row * class_count..][..class_count];
            one_hot.fill(0.0);
            one_hot[sample.class] = 1.0;
        }

        let loss = {
            let params = self.params.read();
            let loss =
                stages
                    .trainer
                    .compute_gradients(batch_features, batch_labels, &params, gradients)?;
            stages
                .optimizer
                .step(&params, gradients, opt_state, staging_params, staging_state)?;
            loss
        };

        {
            let mut params = self.params.write();
            mem::swap(&mut *params, staging_params);
        }
        // Optimizer state is owned by the training path; no lock needed.
        mem::swap(opt_state, staging_state);

        Ok(loss)
    }
}

fn ensure(what: &'static str, got: usize, expected: usize) -> Result<()> {
    if got == expected {
        Ok(())
    } else {
        Err(EngineErr::ShapeMismatch {
            what,
            got,
            expected,
        })
    }
}
