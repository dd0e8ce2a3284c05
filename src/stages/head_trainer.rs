use parking_lot::Mutex;

use crate::{EngineErr, Result, model::RawModel};

/// Input tensors that are always present: the bottleneck batch and the
/// one-hot label batch. Everything after them is a trainable parameter.
const FIXED_INPUTS: usize = 2;

/// Adapter over the gradient-computation ("head training") graph.
///
/// The graph maps `(bottleneck batch, one-hot batch, params...)` to
/// `(loss, gradients...)`. Batch size, feature width, class count and the
/// parameter shapes are all derived from the graph's tensor metadata here and
/// treated as the single source of truth by the engine.
pub struct HeadTrainer<H: RawModel> {
    handle: Mutex<H>,
    batch_size: usize,
    feature_len: usize,
    class_count: usize,
    param_sizes: Vec<usize>,
}

impl<H: RawModel> HeadTrainer<H> {
    /// Wraps a loaded head-training handle and derives its geometry.
    ///
    /// # Errors
    /// Returns a shape mismatch if the graph does not have the
    /// two-fixed-inputs layout, if the two batch inputs disagree on batch
    /// size, or if the gradient outputs do not mirror the parameter inputs.
    pub fn new(handle: H) -> Result<Self> {
        if handle.input_count() < FIXED_INPUTS + 1 {
            return Err(EngineErr::ShapeMismatch {
                what: "head-trainer input tensors",
                got: handle.input_count(),
                expected: FIXED_INPUTS + 1,
            });
        }

        let features = handle.input_shape(0);
        let labels = handle.input_shape(1);
        let (&batch_size, rest) = features.split_first().ok_or(EngineErr::ShapeMismatch {
            what: "head-trainer feature rank",
            got: 0,
            expected: 2,
        })?;
        let feature_len = rest.iter().product();

        let (&label_batch, label_rest) = labels.split_first().ok_or(EngineErr::ShapeMismatch {
            what: "head-trainer label rank",
            got: 0,
            expected: 2,
        })?;
        if label_batch != batch_size {
            return Err(EngineErr::ShapeMismatch {
                what: "head-trainer label batch",
                got: label_batch,
                expected: batch_size,
            });
        }
        let class_count = label_rest.iter().product();

        let param_sizes: Vec<usize> = (FIXED_INPUTS..handle.input_count())
            .map(|i| handle.input_len(i))
            .collect();

        // Outputs: one scalar loss, then one gradient per parameter.
        if handle.output_count() != 1 + param_sizes.len() {
            return Err(EngineErr::ShapeMismatch {
                what: "head-trainer output tensors",
                got: handle.output_count(),
                expected: 1 + param_sizes.len(),
            });
        }
        if handle.output_len(0) != 1 {
            return Err(EngineErr::ShapeMismatch {
                what: "head-trainer loss tensor",
                got: handle.output_len(0),
                expected: 1,
            });
        }
        for (i, &size) in param_sizes.iter().enumerate() {
            if handle.output_len(1 + i) != size {
                return Err(EngineErr::ShapeMismatch {
                    what: "head-trainer gradient tensor",
                    got: handle.output_len(1 + i),
                    expected: size,
                });
            }
        }

        Ok(Self {
            handle: Mutex::new(handle),
            batch_size,
            feature_len,
            class_count,
            param_sizes,
        })
    }

    /// The fixed number of samples per training batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The element count of one bottleneck vector.
    pub fn feature_len(&self) -> usize {
        self.feature_len
    }

    /// The number of classes the head distinguishes.
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// The element counts of the trainable parameter tensors, in declared order.
    pub fn param_sizes(&self) -> &[usize] {
        &self.param_sizes
    }

    /// Runs one gradient computation over a full batch.
    ///
    /// # Arguments
    /// * `features` - Stacked bottlenecks, `batch_size * feature_len` elements.
    /// * `labels` - Stacked one-hot rows, `batch_size * class_count` elements.
    /// * `params` - The current parameter generation, read only.
    /// * `gradients` - Scratch buffers overwritten with the batch gradients.
    ///
    /// # Returns
    /// The batch loss.
    pub fn compute_gradients(
        &self,
        features: &[f32],
        labels: &[f32],
        params: &[Box<[f32]>],
        gradients: &mut [Box<[f32]>],
    ) -> Result<f32> {
        if features.len() != self.batch_size * self.feature_len {
            return Err(EngineErr::ShapeMismatch {
                what: "bottleneck batch",
                got: features.len(),
                expected: self.batch_size * self.feature_len,
            });
        }
        if labels.len() != self.batch_size * self.class_count {
            return Err(EngineErr::ShapeMismatch {
                what: "one-hot batch",
                got: labels.len(),
                expected: self.batch_size * self.class_count,
            });
        }
        if params.len() != self.param_sizes.len() {
            return Err(EngineErr::ShapeMismatch {
                what: "parameter tensors",
                got: params.len(),
                expected: self.param_sizes.len(),
            });
        }
        if gradients.len() != self.param_sizes.len() {
            return Err(EngineErr::ShapeMismatch {
                what: "gradient tensors",
                got: gradients.len(),
                expected: self.param_sizes.len(),
            });
        }

        let mut inputs: Vec<&[f32]> = Vec::with_capacity(FIXED_INPUTS + params.len());
        inputs.push(features);
        inputs.push(labels);
        inputs.extend(params.iter().map(|p| &**p));

        let mut loss = [0.0f32];
        let mut outputs: Vec<&mut [f32]> = Vec::with_capacity(1 + gradients.len());
        outputs.push(&mut loss);
        outputs.extend(gradients.iter_mut().map(|g| &mut **g));

        self.handle.lock().run(&inputs, &mut outputs)?;

        Ok(loss[0])
    }
}
