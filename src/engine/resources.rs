use std::ops::Range;

use rand::rngs::StdRng;

/// One stored training sample: an owned bottleneck plus its class index.
///
/// Produced once by the background ingestion task and never mutated.
pub(crate) struct TrainingSample {
    pub bottleneck: Box<[f32]>,
    pub class: usize,
}

/// Everything guarded by the training lock.
///
/// The sample collection plus every scratch buffer the training path owns
/// exclusively: the gradient set, the staging generation of the parameters,
/// both generations of the optimizer state and the fixed-size batch buffers.
/// Scratch buffers are reused across batches and epochs; nothing here is
/// zeroed between steps.
pub(crate) struct TrainingResources {
    pub samples: Vec<TrainingSample>,
    pub gradients: Vec<Box<[f32]>>,
    /// The parameter generation currently playing the "staging" role. Swapped
    /// with the visible generation at the end of each batch.
    pub staging_params: Vec<Box<[f32]>>,
    pub opt_state: Vec<Box<[f32]>>,
    pub staging_state: Vec<Box<[f32]>>,
    pub batch_features: Box<[f32]>,
    pub batch_labels: Box<[f32]>,
    pub rng: StdRng,
}

impl TrainingResources {
    pub fn new(
        param_sizes: &[usize],
        state_sizes: &[usize],
        batch_size: usize,
        feature_len: usize,
        class_count: usize,
        rng: StdRng,
    ) -> Self {
        Self {
            samples: Vec::new(),
            gradients: zeroed_buffers(param_sizes),
            staging_params: zeroed_buffers(param_sizes),
            opt_state: zeroed_buffers(state_sizes),
            staging_state: zeroed_buffers(state_sizes),
            batch_features: vec![0.0; batch_size * feature_len].into_boxed_slice(),
            batch_labels: vec![0.0; batch_size * class_count].into_boxed_slice(),
            rng,
        }
    }
}

/// Allocates one zero-filled buffer per declared size.
pub(crate) fn zeroed_buffers(sizes: &[usize]) -> Vec<Box<[f32]>> {
    sizes
        .iter()
        .map(|&n| vec![0.0; n].into_boxed_slice())
        .collect()
}

/// Partitions `len` shuffled samples into full batches of `batch` elements.
///
/// Consecutive windows, except that when `len` is not a multiple of `batch`
/// the final window is the trailing `batch` samples of the collection, so it
/// re-includes samples from the second-to-last window instead of coming up
/// short. Callers must guarantee `len >= batch`.
pub(crate) fn batch_ranges(len: usize, batch: usize) -> impl Iterator<Item = Range<usize>> {
    debug_assert!(batch > 0 && len >= batch);

    let batches = len.div_ceil(batch);
    (0..batches).map(move |i| {
        let start = i * batch;
        if start + batch <= len {
            start..start + batch
        } else {
            len - batch..len
        }
    })
}
