use parking_lot::Mutex;

use crate::{EngineErr, Result, model::RawModel};

/// Adapter over the fixed feature-extractor ("base") graph.
///
/// Maps one image to one bottleneck vector. The inner mutex makes the adapter
/// safe to share between the background ingestion tasks and the inference
/// path; only one extraction proceeds at a time per instance.
pub struct BottleneckExtractor<H: RawModel> {
    handle: Mutex<H>,
    image_len: usize,
    bottleneck_len: usize,
}

impl<H: RawModel> BottleneckExtractor<H> {
    /// Wraps a loaded feature-extractor handle.
    ///
    /// # Errors
    /// Returns a shape mismatch if the graph is not a single-input,
    /// single-output forward pass.
    pub fn new(handle: H) -> Result<Self> {
        if handle.input_count() != 1 {
            return Err(EngineErr::ShapeMismatch {
                what: "feature-extractor input tensors",
                got: handle.input_count(),
                expected: 1,
            });
        }
        if handle.output_count() != 1 {
            return Err(EngineErr::ShapeMismatch {
                what: "feature-extractor output tensors",
                got: handle.output_count(),
                expected: 1,
            });
        }

        let image_len = handle.input_len(0);
        let bottleneck_len = handle.output_len(0);

        Ok(Self {
            handle: Mutex::new(handle),
            image_len,
            bottleneck_len,
        })
    }

    /// The element count of one input image.
    pub fn image_len(&self) -> usize {
        self.image_len
    }

    /// The element count of one bottleneck vector.
    pub fn bottleneck_len(&self) -> usize {
        self.bottleneck_len
    }

    /// Runs a single-image forward pass and returns the bottleneck.
    ///
    /// # Arguments
    /// * `image` - The raw image buffer, `image_len` elements.
    ///
    /// # Errors
    /// Returns a shape mismatch for a wrong-sized image, or
    /// `EngineErr::Model` if the graph fails to run.
    pub fn extract(&self, image: &[f32]) -> Result<Box<[f32]>> {
        if image.len() != self.image_len {
            return Err(EngineErr::ShapeMismatch {
                what: "image buffer",
                got: image.len(),
                expected: self.image_len,
            });
        }

        let mut bottleneck = vec![0.0; self.bottleneck_len].into_boxed_slice();
        self.handle.lock().run(&[image], &mut [&mut bottleneck])?;

        Ok(bottleneck)
    }
}
