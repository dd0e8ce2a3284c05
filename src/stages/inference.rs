use parking_lot::Mutex;

use crate::{EngineErr, Result, model::RawModel};

/// Adapter over the classification ("head inference") graph.
///
/// Maps `(bottleneck, params...)` to one confidence per class.
#[derive(Debug)]
pub struct InferenceHead<H: RawModel> {
    handle: Mutex<H>,
    bottleneck_len: usize,
    class_count: usize,
    param_sizes: Vec<usize>,
}

impl<H: RawModel> InferenceHead<H> {
    /// Wraps a loaded inference handle.
    ///
    /// # Arguments
    /// * `handle` - The loaded graph.
    /// * `param_sizes` - The parameter shapes declared by the head trainer;
    ///   the inference graph's parameter inputs must agree with them.
    ///
    /// # Errors
    /// Returns a shape mismatch if the graph's inputs do not line up with the
    /// declared parameters or it does not produce a single confidence tensor.
    pub fn new(handle: H, param_sizes: &[usize]) -> Result<Self> {
        if handle.input_count() != 1 + param_sizes.len() {
            return Err(EngineErr::ShapeMismatch {
                what: "inference-head input tensors",
                got: handle.input_count(),
                expected: 1 + param_sizes.len(),
            });
        }
        if handle.output_count() != 1 {
            return Err(EngineErr::ShapeMismatch {
                what: "inference-head output tensors",
                got: handle.output_count(),
                expected: 1,
            });
        }
        for (i, &size) in param_sizes.iter().enumerate() {
            if handle.input_len(1 + i) != size {
                return Err(EngineErr::ShapeMismatch {
                    what: "inference-head parameter tensor",
                    got: handle.input_len(1 + i),
                    expected: size,
                });
            }
        }

        let bottleneck_len = handle.input_len(0);
        let class_count = handle.output_len(0);

        Ok(Self {
            handle: Mutex::new(handle),
            bottleneck_len,
            class_count,
            param_sizes: param_sizes.to_vec(),
        })
    }

    /// The element count of one bottleneck vector.
    pub fn bottleneck_len(&self) -> usize {
        self.bottleneck_len
    }

    /// The number of classes the head distinguishes.
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Runs one classification against the given parameter generation.
    ///
    /// # Arguments
    /// * `bottleneck` - One bottleneck vector.
    /// * `params` - The current parameter generation, read only.
    ///
    /// # Returns
    /// One confidence per class, in class-index order.
    pub fn classify(&self, bottleneck: &[f32], params: &[Box<[f32]>]) -> Result<Box<[f32]>> {
        if bottleneck.len() != self.bottleneck_len {
            return Err(EngineErr::ShapeMismatch {
                what: "bottleneck buffer",
                got: bottleneck.len(),
                expected: self.bottleneck_len,
            });
        }
        if params.len() != self.param_sizes.len() {
            return Err(EngineErr::ShapeMismatch {
                what: "parameter tensors",
                got: params.len(),
                expected: self.param_sizes.len(),
            });
        }

        let mut inputs: Vec<&[f32]> = Vec::with_capacity(1 + params.len());
        inputs.push(bottleneck);
        inputs.extend(params.iter().map(|p| &**p));

        let mut confidences = vec![0.0; self.class_count].into_boxed_slice();
        self.handle.lock().run(&inputs, &mut [&mut confidences])?;

        Ok(confidences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::DenseHeadLoader;
    use crate::model::ModelLoader;

    #[test]
    fn test_confidences_cover_every_class() {
        let loader = DenseHeadLoader::new(3, 4, 2);
        let head = InferenceHead::new(loader.load_inference().unwrap(), &[12, 4]).unwrap();

        let params = vec![
            vec![0.0f32; 12].into_boxed_slice(),
            vec![0.0f32; 4].into_boxed_slice(),
        ];
        let confidences = head.classify(&[1.0, 0.5, -0.5], &params).unwrap();

        assert_eq!(confidences.len(), 4);
        // Uniform parameters give a uniform posterior.
        let total: f32 = confidences.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_mismatched_parameter_declaration() {
        let loader = DenseHeadLoader::new(3, 4, 2);
        let err = InferenceHead::new(loader.load_inference().unwrap(), &[10, 4]).unwrap_err();
        assert!(matches!(err, EngineErr::ShapeMismatch { .. }));
    }
}
