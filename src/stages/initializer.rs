use parking_lot::Mutex;

use crate::{EngineErr, Result, model::RawModel};

/// Adapter over the parameter-initialization graph.
///
/// The graph takes no inputs and produces one tensor per trainable parameter.
pub struct Initializer<H: RawModel> {
    handle: Mutex<H>,
    output_sizes: Vec<usize>,
}

impl<H: RawModel> Initializer<H> {
    /// Wraps a loaded initialization handle.
    pub fn new(handle: H) -> Self {
        let output_sizes = (0..handle.output_count())
            .map(|i| handle.output_len(i))
            .collect();

        Self {
            handle: Mutex::new(handle),
            output_sizes,
        }
    }

    /// The element counts of the produced parameter tensors, in declared order.
    pub fn output_sizes(&self) -> &[usize] {
        &self.output_sizes
    }

    /// Fills `params` with the model's initial parameter values.
    ///
    /// # Arguments
    /// * `params` - One buffer per parameter tensor, in declared order.
    ///
    /// # Errors
    /// Returns a shape mismatch if `params` does not line up with the graph's
    /// outputs, or `EngineErr::Model` if the graph fails to run.
    pub fn initialize(&self, params: &mut [Box<[f32]>]) -> Result<()> {
        if params.len() != self.output_sizes.len() {
            return Err(EngineErr::ShapeMismatch {
                what: "initializer output tensors",
                got: params.len(),
                expected: self.output_sizes.len(),
            });
        }

        for (param, &size) in params.iter().zip(&self.output_sizes) {
            if param.len() != size {
                return Err(EngineErr::ShapeMismatch {
                    what: "initializer output buffer",
                    got: param.len(),
                    expected: size,
                });
            }
        }

        let mut outputs: Vec<&mut [f32]> = params.iter_mut().map(|p| &mut **p).collect();
        self.handle.lock().run(&[], &mut outputs)
    }
}
