use parking_lot::Mutex;

use crate::{EngineErr, Result, model::RawModel};

/// Adapter over the optimizer-step graph.
///
/// The graph maps `(params..., gradients..., state...)` to
/// `(next params..., next state...)`. The number of optimizer-state tensors
/// is inferred from the handle: everything left over once two runs of
/// parameter-shaped inputs are accounted for is state.
#[derive(Debug)]
pub struct OptimizerStage<H: RawModel> {
    handle: Mutex<H>,
    param_sizes: Vec<usize>,
    state_sizes: Vec<usize>,
}

impl<H: RawModel> OptimizerStage<H> {
    /// Wraps a loaded optimizer handle.
    ///
    /// # Arguments
    /// * `handle` - The loaded graph.
    /// * `param_sizes` - The parameter shapes declared by the head trainer.
    ///
    /// # Errors
    /// Returns a shape mismatch if the graph's inputs and outputs do not form
    /// the `(params, gradients, state) -> (params, state)` layout.
    pub fn new(handle: H, param_sizes: &[usize]) -> Result<Self> {
        let param_count = param_sizes.len();

        if handle.input_count() < 2 * param_count {
            return Err(EngineErr::ShapeMismatch {
                what: "optimizer input tensors",
                got: handle.input_count(),
                expected: 2 * param_count,
            });
        }

        for (i, &size) in param_sizes.iter().enumerate() {
            if handle.input_len(i) != size {
                return Err(EngineErr::ShapeMismatch {
                    what: "optimizer parameter tensor",
                    got: handle.input_len(i),
                    expected: size,
                });
            }
            if handle.input_len(param_count + i) != size {
                return Err(EngineErr::ShapeMismatch {
                    what: "optimizer gradient tensor",
                    got: handle.input_len(param_count + i),
                    expected: size,
                });
            }
        }

        let state_sizes: Vec<usize> = (2 * param_count..handle.input_count())
            .map(|i| handle.input_len(i))
            .collect();

        if handle.output_count() != param_count + state_sizes.len() {
            return Err(EngineErr::ShapeMismatch {
                what: "optimizer output tensors",
                got: handle.output_count(),
                expected: param_count + state_sizes.len(),
            });
        }
        for (i, &size) in param_sizes.iter().chain(&state_sizes).enumerate() {
            if handle.output_len(i) != size {
                return Err(EngineErr::ShapeMismatch {
                    what: "optimizer output tensor",
                    got: handle.output_len(i),
                    expected: size,
                });
            }
        }

        Ok(Self {
            handle: Mutex::new(handle),
            param_sizes: param_sizes.to_vec(),
            state_sizes,
        })
    }

    /// The element counts of the optimizer-state tensors, in declared order.
    pub fn state_sizes(&self) -> &[usize] {
        &self.state_sizes
    }

    /// Computes the next parameter and optimizer-state generation.
    ///
    /// # Arguments
    /// * `params` - The current parameter generation, read only.
    /// * `gradients` - The batch gradients from the head trainer.
    /// * `state` - The current optimizer state.
    /// * `next_params` - Overwritten with the next parameter generation.
    /// * `next_state` - Overwritten with the next optimizer state.
    pub fn step(
        &self,
        params: &[Box<[f32]>],
        gradients: &[Box<[f32]>],
        state: &[Box<[f32]>],
        next_params: &mut [Box<[f32]>],
        next_state: &mut [Box<[f32]>],
    ) -> Result<()> {
        let check = |what, got: usize, expected: usize| {
            if got == expected {
                Ok(())
            } else {
                Err(EngineErr::ShapeMismatch {
                    what,
                    got,
                    expected,
                })
            }
        };

        check("parameter tensors", params.len(), self.param_sizes.len())?;
        check("gradient tensors", gradients.len(), self.param_sizes.len())?;
        check("state tensors", state.len(), self.state_sizes.len())?;
        check(
            "staged parameter tensors",
            next_params.len(),
            self.param_sizes.len(),
        )?;
        check(
            "staged state tensors",
            next_state.len(),
            self.state_sizes.len(),
        )?;

        let mut inputs: Vec<&[f32]> =
            Vec::with_capacity(params.len() + gradients.len() + state.len());
        inputs.extend(params.iter().map(|p| &**p));
        inputs.extend(gradients.iter().map(|g| &**g));
        inputs.extend(state.iter().map(|s| &**s));

        let mut outputs: Vec<&mut [f32]> =
            Vec::with_capacity(next_params.len() + next_state.len());
        outputs.extend(next_params.iter_mut().map(|p| &mut **p));
        outputs.extend(next_state.iter_mut().map(|s| &mut **s));

        self.handle.lock().run(&inputs, &mut outputs)
    }
}
