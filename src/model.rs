use crate::Result;

/// One loaded computation graph.
///
/// A `RawModel` is a pure function from an ordered set of input tensors to an
/// ordered set of output tensors, plus enough introspection to derive batch
/// size and parameter shapes from the graph itself. Implementations are not
/// required to be safe for concurrent use; the stage adapters serialize all
/// calls to a handle.
pub trait RawModel: Send + 'static {
    /// The number of input tensors the graph expects.
    fn input_count(&self) -> usize;

    /// The number of output tensors the graph produces.
    fn output_count(&self) -> usize;

    /// The shape of the `index`-th input tensor.
    fn input_shape(&self, index: usize) -> &[usize];

    /// The shape of the `index`-th output tensor.
    fn output_shape(&self, index: usize) -> &[usize];

    /// The element count of the `index`-th input tensor.
    fn input_len(&self, index: usize) -> usize {
        self.input_shape(index).iter().product()
    }

    /// The element count of the `index`-th output tensor.
    fn output_len(&self, index: usize) -> usize {
        self.output_shape(index).iter().product()
    }

    /// Executes the graph.
    ///
    /// # Arguments
    /// * `inputs` - One slice per input tensor, in declared order.
    /// * `outputs` - One slice per output tensor, in declared order; filled on
    ///   success.
    ///
    /// # Errors
    /// Returns `EngineErr::Model` if the underlying execution engine fails.
    fn run(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()>;
}

/// Loads the five graph artifacts that make up one transfer-learning model.
///
/// The engine only depends on this capability set and on the returned
/// handle's [`RawModel`] contract; where the artifacts come from is the
/// loader's business. Being a trait, a deterministic in-memory implementation
/// can stand in for real artifacts under test.
pub trait ModelLoader {
    type Handle: RawModel;

    /// Loads the parameter-initialization graph.
    fn load_initializer(&self) -> Result<Self::Handle>;

    /// Loads the fixed feature-extractor ("base") graph.
    fn load_base(&self) -> Result<Self::Handle>;

    /// Loads the gradient-computation ("head training") graph.
    fn load_trainer(&self) -> Result<Self::Handle>;

    /// Loads the classification ("head inference") graph.
    fn load_inference(&self) -> Result<Self::Handle>;

    /// Loads the optimizer-step graph.
    fn load_optimizer(&self) -> Result<Self::Handle>;
}
