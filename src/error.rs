use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

/// The result type used across the crate.
pub type Result<T> = std::result::Result<T, EngineErr>;

/// The transfer-learning engine's error type.
#[derive(Debug)]
pub enum EngineErr {
    /// A label was used that is not part of the configured class set.
    UnknownClass { label: String },
    /// The same label appeared twice in the configured class set.
    DuplicateClass { label: String },
    /// An operation was attempted on an engine that is closing or closed.
    Closed,
    /// `train` was called before the sample collection held one full batch.
    InsufficientData { got: usize, expected: usize },
    /// Two buffers that must agree in length do not.
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// Background work did not drain within the shutdown timeout.
    ShutdownTimeout,
    /// The underlying model handle failed to execute its graph.
    Model { stage: &'static str, detail: String },
    Io(io::Error),
}

impl Display for EngineErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErr::UnknownClass { label } => {
                write!(f, "class {label:?} is not part of the configured class set")
            }
            EngineErr::DuplicateClass { label } => {
                write!(f, "class {label:?} appears more than once in the class set")
            }
            EngineErr::Closed => f.write_str("the engine has been closed"),
            EngineErr::InsufficientData { got, expected } => write!(
                f,
                "too few samples to train: got {got}, need at least {expected}"
            ),
            EngineErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "shape mismatch for {what}: got {got}, expected {expected}"),
            EngineErr::ShutdownTimeout => {
                f.write_str("background tasks did not finish within the shutdown timeout")
            }
            EngineErr::Model { stage, detail } => {
                write!(f, "the {stage} stage failed to run: {detail}")
            }
            EngineErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for EngineErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<EngineErr> for io::Error {
    fn from(value: EngineErr) -> Self {
        match value {
            EngineErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
