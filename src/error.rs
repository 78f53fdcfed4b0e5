//! Error types for the runtime.
//!
//! Every fallible operation returns [`VoltResult`]. Device loss, shape
//! violations and pipeline misuse are all surfaced as [`VoltError`]
//! variants instead of panics.

use crate::tensor::Format;
use thiserror::Error;

/// Errors produced by device setup, tensor bookkeeping and kernel dispatch.
#[derive(Debug, Error)]
pub enum VoltError {
    /// No GPU adapter with compute support was found.
    #[error("no compatible GPU adapter found")]
    NoAdapter,

    /// The adapter refused to create a logical device.
    #[error("failed to create GPU device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    /// Two tensors disagree on shape where they must match.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Reshape target does not preserve the element count.
    #[error("element count mismatch: tensor holds {have} elements, new shape needs {want}")]
    CountMismatch { have: usize, want: usize },

    /// An operator received a tensor of the wrong storage format.
    #[error("format mismatch: expected {expected:?}, got {got:?}")]
    FormatMismatch { expected: Format, got: Format },

    /// An operator whose pipeline was built for one problem size was
    /// re-dispatched with another. Each operator instance is frozen to the
    /// element count of its first call.
    #[error("pipeline already built for {built_for} elements, re-dispatched with {got}")]
    PipelineFrozen { built_for: usize, got: usize },

    /// A tensor arrived with the wrong number of axes.
    #[error("rank mismatch: expected {expected} axes, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// The axis order handed to a transpose is not a permutation.
    #[error("invalid axis permutation {0:?}")]
    InvalidPermutation(Vec<usize>),

    /// Backward was requested on an operator without a backward kernel.
    #[error("operator `{0}` has no backward kernel")]
    NoBackward(&'static str),

    /// Backward was requested before the first forward dispatch.
    #[error("backward called before forward on `{0}`")]
    NotDispatched(&'static str),
}

/// Convenience alias used throughout the crate.
pub type VoltResult<T> = std::result::Result<T, VoltError>;
