//! Composite neural-network modules.
//!
//! A module chains primitive operators, registers its children inside a
//! sub-graph span and exposes one node at the top level of the graph.

mod conv;
mod dense;
mod rnn;

pub use conv::{Conv, ConvTranspose};
pub use dense::Dense;
pub use rnn::{Gru, Lstm, Rnn};

use crate::device::Device;
use crate::error::{VoltError, VoltResult};
use crate::graph::GraphContext;
use crate::tensor::Tensor;

/// Base trait for composite modules.
pub trait Module {
    /// Forward pass.
    fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
    ) -> VoltResult<Tensor>;

    /// Backward pass: input gradient from output gradient. Parameter
    /// gradients stay on the module.
    fn backward(
        &mut self,
        _device: &Device,
        _graph: &mut GraphContext,
        _dy: &Tensor,
    ) -> VoltResult<Tensor> {
        Err(VoltError::NoBackward("module"))
    }

    /// Trainable parameter tensors.
    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }

    /// Total trainable element count.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.count()).sum()
    }
}
