//! # voltml - Minimal GPU Tensor-Compute Runtime
//!
//! voltml runs small machine-learning workloads on the GPU through wgpu
//! compute pipelines: tensors in storage buffers, operators as one-shot
//! pipelines with push-constant parameter blocks, and fenced blocking
//! dispatch so every returned tensor is immediately readable.
//!
//! ## Features
//!
//! - **Explicit contexts**: no globals; a [`Device`] and a
//!   [`GraphContext`] are passed to everything that needs them
//! - **Lazy pipelines**: each operator builds its pipeline on first
//!   dispatch and stays frozen to that problem size
//! - **Structured ops**: vol2col/col2vol, stride-table transpose,
//!   batched gemm with fused bias
//! - **Recurrent cells**: RNN/LSTM/GRU single-timestep kernels driven by
//!   host-side sequence loops
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltml::prelude::*;
//!
//! let device = Device::new().unwrap();
//! let mut graph = GraphContext::new();
//!
//! let a = Tensor::filled(&device, &[4, 4], 2.0);
//! let b = Tensor::filled(&device, &[4, 4], 3.0);
//!
//! let mut add = ops::math::BinaryOp::add();
//! let y = add.forward(&device, &mut graph, &a, &b).unwrap();
//! assert_eq!(y.to_vec(&device).unwrap(), vec![5.0; 16]);
//! ```

#![allow(dead_code)]

pub mod buffer;
pub mod dispatch;
pub mod graph;
pub mod nn;
pub mod ops;
pub mod tensor;

mod device;
mod error;

pub use device::Device;
pub use error::{VoltError, VoltResult};

/// Import everything you need with `use voltml::prelude::*`.
pub mod prelude {
    pub use crate::graph::GraphContext;
    pub use crate::nn::{self, Module};
    pub use crate::ops;
    pub use crate::tensor::{init::Init, Format, Tensor};
    pub use crate::Device;
    pub use crate::{VoltError, VoltResult};
}
