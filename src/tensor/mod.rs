//! Tensors and host-side initializers.

mod core;
pub mod init;

pub use self::core::{Format, Tensor};
