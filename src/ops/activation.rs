//! Activation functions.
//!
//! All activations share one push-constant block carrying up to two scalar
//! knobs (`alpha`, `beta`). `clip` rides along here since it needs both.

use crate::device::Device;
use crate::error::VoltResult;
use crate::graph::GraphContext;
use crate::ops::{KernelRef, PipelineOp, PushParam};
use crate::tensor::{init::Init, Tensor};

const ACTIVATION: &str = include_str!("../shaders/activation.wgsl");

/// Push constants for activation kernels.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ActParam {
    pub total: u32,
    pub alpha: f32,
    pub beta: f32,
}

impl PushParam for ActParam {
    fn set_total(&mut self, total: u32) {
        self.total = total;
    }
}

fn kernel(entry: &'static str) -> KernelRef {
    KernelRef {
        source: ACTIVATION,
        entry,
    }
}

/// Elementwise activation with optional scalar parameters.
pub struct Activation {
    op: PipelineOp<ActParam>,
}

impl Activation {
    fn build(entry: &'static str, backward: &'static str, alpha: f32, beta: f32) -> Self {
        let mut op: PipelineOp<ActParam> = PipelineOp::new(entry.trim_start_matches("op_"), kernel(entry))
            .with_backward(kernel(backward));
        op.param_mut().alpha = alpha;
        op.param_mut().beta = beta;
        Self { op }
    }

    pub fn relu() -> Self {
        Self::build("op_relu", "d_relu", 0.0, 0.0)
    }

    pub fn sigmoid() -> Self {
        Self::build("op_sigmoid", "d_sigmoid", 0.0, 0.0)
    }

    /// `max(0, x) + min(0, alpha * (exp(x / alpha) - 1))`
    pub fn celu(alpha: f32) -> Self {
        Self::build("op_celu", "d_celu", alpha, 0.0)
    }

    pub fn leaky_relu(alpha: f32) -> Self {
        Self::build("op_leaky_relu", "d_leaky_relu", alpha, 0.0)
    }

    /// `clamp(x / 6 + 0.5, 0, 1)`
    pub fn hard_sigmoid() -> Self {
        Self::build("op_hard_sigmoid", "d_hard_sigmoid", 0.0, 0.0)
    }

    pub fn log_sigmoid() -> Self {
        Self::build("op_log_sigmoid", "d_log_sigmoid", 0.0, 0.0)
    }

    /// Clamp every element to `[min, max]`.
    pub fn clip(min: f32, max: f32) -> Self {
        Self::build("op_clip", "d_clip", min, max)
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
    ) -> VoltResult<Tensor> {
        self.op.forward_unary(device, graph, x)
    }

    pub fn backward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        dy: &Tensor,
    ) -> VoltResult<Tensor> {
        self.op.backward_unary(device, graph, dy)
    }

    pub fn build_count(&self) -> u32 {
        self.op.build_count()
    }
}

/// Randomized leaky ReLU. The negative-slope tensor is sampled uniformly
/// from `[lower, upper)` once, at the first forward, and reused for every
/// subsequent dispatch of this operator instance.
pub struct RRelu {
    op: PipelineOp<ActParam>,
    lower: f32,
    upper: f32,
    slope: Option<Tensor>,
}

impl RRelu {
    pub fn new(lower: f32, upper: f32) -> Self {
        Self {
            op: PipelineOp::new("rrelu", kernel("op_rrelu")).with_backward(kernel("d_rrelu")),
            lower,
            upper,
            slope: None,
        }
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
    ) -> VoltResult<Tensor> {
        let slope = match &self.slope {
            Some(s) => s.clone(),
            None => {
                let s = Tensor::from_init(
                    device,
                    Init::Uniform {
                        min: self.lower,
                        max: self.upper,
                    },
                    x.shape(),
                );
                self.slope = Some(s.clone());
                s
            }
        };
        self.op.forward_binary(device, graph, x, &slope)
    }

    /// Returns `dx`; the slope tensor carries no gradient.
    pub fn backward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        dy: &Tensor,
    ) -> VoltResult<Tensor> {
        let (dx, _) = self.op.backward_binary(device, graph, dy)?;
        Ok(dx)
    }
}
