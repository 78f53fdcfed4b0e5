//! Batched general matrix multiply with fused bias.
//!
//! `y = alpha * x·w + beta * bias`. `x` is `[M, K]` or `[B, M, K]`, `w` is
//! `[K, N]` shared across the batch. Dispatch is tiled 16x16 over (m, n)
//! with the batch on the z axis, every axis clamped to the device limit.

use crate::device::Device;
use crate::dispatch::{group_count, LOCAL_SIZE_2D};
use crate::error::{VoltError, VoltResult};
use crate::graph::GraphContext;
use crate::ops::{KernelRef, PipelineOp, PushParam};
use crate::tensor::{Format, Tensor};

const GEMM: &str = include_str!("../shaders/gemm.wgsl");

/// Bias layouts understood by the kernel.
const BIAS_NONE: u32 = 0;
const BIAS_PER_COL: u32 = 1;
const BIAS_PER_ROW: u32 = 2;
const BIAS_FULL: u32 = 3;

/// Push constants shared by the gemm forward and backward kernels.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GemmParam {
    pub total: u32,
    pub batch: u32,
    pub m: u32,
    pub k: u32,
    pub n: u32,
    pub alpha: f32,
    pub beta: f32,
    pub bias_mode: u32,
}

impl PushParam for GemmParam {
    fn set_total(&mut self, total: u32) {
        self.total = total;
    }
}

/// General matrix multiply operator.
pub struct Gemm {
    alpha: f32,
    beta: f32,
    op: PipelineOp<GemmParam>,
    back: Option<PipelineOp<GemmParam>>,
    placeholder: Option<Tensor>,
    dims: Option<(usize, usize, usize, usize)>,
}

impl Gemm {
    pub fn new(alpha: f32, beta: f32) -> Self {
        Self {
            alpha,
            beta,
            op: PipelineOp::new(
                "gemm",
                KernelRef {
                    source: GEMM,
                    entry: "op_gemm",
                },
            ),
            back: None,
            placeholder: None,
            dims: None,
        }
    }

    fn bias_mode(m: usize, n: usize, bias: Option<&Tensor>) -> VoltResult<u32> {
        match bias {
            None => Ok(BIAS_NONE),
            Some(b) if b.shape() == [n] => Ok(BIAS_PER_COL),
            Some(b) if b.shape() == [m] => Ok(BIAS_PER_ROW),
            Some(b) if b.shape() == [m, n] => Ok(BIAS_FULL),
            Some(b) => Err(VoltError::ShapeMismatch {
                expected: vec![m, n],
                got: b.shape().to_vec(),
            }),
        }
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
        w: &Tensor,
        bias: Option<&Tensor>,
    ) -> VoltResult<Tensor> {
        let (batch, m, k) = match x.ndim() {
            2 => (1, x.dim(0), x.dim(1)),
            3 => (x.dim(0), x.dim(1), x.dim(2)),
            got => return Err(VoltError::RankMismatch { expected: 2, got }),
        };
        if w.ndim() != 2 || w.dim(0) != k {
            return Err(VoltError::ShapeMismatch {
                expected: vec![k, w.shape().last().copied().unwrap_or(0)],
                got: w.shape().to_vec(),
            });
        }
        let n = w.dim(1);

        let bias_mode = Self::bias_mode(m, n, bias)?;
        let bound_bias = match bias {
            Some(b) => b.clone(),
            None => match &self.placeholder {
                Some(p) => p.clone(),
                None => {
                    let p = Tensor::zeros(device, &[1], Format::Fp32);
                    self.placeholder = Some(p.clone());
                    p
                }
            },
        };

        {
            let param = self.op.param_mut();
            param.batch = batch as u32;
            param.m = m as u32;
            param.k = k as u32;
            param.n = n as u32;
            param.alpha = self.alpha;
            param.beta = self.beta;
            param.bias_mode = bias_mode;
        }
        let max = device.max_workgroups_per_dim();
        self.op.set_groups([
            group_count(m as u32, LOCAL_SIZE_2D, max),
            group_count(n as u32, LOCAL_SIZE_2D, max),
            (batch as u32).clamp(1, max),
        ]);
        self.dims = Some((batch, m, k, n));

        let out_shape: Vec<usize> = if x.ndim() == 3 {
            vec![batch, m, n]
        } else {
            vec![m, n]
        };
        self.op
            .forward_shaped(device, graph, &[x, w, &bound_bias], &out_shape)
    }

    /// Backward kernel binds `x, w, dy, dx, dw, db`. Returns `(dx, dw, db)`
    /// with `dw` and `db` summed over the batch. `db` is shaped to match
    /// the bias layout the forward pass used.
    pub fn backward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        dy: &Tensor,
    ) -> VoltResult<(Tensor, Tensor, Tensor)> {
        let (_, m, k, n) = self.dims.ok_or(VoltError::NotDispatched("gemm"))?;
        let (x, w) = match (self.op.saved(0), self.op.saved(1)) {
            (Some(x), Some(w)) => (x.clone(), w.clone()),
            _ => return Err(VoltError::NotDispatched("gemm")),
        };

        let param = *self.op.param();
        let max = device.max_workgroups_per_dim();
        let back = self.back.get_or_insert_with(|| {
            PipelineOp::new(
                "d_gemm",
                KernelRef {
                    source: GEMM,
                    entry: "d_gemm",
                },
            )
        });
        *back.param_mut() = param;
        back.set_groups([
            group_count(m.max(k) as u32, LOCAL_SIZE_2D, max),
            group_count(n.max(k) as u32, LOCAL_SIZE_2D, max),
            1,
        ]);

        let x_shape = x.shape().to_vec();
        let w_shape = w.shape().to_vec();
        let db_shape = match param.bias_mode {
            BIAS_PER_COL => vec![n],
            BIAS_PER_ROW => vec![m],
            BIAS_FULL => vec![m, n],
            _ => vec![1],
        };
        let mut out = back.run(device, graph, &[&x, &w, dy], &[&x_shape, &w_shape, &db_shape])?;
        let db = out.swap_remove(2);
        let dw = out.swap_remove(1);
        let dx = out.swap_remove(0);
        Ok((dx, dw, db))
    }

    pub fn build_count(&self) -> u32 {
        self.op.build_count()
    }
}

/// Plain matrix multiply: gemm with `alpha = 1`, `beta = 0`, no bias.
pub struct MatMul {
    gemm: Gemm,
}

impl MatMul {
    pub fn new() -> Self {
        Self {
            gemm: Gemm::new(1.0, 0.0),
        }
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
        w: &Tensor,
    ) -> VoltResult<Tensor> {
        self.gemm.forward(device, graph, x, w, None)
    }

    /// Returns `(dx, dw)`.
    pub fn backward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        dy: &Tensor,
    ) -> VoltResult<(Tensor, Tensor)> {
        let (dx, dw, _db) = self.gemm.backward(device, graph, dy)?;
        Ok((dx, dw))
    }

    pub fn build_count(&self) -> u32 {
        self.gemm.build_count()
    }
}

impl Default for MatMul {
    fn default() -> Self {
        Self::new()
    }
}
