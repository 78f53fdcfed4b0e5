//! Elementwise math: unary, binary, comparison and logical operators.
//!
//! Comparisons always produce `Format::Bool` outputs (u32 0/1). Logical
//! `xor` only accepts `Bool` inputs.

use crate::device::Device;
use crate::error::{VoltError, VoltResult};
use crate::graph::GraphContext;
use crate::ops::{KernelRef, PipelineOp, PushParam};
use crate::tensor::{Format, Tensor};

const ELEMENTWISE: &str = include_str!("../shaders/elementwise.wgsl");
const COMPARE: &str = include_str!("../shaders/compare.wgsl");
const LOGIC: &str = include_str!("../shaders/logic.wgsl");

/// Push constants for elementwise kernels.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ElemParam {
    pub total: u32,
}

impl PushParam for ElemParam {
    fn set_total(&mut self, total: u32) {
        self.total = total;
    }
}

fn kernel(entry: &'static str) -> KernelRef {
    KernelRef {
        source: ELEMENTWISE,
        entry,
    }
}

/// Elementwise unary operator over fp32 tensors.
pub struct UnaryOp {
    op: PipelineOp<ElemParam>,
}

macro_rules! unary_ctor {
    ($($(#[$meta:meta])* $name:ident => $entry:literal, $bwd:expr;)*) => {
        $(
            $(#[$meta])*
            pub fn $name() -> Self {
                Self::build($entry, $bwd)
            }
        )*
    };
}

impl UnaryOp {
    fn build(entry: &'static str, backward: Option<&'static str>) -> Self {
        let mut op = PipelineOp::new(
            entry.trim_start_matches("op_"),
            kernel(entry),
        );
        if let Some(b) = backward {
            op = op.with_backward(kernel(b));
        }
        Self { op }
    }

    unary_ctor! {
        abs => "op_abs", Some("d_abs");
        ceil => "op_ceil", None;
        floor => "op_floor", None;
        round => "op_round", None;
        sign => "op_sign", None;
        sqrt => "op_sqrt", Some("d_sqrt");
        exp => "op_exp", Some("d_exp");
        log => "op_log", Some("d_log");
        sin => "op_sin", Some("d_sin");
        cos => "op_cos", Some("d_cos");
        tan => "op_tan", Some("d_tan");
        asin => "op_asin", None;
        acos => "op_acos", None;
        atan => "op_atan", None;
        sinh => "op_sinh", Some("d_sinh");
        cosh => "op_cosh", Some("d_cosh");
        tanh => "op_tanh", Some("d_tanh");
        neg => "op_neg", Some("d_neg");
        /// Identity copy into fresh storage.
        copy => "op_copy", Some("d_copy");
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

/// Elementwise binary operator over fp32 tensors of matching shape.
pub struct BinaryOp {
    op: PipelineOp<ElemParam>,
}

macro_rules! binary_ctor {
    ($($(#[$meta:meta])* $name:ident => $entry:literal, $bwd:expr;)*) => {
        $(
            $(#[$meta])*
            pub fn $name() -> Self {
                Self::build($entry, $bwd)
            }
        )*
    };
}

impl BinaryOp {
    fn build(entry: &'static str, backward: Option<&'static str>) -> Self {
        let mut op = PipelineOp::new(
            entry.trim_start_matches("op_"),
            kernel(entry),
        );
        if let Some(b) = backward {
            op = op.with_backward(kernel(b));
        }
        Self { op }
    }

    binary_ctor! {
        add => "op_add", Some("d_add");
        sub => "op_sub", Some("d_sub");
        mul => "op_mul", Some("d_mul");
        div => "op_div", Some("d_div");
        min => "op_min", None;
        max => "op_max", None;
        /// Floored modulo, `x - w * floor(x / w)`.
        modulo => "op_mod", None;
        pow => "op_pow", None;
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
        w: &Tensor,
    ) -> VoltResult<Tensor> {
        if x.shape() != w.shape() {
            return Err(VoltError::ShapeMismatch {
                expected: x.shape().to_vec(),
                got: w.shape().to_vec(),
            });
        }
        self.op.forward_binary(device, graph, x, w)
    }

    /// Returns `(dx, dw)`.
    pub fn backward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        dy: &Tensor,
    ) -> VoltResult<(Tensor, Tensor)> {
        self.op.backward_binary(device, graph, dy)
    }

    pub fn build_count(&self) -> u32 {
        self.op.build_count()
    }
}

/// Elementwise comparison. Output format is always `Bool`.
pub struct CompareOp {
    op: PipelineOp<ElemParam>,
}

macro_rules! compare_ctor {
    ($($name:ident => $entry:literal;)*) => {
        $(
            pub fn $name() -> Self {
                Self {
                    op: PipelineOp::new(
                        $entry.trim_start_matches("op_"),
                        KernelRef { source: COMPARE, entry: $entry },
                    )
                    .with_out_format(Format::Bool),
                }
            }
        )*
    };
}

impl CompareOp {
    compare_ctor! {
        eq => "op_eq";
        ne => "op_ne";
        lt => "op_lt";
        le => "op_le";
        gt => "op_gt";
        ge => "op_ge";
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
        w: &Tensor,
    ) -> VoltResult<Tensor> {
        if x.shape() != w.shape() {
            return Err(VoltError::ShapeMismatch {
                expected: x.shape().to_vec(),
                got: w.shape().to_vec(),
            });
        }
        self.op.forward_binary(device, graph, x, w)
    }

    pub fn build_count(&self) -> u32 {
        self.op.build_count()
    }
}

/// Logical xor over `Bool` tensors. Non-bool input is rejected.
pub struct Xor {
    op: PipelineOp<ElemParam>,
}

impl Xor {
    pub fn new() -> Self {
        Self {
            op: PipelineOp::new(
                "xor",
                KernelRef {
                    source: LOGIC,
                    entry: "op_xor",
                },
            )
            .with_out_format(Format::Bool),
        }
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
        w: &Tensor,
    ) -> VoltResult<Tensor> {
        for t in [x, w] {
            if t.format() != Format::Bool {
                return Err(VoltError::FormatMismatch {
                    expected: Format::Bool,
                    got: t.format(),
                });
            }
        }
        if x.shape() != w.shape() {
            return Err(VoltError::ShapeMismatch {
                expected: x.shape().to_vec(),
                got: w.shape().to_vec(),
            });
        }
        self.op.forward_binary(device, graph, x, w)
    }
}

impl Default for Xor {
    fn default() -> Self {
        Self::new()
    }
}
