//! Layout transforms: transpose and the vol2col/col2vol pair.
//!
//! Transpose precomputes a stride table on the first dispatch and uploads
//! it as an `Int32` aux tensor; the kernel remaps flat indices through it.
//! vol2col/col2vol unroll 5-D volumes into matmul-ready column matrices
//! using standard convolution arithmetic.

use crate::device::Device;
use crate::dispatch::group_count;
use crate::error::{VoltError, VoltResult};
use crate::graph::GraphContext;
use crate::ops::{KernelRef, PipelineOp, PushParam};
use crate::tensor::Tensor;

const TRANSPOSE: &str = include_str!("../shaders/transpose.wgsl");
const VOL2COL: &str = include_str!("../shaders/vol2col.wgsl");

/// Workgroup footprint of the vol2col family: 16 threads over the
/// channel-kernel volume, 4 over the batch.
const CONV_LOCAL_X: u32 = 16;
const CONV_LOCAL_Y: u32 = 4;

/// Spatial extents of a 3-D volume (depth, height, width).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dhw {
    pub d: usize,
    pub h: usize,
    pub w: usize,
}

impl Dhw {
    /// Same extent along all three axes.
    pub fn cube(v: usize) -> Self {
        Self { d: v, h: v, w: v }
    }

    pub fn volume(&self) -> usize {
        self.d * self.h * self.w
    }
}

/// Output extent of a convolution along one axis.
pub fn conv_output_dim(input: usize, kernel: usize, pad: usize, stride: usize, dilation: usize) -> usize {
    (input + 2 * pad - (dilation * (kernel - 1) + 1)) / stride + 1
}

/// Input extent recovered from a column extent (col2vol / transposed conv).
pub fn conv_transpose_dim(col: usize, kernel: usize, pad: usize, stride: usize, dilation: usize) -> usize {
    (col - 1) * stride + dilation * (kernel - 1) + 1 - 2 * pad
}

fn conv_dims(input: Dhw, kernel: Dhw, pad: Dhw, stride: Dhw, dilation: Dhw) -> Dhw {
    Dhw {
        d: conv_output_dim(input.d, kernel.d, pad.d, stride.d, dilation.d),
        h: conv_output_dim(input.h, kernel.h, pad.h, stride.h, dilation.h),
        w: conv_output_dim(input.w, kernel.w, pad.w, stride.w, dilation.w),
    }
}

/// Push constants for transpose kernels.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TransposeParam {
    pub total: u32,
    pub ndim: u32,
}

impl PushParam for TransposeParam {
    fn set_total(&mut self, total: u32) {
        self.total = total;
    }
}

/// Row-major strides of a shape, innermost axis last.
fn strides_of(shape: &[usize]) -> Vec<i32> {
    let mut strides = vec![1i32; shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * shape[k + 1] as i32;
    }
    strides
}

/// Stride table consumed by the transpose kernel: axis order, then the
/// strides of the output shape, then the strides of the input shape.
fn stride_table(order: &[usize], in_shape: &[usize], out_shape: &[usize]) -> Vec<i32> {
    let ndim = order.len();
    let mut table = Vec::with_capacity(3 * ndim);
    table.extend(order.iter().map(|&a| a as i32));
    table.extend(strides_of(out_shape));
    table.extend(strides_of(in_shape));
    table
}

/// Axis permutation. `order[k]` names the input axis that becomes output
/// axis `k`.
pub struct Transpose {
    order: Vec<usize>,
    op: PipelineOp<TransposeParam>,
    back: Option<PipelineOp<TransposeParam>>,
    in_shape: Vec<usize>,
    out_shape: Vec<usize>,
    table: Option<Tensor>,
    inv_table: Option<Tensor>,
}

impl Transpose {
    pub fn new(order: &[usize]) -> VoltResult<Self> {
        let mut seen = vec![false; order.len()];
        for &axis in order {
            if axis >= order.len() || seen[axis] {
                return Err(VoltError::InvalidPermutation(order.to_vec()));
            }
            seen[axis] = true;
        }
        Ok(Self {
            order: order.to_vec(),
            op: PipelineOp::new(
                "transpose",
                KernelRef {
                    source: TRANSPOSE,
                    entry: "op_transpose",
                },
            ),
            back: None,
            in_shape: Vec::new(),
            out_shape: Vec::new(),
            table: None,
            inv_table: None,
        })
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
    ) -> VoltResult<Tensor> {
        if x.ndim() != self.order.len() {
            return Err(VoltError::RankMismatch {
                expected: self.order.len(),
                got: x.ndim(),
            });
        }

        let table = match &self.table {
            Some(t) => t.clone(),
            None => {
                self.in_shape = x.shape().to_vec();
                self.out_shape = self.order.iter().map(|&a| self.in_shape[a]).collect();
                let entries = stride_table(&self.order, &self.in_shape, &self.out_shape);
                let t = Tensor::from_i32(device, &entries, &[entries.len()])?;
                self.op.param_mut().ndim = self.order.len() as u32;
                self.table = Some(t.clone());
                t
            }
        };

        let out_shape = self.out_shape.clone();
        self.op.forward_shaped(device, graph, &[x, &table], &out_shape)
    }

    /// Map an output-shaped gradient back through the inverse permutation.
    pub fn backward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        dy: &Tensor,
    ) -> VoltResult<Tensor> {
        if self.table.is_none() {
            return Err(VoltError::NotDispatched("transpose"));
        }

        let inv_table = match &self.inv_table {
            Some(t) => t.clone(),
            None => {
                let mut inv_order = vec![0usize; self.order.len()];
                for (k, &a) in self.order.iter().enumerate() {
                    inv_order[a] = k;
                }
                let entries = stride_table(&inv_order, &self.out_shape, &self.in_shape);
                let t = Tensor::from_i32(device, &entries, &[entries.len()])?;
                self.inv_table = Some(t.clone());
                t
            }
        };

        let back = self.back.get_or_insert_with(|| {
            let mut op: PipelineOp<TransposeParam> = PipelineOp::new(
                "d_transpose",
                KernelRef {
                    source: TRANSPOSE,
                    entry: "op_transpose",
                },
            );
            op.param_mut().ndim = self.order.len() as u32;
            op
        });
        let in_shape = self.in_shape.clone();
        back.forward_shaped(device, graph, &[dy, &inv_table], &in_shape)
    }

    pub fn build_count(&self) -> u32 {
        self.op.build_count()
    }
}

/// Push constants for the vol2col family: full conv arithmetic.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ConvParam {
    pub total: u32,
    pub batch: u32,
    pub channels: u32,
    pub kd: u32,
    pub kh: u32,
    pub kw: u32,
    pub pad_d: i32,
    pub pad_h: i32,
    pub pad_w: i32,
    pub stride_d: u32,
    pub stride_h: u32,
    pub stride_w: u32,
    pub dil_d: u32,
    pub dil_h: u32,
    pub dil_w: u32,
    pub vol_d: u32,
    pub vol_h: u32,
    pub vol_w: u32,
    pub col_d: u32,
    pub col_h: u32,
    pub col_w: u32,
}

impl PushParam for ConvParam {
    fn set_total(&mut self, total: u32) {
        self.total = total;
    }
}

fn fill_conv_param(
    param: &mut ConvParam,
    batch: usize,
    channels: usize,
    kernel: Dhw,
    pad: Dhw,
    stride: Dhw,
    dilation: Dhw,
    vol: Dhw,
    col: Dhw,
) {
    param.batch = batch as u32;
    param.channels = channels as u32;
    param.kd = kernel.d as u32;
    param.kh = kernel.h as u32;
    param.kw = kernel.w as u32;
    param.pad_d = pad.d as i32;
    param.pad_h = pad.h as i32;
    param.pad_w = pad.w as i32;
    param.stride_d = stride.d as u32;
    param.stride_h = stride.h as u32;
    param.stride_w = stride.w as u32;
    param.dil_d = dilation.d as u32;
    param.dil_h = dilation.h as u32;
    param.dil_w = dilation.w as u32;
    param.vol_d = vol.d as u32;
    param.vol_h = vol.h as u32;
    param.vol_w = vol.w as u32;
    param.col_d = col.d as u32;
    param.col_h = col.h as u32;
    param.col_w = col.w as u32;
}

/// Unroll a `[N, C, D, H, W]` volume into a `[C*kd*kh*kw, N*od*oh*ow]`
/// column matrix.
pub struct Vol2Col {
    kernel: Dhw,
    pad: Dhw,
    stride: Dhw,
    dilation: Dhw,
    op: PipelineOp<ConvParam>,
    col: Option<Dhw>,
}

impl Vol2Col {
    pub fn new(kernel: Dhw, pad: Dhw, stride: Dhw, dilation: Dhw) -> Self {
        Self {
            kernel,
            pad,
            stride,
            dilation,
            op: PipelineOp::new(
                "vol2col",
                KernelRef {
                    source: VOL2COL,
                    entry: "op_vol2col",
                },
            ),
            col: None,
        }
    }

    /// Column extents computed by the first forward.
    pub fn col_dims(&self) -> Option<Dhw> {
        self.col
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
    ) -> VoltResult<Tensor> {
        if x.ndim() != 5 {
            return Err(VoltError::RankMismatch {
                expected: 5,
                got: x.ndim(),
            });
        }
        let (batch, channels) = (x.dim(0), x.dim(1));
        let vol = Dhw {
            d: x.dim(2),
            h: x.dim(3),
            w: x.dim(4),
        };
        let col = conv_dims(vol, self.kernel, self.pad, self.stride, self.dilation);
        self.col = Some(col);

        let n_out_plane = channels * self.kernel.volume();
        let output_length = batch * col.volume();

        fill_conv_param(
            self.op.param_mut(),
            batch,
            channels,
            self.kernel,
            self.pad,
            self.stride,
            self.dilation,
            vol,
            col,
        );
        let max = device.max_workgroups_per_dim();
        self.op.set_groups([
            group_count(n_out_plane as u32, CONV_LOCAL_X, max),
            group_count(batch as u32, CONV_LOCAL_Y, max),
            1,
        ]);
        self.op
            .forward_shaped(device, graph, &[x], &[n_out_plane, output_length])
    }

    pub fn build_count(&self) -> u32 {
        self.op.build_count()
    }
}

/// Fold a column matrix back into a `[N, C, D, H, W]` volume, accumulating
/// overlapping windows.
pub struct Col2Vol {
    channels: usize,
    kernel: Dhw,
    pad: Dhw,
    stride: Dhw,
    dilation: Dhw,
    op: PipelineOp<ConvParam>,
}

impl Col2Vol {
    pub fn new(channels: usize, kernel: Dhw, pad: Dhw, stride: Dhw, dilation: Dhw) -> Self {
        Self {
            channels,
            kernel,
            pad,
            stride,
            dilation,
            op: PipelineOp::new(
                "col2vol",
                KernelRef {
                    source: VOL2COL,
                    entry: "op_col2vol",
                },
            ),
        }
    }

    /// `x` is a `[C*kd*kh*kw, N*cd*ch*cw]` column matrix; `col` carries its
    /// spatial extents and `batch` its leading factor.
    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
        batch: usize,
        col: Dhw,
    ) -> VoltResult<Tensor> {
        if x.ndim() != 2 {
            return Err(VoltError::RankMismatch {
                expected: 2,
                got: x.ndim(),
            });
        }
        let expected = vec![
            self.channels * self.kernel.volume(),
            batch * col.volume(),
        ];
        if x.shape() != expected.as_slice() {
            return Err(VoltError::ShapeMismatch {
                expected,
                got: x.shape().to_vec(),
            });
        }

        let vol = Dhw {
            d: conv_transpose_dim(col.d, self.kernel.d, self.pad.d, self.stride.d, self.dilation.d),
            h: conv_transpose_dim(col.h, self.kernel.h, self.pad.h, self.stride.h, self.dilation.h),
            w: conv_transpose_dim(col.w, self.kernel.w, self.pad.w, self.stride.w, self.dilation.w),
        };

        fill_conv_param(
            self.op.param_mut(),
            batch,
            self.channels,
            self.kernel,
            self.pad,
            self.stride,
            self.dilation,
            vol,
            col,
        );
        let max = device.max_workgroups_per_dim();
        let n_out_plane = self.channels * self.kernel.volume();
        self.op.set_groups([
            group_count(n_out_plane as u32, CONV_LOCAL_X, max),
            group_count(batch as u32, CONV_LOCAL_Y, max),
            1,
        ]);
        self.op.forward_shaped(
            device,
            graph,
            &[x],
            &[batch, self.channels, vol.d, vol.h, vol.w],
        )
    }

    pub fn build_count(&self) -> u32 {
        self.op.build_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_output_dims() {
        // 5^3 volume, 3^3 kernel, unit stride, no padding.
        assert_eq!(conv_output_dim(5, 3, 0, 1, 1), 3);
        // Same-padding style case.
        assert_eq!(conv_output_dim(5, 3, 1, 1, 1), 5);
        // Strided.
        assert_eq!(conv_output_dim(7, 3, 0, 2, 1), 3);
        // Dilated.
        assert_eq!(conv_output_dim(7, 3, 0, 1, 2), 3);
    }

    #[test]
    fn conv_transpose_inverts_output_dim() {
        for (input, k, p, s, dil) in [(5, 3, 0, 1, 1), (5, 3, 1, 1, 1), (9, 3, 0, 2, 1), (7, 3, 0, 1, 2)] {
            let col = conv_output_dim(input, k, p, s, dil);
            assert_eq!(conv_transpose_dim(col, k, p, s, dil), input);
        }
    }

    #[test]
    fn stride_table_layout() {
        // [A,B,C,D,E] permuted by [1,0,2,3,4].
        let order = [1usize, 0, 2, 3, 4];
        let in_shape = [2usize, 3, 4, 5, 6];
        let out_shape: Vec<usize> = order.iter().map(|&a| in_shape[a]).collect();
        assert_eq!(out_shape, vec![3, 2, 4, 5, 6]);

        let table = stride_table(&order, &in_shape, &out_shape);
        assert_eq!(table.len(), 15);
        assert_eq!(&table[..5], &[1, 0, 2, 3, 4]);
        // Output [3,2,4,5,6] strides.
        assert_eq!(&table[5..10], &[240, 120, 30, 6, 1]);
        // Input [2,3,4,5,6] strides.
        assert_eq!(&table[10..], &[360, 120, 30, 6, 1]);
    }

    #[test]
    fn rejects_bad_permutation() {
        assert!(Transpose::new(&[0, 0, 1]).is_err());
        assert!(Transpose::new(&[0, 3]).is_err());
        assert!(Transpose::new(&[1, 0, 2, 3, 4]).is_ok());
    }
}
