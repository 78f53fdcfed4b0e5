//! 3-D convolution as vol2col plus matmul.
//!
//! Forward: unroll the input volume, multiply by the filter matrix with the
//! per-filter bias fused in, reshape to `[F, N, od, oh, ow]` and swap the
//! first two axes back to `[N, F, od, oh, ow]`. Backward runs the same
//! chain in reverse, folding the column gradient with col2vol.

use crate::device::Device;
use crate::error::{VoltError, VoltResult};
use crate::graph::GraphContext;
use crate::nn::Module;
use crate::ops::gemm::{Gemm, MatMul};
use crate::ops::transform::{conv_transpose_dim, Col2Vol, Dhw, Transpose, Vol2Col};
use crate::tensor::{init::Init, Format, Tensor};

/// 3-D convolution over `[N, C, D, H, W]` volumes.
pub struct Conv {
    num_filters: usize,
    kernel: Dhw,
    pad: Dhw,
    stride: Dhw,
    dilation: Dhw,
    use_bias: bool,
    vol2col: Vol2Col,
    col2vol: Option<Col2Vol>,
    gemm: Gemm,
    transpose: Transpose,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    grad_weight: Option<Tensor>,
    grad_bias: Option<Tensor>,
    batch: usize,
    channels: usize,
    registered: bool,
}

impl Conv {
    pub fn new(
        num_filters: usize,
        kernel: Dhw,
        pad: Dhw,
        stride: Dhw,
        dilation: Dhw,
        use_bias: bool,
    ) -> VoltResult<Self> {
        Ok(Self {
            num_filters,
            kernel,
            pad,
            stride,
            dilation,
            use_bias,
            vol2col: Vol2Col::new(kernel, pad, stride, dilation),
            col2vol: None,
            gemm: Gemm::new(1.0, 1.0),
            transpose: Transpose::new(&[1, 0, 2, 3, 4])?,
            weight: None,
            bias: None,
            grad_weight: None,
            grad_bias: None,
            batch: 0,
            channels: 0,
            registered: false,
        })
    }

    pub fn grad_weight(&self) -> Option<&Tensor> {
        self.grad_weight.as_ref()
    }

    pub fn grad_bias(&self) -> Option<&Tensor> {
        self.grad_bias.as_ref()
    }
}

impl Module for Conv {
    fn forward(
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
        self.batch = x.dim(0);
        self.channels = x.dim(1);
        let kernel_volume = self.channels * self.kernel.volume();

        let weight = match &self.weight {
            Some(w) => w.clone(),
            None => {
                let w = Tensor::from_init(
                    device,
                    Init::XavierUniform {
                        gain: 1.0,
                        fan_in: kernel_volume,
                        fan_out: self.num_filters,
                    },
                    &[self.num_filters, kernel_volume],
                );
                self.weight = Some(w.clone());
                w
            }
        };
        if self.use_bias && self.bias.is_none() {
            self.bias = Some(Tensor::zeros(device, &[self.num_filters], Format::Fp32));
        }

        graph.begin_sub_graph();
        let result = (|| {
            let col = self.vol2col.forward(device, graph, x)?;
            let bias = self.bias.clone();
            let mut y = self
                .gemm
                .forward(device, graph, &weight, &col, bias.as_ref())?;
            let out = self
                .vol2col
                .col_dims()
                .ok_or(VoltError::NotDispatched("vol2col"))?;
            y.reshape(&[self.num_filters, self.batch, out.d, out.h, out.w])?;
            self.transpose.forward(device, graph, &y)
        })();
        graph.end_sub_graph();
        let y = result?;

        if !self.registered {
            graph.register("conv", vec![x.id()], y.id());
            self.registered = true;
        }
        Ok(y)
    }

    fn backward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        dy: &Tensor,
    ) -> VoltResult<Tensor> {
        let col = self
            .vol2col
            .col_dims()
            .ok_or(VoltError::NotDispatched("conv"))?;

        graph.begin_sub_graph();
        let result = (|| {
            let mut dyt = self.transpose.backward(device, graph, dy)?;
            dyt.reshape(&[self.num_filters, self.batch * col.volume()])?;
            let (dw, dcol, db) = self.gemm.backward(device, graph, &dyt)?;
            self.grad_weight = Some(dw);
            if self.use_bias {
                self.grad_bias = Some(db);
            }
            let col2vol = self.col2vol.get_or_insert_with(|| {
                Col2Vol::new(self.channels, self.kernel, self.pad, self.stride, self.dilation)
            });
            col2vol.forward(device, graph, &dcol, self.batch, col)
        })();
        graph.end_sub_graph();
        result
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = Vec::new();
        if let Some(w) = &self.weight {
            params.push(w.clone());
        }
        if let Some(b) = &self.bias {
            params.push(b.clone());
        }
        params
    }
}

impl std::fmt::Debug for Conv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conv")
            .field("num_filters", &self.num_filters)
            .field("kernel", &self.kernel)
            .field("stride", &self.stride)
            .field("pad", &self.pad)
            .field("dilation", &self.dilation)
            .field("use_bias", &self.use_bias)
            .finish()
    }
}

/// Transposed 3-D convolution. The filter matrix is stored column-major
/// relative to [`Conv`] (`[C_out * kd*kh*kw, F_in]`) so the column matrix
/// falls out of a plain matmul and col2vol scatters it back to a volume.
/// Bias is not supported here.
pub struct ConvTranspose {
    out_channels: usize,
    kernel: Dhw,
    pad: Dhw,
    stride: Dhw,
    dilation: Dhw,
    transpose: Transpose,
    matmul: MatMul,
    col2vol: Option<Col2Vol>,
    weight: Option<Tensor>,
    registered: bool,
}

impl ConvTranspose {
    pub fn new(
        out_channels: usize,
        kernel: Dhw,
        pad: Dhw,
        stride: Dhw,
        dilation: Dhw,
    ) -> VoltResult<Self> {
        Ok(Self {
            out_channels,
            kernel,
            pad,
            stride,
            dilation,
            transpose: Transpose::new(&[1, 0, 2, 3, 4])?,
            matmul: MatMul::new(),
            col2vol: None,
            weight: None,
            registered: false,
        })
    }

    /// Output spatial extents for a given input extent.
    pub fn output_dims(&self, input: Dhw) -> Dhw {
        Dhw {
            d: conv_transpose_dim(input.d, self.kernel.d, self.pad.d, self.stride.d, self.dilation.d),
            h: conv_transpose_dim(input.h, self.kernel.h, self.pad.h, self.stride.h, self.dilation.h),
            w: conv_transpose_dim(input.w, self.kernel.w, self.pad.w, self.stride.w, self.dilation.w),
        }
    }
}

impl Module for ConvTranspose {
    fn forward(
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
        let (batch, in_channels) = (x.dim(0), x.dim(1));
        let input = Dhw {
            d: x.dim(2),
            h: x.dim(3),
            w: x.dim(4),
        };
        let rows = self.out_channels * self.kernel.volume();

        let weight = match &self.weight {
            Some(w) => w.clone(),
            None => {
                let w = Tensor::from_init(
                    device,
                    Init::XavierUniform {
                        gain: 1.0,
                        fan_in: in_channels,
                        fan_out: rows,
                    },
                    &[rows, in_channels],
                );
                self.weight = Some(w.clone());
                w
            }
        };

        graph.begin_sub_graph();
        let result = (|| {
            let mut xt = self.transpose.forward(device, graph, x)?;
            xt.reshape(&[in_channels, batch * input.volume()])?;
            let col = self.matmul.forward(device, graph, &weight, &xt)?;
            let col2vol = self.col2vol.get_or_insert_with(|| {
                Col2Vol::new(self.out_channels, self.kernel, self.pad, self.stride, self.dilation)
            });
            col2vol.forward(device, graph, &col, batch, input)
        })();
        graph.end_sub_graph();
        let y = result?;

        if !self.registered {
            graph.register("conv_transpose", vec![x.id()], y.id());
            self.registered = true;
        }
        Ok(y)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.weight.iter().cloned().collect()
    }
}
