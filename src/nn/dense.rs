//! Fully connected layer.

use crate::device::Device;
use crate::error::{VoltError, VoltResult};
use crate::graph::GraphContext;
use crate::nn::Module;
use crate::ops::gemm::Gemm;
use crate::tensor::{init::Init, Format, Tensor};

/// Dense layer: `y = x W + b`, weight `[in_features, size]` created lazily
/// from the first input and initialized Xavier-uniform.
pub struct Dense {
    size: usize,
    use_bias: bool,
    gemm: Gemm,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    grad_weight: Option<Tensor>,
    grad_bias: Option<Tensor>,
    registered: bool,
}

impl Dense {
    pub fn new(size: usize, use_bias: bool) -> Self {
        Self {
            size,
            use_bias,
            gemm: Gemm::new(1.0, 1.0),
            weight: None,
            bias: None,
            grad_weight: None,
            grad_bias: None,
            registered: false,
        }
    }

    /// Weight gradient from the latest backward, if any.
    pub fn grad_weight(&self) -> Option<&Tensor> {
        self.grad_weight.as_ref()
    }

    pub fn grad_bias(&self) -> Option<&Tensor> {
        self.grad_bias.as_ref()
    }
}

impl Module for Dense {
    fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
    ) -> VoltResult<Tensor> {
        if x.ndim() < 2 {
            return Err(VoltError::RankMismatch {
                expected: 2,
                got: x.ndim(),
            });
        }
        let in_features = x.dim(x.ndim() - 1);

        let weight = match &self.weight {
            Some(w) => w.clone(),
            None => {
                let w = Tensor::from_init(
                    device,
                    Init::XavierUniform {
                        gain: 1.0,
                        fan_in: in_features,
                        fan_out: self.size,
                    },
                    &[in_features, self.size],
                );
                self.weight = Some(w.clone());
                w
            }
        };
        if self.use_bias && self.bias.is_none() {
            self.bias = Some(Tensor::zeros(device, &[self.size], Format::Fp32));
        }

        graph.begin_sub_graph();
        let bias = self.bias.clone();
        let y = self.gemm.forward(device, graph, x, &weight, bias.as_ref());
        graph.end_sub_graph();
        let y = y?;

        if !self.registered {
            graph.register("dense", vec![x.id()], y.id());
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
        graph.begin_sub_graph();
        let result = self.gemm.backward(device, graph, dy);
        graph.end_sub_graph();
        let (dx, dw, db) = result?;
        self.grad_weight = Some(dw);
        if self.use_bias {
            self.grad_bias = Some(db);
        }
        Ok(dx)
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

impl std::fmt::Debug for Dense {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dense")
            .field("size", &self.size)
            .field("use_bias", &self.use_bias)
            .finish()
    }
}
