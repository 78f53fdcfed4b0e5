//! GPU operators.
//!
//! [`PipelineOp`] is the shared harness under every primitive operator: it
//! owns a [`DispatchUnit`], a push-constant param block, a cached output
//! tensor and an optional lazily built derivative. The pipeline is built on
//! the first dispatch and frozen to that problem size; a later call with a
//! different element count is an error rather than a silent rebuild.

pub mod activation;
pub mod gemm;
pub mod math;
pub mod rnn;
pub mod transform;

use crate::buffer::DeviceBuffer;
use crate::device::Device;
use crate::dispatch::{group_count, DispatchUnit, LOCAL_SIZE_1D};
use crate::error::{VoltError, VoltResult};
use crate::graph::GraphContext;
use crate::tensor::{Format, Tensor};

/// Push-constant block for a kernel family. The harness stamps the element
/// count in on the first dispatch.
pub trait PushParam: bytemuck::Pod {
    fn set_total(&mut self, total: u32);
}

/// A WGSL source plus the entry point to compile.
#[derive(Clone, Copy)]
pub struct KernelRef {
    pub source: &'static str,
    pub entry: &'static str,
}

/// Generic operator harness: one pipeline, one param block, one cached
/// output set, one optional derivative.
pub struct PipelineOp<P: PushParam> {
    kind: &'static str,
    unit: DispatchUnit,
    param: P,
    forward: KernelRef,
    backward: Option<KernelRef>,
    out_format: Format,
    preset_groups: Option<[u32; 3]>,
    outputs: Vec<Tensor>,
    saved: Vec<Tensor>,
    frozen_count: Option<usize>,
    derivative: Option<Box<PipelineOp<P>>>,
    registered: bool,
}

impl<P: PushParam> PipelineOp<P> {
    pub fn new(kind: &'static str, forward: KernelRef) -> Self {
        Self {
            kind,
            unit: DispatchUnit::new(kind),
            param: P::zeroed(),
            forward,
            backward: None,
            out_format: Format::Fp32,
            preset_groups: None,
            outputs: Vec::new(),
            saved: Vec::new(),
            frozen_count: None,
            derivative: None,
            registered: false,
        }
    }

    pub fn with_backward(mut self, backward: KernelRef) -> Self {
        self.backward = Some(backward);
        self
    }

    pub fn with_out_format(mut self, format: Format) -> Self {
        self.out_format = format;
        self
    }

    pub fn param_mut(&mut self) -> &mut P {
        &mut self.param
    }

    pub fn param(&self) -> &P {
        &self.param
    }

    /// Override the default 1-D dispatch geometry. Takes effect on the
    /// build that happens at the next (first) dispatch.
    pub fn set_groups(&mut self, groups: [u32; 3]) {
        self.preset_groups = Some(groups);
    }

    /// Pipeline build counter, exposed for idempotence checks.
    pub fn build_count(&self) -> u32 {
        self.unit.build_count()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Input tensors saved by the latest forward dispatch.
    pub(crate) fn saved(&self, index: usize) -> Option<&Tensor> {
        self.saved.get(index)
    }

    /// Unary dispatch: bindings `[x, y]`, output shaped like `x`.
    pub fn forward_unary(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
    ) -> VoltResult<Tensor> {
        let shape = x.shape().to_vec();
        let mut out = self.run(device, graph, &[x], &[&shape])?;
        Ok(out.swap_remove(0))
    }

    /// Binary dispatch: bindings `[x, w, y]`, output shaped like `x`.
    pub fn forward_binary(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
        w: &Tensor,
    ) -> VoltResult<Tensor> {
        let shape = x.shape().to_vec();
        let mut out = self.run(device, graph, &[x, w], &[&shape])?;
        Ok(out.swap_remove(0))
    }

    /// Dispatch with an explicit output shape, e.g. for transpose or gemm.
    pub fn forward_shaped(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        inputs: &[&Tensor],
        out_shape: &[usize],
    ) -> VoltResult<Tensor> {
        let mut out = self.run(device, graph, inputs, &[out_shape])?;
        Ok(out.swap_remove(0))
    }

    /// Backward for unary operators: derivative bindings `[x, dy, dx]`.
    pub fn backward_unary(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        dy: &Tensor,
    ) -> VoltResult<Tensor> {
        let x = match self.saved.first() {
            Some(t) => t.clone(),
            None => return Err(VoltError::NotDispatched(self.kind)),
        };
        let d = self
            .derivative
            .as_mut()
            .ok_or(VoltError::NoBackward(self.kind))?;
        let shape = x.shape().to_vec();
        let mut out = d.run(device, graph, &[&x, dy], &[&shape])?;
        Ok(out.swap_remove(0))
    }

    /// Backward for binary operators: derivative bindings
    /// `[x, w, dy, dx, dw]`. Returns `(dx, dw)`.
    pub fn backward_binary(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        dy: &Tensor,
    ) -> VoltResult<(Tensor, Tensor)> {
        let (x, w) = match (self.saved.first(), self.saved.get(1)) {
            (Some(x), Some(w)) => (x.clone(), w.clone()),
            _ => return Err(VoltError::NotDispatched(self.kind)),
        };
        let d = self
            .derivative
            .as_mut()
            .ok_or(VoltError::NoBackward(self.kind))?;
        let x_shape = x.shape().to_vec();
        let w_shape = w.shape().to_vec();
        let mut out = d.run(device, graph, &[&x, &w, dy], &[&x_shape, &w_shape])?;
        let dw = out.swap_remove(1);
        let dx = out.swap_remove(0);
        Ok((dx, dw))
    }

    pub(crate) fn derivative_mut(&mut self) -> Option<&mut PipelineOp<P>> {
        self.derivative.as_deref_mut()
    }

    /// Core dispatch path. Bindings are `inputs` followed by one output per
    /// entry of `out_shapes`; outputs are allocated once and reused.
    pub(crate) fn run(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        inputs: &[&Tensor],
        out_shapes: &[&[usize]],
    ) -> VoltResult<Vec<Tensor>> {
        let total = inputs[0].count();
        if let Some(built_for) = self.frozen_count {
            if built_for != total {
                return Err(VoltError::PipelineFrozen {
                    built_for,
                    got: total,
                });
            }
        }

        if self.outputs.is_empty() {
            for shape in out_shapes {
                self.outputs
                    .push(Tensor::zeros(device, shape, self.out_format));
            }
        }

        if !self.unit.is_built() {
            self.param.set_total(total as u32);
            let groups = self.preset_groups.unwrap_or([
                group_count(total as u32, LOCAL_SIZE_1D, device.max_workgroups_per_dim()),
                1,
                1,
            ]);
            self.unit.set_groups(groups);
            let binding_count = (inputs.len() + out_shapes.len()) as u32;
            self.unit.build(
                device,
                self.forward.source,
                self.forward.entry,
                binding_count,
                std::mem::size_of::<P>() as u32,
            );
            self.frozen_count = Some(total);

            if let Some(backward) = self.backward {
                if self.derivative.is_none() {
                    let mut d = PipelineOp::new(backward.entry, backward);
                    d.param = self.param;
                    self.derivative = Some(Box::new(d));
                }
            }
        }

        if !self.registered {
            graph.register(
                self.kind,
                inputs.iter().map(|t| t.id()).collect(),
                self.outputs[0].id(),
            );
            self.registered = true;
        }

        self.saved = inputs.iter().map(|t| (*t).clone()).collect();

        let mut buffers: Vec<&DeviceBuffer> = inputs.iter().map(|t| t.buffer()).collect();
        buffers.extend(self.outputs.iter().map(|t| t.buffer()));
        self.unit
            .dispatch(device, &buffers, bytemuck::bytes_of(&self.param))?;

        Ok(self.outputs.clone())
    }
}
