//! Single-timestep recurrent cells.
//!
//! A cell reads a slice of the input sequence, the previous hidden state and
//! the weight blocks for one (direction, layer), and writes one timestep of
//! output plus the next hidden state. All slicing happens through push-
//! constant offsets, so sequences and stacked weights live in single
//! concatenated tensors and the sequence loop stays on the host (see
//! [`crate::nn`]).

use crate::device::Device;
use crate::dispatch::{group_count, DispatchUnit, LOCAL_SIZE_2D};
use crate::error::VoltResult;
use crate::graph::GraphContext;
use crate::tensor::Tensor;

const RNN: &str = include_str!("../shaders/rnn.wgsl");

/// Push constants for the cell kernels. Offsets are element indices into
/// the corresponding bound tensors.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RnnParam {
    pub input_size: u32,
    pub hidden_size: u32,
    pub output_size: u32,
    pub in_off: u32,
    pub out_off: u32,
    pub h_off: u32,
    pub u_off: u32,
    pub w_off: u32,
    pub v_off: u32,
    pub b1_off: u32,
    pub b2_off: u32,
}

/// Element offsets for one cell invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellOffsets {
    pub input: usize,
    pub output: usize,
    pub hidden: usize,
    pub u: usize,
    pub w: usize,
    pub v: usize,
    pub b1: usize,
    pub b2: usize,
}

/// Tensors bound by a vanilla RNN or GRU cell, in binding order.
pub struct CellState<'a> {
    pub u: &'a Tensor,
    pub v: &'a Tensor,
    pub w: &'a Tensor,
    pub x: &'a Tensor,
    pub h: &'a Tensor,
    pub b1: &'a Tensor,
    pub b2: &'a Tensor,
    pub y: &'a Tensor,
    pub hn: &'a Tensor,
}

fn cell_param(
    input_size: usize,
    hidden_size: usize,
    output_size: usize,
    off: CellOffsets,
) -> RnnParam {
    RnnParam {
        input_size: input_size as u32,
        hidden_size: hidden_size as u32,
        output_size: output_size as u32,
        in_off: off.input as u32,
        out_off: off.output as u32,
        h_off: off.hidden as u32,
        u_off: off.u as u32,
        w_off: off.w as u32,
        v_off: off.v as u32,
        b1_off: off.b1 as u32,
        b2_off: off.b2 as u32,
    }
}

fn cell_groups(device: &Device, hidden_size: usize, output_size: usize) -> [u32; 3] {
    let max = device.max_workgroups_per_dim();
    [
        group_count(hidden_size as u32, LOCAL_SIZE_2D, max),
        group_count(output_size.max(1) as u32, LOCAL_SIZE_2D, max),
        1,
    ]
}

macro_rules! simple_cell {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $entry:literal) => {
        $(#[$meta])*
        pub struct $name {
            unit: DispatchUnit,
            input_size: usize,
            hidden_size: usize,
            output_size: usize,
            registered: bool,
        }

        impl $name {
            pub fn new(input_size: usize, hidden_size: usize, output_size: usize) -> Self {
                Self {
                    unit: DispatchUnit::new($kind),
                    input_size,
                    hidden_size,
                    output_size,
                    registered: false,
                }
            }

            /// One fenced cell dispatch at the given offsets.
            pub fn forward(
                &mut self,
                device: &Device,
                graph: &mut GraphContext,
                s: &CellState<'_>,
                off: CellOffsets,
            ) -> VoltResult<()> {
                if !self.unit.is_built() {
                    self.unit
                        .set_groups(cell_groups(device, self.hidden_size, self.output_size));
                    self.unit.build(
                        device,
                        RNN,
                        $entry,
                        9,
                        std::mem::size_of::<RnnParam>() as u32,
                    );
                }
                if !self.registered {
                    graph.register($kind, vec![s.x.id(), s.h.id()], s.y.id());
                    self.registered = true;
                }
                let param =
                    cell_param(self.input_size, self.hidden_size, self.output_size, off);
                self.unit.dispatch(
                    device,
                    &[
                        s.u.buffer(),
                        s.v.buffer(),
                        s.w.buffer(),
                        s.x.buffer(),
                        s.h.buffer(),
                        s.b1.buffer(),
                        s.b2.buffer(),
                        s.y.buffer(),
                        s.hn.buffer(),
                    ],
                    bytemuck::bytes_of(&param),
                )
            }

            pub fn build_count(&self) -> u32 {
                self.unit.build_count()
            }
        }
    };
}

simple_cell! {
    /// Vanilla RNN cell: `hn = tanh(U x + W h + b1)`, `y = V hn + b2`.
    RnnCell, "rnn_cell", "rnn_cell"
}

simple_cell! {
    /// GRU cell. Gate blocks z, r, n occupy consecutive `hidden_size` row
    /// bands of U, W and b1.
    GruCell, "gru_cell", "gru_cell"
}

/// LSTM cell. Gate blocks i, f, g, o occupy consecutive `hidden_size` row
/// bands of U, W and b1; the cell state rides in two extra bindings.
pub struct LstmCell {
    unit: DispatchUnit,
    input_size: usize,
    hidden_size: usize,
    output_size: usize,
    registered: bool,
}

impl LstmCell {
    pub fn new(input_size: usize, hidden_size: usize, output_size: usize) -> Self {
        Self {
            unit: DispatchUnit::new("lstm_cell"),
            input_size,
            hidden_size,
            output_size,
            registered: false,
        }
    }

    pub fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        s: &CellState<'_>,
        c: &Tensor,
        cn: &Tensor,
        off: CellOffsets,
    ) -> VoltResult<()> {
        if !self.unit.is_built() {
            self.unit
                .set_groups(cell_groups(device, self.hidden_size, self.output_size));
            self.unit.build(
                device,
                RNN,
                "lstm_cell",
                11,
                std::mem::size_of::<RnnParam>() as u32,
            );
        }
        if !self.registered {
            graph.register("lstm_cell", vec![s.x.id(), s.h.id(), c.id()], s.y.id());
            self.registered = true;
        }
        let param = cell_param(self.input_size, self.hidden_size, self.output_size, off);
        self.unit.dispatch(
            device,
            &[
                s.u.buffer(),
                s.v.buffer(),
                s.w.buffer(),
                s.x.buffer(),
                s.h.buffer(),
                c.buffer(),
                s.b1.buffer(),
                s.b2.buffer(),
                s.y.buffer(),
                s.hn.buffer(),
                cn.buffer(),
            ],
            bytemuck::bytes_of(&param),
        )
    }

    pub fn build_count(&self) -> u32 {
        self.unit.build_count()
    }
}
