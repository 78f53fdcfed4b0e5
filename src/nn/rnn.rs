//! Recurrent sequence modules.
//!
//! The host drives the sequence: for every direction, layer and timestep it
//! dispatches one cell with fresh offsets into the concatenated input,
//! weight and output tensors. Weights for all (direction, layer) blocks of
//! one kind live in a single tensor; offset vectors computed at build time
//! locate each block.

use crate::device::Device;
use crate::error::{VoltError, VoltResult};
use crate::graph::GraphContext;
use crate::nn::Module;
use crate::ops::rnn::{CellOffsets, CellState, GruCell, LstmCell, RnnCell};
use crate::tensor::{init::Init, Format, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Rnn,
    Lstm,
    Gru,
}

impl CellKind {
    /// Row-band multiplier of U, W and b1: one band per gate.
    fn gates(&self) -> usize {
        match self {
            CellKind::Rnn => 1,
            CellKind::Lstm => 4,
            CellKind::Gru => 3,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CellKind::Rnn => "rnn",
            CellKind::Lstm => "lstm",
            CellKind::Gru => "gru",
        }
    }
}

enum AnyCell {
    Rnn(RnnCell),
    Lstm(LstmCell),
    Gru(GruCell),
}

/// Concatenated weight tensors plus per-block element offsets.
struct StackedWeights {
    u: Tensor,
    w: Tensor,
    v: Tensor,
    b1: Tensor,
    b2: Tensor,
    u_offs: Vec<usize>,
    w_offs: Vec<usize>,
    v_offs: Vec<usize>,
    b1_offs: Vec<usize>,
    b2_offs: Vec<usize>,
}

struct Recurrent {
    kind: CellKind,
    hidden_size: usize,
    num_layers: usize,
    output_size: usize,
    bidirectional: bool,
    input_size: usize,
    seq_len: usize,
    cells: Vec<AnyCell>,
    weights: Option<StackedWeights>,
    inter: Vec<Tensor>,
    y: Option<Tensor>,
    h: Option<(Tensor, Tensor)>,
    c: Option<(Tensor, Tensor)>,
    registered: bool,
}

impl Recurrent {
    fn new(
        kind: CellKind,
        hidden_size: usize,
        num_layers: usize,
        output_size: usize,
        bidirectional: bool,
    ) -> Self {
        Self {
            kind,
            hidden_size,
            num_layers,
            output_size,
            bidirectional,
            input_size: 0,
            seq_len: 0,
            cells: Vec::new(),
            weights: None,
            inter: Vec::new(),
            y: None,
            h: None,
            c: None,
            registered: false,
        }
    }

    fn directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// Input width feeding layer `l`.
    fn layer_input(&self, l: usize) -> usize {
        if l == 0 {
            self.input_size
        } else {
            self.hidden_size
        }
    }

    /// Output width produced by layer `l`.
    fn layer_output(&self, l: usize) -> usize {
        if l == self.num_layers - 1 {
            self.output_size
        } else {
            self.hidden_size
        }
    }

    fn build(&mut self, device: &Device, seq_len: usize, input_size: usize) {
        self.seq_len = seq_len;
        self.input_size = input_size;
        let dirs = self.directions();
        let gates = self.kind.gates();
        let h = self.hidden_size;

        let mut u_data = Vec::new();
        let mut w_data = Vec::new();
        let mut v_data = Vec::new();
        let mut b1_data = Vec::new();
        let mut b2_data = Vec::new();
        let mut u_offs = Vec::new();
        let mut w_offs = Vec::new();
        let mut v_offs = Vec::new();
        let mut b1_offs = Vec::new();
        let mut b2_offs = Vec::new();

        for _dir in 0..dirs {
            for l in 0..self.num_layers {
                let in_l = self.layer_input(l);
                let out_l = self.layer_output(l);

                u_offs.push(u_data.len());
                w_offs.push(w_data.len());
                v_offs.push(v_data.len());
                b1_offs.push(b1_data.len());
                b2_offs.push(b2_data.len());

                let xavier = |fan_in: usize, fan_out: usize, count: usize| {
                    Init::XavierUniform {
                        gain: 1.0,
                        fan_in,
                        fan_out,
                    }
                    .generate(count)
                };
                u_data.extend(xavier(in_l, h, gates * h * in_l));
                w_data.extend(xavier(h, h, gates * h * h));
                v_data.extend(xavier(h, out_l, out_l * h));
                b1_data.extend(std::iter::repeat(0.0).take(gates * h));
                b2_data.extend(std::iter::repeat(0.0).take(out_l));

                let cell = match self.kind {
                    CellKind::Rnn => AnyCell::Rnn(RnnCell::new(in_l, h, out_l)),
                    CellKind::Lstm => AnyCell::Lstm(LstmCell::new(in_l, h, out_l)),
                    CellKind::Gru => AnyCell::Gru(GruCell::new(in_l, h, out_l)),
                };
                self.cells.push(cell);
            }
        }

        let upload = |data: &[f32]| Tensor::from_bytes(
            device,
            bytemuck::cast_slice(data),
            &[data.len()],
            Format::Fp32,
        );
        self.weights = Some(StackedWeights {
            u: upload(&u_data),
            w: upload(&w_data),
            v: upload(&v_data),
            b1: upload(&b1_data),
            b2: upload(&b2_data),
            u_offs,
            w_offs,
            v_offs,
            b1_offs,
            b2_offs,
        });

        for _dir in 0..dirs {
            for _l in 0..self.num_layers.saturating_sub(1) {
                self.inter
                    .push(Tensor::zeros(device, &[seq_len, h], Format::Fp32));
            }
        }
        self.y = Some(Tensor::zeros(
            device,
            &[seq_len, dirs * self.output_size],
            Format::Fp32,
        ));

        let state_shape = [dirs * self.num_layers, h];
        self.h = Some((
            Tensor::zeros(device, &state_shape, Format::Fp32),
            Tensor::zeros(device, &state_shape, Format::Fp32),
        ));
        if self.kind == CellKind::Lstm {
            self.c = Some((
                Tensor::zeros(device, &state_shape, Format::Fp32),
                Tensor::zeros(device, &state_shape, Format::Fp32),
            ));
        }
    }

    fn reset_state(&self, device: &Device) {
        let zero = |t: &Tensor| {
            let bytes = vec![0u8; t.size_in_bytes() as usize];
            t.write_data(device, &bytes);
        };
        if let Some((a, b)) = &self.h {
            zero(a);
            zero(b);
        }
        if let Some((a, b)) = &self.c {
            zero(a);
            zero(b);
        }
    }

    fn forward(
        &mut self,
        device: &Device,
        graph: &mut GraphContext,
        x: &Tensor,
    ) -> VoltResult<Tensor> {
        if x.ndim() != 2 {
            return Err(VoltError::RankMismatch {
                expected: 2,
                got: x.ndim(),
            });
        }
        let (seq_len, input_size) = (x.dim(0), x.dim(1));

        if self.y.is_none() {
            self.build(device, seq_len, input_size);
        } else if seq_len != self.seq_len || input_size != self.input_size {
            return Err(VoltError::PipelineFrozen {
                built_for: self.seq_len * self.input_size,
                got: x.count(),
            });
        }
        self.reset_state(device);

        let (wu, wv, ww, wb1, wb2, u_offs, w_offs, v_offs, b1_offs, b2_offs) =
            match &self.weights {
                Some(w) => (
                    w.u.clone(),
                    w.v.clone(),
                    w.w.clone(),
                    w.b1.clone(),
                    w.b2.clone(),
                    w.u_offs.clone(),
                    w.w_offs.clone(),
                    w.v_offs.clone(),
                    w.b1_offs.clone(),
                    w.b2_offs.clone(),
                ),
                None => return Err(VoltError::NotDispatched(self.kind.name())),
            };
        let y = match &self.y {
            Some(y) => y.clone(),
            None => return Err(VoltError::NotDispatched(self.kind.name())),
        };

        let dirs = self.directions();
        let layers = self.num_layers;
        let h_size = self.hidden_size;
        let out_size = self.output_size;

        graph.begin_sub_graph();
        let result = (|| {
            for dir in 0..dirs {
                for l in 0..layers {
                    let bi = dir * layers + l;
                    let last = l == layers - 1;
                    let src: Tensor = if l == 0 {
                        x.clone()
                    } else {
                        self.inter[dir * (layers - 1) + l - 1].clone()
                    };
                    let dst: Tensor = if last {
                        y.clone()
                    } else {
                        self.inter[dir * (layers - 1) + l].clone()
                    };
                    let in_w = if l == 0 { input_size } else { h_size };
                    let out_l = if last { out_size } else { h_size };

                    let (mut h_cur, mut h_nxt) = match &self.h {
                        Some((a, b)) => (a.clone(), b.clone()),
                        None => return Err(VoltError::NotDispatched(self.kind.name())),
                    };
                    let (mut c_cur, mut c_nxt) = match &self.c {
                        Some((a, b)) => (a.clone(), b.clone()),
                        None => (h_cur.clone(), h_nxt.clone()),
                    };

                    for t in 0..seq_len {
                        let t_eff = if dir == 1 { seq_len - 1 - t } else { t };
                        let off = CellOffsets {
                            input: t_eff * in_w,
                            output: if last {
                                t_eff * dirs * out_size + dir * out_size
                            } else {
                                t_eff * h_size
                            },
                            hidden: bi * h_size,
                            u: u_offs[bi],
                            w: w_offs[bi],
                            v: v_offs[bi],
                            b1: b1_offs[bi],
                            b2: b2_offs[bi],
                        };
                        let state = CellState {
                            u: &wu,
                            v: &wv,
                            w: &ww,
                            x: &src,
                            h: &h_cur,
                            b1: &wb1,
                            b2: &wb2,
                            y: &dst,
                            hn: &h_nxt,
                        };
                        match &mut self.cells[bi] {
                            AnyCell::Rnn(cell) => cell.forward(device, graph, &state, off)?,
                            AnyCell::Gru(cell) => cell.forward(device, graph, &state, off)?,
                            AnyCell::Lstm(cell) => {
                                cell.forward(device, graph, &state, &c_cur, &c_nxt, off)?
                            }
                        }
                        std::mem::swap(&mut h_cur, &mut h_nxt);
                        std::mem::swap(&mut c_cur, &mut c_nxt);
                    }
                }
            }
            Ok(())
        })();
        graph.end_sub_graph();
        result?;

        if !self.registered {
            graph.register(self.kind.name(), vec![x.id()], y.id());
            self.registered = true;
        }
        Ok(y)
    }

    fn parameters(&self) -> Vec<Tensor> {
        match &self.weights {
            Some(w) => vec![
                w.u.clone(),
                w.w.clone(),
                w.v.clone(),
                w.b1.clone(),
                w.b2.clone(),
            ],
            None => Vec::new(),
        }
    }
}

macro_rules! recurrent_module {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        pub struct $name {
            inner: Recurrent,
        }

        impl $name {
            /// Input width is inferred from the first forward; `x` is
            /// `[seq_len, input_size]` and the output is
            /// `[seq_len, directions * output_size]`.
            pub fn new(
                hidden_size: usize,
                num_layers: usize,
                output_size: usize,
                bidirectional: bool,
            ) -> Self {
                Self {
                    inner: Recurrent::new(
                        $kind,
                        hidden_size,
                        num_layers,
                        output_size,
                        bidirectional,
                    ),
                }
            }
        }

        impl Module for $name {
            fn forward(
                &mut self,
                device: &Device,
                graph: &mut GraphContext,
                x: &Tensor,
            ) -> VoltResult<Tensor> {
                self.inner.forward(device, graph, x)
            }

            fn parameters(&self) -> Vec<Tensor> {
                self.inner.parameters()
            }
        }
    };
}

recurrent_module! {
    /// Stacked, optionally bidirectional vanilla RNN.
    Rnn, CellKind::Rnn
}

recurrent_module! {
    /// Stacked, optionally bidirectional LSTM.
    Lstm, CellKind::Lstm
}

recurrent_module! {
    /// Stacked, optionally bidirectional GRU.
    Gru, CellKind::Gru
}
