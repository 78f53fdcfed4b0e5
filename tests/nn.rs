//! Composite-module integration tests. Weights are randomly initialized,
//! so value assertions stick to cases a zero input makes deterministic.

use voltml::nn::{Conv, ConvTranspose, Dense, Gru, Lstm, Rnn};
use voltml::ops::transform::Dhw;
use voltml::prelude::*;

fn gpu() -> Option<Device> {
    let _ = env_logger::builder().is_test(true).try_init();
    match Device::new() {
        Ok(d) => Some(d),
        Err(e) => {
            eprintln!("skipping GPU test: {e}");
            None
        }
    }
}

#[test]
fn dense_forward_shape_and_graph() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[4, 8], 1.0);
    let mut dense = Dense::new(16, true);
    let y = dense.forward(&device, &mut graph, &x).unwrap();

    assert_eq!(y.shape(), &[4, 16]);
    // Weight [8, 16] plus bias [16].
    assert_eq!(dense.num_parameters(), 8 * 16 + 16);

    // The inner gemm is hidden inside a sub-graph; one "dense" node is
    // visible at the top level.
    let top: Vec<_> = graph.nodes().iter().filter(|n| !n.sub_graph).collect();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].kind, "dense");
    assert_eq!(top[0].output_id, y.id());
    assert_eq!(graph.execution_order(), vec![top[0].index]);
}

#[test]
fn dense_zero_input_yields_zero_output() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[2, 3], 0.0);
    let mut dense = Dense::new(4, false);
    let y = dense.forward(&device, &mut graph, &x).unwrap();

    assert_eq!(y.shape(), &[2, 4]);
    assert_eq!(y.to_vec(&device).unwrap(), vec![0.0; 8]);
}

#[test]
fn dense_backward_shapes() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[2, 3], 1.0);
    let mut dense = Dense::new(4, true);
    dense.forward(&device, &mut graph, &x).unwrap();

    let dy = Tensor::filled(&device, &[2, 4], 1.0);
    let dx = dense.backward(&device, &mut graph, &dy).unwrap();

    assert_eq!(dx.shape(), &[2, 3]);
    assert_eq!(dense.grad_weight().unwrap().shape(), &[3, 4]);
    assert_eq!(dense.grad_bias().unwrap().shape(), &[4]);
}

#[test]
fn conv_forward_shape_and_graph() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[1, 1, 5, 5, 5], 1.0);
    let mut conv = Conv::new(
        2,
        Dhw::cube(3),
        Dhw::cube(0),
        Dhw::cube(1),
        Dhw::cube(1),
        true,
    )
    .unwrap();
    let y = conv.forward(&device, &mut graph, &x).unwrap();

    assert_eq!(y.shape(), &[1, 2, 3, 3, 3]);
    // Weight [2, 27] plus bias [2].
    assert_eq!(conv.num_parameters(), 2 * 27 + 2);

    let top: Vec<_> = graph.nodes().iter().filter(|n| !n.sub_graph).collect();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].kind, "conv");
}

#[test]
fn conv_zero_input_yields_zero_output() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[1, 1, 5, 5, 5], 0.0);
    let mut conv = Conv::new(
        2,
        Dhw::cube(3),
        Dhw::cube(0),
        Dhw::cube(1),
        Dhw::cube(1),
        false,
    )
    .unwrap();
    let y = conv.forward(&device, &mut graph, &x).unwrap();

    assert_eq!(y.to_vec(&device).unwrap(), vec![0.0; 2 * 27]);
}

#[test]
fn conv_backward_shapes() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[1, 1, 5, 5, 5], 1.0);
    let mut conv = Conv::new(
        2,
        Dhw::cube(3),
        Dhw::cube(0),
        Dhw::cube(1),
        Dhw::cube(1),
        true,
    )
    .unwrap();
    let y = conv.forward(&device, &mut graph, &x).unwrap();

    let dy = Tensor::filled(&device, y.shape(), 1.0);
    let dx = conv.backward(&device, &mut graph, &dy).unwrap();

    assert_eq!(dx.shape(), &[1, 1, 5, 5, 5]);
    assert_eq!(conv.grad_weight().unwrap().shape(), &[2, 27]);
    assert_eq!(conv.grad_bias().unwrap().shape(), &[2]);
}

#[test]
fn conv_transpose_expands_volume() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[1, 2, 3, 3, 3], 1.0);
    let mut deconv = ConvTranspose::new(
        3,
        Dhw::cube(3),
        Dhw::cube(0),
        Dhw::cube(1),
        Dhw::cube(1),
    )
    .unwrap();

    assert_eq!(deconv.output_dims(Dhw::cube(3)), Dhw::cube(5));
    let y = deconv.forward(&device, &mut graph, &x).unwrap();
    assert_eq!(y.shape(), &[1, 3, 5, 5, 5]);
}

#[test]
fn rnn_output_shape_and_determinism() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let data: Vec<f32> = (0..12).map(|v| v as f32 * 0.1).collect();
    let x = Tensor::from_f32(&device, &data, &[3, 4]).unwrap();

    let mut rnn = Rnn::new(5, 1, 2, false);
    let y1 = rnn.forward(&device, &mut graph, &x).unwrap();
    assert_eq!(y1.shape(), &[3, 2]);

    // Hidden state resets every call, so a repeat run reproduces the output.
    let first = y1.to_vec(&device).unwrap();
    let y2 = rnn.forward(&device, &mut graph, &x).unwrap();
    assert_eq!(y2.to_vec(&device).unwrap(), first);
}

#[test]
fn rnn_zero_input_yields_zero_output() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    // Biases start at zero, so tanh pre-activations and outputs stay zero.
    let x = Tensor::filled(&device, &[3, 4], 0.0);
    let mut rnn = Rnn::new(5, 2, 2, false);
    let y = rnn.forward(&device, &mut graph, &x).unwrap();
    assert_eq!(y.to_vec(&device).unwrap(), vec![0.0; 6]);
}

#[test]
fn rnn_rejects_changed_sequence() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[3, 4], 0.5);
    let longer = Tensor::filled(&device, &[5, 4], 0.5);

    let mut rnn = Rnn::new(4, 1, 2, false);
    rnn.forward(&device, &mut graph, &x).unwrap();
    let err = rnn.forward(&device, &mut graph, &longer).unwrap_err();
    assert!(matches!(err, VoltError::PipelineFrozen { .. }));

    let flat = Tensor::filled(&device, &[4], 0.5);
    let err = rnn.forward(&device, &mut graph, &flat).unwrap_err();
    assert!(matches!(err, VoltError::RankMismatch { .. }));
}

#[test]
fn lstm_bidirectional_output_width() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[3, 4], 0.25);
    let mut lstm = Lstm::new(4, 2, 3, true);
    let y = lstm.forward(&device, &mut graph, &x).unwrap();

    assert_eq!(y.shape(), &[3, 6]);
    assert!(lstm.num_parameters() > 0);

    let top: Vec<_> = graph.nodes().iter().filter(|n| !n.sub_graph).collect();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].kind, "lstm");
}

#[test]
fn gru_stacked_forward() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let data: Vec<f32> = (0..15).map(|v| (v as f32 * 0.3).sin()).collect();
    let x = Tensor::from_f32(&device, &data, &[5, 3]).unwrap();

    let mut gru = Gru::new(6, 3, 2, false);
    let y = gru.forward(&device, &mut graph, &x).unwrap();

    assert_eq!(y.shape(), &[5, 2]);
    // GRU gate outputs are bounded, so the readback must be finite.
    assert!(y.to_vec(&device).unwrap().iter().all(|v| v.is_finite()));
}
