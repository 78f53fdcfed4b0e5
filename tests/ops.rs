//! Operator-level integration tests. Each test acquires its own device and
//! skips silently when no GPU adapter is present.

use voltml::ops::activation::Activation;
use voltml::ops::gemm::{Gemm, MatMul};
use voltml::ops::math::{BinaryOp, CompareOp, UnaryOp, Xor};
use voltml::ops::transform::{Col2Vol, Dhw, Transpose, Vol2Col};
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
fn add_elementwise() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let a = Tensor::filled(&device, &[4, 4], 2.0);
    let b = Tensor::filled(&device, &[4, 4], 3.0);

    let mut add = BinaryOp::add();
    let y = add.forward(&device, &mut graph, &a, &b).unwrap();

    assert_eq!(y.shape(), &[4, 4]);
    assert_eq!(y.to_vec(&device).unwrap(), vec![5.0; 16]);
}

#[test]
fn pipeline_build_is_idempotent() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let a = Tensor::filled(&device, &[8], 1.0);
    let b = Tensor::filled(&device, &[8], 2.0);

    let mut add = BinaryOp::add();
    let y1 = add.forward(&device, &mut graph, &a, &b).unwrap();
    let y2 = add.forward(&device, &mut graph, &a, &b).unwrap();

    assert_eq!(add.build_count(), 1);
    assert_eq!(y1.id(), y2.id());
    assert_eq!(y2.to_vec(&device).unwrap(), vec![3.0; 8]);
}

#[test]
fn redispatch_with_new_size_is_rejected() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let a = Tensor::filled(&device, &[4, 4], 1.0);
    let b = Tensor::filled(&device, &[4, 4], 1.0);
    let small_a = Tensor::filled(&device, &[2, 2], 1.0);
    let small_b = Tensor::filled(&device, &[2, 2], 1.0);

    let mut add = BinaryOp::add();
    add.forward(&device, &mut graph, &a, &b).unwrap();
    let err = add
        .forward(&device, &mut graph, &small_a, &small_b)
        .unwrap_err();

    assert!(matches!(
        err,
        VoltError::PipelineFrozen {
            built_for: 16,
            got: 4
        }
    ));
}

#[test]
fn comparisons_produce_bool_tensors() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::from_f32(&device, &[1.0, 5.0, 3.0], &[3]).unwrap();
    let w = Tensor::from_f32(&device, &[3.0, 3.0, 3.0], &[3]).unwrap();

    let mut lt = CompareOp::lt();
    let y = lt.forward(&device, &mut graph, &x, &w).unwrap();
    assert_eq!(y.format(), Format::Bool);
    assert_eq!(y.to_vec_u32(&device), vec![1, 0, 0]);

    let mut ge = CompareOp::ge();
    let y = ge.forward(&device, &mut graph, &x, &w).unwrap();
    assert_eq!(y.format(), Format::Bool);
    assert_eq!(y.to_vec_u32(&device), vec![0, 1, 1]);
}

#[test]
fn xor_requires_bool_inputs() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[4], 1.0);
    let w = Tensor::filled(&device, &[4], 0.0);
    let mut xor = Xor::new();
    let err = xor.forward(&device, &mut graph, &x, &w).unwrap_err();
    assert!(matches!(err, VoltError::FormatMismatch { .. }));

    // Bool inputs produced by comparisons are accepted.
    let a = Tensor::from_f32(&device, &[1.0, 1.0, 0.0, 0.0], &[4]).unwrap();
    let b = Tensor::from_f32(&device, &[1.0, 0.0, 1.0, 0.0], &[4]).unwrap();
    let one = Tensor::filled(&device, &[4], 1.0);

    let ba = CompareOp::eq().forward(&device, &mut graph, &a, &one).unwrap();
    let bb = CompareOp::eq().forward(&device, &mut graph, &b, &one).unwrap();
    let y = xor.forward(&device, &mut graph, &ba, &bb).unwrap();
    assert_eq!(y.format(), Format::Bool);
    assert_eq!(y.to_vec_u32(&device), vec![0, 1, 1, 0]);
}

#[test]
fn reshape_rejects_count_mismatch() {
    let Some(device) = gpu() else { return };
    let mut t = Tensor::filled(&device, &[4, 4], 0.0);

    let err = t.reshape(&[5, 5]).unwrap_err();
    assert!(matches!(
        err,
        VoltError::CountMismatch { have: 16, want: 25 }
    ));
    t.reshape(&[2, 8]).unwrap();
    assert_eq!(t.shape(), &[2, 8]);
}

#[test]
fn unary_math_values() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::from_f32(&device, &[1.0, 4.0, 9.0, 16.0], &[4]).unwrap();
    let mut sqrt = UnaryOp::sqrt();
    let y = sqrt.forward(&device, &mut graph, &x).unwrap();
    assert_eq!(y.to_vec(&device).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    let x = Tensor::from_f32(&device, &[-2.0, -0.5, 0.5, 2.0], &[4]).unwrap();
    let mut abs = UnaryOp::abs();
    let y = abs.forward(&device, &mut graph, &x).unwrap();
    assert_eq!(y.to_vec(&device).unwrap(), vec![2.0, 0.5, 0.5, 2.0]);
}

#[test]
fn relu_and_backward() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::from_f32(&device, &[-1.0, 0.0, 2.0, -3.0], &[4]).unwrap();
    let mut relu = Activation::relu();
    let y = relu.forward(&device, &mut graph, &x).unwrap();
    assert_eq!(y.to_vec(&device).unwrap(), vec![0.0, 0.0, 2.0, 0.0]);

    let dy = Tensor::filled(&device, &[4], 1.0);
    let dx = relu.backward(&device, &mut graph, &dy).unwrap();
    assert_eq!(dx.to_vec(&device).unwrap(), vec![0.0, 0.0, 1.0, 0.0]);
}

#[test]
fn rrelu_slope_is_sampled_once() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::from_f32(&device, &[-4.0, -2.0, 1.0, 3.0], &[4]).unwrap();
    let mut rrelu = voltml::ops::activation::RRelu::new(0.1, 0.3);

    let first = rrelu.forward(&device, &mut graph, &x).unwrap().to_vec(&device).unwrap();
    // Positive inputs pass through, negative ones shrink by a slope in range.
    assert_eq!(first[2], 1.0);
    assert_eq!(first[3], 3.0);
    for (got, x_val) in first[..2].iter().zip([-4.0f32, -2.0]) {
        let slope = got / x_val;
        assert!((0.1..0.3).contains(&slope), "slope {slope} out of range");
    }

    // The slope tensor persists, so a repeat run reproduces the output.
    let second = rrelu.forward(&device, &mut graph, &x).unwrap().to_vec(&device).unwrap();
    assert_eq!(second, first);
}

#[test]
fn transpose_swaps_leading_axes() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let shape = [2usize, 3, 2, 2, 2];
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count).map(|v| v as f32).collect();
    let x = Tensor::from_f32(&device, &data, &shape).unwrap();

    let mut transpose = Transpose::new(&[1, 0, 2, 3, 4]).unwrap();
    let y = transpose.forward(&device, &mut graph, &x).unwrap();
    assert_eq!(y.shape(), &[3, 2, 2, 2, 2]);

    let got = y.to_vec(&device).unwrap();
    let inner = 2 * 2 * 2;
    for a in 0..2 {
        for b in 0..3 {
            for r in 0..inner {
                let src = (a * 3 + b) * inner + r;
                let dst = (b * 2 + a) * inner + r;
                assert_eq!(got[dst], data[src], "mismatch at a={a} b={b} r={r}");
            }
        }
    }

    // The inverse mapping restores the original layout.
    let back = transpose.backward(&device, &mut graph, &y).unwrap();
    assert_eq!(back.shape(), &shape);
    assert_eq!(back.to_vec(&device).unwrap(), data);
}

#[test]
fn vol2col_unrolls_five_cube() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[1, 1, 5, 5, 5], 1.0);
    let mut vol2col = Vol2Col::new(Dhw::cube(3), Dhw::cube(0), Dhw::cube(1), Dhw::cube(1));
    let col = vol2col.forward(&device, &mut graph, &x).unwrap();

    assert_eq!(col.shape(), &[27, 27]);
    assert_eq!(vol2col.col_dims(), Some(Dhw::cube(3)));
    // No padding, so every window sample is in bounds.
    assert_eq!(col.to_vec(&device).unwrap(), vec![1.0; 27 * 27]);
}

#[test]
fn col2vol_restores_volume_extents() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let col = Tensor::filled(&device, &[27, 27], 1.0);
    let mut col2vol = Col2Vol::new(1, Dhw::cube(3), Dhw::cube(0), Dhw::cube(1), Dhw::cube(1));
    let vol = col2vol
        .forward(&device, &mut graph, &col, 1, Dhw::cube(3))
        .unwrap();

    assert_eq!(vol.shape(), &[1, 1, 5, 5, 5]);
    let got = vol.to_vec(&device).unwrap();
    // The center voxel is covered by every kernel offset, the corner by one.
    let center = 2 * 25 + 2 * 5 + 2;
    assert_eq!(got[center], 27.0);
    assert_eq!(got[0], 1.0);
}

#[test]
fn matmul_known_values() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::from_f32(&device, &[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let w = Tensor::from_f32(&device, &[5.0, 6.0, 7.0, 8.0], &[2, 2]).unwrap();

    let mut matmul = MatMul::new();
    let y = matmul.forward(&device, &mut graph, &x, &w).unwrap();
    assert_eq!(y.shape(), &[2, 2]);
    assert_eq!(y.to_vec(&device).unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
}

#[test]
fn gemm_shapes_and_batch() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[2, 2, 3], 1.0);
    let w = Tensor::filled(&device, &[3, 4], 2.0);

    let mut gemm = Gemm::new(1.0, 0.0);
    let y = gemm.forward(&device, &mut graph, &x, &w, None).unwrap();
    assert_eq!(y.shape(), &[2, 2, 4]);
    assert_eq!(y.to_vec(&device).unwrap(), vec![6.0; 16]);
}

#[test]
fn gemm_fuses_bias() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[2, 3], 1.0);
    let w = Tensor::filled(&device, &[3, 2], 1.0);
    let bias = Tensor::from_f32(&device, &[10.0, 20.0], &[2]).unwrap();

    let mut gemm = Gemm::new(1.0, 1.0);
    let y = gemm
        .forward(&device, &mut graph, &x, &w, Some(&bias))
        .unwrap();
    assert_eq!(y.to_vec(&device).unwrap(), vec![13.0, 23.0, 13.0, 23.0]);
}

#[test]
fn gemm_rejects_inner_dim_mismatch() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let x = Tensor::filled(&device, &[2, 3], 1.0);
    let w = Tensor::filled(&device, &[4, 5], 1.0);

    let mut gemm = Gemm::new(1.0, 0.0);
    let err = gemm.forward(&device, &mut graph, &x, &w, None).unwrap_err();
    assert!(matches!(err, VoltError::ShapeMismatch { .. }));
}

#[test]
fn gemm_backward_gradients() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    // y = x.w with x = [[1, 2]], w = [[1, 0], [0, 1]] (identity).
    let x = Tensor::from_f32(&device, &[1.0, 2.0], &[1, 2]).unwrap();
    let w = Tensor::from_f32(&device, &[1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();

    let mut matmul = MatMul::new();
    matmul.forward(&device, &mut graph, &x, &w).unwrap();

    let dy = Tensor::filled(&device, &[1, 2], 1.0);
    let (dx, dw) = matmul.backward(&device, &mut graph, &dy).unwrap();

    // dx = dy . w^T = [[1, 1]]
    assert_eq!(dx.to_vec(&device).unwrap(), vec![1.0, 1.0]);
    // dw = x^T . dy = [[1, 1], [2, 2]]
    assert_eq!(dw.to_vec(&device).unwrap(), vec![1.0, 1.0, 2.0, 2.0]);
}

#[test]
fn duplicate_copies_storage() {
    let Some(device) = gpu() else { return };

    let a = Tensor::from_f32(&device, &[1.0, 2.0, 3.0], &[3]).unwrap();
    let b = a.duplicate(&device);

    assert_ne!(a.id(), b.id());
    assert_eq!(b.to_vec(&device).unwrap(), vec![1.0, 2.0, 3.0]);

    // Writes to the copy leave the original alone.
    b.write_data(&device, bytemuck::cast_slice(&[9.0f32, 9.0, 9.0]));
    assert_eq!(a.to_vec(&device).unwrap(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn graph_records_operator_edges() {
    let Some(device) = gpu() else { return };
    let mut graph = GraphContext::new();

    let a = Tensor::filled(&device, &[4], 1.0);
    let b = Tensor::filled(&device, &[4], 2.0);
    let d = Tensor::filled(&device, &[4], 3.0);

    let mut add = BinaryOp::add();
    let mut mul = BinaryOp::mul();
    let c = add.forward(&device, &mut graph, &a, &b).unwrap();
    let e = mul.forward(&device, &mut graph, &c, &d).unwrap();

    assert_eq!(graph.producer_of(c.id()), Some(0));
    assert_eq!(graph.producer_of(e.id()), Some(1));
    assert_eq!(graph.execution_order(), vec![0, 1]);
    assert_eq!(e.to_vec(&device).unwrap(), vec![9.0; 4]);
}
