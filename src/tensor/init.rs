//! Host-side tensor initializers.
//!
//! Initializers produce an fp32 host vector that [`crate::tensor::Tensor::from_init`]
//! uploads in one step.

use rand::Rng;

/// Weight initialization scheme.
#[derive(Debug, Clone, Copy)]
pub enum Init {
    /// Every element set to the given value.
    Constant(f32),
    /// Uniform in `[min, max)`.
    Uniform { min: f32, max: f32 },
    /// Gaussian with the given mean and standard deviation.
    Normal { mean: f32, std: f32 },
    /// Xavier/Glorot uniform: bound `gain * sqrt(6 / (fan_in + fan_out))`.
    XavierUniform {
        gain: f32,
        fan_in: usize,
        fan_out: usize,
    },
    /// Xavier/Glorot normal: std `gain * sqrt(2 / (fan_in + fan_out))`.
    XavierNormal {
        gain: f32,
        fan_in: usize,
        fan_out: usize,
    },
}

impl Init {
    /// Materialize `count` values.
    pub fn generate(&self, count: usize) -> Vec<f32> {
        match *self {
            Init::Constant(v) => vec![v; count],
            Init::Uniform { min, max } => uniform(count, min, max),
            Init::Normal { mean, std } => normal(count, mean, std),
            Init::XavierUniform { gain, fan_in, fan_out } => {
                let a = gain * (6.0 / (fan_in + fan_out) as f32).sqrt();
                uniform(count, -a, a)
            }
            Init::XavierNormal { gain, fan_in, fan_out } => {
                let std = gain * (2.0 / (fan_in + fan_out) as f32).sqrt();
                normal(count, 0.0, std)
            }
        }
    }
}

fn uniform(count: usize, min: f32, max: f32) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..count).map(|_| rng.gen_range(min..max)).collect()
}

/// Box-Muller transform over pairs of uniform draws.
fn normal(count: usize, mean: f32, std: f32) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
            mean + std * z
        })
        .collect()
}
