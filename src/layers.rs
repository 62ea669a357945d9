//! Building blocks shared by the dense (1D) networks.
//!
//! Normalization layers are the only stateful pieces: in [`Mode::Train`] they normalize by
//! batch statistics and fold them into their running averages; in [`Mode::Eval`] they use the
//! running averages and change nothing. The mode is an explicit argument so a trainer can
//! switch all of its networks at once.

use burn_core as burn;

use burn::module::{Initializer, Module};
use burn::tensor::activation::leaky_relu;
use burn::tensor::{backend::Backend, Tensor};
use burn_nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig};

/// Negative slope of every LeakyReLU in the crate.
pub const LEAKY_SLOPE: f64 = 0.2;

/// Train/eval switch for normalization statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

impl Mode {
    pub fn from_eval(eval: bool) -> Self {
        if eval {
            Mode::Eval
        } else {
            Mode::Train
        }
    }
}

/// Initializer applied to normalization layers only (dense layers keep burn's default).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormInit {
    pub gamma_mean: f64,
    pub gamma_std: f64,
    pub beta: f64,
}

impl Default for NormInit {
    fn default() -> Self {
        Self {
            gamma_mean: 1.0,
            gamma_std: 0.02,
            beta: 0.0,
        }
    }
}

impl NormInit {
    pub fn batch_norm<B: Backend>(&self, features: usize, device: &B::Device) -> BatchNorm<B> {
        let mut norm = BatchNormConfig::new(features).init(device);
        norm.gamma = Initializer::Normal {
            mean: self.gamma_mean,
            std: self.gamma_std,
        }
        .init([features], device);
        norm.beta = Initializer::Constant { value: self.beta }.init([features], device);
        norm
    }
}

/// Batch norm over `[batch, features]` with an explicit mode.
pub fn batch_norm_forward<B: Backend>(
    norm: &BatchNorm<B>,
    x: Tensor<B, 2>,
    mode: Mode,
) -> Tensor<B, 2> {
    let [_, features] = x.dims();
    let device = x.device();
    let (mean, var) = match mode {
        Mode::Train => {
            let mean = x.clone().mean_dim(0);
            let var = (x.clone() - mean.clone()).powf_scalar(2.0).mean_dim(0);
            let m = norm.momentum;
            let running_mean = norm
                .running_mean
                .value_sync()
                .to_device(&device)
                .mul_scalar(1.0 - m)
                + mean.clone().detach().reshape([features]).mul_scalar(m);
            let running_var = norm
                .running_var
                .value_sync()
                .to_device(&device)
                .mul_scalar(1.0 - m)
                + var.clone().detach().reshape([features]).mul_scalar(m);
            norm.running_mean.update(running_mean.detach());
            norm.running_var.update(running_var.detach());
            (mean, var)
        }
        Mode::Eval => (
            norm.running_mean
                .value_sync()
                .to_device(&device)
                .reshape([1, features]),
            norm.running_var
                .value_sync()
                .to_device(&device)
                .reshape([1, features]),
        ),
    };
    let std = var.add_scalar(norm.epsilon).sqrt();
    (x - mean) / std * norm.gamma.val().reshape([1, features])
        + norm.beta.val().reshape([1, features])
}

/// Fold pending running-statistic updates into the stored values, so module visitors and
/// records see what eval mode uses.
pub fn sync_running_stats<B: Backend>(norm: &BatchNorm<B>) {
    norm.running_mean.value_sync();
    norm.running_var.value_sync();
}

/// Affine map from a condition vector into a hidden width, injected at every depth.
#[derive(Module, Debug)]
pub struct CondEncoder<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> CondEncoder<B> {
    pub fn new(cond_dim: usize, dim_out: usize, device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(cond_dim, dim_out).init(device),
        }
    }

    pub fn forward(&self, cond: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(cond)
    }
}

/// `leaky_relu(norm(linear(x)))`, with the norm optional.
///
/// A normalized stage drops the linear bias: the batch mean would cancel it.
#[derive(Module, Debug)]
pub struct DenseStage<B: Backend> {
    linear: Linear<B>,
    norm: Option<BatchNorm<B>>,
}

impl<B: Backend> DenseStage<B> {
    pub fn plain(d_in: usize, d_out: usize, device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(d_in, d_out).init(device),
            norm: None,
        }
    }

    pub fn normed(d_in: usize, d_out: usize, init: &NormInit, device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(d_in, d_out)
                .with_bias(false)
                .init(device),
            norm: Some(init.batch_norm(d_out, device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>, mode: Mode) -> Tensor<B, 2> {
        let h = self.linear.forward(x);
        let h = match &self.norm {
            Some(norm) => batch_norm_forward(norm, h, mode),
            None => h,
        };
        leaky_relu(h, LEAKY_SLOPE)
    }

    pub fn sync_running_stats(&self) {
        if let Some(norm) = &self.norm {
            sync_running_stats(norm);
        }
    }
}
