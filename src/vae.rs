//! Unconditional state VAE.
//!
//! Shares the trainer contract of the GANs (one `train_step` per batch, role-keyed
//! snapshots) but models single states rather than transitions. The loss is
//! `mean((decode(z) - x)^2) + kl_weight * KL(q(z|x) || N(0, I))`, with the KL term summed over
//! latent dimensions and averaged over the batch.

use burn_core as burn;

use burn::module::Module;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use burn_nn::{Linear, LinearConfig};
use burn_optim::adaptor::OptimizerAdaptor;
use burn_optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use ndarray::{Array2, ArrayView2};
use tracing::info;

use crate::config::VaeConfig;
use crate::latent::{array_to_tensor, scalar, tensor_to_array, LatentSampler};
use crate::layers::{DenseStage, Mode};
use crate::state::StateDict;
use crate::{must_be, Error, Result};

pub const ROLE_ENC: &str = "enc";
pub const ROLE_DEC: &str = "dec";

/// State -> `(mean, log-variance)`.
#[derive(Module, Debug)]
pub struct VaeEncoder<B: Backend> {
    hidden: DenseStage<B>,
    mean: Linear<B>,
    log_var: Linear<B>,
}

impl<B: Backend> VaeEncoder<B> {
    pub fn new(state_dim: usize, hidden: usize, latent_dim: usize, device: &B::Device) -> Self {
        Self {
            hidden: DenseStage::plain(state_dim, hidden, device),
            mean: LinearConfig::new(hidden, latent_dim).init(device),
            log_var: LinearConfig::new(hidden, latent_dim).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let h = self.hidden.forward(x, Mode::Train);
        (self.mean.forward(h.clone()), self.log_var.forward(h))
    }
}

/// Latent -> state.
#[derive(Module, Debug)]
pub struct VaeDecoder<B: Backend> {
    hidden: DenseStage<B>,
    out: Linear<B>,
}

impl<B: Backend> VaeDecoder<B> {
    pub fn new(latent_dim: usize, hidden: usize, state_dim: usize, device: &B::Device) -> Self {
        Self {
            hidden: DenseStage::plain(latent_dim, hidden, device),
            out: LinearConfig::new(hidden, state_dim).init(device),
        }
    }

    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        self.out.forward(self.hidden.forward(z, Mode::Train))
    }
}

#[derive(Module, Debug)]
pub struct StateVae<B: Backend> {
    pub enc: VaeEncoder<B>,
    pub dec: VaeDecoder<B>,
}

/// `KL(N(mean, exp(log_var)) || N(0, I))` per instance, `[batch]`.
pub fn kl_divergence<B: Backend>(mean: Tensor<B, 2>, log_var: Tensor<B, 2>) -> Tensor<B, 1> {
    let batch = mean.dims()[0];
    let inner = log_var.clone().add_scalar(1.0) - mean.powf_scalar(2.0) - log_var.exp();
    inner.sum_dim(1).mul_scalar(-0.5).reshape([batch])
}

pub struct VaeTrainer<B: AutodiffBackend> {
    vae: StateVae<B>,
    optim: OptimizerAdaptor<Adam, StateVae<B>, B>,
    sampler: LatentSampler,
    config: VaeConfig,
    state_dim: usize,
    mode: Mode,
    device: B::Device,
}

impl<B: AutodiffBackend> VaeTrainer<B> {
    pub fn new(config: &VaeConfig, state_dim: usize, seed: u64, device: &B::Device) -> Result<Self> {
        if state_dim == 0 || config.hidden == 0 || config.latent_dim == 0 {
            return Err(Error::Config(
                "state_dim, hidden and latent_dim must be >= 1".into(),
            ));
        }
        B::seed(device, seed);
        let vae = StateVae {
            enc: VaeEncoder::new(state_dim, config.hidden, config.latent_dim, device),
            dec: VaeDecoder::new(config.latent_dim, config.hidden, state_dim, device),
        };
        info!(state_dim, params = vae.num_params(), "built state VAE");
        Ok(Self {
            vae,
            optim: Self::adam(config),
            sampler: LatentSampler::new(seed),
            config: config.clone(),
            state_dim,
            mode: Mode::Train,
            device: device.clone(),
        })
    }

    pub fn from_state(
        config: &VaeConfig,
        state_dim: usize,
        seed: u64,
        state: &StateDict,
        device: &B::Device,
    ) -> Result<Self> {
        let mut trainer = Self::new(config, state_dim, seed, device)?;
        trainer.load_state(state)?;
        Ok(trainer)
    }

    fn adam(config: &VaeConfig) -> OptimizerAdaptor<Adam, StateVae<B>, B> {
        AdamConfig::new()
            .with_beta_1(config.beta_1)
            .with_beta_2(config.beta_2)
            .init()
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn model(&self) -> &StateVae<B> {
        &self.vae
    }

    /// No batch statistics in the VAE; recorded for the shared trainer contract.
    pub fn set_eval(&mut self, eval: bool) {
        self.mode = Mode::from_eval(eval);
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// One Adam step on `mse + kl_weight * kl`; returns the loss.
    pub fn train_step(&mut self, data: &ArrayView2<f32>) -> Result<f32> {
        must_be("data width", self.state_dim, data.ncols())?;
        let x = array_to_tensor::<B>(data, &self.device);
        let (mean, log_var) = self.vae.enc.forward(x.clone());
        let eps = self
            .sampler
            .normal([data.nrows(), self.config.latent_dim], 1.0, &self.device);
        let z = mean.clone() + log_var.clone().mul_scalar(0.5).exp() * eps;
        let recon = self.vae.dec.forward(z);
        let mse = (recon - x).powf_scalar(2.0).mean();
        let loss = mse + kl_divergence(mean, log_var)
            .mean()
            .mul_scalar(self.config.kl_weight);

        let value = scalar(loss.clone().detach())?;
        let grads = GradientsParams::from_grads(loss.backward(), &self.vae);
        self.vae = self.optim.step(self.config.lr, self.vae.clone(), grads);
        Ok(value)
    }

    /// Decode `n` fresh prior samples.
    pub fn sample(&mut self, n: usize) -> Result<Array2<f32>> {
        let z = self
            .sampler
            .normal([n, self.config.latent_dim], 1.0, &self.device);
        tensor_to_array(self.vae.dec.forward(z).detach())
    }

    /// Unconditional: one fresh sample per input row; the row contents are ignored.
    pub fn predict(&mut self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        self.sample(input.nrows())
    }

    /// Decode the posterior mean of each row.
    pub fn reconstruct(&self, data: &ArrayView2<f32>) -> Result<Array2<f32>> {
        must_be("data width", self.state_dim, data.ncols())?;
        let x = array_to_tensor::<B>(data, &self.device);
        let (mean, _) = self.vae.enc.forward(x);
        tensor_to_array(self.vae.dec.forward(mean).detach())
    }

    pub fn save_state(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        state.put_module::<B, _>(ROLE_ENC, self.vae.enc.clone())?;
        state.put_module::<B, _>(ROLE_DEC, self.vae.dec.clone())?;
        Ok(state)
    }

    pub fn load_state(&mut self, state: &StateDict) -> Result<()> {
        let enc = state.load_module::<B, _>(ROLE_ENC, self.vae.enc.clone(), &self.device)?;
        let dec = state.load_module::<B, _>(ROLE_DEC, self.vae.dec.clone(), &self.device)?;
        self.vae = StateVae { enc, dec };
        self.optim = Self::adam(&self.config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::tensor_to_vec;
    use crate::TrainBackend;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = TrainBackend;

    fn small() -> VaeConfig {
        VaeConfig {
            hidden: 16,
            latent_dim: 3,
            lr: 1e-2,
            ..VaeConfig::default()
        }
    }

    fn data(rows: usize, d: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, d), |(i, j)| ((i * d + j) as f32 * 0.37).cos())
    }

    #[test]
    fn kl_vanishes_at_the_prior() {
        let device = Default::default();
        let zeros = Tensor::<NdArray<f32>, 2>::zeros([4, 3], &device);
        let kl = tensor_to_vec(kl_divergence(zeros.clone(), zeros)).unwrap();
        assert!(kl.iter().all(|&v| v.abs() < 1e-7));

        // mean 1, var 1 in two dims: 0.5 * (1 + 1) = 1.
        let mean = Tensor::<NdArray<f32>, 2>::from_data(TensorData::new(vec![1.0f32, 1.0], [1, 2]), &device);
        let log_var = Tensor::<NdArray<f32>, 2>::zeros([1, 2], &device);
        let kl = tensor_to_vec(kl_divergence(mean, log_var)).unwrap();
        assert!((kl[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn training_reduces_loss_on_a_fixed_batch() {
        let device = Default::default();
        let mut t = VaeTrainer::<B>::new(&small(), 4, 3, &device).unwrap();
        let x = data(32, 4);
        let first = t.train_step(&x.view()).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = t.train_step(&x.view()).unwrap();
        }
        assert!(first.is_finite() && last.is_finite());
        assert!(last < first, "{last} !< {first}");
    }

    #[test]
    fn wrong_width_is_rejected() {
        let device = Default::default();
        let mut t = VaeTrainer::<B>::new(&small(), 4, 0, &device).unwrap();
        let r = t.train_step(&data(8, 5).view());
        assert!(matches!(r, Err(Error::DimMismatch { expected: 4, actual: 5, .. })));
    }

    #[test]
    fn predict_returns_one_fresh_sample_per_row() {
        let device = Default::default();
        let mut t = VaeTrainer::<B>::new(&small(), 4, 0, &device).unwrap();
        let a = t.predict(&data(6, 4).view()).unwrap();
        let b = t.predict(&data(6, 4).view()).unwrap();
        assert_eq!(a.dim(), (6, 4));
        assert_ne!(a, b);
    }

    #[test]
    fn snapshot_round_trip_reproduces_reconstructions() {
        let device = Default::default();
        let mut a = VaeTrainer::<B>::new(&small(), 4, 1, &device).unwrap();
        a.train_step(&data(8, 4).view()).unwrap();
        let state = a.save_state().unwrap();
        assert_eq!(state.roles().collect::<Vec<_>>(), vec![ROLE_DEC, ROLE_ENC]);
        let b = VaeTrainer::<B>::from_state(&small(), 4, 2, &state, &device).unwrap();
        let x = data(5, 4);
        assert_eq!(a.reconstruct(&x.view()).unwrap(), b.reconstruct(&x.view()).unwrap());
    }
}
