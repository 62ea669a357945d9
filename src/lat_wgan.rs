//! 1D latent conditional WGAN.
//!
//! Critic `D(x, c)`: four dense stages (stages 2-4 batch-normalized), each followed by a fresh
//! condition injection, then a dense head collapsing to one bias-free scalar.
//!
//! Generator `G(z1, z2, c) = c + f(z1, z2, c)`: the network predicts a displacement from the
//! condition, so condition and state must share a width. `z2` enters at the second stage only.
//!
//! One [`LatentGanTrainer::train_step`] is one critic update followed by one generator update:
//!
//! - critic: `mean(penalty) + mean(D(real)) - mean(D(fake))` with the endpoint penalty summed
//!   over the configured schedule (by default two mixtures and six segments);
//! - generator: `mean(D(G(z, c)))`.

use burn_core as burn;

use burn::module::Module;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use burn_nn::{Linear, LinearConfig};
use burn_optim::adaptor::OptimizerAdaptor;
use burn_optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use ndarray::{Array2, ArrayView2};
use tracing::info;

use crate::config::LatWganConfig;
use crate::latent::{array_to_tensor, scalar, tensor_to_array, LatentSampler};
use crate::layers::{CondEncoder, DenseStage, Mode, NormInit};
use crate::penalty::{endpoint_penalty, Metric, PenaltyEngine};
use crate::state::StateDict;
use crate::{must_be, Error, Result};

/// Role names used in snapshots.
pub const ROLE_DISC: &str = "disc";
pub const ROLE_GEN: &str = "gen";

/// Dense conditional critic.
#[derive(Module, Debug)]
pub struct Discriminator1d<B: Backend> {
    stages: Vec<DenseStage<B>>,
    cond_encs: Vec<CondEncoder<B>>,
    head: DenseStage<B>,
    out: Linear<B>,
}

impl<B: Backend> Discriminator1d<B> {
    pub fn new(state_dim: usize, cond_dim: usize, ndf: usize, device: &B::Device) -> Self {
        let init = NormInit::default();
        let stages = vec![
            DenseStage::plain(state_dim, ndf, device),
            DenseStage::normed(ndf, ndf, &init, device),
            DenseStage::normed(ndf, ndf, &init, device),
            DenseStage::normed(ndf, ndf, &init, device),
        ];
        let cond_encs = (0..stages.len())
            .map(|_| CondEncoder::new(cond_dim, ndf, device))
            .collect();
        Self {
            stages,
            cond_encs,
            head: DenseStage::plain(ndf, ndf, device),
            out: LinearConfig::new(ndf, 1).with_bias(false).init(device),
        }
    }

    /// Scores, `[batch]`.
    pub fn forward(&self, x: Tensor<B, 2>, cond: Tensor<B, 2>, mode: Mode) -> Tensor<B, 1> {
        let batch = x.dims()[0];
        let mut h = x;
        for (stage, enc) in self.stages.iter().zip(&self.cond_encs) {
            h = stage.forward(h, mode) + enc.forward(cond.clone());
        }
        self.out.forward(self.head.forward(h, mode)).reshape([batch])
    }

    pub fn sync_running_stats(&self) {
        self.stages.iter().for_each(DenseStage::sync_running_stats);
        self.head.sync_running_stats();
    }
}

/// Residual conditional generator.
#[derive(Module, Debug)]
pub struct Generator1d<B: Backend> {
    stage_1: DenseStage<B>,
    cond_enc_1: CondEncoder<B>,
    stage_2: DenseStage<B>,
    cond_enc_2: CondEncoder<B>,
    lat_enc_2: DenseStage<B>,
    stage_3: DenseStage<B>,
    cond_enc_3: CondEncoder<B>,
    out: Linear<B>,
}

impl<B: Backend> Generator1d<B> {
    pub fn new(state_dim: usize, cond_dim: usize, nz: usize, ngf: usize, device: &B::Device) -> Self {
        let init = NormInit::default();
        Self {
            stage_1: DenseStage::normed(nz, ngf, &init, device),
            cond_enc_1: CondEncoder::new(cond_dim, ngf, device),
            stage_2: DenseStage::normed(ngf, ngf, &init, device),
            cond_enc_2: CondEncoder::new(cond_dim, ngf, device),
            lat_enc_2: DenseStage::normed(nz, ngf, &init, device),
            stage_3: DenseStage::normed(ngf, ngf, &init, device),
            cond_enc_3: CondEncoder::new(cond_dim, ngf, device),
            out: LinearConfig::new(ngf, state_dim).with_bias(false).init(device),
        }
    }

    pub fn forward(
        &self,
        z1: Tensor<B, 2>,
        z2: Tensor<B, 2>,
        cond: Tensor<B, 2>,
        mode: Mode,
    ) -> Tensor<B, 2> {
        let y1 = self.stage_1.forward(z1, mode) + self.cond_enc_1.forward(cond.clone());
        let y2 = self.stage_2.forward(y1, mode)
            + self.cond_enc_2.forward(cond.clone())
            + self.lat_enc_2.forward(z2, mode);
        let y3 = self.stage_3.forward(y2, mode) + self.cond_enc_3.forward(cond.clone());
        cond + self.out.forward(y3)
    }

    pub fn sync_running_stats(&self) {
        for stage in [&self.stage_1, &self.stage_2, &self.lat_enc_2, &self.stage_3] {
            stage.sync_running_stats();
        }
    }
}

/// Trainer owning one critic, one generator and an Adam optimizer for each.
pub struct LatentGanTrainer<B: AutodiffBackend> {
    disc: Discriminator1d<B>,
    gen: Generator1d<B>,
    optim_d: OptimizerAdaptor<Adam, Discriminator1d<B>, B>,
    optim_g: OptimizerAdaptor<Adam, Generator1d<B>, B>,
    sampler: LatentSampler,
    engine: PenaltyEngine,
    config: LatWganConfig,
    state_dim: usize,
    mode: Mode,
    device: B::Device,
}

impl<B: AutodiffBackend> LatentGanTrainer<B> {
    /// Fresh networks with normalization layers initialized by [`NormInit`].
    pub fn new(
        config: &LatWganConfig,
        state_dim: usize,
        cond_dim: usize,
        seed: u64,
        device: &B::Device,
    ) -> Result<Self> {
        if state_dim != cond_dim {
            return Err(Error::Config(format!(
                "residual generator needs cond_dim == state_dim, got {cond_dim} vs {state_dim}"
            )));
        }
        if state_dim == 0 {
            return Err(Error::Config("state_dim must be >= 1".into()));
        }
        config.penalty.validate()?;
        B::seed(device, seed);
        let disc = Discriminator1d::new(state_dim, cond_dim, config.ndf, device);
        let gen = Generator1d::new(state_dim, cond_dim, config.nz, config.ngf, device);
        info!(
            state_dim,
            disc_params = disc.num_params(),
            gen_params = gen.num_params(),
            "built 1D latent GAN"
        );
        Ok(Self {
            disc,
            gen,
            optim_d: Self::adam(config),
            optim_g: Self::adam(config),
            sampler: LatentSampler::new(seed),
            engine: PenaltyEngine::new(config.k_l, config.penalty),
            config: config.clone(),
            state_dim,
            mode: Mode::Train,
            device: device.clone(),
        })
    }

    /// Rebuild from a snapshot; optimizers start fresh.
    pub fn from_state(
        config: &LatWganConfig,
        state_dim: usize,
        cond_dim: usize,
        seed: u64,
        state: &StateDict,
        device: &B::Device,
    ) -> Result<Self> {
        let mut trainer = Self::new(config, state_dim, cond_dim, seed, device)?;
        trainer.load_state(state)?;
        Ok(trainer)
    }

    fn adam<M: burn::module::AutodiffModule<B>>(config: &LatWganConfig) -> OptimizerAdaptor<Adam, M, B> {
        AdamConfig::new()
            .with_beta_1(config.beta_1)
            .with_beta_2(config.beta_2)
            .init()
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn discriminator(&self) -> &Discriminator1d<B> {
        &self.disc
    }

    pub fn generator(&self) -> &Generator1d<B> {
        &self.gen
    }

    /// Switch both networks between batch and running normalization statistics.
    pub fn set_eval(&mut self, eval: bool) {
        self.disc.sync_running_stats();
        self.gen.sync_running_stats();
        self.mode = Mode::from_eval(eval);
    }

    /// Fresh `(z1, z2)`, each `[batch, nz]`.
    pub fn get_latents(&mut self, batch: usize) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let nz = self.config.nz;
        let z1 = self.sampler.normal([batch, nz], 1.0, &self.device);
        let z2 = self.sampler.normal([batch, nz], 1.0, &self.device);
        (z1, z2)
    }

    fn check_cond(&self, cond: &Tensor<B, 2>) -> Result<usize> {
        let [batch, width] = cond.dims();
        must_be("condition width", self.state_dim, width)?;
        Ok(batch)
    }

    /// Sample next states for a batch of conditions.
    pub fn generate(&mut self, cond: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let batch = self.check_cond(&cond)?;
        let (z1, z2) = self.get_latents(batch);
        Ok(self.gen.forward(z1, z2, cond, self.mode))
    }

    /// Per-instance penalty for one segment under the RMS metric.
    pub fn endpoint_penalty(
        &self,
        x1: Tensor<B, 2>,
        x2: Tensor<B, 2>,
        y1: Tensor<B, 1>,
        y2: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        endpoint_penalty(Metric::Crow, x1, x2, y1, y2, self.config.k_l)
    }

    /// One critic update; returns the critic loss.
    pub fn disc_step(&mut self, real: Tensor<B, 2>, cond: Tensor<B, 2>) -> Result<f32> {
        let batch = self.check_cond(&cond)?;
        let [real_batch, width] = real.dims();
        must_be("data batch", batch, real_batch)?;
        must_be("data width", self.state_dim, width)?;

        let fake = self.generate(cond.clone())?.detach();
        let mut samples = vec![real, fake];
        for _ in 0..self.engine.schedule.interpolants {
            let mix = self
                .sampler
                .interpolate(samples[0].clone(), samples[1].clone());
            samples.push(mix);
        }
        let scores: Vec<Tensor<B, 1>> = samples
            .iter()
            .map(|x| self.disc.forward(x.clone(), cond.clone(), self.mode))
            .collect();
        let penalty = self.engine.total(Metric::Crow, &samples, &scores)?;
        let loss = penalty.mean() + scores[0].clone().mean() - scores[1].clone().mean();

        let value = scalar(loss.clone().detach())?;
        let grads = GradientsParams::from_grads(loss.backward(), &self.disc);
        self.disc = self.optim_d.step(self.config.lr_d, self.disc.clone(), grads);
        Ok(value)
    }

    /// One generator update; returns the generator loss.
    pub fn gen_step(&mut self, cond: Tensor<B, 2>) -> Result<f32> {
        let fake = self.generate(cond.clone())?;
        let loss = self.disc.forward(fake, cond, self.mode).mean();

        let value = scalar(loss.clone().detach())?;
        let grads = GradientsParams::from_grads(loss.backward(), &self.gen);
        self.gen = self.optim_g.step(self.config.lr_g, self.gen.clone(), grads);
        Ok(value)
    }

    /// Critic step then generator step on one batch; returns `(loss_d, loss_g)`.
    pub fn train_step(&mut self, data: &ArrayView2<f32>, cond: &ArrayView2<f32>) -> Result<(f32, f32)> {
        let real = array_to_tensor::<B>(data, &self.device);
        let cond = array_to_tensor::<B>(cond, &self.device);
        let loss_d = self.disc_step(real, cond.clone())?;
        let loss_g = self.gen_step(cond)?;
        Ok((loss_d, loss_g))
    }

    /// Sample next states without touching any gradient state.
    pub fn predict(&mut self, cond: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let cond = array_to_tensor::<B>(cond, &self.device);
        tensor_to_array(self.generate(cond)?.detach())
    }

    pub fn save_state(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        state.put_module::<B, _>(ROLE_DISC, self.disc.clone())?;
        state.put_module::<B, _>(ROLE_GEN, self.gen.clone())?;
        Ok(state)
    }

    /// Load both networks; optimizer moments restart from zero.
    pub fn load_state(&mut self, state: &StateDict) -> Result<()> {
        let disc = state.load_module::<B, _>(ROLE_DISC, self.disc.clone(), &self.device)?;
        let gen = state.load_module::<B, _>(ROLE_GEN, self.gen.clone(), &self.device)?;
        self.disc = disc;
        self.gen = gen;
        self.optim_d = Self::adam(&self.config);
        self.optim_g = Self::adam(&self.config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::tensor_to_vec;
    use crate::TrainBackend;
    use burn::module::{ModuleVisitor, Param};
    use burn::tensor::TensorData;
    use ndarray::Array2;

    type B = TrainBackend;

    fn small_config() -> LatWganConfig {
        LatWganConfig {
            nz: 8,
            ngf: 16,
            ndf: 16,
            ..LatWganConfig::default()
        }
    }

    struct CollectFloats(Vec<Vec<f32>>);

    impl<B: Backend> ModuleVisitor<B> for CollectFloats {
        fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
            self.0.push(tensor_to_vec(param.val()).unwrap());
        }
    }

    fn floats<M: Module<B>>(m: &M) -> Vec<Vec<f32>> {
        let mut c = CollectFloats(Vec::new());
        m.visit(&mut c);
        c.0
    }

    fn batch(n: usize, d: usize, phase: f32) -> Array2<f32> {
        Array2::from_shape_fn((n, d), |(i, k)| ((i * d + k) as f32 * 0.37 + phase).sin())
    }

    #[test]
    fn mismatched_widths_are_config_errors() {
        let device = Default::default();
        let r = LatentGanTrainer::<B>::new(&small_config(), 3, 2, 0, &device);
        assert!(matches!(r, Err(Error::Config(_))));
    }

    #[test]
    fn zeroed_residual_branch_returns_condition() {
        let device = Default::default();
        let mut trainer = LatentGanTrainer::<B>::new(&small_config(), 3, 3, 1, &device).unwrap();
        let mut gen = trainer.gen.clone();
        gen.out.weight = gen.out.weight.map(|w| w.zeros_like());
        let cond = batch(5, 3, 0.1);
        let (z1, z2) = trainer.get_latents(5);
        let y = gen.forward(z1, z2, array_to_tensor(&cond.view(), &device), Mode::Train);
        assert_eq!(tensor_to_array(y).unwrap(), cond);
    }

    #[test]
    fn eval_mode_passes_are_identical() {
        let device = Default::default();
        let mut trainer = LatentGanTrainer::<B>::new(&small_config(), 3, 3, 2, &device).unwrap();
        trainer.train_step(&batch(8, 3, 0.0).view(), &batch(8, 3, 1.0).view()).unwrap();
        trainer.set_eval(true);
        let x = array_to_tensor::<B>(&batch(8, 3, 0.5).view(), &device);
        let c = array_to_tensor::<B>(&batch(8, 3, 0.7).view(), &device);
        let before = floats(&trainer.disc);
        let a = tensor_to_vec(trainer.disc.forward(x.clone(), c.clone(), trainer.mode())).unwrap();
        let b = tensor_to_vec(trainer.disc.forward(x, c, trainer.mode())).unwrap();
        assert_eq!(a, b);
        assert_eq!(before, floats(&trainer.disc));
    }

    #[test]
    fn train_mode_moves_running_statistics() {
        let device = Default::default();
        let trainer = LatentGanTrainer::<B>::new(&small_config(), 3, 3, 2, &device).unwrap();
        let before = floats(&trainer.disc);
        let x = array_to_tensor::<B>(&batch(8, 3, 0.5).view(), &device);
        let c = array_to_tensor::<B>(&batch(8, 3, 0.7).view(), &device);
        let _ = trainer.disc.forward(x.clone(), c.clone(), Mode::Train);
        trainer.disc.sync_running_stats();
        let after_train = floats(&trainer.disc);
        assert_ne!(before, after_train);

        // Eval passes read the statistics folded in above and leave them alone.
        let a = tensor_to_vec(trainer.disc.forward(x.clone(), c.clone(), Mode::Eval)).unwrap();
        let b = tensor_to_vec(trainer.disc.forward(x, c, Mode::Eval)).unwrap();
        assert_eq!(a, b);
        assert_eq!(after_train, floats(&trainer.disc));
    }

    #[test]
    fn one_step_moves_every_parameter() {
        let device = Default::default();
        let mut trainer = LatentGanTrainer::<B>::new(&small_config(), 3, 3, 3, &device).unwrap();
        let disc_before = floats(&trainer.disc);
        let gen_before = floats(&trainer.gen);

        let (loss_d, loss_g) = trainer
            .train_step(&batch(8, 3, 0.0).view(), &batch(8, 3, 2.0).view())
            .unwrap();
        assert!(loss_d.is_finite() && loss_g.is_finite());

        for (i, (a, b)) in disc_before.iter().zip(floats(&trainer.disc)).enumerate() {
            assert_ne!(a, &b, "critic tensor {i} did not move");
        }
        for (i, (a, b)) in gen_before.iter().zip(floats(&trainer.gen)).enumerate() {
            assert_ne!(a, &b, "generator tensor {i} did not move");
        }
    }

    #[test]
    fn critic_loss_is_penalty_plus_score_gap() {
        let device = Default::default();
        let config = LatWganConfig {
            k_l: 1e-3,
            ..small_config()
        };
        let mut trainer = LatentGanTrainer::<B>::new(&config, 3, 3, 6, &device).unwrap();
        let real = array_to_tensor::<B>(&batch(8, 3, 0.0).view(), &device);
        let cond = array_to_tensor::<B>(&batch(8, 3, 1.3).view(), &device);

        // Replay the step's draws on copies of the sampler and networks.
        let mut sampler = trainer.sampler.clone();
        let z1: Tensor<B, 2> = sampler.normal([8, config.nz], 1.0, &device);
        let z2: Tensor<B, 2> = sampler.normal([8, config.nz], 1.0, &device);
        let fake = trainer
            .gen
            .forward(z1, z2, cond.clone(), Mode::Train)
            .detach();
        let mut samples = vec![real.clone(), fake];
        for _ in 0..trainer.engine.schedule.interpolants {
            let mix = sampler.interpolate(samples[0].clone(), samples[1].clone());
            samples.push(mix);
        }
        let scores: Vec<Tensor<B, 1>> = samples
            .iter()
            .map(|x| trainer.disc.forward(x.clone(), cond.clone(), Mode::Train))
            .collect();
        let pen = scalar(trainer.engine.total(Metric::Crow, &samples, &scores).unwrap().mean()).unwrap();
        let d_real = scalar(scores[0].clone().mean()).unwrap();
        let d_fake = scalar(scores[1].clone().mean()).unwrap();
        assert!(pen > 0.0);

        let loss = trainer.disc_step(real, cond).unwrap();
        let expected = pen + d_real - d_fake;
        assert!((loss - expected).abs() <= 1e-4 * (1.0 + expected.abs()), "{loss} vs {expected}");
    }

    #[test]
    fn batch_mismatch_is_rejected() {
        let device = Default::default();
        let mut trainer = LatentGanTrainer::<B>::new(&small_config(), 3, 3, 4, &device).unwrap();
        let r = trainer.train_step(&batch(8, 3, 0.0).view(), &batch(7, 3, 0.0).view());
        assert!(matches!(r, Err(Error::DimMismatch { what: "data batch", .. })));
    }

    #[test]
    fn penalty_helper_is_zero_for_equal_scores() {
        let device = Default::default();
        let trainer = LatentGanTrainer::<B>::new(&small_config(), 2, 2, 5, &device).unwrap();
        let x1 = Tensor::<B, 2>::from_data(TensorData::new(vec![0.0f32, 0.0], [1, 2]), &device);
        let x2 = Tensor::<B, 2>::from_data(TensorData::new(vec![3.0f32, 4.0], [1, 2]), &device);
        let y = Tensor::<B, 1>::from_data(TensorData::new(vec![1.5f32], [1]), &device);
        let p = tensor_to_vec(trainer.endpoint_penalty(x1, x2, y.clone(), y)).unwrap();
        assert_eq!(p, vec![0.0]);
    }
}
