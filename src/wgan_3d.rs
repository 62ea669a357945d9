//! Dual-critic WGAN for 3D polymer chains.
//!
//! States are `n` beads in 3D, carried flat as `[batch, 3n]` at the API boundary and as
//! `[batch, n, 3]` inside. The condition is the previous configuration itself.
//!
//! Two critics with identical architecture score each `(pos_0, pos_1)` transition:
//!
//! - `crow` is penalized under the RMS Euclidean distance over all beads,
//! - `taxi` is penalized under the mean per-bead displacement.
//!
//! They share one AdamW optimizer. The critic loss is
//! `(mean y_r_crow + mean y_r_taxi) - (mean y_g_crow + mean y_g_taxi)
//!  + lpen_wt * (mean pen_crow + mean pen_taxi)`, and the generator minimizes
//! `mean(y_g_crow + y_g_taxi)`.
//!
//! The generator refines in two stages: from `pos_0 + z_scale * noise` it first predicts and
//! removes the noise, then a second block stack adds a residual driven by fresh scalar and
//! vector channel noise.

use burn_core as burn;

use burn::module::{AutodiffModule, Module};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use burn_nn::{Linear, LinearConfig};
use burn_optim::adaptor::OptimizerAdaptor;
use burn_optim::{AdamW, AdamWConfig, GradientsParams, Optimizer};
use ndarray::{Array2, ArrayView2};
use tracing::info;

use crate::condition::Condition;
use crate::config::{RunConfig, Wgan3dConfig};
use crate::equivariant::{run_blocks, vec_norms, Block, NodeRelativeEmbed, VecLinear, Widths};
use crate::latent::{array_to_tensor, scalar, tensor_to_array, LatentSampler};
use crate::layers::Mode;
use crate::penalty::{endpoint_penalty, Metric, PenaltyEngine};
use crate::state::StateDict;
use crate::{must_be, Error, Result};

pub const ROLE_CROW: &str = "crow";
pub const ROLE_TAXI: &str = "taxi";
pub const ROLE_GEN: &str = "gen";

fn widths(c: &Wgan3dConfig) -> Widths {
    Widths {
        adim: c.adim,
        vdim: c.vdim,
        agroups: c.agroups,
        vgroups: c.vgroups,
        rank: c.rank,
        kernel: c.kernel,
    }
}

/// Equivariant critic over transitions `(pos_0, pos_1)`.
#[derive(Module, Debug)]
pub struct Discriminator3d<B: Backend> {
    node_enc: NodeRelativeEmbed<B>,
    blocks: Vec<Block<B>>,
    lin_a: Linear<B>,
    lin_v: Linear<B>,
}

impl<B: Backend> Discriminator3d<B> {
    pub fn new(c: &Wgan3dConfig, device: &B::Device) -> Self {
        let w = widths(c);
        Self {
            node_enc: NodeRelativeEmbed::new(c.adim, c.vdim, device),
            blocks: (0..c.disc_blocks).map(|_| Block::new(&w, device)).collect(),
            lin_a: LinearConfig::new(c.adim, 1).with_bias(false).init(device),
            lin_v: LinearConfig::new(c.vdim, 1).with_bias(false).init(device),
        }
    }

    /// Scores, `[batch]`: per-bead invariant readout averaged over beads.
    pub fn forward(&self, pos_0: Tensor<B, 3>, pos_1: Tensor<B, 3>) -> Tensor<B, 1> {
        let batch = pos_0.dims()[0];
        let (x_a, x_v) = self.node_enc.forward(pos_0.clone(), pos_1.clone());
        let (y_a, y_v) = run_blocks(&self.blocks, pos_0, pos_1, x_a, x_v);
        let per_node = self.lin_a.forward(y_a) + self.lin_v.forward(vec_norms(y_v));
        per_node.sum_dim(2).mean_dim(1).reshape([batch])
    }
}

/// Two-stage equivariant generator.
#[derive(Module, Debug)]
pub struct Generator3d<B: Backend> {
    node_enc: NodeRelativeEmbed<B>,
    blocks: Vec<Block<B>>,
    blocks_tune: Vec<Block<B>>,
    lin_v_node: VecLinear<B>,
    lin_v_node_tune: VecLinear<B>,
    out_scale: f32,
}

impl<B: Backend> Generator3d<B> {
    pub fn new(c: &Wgan3dConfig, device: &B::Device) -> Self {
        let w = widths(c);
        Self {
            node_enc: NodeRelativeEmbed::new(c.adim, c.vdim, device),
            blocks: (0..c.gen_blocks).map(|_| Block::new(&w, device)).collect(),
            blocks_tune: (0..c.tune_blocks).map(|_| Block::new(&w, device)).collect(),
            lin_v_node: VecLinear::new(c.vdim, 1, device),
            lin_v_node_tune: VecLinear::new(c.vdim, 1, device),
            out_scale: (c.vdim as f32).powf(-0.5),
        }
    }

    fn readout(&self, lin: &VecLinear<B>, y_v: Tensor<B, 4>) -> Tensor<B, 3> {
        let [b, n, _, _] = y_v.dims();
        lin.forward(y_v).reshape([b, n, 3]).mul_scalar(self.out_scale)
    }

    /// Stage 1: estimate the noise that took `pos_0` to `noised`.
    pub fn predict_noise(&self, pos_0: Tensor<B, 3>, noised: Tensor<B, 3>) -> Tensor<B, 3> {
        let (x_a, x_v) = self.node_enc.forward(pos_0.clone(), noised.clone());
        let (_, y_v) = run_blocks(&self.blocks, pos_0, noised, x_a, x_v);
        self.readout(&self.lin_v_node, y_v)
    }

    /// Stage 2: residual correction driven by channel noise.
    pub fn finetune(
        &self,
        pos_0: Tensor<B, 3>,
        denoised: Tensor<B, 3>,
        z_a: Tensor<B, 3>,
        z_v: Tensor<B, 4>,
    ) -> Tensor<B, 3> {
        let (x_a, x_v) = self.node_enc.forward(pos_0.clone(), denoised.clone());
        let (_, y_v) = run_blocks(&self.blocks_tune, pos_0, denoised, x_a + z_a, x_v + z_v);
        self.readout(&self.lin_v_node_tune, y_v)
    }

    pub fn forward(
        &self,
        pos_0: Tensor<B, 3>,
        pos_noise: Tensor<B, 3>,
        z_a: Tensor<B, 3>,
        z_v: Tensor<B, 4>,
    ) -> Tensor<B, 3> {
        let noised = pos_0.clone() + pos_noise;
        let denoised = noised.clone() - self.predict_noise(pos_0.clone(), noised);
        denoised.clone() + self.finetune(pos_0, denoised, z_a, z_v)
    }
}

/// The crow/taxi critic pair, optimized jointly.
#[derive(Module, Debug)]
pub struct CriticPair<B: Backend> {
    pub crow: Discriminator3d<B>,
    pub taxi: Discriminator3d<B>,
}

impl<B: Backend> CriticPair<B> {
    pub fn forward(&self, pos_0: Tensor<B, 3>, pos_1: Tensor<B, 3>) -> (Tensor<B, 1>, Tensor<B, 1>) {
        (
            self.crow.forward(pos_0.clone(), pos_1.clone()),
            self.taxi.forward(pos_0, pos_1),
        )
    }
}

/// Generator latents for one batch.
pub struct Latents3d<B: Backend> {
    pub pos_noise: Tensor<B, 3>,
    pub z_a: Tensor<B, 3>,
    pub z_v: Tensor<B, 4>,
}

/// Check the run-level invariants the 3D architecture depends on.
pub fn check_run_config(run: &RunConfig, c: &Wgan3dConfig) -> Result<()> {
    if run.space_dim != 3 {
        return Err(Error::Config(format!(
            "3D GAN needs space_dim == 3, got {}",
            run.space_dim
        )));
    }
    if run.condition != Condition::Coords {
        return Err(Error::Config(format!(
            "3D GAN needs coordinate conditioning, got {:?}",
            run.condition
        )));
    }
    if run.subtract_mean {
        return Err(Error::Config("3D GAN does not allow subtract_mean".into()));
    }
    if !run.x_only {
        return Err(Error::Config("3D GAN needs x_only states".into()));
    }
    if run.poly_len < 2 {
        return Err(Error::Config(format!(
            "3D GAN needs at least 2 beads, got {}",
            run.poly_len
        )));
    }
    check_widths(c)
}

fn check_widths(c: &Wgan3dConfig) -> Result<()> {
    if c.adim == 0 || c.vdim == 0 || c.rank == 0 {
        return Err(Error::Config("adim, vdim and rank must be >= 1".into()));
    }
    if c.agroups == 0 || c.adim % c.agroups != 0 {
        return Err(Error::Config(format!(
            "agroups ({}) must divide adim ({})",
            c.agroups, c.adim
        )));
    }
    if c.vgroups == 0 || c.vdim % c.vgroups != 0 {
        return Err(Error::Config(format!(
            "vgroups ({}) must divide vdim ({})",
            c.vgroups, c.vdim
        )));
    }
    if c.kernel % 2 == 0 {
        return Err(Error::Config(format!("kernel must be odd, got {}", c.kernel)));
    }
    c.penalty.validate()
}

pub struct Wgan3dTrainer<B: AutodiffBackend> {
    critics: CriticPair<B>,
    gen: Generator3d<B>,
    optim_d: OptimizerAdaptor<AdamW, CriticPair<B>, B>,
    optim_g: OptimizerAdaptor<AdamW, Generator3d<B>, B>,
    sampler: LatentSampler,
    engine: PenaltyEngine,
    config: Wgan3dConfig,
    n_nodes: usize,
    mode: Mode,
    device: B::Device,
}

impl<B: AutodiffBackend> Wgan3dTrainer<B> {
    pub fn new(run: &RunConfig, config: &Wgan3dConfig, device: &B::Device) -> Result<Self> {
        check_run_config(run, config)?;
        B::seed(device, run.seed);
        let critics = CriticPair {
            crow: Discriminator3d::new(config, device),
            taxi: Discriminator3d::new(config, device),
        };
        let gen = Generator3d::new(config, device);
        info!(
            n_nodes = run.poly_len,
            critic_params = critics.num_params(),
            gen_params = gen.num_params(),
            "built 3D dual-critic GAN"
        );
        Ok(Self {
            critics,
            gen,
            optim_d: Self::adamw(config),
            optim_g: Self::adamw(config),
            sampler: LatentSampler::new(run.seed),
            engine: PenaltyEngine::new(config.k_l, config.penalty),
            config: config.clone(),
            n_nodes: run.poly_len,
            mode: Mode::Train,
            device: device.clone(),
        })
    }

    /// Rebuild from a snapshot; optimizers start fresh.
    pub fn from_state(
        run: &RunConfig,
        config: &Wgan3dConfig,
        state: &StateDict,
        device: &B::Device,
    ) -> Result<Self> {
        let mut trainer = Self::new(run, config, device)?;
        trainer.load_state(state)?;
        Ok(trainer)
    }

    fn adamw<M: AutodiffModule<B>>(c: &Wgan3dConfig) -> OptimizerAdaptor<AdamW, M, B> {
        AdamWConfig::new()
            .with_beta_1(c.beta_1)
            .with_beta_2(c.beta_2)
            .with_weight_decay(c.weight_decay)
            .init()
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn critics(&self) -> &CriticPair<B> {
        &self.critics
    }

    pub fn generator(&self) -> &Generator3d<B> {
        &self.gen
    }

    /// The 3D networks hold no batch statistics; the flag is kept for a uniform contract.
    pub fn set_eval(&mut self, eval: bool) {
        self.mode = Mode::from_eval(eval);
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn get_latents(&mut self, batch: usize) -> Latents3d<B> {
        let n = self.n_nodes;
        let c = &self.config;
        Latents3d {
            pos_noise: self.sampler.normal([batch, n, 3], c.z_scale, &self.device),
            z_a: self.sampler.normal([batch, n, c.adim], 1.0, &self.device),
            z_v: self.sampler.normal([batch, n, c.vdim, 3], 1.0, &self.device),
        }
    }

    fn check_points(&self, x: &Tensor<B, 3>, what: &'static str) -> Result<usize> {
        let [batch, n, d] = x.dims();
        must_be(what, self.n_nodes, n)?;
        must_be("space dimension", 3, d)?;
        Ok(batch)
    }

    pub fn generate(&mut self, cond: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let batch = self.check_points(&cond, "condition nodes")?;
        let z = self.get_latents(batch);
        Ok(self.gen.forward(cond, z.pos_noise, z.z_a, z.z_v))
    }

    /// `[batch, 3n] -> [batch, n, 3]`.
    fn unflatten(&self, x: &ArrayView2<f32>, what: &'static str) -> Result<Tensor<B, 3>> {
        must_be(what, 3 * self.n_nodes, x.ncols())?;
        Ok(array_to_tensor::<B>(x, &self.device).reshape([x.nrows(), self.n_nodes, 3]))
    }

    /// Crow-metric penalty for one segment.
    pub fn endpoint_penalty_crow(
        &self,
        x1: Tensor<B, 3>,
        x2: Tensor<B, 3>,
        y1: Tensor<B, 1>,
        y2: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        endpoint_penalty(Metric::Crow, x1, x2, y1, y2, self.config.k_l)
    }

    /// Taxi-metric penalty for one segment.
    pub fn endpoint_penalty_taxi(
        &self,
        x1: Tensor<B, 3>,
        x2: Tensor<B, 3>,
        y1: Tensor<B, 1>,
        y2: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        endpoint_penalty(Metric::Taxi, x1, x2, y1, y2, self.config.k_l)
    }

    /// One joint update of both critics; returns the critic loss.
    pub fn disc_step(&mut self, real: Tensor<B, 3>, cond: Tensor<B, 3>) -> Result<f32> {
        let batch = self.check_points(&cond, "condition nodes")?;
        let real_batch = self.check_points(&real, "data nodes")?;
        must_be("data batch", batch, real_batch)?;

        let fake = self.generate(cond.clone())?.detach();
        let mut samples = vec![real, fake];
        for _ in 0..self.engine.schedule.interpolants {
            let mix = self
                .sampler
                .interpolate(samples[0].clone(), samples[1].clone());
            samples.push(mix);
        }
        let (crow, taxi): (Vec<_>, Vec<_>) = samples
            .iter()
            .map(|x| self.critics.forward(cond.clone(), x.clone()))
            .unzip();
        let pen_crow = self.engine.total(Metric::Crow, &samples, &crow)?;
        let pen_taxi = self.engine.total(Metric::Taxi, &samples, &taxi)?;

        let gap = (crow[0].clone().mean() + taxi[0].clone().mean())
            - (crow[1].clone().mean() + taxi[1].clone().mean());
        let loss = gap + (pen_crow.mean() + pen_taxi.mean()).mul_scalar(self.config.lpen_wt);

        let value = scalar(loss.clone().detach())?;
        let grads = GradientsParams::from_grads(loss.backward(), &self.critics);
        self.critics = self
            .optim_d
            .step(self.config.lr_d, self.critics.clone(), grads);
        Ok(value)
    }

    /// One generator update; returns the generator loss.
    pub fn gen_step(&mut self, cond: Tensor<B, 3>) -> Result<f32> {
        let fake = self.generate(cond.clone())?;
        let (y_crow, y_taxi) = self.critics.forward(cond, fake);
        let loss = (y_crow + y_taxi).mean();

        let value = scalar(loss.clone().detach())?;
        let grads = GradientsParams::from_grads(loss.backward(), &self.gen);
        self.gen = self.optim_g.step(self.config.lr_g, self.gen.clone(), grads);
        Ok(value)
    }

    /// `data` and `cond` are flat `[batch, 3n]`; returns `(loss_d, loss_g)`.
    pub fn train_step(&mut self, data: &ArrayView2<f32>, cond: &ArrayView2<f32>) -> Result<(f32, f32)> {
        let real = self.unflatten(data, "data width")?;
        let cond = self.unflatten(cond, "condition width")?;
        let loss_d = self.disc_step(real, cond.clone())?;
        let loss_g = self.gen_step(cond)?;
        Ok((loss_d, loss_g))
    }

    /// Flat `[batch, 3n]` conditions to flat sampled next states.
    pub fn predict(&mut self, cond: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let batch = cond.nrows();
        let cond = self.unflatten(cond, "condition width")?;
        let out = self.generate(cond)?.detach();
        tensor_to_array(out.reshape([batch, 3 * self.n_nodes]))
    }

    pub fn save_state(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        state.put_module::<B, _>(ROLE_CROW, self.critics.crow.clone())?;
        state.put_module::<B, _>(ROLE_TAXI, self.critics.taxi.clone())?;
        state.put_module::<B, _>(ROLE_GEN, self.gen.clone())?;
        Ok(state)
    }

    pub fn load_state(&mut self, state: &StateDict) -> Result<()> {
        let crow = state.load_module::<B, _>(ROLE_CROW, self.critics.crow.clone(), &self.device)?;
        let taxi = state.load_module::<B, _>(ROLE_TAXI, self.critics.taxi.clone(), &self.device)?;
        let gen = state.load_module::<B, _>(ROLE_GEN, self.gen.clone(), &self.device)?;
        self.critics = CriticPair { crow, taxi };
        self.gen = gen;
        self.optim_d = Self::adamw(&self.config);
        self.optim_g = Self::adamw(&self.config);
        Ok(())
    }
}
