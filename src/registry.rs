//! Architecture registry.
//!
//! Every trainer is driven through the object-safe [`Trainer`] contract, so the training
//! loop never needs to know which networks sit behind it. The architecture tag stored in a
//! [`RunConfig`] is resolved here, once, into a boxed trainer.

use std::fmt;
use std::str::FromStr;

use burn_core as burn;

use burn::tensor::backend::AutodiffBackend;
use ndarray::Array2;
use tracing::info;

use crate::config::{ArchConfig, RunConfig};
use crate::lat_wgan::LatentGanTrainer;
use crate::state::StateDict;
use crate::vae::VaeTrainer;
use crate::wgan_3d::Wgan3dTrainer;
use crate::{Error, Result};

/// Architecture tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchKind {
    LatWgan,
    Wgan3d,
    Vae,
}

impl ArchKind {
    pub const ALL: [ArchKind; 3] = [ArchKind::LatWgan, ArchKind::Wgan3d, ArchKind::Vae];

    pub fn as_str(self) -> &'static str {
        match self {
            ArchKind::LatWgan => "lat_wgan",
            ArchKind::Wgan3d => "wgan_3d",
            ArchKind::Vae => "vae",
        }
    }

    pub fn parse(tag: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == tag)
            .ok_or_else(|| Error::UnknownArch(tag.to_string()))
    }

    pub fn of(config: &ArchConfig) -> Self {
        match config {
            ArchConfig::LatWgan(_) => ArchKind::LatWgan,
            ArchConfig::Wgan3d(_) => ArchKind::Wgan3d,
            ArchConfig::Vae(_) => ArchKind::Vae,
        }
    }
}

impl fmt::Display for ArchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// What a trainer consumes per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayout {
    /// `(cond, target)` pairs from consecutive frames.
    Transitions,
    /// Single states, no condition.
    States,
}

/// Losses reported by one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepLosses {
    Gan { loss_d: f32, loss_g: f32 },
    Single { loss: f32 },
}

impl StepLosses {
    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            StepLosses::Gan { .. } => &["loss_d", "loss_g"],
            StepLosses::Single { .. } => &["loss"],
        }
    }

    /// Values in the order of [`labels`](Self::labels).
    pub fn values(&self) -> Vec<f32> {
        match *self {
            StepLosses::Gan { loss_d, loss_g } => vec![loss_d, loss_g],
            StepLosses::Single { loss } => vec![loss],
        }
    }

    pub fn labeled(&self) -> impl Iterator<Item = (&'static str, f32)> {
        self.labels().iter().copied().zip(self.values())
    }
}

/// Uniform training contract.
pub trait Trainer {
    fn arch(&self) -> ArchKind;

    fn layout(&self) -> DataLayout;

    /// `cond` is required for [`DataLayout::Transitions`] and rejected for
    /// [`DataLayout::States`].
    fn train_step(&mut self, data: &Array2<f32>, cond: Option<&Array2<f32>>) -> Result<StepLosses>;

    fn save_state(&self) -> Result<StateDict>;

    fn load_state(&mut self, state: &StateDict) -> Result<()>;

    fn set_eval(&mut self, eval: bool);

    /// GANs: next states for each condition row. VAE: one prior sample per row.
    fn predict(&mut self, input: &Array2<f32>) -> Result<Array2<f32>>;
}

fn need_cond(cond: Option<&Array2<f32>>) -> Result<&Array2<f32>> {
    cond.ok_or(Error::Shape("GAN steps need a condition batch"))
}

impl<B: AutodiffBackend> Trainer for LatentGanTrainer<B> {
    fn arch(&self) -> ArchKind {
        ArchKind::LatWgan
    }

    fn layout(&self) -> DataLayout {
        DataLayout::Transitions
    }

    fn train_step(&mut self, data: &Array2<f32>, cond: Option<&Array2<f32>>) -> Result<StepLosses> {
        let cond = need_cond(cond)?;
        let (loss_d, loss_g) = LatentGanTrainer::train_step(self, &data.view(), &cond.view())?;
        Ok(StepLosses::Gan { loss_d, loss_g })
    }

    fn save_state(&self) -> Result<StateDict> {
        LatentGanTrainer::save_state(self)
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        LatentGanTrainer::load_state(self, state)
    }

    fn set_eval(&mut self, eval: bool) {
        LatentGanTrainer::set_eval(self, eval)
    }

    fn predict(&mut self, input: &Array2<f32>) -> Result<Array2<f32>> {
        LatentGanTrainer::predict(self, &input.view())
    }
}

impl<B: AutodiffBackend> Trainer for Wgan3dTrainer<B> {
    fn arch(&self) -> ArchKind {
        ArchKind::Wgan3d
    }

    fn layout(&self) -> DataLayout {
        DataLayout::Transitions
    }

    fn train_step(&mut self, data: &Array2<f32>, cond: Option<&Array2<f32>>) -> Result<StepLosses> {
        let cond = need_cond(cond)?;
        let (loss_d, loss_g) = Wgan3dTrainer::train_step(self, &data.view(), &cond.view())?;
        Ok(StepLosses::Gan { loss_d, loss_g })
    }

    fn save_state(&self) -> Result<StateDict> {
        Wgan3dTrainer::save_state(self)
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        Wgan3dTrainer::load_state(self, state)
    }

    fn set_eval(&mut self, eval: bool) {
        Wgan3dTrainer::set_eval(self, eval)
    }

    fn predict(&mut self, input: &Array2<f32>) -> Result<Array2<f32>> {
        Wgan3dTrainer::predict(self, &input.view())
    }
}

impl<B: AutodiffBackend> Trainer for VaeTrainer<B> {
    fn arch(&self) -> ArchKind {
        ArchKind::Vae
    }

    fn layout(&self) -> DataLayout {
        DataLayout::States
    }

    fn train_step(&mut self, data: &Array2<f32>, cond: Option<&Array2<f32>>) -> Result<StepLosses> {
        if cond.is_some() {
            return Err(Error::Shape("VAE steps take no condition batch"));
        }
        let loss = VaeTrainer::train_step(self, &data.view())?;
        Ok(StepLosses::Single { loss })
    }

    fn save_state(&self) -> Result<StateDict> {
        VaeTrainer::save_state(self)
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        VaeTrainer::load_state(self, state)
    }

    fn set_eval(&mut self, eval: bool) {
        VaeTrainer::set_eval(self, eval)
    }

    fn predict(&mut self, input: &Array2<f32>) -> Result<Array2<f32>> {
        VaeTrainer::predict(self, &input.view())
    }
}

/// Fresh trainer for `config`.
///
/// The 1D GAN models condition-space states, so both its widths are `config.cond_dim()`.
pub fn make_new<B: AutodiffBackend>(config: &RunConfig, device: &B::Device) -> Result<Box<dyn Trainer>> {
    config.validate()?;
    let trainer: Box<dyn Trainer> = match &config.arch {
        ArchConfig::LatWgan(c) => {
            let width = config.cond_dim();
            Box::new(LatentGanTrainer::<B>::new(c, width, width, config.seed, device)?)
        }
        ArchConfig::Wgan3d(c) => Box::new(Wgan3dTrainer::<B>::new(config, c, device)?),
        ArchConfig::Vae(c) => Box::new(VaeTrainer::<B>::new(c, config.state_dim(), config.seed, device)?),
    };
    info!(arch = %trainer.arch(), seed = config.seed, "trainer ready");
    Ok(trainer)
}

/// Trainer for `config` with its networks restored from `state`.
pub fn load<B: AutodiffBackend>(
    config: &RunConfig,
    state: &StateDict,
    device: &B::Device,
) -> Result<Box<dyn Trainer>> {
    let mut trainer = make_new::<B>(config, device)?;
    trainer.load_state(state)?;
    info!(arch = %trainer.arch(), roles = state.roles().count(), "trainer restored");
    Ok(trainer)
}
