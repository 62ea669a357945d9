//! Run configuration.
//!
//! A [`RunConfig`] fully determines model construction and optimizer hyperparameters. It is
//! read-only once a trainer exists; the device is passed separately at construction.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::condition::{Condition, StateLayout};
use crate::penalty::PenaltySchedule;
use crate::{Error, Result};

/// Hyperparameters for the 1D latent GAN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatWganConfig {
    pub lr_d: f64,
    pub lr_g: f64,
    pub beta_1: f32,
    pub beta_2: f32,
    /// Lipschitz constant of the endpoint penalty.
    pub k_l: f32,
    /// Width of each latent vector (`z1`, `z2`).
    pub nz: usize,
    /// Hidden width of the generator.
    pub ngf: usize,
    /// Hidden width of the discriminator.
    pub ndf: usize,
    pub penalty: PenaltySchedule,
}

impl Default for LatWganConfig {
    fn default() -> Self {
        Self {
            lr_d: 8e-4,
            lr_g: 3e-4,
            beta_1: 0.5,
            beta_2: 0.99,
            k_l: 1.0,
            nz: 100,
            ngf: 128,
            ndf: 128,
            penalty: PenaltySchedule {
                interpolants: 2,
                cross_terms: true,
            },
        }
    }
}

/// Hyperparameters for the dual-critic 3D GAN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wgan3dConfig {
    pub lr_d: f64,
    pub lr_g: f64,
    pub beta_1: f32,
    pub beta_2: f32,
    pub weight_decay: f32,
    /// Weight of the endpoint penalties in the critic loss.
    pub lpen_wt: f32,
    pub k_l: f32,
    /// Scale of the isotropic position noise fed to the generator.
    pub z_scale: f32,
    /// Scalar channels per node.
    pub adim: usize,
    /// Vector channels per node.
    pub vdim: usize,
    pub agroups: usize,
    pub vgroups: usize,
    /// Rank of the scalar/vector product exchange.
    pub rank: usize,
    pub kernel: usize,
    pub disc_blocks: usize,
    pub gen_blocks: usize,
    pub tune_blocks: usize,
    pub penalty: PenaltySchedule,
}

impl Default for Wgan3dConfig {
    fn default() -> Self {
        Self {
            lr_d: 1e-3,
            lr_g: 5e-5,
            beta_1: 0.5,
            beta_2: 0.99,
            weight_decay: 0.01,
            lpen_wt: 1.0,
            k_l: 1.0,
            z_scale: 7.0,
            adim: 64,
            vdim: 32,
            agroups: 8,
            vgroups: 4,
            rank: 16,
            kernel: 7,
            disc_blocks: 4,
            gen_blocks: 3,
            tune_blocks: 3,
            penalty: PenaltySchedule {
                interpolants: 1,
                cross_terms: true,
            },
        }
    }
}

/// Hyperparameters for the state VAE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaeConfig {
    pub lr: f64,
    pub beta_1: f32,
    pub beta_2: f32,
    pub hidden: usize,
    pub latent_dim: usize,
    /// Weight of the KL term.
    pub kl_weight: f32,
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            beta_1: 0.9,
            beta_2: 0.999,
            hidden: 128,
            latent_dim: 16,
            kl_weight: 1.0,
        }
    }
}

/// Architecture tag plus its hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "arch")]
pub enum ArchConfig {
    LatWgan(LatWganConfig),
    Wgan3d(Wgan3dConfig),
    Vae(VaeConfig),
}

impl Default for ArchConfig {
    fn default() -> Self {
        Self::LatWgan(LatWganConfig::default())
    }
}

/// Everything needed to build a trainer and drive a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub arch: ArchConfig,
    pub poly_len: usize,
    pub space_dim: usize,
    pub condition: Condition,
    /// Positions only (no velocity block in the state).
    pub x_only: bool,
    /// Subtract the chain's center of mass from every state.
    pub subtract_mean: bool,
    /// Trajectories per training step.
    pub batch: usize,
    /// Trajectory length in frames.
    pub simlen: usize,
    /// Equilibration steps before the first recorded frame.
    pub t_eql: usize,
    pub nsteps: usize,
    pub save_every: usize,
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            arch: ArchConfig::default(),
            poly_len: 12,
            space_dim: 1,
            condition: Condition::Coords,
            x_only: true,
            subtract_mean: false,
            batch: 8,
            simlen: 16,
            t_eql: 4,
            nsteps: 65536,
            save_every: 512,
            seed: 0,
        }
    }
}

impl RunConfig {
    /// Default 3D run: coordinates conditioning on a 12-bead chain in 3D.
    pub fn wgan_3d() -> Self {
        Self {
            arch: ArchConfig::Wgan3d(Wgan3dConfig::default()),
            space_dim: 3,
            simlen: 6,
            ..Self::default()
        }
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout {
            poly_len: self.poly_len,
            space_dim: self.space_dim,
            x_only: self.x_only,
        }
    }

    pub fn state_dim(&self) -> usize {
        self.layout().state_dim()
    }

    /// Width of condition vectors (and of transformed targets).
    pub fn cond_dim(&self) -> usize {
        self.condition.output_dim(&self.layout())
    }

    /// Checks that hold for every architecture.
    pub fn validate(&self) -> Result<()> {
        if self.poly_len == 0 || self.space_dim == 0 {
            return Err(Error::Config("poly_len and space_dim must be >= 1".into()));
        }
        if self.batch == 0 {
            return Err(Error::Config("batch must be >= 1".into()));
        }
        if self.simlen < 2 {
            return Err(Error::Config(format!(
                "simlen must be >= 2 to form transitions, got {}",
                self.simlen
            )));
        }
        if self.save_every == 0 {
            return Err(Error::Config("save_every must be >= 1".into()));
        }
        self.condition.validate(&self.layout())?;
        match &self.arch {
            ArchConfig::LatWgan(c) => {
                check_rates(c.lr_d, c.lr_g)?;
                c.penalty.validate()?;
                if c.nz == 0 || c.ngf == 0 || c.ndf == 0 {
                    return Err(Error::Config("nz, ngf and ndf must be >= 1".into()));
                }
            }
            ArchConfig::Wgan3d(c) => {
                check_rates(c.lr_d, c.lr_g)?;
                c.penalty.validate()?;
            }
            ArchConfig::Vae(c) => {
                check_rates(c.lr, c.lr)?;
                if c.hidden == 0 || c.latent_dim == 0 {
                    return Err(Error::Config("hidden and latent_dim must be >= 1".into()));
                }
            }
        }
        Ok(())
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn check_rates(lr_d: f64, lr_g: f64) -> Result<()> {
    if !(lr_d.is_finite() && lr_d > 0.0 && lr_g.is_finite() && lr_g > 0.0) {
        return Err(Error::Config(format!(
            "learning rates must be positive and finite, got {lr_d} / {lr_g}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_research_settings() {
        let c = RunConfig::default();
        assert_eq!(c.nsteps, 65536);
        assert_eq!(c.save_every, 512);
        match c.arch {
            ArchConfig::LatWgan(a) => {
                assert_eq!(a.nz, 100);
                assert_eq!(a.penalty.pairs().len(), 6);
            }
            _ => panic!("default arch should be the 1D GAN"),
        }
        match RunConfig::wgan_3d().arch {
            ArchConfig::Wgan3d(a) => {
                assert_eq!((a.adim, a.vdim, a.rank), (64, 32, 16));
                assert_eq!(a.penalty.pairs().len(), 3);
            }
            _ => panic!("expected 3D arch"),
        }
    }

    #[test]
    fn json_round_trip_keeps_everything() -> Result<()> {
        let mut c = RunConfig::wgan_3d();
        c.condition = Condition::Coords;
        c.seed = 17;
        let text = serde_json::to_string(&c)?;
        let back: RunConfig = serde_json::from_str(&text)?;
        assert_eq!(back, c);
        Ok(())
    }

    #[test]
    fn partial_json_fills_defaults() -> Result<()> {
        let text = r#"{ "poly_len": 5, "condition": { "kind": "rouse", "n_modes": 2 } }"#;
        let c: RunConfig = serde_json::from_str(text)?;
        assert_eq!(c.poly_len, 5);
        assert_eq!(c.condition, Condition::Rouse { n_modes: 2 });
        assert_eq!(c.cond_dim(), 2);
        assert_eq!(c.batch, 8);
        Ok(())
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut c = RunConfig::default();
        c.batch = 0;
        assert!(c.validate().is_err());

        let mut c = RunConfig::default();
        c.simlen = 1;
        assert!(c.validate().is_err());

        let mut c = RunConfig::default();
        c.arch = ArchConfig::LatWgan(LatWganConfig {
            lr_d: -1.0,
            ..LatWganConfig::default()
        });
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        assert!(RunConfig::default().validate().is_ok());
    }
}
