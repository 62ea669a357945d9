//! # polywgan
//!
//! Conditional Wasserstein GANs for polymer dynamics, trained with an endpoint Lipschitz
//! penalty instead of a gradient-norm penalty.
//!
//! The crate takes trajectories from an external simulator, slices them into
//! `(condition, target)` transitions, and fits a generator `G(z, c)` that samples the next
//! state given a condition derived from the current one.
//!
//! ## Public invariants (must not change)
//!
//! - **Critics are unbounded**: discriminator scores are raw reals and nothing in the crate
//!   squashes them. The critic minimizes `mean D(real) - mean D(fake)` (plus penalty) and the
//!   generator minimizes `mean D(fake)`, so a *lower* score reads as "more real".
//! - **The Lipschitz penalty is one-sided**: a pair of samples is only penalized when its score
//!   gap exceeds `k_L` times its distance (see [`penalty`]).
//! - **Latents are never cached**: every generator evaluation draws fresh noise from the
//!   trainer's seeded sampler.
//! - **Mode is explicit**: train/eval switches every network of a trainer at once; forward
//!   passes take the mode as an argument rather than reading it from the backend.
//! - **Optimizer state is not persisted**: a snapshot holds module records keyed by role name
//!   ("disc"/"gen", "crow"/"taxi"/"gen", "enc"/"dec"). Resuming restarts Adam moments at zero.
//!
//! ## Architectures
//!
//! - `lat_wgan`: 1D latent GAN. Dense critic with a condition encoder at every depth, and a
//!   residual generator `cond + f(z1, z2, cond)` with two noise sources at different depths.
//!   Six endpoint-penalty terms per step (two independent interpolants).
//! - `wgan_3d`: polymer chains as `(n_nodes, 3)` point sets. Two critics ("crow" under the
//!   RMS Euclidean metric, "taxi" under the mean per-node metric) built from rotation
//!   equivariant scalar/vector blocks, and a two-stage predict/finetune generator.
//! - `vae`: a plain state VAE sharing the same training loop and persistence.
//!
//! ## Module map
//!
//! - `config`: run configuration and per-architecture hyperparameters
//! - `condition`: condition transforms (coordinates, Rouse modes, mean position)
//! - `latent`: seeded latent sampling, mixing factors, ndarray/tensor bridges
//! - `penalty`: crow/taxi metrics, endpoint penalty, endpoint-pair schedules
//! - `layers`: condition encoder, dense stages, normalization init, train/eval mode
//! - `equivariant`: scalar/vector layers for the 3D networks
//! - `lat_wgan`, `wgan_3d`, `vae`: models and trainers
//! - `state`: role-keyed snapshots and checkpoint directories
//! - `registry`: the `Trainer` contract and architecture factory table
//! - `data`: trajectory sources, batching, transition slicing
//! - `metrics`: batched moments and batched model evaluation
//! - `sink`: best-effort scalar metrics sink
//! - `run`: the training loop

use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

pub mod condition;
pub mod config;
pub mod data;
pub mod equivariant;
pub mod lat_wgan;
pub mod latent;
pub mod layers;
pub mod metrics;
pub mod penalty;
pub mod registry;
pub mod run;
pub mod sink;
pub mod state;
pub mod vae;
pub mod wgan_3d;

/// Default training backend: ndarray + autodiff.
pub type TrainBackend = Autodiff<NdArray<f32>>;

/// polywgan error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("shape mismatch: {what}: expected {expected}, got {actual}")]
    DimMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("snapshot has no state for role `{0}`")]
    MissingRole(String),
    #[error("unknown architecture `{0}`")]
    UnknownArch(String),
    #[error("tensor data: {0}")]
    Tensor(String),
    #[error(transparent)]
    Record(#[from] burn_core::record::RecorderError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Check one dimension against its expected value.
pub(crate) fn must_be(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::DimMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
