//! Trajectory sources and the slicing that turns trajectories into training rows.
//!
//! A trajectory array is `(N, L, state_dim)`: `N` independent chains, `L` frames each, one flat
//! node-major state per frame. GANs train on consecutive-frame transitions, the VAE on single
//! frames.
//!
//! [`OuChainSource`] is a small stand-in for an external simulator: an overdamped
//! bead-spring chain in a weak harmonic trap, integrated with Euler-Maruyama.

use ndarray::{s, Array2, Array3, ArrayView3, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::debug;

use crate::condition::{Condition, StateLayout};
use crate::config::RunConfig;
use crate::{must_be, Error, Result};

/// A stream of trajectory arrays. `Ok(None)` ends the stream.
pub trait TrajectorySource {
    fn next_batch(&mut self) -> Result<Option<Array3<f32>>>;
}

/// Split `(N, L, d)` into `N / batch` chunks of `batch` trajectories.
pub fn batchify(trajs: &Array3<f32>, batch: usize) -> Result<Vec<Array3<f32>>> {
    if batch == 0 {
        return Err(Error::Domain("batch must be >= 1"));
    }
    let n = trajs.len_of(Axis(0));
    if n % batch != 0 {
        return Err(Error::DimMismatch {
            what: "trajectories left over after batching",
            expected: 0,
            actual: n % batch,
        });
    }
    Ok(trajs
        .axis_chunks_iter(Axis(0), batch)
        .map(|c| c.to_owned())
        .collect())
}

/// `(cond, target)` over all `N * (L - 1)` consecutive-frame pairs.
///
/// `cond = C(x_t)` and `target = C(x_{t+1})`; rows are ordered trajectory-major.
pub fn transition_pairs(
    trajs: &ArrayView3<f32>,
    condition: &Condition,
    layout: &StateLayout,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let (n, len, d) = trajs.dim();
    must_be("state width", layout.state_dim(), d)?;
    if len < 2 {
        return Err(Error::Domain("transitions need at least 2 frames"));
    }
    let rows = n * (len - 1);
    let from = flatten(trajs.slice(s![.., ..len - 1, ..]), rows, d)?;
    let to = flatten(trajs.slice(s![.., 1.., ..]), rows, d)?;
    let cond = condition.apply(&from.view(), layout)?;
    let target = condition.apply(&to.view(), layout)?;
    Ok((cond, target))
}

/// Every frame as its own row, `N * L` rows.
pub fn state_rows(trajs: &ArrayView3<f32>) -> Result<Array2<f32>> {
    let (n, len, d) = trajs.dim();
    flatten(trajs.view(), n * len, d)
}

fn flatten(x: ArrayView3<f32>, rows: usize, d: usize) -> Result<Array2<f32>> {
    let v: Vec<f32> = x.iter().copied().collect();
    Array2::from_shape_vec((rows, d), v).map_err(|_| Error::Shape("trajectory slice does not fill rows"))
}

/// Seeded bead-spring chain under overdamped Langevin dynamics.
#[derive(Debug, Clone)]
pub struct OuChainSource {
    rng: ChaCha8Rng,
    layout: StateLayout,
    /// Trajectories per emitted array.
    pub n_trajs: usize,
    pub simlen: usize,
    pub t_eql: usize,
    pub subtract_mean: bool,
    pub dt: f32,
    /// Spring constant between neighbouring beads.
    pub k_spring: f32,
    /// Strength of the trap pulling every bead toward the origin.
    pub k_trap: f32,
    pub temperature: f32,
    /// Stop after this many arrays; `None` streams forever.
    pub limit: Option<usize>,
    emitted: usize,
}

impl OuChainSource {
    pub fn new(layout: StateLayout, n_trajs: usize, simlen: usize, seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            layout,
            n_trajs,
            simlen,
            t_eql: 0,
            subtract_mean: false,
            dt: 0.05,
            k_spring: 1.0,
            k_trap: 0.1,
            temperature: 1.0,
            limit: None,
            emitted: 0,
        }
    }

    /// `batches_per_draw * batch` trajectories per array, seeded from the run.
    pub fn from_run(run: &RunConfig, batches_per_draw: usize) -> Self {
        let mut src = Self::new(run.layout(), batches_per_draw * run.batch, run.simlen, run.seed);
        src.t_eql = run.t_eql;
        src.subtract_mean = run.subtract_mean;
        src
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// One Euler-Maruyama step of all beads; `x` is `[poly_len, space_dim]`.
    fn step(&mut self, x: &mut Array2<f32>) {
        let (len, sd) = x.dim();
        let noise = (2.0 * self.temperature * self.dt).sqrt();
        let mut force = Array2::<f32>::zeros((len, sd));
        for i in 0..len {
            for c in 0..sd {
                let mut f = -self.k_trap * x[[i, c]];
                if i > 0 {
                    f += self.k_spring * (x[[i - 1, c]] - x[[i, c]]);
                }
                if i + 1 < len {
                    f += self.k_spring * (x[[i + 1, c]] - x[[i, c]]);
                }
                force[[i, c]] = f;
            }
        }
        for (xi, fi) in x.iter_mut().zip(force.iter()) {
            let z: f32 = StandardNormal.sample(&mut self.rng);
            *xi += self.dt * fi + noise * z;
        }
    }

    fn write_frame(&self, x: &Array2<f32>, prev: &Array2<f32>, out: &mut [f32]) {
        let pd = self.layout.position_dim();
        let mean = if self.subtract_mean {
            x.mean_axis(Axis(0))
        } else {
            None
        };
        for (k, (xi, pi)) in x.iter().zip(prev.iter()).enumerate() {
            let c = k % self.layout.space_dim;
            out[k] = xi - mean.as_ref().map_or(0.0, |m| m[c]);
            if !self.layout.x_only {
                out[pd + k] = (xi - pi) / self.dt;
            }
        }
    }

    fn simulate(&mut self) -> Array3<f32> {
        let (len, sd) = (self.layout.poly_len, self.layout.space_dim);
        let d = self.layout.state_dim();
        let mut out = Array3::<f32>::zeros((self.n_trajs, self.simlen, d));
        for traj in 0..self.n_trajs {
            let mut x = Array2::<f32>::zeros((len, sd));
            for _ in 0..self.t_eql {
                self.step(&mut x);
            }
            for t in 0..self.simlen {
                let prev = x.clone();
                self.step(&mut x);
                let mut frame = vec![0.0f32; d];
                self.write_frame(&x, &prev, &mut frame);
                for (k, v) in frame.into_iter().enumerate() {
                    out[[traj, t, k]] = v;
                }
            }
        }
        out
    }
}

impl TrajectorySource for OuChainSource {
    fn next_batch(&mut self) -> Result<Option<Array3<f32>>> {
        if self.limit.is_some_and(|l| self.emitted >= l) {
            return Ok(None);
        }
        if self.layout.poly_len == 0 || self.layout.space_dim == 0 {
            return Err(Error::Config("chain needs at least one bead and one dimension".into()));
        }
        let trajs = self.simulate();
        self.emitted += 1;
        debug!(draw = self.emitted, shape = ?trajs.dim(), "simulated trajectories");
        Ok(Some(trajs))
    }
}
