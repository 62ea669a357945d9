//! Latent sampling and the ndarray/tensor bridge.
//!
//! All randomness a trainer needs (generator noise, mixing factors) comes from one
//! [`LatentSampler`], so a run is reproducible from its seed. Noise is drawn in ndarray-land
//! with `ChaCha8Rng` and uploaded, never cached.

use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use ndarray::{Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::{Error, Result};

/// Seeded source of generator noise and interpolation factors.
#[derive(Debug, Clone)]
pub struct LatentSampler {
    rng: ChaCha8Rng,
}

impl LatentSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// `scale * N(0, 1)` with the given shape.
    pub fn normal<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        scale: f32,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let n: usize = shape.iter().product();
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            let x: f32 = StandardNormal.sample(&mut self.rng);
            v.push(scale * x);
        }
        Tensor::from_data(TensorData::new(v, shape), device)
    }

    /// One factor `alpha ~ U[0, 1)` per instance, shaped `[batch, 1, ..., 1]` for broadcasting.
    pub fn mix_factors<B: Backend, const D: usize>(
        &mut self,
        batch: usize,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let alphas: Vec<f32> = (0..batch).map(|_| self.rng.random::<f32>()).collect();
        let mut shape = [1usize; D];
        shape[0] = batch;
        Tensor::from_data(TensorData::new(alphas, shape), device)
    }

    /// `alpha * fake + (1 - alpha) * real` with a fresh `alpha` per instance.
    pub fn interpolate<B: Backend, const D: usize>(
        &mut self,
        real: Tensor<B, D>,
        fake: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let batch = real.dims()[0];
        let alpha = self.mix_factors::<B, D>(batch, &real.device());
        let keep = alpha.clone().neg().add_scalar(1.0);
        fake * alpha + real * keep
    }
}

/// Upload an `[n, d]` array.
pub fn array_to_tensor<B: Backend>(x: &ArrayView2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    let v: Vec<f32> = x.iter().copied().collect();
    Tensor::from_data(TensorData::new(v, [n, d]), device)
}

/// Download any tensor as a flat row-major `Vec<f32>`.
pub fn tensor_to_vec<B: Backend, const D: usize>(x: Tensor<B, D>) -> Result<Vec<f32>> {
    x.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Tensor(format!("{e:?}")))
}

/// Download a rank-2 tensor as an `[n, d]` array.
pub fn tensor_to_array<B: Backend>(x: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [n, d] = x.dims();
    let v = tensor_to_vec(x)?;
    Array2::from_shape_vec((n, d), v).map_err(|_| Error::Shape("tensor data does not fill [n, d]"))
}

/// Download a scalar (e.g. a loss).
pub fn scalar<B: Backend>(x: Tensor<B, 1>) -> Result<f32> {
    let v = tensor_to_vec(x)?;
    v.first()
        .copied()
        .ok_or(Error::Shape("expected a one-element tensor"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use ndarray::array;

    type B = NdArray<f32>;

    #[test]
    fn same_seed_same_noise() -> Result<()> {
        let device = Default::default();
        let a = LatentSampler::new(3).normal::<B, 3>([2, 4, 3], 1.0, &device);
        let b = LatentSampler::new(3).normal::<B, 3>([2, 4, 3], 1.0, &device);
        assert_eq!(tensor_to_vec(a)?, tensor_to_vec(b)?);
        Ok(())
    }

    #[test]
    fn consecutive_draws_differ() -> Result<()> {
        let device = Default::default();
        let mut s = LatentSampler::new(3);
        let a = tensor_to_vec(s.normal::<B, 2>([4, 5], 1.0, &device))?;
        let b = tensor_to_vec(s.normal::<B, 2>([4, 5], 1.0, &device))?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn mix_factors_are_unit_interval_and_broadcast_shaped() -> Result<()> {
        let device = Default::default();
        let mut s = LatentSampler::new(9);
        let m = s.mix_factors::<B, 3>(64, &device);
        assert_eq!(m.dims(), [64, 1, 1]);
        let v = tensor_to_vec(m)?;
        assert!(v.iter().all(|&a| (0.0..1.0).contains(&a)));
        Ok(())
    }

    #[test]
    fn interpolants_lie_between_endpoints() -> Result<()> {
        let device = Default::default();
        let real = array_to_tensor::<B>(&array![[0.0f32, 0.0], [1.0, -1.0]].view(), &device);
        let fake = array_to_tensor::<B>(&array![[2.0f32, 4.0], [1.0, 1.0]].view(), &device);
        let mut s = LatentSampler::new(1);
        let m = tensor_to_array(s.interpolate(real, fake))?;
        assert!((0.0..=2.0).contains(&m[[0, 0]]));
        assert!((m[[0, 1]] - 2.0 * m[[0, 0]]).abs() < 1e-5);
        assert!((m[[1, 0]] - 1.0).abs() < 1e-6);
        assert!((-1.0..=1.0).contains(&m[[1, 1]]));
        Ok(())
    }

    #[test]
    fn array_round_trip() -> Result<()> {
        let device = Default::default();
        let x = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let back = tensor_to_array(array_to_tensor::<B>(&x.view(), &device))?;
        assert_eq!(back, x);
        Ok(())
    }
}
