//! Batched moments and batched model evaluation.
//!
//! These exist for large sample sets (e.g. generated trajectories fed into a downstream
//! analysis) that should not be pushed through one giant matrix product or one giant
//! forward pass:
//! - the moment helpers accumulate `sum_i x_i y_i^T` slice by slice and divide by
//!   `instances - 1` (an unbiased normalization, no mean subtraction),
//! - [`batched_model_eval`] runs any row-wise model on slices and stitches the output.

use ndarray::{s, Array2, ArrayView2};

use crate::{must_be, Error, Result};

/// Default slice size for the moment helpers.
pub const MOMENT_BATCH: usize = 64_000;

/// Default slice size for [`batched_model_eval`].
pub const EVAL_BATCH: usize = 16_384;

/// `sum_i x_i x_i^T / (instances - 1)` for `x: [instances, dim]`.
pub fn batched_second_moment(x: &ArrayView2<f32>, batch: usize) -> Result<Array2<f32>> {
    batched_cross_moment(x, x, batch)
}

/// `sum_i x_i y_i^T / (instances - 1)` for `x: [instances, d1]`, `y: [instances, d2]`.
pub fn batched_cross_moment(
    x: &ArrayView2<f32>,
    y: &ArrayView2<f32>,
    batch: usize,
) -> Result<Array2<f32>> {
    if batch == 0 {
        return Err(Error::Domain("batch must be >= 1"));
    }
    let n = x.nrows();
    must_be("moment instances", n, y.nrows())?;
    if n < 2 {
        return Err(Error::Domain("moments need at least 2 instances"));
    }
    let mut acc = Array2::<f32>::zeros((x.ncols(), y.ncols()));
    for start in (0..n).step_by(batch) {
        let end = (start + batch).min(n);
        let xs = x.slice(s![start..end, ..]);
        let ys = y.slice(s![start..end, ..]);
        acc += &xs.t().dot(&ys);
    }
    Ok(acc / (n - 1) as f32)
}

/// Evaluate `model` on `input: [N, channels]` in slices of `batch` rows.
///
/// `model` must map `[rows, channels]` to `[rows, outdim]`; a wrong output shape is an error.
pub fn batched_model_eval<F>(
    mut model: F,
    input: &ArrayView2<f32>,
    outdim: usize,
    batch: usize,
) -> Result<Array2<f32>>
where
    F: FnMut(ArrayView2<f32>) -> Result<Array2<f32>>,
{
    if batch == 0 {
        return Err(Error::Domain("batch must be >= 1"));
    }
    let n = input.nrows();
    let mut out = Array2::<f32>::zeros((n, outdim));
    for start in (0..n).step_by(batch) {
        let end = (start + batch).min(n);
        let y = model(input.slice(s![start..end, ..]))?;
        must_be("model output rows", end - start, y.nrows())?;
        must_be("model output width", outdim, y.ncols())?;
        out.slice_mut(s![start..end, ..]).assign(&y);
    }
    Ok(out)
}
