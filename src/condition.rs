//! Condition transforms: map raw polymer states to the vectors that bias every layer.
//!
//! States are flat, node-major rows: `[x_0, y_0, z_0, x_1, ...]` for `poly_len` nodes in
//! `space_dim` dimensions. When velocities are kept (`x_only == false`) a velocity block of the
//! same size follows the positions. `Rouse` and `MeanPosition` only read the position block.
//!
//! Every transform is a pure function of its input; the variant is picked once per run.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::{must_be, Error, Result};

/// How a flat state row is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    pub poly_len: usize,
    pub space_dim: usize,
    pub x_only: bool,
}

impl StateLayout {
    /// Number of position entries (`poly_len * space_dim`).
    pub fn position_dim(&self) -> usize {
        self.poly_len * self.space_dim
    }

    /// Width of a full state row.
    pub fn state_dim(&self) -> usize {
        if self.x_only {
            self.position_dim()
        } else {
            2 * self.position_dim()
        }
    }
}

/// The closed set of condition transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Condition {
    /// Identity: the condition is the full state.
    Coords,
    /// Projection of node positions onto Rouse modes `1..=n_modes`.
    Rouse { n_modes: usize },
    /// Average node position per spatial dimension.
    MeanPosition,
}

impl Default for Condition {
    fn default() -> Self {
        Self::Coords
    }
}

/// `n`-th Rouse mode sampled on a chain of `len` beads.
///
/// `rouse(n, len)[i] = cos(n * pi * (i + 0.5) / len)`, minus `0.5` for the constant mode.
pub fn rouse(n: usize, len: usize) -> Array1<f32> {
    let offset = if n == 0 { 0.5 } else { 0.0 };
    Array1::from_shape_fn(len, |i| {
        let phase = (n as f64) * core::f64::consts::PI * (0.5 + i as f64) / (len as f64);
        (phase.cos() - offset) as f32
    })
}

impl Condition {
    /// Width of the condition vector for a given layout.
    pub fn output_dim(&self, layout: &StateLayout) -> usize {
        match *self {
            Condition::Coords => layout.state_dim(),
            Condition::Rouse { n_modes } => n_modes * layout.space_dim,
            Condition::MeanPosition => layout.space_dim,
        }
    }

    /// Reject variants that cannot be computed for `layout`.
    pub fn validate(&self, layout: &StateLayout) -> Result<()> {
        if let Condition::Rouse { n_modes } = *self {
            if n_modes == 0 {
                return Err(Error::Config("rouse conditioning needs n_modes >= 1".into()));
            }
            if n_modes >= layout.poly_len {
                return Err(Error::Config(format!(
                    "rouse conditioning with {n_modes} modes needs poly_len > {n_modes}, got {}",
                    layout.poly_len
                )));
            }
        }
        Ok(())
    }

    /// Apply the transform to a batch of state rows `[instances, state_dim]`.
    pub fn apply(&self, states: &ArrayView2<f32>, layout: &StateLayout) -> Result<Array2<f32>> {
        must_be("state width", layout.state_dim(), states.ncols())?;
        self.validate(layout)?;
        let n = states.nrows();
        let (len, sd) = (layout.poly_len, layout.space_dim);
        match *self {
            Condition::Coords => Ok(states.to_owned()),
            Condition::Rouse { n_modes } => {
                let modes: Vec<Array1<f32>> = (1..=n_modes).map(|m| rouse(m, len)).collect();
                let mut out = Array2::<f32>::zeros((n, n_modes * sd));
                for (row, mut dst) in states.outer_iter().zip(out.outer_iter_mut()) {
                    for (m, mode) in modes.iter().enumerate() {
                        for c in 0..sd {
                            let mut acc = 0.0f32;
                            for i in 0..len {
                                acc += mode[i] * row[i * sd + c];
                            }
                            dst[m * sd + c] = acc / len as f32;
                        }
                    }
                }
                Ok(out)
            }
            Condition::MeanPosition => {
                let mut out = Array2::<f32>::zeros((n, sd));
                for (row, mut dst) in states.outer_iter().zip(out.outer_iter_mut()) {
                    for c in 0..sd {
                        let mut acc = 0.0f32;
                        for i in 0..len {
                            acc += row[i * sd + c];
                        }
                        dst[c] = acc / len as f32;
                    }
                }
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn layout(poly_len: usize, space_dim: usize) -> StateLayout {
        StateLayout {
            poly_len,
            space_dim,
            x_only: true,
        }
    }

    #[test]
    fn rouse_modes_are_orthogonal_on_the_chain() {
        let len = 12;
        for a in 1..len {
            for b in 1..len {
                let dot: f32 = (&rouse(a, len) * &rouse(b, len)).sum();
                if a == b {
                    assert!((dot - len as f32 / 2.0).abs() < 1e-3, "mode {a}: {dot}");
                } else {
                    assert!(dot.abs() < 1e-3, "modes {a},{b}: {dot}");
                }
            }
        }
    }

    #[test]
    fn constant_mode_is_shifted() {
        let r = rouse(0, 5);
        assert!(r.iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn coords_is_identity() -> Result<()> {
        let l = layout(2, 3);
        let x = array![[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]];
        let c = Condition::Coords.apply(&x.view(), &l)?;
        assert_eq!(c, x);
        Ok(())
    }

    #[test]
    fn mean_position_averages_nodes() -> Result<()> {
        let l = layout(2, 3);
        let x = array![[1.0f32, 2.0, 3.0, 3.0, 4.0, 5.0]];
        let c = Condition::MeanPosition.apply(&x.view(), &l)?;
        assert_eq!(c, array![[2.0f32, 3.0, 4.0]]);
        Ok(())
    }

    #[test]
    fn rouse_ignores_rigid_translation() -> Result<()> {
        let l = layout(6, 1);
        let base = Array2::from_shape_fn((1, 6), |(_, i)| (i as f32 * 0.7).sin());
        let shifted = &base + 3.0;
        let cond = Condition::Rouse { n_modes: 3 };
        let a = cond.apply(&base.view(), &l)?;
        let b = cond.apply(&shifted.view(), &l)?;
        assert_eq!(a.dim(), (1, 3));
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn velocities_do_not_leak_into_mean_position() -> Result<()> {
        let l = StateLayout {
            poly_len: 2,
            space_dim: 1,
            x_only: false,
        };
        let x = array![[1.0f32, 3.0, 100.0, -100.0]];
        let c = Condition::MeanPosition.apply(&x.view(), &l)?;
        assert_eq!(c, array![[2.0f32]]);
        assert_eq!(Condition::Coords.output_dim(&l), 4);
        Ok(())
    }

    #[test]
    fn wrong_width_and_bad_modes_are_rejected() {
        let l = layout(4, 1);
        let x = Array2::<f32>::zeros((2, 3));
        assert!(matches!(
            Condition::Coords.apply(&x.view(), &l),
            Err(Error::DimMismatch { .. })
        ));
        let x = Array2::<f32>::zeros((2, 4));
        assert!(Condition::Rouse { n_modes: 0 }.apply(&x.view(), &l).is_err());
        assert!(Condition::Rouse { n_modes: 4 }.apply(&x.view(), &l).is_err());
    }
}
