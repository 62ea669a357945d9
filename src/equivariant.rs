//! Rotation-equivariant scalar/vector layers for polymer chains.
//!
//! Every node carries scalar channels `x_a: [batch, nodes, adim]` and vector channels
//! `x_v: [batch, nodes, vdim, 3]`. Under a rotation `R` applied to all positions and vector
//! channels:
//!
//! - scalar outputs are unchanged,
//! - vector outputs rotate by `R`.
//!
//! Vector channels are only ever mixed linearly across channels/nodes (never across the
//! trailing xyz axis), scaled by invariant quantities, or combined through dot products.
//! Geometry enters through differences of positions, so everything is also translation
//! invariant.

use burn_core as burn;

use burn::module::{Initializer, Module, Param};
use burn::tensor::activation::leaky_relu;
use burn::tensor::{backend::Backend, Tensor};
use burn_nn::conv::{Conv1d, Conv1dConfig};
use burn_nn::{Linear, LinearConfig, PaddingConfig1d};

use crate::layers::LEAKY_SLOPE;

const GROUP_EPS: f64 = 1e-5;

/// Channel widths shared by every block of a 3D network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Widths {
    pub adim: usize,
    pub vdim: usize,
    pub agroups: usize,
    pub vgroups: usize,
    pub rank: usize,
    pub kernel: usize,
}

/// Bias-free linear map over vector channels: `[.., c_in, 3] -> [.., c_out, 3]`.
#[derive(Module, Debug)]
pub struct VecLinear<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> VecLinear<B> {
    pub fn new(c_in: usize, c_out: usize, device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(c_in, c_out).with_bias(false).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.linear.forward(x.swap_dims(2, 3)).swap_dims(2, 3)
    }
}

/// Squash vector norms: `v * (1 + |v|^2)^(-1/4)`, so `|v|` grows like `sqrt(|v|)`.
pub fn vec_root_s<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let sq = x.clone().powf_scalar(2.0).sum_dim(3);
    x * sq.add_scalar(1.0).powf_scalar(-0.25)
}

/// Euclidean norm of every vector channel, `[b, n, c, 3] -> [b, n, c]`.
pub fn vec_norms<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [b, n, c, _] = x.dims();
    x.powf_scalar(2.0)
        .sum_dim(3)
        .add_scalar(1e-12)
        .sqrt()
        .reshape([b, n, c])
}

/// Per-node group norm over scalar channels with a per-channel affine map.
#[derive(Module, Debug)]
pub struct ScalGroupNorm<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
    groups: usize,
}

impl<B: Backend> ScalGroupNorm<B> {
    pub fn new(channels: usize, groups: usize, device: &B::Device) -> Self {
        Self {
            gamma: Initializer::Ones.init([channels], device),
            beta: Initializer::Zeros.init([channels], device),
            groups,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [b, n, c] = x.dims();
        let g = self.groups;
        let grouped = x.reshape([b, n, g, c / g]);
        let mean = grouped.clone().mean_dim(3);
        let centered = grouped - mean;
        let var = centered.clone().powf_scalar(2.0).mean_dim(3);
        let normed = (centered / var.add_scalar(GROUP_EPS).sqrt()).reshape([b, n, c]);
        normed * self.gamma.val().reshape([1, 1, c]) + self.beta.val().reshape([1, 1, c])
    }
}

/// Per-node group norm over vector channels: divide by the RMS vector norm of each group,
/// then apply a per-channel gain. No bias (a bias vector would break equivariance).
#[derive(Module, Debug)]
pub struct VecGroupNorm<B: Backend> {
    gain: Param<Tensor<B, 1>>,
    groups: usize,
}

impl<B: Backend> VecGroupNorm<B> {
    pub fn new(channels: usize, groups: usize, device: &B::Device) -> Self {
        Self {
            gain: Initializer::Ones.init([channels], device),
            groups,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, n, c, _] = x.dims();
        let g = self.groups;
        let grouped: Tensor<B, 5> = x.reshape([b, n, g, c / g, 3]);
        let ms = grouped
            .clone()
            .powf_scalar(2.0)
            .sum_dim(4)
            .mean_dim(3);
        let normed = (grouped / ms.add_scalar(GROUP_EPS).sqrt()).reshape([b, n, c, 3]);
        normed * self.gain.val().reshape([1, 1, c, 1])
    }
}

/// Low-rank exchange between scalar and vector channels.
///
/// - scalars from vectors: dot products of two rank-`r` projections, then `r -> adim`;
/// - vectors from scalars: an `adim -> r` gate scaling a rank-`r` projection, then `r -> vdim`.
#[derive(Module, Debug)]
pub struct ScalVecProducts<B: Backend> {
    left: VecLinear<B>,
    right: VecLinear<B>,
    dots_out: Linear<B>,
    gate: Linear<B>,
    gated_in: VecLinear<B>,
    gated_out: VecLinear<B>,
}

impl<B: Backend> ScalVecProducts<B> {
    pub fn new(adim: usize, vdim: usize, rank: usize, device: &B::Device) -> Self {
        Self {
            left: VecLinear::new(vdim, rank, device),
            right: VecLinear::new(vdim, rank, device),
            dots_out: LinearConfig::new(rank, adim).init(device),
            gate: LinearConfig::new(adim, rank).init(device),
            gated_in: VecLinear::new(vdim, rank, device),
            gated_out: VecLinear::new(rank, vdim, device),
        }
    }

    pub fn forward(&self, x_a: Tensor<B, 3>, x_v: Tensor<B, 4>) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let [b, n, _, _] = x_v.dims();
        let l = self.left.forward(x_v.clone());
        let rank = l.dims()[2];
        let dots = (l * self.right.forward(x_v.clone()))
            .sum_dim(3)
            .reshape([b, n, rank]);
        let p_a = self.dots_out.forward(dots);

        let gate: Tensor<B, 4> = self.gate.forward(x_a).unsqueeze_dim(3);
        let p_v = self.gated_out.forward(self.gated_in.forward(x_v) * gate);
        (p_a, p_v)
    }
}

/// Convolution of scalar channels along the chain (same length out).
#[derive(Module, Debug)]
pub struct ScalConv1d<B: Backend> {
    conv: Conv1d<B>,
}

impl<B: Backend> ScalConv1d<B> {
    pub fn new(channels: usize, kernel: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv1dConfig::new(channels, channels, kernel)
                .with_padding(PaddingConfig1d::Explicit(kernel / 2))
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.conv.forward(x.swap_dims(1, 2)).swap_dims(1, 2)
    }
}

/// Bias-free convolution of vector channels along the chain, shared across xyz.
#[derive(Module, Debug)]
pub struct VecConv1d<B: Backend> {
    conv: Conv1d<B>,
}

impl<B: Backend> VecConv1d<B> {
    pub fn new(channels: usize, kernel: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv1dConfig::new(channels, channels, kernel)
                .with_padding(PaddingConfig1d::Explicit(kernel / 2))
                .with_bias(false)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, n, c, _] = x.dims();
        // [b, n, c, 3] -> [b * 3, c, n]
        let flat = x.permute([0, 3, 2, 1]).reshape([b * 3, c, n]);
        self.conv
            .forward(flat)
            .reshape([b, 3, c, n])
            .permute([0, 3, 2, 1])
    }
}

/// Invariant MLP applied to Gram features.
#[derive(Module, Debug)]
pub struct GramMlp<B: Backend> {
    l1: Linear<B>,
    l2: Linear<B>,
}

impl<B: Backend> GramMlp<B> {
    pub fn new(d_in: usize, adim: usize, device: &B::Device) -> Self {
        Self {
            l1: LinearConfig::new(d_in, adim).init(device),
            l2: LinearConfig::new(adim, adim).init(device),
        }
    }

    /// `vecs: [b, n, k, 3]` -> scalars `[b, n, adim]` from the `k x k` Gram matrix.
    pub fn forward(&self, vecs: Tensor<B, 4>) -> Tensor<B, 3> {
        let [b, n, k, _] = vecs.dims();
        let gram = vecs.clone().matmul(vecs.swap_dims(2, 3)).reshape([b, n, k * k]);
        self.l2
            .forward(leaky_relu(self.l1.forward(gram), LEAKY_SLOPE))
    }
}

/// Per-node embedding of a pair of configurations `(pos_0, pos_1)`.
///
/// Vectors per node: `pos_1 - pos_0`, `pos_0 - mean(pos_0)`, `pos_1 - mean(pos_0)`.
#[derive(Module, Debug)]
pub struct NodeRelativeEmbed<B: Backend> {
    mlp: GramMlp<B>,
    vecs: VecLinear<B>,
}

impl<B: Backend> NodeRelativeEmbed<B> {
    pub fn new(adim: usize, vdim: usize, device: &B::Device) -> Self {
        Self {
            mlp: GramMlp::new(9, adim, device),
            vecs: VecLinear::new(3, vdim, device),
        }
    }

    pub fn forward(&self, pos_0: Tensor<B, 3>, pos_1: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let center = pos_0.clone().mean_dim(1);
        let vecs = Tensor::stack::<4>(
            vec![
                pos_1.clone() - pos_0.clone(),
                pos_0 - center.clone(),
                pos_1 - center,
            ],
            2,
        );
        (self.mlp.forward(vecs.clone()), self.vecs.forward(vecs))
    }
}

/// Chain bonds to the left and right of every node (zero past the ends), `[b, n, 3]` each.
fn bonds<B: Backend>(pos: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let [b, n, _] = pos.dims();
    let pad = Tensor::zeros([b, 1, 3], &pos.device());
    let diffs = pos.clone().narrow(1, 1, n - 1) - pos.narrow(1, 0, n - 1);
    let right = Tensor::cat(vec![diffs.clone(), pad.clone()], 1);
    let left = Tensor::cat(vec![pad, diffs], 1);
    (left, right)
}

/// Per-node embedding of the bonds adjacent to each node in both configurations.
#[derive(Module, Debug)]
pub struct EdgeRelativeEmbed<B: Backend> {
    mlp: GramMlp<B>,
    vecs: VecLinear<B>,
}

impl<B: Backend> EdgeRelativeEmbed<B> {
    pub fn new(adim: usize, vdim: usize, device: &B::Device) -> Self {
        Self {
            mlp: GramMlp::new(16, adim, device),
            vecs: VecLinear::new(4, vdim, device),
        }
    }

    /// Requires at least two nodes.
    pub fn forward(&self, pos_0: Tensor<B, 3>, pos_1: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let (l0, r0) = bonds(pos_0);
        let (l1, r1) = bonds(pos_1);
        let vecs = Tensor::stack::<4>(vec![l0, r0, l1, r1], 2);
        (self.mlp.forward(vecs.clone()), self.vecs.forward(vecs))
    }
}

/// Node-local residual update mixing scalar and vector channels.
#[derive(Module, Debug)]
pub struct LocalResidual<B: Backend> {
    a1: Linear<B>,
    a2: Linear<B>,
    a3: Linear<B>,
    v1: VecLinear<B>,
    v2: VecLinear<B>,
    v3: VecLinear<B>,
    av_prod: ScalVecProducts<B>,
    gnorm_a: ScalGroupNorm<B>,
    gnorm_v: VecGroupNorm<B>,
}

impl<B: Backend> LocalResidual<B> {
    pub fn new(w: &Widths, device: &B::Device) -> Self {
        let (a, v) = (w.adim, w.vdim);
        Self {
            a1: LinearConfig::new(a, a).init(device),
            a2: LinearConfig::new(a, a).init(device),
            a3: LinearConfig::new(a, a).init(device),
            v1: VecLinear::new(v, v, device),
            v2: VecLinear::new(v, v, device),
            v3: VecLinear::new(v, v, device),
            av_prod: ScalVecProducts::new(a, v, w.rank, device),
            gnorm_a: ScalGroupNorm::new(a, w.agroups, device),
            gnorm_v: VecGroupNorm::new(v, w.vgroups, device),
        }
    }

    pub fn forward(&self, x_a: Tensor<B, 3>, x_v: Tensor<B, 4>) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let y_a = leaky_relu(self.a1.forward(x_a.clone()), LEAKY_SLOPE);
        let y_a = leaky_relu(self.a2.forward(y_a), LEAKY_SLOPE);
        let y_a = self.a3.forward(y_a);
        let y_v = vec_root_s(self.v1.forward(x_v.clone()));
        let y_v = vec_root_s(self.v2.forward(y_v));
        let y_v = self.v3.forward(y_v);
        let (p_a, p_v) = self.av_prod.forward(x_a.clone(), x_v.clone());
        let z_a = self.gnorm_a.forward(y_a + p_a);
        let z_v = self.gnorm_v.forward(y_v + p_v);
        (x_a + z_a, x_v + z_v)
    }
}

/// Geometry-conditioned residual block: embed `(pos_0, pos_1)`, convolve along the chain,
/// mix locally, convolve again, normalize, add.
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    edge_embed: EdgeRelativeEmbed<B>,
    node_embed: NodeRelativeEmbed<B>,
    conv_0_a: ScalConv1d<B>,
    conv_0_v: VecConv1d<B>,
    local_res: LocalResidual<B>,
    conv_1_a: ScalConv1d<B>,
    conv_1_v: VecConv1d<B>,
    gnorm_a: ScalGroupNorm<B>,
    gnorm_v: VecGroupNorm<B>,
}

impl<B: Backend> Block<B> {
    pub fn new(w: &Widths, device: &B::Device) -> Self {
        Self {
            edge_embed: EdgeRelativeEmbed::new(w.adim, w.vdim, device),
            node_embed: NodeRelativeEmbed::new(w.adim, w.vdim, device),
            conv_0_a: ScalConv1d::new(w.adim, w.kernel, device),
            conv_0_v: VecConv1d::new(w.vdim, w.kernel, device),
            local_res: LocalResidual::new(w, device),
            conv_1_a: ScalConv1d::new(w.adim, w.kernel, device),
            conv_1_v: VecConv1d::new(w.vdim, w.kernel, device),
            gnorm_a: ScalGroupNorm::new(w.adim, w.agroups, device),
            gnorm_v: VecGroupNorm::new(w.vdim, w.vgroups, device),
        }
    }

    pub fn forward(
        &self,
        pos_0: Tensor<B, 3>,
        pos_1: Tensor<B, 3>,
        x_a: Tensor<B, 3>,
        x_v: Tensor<B, 4>,
    ) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let (edge_a, edge_v) = self.edge_embed.forward(pos_0.clone(), pos_1.clone());
        let (node_a, node_v) = self.node_embed.forward(pos_0, pos_1);
        let y_a = self.conv_0_a.forward(x_a.clone()) + edge_a + node_a;
        let y_v = self.conv_0_v.forward(x_v.clone()) + edge_v + node_v;
        let (y_a, y_v) = self.local_res.forward(y_a, y_v);
        let z_a = self.gnorm_a.forward(self.conv_1_a.forward(y_a));
        let z_v = self.gnorm_v.forward(self.conv_1_v.forward(y_v));
        (x_a + z_a, x_v + z_v)
    }
}

/// Run `(pos_0, pos_1, x_a, x_v)` through a stack of blocks.
pub fn run_blocks<B: Backend>(
    blocks: &[Block<B>],
    pos_0: Tensor<B, 3>,
    pos_1: Tensor<B, 3>,
    x_a: Tensor<B, 3>,
    x_v: Tensor<B, 4>,
) -> (Tensor<B, 3>, Tensor<B, 4>) {
    blocks
        .iter()
        .fold((x_a, x_v), |(a, v), block| {
            block.forward(pos_0.clone(), pos_1.clone(), a, v)
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::latent::{tensor_to_vec, LatentSampler};
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    /// Rotation by `angle` about the axis `(1, 2, 2) / 3`.
    pub(crate) fn rotation(angle: f32) -> [[f32; 3]; 3] {
        let (x, y, z) = (1.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0);
        let (s, c) = angle.sin_cos();
        let t = 1.0 - c;
        [
            [t * x * x + c, t * x * y - s * z, t * x * z + s * y],
            [t * x * y + s * z, t * y * y + c, t * y * z - s * x],
            [t * x * z - s * y, t * y * z + s * x, t * z * z + c],
        ]
    }

    /// Apply `r` to the trailing xyz axis of any tensor.
    pub(crate) fn rotate<Bk: Backend, const D: usize>(x: Tensor<Bk, D>, r: &[[f32; 3]; 3]) -> Tensor<Bk, D> {
        let dims = x.dims();
        let rows: usize = dims.iter().take(D - 1).product();
        // row vectors: v' = v R^T
        let rt: Vec<f32> = (0..3).flat_map(|i| (0..3).map(move |j| r[j][i])).collect();
        let rt = Tensor::<Bk, 2>::from_data(TensorData::new(rt, [3, 3]), &x.device());
        x.reshape([rows, 3]).matmul(rt).reshape(dims)
    }

    fn widths() -> Widths {
        Widths {
            adim: 8,
            vdim: 4,
            agroups: 2,
            vgroups: 2,
            rank: 3,
            kernel: 3,
        }
    }

    fn close(a: &[f32], b: &[f32], tol: f32) -> bool {
        a.len() == b.len()
            && a
                .iter()
                .zip(b)
                .all(|(x, y)| (x - y).abs() <= tol * (1.0 + x.abs().max(y.abs())))
    }

    #[test]
    fn vec_root_s_squashes_norm() {
        let device = Default::default();
        let x = Tensor::<B, 4>::from_data(TensorData::new(vec![3.0f32, 0.0, 4.0], [1, 1, 1, 3]), &device);
        let y = tensor_to_vec(vec_root_s(x)).unwrap();
        // |v| = 5 -> 5 / 26^(1/4)
        let expect = 5.0 / 26.0f32.powf(0.25);
        let norm = (y[0] * y[0] + y[2] * y[2]).sqrt();
        assert!((norm - expect).abs() < 1e-5);
        assert_eq!(y[1], 0.0);
    }

    #[test]
    fn vec_conv_keeps_shape() {
        let device = Default::default();
        let conv = VecConv1d::<B>::new(4, 7, &device);
        let x = LatentSampler::new(0).normal::<B, 4>([2, 5, 4, 3], 1.0, &device);
        assert_eq!(conv.forward(x).dims(), [2, 5, 4, 3]);
        let conv = ScalConv1d::<B>::new(6, 7, &device);
        let x = LatentSampler::new(1).normal::<B, 3>([2, 5, 6], 1.0, &device);
        assert_eq!(conv.forward(x).dims(), [2, 5, 6]);
    }

    #[test]
    fn scalar_group_norm_standardizes_groups() {
        let device = Default::default();
        let norm = ScalGroupNorm::<B>::new(4, 2, &device);
        let x = Tensor::<B, 3>::from_data(
            TensorData::new(vec![1.0f32, 3.0, 10.0, 30.0], [1, 1, 4]),
            &device,
        );
        let y = tensor_to_vec(norm.forward(x)).unwrap();
        assert!(close(&y, &[-1.0, 1.0, -1.0, 1.0], 1e-3), "{y:?}");
    }

    #[test]
    fn block_is_rotation_equivariant() {
        let device = Default::default();
        let w = widths();
        let block = Block::<B>::new(&w, &device);
        let mut s = LatentSampler::new(11);
        let pos_0 = s.normal::<B, 3>([2, 5, 3], 1.0, &device);
        let pos_1 = s.normal::<B, 3>([2, 5, 3], 1.0, &device);
        let x_a = s.normal::<B, 3>([2, 5, w.adim], 1.0, &device);
        let x_v = s.normal::<B, 4>([2, 5, w.vdim, 3], 1.0, &device);
        let r = rotation(0.9);

        let (a, v) = block.forward(pos_0.clone(), pos_1.clone(), x_a.clone(), x_v.clone());
        let (ra, rv) = block.forward(
            rotate(pos_0, &r),
            rotate(pos_1, &r),
            x_a,
            rotate(x_v, &r),
        );
        let a = tensor_to_vec(a).unwrap();
        let ra = tensor_to_vec(ra).unwrap();
        let v = tensor_to_vec(rotate(v, &r)).unwrap();
        let rv = tensor_to_vec(rv).unwrap();
        assert!(close(&a, &ra, 1e-3), "scalars changed under rotation");
        assert!(close(&v, &rv, 1e-3), "vectors did not rotate");
    }

    #[test]
    fn embeddings_ignore_translation() {
        let device = Default::default();
        let w = widths();
        let node = NodeRelativeEmbed::<B>::new(w.adim, w.vdim, &device);
        let edge = EdgeRelativeEmbed::<B>::new(w.adim, w.vdim, &device);
        let mut s = LatentSampler::new(5);
        let pos_0 = s.normal::<B, 3>([1, 4, 3], 1.0, &device);
        let pos_1 = s.normal::<B, 3>([1, 4, 3], 1.0, &device);
        let shift = Tensor::<B, 3>::from_data(TensorData::new(vec![5.0f32, -2.0, 7.0], [1, 1, 3]), &device);

        let (na, nv) = node.forward(pos_0.clone(), pos_1.clone());
        let (ta, tv) = node.forward(pos_0.clone() + shift.clone(), pos_1.clone() + shift.clone());
        assert!(close(&tensor_to_vec(na).unwrap(), &tensor_to_vec(ta).unwrap(), 1e-4));
        assert!(close(&tensor_to_vec(nv).unwrap(), &tensor_to_vec(tv).unwrap(), 1e-4));

        let (ea, _) = edge.forward(pos_0.clone(), pos_1.clone());
        let (sa, _) = edge.forward(pos_0 + shift.clone(), pos_1 + shift);
        assert!(close(&tensor_to_vec(ea).unwrap(), &tensor_to_vec(sa).unwrap(), 1e-4));
    }
}
