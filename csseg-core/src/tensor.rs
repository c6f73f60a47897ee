//! Feature-map types and the small set of tensor kernels the reference
//! segmentor is made of.
//!
//! Layout is `[batch, channels, height, width]` for feature maps and
//! `[batch, height, width]` for label maps, row-major throughout. Every
//! learnable layer is a 1×1 channel mix (a `[out, in]` matrix applied at each
//! pixel), so forward and backward are written out by hand here.

use std::collections::BTreeMap;

use ndarray::{
    Array1, Array2, Array3, Array4, ArrayBase, ArrayD, ArrayView2, Data, Dimension, IxDyn, Zip, s,
};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Dense feature map, `[batch, channels, height, width]`.
pub type FeatureMap = Array4<f32>;

/// Integer label map, `[batch, height, width]`.
pub type LabelMap = Array3<u16>;

/// Named parameter tensors, ordered by name so serialization is stable.
pub type StateDict = BTreeMap<String, ParamTensor>;

/// Named gradients produced by a backward pass, keyed like [`StateDict`].
pub type Gradients = BTreeMap<String, ArrayD<f32>>;

/// A serializable parameter tensor: shape plus row-major data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl ParamTensor {
    pub fn from_array<S: Data<Elem = f32>, D: Dimension>(array: &ArrayBase<S, D>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Rebuild a dynamic-rank array. Fails when `data` does not fill `shape`.
    pub fn to_array(&self) -> Result<ArrayD<f32>, ndarray::ShapeError> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())
    }
}

/// Sample a `[rows, cols]` matrix from N(0, std²).
pub fn normal_matrix<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    std: f32,
    rng: &mut R,
) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| {
        let z: f32 = rng.sample(StandardNormal);
        z * std
    })
}

/// Apply a `[out, in]` channel-mixing matrix at every pixel.
pub fn channel_mix(weight: ArrayView2<'_, f32>, input: &FeatureMap) -> FeatureMap {
    let (batch, c_in, height, width) = input.dim();
    let c_out = weight.nrows();
    debug_assert_eq!(weight.ncols(), c_in);

    let mut out = FeatureMap::zeros((batch, c_out, height, width));
    for b in 0..batch {
        for o in 0..c_out {
            let mut plane = out.slice_mut(s![b, o, .., ..]);
            for i in 0..c_in {
                plane.scaled_add(weight[[o, i]], &input.slice(s![b, i, .., ..]));
            }
        }
    }
    out
}

/// Gradients of [`channel_mix`] w.r.t. its weight and its input.
pub fn channel_mix_backward(
    weight: ArrayView2<'_, f32>,
    input: &FeatureMap,
    grad_output: &FeatureMap,
) -> (Array2<f32>, FeatureMap) {
    let (c_out, c_in) = weight.dim();
    let mut grad_weight = Array2::<f32>::zeros((c_out, c_in));
    for o in 0..c_out {
        let g = grad_output.slice(s![.., o, .., ..]);
        for i in 0..c_in {
            let x = input.slice(s![.., i, .., ..]);
            grad_weight[[o, i]] = Zip::from(&g).and(&x).fold(0.0, |acc, &gv, &xv| acc + gv * xv);
        }
    }
    let grad_input = channel_mix(weight.t(), grad_output);
    (grad_weight, grad_input)
}

/// Add a per-channel bias in place.
pub fn add_channel_bias(map: &mut FeatureMap, bias: &Array1<f32>) {
    for (c, &b) in bias.iter().enumerate() {
        let mut plane = map.slice_mut(s![.., c, .., ..]);
        plane += b;
    }
}

/// Sum a feature-map gradient over batch and space, one value per channel.
pub fn channel_sums(map: &FeatureMap) -> Array1<f32> {
    let channels = map.dim().1;
    Array1::from_shape_fn(channels, |c| map.slice(s![.., c, .., ..]).sum())
}

pub fn leaky_relu(input: &FeatureMap, negative_slope: f32) -> FeatureMap {
    input.mapv(|v| if v > 0.0 { v } else { v * negative_slope })
}

/// Gradient through a leaky ReLU given its pre-activation.
pub fn leaky_relu_backward(pre: &FeatureMap, grad: &FeatureMap, negative_slope: f32) -> FeatureMap {
    Zip::from(grad)
        .and(pre)
        .map_collect(|&g, &p| if p > 0.0 { g } else { g * negative_slope })
}

/// Per-pixel arg-max over channels. Ties resolve to the lowest channel index.
pub fn argmax_channels(logits: &FeatureMap) -> LabelMap {
    let (batch, channels, height, width) = logits.dim();
    LabelMap::from_shape_fn((batch, height, width), |(b, y, x)| {
        let mut best = 0usize;
        let mut best_value = f32::NEG_INFINITY;
        for c in 0..channels {
            let v = logits[[b, c, y, x]];
            if v > best_value {
                best_value = v;
                best = c;
            }
        }
        best as u16
    })
}

/// Bilinear resize of the spatial dimensions.
///
/// Follows the usual convention: with `align_corners` the corner pixels of
/// input and output coincide, otherwise pixel centres are aligned.
pub fn resize_bilinear(
    input: &FeatureMap,
    size: (usize, usize),
    align_corners: bool,
) -> FeatureMap {
    let (batch, channels, in_h, in_w) = input.dim();
    let (out_h, out_w) = size;
    if (in_h, in_w) == (out_h, out_w) {
        return input.clone();
    }

    let ys: Vec<(usize, usize, f32)> = (0..out_h)
        .map(|d| source_coord(d, in_h, out_h, align_corners))
        .collect();
    let xs: Vec<(usize, usize, f32)> = (0..out_w)
        .map(|d| source_coord(d, in_w, out_w, align_corners))
        .collect();

    FeatureMap::from_shape_fn((batch, channels, out_h, out_w), |(b, c, y, x)| {
        let (y0, y1, ly) = ys[y];
        let (x0, x1, lx) = xs[x];
        let top = input[[b, c, y0, x0]] * (1.0 - lx) + input[[b, c, y0, x1]] * lx;
        let bottom = input[[b, c, y1, x0]] * (1.0 - lx) + input[[b, c, y1, x1]] * lx;
        top * (1.0 - ly) + bottom * ly
    })
}

fn source_coord(
    dst: usize,
    in_len: usize,
    out_len: usize,
    align_corners: bool,
) -> (usize, usize, f32) {
    let src = if align_corners {
        if out_len > 1 {
            dst as f32 * (in_len - 1) as f32 / (out_len - 1) as f32
        } else {
            0.0
        }
    } else {
        ((dst as f32 + 0.5) * in_len as f32 / out_len as f32 - 0.5).max(0.0)
    };
    let lo = (src.floor() as usize).min(in_len - 1);
    let hi = (lo + 1).min(in_len - 1);
    (lo, hi, src - lo as f32)
}
