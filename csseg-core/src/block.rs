//! Encoder blocks.
//!
//! [`StochasticDualPathBlock`] runs two parallel branches over the same hidden
//! features and merges them per output channel. In training mode every channel
//! draws one of three policies: branch1 only (×2), branch2 only (×2), or an
//! even blend. The ×2 keeps the expected magnitude equal to the blend, so in
//! expectation the output is a 50/50 mix while each branch must stand on its
//! own. Inference always uses the even blend and never touches a random
//! source, which makes it bit-reproducible.
//!
//! Blocks also return the residual sum before the final activation. That
//! tensor is the distillation feature compared against the history model.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array2, s};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::tensor::{
    FeatureMap, Gradients, channel_mix, channel_mix_backward, leaky_relu, leaky_relu_backward,
    normal_matrix,
};

/// Per-channel merge coefficients for one forward pass. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchWeight {
    pub branch1: f32,
    pub branch2: f32,
}

impl BranchWeight {
    pub const BRANCH1_ONLY: Self = Self {
        branch1: 2.0,
        branch2: 0.0,
    };
    pub const BRANCH2_ONLY: Self = Self {
        branch1: 0.0,
        branch2: 2.0,
    };
    pub const EVEN: Self = Self {
        branch1: 1.0,
        branch2: 1.0,
    };

    /// Map a uniform draw in `[0, 1)` onto the three policies.
    pub fn from_draw(r: f32) -> Self {
        if r < 1.0 / 3.0 {
            Self::BRANCH1_ONLY
        } else if r < 2.0 / 3.0 {
            Self::BRANCH2_ONLY
        } else {
            Self::EVEN
        }
    }
}

/// Chooses the training-mode merge coefficients of a dual-path block.
pub trait MergeStrategy: Send + Sync + fmt::Debug {
    fn draw(&self, channels: usize, rng: &mut dyn RngCore) -> Vec<BranchWeight>;
}

/// Independent uniform draw per channel, binned at 1/3 and 2/3.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriModalMerge;

impl MergeStrategy for TriModalMerge {
    fn draw(&self, channels: usize, rng: &mut dyn RngCore) -> Vec<BranchWeight> {
        (0..channels)
            .map(|_| BranchWeight::from_draw(rng.r#gen::<f32>()))
            .collect()
    }
}

/// Which block the encoder is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    DualPath,
    Residual,
}

/// Output features plus the pre-activation residual sum used for distillation.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutput {
    pub features: FeatureMap,
    pub distillation: FeatureMap,
}

/// Capability shared by every encoder block.
///
/// `forward_train` returns a cache that `backward` consumes; blocks hold no
/// per-call state themselves, so inference only needs `&self`.
pub trait Block: Send + Sync {
    type Cache;

    fn infer(&self, input: &FeatureMap) -> BlockOutput;

    fn forward_train(
        &self,
        input: &FeatureMap,
        rng: &mut dyn RngCore,
    ) -> (BlockOutput, Self::Cache);

    /// Returns the input gradient and parameter gradients keyed by local name.
    fn backward(
        &self,
        cache: &Self::Cache,
        grad_features: &FeatureMap,
        grad_distillation: Option<&FeatureMap>,
    ) -> (FeatureMap, Gradients);

    fn parameters(&self) -> Vec<(&'static str, &Array2<f32>)>;

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)>;
}

/// Merge two branch outputs: `0.5 * (w1 * branch1 + w2 * branch2)` per channel.
pub fn merge_branches(
    branch1: &FeatureMap,
    branch2: &FeatureMap,
    weights: &[BranchWeight],
) -> FeatureMap {
    debug_assert_eq!(branch1.dim(), branch2.dim());
    debug_assert_eq!(branch1.dim().1, weights.len());
    let mut merged = FeatureMap::zeros(branch1.raw_dim());
    for (c, w) in weights.iter().enumerate() {
        let mut plane = merged.slice_mut(s![.., c, .., ..]);
        plane.scaled_add(0.5 * w.branch1, &branch1.slice(s![.., c, .., ..]));
        plane.scaled_add(0.5 * w.branch2, &branch2.slice(s![.., c, .., ..]));
    }
    merged
}

fn init_std(channels: usize) -> f32 {
    (1.0 / channels.max(1) as f32).sqrt()
}

/// Two-branch residual block with stochastic per-channel merging.
#[derive(Debug, Clone)]
pub struct StochasticDualPathBlock {
    conv1: Array2<f32>,
    branch1: Array2<f32>,
    branch2: Array2<f32>,
    negative_slope: f32,
    merge: Arc<dyn MergeStrategy>,
}

/// Activations kept from a training forward pass.
#[derive(Debug, Clone)]
pub struct DualPathCache {
    input: FeatureMap,
    pre_hidden: FeatureMap,
    hidden: FeatureMap,
    weights: Vec<BranchWeight>,
    merged: FeatureMap,
    residual_sum: FeatureMap,
}

impl DualPathCache {
    /// The merge coefficients drawn for this pass.
    pub fn weights(&self) -> &[BranchWeight] {
        &self.weights
    }
}

impl StochasticDualPathBlock {
    pub fn new<R: Rng + ?Sized>(channels: usize, negative_slope: f32, rng: &mut R) -> Self {
        let std = init_std(channels);
        Self {
            conv1: normal_matrix(channels, channels, std, rng),
            branch1: normal_matrix(channels, channels, std, rng),
            branch2: normal_matrix(channels, channels, std, rng),
            negative_slope,
            merge: Arc::new(TriModalMerge),
        }
    }

    pub fn with_merge_strategy(mut self, merge: Arc<dyn MergeStrategy>) -> Self {
        self.merge = merge;
        self
    }

    pub fn channels(&self) -> usize {
        self.conv1.nrows()
    }

    fn run(&self, input: &FeatureMap, weights: Vec<BranchWeight>) -> (BlockOutput, DualPathCache) {
        let slope = self.negative_slope;
        let pre_hidden = channel_mix(self.conv1.view(), input);
        let hidden = leaky_relu(&pre_hidden, slope);
        let out_branch1 = channel_mix(self.branch1.view(), &hidden);
        let out_branch2 = channel_mix(self.branch2.view(), &hidden);
        let merged = merge_branches(&out_branch1, &out_branch2, &weights);
        let residual_sum = leaky_relu(&merged, slope) + input;
        let features = leaky_relu(&residual_sum, slope);

        let output = BlockOutput {
            features,
            distillation: residual_sum.clone(),
        };
        let cache = DualPathCache {
            input: input.clone(),
            pre_hidden,
            hidden,
            weights,
            merged,
            residual_sum,
        };
        (output, cache)
    }
}

impl Block for StochasticDualPathBlock {
    type Cache = DualPathCache;

    fn infer(&self, input: &FeatureMap) -> BlockOutput {
        let weights = vec![BranchWeight::EVEN; self.channels()];
        self.run(input, weights).0
    }

    fn forward_train(
        &self,
        input: &FeatureMap,
        rng: &mut dyn RngCore,
    ) -> (BlockOutput, DualPathCache) {
        let weights = self.merge.draw(self.channels(), rng);
        self.run(input, weights)
    }

    fn backward(
        &self,
        cache: &DualPathCache,
        grad_features: &FeatureMap,
        grad_distillation: Option<&FeatureMap>,
    ) -> (FeatureMap, Gradients) {
        let slope = self.negative_slope;
        let mut grad_sum = leaky_relu_backward(&cache.residual_sum, grad_features, slope);
        if let Some(grad) = grad_distillation {
            grad_sum += grad;
        }

        let grad_merged = leaky_relu_backward(&cache.merged, &grad_sum, slope);
        let mut grad_branch1 = FeatureMap::zeros(grad_merged.raw_dim());
        let mut grad_branch2 = FeatureMap::zeros(grad_merged.raw_dim());
        for (c, w) in cache.weights.iter().enumerate() {
            let g = grad_merged.slice(s![.., c, .., ..]);
            grad_branch1
                .slice_mut(s![.., c, .., ..])
                .scaled_add(0.5 * w.branch1, &g);
            grad_branch2
                .slice_mut(s![.., c, .., ..])
                .scaled_add(0.5 * w.branch2, &g);
        }

        let (grad_w1, grad_hidden1) =
            channel_mix_backward(self.branch1.view(), &cache.hidden, &grad_branch1);
        let (grad_w2, grad_hidden2) =
            channel_mix_backward(self.branch2.view(), &cache.hidden, &grad_branch2);
        let grad_hidden = grad_hidden1 + grad_hidden2;
        let grad_pre_hidden = leaky_relu_backward(&cache.pre_hidden, &grad_hidden, slope);
        let (grad_conv1, grad_input) =
            channel_mix_backward(self.conv1.view(), &cache.input, &grad_pre_hidden);

        let mut grads = Gradients::new();
        grads.insert("conv1.weight".into(), grad_conv1.into_dyn());
        grads.insert("branch1.weight".into(), grad_w1.into_dyn());
        grads.insert("branch2.weight".into(), grad_w2.into_dyn());
        (grad_input + grad_sum, grads)
    }

    fn parameters(&self) -> Vec<(&'static str, &Array2<f32>)> {
        vec![
            ("conv1.weight", &self.conv1),
            ("branch1.weight", &self.branch1),
            ("branch2.weight", &self.branch2),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)> {
        vec![
            ("conv1.weight", &mut self.conv1),
            ("branch1.weight", &mut self.branch1),
            ("branch2.weight", &mut self.branch2),
        ]
    }
}

/// Plain single-branch residual block. Deterministic in both modes.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    conv1: Array2<f32>,
    conv2: Array2<f32>,
    negative_slope: f32,
}

#[derive(Debug, Clone)]
pub struct ResidualCache {
    input: FeatureMap,
    pre_hidden: FeatureMap,
    hidden: FeatureMap,
    pre_out: FeatureMap,
    residual_sum: FeatureMap,
}

impl ResidualBlock {
    pub fn new<R: Rng + ?Sized>(channels: usize, negative_slope: f32, rng: &mut R) -> Self {
        let std = init_std(channels);
        Self {
            conv1: normal_matrix(channels, channels, std, rng),
            conv2: normal_matrix(channels, channels, std, rng),
            negative_slope,
        }
    }

    fn run(&self, input: &FeatureMap) -> (BlockOutput, ResidualCache) {
        let slope = self.negative_slope;
        let pre_hidden = channel_mix(self.conv1.view(), input);
        let hidden = leaky_relu(&pre_hidden, slope);
        let pre_out = channel_mix(self.conv2.view(), &hidden);
        let residual_sum = leaky_relu(&pre_out, slope) + input;
        let output = BlockOutput {
            features: leaky_relu(&residual_sum, slope),
            distillation: residual_sum.clone(),
        };
        let cache = ResidualCache {
            input: input.clone(),
            pre_hidden,
            hidden,
            pre_out,
            residual_sum,
        };
        (output, cache)
    }
}

impl Block for ResidualBlock {
    type Cache = ResidualCache;

    fn infer(&self, input: &FeatureMap) -> BlockOutput {
        self.run(input).0
    }

    fn forward_train(
        &self,
        input: &FeatureMap,
        _rng: &mut dyn RngCore,
    ) -> (BlockOutput, ResidualCache) {
        self.run(input)
    }

    fn backward(
        &self,
        cache: &ResidualCache,
        grad_features: &FeatureMap,
        grad_distillation: Option<&FeatureMap>,
    ) -> (FeatureMap, Gradients) {
        let slope = self.negative_slope;
        let mut grad_sum = leaky_relu_backward(&cache.residual_sum, grad_features, slope);
        if let Some(grad) = grad_distillation {
            grad_sum += grad;
        }
        let grad_pre_out = leaky_relu_backward(&cache.pre_out, &grad_sum, slope);
        let (grad_conv2, grad_hidden) =
            channel_mix_backward(self.conv2.view(), &cache.hidden, &grad_pre_out);
        let grad_pre_hidden = leaky_relu_backward(&cache.pre_hidden, &grad_hidden, slope);
        let (grad_conv1, grad_input) =
            channel_mix_backward(self.conv1.view(), &cache.input, &grad_pre_hidden);

        let mut grads = Gradients::new();
        grads.insert("conv1.weight".into(), grad_conv1.into_dyn());
        grads.insert("conv2.weight".into(), grad_conv2.into_dyn());
        (grad_input + grad_sum, grads)
    }

    fn parameters(&self) -> Vec<(&'static str, &Array2<f32>)> {
        vec![("conv1.weight", &self.conv1), ("conv2.weight", &self.conv2)]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)> {
        vec![("conv1.weight", &mut self.conv1), ("conv2.weight", &mut self.conv2)]
    }
}

/// Encoder blocks composed by kind rather than by inheritance.
#[derive(Debug, Clone)]
pub enum EncoderBlock {
    DualPath(StochasticDualPathBlock),
    Residual(ResidualBlock),
}

#[derive(Debug, Clone)]
pub enum EncoderBlockCache {
    DualPath(DualPathCache),
    Residual(ResidualCache),
}

impl EncoderBlock {
    pub fn new<R: Rng + ?Sized>(
        kind: BlockKind,
        channels: usize,
        negative_slope: f32,
        rng: &mut R,
    ) -> Self {
        match kind {
            BlockKind::DualPath => {
                Self::DualPath(StochasticDualPathBlock::new(channels, negative_slope, rng))
            }
            BlockKind::Residual => {
                Self::Residual(ResidualBlock::new(channels, negative_slope, rng))
            }
        }
    }
}

impl Block for EncoderBlock {
    type Cache = EncoderBlockCache;

    fn infer(&self, input: &FeatureMap) -> BlockOutput {
        match self {
            Self::DualPath(block) => block.infer(input),
            Self::Residual(block) => block.infer(input),
        }
    }

    fn forward_train(
        &self,
        input: &FeatureMap,
        rng: &mut dyn RngCore,
    ) -> (BlockOutput, EncoderBlockCache) {
        match self {
            Self::DualPath(block) => {
                let (out, cache) = block.forward_train(input, rng);
                (out, EncoderBlockCache::DualPath(cache))
            }
            Self::Residual(block) => {
                let (out, cache) = block.forward_train(input, rng);
                (out, EncoderBlockCache::Residual(cache))
            }
        }
    }

    fn backward(
        &self,
        cache: &EncoderBlockCache,
        grad_features: &FeatureMap,
        grad_distillation: Option<&FeatureMap>,
    ) -> (FeatureMap, Gradients) {
        match (self, cache) {
            (Self::DualPath(block), EncoderBlockCache::DualPath(cache)) => {
                block.backward(cache, grad_features, grad_distillation)
            }
            (Self::Residual(block), EncoderBlockCache::Residual(cache)) => {
                block.backward(cache, grad_features, grad_distillation)
            }
            _ => unreachable!("block cache comes from a different block kind"),
        }
    }

    fn parameters(&self) -> Vec<(&'static str, &Array2<f32>)> {
        match self {
            Self::DualPath(block) => block.parameters(),
            Self::Residual(block) => block.parameters(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)> {
        match self {
            Self::DualPath(block) => block.parameters_mut(),
            Self::Residual(block) => block.parameters_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Replays a fixed set of coefficients.
    #[derive(Debug)]
    struct FixedMerge(Vec<BranchWeight>);

    impl MergeStrategy for FixedMerge {
        fn draw(&self, channels: usize, _rng: &mut dyn RngCore) -> Vec<BranchWeight> {
            assert_eq!(channels, self.0.len());
            self.0.clone()
        }
    }

    fn random_map(shape: (usize, usize, usize, usize), seed: u64) -> FeatureMap {
        let mut rng = StdRng::seed_from_u64(seed);
        FeatureMap::from_shape_fn(shape, |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn test_from_draw_bins() {
        assert_eq!(BranchWeight::from_draw(0.0), BranchWeight::BRANCH1_ONLY);
        assert_eq!(BranchWeight::from_draw(0.3), BranchWeight::BRANCH1_ONLY);
        assert_eq!(BranchWeight::from_draw(0.34), BranchWeight::BRANCH2_ONLY);
        assert_eq!(BranchWeight::from_draw(0.66), BranchWeight::BRANCH2_ONLY);
        assert_eq!(BranchWeight::from_draw(0.67), BranchWeight::EVEN);
        assert_eq!(BranchWeight::from_draw(0.999), BranchWeight::EVEN);
    }

    #[test]
    fn test_merge_branches_formula() {
        let b1 = FeatureMap::from_elem((1, 3, 1, 1), 4.0);
        let b2 = FeatureMap::from_elem((1, 3, 1, 1), 2.0);
        let weights = [BranchWeight::BRANCH1_ONLY, BranchWeight::BRANCH2_ONLY, BranchWeight::EVEN];
        let merged = merge_branches(&b1, &b2, &weights);
        assert_eq!(merged[[0, 0, 0, 0]], 4.0);
        assert_eq!(merged[[0, 1, 0, 0]], 2.0);
        assert_eq!(merged[[0, 2, 0, 0]], 3.0);
    }

    #[test]
    fn test_inference_is_bit_identical() {
        let mut rng = StdRng::seed_from_u64(3);
        let block = StochasticDualPathBlock::new(6, 0.01, &mut rng);
        let input = random_map((2, 6, 3, 3), 17);
        let first = block.infer(&input);
        let second = block.infer(&input);
        assert_eq!(first, second);

        let rebuilt = block.clone();
        assert_eq!(rebuilt.infer(&input), first);
    }

    #[test]
    fn test_inference_equals_even_training_pass() {
        let mut rng = StdRng::seed_from_u64(4);
        let block = StochasticDualPathBlock::new(4, 0.01, &mut rng)
            .with_merge_strategy(Arc::new(FixedMerge(vec![BranchWeight::EVEN; 4])));
        let input = random_map((1, 4, 2, 2), 8);
        let (train_out, _) = block.forward_train(&input, &mut rng);
        assert_eq!(block.infer(&input), train_out);
    }

    #[test]
    fn test_distillation_is_pre_activation_sum() {
        let mut rng = StdRng::seed_from_u64(5);
        let block = StochasticDualPathBlock::new(3, 0.2, &mut rng);
        let input = random_map((1, 3, 2, 2), 21);
        let out = block.infer(&input);
        assert_eq!(out.features, leaky_relu(&out.distillation, 0.2));
    }

    #[test]
    fn test_tri_modal_distribution_over_forward_calls() {
        let channels = 4;
        let mut block = StochasticDualPathBlock::new(channels, 0.01, &mut StdRng::seed_from_u64(1));
        for (_, w) in block.parameters_mut() {
            w.fill(0.0);
        }
        // conv1 = I, branch1 = I, branch2 = 0: the merged value is 0.5 * w1 * x.
        block.conv1 = Array2::eye(channels);
        block.branch1 = Array2::eye(channels);
        let input = FeatureMap::from_elem((1, channels, 1, 1), 1.0);

        let mut rng = StdRng::seed_from_u64(2024);
        let calls = 10_000;
        let (mut only1, mut only2, mut even) = (0usize, 0usize, 0usize);
        for _ in 0..calls {
            let (out, _) = block.forward_train(&input, &mut rng);
            for c in 0..channels {
                let merged = out.distillation[[0, c, 0, 0]] - 1.0;
                if (merged - 1.0).abs() < 1e-6 {
                    only1 += 1;
                } else if merged.abs() < 1e-6 {
                    only2 += 1;
                } else if (merged - 0.5).abs() < 1e-6 {
                    even += 1;
                } else {
                    panic!("unexpected merged value {merged}");
                }
            }
        }
        let total = (calls * channels) as f64;
        for (count, label) in [(only1, "branch1"), (only2, "branch2"), (even, "even")] {
            let fraction = count as f64 / total;
            assert!(
                (fraction - 1.0 / 3.0).abs() < 0.02,
                "{label} fraction {fraction} outside tolerance"
            );
        }
    }

    #[test]
    fn test_tri_modal_merge_is_seed_deterministic() {
        let a = TriModalMerge.draw(32, &mut StdRng::seed_from_u64(9));
        let b = TriModalMerge.draw(32, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    fn objective(
        block: &StochasticDualPathBlock,
        input: &FeatureMap,
        g_out: &FeatureMap,
        g_dist: &FeatureMap,
    ) -> f32 {
        let mut rng = StdRng::seed_from_u64(0);
        let (out, _) = block.forward_train(input, &mut rng);
        (&out.features * g_out).sum() + (&out.distillation * g_dist).sum()
    }

    #[test]
    fn test_dual_path_backward_matches_finite_differences() {
        // Slope 1 keeps the block linear in any single weight, so differences are exact.
        let weights = vec![
            BranchWeight::BRANCH1_ONLY,
            BranchWeight::BRANCH2_ONLY,
            BranchWeight::EVEN,
        ];
        let block = StochasticDualPathBlock::new(3, 1.0, &mut StdRng::seed_from_u64(12))
            .with_merge_strategy(Arc::new(FixedMerge(weights)));
        let input = random_map((2, 3, 2, 2), 31);
        let g_out = random_map((2, 3, 2, 2), 32);
        let g_dist = random_map((2, 3, 2, 2), 33);

        let (_, cache) = block.forward_train(&input, &mut StdRng::seed_from_u64(0));
        let (grad_input, grads) = block.backward(&cache, &g_out, Some(&g_dist));
        let base = objective(&block, &input, &g_out, &g_dist);
        let eps = 1e-2;

        for (name, index) in [
            ("conv1.weight", [0, 1]),
            ("branch1.weight", [2, 0]),
            ("branch2.weight", [1, 2]),
        ] {
            let mut bumped = block.clone();
            for (param, w) in bumped.parameters_mut() {
                if param == name {
                    w[index] += eps;
                }
            }
            let numeric = (objective(&bumped, &input, &g_out, &g_dist) - base) / eps;
            let analytic = grads[name][index.as_slice()];
            assert!(
                (numeric - analytic).abs() < 1e-2,
                "{name}: numeric {numeric} vs analytic {analytic}"
            );
        }

        let mut bumped_input = input.clone();
        bumped_input[[1, 2, 0, 1]] += eps;
        let numeric = (objective(&block, &bumped_input, &g_out, &g_dist) - base) / eps;
        assert!((numeric - grad_input[[1, 2, 0, 1]]).abs() < 1e-2);
    }

    #[test]
    fn test_branch_excluded_from_pass_gets_zero_gradient() {
        let block = StochasticDualPathBlock::new(2, 0.01, &mut StdRng::seed_from_u64(6))
            .with_merge_strategy(Arc::new(FixedMerge(vec![BranchWeight::BRANCH1_ONLY; 2])));
        let input = random_map((1, 2, 2, 2), 40);
        let (_, cache) = block.forward_train(&input, &mut StdRng::seed_from_u64(0));
        let g = random_map((1, 2, 2, 2), 41);
        let (_, grads) = block.backward(&cache, &g, None);
        assert!(grads["branch2.weight"].iter().all(|&v| v == 0.0));
        assert!(grads["branch1.weight"].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_residual_block_is_deterministic_in_training() {
        let block = EncoderBlock::new(BlockKind::Residual, 3, 0.01, &mut StdRng::seed_from_u64(7));
        let input = random_map((1, 3, 2, 2), 50);
        let (a, _) = block.forward_train(&input, &mut StdRng::seed_from_u64(1));
        let (b, _) = block.forward_train(&input, &mut StdRng::seed_from_u64(2));
        assert_eq!(a, b);
        assert_eq!(block.infer(&input), a);
        assert_eq!(block.parameters().len(), 2);
    }

    #[test]
    fn test_encoder_block_dispatches_backward() {
        let block = EncoderBlock::new(BlockKind::DualPath, 3, 0.01, &mut StdRng::seed_from_u64(8));
        let input = random_map((1, 3, 2, 2), 60);
        let (out, cache) = block.forward_train(&input, &mut StdRng::seed_from_u64(3));
        let (grad_input, grads) = block.backward(&cache, &out.features, None);
        assert_eq!(grad_input.dim(), input.dim());
        assert_eq!(grads.len(), 3);
    }
}
