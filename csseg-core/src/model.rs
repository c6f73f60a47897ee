//! Reference segmentor: a 1×1 stem, a stack of encoder blocks and one
//! classifier head per task. Logits are the concatenation of all heads, so
//! output channel `c` is class label `c`.

use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD, Axis, concatenate, s};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockKind, EncoderBlock, EncoderBlockCache};
use crate::error::ShapeMismatchError;
use crate::tensor::{
    FeatureMap, Gradients, ParamTensor, StateDict, add_channel_bias, channel_mix,
    channel_mix_backward, channel_sums, leaky_relu, leaky_relu_backward, normal_matrix,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegmentorConfig {
    /// Channels of the input images.
    pub in_channels: usize,
    /// Width of the encoder.
    pub feature_channels: usize,
    pub num_blocks: usize,
    pub block: BlockKind,
    pub negative_slope: f32,
    /// Resize convention when logits are upsampled to the label size.
    pub align_corners: bool,
}

impl Default for SegmentorConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            feature_channels: 16,
            num_blocks: 2,
            block: BlockKind::DualPath,
            negative_slope: 0.01,
            align_corners: false,
        }
    }
}

/// How strictly [`Segmentor::load_state_dict`] matches names and shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Every parameter must be present with the right shape; no extras.
    Strict,
    /// Copy what matches by name and shape, keep the rest as initialized.
    Partial,
}

/// What a load did, by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
    pub unexpected: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentorOutput {
    pub logits: FeatureMap,
    /// One distillation feature per encoder block, in block order.
    pub distillation: Vec<FeatureMap>,
}

#[derive(Debug, Clone)]
struct ClassifierHead {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

/// Activations kept from a training forward pass.
#[derive(Debug)]
pub struct SegmentorCache {
    input: FeatureMap,
    pre_stem: FeatureMap,
    block_caches: Vec<EncoderBlockCache>,
    features: FeatureMap,
}

#[derive(Debug, Clone)]
pub struct Segmentor {
    config: SegmentorConfig,
    stem: Array2<f32>,
    blocks: Vec<EncoderBlock>,
    heads: Vec<ClassifierHead>,
}

impl Segmentor {
    /// Build a model with one head per entry of `classes_per_task`.
    pub fn new<R: Rng + ?Sized>(
        config: SegmentorConfig,
        classes_per_task: &[usize],
        rng: &mut R,
    ) -> Self {
        let feats = config.feature_channels;
        let stem_std = (1.0 / config.in_channels.max(1) as f32).sqrt();
        let stem = normal_matrix(feats, config.in_channels, stem_std, rng);
        let blocks = (0..config.num_blocks)
            .map(|_| EncoderBlock::new(config.block, feats, config.negative_slope, rng))
            .collect();
        let mut model = Self {
            config,
            stem,
            blocks,
            heads: Vec::new(),
        };
        for &num_classes in classes_per_task {
            model.add_classifier(num_classes, rng);
        }
        model
    }

    /// Append a classifier head for a new task's classes.
    pub fn add_classifier<R: Rng + ?Sized>(&mut self, num_classes: usize, rng: &mut R) {
        let feats = self.config.feature_channels;
        self.heads.push(ClassifierHead {
            weight: normal_matrix(num_classes, feats, (1.0 / feats.max(1) as f32).sqrt(), rng),
            bias: Array1::zeros(num_classes),
        });
    }

    pub fn config(&self) -> &SegmentorConfig {
        &self.config
    }

    pub fn align_corners(&self) -> bool {
        self.config.align_corners
    }

    pub fn classes_per_task(&self) -> Vec<usize> {
        self.heads.iter().map(|h| h.bias.len()).collect()
    }

    /// Total output channels.
    pub fn num_classes(&self) -> usize {
        self.heads.iter().map(|h| h.bias.len()).sum()
    }

    fn classify(&self, features: &FeatureMap) -> FeatureMap {
        let per_head: Vec<FeatureMap> = self
            .heads
            .iter()
            .map(|head| {
                let mut logits = channel_mix(head.weight.view(), features);
                add_channel_bias(&mut logits, &head.bias);
                logits
            })
            .collect();
        let views: Vec<_> = per_head.iter().map(|l| l.view()).collect();
        match concatenate(Axis(1), &views) {
            Ok(logits) => logits,
            // Only reachable with zero heads.
            Err(_) => {
                let (batch, _, height, width) = features.dim();
                FeatureMap::zeros((batch, 0, height, width))
            }
        }
    }

    /// Deterministic forward pass: every block uses its inference merge.
    pub fn infer(&self, input: &FeatureMap) -> SegmentorOutput {
        let mut features = leaky_relu(
            &channel_mix(self.stem.view(), input),
            self.config.negative_slope,
        );
        let mut distillation = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let out = block.infer(&features);
            features = out.features;
            distillation.push(out.distillation);
        }
        SegmentorOutput {
            logits: self.classify(&features),
            distillation,
        }
    }

    /// Training forward pass. Dual-path blocks draw their merge from `rng`.
    pub fn forward_train(
        &self,
        input: &FeatureMap,
        rng: &mut dyn RngCore,
    ) -> (SegmentorOutput, SegmentorCache) {
        let pre_stem = channel_mix(self.stem.view(), input);
        let mut features = leaky_relu(&pre_stem, self.config.negative_slope);
        let mut distillation = Vec::with_capacity(self.blocks.len());
        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (out, cache) = block.forward_train(&features, rng);
            features = out.features;
            distillation.push(out.distillation);
            block_caches.push(cache);
        }
        let output = SegmentorOutput {
            logits: self.classify(&features),
            distillation,
        };
        let cache = SegmentorCache {
            input: input.clone(),
            pre_stem,
            block_caches,
            features,
        };
        (output, cache)
    }

    /// Analytic gradients of every parameter, keyed like [`Segmentor::state_dict`].
    pub fn backward(
        &self,
        cache: &SegmentorCache,
        grad_logits: &FeatureMap,
        grad_distillation: Option<&[FeatureMap]>,
    ) -> Gradients {
        let mut grads = Gradients::new();
        let mut grad_features = FeatureMap::zeros(cache.features.raw_dim());

        let mut offset = 0;
        for (t, head) in self.heads.iter().enumerate() {
            let n = head.bias.len();
            let grad_head = grad_logits.slice(s![.., offset..offset + n, .., ..]).to_owned();
            let (grad_weight, grad_input) =
                channel_mix_backward(head.weight.view(), &cache.features, &grad_head);
            grads.insert(format!("classifier.{t}.weight"), grad_weight.into_dyn());
            grads.insert(format!("classifier.{t}.bias"), channel_sums(&grad_head).into_dyn());
            grad_features += &grad_input;
            offset += n;
        }

        for (i, (block, block_cache)) in
            self.blocks.iter().zip(&cache.block_caches).enumerate().rev()
        {
            let grad_dist = grad_distillation.and_then(|g| g.get(i));
            let (grad_input, block_grads) = block.backward(block_cache, &grad_features, grad_dist);
            for (name, grad) in block_grads {
                grads.insert(format!("encoder.{i}.{name}"), grad);
            }
            grad_features = grad_input;
        }

        let grad_pre_stem =
            leaky_relu_backward(&cache.pre_stem, &grad_features, self.config.negative_slope);
        let (grad_stem, _) = channel_mix_backward(self.stem.view(), &cache.input, &grad_pre_stem);
        grads.insert("stem.weight".into(), grad_stem.into_dyn());
        grads
    }

    /// Named read-only views of every parameter.
    pub fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut params = vec![("stem.weight".to_string(), self.stem.view().into_dyn())];
        for (i, block) in self.blocks.iter().enumerate() {
            for (name, weight) in block.parameters() {
                params.push((format!("encoder.{i}.{name}"), weight.view().into_dyn()));
            }
        }
        for (t, head) in self.heads.iter().enumerate() {
            params.push((format!("classifier.{t}.weight"), head.weight.view().into_dyn()));
            params.push((format!("classifier.{t}.bias"), head.bias.view().into_dyn()));
        }
        params
    }

    /// Named mutable views of every parameter, in the same order as [`Segmentor::parameters`].
    pub fn parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        let mut params = vec![("stem.weight".to_string(), self.stem.view_mut().into_dyn())];
        for (i, block) in self.blocks.iter_mut().enumerate() {
            for (name, weight) in block.parameters_mut() {
                params.push((format!("encoder.{i}.{name}"), weight.view_mut().into_dyn()));
            }
        }
        for (t, head) in self.heads.iter_mut().enumerate() {
            params.push((format!("classifier.{t}.weight"), head.weight.view_mut().into_dyn()));
            params.push((format!("classifier.{t}.bias"), head.bias.view_mut().into_dyn()));
        }
        params
    }

    pub fn state_dict(&self) -> StateDict {
        self.parameters()
            .into_iter()
            .map(|(name, view)| (name, ParamTensor::from_array(&view)))
            .collect()
    }

    /// Copy parameters from `state`.
    ///
    /// A strict load validates everything before touching the model, so a
    /// failed load leaves the parameters unchanged.
    pub fn load_state_dict(
        &mut self,
        state: &StateDict,
        mode: LoadMode,
    ) -> Result<LoadReport, ShapeMismatchError> {
        let mut report = LoadReport::default();
        let own: Vec<(String, Vec<usize>)> = self
            .parameters()
            .into_iter()
            .map(|(name, view)| (name, view.shape().to_vec()))
            .collect();

        for (name, shape) in &own {
            match state.get(name) {
                None => {
                    if mode == LoadMode::Strict {
                        return Err(ShapeMismatchError::MissingParameter { name: name.clone() });
                    }
                    report.missing.push(name.clone());
                }
                Some(tensor) if !fits(tensor, shape) => {
                    if mode == LoadMode::Strict {
                        return Err(ShapeMismatchError::Parameter {
                            name: name.clone(),
                            expected: shape.clone(),
                            found: tensor.shape.clone(),
                        });
                    }
                    report.mismatched.push(name.clone());
                }
                Some(_) => report.loaded.push(name.clone()),
            }
        }
        for name in state.keys() {
            if !own.iter().any(|(own_name, _)| own_name == name) {
                if mode == LoadMode::Strict {
                    return Err(ShapeMismatchError::UnexpectedParameter { name: name.clone() });
                }
                report.unexpected.push(name.clone());
            }
        }

        for (name, mut view) in self.parameters_mut() {
            if !report.loaded.contains(&name) {
                continue;
            }
            if let Some(tensor) = state.get(&name) {
                for (dst, &src) in view.iter_mut().zip(&tensor.data) {
                    *dst = src;
                }
            }
        }
        Ok(report)
    }
}

fn fits(tensor: &ParamTensor, shape: &[usize]) -> bool {
    tensor.shape == shape && tensor.numel() == shape.iter().product::<usize>()
}
