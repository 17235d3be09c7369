//! The residual network: stem, four stages of residual blocks and a linear head.
//!
//! Unlike the ImageNet variant the stem is a single stride-1 3x3 convolution
//! with no max pool, so a 32x32 input reaches the head as a 4x4 map.

use cifar_resnet_core::{Float, Tensor, TensorResult};
use cifar_resnet_nn::{
    scoped, AdaptiveAvgPool2d, BatchNorm2d, Conv2d, Flatten, Linear, Mode, Module, ReLU,
    Sequential,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};

use crate::block::{BasicBlock, BlockKind};
use crate::config::ResNetConfig;
use crate::error::ModelResult;

/// Strides of the blocks in one stage: only the first block downsamples.
pub fn stride_schedule(stride: usize, num_blocks: usize) -> Vec<usize> {
    std::iter::once(stride)
        .chain(std::iter::repeat(1))
        .take(num_blocks)
        .collect()
}

/// An ordered run of residual blocks sharing one output width.
pub struct Stage<T: Float> {
    blocks: Vec<BasicBlock<T>>,
}

impl<T: Float> Stage<T> {
    pub fn blocks(&self) -> &[BasicBlock<T>] {
        &self.blocks
    }

    /// Stride of each block, in order.
    pub fn strides(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.stride).collect()
    }
}

impl<T: Float> Module<T> for Stage<T> {
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let mut blocks = self.blocks.iter();
        let Some(first) = blocks.next() else {
            return Ok(input.clone());
        };
        let mut x = first.forward(input)?;
        for block in blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(i, block)| scoped(&format!("blocks.{i}"), block.named_parameters()))
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> {
        self.blocks
            .iter_mut()
            .flat_map(|block| block.parameters_mut())
            .collect()
    }

    fn set_mode(&mut self, mode: Mode) {
        for block in &mut self.blocks {
            block.set_mode(mode);
        }
    }
}

/// Build one stage and return it with the channel count the next stage
/// receives.
///
/// `in_channels` is the running channel count: each block consumes it and
/// leaves `width * expansion` behind for its successor.
pub fn make_stage<T: Float, R: Rng>(
    kind: BlockKind,
    in_channels: usize,
    width: usize,
    num_blocks: usize,
    stride: usize,
    rng: &mut R,
) -> TensorResult<(Stage<T>, usize)> {
    let mut channels = in_channels;
    let mut blocks = Vec::with_capacity(num_blocks);
    for block_stride in stride_schedule(stride, num_blocks) {
        blocks.push(kind.build(channels, width, block_stride, rng)?);
        channels = width * kind.expansion();
    }
    Ok((Stage { blocks }, channels))
}

/// Residual network classifier.
///
/// Input `(N, in_channels, H, W)`, output logits `(N, num_classes)`.
pub struct ResNet<T: Float> {
    config: ResNetConfig,
    stem: Sequential<T>,
    stages: Vec<Stage<T>>,
    pool: AdaptiveAvgPool2d,
    flatten: Flatten,
    fc: Linear<T>,
}

impl<T: Float> ResNet<T> {
    /// Build the network described by `config`, seeding initialisation from
    /// `config.seed` when present.
    pub fn from_config(config: &ResNetConfig) -> ModelResult<Self> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, &mut rng)
    }

    /// Build the network drawing initial parameters from `rng`.
    pub fn with_rng<R: Rng>(config: &ResNetConfig, rng: &mut R) -> ModelResult<Self> {
        config.validate()?;

        let stem = Sequential::new()
            .add(Conv2d::new(config.in_channels, config.stem_width, 3, 1, 1, false, rng)?)
            .add(BatchNorm2d::new(config.stem_width)?)
            .add(ReLU);

        let mut channels = config.stem_width;
        let mut stages = Vec::with_capacity(4);
        for (s, ((&width, &stride), &num_blocks)) in config
            .stage_widths
            .iter()
            .zip(&config.stage_strides)
            .zip(&config.num_blocks)
            .enumerate()
        {
            let (stage, next) = make_stage(config.block, channels, width, num_blocks, stride, rng)?;
            debug!(
                stage = s + 1,
                width,
                stride,
                blocks = num_blocks,
                in_channels = channels,
                out_channels = next,
                "built stage"
            );
            channels = next;
            stages.push(stage);
        }

        let fc = Linear::new(channels, config.num_classes, rng)?;
        let net = ResNet {
            config: config.clone(),
            stem,
            stages,
            pool: AdaptiveAvgPool2d::global(),
            flatten: Flatten,
            fc,
        };
        info!(
            block = ?config.block,
            num_blocks = ?config.num_blocks,
            num_classes = config.num_classes,
            parameters = net.num_parameters(),
            "built resnet"
        );
        Ok(net)
    }

    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    pub fn stages(&self) -> &[Stage<T>] {
        &self.stages
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    /// Channels entering the classifier.
    pub fn feature_width(&self) -> usize {
        self.fc.in_features
    }

    /// Pooled feature vectors `(N, feature_width)` preceding the classifier.
    pub fn features(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let mut x = self.stem.forward(input)?;
        trace!(shape = %x.shape(), "stem");
        for (s, stage) in self.stages.iter().enumerate() {
            x = stage.forward(&x)?;
            trace!(stage = s + 1, shape = %x.shape(), "stage");
        }
        let pooled = self.pool.forward(&x)?;
        self.flatten.forward(&pooled)
    }

    /// Most likely class index for each sample.
    pub fn predict(&self, input: &Tensor<T>) -> TensorResult<Vec<usize>> {
        self.forward(input)?.argmax_rows()
    }
}

impl<T: Float> Module<T> for ResNet<T> {
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let features = self.features(input)?;
        self.fc.forward(&features)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> {
        let mut params = scoped("stem", self.stem.named_parameters());
        for (s, stage) in self.stages.iter().enumerate() {
            params.extend(scoped(&format!("stages.{s}"), stage.named_parameters()));
        }
        params.extend(scoped("fc", self.fc.named_parameters()));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> {
        let mut params = self.stem.parameters_mut();
        for stage in &mut self.stages {
            params.extend(stage.parameters_mut());
        }
        params.extend(self.fc.parameters_mut());
        params
    }

    fn set_mode(&mut self, mode: Mode) {
        self.stem.set_mode(mode);
        for stage in &mut self.stages {
            stage.set_mode(mode);
        }
    }
}

/// ResNet-18 for small images: `[2, 2, 2, 2]` basic blocks.
pub fn resnet18<T: Float>(num_classes: usize) -> ModelResult<ResNet<T>> {
    ResNet::from_config(&ResNetConfig::resnet18(num_classes))
}

/// ResNet-34 for small images: `[3, 4, 6, 3]` basic blocks.
pub fn resnet34<T: Float>(num_classes: usize) -> ModelResult<ResNet<T>> {
    ResNet::from_config(&ResNetConfig::resnet34(num_classes))
}
