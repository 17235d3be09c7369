use cifar_resnet_core::{Float, Tensor, TensorResult};
use cifar_resnet_nn::{scoped, BatchNorm2d, Conv2d, Mode, Module, ReLU};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The residual block variants a network can be assembled from.
///
/// Each variant pairs its constructor with its channel expansion factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Two 3x3 convolutions, expansion 1 (ResNet-18/34).
    #[default]
    Basic,
}

impl BlockKind {
    /// Ratio between a block's output channels and its `out_channels` argument.
    pub const fn expansion(self) -> usize {
        match self {
            BlockKind::Basic => BasicBlock::<f32>::EXPANSION,
        }
    }

    pub fn build<T: Float, R: Rng>(
        self,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        rng: &mut R,
    ) -> TensorResult<BasicBlock<T>> {
        match self {
            BlockKind::Basic => BasicBlock::new(in_channels, out_channels, stride, rng),
        }
    }
}

/// The additive path of a residual block.
pub enum Shortcut<T: Float> {
    /// Input passes through untouched.
    Identity,
    /// 1x1 convolution + batch norm matching the main path's output shape.
    Projection { conv: Conv2d<T>, bn: BatchNorm2d<T> },
}

impl<T: Float> Shortcut<T> {
    pub fn is_identity(&self) -> bool {
        matches!(self, Shortcut::Identity)
    }
}

impl<T: Float> Module<T> for Shortcut<T> {
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        match self {
            Shortcut::Identity => Ok(input.clone()),
            Shortcut::Projection { conv, bn } => bn.forward(&conv.forward(input)?),
        }
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> {
        match self {
            Shortcut::Identity => vec![],
            Shortcut::Projection { conv, bn } => {
                let mut params = scoped("conv", conv.named_parameters());
                params.extend(scoped("bn", bn.named_parameters()));
                params
            }
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> {
        match self {
            Shortcut::Identity => vec![],
            Shortcut::Projection { conv, bn } => {
                let mut params = conv.parameters_mut();
                params.extend(bn.parameters_mut());
                params
            }
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        if let Shortcut::Projection { bn, .. } = self {
            bn.set_mode(mode);
        }
    }
}

/// Basic residual block.
///
/// Structure: conv3x3(stride) -> BN -> ReLU -> conv3x3 -> BN, plus the
/// shortcut, then a single ReLU after the addition.
pub struct BasicBlock<T: Float> {
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    conv1: Conv2d<T>,
    bn1: BatchNorm2d<T>,
    conv2: Conv2d<T>,
    bn2: BatchNorm2d<T>,
    relu: ReLU,
    shortcut: Shortcut<T>,
}

impl<T: Float> BasicBlock<T> {
    pub const EXPANSION: usize = 1;

    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        rng: &mut R,
    ) -> TensorResult<Self> {
        let expanded = out_channels * Self::EXPANSION;
        let conv1 = Conv2d::new(in_channels, out_channels, 3, stride, 1, false, rng)?;
        let bn1 = BatchNorm2d::new(out_channels)?;
        let conv2 = Conv2d::new(out_channels, expanded, 3, 1, 1, false, rng)?;
        let bn2 = BatchNorm2d::new(expanded)?;

        let shortcut = if Self::needs_projection(in_channels, out_channels, stride) {
            debug!(in_channels, out_channels = expanded, stride, "projection shortcut");
            Shortcut::Projection {
                conv: Conv2d::new(in_channels, expanded, 1, stride, 0, false, rng)?,
                bn: BatchNorm2d::new(expanded)?,
            }
        } else {
            Shortcut::Identity
        };

        Ok(BasicBlock {
            in_channels,
            out_channels,
            stride,
            conv1,
            bn1,
            conv2,
            bn2,
            relu: ReLU,
            shortcut,
        })
    }

    /// The identity shortcut only fits when neither resolution nor width changes.
    pub fn needs_projection(in_channels: usize, out_channels: usize, stride: usize) -> bool {
        stride != 1 || in_channels != out_channels * Self::EXPANSION
    }

    /// Channels produced by this block.
    pub fn output_channels(&self) -> usize {
        self.out_channels * Self::EXPANSION
    }

    pub fn shortcut(&self) -> &Shortcut<T> {
        &self.shortcut
    }
}

impl<T: Float> Module<T> for BasicBlock<T> {
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let out = self.bn1.forward(&self.conv1.forward(input)?)?;
        let out = self.relu.forward(&out)?;
        let mut out = self.bn2.forward(&self.conv2.forward(&out)?)?;

        match &self.shortcut {
            Shortcut::Identity => out.add_assign(input)?,
            projection => out.add_assign(&projection.forward(input)?)?,
        }
        out.relu_mut();
        Ok(out)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> {
        let mut params = scoped("conv1", self.conv1.named_parameters());
        params.extend(scoped("bn1", self.bn1.named_parameters()));
        params.extend(scoped("conv2", self.conv2.named_parameters()));
        params.extend(scoped("bn2", self.bn2.named_parameters()));
        params.extend(scoped("shortcut", self.shortcut.named_parameters()));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> {
        let mut params = self.conv1.parameters_mut();
        params.extend(self.bn1.parameters_mut());
        params.extend(self.conv2.parameters_mut());
        params.extend(self.bn2.parameters_mut());
        params.extend(self.shortcut.parameters_mut());
        params
    }

    fn set_mode(&mut self, mode: Mode) {
        self.bn1.set_mode(mode);
        self.bn2.set_mode(mode);
        self.shortcut.set_mode(mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cifar_resnet_core::TensorError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn test_output_channels_for_every_shortcut() {
        let x: Tensor<f32> = Tensor::randn(vec![2, 8, 8, 8], Some(1));
        for (in_ch, out_ch, stride) in [(8, 8, 1), (8, 16, 1), (8, 8, 2), (8, 16, 2)] {
            let block = BasicBlock::new(in_ch, out_ch, stride, &mut rng()).unwrap();
            let y = block.forward(&x).unwrap();
            let side = 8 / stride;
            assert_eq!(y.shape_vec(), vec![2, out_ch * BasicBlock::<f32>::EXPANSION, side, side]);
            assert_eq!(
                block.shortcut().is_identity(),
                in_ch == out_ch && stride == 1,
                "({in_ch}, {out_ch}, {stride})"
            );
        }
    }

    #[test]
    fn test_identity_shortcut_returns_input() {
        let block = BasicBlock::<f64>::new(4, 4, 1, &mut rng()).unwrap();
        let x: Tensor<f64> = Tensor::randn(vec![1, 4, 5, 5], Some(2));
        assert!(block.shortcut().is_identity());
        assert_eq!(block.shortcut().forward(&x).unwrap(), x);
        assert!(block.shortcut().named_parameters().is_empty());
    }

    #[test]
    fn test_projection_shortcut_shape() {
        let block = BasicBlock::<f32>::new(64, 128, 2, &mut rng()).unwrap();
        let x: Tensor<f32> = Tensor::randn(vec![2, 64, 8, 8], Some(3));
        let s = block.shortcut().forward(&x).unwrap();
        assert_eq!(s.shape_vec(), vec![2, 128, 4, 4]);

        let names: Vec<String> = block
            .shortcut()
            .named_parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["conv.weight", "bn.weight", "bn.bias"]);
    }

    #[test]
    fn test_output_is_rectified() {
        let block = BasicBlock::<f32>::new(3, 6, 2, &mut rng()).unwrap();
        let x: Tensor<f32> = Tensor::randn(vec![3, 3, 6, 6], Some(4));
        let y = block.forward(&x).unwrap();
        assert!(y.data().iter().all(|&v| v >= 0.0));
        assert!(y.data().iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_zeroed_main_path_leaves_relu_of_input() {
        // With the second BN scaled to zero the block reduces to relu(x).
        let mut block = BasicBlock::<f64>::new(2, 2, 1, &mut rng()).unwrap();
        block.bn2.gamma = Tensor::zeros(vec![2]);
        let x: Tensor<f64> = Tensor::randn(vec![2, 2, 4, 4], Some(5));
        let y = block.forward(&x).unwrap();
        assert_eq!(y, x.relu());
    }

    #[test]
    fn test_parameter_layout() {
        let plain = BasicBlock::<f32>::new(64, 64, 1, &mut rng()).unwrap();
        assert_eq!(plain.num_parameters(), 2 * 64 * 64 * 9 + 2 * 2 * 64);

        let projected = BasicBlock::<f32>::new(64, 128, 2, &mut rng()).unwrap();
        assert_eq!(
            projected.num_parameters(),
            128 * 64 * 9 + 128 * 128 * 9 + 128 * 64 + 3 * 2 * 128
        );
    }

    #[test]
    fn test_zero_channels_surface_primitive_error() {
        assert!(matches!(
            BasicBlock::<f32>::new(0, 64, 1, &mut rng()),
            Err(TensorError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_block_kind_expansion() {
        assert_eq!(BlockKind::Basic.expansion(), 1);
        let block: BasicBlock<f32> = BlockKind::Basic.build(16, 32, 2, &mut rng()).unwrap();
        assert_eq!(block.output_channels(), 32);
        assert_eq!(block.stride, 2);
    }
}
