use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::block::BlockKind;
use crate::error::{ModelError, ModelResult};

/// Output channels of the four stages before expansion.
pub const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];
/// First-block stride of each stage. Stage one keeps full resolution since
/// the stem does not downsample 32x32 inputs.
pub const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];
pub const RESNET18_BLOCKS: [usize; 4] = [2, 2, 2, 2];
pub const RESNET34_BLOCKS: [usize; 4] = [3, 4, 6, 3];

fn default_in_channels() -> usize {
    3
}

fn default_stem_width() -> usize {
    64
}

fn default_stage_widths() -> [usize; 4] {
    STAGE_WIDTHS
}

fn default_stage_strides() -> [usize; 4] {
    STAGE_STRIDES
}

/// Declarative description of a network topology.
///
/// `num_classes` has no default and must always be supplied.
///
/// ```json
/// { "block": "basic", "num_blocks": [2, 2, 2, 2], "num_classes": 10 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResNetConfig {
    #[serde(default)]
    pub block: BlockKind,
    pub num_blocks: [usize; 4],
    pub num_classes: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_stem_width")]
    pub stem_width: usize,
    #[serde(default = "default_stage_widths")]
    pub stage_widths: [usize; 4],
    #[serde(default = "default_stage_strides")]
    pub stage_strides: [usize; 4],
    /// Seed for parameter initialisation; fresh entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ResNetConfig {
    pub fn new(block: BlockKind, num_blocks: [usize; 4], num_classes: usize) -> Self {
        ResNetConfig {
            block,
            num_blocks,
            num_classes,
            in_channels: default_in_channels(),
            stem_width: default_stem_width(),
            stage_widths: STAGE_WIDTHS,
            stage_strides: STAGE_STRIDES,
            seed: None,
        }
    }

    /// The 18-layer topology: two basic blocks per stage.
    pub fn resnet18(num_classes: usize) -> Self {
        Self::new(BlockKind::Basic, RESNET18_BLOCKS, num_classes)
    }

    /// The 34-layer topology: 3, 4, 6 and 3 basic blocks.
    pub fn resnet34(num_classes: usize) -> Self {
        Self::new(BlockKind::Basic, RESNET34_BLOCKS, num_classes)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_in_channels(mut self, in_channels: usize) -> Self {
        self.in_channels = in_channels;
        self
    }

    /// Override the stem and stage widths, e.g. to build a narrow test network.
    pub fn with_widths(mut self, stem_width: usize, stage_widths: [usize; 4]) -> Self {
        self.stem_width = stem_width;
        self.stage_widths = stage_widths;
        self
    }

    /// Channels reaching the classifier.
    pub fn feature_width(&self) -> usize {
        let last_stage = self.num_blocks.iter().rposition(|&n| n > 0);
        match last_stage {
            Some(s) => self.stage_widths[s] * self.block.expansion(),
            None => self.stem_width,
        }
    }

    /// Product of the strides of all non-empty stages.
    pub fn downsampling_factor(&self) -> usize {
        self.num_blocks
            .iter()
            .zip(self.stage_strides)
            .filter(|&(&n, _)| n > 0)
            .map(|(_, s)| s)
            .product()
    }

    pub fn validate(&self) -> ModelResult<()> {
        if self.num_classes == 0 {
            return Err(ModelError::InvalidConfig(
                "num_classes must be at least 1".to_string(),
            ));
        }
        if self.in_channels == 0 || self.stem_width == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "in_channels ({}) and stem_width ({}) must be non-zero",
                self.in_channels, self.stem_width
            )));
        }
        if let Some(s) = self.stage_widths.iter().position(|&w| w == 0) {
            return Err(ModelError::InvalidConfig(format!(
                "stage {} has zero width",
                s + 1
            )));
        }
        if let Some(s) = self.stage_strides.iter().position(|&st| st == 0) {
            return Err(ModelError::InvalidConfig(format!(
                "stage {} has zero stride",
                s + 1
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> ModelResult<Self> {
        let config: ResNetConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> ModelResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> ModelResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
