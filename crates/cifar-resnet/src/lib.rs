//! ResNet classifiers for small (CIFAR-sized) images.
//!
//! The network is assembled from the forward-only layer primitives in
//! [`nn`]: a 3x3 stem, four stages of residual blocks and a global-pool
//! linear head.
//!
//! ```no_run
//! use cifar_resnet::{resnet18, core::Tensor, nn::Module};
//!
//! let net = resnet18::<f32>(10)?;
//! let images: Tensor<f32> = Tensor::randn(vec![4, 3, 32, 32], Some(0));
//! let logits = net.forward(&images)?;
//! assert_eq!(logits.shape_vec(), vec![4, 10]);
//! # Ok::<(), cifar_resnet::ModelError>(())
//! ```

/// Tensor engine.
pub use cifar_resnet_core as core;

/// Layer primitives.
pub use cifar_resnet_nn as nn;

pub mod block;
pub mod config;
pub mod error;
pub mod resnet;
pub mod telemetry;

pub use block::{BasicBlock, BlockKind, Shortcut};
pub use config::ResNetConfig;
pub use error::{ModelError, ModelResult};
pub use resnet::{make_stage, resnet18, resnet34, stride_schedule, ResNet, Stage};
pub use telemetry::init_tracing;
