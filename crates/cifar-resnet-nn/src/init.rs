//! Parameter initialisation.

use cifar_resnet_core::{Float, Tensor};
use rand::Rng;

/// Uniform in `±1/sqrt(fan_in)`, the default for convolution and linear
/// weights and biases (Kaiming-uniform with `a = sqrt(5)`).
pub fn fan_in_uniform<T: Float, R: Rng>(
    shape: Vec<usize>,
    fan_in: usize,
    rng: &mut R,
) -> Tensor<T> {
    let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
    Tensor::uniform(shape, -bound, bound, rng)
}
