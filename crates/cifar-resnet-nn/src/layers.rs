use cifar_resnet_core::{Float, Tensor, TensorError, TensorResult};
use rand::Rng;
use rayon::prelude::*;

use crate::init;
use crate::module::Module;

/// Fully connected (dense) layer: y = xWᵀ + b.
pub struct Linear<T: Float> {
    pub weight: Tensor<T>, // [out_features, in_features]
    pub bias: Tensor<T>,   // [out_features]
    pub in_features: usize,
    pub out_features: usize,
}

impl<T: Float> Linear<T> {
    pub fn new<R: Rng>(in_features: usize, out_features: usize, rng: &mut R) -> TensorResult<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(TensorError::InvalidOperation(format!(
                "Linear({in_features}, {out_features}) requires non-zero sizes"
            )));
        }
        Ok(Linear {
            weight: init::fan_in_uniform(vec![out_features, in_features], in_features, rng),
            bias: init::fan_in_uniform(vec![out_features], in_features, rng),
            in_features,
            out_features,
        })
    }
}

impl<T: Float> Module<T> for Linear<T> {
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        input.shape().expect_rank(2)?;
        let batch = input.shape().dims()[0];
        if input.shape().dims()[1] != self.in_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch, self.in_features],
                got: input.shape_vec(),
            });
        }
        let weight = self.weight.data();
        let bias = self.bias.data();

        let mut output = vec![T::ZERO; batch * self.out_features];
        output
            .par_chunks_mut(self.out_features)
            .zip(input.data().par_chunks(self.in_features))
            .for_each(|(out_row, x)| {
                for ((o, w_row), &b) in out_row
                    .iter_mut()
                    .zip(weight.chunks_exact(self.in_features))
                    .zip(bias)
                {
                    *o = x.iter().zip(w_row).map(|(&xi, &wi)| xi * wi).sum::<T>() + b;
                }
            });

        Tensor::new(output, vec![batch, self.out_features])
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> {
        vec![
            ("weight".to_string(), &self.weight),
            ("bias".to_string(), &self.bias),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// ReLU activation layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl<T: Float> Module<T> for ReLU {
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        Ok(input.relu())
    }
    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> { vec![] }
    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> { vec![] }
}

/// Reshapes input to [batch_size, features].
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl<T: Float> Module<T> for Flatten {
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let shape = input.shape_vec();
        if shape.is_empty() {
            return Err(TensorError::RankMismatch {
                expected: 2,
                got: shape,
            });
        }
        let batch = shape[0];
        let features: usize = shape[1..].iter().product();
        input.reshape(vec![batch, features])
    }
    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> { vec![] }
    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> { vec![] }
}
