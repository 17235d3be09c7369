use cifar_resnet_core::{Float, Tensor, TensorResult};

use crate::module::{scoped, Mode, Module};

/// Chains layers in order.
///
/// Parameters are named by layer position, e.g. `0.weight`, `1.bias`.
pub struct Sequential<T: Float> {
    layers: Vec<Box<dyn Module<T>>>,
}

impl<T: Float> Sequential<T> {
    pub fn new() -> Self {
        Sequential { layers: Vec::new() }
    }

    /// Add a layer to the model.
    pub fn add<M: Module<T> + 'static>(mut self, layer: M) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<T: Float> Module<T> for Sequential<T> {
    /// Forward pass through all layers.
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let mut layers = self.layers.iter();
        let Some(first) = layers.next() else {
            return Ok(input.clone());
        };
        let mut x = first.forward(input)?;
        for layer in layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| scoped(&i.to_string(), layer.named_parameters()))
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.parameters_mut())
            .collect()
    }

    fn set_mode(&mut self, mode: Mode) {
        for layer in &mut self.layers {
            layer.set_mode(mode);
        }
    }
}

impl<T: Float> Default for Sequential<T> {
    fn default() -> Self {
        Self::new()
    }
}
