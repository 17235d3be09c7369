use cifar_resnet_core::{Float, Tensor, TensorResult};

/// Whether normalization layers use batch statistics (and update their
/// running estimates) or the frozen running estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

/// Trait for a neural network layer or a composition of layers.
///
/// Layers are forward-only; an external trainer reaches the learnable
/// tensors through [`Module::parameters_mut`].
pub trait Module<T: Float>: Send + Sync {
    /// Forward pass.
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>>;

    /// Trainable tensors keyed by their dotted path inside this module.
    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)>;

    /// Mutable access to the trainable tensors, in `named_parameters` order.
    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>>;

    /// Switch between training and inference behaviour.
    fn set_mode(&mut self, _mode: Mode) {}

    fn parameters(&self) -> Vec<&Tensor<T>> {
        self.named_parameters().into_iter().map(|(_, t)| t).collect()
    }

    /// Number of trainable scalars.
    fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.numel()).sum()
    }
}

/// Prefix every name in `params` with `scope.`.
pub fn scoped<'a, T: Float>(
    scope: &str,
    params: Vec<(String, &'a Tensor<T>)>,
) -> Vec<(String, &'a Tensor<T>)> {
    params
        .into_iter()
        .map(|(name, t)| (format!("{scope}.{name}"), t))
        .collect()
}
