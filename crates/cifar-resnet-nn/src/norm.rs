use std::sync::{Mutex, MutexGuard, PoisonError};

use cifar_resnet_core::{Float, Tensor, TensorError, TensorResult};

use crate::module::{Mode, Module};

#[derive(Debug, Clone)]
struct RunningStats {
    mean: Vec<f64>,
    var: Vec<f64>,
    batches_tracked: u64,
}

/// Batch Normalization over the channel axis of an image batch.
///
/// y = (x - μ) / √(σ² + ε) * γ + β, with μ and σ² taken per channel over
/// (batch, height, width). In [`Mode::Train`] the batch statistics are used
/// and folded into running estimates; in [`Mode::Eval`] the running
/// estimates are used unchanged.
pub struct BatchNorm2d<T: Float> {
    pub num_features: usize,
    pub eps: f64,
    pub momentum: f64,
    pub gamma: Tensor<T>, // [num_features]
    pub beta: Tensor<T>,  // [num_features]
    running: Mutex<RunningStats>,
    mode: Mode,
}

impl<T: Float> BatchNorm2d<T> {
    pub fn new(num_features: usize) -> TensorResult<Self> {
        if num_features == 0 {
            return Err(TensorError::InvalidOperation(
                "BatchNorm2d requires at least one feature".to_string(),
            ));
        }
        Ok(BatchNorm2d {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            gamma: Tensor::ones(vec![num_features]),
            beta: Tensor::zeros(vec![num_features]),
            running: Mutex::new(RunningStats {
                mean: vec![0.0; num_features],
                var: vec![1.0; num_features],
                batches_tracked: 0,
            }),
            mode: Mode::default(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn stats(&self) -> MutexGuard<'_, RunningStats> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn running_mean(&self) -> Vec<T> {
        self.stats().mean.iter().map(|&v| T::from_f64(v)).collect()
    }

    pub fn running_var(&self) -> Vec<T> {
        self.stats().var.iter().map(|&v| T::from_f64(v)).collect()
    }

    pub fn num_batches_tracked(&self) -> u64 {
        self.stats().batches_tracked
    }

    /// Per-channel biased mean and variance of the batch.
    fn batch_stats(&self, input: &Tensor<T>, batch: usize, plane: usize) -> (Vec<f64>, Vec<f64>) {
        let data = input.data();
        let count = (batch * plane) as f64;
        let mut mean = vec![0.0f64; self.num_features];
        let mut var = vec![0.0f64; self.num_features];

        for (c, (mu, sigma2)) in mean.iter_mut().zip(var.iter_mut()).enumerate() {
            let channel = (0..batch).flat_map(|b| {
                let start = (b * self.num_features + c) * plane;
                data[start..start + plane].iter()
            });
            let sum: f64 = channel.clone().map(|v| v.to_f64()).sum();
            *mu = sum / count;
            let sq: f64 = channel
                .map(|v| {
                    let d = v.to_f64() - *mu;
                    d * d
                })
                .sum();
            *sigma2 = sq / count;
        }
        (mean, var)
    }
}

impl<T: Float> Module<T> for BatchNorm2d<T> {
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let (batch, channels, h, w) = input.shape().nchw()?;
        if channels != self.num_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch, self.num_features, h, w],
                got: input.shape_vec(),
            });
        }
        let plane = h * w;

        let (mean, var) = match self.mode {
            Mode::Train => {
                let count = batch * plane;
                if count <= 1 {
                    return Err(TensorError::InvalidOperation(format!(
                        "Expected more than 1 value per channel when training, \
                         got input shape {:?}",
                        input.shape_vec()
                    )));
                }
                let (mean, var) = self.batch_stats(input, batch, plane);
                let unbias = count as f64 / (count - 1) as f64;
                let m = self.momentum;
                let mut running = self.stats();
                for c in 0..self.num_features {
                    running.mean[c] = (1.0 - m) * running.mean[c] + m * mean[c];
                    running.var[c] = (1.0 - m) * running.var[c] + m * var[c] * unbias;
                }
                running.batches_tracked += 1;
                (mean, var)
            }
            Mode::Eval => {
                let running = self.stats();
                (running.mean.clone(), running.var.clone())
            }
        };

        let mut output = input.clone();
        let gamma = self.gamma.data();
        let beta = self.beta.data();
        for (i, chunk) in output.data_mut().chunks_exact_mut(plane.max(1)).enumerate() {
            let c = i % self.num_features;
            let scale = gamma[c].to_f64() / (var[c] + self.eps).sqrt();
            let shift = beta[c].to_f64() - mean[c] * scale;
            for v in chunk.iter_mut() {
                *v = T::from_f64(v.to_f64() * scale + shift);
            }
        }
        Ok(output)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> {
        vec![
            ("weight".to_string(), &self.gamma),
            ("bias".to_string(), &self.beta),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> {
        vec![&mut self.gamma, &mut self.beta]
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }
}
