use cifar_resnet_core::{Float, Tensor, TensorError, TensorResult};

use crate::module::Module;

/// Adaptive average pooling to a fixed output grid.
///
/// Output cell `i` averages input rows `floor(i * H / out_h)` up to
/// `ceil((i + 1) * H / out_h)`, so any input size maps onto the requested grid.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveAvgPool2d {
    pub output_size: (usize, usize),
}

impl AdaptiveAvgPool2d {
    pub fn new(output_size: (usize, usize)) -> TensorResult<Self> {
        if output_size.0 == 0 || output_size.1 == 0 {
            return Err(TensorError::InvalidOperation(format!(
                "AdaptiveAvgPool2d output size {output_size:?} must be non-zero"
            )));
        }
        Ok(AdaptiveAvgPool2d { output_size })
    }

    /// Global average pooling: one value per channel.
    pub fn global() -> Self {
        AdaptiveAvgPool2d { output_size: (1, 1) }
    }
}

fn window(i: usize, input: usize, output: usize) -> (usize, usize) {
    let start = i * input / output;
    let end = ((i + 1) * input).div_ceil(output);
    (start, end)
}

impl<T: Float> Module<T> for AdaptiveAvgPool2d {
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let (batch, channels, h, w) = input.shape().nchw()?;
        if h == 0 || w == 0 {
            return Err(TensorError::EmptyTensor);
        }
        let (out_h, out_w) = self.output_size;
        let data = input.data();

        let mut output = Vec::with_capacity(batch * channels * out_h * out_w);
        for plane in data.chunks_exact(h * w) {
            for oh in 0..out_h {
                let (h0, h1) = window(oh, h, out_h);
                for ow in 0..out_w {
                    let (w0, w1) = window(ow, w, out_w);
                    let mut sum = T::ZERO;
                    for row in plane[h0 * w..h1 * w].chunks_exact(w) {
                        sum += row[w0..w1].iter().copied().sum::<T>();
                    }
                    output.push(sum / T::from_usize((h1 - h0) * (w1 - w0)));
                }
            }
        }

        Tensor::new(output, vec![batch, channels, out_h, out_w])
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> { vec![] }
    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> { vec![] }
}
