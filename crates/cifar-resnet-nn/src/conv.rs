use cifar_resnet_core::{Float, Tensor, TensorError, TensorResult};
use rand::Rng;
use rayon::prelude::*;

use crate::init;
use crate::module::Module;

/// 2D Convolution layer with square kernels.
///
/// Input shape:  [batch, in_channels, height, width]
/// Output shape: [batch, out_channels, out_h, out_w]
/// where out_h = (height + 2 * padding - kernel_size) / stride + 1
pub struct Conv2d<T: Float> {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub weight: Tensor<T>,       // [out_channels, in_channels, kH, kW]
    pub bias: Option<Tensor<T>>, // [out_channels]
}

impl<T: Float> Conv2d<T> {
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        bias: bool,
        rng: &mut R,
    ) -> TensorResult<Self> {
        if in_channels == 0 || out_channels == 0 || kernel_size == 0 || stride == 0 {
            return Err(TensorError::InvalidOperation(format!(
                "Conv2d({in_channels}, {out_channels}, kernel_size={kernel_size}, stride={stride}) \
                 requires non-zero sizes"
            )));
        }
        let fan_in = in_channels * kernel_size * kernel_size;
        let weight = init::fan_in_uniform(
            vec![out_channels, in_channels, kernel_size, kernel_size],
            fan_in,
            rng,
        );
        let bias = bias.then(|| init::fan_in_uniform(vec![out_channels], fan_in, rng));

        Ok(Conv2d {
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            weight,
            bias,
        })
    }

    /// Compute output spatial dimension.
    pub fn out_dim(&self, input_dim: usize) -> TensorResult<usize> {
        let padded = input_dim + 2 * self.padding;
        if padded < self.kernel_size {
            return Err(TensorError::InvalidOperation(format!(
                "Conv2d kernel {} does not fit padded input of size {}",
                self.kernel_size, padded
            )));
        }
        Ok((padded - self.kernel_size) / self.stride + 1)
    }

    /// Unroll one sample into a `[in_channels * k * k, out_h * out_w]` patch matrix.
    fn im2col(&self, sample: &[T], h: usize, w: usize, out_h: usize, out_w: usize, cols: &mut [T]) {
        let k = self.kernel_size;
        let plane = out_h * out_w;
        for c in 0..self.in_channels {
            let channel = &sample[c * h * w..(c + 1) * h * w];
            for kh in 0..k {
                for kw in 0..k {
                    let row = ((c * k + kh) * k + kw) * plane;
                    let dst = &mut cols[row..row + plane];
                    for oh in 0..out_h {
                        let ih = (oh * self.stride + kh) as isize - self.padding as isize;
                        let line = &mut dst[oh * out_w..(oh + 1) * out_w];
                        if ih < 0 || ih >= h as isize {
                            line.fill(T::ZERO);
                            continue;
                        }
                        let src = &channel[ih as usize * w..(ih as usize + 1) * w];
                        for (ow, slot) in line.iter_mut().enumerate() {
                            let iw = (ow * self.stride + kw) as isize - self.padding as isize;
                            *slot = if iw >= 0 && iw < w as isize {
                                src[iw as usize]
                            } else {
                                T::ZERO
                            };
                        }
                    }
                }
            }
        }
    }
}

impl<T: Float> Module<T> for Conv2d<T> {
    /// Forward pass: im2col per sample followed by a weight × patches product,
    /// samples processed in parallel.
    fn forward(&self, input: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let (batch, channels, h, w) = input.shape().nchw()?;
        if channels != self.in_channels {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch, self.in_channels, h, w],
                got: input.shape_vec(),
            });
        }
        if input.numel() == 0 {
            return Err(TensorError::EmptyTensor);
        }
        let out_h = self.out_dim(h)?;
        let out_w = self.out_dim(w)?;
        let plane = out_h * out_w;
        let patch = self.in_channels * self.kernel_size * self.kernel_size;
        let weight = self.weight.data();
        let bias = self.bias.as_ref().map(|b| b.data());

        let mut output = vec![T::ZERO; batch * self.out_channels * plane];
        output
            .par_chunks_mut(self.out_channels * plane)
            .zip(input.data().par_chunks(channels * h * w))
            .for_each(|(out_sample, in_sample)| {
                let mut cols = vec![T::ZERO; patch * plane];
                self.im2col(in_sample, h, w, out_h, out_w, &mut cols);

                for (oc, out_row) in out_sample.chunks_exact_mut(plane).enumerate() {
                    if let Some(b) = bias {
                        out_row.fill(b[oc]);
                    }
                    let w_row = &weight[oc * patch..(oc + 1) * patch];
                    for (&wv, col_row) in w_row.iter().zip(cols.chunks_exact(plane)) {
                        for (o, &x) in out_row.iter_mut().zip(col_row) {
                            *o += wv * x;
                        }
                    }
                }
            });

        Tensor::new(output, vec![batch, self.out_channels, out_h, out_w])
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor<T>)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor<T>> {
        let mut params = vec![&mut self.weight];
        if let Some(b) = &mut self.bias {
            params.push(b);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_conv2d_shapes() {
        let input: Tensor<f32> = Tensor::randn(vec![2, 3, 8, 8], Some(1));

        let same = Conv2d::new(3, 4, 3, 1, 1, false, &mut rng()).unwrap();
        assert_eq!(same.forward(&input).unwrap().shape_vec(), vec![2, 4, 8, 8]);

        let strided = Conv2d::new(3, 4, 3, 2, 1, false, &mut rng()).unwrap();
        assert_eq!(strided.forward(&input).unwrap().shape_vec(), vec![2, 4, 4, 4]);

        let valid = Conv2d::new(3, 2, 3, 1, 0, false, &mut rng()).unwrap();
        assert_eq!(valid.forward(&input).unwrap().shape_vec(), vec![2, 2, 6, 6]);

        let pointwise = Conv2d::new(3, 5, 1, 2, 0, false, &mut rng()).unwrap();
        assert_eq!(pointwise.forward(&input).unwrap().shape_vec(), vec![2, 5, 4, 4]);
    }

    #[test]
    fn test_conv2d_odd_input_stride_two() {
        let input: Tensor<f32> = Tensor::ones(vec![1, 1, 7, 7]);
        let conv = Conv2d::new(1, 1, 3, 2, 1, false, &mut rng()).unwrap();
        assert_eq!(conv.forward(&input).unwrap().shape_vec(), vec![1, 1, 4, 4]);
    }

    #[test]
    fn test_conv2d_ones_kernel_with_padding() {
        let data: Vec<f64> = (1..=9).map(|i| i as f64).collect();
        let input = Tensor::new(data, vec![1, 1, 3, 3]).unwrap();
        let mut conv = Conv2d::new(1, 1, 3, 1, 1, false, &mut rng()).unwrap();
        conv.weight = Tensor::ones(vec![1, 1, 3, 3]);

        let out = conv.forward(&input).unwrap();
        // Centre sees the whole input, the corner only its 2x2 neighbourhood.
        assert_eq!(out.get(&[0, 0, 1, 1]).unwrap(), 45.0);
        assert_eq!(out.get(&[0, 0, 0, 0]).unwrap(), 1.0 + 2.0 + 4.0 + 5.0);
        assert_eq!(out.get(&[0, 0, 2, 2]).unwrap(), 5.0 + 6.0 + 8.0 + 9.0);
    }

    #[test]
    fn test_conv2d_pointwise_mixes_channels() {
        // Two input channels, one output channel: out = 2 * c0 - c1 + 0.5
        let input = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0], vec![1, 2, 2, 2])
            .unwrap();
        let mut conv = Conv2d::<f64>::new(2, 1, 1, 1, 0, true, &mut rng()).unwrap();
        conv.weight = Tensor::new(vec![2.0, -1.0], vec![1, 2, 1, 1]).unwrap();
        conv.bias = Some(Tensor::from_slice(&[0.5]));

        let out = conv.forward(&input).unwrap();
        assert_eq!(out.data(), &[-7.5, -15.5, -23.5, -31.5]);
    }

    #[test]
    fn test_conv2d_batch_samples_are_independent() {
        let input: Tensor<f64> = Tensor::randn(vec![3, 2, 5, 5], Some(9));
        let conv = Conv2d::new(2, 3, 3, 1, 1, true, &mut rng()).unwrap();
        let batched = conv.forward(&input).unwrap();

        let per_sample = 2 * 5 * 5;
        let second = Tensor::new(
            input.data()[per_sample..2 * per_sample].to_vec(),
            vec![1, 2, 5, 5],
        )
        .unwrap();
        let single = conv.forward(&second).unwrap();
        let out_sample = 3 * 5 * 5;
        assert_eq!(&batched.data()[out_sample..2 * out_sample], single.data());
    }

    #[test]
    fn test_conv2d_rejects_bad_input() {
        let conv = Conv2d::<f32>::new(3, 4, 3, 1, 1, false, &mut rng()).unwrap();
        let wrong_channels: Tensor<f32> = Tensor::zeros(vec![1, 2, 8, 8]);
        assert!(matches!(
            conv.forward(&wrong_channels),
            Err(TensorError::ShapeMismatch { .. })
        ));
        let wrong_rank: Tensor<f32> = Tensor::zeros(vec![3, 8, 8]);
        assert!(matches!(
            conv.forward(&wrong_rank),
            Err(TensorError::RankMismatch { expected: 4, .. })
        ));
    }

    #[test]
    fn test_conv2d_rejects_zero_sizes() {
        assert!(Conv2d::<f32>::new(0, 4, 3, 1, 1, false, &mut rng()).is_err());
        assert!(Conv2d::<f32>::new(3, 0, 3, 1, 1, false, &mut rng()).is_err());
        assert!(Conv2d::<f32>::new(3, 4, 3, 0, 1, false, &mut rng()).is_err());
    }

    #[test]
    fn test_conv2d_parameters() {
        let conv = Conv2d::<f32>::new(64, 128, 3, 2, 1, false, &mut rng()).unwrap();
        assert_eq!(conv.num_parameters(), 128 * 64 * 9);
        let names: Vec<String> = conv.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["weight"]);

        let bound = 1.0 / ((64 * 9) as f32).sqrt();
        assert!(conv.weight.data().iter().all(|v| v.abs() <= bound));
    }
}
