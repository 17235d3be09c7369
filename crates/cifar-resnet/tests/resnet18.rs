use approx::assert_abs_diff_eq;
use cifar_resnet::core::Tensor;
use cifar_resnet::nn::{Mode, Module};
use cifar_resnet::{init_tracing, resnet18, resnet34, BlockKind, ModelError, ResNet, ResNetConfig};

fn narrow(num_classes: usize) -> ResNetConfig {
    ResNetConfig::resnet18(num_classes)
        .with_widths(8, [8, 16, 32, 64])
        .with_seed(42)
}

#[test]
fn resnet18_classifies_a_cifar_batch() {
    init_tracing();
    let net = resnet18::<f32>(10).unwrap();
    let images: Tensor<f32> = Tensor::randn(vec![4, 3, 32, 32], Some(0));

    let logits = net.forward(&images).unwrap();
    assert_eq!(logits.shape_vec(), vec![4, 10]);
    assert!(logits.all_finite());
    assert_eq!(net.feature_width(), 512);
}

#[test]
fn parameter_counts_match_reference_models() {
    let net = resnet18::<f32>(10).unwrap();
    assert_eq!(net.num_parameters(), 11_173_962);

    let net = resnet34::<f32>(10).unwrap();
    assert_eq!(net.num_parameters(), 21_282_122);
}

#[test]
fn factory_is_generic_over_precision() {
    let net: ResNet<f64> = resnet18(10).unwrap();
    assert_eq!(net.num_parameters(), 11_173_962);
    assert_eq!(net.config(), &ResNetConfig::resnet18(10));

    let err: ModelError = resnet18::<f64>(0).err().unwrap();
    assert!(err.to_string().contains("num_classes"));
}

#[test]
fn head_width_follows_num_classes() {
    let tiny = ResNetConfig::new(BlockKind::Basic, [1, 1, 1, 1], 100)
        .with_widths(4, [4, 8, 8, 16])
        .with_seed(1);
    let net = ResNet::<f32>::from_config(&tiny).unwrap();
    let x: Tensor<f32> = Tensor::randn(vec![2, 3, 32, 32], Some(2));
    assert_eq!(net.forward(&x).unwrap().shape_vec(), vec![2, 100]);
    assert_eq!(net.num_classes(), 100);
}

#[test]
fn larger_inputs_pool_to_the_same_head() {
    let net = ResNet::<f32>::from_config(&narrow(10)).unwrap();
    for side in [32, 48, 64] {
        let x: Tensor<f32> = Tensor::randn(vec![2, 3, side, side], Some(side as u64));
        assert_eq!(net.forward(&x).unwrap().shape_vec(), vec![2, 10], "side {side}");
    }
}

#[test]
fn eval_mode_scores_samples_independently() {
    let mut net = ResNet::<f32>::from_config(&narrow(10)).unwrap();
    let batch: Tensor<f32> = Tensor::randn(vec![3, 3, 32, 32], Some(5));

    // A training pass refreshes the running statistics used in eval.
    net.forward(&batch).unwrap();
    net.set_mode(Mode::Eval);

    let logits = net.forward(&batch).unwrap();
    let per_image = 3 * 32 * 32;
    for i in 0..3 {
        let image = Tensor::new(
            batch.data()[i * per_image..(i + 1) * per_image].to_vec(),
            vec![1, 3, 32, 32],
        )
        .unwrap();
        let single = net.forward(&image).unwrap();
        for (a, b) in logits.data()[i * 10..(i + 1) * 10].iter().zip(single.data()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    let predictions = net.predict(&batch).unwrap();
    assert_eq!(predictions.len(), 3);
    assert!(predictions.iter().all(|&p| p < 10));
}

#[test]
fn single_image_training_batch_still_normalises() {
    // Batch of one at 32x32 leaves a 4x4 map at the last stage.
    let net = ResNet::<f64>::from_config(&narrow(10)).unwrap();
    let x: Tensor<f64> = Tensor::randn(vec![1, 3, 32, 32], Some(6));
    assert!(net.forward(&x).unwrap().all_finite());
}

#[test]
fn config_from_json_builds_a_network() {
    let config = ResNetConfig::from_json_str(
        r#"{
            "block": "basic",
            "num_blocks": [1, 1, 1, 1],
            "num_classes": 5,
            "stem_width": 4,
            "stage_widths": [4, 8, 16, 32],
            "seed": 9
        }"#,
    )
    .unwrap();
    let net = ResNet::<f32>::from_config(&config).unwrap();
    let x: Tensor<f32> = Tensor::randn(vec![2, 3, 32, 32], Some(7));
    assert_eq!(net.forward(&x).unwrap().shape_vec(), vec![2, 5]);
}

#[test]
fn zero_classes_are_rejected() {
    assert!(matches!(resnet18::<f32>(0), Err(ModelError::InvalidConfig(_))));
}
