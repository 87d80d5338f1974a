//! Regularization experiments on MNIST.
//!
//! These need the MNIST files and take minutes, so they are ignored by
//! default. Run with `MNIST_DIR=/path/to/mnist cargo test -- --ignored`.

use std::path::PathBuf;

use scratchnet::{
    dataset::Dataset,
    mnist::{LoadOptions, MnistData},
    network::{MultiLayerNet, MultiLayerNetConfig},
    optim::Sgd,
    trainer::{Trainer, TrainerConfig},
};

fn mnist() -> MnistData {
    let dir = PathBuf::from(std::env::var("MNIST_DIR").expect("MNIST_DIR must point at MNIST"));

    MnistData::load(&dir, LoadOptions::default()).expect("MNIST should load")
}

/// Final (train, test) accuracy after training a net built from `config`.
fn final_accuracy(
    config: MultiLayerNetConfig,
    training: &Dataset,
    test: &Dataset,
    epochs: u32,
) -> (f32, f32) {
    let network = MultiLayerNet::new(&config).unwrap();
    let mut trainer = Trainer::new(
        network,
        Box::new(Sgd::new(0.01)),
        training,
        test,
        TrainerConfig {
            epochs,
            mini_batch_size: 100,
            seed: Some(0),
            ..Default::default()
        },
    );

    trainer.train().unwrap();

    let (train_acc, test_acc) = trainer.history_accuracy();

    (*train_acc.last().unwrap(), *test_acc.last().unwrap())
}

fn overfit_config(hidden_layers: usize) -> MultiLayerNetConfig {
    MultiLayerNetConfig {
        input_size: 784,
        hidden_sizes: vec![100; hidden_layers],
        output_size: 10,
        seed: Some(42),
        ..Default::default()
    }
}

#[test]
#[ignore]
fn weight_decay_and_dropout_shrink_the_generalization_gap() {
    let data = mnist();
    let training = data.training.take(300);
    let (train, test) = final_accuracy(overfit_config(6), &training, &data.test, 200);
    let overfit_gap = train - test;

    let (train, test) = final_accuracy(
        MultiLayerNetConfig {
            weight_decay_lambda: 0.1,
            ..overfit_config(6)
        },
        &training,
        &data.test,
        200,
    );

    assert!(train - test < overfit_gap, "weight decay: {} vs {overfit_gap}", train - test);

    let (train, test) = final_accuracy(
        MultiLayerNetConfig {
            dropout_ratio: Some(0.2),
            ..overfit_config(6)
        },
        &training,
        &data.test,
        200,
    );

    assert!(train - test < overfit_gap, "dropout: {} vs {overfit_gap}", train - test);
}

#[test]
#[ignore]
fn batch_norm_learns_faster() {
    let data = mnist();
    let training = data.training.take(1000);
    let (plain_train, plain_test) = final_accuracy(overfit_config(5), &training, &data.test, 20);
    let (bn_train, bn_test) = final_accuracy(
        MultiLayerNetConfig {
            use_batchnorm: true,
            ..overfit_config(5)
        },
        &training,
        &data.test,
        20,
    );

    assert!(bn_train > plain_train);
    assert!(bn_test > plain_test);
}
