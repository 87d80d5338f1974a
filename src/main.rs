use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scratchnet::{
    cnn::{ConvConfig, SimpleCnn, SimpleCnnConfig},
    mnist::{LoadOptions, MnistData, CLASSES},
    network::{Activation, MultiLayerNet, MultiLayerNetConfig, NeuralNet},
    optim::OptimizerKind,
    trainer::{dataset_accuracy, Trainer, TrainerConfig},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Program implementing the networks of "deep learning from scratch" with
/// hand-written backpropagation
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train a fully connected network
    Mlp(MlpArgs),
    /// Train the conv-relu-pool, affine-relu, affine network
    Cnn(CnnArgs),
}

#[derive(Debug, clap::Args)]
struct TrainArgs {
    /// Path to MNIST folder with ubyte files, gzipped or not
    mnist_folder: PathBuf,

    #[arg(long, default_value_t = 20)]
    epochs: u32,

    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Sgd)]
    optimizer: OptimizerKind,

    /// Learning rate; each optimizer has its own default
    #[arg(long)]
    lr: Option<f32>,

    /// Train on the first N training images only
    #[arg(long)]
    train_size: Option<usize>,

    /// Score only the first N samples after each epoch
    #[arg(long)]
    eval_samples: Option<usize>,

    /// Hold out the last N training images as a validation set
    #[arg(long, default_value_t = 0)]
    validation_size: usize,

    /// Seed for weight initialization, dropout and shuffling
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, clap::Args)]
struct MlpArgs {
    #[command(flatten)]
    train: TrainArgs,

    /// Hidden layer sizes
    #[arg(long, value_delimiter = ',', default_values_t = [100, 100])]
    hidden: Vec<usize>,

    #[arg(long, value_enum, default_value_t = Activation::Relu)]
    activation: Activation,

    /// L2 weight decay lambda
    #[arg(long, default_value_t = 0.0)]
    weight_decay: f32,

    /// Dropout ratio after each hidden layer
    #[arg(long)]
    dropout: Option<f32>,

    #[arg(long)]
    batch_norm: bool,
}

#[derive(Debug, clap::Args)]
struct CnnArgs {
    #[command(flatten)]
    train: TrainArgs,

    #[arg(long, default_value_t = 30)]
    filters: usize,

    #[arg(long, default_value_t = 5)]
    filter_size: usize,

    #[arg(long, default_value_t = 100)]
    hidden: usize,
}

impl From<&MlpArgs> for MultiLayerNetConfig {
    fn from(args: &MlpArgs) -> Self {
        Self {
            hidden_sizes: args.hidden.clone(),
            activation: args.activation,
            weight_decay_lambda: args.weight_decay,
            dropout_ratio: args.dropout,
            use_batchnorm: args.batch_norm,
            seed: args.train.seed,
            ..Default::default()
        }
    }
}

impl From<&CnnArgs> for SimpleCnnConfig {
    fn from(args: &CnnArgs) -> Self {
        Self {
            conv: ConvConfig {
                filter_num: args.filters,
                filter_h: args.filter_size,
                filter_w: args.filter_size,
                ..Default::default()
            },
            hidden_size: args.hidden,
            seed: args.train.seed,
            ..Default::default()
        }
    }
}

impl From<&TrainArgs> for LoadOptions {
    fn from(args: &TrainArgs) -> Self {
        Self {
            validation_size: args.validation_size,
            ..Default::default()
        }
    }
}

impl From<&TrainArgs> for TrainerConfig {
    fn from(args: &TrainArgs) -> Self {
        Self {
            epochs: args.epochs,
            mini_batch_size: args.batch_size,
            evaluate_sample_num_per_epoch: args.eval_samples,
            seed: args.seed,
        }
    }
}

fn train_network<N: NeuralNet>(network: N, args: &TrainArgs) -> Result<()> {
    let data = MnistData::load(&args.mnist_folder, args.into())
        .with_context(|| format!("loading MNIST from {}", args.mnist_folder.display()))?;
    let training = match args.train_size {
        Some(n) => data.training.take(n),
        None => data.training,
    };

    info!(
        optimizer = ?args.optimizer,
        samples = training.len(),
        classes = CLASSES,
        "training"
    );

    let mut trainer = Trainer::new(
        network,
        args.optimizer.build(args.lr),
        &training,
        &data.test,
        args.into(),
    );

    trainer.train()?;

    let (train_acc, test_acc) = trainer.history_accuracy();

    for (epoch_idx, (train, test)) in train_acc.iter().zip(test_acc).enumerate() {
        println!(
            "Epoch {}/{} train: {:.2}% test: {:.2}%",
            epoch_idx + 1,
            train_acc.len(),
            100.0 * train,
            100.0 * test
        );
    }

    let final_acc = dataset_accuracy(trainer.network_mut(), &data.test)?;

    println!(
        "Test accuracy: {:.2}% ({} samples)",
        100.0 * final_acc,
        data.test.len()
    );

    if !data.validation.is_empty() {
        let validation_acc = dataset_accuracy(trainer.network_mut(), &data.validation)?;

        println!(
            "Validation accuracy: {:.2}% ({} samples)",
            100.0 * validation_acc,
            data.validation.len()
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("scratchnet=info".parse()?))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Mlp(args) => train_network(MultiLayerNet::new(&args.into())?, &args.train),
        Command::Cnn(args) => train_network(SimpleCnn::new(&args.into())?, &args.train),
    }
}
