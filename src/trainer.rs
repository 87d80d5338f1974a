use std::time::{Duration, Instant};

use itertools::Itertools;
use permutation_iterator::Permutor;
use tracing::{debug, info};

use crate::{
    dataset::Dataset,
    error::{Error, Result},
    network::NeuralNet,
    optim::Optimizer,
};

/// Rows evaluated per forward pass when measuring accuracy.
const EVAL_BATCH: usize = 1000;

#[derive(Clone, Debug)]
pub struct TrainerConfig {
    pub epochs: u32,
    pub mini_batch_size: usize,
    /// Only the first `n` training and test samples are scored after each
    /// epoch when set.
    pub evaluate_sample_num_per_epoch: Option<usize>,
    /// Seeds the per-epoch shuffling.
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            mini_batch_size: 100,
            evaluate_sample_num_per_epoch: None,
            seed: None,
        }
    }
}

/// Mini-batch gradient descent over a training set, scoring train and test
/// accuracy after every epoch.
pub struct Trainer<'a, N: NeuralNet> {
    network: N,
    optimizer: Box<dyn Optimizer>,
    training: &'a Dataset,
    test: &'a Dataset,
    config: TrainerConfig,
    train_acc: Vec<f32>,
    test_acc: Vec<f32>,
    losses: Vec<f32>,
}

/// Accuracy over the whole dataset, evaluated `EVAL_BATCH` rows at a time.
pub fn dataset_accuracy<N: NeuralNet + ?Sized>(network: &mut N, data: &Dataset) -> Result<f32> {
    if data.is_empty() {
        return Err(Error::EmptyDataset);
    }

    let mut correct = 0.0;

    for start in (0..data.len()).step_by(EVAL_BATCH) {
        let rows = EVAL_BATCH.min(data.len() - start);
        let x = data.images.rows(start, rows).into_owned();
        let t = data.targets.rows(start, rows).into_owned();

        correct += network.accuracy(&x, &t)? * rows as f32;
    }

    Ok(correct / data.len() as f32)
}

impl<'a, N: NeuralNet> Trainer<'a, N> {
    pub fn new(
        network: N,
        optimizer: Box<dyn Optimizer>,
        training: &'a Dataset,
        test: &'a Dataset,
        config: TrainerConfig,
    ) -> Self {
        Self {
            network,
            optimizer,
            training,
            test,
            config,
            train_acc: Vec::new(),
            test_acc: Vec::new(),
            losses: Vec::new(),
        }
    }

    pub fn train(&mut self) -> Result<()> {
        if self.training.is_empty() || self.test.is_empty() {
            return Err(Error::EmptyDataset);
        }

        let batch_size = self.config.mini_batch_size;

        if batch_size == 0 {
            return Err(Error::InvalidConfig("mini-batch size must be positive".into()));
        }

        if self.config.evaluate_sample_num_per_epoch == Some(0) {
            return Err(Error::InvalidConfig(
                "samples evaluated per epoch must be positive".into(),
            ));
        }

        let epochs = self.config.epochs;
        let data_len = self.training.len() as u64;
        let batches_len = (self.training.len() + batch_size - 1) / batch_size;

        let print_freq = Duration::from_millis(200);
        let mut last_print = Instant::now() - print_freq;

        info!(
            samples = data_len,
            batch_size, batches_len, epochs, "starting training"
        );

        for epoch_idx in 0..epochs {
            let epoch_start = Instant::now();
            let permutor = match self.config.seed {
                Some(seed) => {
                    Permutor::new_with_u64_key(data_len, seed.wrapping_add(epoch_idx as u64))
                }
                None => Permutor::new(data_len),
            };

            for (batch_idx, batch) in permutor.chunks(batch_size).into_iter().enumerate() {
                let indices: Vec<usize> = batch.map(|i| i as usize).collect();
                let (x, t) = self.training.batch(&indices);
                let loss = self.network.gradient(&x, &t)?;

                self.optimizer.step(&mut self.network.params_mut());
                self.losses.push(loss);

                if last_print.elapsed() > print_freq {
                    debug!(batch = batch_idx + 1, batches_len, loss, "updating");
                    last_print = Instant::now();
                }
            }

            let (train_acc, test_acc) = self.evaluate()?;

            self.train_acc.push(train_acc);
            self.test_acc.push(test_acc);

            info!(
                epoch = epoch_idx + 1,
                epochs,
                train_acc,
                test_acc,
                elapsed_ms = epoch_start.elapsed().as_millis() as u64,
                "epoch complete"
            );
        }

        Ok(())
    }

    fn evaluate(&mut self) -> Result<(f32, f32)> {
        match self.config.evaluate_sample_num_per_epoch {
            Some(n) => Ok((
                dataset_accuracy(&mut self.network, &self.training.take(n))?,
                dataset_accuracy(&mut self.network, &self.test.take(n))?,
            )),
            None => Ok((
                dataset_accuracy(&mut self.network, self.training)?,
                dataset_accuracy(&mut self.network, self.test)?,
            )),
        }
    }

    /// Train and test accuracy recorded after each epoch.
    pub fn history_accuracy(&self) -> (&[f32], &[f32]) {
        (&self.train_acc, &self.test_acc)
    }

    /// Loss of every mini-batch, in training order.
    pub fn loss_history(&self) -> &[f32] {
        &self.losses
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }
}
