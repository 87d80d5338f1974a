use std::iter::zip;

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::debug;

use crate::{
    activation::argmax_rows,
    error::{ensure_shape, Error, Result},
    layer::{
        gaussian, make_rng, Affine, BatchNormalization, Dropout, Layer, Param, Relu, Sigmoid,
        SoftmaxWithLoss,
    },
};

/// A network that can be trained by the [`Trainer`](crate::trainer::Trainer).
pub trait NeuralNet {
    /// Every learnable parameter, mutable so optimizers can update them in place.
    fn params_mut(&mut self) -> Vec<&mut Param>;

    /// Raw scores (before softmax) for every row of `x`.
    fn predict(&mut self, x: &DMatrix<f32>, train: bool) -> Result<DMatrix<f32>>;

    /// Loss of the prediction for `x` against one-hot targets `t`.
    fn loss(&mut self, x: &DMatrix<f32>, t: &DMatrix<f32>, train: bool) -> Result<f32>;

    /// Runs forward and backward over the batch, leaving dL/dθ in every
    /// parameter's `grad`. Returns the loss.
    fn gradient(&mut self, x: &DMatrix<f32>, t: &DMatrix<f32>) -> Result<f32>;

    /// Fraction of rows whose arg-max prediction matches the one-hot target.
    fn accuracy(&mut self, x: &DMatrix<f32>, t: &DMatrix<f32>) -> Result<f32> {
        if x.nrows() == 0 {
            return Err(Error::EmptyDataset);
        }

        let y = self.predict(x, false)?;

        ensure_shape("accuracy", t.shape(), y.shape())?;

        let predicted = argmax_rows(&y);
        let expected = argmax_rows(t);
        let correct = predicted
            .par_iter()
            .zip(expected.par_iter())
            .filter(|(p, e)| p == e)
            .count();

        Ok(correct as f32 / x.nrows() as f32)
    }
}

/// Layers run in order, topped by softmax with cross-entropy loss.
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
    last: SoftmaxWithLoss,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        Self {
            layers,
            last: SoftmaxWithLoss::new(),
        }
    }

    pub fn predict(&mut self, x: &DMatrix<f32>, train: bool) -> Result<DMatrix<f32>> {
        let mut out = x.clone();

        for layer in &mut self.layers {
            out = layer.forward(&out, train)?;
        }

        Ok(out)
    }

    pub fn loss(&mut self, x: &DMatrix<f32>, t: &DMatrix<f32>, train: bool) -> Result<f32> {
        let y = self.predict(x, train)?;

        self.last.forward_to_loss(&y, t)
    }

    /// Reverse pass from the loss back to the input. Returns dL/dx.
    pub fn backward(&mut self) -> Result<DMatrix<f32>> {
        let mut dout = self.last.backward_loss()?;

        for layer in self.layers.iter_mut().rev() {
            dout = layer.backward(&dout)?;
        }

        Ok(dout)
    }

    pub fn params(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Activation {
    #[default]
    Relu,
    Sigmoid,
}

impl Activation {
    fn layer(self) -> Box<dyn Layer> {
        match self {
            Activation::Relu => Box::new(Relu::new()),
            Activation::Sigmoid => Box::new(Sigmoid::new()),
        }
    }
}

/// Standard deviation of the initial Gaussian weights.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum WeightInit {
    /// He for ReLU, Xavier for sigmoid.
    #[default]
    Auto,
    /// √(2 / fan-in)
    He,
    /// √(1 / fan-in)
    Xavier,
    Std(f32),
}

impl WeightInit {
    pub fn std(self, fan_in: usize, activation: Activation) -> f32 {
        let fan_in = fan_in.max(1) as f32;

        match self {
            WeightInit::Auto => match activation {
                Activation::Relu => f32::sqrt(2.0 / fan_in),
                Activation::Sigmoid => f32::sqrt(1.0 / fan_in),
            },
            WeightInit::He => f32::sqrt(2.0 / fan_in),
            WeightInit::Xavier => f32::sqrt(1.0 / fan_in),
            WeightInit::Std(std) => std,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MultiLayerNetConfig {
    pub input_size: usize,
    pub hidden_sizes: Vec<usize>,
    pub output_size: usize,
    pub activation: Activation,
    pub weight_init: WeightInit,
    /// L2 penalty ½λ‖W‖² added to the loss for every weight matrix.
    pub weight_decay_lambda: f32,
    /// Dropout after every hidden activation when set.
    pub dropout_ratio: Option<f32>,
    /// Batch normalization between every hidden affine layer and its activation.
    pub use_batchnorm: bool,
    pub seed: Option<u64>,
}

impl Default for MultiLayerNetConfig {
    fn default() -> Self {
        Self {
            input_size: 784,
            hidden_sizes: vec![100, 100],
            output_size: 10,
            activation: Activation::Relu,
            weight_init: WeightInit::Auto,
            weight_decay_lambda: 0.0,
            dropout_ratio: None,
            use_batchnorm: false,
            seed: None,
        }
    }
}

/// Fully connected network:
///
/// ```text
/// [Affine (BatchNorm) Activation (Dropout)] × hidden ─ Affine ─ SoftmaxWithLoss
/// ```
///
/// Weights are named `W1..Wn`, biases `b1..bn`, batch-norm scales `gamma1..`
/// and shifts `beta1..`.
pub struct MultiLayerNet {
    layers: Sequential,
    weight_decay_lambda: f32,
}

impl MultiLayerNet {
    pub fn new(config: &MultiLayerNetConfig) -> Result<Self> {
        if config.input_size == 0 || config.output_size == 0 || config.hidden_sizes.contains(&0) {
            return Err(Error::InvalidConfig(format!(
                "layer sizes must be positive: {} -> {:?} -> {}",
                config.input_size, config.hidden_sizes, config.output_size
            )));
        }

        if config.weight_decay_lambda < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "weight decay must not be negative, got {}",
                config.weight_decay_lambda
            )));
        }

        let mut rng = make_rng(config.seed);
        let sizes: Vec<usize> = std::iter::once(config.input_size)
            .chain(config.hidden_sizes.iter().copied())
            .chain(std::iter::once(config.output_size))
            .collect();
        let hidden_count = config.hidden_sizes.len();
        let mut layers: Vec<Box<dyn Layer>> = Vec::new();

        for (idx, (&fan_in, &fan_out)) in zip(&sizes, &sizes[1..]).enumerate() {
            let n = idx + 1;
            let std = config.weight_init.std(fan_in, config.activation);

            layers.push(Box::new(Affine::new(
                Param::new(format!("W{n}"), gaussian(fan_in, fan_out, std, &mut rng)),
                Param::new(format!("b{n}"), DMatrix::zeros(1, fan_out)),
            )?));

            if idx == hidden_count {
                break;
            }

            if config.use_batchnorm {
                layers.push(Box::new(BatchNormalization::new(
                    Param::new(format!("gamma{n}"), DMatrix::from_element(1, fan_out, 1.0)),
                    Param::new(format!("beta{n}"), DMatrix::zeros(1, fan_out)),
                    0.9,
                )?));
            }

            layers.push(config.activation.layer());

            if let Some(ratio) = config.dropout_ratio {
                layers.push(Box::new(Dropout::new(
                    ratio,
                    config.seed.map(|s| s.wrapping_add(n as u64)),
                )?));
            }
        }

        debug!(
            sizes = ?sizes,
            layers = layers.len(),
            batchnorm = config.use_batchnorm,
            dropout = ?config.dropout_ratio,
            "built multi-layer net"
        );

        Ok(Self {
            layers: Sequential::new(layers),
            weight_decay_lambda: config.weight_decay_lambda,
        })
    }

    pub fn params(&self) -> Vec<&Param> {
        self.layers.params()
    }

    fn weight_decay(&self) -> f32 {
        if self.weight_decay_lambda == 0.0 {
            return 0.0;
        }

        let squares: f32 = self
            .layers
            .params()
            .into_iter()
            .filter(|p| is_weight(p))
            .map(|p| p.value.norm_squared())
            .sum();

        0.5 * self.weight_decay_lambda * squares
    }
}

fn is_weight(param: &Param) -> bool {
    param.name.starts_with('W')
}

impl NeuralNet for MultiLayerNet {
    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.params_mut()
    }

    fn predict(&mut self, x: &DMatrix<f32>, train: bool) -> Result<DMatrix<f32>> {
        self.layers.predict(x, train)
    }

    fn loss(&mut self, x: &DMatrix<f32>, t: &DMatrix<f32>, train: bool) -> Result<f32> {
        Ok(self.layers.loss(x, t, train)? + self.weight_decay())
    }

    fn gradient(&mut self, x: &DMatrix<f32>, t: &DMatrix<f32>) -> Result<f32> {
        let loss = self.loss(x, t, true)?;

        self.layers.backward()?;

        let lambda = self.weight_decay_lambda;

        if lambda != 0.0 {
            for p in self.layers.params_mut().into_iter().filter(|p| is_weight(p)) {
                p.grad += &p.value * lambda;
            }
        }

        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::gradient::gradient_check;

    fn toy_batch() -> (DMatrix<f32>, DMatrix<f32>) {
        let x = DMatrix::from_fn(4, 5, |i, j| ((i * 5 + j) as f32 * 0.9).sin());
        let t = DMatrix::from_fn(4, 3, |i, j| if (i % 3) == j { 1.0 } else { 0.0 });

        (x, t)
    }

    fn config() -> MultiLayerNetConfig {
        MultiLayerNetConfig {
            input_size: 5,
            hidden_sizes: vec![6, 4],
            output_size: 3,
            seed: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn parameter_names_and_shapes() {
        let net = MultiLayerNet::new(&MultiLayerNetConfig {
            use_batchnorm: true,
            ..config()
        })
        .unwrap();
        let names: Vec<_> = net.params().iter().map(|p| p.name.clone()).collect();

        assert_eq!(
            names,
            ["W1", "b1", "gamma1", "beta1", "W2", "b2", "gamma2", "beta2", "W3", "b3"]
        );
        assert_eq!(net.params()[0].shape(), (5, 6));
        assert_eq!(net.params()[9].shape(), (1, 3));
    }

    #[test]
    fn rejects_empty_layers() {
        let bad = MultiLayerNetConfig {
            hidden_sizes: vec![6, 0],
            ..config()
        };

        assert!(matches!(MultiLayerNet::new(&bad), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn backprop_matches_numerical_gradient() {
        let (x, t) = toy_batch();

        for activation in [Activation::Relu, Activation::Sigmoid] {
            let mut net = MultiLayerNet::new(&MultiLayerNetConfig {
                activation,
                ..config()
            })
            .unwrap();

            for (name, diff) in gradient_check(&mut net, &x, &t).unwrap() {
                assert!(diff < 1e-2, "{activation:?} {name}: {diff}");
            }
        }
    }

    #[test]
    fn backprop_with_batchnorm_and_weight_decay() {
        let (x, t) = toy_batch();
        let mut net = MultiLayerNet::new(&MultiLayerNetConfig {
            use_batchnorm: true,
            weight_decay_lambda: 0.1,
            ..config()
        })
        .unwrap();

        for (name, diff) in gradient_check(&mut net, &x, &t).unwrap() {
            assert!(diff < 1e-2, "{name}: {diff}");
        }
    }

    #[test]
    fn weight_decay_raises_loss() {
        let (x, t) = toy_batch();
        let mut plain = MultiLayerNet::new(&config()).unwrap();
        let mut decayed = MultiLayerNet::new(&MultiLayerNetConfig {
            weight_decay_lambda: 0.5,
            ..config()
        })
        .unwrap();
        let squares: f32 = decayed
            .params()
            .iter()
            .filter(|p| p.name.starts_with('W'))
            .map(|p| p.value.norm_squared())
            .sum();

        assert_relative_eq!(
            decayed.loss(&x, &t, false).unwrap(),
            plain.loss(&x, &t, false).unwrap() + 0.25 * squares,
            epsilon = 1e-4
        );
    }

    #[test]
    fn accuracy_counts_matching_rows() {
        let (x, t) = toy_batch();
        let mut net = MultiLayerNet::new(&config()).unwrap();
        let acc = net.accuracy(&x, &t).unwrap();

        assert!((0.0..=1.0).contains(&acc));
        assert!(net.accuracy(&DMatrix::zeros(0, 5), &DMatrix::zeros(0, 3)).is_err());
    }
}
