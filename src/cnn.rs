use nalgebra::DMatrix;
use tracing::debug;

use crate::{
    conv::{Convolution, ImageShape, Pooling, Window},
    error::{Error, Result},
    layer::{gaussian, make_rng, Affine, Layer, Param, Relu},
    network::{NeuralNet, Sequential},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvConfig {
    pub filter_num: usize,
    pub filter_h: usize,
    pub filter_w: usize,
    pub pad: usize,
    pub stride: usize,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            filter_num: 30,
            filter_h: 5,
            filter_w: 5,
            pad: 0,
            stride: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub pool_h: usize,
    pub pool_w: usize,
    pub stride: usize,
    pub pad: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_h: 2,
            pool_w: 2,
            stride: 2,
            pad: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimpleCnnConfig {
    /// `(C, H, W)` of one sample.
    pub input_dim: ImageShape,
    pub conv: ConvConfig,
    pub pool: PoolConfig,
    pub hidden_size: usize,
    pub output_size: usize,
    /// Fixed standard deviation for every weight; He initialization when unset.
    pub weight_init_std: Option<f32>,
    pub seed: Option<u64>,
}

impl Default for SimpleCnnConfig {
    fn default() -> Self {
        Self {
            input_dim: (1, 28, 28),
            conv: ConvConfig::default(),
            pool: PoolConfig::default(),
            hidden_size: 100,
            output_size: 10,
            weight_init_std: None,
            seed: None,
        }
    }
}

/// ```text
/// (conv ─ relu ─ max_pool) ─ (affine ─ relu) ─ affine ─ softmax
///          layer 1               hidden          output
/// ```
pub struct SimpleCnn {
    layers: Sequential,
}

impl SimpleCnn {
    pub fn new(config: &SimpleCnnConfig) -> Result<Self> {
        let (c, h, w) = config.input_dim;
        let conv = config.conv;

        if c * h * w == 0 || conv.filter_num == 0 || config.hidden_size == 0 || config.output_size == 0
        {
            return Err(Error::InvalidConfig(format!(
                "sizes must be positive: input {:?}, {} filters, hidden {}, output {}",
                config.input_dim, conv.filter_num, config.hidden_size, config.output_size
            )));
        }

        let mut rng = make_rng(config.seed);
        let std_for = |fan_in: usize| {
            config
                .weight_init_std
                .unwrap_or_else(|| f32::sqrt(2.0 / fan_in.max(1) as f32))
        };

        let filter_len = c * conv.filter_h * conv.filter_w;
        let conv_layer = Convolution::new(
            Param::new(
                "W1",
                gaussian(conv.filter_num, filter_len, std_for(filter_len), &mut rng),
            ),
            Param::new("b1", DMatrix::zeros(1, conv.filter_num)),
            config.input_dim,
            Window {
                filter_h: conv.filter_h,
                filter_w: conv.filter_w,
                stride: conv.stride,
                pad: conv.pad,
            },
        )?;
        let pool = config.pool;
        let pool_layer = Pooling::new(
            conv_layer.output_shape(),
            Window {
                filter_h: pool.pool_h,
                filter_w: pool.pool_w,
                stride: pool.stride,
                pad: pool.pad,
            },
        )?;
        let (pc, ph, pw) = pool_layer.output_shape();
        let flat = pc * ph * pw;

        debug!(
            conv_out = ?conv_layer.output_shape(),
            pool_out = ?pool_layer.output_shape(),
            hidden = config.hidden_size,
            "built simple CNN"
        );

        let hidden = Affine::new(
            Param::new(
                "W2",
                gaussian(flat, config.hidden_size, std_for(flat), &mut rng),
            ),
            Param::new("b2", DMatrix::zeros(1, config.hidden_size)),
        )?;
        let output = Affine::new(
            Param::new(
                "W3",
                gaussian(
                    config.hidden_size,
                    config.output_size,
                    std_for(config.hidden_size),
                    &mut rng,
                ),
            ),
            Param::new("b3", DMatrix::zeros(1, config.output_size)),
        )?;
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(conv_layer),
            Box::new(Relu::new()),
            Box::new(pool_layer),
            Box::new(hidden),
            Box::new(Relu::new()),
            Box::new(output),
        ];

        Ok(Self {
            layers: Sequential::new(layers),
        })
    }

    pub fn params(&self) -> Vec<&Param> {
        self.layers.params()
    }
}

impl NeuralNet for SimpleCnn {
    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.params_mut()
    }

    fn predict(&mut self, x: &DMatrix<f32>, train: bool) -> Result<DMatrix<f32>> {
        self.layers.predict(x, train)
    }

    fn loss(&mut self, x: &DMatrix<f32>, t: &DMatrix<f32>, train: bool) -> Result<f32> {
        self.layers.loss(x, t, train)
    }

    fn gradient(&mut self, x: &DMatrix<f32>, t: &DMatrix<f32>) -> Result<f32> {
        let loss = self.loss(x, t, true)?;

        self.layers.backward()?;

        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient::gradient_check;

    fn tiny_config() -> SimpleCnnConfig {
        SimpleCnnConfig {
            input_dim: (1, 6, 6),
            conv: ConvConfig {
                filter_num: 2,
                filter_h: 3,
                filter_w: 3,
                pad: 1,
                stride: 1,
            },
            pool: PoolConfig::default(),
            hidden_size: 5,
            output_size: 3,
            weight_init_std: Some(0.3),
            seed: Some(11),
        }
    }

    #[test]
    fn parameter_shapes() {
        let net = SimpleCnn::new(&SimpleCnnConfig {
            seed: Some(1),
            ..Default::default()
        })
        .unwrap();
        let shapes: Vec<_> = net.params().iter().map(|p| (p.name.as_str(), p.shape())).collect();

        assert_eq!(
            shapes,
            [
                ("W1", (30, 25)),
                ("b1", (1, 30)),
                ("W2", (30 * 12 * 12, 100)),
                ("b2", (1, 100)),
                ("W3", (100, 10)),
                ("b3", (1, 10)),
            ]
        );
    }

    #[test]
    fn predict_shape() {
        let mut net = SimpleCnn::new(&tiny_config()).unwrap();
        let x = DMatrix::from_fn(4, 36, |i, j| ((i + j) as f32 * 0.3).cos());

        assert_eq!(net.predict(&x, false).unwrap().shape(), (4, 3));
    }

    #[test]
    fn backprop_matches_numerical_gradient() {
        let mut net = SimpleCnn::new(&tiny_config()).unwrap();
        let x = DMatrix::from_fn(3, 36, |i, j| ((i * 36 + j) as f32 * 0.41).sin());
        let t = DMatrix::from_fn(3, 3, |i, j| if i == j { 1.0 } else { 0.0 });

        for (name, diff) in gradient_check(&mut net, &x, &t).unwrap() {
            assert!(diff < 1e-2, "{name}: {diff}");
        }
    }

    #[test]
    fn rejects_oversized_filters() {
        let config = SimpleCnnConfig {
            conv: ConvConfig {
                filter_h: 9,
                filter_w: 9,
                ..tiny_config().conv
            },
            ..tiny_config()
        };

        assert!(matches!(SimpleCnn::new(&config), Err(Error::InvalidGeometry(_))));
    }
}
