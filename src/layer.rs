//! Layers of the computation graph.
//!
//! Each layer implements a forward computation and its analytic gradient.
//! `forward` caches whatever `backward` needs, so the two must be called in
//! that order on the same batch. Networks chain layers in a `Vec` and run them
//! front to back, then back to front.

use nalgebra::DMatrix;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::{
    activation::{relu, sigmoid, softmax},
    error::{ensure_shape, Error, Result},
    loss::cross_entropy_error,
};

/// A learnable tensor and the gradient the last backward pass left for it.
#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub value: DMatrix<f32>,
    pub grad: DMatrix<f32>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: DMatrix<f32>) -> Self {
        let (r, c) = value.shape();

        Self {
            name: name.into(),
            value,
            grad: DMatrix::zeros(r, c),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.value.shape()
    }
}

pub trait Layer {
    /// Name used in error messages.
    fn kind(&self) -> &'static str;

    fn forward(&mut self, x: &DMatrix<f32>, train: bool) -> Result<DMatrix<f32>>;

    /// Propagates `dout` (dL/dy) back to dL/dx, storing parameter gradients
    /// along the way.
    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>>;

    fn params(&self) -> Vec<&Param> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        Vec::new()
    }
}

/// `rows × cols` matrix of samples from N(0, std²).
pub fn gaussian(rows: usize, cols: usize, std: f32, rng: &mut impl Rng) -> DMatrix<f32> {
    DMatrix::from_fn(rows, cols, |_, _| rng.sample::<f32, _>(StandardNormal) * std)
}

/// Seeded generator when `seed` is given, entropy otherwise.
pub(crate) fn make_rng(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

/// Adds the `1 × D` row `bias` to every row of `out`.
pub(crate) fn add_bias(out: &mut DMatrix<f32>, bias: &DMatrix<f32>) {
    for (mut col, &b) in out.column_iter_mut().zip(bias.iter()) {
        col.add_scalar_mut(b);
    }
}

/// Sums every column into a `1 × D` row.
pub(crate) fn column_sums(m: &DMatrix<f32>) -> DMatrix<f32> {
    DMatrix::from_iterator(1, m.ncols(), m.column_iter().map(|c| c.sum()))
}

fn cached<'a>(slot: &'a Option<DMatrix<f32>>, kind: &'static str) -> Result<&'a DMatrix<f32>> {
    slot.as_ref().ok_or(Error::BackwardBeforeForward(kind))
}

/// x ──> max(0, x) ──> y
#[derive(Debug, Default)]
pub struct Relu {
    mask: Option<DMatrix<f32>>,
}

impl Relu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Relu {
    fn kind(&self) -> &'static str {
        "Relu"
    }

    fn forward(&mut self, x: &DMatrix<f32>, _train: bool) -> Result<DMatrix<f32>> {
        self.mask = Some(x.map(|v| if v > 0.0 { 1.0 } else { 0.0 }));

        Ok(x.map(relu))
    }

    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let mask = cached(&self.mask, self.kind())?;

        ensure_shape("Relu::backward", mask.shape(), dout.shape())?;

        Ok(dout.component_mul(mask))
    }
}

/// x ──> 1 / (1 + exp(-x)) ──> y
#[derive(Debug, Default)]
pub struct Sigmoid {
    out: Option<DMatrix<f32>>,
}

impl Sigmoid {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Sigmoid {
    fn kind(&self) -> &'static str {
        "Sigmoid"
    }

    fn forward(&mut self, x: &DMatrix<f32>, _train: bool) -> Result<DMatrix<f32>> {
        let out = x.map(sigmoid);

        self.out = Some(out.clone());

        Ok(out)
    }

    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let out = cached(&self.out, self.kind())?;

        ensure_shape("Sigmoid::backward", out.shape(), dout.shape())?;

        Ok(dout.zip_map(out, |d, y| d * y * (1.0 - y)))
    }
}

/// x ──> xW + b ──> y
#[derive(Debug)]
pub struct Affine {
    weight: Param,
    bias: Param,
    x: Option<DMatrix<f32>>,
}

impl Affine {
    /// `weight` is `D × H` and `bias` is `1 × H`.
    pub fn new(weight: Param, bias: Param) -> Result<Self> {
        ensure_shape("Affine::new", (1, weight.shape().1), bias.shape())?;

        Ok(Self {
            weight,
            bias,
            x: None,
        })
    }
}

impl Layer for Affine {
    fn kind(&self) -> &'static str {
        "Affine"
    }

    fn forward(&mut self, x: &DMatrix<f32>, _train: bool) -> Result<DMatrix<f32>> {
        let (d, _) = self.weight.shape();

        if x.ncols() != d {
            return Err(Error::shape("Affine::forward", (x.nrows(), d), x.shape()));
        }

        let mut out = x * &self.weight.value;

        add_bias(&mut out, &self.bias.value);

        self.x = Some(x.clone());

        Ok(out)
    }

    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let x = cached(&self.x, self.kind())?;

        ensure_shape(
            "Affine::backward",
            (x.nrows(), self.weight.shape().1),
            dout.shape(),
        )?;

        self.weight.grad = x.transpose() * dout;
        self.bias.grad = column_sums(dout);

        Ok(dout * self.weight.value.transpose())
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// x ──> exp(x) / Σ exp(x) ──> y
#[derive(Debug, Default)]
pub struct Softmax {
    out: Option<DMatrix<f32>>,
}

impl Softmax {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Jacobian-vector product of softmax: y ⊙ (dout − Σ_row(dout ⊙ y)).
fn softmax_backward(y: &DMatrix<f32>, dout: &DMatrix<f32>) -> DMatrix<f32> {
    let mut dx = dout.component_mul(y);

    for (i, mut row) in dx.row_iter_mut().enumerate() {
        let dot = row.sum();

        for (j, v) in row.iter_mut().enumerate() {
            *v -= y[(i, j)] * dot;
        }
    }

    dx
}

impl Layer for Softmax {
    fn kind(&self) -> &'static str {
        "Softmax"
    }

    fn forward(&mut self, x: &DMatrix<f32>, _train: bool) -> Result<DMatrix<f32>> {
        let out = softmax(x);

        self.out = Some(out.clone());

        Ok(out)
    }

    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let y = cached(&self.out, self.kind())?;

        ensure_shape("Softmax::backward", y.shape(), dout.shape())?;

        Ok(softmax_backward(y, dout))
    }
}

/// Softmax followed by cross-entropy against one-hot targets `t`.
///
/// ```text
/// x ──> softmax ──> y ──> cross entropy ──> L
///                   t ──/
/// ```
#[derive(Debug, Default)]
pub struct SoftmaxWithLoss {
    y: Option<DMatrix<f32>>,
    t: Option<DMatrix<f32>>,
}

impl SoftmaxWithLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward_to_loss(&mut self, x: &DMatrix<f32>, t: &DMatrix<f32>) -> Result<f32> {
        ensure_shape("SoftmaxWithLoss::forward_to_loss", x.shape(), t.shape())?;

        let y = softmax(x);
        let loss = cross_entropy_error(&y, t)?;

        self.y = Some(y);
        self.t = Some(t.clone());

        Ok(loss)
    }

    /// Gradient of the loss with respect to the logits, for dL = 1.
    pub fn backward_loss(&mut self) -> Result<DMatrix<f32>> {
        self.backward(&DMatrix::from_element(1, 1, 1.0))
    }
}

impl Layer for SoftmaxWithLoss {
    fn kind(&self) -> &'static str {
        "SoftmaxWithLoss"
    }

    /// Probabilities only; clears the state of any earlier `forward_to_loss`.
    fn forward(&mut self, x: &DMatrix<f32>, _train: bool) -> Result<DMatrix<f32>> {
        self.y = None;
        self.t = None;

        Ok(softmax(x))
    }

    /// `dout` is the `1 × 1` upstream gradient of the scalar loss.
    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let (Some(y), Some(t)) = (&self.y, &self.t) else {
            return Err(Error::BackwardBeforeForward("SoftmaxWithLoss"));
        };

        ensure_shape("SoftmaxWithLoss::backward", (1, 1), dout.shape())?;

        let scale = dout[(0, 0)] / y.nrows() as f32;

        Ok((y - t) * scale)
    }
}

/// Randomly zeroes activations with probability `ratio` while training and
/// scales by `1 - ratio` at inference.
#[derive(Debug)]
pub struct Dropout {
    ratio: f32,
    rng: StdRng,
    mask: Option<DMatrix<f32>>,
}

impl Dropout {
    pub fn new(ratio: f32, seed: Option<u64>) -> Result<Self> {
        if !(0.0..1.0).contains(&ratio) {
            return Err(Error::InvalidConfig(format!(
                "dropout ratio must be in [0, 1), got {ratio}"
            )));
        }

        Ok(Self {
            ratio,
            rng: make_rng(seed),
            mask: None,
        })
    }
}

impl Layer for Dropout {
    fn kind(&self) -> &'static str {
        "Dropout"
    }

    fn forward(&mut self, x: &DMatrix<f32>, train: bool) -> Result<DMatrix<f32>> {
        let (r, c) = x.shape();
        let mask = if train {
            let ratio = self.ratio;
            let rng = &mut self.rng;

            DMatrix::from_fn(r, c, |_, _| if rng.gen::<f32>() > ratio { 1.0 } else { 0.0 })
        } else {
            DMatrix::from_element(r, c, 1.0 - self.ratio)
        };
        let out = x.component_mul(&mask);

        self.mask = Some(mask);

        Ok(out)
    }

    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let mask = cached(&self.mask, self.kind())?;

        ensure_shape("Dropout::backward", mask.shape(), dout.shape())?;

        Ok(dout.component_mul(mask))
    }
}

const BN_EPS: f32 = 1e-7;

#[derive(Debug)]
struct BatchNormCache {
    xc: DMatrix<f32>,
    xn: DMatrix<f32>,
    std: Vec<f32>,
}

/// Normalizes every feature to zero mean and unit variance over the batch,
/// then applies a learned scale `gamma` and shift `beta`.
#[derive(Debug)]
pub struct BatchNormalization {
    gamma: Param,
    beta: Param,
    momentum: f32,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
    cache: Option<BatchNormCache>,
}

impl BatchNormalization {
    /// `gamma` and `beta` are `1 × D`.
    pub fn new(gamma: Param, beta: Param, momentum: f32) -> Result<Self> {
        ensure_shape("BatchNormalization::new", gamma.shape(), beta.shape())?;

        let d = gamma.shape().1;

        Ok(Self {
            gamma,
            beta,
            momentum,
            running_mean: vec![0.0; d],
            running_var: vec![0.0; d],
            cache: None,
        })
    }

    pub fn running_mean(&self) -> &[f32] {
        &self.running_mean
    }

    pub fn running_var(&self) -> &[f32] {
        &self.running_var
    }
}

impl Layer for BatchNormalization {
    fn kind(&self) -> &'static str {
        "BatchNormalization"
    }

    fn forward(&mut self, x: &DMatrix<f32>, train: bool) -> Result<DMatrix<f32>> {
        let (n, d) = x.shape();

        if d != self.gamma.shape().1 {
            return Err(Error::shape(
                "BatchNormalization::forward",
                (n, self.gamma.shape().1),
                x.shape(),
            ));
        }

        let (mean, std) = if train {
            let mean: Vec<f32> = x.column_iter().map(|c| c.mean()).collect();
            let var: Vec<f32> = x
                .column_iter()
                .zip(&mean)
                .map(|(c, &mu)| c.iter().map(|v| (v - mu).powi(2)).sum::<f32>() / n as f32)
                .collect();

            let m = self.momentum;

            for (rm, &mu) in self.running_mean.iter_mut().zip(&mean) {
                *rm = m * *rm + (1.0 - m) * mu;
            }

            for (rv, &v) in self.running_var.iter_mut().zip(&var) {
                *rv = m * *rv + (1.0 - m) * v;
            }

            (mean, var)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };

        let std: Vec<f32> = std.iter().map(|v| f32::sqrt(v + BN_EPS)).collect();
        let xc = DMatrix::from_fn(n, d, |i, j| x[(i, j)] - mean[j]);
        let xn = DMatrix::from_fn(n, d, |i, j| xc[(i, j)] / std[j]);
        let gamma = &self.gamma.value;
        let beta = &self.beta.value;
        let out = DMatrix::from_fn(n, d, |i, j| gamma[(0, j)] * xn[(i, j)] + beta[(0, j)]);

        if train {
            self.cache = Some(BatchNormCache { xc, xn, std });
        }

        Ok(out)
    }

    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let BatchNormCache { xc, xn, std } = self
            .cache
            .as_ref()
            .ok_or(Error::BackwardBeforeForward("BatchNormalization"))?;

        ensure_shape("BatchNormalization::backward", xn.shape(), dout.shape())?;

        let (n, d) = dout.shape();
        let nf = n as f32;
        let gamma = &self.gamma.value;

        self.beta.grad = column_sums(dout);
        self.gamma.grad = column_sums(&xn.component_mul(dout));

        let dxn = DMatrix::from_fn(n, d, |i, j| gamma[(0, j)] * dout[(i, j)]);
        let mut dxc = DMatrix::from_fn(n, d, |i, j| dxn[(i, j)] / std[j]);

        for j in 0..d {
            let dstd: f32 = -(0..n)
                .map(|i| dxn[(i, j)] * xc[(i, j)] / (std[j] * std[j]))
                .sum::<f32>();
            let dvar = 0.5 * dstd / std[j];

            for i in 0..n {
                dxc[(i, j)] += (2.0 / nf) * xc[(i, j)] * dvar;
            }
        }

        let dmu = column_sums(&dxc);

        Ok(DMatrix::from_fn(n, d, |i, j| dxc[(i, j)] - dmu[(0, j)] / nf))
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.gamma, &self.beta]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::gradient::numerical_gradient;

    fn sample_input() -> DMatrix<f32> {
        DMatrix::from_row_slice(2, 3, &[1.0, -0.5, 0.0, -2.0, 3.0, 0.25])
    }

    #[test]
    fn relu_masks_negative_inputs() {
        let mut layer = Relu::new();
        let y = layer.forward(&sample_input(), true).unwrap();

        assert_eq!(y, DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 3.0, 0.25]));

        let dx = layer.backward(&DMatrix::from_element(2, 3, 2.0)).unwrap();

        assert_eq!(dx, DMatrix::from_row_slice(2, 3, &[2.0, 0.0, 0.0, 0.0, 2.0, 2.0]));
    }

    #[test]
    fn backward_before_forward_fails() {
        let dout = DMatrix::from_element(2, 3, 1.0);

        assert!(matches!(
            Relu::new().backward(&dout),
            Err(Error::BackwardBeforeForward("Relu"))
        ));
        assert!(Sigmoid::new().backward(&dout).is_err());
        assert!(SoftmaxWithLoss::new().backward_loss().is_err());

        let mut affine = Affine::new(
            Param::new("W1", DMatrix::zeros(3, 2)),
            Param::new("b1", DMatrix::zeros(1, 2)),
        )
        .unwrap();

        assert!(matches!(
            affine.backward(&DMatrix::zeros(2, 2)),
            Err(Error::BackwardBeforeForward("Affine"))
        ));
    }

    #[test]
    fn softmax_with_loss_plain_forward_drops_loss_state() {
        let x = sample_input();
        let t = DMatrix::from_row_slice(2, 3, &[0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
        let mut layer = SoftmaxWithLoss::new();

        layer.forward_to_loss(&x, &t).unwrap();

        let y = layer.forward(&DMatrix::zeros(4, 3), false).unwrap();

        assert_relative_eq!(y, DMatrix::from_element(4, 3, 1.0 / 3.0), epsilon = 1e-6);
        assert!(matches!(
            layer.backward_loss(),
            Err(Error::BackwardBeforeForward("SoftmaxWithLoss"))
        ));
    }

    #[test]
    fn sigmoid_gradient_matches_numerical() {
        let x = sample_input();
        let mut layer = Sigmoid::new();

        layer.forward(&x, true).unwrap();

        let dx = layer.backward(&DMatrix::from_element(2, 3, 1.0)).unwrap();
        let mut perturbed = x.clone();
        let numeric = numerical_gradient(&mut perturbed, |p| p.map(sigmoid).sum());

        assert_relative_eq!(dx, numeric, epsilon = 1e-2);
    }

    #[test]
    fn affine_forward_and_gradients() {
        let w = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let b = DMatrix::from_row_slice(1, 2, &[0.5, -0.5]);
        let mut layer = Affine::new(Param::new("W1", w.clone()), Param::new("b1", b)).unwrap();
        let x = sample_input();
        let y = layer.forward(&x, true).unwrap();

        assert_relative_eq!(
            y,
            DMatrix::from_row_slice(2, 2, &[1.5, -1.0, -1.25, 2.75]),
            epsilon = 1e-6
        );

        let dout = DMatrix::from_element(2, 2, 1.0);
        let dx = layer.backward(&dout).unwrap();

        assert_eq!(dx.shape(), (2, 3));
        assert_relative_eq!(dx, &dout * w.transpose(), epsilon = 1e-6);
        assert_relative_eq!(layer.params()[0].grad, x.transpose() * &dout, epsilon = 1e-6);
        assert_eq!(layer.params()[1].grad, DMatrix::from_row_slice(1, 2, &[2.0, 2.0]));
    }

    #[test]
    fn affine_rejects_wrong_width() {
        let mut layer = Affine::new(
            Param::new("W1", DMatrix::zeros(4, 2)),
            Param::new("b1", DMatrix::zeros(1, 2)),
        )
        .unwrap();

        assert!(matches!(
            layer.forward(&sample_input(), true),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(Affine::new(
            Param::new("W1", DMatrix::zeros(4, 2)),
            Param::new("b1", DMatrix::zeros(1, 3)),
        )
        .is_err());
    }

    #[test]
    fn softmax_gradient_matches_numerical() {
        let x = sample_input();
        let weights = DMatrix::from_row_slice(2, 3, &[0.3, -1.0, 2.0, 1.5, 0.2, -0.7]);
        let mut layer = Softmax::new();

        layer.forward(&x, true).unwrap();

        let dx = layer.backward(&weights).unwrap();
        let mut perturbed = x.clone();
        let numeric = numerical_gradient(&mut perturbed, |p| softmax(p).component_mul(&weights).sum());

        assert_relative_eq!(dx, numeric, epsilon = 1e-2);
    }

    #[test]
    fn softmax_with_loss_gradient_is_y_minus_t() {
        let x = sample_input();
        let t = DMatrix::from_row_slice(2, 3, &[0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
        let mut layer = SoftmaxWithLoss::new();
        let loss = layer.forward_to_loss(&x, &t).unwrap();

        assert_relative_eq!(loss, cross_entropy_error(&softmax(&x), &t).unwrap());

        let dx = layer.backward_loss().unwrap();

        assert_relative_eq!(dx, (softmax(&x) - &t) / 2.0, epsilon = 1e-6);

        let mut perturbed = x.clone();
        let numeric =
            numerical_gradient(&mut perturbed, |p| cross_entropy_error(&softmax(p), &t).unwrap());

        assert_relative_eq!(dx, numeric, epsilon = 1e-2);
    }

    #[test]
    fn dropout_train_and_inference() {
        let x = DMatrix::from_element(20, 20, 1.0);
        let mut layer = Dropout::new(0.5, Some(7)).unwrap();
        let y = layer.forward(&x, true).unwrap();
        let kept = y.iter().filter(|&&v| v == 1.0).count();

        assert!(y.iter().all(|&v| v == 0.0 || v == 1.0));
        assert!(kept > 100 && kept < 300);

        let dx = layer.backward(&DMatrix::from_element(20, 20, 3.0)).unwrap();

        assert_eq!(dx, y * 3.0);

        let y = layer.forward(&x, false).unwrap();

        assert!(y.iter().all(|&v| v == 0.5));
        assert!(Dropout::new(1.0, None).is_err());
    }

    #[test]
    fn batch_norm_normalizes_training_batches() {
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]);
        let mut layer = BatchNormalization::new(
            Param::new("gamma1", DMatrix::from_element(1, 2, 1.0)),
            Param::new("beta1", DMatrix::zeros(1, 2)),
            0.9,
        )
        .unwrap();
        let y = layer.forward(&x, true).unwrap();

        for col in y.column_iter() {
            assert_relative_eq!(col.mean(), 0.0, epsilon = 1e-5);
            assert_relative_eq!(col.norm_squared() / 4.0, 1.0, epsilon = 1e-4);
        }

        assert_relative_eq!(layer.running_mean()[0], 0.25, epsilon = 1e-6);
        assert_relative_eq!(layer.running_mean()[1], 2.5, epsilon = 1e-5);
    }

    #[test]
    fn batch_norm_inference_uses_running_statistics() {
        let train_x = DMatrix::from_row_slice(2, 1, &[1.0, 3.0]);
        let gamma = DMatrix::from_element(1, 1, 2.0);
        let beta = DMatrix::from_element(1, 1, 0.5);
        let make = || {
            BatchNormalization::new(
                Param::new("gamma1", gamma.clone()),
                Param::new("beta1", beta.clone()),
                0.9,
            )
            .unwrap()
        };
        let mut layer = make();

        layer.forward(&train_x, true).unwrap();

        // Batch mean 2 and variance 1, blended into zeroed running stats.
        assert_relative_eq!(layer.running_mean()[0], 0.2, epsilon = 1e-6);
        assert_relative_eq!(layer.running_var()[0], 0.1, epsilon = 1e-6);

        let test_x = DMatrix::from_row_slice(3, 1, &[1.0, 3.0, -2.0]);
        let y = layer.forward(&test_x, false).unwrap();
        let expected = test_x.map(|v| (v - 0.2) / f32::sqrt(0.1 + BN_EPS) * 2.0 + 0.5);

        assert_relative_eq!(y, expected, epsilon = 1e-4);
        assert_relative_eq!(layer.running_mean()[0], 0.2, epsilon = 1e-6);

        let dout = DMatrix::from_row_slice(2, 1, &[1.0, -0.5]);
        let dx = layer.backward(&dout).unwrap();
        let mut reference = make();

        reference.forward(&train_x, true).unwrap();

        assert_relative_eq!(dx, reference.backward(&dout).unwrap(), epsilon = 1e-6);
        assert!(matches!(
            layer.backward(&DMatrix::zeros(3, 1)),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn batch_norm_gradient_matches_numerical() {
        let x = DMatrix::from_row_slice(3, 2, &[0.5, -1.0, 1.5, 0.3, -0.2, 2.0]);
        let weights = DMatrix::from_row_slice(3, 2, &[1.0, -2.0, 0.5, 0.3, -1.0, 1.2]);
        let gamma = DMatrix::from_row_slice(1, 2, &[1.5, 0.7]);
        let beta = DMatrix::from_row_slice(1, 2, &[0.1, -0.2]);
        let make = || {
            BatchNormalization::new(
                Param::new("gamma1", gamma.clone()),
                Param::new("beta1", beta.clone()),
                0.9,
            )
            .unwrap()
        };
        let mut layer = make();

        layer.forward(&x, true).unwrap();

        let dx = layer.backward(&weights).unwrap();
        let mut perturbed = x.clone();
        let numeric = numerical_gradient(&mut perturbed, |p| {
            make().forward(p, true).unwrap().component_mul(&weights).sum()
        });

        assert_relative_eq!(dx, numeric, epsilon = 5e-2);
        assert_eq!(layer.params()[1].grad, column_sums(&weights));
    }
}
