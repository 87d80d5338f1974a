//! Numerical differentiation, used to check the analytic backward passes.

use nalgebra::DMatrix;

use crate::{error::Result, network::NeuralNet};

const H: f32 = 1e-4;

/// Central-difference gradient of `f` at `x`. `x` is perturbed in place and
/// restored before returning.
pub fn numerical_gradient(
    x: &mut DMatrix<f32>,
    mut f: impl FnMut(&DMatrix<f32>) -> f32,
) -> DMatrix<f32> {
    let mut grad = DMatrix::zeros(x.nrows(), x.ncols());

    for idx in 0..x.len() {
        let orig = x[idx];

        x[idx] = orig + H;
        let fxh1 = f(x);

        x[idx] = orig - H;
        let fxh2 = f(x);

        x[idx] = orig;
        grad[idx] = (fxh1 - fxh2) / (2.0 * H);
    }

    grad
}

/// Numerical gradient of the network loss with respect to every parameter,
/// in the order `params_mut` yields them.
pub fn numerical_param_gradients<N: NeuralNet + ?Sized>(
    net: &mut N,
    x: &DMatrix<f32>,
    t: &DMatrix<f32>,
) -> Result<Vec<(String, DMatrix<f32>)>> {
    let count = net.params_mut().len();
    let mut grads = Vec::with_capacity(count);

    for p in 0..count {
        let (name, len, shape) = {
            let params = net.params_mut();
            let param = &params[p];

            (param.name.clone(), param.value.len(), param.shape())
        };
        let mut grad = DMatrix::zeros(shape.0, shape.1);

        for idx in 0..len {
            let orig = net.params_mut()[p].value[idx];

            net.params_mut()[p].value[idx] = orig + H;
            let fxh1 = net.loss(x, t, true)?;

            net.params_mut()[p].value[idx] = orig - H;
            let fxh2 = net.loss(x, t, true)?;

            net.params_mut()[p].value[idx] = orig;
            grad[idx] = (fxh1 - fxh2) / (2.0 * H);
        }

        grads.push((name, grad));
    }

    Ok(grads)
}

/// Mean absolute difference between backprop and numerical gradients, per
/// parameter name.
pub fn gradient_check<N: NeuralNet + ?Sized>(
    net: &mut N,
    x: &DMatrix<f32>,
    t: &DMatrix<f32>,
) -> Result<Vec<(String, f32)>> {
    let numeric = numerical_param_gradients(net, x, t)?;

    net.gradient(x, t)?;

    Ok(net
        .params_mut()
        .into_iter()
        .zip(numeric)
        .map(|(param, (name, grad))| {
            let diff = (&param.grad - grad).abs().mean();

            (name, diff)
        })
        .collect())
}
