//! Activation functions, scalar and batched.
//!
//! Batched forms operate on `N × D` matrices holding one sample per row.

use nalgebra::DMatrix;

pub fn sigmoid(x: f32) -> f32 {
    if x < -40.0 {
        0.0
    } else if x > 40.0 {
        1.0
    } else {
        1.0 / (1.0 + f32::exp(-x))
    }
}

pub fn sigmoid_prime(x: f32) -> f32 {
    sigmoid(x) * (1.0 - sigmoid(x))
}

pub fn step(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

pub fn identity(x: f32) -> f32 {
    x
}

/// Row-wise softmax. The row maximum is subtracted before exponentiating so
/// large logits don't overflow.
pub fn softmax(x: &DMatrix<f32>) -> DMatrix<f32> {
    let mut out = x.clone();

    for mut row in out.row_iter_mut() {
        let max = row.max();

        row.apply(|v| *v = f32::exp(*v - max));

        let sum = row.sum();

        row /= sum;
    }

    out
}

/// Index of the largest entry of every row.
pub fn argmax_rows(x: &DMatrix<f32>) -> Vec<usize> {
    x.row_iter().map(|row| row.transpose().argmax().0).collect()
}
