//! Neural networks built from first principles: layers with hand-written
//! forward and backward passes, chained into networks and trained with
//! mini-batch gradient descent on MNIST.

pub mod activation;
pub mod cnn;
pub mod conv;
pub mod dataset;
pub mod error;
pub mod gradient;
pub mod layer;
pub mod loss;
pub mod mnist;
pub mod network;
pub mod optim;
pub mod trainer;

pub use error::{Error, Result};
