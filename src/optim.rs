//! Parameter update rules.
//!
//! Optimizers keep per-parameter state keyed by [`Param::name`], so names must
//! be unique within a network.

use std::collections::HashMap;

use nalgebra::DMatrix;

use crate::layer::Param;

const EPS: f32 = 1e-8;

pub trait Optimizer {
    /// Applies one update to every parameter from the gradient stored in it.
    fn step(&mut self, params: &mut [&mut Param]);
}

fn state_for<'a>(
    state: &'a mut HashMap<String, DMatrix<f32>>,
    param: &Param,
) -> &'a mut DMatrix<f32> {
    let (r, c) = param.shape();

    state
        .entry(param.name.clone())
        .or_insert_with(|| DMatrix::zeros(r, c))
}

/// params ← params − lr·grads
#[derive(Clone, Debug)]
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Param]) {
        for p in params.iter_mut() {
            p.value -= &p.grad * self.lr;
        }
    }
}

/// m ← β·m − lr·grads; params ← params + m
#[derive(Clone, Debug)]
pub struct Momentum {
    lr: f32,
    beta: f32,
    velocity: HashMap<String, DMatrix<f32>>,
}

impl Momentum {
    pub fn new(lr: f32, beta: f32) -> Self {
        Self {
            lr,
            beta,
            velocity: HashMap::new(),
        }
    }
}

impl Default for Momentum {
    fn default() -> Self {
        Self::new(0.01, 0.9)
    }
}

impl Optimizer for Momentum {
    fn step(&mut self, params: &mut [&mut Param]) {
        for p in params.iter_mut() {
            let m = state_for(&mut self.velocity, p);

            *m *= self.beta;
            *m -= &p.grad * self.lr;
            p.value += &*m;
        }
    }
}

/// v ← v + grads²; params ← params − lr·grads / (√v + ε)
#[derive(Clone, Debug)]
pub struct AdaGrad {
    lr: f32,
    h: HashMap<String, DMatrix<f32>>,
}

impl AdaGrad {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            h: HashMap::new(),
        }
    }
}

impl Default for AdaGrad {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl Optimizer for AdaGrad {
    fn step(&mut self, params: &mut [&mut Param]) {
        let lr = self.lr;

        for p in params.iter_mut() {
            let h = state_for(&mut self.h, p);

            *h += p.grad.component_mul(&p.grad);

            let update = p.grad.zip_map(h, |g, v| lr * g / (v.sqrt() + EPS));

            p.value -= update;
        }
    }
}

/// v ← d·v + (1 − d)·grads²; params ← params − lr·grads / (√v + ε)
#[derive(Clone, Debug)]
pub struct RmsProp {
    lr: f32,
    decay_rate: f32,
    h: HashMap<String, DMatrix<f32>>,
}

impl RmsProp {
    pub fn new(lr: f32, decay_rate: f32) -> Self {
        Self {
            lr,
            decay_rate,
            h: HashMap::new(),
        }
    }
}

impl Default for RmsProp {
    fn default() -> Self {
        Self::new(0.01, 0.99)
    }
}

impl Optimizer for RmsProp {
    fn step(&mut self, params: &mut [&mut Param]) {
        let (lr, decay) = (self.lr, self.decay_rate);

        for p in params.iter_mut() {
            let h = state_for(&mut self.h, p);

            h.zip_apply(&p.grad, |v, g| *v = decay * *v + (1.0 - decay) * g * g);

            let update = p.grad.zip_map(h, |g, v| lr * g / (v.sqrt() + EPS));

            p.value -= update;
        }
    }
}

/// Adam with bias-corrected first and second moment estimates.
#[derive(Clone, Debug)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    iter: i32,
    m: HashMap<String, DMatrix<f32>>,
    v: HashMap<String, DMatrix<f32>>,
}

impl Adam {
    pub fn new(lr: f32, beta1: f32, beta2: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            iter: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.001, 0.9, 0.999)
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Param]) {
        self.iter += 1;

        let (b1, b2) = (self.beta1, self.beta2);
        let m_correction = 1.0 - b1.powi(self.iter);
        let v_correction = 1.0 - b2.powi(self.iter);
        let lr = self.lr;

        for p in params.iter_mut() {
            let m = state_for(&mut self.m, p);

            m.zip_apply(&p.grad, |m, g| *m = b1 * *m + (1.0 - b1) * g);

            let v = state_for(&mut self.v, p);

            v.zip_apply(&p.grad, |v, g| *v = b2 * *v + (1.0 - b2) * g * g);

            let m = &self.m[&p.name];
            let v = &self.v[&p.name];
            let update = m.zip_map(v, |m, v| {
                lr * (m / m_correction) / ((v / v_correction).sqrt() + EPS)
            });

            p.value -= update;
        }
    }
}

/// Update rules selectable at run time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OptimizerKind {
    Sgd,
    Momentum,
    #[value(name = "adagrad")]
    AdaGrad,
    #[value(name = "rmsprop")]
    RmsProp,
    Adam,
}

impl OptimizerKind {
    /// Builds the optimizer with learning rate `lr` (or its own default) and
    /// default values for everything else.
    pub fn build(self, lr: Option<f32>) -> Box<dyn Optimizer> {
        match self {
            Self::Sgd => Box::new(lr.map_or_else(Sgd::default, Sgd::new)),
            Self::Momentum => {
                Box::new(lr.map_or_else(Momentum::default, |lr| Momentum::new(lr, 0.9)))
            }
            Self::AdaGrad => Box::new(lr.map_or_else(AdaGrad::default, AdaGrad::new)),
            Self::RmsProp => {
                Box::new(lr.map_or_else(RmsProp::default, |lr| RmsProp::new(lr, 0.99)))
            }
            Self::Adam => Box::new(lr.map_or_else(Adam::default, |lr| Adam::new(lr, 0.9, 0.999))),
        }
    }
}
