// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Parameter update rules used by training

use dlsim_config::OptimizerKind;

/// Applies one update to a flat parameter vector given its gradient
pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    fn apply(&mut self, params: &mut [f64], grads: &[f64]);
}

#[derive(Debug, Clone)]
pub struct GradientDescent {
    pub learning_rate: f64,
}

impl GradientDescent {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for GradientDescent {
    fn name(&self) -> &'static str {
        "gradient_descent"
    }

    fn apply(&mut self, params: &mut [f64], grads: &[f64]) {
        for (p, g) in params.iter_mut().zip(grads) {
            *p -= self.learning_rate * g;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Momentum {
    pub learning_rate: f64,
    pub momentum: f64,
    velocity: Vec<f64>,
}

impl Momentum {
    pub fn new(learning_rate: f64, momentum: f64) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for Momentum {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn apply(&mut self, params: &mut [f64], grads: &[f64]) {
        if self.velocity.len() != params.len() {
            self.velocity = vec![0.0; params.len()];
        }
        for ((p, g), v) in params.iter_mut().zip(grads).zip(self.velocity.iter_mut()) {
            *v = self.momentum * *v + g;
            *p -= self.learning_rate * *v;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn apply(&mut self, params: &mut [f64], grads: &[f64]) {
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
            self.t = 0;
        }
        self.t += 1;
        let correction1 = 1.0 - self.beta1.powi(self.t);
        let correction2 = 1.0 - self.beta2.powi(self.t);
        for i in 0..params.len().min(grads.len()) {
            let g = grads[i];
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[i] / correction1;
            let v_hat = self.v[i] / correction2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}

/// Optimizer selected in `[training]`
pub fn optimizer_from_config(kind: OptimizerKind, learning_rate: f64) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::GradientDescent => Box::new(GradientDescent::new(learning_rate)),
        OptimizerKind::Momentum => Box::new(Momentum::new(learning_rate, 0.9)),
        OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimise (p - 3)^2 and return the final parameter
    fn minimise(opt: &mut dyn Optimizer, steps: usize) -> f64 {
        let mut p = [0.0];
        for _ in 0..steps {
            let grad = [2.0 * (p[0] - 3.0)];
            opt.apply(&mut p, &grad);
        }
        p[0]
    }

    #[test]
    fn test_all_optimizers_converge() {
        assert!((minimise(&mut GradientDescent::new(0.1), 200) - 3.0).abs() < 1e-6);
        assert!((minimise(&mut Momentum::new(0.05, 0.9), 500) - 3.0).abs() < 1e-3);
        assert!((minimise(&mut Adam::new(0.1), 2000) - 3.0).abs() < 1e-2);
    }

    #[test]
    fn test_from_config() {
        assert_eq!(optimizer_from_config(OptimizerKind::Adam, 0.01).name(), "adam");
        assert_eq!(optimizer_from_config(OptimizerKind::Momentum, 0.01).name(), "momentum");
    }
}
