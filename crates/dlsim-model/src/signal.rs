// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Signals: named blocks of state that operators read and write

use ndarray::{ArrayD, IxDyn};

use crate::ids::SignalId;

/// Rows `offset, offset + stride, ...` of a base signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalView {
    pub base: SignalId,
    pub offset: usize,
    pub stride: usize,
}

/// A vector or matrix of values living in the simulator state
///
/// Scalars are stored with shape `[1]`. Matrices keep their rows along the
/// first axis; everything after the first axis is the "trailing shape".
#[derive(Debug, Clone)]
pub struct Signal {
    pub name: String,
    initial_value: ArrayD<f64>,
    /// Updated by training
    pub trainable: bool,
    /// Carries an independent copy per minibatch item
    pub minibatched: bool,
    pub view: Option<SignalView>,
}

impl Signal {
    pub fn new(name: impl Into<String>, initial_value: ArrayD<f64>) -> Self {
        let initial_value = if initial_value.ndim() == 0 {
            let value = initial_value.iter().next().copied().unwrap_or(0.0);
            ArrayD::from_elem(IxDyn(&[1]), value)
        } else {
            initial_value
        };
        Self {
            name: name.into(),
            initial_value,
            trainable: false,
            minibatched: false,
            view: None,
        }
    }

    pub fn zeros(name: impl Into<String>, shape: &[usize]) -> Self {
        Self::new(name, ArrayD::zeros(IxDyn(shape)))
    }

    pub fn from_vec(name: impl Into<String>, values: Vec<f64>) -> Self {
        let len = values.len();
        let array = ArrayD::from_shape_vec(IxDyn(&[len]), values)
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[len])));
        Self::new(name, array)
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn minibatched(mut self, minibatched: bool) -> Self {
        self.minibatched = minibatched;
        self
    }

    pub fn shape(&self) -> &[usize] {
        self.initial_value.shape()
    }

    pub fn rows(&self) -> usize {
        self.shape()[0]
    }

    pub fn trailing_shape(&self) -> &[usize] {
        &self.shape()[1..]
    }

    /// Number of elements in one row
    pub fn row_size(&self) -> usize {
        self.trailing_shape().iter().product()
    }

    pub fn size(&self) -> usize {
        self.initial_value.len()
    }

    pub fn initial_value(&self) -> &ArrayD<f64> {
        &self.initial_value
    }

    pub fn is_view(&self) -> bool {
        self.view.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_become_length_one_vectors() {
        let sig = Signal::new("scalar", ArrayD::from_elem(IxDyn(&[]), 3.0));
        assert_eq!(sig.shape(), &[1]);
        assert_eq!(sig.initial_value()[[0]], 3.0);
    }

    #[test]
    fn test_matrix_trailing_shape() {
        let sig = Signal::zeros("weights", &[4, 3]);
        assert_eq!(sig.rows(), 4);
        assert_eq!(sig.trailing_shape(), &[3]);
        assert_eq!(sig.row_size(), 3);
        assert_eq!(sig.size(), 12);
    }
}
