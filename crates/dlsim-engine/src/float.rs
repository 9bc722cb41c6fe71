// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Floating point precision of the simulator state

use ndarray::NdFloat;

/// Element type of all base arrays
///
/// Signals are described in `f64`; the executor converts them once at
/// layout time and converts probe data back on the way out.
pub trait SimFloat: NdFloat + Default {
    /// Name reported in logs and parameter files
    const NAME: &'static str;

    fn of_f64(value: f64) -> Self;

    fn into_f64(self) -> f64;
}

impl SimFloat for f32 {
    const NAME: &'static str = "float32";

    #[inline]
    fn of_f64(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn into_f64(self) -> f64 {
        self as f64
    }
}

impl SimFloat for f64 {
    const NAME: &'static str = "float64";

    #[inline]
    fn of_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn into_f64(self) -> f64 {
        self
    }
}
