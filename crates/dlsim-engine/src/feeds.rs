// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Input node values for a run
//!
//! Every input node gets one value per step: the caller's feed when one is
//! supplied, otherwise the node's constant output or its function evaluated
//! at the step's time.

use std::collections::HashMap;

use ndarray::{s, Array3};
use tracing::debug;

use dlsim_model::{InputSource, Model, NodeId};

use crate::error::{Result, SimError};
use crate::executor::{check_function_output, InputValues};
use crate::float::SimFloat;

/// Override values per input node, shaped `(minibatch, n_steps, size_out)`
pub type InputFeeds = HashMap<NodeId, Array3<f64>>;

/// Reject feeds for unknown nodes or with the wrong shape
pub fn check_input_feeds(model: &Model, feeds: &InputFeeds, n_steps: usize, minibatch_size: usize) -> Result<()> {
    for (node, values) in feeds {
        let input = model
            .input(*node)
            .ok_or_else(|| SimError::Simulation(format!("{} is not an input node of model '{}'", node, model.label)))?;
        let expected = [minibatch_size, n_steps, input.size_out];
        if values.shape() != expected {
            return Err(SimError::ShapeMismatch {
                context: format!("input feed of node '{}'", input.label),
                expected: expected.to_vec(),
                actual: values.shape().to_vec(),
            });
        }
    }
    Ok(())
}

/// Values of every input node for steps `start + 1 ..= start + steps`
///
/// Feeds shorter than `steps` (unroll rounding) repeat their last value.
pub fn generate_inputs<T: SimFloat>(
    model: &Model,
    feeds: &InputFeeds,
    start: usize,
    steps: usize,
    minibatch_size: usize,
    dt: f64,
) -> Result<InputValues<T>> {
    let mut values = InputValues::default();
    for input in &model.inputs {
        if let Some(feed) = feeds.get(&input.node) {
            let feed_steps = feed.dim().1;
            if feed_steps == 0 && steps > 0 {
                return Err(SimError::Simulation(format!(
                    "input feed of node '{}' has no steps",
                    input.label
                )));
            }
            let tiled = Array3::from_shape_fn((steps, input.size_out, minibatch_size), |(t, k, b)| {
                T::of_f64(feed[[b, t.min(feed_steps - 1), k]])
            });
            values.insert(input.node, tiled);
            continue;
        }

        match &input.source {
            InputSource::Constant(constant) => {
                let tiled = Array3::from_shape_fn((steps, input.size_out, minibatch_size), |(_, k, _)| {
                    T::of_f64(constant[k])
                });
                values.insert(input.node, tiled);
            }
            InputSource::Function(function) => {
                // called even when nothing reads the output
                let mut tiled = Array3::zeros((steps, input.size_out, minibatch_size));
                for i in 0..steps {
                    let t = (start + i + 1) as f64 * dt;
                    let out = function.call(t, &[]);
                    if input.output.is_none() {
                        continue;
                    }
                    check_function_output(function.name(), &out, input.size_out)?;
                    for (k, v) in out.iter().enumerate() {
                        tiled.slice_mut(s![i, k, ..]).fill(T::of_f64(*v));
                    }
                }
                if input.output.is_some() {
                    values.insert(input.node, tiled);
                }
            }
        }
    }
    debug!(
        "[SIM] generated inputs for {} nodes over {} steps from step {}",
        values.len(),
        steps,
        start
    );
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlsim_model::{build, Network, Node};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn network() -> (Network, NodeId, NodeId) {
        let mut net = Network::new("feeds");
        let constant = net.add_node(Node::constant("c", vec![0.5, 1.5]));
        let clock = net.add_node(Node::time_function("clock", 1, |t| vec![t]));
        (net, constant, clock)
    }

    #[test]
    fn test_function_called_at_step_times() {
        let (net, _, clock) = network();
        let model = build(&net, 0.1, 0).unwrap();
        let values: InputValues<f64> = generate_inputs(&model, &InputFeeds::new(), 5, 3, 2, 0.1).unwrap();
        let times = &values[&clock];
        assert_eq!(times.dim(), (3, 1, 2));
        assert!((times[[0, 0, 1]] - 0.6).abs() < 1e-12);
        assert!((times[[2, 0, 0]] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_feed_overrides_and_holds_last_value() {
        let (net, constant, _) = network();
        let model = build(&net, 0.1, 0).unwrap();
        let mut feeds = InputFeeds::new();
        feeds.insert(constant, Array3::from_shape_fn((1, 2, 2), |(_, t, k)| (t * 10 + k) as f64));
        check_input_feeds(&model, &feeds, 2, 1).unwrap();

        let values: InputValues<f32> = generate_inputs(&model, &feeds, 0, 4, 1, 0.1).unwrap();
        let fed = &values[&constant];
        assert_eq!(fed[[0, 1, 0]], 1.0);
        assert_eq!(fed[[1, 0, 0]], 10.0);
        assert_eq!(fed[[3, 1, 0]], 11.0);
    }

    #[test]
    fn test_bad_feed_shape_rejected() {
        let (net, constant, _) = network();
        let model = build(&net, 0.1, 0).unwrap();
        let mut feeds = InputFeeds::new();
        feeds.insert(constant, Array3::zeros((1, 3, 2)));
        let err = check_input_feeds(&model, &feeds, 2, 1).unwrap_err();
        assert!(matches!(err, SimError::ShapeMismatch { .. }));

        let mut unknown = InputFeeds::new();
        unknown.insert(NodeId(99), Array3::zeros((1, 2, 2)));
        assert!(check_input_feeds(&model, &unknown, 2, 1).is_err());
    }

    #[test]
    fn test_unused_function_is_still_called() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut net = Network::new("side_effect");
        net.add_node(Node::time_function("tick", 0, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }));
        let model = build(&net, 0.001, 0).unwrap();
        let values: InputValues<f64> = generate_inputs(&model, &InputFeeds::new(), 0, 7, 1, 0.001).unwrap();
        assert!(values.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }
}
