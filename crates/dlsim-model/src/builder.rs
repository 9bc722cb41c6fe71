// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lowers a [`Network`] into a [`Model`]
//!
//! Every object becomes a handful of signals plus the operators that move
//! values between them each step:
//!
//! * input node: `NodeInput -> out`
//! * other node: `Reset(in)`, then `SimPyFunc(t, in) -> out` (passthrough nodes reuse `in`)
//! * population: `Reset(in)`, `Copy(bias -> J)`, `ElementwiseInc(J += gain * in)`, `SimNeurons(J) -> out`
//! * connection: `Reset(weighted)`, `ElementwiseInc`/`DotInc` into `weighted`,
//!   optional lowpass, then `Copy(post.in += ...)`
//! * probe with synapse: `SimProcess(Set)` into a filtered copy

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{ModelError, ModelResult};
use crate::ids::{ConnectionId, NodeId, PopulationId, ProbeId, SignalId};
use crate::model::{InputInfo, InputSource, Model, ProbeInfo};
use crate::network::{Endpoint, Network, NodeOutput, ProbeTarget, Transform};
use crate::operator::{Lowpass, Operator, ProcessMode};
use crate::signal::Signal;

#[derive(Debug, Clone, Copy)]
struct NodeSignals {
    input: Option<SignalId>,
    output: Option<SignalId>,
}

#[derive(Debug, Clone, Copy)]
struct PopulationSignals {
    input: SignalId,
    current: SignalId,
    output: SignalId,
}

/// Build `network` with timestep `dt`; `seed` drives random parameter initialisation
pub fn build(network: &Network, dt: f64, seed: u64) -> ModelResult<Model> {
    if !(dt > 0.0 && dt.is_finite()) {
        return Err(ModelError::InvalidParameter(format!("dt must be > 0 (got {})", dt)));
    }

    let mut model = Model::new(network.label.clone(), dt);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut node_sigs: HashMap<NodeId, NodeSignals> = HashMap::new();
    for (index, node) in network.nodes().iter().enumerate() {
        let id = NodeId(index);
        let sigs = build_node(&mut model, id, node)?;
        node_sigs.insert(id, sigs);
    }

    let mut pop_sigs: HashMap<PopulationId, PopulationSignals> = HashMap::new();
    for (index, pop) in network.populations().iter().enumerate() {
        let id = PopulationId(index);
        pop.neuron_type
            .validate()
            .map_err(|reason| ModelError::InvalidParameter(format!("{}: {}", pop.label, reason)))?;
        if pop.n_neurons == 0 {
            return Err(ModelError::InvalidParameter(format!(
                "population '{}' has no neurons",
                pop.label
            )));
        }

        let n = pop.n_neurons;
        let input = model.add_signal(Signal::zeros(format!("{}.in", pop.label), &[n]).minibatched(true));
        model.add_op(Operator::Reset { dst: input, value: 0.0 });

        let gain = model.add_signal(Signal::from_vec(
            format!("{}.gain", pop.label),
            pop.gain.sample(n, &mut rng)?,
        ));
        let bias = model.add_signal(
            Signal::from_vec(format!("{}.bias", pop.label), pop.bias.sample(n, &mut rng)?)
                .trainable(network.is_trainable(pop.trainable)),
        );

        let current = model.add_signal(Signal::zeros(format!("{}.J", pop.label), &[n]).minibatched(true));
        model.add_op(Operator::Copy {
            src: bias,
            dst: current,
            inc: false,
        });
        model.add_op(Operator::ElementwiseInc {
            a: gain,
            x: input,
            y: current,
        });

        let output = model.add_signal(Signal::zeros(format!("{}.out", pop.label), &[n]).minibatched(true));
        let states = pop
            .neuron_type
            .state_names()
            .iter()
            .map(|state| {
                model.add_signal(
                    Signal::zeros(format!("{}.{}", pop.label, state), &[n]).minibatched(true),
                )
            })
            .collect();
        model.add_op(Operator::SimNeurons {
            neuron_type: pop.neuron_type,
            j: current,
            output,
            states,
        });

        pop_sigs.insert(
            id,
            PopulationSignals {
                input,
                current,
                output,
            },
        );
    }

    let mut conn_weights: HashMap<ConnectionId, SignalId> = HashMap::new();
    for (index, conn) in network.connections().iter().enumerate() {
        let id = ConnectionId(index);
        let label = if conn.label.is_empty() {
            format!("conn{}", index)
        } else {
            conn.label.clone()
        };

        let pre = match conn.pre {
            Endpoint::Node(node) => node_sigs
                .get(&node)
                .and_then(|s| s.output)
                .ok_or_else(|| {
                    ModelError::InvalidParameter(format!("{}: node {} has no output", label, node))
                })?,
            Endpoint::Neurons(pop) => pop_sigs.get(&pop).ok_or(ModelError::UnknownPopulation(pop))?.output,
        };
        let post = match conn.post {
            Endpoint::Node(node) => node_sigs
                .get(&node)
                .and_then(|s| s.input)
                .ok_or_else(|| ModelError::InvalidTarget(format!("node {}", node)))?,
            Endpoint::Neurons(pop) => pop_sigs.get(&pop).ok_or(ModelError::UnknownPopulation(pop))?.input,
        };
        let size_post = model.signal(post)?.size();
        let trainable = network.is_trainable(conn.trainable);

        let weighted = model.add_signal(
            Signal::zeros(format!("{}.weighted", label), &[size_post]).minibatched(true),
        );
        model.add_op(Operator::Reset {
            dst: weighted,
            value: 0.0,
        });

        let weights = match &conn.transform {
            Transform::Scalar(scale) => {
                let weights = model.add_signal(
                    Signal::from_vec(format!("{}.weights", label), vec![*scale]).trainable(trainable),
                );
                model.add_op(Operator::ElementwiseInc {
                    a: weights,
                    x: pre,
                    y: weighted,
                });
                weights
            }
            Transform::Matrix(matrix) => {
                let weights = model.add_signal(
                    Signal::new(format!("{}.weights", label), matrix.clone().into_dyn()).trainable(trainable),
                );
                model.add_op(Operator::DotInc {
                    a: weights,
                    x: pre,
                    y: weighted,
                });
                weights
            }
        };
        conn_weights.insert(id, weights);

        let source = match conn.synapse {
            Some(tau) => {
                let filtered = model.add_signal(
                    Signal::zeros(format!("{}.filtered", label), &[size_post]).minibatched(true),
                );
                model.add_op(Operator::SimProcess {
                    process: Lowpass { tau },
                    input: weighted,
                    output: filtered,
                    state: None,
                    mode: ProcessMode::Update,
                });
                filtered
            }
            None => weighted,
        };
        model.add_op(Operator::Copy {
            src: source,
            dst: post,
            inc: true,
        });
    }

    for (index, probe) in network.probes().iter().enumerate() {
        let id = ProbeId(index);
        let label = if probe.label.is_empty() {
            format!("probe{}", index)
        } else {
            probe.label.clone()
        };

        let target = match probe.target {
            ProbeTarget::NodeOutput(node) => node_sigs
                .get(&node)
                .and_then(|s| s.output)
                .ok_or_else(|| {
                    ModelError::InvalidParameter(format!("{}: node {} has no output", label, node))
                })?,
            ProbeTarget::NeuronOutput(pop) => {
                pop_sigs.get(&pop).ok_or(ModelError::UnknownPopulation(pop))?.output
            }
            ProbeTarget::NeuronInput(pop) => {
                pop_sigs.get(&pop).ok_or(ModelError::UnknownPopulation(pop))?.current
            }
            ProbeTarget::ConnectionWeights(conn) => *conn_weights
                .get(&conn)
                .ok_or(ModelError::UnknownConnection(conn))?,
        };

        let signal = match probe.synapse {
            Some(tau) => {
                let source = model.signal(target)?;
                let shape = source.shape().to_vec();
                let minibatched = source.minibatched;
                let filtered = model.add_signal(
                    Signal::zeros(format!("{}.filtered", label), &shape).minibatched(minibatched),
                );
                let state = model.add_signal(
                    Signal::zeros(format!("{}.filter_state", label), &shape).minibatched(minibatched),
                );
                model.add_op(Operator::SimProcess {
                    process: Lowpass { tau },
                    input: target,
                    output: filtered,
                    state: Some(state),
                    mode: ProcessMode::Set,
                });
                filtered
            }
            None => target,
        };

        model.probes.push(ProbeInfo {
            id,
            label,
            signal,
            sample_every: probe.sample_every,
        });
    }

    model.validate()?;

    info!(
        "[BUILD] Model '{}' built: {} signals, {} operators, {} probes, {} inputs",
        model.label,
        model.signals.len(),
        model.operators.len(),
        model.probes.len(),
        model.inputs.len()
    );
    for op in &model.operators {
        debug!("[BUILD]   {}", op);
    }

    Ok(model)
}

fn build_node(model: &mut Model, id: NodeId, node: &crate::network::Node) -> ModelResult<NodeSignals> {
    if node.is_input() {
        let output = if node.size_out > 0 {
            let out = model.add_signal(
                Signal::zeros(format!("{}.out", node.label), &[node.size_out]).minibatched(true),
            );
            model.add_op(Operator::NodeInput { node: id, output: out });
            Some(out)
        } else {
            None
        };

        let source = match &node.output {
            NodeOutput::Constant(values) => {
                if values.len() != node.size_out {
                    return Err(ModelError::SizeMismatch {
                        context: format!("constant output of node '{}'", node.label),
                        expected: node.size_out,
                        actual: values.len(),
                    });
                }
                InputSource::Constant(values.clone())
            }
            NodeOutput::Function(func) => InputSource::Function(func.clone()),
            NodeOutput::Passthrough => {
                return Err(ModelError::InvalidParameter(format!(
                    "passthrough node '{}' needs size_in > 0",
                    node.label
                )))
            }
        };

        model.inputs.push(InputInfo {
            node: id,
            label: node.label.clone(),
            size_out: node.size_out,
            output,
            source,
        });
        return Ok(NodeSignals {
            input: None,
            output,
        });
    }

    let input = model.add_signal(
        Signal::zeros(format!("{}.in", node.label), &[node.size_in]).minibatched(true),
    );
    model.add_op(Operator::Reset { dst: input, value: 0.0 });

    let output = match &node.output {
        NodeOutput::Passthrough => Some(input),
        NodeOutput::Function(func) => {
            let output = if node.size_out > 0 {
                Some(model.add_signal(
                    Signal::zeros(format!("{}.out", node.label), &[node.size_out]).minibatched(true),
                ))
            } else {
                None
            };
            model.add_op(Operator::SimPyFunc {
                function: func.clone(),
                t: Some(model.time),
                x: Some(input),
                output,
            });
            output
        }
        NodeOutput::Constant(_) => {
            return Err(ModelError::InvalidParameter(format!(
                "constant node '{}' cannot have inputs",
                node.label
            )))
        }
    };

    Ok(NodeSignals {
        input: Some(input),
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Connection, Node, Population, Probe};
    use crate::neurons::NeuronType;
    use crate::operator::OpKind;

    fn count(model: &Model, kind: OpKind) -> usize {
        model.operators.iter().filter(|op| op.kind() == kind).count()
    }

    #[test]
    fn test_input_node_becomes_model_input() {
        let mut net = Network::new("inputs");
        let node = net.add_node(Node::constant("zero", vec![0.0]));
        net.add_probe(Probe::new(ProbeTarget::NodeOutput(node))).unwrap();

        let model = build(&net, 0.001, 0).unwrap();
        assert_eq!(model.inputs.len(), 1);
        assert_eq!(count(&model, OpKind::NodeInput), 1);
        assert_eq!(model.probes[0].signal, model.inputs[0].output.unwrap());
    }

    #[test]
    fn test_population_and_connection_ops() {
        let mut net = Network::new("ens");
        let stim = net.add_node(Node::constant("stim", vec![1.0, 2.0]));
        let pop = net.add_population(Population::new("pop", 2, NeuronType::lif()));
        net.connect(Connection::new(stim, pop)).unwrap();

        let model = build(&net, 0.001, 1).unwrap();

        // population input + connection weighted
        assert_eq!(count(&model, OpKind::Reset), 2);
        // bias copy + connection copy
        assert_eq!(count(&model, OpKind::Copy), 2);
        // gain + scalar transform
        assert_eq!(count(&model, OpKind::ElementwiseInc), 2);
        assert_eq!(count(&model, OpKind::SimNeurons), 1);
        assert_eq!(count(&model, OpKind::SimProcess), 1);

        let neurons = model
            .operators
            .iter()
            .find_map(|op| match op {
                Operator::SimNeurons { states, .. } => Some(states.len()),
                _ => None,
            })
            .unwrap();
        assert_eq!(neurons, 2);
    }

    #[test]
    fn test_trainable_flags() {
        let mut net = Network::new("train");
        let stim = net.add_node(Node::constant("stim", vec![1.0]));
        let pop = net.add_population(Population::new("pop", 1, NeuronType::rectified_linear()));
        let frozen = net.add_population(Population::new("frozen", 1, NeuronType::rectified_linear()).trainable(false));
        net.connect(Connection::new(stim, pop)).unwrap();
        net.connect(Connection::new(pop, frozen).trainable(false)).unwrap();

        let model = build(&net, 0.001, 0).unwrap();
        let trainable: Vec<&str> = model
            .signals
            .iter()
            .filter(|s| s.trainable)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(trainable, vec!["pop.bias", "conn0.weights"]);
    }

    #[test]
    fn test_probe_synapse_adds_filter() {
        let mut net = Network::new("probe");
        let stim = net.add_node(Node::constant("stim", vec![1.0]));
        net.add_probe(Probe::new(ProbeTarget::NodeOutput(stim)).with_synapse(0.01))
            .unwrap();

        let model = build(&net, 0.001, 0).unwrap();
        let filter = model
            .operators
            .iter()
            .find(|op| op.kind() == OpKind::SimProcess)
            .unwrap();
        assert_eq!(filter.sets(), vec![model.probes[0].signal]);
    }

    #[test]
    fn test_function_node_with_input() {
        let mut net = Network::new("func");
        let stim = net.add_node(Node::constant("stim", vec![1.0]));
        let square = net.add_node(Node::function("square", 1, 1, |_, x| vec![x[0] * x[0]]));
        net.connect(Connection::new(stim, square).with_synapse(None)).unwrap();

        let model = build(&net, 0.001, 0).unwrap();
        assert_eq!(count(&model, OpKind::SimPyFunc), 1);
        assert_eq!(count(&model, OpKind::SimProcess), 0);
    }

    #[test]
    fn test_invalid_dt() {
        let net = Network::new("empty");
        assert!(build(&net, 0.0, 0).is_err());
    }
}
