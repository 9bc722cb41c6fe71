// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! User-facing network description
//!
//! A [`Network`] holds nodes (external inputs and host functions), neuron
//! populations, the connections between them and the probes that record
//! their values. [`crate::build`] lowers it into a [`crate::Model`].

use ndarray::Array2;
use rand::Rng;
use std::fmt;
use std::sync::Arc;

use crate::error::{ModelError, ModelResult};
use crate::ids::{ConnectionId, NodeId, PopulationId, ProbeId};
use crate::neurons::NeuronType;

/// Default time constant for connection synapses (seconds)
pub const DEFAULT_SYNAPSE_TAU: f64 = 0.005;

type NodeFn = dyn Fn(f64, &[f64]) -> Vec<f64> + Send + Sync;

/// Host function evaluated by a node: `f(t, x) -> output`
#[derive(Clone)]
pub struct NodeFunction {
    name: String,
    func: Arc<NodeFn>,
}

impl NodeFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(f64, &[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn call(&self, t: f64, x: &[f64]) -> Vec<f64> {
        (self.func)(t, x)
    }
}

impl fmt::Debug for NodeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeFunction({})", self.name)
    }
}

/// What a node outputs each step
#[derive(Debug, Clone)]
pub enum NodeOutput {
    Constant(Vec<f64>),
    Function(NodeFunction),
    /// Output equals the summed input
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub label: String,
    pub size_in: usize,
    pub size_out: usize,
    pub output: NodeOutput,
}

impl Node {
    /// Node emitting the same values every step
    pub fn constant(label: impl Into<String>, values: impl Into<Vec<f64>>) -> Self {
        let values = values.into();
        Self {
            label: label.into(),
            size_in: 0,
            size_out: values.len(),
            output: NodeOutput::Constant(values),
        }
    }

    /// Node computing `f(t, x)`; with `size_in == 0` the node is an input
    pub fn function<F>(label: impl Into<String>, size_in: usize, size_out: usize, func: F) -> Self
    where
        F: Fn(f64, &[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        let label = label.into();
        Self {
            output: NodeOutput::Function(NodeFunction::new(label.clone(), func)),
            label,
            size_in,
            size_out,
        }
    }

    /// Input node whose output only depends on time
    pub fn time_function<F>(label: impl Into<String>, size_out: usize, func: F) -> Self
    where
        F: Fn(f64) -> Vec<f64> + Send + Sync + 'static,
    {
        Self::function(label, 0, size_out, move |t, _| func(t))
    }

    pub fn passthrough(label: impl Into<String>, size: usize) -> Self {
        Self {
            label: label.into(),
            size_in: size,
            size_out: size,
            output: NodeOutput::Passthrough,
        }
    }

    /// Nodes without inputs are fed from outside the simulated graph
    pub fn is_input(&self) -> bool {
        self.size_in == 0
    }
}

/// Initial values for per-neuron parameters
#[derive(Debug, Clone, PartialEq)]
pub enum ParamInit {
    Constant(f64),
    Values(Vec<f64>),
    Uniform { low: f64, high: f64 },
}

impl ParamInit {
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> ModelResult<Vec<f64>> {
        match self {
            ParamInit::Constant(value) => Ok(vec![*value; n]),
            ParamInit::Values(values) => {
                if values.len() != n {
                    return Err(ModelError::SizeMismatch {
                        context: "parameter values".to_string(),
                        expected: n,
                        actual: values.len(),
                    });
                }
                Ok(values.clone())
            }
            ParamInit::Uniform { low, high } => {
                if !(low < high) {
                    return Err(ModelError::InvalidParameter(format!(
                        "uniform range [{}, {}) is empty",
                        low, high
                    )));
                }
                Ok((0..n).map(|_| rng.gen_range(*low..*high)).collect())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Population {
    pub label: String,
    pub n_neurons: usize,
    pub neuron_type: NeuronType,
    pub gain: ParamInit,
    pub bias: ParamInit,
    /// `None` follows the network default
    pub trainable: Option<bool>,
}

impl Population {
    pub fn new(label: impl Into<String>, n_neurons: usize, neuron_type: NeuronType) -> Self {
        Self {
            label: label.into(),
            n_neurons,
            neuron_type,
            gain: ParamInit::Constant(1.0),
            bias: ParamInit::Constant(0.0),
            trainable: None,
        }
    }

    pub fn with_gain(mut self, gain: ParamInit) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_bias(mut self, bias: ParamInit) -> Self {
        self.bias = bias;
        self
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = Some(trainable);
        self
    }
}

/// Either side of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Node(NodeId),
    /// Neuron outputs as a source, input current as a target
    Neurons(PopulationId),
}

impl From<NodeId> for Endpoint {
    fn from(id: NodeId) -> Self {
        Endpoint::Node(id)
    }
}

impl From<PopulationId> for Endpoint {
    fn from(id: PopulationId) -> Self {
        Endpoint::Neurons(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Elementwise scaling; requires equal pre/post sizes
    Scalar(f64),
    /// Dense `(size_post, size_pre)` weights
    Matrix(Array2<f64>),
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub label: String,
    pub pre: Endpoint,
    pub post: Endpoint,
    pub transform: Transform,
    /// Lowpass time constant; `None` passes values through without delay
    pub synapse: Option<f64>,
    pub trainable: Option<bool>,
}

impl Connection {
    pub fn new(pre: impl Into<Endpoint>, post: impl Into<Endpoint>) -> Self {
        Self {
            label: String::new(),
            pre: pre.into(),
            post: post.into(),
            transform: Transform::Scalar(1.0),
            synapse: Some(DEFAULT_SYNAPSE_TAU),
            trainable: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_synapse(mut self, synapse: Option<f64>) -> Self {
        self.synapse = synapse;
        self
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = Some(trainable);
        self
    }
}

/// What a probe records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeTarget {
    NodeOutput(NodeId),
    NeuronOutput(PopulationId),
    /// Total input current `J` after gain and bias
    NeuronInput(PopulationId),
    ConnectionWeights(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct Probe {
    pub label: String,
    pub target: ProbeTarget,
    /// Recording period in seconds; `None` records every step
    pub sample_every: Option<f64>,
    pub synapse: Option<f64>,
}

impl Probe {
    pub fn new(target: ProbeTarget) -> Self {
        Self {
            label: String::new(),
            target,
            sample_every: None,
            synapse: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn sample_every(mut self, period: f64) -> Self {
        self.sample_every = Some(period);
        self
    }

    pub fn with_synapse(mut self, tau: f64) -> Self {
        self.synapse = Some(tau);
        self
    }
}

/// Container for everything that gets simulated
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub label: String,
    pub seed: Option<u64>,
    trainable_default: Option<bool>,
    nodes: Vec<Node>,
    populations: Vec<Population>,
    connections: Vec<Connection>,
    probes: Vec<Probe>,
}

impl Network {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set whether objects without an explicit `trainable` flag are trained
    ///
    /// `None` restores the default (trainable).
    pub fn configure_trainable(&mut self, default: Option<bool>) {
        self.trainable_default = default;
    }

    pub fn is_trainable(&self, explicit: Option<bool>) -> bool {
        explicit.or(self.trainable_default).unwrap_or(true)
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn add_population(&mut self, population: Population) -> PopulationId {
        self.populations.push(population);
        PopulationId(self.populations.len() - 1)
    }

    /// Add a connection after checking both endpoints and the transform shape
    pub fn connect(&mut self, connection: Connection) -> ModelResult<ConnectionId> {
        let size_pre = self.source_size(connection.pre)?;
        let size_post = self.target_size(connection.post)?;

        match &connection.transform {
            Transform::Scalar(_) => {
                if size_pre != size_post {
                    return Err(ModelError::SizeMismatch {
                        context: format!("scalar transform into {:?}", connection.post),
                        expected: size_pre,
                        actual: size_post,
                    });
                }
            }
            Transform::Matrix(weights) => {
                if weights.dim() != (size_post, size_pre) {
                    return Err(ModelError::InvalidParameter(format!(
                        "transform shape {:?} does not match (post={}, pre={})",
                        weights.dim(),
                        size_post,
                        size_pre
                    )));
                }
            }
        }
        if let Some(tau) = connection.synapse {
            check_tau(tau)?;
        }

        self.connections.push(connection);
        Ok(ConnectionId(self.connections.len() - 1))
    }

    pub fn add_probe(&mut self, probe: Probe) -> ModelResult<ProbeId> {
        match probe.target {
            ProbeTarget::NodeOutput(id) => {
                self.node(id)?;
            }
            ProbeTarget::NeuronOutput(id) | ProbeTarget::NeuronInput(id) => {
                self.population(id)?;
            }
            ProbeTarget::ConnectionWeights(id) => {
                self.connection(id)?;
            }
        }
        if let Some(period) = probe.sample_every {
            if !(period > 0.0) {
                return Err(ModelError::InvalidParameter(format!(
                    "sample_every must be > 0 (got {})",
                    period
                )));
            }
        }
        if let Some(tau) = probe.synapse {
            check_tau(tau)?;
        }
        self.probes.push(probe);
        Ok(ProbeId(self.probes.len() - 1))
    }

    pub fn node(&self, id: NodeId) -> ModelResult<&Node> {
        self.nodes.get(id.0).ok_or(ModelError::UnknownNode(id))
    }

    pub fn population(&self, id: PopulationId) -> ModelResult<&Population> {
        self.populations
            .get(id.0)
            .ok_or(ModelError::UnknownPopulation(id))
    }

    pub fn connection(&self, id: ConnectionId) -> ModelResult<&Connection> {
        self.connections
            .get(id.0)
            .ok_or(ModelError::UnknownConnection(id))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn populations(&self) -> &[Population] {
        &self.populations
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    /// Width of the values an endpoint emits
    pub fn source_size(&self, endpoint: Endpoint) -> ModelResult<usize> {
        match endpoint {
            Endpoint::Node(id) => Ok(self.node(id)?.size_out),
            Endpoint::Neurons(id) => Ok(self.population(id)?.n_neurons),
        }
    }

    /// Width of the values an endpoint accepts
    pub fn target_size(&self, endpoint: Endpoint) -> ModelResult<usize> {
        match endpoint {
            Endpoint::Node(id) => {
                let node = self.node(id)?;
                if node.is_input() {
                    return Err(ModelError::InvalidTarget(format!(
                        "node '{}' (size_in = 0)",
                        node.label
                    )));
                }
                Ok(node.size_in)
            }
            Endpoint::Neurons(id) => Ok(self.population(id)?.n_neurons),
        }
    }
}

fn check_tau(tau: f64) -> ModelResult<()> {
    if tau > 0.0 && tau.is_finite() {
        Ok(())
    } else {
        Err(ModelError::InvalidParameter(format!(
            "synapse time constant must be > 0 (got {})",
            tau
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_scalar_transform_requires_matching_sizes() {
        let mut net = Network::new("test");
        let a = net.add_node(Node::constant("a", vec![0.0, 0.0]));
        let b = net.add_node(Node::passthrough("b", 3));

        let result = net.connect(Connection::new(a, b));
        assert!(matches!(result, Err(ModelError::SizeMismatch { .. })));
    }

    #[test]
    fn test_matrix_transform_shape_checked() {
        let mut net = Network::new("test");
        let a = net.add_node(Node::constant("a", vec![0.0, 0.0]));
        let pop = net.add_population(Population::new("pop", 3, NeuronType::rectified_linear()));

        let good = Connection::new(a, pop).with_transform(Transform::Matrix(Array2::zeros((3, 2))));
        assert!(net.connect(good).is_ok());

        let bad = Connection::new(a, pop).with_transform(Transform::Matrix(array![[1.0, 2.0]]));
        assert!(net.connect(bad).is_err());
    }

    #[test]
    fn test_cannot_connect_into_input_node() {
        let mut net = Network::new("test");
        let a = net.add_node(Node::constant("a", vec![0.0]));
        let b = net.add_node(Node::constant("b", vec![0.0]));
        assert!(matches!(
            net.connect(Connection::new(a, b)),
            Err(ModelError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_trainable_default() {
        let mut net = Network::new("test");
        assert!(net.is_trainable(None));
        net.configure_trainable(Some(false));
        assert!(!net.is_trainable(None));
        assert!(net.is_trainable(Some(true)));
    }

    #[test]
    fn test_probe_validation() {
        let mut net = Network::new("test");
        let a = net.add_node(Node::constant("a", vec![0.0]));
        assert!(net.add_probe(Probe::new(ProbeTarget::NodeOutput(a))).is_ok());
        assert!(net
            .add_probe(Probe::new(ProbeTarget::NodeOutput(NodeId(7))))
            .is_err());
        assert!(net
            .add_probe(Probe::new(ProbeTarget::NodeOutput(a)).sample_every(0.0))
            .is_err());
    }

    #[test]
    fn test_param_init_uniform_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let values = ParamInit::Uniform { low: -1.0, high: 1.0 }
            .sample(100, &mut rng)
            .unwrap();
        assert_eq!(values.len(), 100);
        assert!(values.iter().all(|v| (-1.0..1.0).contains(v)));
        assert!(ParamInit::Values(vec![1.0]).sample(2, &mut rng).is_err());
    }
}
