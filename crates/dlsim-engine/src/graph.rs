// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operator dependency graph
//!
//! Within a step each signal is set, then incremented, then read, then
//! updated. Two operators touching overlapping memory are ordered by the
//! phase in which they touch it.

use ahash::{AHashMap, AHashSet};
use std::collections::BTreeSet;

use dlsim_model::{Model, SignalId};

use crate::error::{Result, SimError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Set,
    Inc,
    Read,
    Update,
}

/// Directed acyclic graph over operator indices
#[derive(Debug, Clone, Default)]
pub struct OpGraph {
    pub successors: Vec<BTreeSet<usize>>,
    pub predecessors: Vec<BTreeSet<usize>>,
}

impl OpGraph {
    pub fn with_nodes(n: usize) -> Self {
        Self {
            successors: vec![BTreeSet::new(); n],
            predecessors: vec![BTreeSet::new(); n],
        }
    }

    pub fn len(&self) -> usize {
        self.successors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successors.is_empty()
    }

    pub fn add_edge(&mut self, from: usize, to: usize) {
        if from != to {
            self.successors[from].insert(to);
            self.predecessors[to].insert(from);
        }
    }

    pub fn n_edges(&self) -> usize {
        self.successors.iter().map(|s| s.len()).sum()
    }

    /// Kahn's algorithm, always taking the lowest ready index
    pub fn toposort(&self) -> Result<Vec<usize>> {
        let mut remaining: Vec<usize> = self.predecessors.iter().map(|p| p.len()).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &succ in &self.successors[node] {
                remaining[succ] -= 1;
                if remaining[succ] == 0 {
                    ready.insert(succ);
                }
            }
        }

        if order.len() != self.len() {
            return Err(SimError::Build(
                "Cycle detected during graph optimization".to_string(),
            ));
        }
        Ok(order)
    }

    /// `reach[v]` holds every node reachable from `v` through one or more edges
    pub fn transitive_closure(&self) -> Result<Vec<AHashSet<usize>>> {
        let order = self.toposort()?;
        let mut reach: Vec<AHashSet<usize>> = vec![AHashSet::new(); self.len()];
        for &node in order.iter().rev() {
            let mut set = AHashSet::new();
            for &succ in &self.successors[node] {
                set.insert(succ);
                set.extend(reach[succ].iter().copied());
            }
            reach[node] = set;
        }
        Ok(reach)
    }
}

/// Build the dependency graph of `model.operators`
///
/// Fails when two operators set the same memory, two operators update the
/// same memory, or one operator sets what another updates.
pub fn operator_dependency_graph(model: &Model) -> Result<OpGraph> {
    // accesses grouped by base signal: (op, phase, rows)
    let mut accesses: AHashMap<SignalId, Vec<(usize, Phase, Vec<usize>)>> = AHashMap::new();
    for (index, op) in model.operators.iter().enumerate() {
        let roles = [
            (Phase::Set, op.sets()),
            (Phase::Inc, op.incs()),
            (Phase::Read, op.reads()),
            (Phase::Update, op.updates()),
        ];
        for (phase, signals) in roles {
            for sig in signals {
                model.signal(sig)?;
                accesses
                    .entry(model.base_of(sig))
                    .or_default()
                    .push((index, phase, model.base_rows(sig)));
            }
        }
    }

    let mut graph = OpGraph::with_nodes(model.operators.len());
    let mut bases: Vec<&SignalId> = accesses.keys().collect();
    bases.sort();

    for base in bases {
        let entries = &accesses[base];
        for (i, (op_a, phase_a, rows_a)) in entries.iter().enumerate() {
            for (op_b, phase_b, rows_b) in entries.iter().skip(i + 1) {
                if op_a == op_b || !rows_a.iter().any(|r| rows_b.contains(r)) {
                    continue;
                }
                let conflict = match (phase_a, phase_b) {
                    (Phase::Set, Phase::Set) => Some("set by more than one operator"),
                    (Phase::Update, Phase::Update) => Some("updated by more than one operator"),
                    (Phase::Set, Phase::Update) | (Phase::Update, Phase::Set) => {
                        Some("both set and updated")
                    }
                    _ => None,
                };
                if let Some(reason) = conflict {
                    return Err(SimError::Build(format!(
                        "Signal {} ({}) is {}: {} and {}",
                        base,
                        model.signals[base.index()].name,
                        reason,
                        model.operators[*op_a],
                        model.operators[*op_b]
                    )));
                }
                if phase_a < phase_b {
                    graph.add_edge(*op_a, *op_b);
                } else if phase_b < phase_a {
                    graph.add_edge(*op_b, *op_a);
                }
            }
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlsim_model::{Operator, Signal};

    fn model_with(ops: impl FnOnce(&mut Model) -> Vec<Operator>) -> Model {
        let mut model = Model::new("graph", 0.001);
        let ops = ops(&mut model);
        for op in ops {
            model.add_op(op);
        }
        model
    }

    #[test]
    fn test_set_inc_read_order() {
        let model = model_with(|m| {
            let a = m.add_signal(Signal::zeros("a", &[2]));
            let b = m.add_signal(Signal::zeros("b", &[2]));
            let c = m.add_signal(Signal::zeros("c", &[2]));
            vec![
                // read b into c (op 1)
                Operator::Copy { src: b, dst: c, inc: false },
                // inc b (op 2)
                Operator::Copy { src: a, dst: b, inc: true },
                // set b (op 3)
                Operator::Reset { dst: b, value: 0.0 },
            ]
        });
        let graph = operator_dependency_graph(&model).unwrap();
        assert!(graph.successors[3].contains(&2));
        assert!(graph.successors[3].contains(&1));
        assert!(graph.successors[2].contains(&1));
        assert_eq!(graph.toposort().unwrap(), vec![0, 3, 2, 1]);
    }

    #[test]
    fn test_double_set_is_an_error() {
        let model = model_with(|m| {
            let a = m.add_signal(Signal::zeros("a", &[2]));
            vec![
                Operator::Reset { dst: a, value: 0.0 },
                Operator::Reset { dst: a, value: 1.0 },
            ]
        });
        assert!(matches!(operator_dependency_graph(&model), Err(SimError::Build(_))));
    }

    #[test]
    fn test_disjoint_views_do_not_depend() {
        let mut model = Model::new("views", 0.001);
        let base = model.add_signal(Signal::zeros("base", &[4]));
        let low = model.add_view("low", base, 0, 2, 1).unwrap();
        let high = model.add_view("high", base, 2, 2, 1).unwrap();
        let src = model.add_signal(Signal::zeros("src", &[2]));
        model.add_op(Operator::Reset { dst: low, value: 0.0 });
        model.add_op(Operator::Copy { src, dst: high, inc: false });
        model.add_op(Operator::Copy { src: low, dst: src, inc: false });

        let graph = operator_dependency_graph(&model).unwrap();
        // op 1 sets low, op 3 reads low
        assert!(graph.successors[1].contains(&3));
        // op 2 sets high, unrelated to low
        assert!(!graph.successors[1].contains(&2));
        assert!(!graph.successors[2].contains(&1));
    }

    #[test]
    fn test_transitive_closure() {
        let mut graph = OpGraph::with_nodes(4);
        graph.add_edge(0, 1);
        graph.add_edge(1, 2);
        let reach = graph.transitive_closure().unwrap();
        assert!(reach[0].contains(&2));
        assert!(!reach[2].contains(&0));
        assert!(reach[3].is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = OpGraph::with_nodes(2);
        graph.add_edge(0, 1);
        graph.add_edge(1, 0);
        assert!(graph.toposort().is_err());
    }
}
