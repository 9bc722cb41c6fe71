// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Execution planners
//!
//! A plan is a sequence of operator groups. Every group holds operators
//! that can run as one batched computation, and every operator appears
//! after all of its dependencies.

use ahash::AHashMap;
use std::collections::BTreeSet;
use tracing::debug;

use dlsim_config::PlannerKind;
use dlsim_model::{Model, OpId, OpKind, Operator};

use crate::error::{Result, SimError};
use crate::graph::{operator_dependency_graph, OpGraph};

pub type Plan = Vec<Vec<OpId>>;

/// Check if `op` can join `group` as part of a single batched computation
///
/// Only the first member is compared; every member already matches it.
pub fn mergeable(model: &Model, op: OpId, group: &[OpId]) -> bool {
    let Some(first) = group.first() else {
        return true;
    };
    let a = &model.operators[op.index()];
    let c = &model.operators[first.index()];

    if a.kind() != c.kind() || a.kind() == OpKind::TimeUpdate {
        return false;
    }
    if a.sets().len() != c.sets().len()
        || a.incs().len() != c.incs().len()
        || a.reads().len() != c.reads().len()
        || a.updates().len() != c.updates().len()
    {
        return false;
    }

    let sigs_a = a.all_signals();
    let sigs_c = c.all_signals();
    for (s0, s1) in sigs_a.iter().zip(sigs_c.iter()) {
        let (Ok(sig0), Ok(sig1)) = (model.signal(*s0), model.signal(*s1)) else {
            return false;
        };
        let (Ok(base0), Ok(base1)) = (model.signal(model.base_of(*s0)), model.signal(model.base_of(*s1)))
        else {
            return false;
        };
        if base0.trailing_shape() != base1.trailing_shape()
            || sig0.trailing_shape() != sig1.trailing_shape()
            || sig0.trainable != sig1.trainable
            || sig0.minibatched != sig1.minibatched
        {
            return false;
        }
    }

    match (a, c) {
        (Operator::Copy { inc: inc_a, .. }, Operator::Copy { inc: inc_c, .. }) => inc_a == inc_c,
        (Operator::ElementwiseInc { .. }, Operator::ElementwiseInc { .. }) => {
            sigs_a.iter().zip(sigs_c.iter()).all(|(s0, s1)| {
                match (model.signal(*s0), model.signal(*s1)) {
                    (Ok(x), Ok(y)) => x.rows() == y.rows(),
                    _ => false,
                }
            })
        }
        (Operator::SimPyFunc { t: t_a, .. }, Operator::SimPyFunc { t: t_c, .. }) => {
            t_a.is_some() == t_c.is_some()
        }
        (
            Operator::SimNeurons { neuron_type: n_a, .. },
            Operator::SimNeurons { neuron_type: n_c, .. },
        ) => n_a.same_kind(n_c),
        (Operator::SimProcess { mode: m_a, .. }, Operator::SimProcess { mode: m_c, .. }) => m_a == m_c,
        _ => true,
    }
}

/// Put `op` into the first group it can join, or start a new group
fn add_to_groups(model: &Model, groups: &mut Vec<Vec<OpId>>, op: OpId) {
    for group in groups.iter_mut() {
        if mergeable(model, op, group) {
            group.push(op);
            return;
        }
    }
    groups.push(vec![op]);
}

/// Repeatedly schedule the largest group of available, mergeable operators
pub fn greedy_planner(model: &Model, graph: &OpGraph) -> Result<Plan> {
    let mut remaining_preds: Vec<usize> = graph.predecessors.iter().map(|p| p.len()).collect();
    let mut available: Vec<OpId> = (0..graph.len())
        .filter(|&i| remaining_preds[i] == 0)
        .map(OpId)
        .collect();

    let mut plan = Plan::new();
    let mut groups: Vec<Vec<OpId>> = Vec::new();
    let mut scheduled = 0;

    while scheduled < graph.len() {
        for op in available.drain(..) {
            add_to_groups(model, &mut groups, op);
        }

        // stable sort; ties go to the most recently formed group
        groups.sort_by_key(|g| g.len());
        let Some(chosen) = groups.pop() else {
            return Err(SimError::Build(
                "Cycle detected during graph optimization".to_string(),
            ));
        };

        for op in &chosen {
            for &succ in &graph.successors[op.index()] {
                remaining_preds[succ] -= 1;
                if remaining_preds[succ] == 0 {
                    available.push(OpId(succ));
                }
            }
        }
        scheduled += chosen.len();
        plan.push(chosen);
    }

    debug!("[PLAN] greedy plan: {} groups for {} operators", plan.len(), graph.len());
    Ok(plan)
}

/// Exhaustive search for the shortest plan
///
/// Memoised over the set of unscheduled operators; the cost still grows
/// quickly with the number of independent branches, so this is only
/// practical for small models.
pub fn tree_planner(model: &Model, graph: &OpGraph) -> Result<Plan> {
    fn shortest(
        model: &Model,
        graph: &OpGraph,
        ops: BTreeSet<usize>,
        cache: &mut AHashMap<Vec<usize>, Plan>,
    ) -> Result<Plan> {
        if ops.len() <= 1 {
            return Ok(ops.into_iter().map(|op| vec![OpId(op)]).collect());
        }
        let key: Vec<usize> = ops.iter().copied().collect();
        if let Some(plan) = cache.get(&key) {
            return Ok(plan.clone());
        }

        let free = ops
            .iter()
            .copied()
            .filter(|&op| graph.predecessors[op].iter().all(|p| !ops.contains(p)));
        let mut available: Vec<Vec<OpId>> = Vec::new();
        for op in free {
            add_to_groups(model, &mut available, OpId(op));
        }
        if available.is_empty() {
            return Err(SimError::Build(
                "Cycle detected during graph optimization".to_string(),
            ));
        }

        let mut best: Option<Plan> = None;
        for group in available {
            let rest: BTreeSet<usize> = ops
                .iter()
                .copied()
                .filter(|op| !group.contains(&OpId(*op)))
                .collect();
            let tail = shortest(model, graph, rest, cache)?;
            if best.as_ref().map_or(true, |b| tail.len() + 1 < b.len()) {
                let mut plan = Vec::with_capacity(tail.len() + 1);
                plan.push(group);
                plan.extend(tail);
                best = Some(plan);
            }
        }

        let best = best.unwrap_or_default();
        cache.insert(key, best.clone());
        Ok(best)
    }

    let mut cache = AHashMap::new();
    let plan = shortest(model, graph, (0..graph.len()).collect(), &mut cache)?;
    debug!(
        "[PLAN] tree plan: {} groups for {} operators ({} cached states)",
        plan.len(),
        graph.len(),
        cache.len()
    );
    Ok(plan)
}

/// Valid execution order without any merging
pub fn noop_planner(_model: &Model, graph: &OpGraph) -> Result<Plan> {
    let plan: Plan = graph.toposort()?.into_iter().map(|op| vec![OpId(op)]).collect();
    debug!("[PLAN] noop plan: {} operators", plan.len());
    Ok(plan)
}

/// Merge operators that have no path between them in the dependency graph
///
/// Operators are taken from the end of the list. Each one collects every
/// remaining mergeable operator that is neither an ancestor nor a
/// descendant of any member; the group is then contracted into a single
/// node before the next operator is chosen.
pub fn transitive_planner(model: &Model, graph: &OpGraph) -> Result<Plan> {
    let n = graph.len();
    // node of the contracted graph that holds each operator
    let mut node_of: Vec<usize> = (0..n).collect();
    let mut members: Vec<Vec<OpId>> = (0..n).map(|i| vec![OpId(i)]).collect();
    let mut contracted = graph.clone();
    let mut remaining: Vec<usize> = (0..n).collect();

    while let Some(op) = remaining.pop() {
        let reach = contracted.transitive_closure()?;
        let node = node_of[op];
        let mut group = vec![OpId(op)];

        for &other in &remaining {
            if !mergeable(model, OpId(other), &group) {
                continue;
            }
            let independent = group.iter().all(|member| {
                let a = node_of[member.index()];
                let b = node_of[other];
                !reach[a].contains(&b) && !reach[b].contains(&a)
            });
            if independent {
                group.push(OpId(other));
            }
        }

        remaining.retain(|r| !group.contains(&OpId(*r)));

        for member in group.iter().skip(1) {
            let absorbed = node_of[member.index()];
            let succs: Vec<usize> = contracted.successors[absorbed].iter().copied().collect();
            let preds: Vec<usize> = contracted.predecessors[absorbed].iter().copied().collect();
            for s in succs {
                contracted.predecessors[s].remove(&absorbed);
                contracted.add_edge(node, s);
            }
            for p in preds {
                contracted.successors[p].remove(&absorbed);
                contracted.add_edge(p, node);
            }
            contracted.successors[absorbed].clear();
            contracted.predecessors[absorbed].clear();
            node_of[member.index()] = node;
            members[absorbed].clear();
        }
        members[node] = group;
    }

    let plan: Plan = contracted
        .toposort()?
        .into_iter()
        .filter_map(|node| Some(std::mem::take(&mut members[node])).filter(|group| !group.is_empty()))
        .collect();

    debug!("[PLAN] transitive plan: {} groups for {} operators", plan.len(), n);
    Ok(plan)
}

/// Check that `plan` schedules every operator once, after its dependencies,
/// with only mergeable operators grouped together
pub fn validate_plan(model: &Model, graph: &OpGraph, plan: &Plan) -> Result<()> {
    let mut position = vec![usize::MAX; graph.len()];
    for (index, group) in plan.iter().enumerate() {
        for (k, op) in group.iter().enumerate() {
            let slot = position.get_mut(op.index()).ok_or_else(|| {
                SimError::Build(format!("plan references unknown operator {}", op))
            })?;
            if *slot != usize::MAX {
                return Err(SimError::Build(format!("operator {} scheduled twice", op)));
            }
            *slot = index;
            if !mergeable(model, *op, &group[..k.min(1)]) {
                return Err(SimError::Build(format!(
                    "operator {} cannot be merged into group {}",
                    op, index
                )));
            }
        }
    }
    for (op, &pos) in position.iter().enumerate() {
        if pos == usize::MAX {
            return Err(SimError::Build(format!("operator op{} missing from plan", op)));
        }
        for &pred in &graph.predecessors[op] {
            if position[pred] >= pos {
                return Err(SimError::Build(format!(
                    "operator op{} scheduled before its dependency op{}",
                    op, pred
                )));
            }
        }
    }
    Ok(())
}

/// Build the dependency graph and run the selected planner
pub fn plan_operators(model: &Model, kind: PlannerKind) -> Result<(OpGraph, Plan)> {
    let graph = operator_dependency_graph(model)?;
    let plan = match kind {
        PlannerKind::Greedy => greedy_planner(model, &graph)?,
        PlannerKind::Tree => tree_planner(model, &graph)?,
        PlannerKind::Noop => noop_planner(model, &graph)?,
        PlannerKind::Transitive => transitive_planner(model, &graph)?,
    };
    validate_plan(model, &graph, &plan)?;
    Ok((graph, plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlsim_model::{build, Connection, Network, NeuronType, Node, Population, Signal};

    /// Three independent resets plus a copy reading all of them
    fn fan_in() -> Model {
        let mut model = Model::new("fan_in", 0.001);
        let sigs: Vec<_> = (0..3)
            .map(|i| model.add_signal(Signal::zeros(format!("s{}", i), &[2])))
            .collect();
        let out = model.add_signal(Signal::zeros("out", &[2]));
        for &s in &sigs {
            model.add_op(Operator::Reset { dst: s, value: 1.0 });
        }
        for &s in &sigs {
            model.add_op(Operator::Copy { src: s, dst: out, inc: true });
        }
        model
    }

    fn layered_network() -> Model {
        let mut net = Network::new("layers");
        let stim = net.add_node(Node::constant("stim", vec![1.0, 0.5]));
        let mut prev = None;
        for i in 0..2 {
            let pop = net.add_population(Population::new(format!("p{}", i), 2, NeuronType::rectified_linear()));
            match prev {
                None => net.connect(Connection::new(stim, pop)).unwrap(),
                Some(p) => net.connect(Connection::new(p, pop)).unwrap(),
            };
            prev = Some(pop);
        }
        build(&net, 0.001, 0).unwrap()
    }

    #[test]
    fn test_mergeable_rules() {
        let model = fan_in();
        // resets of same-shaped signals merge
        assert!(mergeable(&model, OpId(1), &[OpId(2)]));
        // incrementing copies merge
        assert!(mergeable(&model, OpId(4), &[OpId(5)]));
        // different kinds never merge
        assert!(!mergeable(&model, OpId(1), &[OpId(4)]));
        // time update never merges
        assert!(!mergeable(&model, OpId(0), &[OpId(0)]));
        assert!(mergeable(&model, OpId(0), &[]));
    }

    #[test]
    fn test_greedy_merges_independent_ops() {
        let model = fan_in();
        let graph = operator_dependency_graph(&model).unwrap();
        let plan = greedy_planner(&model, &graph).unwrap();
        validate_plan(&model, &graph, &plan).unwrap();
        // resets, copies and the time update
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().any(|g| g.len() == 3 && model.operators[g[0].index()].kind() == OpKind::Reset));
    }

    #[test]
    fn test_all_planners_produce_valid_plans() {
        let model = layered_network();
        let graph = operator_dependency_graph(&model).unwrap();
        let noop = noop_planner(&model, &graph).unwrap();
        assert_eq!(noop.len(), model.operators.len());
        for kind in [
            PlannerKind::Greedy,
            PlannerKind::Tree,
            PlannerKind::Noop,
            PlannerKind::Transitive,
        ] {
            let (_, plan) = plan_operators(&model, kind).unwrap();
            assert!(plan.len() <= noop.len(), "{} plan longer than noop", kind);
        }
    }

    #[test]
    fn test_tree_no_longer_than_greedy() {
        let model = layered_network();
        let graph = operator_dependency_graph(&model).unwrap();
        let greedy = greedy_planner(&model, &graph).unwrap();
        let tree = tree_planner(&model, &graph).unwrap();
        assert!(tree.len() <= greedy.len());
    }

    #[test]
    fn test_transitive_does_not_merge_dependent_ops() {
        let mut model = Model::new("chain", 0.001);
        let a = model.add_signal(Signal::zeros("a", &[2]));
        let b = model.add_signal(Signal::zeros("b", &[2]));
        let c = model.add_signal(Signal::zeros("c", &[2]));
        model.add_op(Operator::Copy { src: a, dst: b, inc: false });
        model.add_op(Operator::Copy { src: b, dst: c, inc: false });

        let graph = operator_dependency_graph(&model).unwrap();
        let plan = transitive_planner(&model, &graph).unwrap();
        validate_plan(&model, &graph, &plan).unwrap();
        assert!(plan.iter().all(|g| g.len() == 1));
    }

    #[test]
    fn test_validate_rejects_bad_order() {
        let model = fan_in();
        let graph = operator_dependency_graph(&model).unwrap();
        let mut plan = noop_planner(&model, &graph).unwrap();
        plan.reverse();
        assert!(validate_plan(&model, &graph, &plan).is_err());
        plan.pop();
        plan.reverse();
        assert!(validate_plan(&model, &graph, &plan).is_err());
    }
}
