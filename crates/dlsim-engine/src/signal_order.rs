// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Memory ordering of base signals
//!
//! The k-th input of every operator in a group forms a "read block". Base
//! signals are arranged so that each read block is as contiguous as
//! possible, giving priority to large, frequently read blocks; operators
//! inside each group are then reordered to follow the signal order.

use ahash::AHashMap;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use dlsim_model::{Model, OpId, Operator, SignalId};

use crate::planner::Plan;

type Block = BTreeSet<usize>;

/// Every signal an operator consumes, including state it reads implicitly
fn op_reads(op: &Operator) -> Vec<SignalId> {
    let mut reads = op.reads();
    match op {
        Operator::SimNeurons { states, .. } => reads.extend(states.iter().copied()),
        Operator::SimProcess { .. } => reads.extend(op.updates()),
        _ => {}
    }
    reads
}

/// Unique bases of every signal touched by the plan, in id order
fn plan_bases(model: &Model, plan: &Plan) -> Vec<SignalId> {
    let bases: BTreeSet<SignalId> = plan
        .iter()
        .flatten()
        .flat_map(|op| model.operators[op.index()].all_signals())
        .map(|sig| model.base_of(sig))
        .collect();
    bases.into_iter().collect()
}

/// Base signals in id order and the plan unchanged
pub fn noop_order_signals(model: &Model, plan: &Plan) -> (Vec<SignalId>, Plan) {
    (plan_bases(model, plan), plan.clone())
}

/// Arrange base signals so operator reads form contiguous blocks
///
/// Returns the signals in memory order and the plan with operators
/// reordered inside each group.
pub fn order_signals(model: &Model, plan: &Plan, n_passes: usize) -> (Vec<SignalId>, Plan) {
    let all_signals = plan_bases(model, plan);

    let reads: AHashMap<OpId, Vec<SignalId>> = plan
        .iter()
        .flatten()
        .map(|op| (*op, op_reads(&model.operators[op.index()])))
        .collect();

    // (group, input index) -> bases read by the group at that input
    let mut read_blocks: Vec<((usize, usize), BTreeSet<SignalId>)> = Vec::new();
    for (g, ops) in plan.iter().enumerate() {
        let n_inputs = reads[&ops[0]].len();
        for i in 0..n_inputs {
            let block = ops.iter().map(|op| model.base_of(reads[op][i])).collect();
            read_blocks.push(((g, i), block));
        }
    }
    if read_blocks.is_empty() {
        return (all_signals, plan.clone());
    }

    // unique blocks with their duplicate counts, largest impact first
    let mut unique: Vec<(BTreeSet<SignalId>, usize)> = Vec::new();
    for (_, block) in &read_blocks {
        match unique.iter_mut().find(|(b, _)| b == block) {
            Some((_, count)) => *count += 1,
            None => unique.push((block.clone(), 1)),
        }
    }
    let block_weight = |(block, count): &(BTreeSet<SignalId>, usize)| {
        let size: usize = block.iter().map(|s| model.signals[s.index()].size()).sum();
        size * count
    };
    unique.sort_by_key(|b| block_weight(b));
    unique.reverse();
    let sorted_blocks: Vec<BTreeSet<SignalId>> = unique.into_iter().map(|(b, _)| b).collect();

    let mut signal_blocks: BTreeMap<SignalId, Block> = BTreeMap::new();
    for (i, block) in sorted_blocks.iter().enumerate() {
        for sig in block {
            signal_blocks.entry(*sig).or_default().insert(i);
        }
    }

    let block_index = |block: &BTreeSet<SignalId>| {
        sorted_blocks.iter().position(|b| b == block).unwrap_or(0)
    };
    // smallest blocks first, so the largest ones settle last
    let mut sorted_reads: Vec<((usize, usize), usize)> = read_blocks
        .iter()
        .map(|(key, block)| (*key, block_index(block)))
        .collect();
    sorted_reads.sort_by_key(|(_, index)| std::cmp::Reverse(*index));
    let sorted_reads: Vec<(usize, usize)> = sorted_reads.into_iter().map(|(key, _)| key).collect();

    let sort_idxs = hamming_sort(&signal_blocks);
    let mut all_signals = all_signals;
    all_signals.sort_by_key(|s| sort_idxs.get(s).copied().unwrap_or(-1));
    debug!(
        "[ORDER] {} signals in {} read blocks ({} unique)",
        all_signals.len(),
        read_blocks.len(),
        sorted_blocks.len()
    );

    let mut new_plan = plan.clone();
    let mut sig_idxs: AHashMap<SignalId, usize> =
        all_signals.iter().enumerate().map(|(i, s)| (*s, i)).collect();

    let ctx = SortContext {
        model,
        sorted_reads: &sorted_reads,
        signal_blocks: &signal_blocks,
        reads: &reads,
    };
    for pass in 0..n_passes {
        let prev_plan = new_plan.clone();
        let prev_idxs = sig_idxs.clone();

        ctx.sort_ops_by_signals(&all_signals, &mut sig_idxs, &mut new_plan);

        if new_plan == prev_plan && sig_idxs == prev_idxs {
            trace!("[ORDER] early termination after {} passes", pass + 1);
            break;
        }
    }

    let mut sorted_signals = all_signals;
    sorted_signals.sort_by_key(|s| sig_idxs[s]);
    (sorted_signals, new_plan)
}

/// Order the unique block memberships so that consecutive signals share
/// as many blocks as possible
///
/// Returns the sort position of each signal's membership set. Blocks are
/// numbered from largest to smallest, so lower numbers take priority.
pub fn hamming_sort(blocks: &BTreeMap<SignalId, Block>) -> AHashMap<SignalId, i64> {
    let mut unique: BTreeSet<Block> = blocks.values().cloned().collect();
    let n_unique = unique.len();
    let mut sorted_blocks: Vec<Block> = Vec::with_capacity(n_unique);
    let mut curr: Option<Block> = None;
    let mut active: Option<usize> = None;

    loop {
        let current = match curr.take() {
            None => Block::from([0]),
            Some(block) => {
                unique.remove(&block);
                sorted_blocks.push(block.clone());
                block
            }
        };
        if sorted_blocks.len() == n_unique {
            break;
        }

        let active_block = *active.get_or_insert_with(|| current.iter().next().copied().unwrap_or(0));
        let mut next: Vec<&Block> = unique.iter().filter(|b| b.contains(&active_block)).collect();
        if next.is_empty() {
            next = unique.iter().collect();
            active = None;
        }

        // smallest symmetric difference with the current block
        let dist = |b: &Block| current.symmetric_difference(b).count();
        let min_dist = next.iter().map(|b| dist(b)).min().unwrap_or(0);
        next.retain(|b| dist(b) == min_dist);

        // prefer candidates that keep the largest blocks going
        for i in &current {
            if next.len() == 1 {
                break;
            }
            if next.iter().any(|b| b.contains(i)) {
                next.retain(|b| b.contains(i));
            }
        }

        curr = next.into_iter().min().cloned();
        if curr.is_none() {
            break;
        }
    }

    let positions: AHashMap<&Block, i64> = sorted_blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b, i as i64))
        .collect();
    blocks
        .iter()
        .map(|(sig, block)| (*sig, positions.get(block).copied().unwrap_or(-1)))
        .collect()
}

struct SortContext<'a> {
    model: &'a Model,
    sorted_reads: &'a [(usize, usize)],
    signal_blocks: &'a BTreeMap<SignalId, Block>,
    reads: &'a AHashMap<OpId, Vec<SignalId>>,
}

impl SortContext<'_> {
    fn read(&self, op: OpId, input: usize) -> SignalId {
        self.reads[&op][input]
    }

    fn view_offset(&self, sig: SignalId) -> usize {
        self.model.signals[sig.index()].view.map_or(0, |v| v.offset)
    }

    /// Reorder each group's operators to follow the current signal order,
    /// then pull the group's read signals into that operator order
    fn sort_ops_by_signals(
        &self,
        sigs: &[SignalId],
        sig_idxs: &mut AHashMap<SignalId, usize>,
        plan: &mut Plan,
    ) {
        for &(group, input) in self.sorted_reads {
            if plan[group].len() == 1 {
                continue;
            }
            let mut ops = plan[group].clone();
            ops.sort_by_key(|op| {
                let sig = self.read(*op, input);
                (sig_idxs[&self.model.base_of(sig)], self.view_offset(sig))
            });
            plan[group] = ops;

            for &(g, i) in self.sorted_reads.iter().filter(|(g, _)| *g == group) {
                self.sort_signals_by_ops(g, i, sigs, sig_idxs, plan);
            }
        }
    }

    /// Rearrange signals to match the group's read order without changing
    /// the overall block order
    fn sort_signals_by_ops(
        &self,
        group: usize,
        input: usize,
        sigs: &[SignalId],
        sig_idxs: &mut AHashMap<SignalId, usize>,
        plan: &Plan,
    ) {
        let mut sort_vals: BTreeMap<SignalId, usize> = BTreeMap::new();
        for (i, op) in plan[group].iter().enumerate() {
            sort_vals.insert(self.model.base_of(self.read(*op, input)), i);
        }
        if sort_vals.len() == 1 {
            return;
        }

        let mut current: Vec<SignalId> = sigs.to_vec();
        current.sort_by_key(|s| sig_idxs[s]);
        let min_index = sort_vals.keys().map(|s| sig_idxs[s]).min().unwrap_or(0);
        let max_index = sort_vals.keys().map(|s| sig_idxs[s]).max().unwrap_or(0);

        let mut first_block = true;
        let mut last_block = false;
        let mut curr_block: Option<Option<&Block>> = None;
        let mut pre = Vec::new();
        let mut post = Vec::new();
        let mut curr_max: i64 = -1;
        let mut prev_max: i64 = -1;

        for s in &current[min_index..=max_index] {
            let block = self.signal_blocks.get(s);
            if curr_block != Some(block) {
                if last_block {
                    // sortable items after trailing unsorted ones
                    return;
                }
                if curr_block.is_some() {
                    first_block = false;
                }
                prev_max = curr_max;
                curr_max = -1;
                curr_block = Some(block);
            }

            match sort_vals.get(s) {
                Some(&idx) => {
                    let idx = idx as i64;
                    if idx < prev_max {
                        return;
                    }
                    curr_max = curr_max.max(idx);
                }
                None if first_block => pre.push(*s),
                None => {
                    last_block = true;
                    post.push(*s);
                }
            }
        }

        let mut offset = min_index;
        for s in pre {
            sig_idxs.insert(s, offset);
            offset += 1;
        }
        let mut ordered: Vec<(SignalId, usize)> = sort_vals.into_iter().collect();
        ordered.sort_by_key(|(_, v)| *v);
        for (s, _) in ordered {
            sig_idxs.insert(s, offset);
            offset += 1;
        }
        for s in post {
            sig_idxs.insert(s, offset);
            offset += 1;
        }
    }
}
