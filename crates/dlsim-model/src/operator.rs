// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operators: the per-step computations of a model
//!
//! Each operator declares how it touches signals. Within one step every
//! signal is first `set`, then `inc`remented, then `read`, and finally
//! `update`d for the next step. The engine derives execution order from
//! these declarations.

use std::fmt;

use crate::ids::{NodeId, SignalId};
use crate::network::NodeFunction;
use crate::neurons::NeuronType;

/// First-order lowpass filter `y[t] = a * y[t-1] + (1 - a) * x[t]`, `a = exp(-dt / tau)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lowpass {
    pub tau: f64,
}

impl Lowpass {
    pub fn decay(&self, dt: f64) -> f64 {
        (-dt / self.tau).exp()
    }
}

/// Whether a process writes its output in the `set` or `update` phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessMode {
    /// Output is visible to readers in the same step; filter state is kept separately
    Set,
    /// Output is advanced after all reads, giving a one step delay
    Update,
}

#[derive(Debug, Clone)]
pub enum Operator {
    /// `dst = value`
    Reset { dst: SignalId, value: f64 },
    /// `dst = src` or `dst += src`
    Copy { src: SignalId, dst: SignalId, inc: bool },
    /// `y += a * x`, with `a` broadcast when it has a single row
    ElementwiseInc { a: SignalId, x: SignalId, y: SignalId },
    /// `y += A @ x`
    DotInc { a: SignalId, x: SignalId, y: SignalId },
    /// Advances the step counter and simulation time
    TimeUpdate { step: SignalId, time: SignalId },
    SimNeurons {
        neuron_type: NeuronType,
        j: SignalId,
        output: SignalId,
        states: Vec<SignalId>,
    },
    SimProcess {
        process: Lowpass,
        input: SignalId,
        output: SignalId,
        /// Filter state, present in [`ProcessMode::Set`]
        state: Option<SignalId>,
        mode: ProcessMode,
    },
    /// Host function called every step with time and/or input
    SimPyFunc {
        function: NodeFunction,
        t: Option<SignalId>,
        x: Option<SignalId>,
        output: Option<SignalId>,
    },
    /// Writes the externally supplied value of an input node
    NodeInput { node: NodeId, output: SignalId },
}

/// Operator discriminant used for grouping and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Reset,
    Copy,
    ElementwiseInc,
    DotInc,
    TimeUpdate,
    SimNeurons,
    SimProcess,
    SimPyFunc,
    NodeInput,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Operator {
    pub fn kind(&self) -> OpKind {
        match self {
            Operator::Reset { .. } => OpKind::Reset,
            Operator::Copy { .. } => OpKind::Copy,
            Operator::ElementwiseInc { .. } => OpKind::ElementwiseInc,
            Operator::DotInc { .. } => OpKind::DotInc,
            Operator::TimeUpdate { .. } => OpKind::TimeUpdate,
            Operator::SimNeurons { .. } => OpKind::SimNeurons,
            Operator::SimProcess { .. } => OpKind::SimProcess,
            Operator::SimPyFunc { .. } => OpKind::SimPyFunc,
            Operator::NodeInput { .. } => OpKind::NodeInput,
        }
    }

    pub fn sets(&self) -> Vec<SignalId> {
        match self {
            Operator::Reset { dst, .. } => vec![*dst],
            Operator::Copy { dst, inc: false, .. } => vec![*dst],
            Operator::TimeUpdate { step, time } => vec![*step, *time],
            Operator::SimNeurons { output, .. } => vec![*output],
            Operator::SimProcess {
                output,
                mode: ProcessMode::Set,
                ..
            } => vec![*output],
            Operator::SimPyFunc { output, .. } => output.iter().copied().collect(),
            Operator::NodeInput { output, .. } => vec![*output],
            _ => Vec::new(),
        }
    }

    pub fn incs(&self) -> Vec<SignalId> {
        match self {
            Operator::Copy { dst, inc: true, .. } => vec![*dst],
            Operator::ElementwiseInc { y, .. } | Operator::DotInc { y, .. } => vec![*y],
            _ => Vec::new(),
        }
    }

    pub fn reads(&self) -> Vec<SignalId> {
        match self {
            Operator::Copy { src, .. } => vec![*src],
            Operator::ElementwiseInc { a, x, .. } | Operator::DotInc { a, x, .. } => vec![*a, *x],
            Operator::SimNeurons { j, .. } => vec![*j],
            Operator::SimProcess { input, .. } => vec![*input],
            Operator::SimPyFunc { t, x, .. } => t.iter().chain(x.iter()).copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn updates(&self) -> Vec<SignalId> {
        match self {
            Operator::SimNeurons { states, .. } => states.clone(),
            Operator::SimProcess {
                output,
                state,
                mode,
                ..
            } => match mode {
                ProcessMode::Update => vec![*output],
                ProcessMode::Set => state.iter().copied().collect(),
            },
            _ => Vec::new(),
        }
    }

    /// `reads + sets + incs + updates`, the order used when comparing operators
    pub fn all_signals(&self) -> Vec<SignalId> {
        let mut signals = self.reads();
        signals.extend(self.sets());
        signals.extend(self.incs());
        signals.extend(self.updates());
        signals
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Reset { dst, value } => write!(f, "Reset({} = {})", dst, value),
            Operator::Copy { src, dst, inc } => {
                write!(f, "Copy({} {} {})", dst, if *inc { "+=" } else { "=" }, src)
            }
            Operator::ElementwiseInc { a, x, y } => write!(f, "ElementwiseInc({} += {} * {})", y, a, x),
            Operator::DotInc { a, x, y } => write!(f, "DotInc({} += {} @ {})", y, a, x),
            Operator::TimeUpdate { .. } => write!(f, "TimeUpdate"),
            Operator::SimNeurons { neuron_type, j, .. } => write!(f, "SimNeurons({}, {})", neuron_type, j),
            Operator::SimProcess { input, output, mode, .. } => {
                write!(f, "SimProcess({} -> {}, {:?})", input, output, mode)
            }
            Operator::SimPyFunc { function, .. } => write!(f, "SimPyFunc({})", function.name()),
            Operator::NodeInput { node, output } => write!(f, "NodeInput({} -> {})", node, output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_inc_vs_set() {
        let set = Operator::Copy {
            src: SignalId(0),
            dst: SignalId(1),
            inc: false,
        };
        let inc = Operator::Copy {
            src: SignalId(0),
            dst: SignalId(1),
            inc: true,
        };
        assert_eq!(set.sets(), vec![SignalId(1)]);
        assert!(set.incs().is_empty());
        assert_eq!(inc.incs(), vec![SignalId(1)]);
        assert!(inc.sets().is_empty());
    }

    #[test]
    fn test_process_mode_changes_role_of_output() {
        let update = Operator::SimProcess {
            process: Lowpass { tau: 0.01 },
            input: SignalId(0),
            output: SignalId(1),
            state: None,
            mode: ProcessMode::Update,
        };
        let set = Operator::SimProcess {
            process: Lowpass { tau: 0.01 },
            input: SignalId(0),
            output: SignalId(1),
            state: Some(SignalId(2)),
            mode: ProcessMode::Set,
        };
        assert_eq!(update.updates(), vec![SignalId(1)]);
        assert!(update.sets().is_empty());
        assert_eq!(set.sets(), vec![SignalId(1)]);
        assert_eq!(set.updates(), vec![SignalId(2)]);
    }

    #[test]
    fn test_all_signals_order() {
        let op = Operator::ElementwiseInc {
            a: SignalId(3),
            x: SignalId(4),
            y: SignalId(5),
        };
        assert_eq!(op.all_signals(), vec![SignalId(3), SignalId(4), SignalId(5)]);
    }

    #[test]
    fn test_lowpass_decay() {
        let decay = Lowpass { tau: 0.1 }.decay(0.001);
        assert!((decay - (-0.01f64).exp()).abs() < 1e-12);
    }
}
