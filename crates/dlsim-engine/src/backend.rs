// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Device placement
//!
//! Only CPU kernels exist. GPU requests are honoured with soft placement:
//! the simulator logs the fallback and runs on the CPU.

use dlsim_config::DeviceSpec;
use std::fmt;
use tracing::{info, warn};

/// Where the executor actually runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Cpu,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Cpu => write!(f, "CPU"),
        }
    }
}

/// Backend selection decision with rationale
#[derive(Debug, Clone)]
pub struct BackendDecision {
    pub backend_type: BackendType,
    pub requested: DeviceSpec,
    pub reason: String,
    /// Worker threads available to parallel kernels
    pub threads: usize,
}

pub fn select_backend(device: &DeviceSpec) -> BackendDecision {
    let threads = rayon::current_num_threads();
    let decision = match device {
        DeviceSpec::Default => BackendDecision {
            backend_type: BackendType::Cpu,
            requested: *device,
            reason: "default placement".to_string(),
            threads,
        },
        DeviceSpec::Cpu(index) => BackendDecision {
            backend_type: BackendType::Cpu,
            requested: *device,
            reason: format!("CPU {} requested", index),
            threads,
        },
        DeviceSpec::Gpu(index) => {
            warn!(
                "[BACKEND] GPU {} requested but no GPU kernels are available, falling back to CPU",
                index
            );
            BackendDecision {
                backend_type: BackendType::Cpu,
                requested: *device,
                reason: format!("GPU {} unavailable, soft placement on CPU", index),
                threads,
            }
        }
    };
    info!(
        "[BACKEND] Running on {} ({} threads): {}",
        decision.backend_type, decision.threads, decision.reason
    );
    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_falls_back_to_cpu() {
        let decision = select_backend(&DeviceSpec::Gpu(1));
        assert_eq!(decision.backend_type, BackendType::Cpu);
        assert_eq!(decision.requested, DeviceSpec::Gpu(1));
        assert!(decision.reason.contains("soft placement"));
    }

    #[test]
    fn test_cpu_selection() {
        let decision = select_backend(&DeviceSpec::Cpu(0));
        assert_eq!(decision.backend_type, BackendType::Cpu);
        assert!(decision.threads >= 1);
    }
}
