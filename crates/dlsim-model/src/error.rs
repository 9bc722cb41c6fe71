// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Errors raised while describing or building a network

use crate::ids::{ConnectionId, NodeId, PopulationId, SignalId};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown population {0}")]
    UnknownPopulation(PopulationId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("unknown signal {0}")]
    UnknownSignal(SignalId),

    #[error("{context}: expected size {expected}, got {actual}")]
    SizeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid view of {base}: {reason}")]
    InvalidView { base: SignalId, reason: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{0} cannot be used as a connection target")]
    InvalidTarget(String),
}

pub type ModelResult<T> = Result<T, ModelError>;
