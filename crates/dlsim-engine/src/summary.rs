// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Execution graph summaries for offline inspection
//!
//! Layout: `<data_dir>/<label>/run_<k>/graph.json` describes the operator
//! plan and base arrays of one simulator build; `events.jsonl` in the same
//! directory gets one line per run or training call.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use dlsim_model::Model;

use crate::error::Result;
use crate::float::SimFloat;
use crate::planner::Plan;
use crate::tensor_signal::SignalLayout;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub kind: String,
    pub ops: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseSummary {
    pub key: usize,
    pub shape: Vec<usize>,
    pub trainable: bool,
    pub minibatched: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSummary {
    pub model: String,
    pub dtype: String,
    pub planner: String,
    pub n_signals: usize,
    pub n_operators: usize,
    pub groups: Vec<GroupSummary>,
    pub bases: Vec<BaseSummary>,
}

impl GraphSummary {
    pub fn new<T: SimFloat>(model: &Model, plan: &Plan, layout: &SignalLayout<T>, planner: &str) -> Self {
        let groups = plan
            .iter()
            .map(|ops| GroupSummary {
                kind: ops
                    .first()
                    .map(|op| model.operators[op.index()].kind().to_string())
                    .unwrap_or_default(),
                ops: ops.iter().map(|op| model.operators[op.index()].to_string()).collect(),
            })
            .collect();
        let bases = layout
            .bases
            .iter()
            .zip(&layout.params)
            .enumerate()
            .map(|(key, (base, params))| BaseSummary {
                key,
                shape: base.shape().to_vec(),
                trainable: params.trainable,
                minibatched: params.minibatched,
            })
            .collect();
        Self {
            model: model.label.clone(),
            dtype: T::NAME.to_string(),
            planner: planner.to_string(),
            n_signals: model.signals.len(),
            n_operators: model.operators.len(),
            groups,
            bases,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: String,
    pub kind: String,
    pub start_step: usize,
    pub n_steps: usize,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
}

impl RunEvent {
    pub fn new(kind: &str, start_step: usize, n_steps: usize, elapsed_secs: f64) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind: kind.to_string(),
            start_step,
            n_steps,
            elapsed_secs,
            loss: None,
        }
    }

    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = Some(loss);
        self
    }
}

/// Make a label usable as a directory name
pub fn sanitize_name(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "model".to_string()
    } else {
        cleaned
    }
}

/// Smallest `k` such that `dir/run_k` does not exist yet
pub fn next_run_index(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("run_"))
                .and_then(|k| k.parse::<usize>().ok())
        })
        .map(|k| k + 1)
        .max()
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct SummaryWriter {
    run_dir: PathBuf,
}

impl SummaryWriter {
    /// Create the next `run_<k>` directory for `label`
    pub fn create(data_dir: &Path, label: &str) -> Result<Self> {
        let model_dir = data_dir.join(sanitize_name(label));
        fs::create_dir_all(&model_dir)?;
        let run_dir = model_dir.join(format!("run_{}", next_run_index(&model_dir)));
        fs::create_dir_all(&run_dir)?;
        info!("[SIM] Writing execution summaries to {}", run_dir.display());
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn write_graph(&self, graph: &GraphSummary) -> Result<()> {
        let file = File::create(self.run_dir.join("graph.json"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), graph)?;
        Ok(())
    }

    pub fn log_event(&self, event: &RunEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join("events.jsonl"))?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("my net/v2"), "my_net_v2");
        assert_eq!(sanitize_name(""), "model");
    }

    #[test]
    fn test_run_directories_increment() {
        let tmp = TempDir::new().unwrap();
        let first = SummaryWriter::create(tmp.path(), "net").unwrap();
        let second = SummaryWriter::create(tmp.path(), "net").unwrap();
        assert!(first.run_dir().ends_with("net/run_0"));
        assert!(second.run_dir().ends_with("net/run_1"));
    }

    #[test]
    fn test_events_are_appended() {
        let tmp = TempDir::new().unwrap();
        let writer = SummaryWriter::create(tmp.path(), "net").unwrap();
        writer.log_event(&RunEvent::new("run", 0, 10, 0.5)).unwrap();
        writer.log_event(&RunEvent::new("train", 10, 5, 0.1).with_loss(0.25)).unwrap();

        let text = fs::read_to_string(writer.run_dir().join("events.jsonl")).unwrap();
        let events: Vec<RunEvent> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].loss, Some(0.25));
        assert!(events[0].loss.is_none());
    }
}
