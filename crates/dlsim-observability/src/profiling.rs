// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chrome trace capture
//!
//! Spans entered while the closure runs are written as a Chrome trace JSON
//! file, viewable in `chrome://tracing` or Perfetto.

use std::path::Path;

use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("failed to prepare profile directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `f` with a thread-local Chrome trace subscriber writing to `path`
///
/// Only spans and events from the calling thread are captured. The trace
/// file is complete once this function returns.
pub fn with_chrome_trace<R>(path: &Path, f: impl FnOnce() -> R) -> Result<R, ProfileError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| ProfileError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }

    let (chrome_layer, guard) = ChromeLayerBuilder::new()
        .file(path.to_path_buf())
        .include_args(true)
        .build();
    let subscriber = Registry::default().with(chrome_layer);

    let result = tracing::subscriber::with_default(subscriber, f);
    drop(guard);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trace.json");

        let value = with_chrome_trace(&path, || {
            let _span = tracing::info_span!("work", step = 1).entered();
            21 * 2
        })
        .unwrap();

        assert_eq!(value, 42);
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_array());
    }
}
