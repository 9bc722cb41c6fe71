//! Log-based progress reporting for long runs

use std::time::Instant;

use tracing::info;

/// Reports progress through `tracing` every tenth of the total
#[derive(Debug)]
pub struct ProgressBar {
    label: String,
    total: usize,
    done: usize,
    reported: usize,
    enabled: bool,
    started: Instant,
}

impl ProgressBar {
    pub fn new(label: impl Into<String>, total: usize, enabled: bool) -> Self {
        Self {
            label: label.into(),
            total,
            done: 0,
            reported: 0,
            enabled,
            started: Instant::now(),
        }
    }

    /// Completed tenths, 0..=10
    fn decile(&self) -> usize {
        if self.total == 0 {
            10
        } else {
            (self.done * 10 / self.total).min(10)
        }
    }

    pub fn tick(&mut self, n: usize) {
        self.done += n;
        let decile = self.decile();
        if self.enabled && decile > self.reported && decile < 10 {
            info!(
                "[SIM] {}: {}% ({}/{})",
                self.label,
                decile * 10,
                self.done,
                self.total
            );
        }
        self.reported = self.reported.max(decile);
    }

    pub fn done(&self) -> usize {
        self.done
    }

    /// Log completion and return the elapsed wall time in seconds
    pub fn finish(self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if self.enabled {
            info!("[SIM] {} completed in {:.3}s", self.label, elapsed);
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_steps() {
        let mut bar = ProgressBar::new("run", 20, false);
        for _ in 0..20 {
            bar.tick(1);
        }
        assert_eq!(bar.done(), 20);
        assert_eq!(bar.decile(), 10);
        assert!(bar.finish() >= 0.0);
    }

    #[test]
    fn test_empty_run_is_complete() {
        let bar = ProgressBar::new("run", 0, true);
        assert_eq!(bar.decile(), 10);
    }
}
