//! Scalar metrics sinks.
//!
//! The training loop reports every loss as `(label, step, value)`. Sinks are best effort:
//! the loop logs a failing sink with `warn!` and keeps training.

use std::collections::BTreeMap;

use tracing::info;

use crate::Result;

pub trait MetricsSink {
    fn scalar(&mut self, label: &str, step: usize, value: f32) -> Result<()>;

    /// Called once after the last step.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MetricsSink"
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn scalar(&mut self, _label: &str, _step: usize, _value: f32) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "NullSink"
    }
}

/// Emits one `info!` event per scalar.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn scalar(&mut self, label: &str, step: usize, value: f32) -> Result<()> {
        info!(target: "polywgan::metrics", label, step, value);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TracingSink"
    }
}

/// Keeps every scalar in memory, keyed by label.
#[derive(Debug, Clone, Default)]
pub struct HistorySink {
    series: BTreeMap<String, Vec<(usize, f32)>>,
}

impl HistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn series(&self, label: &str) -> &[(usize, f32)] {
        self.series.get(label).map_or(&[], Vec::as_slice)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn last(&self, label: &str) -> Option<f32> {
        self.series(label).last().map(|&(_, v)| v)
    }
}

impl MetricsSink for HistorySink {
    fn scalar(&mut self, label: &str, step: usize, value: f32) -> Result<()> {
        self.series
            .entry(label.to_string())
            .or_default()
            .push((step, value));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "HistorySink"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_groups_by_label_in_order() {
        let mut sink = HistorySink::new();
        sink.scalar("loss_d", 0, 1.0).unwrap();
        sink.scalar("loss_g", 0, -1.0).unwrap();
        sink.scalar("loss_d", 1, 0.5).unwrap();
        assert_eq!(sink.series("loss_d"), &[(0, 1.0), (1, 0.5)]);
        assert_eq!(sink.last("loss_g"), Some(-1.0));
        assert_eq!(sink.labels().collect::<Vec<_>>(), vec!["loss_d", "loss_g"]);
        assert!(sink.series("loss").is_empty());
    }

    #[test]
    fn null_and_tracing_sinks_accept_everything() {
        assert!(NullSink.scalar("x", 3, f32::NAN).is_ok());
        assert!(TracingSink.scalar("x", 3, 2.0).is_ok());
        assert!(TracingSink.flush().is_ok());
        assert_eq!(NullSink.name(), "NullSink");
    }
}
