//! Destinations for per-update metrics
//!
//! The optimizer hands back a flat `name -> value` map after every update; a
//! [`MetricsSink`] decides where it goes. [`TracingSink`] logs it,
//! [`JsonLinesSink`] appends one JSON object per update to a file and
//! [`MemorySink`] keeps everything for tests. A `Vec` of sinks records to
//! all of them.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

/// Receiver of per-update metrics
pub trait MetricsSink {
    /// Record the metrics of update `n_updates`
    fn record(&mut self, n_updates: usize, metrics: &BTreeMap<String, f64>) -> Result<()>;

    /// Push buffered records to their destination
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for &mut S {
    fn record(&mut self, n_updates: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        (**self).record(n_updates, metrics)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn record(&mut self, n_updates: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        (**self).record(n_updates, metrics)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Fans every record out to each sink in order
impl<S: MetricsSink> MetricsSink for Vec<S> {
    fn record(&mut self, n_updates: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        self.iter_mut().try_for_each(|sink| sink.record(n_updates, metrics))
    }

    fn flush(&mut self) -> Result<()> {
        self.iter_mut().try_for_each(|sink| sink.flush())
    }
}

/// Logs a summary line every `every` updates
#[derive(Debug, Clone)]
pub struct TracingSink {
    every: usize,
}

impl TracingSink {
    pub fn new(every: usize) -> Self {
        Self { every: every.max(1) }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MetricsSink for TracingSink {
    fn record(&mut self, n_updates: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        if n_updates % self.every != 0 {
            return Ok(());
        }
        let get = |key: &str| metrics.get(key).copied().unwrap_or(f64::NAN);
        info!(
            n_updates,
            tcount = get("tcount"),
            recent_ext_ret = get("recent_ext_ret"),
            best_ext_ret = get("best_ext_ret"),
            int_rew = get("rew/int_raw_mean"),
            policy_loss = get("opt/policy_loss"),
            dyn_loss = get("opt/dyn_loss"),
            entropy = get("opt/entropy"),
            tps = get("tps"),
            "progress"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: String,
    n_updates: usize,
    #[serde(flatten)]
    metrics: &'a BTreeMap<String, f64>,
}

/// Appends one JSON object per update to a file
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening metrics file {}", path.display()))?;
        Ok(Self { writer: BufWriter::new(file) })
    }
}

impl MetricsSink for JsonLinesSink {
    fn record(&mut self, n_updates: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        // JSON has no NaN; non-finite values are dropped from the record
        let finite: BTreeMap<String, f64> =
            metrics.iter().filter(|(_, v)| v.is_finite()).map(|(k, &v)| (k.clone(), v)).collect();
        let record =
            JsonRecord { timestamp: chrono::Utc::now().to_rfc3339(), n_updates, metrics: &finite };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every record in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub records: Vec<(usize, BTreeMap<String, f64>)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values of one metric across all records that have it
    pub fn series(&self, key: &str) -> Vec<f64> {
        self.records.iter().filter_map(|(_, m)| m.get(key).copied()).collect()
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, n_updates: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        self.records.push((n_updates, metrics.clone()));
        Ok(())
    }
}
