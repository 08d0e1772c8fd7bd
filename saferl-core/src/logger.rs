//! Epoch level metric aggregation.
//!
//! Values are stored under string keys during an epoch and aggregated once the epoch ends.
//! Windowed keys (episode metrics) keep their last `window` values across epochs, every other
//! key is cleared after each dump. Each dump is logged as a table and appended to
//! `progress.csv` when the logger owns a directory.
use anyhow::Result;
use std::{
    collections::{HashMap, VecDeque},
    fs::{self, File},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricStats {
    pub mean: f32,
    pub min: f32,
    pub max: f32,
    pub std: f32,
}

#[derive(Debug, Clone, Default)]
struct Metric {
    values: VecDeque<f32>,
    window: Option<usize>,
}

impl Metric {
    fn push(&mut self, value: f32) {
        self.values.push_back(value);
        if let Some(window) = self.window {
            while self.values.len() > window {
                self.values.pop_front();
            }
        }
    }

    fn stats(&self) -> Option<MetricStats> {
        if self.values.is_empty() {
            return None;
        }
        let n = self.values.len() as f32;
        let mean = self.values.iter().sum::<f32>() / n;
        let var = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        let min = self.values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = self.values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Some(MetricStats {
            mean,
            min,
            max,
            std: var.sqrt(),
        })
    }
}

/// Run directory, `<base>/<algo>-{<env_id>}/seed-<seed:03>-<timestamp>`.
pub fn experiment_dir(base: impl AsRef<Path>, algo: &str, env_id: &str, seed: u64) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    base.as_ref()
        .join(format!("{algo}-{{{env_id}}}"))
        .join(format!("seed-{seed:03}-{timestamp}"))
}

pub struct EpochLogger {
    log_dir: Option<PathBuf>,
    keys: Vec<String>,
    metrics: HashMap<String, Metric>,
    csv: Option<csv::Writer<File>>,
    csv_columns: Vec<String>,
    last_row: HashMap<String, f32>,
}

impl EpochLogger {
    /// Logger that only writes to the `log` facade.
    pub fn in_memory() -> Self {
        Self {
            log_dir: None,
            keys: vec![],
            metrics: HashMap::new(),
            csv: None,
            csv_columns: vec![],
            last_row: HashMap::new(),
        }
    }

    /// Logger that also keeps `progress.csv` (and checkpoints) under `log_dir`.
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;
        let csv = csv::Writer::from_path(log_dir.join("progress.csv"))?;
        Ok(Self {
            log_dir: Some(log_dir),
            csv: Some(csv),
            ..Self::in_memory()
        })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Registers `key`, windowed keys keep their last `window` values across dumps.
    pub fn register_key(&mut self, key: &str, window: Option<usize>) {
        if !self.metrics.contains_key(key) {
            self.keys.push(key.to_owned());
        }
        self.metrics.insert(
            key.to_owned(),
            Metric {
                values: VecDeque::new(),
                window,
            },
        );
    }

    pub fn store(&mut self, key: &str, value: f32) {
        if !self.metrics.contains_key(key) {
            self.keys.push(key.to_owned());
            self.metrics.insert(key.to_owned(), Metric::default());
        }
        if let Some(metric) = self.metrics.get_mut(key) {
            metric.push(value);
        }
    }

    pub fn get_stats(&self, key: &str) -> Option<MetricStats> {
        self.metrics.get(key).and_then(Metric::stats)
    }

    /// Mean of `key` as of the last dump.
    pub fn last_value(&self, key: &str) -> Option<f32> {
        self.last_row.get(key).copied()
    }

    /// Aggregates the epoch, logs it and appends it to `progress.csv`.
    pub fn dump_tabular(&mut self) -> Result<()> {
        let mut row = Vec::with_capacity(self.keys.len());
        for key in self.keys.iter() {
            let mean = self
                .metrics
                .get(key)
                .and_then(Metric::stats)
                .map(|stats| stats.mean)
                .unwrap_or(0.);
            row.push((key.clone(), mean));
        }
        let width = self.keys.iter().map(String::len).max().unwrap_or(0);
        let mut table = String::new();
        for (key, value) in row.iter() {
            table.push_str(&format!("\n| {key:<width$} | {value:>12.4} |"));
        }
        log::info!("epoch summary:{table}");

        if let Some(csv) = self.csv.as_mut() {
            if self.csv_columns.is_empty() {
                self.csv_columns = self.keys.clone();
                csv.write_record(&self.csv_columns)?;
            }
            let record: Vec<String> = self
                .csv_columns
                .iter()
                .map(|column| {
                    row.iter()
                        .find(|(key, _)| key == column)
                        .map(|(_, value)| value.to_string())
                        .unwrap_or_default()
                })
                .collect();
            csv.write_record(&record)?;
            csv.flush()?;
        }

        self.last_row = row.into_iter().collect();
        for metric in self.metrics.values_mut() {
            if metric.window.is_none() {
                metric.values.clear();
            }
        }
        Ok(())
    }
}
