//! Prometheus metrics for task lifecycle events.
//!
//! Every worker process owns a [`WorkerMetrics`] registry. When a shared
//! multiprocess directory is configured, each process periodically writes its
//! text exposition there as `worker-{pid}.prom`, and a scrape merges all
//! snapshots by summing identical series.

use crate::config::MetricsConfig;
use crate::error::DockhandResult;
use crate::task::TaskState;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Label value used when a label is unknown.
pub const UNKNOWN_LABEL: &str = "none";

const SNAPSHOT_EXTENSION: &str = "prom";

/// Prometheus metrics for a worker process
pub struct WorkerMetrics {
    registry: Registry,

    // Counters by (name, queue, state)
    worker_tasks: CounterVec,
    consumer_tasks: CounterVec,

    // Histograms by (name, queue)
    latency: HistogramVec,
    runtime: HistogramVec,

    multiproc_dir: Option<PathBuf>,
}

impl std::fmt::Debug for WorkerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerMetrics")
            .field("multiproc_dir", &self.multiproc_dir)
            .finish_non_exhaustive()
    }
}

/// `"-"` and `" "` become `"_"`.
pub fn sanitize_prefix(prefix: &str) -> String {
    prefix.replace(['-', ' '], "_")
}

fn prefixed(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

fn label(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => UNKNOWN_LABEL,
    }
}

impl WorkerMetrics {
    /// Register every metric under `prefix`.
    pub fn new(prefix: &str, config: &MetricsConfig) -> DockhandResult<Self> {
        let registry = Registry::new();
        let prefix = sanitize_prefix(prefix);

        let worker_tasks = CounterVec::new(
            Opts::new(
                prefixed(&prefix, "worker_tasks_count"),
                "Task lifecycle events seen by the worker",
            ),
            &["name", "queue", "state"],
        )?;
        registry.register(Box::new(worker_tasks.clone()))?;

        let consumer_tasks = CounterVec::new(
            Opts::new(
                prefixed(&prefix, "consumer_tasks_count"),
                "Task lifecycle events seen by the consumer",
            ),
            &["name", "queue", "state"],
        )?;
        registry.register(Box::new(consumer_tasks.clone()))?;

        let runtime = HistogramVec::new(
            HistogramOpts::new(
                prefixed(&prefix, "tasks_runtime_seconds"),
                "Task runtime in seconds",
            )
                .buckets(config.runtime_buckets.clone()),
            &["name", "queue"],
        )?;
        registry.register(Box::new(runtime.clone()))?;

        let latency = HistogramVec::new(
            HistogramOpts::new(
                prefixed(&prefix, "tasks_latency_seconds"),
                "Time between a task being received and started, in seconds",
            )
            .buckets(config.latency_buckets.clone()),
            &["name", "queue"],
        )?;
        registry.register(Box::new(latency.clone()))?;

        if let Some(dir) = &config.multiproc_dir {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            registry,
            worker_tasks,
            consumer_tasks,
            latency,
            runtime,
            multiproc_dir: config.multiproc_dir.clone(),
        })
    }

    /// Count a worker-side lifecycle event
    pub fn inc_worker(&self, state: TaskState, name: Option<&str>, queue: Option<&str>) {
        self.worker_tasks
            .with_label_values(&[label(name), label(queue), state.as_label()])
            .inc();
    }

    /// Count a consumer-side lifecycle event
    pub fn inc_consumer(&self, state: TaskState, name: Option<&str>, queue: Option<&str>) {
        self.consumer_tasks
            .with_label_values(&[label(name), label(queue), state.as_label()])
            .inc();
    }

    /// Record time from receive to start
    pub fn observe_latency(&self, name: Option<&str>, queue: Option<&str>, secs: f64) {
        self.latency
            .with_label_values(&[label(name), label(queue)])
            .observe(secs);
    }

    /// Record time from start to finish
    pub fn observe_runtime(&self, name: Option<&str>, queue: Option<&str>, secs: f64) {
        self.runtime
            .with_label_values(&[label(name), label(queue)])
            .observe(secs);
    }

    /// Current value of a worker counter.
    pub fn worker_count(&self, state: TaskState, name: &str, queue: &str) -> f64 {
        self.worker_tasks
            .with_label_values(&[name, queue, state.as_label()])
            .get()
    }

    /// Current value of a consumer counter.
    pub fn consumer_count(&self, state: TaskState, name: &str, queue: &str) -> f64 {
        self.consumer_tasks
            .with_label_values(&[name, queue, state.as_label()])
            .get()
    }

    /// Text exposition of this process only.
    pub fn exposition(&self) -> DockhandResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Snapshot file of this process, if a multiprocess directory is set.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.multiproc_dir
            .as_ref()
            .map(|dir| dir.join(format!("worker-{}.{}", std::process::id(), SNAPSHOT_EXTENSION)))
    }

    /// Write this process' snapshot. Replaced atomically so concurrent
    /// scrapes never read a partial file.
    pub fn flush(&self) -> DockhandResult<()> {
        let Some(path) = self.snapshot_path() else {
            return Ok(());
        };

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.exposition()?)?;
        std::fs::rename(&tmp, &path)?;
        tracing::trace!(path = %path.display(), "Metrics snapshot flushed");
        Ok(())
    }

    /// Exposition served on `/metrics`: every process' snapshot merged, or
    /// just this process when no multiprocess directory is set.
    pub fn scrape(&self) -> DockhandResult<String> {
        let Some(dir) = &self.multiproc_dir else {
            return self.exposition();
        };

        self.flush()?;

        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(text) => snapshots.push(text),
                // A peer may remove its file between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(merge_expositions(&snapshots))
    }

    /// Remove this process' snapshot.
    pub fn remove_snapshot(&self) -> DockhandResult<()> {
        if let Some(path) = self.snapshot_path() {
            match std::fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    /// The multiprocess directory, if any.
    pub fn multiproc_dir(&self) -> Option<&Path> {
        self.multiproc_dir.as_deref()
    }
}

/// Remove the multiprocess directory and everything in it.
pub fn cleanup_multiproc_dir(dir: &Path) -> DockhandResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            tracing::info!(dir = %dir.display(), "Removed metrics multiprocess directory");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Default)]
struct Family {
    help: Option<String>,
    kind: Option<String>,
    series: Vec<String>,
    values: HashMap<String, f64>,
}

/// Merge text expositions by summing identical series.
///
/// Families keep the order in which they first appear; `# HELP` and `# TYPE`
/// lines are emitted once per family.
pub fn merge_expositions(snapshots: &[String]) -> String {
    let mut order: Vec<String> = Vec::new();
    let mut families: HashMap<String, Family> = HashMap::new();

    for snapshot in snapshots {
        for line in snapshot.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("# HELP ") {
                let name = rest.split_whitespace().next().unwrap_or_default().to_string();
                let family = family_entry(&mut families, &mut order, &name);
                family.help.get_or_insert_with(|| line.to_string());
                continue;
            }
            if let Some(rest) = line.strip_prefix("# TYPE ") {
                let name = rest.split_whitespace().next().unwrap_or_default().to_string();
                let family = family_entry(&mut families, &mut order, &name);
                family.kind.get_or_insert_with(|| line.to_string());
                continue;
            }
            if line.starts_with('#') {
                continue;
            }

            let Some((series, value)) = line.rsplit_once(' ') else {
                continue;
            };
            let Ok(value) = value.parse::<f64>() else {
                continue;
            };

            let sample_name = series.split('{').next().unwrap_or(series);
            let family_name = owning_family(&order, sample_name);
            let family = family_entry(&mut families, &mut order, &family_name);
            match family.values.get_mut(series) {
                Some(total) => *total += value,
                None => {
                    family.series.push(series.to_string());
                    family.values.insert(series.to_string(), value);
                }
            }
        }
    }

    let mut out = String::new();
    for name in &order {
        let Some(family) = families.get(name) else {
            continue;
        };
        for header in [&family.help, &family.kind].into_iter().flatten() {
            out.push_str(header);
            out.push('\n');
        }
        for series in &family.series {
            out.push_str(&format!("{} {}\n", series, family.values[series]));
        }
    }
    out
}

fn family_entry<'a>(
    families: &'a mut HashMap<String, Family>,
    order: &mut Vec<String>,
    name: &str,
) -> &'a mut Family {
    if !families.contains_key(name) {
        order.push(name.to_string());
    }
    families.entry(name.to_string()).or_default()
}

fn owning_family(known: &[String], sample_name: &str) -> String {
    if known.iter().any(|f| f == sample_name) {
        return sample_name.to_string();
    }
    for suffix in ["_bucket", "_sum", "_count"] {
        if let Some(base) = sample_name.strip_suffix(suffix) {
            if known.iter().any(|f| f == base) {
                return base.to_string();
            }
        }
    }
    sample_name.to_string()
}
