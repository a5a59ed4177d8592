//! Metric routing.
//!
//! The transport layer only needs the narrow [`Scheduler`] capability:
//! evaluate one key, answer one diagnostic query. [`LocalScheduler`] is the
//! agent's implementation, routing keys to in-process collectors and to
//! external plugin processes through the same [`Collector`] seam.

pub mod builtin;
pub mod procfs;

use crate::error::{AgentError, Result};
use crate::itemkey;
use crate::value::{CheckResult, CheckValue};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, trace};

/// Capability the connection handlers consume. Called concurrently.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Evaluate a passive-check key. Failures come back inside the result.
    async fn perform_task(&self, key: &str, timeout: Duration) -> CheckResult;

    /// Answer a textual diagnostic query such as `metrics`.
    fn query(&self, request: &str) -> String;
}

/// A source of metric values: a built-in module or a plugin process.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    async fn export(
        &self,
        key: &str,
        params: &[String],
        timeout: Duration,
    ) -> Result<Option<CheckValue>>;
}

struct MetricEntry {
    collector: Arc<dyn Collector>,
    requests: AtomicU64,
}

pub struct LocalScheduler {
    metrics: RwLock<HashMap<String, Arc<MetricEntry>>>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
        }
    }

    /// Route `key` to `collector`. A key can only have one owner.
    pub fn register(&self, key: &str, collector: Arc<dyn Collector>) -> Result<()> {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = metrics.get(key) {
            return Err(AgentError::Config(format!(
                "metric \"{}\" of \"{}\" is already registered by \"{}\"",
                key,
                collector.name(),
                existing.collector.name()
            )));
        }

        debug!(key = %key, collector = collector.name(), "Registered metric");
        metrics.insert(
            key.to_string(),
            Arc::new(MetricEntry {
                collector,
                requests: AtomicU64::new(0),
            }),
        );
        Ok(())
    }

    pub fn register_all<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        collector: Arc<dyn Collector>,
    ) -> Result<()> {
        for key in keys {
            self.register(key, Arc::clone(&collector))?;
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Arc<MetricEntry>> {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        metrics.get(name).cloned()
    }

    fn metrics_report(&self) -> String {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        let mut rows: Vec<_> = metrics.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = String::new();
        for (key, entry) in rows {
            out.push_str(&format!(
                "{:<32} {:<16} requests: {}\n",
                key,
                entry.collector.name(),
                entry.requests.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn perform_task(&self, key: &str, timeout: Duration) -> CheckResult {
        let (name, params) = match itemkey::parse(key) {
            Ok(parsed) => parsed,
            Err(e) => return CheckResult::error(e.to_string()),
        };

        let Some(entry) = self.lookup(&name) else {
            return CheckResult::error(format!("Unknown metric {}", name));
        };
        entry.requests.fetch_add(1, Ordering::Relaxed);

        trace!(key = %key, collector = entry.collector.name(), "Performing task");
        match tokio::time::timeout(timeout, entry.collector.export(&name, &params, timeout)).await
        {
            Ok(Ok(Some(value))) => value.into_result(),
            Ok(Ok(None)) => CheckResult::default(),
            Ok(Err(e)) => CheckResult::error(e.to_string()),
            Err(_) => CheckResult::error("Timeout occurred while gathering data."),
        }
    }

    fn query(&self, request: &str) -> String {
        match request {
            "metrics" => self.metrics_report(),
            other => format!("unknown request \"{}\"", other),
        }
    }
}
