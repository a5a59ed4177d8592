//! In-process collectors shipped with the agent.

use super::procfs::{self, FileSource};
use super::{Collector, LocalScheduler};
use crate::error::{AgentError, Result};
use crate::value::CheckValue;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const AGENT_KEYS: [&str; 3] = ["agent.ping", "agent.hostname", "agent.version"];
pub const SYSTEM_KEYS: [&str; 2] = ["system.uptime", "system.cpu.load"];

const UPTIME_PATH: &str = "/proc/uptime";
const LOADAVG_PATH: &str = "/proc/loadavg";

pub struct AgentCollector {
    hostname: String,
}

impl AgentCollector {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

#[async_trait]
impl Collector for AgentCollector {
    fn name(&self) -> &str {
        "Agent"
    }

    async fn export(
        &self,
        key: &str,
        params: &[String],
        _timeout: Duration,
    ) -> Result<Option<CheckValue>> {
        if !params.is_empty() {
            return Err(AgentError::application("Too many parameters."));
        }
        let value = match key {
            "agent.ping" => CheckValue::Uint(1),
            "agent.hostname" => CheckValue::Text(self.hostname.clone()),
            "agent.version" => CheckValue::Text(env!("CARGO_PKG_VERSION").to_string()),
            other => return Err(unsupported(other)),
        };
        Ok(Some(value))
    }
}

pub struct SystemCollector {
    files: Arc<dyn FileSource>,
}

impl SystemCollector {
    pub fn new(files: Arc<dyn FileSource>) -> Self {
        Self { files }
    }

    async fn uptime(&self) -> Result<CheckValue> {
        let text = self.read(UPTIME_PATH).await?;
        let seconds: f64 = text
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| AgentError::application("Cannot parse /proc/uptime."))?;
        Ok(CheckValue::Uint(seconds as u64))
    }

    async fn load(&self, params: &[String]) -> Result<CheckValue> {
        if params.len() > 2 {
            return Err(AgentError::application("Too many parameters."));
        }
        match params.first().map(String::as_str) {
            None | Some("") | Some("all") => {}
            Some("percpu") => {
                return Err(AgentError::application(
                    "Per-CPU load averages are not supported.",
                ))
            }
            Some(_) => return Err(AgentError::application("Invalid first parameter.")),
        }
        let field = match params.get(1).map(String::as_str) {
            None | Some("") | Some("avg1") => 0,
            Some("avg5") => 1,
            Some("avg15") => 2,
            Some(_) => return Err(AgentError::application("Invalid second parameter.")),
        };

        let text = self.read(LOADAVG_PATH).await?;
        let load: f64 = text
            .split_whitespace()
            .nth(field)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| AgentError::application("Cannot parse /proc/loadavg."))?;
        Ok(CheckValue::Float(load))
    }

    async fn read(&self, path: &str) -> Result<String> {
        procfs::read_to_string(self.files.as_ref(), Path::new(path))
            .await
            .map_err(|e| AgentError::application(format!("Cannot read {}: {}", path, e)))
    }
}

#[async_trait]
impl Collector for SystemCollector {
    fn name(&self) -> &str {
        "System"
    }

    async fn export(
        &self,
        key: &str,
        params: &[String],
        _timeout: Duration,
    ) -> Result<Option<CheckValue>> {
        let value = match key {
            "system.uptime" => {
                if !params.is_empty() {
                    return Err(AgentError::application("Too many parameters."));
                }
                self.uptime().await?
            }
            "system.cpu.load" => self.load(params).await?,
            other => return Err(unsupported(other)),
        };
        Ok(Some(value))
    }
}

fn unsupported(key: &str) -> AgentError {
    AgentError::application(format!("Unsupported metric {}", key))
}

/// Scheduler preloaded with the built-in collectors.
pub fn local_scheduler(
    hostname: &str,
    files: Arc<dyn FileSource>,
) -> Result<LocalScheduler> {
    let scheduler = LocalScheduler::new();
    scheduler.register_all(AGENT_KEYS, Arc::new(AgentCollector::new(hostname)))?;
    scheduler.register_all(SYSTEM_KEYS, Arc::new(SystemCollector::new(files)))?;
    Ok(scheduler)
}
