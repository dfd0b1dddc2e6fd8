//! Engine configuration structures.
//!
//! Every section has serde defaults, so a partial JSON document (or none at
//! all) yields a usable configuration.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::{AppResult, TaskType};

/// Per-owner concurrency ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Ceiling for owners without a tier.
    pub default_limit: usize,
    /// Ceilings by tier name.
    pub tier_limits: HashMap<String, usize>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_limit: 1,
            tier_limits: HashMap::from([("vip".to_owned(), 5)]),
        }
    }
}

impl AdmissionConfig {
    /// Ceiling that applies to `tier`.
    pub fn limit_for(&self, tier: Option<&str>) -> usize {
        tier.and_then(|t| self.tier_limits.get(t).copied())
            .unwrap_or(self.default_limit)
    }
}

/// Queue ordering and position upkeep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Boost long-waiting pending tasks.
    pub aging_enabled: bool,
    /// Wait after which aging starts.
    pub aging_threshold_secs: u64,
    /// Period of the background position recompute.
    pub recompute_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            aging_enabled: false,
            aging_threshold_secs: 600,
            recompute_interval_secs: 5,
        }
    }
}

impl QueueConfig {
    /// Aging threshold when aging is on.
    pub const fn aging(&self) -> Option<Duration> {
        if self.aging_enabled {
            Some(Duration::from_secs(self.aging_threshold_secs))
        } else {
            None
        }
    }
}

/// Worker pool sizing and execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent executions.
    pub worker_count: usize,
    /// Budget for a single backend call.
    pub execution_timeout_secs: u64,
    /// Idle wake-up period when no submission notification arrives.
    pub idle_poll_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            execution_timeout_secs: 600,
            idle_poll_ms: 500,
        }
    }
}

impl WorkerConfig {
    /// Execution timeout as a duration.
    pub const fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// Reconciliation cadences and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Period of the sweep over recently updated tasks.
    pub recent_sweep_interval_secs: u64,
    /// How far back the recent sweep looks.
    pub recent_window_secs: u64,
    /// Period of the full sweep.
    pub full_sweep_interval_secs: u64,
    /// Lifetime after which a non-terminal task is timed out.
    pub absolute_timeout_secs: u64,
    /// Quiet period before a processing task without a live execution is requeued.
    pub abandon_grace_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            recent_sweep_interval_secs: 60,
            recent_window_secs: 600,
            full_sweep_interval_secs: 600,
            absolute_timeout_secs: 24 * 60 * 60,
            abandon_grace_secs: 30,
        }
    }
}

/// Points charged per completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Cost for task types missing from `costs`.
    pub default_cost: u32,
    /// Cost by task type.
    pub costs: HashMap<TaskType, u32>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_cost: 10,
            costs: HashMap::from([
                (TaskType::TextToImage, 10),
                (TaskType::ImageToImage, 10),
                (TaskType::ImageEdit, 8),
                (TaskType::Upscale, 4),
                (TaskType::BackgroundRemoval, 2),
            ]),
        }
    }
}

impl BillingConfig {
    /// Cost of one task of `task_type`.
    pub fn cost_of(&self, task_type: TaskType) -> u32 {
        self.costs.get(&task_type).copied().unwrap_or(self.default_cost)
    }
}

/// Root engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Admission ceilings.
    pub admission: AdmissionConfig,
    /// Queue ordering.
    pub queue: QueueConfig,
    /// Worker pool.
    pub worker: WorkerConfig,
    /// Reconciler cadences.
    pub reconciler: ReconcilerConfig,
    /// Billing costs.
    pub billing: BillingConfig,
}

impl EngineConfig {
    /// Validate all sections.
    pub fn validate(&self) -> Result<(), String> {
        if self.admission.default_limit == 0 {
            return Err("admission.default_limit must be greater than 0".into());
        }
        if let Some((tier, _)) = self.admission.tier_limits.iter().find(|(_, l)| **l == 0) {
            return Err(format!("admission tier `{tier}` must allow at least one task"));
        }
        if self.queue.recompute_interval_secs == 0 {
            return Err("queue.recompute_interval_secs must be greater than 0".into());
        }
        if self.worker.worker_count == 0 {
            return Err("worker.worker_count must be greater than 0".into());
        }
        if self.worker.execution_timeout_secs == 0 {
            return Err("worker.execution_timeout_secs must be greater than 0".into());
        }
        if self.worker.idle_poll_ms == 0 {
            return Err("worker.idle_poll_ms must be greater than 0".into());
        }
        let r = &self.reconciler;
        if r.recent_sweep_interval_secs == 0 || r.full_sweep_interval_secs == 0 {
            return Err("reconciler sweep intervals must be greater than 0".into());
        }
        if r.absolute_timeout_secs == 0 {
            return Err("reconciler.absolute_timeout_secs must be greater than 0".into());
        }
        if r.absolute_timeout_secs < self.worker.execution_timeout_secs {
            return Err(
                "reconciler.absolute_timeout_secs must not be shorter than worker.execution_timeout_secs"
                    .into(),
            );
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment (after reading `.env` if present).
    ///
    /// `GTE_CONFIG` names a JSON file used as the base; individual
    /// `GTE_*` variables override it.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();

        let mut cfg = match std::env::var("GTE_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))?
            }
            Err(_) => Self::default(),
        };

        if let Some(v) = env_parse::<usize>("GTE_WORKER_COUNT")? {
            cfg.worker.worker_count = v;
        }
        if let Some(v) = env_parse::<u64>("GTE_EXECUTION_TIMEOUT_SECS")? {
            cfg.worker.execution_timeout_secs = v;
        }
        if let Some(v) = env_parse::<usize>("GTE_DEFAULT_QUOTA")? {
            cfg.admission.default_limit = v;
        }
        if let Some(v) = env_parse::<usize>("GTE_VIP_QUOTA")? {
            cfg.admission.tier_limits.insert("vip".to_owned(), v);
        }
        if let Some(v) = env_parse::<u64>("GTE_ABSOLUTE_TIMEOUT_SECS")? {
            cfg.reconciler.absolute_timeout_secs = v;
        }
        if let Some(v) = env_parse::<bool>("GTE_PRIORITY_AGING")? {
            cfg.queue.aging_enabled = v;
        }

        cfg.validate().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
        Ok(cfg)
    }
}

fn env_parse<T>(key: &str) -> AppResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{key}={raw} is not valid")),
        Err(_) => Ok(None),
    }
}
