//! Render instance bookkeeping: health, per-category acquisition and load.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::InstanceConfig;
use crate::error::ConfigError;
use crate::state_machine::Category;

/// What a backend needs to reach an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Unknown,
    Healthy,
    Unreachable,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Unknown => write!(f, "unknown"),
            Health::Healthy => write!(f, "healthy"),
            Health::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// What the orchestrator learned about an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceOutcome {
    Success,
    Unreachable,
}

/// How the pool routes categories after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolMode {
    /// Every required category has a healthy instance accepting it.
    Normal,
    /// Uncovered categories are funneled to `catch_all`.
    Degraded { catch_all: String },
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub address: String,
    pub accepted_categories: BTreeSet<Category>,
    pub max_concurrent: usize,
    pub enabled: bool,
    pub fallback: bool,
    pub health: Health,
    load: usize,
    next_probe_at: Option<Instant>,
}

impl Instance {
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self {
            id: config.id.clone(),
            address: config.address.trim_end_matches('/').to_string(),
            accepted_categories: config.categories.iter().copied().collect(),
            max_concurrent: config.max_concurrent.max(1),
            enabled: config.enabled,
            fallback: config.fallback,
            health: Health::Unknown,
            load: 0,
            next_probe_at: None,
        }
    }

    pub fn target(&self) -> InstanceTarget {
        InstanceTarget {
            id: self.id.clone(),
            address: self.address.clone(),
        }
    }

    pub fn load(&self) -> usize {
        self.load
    }

    pub fn accepts(&self, category: Category) -> bool {
        self.accepted_categories.contains(&category)
    }

    fn has_free_slot(&self) -> bool {
        self.load < self.max_concurrent
    }
}

/// Point-in-time view of one instance, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub address: String,
    pub health: Health,
    pub load: usize,
    pub max_concurrent: usize,
    pub categories: Vec<Category>,
}

#[derive(Debug)]
pub struct InstancePool {
    instances: Vec<Instance>,
    catch_all: Option<usize>,
    reprobe_interval: Duration,
}

impl InstancePool {
    pub fn new(configs: &[InstanceConfig], reprobe_interval: Duration) -> Self {
        Self {
            instances: configs.iter().map(Instance::from_config).collect(),
            catch_all: None,
            reprobe_interval,
        }
    }

    fn enabled(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| i.enabled)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.instances.iter().position(|i| i.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// Every enabled instance, for the initial probe.
    pub fn targets(&self) -> Vec<InstanceTarget> {
        self.enabled().map(Instance::target).collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.enabled().filter(|i| i.health == Health::Healthy).count()
    }

    fn eligible(&self, index: usize, category: Category) -> bool {
        let instance = &self.instances[index];
        instance.enabled
            && instance.health == Health::Healthy
            && (instance.accepts(category) || self.catch_all == Some(index))
    }

    /// Checks the topology before anything is dispatched.
    ///
    /// Fails when nothing is enabled or healthy. When a required category
    /// has no healthy instance, the first healthy fallback instance becomes a
    /// catch-all; without one the run cannot start.
    pub fn validate(&mut self, required: &BTreeSet<Category>) -> Result<PoolMode, ConfigError> {
        let enabled = self.enabled().count();
        if enabled == 0 {
            return Err(ConfigError::NoInstances);
        }
        if self.healthy_count() == 0 {
            return Err(ConfigError::NoHealthyInstances(enabled));
        }

        let uncovered: Vec<Category> = required
            .iter()
            .copied()
            .filter(|&c| {
                !self
                    .enabled()
                    .any(|i| i.health == Health::Healthy && i.accepts(c))
            })
            .collect();

        let Some(&first_uncovered) = uncovered.first() else {
            self.catch_all = None;
            return Ok(PoolMode::Normal);
        };

        let catch_all = self
            .instances
            .iter()
            .position(|i| i.enabled && i.health == Health::Healthy && i.fallback)
            .ok_or(ConfigError::UncoveredCategory(first_uncovered))?;

        self.catch_all = Some(catch_all);
        let id = self.instances[catch_all].id.clone();
        warn!(instance = %id, uncovered = ?uncovered, "degraded mode: funneling uncovered categories to fallback instance");
        Ok(PoolMode::Degraded { catch_all: id })
    }

    /// A free slot exists for `category` right now.
    pub fn has_capacity_for(&self, category: Category) -> bool {
        (0..self.instances.len())
            .any(|i| self.eligible(i, category) && self.instances[i].has_free_slot())
    }

    /// Takes a slot on the least-loaded healthy instance for `category`.
    /// Never blocks; `None` means try again later.
    pub fn acquire(&mut self, category: Category) -> Option<InstanceTarget> {
        let index = (0..self.instances.len())
            .filter(|&i| self.eligible(i, category) && self.instances[i].has_free_slot())
            .min_by_key(|&i| self.instances[i].load)?;
        let instance = &mut self.instances[index];
        instance.load += 1;
        Some(instance.target())
    }

    pub fn release(&mut self, id: &str) {
        if let Some(instance) = self.instances.iter_mut().find(|i| i.id == id) {
            instance.load = instance.load.saturating_sub(1);
        }
    }

    /// Records what a submission or probe revealed about an instance.
    pub fn report(&mut self, id: &str, outcome: InstanceOutcome, now: Instant) {
        let Some(index) = self.position(id) else {
            return;
        };
        let interval = self.reprobe_interval;
        let instance = &mut self.instances[index];
        match outcome {
            InstanceOutcome::Success => {
                if instance.health != Health::Healthy {
                    info!(instance = %instance.id, "instance healthy");
                }
                instance.health = Health::Healthy;
                instance.next_probe_at = None;
            }
            InstanceOutcome::Unreachable => {
                if instance.health != Health::Unreachable {
                    warn!(instance = %instance.id, "instance unreachable, re-probe scheduled");
                }
                instance.health = Health::Unreachable;
                instance.next_probe_at = Some(now + interval);
            }
        }
    }

    /// Instances that are not healthy and whose re-probe time has come.
    pub fn due_for_probe(&self, now: Instant) -> Vec<InstanceTarget> {
        self.enabled()
            .filter(|i| i.health != Health::Healthy)
            .filter(|i| i.next_probe_at.is_none_or(|t| t <= now))
            .map(Instance::target)
            .collect()
    }

    /// Every instance that is not healthy, regardless of schedule.
    pub fn unhealthy(&self) -> Vec<InstanceTarget> {
        self.enabled()
            .filter(|i| i.health != Health::Healthy)
            .map(Instance::target)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<InstanceStatus> {
        self.instances
            .iter()
            .map(|i| InstanceStatus {
                id: i.id.clone(),
                address: i.address.clone(),
                health: i.health,
                load: i.load,
                max_concurrent: i.max_concurrent,
                categories: i.accepted_categories.iter().copied().collect(),
            })
            .collect()
    }
}
