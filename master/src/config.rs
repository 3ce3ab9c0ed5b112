use std::{collections::HashMap, env, time::Duration};

use common::requirement::default_template;
use common::{ResourceTemplate, TaskType, TemplateRequirementProvider};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_OFFER_INTERVAL_SECS: u64 = 2;
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 20;

/// Configuración del scheduler, leída una vez de variables de entorno.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub bind_addr: String,
    pub offer_interval: Duration,
    pub agent_timeout: Duration,
    pub templates: HashMap<TaskType, ResourceTemplate>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Plantillas sobreescribibles con `<PREFIJO>_CPUS`, `<PREFIJO>_MEM_MB`
    /// y `<PREFIJO>_DISK_MB` (ej. `COMPACT_CPUS=0.5`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let templates = TaskType::ALL
            .iter()
            .map(|t| {
                let prefix = t.prefix().to_uppercase();
                let base = default_template(*t);
                let template = ResourceTemplate {
                    cpus: parse_or(&lookup, &format!("{}_CPUS", prefix), base.cpus),
                    mem_mb: parse_or(&lookup, &format!("{}_MEM_MB", prefix), base.mem_mb),
                    disk_mb: parse_or(&lookup, &format!("{}_DISK_MB", prefix), base.disk_mb),
                };
                (*t, template)
            })
            .collect();

        Self {
            bind_addr: lookup("MASTER_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            offer_interval: Duration::from_secs(parse_or(
                &lookup,
                "OFFER_INTERVAL_SECS",
                DEFAULT_OFFER_INTERVAL_SECS,
            )),
            agent_timeout: Duration::from_secs(parse_or(
                &lookup,
                "AGENT_TIMEOUT_SECS",
                DEFAULT_AGENT_TIMEOUT_SECS,
            )),
            templates,
        }
    }

    pub fn provider(&self) -> TemplateRequirementProvider {
        TemplateRequirementProvider::new(self.templates.clone())
    }
}
