// master/src/state.rs

use common::{
    AgentId, InMemoryRegistry, LaunchedTask, NodeId, Offer, Plan, TaskId, TemplateRequirementProvider,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use crate::config::SchedulerConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SchedulerConfig>,
    pub registry: Arc<InMemoryRegistry>,
    pub provider: Arc<TemplateRequirementProvider>,
    // plan activo (uno a la vez)
    pub plan: Arc<Mutex<Option<Plan>>>,
    pub agents: Arc<Mutex<HashMap<AgentId, AgentMeta>>>,
}

impl AppState {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            provider: Arc::new(config.provider()),
            config: Arc::new(config),
            registry: Arc::new(InMemoryRegistry::new()),
            plan: Arc::new(Mutex::new(None)),
            agents: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentMeta {
    pub node_id: NodeId,
    pub hostname: String,
    pub daemon_task_id: TaskId,
    pub last_heartbeat: SystemTime,
    pub dead: bool,

    // recursos que ofrece en cada ciclo
    pub cpus: f64,
    pub mem_mb: u64,
    pub disk_mb: u64,

    // tareas lanzadas que el agente todavía no retiró
    pub queue: VecDeque<LaunchedTask>,
    // tarea retirada y todavía sin estado terminal
    pub in_flight: Option<LaunchedTask>,

    // Métricas
    pub tasks_launched: u64,
    pub tasks_finished: u64,
    pub tasks_failed: u64,
}

impl AgentMeta {
    /// La tarea fue lanzada a este agente (retirada o todavía en cola).
    pub fn owns(&self, task_id: &str) -> bool {
        self.in_flight.iter().chain(self.queue.iter()).any(|t| t.task_id == task_id)
    }

    /// Un agente ofrece recursos sólo si está vivo y libre.
    pub fn offer(&self, agent_id: &str) -> Option<Offer> {
        if self.dead || self.in_flight.is_some() || !self.queue.is_empty() {
            return None;
        }
        Some(Offer {
            agent_id: agent_id.to_string(),
            cpus: self.cpus,
            mem_mb: self.mem_mb,
            disk_mb: self.disk_mb,
        })
    }
}
