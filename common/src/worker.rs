use serde::{Deserialize, Serialize};

use crate::context::MaintenanceContext;
use crate::requirement::ResourceRequirement;
use crate::task::{AgentId, ExecutionReport, NodeId, TaskId, TaskType};

/// Un agente se registra con el nodo que aloja y los recursos que ofrece.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterRequest {
    pub node_id: NodeId,
    pub hostname: String,
    pub cpus: f64,
    pub mem_mb: u64,
    pub disk_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterResponse {
    pub agent_id: AgentId,
    pub daemon_task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeatRequest {
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeatResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLaunchRequest {
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLaunchResponse {
    pub task: Option<LaunchedTask>,
}

/// Tarea de mantenimiento que el master lanzó sobre un agente.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchedTask {
    pub task_id: TaskId,
    pub task_name: String,
    pub task_type: TaskType,
    pub executor_id: TaskId,
    pub context: MaintenanceContext,
}

impl From<ResourceRequirement> for LaunchedTask {
    fn from(req: ResourceRequirement) -> Self {
        Self {
            task_id: req.task_id,
            task_name: req.task_name,
            task_type: req.task_type,
            executor_id: req.executor_id,
            context: req.context,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRequest {
    pub agent_id: AgentId,
    pub report: ExecutionReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentMetrics {
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub hostname: String,
    pub dead: bool,
    pub last_heartbeat_secs_ago: u64,
    pub in_flight: Option<String>,
    pub queued: u32,
    pub tasks_launched: u64,
    pub tasks_finished: u64,
    pub tasks_failed: u64,
}
