use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::MaintenanceContext;

pub type NodeId = String;
pub type TaskId = String;
pub type AgentId = String;

/// Tipos de mantenimiento que un plan puede ejecutar nodo por nodo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Compact,
    Cleanup,
    Repair,
    BackupSnapshot,
    BackupUpload,
    DownloadSnapshot,
    RestoreSnapshot,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::Compact,
        TaskType::Cleanup,
        TaskType::Repair,
        TaskType::BackupSnapshot,
        TaskType::BackupUpload,
        TaskType::DownloadSnapshot,
        TaskType::RestoreSnapshot,
    ];

    /// Prefijo usado en el nombre de la tarea: "<prefijo>-<nodo>".
    pub fn prefix(self) -> &'static str {
        match self {
            TaskType::Compact => "compact",
            TaskType::Cleanup => "cleanup",
            TaskType::Repair => "repair",
            TaskType::BackupSnapshot => "backup",
            TaskType::BackupUpload => "upload",
            TaskType::DownloadSnapshot => "download",
            TaskType::RestoreSnapshot => "restore",
        }
    }

    pub fn task_name(self, node: &str) -> String {
        format!("{}-{}", self.prefix(), node)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Estado de ejecución tal como lo reporta el cluster manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
}

impl ExecutionState {
    pub fn is_success(self) -> bool {
        matches!(self, ExecutionState::Finished)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExecutionState::Failed
                | ExecutionState::Killed
                | ExecutionState::Lost
                | ExecutionState::Error
        )
    }

    pub fn is_terminal(self) -> bool {
        self.is_success() || self.is_failure()
    }
}

/// Último estado observado para una tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub state: ExecutionState,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn new(task_id: impl Into<TaskId>, state: ExecutionState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Proceso de larga duración del servicio de datos en un nodo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonTask {
    pub node_id: NodeId,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub state: ExecutionState,
}

impl DaemonTask {
    pub fn new(node_id: impl Into<NodeId>, agent_id: impl Into<AgentId>, hostname: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            task_id: format!("{}__{}", node_id, uuid::Uuid::new_v4()),
            node_id,
            agent_id: agent_id.into(),
            hostname: hostname.into(),
            state: ExecutionState::Running,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ExecutionState::Running
    }
}

/// Registro persistido de una acción de mantenimiento sobre un nodo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub name: String,
    pub node_id: NodeId,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub task_type: TaskType,
    /// `None` mientras nadie reportó estado (requerimiento emitido pero no lanzado).
    pub state: Option<ExecutionState>,
    pub last_report: Option<ExecutionReport>,
    pub context: MaintenanceContext,
}

impl MaintenanceTask {
    pub fn new(daemon: &DaemonTask, task_type: TaskType, context: MaintenanceContext) -> Self {
        let name = task_type.task_name(&daemon.node_id);
        Self {
            task_id: format!("{}__{}", name, uuid::Uuid::new_v4()),
            name,
            node_id: daemon.node_id.clone(),
            agent_id: daemon.agent_id.clone(),
            task_type,
            state: None,
            last_report: None,
            context,
        }
    }

    /// Aplica un reporte. Un estado terminal es definitivo: los reportes que
    /// llegan después (duplicados o atrasados) se descartan y devuelve `false`.
    pub fn apply(&mut self, report: &ExecutionReport) -> bool {
        if let Some(current) = self.state.filter(|s| s.is_terminal()) {
            debug!(
                "{}: descartado {:?}, la tarea ya terminó en {:?}",
                self.name, report.state, current
            );
            return false;
        }
        self.state = Some(report.state);
        self.last_report = Some(report.clone());
        true
    }

    pub fn is_complete(&self) -> bool {
        self.state.map(ExecutionState::is_success).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nombre_de_tarea_usa_prefijo_y_nodo() {
        assert_eq!(TaskType::Compact.task_name("node-0"), "compact-node-0");
        assert_eq!(TaskType::BackupUpload.task_name("node-2"), "upload-node-2");
    }

    #[test]
    fn estados_terminales_separan_exito_y_fallo() {
        assert!(ExecutionState::Finished.is_success());
        assert!(!ExecutionState::Finished.is_failure());
        for s in [
            ExecutionState::Failed,
            ExecutionState::Killed,
            ExecutionState::Lost,
            ExecutionState::Error,
        ] {
            assert!(s.is_failure());
            assert!(s.is_terminal());
        }
        assert!(!ExecutionState::Running.is_terminal());
        assert!(!ExecutionState::Staging.is_terminal());
    }

    #[test]
    fn apply_guarda_el_reporte_tal_cual() {
        let daemon = DaemonTask::new("node-0", "agent-1", "host-0");
        let mut task = MaintenanceTask::new(&daemon, TaskType::Repair, MaintenanceContext::default());
        assert_eq!(task.state, None);

        let report = ExecutionReport::new(task.task_id.clone(), ExecutionState::Failed)
            .with_message("nodetool salió con código 2");
        assert!(task.apply(&report));

        assert_eq!(task.state, Some(ExecutionState::Failed));
        assert_eq!(task.last_report, Some(report));
        assert!(!task.is_complete());
    }

    #[test]
    fn estado_terminal_no_se_pisa() {
        let daemon = DaemonTask::new("node-0", "agent-1", "host-0");
        let mut task = MaintenanceTask::new(&daemon, TaskType::Compact, MaintenanceContext::default());
        let done = ExecutionReport::new(task.task_id.clone(), ExecutionState::Finished);
        assert!(task.apply(&done));

        assert!(!task.apply(&ExecutionReport::new(task.task_id.clone(), ExecutionState::Running)));
        assert!(!task.apply(&ExecutionReport::new(task.task_id.clone(), ExecutionState::Lost)));
        assert_eq!(task.state, Some(ExecutionState::Finished));
        assert_eq!(task.last_report, Some(done));
        assert!(task.is_complete());
    }
}
