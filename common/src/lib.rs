pub mod context;
pub mod error;
pub mod plan;
pub mod registry;
pub mod requirement;
pub mod step;
pub mod task;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use context::MaintenanceContext;
pub use error::PlanError;
pub use plan::{build_plan, OperationKind, Phase, PhaseInfo, Plan, PlanInfo, StepError, StepInfo, Strategy};
pub use registry::{InMemoryRegistry, StatusSource, TaskRegistry};
pub use requirement::{
    Offer, RequirementProvider, ResourceRequirement, ResourceTemplate, TemplateRequirementProvider,
};
pub use step::{MaintenanceStep, Status};
pub use task::{
    AgentId, DaemonTask, ExecutionReport, ExecutionState, MaintenanceTask, NodeId, TaskId, TaskType,
};
pub use worker::{
    AgentHeartbeatRequest, AgentHeartbeatResponse, AgentMetrics, AgentRegisterRequest,
    AgentRegisterResponse, LaunchedTask, TaskLaunchRequest, TaskLaunchResponse, TaskStatusRequest,
    TaskStatusResponse,
};

/* --------- Pedido de operación (PUT /v1/operations/:operation/start) --------- */

fn all_nodes() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Nodos destino; "*" = todos.
    #[serde(default = "all_nodes")]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub key_spaces: Vec<String>,
    #[serde(default)]
    pub column_families: Vec<String>,
    #[serde(default)]
    pub backup_name: Option<String>,
    #[serde(default)]
    pub external_location: Option<String>,
}

impl From<OperationRequest> for MaintenanceContext {
    fn from(req: OperationRequest) -> Self {
        MaintenanceContext {
            nodes: req.nodes,
            key_spaces: req.key_spaces,
            column_families: req.column_families,
            backup_name: req.backup_name,
            external_location: req.external_location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pedido_vacio_apunta_a_todos_los_nodos() {
        let req: OperationRequest = serde_json::from_str("{}").unwrap();
        let ctx: MaintenanceContext = req.into();
        assert!(ctx.all_nodes());
        assert!(ctx.key_spaces.is_empty());
    }

    #[test]
    fn estados_se_serializan_en_mayusculas() {
        assert_eq!(serde_json::to_string(&Status::InProgress).unwrap(), "\"IN_PROGRESS\"");
        assert_eq!(
            serde_json::to_string(&TaskType::BackupSnapshot).unwrap(),
            "\"BACKUP_SNAPSHOT\""
        );
    }
}
