use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::context::MaintenanceContext;
use crate::error::PlanError;
use crate::task::{AgentId, DaemonTask, MaintenanceTask, TaskId, TaskType};

/// Recursos que necesita un tipo de tarea de mantenimiento.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    pub cpus: f64,
    pub mem_mb: u64,
    pub disk_mb: u64,
}

/// Lo que el cluster manager tiene que conceder para lanzar la tarea
/// al lado del daemon ya existente (requerimiento tipo "update").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub task_id: TaskId,
    pub task_name: String,
    pub task_type: TaskType,
    pub agent_id: AgentId,
    /// Task id del daemon junto al cual corre la tarea.
    pub executor_id: TaskId,
    pub cpus: f64,
    pub mem_mb: u64,
    pub disk_mb: u64,
    pub context: MaintenanceContext,
}

/// Recursos que un agente ofrece en un ciclo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub agent_id: AgentId,
    pub cpus: f64,
    pub mem_mb: u64,
    pub disk_mb: u64,
}

impl Offer {
    pub fn satisfies(&self, req: &ResourceRequirement) -> bool {
        self.agent_id == req.agent_id
            && self.cpus >= req.cpus
            && self.mem_mb >= req.mem_mb
            && self.disk_mb >= req.disk_mb
    }
}

pub trait RequirementProvider: Send + Sync {
    /// Función pura de (tarea, daemon). Falla con `UnsupportedTaskType`
    /// si el tipo no tiene plantilla.
    fn update_requirement(
        &self,
        task: &MaintenanceTask,
        daemon: &DaemonTask,
    ) -> Result<ResourceRequirement, PlanError>;
}

#[derive(Debug, Clone, Default)]
pub struct TemplateRequirementProvider {
    templates: HashMap<TaskType, ResourceTemplate>,
}

impl TemplateRequirementProvider {
    pub fn new(templates: HashMap<TaskType, ResourceTemplate>) -> Self {
        Self { templates }
    }

    /// Plantillas por defecto: las tareas de mantenimiento corren al lado
    /// del daemon, así que piden poco.
    pub fn with_defaults() -> Self {
        let templates = TaskType::ALL
            .iter()
            .map(|t| (*t, default_template(*t)))
            .collect();
        Self { templates }
    }

    pub fn template(&self, task_type: TaskType) -> Option<ResourceTemplate> {
        self.templates.get(&task_type).copied()
    }
}

pub fn default_template(task_type: TaskType) -> ResourceTemplate {
    match task_type {
        TaskType::BackupUpload | TaskType::DownloadSnapshot => ResourceTemplate {
            cpus: 0.5,
            mem_mb: 256,
            disk_mb: 0,
        },
        _ => ResourceTemplate {
            cpus: 0.1,
            mem_mb: 32,
            disk_mb: 0,
        },
    }
}

impl RequirementProvider for TemplateRequirementProvider {
    fn update_requirement(
        &self,
        task: &MaintenanceTask,
        daemon: &DaemonTask,
    ) -> Result<ResourceRequirement, PlanError> {
        let template = self
            .template(task.task_type)
            .ok_or(PlanError::UnsupportedTaskType(task.task_type))?;

        Ok(ResourceRequirement {
            task_id: task.task_id.clone(),
            task_name: task.name.clone(),
            task_type: task.task_type,
            agent_id: daemon.agent_id.clone(),
            executor_id: daemon.task_id.clone(),
            cpus: template.cpus,
            mem_mb: template.mem_mb,
            disk_mb: template.disk_mb,
            context: task.context.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(task_type: TaskType) -> (MaintenanceTask, DaemonTask) {
        let daemon = DaemonTask::new("node-0", "agent-7", "host-0");
        let task = MaintenanceTask::new(&daemon, task_type, MaintenanceContext::default());
        (task, daemon)
    }

    #[test]
    fn requerimiento_apunta_al_agente_y_executor_del_daemon() {
        let provider = TemplateRequirementProvider::with_defaults();
        let (task, daemon) = fixture(TaskType::Compact);

        let req = provider.update_requirement(&task, &daemon).unwrap();

        assert_eq!(req.agent_id, "agent-7");
        assert_eq!(req.executor_id, daemon.task_id);
        assert_eq!(req.task_name, "compact-node-0");
        assert_eq!(req.task_id, task.task_id);
        // misma entrada, mismo requerimiento
        assert_eq!(req, provider.update_requirement(&task, &daemon).unwrap());
    }

    #[test]
    fn tipo_sin_plantilla_es_no_soportado() {
        let mut templates = HashMap::new();
        templates.insert(TaskType::Compact, default_template(TaskType::Compact));
        let provider = TemplateRequirementProvider::new(templates);
        let (task, daemon) = fixture(TaskType::Repair);

        let err = provider.update_requirement(&task, &daemon).unwrap_err();
        assert_eq!(err, PlanError::UnsupportedTaskType(TaskType::Repair));
    }

    #[test]
    fn oferta_cubre_solo_su_agente_y_recursos() {
        let provider = TemplateRequirementProvider::with_defaults();
        let (task, daemon) = fixture(TaskType::BackupUpload);
        let req = provider.update_requirement(&task, &daemon).unwrap();

        let ok = Offer { agent_id: "agent-7".into(), cpus: 1.0, mem_mb: 1024, disk_mb: 0 };
        let otro_agente = Offer { agent_id: "agent-8".into(), ..ok.clone() };
        let poca_memoria = Offer { mem_mb: 128, ..ok.clone() };

        assert!(ok.satisfies(&req));
        assert!(!otro_agente.satisfies(&req));
        assert!(!poca_memoria.satisfies(&req));
    }
}
