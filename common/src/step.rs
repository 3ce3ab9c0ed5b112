use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::MaintenanceContext;
use crate::error::PlanError;
use crate::registry::TaskRegistry;
use crate::requirement::{RequirementProvider, ResourceRequirement};
use crate::task::{ExecutionReport, ExecutionState, MaintenanceTask, NodeId, TaskType};

/// Estado de un step, fase o plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    /// Sólo forma parte del formato de intercambio; la derivación nunca lo
    /// produce (un step lanzado pasa de `Pending` a `Starting`).
    Prepared,
    Starting,
    InProgress,
    Complete,
    Error,
}

/// Acción de mantenimiento sobre un nodo.
///
/// No guarda estado propio: cada `status()` se recalcula a partir del
/// registro de tareas y del estado en vivo, así que se puede recrear en
/// cualquier momento (por ejemplo después de reiniciar el scheduler).
#[derive(Clone)]
pub struct MaintenanceStep {
    node: NodeId,
    name: String,
    task_type: TaskType,
    context: MaintenanceContext,
    registry: Arc<dyn TaskRegistry>,
    provider: Arc<dyn RequirementProvider>,
}

impl fmt::Debug for MaintenanceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceStep")
            .field("name", &self.name)
            .field("context", &self.context)
            .finish()
    }
}

impl MaintenanceStep {
    pub fn new(
        node: impl Into<NodeId>,
        task_type: TaskType,
        context: MaintenanceContext,
        registry: Arc<dyn TaskRegistry>,
        provider: Arc<dyn RequirementProvider>,
    ) -> Self {
        let node = node.into();
        Self {
            name: task_type.task_name(&node),
            node,
            task_type,
            context,
            registry,
            provider,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodo (daemon) sobre el que corre el step.
    pub fn daemon(&self) -> &str {
        &self.node
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn context(&self) -> &MaintenanceContext {
        &self.context
    }

    pub fn status(&self) -> Status {
        match self.derive_status() {
            Ok(status) => status,
            Err(e) => {
                warn!("no se pudo derivar el estado de {}: {}", self.name, e);
                Status::Error
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    pub fn is_complete(&self) -> bool {
        self.status() == Status::Complete
    }

    /// Registro de esta corrida, si existe y corresponde a nuestro contexto.
    fn current_task(&self) -> Result<Option<MaintenanceTask>, PlanError> {
        Ok(self
            .registry
            .get(&self.name)?
            .filter(|task| task.context == self.context))
    }

    fn live_report(&self, task: &MaintenanceTask) -> Result<Option<ExecutionReport>, PlanError> {
        self.registry.state_store().fetch_status(&task.task_id)
    }

    fn derive_status(&self) -> Result<Status, PlanError> {
        // sin registro, o registro de una corrida anterior
        let Some(task) = self.current_task()? else {
            return Ok(Status::Pending);
        };

        match task.state {
            Some(s) if s.is_success() => return Ok(Status::Complete),
            Some(s) if s.is_failure() => return Ok(Status::Error),
            _ => {}
        }

        // el registro puede ir atrasado respecto del cluster: manda lo que se ve en vivo
        let live = self.live_report(&task)?.map(|r| r.state);
        match live {
            Some(s) if s.is_success() => return Ok(Status::Complete),
            Some(s) if s.is_failure() => return Ok(Status::Error),
            _ => {}
        }

        Ok(match task.state.or(live) {
            None => Status::Pending,
            Some(ExecutionState::Staging) | Some(ExecutionState::Starting) => Status::Starting,
            Some(_) => Status::InProgress,
        })
    }

    /// Último reporte conocido (el más reciente entre registro y estado en vivo).
    pub fn last_report(&self) -> Option<ExecutionReport> {
        let task = self.current_task().ok().flatten()?;
        let live = self.live_report(&task).ok().flatten();
        match (task.last_report, live) {
            (Some(stored), Some(live)) if live.timestamp < stored.timestamp => Some(stored),
            (stored, live) => live.or(stored),
        }
    }

    /// Pide los recursos para lanzar la tarea. Sólo válido en PENDING.
    ///
    /// Devolver un requerimiento no cambia el estado: el step sigue PENDING
    /// hasta que llega un reporte de la tarea lanzada.
    pub fn start(&self) -> Result<Option<ResourceRequirement>, PlanError> {
        let status = self.status();
        if status != Status::Pending {
            return Err(PlanError::IllegalStateTransition {
                step: self.name.clone(),
                status,
            });
        }

        let daemon = self.registry.daemons()?.remove(&self.node).flatten();
        let Some(daemon) = daemon else {
            debug!("nodo {} todavía no está listo, {} sigue pendiente", self.node, self.name);
            return Ok(None);
        };

        let task = self
            .registry
            .get_or_create(&daemon, self.task_type, &self.context)?;

        // otra evaluación pudo haberla terminado antes que nosotros
        let live_done = self
            .live_report(&task)?
            .map(|r| r.state.is_success())
            .unwrap_or(false);
        if task.is_complete() || live_done {
            info!("{} ya estaba completa, no se emite requerimiento", self.name);
            return Ok(None);
        }

        let requirement = self.provider.update_requirement(&task, &daemon)?;
        info!(
            "{}: requerimiento emitido para agente {} (cpus={}, mem={}MB)",
            self.name, requirement.agent_id, requirement.cpus, requirement.mem_mb
        );
        Ok(Some(requirement))
    }

    /// Aplica un reporte si corresponde a la tarea de este step.
    /// Devuelve `false` si el reporte es de otra tarea.
    pub fn update(&self, report: &ExecutionReport) -> Result<bool, PlanError> {
        let Some(task) = self.current_task()? else {
            return Ok(false);
        };
        if task.task_id != report.task_id {
            return Ok(false);
        }

        self.registry.update(report)?;
        debug!("{} -> {:?}", self.name, report.state);
        Ok(true)
    }
}
