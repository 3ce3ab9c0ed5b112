use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::context::MaintenanceContext;
use crate::error::PlanError;
use crate::registry::TaskRegistry;
use crate::requirement::RequirementProvider;
use crate::step::{MaintenanceStep, Status};
use crate::task::{ExecutionReport, TaskType};

/// Operaciones que se pueden lanzar sobre el cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Compact,
    Cleanup,
    Repair,
    Backup,
    Restore,
}

impl OperationKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compact" => Some(OperationKind::Compact),
            "cleanup" => Some(OperationKind::Cleanup),
            "repair" => Some(OperationKind::Repair),
            "backup" => Some(OperationKind::Backup),
            "restore" => Some(OperationKind::Restore),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Compact => "compact",
            OperationKind::Cleanup => "cleanup",
            OperationKind::Repair => "repair",
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
        }
    }

    /// Fases de la operación, en orden: (tipo de tarea, estrategia).
    fn phases(self) -> Vec<(TaskType, Strategy)> {
        match self {
            OperationKind::Compact => vec![(TaskType::Compact, Strategy::Parallel)],
            OperationKind::Cleanup => vec![(TaskType::Cleanup, Strategy::Parallel)],
            // repair va de a un nodo por vez
            OperationKind::Repair => vec![(TaskType::Repair, Strategy::Serial)],
            OperationKind::Backup => vec![
                (TaskType::BackupSnapshot, Strategy::Parallel),
                (TaskType::BackupUpload, Strategy::Parallel),
            ],
            OperationKind::Restore => vec![
                (TaskType::DownloadSnapshot, Strategy::Parallel),
                (TaskType::RestoreSnapshot, Strategy::Parallel),
            ],
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Todos los steps pendientes de la fase se pueden arrancar a la vez.
    #[default]
    Parallel,
    /// De a un step por vez, en orden.
    Serial,
}

/// Agregación común a fases y planes.
pub fn aggregate<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
    let mut all_complete = true;
    let mut any_started = false;
    let mut any_error = false;

    for s in statuses {
        match s {
            Status::Complete => any_started = true,
            Status::Error => {
                any_error = true;
                all_complete = false;
            }
            Status::Pending => all_complete = false,
            _ => {
                all_complete = false;
                any_started = true;
            }
        }
    }

    if any_error {
        Status::Error
    } else if all_complete {
        Status::Complete
    } else if any_started {
        Status::InProgress
    } else {
        Status::Pending
    }
}

#[derive(Debug, Clone)]
pub struct Phase {
    pub id: Uuid,
    pub name: String,
    pub strategy: Strategy,
    pub steps: Vec<MaintenanceStep>,
}

impl Phase {
    pub fn new(name: impl Into<String>, strategy: Strategy, steps: Vec<MaintenanceStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            strategy,
            steps,
        }
    }

    pub fn status(&self) -> Status {
        aggregate(self.steps.iter().map(MaintenanceStep::status))
    }

    pub fn is_complete(&self) -> bool {
        self.status() == Status::Complete
    }

    /// Steps a los que se les puede llamar `start()` ahora.
    pub fn candidate_steps(&self) -> Vec<&MaintenanceStep> {
        match self.strategy {
            Strategy::Parallel => self.steps.iter().filter(|s| s.is_pending()).collect(),
            Strategy::Serial => self
                .steps
                .iter()
                .find(|s| !s.is_complete())
                .filter(|s| s.is_pending())
                .into_iter()
                .collect(),
        }
    }
}

/// Step en ERROR con su último reporte tal como llegó.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub step: String,
    pub report: Option<ExecutionReport>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub phases: Vec<Phase>,
}

impl Plan {
    pub fn new(name: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            phases,
        }
    }

    pub fn status(&self) -> Status {
        aggregate(self.phases.iter().map(Phase::status))
    }

    pub fn is_complete(&self) -> bool {
        self.status() == Status::Complete
    }

    /// Candidatos de la primera fase sin completar. Las fases siguientes
    /// esperan a que ésta termine.
    pub fn candidate_steps(&self) -> Vec<&MaintenanceStep> {
        self.phases
            .iter()
            .find(|p| !p.is_complete())
            .map(Phase::candidate_steps)
            .unwrap_or_default()
    }

    pub fn steps(&self) -> impl Iterator<Item = &MaintenanceStep> {
        self.phases.iter().flat_map(|p| p.steps.iter())
    }

    pub fn step(&self, name: &str) -> Option<&MaintenanceStep> {
        self.steps().find(|s| s.name() == name)
    }

    /// Reparte un reporte a todos los steps; sólo el dueño lo aplica.
    pub fn update(&self, report: &ExecutionReport) -> Result<bool, PlanError> {
        let mut applied = false;
        for step in self.steps() {
            applied |= step.update(report)?;
        }
        Ok(applied)
    }

    /// Borra los registros que dejó una corrida anterior de estos mismos
    /// steps, para que la corrida nueva arranque de cero.
    pub fn clear_previous_run(&self, registry: &dyn TaskRegistry) -> Result<(), PlanError> {
        for step in self.steps() {
            if registry.remove(step.name())?.is_some() {
                info!("descartado registro anterior de {}", step.name());
            }
        }
        Ok(())
    }

    pub fn errors(&self) -> Vec<StepError> {
        self.steps()
            .filter(|s| s.status() == Status::Error)
            .map(|s| StepError {
                step: s.name().to_string(),
                report: s.last_report(),
            })
            .collect()
    }

    /// `Err(ExecutionFailed)` con el primer step fallido, si lo hay.
    pub fn check(&self) -> Result<(), PlanError> {
        match self.errors().into_iter().next() {
            None => Ok(()),
            Some(err) => Err(PlanError::ExecutionFailed {
                message: err
                    .report
                    .and_then(|r| r.message)
                    .unwrap_or_else(|| "sin mensaje".to_string()),
                step: err.step,
            }),
        }
    }

    /// Borra el registro de un step en ERROR para que el próximo ciclo
    /// de ofertas lo vuelva a lanzar.
    pub fn restart(&self, name: &str, registry: &dyn TaskRegistry) -> Result<(), PlanError> {
        let step = self
            .step(name)
            .ok_or_else(|| PlanError::UnknownStep(name.to_string()))?;

        let status = step.status();
        if status != Status::Error {
            return Err(PlanError::IllegalStateTransition {
                step: name.to_string(),
                status,
            });
        }

        registry.remove(name)?;
        info!("step {} reiniciado", name);
        Ok(())
    }

    pub fn info(&self) -> PlanInfo {
        PlanInfo {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            status: self.status(),
            phases: self
                .phases
                .iter()
                .map(|p| PhaseInfo {
                    id: p.id,
                    name: p.name.clone(),
                    strategy: p.strategy,
                    status: p.status(),
                    steps: p
                        .steps
                        .iter()
                        .map(|s| StepInfo {
                            name: s.name().to_string(),
                            node: s.daemon().to_string(),
                            status: s.status(),
                        })
                        .collect(),
                })
                .collect(),
            errors: self.errors(),
        }
    }
}

/// Nodos destino: la lista del contexto, o todos los daemons conocidos si pide "*".
fn target_nodes(
    context: &MaintenanceContext,
    registry: &dyn TaskRegistry,
) -> Result<Vec<String>, PlanError> {
    let mut nodes: Vec<String> = if context.all_nodes() {
        registry.daemons()?.into_keys().collect()
    } else {
        context.nodes.clone()
    };
    nodes.sort();
    nodes.dedup();
    Ok(nodes)
}

/// Arma el plan de una operación: una fase por tipo de tarea, un step por nodo.
pub fn build_plan(
    kind: OperationKind,
    context: MaintenanceContext,
    registry: Arc<dyn TaskRegistry>,
    provider: Arc<dyn RequirementProvider>,
) -> Result<Plan, PlanError> {
    let nodes = target_nodes(&context, registry.as_ref())?;

    let phases = kind
        .phases()
        .into_iter()
        .map(|(task_type, strategy)| {
            let steps = nodes
                .iter()
                .map(|node| {
                    MaintenanceStep::new(
                        node.clone(),
                        task_type,
                        context.clone(),
                        registry.clone(),
                        provider.clone(),
                    )
                })
                .collect();
            Phase::new(task_type.prefix(), strategy, steps)
        })
        .collect();

    info!("plan {} armado para {} nodos", kind, nodes.len());
    Ok(Plan::new(kind.as_str(), phases))
}

/* --------- Vistas serializables para la API --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub name: String,
    pub node: String,
    pub status: Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseInfo {
    pub id: Uuid,
    pub name: String,
    pub strategy: Strategy,
    pub status: Status,
    pub steps: Vec<StepInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanInfo {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: Status,
    pub phases: Vec<PhaseInfo>,
    pub errors: Vec<StepError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use crate::requirement::TemplateRequirementProvider;
    use crate::task::{DaemonTask, ExecutionState};

    fn setup(nodes: &[&str]) -> (InMemoryRegistry, Arc<dyn RequirementProvider>) {
        let reg = InMemoryRegistry::new();
        for (i, n) in nodes.iter().enumerate() {
            reg.put_daemon(DaemonTask::new(*n, format!("agent-{}", i), format!("host-{}", i)))
                .unwrap();
        }
        (reg, Arc::new(TemplateRequirementProvider::with_defaults()))
    }

    fn all() -> MaintenanceContext {
        MaintenanceContext::create(vec!["*".into()], vec![], vec![])
    }

    /// Lanza el step y reporta el estado dado para su tarea.
    fn drive(step: &MaintenanceStep, state: ExecutionState) {
        let req = step.start().unwrap().unwrap();
        step.update(&ExecutionReport::new(req.task_id, state)).unwrap();
    }

    #[test]
    fn agregacion_de_estados() {
        use Status::*;
        assert_eq!(aggregate([Complete, Pending]), InProgress);
        assert_eq!(aggregate([Complete, Complete]), Complete);
        assert_eq!(aggregate([Complete, Error, Pending]), Error);
        assert_eq!(aggregate([Pending, Pending]), Pending);
        assert_eq!(aggregate([Pending, Starting]), InProgress);
        assert_eq!(aggregate(Vec::<Status>::new()), Complete);
    }

    #[test]
    fn fase_con_un_step_completo_y_otro_pendiente_esta_en_progreso() {
        let (reg, provider) = setup(&["node-0", "node-1"]);
        let plan = build_plan(OperationKind::Compact, all(), Arc::new(reg), provider).unwrap();
        let phase = &plan.phases[0];
        assert_eq!(phase.status(), Status::Pending);

        drive(&phase.steps[0], ExecutionState::Finished);
        assert_eq!(phase.status(), Status::InProgress);

        drive(&phase.steps[1], ExecutionState::Finished);
        assert_eq!(phase.status(), Status::Complete);
        assert!(plan.is_complete());
    }

    #[test]
    fn un_error_domina_la_fase() {
        let (reg, provider) = setup(&["node-0", "node-1"]);
        let plan = build_plan(OperationKind::Cleanup, all(), Arc::new(reg), provider).unwrap();

        drive(&plan.phases[0].steps[0], ExecutionState::Finished);
        drive(&plan.phases[0].steps[1], ExecutionState::Lost);

        assert_eq!(plan.phases[0].status(), Status::Error);
        assert_eq!(plan.status(), Status::Error);
    }

    #[test]
    fn fase_paralela_ofrece_todos_los_pendientes() {
        let (reg, provider) = setup(&["node-0", "node-1", "node-2"]);
        let plan = build_plan(OperationKind::Compact, all(), Arc::new(reg), provider).unwrap();

        let names: Vec<&str> = plan.candidate_steps().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["compact-node-0", "compact-node-1", "compact-node-2"]);
    }

    #[test]
    fn fase_serial_ofrece_de_a_uno() {
        let (reg, provider) = setup(&["node-0", "node-1"]);
        let plan = build_plan(OperationKind::Repair, all(), Arc::new(reg), provider).unwrap();

        let first = plan.candidate_steps();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name(), "repair-node-0");

        // en curso: nadie más es candidato
        drive(first[0], ExecutionState::Running);
        assert!(plan.candidate_steps().is_empty());

        let task_id = plan.step("repair-node-0").unwrap().last_report().unwrap().task_id;
        plan.update(&ExecutionReport::new(task_id, ExecutionState::Finished))
            .unwrap();
        let next = plan.candidate_steps();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].name(), "repair-node-1");
    }

    #[test]
    fn fases_se_habilitan_en_orden() {
        let (reg, provider) = setup(&["node-0"]);
        let ctx = all().with_backup("snap-1", "s3://bucket/backups");
        let plan = build_plan(OperationKind::Backup, ctx, Arc::new(reg), provider).unwrap();
        assert_eq!(plan.phases.len(), 2);

        let c = plan.candidate_steps();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].name(), "backup-node-0");

        drive(c[0], ExecutionState::Finished);
        let c = plan.candidate_steps();
        assert_eq!(c[0].name(), "upload-node-0");
        assert_eq!(plan.status(), Status::InProgress);
    }

    #[test]
    fn errores_exponen_nombre_y_reporte() {
        let (reg, provider) = setup(&["node-0"]);
        let reg = Arc::new(reg);
        let plan = build_plan(OperationKind::Compact, all(), reg.clone(), provider).unwrap();
        let step = &plan.phases[0].steps[0];
        let req = step.start().unwrap().unwrap();
        let report = ExecutionReport::new(req.task_id, ExecutionState::Failed)
            .with_message("disco lleno");
        plan.update(&report).unwrap();

        let errors = plan.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].step, "compact-node-0");
        assert_eq!(errors[0].report, Some(report));
        assert_eq!(
            plan.check(),
            Err(PlanError::ExecutionFailed {
                step: "compact-node-0".into(),
                message: "disco lleno".into(),
            })
        );

        let info = plan.info();
        assert_eq!(info.status, Status::Error);
        assert_eq!(info.errors.len(), 1);
    }

    #[test]
    fn restart_limpia_solo_steps_en_error() {
        let (reg, provider) = setup(&["node-0"]);
        let reg = Arc::new(reg);
        let plan = build_plan(OperationKind::Compact, all(), reg.clone(), provider).unwrap();
        let step = &plan.phases[0].steps[0];

        assert!(matches!(
            plan.restart("compact-node-0", reg.as_ref()),
            Err(PlanError::IllegalStateTransition { .. })
        ));
        assert_eq!(
            plan.restart("compact-node-9", reg.as_ref()),
            Err(PlanError::UnknownStep("compact-node-9".into()))
        );

        drive(step, ExecutionState::Failed);
        plan.restart("compact-node-0", reg.as_ref()).unwrap();
        assert!(step.is_pending());
        assert!(step.start().unwrap().is_some());
    }

    #[test]
    fn nodos_explicitos_sin_daemon_quedan_pendientes() {
        let (reg, provider) = setup(&["node-0"]);
        let ctx = MaintenanceContext::create(vec!["node-5".into()], vec![], vec![]);
        let plan = build_plan(OperationKind::Compact, ctx, Arc::new(reg), provider).unwrap();

        let step = &plan.phases[0].steps[0];
        assert_eq!(step.name(), "compact-node-5");
        assert!(step.start().unwrap().is_none());
        assert_eq!(plan.status(), Status::Pending);
    }

    #[test]
    fn corrida_nueva_no_hereda_tareas_terminadas() {
        let (reg, provider) = setup(&["node-0"]);
        let reg = Arc::new(reg);
        let first = build_plan(OperationKind::Compact, all(), reg.clone(), provider.clone()).unwrap();
        drive(&first.phases[0].steps[0], ExecutionState::Finished);
        assert!(first.is_complete());

        // mismo contexto: sin limpiar, la corrida nueva ya "estaría" completa
        let second = build_plan(OperationKind::Compact, all(), reg.clone(), provider).unwrap();
        assert!(second.is_complete());

        second.clear_previous_run(reg.as_ref()).unwrap();
        assert_eq!(second.status(), Status::Pending);
    }

    #[test]
    fn operacion_se_parsea_por_nombre() {
        assert_eq!(OperationKind::parse("repair"), Some(OperationKind::Repair));
        assert_eq!(OperationKind::parse("upgrade"), None);
    }
}
