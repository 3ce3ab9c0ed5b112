use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, info};

use crate::context::MaintenanceContext;
use crate::error::PlanError;
use crate::task::{DaemonTask, ExecutionReport, MaintenanceTask, NodeId, TaskId, TaskType};

/// Fuente de estado "en vivo" del cluster manager.
pub trait StatusSource: Send + Sync {
    /// `None` = nunca se reportó nada para esa tarea (no es un fallo).
    fn fetch_status(&self, task_id: &str) -> Result<Option<ExecutionReport>, PlanError>;

    /// Guarda el último reporte recibido para una tarea. Un estado terminal
    /// ya guardado no se reemplaza.
    fn record(&self, report: &ExecutionReport) -> Result<(), PlanError>;
}

/// Registro durable de tareas daemon y de mantenimiento.
pub trait TaskRegistry: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<MaintenanceTask>, PlanError>;

    /// Devuelve el registro existente si coincide nodo + tipo + contexto;
    /// si no, crea uno nuevo (reemplazando al anterior). Atómico.
    fn get_or_create(
        &self,
        daemon: &DaemonTask,
        task_type: TaskType,
        context: &MaintenanceContext,
    ) -> Result<MaintenanceTask, PlanError>;

    /// Nodo -> daemon. `None` significa que el nodo todavía no está listo.
    fn daemons(&self) -> Result<HashMap<NodeId, Option<DaemonTask>>, PlanError>;

    fn put_daemon(&self, daemon: DaemonTask) -> Result<(), PlanError>;

    /// Aplica un reporte al registro dueño del task id. `false` si nadie lo es.
    fn update(&self, report: &ExecutionReport) -> Result<bool, PlanError>;

    fn remove(&self, name: &str) -> Result<Option<MaintenanceTask>, PlanError>;

    fn tasks(&self) -> Result<Vec<MaintenanceTask>, PlanError>;

    fn state_store(&self) -> Arc<dyn StatusSource>;
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, PlanError> {
    m.lock().map_err(|_| PlanError::Store(format!("lock {}", what)))
}

/// Implementación en memoria: registro de tareas + feed de estado.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    daemons: Arc<Mutex<HashMap<NodeId, DaemonTask>>>,
    // tareas de mantenimiento por nombre ("compact-node-0")
    tasks: Arc<Mutex<HashMap<String, MaintenanceTask>>>,
    // último reporte en vivo por task id
    statuses: Arc<Mutex<HashMap<TaskId, ExecutionReport>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn daemon(&self, node: &str) -> Result<Option<DaemonTask>, PlanError> {
        Ok(lock(&self.daemons, "daemons")?.get(node).cloned())
    }
}

impl TaskRegistry for InMemoryRegistry {
    fn get(&self, name: &str) -> Result<Option<MaintenanceTask>, PlanError> {
        Ok(lock(&self.tasks, "tasks")?.get(name).cloned())
    }

    fn get_or_create(
        &self,
        daemon: &DaemonTask,
        task_type: TaskType,
        context: &MaintenanceContext,
    ) -> Result<MaintenanceTask, PlanError> {
        let name = task_type.task_name(&daemon.node_id);
        let mut tasks = lock(&self.tasks, "tasks")?;

        if let Some(existing) = tasks.get(&name) {
            if existing.node_id == daemon.node_id
                && existing.task_type == task_type
                && existing.context == *context
            {
                return Ok(existing.clone());
            }
            info!(
                "reemplazando tarea {} ({}) por un contexto nuevo",
                name, existing.task_id
            );
        }

        let task = MaintenanceTask::new(daemon, task_type, context.clone());
        debug!("creada tarea {} ({})", task.name, task.task_id);
        tasks.insert(name, task.clone());
        Ok(task)
    }

    fn daemons(&self) -> Result<HashMap<NodeId, Option<DaemonTask>>, PlanError> {
        let daemons = lock(&self.daemons, "daemons")?;
        Ok(daemons
            .iter()
            .map(|(node, d)| (node.clone(), d.is_ready().then(|| d.clone())))
            .collect())
    }

    fn put_daemon(&self, daemon: DaemonTask) -> Result<(), PlanError> {
        let mut daemons = lock(&self.daemons, "daemons")?;
        daemons.insert(daemon.node_id.clone(), daemon);
        Ok(())
    }

    fn update(&self, report: &ExecutionReport) -> Result<bool, PlanError> {
        {
            let mut tasks = lock(&self.tasks, "tasks")?;
            if let Some(task) = tasks.values_mut().find(|t| t.task_id == report.task_id) {
                task.apply(report);
                return Ok(true);
            }
        }

        let mut daemons = lock(&self.daemons, "daemons")?;
        if let Some(daemon) = daemons.values_mut().find(|d| d.task_id == report.task_id) {
            daemon.state = report.state;
            return Ok(true);
        }

        Ok(false)
    }

    fn remove(&self, name: &str) -> Result<Option<MaintenanceTask>, PlanError> {
        let removed = lock(&self.tasks, "tasks")?.remove(name);
        if let Some(ref task) = removed {
            // el estado en vivo de esa corrida ya no le sirve a nadie
            lock(&self.statuses, "statuses")?.remove(&task.task_id);
        }
        Ok(removed)
    }

    fn tasks(&self) -> Result<Vec<MaintenanceTask>, PlanError> {
        let mut out: Vec<MaintenanceTask> = lock(&self.tasks, "tasks")?.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn state_store(&self) -> Arc<dyn StatusSource> {
        Arc::new(self.clone())
    }
}

impl StatusSource for InMemoryRegistry {
    fn fetch_status(&self, task_id: &str) -> Result<Option<ExecutionReport>, PlanError> {
        Ok(lock(&self.statuses, "statuses")?.get(task_id).cloned())
    }

    fn record(&self, report: &ExecutionReport) -> Result<(), PlanError> {
        let mut statuses = lock(&self.statuses, "statuses")?;
        if let Some(current) = statuses.get(&report.task_id) {
            if current.state.is_terminal() {
                debug!(
                    "{}: ignorando {:?} en vivo, ya terminó en {:?}",
                    report.task_id, report.state, current.state
                );
                return Ok(());
            }
        }
        statuses.insert(report.task_id.clone(), report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ExecutionState;

    fn ctx(ks: &str) -> MaintenanceContext {
        MaintenanceContext::create(vec!["*".into()], vec![ks.into()], vec![])
    }

    #[test]
    fn get_or_create_es_idempotente() {
        let reg = InMemoryRegistry::new();
        let daemon = DaemonTask::new("node-0", "agent-0", "host-0");

        let a = reg.get_or_create(&daemon, TaskType::Compact, &ctx("ks")).unwrap();
        let b = reg.get_or_create(&daemon, TaskType::Compact, &ctx("ks")).unwrap();

        assert_eq!(a.task_id, b.task_id);
        assert_eq!(reg.tasks().unwrap().len(), 1);
        assert_eq!(reg.get("compact-node-0").unwrap(), Some(a));
    }

    #[test]
    fn contexto_nuevo_reemplaza_la_tarea() {
        let reg = InMemoryRegistry::new();
        let daemon = DaemonTask::new("node-0", "agent-0", "host-0");

        let a = reg.get_or_create(&daemon, TaskType::Compact, &ctx("ks1")).unwrap();
        let b = reg.get_or_create(&daemon, TaskType::Compact, &ctx("ks2")).unwrap();

        assert_ne!(a.task_id, b.task_id);
        let stored = reg.get("compact-node-0").unwrap().unwrap();
        assert_eq!(stored.task_id, b.task_id);
        assert_eq!(reg.tasks().unwrap().len(), 1);
    }

    #[test]
    fn daemon_no_running_se_ve_como_no_listo() {
        let reg = InMemoryRegistry::new();
        let mut lost = DaemonTask::new("node-1", "agent-1", "host-1");
        lost.state = ExecutionState::Lost;
        reg.put_daemon(DaemonTask::new("node-0", "agent-0", "host-0")).unwrap();
        reg.put_daemon(lost).unwrap();

        let daemons = reg.daemons().unwrap();
        assert!(daemons["node-0"].is_some());
        assert!(daemons.contains_key("node-1"));
        assert!(daemons["node-1"].is_none());
    }

    #[test]
    fn update_aplica_a_mantenimiento_y_a_daemon() {
        let reg = InMemoryRegistry::new();
        let daemon = DaemonTask::new("node-0", "agent-0", "host-0");
        reg.put_daemon(daemon.clone()).unwrap();
        let task = reg.get_or_create(&daemon, TaskType::Repair, &ctx("ks")).unwrap();

        let applied = reg
            .update(&ExecutionReport::new(task.task_id.clone(), ExecutionState::Running))
            .unwrap();
        assert!(applied);
        assert_eq!(
            reg.get("repair-node-0").unwrap().unwrap().state,
            Some(ExecutionState::Running)
        );

        reg.update(&ExecutionReport::new(daemon.task_id.clone(), ExecutionState::Lost))
            .unwrap();
        assert_eq!(reg.daemon("node-0").unwrap().unwrap().state, ExecutionState::Lost);

        let unknown = reg
            .update(&ExecutionReport::new("otra", ExecutionState::Finished))
            .unwrap();
        assert!(!unknown);
    }

    #[test]
    fn status_ausente_no_es_fallo() {
        let reg = InMemoryRegistry::new();
        let store = reg.state_store();
        assert_eq!(store.fetch_status("compact-node-0__x").unwrap(), None);

        let report = ExecutionReport::new("compact-node-0__x", ExecutionState::Finished);
        store.record(&report).unwrap();
        // el state store comparte los mismos mapas que el registro
        assert_eq!(reg.fetch_status("compact-node-0__x").unwrap(), Some(report));
    }

    #[test]
    fn remove_borra_tambien_el_estado_en_vivo() {
        let reg = InMemoryRegistry::new();
        let daemon = DaemonTask::new("node-0", "agent-0", "host-0");
        let task = reg.get_or_create(&daemon, TaskType::Cleanup, &ctx("ks")).unwrap();
        reg.record(&ExecutionReport::new(task.task_id.clone(), ExecutionState::Failed))
            .unwrap();

        let removed = reg.remove("cleanup-node-0").unwrap();
        assert_eq!(removed.map(|t| t.task_id), Some(task.task_id.clone()));
        assert_eq!(reg.fetch_status(&task.task_id).unwrap(), None);
        assert_eq!(reg.remove("cleanup-node-0").unwrap(), None);
    }

    #[test]
    fn estado_en_vivo_terminal_no_retrocede() {
        let reg = InMemoryRegistry::new();
        reg.record(&ExecutionReport::new("t-1", ExecutionState::Finished)).unwrap();
        reg.record(&ExecutionReport::new("t-1", ExecutionState::Running)).unwrap();
        assert_eq!(
            reg.fetch_status("t-1").unwrap().map(|r| r.state),
            Some(ExecutionState::Finished)
        );
    }
}
