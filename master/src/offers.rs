use std::time::SystemTime;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use common::{
    AgentId, ExecutionReport, ExecutionState, LaunchedTask, Offer, PlanError, Status, StatusSource,
    TaskRegistry,
};

use crate::state::AppState;

/// Resultado de una pasada del loop de ofertas.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepOutcome {
    pub lost: usize,
    pub pruned: usize,
    pub launched: usize,
    pub plan_status: Option<Status>,
    pub failure: Option<PlanError>,
}

/// Loop principal de reconciliación:
/// - detecta agentes muertos (sin heartbeat)
/// - ofrece los recursos de los agentes libres al plan activo
pub async fn run_offer_loop(state: AppState) {
    let mut last_status: Option<Status> = None;

    loop {
        sleep(state.config.offer_interval).await;

        match sweep_once(&state, SystemTime::now()) {
            Ok(outcome) => {
                if outcome.plan_status != last_status {
                    if let Some(status) = outcome.plan_status {
                        info!("plan activo pasó a {:?}", status);
                    }
                    if let Some(ref failure) = outcome.failure {
                        error!("plan en ERROR: {}", failure);
                    }
                    last_status = outcome.plan_status;
                }
            }
            Err(e) => warn!("error en ciclo de ofertas: {}", e),
        }
    }
}

/// Aplica un reporte de ejecución: primero al feed en vivo, después al
/// step dueño de la tarea (o al registro, si es un daemon).
pub fn apply_report(state: &AppState, report: &ExecutionReport) -> Result<(), String> {
    state.registry.record(report).map_err(|e| e.to_string())?;

    let applied = {
        let plan = state.plan.lock().map_err(|_| "lock plan")?;
        match plan.as_ref() {
            Some(plan) => plan.update(report).map_err(|e| e.to_string())?,
            None => false,
        }
    };

    if !applied {
        state.registry.update(report).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Una pasada:
/// 1. marca agentes muertos, reporta LOST su daemon y sus tareas y los olvida
/// 2. arma una oferta por cada agente vivo y libre
/// 3. pide requerimientos a los steps candidatos y lanza los que entran
pub fn sweep_once(state: &AppState, now: SystemTime) -> Result<SweepOutcome, String> {
    let mut outcome = SweepOutcome::default();

    // 1) Detectar agentes muertos
    let mut lost_reports: Vec<ExecutionReport> = Vec::new();
    {
        let mut agents = state.agents.lock().map_err(|_| "lock agents")?;

        for (agent_id, meta) in agents.iter_mut() {
            if meta.dead {
                continue;
            }

            let elapsed = match now.duration_since(meta.last_heartbeat) {
                Ok(elapsed) => elapsed,
                // heartbeat en el futuro? lo ignoramos
                Err(_) => continue,
            };
            if elapsed <= state.config.agent_timeout {
                continue;
            }

            meta.dead = true;
            warn!(
                "marcando agente {} (nodo {}) como DEAD (sin heartbeat hace {:?})",
                agent_id, meta.node_id, elapsed
            );

            let message = format!("agente {} sin heartbeat hace {}s", agent_id, elapsed.as_secs());
            lost_reports.push(
                ExecutionReport::new(meta.daemon_task_id.clone(), ExecutionState::Lost)
                    .with_message(message.clone()),
            );

            let pending: Vec<LaunchedTask> =
                meta.in_flight.take().into_iter().chain(meta.queue.drain(..)).collect();
            for task in pending {
                meta.tasks_failed += 1;
                lost_reports.push(
                    ExecutionReport::new(task.task_id, ExecutionState::Lost)
                        .with_message(message.clone()),
                );
            }
        }
    }

    for report in &lost_reports {
        apply_report(state, report)?;
    }
    outcome.lost = lost_reports.len();

    // con sus reportes ya aplicados, los agentes muertos no hacen falta
    {
        let mut agents = state.agents.lock().map_err(|_| "lock agents")?;
        let before = agents.len();
        agents.retain(|agent_id, meta| {
            if meta.dead {
                debug!("olvidando agente muerto {} (nodo {})", agent_id, meta.node_id);
            }
            !meta.dead
        });
        outcome.pruned = before - agents.len();
    }

    // 2) Ofertas de los agentes libres
    let mut offers: Vec<Offer> = {
        let agents = state.agents.lock().map_err(|_| "lock agents")?;
        agents
            .iter()
            .filter_map(|(agent_id, meta)| meta.offer(agent_id))
            .collect()
    };

    // 3) Evaluar el plan contra las ofertas
    let mut launches: Vec<(AgentId, LaunchedTask)> = Vec::new();
    {
        let plan = state.plan.lock().map_err(|_| "lock plan")?;
        let Some(plan) = plan.as_ref() else {
            return Ok(outcome);
        };

        for step in plan.candidate_steps() {
            if offers.is_empty() {
                debug!("no quedan ofertas en este ciclo");
                break;
            }

            let requirement = match step.start() {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(e) => {
                    error!("no se pudo arrancar {}: {}", step.name(), e);
                    continue;
                }
            };

            let Some(pos) = offers.iter().position(|o| o.satisfies(&requirement)) else {
                debug!(
                    "ninguna oferta cubre {} (agente {})",
                    requirement.task_name, requirement.agent_id
                );
                continue;
            };
            let offer = offers.swap_remove(pos);

            // el requerimiento se cumplió: la tarea queda en STAGING
            let staging = ExecutionReport::new(requirement.task_id.clone(), ExecutionState::Staging)
                .with_message(format!("lanzada en agente {}", offer.agent_id));
            state.registry.record(&staging).map_err(|e| e.to_string())?;
            step.update(&staging).map_err(|e| e.to_string())?;

            info!(
                "lanzando {} ({}) en agente {}",
                requirement.task_name, requirement.task_id, offer.agent_id
            );
            launches.push((offer.agent_id, LaunchedTask::from(requirement)));
        }

        let status = plan.status();
        outcome.plan_status = Some(status);
        if status == Status::Error {
            outcome.failure = plan.check().err();
        }
    }

    // 4) Encolar las tareas lanzadas para que cada agente las retire
    if !launches.is_empty() {
        let mut agents = state.agents.lock().map_err(|_| "lock agents")?;
        for (agent_id, task) in launches {
            if let Some(meta) = agents.get_mut(&agent_id) {
                meta.tasks_launched += 1;
                meta.queue.push_back(task);
                outcome.launched += 1;
            }
        }
    }

    Ok(outcome)
}
