use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use common::{
    build_plan, AgentHeartbeatRequest, AgentHeartbeatResponse, AgentMetrics, AgentRegisterRequest,
    AgentRegisterResponse, DaemonTask, ExecutionReport, ExecutionState, MaintenanceContext,
    OperationKind, OperationRequest, PlanError, PlanInfo, Status, TaskLaunchRequest,
    TaskLaunchResponse, TaskRegistry, TaskStatusRequest, TaskStatusResponse,
};
use std::collections::VecDeque;
use std::time::SystemTime;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::offers::apply_report;
use crate::state::{AgentMeta, AppState};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/plan", get(get_plan).delete(abandon_plan))
        .route("/v1/plan/restart/:step", post(restart_step))
        .route("/v1/operations/:operation/start", put(start_operation))
        .route("/v1/agents", get(list_agents))
        .route("/v1/agents/register", post(register_agent))
        .route("/v1/agents/heartbeat", post(agent_heartbeat))
        .route("/v1/tasks/next", post(next_task))
        .route("/v1/tasks/status", post(task_status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Vista del plan activo
async fn get_plan(State(state): State<AppState>) -> Result<Json<PlanInfo>, StatusCode> {
    let plan = state
        .plan
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    plan.as_ref()
        .map(|p| Json(p.info()))
        .ok_or(StatusCode::NOT_FOUND)
}

// Abandona el plan activo: se deja de evaluar, las tareas ya lanzadas siguen su curso
async fn abandon_plan(State(state): State<AppState>) -> Result<Json<PlanInfo>, StatusCode> {
    let mut plan = state
        .plan
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let abandoned = plan.take().ok_or(StatusCode::NOT_FOUND)?;
    let info = abandoned.info();
    warn!(
        "plan {} ({}) abandonado en {:?}",
        abandoned.name, abandoned.id, info.status
    );

    Ok(Json(info))
}

// Arma y activa el plan de una operación (compact, cleanup, repair, backup, restore)
async fn start_operation(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    Json(req): Json<OperationRequest>,
) -> Result<Json<PlanInfo>, StatusCode> {
    let kind = OperationKind::parse(&operation).ok_or(StatusCode::BAD_REQUEST)?;
    let context: MaintenanceContext = req.into();

    let mut plan = state
        .plan
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if let Some(current) = plan.as_ref() {
        let status = current.status();
        if !matches!(status, Status::Complete | Status::Error) {
            warn!(
                "rechazando {}: el plan {} sigue en {:?}",
                kind, current.name, status
            );
            return Err(StatusCode::CONFLICT);
        }
    }

    let new_plan = build_plan(
        kind,
        context,
        state.registry.clone(),
        state.provider.clone(),
    )
    .and_then(|p| {
        p.clear_previous_run(state.registry.as_ref())?;
        Ok(p)
    })
    .map_err(|e| {
        warn!("no se pudo armar el plan {}: {}", kind, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    info!(
        "plan {} ({}) activado con {} fases",
        new_plan.name,
        new_plan.id,
        new_plan.phases.len()
    );
    let info = new_plan.info();
    *plan = Some(new_plan);

    Ok(Json(info))
}

// Limpia un step en ERROR para que el loop de ofertas lo vuelva a lanzar
async fn restart_step(
    State(state): State<AppState>,
    Path(step): Path<String>,
) -> Result<Json<PlanInfo>, StatusCode> {
    let plan = state
        .plan
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let plan = plan.as_ref().ok_or(StatusCode::NOT_FOUND)?;

    match plan.restart(&step, state.registry.as_ref()) {
        Ok(()) => Ok(Json(plan.info())),
        Err(PlanError::UnknownStep(_)) => Err(StatusCode::NOT_FOUND),
        Err(PlanError::IllegalStateTransition { .. }) => Err(StatusCode::CONFLICT),
        Err(e) => {
            warn!("error reiniciando {}: {}", step, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// Registra un agente y el daemon de su nodo
async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentRegisterRequest>,
) -> Result<Json<AgentRegisterResponse>, StatusCode> {
    let agent_id = uuid::Uuid::new_v4().to_string();
    let daemon = DaemonTask::new(req.node_id.clone(), agent_id.clone(), req.hostname.clone());
    let daemon_task_id = daemon.task_id.clone();

    state
        .registry
        .put_daemon(daemon)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut orphaned: Vec<ExecutionReport> = Vec::new();
    {
        let mut agents = state
            .agents
            .lock()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        // un agente nuevo para el mismo nodo reemplaza al anterior;
        // lo que tenía lanzado se da por perdido
        for (old_id, meta) in agents.iter_mut() {
            if meta.node_id == req.node_id && !meta.dead {
                info!("agente {} reemplazado en nodo {}", old_id, req.node_id);
                meta.dead = true;

                let message = format!("agente {} reemplazado", old_id);
                for task in meta.in_flight.take().into_iter().chain(meta.queue.drain(..)) {
                    meta.tasks_failed += 1;
                    orphaned.push(
                        ExecutionReport::new(task.task_id, ExecutionState::Lost)
                            .with_message(message.clone()),
                    );
                }
            }
        }

        agents.insert(
            agent_id.clone(),
            AgentMeta {
                node_id: req.node_id.clone(),
                hostname: req.hostname,
                daemon_task_id: daemon_task_id.clone(),
                last_heartbeat: SystemTime::now(),
                dead: false,
                cpus: req.cpus,
                mem_mb: req.mem_mb,
                disk_mb: req.disk_mb,
                queue: VecDeque::new(),
                in_flight: None,
                tasks_launched: 0,
                tasks_finished: 0,
                tasks_failed: 0,
            },
        );
    }

    for report in &orphaned {
        apply_report(&state, report).map_err(|e| {
            warn!("no se pudo marcar perdida {}: {}", report.task_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    }

    info!(
        "agente registrado: {} (nodo={}, cpus={}, mem={}MB)",
        agent_id, req.node_id, req.cpus, req.mem_mb
    );
    Ok(Json(AgentRegisterResponse {
        agent_id,
        daemon_task_id,
    }))
}

// Heartbeat de agente. Un agente muerto tiene que volver a registrarse.
async fn agent_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<AgentHeartbeatRequest>,
) -> Result<Json<AgentHeartbeatResponse>, StatusCode> {
    let mut agents = state
        .agents
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match agents.get_mut(&req.agent_id) {
        Some(meta) if !meta.dead => {
            meta.last_heartbeat = SystemTime::now();
            Ok(Json(AgentHeartbeatResponse { ok: true }))
        }
        _ => Err(StatusCode::NOT_FOUND),
    }
}

// El agente retira la próxima tarea lanzada para él (si hay)
async fn next_task(
    State(state): State<AppState>,
    Json(req): Json<TaskLaunchRequest>,
) -> Result<Json<TaskLaunchResponse>, StatusCode> {
    let mut agents = state
        .agents
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let meta = match agents.get_mut(&req.agent_id) {
        Some(meta) if !meta.dead => meta,
        _ => return Err(StatusCode::NOT_FOUND),
    };

    if meta.in_flight.is_some() {
        return Ok(Json(TaskLaunchResponse { task: None }));
    }

    let task = meta.queue.pop_front();
    if let Some(ref t) = task {
        info!("agente {} retira {} ({})", req.agent_id, t.task_name, t.task_id);
        meta.in_flight = Some(t.clone());
    }

    Ok(Json(TaskLaunchResponse { task }))
}

// El agente reporta el estado de una tarea
async fn task_status(
    State(state): State<AppState>,
    Json(req): Json<TaskStatusRequest>,
) -> Result<Json<TaskStatusResponse>, StatusCode> {
    let report = req.report;

    {
        let mut agents = state
            .agents
            .lock()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let meta = agents.get_mut(&req.agent_id).ok_or(StatusCode::NOT_FOUND)?;

        // sólo el agente al que se le lanzó la tarea puede reportarla
        if meta.dead || !meta.owns(&report.task_id) {
            warn!(
                "reporte {:?} de {} rechazado: el agente {} no la tiene asignada{}",
                report.state,
                report.task_id,
                req.agent_id,
                if meta.dead { " (agente muerto)" } else { "" }
            );
            return Err(StatusCode::CONFLICT);
        }

        let in_flight = meta
            .in_flight
            .as_ref()
            .map(|t| t.task_id == report.task_id)
            .unwrap_or(false);

        if in_flight && report.state.is_terminal() {
            meta.in_flight = None;
            if report.state == ExecutionState::Finished {
                meta.tasks_finished += 1;
            } else {
                meta.tasks_failed += 1;
            }
        }
    }

    info!(
        "estado de {}: {:?} {}",
        report.task_id,
        report.state,
        report.message.as_deref().unwrap_or("")
    );

    apply_report(&state, &report).map_err(|e| {
        warn!("no se pudo aplicar el reporte de {}: {}", report.task_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(TaskStatusResponse { ok: true }))
}

async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<AgentMetrics>>, StatusCode> {
    let now = SystemTime::now();

    let agents = state
        .agents
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut out: Vec<AgentMetrics> = agents
        .iter()
        .map(|(agent_id, meta)| AgentMetrics {
            agent_id: agent_id.clone(),
            node_id: meta.node_id.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            last_heartbeat_secs_ago: now
                .duration_since(meta.last_heartbeat)
                .unwrap_or_default()
                .as_secs(),
            in_flight: meta.in_flight.as_ref().map(|t| t.task_name.clone()),
            queued: meta.queue.len() as u32,
            tasks_launched: meta.tasks_launched,
            tasks_finished: meta.tasks_finished,
            tasks_failed: meta.tasks_failed,
        })
        .collect();
    out.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    Ok(Json(out))
}
