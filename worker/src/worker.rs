use anyhow::Result;
use common::{
    AgentHeartbeatRequest, AgentRegisterRequest, AgentRegisterResponse, ExecutionReport,
    ExecutionState, LaunchedTask, TaskLaunchRequest, TaskLaunchResponse, TaskStatusRequest,
    TaskType,
};
use reqwest::{Client, StatusCode};
use std::{env, future::Future, sync::Arc, time::Duration};
use sysinfo::{System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};

const DEFAULT_TASK_DURATION_MS: u64 = 2_000;
const DEFAULT_DISK_MB: u64 = 10_240;
const REPORT_FIRST_DELAY: Duration = Duration::from_millis(500);
const REPORT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Configuración del agente, desde variables de entorno.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub master_url: String,
    pub node_id: String,
    pub hostname: String,
    pub task_duration: Duration,
    pub poll_interval: Duration,
    /// Tipos de tarea que el agente hace fallar a propósito (pruebas de recuperación).
    pub fail_task_types: Vec<TaskType>,
    pub disk_mb: u64,
}

impl AgentConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, hostname: String) -> Self {
        let millis = |key: &str, default: u64| {
            lookup(key)
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(default)
        };

        let fail_task_types = lookup("FAIL_TASK_TYPES")
            .map(|s| {
                s.split(',')
                    .filter_map(|t| {
                        let t = t.trim().to_lowercase();
                        TaskType::ALL.iter().copied().find(|tt| tt.prefix() == t)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            master_url: lookup("MASTER_URL").unwrap_or_else(|| "http://master:8080".to_string()),
            node_id: lookup("NODE_ID").unwrap_or_else(|| hostname.clone()),
            hostname,
            task_duration: Duration::from_millis(millis("TASK_DURATION_MS", DEFAULT_TASK_DURATION_MS)),
            poll_interval: Duration::from_millis(millis("POLL_INTERVAL_MS", 1_000)),
            fail_task_types,
            disk_mb: millis("DISK_MB", DEFAULT_DISK_MB),
        }
    }
}

/// Comando nodetool que el agente le manda al daemon local para cada tipo de tarea.
pub fn nodetool_args(task: &LaunchedTask) -> Vec<String> {
    let ctx = &task.context;
    let mut args: Vec<String> = match task.task_type {
        TaskType::Compact => vec!["compact".into()],
        TaskType::Cleanup => vec!["cleanup".into()],
        TaskType::Repair => vec!["repair".into(), "-pr".into()],
        TaskType::BackupSnapshot | TaskType::RestoreSnapshot => {
            let tag = ctx.backup_name.clone().unwrap_or_else(|| task.task_id.clone());
            if task.task_type == TaskType::BackupSnapshot {
                vec!["snapshot".into(), "-t".into(), tag]
            } else {
                vec!["refresh".into(), "--snapshot".into(), tag]
            }
        }
        // upload / download no pasan por nodetool, los hace el agente
        TaskType::BackupUpload | TaskType::DownloadSnapshot => return Vec::new(),
    };

    args.extend(ctx.key_spaces.iter().cloned());
    if !ctx.key_spaces.is_empty() {
        args.extend(ctx.column_families.iter().cloned());
    }
    args
}

async fn register(client: &Client, cfg: &AgentConfig) -> Result<AgentRegisterResponse> {
    let mut sys = System::new_all();
    sys.refresh_memory();

    let req = AgentRegisterRequest {
        node_id: cfg.node_id.clone(),
        hostname: cfg.hostname.clone(),
        cpus: sys.cpus().len().max(1) as f64,
        // total_memory viene en bytes
        mem_mb: sys.total_memory() / (1024 * 1024),
        disk_mb: cfg.disk_mb,
    };

    let url = format!("{}/v1/agents/register", cfg.master_url);
    let resp: AgentRegisterResponse = client
        .post(&url)
        .json(&req)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    info!(
        "agente {} registrado para nodo {} (cpus={}, mem={}MB) contra {}",
        resp.agent_id, cfg.node_id, req.cpus, req.mem_mb, cfg.master_url
    );
    Ok(resp)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Accepted,
    /// El master rechazó el reporte (4xx): reintentar no cambia nada.
    Rejected,
    Retry,
}

async fn deliver(client: &Client, base_url: &str, agent_id: &str, report: &ExecutionReport) -> Delivery {
    let url = format!("{}/v1/tasks/status", base_url);
    let res = client
        .post(&url)
        .json(&TaskStatusRequest {
            agent_id: agent_id.to_string(),
            report: report.clone(),
        })
        .send()
        .await;

    match res {
        Ok(resp) if resp.status().is_success() => Delivery::Accepted,
        Ok(resp) if resp.status().is_client_error() => {
            warn!(
                "master rechazó el reporte {:?} de {}: {}",
                report.state,
                report.task_id,
                resp.status()
            );
            Delivery::Rejected
        }
        Ok(resp) => {
            warn!("master devolvió {} al reportar {}", resp.status(), report.task_id);
            Delivery::Retry
        }
        Err(e) => {
            warn!("no se pudo reportar estado al master: {:?}", e);
            Delivery::Retry
        }
    }
}

/// Repite `attempt` con backoff exponencial (tope `max_delay`) mientras pida
/// reintento. Sin `max_attempts` insiste hasta que el master conteste.
async fn with_backoff<F, Fut>(
    mut attempt: F,
    first_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
) -> Delivery
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Delivery>,
{
    let mut delay = first_delay;
    let mut tries = 0u32;

    loop {
        tries += 1;
        let outcome = attempt().await;
        if outcome != Delivery::Retry {
            return outcome;
        }
        if max_attempts.is_some_and(|max| tries >= max) {
            return outcome;
        }
        sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// Ejecuta la acción de mantenimiento. Devuelve el estado final y un mensaje.
async fn execute(task: &LaunchedTask, cfg: &AgentConfig) -> (ExecutionState, String) {
    let args = nodetool_args(task);
    let command = if args.is_empty() {
        format!("{} {}", task.task_type, task.context.external_location.as_deref().unwrap_or("-"))
    } else {
        format!("nodetool {}", args.join(" "))
    };

    info!("{}: ejecutando `{}`", task.task_name, command);
    sleep(cfg.task_duration).await;

    if cfg.fail_task_types.contains(&task.task_type) {
        (ExecutionState::Failed, format!("`{}` falló", command))
    } else {
        (ExecutionState::Finished, format!("`{}` terminó", command))
    }
}

/// Loop principal del agente.
/// - Se registra en el master con el nodo y los recursos que ofrece.
/// - Hace heartbeats periódicos (si el master no lo reconoce, se vuelve a registrar).
/// - Retira tareas lanzadas y las ejecuta de a una.
pub async fn run() -> Result<()> {
    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let cfg = Arc::new(AgentConfig::from_lookup(|k| env::var(k).ok(), hostname));
    let client = Client::new();

    let mut agent_id = register(&client, &cfg).await?.agent_id;

    // una tarea de mantenimiento por nodo a la vez
    let sem = Arc::new(Semaphore::new(1));

    loop {
        // --------- Heartbeat ---------
        let hb_url = format!("{}/v1/agents/heartbeat", cfg.master_url);
        match client
            .post(&hb_url)
            .json(&AgentHeartbeatRequest {
                agent_id: agent_id.clone(),
            })
            .send()
            .await
        {
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                warn!("el master no reconoce al agente {}, registrando de nuevo", agent_id);
                agent_id = register(&client, &cfg).await?.agent_id;
            }
            Ok(_) => {}
            Err(e) => warn!("heartbeat falló: {:?}", e),
        }

        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                // todavía ejecutando la tarea anterior
                sleep(cfg.poll_interval).await;
                continue;
            }
        };

        // --------- Pedir tarea ---------
        let next_url = format!("{}/v1/tasks/next", cfg.master_url);
        let assignment: Option<TaskLaunchResponse> = match client
            .post(&next_url)
            .json(&TaskLaunchRequest {
                agent_id: agent_id.clone(),
            })
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                warn!("master devolvió status {} al pedir tarea", resp.status());
                None
            }
            Err(e) => {
                warn!("error HTTP al pedir tarea: {:?}", e);
                None
            }
        };

        let Some(task) = assignment.and_then(|a| a.task) else {
            drop(permit);
            sleep(cfg.poll_interval).await;
            continue;
        };

        info!("tengo tarea {} ({})", task.task_name, task.task_id);

        let client_cloned = client.clone();
        let cfg_cloned = cfg.clone();
        let agent_cloned = agent_id.clone();

        tokio::spawn(async move {
            let base = cfg_cloned.master_url.as_str();

            let running = ExecutionReport::new(task.task_id.clone(), ExecutionState::Running);
            with_backoff(
                || deliver(&client_cloned, base, &agent_cloned, &running),
                REPORT_FIRST_DELAY,
                REPORT_MAX_DELAY,
                Some(3),
            )
            .await;

            let (state, message) = execute(&task, &cfg_cloned).await;
            info!("{} -> {:?}: {}", task.task_name, state, message);

            // el master no vuelve a ofrecer este agente hasta recibir el estado final
            let last = ExecutionReport::new(task.task_id.clone(), state).with_message(message);
            let outcome = with_backoff(
                || deliver(&client_cloned, base, &agent_cloned, &last),
                REPORT_FIRST_DELAY,
                REPORT_MAX_DELAY,
                None,
            )
            .await;
            if outcome == Delivery::Rejected {
                warn!("{}: estado final descartado por el master", task.task_name);
            }

            // liberar el slot al terminar
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MaintenanceContext;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn launched(task_type: TaskType, ctx: MaintenanceContext) -> LaunchedTask {
        LaunchedTask {
            task_id: "t-1".into(),
            task_name: task_type.task_name("node-0"),
            task_type,
            executor_id: "node-0__d".into(),
            context: ctx,
        }
    }

    #[test]
    fn compact_pasa_keyspaces_y_tablas() {
        let ctx = MaintenanceContext::create(vec![], vec!["ks1".into()], vec!["t1".into(), "t2".into()]);
        let args = nodetool_args(&launched(TaskType::Compact, ctx));
        assert_eq!(args, vec!["compact", "ks1", "t1", "t2"]);
    }

    #[test]
    fn tablas_sin_keyspace_se_ignoran() {
        let ctx = MaintenanceContext::create(vec![], vec![], vec!["t1".into()]);
        let args = nodetool_args(&launched(TaskType::Repair, ctx));
        assert_eq!(args, vec!["repair", "-pr"]);
    }

    #[test]
    fn snapshot_usa_nombre_de_backup() {
        let ctx = MaintenanceContext::default().with_backup("b1", "s3://x");
        let args = nodetool_args(&launched(TaskType::BackupSnapshot, ctx.clone()));
        assert_eq!(args, vec!["snapshot", "-t", "b1"]);
        assert!(nodetool_args(&launched(TaskType::BackupUpload, ctx)).is_empty());
    }

    #[test]
    fn config_lee_tipos_a_fallar() {
        let cfg = AgentConfig::from_lookup(
            |k| match k {
                "FAIL_TASK_TYPES" => Some("repair, upload,desconocido".to_string()),
                "TASK_DURATION_MS" => Some("10".to_string()),
                _ => None,
            },
            "host-a".to_string(),
        );
        assert_eq!(cfg.node_id, "host-a");
        assert_eq!(cfg.task_duration, Duration::from_millis(10));
        assert_eq!(cfg.fail_task_types, vec![TaskType::Repair, TaskType::BackupUpload]);
    }

    #[tokio::test]
    async fn execute_falla_solo_los_tipos_configurados() {
        let cfg = AgentConfig::from_lookup(
            |k| match k {
                "FAIL_TASK_TYPES" => Some("cleanup".to_string()),
                "TASK_DURATION_MS" => Some("1".to_string()),
                _ => None,
            },
            "h".to_string(),
        );

        let (ok, _) = execute(&launched(TaskType::Compact, MaintenanceContext::default()), &cfg).await;
        assert_eq!(ok, ExecutionState::Finished);

        let (failed, msg) = execute(&launched(TaskType::Cleanup, MaintenanceContext::default()), &cfg).await;
        assert_eq!(failed, ExecutionState::Failed);
        assert!(msg.contains("nodetool cleanup"));
    }

    #[tokio::test]
    async fn reporte_final_se_reintenta_hasta_ser_aceptado() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let outcome = with_backoff(
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Delivery::Retry
                } else {
                    Delivery::Accepted
                }
            },
            Duration::from_millis(1),
            Duration::from_millis(4),
            None,
        )
        .await;

        assert_eq!(outcome, Delivery::Accepted);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn rechazo_o_tope_de_intentos_cortan_los_reintentos() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome = with_backoff(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Delivery::Rejected
            },
            Duration::from_millis(1),
            Duration::from_millis(1),
            None,
        )
        .await;
        assert_eq!(outcome, Delivery::Rejected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome = with_backoff(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Delivery::Retry
            },
            Duration::from_millis(1),
            Duration::from_millis(1),
            Some(3),
        )
        .await;
        assert_eq!(outcome, Delivery::Retry);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
