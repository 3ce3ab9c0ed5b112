use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::{AgentMetrics, OperationRequest, PlanInfo};
use reqwest::{Client, StatusCode};
use std::env;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI para operar el scheduler de mantenimiento")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Muestra el plan activo con sus fases y steps
    Plan,

    /// Arranca una operación (compact, cleanup, repair, backup, restore)
    Start {
        #[arg(value_name = "OPERACION")]
        operation: String,

        /// Nodos destino separados por coma; "*" = todos
        #[arg(long, value_delimiter = ',', default_value = "*")]
        nodes: Vec<String>,

        #[arg(long, value_delimiter = ',')]
        key_spaces: Vec<String>,

        #[arg(long, value_delimiter = ',')]
        column_families: Vec<String>,

        /// Nombre del backup (backup / restore)
        #[arg(long)]
        backup_name: Option<String>,

        /// Ubicación externa del backup (backup / restore)
        #[arg(long)]
        location: Option<String>,
    },

    /// Reinicia un step en ERROR del plan activo
    Restart {
        #[arg(value_name = "STEP")]
        step: String,
    },

    /// Abandona el plan activo (las tareas ya lanzadas siguen su curso)
    Abandon,

    /// Lista los agentes registrados
    Agents,
}

impl Commands {
    fn operation_request(&self) -> Option<OperationRequest> {
        match self {
            Commands::Start {
                nodes,
                key_spaces,
                column_families,
                backup_name,
                location,
                ..
            } => Some(OperationRequest {
                nodes: nodes.clone(),
                key_spaces: key_spaces.clone(),
                column_families: column_families.clone(),
                backup_name: backup_name.clone(),
                external_location: location.clone(),
            }),
            _ => None,
        }
    }
}

fn print_plan(plan: &PlanInfo) {
    println!("Plan {} ({}):", plan.name, plan.id);
    println!("  creado: {}", plan.created_at);
    println!("  estado: {:?}", plan.status);
    for phase in &plan.phases {
        println!("  fase {} [{:?}] -> {:?}", phase.name, phase.strategy, phase.status);
        for step in &phase.steps {
            println!("    {:<28} {:<14} {:?}", step.name, step.node, step.status);
        }
    }
    for err in &plan.errors {
        let msg = err
            .report
            .as_ref()
            .and_then(|r| r.message.clone())
            .unwrap_or_else(|| "sin mensaje".to_string());
        println!("  error en {}: {}", err.step, msg);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    let request = cli.command.operation_request();

    match cli.command {
        Commands::Plan => {
            let url = format!("{}/v1/plan", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status() == StatusCode::NOT_FOUND {
                println!("No hay plan activo");
                return Ok(());
            }
            let plan: PlanInfo = resp.error_for_status()?.json().await?;
            print_plan(&plan);
        }

        Commands::Start { operation, .. } => {
            let url = format!("{}/v1/operations/{}/start", base_url, operation);
            let resp = client.put(&url).json(&request).send().await?;

            match resp.status() {
                StatusCode::BAD_REQUEST => bail!("operación desconocida: {}", operation),
                StatusCode::CONFLICT => {
                    println!("Ya hay un plan en curso, esperá a que termine");
                    return Ok(());
                }
                _ => {}
            }
            let plan: PlanInfo = resp.error_for_status()?.json().await?;
            println!("Operación {} iniciada", operation);
            print_plan(&plan);
        }

        Commands::Restart { step } => {
            let url = format!("{}/v1/plan/restart/{}", base_url, step);
            let resp = client.post(&url).send().await?;

            match resp.status() {
                StatusCode::NOT_FOUND => println!("No existe el step {} en el plan activo", step),
                StatusCode::CONFLICT => println!("El step {} no está en ERROR", step),
                _ => {
                    let plan: PlanInfo = resp.error_for_status()?.json().await?;
                    println!("Step {} reiniciado", step);
                    print_plan(&plan);
                }
            }
        }

        Commands::Abandon => {
            let url = format!("{}/v1/plan", base_url);
            let resp = client.delete(&url).send().await?;

            if resp.status() == StatusCode::NOT_FOUND {
                println!("No hay plan activo");
                return Ok(());
            }
            let plan: PlanInfo = resp.error_for_status()?.json().await?;
            println!("Plan {} abandonado en {:?}", plan.name, plan.status);
        }

        Commands::Agents => {
            let url = format!("{}/v1/agents", base_url);
            let agents: Vec<AgentMetrics> = client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if agents.is_empty() {
                println!("No hay agentes registrados");
            }
            for a in agents {
                println!(
                    "{} nodo={} host={} dead={} hb_hace={}s en_curso={} encoladas={} ok={} fallidas={} lanzadas={}",
                    a.agent_id,
                    a.node_id,
                    a.hostname,
                    a.dead,
                    a.last_heartbeat_secs_ago,
                    a.in_flight.as_deref().unwrap_or("-"),
                    a.queued,
                    a.tasks_finished,
                    a.tasks_failed,
                    a.tasks_launched,
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_sin_nodos_apunta_a_todos() {
        let cli = Cli::try_parse_from(["client", "start", "compact"]).unwrap();
        let req = cli.command.operation_request().unwrap();
        assert_eq!(req.nodes, vec!["*"]);
        assert!(req.key_spaces.is_empty());
        assert!(req.backup_name.is_none());
    }

    #[test]
    fn start_separa_listas_por_coma() {
        let cli = Cli::try_parse_from([
            "client",
            "start",
            "backup",
            "--nodes",
            "node-0,node-1",
            "--key-spaces",
            "ks1",
            "--backup-name",
            "b1",
            "--location",
            "s3://bucket",
        ])
        .unwrap();
        let req = cli.command.operation_request().unwrap();
        assert_eq!(req.nodes, vec!["node-0", "node-1"]);
        assert_eq!(req.key_spaces, vec!["ks1"]);
        assert_eq!(req.backup_name.as_deref(), Some("b1"));
        assert_eq!(req.external_location.as_deref(), Some("s3://bucket"));
    }

    #[test]
    fn otros_comandos_no_arman_pedido() {
        let cli = Cli::try_parse_from(["client", "restart", "repair-node-0"]).unwrap();
        assert!(cli.command.operation_request().is_none());

        let cli = Cli::try_parse_from(["client", "abandon"]).unwrap();
        assert!(matches!(cli.command, Commands::Abandon));
    }
}
