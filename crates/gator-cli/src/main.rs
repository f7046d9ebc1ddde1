mod config;
mod serve_cmd;
#[cfg(test)]
mod test_util;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use gator_core::Root;
use gator_core::mission_driver::MissionDriverConfig;
use gator_db::pool;
use gator_db::queries::{audit, missions, processes, projects};

use config::AppConfig;

#[derive(Parser)]
#[command(name = "gator", about = "Local mission orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run startup recovery and serve the HTTP API (default command).
    Serve,
    /// Run startup recovery only, then exit without serving requests.
    Recover,
    /// List projects with their mission counts.
    Projects,
    /// List missions, optionally scoped to one project.
    Missions {
        #[arg(long)]
        project_id: Option<String>,
    },
    /// List processes, optionally scoped to one mission.
    Processes {
        #[arg(long)]
        mission_id: Option<String>,
    },
    /// Show the most recent audit entries, optionally scoped to one entity.
    Audit {
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        entity_id: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gator: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    init_tracing(&config.log_level);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd_serve(config).await,
        Commands::Recover => cmd_recover(config).await,
        Commands::Projects => cmd_projects(config).await,
        Commands::Missions { project_id } => cmd_missions(config, project_id).await,
        Commands::Processes { mission_id } => cmd_processes(config, mission_id).await,
        Commands::Audit { entity_type, entity_id, limit } => {
            cmd_audit(config, entity_type, entity_id, limit).await
        }
    }
}

/// Open the store, run migrations, reconcile with live sandboxes, then
/// serve the HTTP surface (§4.7, §6) until a shutdown signal arrives.
async fn cmd_serve(config: AppConfig) -> anyhow::Result<()> {
    let root = Root::init(config.db_config.clone(), MissionDriverConfig::default()).await?;
    root.run_recovery().await;

    let state = serve_cmd::AppState { root: std::sync::Arc::new(root), api_token: config.api_token };
    serve_cmd::run_serve(state, config.host, config.port).await
}

/// Run startup reconciliation without accepting HTTP requests; useful for
/// operator-driven recovery after a crash without also binding a port.
async fn cmd_recover(config: AppConfig) -> anyhow::Result<()> {
    let root = Root::init(config.db_config.clone(), MissionDriverConfig::default()).await?;
    root.run_recovery().await;
    root.shutdown().await;
    Ok(())
}

async fn open_pool(config: &AppConfig) -> anyhow::Result<sqlx::SqlitePool> {
    let pool = pool::create_pool(&config.db_config).await?;
    pool::run_migrations(&pool, gator_db::config::DbConfig::migrations_path()).await?;
    Ok(pool)
}

async fn cmd_projects(config: AppConfig) -> anyhow::Result<()> {
    let pool = open_pool(&config).await?;
    let rows = projects::find_all(&pool).await?;
    for row in rows {
        println!(
            "{}\t{}\t{}\tmissions={}",
            row.project.id, row.project.name, row.project.path, row.mission_count
        );
    }
    pool.close().await;
    Ok(())
}

async fn cmd_missions(config: AppConfig, project_id: Option<String>) -> anyhow::Result<()> {
    let pool = open_pool(&config).await?;
    let rows = match project_id {
        Some(id) => missions::find_by_project(&pool, &id).await?,
        None => missions::find_all(&pool).await?,
    };
    for m in rows {
        println!("{}\t{}\t{}\t{}", m.id, m.project_id, m.feature_name, m.state);
    }
    pool.close().await;
    Ok(())
}

async fn cmd_processes(config: AppConfig, mission_id: Option<String>) -> anyhow::Result<()> {
    let pool = open_pool(&config).await?;
    let rows = match mission_id {
        Some(id) => processes::find_by_mission(&pool, &id).await?,
        None => processes::find_non_terminal(&pool).await?,
    };
    for p in rows {
        println!("{}\t{}\t{}\t{}", p.id, p.r#type, p.command, p.status);
    }
    pool.close().await;
    Ok(())
}

async fn cmd_audit(
    config: AppConfig,
    entity_type: Option<String>,
    entity_id: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let pool = open_pool(&config).await?;
    let rows = audit::list(&pool, entity_type.as_deref(), entity_id.as_deref(), limit).await?;
    for entry in rows {
        println!(
            "{}\t{}\t{}\t{}",
            entry.created_at.to_rfc3339(),
            entry.event,
            entry.entity_type.as_deref().unwrap_or("-"),
            entry.entity_id.as_deref().unwrap_or("-"),
        );
    }
    pool.close().await;
    Ok(())
}
