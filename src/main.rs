use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod agent;
mod auth;
mod cli;
mod config;
mod db;
mod llm;
mod util;
mod web;

use crate::agent::orchestrator::QueryOrchestrator;
use crate::config::{AppConfig, CliArgs, Command};
use crate::db::db_pool::create_pool;
use crate::db::executor::{DuckDbExecutor, QueryExecutor};
use crate::db::schema::SchemaMetadata;
use crate::db::seed::seed_database;
use crate::llm::LlmManager;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = CliArgs::parse();

    // The chat front end owns the terminal, so keep its logs quiet
    let default_level = match args.command {
        Command::Chat { .. } => "warn",
        _ => "info",
    };
    init_tracing(default_level, args.log_json);

    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    match args.command {
        Command::Seed { force } => {
            let summary = seed_database(&config.database.path, force)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Serve { .. } => {
            let (orchestrator, executor, schema, llm) = build_agent(&config)?;
            let app_state = Arc::new(AppState::new(config.clone(), orchestrator, executor, schema, llm)?);

            info!("Starting property assistant on {}:{}", config.web.host, config.web.port);
            match web::run_server(config.web, app_state).await {
                Ok(_) => {
                    info!("Server stopped gracefully");
                    Ok(())
                }
                Err(e) => {
                    error!("Server error: {}", e);
                    Err(e)
                }
            }
        }
        Command::Chat { .. } => {
            let (orchestrator, _, _, _) = build_agent(&config)?;
            cli::run(&config, orchestrator).await
        }
    }
}

type AgentParts = (QueryOrchestrator, Arc<dyn QueryExecutor>, SchemaMetadata, String);

fn build_agent(config: &AppConfig) -> Result<AgentParts, Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening DuckDB database at {} (read-only)", config.database.path);
    let pool = create_pool(&config.database.path, config.database.pool_size)?;
    let executor: Arc<dyn QueryExecutor> = Arc::new(DuckDbExecutor::new(pool));

    let schema = SchemaMetadata::load(&config.schema_path)?;

    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm_manager = LlmManager::new(&config.llm)?;

    let orchestrator = QueryOrchestrator::new(
        llm_manager.sql_generator(),
        llm_manager.answer_generator(),
        executor.clone(),
        schema.describe(),
        &config.agent,
    );

    Ok((orchestrator, executor, schema, llm_manager.describe()))
}
