use anyhow::{Context, Result};
use plan_engine::cli::commands::{HistoryCommand, RunCommand, ValidateCommand};
use plan_engine::cli::output::*;
use plan_engine::cli::{Cli, Command};
use plan_engine::core::config::PlanConfig;
use plan_engine::core::{NodeExecution, SetupAbstractions};
use plan_engine::execution::ExecutionEngine;
use plan_engine::task::InlineTaskExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[cfg(feature = "sqlite")]
use plan_engine::persistence::{NodeExecutionStore, PlanExecutionStore, SqliteExecutionStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_plan(cmd).await?,
        Command::Validate(cmd) => validate_plan(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_history(db: Option<&str>) -> Result<SqliteExecutionStore> {
    match db {
        Some(path) => SqliteExecutionStore::new(path).await,
        None => SqliteExecutionStore::with_default_path().await,
    }
}

async fn run_plan(cmd: &RunCommand) -> Result<()> {
    let config = PlanConfig::from_file(&cmd.file).context("Failed to load plan config")?;
    println!("{} Loaded plan: {}", INFO, style(&config.name).bold());

    let mut engine_config = config.engine.clone();
    if let Some(strategy) = cmd.strategy {
        engine_config.scheduling = strategy.into();
    }

    let mut builder = ExecutionEngine::builder()
        .with_config(engine_config)
        .with_task_executor(Arc::new(InlineTaskExecutor));
    if !cmd.no_history {
        #[cfg(feature = "sqlite")]
        {
            let store = open_history(cmd.db.as_deref()).await?;
            builder = builder.with_execution_store(Arc::new(store));
        }
        #[cfg(not(feature = "sqlite"))]
        warn!("Built without the sqlite feature, history is not saved");
    }
    let engine = builder.build();

    engine
        .add_event_handler(|event| println!("{}", format_execution_event(&event)))
        .await;

    let plan = config.to_plan();
    engine
        .register_plan(&plan)
        .await
        .context("Plan was rejected by the engine")?;

    println!();
    let plan_execution_id = engine.start_plan(&plan.id, SetupAbstractions::default()).await?;

    let timeout = Duration::from_secs(cmd.timeout_secs);
    let execution = match tokio::time::timeout(timeout, engine.wait_for_plan(plan_execution_id)).await {
        Ok(execution) => execution?,
        Err(_) => {
            warn!("Plan execution {} did not finish within {:?}", plan_execution_id, timeout);
            engine
                .expire_plan(plan_execution_id, format!("timed out after {}s", cmd.timeout_secs))
                .await?;
            engine.wait_for_plan(plan_execution_id).await?
        }
    };

    println!();
    print_node_tree(&engine.node_executions(plan_execution_id).await?);

    if !cmd.no_history {
        println!(
            "\n{} Execution saved to history (ID: {})",
            INFO,
            style(&execution.id.to_string()[..8]).dim()
        );
    }

    if execution.status.is_positive() {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&plan.name).bold(),
            style("successfully").green()
        );
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&plan.name).bold(),
            format_status(execution.status)
        );
        if let Some(cause) = &execution.cause {
            error!("{}", cause);
        }
        std::process::exit(1);
    }

    Ok(())
}

fn print_node_tree(nodes: &[NodeExecution]) {
    let mut nodes: Vec<&NodeExecution> = nodes.iter().collect();
    nodes.sort_by_key(|node| node.created_at);
    for node in nodes {
        println!("{}", format_node_execution(node));
    }
}

fn validate_plan(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating plan...", INFO);

    match PlanConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Plan configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Start: {}", style(&config.start).cyan());
            println!("  Nodes: {}", style(config.nodes.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config.to_plan())?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

#[cfg(feature = "sqlite")]
async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history(cmd.db.as_deref()).await?;

    if let Some(id) = &cmd.execution_id {
        let id = uuid::Uuid::parse_str(id).context("Invalid execution ID format")?;
        let Some(execution) = store.get_plan_execution(id).await? else {
            println!("{} Execution not found", WARN);
            return Ok(());
        };
        let nodes = store.list_by_plan_execution(id).await?;

        if cmd.json {
            let data = serde_json::json!({ "execution": execution, "nodes": nodes });
            println!("{}", serde_json::to_string_pretty(&data)?);
        } else {
            println!("{}", format_plan_execution(&execution));
            print_node_tree(&nodes);
        }
        return Ok(());
    }

    let executions: Vec<_> = store
        .list_plan_executions(cmd.plan.as_deref())
        .await?
        .into_iter()
        .take(cmd.limit)
        .collect();

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
        for execution in &executions {
            println!("  {}", format_plan_execution(execution));
        }
    }

    Ok(())
}

#[cfg(not(feature = "sqlite"))]
async fn show_history(_cmd: &HistoryCommand) -> Result<()> {
    anyhow::bail!("history needs the sqlite feature")
}
