//! Demiarch agents CLI - run features through the agent hierarchy

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use demiarch_agents::agents::{AgentResult, FeatureInput};
use demiarch_agents::config::Config;
use demiarch_agents::domain::context::{NewContextItem, SourceScope, SourceType};
use demiarch_agents::domain::execution::{ExecutionId, ExecutionTree, StatusEvent, load_tree};
use demiarch_agents::storage::{Database, SqliteExecutionStore, SqliteLockAudit};
use demiarch_agents::{AgentRuntime, Error};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "demiarch-agents")]
#[command(author, version, about = "Hierarchical agent runner for Demiarch", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Database file (overrides storage.database_path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a feature through Orchestrator, Planner and Workers
    Run {
        /// Feature description
        description: String,
        /// Project ID
        #[arg(short, long, default_value = "default")]
        project: String,
        /// Feature ID (generated when omitted)
        #[arg(long)]
        feature: Option<String>,
        /// Preferred model for every step
        #[arg(short, long)]
        model: Option<String>,
        /// Context token budget per execution
        #[arg(long)]
        max_context_tokens: Option<usize>,
        /// Answer model calls locally instead of calling OpenRouter
        #[arg(long)]
        offline: bool,
    },

    /// Inspect recorded executions
    Executions {
        #[command(subcommand)]
        action: ExecutionAction,
    },

    /// Show the lock audit log
    Locks {
        /// Only locks still held
        #[arg(long)]
        held: bool,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Context history management
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List recent feature runs
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Show one execution tree
    Show { id: String },
}

#[derive(Subcommand)]
enum ContextAction {
    /// Record a history item
    Add {
        content: String,
        #[arg(short, long, default_value = "default")]
        project: String,
        /// chat_turn, feature, agent_result, document or other
        #[arg(short = 't', long, default_value = "document")]
        source_type: String,
        #[arg(short, long)]
        source_id: Option<String>,
    },
    /// Preview the bundle an execution would receive
    Query {
        query: String,
        #[arg(short, long, default_value = "default")]
        project: String,
        #[arg(long)]
        max_tokens: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("demiarch_agents={}", level).parse()?),
        )
        .init();

    let mut config = Config::load()?;
    if let Some(path) = &cli.db {
        config.storage.database_path = Some(path.clone());
    }

    match cli.command {
        Commands::Run {
            description,
            project,
            feature,
            model,
            max_context_tokens,
            offline,
        } => {
            let feature_id = feature.unwrap_or_else(|| format!("feat-{}", ExecutionId::new().short()));
            let mut input = FeatureInput::new(project, feature_id, description);
            if let Some(model) = model {
                input = input.with_model_hint(model);
            }
            if let Some(max) = max_context_tokens {
                input = input.with_max_context_tokens(max);
            }
            cmd_run(config, input, offline, cli.format, cli.quiet).await
        }

        Commands::Executions { action } => cmd_executions(&config, action, cli.format).await,

        Commands::Locks { held, limit } => cmd_locks(&config, held, limit, cli.format).await,

        Commands::Context { action } => cmd_context(config, action, cli.format, cli.quiet).await,

        Commands::Config { action } => cmd_config(config, action, cli.quiet),

        Commands::Doctor => cmd_doctor(&config).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_run(
    config: Config,
    input: FeatureInput,
    offline: bool,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let runtime = AgentRuntime::builder()
        .config(config)
        .offline(offline)
        .build()
        .await
        .map_err(describe)?;

    if !quiet && format == OutputFormat::Text {
        println!("Running feature '{}' in project '{}'...", input.feature_id, input.project_id);
    }

    let mut events = runtime.ledger().subscribe();
    let handle = runtime.start_feature(input).await.map_err(describe)?;
    let root = handle.id();
    let wait = handle.wait();
    tokio::pin!(wait);

    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            event = events.recv() => match event {
                Ok(event) => {
                    if !quiet && format == OutputFormat::Text {
                        print_status(&event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Status stream lagged"),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                warn!(execution_id = %root, "Interrupted, cancelling feature");
                runtime.scheduler().cancel(root);
            }
        }
    };

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            runtime.shutdown().await.ok();
            return Err(describe(e));
        }
    };
    runtime.shutdown().await.map_err(describe)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_result(&result, quiet),
    }

    if result.is_success() {
        Ok(())
    } else {
        let detail = result
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| result.status.to_string());
        Err(anyhow::anyhow!("Feature {} did not succeed: {}", result.execution_id, detail))
    }
}

fn print_status(event: &StatusEvent) {
    let indent = match event.role.level() {
        0 => "",
        1 => "  ",
        _ => "    ",
    };
    println!(
        "{}{} {} -> {}",
        indent,
        event.role,
        event.execution_id.short(),
        event.status
    );
}

fn print_result(result: &AgentResult, quiet: bool) {
    println!("Feature {}: {}", result.execution_id, result.status);
    if quiet {
        return;
    }
    for worker in result.worker_results() {
        println!("  [{}] {} {}: {}", worker.status, worker.task_id, worker.role, worker.execution_id.short());
    }
    println!("  Tokens: {}", result.total_tokens());
    if let Some(cost) = result.total_cost_usd() {
        println!("  Cost: ${:.4}", cost);
    }
    if let Some(failed) = result.first_failure() {
        println!();
        println!("Failed execution: {} ({})", failed.execution_id, failed.role);
        if let Some(error) = &failed.error {
            println!("  {}", error);
        }
    }
}

/// Attach the error code and suggestion to an agent core error
fn describe(err: Error) -> anyhow::Error {
    match err.suggestion() {
        Some(hint) => anyhow::anyhow!("{} ({})\n  Hint: {}", err, err.code(), hint),
        None => anyhow::anyhow!("{} ({})", err, err.code()),
    }
}

async fn open_database(config: &Config) -> anyhow::Result<Database> {
    Database::new(config.database_config()).await
}

async fn cmd_executions(
    config: &Config,
    action: ExecutionAction,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let store = SqliteExecutionStore::new(db.pool().clone());

    match action {
        ExecutionAction::List { limit } => {
            let roots = store.list_roots(limit).await?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&roots)?);
            } else if roots.is_empty() {
                println!("No executions recorded.");
                println!("\nStart one with: demiarch-agents run \"<feature>\" --offline");
            } else {
                println!("Executions:");
                for row in roots {
                    let task = row.input["descriptor"]["task_id"].as_str().unwrap_or("-");
                    let feature = task.trim_end_matches(":orchestrate");
                    println!(
                        "  {} - {} [{}] ({})",
                        row.id,
                        feature,
                        row.status,
                        row.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        ExecutionAction::Show { id } => {
            let id: ExecutionId = id
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid execution ID '{}': {}", id, e))?;
            let tree = load_tree(&store, id).await.map_err(|e| {
                anyhow::anyhow!("{}. Run `demiarch-agents executions list` to see recent runs.", e)
            })?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&tree)?);
            } else {
                print_tree(&tree, 0);
            }
        }
    }

    db.close().await;
    Ok(())
}

fn print_tree(tree: &ExecutionTree, depth: usize) {
    let row = &tree.execution;
    let indent = "  ".repeat(depth);
    let duration = row
        .duration_ms()
        .map(|ms| format!(" {}ms", ms))
        .unwrap_or_default();
    println!("{}{} {} [{}]{}", indent, row.role, row.id, row.status, duration);
    if let Some(error) = &row.error {
        println!("{}  {}", indent, error);
    }
    for child in &tree.children {
        print_tree(child, depth + 1);
    }
}

async fn cmd_locks(
    config: &Config,
    held: bool,
    limit: u32,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let (audit, writer) = SqliteLockAudit::spawn(db.pool().clone());

    let records = if held {
        audit.list_held().await?
    } else {
        audit.list_recent(limit).await?
    };
    drop(audit);
    writer.await.ok();

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No locks recorded.");
    } else {
        for record in records {
            println!(
                "  {} {} {} by {} ({})",
                record.key,
                record.mode,
                record.state,
                record.requester.short(),
                record.requested_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    db.close().await;
    Ok(())
}

async fn cmd_context(
    config: Config,
    action: ContextAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let default_budget = config.context.max_tokens;
    let runtime = AgentRuntime::builder()
        .config(config)
        .offline(true)
        .build()
        .await
        .map_err(describe)?;

    match action {
        ContextAction::Add {
            content,
            project,
            source_type,
            source_id,
        } => {
            let source_type: SourceType = source_type.parse().map_err(|e| describe(Error::from(e)))?;
            let source_id = source_id.unwrap_or_else(|| format!("{}-{}", source_type, ExecutionId::new().short()));
            let item = runtime
                .add_context(NewContextItem::new(project, source_type, source_id, content))
                .await
                .map_err(describe)?;
            if !quiet {
                println!("Context item added: {}", item.id);
                println!("  Index ({} tokens): {}", item.index.tokens, item.index.text);
            }
        }
        ContextAction::Query {
            query,
            project,
            max_tokens,
        } => {
            let budget = max_tokens.unwrap_or(default_budget);
            let bundle = runtime
                .retriever()
                .retrieve(&query, &SourceScope::project(project), budget)
                .await
                .map_err(|e| describe(Error::from(e)))?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&bundle)?);
            } else {
                let (index, timeline, full) = bundle.level_counts();
                println!(
                    "{} items, {}/{} tokens (index {}, timeline {}, full {}){}",
                    bundle.len(),
                    bundle.total_tokens,
                    bundle.max_tokens,
                    index,
                    timeline,
                    full,
                    if bundle.truncated { ", truncated" } else { "" }
                );
                if !quiet {
                    print!("{}", bundle.render());
                }
            }
        }
    }

    runtime.shutdown().await.map_err(describe)?;
    Ok(())
}

fn cmd_config(mut config: Config, action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path()?.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(config: &Config) -> anyhow::Result<()> {
    println!("Demiarch Agents Health Check");
    println!("============================");
    println!();

    let mut all_ok = true;

    match config.validate() {
        Ok(()) => println!("[OK] Configuration: Valid"),
        Err(e) => {
            all_ok = false;
            println!("[!!] Configuration: {}", e);
        }
    }

    match config.llm.redacted_api_key() {
        Ok(Some(redacted)) => println!("[OK] API Key: Configured ({})", redacted),
        Ok(None) => {
            println!("[--] API Key: Not configured (only --offline runs will work)");
            println!("     Set DEMIARCH_API_KEY or OPENROUTER_API_KEY environment variable");
        }
        Err(e) => {
            all_ok = false;
            println!("[!!] API Key: Error - {}", e);
        }
    }

    match open_database(config).await {
        Ok(db) => {
            match db.health_check().await {
                Ok(()) => {
                    println!("[OK] Database: Connected");
                    if let Some(path) = db.path() {
                        println!("     Path: {}", path.display());
                    }
                }
                Err(e) => {
                    all_ok = false;
                    println!("[!!] Database: Health check failed - {}", e);
                }
            }
            match db.migration_status().await {
                Ok(status) if status.needs_migration => {
                    all_ok = false;
                    println!(
                        "[!!] Database: Migrations pending (v{} -> v{})",
                        status.current_version, status.target_version
                    );
                }
                Ok(status) => println!("[OK] Database: Schema v{}", status.current_version),
                Err(e) => {
                    all_ok = false;
                    println!("[!!] Database: Migration check failed - {}", e);
                }
            }
            let store = SqliteExecutionStore::new(db.pool().clone());
            if let Ok(counts) = store.count_by_status().await {
                for (status, count) in counts {
                    println!("     {}: {}", status, count);
                }
            }
            db.close().await;
        }
        Err(e) => {
            all_ok = false;
            println!("[!!] Database: Failed to open - {:#}", e);
        }
    }

    println!();
    if all_ok {
        println!("All checks passed!");
    } else {
        println!("Some checks failed. See above for details.");
    }
    Ok(())
}

#[cfg(test)]
mod main_tests;
