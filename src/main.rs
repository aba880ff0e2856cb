use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use epicflow::api::{self, AppState, SecurityConfig};
use epicflow::config::Config;
use epicflow::db::{self, Database};
use epicflow::error::FlowError;
use epicflow::lifecycle::LifecycleEngine;
use epicflow::models::*;
use epicflow::orchestrator::{Confirm, Orchestrator};
use epicflow::render;

#[derive(Parser)]
#[command(name = "epicflow")]
#[command(about = "Epic decomposition, feature lifecycle tracking and capacity-based scheduling")]
struct Cli {
    /// Registry database file (overrides EPICFLOW_DB and the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and inspect epics
    #[command(subcommand)]
    Epic(EpicCommand),
    /// Drive and inspect features
    #[command(subcommand)]
    Feature(FeatureCommand),
    /// Stage checklists
    #[command(subcommand)]
    Tasks(TasksCommand),
    /// Run a scheduling pass and print the plan
    Orchestrate(OrchestrateArgs),
    /// Stored orchestration plans
    #[command(subcommand)]
    Plans(PlansCommand),
    /// Lifecycle event log maintenance
    #[command(subcommand)]
    Events(EventsCommand),
    /// Start the HTTP API
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
}

#[derive(Subcommand)]
enum EpicCommand {
    /// Decompose an epic into features and register it
    Create {
        name: String,
        description: String,
        /// small, medium or large
        complexity: Complexity,
    },
    List,
    /// Print an epic as a tree of features and current tasks
    Show { id: String },
    /// Remove an epic whose features are all completed
    Delete { id: String },
}

#[derive(Subcommand)]
enum FeatureCommand {
    /// Apply a lifecycle action (start, implement, test, review, complete, rework, block, resume)
    Transition {
        id: String,
        action: Action,
        /// Recorded with the event; the blocker description for `block`
        #[arg(long)]
        reason: Option<String>,
    },
    Show { id: String },
    List {
        #[arg(long)]
        stage: Option<Stage>,
        #[arg(long)]
        assignee: Option<String>,
    },
    /// Set or clear the assignee
    Assign {
        id: String,
        assignee: Option<String>,
    },
    /// Print the lifecycle event log of a feature
    History {
        id: String,
        /// Include archived events
        #[arg(long)]
        archived: bool,
    },
    /// Remove a completed feature
    Delete { id: String },
}

#[derive(Subcommand)]
enum TasksCommand {
    /// Tasks of an epic's features
    List {
        epic_id: String,
        /// Only tasks for features in this stage
        #[arg(long)]
        status: Option<Stage>,
    },
    Show { id: String },
    Complete { id: String },
}

#[derive(Args)]
struct OrchestrateArgs {
    /// suggest, auto or interactive (defaults to the configured mode)
    #[arg(long)]
    mode: Option<OrchestrationMode>,
    /// Capacity limit (defaults to the configured capacity)
    #[arg(long)]
    capacity: Option<usize>,
    /// Keep running passes until interrupted
    #[arg(long)]
    watch: bool,
    /// Seconds between passes with --watch
    #[arg(long)]
    interval: Option<u64>,
}

#[derive(Subcommand)]
enum PlansCommand {
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    Show { id: String },
}

#[derive(Subcommand)]
enum EventsCommand {
    /// Move old events to the archive table
    Archive {
        #[arg(long)]
        older_than_days: i64,
    },
}

/// Logs go to stderr so stdout carries only command output.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "epicflow=info,tower_http=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Asks on the terminal before each interactive decision.
struct TerminalConfirm;

#[async_trait]
impl Confirm for TerminalConfirm {
    async fn confirm(&self, decision: &Decision) -> bool {
        let action = decision.action.map(|a| a.as_str()).unwrap_or("-");
        let prompt = format!(
            "{} {} ({}) [{}]: {}\nexecute? [y/N] ",
            action, decision.feature_name, decision.feature_id, decision.stage, decision.rationale
        );
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{prompt}");
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        matches!(answer, Ok(Ok(line)) if matches!(line.trim(), "y" | "Y" | "yes"))
    }
}

fn open_database(cli_path: Option<PathBuf>, config: &Config) -> Result<Database, FlowError> {
    let path = match cli_path.or_else(|| config.db_path.clone()) {
        Some(path) => path,
        None => db::default_path()?,
    };
    tracing::debug!(path = %path.display(), "opening registry");
    let db = Database::open(path)?;
    db.migrate()?;
    Ok(db)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e.downcast_ref::<FlowError>().map(FlowError::exit_code).unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load();
    let db = open_database(cli.db, &config)?;
    let engine = LifecycleEngine::new(db.clone(), config.collaborators())
        .with_hook_timeout(config.hook_timeout())
        .with_capacity(config.capacity);

    match cli.command {
        Commands::Epic(cmd) => run_epic(cmd, &db, &config).await?,
        Commands::Feature(cmd) => run_feature(cmd, &db, &engine).await?,
        Commands::Tasks(cmd) => run_tasks(cmd, &db)?,
        Commands::Orchestrate(args) => run_orchestrate(args, engine, &config).await?,
        Commands::Plans(PlansCommand::List { limit }) => {
            print!("{}", render::render_plan_list(&db.list_plans(limit)?));
        }
        Commands::Plans(PlansCommand::Show { id }) => {
            let plan = db.get_plan(&id)?.ok_or_else(|| FlowError::not_found("plan", id))?;
            print!("{}", render::render_plan(&plan));
        }
        Commands::Events(EventsCommand::Archive { older_than_days }) => {
            if older_than_days < 0 {
                return Err(FlowError::Validation("--older-than-days must not be negative".into()).into());
            }
            let cutoff = chrono::Utc::now() - chrono::Duration::days(older_than_days);
            let moved = db.archive_events(cutoff)?;
            println!("archived {moved} events");
        }
        Commands::Serve { port } => serve(port, engine, &config).await?,
    }
    Ok(())
}

async fn run_epic(cmd: EpicCommand, db: &Database, config: &Config) -> Result<(), FlowError> {
    match cmd {
        EpicCommand::Create {
            name,
            description,
            complexity,
        } => {
            let detail = config
                .decomposer()
                .create_epic(db, &name, &description, complexity)
                .await?;
            println!("{}", detail.epic.id);
        }
        EpicCommand::List => print!("{}", render::render_epic_list(&db.list_epics()?)),
        EpicCommand::Show { id } => {
            let detail = db
                .get_epic_detail(&id)?
                .ok_or_else(|| FlowError::not_found("epic", &id))?;
            let tasks = db.list_tasks_by_epic(&id, None)?;
            print!("{}", render::render_epic_tree(&detail, &tasks));
        }
        EpicCommand::Delete { id } => {
            if !db.delete_epic(&id)? {
                return Err(FlowError::not_found("epic", id));
            }
            println!("deleted {id}");
        }
    }
    Ok(())
}

async fn run_feature(cmd: FeatureCommand, db: &Database, engine: &LifecycleEngine) -> Result<(), FlowError> {
    match cmd {
        FeatureCommand::Transition { id, action, reason } => {
            let feature = engine.transition(&id, action, reason).await?;
            println!("{} -> {}", feature.id, feature.stage);
        }
        FeatureCommand::Show { id } => {
            print!("{}", render::render_feature(&db.require_feature(&id)?));
        }
        FeatureCommand::List { stage, assignee } => {
            let mut features = match (stage, &assignee) {
                (Some(stage), _) => db.list_features_by_stage(stage)?,
                (None, Some(assignee)) => db.list_features_by_assignee(assignee)?,
                (None, None) => db.list_all_features()?,
            };
            if let (Some(_), Some(assignee)) = (stage, &assignee) {
                features.retain(|f| f.assigned_to.as_ref() == Some(assignee));
            }
            print!("{}", render::render_features(&features));
        }
        FeatureCommand::Assign { id, assignee } => {
            let current = db.require_feature(&id)?;
            let feature = db.assign_feature(&id, current.version, assignee)?;
            println!(
                "{} assigned to {}",
                feature.id,
                feature.assigned_to.as_deref().unwrap_or("nobody")
            );
        }
        FeatureCommand::History { id, archived } => {
            db.require_feature(&id)?;
            let mut events = Vec::new();
            if archived {
                events.extend(db.list_archived_events(&id)?);
            }
            events.extend(db.list_events(&id)?);
            print!("{}", render::render_events(&events));
        }
        FeatureCommand::Delete { id } => {
            if !db.delete_feature(&id)? {
                return Err(FlowError::not_found("feature", id));
            }
            println!("deleted {id}");
        }
    }
    Ok(())
}

fn run_tasks(cmd: TasksCommand, db: &Database) -> Result<(), FlowError> {
    match cmd {
        TasksCommand::List { epic_id, status } => {
            if db.get_epic(&epic_id)?.is_none() {
                return Err(FlowError::not_found("epic", epic_id));
            }
            print!("{}", render::render_tasks(&db.list_tasks_by_epic(&epic_id, status)?));
        }
        TasksCommand::Show { id } => {
            let task = db.get_task(&id)?.ok_or_else(|| FlowError::not_found("task", id))?;
            print!("{}", render::render_tasks(std::slice::from_ref(&task)));
        }
        TasksCommand::Complete { id } => {
            let task = db.complete_task(&id)?;
            println!("completed {}", task.id);
        }
    }
    Ok(())
}

async fn run_orchestrate(args: OrchestrateArgs, engine: LifecycleEngine, config: &Config) -> anyhow::Result<()> {
    let mode = args.mode.unwrap_or(config.mode);
    let capacity = args.capacity.unwrap_or(config.capacity);

    let mut orchestrator = Orchestrator::new(engine).with_config(config.orchestrator());
    if mode == OrchestrationMode::Interactive {
        orchestrator = orchestrator.with_confirm(Arc::new(TerminalConfirm));
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight transitions");
            on_interrupt.cancel();
        }
    });

    if args.watch {
        let interval = args
            .interval
            .map(std::time::Duration::from_secs)
            .unwrap_or_else(|| config.interval());
        orchestrator
            .run_periodic(mode, capacity, interval, cancel, |plan| {
                print!("{}", render::render_plan(plan));
            })
            .await?;
    } else {
        match orchestrator.orchestrate(mode, capacity, cancel).await {
            Ok(plan) => print!("{}", render::render_plan(&plan)),
            // Another pass holding the run lease is not a failure of this one.
            Err(FlowError::Conflict(reason)) => {
                tracing::warn!(%reason, "orchestration pass skipped");
                println!("skipped: {reason}");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn serve(port: u16, engine: LifecycleEngine, config: &Config) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(engine).with_config(config.orchestrator());
    let state = AppState::new(orchestrator, config.decomposer()).with_capacity(config.capacity);
    let app = api::create_router(state, SecurityConfig::from_config(config));

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}"))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tracing::info!(port, "epicflow API listening on http://127.0.0.1:{port}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
