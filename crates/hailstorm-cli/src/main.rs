use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use hailstorm_core::cluster::ec2_cli::AwsCliFactory;
use hailstorm_core::config::ProjectConfig;
use hailstorm_core::error::HailstormError;
use hailstorm_core::project::{
    AppContext, ProjectCoordinator, PurgeScope, ResultsOp, ResultsOutcome,
};
use hailstorm_core::remote::process::OpenSshShell;
use hailstorm_core::remote::RemoteExecutor;
use hailstorm_core::store::Store;
use hailstorm_core::testplan::JmxPlanParser;
use hailstorm_core::workspace::Workspace;

const EXIT_OK: u8 = 0;
const EXIT_UNKNOWN: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CYCLE_CONFLICT: u8 = 3;
const EXIT_TRANSIENT: u8 = 4;

#[derive(Parser)]
#[command(name = "hailstorm", about = "Distributed load-test orchestration")]
struct Cli {
    /// Project name (slugified into the project code).
    #[arg(long, global = true, default_value = "hailstorm")]
    project: String,

    /// Root directory for project workspaces.
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Path to the project configuration (JSON).
    #[arg(long, global = true, default_value = "config/hailstorm.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the declared configuration to clusters and target hosts.
    Setup {
        /// Re-run even when the configuration is unchanged.
        #[arg(long)]
        force: bool,
    },
    /// Start a new execution cycle.
    Start {
        /// Force a fresh setup and redeploy before generating load.
        #[arg(long)]
        redeploy: bool,
    },
    /// Stop the current execution cycle and collect results.
    Stop {
        /// Wait for the generators to finish on their own.
        #[arg(long)]
        wait: bool,
        /// Stop the agent hosts after the generators exit.
        #[arg(long)]
        suspend: bool,
    },
    /// Forcefully abort the current execution cycle.
    Abort {
        #[arg(long)]
        suspend: bool,
    },
    /// Release all backend resources.
    Terminate,
    /// Inspect, exclude/include, export/import or report cycles.
    Results {
        #[command(subcommand)]
        op: ResultsCommand,
    },
    /// List agents still generating load.
    Status,
    /// Delete recorded data.
    Purge {
        /// `tests` removes cycles and stats; `all` removes the project.
        #[arg(default_value = "tests")]
        scope: String,
    },
}

#[derive(Subcommand)]
enum ResultsCommand {
    Show {
        cycle_ids: Vec<i64>,
    },
    Exclude {
        cycle_id: i64,
    },
    Include {
        cycle_id: i64,
    },
    Export {
        cycle_ids: Vec<i64>,
        #[arg(long)]
        destination: Option<PathBuf>,
    },
    Import {
        file: PathBuf,
        #[arg(long)]
        plan: Option<String>,
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long)]
        cycle_id: Option<i64>,
    },
    Report {
        cycle_ids: Vec<i64>,
    },
}

fn optional_ids(ids: Vec<i64>) -> Option<Vec<i64>> {
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

fn exit_code_for(err: &HailstormError) -> u8 {
    match err {
        HailstormError::Configuration(_)
        | HailstormError::Setup(_)
        | HailstormError::IdentityFileConflict(_) => EXIT_CONFIG,
        HailstormError::ExecutionCycleExists(_)
        | HailstormError::ExecutionCycleNotExists(_) => EXIT_CYCLE_CONFLICT,
        HailstormError::TransientHost { .. } | HailstormError::Timeout(_) => EXIT_TRANSIENT,
        _ => EXIT_UNKNOWN,
    }
}

async fn load_config(path: &PathBuf) -> Result<ProjectConfig, HailstormError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        HailstormError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        HailstormError::Configuration(format!("invalid configuration {}: {e}", path.display()))
    })
}

async fn run(cli: Cli) -> Result<(), HailstormError> {
    let config = load_config(&cli.config).await?;

    let workspace = Workspace::new(&cli.workspace);
    let code = hailstorm_core::model::slugify_project_code(&cli.project);
    let db_dir = workspace.db_dir(&code);
    tokio::fs::create_dir_all(&db_dir).await?;
    let store = Store::open(db_dir.join("hailstorm.db"))?;

    let ctx = AppContext {
        store,
        workspace,
        executor: RemoteExecutor::new(Arc::new(OpenSshShell::new())),
        ec2_factory: Arc::new(AwsCliFactory),
        plan_parser: Arc::new(JmxPlanParser),
    };
    let coordinator = ProjectCoordinator::new(ctx);

    match cli.command {
        Command::Setup { force } => {
            let project = coordinator.setup(&cli.project, &config, force).await?;
            println!("project '{}' configured", project.project_code);
        }
        Command::Start { redeploy } => {
            let cycle = coordinator.start(&cli.project, &config, redeploy).await?;
            println!("cycle {} started with {} threads", cycle.id, cycle.threads_count.unwrap_or(0));
        }
        Command::Stop { wait, suspend } => {
            let cycle = coordinator.stop(&cli.project, &config, wait, suspend).await?;
            println!("cycle {} stopped", cycle.id);
        }
        Command::Abort { suspend } => {
            coordinator.abort(&cli.project, &config, suspend).await?;
            println!("cycle aborted");
        }
        Command::Terminate => {
            coordinator.terminate(&cli.project, &config).await?;
            println!("all backend resources released");
        }
        Command::Results { op } => {
            let op = match op {
                ResultsCommand::Show { cycle_ids } => ResultsOp::Show {
                    cycle_ids: optional_ids(cycle_ids),
                },
                ResultsCommand::Exclude { cycle_id } => ResultsOp::Exclude { cycle_id },
                ResultsCommand::Include { cycle_id } => ResultsOp::Include { cycle_id },
                ResultsCommand::Export {
                    cycle_ids,
                    destination,
                } => ResultsOp::Export {
                    cycle_ids: optional_ids(cycle_ids),
                    destination,
                },
                ResultsCommand::Import {
                    file,
                    plan,
                    cluster,
                    cycle_id,
                } => ResultsOp::Import {
                    file,
                    plan_name: plan,
                    cluster,
                    cycle_id,
                },
                ResultsCommand::Report { cycle_ids } => ResultsOp::Report {
                    cycle_ids: optional_ids(cycle_ids),
                },
            };
            match coordinator.results(&cli.project, &config, op).await? {
                ResultsOutcome::Cycles(cycles) => {
                    for cycle in cycles {
                        println!(
                            "{}\t{}\t{}\t{}",
                            cycle.id,
                            cycle.status,
                            cycle.started_at.to_rfc3339(),
                            cycle
                                .threads_count
                                .map(|t| t.to_string())
                                .unwrap_or_else(|| "-".to_string())
                        );
                    }
                }
                ResultsOutcome::Excluded(id) => println!("cycle {id} excluded"),
                ResultsOutcome::Included(id) => println!("cycle {id} included"),
                ResultsOutcome::Exported { path, files } => {
                    println!("{files} files exported to {}", path.display())
                }
                ResultsOutcome::Imported { cycle_id } => {
                    println!("samples imported into cycle {cycle_id}")
                }
                ResultsOutcome::Reported { path } => {
                    println!("report written to {}", path.display())
                }
            }
        }
        Command::Status => {
            let agents = coordinator.status(&cli.project, &config).await?;
            if agents.is_empty() {
                println!("no load generation in progress");
            } else {
                for agent in agents {
                    println!(
                        "{}\t{}\t{}\tpid {}",
                        agent.id,
                        agent.role,
                        agent.public_ip_address.as_deref().unwrap_or("-"),
                        agent.jmeter_pid.map(|p| p.to_string()).unwrap_or_default()
                    );
                }
            }
        }
        Command::Purge { scope } => {
            let scope = match scope.as_str() {
                "tests" => PurgeScope::Tests,
                "all" => PurgeScope::All,
                other => {
                    return Err(HailstormError::UnknownCommand(format!(
                        "purge scope '{other}' (expected 'tests' or 'all')"
                    )))
                }
            };
            coordinator.purge(&cli.project, scope).await?;
            println!("purged");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            error!(%err, "command failed");
            eprintln!("error: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
