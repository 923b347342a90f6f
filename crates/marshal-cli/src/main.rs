mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    audit::AuditSubcommand, dlq::DlqSubcommand, run::RunComponent, submit::SubmitArgs,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "marshal",
    about = "Approval-gated action pipeline — ingest signals, gate risky actions, execute with bounded retry",
    version,
    propagate_version = true
)]
struct Cli {
    /// Workspace root (default: auto-detect from .marshal/ or .git/)
    #[arg(long, global = true, env = "MARSHAL_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the marshal workspace in the current project
    Init,

    /// Create an approval request
    Submit(SubmitArgs),

    /// List records, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one record
    Show { id: String },

    /// Record an approve verdict on a pending record
    Approve {
        id: String,
        /// Who is approving
        #[arg(long, default_value = "operator")]
        by: String,
    },

    /// Record a reject verdict on a pending record
    Reject {
        id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, default_value = "operator")]
        by: String,
    },

    /// Run a long-running component loop
    Run {
        #[command(subcommand)]
        component: RunComponent,
    },

    /// Search and maintain the audit log
    Audit {
        #[command(subcommand)]
        subcommand: AuditSubcommand,
    },

    /// Inspect and replay the dead-letter queue
    Dlq {
        #[command(subcommand)]
        subcommand: DlqSubcommand,
    },

    /// Pipeline health probe (exit 0 healthy, 1 degraded, 2 critical)
    Health,

    /// Record counts, DLQ depth, and recent activity
    Status,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Submit(args) => cmd::submit::run(&root, args, cli.json),
        Commands::List { status } => cmd::record::list(&root, status.as_deref(), cli.json),
        Commands::Show { id } => cmd::record::show(&root, &id, cli.json),
        Commands::Approve { id, by } => cmd::record::approve(&root, &id, &by, cli.json),
        Commands::Reject { id, reason, by } => {
            cmd::record::reject(&root, &id, reason, &by, cli.json)
        }
        Commands::Run { component } => cmd::run::run(&root, component),
        Commands::Audit { subcommand } => cmd::audit::run(&root, subcommand, cli.json),
        Commands::Dlq { subcommand } => cmd::dlq::run(&root, subcommand, cli.json),
        Commands::Health => match cmd::health::run(&root, cli.json) {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("error: {e:#}");
                std::process::exit(2);
            }
        },
        Commands::Status => cmd::status::run(&root, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
