use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod jobs;

const DEFAULT_STORE_PATH: &str = "data/conversations.json";
const DEFAULT_OUTPUTS_ROOT: &str = "outputs";

#[derive(Parser)]
#[command(name = "confab")]
#[command(about = "Conversation store maintenance jobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clear placeholder-only assistant messages left by lost tool calls
    Scrub {
        #[arg(long, default_value = DEFAULT_STORE_PATH)]
        store: PathBuf,
        /// Report changes without writing the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Collapse adjacent duplicate messages
    Dedupe {
        #[arg(long, default_value = DEFAULT_STORE_PATH)]
        store: PathBuf,
        /// Report changes without writing the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Backfill generated-file provenance from assistant text
    Reconcile {
        #[arg(long, default_value = DEFAULT_STORE_PATH)]
        store: PathBuf,
        /// Directory holding generated output files
        #[arg(long, default_value = DEFAULT_OUTPUTS_ROOT)]
        outputs_root: PathBuf,
        /// Report changes without writing the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Backfill or overwrite conversation owners
    AssignOwner {
        /// Owner to assign
        #[arg(long)]
        username: String,
        /// Only replace absent, empty, or anonymous owners (the default)
        #[arg(long, conflicts_with = "all")]
        only_empty: bool,
        /// Overwrite every owner unconditionally
        #[arg(long)]
        all: bool,
        #[arg(long, default_value = DEFAULT_STORE_PATH)]
        store: PathBuf,
        /// Report changes without writing the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Copy legacy shared files into per-conversation directories
    ResolveFiles {
        #[arg(long, default_value = DEFAULT_STORE_PATH)]
        store: PathBuf,
        /// Directory holding per-conversation output scopes
        #[arg(long, default_value = DEFAULT_OUTPUTS_ROOT)]
        outputs_root: PathBuf,
        /// Shared directory files lived in before per-conversation scoping;
        /// defaults to the outputs root
        #[arg(long)]
        legacy_root: Option<PathBuf>,
        /// Report copies without touching any file
        #[arg(long)]
        dry_run: bool,
    },
    /// Run every pass in order behind a single backup
    Run {
        #[arg(long, default_value = DEFAULT_STORE_PATH)]
        store: PathBuf,
        #[arg(long, default_value = DEFAULT_OUTPUTS_ROOT)]
        outputs_root: PathBuf,
        #[arg(long)]
        legacy_root: Option<PathBuf>,
        /// Owner to backfill; ownership assignment is skipped when absent
        #[arg(long)]
        username: Option<String>,
        /// Overwrite every owner instead of only empty or anonymous ones
        #[arg(long)]
        all: bool,
        /// Report changes without writing the store or copying files
        #[arg(long)]
        dry_run: bool,
    },
    /// Read-only report of what every pass would change
    Check {
        #[arg(long, default_value = DEFAULT_STORE_PATH)]
        store: PathBuf,
        #[arg(long, default_value = DEFAULT_OUTPUTS_ROOT)]
        outputs_root: PathBuf,
        #[arg(long)]
        legacy_root: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scrub { store, dry_run } => jobs::scrub(&store, dry_run),
        Commands::Dedupe { store, dry_run } => jobs::dedupe(&store, dry_run),
        Commands::Reconcile {
            store,
            outputs_root,
            dry_run,
        } => jobs::reconcile(&store, &outputs_root, dry_run),
        Commands::AssignOwner {
            username,
            only_empty: _,
            all,
            store,
            dry_run,
        } => jobs::assign_owner(&store, &username, !all, dry_run),
        Commands::ResolveFiles {
            store,
            outputs_root,
            legacy_root,
            dry_run,
        } => jobs::resolve_files(&store, &outputs_root, legacy_root.as_deref(), dry_run),
        Commands::Run {
            store,
            outputs_root,
            legacy_root,
            username,
            all,
            dry_run,
        } => jobs::run_all(&jobs::RunOptions {
            store,
            outputs_root,
            legacy_root,
            username,
            only_empty: !all,
            dry_run,
        }),
        Commands::Check {
            store,
            outputs_root,
            legacy_root,
        } => jobs::check(&store, &outputs_root, legacy_root.as_deref()),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
