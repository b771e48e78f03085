//! Concord CLI: batch matching of target collections against canonical entries.
//!
//! Usage:
//!   concord run [--collection C]... [--backend NAME]... [--reverse] [--dry-run]
//!   concord resume <checkpoint.json> [--backend NAME]... [--dry-run]
//!   concord pending [--collection C]...
//!   concord checkpoints
//!   concord import <records.json>

use clap::{Parser, Subcommand};
use concord::config::default_db_path;
use concord::run::RunReport;
use concord::{
    BatchPacker, CheckpointManager, Config, ImportBundle, OpenStore, PackOptions, RecordStore,
    RunController, RunStatus, SqliteStore,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "concord",
    version,
    about = "Resilient batch matching through a chain of generative backends"
)]
struct Cli {
    /// Path to SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Path to YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match every collection that still has unassigned items
    Run {
        /// Restrict the run to these collections
        #[arg(long = "collection")]
        collections: Vec<String>,
        /// Use only these backends, in this order
        #[arg(long = "backend")]
        backends: Vec<String>,
        /// Pack smallest collections first, filling batches by unit cap only
        #[arg(long)]
        reverse: bool,
        /// Classify and report without writing to the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Continue an aborted run from its checkpoint file
    Resume {
        /// Checkpoint written by the aborted run
        checkpoint: PathBuf,
        /// Use only these backends, in this order
        #[arg(long = "backend")]
        backends: Vec<String>,
        /// Classify and report without writing to the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Show outstanding work and how it would be batched
    Pending {
        #[arg(long = "collection")]
        collections: Vec<String>,
        #[arg(long)]
        reverse: bool,
    },
    /// List checkpoint files
    Checkpoints,
    /// Load canonical entries and target items from a JSON file
    Import {
        /// JSON document with `canonical_entries` and `target_items`
        path: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CONCORD_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "concord=debug,info"
        } else {
            "concord=info,warn"
        })
    });

    let format = env::var("CONCORD_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore, String> {
    let db_path = db.unwrap_or_else(default_db_path);
    SqliteStore::open(&db_path).map_err(|e| format!("Failed to open database: {}", e))
}

fn filter_of(collections: &[String]) -> Option<&[String]> {
    if collections.is_empty() {
        None
    } else {
        Some(collections)
    }
}

fn controller(
    config: &Config,
    store: Arc<dyn RecordStore>,
    backends: &[String],
    dry_run: bool,
) -> Result<RunController, String> {
    let descriptors = config
        .backend_descriptors(backends)
        .map_err(|e| e.to_string())?;
    if descriptors.is_empty() {
        return Err("no backends configured; add a `backends` section to the config".to_string());
    }
    let controller = RunController::from_config(config, store, descriptors)
        .map_err(|e| e.to_string())?
        .dry_run(dry_run);

    let token = controller.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received; stopping after the current batch");
            token.cancel();
        }
    });
    Ok(controller)
}

fn report(outcome: Result<RunReport, concord::RunError>, dry_run: bool) -> i32 {
    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    if dry_run {
        println!("Dry run: nothing was written to the store.");
    }
    println!("{}", report.stats);
    for path in &report.artifacts {
        println!("Review file: {}", path.display());
    }
    if let Some(e) = &report.artifact_error {
        eprintln!("Warning: review records not written: {}", e);
    }

    match &report.status {
        RunStatus::Completed => 0,
        RunStatus::Aborted { reason, .. } => {
            eprintln!("Run aborted: {}", reason);
            if let Some(path) = &report.checkpoint_path {
                eprintln!("Resume later with: concord resume {}", path.display());
            }
            1
        }
    }
}

async fn cmd_run(
    config: &Config,
    store: SqliteStore,
    collections: &[String],
    backends: &[String],
    reverse: bool,
    dry_run: bool,
) -> i32 {
    let controller = match controller(config, Arc::new(store), backends, dry_run) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let packer = BatchPacker::new(config.packing.clone());
    let opts = PackOptions {
        reverse: reverse || config.packing.reverse,
        priority_score: None,
    };
    report(
        controller.run_pending(&packer, filter_of(collections), &opts).await,
        dry_run,
    )
}

async fn cmd_resume(
    config: &Config,
    store: SqliteStore,
    checkpoint: &PathBuf,
    backends: &[String],
    dry_run: bool,
) -> i32 {
    let checkpoint = match CheckpointManager::load(checkpoint) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    println!(
        "Resuming {} batches ({} units) stopped by: {}",
        checkpoint.remaining_batches.len(),
        checkpoint.remaining_units(),
        checkpoint.reason
    );
    let controller = match controller(config, Arc::new(store), backends, dry_run) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    report(controller.resume(&checkpoint).await, dry_run)
}

fn cmd_pending(config: &Config, store: &SqliteStore, collections: &[String], reverse: bool) -> i32 {
    let work = match store.work_items(filter_of(collections)) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if work.is_empty() {
        println!("Nothing pending.");
        return 0;
    }

    println!("{:<32}  {:>7}  {:>7}", "COLLECTION", "TOTAL", "PENDING");
    println!("{}", "-".repeat(50));
    for item in &work {
        println!("{:<32}  {:>7}  {:>7}", item.id, item.total_count, item.pending_count);
    }

    let packer = BatchPacker::new(config.packing.clone());
    let opts = PackOptions {
        reverse: reverse || config.packing.reverse,
        priority_score: None,
    };
    let batches = packer.pack(&work, &opts);
    println!("\n{} batches:", batches.len());
    for (index, batch) in batches.iter().enumerate() {
        println!(
            "  {:>3}. [{}] {} units: {}",
            index + 1,
            batch.size_class,
            batch.total_pending,
            batch.label()
        );
    }
    0
}

fn cmd_checkpoints(config: &Config) -> i32 {
    let manager = CheckpointManager::new(&config.paths.checkpoint_dir);
    let files = match manager.list() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if files.is_empty() {
        println!("No checkpoints in {}", manager.dir().display());
        return 0;
    }
    for path in files {
        match CheckpointManager::load(&path) {
            Ok(cp) => println!(
                "{}  {:?}  {} batches left  ({})",
                path.display(),
                cp.status,
                cp.remaining_batches.len(),
                cp.reason
            ),
            Err(e) => println!("{}  unreadable: {}", path.display(), e),
        }
    }
    0
}

fn cmd_import(store: &SqliteStore, path: &PathBuf) -> i32 {
    let bundle = match ImportBundle::load(path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error: cannot read '{}': {}", path.display(), e);
            return 1;
        }
    };
    match bundle.write_to(store) {
        Ok(summary) => {
            println!(
                "Imported {} canonical entries ({} already present) and {} target items",
                summary.canonical_entries, summary.canonical_skipped, summary.target_items
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Commands::Checkpoints = cli.command {
        std::process::exit(cmd_checkpoints(&config));
    }

    let store = match open_store(cli.db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Run {
            collections,
            backends,
            reverse,
            dry_run,
        } => cmd_run(&config, store, &collections, &backends, reverse, dry_run).await,
        Commands::Resume {
            checkpoint,
            backends,
            dry_run,
        } => cmd_resume(&config, store, &checkpoint, &backends, dry_run).await,
        Commands::Pending {
            collections,
            reverse,
        } => cmd_pending(&config, &store, &collections, reverse),
        Commands::Import { path } => cmd_import(&store, &path),
        Commands::Checkpoints => cmd_checkpoints(&config),
    };
    std::process::exit(code);
}
