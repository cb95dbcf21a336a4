//! permgraph - offline administration for permission graphs and audit logs
//!
//! Runs the batch operations (integrity validation, bulk signature
//! verification, statistics, path queries) directly against a `SQLite`
//! database.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::exit_codes;

/// permgraph - permission dependency graph and activity log administration
#[derive(Parser, Debug)]
#[command(name = "permgraph")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults to ./permgraph.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file, overriding `[database] path`
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Audit the dependency graph for cycles and dangling edges
    Validate {
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify the signature of every stored activity
    VerifyActivities {
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print graph and activity statistics as JSON
    Stats,

    /// Print the shortest dependency path between two permissions
    Path {
        /// Dependent permission name (e.g. `users.delete`)
        from: String,

        /// Required permission name (e.g. `dashboard.view`)
        to: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let ctx = match commands::Context::load(cli.config.as_deref(), cli.database) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(i32::from(exit_codes::ERROR));
        },
    };

    // Subcommands report findings through exit codes:
    // 0=clean, 1=findings (invalid graph, tampered records, no path), 2=error
    let exit_code = match cli.command {
        Commands::Validate { json } => commands::validate::run(&ctx, json),
        Commands::VerifyActivities { json } => commands::verify::run(&ctx, json),
        Commands::Stats => commands::stats::run(&ctx),
        Commands::Path { from, to } => commands::path::run(&ctx, &from, &to),
    };
    std::process::exit(i32::from(exit_code));
}
