mod commands;

use clap::{Parser, Subcommand};
use commands::backup::BackupArgs;
use commands::plan::PlanMode;
use commands::restore::RestoreArgs;
use commands::{object_transport_enabled, Session, EXIT_CANCELLED, OBJECT_TRANSPORT_ENV};
use imgshift_core::{install_signal_handler, shutdown_requested};
use imgshift_registry::CancelToken;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "imgshift",
    version,
    about = "Relocate image stream images between registries during backup and restore"
)]
struct Cli {
    /// Path to an imgshift.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bearer token for the internal registry (overrides registry.token_file).
    #[arg(long, global = true)]
    token: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Copy local images to the migration registry and update digests.
    Backup(BackupArgs),
    /// Copy images from the migration registry into the internal registry.
    Restore(RestoreArgs),
    /// Show the copies a backup or restore would perform.
    Plan {
        #[command(subcommand)]
        mode: PlanMode,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("IMGSHIFT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let object_transport =
        object_transport_enabled(std::env::var(OBJECT_TRANSPORT_ENV).ok().as_deref());
    let cancel = CancelToken::new();
    install_signal_handler(cancel.clone());

    let result = Session::open(
        cli.config.as_deref(),
        cli.token,
        object_transport,
        cli.json,
        cancel,
    )
    .and_then(|session| match &cli.command {
        Commands::Backup(args) => commands::backup::run(&session, args),
        Commands::Restore(args) => commands::restore::run(&session, args),
        Commands::Plan { mode } => commands::plan::run(&session, mode),
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(failure) => {
            eprintln!("error: {}", failure.message);
            let code = if shutdown_requested() {
                EXIT_CANCELLED
            } else {
                failure.code
            };
            ExitCode::from(code)
        }
    }
}
