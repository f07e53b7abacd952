mod commands;

use anyhow::Result;
use bolong_core::{Config, Engine};
use clap::{Parser, Subcommand};
use commands::backup::BackupCommand;
use commands::dumpindex::DumpIndexCommand;
use commands::list::ListCommand;
use commands::listfiles::ListFilesCommand;
use commands::restore::RestoreCommand;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "bolong",
    about = "Incremental, encrypted directory backups to a local or S3-style store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        long,
        help = "Path to .bolong.json (default: search upward from the working directory)"
    )]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Print per-file activity")]
    verbose: bool,

    #[arg(short, long, help = "Be quiet, do not show progress")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create a new snapshot of a directory")]
    Backup(BackupCommand),

    #[command(about = "Restore a snapshot into a destination directory")]
    Restore(RestoreCommand),

    #[command(about = "List snapshots at the remote")]
    List(ListCommand),

    #[command(about = "List the files in a snapshot")]
    Listfiles(ListFilesCommand),

    #[command(about = "Print a snapshot's index in its textual form")]
    Dumpindex(DumpIndexCommand),

    #[command(about = "Print the version")]
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    if let Err(e) = run(&cli).await {
        eprintln!("bolong: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    if let Commands::Version = cli.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let engine = open_engine(cli)?;
    match &cli.command {
        Commands::Backup(cmd) => cmd.run(&engine).await,
        Commands::Restore(cmd) => cmd.run(&engine, cli.quiet).await,
        Commands::List(cmd) => cmd.run(&engine).await,
        Commands::Listfiles(cmd) => cmd.run(&engine).await,
        Commands::Dumpindex(cmd) => cmd.run(&engine).await,
        Commands::Version => unreachable!("handled above"),
    }
}

fn open_engine(cli: &Cli) -> Result<Engine> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::find(&std::env::current_dir()?)?,
    };
    let config = Config::load(&config_path)?;
    let remote = bolong_backends::open(&config)?;
    Ok(Engine::new(config, remote)?)
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "bolong_cli={level},bolong_core={level},bolong_backends={level}"
        )))
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default subscriber failed");
}
