//! pedia CLI tool
//!
//! ## Commands
//!
//! - `build`: one full two-pass build of the project
//! - `serve`: build dashboard with file watching and rebuild on change
//! - `invalidate <paths>|--all`: drop build cache entries
//! - `debug <input>`: run pass 1 on one input and print everything the engine said

use clap::{Parser, Subcommand};
use pedia_core::{
    build::{BuildDriver, CancelSignal},
    cache::BuildCache,
    config::BuildConfig,
    engine::{ProcessEngine, TexEngine},
    messages::{BroadcastBus, LogBus},
    serve::{DashboardServer, ServeCommand},
    watch::InputWatcher,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pedia")]
#[command(author, version, about = "Build driver for the Tectonopedia", long_about = None)]
struct Cli {
    /// Project root containing pedia.toml
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every input once
    Build {
        /// Number of concurrent engine jobs (default: pedia.toml, then CPU count)
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Serve the build dashboard and rebuild when sources change
    Serve {
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Drop cached results so the next build recompiles
    Invalidate {
        /// Inputs to invalidate, relative to the project root
        paths: Vec<PathBuf>,

        /// Drop every cache entry
        #[arg(long, conflicts_with = "paths")]
        all: bool,
    },

    /// Run pass 1 on one input in debug mode
    Debug {
        /// Input path relative to the project root
        input: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let root = cli.root.canonicalize()?;
    let config = BuildConfig::load(&root)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Build { jobs } => runtime.block_on(async move {
            let engine = ProcessEngine::from_config(&config.engine);
            let driver = BuildDriver::new(config, engine, LogBus)
                .await?
                .with_workers(jobs.unwrap_or(0));

            let cancel = CancelSignal::new();
            let on_interrupt = cancel.clone();
            ctrlc::set_handler(move || {
                eprintln!("\nCancelling build...");
                on_interrupt.cancel();
            })?;

            let summary = driver.build(&cancel).await?;
            println!(
                "{:?}: pass 1 {} compiled / {} cached, pass 2 {} compiled / {} cached, {} output(s) in {:.1}s",
                summary.state,
                summary.pass1.compiled,
                summary.pass1.cached,
                summary.pass2.compiled,
                summary.pass2.cached,
                summary.outputs.len(),
                summary.elapsed
            );
            if !summary.success() {
                std::process::exit(1);
            }
            Ok::<(), Box<dyn std::error::Error>>(())
        })?,

        Commands::Serve { jobs } => runtime.block_on(async move {
            let engine = ProcessEngine::from_config(&config.engine);
            let watch_roots = config.watch_roots();
            let driver = BuildDriver::new(config, engine, BroadcastBus::default())
                .await?
                .with_workers(jobs.unwrap_or(0));
            let server = DashboardServer::new(driver);

            let quit = server.commander();
            ctrlc::set_handler(move || {
                eprintln!("\nShutting down...");
                let _ = quit.blocking_send(ServeCommand::Quit);
            })?;
            let watcher = InputWatcher::start(&watch_roots, server.commander())?;

            server.run().await?;
            watcher.stop();
            Ok::<(), Box<dyn std::error::Error>>(())
        })?,

        Commands::Invalidate { paths, all } => runtime.block_on(async move {
            let salt = ProcessEngine::from_config(&config.engine).salt();
            let cache = BuildCache::open(&config.cache_db(), salt).await?;
            if all {
                let n = cache.invalidate_all().await?;
                println!("Dropped {n} cache entries");
                return Ok(());
            }
            for path in paths.iter() {
                let abs = if path.is_absolute() {
                    path.clone()
                } else {
                    root.join(path)
                };
                let rel = config.relative_path(&abs)?;
                cache.invalidate(&rel).await?;
                println!("Invalidated {rel}");
            }
            Ok::<(), Box<dyn std::error::Error>>(())
        })?,

        Commands::Debug { input } => runtime.block_on(async move {
            let engine = ProcessEngine::from_config(&config.engine);
            let driver = BuildDriver::new(config, engine, LogBus).await?;
            driver.debug_input(&input).await?;
            Ok::<(), Box<dyn std::error::Error>>(())
        })?,
    }

    Ok(())
}
