//! # stewardd
//! Serves the gpu-steward admin API and offers the same lifecycle
//! operations from the command line.

use anyhow::{Context, Result};
use async_std::task;
use clap::{Parser, Subcommand};
use colored::*;
use futures::channel::mpsc;
use futures::StreamExt;
use gpu_steward::{EngineKind, RuntimeState, Steward, StewardConfig};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Drive resources with the stub engine (no network, no GPUs)
    #[arg(long, global = true)]
    stub: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the admin HTTP API
    Serve {
        /// HTTP server address (overrides STEWARD_ADDR)
        #[arg(long)]
        addr: Option<String>,
        /// Load every resource at startup
        #[arg(long)]
        eager: bool,
    },
    /// Download the artifacts of a resource
    Download {
        /// Resource name (e.g. llm, asr, diarizer)
        name: String,
    },
    /// Print every resource with its state
    Status {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the accelerator software stack
    Deps,
    /// Store or clear the hub access token
    Token {
        /// New token; omit to clear
        value: Option<String>,
    },
}

fn init_logging(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level)
        .write_style("STEWARD_LOG_STYLE");
    let _ = env_logger::Builder::from_env(env).try_init();
}

#[async_std::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = StewardConfig::from_env()?;
    if cli.stub {
        config.engine = EngineKind::Stub;
    }
    init_logging(&config.log_level);

    match cli.command {
        Commands::Serve { addr, eager } => {
            if let Some(addr) = addr {
                config.addr = addr;
            }
            if eager {
                config.lazy_load = false;
            }
            serve(config).await?;
        }
        Commands::Download { name } => {
            // Downloads only; keep startup from preloading anything.
            config.lazy_load = true;
            let steward = Steward::start(config).await?;
            let result = download_with_progress(&steward, &name).await;
            steward.shutdown().await;
            result?;
        }
        Commands::Status { json } => {
            config.lazy_load = true;
            let steward = Steward::start(config).await?;
            let snapshot = steward.snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                for resource in snapshot.resources.values() {
                    let state = resource.runtime.state.to_string();
                    let state = match resource.runtime.state {
                        RuntimeState::ReadyLoaded => state.green(),
                        RuntimeState::ReadyCached => state.cyan(),
                        RuntimeState::Error => state.red(),
                        _ => state.normal(),
                    };
                    println!(
                        "{:<10} {:<14} {:<45} {}",
                        resource.name.bold(),
                        state,
                        resource.identifier,
                        resource.task.dimmed()
                    );
                }
            }
            steward.shutdown().await;
        }
        Commands::Deps => {
            config.lazy_load = true;
            let steward = Steward::start(config).await?;
            for dep in steward.inspect_dependencies().await {
                let version = dep.version.as_deref().unwrap_or("-");
                match &dep.error {
                    None => println!("{} {:<14} {}", "✔".green(), dep.component, version),
                    Some(e) => println!(
                        "{} {:<14} {} ({})",
                        "✘".red(),
                        dep.component,
                        version,
                        e.yellow()
                    ),
                }
            }
            steward.shutdown().await;
        }
        Commands::Token { value } => {
            config.lazy_load = true;
            let steward = Steward::start(config).await?;
            let clearing = value.is_none();
            steward.registry().set_credential(value)?;
            if clearing {
                println!("🔑 Access token cleared");
            } else {
                println!("🔑 Access token stored");
            }
            steward.shutdown().await;
        }
    }

    Ok(())
}

async fn serve(config: StewardConfig) -> Result<()> {
    let addr = config.addr.clone();
    let steward = Arc::new(Steward::start(config).await?);

    let (stop_tx, mut stop_rx) = mpsc::unbounded::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.unbounded_send(());
    })
    .context("installing the Ctrl-C handler")?;
    let on_stop = steward.clone();
    task::spawn(async move {
        if stop_rx.next().await.is_some() {
            info!("Shutting down");
            on_stop.shutdown().await;
            std::process::exit(0);
        }
    });

    println!("🚀 gpu-steward admin API on http://{}", addr.cyan());
    stewardd::app(steward.registry().clone())
        .listen(addr.clone())
        .await
        .with_context(|| format!("serving on {}", addr))?;
    Ok(())
}

async fn download_with_progress(steward: &Steward, name: &str) -> Result<()> {
    let registry = steward.registry().clone();
    let handle = registry.handle(name)?.clone();
    println!("📥 Downloading {} ({})", name.cyan(), handle.spec().repo);

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .context("progress bar template")?
            .progress_chars("#>-"),
    );

    let mut worker = {
        let handle = handle.clone();
        task::spawn(async move { handle.ensure_downloaded().await })
    };
    let result = loop {
        match async_std::future::timeout(Duration::from_millis(200), &mut worker).await {
            Ok(result) => break result,
            Err(_) => {
                let status = handle.status();
                pb.set_position(status.progress as u64);
                pb.set_message(status.status_message);
            }
        }
    };

    match result {
        Ok(()) => {
            pb.set_position(100);
            pb.finish_with_message("done");
            println!("✅ {} cached in {}", name.green(), handle.artifact_dir().display());
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            eprintln!("❌ {}", e.to_string().red());
            Err(e.into())
        }
    }
}
