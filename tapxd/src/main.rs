use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use tapx_core::config::{load_configs, Config};
use tapx_core::observability::{init_logging, start_metrics};
use tapxd::{emitter, runtime};

const DEFAULT_EXIT_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Parser)]
#[command(name = "tapxd", about = "tapx traffic recorder and replayer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture and replay traffic until stopped or timed out.
    Run {
        #[arg(short, long, required = true, num_args = 1..)]
        config: Vec<PathBuf>,
        /// Override the configured exit-after window, in seconds.
        #[arg(long)]
        exit_after_secs: Option<u64>,
    },
    /// Validate the configuration and exit.
    Check {
        #[arg(short, long, required = true, num_args = 1..)]
        config: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            exit_after_secs,
        } => {
            let mut config = load_configs(&config)?;
            if let Some(secs) = exit_after_secs {
                config.exit_after_secs = secs;
            }
            run_with_runtime(config)
        }
        Command::Check { config } => {
            let _ = load_configs(&config)?;
            println!("config ok");
            Ok(())
        }
    }
}

fn run_with_runtime(config: Config) -> Result<()> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(worker_threads) = config.runtime.worker_threads {
        builder.worker_threads(worker_threads);
    }
    if let Some(max_blocking_threads) = config.runtime.max_blocking_threads {
        builder.max_blocking_threads(max_blocking_threads);
    }
    builder.enable_all();
    let runtime = builder.build()?;
    let exit_code = runtime.block_on(run(config))?;
    std::process::exit(exit_code);
}

async fn run(config: Config) -> Result<i32> {
    let _log_guards = init_logging(&config.system_log)?;
    if let Some(metrics) = &config.metrics {
        start_metrics(metrics)?;
    }

    let pipeline = runtime::Pipeline::build(&config).await?;
    let mut emitter = emitter::Emitter::new(&config.emitter, &config.modifier)?;
    emitter.start(pipeline.inputs.clone(), pipeline.outputs.clone());

    let exit_after = if config.exit_after_secs == 0 {
        DEFAULT_EXIT_AFTER
    } else {
        Duration::from_secs(config.exit_after_secs)
    };
    let logreplay_configured = config.outputs.logreplay.is_some();
    tokio::spawn(async move {
        tokio::time::sleep(exit_after / 2).await;
        if logreplay_configured {
            info!(
                remaining_secs = (exit_after / 2).as_secs(),
                "recording window is half over"
            );
        }
    });

    info!("tapxd started");
    let exit_code = tokio::select! {
        _ = shutdown_signal() => {
            warn!("terminated by signal");
            1
        }
        _ = tokio::time::sleep(exit_after) => {
            info!(after_secs = exit_after.as_secs(), "recording window elapsed");
            0
        }
    };

    pipeline.shutdown();
    emitter.close().await;
    Ok(exit_code)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
        _ = quit.recv() => {}
    }
}
