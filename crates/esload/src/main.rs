//! esload - Main entry point

use clap::Parser;
use esload::{write_report, Cli, Pipeline};
use esload_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Exit status when the run was interrupted (128 + SIGINT)
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Verbose mode logs debug to the console; otherwise only warnings and errors
    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn })
        .output(LogOutput::Console)
        .log_file_prefix("esload")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI works without logging
    let guard = init_logging(&log_config).ok();

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Run failed");
            eprintln!("Error: {e:#}");
            1
        },
    };

    // Flush file logs before exiting
    drop(guard);
    process::exit(code);
}

async fn run(cli: &Cli) -> anyhow::Result<i32> {
    let config = cli.to_config();
    config.validate()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; waiting for in-flight batches");
                eprintln!("Interrupted; waiting for in-flight batches to finish...");
                cancel.cancel();
            }
        }
    });

    let pipeline = Pipeline::new(config)
        .with_cancellation(cancel)
        .with_progress(!cli.no_progress);

    let summary = pipeline.run(cli.resolver()).await?;
    print!("{summary}");

    if let Some(path) = &pipeline.config().report_path {
        write_report(&summary, path)?;
    }

    Ok(if summary.cancelled { EXIT_CANCELLED } else { 0 })
}
