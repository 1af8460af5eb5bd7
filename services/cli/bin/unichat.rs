use anyhow::Context;
use clap::Parser;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use unichat_cli::app::{App, Next};
use unichat_cli::cli::Cli;
use unichat_cli::commands::HELP;
use unichat_cli::config::Config;
use unichat_cli::images::load_image;
use unichat_core::session::TurnOutcome;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let cli = Cli::parse();
    let config = Config::from_env()
        .and_then(|config| config.with_overrides(cli.overrides()))
        .context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    // stdout carries the conversation, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(
        backend = %config.backend_url,
        vision = %config.vision_url,
        language = %config.language,
        "Configuration loaded"
    );

    let mut app = App::new(&config, std::io::stdout());

    // --- 3. One-shot mode ---
    if let Some(query) = cli.once {
        for path in &cli.image {
            let image = load_image(path).context("Failed to attach image")?;
            app.queue_image(image);
        }
        let outcome = app.ask(query).await.context("Failed to write answer")?;
        return match outcome {
            TurnOutcome::Completed { .. } => Ok(()),
            TurnOutcome::Cancelled { .. } => anyhow::bail!("Turn cancelled"),
            TurnOutcome::Failed { error, .. } => anyhow::bail!("Turn failed: {}", error),
        };
    }

    // --- 4. Interactive loop ---
    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush().context("Failed to write prompt")?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        if app.handle_line(&line).await.context("Failed to write output")? == Next::Quit {
            break;
        }
    }

    info!("Goodbye");
    Ok(())
}
