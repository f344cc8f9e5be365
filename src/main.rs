use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tether::cli::{Cli, Command};
use tether::config::{self, ProjectConfig};
use tether::engine::{Engine, EngineSettings};
use tether::paths;
use tether::server;
use tether::tmux::TmuxControl;
use tether::transcript;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet_by_default = matches!(
        &cli.command,
        Command::Config { .. } | Command::Messages { .. }
    );

    let filter = match cli.verbose {
        0 if quiet_by_default => "tether=warn",
        0 => "tether=info",
        1 => "tether=debug",
        _ => "tether=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (mut config, config_path) = ProjectConfig::load(&cwd)?;

    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .tether/config.toml found, using defaults"),
    }

    match cli.command {
        Command::Serve { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            let settings = EngineSettings::from_config(&config);
            info!(
                projects_dir = %settings.tailer.projects_dir.display(),
                "watching conversation logs"
            );
            let control = Arc::new(TmuxControl::new(config.delivery.tmux_prefix.clone()));
            let engine = Engine::new(settings, control);
            engine.start_maintenance();

            let result = server::serve(engine.clone(), &config.server).await;
            engine.shutdown();
            result?;
        }
        Command::Messages { session } => {
            let projects_dir = config.transcripts.projects_dir();
            let path = paths::find_session_log(&projects_dir, &session).with_context(|| {
                format!(
                    "no conversation log for session '{session}' under {}",
                    projects_dir.display()
                )
            })?;
            let messages = transcript::read_all(&path)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&messages).context("failed to serialize messages")?
            );
        }
        Command::Config { json } => {
            if json {
                println!("{}", config::render_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", config::render_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}
