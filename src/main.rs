use std::time::Duration;

use agentsh::{
    cli::{Cli, Commands},
    config::Config,
    init_logging,
    remote::{TerminalError, TerminalSize},
    session::SessionManager,
};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            1
        }
    };

    // Exit explicitly: a pending stdin read would otherwise hold the runtime open.
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    // Load configuration
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => return Ok(report(&TerminalError::Config(format!("{:#}", e)))),
    };

    // Initialize logging
    let _log_guard = init_logging(
        &cli.effective_log_level(&config.log_level),
        &config.log.file_path,
    )?;

    tracing::info!("agentsh starting...");
    tracing::debug!("CLI arguments: {:?}", cli);

    match &cli.command {
        Commands::Config { action } => {
            config.handle_command(action)?;
            Ok(0)
        }
        Commands::Shell { agent, cols, rows } => {
            let manager = match SessionManager::new(&config) {
                Ok(manager) => manager,
                Err(error) => return Ok(report(&error)),
            };
            let size = match (cols, rows) {
                (None, None) => None,
                _ => {
                    let fallback = agentsh::terminal::current_size()
                        .unwrap_or(manager.config().default_size);
                    Some(TerminalSize::new(
                        cols.unwrap_or(fallback.cols),
                        rows.unwrap_or(fallback.rows),
                    ))
                }
            };

            let cancel = CancellationToken::new();
            spawn_termination_watch(cancel.clone());

            match manager.run_shell(agent, size, cancel).await {
                Ok(()) => Ok(0),
                Err(error) => Ok(report(&error)),
            }
        }
        Commands::Exec {
            agent,
            timeout,
            command,
        } => {
            let manager = match SessionManager::new(&config) {
                Ok(manager) => manager,
                Err(error) => return Ok(report(&error)),
            };
            let deadline = Duration::from_secs(timeout.unwrap_or(config.exec.timeout_secs));
            let result = manager.exec(agent, &command.join(" "), deadline).await;

            if !result.output.is_empty() {
                println!("{}", result.output);
            }
            match &result.error {
                None => Ok(0),
                Some(error) => Ok(report(error)),
            }
        }
    }
}

/// Config file (or defaults when absent) with the `--url` override, validated
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load_or_default(&cli.config_file)?;
    if let Some(url) = &cli.url {
        config.server.url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Print a categorized error and return the matching exit code
fn report(error: &TerminalError) -> i32 {
    let category = error.category();
    eprintln!("{} {}", format!("{}:", category).red().bold(), error);
    category.exit_code()
}

/// Cancel the session on SIGTERM (or Ctrl-C outside raw mode)
fn spawn_termination_watch(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = terminate.recv() => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Termination requested");
        cancel.cancel();
    });
}
