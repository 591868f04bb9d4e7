//! tw: run and inspect the traffic control and observability layer.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use trafficwarden_core::config::{LimitSpec, LogFormat, TrafficConfig};
use trafficwarden_core::logging::init_logging;
use trafficwarden_core::rate_limit::{LimitClass, RateLimitDecision};
use trafficwarden_core::runtime::TrafficRuntime;

#[derive(Parser, Debug)]
#[command(name = "tw", version, about = "Traffic control and observability for consent APIs")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short = 'c', global = true, env = "TW_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the configured log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run sweeps and alert checks until interrupted
    Serve,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Print the effective alert rules as JSON
    Rules,

    /// Issue rate-limit checks in-process and print each decision
    Simulate {
        /// Identifier to limit (client fingerprint, API key, IP)
        #[arg(long, default_value = "client-1")]
        identifier: String,

        /// Limit class: api, registration, consent, widget, auth
        #[arg(long, default_value = "api")]
        class: LimitClass,

        /// Number of checks to issue
        #[arg(long, short = 'n', default_value_t = 10)]
        requests: u32,

        /// Override the class limit for this run
        #[arg(long)]
        max: Option<u32>,

        /// Override the class window (seconds) for this run
        #[arg(long)]
        window: Option<u64>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration (secrets redacted)
    Show {
        #[arg(long, value_enum, default_value_t = ConfigFormat::Toml)]
        format: ConfigFormat,
    },
    /// Load and validate the configuration
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConfigFormat {
    Toml,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(hint) = err
                .downcast_ref::<trafficwarden_core::Error>()
                .and_then(trafficwarden_core::Error::remediation)
            {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = TrafficConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    match cli.command {
        Commands::Serve => {
            init_logging(&config.logging).context("failed to initialize logging")?;
            serve(&config)
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show { format } => show_config(&config, format),
            ConfigCommands::Validate => {
                let rules = config.alerts.effective_rules().len();
                println!(
                    "config ok: remote={}, alert rules={rules}",
                    if config.remote.credentials().is_some() {
                        "configured"
                    } else {
                        "in-process"
                    }
                );
                Ok(())
            }
        },
        Commands::Rules => {
            let rules = config.alerts.effective_rules();
            println!("{}", serde_json::to_string_pretty(&rules)?);
            Ok(())
        }
        Commands::Simulate {
            identifier,
            class,
            requests,
            max,
            window,
            format,
        } => {
            let current = class.spec(&config.rate_limits);
            let spec = LimitSpec::new(
                max.unwrap_or(current.max_requests),
                window.unwrap_or(current.window_secs),
            );
            set_limit(&mut config, class, spec);
            // Decisions must reflect in-process state only.
            config.remote.url = None;
            config.remote.token = None;
            simulate(&config, &identifier, class, requests, format)
        }
    }
}

fn set_limit(config: &mut TrafficConfig, class: LimitClass, spec: LimitSpec) {
    let limits = &mut config.rate_limits;
    let slot = match class {
        LimitClass::Api => &mut limits.api,
        LimitClass::Registration => &mut limits.registration,
        LimitClass::Consent => &mut limits.consent,
        LimitClass::Widget => &mut limits.widget,
        LimitClass::Auth => &mut limits.auth,
    };
    *slot = spec;
}

fn serve(config: &TrafficConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(async {
        let traffic = TrafficRuntime::from_config(config)?;
        let tasks = traffic.start_background();
        info!(jobs = ?tasks.job_names(), "serving; press Ctrl-C to stop");

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        info!("shutdown requested");
        tasks.shutdown().await;

        let status = traffic.status();
        info!(
            allowed = status.rate_limit.allowed,
            denied = status.rate_limit.denied,
            alerts_triggered = status.alerts.triggered,
            "final status"
        );
        Ok::<(), anyhow::Error>(())
    })
}

fn show_config(config: &TrafficConfig, format: ConfigFormat) -> anyhow::Result<()> {
    let mut shown = config.clone();
    if shown.remote.token.is_some() {
        shown.remote.token = Some("[REDACTED]".to_string());
    }
    match format {
        ConfigFormat::Toml => print!("{}", shown.to_toml_string()?),
        ConfigFormat::Json => println!("{}", serde_json::to_string_pretty(&shown)?),
    }
    Ok(())
}

#[derive(Serialize)]
struct SimulatedCheck<'a> {
    request: u32,
    #[serde(flatten)]
    decision: &'a RateLimitDecision,
}

fn simulate(
    config: &TrafficConfig,
    identifier: &str,
    class: LimitClass,
    requests: u32,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(async {
        let traffic = TrafficRuntime::from_config(config)?;
        for request in 1..=requests {
            let decision = traffic.limiter.check(identifier, class).await?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string(&SimulatedCheck {
                        request,
                        decision: &decision,
                    })?
                ),
                OutputFormat::Plain => println!(
                    "#{request:<4} {:<7} remaining={:<5} retry_after={}",
                    if decision.allowed { "allowed" } else { "denied" },
                    decision.remaining,
                    decision
                        .retry_after_secs
                        .map_or_else(|| "-".to_string(), |s| format!("{s}s")),
                ),
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn simulate_parses_class_case_insensitively() {
        let cli = Cli::parse_from(["tw", "simulate", "--class", "AUTH", "-n", "3"]);
        match cli.command {
            Commands::Simulate {
                class, requests, ..
            } => {
                assert_eq!(class, LimitClass::Auth);
                assert_eq!(requests, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn set_limit_targets_one_class() {
        let mut config = TrafficConfig::default();
        set_limit(&mut config, LimitClass::Widget, LimitSpec::new(1, 1));
        assert_eq!(config.rate_limits.widget, LimitSpec::new(1, 1));
        assert_eq!(config.rate_limits.api, LimitSpec::new(100, 60));
    }
}
