//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mediacdn_service::config::Config;
use mediacdn_service::{metrics, store};

use crate::healthcheck;
use crate::logging;
use crate::server;

/// mediacdn commands.
#[derive(Subcommand)]
enum Command {
    /// Run the caching edge node.
    Edge {
        /// Overrides the configured `edge.bind` address.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the origin file server.
    Origin {
        /// Overrides the configured `origin.bind` address.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Clean up the edge node's object store.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Check the health of a running node.
    Healthcheck {
        /// Address of the node, defaults to the configured bind address.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Check the origin instead of the edge node.
        #[arg(long)]
        origin: bool,

        /// How long to wait for a response.
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(version, bin_name = "mediacdn")]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )?;
    }

    match cli.command {
        Command::Edge { bind } => {
            if let Some(bind) = bind {
                config.edge.bind = bind;
            }
            server::run_edge(config).context("failed to start the edge node")?
        }
        Command::Origin { bind } => {
            if let Some(bind) = bind {
                config.origin.bind = bind;
            }
            server::run_origin(config).context("failed to start the origin")?
        }
        Command::Cleanup { dry_run } => {
            store::cleanup(&config.edge, dry_run).context("failed to clean up object store")?
        }
        Command::Healthcheck {
            addr,
            origin,
            timeout,
        } => {
            let bind = if origin {
                &config.origin.bind
            } else {
                &config.edge.bind
            };
            let addr = match addr {
                Some(addr) => addr,
                None => bind.parse().context("invalid bind address")?,
            };
            healthcheck::healthcheck(addr, timeout)?
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_bind_override() {
        let cli = Cli::try_parse_from(["mediacdn", "-c", "mediacdn.yml", "edge", "--bind", "0.0.0.0:80"])
            .unwrap();
        assert_eq!(cli.config(), Some(Path::new("mediacdn.yml")));
        assert!(matches!(cli.command, Command::Edge { bind: Some(ref b) } if b == "0.0.0.0:80"));

        let cli = Cli::try_parse_from(["mediacdn", "healthcheck", "--origin", "--timeout", "2s"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::Healthcheck { addr: None, origin: true, timeout } if timeout == Duration::from_secs(2)
        ));
    }
}
