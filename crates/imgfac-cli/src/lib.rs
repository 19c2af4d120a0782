//! Command-line entry point for the image factory agent.

use anyhow::{Context, Result};
use clap::Parser;
use imgfac_agent::{
    notice_channel, run_agent, AgentConfig, AgentDispatcher, BrokerSession, CommandLauncher,
    ImageFactory,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "imgfac-agent")]
#[command(version, about = "Publishes the image factory on a management bus", long_about = None)]
pub struct Cli {
    /// Broker to connect to (host, host:port, or tcp://host:port); speaks
    /// Content-Length framed JSON, not AMQP
    #[arg(short, long, value_name = "TARGET")]
    pub broker: Option<String>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,

    /// Builder command used to run builds
    #[arg(long, value_name = "COMMAND")]
    pub builder: Option<String>,

    /// Do not reconnect when the broker connection drops
    #[arg(long)]
    pub no_reconnect: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Apply command-line overrides on top of loaded configuration.
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(ref broker) = self.broker {
            config.broker = broker.clone();
        }
        if let Some(ref builder) = self.builder {
            config.builder.command = builder.clone();
        }
        if self.no_reconnect {
            config.reconnect = false;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = AgentConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    let target = config.target()?;

    info!(
        broker = %target,
        reconnect = config.reconnect,
        builder = %config.builder.command,
        "Starting image factory agent"
    );

    let session = BrokerSession::new(target, config.connection_options());
    let (notices_tx, notices_rx) = notice_channel();
    let launcher = Arc::new(CommandLauncher::new(config.builder.clone()));
    let factory = ImageFactory::new(launcher, notices_tx);

    let mut dispatcher = AgentDispatcher::initialize(session, factory)
        .await
        .context("Failed to start agent session")?;

    let clean = run_agent(&mut dispatcher, notices_rx, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C; running until the session ends");
            std::future::pending::<()>().await;
        }
    })
    .await;

    if clean {
        Ok(())
    } else {
        anyhow::bail!("Agent did not shut down cleanly")
    }
}
