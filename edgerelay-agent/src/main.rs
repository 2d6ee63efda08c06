//! Entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgerelay_agent::logging::{self, Verbosity};
use edgerelay_agent::{build_table, AgentConfig, DeliveryOrchestrator, DeliveryState};
use edgerelay_connectors::{MqttPublisher, Publisher, TcpProbe};
use edgerelay_core::{BatchSplitter, LogContext, Measurement, SamplingAggregator, SensorTable};
use edgerelay_store::LocalBuffer;
use log::{error, info, warn};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Parser, Debug)]
#[command(name = "edgerelay", version, about)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "EDGERELAY_CONFIG",
        default_value = "edgerelay.toml",
        global = true
    )]
    config: PathBuf,

    /// Show all log messages
    #[arg(short, long, conflicts_with = "silent", global = true)]
    verbose: bool,

    /// Show only warnings and errors
    #[arg(short, long, global = true)]
    silent: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Collect and deliver readings until interrupted
    Run,
    /// Collect one window, deliver it and exit
    Once,
    /// Print the number of buffered readings and exit
    Pending,
}

/// The pipeline for one device
struct Agent {
    sensors: SensorTable,
    aggregator: SamplingAggregator,
    orchestrator: DeliveryOrchestrator<MqttPublisher, TcpProbe>,
    config: AgentConfig,
    log: LogContext,
}

impl Agent {
    fn start(config: AgentConfig, log: LogContext) -> Result<Self> {
        let sensors = build_table(&config.sensors, &log).context("building sensor table")?;
        let aggregator = SamplingAggregator::new(
            config.filter,
            config.sampling.policy(),
            log.scoped("aggregator"),
        );
        let buffer = open_buffer(&config, &log)?;
        let publisher = MqttPublisher::connect(
            config.broker(),
            config.device.as_str(),
            log.scoped("publisher"),
        )
        .context("configuring broker connection")?;
        let probe = TcpProbe::new(&config.reachability, log.scoped("reachability"));
        let splitter =
            BatchSplitter::new(config.delivery.batch_ceiling_bytes, log.scoped("splitter"));
        let orchestrator =
            DeliveryOrchestrator::new(publisher, probe, buffer, splitter, log.scoped("delivery"));

        Ok(Self {
            sensors,
            aggregator,
            orchestrator,
            config,
            log,
        })
    }

    /// One collection window followed by one delivery attempt
    async fn cycle(&mut self) -> Result<DeliveryState> {
        let sampling = &self.config.sampling;
        let window = self
            .aggregator
            .collect_window(
                &mut self.sensors,
                &sampling.measurements,
                sampling.window(),
                sampling.sample_interval(),
            )
            .await;

        let state = match self.orchestrator.save(window.reading).await {
            Ok(state) => state,
            Err(e) => {
                error!(target: self.log.target(), "local buffer failed: {e}");
                return Err(e).context("saving reading");
            }
        };
        let pending = self.orchestrator.pending().context("counting buffered readings")?;

        info!(
            target: self.log.target(),
            "window done: {} ticks, {} sample errors, {state}, {pending} buffered",
            window.ticks,
            window.errors.len()
        );
        Ok(state)
    }

    async fn shutdown(mut self) {
        let publisher = self.orchestrator.publisher_mut();
        publisher.disconnect().await;
        let stats = publisher.stats();
        info!(
            target: self.log.target(),
            "stopped: {} batches sent, {} failed, {} bytes, {} reconnections",
            stats.messages_sent,
            stats.messages_failed,
            stats.bytes_sent,
            stats.reconnections
        );
    }
}

fn open_buffer(config: &AgentConfig, log: &LogContext) -> Result<LocalBuffer> {
    let columns: Vec<Measurement> = config.sampling.measurements.clone();
    LocalBuffer::open(&config.buffer.path, &config.device, &columns, log.scoped("buffer"))
        .with_context(|| format!("opening buffer {}", config.buffer.path.display()))
}

/// Flip the returned flag once `signal` fires
///
/// If the signal cannot be listened for, the flag never changes and the
/// agent runs until killed.
fn stop_on<F>(signal: F) -> watch::Receiver<bool>
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    let (stop_tx, stop) = watch::channel(false);
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                warn!("cannot listen for interrupts: {e}");
                std::future::pending::<()>().await;
            }
        }
    });
    stop
}

async fn run(mut agent: Agent) -> Result<()> {
    let mut stop = stop_on(tokio::signal::ctrl_c());

    let mut ticker = tokio::time::interval(agent.config.sampling.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {}
        }
        if *stop.borrow() {
            info!(target: agent.log.target(), "interrupted, shutting down");
            break;
        }
        if let Err(e) = agent.cycle().await {
            agent.shutdown().await;
            return Err(e);
        }
    }

    agent.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.silent));

    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let log = LogContext::new(&config.device);

    match cli.command {
        Command::Pending => {
            let buffer = open_buffer(&config, &log)?;
            println!("{}", buffer.count().context("counting buffered readings")?);
        }
        Command::Once => {
            let mut agent = Agent::start(config, log)?;
            let result = agent.cycle().await;
            agent.shutdown().await;
            if result? == DeliveryState::OfflinePending {
                warn!("reading buffered, broker not reached");
            }
        }
        Command::Run => {
            info!("starting edgerelay {} for {}", env!("CARGO_PKG_VERSION"), config.device);
            run(Agent::start(config, log)?).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_subcommand_and_flags() {
        let cli = Cli::parse_from(["edgerelay", "-c", "/etc/edgerelay.toml", "-v", "once"]);
        assert_eq!(cli.command, Command::Once);
        assert_eq!(cli.config, PathBuf::from("/etc/edgerelay.toml"));
        assert!(cli.verbose);
        assert!(!cli.silent);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_sets_the_stop_flag() {
        let mut stop = stop_on(async { Ok(()) });
        stop.changed().await.unwrap();
        assert!(*stop.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_signal_listener_never_stops_the_loop() {
        let mut stop = stop_on(async {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no signal handler"))
        });

        let changed = tokio::time::timeout(Duration::from_secs(24 * 3600), stop.changed()).await;
        assert!(changed.is_err(), "stop flag changed: {changed:?}");
        assert!(!*stop.borrow());
    }

    #[test]
    fn verbose_and_silent_conflict() {
        let result = Cli::try_parse_from(["edgerelay", "-v", "-s", "run"]);
        assert!(result.is_err());
    }
}
