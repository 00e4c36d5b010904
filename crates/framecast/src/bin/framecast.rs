use anyhow::Context;
use argh::FromArgs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};

use framecast::inference::LumaThresholdDetector;
use framecast::relay::RelayConnector;
use framecast::worker::PipelineFactory;
use framecast::{fatal_channel, hub, Config, Hub, Supervisor};

/// Framecast - frame fan-out with live view hub and supervised inference
#[derive(FromArgs)]
struct Args {
    /// path to a YAML configuration file (defaults are used when omitted)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// override the hub listen address (e.g. 0.0.0.0:7001); the producer
    /// follows it unless relay_url is set in the config
    #[argh(option, short = 'l')]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Args = argh::from_env();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            log::info!("No config file given, using defaults");
            Config::default()
        }
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    config.validate().context("Invalid configuration")?;

    // Interrupts skip any queue drain
    ctrlc::set_handler(|| {
        log::warn!("Received SIGINT/SIGTERM signal, exiting...");
        std::process::exit(1);
    })
    .context("Failed to install signal handler")?;

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let mut hub_task = tokio::spawn(hub::serve(listener, Arc::new(Hub::new())));

    let relay_url = config.relay_url();
    log::info!("Producer publishes to {}", relay_url);

    let (fatal, mut fatal_rx) = fatal_channel();
    let factory = Arc::new(PipelineFactory::new(
        config.clone(),
        Arc::new(config.source.clone()),
        Arc::new(RelayConnector::new(relay_url)),
        Arc::new(LumaThresholdDetector::default()),
    ));
    let mut supervisor = Supervisor::from_config(factory, fatal, &config);
    supervisor.start();

    let mut liveness = interval(config.liveness_interval());
    liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut hangup = Hangup::new()?;

    loop {
        tokio::select! {
            Some(report) = fatal_rx.recv() => {
                log::error!("{} failed, shutting down: {}", report.unit, report.error);
                std::process::exit(1);
            }

            _ = liveness.tick() => {
                log::info!(
                    "Liveness: producer={} consumer={} queued={}",
                    supervisor.producer_alive(),
                    supervisor.consumer_alive(),
                    supervisor.queue().len()
                );
            }

            _ = hangup.recv() => {
                log::info!("Received SIGHUP, restarting workers");
                if let Err(e) = supervisor.restart().await {
                    log::error!("Restart failed: {}", e);
                    std::process::exit(1);
                }
            }

            result = &mut hub_task => {
                match result {
                    Ok(Ok(())) => log::error!("Live view hub stopped"),
                    Ok(Err(e)) => log::error!("Live view hub failed: {}", e),
                    Err(e) => log::error!("Live view hub task failed: {}", e),
                }
                std::process::exit(1);
            }
        }
    }
}

/// SIGHUP stream; never fires on platforms without it
struct Hangup {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl Hangup {
    #[cfg(unix)]
    fn new() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        let signal = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        Ok(Self { signal })
    }

    #[cfg(not(unix))]
    fn new() -> anyhow::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        if self.signal.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
