use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use peerlink_channel::{ChannelConfig, TransferChannel};
use peerlink_relay::client::DEFAULT_CONNECT_TIMEOUT;
use peerlink_relay::{RelayClient, WireFormat};
use peerlink_transfer::{
    ConnectionStabilizer, Direction, ProgressRegistry, StaticFolders, TracingTaskSink,
};

const DEFAULT_LOG_FILTER: &str =
    "peerlink=debug,peerlink_channel=debug,peerlink_transfer=info,peerlink_relay=info";

#[derive(Parser)]
#[command(name = "peerlink", version, about = "PeerLink device transfer agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Join the transfer channel and serve/receive files until interrupted
    Run(RunArgs),
    /// Send one file to the relay's raw socket
    ServeFile {
        path: PathBuf,
        #[command(flatten)]
        relay: RelayArgs,
    },
    /// Ask the relay to forget one or more devices
    DeleteDevices {
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        relay: RelayArgs,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Request a file from another device once connected, as DEVICE_ID:PATH
    #[arg(long = "download", value_name = "DEVICE_ID:PATH")]
    downloads: Vec<String>,
    /// Seconds between progress reports (0 disables them)
    #[arg(long, default_value_t = 10)]
    report_secs: u64,
}

#[derive(Args)]
struct RelayArgs {
    /// Use the END_OF_HEADER sentinel framing of older relays
    #[arg(long)]
    legacy: bool,
}

impl RelayArgs {
    fn format(&self) -> WireFormat {
        if self.legacy {
            WireFormat::Legacy
        } else {
            WireFormat::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run(RunArgs {
        report_secs: 10,
        ..RunArgs::default()
    })) {
        Command::Run(args) => run_channel(args).await,
        Command::ServeFile { path, relay } => {
            let mut client = connect_relay(relay.format()).await?;
            let sent = client
                .serve_file(&path)
                .await
                .with_context(|| format!("serving {}", path.display()))?;
            info!("Sent {} bytes", sent);
            Ok(())
        }
        Command::DeleteDevices { names, relay } => {
            let username =
                std::env::var("PEERLINK_USERNAME").context("PEERLINK_USERNAME is not set")?;
            let mut client = connect_relay(relay.format()).await?;
            client.request_device_delete(&names, &username).await?;
            info!("Requested deletion of {} device(s)", names.len());
            Ok(())
        }
    }
}

async fn run_channel(args: RunArgs) -> anyhow::Result<()> {
    let requests = args
        .downloads
        .iter()
        .map(|spec| parse_download(spec))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let config = ChannelConfig::from_env()?;
    info!(
        "PeerLink agent for {} on {} ({})",
        config.username, config.device_id, config.device_name
    );
    info!("Downloads go to {}", config.download_dir.display());
    if config.scanned_folders.is_empty() {
        warn!("No scanned folders configured; file requests will be refused");
    }

    let stabilizer = Arc::new(ConnectionStabilizer::default());
    let progress = Arc::new(ProgressRegistry::new());
    let folders = Arc::new(StaticFolders(config.scanned_folders.clone()));

    let (channel, handle) = TransferChannel::new(config, stabilizer, progress.clone());
    let channel = channel
        .with_folders(folders)
        .with_task_sink(Arc::new(TracingTaskSink));

    // Queued until the channel is connected.
    for (device, path) in requests {
        handle.download(path, device)?;
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    if args.report_secs > 0 {
        tokio::spawn(report_progress(
            progress,
            Duration::from_secs(args.report_secs),
            shutdown.clone(),
        ));
    }

    channel.run(shutdown).await;
    drop(handle);
    Ok(())
}

/// Split `DEVICE_ID:PATH`. Only the first colon separates, so paths may
/// contain more.
fn parse_download(spec: &str) -> anyhow::Result<(&str, &str)> {
    spec.split_once(':')
        .filter(|(device, path)| !device.is_empty() && !path.is_empty())
        .with_context(|| format!("--download {:?} is not DEVICE_ID:PATH", spec))
}

async fn report_progress(
    progress: Arc<ProgressRegistry>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        for direction in [Direction::Download, Direction::Upload] {
            for record in progress.get_all(direction) {
                if record.status.is_terminal() {
                    continue;
                }
                info!(
                    "{} {}: {:.1}% of {} bytes, eta {:?}",
                    direction,
                    record.filename,
                    record.progress_percent,
                    record.total_size,
                    record.time_remaining
                );
            }
        }
    }
}

async fn connect_relay(format: WireFormat) -> anyhow::Result<RelayClient> {
    let host = std::env::var("PEERLINK_RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("PEERLINK_RELAY_PORT")
        .unwrap_or_else(|_| "9000".into())
        .parse()
        .context("PEERLINK_RELAY_PORT")?;

    let client = RelayClient::connect(&host, port, format, DEFAULT_CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("connecting to relay {}:{}", host, port))?;
    Ok(client)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
