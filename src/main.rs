mod aspect;
mod channels;
mod config;
mod device_id;
mod relay;
mod service;

use std::{
    net::IpAddr,
    path::PathBuf,
    process,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser};
use log::{debug, error, info, warn};
use tokio::{signal, task::JoinSet, time};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use channels::ChannelTable;
use config::{parse_channel_arg, Config};
use service::ProxyService;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sit between an HDHomeRun tuner and its clients, overriding the MPEG-2 aspect ratio of selected channels.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct CommandLineConf {
    /// TOML config file.
    #[clap(short, long, value_name = "/path/to/config.toml", conflicts_with_all(&[
        "device_host", "device_capture_port", "device_web_port", "service_host", "bind", "bind_ipv6",
        "capture_port", "web_port", "proxy_all_channels", "channels",
    ]))]
    pub config: Option<PathBuf>,

    /// Host name or address of the tuner (default: hdhomerun.local).
    #[clap(long, value_name = "HOST")]
    pub device_host: Option<String>,

    /// Port the tuner streams video on (default: 5004).
    #[clap(long, value_name = "PORT")]
    pub device_capture_port: Option<u16>,

    /// Port of the tuner's web interface (default: 80).
    #[clap(long, value_name = "PORT")]
    pub device_web_port: Option<u16>,

    /// Host name clients should use to reach us. Learned from client requests if not set.
    #[clap(long, value_name = "HOST")]
    pub service_host: Option<String>,

    /// Address to listen on (default: 0.0.0.0).
    #[clap(short, long, value_name = "IP")]
    pub bind: Option<IpAddr>,

    /// Additional IPv6 address to listen on, when --bind is IPv4.
    #[clap(long, value_name = "IPV6")]
    pub bind_ipv6: Option<IpAddr>,

    /// Port we serve video on (default: same as the device).
    #[clap(long, value_name = "PORT")]
    pub capture_port: Option<u16>,

    /// Port we serve the web interface on (default: same as the device).
    #[clap(long, value_name = "PORT")]
    pub web_port: Option<u16>,

    /// Route every channel's video through the proxy, not just overridden ones.
    #[clap(short = 'a', long)]
    pub proxy_all_channels: bool,

    /// Aspect ratio override, e.g. 7.1=16:9. Repeatable.
    #[clap(long = "channel", value_name = "MAJOR.MINOR=RATIO", value_parser = parse_channel_arg)]
    pub channels: Vec<(String, String)>,

    /// TCP connect timeout towards the device, in seconds.
    #[clap(long, value_name = "SECONDS")]
    pub connect_timeout: Option<u64>,

    /// How long a device stream may stay silent before it is dropped, in seconds.
    #[clap(long, value_name = "SECONDS")]
    pub stream_timeout: Option<u64>,

    /// Grace period for open connections on shutdown, in seconds.
    #[clap(long, value_name = "SECONDS")]
    pub shutdown_timeout: Option<u64>,

    /// HTTP connect timeout for the startup device ID lookup, in seconds.
    #[clap(long, value_name = "SECONDS")]
    pub probe_timeout: Option<u64>,

    /// Verbosity level. The more v, the more verbose.
    #[clap(short, long, action=ArgAction::Count)]
    pub verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CommandLineConf::parse();

    let config = Config::try_from(args)?;

    init_logging(config.verbose);

    println!("hdhr-aspect-proxy v{}", VERSION);

    config.settings.log_summary();

    let channels = ChannelTable::from_entries(
        config.channels.iter().map(|(channel, ratio)| (channel.as_str(), ratio.as_str())),
    );
    channels.log_summary();

    let service = Arc::new(ProxyService::new(config.settings, channels));

    tokio::spawn(service.clone().probe_device_identity());

    let code = supervise(service).await;
    if code != 0 {
        process::exit(code);
    }

    Ok(())
}

/// Runs both listeners until a shutdown signal or a listener failure, then
/// shuts everything down. Returns the process exit code.
async fn supervise(service: Arc<ProxyService>) -> i32 {
    let cancel = CancellationToken::new();
    let mut listeners = JoinSet::new();

    listeners.spawn(service.clone().serve_capture(cancel.clone()));
    listeners.spawn(service.clone().serve_web(cancel.clone()));

    let mut code = 0;

    tokio::select! {
        signal_name = wait_for_shutdown_signal() => match signal_name {
            Ok(name) => info!(target: "hdhrproxy", "{} received, shutting down...", name),
            Err(e) => {
                error!(target: "hdhrproxy", "Failed to set up signal handler: {:#}", e);
                code = 1;
            }
        },
        Some(finished) = listeners.join_next() => {
            error!(target: "hdhrproxy", "Listener stopped unexpectedly: {:#}", listener_error(finished));
            code = 1;
        }
    }

    let started = Instant::now();
    cancel.cancel();

    let grace = service.settings().shutdown_timeout + Duration::from_secs(1);
    let drained = time::timeout(grace, async {
        let mut failed = false;
        while let Some(finished) = listeners.join_next().await {
            if let Err(e) = flatten(finished) {
                error!(target: "hdhrproxy", "Error while shutting down: {:#}", e);
                failed = true;
            }
        }
        failed
    })
    .await;

    match drained {
        Ok(false) => {}
        Ok(true) => code = 2,
        Err(_) => {
            warn!(target: "hdhrproxy", "{} listeners did not stop in time, aborting.", listeners.len());
            listeners.abort_all();
            code = 2;
        }
    }

    debug!(target: "hdhrproxy", "Shutdown took {}ms", started.elapsed().as_millis());

    code
}

fn flatten(finished: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match finished {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow!("listener task panicked: {}", e)),
        Err(e) => Err(anyhow!("listener task failed: {}", e)),
    }
}

fn listener_error(finished: std::result::Result<Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    flatten(finished).err().unwrap_or_else(|| anyhow!("listener returned without being asked to"))
}

/// Waits for a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C elsewhere)
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = unix_signal(SignalKind::terminate())
            .map_err(|e| anyhow!("Failed to install SIGTERM handler: {}", e))?;

        let signal_name = tokio::select! {
            result = signal::ctrl_c() => {
                result.map_err(|e| anyhow!("Failed to wait for SIGINT: {}", e))?;
                "SIGINT"
            }
            _ = sigterm.recv() => "SIGTERM",
        };
        Ok(signal_name)
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .map_err(|e| anyhow!("Failed to install Ctrl+C handler: {}", e))?;
        Ok("Ctrl+C")
    }
}

fn init_logging(verbosity: log::LevelFilter) {
    fern::Dispatch::new().
        format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        }).
        // by default only accept warning messages from libraries so we don't spam
        level(log::LevelFilter::Warn).
        // but accept Info and Debug and Trace for our app.
        level_for("hdhrproxy", verbosity).
        chain(std::io::stdout()).
        apply().
            unwrap_or_else(|e| eprintln!("Failed to configure logging: {}", e));
}
