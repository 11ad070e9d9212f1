use anyhow::{anyhow, Context, Result};
use log::info;
use std::{
    collections::BTreeMap,
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use serde::Deserialize;

use crate::relay::RelayTimeouts;
use crate::CommandLineConf;

const DEFAULT_DEVICE_HOST_NAME: &str = "hdhomerun.local";
const DEFAULT_DEVICE_CAPTURE_PORT: u16 = 5004;
const DEFAULT_DEVICE_WEB_PORT: u16 = 80;
const DEFAULT_SERVICE_ENDPOINT: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

#[derive(Deserialize, Default)]
pub(crate) struct RawConfig {
    device_host_name: Option<String>,
    device_capture_port: Option<u16>,
    device_web_port: Option<u16>,
    service_host_name: Option<String>,
    service_endpoint: Option<String>,
    service_endpoint_ipv6: Option<String>,
    service_capture_port: Option<u16>,
    service_web_port: Option<u16>,
    proxy_all_channels: Option<bool>,
    verbose: Option<u8>,
    connect_timeout: Option<u64>,
    stream_timeout: Option<u64>,
    shutdown_timeout: Option<u64>,
    probe_timeout: Option<u64>,
    channels: Option<BTreeMap<String, String>>,
}

/// Everything the proxy needs to know about the device and itself.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub device_host_name: String,
    pub device_capture_port: u16,
    pub device_web_port: u16,
    pub service_host_name: Option<String>,
    pub service_endpoint: IpAddr,
    pub service_endpoint_ipv6: Option<Ipv6Addr>,
    pub service_capture_port: u16,
    pub service_web_port: u16,
    /// Rewrite capture URLs even for channels without an override.
    pub proxy_all_channels: bool,
    pub connect_timeout: Duration,
    pub stream_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            device_host_name: DEFAULT_DEVICE_HOST_NAME.to_string(),
            device_capture_port: DEFAULT_DEVICE_CAPTURE_PORT,
            device_web_port: DEFAULT_DEVICE_WEB_PORT,
            service_host_name: None,
            service_endpoint: DEFAULT_SERVICE_ENDPOINT,
            service_endpoint_ipv6: None,
            service_capture_port: DEFAULT_DEVICE_CAPTURE_PORT,
            service_web_port: DEFAULT_DEVICE_WEB_PORT,
            proxy_all_channels: false,
            connect_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl ProxySettings {
    pub fn relay_timeouts(&self) -> RelayTimeouts {
        RelayTimeouts {
            connect: self.connect_timeout,
            stream: self.stream_timeout,
        }
    }

    pub fn log_summary(&self) {
        info!(target: "hdhrproxy",
            "Settings:\n\tDeviceHostName={}\n\tDeviceCapturePort={}\n\tDeviceWebPort={}\n\tServiceHostName={}\n\tServiceEndpoint={}\n\tServiceEndpointIPv6={}\n\tServiceCapturePort={}\n\tServiceWebPort={}\n\tProxyAllChannels={}",
            self.device_host_name,
            self.device_capture_port,
            self.device_web_port,
            self.service_host_name.as_deref().unwrap_or(""),
            self.service_endpoint,
            self.service_endpoint_ipv6.map(|ip| ip.to_string()).unwrap_or_default(),
            self.service_capture_port,
            self.service_web_port,
            self.proxy_all_channels,
        );
    }
}

pub struct Config {
    pub settings: ProxySettings,
    /// Raw `channel => ratio` entries, validated once logging is up.
    pub channels: Vec<(String, String)>,
    pub verbose: log::LevelFilter,
}

impl TryFrom<CommandLineConf> for Config {
    type Error = anyhow::Error;

    fn try_from(conf: CommandLineConf) -> std::result::Result<Self, Self::Error> {
        get_config(conf)
    }
}

fn get_config(args: CommandLineConf) -> Result<Config> {
    let config_file = args.config.clone();

    let raw_config = match config_file {
        Some(file) => {
            let contents = fs::read_to_string(file).context("Could not open/read config file.")?;
            toml::from_str(&contents).context("failed to parse config file.")?
        }
        None => RawConfig::from(args),
    };

    config_from_raw(raw_config)
}

impl From<CommandLineConf> for RawConfig {
    fn from(args: CommandLineConf) -> Self {
        RawConfig {
            device_host_name: args.device_host,
            device_capture_port: args.device_capture_port,
            device_web_port: args.device_web_port,
            service_host_name: args.service_host,
            service_endpoint: args.bind.map(|ip| ip.to_string()),
            service_endpoint_ipv6: args.bind_ipv6.map(|ip| ip.to_string()),
            service_capture_port: args.capture_port,
            service_web_port: args.web_port,
            proxy_all_channels: Some(args.proxy_all_channels),
            verbose: Some(args.verbose),
            connect_timeout: args.connect_timeout,
            stream_timeout: args.stream_timeout,
            shutdown_timeout: args.shutdown_timeout,
            probe_timeout: args.probe_timeout,
            channels: Some(args.channels.into_iter().collect()),
        }
    }
}

pub(crate) fn config_from_raw(raw: RawConfig) -> Result<Config> {
    let defaults = ProxySettings::default();

    let device_host_name = non_blank(raw.device_host_name).unwrap_or(defaults.device_host_name);
    let device_capture_port = raw.device_capture_port.unwrap_or(defaults.device_capture_port);
    let device_web_port = raw.device_web_port.unwrap_or(defaults.device_web_port);

    let service_endpoint: IpAddr = non_blank(raw.service_endpoint)
        .map(|s| s.parse().with_context(|| format!("Bad service endpoint '{}'", s)))
        .transpose()?
        .unwrap_or(defaults.service_endpoint);

    // A secondary IPv6 listener only makes sense next to an IPv4 one.
    let service_endpoint_ipv6 = match non_blank(raw.service_endpoint_ipv6) {
        Some(s) if service_endpoint.is_ipv4() => match s.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => Some(ip),
            Ok(IpAddr::V4(_)) => return Err(anyhow!("Secondary service endpoint '{}' is not an IPv6 address", s)),
            Err(e) => return Err(anyhow!("Bad IPv6 service endpoint '{}': {}", s, e)),
        },
        _ => None,
    };

    let seconds = |value: Option<u64>, default: Duration| value.map(Duration::from_secs).unwrap_or(default);

    let settings = ProxySettings {
        service_host_name: non_blank(raw.service_host_name),
        service_endpoint,
        service_endpoint_ipv6,
        // unless told otherwise, expose the same ports as the device
        service_capture_port: raw.service_capture_port.unwrap_or(device_capture_port),
        service_web_port: raw.service_web_port.unwrap_or(device_web_port),
        proxy_all_channels: raw.proxy_all_channels.unwrap_or(false),
        connect_timeout: seconds(raw.connect_timeout, defaults.connect_timeout),
        stream_timeout: seconds(raw.stream_timeout, defaults.stream_timeout),
        shutdown_timeout: seconds(raw.shutdown_timeout, defaults.shutdown_timeout),
        probe_timeout: seconds(raw.probe_timeout, defaults.probe_timeout),
        device_host_name,
        device_capture_port,
        device_web_port,
    };

    let verbose = match raw.verbose.unwrap_or(0) {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    Ok(Config {
        settings,
        channels: raw.channels.unwrap_or_default().into_iter().collect(),
        verbose,
    })
}

/// Parses a `--channel 7.1=16:9` argument.
pub fn parse_channel_arg(arg: &str) -> Result<(String, String)> {
    let (channel, ratio) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected MAJOR.MINOR=RATIO, got '{}'", arg))?;

    Ok((channel.trim().to_string(), ratio.trim().to_string()))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
