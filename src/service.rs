use log::{debug, error, info, trace, warn};

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, OnceLock, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time,
};
use tokio_util::sync::CancellationToken;

use crate::channels::ChannelTable;
use crate::config::ProxySettings;
use crate::device_id::DeviceIdentifier;
use crate::relay::{self, http, HttpRelay, Relay, VideoRelay};

/// Identity of the real tuner and the one we announce in its place.
#[derive(Debug, Clone)]
pub struct DiscoveredIdentity {
    /// As first seen in a device response.
    pub original: String,
    pub alternate: DeviceIdentifier,
}

/// State shared by every relay: read-only settings plus what we learn about
/// the device while traffic flows.
pub struct ProxyService {
    settings: ProxySettings,
    channels: ChannelTable,
    identity: OnceLock<DiscoveredIdentity>,
    last_host_name: RwLock<Option<String>>,
}

impl ProxyService {
    pub fn new(settings: ProxySettings, channels: ChannelTable) -> Self {
        ProxyService {
            settings,
            channels,
            identity: OnceLock::new(),
            last_host_name: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn identity(&self) -> Option<&DiscoveredIdentity> {
        self.identity.get()
    }

    /// Looks for the device ID in a device response. Returns `true` if this
    /// call is the one that recorded it.
    pub fn discover_identity(&self, response: &[u8]) -> bool {
        if self.identity.get().is_some() {
            return false;
        }

        let Some(raw_id) = http::find_device_id(response) else {
            return false;
        };

        let alternate = match raw_id.parse::<DeviceIdentifier>() {
            Ok(id) => id.find_valid_alternate(),
            Err(e) => {
                debug!(target: "hdhrproxy", "Ignoring device ID candidate: {}", e);
                None
            }
        };

        let Some(alternate) = alternate else {
            return false;
        };

        let identity = DiscoveredIdentity {
            original: raw_id.to_string(),
            alternate,
        };

        if self.identity.set(identity).is_err() {
            return false;
        }

        info!(target: "hdhrproxy", "Device ID: {}, announcing ourselves as {}.", raw_id, alternate);
        true
    }

    /// Remembers the host name clients use to reach us.
    pub fn observe_client_host(&self, host: &str) {
        let known = self
            .last_host_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(host);

        if !known {
            debug!(target: "hdhrproxy", "Service host name: {}", host);
            *self.last_host_name.write().unwrap_or_else(PoisonError::into_inner) = Some(host.to_string());
        }
    }

    /// Host name written into rewritten URLs.
    pub fn external_host(&self) -> String {
        if let Some(host) = &self.settings.service_host_name {
            return host.clone();
        }

        self.last_host_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| match self.settings.service_endpoint {
                IpAddr::V6(ip) => format!("[{}]", ip),
                ip => ip.to_string(),
            })
    }

    /// Fetches the device's root page once so the identity is known before
    /// the first client shows up. Failure is not fatal.
    pub async fn probe_device_identity(self: Arc<Self>) {
        let url = format!(
            "http://{}/",
            http::host_with_port(&self.settings.device_host_name, self.settings.device_web_port)
        );

        match self.fetch(&url).await {
            Ok(body) => {
                if !self.discover_identity(body.as_bytes()) && self.identity().is_none() {
                    debug!(target: "hdhrproxy", "No device ID found at {}, will keep looking in proxied responses.", url);
                }
            }
            Err(e) => {
                warn!(target: "hdhrproxy", "Failed to detect device ID on startup: {:#}", e);
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        trace!(target: "hdhrproxy", "Fetching {}", url);

        let client = reqwest::Client::builder()
            .connect_timeout(self.settings.probe_timeout)
            .timeout(self.settings.probe_timeout * 5)
            .build()
            .context("Failed to build HTTP client")?;

        client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to get {}", url))?
            .text()
            .await
            .context("Failed to read response body as text.")
    }

    pub async fn serve_capture(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listeners = ListenerSet::bind(&self.settings, self.settings.service_capture_port)
            .context("Failed to set up capture listener")?;

        self.accept_loop(listeners, VideoRelay::new, cancel).await
    }

    pub async fn serve_web(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listeners = ListenerSet::bind(&self.settings, self.settings.service_web_port)
            .context("Failed to set up web listener")?;

        self.accept_loop(listeners, HttpRelay::new, cancel).await
    }

    /// Spawns one relay per accepted connection until `cancel` fires, then
    /// gives in-flight relays the shutdown grace period to finish.
    pub async fn accept_loop<R, F>(
        self: Arc<Self>,
        listeners: ListenerSet,
        make_relay: F,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        R: Relay,
        F: Fn(Arc<ProxyService>) -> R,
    {
        info!(target: "hdhrproxy", "Listening on {}", listeners);

        let timeouts = self.settings.relay_timeouts();
        let mut relays = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(finished) = relays.join_next(), if !relays.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(target: "hdhrproxy", "Relay task panicked: {}", e);
                        }
                    }
                    continue;
                }
                accepted = listeners.accept() => accepted,
            };

            match accepted {
                Ok((client, peer_addr)) => {
                    debug!(target: "hdhrproxy", "Accepted connection from {}", peer_addr);
                    let relay = make_relay(self.clone());
                    relays.spawn(relay::run(relay, client, peer_addr, timeouts, cancel.clone()));
                }
                Err(e) => {
                    error!(target: "hdhrproxy", "Unexpected TCP listener error on {}: {}", listeners, e);
                }
            }
        }

        debug!(target: "hdhrproxy", "Stopped listening on {}", listeners);
        drop(listeners);

        drain(relays, self.settings.shutdown_timeout).await;
        Ok(())
    }
}

async fn drain(mut relays: JoinSet<()>, grace: Duration) {
    if relays.is_empty() {
        return;
    }

    debug!(target: "hdhrproxy", "Waiting for {} relays to finish...", relays.len());

    let drained = time::timeout(grace, async {
        while relays.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(target: "hdhrproxy", "Failed to shut down all relays in a timely manner. ({})", relays.len());
        relays.abort_all();
    }
}

/// The IPv4 (or IPv6) listener plus an optional secondary IPv6 one, all on the same port.
pub struct ListenerSet {
    primary: TcpListener,
    secondary: Option<TcpListener>,
}

impl ListenerSet {
    pub fn bind(settings: &ProxySettings, port: u16) -> Result<Self> {
        let primary = bind_listener(SocketAddr::new(settings.service_endpoint, port))?;

        let secondary = settings
            .service_endpoint_ipv6
            .map(|ip| bind_listener(SocketAddr::new(ip.into(), port)))
            .transpose()?;

        Ok(ListenerSet { primary, secondary })
    }

    #[cfg(test)]
    fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        let mut addrs = vec![self.primary.local_addr()?];
        if let Some(secondary) = &self.secondary {
            addrs.push(secondary.local_addr()?);
        }
        Ok(addrs)
    }

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match &self.secondary {
            None => self.primary.accept().await,
            Some(secondary) => tokio::select! {
                accepted = self.primary.accept() => accepted,
                accepted = secondary.accept() => accepted,
            },
        }
    }
}

impl std::fmt::Display for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addr = |listener: &TcpListener| {
            listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "?".to_string())
        };

        write!(f, "{}", addr(&self.primary))?;
        if let Some(secondary) = &self.secondary {
            write!(f, " and {}", addr(secondary))?;
        }
        Ok(())
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create listen socket")?;

    socket.set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR on listen socket")?;

    // Leave the IPv4 port to the primary listener.
    if addr.is_ipv6() {
        socket.set_only_v6(true)
            .context("Failed to set IPV6_V6ONLY on listen socket")?;
    }

    socket.bind(&addr.into())
        .with_context(|| format!("Failed to bind listen socket to {}", addr))?;

    socket.listen(1024)
        .context("Failed to listen on socket")?;

    socket.set_nonblocking(true)
        .context("Failed to set non-blocking on listen socket")?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
        .context("Failed to convert listen socket to tokio")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local_settings() -> ProxySettings {
        ProxySettings {
            device_host_name: "127.0.0.1".to_string(),
            service_endpoint: IpAddr::V4(Ipv4Addr::LOCALHOST),
            shutdown_timeout: Duration::from_secs(1),
            ..ProxySettings::default()
        }
    }

    /// Fake tuner port answering every connection with `response`, sending
    /// the request it received back over the returned channel.
    async fn fake_device(response: Vec<u8>) -> (u16, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = vec![0u8; 4096];
                let count = socket.read(&mut request).await.unwrap();
                let _ = tx.send(String::from_utf8_lossy(&request[..count]).to_string());
                socket.write_all(&response).await.unwrap();
            }
        });

        (port, rx)
    }

    // ============================================
    // Shared state
    // ============================================

    #[test]
    fn test_external_host_precedence() {
        let service = ProxyService::new(local_settings(), ChannelTable::default());
        assert_eq!(service.external_host(), "127.0.0.1");

        service.observe_client_host("tuner.lan");
        assert_eq!(service.external_host(), "tuner.lan");

        let configured = ProxyService::new(
            ProxySettings {
                service_host_name: Some("fixed.lan".to_string()),
                ..local_settings()
            },
            ChannelTable::default(),
        );
        configured.observe_client_host("tuner.lan");
        assert_eq!(configured.external_host(), "fixed.lan");
    }

    #[test]
    fn test_concurrent_discovery_records_once() {
        let service = Arc::new(ProxyService::new(local_settings(), ChannelTable::default()));

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let service = service.clone();
                    scope.spawn(move || service.discover_identity(br#"{"DeviceID":"10A2E001"}"#))
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(service.identity().unwrap().alternate.to_string(), "10A2E014");
    }

    #[test]
    fn test_ipv6_bind_address_is_bracketed() {
        let service = ProxyService::new(
            ProxySettings {
                service_endpoint: "fd00::1".parse().unwrap(),
                ..local_settings()
            },
            ChannelTable::default(),
        );

        assert_eq!(service.external_host(), "[fd00::1]");
    }

    // ============================================
    // Listeners
    // ============================================

    #[tokio::test]
    async fn test_listener_set_accepts_on_both_stacks() {
        // Hosts without IPv6 loopback cannot run this.
        if std::net::TcpListener::bind("[::1]:0").is_err() {
            return;
        }

        let settings = ProxySettings {
            service_endpoint_ipv6: Some(std::net::Ipv6Addr::LOCALHOST),
            ..local_settings()
        };
        let listeners = ListenerSet::bind(&settings, 0).unwrap();
        let addrs = listeners.local_addrs().unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv4());
        assert!(addrs[1].is_ipv6());

        let _v4 = TcpStream::connect(addrs[0]).await.unwrap();
        let (_, peer) = time::timeout(Duration::from_secs(2), listeners.accept()).await.unwrap().unwrap();
        assert!(peer.is_ipv4());

        let _v6 = TcpStream::connect(addrs[1]).await.unwrap();
        let (_, peer) = time::timeout(Duration::from_secs(2), listeners.accept()).await.unwrap().unwrap();
        assert!(peer.is_ipv6());
    }

    // ============================================
    // Identity probe
    // ============================================

    #[tokio::test]
    async fn test_probe_discovers_identity() {
        let body = r#"{"FriendlyName":"HDHomeRun","DeviceID":"10A2E001"}"#;
        let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}", body.len(), body);
        let (port, mut requests) = fake_device(response.into_bytes()).await;

        let service = Arc::new(ProxyService::new(
            ProxySettings {
                device_web_port: port,
                ..local_settings()
            },
            ChannelTable::default(),
        ));
        service.clone().probe_device_identity().await;

        assert!(requests.recv().await.unwrap().starts_with("GET / HTTP/1.1\r\n"));
        assert_eq!(service.identity().unwrap().original, "10A2E001");
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_fatal() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let service = Arc::new(ProxyService::new(
            ProxySettings {
                device_web_port: port,
                ..local_settings()
            },
            ChannelTable::default(),
        ));
        service.clone().probe_device_identity().await;

        assert!(service.identity().is_none());
    }

    // ============================================
    // End to end
    // ============================================

    #[tokio::test]
    async fn test_web_port_end_to_end() {
        let body = r#"[{"GuideNumber":"7.1","URL":"http://127.0.0.1:5004/auto/v7.1"},{"GuideNumber":"9.1","URL":"http://127.0.0.1:5004/auto/v9.1"}]"#;
        let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
        let (device_port, mut requests) = fake_device(response.into_bytes()).await;

        let settings = ProxySettings {
            device_web_port: device_port,
            service_host_name: Some("proxy.lan".to_string()),
            service_capture_port: 6004,
            ..local_settings()
        };
        let channels = ChannelTable::from_entries([("7-1", "16:9")]);
        let service = Arc::new(ProxyService::new(settings, channels));

        let listeners = ListenerSet::bind(service.settings(), 0).unwrap();
        let proxy_addr = listeners.local_addrs().unwrap()[0];
        let cancel = CancellationToken::new();
        let server = tokio::spawn(service.clone().accept_loop(listeners, HttpRelay::new, cancel.clone()));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(format!("GET /lineup.json HTTP/1.1\r\nHost: {}\r\n\r\n", proxy_addr).as_bytes())
            .await
            .unwrap();

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();

        let expected_body = r#"[{"GuideNumber":"7.1","URL":"http://proxy.lan:6004/auto/v7.1"},{"GuideNumber":"9.1","URL":"http://127.0.0.1:5004/auto/v9.1"}]"#;
        assert_eq!(
            received,
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", expected_body.len(), expected_body)
        );

        let forwarded = requests.recv().await.unwrap();
        assert!(forwarded.contains(&format!("\r\nHost: 127.0.0.1:{}\r\n", device_port)));

        cancel.cancel();
        time::timeout(Duration::from_secs(3), server).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_capture_port_end_to_end() {
        let mut video = vec![0x47, 0x40, 0x11];
        video.extend_from_slice(&[0x00, 0x00, 0x01, 0xB3, 0x2D, 0x01, 0xE0, 0x24, 0xFF]);
        let (device_port, _requests) = fake_device(video.clone()).await;

        let settings = ProxySettings {
            device_capture_port: device_port,
            ..local_settings()
        };
        let channels = ChannelTable::from_entries([("7.1", "16:9")]);
        let service = Arc::new(ProxyService::new(settings, channels));

        let listeners = ListenerSet::bind(service.settings(), 0).unwrap();
        let proxy_addr = listeners.local_addrs().unwrap()[0];
        let cancel = CancellationToken::new();
        let server = tokio::spawn(service.clone().accept_loop(listeners, VideoRelay::new, cancel.clone()));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"GET /auto/v7.1 HTTP/1.1\r\n\r\n").await.unwrap();

        let mut received = vec![0u8; video.len()];
        client.read_exact(&mut received).await.unwrap();

        video[10] = 0x34;
        assert_eq!(received, video);

        cancel.cancel();
        time::timeout(Duration::from_secs(3), server).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_listening() {
        let service = Arc::new(ProxyService::new(local_settings(), ChannelTable::default()));
        let listeners = ListenerSet::bind(service.settings(), 0).unwrap();
        let proxy_addr = listeners.local_addrs().unwrap()[0];
        let cancel = CancellationToken::new();

        let server = tokio::spawn(service.accept_loop(listeners, VideoRelay::new, cancel.clone()));
        cancel.cancel();
        time::timeout(Duration::from_secs(3), server).await.unwrap().unwrap().unwrap();

        assert!(TcpStream::connect(proxy_addr).await.is_err());
    }
}
