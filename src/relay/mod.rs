use log::{debug, trace, warn};

use std::{net::SocketAddr, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tokio_util::sync::CancellationToken;

pub mod http;
pub mod video;

pub use http::HttpRelay;
pub use video::VideoRelay;

const CHUNK_SIZE: usize = 4096;

/// How device data is handed to [`Relay::inspect_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffering {
    /// Every read is inspected and forwarded as soon as it arrives.
    Streaming,
    /// Reads are collected until the device hangs up, then inspected once.
    WholeResponse,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayTimeouts {
    pub connect: Duration,
    pub stream: Duration,
}

/// Protocol specific half of a relay session.
///
/// The engine in [`run`] owns both sockets; implementors only see the bytes.
/// Hooks are called with the relay borrowed across socket writes, hence `Sync`.
pub trait Relay: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn device_endpoint(&self) -> (String, u16);

    fn buffering(&self) -> Buffering {
        Buffering::Streaming
    }

    fn disconnect_after_first_read(&self) -> bool {
        false
    }

    /// Called once with the first chunk read from the client.
    fn inspect_request(&mut self, _request: &mut Vec<u8>) {}

    fn inspect_response(&mut self, _response: &mut Vec<u8>) {}

    fn on_client_disconnected(&self) {}

    fn on_lost_device_connection(&self) {}
}

/// Relays one accepted client connection until either side hangs up or
/// `cancel` fires. Both sockets are closed when this returns.
pub async fn run<R: Relay>(
    relay: R,
    client: TcpStream,
    peer_addr: SocketAddr,
    timeouts: RelayTimeouts,
    cancel: CancellationToken,
) {
    let kind = relay.kind();

    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(target: "hdhrproxy", "Cancelled {} relay for {}", kind, peer_addr);
        }
        result = stream(relay, client, peer_addr, timeouts) => {
            if let Err(e) = result {
                warn!(target: "hdhrproxy", "{} relay for {} ended: {:#}", kind, peer_addr, e);
            }
        }
    }

    trace!(target: "hdhrproxy", "Closed {} connection with: {}", kind, peer_addr);
}

async fn stream<R: Relay>(
    mut relay: R,
    mut client: TcpStream,
    peer_addr: SocketAddr,
    timeouts: RelayTimeouts,
) -> Result<()> {
    let (host, port) = relay.device_endpoint();

    let device = time::timeout(timeouts.connect, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| anyhow!("Timed out connecting to device {}:{}", host, port))?
        .with_context(|| format!("Failed to connect to device {}:{}", host, port))?;

    let mut device = Some(device);
    let mut buffer = vec![0u8; CHUNK_SIZE];

    let count = client
        .read(&mut buffer)
        .await
        .context("Failed to read request from client")?;

    if count == 0 {
        trace!(target: "hdhrproxy", "Client {} hung up before sending a request", peer_addr);
        return Ok(());
    }

    buffer.truncate(count);
    relay.inspect_request(&mut buffer);

    if let Some(device) = device.as_mut() {
        device
            .write_all(&buffer)
            .await
            .context("Failed to forward request to device")?;
    }

    let mut response = Vec::new();

    loop {
        let received = match device.as_mut() {
            Some(stream) => read_device(stream, &mut buffer, timeouts.stream, peer_addr).await,
            None => false,
        };

        if !received {
            drop(device.take());

            if relay.buffering() == Buffering::WholeResponse {
                if !response.is_empty() {
                    relay.inspect_response(&mut response);
                    if send(&relay, &mut client, &response).await {
                        let _ = client.shutdown().await;
                    }
                }
            } else {
                relay.on_lost_device_connection();
            }

            return Ok(());
        }

        if relay.disconnect_after_first_read() {
            drop(device.take());
        }

        if relay.buffering() == Buffering::WholeResponse {
            response.extend_from_slice(&buffer);
            continue;
        }

        relay.inspect_response(&mut buffer);

        if !send(&relay, &mut client, &buffer).await {
            return Ok(());
        }
    }
}

/// Fills `buffer` with the next device read. `false` means the device is gone.
async fn read_device(
    device: &mut TcpStream,
    buffer: &mut Vec<u8>,
    timeout: Duration,
    peer_addr: SocketAddr,
) -> bool {
    buffer.resize(CHUNK_SIZE, 0);

    match time::timeout(timeout, device.read(buffer)).await {
        Ok(Ok(0)) => false,
        Ok(Ok(count)) => {
            buffer.truncate(count);
            true
        }
        Ok(Err(e)) => {
            trace!(target: "hdhrproxy", "Device read failed for {}: {}", peer_addr, e);
            false
        }
        Err(_) => {
            debug!(target: "hdhrproxy", "Device went quiet for {}s while serving {}", timeout.as_secs(), peer_addr);
            false
        }
    }
}

/// Writes `data` to the client. `false` means the client is gone.
async fn send<R: Relay>(relay: &R, client: &mut TcpStream, data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }

    match client.write_all(data).await {
        Ok(()) => true,
        Err(e) => {
            trace!(target: "hdhrproxy", "Client write failed: {}", e);
            relay.on_client_disconnected();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use tokio::net::TcpListener;

    const TIMEOUTS: RelayTimeouts = RelayTimeouts {
        connect: Duration::from_secs(2),
        stream: Duration::from_secs(5),
    };

    #[derive(Default)]
    struct HookLog {
        requests: AtomicUsize,
        responses: AtomicUsize,
        lost_device: AtomicBool,
        client_gone: AtomicBool,
    }

    struct UppercaseRelay {
        port: u16,
        buffering: Buffering,
        one_shot: bool,
        hooks: Arc<HookLog>,
    }

    impl UppercaseRelay {
        fn new(port: u16, buffering: Buffering, hooks: Arc<HookLog>) -> Self {
            UppercaseRelay {
                port,
                buffering,
                one_shot: false,
                hooks,
            }
        }
    }

    impl Relay for UppercaseRelay {
        fn kind(&self) -> &'static str {
            "test"
        }

        fn device_endpoint(&self) -> (String, u16) {
            ("127.0.0.1".to_string(), self.port)
        }

        fn buffering(&self) -> Buffering {
            self.buffering
        }

        fn disconnect_after_first_read(&self) -> bool {
            self.one_shot
        }

        fn inspect_request(&mut self, request: &mut Vec<u8>) {
            self.hooks.requests.fetch_add(1, Ordering::SeqCst);
            request.extend_from_slice(b"!");
        }

        fn inspect_response(&mut self, response: &mut Vec<u8>) {
            self.hooks.responses.fetch_add(1, Ordering::SeqCst);
            response.make_ascii_uppercase();
        }

        fn on_client_disconnected(&self) {
            self.hooks.client_gone.store(true, Ordering::SeqCst);
        }

        fn on_lost_device_connection(&self) {
            self.hooks.lost_device.store(true, Ordering::SeqCst);
        }
    }

    /// Fake device: checks the forwarded request, then sends `parts` with a pause between each.
    async fn spawn_device(expected_request: &'static [u8], parts: Vec<&'static [u8]>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; expected_request.len()];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(request, expected_request);

            for part in parts {
                if socket.write_all(part).await.is_err() {
                    return;
                }
                time::sleep(Duration::from_millis(100)).await;
            }
        });

        port
    }

    /// Starts a proxy for a single connection and returns the client side.
    async fn connect_through<R: Relay>(relay: R, cancel: CancellationToken) -> (TcpStream, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (client, peer) = listener.accept().await.unwrap();
            run(relay, client, peer, TIMEOUTS, cancel).await;
        });

        (TcpStream::connect(addr).await.unwrap(), handle)
    }

    // ============================================
    // Streaming
    // ============================================

    #[tokio::test]
    async fn test_streaming_inspects_each_chunk() {
        let hooks = Arc::new(HookLog::default());
        let port = spawn_device(b"GET!", vec![b"abc", b"def"]).await;
        let relay = UppercaseRelay::new(port, Buffering::Streaming, hooks.clone());

        let (mut client, handle) = connect_through(relay, CancellationToken::new()).await;
        client.write_all(b"GET").await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        handle.await.unwrap();

        assert_eq!(received, b"ABCDEF");
        assert_eq!(hooks.requests.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.responses.load(Ordering::SeqCst), 2);
        assert!(hooks.lost_device.load(Ordering::SeqCst));
        assert!(!hooks.client_gone.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disconnect_after_first_read() {
        let hooks = Arc::new(HookLog::default());
        let port = spawn_device(b"GET!", vec![b"first", b"second"]).await;
        let mut relay = UppercaseRelay::new(port, Buffering::Streaming, hooks.clone());
        relay.one_shot = true;

        let (mut client, handle) = connect_through(relay, CancellationToken::new()).await;
        client.write_all(b"GET").await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        handle.await.unwrap();

        assert_eq!(received, b"FIRST");
        assert!(hooks.lost_device.load(Ordering::SeqCst));
    }

    // ============================================
    // Whole response buffering
    // ============================================

    #[tokio::test]
    async fn test_whole_response_is_inspected_once() {
        let hooks = Arc::new(HookLog::default());
        let port = spawn_device(b"GET!", vec![b"http/1.1 200 ok\r\n", b"\r\nbody"]).await;
        let relay = UppercaseRelay::new(port, Buffering::WholeResponse, hooks.clone());

        let (mut client, handle) = connect_through(relay, CancellationToken::new()).await;
        client.write_all(b"GET").await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        handle.await.unwrap();

        assert_eq!(received, b"HTTP/1.1 200 OK\r\n\r\nBODY");
        assert_eq!(hooks.responses.load(Ordering::SeqCst), 1);
        assert!(!hooks.lost_device.load(Ordering::SeqCst));
    }

    // ============================================
    // Failure and shutdown paths
    // ============================================

    #[tokio::test]
    async fn test_unreachable_device_closes_client() {
        let hooks = Arc::new(HookLog::default());
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let relay = UppercaseRelay::new(port, Buffering::Streaming, hooks.clone());

        let (mut client, handle) = connect_through(relay, CancellationToken::new()).await;
        let _ = client.write_all(b"GET").await;

        let mut received = Vec::new();
        let _ = client.read_to_end(&mut received).await;
        handle.await.unwrap();

        assert!(received.is_empty());
        assert_eq!(hooks.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_hangup_mid_stream_drops_device() {
        let hooks = Arc::new(HookLog::default());
        let port = spawn_device(b"GET!", vec![&b"chunk"[..]; 40]).await;
        let relay = UppercaseRelay::new(port, Buffering::Streaming, hooks.clone());

        let (mut client, handle) = connect_through(relay, CancellationToken::new()).await;
        client.write_all(b"GET").await.unwrap();

        let mut first = [0u8; 5];
        client.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"CHUNK");
        drop(client);

        time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();

        assert!(hooks.client_gone.load(Ordering::SeqCst));
        assert!(!hooks.lost_device.load(Ordering::SeqCst));
    }

    #[test]
    fn test_relay_futures_can_be_spawned() {
        fn assert_send<F: std::future::Future + Send>(_: &F) {}

        // Only the type is checked; the future is never polled.
        let _ = |relay: UppercaseRelay, client: TcpStream, peer_addr: SocketAddr| {
            assert_send(&run(relay, client, peer_addr, TIMEOUTS, CancellationToken::new()));
        };
    }

    #[tokio::test]
    async fn test_cancellation_tears_down_relay() {
        let hooks = Arc::new(HookLog::default());
        let port = spawn_device(b"GET!", vec![b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"]).await;
        let relay = UppercaseRelay::new(port, Buffering::WholeResponse, hooks.clone());
        let cancel = CancellationToken::new();

        let (mut client, handle) = connect_through(relay, cancel.clone()).await;
        client.write_all(b"GET").await.unwrap();
        time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();

        time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(hooks.responses.load(Ordering::SeqCst), 0);
    }
}
