use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::utils::{net, LanError, Result};

/// Per-read buffer for TCP and UDP receives. Reads deliver whatever
/// arrived; message framing happens a layer up.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

const WRITE_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// Delivers received bytes: (bytes, remote endpoint "host:port").
pub type DataCallback = Arc<dyn Fn(&[u8], &str) + Send + Sync>;

/// Delivers lifecycle transitions: (status, endpoint, message).
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus, &str, &str) + Send + Sync>;

struct WriteOp {
    data: Vec<u8>,
    done: oneshot::Sender<i64>,
}

/// One live TCP connection: a read loop task and a writer task draining a
/// queue of write ops. The queue serializes writes to the endpoint in
/// submission order.
struct Connection {
    writer_tx: mpsc::Sender<WriteOp>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    recv_task: JoinHandle<()>,
}

/// Concurrent non-blocking TCP and UDP I/O with callback delivery.
///
/// Connections are registered by remote endpoint string. All failures are
/// routed through status callbacks or sentinel return values; nothing
/// propagates out of the I/O tasks.
pub struct SocketEngine {
    connections: Arc<Mutex<HashMap<String, Connection>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    udp: Mutex<Option<UdpEndpoint>>,
    shut_down: AtomicBool,
}

impl SocketEngine {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            acceptor: Mutex::new(None),
            udp: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Bind the TCP transfer port and start accepting. Every accepted
    /// connection gets its own read/write tasks and reports through the
    /// supplied callbacks.
    pub async fn init_tcp_server(
        &self,
        port: u16,
        on_data: DataCallback,
        on_status: StatusCallback,
    ) -> Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port))
            .await
            .map_err(|e| LanError::Network(format!("Failed to bind TCP port {}: {}", port, e)))?;

        info!("TCP server listening on port {}", port);

        let connections = self.connections.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        install_connection(
                            connections.clone(),
                            stream,
                            addr.to_string(),
                            on_data.clone(),
                            on_status.clone(),
                        )
                        .await;
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        *self.acceptor.lock().await = Some(handle);
        Ok(())
    }

    /// Connect to a remote transfer endpoint. A live connection to the
    /// same endpoint is reused. The `Connected` event is emitted by the
    /// engine once the connection is installed.
    pub async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        on_data: DataCallback,
        on_status: StatusCallback,
    ) -> Result<()> {
        let endpoint = format!("{}:{}", host, port);

        if self.connections.lock().await.contains_key(&endpoint) {
            debug!("Reusing existing connection to {}", endpoint);
            return Ok(());
        }

        let stream = TcpStream::connect(&endpoint).await.map_err(|e| {
            LanError::ConnectionFailed(format!("Failed to connect to {}: {}", endpoint, e))
        })?;

        install_connection(
            self.connections.clone(),
            stream,
            endpoint,
            on_data,
            on_status,
        )
        .await;
        Ok(())
    }

    /// Queue bytes for a connection. Resolves with the number of bytes
    /// written, or -1 if the endpoint is unknown or the write failed.
    /// Writes to one endpoint complete in submission order.
    pub async fn send_tcp(&self, endpoint: &str, data: Vec<u8>) -> i64 {
        let writer_tx = {
            let connections = self.connections.lock().await;
            connections.get(endpoint).map(|c| c.writer_tx.clone())
        };

        let Some(writer_tx) = writer_tx else {
            warn!("send_tcp to unknown endpoint {}", endpoint);
            return -1;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if writer_tx.send(WriteOp { data, done: done_tx }).await.is_err() {
            return -1;
        }
        done_rx.await.unwrap_or(-1)
    }

    /// Open the UDP discovery socket (broadcast permitted, port shared
    /// via SO_REUSEADDR) and deliver every datagram upward.
    pub async fn init_udp_socket(&self, port: u16, on_data: DataCallback) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", port)
            .parse()
            .map_err(|e| LanError::Network(format!("Invalid address: {}", e)))?;
        let socket = Arc::new(net::create_discovery_socket(addr)?);

        info!("UDP socket bound on port {}", port);

        let recv_socket = socket.clone();
        let recv_task = tokio::spawn(async move {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match recv_socket.recv_from(&mut buffer).await {
                    Ok((n, from)) => on_data(&buffer[..n], &from.to_string()),
                    Err(e) => {
                        warn!("UDP receive error: {}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        let mut udp = self.udp.lock().await;
        if let Some(old) = udp.take() {
            old.recv_task.abort();
        }
        *udp = Some(UdpEndpoint { socket, recv_task });
        Ok(())
    }

    /// Broadcast a datagram to the given port. Returns bytes sent or -1.
    pub async fn send_udp_broadcast(&self, port: u16, data: &[u8]) -> i64 {
        self.send_udp_to(&format!("255.255.255.255:{}", port), data)
            .await
    }

    /// Send a datagram to one host. Returns bytes sent or -1.
    pub async fn send_udp(&self, host: &str, port: u16, data: &[u8]) -> i64 {
        self.send_udp_to(&format!("{}:{}", host, port), data).await
    }

    async fn send_udp_to(&self, target: &str, data: &[u8]) -> i64 {
        let socket = {
            let udp = self.udp.lock().await;
            udp.as_ref().map(|u| u.socket.clone())
        };

        if let Some(socket) = socket {
            return match socket.send_to(data, target).await {
                Ok(n) => n as i64,
                Err(e) => {
                    warn!("UDP send to {} failed: {}", target, e);
                    -1
                }
            };
        }

        // No bound socket yet; send from a temporary one.
        match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => {
                let _ = socket.set_broadcast(true);
                match socket.send_to(data, target).await {
                    Ok(n) => n as i64,
                    Err(e) => {
                        warn!("UDP send to {} failed: {}", target, e);
                        -1
                    }
                }
            }
            Err(e) => {
                warn!("Failed to open temporary UDP socket: {}", e);
                -1
            }
        }
    }

    /// Idempotent. Stops the acceptor and the UDP receive loop and drops
    /// every tracked connection.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(acceptor) = self.acceptor.lock().await.take() {
            acceptor.abort();
        }
        if let Some(udp) = self.udp.lock().await.take() {
            udp.recv_task.abort();
        }

        let mut connections = self.connections.lock().await;
        for (endpoint, connection) in connections.drain() {
            debug!("Closing connection to {}", endpoint);
            connection.reader_task.abort();
            connection.writer_task.abort();
        }

        info!("Socket engine shut down");
    }
}

impl Default for SocketEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a connection and spawn its read/write tasks. Emits the
/// `Connected` event once registered; removal and the terminal status
/// event happen when the read loop observes EOF or an error.
async fn install_connection(
    connections: Arc<Mutex<HashMap<String, Connection>>>,
    stream: TcpStream,
    endpoint: String,
    on_data: DataCallback,
    on_status: StatusCallback,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on {}: {}", endpoint, e);
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<WriteOp>(WRITE_QUEUE_DEPTH);

    let writer_endpoint = endpoint.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(op) = writer_rx.recv().await {
            let len = op.data.len() as i64;
            let result = match write_half.write_all(&op.data).await {
                Ok(()) => match write_half.flush().await {
                    Ok(()) => len,
                    Err(_) => -1,
                },
                Err(_) => -1,
            };

            let failed = result < 0;
            let _ = op.done.send(result);
            if failed {
                debug!("Write to {} failed; stopping writer", writer_endpoint);
                break;
            }
        }
    });

    let reader_connections = connections.clone();
    let reader_endpoint = endpoint.clone();
    let reader_status = on_status.clone();
    let reader_task = tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let (status, message) = loop {
            match read_half.read(&mut buffer).await {
                Ok(0) => break (ConnectionStatus::Disconnected, String::new()),
                Ok(n) => on_data(&buffer[..n], &reader_endpoint),
                Err(e) => break (ConnectionStatus::Error, e.to_string()),
            }
        };

        if let Some(connection) = reader_connections.lock().await.remove(&reader_endpoint) {
            connection.writer_task.abort();
        }
        reader_status(status, &reader_endpoint, &message);
    });

    let previous = connections.lock().await.insert(
        endpoint.clone(),
        Connection {
            writer_tx,
            reader_task,
            writer_task,
        },
    );
    if let Some(previous) = previous {
        previous.reader_task.abort();
        previous.writer_task.abort();
    }

    on_status(ConnectionStatus::Connected, &endpoint, "");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn collecting_callbacks() -> (
        DataCallback,
        StatusCallback,
        mpsc::UnboundedReceiver<(Vec<u8>, String)>,
        mpsc::UnboundedReceiver<(ConnectionStatus, String)>,
    ) {
        let (data_tx, data_rx) = unbounded_channel();
        let (status_tx, status_rx) = unbounded_channel();

        let on_data: DataCallback = Arc::new(move |bytes, endpoint| {
            let _ = data_tx.send((bytes.to_vec(), endpoint.to_string()));
        });
        let on_status: StatusCallback = Arc::new(move |status, endpoint, _| {
            let _ = status_tx.send((status, endpoint.to_string()));
        });

        (on_data, on_status, data_rx, status_rx)
    }

    #[tokio::test]
    async fn bidirectional_send_and_receive() {
        let port = net::find_available_port(46000).await.unwrap();

        let server = SocketEngine::new();
        let (srv_data, srv_status, mut srv_data_rx, _srv_status_rx) = collecting_callbacks();
        server.init_tcp_server(port, srv_data, srv_status).await.unwrap();

        let client = SocketEngine::new();
        let (cli_data, cli_status, mut cli_data_rx, _cli_status_rx) = collecting_callbacks();
        client
            .connect_tcp("127.0.0.1", port, cli_data, cli_status)
            .await
            .unwrap();

        let endpoint = format!("127.0.0.1:{}", port);
        let sent = client.send_tcp(&endpoint, b"ping".to_vec()).await;
        assert_eq!(sent, 4);

        let (bytes, client_endpoint) = srv_data_rx.recv().await.unwrap();
        assert_eq!(bytes, b"ping");

        // Reply on the endpoint the server observed.
        assert_eq!(server.send_tcp(&client_endpoint, b"pong!".to_vec()).await, 5);
        let (reply, _) = cli_data_rx.recv().await.unwrap();
        assert_eq!(reply, b"pong!");

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_unknown_endpoint_returns_minus_one() {
        let engine = SocketEngine::new();
        assert_eq!(engine.send_tcp("10.0.0.1:1", b"x".to_vec()).await, -1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn writes_to_one_endpoint_preserve_submission_order() {
        let port = net::find_available_port(46100).await.unwrap();

        let server = SocketEngine::new();
        let (srv_data, srv_status, mut srv_data_rx, _s) = collecting_callbacks();
        server.init_tcp_server(port, srv_data, srv_status).await.unwrap();

        let client = SocketEngine::new();
        let (cli_data, cli_status, _c, _cs) = collecting_callbacks();
        client
            .connect_tcp("127.0.0.1", port, cli_data, cli_status)
            .await
            .unwrap();

        let endpoint = format!("127.0.0.1:{}", port);
        let mut expected = Vec::new();
        for i in 0..50u8 {
            let payload = vec![i; 16];
            expected.extend_from_slice(&payload);
            assert_eq!(client.send_tcp(&endpoint, payload).await, 16);
        }

        let mut received = Vec::new();
        while received.len() < expected.len() {
            let (bytes, _) = srv_data_rx.recv().await.unwrap();
            received.extend_from_slice(&bytes);
        }
        assert_eq!(received, expected);

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn peer_close_emits_disconnected() {
        let port = net::find_available_port(46200).await.unwrap();

        let server = SocketEngine::new();
        let (srv_data, srv_status, _d, mut srv_status_rx) = collecting_callbacks();
        server.init_tcp_server(port, srv_data, srv_status).await.unwrap();

        {
            // Raw client closes as soon as it drops.
            let _stream = TcpStream::connect(format!("127.0.0.1:{}", port))
                .await
                .unwrap();
            let (status, _) = srv_status_rx.recv().await.unwrap();
            assert_eq!(status, ConnectionStatus::Connected);
        }

        let (status, _) = srv_status_rx.recv().await.unwrap();
        assert_eq!(status, ConnectionStatus::Disconnected);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn udp_roundtrip_between_engines() {
        let port_a = net::find_available_port(46300).await.unwrap();
        let port_b = net::find_available_port(port_a + 1).await.unwrap();

        let a = SocketEngine::new();
        let (a_data, _a_status, mut a_rx, _as) = collecting_callbacks();
        a.init_udp_socket(port_a, a_data).await.unwrap();

        let b = SocketEngine::new();
        let (b_data, _b_status, _b_rx, _bs) = collecting_callbacks();
        b.init_udp_socket(port_b, b_data).await.unwrap();

        let sent = b.send_udp("127.0.0.1", port_a, b"hello").await;
        assert_eq!(sent, 5);

        let (bytes, _) = a_rx.recv().await.unwrap();
        assert_eq!(bytes, b"hello");

        a.shutdown().await;
        b.shutdown().await;
    }
}
