//! Common utilities for integration tests
#![allow(dead_code)]

use bytes::BytesMut;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tls_gate::config::{GatewayConfig, ServerConfig};
use tls_gate::protocol::Address;
use tls_gate::registry::credential_for;
use tls_gate::server::{Gateway, ServerDependencies};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    let unique_id = uuid::Uuid::new_v4();
    let temp_dir = std::env::temp_dir();
    let cert_path = temp_dir.join(format!("tls-gate-test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("tls-gate-test-key-{}.pem", unique_id));

    tls_gate::tls::generate_self_signed_cert(
        "localhost",
        &["localhost".to_string(), "127.0.0.1".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}

/// TLS connector that trusts the given test certificate
pub fn tls_connector(cert_path: &PathBuf) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in tls_gate::tls::load_certs(cert_path).expect("Failed to load test certificate") {
        roots.add(cert).expect("Failed to trust test certificate");
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Open a TLS session to the gateway
pub async fn connect_tls(connector: &TlsConnector, addr: SocketAddr) -> TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr)
        .await
        .expect("Failed to connect to gateway");
    let name = ServerName::try_from("localhost").expect("invalid server name");
    connector
        .connect(name, tcp)
        .await
        .expect("TLS handshake with gateway failed")
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Create a UDP echo server for testing
pub async fn start_udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind UDP echo server");
    let addr = socket.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });

    addr
}

/// Response written by the recording fallback server
pub const FALLBACK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nfallback";

/// Start a fake web server that records each request it receives
///
/// A request ends at the first read that leaves the buffer ending in `\r\n\r\n`
pub async fn start_fallback_recorder() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    start_fallback_recorder_with(|request| request.ends_with(b"\r\n\r\n")).await
}

/// Start a fake web server that records bytes until `complete` returns true or EOF
pub async fn start_fallback_recorder_with<F>(
    complete: F,
) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>)
where
    F: Fn(&[u8]) -> bool + Send + Sync + 'static,
{
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind fallback server");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let (tx, rx) = mpsc::unbounded_channel();
    let complete = Arc::new(complete);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            let complete = Arc::clone(&complete);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            request.extend_from_slice(&buf[..n]);
                            if complete(&request) {
                                break;
                            }
                        }
                    }
                }
                let _ = tx.send(request);
                let _ = socket.write_all(FALLBACK_RESPONSE).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Build the handshake header a client sends before its payload
pub fn request_header(password: &str, command: u8, target: &Address) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(credential_for(password).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&[command]);
    target
        .write_to(&mut buf)
        .expect("Failed to encode target address");
    buf.extend_from_slice(b"\r\n");
    buf.to_vec()
}

/// Server config listening on a free local port with the given certificate
pub fn server_config(
    cert_path: &PathBuf,
    key_path: &PathBuf,
    fallback: Option<SocketAddr>,
) -> ServerConfig {
    let mut builder = ServerConfig::builder()
        .bind_addr("127.0.0.1")
        .bind_port(get_available_port())
        .cert_path(cert_path.clone())
        .key_path(key_path.clone())
        .handshake_timeout_secs(5)
        .udp_idle_timeout_secs(5)
        .connect_timeout_secs(5);
    if let Some(addr) = fallback {
        builder = builder.fallback_addr(addr.to_string());
    }
    builder.build().expect("Failed to build server config")
}

/// Running gateway that stops when dropped
pub struct TestGateway {
    pub addr: SocketAddr,
    pub gateway_state: Arc<tls_gate::server::ServerState>,
    shutdown: CancellationToken,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bind and run a gateway from a full configuration
pub async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let deps = ServerDependencies::from_config(&config).expect("Failed to build dependencies");
    start_gateway_with(config.server, deps).await
}

/// Bind and run a gateway with custom dependencies
pub async fn start_gateway_with(config: ServerConfig, deps: ServerDependencies) -> TestGateway {
    let gateway = Gateway::bind_with_dependencies(config, deps)
        .await
        .expect("Failed to bind gateway");
    let addr = gateway.local_addr().expect("Failed to get gateway addr");
    let gateway_state = Arc::clone(gateway.state());
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = gateway.run(token).await;
    });

    TestGateway {
        addr,
        gateway_state,
        shutdown,
    }
}

/// Read exactly `len` bytes with a timeout
pub async fn read_exact_timeout<R>(reader: &mut R, len: usize) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut buf))
        .await
        .expect("Timed out reading from gateway")
        .expect("Failed to read from gateway");
    buf
}

/// Read until EOF with a timeout
pub async fn read_to_end_timeout<R>(reader: &mut R) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut buf))
        .await
        .expect("Timed out waiting for the gateway to close");
    buf
}
