//! HTTPS server with handshake-time certificate selection
//!
//! Every connection reads the ClientHello first, asks the
//! [`CertificateResolver`] for the certificate matching its SNI, and only then
//! completes the handshake. The decrypted stream goes to a [`ConnectionHandler`].

use async_trait::async_trait;
use certserve_cert::{CertificateResolver, ResolveError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum HttpsServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Certificate error: {0}")]
    CertificateError(#[from] ResolveError),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Byte stream handed to a [`ConnectionHandler`] after the TLS handshake
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type ClientStream = Box<dyn AsyncStream>;

/// Application served over the decrypted stream
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(&self, stream: ClientStream, peer: SocketAddr) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpsServerConfig {
    pub bind_addr: SocketAddr,
    /// ALPN protocols offered to clients, in preference order
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Limit for reading the ClientHello and for finishing the handshake
    pub handshake_timeout: Duration,
}

impl Default for HttpsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            alpn_protocols: vec![b"http/1.1".to_vec()],
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Presents the one certificate picked for this connection
#[derive(Debug)]
struct ResolvedCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for ResolvedCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

struct ConnectionContext {
    config: HttpsServerConfig,
    resolver: Arc<CertificateResolver>,
    handler: Arc<dyn ConnectionHandler>,
}

pub struct HttpsServer {
    config: HttpsServerConfig,
    resolver: Arc<CertificateResolver>,
    handler: Arc<dyn ConnectionHandler>,
}

impl HttpsServer {
    pub fn new(
        config: HttpsServerConfig,
        resolver: Arc<CertificateResolver>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            config,
            resolver,
            handler,
        }
    }

    /// Bind the listener without accepting yet
    pub async fn bind(self) -> Result<BoundHttpsServer, HttpsServerError> {
        let bind_addr = self.config.bind_addr;

        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            let port = bind_addr.port();
            let address = bind_addr.ip().to_string();
            let reason = e.to_string();
            HttpsServerError::BindError {
                address,
                port,
                reason,
            }
        })?;
        let local_addr = listener.local_addr()?;

        Ok(BoundHttpsServer {
            listener,
            local_addr,
            context: Arc::new(ConnectionContext {
                config: self.config,
                resolver: self.resolver,
                handler: self.handler,
            }),
        })
    }

    /// Start the HTTPS server
    pub async fn start(self) -> Result<(), HttpsServerError> {
        self.bind().await?.run().await
    }
}

/// A bound HTTPS server, ready to accept connections
pub struct BoundHttpsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ConnectionContext>,
}

impl BoundHttpsServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<(), HttpsServerError> {
        info!("HTTPS server listening on {}", self.local_addr);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let context = self.context.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, context).await {
                            debug!("HTTPS connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept HTTPS connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<ConnectionContext>,
) -> Result<(), HttpsServerError> {
    debug!("New HTTPS connection from {}", peer_addr);
    let handshake_timeout = context.config.handshake_timeout;

    let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);
    let start = tokio::time::timeout(handshake_timeout, acceptor)
        .await
        .map_err(|_| HttpsServerError::TlsError("Timed out reading ClientHello".to_string()))?
        .map_err(|e| HttpsServerError::TlsError(format!("Invalid ClientHello: {}", e)))?;

    let server_name = start.client_hello().server_name().map(str::to_string);

    let certified_key = match context
        .resolver
        .get_certificate(server_name.as_deref())
        .await
    {
        Ok(key) => key,
        Err(e) => {
            warn!(
                "No certificate for {} (SNI {:?}): {}",
                peer_addr, server_name, e
            );
            return Err(e.into());
        }
    };

    let mut tls_config = ServerConfig::builder_with_provider(Arc::new(
        tokio_rustls::rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| HttpsServerError::TlsError(e.to_string()))?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(ResolvedCertificate(certified_key)));
    tls_config.alpn_protocols = context.config.alpn_protocols.clone();

    let tls_stream = tokio::time::timeout(handshake_timeout, start.into_stream(Arc::new(tls_config)))
        .await
        .map_err(|_| HttpsServerError::TlsError("Handshake timed out".to_string()))?
        .map_err(|e| {
            warn!("TLS handshake failed from {}: {}", peer_addr, e);
            HttpsServerError::TlsError(format!("Handshake failed: {}", e))
        })?;

    debug!(
        "TLS handshake completed for {} (SNI {:?})",
        peer_addr, server_name
    );

    context.handler.handle(Box::new(tls_stream), peer_addr).await?;
    Ok(())
}
