//! Byte transport for outgoing S2S streams.
//!
//! TCP, optionally upgraded to TLS mid-stream, with all sends bounded
//! by the configured send timeout. The transport hands framed stream
//! events upward by pumping received bytes through the session's
//! [`XmlParser`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::ConnectConfig;
use crate::parser::{ParsedFrame, XmlParser};
use crate::XmppError;

/// Framed event or end-of-stream.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete frame.
    Frame(ParsedFrame),
    /// The peer closed the connection.
    Closed,
}

#[derive(Default)]
enum StreamInner {
    #[default]
    None,
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// One outgoing stream's socket, plain or TLS.
pub struct StreamTransport {
    inner: StreamInner,
    send_timeout: Duration,
    peer: Option<SocketAddr>,
}

impl StreamTransport {
    /// Connect to the first reachable candidate address.
    ///
    /// Candidates are tried in order; the configured local address is
    /// bound when its family matches. Returns the transport and the
    /// address that accepted.
    pub async fn connect(
        addrs: &[SocketAddr],
        config: &ConnectConfig,
        send_timeout: Duration,
    ) -> Result<(Self, SocketAddr), XmppError> {
        let mut last_error: Option<std::io::Error> = None;

        for addr in addrs {
            match Self::connect_one(*addr, config).await {
                Ok(stream) => {
                    debug!(addr = %addr, "TCP connection established");
                    return Ok((
                        Self {
                            inner: StreamInner::Tcp(stream),
                            send_timeout,
                            peer: Some(*addr),
                        },
                        *addr,
                    ));
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "TCP connection failed");
                    last_error = Some(e);
                }
            }
        }

        Err(XmppError::Io(last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no candidate addresses")
        })))
    }

    async fn connect_one(addr: SocketAddr, config: &ConnectConfig) -> std::io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(local) = config.local_address {
            if local.is_ipv4() == addr.is_ipv4() {
                socket.bind(SocketAddr::new(local, 0))?;
            }
        }

        match tokio::time::timeout(config.connect_timeout, socket.connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        }
    }

    /// The peer address, once connected.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the stream has been upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner, StreamInner::Tls(_))
    }

    /// Send raw bytes, bounded by the send timeout. A timed-out send
    /// fails the session.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), XmppError> {
        let fut = async {
            match &mut self.inner {
                StreamInner::None => Err(XmppError::stream("socket not open")),
                StreamInner::Tcp(s) => {
                    s.write_all(data).await?;
                    s.flush().await?;
                    Ok(())
                }
                StreamInner::Tls(s) => {
                    s.write_all(data).await?;
                    s.flush().await?;
                    Ok(())
                }
            }
        };

        match tokio::time::timeout(self.send_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(XmppError::SendTimeout),
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        match &mut self.inner {
            StreamInner::None => Err(XmppError::stream("socket not open")),
            StreamInner::Tcp(s) => Ok(s.read(buf).await?),
            StreamInner::Tls(s) => Ok(s.read(buf).await?),
        }
    }

    /// Pump bytes into the parser until one complete frame is
    /// available, the peer closes, or reading fails.
    pub async fn recv(&mut self, parser: &mut XmlParser) -> Result<TransportEvent, XmppError> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(frame) = parser.next_frame()? {
                return Ok(TransportEvent::Frame(frame));
            }

            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(TransportEvent::Closed);
            }
            parser.feed(&buf[..n]);
        }
    }

    /// Upgrade the plain TCP stream to TLS (client side of STARTTLS).
    pub async fn starttls(
        &mut self,
        connector: &TlsConnector,
        server_name: &str,
    ) -> Result<(), XmppError> {
        let tcp = match std::mem::take(&mut self.inner) {
            StreamInner::Tcp(s) => s,
            StreamInner::Tls(_) => return Err(XmppError::stream("already using TLS")),
            StreamInner::None => return Err(XmppError::stream("socket not open")),
        };

        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| XmppError::stream(format!("invalid TLS server name: {}", e)))?;

        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| XmppError::stream(format!("TLS handshake failed: {}", e)))?;

        self.inner = StreamInner::Tls(Box::new(tls));
        debug!("S2S TLS upgrade complete");
        Ok(())
    }

    /// Close the stream, best-effort sending the stream close tag.
    pub async fn close(&mut self) {
        if matches!(self.inner, StreamInner::None) {
            return;
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            match &mut self.inner {
                StreamInner::Tcp(s) => {
                    let _ = s.write_all(b"</stream:stream>").await;
                    let _ = s.shutdown().await;
                }
                StreamInner::Tls(s) => {
                    let _ = s.write_all(b"</stream:stream>").await;
                    let _ = s.shutdown().await;
                }
                StreamInner::None => {}
            }
        })
        .await;
        self.inner = StreamInner::None;
    }

    /// Drop the socket without the closing handshake, e.g. before a
    /// reconnect with different stream options.
    pub fn abort(&mut self) {
        self.inner = StreamInner::None;
    }
}
