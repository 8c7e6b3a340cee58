//! DeviceChannel: a TCP socket to a peer with an optional TLS upgrade.
//!
//! Framing is a single newline-terminated JSON object per packet, matching
//! the wire format of every KDE Connect transport — plaintext identity
//! exchange and the encrypted channel use the same delimiter so both sides
//! of [`DeviceChannel`] share one read loop.

use std::net::SocketAddr;
use std::pin::Pin;

use openssl::ssl::Ssl;
use openssl::x509::X509;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, warn};

use super::tls_config;
use crate::error::{CoreError, Result};
use crate::identity::{self, LocalCertificate};
use crate::packet::Packet;

const CHANNEL_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Which side of the TCP handshake this channel played.
///
/// KDE Connect inverts the usual TLS convention: the peer that initiated
/// the TCP connection plays the TLS *server* role, and the peer that
/// accepted it plays the TLS *client* role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

enum Stream {
    Plain(TcpStream),
    Secured(SslStream<TcpStream>),
}

/// An open connection to a peer, plaintext until [`DeviceChannel::secure`]
/// upgrades it.
pub struct DeviceChannel {
    stream: Stream,
    remote_addr: SocketAddr,
    role: Role,
}

impl DeviceChannel {
    /// Connect to `(host, port)`, send `our_identity` in plaintext, and
    /// read back the peer's identity packet. Fails with
    /// [`CoreError::IdentityMismatch`] if `expected_device_id` is given
    /// and does not match the peer's advertised `deviceId`.
    pub async fn open(
        host: std::net::IpAddr,
        port: u16,
        our_identity: &Packet,
        expected_device_id: Option<&str>,
    ) -> Result<(Self, Packet)> {
        let addr = SocketAddr::new(host, port);
        debug!(%addr, "opening channel");

        let tcp_stream = timeout(CHANNEL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CoreError::NetworkUnreachable(format!("timed out connecting to {addr}")))?
            .map_err(|e| CoreError::from_io_error(e, "connecting"))?;

        let mut channel = Self {
            stream: Stream::Plain(tcp_stream),
            remote_addr: addr,
            role: Role::Initiator,
        };

        channel.send(our_identity).await?;
        let peer_identity = channel.receive().await?;

        if !peer_identity.is_type("kdeconnect.identity") {
            return Err(CoreError::MalformedPacket(format!(
                "expected identity packet, got {}",
                peer_identity.packet_type
            )));
        }

        if let Some(expected) = expected_device_id {
            let actual = peer_identity
                .get_body_field::<String>("deviceId")
                .unwrap_or_default();
            if actual != expected {
                return Err(CoreError::IdentityMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        Ok((channel, peer_identity))
    }

    /// Wrap a TCP stream accepted by a listener, after the peer's
    /// plaintext identity has already been read off it by the caller.
    pub fn from_accepted(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            stream: Stream::Plain(stream),
            remote_addr,
            role: Role::Acceptor,
        }
    }

    /// Read one plaintext identity packet off a freshly accepted stream,
    /// byte by byte so no data past the newline delimiter is buffered
    /// ahead of the TLS handshake that follows.
    pub async fn read_plaintext_identity(stream: &mut TcpStream) -> Result<Packet> {
        let bytes = read_framed(stream, CHANNEL_TIMEOUT).await?;
        let packet = Packet::from_bytes(&bytes)?;
        if !packet.is_type("kdeconnect.identity") {
            return Err(CoreError::MalformedPacket(format!(
                "expected identity packet, got {}",
                packet.packet_type
            )));
        }
        Ok(packet)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Upgrade the plaintext channel to TLS. The initiator plays the TLS
    /// server role; the acceptor plays the TLS client role. If
    /// `expected_cert_der` is provided, the peer's leaf certificate must
    /// match it byte-for-byte or the upgrade fails with
    /// [`CoreError::CertificatePinningFailed`].
    pub async fn secure(
        mut self,
        local_cert: &LocalCertificate,
        expected_cert_der: Option<&[u8]>,
    ) -> Result<(Self, X509)> {
        let tcp_stream = match self.stream {
            Stream::Plain(s) => s,
            Stream::Secured(_) => {
                return Err(CoreError::TlsHandshakeFailed(
                    "channel is already secured".to_string(),
                ))
            }
        };

        let mut tls_stream = match self.role {
            Role::Initiator => {
                debug!(addr = %self.remote_addr, "starting TLS handshake as server");
                let acceptor =
                    tls_config::create_server_config(&local_cert.certificate, &local_cert.private_key)?;
                let ssl = Ssl::new(acceptor.context())?;
                let mut stream = SslStream::new(ssl, tcp_stream)?;
                timeout(CHANNEL_TIMEOUT, Pin::new(&mut stream).accept())
                    .await
                    .map_err(|_| CoreError::TlsHandshakeFailed("handshake timed out".to_string()))?
                    .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
                stream
            }
            Role::Acceptor => {
                debug!(addr = %self.remote_addr, "starting TLS handshake as client");
                let connector =
                    tls_config::create_client_config(&local_cert.certificate, &local_cert.private_key)?;
                let ssl = Ssl::new(connector.context())?;
                let mut stream = SslStream::new(ssl, tcp_stream)?;
                timeout(CHANNEL_TIMEOUT, Pin::new(&mut stream).connect())
                    .await
                    .map_err(|_| CoreError::TlsHandshakeFailed("handshake timed out".to_string()))?
                    .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
                stream
            }
        };

        let peer_cert = tls_stream
            .ssl()
            .peer_certificate()
            .ok_or_else(|| CoreError::TlsHandshakeFailed("peer presented no certificate".to_string()))?;

        if let Some(expected) = expected_cert_der {
            let actual = peer_cert
                .to_der()
                .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
            if actual != expected {
                warn!(addr = %self.remote_addr, "peer certificate does not match the pinned certificate");
                return Err(CoreError::CertificatePinningFailed(self.remote_addr.to_string()));
            }
        }

        self.stream = Stream::Secured(tls_stream);
        Ok((self, peer_cert))
    }

    /// Serialize and write one framed packet.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(CoreError::MalformedPacket(format!(
                "packet too large: {} bytes (max {MAX_PACKET_SIZE})",
                bytes.len()
            )));
        }

        let result = match &mut self.stream {
            Stream::Plain(s) => write_framed(s, &bytes).await,
            Stream::Secured(s) => write_framed(s, &bytes).await,
        };

        result.map_err(|e| CoreError::ChannelClosed(e.to_string()))
    }

    /// Read the next framed packet, suspending until one arrives.
    pub async fn receive(&mut self) -> Result<Packet> {
        let bytes = match &mut self.stream {
            Stream::Plain(s) => read_framed(s, CHANNEL_TIMEOUT).await?,
            Stream::Secured(s) => read_framed(s, CHANNEL_TIMEOUT).await?,
        };
        Packet::from_bytes(&bytes)
    }

    /// Shut down both directions. Idempotent: errors from an
    /// already-closed socket are swallowed.
    pub async fn close(mut self) {
        let _ = match &mut self.stream {
            Stream::Plain(s) => s.shutdown().await,
            Stream::Secured(s) => s.shutdown().await,
        };
    }
}

async fn write_framed<S: AsyncWriteExt + Unpin>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn read_framed<S: AsyncReadExt + Unpin>(stream: &mut S, budget: Duration) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match timeout(budget, stream.read_exact(&mut byte)).await {
            Ok(Ok(_)) => {
                bytes.push(byte[0]);
                if byte[0] == b'\n' {
                    return Ok(bytes);
                }
                if bytes.len() > MAX_PACKET_SIZE {
                    return Err(CoreError::MalformedPacket(format!(
                        "packet exceeds {MAX_PACKET_SIZE} bytes"
                    )));
                }
            }
            Ok(Err(e)) => return Err(CoreError::ChannelClosed(e.to_string())),
            Err(_) => return Err(CoreError::ChannelClosed("read timed out".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_exchanges_identity_and_rejects_wrong_device_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _peer_identity = DeviceChannel::read_plaintext_identity(&mut stream).await.unwrap();
            let mut channel = DeviceChannel::from_accepted(stream, addr);
            let reply = Packet::identity("peer-1", "Peer", 7, addr.port(), "phone", &[], &[]);
            channel.send(&reply).await.unwrap();
        });

        let our_identity = Packet::identity("me", "Me", 7, addr.port(), "desktop", &[], &[]);
        let (_, peer_identity) =
            DeviceChannel::open(addr.ip(), addr.port(), &our_identity, Some("peer-1"))
                .await
                .unwrap();
        assert_eq!(
            peer_identity.get_body_field::<String>("deviceId"),
            Some("peer-1".to_string())
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn open_fails_on_device_id_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _peer_identity = DeviceChannel::read_plaintext_identity(&mut stream).await.unwrap();
            let mut channel = DeviceChannel::from_accepted(stream, addr);
            let reply = Packet::identity("unexpected", "Peer", 7, addr.port(), "phone", &[], &[]);
            channel.send(&reply).await.unwrap();
        });

        let our_identity = Packet::identity("me", "Me", 7, addr.port(), "desktop", &[], &[]);
        let result =
            DeviceChannel::open(addr.ip(), addr.port(), &our_identity, Some("expected-id")).await;
        assert!(matches!(result, Err(CoreError::IdentityMismatch { .. })));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn tls_upgrade_completes_with_inverted_roles() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor_cert = LocalCertificate::generate("acceptor").unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _peer_identity = DeviceChannel::read_plaintext_identity(&mut stream).await.unwrap();
            let reply = Packet::identity("acceptor", "Acceptor", 7, addr.port(), "desktop", &[], &[]);
            let mut channel = DeviceChannel::from_accepted(stream, addr);
            channel.send(&reply).await.unwrap();
            let (_secured, _peer_cert) = channel.secure(&acceptor_cert, None).await.unwrap();
        });

        let initiator_cert = LocalCertificate::generate("initiator").unwrap();
        let our_identity = Packet::identity("initiator", "Initiator", 7, addr.port(), "desktop", &[], &[]);
        let (channel, _peer_identity) =
            DeviceChannel::open(addr.ip(), addr.port(), &our_identity, None)
                .await
                .unwrap();

        assert_eq!(channel.role(), Role::Initiator);
        let (_secured, peer_cert) = channel.secure(&initiator_cert, None).await.unwrap();
        assert_eq!(
            identity::fingerprint(&peer_cert).unwrap(),
            acceptor_cert.fingerprint().unwrap()
        );

        server.await.unwrap();
    }
}
