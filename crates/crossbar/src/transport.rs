use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    net::{Shutdown, TcpStream as StdTcpStream, ToSocketAddrs},
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use mio::net::TcpStream;
use rustls::{
    Certificate, ClientConfig, ClientConnection, Connection as TlsSession, PrivateKey,
    RootCertStore, ServerConfig, ServerName,
    client::{ServerCertVerified, ServerCertVerifier},
};
use tracing::debug;

use crate::conn::Endpoint;

/// A data socket, optionally wrapped in TLS.
///
/// All calls are non-blocking and surface `WouldBlock` unchanged. On the TLS
/// path a read may leave handshake bytes pending in the session; callers must
/// poll [`wants_write`] and arm write interest accordingly instead of
/// treating the stall as an error.
///
/// [`wants_write`]: Transport::wants_write
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls { stream: TcpStream, session: Box<TlsSession> },
}

impl Transport {
    pub fn plain(stream: TcpStream) -> Self {
        Self::Plain(stream)
    }

    pub fn tls(stream: TcpStream, session: TlsSession) -> Self {
        Self::Tls { stream, session: Box::new(session) }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(stream) | Transport::Tls { stream, .. } => stream,
        }
    }

    /// Reads decrypted bytes into `buf`. `Ok(0)` means EOF. Only returns
    /// `WouldBlock` once the socket is dry and no plaintext remains, which
    /// edge-triggered polling requires.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls { stream, session } => loop {
                // surface plaintext decrypted on a previous pull first
                match session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                match session.read_tls(stream) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {
                        session
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Writes plaintext. The TLS path reports the plaintext bytes accepted by
    /// the session, not the ciphertext bytes that reached the socket.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls { stream, session } => {
                let accepted = session.writer().write(buf)?;
                flush_session(session, stream)?;
                if accepted == 0 && !buf.is_empty() {
                    // Session buffer full: backpressure, not EOF.
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                Ok(accepted)
            }
        }
    }

    /// Pushes buffered TLS bytes (handshake or ciphertext) to the socket.
    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(_) => Ok(()),
            Transport::Tls { stream, session } => flush_session(session, stream),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls { session, .. } => session.wants_write(),
        }
    }

    pub fn close(&mut self, registry: &mio::Registry) {
        let stream = self.stream_mut();
        let _ = registry.deregister(stream);
        let _ = stream.shutdown(Shutdown::Both);
    }
}

fn flush_session(session: &mut TlsSession, stream: &mut TcpStream) -> io::Result<()> {
    while session.wants_write() {
        match session.write_tls(stream) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Blocking TCP connect plus TLS handshake. Runs on the event thread, never
/// on the IO loop: the handshake can stall on a slow peer.
pub(crate) fn connect_transport(
    endpoint: &Endpoint,
    tls: Option<&Arc<ClientConfig>>,
) -> io::Result<Transport> {
    let mut stream = StdTcpStream::connect((endpoint.host.as_str(), endpoint.port))?;
    stream.set_nodelay(true)?;

    let session = match tls {
        None => None,
        Some(config) => {
            let name = server_name(&endpoint.host)?;
            let client = ClientConnection::new(Arc::clone(config), name)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let mut session = TlsSession::from(client);
            handshake_blocking(&mut session, &mut stream)?;
            Some(session)
        }
    };

    stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(stream);
    Ok(match session {
        None => Transport::plain(stream),
        Some(session) => Transport::Tls { stream, session: Box::new(session) },
    })
}

fn handshake_blocking(session: &mut TlsSession, stream: &mut StdTcpStream) -> io::Result<()> {
    while session.is_handshaking() {
        if session.wants_write() {
            session.write_tls(stream)?;
        } else if session.wants_read() {
            if session.read_tls(stream)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            session
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }
    debug!(peer = %endpoint_label(stream), "tls handshake complete");
    Ok(())
}

fn endpoint_label(stream: &StdTcpStream) -> String {
    stream.peer_addr().map_or_else(|_| "unknown".to_string(), |addr| addr.to_string())
}

fn server_name(host: &str) -> io::Result<ServerName> {
    ServerName::try_from(host).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

pub(crate) fn resolve(endpoint: &Endpoint) -> io::Result<std::net::SocketAddr> {
    (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "endpoint did not resolve"))
}

/// The bus authenticates peers with the shared-secret token, not the
/// certificate chain, and deployments run on self-signed certs.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

pub(crate) fn client_tls_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config.dangerous().set_certificate_verifier(Arc::new(AcceptAnyServerCert));
    Arc::new(config)
}

/// Loads the certificate chain and private key from one PEM file.
pub(crate) fn server_tls_config(cert_path: &Path) -> io::Result<Arc<ServerConfig>> {
    let mut reader = BufReader::new(File::open(cert_path)?);
    let mut certs = Vec::new();
    let mut key = None;
    for item in rustls_pemfile::read_all(&mut reader)? {
        match item {
            rustls_pemfile::Item::X509Certificate(der) => certs.push(Certificate(der)),
            rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::ECKey(der) => {
                key.get_or_insert(PrivateKey(der));
            }
            _ => {}
        }
    }

    let key = key
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key in cert file"))?;
    if certs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no certificate in cert file"));
    }

    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map(Arc::new)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
