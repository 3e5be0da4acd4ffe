//! Stream I/O for a session: line-buffered reads, bounded writes and the
//! STARTTLS upgrade.

use std::{
    fmt::Write as _,
    fs::File,
    io::{self, BufReader},
    path::Path,
    sync::Arc,
};

use arrayvec::ArrayString;
use smtpd_common::config::TlsConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ServerConfig, ServerConnection,
    },
    server::TlsStream,
    TlsAcceptor,
};

use crate::{error::TlsError, SMTP_LINE_MAX};

/// Negotiated TLS parameters, kept for the `Received:` trailer.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    version: String,
    cipher: String,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Result<Self, TlsError> {
        let version = conn
            .protocol_version()
            .ok_or(TlsError::ProtocolInfoMissing("protocol version"))?;
        let suite = conn
            .negotiated_cipher_suite()
            .ok_or(TlsError::ProtocolInfoMissing("cipher suite"))?;

        Ok(Self {
            version: version.as_str().unwrap_or("unknown").to_string(),
            cipher: suite.suite().as_str().unwrap_or("unknown").to_string(),
        })
    }

    #[must_use]
    pub fn proto(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn cipher(&self) -> &str {
        &self.cipher
    }

    /// Symmetric key size implied by the suite name.
    #[must_use]
    pub fn bits(&self) -> u32 {
        if self.cipher.contains("256") {
            256
        } else if self.cipher.contains("128") {
            128
        } else {
            0
        }
    }
}

/// Outcome of one line read.
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line, CRLF stripped.
    Line(Vec<u8>),
    /// The line (or the unterminated buffer) reached the line maximum.
    TooLong,
    /// Peer closed the connection.
    Closed,
}

enum StreamKind<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Placeholder while a handshake is in flight; reads and writes fail.
    Poisoned,
}

/// A session's transport: the socket (plain or TLS) plus the inbound line
/// buffer. Bytes left in the buffer after a line is taken are visible
/// through [`Connection::buffered`], which is how pipelining is detected.
pub struct Connection<Stream> {
    stream: StreamKind<Stream>,
    buf: Vec<u8>,
    tls_info: Option<TlsInfo>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream: StreamKind::Plain(stream),
            buf: Vec::new(),
            tls_info: None,
        }
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self.stream, StreamKind::Tls(_))
    }

    #[must_use]
    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls_info.as_ref()
    }

    /// Bytes received but not yet consumed as a line.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = match &mut self.stream {
            StreamKind::Plain(stream) => stream.read(&mut chunk).await?,
            StreamKind::Tls(stream) => stream.read(&mut chunk).await?,
            StreamKind::Poisoned => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection poisoned by failed handshake",
                ))
            }
        };
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read one `\n`-terminated line, stripping the terminator and an
    /// optional preceding `\r`. A line of `max` bytes or more, terminated
    /// or not, is [`LineRead::TooLong`].
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn line(&mut self, max: usize) -> io::Result<LineRead> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() >= max {
                    return Ok(LineRead::TooLong);
                }
                return Ok(LineRead::Line(line));
            }

            if self.buf.len() >= max {
                return Ok(LineRead::TooLong);
            }
            if self.fill().await? == 0 {
                return Ok(LineRead::Closed);
            }
        }
    }

    /// Write one reply line, CRLF-terminated, through a stack buffer.
    ///
    /// # Errors
    ///
    /// Fails if the line overflows the wire limit or the transport errors.
    pub async fn send(&mut self, line: &str) -> io::Result<usize> {
        let mut buffer = ArrayString::<{ SMTP_LINE_MAX + 2 }>::new();
        write!(&mut buffer, "{line}\r\n").map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "reply exceeds the line limit")
        })?;

        match &mut self.stream {
            StreamKind::Plain(stream) => {
                stream.write_all(buffer.as_bytes()).await?;
                stream.flush().await?;
            }
            StreamKind::Tls(stream) => {
                stream.write_all(buffer.as_bytes()).await?;
                stream.flush().await?;
            }
            StreamKind::Poisoned => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection poisoned by failed handshake",
                ))
            }
        }

        Ok(buffer.len())
    }

    /// Run the server side of a TLS handshake over the plain stream.
    ///
    /// # Errors
    ///
    /// Fails when the channel is already secured or the handshake itself
    /// fails; a failed handshake leaves the connection unusable.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> Result<&TlsInfo, TlsError> {
        match std::mem::replace(&mut self.stream, StreamKind::Poisoned) {
            StreamKind::Plain(stream) => {
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1)?;
                self.stream = StreamKind::Tls(Box::new(stream));
                Ok(&*self.tls_info.insert(info))
            }
            other => {
                self.stream = other;
                Err(TlsError::AlreadySecured)
            }
        }
    }
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
}

fn load_keys(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let path_str = path.display().to_string();
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path_str,
            reason: "unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                .to_string(),
        }),
    }
}

/// Build a listener's TLS acceptor from its certificate and key files.
///
/// # Errors
///
/// Returns a [`TlsError`] when the material cannot be loaded or rustls
/// refuses it.
pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&config.certificate).map_err(|e| TlsError::CertificateLoad {
        path: config.certificate.display().to_string(),
        source: e,
    })?;
    let key = load_keys(&config.key)?;

    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(server)))
}
