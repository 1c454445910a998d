//! The connection's byte stream: plain TCP/UNIX, optionally upgraded to TLS.
//!
//! Address selection follows libpq's rules, and connect/TLS-upgrade are
//! kept as two explicit steps rather than folded into the connection
//! driver, since the state machine needs to inspect and react between them.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};

use crate::error::{Error, Result};
use crate::uri::ConnectionUri;

const DEFAULT_UNIX_SOCKET_DIR: &str = "/var/run/postgresql";

/// Where to dial, derived from libpq's address-selection rules: empty host
/// means the default UNIX socket directory, a path-like host means a UNIX
/// socket directory, anything else is a TCP host.
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix { socket_path: String },
}

impl Address {
    pub fn resolve(uri: &ConnectionUri) -> Self {
        if uri.host.is_empty() {
            Address::Unix {
                socket_path: format!("{DEFAULT_UNIX_SOCKET_DIR}/.s.PGSQL.{}", uri.port),
            }
        } else if uri.host.starts_with('/') || uri.host.starts_with('@') {
            Address::Unix {
                socket_path: format!("{}/.s.PGSQL.{}", uri.host, uri.port),
            }
        } else {
            Address::Tcp {
                host: uri.host.clone(),
                port: uri.port,
            }
        }
    }
}

/// The connection's underlying byte stream.
pub enum Transport {
    Tcp(BufReader<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(BufReader<tokio_native_tls::TlsStream<TcpStream>>),
    Unix(BufReader<UnixStream>),
    /// An in-memory duplex pipe, standing in for a live socket so bring-up
    /// and dispatch can be driven against a scripted fake server in tests.
    #[cfg(test)]
    Test(BufReader<tokio::io::DuplexStream>),
}

impl Transport {
    /// Dial the address implied by `uri`.
    pub async fn connect(uri: &ConnectionUri) -> Result<Self> {
        match Address::resolve(uri) {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(Error::ConnectFailed)?;
                Ok(Transport::Tcp(BufReader::new(stream)))
            }
            Address::Unix { socket_path } => {
                let stream = UnixStream::connect(&socket_path)
                    .await
                    .map_err(Error::ConnectFailed)?;
                Ok(Transport::Unix(BufReader::new(stream)))
            }
        }
    }

    /// Upgrade a plaintext TCP stream to TLS. Fails if this transport isn't
    /// a freshly-connected TCP stream (UNIX sockets and already-TLS streams
    /// never reach here per the Connection State Machine).
    #[cfg(feature = "tls")]
    pub async fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        let Transport::Tcp(reader) = self else {
            return Err(Error::Protocol(
                "TLS upgrade attempted on a non-TCP or already-upgraded transport".into(),
            ));
        };
        let tcp = reader.into_inner();
        let connector = native_tls::TlsConnector::new().map_err(Error::Tls)?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls_stream = connector
            .connect(host, tcp)
            .await
            .map_err(|e| Error::Tls(native_tls::Error::from(e)))?;
        Ok(Transport::Tls(BufReader::new(tls_stream)))
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        match self {
            Transport::Tcp(s) => s.read_exact(&mut byte).await.map_err(Error::Io)?,
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.read_exact(&mut byte).await.map_err(Error::Io)?,
            Transport::Unix(s) => s.read_exact(&mut byte).await.map_err(Error::Io)?,
            #[cfg(test)]
            Transport::Test(s) => s.read_exact(&mut byte).await.map_err(Error::Io)?,
        };
        Ok(byte[0])
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            Transport::Tcp(s) => s.read_exact(buf).await,
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.read_exact(buf).await,
            Transport::Unix(s) => s.read_exact(buf).await,
            #[cfg(test)]
            Transport::Test(s) => s.read_exact(buf).await,
        }
        .map_err(Error::Io)?;
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(s) => s.write_all(buf).await,
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.write_all(buf).await,
            Transport::Unix(s) => s.write_all(buf).await,
            #[cfg(test)]
            Transport::Test(s) => s.write_all(buf).await,
        }
        .map_err(Error::Io)?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(s) => s.flush().await,
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.flush().await,
            Transport::Unix(s) => s.flush().await,
            #[cfg(test)]
            Transport::Test(s) => s.flush().await,
        }
        .map_err(Error::Io)?;
        Ok(())
    }

    /// Read one message frame (type byte + 4-byte big-endian length + payload)
    /// into `buffer_set`'s read buffer.
    pub async fn read_message(&mut self, buffer_set: &mut crate::BufferSet) -> Result<()> {
        buffer_set.type_byte = self.read_u8().await?;
        let mut len_bytes = [0u8; 4];
        self.read_exact(&mut len_bytes).await?;
        let len = i32::from_be_bytes(len_bytes);
        if len < 4 {
            return Err(Error::Protocol(format!("invalid message length {len}")));
        }
        let payload_len = (len - 4) as usize;
        buffer_set.read_buffer.resize(payload_len, 0);
        self.read_exact(&mut buffer_set.read_buffer).await?;
        Ok(())
    }
}

#[cfg(test)]
impl Transport {
    /// Build a transport over an in-memory duplex pipe and hand back the
    /// other end, so a test can play a scripted fake server against
    /// `bring_up`/`run_query` without a live socket.
    pub fn test_pair() -> (Self, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (Transport::Test(BufReader::new(client)), server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::ConnectionUri;

    #[test]
    fn empty_host_resolves_to_default_unix_socket() {
        let mut uri = ConnectionUri::default();
        uri.host = String::new();
        uri.port = 5432;
        match Address::resolve(&uri) {
            Address::Unix { socket_path } => {
                assert_eq!(socket_path, "/var/run/postgresql/.s.PGSQL.5432");
            }
            Address::Tcp { .. } => panic!("expected unix socket"),
        }
    }

    #[test]
    fn path_like_host_resolves_to_unix_socket_dir() {
        let mut uri = ConnectionUri::default();
        uri.host = "/tmp/sockets".to_string();
        uri.port = 5433;
        match Address::resolve(&uri) {
            Address::Unix { socket_path } => assert_eq!(socket_path, "/tmp/sockets/.s.PGSQL.5433"),
            Address::Tcp { .. } => panic!("expected unix socket"),
        }
    }

    #[test]
    fn regular_host_resolves_to_tcp() {
        let mut uri = ConnectionUri::default();
        uri.host = "db.example.com".to_string();
        uri.port = 5432;
        match Address::resolve(&uri) {
            Address::Tcp { host, port } => {
                assert_eq!(host, "db.example.com");
                assert_eq!(port, 5432);
            }
            Address::Unix { .. } => panic!("expected tcp"),
        }
    }
}
