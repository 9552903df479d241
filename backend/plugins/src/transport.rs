//! Listenable IPC endpoints.
//!
//! Endpoints are written as URIs: `unix:///tmp/tether-1234.sock` or
//! `tcp://127.0.0.1:5000`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use tether_core::{HostError, HostResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;
use uuid::Uuid;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One established connection, split into halves.
pub struct Connection {
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

impl Connection {
    fn from_tcp(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Cannot disable Nagle on plugin connection");
        }
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    #[cfg(unix)]
    fn from_unix(stream: tokio::net::UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// A fresh endpoint private to this process.
    pub fn generate() -> Self {
        if cfg!(unix) {
            let name = format!("tether-{}.sock", Uuid::new_v4().simple());
            Endpoint::Unix(std::env::temp_dir().join(name))
        } else {
            Endpoint::Tcp("127.0.0.1:0".to_string())
        }
    }

    pub fn uri(&self) -> String {
        self.to_string()
    }

    /// Start listening. A TCP port of 0 is resolved by the OS; ask the
    /// listener for the actual endpoint.
    pub async fn bind(&self) -> HostResult<Listener> {
        match self {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    debug!(socket = %path.display(), "Removing stale socket");
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        debug!(socket = %path.display(), error = %e, "Cannot remove stale socket");
                    }
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(unsupported()),
        }
    }

    pub async fn connect(&self) -> HostResult<Connection> {
        match self {
            Endpoint::Tcp(addr) => Ok(Connection::from_tcp(TcpStream::connect(addr.as_str()).await?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Connection::from_unix(
                tokio::net::UnixStream::connect(path).await?,
            )),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(unsupported()),
        }
    }
}

#[cfg(not(unix))]
fn unsupported() -> HostError {
    HostError::Transport(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix sockets are not available on this platform",
    ))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(HostError::Protocol(format!("empty socket path in '{s}'")));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            if !addr.contains(':') {
                return Err(HostError::Protocol(format!("missing port in '{s}'")));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        Err(HostError::Protocol(format!("unsupported endpoint '{s}'")))
    }
}

/// A bound endpoint accepting connections.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    /// The endpoint peers should connect to.
    pub fn local_endpoint(&self) -> HostResult<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::from_tcp(stream))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::from_unix(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        match self {
            Listener::Tcp(_) => {}
            #[cfg(unix)]
            Listener::Unix { path, .. } => {
                if let Err(e) = std::fs::remove_file(&*path) {
                    debug!(socket = %path.display(), error = %e, "Cannot remove socket file");
                }
            }
        }
    }
}
