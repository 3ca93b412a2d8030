//! Transport boundary.
//!
//! The relay core only needs an ordered, bidirectional byte stream per client
//! and a listener that hands those streams out. TCP and Unix domain sockets
//! are provided; tests plug in in-memory streams.

use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Prefix selecting a Unix domain socket endpoint.
const UNIX_PREFIX: &str = "unix:";

/// Any stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn Transport>;

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(UNIX_PREFIX) {
            Some(path) => Ok(Endpoint::Unix(PathBuf::from(path))),
            None => s.parse().map(Endpoint::Tcp),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{addr}"),
            Endpoint::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

/// Remote side of an accepted connection, for logging and identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
    Unknown,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{addr}"),
            PeerAddr::Unix => f.write_str("unix"),
            PeerAddr::Unknown => f.write_str("unknown"),
        }
    }
}

/// Source of new connections.
///
/// Closing is dropping: the acceptor releases its listener when it stops.
pub trait Listener: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<(BoxedStream, PeerAddr)>> + Send;
}

impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, PeerAddr)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok((Box::new(stream), PeerAddr::Tcp(addr)))
    }
}

#[cfg(unix)]
impl Listener for UnixListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, PeerAddr)> {
        let (stream, _addr) = UnixListener::accept(self).await?;
        Ok((Box::new(stream), PeerAddr::Unix))
    }
}

/// A listener bound to a configured endpoint.
pub enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl BoundListener {
    /// Address actually bound (resolves port 0).
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            BoundListener::Tcp(listener) => listener.local_addr().map(Endpoint::Tcp),
            #[cfg(unix)]
            BoundListener::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().map(PathBuf::from).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "unnamed unix socket")
                })?;
                Ok(Endpoint::Unix(path))
            }
        }
    }
}

impl Listener for BoundListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, PeerAddr)> {
        match self {
            BoundListener::Tcp(listener) => Listener::accept(listener).await,
            #[cfg(unix)]
            BoundListener::Unix(listener) => Listener::accept(listener).await,
        }
    }
}

/// Bind a listener for `endpoint`. Must be called inside a tokio runtime.
pub fn bind(endpoint: &Endpoint, backlog: u32) -> io::Result<BoundListener> {
    match endpoint {
        Endpoint::Tcp(addr) => bind_tcp(*addr, backlog).map(BoundListener::Tcp),
        #[cfg(unix)]
        Endpoint::Unix(path) => UnixListener::bind(path).map(BoundListener::Unix),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
    }
}

/// Create a TCP listener with SO_REUSEADDR and an explicit backlog.
fn bind_tcp(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

/// Open a client stream to `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> io::Result<BoxedStream> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            "127.0.0.1:9000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(
            "unix:/tmp/relay.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/relay.sock"))
        );
        assert!("localhost".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let ep: Endpoint = "unix:/tmp/relay.sock".parse().unwrap();
        assert_eq!(ep.to_string(), "unix:/tmp/relay.sock");
        let ep: Endpoint = "[::1]:80".parse().unwrap();
        assert_eq!(ep.to_string(), "[::1]:80");
    }

    #[tokio::test]
    async fn test_bind_tcp_port_zero() {
        let mut listener = bind(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let local = listener.local_endpoint().unwrap();
        let Endpoint::Tcp(addr) = local.clone() else {
            panic!("expected tcp endpoint, got {local:?}");
        };
        assert_ne!(addr.port(), 0);

        let mut client = connect(&local).await.unwrap();
        let (mut server_side, peer) = listener.accept().await.unwrap();
        assert!(matches!(peer, PeerAddr::Tcp(_)));

        client.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");
    }
}
