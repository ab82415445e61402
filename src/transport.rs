//! Loopback transports shared by the supervisor and the child runtime.
//!
//! Two transports exist: abstract unix domain sockets in a configurable
//! directory, and TCP bound to `127.0.0.1`. The host dials the address the
//! child advertises and writes the auth prologue before any RPC bytes; the
//! child binds with a bounded retry policy and advertises the first address
//! that listens.

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::time;

use crate::error::{PluginError, ServeError};
use crate::frame::randstr;

/// Port probing starts here; only unprivileged ports are used.
pub(crate) const TCP_PORT_FLOOR: u16 = 1024;
/// Consecutive ports probed before a tcp bind gives up.
pub(crate) const TCP_BIND_ATTEMPTS: usize = 500;
/// Random socket names tried before a unix bind gives up.
pub(crate) const UNIX_BIND_ATTEMPTS: usize = 4;
/// Length of a generated unix socket filename.
const UNIX_NAME_LEN: usize = 8;

/// Transport used between a host and one plugin subprocess.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    /// Unix domain socket in a temporary directory.
    Unix,
    /// TCP on `127.0.0.1`, unprivileged port.
    Tcp,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Unix => "unix",
            Proto::Tcp => "tcp",
        }
    }

    /// Lenient parse for the child's `-pingo:proto=` flag: anything that is
    /// not `tcp` selects the unix transport, matching the flag's default.
    pub(crate) fn from_flag(s: &str) -> Self {
        match s {
            "tcp" => Proto::Tcp,
            _ => Proto::Unix,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strict parse used on the host side of the handshake.
#[derive(Debug, Error)]
#[error("unknown protocol (use \"unix\" or \"tcp\")")]
pub struct ParseProtoError;

impl FromStr for Proto {
    type Err = ParseProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(Proto::Unix),
            "tcp" => Ok(Proto::Tcp),
            _ => Err(ParseProtoError),
        }
    }
}

/// Byte stream of either transport, type-erased once established.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub(crate) type BoxedStream = Box<dyn Stream>;

async fn dial(proto: Proto, addr: &str, timeout: Duration) -> Result<BoxedStream, PluginError> {
    let connect = async {
        Ok::<BoxedStream, io::Error>(match proto {
            Proto::Tcp => Box::new(TcpStream::connect(addr).await?),
            Proto::Unix => Box::new(UnixStream::connect(addr).await?),
        })
    };

    match time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(PluginError::ConnectionFailed {
            detail: e.to_string(),
        }),
        Err(_) => Err(PluginError::ConnectionFailed {
            detail: format!("dial {proto} {addr}: timed out"),
        }),
    }
}

/// Dials the advertised endpoint and writes the auth prologue.
///
/// The prologue `Auth-Token: <secret>\n\n` must reach the child before any
/// RPC bytes; the child reads it as a header block and silently drops the
/// connection on mismatch.
pub(crate) async fn dial_auth(
    proto: Proto,
    addr: &str,
    secret: &str,
    timeout: Duration,
) -> Result<BoxedStream, PluginError> {
    let mut stream = dial(proto, addr, timeout).await?;

    stream
        .write_all(format!("Auth-Token: {secret}\n\n").as_bytes())
        .await
        .map_err(|e| PluginError::ConnectionFailed {
            detail: format!("auth prologue: {e}"),
        })?;

    Ok(stream)
}

/// Listener of either transport, child side.
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub(crate) async fn accept(&self) -> io::Result<BoxedStream> {
        Ok(match self {
            Listener::Tcp(l) => Box::new(l.accept().await?.0),
            Listener::Unix(l) => Box::new(l.accept().await?.0),
        })
    }
}

/// Binds a listener under the retry policy and returns it with the address
/// to advertise.
///
/// TCP probes consecutive ports upward from [`TCP_PORT_FLOOR`]; a collided
/// port is never retried. Unix re-randomizes the socket name on every
/// attempt. The retry bound is the safety valve.
pub(crate) async fn bind(proto: Proto, unix_dir: &Path) -> Result<(Listener, String), ServeError> {
    match proto {
        Proto::Tcp => {
            let mut port = TCP_PORT_FLOOR;
            for _ in 0..TCP_BIND_ATTEMPTS {
                let addr = format!("127.0.0.1:{port}");
                if let Ok(l) = TcpListener::bind(&addr).await {
                    return Ok((Listener::Tcp(l), addr));
                }
                port += 1;
            }
            Err(ServeError::Bind {
                proto,
                attempts: TCP_BIND_ATTEMPTS,
            })
        }
        Proto::Unix => {
            for _ in 0..UNIX_BIND_ATTEMPTS {
                let path = unix_dir.join(randstr(UNIX_NAME_LEN));
                if let Ok(l) = UnixListener::bind(&path) {
                    return Ok((Listener::Unix(l), path.display().to_string()));
                }
            }
            Err(ServeError::Bind {
                proto,
                attempts: UNIX_BIND_ATTEMPTS,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_strings() {
        assert_eq!(Proto::Unix.to_string(), "unix");
        assert_eq!(Proto::Tcp.to_string(), "tcp");
        assert_eq!("unix".parse::<Proto>().unwrap(), Proto::Unix);
        assert_eq!("tcp".parse::<Proto>().unwrap(), Proto::Tcp);
        assert!("sctp".parse::<Proto>().is_err());
    }

    #[test]
    fn flag_parse_defaults_to_unix() {
        assert_eq!(Proto::from_flag("tcp"), Proto::Tcp);
        assert_eq!(Proto::from_flag("unix"), Proto::Unix);
        assert_eq!(Proto::from_flag("bogus"), Proto::Unix);
    }

    #[tokio::test]
    async fn bind_unix_uses_random_name_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (_listener, addr) = bind(Proto::Unix, dir.path()).await.unwrap();

        let path = Path::new(&addr);
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.file_name().unwrap().len(), 8);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn bind_tcp_is_loopback_unprivileged() {
        let dir = std::env::temp_dir();
        let (_listener, addr) = bind(Proto::Tcp, &dir).await.unwrap();

        let (host, port) = addr.split_once(':').unwrap();
        assert_eq!(host, "127.0.0.1");
        assert!(port.parse::<u16>().unwrap() >= TCP_PORT_FLOOR);
    }

    #[tokio::test]
    async fn dial_auth_writes_prologue() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, addr) = bind(Proto::Unix, dir.path()).await.unwrap();

        let dialer = tokio::spawn(async move {
            dial_auth(Proto::Unix, &addr, "s3cret", Duration::from_secs(1)).await
        });

        let mut conn = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut conn, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Auth-Token: s3cret\n\n");
        assert!(dialer.await.unwrap().is_ok());
    }
}
