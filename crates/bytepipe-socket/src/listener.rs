use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use bytepipe_transport::{SocketStream, TransportError};
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::socket::FramedSocket;

/// Accepts connections and hands them out as [`FramedSocket`]s.
///
/// The listening socket itself stays blocking: [`FramedListener::accept`]
/// waits for the next client.
#[derive(Debug)]
pub struct FramedListener {
    inner: ListenerInner,
}

#[derive(Debug)]
enum ListenerInner {
    Tcp(TcpListener),
    Unix {
        listener: UnixListener,
        path: PathBuf,
        // (dev, ino) of the socket file we created
        created: (u64, u64),
    },
}

impl FramedListener {
    /// Listen on a TCP address.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        let label = format!("{addr:?}");
        let listener = TcpListener::bind(addr).map_err(|source| TransportError::Bind {
            addr: label.clone(),
            source,
        })?;
        info!(addr = %label, "listening on tcp");
        Ok(Self {
            inner: ListenerInner::Tcp(listener),
        })
    }

    /// Listen on a Unix domain socket path.
    ///
    /// A stale socket file at `path` is replaced; any other kind of file is
    /// left alone and reported as an error. The socket file is removed again
    /// when the listener is dropped.
    pub fn bind_unix(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bind_error = |source: std::io::Error| TransportError::Bind {
            addr: path.display().to_string(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_error(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                ))
                .into());
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_error)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_error)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_error)?;
        info!(?path, "listening on unix domain socket");
        Ok(Self {
            inner: ListenerInner::Unix {
                listener,
                path,
                created: (metadata.dev(), metadata.ino()),
            },
        })
    }

    /// Listen on either kind of [`Endpoint`].
    pub fn bind_endpoint(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Self::bind(addr.as_str()),
            Endpoint::Unix(path) => Self::bind_unix(path),
        }
    }

    /// Wait for the next connection.
    pub fn accept(&self) -> Result<FramedSocket> {
        let stream: SocketStream = match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, peer) = listener.accept().map_err(TransportError::Accept)?;
                debug!(%peer, "accepted tcp connection");
                stream.into()
            }
            ListenerInner::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!("accepted unix connection");
                stream.into()
            }
        };
        FramedSocket::from_stream(stream)
    }

    /// Bound TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            ListenerInner::Tcp(listener) => listener.local_addr().ok(),
            ListenerInner::Unix { .. } => None,
        }
    }

    /// The address clients should connect to.
    pub fn endpoint(&self) -> Option<Endpoint> {
        match &self.inner {
            ListenerInner::Tcp(listener) => listener
                .local_addr()
                .ok()
                .map(|addr| Endpoint::Tcp(addr.to_string())),
            ListenerInner::Unix { path, .. } => Some(Endpoint::Unix(path.clone())),
        }
    }
}

impl Drop for FramedListener {
    fn drop(&mut self) {
        let ListenerInner::Unix { path, created, .. } = &self.inner else {
            return;
        };
        match std::fs::symlink_metadata(path) {
            Ok(metadata)
                if metadata.file_type().is_socket()
                    && (metadata.dev(), metadata.ino()) == *created =>
            {
                debug!(?path, "cleaning up socket file");
                let _ = std::fs::remove_file(path);
            }
            _ => debug!(?path, "socket path identity changed; skipping cleanup"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_socket(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bytepipe-{name}-{}.sock", std::process::id()))
    }

    #[test]
    fn tcp_accept_and_exchange() {
        let listener = FramedListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            let mut socket = FramedSocket::connect(addr).unwrap();
            socket.send_message(b"hello").unwrap();
            socket.receive_message(None).unwrap()
        });

        let mut server = listener.accept().unwrap();
        let got = server.receive_message(None).unwrap().unwrap();
        assert_eq!(got.as_ref(), b"hello");
        server.send_message(b"world").unwrap();

        let reply = client.join().unwrap().unwrap();
        assert_eq!(reply.as_ref(), b"world");
    }

    #[test]
    fn unix_listener_replaces_stale_socket_and_cleans_up() {
        let path = temp_socket("listener");
        drop(UnixListener::bind(&path));
        assert!(path.exists());

        let listener = FramedListener::bind_unix(&path).unwrap();
        assert_eq!(listener.endpoint(), Some(Endpoint::Unix(path.clone())));
        assert!(listener.local_addr().is_none());

        let client = std::thread::spawn({
            let path = path.clone();
            move || {
                let mut socket = FramedSocket::connect_unix(path).unwrap();
                socket.send_message(b"over uds").unwrap();
            }
        });
        let mut server = listener.accept().unwrap();
        assert_eq!(
            server.receive_message(None).unwrap().unwrap().as_ref(),
            b"over uds"
        );
        client.join().unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn unix_listener_refuses_regular_file() {
        let path = temp_socket("regular");
        std::fs::write(&path, b"not a socket").unwrap();
        let err = FramedListener::bind_unix(&path).unwrap_err();
        assert!(matches!(
            err,
            crate::SocketError::Transport(TransportError::Bind { .. })
        ));
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }
}
