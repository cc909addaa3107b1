//! The shared listening socket.
//!
//! [`ListenerFacade`] binds a TCP address or a Unix socket path, reports the
//! outcome to the router exactly once and then feeds every accepted
//! connection into [`RouterHandle::distribute`]. Accept errors produce no
//! connection and are dropped. The router stops the facade through
//! [`ListenerControl::stop`] once its last worker leaves.

use crate::{
    channel::WorkerChannel,
    error::BindError,
    handle::Connection,
    router::RouterHandle,
};
use core::fmt;
use futures::{Stream, StreamExt};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, OnceLock},
};
#[cfg(unix)]
use std::path::PathBuf;
use tokio::{
    net::{TcpListener, TcpSocket},
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

/// The router's view of the listener.
pub trait ListenerControl: Send + 'static {
    /// Address the listener is bound to. `None` for path based listeners or
    /// before bind completed.
    fn local_address(&self) -> Option<SocketAddr>;

    /// Stops accepting and releases the listening socket.
    fn stop(&mut self);
}

/// Where the shared listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    /// `host:port`, resolved at bind time. The first address that binds wins.
    Tcp(String),
    /// Filesystem path of a Unix domain socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl BindTarget {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::Tcp(addr.into())
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Socket options applied at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindOptions {
    /// Maximum length of the kernel's pending connection queue (TCP only).
    pub backlog: u32,
    /// Make a Unix socket readable by all users.
    pub readable_all: bool,
    /// Make a Unix socket writable by all users.
    pub writable_all: bool,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            backlog: 511,
            readable_all: false,
            writable_all: false,
        }
    }
}

struct Inner {
    target: BindTarget,
    options: BindOptions,
    token: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

/// Owner of the shared listening socket.
///
/// Cloning is cheap; every clone controls the same socket. Hand one clone to
/// [`spawn_router`](crate::spawn_router) and call [`ListenerFacade::start`] on
/// another.
#[derive(Clone)]
pub struct ListenerFacade {
    inner: Arc<Inner>,
}

impl ListenerFacade {
    pub fn new(target: BindTarget, options: BindOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                options,
                token: CancellationToken::new(),
                local_addr: OnceLock::new(),
            }),
        }
    }

    pub fn target(&self) -> &BindTarget {
        &self.inner.target
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Binds in the background, reports readiness to `router`, then accepts
    /// until stopped. The returned task ends once the socket is released.
    pub fn start<C>(&self, router: RouterHandle<Connection, C>) -> JoinHandle<()>
    where
        C: WorkerChannel<Connection>,
    {
        let facade = self.clone();
        tokio::spawn(async move { facade.run(router).await })
    }

    async fn run<C>(self, router: RouterHandle<Connection, C>)
    where
        C: WorkerChannel<Connection>,
    {
        match self.inner.target.clone() {
            BindTarget::Tcp(addr) => match self.bind_tcp(&addr).await {
                Ok(listener) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Listening on {:?}", self.local_addr());

                    if router.listening(Ok(())).await.is_ok() {
                        self.accept_loop(TcpListenerStream::new(listener), &router, |stream| {
                            Connection::Tcp(stream)
                        })
                        .await;
                    }
                }
                Err(err) => {
                    let _ = router.listening(Err(BindError::new(addr, &err))).await;
                }
            },
            #[cfg(unix)]
            BindTarget::Unix(path) => match self.bind_unix(&path) {
                Ok(listener) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Listening on {}", path.display());

                    if router.listening(Ok(())).await.is_ok() {
                        let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
                        self.accept_loop(incoming, &router, Connection::Unix).await;
                    }
                    // Best effort: a crash between bind and here leaves the
                    // socket file behind.
                    let _ = std::fs::remove_file(&path);
                }
                Err(err) => {
                    let _ = router
                        .listening(Err(BindError::new(path.display().to_string(), &err)))
                        .await;
                }
            },
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Listener on {} released", self.inner.target);
    }

    async fn accept_loop<S, T, C>(
        &self,
        mut incoming: S,
        router: &RouterHandle<Connection, C>,
        wrap: impl Fn(T) -> Connection,
    ) where
        S: Stream<Item = io::Result<T>> + Unpin,
        C: WorkerChannel<Connection>,
    {
        loop {
            let next = tokio::select! {
                () = self.inner.token.cancelled() => break,
                next = incoming.next() => next,
            };

            match next {
                Some(Ok(stream)) => {
                    if router.distribute(wrap(stream)).await.is_err() {
                        break;
                    }
                }
                Some(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Accept failed: {_e}");
                }
                None => break,
            }
        }
    }

    async fn bind_tcp(&self, addr: &str) -> io::Result<TcpListener> {
        let mut last_err = None;
        for candidate in tokio::net::lookup_host(addr).await? {
            match self.bind_tcp_addr(candidate) {
                Ok(listener) => {
                    let _ = self.inner.local_addr.set(listener.local_addr()?);
                    return Ok(listener);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{addr} did not resolve to any address"),
            )
        }))
    }

    fn bind_tcp_addr(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(self.inner.options.backlog)
    }

    #[cfg(unix)]
    fn bind_unix(&self, path: &std::path::Path) -> io::Result<tokio::net::UnixListener> {
        use std::os::unix::fs::PermissionsExt;

        let listener = tokio::net::UnixListener::bind(path)?;

        let BindOptions {
            readable_all,
            writable_all,
            ..
        } = self.inner.options;
        if readable_all || writable_all {
            let mut mode = std::fs::metadata(path)?.permissions().mode();
            if readable_all {
                mode |= 0o444;
            }
            if writable_all {
                mode |= 0o222;
            }
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        Ok(listener)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }
}

impl ListenerControl for ListenerFacade {
    fn local_address(&self) -> Option<SocketAddr> {
        self.local_addr()
    }

    fn stop(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Stopping listener on {}", self.inner.target);

        self.inner.token.cancel();
    }
}

impl fmt::Debug for ListenerFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerFacade")
            .field("target", &self.inner.target)
            .field("options", &self.inner.options)
            .field("local_addr", &self.local_addr())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
