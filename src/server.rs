//! Server assembly and lifecycle.
//!
//! `Server::new` builds everything that can fail before traffic exists:
//! the canonical document root, the listening socket, the pollers and the
//! pre-allocated slot table. `run` spawns the sub-reactor and worker
//! threads, drives the acceptor on the calling thread, and tears the
//! whole set down once the signal funnel reports shutdown.

use crate::config::{Config, QueueKind};
use crate::pool::{ThreadPool, WorkQueue};
use crate::runtime::acceptor::Acceptor;
use crate::runtime::poller::Poller;
use crate::runtime::signal::{ShutdownHandle, SignalFunnel};
use crate::runtime::slots::SlotTable;
use crate::runtime::{sub_reactor, Shared};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::info;

pub struct Server {
    config: Config,
    shared: Arc<Shared>,
    listener: TcpListener,
    funnel: SignalFunnel,
}

impl Server {
    pub fn new(config: Config) -> Result<Server, ServerError> {
        let doc_root = config
            .doc_root
            .canonicalize()
            .map_err(|e| ServerError::DocRoot(config.doc_root.clone(), e))?;

        let listener =
            build_listener(&config.listen_intf, config.listen_port).map_err(ServerError::Bind)?;

        let mut pollers = Vec::with_capacity(config.sub_reactors);
        for _ in 0..config.sub_reactors {
            pollers.push(Poller::new().map_err(ServerError::Io)?);
        }

        let shared = Arc::new(Shared {
            slots: SlotTable::new(config.max_fds),
            pollers,
            doc_root,
            use_sendfile: config.use_sendfile,
            running: AtomicBool::new(true),
        });
        let funnel = SignalFunnel::new().map_err(ServerError::Io)?;

        Ok(Server {
            config,
            shared,
            listener,
            funnel,
        })
    }

    /// Address the listener actually bound (port 0 resolves here).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The funnel signal handlers should be wired into.
    pub fn funnel(&self) -> &SignalFunnel {
        &self.funnel
    }

    /// Handle that requests the same orderly shutdown a SIGTERM would.
    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        self.funnel.shutdown_handle()
    }

    /// Run until shutdown is requested through the funnel.
    pub fn run(self) -> Result<(), ServerError> {
        let Server {
            config,
            shared,
            listener,
            funnel,
        } = self;

        let queue = Arc::new(match config.queue {
            QueueKind::Shared => WorkQueue::shared(config.queue_depth),
            QueueKind::Spsc => WorkQueue::spsc(config.worker_threads, config.queue_depth),
        });
        let pool = ThreadPool::new(Arc::clone(&queue), Arc::clone(&shared), config.worker_threads)
            .map_err(ServerError::Thread)?;

        let mut reactors = Vec::with_capacity(config.sub_reactors);
        let mut wake_txs = Vec::with_capacity(config.sub_reactors);
        for id in 0..config.sub_reactors {
            let (tx, rx) = UnixStream::pair().map_err(ServerError::Io)?;
            rx.set_nonblocking(true).map_err(ServerError::Io)?;
            wake_txs.push(tx);

            let shared = Arc::clone(&shared);
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("reactor-{id}"))
                .spawn(move || sub_reactor::run(id, &shared, &queue, &rx))
                .map_err(ServerError::Thread)?;
            reactors.push(handle);
        }

        let mut acceptor = Acceptor::new(listener, funnel).map_err(ServerError::Io)?;
        info!(
            reactors = config.sub_reactors,
            workers = config.worker_threads,
            "Server running"
        );
        acceptor.run(&shared);

        // Orderly shutdown: park the reactors, then the workers.
        shared.running.store(false, Ordering::Release);
        for tx in &wake_txs {
            let _ = (&*tx).write(&[0u8]);
        }
        for handle in reactors {
            let _ = handle.join();
        }
        pool.shutdown();
        Ok(())
    }
}

/// Explicit listener construction: address reuse for fast restarts and
/// non-blocking accepts for the edge-triggered acceptor.
fn build_listener(intf: &str, port: u16) -> io::Result<TcpListener> {
    let ip: IpAddr = intf
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let addr = SocketAddr::new(ip, port);

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Startup failures; each exits the process with a non-zero status.
#[derive(Debug)]
pub enum ServerError {
    Bind(io::Error),
    Thread(io::Error),
    DocRoot(PathBuf, io::Error),
    Io(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "Failed to bind listener: {e}"),
            ServerError::Thread(e) => write!(f, "Failed to spawn thread: {e}"),
            ServerError::DocRoot(path, e) => {
                write!(f, "Document root '{}' is unusable: {e}", path.display())
            }
            ServerError::Io(e) => write!(f, "Server setup failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}
