//! fileserv: an event-driven HTTP/1.x static file server
//!
//! The server runs a small fixed set of threads:
//! - one acceptor reactor distributing new sockets round-robin,
//! - N worker reactors driving edge-triggered one-shot readiness,
//! - M pool workers parsing requests and building responses.
//!
//! Files are served from a fixed document root via mmap + writev
//! (or sendfile when enabled).

mod config;
mod http;
mod pool;
mod runtime;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %format!("{}:{}", config.listen_intf, config.listen_port),
        doc_root = %config.doc_root.display(),
        sub_reactors = config.sub_reactors,
        workers = config.worker_threads,
        "Starting fileserv"
    );

    // Create the server, then route SIGINT/SIGTERM through its funnel and
    // ignore SIGPIPE before any connection traffic exists.
    let server = Server::new(config)?;
    runtime::signal::install_handlers(server.funnel())?;

    server.run()?;

    info!("Shutdown complete");
    Ok(())
}
