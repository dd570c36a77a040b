//! Configuration module for the fileserv server.
//!
//! Resolves command-line arguments into the immutable `Config` consumed by
//! the server core. The bare positional forms `fileserv`, `fileserv <port>`
//! and `fileserv <ip> <port>` are accepted alongside the long options.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Command-line arguments for the file server
#[derive(Parser, Debug)]
#[command(name = "fileserv")]
#[command(version = "0.1.0")]
#[command(about = "An event-driven HTTP/1.x static file server", long_about = None)]
pub struct CliArgs {
    /// Listen port, or listen address when a second positional follows
    pub addr_or_port: Option<String>,

    /// Listen port (first positional is then the address)
    pub port: Option<String>,

    /// Directory all served files must resolve under
    #[arg(long, default_value = "/var/www/html")]
    pub doc_root: PathBuf,

    /// Number of worker reactors driving connection readiness
    #[arg(long)]
    pub sub_reactors: Option<usize>,

    /// Number of worker threads processing parsed requests
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Work queue variant
    #[arg(long, value_enum)]
    pub queue: Option<QueueKind>,

    /// Maximum number of requests the work queue will hold
    #[arg(long)]
    pub queue_depth: Option<usize>,

    /// Maximum number of simultaneously connected clients
    #[arg(long)]
    pub max_fds: Option<usize>,

    /// Stream file bodies with sendfile instead of mmap + writev
    #[arg(long)]
    pub sendfile: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Work queue implementation selected at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueKind {
    /// Single mutex-protected FIFO shared by all workers
    Shared,
    /// One lock-free single-producer/single-consumer ring per worker
    Spsc,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_intf: String,
    pub listen_port: u16,
    pub sub_reactors: usize,
    pub worker_threads: usize,
    pub use_sendfile: bool,
    pub doc_root: PathBuf,
    pub max_fds: usize,
    pub queue_depth: usize,
    pub queue: QueueKind,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_intf: "0.0.0.0".to_string(),
            listen_port: 1234,
            sub_reactors: 1,
            worker_threads: 1,
            use_sendfile: false,
            doc_root: PathBuf::from("/var/www/html"),
            max_fds: 65536,
            queue_depth: 1000,
            queue: QueueKind::Shared,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process command line.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed arguments into a validated configuration.
    ///
    /// The positional count decides how the positionals are read: one
    /// positional is a port, two are an address and a port. Counting
    /// happens before any value is parsed.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let (listen_intf, listen_port) = match (&cli.addr_or_port, &cli.port) {
            (None, _) => (defaults.listen_intf, defaults.listen_port),
            (Some(port), None) => (defaults.listen_intf, parse_port(port)?),
            (Some(addr), Some(port)) => (addr.clone(), parse_port(port)?),
        };

        let config = Config {
            listen_intf,
            listen_port,
            sub_reactors: cli.sub_reactors.unwrap_or(defaults.sub_reactors),
            worker_threads: cli.workers.unwrap_or(defaults.worker_threads),
            use_sendfile: cli.sendfile,
            doc_root: cli.doc_root,
            max_fds: cli.max_fds.unwrap_or(defaults.max_fds),
            queue_depth: cli.queue_depth.unwrap_or(defaults.queue_depth),
            queue: cli.queue.unwrap_or(defaults.queue),
            log_level: cli.log_level,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sub_reactors == 0 {
            return Err(ConfigError::InvalidValue("sub-reactors must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidValue("workers must be at least 1"));
        }
        if self.max_fds == 0 {
            return Err(ConfigError::InvalidValue("max-fds must be at least 1"));
        }
        // The SPSC rings admit exactly one producing reactor.
        if self.queue == QueueKind::Spsc && self.sub_reactors > 1 {
            return Err(ConfigError::InvalidValue(
                "the spsc queue supports a single sub-reactor",
            ));
        }
        Ok(())
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidPort(value.to_string()))
}

/// Configuration resolution errors
#[derive(Debug)]
pub enum ConfigError {
    InvalidPort(String),
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort(value) => {
                write!(f, "Invalid listen port '{value}'")
            }
            ConfigError::InvalidValue(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("fileserv").chain(argv.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = Config::from_args(args(&[])).unwrap();
        assert_eq!(config.listen_intf, "0.0.0.0");
        assert_eq!(config.listen_port, 1234);
        assert_eq!(config.sub_reactors, 1);
        assert_eq!(config.worker_threads, 1);
        assert!(!config.use_sendfile);
        assert_eq!(config.queue, QueueKind::Shared);
    }

    #[test]
    fn test_port_positional() {
        let config = Config::from_args(args(&["8080"])).unwrap();
        assert_eq!(config.listen_intf, "0.0.0.0");
        assert_eq!(config.listen_port, 8080);
    }

    #[test]
    fn test_addr_and_port_positionals() {
        let config = Config::from_args(args(&["127.0.0.1", "8080"])).unwrap();
        assert_eq!(config.listen_intf, "127.0.0.1");
        assert_eq!(config.listen_port, 8080);
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(Config::from_args(args(&["eighty"])).is_err());
        assert!(Config::from_args(args(&["70000"])).is_err());
    }

    #[test]
    fn test_spsc_requires_single_reactor() {
        let result = Config::from_args(args(&["--queue", "spsc", "--sub-reactors", "2"]));
        assert!(result.is_err());

        let config = Config::from_args(args(&["--queue", "spsc"])).unwrap();
        assert_eq!(config.queue, QueueKind::Spsc);
    }
}
