use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use turnstile::{BindOptions, BindTarget};

/// Runtime configuration for the `turnstile-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first), with defaults suitable for a single host.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "turnstile-server",
    version,
    about = "An echo server whose workers share one listening socket"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:8080" or "/tmp/turnstile.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Maximum length of the kernel's queue of not yet accepted connections.
    ///
    /// Environment variable: `BACKLOG`
    #[arg(long, env = "BACKLOG", default_value_t = 511)]
    pub backlog: u32,

    /// Number of workers sharing the listener. Defaults to the CPU count.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Connections a single worker serves at once.
    ///
    /// A worker at its limit leaves the next offer unanswered until a slot
    /// frees up, so new connections flow to workers with spare capacity.
    ///
    /// Environment variable: `MAX_CONNECTIONS_PER_WORKER`
    #[arg(long, env = "MAX_CONNECTIONS_PER_WORKER", default_value_t = 1024)]
    pub max_connections_per_worker: usize,

    /// Capacity of the router's command mailbox.
    ///
    /// The accept loop waits when the mailbox is full.
    ///
    /// Environment variable: `ROUTER_MAILBOX_SIZE`
    #[arg(long, env = "ROUTER_MAILBOX_SIZE", default_value_t = 1024)]
    pub router_mailbox_size: usize,

    /// Seconds each worker waits for its open connections on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Make the Unix socket readable by all users.
    #[arg(long, default_value_t = false)]
    pub readable_all: bool,

    /// Make the Unix socket writable by all users.
    #[arg(long, default_value_t = false)]
    pub writable_all: bool,

    /// Greet every connection with the id of the worker serving it.
    #[arg(long, env = "ANNOUNCE", default_value_t = false)]
    pub announce: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub backlog: u32,
    pub num_workers: usize,
    pub max_connections_per_worker: usize,
    pub router_mailbox_size: usize,
    pub shutdown_timeout: Duration,
    pub readable_all: bool,
    pub writable_all: bool,
    pub announce: bool,
}

impl ServerConfig {
    pub fn bind_target(&self) -> anyhow::Result<BindTarget> {
        if !self.uds {
            return Ok(BindTarget::tcp(self.server_addr.clone()));
        }

        #[cfg(unix)]
        {
            Ok(BindTarget::unix(self.server_addr.clone()))
        }
        #[cfg(not(unix))]
        {
            bail!("Unix domain sockets are not supported on this platform");
        }
    }

    pub const fn bind_options(&self) -> BindOptions {
        BindOptions {
            backlog: self.backlog,
            readable_all: self.readable_all,
            writable_all: self.writable_all,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let num_workers = args.num_workers.unwrap_or_else(num_cpus::get);

        if num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.max_connections_per_worker == 0 {
            bail!("MAX_CONNECTIONS_PER_WORKER must be greater than 0");
        }

        if args.router_mailbox_size == 0 {
            bail!("ROUTER_MAILBOX_SIZE must be greater than 0");
        }

        if args.backlog == 0 {
            bail!("BACKLOG must be greater than 0");
        }

        if !args.uds && (args.readable_all || args.writable_all) {
            bail!("--readable-all and --writable-all only apply to Unix sockets (--uds)");
        }

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            backlog: args.backlog,
            num_workers,
            max_connections_per_worker: args.max_connections_per_worker,
            router_mailbox_size: args.router_mailbox_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            readable_all: args.readable_all,
            writable_all: args.writable_all,
            announce: args.announce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let args = CliArgs::try_parse_from(
            core::iter::once("turnstile-server").chain(args.iter().copied()),
        )?;
        ServerConfig::try_from(args)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&["--num-workers", "2"]).unwrap();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.backlog, 511);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert!(matches!(config.bind_target().unwrap(), BindTarget::Tcp(_)));
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(parse(&["--num-workers", "0"]).is_err());
    }

    #[test]
    fn permissions_require_uds() {
        assert!(parse(&["--num-workers", "1", "--readable-all"]).is_err());

        #[cfg(unix)]
        {
            let config = parse(&[
                "--num-workers",
                "1",
                "--uds",
                "--server-addr",
                "/tmp/turnstile-test.sock",
                "--readable-all",
                "--writable-all",
            ])
            .unwrap();
            assert!(matches!(config.bind_target().unwrap(), BindTarget::Unix(_)));
            let options = config.bind_options();
            assert!(options.readable_all && options.writable_all);
        }
    }
}
