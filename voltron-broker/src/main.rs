// Voltron broker - standalone server
//
// Runs the broker against a registered debugger host outside of any real
// debugger. The main thread plays the debugger: it can simulate a stop at a
// fixed interval so blocking requests and `wait` get answered.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use voltron_adaptor::HostRegistry;
use voltron_broker::config::{BASENAME_ENV, SOCKET_ENV};
use voltron_broker::{Broker, BrokerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve debugger state to voltron clients", long_about = None)]
struct Args {
    /// Debugger host to bind
    #[arg(long, default_value_t = String::from("mock"))]
    host: String,

    /// TCP listen address
    #[arg(long, default_value = "127.0.0.1:5555")]
    tcp: SocketAddr,

    /// Disable the TCP listener
    #[arg(long)]
    no_tcp: bool,

    /// Domain socket path (default ~/.voltron/<basename>.sock)
    #[arg(long, env = SOCKET_ENV)]
    socket: Option<PathBuf>,

    /// Disable the domain socket listener
    #[arg(long)]
    no_socket: bool,

    /// Identifier used to name the domain socket
    #[arg(long, env = BASENAME_ENV, default_value = "voltron")]
    basename: String,

    /// Default timeout for blocking requests, in seconds
    #[arg(long, default_value_t = 10.0)]
    timeout: f64,

    /// Maximum dereference chain length
    #[arg(long, default_value_t = 16)]
    max_deref: usize,

    /// Simulate a debugger stop every N seconds
    #[arg(long)]
    stop_interval: Option<f64>,
}

impl Args {
    fn config(&self) -> Result<BrokerConfig> {
        let mut config = BrokerConfig::default();
        config.set_basename(&self.basename);

        config.tcp = (!self.no_tcp).then_some(self.tcp);
        if let Some(socket) = &self.socket {
            config.domain = Some(socket.clone());
        }
        if self.no_socket {
            config.domain = None;
        }
        config.default_timeout =
            Duration::try_from_secs_f64(self.timeout).context("invalid --timeout")?;
        config.max_deref = self.max_deref;
        config.validate().context("invalid --max-deref")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    // Tracing to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voltron_broker=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.config()?;
    let stop_interval = args
        .stop_interval
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("invalid --stop-interval")?;

    let registry = HostRegistry::default();
    let mut broker = Broker::with_host(config, &registry, &args.host)?;
    broker.start().context("failed to start broker")?;

    if let Some(addr) = broker.tcp_addr() {
        info!("Serving on http://{}", addr);
    }
    if let Some(path) = broker.domain_path() {
        info!("Serving on {}", path.display());
    }

    // A small runtime of our own for signals and the stop timer; the broker
    // runs on its own.
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    loop {
        let stopped = signals.block_on(async {
            match stop_interval {
                Some(interval) => tokio::select! {
                    r = tokio::signal::ctrl_c() => r.map(|_| false),
                    _ = tokio::time::sleep(interval) => Ok(true),
                },
                None => tokio::signal::ctrl_c().await.map(|_| false),
            }
        })?;

        if !stopped {
            break;
        }
        let dispatched = broker.on_stop();
        debug!("Simulated stop dispatched {} request(s)", dispatched);
    }

    info!("Shutting down");
    broker.stop();
    Ok(())
}
