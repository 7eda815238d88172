// Broker lifecycle
//
// The object a debugger entry shim owns. It runs the listeners on its own
// tokio runtime so the debugger's thread stays free; `drain`/`on_stop` are
// called from that thread when the debugger stops.
//
// All methods here are blocking and must not be called from inside an
// async context.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voltron_adaptor::{Adaptor, HostRegistry, TargetState};

use crate::config::{BrokerConfig, ConfigError};
use crate::dispatcher::Dispatcher;
use crate::server;

/// Grace period for connection tasks when the runtime shuts down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Broker is already running")]
    AlreadyRunning,

    #[error("No listeners configured")]
    NoListeners,

    #[error("Unknown debugger host: {0}")]
    UnknownHost(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

struct Running {
    runtime: Runtime,
    shutdown: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
    tcp_addr: Option<SocketAddr>,
    domain_path: Option<PathBuf>,
}

pub struct Broker {
    config: BrokerConfig,
    dispatcher: Dispatcher,
    running: Option<Running>,
}

impl Broker {
    /// A broker that reports `hosts` from `plugins`
    pub fn new(config: BrokerConfig, hosts: Vec<String>) -> Self {
        let dispatcher = Dispatcher::new(config.default_timeout, hosts, config.views.clone());
        Self {
            config,
            dispatcher,
            running: None,
        }
    }

    /// A broker with `host` from `registry` already bound
    pub fn with_host(config: BrokerConfig, registry: &HostRegistry, host: &str) -> Result<Self, BrokerError> {
        config.validate()?;
        let adaptor = registry
            .create(host, config.deref_limits())
            .ok_or_else(|| BrokerError::UnknownHost(host.to_string()))?;
        let broker = Self::new(config, registry.hosts());
        broker.bind(adaptor);
        Ok(broker)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn bind(&self, adaptor: Arc<dyn Adaptor>) {
        self.dispatcher.bind(adaptor);
    }

    pub fn unbind(&self) -> Option<Arc<dyn Adaptor>> {
        self.dispatcher.unbind()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the TCP listener actually bound
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().and_then(|r| r.tcp_addr)
    }

    pub fn domain_path(&self) -> Option<&Path> {
        self.running.as_ref().and_then(|r| r.domain_path.as_deref())
    }

    /// Bind the listeners and start serving
    pub fn start(&mut self) -> Result<(), BrokerError> {
        if self.running.is_some() {
            return Err(BrokerError::AlreadyRunning);
        }
        self.config.validate()?;
        if self.config.tcp.is_none() && self.config.domain.is_none() {
            return Err(BrokerError::NoListeners);
        }

        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("voltron-broker")
            .build()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut listeners = Vec::new();

        let tcp_addr = match self.config.tcp {
            Some(addr) => {
                let listener = runtime.block_on(TcpListener::bind(addr))?;
                let local = listener.local_addr()?;
                listeners.push(runtime.spawn(server::serve_tcp(
                    listener,
                    self.dispatcher.clone(),
                    shutdown_rx.clone(),
                )));
                Some(local)
            }
            None => None,
        };

        let domain_path = match &self.config.domain {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                remove_socket(path)?;

                let listener = {
                    let _guard = runtime.enter();
                    UnixListener::bind(path)?
                };
                listeners.push(runtime.spawn(server::serve_unix(
                    listener,
                    self.dispatcher.clone(),
                    shutdown_rx.clone(),
                )));
                Some(path.clone())
            }
            None => None,
        };

        self.dispatcher.start();
        info!(
            "Broker started (tcp: {:?}, domain: {:?})",
            tcp_addr, domain_path
        );

        self.running = Some(Running {
            runtime,
            shutdown,
            listeners,
            tcp_addr,
            domain_path,
        });
        Ok(())
    }

    /// Cancel queued requests, close the listeners and remove the socket
    /// file. Does nothing if the broker is not running.
    pub fn stop(&mut self) {
        let running = match self.running.take() {
            Some(r) => r,
            None => return,
        };

        let cancelled = self.dispatcher.stop();
        debug!("Cancelled {} queued request(s)", cancelled);

        running.shutdown.send(true).ok();
        running.runtime.block_on(async {
            for listener in running.listeners {
                listener.await.ok();
            }
        });
        running.runtime.shutdown_timeout(SHUTDOWN_GRACE);

        if let Some(path) = &running.domain_path {
            if let Err(e) = remove_socket(path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        info!("Broker stopped");
    }

    /// Dispatch every queued request on the calling thread
    pub fn drain(&self) -> usize {
        self.dispatcher.drain()
    }

    /// Cancel every queued request without stopping the listeners
    pub fn cancel(&self) -> usize {
        self.dispatcher.cancel()
    }

    /// Stop-hook entry point: wake `wait` requests, then drain the queue
    pub fn on_stop(&self) -> usize {
        if let Some(adaptor) = self.dispatcher.adaptor() {
            adaptor.notifier().notify(TargetState::Stopped);
        }
        self.drain()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
