//! Worker lifecycle controller.
//!
//! Owns the state machine `Stopped -> Starting -> Running -> Stopping ->
//! Stopped`, serializes start/stop, and performs the start sequence:
//! validate configuration, resolve the remote, probe the first connect,
//! bind the local listener. Stop cancels the accept loop and drains
//! in-flight sessions under a bounded grace period.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::relay::{self, RelayContext};
use crate::stats::TransferStats;
use crate::transport::{self, TlsTransport, Transport};
use fluxgate_dns::Resolver;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace period for in-flight sessions on stop.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running(u16),
    Stopping,
}

struct RunHandle {
    cancel: CancellationToken,
    listener_task: JoinHandle<()>,
    relay: Arc<RelayContext>,
}

/// The proxy worker: one controller, at most one active run.
pub struct Worker {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    stats: Arc<TransferStats>,
    state: RwLock<WorkerState>,
    /// Serializes start/stop transitions; at most one in flight.
    lifecycle: tokio::sync::Mutex<()>,
    run: Mutex<Option<RunHandle>>,
}

impl Worker {
    /// Create a worker over the production TLS transport. The configuration
    /// is validated here; an invalid snapshot never becomes current.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(TlsTransport::from_config(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create a worker with an injected transport (tests, alternative
    /// transports). The caller is responsible for prior validation.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            stats: Arc::new(TransferStats::new()),
            state: RwLock::new(WorkerState::Stopped),
            lifecycle: tokio::sync::Mutex::new(()),
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> WorkerState {
        *self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bound local port while running.
    pub fn local_port(&self) -> Option<u16> {
        match self.state() {
            WorkerState::Running(port) => Some(port),
            _ => None,
        }
    }

    /// Live session count (0 when not running).
    pub fn current_connections(&self) -> usize {
        self.run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|run| run.relay.active_sessions())
            .unwrap_or(0)
    }

    fn set_state(&self, state: WorkerState) {
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Start the worker. Completes once the listener is bound (returning
    /// the local port) or the start attempt failed. A start while another
    /// start is in flight waits for it and observes its outcome instead of
    /// spawning a second attempt.
    pub async fn start(&self) -> Result<u16> {
        let _guard = self.lifecycle.lock().await;

        if let WorkerState::Running(port) = self.state() {
            return Ok(port);
        }

        self.set_state(WorkerState::Starting);
        match self.start_inner().await {
            Ok((run, port)) => {
                *self
                    .run
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(run);
                self.set_state(WorkerState::Running(port));
                info!("worker running on local port {}", port);
                Ok(port)
            }
            Err(e) => {
                self.set_state(WorkerState::Stopped);
                crate::logging::log_error(&e, Some("worker start failed"));
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(RunHandle, u16)> {
        let config = &self.config;
        config.validate()?;

        let resolver = Arc::new(Resolver::from_config(
            &config.doh_url,
            &config.dot_host,
            config.connect_timeout(),
            config.ipv6_mode,
        )?);

        let remote_addr = tokio::time::timeout(
            config.connect_timeout(),
            resolver.resolve_addr(&config.server_host, config.server_port),
        )
        .await
        .map_err(|_| Error::resolve(format!("Resolving {} timed out", config.server_host)))??;

        info!("resolved {} to {}", config.server_host, remote_addr);

        // first connect attempt: fail fast on an unreachable server before
        // binding the listener
        transport::probe_tcp(remote_addr, config.connect_timeout()).await?;

        let local_addr = resolve_local_addr(&config.local_host, config.local_port).await?;
        let (listener, port) = relay::bind_listener(local_addr)?;
        info!("listening on {}:{}", config.local_host, port);

        let relay_ctx = Arc::new(RelayContext::new(
            Arc::clone(config),
            Arc::clone(&self.transport),
            resolver,
            remote_addr,
            Arc::clone(&self.stats),
        )?);

        let cancel = CancellationToken::new();
        let listener_task = tokio::spawn(relay::serve(
            listener,
            Arc::clone(&relay_ctx),
            cancel.clone(),
        ));

        Ok((
            RunHandle {
                cancel,
                listener_task,
                relay: relay_ctx,
            },
            port,
        ))
    }

    /// Stop the worker. Idempotent: stopping a stopped worker succeeds
    /// without side effects. In-flight sessions are drained up to
    /// [`DRAIN_TIMEOUT`], then force-closed; stop still completes.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        if self.state() == WorkerState::Stopped {
            return Ok(());
        }
        self.set_state(WorkerState::Stopping);

        let run = self
            .run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(run) = run {
            run.cancel.cancel();
            let _ = run.listener_task.await;

            let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            while run.relay.active_sessions() > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let remaining = run.relay.active_sessions();
            if remaining > 0 {
                // sessions are already cancelled; log the overrun and move on
                crate::logging::log_error(&Error::DrainTimeout { active: remaining }, Some("stop"));
            }
        }

        self.set_state(WorkerState::Stopped);
        info!("worker stopped");
        Ok(())
    }
}

async fn resolve_local_addr(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::config(format!("Invalid local host {}: {}", host, e)))?
        .next()
        .ok_or_else(|| Error::config(format!("Local host {} did not resolve", host)))
}

impl Drop for Worker {
    fn drop(&mut self) {
        // a dropped worker must not leave an accept loop behind
        if let Ok(mut run) = self.run.lock() {
            if let Some(run) = run.take() {
                run.cancel.cancel();
                warn!("worker dropped while running; listener cancelled");
            }
        }
    }
}
