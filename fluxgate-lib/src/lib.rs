//! Binding surface consumed by the Fluxgate UI shells.
//!
//! Process-wide lifecycle: [`init`] must precede any other call and
//! [`destroy`] releases everything at shutdown. Worker start/stop are
//! asynchronous with single-fire completion callbacks; configuration and
//! telemetry getters are synchronous and never touch the network.

pub mod api;
mod error;

pub use api::*;
pub use error::{FfiError, Result};
pub use fluxgate_core::WorkerState;

use fluxgate_core::{Config, Worker};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

/// Everything owned by one `init`/`destroy` bracket.
pub(crate) struct Instance {
    /// Dedicated worker execution context; callers never block on
    /// network I/O, they submit work here.
    pub(crate) runtime: tokio::runtime::Runtime,
    pub(crate) worker: Mutex<Option<Arc<Worker>>>,
    pub(crate) config: RwLock<Config>,
    pub(crate) config_path: PathBuf,
}

/// Global instance for the binding surface
static INSTANCE: once_cell::sync::Lazy<RwLock<Option<Arc<Instance>>>> =
    once_cell::sync::Lazy::new(|| RwLock::new(None));

pub(crate) fn instance() -> Result<Arc<Instance>> {
    INSTANCE
        .read()
        .ok()
        .and_then(|guard| guard.as_ref().cloned())
        .ok_or(FfiError::NotInitialized)
}

/// Initialize the process-wide state: logging, the persisted configuration
/// snapshot, and the worker runtime. Idempotent; later calls keep the
/// existing instance.
pub fn init(_temp_dir: &str, data_dir: &str) -> Result<()> {
    fluxgate_core::logging::init_logging();

    let mut guard = INSTANCE
        .write()
        .map_err(|_| FfiError::Internal("instance lock poisoned".to_string()))?;
    if guard.is_some() {
        return Ok(());
    }

    let config_path = PathBuf::from(data_dir).join("config.json");
    let config = Config::load(&config_path).map_err(FfiError::from)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("fluxgate-worker")
        .enable_all()
        .build()
        .map_err(|e| FfiError::Internal(format!("Failed to build runtime: {}", e)))?;

    *guard = Some(Arc::new(Instance {
        runtime,
        worker: Mutex::new(None),
        config: RwLock::new(config),
        config_path,
    }));

    tracing::info!("fluxgate initialized, config at {:?}", data_dir);
    Ok(())
}

/// Tear down the process-wide state. Stops any active run first; safe to
/// call once at shutdown, and a no-op when never initialized.
pub fn destroy() {
    let instance = {
        let Ok(mut guard) = INSTANCE.write() else {
            return;
        };
        guard.take()
    };

    if let Some(instance) = instance {
        let worker = instance.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(e) = instance.runtime.block_on(worker.stop()) {
                tracing::warn!("stop during destroy failed: {}", e);
            }
        }
        // dropping the instance shuts the runtime down
        tracing::info!("fluxgate destroyed");
    }
}
