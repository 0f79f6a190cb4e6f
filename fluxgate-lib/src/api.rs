//! Worker operations and configuration/telemetry getters.

use crate::{instance, FfiError};
use fluxgate_core::{Config, Worker, WorkerState, SUPPORTED_CIPHERS};
use std::sync::Arc;

/// Start the worker asynchronously. The callback fires exactly once: with
/// an empty error and the bound local port on success, else with a
/// human-readable reason and port 0. A start while a start is already in
/// flight observes the in-flight attempt's outcome.
pub fn start_worker<F>(callback: F)
where
    F: FnOnce(String, u16) + Send + 'static,
{
    let instance = match instance() {
        Ok(instance) => instance,
        Err(e) => {
            callback(e.to_string(), 0);
            return;
        }
    };

    // reuse a live worker; build a fresh one from the current snapshot
    // otherwise, so a config saved between runs takes effect
    let worker = {
        let mut guard = match instance.worker.lock() {
            Ok(guard) => guard,
            Err(_) => {
                callback("worker lock poisoned".to_string(), 0);
                return;
            }
        };
        match guard.as_ref() {
            Some(worker) if worker.state() != WorkerState::Stopped => Arc::clone(worker),
            _ => {
                let config = match instance.config.read() {
                    Ok(config) => config.clone(),
                    Err(_) => {
                        callback("config lock poisoned".to_string(), 0);
                        return;
                    }
                };
                match Worker::new(config) {
                    Ok(worker) => {
                        let worker = Arc::new(worker);
                        *guard = Some(Arc::clone(&worker));
                        worker
                    }
                    Err(e) => {
                        callback(e.to_string(), 0);
                        return;
                    }
                }
            }
        }
    };

    instance.runtime.spawn(async move {
        match worker.start().await {
            Ok(port) => callback(String::new(), port),
            Err(e) => callback(e.to_string(), 0),
        }
    });
}

/// Stop the worker asynchronously. Idempotent; the callback fires exactly
/// once, after in-flight sessions have drained.
pub fn stop_worker<F>(callback: F)
where
    F: FnOnce() + Send + 'static,
{
    let instance = match instance() {
        Ok(instance) => instance,
        Err(_) => {
            callback();
            return;
        }
    };

    let worker = instance.worker.lock().ok().and_then(|w| w.clone());
    match worker {
        Some(worker) => {
            instance.runtime.spawn(async move {
                if let Err(e) = worker.stop().await {
                    tracing::warn!("stop failed: {}", e);
                }
                callback();
            });
        }
        None => callback(),
    }
}

/// Validate and persist a configuration snapshot. Returns an empty string
/// on success, else a description of the first validation failure. The
/// snapshot becomes current immediately and drives the next run.
#[allow(clippy::too_many_arguments)]
pub fn save_config(
    host: &str,
    sni: &str,
    port: u16,
    username: &str,
    password: &str,
    cipher: &str,
    doh_url: &str,
    dot_host: &str,
    limit_rate: u64,
    timeout: u32,
) -> String {
    let instance = match instance() {
        Ok(instance) => instance,
        Err(e) => return e.to_string(),
    };

    let current = match instance.config.read() {
        Ok(config) => config.clone(),
        Err(_) => return "config lock poisoned".to_string(),
    };

    let config = Config {
        server_host: host.to_string(),
        server_sni: sni.to_string(),
        server_port: port,
        username: username.to_string(),
        password: password.to_string(),
        method: cipher.to_string(),
        doh_url: doh_url.to_string(),
        dot_host: dot_host.to_string(),
        limit_rate,
        connect_timeout: timeout,
        ..current
    };

    if let Err(e) = config.validate() {
        return FfiError::from(e).to_string();
    }
    if let Err(e) = config.save(&instance.config_path) {
        return FfiError::from(e).to_string();
    }

    if let Ok(mut guard) = instance.config.write() {
        *guard = config;
    }
    String::new()
}

fn with_config<T: Default>(f: impl FnOnce(&Config) -> T) -> T {
    instance()
        .ok()
        .and_then(|instance| instance.config.read().ok().map(|config| f(&config)))
        .unwrap_or_default()
}

pub fn get_server_host() -> String {
    with_config(|c| c.server_host.clone())
}

pub fn get_server_sni() -> String {
    with_config(|c| c.server_sni.clone())
}

pub fn get_server_port() -> u16 {
    with_config(|c| c.server_port)
}

pub fn get_username() -> String {
    with_config(|c| c.username.clone())
}

pub fn get_password() -> String {
    with_config(|c| c.password.clone())
}

pub fn get_cipher() -> String {
    with_config(|c| c.method.clone())
}

/// Supported cipher names, for validation and UI population. Available
/// without an active session.
pub fn get_cipher_strings() -> Vec<String> {
    SUPPORTED_CIPHERS.iter().map(|s| s.to_string()).collect()
}

pub fn get_doh_url() -> String {
    with_config(|c| c.doh_url.clone())
}

pub fn get_dot_host() -> String {
    with_config(|c| c.dot_host.clone())
}

pub fn get_limit_rate() -> u64 {
    with_config(|c| c.limit_rate)
}

pub fn get_timeout() -> u32 {
    with_config(|c| c.connect_timeout)
}

fn with_worker<T: Default>(f: impl FnOnce(&Worker) -> T) -> T {
    instance()
        .ok()
        .and_then(|instance| {
            instance
                .worker
                .lock()
                .ok()
                .and_then(|worker| worker.as_ref().map(|w| f(w)))
        })
        .unwrap_or_default()
}

/// Current worker state.
pub fn get_state() -> WorkerState {
    let state = instance().ok().and_then(|instance| {
        instance
            .worker
            .lock()
            .ok()
            .and_then(|worker| worker.as_ref().map(|w| w.state()))
    });
    state.unwrap_or(WorkerState::Stopped)
}

/// Bound local port while running.
pub fn get_local_port() -> Option<u16> {
    with_worker(|w| w.local_port())
}

/// Live session count.
pub fn current_connections() -> usize {
    with_worker(|w| w.current_connections())
}

/// Current transfer rate sample, pre-formatted as `[tx, rx]`.
pub fn get_transfer_rate() -> [String; 2] {
    let sample = instance().ok().and_then(|instance| {
        instance
            .worker
            .lock()
            .ok()
            .and_then(|worker| worker.as_ref().map(|w| w.stats().sample()))
    });
    sample.unwrap_or_default().formatted()
}

/// Recent buffered log lines for shells without a console (0 = all).
pub fn get_recent_logs(count: usize) -> Vec<String> {
    fluxgate_core::logging::get_recent_logs(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{destroy, init};
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    // the binding surface is process-wide; serialize tests touching it
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn test_data_dir(name: &str) -> String {
        let dir = std::env::temp_dir().join("fluxgate-lib-test").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir.to_string_lossy().into_owned()
    }

    #[test]
    fn test_save_config_and_getters() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = test_data_dir("getters");
        init(&dir, &dir).unwrap();

        let err = save_config(
            "proxy.example.com",
            "cdn.example.net",
            8443,
            "user",
            "secret",
            "aes-256-gcm",
            "https://dns.google/dns-query",
            "",
            2048,
            15,
        );
        assert_eq!(err, "");

        assert_eq!(get_server_host(), "proxy.example.com");
        assert_eq!(get_server_sni(), "cdn.example.net");
        assert_eq!(get_server_port(), 8443);
        assert_eq!(get_cipher(), "aes-256-gcm");
        assert_eq!(get_doh_url(), "https://dns.google/dns-query");
        assert_eq!(get_dot_host(), "");
        assert_eq!(get_limit_rate(), 2048);
        assert_eq!(get_timeout(), 15);
        assert!(get_cipher_strings().contains(&"aes-256-gcm".to_string()));
        assert_eq!(get_state(), WorkerState::Stopped);

        destroy();
    }

    #[test]
    fn test_save_config_reports_first_failure() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = test_data_dir("invalid");
        init(&dir, &dir).unwrap();

        let err = save_config(
            "", "", 443, "user", "secret", "aes-256-gcm", "", "", 0, 0,
        );
        assert!(err.contains("Server host"));

        let err = save_config(
            "proxy.example.com",
            "",
            443,
            "user",
            "secret",
            "rc4-md5",
            "",
            "",
            0,
            0,
        );
        assert!(err.contains("Unsupported cipher"));

        destroy();
    }

    #[test]
    fn test_save_config_persists_across_init() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = test_data_dir("persist");
        init(&dir, &dir).unwrap();

        let err = save_config(
            "proxy.example.com",
            "",
            443,
            "user",
            "secret",
            "chacha20-ietf-poly1305",
            "",
            "1.1.1.1",
            0,
            0,
        );
        assert_eq!(err, "");
        destroy();

        init(&dir, &dir).unwrap();
        assert_eq!(get_server_host(), "proxy.example.com");
        assert_eq!(get_cipher(), "chacha20-ietf-poly1305");
        assert_eq!(get_dot_host(), "1.1.1.1");
        destroy();
    }

    #[test]
    fn test_start_and_stop_worker_callbacks() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = test_data_dir("startstop");
        init(&dir, &dir).unwrap();

        // a local listener stands in for the remote; start only probes
        // reachability, the TLS handshake happens per-session
        let remote = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let remote_addr = remote.local_addr().unwrap();
        std::thread::spawn(move || {
            while let Ok((stream, _)) = remote.accept() {
                drop(stream);
            }
        });

        let err = save_config(
            &remote_addr.ip().to_string(),
            "",
            remote_addr.port(),
            "user",
            "secret",
            "aes-256-gcm",
            "",
            "",
            0,
            5,
        );
        assert_eq!(err, "");

        let (tx, rx) = mpsc::channel();
        start_worker(move |err_msg, port| {
            tx.send((err_msg, port)).unwrap();
        });
        let (err_msg, port) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(err_msg, "");
        assert!(port > 0);
        assert_eq!(get_state(), WorkerState::Running(port));
        assert_eq!(get_local_port(), Some(port));
        assert_eq!(current_connections(), 0);

        let rates = get_transfer_rate();
        assert!(rates[0].ends_with("/s"));

        let (tx, rx) = mpsc::channel();
        stop_worker(move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(get_state(), WorkerState::Stopped);

        destroy();
    }

    #[test]
    fn test_calls_without_init_are_safe() {
        let _lock = TEST_LOCK.lock().unwrap();
        destroy(); // no-op

        assert_eq!(get_server_host(), "");
        assert_eq!(get_state(), WorkerState::Stopped);

        let err = save_config(
            "host", "", 443, "u", "p", "aes-256-gcm", "", "", 0, 0,
        );
        assert!(!err.is_empty());

        let (tx, rx) = mpsc::channel();
        start_worker(move |err_msg, port| {
            tx.send((err_msg, port)).unwrap();
        });
        let (err_msg, port) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!err_msg.is_empty());
        assert_eq!(port, 0);
    }
}
