//! Control-plane (Appium) server leases.
//!
//! Servers are keyed by `(host, port)`. A lease either reuses a healthy
//! server already listening there or starts a new one and waits for it to
//! answer its status endpoint.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AppiumConfig, Config};
use crate::error::{FleetError, Result};
use crate::mock::MockControlPlane;
use crate::poll::{poll_until, RetryPolicy};

/// Candidates tried when no port is requested.
pub const PORT_SCAN_LIMIT: u16 = 200;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A running control-plane server owned by the lease manager.
#[async_trait]
pub trait ControlPlaneProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Stop the server. Errors are logged, not returned.
    async fn stop(&mut self);
}

/// How servers are probed and started.
#[async_trait]
pub trait ControlPlaneBackend: Send + Sync {
    /// True if nothing is bound to `(host, port)`.
    async fn is_port_free(&self, host: &str, port: u16) -> bool;

    /// True if a server at `(host, port)` accepts connections and reports ready.
    async fn is_healthy(&self, host: &str, port: u16) -> bool;

    async fn spawn(&self, host: &str, port: u16) -> Result<Box<dyn ControlPlaneProcess>>;
}

/// Lease policy.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub base_port: u16,
    pub start_server: bool,
    pub allow_reuse: bool,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl LeaseConfig {
    pub fn from_appium(config: &AppiumConfig, base_port: u16) -> Self {
        Self {
            base_port,
            start_server: config.start_server,
            allow_reuse: config.allow_reuse,
            startup_timeout: config.startup_timeout,
            poll_interval: READY_POLL_INTERVAL,
        }
    }
}

type LeaseKey = (String, u16);

/// Tracks control-plane servers started by this process.
pub struct LeaseManager {
    backend: Arc<dyn ControlPlaneBackend>,
    config: LeaseConfig,
    live: Mutex<HashMap<LeaseKey, Box<dyn ControlPlaneProcess>>>,
}

impl LeaseManager {
    pub fn new(backend: Arc<dyn ControlPlaneBackend>, config: LeaseConfig) -> Self {
        Self {
            backend,
            config,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Manager over Appium, or over in-memory servers with `mock_infra`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let backend: Arc<dyn ControlPlaneBackend> = if config.mock_infra {
            Arc::new(MockControlPlane::new())
        } else {
            Arc::new(AppiumBackend::new(&config.appium)?)
        };
        Ok(Self::new(
            backend,
            LeaseConfig::from_appium(&config.appium, config.slots.base_control_port),
        ))
    }

    /// Lease a ready server on `host`, returning the bound port.
    pub async fn acquire(&self, host: &str, port: Option<u16>) -> Result<u16> {
        let port = match port {
            Some(port) => port,
            None => self.find_free_port(host).await?,
        };
        let key = (host.to_string(), port);

        let tracked = self.live.lock().await.contains_key(&key);
        if self.backend.is_healthy(host, port).await {
            if tracked {
                debug!(host, port, "Reusing tracked control plane");
                return Ok(port);
            }
            if self.config.allow_reuse {
                info!(host, port, "Reusing control plane already listening");
                return Ok(port);
            }
        } else if tracked {
            warn!(host, port, "Tracked control plane is unhealthy, restarting");
            self.release(host, port).await;
        }

        if !self.config.start_server {
            return Err(FleetError::ControlPlaneDisabled {
                host: host.to_string(),
                port,
            });
        }

        let process = self.backend.spawn(host, port).await?;
        info!(host, port, pid = ?process.pid(), "Control plane started");
        self.live.lock().await.insert(key.clone(), process);

        let policy = RetryPolicy::new(self.config.poll_interval, self.config.startup_timeout);
        let backend = &self.backend;
        let ready = poll_until(policy, move || async move {
            backend.is_healthy(host, port).await.then_some(())
        })
        .await;

        if ready.is_none() {
            warn!(host, port, "Control plane did not become ready");
            if let Some(mut process) = self.live.lock().await.remove(&key) {
                process.stop().await;
            }
            return Err(FleetError::StartupTimeout {
                host: host.to_string(),
                port,
                waited_secs: self.config.startup_timeout.as_secs(),
            });
        }

        info!(host, port, "Control plane ready");
        Ok(port)
    }

    /// Stop the server at `(host, port)` if this manager started it.
    pub async fn release(&self, host: &str, port: u16) {
        let process = self.live.lock().await.remove(&(host.to_string(), port));
        match process {
            Some(mut process) => {
                process.stop().await;
                info!(host, port, "Control plane stopped");
            }
            None => {
                info!(host, port, "Control plane not tracked, nothing to stop");
            }
        }
    }

    /// Stop every tracked server.
    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.live.lock().await.drain().collect();
        for ((host, port), mut process) in drained {
            process.stop().await;
            info!(host = %host, port, "Control plane stopped on shutdown");
        }
    }

    /// Keys of tracked servers.
    pub async fn tracked(&self) -> Vec<(String, u16)> {
        let mut keys: Vec<_> = self.live.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn find_free_port(&self, host: &str) -> Result<u16> {
        let start = self.config.base_port;
        for offset in 0..PORT_SCAN_LIMIT {
            let Some(port) = start.checked_add(offset) else {
                break;
            };
            if self.backend.is_port_free(host, port).await {
                return Ok(port);
            }
        }
        Err(FleetError::NoFreePort {
            start,
            tries: PORT_SCAN_LIMIT,
        })
    }
}

// =============================================================================
// Appium backend
// =============================================================================

/// Starts `appium` servers and probes their `/status` endpoint.
pub struct AppiumBackend {
    binary: String,
    log_dir: PathBuf,
    http: reqwest::Client,
}

impl AppiumBackend {
    pub fn new(config: &AppiumConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            binary: config.binary.clone(),
            log_dir: config.log_dir.clone(),
            http,
        })
    }
}

#[async_trait]
impl ControlPlaneBackend for AppiumBackend {
    async fn is_port_free(&self, host: &str, port: u16) -> bool {
        TcpListener::bind((host, port)).await.is_ok()
    }

    async fn is_healthy(&self, host: &str, port: u16) -> bool {
        match timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {}
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "control plane probe: connection error");
                return false;
            }
            Err(_) => {
                debug!(host, port, "control plane probe: connect timeout");
                return false;
            }
        }

        let url = format!("http://{host}:{port}/status");
        match self.http.get(&url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url = %url, error = %e, "control plane probe: status request failed");
                false
            }
        }
    }

    async fn spawn(&self, host: &str, port: u16) -> Result<Box<dyn ControlPlaneProcess>> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let log_file = self.log_dir.join(format!("appium_{port}.log"));

        let child = Command::new(&self.binary)
            .arg("--address")
            .arg(host)
            .arg("-p")
            .arg(port.to_string())
            .arg("--allow-cors")
            .arg("--session-override")
            .arg("--log")
            .arg(&log_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FleetError::command(&self.binary, e))?;

        Ok(Box::new(AppiumProcess { child, port }))
    }
}

struct AppiumProcess {
    child: Child,
    port: u16,
}

#[async_trait]
impl ControlPlaneProcess for AppiumProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn stop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(port = self.port, error = %e, "Failed to kill control plane");
            return;
        }
        match timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(port = self.port, %status, "Control plane exited"),
            Ok(Err(e)) => warn!(port = self.port, error = %e, "Failed to reap control plane"),
            Err(_) => warn!(port = self.port, "Control plane did not exit in time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Backend where ports listed in `busy` are taken and spawned servers
    /// become healthy after `ready_after` probes.
    #[derive(Default)]
    struct FakeBackend {
        busy: HashSet<u16>,
        healthy: StdMutex<HashSet<u16>>,
        ready_after: usize,
        probes: AtomicUsize,
        spawned: AtomicUsize,
        spawned_ports: StdMutex<HashSet<u16>>,
        stopped: Arc<AtomicUsize>,
        never_ready: bool,
    }

    struct FakeProcess {
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ControlPlaneProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ControlPlaneBackend for FakeBackend {
        async fn is_port_free(&self, _host: &str, port: u16) -> bool {
            !self.busy.contains(&port)
        }

        async fn is_healthy(&self, _host: &str, port: u16) -> bool {
            let n = self.probes.fetch_add(1, Ordering::SeqCst);
            if self.never_ready {
                return false;
            }
            if self.healthy.lock().unwrap().contains(&port) {
                return true;
            }
            self.spawned_ports.lock().unwrap().contains(&port) && n >= self.ready_after
        }

        async fn spawn(&self, _host: &str, port: u16) -> Result<Box<dyn ControlPlaneProcess>> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.spawned_ports.lock().unwrap().insert(port);
            Ok(Box::new(FakeProcess {
                stopped: self.stopped.clone(),
            }))
        }
    }

    fn config() -> LeaseConfig {
        LeaseConfig {
            base_port: 4723,
            start_server: true,
            allow_reuse: true,
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_skips_busy_ports() {
        let backend = Arc::new(FakeBackend {
            busy: [4723, 4724].into_iter().collect(),
            ready_after: 2,
            ..Default::default()
        });
        let leases = LeaseManager::new(backend.clone(), config());

        let port = leases.acquire("127.0.0.1", None).await.unwrap();
        assert_eq!(port, 4725);
        assert_eq!(backend.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(leases.tracked().await, vec![("127.0.0.1".to_string(), 4725)]);
    }

    #[tokio::test]
    async fn test_no_free_port() {
        let backend = Arc::new(FakeBackend {
            busy: (4723..4723 + PORT_SCAN_LIMIT).collect(),
            ..Default::default()
        });
        let leases = LeaseManager::new(backend, config());

        let err = leases.acquire("127.0.0.1", None).await.unwrap_err();
        assert!(matches!(err, FleetError::NoFreePort { tries: 200, .. }));
    }

    #[tokio::test]
    async fn test_reuses_healthy_external_server() {
        let backend = Arc::new(FakeBackend::default());
        backend.healthy.lock().unwrap().insert(4733);
        let leases = LeaseManager::new(backend.clone(), config());

        assert_eq!(leases.acquire("127.0.0.1", Some(4733)).await.unwrap(), 4733);
        assert_eq!(backend.spawned.load(Ordering::SeqCst), 0);

        // Not ours, so release leaves it alone.
        leases.release("127.0.0.1", 4733).await;
        assert_eq!(backend.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_start_fails_fast() {
        let backend = Arc::new(FakeBackend::default());
        let leases = LeaseManager::new(
            backend.clone(),
            LeaseConfig {
                start_server: false,
                ..config()
            },
        );

        let err = leases.acquire("127.0.0.1", Some(4723)).await.unwrap_err();
        assert_eq!(err.reason_code(), "control_plane_disabled");
        assert_eq!(backend.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_deregisters() {
        let backend = Arc::new(FakeBackend {
            never_ready: true,
            ..Default::default()
        });
        let leases = LeaseManager::new(backend.clone(), config());

        let err = leases.acquire("127.0.0.1", Some(4743)).await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::StartupTimeout {
                port: 4743,
                waited_secs: 5,
                ..
            }
        ));
        assert!(leases.tracked().await.is_empty());
        assert_eq!(backend.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_and_stop_all() {
        let backend = Arc::new(FakeBackend::default());
        let leases = LeaseManager::new(backend.clone(), config());

        leases.acquire("127.0.0.1", Some(4723)).await.unwrap();
        leases.acquire("127.0.0.1", Some(4733)).await.unwrap();
        assert_eq!(leases.tracked().await.len(), 2);

        leases.release("127.0.0.1", 4723).await;
        leases.release("127.0.0.1", 4723).await;
        assert_eq!(backend.stopped.load(Ordering::SeqCst), 1);

        leases.stop_all().await;
        assert_eq!(backend.stopped.load(Ordering::SeqCst), 2);
        assert!(leases.tracked().await.is_empty());
    }
}
