//! In-memory stand-ins for the control plane, the device bridge and driver
//! sessions. Used for development without an Android SDK and by tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::info;

use crate::device::{identifier_for_port, DeviceBridge, SERIAL_PREFIX};
use crate::driver::{DriverFactory, DriverSession, SessionTarget};
use crate::error::{FleetError, Result};
use crate::lease::{ControlPlaneBackend, ControlPlaneProcess};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Control-plane servers that are ready as soon as they are spawned.
#[derive(Default)]
pub struct MockControlPlane {
    running: Arc<Mutex<HashSet<u16>>>,
    spawns: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, port: u16) -> bool {
        lock(&self.running).contains(&port)
    }
}

struct MockServer {
    port: u16,
    running: Arc<Mutex<HashSet<u16>>>,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl ControlPlaneProcess for MockServer {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn stop(&mut self) {
        lock(&self.running).remove(&self.port);
        self.stops.fetch_add(1, Ordering::SeqCst);
        info!(port = self.port, "[MOCK] Control plane stopped");
    }
}

#[async_trait]
impl ControlPlaneBackend for MockControlPlane {
    async fn is_port_free(&self, _host: &str, port: u16) -> bool {
        !self.is_running(port)
    }

    async fn is_healthy(&self, _host: &str, port: u16) -> bool {
        self.is_running(port)
    }

    async fn spawn(&self, host: &str, port: u16) -> Result<Box<dyn ControlPlaneProcess>> {
        lock(&self.running).insert(port);
        self.spawns.fetch_add(1, Ordering::SeqCst);
        info!(host, port, "[MOCK] Control plane started");
        Ok(Box::new(MockServer {
            port,
            running: self.running.clone(),
            stops: self.stops.clone(),
        }))
    }
}

/// A device pool where spawned emulators attach and boot immediately.
#[derive(Default)]
pub struct MockBridge {
    attached: Mutex<Vec<String>>,
    /// A device nobody launched, visible for the given number of polls.
    stray: Mutex<Option<(String, usize)>>,
    spawned: Mutex<Vec<(String, u16)>>,
    kills: AtomicUsize,
}

impl MockBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `serial` as attached for the next `polls` device listings.
    pub fn with_stray_device(serial: impl Into<String>, polls: usize) -> Self {
        Self {
            stray: Mutex::new(Some((serial.into(), polls))),
            ..Self::default()
        }
    }

    /// Units spawned so far with their device ports.
    pub fn spawned(&self) -> Vec<(String, u16)> {
        lock(&self.spawned).clone()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceBridge for MockBridge {
    async fn attached(&self) -> Result<Vec<String>> {
        let mut serials = lock(&self.attached).clone();
        let mut stray = lock(&self.stray);
        if let Some((serial, polls)) = stray.as_mut() {
            serials.push(serial.clone());
            *polls = polls.saturating_sub(1);
            if *polls == 0 {
                *stray = None;
            }
        }
        Ok(serials)
    }

    async fn getprop(&self, serial: &str, property: &str) -> Result<String> {
        if !lock(&self.attached).iter().any(|s| s == serial) {
            return Err(FleetError::command(
                "adb",
                format!("device '{serial}' not found"),
            ));
        }
        let value = match property {
            "dev.bootcomplete" | "sys.boot_completed" => "1",
            "init.svc.bootanim" => "stopped",
            _ => "",
        };
        Ok(value.to_string())
    }

    async fn emu_kill(&self, serial: Option<&str>) -> Result<bool> {
        let mut attached = lock(&self.attached);
        let before = attached.len();
        match serial {
            Some(serial) => attached.retain(|s| s != serial),
            None => attached.retain(|s| !s.starts_with(SERIAL_PREFIX)),
        }
        let acknowledged = attached.len() < before;
        if acknowledged {
            self.kills.fetch_add(1, Ordering::SeqCst);
            info!(identifier = ?serial, "[MOCK] Emulator killed");
        }
        Ok(acknowledged)
    }

    async fn power_off(&self, serial: Option<&str>) -> Result<()> {
        Err(FleetError::command(
            "adb reboot -p",
            format!("no device {}", serial.unwrap_or("attached")),
        ))
    }

    async fn spawn_emulator(&self, unit_name: &str, port: u16) -> Result<()> {
        lock(&self.spawned).push((unit_name.to_string(), port));
        lock(&self.attached).push(identifier_for_port(port));
        info!(unit = %unit_name, port, "[MOCK] Emulator started");
        Ok(())
    }

    async fn is_port_free(&self, port: u16) -> bool {
        let identifier = identifier_for_port(port);
        !lock(&self.attached).contains(&identifier)
    }
}

/// Creates sessions that record calls and return a fixed video.
#[derive(Default)]
pub struct MockDriverFactory {
    created: Arc<AtomicUsize>,
    quits: Arc<AtomicUsize>,
    fail_create: bool,
}

impl MockDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose sessions can never be created.
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn quits(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriverFactory for MockDriverFactory {
    async fn create(&self, target: &SessionTarget) -> Result<Box<dyn DriverSession>> {
        if self.fail_create {
            return Err(FleetError::Driver(format!(
                "mock session refused for {}",
                target.identifier
            )));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        info!(
            endpoint = %target.endpoint,
            identifier = %target.identifier,
            "[MOCK] Driver session created"
        );
        Ok(Box::new(MockSession {
            id: format!("mock-{n}"),
            recording: Mutex::new(false),
            quits: self.quits.clone(),
        }))
    }
}

pub struct MockSession {
    id: String,
    recording: Mutex<bool>,
    quits: Arc<AtomicUsize>,
}

#[async_trait]
impl DriverSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn reset_app(&self, _package: &str) -> Result<()> {
        Ok(())
    }

    async fn start_recording(&self, _time_limit_secs: u32) -> Result<()> {
        *lock(&self.recording) = true;
        Ok(())
    }

    async fn stop_recording(&self) -> Result<Vec<u8>> {
        let mut recording = lock(&self.recording);
        if !*recording {
            return Err(FleetError::Driver("no recording in progress".to_string()));
        }
        *recording = false;
        Ok(b"mock-video".to_vec())
    }

    async fn quit(&self) -> Result<()> {
        self.quits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stray_device_disappears() {
        let bridge = MockBridge::with_stray_device("emulator-5600", 1);
        assert_eq!(bridge.attached().await.unwrap(), vec!["emulator-5600"]);
        assert!(bridge.attached().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_emulator_boots_and_stops() {
        let bridge = MockBridge::new();
        bridge.spawn_emulator("u1", 5554).await.unwrap();
        assert_eq!(
            bridge.getprop("emulator-5554", "init.svc.bootanim").await.unwrap(),
            "stopped"
        );
        assert!(!bridge.is_port_free(5554).await);
        assert!(bridge.emu_kill(Some("emulator-5554")).await.unwrap());
        assert!(bridge.attached().await.unwrap().is_empty());
        assert!(!bridge.emu_kill(Some("emulator-5554")).await.unwrap());
    }

    #[tokio::test]
    async fn test_control_plane_stop_frees_port() {
        let plane = MockControlPlane::new();
        let mut server = plane.spawn("127.0.0.1", 4723).await.unwrap();
        assert!(plane.is_healthy("127.0.0.1", 4723).await);
        server.stop().await;
        assert!(plane.is_port_free("127.0.0.1", 4723).await);
        assert_eq!(plane.stops(), 1);
    }
}
