//! Emulator lifecycle over adb.
//!
//! A unit launched on device port `N` attaches to adb as `emulator-N`.
//! Only one externally visible device pool is assumed: launching while any
//! device is attached fails with `AlreadyRunning`.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{Config, EmulatorConfig};
use crate::error::{FleetError, Result};
use crate::mock::MockBridge;
use crate::poll::{poll_until, RetryPolicy};

/// Prefix of emulator serials.
pub const SERIAL_PREFIX: &str = "emulator-";

/// Candidates tried when no device port is requested.
pub const PORT_SCAN_LIMIT: u16 = 50;

const DISCOVERY: RetryPolicy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
const BOOT_COMPLETE_INTERVAL: Duration = Duration::from_secs(2);
const BOOT_ANIM_INTERVAL: Duration = Duration::from_secs(3);

/// Identifier of the unit listening on `port`.
pub fn identifier_for_port(port: u16) -> String {
    format!("{SERIAL_PREFIX}{port}")
}

/// Access to the device bridge and the emulator binary.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Serials attached in the `device` state.
    async fn attached(&self) -> Result<Vec<String>>;

    async fn getprop(&self, serial: &str, property: &str) -> Result<String>;

    /// Ask the emulator to exit. Returns false if it did not acknowledge.
    async fn emu_kill(&self, serial: Option<&str>) -> Result<bool>;

    /// Force a power-off through the guest.
    async fn power_off(&self, serial: Option<&str>) -> Result<()>;

    /// Start `unit_name` detached on `port`.
    async fn spawn_emulator(&self, unit_name: &str, port: u16) -> Result<()>;

    async fn is_port_free(&self, port: u16) -> bool;
}

/// Launches, awaits and stops execution units.
pub struct DeviceManager {
    bridge: Arc<dyn DeviceBridge>,
    base_port: u16,
    settle: Duration,
}

impl DeviceManager {
    pub fn new(bridge: Arc<dyn DeviceBridge>, base_port: u16, settle: Duration) -> Self {
        Self {
            bridge,
            base_port,
            settle,
        }
    }

    /// Manager over adb, or over an in-memory device pool with `mock_infra`.
    pub fn from_config(config: &Config) -> Self {
        let bridge: Arc<dyn DeviceBridge> = if config.mock_infra {
            Arc::new(MockBridge::new())
        } else {
            Arc::new(AdbBridge::new(&config.emulator))
        };
        Self::new(bridge, config.slots.base_device_port, config.emulator.settle)
    }

    /// Start `unit_name` and return its identifier.
    pub async fn launch(&self, unit_name: &str, device_port: Option<u16>) -> Result<String> {
        let attached = self.bridge.attached().await?;
        if !attached.is_empty() {
            warn!(unit = %unit_name, ?attached, "A device is already attached");
            return Err(FleetError::AlreadyRunning { attached });
        }

        let port = match device_port {
            Some(port) => {
                if !self.bridge.is_port_free(port).await {
                    return Err(FleetError::PortInUse(port));
                }
                port
            }
            None => self.find_free_port().await?,
        };

        let identifier = identifier_for_port(port);
        info!(unit = %unit_name, port, identifier = %identifier, "Starting emulator");
        self.bridge.spawn_emulator(unit_name, port).await?;
        tokio::time::sleep(self.settle).await;

        Ok(identifier)
    }

    /// Wait until the unit has booted. Returns the identifier waited on.
    ///
    /// Without an identifier, the first `emulator-*` serial to appear within
    /// the discovery window is used.
    pub async fn wait_ready(&self, identifier: Option<&str>, limit: Duration) -> Result<String> {
        let serial = match identifier {
            Some(serial) => serial.to_string(),
            None => {
                let bridge = &self.bridge;
                poll_until(DISCOVERY, move || async move {
                    first_emulator(bridge.as_ref()).await
                })
                .await
                .ok_or_else(|| FleetError::Timeout {
                    phase: "device discovery".to_string(),
                    waited_secs: DISCOVERY.timeout.as_secs(),
                })?
            }
        };

        debug!(identifier = %serial, "Waiting for boot");
        self.wait_property(&serial, "dev.bootcomplete", "1", BOOT_COMPLETE_INTERVAL, limit)
            .await?;
        self.wait_property(&serial, "init.svc.bootanim", "stopped", BOOT_ANIM_INTERVAL, limit)
            .await?;

        info!(identifier = %serial, "Unit ready");
        Ok(serial)
    }

    async fn wait_property(
        &self,
        serial: &str,
        property: &str,
        expected: &str,
        interval: Duration,
        limit: Duration,
    ) -> Result<()> {
        let bridge = &self.bridge;
        let reached = poll_until(RetryPolicy::new(interval, limit), move || async move {
            match bridge.getprop(serial, property).await {
                Ok(value) if value == expected => Some(()),
                Ok(_) => None,
                Err(e) => {
                    debug!(identifier = %serial, property, error = %e, "getprop failed");
                    None
                }
            }
        })
        .await;

        reached.ok_or_else(|| FleetError::Timeout {
            phase: format!("{property} == {expected} on {serial}"),
            waited_secs: limit.as_secs(),
        })
    }

    /// Shut the unit down. Failures are logged.
    pub async fn stop(&self, identifier: Option<&str>) {
        let serial = match identifier {
            Some(serial) => Some(serial.to_string()),
            None => first_emulator(self.bridge.as_ref()).await,
        };
        let serial = serial.as_deref();

        match self.bridge.emu_kill(serial).await {
            Ok(true) => {
                info!(identifier = ?serial, "Emulator stopped");
                return;
            }
            Ok(false) => warn!(identifier = ?serial, "emu kill not acknowledged, powering off"),
            Err(e) => warn!(identifier = ?serial, error = %e, "emu kill failed, powering off"),
        }

        if let Err(e) = self.bridge.power_off(serial).await {
            warn!(identifier = ?serial, error = %e, "Power-off failed");
        }
    }

    pub async fn list_active(&self) -> Result<Vec<String>> {
        self.bridge.attached().await
    }

    /// Fails with `DeviceMismatch` unless `identifier` is attached.
    pub async fn verify_attached(&self, identifier: &str) -> Result<()> {
        let attached = self.bridge.attached().await?;
        if attached.iter().any(|serial| serial == identifier) {
            return Ok(());
        }
        Err(FleetError::DeviceMismatch {
            expected: identifier.to_string(),
            attached,
        })
    }

    async fn find_free_port(&self) -> Result<u16> {
        for step in 0..PORT_SCAN_LIMIT {
            let Some(port) = self.base_port.checked_add(step * 2) else {
                break;
            };
            if self.bridge.is_port_free(port).await {
                return Ok(port);
            }
        }
        Err(FleetError::NoFreePort {
            start: self.base_port,
            tries: PORT_SCAN_LIMIT,
        })
    }
}

async fn first_emulator(bridge: &dyn DeviceBridge) -> Option<String> {
    match bridge.attached().await {
        Ok(serials) => serials.into_iter().find(|s| s.starts_with(SERIAL_PREFIX)),
        Err(e) => {
            debug!(error = %e, "Listing devices failed");
            None
        }
    }
}

/// Parse `adb devices` output into serials in the `device` state.
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            (parts.next()? == "device").then(|| serial.to_string())
        })
        .collect()
}

// =============================================================================
// adb + emulator binaries
// =============================================================================

const DEVICES_TIMEOUT: Duration = Duration::from_secs(15);
const SHELL_TIMEOUT: Duration = Duration::from_secs(10);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// [`DeviceBridge`] backed by the Android SDK tools.
pub struct AdbBridge {
    adb: PathBuf,
    emulator: PathBuf,
    headless: bool,
    no_snapshot: bool,
}

impl AdbBridge {
    pub fn new(config: &EmulatorConfig) -> Self {
        let (adb, emulator) = match &config.sdk_root {
            Some(root) => (
                root.join("platform-tools").join("adb"),
                root.join("emulator").join("emulator"),
            ),
            None => (PathBuf::from("adb"), PathBuf::from("emulator")),
        };
        Self {
            adb,
            emulator,
            headless: config.headless,
            no_snapshot: config.no_snapshot,
        }
    }

    /// Emulator arguments for `unit_name` on `port`.
    pub fn launch_args(&self, unit_name: &str, port: u16) -> Vec<String> {
        let mut args = vec![
            "-avd".to_string(),
            unit_name.to_string(),
            "-port".to_string(),
            port.to_string(),
        ];
        if self.headless {
            args.push("-no-window".to_string());
        }
        if self.no_snapshot {
            args.push("-no-snapshot".to_string());
        }
        args.extend(
            ["-no-boot-anim", "-no-audio", "-gpu", "swiftshader_indirect"].map(String::from),
        );
        args
    }

    async fn adb(&self, serial: Option<&str>, args: &[&str], limit: Duration) -> Result<Output> {
        let mut command = Command::new(&self.adb);
        if let Some(serial) = serial {
            command.arg("-s").arg(serial);
        }
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let program = self.adb.display().to_string();
        match timeout(limit, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(FleetError::command(program, e)),
            Err(_) => Err(FleetError::command(
                program,
                format!("{} timed out after {}s", args.join(" "), limit.as_secs()),
            )),
        }
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn attached(&self) -> Result<Vec<String>> {
        if self.adb.is_absolute() && !self.adb.exists() {
            warn!(adb = %self.adb.display(), "adb not found, assuming no devices");
            return Ok(Vec::new());
        }
        let output = self.adb(None, &["devices"], DEVICES_TIMEOUT).await?;
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn getprop(&self, serial: &str, property: &str) -> Result<String> {
        let output = self
            .adb(Some(serial), &["shell", "getprop", property], SHELL_TIMEOUT)
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn emu_kill(&self, serial: Option<&str>) -> Result<bool> {
        let output = self.adb(serial, &["emu", "kill"], SHELL_TIMEOUT).await?;
        Ok(output.status.success())
    }

    async fn power_off(&self, serial: Option<&str>) -> Result<()> {
        let output = self.adb(serial, &["reboot", "-p"], SHELL_TIMEOUT).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(FleetError::command(
                "adb reboot -p",
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
        }
    }

    async fn spawn_emulator(&self, unit_name: &str, port: u16) -> Result<()> {
        let child = Command::new(&self.emulator)
            .args(self.launch_args(unit_name, port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FleetError::command(self.emulator.display().to_string(), e))?;
        debug!(unit = %unit_name, port, pid = ?child.id(), "Emulator process spawned");
        // Detached: the emulator outlives this handle and is stopped over adb.
        drop(child);
        Ok(())
    }

    async fn is_port_free(&self, port: u16) -> bool {
        !matches!(
            timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBridge {
        attached: Mutex<Vec<String>>,
        busy: HashSet<u16>,
        props: Mutex<HashMap<String, String>>,
        spawned: Mutex<Vec<(String, u16)>>,
        kill_acknowledged: bool,
        power_offs: AtomicUsize,
    }

    #[async_trait]
    impl DeviceBridge for FakeBridge {
        async fn attached(&self) -> Result<Vec<String>> {
            Ok(self.attached.lock().unwrap().clone())
        }

        async fn getprop(&self, _serial: &str, property: &str) -> Result<String> {
            Ok(self
                .props
                .lock()
                .unwrap()
                .get(property)
                .cloned()
                .unwrap_or_default())
        }

        async fn emu_kill(&self, _serial: Option<&str>) -> Result<bool> {
            Ok(self.kill_acknowledged)
        }

        async fn power_off(&self, _serial: Option<&str>) -> Result<()> {
            self.power_offs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn spawn_emulator(&self, unit_name: &str, port: u16) -> Result<()> {
            self.spawned
                .lock()
                .unwrap()
                .push((unit_name.to_string(), port));
            Ok(())
        }

        async fn is_port_free(&self, port: u16) -> bool {
            !self.busy.contains(&port)
        }
    }

    fn manager(bridge: Arc<FakeBridge>) -> DeviceManager {
        DeviceManager::new(bridge, 5554, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_launch_refuses_when_device_attached() {
        let bridge = Arc::new(FakeBridge::default());
        bridge.attached.lock().unwrap().push("emulator-5554".to_string());

        let err = manager(bridge.clone()).launch("u1", Some(5574)).await.unwrap_err();
        assert_eq!(err.reason_code(), "already_running");
        assert!(bridge.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_launch_scans_even_ports() {
        let bridge = Arc::new(FakeBridge {
            busy: [5554, 5556].into_iter().collect(),
            ..Default::default()
        });

        let id = manager(bridge.clone()).launch("u1", None).await.unwrap();
        assert_eq!(id, "emulator-5558");
        assert_eq!(
            bridge.spawned.lock().unwrap().as_slice(),
            &[("u1".to_string(), 5558)]
        );
    }

    #[tokio::test]
    async fn test_launch_explicit_port_in_use() {
        let bridge = Arc::new(FakeBridge {
            busy: [5574].into_iter().collect(),
            ..Default::default()
        });
        let err = manager(bridge).launch("u1", Some(5574)).await.unwrap_err();
        assert!(matches!(err, FleetError::PortInUse(5574)));
    }

    #[tokio::test]
    async fn test_launch_no_free_port() {
        let bridge = Arc::new(FakeBridge {
            busy: (0..PORT_SCAN_LIMIT).map(|i| 5554 + i * 2).collect(),
            ..Default::default()
        });
        let err = manager(bridge).launch("u1", None).await.unwrap_err();
        assert!(matches!(err, FleetError::NoFreePort { tries: 50, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_discovers_and_checks_props() {
        let bridge = Arc::new(FakeBridge::default());
        bridge
            .attached
            .lock()
            .unwrap()
            .extend(["R58M123".to_string(), "emulator-5574".to_string()]);
        {
            let mut props = bridge.props.lock().unwrap();
            props.insert("dev.bootcomplete".to_string(), "1".to_string());
            props.insert("init.svc.bootanim".to_string(), "stopped".to_string());
        }

        let id = manager(bridge)
            .wait_ready(None, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(id, "emulator-5574");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out_on_boot_animation() {
        let bridge = Arc::new(FakeBridge::default());
        bridge
            .props
            .lock()
            .unwrap()
            .insert("dev.bootcomplete".to_string(), "1".to_string());

        let err = manager(bridge)
            .wait_ready(Some("emulator-5554"), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "timeout");
        assert!(err.to_string().contains("init.svc.bootanim"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_discovery_window() {
        let bridge = Arc::new(FakeBridge::default());
        let err = manager(bridge)
            .wait_ready(None, Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Timeout { waited_secs: 60, .. }));
    }

    #[tokio::test]
    async fn test_stop_falls_back_to_power_off() {
        let bridge = Arc::new(FakeBridge::default());
        manager(bridge.clone()).stop(Some("emulator-5554")).await;
        assert_eq!(bridge.power_offs.load(Ordering::SeqCst), 1);

        let acknowledged = Arc::new(FakeBridge {
            kill_acknowledged: true,
            ..Default::default()
        });
        manager(acknowledged.clone()).stop(Some("emulator-5554")).await;
        assert_eq!(acknowledged.power_offs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_verify_attached() {
        let bridge = Arc::new(FakeBridge::default());
        bridge.attached.lock().unwrap().push("emulator-5556".to_string());
        let devices = manager(bridge);

        devices.verify_attached("emulator-5556").await.unwrap();
        let err = devices.verify_attached("emulator-5554").await.unwrap_err();
        assert_eq!(err.reason_code(), "device_mismatch");
    }

    #[test]
    fn test_parse_devices() {
        let output = "List of devices attached\nemulator-5554\tdevice\nemulator-5556\toffline\n\nR58M123\tunauthorized\n";
        assert_eq!(parse_devices(output), vec!["emulator-5554"]);
    }

    #[test]
    fn test_launch_args() {
        let bridge = AdbBridge::new(&EmulatorConfig {
            sdk_root: Some(PathBuf::from("/sdk")),
            headless: true,
            no_snapshot: true,
            settle: Duration::ZERO,
            boot_timeout: Duration::from_secs(300),
        });
        assert_eq!(
            bridge.launch_args("Nexus_5_API_31_Clone1", 5574),
            vec![
                "-avd",
                "Nexus_5_API_31_Clone1",
                "-port",
                "5574",
                "-no-window",
                "-no-snapshot",
                "-no-boot-anim",
                "-no-audio",
                "-gpu",
                "swiftshader_indirect"
            ]
        );
        assert_eq!(bridge.adb, PathBuf::from("/sdk/platform-tools/adb"));
    }
}
