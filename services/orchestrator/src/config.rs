//! Configuration for the orchestrator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// SQLite registry file.
    pub database_path: PathBuf,

    pub provisioner: ProvisionerConfig,
    pub slots: SlotConfig,
    pub appium: AppiumConfig,
    pub emulator: EmulatorConfig,
    pub runner: RunnerConfig,

    /// How each group is isolated from its siblings.
    pub isolation: Isolation,

    /// Use in-memory control planes, devices and sessions instead of
    /// Appium and adb.
    pub mock_infra: bool,
}

/// Where templates and clones live.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Directory holding `<name>.avd/` and `<name>.ini` pairs.
    pub avd_home: PathBuf,

    /// Name of the template environment.
    pub template: String,
}

/// Port layout of execution slots.
#[derive(Debug, Clone, Copy)]
pub struct SlotConfig {
    pub base_control_port: u16,
    pub control_port_stride: u16,
    pub base_device_port: u16,
    pub device_port_stride: u16,
}

/// Ports owned by one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPorts {
    pub control: u16,
    pub device: u16,
}

impl SlotConfig {
    /// Disjoint ports for the slot at `offset`.
    ///
    /// The device's adb port is `device + 1`, so that must fit as well.
    pub fn ports(&self, offset: usize) -> crate::Result<SlotPorts> {
        let out_of_range = || crate::FleetError::SlotOutOfRange { offset };
        let step = u16::try_from(offset).map_err(|_| out_of_range())?;
        let control = self
            .control_port_stride
            .checked_mul(step)
            .and_then(|delta| self.base_control_port.checked_add(delta))
            .ok_or_else(out_of_range)?;
        let device = self
            .device_port_stride
            .checked_mul(step)
            .and_then(|delta| self.base_device_port.checked_add(delta))
            .filter(|device| device.checked_add(1).is_some())
            .ok_or_else(out_of_range)?;
        Ok(SlotPorts { control, device })
    }
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            base_control_port: 4723,
            control_port_stride: 10,
            base_device_port: 5554,
            device_port_stride: 20,
        }
    }
}

/// Control-plane (Appium) server settings.
#[derive(Debug, Clone)]
pub struct AppiumConfig {
    pub binary: String,
    pub host: String,
    /// When false, only already-running servers are used.
    pub start_server: bool,
    pub log_dir: PathBuf,
    /// Reuse a healthy server found on the resolved port.
    pub allow_reuse: bool,
    pub startup_timeout: Duration,
}

/// Emulator settings.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Android SDK root; `emulator/emulator` and `platform-tools/adb` are resolved under it.
    pub sdk_root: Option<PathBuf>,
    pub headless: bool,
    pub no_snapshot: bool,
    /// Pause after spawning before polling for the device.
    pub settle: Duration,
    pub boot_timeout: Duration,
}

/// Group runner settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub platform_version: String,
    pub app_package: String,
    pub recordings_dir: PathBuf,
    /// Screen recording limit, in seconds.
    pub record_time_limit_secs: u32,
    /// How long the built-in idle automation stays on each assignee.
    pub idle_duration: Duration,
}

/// Group isolation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Each group runs in a child `orchestrator run-group` process.
    #[default]
    Process,
    /// Each group runs as a task inside the orchestrator.
    Task,
}

impl FromStr for Isolation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "task" => Ok(Self::Task),
            other => bail!("unknown isolation mode: {other}"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            log_level: "info".to_string(),
            database_path: PathBuf::from("emufleet.db"),
            provisioner: ProvisionerConfig {
                avd_home: default_avd_home(),
                template: "Nexus_5_API_31".to_string(),
            },
            slots: SlotConfig::default(),
            appium: AppiumConfig {
                binary: "appium".to_string(),
                host: "127.0.0.1".to_string(),
                start_server: true,
                log_dir: PathBuf::from("logs"),
                allow_reuse: true,
                startup_timeout: Duration::from_secs(90),
            },
            emulator: EmulatorConfig {
                sdk_root: None,
                headless: false,
                no_snapshot: true,
                settle: Duration::from_secs(3),
                boot_timeout: Duration::from_secs(300),
            },
            runner: RunnerConfig {
                platform_version: "12".to_string(),
                app_package: "com.instagram.android".to_string(),
                recordings_dir: PathBuf::from("recordings"),
                record_time_limit_secs: 120,
                idle_duration: Duration::from_secs(5),
            },
            isolation: Isolation::default(),
            mock_infra: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep the [`Default`] value.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let listen_addr = match std::env::var("FLEET_LISTEN_ADDR") {
            Ok(v) => v.parse()?,
            Err(_) => d.listen_addr,
        };

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or(d.log_level);

        let database_path = env_path("FLEET_DATABASE_PATH").unwrap_or(d.database_path);

        let provisioner = ProvisionerConfig {
            avd_home: env_path("FLEET_AVD_HOME")
                .or_else(|| env_path("ANDROID_AVD_HOME"))
                .unwrap_or(d.provisioner.avd_home),
            template: std::env::var("FLEET_AVD_TEMPLATE").unwrap_or(d.provisioner.template),
        };

        let slots = SlotConfig {
            base_control_port: env_parse("FLEET_APPIUM_BASE_PORT", d.slots.base_control_port),
            control_port_stride: env_parse(
                "FLEET_APPIUM_PORT_STRIDE",
                d.slots.control_port_stride,
            ),
            base_device_port: env_parse("FLEET_DEVICE_BASE_PORT", d.slots.base_device_port),
            device_port_stride: env_parse("FLEET_DEVICE_PORT_STRIDE", d.slots.device_port_stride),
        };

        let appium = AppiumConfig {
            binary: std::env::var("FLEET_APPIUM_BIN").unwrap_or(d.appium.binary),
            host: std::env::var("FLEET_APPIUM_HOST").unwrap_or(d.appium.host),
            start_server: env_flag("FLEET_START_APPIUM_SERVER", d.appium.start_server),
            log_dir: env_path("FLEET_APPIUM_LOG_DIR").unwrap_or(d.appium.log_dir),
            allow_reuse: env_flag("FLEET_APPIUM_ALLOW_REUSE", d.appium.allow_reuse),
            startup_timeout: env_secs("FLEET_APPIUM_STARTUP_TIMEOUT", d.appium.startup_timeout),
        };

        let emulator = EmulatorConfig {
            sdk_root: env_path("ANDROID_SDK_ROOT").or_else(|| env_path("ANDROID_HOME")),
            headless: env_flag("FLEET_EMULATOR_HEADLESS", d.emulator.headless),
            no_snapshot: env_flag("FLEET_EMULATOR_NO_SNAPSHOT", d.emulator.no_snapshot),
            settle: env_secs("FLEET_EMULATOR_SETTLE", d.emulator.settle),
            boot_timeout: env_secs("FLEET_BOOT_TIMEOUT", d.emulator.boot_timeout),
        };

        let runner = RunnerConfig {
            platform_version: std::env::var("FLEET_PLATFORM_VERSION")
                .unwrap_or(d.runner.platform_version),
            app_package: std::env::var("FLEET_APP_PACKAGE").unwrap_or(d.runner.app_package),
            recordings_dir: env_path("FLEET_RECORDINGS_DIR").unwrap_or(d.runner.recordings_dir),
            record_time_limit_secs: env_parse(
                "FLEET_RECORD_TIME_LIMIT",
                d.runner.record_time_limit_secs,
            ),
            idle_duration: env_secs("FLEET_IDLE_AUTOMATION_SECS", d.runner.idle_duration),
        };

        let isolation = match std::env::var("FLEET_GROUP_ISOLATION") {
            Ok(v) => v.parse()?,
            Err(_) => d.isolation,
        };

        let mock_infra = env_flag("FLEET_MOCK_INFRA", d.mock_infra);

        Ok(Self {
            listen_addr,
            log_level,
            database_path,
            provisioner,
            slots,
            appium,
            emulator,
            runner,
            isolation,
            mock_infra,
        })
    }
}

fn default_avd_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".android")
        .join("avd")
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}
