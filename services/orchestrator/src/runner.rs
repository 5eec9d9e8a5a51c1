//! Runs one group: a unit's assignees, in order, on one slot.
//!
//! Infra is acquired in order (control-plane lease, unit launch, readiness,
//! driver session) and released in reverse, each piece only if it was
//! acquired and at most once. Progress is reported as [`GroupEvent`]s
//! through a [`GroupSink`].

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use emufleet_events::GroupEvent;
use emufleet_id::SessionId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::automation::{artifact_name, ArtifactCapture, Automation, CaptureOptions};
use crate::automation::{IdleAutomation, ScreenRecorder};
use crate::config::{Config, SlotConfig};
use crate::device::DeviceManager;
use crate::driver::{DriverFactory, DriverSession, SessionTarget, WebDriverFactory};
use crate::error::Result;
use crate::lease::LeaseManager;
use crate::mock::MockDriverFactory;
use crate::registry::Assignee;

/// Work handed to a group runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupJob {
    pub session_id: SessionId,
    pub unit_name: String,
    pub offset: usize,
    pub assignees: Vec<Assignee>,
}

/// Receives a runner's progress.
pub trait GroupSink: Send + Sync {
    fn emit(&self, event: GroupEvent);
}

/// Writes one JSON line per event to stdout, for a parent process to read.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl GroupSink for StdoutSink {
    fn emit(&self, event: GroupEvent) {
        let line = match event.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to encode group event");
                return;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
            error!(error = %e, "Failed to write group event");
        }
    }
}

/// Forwards events to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<GroupEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<GroupEvent>) -> Self {
        Self { tx }
    }
}

impl GroupSink for ChannelSink {
    fn emit(&self, event: GroupEvent) {
        // The consumer only goes away when the group is being torn down.
        let _ = self.tx.send(event);
    }
}

/// Runner settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub host: String,
    pub slots: SlotConfig,
    pub boot_timeout: Duration,
    pub platform_version: String,
    pub app_package: String,
    pub capture: CaptureOptions,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.appium.host.clone(),
            slots: config.slots,
            boot_timeout: config.emulator.boot_timeout,
            platform_version: config.runner.platform_version.clone(),
            app_package: config.runner.app_package.clone(),
            capture: CaptureOptions {
                time_limit_secs: config.runner.record_time_limit_secs,
            },
        }
    }
}

/// What has been acquired so far, so teardown releases exactly that.
#[derive(Default)]
struct Infra {
    control_port: Option<u16>,
    identifier: Option<String>,
    session: Option<Box<dyn DriverSession>>,
}

pub struct GroupRunner {
    leases: Arc<LeaseManager>,
    devices: Arc<DeviceManager>,
    drivers: Arc<dyn DriverFactory>,
    automation: Arc<dyn Automation>,
    capture: Arc<dyn ArtifactCapture>,
    settings: RunnerSettings,
}

impl GroupRunner {
    pub fn new(
        leases: Arc<LeaseManager>,
        devices: Arc<DeviceManager>,
        drivers: Arc<dyn DriverFactory>,
        automation: Arc<dyn Automation>,
        capture: Arc<dyn ArtifactCapture>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            leases,
            devices,
            drivers,
            automation,
            capture,
            settings,
        }
    }

    /// Build a runner with the built-in collaborators for `config`.
    pub fn from_config(config: &Config, leases: Arc<LeaseManager>) -> Result<Self> {
        let drivers: Arc<dyn DriverFactory> = if config.mock_infra {
            Arc::new(MockDriverFactory::new())
        } else {
            Arc::new(WebDriverFactory::new()?)
        };
        Ok(Self::new(
            leases,
            Arc::new(DeviceManager::from_config(config)),
            drivers,
            Arc::new(IdleAutomation::new(config.runner.idle_duration)),
            Arc::new(ScreenRecorder::from_config(&config.runner)),
            RunnerSettings::from_config(config),
        ))
    }

    /// Run `job` to completion.
    ///
    /// Returns an error only when the group's infra could not be brought
    /// up; failing assignees are reported and skipped.
    pub async fn run(&self, job: &GroupJob, sink: &dyn GroupSink) -> Result<()> {
        let unit = job.unit_name.as_str();
        info!(
            session_id = %job.session_id,
            unit = %unit,
            offset = job.offset,
            assignees = job.assignees.len(),
            "Group started"
        );
        sink.emit(GroupEvent::Started {
            unit: unit.to_string(),
            assignees: job.assignees.len(),
            offset: job.offset,
        });

        let mut infra = Infra::default();
        let result = self.run_with(job, &mut infra, sink).await;
        match &result {
            Ok(()) => {
                info!(unit = %unit, "Group finished");
                sink.emit(GroupEvent::Finished {
                    unit: unit.to_string(),
                });
            }
            Err(e) => {
                error!(unit = %unit, error = %e, "Group failed");
                sink.emit(GroupEvent::Error {
                    unit: unit.to_string(),
                    reason_code: e.reason_code().to_string(),
                    error: e.to_string(),
                });
            }
        }

        self.teardown(unit, infra).await;
        sink.emit(GroupEvent::InfraStopped {
            unit: unit.to_string(),
        });
        result
    }

    async fn run_with(&self, job: &GroupJob, infra: &mut Infra, sink: &dyn GroupSink) -> Result<()> {
        let unit = job.unit_name.as_str();
        let host = self.settings.host.as_str();
        let ports = self.settings.slots.ports(job.offset)?;

        let control_port = self.leases.acquire(host, Some(ports.control)).await?;
        infra.control_port = Some(control_port);

        let identifier = self.devices.launch(unit, Some(ports.device)).await?;
        infra.identifier = Some(identifier.clone());
        self.devices
            .wait_ready(Some(&identifier), self.settings.boot_timeout)
            .await?;
        self.devices.verify_attached(&identifier).await?;

        sink.emit(GroupEvent::InfraStarted {
            unit: unit.to_string(),
            identifier: identifier.clone(),
            control_port,
        });

        let target = SessionTarget {
            endpoint: format!("http://{host}:{control_port}"),
            unit_name: unit.to_string(),
            identifier: identifier.clone(),
            platform_version: self.settings.platform_version.clone(),
            app_package: self.settings.app_package.clone(),
        };
        let session = infra.session.insert(self.drivers.create(&target).await?);

        for assignee in &job.assignees {
            self.run_assignee(unit, &identifier, session.as_ref(), assignee, sink)
                .await;
        }
        Ok(())
    }

    async fn run_assignee(
        &self,
        unit: &str,
        identifier: &str,
        session: &dyn DriverSession,
        assignee: &Assignee,
        sink: &dyn GroupSink,
    ) {
        info!(unit = %unit, assignee = %assignee.id, "Assignee started");
        sink.emit(GroupEvent::AssigneeStarted {
            unit: unit.to_string(),
            assignee_id: assignee.id.clone(),
        });

        if let Err(e) = session.reset_app(&self.settings.app_package).await {
            warn!(unit = %unit, assignee = %assignee.id, error = %e, "App reset failed");
        }

        match self.execute_recorded(identifier, session, assignee).await {
            Ok((succeeded, artifact)) => {
                info!(unit = %unit, assignee = %assignee.id, succeeded, "Assignee finished");
                sink.emit(GroupEvent::AssigneeFinished {
                    unit: unit.to_string(),
                    assignee_id: assignee.id.clone(),
                    succeeded,
                    artifact: artifact.map(|p| p.display().to_string()),
                });
            }
            Err(e) => {
                warn!(unit = %unit, assignee = %assignee.id, error = %e, "Assignee failed");
                sink.emit(GroupEvent::AssigneeError {
                    unit: unit.to_string(),
                    assignee_id: assignee.id.clone(),
                    reason_code: e.reason_code().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Execute with capture around it. The capture is ended even when the
    /// job errors; a failed capture only loses the artifact.
    async fn execute_recorded(
        &self,
        identifier: &str,
        session: &dyn DriverSession,
        assignee: &Assignee,
    ) -> Result<(bool, Option<PathBuf>)> {
        self.capture.begin(session, self.settings.capture).await?;
        let outcome = self.automation.execute(session, assignee).await;

        let name = artifact_name(identifier, &assignee.id, Utc::now());
        let artifact = match self.capture.end(session, &name).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(assignee = %assignee.id, error = %e, "Capture not stored");
                None
            }
        };

        Ok((outcome?, artifact))
    }

    async fn teardown(&self, unit: &str, infra: Infra) {
        if let Some(session) = infra.session {
            if let Err(e) = session.quit().await {
                warn!(unit = %unit, error = %e, "Driver quit failed");
            }
        }
        if let Some(identifier) = infra.identifier {
            self.devices.stop(Some(&identifier)).await;
        }
        if let Some(port) = infra.control_port {
            self.leases.release(&self.settings.host, port).await;
        }
        info!(unit = %unit, "Group infra stopped");
    }
}

impl std::fmt::Debug for GroupRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRunner")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::error::FleetError;
    use crate::lease::LeaseConfig;
    use crate::mock::{MockBridge, MockControlPlane};
    use crate::registry::AssigneeStatus;

    #[derive(Default)]
    struct VecSink(Mutex<Vec<GroupEvent>>);

    impl VecSink {
        fn kinds(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().iter().map(|e| e.event_type()).collect()
        }
    }

    impl GroupSink for VecSink {
        fn emit(&self, event: GroupEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    /// Succeeds unless the assignee is listed, and errors for "boom".
    struct ScriptedAutomation {
        fail: HashSet<String>,
    }

    #[async_trait]
    impl Automation for ScriptedAutomation {
        async fn execute(&self, _session: &dyn DriverSession, assignee: &Assignee) -> Result<bool> {
            if assignee.id == "boom" {
                return Err(FleetError::Driver("element not found".to_string()));
            }
            Ok(!self.fail.contains(&assignee.id))
        }
    }

    struct Harness {
        plane: Arc<MockControlPlane>,
        bridge: Arc<MockBridge>,
        drivers: Arc<MockDriverFactory>,
        runner: GroupRunner,
        _dir: TempDir,
    }

    fn harness(bridge: MockBridge, drivers: MockDriverFactory, fail: &[&str]) -> Harness {
        let dir = TempDir::new().unwrap();
        let plane = Arc::new(MockControlPlane::new());
        let bridge = Arc::new(bridge);
        let drivers = Arc::new(drivers);
        let leases = Arc::new(LeaseManager::new(
            plane.clone(),
            LeaseConfig {
                base_port: 4723,
                start_server: true,
                allow_reuse: true,
                startup_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(10),
            },
        ));
        let runner = GroupRunner::new(
            leases,
            Arc::new(DeviceManager::new(bridge.clone(), 5554, Duration::ZERO)),
            drivers.clone(),
            Arc::new(ScriptedAutomation {
                fail: fail.iter().map(|s| s.to_string()).collect(),
            }),
            Arc::new(ScreenRecorder::new(dir.path())),
            RunnerSettings {
                host: "127.0.0.1".to_string(),
                slots: SlotConfig::default(),
                boot_timeout: Duration::from_secs(5),
                platform_version: "12".to_string(),
                app_package: "com.example.app".to_string(),
                capture: CaptureOptions::default(),
            },
        );
        Harness {
            plane,
            bridge,
            drivers,
            runner,
            _dir: dir,
        }
    }

    fn job(offset: usize, ids: &[&str]) -> GroupJob {
        GroupJob {
            session_id: SessionId::new(),
            unit_name: "Nexus_5_API_31_Clone1".to_string(),
            offset,
            assignees: ids
                .iter()
                .map(|id| Assignee {
                    id: id.to_string(),
                    payload: serde_json::Value::Null,
                    unit_name: Some("Nexus_5_API_31_Clone1".to_string()),
                    status: AssigneeStatus::Pending,
                    updated_at: Utc::now(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_group_runs_each_assignee_on_slot_ports() {
        let h = harness(MockBridge::new(), MockDriverFactory::new(), &[]);
        let sink = VecSink::default();

        h.runner.run(&job(1, &["alice", "bob"]), &sink).await.unwrap();

        assert_eq!(
            sink.kinds(),
            vec![
                "group.started",
                "group.infra_started",
                "assignee.started",
                "assignee.finished",
                "assignee.started",
                "assignee.finished",
                "group.finished",
                "group.infra_stopped",
            ]
        );
        let events = sink.0.lock().unwrap();
        assert!(matches!(
            &events[1],
            GroupEvent::InfraStarted { identifier, control_port: 4733, .. }
                if identifier == "emulator-5574"
        ));
        match &events[3] {
            GroupEvent::AssigneeFinished {
                succeeded,
                artifact: Some(path),
                ..
            } => {
                assert!(*succeeded);
                assert!(path.contains("emulator-5574_alice_"));
                assert!(path.ends_with(".mp4"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert_eq!(h.bridge.spawned(), vec![("Nexus_5_API_31_Clone1".to_string(), 5574)]);
        assert_eq!(h.bridge.kills(), 1);
        assert_eq!(h.plane.stops(), 1);
        assert_eq!(h.drivers.quits(), 1);
    }

    #[tokio::test]
    async fn test_failing_assignee_does_not_stop_group() {
        let h = harness(MockBridge::new(), MockDriverFactory::new(), &["bob"]);
        let sink = VecSink::default();

        h.runner
            .run(&job(0, &["alice", "boom", "bob", "carol"]), &sink)
            .await
            .unwrap();

        let events = sink.0.lock().unwrap();
        let outcomes: Vec<(String, Option<bool>)> = events
            .iter()
            .filter_map(|e| match e {
                GroupEvent::AssigneeFinished {
                    assignee_id,
                    succeeded,
                    ..
                } => Some((assignee_id.clone(), Some(*succeeded))),
                GroupEvent::AssigneeError { assignee_id, .. } => Some((assignee_id.clone(), None)),
                _ => None,
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("alice".to_string(), Some(true)),
                ("boom".to_string(), None),
                ("bob".to_string(), Some(false)),
                ("carol".to_string(), Some(true)),
            ]
        );
        assert!(matches!(events.last(), Some(GroupEvent::InfraStopped { .. })));
    }

    #[tokio::test]
    async fn test_already_running_releases_lease_once() {
        let h = harness(
            MockBridge::with_stray_device("emulator-5600", 1),
            MockDriverFactory::new(),
            &[],
        );
        let sink = VecSink::default();

        let err = h.runner.run(&job(0, &["alice"]), &sink).await.unwrap_err();
        assert_eq!(err.reason_code(), "already_running");
        assert_eq!(
            sink.kinds(),
            vec!["group.started", "group.error", "group.infra_stopped"]
        );
        assert_eq!(h.plane.spawns(), 1);
        assert_eq!(h.plane.stops(), 1);
        assert!(h.bridge.spawned().is_empty());
        assert_eq!(h.bridge.kills(), 0);
        assert_eq!(h.drivers.created(), 0);

        // The stray device is gone, so the next group gets through.
        let sink = VecSink::default();
        h.runner.run(&job(0, &["bob"]), &sink).await.unwrap();
        assert_eq!(h.plane.stops(), 2);
    }

    #[tokio::test]
    async fn test_session_failure_stops_launched_unit() {
        let h = harness(MockBridge::new(), MockDriverFactory::failing(), &[]);
        let sink = VecSink::default();

        let err = h.runner.run(&job(0, &["alice"]), &sink).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "driver_error: mock session refused for emulator-5554"
        );
        assert_eq!(
            sink.kinds(),
            vec![
                "group.started",
                "group.infra_started",
                "group.error",
                "group.infra_stopped",
            ]
        );
        assert_eq!(h.bridge.kills(), 1);
        assert_eq!(h.plane.stops(), 1);
        assert_eq!(h.drivers.quits(), 0);
    }
}
