//! Collaborators a group runner drives per assignee: the automation job
//! itself and artifact capture around it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::RunnerConfig;
use crate::driver::DriverSession;
use crate::error::Result;
use crate::registry::Assignee;

/// Executes one assignee's job over a driver session.
#[async_trait]
pub trait Automation: Send + Sync {
    /// Returns whether the job succeeded. Errors mean the job could not run.
    async fn execute(&self, session: &dyn DriverSession, assignee: &Assignee) -> Result<bool>;
}

/// Waits for a fixed duration and reports success.
#[derive(Debug, Clone)]
pub struct IdleAutomation {
    duration: Duration,
}

impl IdleAutomation {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Automation for IdleAutomation {
    async fn execute(&self, session: &dyn DriverSession, assignee: &Assignee) -> Result<bool> {
        debug!(
            session = session.id(),
            assignee = %assignee.id,
            duration_ms = self.duration.as_millis() as u64,
            "idle automation"
        );
        tokio::time::sleep(self.duration).await;
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub time_limit_secs: u32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            time_limit_secs: 120,
        }
    }
}

/// Records an artifact around an assignee's job.
#[async_trait]
pub trait ArtifactCapture: Send + Sync {
    async fn begin(&self, session: &dyn DriverSession, options: CaptureOptions) -> Result<()>;

    /// Stop capturing and store the artifact under `name`. Returns its path.
    async fn end(&self, session: &dyn DriverSession, name: &str) -> Result<PathBuf>;
}

/// Screen recording through the driver, stored as `<dir>/<name>.mp4`.
#[derive(Debug, Clone)]
pub struct ScreenRecorder {
    dir: PathBuf,
}

impl ScreenRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(&config.recordings_dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.mp4"))
    }
}

#[async_trait]
impl ArtifactCapture for ScreenRecorder {
    async fn begin(&self, session: &dyn DriverSession, options: CaptureOptions) -> Result<()> {
        session.start_recording(options.time_limit_secs).await
    }

    async fn end(&self, session: &dyn DriverSession, name: &str) -> Result<PathBuf> {
        let video = session.stop_recording().await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(name);
        tokio::fs::write(&path, &video).await?;
        info!(path = %path.display(), bytes = video.len(), "Recording saved");
        Ok(path)
    }
}

/// Deterministic artifact name: `<identifier>_<assignee>_<YYYYmmdd_HHMMSS>`.
///
/// Path separators and `..` in the assignee id become `_`, so the name
/// always stays a single file inside the recordings directory.
pub fn artifact_name(
    identifier: &str,
    assignee_id: &str,
    at: chrono::DateTime<chrono::Utc>,
) -> String {
    let assignee = assignee_id.replace(['/', '\\'], "_").replace("..", "_");
    format!("{identifier}_{assignee}_{}", at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::registry::AssigneeStatus;

    /// Session that records calls and returns a fixed video.
    #[derive(Default)]
    pub(crate) struct StubSession {
        pub recordings: AtomicUsize,
    }

    #[async_trait]
    impl DriverSession for StubSession {
        fn id(&self) -> &str {
            "stub"
        }

        async fn reset_app(&self, _package: &str) -> Result<()> {
            Ok(())
        }

        async fn start_recording(&self, _time_limit_secs: u32) -> Result<()> {
            self.recordings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_recording(&self) -> Result<Vec<u8>> {
            Ok(b"mp4".to_vec())
        }

        async fn quit(&self) -> Result<()> {
            Ok(())
        }
    }

    fn assignee(id: &str) -> Assignee {
        Assignee {
            id: id.to_string(),
            payload: serde_json::Value::Null,
            unit_name: Some("u1".to_string()),
            status: AssigneeStatus::Active,
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_artifact_name_format() {
        let at = chrono::Utc.with_ymd_and_hms(2025, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(
            artifact_name("emulator-5554", "alice", at),
            "emulator-5554_alice_20250307_090501"
        );
    }

    #[tokio::test]
    async fn test_hostile_assignee_id_stays_in_recordings_dir() {
        let at = chrono::Utc.with_ymd_and_hms(2025, 3, 7, 9, 5, 1).unwrap();
        let name = artifact_name("emulator-5554", "../../etc/x\\y", at);
        assert_eq!(name, "emulator-5554_____etc_x_y_20250307_090501");

        let dir = TempDir::new().unwrap();
        let recordings = dir.path().join("recordings");
        let recorder = ScreenRecorder::new(&recordings);
        let session = StubSession::default();
        recorder
            .begin(&session, CaptureOptions::default())
            .await
            .unwrap();
        let path = recorder.end(&session, &name).await.unwrap();
        assert_eq!(path.parent(), Some(recordings.as_path()));
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn test_screen_recorder_writes_file() {
        let dir = TempDir::new().unwrap();
        let recorder = ScreenRecorder::new(dir.path().join("recordings"));
        let session = Arc::new(StubSession::default());

        recorder
            .begin(session.as_ref(), CaptureOptions::default())
            .await
            .unwrap();
        let path = recorder.end(session.as_ref(), "clip").await.unwrap();

        assert_eq!(path, dir.path().join("recordings").join("clip.mp4"));
        assert_eq!(std::fs::read(&path).unwrap(), b"mp4");
        assert_eq!(session.recordings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_automation_succeeds() {
        let automation = IdleAutomation::new(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let ok = automation
            .execute(&StubSession::default(), &assignee("bob"))
            .await
            .unwrap();
        assert!(ok);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
