//! Driver sessions against a control-plane server.
//!
//! The built-in implementation speaks the W3C WebDriver protocol with the
//! Appium extensions used between assignees (app reset and screen
//! recording).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{FleetError, Result};

const SESSION_TIMEOUT: Duration = Duration::from_secs(300);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// What a session is created against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    /// Base URL of the control-plane server, e.g. `http://127.0.0.1:4723`.
    pub endpoint: String,
    pub unit_name: String,
    /// Device serial the session drives.
    pub identifier: String,
    pub platform_version: String,
    pub app_package: String,
}

/// One working session bound to a control plane and a unit.
#[async_trait]
pub trait DriverSession: Send + Sync {
    fn id(&self) -> &str;

    /// Terminate and relaunch the target app.
    async fn reset_app(&self, package: &str) -> Result<()>;

    async fn start_recording(&self, time_limit_secs: u32) -> Result<()>;

    /// Stop recording and return the encoded video.
    async fn stop_recording(&self) -> Result<Vec<u8>>;

    async fn quit(&self) -> Result<()>;
}

#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self, target: &SessionTarget) -> Result<Box<dyn DriverSession>>;
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSession {
    session_id: String,
}

/// Creates WebDriver sessions over HTTP.
#[derive(Clone)]
pub struct WebDriverFactory {
    http: reqwest::Client,
}

impl WebDriverFactory {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder().timeout(SESSION_TIMEOUT).build()?;
        Ok(Self { http })
    }
}

/// Capabilities requested for a session on `target`.
pub fn capabilities(target: &SessionTarget) -> Value {
    json!({
        "capabilities": {
            "alwaysMatch": {
                "platformName": "Android",
                "appium:automationName": "UiAutomator2",
                "appium:deviceName": target.unit_name,
                "appium:udid": target.identifier,
                "appium:platformVersion": target.platform_version,
                "appium:appPackage": target.app_package,
                "appium:autoGrantPermissions": true,
                "appium:noReset": true,
                "appium:newCommandTimeout": SESSION_TIMEOUT.as_secs(),
            },
            "firstMatch": [{}],
        }
    })
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn create(&self, target: &SessionTarget) -> Result<Box<dyn DriverSession>> {
        let url = format!("{}/session", target.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&capabilities(target))
            .send()
            .await?;
        let value = read_value(response).await?;
        let session: NewSession = serde_json::from_value(value)
            .map_err(|e| FleetError::Driver(format!("unexpected new session response: {e}")))?;

        info!(
            unit = %target.unit_name,
            identifier = %target.identifier,
            session = %session.session_id,
            "Driver session created"
        );
        Ok(Box::new(AppiumSession {
            http: self.http.clone(),
            base: format!(
                "{}/session/{}",
                target.endpoint.trim_end_matches('/'),
                session.session_id
            ),
            id: session.session_id,
        }))
    }
}

/// A live WebDriver session.
pub struct AppiumSession {
    http: reqwest::Client,
    base: String,
    id: String,
}

impl AppiumSession {
    async fn command(&self, path: &str, body: Value) -> Result<Value> {
        debug!(session = %self.id, path, "driver command");
        let response = self
            .http
            .post(format!("{}/{path}", self.base))
            .timeout(COMMAND_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        read_value(response).await
    }
}

#[async_trait]
impl DriverSession for AppiumSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn reset_app(&self, package: &str) -> Result<()> {
        self.command("appium/device/terminate_app", json!({ "appId": package }))
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.command("appium/device/activate_app", json!({ "appId": package }))
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn start_recording(&self, time_limit_secs: u32) -> Result<()> {
        self.command(
            "appium/start_recording_screen",
            json!({ "options": { "timeLimit": time_limit_secs.to_string() } }),
        )
        .await?;
        Ok(())
    }

    async fn stop_recording(&self) -> Result<Vec<u8>> {
        let value = self
            .command("appium/stop_recording_screen", json!({ "options": {} }))
            .await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| FleetError::Driver("recording response is not a string".to_string()))?;
        decode_video(encoded)
    }

    async fn quit(&self) -> Result<()> {
        let response = self
            .http
            .delete(&self.base)
            .timeout(COMMAND_TIMEOUT)
            .send()
            .await?;
        read_value(response).await?;
        info!(session = %self.id, "Driver session closed");
        Ok(())
    }
}

async fn read_value(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: WireResponse = response.json().await?;
    if !status.is_success() {
        let message = body
            .value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message");
        return Err(FleetError::Driver(format!("{status}: {message}")));
    }
    Ok(body.value)
}

/// Decode a base64 video, tolerating line breaks.
pub fn decode_video(encoded: &str) -> Result<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| FleetError::Driver(format!("invalid recording payload: {e}")))
}
