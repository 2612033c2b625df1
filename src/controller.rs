//! Control-plane API client: app configuration, release registration,
//! health checks.
//!
//! The wire client is deliberately thin; everything the pipeline needs
//! goes through [`ControllerClient`] so tests can swap in
//! [`FakeController`].

use crate::errors::ControllerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// API version this builder speaks. Compared against the version the
/// controller reports on every response.
pub const API_VERSION: &str = "2.3";

/// Header carrying the builder key on hook requests.
pub const BUILDER_AUTH_HEADER: &str = "X-Slipway-Builder-Auth";

/// Header the controller answers with on every response.
pub const API_VERSION_HEADER: &str = "X-Slipway-Api-Version";

/// Scope name for configuration values that apply to the whole app
/// rather than a single process type.
pub const GLOBAL_SCOPE: &str = "global";

/// One configuration value, scoped either globally or to a process type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValue {
    pub group: String,
    pub name: String,
    pub value: String,
}

/// Application configuration as reported by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub values: Vec<ConfigValue>,
}

impl AppConfig {
    /// Look up a globally scoped value by name.
    pub fn global(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.group == GLOBAL_SCOPE && v.name == name)
            .map(|v| v.value.as_str())
    }

    /// All globally scoped values as an ordered map.
    pub fn global_map(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter(|v| v.group == GLOBAL_SCOPE)
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }
}

/// Everything the controller needs to register a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub image: String,
    pub stack: String,
    pub sha: String,
    pub proc_types: BTreeMap<String, String>,
    pub dockerfile: String,
}

/// A controller response value together with the API version the server
/// reported for it.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub value: T,
    pub api_version: String,
}

impl<T> ApiResponse<T> {
    pub fn current(value: T) -> Self {
        Self {
            value,
            api_version: API_VERSION.to_string(),
        }
    }
}

/// Compare the reported API version against ours. A mismatch is worth a
/// warning but never fatal; returns whether the versions matched.
pub fn check_api_compat<T>(resp: &ApiResponse<T>) -> bool {
    if resp.api_version != API_VERSION {
        tracing::warn!(
            builder = API_VERSION,
            controller = %resp.api_version,
            "builder and controller API versions do not match"
        );
        return false;
    }
    true
}

#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn get_app_config(
        &self,
        builder_key: &str,
        username: &str,
        app: &str,
    ) -> Result<ApiResponse<AppConfig>, ControllerError>;

    async fn create_release(
        &self,
        builder_key: &str,
        username: &str,
        app: &str,
        build: &ReleaseRequest,
    ) -> Result<ApiResponse<i64>, ControllerError>;

    async fn healthcheck(&self) -> Result<ApiResponse<()>, ControllerError>;
}

/// HTTP client for the in-cluster controller service.
pub struct HttpControllerClient {
    base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct BuildHookResponse {
    release: ReleaseRef,
}

#[derive(Deserialize)]
struct ReleaseRef {
    version: i64,
}

#[derive(Serialize)]
struct BuildHookRequest<'a> {
    app: &'a str,
    #[serde(rename = "receiveUser")]
    receive_user: &'a str,
    #[serde(flatten)]
    build: &'a ReleaseRequest,
}

impl HttpControllerClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base: format!("http://{host}:{port}"),
            client: reqwest::Client::new(),
        }
    }

    fn api_version_of(resp: &reqwest::Response) -> String {
        resp.headers()
            .get(API_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string()
    }

    async fn fail_from(resp: reqwest::Response) -> ControllerError {
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        ControllerError::Api { status, message }
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn get_app_config(
        &self,
        builder_key: &str,
        username: &str,
        app: &str,
    ) -> Result<ApiResponse<AppConfig>, ControllerError> {
        let url = format!("{}/v2/hooks/config/{app}/", self.base);
        let resp = self
            .client
            .get(&url)
            .header(BUILDER_AUTH_HEADER, builder_key)
            .header("X-Slipway-User", username)
            .send()
            .await
            .map_err(|err| ControllerError::Request(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::fail_from(resp).await);
        }
        let api_version = Self::api_version_of(&resp);
        let value = resp
            .json::<AppConfig>()
            .await
            .map_err(|err| ControllerError::Request(err.to_string()))?;
        Ok(ApiResponse { value, api_version })
    }

    async fn create_release(
        &self,
        builder_key: &str,
        username: &str,
        app: &str,
        build: &ReleaseRequest,
    ) -> Result<ApiResponse<i64>, ControllerError> {
        let url = format!("{}/v2/hooks/build/", self.base);
        let resp = self
            .client
            .post(&url)
            .header(BUILDER_AUTH_HEADER, builder_key)
            .json(&BuildHookRequest {
                app,
                receive_user: username,
                build,
            })
            .send()
            .await
            .map_err(|err| ControllerError::Request(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::fail_from(resp).await);
        }
        let api_version = Self::api_version_of(&resp);
        let value = resp
            .json::<BuildHookResponse>()
            .await
            .map_err(|err| ControllerError::Request(err.to_string()))?;
        Ok(ApiResponse {
            value: value.release.version,
            api_version,
        })
    }

    async fn healthcheck(&self) -> Result<ApiResponse<()>, ControllerError> {
        let url = format!("{}/v2/healthz", self.base);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ControllerError::Request(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::fail_from(resp).await);
        }
        let api_version = Self::api_version_of(&resp);
        Ok(ApiResponse {
            value: (),
            api_version,
        })
    }
}

/// Scriptable controller double used by the builder's own tests.
pub struct FakeController {
    pub app_config: AppConfig,
    pub release_version: i64,
    pub api_version: String,
    /// When set, `create_release` fails with this message.
    pub fail_release: Option<String>,
    /// When set, `healthcheck` fails with this message.
    pub fail_healthcheck: Option<String>,
    pub calls: Mutex<Vec<String>>,
    pub releases: Mutex<Vec<ReleaseRequest>>,
}

impl Default for FakeController {
    fn default() -> Self {
        Self {
            app_config: AppConfig::default(),
            release_version: 1,
            api_version: API_VERSION.to_string(),
            fail_release: None,
            fail_healthcheck: None,
            calls: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
        }
    }
}

impl FakeController {
    fn record(&self, call: &str) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.to_string());
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ControllerClient for FakeController {
    async fn get_app_config(
        &self,
        _builder_key: &str,
        _username: &str,
        _app: &str,
    ) -> Result<ApiResponse<AppConfig>, ControllerError> {
        self.record("get_app_config");
        Ok(ApiResponse {
            value: self.app_config.clone(),
            api_version: self.api_version.clone(),
        })
    }

    async fn create_release(
        &self,
        _builder_key: &str,
        _username: &str,
        _app: &str,
        build: &ReleaseRequest,
    ) -> Result<ApiResponse<i64>, ControllerError> {
        self.record("create_release");
        if let Some(message) = &self.fail_release {
            return Err(ControllerError::Request(message.clone()));
        }
        self.releases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(build.clone());
        Ok(ApiResponse {
            value: self.release_version,
            api_version: self.api_version.clone(),
        })
    }

    async fn healthcheck(&self) -> Result<ApiResponse<()>, ControllerError> {
        self.record("healthcheck");
        if let Some(message) = &self.fail_healthcheck {
            return Err(ControllerError::Request(message.clone()));
        }
        Ok(ApiResponse {
            value: (),
            api_version: self.api_version.clone(),
        })
    }
}
