//! Per-server panel operations.

use std::sync::Arc;

use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cookies::SERVER_COOKIE;
use crate::error::AternosError;
use crate::gateway::{ChallengeGateway, ChallengeResponse, ExchangeRequest};
use crate::stream::multiplexer::{ConfirmHook, StreamMultiplexer, StreamOptions};

/// Numeric lifecycle states reported by the panel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ServerStatus {
    Off,
    On,
    Starting,
    Shutdown,
    Loading,
    Error,
    /// Queued and waiting for preparation or confirmation.
    Preparing,
    Unknown(i64),
}

impl ServerStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Off,
            1 => Self::On,
            2 => Self::Starting,
            3 => Self::Shutdown,
            6 => Self::Loading,
            7 => Self::Error,
            10 => Self::Preparing,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::Starting => 2,
            Self::Shutdown => 3,
            Self::Loading => 6,
            Self::Error => 7,
            Self::Preparing => 10,
            Self::Unknown(code) => code,
        }
    }
}

/// Server info object returned by `status.php` and the status stream.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerInfo(Value);

impl ServerInfo {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn from_value(value: &Value) -> Self {
        Self(value.clone())
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    pub fn into_raw(self) -> Value {
        self.0
    }

    fn str_field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    fn int_field(&self, name: &str) -> Option<i64> {
        let value = self.0.get(name)?;
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_code(self.int_field("status").unwrap_or(-1))
    }

    /// CSS class of the status label, e.g. `online` or `queueing`.
    pub fn css_class(&self) -> Option<&str> {
        self.str_field("class")
    }

    /// Localized status text.
    pub fn status_text(&self) -> Option<&str> {
        self.str_field("lang")
    }

    pub fn address(&self) -> Option<&str> {
        self.str_field("displayAddress")
    }

    pub fn domain(&self) -> Option<&str> {
        self.str_field("ip")
    }

    pub fn port(&self) -> Option<i64> {
        self.int_field("port")
    }

    pub fn software(&self) -> Option<&str> {
        self.str_field("software")
    }

    pub fn version(&self) -> Option<&str> {
        self.str_field("version")
    }

    pub fn is_bedrock(&self) -> bool {
        self.0
            .get("bedrock")
            .map(|value| value.as_bool().unwrap_or(value.as_i64().unwrap_or(0) != 0))
            .unwrap_or(false)
    }

    pub fn players_count(&self) -> Option<i64> {
        self.int_field("players")
    }

    pub fn slots(&self) -> Option<i64> {
        self.int_field("slots")
    }

    pub fn ram(&self) -> Option<i64> {
        self.int_field("ram")
    }

    /// Queued and waiting for the user to confirm the start.
    pub fn is_pending_confirmation(&self) -> bool {
        self.css_class() == Some("queueing")
            && self
                .0
                .get("queue")
                .and_then(|queue| queue.get("pending"))
                .and_then(Value::as_str)
                == Some("pending")
    }
}

#[derive(Debug, Deserialize)]
struct StartResult {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Handle to one server of the logged-in account.
///
/// Cheap to clone; all clones share the client's gateway.
#[derive(Clone)]
pub struct ServerHandle {
    gateway: Arc<Mutex<ChallengeGateway>>,
    id: String,
}

impl ServerHandle {
    pub(crate) fn new(gateway: Arc<Mutex<ChallengeGateway>>, id: impl Into<String>) -> Self {
        Self {
            gateway,
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> Result<ServerInfo, AternosError> {
        let response = self.request("status.php", &[]).await?;
        Ok(ServerInfo::new(response.json()?))
    }

    /// Starts the server. With `accept_eula`, an EULA refusal is answered by
    /// accepting it and retrying once.
    pub async fn start(&self, headstart: bool, accept_eula: bool) -> Result<(), AternosError> {
        let mut accept_eula = accept_eula;
        loop {
            let response = self
                .request("start.php", &[("headstart", if headstart { "1" } else { "0" })])
                .await?;
            let result: StartResult = response.json()?;
            if result.success {
                info!(event = "server_started", server = %self.id);
                return Ok(());
            }

            let reason = result.error.unwrap_or_default();
            if reason == "eula" && accept_eula {
                debug!(event = "server_start_accepting_eula", server = %self.id);
                self.eula().await?;
                accept_eula = false;
                continue;
            }
            return Err(AternosError::ServerStart { reason });
        }
    }

    /// Confirms a queued start.
    pub async fn confirm(&self) -> Result<(), AternosError> {
        self.request("confirm.php", &[]).await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<(), AternosError> {
        self.request("stop.php", &[]).await.map(|_| ())
    }

    /// Leaves the start queue.
    pub async fn cancel(&self) -> Result<(), AternosError> {
        self.request("cancel.php", &[]).await.map(|_| ())
    }

    pub async fn restart(&self) -> Result<(), AternosError> {
        self.request("restart.php", &[]).await.map(|_| ())
    }

    /// Accepts the Minecraft EULA.
    pub async fn eula(&self) -> Result<(), AternosError> {
        self.request("eula.php", &[]).await.map(|_| ())
    }

    /// Builds a stream multiplexer for this server. Call `connect` on it to
    /// open the socket. Auto-confirm goes through [`ServerHandle::confirm`].
    pub async fn stream(&self, options: StreamOptions) -> Result<StreamMultiplexer, AternosError> {
        let session_cookie = {
            let gateway = self.gateway.lock().await;
            gateway
                .session()
                .session_cookie()
                .cloned()
                .ok_or_else(|| AternosError::Credentials("not logged in".to_string()))?
        };

        let multiplexer = StreamMultiplexer::new(options, session_cookie, self.id.clone());
        let handle = self.clone();
        let hook: ConfirmHook = Arc::new(move || {
            let handle = handle.clone();
            async move { handle.confirm().await.map_err(|err| err.to_string()) }.boxed()
        });
        multiplexer.set_confirm_hook(hook);
        Ok(multiplexer)
    }

    /// Runs an authenticated exchange against `{ajax}/{endpoint}` with the
    /// server cookie attached.
    pub async fn request(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<ChallengeResponse, AternosError> {
        let mut gateway = self.gateway.lock().await;
        let url = format!("{}/{endpoint}", gateway.options().ajax_url());
        let mut request = ExchangeRequest::get(url)
            .cookie(SERVER_COOKIE, self.id.as_str())
            .send_token(true);
        for (name, value) in params {
            request = request.param(*name, *value);
        }
        gateway.exchange(request).await
    }
}
