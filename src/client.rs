//! Account-level entry point: login, logout, session persistence, the
//! servers list and account settings.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::{Digest, Md5};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AternosError;
use crate::gateway::{ChallengeGateway, ChallengeResponse, ExchangeRequest, GatewayOptions};
use crate::html::{cached_regex, server_ids, CachedRegex};
use crate::server::ServerHandle;
use crate::token::extract::TokenExtractor;

const TWO_FACTOR_MARKER: &str = "\"show2FA\":true";
const SESSION_FILE_PREFIX: &str = ".at_";
const QR_CODE_PREFIX: &str = "data:image/png;base64,";

static EMAIL: CachedRegex = OnceLock::new();

fn email_regex() -> Result<&'static Regex, regex::Error> {
    cached_regex(
        &EMAIL,
        r"^[A-Za-z0-9\-_+.]+@[A-Za-z0-9\-_+.]+\.[A-Za-z0-9\-]+$|^$",
    )
}

/// Lowercase hex MD5 digest, the form the login endpoint expects.
pub fn hash_password(password: &SecretString) -> SecretString {
    let digest = Md5::digest(password.expose_secret().as_bytes());
    SecretString::new(format!("{digest:x}"))
}

/// Session file name for `username` inside `sessions_dir`. Characters
/// outside `[A-Za-z0-9_-]` are replaced with `_`.
pub fn session_filename(username: &str, sessions_dir: impl AsRef<Path>) -> PathBuf {
    let safe: String = username
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    sessions_dir
        .as_ref()
        .join(format!("{SESSION_FILE_PREFIX}{safe}"))
}

/// Removes a session file. A missing or undeletable file is only logged.
pub async fn remove_session(path: impl AsRef<Path>) {
    let path = path.as_ref();
    debug!(event = "session_file_removing", path = %path.display());
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!(event = "session_file_remove_failed", path = %path.display(), error = %err);
    }
}

#[derive(Debug, Default)]
struct AccountState {
    /// Cached server ids, `None` until listed or restored.
    servers: Option<Vec<String>>,
    /// File last saved to or restored from.
    session_file: Option<PathBuf>,
}

/// Logged-in (or logging-in) panel account.
///
/// Every request of one client goes through a single gateway guarded by an
/// async mutex, so concurrent callers are serialized per session.
#[derive(Clone)]
pub struct AternosClient {
    gateway: Arc<Mutex<ChallengeGateway>>,
    extractor: TokenExtractor,
    account: Arc<Mutex<AccountState>>,
}

impl AternosClient {
    pub fn new() -> Self {
        Self::with_options(GatewayOptions::default())
    }

    pub fn with_options(options: GatewayOptions) -> Self {
        Self {
            gateway: Arc::new(Mutex::new(ChallengeGateway::new(options))),
            extractor: TokenExtractor::new(),
            account: Arc::new(Mutex::new(AccountState::default())),
        }
    }

    pub fn with_extractor(mut self, extractor: TokenExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Shared gateway, for authenticated exchanges this crate does not wrap.
    pub fn gateway(&self) -> Arc<Mutex<ChallengeGateway>> {
        Arc::clone(&self.gateway)
    }

    pub async fn is_logged_in(&self) -> bool {
        self.gateway
            .lock()
            .await
            .session()
            .session_cookie()
            .is_some()
    }

    /// Fetches the login page, extracts a fresh ajax token and mints a new
    /// SEC pair.
    pub async fn refresh_token(&self) -> Result<(), AternosError> {
        let mut gateway = self.gateway.lock().await;
        refresh_token(&mut gateway, &self.extractor).await
    }

    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
        code: Option<&str>,
    ) -> Result<(), AternosError> {
        self.login_hashed(username, &hash_password(password), code)
            .await
    }

    /// Logs in with an already hashed password.
    pub async fn login_hashed(
        &self,
        username: &str,
        password_md5: &SecretString,
        code: Option<&str>,
    ) -> Result<(), AternosError> {
        let mut gateway = self.gateway.lock().await;
        gateway.clear_session();
        refresh_token(&mut gateway, &self.extractor).await?;

        let url = format!("{}/account/login.php", gateway.options().ajax_url());
        let mut request = ExchangeRequest::post(url)
            .data("user", username)
            .data("password", password_md5.expose_secret().as_str())
            .send_token(true);
        if let Some(code) = code {
            request = request.data("code", code);
        }

        let response = gateway.exchange(request).await?;
        if response.text().contains(TWO_FACTOR_MARKER) {
            info!(event = "login_two_factor_required", user = %username);
            return Err(AternosError::TwoFactorRequired);
        }
        if gateway.session().session_cookie().is_none() {
            warn!(event = "login_rejected", user = %username);
            return Err(AternosError::Credentials(
                "panel returned no session cookie".to_string(),
            ));
        }

        info!(event = "login_succeeded", user = %username);
        Ok(())
    }

    /// Resumes a session from a known session cookie.
    pub async fn login_with_session(&self, session: SecretString) -> Result<(), AternosError> {
        let mut gateway = self.gateway.lock().await;
        gateway.set_session_cookie(session);
        refresh_token(&mut gateway, &self.extractor).await
    }

    /// Logs out and deletes the session file last saved or restored.
    pub async fn logout(&self) -> Result<(), AternosError> {
        {
            let mut gateway = self.gateway.lock().await;
            let url = format!("{}/account/logout.php", gateway.options().ajax_url());
            gateway
                .exchange(ExchangeRequest::get(url).send_token(true))
                .await?;
            gateway.clear_session();
        }

        let session_file = std::mem::take(&mut *self.account.lock().await).session_file;
        if let Some(path) = session_file {
            remove_session(&path).await;
        }
        info!(event = "logout_succeeded");
        Ok(())
    }

    /// Writes the session cookie on the first line and, with
    /// `include_servers`, one cached server id per following line.
    pub async fn save_session(
        &self,
        path: impl AsRef<Path>,
        include_servers: bool,
    ) -> Result<(), AternosError> {
        let path = path.as_ref();
        let session = {
            let gateway = self.gateway.lock().await;
            gateway
                .session()
                .session_cookie()
                .cloned()
                .ok_or_else(|| AternosError::Credentials("not logged in".to_string()))?
        };

        let mut account = self.account.lock().await;
        let mut lines = vec![session.expose_secret().clone()];
        if include_servers {
            lines.extend(account.servers.iter().flatten().cloned());
        }
        let contents = lines.join("\n") + "\n";

        tokio::fs::write(path, contents).await?;
        account.session_file = Some(path.to_path_buf());
        debug!(event = "session_saved", path = %path.display(), servers = lines.len() - 1);
        Ok(())
    }

    /// Restores a session written by [`AternosClient::save_session`], caches
    /// the stored server ids and returns them.
    pub async fn restore_session(&self, path: impl AsRef<Path>) -> Result<Vec<String>, AternosError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        let mut lines = contents.lines().map(str::trim);

        let session = lines.next().unwrap_or_default();
        if session.is_empty() || !session.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AternosError::Credentials(
                "session file does not hold a valid session cookie".to_string(),
            ));
        }
        let stored = lines.map(str::to_string).collect::<Vec<_>>();

        self.login_with_session(SecretString::new(session.to_string()))
            .await?;
        let server_ids = self.refresh_servers(&stored).await;
        self.account.lock().await.session_file = Some(path.to_path_buf());
        debug!(event = "session_restored", path = %path.display(), servers = server_ids.len());
        Ok(server_ids)
    }

    /// Lists the account's servers from the `/servers/` page.
    ///
    /// With `cache`, a list already fetched or restored is returned without a
    /// request. A fresh list is written back to the session file in use.
    pub async fn list_servers(&self, cache: bool) -> Result<Vec<ServerHandle>, AternosError> {
        if cache {
            if let Some(ids) = self.account.lock().await.servers.clone() {
                return Ok(self.handles(&ids));
            }
        }

        let page = {
            let mut gateway = self.gateway.lock().await;
            let url = gateway.options().servers_page_url();
            gateway.exchange(ExchangeRequest::get(url)).await?
        };
        let ids = self.refresh_servers(&server_ids(&page.text())?).await;
        info!(event = "servers_listed", servers = ids.len());

        let session_file = self.account.lock().await.session_file.clone();
        if let Some(path) = session_file {
            if let Err(err) = self.save_session(&path, true).await {
                warn!(event = "session_servers_update_failed", path = %path.display(), error = %err);
            }
        }
        Ok(self.handles(&ids))
    }

    /// Replaces the cached server list. Blank ids are skipped.
    pub async fn refresh_servers(&self, ids: &[String]) -> Vec<String> {
        let ids = ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        for id in &ids {
            debug!(event = "server_cached", server = %id);
        }
        self.account.lock().await.servers = Some(ids.clone());
        ids
    }

    pub fn server(&self, id: impl Into<String>) -> ServerHandle {
        ServerHandle::new(Arc::clone(&self.gateway), id)
    }

    fn handles(&self, ids: &[String]) -> Vec<ServerHandle> {
        ids.iter().map(|id| self.server(id.as_str())).collect()
    }

    pub async fn change_username(&self, username: &str) -> Result<(), AternosError> {
        self.account_post("username", &[("username", username)])
            .await
            .map(|_| ())
    }

    /// Changes the account e-mail. An empty address unsets it.
    pub async fn change_email(&self, email: &str) -> Result<(), AternosError> {
        if !email_regex()?.is_match(email) {
            return Err(AternosError::InvalidInput(format!("invalid e-mail {email:?}")));
        }
        self.account_post("email", &[("email", email)])
            .await
            .map(|_| ())
    }

    pub async fn change_password(
        &self,
        old: &SecretString,
        new: &SecretString,
    ) -> Result<(), AternosError> {
        self.change_password_hashed(&hash_password(old), &hash_password(new))
            .await
    }

    /// Same as [`AternosClient::change_password`] with already hashed
    /// passwords.
    pub async fn change_password_hashed(
        &self,
        old_md5: &SecretString,
        new_md5: &SecretString,
    ) -> Result<(), AternosError> {
        self.account_post(
            "password",
            &[
                ("oldpassword", old_md5.expose_secret().as_str()),
                ("newpassword", new_md5.expose_secret().as_str()),
            ],
        )
        .await
        .map(|_| ())
    }

    /// Requests a 2FA secret; the object carries the secret and a
    /// base64 PNG QR code.
    pub async fn two_factor_secret(&self) -> Result<Value, AternosError> {
        let mut gateway = self.gateway.lock().await;
        let url = format!("{}/account/secret", gateway.options().ajax_url());
        gateway
            .exchange(ExchangeRequest::get(url).send_token(true))
            .await?
            .json()
    }

    pub async fn enable_two_factor(&self, code: u32) -> Result<(), AternosError> {
        let code = code.to_string();
        self.account_post("twofactor", &[("code", code.as_str())])
            .await
            .map(|_| ())
    }

    pub async fn disable_two_factor(&self, code: u32) -> Result<(), AternosError> {
        let code = code.to_string();
        self.account_post("disbaleTwofactor", &[("code", code.as_str())])
            .await
            .map(|_| ())
    }

    async fn account_post(
        &self,
        action: &str,
        data: &[(&str, &str)],
    ) -> Result<ChallengeResponse, AternosError> {
        let mut gateway = self.gateway.lock().await;
        let url = format!("{}/account/{action}", gateway.options().ajax_url());
        let mut request = ExchangeRequest::post(url).send_token(true);
        for (name, value) in data {
            request = request.data(*name, *value);
        }
        debug!(event = "account_update", action);
        gateway.exchange(request).await
    }
}

/// Writes a QR code returned by [`AternosClient::two_factor_secret`] to a
/// PNG file, replacing any existing file.
pub async fn save_qr_code(qrcode: &str, path: impl AsRef<Path>) -> Result<(), AternosError> {
    let encoded = qrcode.strip_prefix(QR_CODE_PREFIX).unwrap_or(qrcode);
    let png = STANDARD
        .decode(encoded)
        .map_err(|err| AternosError::InvalidInput(format!("qr code is not base64: {err}")))?;
    tokio::fs::write(path, png).await?;
    Ok(())
}

impl Default for AternosClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn refresh_token(
    gateway: &mut ChallengeGateway,
    extractor: &TokenExtractor,
) -> Result<(), AternosError> {
    let url = gateway.options().login_page_url();
    let page = gateway.exchange(ExchangeRequest::get(url)).await?;
    let token = extractor.extract_token(&page.body)?;
    gateway.set_ajax_token(token);
    gateway.regenerate_sec();
    debug!(event = "ajax_token_refreshed");
    Ok(())
}
