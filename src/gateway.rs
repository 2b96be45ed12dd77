//! Challenge-aware HTTP exchanges against the panel.
//!
//! Every attempt runs on a freshly built `reqwest::Client` that shares one
//! [`CookieJar`]. The session cookie is pulled out of the jar before each
//! attempt and sent as a per-request cookie instead, so only the cookies a
//! challenge page hands out travel through the shared store.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, COOKIE, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::cookies::{CookieJar, SESSION_COOKIE};
use crate::error::AternosError;
use crate::retry::{retry_async, RetryPolicy};
use crate::sec::{SecToken, SecTokenGenerator};

pub const ATERNOS_BASE_URL: &str = "https://aternos.org";
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/99.0.4844.84 Safari/537.36 OPR/85.0.4341.47";

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const BODY_LOG_LEN: usize = 65;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GatewayDefaults;

impl GatewayDefaults {
    pub const MAX_RETRIES: usize = 5;
    pub const CHALLENGE_DELAY: Duration = Duration::from_millis(200);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct GatewayOptions {
    pub base_url: String,
    pub user_agent: String,
    /// Challenge retries after the first attempt.
    pub max_retries: usize,
    pub challenge_delay: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            base_url: ATERNOS_BASE_URL.to_string(),
            user_agent: BROWSER_USER_AGENT.to_string(),
            max_retries: GatewayDefaults::MAX_RETRIES,
            challenge_delay: GatewayDefaults::CHALLENGE_DELAY,
            connect_timeout: GatewayDefaults::CONNECT_TIMEOUT,
            request_timeout: GatewayDefaults::REQUEST_TIMEOUT,
        }
    }
}

impl GatewayOptions {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_challenge_delay(mut self, delay: Duration) -> Self {
        self.challenge_delay = delay;
        self
    }

    pub fn ajax_url(&self) -> String {
        format!("{}/panel/ajax", self.base_url)
    }

    pub fn login_page_url(&self) -> String {
        format!("{}/go/", self.base_url)
    }

    pub fn servers_page_url(&self) -> String {
        format!("{}/servers/", self.base_url)
    }
}

/// Identity of one logged-in panel session.
#[derive(Default)]
pub struct Session {
    session_cookie: Option<SecretString>,
    ajax_token: Option<String>,
    sec: Option<SecToken>,
}

impl Session {
    pub fn session_cookie(&self) -> Option<&SecretString> {
        self.session_cookie.as_ref()
    }

    pub fn ajax_token(&self) -> Option<&str> {
        self.ajax_token.as_deref()
    }

    pub fn sec(&self) -> Option<&SecToken> {
        self.sec.as_ref()
    }
}

/// One request to run through [`ChallengeGateway::exchange`].
#[derive(Clone, Debug)]
pub struct ExchangeRequest {
    method: Method,
    url: String,
    params: Vec<(String, String)>,
    data: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    send_token: bool,
    max_retries: Option<usize>,
}

impl ExchangeRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
            data: Vec::new(),
            headers: Vec::new(),
            cookies: Vec::new(),
            send_token: false,
            max_retries: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Adds a form field. POST sends it as the form body, GET folds it into
    /// the query string after the params.
    pub fn data(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds a cookie for this request only; it never enters the jar.
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Attaches the ajax token and SEC pair and marks the request as
    /// script-originated.
    pub fn send_token(mut self, send_token: bool) -> Self {
        self.send_token = send_token;
        self
    }

    /// Overrides the gateway's challenge retry budget for this request.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Raw HTTP result with its challenge classification.
#[derive(Clone, Debug)]
pub struct ChallengeResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ChallengeResponse {
    /// A 403 carrying an HTML interstitial.
    pub fn is_challenge(&self) -> bool {
        self.status == StatusCode::FORBIDDEN
            && self
                .content_type
                .as_deref()
                .is_some_and(|value| value.contains("text/html"))
    }

    pub fn is_permission_denied(&self) -> bool {
        self.status == StatusCode::PAYMENT_REQUIRED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AternosError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Debug)]
enum AttemptError {
    Challenge,
    Fatal(AternosError),
}

impl From<AternosError> for AttemptError {
    fn from(error: AternosError) -> Self {
        Self::Fatal(error)
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(error: reqwest::Error) -> Self {
        Self::Fatal(AternosError::Transport(error))
    }
}

pub struct ChallengeGateway {
    options: GatewayOptions,
    jar: Arc<CookieJar>,
    session: Session,
    sec_generator: SecTokenGenerator,
}

impl ChallengeGateway {
    pub fn new(options: GatewayOptions) -> Self {
        Self {
            options,
            jar: Arc::new(CookieJar::new()),
            session: Session::default(),
            sec_generator: SecTokenGenerator::new(),
        }
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    pub fn jar(&self) -> &Arc<CookieJar> {
        &self.jar
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn set_ajax_token(&mut self, token: impl Into<String>) {
        self.session.ajax_token = Some(token.into());
    }

    /// Mints a new SEC pair, dropping the previous pair's cookie.
    pub fn regenerate_sec(&mut self) -> SecToken {
        if let Some(previous) = self.session.sec.take() {
            self.jar.remove(&previous.cookie_name());
        }
        let sec = self.sec_generator.generate(&self.jar);
        self.session.sec = Some(sec.clone());
        sec
    }

    pub fn set_session_cookie(&mut self, cookie: SecretString) {
        self.jar.remove(SESSION_COOKIE);
        self.session.session_cookie = Some(cookie);
    }

    /// Forgets the session cookie and tokens. Challenge cookies are kept.
    pub fn clear_session(&mut self) {
        self.jar.remove(SESSION_COOKIE);
        if let Some(sec) = self.session.sec.take() {
            self.jar.remove(&sec.cookie_name());
        }
        self.session = Session::default();
    }

    pub async fn exchange(
        &mut self,
        request: ExchangeRequest,
    ) -> Result<ChallengeResponse, AternosError> {
        if request.method != Method::GET && request.method != Method::POST {
            return Err(AternosError::UnsupportedMethod(request.method.to_string()));
        }

        let retries = request.max_retries.unwrap_or(self.options.max_retries);
        let policy = RetryPolicy::with_retries(retries, self.options.challenge_delay);

        let result = retry_async(
            &policy,
            |attempt| {
                let prepared = self.prepare_attempt(&request, attempt);
                async move { run_attempt(prepared?).await }
            },
            |error| matches!(error, AttemptError::Challenge),
        )
        .await;

        self.capture_session_cookie();

        match result {
            Ok(response) => {
                info!(
                    event = "exchange_completed",
                    method = %request.method,
                    url = %request.url,
                    status = response.status.as_u16()
                );
                Ok(response)
            }
            Err(AttemptError::Challenge) => {
                warn!(
                    event = "challenge_exceeded",
                    url = %request.url,
                    attempts = policy.max_attempts
                );
                Err(AternosError::ChallengeExceeded {
                    attempts: policy.max_attempts,
                })
            }
            Err(AttemptError::Fatal(error)) => Err(error),
        }
    }

    /// Moves a session cookie issued by the last response out of the jar.
    fn capture_session_cookie(&mut self) {
        if let Some(cookie) = self.jar.remove(SESSION_COOKIE) {
            debug!(event = "session_cookie_captured");
            self.session.session_cookie = Some(SecretString::new(cookie));
        }
    }

    fn prepare_attempt(
        &mut self,
        request: &ExchangeRequest,
        attempt: usize,
    ) -> Result<RequestBuilder, AttemptError> {
        self.capture_session_cookie();

        debug!(
            event = "exchange_attempt",
            method = %request.method,
            url = %request.url,
            attempt
        );

        let client = Client::builder()
            .no_proxy()
            .cookie_provider(Arc::clone(&self.jar))
            .connect_timeout(self.options.connect_timeout)
            .timeout(self.options.request_timeout)
            .build()?;

        let mut params = request.params.clone();
        if request.method == Method::GET {
            params.extend(request.data.iter().cloned());
        }
        let mut headers = request.headers.clone();
        if request.send_token {
            params.push((
                "TOKEN".to_string(),
                self.session.ajax_token.clone().unwrap_or_default(),
            ));
            params.push((
                "SEC".to_string(),
                self.session
                    .sec
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ));
            headers.push(("X-Requested-With".to_string(), "XMLHttpRequest".to_string()));
        }

        let mut cookies = Vec::with_capacity(request.cookies.len() + 1);
        if let Some(session) = self.session.session_cookie.as_ref() {
            cookies.push((
                SESSION_COOKIE.to_string(),
                session.expose_secret().clone(),
            ));
        }
        cookies.extend(request.cookies.iter().cloned());

        let mut builder = client
            .request(request.method.clone(), request.url.as_str())
            .header(USER_AGENT, self.options.user_agent.as_str());
        if !params.is_empty() {
            builder = builder.query(&params);
        }
        if request.method == Method::POST && !request.data.is_empty() {
            builder = builder.form(&request.data);
        }
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(cookie_header) = self.jar.header_with(&cookies) {
            builder = builder.header(COOKIE, cookie_header);
        }

        Ok(builder)
    }
}

async fn run_attempt(builder: RequestBuilder) -> Result<ChallengeResponse, AttemptError> {
    let response = builder.send().await?;
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response.bytes().await?.to_vec();

    let response = ChallengeResponse {
        status,
        content_type,
        body,
    };
    debug!(
        event = "exchange_response",
        status = status.as_u16(),
        body = %summarize_body(&response.body, BODY_LOG_LEN)
    );

    if response.is_challenge() {
        info!(event = "challenge_detected", status = status.as_u16());
        return Err(AttemptError::Challenge);
    }
    if response.is_permission_denied() {
        return Err(AternosError::PermissionDenied.into());
    }
    if !status.is_success() {
        return Err(AternosError::HttpStatus {
            status,
            body: summarize_body(&response.body, ERROR_BODY_SNIPPET_LEN),
        }
        .into());
    }

    Ok(response)
}

fn summarize_body(body: &[u8], limit: usize) -> String {
    String::from_utf8_lossy(body).chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::{Method, StatusCode};
    use secrecy::{ExposeSecret, SecretString};

    use super::{
        ChallengeGateway, ChallengeResponse, ExchangeRequest, GatewayDefaults, GatewayOptions,
    };
    use crate::cookies::SESSION_COOKIE;
    use crate::error::ErrorKind;

    fn response(status: StatusCode, content_type: Option<&str>) -> ChallengeResponse {
        ChallengeResponse {
            status,
            content_type: content_type.map(str::to_string),
            body: Vec::new(),
        }
    }

    #[test]
    fn challenge_requires_forbidden_html() {
        assert!(response(StatusCode::FORBIDDEN, Some("text/html; charset=UTF-8")).is_challenge());
        assert!(!response(StatusCode::FORBIDDEN, Some("application/json")).is_challenge());
        assert!(!response(StatusCode::FORBIDDEN, None).is_challenge());
        assert!(!response(StatusCode::OK, Some("text/html")).is_challenge());
    }

    #[test]
    fn payment_required_is_permission_denied() {
        assert!(response(StatusCode::PAYMENT_REQUIRED, Some("text/html")).is_permission_denied());
        assert!(!response(StatusCode::PAYMENT_REQUIRED, Some("text/html")).is_challenge());
    }

    #[test]
    fn unsupported_method_fails_before_any_request() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
            .block_on(async {
                let mut gateway = ChallengeGateway::new(
                    GatewayOptions::default().with_base_url("http://127.0.0.1:9"),
                );
                let error = gateway
                    .exchange(ExchangeRequest::new(Method::PUT, "http://127.0.0.1:9/"))
                    .await
                    .expect_err("PUT is rejected");
                assert_eq!(error.kind(), ErrorKind::UnsupportedMethod);
            });
    }

    #[test]
    fn regenerating_sec_replaces_cookie() {
        let mut gateway = ChallengeGateway::new(GatewayOptions::default());
        let first = gateway.regenerate_sec();
        let second = gateway.regenerate_sec();
        assert!(gateway.jar().get(&first.cookie_name()).is_none() || first.key == second.key);
        assert_eq!(
            gateway.jar().get(&second.cookie_name()).as_deref(),
            Some(second.value.as_str())
        );
        assert_eq!(gateway.session().sec(), Some(&second));
    }

    #[test]
    fn session_cookie_lives_outside_the_jar() {
        let mut gateway = ChallengeGateway::new(GatewayOptions::default());
        gateway.jar().set(SESSION_COOKIE, "stale");
        gateway.set_session_cookie(SecretString::new("fresh".to_string()));

        assert!(gateway.jar().get(SESSION_COOKIE).is_none());
        assert_eq!(
            gateway
                .session()
                .session_cookie()
                .map(|cookie| cookie.expose_secret().as_str()),
            Some("fresh")
        );

        gateway.clear_session();
        assert!(gateway.session().session_cookie().is_none());
        assert!(gateway.session().ajax_token().is_none());
    }

    #[test]
    fn get_folds_form_data_into_query() {
        let mut gateway = ChallengeGateway::new(GatewayOptions::default());
        let request = ExchangeRequest::get("http://127.0.0.1:9/panel/ajax/files/download.php")
            .param("a", "1")
            .data("file", "/server.properties");
        let built = gateway
            .prepare_attempt(&request, 1)
            .expect("prepared")
            .build()
            .expect("request");

        let query = built.url().query_pairs().into_owned().collect::<Vec<_>>();
        assert_eq!(
            query,
            vec![
                ("a".to_string(), "1".to_string()),
                ("file".to_string(), "/server.properties".to_string()),
            ]
        );
        assert!(built.body().is_none());
    }

    #[test]
    fn post_keeps_form_data_in_body() {
        let mut gateway = ChallengeGateway::new(GatewayOptions::default());
        let request = ExchangeRequest::post("http://127.0.0.1:9/panel/ajax/account/username")
            .data("username", "alex");
        let built = gateway
            .prepare_attempt(&request, 1)
            .expect("prepared")
            .build()
            .expect("request");

        assert!(built.url().query().is_none());
        assert_eq!(
            built.body().and_then(|body| body.as_bytes()),
            Some(b"username=alex".as_slice())
        );
    }

    #[test]
    fn default_options_come_from_gateway_defaults() {
        let options = GatewayOptions::default();
        assert_eq!(options.max_retries, GatewayDefaults::MAX_RETRIES);
        assert_eq!(options.challenge_delay, GatewayDefaults::CHALLENGE_DELAY);
        assert_eq!(options.request_timeout, GatewayDefaults::REQUEST_TIMEOUT);
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let options = GatewayOptions::default().with_base_url("http://127.0.0.1:8080/");
        assert_eq!(options.ajax_url(), "http://127.0.0.1:8080/panel/ajax");
        assert_eq!(options.login_page_url(), "http://127.0.0.1:8080/go/");
        assert_eq!(options.servers_page_url(), "http://127.0.0.1:8080/servers/");
    }
}
