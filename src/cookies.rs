//! Cookie store shared by every transport client of one session.
//!
//! The gateway builds a fresh `reqwest::Client` per attempt; all of them
//! point at the same [`CookieJar`] so cookies issued by a challenge page are
//! replayed on the next attempt. The jar is scoped to a single origin and
//! ignores `Domain`/`Path` attributes.

use std::collections::BTreeMap;
use std::sync::RwLock;

use cookie::time::{Duration, OffsetDateTime};
use cookie::Cookie;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use reqwest::Url;
use tracing::trace;

/// Name of the panel's login session cookie.
pub const SESSION_COOKIE: &str = "ATERNOS_SESSION";
/// Name of the per-request cookie selecting the target server.
pub const SERVER_COOKIE: &str = "ATERNOS_SERVER";

#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: RwLock<BTreeMap<String, String>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.cookies
            .read()
            .ok()
            .and_then(|cookies| cookies.get(name).cloned())
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut cookies) = self.cookies.write() {
            cookies.insert(name.into(), value.into());
        }
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.cookies
            .write()
            .ok()
            .and_then(|mut cookies| cookies.remove(name))
    }

    pub fn len(&self) -> usize {
        self.cookies.read().map(|cookies| cookies.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders a `Cookie` header from the stored cookies merged with
    /// `extra`. Entries in `extra` win over stored cookies of the same name.
    pub fn header_with(&self, extra: &[(String, String)]) -> Option<String> {
        let mut merged = self
            .cookies
            .read()
            .map(|cookies| cookies.clone())
            .unwrap_or_default();
        for (name, value) in extra {
            merged.insert(name.clone(), value.clone());
        }

        if merged.is_empty() {
            return None;
        }

        Some(
            merged
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn apply_set_cookie(&self, raw: &str) {
        let Some((name, value, expired)) = parse_set_cookie(raw) else {
            return;
        };
        trace!(event = "cookie_received", name = %name, expired);
        if expired {
            self.remove(&name);
        } else {
            self.set(name, value);
        }
    }
}

impl CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, _url: &Url) {
        for header in cookie_headers {
            if let Ok(raw) = header.to_str() {
                self.apply_set_cookie(raw);
            }
        }
    }

    fn cookies(&self, _url: &Url) -> Option<HeaderValue> {
        self.header_with(&[])
            .and_then(|header| HeaderValue::from_str(&header).ok())
    }
}

/// Parses the `name=value` pair of a `Set-Cookie` header and reports whether
/// the attributes delete the cookie: an empty value, a non-positive
/// `Max-Age` or an `Expires` date in the past.
fn parse_set_cookie(raw: &str) -> Option<(String, String, bool)> {
    let cookie = Cookie::parse(raw).ok()?;
    let name = cookie.name().trim();
    if name.is_empty() {
        return None;
    }
    let value = cookie.value().trim_matches('"');

    let max_age_elapsed = cookie
        .max_age()
        .is_some_and(|max_age| max_age <= Duration::ZERO);
    let expired = cookie
        .expires_datetime()
        .is_some_and(|expires| expires <= OffsetDateTime::now_utc());

    Some((
        name.to_string(),
        value.to_string(),
        max_age_elapsed || expired || value.is_empty(),
    ))
}
