use crate::error::ProviderError;
use crate::model::{AuthKind, Credentials};
use log::trace;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::Url;
use std::fmt::Debug;

/// One way of carrying tee-sheet credentials on an outbound request.
/// All variants satisfy the same capability set: header decoration plus
/// optional URL augmentation. Credential values never reach cache keys
/// or logs; URL-borne tokens are masked by the HTTP layer's redaction.
pub trait AuthStrategy: Debug + Send + Sync {
    /// Mutates outbound headers to carry authentication.
    fn apply(&self, credentials: &Credentials, headers: &mut HeaderMap)
        -> Result<(), ProviderError>;

    /// Optional URL augmentation; the default leaves the URL untouched.
    fn build_url(&self, base: Url, _credentials: &Credentials) -> Result<Url, ProviderError> {
        Ok(base)
    }
}

fn secret<'a>(credentials: &'a Credentials, key: &str) -> Result<&'a str, ProviderError> {
    credentials.secret(key).ok_or(ProviderError::Unauthorized)
}

fn header_value(value: &str) -> Result<HeaderValue, ProviderError> {
    HeaderValue::from_str(value).map_err(|_| ProviderError::Unauthorized)
}

/// `Authorization: token <t>` plus an optional session-type header some
/// tee sheets require to route the request.
#[derive(Debug, Clone)]
pub struct BearerToken {
    session_type: Option<&'static str>,
}

impl BearerToken {
    pub const fn new(session_type: Option<&'static str>) -> Self {
        Self { session_type }
    }
}

impl AuthStrategy for BearerToken {
    fn apply(
        &self,
        credentials: &Credentials,
        headers: &mut HeaderMap,
    ) -> Result<(), ProviderError> {
        let token = secret(credentials, "token")?;

        headers.insert(AUTHORIZATION, header_value(&format!("token {token}"))?);

        if let Some(session_type) = self.session_type {
            headers.insert("x-session-type", header_value(session_type)?);
        }

        trace!("Applied bearer token authentication");

        Ok(())
    }
}

/// `Cookie: <name>=<value>` with a provider-specific cookie name.
#[derive(Debug, Clone)]
pub struct CookieSession {
    cookie_name: &'static str,
}

impl CookieSession {
    pub const fn new(cookie_name: &'static str) -> Self {
        Self { cookie_name }
    }
}

impl AuthStrategy for CookieSession {
    fn apply(
        &self,
        credentials: &Credentials,
        headers: &mut HeaderMap,
    ) -> Result<(), ProviderError> {
        let value = secret(credentials, "session")?;

        headers.insert(
            COOKIE,
            header_value(&format!("{}={value}", self.cookie_name))?,
        );

        trace!("Applied cookie session authentication");

        Ok(())
    }
}

/// Token in the query string. Headers stay untouched; the token rides on
/// every URL this strategy builds.
#[derive(Debug, Clone)]
pub struct UrlParameter {
    parameter: &'static str,
}

impl UrlParameter {
    pub const fn new(parameter: &'static str) -> Self {
        Self { parameter }
    }
}

impl AuthStrategy for UrlParameter {
    fn apply(
        &self,
        _credentials: &Credentials,
        _headers: &mut HeaderMap,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    fn build_url(&self, mut base: Url, credentials: &Credentials) -> Result<Url, ProviderError> {
        let token = secret(credentials, "token")?;

        base.query_pairs_mut().append_pair(self.parameter, token);

        Ok(base)
    }
}

/// Checks that the configured credential kind matches what the adapter's
/// strategy expects, so misconfigured memberships fail fast instead of
/// confusing the remote end.
pub fn ensure_kind(credentials: &Credentials, expected: AuthKind) -> Result<(), ProviderError> {
    if credentials.auth_kind() == expected {
        Ok(())
    } else {
        Err(ProviderError::Unauthorized)
    }
}
