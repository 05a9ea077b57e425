//! Credential and address checks for publish/read access
//!
//! Evaluation order: external HTTP authentication (when configured), then the
//! per-path IP allowlist, then per-path user/password. The outcome
//! distinguishes *critical* failures (credentials or address supplied and
//! rejected; log and close) from *not-critical* ones (nothing supplied yet;
//! issue a challenge).

use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::conf::PathConf;
use crate::error::RelayError;

/// Identity of a client attempting an operation.
#[derive(Debug, Clone)]
pub struct AccessInfo {
    pub ip: IpAddr,
    pub user: Option<String>,
    pub pass: Option<String>,
    /// Raw query string of the request, forwarded to external auth.
    pub query: String,
    /// Front-end protocol label ("rtsp", "rtmp", ...).
    pub protocol: &'static str,
}

impl AccessInfo {
    /// Whether the client presented a complete credential pair.
    fn has_credentials(&self) -> bool {
        self.user.is_some() && self.pass.is_some()
    }
}

/// What the client wants to do with the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Publish,
    Read,
}

impl AuthAction {
    fn as_str(self) -> &'static str {
        match self {
            AuthAction::Publish => "publish",
            AuthAction::Read => "read",
        }
    }
}

/// Body of the external authentication POST.
#[derive(Debug, Serialize)]
struct ExternalAuthRequest<'a> {
    user: &'a str,
    password: &'a str,
    ip: String,
    action: &'static str,
    path: &'a str,
    query: &'a str,
    protocol: &'static str,
}

/// Evaluates access rules for the path manager.
pub struct Authenticator {
    external_url: Option<String>,
    client: reqwest::Client,
}

impl Authenticator {
    pub fn new(external_url: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            external_url: external_url.filter(|u| !u.is_empty()),
            client,
        }
    }

    /// Runs all configured checks in order. `Ok(())` grants access.
    pub async fn authenticate(
        &self,
        path_name: &str,
        conf: &PathConf,
        access: &AccessInfo,
        action: AuthAction,
    ) -> Result<(), RelayError> {
        if let Some(url) = &self.external_url {
            self.check_external(url, path_name, access, action).await?;
        }
        check_ips(conf, access, action)?;
        check_credentials(conf, access, action)
    }

    async fn check_external(
        &self,
        url: &str,
        path_name: &str,
        access: &AccessInfo,
        action: AuthAction,
    ) -> Result<(), RelayError> {
        let body = ExternalAuthRequest {
            user: access.user.as_deref().unwrap_or(""),
            password: access.pass.as_deref().unwrap_or(""),
            ip: access.ip.to_string(),
            action: action.as_str(),
            path: path_name,
            query: &access.query,
            protocol: access.protocol,
        };

        let allowed = match self.client.post(url).json(&body).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "external authentication request failed");
                false
            }
        };

        if allowed {
            return Ok(());
        }
        if access.has_credentials() {
            Err(RelayError::AuthCritical(format!(
                "external authentication rejected user '{}'",
                access.user.as_deref().unwrap_or(""),
            )))
        } else {
            Err(RelayError::AuthNotCritical)
        }
    }
}

fn check_ips(conf: &PathConf, access: &AccessInfo, action: AuthAction) -> Result<(), RelayError> {
    let ips = match action {
        AuthAction::Publish => &conf.publish_ips,
        AuthAction::Read => &conf.read_ips,
    };
    if ips.is_empty() || ips.contains(access.ip) {
        return Ok(());
    }
    Err(RelayError::AuthCritical(format!(
        "IP {} not allowed",
        access.ip
    )))
}

fn check_credentials(
    conf: &PathConf,
    access: &AccessInfo,
    action: AuthAction,
) -> Result<(), RelayError> {
    let (want_user, want_pass) = match action {
        AuthAction::Publish => (&conf.publish_user, &conf.publish_pass),
        AuthAction::Read => (&conf.read_user, &conf.read_pass),
    };
    if want_user.is_empty() && want_pass.is_empty() {
        return Ok(());
    }

    // A partial credential (user without password or vice versa) is treated
    // like no credential at all: challenge instead of reject.
    let (user, pass) = match (&access.user, &access.pass) {
        (Some(u), Some(p)) => (u, p),
        _ => return Err(RelayError::AuthNotCritical),
    };

    if constant_time_eq(user, want_user) & constant_time_eq(pass, want_pass) {
        Ok(())
    } else {
        Err(RelayError::AuthCritical(format!("invalid credentials for user '{user}'")))
    }
}

/// Compares two strings in time independent of where they differ.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
