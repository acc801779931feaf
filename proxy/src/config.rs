//! Resolved gateway configuration.
//!
//! Built once from the parsed CLI/environment in `inner_main` and handed to the server
//! through `AppState`; nothing reads the environment after startup.

use alloc::sync::Arc;
use core::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::cli::{OidcArgs, ServiceArgs, SessionArgs};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Identity provider settings, present only when all required values were supplied.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub client_id: String,
    pub client_secret: Arc<SecretString>,
    /// Issuer URL used for discovery.
    pub provider_url: String,
    /// Public base URL of this gateway's login endpoints.
    pub auth_proxy_url: String,
    pub scopes: Vec<String>,
    /// Startup discovery attempts, at least one.
    pub discovery_attempts: u32,
}

impl OidcConfig {
    /// Returns `None` when any required setting is missing or empty.
    #[must_use]
    pub fn from_args(args: &OidcArgs) -> Option<Self> {
        let non_empty = |value: Option<&String>| value.filter(|v| !v.trim().is_empty()).cloned();

        let client_id = non_empty(args.client_id.as_ref());
        let provider_url = non_empty(args.provider_url.as_ref());
        let auth_proxy_url = non_empty(args.auth_proxy_url.as_ref());
        let client_secret = args.client_secret.clone();

        let missing: Vec<&str> = [
            ("AUTHGATE_OIDC_CLIENT_ID", client_id.is_none()),
            ("AUTHGATE_OIDC_CLIENT_SECRET", client_secret.is_none()),
            ("AUTHGATE_OIDC_PROVIDER_URL", provider_url.is_none()),
            ("AUTHGATE_OIDC_AUTH_PROXY_URL", auth_proxy_url.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        if !missing.is_empty() {
            warn!(
                ?missing,
                "OIDC is not configured; filter and login requests will be answered with 503"
            );
            return None;
        }

        Some(Self {
            client_id: client_id?,
            client_secret: client_secret?,
            provider_url: provider_url?,
            auth_proxy_url: auth_proxy_url?,
            scopes: args.scopes.clone(),
            discovery_attempts: args.discovery_attempts,
        })
    }
}

/// Lifetimes and bounds for sessions and refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub cookie_max_age: Duration,
    pub refresh_grace: Duration,
    pub refresh_timeout: Duration,
    pub login_link_max_age: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_max_age: Duration::from_secs(7 * SECONDS_PER_DAY),
            refresh_grace: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(10),
            login_link_max_age: Duration::from_secs(600),
        }
    }
}

impl From<&SessionArgs> for SessionConfig {
    fn from(args: &SessionArgs) -> Self {
        Self {
            cookie_max_age: Duration::from_secs(
                u64::from(args.session_max_age_days) * SECONDS_PER_DAY,
            ),
            refresh_grace: Duration::from_secs(args.refresh_grace_secs),
            refresh_timeout: Duration::from_secs(args.refresh_timeout_secs),
            login_link_max_age: Duration::from_secs(args.login_link_max_age_secs),
        }
    }
}

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub oidc: Option<OidcConfig>,
    pub session: SessionConfig,
}

impl GatewayConfig {
    #[must_use]
    pub fn from_args(args: &ServiceArgs) -> Self {
        Self {
            oidc: OidcConfig::from_args(&args.oidc),
            session: SessionConfig::from(&args.session),
        }
    }
}
