//! Authentication for the gateway.
//!
//! - [`ext_authz`]: the per-request filter the sidecar consults before forwarding a request.
//! - [`login`]: the OIDC authorization code flow (with PKCE) that mints credentials.
//! - [`refresh`]: single-flight refresh of expired ID tokens.
//!
//! When the OIDC settings are incomplete the runtime resolves to [`Resolved::Disabled`] and
//! both roles fail closed with 503.

pub mod cookies;
pub mod credential;
pub mod ext_authz;
pub mod login;
pub mod oidc;
pub mod refresh;

use alloc::sync::Arc;
use core::{cmp, time::Duration};

use authgate_common::Cipher;
use axum::{
    http::{StatusCode, header},
    response::{IntoResponse as _, Response},
};
use eyre::WrapErr as _;
use secrecy::SecretString;
use tracing::{Instrument as _, info, warn};
use url::Url;

use crate::{
    auth::oidc::{IdentityProvider, OpenIdProvider},
    config::OidcConfig,
};

pub(crate) const LOGIN_PATH: &str = "/oidc/login";
pub(crate) const CALLBACK_PATH: &str = "/oidc/callback";

const FIRST_DISCOVERY_DELAY: Duration = Duration::from_secs(1);
const MAX_DISCOVERY_DELAY: Duration = Duration::from_secs(30);

/// Body sent with every 503 while OIDC is not configured.
pub(crate) const NOT_CONFIGURED_MESSAGE: &str = "OIDC is not configured";

pub(crate) struct Runtime {
    pub mode: Resolved,
}

pub(crate) enum Resolved {
    Disabled,
    Oidc(OidcRuntime),
}

/// Everything the filter and the login flow need once OIDC is configured.
pub(crate) struct OidcRuntime {
    pub provider: Arc<dyn IdentityProvider>,
    /// Seals credentials and CSRF state. Keyed from the client secret.
    pub cipher: Cipher,
    /// Keys the login link signatures.
    pub client_secret: Arc<SecretString>,
    /// Absolute URL of this gateway's login endpoint.
    pub login_url: Url,
}

impl Runtime {
    /// Resolves the runtime from configuration, running provider discovery when OIDC is set up.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway URL is invalid or every discovery attempt fails.
    #[tracing::instrument(skip_all)]
    pub(crate) async fn from_config(cfg: Option<&OidcConfig>) -> eyre::Result<Self> {
        let Some(cfg) = cfg else {
            return Ok(Self::disabled());
        };
        let provider = with_retries(cfg.discovery_attempts, FIRST_DISCOVERY_DELAY, || {
            OpenIdProvider::discover(cfg).in_current_span()
        })
        .await
        .wrap_err("Failed to build OIDC client")?;
        info!(issuer = %cfg.provider_url, "OIDC provider discovered");
        Self::with_provider(cfg, Arc::new(provider))
    }

    /// Builds an OIDC runtime around an already constructed provider.
    pub(crate) fn with_provider(
        cfg: &OidcConfig,
        provider: Arc<dyn IdentityProvider>,
    ) -> eyre::Result<Self> {
        let login_url = Url::parse(&format!(
            "{}{LOGIN_PATH}",
            cfg.auth_proxy_url.trim_end_matches('/')
        ))
        .wrap_err("invalid auth proxy URL")?;

        Ok(Self {
            mode: Resolved::Oidc(OidcRuntime {
                provider,
                cipher: Cipher::from_secret(&cfg.client_secret),
                client_secret: Arc::clone(&cfg.client_secret),
                login_url,
            }),
        })
    }

    pub(crate) const fn disabled() -> Self {
        Self {
            mode: Resolved::Disabled,
        }
    }

    pub(crate) const fn oidc(&self) -> Option<&OidcRuntime> {
        match self.mode {
            Resolved::Oidc(ref oidc) => Some(oidc),
            Resolved::Disabled => None,
        }
    }
}

/// Runs `attempt` up to `attempts` times, doubling the wait between tries up to
/// [`MAX_DISCOVERY_DELAY`]. Returns the last error when every try failed.
async fn with_retries<T, F, Fut>(
    attempts: u32,
    first_delay: Duration,
    mut attempt: F,
) -> eyre::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = eyre::Result<T>>,
{
    let mut delay = first_delay;
    let mut tried = 1;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if tried < attempts => {
                warn!(
                    error = ?e,
                    attempt = tried,
                    of = attempts,
                    retry_in = ?delay,
                    "attempt failed"
                );
                tokio::time::sleep(delay).await;
                delay = cmp::min(delay.saturating_mul(2), MAX_DISCOVERY_DELAY);
                tried += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 302 to `location` (`Redirect::to` would answer 303).
pub(crate) fn found(location: impl Into<String>) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.into())]).into_response()
}

pub(crate) fn not_configured() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, NOT_CONFIGURED_MESSAGE).into_response()
}
