//! OIDC relying party: `/oidc/login` and `/oidc/callback`.
//!
//! The filter sends unauthenticated browsers to `/oidc/login` with a signed envelope naming the
//! URL they wanted. Login seals that URL, a nonce and a PKCE verifier into the OIDC `state` and
//! redirects to the provider. The callback opens the state, exchanges the code, verifies the
//! ID token against the nonce and redirects back to the original URL with the sealed credential
//! attached as the one-shot `authgate-sso` parameter, which the filter turns into a cookie on
//! the protected domain.

use authgate_common::CodecError;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    auth::{
        NOT_CONFIGURED_MESSAGE,
        cookies::COOKIE_SSO,
        credential::{Credential, CsrfState, EnvelopeError, SignedRedirect},
        found,
        oidc::{ProviderError, VerifyError},
    },
    state::AppState,
};

#[derive(Deserialize)]
/// Query parameters of the signed login link.
pub(crate) struct LoginQueryParams {
    original_url: Option<String>,
    now: Option<String>,
    sign: Option<String>,
}

#[derive(Deserialize)]
/// Query parameters for OIDC callback deserialization.
pub(crate) struct CallbackQueryParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Everything that can end a login or callback request early.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LoginError {
    #[error("OIDC is not configured")]
    NotConfigured,
    #[error("missing query parameter `{0}`")]
    MissingParam(&'static str),
    #[error("login link rejected: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("state could not be opened: {0}")]
    StateTampered(#[source] CodecError),
    #[error("original url in state is not a URL")]
    InvalidOriginalUrl(#[source] url::ParseError),
    #[error("provider returned error `{error}`: {description}")]
    Provider { error: String, description: String },
    #[error("code exchange failed: {0}")]
    Exchange(#[source] ProviderError),
    #[error("ID token failed verification: {0}")]
    Verify(#[source] VerifyError),
    #[error("credential could not be sealed: {0}")]
    Seal(#[source] CodecError),
}

impl LoginError {
    const fn status(&self) -> StatusCode {
        match *self {
            Self::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::Exchange(ProviderError::Transport(_)) => StatusCode::BAD_GATEWAY,
            Self::Seal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MissingParam(_)
            | Self::Envelope(_)
            | Self::StateTampered(_)
            | Self::InvalidOriginalUrl(_)
            | Self::Provider { .. }
            | Self::Exchange(_)
            | Self::Verify(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Client-facing text. Internal detail stays in the logs.
    fn message(&self) -> String {
        match *self {
            Self::NotConfigured => NOT_CONFIGURED_MESSAGE.to_owned(),
            Self::MissingParam(name) => format!("Require param {name}."),
            Self::Envelope(EnvelopeError::SignatureMismatch) => "Wrong sign".to_owned(),
            Self::Envelope(_) => "Login link expired, please retry".to_owned(),
            Self::StateTampered(_) | Self::InvalidOriginalUrl(_) => "State mismatch".to_owned(),
            Self::Provider { .. } => "Login was not completed by the identity provider".to_owned(),
            Self::Exchange(ProviderError::Transport(_)) => {
                "Identity provider unreachable".to_owned()
            }
            Self::Exchange(_) | Self::Verify(_) => "Login failed".to_owned(),
            Self::Seal(_) => "Internal error".to_owned(),
        }
    }
}

impl IntoResponse for LoginError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "login request failed");
        } else {
            info!(error = %self, "login request rejected");
        }
        (status, self.message()).into_response()
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, LoginError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(LoginError::MissingParam(name))
}

/// Start the OIDC flow for a signed login link.
#[tracing::instrument(name = "oidc_login", skip_all)]
pub(crate) async fn login(
    State(AppState { auth, session, .. }): State<AppState>,
    Query(LoginQueryParams {
        original_url,
        now,
        sign,
    }): Query<LoginQueryParams>,
) -> Result<Response, LoginError> {
    let oidc = auth.oidc().ok_or(LoginError::NotConfigured)?;

    let envelope = SignedRedirect {
        original_url: required(original_url, "original_url")?,
        now: required(now, "now")?,
        sign: required(sign, "sign")?,
    };
    envelope.verify(&oidc.client_secret, session.login_link_max_age)?;

    let state = CsrfState::new(envelope.original_url);
    let sealed_state = state.seal(&oidc.cipher).map_err(LoginError::Seal)?;
    let auth_url = oidc
        .provider
        .authorization_url(&sealed_state, &state.nonce, &state.pkce_verifier);

    info!(original_url = %state.original_url, "redirecting to provider authorization endpoint");
    Ok(found(auth_url))
}

/// OIDC callback handler
#[tracing::instrument(name = "oidc_callback", skip_all)]
pub(crate) async fn callback(
    State(AppState { auth, .. }): State<AppState>,
    Query(CallbackQueryParams {
        code,
        state,
        error,
        error_description,
    }): Query<CallbackQueryParams>,
) -> Result<Response, LoginError> {
    let oidc = auth.oidc().ok_or(LoginError::NotConfigured)?;

    if let Some(error) = error {
        return Err(LoginError::Provider {
            error,
            description: error_description.unwrap_or_else(|| "No Description".to_owned()),
        });
    }

    let state = required(state, "state")?;
    let code = required(code, "code")?;
    debug!(code_len = code.len(), "authorization code received");

    let csrf = CsrfState::open(&state, &oidc.cipher).map_err(LoginError::StateTampered)?;
    let mut destination = Url::parse(&csrf.original_url).map_err(LoginError::InvalidOriginalUrl)?;

    let tokens = oidc
        .provider
        .exchange_code(code, csrf.pkce_verifier.clone())
        .await
        .map_err(LoginError::Exchange)?;
    let claims = oidc
        .provider
        .verify(&tokens.id_token, Some(&csrf.nonce))
        .await
        .map_err(LoginError::Verify)?;

    if tokens.refresh_token.is_none() {
        warn!("provider issued no refresh token; the session ends when the ID token expires");
    }
    let credential = Credential {
        id_token: tokens.id_token,
        refresh_token: tokens.refresh_token.unwrap_or_default(),
    };
    let sealed = credential.seal(&oidc.cipher).map_err(LoginError::Seal)?;

    destination.query_pairs_mut().append_pair(COOKIE_SSO, &sealed);
    info!(subject = %claims.subject, host = destination.host_str().unwrap_or_default(), "login completed");
    Ok(found(destination))
}
