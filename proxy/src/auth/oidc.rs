use core::{error::Error, str::FromStr as _, time::Duration};
use std::{
    sync::{Mutex, PoisonError, RwLock, RwLockReadGuard},
    time::Instant,
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use eyre::{WrapErr as _, eyre};
use futures::future::BoxFuture;
use oauth2_reqwest::ReqwestClient;
use openidconnect::{
    AuthorizationCode, ClaimsVerificationError, ClientId, ClientSecret, CsrfToken,
    EndpointMaybeSet, EndpointNotSet, EndpointSet, ErrorResponse, IssuerUrl, Nonce,
    OAuth2TokenResponse as _, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken,
    RequestTokenError, Scope,
    core::{
        CoreAuthenticationFlow, CoreClient, CoreIdToken, CoreProviderMetadata, CoreTokenResponse,
    },
};
use reqwest::redirect::Policy;
use secrecy::ExposeSecret as _;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{auth::CALLBACK_PATH, config::OidcConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Minimum time between two discovery runs triggered by signature failures.
const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Identity extracted from a verified ID token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IdentityClaims {
    pub subject: String,
    pub groups: Vec<String>,
    /// Unix seconds.
    pub expires_at: i64,
}

/// Tokens returned by the provider's token endpoint.
#[derive(Clone)]
pub(crate) struct TokenSet {
    pub id_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum VerifyError {
    #[error("identity token has expired")]
    Expired,
    #[error("identity token is invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ProviderError {
    #[error("identity provider rejected the request: {0}")]
    Rejected(String),
    #[error("identity provider could not be reached: {0}")]
    Transport(String),
    #[error("token response did not contain an id_token")]
    MissingIdToken,
}

/// The operations the gateway needs from an OpenID Connect provider.
///
/// Key material is cached; verification only goes to the network when a signature does not
/// match the cached keys, which is how a key rotation at the provider shows up.
pub(crate) trait IdentityProvider: Send + Sync {
    /// URL of the provider's authorization endpoint for a login with the given state, nonce
    /// and PKCE verifier (only its S256 challenge is sent).
    fn authorization_url(&self, state: &str, nonce: &str, pkce_verifier: &str) -> String;

    /// Checks signature, issuer, audience and expiry, plus the nonce when one is expected.
    fn verify<'a>(
        &'a self,
        id_token: &'a str,
        expected_nonce: Option<&'a str>,
    ) -> BoxFuture<'a, Result<IdentityClaims, VerifyError>>;

    fn exchange_code(
        &self,
        code: String,
        pkce_verifier: String,
    ) -> BoxFuture<'_, Result<TokenSet, ProviderError>>;

    fn refresh(&self, refresh_token: String) -> BoxFuture<'_, Result<TokenSet, ProviderError>>;
}

// Ready-to-use OIDC client type with the endpoints we require set
pub(crate) type OidcClientReady = CoreClient<
    EndpointSet,      // HasAuthUrl
    EndpointNotSet,   // HasDeviceAuthUrl
    EndpointNotSet,   // HasIntrospectionUrl (OIDC discovery does not provide this)
    EndpointNotSet,   // HasRevocationUrl (OIDC discovery does not provide this)
    EndpointSet,      // HasTokenUrl
    EndpointMaybeSet, // HasUserInfoUrl (from discovery, optional)
>;

/// [`IdentityProvider`] backed by a discovered OpenID Connect provider.
pub(crate) struct OpenIdProvider {
    /// Replaced when discovery is re-run after the provider rotated its keys. Never held
    /// across an `.await`.
    client: RwLock<OidcClientReady>,
    http: reqwest::Client,
    config: OidcConfig,
    rediscovered_at: Mutex<Option<Instant>>,
}

impl OpenIdProvider {
    /// Runs discovery (metadata and JWKS) against the configured issuer.
    pub(crate) async fn discover(cfg: &OidcConfig) -> eyre::Result<Self> {
        let client = build_client(cfg).await?;

        // Token calls must not follow redirects.
        let http = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .wrap_err("failed to build HTTP client")?;

        Ok(Self {
            client: RwLock::new(client),
            http,
            config: cfg.clone(),
            rediscovered_at: Mutex::new(None),
        })
    }

    fn http_client(&self) -> ReqwestClient {
        ReqwestClient::from(self.http.clone())
    }

    fn client(&self) -> RwLockReadGuard<'_, OidcClientReady> {
        self.client.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_claims(
        &self,
        token: &CoreIdToken,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<IdentityClaims, ClaimsVerificationError> {
        let client = self.client();
        let verifier = client.id_token_verifier();
        let claims = match expected_nonce {
            Some(expected) => token.claims(&verifier, &Nonce::new(expected.to_owned())),
            None => token.claims(&verifier, skip_nonce_check),
        }?;

        Ok(IdentityClaims {
            subject: claims.subject().to_string(),
            groups: groups_claim(id_token),
            expires_at: claims.expiration().timestamp(),
        })
    }

    /// Re-runs discovery to pick up rotated keys, at most once per [`REDISCOVERY_INTERVAL`].
    ///
    /// Returns `true` if the client was replaced.
    async fn rediscover(&self) -> bool {
        {
            let mut last = self
                .rediscovered_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| at.elapsed() < REDISCOVERY_INTERVAL) {
                debug!("provider keys were refreshed recently, not refreshing again");
                return false;
            }
            *last = Some(Instant::now());
        }
        info!(issuer = %self.config.provider_url, "refreshing provider keys");
        match build_client(&self.config).await {
            Ok(client) => {
                *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
                true
            }
            Err(e) => {
                warn!(error = ?e, "failed to refresh provider keys");
                false
            }
        }
    }
}

async fn build_client(cfg: &OidcConfig) -> eyre::Result<OidcClientReady> {
    let discovery_http = reqwest::Client::builder()
        .redirect(Policy::limited(3))
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .wrap_err("failed to build HTTP client")?;

    let issuer = IssuerUrl::new(cfg.provider_url.clone()).wrap_err("invalid issuer URL")?;
    let provider_metadata =
        CoreProviderMetadata::discover_async(issuer, &ReqwestClient::from(discovery_http))
            .await
            .wrap_err("OIDC discovery failed")?;

    let redirect_url = RedirectUrl::new(format!(
        "{}{CALLBACK_PATH}",
        cfg.auth_proxy_url.trim_end_matches('/')
    ))
    .wrap_err("invalid redirect URL")?;
    debug!(redirect_uri = %redirect_url.as_str(), "OIDC redirect URI computed");

    let client = CoreClient::from_provider_metadata(
        provider_metadata.clone(),
        ClientId::new(cfg.client_id.clone()),
        Some(ClientSecret::new(
            cfg.client_secret.expose_secret().to_owned(),
        )),
    )
    .set_auth_uri(provider_metadata.authorization_endpoint().clone())
    .set_redirect_uri(redirect_url);
    if let Some(token_url) = provider_metadata.token_endpoint().cloned() {
        Ok(client.set_token_uri(token_url))
    } else {
        Err(eyre!("OIDC provider missing token endpoint"))
    }
}

impl IdentityProvider for OpenIdProvider {
    fn authorization_url(&self, state: &str, nonce: &str, pkce_verifier: &str) -> String {
        let state = state.to_owned();
        let nonce = nonce.to_owned();
        let challenge = PkceCodeChallenge::from_code_verifier_sha256(&PkceCodeVerifier::new(
            pkce_verifier.to_owned(),
        ));

        let client = self.client();
        let mut authorize = client.authorize_url(
            CoreAuthenticationFlow::AuthorizationCode,
            move || CsrfToken::new(state),
            move || Nonce::new(nonce),
        );
        // `openid` is always requested by the flow itself
        for s in self.config.scopes.iter().filter(|s| s.as_str() != "openid") {
            authorize = authorize.add_scope(Scope::new(s.clone()));
        }
        let (auth_url, _, _) = authorize.set_pkce_challenge(challenge).url();
        auth_url.to_string()
    }

    fn verify<'a>(
        &'a self,
        id_token: &'a str,
        expected_nonce: Option<&'a str>,
    ) -> BoxFuture<'a, Result<IdentityClaims, VerifyError>> {
        Box::pin(async move {
            let token = CoreIdToken::from_str(id_token)
                .map_err(|e| VerifyError::Invalid(e.to_string()))?;
            let first = self.check_claims(&token, id_token, expected_nonce);
            // An unknown `kid` or a signature from a new key means the cached JWKS is stale.
            let outcome = if matches!(first, Err(ClaimsVerificationError::SignatureVerification(_)))
                && self.rediscover().await
            {
                self.check_claims(&token, id_token, expected_nonce)
            } else {
                first
            };
            outcome.map_err(classify_claims_error)
        })
    }

    fn exchange_code(
        &self,
        code: String,
        pkce_verifier: String,
    ) -> BoxFuture<'_, Result<TokenSet, ProviderError>> {
        Box::pin(async move {
            debug!(code_len = code.len(), "exchanging authorization code");
            let client = self.client().clone();
            let token_response = client
                .exchange_code(AuthorizationCode::new(code))
                .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
                .request_async(&self.http_client())
                .await
                .map_err(classify_request_error)?;
            token_set(&token_response)
        })
    }

    fn refresh(&self, refresh_token: String) -> BoxFuture<'_, Result<TokenSet, ProviderError>> {
        Box::pin(async move {
            let refresh_token = RefreshToken::new(refresh_token);
            let client = self.client().clone();
            let token_response = client
                .exchange_refresh_token(&refresh_token)
                .request_async(&self.http_client())
                .await
                .map_err(classify_request_error)?;
            token_set(&token_response)
        })
    }
}

#[expect(
    clippy::unnecessary_wraps,
    reason = "signature required by the nonce verifier"
)]
fn skip_nonce_check(_: Option<&Nonce>) -> Result<(), String> {
    Ok(())
}

fn token_set(token_response: &CoreTokenResponse) -> Result<TokenSet, ProviderError> {
    let id_token = token_response
        .extra_fields()
        .id_token()
        .ok_or(ProviderError::MissingIdToken)?
        .to_string();
    let refresh_token = token_response
        .refresh_token()
        .map(|t| t.secret().clone());
    Ok(TokenSet {
        id_token,
        refresh_token,
    })
}

/// Separates errors the provider answered with from failures to talk to it at all.
fn classify_request_error<RE, T>(err: RequestTokenError<RE, T>) -> ProviderError
where
    RE: Error + 'static,
    T: ErrorResponse + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            ProviderError::Rejected(response.to_string())
        }
        RequestTokenError::Parse(e, _) => ProviderError::Rejected(e.to_string()),
        other => ProviderError::Transport(other.to_string()),
    }
}

/// Expiry is recognized by its typed variant. Some providers surface it through other
/// variants, so the message is checked as a fallback.
fn classify_claims_error(err: ClaimsVerificationError) -> VerifyError {
    match err {
        ClaimsVerificationError::Expired(_) => VerifyError::Expired,
        other => classify_message(other.to_string()),
    }
}

fn classify_message(message: String) -> VerifyError {
    if message.to_ascii_lowercase().contains("expire") {
        VerifyError::Expired
    } else {
        VerifyError::Invalid(message)
    }
}

/// Middle segment of a compact JWS, as sent to upstreams in the userinfo header.
pub(crate) fn payload_segment(jwt: &str) -> Option<&str> {
    let mut parts = jwt.split('.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || payload.is_empty() {
        return None;
    }
    Some(payload)
}

#[derive(Deserialize)]
struct GroupsClaim {
    #[serde(default)]
    groups: Vec<String>,
}

/// Reads the `groups` claim, which the standard claim types do not model.
///
/// Only called on tokens whose signature has already been verified.
pub(crate) fn groups_claim(jwt: &str) -> Vec<String> {
    payload_segment(jwt)
        .and_then(|segment| URL_SAFE_NO_PAD.decode(segment).ok())
        .and_then(|raw| serde_json::from_slice::<GroupsClaim>(&raw).ok())
        .map(|claim| claim.groups)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(payload: &str) -> String {
        format!(
            "eyJhbGciOiJSUzI1NiJ9.{}.c2lnbmF0dXJl",
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn payload_segment_requires_three_parts() {
        assert_eq!(payload_segment("a.b.c"), Some("b"), "well formed");
        assert_eq!(payload_segment("a.b"), None, "two parts");
        assert_eq!(payload_segment("a.b.c.d"), None, "four parts");
        assert_eq!(payload_segment("a..c"), None, "empty payload");
    }

    #[test]
    fn groups_are_read_from_payload() {
        let token = jwt(r#"{"sub":"alice","groups":["dev","ops"]}"#);
        assert_eq!(groups_claim(&token), ["dev", "ops"], "groups");
    }

    #[test]
    fn missing_or_malformed_groups_are_empty() {
        assert!(groups_claim(&jwt(r#"{"sub":"alice"}"#)).is_empty(), "absent");
        assert!(
            groups_claim(&jwt(r#"{"groups":"dev"}"#)).is_empty(),
            "wrong type"
        );
        assert!(groups_claim("not-a-jwt").is_empty(), "garbage");
    }

    mod rotation {
        use alloc::sync::Arc;
        use core::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Once;

        use axum::{Json, Router, extract::State, routing::get};
        use chrono::{TimeDelta, Utc};
        use openidconnect::{
            Audience, AuthUrl, EmptyAdditionalClaims, EmptyAdditionalProviderMetadata, JsonWebKeyId,
            JsonWebKeySetUrl, PrivateSigningKey as _, ResponseTypes, StandardClaims,
            SubjectIdentifier, TokenUrl,
            core::{
                CoreIdTokenClaims, CoreJsonWebKeySet, CoreJwsSigningAlgorithm, CoreResponseType,
                CoreRsaPrivateSigningKey, CoreSubjectIdentifierType,
            },
        };
        use secrecy::SecretString;
        use serde_json::Value;

        use super::*;

        static INIT_RUSTLS: Once = Once::new();

        struct Issuer {
            metadata: Value,
            jwks: Mutex<Value>,
            jwks_fetches: AtomicUsize,
        }

        fn key(pem: &str, kid: &str) -> CoreRsaPrivateSigningKey {
            CoreRsaPrivateSigningKey::from_pem(pem, Some(JsonWebKeyId::new(kid.to_owned())))
                .unwrap()
        }

        fn jwks_of(key: &CoreRsaPrivateSigningKey) -> Value {
            serde_json::to_value(CoreJsonWebKeySet::new(vec![key.as_verification_key()])).unwrap()
        }

        fn sign(key: &CoreRsaPrivateSigningKey, issuer: &str) -> String {
            let now = Utc::now();
            let claims = CoreIdTokenClaims::new(
                IssuerUrl::new(issuer.to_owned()).unwrap(),
                vec![Audience::new("gateway".to_owned())],
                now + TimeDelta::minutes(5),
                now,
                StandardClaims::new(SubjectIdentifier::new("alice".to_owned())),
                EmptyAdditionalClaims {},
            );
            CoreIdToken::new(
                claims,
                key,
                CoreJwsSigningAlgorithm::RsaSsaPkcs1V15Sha256,
                None,
                None,
            )
            .unwrap()
            .to_string()
        }

        /// Serves discovery metadata and a swappable key set on an ephemeral port.
        async fn spawn_issuer(first_keys: Value) -> (String, Arc<Issuer>) {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let metadata = CoreProviderMetadata::new(
                IssuerUrl::new(base.clone()).unwrap(),
                AuthUrl::new(format!("{base}/authorize")).unwrap(),
                JsonWebKeySetUrl::new(format!("{base}/jwks")).unwrap(),
                vec![ResponseTypes::new(vec![CoreResponseType::Code])],
                vec![CoreSubjectIdentifierType::Public],
                vec![CoreJwsSigningAlgorithm::RsaSsaPkcs1V15Sha256],
                EmptyAdditionalProviderMetadata {},
            )
            .set_token_endpoint(Some(TokenUrl::new(format!("{base}/token")).unwrap()));
            let issuer = Arc::new(Issuer {
                metadata: serde_json::to_value(&metadata).unwrap(),
                jwks: Mutex::new(first_keys),
                jwks_fetches: AtomicUsize::new(0),
            });

            let app = Router::new()
                .route(
                    "/.well-known/openid-configuration",
                    get(|State(issuer): State<Arc<Issuer>>| async move {
                        Json(issuer.metadata.clone())
                    }),
                )
                .route(
                    "/jwks",
                    get(|State(issuer): State<Arc<Issuer>>| async move {
                        issuer.jwks_fetches.fetch_add(1, Ordering::SeqCst);
                        Json(issuer.jwks.lock().unwrap().clone())
                    }),
                )
                .with_state(Arc::clone(&issuer));
            tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
            (base, issuer)
        }

        #[tokio::test]
        async fn rotated_keys_are_picked_up_once() {
            INIT_RUSTLS.call_once(|| {
                rustls_openssl::default_provider()
                    .install_default()
                    .expect("failed to install default rustls provider");
            });
            let key_a = key(include_str!("testdata/signing_key_a.pem"), "a");
            let key_b = key(include_str!("testdata/signing_key_b.pem"), "b");
            let (base, issuer) = spawn_issuer(jwks_of(&key_a)).await;

            let cfg = OidcConfig {
                client_id: "gateway".to_owned(),
                client_secret: Arc::new(SecretString::from("client-secret")),
                provider_url: base.clone(),
                auth_proxy_url: "https://auth.example.com".to_owned(),
                scopes: vec!["openid".to_owned()],
                discovery_attempts: 1,
            };
            let provider = OpenIdProvider::discover(&cfg).await.unwrap();
            assert_eq!(issuer.jwks_fetches.load(Ordering::SeqCst), 1, "initial fetch");

            let claims = provider.verify(&sign(&key_a, &base), None).await.unwrap();
            assert_eq!(claims.subject, "alice", "current key verifies");
            assert_eq!(
                issuer.jwks_fetches.load(Ordering::SeqCst),
                1,
                "no fetch while keys match"
            );

            *issuer.jwks.lock().unwrap() = jwks_of(&key_b);
            let claims = provider.verify(&sign(&key_b, &base), None).await.unwrap();
            assert_eq!(claims.subject, "alice", "new key verifies after refresh");
            assert_eq!(
                issuer.jwks_fetches.load(Ordering::SeqCst),
                2,
                "keys fetched again"
            );

            let retired = provider.verify(&sign(&key_a, &base), None).await;
            assert!(
                matches!(retired, Err(VerifyError::Invalid(_))),
                "retired key is rejected: {retired:?}"
            );
            assert_eq!(
                issuer.jwks_fetches.load(Ordering::SeqCst),
                2,
                "refresh is rate limited"
            );
        }
    }

    #[test]
    fn expiry_message_fallback() {
        assert_eq!(
            classify_message("ID token Expired at 2024-01-01".to_owned()),
            VerifyError::Expired,
            "case insensitive"
        );
        assert!(
            matches!(
                classify_message("signature verification failed".to_owned()),
                VerifyError::Invalid(_)
            ),
            "other failures stay invalid"
        );
    }
}
