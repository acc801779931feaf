//! External-authorization filter.
//!
//! The sidecar forwards every inbound request's headers to `/ext_authz<path>` and lets the
//! request through only on a 200. Any header we set on a 200 (`authgate-sso-userinfo`,
//! `authgate-sso-set-cookie-payload`) is handed to the upstream or the client by the sidecar,
//! and a 401/302 is returned to the client as is.
//!
//! Per request the filter walks:
//! 1. bearer pass-through, if the route opted in;
//! 2. cookie installation, when the one-shot `authgate-sso` parameter is present;
//! 3. credential lookup (bearer first, then cookie), missing means login;
//! 4. ID token verification, with one coordinated refresh if it expired;
//! 5. group check against `authgate-sso-granted-groups`.

use alloc::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use tracing::{Instrument as _, debug, info, info_span, warn};
use url::form_urlencoded;

use crate::{
    auth::{
        OidcRuntime, Resolved,
        cookies::{COOKIE_SSO, clear_session_cookie, create_session_cookie, request_is_secure},
        credential::{Credential, SignedRedirect},
        found,
        oidc::{IdentityClaims, VerifyError},
        not_configured,
        refresh::{RefreshCoordinator, RefreshError, Refreshed},
    },
    config::SessionConfig,
    state::AppState,
};

pub(crate) const EXT_AUTHZ_PATH_PREFIX: &str = "/ext_authz";

pub(crate) const HEADER_ALLOW_BEARER_PASS: &str = "authgate-allow-to-pass-if-has-bearer-token";
pub(crate) const HEADER_GRANTED_GROUPS: &str = "authgate-sso-granted-groups";
pub(crate) const HEADER_USERINFO: &str = "authgate-sso-userinfo";
/// Full `Set-Cookie` value for the refreshed credential, for the sidecar to pass to the client.
pub(crate) const HEADER_SET_COOKIE_PAYLOAD: &str = "authgate-sso-set-cookie-payload";
const HEADER_ENVOY_ORIGINAL_PATH: &str = "x-envoy-original-path";

const GROUP_SEPARATOR: char = '|';

/// Why a request was denied. Each maps to a fixed client-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Denial {
    /// The installation parameter did not open or did not verify.
    InstallRejected,
    /// The ID token failed verification for a reason other than expiry.
    TokenInvalid,
    /// The ID token expired and could not be refreshed.
    RefreshFailed,
    /// Verified identity is in none of the granted groups.
    NotInGrantedGroups,
    /// The refreshed credential could not be sealed.
    Internal,
}

impl Denial {
    const fn message(self) -> &'static str {
        match self {
            Self::InstallRejected => "Invalid credential",
            Self::TokenInvalid => "Invalid token",
            Self::RefreshFailed => "Session expired",
            Self::NotInGrantedGroups => "You are not in any granted group",
            Self::Internal => "Temporarily unable to authorize",
        }
    }

    const fn status(self) -> StatusCode {
        match self {
            Self::Internal => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    const fn clears_session(self) -> bool {
        matches!(
            self,
            Self::TokenInvalid | Self::RefreshFailed | Self::NotInGrantedGroups
        )
    }
}

/// Outcome of one filter request.
#[derive(Debug)]
pub(crate) enum Decision {
    /// Route opted into bearer pass-through and a bearer token is present.
    PassThrough,
    Allow {
        userinfo: Option<String>,
        /// Set when the credential was refreshed on the way.
        refreshed_cookie: Option<Cookie<'static>>,
    },
    /// Set the session cookie and send the browser back without the installation parameter.
    InstallCookie {
        cookie: Cookie<'static>,
        location: String,
    },
    RedirectToLogin {
        location: String,
    },
    Deny {
        denial: Denial,
        secure: bool,
    },
    Unconfigured,
}

impl IntoResponse for Decision {
    fn into_response(self) -> Response {
        match self {
            Self::PassThrough => StatusCode::OK.into_response(),
            Self::Allow {
                userinfo,
                refreshed_cookie,
            } => {
                let mut response = StatusCode::OK.into_response();
                if let Some(userinfo) = userinfo {
                    insert_header(&mut response, HEADER_USERINFO, &userinfo);
                }
                if let Some(cookie) = refreshed_cookie {
                    insert_header(&mut response, HEADER_SET_COOKIE_PAYLOAD, &cookie.to_string());
                }
                response
            }
            Self::InstallCookie { cookie, location } => {
                (CookieJar::new().add(cookie), found(location)).into_response()
            }
            Self::RedirectToLogin { location } => found(location),
            Self::Deny { denial, secure } => {
                let jar = if denial.clears_session() {
                    clear_session_cookie(CookieJar::new(), secure)
                } else {
                    CookieJar::new()
                };
                (jar, (denial.status(), denial.message())).into_response()
            }
            Self::Unconfigured => not_configured(),
        }
    }
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
        Err(e) => warn!(%e, header = name, "dropping header with invalid value"),
    }
}

/// The parts of a filter request the decision depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilterRequest {
    /// Absolute URL the client asked for.
    pub original_url: String,
    pub host: String,
    /// Path and query the client asked for.
    pub original_path: String,
    pub install_credential: Option<String>,
    pub bearer: Option<String>,
    pub cookie: Option<String>,
    pub allow_bearer_pass: bool,
    pub granted_groups: Vec<String>,
    pub secure: bool,
}

impl FilterRequest {
    pub(crate) fn from_parts(headers: &HeaderMap, uri: &Uri) -> Self {
        let original_path = original_path(headers, uri);
        let scheme = header_str(headers, "x-forwarded-proto").unwrap_or("http");
        // The signed login link embeds this host and the callback redirects there with the
        // credential attached, so only the authority the sidecar routed on counts. A
        // client-supplied `x-forwarded-host` is ignored.
        let host = header_str(headers, header::HOST.as_str())
            .or_else(|| uri.host())
            .unwrap_or("localhost");

        let install_credential = original_path.split_once('?').and_then(|(_, query)| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == COOKIE_SSO)
                .map(|(_, value)| value.into_owned())
        });

        let bearer = header_str(headers, header::AUTHORIZATION.as_str())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_owned);

        let cookie = CookieJar::from_headers(headers)
            .get(COOKIE_SSO)
            .map(|c| c.value().to_owned())
            .filter(|value| !value.is_empty());

        Self {
            original_url: format!("{scheme}://{host}{original_path}"),
            host: host.to_owned(),
            install_credential,
            bearer,
            cookie,
            allow_bearer_pass: header_str(headers, HEADER_ALLOW_BEARER_PASS)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            granted_groups: parse_granted_groups(header_str(headers, HEADER_GRANTED_GROUPS)),
            secure: request_is_secure(headers),
            original_path,
        }
    }

    /// Path without the installation parameter.
    fn path_without_install(&self) -> String {
        strip_query_param(&self.original_path, COOKIE_SSO)
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Path and query of the request as the client sent it.
///
/// Envoy reports it in `x-envoy-original-path`; otherwise the filter's own path is used with
/// the `/ext_authz` prefix removed.
fn original_path(headers: &HeaderMap, uri: &Uri) -> String {
    if let Some(path) = header_str(headers, HEADER_ENVOY_ORIGINAL_PATH).filter(|p| !p.is_empty())
    {
        return path.to_owned();
    }
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let stripped = path_and_query
        .strip_prefix(EXT_AUTHZ_PATH_PREFIX)
        .unwrap_or(path_and_query);
    if stripped.starts_with('/') {
        stripped.to_owned()
    } else {
        format!("/{stripped}")
    }
}

/// Removes every occurrence of `param` from the query of `path_and_query`.
pub(crate) fn strip_query_param(path_and_query: &str, param: &str) -> String {
    let (path, query) = path_and_query
        .split_once('?')
        .unwrap_or((path_and_query, ""));
    let path = if path.is_empty() { "/" } else { path };

    let remaining: Vec<_> = form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key != param)
        .collect();
    if remaining.is_empty() {
        return path.to_owned();
    }
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(remaining)
        .finish();
    format!("{path}?{query}")
}

pub(crate) fn parse_granted_groups(header: Option<&str>) -> Vec<String> {
    header
        .map(|raw| {
            raw.split(GROUP_SEPARATOR)
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// An empty granted list admits every identity; otherwise the groups must intersect.
pub(crate) fn is_in_granted_groups(user_groups: &[String], granted: &[String]) -> bool {
    granted.is_empty() || user_groups.iter().any(|g| granted.contains(g))
}

/// What the decision needs besides the request.
pub(crate) struct FilterContext<'a> {
    pub oidc: &'a OidcRuntime,
    pub refresh: &'a RefreshCoordinator,
    pub session: &'a SessionConfig,
}

/// The filter's decision for one request.
pub(crate) async fn decide(ctx: &FilterContext<'_>, request: &FilterRequest) -> Decision {
    if request.allow_bearer_pass && request.bearer.is_some() {
        return Decision::PassThrough;
    }

    if let Some(ref sealed) = request.install_credential {
        return install(ctx, request, sealed).await;
    }

    let Some(sealed) = request.bearer.as_deref().or(request.cookie.as_deref()) else {
        debug!("no credential");
        return login_redirect(ctx, request);
    };
    let credential = match Credential::open(sealed, &ctx.oidc.cipher) {
        Ok(credential) => credential,
        Err(e) => {
            debug!(%e, "credential could not be opened");
            return login_redirect(ctx, request);
        }
    };

    let deny = |denial| Decision::Deny {
        denial,
        secure: request.secure,
    };

    let (credential, claims, refreshed_cookie) =
        match ctx.oidc.provider.verify(&credential.id_token, None).await {
            Ok(claims) => (credential, claims, None),
            Err(VerifyError::Expired) => match refresh_credential(ctx, &credential).await {
                Ok(refreshed) => {
                    let credential = Credential {
                        id_token: refreshed.id_token.clone(),
                        refresh_token: refreshed.refresh_token.clone(),
                    };
                    let sealed = match credential.seal(&ctx.oidc.cipher) {
                        Ok(sealed) => sealed,
                        Err(e) => {
                            warn!(%e, "refreshed credential could not be sealed");
                            return deny(Denial::Internal);
                        }
                    };
                    let cookie =
                        create_session_cookie(sealed, ctx.session.cookie_max_age, request.secure);
                    (credential, refreshed.claims.clone(), Some(cookie))
                }
                Err(e) => {
                    info!(%e, "refresh failed, denying");
                    return deny(Denial::RefreshFailed);
                }
            },
            Err(VerifyError::Invalid(reason)) => {
                info!(%reason, "invalid token, denying");
                return deny(Denial::TokenInvalid);
            }
        };

    authorize(&credential, &claims, request, refreshed_cookie)
}

fn authorize(
    credential: &Credential,
    claims: &IdentityClaims,
    request: &FilterRequest,
    refreshed_cookie: Option<Cookie<'static>>,
) -> Decision {
    if !is_in_granted_groups(&claims.groups, &request.granted_groups) {
        info!(
            subject = %claims.subject,
            groups = ?claims.groups,
            granted = ?request.granted_groups,
            "not in any granted group, denying"
        );
        return Decision::Deny {
            denial: Denial::NotInGrantedGroups,
            secure: request.secure,
        };
    }
    info!(subject = %claims.subject, refreshed = refreshed_cookie.is_some(), "allowed");
    Decision::Allow {
        userinfo: credential.userinfo().map(str::to_owned),
        refreshed_cookie,
    }
}

async fn install(ctx: &FilterContext<'_>, request: &FilterRequest, sealed: &str) -> Decision {
    let reject = || Decision::Deny {
        denial: Denial::InstallRejected,
        secure: request.secure,
    };
    let credential = match Credential::open(sealed, &ctx.oidc.cipher) {
        Ok(credential) => credential,
        Err(e) => {
            info!(%e, "installation credential could not be opened");
            return reject();
        }
    };
    if let Err(e) = ctx.oidc.provider.verify(&credential.id_token, None).await {
        info!(%e, "installation credential failed verification");
        return reject();
    }
    let location = request.path_without_install();
    info!(%location, "installing session cookie");
    Decision::InstallCookie {
        cookie: create_session_cookie(sealed.to_owned(), ctx.session.cookie_max_age, request.secure),
        location,
    }
}

fn login_redirect(ctx: &FilterContext<'_>, request: &FilterRequest) -> Decision {
    let envelope = SignedRedirect::issue(request.original_url.clone(), &ctx.oidc.client_secret);
    Decision::RedirectToLogin {
        location: envelope.to_login_url(&ctx.oidc.login_url).into(),
    }
}

async fn refresh_credential(
    ctx: &FilterContext<'_>,
    credential: &Credential,
) -> Result<Arc<Refreshed>, RefreshError> {
    if credential.refresh_token.is_empty() {
        return Err(RefreshError::Rejected("session has no refresh token".to_owned()));
    }
    let provider = Arc::clone(&ctx.oidc.provider);
    let refresh_token = credential.refresh_token.clone();
    ctx.refresh
        .refresh(&credential.refresh_token, move || async move {
            let tokens = provider
                .refresh(refresh_token.clone())
                .await
                .map_err(|e| RefreshError::Rejected(e.to_string()))?;
            let claims = provider
                .verify(&tokens.id_token, None)
                .await
                .map_err(|e| RefreshError::Rejected(e.to_string()))?;
            Ok::<_, RefreshError>(Refreshed {
                id_token: tokens.id_token,
                // Providers that do not rotate keep the old refresh token valid.
                refresh_token: tokens.refresh_token.unwrap_or(refresh_token),
                claims,
            })
        })
        .await
}

fn client_ip(headers: &HeaderMap) -> &str {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| header_str(headers, "x-real-ip"))
        .unwrap_or("-")
}

/// Filter endpoint, `ANY /ext_authz` and `ANY /ext_authz/*`.
pub(crate) async fn handle(
    State(AppState {
        auth,
        refresh,
        session,
    }): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let Resolved::Oidc(ref oidc) = auth.mode else {
        warn!("filter request while OIDC is not configured");
        return Decision::Unconfigured.into_response();
    };

    let request = FilterRequest::from_parts(&headers, &uri);
    // The query may carry a credential, so only the path is logged.
    let span = info_span!(
        "ext_authz",
        client_ip = %client_ip(&headers),
        host = %request.host,
        path = %request.original_path.split('?').next().unwrap_or_default(),
    );

    let ctx = FilterContext {
        oidc,
        refresh: &refresh,
        session: &session,
    };
    decide(&ctx, &request).instrument(span).await.into_response()
}
