use core::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{
        HeaderName, Request, StatusCode,
        header::{AUTHORIZATION, COOKIE, SET_COOKIE},
    },
    routing::{self, any, get},
};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt as _, request_id::MakeRequestUuid, timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::{
    auth::{
        CALLBACK_PATH, LOGIN_PATH,
        ext_authz::{self, EXT_AUTHZ_PATH_PREFIX, HEADER_SET_COOKIE_PAYLOAD},
        login,
    },
    http::server::middleware::LevelAdjustingOnFailure,
    state::AppState,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the router: the filter, the login endpoints and a liveness check.
///
/// None of the routes sit behind authentication; the filter is the authentication.
pub(crate) fn create_app_router() -> Router<AppState> {
    Router::new()
        .route(LOGIN_PATH, get(login::login))
        .route(CALLBACK_PATH, get(login::callback))
        .route(EXT_AUTHZ_PATH_PREFIX, any(ext_authz::handle))
        // the wildcard does not match an empty tail
        .route(&format!("{EXT_AUTHZ_PATH_PREFIX}/"), any(ext_authz::handle))
        .route(
            &format!("{EXT_AUTHZ_PATH_PREFIX}/{{*path}}"),
            any(ext_authz::handle),
        )
        .route("/healthz", get(|| async { "ok" }))
}

pub(crate) fn create_app(app_state: AppState) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .sensitive_headers([
            AUTHORIZATION,
            COOKIE,
            SET_COOKIE,
            HeaderName::from_static(HEADER_SET_COOKIE_PAYLOAD),
        ])
        .set_x_request_id(MakeRequestUuid)
        .propagate_x_request_id()
        .layer(
            TraceLayer::new_for_http()
                // query strings carry codes, states and credentials
                .make_span_with(|request: &Request<Body>| {
                    tracing::debug_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                })
                .on_failure(LevelAdjustingOnFailure),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ));

    create_app_router()
        .with_state(app_state)
        .fallback(routing::any(|req: Request<Body>| async move {
            tracing::warn!(method = %req.method(), path = %req.uri().path(), "Unhandled request");
            StatusCode::NOT_FOUND
        }))
        .layer(middleware_stack)
}
