use core::time::Duration;

use axum::http::StatusCode;
use tower_http::{
    classify::ServerErrorsFailureClass,
    trace::{DefaultOnFailure, OnFailure},
};

/// Custom failure handling for the trace layer. 503 responses are logged at `INFO` instead of
/// `ERROR`: while OIDC is not configured every filter request ends in one.
#[derive(Clone, Copy)]
pub(crate) struct LevelAdjustingOnFailure;

impl OnFailure<ServerErrorsFailureClass> for LevelAdjustingOnFailure {
    fn on_failure(
        &mut self,
        failure_classification: ServerErrorsFailureClass,
        latency: Duration,
        span: &tracing::Span,
    ) {
        use ServerErrorsFailureClass as S;

        match failure_classification {
            S::StatusCode(StatusCode::SERVICE_UNAVAILABLE) => {
                tracing::info!(classification = %S::StatusCode(StatusCode::SERVICE_UNAVAILABLE), latency = %format!("{} ms", latency.as_millis()), "response failed (downgraded)");
            }
            value => {
                DefaultOnFailure::default().on_failure(value, latency, span);
            }
        }
    }
}

