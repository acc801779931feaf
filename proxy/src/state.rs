use alloc::sync::Arc;

use crate::{
    auth::{self, refresh::RefreshCoordinator},
    config::{GatewayConfig, SessionConfig},
};

/// Application state shared across request handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    /// Authentication runtime (provider, cipher and signing secret)
    pub auth: Arc<auth::Runtime>,

    /// In-flight and recently finished refreshes, keyed by refresh token.
    pub refresh: RefreshCoordinator,

    pub session: SessionConfig,
}

impl AppState {
    pub(crate) fn new(auth: Arc<auth::Runtime>, session: SessionConfig) -> Self {
        Self {
            auth,
            refresh: RefreshCoordinator::new(session.refresh_grace, session.refresh_timeout),
            session,
        }
    }
}

/// Resolve the authentication runtime and assemble the shared state.
///
/// # Errors
///
/// Returns an error if OIDC is configured but the provider cannot be discovered.
#[tracing::instrument(skip_all)]
pub(crate) async fn initialize_state(config: &GatewayConfig) -> eyre::Result<AppState> {
    let runtime = auth::Runtime::from_config(config.oidc.as_ref()).await?;
    Ok(AppState::new(Arc::new(runtime), config.session))
}
