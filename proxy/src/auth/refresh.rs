//! Single-flight refresh of expired ID tokens.
//!
//! Browsers fire many requests at once, and after the ID token expires each of them reaches the
//! filter holding the same refresh token. Providers rotate refresh tokens, so only one of those
//! requests may talk to the provider. The first caller for a refresh token becomes the producer,
//! every later caller waits for the producer's outcome. The outcome stays available for a grace
//! window so stragglers that still carry the old cookie get the same tokens.
//!
//! The coordinator is process local; replicas behind a load balancer need sticky routing.

use alloc::sync::Arc;
use core::time::Duration;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::{sync::watch, time};
use tracing::{debug, warn};

use crate::auth::oidc::IdentityClaims;

/// Tokens (and the identity they verified to) produced by a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Refreshed {
    pub id_token: String,
    pub refresh_token: String,
    pub claims: IdentityClaims,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum RefreshError {
    #[error("refresh was rejected: {0}")]
    Rejected(String),
    #[error("refresh did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("refresh ended without an outcome")]
    Aborted,
}

pub(crate) type RefreshOutcome = Result<Arc<Refreshed>, RefreshError>;

type Slot = watch::Sender<Option<RefreshOutcome>>;
type InFlight = HashMap<String, Arc<Slot>>;

enum Role {
    Producer(Arc<Slot>),
    Consumer(watch::Receiver<Option<RefreshOutcome>>),
}

/// Shares refresh outcomes between concurrent requests carrying the same refresh token.
#[derive(Clone)]
pub(crate) struct RefreshCoordinator {
    inflight: Arc<Mutex<InFlight>>,
    grace: Duration,
    timeout: Duration,
}

impl RefreshCoordinator {
    pub(crate) fn new(grace: Duration, timeout: Duration) -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            grace,
            timeout,
        }
    }

    /// Returns the outcome of refreshing `refresh_token`, calling `produce` only if no refresh
    /// for that token is running or recently finished.
    ///
    /// `produce` runs on its own task, so a caller that goes away does not cancel the refresh
    /// others are waiting on.
    pub(crate) async fn refresh<F, Fut>(&self, refresh_token: &str, produce: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Refreshed, RefreshError>> + Send + 'static,
    {
        match self.join(refresh_token) {
            Role::Producer(slot) => {
                debug!("starting refresh");
                let rx = slot.subscribe();
                let this = self.clone();
                let key = refresh_token.to_owned();
                tokio::spawn(async move {
                    let outcome = this.run(produce).await;
                    if let Err(ref e) = outcome {
                        warn!(%e, "refresh failed");
                    }
                    slot.send_replace(Some(outcome));
                    time::sleep(this.grace).await;
                    this.evict(&key, &slot);
                });
                wait(rx).await
            }
            Role::Consumer(rx) => {
                debug!("joining refresh in flight");
                wait(rx).await
            }
        }
    }

    async fn run<F, Fut>(&self, produce: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Refreshed, RefreshError>> + Send + 'static,
    {
        let mut task = tokio::spawn(produce());
        match time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result.map(Arc::new),
            Ok(Err(join_error)) => {
                warn!(%join_error, "refresh task failed");
                Err(RefreshError::Aborted)
            }
            Err(_) => {
                task.abort();
                Err(RefreshError::TimedOut(self.timeout))
            }
        }
    }

    fn join(&self, refresh_token: &str) -> Role {
        let mut inflight = self.lock();
        if let Some(slot) = inflight.get(refresh_token) {
            return Role::Consumer(slot.subscribe());
        }
        let (tx, _) = watch::channel(None);
        let slot = Arc::new(tx);
        inflight.insert(refresh_token.to_owned(), Arc::clone(&slot));
        Role::Producer(slot)
    }

    /// Removes the entry unless it was already replaced by a newer refresh.
    fn evict(&self, refresh_token: &str, slot: &Arc<Slot>) {
        let mut inflight = self.lock();
        if inflight
            .get(refresh_token)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            inflight.remove(refresh_token);
        }
    }

    fn lock(&self) -> MutexGuard<'_, InFlight> {
        // The map stays consistent even if a holder panicked; every critical section is a
        // single lookup, insert or remove.
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

async fn wait(mut rx: watch::Receiver<Option<RefreshOutcome>>) -> RefreshOutcome {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Err(RefreshError::Aborted)),
        Err(_) => Err(RefreshError::Aborted),
    }
}
