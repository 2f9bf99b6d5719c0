//! Service Context
//!
//! Everything a service needs from its surroundings is handed over explicitly
//! at construction: the cancellation token it must honour and the shared
//! metrics collector.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::Result;

/// Explicit per-service context
#[derive(Clone)]
pub struct ServiceContext {
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl ServiceContext {
    pub fn new(cancel: CancellationToken, metrics: Arc<Metrics>) -> Self {
        Self { cancel, metrics }
    }

    /// Context with a fresh root token and its own metrics registry
    pub fn standalone() -> Result<Self> {
        Ok(Self::new(CancellationToken::new(), Arc::new(Metrics::new()?)))
    }

    /// Token observed by the service's loops
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Derive a context whose token is cancelled with (but not instead of) this one
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}
