use std::sync::Arc;

use crate::metrics::MetricsEngine;
use crate::session::SessionManager;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub metrics: Arc<MetricsEngine>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>, metrics: Arc<MetricsEngine>) -> Self {
        Self { manager, metrics }
    }
}
