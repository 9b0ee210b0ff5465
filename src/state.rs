//! Shared application state.

use std::sync::Arc;

use crate::bridge::LspBridge;
use crate::config::Config;
use crate::jobs::ExecutionService;
use crate::session::SessionService;

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub executions: Arc<ExecutionService>,
    pub bridge: Arc<LspBridge>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionService>,
        executions: Arc<ExecutionService>,
        bridge: Arc<LspBridge>,
        config: Config,
    ) -> Self {
        Self {
            sessions,
            executions,
            bridge,
            config: Arc::new(config),
        }
    }
}
