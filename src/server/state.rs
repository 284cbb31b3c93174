//! Shared application state handed to every axum handler via `State<AppState>`.

use std::sync::Arc;

use crate::auth::TokenService;
use crate::config::Config;
use crate::dispatcher::Dispatcher;

/// Cloned into every request/handler; all fields are cheap to clone
/// (`Arc`-backed or themselves small).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub token_service: TokenService,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>) -> Self {
        let token_service = TokenService::new(config.jwt_secret.clone(), config.jwt_expires_in());
        Self {
            config: Arc::new(config),
            token_service,
            dispatcher,
        }
    }
}
