use std::sync::Arc;

use axum::{extract::State, Json};

use crate::{config::UserConfig, relay::AppState};

/// `GET /user`: the configured placeholder identity.
///
/// The relay has no user accounts; the front-end only needs something to
/// display.
pub async fn current_user(State(state): State<Arc<AppState>>) -> Json<UserConfig> {
    Json(state.config.user.clone())
}
