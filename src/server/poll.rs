//! The last-resort polling endpoint.

use crate::auth::PushAuth;
use crate::types::PollData;
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{instrument, warn};

use super::PushState;

/// Returns the current snapshot plus a `poll_interval` hint the client uses
/// to pace its ticks.
#[instrument(skip_all, fields(user_id = %user_id))]
pub async fn poll_handler(State(state): State<PushState>, PushAuth(user_id): PushAuth) -> Response {
    match state.dispatcher.fetch(&user_id).await {
        Ok(snapshot) => {
            let data = PollData::from_snapshot(snapshot, state.poll_interval_secs());
            Json(serde_json::json!({ "success": true, "data": data })).into_response()
        }
        Err(e) => {
            warn!("poll fetch failed: {e}");
            let body = Json(serde_json::json!({
                "success": false,
                "error": e.to_string(),
            }));
            (StatusCode::BAD_GATEWAY, body).into_response()
        }
    }
}
