use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::HeaderMap,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};

use auto_react::ReactorSnapshot;

use super::pairing::SESSION_COOKIE;
use crate::AppState;
use crate::error::ApiError;

/// Header accepted in place of the session cookie.
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub success: bool,
    pub session_id: String,
    pub channel_id: String,
    pub emoji: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub success: bool,
    pub session_id: String,
}

/// Resolve the caller's session: cookie first, then the header.
fn session_id(jar: &CookieJar, headers: &HeaderMap) -> Result<String, ApiError> {
    jar.get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .or_else(|| {
            headers
                .get(SESSION_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::NoSession)
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{} is required", field)))
}

/// Start auto-reacting for the caller's session
pub async fn start_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    let session_id = session_id(&jar, &headers)?;
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let channel_id = required(request.channel_id, "channelId")?;
    let emoji = required(request.emoji, "emoji")?;

    if let Err(e) = state
        .registry
        .start_reactor(&session_id, &channel_id, &emoji)
        .await
    {
        state.metrics.reactor_start_failed();
        return Err(e.into());
    }
    state.metrics.reactor_started();

    Ok(Json(StartResponse {
        success: true,
        session_id,
        channel_id,
        emoji,
    }))
}

/// Stop the caller's reactor
pub async fn stop_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Json<StopResponse>, ApiError> {
    let session_id = session_id(&jar, &headers)?;
    state.registry.stop_reactor(&session_id).await?;
    state.metrics.reactor_stopped();

    Ok(Json(StopResponse {
        success: true,
        session_id,
    }))
}

/// List running reactors
pub async fn list_reactors_handler(State(state): State<AppState>) -> Json<Vec<ReactorSnapshot>> {
    Json(state.registry.list().await)
}
