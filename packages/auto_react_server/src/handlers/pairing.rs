use axum::{Json, extract::State};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Serialize;
use tracing::warn;

use crate::AppState;
use crate::error::ApiError;
use crate::qr::render_pairing_image;

/// Cookie carrying the caller's session id between `/qr` and `/start`.
pub const SESSION_COOKIE: &str = "sessionId";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrResponse {
    pub session_id: String,
    /// Base64 SVG of the pairing code
    pub qr: String,
    pub qr_data_url: String,
}

/// Begin pairing a new session and hand back its QR code.
pub async fn qr_handler(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<QrResponse>), ApiError> {
    state.metrics.pairing_started();

    let pairing = match state.pairing.begin().await {
        Ok(pairing) => pairing,
        Err(e) => {
            state.metrics.pairing_failed();
            return Err(e.into());
        }
    };

    let image = match render_pairing_image(&pairing.code) {
        Ok(image) => image,
        Err(e) => {
            warn!(
                "Could not render pairing code for session {}: {}",
                pairing.session_id, e
            );
            state.sessions.discard(&pairing.session_id).await;
            state.metrics.pairing_failed();
            return Err(ApiError::Internal(format!(
                "could not render pairing code: {}",
                e
            )));
        }
    };
    state.metrics.pairing_succeeded();

    let cookie = Cookie::build((SESSION_COOKIE, pairing.session_id.clone()))
        .path("/")
        .http_only(true)
        .secure(state.server_config.secure_cookies)
        .same_site(SameSite::Strict);

    Ok((
        jar.add(cookie),
        Json(QrResponse {
            session_id: pairing.session_id,
            qr: image.base64,
            qr_data_url: image.data_url,
        }),
    ))
}
