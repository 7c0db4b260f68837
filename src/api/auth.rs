// =============================================================================
// Admin authentication — bearer token gate with engine context
// =============================================================================
//
// `AdminAuth` is the extractor every authenticated endpoint takes. It checks
// the `Authorization: Bearer <token>` header against `VERTEX_ADMIN_TOKEN`
// and, on success, hands the handler the freshly resolved engine
// configuration, so handlers read the trading mode from the same snapshot
// that admitted the request (the LIVE-mode write lockout in rest.rs depends
// on this).
//
// Token comparison hashes both sides with SHA-256 and compares the digests.
// The byte-wise equality then runs over fixed-length values unrelated to
// the secret's bytes, so neither the token length nor a matching prefix
// shows up in response timing.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::app_state::AppState;
use crate::config::EngineConfig;

/// Authenticated admin request. Carries the engine configuration resolved
/// at admission time.
pub struct AdminAuth {
    pub config: EngineConfig,
}

/// Rejection returned when authentication (or config resolution) fails.
pub struct AuthRejection {
    status: StatusCode,
    message: String,
}

impl AuthRejection {
    fn forbidden(message: &str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // Read the expected token on every request so rotation does not
        // require a restart.
        let expected = std::env::var("VERTEX_ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("VERTEX_ADMIN_TOKEN is not set — all admin requests will be rejected");
            return Err(AuthRejection::forbidden("admin authentication not configured"));
        }

        let Some(presented) = bearer_token(parts) else {
            warn!("missing or malformed Authorization header");
            return Err(AuthRejection::forbidden("missing or invalid authorization token"));
        };

        if !token_matches(presented, &expected) {
            warn!("invalid admin token presented");
            return Err(AuthRejection::forbidden("invalid authorization token"));
        }

        let config = EngineConfig::resolve(&state.store).await.map_err(|e| {
            warn!(error = %e, "config resolution failed during admin auth");
            AuthRejection {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "engine configuration unavailable".to_string(),
            }
        })?;

        Ok(AdminAuth { config })
    }
}

/// The token portion of an `Authorization: Bearer <token>` header.
fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Digest-equality token check: SHA-256 both sides, compare the digests.
fn token_matches(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

// =============================================================================
// Tests
// =============================================================================
