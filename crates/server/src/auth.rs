//! API key checks.
//!
//! When `--api-key` is configured, `/api/*` requests must carry
//! `Authorization: Bearer <key>` (or `?token=<key>`), and websocket clients
//! must either pass `?token=` on the upgrade or send an `auth` frame first.
//! `/health` stays open.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Compare without short-circuiting on the first differing byte.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = presented.as_bytes();
    let b = expected.as_bytes();
    let mut diff = a.len() ^ b.len();
    for (i, byte) in b.iter().enumerate() {
        let other = a.get(i).copied().unwrap_or(0);
        diff |= usize::from(other ^ byte);
    }
    diff == 0
}

/// `token=` value from a raw query string
pub fn query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

pub async fn auth_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if bearer.is_some_and(|token| tokens_match(token, &expected_token)) {
        return Ok(next.run(req).await);
    }

    if query_token(req.uri().query()).is_some_and(|token| tokens_match(token, &expected_token)) {
        return Ok(next.run(req).await);
    }

    tracing::warn!(
        component = "auth",
        event = "auth.rejected",
        path = %req.uri().path(),
        "Rejected request without valid API key"
    );
    Err(StatusCode::UNAUTHORIZED)
}
