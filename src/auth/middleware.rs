use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::context::RequestContext;
use super::rate_limit::RateLimiter;
use super::token_store::{hash_token, TokenStore};
use super::user_store::UserStore;
use super::CredentialError;
use crate::config::AuthConfig;

/// Tool name the middleware lets through unauthenticated so users can
/// obtain a session.
pub const LOGIN_TOOL: &str = "login";

/// Cap on the body buffered for the login peek. Larger requests are
/// rejected before parsing.
pub const MAX_PEEK_BYTES: usize = 1024 * 1024;

/// Fixed client-facing failure strings. Validation details stay in logs.
pub const MSG_MISSING_HEADER: &str = "missing Authorization header";
pub const MSG_MALFORMED_HEADER: &str = "invalid Authorization header format";
pub const MSG_INVALID_TOKEN: &str = "Invalid or unknown token";
pub const MSG_RATE_LIMITED: &str = "too many failed authentication attempts";

/// Shared state for the auth middleware layer.
pub struct AuthState {
    pub config: AuthConfig,
    pub tokens: Arc<TokenStore>,
    pub users: Arc<UserStore>,
    pub limiter: Arc<RateLimiter>,
}

/// Minimal shape peeked out of a JSON-RPC body to detect the login call.
#[derive(Deserialize)]
struct PeekRequest {
    method: Option<String>,
    params: Option<PeekParams>,
}

#[derive(Deserialize)]
struct PeekParams {
    name: Option<String>,
}

/// Best-effort client IP: first X-Forwarded-For entry, else peer address.
fn client_ip(request: &Request<Body>) -> Option<IpAddr> {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return Some(ip);
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}

fn ip_string(ip: Option<IpAddr>) -> String {
    ip.map(|i| i.to_string()).unwrap_or_default()
}

/// Bearer-auth middleware for the HTTP transport.
///
/// Public paths and the login tool call pass through without a principal
/// (the login call gets an anonymous context carrying the client IP).
/// Everything else must present a valid service or session token, which
/// ends up in the request extensions as an immutable [`RequestContext`].
pub async fn require_bearer(
    State(state): State<Arc<AuthState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let ip = client_ip(&request);

    if !state.config.enabled {
        let mut request = request;
        request
            .extensions_mut()
            .insert(RequestContext::anonymous(ip_string(ip)));
        return Ok(next.run(request).await);
    }

    let path = request.uri().path().to_string();
    if state.config.public_paths.iter().any(|p| p == &path) {
        return Ok(next.run(request).await);
    }

    // Peek POST bodies for the login tool call. The body is restored for
    // downstream handlers regardless of the outcome.
    let (request, is_login) = if request.method() == axum::http::Method::POST {
        peek_login(request).await?
    } else {
        (request, false)
    };

    if is_login {
        // Rate limiting still applies to login attempts, ahead of any
        // password verification.
        if let Some(ip) = ip {
            if !state.limiter.allow(ip) {
                return Err((StatusCode::TOO_MANY_REQUESTS, MSG_RATE_LIMITED).into_response());
            }
        }
        let mut request = request;
        request
            .extensions_mut()
            .insert(RequestContext::anonymous(ip_string(ip)));
        return Ok(next.run(request).await);
    }

    let Some(value) = request.headers().get(header::AUTHORIZATION) else {
        return Err((StatusCode::UNAUTHORIZED, MSG_MISSING_HEADER).into_response());
    };
    let value = value
        .to_str()
        .map_err(|_| (StatusCode::UNAUTHORIZED, MSG_MALFORMED_HEADER).into_response())?;
    let token = match value.strip_prefix("Bearer ") {
        Some(t) if !t.trim().is_empty() => t.trim().to_string(),
        _ => return Err((StatusCode::UNAUTHORIZED, MSG_MALFORMED_HEADER).into_response()),
    };

    if let Some(ip) = ip {
        if !state.limiter.allow(ip) {
            return Err((StatusCode::TOO_MANY_REQUESTS, MSG_RATE_LIMITED).into_response());
        }
    }

    let ctx = match state.tokens.validate(&token) {
        Ok(()) => RequestContext::service(hash_token(&token), ip_string(ip)),
        Err(CredentialError::Unknown) => match state.users.validate_session_token(&token) {
            Ok(username) => RequestContext::session(hash_token(&token), username, ip_string(ip)),
            Err(e) => {
                tracing::debug!(reason = %e, "session token rejected");
                if let Some(ip) = ip {
                    state.limiter.record_failure(ip);
                }
                return Err((StatusCode::UNAUTHORIZED, MSG_INVALID_TOKEN).into_response());
            }
        },
        Err(e) => {
            tracing::debug!(reason = %e, "service token rejected");
            if let Some(ip) = ip {
                state.limiter.record_failure(ip);
            }
            return Err((StatusCode::UNAUTHORIZED, MSG_INVALID_TOKEN).into_response());
        }
    };

    let mut request = request;
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

/// Buffer the body (bounded), decide whether it names the login tool, and
/// hand back an equivalent request. This is the middleware's only
/// side-effect on requests.
async fn peek_login(request: Request<Body>) -> Result<(Request<Body>, bool), Response> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_PEEK_BYTES)
        .await
        .map_err(|_| {
            (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
        })?;

    let is_login = match serde_json::from_slice::<PeekRequest>(&bytes) {
        Ok(peek) => {
            peek.method.as_deref() == Some("tools/call")
                && peek
                    .params
                    .as_ref()
                    .and_then(|p| p.name.as_deref())
                    .is_some_and(|name| name == LOGIN_TOOL)
        }
        // Malformed JSON is the dispatcher's problem, not the middleware's.
        Err(_) => false,
    };

    Ok((Request::from_parts(parts, Body::from(bytes)), is_login))
}
