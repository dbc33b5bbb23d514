// HTTP rate limiting
//
// Runs the shared admission engine on every request, partitioned by
// account for authenticated callers and by IP otherwise. Advisory headers
// are attached on admission; denials become 429 with Retry-After.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::AppState;
use crate::error::GatewayError;
use crate::ratelimit::{Partition, RateLimitDecision};

use super::auth::{extract_bearer_or_cookie, extract_ip};

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let partition = resolve_partition(&state, request.headers()).await;

    let decision = match state.rate_limiter.check(&partition, &path).await {
        Ok(decision) => decision,
        Err(err) => return err.into_response(),
    };

    if !decision.allowed {
        let mut response = GatewayError::RateLimited {
            retry_after_secs: decision.retry_after_secs.unwrap_or(0),
        }
        .into_response();
        apply_headers(&mut response, &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, &decision);
    response
}

/// Authenticated callers partition by account, everyone else by IP.
async fn resolve_partition(state: &AppState, headers: &HeaderMap) -> Partition {
    if let Some(ticket) = extract_bearer_or_cookie(headers) {
        if let Ok(Some(session)) = state.sessions.validate(ticket).await {
            return Partition::account(&session.user_id);
        }
    }
    Partition::ip(extract_ip(headers).unwrap_or("unknown"))
}

fn apply_headers(response: &mut Response, decision: &RateLimitDecision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}
