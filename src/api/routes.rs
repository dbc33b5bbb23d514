use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use super::AppState;
use super::{admin_encryption, admin_ratelimit, admin_sessions, auth, health, hubs};
use crate::middleware::rate_limit::rate_limit_middleware;

/// Gateway routes
///
/// ## Public
/// - POST /api/auth/login - Exchange a provider token for a session
/// - POST /api/auth/connection-ticket - One-shot hub ticket (session required)
///
/// ## Admin auth
/// - POST /api/admin/auth/login | logout | refresh | revoke-all
///
/// ## Admin: sessions
/// - GET    /api/admin/sessions[?user&skip&take]
/// - GET    /api/admin/sessions/count
/// - DELETE /api/admin/sessions/{ticket}
///
/// ## Admin: rate limiting
/// - GET/POST /api/admin/rate-limiting/config
/// - POST     /api/admin/rate-limiting/policies, DELETE …/policies/{name}
/// - POST     /api/admin/rate-limiting/mappings, DELETE …/mappings?pattern=
/// - POST     /api/admin/rate-limiting/default-policy | enabled | reset
/// - GET      /api/admin/rate-limiting/metrics
///
/// ## Admin: encryption
/// - GET  /api/admin/encryption/config | metrics
/// - POST /api/admin/encryption/enabled | required | rotate-all
/// - GET  /api/admin/encryption/connections/needs-rotation
/// - POST /api/admin/encryption/connections/{user_id}/rotate
/// - GET  /api/admin/encryption/connections/{user_id}/stats
/// - DELETE /api/admin/encryption/connections/{user_id}
///
/// ## Hubs (WebSocket, `?ticket=` or `?access_token=` or bearer header)
/// - /accountHub, /encryptionHub, /hubs/admin-metrics
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // ========================================
        // Auth
        // ========================================
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/connection-ticket", post(auth::connection_ticket))
        .route("/api/admin/auth/login", post(auth::admin_login))
        .route("/api/admin/auth/logout", post(auth::admin_logout))
        .route("/api/admin/auth/refresh", post(auth::admin_refresh))
        .route("/api/admin/auth/revoke-all", post(auth::admin_revoke_all))
        // ========================================
        // Admin: sessions
        // ========================================
        .route("/api/admin/sessions", get(admin_sessions::list_sessions))
        .route(
            "/api/admin/sessions/count",
            get(admin_sessions::count_sessions),
        )
        .route(
            "/api/admin/sessions/{ticket}",
            delete(admin_sessions::invalidate_session),
        )
        // ========================================
        // Admin: rate limiting
        // ========================================
        .route(
            "/api/admin/rate-limiting/config",
            get(admin_ratelimit::get_config).post(admin_ratelimit::put_config),
        )
        .route(
            "/api/admin/rate-limiting/policies",
            post(admin_ratelimit::upsert_policy),
        )
        .route(
            "/api/admin/rate-limiting/policies/{name}",
            delete(admin_ratelimit::delete_policy),
        )
        .route(
            "/api/admin/rate-limiting/mappings",
            post(admin_ratelimit::upsert_mapping).delete(admin_ratelimit::delete_mapping),
        )
        .route(
            "/api/admin/rate-limiting/default-policy",
            post(admin_ratelimit::set_default_policy),
        )
        .route(
            "/api/admin/rate-limiting/enabled",
            post(admin_ratelimit::set_enabled),
        )
        .route(
            "/api/admin/rate-limiting/metrics",
            get(admin_ratelimit::get_metrics),
        )
        .route("/api/admin/rate-limiting/reset", post(admin_ratelimit::reset))
        // ========================================
        // Admin: encryption
        // ========================================
        .route(
            "/api/admin/encryption/config",
            get(admin_encryption::get_config),
        )
        .route(
            "/api/admin/encryption/enabled",
            post(admin_encryption::set_enabled),
        )
        .route(
            "/api/admin/encryption/required",
            post(admin_encryption::set_required),
        )
        .route(
            "/api/admin/encryption/connections/needs-rotation",
            get(admin_encryption::needs_rotation),
        )
        .route(
            "/api/admin/encryption/connections/{user_id}/rotate",
            post(admin_encryption::rotate_connection),
        )
        .route(
            "/api/admin/encryption/connections/{user_id}/stats",
            get(admin_encryption::connection_stats),
        )
        .route(
            "/api/admin/encryption/connections/{user_id}",
            delete(admin_encryption::remove_connection),
        )
        .route(
            "/api/admin/encryption/rotate-all",
            post(admin_encryption::rotate_all),
        )
        .route(
            "/api/admin/encryption/metrics",
            get(admin_encryption::get_metrics),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        // Health endpoints sit outside the rate limiter.
        .route("/ping", get(health::ping))
        .route("/health", get(health::health_check))
        .merge(api)
        // ========================================
        // Hubs
        // ========================================
        .route("/accountHub", get(hubs::hub_upgrade))
        .route("/encryptionHub", get(hubs::hub_upgrade))
        .route("/hubs/admin-metrics", get(hubs::hub_upgrade))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::identity::{MockIdentityResolver, ProviderRegistry};
    use crate::kv::MemoryKv;
    use crate::utils::SystemClock;

    fn app() -> Router {
        let clock = Arc::new(SystemClock);
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let state = AppState::new(
            Config::default(),
            kv,
            clock,
            ProviderRegistry::new(vec![Box::new(MockIdentityResolver)]),
            |_| {},
        );
        router(state)
    }

    async fn send(
        app: &Router,
        method: &str,
        path: &str,
        body: Option<Value>,
        bearer: Option<&str>,
        forwarded_for: Option<&str>,
    ) -> (StatusCode, Value, axum::http::HeaderMap) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(bearer) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
        }
        if let Some(ip) = forwarded_for {
            builder = builder.header("x-forwarded-for", ip);
        }

        let request = match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value, headers)
    }

    async fn login(app: &Router, token: &str) -> String {
        let (status, body, _) = send(
            app,
            "POST",
            "/api/auth/login",
            Some(serde_json::json!({"token": token, "provider": "Mock"})),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["sessionId"].as_str().unwrap().to_string()
    }

    async fn admin_login(app: &Router, user: &str) -> String {
        let (status, body, _) = send(
            app,
            "POST",
            "/api/admin/auth/login",
            Some(serde_json::json!({"token": format!("mock-admin:{user}"), "provider": "Mock"})),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["sessionId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn login_issues_session_and_cookie() {
        let app = app();
        let (status, body, headers) = send(
            &app,
            "POST",
            "/api/auth/login",
            Some(serde_json::json!({"token": "mock:AAA", "provider": "Mock"})),
            None,
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["userId"], "AAA");
        let session_id = body["sessionId"].as_str().unwrap();
        assert_eq!(session_id.len(), 32);

        let cookie = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with("session="));
        assert!(cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn login_with_unknown_token_is_unauthorized() {
        let app = app();
        let (status, body, _) = send(
            &app,
            "POST",
            "/api/auth/login",
            Some(serde_json::json!({"token": "garbage", "provider": "Mock"})),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn connection_ticket_requires_a_session() {
        let app = app();

        let (status, _, _) = send(&app, "POST", "/api/auth/connection-ticket", None, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let session = login(&app, "mock:AAA").await;
        let (status, body, _) = send(
            &app,
            "POST",
            "/api/auth/connection-ticket",
            None,
            Some(&session),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let ticket = body["ticket"].as_str().unwrap();
        assert_eq!(ticket.len(), 32);
        assert!(ticket.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn eleventh_login_from_one_ip_is_rate_limited() {
        let app = app();
        let body = serde_json::json!({"token": "mock:AAA", "provider": "Mock"});

        for i in 0..10 {
            let (status, _, headers) = send(
                &app,
                "POST",
                "/api/auth/login",
                Some(body.clone()),
                None,
                Some("203.0.113.5"),
            )
            .await;
            assert_eq!(status, StatusCode::OK, "attempt {}", i);
            assert_eq!(
                headers.get("x-rate-limit-policy").unwrap().to_str().unwrap(),
                "Auth"
            );
        }

        let (status, _, headers) = send(
            &app,
            "POST",
            "/api/auth/login",
            Some(body),
            None,
            Some("203.0.113.5"),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            headers.get(header::RETRY_AFTER).unwrap().to_str().unwrap(),
            "600"
        );
    }

    #[tokio::test]
    async fn admin_endpoints_reject_players() {
        let app = app();

        let (status, _, _) = send(&app, "GET", "/api/admin/sessions", None, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let session = login(&app, "mock:AAA").await;
        let (status, _, _) =
            send(&app, "GET", "/api/admin/sessions", None, Some(&session), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_lists_and_invalidates_sessions() {
        let app = app();
        let player = login(&app, "mock:AAA").await;
        let admin = admin_login(&app, "root").await;

        let (status, body, _) =
            send(&app, "GET", "/api/admin/sessions", None, Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().len() >= 2);

        let (status, _, _) = send(
            &app,
            "DELETE",
            &format!("/api/admin/sessions/{}", player),
            None,
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // The invalidated bearer no longer authenticates.
        let (status, _, _) = send(
            &app,
            "POST",
            "/api/auth/connection-ticket",
            None,
            Some(&player),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Deleting again is a 404.
        let (status, _, _) = send(
            &app,
            "DELETE",
            &format!("/api/admin/sessions/{}", player),
            None,
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disabling_rate_limiting_admits_everything() {
        let app = app();
        let admin = admin_login(&app, "root").await;

        let (status, _, _) = send(
            &app,
            "POST",
            "/api/admin/rate-limiting/enabled",
            Some(serde_json::json!({"Enabled": false})),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let body = serde_json::json!({"token": "mock:AAA", "provider": "Mock"});
        for _ in 0..20 {
            let (status, _, _) = send(
                &app,
                "POST",
                "/api/auth/login",
                Some(body.clone()),
                None,
                Some("203.0.113.7"),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn refresh_rotates_the_admin_session() {
        let app = app();
        let old = admin_login(&app, "root").await;

        let (status, body, _) = send(
            &app,
            "POST",
            "/api/admin/auth/refresh",
            None,
            Some(&old),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let fresh = body["sessionId"].as_str().unwrap().to_string();
        assert_ne!(fresh, old);

        // The old ticket is gone; the fresh one works.
        let (status, _, _) =
            send(&app, "POST", "/api/admin/auth/logout", None, Some(&old), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = send(
            &app,
            "POST",
            "/api/admin/auth/logout",
            None,
            Some(&fresh),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn revoke_all_clears_every_session_of_the_user() {
        let app = app();
        let first = admin_login(&app, "root").await;
        let second = admin_login(&app, "root").await;

        let (status, body, _) = send(
            &app,
            "POST",
            "/api/admin/auth/revoke-all",
            None,
            Some(&second),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revoked"], 2);

        let (status, _, _) =
            send(&app, "POST", "/api/admin/auth/logout", None, Some(&first), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn encryption_admin_round_trip() {
        let app = app();
        let admin = admin_login(&app, "root").await;

        let (status, body, _) = send(
            &app,
            "GET",
            "/api/admin/encryption/config",
            None,
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], true);
        assert_eq!(body["required"], false);

        let (status, body, _) = send(
            &app,
            "POST",
            "/api/admin/encryption/required",
            Some(serde_json::json!({"required": true})),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["required"], true);

        // No encryption state yet: rotating an unknown user is a 404.
        let (status, _, _) = send(
            &app,
            "POST",
            "/api/admin/encryption/connections/ghost/rotate",
            None,
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body, _) = send(
            &app,
            "GET",
            "/api/admin/encryption/metrics",
            None,
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activeUsers"], 0);
    }

    #[tokio::test]
    async fn rate_limit_policy_crud() {
        let app = app();
        let admin = admin_login(&app, "root").await;

        let (status, body, _) = send(
            &app,
            "POST",
            "/api/admin/rate-limiting/policies",
            Some(serde_json::json!({
                "name": "Trade",
                "rules": [{"maxHits": 5, "periodSeconds": 10, "timeoutSeconds": 60}]
            })),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["policies"]["Trade"].is_object());

        // A zero-valued rule is rejected.
        let (status, _, _) = send(
            &app,
            "POST",
            "/api/admin/rate-limiting/policies",
            Some(serde_json::json!({
                "name": "Broken",
                "rules": [{"maxHits": 0, "periodSeconds": 10, "timeoutSeconds": 60}]
            })),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Deleting the default policy conflicts.
        let (status, _, _) = send(
            &app,
            "DELETE",
            "/api/admin/rate-limiting/policies/Default",
            None,
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _, _) = send(
            &app,
            "DELETE",
            "/api/admin/rate-limiting/policies/Trade",
            None,
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
