use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::Request,
    http::{HeaderName, HeaderValue, Method, header},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::auth::{GITHUB_TOKEN_HEADER, JwtVerifier};
use super::github::GitHubClientFactory;
use super::progress::ProgressChannel;
use super::provision::{ProvisionOptions, Provisioner};
use super::rate_limit::{AdmissionLimiter, admission_middleware};
use super::store::{InMemoryProjectStore, ProjectStore, RestProjectStore};
use super::template::TemplateRenderer;
use super::ws;
use crate::config::Settings;

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; \
    script-src 'self' 'unsafe-inline' 'unsafe-eval' https://cdn.jsdelivr.net; \
    style-src 'self' 'unsafe-inline'; \
    img-src 'self' data: https:; \
    font-src 'self' data:; \
    connect-src 'self' https://*.supabase.co wss://*.supabase.co; \
    frame-ancestors 'none'; \
    base-uri 'self'; \
    form-action 'self'";

/// Assemble shared state from resolved settings.
pub fn build_state(settings: &Settings) -> Result<SharedState> {
    let secret = settings
        .jwt_secret
        .as_deref()
        .context("JWT_SECRET_KEY must be set")?;
    let verifier = JwtVerifier::new(
        secret,
        &settings.jwt_algorithm,
        settings.jwt_audience.as_deref(),
    )
    .context("Failed to configure token verification")?;

    let github = GitHubClientFactory::new(&settings.github_api_url)
        .context("Failed to build GitHub client")?;
    let store = project_store(settings);
    let progress = Arc::new(ProgressChannel::new());

    if !settings.template_dir.is_dir() {
        tracing::warn!(
            dir = %settings.template_dir.display(),
            "template directory not found, repositories will only get a README"
        );
    }
    let mut provisioner = Provisioner::new(
        Arc::new(TemplateRenderer::new(settings.template_dir.clone())),
        progress.clone(),
        ProvisionOptions::from(&settings.provisioning),
    );
    if let Some(store) = &store {
        provisioner = provisioner.with_store(store.clone());
    }

    Ok(Arc::new(AppState {
        project_name: settings.project_name.clone(),
        verifier,
        github: Arc::new(github),
        progress,
        provisioner,
        store,
    }))
}

fn project_store(settings: &Settings) -> Option<Arc<dyn ProjectStore>> {
    match (&settings.store_url, &settings.store_key) {
        (Some(url), Some(key)) => match RestProjectStore::new(url, key.clone()) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::error!(error = %e, "failed to initialize project store");
                None
            }
        },
        _ => {
            tracing::warn!("no database configured, keeping projects in memory");
            Some(Arc::new(InMemoryProjectStore::new()))
        }
    }
}

/// Build the full application router: API, live channel and the middleware stack.
pub fn build_router(state: SharedState, limiter: Arc<AdmissionLimiter>, settings: &Settings) -> Router {
    api::api_router(&settings.api_prefix)
        .route("/ws/{user_id}", get(ws::ws_handler))
        .with_state(state)
        .layer(middleware::from_fn_with_state(limiter, admission_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(cors_layer(&settings.cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(GITHUB_TOKEN_HEADER),
        ])
}

fn is_https(request: &Request) -> bool {
    request.uri().scheme_str() == Some("https")
        || request
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

/// Stamp the browser hardening headers on every response.
async fn security_headers(request: Request, next: Next) -> Response {
    let https = is_https(&request);
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    if https {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    headers.remove(header::SERVER);
    response
}

/// Start the API server and run until Ctrl+C.
pub async fn start_server(settings: Settings) -> Result<()> {
    settings.validate()?;

    let state = build_state(&settings)?;
    let limiter = Arc::new(AdmissionLimiter::new(
        &settings.rate_limit,
        settings.auth_prefix(),
    ));
    let _sweeper =
        limiter.spawn_sweeper(Duration::from_secs(settings.rate_limit.sweep_interval_secs));

    let app = build_router(state, limiter, &settings);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        address = %local_addr,
        environment = %settings.environment,
        "{} listening",
        settings.project_name
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_settings() -> Settings {
        Settings {
            jwt_secret: Some("test-secret-key-at-least-32-characters-long".into()),
            template_dir: "does-not-exist".into(),
            ..Settings::default()
        }
    }

    fn test_router(settings: &Settings) -> Router {
        let state = build_state(settings).unwrap();
        let limiter = Arc::new(AdmissionLimiter::new(
            &settings.rate_limit,
            settings.auth_prefix(),
        ));
        build_router(state, limiter, settings)
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router(&test_settings());
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["api"], "operational");
    }

    #[tokio::test]
    async fn test_api_routes_mounted_under_prefix() {
        let settings = Settings {
            api_prefix: "/api/v2".into(),
            ..test_settings()
        };
        let app = test_router(&settings);
        let resp = app.clone().oneshot(get("/api/v2/github/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(get("/api/v1/github/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_security_headers_applied() {
        let app = test_router(&test_settings());
        let resp = app.oneshot(get("/")).await.unwrap();
        let headers = resp.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
        assert!(
            headers["content-security-policy"]
                .to_str()
                .unwrap()
                .contains("frame-ancestors 'none'")
        );
        assert!(headers.get("strict-transport-security").is_none());
    }

    #[tokio::test]
    async fn test_hsts_only_over_https() {
        let app = test_router(&test_settings());
        let req = Request::builder()
            .uri("/")
            .header("x-forwarded-proto", "https")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers()["strict-transport-security"],
            "max-age=31536000; includeSubDomains"
        );
    }

    #[tokio::test]
    async fn test_rate_limit_via_full_router() {
        let mut settings = test_settings();
        settings.rate_limit.default_limit = 2;
        let app = test_router(&settings);

        for _ in 0..2 {
            let resp = app.clone().oneshot(get("/health")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("retry-after"));
        assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    }

    #[tokio::test]
    async fn test_auth_routes_get_the_strict_window() {
        let mut settings = test_settings();
        settings.rate_limit.auth_limit = 1;
        let app = test_router(&settings);

        let resp = app.clone().oneshot(get("/api/v1/auth/me")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = app.clone().oneshot(get("/api/v1/auth/verify")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        // The default window is separate.
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_live_channel_checks_token_before_upgrade() {
        use crate::service::auth::tests::token_for;

        let app = test_router(&test_settings());
        let resp = app.clone().oneshot(get("/ws/u1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let other = format!("/ws/u1?token={}", token_for("u2"));
        let resp = app.clone().oneshot(get(&other)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // The owner's token passes; a plain request then fails the upgrade itself.
        let own = format!("/ws/u1?token={}", token_for("u1"));
        let resp = app.oneshot(get(&own)).await.unwrap();
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_ne!(resp.status(), StatusCode::FORBIDDEN);
        assert!(resp.status().is_client_error() || resp.status().is_server_error());
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_configured_origin() {
        let app = test_router(&test_settings());
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/v1/github/repositories")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "authorization,x-github-token")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );
        assert_eq!(resp.headers()["access-control-allow-credentials"], "true");
    }

    #[test]
    fn test_build_state_requires_secret() {
        let settings = Settings::default();
        assert!(build_state(&settings).is_err());
    }
}
