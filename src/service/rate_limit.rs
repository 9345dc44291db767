//! Sliding-window admission control at the HTTP boundary.
//!
//! Each client gets one window per policy: a strict one for routes under the
//! auth prefix and a default one for everything else. Windows hold the
//! admission instants of the trailing period; they are trimmed lazily on
//! every check and idle clients are swept periodically.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::RateLimitSettings;

pub const RATE_LIMITED_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

/// Requests allowed per trailing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub limit: usize,
    pub period: Duration,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        limit: usize,
        remaining: usize,
        period: Duration,
    },
    Rejected {
        limit: usize,
        period: Duration,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scope {
    Auth,
    Default,
}

// Keyed by policy as well as client: auth requests do not count against the
// default window and default requests do not count against the auth window.
type Windows = HashMap<(Scope, String), VecDeque<Instant>>;

pub struct AdmissionLimiter {
    default_policy: WindowPolicy,
    auth_policy: WindowPolicy,
    auth_prefix: String,
    idle_ttl: Duration,
    trust_forwarded_for: bool,
    windows: Mutex<Windows>,
}

impl AdmissionLimiter {
    pub fn new(settings: &RateLimitSettings, auth_prefix: impl Into<String>) -> Self {
        Self {
            default_policy: WindowPolicy {
                limit: settings.default_limit,
                period: Duration::from_secs(settings.default_period_secs),
            },
            auth_policy: WindowPolicy {
                limit: settings.auth_limit,
                period: Duration::from_secs(settings.auth_period_secs),
            },
            auth_prefix: auth_prefix.into(),
            idle_ttl: Duration::from_secs(settings.idle_ttl_secs),
            trust_forwarded_for: settings.trust_forwarded_for,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scope_for(&self, path: &str) -> Scope {
        if path.starts_with(&self.auth_prefix) {
            Scope::Auth
        } else {
            Scope::Default
        }
    }

    pub fn policy_for(&self, path: &str) -> WindowPolicy {
        match self.scope_for(path) {
            Scope::Auth => self.auth_policy,
            Scope::Default => self.default_policy,
        }
    }

    pub fn check(&self, client: &str, path: &str) -> Admission {
        self.check_at(client, path, Instant::now())
    }

    /// Evict expired entries, then admit and record, or reject. The whole
    /// sequence runs under one lock so concurrent requests of a client
    /// cannot both take the last slot.
    pub fn check_at(&self, client: &str, path: &str, now: Instant) -> Admission {
        let scope = self.scope_for(path);
        let WindowPolicy { limit, period } = self.policy_for(path);

        let mut windows = self.lock();
        let window = windows.entry((scope, client.to_string())).or_default();

        if let Some(cutoff) = now.checked_sub(period) {
            while window.front().is_some_and(|t| *t <= cutoff) {
                window.pop_front();
            }
        }

        if window.len() >= limit {
            let retry_after = window
                .front()
                .map(|oldest| period.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(period);
            return Admission::Rejected {
                limit,
                period,
                retry_after,
            };
        }

        window.push_back(now);
        Admission::Admitted {
            limit,
            remaining: limit - window.len(),
            period,
        }
    }

    /// Drop clients whose newest request is older than the idle TTL.
    /// Returns the number of windows removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            window
                .back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) < self.idle_ttl)
        });
        before - windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }

    /// Periodically sweep idle clients for as long as the limiter is alive.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.sweep_at(Instant::now());
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = limiter.tracked_clients(),
                        "rate limiter sweep"
                    );
                }
            }
        })
    }

    /// Client key: the first forwarded hop when trusted, else the peer address.
    pub fn client_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if self.trust_forwarded_for {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').next())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    headers
                        .get("x-real-ip")
                        .and_then(|h| h.to_str().ok())
                        .map(|s| s.trim().to_string())
                });
            if let Some(ip) = forwarded {
                return ip;
            }
        }
        peer.map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn reset_timestamp(period: Duration) -> HeaderValue {
    let reset = chrono::Utc::now().timestamp() + period.as_secs() as i64;
    HeaderValue::from(reset)
}

fn stamp(headers: &mut HeaderMap, limit: usize, remaining: usize, period: Duration) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert("x-ratelimit-reset", reset_timestamp(period));
}

/// Axum middleware applying [`AdmissionLimiter`] to every request.
pub async fn admission_middleware(
    State(limiter): State<Arc<AdmissionLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = limiter.client_key(request.headers(), peer);
    let path = request.uri().path().to_string();

    match limiter.check(&client, &path) {
        Admission::Admitted {
            limit,
            remaining,
            period,
        } => {
            let mut response = next.run(request).await;
            stamp(response.headers_mut(), limit, remaining, period);
            response
        }
        Admission::Rejected {
            limit,
            period,
            retry_after,
        } => {
            tracing::warn!(client = %client, path = %path, "rate limit exceeded");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({ "error": RATE_LIMITED_MESSAGE })),
            )
                .into_response();
            let headers = response.headers_mut();
            stamp(headers, limit, 0, period);
            // Round up so clients never retry early.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            headers.insert("retry-after", HeaderValue::from(secs.max(1)));
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request as HttpRequest, routing::get};
    use tower::ServiceExt;

    fn settings(default_limit: usize, auth_limit: usize) -> RateLimitSettings {
        RateLimitSettings {
            default_limit,
            auth_limit,
            ..RateLimitSettings::default()
        }
    }

    fn limiter(default_limit: usize, auth_limit: usize) -> AdmissionLimiter {
        AdmissionLimiter::new(&settings(default_limit, auth_limit), "/api/v1/auth")
    }

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let l = limiter(3, 1);
        let now = Instant::now();
        for expected_remaining in [2, 1, 0] {
            match l.check_at("c", "/api/v1/projects", now) {
                Admission::Admitted { remaining, .. } => assert_eq!(remaining, expected_remaining),
                other => panic!("expected admission, got {:?}", other),
            }
        }
        assert!(!l.check_at("c", "/api/v1/projects", now).is_admitted());
    }

    #[test]
    fn test_window_slides() {
        let l = limiter(2, 1);
        let t0 = Instant::now();
        assert!(l.check_at("c", "/x", t0).is_admitted());
        assert!(l.check_at("c", "/x", t0 + Duration::from_secs(30)).is_admitted());
        assert!(!l.check_at("c", "/x", t0 + Duration::from_secs(59)).is_admitted());
        // The first entry leaves the window at t0 + 60s.
        assert!(l.check_at("c", "/x", t0 + Duration::from_secs(60)).is_admitted());
        assert!(!l.check_at("c", "/x", t0 + Duration::from_secs(61)).is_admitted());
    }

    #[test]
    fn test_admitted_never_exceed_limit_in_any_period() {
        let limit = 5;
        let l = limiter(limit, 1);
        let t0 = Instant::now();
        let mut admitted = Vec::new();
        // One request every 7 seconds for ten minutes.
        for i in 0..90u64 {
            let now = t0 + Duration::from_secs(i * 7);
            if l.check_at("c", "/x", now).is_admitted() {
                admitted.push(now);
            }
        }
        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(60))
                .count();
            assert!(in_window <= limit);
        }
    }

    #[test]
    fn test_auth_routes_use_strict_policy() {
        let l = limiter(100, 2);
        let now = Instant::now();
        assert_eq!(l.policy_for("/api/v1/auth/login").limit, 2);
        assert_eq!(l.policy_for("/api/v1/projects").limit, 100);
        assert!(l.check_at("c", "/api/v1/auth/login", now).is_admitted());
        assert!(l.check_at("c", "/api/v1/auth/login", now).is_admitted());
        assert!(!l.check_at("c", "/api/v1/auth/refresh", now).is_admitted());
        // Other routes are unaffected.
        assert!(l.check_at("c", "/api/v1/projects", now).is_admitted());
    }

    #[test]
    fn test_clients_are_independent() {
        let l = limiter(1, 1);
        let now = Instant::now();
        assert!(l.check_at("a", "/x", now).is_admitted());
        assert!(!l.check_at("a", "/x", now).is_admitted());
        assert!(l.check_at("b", "/x", now).is_admitted());
    }

    #[test]
    fn test_retry_after_counts_down_to_oldest_expiry() {
        let l = limiter(1, 1);
        let t0 = Instant::now();
        l.check_at("c", "/x", t0);
        match l.check_at("c", "/x", t0 + Duration::from_secs(45)) {
            Admission::Rejected { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(15))
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_sweep_drops_idle_clients() {
        let l = limiter(10, 10);
        let t0 = Instant::now();
        l.check_at("old", "/x", t0);
        l.check_at("fresh", "/x", t0 + Duration::from_secs(3000));
        let removed = l.sweep_at(t0 + Duration::from_secs(3601));
        assert_eq!(removed, 1);
        assert_eq!(l.tracked_clients(), 1);
    }

    #[test]
    fn test_client_key_ignores_forwarded_header_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        let peer: SocketAddr = "192.168.1.5:4000".parse().unwrap();

        let l = limiter(1, 1);
        assert_eq!(l.client_key(&headers, Some(peer)), "192.168.1.5");
        assert_eq!(l.client_key(&HeaderMap::new(), None), "unknown");

        let trusted = AdmissionLimiter::new(
            &RateLimitSettings {
                trust_forwarded_for: true,
                ..RateLimitSettings::default()
            },
            "/api/v1/auth",
        );
        assert_eq!(trusted.client_key(&headers, Some(peer)), "10.0.0.1");
    }

    fn app(limiter: Arc<AdmissionLimiter>) -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn_with_state(
                limiter,
                admission_middleware,
            ))
    }

    #[tokio::test]
    async fn test_middleware_stamps_headers_and_rejects() {
        let limiter = Arc::new(limiter(1, 1));
        let app = app(limiter);

        let req = HttpRequest::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-ratelimit-limit"], "1");
        assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");
        assert!(resp.headers().contains_key("x-ratelimit-reset"));

        let req = HttpRequest::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");
        let retry: u64 = resp.headers()["retry-after"].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let limiter = Arc::new(limiter(25, 5));
        let tasks: Vec<_> = (0..200)
            .map(|i| {
                let limiter = limiter.clone();
                let path = if i % 2 == 0 { "/api/v1/projects" } else { "/api/v1/auth/me" };
                tokio::spawn(async move { (path, limiter.check("10.0.0.1", path).is_admitted()) })
            })
            .collect();

        let mut default_admitted = 0;
        let mut auth_admitted = 0;
        for task in tasks {
            match task.await.unwrap() {
                (_, false) => {}
                ("/api/v1/auth/me", true) => auth_admitted += 1,
                (_, true) => default_admitted += 1,
            }
        }
        assert_eq!(default_admitted, 25);
        assert_eq!(auth_admitted, 5);
        assert_eq!(limiter.tracked_clients(), 2);
    }
}
