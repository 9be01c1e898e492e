//! podstats-api — the scrape endpoint.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Every stored reading, one `<key> <value> <time>` line each |
//!
//! Responses may be served from a [`ResponseCache`]; add the refresh key
//! to the query (`/?opn`) to force a fresh render.

pub mod cache;

use std::fmt;
use std::future::Future;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::error;

use podstats_store::AggregateStore;

pub use cache::{ResponseCache, ResponseCacheConfig};

/// Anything that can produce the exposition text for a scrape.
pub trait Exposition: Clone + Send + Sync + 'static {
    fn render(&self) -> impl Future<Output = Result<String, fmt::Error>> + Send;
}

impl Exposition for AggregateStore {
    fn render(&self) -> impl Future<Output = Result<String, fmt::Error>> + Send {
        AggregateStore::render(self)
    }
}

/// Build the scrape router, optionally behind the response cache.
pub fn build_router<E: Exposition>(exposition: E, cache: Option<ResponseCache>) -> Router {
    let router = Router::new().route("/", get(scrape::<E>)).with_state(exposition);
    match cache {
        Some(cache) => router.layer(axum::middleware::from_fn_with_state(cache, cache::cache_responses)),
        None => router,
    }
}

pub async fn scrape<E: Exposition>(State(exposition): State<E>) -> Response {
    match exposition.render().await {
        Ok(body) => (StatusCode::OK, [(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to render exposition");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics\n").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use podstats_core::{Reading, ReadingKind};

    /// Counts renders; optionally fails every render.
    #[derive(Clone, Default)]
    struct CountingExposition {
        renders: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CountingExposition {
        fn renders(&self) -> usize {
            self.renders.load(Ordering::SeqCst)
        }
    }

    impl Exposition for CountingExposition {
        async fn render(&self) -> Result<String, fmt::Error> {
            let n = self.renders.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(fmt::Error);
            }
            Ok(format!("renders {n}.000000 0\n"))
        }
    }

    async fn get_body(router: &Router, uri: &str) -> (StatusCode, String) {
        let resp = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn cache(ttl: Duration) -> ResponseCache {
        ResponseCache::new(ResponseCacheConfig {
            ttl,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn scrape_renders_store_contents() {
        let store = AggregateStore::new();
        store
            .merge(Reading::new("ps_cpu_usage_cores{pod_name=\"a\"}", 0.25, "1000", ReadingKind::Instant))
            .await;
        let router = build_router(store, None);

        let resp = router
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get(CONTENT_TYPE).unwrap().to_str().unwrap();
        assert_eq!(content_type, "text/plain; charset=utf-8");

        let (_, body) = get_body(&router, "/").await;
        assert_eq!(body, "ps_cpu_usage_cores{pod_name=\"a\"} 0.250000 1000\n");
    }

    #[tokio::test]
    async fn render_error_is_500() {
        let exposition = CountingExposition {
            fail: true,
            ..Default::default()
        };
        let router = build_router(exposition, None);
        let (status, _) = get_body(&router, "/").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn uncached_router_renders_every_scrape() {
        let exposition = CountingExposition::default();
        let router = build_router(exposition.clone(), None);
        get_body(&router, "/").await;
        get_body(&router, "/").await;
        assert_eq!(exposition.renders(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scrapes_within_ttl_render_once() {
        let exposition = CountingExposition::default();
        let router = build_router(exposition.clone(), Some(cache(Duration::from_secs(10))));

        let (_, first) = get_body(&router, "/").await;
        tokio::time::advance(Duration::from_secs(5)).await;
        let (_, second) = get_body(&router, "/").await;

        assert_eq!(exposition.renders(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_key_forces_render() {
        let exposition = CountingExposition::default();
        let router = build_router(exposition.clone(), Some(cache(Duration::from_secs(10))));

        get_body(&router, "/").await;
        let (_, refreshed) = get_body(&router, "/?opn").await;
        assert_eq!(exposition.renders(), 2);
        assert_eq!(refreshed, "renders 2.000000 0\n");

        // The refreshed body replaced the cached one.
        let (_, cached) = get_body(&router, "/").await;
        assert_eq!(exposition.renders(), 2);
        assert_eq!(cached, refreshed);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_renders_again() {
        let exposition = CountingExposition::default();
        let router = build_router(exposition.clone(), Some(cache(Duration::from_secs(10))));

        get_body(&router, "/").await;
        tokio::time::advance(Duration::from_secs(11)).await;
        get_body(&router, "/").await;
        assert_eq!(exposition.renders(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_not_cached() {
        let exposition = CountingExposition {
            fail: true,
            ..Default::default()
        };
        let response_cache = cache(Duration::from_secs(10));
        let router = build_router(exposition.clone(), Some(response_cache.clone()));

        get_body(&router, "/").await;
        get_body(&router, "/").await;
        assert_eq!(exposition.renders(), 2);
        assert!(response_cache.is_empty());
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let router = build_router(CountingExposition::default(), Some(cache(Duration::from_secs(10))));
        let (status, _) = get_body(&router, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
