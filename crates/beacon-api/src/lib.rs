//! beacon-api: operational HTTP endpoint for a Beacon node.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/admin/rotation` | Current rotation flag |
//! | POST | `/admin/rotation/oor` | Take the node out of rotation |
//! | POST | `/admin/rotation/bir` | Put the node back in rotation |
//! | GET | `/admin/status` | Verdict, probes, publisher state and counters |
//! | GET | `/discovery/{service}/nodes` | Cached nodes of a watched service |
//! | GET | `/discovery/{service}/node` | One cached node of a watched service |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use beacon_membership::DiscoveryBundle;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub bundle: Arc<DiscoveryBundle>,
}

/// Build the admin router.
pub fn build_router(bundle: Arc<DiscoveryBundle>) -> Router {
    let state = ApiState { bundle };

    let admin_routes = Router::new()
        .route("/rotation", get(handlers::get_rotation))
        .route("/rotation/oor", post(handlers::out_of_rotation))
        .route("/rotation/bir", post(handlers::back_in_rotation))
        .route("/status", get(handlers::get_status));

    let discovery_routes = Router::new()
        .route("/{service}/nodes", get(handlers::list_nodes))
        .route("/{service}/node", get(handlers::get_node));

    Router::new()
        .nest("/admin", admin_routes)
        .nest("/discovery", discovery_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use beacon_core::BeaconConfig;
    use beacon_store::{CoordinationStore, Ensemble};
    use tower::ServiceExt;

    fn test_bundle() -> Arc<DiscoveryBundle> {
        let ensemble = Ensemble::open_in_memory().unwrap();
        let store: Arc<dyn CoordinationStore> = Arc::new(ensemble.connect().unwrap());
        let config = BeaconConfig::scaffold("orders", "10.0.0.1", 8080);
        Arc::new(DiscoveryBundle::builder(config).store(store).build().unwrap())
    }

    async fn call(router: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn rotation_routes_toggle_the_gate() {
        let bundle = test_bundle();
        let router = build_router(bundle.clone());

        let (status, body) = call(&router, "GET", "/admin/rotation").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["in_rotation"], true);

        let (_, body) = call(&router, "POST", "/admin/rotation/oor").await;
        assert_eq!(body["data"]["in_rotation"], false);
        assert_eq!(body["data"]["previous"], true);
        assert!(!bundle.rotation().is_in_rotation());

        let (_, body) = call(&router, "POST", "/admin/rotation/bir").await;
        assert_eq!(body["data"]["in_rotation"], true);
        assert!(bundle.rotation().is_in_rotation());
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let router = build_router(test_bundle());
        let req = Request::builder()
            .uri("/admin/nope")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn discovery_routes_answer_from_cache() {
        let bundle = test_bundle();
        let router = build_router(bundle.clone());

        let (status, body) = call(&router, "GET", "/discovery/orders/nodes").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "service not watched: orders");

        bundle.discovery().watch_service("orders").await;
        let (status, body) = call(&router, "GET", "/discovery/orders/nodes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], serde_json::json!([]));

        let (status, body) = call(&router, "GET", "/discovery/orders/node").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].is_null());
    }
}
