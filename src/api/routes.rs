//! HTTP API route definitions.

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{
    acknowledge_position, cancel_order, cancel_redemption, get_position, health, list_positions,
    metrics, ready, retry_position, settle_market, submit_order, AppState,
};

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        // Positions
        .route("/api/v1/positions", get(list_positions))
        .route("/api/v1/positions/:condition_id", get(get_position))
        .route("/api/v1/positions/:condition_id/retry", post(retry_position))
        .route("/api/v1/positions/:condition_id/cancel", post(cancel_redemption))
        .route("/api/v1/positions/:condition_id/ack", post(acknowledge_position))
        // Inputs
        .route("/api/v1/settlements", post(settle_market))
        .route("/api/v1/orders", post(submit_order))
        .route("/api/v1/orders/:order_id", delete(cancel_order))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::engine::{Engine, EngineHandle};
    use crate::testing::{condition_id, Harness, MockExchange};
    use crate::trading::execution::{ExecutorSettings, OrderExecutor};
    use crate::trading::position::PositionStatus;
    use crate::trading::validation::{BasicValidator, RiskLimits};

    fn engine(harness: &Harness) -> (Engine, EngineHandle) {
        let (tx, rx) = mpsc::channel(16);
        let executor = Arc::new(OrderExecutor::new(
            Arc::new(MockExchange::new()),
            Arc::new(BasicValidator::default()),
            Arc::new(RiskLimits::new(dec!(100), dec!(50))),
            tx,
            ExecutorSettings {
                poll_interval: Duration::from_millis(5),
                track_timeout: Duration::from_millis(200),
            },
        ));
        Engine::new(
            harness.tracker.clone(),
            harness.manager.clone(),
            executor,
            harness.store.clone(),
            rx,
            // Long cycle: finished positions stay visible.
            Duration::from_secs(60),
        )
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_and_readiness() {
        let harness = Harness::new("api-ready");
        let (_engine, handle) = engine(&harness);
        let state = AppState::new(harness.tracker.clone(), handle, None);
        let app = create_router(state.clone());

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready(true);
        let response = app.oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn position_lookup_and_acknowledge_errors() {
        let harness = Harness::new("api-positions");
        let id = condition_id(0x21);
        harness.settled_position(&id);
        let (_engine, handle) = engine(&harness);
        let app = create_router(AppState::new(harness.tracker.clone(), handle, None));

        let response = app.clone().oneshot(get("/api/v1/positions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed[0]["status"], "SETTLING");

        let response = app
            .clone()
            .oneshot(get(&format!("/api/v1/positions/{}", condition_id(0x22))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post_json(&format!("/api/v1/positions/{}/ack", id), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn commands_fail_fast_when_engine_is_gone() {
        let harness = Harness::new("api-stopped");
        let (engine, handle) = engine(&harness);
        drop(engine);
        let app = create_router(AppState::new(harness.tracker.clone(), handle, None));

        let response = app
            .oneshot(post_json(
                &format!("/api/v1/positions/{}/retry", condition_id(0x23)),
                "",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn settlement_starts_redemption() {
        let harness = Harness::new("api-settle");
        let id = condition_id(0x24);
        harness
            .tracker
            .on_order_filled(&crate::testing::filled_order(&id, "o-1"))
            .unwrap();
        harness.relay.accept(&harness.relay_urls[0], "0xfeed");

        let (engine, handle) = engine(&harness);
        let running = tokio::spawn(engine.run());
        let app = create_router(AppState::new(harness.tracker.clone(), handle.clone(), None));

        let body = format!(r#"{{"condition_id":"{}","winner":"UP"}}"#, id);
        let response = app.oneshot(post_json("/api/v1/settlements", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut status = PositionStatus::Settling;
        for _ in 0..100 {
            status = harness.tracker.get(&id).map(|p| p.status).unwrap_or(status);
            if status == PositionStatus::Redeemed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, PositionStatus::Redeemed);

        handle.shutdown();
        running.await.unwrap().unwrap();
    }
}
