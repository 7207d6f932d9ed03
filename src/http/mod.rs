//! JSON HTTP surface for the presentation layer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::ledger::{AccountQuery, TradeEngine};

pub mod error;
pub mod handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: TradeEngine,
    pub query: AccountQuery,
}

impl AppState {
    pub fn new(engine: TradeEngine) -> Self {
        let query = AccountQuery::new(engine.database().clone(), engine.config().clone());
        Self { engine, query }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(Any)
        .allow_headers(AllowHeaders::any());

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/accounts", post(handlers::open_account))
        .route("/trade/buy", post(handlers::buy))
        .route("/trade/sell", post(handlers::sell))
        .route("/wallet", get(handlers::wallet))
        .route("/wallet/deposit", post(handlers::deposit))
        .route("/wallet/withdraw", post(handlers::withdraw))
        .route("/wallet/reward", post(handlers::reward))
        .route("/transactions", get(handlers::transactions))
        .route("/portfolio", get(handlers::portfolio))
        .route("/portfolio/valuation", post(handlers::valuation))
        .with_state(Arc::new(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve until Ctrl-C.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Ledger API listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::db::Database;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn make_app(dir: &tempfile::TempDir) -> Router {
        let db = Database::temporary(dir).await;
        let engine = TradeEngine::new(db, LedgerConfig::default()).unwrap();
        router(AppState::new(engine))
    }

    async fn send(app: &Router, method: &str, uri: &str, payload: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match payload {
            Some(payload) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_app(&dir).await;

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_buy_then_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_app(&dir).await;

        let (status, body) = send(
            &app,
            "POST",
            "/accounts",
            Some(json!({ "userId": "u1", "initialBalance": "10000000" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["balance"], "10000000");

        let (status, body) = send(
            &app,
            "POST",
            "/trade/buy",
            Some(json!({ "userId": "u1", "symbol": "VNM", "quantity": 100, "price": 72400 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["type"], "BUY");
        assert_eq!(body["data"]["cashImpact"], "-7247240");
        assert_eq!(body["data"]["balanceAfter"], "2752760");

        let (status, body) = send(&app, "GET", "/wallet?userId=u1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["balance"], "2752760");
        assert_eq!(body["data"]["portfolio"][0]["symbol"], "VNM");
        assert_eq!(body["data"]["portfolio"][0]["avgPrice"], "72400");
        assert_eq!(body["data"]["transactions"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["summary"]["tradeCount"], 1);
    }

    #[tokio::test]
    async fn test_rejections_use_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_app(&dir).await;
        send(&app, "POST", "/accounts", Some(json!({ "userId": "u1", "initialBalance": "100" }))).await;

        let (status, body) = send(
            &app,
            "POST",
            "/trade/buy",
            Some(json!({ "userId": "u1", "symbol": "VNM", "quantity": 10, "price": 100 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("Insufficient funds"));

        let (status, _) = send(
            &app,
            "POST",
            "/trade/sell",
            Some(json!({ "userId": "u1", "symbol": "VNM", "quantity": 1, "price": 100 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(
            &app,
            "POST",
            "/trade/buy",
            Some(json!({ "userId": "u1", "symbol": "VNM", "quantity": -1, "price": 100 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = send(&app, "POST", "/trade/buy", Some(json!({ "userId": "u1" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send(&app, "GET", "/wallet?userId=ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", "/accounts", Some(json!({ "userId": "u1" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_overflowing_order_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_app(&dir).await;
        send(&app, "POST", "/accounts", Some(json!({ "userId": "u1", "initialBalance": "100" }))).await;

        let (status, body) = send(
            &app,
            "POST",
            "/trade/buy",
            Some(json!({
                "userId": "u1",
                "symbol": "VNM",
                "quantity": "79200000000000000000000000",
                "price": "1000"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("overflows"));

        let (_, body) = send(&app, "GET", "/wallet?userId=u1", None).await;
        assert_eq!(body["data"]["balance"], "100");
    }

    #[tokio::test]
    async fn test_cash_history_and_valuation() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_app(&dir).await;
        send(&app, "POST", "/accounts", Some(json!({ "userId": "u1" }))).await;

        let (status, body) = send(
            &app,
            "POST",
            "/wallet/deposit",
            Some(json!({ "userId": "u1", "amount": "5000", "idempotencyKey": "dep-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["type"], "DEPOSIT");

        // Same key again is a replay, not a second deposit.
        send(
            &app,
            "POST",
            "/wallet/deposit",
            Some(json!({ "userId": "u1", "amount": "5000", "idempotencyKey": "dep-1" })),
        )
        .await;
        send(&app, "POST", "/wallet/reward", Some(json!({ "userId": "u1", "amount": "100", "note": "quiz" }))).await;
        send(
            &app,
            "POST",
            "/trade/buy",
            Some(json!({ "userId": "u1", "symbol": "fpt", "quantity": 10, "price": "100" })),
        )
        .await;

        let (status, body) = send(&app, "GET", "/transactions?userId=u1&type=deposit", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);

        let (status, body) = send(&app, "GET", "/transactions?userId=u1&limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 3);
        assert_eq!(body["data"]["items"][0]["symbol"], "FPT");
        assert_eq!(body["data"]["items"].as_array().unwrap().len(), 2);

        let (status, _) = send(&app, "GET", "/transactions?userId=u1&type=TRADE", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, "GET", "/portfolio?userId=u1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["quantity"], "10");

        let (status, body) = send(
            &app,
            "POST",
            "/portfolio/valuation",
            Some(json!({ "userId": "u1", "marks": { "FPT": "110" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["holdings"][0]["marketValue"], "1100");
        assert_eq!(body["data"]["holdings"][0]["unrealizedPnl"], "100");
    }
}
