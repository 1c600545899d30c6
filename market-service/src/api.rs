use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::{MarketError, PurchaseRequest, StockEntry};
use tracing::{error, warn};

use crate::auth::TokenVerifier;
use crate::purchase::PurchaseEngine;
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct AppState<S: LedgerStore> {
    pub engine: PurchaseEngine<S>,
    pub verifier: TokenVerifier,
}

#[derive(Debug, Deserialize)]
pub struct BuyRequest {
    pub settlement_id: i64,
    pub item_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct BuyResponse {
    pub ok: bool,
    pub order_id: String,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct MarketListResponse {
    pub items: Vec<StockEntry>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct MarketQuery {
    #[serde(default = "default_settlement")]
    pub settlement_id: i64,
}

fn default_settlement() -> i64 {
    1
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router<S: LedgerStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/market", get(market_list::<S>))
        .route("/market/buy", post(market_buy::<S>))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn market_buy<S: LedgerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(body): Json<BuyRequest>,
) -> Result<Json<BuyResponse>, ApiError> {
    let buyer_id = authorize(&state.verifier, &headers)?;
    let request_token = match headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        Some(token) if !token.is_empty() => token.to_string(),
        _ => {
            return Err(bad_request(
                "X-Request-Id header required for idempotency",
            ))
        }
    };

    let req = PurchaseRequest {
        request_token,
        buyer_id,
        settlement_id: body.settlement_id,
        item_id: body.item_id,
        quantity: body.quantity,
    };

    match state.engine.purchase(&req).await {
        Ok(receipt) => Ok(Json(BuyResponse {
            ok: true,
            order_id: receipt.order_id,
            duplicate: receipt.duplicate,
        })),
        Err(err) => Err(market_error_response(err)),
    }
}

pub async fn market_list<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Query(query): Query<MarketQuery>,
) -> Result<Json<MarketListResponse>, ApiError> {
    match state.engine.store().list_stock(query.settlement_id).await {
        Ok(items) => Ok(Json(MarketListResponse { items })),
        Err(err) => {
            error!("market listing failed: {}", err);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "market listing unavailable".to_string(),
                }),
            ))
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}

fn authorize(verifier: &TokenVerifier, headers: &HeaderMap) -> Result<i64, ApiError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    verifier.buyer_id(header).map_err(|err| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: err.to_string(),
            }),
        )
    })
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn market_error_response(err: MarketError) -> ApiError {
    let status = match &err {
        MarketError::InvalidQuantity(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MarketError::UnknownListing { .. }
        | MarketError::InsufficientStock { .. }
        | MarketError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
        MarketError::TransientConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
        MarketError::StoreFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    match status {
        StatusCode::INTERNAL_SERVER_ERROR => error!("purchase failed: {}", err),
        StatusCode::SERVICE_UNAVAILABLE => warn!("purchase unavailable: {}", err),
        _ => {}
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_failures_map_to_client_errors() {
        let (status, _) = market_error_response(MarketError::InsufficientStock {
            item_id: 1,
            available: 2,
            requested: 5,
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = market_error_response(MarketError::InsufficientFunds {
            balance: 4,
            required: 5,
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = market_error_response(MarketError::InvalidQuantity(0));
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn store_failures_map_to_server_errors() {
        let (status, _) =
            market_error_response(MarketError::TransientConflict("conflict".to_string()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = market_error_response(MarketError::StoreFault("fault".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn buy_response_serializes_the_wire_shape() {
        let body = BuyResponse {
            ok: true,
            order_id: "tok-1".to_string(),
            duplicate: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ok": true, "order_id": "tok-1", "duplicate": false})
        );
    }
}
