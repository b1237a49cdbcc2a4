//! Entity read/write/query handlers (spec.md §6.2).
//!
//! Write endpoints are fire-and-forget: a `202` means the request is
//! durably enqueued in the Write Queue, not yet committed to the store.
//! Strong visibility comes from polling `GET /receipt/{id}` afterward.

use std::collections::{BTreeMap, HashMap};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use ledger_core::{synthetic, OwnerAddress, Predicate, QueryExpr, QueryOptions};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::query::{self, FilterBody};
use crate::queue::{EnqueueError, EnqueueRequest, PendingKind};
use crate::store::StoreError;

/// `POST /entities` and `POST /entities/update/{key}` share this body
/// shape (spec.md §6.2).
#[derive(Debug, Deserialize)]
pub struct EntityWriteRequest {
    #[serde(default)]
    pub key: String,
    pub expires_in: u64,
    pub content_type: String,
    pub owner_address: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub string_annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub numeric_annotations: HashMap<String, Value>,
}

fn owner_from_hex(hex_str: &str) -> Result<OwnerAddress, (StatusCode, Json<Value>)> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| bad_request("owner_address must be hex-encoded"))?;
    let array: [u8; 20] = bytes
        .try_into()
        .map_err(|_| bad_request("owner_address must decode to 20 bytes"))?;
    Ok(OwnerAddress::from_bytes(array))
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn enqueue_error_response(error: EnqueueError) -> (StatusCode, Json<Value>) {
    bad_request(&error.to_string())
}

fn build_request(body: EntityWriteRequest, key_override: Option<String>) -> Result<EnqueueRequest, (StatusCode, Json<Value>)> {
    let key = key_override.unwrap_or(body.key);
    if key.is_empty() {
        return Err(bad_request("key must not be empty"));
    }
    if body.content_type.is_empty() {
        return Err(bad_request("content_type must not be empty"));
    }
    if body.owner_address.is_empty() {
        return Err(bad_request("owner_address must not be empty"));
    }
    if body.expires_in == 0 {
        return Err(bad_request("expires_in must be greater than zero"));
    }

    let owner = owner_from_hex(&body.owner_address)?;
    let content = if body.payload.is_empty() {
        Bytes::new()
    } else {
        Bytes::from(STANDARD.decode(&body.payload).map_err(|_| bad_request("payload must be base64-encoded"))?)
    };

    Ok(EnqueueRequest {
        plaintext_key: key,
        content_type: body.content_type,
        content,
        owner,
        btl: body.expires_in,
        string_attributes: body.string_annotations,
        numeric_attributes: body.numeric_annotations,
    })
}

/// `POST /entities` (spec.md §6.2).
pub async fn create_handler(State(state): State<AppState>, Json(body): Json<EntityWriteRequest>) -> (StatusCode, Json<Value>) {
    let request = match build_request(body, None) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match state.queue.enqueue(PendingKind::Create, request) {
        Ok(operation_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "receipt_id": operation_id, "queue_size": state.queue.queue_size() })),
        ),
        Err(error) => enqueue_error_response(error),
    }
}

/// `POST /entities/update/{key}` (spec.md §6.2: "the URL-path `key`
/// overrides any body-level key").
pub async fn update_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<EntityWriteRequest>,
) -> (StatusCode, Json<Value>) {
    let request = match build_request(body, Some(key)) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match state.queue.enqueue(PendingKind::Update, request) {
        Ok(operation_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "receipt_id": operation_id, "queue_size": state.queue.queue_size() })),
        ),
        Err(error) => enqueue_error_response(error),
    }
}

/// `GET /entities/{key}` (spec.md §6.2): the latest entity matching
/// `$key = key`, via the point-lookup shortcut.
pub async fn get_handler(State(state): State<AppState>, Path(key): Path<String>) -> (StatusCode, Json<Value>) {
    let expr = QueryExpr::new(vec![Predicate::StringEq { key: synthetic::KEY.to_string(), value: key }]);
    match query::run(state.store.as_ref(), &expr, &QueryOptions::default()).await {
        Ok(results) => match results.into_iter().next() {
            Some(entity) => (StatusCode::OK, Json(serde_json::to_value(entity).unwrap_or(Value::Null))),
            None => (StatusCode::NOT_FOUND, Json(json!({ "error": "entity not found" }))),
        },
        Err(error) => store_error_response(error),
    }
}

/// `POST /entities/query` (spec.md §6.2).
pub async fn query_handler(State(state): State<AppState>, Json(body): Json<FilterBody>) -> (StatusCode, Json<Value>) {
    let (expr, options) = match query::filter::parse(body) {
        Ok(parsed) => parsed,
        Err(error) => return bad_request(&error.to_string()),
    };

    match query::run(state.store.as_ref(), &expr, &options).await {
        Ok(results) => (StatusCode::OK, Json(json!({ "entities": results }))),
        Err(error) => store_error_response(error),
    }
}

/// `GET /entities/count` (spec.md §6.2, supplemented endpoint).
pub async fn count_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "count": state.store.count_active().await }))
}

/// `DELETE /entities/clean` (spec.md §6.2: "administrative truncate;
/// optional").
pub async fn clean_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.store.clean().await {
        Ok(true) => (StatusCode::OK, Json(json!({ "cleaned": true }))),
        Ok(false) => (StatusCode::NOT_IMPLEMENTED, Json(json!({ "error": "clean is not implemented by this backend" }))),
        Err(error) => store_error_response(error),
    }
}

/// `GET /receipt/{id}` (spec.md §6.2).
pub async fn receipt_handler(State(state): State<AppState>, Path(id): Path<u64>) -> (StatusCode, Json<Value>) {
    use crate::queue::OperationId;

    match state.receipts.get(OperationId(id)) {
        Some(receipt) => (
            StatusCode::OK,
            Json(json!({ "id": receipt.operation_id, "key": receipt.key, "created_at_block": receipt.created_at_block })),
        ),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "receipt not found or not yet committed" }))),
    }
}

fn store_error_response(error: StoreError) -> (StatusCode, Json<Value>) {
    let status = match error {
        StoreError::BadQuery(_) => StatusCode::BAD_REQUEST,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists | StoreError::MalformedBatch(_) | StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetworkConfig, ShutdownController};
    use crate::queue::WriteQueue;
    use crate::receipt::ReceiptRegistry;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Instant;

    fn test_state() -> AppState {
        AppState {
            queue: Arc::new(WriteQueue::new(1, 10)),
            store: Arc::new(MemoryStore::new(10)),
            receipts: Arc::new(ReceiptRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        }
    }

    fn write_body(key: &str) -> EntityWriteRequest {
        EntityWriteRequest {
            key: key.to_string(),
            expires_in: 100,
            content_type: "text/plain".to_string(),
            owner_address: "0".repeat(40),
            payload: String::new(),
            string_annotations: BTreeMap::new(),
            numeric_annotations: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_handler_accepts_valid_request() {
        let state = test_state();
        let (status, _body) = create_handler(State(state), Json(write_body("a"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn create_handler_rejects_empty_key() {
        let state = test_state();
        let (status, _body) = create_handler(State(state), Json(write_body(""))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_handler_rejects_zero_expires_in() {
        let state = test_state();
        let mut body = write_body("a");
        body.expires_in = 0;
        let (status, _body) = create_handler(State(state), Json(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_handler_uses_path_key_over_body_key() {
        let state = test_state();
        let mut body = write_body("body-key");
        body.key = "body-key".to_string();
        let (status, _body) = update_handler(State(state.clone()), Path("path-key".to_string()), Json(body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let drained = state.queue.drain();
        assert_eq!(drained.updates[0].request.plaintext_key, "path-key");
    }

    #[tokio::test]
    async fn get_handler_returns_404_for_missing_entity() {
        let state = test_state();
        let (status, _body) = get_handler(State(state), Path("missing".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn receipt_handler_returns_404_before_commit() {
        let state = test_state();
        let (status, _body) = receipt_handler(State(state), Path(1)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn count_handler_reports_zero_on_empty_store() {
        let state = test_state();
        let body = count_handler(State(state)).await;
        assert_eq!(body.0["count"], 0);
    }
}
