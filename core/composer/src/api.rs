use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use deal_memory_ingestion::EngineError;
use deal_memory_schemas::{AssertFactRequest, Chunk, QueryRequest, ResolveRequest};
use std::sync::Arc;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::engine::KnowledgeEngine;

#[derive(Clone)]
struct AppState {
    engine: Arc<KnowledgeEngine>,
}

/// Engine errors mapped onto HTTP statuses.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] EngineError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::InvariantViolation(_) => StatusCode::CONFLICT,
            EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::RetrievalTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::ExtractionFailure { .. } => StatusCode::BAD_GATEWAY,
            EngineError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(engine: Arc<KnowledgeEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ingest/chunk", post(ingest_chunk))
        .route("/query", post(query))
        .route("/facts/assert", post(assert_fact))
        .route("/memory/:deal_id/:topic", get(get_memory))
        .route("/contradictions/resolve", post(resolve_contradiction))
        .route("/documents/:document_id/status", get(document_status))
        .route("/invariants", get(invariants))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(AppState { engine })
}

async fn health_check(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let chunks = state.engine.health().await?;
    Ok(Json(serde_json::json!({
        "service": "deal-memory",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "indexed_chunks": chunks,
    })))
}

async fn ingest_chunk(
    State(state): State<AppState>,
    Json(chunk): Json<Chunk>,
) -> ApiResult<impl IntoResponse> {
    info!(
        "Ingest chunk {} (deal={}, document={})",
        chunk.chunk_id, chunk.deal_id, chunk.document_id
    );
    let receipt = state.engine.ingest_chunk(chunk).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<impl IntoResponse> {
    info!("Query: '{}' (limit {})", request.text, request.limit);
    let response = state.engine.query(&request).await?;
    Ok(Json(response))
}

async fn assert_fact(
    State(state): State<AppState>,
    Json(request): Json<AssertFactRequest>,
) -> ApiResult<impl IntoResponse> {
    info!("Asserted fact for deal {}", request.deal_id);
    let response = state.engine.assert_fact(&request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_memory(
    State(state): State<AppState>,
    Path((deal_id, topic)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let file = state.engine.get_memory(&deal_id, &topic).await?;
    Ok(Json(file))
}

async fn resolve_contradiction(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<impl IntoResponse> {
    let resolution = state.engine.resolve_contradiction(&request).await?;
    Ok(Json(resolution))
}

async fn document_status(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = state.engine.document_status(&document_id).await?;
    Ok(Json(status))
}

async fn invariants(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let findings = state.engine.invariants().await?;
    let status = if findings.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(findings)))
}
