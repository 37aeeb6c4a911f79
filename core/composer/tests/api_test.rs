mod common;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{chunk, engine, engine_with_store, query};
use deal_memory_ingestion::FactStore;
use deal_memory_composer::router;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

async fn send(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

fn post_json(uri: &str, body: &impl serde::Serialize) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

fn get(uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder().uri(uri).body(Body::empty())?)
}

#[tokio::test]
async fn test_health_reports_indexed_chunks() -> Result<()> {
    let (engine, _worker) = engine();
    let app = router(Arc::new(engine));

    let (status, body) = send(&app, get("/health")?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["indexed_chunks"], 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_query_is_bad_request() -> Result<()> {
    let (engine, _worker) = engine();
    let app = router(Arc::new(engine));

    let (status, body) = send(&app, post_json("/query", &query("   "))?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_unknown_document_is_not_found() -> Result<()> {
    let (engine, _worker) = engine();
    let app = router(Arc::new(engine));

    let (status, _) = send(&app, get("/documents/missing_doc/status")?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_ingested_chunk_shows_in_document_status() -> Result<()> {
    let (engine, _worker) = engine();
    let app = router(Arc::new(engine));

    let c = chunk("deck", "deck.pdf", "Q3 revenue = 5.2M");
    let (status, receipt) = send(&app, post_json("/ingest/chunk", &c)?).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(receipt["fast_path_indexed"], true);

    let (status, body) = send(&app, get("/documents/deck/status")?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chunks"], 1);
    assert_eq!(body["pending"], 1);

    let (status, body) = send(&app, post_json("/query", &query("revenue"))?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["coverage"], "fast_path");
    Ok(())
}

#[tokio::test]
async fn test_invariants_endpoint_is_clean_on_empty_store() -> Result<()> {
    let (engine, _worker) = engine();
    let app = router(Arc::new(engine));

    let (status, body) = send(&app, get("/invariants")?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
    Ok(())
}

#[tokio::test]
async fn test_unreadable_store_is_service_unavailable() -> Result<()> {
    let temp = tempfile::NamedTempFile::new()?;
    let (engine, _worker) = engine_with_store(FactStore::open(temp.path())?.into_shared());
    let app = router(Arc::new(engine));

    let (status, _) = send(&app, post_json("/query", &query("revenue"))?).await?;
    assert_eq!(status, StatusCode::OK);

    std::fs::write(temp.path(), vec![0x42u8; 8192])?;
    let (status, body) = send(&app, post_json("/query", &query("revenue"))?).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"]
        .as_str()
        .unwrap_or_default()
        .contains("fact store unavailable"));

    let (status, _) = send(&app, get("/health")?).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}
