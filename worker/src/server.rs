use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use tracing::warn;

use common::shuffle::ShuffleStore;
use common::EngineError;

/// Shuffle server: every worker serves its local blocks to reducers over
/// plain HTTP. The recorded checksum rides along in a header so callers can
/// verify without a second request.
pub fn build_router(store: ShuffleStore) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/shuffle/:map_task_id/:partition", get(get_block))
        .with_state(store)
}

async fn health() -> &'static str {
    "ok"
}

async fn get_block(
    State(store): State<ShuffleStore>,
    Path((map_task_id, partition)): Path<(String, u32)>,
) -> Result<impl IntoResponse, StatusCode> {
    match store.read_block(&map_task_id, partition) {
        Ok((bytes, meta)) => Ok((
            [
                ("content-type", "application/x-ndjson".to_string()),
                ("x-block-checksum", meta.checksum.to_string()),
            ],
            bytes,
        )),
        Err(EngineError::BlockNotFound { .. }) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!("failed to read block {}/{}: {}", map_task_id, partition, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn serves_block_with_checksum_header() {
        let base = std::env::temp_dir()
            .join("shuffle_server_tests")
            .join(uuid::Uuid::new_v4().to_string());
        let store = ShuffleStore::new(&base).unwrap();
        let meta = store
            .write_block("map-1", 0, &[json!({"k": "the", "v": 1_u64})])
            .unwrap();

        let app = build_router(store);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/shuffle/map-1/0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["x-block-checksum"],
            meta.checksum.to_string().as_str()
        );
    }

    #[tokio::test]
    async fn missing_block_is_404() {
        let base = std::env::temp_dir()
            .join("shuffle_server_tests")
            .join(uuid::Uuid::new_v4().to_string());
        let app = build_router(ShuffleStore::new(&base).unwrap());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/shuffle/nope/0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
