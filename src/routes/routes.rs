//! Defines routes for the ingestion API.
//!
//! ## Structure
//! - **Upload sessions**
//!   - `POST   /uploads` — open a session, returns presigned part URLs
//!   - `GET    /uploads/{id}` — part progress
//!   - `DELETE /uploads/{id}` — abort
//!   - `POST   /uploads/{id}/complete` — finalize (dedup + validation)
//!   - `GET    /uploads/{id}/duplicate` — early duplicate hint
//!   - `GET    /uploads/{id}/status` — media status as seen through the upload
//!   - `PUT    /uploads/{id}/parts/{n}` — report a part uploaded (`{"etag"}`)
//!   - `POST   /uploads/{id}/parts/{n}/failure` — report a failed part
//!   - `POST   /uploads/{id}/parts/{n}/retry` — re-issue a part URL
//!
//! - **Media**
//!   - `GET    /media/{id}/status`
//!   - `DELETE /media/{id}` — owner only, via `x-user-id`
//!
//! - **Outbox dead letters**
//!   - `GET    /outbox/dead-letters`
//!   - `POST   /outbox/{id}/requeue`
//!
//! - **Presigned blob targets** (local blob store)
//!   - `PUT    /blobs/uploads/{id}/parts/{n}`
//!   - `GET    /blobs/objects/{*key}`

use crate::{
    handlers::{
        blob_handlers::{get_object, put_part},
        health_handlers::{healthz, readyz},
        media_handlers::{dead_letters, delete_media, media_status, requeue_event},
        upload_handlers::{
            abort_upload, complete_upload, duplicate_hint, open_upload, record_part,
            record_part_failure, retry_part, upload_progress, upload_status,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Build and return the router; the caller supplies `AppState` via `with_state`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload sessions
        .route("/uploads", post(open_upload))
        .route("/uploads/{id}", get(upload_progress).delete(abort_upload))
        .route("/uploads/{id}/complete", post(complete_upload))
        .route("/uploads/{id}/duplicate", get(duplicate_hint))
        .route("/uploads/{id}/status", get(upload_status))
        .route("/uploads/{id}/parts/{n}", put(record_part))
        .route("/uploads/{id}/parts/{n}/failure", post(record_part_failure))
        .route("/uploads/{id}/parts/{n}/retry", post(retry_part))
        // media
        .route("/media/{id}/status", get(media_status))
        .route("/media/{id}", delete(delete_media))
        // outbox dead letters
        .route("/outbox/dead-letters", get(dead_letters))
        .route("/outbox/{id}/requeue", post(requeue_event))
        // presigned blob targets
        .route("/blobs/uploads/{id}/parts/{n}", put(put_part))
        .route("/blobs/objects/{*key}", get(get_object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::media_file::MediaStatus;
    use crate::services::{
        local_blob_store::tests::store_in,
        message_bus::tests::RecordingBus,
        outbox::{Backoff, OutboxPolicy, OutboxPublisher},
        state_machine::MediaStateMachine,
        upload_sessions::{SessionLimits, UploadSessionManager},
        validation::{DeclaredContentType, ScanningDisabled, ValidationService},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;

    async fn app() -> (Router, tempfile::TempDir) {
        let db = test_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(store_in(dir.path()));
        let outbox = OutboxPublisher::new(
            db.clone(),
            Arc::new(RecordingBus::default()),
            OutboxPolicy {
                max_retries: 3,
                batch_size: 10,
                claim_ttl: Duration::from_secs(60),
                retention: Duration::from_secs(3600),
                backoff: Backoff::Fixed(Duration::from_secs(1)),
            },
        );
        let state_machine = MediaStateMachine::new(db.clone()).with_outbox_notifier(outbox.notifier());
        let limits = SessionLimits {
            ttl: Duration::from_secs(3600),
            max_upload_bytes: 1024 * 1024,
            min_part_size: 4,
            max_parts: 100,
            sparse_sample_bytes: 1024,
            part_retry_limit: 3,
        };
        let state = AppState {
            sessions: UploadSessionManager::new(db.clone(), state_machine.clone(), blobs.clone(), limits),
            validation: ValidationService::new(
                state_machine.clone(),
                Arc::new(ScanningDisabled),
                Arc::new(DeclaredContentType),
            ),
            state_machine,
            outbox,
            blobs,
            db,
        };
        (routes().with_state(state), dir)
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Reply) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let etag = resp
            .headers()
            .get(header::ETAG)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, Reply { etag, json })
    }

    struct Reply {
        etag: Option<String>,
        json: Value,
    }

    fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_req(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    /// Strip scheme and host from a presigned URL.
    fn path_of(url: &str) -> String {
        url.trim_start_matches("http://localhost:3000").to_string()
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (app, _dir) = app().await;
        let (status, body) = call(&app, empty_req("GET", "/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.json, json!({ "status": "ok" }));

        let (status, body) = call(&app, empty_req("GET", "/readyz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.json["checks"]["sqlite"]["ok"], json!(true));
    }

    #[tokio::test]
    async fn upload_flow_over_http() {
        let (app, _dir) = app().await;
        let open = json!({
            "user_id": "user-1",
            "filename": "clip.mp4",
            "content_type": "video/mp4",
            "purpose": "MOVIE_SOURCE",
            "expected_size": 8,
            "part_size": 4
        });
        let (status, body) = call(&app, json_req("POST", "/uploads", open)).await;
        assert_eq!(status, StatusCode::CREATED);
        let upload_id = body.json["session"]["upload_id"].as_str().unwrap().to_string();
        let parts = body.json["parts"].as_array().unwrap().clone();
        assert_eq!(parts.len(), 2);

        // only part 1 lands
        let url = path_of(parts[0]["url"].as_str().unwrap());
        let put = Request::builder()
            .method("PUT")
            .uri(&url)
            .body(Body::from("abcd"))
            .unwrap();
        let (status, body) = call(&app, put).await;
        assert_eq!(status, StatusCode::OK);
        let etag = body.etag.unwrap();
        let (status, _) = call(
            &app,
            json_req("PUT", &format!("/uploads/{upload_id}/parts/1"), json!({ "etag": etag })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, empty_req("POST", &format!("/uploads/{upload_id}/complete"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.json["details"]["missing_parts"], json!([2]));

        let url = path_of(parts[1]["url"].as_str().unwrap());
        let (_, body) = call(
            &app,
            Request::builder().method("PUT").uri(&url).body(Body::from("efgh")).unwrap(),
        )
        .await;
        let (status, _) = call(
            &app,
            json_req(
                "PUT",
                &format!("/uploads/{upload_id}/parts/2"),
                json!({ "etag": body.etag.unwrap() }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, empty_req("POST", &format!("/uploads/{upload_id}/complete"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.json["deduplicated"], json!(false));
        let media_id = body.json["media"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, empty_req("GET", &format!("/media/{media_id}/status"))).await;
        assert_eq!(status, StatusCode::OK);
        let s = body.json["status"].as_str().unwrap();
        assert!(s == "UPLOADED" || s == "VALIDATED", "unexpected status {s}");

        // only the owner may delete
        let (status, _) = call(&app, empty_req("DELETE", &format!("/media/{media_id}"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let owner_delete = Request::builder()
            .method("DELETE")
            .uri(format!("/media/{media_id}"))
            .header("x-user-id", "user-1")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, owner_delete).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.json["status"], json!(MediaStatus::Deleted.as_str()));
    }

    #[tokio::test]
    async fn tampered_part_url_is_forbidden() {
        let (app, _dir) = app().await;
        let open = json!({
            "user_id": "user-1",
            "filename": "clip.mp4",
            "content_type": "video/mp4",
            "purpose": "MOVIE_SOURCE",
            "expected_size": 4,
            "part_size": 4
        });
        let (_, body) = call(&app, json_req("POST", "/uploads", open)).await;
        let url = path_of(body.json["parts"][0]["url"].as_str().unwrap()).replace("/parts/1", "/parts/2");
        let put = Request::builder().method("PUT").uri(&url).body(Body::from("abcd")).unwrap();
        let (status, _) = call(&app, put).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn bad_open_request_is_400_and_unknown_upload_is_404() {
        let (app, _dir) = app().await;
        let open = json!({
            "user_id": "user-1",
            "filename": "poster.png",
            "content_type": "image/png",
            "purpose": "MOVIE_SOURCE",
            "expected_size": 4,
            "part_size": 4
        });
        let (status, body) = call(&app, json_req("POST", "/uploads", open)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.json["status"], json!(400));

        let (status, _) = call(&app, empty_req("GET", "/uploads/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, empty_req("GET", "/uploads/nope/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
