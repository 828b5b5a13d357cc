//! Axum JSON API over the job service.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use jobview_engine::{ApiResponse, AppConfig, DateFilter, JobPage, JobQuery, JobService};
use jobview_storage::ErrorKind;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "jobview-web";

#[derive(Clone)]
pub struct AppState {
    pub service: JobService,
}

impl AppState {
    pub fn new(service: JobService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize, Default)]
struct JobsViewQuery {
    search: Option<String>,
    role: Option<String>,
    company: Option<String>,
    date: Option<String>,
    custom_date: Option<String>,
    page: Option<String>,
}

impl JobsViewQuery {
    fn into_job_query(self) -> Result<JobQuery, String> {
        let date = DateFilter::parse(self.date.as_deref(), self.custom_date.as_deref())
            .map_err(|err| err.to_string())?;
        let page = match self.page.as_deref().map(str::trim) {
            None | Some("") => 1,
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| format!("invalid page '{raw}'"))?,
        };
        Ok(JobQuery {
            search: self.search.unwrap_or_default(),
            role: self.role.filter(|r| !r.is_empty()),
            company: self.company.filter(|c| !c.is_empty()),
            date,
            page,
        })
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", get(jobs_handler))
        .route("/api/jobs/view", get(jobs_view_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/cleanup-duplicates", post(cleanup_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

pub async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let service = JobService::new(config.connector()?);
    let listener = TcpListener::bind(&config.bind).await?;
    info!(bind = %config.bind, "job API listening");
    axum::serve(listener, app(AppState::new(service)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    json_response(state.service.list_jobs_response().await)
}

async fn jobs_view_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<JobsViewQuery>, QueryRejection>,
) -> Response {
    let parsed = query
        .map_err(|rejection| rejection.body_text())
        .and_then(|Query(query)| query.into_job_query());
    match parsed {
        Ok(query) => {
            let today = Local::now().date_naive();
            json_response(state.service.view_response(&query, today).await)
        }
        Err(message) => json_response(ApiResponse::<JobPage>::invalid(message)),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    json_response(state.service.stats_response().await)
}

async fn cleanup_handler(State(state): State<Arc<AppState>>) -> Response {
    json_response(state.service.cleanup_response().await)
}

async fn not_found_handler() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "success": false, "error": "Endpoint not found" })),
    )
        .into_response()
}

fn json_response<T: Serialize>(response: ApiResponse<T>) -> Response {
    let status = match (response.success, response.error_kind) {
        (true, _) => StatusCode::OK,
        (false, Some(ErrorKind::CollectionNotFound)) => StatusCode::NOT_FOUND,
        (false, Some(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        (false, None) => StatusCode::BAD_REQUEST,
    };
    (status, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use async_trait::async_trait;
    use jobview_storage::{MemoryRecordStore, RecordStore, StoreConnector, StoreError};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn seeded_app() -> (Router, MemoryRecordStore) {
        let store = MemoryRecordStore::new();
        for job_id in ["A", "A", "B"] {
            store
                .insert_document(json!({
                    "job_id": job_id,
                    "job_title": "Software Engineer",
                    "company_name": "Acme",
                    "location_full": "Remote",
                    "timestamp_added": "2025-12-05",
                    "job_url": "https://jobs.example/1",
                }))
                .await;
        }
        let service = JobService::new(Arc::new(store.clone()));
        (app(AppState::new(service)), store)
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_get_jobs() {
        let (app, _store) = seeded_app().await;
        let resp = app.oneshot(get("/api/jobs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 2);
        assert_eq!(body["jobs"][0]["id"], 3);
        assert_eq!(body["jobs"][0]["job_title"], "Software Engineer");
    }

    #[tokio::test]
    async fn handler_smoke_get_stats() {
        let (app, _store) = seeded_app().await;
        let body = body_json(app.oneshot(get("/api/stats")).await.unwrap()).await;
        assert_eq!(
            body,
            json!({
                "success": true,
                "stats": {
                    "total_jobs": 2,
                    "total_documents": 3,
                    "duplicate_count": 1,
                    "total_companies": 1
                }
            })
        );
    }

    #[tokio::test]
    async fn handler_smoke_cleanup_post() {
        let (app, store) = seeded_app().await;
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cleanup-duplicates")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["deleted_count"], 1);
        assert_eq!(body["kept_count"], 2);
        assert_eq!(body["message"], "Successfully deleted 1 duplicate jobs");
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn view_clamps_page_and_reports_facets() {
        let (app, _store) = seeded_app().await;
        let resp = app
            .oneshot(get("/api/jobs/view?search=engineer&page=99"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["page"], 1);
        assert_eq!(body["total_pages"], 1);
        assert_eq!(body["total_count"], 2);
        assert_eq!(body["companies"][0]["value"], "Acme");
        assert_eq!(body["companies"][0]["count"], 2);
    }

    #[tokio::test]
    async fn view_rejects_unknown_date_filter() {
        let (app, _store) = seeded_app().await;
        let resp = app.oneshot(get("/api/jobs/view?date=fortnight")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn non_numeric_page_is_a_json_400() {
        let (app, _store) = seeded_app().await;
        let resp = app.oneshot(get("/api/jobs/view?page=abc")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "invalid page 'abc'");
    }

    #[tokio::test]
    async fn empty_page_defaults_to_first() {
        let (app, _store) = seeded_app().await;
        let resp = app.oneshot(get("/api/jobs/view?page=")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["page"], 1);
    }

    struct MissingCollection;

    #[async_trait]
    impl StoreConnector for MissingCollection {
        async fn open(&self) -> Result<Box<dyn RecordStore>, StoreError> {
            Err(StoreError::CollectionNotFound {
                requested: Some("jobs".into()),
                discovered: vec!["n8n_jobs".into()],
            })
        }

        async fn discover(&self) -> Result<Vec<String>, StoreError> {
            Ok(vec!["n8n_jobs".into()])
        }
    }

    #[tokio::test]
    async fn missing_collection_is_a_structured_404() {
        let app = app(AppState::new(JobService::new(Arc::new(MissingCollection))));
        let resp = app.oneshot(get("/api/jobs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "collection_not_found");
        assert_eq!(
            body["error"],
            "collection 'jobs' not found; discovered: n8n_jobs"
        );
    }

    #[tokio::test]
    async fn unavailable_store_is_a_structured_500() {
        let (app, store) = seeded_app().await;
        store.set_unavailable(true).await;
        let resp = app.oneshot(get("/api/stats")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "store_unavailable");
        assert!(body.get("stats").is_none());
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (app, _store) = seeded_app().await;
        let resp = app.oneshot(get("/api/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body, json!({ "success": false, "error": "Endpoint not found" }));
    }
}
