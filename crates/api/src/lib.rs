//! Trunchbull API: JSON endpoints over the dashboard store and sync engine.
//!
//! Handlers stay thin: reads go through [`DashboardAggregator`], sync triggers
//! and status through [`SyncOrchestrator`]. Engine errors map to status codes
//! in [`error::status_for`].

pub mod error;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use trunchbull_core::dashboard::DashboardAggregator;
use trunchbull_core::db::repository::{
    EventRepository, StudentRepository, SyncStatusRepository, TokenRepository,
};
use trunchbull_core::db::sqlite::SqliteRepository;
use trunchbull_core::error::TrunchbullError;
use trunchbull_core::models::assignment::AssignmentFilter;
use trunchbull_core::models::common::Source;
use trunchbull_core::models::event::EventFilter;
use trunchbull_core::models::grade::GradeFilter;
use trunchbull_core::models::message::MessageFilter;
use trunchbull_core::models::student::NewStudent;
use trunchbull_core::sync::cancel::CancelToken;
use trunchbull_core::sync::SyncOrchestrator;

use crate::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

/// Shared application state for all routes.
pub struct AppState {
    pub repo: SqliteRepository,
    pub orchestrator: Arc<SyncOrchestrator<SqliteRepository>>,
    pub dashboard: DashboardAggregator<SqliteRepository>,
}

impl AppState {
    pub fn new(repo: SqliteRepository, orchestrator: Arc<SyncOrchestrator<SqliteRepository>>) -> Self {
        Self {
            dashboard: DashboardAggregator::new(repo.clone()),
            repo,
            orchestrator,
        }
    }
}

/// Build the router with all routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/students", get(list_students).post(create_student))
        .route("/api/students/:id", get(get_student).delete(delete_student))
        .route("/api/dashboard/:student_id", get(dashboard))
        .route("/api/assignments/:student_id", get(assignments))
        .route("/api/grades/:student_id", get(grades))
        .route("/api/gpa/:student_id", get(gpa))
        .route("/api/events", get(events))
        .route("/api/events/:id", delete(delete_event))
        .route("/api/messages/:student_id", get(messages))
        .route("/api/sync/status", get(sync_status))
        .route("/api/sync/:student_id", post(trigger_sync))
        .route("/api/auth/status/:student_id", get(auth_status))
        .route("/api/auth/:provider/:student_id", delete(logout))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn student_not_found(id: &str) -> ApiError {
    TrunchbullError::NotFound(format!("student '{id}'")).into()
}

// -- Students --

async fn list_students(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let students = state.repo.list_students().await?;
    Ok(Json(json!({ "students": students })))
}

async fn create_student(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewStudent>,
) -> ApiResult<impl IntoResponse> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    let student = state.repo.create_student(&body).await?;
    info!(student_id = %student.id, "Student created");
    Ok((StatusCode::CREATED, Json(json!({ "student": student }))))
}

async fn get_student(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    match state.repo.get_student(&id).await? {
        Some(student) => Ok(Json(json!({ "student": student }))),
        None => Err(student_not_found(&id)),
    }
}

async fn delete_student(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.repo.delete_student(&id).await? {
        info!(student_id = %id, "Student deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(student_not_found(&id))
    }
}

// -- Dashboard reads --

async fn dashboard(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dashboard.dashboard(&student_id).await?))
}

async fn assignments(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
    Query(filter): Query<AssignmentFilter>,
) -> ApiResult<impl IntoResponse> {
    let assignments = state.dashboard.assignments(&student_id, &filter).await?;
    Ok(Json(json!({ "assignments": assignments })))
}

async fn grades(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
    Query(filter): Query<GradeFilter>,
) -> ApiResult<impl IntoResponse> {
    let grades = state.dashboard.grades(&student_id, &filter).await?;
    Ok(Json(json!({ "grades": grades })))
}

async fn gpa(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let gpa = state.dashboard.gpa(&student_id).await?;
    Ok(Json(json!({ "student_id": student_id, "gpa": gpa })))
}

async fn events(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<EventFilter>,
) -> ApiResult<impl IntoResponse> {
    let events = state.dashboard.events(&filter).await?;
    Ok(Json(json!({ "events": events })))
}

async fn delete_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.repo.delete_event(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TrunchbullError::NotFound(format!("event '{id}'")).into())
    }
}

async fn messages(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
    Query(filter): Query<MessageFilter>,
) -> ApiResult<impl IntoResponse> {
    let messages = state.dashboard.messages(&student_id, &filter).await?;
    Ok(Json(json!({ "messages": messages })))
}

// -- Sync --

async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let report = state
        .orchestrator
        .trigger_sync(&student_id, &CancelToken::never())
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    student_id: Option<String>,
}

async fn sync_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<impl IntoResponse> {
    let statuses = match query.student_id {
        Some(ref id) => state.orchestrator.sync_status(id).await?,
        None => state.repo.list_sync_statuses(None).await?,
    };
    Ok(Json(json!({ "sync_status": statuses })))
}

// -- Auth --

async fn auth_status(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let student = state
        .repo
        .get_student(&student_id)
        .await?
        .ok_or_else(|| student_not_found(&student_id))?;

    let mut providers = Vec::with_capacity(Source::ALL.len());
    for source in Source::ALL {
        let token = state.repo.get_token(&student_id, source).await?;
        providers.push(json!({
            "provider": source,
            "linked": student.external_id(source).is_some(),
            "authenticated": token.is_some(),
            "expires_at": token.and_then(|t| t.expires_at),
        }));
    }
    Ok(Json(json!({ "student_id": student_id, "providers": providers })))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Path((provider, student_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let source: Source = provider.parse()?;
    let deleted = state.repo.delete_token(&student_id, source).await?;
    if deleted {
        info!(student_id = %student_id, provider = %source, "Provider credentials removed");
    }
    Ok(Json(json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::collections::HashMap;
    use tower::ServiceExt;
    use trunchbull_core::config::TrunchbullConfig;
    use trunchbull_core::db::DatabasePool;
    use trunchbull_core::models::token::OAuthToken;
    use trunchbull_core::token_store::OAuthTokenStore;

    async fn test_state() -> Arc<AppState> {
        let pool = DatabasePool::new_sqlite_memory().await.unwrap();
        let repo = SqliteRepository::new(pool.into_sqlite());
        let tokens = OAuthTokenStore::new(Arc::new(repo.clone()), HashMap::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            repo.clone(),
            Arc::new(tokens),
            &TrunchbullConfig::default(),
        ));
        Arc::new(AppState::new(repo, orchestrator))
    }

    async fn get_json(response: axum::http::Response<Body>) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn send(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn create_s1(state: &Arc<AppState>) {
        let response = router(state.clone())
            .oneshot(send(
                "POST",
                "/api/students",
                Some(json!({
                    "id": "S1",
                    "name": "Matilda Wormwood",
                    "grade_level": 5,
                    "schoology_user_id": "1001",
                    "powerschool_student_id": "ps-1"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn health_ok() {
        let app = router(test_state().await);
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_fetch_student() {
        let state = test_state().await;
        create_s1(&state).await;

        let response = router(state.clone())
            .oneshot(get("/api/students/S1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = get_json(response).await;
        assert_eq!(json["student"]["name"], "Matilda Wormwood");

        let response = router(state).oneshot(get("/api/students")).await.unwrap();
        let json = get_json(response).await;
        assert_eq!(json["students"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_student_is_conflict() {
        let state = test_state().await;
        create_s1(&state).await;

        let response = router(state)
            .oneshot(send(
                "POST",
                "/api/students",
                Some(json!({"id": "S1", "name": "Someone Else"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = get_json(response).await;
        assert_eq!(json["kind"], "conflict");
    }

    #[tokio::test]
    async fn blank_name_is_bad_request() {
        let app = router(test_state().await);
        let response = app
            .oneshot(send("POST", "/api/students", Some(json!({"name": "  "}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_student_is_404() {
        let state = test_state().await;
        for uri in [
            "/api/students/ghost",
            "/api/dashboard/ghost",
            "/api/gpa/ghost",
            "/api/assignments/ghost",
        ] {
            let response = router(state.clone()).oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            let json = get_json(response).await;
            assert_eq!(json["kind"], "not_found");
        }
    }

    #[tokio::test]
    async fn dashboard_for_new_student_is_empty() {
        let state = test_state().await;
        create_s1(&state).await;

        let response = router(state)
            .oneshot(get("/api/dashboard/S1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = get_json(response).await;
        assert_eq!(json["summary"]["outstanding_assignments"], 0);
        assert_eq!(json["summary"]["unread_messages"], 0);
        assert!(json["assignments"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_status_lists_every_slot() {
        let state = test_state().await;
        create_s1(&state).await;

        let response = router(state.clone())
            .oneshot(get("/api/sync/status?student_id=S1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = get_json(response).await;
        let slots = json["sync_status"].as_array().unwrap();
        assert_eq!(slots.len(), 10);
        assert!(slots.iter().all(|s| s["status"] == "never_synced"));

        let response = router(state)
            .oneshot(get("/api/sync/status"))
            .await
            .unwrap();
        let json = get_json(response).await;
        assert!(json["sync_status"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn trigger_sync_unknown_student_is_404() {
        let app = router(test_state().await);
        let response = app
            .oneshot(send("POST", "/api/sync/ghost", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn auth_status_and_logout() {
        let state = test_state().await;
        create_s1(&state).await;
        state
            .repo
            .save_token(&OAuthToken {
                student_id: "S1".to_string(),
                source: Source::Schoology,
                access_token: "tok".to_string(),
                refresh_token: None,
                expires_at: None,
            })
            .await
            .unwrap();

        let response = router(state.clone())
            .oneshot(get("/api/auth/status/S1"))
            .await
            .unwrap();
        let json = get_json(response).await;
        let providers = json["providers"].as_array().unwrap();
        assert_eq!(providers[0]["provider"], "schoology");
        assert_eq!(providers[0]["authenticated"], true);
        assert_eq!(providers[1]["authenticated"], false);
        assert_eq!(providers[1]["linked"], true);

        let response = router(state.clone())
            .oneshot(send("DELETE", "/api/auth/schoology/S1", None))
            .await
            .unwrap();
        assert_eq!(get_json(response).await["deleted"], true);

        let response = router(state)
            .oneshot(send("DELETE", "/api/auth/canvas/S1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_student_then_404() {
        let state = test_state().await;
        create_s1(&state).await;

        let response = router(state.clone())
            .oneshot(send("DELETE", "/api/students/S1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router(state)
            .oneshot(send("DELETE", "/api/students/S1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn events_list_and_missing_delete() {
        let state = test_state().await;
        let response = router(state.clone())
            .oneshot(get("/api/events"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(get_json(response).await["events"].as_array().unwrap().is_empty());

        let response = router(state)
            .oneshot(send("DELETE", "/api/events/nope", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
