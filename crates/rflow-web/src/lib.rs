//! JSON API over the sync pipeline: trigger a sync, read the stored roster,
//! kick the batch run.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use rflow_core::{dedupe, SyncError};
use rflow_storage::{RosterStore, UserDirectory};
use rflow_sync::{BatchRunner, SyncOrchestrator, SyncRequest};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rflow-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub store: Arc<dyn RosterStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub batch: Arc<BatchRunner>,
    /// Shared secret gating the batch endpoint; empty disables it entirely.
    pub batch_secret: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            success: false,
            error: message.into(),
        }),
    )
        .into_response()
}

fn status_for(error: &SyncError) -> StatusCode {
    match error {
        SyncError::MissingCredential => StatusCode::BAD_REQUEST,
        SyncError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        SyncError::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
        SyncError::ExtractionFailed(_)
        | SyncError::CalendarContainerUnresolved(_)
        | SyncError::CalendarMutationFailed(_) => StatusCode::BAD_GATEWAY,
        SyncError::PersistenceFailed(_) | SyncError::Canonical(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(sync_handler))
        .route("/roster/{person}", get(roster_handler))
        .route("/batch", post(batch_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Response {
    match state.orchestrator.run(request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            error!(error = %err, "sync request failed");
            error_response(status_for(&err), err.to_string())
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RosterQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
struct RosterBody {
    person: String,
    display_name: String,
    historical_from: Option<NaiveDate>,
    entries: Vec<rflow_core::RosterEntry>,
}

async fn roster_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(person): AxumPath<String>,
    Query(query): Query<RosterQuery>,
) -> Response {
    let user = match state.directory.get(&person).await {
        Ok(Some(user)) => user,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "unknown person"),
        Err(err) => {
            error!(error = %err, "user lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };

    let range = match (query.from, query.to) {
        (Some(from), Some(to)) if from > to => {
            return error_response(StatusCode::BAD_REQUEST, "from is after to");
        }
        (Some(from), Some(to)) => Some((from, to)),
        (Some(from), None) => Some((from, NaiveDate::MAX)),
        (None, Some(to)) => Some((NaiveDate::MIN, to)),
        (None, None) => None,
    };

    match state.store.query(&user.person, range).await {
        Ok(entries) => {
            let historical_from = match state.store.first_data_date(&user.person).await {
                Ok(date) => date,
                Err(err) => {
                    error!(error = %err, "historical range lookup failed");
                    None
                }
            };
            Json(RosterBody {
                person: user.person,
                display_name: user.display_name,
                historical_from,
                entries: dedupe(entries),
            })
            .into_response()
        }
        Err(err) => {
            error!(error = %err, "roster query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct BatchQuery {
    secret: Option<String>,
}

async fn batch_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BatchQuery>,
) -> Response {
    if state.batch_secret.is_empty() {
        return error_response(StatusCode::FORBIDDEN, "batch endpoint disabled");
    }
    if query.secret.as_deref() != Some(state.batch_secret.as_str()) {
        return error_response(StatusCode::UNAUTHORIZED, "bad batch secret");
    }
    match state.batch.run().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            error!(error = %err, "batch run failed");
            error_response(status_for(&err), err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use rflow_core::{Credential, RawRosterEntry, RosterEntry};
    use rflow_extract::{ExtractionEngine, PortalProfile, ScriptedBrowser, ScriptedPage};
    use rflow_storage::{CredentialCipher, MemoryRosterStore, MemoryUserDirectory};
    use rflow_sync::{
        FixedCalendarProvider, InMemoryCalendar, InlineRunner, ReconcileEngine, ReconcilePolicy,
    };
    use tower::ServiceExt;

    const ROSTER_HTML: &str = r#"
        <table>
          <tr>
            <td>x</td><td>Fleet</td><td>Deckhand</td><td>Sea Scheldt</td>
            <td>27/06/2026 08:00</td><td>27/06/2026 20:00</td><td>Day shift</td>
            <td></td><td></td>
          </tr>
        </table>
    "#;

    struct TestBed {
        state: AppState,
        store: Arc<MemoryRosterStore>,
        directory: Arc<MemoryUserDirectory>,
    }

    fn testbed(roster_is_login: bool) -> TestBed {
        let mut profile = PortalProfile::for_base_url("https://portal.example/Roster");
        profile.result_wait = Duration::from_millis(0);
        profile.fallback_delay = Duration::from_millis(0);

        let login = ScriptedPage {
            title: "Login".into(),
            html: "<html>login</html>".into(),
            selectors: HashSet::from([
                profile.username_selector.clone(),
                profile.password_selector.clone(),
                profile.login_button_selector.clone(),
            ]),
            fields: Default::default(),
        };
        let roster = if roster_is_login {
            login.clone()
        } else {
            ScriptedPage {
                title: "Roster".into(),
                html: ROSTER_HTML.to_string(),
                selectors: Default::default(),
                fields: Default::default(),
            }
        };
        let browser = Arc::new(
            ScriptedBrowser::new()
                .with_page(&profile.login_url, login)
                .with_page(&profile.roster_url, roster)
                .with_click_navigation(&profile.login_button_selector, &profile.roster_url),
        );

        let key = CredentialCipher::generate_hex_key();
        let store = Arc::new(MemoryRosterStore::new());
        let directory = Arc::new(MemoryUserDirectory::new(
            CredentialCipher::from_hex_key(&key).unwrap(),
        ));
        let policy = ReconcilePolicy {
            mutation_delay: Duration::from_millis(0),
            ..Default::default()
        };
        let reconciler = Arc::new(ReconcileEngine::new(
            Arc::new(FixedCalendarProvider::new(Arc::new(InMemoryCalendar::new()))),
            directory.clone(),
            policy,
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            directory.clone(),
            Arc::new(ExtractionEngine::new(browser, profile)),
            reconciler,
            CredentialCipher::from_hex_key(&key).unwrap(),
            Arc::new(InlineRunner),
        ));
        let batch = Arc::new(BatchRunner::new(
            orchestrator.clone(),
            directory.clone(),
            360,
            Duration::from_millis(0),
        ));
        TestBed {
            state: AppState {
                orchestrator,
                store: store.clone(),
                directory: directory.clone(),
                batch,
                batch_secret: "s3cret".into(),
            },
            store,
            directory,
        }
    }

    fn stored_entry(date: &str) -> RosterEntry {
        RosterEntry::from_raw(
            &RawRosterEntry {
                person: "jdoe".into(),
                date: date.into(),
                start: date.into(),
                end: date.into(),
                entry_type: "Leave".into(),
                function: String::new(),
                department: String::new(),
                vessel: String::new(),
            },
            Utc::now(),
        )
        .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn sync_endpoint_runs_the_pipeline() {
        let bed = testbed(false);
        let app = app(bed.state);

        let resp = app
            .oneshot(post_json(
                "/sync",
                serde_json::json!({"person": "jdoe", "password": "hunter2"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["is_live"], true);
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);

        let stored = bed.store.query("jdoe", None).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn sync_maps_auth_failure_to_401() {
        let bed = testbed(true);
        let app = app(bed.state);

        let resp = app
            .oneshot(post_json(
                "/sync",
                serde_json::json!({"person": "jdoe", "password": "wrong", "verify": true}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn sync_without_known_person_is_400() {
        let bed = testbed(false);
        let app = app(bed.state);

        let resp = app
            .oneshot(post_json("/sync", serde_json::json!({"person": "nobody"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn roster_endpoint_serves_stored_entries_with_range() {
        let bed = testbed(false);
        bed.directory
            .find_or_create(
                "jdoe",
                Some(&Credential {
                    username: "jdoe".into(),
                    password: "hunter2".into(),
                }),
            )
            .await
            .unwrap();
        bed.store
            .upsert(
                "jdoe",
                &[stored_entry("23/03/2026"), stored_entry("14/07/2026")],
            )
            .await
            .unwrap();
        let app = app(bed.state);

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/roster/jdoe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 2);
        assert_eq!(body["historical_from"], "2026-03-23");

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/roster/jdoe?from=2026-07-01&to=2026-07-31")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn roster_unknown_person_is_404() {
        let bed = testbed(false);
        let app = app(bed.state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/roster/nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_endpoint_checks_the_shared_secret() {
        let bed = testbed(false);
        bed.directory
            .find_or_create(
                "jdoe",
                Some(&Credential {
                    username: "jdoe".into(),
                    password: "hunter2".into(),
                }),
            )
            .await
            .unwrap();
        let app = app(bed.state);

        let denied = app
            .clone()
            .oneshot(post_json("/batch?secret=wrong", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(post_json("/batch?secret=s3cret", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        let body = json_body(allowed).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["synced"], 1);
    }
}
