//! JSON HTTP surface over the settlement orchestrator.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cleanbook_core::{Attachment, PaymentStage, ServiceStatus, SettlementError};
use cleanbook_settlement::{
    OrchestratorError, ServicePaymentView, SettlementConfig, SettlementOrchestrator,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cleanbook-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SettlementOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: SettlementOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuoteBody {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordBody {
    current_password: String,
    new_password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmationBody {
    service_id: Uuid,
    stage: PaymentStage,
    payment_status: cleanbook_core::PaymentStatus,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/clients/{id}/payments", get(client_payments_handler))
        .route("/services/{id}/payments", get(service_payments_handler))
        .route("/services/{id}/proofs/{stage}", post(submit_proof_handler))
        .route(
            "/services/{id}/payments/{stage}/confirm",
            post(confirm_payment_handler),
        )
        .route("/services/{id}/quote", post(approve_quote_handler))
        .route("/services/{id}/status", post(record_status_handler))
        .route("/collaborators/{id}/payouts", get(payouts_handler))
        .route("/collaborators/{id}/statement", get(statement_handler))
        .route("/collaborators/{id}/password", post(password_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SettlementConfig) -> anyhow::Result<()> {
    let orchestrator = cleanbook_settlement::orchestrator_from_config(config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(AppState::new(orchestrator))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&SettlementConfig::from_env()).await
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn client_payments_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(client_id): AxumPath<Uuid>,
) -> Response {
    match state.orchestrator.client_payment_view(client_id).await {
        Ok(views) => Json(views).into_response(),
        Err(err) => error_response(err),
    }
}

async fn service_payments_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(service_id): AxumPath<Uuid>,
) -> Response {
    match state.orchestrator.payment_view(service_id).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => error_response(err),
    }
}

async fn submit_proof_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((service_id, stage)): AxumPath<(Uuid, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let stage = match stage.parse::<PaymentStage>() {
        Ok(stage) => stage,
        Err(err) => return error_response(err.into()),
    };
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let attachment = Attachment::new(media_type, body.to_vec());
    match state
        .orchestrator
        .submit_proof(service_id, stage, Some(attachment))
        .await
    {
        Ok(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn confirm_payment_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((service_id, stage)): AxumPath<(Uuid, String)>,
) -> Response {
    let stage = match stage.parse::<PaymentStage>() {
        Ok(stage) => stage,
        Err(err) => return error_response(err.into()),
    };
    match state.orchestrator.confirm_payment(service_id, stage).await {
        Ok(payment_status) => Json(ConfirmationBody {
            service_id,
            stage,
            payment_status,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn approve_quote_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(service_id): AxumPath<Uuid>,
    Json(body): Json<QuoteBody>,
) -> Response {
    match state.orchestrator.approve_quote(service_id, body.price).await {
        Ok(service) => Json(ServicePaymentView::from_service(&service)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn record_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(service_id): AxumPath<Uuid>,
    Json(body): Json<StatusBody>,
) -> Response {
    let status = match body.status.parse::<ServiceStatus>() {
        Ok(status) => status,
        Err(err) => return error_response(err.into()),
    };
    match state.orchestrator.record_status(service_id, status).await {
        Ok(service) => Json(ServicePaymentView::from_service(&service)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn payouts_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(collaborator_id): AxumPath<Uuid>,
) -> Response {
    match state.orchestrator.collaborator_history(collaborator_id).await {
        Ok(history) => Json(history).into_response(),
        Err(err) => error_response(err),
    }
}

async fn statement_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(collaborator_id): AxumPath<Uuid>,
) -> Response {
    match state
        .orchestrator
        .payout_statement_markdown(collaborator_id)
        .await
    {
        Ok(markdown) => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            markdown,
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

async fn password_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(collaborator_id): AxumPath<Uuid>,
    Json(body): Json<PasswordBody>,
) -> Response {
    match state
        .orchestrator
        .change_collaborator_password(collaborator_id, &body.current_password, &body.new_password)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

fn status_for(err: &OrchestratorError) -> StatusCode {
    if err.is_not_found() {
        return StatusCode::NOT_FOUND;
    }
    match err {
        OrchestratorError::Settlement(inner) => match inner {
            SettlementError::MissingAttachment { .. }
            | SettlementError::NegativePrice
            | SettlementError::Unrecognized { .. } => StatusCode::BAD_REQUEST,
            SettlementError::ActionBlocked { .. }
            | SettlementError::ProofRequired { .. }
            | SettlementError::PaymentRegression { .. }
            | SettlementError::InvalidTransition { .. }
            | SettlementError::PriceLocked { .. } => StatusCode::CONFLICT,
        },
        OrchestratorError::WeakPassword => StatusCode::BAD_REQUEST,
        OrchestratorError::CredentialMismatch => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: OrchestratorError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use cleanbook_core::{Collaborator, PaymentStatus, RateRow, RateTable, Service};
    use cleanbook_storage::MemoryStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Seeded {
        app: Router,
        client_id: Uuid,
        collaborator_id: Uuid,
        completed: Uuid,
        scheduled: Uuid,
    }

    fn seeded() -> Seeded {
        let client_id = Uuid::new_v4();
        let collaborator_id = Uuid::new_v4();

        let mut completed = Service::new(client_id);
        completed.collaborator_id = Some(collaborator_id);
        completed.status = ServiceStatus::Completed;
        completed.payment_status = PaymentStatus::SignalPaid;
        completed.price = Some(Decimal::from(120));
        completed.duration = Some("4h".into());

        let mut scheduled = Service::new(client_id);
        scheduled.collaborator_id = Some(collaborator_id);
        scheduled.status = ServiceStatus::Scheduled;
        scheduled.price = Some(Decimal::from(90));

        let row = RateRow {
            hours4: Decimal::from(80),
            hours6: Decimal::from(110),
            hours8: Decimal::from(140),
        };
        let ids = (completed.id, scheduled.id);
        let store = MemoryStore::new()
            .with_collaborator(Collaborator {
                id: collaborator_id,
                name: "Joana".into(),
                email: "joana@example.com".into(),
                phone: None,
                password_hash: String::new(),
                photo: None,
                level: None,
            })
            .with_service(completed)
            .with_service(scheduled)
            .with_service(Service::new(client_id))
            .with_rates(RateTable {
                junior: row,
                senior: row,
                master: row,
            });
        let orchestrator = SettlementOrchestrator::new(Arc::new(store));
        Seeded {
            app: app(AppState::new(orchestrator)),
            client_id,
            collaborator_id,
            completed: ids.0,
            scheduled: ids.1,
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_req(uri: String) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: String, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let s = seeded();
        let resp = s.app.oneshot(get_req("/health".into())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
    }

    #[tokio::test]
    async fn client_payments_list_eligible_services_only() {
        let s = seeded();
        let resp = s
            .app
            .oneshot(get_req(format!("/clients/{}/payments", s.client_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        let completed = rows
            .iter()
            .find(|r| r["serviceId"] == s.completed.to_string())
            .unwrap();
        assert_eq!(completed["final"]["action"]["action"], "COLLECT_PROOF");
        assert_eq!(completed["final"]["displayAmount"], "60.00");
    }

    #[tokio::test]
    async fn proof_upload_then_confirmation() {
        let s = seeded();
        let upload = Request::builder()
            .method("POST")
            .uri(format!("/services/{}/proofs/final", s.completed))
            .header(header::CONTENT_TYPE, "image/jpeg")
            .body(Body::from(vec![0xff_u8, 0xd8, 0xff]))
            .unwrap();
        let resp = s.app.clone().oneshot(upload).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let receipt = body_json(resp).await;
        assert_eq!(receipt["progress"], "AWAITING_VERIFICATION");
        assert_eq!(receipt["contentHash"].as_str().unwrap().len(), 64);

        let resp = s
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/services/{}/payments/FINAL/confirm", s.completed))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["paymentStatus"], "FULL_PAID");
    }

    #[tokio::test]
    async fn empty_proof_is_bad_request() {
        let s = seeded();
        let resp = s
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/services/{}/proofs/signal", s.scheduled))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn final_proof_before_completion_conflicts() {
        let s = seeded();
        let resp = s
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/services/{}/proofs/final", s.scheduled))
                    .body(Body::from("receipt"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_stage_and_service_are_rejected() {
        let s = seeded();
        let resp = s
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/services/{}/proofs/deposit", s.completed))
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = s
            .app
            .oneshot(get_req(format!("/services/{}/payments", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_and_quote_updates() {
        let s = seeded();
        let resp = s
            .app
            .clone()
            .oneshot(post_json(
                format!("/services/{}/status", s.scheduled),
                json!({ "status": "in-progress" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "IN_PROGRESS");

        let resp = s
            .app
            .clone()
            .oneshot(post_json(
                format!("/services/{}/quote", s.scheduled),
                json!({ "price": "95.00" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = s
            .app
            .oneshot(post_json(
                format!("/services/{}/status", s.completed),
                json!({ "status": "PENDING" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn payouts_and_statement() {
        let s = seeded();
        let resp = s
            .app
            .clone()
            .oneshot(get_req(format!("/collaborators/{}/payouts", s.collaborator_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let history = body_json(resp).await;
        assert_eq!(history["level"], "JUNIOR");
        assert_eq!(history["displayTotal"], "80.00");

        let resp = s
            .app
            .oneshot(get_req(format!("/collaborators/{}/statement", s.collaborator_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/markdown"));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# Payout Statement"));
    }

    #[tokio::test]
    async fn password_change_without_stored_hash_is_forbidden() {
        let s = seeded();
        let resp = s
            .app
            .oneshot(post_json(
                format!("/collaborators/{}/password", s.collaborator_id),
                json!({ "currentPassword": "anything", "newPassword": "long-enough" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
