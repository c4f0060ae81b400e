#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warden_adapter::{
    http_bind_from_env, AdapterErrorResponse, AdapterHealthResponse, AdapterResult,
    AdapterRuntime, AppendCommentAdapterRequest, CommentAdapterView, ConfirmReportAdapterRequest,
    CreateReportAdapterRequest, ManualReviewAdapterRequest, ReportActionAdapterResponse,
    ReportAdapterView, TransitionAdapterView, VerificationAdapterView,
    VerifyReportAdapterRequest, VerifyReportAdapterResponse,
};

type SharedRuntime = Arc<AdapterRuntime>;
type HandlerResult<T> = Result<Json<T>, (StatusCode, Json<AdapterErrorResponse>)>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(env::var("RUST_LOG").unwrap_or_else(|_| {
            "warden_adapter=info,warden_adapter_http=info,warden_os=info".to_string()
        })))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr: SocketAddr = http_bind_from_env().parse()?;
    let runtime: SharedRuntime = Arc::new(AdapterRuntime::default_from_env()?);
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/reports", post(create_report))
        .route("/v1/reports/:id", get(get_report))
        .route("/v1/reports/:id/verify", post(verify_report))
        .route("/v1/reports/:id/confirm", post(confirm_report))
        .route("/v1/reports/:id/manual-review", post(open_manual_review))
        .route("/v1/reports/:id/reconcile", post(reconcile_report))
        .route(
            "/v1/reports/:id/comments",
            get(list_comments).post(append_comment),
        )
        .route("/v1/reports/:id/verifications", get(list_verifications))
        .route("/v1/reports/:id/transitions", get(list_transitions))
        .with_state(runtime);

    info!(%addr, "warden_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn respond<T>(result: AdapterResult<T>) -> HandlerResult<T> {
    result.map(Json).map_err(|err| {
        let status =
            StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(
                status = status.as_u16(),
                outcome = %err.outcome,
                reason = %err.reason,
                "request failed"
            );
        }
        (status, Json(err))
    })
}

async fn healthz(State(runtime): State<SharedRuntime>) -> Json<AdapterHealthResponse> {
    Json(runtime.health())
}

async fn create_report(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<CreateReportAdapterRequest>,
) -> HandlerResult<ReportAdapterView> {
    respond(runtime.create_report(request))
}

async fn get_report(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
) -> HandlerResult<ReportAdapterView> {
    respond(runtime.get_report(&id))
}

async fn verify_report(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
    Json(request): Json<VerifyReportAdapterRequest>,
) -> HandlerResult<VerifyReportAdapterResponse> {
    respond(runtime.run_verification_async(id, request).await)
}

async fn confirm_report(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
    Json(request): Json<ConfirmReportAdapterRequest>,
) -> HandlerResult<ReportActionAdapterResponse> {
    respond(runtime.confirm(&id, request))
}

async fn open_manual_review(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
    Json(request): Json<ManualReviewAdapterRequest>,
) -> HandlerResult<ReportActionAdapterResponse> {
    respond(runtime.open_manual_review(&id, request))
}

async fn reconcile_report(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
) -> HandlerResult<ReportActionAdapterResponse> {
    respond(runtime.reconcile(&id))
}

async fn list_comments(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
) -> HandlerResult<Vec<CommentAdapterView>> {
    respond(runtime.list_comments(&id))
}

async fn append_comment(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
    Json(request): Json<AppendCommentAdapterRequest>,
) -> HandlerResult<CommentAdapterView> {
    respond(runtime.append_comment(&id, request))
}

async fn list_verifications(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
) -> HandlerResult<Vec<VerificationAdapterView>> {
    respond(runtime.list_verifications(&id))
}

async fn list_transitions(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
) -> HandlerResult<Vec<TransitionAdapterView>> {
    respond(runtime.list_transitions(&id))
}
