use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::gateway::BudgetSnapshot;
use crate::models::{QueryAnswer, QueryRequest, StoredChunk};
use crate::pipeline::NarrativeService;

#[derive(Clone)]
struct AppState {
    service: NarrativeService,
}

pub async fn run_server(config: AppConfig, service: NarrativeService) -> Result<()> {
    let app = router(service);

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(service: NarrativeService) -> Router {
    Router::new()
        .route("/api/query", post(query_handler))
        .route("/api/chunks/:chunk_id", get(get_chunk))
        .route("/api/budget", get(get_budget))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryAnswer>, ApiError> {
    let answer = state
        .service
        .answer_query(&request.question, request.options)
        .await?;
    Ok(Json(answer))
}

async fn get_chunk(
    State(state): State<AppState>,
    Path(chunk_id): Path<String>,
) -> Result<Json<StoredChunk>, ApiError> {
    let chunk = state.service.store().get_chunk(&chunk_id).await?;
    match chunk {
        Some(chunk) => Ok(Json(chunk)),
        None => Err(ApiError::not_found(format!("chunk not found: {}", chunk_id))),
    }
}

async fn get_budget(State(state): State<AppState>) -> Json<BudgetSnapshot> {
    Json(state.service.gateway().budget().snapshot().await)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(value: PipelineError) -> Self {
        let status = match &value {
            PipelineError::RateLimitedDaily => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            PipelineError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::RetrievalEmpty | PipelineError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %value, "query failed");
        }
        Self {
            status,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
