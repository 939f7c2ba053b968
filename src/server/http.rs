//! HTTP server.
//!
//! The chat endpoint streams orchestrator progress as Server-Sent Events:
//! `status` frames while work is in flight, cumulative `content` frames,
//! and exactly one `done` or `error` frame terminating the turn. The
//! transactions and summary endpoints are thin owner-scoped wrappers used
//! by the tracker UI.

use anyhow::Result;
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::agent::{
    AgentEvent, DEFAULT_THREAD_ID, LlmClient, OpenAiCompatClient, Orchestrator, ToolCache,
    TurnMemory, TurnRequest,
};
use crate::config::Config;
use crate::store::{SqliteStore, TransactionFilter, TransactionStore};
use crate::summary::generate_financial_summary;

pub struct Server {
    config: Config,
}

struct AppState {
    config: Config,
    orchestrator: Orchestrator,
    store: Arc<dyn TransactionStore>,
    chat_client: Arc<dyn LlmClient>,
}

impl Server {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let store: Arc<dyn TransactionStore> =
            Arc::new(SqliteStore::open(&self.config.database_path()?)?);

        let chat_client: Arc<dyn LlmClient> = Arc::new(OpenAiCompatClient::new(
            &self.config.provider.api_key,
            &self.config.provider.base_url,
            &self.config.agent.chat_model,
            self.config.agent.temperature,
            self.config.agent.max_tokens,
        ));
        let vision_client: Arc<dyn LlmClient> = Arc::new(OpenAiCompatClient::new(
            &self.config.provider.api_key,
            &self.config.provider.base_url,
            &self.config.agent.vision_model,
            self.config.agent.temperature,
            self.config.agent.max_tokens,
        ));

        let orchestrator = Orchestrator::new(
            chat_client.clone(),
            vision_client,
            Arc::new(ToolCache::new(store.clone())),
            Arc::new(TurnMemory::new()),
        );

        let state = Arc::new(AppState {
            config: self.config.clone(),
            orchestrator,
            store,
            chat_client,
        });

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/api/chat", post(chat))
            .route("/api/transactions", get(list_transactions))
            .route("/api/summary", get(summary))
            .layer(cors)
            .with_state(state);

        let addr: SocketAddr =
            format!("{}:{}", self.config.server.bind, self.config.server.port).parse()?;

        info!("Starting HTTP server on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Deserialize)]
struct ChatRequest {
    message: Option<String>,
    image: Option<String>,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
}

/// JSON payload of one SSE frame, in the shape the UI consumes.
fn frame_payload(event: &AgentEvent) -> String {
    let (kind, content) = match event {
        AgentEvent::Status(text) => ("status", text),
        AgentEvent::Content(text) => ("content", text),
        AgentEvent::Done(text) => ("done", text),
        AgentEvent::Error(text) => ("error", text),
    };
    json!({ "type": kind, "content": content }).to_string()
}

fn sse_frame(event: &AgentEvent) -> Event {
    Event::default().data(frame_payload(event))
}

async fn chat(State(state): State<Arc<AppState>>, Json(request): Json<ChatRequest>) -> Response {
    let Some(message) = request.message.filter(|m| !m.is_empty()) else {
        return AppError(
            StatusCode::BAD_REQUEST,
            "Message is required and must be a string".to_string(),
        )
        .into_response();
    };

    let turn = TurnRequest {
        message,
        image: request.image,
        user_id: state.config.agent.default_user_id.clone(),
        thread_id: request
            .thread_id
            .unwrap_or_else(|| DEFAULT_THREAD_ID.to_string()),
    };

    info!(
        "Chat turn on thread {} (image: {})",
        turn.thread_id,
        turn.image.is_some()
    );

    let events = state.orchestrator.run(turn);
    let stream = events.map(|event| Ok::<Event, Infallible>(sse_frame(&event)));

    Sse::new(stream).into_response()
}

#[derive(Deserialize)]
struct TransactionsQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "startDate")]
    start_date: Option<String>,
    #[serde(rename = "endDate")]
    end_date: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TransactionsQuery>,
) -> Response {
    let Some(user_id) = query.user_id.filter(|u| !u.is_empty()) else {
        return AppError(
            StatusCode::BAD_REQUEST,
            "userId parameter is required".to_string(),
        )
        .into_response();
    };

    let mut filter = TransactionFilter::default();

    // Unknown type values fall through to "all", matching the UI contract
    if let Some(kind) = query.kind.as_deref().and_then(crate::store::TransactionKind::parse) {
        filter.kind = Some(kind);
    }
    for (raw, slot) in [
        (&query.start_date, &mut filter.start_date),
        (&query.end_date, &mut filter.end_date),
    ] {
        if let Some(raw) = raw {
            match chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
                Ok(date) => *slot = Some(date),
                Err(_) => {
                    return AppError(
                        StatusCode::BAD_REQUEST,
                        "Dates must use YYYY-MM-DD".to_string(),
                    )
                    .into_response();
                }
            }
        }
    }

    match state.store.find(&user_id, &filter).await {
        Ok(transactions) => {
            let rows: Vec<serde_json::Value> = transactions
                .iter()
                .map(|t| {
                    json!({
                        "_id": t.id,
                        "userId": t.owner_id,
                        "type": t.kind.as_str(),
                        "category": t.category,
                        "amount": t.amount,
                        "date": t.date.format("%Y-%m-%d").to_string(),
                        "description": t.description,
                        "sourceOrPaymentMethod": t.source_or_payment_method,
                        "createdAt": t.created_at.to_rfc3339(),
                        "updatedAt": t.updated_at.to_rfc3339(),
                    })
                })
                .collect();

            Json(json!({ "transactions": rows, "count": rows.len() })).into_response()
        }
        Err(e) => AppError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct SummaryQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

async fn summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> Response {
    let user_id = query
        .user_id
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| state.config.agent.default_user_id.clone());

    match generate_financial_summary(&state.chat_client, &state.store, &user_id).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => AppError(
            StatusCode::NOT_FOUND,
            "No transactions found for this user".to_string(),
        )
        .into_response(),
        Err(e) => AppError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
