//! HTTP surface: authenticated JSON endpoints for ingestion, analytics and chat.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use funil_ai::{generate_report, run_chat, AiError, LanguageModel};
use funil_analytics::{aggregate, build_profile, AnalyticsProfile};
use funil_core::IngestReport;
use funil_ingest::{AliasTable, IngestError, IngestPipeline};
use funil_store::{RowStore, StoreError, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "funil-web";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown or revoked token")]
    UnknownToken,
}

/// Maps a bearer token to the owning account.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, bearer_token: &str) -> Result<Uuid, AuthError>;
}

/// Fixed token-to-owner mapping seeded from the environment.
#[derive(Debug, Default)]
pub struct StaticTokenIdentity {
    owners: HashMap<String, Uuid>,
}

impl StaticTokenIdentity {
    pub fn new(owners: HashMap<String, Uuid>) -> Self {
        Self { owners }
    }

    pub fn single(token: impl Into<String>, owner: Uuid) -> Self {
        Self {
            owners: HashMap::from([(token.into(), owner)]),
        }
    }

    /// Parses `FUNIL_API_TOKENS`, a comma-separated list of `token:owner-uuid`.
    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var("FUNIL_API_TOKENS").unwrap_or_default();
        let mut owners = HashMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (token, owner) = pair
                .split_once(':')
                .ok_or_else(|| anyhow!("expected token:uuid in FUNIL_API_TOKENS, got {pair:?}"))?;
            let owner = Uuid::parse_str(owner.trim())
                .with_context(|| format!("parsing owner uuid in FUNIL_API_TOKENS entry {pair:?}"))?;
            owners.insert(token.trim().to_string(), owner);
        }
        Ok(Self { owners })
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenIdentity {
    async fn authenticate(&self, bearer_token: &str) -> Result<Uuid, AuthError> {
        self.owners
            .get(bearer_token)
            .copied()
            .ok_or(AuthError::UnknownToken)
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Input(String),
    NoData,
    Store(String),
    Ai(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "auth", m),
            Self::Input(m) => (StatusCode::BAD_REQUEST, "input", m),
            Self::NoData => (
                StatusCode::NOT_FOUND,
                "no_data",
                "no opportunities ingested for this account".to_string(),
            ),
            Self::Store(m) => (StatusCode::BAD_GATEWAY, "store", m),
            Self::Ai(m) => (StatusCode::BAD_GATEWAY, "ai_provider", m),
        };
        let body = Json(json!({ "error": { "kind": kind, "message": message } }));
        (status, body).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Input(m) => Self::Input(m),
            IngestError::Store(e) => Self::Store(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<AiError> for ApiError {
    fn from(err: AiError) -> Self {
        Self::Ai(err.to_string())
    }
}

pub struct AppState {
    pub store: Arc<dyn RowStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub llm: Arc<dyn LanguageModel>,
    pub pipeline: IngestPipeline,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RowStore>,
        identity: Arc<dyn IdentityProvider>,
        llm: Arc<dyn LanguageModel>,
        aliases: AliasTable,
    ) -> Self {
        Self {
            store,
            identity,
            llm,
            pipeline: IngestPipeline::new(aliases),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub report: IngestReport,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub profile: AnalyticsProfile,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub report: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/opportunities/import", post(import_handler))
        .route("/api/opportunities/profile", get(profile_handler))
        .route("/api/opportunities/report", get(report_handler))
        .route("/api/chat", post(chat_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("FUNIL_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding api listener on {addr}"))?;
    info!(%addr, "api listening");
    axum::serve(listener, app(state))
        .await
        .context("serving api")?;
    Ok(())
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    state
        .identity
        .authenticate(token)
        .await
        .map_err(|err| ApiError::Unauthorized(err.to_string()))
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ImportResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;
    let outcome = state
        .pipeline
        .run(state.store.as_ref(), owner_id, &body)
        .await?;
    Ok(Json(ImportResponse {
        report: outcome.report,
    }))
}

async fn load_profile(state: &AppState, owner_id: Uuid) -> Result<AnalyticsProfile, ApiError> {
    let dataset = state.store.fetch_all(owner_id, DEFAULT_PAGE_SIZE).await?;
    let analytics = aggregate(&dataset).ok_or(ApiError::NoData)?;
    Ok(build_profile(analytics))
}

async fn profile_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ProfileResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;
    let profile = load_profile(&state, owner_id).await?;
    Ok(Json(ProfileResponse { profile }))
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ReportResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;
    let profile = load_profile(&state, owner_id).await?;
    let report = generate_report(state.llm.as_ref(), &profile).await?;
    Ok(Json(ReportResponse { report }))
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;
    let message = request.message.trim();
    if message.is_empty() {
        return Err(ApiError::Input("message must not be empty".to_string()));
    }
    let dataset = state.store.fetch_all(owner_id, DEFAULT_PAGE_SIZE).await?;
    if dataset.is_empty() {
        return Err(ApiError::NoData);
    }
    let reply = run_chat(
        state.llm.as_ref(),
        &dataset,
        Utc::now().date_naive(),
        message,
    )
    .await?;
    Ok(Json(ChatResponse { reply }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use funil_ai::{AiError, ChatMessage, ChatTurn, ToolCallRequest, ToolSpec};
    use funil_store::MemoryRowStore;
    use http_body_util::BodyExt;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tower::ServiceExt;

    const TOKEN: &str = "tk-alpha";

    const SAMPLE_CSV: &str = "\
Vendedor,Cliente,Valor,Status,Data de Criação,Produto,Estado,Origem
Ana,Acme,\"R$ 1.234,56\",Ganha,05/03/2024,Plano Pro,sp,Site
Bruno,Beta Ltda,\"R$ 800,00\",Perdida,06/03/2024,Plano Start,mg,Indicação
Carla,Gama SA,\"R$ 500,00\",Em negociação,07/03/2024,Plano Pro,rj,Evento
";

    struct ScriptedModel {
        turns: Mutex<VecDeque<ChatTurn>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<ChatTurn>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<ChatTurn, AiError> {
            self.turns
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(AiError::EmptyResponse)
        }
    }

    fn test_app(turns: Vec<ChatTurn>) -> Router {
        let owner = Uuid::new_v4();
        let state = AppState::new(
            Arc::new(MemoryRowStore::new()),
            Arc::new(StaticTokenIdentity::single(TOKEN, owner)),
            Arc::new(ScriptedModel::new(turns)),
            AliasTable::default(),
        );
        app(state)
    }

    fn import_request(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/opportunities/import")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::from(body))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let app = test_app(Vec::new());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_or_unknown_tokens_are_rejected_upfront() {
        let app = test_app(Vec::new());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/opportunities/profile")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["error"]["kind"], "auth");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/opportunities/profile")
                    .header(header::AUTHORIZATION, "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn import_then_profile_round_trips() {
        let app = test_app(Vec::new());

        let response = app.clone().oneshot(import_request(SAMPLE_CSV)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["report"]["parsed_rows"], 3);
        assert_eq!(body["report"]["accepted"], 3);
        assert_eq!(body["report"]["stored_total"], 3);

        let response = app
            .clone()
            .oneshot(get_request("/api/opportunities/profile"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["profile"]["summary"]["total"], 3);
        assert_eq!(body["profile"]["summary"]["won"], 1);
        assert_eq!(body["profile"]["sellers"][0]["key"], "Ana");

        let response = app.oneshot(import_request(SAMPLE_CSV)).await.unwrap();
        let body = json_body(response).await;
        assert_eq!(body["report"]["stored_total"], 3);
    }

    #[tokio::test]
    async fn empty_accounts_report_no_data() {
        let app = test_app(Vec::new());
        let response = app
            .oneshot(get_request("/api/opportunities/profile"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["kind"], "no_data");
    }

    #[tokio::test]
    async fn unusable_uploads_are_input_errors() {
        let app = test_app(Vec::new());
        let response = app.oneshot(import_request("")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["kind"], "input");
    }

    #[tokio::test]
    async fn chat_runs_the_tool_loop_against_stored_rows() {
        let turns = vec![
            ChatTurn {
                content: None,
                tool_calls: vec![ToolCallRequest {
                    id: "call-1".to_string(),
                    name: "dataset_query".to_string(),
                    arguments: r#"{"group_by":["seller"]}"#.to_string(),
                }],
            },
            ChatTurn {
                content: Some("Ana leads the ranking.".to_string()),
                tool_calls: Vec::new(),
            },
        ];
        let app = test_app(turns);
        app.clone().oneshot(import_request(SAMPLE_CSV)).await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"message":"who leads?"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["reply"], "Ana leads the ranking.");
    }

    #[tokio::test]
    async fn chat_without_data_short_circuits() {
        let app = test_app(Vec::new());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"message":"anything"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn report_endpoint_returns_model_text() {
        let turns = vec![ChatTurn {
            content: Some("# Executive Report".to_string()),
            tool_calls: Vec::new(),
        }];
        let app = test_app(turns);
        app.clone().oneshot(import_request(SAMPLE_CSV)).await.unwrap();

        let response = app
            .oneshot(get_request("/api/opportunities/report"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["report"], "# Executive Report");
    }
}
