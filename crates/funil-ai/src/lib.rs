//! Language-model boundary: chat with tool calls over the opportunity dataset.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use funil_analytics::{run_query, AnalyticsProfile, GroupDimension, QueryRequest};
use funil_core::Opportunity;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "funil-ai";

pub const DATASET_QUERY_TOOL: &str = "dataset_query";

/// Tool rounds allowed before a conversation is abandoned.
pub const MAX_TOOL_ROUNDS: usize = 4;

const PROVIDER: &str = "openai";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TEMPERATURE: f64 = 0.2;
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("{provider} api key is not configured")]
    MissingApiKey { provider: &'static str },
    #[error("request to {provider} failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned {status}: {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },
    #[error("unusable model response: {0}")]
    Parse(String),
    #[error("model returned an empty response")]
    EmptyResponse,
    #[error("no final answer after {limit} tool rounds")]
    ToolRounds { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model. `arguments` is the raw JSON text
/// exactly as the model produced it; parsing is deferred to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A callable tool advertised to the model, with a JSON schema for arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One model reply: free text, tool invocations, or both.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec])
        -> Result<ChatTurn, AiError>;

    /// One-shot completion without tools.
    async fn generate(&self, system: &str, user: &str) -> Result<String, AiError> {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let turn = self.chat(&messages, &[]).await?;
        turn.content
            .filter(|c| !c.trim().is_empty())
            .ok_or(AiError::EmptyResponse)
    }
}

/// OpenAI chat-completions driver. The key is resolved lazily so keyless
/// deployments can still run ingestion and analytics.
pub struct OpenAiChatDriver {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

impl fmt::Debug for OpenAiChatDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiChatDriver")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl OpenAiChatDriver {
    pub fn new(api_key: Option<String>, model: String, base_url: String) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|source| AiError::Http {
                provider: PROVIDER,
                source,
            })?;
        Ok(Self {
            client,
            api_key,
            model,
            base_url,
        })
    }

    pub fn from_env() -> Result<Self, AiError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());
        let model =
            std::env::var("FUNIL_AI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let base_url =
            std::env::var("FUNIL_AI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(api_key, model, base_url)
    }

    fn key(&self) -> Result<&str, AiError> {
        self.api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(AiError::MissingApiKey { provider: PROVIDER })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post_chat(&self, payload: &Value) -> Result<Value, AiError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.key()?)
            .json(payload)
            .send()
            .await
            .map_err(|source| AiError::Http {
                provider: PROVIDER,
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Api {
                provider: PROVIDER,
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| AiError::Parse(err.to_string()))
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut obj = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments },
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        obj["tool_call_id"] = json!(id);
    }
    obj
}

fn wire_tool(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

fn parse_turn(body: &Value) -> Result<ChatTurn, AiError> {
    let message = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| AiError::Parse("response carried no choices".to_string()))?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|c| !c.is_empty());
    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| AiError::Parse("tool call missing id".to_string()))?
                .to_string();
            let name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .ok_or_else(|| AiError::Parse("tool call missing function name".to_string()))?
                .to_string();
            let arguments = match call.get("function").and_then(|f| f.get("arguments")) {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => "{}".to_string(),
            };
            tool_calls.push(ToolCallRequest {
                id,
                name,
                arguments,
            });
        }
    }
    Ok(ChatTurn {
        content,
        tool_calls,
    })
}

#[async_trait]
impl LanguageModel for OpenAiChatDriver {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatTurn, AiError> {
        let mut payload = json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "temperature": DEFAULT_TEMPERATURE,
            "stream": false,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.iter().map(wire_tool).collect());
        }
        let body = self.post_chat(&payload).await?;
        parse_turn(&body)
    }
}

/// Schema advertised to the model for querying the dataset.
pub fn dataset_query_tool() -> ToolSpec {
    ToolSpec {
        name: DATASET_QUERY_TOOL.to_string(),
        description: "Filter and group the account's CRM opportunity dataset. \
            Returns per-group counts, revenue and win/loss splits."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "filters": {
                    "type": "object",
                    "properties": {
                        "seller": { "type": "string", "description": "case-insensitive substring" },
                        "lead_source": { "type": "string", "description": "case-insensitive substring" },
                        "funnel": { "type": "string", "description": "case-insensitive substring" },
                        "region": { "type": "string", "description": "two-letter state code substring" },
                        "product": { "type": "string", "description": "case-insensitive substring" },
                        "status": { "type": "string", "enum": ["won", "lost", "open"] },
                        "year": { "type": "integer" },
                        "month": { "type": "integer", "minimum": 1, "maximum": 12 }
                    },
                    "additionalProperties": false
                },
                "group_by": {
                    "type": "array",
                    "items": { "type": "string", "enum": GroupDimension::NAMES },
                    "minItems": 1
                }
            },
            "required": ["group_by"],
            "additionalProperties": false
        }),
    }
}

/// A validated tool invocation.
pub enum ToolInvocation {
    DatasetQuery(QueryRequest),
}

impl ToolInvocation {
    /// Never panics on model output: unknown names and malformed JSON come
    /// back as an error message the model can react to.
    pub fn parse(name: &str, arguments: &str) -> Result<Self, String> {
        match name {
            DATASET_QUERY_TOOL => serde_json::from_str::<QueryRequest>(arguments)
                .map(Self::DatasetQuery)
                .map_err(|err| format!("invalid {DATASET_QUERY_TOOL} arguments: {err}")),
            other => Err(format!("unknown tool {other:?}")),
        }
    }
}

/// Runs one tool call against the dataset, always yielding a JSON payload.
pub fn execute_tool_call(
    call: &ToolCallRequest,
    dataset: &[Opportunity],
    reference: NaiveDate,
) -> String {
    let error_payload = |message: String| json!({ "error": message }).to_string();
    match ToolInvocation::parse(&call.name, &call.arguments) {
        Ok(ToolInvocation::DatasetQuery(request)) => {
            match run_query(dataset, &request, reference) {
                Ok(result) => serde_json::to_string(&result)
                    .unwrap_or_else(|err| error_payload(err.to_string())),
                Err(err) => {
                    warn!(%err, "dataset query rejected");
                    error_payload(err.to_string())
                }
            }
        }
        Err(message) => {
            warn!(%message, "unusable tool call");
            error_payload(message)
        }
    }
}

const CHAT_SYSTEM_PROMPT: &str = "You are a sales analyst for a CRM opportunity dataset. \
Answer quantitative questions by calling the dataset_query tool; never guess numbers. \
Text filters match case-insensitively by substring; status must be won, lost or open. \
Amounts are in BRL. When a result is truncated, say that more groups exist. \
Reply in the language the user wrote in.";

const REPORT_SYSTEM_PROMPT: &str = "You are a sales analyst. Given the JSON profile of a \
CRM opportunity dataset, write a short executive report in markdown covering overall \
performance, strongest funnels, sellers and lead sources, the monthly trend, geography \
and products. Quote conversion rates and won revenue from the profile; do not invent \
numbers.";

/// Drives the tool-call conversation until the model answers in plain text.
/// Every tool invocation is answered before the next round, including broken
/// ones, which receive an error payload instead of aborting the conversation.
pub async fn run_chat(
    llm: &dyn LanguageModel,
    dataset: &[Opportunity],
    reference: NaiveDate,
    question: &str,
) -> Result<String, AiError> {
    let tools = [dataset_query_tool()];
    let mut messages = vec![
        ChatMessage::system(CHAT_SYSTEM_PROMPT),
        ChatMessage::user(question),
    ];
    for _ in 0..MAX_TOOL_ROUNDS {
        let turn = llm.chat(&messages, &tools).await?;
        if turn.tool_calls.is_empty() {
            return turn
                .content
                .filter(|c| !c.trim().is_empty())
                .ok_or(AiError::EmptyResponse);
        }
        debug!(calls = turn.tool_calls.len(), "model requested dataset queries");
        messages.push(ChatMessage::assistant(
            turn.content.clone(),
            turn.tool_calls.clone(),
        ));
        for call in &turn.tool_calls {
            let payload = execute_tool_call(call, dataset, reference);
            messages.push(ChatMessage::tool(&call.id, payload));
        }
    }
    Err(AiError::ToolRounds {
        limit: MAX_TOOL_ROUNDS,
    })
}

/// Renders the analytics profile into an executive report via the model.
pub async fn generate_report(
    llm: &dyn LanguageModel,
    profile: &AnalyticsProfile,
) -> Result<String, AiError> {
    let payload =
        serde_json::to_string_pretty(profile).map_err(|err| AiError::Parse(err.to_string()))?;
    let user = format!("Dataset profile:\n```json\n{payload}\n```");
    llm.generate(REPORT_SYSTEM_PROMPT, &user).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use funil_analytics::{aggregate, build_profile};
    use funil_core::OpportunityStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn opp(seller: &str, status: OpportunityStatus, amount: f64) -> Opportunity {
        Opportunity {
            owner_id: Uuid::nil(),
            fingerprint: format!("{seller}-{amount}"),
            seller: seller.to_string(),
            funnel: "Inbound".to_string(),
            stage: "General".to_string(),
            status,
            amount,
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap(),
            closed_at: None,
            lead_source: "Site".to_string(),
            customer_name: "Acme".to_string(),
            region_code: "SP".to_string(),
            city: "Campinas".to_string(),
            product: "Plano Pro".to_string(),
            loss_reason: "Not informed".to_string(),
        }
    }

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    struct ScriptedModel {
        turns: Mutex<VecDeque<ChatTurn>>,
        conversations: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<ChatTurn>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
                conversations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<ChatTurn, AiError> {
            self.conversations.lock().unwrap().push(messages.to_vec());
            self.turns
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(AiError::EmptyResponse)
        }
    }

    fn tool_call(arguments: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: "call-1".to_string(),
            name: DATASET_QUERY_TOOL.to_string(),
            arguments: arguments.to_string(),
        }
    }

    fn answer(text: &str) -> ChatTurn {
        ChatTurn {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
        }
    }

    #[tokio::test]
    async fn chat_loop_feeds_tool_results_back() {
        let model = ScriptedModel::new(vec![
            ChatTurn {
                content: None,
                tool_calls: vec![tool_call(r#"{"group_by":["seller"]}"#)],
            },
            answer("Bruno leads with R$ 300,00."),
        ]);
        let dataset = vec![
            opp("Ana", OpportunityStatus::Won, 100.0),
            opp("Bruno", OpportunityStatus::Won, 300.0),
        ];
        let reply = run_chat(&model, &dataset, reference(), "Who sells the most?")
            .await
            .unwrap();
        assert_eq!(reply, "Bruno leads with R$ 300,00.");

        let conversations = model.conversations.lock().unwrap();
        assert_eq!(conversations.len(), 2);
        let second = &conversations[1];
        let tool_msg = second
            .iter()
            .find(|m| m.role == ChatRole::Tool)
            .expect("tool result message");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call-1"));
        assert!(tool_msg.content.as_deref().unwrap().contains("\"rows\""));
        assert!(tool_msg.content.as_deref().unwrap().contains("Bruno"));
    }

    #[tokio::test]
    async fn malformed_tool_arguments_become_error_payloads() {
        let model = ScriptedModel::new(vec![
            ChatTurn {
                content: None,
                tool_calls: vec![tool_call("{not json")],
            },
            answer("Could not run that query."),
        ]);
        let dataset = vec![opp("Ana", OpportunityStatus::Won, 100.0)];
        let reply = run_chat(&model, &dataset, reference(), "group by nothing")
            .await
            .unwrap();
        assert_eq!(reply, "Could not run that query.");

        let conversations = model.conversations.lock().unwrap();
        let tool_msg = conversations[1]
            .iter()
            .find(|m| m.role == ChatRole::Tool)
            .expect("tool result message");
        assert!(tool_msg.content.as_deref().unwrap().contains("error"));
    }

    #[tokio::test]
    async fn unknown_tools_are_refused_not_panicked() {
        let mut call = tool_call("{}");
        call.name = "drop_table".to_string();
        let model = ScriptedModel::new(vec![
            ChatTurn {
                content: None,
                tool_calls: vec![call],
            },
            answer("ok"),
        ]);
        let dataset = vec![opp("Ana", OpportunityStatus::Won, 100.0)];
        run_chat(&model, &dataset, reference(), "anything").await.unwrap();

        let conversations = model.conversations.lock().unwrap();
        let tool_msg = conversations[1]
            .iter()
            .find(|m| m.role == ChatRole::Tool)
            .expect("tool result message");
        assert!(tool_msg.content.as_deref().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn endless_tool_requests_hit_the_round_limit() {
        let looping: Vec<ChatTurn> = (0..MAX_TOOL_ROUNDS + 1)
            .map(|_| ChatTurn {
                content: None,
                tool_calls: vec![tool_call(r#"{"group_by":["seller"]}"#)],
            })
            .collect();
        let model = ScriptedModel::new(looping);
        let dataset = vec![opp("Ana", OpportunityStatus::Won, 100.0)];
        let err = run_chat(&model, &dataset, reference(), "loop forever")
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::ToolRounds { .. }));
    }

    #[tokio::test]
    async fn empty_final_replies_are_errors() {
        let model = ScriptedModel::new(vec![ChatTurn {
            content: Some("   ".to_string()),
            tool_calls: Vec::new(),
        }]);
        let dataset = vec![opp("Ana", OpportunityStatus::Won, 100.0)];
        let err = run_chat(&model, &dataset, reference(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::EmptyResponse));
    }

    #[tokio::test]
    async fn report_prompt_carries_the_profile_json() {
        let model = ScriptedModel::new(vec![answer("# Report")]);
        let dataset = vec![opp("Ana", OpportunityStatus::Won, 100.0)];
        let profile = build_profile(aggregate(&dataset).unwrap());
        let report = generate_report(&model, &profile).await.unwrap();
        assert_eq!(report, "# Report");

        let conversations = model.conversations.lock().unwrap();
        let user_msg = conversations[0]
            .iter()
            .find(|m| m.role == ChatRole::User)
            .expect("user message");
        assert!(user_msg.content.as_deref().unwrap().contains("\"summary\""));
        assert!(user_msg.content.as_deref().unwrap().contains("\"won_revenue\""));
    }

    #[test]
    fn driver_debug_never_prints_the_key() {
        let driver = OpenAiChatDriver::new(
            Some("sk-secret-value".to_string()),
            DEFAULT_MODEL.to_string(),
            DEFAULT_BASE_URL.to_string(),
        )
        .unwrap();
        let printed = format!("{driver:?}");
        assert!(!printed.contains("sk-secret-value"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn query_tool_schema_requires_group_by() {
        let tool = dataset_query_tool();
        assert_eq!(tool.name, DATASET_QUERY_TOOL);
        assert_eq!(tool.parameters["required"][0], "group_by");
        let dims = tool.parameters["properties"]["group_by"]["items"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(dims.len(), GroupDimension::NAMES.len());
    }

    #[test]
    fn wire_shapes_follow_the_chat_completions_format() {
        let assistant = ChatMessage::assistant(
            None,
            vec![tool_call(r#"{"group_by":["seller"]}"#)],
        );
        let wire = wire_message(&assistant);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], DATASET_QUERY_TOOL);

        let tool_result = ChatMessage::tool("call-1", "{}");
        let wire = wire_message(&tool_result);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call-1");

        let advertised = wire_tool(&dataset_query_tool());
        assert_eq!(advertised["type"], "function");
        assert_eq!(advertised["function"]["name"], DATASET_QUERY_TOOL);
    }

    #[test]
    fn turn_parsing_reads_content_and_tool_calls() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-9",
                        "type": "function",
                        "function": { "name": "dataset_query", "arguments": "{\"group_by\":[\"month\"]}" }
                    }]
                }
            }]
        });
        let turn = parse_turn(&body).unwrap();
        assert_eq!(turn.content, None);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "call-9");
        assert_eq!(turn.tool_calls[0].arguments, "{\"group_by\":[\"month\"]}");

        assert!(parse_turn(&serde_json::json!({"choices": []})).is_err());
    }
}
