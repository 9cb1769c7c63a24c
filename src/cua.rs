use crate::action::{Action, ActionVocabulary, Proposed, SafetyCheck};
use crate::conversation::{Conversation, Message};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ModelError {
    /// Network, timeout, auth or non-success status.
    #[error("transport error: {0}")]
    Transport(String),
    /// The body arrived but does not fit the response contract.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// What the model wants to do next.
#[derive(Clone, Debug, Default)]
pub struct Proposal {
    pub actions: Vec<Proposed>,
    pub safety_checks: Vec<SafetyCheck>,
    pub free_text: Option<String>,
    pub response_id: Option<String>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn propose(
        &self,
        conversation: &Conversation,
        vocabulary: &ActionVocabulary,
    ) -> Result<Proposal, ModelError>;

    /// Model name written into the session record.
    fn model_name(&self) -> &str {
        "unknown"
    }
}

// ========================= Responses API client =========================

#[derive(Clone, Debug)]
pub struct ResponsesConfig {
    pub api_base: String,   // e.g. "https://api.openai.com/v1"
    pub api_key: String,    // env OPENAI_API_KEY
    pub model: String,      // e.g. "gpt-5"
    pub timeout: Duration,
    /// Only this many of the newest screenshots are sent; `None` sends all.
    pub max_images: Option<usize>,
    pub max_output_tokens: u32,
}

impl Default for ResponsesConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-5".into()),
            timeout: Duration::from_secs(45),
            max_images: Some(3),
            max_output_tokens: 4096,
        }
    }
}

impl ResponsesConfig {
    /// Missing or invalid settings, empty when usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.api_base.trim().is_empty() {
            errors.push("OPENAI_BASE_URL is not set".to_string());
        }
        if self.api_key.trim().is_empty() {
            errors.push("OPENAI_API_KEY is not set".to_string());
        }
        if self.model.trim().is_empty() {
            errors.push("OPENAI_MODEL is not set".to_string());
        }
        errors
    }
}

#[derive(Clone)]
pub struct ResponsesClient {
    http: Client,
    cfg: ResponsesConfig,
}

impl ResponsesClient {
    pub fn new(cfg: ResponsesConfig) -> Result<Self, ModelError> {
        let problems = cfg.validate();
        if !problems.is_empty() {
            return Err(ModelError::Config(problems.join(", ")));
        }
        let http = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| ModelError::Config(e.to_string()))?;
        info!("responses client ready: {} ({})", cfg.api_base.trim_end_matches('/'), cfg.model);
        Ok(Self { http, cfg })
    }

    fn build_request(&self, conversation: &Conversation, vocabulary: &ActionVocabulary) -> Value {
        json!({
            "model": self.cfg.model,
            "input": render_input(conversation, self.cfg.max_images),
            "tools": vocabulary.to_tools(),
            "tool_choice": "auto",
            "truncation": "auto",
            "max_output_tokens": self.cfg.max_output_tokens,
        })
    }
}

#[async_trait]
impl ModelClient for ResponsesClient {
    async fn propose(
        &self,
        conversation: &Conversation,
        vocabulary: &ActionVocabulary,
    ) -> Result<Proposal, ModelError> {
        let url = format!("{}/responses", self.cfg.api_base.trim_end_matches('/'));
        let req = self.build_request(conversation, vocabulary);
        debug!(messages = conversation.len(), "sending responses request");

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ModelError::Transport(format!("model API error {}: {}", status, text)));
        }
        parse_response(&text, vocabulary)
    }

    fn model_name(&self) -> &str {
        &self.cfg.model
    }
}

// ========================= Wire format =========================

/// Render the conversation as Responses API input items. Screenshots older
/// than the newest `max_images` are replaced by a text placeholder.
pub fn render_input(conversation: &Conversation, max_images: Option<usize>) -> Vec<Value> {
    let total_images = conversation.image_count();
    let skip_images = max_images.map_or(0, |keep| total_images.saturating_sub(keep));
    let mut seen_images = 0usize;

    conversation
        .messages()
        .iter()
        .map(|m| match m {
            Message::System { text } => json!({ "role": "system", "content": text }),
            Message::User { text, image } => {
                let mut content = vec![json!({ "type": "input_text", "text": text })];
                if let Some(att) = image {
                    seen_images += 1;
                    if seen_images > skip_images {
                        content.push(json!({ "type": "input_image", "image_url": att.image.data_url() }));
                    } else {
                        content.push(json!({ "type": "input_text", "text": "[earlier screenshot omitted]" }));
                    }
                }
                json!({ "role": "user", "content": content })
            }
            Message::Assistant { text } => json!({ "role": "assistant", "content": text }),
            Message::ToolCall { call_id, name, arguments } => json!({
                "type": "function_call",
                "call_id": call_id,
                "name": name,
                "arguments": arguments.to_string(),
            }),
            Message::ToolResult { call_id, output, acknowledged_safety_checks } => {
                let mut output = output.clone();
                if !acknowledged_safety_checks.is_empty() {
                    output.push_str("\nAcknowledged safety checks:");
                    for c in acknowledged_safety_checks {
                        output.push_str("\n- ");
                        output.push_str(&c.to_string());
                    }
                }
                json!({ "type": "function_call_output", "call_id": call_id, "output": output })
            }
        })
        .collect()
}

#[derive(Deserialize)]
struct ResponseBody {
    id: Option<String>,
    output: Vec<OutputItem>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
        #[serde(default)]
        pending_safety_checks: Vec<WireSafetyCheck>,
    },
    Message {
        #[serde(default)]
        content: Vec<ContentPart>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    OutputText { text: String },
    Refusal { refusal: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireSafetyCheck {
    id: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Decode a Responses API body into a proposal. Anything off-contract is a
/// protocol error; a call naming an action outside the vocabulary is kept
/// as `Proposed::Unknown`.
pub fn parse_response(body: &str, vocabulary: &ActionVocabulary) -> Result<Proposal, ModelError> {
    let body: ResponseBody = serde_json::from_str(body)
        .map_err(|e| ModelError::Protocol(format!("failed to parse response JSON: {}", e)))?;
    if let Some(err) = body.error.filter(|e| !e.is_null()) {
        return Err(ModelError::Protocol(format!("response carries error: {}", err)));
    }

    let mut proposal = Proposal { response_id: body.id, ..Default::default() };
    let mut texts: Vec<String> = Vec::new();

    for item in body.output {
        match item {
            OutputItem::FunctionCall { call_id, name, arguments, pending_safety_checks } => {
                let args: Value = if arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&arguments).map_err(|e| {
                        ModelError::Protocol(format!("arguments for {} are not JSON: {}", name, e))
                    })?
                };
                let decoded = if vocabulary.contains(&name) {
                    Action::from_tool_call(&name, &args)
                        .map_err(|e| ModelError::Protocol(format!("invalid arguments for {}: {}", name, e)))?
                } else {
                    None
                };
                proposal.actions.push(match decoded {
                    Some(action) => Proposed::Known { call_id, action },
                    None => Proposed::Unknown { call_id, kind: name, arguments: args },
                });
                proposal.safety_checks.extend(pending_safety_checks.into_iter().map(|c| SafetyCheck {
                    code: c.code.unwrap_or_else(|| "unspecified".into()),
                    message: c.message.unwrap_or_default(),
                    id: c.id,
                }));
            }
            OutputItem::Message { content } => {
                for part in content {
                    match part {
                        ContentPart::OutputText { text } => texts.push(text),
                        ContentPart::Refusal { refusal } => texts.push(refusal),
                        ContentPart::Other => {}
                    }
                }
            }
            OutputItem::Other => {}
        }
    }

    let text = texts.join("\n");
    if !text.trim().is_empty() {
        proposal.free_text = Some(text);
    }
    Ok(proposal)
}
